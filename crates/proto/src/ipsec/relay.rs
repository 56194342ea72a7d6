//! NAS-over-TCP relay
//!
//! After IKE_AUTH completes on NWu, NAS signaling moves to a TCP session
//! from the UE's inner IP address to the N3IWF's NAS address, carried by
//! the signaling child SA. Every NAS PDU is prefixed with its length as a
//! 2-byte big-endian integer in both directions (TS 24.502 Section 9.4).
//!
//! The relay owns the TCP stream. PDUs read from the stream go to the
//! exchange driver as [`ControlMessage::Nas`]; PDUs the driver sends back
//! are written to the stream. [`ControlMessage::NasTerminate`] closes it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ipsec::{
    channel::{self, ControlMessage, ControlReceiver, ControlSender, SaTarget},
    Error, Result,
};

/// Time allowed for the TCP handshake with the NAS endpoint
pub const NAS_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const LENGTH_PREFIX: usize = 2;

/// Prefix a NAS PDU with its 2-byte length
pub fn encode_frame(pdu: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(pdu.len()).map_err(|_| Error::MessageTooLarge(pdu.len() as u32))?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + pdu.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(pdu);
    Ok(frame)
}

/// Remove one complete frame from the front of `buf`
///
/// Returns `None` until the whole PDU has been buffered.
pub fn take_frame(buf: &mut BytesMut) -> Option<Vec<u8>> {
    if buf.len() < LENGTH_PREFIX {
        return None;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < LENGTH_PREFIX + len {
        return None;
    }
    buf.advance(LENGTH_PREFIX);
    Some(buf.split_to(len).to_vec())
}

/// Write one length-prefixed PDU
pub async fn write_frame<W>(writer: &mut W, pdu: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(pdu)?).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed PDU
///
/// Not cancel safe; the relay loop uses [`take_frame`] over a buffer instead.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    reader.read_exact(&mut prefix).await?;
    let mut pdu = vec![0u8; u16::from_be_bytes(prefix) as usize];
    reader.read_exact(&mut pdu).await?;
    Ok(pdu)
}

/// Connect to the NAS endpoint from the tunnel address
pub async fn connect(tunnel_address: Ipv4Addr, nas: SocketAddr) -> Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::new(IpAddr::V4(tunnel_address), 0))?;
    let stream = tokio::time::timeout(NAS_CONNECT_TIMEOUT, socket.connect(nas)).await??;
    stream.set_nodelay(true)?;
    info!(
        local = %tunnel_address,
        nas = %nas,
        "NAS TCP session established"
    );
    Ok(stream)
}

/// Relay task between a NAS TCP stream and the exchange driver
pub struct NasRelay<S> {
    stream: S,
    control: ControlReceiver,
    to_driver: ControlSender,
}

impl<S> NasRelay<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a relay over an established stream
    pub fn new(stream: S, control: ControlReceiver, to_driver: ControlSender) -> Self {
        NasRelay {
            stream,
            control,
            to_driver,
        }
    }

    /// Spawn the relay; the returned sender carries PDUs to the network
    pub fn spawn(stream: S, to_driver: ControlSender) -> (ControlSender, JoinHandle<Result<()>>) {
        let (tx, rx) = channel::control_channel();
        let relay = NasRelay::new(stream, rx, to_driver);
        (tx, tokio::spawn(relay.run()))
    }

    /// Run until terminated or the peer closes the stream
    pub async fn run(mut self) -> Result<()> {
        let mut inbound = BytesMut::with_capacity(4096);

        loop {
            tokio::select! {
                biased;

                message = self.control.recv() => {
                    match message {
                        Some(ControlMessage::Nas(pdu)) => {
                            crate::ipsec::logging::log_message_send("NAS", "tcp", pdu.len());
                            write_frame(&mut self.stream, &pdu).await?;
                        }
                        Some(ControlMessage::NasTerminate)
                        | Some(ControlMessage::DeleteSa(SaTarget::Signaling))
                        | None => {
                            debug!("NAS relay terminating");
                            self.stream.shutdown().await.ok();
                            return Ok(());
                        }
                        Some(other) => {
                            debug!(message = other.name(), "NAS relay ignoring control message");
                        }
                    }
                }

                read = self.stream.read_buf(&mut inbound) => {
                    if read? == 0 {
                        debug!("NAS peer closed the TCP session");
                        channel::send(&self.to_driver, ControlMessage::NasTerminate).await?;
                        return Ok(());
                    }
                    while let Some(pdu) = take_frame(&mut inbound) {
                        crate::ipsec::logging::log_message_recv("NAS", "tcp", pdu.len());
                        channel::send(&self.to_driver, ControlMessage::Nas(pdu)).await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_take_frame_partial() {
        let mut buf = BytesMut::from(&[0x00, 0x03, 0x7e][..]);
        assert_eq!(take_frame(&mut buf), None);
        buf.extend_from_slice(&[0x00, 0x41, 0x00, 0x01, 0xaa]);
        assert_eq!(take_frame(&mut buf), Some(vec![0x7e, 0x00, 0x41]));
        assert_eq!(take_frame(&mut buf), Some(vec![0xaa]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_frame_limits() {
        assert_eq!(encode_frame(&[1, 2]).unwrap(), vec![0, 2, 1, 2]);
        assert!(matches!(
            encode_frame(&vec![0u8; 70000]),
            Err(Error::MessageTooLarge(70000))
        ));
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = connect(Ipv4Addr::LOCALHOST, addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let (to_driver, mut from_relay) = channel::control_channel();
        let (relay_tx, task) = NasRelay::spawn(client, to_driver);

        // network to driver, split across writes
        let frame = encode_frame(&[0x7e, 0x00, 0x42, 0x01]).unwrap();
        server.write_all(&frame[..3]).await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.write_all(&frame[3..]).await.unwrap();
        assert_eq!(
            from_relay.recv().await,
            Some(ControlMessage::Nas(vec![0x7e, 0x00, 0x42, 0x01]))
        );

        // driver to network
        channel::send(&relay_tx, ControlMessage::Nas(vec![0x7e, 0x00, 0x43]))
            .await
            .unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), vec![0x7e, 0x00, 0x43]);

        channel::send(&relay_tx, ControlMessage::NasTerminate).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_reports_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = connect(Ipv4Addr::LOCALHOST, addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (to_driver, mut from_relay) = channel::control_channel();
        let (_relay_tx, task) = NasRelay::spawn(client, to_driver);
        drop(server);

        assert_eq!(from_relay.recv().await, Some(ControlMessage::NasTerminate));
        task.await.unwrap().unwrap();
    }
}
