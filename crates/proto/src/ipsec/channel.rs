//! Control channel between the exchange driver and the workers
//!
//! The exchange driver owns the IKE session and pushes SA changes to the
//! ESP forwarder and NAS relay; the workers hand IKE datagrams and NAS
//! messages back. Messages travel over tokio mpsc channels as
//! [`ControlMessage`] values.
//!
//! [`ControlFrame`] is the equivalent byte format for peers living in
//! another process:
//!
//! ```text
//! +--------+----------------+---------------------------------+
//! | Kind   | Length (2)     | IE, IE, ...                     |
//! +--------+----------------+---------------------------------+
//! IE = Tag (1) | Length (2) | Value
//! ```
//!
//! A one-byte value is always sent with length 1 and decodes to a scalar.

use std::net::Ipv4Addr;

use tokio::sync::mpsc;

use crate::ipsec::{
    crypto::{EncrAlgorithm, IntegAlgorithm, AEAD_SALT_LEN},
    esp::EspSa,
    Error, Result,
};

/// Default capacity of control channels
pub const CONTROL_CHANNEL_CAPACITY: usize = 64;

/// Message kinds of the byte format
pub mod kind {
    /// Install the signaling SA
    pub const CREATE_SA: u8 = 1;
    /// Replace the signaling SA
    pub const UPDATE_SA: u8 = 2;
    /// Remove all SAs and stop the worker
    pub const DELETE_SA: u8 = 3;
    /// IKE datagram passthrough
    pub const IKE: u8 = 4;
    /// NAS over TCP passthrough
    pub const TCP: u8 = 5;
    /// Install the user plane SA
    pub const CREATE_SA_USERPLANE: u8 = 6;
    /// Replace the user plane SA
    pub const UPDATE_SA_USERPLANE: u8 = 7;
    /// Remove the user plane SA
    pub const DELETE_SA_USERPLANE: u8 = 8;
}

/// Information element tags of the byte format
pub mod ie {
    /// Encryption transform ID
    pub const ENCR_ALG: u8 = 1;
    /// Integrity transform ID
    pub const INTEG_ALG: u8 = 2;
    /// Encryption key, salt included
    pub const ENCR_KEY: u8 = 3;
    /// Integrity key
    pub const INTEG_KEY: u8 = 4;
    /// SPI of the SA (4 bytes)
    pub const SPI: u8 = 5;
    /// IKE datagram
    pub const IKE_MESSAGE: u8 = 6;
    /// NAS message
    pub const TCP_MESSAGE: u8 = 7;
    /// NAS relay shutdown
    pub const TCP_TERMINATE: u8 = 8;
    /// QoS flow identifier
    pub const QFI: u8 = 9;
    /// N3IWF user plane address (4 bytes)
    pub const USERPLANE_IP_ADDRESS: u8 = 10;
    /// Local tunnel address (4 bytes)
    pub const TUNNEL_IP_ADDRESS: u8 = 11;
    /// SA epoch (8 bytes); absent means epoch 0
    pub const EPOCH: u8 = 12;
}

/// Value of an information element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IeValue {
    /// One-byte value
    Scalar(u8),
    /// Anything else
    Bytes(Vec<u8>),
}

impl IeValue {
    fn len(&self) -> usize {
        match self {
            IeValue::Scalar(_) => 1,
            IeValue::Bytes(b) => b.len(),
        }
    }

    /// Value as a scalar
    pub fn as_u8(&self) -> Option<u8> {
        match self {
            IeValue::Scalar(v) => Some(*v),
            IeValue::Bytes(b) if b.len() == 1 => Some(b[0]),
            IeValue::Bytes(_) => None,
        }
    }

    /// Value as bytes
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            IeValue::Scalar(v) => vec![*v],
            IeValue::Bytes(b) => b.clone(),
        }
    }
}

/// Control message in byte form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    /// Message kind
    pub kind: u8,
    /// Information elements in order
    pub ies: Vec<(u8, IeValue)>,
}

impl ControlFrame {
    /// Create an empty frame
    pub fn new(kind: u8) -> Self {
        ControlFrame {
            kind,
            ies: Vec::new(),
        }
    }

    /// Append an IE
    pub fn with(mut self, tag: u8, value: IeValue) -> Self {
        self.ies.push((tag, value));
        self
    }

    /// First IE with `tag`
    pub fn get(&self, tag: u8) -> Option<&IeValue> {
        self.ies.iter().find(|(t, _)| *t == tag).map(|(_, v)| v)
    }

    /// Serialize
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for (tag, value) in &self.ies {
            let len = u16::try_from(value.len()).map_err(|_| Error::InvalidLength {
                expected: u16::MAX as usize,
                actual: value.len(),
            })?;
            body.push(*tag);
            body.extend_from_slice(&len.to_be_bytes());
            match value {
                IeValue::Scalar(v) => body.push(*v),
                IeValue::Bytes(b) => body.extend_from_slice(b),
            }
        }
        let total = u16::try_from(body.len()).map_err(|_| Error::InvalidLength {
            expected: u16::MAX as usize,
            actual: body.len(),
        })?;

        let mut out = Vec::with_capacity(3 + body.len());
        out.push(self.kind);
        out.extend_from_slice(&total.to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse
    ///
    /// # Errors
    ///
    /// `BufferTooShort` when the header or an IE is truncated.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(Error::BufferTooShort {
                required: 3,
                available: data.len(),
            });
        }
        let kind = data[0];
        let total = u16::from_be_bytes([data[1], data[2]]) as usize;
        if data.len() < 3 + total {
            return Err(Error::BufferTooShort {
                required: 3 + total,
                available: data.len(),
            });
        }

        let body = &data[3..3 + total];
        let mut ies = Vec::new();
        let mut pos = 0;
        while pos < body.len() {
            if body.len() - pos < 3 {
                return Err(Error::BufferTooShort {
                    required: 3,
                    available: body.len() - pos,
                });
            }
            let tag = body[pos];
            let len = u16::from_be_bytes([body[pos + 1], body[pos + 2]]) as usize;
            let start = pos + 3;
            if body.len() - start < len {
                return Err(Error::BufferTooShort {
                    required: len,
                    available: body.len() - start,
                });
            }
            let value = if len == 1 {
                IeValue::Scalar(body[start])
            } else {
                IeValue::Bytes(body[start..start + len].to_vec())
            };
            ies.push((tag, value));
            pos = start + len;
        }

        Ok(ControlFrame { kind, ies })
    }
}

/// Which SA slot a message addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaTarget {
    /// Signaling SA
    Signaling,
    /// User plane SA
    UserPlane,
}

/// User plane parameters for GRE encapsulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPlaneParams {
    /// QoS flow identifier
    pub qfi: u8,
    /// N3IWF user plane address, outer GRE destination
    pub up_address: Ipv4Addr,
    /// Local tunnel address, outer GRE source
    pub tunnel_address: Ipv4Addr,
}

/// One direction of an SA handed to a worker
#[derive(Debug, Clone, PartialEq)]
pub struct SaInstall {
    /// Monotonic epoch assigned by the exchange driver
    pub epoch: u64,
    /// SA for the worker's direction
    pub sa: EspSa,
    /// Present for the user plane SA
    pub user_plane: Option<UserPlaneParams>,
}

impl SaInstall {
    /// Slot addressed by this SA
    pub fn target(&self) -> SaTarget {
        if self.user_plane.is_some() {
            SaTarget::UserPlane
        } else {
            SaTarget::Signaling
        }
    }
}

/// Message exchanged between the exchange driver and the workers
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Install an SA
    CreateSa(SaInstall),
    /// Replace an SA
    UpdateSa(SaInstall),
    /// Remove an SA; for the signaling SA the worker stops
    DeleteSa(SaTarget),
    /// IKE datagram received on the ESP socket
    Ike(Vec<u8>),
    /// NAS message for or from the relay
    Nas(Vec<u8>),
    /// NAS relay connection closed, or must close
    NasTerminate,
}

impl ControlMessage {
    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::CreateSa(_) => "create_sa",
            ControlMessage::UpdateSa(_) => "update_sa",
            ControlMessage::DeleteSa(_) => "delete_sa",
            ControlMessage::Ike(_) => "ike",
            ControlMessage::Nas(_) => "nas",
            ControlMessage::NasTerminate => "nas_terminate",
        }
    }

    /// Convert to the byte format
    pub fn to_frame(&self) -> ControlFrame {
        match self {
            ControlMessage::CreateSa(install) | ControlMessage::UpdateSa(install) => {
                let create = matches!(self, ControlMessage::CreateSa(_));
                let frame_kind = match (create, install.target()) {
                    (true, SaTarget::Signaling) => kind::CREATE_SA,
                    (false, SaTarget::Signaling) => kind::UPDATE_SA,
                    (true, SaTarget::UserPlane) => kind::CREATE_SA_USERPLANE,
                    (false, SaTarget::UserPlane) => kind::UPDATE_SA_USERPLANE,
                };
                let sa = &install.sa;
                let mut frame = ControlFrame::new(frame_kind)
                    .with(ie::ENCR_ALG, IeValue::Scalar(sa.encr().transform_id() as u8))
                    .with(ie::ENCR_KEY, IeValue::Bytes(sa.encr_key().to_vec()))
                    .with(ie::INTEG_ALG, IeValue::Scalar(sa.integ().transform_id() as u8))
                    .with(ie::INTEG_KEY, IeValue::Bytes(sa.integ_key().to_vec()))
                    .with(ie::SPI, IeValue::Bytes(sa.spi.to_be_bytes().to_vec()));
                if let Some(up) = install.user_plane {
                    frame = frame
                        .with(ie::QFI, IeValue::Scalar(up.qfi))
                        .with(
                            ie::USERPLANE_IP_ADDRESS,
                            IeValue::Bytes(up.up_address.octets().to_vec()),
                        )
                        .with(
                            ie::TUNNEL_IP_ADDRESS,
                            IeValue::Bytes(up.tunnel_address.octets().to_vec()),
                        );
                }
                frame.with(ie::EPOCH, IeValue::Bytes(install.epoch.to_be_bytes().to_vec()))
            }
            ControlMessage::DeleteSa(SaTarget::Signaling) => ControlFrame::new(kind::DELETE_SA),
            ControlMessage::DeleteSa(SaTarget::UserPlane) => {
                ControlFrame::new(kind::DELETE_SA_USERPLANE)
            }
            ControlMessage::Ike(data) => {
                ControlFrame::new(kind::IKE).with(ie::IKE_MESSAGE, IeValue::Bytes(data.clone()))
            }
            ControlMessage::Nas(data) => {
                ControlFrame::new(kind::TCP).with(ie::TCP_MESSAGE, IeValue::Bytes(data.clone()))
            }
            ControlMessage::NasTerminate => {
                ControlFrame::new(kind::TCP).with(ie::TCP_TERMINATE, IeValue::Bytes(Vec::new()))
            }
        }
    }

    /// Convert from the byte format
    ///
    /// # Errors
    ///
    /// `MandatoryInformationMissing` when an SA frame lacks an IE,
    /// `InvalidMessage` for unknown kinds.
    pub fn from_frame(frame: &ControlFrame) -> Result<Self> {
        match frame.kind {
            kind::CREATE_SA | kind::UPDATE_SA | kind::CREATE_SA_USERPLANE
            | kind::UPDATE_SA_USERPLANE => {
                let install = decode_install(frame)?;
                if matches!(frame.kind, kind::CREATE_SA | kind::CREATE_SA_USERPLANE) {
                    Ok(ControlMessage::CreateSa(install))
                } else {
                    Ok(ControlMessage::UpdateSa(install))
                }
            }
            kind::DELETE_SA => Ok(ControlMessage::DeleteSa(SaTarget::Signaling)),
            kind::DELETE_SA_USERPLANE => Ok(ControlMessage::DeleteSa(SaTarget::UserPlane)),
            kind::IKE => Ok(ControlMessage::Ike(required(frame, ie::IKE_MESSAGE)?.to_vec())),
            kind::TCP => match frame.ies.first() {
                Some((ie::TCP_MESSAGE, value)) => Ok(ControlMessage::Nas(value.to_vec())),
                Some((ie::TCP_TERMINATE, _)) => Ok(ControlMessage::NasTerminate),
                _ => Err(Error::MandatoryInformationMissing("TCP message IE".into())),
            },
            other => Err(Error::InvalidMessage(format!(
                "Unknown control message kind {}",
                other
            ))),
        }
    }

    /// Serialize to the byte format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.to_frame().to_bytes()
    }

    /// Parse from the byte format
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_frame(&ControlFrame::from_bytes(data)?)
    }
}

fn required(frame: &ControlFrame, tag: u8) -> Result<&IeValue> {
    frame
        .get(tag)
        .ok_or_else(|| Error::MandatoryInformationMissing(format!("control IE {}", tag)))
}

fn fixed<const N: usize>(frame: &ControlFrame, tag: u8) -> Result<[u8; N]> {
    let value = required(frame, tag)?.to_vec();
    value.as_slice().try_into().map_err(|_| Error::InvalidLength {
        expected: N,
        actual: value.len(),
    })
}

fn decode_install(frame: &ControlFrame) -> Result<SaInstall> {
    let scalar = |tag: u8| -> Result<u8> {
        required(frame, tag)?
            .as_u8()
            .ok_or_else(|| Error::InvalidPayload(format!("control IE {} is not a scalar", tag)))
    };

    let encr_key = required(frame, ie::ENCR_KEY)?.to_vec();
    let encr_id = scalar(ie::ENCR_ALG)? as u16;
    let encr = match encr_id {
        12 => EncrAlgorithm::from_transform(encr_id, Some((encr_key.len() * 8) as u16))?,
        18..=20 => EncrAlgorithm::from_transform(
            encr_id,
            Some((encr_key.len().saturating_sub(AEAD_SALT_LEN) * 8) as u16),
        )?,
        other => EncrAlgorithm::from_transform(other, None)?,
    };
    let integ = IntegAlgorithm::from_transform_id(scalar(ie::INTEG_ALG)? as u16)?;
    let integ_key = required(frame, ie::INTEG_KEY)?.to_vec();
    let spi = u32::from_be_bytes(fixed::<4>(frame, ie::SPI)?);
    let sa = EspSa::new(spi, encr, integ, encr_key, integ_key)?;

    let user_plane = if matches!(
        frame.kind,
        kind::CREATE_SA_USERPLANE | kind::UPDATE_SA_USERPLANE
    ) {
        Some(UserPlaneParams {
            qfi: scalar(ie::QFI)?,
            up_address: Ipv4Addr::from(fixed::<4>(frame, ie::USERPLANE_IP_ADDRESS)?),
            tunnel_address: Ipv4Addr::from(fixed::<4>(frame, ie::TUNNEL_IP_ADDRESS)?),
        })
    } else {
        None
    };

    let epoch = match frame.get(ie::EPOCH) {
        Some(_) => u64::from_be_bytes(fixed::<8>(frame, ie::EPOCH)?),
        None => 0,
    };

    Ok(SaInstall {
        epoch,
        sa,
        user_plane,
    })
}

/// Sending half of a control channel
pub type ControlSender = mpsc::Sender<ControlMessage>;

/// Receiving half of a control channel
pub type ControlReceiver = mpsc::Receiver<ControlMessage>;

/// Create a control channel with the default capacity
pub fn control_channel() -> (ControlSender, ControlReceiver) {
    mpsc::channel(CONTROL_CHANNEL_CAPACITY)
}

/// Send a message, mapping a closed channel to [`Error::ChannelClosed`]
pub async fn send(sender: &ControlSender, message: ControlMessage) -> Result<()> {
    sender.send(message).await.map_err(|_| Error::ChannelClosed)
}

/// Monotonic epoch source for SA installs
#[derive(Debug, Default)]
pub struct EpochCounter {
    last: u64,
}

impl EpochCounter {
    /// Create a counter; the first epoch handed out is 1
    pub fn new() -> Self {
        Self::default()
    }

    /// Next epoch
    pub fn next_epoch(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    /// Last epoch handed out
    pub fn current(&self) -> u64 {
        self.last
    }
}
