//! ESP forwarding engine
//!
//! Two workers move packets between the local packet devices and the peer:
//!
//! - **Uplink** reads plaintext packets from the signaling device (and the
//!   user plane device on NWu), wraps user plane packets in IPv4 + GRE,
//!   encapsulates them with the current outbound SA and sends them.
//! - **Downlink** receives datagrams, hands IKE messages (non-ESP marker)
//!   to the exchange driver, selects the inbound SA by SPI, decapsulates,
//!   reassembles fragmented user plane packets and strips GRE.
//!
//! Each worker owns its SAs and updates them only from its control
//! channel. Control messages are always polled before data, and every SA
//! install carries an epoch: packets for an SPI retired by a newer epoch
//! are dropped instead of being processed under replaced keys.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, BytesMut};
use n3ue_platform::{Collaborator, PacketDevice, PlatformError, PlatformResult};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ipsec::{
    channel::{self, ControlMessage, ControlReceiver, ControlSender, SaInstall, SaTarget, UserPlaneParams},
    child_sa::ChildSession,
    esp::{peek_spi, EspSa, NEXT_HEADER_IPV4, NEXT_HEADER_IPV6},
    ikev2::constants::NON_ESP_MARKER,
    logging, Error, Result,
};

/// IP protocol number of ESP
pub const ESP_PROTOCOL: u8 = 50;

/// IP protocol number of GRE
pub const GRE_PROTOCOL: u8 = 47;

/// Largest packet read from a device
pub const MAX_PACKET_SIZE: usize = 2048;

const RECV_BUFFER_SIZE: usize = 65535;
const IPV4_HEADER_LEN: usize = 20;
const GRE_FLAG_KEY: u8 = 0x20;
const RETIRED_SPIS: usize = 8;

/// How ESP reaches the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataPath {
    /// UDP encapsulation on the NAT-T port (RFC 3948)
    #[default]
    Udp,
    /// Plain ESP, IP protocol 50
    RawEsp,
}

/// Next header value for an inner IP packet, from its version nibble
pub fn inner_next_header(packet: &[u8]) -> u8 {
    match packet.first().map(|b| b >> 4) {
        Some(6) => NEXT_HEADER_IPV6,
        _ => NEXT_HEADER_IPV4,
    }
}

/// Internet checksum (RFC 1071)
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|c| u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)]) as u32)
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build a 20-byte IPv4 header with checksum
pub fn build_ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    payload_len: usize,
) -> [u8; IPV4_HEADER_LEN] {
    let total = (IPV4_HEADER_LEN + payload_len) as u16;
    let mut header = [0u8; IPV4_HEADER_LEN];
    header[0] = 0x45;
    header[2..4].copy_from_slice(&total.to_be_bytes());
    header[8] = 64;
    header[9] = protocol;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());
    let checksum = ipv4_checksum(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());
    header
}

/// Fields of an IPv4 header needed for GRE and reassembly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Info {
    /// Header length in bytes
    pub header_len: usize,
    /// Total length field
    pub total_len: usize,
    /// Identification field
    pub identification: u16,
    /// More fragments flag
    pub more_fragments: bool,
    /// Fragment offset in bytes
    pub fragment_offset: usize,
    /// Protocol field
    pub protocol: u8,
}

impl Ipv4Info {
    /// Parse the header of an IPv4 packet
    pub fn parse(packet: &[u8]) -> Result<Self> {
        if packet.len() < IPV4_HEADER_LEN {
            return Err(Error::BufferTooShort {
                required: IPV4_HEADER_LEN,
                available: packet.len(),
            });
        }
        if packet[0] >> 4 != 4 {
            return Err(Error::InvalidMessage(format!(
                "Not an IPv4 packet (version {})",
                packet[0] >> 4
            )));
        }
        let header_len = ((packet[0] & 0x0f) as usize) * 4;
        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        if header_len < IPV4_HEADER_LEN || header_len > packet.len() || total_len < header_len {
            return Err(Error::InvalidLength {
                expected: header_len,
                actual: packet.len(),
            });
        }
        Ok(Ipv4Info {
            header_len,
            total_len,
            identification: u16::from_be_bytes([packet[4], packet[5]]),
            more_fragments: packet[6] & 0x20 != 0,
            fragment_offset: ((((packet[6] & 0x1f) as usize) << 8) | packet[7] as usize) * 8,
            protocol: packet[9],
        })
    }

    /// Whether the packet is a fragment
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }

    /// Payload slice of `packet`
    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        let end = self.total_len.min(packet.len());
        &packet[self.header_len..end]
    }
}

/// Wrap an inner packet in IPv4 + GRE for the NWu user plane
///
/// The GRE key field carries the QFI; RQI is never set on uplink packets.
pub fn gre_encapsulate(inner: &[u8], params: &UserPlaneParams) -> Vec<u8> {
    let protocol_type: u16 = match inner.first().map(|b| b >> 4) {
        Some(6) => 0x86dd,
        _ => 0x0800,
    };
    let gre_len = 8;
    let mut out = BytesMut::with_capacity(IPV4_HEADER_LEN + gre_len + inner.len());
    out.put_slice(&build_ipv4_header(
        params.tunnel_address,
        params.up_address,
        GRE_PROTOCOL,
        gre_len + inner.len(),
    ));
    out.put_u8(GRE_FLAG_KEY);
    out.put_u8(0);
    out.put_u16(protocol_type);
    out.put_u8(params.qfi & 0x3f);
    out.put_slice(&[0, 0, 0]);
    out.put_slice(inner);
    out.to_vec()
}

/// Strip the GRE header, returning the inner packet
pub fn gre_strip(gre: &[u8]) -> Result<&[u8]> {
    let header_len = match gre.first() {
        Some(flags) if flags & GRE_FLAG_KEY != 0 => 8,
        Some(_) => 4,
        None => 0,
    };
    if header_len == 0 || gre.len() < header_len {
        return Err(Error::BufferTooShort {
            required: header_len.max(4),
            available: gre.len(),
        });
    }
    Ok(&gre[header_len..])
}

/// Bounds of the fragment reassembly table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReassemblyLimits {
    /// Incomplete fragment sets older than this are dropped
    pub max_age: Duration,
    /// Maximum number of incomplete fragment sets
    pub max_entries: usize,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        ReassemblyLimits {
            max_age: Duration::from_secs(5),
            max_entries: 64,
        }
    }
}

#[derive(Debug)]
struct FragmentSet {
    fragments: BTreeMap<usize, Vec<u8>>,
    total_len: Option<usize>,
    first_seen: Instant,
}

impl FragmentSet {
    fn assemble(&self) -> Option<Vec<u8>> {
        let total = self.total_len?;
        let mut out = Vec::with_capacity(total);
        for (&offset, data) in &self.fragments {
            if offset > out.len() {
                return None;
            }
            let skip = out.len() - offset;
            if skip < data.len() {
                out.extend_from_slice(&data[skip..]);
            }
        }
        (out.len() >= total).then(|| {
            out.truncate(total);
            out
        })
    }
}

/// IPv4 reassembly keyed by the identification field
///
/// Unfragmented packets take a fast path until the first fragment is
/// seen; afterwards every packet is checked against the table.
#[derive(Debug)]
pub struct Reassembler {
    limits: ReassemblyLimits,
    entries: HashMap<u16, FragmentSet>,
    fragmentation_seen: bool,
}

impl Reassembler {
    /// Create an empty table
    pub fn new(limits: ReassemblyLimits) -> Self {
        Reassembler {
            limits,
            entries: HashMap::new(),
            fragmentation_seen: false,
        }
    }

    /// Number of incomplete fragment sets
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Whether any fragment has been received
    pub fn fragmentation_seen(&self) -> bool {
        self.fragmentation_seen
    }

    /// Feed an IPv4 packet
    ///
    /// Returns the IP payload once the datagram is complete.
    pub fn push(&mut self, packet: &[u8], now: Instant) -> Result<Option<Vec<u8>>> {
        let info = Ipv4Info::parse(packet)?;
        if !self.fragmentation_seen {
            if !info.is_fragment() {
                return Ok(Some(info.payload(packet).to_vec()));
            }
            debug!("IP fragmentation detected on user plane SA");
            self.fragmentation_seen = true;
        }
        if !info.is_fragment() {
            return Ok(Some(info.payload(packet).to_vec()));
        }

        if !self.entries.contains_key(&info.identification) {
            self.evict(now);
            if self.entries.len() >= self.limits.max_entries {
                self.evict_oldest();
            }
        }

        let entry = self
            .entries
            .entry(info.identification)
            .or_insert_with(|| FragmentSet {
                fragments: BTreeMap::new(),
                total_len: None,
                first_seen: now,
            });
        let payload = info.payload(packet);
        if !info.more_fragments {
            entry.total_len = Some(info.fragment_offset + payload.len());
        }
        entry.fragments.insert(info.fragment_offset, payload.to_vec());

        match entry.assemble() {
            Some(datagram) => {
                logging::log_reassembly(info.identification, entry.fragments.len(), datagram.len());
                self.entries.remove(&info.identification);
                Ok(Some(datagram))
            }
            None => Ok(None),
        }
    }

    /// Drop fragment sets older than the configured age
    pub fn evict(&mut self, now: Instant) -> usize {
        let max_age = self.limits.max_age;
        let before = self.entries.len();
        self.entries
            .retain(|_, set| now.saturating_duration_since(set.first_seen) <= max_age);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            logging::log_reassembly_evicted(evicted);
        }
        evicted
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, set)| set.first_seen)
            .map(|(id, _)| *id);
        if let Some(id) = oldest {
            self.entries.remove(&id);
            logging::log_reassembly_evicted(1);
        }
    }
}

/// Datagram received by the transport
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// ESP packet, starting at the SPI
    Esp(&'a [u8]),
    /// IKE message, marker removed
    Ike(&'a [u8]),
    /// Not from the peer, or empty
    Ignored,
}

/// Socket carrying ESP to and from the peer
#[derive(Debug)]
pub struct EspTransport {
    socket: UdpSocket,
    peer: SocketAddr,
    path: DataPath,
}

impl EspTransport {
    /// UDP-encapsulated ESP on a bound socket
    pub async fn udp(local: SocketAddr, peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        Ok(Self::from_udp_socket(socket, peer))
    }

    /// UDP-encapsulated ESP on an existing socket
    pub fn from_udp_socket(socket: UdpSocket, peer: SocketAddr) -> Self {
        EspTransport {
            socket,
            peer,
            path: DataPath::Udp,
        }
    }

    /// Plain ESP over a raw IPv4 socket
    ///
    /// Needs CAP_NET_RAW. Must be called inside a tokio runtime.
    pub fn raw_esp(local: Option<Ipv4Addr>, peer: Ipv4Addr) -> Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::RAW,
            Some(socket2::Protocol::from(ESP_PROTOCOL as i32)),
        )?;
        if let Some(local) = local {
            socket.bind(&SocketAddr::new(IpAddr::V4(local), 0).into())?;
        }
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(EspTransport {
            socket,
            peer: SocketAddr::new(IpAddr::V4(peer), 0),
            path: DataPath::RawEsp,
        })
    }

    /// Data path in use
    pub fn path(&self) -> DataPath {
        self.path
    }

    /// Local address of the socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send an ESP packet
    pub async fn send_esp(&self, packet: &[u8]) -> Result<()> {
        self.socket.send_to(packet, self.peer).await?;
        Ok(())
    }

    /// Send an IKE message on the NAT-T port, prefixed with the non-ESP marker
    pub async fn send_ike(&self, message: &[u8]) -> Result<()> {
        if self.path != DataPath::Udp {
            return Err(Error::InvalidState(
                "IKE passthrough needs the UDP data path".into(),
            ));
        }
        let mut datagram = Vec::with_capacity(NON_ESP_MARKER.len() + message.len());
        datagram.extend_from_slice(&NON_ESP_MARKER);
        datagram.extend_from_slice(message);
        self.socket.send_to(&datagram, self.peer).await?;
        Ok(())
    }

    /// Receive one datagram and classify it
    pub async fn recv<'a>(&self, buf: &'a mut [u8]) -> Result<Inbound<'a>> {
        let (len, from) = self.socket.recv_from(buf).await?;
        let data = &buf[..len];
        match self.path {
            DataPath::Udp => {
                if from != self.peer || data.len() < 4 {
                    return Ok(Inbound::Ignored);
                }
                if data[..4] == NON_ESP_MARKER {
                    return Ok(Inbound::Ike(&data[4..]));
                }
                Ok(Inbound::Esp(data))
            }
            DataPath::RawEsp => {
                if from.ip() != self.peer.ip() {
                    return Ok(Inbound::Ignored);
                }
                // raw sockets deliver the IP header
                let info = Ipv4Info::parse(data)?;
                Ok(Inbound::Esp(info.payload(data)))
            }
        }
    }
}

struct Slot {
    epoch: u64,
    sa: EspSa,
    user_plane: Option<UserPlaneParams>,
}

/// Result of applying a control message to an [`SaTable`]
#[derive(Debug, PartialEq)]
pub enum Applied {
    /// SA installed in a slot
    Installed(SaTarget),
    /// Install older than the slot's epoch, ignored
    Outdated,
    /// SA removed from a slot
    Removed(SaTarget),
    /// Worker must stop
    Stop,
    /// Not an SA message
    Passthrough(ControlMessage),
}

/// Result of looking up an inbound SPI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// SPI of an installed SA
    Active(SaTarget),
    /// SPI of an SA replaced at `epoch`
    Stale {
        /// Epoch of the retired SA
        epoch: u64,
    },
    /// Never seen
    Unknown,
}

/// SAs owned by one worker
#[derive(Default)]
pub struct SaTable {
    slots: HashMap<SaTarget, Slot>,
    retired: VecDeque<(u32, u64)>,
}

impl std::fmt::Debug for SaTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaTable")
            .field("slots", &self.slots.len())
            .field("retired", &self.retired.len())
            .finish()
    }
}

impl SaTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a control message
    pub fn apply(&mut self, message: ControlMessage) -> Applied {
        match message {
            ControlMessage::CreateSa(install) | ControlMessage::UpdateSa(install) => {
                self.install(install)
            }
            ControlMessage::DeleteSa(SaTarget::Signaling) => {
                self.slots.clear();
                Applied::Stop
            }
            ControlMessage::DeleteSa(target) => {
                if let Some(slot) = self.slots.remove(&target) {
                    logging::log_sa_update("delete", slot.sa.spi, slot.epoch);
                    self.retire(slot.sa.spi, slot.epoch);
                }
                Applied::Removed(target)
            }
            other => Applied::Passthrough(other),
        }
    }

    fn install(&mut self, install: SaInstall) -> Applied {
        let target = install.target();
        if let Some(current) = self.slots.get(&target) {
            if install.epoch < current.epoch {
                warn!(
                    spi = %format!("{:#010x}", install.sa.spi),
                    epoch = install.epoch,
                    current_epoch = current.epoch,
                    "Ignoring outdated SA install"
                );
                return Applied::Outdated;
            }
        }

        logging::log_sa_update("install", install.sa.spi, install.epoch);
        let replaced = self.slots.insert(
            target,
            Slot {
                epoch: install.epoch,
                sa: install.sa,
                user_plane: install.user_plane,
            },
        );
        if let Some(old) = replaced {
            let new_spi = self.slots.get(&target).map(|s| s.sa.spi);
            if new_spi != Some(old.sa.spi) {
                self.retire(old.sa.spi, old.epoch);
            }
        }
        Applied::Installed(target)
    }

    fn retire(&mut self, spi: u32, epoch: u64) {
        self.retired.push_back((spi, epoch));
        while self.retired.len() > RETIRED_SPIS {
            self.retired.pop_front();
        }
    }

    /// Classify an inbound SPI
    pub fn lookup(&self, spi: u32) -> Lookup {
        if let Some((target, _)) = self.slots.iter().find(|(_, slot)| slot.sa.spi == spi) {
            return Lookup::Active(*target);
        }
        match self.retired.iter().rev().find(|(s, _)| *s == spi) {
            Some((_, epoch)) => Lookup::Stale { epoch: *epoch },
            None => Lookup::Unknown,
        }
    }

    /// SA in a slot
    pub fn sa(&self, target: SaTarget) -> Option<&EspSa> {
        self.slots.get(&target).map(|s| &s.sa)
    }

    /// Mutable SA and user plane parameters of a slot
    pub fn sa_mut(&mut self, target: SaTarget) -> Option<(&mut EspSa, Option<UserPlaneParams>)> {
        self.slots
            .get_mut(&target)
            .map(|s| (&mut s.sa, s.user_plane))
    }

    /// Epoch of a slot
    pub fn epoch(&self, target: SaTarget) -> Option<u64> {
        self.slots.get(&target).map(|s| s.epoch)
    }

    /// Newest epoch across all slots
    pub fn current_epoch(&self) -> u64 {
        self.slots.values().map(|s| s.epoch).max().unwrap_or(0)
    }
}

async fn read_optional(
    device: &Option<Arc<dyn PacketDevice>>,
    buf: &mut [u8],
) -> PlatformResult<usize> {
    match device {
        Some(device) => device.read_packet(buf).await,
        None => std::future::pending().await,
    }
}

/// Uplink worker
pub struct Uplink {
    transport: Arc<EspTransport>,
    signaling: Arc<dyn PacketDevice>,
    user_plane: Option<Arc<dyn PacketDevice>>,
    control: ControlReceiver,
    table: SaTable,
}

impl Uplink {
    /// Create the worker
    pub fn new(
        transport: Arc<EspTransport>,
        signaling: Arc<dyn PacketDevice>,
        user_plane: Option<Arc<dyn PacketDevice>>,
        control: ControlReceiver,
    ) -> Self {
        Uplink {
            transport,
            signaling,
            user_plane,
            control,
            table: SaTable::new(),
        }
    }

    async fn send(&mut self, target: SaTarget, packet: &[u8]) -> Result<()> {
        let Some((sa, user_plane)) = self.table.sa_mut(target) else {
            debug!(?target, len = packet.len(), "No SA installed, dropping packet");
            return Ok(());
        };
        let encrypted = match user_plane {
            Some(params) => sa.encapsulate(&gre_encapsulate(packet, &params), NEXT_HEADER_IPV4)?,
            None => sa.encapsulate(packet, inner_next_header(packet))?,
        };
        self.transport.send_esp(&encrypted).await
    }

    /// Run until the control channel closes or the signaling SA is deleted
    pub async fn run(mut self) -> Result<()> {
        let mut signaling_buf = vec![0u8; MAX_PACKET_SIZE];
        let mut user_plane_buf = vec![0u8; MAX_PACKET_SIZE];
        let signaling = self.signaling.clone();
        let user_plane = self.user_plane.clone();

        loop {
            tokio::select! {
                biased;

                message = self.control.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    match self.table.apply(message) {
                        Applied::Stop => return Ok(()),
                        Applied::Passthrough(ControlMessage::Ike(data)) => {
                            if let Err(e) = self.transport.send_ike(&data).await {
                                logging::log_error("uplink IKE passthrough", &e.to_string());
                            }
                        }
                        Applied::Passthrough(other) => {
                            debug!(message = other.name(), "Uplink ignoring control message");
                        }
                        _ => {}
                    }
                }

                read = signaling.read_packet(&mut signaling_buf) => {
                    let len = read?;
                    if let Err(e) = self.send(SaTarget::Signaling, &signaling_buf[..len]).await {
                        logging::log_error("uplink signaling", &e.to_string());
                    }
                }

                read = read_optional(&user_plane, &mut user_plane_buf) => {
                    let len = read?;
                    if let Err(e) = self.send(SaTarget::UserPlane, &user_plane_buf[..len]).await {
                        logging::log_error("uplink user plane", &e.to_string());
                    }
                }
            }
        }
    }
}

/// Downlink worker
pub struct Downlink {
    transport: Arc<EspTransport>,
    signaling: Arc<dyn PacketDevice>,
    user_plane: Option<Arc<dyn PacketDevice>>,
    control: ControlReceiver,
    to_driver: ControlSender,
    table: SaTable,
    reassembler: Reassembler,
}

impl Downlink {
    /// Create the worker
    pub fn new(
        transport: Arc<EspTransport>,
        signaling: Arc<dyn PacketDevice>,
        user_plane: Option<Arc<dyn PacketDevice>>,
        control: ControlReceiver,
        to_driver: ControlSender,
        limits: ReassemblyLimits,
    ) -> Self {
        Downlink {
            transport,
            signaling,
            user_plane,
            control,
            to_driver,
            table: SaTable::new(),
            reassembler: Reassembler::new(limits),
        }
    }

    async fn handle_esp(&mut self, packet: &[u8]) -> Result<()> {
        let Some(spi) = peek_spi(packet) else {
            return Ok(());
        };
        match self.table.lookup(spi) {
            Lookup::Active(SaTarget::Signaling) => {
                let Some(sa) = self.table.sa(SaTarget::Signaling) else {
                    return Ok(());
                };
                let (plain, _) = sa.decapsulate(packet)?;
                self.signaling.write_packet(&plain).await?;
            }
            Lookup::Active(SaTarget::UserPlane) => {
                let Some(sa) = self.table.sa(SaTarget::UserPlane) else {
                    return Ok(());
                };
                let (plain, _) = sa.decapsulate(packet)?;
                let info = Ipv4Info::parse(&plain)?;
                if info.protocol != GRE_PROTOCOL {
                    debug!(protocol = info.protocol, "Ignoring non-GRE user plane packet");
                    return Ok(());
                }
                if let Some(gre) = self.reassembler.push(&plain, Instant::now())? {
                    let inner = gre_strip(&gre)?;
                    if let Some(device) = &self.user_plane {
                        device.write_packet(inner).await?;
                    }
                }
            }
            Lookup::Stale { epoch } => {
                logging::log_stale_packet(spi, epoch, self.table.current_epoch());
            }
            Lookup::Unknown => {
                debug!(spi = %format!("{:#010x}", spi), "ESP packet for unknown SPI");
            }
        }
        Ok(())
    }

    /// Run until the control channel closes or the signaling SA is deleted
    pub async fn run(mut self) -> Result<()> {
        let transport = self.transport.clone();
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut sweep = tokio::time::interval(self.reassembler.limits.max_age);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                message = self.control.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    match self.table.apply(message) {
                        Applied::Stop => return Ok(()),
                        Applied::Passthrough(other) => {
                            debug!(message = other.name(), "Downlink ignoring control message");
                        }
                        _ => {}
                    }
                }

                received = transport.recv(&mut buf) => {
                    match received {
                        Ok(Inbound::Ike(message)) => {
                            channel::send(&self.to_driver, ControlMessage::Ike(message.to_vec())).await?;
                        }
                        Ok(Inbound::Esp(packet)) => {
                            let packet = packet.to_vec();
                            if let Err(e) = self.handle_esp(&packet).await {
                                warn!(error = %e, "Dropping inbound ESP packet");
                            }
                        }
                        Ok(Inbound::Ignored) => {}
                        Err(e) => warn!(error = %e, "Dropping inbound datagram"),
                    }
                }

                _ = sweep.tick() => {
                    self.reassembler.evict(Instant::now());
                }
            }
        }
    }
}

/// Collaborators of the forwarding engine
pub struct Forwarder {
    transport: Arc<EspTransport>,
    signaling: Arc<dyn PacketDevice>,
    user_plane: Option<Arc<dyn PacketDevice>>,
    limits: ReassemblyLimits,
}

impl Forwarder {
    /// Create the engine
    pub fn new(
        transport: EspTransport,
        signaling: Arc<dyn PacketDevice>,
        user_plane: Option<Arc<dyn PacketDevice>>,
        limits: ReassemblyLimits,
    ) -> Self {
        Forwarder {
            transport: Arc::new(transport),
            signaling,
            user_plane,
            limits,
        }
    }

    /// Spawn both workers
    ///
    /// IKE messages arriving on the ESP socket are delivered to `to_driver`.
    pub fn spawn(self, to_driver: ControlSender) -> ForwarderHandle {
        let (uplink_tx, uplink_rx) = channel::control_channel();
        let (downlink_tx, downlink_rx) = channel::control_channel();

        let uplink = Uplink::new(
            self.transport.clone(),
            self.signaling.clone(),
            self.user_plane.clone(),
            uplink_rx,
        );
        let downlink = Downlink::new(
            self.transport,
            self.signaling,
            self.user_plane,
            downlink_rx,
            to_driver,
            self.limits,
        );

        ForwarderHandle {
            uplink: uplink_tx,
            downlink: downlink_tx,
            uplink_task: tokio::spawn(uplink.run()),
            downlink_task: tokio::spawn(downlink.run()),
        }
    }
}

/// Control side of a running forwarder
#[derive(Debug)]
pub struct ForwarderHandle {
    uplink: ControlSender,
    downlink: ControlSender,
    uplink_task: JoinHandle<Result<()>>,
    downlink_task: JoinHandle<Result<()>>,
}

impl ForwarderHandle {
    /// Push a child session to both workers
    ///
    /// The downlink receives the inbound SA, the uplink the outbound SA.
    pub async fn install_child(
        &self,
        child: &ChildSession,
        epoch: u64,
        user_plane: Option<UserPlaneParams>,
        update: bool,
    ) -> Result<()> {
        let wrap = |sa: EspSa| {
            let install = SaInstall {
                epoch,
                sa,
                user_plane,
            };
            if update {
                ControlMessage::UpdateSa(install)
            } else {
                ControlMessage::CreateSa(install)
            }
        };
        channel::send(&self.downlink, wrap(child.inbound_sa()?)).await?;
        channel::send(&self.uplink, wrap(child.outbound_sa()?)).await
    }

    /// Remove the user plane SA from both workers
    pub async fn delete_user_plane(&self) -> Result<()> {
        channel::send(&self.downlink, ControlMessage::DeleteSa(SaTarget::UserPlane)).await?;
        channel::send(&self.uplink, ControlMessage::DeleteSa(SaTarget::UserPlane)).await
    }

    /// Send an IKE message through the ESP socket (NAT-T)
    pub async fn send_ike(&self, message: Vec<u8>) -> Result<()> {
        channel::send(&self.uplink, ControlMessage::Ike(message)).await
    }

    /// Stop both workers and wait for them
    pub async fn shutdown(self) -> Result<()> {
        // workers that already stopped have closed their channels
        let _ = channel::send(&self.uplink, ControlMessage::DeleteSa(SaTarget::Signaling)).await;
        let _ = channel::send(&self.downlink, ControlMessage::DeleteSa(SaTarget::Signaling)).await;
        for task in [self.uplink_task, self.downlink_task] {
            task.await
                .map_err(|e| Error::Other(format!("Forwarder task failed: {}", e)))??;
        }
        Ok(())
    }
}

/// In-memory packet device
///
/// Packets written by the engine appear on [`DeviceEnd::from_device`];
/// packets sent on [`DeviceEnd::to_device`] are read by the engine.
#[derive(Debug)]
pub struct ChannelDevice {
    inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// Application side of a [`ChannelDevice`]
#[derive(Debug)]
pub struct DeviceEnd {
    /// Packets for the engine to send
    pub to_device: mpsc::Sender<Vec<u8>>,
    /// Packets the engine received
    pub from_device: mpsc::Receiver<Vec<u8>>,
}

impl ChannelDevice {
    /// Create a device and its application side
    pub fn pair() -> (ChannelDevice, DeviceEnd) {
        let (to_device, inbound) = mpsc::channel(256);
        let (outbound, from_device) = mpsc::channel(256);
        (
            ChannelDevice {
                inbound: Mutex::new(inbound),
                outbound,
            },
            DeviceEnd {
                to_device,
                from_device,
            },
        )
    }
}

impl Collaborator for ChannelDevice {
    fn id(&self) -> &'static str {
        "channel-device"
    }

    fn description(&self) -> &'static str {
        "In-memory packet device"
    }
}

#[async_trait::async_trait]
impl PacketDevice for ChannelDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> PlatformResult<usize> {
        let packet = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| PlatformError::Unavailable("device closed".into()))?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn write_packet(&self, packet: &[u8]) -> PlatformResult<()> {
        self.outbound
            .send(packet.to_vec())
            .await
            .map_err(|_| PlatformError::Unavailable("device closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::crypto::{EncrAlgorithm, IntegAlgorithm};

    fn ipv4_packet(id: u16, more: bool, offset: usize, payload: &[u8]) -> Vec<u8> {
        let mut header = build_ipv4_header(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            GRE_PROTOCOL,
            payload.len(),
        );
        header[4..6].copy_from_slice(&id.to_be_bytes());
        let frag = ((offset / 8) as u16) | if more { 0x2000 } else { 0 };
        header[6..8].copy_from_slice(&frag.to_be_bytes());
        let mut packet = header.to_vec();
        packet.extend_from_slice(payload);
        packet
    }

    fn sa(spi: u32, key: u8) -> EspSa {
        EspSa::new(
            spi,
            EncrAlgorithm::AesCbc { key_len: 16 },
            IntegAlgorithm::HmacSha256_128,
            vec![key; 16],
            vec![key; 32],
        )
        .unwrap()
    }

    fn install(epoch: u64, sa: EspSa, user_plane: Option<UserPlaneParams>) -> ControlMessage {
        ControlMessage::UpdateSa(SaInstall {
            epoch,
            sa,
            user_plane,
        })
    }

    fn params() -> UserPlaneParams {
        UserPlaneParams {
            qfi: 5,
            up_address: Ipv4Addr::new(10, 0, 0, 1),
            tunnel_address: Ipv4Addr::new(10, 45, 0, 2),
        }
    }

    #[test]
    fn test_ipv4_checksum_verifies() {
        let header = build_ipv4_header(Ipv4Addr::new(192, 168, 0, 1), Ipv4Addr::new(192, 168, 0, 199), 17, 100);
        assert_eq!(ipv4_checksum(&header), 0);
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 120);
    }

    #[test]
    fn test_gre_roundtrip() {
        let inner = ipv4_packet(1, false, 0, b"user data");
        let outer = gre_encapsulate(&inner, &params());

        let info = Ipv4Info::parse(&outer).unwrap();
        assert_eq!(info.protocol, GRE_PROTOCOL);
        let gre = info.payload(&outer);
        assert_eq!(&gre[..4], &[0x20, 0x00, 0x08, 0x00]);
        assert_eq!(gre[4], 5);
        assert_eq!(gre_strip(gre).unwrap(), &inner[..]);
    }

    #[test]
    fn test_gre_strip_without_key() {
        assert_eq!(gre_strip(&[0, 0, 0x08, 0, 0xaa]).unwrap(), &[0xaa]);
        assert!(gre_strip(&[0x20, 0, 0x08]).is_err());
        assert!(gre_strip(&[]).is_err());
    }

    #[test]
    fn test_reassembly_fast_path() {
        let mut r = Reassembler::new(ReassemblyLimits::default());
        let packet = ipv4_packet(7, false, 0, b"whole");
        assert_eq!(r.push(&packet, Instant::now()).unwrap(), Some(b"whole".to_vec()));
        assert!(!r.fragmentation_seen());
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let original: Vec<u8> = (0..48u8).collect();
        let fragments = [
            ipv4_packet(42, true, 16, &original[16..32]),
            ipv4_packet(42, false, 32, &original[32..48]),
            ipv4_packet(42, true, 0, &original[0..16]),
        ];
        let mut r = Reassembler::new(ReassemblyLimits::default());
        let now = Instant::now();
        assert_eq!(r.push(&fragments[0], now).unwrap(), None);
        assert_eq!(r.push(&fragments[1], now).unwrap(), None);
        assert_eq!(r.pending(), 1);
        assert_eq!(r.push(&fragments[2], now).unwrap(), Some(original));
        assert_eq!(r.pending(), 0);
        assert!(r.fragmentation_seen());

        // unfragmented packets still pass once fragmentation was seen
        let packet = ipv4_packet(43, false, 0, b"after");
        assert_eq!(r.push(&packet, now).unwrap(), Some(b"after".to_vec()));
    }

    #[test]
    fn test_reassembly_eviction_by_age() {
        let limits = ReassemblyLimits {
            max_age: Duration::from_secs(1),
            max_entries: 8,
        };
        let mut r = Reassembler::new(limits);
        let start = Instant::now();
        r.push(&ipv4_packet(1, true, 0, &[0; 8]), start).unwrap();
        assert_eq!(r.evict(start), 0);
        assert_eq!(r.evict(start + Duration::from_secs(2)), 1);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_reassembly_capacity() {
        let limits = ReassemblyLimits {
            max_age: Duration::from_secs(60),
            max_entries: 4,
        };
        let mut r = Reassembler::new(limits);
        let start = Instant::now();
        for id in 0..10u16 {
            r.push(&ipv4_packet(id, true, 0, &[0; 8]), start + Duration::from_millis(id as u64))
                .unwrap();
        }
        assert_eq!(r.pending(), 4);
    }

    #[test]
    fn test_sa_table_epochs() {
        let mut table = SaTable::new();
        assert_eq!(table.apply(install(2, sa(0x100, 1), None)), Applied::Installed(SaTarget::Signaling));
        assert_eq!(table.lookup(0x100), Lookup::Active(SaTarget::Signaling));

        // older install loses
        assert_eq!(table.apply(install(1, sa(0x200, 2), None)), Applied::Outdated);
        assert_eq!(table.lookup(0x200), Lookup::Unknown);

        assert_eq!(table.apply(install(3, sa(0x300, 3), None)), Applied::Installed(SaTarget::Signaling));
        assert_eq!(table.lookup(0x100), Lookup::Stale { epoch: 2 });
        assert_eq!(table.current_epoch(), 3);

        table.apply(install(4, sa(0x400, 4), Some(params())));
        assert_eq!(table.lookup(0x400), Lookup::Active(SaTarget::UserPlane));
        assert_eq!(
            table.apply(ControlMessage::DeleteSa(SaTarget::UserPlane)),
            Applied::Removed(SaTarget::UserPlane)
        );
        assert_eq!(table.lookup(0x400), Lookup::Stale { epoch: 4 });
        assert_eq!(table.apply(ControlMessage::DeleteSa(SaTarget::Signaling)), Applied::Stop);
        assert!(matches!(
            table.apply(ControlMessage::Nas(vec![1])),
            Applied::Passthrough(ControlMessage::Nas(_))
        ));
    }

    #[test]
    fn test_inner_next_header() {
        assert_eq!(inner_next_header(&[0x45]), NEXT_HEADER_IPV4);
        assert_eq!(inner_next_header(&[0x60]), NEXT_HEADER_IPV6);
    }

    async fn loopback() -> (Forwarder, DeviceEnd, DeviceEnd, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.connect(local.local_addr().unwrap()).await.unwrap();
        let transport = EspTransport::from_udp_socket(local, peer.local_addr().unwrap());

        let (signaling, signaling_end) = ChannelDevice::pair();
        let (user_plane, user_plane_end) = ChannelDevice::pair();
        let forwarder = Forwarder::new(
            transport,
            Arc::new(signaling),
            Some(Arc::new(user_plane)),
            ReassemblyLimits::default(),
        );
        (forwarder, signaling_end, user_plane_end, peer)
    }

    #[tokio::test]
    async fn test_forwarder_signaling_both_directions() {
        let (forwarder, mut signaling, _up, peer) = loopback().await;
        let (to_driver, mut from_workers) = channel::control_channel();
        let handle = forwarder.spawn(to_driver);

        // uplink SA 0x1000, downlink SA 0x2000
        channel::send(&handle.uplink, install(1, sa(0x1000, 1), None)).await.unwrap();
        channel::send(&handle.downlink, install(1, sa(0x2000, 2), None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let packet = ipv4_packet(1, false, 0, b"uplink");
        signaling.to_device.send(packet.clone()).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let len = peer.recv(&mut buf).await.unwrap();
        let (plain, nh) = sa(0x1000, 1).decapsulate(&buf[..len]).unwrap();
        assert_eq!(plain, packet);
        assert_eq!(nh, NEXT_HEADER_IPV4);

        let downlink_packet = ipv4_packet(2, false, 0, b"downlink");
        let mut peer_sa = sa(0x2000, 2);
        peer.send(&peer_sa.encapsulate(&downlink_packet, NEXT_HEADER_IPV4).unwrap())
            .await
            .unwrap();
        assert_eq!(signaling.from_device.recv().await.unwrap(), downlink_packet);

        // IKE passthrough
        let mut ike = NON_ESP_MARKER.to_vec();
        ike.extend_from_slice(&[0xab; 28]);
        peer.send(&ike).await.unwrap();
        assert_eq!(from_workers.recv().await, Some(ControlMessage::Ike(vec![0xab; 28])));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_forwarder_drops_stale_spi() {
        let (forwarder, mut signaling, _up, peer) = loopback().await;
        let (to_driver, _from_workers) = channel::control_channel();
        let handle = forwarder.spawn(to_driver);

        channel::send(&handle.downlink, install(1, sa(0x2000, 2), None)).await.unwrap();
        channel::send(&handle.downlink, install(2, sa(0x3000, 3), None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut old = sa(0x2000, 2);
        peer.send(&old.encapsulate(b"old", NEXT_HEADER_IPV4).unwrap()).await.unwrap();
        let mut new = sa(0x3000, 3);
        peer.send(&new.encapsulate(&ipv4_packet(9, false, 0, b"new"), NEXT_HEADER_IPV4).unwrap())
            .await
            .unwrap();

        let received = signaling.from_device.recv().await.unwrap();
        assert_eq!(received, ipv4_packet(9, false, 0, b"new"));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_forwarder_user_plane_gre() {
        let (forwarder, _sig, mut up, peer) = loopback().await;
        let (to_driver, _from_workers) = channel::control_channel();
        let handle = forwarder.spawn(to_driver);

        channel::send(&handle.uplink, install(1, sa(0x5000, 5), Some(params()))).await.unwrap();
        channel::send(&handle.downlink, install(1, sa(0x6000, 6), Some(params()))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let inner = ipv4_packet(3, false, 0, b"to the internet");
        up.to_device.send(inner.clone()).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let len = peer.recv(&mut buf).await.unwrap();
        let (outer, _) = sa(0x5000, 5).decapsulate(&buf[..len]).unwrap();
        let info = Ipv4Info::parse(&outer).unwrap();
        assert_eq!(info.protocol, GRE_PROTOCOL);
        assert_eq!(gre_strip(info.payload(&outer)).unwrap(), &inner[..]);

        // downlink: fragmented GRE datagram
        let reply = ipv4_packet(4, false, 0, b"from the internet");
        let gre = gre_encapsulate(&reply, &params());
        let gre_payload = Ipv4Info::parse(&gre).unwrap().payload(&gre).to_vec();
        let (first, second) = gre_payload.split_at(16);
        let mut peer_sa = sa(0x6000, 6);
        for fragment in [ipv4_packet(77, false, 16, second), ipv4_packet(77, true, 0, first)] {
            peer.send(&peer_sa.encapsulate(&fragment, NEXT_HEADER_IPV4).unwrap())
                .await
                .unwrap();
        }
        assert_eq!(up.from_device.recv().await.unwrap(), reply);

        handle.shutdown().await.unwrap();
    }
}
