//! IKEv2 Payload structures and parsing
//!
//! Implements IKE payloads as defined in RFC 7296 Section 3.2 and the
//! chained payload walk used for both plain messages and the decrypted
//! contents of an SK payload.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::RngCore;
use sha1::{Digest, Sha1};

use super::constants::{cfg, ts_type, PayloadType};
use super::eap::EapPacket;
use super::proposal::{decode_proposals, encode_proposals, Proposal};
use crate::ipsec::{Error, Result};

/// Generic IKE payload header (4 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |C|  RESERVED   |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// `next_payload` stays a raw octet so that unknown payload types can still
/// be skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Next payload type
    pub next_payload: u8,

    /// Critical bit (if set, must understand this payload)
    pub critical: bool,

    /// Total payload length including header (4 bytes + data)
    pub length: u16,
}

impl PayloadHeader {
    /// Minimum payload header size
    pub const SIZE: usize = 4;

    /// Create new payload header
    pub fn new(next_payload: u8, critical: bool, length: u16) -> Self {
        PayloadHeader {
            next_payload,
            critical,
            length,
        }
    }

    /// Parse payload header from bytes
    ///
    /// # Errors
    ///
    /// Returns error if buffer is too short or the length is below 4
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::BufferTooShort {
                required: Self::SIZE,
                available: data.len(),
            });
        }

        let next_payload = data[0];
        let critical = (data[1] & 0x80) != 0;
        let length = u16::from_be_bytes([data[2], data[3]]);

        if (length as usize) < Self::SIZE {
            return Err(Error::InvalidLength {
                expected: Self::SIZE,
                actual: length as usize,
            });
        }

        Ok(PayloadHeader {
            next_payload,
            critical,
            length,
        })
    }

    /// Serialize payload header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.next_payload;
        bytes[1] = if self.critical { 0x80 } else { 0x00 };
        bytes[2..4].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Get payload data length (excluding header)
    pub fn data_length(&self) -> usize {
        (self.length as usize).saturating_sub(Self::SIZE)
    }
}

fn need(data: &[u8], required: usize) -> Result<()> {
    if data.len() < required {
        return Err(Error::BufferTooShort {
            required,
            available: data.len(),
        });
    }
    Ok(())
}

/// Key Exchange Payload (RFC 7296 Section 3.4)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KePayload {
    /// Diffie-Hellman group number
    pub dh_group: u16,

    /// Public value
    pub key_data: Vec<u8>,
}

impl KePayload {
    /// Create new KE payload
    pub fn new(dh_group: u16, key_data: Vec<u8>) -> Self {
        KePayload { dh_group, key_data }
    }

    /// Parse KE payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        need(data, 4)?;
        Ok(KePayload {
            dh_group: u16::from_be_bytes([data[0], data[1]]),
            key_data: data[4..].to_vec(),
        })
    }

    /// Serialize KE payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.key_data.len());
        bytes.extend_from_slice(&self.dh_group.to_be_bytes());
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.key_data);
        bytes
    }
}

/// Bias applied to the first half of a generated nonce
///
/// Used to win or lose a simultaneous-rekey tie-break on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NonceBias {
    /// Fully random
    #[default]
    Random,
    /// Eight leading 0x00 octets
    Lowest,
    /// Eight leading 0xff octets
    Highest,
}

/// Nonce Payload (RFC 7296 Section 3.9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePayload {
    /// Nonce data (16-256 bytes)
    pub nonce: Vec<u8>,
}

impl NoncePayload {
    /// Minimum nonce size (16 bytes)
    pub const MIN_SIZE: usize = 16;

    /// Maximum nonce size (256 bytes)
    pub const MAX_SIZE: usize = 256;

    /// Create new nonce payload
    pub fn new(nonce: Vec<u8>) -> Result<Self> {
        if nonce.len() < Self::MIN_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce too short: {} bytes (minimum {})",
                nonce.len(),
                Self::MIN_SIZE
            )));
        }

        if nonce.len() > Self::MAX_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce too long: {} bytes (maximum {})",
                nonce.len(),
                Self::MAX_SIZE
            )));
        }

        Ok(NoncePayload { nonce })
    }

    /// Generate a 16-byte nonce
    pub fn generate(bias: NonceBias) -> Self {
        let mut nonce = vec![0u8; Self::MIN_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        match bias {
            NonceBias::Random => {}
            NonceBias::Lowest => nonce[..8].fill(0x00),
            NonceBias::Highest => nonce[..8].fill(0xff),
        }
        NoncePayload { nonce }
    }

    /// Parse nonce payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        Self::new(data.to_vec())
    }

    /// Serialize nonce payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        self.nonce.clone()
    }
}

/// Identification type (RFC 7296 Section 3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IdType {
    /// IPv4 address
    Ipv4Addr = 1,
    /// Fully-qualified domain name
    Fqdn = 2,
    /// RFC 822 email address (NAI)
    Rfc822Addr = 3,
    /// IPv6 address
    Ipv6Addr = 5,
    /// Distinguished Name
    DerAsn1Dn = 9,
    /// Generalized name
    DerAsn1Gn = 10,
    /// Key ID
    KeyId = 11,
}

impl IdType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(IdType::Ipv4Addr),
            2 => Some(IdType::Fqdn),
            3 => Some(IdType::Rfc822Addr),
            5 => Some(IdType::Ipv6Addr),
            9 => Some(IdType::DerAsn1Dn),
            10 => Some(IdType::DerAsn1Gn),
            11 => Some(IdType::KeyId),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Identification Payload (RFC 7296 Section 3.5)
///
/// Used for IDi (Initiator) and IDr (Responder) payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdPayload {
    /// ID type
    pub id_type: IdType,

    /// Identification data
    pub data: Vec<u8>,
}

impl IdPayload {
    /// Create new ID payload
    pub fn new(id_type: IdType, data: Vec<u8>) -> Self {
        IdPayload { id_type, data }
    }

    /// Create ID from FQDN
    pub fn from_fqdn(fqdn: &str) -> Self {
        IdPayload::new(IdType::Fqdn, fqdn.as_bytes().to_vec())
    }

    /// Create ID from an NAI / email address
    pub fn from_email(email: &str) -> Self {
        IdPayload::new(IdType::Rfc822Addr, email.as_bytes().to_vec())
    }

    /// Create ID from Key ID
    pub fn from_key_id(key_id: &[u8]) -> Self {
        IdPayload::new(IdType::KeyId, key_id.to_vec())
    }

    /// Create ID from an IP address
    pub fn from_ip(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => IdPayload::new(IdType::Ipv4Addr, v4.octets().to_vec()),
            IpAddr::V6(v6) => IdPayload::new(IdType::Ipv6Addr, v6.octets().to_vec()),
        }
    }

    /// Parse ID payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        need(data, 4)?;
        let id_type = IdType::from_u8(data[0])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown ID type: {}", data[0])))?;
        Ok(IdPayload {
            id_type,
            data: data[4..].to_vec(),
        })
    }

    /// Serialize ID payload to bytes (without header)
    ///
    /// This is also the input to the `PRF(SK_p, ID)` term of the AUTH
    /// computation.
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.data.len());
        bytes.push(self.id_type.to_u8());
        bytes.extend_from_slice(&[0u8, 0u8, 0u8]);
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Get ID as string (if applicable)
    pub fn as_string(&self) -> Option<String> {
        match self.id_type {
            IdType::Fqdn | IdType::Rfc822Addr => String::from_utf8(self.data.clone()).ok(),
            _ => None,
        }
    }
}

/// Certificate and Certificate Request payloads (RFC 7296 Sections 3.6, 3.7)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPayload {
    /// Certificate encoding (4 = X.509 signature)
    pub encoding: u8,
    /// Certificate data or CA key hashes
    pub data: Vec<u8>,
}

impl CertPayload {
    /// X.509 Certificate - Signature
    pub const X509_SIGNATURE: u8 = 4;

    /// CERTREQ naming a CA by the SHA-1 hash of its public key
    pub fn request_for_ca(ca_public_key: &[u8]) -> Self {
        CertPayload {
            encoding: Self::X509_SIGNATURE,
            data: Sha1::digest(ca_public_key).to_vec(),
        }
    }

    /// Parse from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        need(data, 1)?;
        Ok(CertPayload {
            encoding: data[0],
            data: data[1..].to_vec(),
        })
    }

    /// Serialize to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.data.len());
        bytes.push(self.encoding);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// Authentication Method (RFC 7296 Section 3.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    /// RSA Digital Signature
    RsaSig = 1,
    /// Shared Key Message Integrity Code
    SharedKeyMic = 2,
    /// DSS Digital Signature
    DssSig = 3,
    /// Digital Signature (RFC 7427)
    DigitalSignature = 14,
}

impl AuthMethod {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AuthMethod::RsaSig),
            2 => Some(AuthMethod::SharedKeyMic),
            3 => Some(AuthMethod::DssSig),
            14 => Some(AuthMethod::DigitalSignature),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Authentication Payload (RFC 7296 Section 3.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// Authentication method
    pub auth_method: AuthMethod,

    /// Authentication data
    pub auth_data: Vec<u8>,
}

impl AuthPayload {
    /// Create new AUTH payload
    pub fn new(auth_method: AuthMethod, auth_data: Vec<u8>) -> Self {
        AuthPayload {
            auth_method,
            auth_data,
        }
    }

    /// Parse AUTH payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        need(data, 4)?;
        let auth_method = AuthMethod::from_u8(data[0]).ok_or_else(|| {
            Error::InvalidPayload(format!("Unknown auth method: {}", data[0]))
        })?;
        Ok(AuthPayload {
            auth_method,
            auth_data: data[4..].to_vec(),
        })
    }

    /// Serialize AUTH payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.auth_data.len());
        bytes.push(self.auth_method.to_u8());
        bytes.extend_from_slice(&[0u8, 0u8, 0u8]);
        bytes.extend_from_slice(&self.auth_data);
        bytes
    }
}

/// Notify Payload (RFC 7296 Section 3.10)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Protocol ID (0 when not SA related)
    pub protocol_id: u8,
    /// Notify message type
    pub notify_type: u16,
    /// SPI, may be empty
    pub spi: Vec<u8>,
    /// Notification data, may be empty
    pub data: Vec<u8>,
}

impl NotifyPayload {
    /// Notify without SPI
    pub fn new(notify_type: u16, data: Vec<u8>) -> Self {
        NotifyPayload {
            protocol_id: 0,
            notify_type,
            spi: Vec::new(),
            data,
        }
    }

    /// Notify bound to an SA
    pub fn with_spi(protocol_id: u8, notify_type: u16, spi: Vec<u8>, data: Vec<u8>) -> Self {
        NotifyPayload {
            protocol_id,
            notify_type,
            spi,
            data,
        }
    }

    /// Whether the notify type reports an error
    pub fn is_error(&self) -> bool {
        super::constants::notify::is_error(self.notify_type)
    }

    /// Parse from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        need(data, 4)?;
        let spi_size = data[1] as usize;
        need(data, 4 + spi_size)?;
        Ok(NotifyPayload {
            protocol_id: data[0],
            notify_type: u16::from_be_bytes([data[2], data[3]]),
            spi: data[4..4 + spi_size].to_vec(),
            data: data[4 + spi_size..].to_vec(),
        })
    }

    /// Serialize to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.spi.len() + self.data.len());
        bytes.push(self.protocol_id);
        bytes.push(self.spi.len() as u8);
        bytes.extend_from_slice(&self.notify_type.to_be_bytes());
        bytes.extend_from_slice(&self.spi);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// NAT detection hash: SHA-1(SPIi | SPIr | IP | port) (RFC 7296 Section 2.23)
pub fn nat_detection_hash(spi_i: &[u8; 8], spi_r: &[u8; 8], addr: IpAddr, port: u16) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(spi_i);
    hasher.update(spi_r);
    match addr {
        IpAddr::V4(v4) => hasher.update(v4.octets()),
        IpAddr::V6(v6) => hasher.update(v6.octets()),
    }
    hasher.update(port.to_be_bytes());
    hasher.finalize().to_vec()
}

/// Delete Payload (RFC 7296 Section 3.11)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol ID (1 = IKE, 3 = ESP)
    pub protocol_id: u8,
    /// SPI size (0 for IKE, 4 for ESP)
    pub spi_size: u8,
    /// SPIs being deleted
    pub spis: Vec<Vec<u8>>,
}

impl DeletePayload {
    /// Delete the IKE SA carrying this payload
    pub fn ike() -> Self {
        DeletePayload {
            protocol_id: 1,
            spi_size: 0,
            spis: Vec::new(),
        }
    }

    /// Delete ESP SAs by inbound SPI
    pub fn esp(spis: &[u32]) -> Self {
        DeletePayload {
            protocol_id: 3,
            spi_size: 4,
            spis: spis.iter().map(|s| s.to_be_bytes().to_vec()).collect(),
        }
    }

    /// ESP SPIs as integers
    pub fn esp_spis(&self) -> Vec<u32> {
        self.spis
            .iter()
            .filter_map(|s| <[u8; 4]>::try_from(s.as_slice()).ok())
            .map(u32::from_be_bytes)
            .collect()
    }

    /// Parse from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        need(data, 4)?;
        let spi_size = data[1];
        let count = u16::from_be_bytes([data[2], data[3]]) as usize;
        let mut spis = Vec::with_capacity(count);
        if spi_size != 0 {
            let size = spi_size as usize;
            need(data, 4 + count * size)?;
            for i in 0..count {
                spis.push(data[4 + i * size..4 + (i + 1) * size].to_vec());
            }
        }
        Ok(DeletePayload {
            protocol_id: data[0],
            spi_size,
            spis,
        })
    }

    /// Serialize to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = vec![self.protocol_id, self.spi_size];
        bytes.extend_from_slice(&(self.spis.len() as u16).to_be_bytes());
        for spi in &self.spis {
            bytes.extend_from_slice(spi);
        }
        bytes
    }
}

/// Traffic selector (RFC 7296 Section 3.13.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    /// IP protocol ID, 0 = any
    pub ip_protocol: u8,
    /// Start port
    pub start_port: u16,
    /// End port
    pub end_port: u16,
    /// Start address
    pub start_addr: IpAddr,
    /// End address
    pub end_addr: IpAddr,
}

impl TrafficSelector {
    /// Every IPv4 address, every protocol and port
    pub fn any_ipv4() -> Self {
        TrafficSelector {
            ip_protocol: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            end_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
        }
    }

    /// Every IPv6 address, every protocol and port
    pub fn any_ipv6() -> Self {
        TrafficSelector {
            ip_protocol: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            end_addr: IpAddr::V6(Ipv6Addr::from([0xff; 16])),
        }
    }

    /// A single host, all protocols and ports
    pub fn host(addr: IpAddr) -> Self {
        TrafficSelector {
            ip_protocol: 0,
            start_port: 0,
            end_port: 65535,
            start_addr: addr,
            end_addr: addr,
        }
    }

    fn ts_type(&self) -> u8 {
        match self.start_addr {
            IpAddr::V4(_) => ts_type::IPV4_ADDR_RANGE,
            IpAddr::V6(_) => ts_type::IPV6_ADDR_RANGE,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let len: u16 = if self.ts_type() == ts_type::IPV4_ADDR_RANGE {
            16
        } else {
            40
        };
        out.push(self.ts_type());
        out.push(self.ip_protocol);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.start_port.to_be_bytes());
        out.extend_from_slice(&self.end_port.to_be_bytes());
        for addr in [self.start_addr, self.end_addr] {
            match addr {
                IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
                IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
            }
        }
    }

    fn decode(data: &[u8]) -> Result<(Self, usize)> {
        need(data, 8)?;
        let selector_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let addr_len = match data[0] {
            ts_type::IPV4_ADDR_RANGE => 4,
            ts_type::IPV6_ADDR_RANGE => 16,
            other => {
                return Err(Error::InvalidPayload(format!(
                    "Unsupported traffic selector type: {}",
                    other
                )))
            }
        };
        need(data, 8 + 2 * addr_len)?;
        let addr_at = |pos: usize| -> IpAddr {
            if addr_len == 4 {
                let mut b = [0u8; 4];
                b.copy_from_slice(&data[pos..pos + 4]);
                IpAddr::V4(Ipv4Addr::from(b))
            } else {
                let mut b = [0u8; 16];
                b.copy_from_slice(&data[pos..pos + 16]);
                IpAddr::V6(Ipv6Addr::from(b))
            }
        };
        Ok((
            TrafficSelector {
                ip_protocol: data[1],
                start_port: u16::from_be_bytes([data[4], data[5]]),
                end_port: u16::from_be_bytes([data[6], data[7]]),
                start_addr: addr_at(8),
                end_addr: addr_at(8 + addr_len),
            },
            selector_len.max(8 + 2 * addr_len),
        ))
    }
}

fn encode_traffic_selectors(selectors: &[TrafficSelector]) -> Vec<u8> {
    let mut out = vec![selectors.len() as u8, 0, 0, 0];
    for ts in selectors {
        ts.encode(&mut out);
    }
    out
}

fn decode_traffic_selectors(data: &[u8]) -> Result<Vec<TrafficSelector>> {
    need(data, 4)?;
    let count = data[0] as usize;
    let mut selectors = Vec::with_capacity(count);
    let mut pos = 4;
    for _ in 0..count {
        let (ts, used) = TrafficSelector::decode(&data[pos..])?;
        selectors.push(ts);
        pos += used;
        if pos > data.len() {
            return Err(Error::BufferTooShort {
                required: pos,
                available: data.len(),
            });
        }
    }
    Ok(selectors)
}

/// Configuration attribute value (RFC 7296 Section 3.15.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfgValue {
    /// Zero-length attribute (request for a value)
    Empty,
    /// One or more IPv4 addresses
    Ipv4(Vec<Ipv4Addr>),
    /// IPv4 address and netmask
    Ipv4Subnet(Ipv4Addr, Ipv4Addr),
    /// IPv6 address
    Ipv6(Ipv6Addr),
    /// IPv6 address and prefix length
    Ipv6Prefix(Ipv6Addr, u8),
    /// Attribute without a fixed layout
    Raw(Vec<u8>),
}

/// Configuration attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgAttribute {
    /// Attribute type
    pub attr_type: u16,
    /// Value
    pub value: CfgValue,
}

impl CfgAttribute {
    /// Attribute requesting a value
    pub fn request(attr_type: u16) -> Self {
        CfgAttribute {
            attr_type,
            value: CfgValue::Empty,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let mut body = Vec::new();
        match &self.value {
            CfgValue::Empty => {}
            CfgValue::Ipv4(addrs) => addrs.iter().for_each(|a| body.extend_from_slice(&a.octets())),
            CfgValue::Ipv4Subnet(a, m) => {
                body.extend_from_slice(&a.octets());
                body.extend_from_slice(&m.octets());
            }
            CfgValue::Ipv6(a) => body.extend_from_slice(&a.octets()),
            CfgValue::Ipv6Prefix(a, p) => {
                body.extend_from_slice(&a.octets());
                body.push(*p);
            }
            CfgValue::Raw(v) => body.extend_from_slice(v),
        }
        out.extend_from_slice(&(self.attr_type & 0x7fff).to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&body);
    }

    fn decode(attr_type: u16, body: &[u8]) -> Self {
        let v4 = |b: &[u8]| Ipv4Addr::new(b[0], b[1], b[2], b[3]);
        let v6 = |b: &[u8]| {
            let mut o = [0u8; 16];
            o.copy_from_slice(&b[..16]);
            Ipv6Addr::from(o)
        };
        let value = match (cfg::fixed_len(attr_type), body.len()) {
            (_, 0) => CfgValue::Empty,
            (Some(4), n) if n % 4 == 0 => CfgValue::Ipv4(body.chunks(4).map(v4).collect()),
            (Some(8), 8) => CfgValue::Ipv4Subnet(v4(&body[..4]), v4(&body[4..])),
            (Some(16), 16) => CfgValue::Ipv6(v6(body)),
            (Some(17), 17) => CfgValue::Ipv6Prefix(v6(body), body[16]),
            _ => CfgValue::Raw(body.to_vec()),
        };
        CfgAttribute { attr_type, value }
    }
}

/// Configuration Payload (RFC 7296 Section 3.15)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpPayload {
    /// CFG type (request, reply, set, ack)
    pub cfg_type: u8,
    /// Attributes
    pub attributes: Vec<CfgAttribute>,
}

impl CpPayload {
    /// IPv4 addresses carried by a given attribute type
    pub fn ipv4_addresses(&self, attr_type: u16) -> Vec<Ipv4Addr> {
        self.attributes
            .iter()
            .filter(|a| a.attr_type == attr_type)
            .flat_map(|a| match &a.value {
                CfgValue::Ipv4(v) => v.clone(),
                CfgValue::Ipv4Subnet(addr, _) => vec![*addr],
                _ => Vec::new(),
            })
            .collect()
    }

    /// IPv6 addresses carried by a given attribute type
    pub fn ipv6_addresses(&self, attr_type: u16) -> Vec<Ipv6Addr> {
        self.attributes
            .iter()
            .filter(|a| a.attr_type == attr_type)
            .filter_map(|a| match &a.value {
                CfgValue::Ipv6(v) | CfgValue::Ipv6Prefix(v, _) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// Parse from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        need(data, 4)?;
        let mut attributes = Vec::new();
        let mut pos = 4;
        while pos < data.len() {
            need(data, pos + 4)?;
            let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]) & 0x7fff;
            let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
            need(data, pos + 4 + len)?;
            attributes.push(CfgAttribute::decode(attr_type, &data[pos + 4..pos + 4 + len]));
            pos += 4 + len;
        }
        Ok(CpPayload {
            cfg_type: data[0],
            attributes,
        })
    }

    /// Serialize to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut out = vec![self.cfg_type, 0, 0, 0];
        for a in &self.attributes {
            a.encode(&mut out);
        }
        out
    }
}

/// IKE Payload types
///
/// Decoding never fails on an unrecognized payload type; such payloads are
/// kept as [`IkePayload::Unknown`] and the chain walk continues.
#[derive(Debug, Clone, PartialEq)]
pub enum IkePayload {
    /// Security Association payload
    SA(Vec<Proposal>),

    /// Key Exchange payload
    KE(KePayload),

    /// Identification payload (Initiator)
    IDi(IdPayload),

    /// Identification payload (Responder)
    IDr(IdPayload),

    /// Certificate payload
    CERT(CertPayload),

    /// Certificate request payload
    CERTREQ(CertPayload),

    /// Authentication payload
    AUTH(AuthPayload),

    /// Nonce payload
    Nonce(NoncePayload),

    /// Notify payload
    N(NotifyPayload),

    /// Delete payload
    D(DeletePayload),

    /// Vendor ID payload
    V(Vec<u8>),

    /// Traffic selectors (Initiator)
    TSi(Vec<TrafficSelector>),

    /// Traffic selectors (Responder)
    TSr(Vec<TrafficSelector>),

    /// Encrypted and authenticated payload, still protected
    SK {
        /// Type of the first inner payload
        first_payload: u8,
        /// IV, ciphertext and ICV
        data: Vec<u8>,
    },

    /// Configuration payload
    CP(CpPayload),

    /// EAP payload
    EAP(EapPacket),

    /// Unknown/unimplemented payload (store raw data)
    Unknown {
        /// Payload type
        payload_type: u8,
        /// Raw payload data (excluding header)
        data: Vec<u8>,
    },
}

impl IkePayload {
    /// Get payload type
    pub fn payload_type(&self) -> u8 {
        let t = match self {
            IkePayload::SA(_) => PayloadType::SA,
            IkePayload::KE(_) => PayloadType::KE,
            IkePayload::IDi(_) => PayloadType::IDi,
            IkePayload::IDr(_) => PayloadType::IDr,
            IkePayload::CERT(_) => PayloadType::CERT,
            IkePayload::CERTREQ(_) => PayloadType::CERTREQ,
            IkePayload::AUTH(_) => PayloadType::AUTH,
            IkePayload::Nonce(_) => PayloadType::Nonce,
            IkePayload::N(_) => PayloadType::N,
            IkePayload::D(_) => PayloadType::D,
            IkePayload::V(_) => PayloadType::V,
            IkePayload::TSi(_) => PayloadType::TSi,
            IkePayload::TSr(_) => PayloadType::TSr,
            IkePayload::SK { .. } => PayloadType::SK,
            IkePayload::CP(_) => PayloadType::CP,
            IkePayload::EAP(_) => PayloadType::EAP,
            IkePayload::Unknown { payload_type, .. } => return *payload_type,
        };
        t.to_u8()
    }

    /// Serialize payload body (without generic header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        match self {
            IkePayload::SA(proposals) => encode_proposals(proposals),
            IkePayload::KE(ke) => ke.to_payload_data(),
            IkePayload::IDi(id) | IkePayload::IDr(id) => id.to_payload_data(),
            IkePayload::CERT(c) | IkePayload::CERTREQ(c) => c.to_payload_data(),
            IkePayload::AUTH(a) => a.to_payload_data(),
            IkePayload::Nonce(n) => n.to_payload_data(),
            IkePayload::N(n) => n.to_payload_data(),
            IkePayload::D(d) => d.to_payload_data(),
            IkePayload::V(v) => v.clone(),
            IkePayload::TSi(ts) | IkePayload::TSr(ts) => encode_traffic_selectors(ts),
            IkePayload::SK { data, .. } => data.clone(),
            IkePayload::CP(cp) => cp.to_payload_data(),
            IkePayload::EAP(eap) => eap.to_bytes(),
            IkePayload::Unknown { data, .. } => data.clone(),
        }
    }

    /// Parse a payload body of a given type
    pub fn from_payload_data(payload_type: u8, data: &[u8]) -> Result<Self> {
        let Some(kind) = PayloadType::from_u8(payload_type) else {
            return Ok(IkePayload::Unknown {
                payload_type,
                data: data.to_vec(),
            });
        };
        Ok(match kind {
            PayloadType::SA => IkePayload::SA(decode_proposals(data)?),
            PayloadType::KE => IkePayload::KE(KePayload::from_payload_data(data)?),
            PayloadType::IDi => IkePayload::IDi(IdPayload::from_payload_data(data)?),
            PayloadType::IDr => IkePayload::IDr(IdPayload::from_payload_data(data)?),
            PayloadType::CERT => IkePayload::CERT(CertPayload::from_payload_data(data)?),
            PayloadType::CERTREQ => IkePayload::CERTREQ(CertPayload::from_payload_data(data)?),
            PayloadType::AUTH => IkePayload::AUTH(AuthPayload::from_payload_data(data)?),
            PayloadType::Nonce => IkePayload::Nonce(NoncePayload::from_payload_data(data)?),
            PayloadType::N => IkePayload::N(NotifyPayload::from_payload_data(data)?),
            PayloadType::D => IkePayload::D(DeletePayload::from_payload_data(data)?),
            PayloadType::V => IkePayload::V(data.to_vec()),
            PayloadType::TSi => IkePayload::TSi(decode_traffic_selectors(data)?),
            PayloadType::TSr => IkePayload::TSr(decode_traffic_selectors(data)?),
            PayloadType::CP => IkePayload::CP(CpPayload::from_payload_data(data)?),
            PayloadType::EAP => IkePayload::EAP(EapPacket::from_bytes(data)?),
            PayloadType::SK | PayloadType::None => {
                return Err(Error::InvalidPayload(format!(
                    "Payload type {} cannot be decoded here",
                    payload_type
                )))
            }
        })
    }
}

/// Encode a payload chain
///
/// Returns the type of the first payload (for the preceding header) and the
/// encoded bytes. An SK payload must be last; its generic header names the
/// first inner payload instead of a successor.
pub fn encode_chain(payloads: &[IkePayload]) -> (u8, Vec<u8>) {
    let first = payloads
        .first()
        .map(IkePayload::payload_type)
        .unwrap_or(PayloadType::None.to_u8());

    let mut out = Vec::new();
    for (i, payload) in payloads.iter().enumerate() {
        let next = match payload {
            IkePayload::SK { first_payload, .. } => *first_payload,
            _ => payloads
                .get(i + 1)
                .map(IkePayload::payload_type)
                .unwrap_or(PayloadType::None.to_u8()),
        };
        let body = payload.to_payload_data();
        let header = PayloadHeader::new(next, false, (PayloadHeader::SIZE + body.len()) as u16);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body);
    }
    (first, out)
}

/// Decode a payload chain starting with payload type `first`
///
/// An SK payload ends the walk; its body is returned undecrypted.
pub fn decode_chain(first: u8, data: &[u8]) -> Result<Vec<IkePayload>> {
    let mut payloads = Vec::new();
    let mut current = first;
    let mut pos = 0;

    while current != PayloadType::None.to_u8() {
        let header = PayloadHeader::from_bytes(&data[pos.min(data.len())..])?;
        let end = pos + header.length as usize;
        if end > data.len() {
            return Err(Error::BufferTooShort {
                required: end,
                available: data.len(),
            });
        }
        let body = &data[pos + PayloadHeader::SIZE..end];

        if current == PayloadType::SK.to_u8() {
            payloads.push(IkePayload::SK {
                first_payload: header.next_payload,
                data: body.to_vec(),
            });
            break;
        }

        payloads.push(IkePayload::from_payload_data(current, body)?);
        current = header.next_payload;
        pos = end;
    }

    Ok(payloads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::constants::notify;
    use crate::ipsec::ikev2::proposal::{ProtocolId, Transform, TransformType};

    #[test]
    fn test_payload_header_roundtrip() {
        let header = PayloadHeader::new(PayloadType::SA.to_u8(), true, 100);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [33, 0x80, 0, 100]);
        assert_eq!(PayloadHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(header.data_length(), 96);
    }

    #[test]
    fn test_payload_header_invalid_length() {
        assert!(matches!(
            PayloadHeader::from_bytes(&[0, 0, 0, 2]),
            Err(Error::InvalidLength { .. })
        ));
        assert!(PayloadHeader::from_bytes(&[0, 0]).is_err());
    }

    #[test]
    fn test_nonce_limits_and_bias() {
        assert!(NoncePayload::new(vec![0; 15]).is_err());
        assert!(NoncePayload::new(vec![0; 257]).is_err());
        assert!(NoncePayload::new(vec![0; 32]).is_ok());

        let low = NoncePayload::generate(NonceBias::Lowest);
        assert_eq!(low.nonce.len(), 16);
        assert_eq!(&low.nonce[..8], &[0u8; 8]);
        let high = NoncePayload::generate(NonceBias::Highest);
        assert_eq!(&high.nonce[..8], &[0xffu8; 8]);
    }

    #[test]
    fn test_notify_roundtrip() {
        let n = NotifyPayload::with_spi(3, notify::REKEY_SA, vec![1, 2, 3, 4], vec![]);
        let parsed = NotifyPayload::from_payload_data(&n.to_payload_data()).unwrap();
        assert_eq!(parsed, n);
        assert!(!parsed.is_error());

        let cookie = NotifyPayload::new(notify::COOKIE, vec![9; 20]);
        let bytes = cookie.to_payload_data();
        assert_eq!(&bytes[..4], &[0, 0, 0x40, 0x06]);
        assert_eq!(NotifyPayload::from_payload_data(&bytes).unwrap(), cookie);

        assert!(NotifyPayload::new(notify::AUTHENTICATION_FAILED, vec![]).is_error());
    }

    #[test]
    fn test_delete_roundtrip() {
        let d = DeletePayload::esp(&[0x11223344, 0x55667788]);
        let bytes = d.to_payload_data();
        assert_eq!(&bytes[..4], &[3, 4, 0, 2]);
        let parsed = DeletePayload::from_payload_data(&bytes).unwrap();
        assert_eq!(parsed.esp_spis(), vec![0x11223344, 0x55667788]);

        let ike = DeletePayload::ike();
        assert_eq!(ike.to_payload_data(), vec![1, 0, 0, 0]);
        assert!(DeletePayload::from_payload_data(&[3, 4, 0, 2, 1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_traffic_selector_roundtrip() {
        let selectors = vec![
            TrafficSelector::any_ipv4(),
            TrafficSelector::host("10.0.0.1".parse().unwrap()),
            TrafficSelector::any_ipv6(),
        ];
        let bytes = encode_traffic_selectors(&selectors);
        assert_eq!(bytes.len(), 4 + 16 + 16 + 40);
        assert_eq!(decode_traffic_selectors(&bytes).unwrap(), selectors);
    }

    #[test]
    fn test_cp_decoding_by_attribute() {
        let cp = CpPayload {
            cfg_type: cfg::REPLY,
            attributes: vec![
                CfgAttribute {
                    attr_type: cfg::INTERNAL_IP4_ADDRESS,
                    value: CfgValue::Ipv4(vec![Ipv4Addr::new(10, 45, 0, 2)]),
                },
                CfgAttribute {
                    attr_type: cfg::INTERNAL_IP4_DNS,
                    value: CfgValue::Ipv4(vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)]),
                },
                CfgAttribute {
                    attr_type: cfg::INTERNAL_IP4_SUBNET,
                    value: CfgValue::Ipv4Subnet(
                        Ipv4Addr::new(10, 0, 0, 0),
                        Ipv4Addr::new(255, 0, 0, 0),
                    ),
                },
                CfgAttribute {
                    attr_type: cfg::INTERNAL_IP6_ADDRESS,
                    value: CfgValue::Ipv6Prefix(Ipv6Addr::LOCALHOST, 64),
                },
                CfgAttribute::request(cfg::INTERNAL_IP6_DNS),
                CfgAttribute {
                    attr_type: 0x4000,
                    value: CfgValue::Raw(vec![1, 2, 3]),
                },
            ],
        };
        let parsed = CpPayload::from_payload_data(&cp.to_payload_data()).unwrap();
        assert_eq!(parsed, cp);
        assert_eq!(
            parsed.ipv4_addresses(cfg::INTERNAL_IP4_DNS),
            vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)]
        );
        assert_eq!(parsed.ipv6_addresses(cfg::INTERNAL_IP6_ADDRESS), vec![Ipv6Addr::LOCALHOST]);
    }

    #[test]
    fn test_certreq_hash() {
        let req = CertPayload::request_for_ca(b"ca key");
        assert_eq!(req.encoding, 4);
        assert_eq!(req.data.len(), 20);
    }

    #[test]
    fn test_nat_detection_hash() {
        let a = nat_detection_hash(&[1; 8], &[0; 8], "192.0.2.1".parse().unwrap(), 500);
        let b = nat_detection_hash(&[1; 8], &[0; 8], "192.0.2.1".parse().unwrap(), 4500);
        assert_eq!(a.len(), 20);
        assert_ne!(a, b);
    }

    #[test]
    fn test_chain_roundtrip() {
        let proposal = Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::new(TransformType::Encr, 12))
            .add_transform(Transform::new(TransformType::Dh, 14));
        let payloads = vec![
            IkePayload::SA(vec![proposal]),
            IkePayload::KE(KePayload::new(14, vec![7; 256])),
            IkePayload::Nonce(NoncePayload::new(vec![5; 16]).unwrap()),
            IkePayload::N(NotifyPayload::new(notify::NAT_DETECTION_SOURCE_IP, vec![1; 20])),
            IkePayload::IDi(IdPayload::from_email("0001@nai.epc")),
            IkePayload::V(b"vendor".to_vec()),
        ];
        let (first, bytes) = encode_chain(&payloads);
        assert_eq!(first, PayloadType::SA.to_u8());
        assert_eq!(decode_chain(first, &bytes).unwrap(), payloads);
    }

    #[test]
    fn test_unknown_payload_is_kept() {
        let payloads = vec![
            IkePayload::Unknown {
                payload_type: 200,
                data: vec![1, 2, 3],
            },
            IkePayload::Nonce(NoncePayload::new(vec![5; 16]).unwrap()),
        ];
        let (first, bytes) = encode_chain(&payloads);
        assert_eq!(first, 200);
        assert_eq!(decode_chain(first, &bytes).unwrap(), payloads);
    }

    #[test]
    fn test_sk_ends_chain() {
        let payloads = vec![
            IkePayload::N(NotifyPayload::new(notify::INITIAL_CONTACT, vec![])),
            IkePayload::SK {
                first_payload: PayloadType::IDi.to_u8(),
                data: vec![0xaa; 48],
            },
        ];
        let (_, bytes) = encode_chain(&payloads);
        // SK's generic header names the first inner payload
        assert_eq!(bytes[8], PayloadType::IDi.to_u8());
        assert_eq!(decode_chain(PayloadType::N.to_u8(), &bytes).unwrap(), payloads);
    }

    #[test]
    fn test_truncated_chain_rejected() {
        let (first, bytes) =
            encode_chain(&[IkePayload::Nonce(NoncePayload::new(vec![5; 16]).unwrap())]);
        assert!(decode_chain(first, &bytes[..10]).is_err());
    }
}
