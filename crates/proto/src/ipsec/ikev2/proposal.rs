//! IKEv2 Proposal and Transform structures
//!
//! Implements SA proposal negotiation as defined in RFC 7296 Section 3.3.
//!
//! # Structure
//!
//! ```text
//! SA Payload
//!   └── Proposal(s)
//!         └── Transform(s)
//!               └── Attribute (key length)
//! ```
//!
//! The UE always offers a short ordered list and accepts whichever proposal
//! number the peer echoes back, provided every echoed transform was part of
//! what was offered.

use crate::ipsec::crypto::{DhGroup, EncrAlgorithm, IntegAlgorithm, PrfAlgorithm};
use crate::ipsec::{Error, Result};

/// Key Length transform attribute (RFC 7296 Section 3.3.5)
pub const ATTR_KEY_LENGTH: u16 = 14;

/// Transform Type (RFC 7296 Section 3.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransformType {
    /// Encryption Algorithm (ENCR)
    Encr = 1,
    /// Pseudo-random Function (PRF)
    Prf = 2,
    /// Integrity Algorithm (INTEG)
    Integ = 3,
    /// Diffie-Hellman Group (D-H)
    Dh = 4,
    /// Extended Sequence Numbers (ESN)
    Esn = 5,
}

impl TransformType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TransformType::Encr),
            2 => Some(TransformType::Prf),
            3 => Some(TransformType::Integ),
            4 => Some(TransformType::Dh),
            5 => Some(TransformType::Esn),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Transform attribute value
///
/// TV attributes (AF bit set) carry a 16-bit value inline, TLV attributes a
/// length-prefixed byte string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// Type/Value format
    Short(u16),
    /// Type/Length/Value format
    Long(Vec<u8>),
}

/// Transform attribute (e.g., key length)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformAttribute {
    /// Attribute type, AF bit stripped
    pub attr_type: u16,
    /// Attribute value
    pub value: AttributeValue,
}

impl TransformAttribute {
    fn to_bytes(&self, out: &mut Vec<u8>) {
        match &self.value {
            AttributeValue::Short(v) => {
                out.extend_from_slice(&(0x8000 | self.attr_type).to_be_bytes());
                out.extend_from_slice(&v.to_be_bytes());
            }
            AttributeValue::Long(v) => {
                out.extend_from_slice(&(self.attr_type & 0x7fff).to_be_bytes());
                out.extend_from_slice(&(v.len() as u16).to_be_bytes());
                out.extend_from_slice(v);
            }
        }
    }

    fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let raw_type = u16::from_be_bytes([data[0], data[1]]);
        let field = u16::from_be_bytes([data[2], data[3]]);

        if raw_type & 0x8000 != 0 {
            return Ok((
                TransformAttribute {
                    attr_type: raw_type & 0x7fff,
                    value: AttributeValue::Short(field),
                },
                4,
            ));
        }

        let len = field as usize;
        if data.len() < 4 + len {
            return Err(Error::BufferTooShort {
                required: 4 + len,
                available: data.len(),
            });
        }
        Ok((
            TransformAttribute {
                attr_type: raw_type,
                value: AttributeValue::Long(data[4..4 + len].to_vec()),
            },
            4 + len,
        ))
    }
}

/// IKE Transform
///
/// Represents a single cryptographic algorithm choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Transform type
    pub transform_type: TransformType,

    /// Transform ID
    pub transform_id: u16,

    /// Attributes (e.g., key length)
    pub attributes: Vec<TransformAttribute>,
}

impl Transform {
    /// Create new transform
    pub fn new(transform_type: TransformType, transform_id: u16) -> Self {
        Transform {
            transform_type,
            transform_id,
            attributes: Vec::new(),
        }
    }

    /// Create encryption transform, adding the key length attribute when needed
    pub fn encr(alg: EncrAlgorithm) -> Self {
        let t = Transform::new(TransformType::Encr, alg.transform_id());
        match alg.key_bits() {
            Some(bits) => t.with_attribute(ATTR_KEY_LENGTH, AttributeValue::Short(bits)),
            None => t,
        }
    }

    /// Create PRF transform
    pub fn prf(alg: PrfAlgorithm) -> Self {
        Transform::new(TransformType::Prf, alg.transform_id())
    }

    /// Create integrity transform
    pub fn integ(alg: IntegAlgorithm) -> Self {
        Transform::new(TransformType::Integ, alg.transform_id())
    }

    /// Create DH group transform
    pub fn dh(group: DhGroup) -> Self {
        Transform::new(TransformType::Dh, group.transform_id())
    }

    /// Create ESN transform
    pub fn esn(enabled: bool) -> Self {
        Transform::new(TransformType::Esn, u16::from(enabled))
    }

    /// Add attribute
    pub fn with_attribute(mut self, attr_type: u16, value: AttributeValue) -> Self {
        self.attributes.push(TransformAttribute { attr_type, value });
        self
    }

    /// Key length attribute in bits, if present
    pub fn key_length(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a.value {
            AttributeValue::Short(v) if a.attr_type == ATTR_KEY_LENGTH => Some(v),
            _ => None,
        })
    }

    /// Check if this transform is compatible with another
    pub fn is_compatible_with(&self, other: &Transform) -> bool {
        self.transform_type == other.transform_type
            && self.transform_id == other.transform_id
            && self.key_length() == other.key_length()
    }

    /// Serialize transform to bytes (RFC 7296 Section 3.3.2)
    ///
    /// Format:
    /// - Byte 0: Last/More flag (0 = last, 3 = more)
    /// - Byte 1: Reserved
    /// - Bytes 2-3: Transform Length (whole substructure)
    /// - Byte 4: Transform Type
    /// - Byte 5: Reserved
    /// - Bytes 6-7: Transform ID
    /// - Bytes 8+: Attributes (if any)
    pub fn to_bytes(&self, is_last: bool) -> Vec<u8> {
        let mut attrs = Vec::new();
        for attr in &self.attributes {
            attr.to_bytes(&mut attrs);
        }
        let total_len = 8 + attrs.len();

        let mut bytes = Vec::with_capacity(total_len);
        bytes.push(if is_last { 0 } else { 3 });
        bytes.push(0);
        bytes.extend_from_slice(&(total_len as u16).to_be_bytes());
        bytes.push(self.transform_type.to_u8());
        bytes.push(0);
        bytes.extend_from_slice(&self.transform_id.to_be_bytes());
        bytes.extend_from_slice(&attrs);
        bytes
    }

    /// Parse transform from bytes
    ///
    /// Returns the transform, whether it was flagged last, and bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, bool, usize)> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }

        let is_last = data[0] == 0;
        let transform_len = u16::from_be_bytes([data[2], data[3]]) as usize;

        if transform_len < 8 {
            return Err(Error::InvalidLength {
                expected: 8,
                actual: transform_len,
            });
        }
        if data.len() < transform_len {
            return Err(Error::BufferTooShort {
                required: transform_len,
                available: data.len(),
            });
        }

        let transform_type = TransformType::from_u8(data[4])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown transform type: {}", data[4])))?;
        let transform_id = u16::from_be_bytes([data[6], data[7]]);

        let mut attributes = Vec::new();
        let mut offset = 8;
        while offset < transform_len {
            let (attr, used) = TransformAttribute::from_bytes(&data[offset..transform_len])?;
            attributes.push(attr);
            offset += used;
        }

        Ok((
            Transform {
                transform_type,
                transform_id,
                attributes,
            },
            is_last,
            transform_len,
        ))
    }
}

/// Protocol ID for proposals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// IKE SA
    Ike = 1,
    /// AH (Authentication Header)
    Ah = 2,
    /// ESP (Encapsulating Security Payload)
    Esp = 3,
}

impl ProtocolId {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProtocolId::Ike),
            2 => Some(ProtocolId::Ah),
            3 => Some(ProtocolId::Esp),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// IKE Proposal
///
/// Represents a single proposal containing one or more transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposal number (1-based)
    pub proposal_num: u8,

    /// Protocol ID (IKE, ESP, AH)
    pub protocol_id: ProtocolId,

    /// SPI - empty for IKE_SA_INIT, 4 bytes for ESP, 8 bytes for IKE rekey
    pub spi: Vec<u8>,

    /// List of transforms
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// Create new proposal
    pub fn new(proposal_num: u8, protocol_id: ProtocolId) -> Self {
        Proposal {
            proposal_num,
            protocol_id,
            spi: Vec::new(),
            transforms: Vec::new(),
        }
    }

    /// Add transform to proposal
    pub fn add_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Set SPI
    pub fn with_spi(mut self, spi: Vec<u8>) -> Self {
        self.spi = spi;
        self
    }

    /// Check if proposal is acceptable given a list of configured proposals
    ///
    /// Returns true if all transforms in this proposal match at least one
    /// configured proposal of the same protocol.
    pub fn is_acceptable(&self, configured: &[Proposal]) -> bool {
        configured
            .iter()
            .filter(|c| c.protocol_id == self.protocol_id)
            .any(|c| {
                self.transforms.iter().all(|ours| {
                    c.transforms
                        .iter()
                        .any(|theirs| ours.is_compatible_with(theirs))
                })
            })
    }

    /// Get transform by type
    pub fn get_transform(&self, transform_type: TransformType) -> Option<&Transform> {
        self.transforms
            .iter()
            .find(|t| t.transform_type == transform_type)
    }

    /// DH group offered in this proposal, if any
    pub fn dh_group_id(&self) -> Option<u16> {
        self.get_transform(TransformType::Dh)
            .map(|t| t.transform_id)
            .filter(|id| *id != 0)
    }

    /// SPI as a 32-bit ESP SPI
    pub fn esp_spi(&self) -> Result<u32> {
        let bytes: [u8; 4] = self.spi.as_slice().try_into().map_err(|_| Error::InvalidLength {
            expected: 4,
            actual: self.spi.len(),
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Serialize proposal to bytes (RFC 7296 Section 3.3.1)
    ///
    /// Format:
    /// - Byte 0: Last/More flag (0 = last, 2 = more)
    /// - Byte 1: Reserved
    /// - Bytes 2-3: Proposal Length (whole substructure)
    /// - Byte 4: Proposal Number
    /// - Byte 5: Protocol ID
    /// - Byte 6: SPI Size
    /// - Byte 7: Num Transforms
    /// - Bytes 8+: SPI (variable)
    /// - Transforms
    pub fn to_bytes(&self, is_last: bool) -> Vec<u8> {
        let count = self.transforms.len();
        let mut transforms = Vec::new();
        for (i, t) in self.transforms.iter().enumerate() {
            transforms.extend_from_slice(&t.to_bytes(i + 1 == count));
        }

        let total_len = 8 + self.spi.len() + transforms.len();
        let mut bytes = Vec::with_capacity(total_len);
        bytes.push(if is_last { 0 } else { 2 });
        bytes.push(0);
        bytes.extend_from_slice(&(total_len as u16).to_be_bytes());
        bytes.push(self.proposal_num);
        bytes.push(self.protocol_id.to_u8());
        bytes.push(self.spi.len() as u8);
        bytes.push(count as u8);
        bytes.extend_from_slice(&self.spi);
        bytes.extend_from_slice(&transforms);
        bytes
    }

    /// Parse proposal from bytes
    ///
    /// Returns the proposal, whether it was flagged last, and bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, bool, usize)> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }

        let is_last = data[0] == 0;
        let proposal_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if proposal_len < 8 {
            return Err(Error::InvalidLength {
                expected: 8,
                actual: proposal_len,
            });
        }
        if data.len() < proposal_len {
            return Err(Error::BufferTooShort {
                required: proposal_len,
                available: data.len(),
            });
        }

        let proposal_num = data[4];
        let protocol_id = ProtocolId::from_u8(data[5])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown protocol ID: {}", data[5])))?;
        let spi_size = data[6] as usize;
        let num_transforms = data[7] as usize;

        if proposal_len < 8 + spi_size {
            return Err(Error::BufferTooShort {
                required: 8 + spi_size,
                available: proposal_len,
            });
        }
        let spi = data[8..8 + spi_size].to_vec();

        let body = &data[..proposal_len];
        let mut transforms = Vec::with_capacity(num_transforms);
        let mut offset = 8 + spi_size;
        for _ in 0..num_transforms {
            let (transform, _, used) = Transform::from_bytes(&body[offset..])?;
            transforms.push(transform);
            offset += used;
        }

        Ok((
            Proposal {
                proposal_num,
                protocol_id,
                spi,
                transforms,
            },
            is_last,
            proposal_len,
        ))
    }
}

/// Encode the body of an SA payload
pub fn encode_proposals(proposals: &[Proposal]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, p) in proposals.iter().enumerate() {
        out.extend_from_slice(&p.to_bytes(i + 1 == proposals.len()));
    }
    out
}

/// Decode the body of an SA payload
pub fn decode_proposals(data: &[u8]) -> Result<Vec<Proposal>> {
    let mut proposals = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (proposal, is_last, used) = Proposal::from_bytes(&data[offset..])?;
        proposals.push(proposal);
        offset += used;
        if is_last {
            break;
        }
    }
    if proposals.is_empty() {
        return Err(Error::InvalidPayload("SA payload without proposals".into()));
    }
    Ok(proposals)
}

/// Select first acceptable proposal from a list
///
/// This implements the proposal selection algorithm from RFC 7296 Section 2.7.
///
/// # Arguments
///
/// * `offered` - Proposals offered by peer
/// * `configured` - Locally configured acceptable proposals
///
/// # Returns
///
/// Returns the first acceptable proposal, or error if none found.
pub fn select_proposal<'a>(
    offered: &'a [Proposal],
    configured: &[Proposal],
) -> Result<&'a Proposal> {
    offered
        .iter()
        .find(|p| p.is_acceptable(configured))
        .ok_or(Error::NoProposalChosen)
}

/// Validate the proposal the peer echoed back against what we offered
///
/// The echoed proposal number must name one of ours and every transform in
/// it must have been part of that offer. The returned proposal carries the
/// peer's SPI.
pub fn accept_proposal(offered: &[Proposal], chosen: &Proposal) -> Result<Proposal> {
    let ours = offered
        .iter()
        .find(|p| p.proposal_num == chosen.proposal_num && p.protocol_id == chosen.protocol_id)
        .ok_or_else(|| {
            Error::InvalidProposal(format!(
                "peer chose proposal {} which was not offered",
                chosen.proposal_num
            ))
        })?;

    if !chosen.is_acceptable(std::slice::from_ref(ours)) {
        return Err(Error::InvalidProposal(format!(
            "peer altered transforms of proposal {}",
            chosen.proposal_num
        )));
    }

    Ok(chosen.clone())
}

/// Keep only proposals carrying `dh_group`, renumbered from 1
///
/// Used after an INVALID_KE_PAYLOAD notify names the group the peer wants.
pub fn filter_by_dh_group(proposals: &[Proposal], dh_group: u16) -> Vec<Proposal> {
    proposals
        .iter()
        .filter(|p| p.dh_group_id() == Some(dh_group))
        .cloned()
        .enumerate()
        .map(|(i, mut p)| {
            p.proposal_num = (i + 1) as u8;
            p
        })
        .collect()
}

/// Algorithms fixed by a negotiated proposal
///
/// Defaults to NULL encryption and no integrity until a proposal is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiatedAlgorithms {
    /// Encryption algorithm and key size
    pub encr: EncrAlgorithm,
    /// Integrity algorithm
    pub integ: IntegAlgorithm,
    /// PRF (IKE SAs only)
    pub prf: Option<PrfAlgorithm>,
    /// DH group, `None` when no (or NONE) group was negotiated
    pub dh: Option<DhGroup>,
    /// Extended sequence numbers (child SAs only)
    pub esn: bool,
}

impl NegotiatedAlgorithms {
    /// Derive the algorithm set from a single accepted proposal
    pub fn from_proposal(proposal: &Proposal) -> Result<Self> {
        let mut set = NegotiatedAlgorithms::default();
        for t in &proposal.transforms {
            match t.transform_type {
                TransformType::Encr => {
                    set.encr = EncrAlgorithm::from_transform(t.transform_id, t.key_length())?
                }
                TransformType::Integ => {
                    set.integ = IntegAlgorithm::from_transform_id(t.transform_id)?
                }
                TransformType::Prf => set.prf = Some(PrfAlgorithm::from_transform_id(t.transform_id)?),
                TransformType::Dh if t.transform_id != 0 => {
                    set.dh = Some(DhGroup::from_transform_id(t.transform_id)?)
                }
                TransformType::Dh => set.dh = None,
                TransformType::Esn => set.esn = t.transform_id == 1,
            }
        }

        if !set.encr.is_aead() && set.integ == IntegAlgorithm::None && set.encr != EncrAlgorithm::Null
        {
            return Err(Error::InvalidProposal(
                "non-AEAD cipher without integrity algorithm".into(),
            ));
        }
        Ok(set)
    }

    /// PRF, required for IKE SAs
    pub fn prf(&self) -> Result<PrfAlgorithm> {
        self.prf
            .ok_or_else(|| Error::InvalidProposal("IKE proposal without PRF".into()))
    }

    /// Encryption key material length (salt included)
    pub fn encr_key_len(&self) -> usize {
        self.encr.keymat_len()
    }

    /// Integrity key length
    pub fn integ_key_len(&self) -> usize {
        self.integ.key_len()
    }
}
