//! IKEv2 message structures and parsing
//!
//! Implements the IKE message format defined in RFC 7296 Section 3.1

use super::constants::*;
use super::payload::{decode_chain, encode_chain, IkePayload, NotifyPayload};
use crate::ipsec::{Error, Result};

/// IKE message header (28 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Initiator's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       IKE SA Responder's SPI                  |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          Message ID                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                            Length                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IkeHeader {
    /// Initiator's Security Parameter Index (8 bytes)
    pub initiator_spi: [u8; 8],

    /// Responder's Security Parameter Index (8 bytes, zero for IKE_SA_INIT request)
    pub responder_spi: [u8; 8],

    /// Type of the first payload, kept raw so an unknown type reaches the
    /// chain decoder as [`IkePayload::Unknown`]
    pub next_payload: u8,

    /// Protocol version (must be 0x20 for IKEv2)
    pub version: u8,

    /// Exchange type
    pub exchange_type: ExchangeType,

    /// Message flags
    pub flags: IkeFlags,

    /// Message ID (used for replay protection and matching)
    pub message_id: u32,

    /// Total message length in bytes (including header)
    pub length: u32,
}

impl IkeHeader {
    /// Create a new IKE header
    pub fn new(
        initiator_spi: [u8; 8],
        responder_spi: [u8; 8],
        next_payload: PayloadType,
        exchange_type: ExchangeType,
        flags: IkeFlags,
        message_id: u32,
        length: u32,
    ) -> Self {
        IkeHeader {
            initiator_spi,
            responder_spi,
            next_payload: next_payload.to_u8(),
            version: IKE_VERSION,
            exchange_type,
            flags,
            message_id,
            length,
        }
    }

    /// Parse the fixed header of a datagram
    ///
    /// Only the header is looked at; the caller checks `length` against
    /// the datagram.
    ///
    /// # Errors
    ///
    /// Short buffer, a version other than 2.0, an exchange type the UE
    /// does not know, or a length outside `28..=MAX_IKE_MESSAGE_SIZE`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let fixed: &[u8; IKE_HEADER_SIZE] = data
            .get(..IKE_HEADER_SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or(Error::BufferTooShort {
                required: IKE_HEADER_SIZE,
                available: data.len(),
            })?;

        let word = |at: usize| u32::from_be_bytes([fixed[at], fixed[at + 1], fixed[at + 2], fixed[at + 3]]);
        let spi = |at: usize| {
            let mut out = [0u8; 8];
            out.copy_from_slice(&fixed[at..at + 8]);
            out
        };

        if fixed[17] != IKE_VERSION {
            return Err(Error::UnsupportedVersion(fixed[17]));
        }
        let header = IkeHeader {
            initiator_spi: spi(0),
            responder_spi: spi(8),
            next_payload: fixed[16],
            version: fixed[17],
            exchange_type: ExchangeType::from_u8(fixed[18])
                .ok_or(Error::UnsupportedExchangeType(fixed[18]))?,
            flags: IkeFlags::new(fixed[19]),
            message_id: word(20),
            length: word(24),
        };
        header.validate()?;
        Ok(header)
    }

    /// Encode the 28 header bytes
    pub fn to_bytes(&self) -> [u8; IKE_HEADER_SIZE] {
        let mut bytes = [0u8; IKE_HEADER_SIZE];
        bytes[..8].copy_from_slice(&self.initiator_spi);
        bytes[8..16].copy_from_slice(&self.responder_spi);
        bytes[16..20].copy_from_slice(&[
            self.next_payload,
            self.version,
            self.exchange_type.to_u8(),
            self.flags.value(),
        ]);
        bytes[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        bytes[24..].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Check version and length bounds
    pub fn validate(&self) -> Result<()> {
        if self.version != IKE_VERSION {
            return Err(Error::UnsupportedVersion(self.version));
        }
        match self.length {
            len if len > MAX_IKE_MESSAGE_SIZE => Err(Error::MessageTooLarge(len)),
            len if len < IKE_HEADER_SIZE as u32 => Err(Error::InvalidLength {
                expected: IKE_HEADER_SIZE,
                actual: len as usize,
            }),
            _ => Ok(()),
        }
    }

    /// Whether this header belongs to the IKE SA identified by `spi_i`/`spi_r`
    ///
    /// A zero responder SPI in our table matches anything, which is the
    /// case while IKE_SA_INIT is outstanding.
    pub fn belongs_to(&self, spi_i: &[u8; 8], spi_r: &[u8; 8]) -> bool {
        self.initiator_spi == *spi_i && (*spi_r == [0u8; 8] || self.responder_spi == *spi_r)
    }
}

/// A complete IKE message: header plus the decoded payload chain
///
/// When the message is protected the chain ends with an
/// [`IkePayload::SK`] still holding ciphertext; see
/// [`crate::ipsec::crypto::SkCodec`] for the inner payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct IkeMessage {
    /// Message header
    pub header: IkeHeader,

    /// Payloads in wire order
    pub payloads: Vec<IkePayload>,
}

impl IkeMessage {
    /// Create a message; `next_payload` and `length` are fixed on encode
    pub fn new(header: IkeHeader, payloads: Vec<IkePayload>) -> Self {
        IkeMessage { header, payloads }
    }

    /// Serialize, patching the first payload type and total length
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let (first, body) = encode_chain(&self.payloads);
        self.header.next_payload = first;

        let total = IKE_HEADER_SIZE + body.len();
        if total > MAX_IKE_MESSAGE_SIZE as usize {
            return Err(Error::MessageTooLarge(total as u32));
        }
        self.header.length = total as u32;

        let mut bytes = Vec::with_capacity(total);
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    /// Parse a message
    ///
    /// Trailing bytes beyond the header length are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let header = IkeHeader::from_bytes(data)?;
        let length = header.length as usize;
        if length > data.len() {
            return Err(Error::BufferTooShort {
                required: length,
                available: data.len(),
            });
        }

        let payloads = decode_chain(header.next_payload, &data[IKE_HEADER_SIZE..length])?;
        Ok(IkeMessage { header, payloads })
    }

    /// Whether the payload chain ends in an SK payload
    pub fn is_protected(&self) -> bool {
        matches!(self.payloads.last(), Some(IkePayload::SK { .. }))
    }

    /// All notify payloads
    pub fn notifies(&self) -> impl Iterator<Item = &NotifyPayload> {
        self.payloads.iter().filter_map(|p| match p {
            IkePayload::N(n) => Some(n),
            _ => None,
        })
    }

    /// First notify of a given type
    pub fn notify(&self, notify_type: u16) -> Option<&NotifyPayload> {
        self.notifies().find(|n| n.notify_type == notify_type)
    }

    /// First error notify, if any
    pub fn error_notify(&self) -> Option<&NotifyPayload> {
        self.notifies().find(|n| n.is_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::constants::notify;
    use crate::ipsec::ikev2::payload::NoncePayload;

    fn header_bytes(version: u8, exchange: u8, length: u32) -> Vec<u8> {
        let mut data = vec![0u8; IKE_HEADER_SIZE];
        data[..8].copy_from_slice(&[0xa1; 8]);
        data[16] = 33;
        data[17] = version;
        data[18] = exchange;
        data[19] = 0x08;
        data[20..24].copy_from_slice(&1u32.to_be_bytes());
        data[24..28].copy_from_slice(&length.to_be_bytes());
        data
    }

    #[test]
    fn test_ue_init_request_header() {
        let header = IkeHeader::from_bytes(&header_bytes(0x20, 34, 320)).unwrap();
        assert_eq!(header.initiator_spi, [0xa1; 8]);
        assert_eq!(header.responder_spi, [0; 8]);
        assert_eq!(header.next_payload, PayloadType::SA.to_u8());
        assert_eq!(header.exchange_type, ExchangeType::IkeSaInit);
        assert!(header.flags.is_initiator());
        assert!(!header.flags.is_response());
        assert_eq!(header.message_id, 1);
        assert_eq!(header.length, 320);
        assert_eq!(header.to_bytes().to_vec(), header_bytes(0x20, 34, 320));
    }

    #[test]
    fn test_header_rejections() {
        assert!(matches!(
            IkeHeader::from_bytes(&[0u8; 27]),
            Err(Error::BufferTooShort { required: 28, available: 27 })
        ));
        assert!(matches!(
            IkeHeader::from_bytes(&header_bytes(0x10, 34, 100)),
            Err(Error::UnsupportedVersion(0x10))
        ));
        assert!(matches!(
            IkeHeader::from_bytes(&header_bytes(0x20, 99, 100)),
            Err(Error::UnsupportedExchangeType(99))
        ));
        assert!(matches!(
            IkeHeader::from_bytes(&header_bytes(0x20, 37, 70000)),
            Err(Error::MessageTooLarge(70000))
        ));
        assert!(matches!(
            IkeHeader::from_bytes(&header_bytes(0x20, 37, 20)),
            Err(Error::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_belongs_to() {
        let header = IkeHeader::from_bytes(&header_bytes(0x20, 35, 100)).unwrap();
        assert!(header.belongs_to(&[0xa1; 8], &[0; 8]));
        assert!(!header.belongs_to(&[0xa1; 8], &[0x5a; 8]));
        assert!(!header.belongs_to(&[0xa2; 8], &[0; 8]));
    }

    #[test]
    fn test_message_roundtrip() {
        let header = IkeHeader::new(
            [7; 8],
            [0; 8],
            PayloadType::None,
            ExchangeType::IkeSaInit,
            IkeFlags::request(true),
            0,
            0,
        );
        let mut msg = IkeMessage::new(
            header,
            vec![
                IkePayload::Nonce(NoncePayload::new(vec![1; 16]).unwrap()),
                IkePayload::N(NotifyPayload::new(notify::COOKIE, vec![2; 8])),
            ],
        );
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes.len(), 28 + 20 + 16);
        assert_eq!(msg.header.length, 64);
        assert_eq!(msg.header.next_payload, PayloadType::Nonce.to_u8());

        let parsed = IkeMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, msg);
        assert!(!parsed.is_protected());
        assert_eq!(parsed.notify(notify::COOKIE).unwrap().data, vec![2; 8]);
        assert!(parsed.error_notify().is_none());
    }

    #[test]
    fn test_unknown_first_payload_is_kept() {
        // private-use payload type 50 ahead of a Nonce
        let mut data = header_bytes(0x20, 37, 28 + 8 + 20);
        data[16] = 50;
        data.extend_from_slice(&[40, 0, 0, 8, 0xde, 0xad, 0xbe, 0xef]);
        data.extend_from_slice(&[0, 0, 0, 20]);
        data.extend_from_slice(&[3; 16]);

        let header = IkeHeader::from_bytes(&data).unwrap();
        assert_eq!(header.next_payload, 50);
        let mut msg = IkeMessage::from_bytes(&data).unwrap();
        assert_eq!(msg.payloads.len(), 2);
        assert_eq!(
            msg.payloads[0],
            IkePayload::Unknown {
                payload_type: 50,
                data: vec![0xde, 0xad, 0xbe, 0xef],
            }
        );
        assert!(matches!(msg.payloads[1], IkePayload::Nonce(_)));
        assert_eq!(msg.to_bytes().unwrap(), data);
    }

    #[test]
    fn test_message_truncated() {
        let mut msg = IkeMessage::new(
            IkeHeader::new(
                [7; 8],
                [0; 8],
                PayloadType::None,
                ExchangeType::Informational,
                IkeFlags::request(true),
                3,
                0,
            ),
            vec![IkePayload::Nonce(NoncePayload::new(vec![1; 16]).unwrap())],
        );
        let bytes = msg.to_bytes().unwrap();
        assert!(matches!(
            IkeMessage::from_bytes(&bytes[..40]),
            Err(Error::BufferTooShort { .. })
        ));
    }
}
