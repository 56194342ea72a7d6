//! ESP (Encapsulating Security Payload) Protocol
//!
//! Implements RFC 4303 - IP Encapsulating Security Payload (ESP).
//!
//! # ESP Packet Format (RFC 4303)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |               Security Parameters Index (SPI)                 | ^Auth
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |Cov-
//! |                      Sequence Number                          | |erage
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ | ----
//! |                    Payload Data (variable)                    | |  ^
//! ~                                                               ~ |  |
//! |                                                               | |Conf.
//! +               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |Cov-
//! |               |     Padding (0-255 bytes)                     | |erage
//! +-+-+-+-+-+-+-+-+               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |  |
//! |                               |  Pad Length   | Next Header   | v  v
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |         Integrity Check Value-ICV   (variable)                |
//! ~                                                               ~
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! # CBC + HMAC
//!
//! The IV is a random block carried after the sequence number. The ICV is
//! the truncated HMAC over SPI, sequence number, IV and ciphertext.
//!
//! # AEAD Mode (AES-GCM, ChaCha20-Poly1305)
//!
//! - 8-byte explicit IV carried after the sequence number
//! - Authentication tag appended after encrypted data, no separate ICV
//! - AAD is SPI and sequence number

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ipsec::{
    crypto::{EncrAlgorithm, IntegAlgorithm},
    Error, Result,
};

/// Next header value for an IPv4 inner packet
pub const NEXT_HEADER_IPV4: u8 = 4;

/// Next header value for an IPv6 inner packet
pub const NEXT_HEADER_IPV6: u8 = 41;

/// ESP Packet
///
/// Represents an ESP packet as defined in RFC 4303.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EspPacket {
    /// Security Parameters Index (SPI)
    pub spi: u32,

    /// Sequence Number
    pub sequence: u32,

    /// Initialization Vector (IV)
    ///
    /// 16 bytes for AES-CBC, 8 bytes for AEAD ciphers, empty for NULL.
    pub iv: Vec<u8>,

    /// Encrypted payload, padding and trailer
    ///
    /// For AEAD ciphers, also includes authentication tag at the end.
    pub encrypted_data: Vec<u8>,

    /// Integrity Check Value (ICV)
    ///
    /// None for AEAD ciphers, whose tag is part of `encrypted_data`.
    pub icv: Option<Vec<u8>>,
}

impl EspPacket {
    /// Create new ESP packet
    pub fn new(
        spi: u32,
        sequence: u32,
        iv: Vec<u8>,
        encrypted_data: Vec<u8>,
        icv: Option<Vec<u8>>,
    ) -> Self {
        EspPacket {
            spi,
            sequence,
            iv,
            encrypted_data,
            icv,
        }
    }

    /// Serialize ESP packet to bytes
    ///
    /// ```text
    /// | SPI (4) | Sequence (4) | IV (variable) | Encrypted Data (variable) | [ICV (variable)] |
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        bytes.extend_from_slice(&self.spi.to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.encrypted_data);
        if let Some(icv) = &self.icv {
            bytes.extend_from_slice(icv);
        }
        bytes
    }

    /// Parse ESP packet from bytes
    ///
    /// # Arguments
    ///
    /// * `data` - Raw ESP packet bytes
    /// * `iv_len` - Expected IV length
    /// * `icv_len` - Separate ICV length (0 for AEAD)
    ///
    /// # Errors
    ///
    /// - `BufferTooShort` if packet is too short
    pub fn from_bytes(data: &[u8], iv_len: usize, icv_len: usize) -> Result<Self> {
        let min_len = 8 + iv_len + icv_len;
        if data.len() < min_len {
            return Err(Error::BufferTooShort {
                required: min_len,
                available: data.len(),
            });
        }

        let spi = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let sequence = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let iv = data[8..8 + iv_len].to_vec();

        let encrypted_start = 8 + iv_len;
        let encrypted_end = data.len() - icv_len;
        let encrypted_data = data[encrypted_start..encrypted_end].to_vec();

        let icv = if icv_len > 0 {
            Some(data[encrypted_end..].to_vec())
        } else {
            None
        };

        Ok(EspPacket {
            spi,
            sequence,
            iv,
            encrypted_data,
            icv,
        })
    }

    /// Get total packet length
    pub fn len(&self) -> usize {
        8 + self.iv.len() + self.encrypted_data.len() + self.icv.as_ref().map_or(0, |i| i.len())
    }

    /// Check if packet is empty (never true, SPI and sequence are always present)
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Bytes covered by the ICV
    fn authenticated_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.iv.len() + self.encrypted_data.len());
        bytes.extend_from_slice(&self.spi.to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.encrypted_data);
        bytes
    }
}

/// Read the SPI of an ESP packet without parsing the rest
pub fn peek_spi(data: &[u8]) -> Option<u32> {
    let spi: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(spi))
}

/// One direction of an ESP Security Association
///
/// Outbound SAs hold the sequence counter; it starts at 1 and never wraps.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EspSa {
    /// SPI carried in packets of this direction
    #[zeroize(skip)]
    pub spi: u32,
    #[zeroize(skip)]
    encr: EncrAlgorithm,
    #[zeroize(skip)]
    integ: IntegAlgorithm,
    encr_key: Vec<u8>,
    integ_key: Vec<u8>,
    #[zeroize(skip)]
    last_sequence: u32,
}

impl std::fmt::Debug for EspSa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EspSa")
            .field("spi", &format_args!("{:#010x}", self.spi))
            .field("encr", &self.encr)
            .field("integ", &self.integ)
            .field("last_sequence", &self.last_sequence)
            .finish()
    }
}

impl PartialEq for EspSa {
    fn eq(&self, other: &Self) -> bool {
        self.spi == other.spi
            && self.encr == other.encr
            && self.integ == other.integ
            && self.encr_key == other.encr_key
            && self.integ_key == other.integ_key
    }
}

impl EspSa {
    /// Create an SA
    ///
    /// # Errors
    ///
    /// Rejects keys whose length does not match the algorithms, and a
    /// non-AEAD cipher without integrity protection.
    pub fn new(
        spi: u32,
        encr: EncrAlgorithm,
        integ: IntegAlgorithm,
        encr_key: Vec<u8>,
        integ_key: Vec<u8>,
    ) -> Result<Self> {
        if encr_key.len() != encr.keymat_len() {
            return Err(Error::InvalidKeyLength {
                expected: encr.keymat_len(),
                actual: encr_key.len(),
            });
        }
        if integ_key.len() != integ.key_len() {
            return Err(Error::InvalidKeyLength {
                expected: integ.key_len(),
                actual: integ_key.len(),
            });
        }
        if encr.is_aead() && integ != IntegAlgorithm::None {
            return Err(Error::InvalidProposal(
                "AEAD cipher combined with integrity algorithm".into(),
            ));
        }
        Ok(EspSa {
            spi,
            encr,
            integ,
            encr_key,
            integ_key,
            last_sequence: 0,
        })
    }

    /// Encryption algorithm
    pub fn encr(&self) -> EncrAlgorithm {
        self.encr
    }

    /// Integrity algorithm
    pub fn integ(&self) -> IntegAlgorithm {
        self.integ
    }

    /// Encryption key (salt included for AEAD)
    pub(crate) fn encr_key(&self) -> &[u8] {
        &self.encr_key
    }

    /// Integrity key
    pub(crate) fn integ_key(&self) -> &[u8] {
        &self.integ_key
    }

    /// Sequence number of the last packet sent
    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    fn block_size(&self) -> usize {
        match self.encr {
            EncrAlgorithm::AesCbc { .. } => self.encr.block_size(),
            _ => 4,
        }
    }

    /// Encapsulate (encrypt) a packet
    ///
    /// # Arguments
    ///
    /// * `payload` - Inner IP packet
    /// * `next_header` - Protocol of the inner packet (4 = IPv4, 41 = IPv6)
    ///
    /// # Errors
    ///
    /// - `InvalidState` when the sequence number space is exhausted
    /// - `CryptoError` if encryption fails
    pub fn encapsulate(&mut self, payload: &[u8], next_header: u8) -> Result<Vec<u8>> {
        let sequence = self.last_sequence.checked_add(1).ok_or_else(|| {
            Error::InvalidState("ESP sequence number exhausted, SA must be rekeyed".into())
        })?;

        let pad_len = calculate_padding(payload.len(), self.block_size());
        let mut plaintext = Vec::with_capacity(payload.len() + pad_len + 2);
        plaintext.extend_from_slice(payload);
        // RFC 4303 default padding: 1, 2, 3, ...
        plaintext.extend((1..=pad_len).map(|i| i as u8));
        plaintext.push(pad_len as u8);
        plaintext.push(next_header);

        let iv = self.encr.generate_iv();
        let mut aad = [0u8; 8];
        aad[..4].copy_from_slice(&self.spi.to_be_bytes());
        aad[4..].copy_from_slice(&sequence.to_be_bytes());

        let encrypted_data = self.encr.encrypt(&self.encr_key, &iv, &plaintext, &aad)?;
        let mut packet = EspPacket::new(self.spi, sequence, iv, encrypted_data, None);
        if !self.encr.is_aead() {
            packet.icv = Some(self.integ.compute(&self.integ_key, &packet.authenticated_bytes())?);
        }

        self.last_sequence = sequence;
        crate::ipsec::logging::log_esp_packet("encrypt", self.spi, sequence, payload.len());
        Ok(packet.to_bytes())
    }

    /// Decapsulate (verify and decrypt) a packet
    ///
    /// Returns the inner packet and its next header value.
    ///
    /// # Errors
    ///
    /// - `InvalidSpi` if the packet belongs to another SA
    /// - `IntegrityCheckFailed` if the ICV or tag does not verify
    /// - `InvalidLength` if the trailer is malformed
    pub fn decapsulate(&self, data: &[u8]) -> Result<(Vec<u8>, u8)> {
        let icv_len = if self.encr.is_aead() {
            0
        } else {
            self.integ.icv_len()
        };
        let packet = EspPacket::from_bytes(data, self.encr.iv_len(), icv_len)?;

        if packet.spi != self.spi {
            return Err(Error::InvalidSpi(packet.spi));
        }

        if let Some(icv) = &packet.icv {
            self.integ
                .verify(&self.integ_key, &packet.authenticated_bytes(), icv)?;
        }

        let mut aad = [0u8; 8];
        aad[..4].copy_from_slice(&packet.spi.to_be_bytes());
        aad[4..].copy_from_slice(&packet.sequence.to_be_bytes());
        let plaintext = self
            .encr
            .decrypt(&self.encr_key, &packet.iv, &packet.encrypted_data, &aad)?;

        if plaintext.len() < 2 {
            return Err(Error::InvalidLength {
                expected: 2,
                actual: plaintext.len(),
            });
        }

        let pad_len = plaintext[plaintext.len() - 2] as usize;
        let next_header = plaintext[plaintext.len() - 1];
        if pad_len + 2 > plaintext.len() {
            return Err(Error::InvalidLength {
                expected: pad_len + 2,
                actual: plaintext.len(),
            });
        }

        let payload = plaintext[..plaintext.len() - pad_len - 2].to_vec();
        crate::ipsec::logging::log_esp_packet("decrypt", self.spi, packet.sequence, payload.len());
        Ok((payload, next_header))
    }
}

/// Calculate padding length needed for ESP
///
/// # Arguments
///
/// * `payload_len` - Length of the inner packet
/// * `block_size` - Alignment of payload + padding + 2-byte trailer
///
/// # Formula
///
/// ```text
/// (payload_len + pad_len + 2) % block_size == 0
/// ```
pub fn calculate_padding(payload_len: usize, block_size: usize) -> usize {
    let total_with_trailer = payload_len + 2;
    let remainder = total_with_trailer % block_size;
    if remainder == 0 {
        0
    } else {
        block_size - remainder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cbc_sa(spi: u32) -> EspSa {
        EspSa::new(
            spi,
            EncrAlgorithm::AesCbc { key_len: 16 },
            IntegAlgorithm::HmacSha1_96,
            vec![0x11; 16],
            vec![0x22; 20],
        )
        .unwrap()
    }

    fn gcm_sa(spi: u32, icv_len: usize) -> EspSa {
        let encr = EncrAlgorithm::AesGcm { key_len: 16, icv_len };
        EspSa::new(spi, encr, IntegAlgorithm::None, vec![0x33; encr.keymat_len()], vec![]).unwrap()
    }

    #[test]
    fn test_esp_packet_serialization_aead() {
        let iv = vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let esp = EspPacket::new(0x11223344, 1, iv.clone(), vec![0xAA; 48], None);
        let bytes = esp.to_bytes();

        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[0..4], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&bytes[4..8], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&bytes[8..16], &iv[..]);
        assert_eq!(EspPacket::from_bytes(&bytes, 8, 0).unwrap(), esp);
    }

    #[test]
    fn test_esp_packet_serialization_non_aead() {
        let esp = EspPacket::new(0xAABBCCDD, 999, vec![0xFF; 16], vec![0x55; 32], Some(vec![0x77; 12]));
        let bytes = esp.to_bytes();
        assert_eq!(bytes.len(), 8 + 16 + 32 + 12);
        assert_eq!(esp.len(), bytes.len());
        assert_eq!(EspPacket::from_bytes(&bytes, 16, 12).unwrap(), esp);
    }

    #[test]
    fn test_esp_packet_too_short() {
        assert!(matches!(
            EspPacket::from_bytes(&[0u8; 20], 16, 12),
            Err(Error::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_calculate_padding() {
        assert_eq!(calculate_padding(14, 16), 0);
        assert_eq!(calculate_padding(15, 16), 15);
        assert_eq!(calculate_padding(0, 16), 14);
        assert_eq!(calculate_padding(2, 4), 0);
        assert_eq!(calculate_padding(3, 4), 3);
    }

    #[test]
    fn test_cbc_roundtrip_many_lengths() {
        let mut out = cbc_sa(0x1000);
        let inb = cbc_sa(0x1000);
        for len in [1usize, 13, 14, 15, 16, 17, 100, 1400, 1500] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let bytes = out.encapsulate(&payload, NEXT_HEADER_IPV4).unwrap();
            assert_eq!((bytes.len() - 8 - 16 - 12) % 16, 0);
            let (decrypted, nh) = inb.decapsulate(&bytes).unwrap();
            assert_eq!(decrypted, payload);
            assert_eq!(nh, NEXT_HEADER_IPV4);
        }
    }

    #[test]
    fn test_gcm_roundtrip_all_tags() {
        for icv_len in [8, 12, 16] {
            let mut out = gcm_sa(0x2000, icv_len);
            let inb = gcm_sa(0x2000, icv_len);
            for len in [1usize, 2, 3, 64, 1500] {
                let payload = vec![0x5a; len];
                let bytes = out.encapsulate(&payload, NEXT_HEADER_IPV6).unwrap();
                assert_eq!(inb.decapsulate(&bytes).unwrap(), (payload, NEXT_HEADER_IPV6));
            }
        }
    }

    #[test]
    fn test_null_encryption_roundtrip() {
        let mut out = EspSa::new(
            7,
            EncrAlgorithm::Null,
            IntegAlgorithm::HmacSha256_128,
            vec![],
            vec![0x44; 32],
        )
        .unwrap();
        let inb = out.clone();
        let bytes = out.encapsulate(b"plain", NEXT_HEADER_IPV4).unwrap();
        assert_eq!(&bytes[8..13], b"plain");
        assert_eq!(inb.decapsulate(&bytes).unwrap().0, b"plain".to_vec());
    }

    #[test]
    fn test_sequence_starts_at_one() {
        let mut out = cbc_sa(1);
        let first = out.encapsulate(b"a", NEXT_HEADER_IPV4).unwrap();
        let second = out.encapsulate(b"b", NEXT_HEADER_IPV4).unwrap();
        assert_eq!(&first[4..8], &1u32.to_be_bytes());
        assert_eq!(&second[4..8], &2u32.to_be_bytes());
        assert_eq!(out.last_sequence(), 2);
        assert_eq!(peek_spi(&first), Some(1));
        assert_eq!(peek_spi(&[0, 1]), None);
    }

    #[test]
    fn test_tampered_packet_rejected() {
        let mut out = cbc_sa(9);
        let inb = cbc_sa(9);
        let mut bytes = out.encapsulate(&[1; 40], NEXT_HEADER_IPV4).unwrap();
        bytes[30] ^= 0x80;
        assert!(matches!(inb.decapsulate(&bytes), Err(Error::IntegrityCheckFailed)));

        let mut out = gcm_sa(9, 16);
        let inb = gcm_sa(9, 16);
        let mut bytes = out.encapsulate(&[1; 40], NEXT_HEADER_IPV4).unwrap();
        // sequence number is authenticated data
        bytes[7] ^= 0x01;
        assert!(inb.decapsulate(&bytes).is_err());
    }

    #[test]
    fn test_wrong_spi_rejected() {
        let mut out = cbc_sa(1);
        let bytes = out.encapsulate(b"x", NEXT_HEADER_IPV4).unwrap();
        assert!(matches!(cbc_sa(2).decapsulate(&bytes), Err(Error::InvalidSpi(1))));
    }

    #[test]
    fn test_key_length_validation() {
        assert!(EspSa::new(
            1,
            EncrAlgorithm::AesCbc { key_len: 16 },
            IntegAlgorithm::HmacSha1_96,
            vec![0; 15],
            vec![0; 20]
        )
        .is_err());
        assert!(EspSa::new(
            1,
            EncrAlgorithm::AesGcm { key_len: 16, icv_len: 16 },
            IntegAlgorithm::HmacSha1_96,
            vec![0; 20],
            vec![0; 20]
        )
        .is_err());
    }
}
