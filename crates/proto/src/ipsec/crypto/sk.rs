//! Encrypted and Authenticated (SK) payload protection
//!
//! Implements RFC 7296 Section 3.14 for CBC + HMAC suites and RFC 5282 for
//! AEAD suites. The payload body is:
//!
//! ```text
//! +---------------+------------------------------+---------------+
//! |  IV           |  Encrypted inner payloads    |  ICV          |
//! |               |  | Padding | Pad Length      |               |
//! +---------------+------------------------------+---------------+
//! ```
//!
//! Which directional keys are used follows the Initiator flag of the
//! message being protected: messages sent by the original initiator use
//! SK_ei / SK_ai, all others SK_er / SK_ar.

use super::cipher::{EncrAlgorithm, AES_BLOCK_SIZE};
use super::prf::{IntegAlgorithm, KeyMaterial};
use crate::ipsec::ikev2::constants::{PayloadType, IKE_HEADER_SIZE, MAX_IKE_MESSAGE_SIZE};
use crate::ipsec::ikev2::message::{IkeHeader, IkeMessage};
use crate::ipsec::ikev2::payload::{decode_chain, encode_chain, IkePayload, PayloadHeader};
use crate::ipsec::{Error, Result};

/// SK payload codec for one negotiated suite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkCodec {
    encr: EncrAlgorithm,
    integ: IntegAlgorithm,
    null_pad_len: usize,
}

impl SkCodec {
    /// Create a codec
    ///
    /// # Errors
    ///
    /// A confidentiality cipher without an integrity algorithm is rejected.
    /// ENCR_NULL with INTEG_NONE is accepted and carries no ICV.
    pub fn new(encr: EncrAlgorithm, integ: IntegAlgorithm) -> Result<Self> {
        if !encr.is_aead() && encr != EncrAlgorithm::Null && integ == IntegAlgorithm::None {
            return Err(Error::InvalidProposal(
                "Integrity algorithm required for non-AEAD cipher".into(),
            ));
        }
        Ok(SkCodec {
            encr,
            integ,
            null_pad_len: 0,
        })
    }

    /// Trailing zero octets placed after the inner payloads under ENCR_NULL
    ///
    /// Peers disagree on whether a pad length octet is present; 0 or 1.
    pub fn with_null_padding(mut self, len: usize) -> Self {
        self.null_pad_len = len;
        self
    }

    /// Negotiated cipher
    pub fn encr(&self) -> EncrAlgorithm {
        self.encr
    }

    /// Negotiated integrity algorithm
    pub fn integ(&self) -> IntegAlgorithm {
        self.integ
    }

    fn icv_len(&self) -> usize {
        if self.encr.is_aead() {
            self.encr.icv_len()
        } else {
            self.integ.icv_len()
        }
    }

    fn directional_keys<'k>(keys: &'k KeyMaterial, header: &IkeHeader) -> (&'k [u8], &'k [u8]) {
        if header.flags.is_initiator() {
            (&keys.sk_ei, &keys.sk_ai)
        } else {
            (&keys.sk_er, &keys.sk_ar)
        }
    }

    fn pad(&self, plain: &mut Vec<u8>) {
        match self.encr {
            EncrAlgorithm::Null => plain.resize(plain.len() + self.null_pad_len, 0),
            EncrAlgorithm::AesCbc { .. } => {
                let pad_len = (AES_BLOCK_SIZE - (plain.len() + 1) % AES_BLOCK_SIZE) % AES_BLOCK_SIZE;
                plain.resize(plain.len() + pad_len, 0);
                plain.push(pad_len as u8);
            }
            _ => plain.push(0),
        }
    }

    fn unpad(&self, mut plain: Vec<u8>) -> Result<Vec<u8>> {
        let strip = match self.encr {
            EncrAlgorithm::Null => self.null_pad_len,
            _ => match plain.last() {
                Some(&pad_len) => pad_len as usize + 1,
                None => return Err(Error::InvalidPayload("Empty SK plaintext".into())),
            },
        };
        if strip > plain.len() {
            return Err(Error::InvalidPayload(format!(
                "SK padding {} exceeds plaintext {}",
                strip,
                plain.len()
            )));
        }
        plain.truncate(plain.len() - strip);
        Ok(plain)
    }

    /// Build a protected message carrying `inner` inside an SK payload
    ///
    /// `next_payload` and `length` of `header` are recomputed.
    pub fn protect(&self, keys: &KeyMaterial, header: &IkeHeader, inner: &[IkePayload]) -> Result<Vec<u8>> {
        let (first, mut plain) = encode_chain(inner);
        self.pad(&mut plain);

        let iv = self.encr.generate_iv();
        let body_len = iv.len() + plain.len() + self.icv_len();
        let total = IKE_HEADER_SIZE + PayloadHeader::SIZE + body_len;
        if total > MAX_IKE_MESSAGE_SIZE as usize {
            return Err(Error::MessageTooLarge(total as u32));
        }

        let mut header = header.clone();
        header.next_payload = PayloadType::SK.to_u8();
        header.length = total as u32;
        let (encr_key, integ_key) = Self::directional_keys(keys, &header);

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(
            &PayloadHeader::new(first, false, (PayloadHeader::SIZE + body_len) as u16).to_bytes(),
        );

        if self.encr.is_aead() {
            let aad = out.clone();
            let sealed = self.encr.encrypt(encr_key, &iv, &plain, &aad)?;
            out.extend_from_slice(&iv);
            out.extend_from_slice(&sealed);
        } else {
            let ciphertext = self.encr.encrypt(encr_key, &iv, &plain, &[])?;
            out.extend_from_slice(&iv);
            out.extend_from_slice(&ciphertext);
            let icv = self.integ.compute(integ_key, &out)?;
            out.extend_from_slice(&icv);
        }

        Ok(out)
    }

    /// Verify and decrypt a protected message
    ///
    /// Returns the message with the SK payload replaced by its decrypted
    /// inner payloads. Unencrypted payloads preceding SK are kept in front.
    ///
    /// # Errors
    ///
    /// [`Error::IntegrityCheckFailed`] when the ICV or AEAD tag does not
    /// verify, [`Error::InvalidMessage`] when the message carries no SK payload.
    pub fn unprotect(&self, keys: &KeyMaterial, data: &[u8]) -> Result<IkeMessage> {
        let outer = IkeMessage::from_bytes(data)?;
        let msg = &data[..outer.header.length as usize];

        let mut payloads = outer.payloads;
        let (first_payload, body) = match payloads.pop() {
            Some(IkePayload::SK {
                first_payload,
                data,
            }) => (first_payload, data),
            _ => return Err(Error::InvalidMessage("Missing SK payload".into())),
        };
        let body_start = msg.len() - body.len();

        let iv_len = self.encr.iv_len();
        let icv_len = self.icv_len();
        if body.len() < iv_len + icv_len {
            return Err(Error::BufferTooShort {
                required: iv_len + icv_len,
                available: body.len(),
            });
        }
        let (encr_key, integ_key) = Self::directional_keys(keys, &outer.header);
        let iv = &body[..iv_len];

        let plain = if self.encr.is_aead() {
            self.encr
                .decrypt(encr_key, iv, &body[iv_len..], &msg[..body_start])?
        } else {
            let icv_start = msg.len() - icv_len;
            self.integ
                .verify(integ_key, &msg[..icv_start], &msg[icv_start..])?;
            self.encr
                .decrypt(encr_key, iv, &body[iv_len..body.len() - icv_len], &[])?
        };

        let plain = self.unpad(plain)?;
        payloads.extend(decode_chain(first_payload, &plain)?);
        Ok(IkeMessage::new(outer.header, payloads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::constants::{notify, ExchangeType, IkeFlags};
    use crate::ipsec::ikev2::payload::{IdPayload, NotifyPayload};

    fn keys(encr_len: usize, integ_len: usize) -> KeyMaterial {
        KeyMaterial {
            sk_d: vec![1; 32],
            sk_ai: vec![2; integ_len],
            sk_ar: vec![3; integ_len],
            sk_ei: vec![4; encr_len],
            sk_er: vec![5; encr_len],
            sk_pi: vec![6; 32],
            sk_pr: vec![7; 32],
        }
    }

    fn header(initiator: bool) -> IkeHeader {
        IkeHeader::new(
            [0x11; 8],
            [0x22; 8],
            PayloadType::None,
            ExchangeType::IkeAuth,
            IkeFlags::request(initiator),
            1,
            0,
        )
    }

    fn inner() -> Vec<IkePayload> {
        vec![
            IkePayload::IDi(IdPayload::from_email("0208930000000001@nai.epc.mnc093.mcc208.3gppnetwork.org")),
            IkePayload::N(NotifyPayload::new(notify::INITIAL_CONTACT, vec![])),
        ]
    }

    fn roundtrip(codec: SkCodec, keys: &KeyMaterial) {
        let bytes = codec.protect(keys, &header(true), &inner()).unwrap();
        assert_eq!(
            u32::from_be_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]) as usize,
            bytes.len()
        );
        assert_eq!(bytes[16], PayloadType::SK.to_u8());
        assert_eq!(bytes[28], PayloadType::IDi.to_u8());

        let msg = codec.unprotect(keys, &bytes).unwrap();
        assert_eq!(msg.payloads, inner());
        assert_eq!(msg.header.message_id, 1);
    }

    #[test]
    fn test_cbc_hmac_roundtrip() {
        let codec = SkCodec::new(
            EncrAlgorithm::AesCbc { key_len: 16 },
            IntegAlgorithm::HmacSha256_128,
        )
        .unwrap();
        roundtrip(codec, &keys(16, 32));

        let codec = SkCodec::new(
            EncrAlgorithm::AesCbc { key_len: 32 },
            IntegAlgorithm::HmacSha1_96,
        )
        .unwrap();
        roundtrip(codec, &keys(32, 20));
    }

    #[test]
    fn test_cbc_padding_is_minimal() {
        let codec = SkCodec::new(
            EncrAlgorithm::AesCbc { key_len: 16 },
            IntegAlgorithm::HmacSha256_128,
        )
        .unwrap();
        for len in [0usize, 14, 15, 16, 31] {
            let mut plain = vec![0xab; len];
            codec.pad(&mut plain);
            assert_eq!(plain.len() % 16, 0);
            assert!(plain.len() - len <= 16);
            assert_eq!(codec.unpad(plain).unwrap().len(), len);
        }
        let mut plain = vec![0xab; 15];
        codec.pad(&mut plain);
        assert_eq!(plain.len(), 16);
        assert_eq!(plain[15], 0);
    }

    #[test]
    fn test_gcm_roundtrip_all_tag_lengths() {
        for icv_len in [8, 12, 16] {
            let encr = EncrAlgorithm::AesGcm { key_len: 16, icv_len };
            let codec = SkCodec::new(encr, IntegAlgorithm::None).unwrap();
            roundtrip(codec, &keys(encr.keymat_len(), 0));
        }
    }

    #[test]
    fn test_chacha_roundtrip() {
        let encr = EncrAlgorithm::ChaCha20Poly1305;
        let codec = SkCodec::new(encr, IntegAlgorithm::None).unwrap();
        roundtrip(codec, &keys(encr.keymat_len(), 0));
    }

    #[test]
    fn test_null_roundtrip_with_and_without_pad_octet() {
        for pad in [0, 1] {
            let codec = SkCodec::new(EncrAlgorithm::Null, IntegAlgorithm::HmacSha1_96)
                .unwrap()
                .with_null_padding(pad);
            roundtrip(codec, &keys(0, 20));
        }
    }

    #[test]
    fn test_null_without_integrity_roundtrip() {
        for pad in [0, 1] {
            let codec = SkCodec::new(EncrAlgorithm::Null, IntegAlgorithm::None)
                .unwrap()
                .with_null_padding(pad);
            assert_eq!(codec.icv_len(), 0);
            let k = keys(0, 0);
            let bytes = codec.protect(&k, &header(true), &inner()).unwrap();
            let mut plain = IkeMessage::new(header(true), inner());
            // SK header + encoded inner chain + padding, nothing else
            let inner_len = plain.to_bytes().unwrap().len() - IKE_HEADER_SIZE;
            assert_eq!(bytes.len(), IKE_HEADER_SIZE + PayloadHeader::SIZE + inner_len + pad);
            roundtrip(codec, &k);
        }
    }

    #[test]
    fn test_cbc_without_integrity_rejected() {
        assert!(SkCodec::new(EncrAlgorithm::AesCbc { key_len: 16 }, IntegAlgorithm::None).is_err());
    }

    #[test]
    fn test_tampered_icv_rejected() {
        let codec = SkCodec::new(
            EncrAlgorithm::AesCbc { key_len: 16 },
            IntegAlgorithm::HmacSha256_128,
        )
        .unwrap();
        let k = keys(16, 32);
        let mut bytes = codec.protect(&k, &header(true), &inner()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            codec.unprotect(&k, &bytes),
            Err(Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn test_tampered_aead_header_rejected() {
        let encr = EncrAlgorithm::AesGcm { key_len: 32, icv_len: 16 };
        let codec = SkCodec::new(encr, IntegAlgorithm::None).unwrap();
        let k = keys(encr.keymat_len(), 0);
        let mut bytes = codec.protect(&k, &header(true), &inner()).unwrap();
        // message id is covered by the AAD
        bytes[23] ^= 0x01;
        assert!(codec.unprotect(&k, &bytes).is_err());
    }

    #[test]
    fn test_direction_selects_keys() {
        let codec = SkCodec::new(
            EncrAlgorithm::AesCbc { key_len: 16 },
            IntegAlgorithm::HmacSha256_128,
        )
        .unwrap();
        let k = keys(16, 32);
        let bytes = codec.protect(&k, &header(false), &inner()).unwrap();

        // responder keys verify, initiator keys do not
        assert!(codec.unprotect(&k, &bytes).is_ok());
        let mut swapped = k.clone();
        swapped.sk_ar = k.sk_ai.clone();
        assert!(matches!(
            codec.unprotect(&swapped, &bytes),
            Err(Error::IntegrityCheckFailed)
        ));
    }

    #[test]
    fn test_unprotected_message_rejected() {
        let codec = SkCodec::new(EncrAlgorithm::Null, IntegAlgorithm::HmacSha1_96).unwrap();
        let mut plain = IkeMessage::new(header(true), inner());
        let bytes = plain.to_bytes().unwrap();
        assert!(matches!(
            codec.unprotect(&keys(0, 20), &bytes),
            Err(Error::InvalidMessage(_))
        ));
    }
}
