//! Pseudo-Random Function (PRF) and integrity implementations
//!
//! Implements the PRF algorithms and prf+ expansion used by IKEv2 key
//! derivation (RFC 7296 Section 2.13), the truncated HMAC integrity
//! transforms used by the SK payload and ESP, and the IKE and child SA
//! key material splits.

use crate::ipsec::{Error, Result};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

macro_rules! hmac_digest {
    ($digest:ty, $key:expr, $data:expr) => {{
        let mut mac = <Hmac<$digest> as Mac>::new_from_slice($key)
            .map_err(|e| Error::CryptoError(format!("HMAC key rejected: {}", e)))?;
        mac.update($data);
        mac.finalize().into_bytes().to_vec()
    }};
}

/// HMAC-SHA1 over `data`
pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    Ok(hmac_digest!(Sha1, key, data))
}

/// HMAC-SHA256 over `data`
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    Ok(hmac_digest!(Sha256, key, data))
}

/// PRF algorithm (IKEv2 transform type 2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrfAlgorithm {
    /// PRF_HMAC_MD5
    HmacMd5,
    /// PRF_HMAC_SHA1
    HmacSha1,
    /// PRF_HMAC_SHA2_256
    HmacSha256,
    /// PRF_HMAC_SHA2_384
    HmacSha384,
    /// PRF_HMAC_SHA2_512
    HmacSha512,
}

impl PrfAlgorithm {
    /// Map an IKEv2 PRF transform ID
    pub fn from_transform_id(id: u16) -> Result<Self> {
        match id {
            1 => Ok(PrfAlgorithm::HmacMd5),
            2 => Ok(PrfAlgorithm::HmacSha1),
            5 => Ok(PrfAlgorithm::HmacSha256),
            6 => Ok(PrfAlgorithm::HmacSha384),
            7 => Ok(PrfAlgorithm::HmacSha512),
            other => Err(Error::UnsupportedAlgorithm(format!("PRF transform {}", other))),
        }
    }

    /// IKEv2 PRF transform ID
    pub fn transform_id(self) -> u16 {
        match self {
            PrfAlgorithm::HmacMd5 => 1,
            PrfAlgorithm::HmacSha1 => 2,
            PrfAlgorithm::HmacSha256 => 5,
            PrfAlgorithm::HmacSha384 => 6,
            PrfAlgorithm::HmacSha512 => 7,
        }
    }

    /// Get PRF output length in bytes
    ///
    /// This is also the preferred key length used for SK_d, SK_pi and SK_pr.
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacMd5 => 16,
            PrfAlgorithm::HmacSha1 => 20,
            PrfAlgorithm::HmacSha256 => 32,
            PrfAlgorithm::HmacSha384 => 48,
            PrfAlgorithm::HmacSha512 => 64,
        }
    }

    /// Compute PRF
    ///
    /// # Arguments
    ///
    /// * `key` - PRF key
    /// * `data` - Input data
    ///
    /// # Returns
    ///
    /// Returns PRF output
    pub fn compute(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let out = match self {
            PrfAlgorithm::HmacMd5 => hmac_digest!(Md5, key, data),
            PrfAlgorithm::HmacSha1 => hmac_digest!(Sha1, key, data),
            PrfAlgorithm::HmacSha256 => hmac_digest!(Sha256, key, data),
            PrfAlgorithm::HmacSha384 => hmac_digest!(Sha384, key, data),
            PrfAlgorithm::HmacSha512 => hmac_digest!(Sha512, key, data),
        };
        Ok(out)
    }

    /// Compute prf+ (key expansion function)
    ///
    /// Defined in RFC 7296 Section 2.13:
    /// ```text
    /// prf+ (K,S) = T1 | T2 | T3 | T4 | ...
    ///
    /// where:
    /// T1 = prf (K, S | 0x01)
    /// T2 = prf (K, T1 | S | 0x02)
    /// T3 = prf (K, T2 | S | 0x03)
    /// ...
    /// ```
    ///
    /// # Arguments
    ///
    /// * `key` - PRF key
    /// * `seed` - Seed data (S)
    /// * `output_len` - Desired output length in bytes
    ///
    /// # Errors
    ///
    /// Returns error if more than 255 iterations would be needed
    pub fn prf_plus(self, key: &[u8], seed: &[u8], output_len: usize) -> Result<Vec<u8>> {
        if output_len > 255 * self.output_len() {
            return Err(Error::CryptoError(format!(
                "prf+ cannot produce {} bytes",
                output_len
            )));
        }

        let mut output = Vec::with_capacity(output_len + self.output_len());
        let mut t = Vec::new();
        let mut counter: u8 = 1;

        while output.len() < output_len {
            // T(i-1) | S | counter
            let mut input = Vec::with_capacity(t.len() + seed.len() + 1);
            input.extend_from_slice(&t);
            input.extend_from_slice(seed);
            input.push(counter);

            t = self.compute(key, &input)?;
            output.extend_from_slice(&t);

            counter = counter.wrapping_add(1);
        }

        output.truncate(output_len);
        Ok(output)
    }
}

/// Integrity algorithm (IKEv2 transform type 3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegAlgorithm {
    /// NONE, used with AEAD ciphers
    None,
    /// AUTH_HMAC_MD5_96
    HmacMd5_96,
    /// AUTH_HMAC_SHA1_96
    HmacSha1_96,
    /// AUTH_HMAC_SHA2_256_128
    HmacSha256_128,
    /// AUTH_HMAC_SHA2_384_192
    HmacSha384_192,
    /// AUTH_HMAC_SHA2_512_256
    HmacSha512_256,
}

impl Default for IntegAlgorithm {
    fn default() -> Self {
        IntegAlgorithm::None
    }
}

impl IntegAlgorithm {
    /// Map an IKEv2 integrity transform ID
    pub fn from_transform_id(id: u16) -> Result<Self> {
        match id {
            0 => Ok(IntegAlgorithm::None),
            1 => Ok(IntegAlgorithm::HmacMd5_96),
            2 => Ok(IntegAlgorithm::HmacSha1_96),
            12 => Ok(IntegAlgorithm::HmacSha256_128),
            13 => Ok(IntegAlgorithm::HmacSha384_192),
            14 => Ok(IntegAlgorithm::HmacSha512_256),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "integrity transform {}",
                other
            ))),
        }
    }

    /// IKEv2 integrity transform ID
    pub fn transform_id(self) -> u16 {
        match self {
            IntegAlgorithm::None => 0,
            IntegAlgorithm::HmacMd5_96 => 1,
            IntegAlgorithm::HmacSha1_96 => 2,
            IntegAlgorithm::HmacSha256_128 => 12,
            IntegAlgorithm::HmacSha384_192 => 13,
            IntegAlgorithm::HmacSha512_256 => 14,
        }
    }

    /// Key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            IntegAlgorithm::None => 0,
            IntegAlgorithm::HmacMd5_96 => 16,
            IntegAlgorithm::HmacSha1_96 => 20,
            IntegAlgorithm::HmacSha256_128 => 32,
            IntegAlgorithm::HmacSha384_192 => 48,
            IntegAlgorithm::HmacSha512_256 => 64,
        }
    }

    /// Truncated ICV length in bytes
    pub fn icv_len(self) -> usize {
        match self {
            IntegAlgorithm::None => 0,
            IntegAlgorithm::HmacMd5_96 | IntegAlgorithm::HmacSha1_96 => 12,
            IntegAlgorithm::HmacSha256_128 => 16,
            IntegAlgorithm::HmacSha384_192 => 24,
            IntegAlgorithm::HmacSha512_256 => 32,
        }
    }

    /// Compute the truncated ICV over `data`
    pub fn compute(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut full = match self {
            IntegAlgorithm::None => return Ok(Vec::new()),
            IntegAlgorithm::HmacMd5_96 => hmac_digest!(Md5, key, data),
            IntegAlgorithm::HmacSha1_96 => hmac_digest!(Sha1, key, data),
            IntegAlgorithm::HmacSha256_128 => hmac_digest!(Sha256, key, data),
            IntegAlgorithm::HmacSha384_192 => hmac_digest!(Sha384, key, data),
            IntegAlgorithm::HmacSha512_256 => hmac_digest!(Sha512, key, data),
        };
        full.truncate(self.icv_len());
        Ok(full)
    }

    /// Verify `icv` against `data` in constant time
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityCheckFailed`] on mismatch
    pub fn verify(self, key: &[u8], data: &[u8], icv: &[u8]) -> Result<()> {
        let expected = self.compute(key, data)?;
        if expected.len() != icv.len() || !bool::from(expected.ct_eq(icv)) {
            return Err(Error::IntegrityCheckFailed);
        }
        Ok(())
    }
}

/// IKEv2 key material derived from SKEYSEED
///
/// Contains all keys derived during IKE_SA_INIT exchange.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// SK_d - Key for deriving Child SA keys
    pub sk_d: Vec<u8>,

    /// SK_ai - Initiator's integrity key
    pub sk_ai: Vec<u8>,

    /// SK_ar - Responder's integrity key
    pub sk_ar: Vec<u8>,

    /// SK_ei - Initiator's encryption key (salt included for AEAD)
    pub sk_ei: Vec<u8>,

    /// SK_er - Responder's encryption key (salt included for AEAD)
    pub sk_er: Vec<u8>,

    /// SK_pi - Initiator's AUTH payload key
    pub sk_pi: Vec<u8>,

    /// SK_pr - Responder's AUTH payload key
    pub sk_pr: Vec<u8>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("sk_d", &self.sk_d.len())
            .field("sk_a", &self.sk_ai.len())
            .field("sk_e", &self.sk_ei.len())
            .field("sk_p", &self.sk_pi.len())
            .finish()
    }
}

impl KeyMaterial {
    /// Derive IKEv2 key material from SKEYSEED
    ///
    /// Implements key derivation from RFC 7296 Section 2.14:
    /// ```text
    /// SKEYSEED = prf(Ni | Nr, g^ir)
    ///
    /// {SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr}
    ///     = prf+ (SKEYSEED, Ni | Nr | SPIi | SPIr)
    /// ```
    ///
    /// # Arguments
    ///
    /// * `prf_alg` - PRF algorithm to use
    /// * `nonce_i` - Initiator's nonce
    /// * `nonce_r` - Responder's nonce
    /// * `shared_secret` - DH shared secret (g^ir)
    /// * `spi_i` - Initiator's SPI
    /// * `spi_r` - Responder's SPI
    /// * `encr_key_len` - Encryption key length in bytes, salt included
    /// * `integ_key_len` - Integrity key length in bytes
    #[allow(clippy::too_many_arguments)]
    pub fn derive(
        prf_alg: PrfAlgorithm,
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared_secret: &[u8],
        spi_i: &[u8; 8],
        spi_r: &[u8; 8],
        encr_key_len: usize,
        integ_key_len: usize,
    ) -> Result<Self> {
        // Step 1: SKEYSEED = prf(Ni | Nr, g^ir)
        let mut prf_key = Vec::with_capacity(nonce_i.len() + nonce_r.len());
        prf_key.extend_from_slice(nonce_i);
        prf_key.extend_from_slice(nonce_r);
        let skeyseed = prf_alg.compute(&prf_key, shared_secret)?;

        // Step 2: seed = Ni | Nr | SPIi | SPIr
        let seed = keymat_seed(nonce_i, nonce_r, spi_i, spi_r);

        // Step 3: total length
        let prf_len = prf_alg.output_len();
        let total_len = 3 * prf_len + 2 * integ_key_len + 2 * encr_key_len;

        // Step 4: expand and split
        let keymat = prf_alg.prf_plus(&skeyseed, &seed, total_len)?;
        let mut split = KeySplitter::new(&keymat);

        Ok(KeyMaterial {
            sk_d: split.take(prf_len),
            sk_ai: split.take(integ_key_len),
            sk_ar: split.take(integ_key_len),
            sk_ei: split.take(encr_key_len),
            sk_er: split.take(encr_key_len),
            sk_pi: split.take(prf_len),
            sk_pr: split.take(prf_len),
        })
    }

    /// Derive the key material of a rekeyed IKE SA (RFC 7296 Section 2.18)
    ///
    /// ```text
    /// SKEYSEED = prf(SK_d (old), g^ir (new) | Ni | Nr)
    /// {SK_d | SK_ai | SK_ar | SK_ei | SK_er} = prf+ (SKEYSEED, Ni | Nr | SPIi | SPIr)
    /// ```
    ///
    /// SKEYSEED is computed with `old_prf`, the PRF of the SA carrying the
    /// rekey exchange. prf+ and the SK_d length use `new_prf`, the PRF
    /// negotiated for the new SA.
    ///
    /// SK_pi and SK_pr are carried over from `self`; AUTH keys are not
    /// regenerated on rekey.
    #[allow(clippy::too_many_arguments)]
    pub fn derive_rekey(
        &self,
        old_prf: PrfAlgorithm,
        new_prf: PrfAlgorithm,
        nonce_i: &[u8],
        nonce_r: &[u8],
        shared_secret: &[u8],
        spi_i: &[u8; 8],
        spi_r: &[u8; 8],
        encr_key_len: usize,
        integ_key_len: usize,
    ) -> Result<Self> {
        let mut input = Vec::with_capacity(shared_secret.len() + nonce_i.len() + nonce_r.len());
        input.extend_from_slice(shared_secret);
        input.extend_from_slice(nonce_i);
        input.extend_from_slice(nonce_r);
        let skeyseed = old_prf.compute(&self.sk_d, &input)?;

        let seed = keymat_seed(nonce_i, nonce_r, spi_i, spi_r);
        let prf_len = new_prf.output_len();
        let total_len = prf_len + 2 * integ_key_len + 2 * encr_key_len;
        let keymat = new_prf.prf_plus(&skeyseed, &seed, total_len)?;
        let mut split = KeySplitter::new(&keymat);

        Ok(KeyMaterial {
            sk_d: split.take(prf_len),
            sk_ai: split.take(integ_key_len),
            sk_ar: split.take(integ_key_len),
            sk_ei: split.take(encr_key_len),
            sk_er: split.take(encr_key_len),
            sk_pi: self.sk_pi.clone(),
            sk_pr: self.sk_pr.clone(),
        })
    }
}

/// Child SA (ESP) key material (RFC 7296 Section 2.17)
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChildKeyMaterial {
    /// Encryption key, initiator to responder
    pub sk_ei: Vec<u8>,
    /// Integrity key, initiator to responder
    pub sk_ai: Vec<u8>,
    /// Encryption key, responder to initiator
    pub sk_er: Vec<u8>,
    /// Integrity key, responder to initiator
    pub sk_ar: Vec<u8>,
}

impl std::fmt::Debug for ChildKeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildKeyMaterial")
            .field("encr_len", &self.sk_ei.len())
            .field("integ_len", &self.sk_ai.len())
            .finish()
    }
}

impl ChildKeyMaterial {
    /// Derive child SA keys
    ///
    /// ```text
    /// KEYMAT = prf+(SK_d, [g^ir (new) |] Ni | Nr)
    /// ```
    ///
    /// The DH term is present only when the exchange negotiated PFS.
    pub fn derive(
        prf_alg: PrfAlgorithm,
        sk_d: &[u8],
        shared_secret: Option<&[u8]>,
        nonce_i: &[u8],
        nonce_r: &[u8],
        encr_key_len: usize,
        integ_key_len: usize,
    ) -> Result<Self> {
        let mut seed = Vec::new();
        if let Some(secret) = shared_secret {
            seed.extend_from_slice(secret);
        }
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);

        let total_len = 2 * encr_key_len + 2 * integ_key_len;
        let keymat = prf_alg.prf_plus(sk_d, &seed, total_len)?;
        let mut split = KeySplitter::new(&keymat);

        Ok(ChildKeyMaterial {
            sk_ei: split.take(encr_key_len),
            sk_ai: split.take(integ_key_len),
            sk_er: split.take(encr_key_len),
            sk_ar: split.take(integ_key_len),
        })
    }
}

fn keymat_seed(nonce_i: &[u8], nonce_r: &[u8], spi_i: &[u8; 8], spi_r: &[u8; 8]) -> Vec<u8> {
    let mut seed = Vec::with_capacity(nonce_i.len() + nonce_r.len() + 16);
    seed.extend_from_slice(nonce_i);
    seed.extend_from_slice(nonce_r);
    seed.extend_from_slice(spi_i);
    seed.extend_from_slice(spi_r);
    seed
}

struct KeySplitter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> KeySplitter<'a> {
    fn new(data: &'a [u8]) -> Self {
        KeySplitter { data, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Vec<u8> {
        let key = self.data[self.offset..self.offset + len].to_vec();
        self.offset += len;
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prf_output_len() {
        assert_eq!(PrfAlgorithm::HmacMd5.output_len(), 16);
        assert_eq!(PrfAlgorithm::HmacSha1.output_len(), 20);
        assert_eq!(PrfAlgorithm::HmacSha256.output_len(), 32);
        assert_eq!(PrfAlgorithm::HmacSha384.output_len(), 48);
        assert_eq!(PrfAlgorithm::HmacSha512.output_len(), 64);
    }

    #[test]
    fn test_transform_id_mapping() {
        for alg in [
            PrfAlgorithm::HmacMd5,
            PrfAlgorithm::HmacSha1,
            PrfAlgorithm::HmacSha256,
            PrfAlgorithm::HmacSha384,
            PrfAlgorithm::HmacSha512,
        ] {
            assert_eq!(PrfAlgorithm::from_transform_id(alg.transform_id()).unwrap(), alg);
        }
        assert!(PrfAlgorithm::from_transform_id(4).is_err());
        assert_eq!(
            IntegAlgorithm::from_transform_id(2).unwrap(),
            IntegAlgorithm::HmacSha1_96
        );
    }

    #[test]
    fn test_hmac_sha256_known_vector() {
        let out = hmac_sha256(b"key", b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(
            hex::encode(out),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_prf_different_algorithms() {
        let key = b"test key";
        let data = b"test data";

        let sha1 = PrfAlgorithm::HmacSha1.compute(key, data).unwrap();
        let sha256 = PrfAlgorithm::HmacSha256.compute(key, data).unwrap();
        let sha512 = PrfAlgorithm::HmacSha512.compute(key, data).unwrap();

        assert_ne!(sha256[..20], sha1[..]);
        assert_ne!(sha256[..], sha512[..32]);
        assert_eq!(sha1.len(), 20);
        assert_eq!(sha512.len(), 64);
    }

    #[test]
    fn test_prf_plus_lengths() {
        let key = b"secret key";
        let seed = b"seed data";

        for n in [1usize, 16, 20, 32, 33, 100, 208] {
            let out = PrfAlgorithm::HmacSha1.prf_plus(key, seed, n).unwrap();
            assert_eq!(out.len(), n);
        }
    }

    #[test]
    fn test_prf_plus_expansion() {
        let key = b"secret key";
        let seed = b"seed data";

        let output = PrfAlgorithm::HmacSha256.prf_plus(key, seed, 100).unwrap();
        assert_eq!(output.len(), 100);

        // T1 = prf(K, S | 0x01)
        let mut t1_input = seed.to_vec();
        t1_input.push(1);
        let t1 = PrfAlgorithm::HmacSha256.compute(key, &t1_input).unwrap();
        assert_eq!(&output[0..32], &t1[..]);
    }

    #[test]
    fn test_prf_plus_different_lengths() {
        let key = b"secret key";
        let seed = b"seed data";

        let short = PrfAlgorithm::HmacSha256.prf_plus(key, seed, 16).unwrap();
        let long = PrfAlgorithm::HmacSha256.prf_plus(key, seed, 64).unwrap();

        // Short should be prefix of long
        assert_eq!(&short[..], &long[0..16]);
    }

    #[test]
    fn test_prf_plus_too_long() {
        assert!(PrfAlgorithm::HmacMd5.prf_plus(b"k", b"s", 255 * 16 + 1).is_err());
    }

    #[test]
    fn test_integ_truncation_and_verify() {
        let key = [0x0b; 20];
        let icv = IntegAlgorithm::HmacSha1_96.compute(&key, b"payload").unwrap();
        assert_eq!(icv.len(), 12);
        assert!(IntegAlgorithm::HmacSha1_96
            .verify(&key, b"payload", &icv)
            .is_ok());
        assert_eq!(
            IntegAlgorithm::HmacSha1_96.verify(&key, b"payloaD", &icv),
            Err(Error::IntegrityCheckFailed)
        );
        assert!(IntegAlgorithm::None.compute(&[], b"x").unwrap().is_empty());
    }

    #[test]
    fn test_key_material_derivation() {
        let keymat = KeyMaterial::derive(
            PrfAlgorithm::HmacSha256,
            &[0x01; 32],
            &[0x02; 32],
            &[0x03; 256],
            &[0x04; 8],
            &[0x05; 8],
            16,
            32,
        )
        .unwrap();

        assert_eq!(keymat.sk_d.len(), 32);
        assert_eq!(keymat.sk_ai.len(), 32);
        assert_eq!(keymat.sk_ar.len(), 32);
        assert_eq!(keymat.sk_ei.len(), 16);
        assert_eq!(keymat.sk_er.len(), 16);
        assert_eq!(keymat.sk_pi.len(), 32);
        assert_eq!(keymat.sk_pr.len(), 32);

        assert_ne!(keymat.sk_d, keymat.sk_ai);
        assert_ne!(keymat.sk_ei, keymat.sk_er);
        assert_ne!(keymat.sk_pi, keymat.sk_pr);
    }

    #[test]
    fn test_key_material_slices_follow_prf_plus() {
        let prf = PrfAlgorithm::HmacSha1;
        let (ni, nr, g) = ([1u8; 16], [2u8; 16], [3u8; 128]);
        let (spi_i, spi_r) = ([4u8; 8], [5u8; 8]);
        let keymat = KeyMaterial::derive(prf, &ni, &nr, &g, &spi_i, &spi_r, 16, 20).unwrap();

        let skeyseed = prf.compute(&[ni, nr].concat(), &g).unwrap();
        let seed = [&ni[..], &nr[..], &spi_i[..], &spi_r[..]].concat();
        let stream = prf.prf_plus(&skeyseed, &seed, 3 * 20 + 2 * 20 + 2 * 16).unwrap();
        assert_eq!(keymat.sk_d, stream[0..20]);
        assert_eq!(keymat.sk_ai, stream[20..40]);
        assert_eq!(keymat.sk_ei, stream[60..76]);
        assert_eq!(keymat.sk_pr, stream[112..132]);
    }

    #[test]
    fn test_rekey_keeps_auth_keys() {
        let prf = PrfAlgorithm::HmacSha256;
        let old = KeyMaterial::derive(prf, &[1; 16], &[2; 16], &[3; 64], &[4; 8], &[5; 8], 16, 32)
            .unwrap();
        let new = old
            .derive_rekey(prf, prf, &[6; 16], &[7; 16], &[8; 64], &[9; 8], &[10; 8], 16, 32)
            .unwrap();

        assert_ne!(old.sk_d, new.sk_d);
        assert_ne!(old.sk_ei, new.sk_ei);
        assert_eq!(old.sk_pi, new.sk_pi);
        assert_eq!(old.sk_pr, new.sk_pr);
    }

    #[test]
    fn test_rekey_to_different_prf() {
        let old_prf = PrfAlgorithm::HmacSha1;
        let new_prf = PrfAlgorithm::HmacSha256;
        let old = KeyMaterial::derive(old_prf, &[1; 16], &[2; 16], &[3; 64], &[4; 8], &[5; 8], 16, 20)
            .unwrap();
        let new = old
            .derive_rekey(old_prf, new_prf, &[6; 16], &[7; 16], &[8; 64], &[9; 8], &[10; 8], 16, 32)
            .unwrap();

        // SKEYSEED keyed by the old SK_d under the old PRF
        let skeyseed = old_prf
            .compute(&old.sk_d, &[&[8u8; 64][..], &[6; 16], &[7; 16]].concat())
            .unwrap();
        assert_eq!(skeyseed.len(), 20);
        let seed = [&[6u8; 16][..], &[7; 16], &[9; 8], &[10; 8]].concat();
        let stream = new_prf.prf_plus(&skeyseed, &seed, 32 + 2 * 32 + 2 * 16).unwrap();
        assert_eq!(new.sk_d, stream[0..32]);
        assert_eq!(new.sk_ai, stream[32..64]);
        assert_eq!(new.sk_er, stream[112..128]);
    }

    #[test]
    fn test_child_key_material_pfs() {
        let prf = PrfAlgorithm::HmacSha256;
        let sk_d = [0x11; 32];
        let without = ChildKeyMaterial::derive(prf, &sk_d, None, &[1; 16], &[2; 16], 20, 20).unwrap();
        let with =
            ChildKeyMaterial::derive(prf, &sk_d, Some(&[3; 64]), &[1; 16], &[2; 16], 20, 20)
                .unwrap();

        assert_eq!(without.sk_ei.len(), 20);
        assert_eq!(without.sk_ar.len(), 20);
        assert_ne!(without.sk_ei, with.sk_ei);

        let stream = prf
            .prf_plus(&sk_d, &[[1u8; 16], [2u8; 16]].concat(), 80)
            .unwrap();
        assert_eq!(without.sk_ei, stream[0..20]);
        assert_eq!(without.sk_ai, stream[20..40]);
        assert_eq!(without.sk_er, stream[40..60]);
        assert_eq!(without.sk_ar, stream[60..80]);
    }
}
