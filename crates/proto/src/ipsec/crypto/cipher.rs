//! Cipher implementations for SK payload and ESP encryption
//!
//! Covers the encryption transforms a UE has to run against an ePDG or
//! N3IWF:
//!
//! - `ENCR_NULL` (11), integrity only
//! - `ENCR_AES_CBC` (12) with 128/192/256-bit keys, paired with an HMAC
//! - `ENCR_AES_GCM_8/12/16` (18/19/20), RFC 4106 and RFC 5282
//! - `ENCR_CHACHA20_POLY1305` (28), RFC 7634
//!
//! For AEAD transforms the key handed to [`EncrAlgorithm::encrypt`] and
//! [`EncrAlgorithm::decrypt`] is the full key material slice: cipher key
//! followed by the 4-byte salt.

use crate::ipsec::{Error, Result};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::AesGcm;
use chacha20poly1305::ChaCha20Poly1305;
use cipher::block_padding::NoPadding;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Length of the implicit salt carried at the end of AEAD key material
pub const AEAD_SALT_LEN: usize = 4;

/// AES block size
pub const AES_BLOCK_SIZE: usize = 16;

const GCM_FULL_TAG_LEN: usize = 16;

macro_rules! dispatch_aes {
    ($key_len:expr, $mac:ident ! ( $($args:tt)* )) => {
        match $key_len {
            16 => $mac!(Aes128, $($args)*),
            24 => $mac!(Aes192, $($args)*),
            32 => $mac!(Aes256, $($args)*),
            n => {
                return Err(Error::InvalidKeyLength {
                    expected: 16,
                    actual: n,
                })
            }
        }
    };
}

macro_rules! cbc_encrypt {
    ($aes:ty, $key:expr, $iv:expr, $buf:expr) => {{
        let len = $buf.len();
        cbc::Encryptor::<$aes>::new_from_slices($key, $iv)
            .map_err(|_| Error::CryptoError("Invalid AES-CBC key or IV".into()))?
            .encrypt_padded_mut::<NoPadding>(&mut $buf, len)
            .map_err(|_| Error::CryptoError("AES-CBC input is not block aligned".into()))?;
    }};
}

macro_rules! cbc_decrypt {
    ($aes:ty, $key:expr, $iv:expr, $buf:expr) => {{
        cbc::Decryptor::<$aes>::new_from_slices($key, $iv)
            .map_err(|_| Error::CryptoError("Invalid AES-CBC key or IV".into()))?
            .decrypt_padded_mut::<NoPadding>(&mut $buf)
            .map_err(|_| Error::CryptoError("AES-CBC input is not block aligned".into()))?;
    }};
}

macro_rules! gcm_seal {
    ($aes:ty, $key:expr, $nonce:expr, $msg:expr, $aad:expr) => {{
        let cipher = AesGcm::<$aes, U12>::new_from_slice($key)
            .map_err(|_| Error::CryptoError("Failed to create AES-GCM cipher".into()))?;
        cipher
            .encrypt(
                GenericArray::from_slice($nonce),
                Payload {
                    msg: $msg,
                    aad: $aad,
                },
            )
            .map_err(|_| Error::CryptoError("AES-GCM encryption failed".into()))?
    }};
}

macro_rules! gcm_open {
    ($aes:ty, $key:expr, $nonce:expr, $msg:expr, $aad:expr) => {{
        let cipher = AesGcm::<$aes, U12>::new_from_slice($key)
            .map_err(|_| Error::CryptoError("Failed to create AES-GCM cipher".into()))?;
        cipher
            .decrypt(
                GenericArray::from_slice($nonce),
                Payload {
                    msg: $msg,
                    aad: $aad,
                },
            )
            .map_err(|_| Error::IntegrityCheckFailed)?
    }};
}

macro_rules! gcm_ctr {
    ($aes:ty, $key:expr, $counter:expr, $buf:expr) => {{
        ctr::Ctr32BE::<$aes>::new_from_slices($key, $counter)
            .map_err(|_| Error::CryptoError("Invalid AES-CTR key".into()))?
            .apply_keystream(&mut $buf);
    }};
}

/// Encryption algorithm (IKEv2 transform type 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncrAlgorithm {
    /// ENCR_NULL
    Null,
    /// ENCR_AES_CBC
    AesCbc {
        /// Key length in bytes (16, 24 or 32)
        key_len: usize,
    },
    /// ENCR_AES_GCM_8 / 12 / 16
    AesGcm {
        /// Key length in bytes (16, 24 or 32), salt excluded
        key_len: usize,
        /// Tag length in bytes (8, 12 or 16)
        icv_len: usize,
    },
    /// ENCR_CHACHA20_POLY1305
    ChaCha20Poly1305,
}

impl Default for EncrAlgorithm {
    fn default() -> Self {
        EncrAlgorithm::Null
    }
}

impl EncrAlgorithm {
    /// Map an IKEv2 encryption transform and its key length attribute
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedAlgorithm`] for transforms we cannot run
    /// and [`Error::InvalidProposal`] if AES is offered without a key length.
    pub fn from_transform(id: u16, key_bits: Option<u16>) -> Result<Self> {
        let aes_key_len = || -> Result<usize> {
            match key_bits {
                Some(bits @ (128 | 192 | 256)) => Ok(bits as usize / 8),
                Some(bits) => Err(Error::UnsupportedAlgorithm(format!(
                    "AES key length {}",
                    bits
                ))),
                None => Err(Error::InvalidProposal(
                    "AES transform without key length attribute".into(),
                )),
            }
        };

        match id {
            11 => Ok(EncrAlgorithm::Null),
            12 => Ok(EncrAlgorithm::AesCbc {
                key_len: aes_key_len()?,
            }),
            18 | 19 | 20 => Ok(EncrAlgorithm::AesGcm {
                key_len: aes_key_len()?,
                icv_len: match id {
                    18 => 8,
                    19 => 12,
                    _ => 16,
                },
            }),
            28 => Ok(EncrAlgorithm::ChaCha20Poly1305),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "encryption transform {}",
                other
            ))),
        }
    }

    /// IKEv2 encryption transform ID
    pub fn transform_id(self) -> u16 {
        match self {
            EncrAlgorithm::Null => 11,
            EncrAlgorithm::AesCbc { .. } => 12,
            EncrAlgorithm::AesGcm { icv_len: 8, .. } => 18,
            EncrAlgorithm::AesGcm { icv_len: 12, .. } => 19,
            EncrAlgorithm::AesGcm { .. } => 20,
            EncrAlgorithm::ChaCha20Poly1305 => 28,
        }
    }

    /// Value of the key length attribute, if the transform carries one
    pub fn key_bits(self) -> Option<u16> {
        match self {
            EncrAlgorithm::AesCbc { key_len } | EncrAlgorithm::AesGcm { key_len, .. } => {
                Some((key_len * 8) as u16)
            }
            _ => None,
        }
    }

    /// Cipher key length in bytes, salt excluded
    pub fn key_len(self) -> usize {
        match self {
            EncrAlgorithm::Null => 0,
            EncrAlgorithm::AesCbc { key_len } | EncrAlgorithm::AesGcm { key_len, .. } => key_len,
            EncrAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    /// Length of the slice taken from key material (key plus salt)
    pub fn keymat_len(self) -> usize {
        if self.is_aead() {
            self.key_len() + AEAD_SALT_LEN
        } else {
            self.key_len()
        }
    }

    /// Explicit IV length carried on the wire
    pub fn iv_len(self) -> usize {
        match self {
            EncrAlgorithm::Null => 0,
            EncrAlgorithm::AesCbc { .. } => AES_BLOCK_SIZE,
            EncrAlgorithm::AesGcm { .. } | EncrAlgorithm::ChaCha20Poly1305 => 8,
        }
    }

    /// Block size the plaintext must be padded to
    pub fn block_size(self) -> usize {
        match self {
            EncrAlgorithm::AesCbc { .. } => AES_BLOCK_SIZE,
            _ => 4,
        }
    }

    /// AEAD tag length, zero for non-AEAD ciphers
    pub fn icv_len(self) -> usize {
        match self {
            EncrAlgorithm::AesGcm { icv_len, .. } => icv_len,
            EncrAlgorithm::ChaCha20Poly1305 => 16,
            _ => 0,
        }
    }

    /// Check if this is an AEAD cipher
    pub fn is_aead(self) -> bool {
        matches!(
            self,
            EncrAlgorithm::AesGcm { .. } | EncrAlgorithm::ChaCha20Poly1305
        )
    }

    /// Generate a fresh random IV
    pub fn generate_iv(self) -> Vec<u8> {
        let mut iv = vec![0u8; self.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);
        iv
    }

    /// Encrypt data
    ///
    /// # Arguments
    ///
    /// * `key` - Encryption key (salt appended for AEAD)
    /// * `iv` - Explicit IV
    /// * `plaintext` - Data to encrypt, already padded to [`Self::block_size`] for CBC
    /// * `aad` - Additional authenticated data (ignored for non-AEAD)
    ///
    /// # Returns
    ///
    /// Returns ciphertext, with the truncated tag appended for AEAD
    pub fn encrypt(self, key: &[u8], iv: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.check_lengths(key, iv)?;

        match self {
            EncrAlgorithm::Null => Ok(plaintext.to_vec()),
            EncrAlgorithm::AesCbc { key_len } => {
                let mut buf = plaintext.to_vec();
                dispatch_aes!(key_len, cbc_encrypt!(key, iv, buf));
                Ok(buf)
            }
            EncrAlgorithm::AesGcm { key_len, icv_len } => {
                let (cipher_key, nonce) = split_salt(key, iv);
                let mut sealed = dispatch_aes!(key_len, gcm_seal!(cipher_key, &nonce, plaintext, aad));
                sealed.truncate(plaintext.len() + icv_len);
                Ok(sealed)
            }
            EncrAlgorithm::ChaCha20Poly1305 => {
                let (cipher_key, nonce) = split_salt(key, iv);
                let cipher = ChaCha20Poly1305::new_from_slice(cipher_key)
                    .map_err(|_| Error::CryptoError("Failed to create ChaCha20 cipher".into()))?;
                cipher
                    .encrypt(
                        chacha20poly1305::Nonce::from_slice(&nonce),
                        Payload {
                            msg: plaintext,
                            aad,
                        },
                    )
                    .map_err(|_| Error::CryptoError("ChaCha20-Poly1305 encryption failed".into()))
            }
        }
    }

    /// Decrypt data
    ///
    /// # Arguments
    ///
    /// * `key` - Encryption key (salt appended for AEAD)
    /// * `iv` - Explicit IV
    /// * `ciphertext` - Data to decrypt, tag included for AEAD
    /// * `aad` - Additional authenticated data (ignored for non-AEAD)
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityCheckFailed`] if an AEAD tag does not verify
    pub fn decrypt(self, key: &[u8], iv: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.check_lengths(key, iv)?;

        if ciphertext.len() < self.icv_len() {
            return Err(Error::BufferTooShort {
                required: self.icv_len(),
                available: ciphertext.len(),
            });
        }

        match self {
            EncrAlgorithm::Null => Ok(ciphertext.to_vec()),
            EncrAlgorithm::AesCbc { key_len } => {
                if ciphertext.len() % AES_BLOCK_SIZE != 0 {
                    return Err(Error::InvalidLength {
                        expected: ciphertext.len() - ciphertext.len() % AES_BLOCK_SIZE,
                        actual: ciphertext.len(),
                    });
                }
                let mut buf = ciphertext.to_vec();
                dispatch_aes!(key_len, cbc_decrypt!(key, iv, buf));
                Ok(buf)
            }
            EncrAlgorithm::AesGcm { key_len, icv_len } => {
                let (cipher_key, nonce) = split_salt(key, iv);
                if icv_len == GCM_FULL_TAG_LEN {
                    return Ok(dispatch_aes!(
                        key_len,
                        gcm_open!(cipher_key, &nonce, ciphertext, aad)
                    ));
                }

                // Short tags: recover the plaintext with the GCM counter
                // stream, then recompute the full tag and compare its prefix.
                let (body, tag) = ciphertext.split_at(ciphertext.len() - icv_len);
                let mut counter = [0u8; 16];
                counter[..12].copy_from_slice(&nonce);
                counter[15] = 2;
                let mut plaintext = body.to_vec();
                dispatch_aes!(key_len, gcm_ctr!(cipher_key, &counter, plaintext));

                let resealed =
                    dispatch_aes!(key_len, gcm_seal!(cipher_key, &nonce, &plaintext[..], aad));
                let expected = &resealed[plaintext.len()..plaintext.len() + icv_len];
                if !bool::from(expected.ct_eq(tag)) {
                    return Err(Error::IntegrityCheckFailed);
                }
                Ok(plaintext)
            }
            EncrAlgorithm::ChaCha20Poly1305 => {
                let (cipher_key, nonce) = split_salt(key, iv);
                let cipher = ChaCha20Poly1305::new_from_slice(cipher_key)
                    .map_err(|_| Error::CryptoError("Failed to create ChaCha20 cipher".into()))?;
                cipher
                    .decrypt(
                        chacha20poly1305::Nonce::from_slice(&nonce),
                        Payload {
                            msg: ciphertext,
                            aad,
                        },
                    )
                    .map_err(|_| Error::IntegrityCheckFailed)
            }
        }
    }

    fn check_lengths(self, key: &[u8], iv: &[u8]) -> Result<()> {
        if key.len() != self.keymat_len() {
            return Err(Error::InvalidKeyLength {
                expected: self.keymat_len(),
                actual: key.len(),
            });
        }
        if iv.len() != self.iv_len() {
            return Err(Error::InvalidIvLength {
                expected: self.iv_len(),
                actual: iv.len(),
            });
        }
        Ok(())
    }
}

/// Split AEAD key material into cipher key and 12-byte nonce (salt | IV)
fn split_salt<'a>(key: &'a [u8], iv: &[u8]) -> (&'a [u8], [u8; 12]) {
    let (cipher_key, salt) = key.split_at(key.len() - AEAD_SALT_LEN);
    let mut nonce = [0u8; 12];
    nonce[..AEAD_SALT_LEN].copy_from_slice(salt);
    nonce[AEAD_SALT_LEN..].copy_from_slice(iv);
    (cipher_key, nonce)
}

/// AES-128-CBC over block-aligned data, used by EAP AT_ENCR_DATA
pub fn aes128_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    EncrAlgorithm::AesCbc { key_len: 16 }.encrypt(key, iv, data, &[])
}

/// AES-128-CBC decryption counterpart of [`aes128_cbc_encrypt`]
pub fn aes128_cbc_decrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    EncrAlgorithm::AesCbc { key_len: 16 }.decrypt(key, iv, data, &[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transform() {
        assert_eq!(
            EncrAlgorithm::from_transform(12, Some(128)).unwrap(),
            EncrAlgorithm::AesCbc { key_len: 16 }
        );
        assert_eq!(
            EncrAlgorithm::from_transform(18, Some(256)).unwrap(),
            EncrAlgorithm::AesGcm {
                key_len: 32,
                icv_len: 8
            }
        );
        assert_eq!(EncrAlgorithm::from_transform(11, None).unwrap(), EncrAlgorithm::Null);
        assert!(matches!(
            EncrAlgorithm::from_transform(12, None),
            Err(Error::InvalidProposal(_))
        ));
        assert!(matches!(
            EncrAlgorithm::from_transform(3, None),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_transform_id_roundtrip() {
        for alg in [
            EncrAlgorithm::Null,
            EncrAlgorithm::AesCbc { key_len: 24 },
            EncrAlgorithm::AesGcm {
                key_len: 16,
                icv_len: 12,
            },
            EncrAlgorithm::ChaCha20Poly1305,
        ] {
            assert_eq!(
                EncrAlgorithm::from_transform(alg.transform_id(), alg.key_bits()).unwrap(),
                alg
            );
        }
    }

    #[test]
    fn test_keymat_len_includes_salt() {
        let gcm = EncrAlgorithm::AesGcm {
            key_len: 16,
            icv_len: 16,
        };
        assert_eq!(gcm.keymat_len(), 20);
        assert_eq!(EncrAlgorithm::AesCbc { key_len: 16 }.keymat_len(), 16);
        assert_eq!(EncrAlgorithm::ChaCha20Poly1305.keymat_len(), 36);
    }

    #[test]
    fn test_cbc_roundtrip() {
        for key_len in [16, 24, 32] {
            let alg = EncrAlgorithm::AesCbc { key_len };
            let key = vec![0x42; key_len];
            let iv = alg.generate_iv();
            let plaintext = [0x5a; 48];

            let ciphertext = alg.encrypt(&key, &iv, &plaintext, &[]).unwrap();
            assert_eq!(ciphertext.len(), 48);
            assert_ne!(&ciphertext[..], &plaintext[..]);

            let decrypted = alg.decrypt(&key, &iv, &ciphertext, &[]).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_cbc_rejects_unaligned() {
        let alg = EncrAlgorithm::AesCbc { key_len: 16 };
        assert!(alg.encrypt(&[0; 16], &[0; 16], &[0; 15], &[]).is_err());
        assert!(alg.decrypt(&[0; 16], &[0; 16], &[0; 17], &[]).is_err());
    }

    #[test]
    fn test_gcm_all_tag_lengths() {
        for icv_len in [8, 12, 16] {
            let alg = EncrAlgorithm::AesGcm {
                key_len: 16,
                icv_len,
            };
            let key = [0x11; 20];
            let iv = [0x22; 8];
            let aad = b"spi+seq";
            let plaintext = b"non-3gpp user plane";

            let sealed = alg.encrypt(&key, &iv, plaintext, aad).unwrap();
            assert_eq!(sealed.len(), plaintext.len() + icv_len);

            let opened = alg.decrypt(&key, &iv, &sealed, aad).unwrap();
            assert_eq!(&opened[..], &plaintext[..]);

            let mut tampered = sealed.clone();
            tampered[0] ^= 1;
            assert_eq!(
                alg.decrypt(&key, &iv, &tampered, aad),
                Err(Error::IntegrityCheckFailed)
            );
            assert_eq!(
                alg.decrypt(&key, &iv, &sealed, b"other aad"),
                Err(Error::IntegrityCheckFailed)
            );
        }
    }

    #[test]
    fn test_gcm_truncated_tag_is_prefix_of_full() {
        let key = [0x33; 36];
        let iv = [0x44; 8];
        let full = EncrAlgorithm::AesGcm {
            key_len: 32,
            icv_len: 16,
        }
        .encrypt(&key, &iv, b"data", b"")
        .unwrap();
        let short = EncrAlgorithm::AesGcm {
            key_len: 32,
            icv_len: 8,
        }
        .encrypt(&key, &iv, b"data", b"")
        .unwrap();
        assert_eq!(&full[..12], &short[..]);
    }

    #[test]
    fn test_chacha20_roundtrip() {
        let alg = EncrAlgorithm::ChaCha20Poly1305;
        let key = [0x55; 36];
        let iv = [0x66; 8];
        let sealed = alg.encrypt(&key, &iv, b"hello", b"hdr").unwrap();
        assert_eq!(sealed.len(), 5 + 16);
        assert_eq!(alg.decrypt(&key, &iv, &sealed, b"hdr").unwrap(), b"hello");
    }

    #[test]
    fn test_null_passthrough() {
        let alg = EncrAlgorithm::Null;
        assert_eq!(alg.encrypt(&[], &[], b"abc", &[]).unwrap(), b"abc");
        assert_eq!(alg.decrypt(&[], &[], b"abc", &[]).unwrap(), b"abc");
    }

    #[test]
    fn test_invalid_key_length() {
        let alg = EncrAlgorithm::AesCbc { key_len: 16 };
        assert_eq!(
            alg.encrypt(&[0; 15], &[0; 16], &[0; 16], &[]),
            Err(Error::InvalidKeyLength {
                expected: 16,
                actual: 15
            })
        );
        assert_eq!(
            alg.encrypt(&[0; 16], &[0; 8], &[0; 16], &[]),
            Err(Error::InvalidIvLength {
                expected: 16,
                actual: 8
            })
        );
    }
}
