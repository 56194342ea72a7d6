//! Subscriber key hierarchy (TS 33.501 Annex A, TS 33.402 Annex A, RFC 4187, RFC 5448)
//!
//! Every 3GPP derivation is `HMAC-SHA-256(key, FC || P0 || L0 || P1 || L1 ...)`
//! where each `Li` is the 2-byte length of `Pi`. The functions below name
//! the individual keys of the chain:
//!
//! ```text
//! CK || IK --FC 0x6a--> KAUSF --FC 0x6c--> KSEAF --FC 0x6d--> KAMF
//!                                                            |
//!                        +----------FC 0x69------------------+---FC 0x6e--> Kn3iwf
//!                        v
//!            K_NASenc / K_NASint (alg 1..3)
//! ```
//!
//! The legacy EAP-AKA keys use SHA-1 and the FIPS 186-2 pseudo-random
//! generator; EAP-AKA' keys use prf+ with HMAC-SHA-256.

use num_bigint::BigUint;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ipsec::crypto::{hmac_sha256, PrfAlgorithm};
use crate::ipsec::{Error, Result};

/// FC values of TS 33.501 Annex A and TS 33.402 Annex A
pub mod fc {
    /// CK' / IK' for EAP-AKA'
    pub const CK_PRIME_IK_PRIME: u8 = 0x20;
    /// NAS algorithm keys
    pub const ALGORITHM_KEY: u8 = 0x69;
    /// KAUSF
    pub const KAUSF: u8 = 0x6a;
    /// RES* / XRES*
    pub const RES_STAR: u8 = 0x6b;
    /// KSEAF
    pub const KSEAF: u8 = 0x6c;
    /// KAMF
    pub const KAMF: u8 = 0x6d;
    /// KgNB / Kn3iwf
    pub const KGNB_KN3IWF: u8 = 0x6e;
}

/// Algorithm type distinguisher for [`nas_algorithm_key`]
pub const ALG_TYPE_NAS_ENC: u8 = 0x01;
/// Algorithm type distinguisher for [`nas_algorithm_key`]
pub const ALG_TYPE_NAS_INT: u8 = 0x02;

/// Access type distinguisher for Kn3iwf
pub const ACCESS_TYPE_NON_3GPP: u8 = 0x02;

/// Generic 3GPP key derivation function (TS 33.220 Annex B.2)
pub fn kdf(key: &[u8], fc: u8, params: &[&[u8]]) -> Result<[u8; 32]> {
    let mut s = Vec::with_capacity(1 + params.iter().map(|p| p.len() + 2).sum::<usize>());
    s.push(fc);
    for p in params {
        let len = u16::try_from(p.len())
            .map_err(|_| Error::InvalidParameter("KDF parameter longer than 65535 bytes".into()))?;
        s.extend_from_slice(p);
        s.extend_from_slice(&len.to_be_bytes());
    }
    let mac = hmac_sha256(key, &s)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac);
    Ok(out)
}

fn last16(block: &[u8; 32]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&block[16..]);
    out
}

fn ck_ik(ck: &[u8], ik: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(ck.len() + ik.len());
    key.extend_from_slice(ck);
    key.extend_from_slice(ik);
    key
}

/// Serving network name, `5G:mnc<MNC>.mcc<MCC>.3gppnetwork.org`
///
/// A two-digit MNC is zero-padded to three digits.
pub fn serving_network_name(mcc: &str, mnc: &str) -> String {
    format!("5G:mnc{:0>3}.mcc{}.3gppnetwork.org", mnc, mcc)
}

/// KAUSF for 5G-AKA (Annex A.2)
///
/// `sqn_xor_ak` is the first 6 bytes of AUTN.
pub fn kausf(ck: &[u8], ik: &[u8], sn_name: &[u8], sqn_xor_ak: &[u8]) -> Result<[u8; 32]> {
    kdf(&ck_ik(ck, ik), fc::KAUSF, &[sn_name, sqn_xor_ak])
}

/// RES* (Annex A.4)
pub fn res_star(ck: &[u8], ik: &[u8], sn_name: &[u8], rand: &[u8], res: &[u8]) -> Result<[u8; 16]> {
    let out = kdf(&ck_ik(ck, ik), fc::RES_STAR, &[sn_name, rand, res])?;
    Ok(last16(&out))
}

/// HRES* = rightmost 128 bits of SHA-256(RAND || RES*) (Annex A.5)
pub fn hres_star(rand: &[u8], res_star: &[u8]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(rand);
    hasher.update(res_star);
    let digest: [u8; 32] = hasher.finalize().into();
    last16(&digest)
}

/// KSEAF (Annex A.6)
///
/// For EAP-AKA' the serving network name is replaced by the access
/// network identity received in AT_KDF_INPUT.
pub fn kseaf(kausf: &[u8], sn_name: &[u8]) -> Result<[u8; 32]> {
    kdf(kausf, fc::KSEAF, &[sn_name])
}

/// KAMF (Annex A.7), SUPI given as IMSI digits
pub fn kamf(kseaf: &[u8], supi: &str, abba: &[u8]) -> Result<[u8; 32]> {
    kdf(kseaf, fc::KAMF, &[supi.as_bytes(), abba])
}

/// NAS encryption or integrity key for one algorithm identity (Annex A.8)
pub fn nas_algorithm_key(kamf: &[u8], alg_type: u8, alg_id: u8) -> Result<[u8; 16]> {
    let out = kdf(kamf, fc::ALGORITHM_KEY, &[&[alg_type], &[alg_id]])?;
    Ok(last16(&out))
}

/// Kn3iwf from KAMF and the uplink NAS COUNT (Annex A.9)
pub fn kn3iwf(kamf: &[u8], uplink_count: u32, access_type: u8) -> Result<[u8; 32]> {
    kdf(kamf, fc::KGNB_KN3IWF, &[&uplink_count.to_be_bytes(), &[access_type]])
}

/// CK' and IK' for EAP-AKA' (TS 33.402 Annex A.2)
///
/// The 32-byte KDF output is split into two 16-byte halves.
pub fn ck_prime_ik_prime(
    ck: &[u8],
    ik: &[u8],
    access_network: &[u8],
    sqn_xor_ak: &[u8],
) -> Result<([u8; 16], [u8; 16])> {
    let out = kdf(&ck_ik(ck, ik), fc::CK_PRIME_IK_PRIME, &[access_network, sqn_xor_ak])?;
    let mut ck_prime = [0u8; 16];
    ck_prime.copy_from_slice(&out[..16]);
    Ok((ck_prime, last16(&out)))
}

/// Keys derived from the 5G-AKA or EAP-AKA' result
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SubscriberKeys {
    /// KAUSF
    pub kausf: [u8; 32],
    /// KSEAF
    pub kseaf: [u8; 32],
    /// KAMF
    pub kamf: [u8; 32],
    /// K_NASenc for algorithm identities 0..=3 (index 0 unused)
    pub nas_enc: [[u8; 16]; 4],
    /// K_NASint for algorithm identities 0..=3 (index 0 unused)
    pub nas_int: [[u8; 16]; 4],
}

impl std::fmt::Debug for SubscriberKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberKeys")
            .field("kamf", &"[REDACTED]")
            .finish()
    }
}

impl SubscriberKeys {
    /// Derive KSEAF, KAMF and every NAS algorithm key below a KAUSF
    ///
    /// `kseaf_input` is the serving network name for 5G-AKA and the
    /// access network identity for EAP-AKA'.
    pub fn from_kausf(kausf: [u8; 32], kseaf_input: &[u8], supi: &str, abba: &[u8]) -> Result<Self> {
        let kseaf = kseaf(&kausf, kseaf_input)?;
        let kamf = kamf(&kseaf, supi, abba)?;
        let mut nas_enc = [[0u8; 16]; 4];
        let mut nas_int = [[0u8; 16]; 4];
        for alg in 1..=3u8 {
            nas_enc[alg as usize] = nas_algorithm_key(&kamf, ALG_TYPE_NAS_ENC, alg)?;
            nas_int[alg as usize] = nas_algorithm_key(&kamf, ALG_TYPE_NAS_INT, alg)?;
        }
        Ok(SubscriberKeys {
            kausf,
            kseaf,
            kamf,
            nas_enc,
            nas_int,
        })
    }

    /// Full 5G-AKA chain from CK/IK
    pub fn five_g_aka(
        ck: &[u8],
        ik: &[u8],
        sn_name: &[u8],
        sqn_xor_ak: &[u8],
        supi: &str,
        abba: &[u8],
    ) -> Result<Self> {
        let kausf = kausf(ck, ik, sn_name, sqn_xor_ak)?;
        Self::from_kausf(kausf, sn_name, supi, abba)
    }
}

/// EAP-AKA' key split of MK (RFC 5448 Section 3.3)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AkaPrimeKeys {
    /// K_encr
    pub k_encr: [u8; 16],
    /// K_aut
    pub k_aut: [u8; 32],
    /// K_re
    pub k_re: [u8; 32],
    /// MSK
    pub msk: [u8; 64],
    /// EMSK
    pub emsk: [u8; 64],
}

impl AkaPrimeKeys {
    /// MK = prf+(IK' || CK', "EAP-AKA'" || Identity)
    pub fn derive(ck_prime: &[u8], ik_prime: &[u8], identity: &[u8]) -> Result<Self> {
        let mut key = Vec::with_capacity(32);
        key.extend_from_slice(ik_prime);
        key.extend_from_slice(ck_prime);
        let mut seed = b"EAP-AKA'".to_vec();
        seed.extend_from_slice(identity);

        let mut mk = PrfAlgorithm::HmacSha256.prf_plus(&key, &seed, 208)?;
        let mut keys = AkaPrimeKeys {
            k_encr: [0; 16],
            k_aut: [0; 32],
            k_re: [0; 32],
            msk: [0; 64],
            emsk: [0; 64],
        };
        keys.k_encr.copy_from_slice(&mk[0..16]);
        keys.k_aut.copy_from_slice(&mk[16..48]);
        keys.k_re.copy_from_slice(&mk[48..80]);
        keys.msk.copy_from_slice(&mk[80..144]);
        keys.emsk.copy_from_slice(&mk[144..208]);
        mk.zeroize();
        key.zeroize();
        Ok(keys)
    }

    /// KAUSF is the first 256 bits of EMSK (TS 33.501 Section 6.1.3.1)
    pub fn kausf(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.emsk[..32]);
        out
    }
}

/// FIPS 186-2 change notice 1 generator used by EAP-AKA (RFC 4187 Appendix A)
///
/// Produces 160 bytes from a 20-byte XKEY. The G function is the bare
/// SHA-1 compression of XVAL zero-padded to one block.
pub fn fips186_prf(xkey: &[u8; 20]) -> [u8; 160] {
    let modulus = BigUint::from(1u8) << 160;
    let one = BigUint::from(1u8);
    let mut xval = BigUint::from_bytes_be(xkey);
    let mut out = [0u8; 160];

    for chunk in out.chunks_mut(20) {
        let block = to_20_bytes(&xval);
        let w = sha1_g(&block);
        xval = (&xval + BigUint::from_bytes_be(&w) + &one) % &modulus;
        chunk.copy_from_slice(&w);
    }
    out
}

fn to_20_bytes(v: &BigUint) -> [u8; 20] {
    let bytes = v.to_bytes_be();
    let mut out = [0u8; 20];
    out[20 - bytes.len()..].copy_from_slice(&bytes);
    out
}

fn sha1_g(xval: &[u8; 20]) -> [u8; 20] {
    let mut state: [u32; 5] = [0x6745_2301, 0xefcd_ab89, 0x98ba_dcfe, 0x1032_5476, 0xc3d2_e1f0];
    let mut block = [0u8; 64];
    block[..20].copy_from_slice(xval);
    sha1::compress(&mut state, &[block.into()]);

    let mut out = [0u8; 20];
    for (word, dst) in state.iter().zip(out.chunks_mut(4)) {
        dst.copy_from_slice(&word.to_be_bytes());
    }
    out
}

/// Legacy EAP-AKA keys (RFC 4187 Section 7)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AkaKeys {
    /// MK = SHA1(Identity || IK || CK)
    pub mk: [u8; 20],
    /// K_encr
    pub k_encr: [u8; 16],
    /// K_aut
    pub k_aut: [u8; 16],
    /// MSK
    pub msk: [u8; 64],
    /// EMSK
    pub emsk: [u8; 64],
}

impl AkaKeys {
    /// Full authentication key derivation
    pub fn derive(identity: &[u8], ik: &[u8], ck: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(identity);
        hasher.update(ik);
        hasher.update(ck);
        let mk: [u8; 20] = hasher.finalize().into();

        let mut stream = fips186_prf(&mk);
        let mut keys = AkaKeys {
            mk,
            k_encr: [0; 16],
            k_aut: [0; 16],
            msk: [0; 64],
            emsk: [0; 64],
        };
        keys.k_encr.copy_from_slice(&stream[0..16]);
        keys.k_aut.copy_from_slice(&stream[16..32]);
        keys.msk.copy_from_slice(&stream[32..96]);
        keys.emsk.copy_from_slice(&stream[96..160]);
        stream.zeroize();
        keys
    }
}

/// Fast re-authentication keys (RFC 4187 Section 7)
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ReauthKeys {
    /// XKEY' = SHA1(Identity || counter || NONCE_S || MK)
    pub xkey: [u8; 20],
    /// MSK
    pub msk: [u8; 64],
    /// EMSK
    pub emsk: [u8; 64],
}

impl ReauthKeys {
    /// Derive MSK/EMSK for one re-authentication round
    pub fn derive(identity: &[u8], counter: u16, nonce_s: &[u8], mk: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(identity);
        hasher.update(counter.to_be_bytes());
        hasher.update(nonce_s);
        hasher.update(mk);
        let xkey: [u8; 20] = hasher.finalize().into();

        let mut stream = fips186_prf(&xkey);
        let mut keys = ReauthKeys {
            xkey,
            msk: [0; 64],
            emsk: [0; 64],
        };
        keys.msk.copy_from_slice(&stream[0..64]);
        keys.emsk.copy_from_slice(&stream[64..128]);
        stream.zeroize();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_sha256_reference() {
        let mac = hmac_sha256(b"key", b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(
            hex::encode(mac),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_serving_network_name_pads_mnc() {
        assert_eq!(
            serving_network_name("208", "93"),
            "5G:mnc093.mcc208.3gppnetwork.org"
        );
        assert_eq!(
            serving_network_name("310", "410"),
            "5G:mnc410.mcc310.3gppnetwork.org"
        );
    }

    #[test]
    fn test_kdf_framing() {
        let key = [0x0bu8; 32];
        let direct = kdf(&key, 0x6c, &[b"abc"]).unwrap();
        let manual = hmac_sha256(&key, &[0x6c, b'a', b'b', b'c', 0x00, 0x03]).unwrap();
        assert_eq!(direct.to_vec(), manual);
    }

    #[test]
    fn test_ck_prime_ik_prime_halves() {
        let (ck_p, ik_p) = ck_prime_ik_prime(&[1; 16], &[2; 16], b"WLAN", &[3; 6]).unwrap();
        let full = kdf(&[[1u8; 16], [2u8; 16]].concat(), 0x20, &[b"WLAN", &[3; 6]]).unwrap();
        assert_eq!(ck_p, full[..16]);
        assert_eq!(ik_p, full[16..]);
    }

    #[test]
    fn test_subscriber_keys_chain() {
        let sn = serving_network_name("208", "93");
        let keys = SubscriberKeys::five_g_aka(
            &[0x11; 16],
            &[0x22; 16],
            sn.as_bytes(),
            &[0x33; 6],
            "208930000000003",
            &[0, 0],
        )
        .unwrap();
        assert_eq!(keys.kausf, kausf(&[0x11; 16], &[0x22; 16], sn.as_bytes(), &[0x33; 6]).unwrap());
        assert_eq!(keys.kseaf, kseaf(&keys.kausf, sn.as_bytes()).unwrap());
        assert_eq!(
            keys.nas_int[2],
            nas_algorithm_key(&keys.kamf, ALG_TYPE_NAS_INT, 2).unwrap()
        );
        assert_ne!(keys.nas_enc[2], keys.nas_int[2]);
    }

    #[test]
    fn test_hres_star_is_sha256_tail() {
        let rand = [0xaau8; 16];
        let res_star = [0x55u8; 16];
        let digest = Sha256::digest([rand, res_star].concat());
        assert_eq!(hres_star(&rand, &res_star), digest[16..]);
    }

    #[test]
    fn test_aka_prime_split() {
        let keys = AkaPrimeKeys::derive(&[1; 16], &[2; 16], b"0208930000000003").unwrap();
        let mk = PrfAlgorithm::HmacSha256
            .prf_plus(&[[2u8; 16], [1u8; 16]].concat(), b"EAP-AKA'0208930000000003", 208)
            .unwrap();
        assert_eq!(keys.k_aut, mk[16..48]);
        assert_eq!(keys.emsk, mk[144..208]);
        assert_eq!(keys.kausf(), mk[144..176]);
    }

    #[test]
    fn test_fips186_prf_first_block() {
        // G(XKEY) for the zero-padded block differs from a padded SHA-1
        let xkey = [0u8; 20];
        let stream = fips186_prf(&xkey);
        let padded = Sha1::digest([0u8; 20]);
        assert_ne!(stream[..20], padded[..]);
        assert_eq!(stream[..20], sha1_g(&xkey));
    }

    #[test]
    fn test_reauth_keys_depend_on_counter() {
        let a = ReauthKeys::derive(b"reauth@example", 1, &[7; 16], &[9; 20]);
        let b = ReauthKeys::derive(b"reauth@example", 2, &[7; 16], &[9; 20]);
        assert_ne!(a.msk, b.msk);
    }
}
