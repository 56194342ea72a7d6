//! IKEv2 Authentication
//!
//! Implements the shared-key AUTH computation of RFC 7296 Section 2.15.
//! With EAP (Section 2.16) the shared key is the EAP MSK, or for the
//! EAP-5G method the N3IWF key derived from K_AMF.

use subtle::ConstantTimeEq;

use super::payload::{AuthMethod, AuthPayload, IdPayload};
use crate::ipsec::crypto::PrfAlgorithm;
use crate::ipsec::{Error, Result};

/// Key pad for IKEv2 (RFC 7296 Section 2.15)
pub const KEY_PAD_IKEV2: &[u8] = b"Key Pad for IKEv2";

/// Construct signed octets (RFC 7296 Section 2.15)
///
/// ```text
/// SignedOctets = RealMessage | Nonce (peer) | prf(SK_p, ID')
/// ```
///
/// * `real_message` - the IKE_SA_INIT message the signer sent, byte for byte
/// * `peer_nonce` - nonce data of the other side
/// * `sk_p` - SK_pi for the initiator, SK_pr for the responder
/// * `id` - the signer's identity; `ID'` is its payload body
pub fn signed_octets(
    prf_alg: PrfAlgorithm,
    real_message: &[u8],
    peer_nonce: &[u8],
    sk_p: &[u8],
    id: &IdPayload,
) -> Result<Vec<u8>> {
    let mut octets = Vec::with_capacity(real_message.len() + peer_nonce.len() + prf_alg.output_len());
    octets.extend_from_slice(real_message);
    octets.extend_from_slice(peer_nonce);
    octets.extend_from_slice(&prf_alg.compute(sk_p, &id.to_payload_data())?);
    Ok(octets)
}

/// Compute a shared-key AUTH payload
///
/// ```text
/// AUTH = prf(prf(Shared Secret, "Key Pad for IKEv2"), <SignedOctets>)
/// ```
pub fn compute_shared_key_auth(
    prf_alg: PrfAlgorithm,
    shared_key: &[u8],
    signed_octets: &[u8],
) -> Result<AuthPayload> {
    let padded_key = prf_alg.compute(shared_key, KEY_PAD_IKEV2)?;
    let auth_data = prf_alg.compute(&padded_key, signed_octets)?;
    Ok(AuthPayload::new(AuthMethod::SharedKeyMic, auth_data))
}

/// Verify a received shared-key AUTH payload
///
/// # Errors
///
/// Returns [`Error::AuthenticationFailed`] if the method is not a shared key
/// MIC or the value differs.
pub fn verify_shared_key_auth(
    prf_alg: PrfAlgorithm,
    shared_key: &[u8],
    signed_octets: &[u8],
    received: &AuthPayload,
) -> Result<()> {
    if received.auth_method != AuthMethod::SharedKeyMic {
        return Err(Error::AuthenticationFailed(format!(
            "Expected shared key MIC, got {:?}",
            received.auth_method
        )));
    }

    let expected = compute_shared_key_auth(prf_alg, shared_key, signed_octets)?;
    if expected.auth_data.len() != received.auth_data.len()
        || !bool::from(expected.auth_data.ct_eq(&received.auth_data))
    {
        return Err(Error::AuthenticationFailed(
            "AUTH verification failed".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn octets() -> Vec<u8> {
        signed_octets(
            PrfAlgorithm::HmacSha256,
            &[0xaa; 300],
            &[0xbb; 16],
            &[0x01; 32],
            &IdPayload::from_fqdn("n3iwf.example"),
        )
        .unwrap()
    }

    #[test]
    fn test_signed_octets_layout() {
        let o = octets();
        assert_eq!(o.len(), 300 + 16 + 32);
        assert_eq!(&o[..300], &[0xaa; 300][..]);
        assert_eq!(&o[300..316], &[0xbb; 16]);

        let id_hash = PrfAlgorithm::HmacSha256
            .compute(&[0x01; 32], &IdPayload::from_fqdn("n3iwf.example").to_payload_data())
            .unwrap();
        assert_eq!(&o[316..], &id_hash[..]);
    }

    #[test]
    fn test_compute_and_verify() {
        let msk = vec![0x42; 64];
        let auth = compute_shared_key_auth(PrfAlgorithm::HmacSha256, &msk, &octets()).unwrap();
        assert_eq!(auth.auth_method, AuthMethod::SharedKeyMic);
        assert_eq!(auth.auth_data.len(), 32);

        assert!(verify_shared_key_auth(PrfAlgorithm::HmacSha256, &msk, &octets(), &auth).is_ok());
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let auth = compute_shared_key_auth(PrfAlgorithm::HmacSha1, &[1; 64], &octets()).unwrap();
        assert!(matches!(
            verify_shared_key_auth(PrfAlgorithm::HmacSha1, &[2; 64], &octets(), &auth),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_verify_rejects_wrong_method() {
        let mut auth = compute_shared_key_auth(PrfAlgorithm::HmacSha256, &[1; 32], &octets()).unwrap();
        auth.auth_method = AuthMethod::RsaSig;
        assert!(verify_shared_key_auth(PrfAlgorithm::HmacSha256, &[1; 32], &octets(), &auth).is_err());
    }
}
