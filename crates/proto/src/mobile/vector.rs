//! Authentication vectors and per-session authentication state

use n3ue_platform::{AuthVectorProvider, VectorResponse};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ipsec::{Error, Result};
use crate::mobile::kdf::{self, AkaKeys, AkaPrimeKeys, ReauthKeys, SubscriberKeys};

/// RES of the fixed fallback vector
pub const DEFAULT_RES: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
/// CK of the fixed fallback vector
pub const DEFAULT_CK: [u8; 16] = [
    0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef,
];
/// IK of the fixed fallback vector
pub const DEFAULT_IK: [u8; 16] = DEFAULT_CK;

/// The fixed fallback vector
pub fn default_vector() -> VectorResponse {
    VectorResponse::Success {
        res: DEFAULT_RES.to_vec(),
        ck: DEFAULT_CK.to_vec(),
        ik: DEFAULT_IK.to_vec(),
    }
}

/// Ask the provider for RES/CK/IK or AUTS
///
/// With `fallback` set, a provider failure yields [`default_vector`]
/// instead of an error. A MAC failure reported by the provider is
/// still returned as an error when `fallback` is off.
pub async fn resolve_vector(
    provider: &dyn AuthVectorProvider,
    rand: &[u8; 16],
    autn: &[u8; 16],
    fallback: bool,
) -> Result<VectorResponse> {
    match provider.resolve(rand, autn).await {
        Ok(response) => {
            debug!(
                provider = provider.id(),
                sync_failure = response.is_sync_failure(),
                "Authentication vector resolved"
            );
            Ok(response)
        }
        Err(e) if fallback => {
            warn!(
                provider = provider.id(),
                error = %e,
                "Vector provider failed, using the default vector"
            );
            Ok(default_vector())
        }
        Err(e) => Err(e.into()),
    }
}

fn to_16(v: &[u8], what: &str) -> Result<[u8; 16]> {
    v.try_into().map_err(|_| {
        Error::InvalidParameter(format!("{} must be 16 bytes, got {}", what, v.len()))
    })
}

/// Fast re-authentication state handed out by the network
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ReauthState {
    /// Identity to present on the next run
    #[zeroize(skip)]
    pub identity: String,
    /// MK of the full authentication the identity belongs to
    pub mk: [u8; 20],
    /// K_encr of that full authentication
    pub k_encr: [u8; 16],
    /// K_aut of that full authentication
    pub k_aut: [u8; 16],
    /// Highest AT_COUNTER accepted
    pub counter: u16,
}

impl std::fmt::Debug for ReauthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReauthState")
            .field("identity", &self.identity)
            .field("counter", &self.counter)
            .finish()
    }
}

/// Everything learnt while authenticating one session
///
/// Rebuilt on every full run, except for [`ReauthState`] which survives
/// a reauthentication.
#[derive(Default)]
pub struct AuthenticationContext {
    /// Identity used in IDi and as EAP identity
    pub identity: String,
    /// RAND of the last challenge
    pub rand: Option<[u8; 16]>,
    /// AUTN of the last challenge
    pub autn: Option<[u8; 16]>,
    /// RES of the last challenge
    pub res: Vec<u8>,
    /// CK of the last challenge
    pub ck: Vec<u8>,
    /// IK of the last challenge
    pub ik: Vec<u8>,
    /// AUTS when the last challenge failed synchronisation
    pub auts: Option<Vec<u8>>,
    /// 5G key hierarchy (NWu, or EAP-AKA' with KAUSF)
    pub subscriber: Option<SubscriberKeys>,
    /// EAP-AKA' keys
    pub aka_prime: Option<AkaPrimeKeys>,
    /// EAP-AKA keys
    pub aka: Option<AkaKeys>,
    /// Keys of the last fast re-authentication
    pub reauth_keys: Option<ReauthKeys>,
    /// Fast re-authentication identity and keys
    pub reauth: Option<ReauthState>,
    /// MSK fed into AUTH (EAP-AKA/AKA')
    pub msk: Option<Vec<u8>>,
    /// Kn3iwf fed into AUTH (EAP-5G)
    pub kn3iwf: Option<[u8; 32]>,
}

impl std::fmt::Debug for AuthenticationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationContext")
            .field("identity", &self.identity)
            .field("has_challenge", &self.rand.is_some())
            .field("sync_failure", &self.auts.is_some())
            .field("has_msk", &self.msk.is_some())
            .field("has_kn3iwf", &self.kn3iwf.is_some())
            .field("reauth", &self.reauth)
            .finish()
    }
}

impl Drop for AuthenticationContext {
    fn drop(&mut self) {
        self.res.zeroize();
        self.ck.zeroize();
        self.ik.zeroize();
        if let Some(msk) = self.msk.as_mut() {
            msk.zeroize();
        }
        if let Some(k) = self.kn3iwf.as_mut() {
            k.zeroize();
        }
    }
}

impl AuthenticationContext {
    /// Fresh context for an identity
    pub fn new(identity: impl Into<String>) -> Self {
        let mut ctx = AuthenticationContext::default();
        ctx.identity = identity.into();
        ctx
    }

    /// Clear per-run state, keeping the identity and fast reauth state
    pub fn reset(&mut self) {
        let identity = std::mem::take(&mut self.identity);
        let reauth = self.reauth.take();
        *self = AuthenticationContext::new(identity);
        self.reauth = reauth;
    }

    /// Record a challenge and the provider's answer
    ///
    /// # Errors
    ///
    /// [`Error::SynchFailure`] when the provider returned AUTS; the AUTS
    /// is kept in [`AuthenticationContext::auts`].
    pub fn record(&mut self, rand: &[u8], autn: &[u8], response: VectorResponse) -> Result<()> {
        self.rand = Some(to_16(rand, "RAND")?);
        self.autn = Some(to_16(autn, "AUTN")?);
        match response {
            VectorResponse::Success { res, ck, ik } => {
                self.res = res;
                self.ck = ck;
                self.ik = ik;
                self.auts = None;
                Ok(())
            }
            VectorResponse::SyncFailure { auts } => {
                self.auts = Some(auts);
                Err(Error::SynchFailure)
            }
        }
    }

    /// SQN xor AK, the first six octets of AUTN
    pub fn sqn_xor_ak(&self) -> Result<[u8; 6]> {
        let autn = self
            .autn
            .ok_or_else(|| Error::InvalidState("No challenge recorded".into()))?;
        let mut out = [0u8; 6];
        out.copy_from_slice(&autn[..6]);
        Ok(out)
    }

    fn challenge(&self) -> Result<[u8; 16]> {
        self.rand
            .ok_or_else(|| Error::InvalidState("No challenge recorded".into()))
    }

    /// 5G-AKA: RES* for the authentication response, deriving KAUSF..KAMF
    pub fn five_g_aka(&mut self, sn_name: &str, supi: &str, abba: &[u8]) -> Result<[u8; 16]> {
        let rand = self.challenge()?;
        let sqn_xor_ak = self.sqn_xor_ak()?;
        let res_star = kdf::res_star(&self.ck, &self.ik, sn_name.as_bytes(), &rand, &self.res)?;
        self.subscriber = Some(SubscriberKeys::five_g_aka(
            &self.ck,
            &self.ik,
            sn_name.as_bytes(),
            &sqn_xor_ak,
            supi,
            abba,
        )?);
        Ok(res_star)
    }

    /// EAP-AKA' keys; `network_name` is AT_KDF_INPUT
    ///
    /// Also derives the 5G hierarchy below EMSK when `supi` is given.
    pub fn aka_prime(
        &mut self,
        network_name: &[u8],
        supi: Option<(&str, &[u8])>,
    ) -> Result<&AkaPrimeKeys> {
        let sqn_xor_ak = self.sqn_xor_ak()?;
        let (ck_prime, ik_prime) =
            kdf::ck_prime_ik_prime(&self.ck, &self.ik, network_name, &sqn_xor_ak)?;
        let keys = AkaPrimeKeys::derive(&ck_prime, &ik_prime, self.identity.as_bytes())?;
        if let Some((supi, abba)) = supi {
            self.subscriber = Some(SubscriberKeys::from_kausf(
                keys.kausf(),
                network_name,
                supi,
                abba,
            )?);
        }
        self.msk = Some(keys.msk.to_vec());
        Ok(self.aka_prime.insert(keys))
    }

    /// Legacy EAP-AKA keys
    pub fn aka(&mut self) -> Result<&AkaKeys> {
        if self.ck.is_empty() || self.ik.is_empty() {
            return Err(Error::InvalidState("No CK/IK recorded".into()));
        }
        let keys = AkaKeys::derive(self.identity.as_bytes(), &self.ik, &self.ck);
        self.msk = Some(keys.msk.to_vec());
        Ok(self.aka.insert(keys))
    }

    /// Remember a fast reauth identity from AT_NEXT_REAUTH_ID
    pub fn store_reauth_identity(&mut self, identity: String) -> Result<()> {
        let keys = self
            .aka
            .as_ref()
            .ok_or_else(|| Error::InvalidState("Reauth identity without EAP-AKA keys".into()))?;
        self.reauth = Some(ReauthState {
            identity,
            mk: keys.mk,
            k_encr: keys.k_encr,
            k_aut: keys.k_aut,
            counter: 0,
        });
        Ok(())
    }

    /// Fast reauthentication keys for a received counter and NONCE_S
    ///
    /// # Errors
    ///
    /// [`Error::AuthenticationFailed`] when the counter is not larger than
    /// the last accepted one.
    pub fn reauthenticate(&mut self, counter: u16, nonce_s: &[u8]) -> Result<&ReauthKeys> {
        let state = self
            .reauth
            .as_mut()
            .ok_or_else(|| Error::InvalidState("No fast reauth identity".into()))?;
        if counter <= state.counter && state.counter != 0 {
            return Err(Error::AuthenticationFailed(format!(
                "AT_COUNTER {} not above {}",
                counter, state.counter
            )));
        }
        state.counter = counter;
        let keys = ReauthKeys::derive(state.identity.as_bytes(), counter, nonce_s, &state.mk);
        self.msk = Some(keys.msk.to_vec());
        Ok(self.reauth_keys.insert(keys))
    }

    /// Kn3iwf for the AUTH payload of EAP-5G
    pub fn derive_kn3iwf(&mut self, uplink_count: u32) -> Result<[u8; 32]> {
        let keys = self
            .subscriber
            .as_ref()
            .ok_or_else(|| Error::InvalidState("No KAMF".into()))?;
        let k = kdf::kn3iwf(&keys.kamf, uplink_count, kdf::ACCESS_TYPE_NON_3GPP)?;
        self.kn3iwf = Some(k);
        Ok(k)
    }

    /// Shared key for the AUTH payload: Kn3iwf on NWu, otherwise MSK
    pub fn auth_key(&self) -> Result<Vec<u8>> {
        if let Some(k) = self.kn3iwf {
            return Ok(k.to_vec());
        }
        self.msk
            .clone()
            .ok_or_else(|| Error::InvalidState("No MSK for AUTH".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use n3ue_platform::{Collaborator, PlatformError, PlatformResult};

    struct Broken;

    impl Collaborator for Broken {
        fn id(&self) -> &'static str {
            "broken"
        }

        fn description(&self) -> &'static str {
            "Always fails"
        }
    }

    #[async_trait]
    impl AuthVectorProvider for Broken {
        async fn resolve(&self, _rand: &[u8; 16], _autn: &[u8; 16]) -> PlatformResult<VectorResponse> {
            Err(PlatformError::Unavailable("modem".into()))
        }
    }

    #[tokio::test]
    async fn test_fallback_is_opt_in() {
        let err = resolve_vector(&Broken, &[0; 16], &[0; 16], false).await.unwrap_err();
        assert!(matches!(err, Error::VectorProvider(_)));

        let v = resolve_vector(&Broken, &[0; 16], &[0; 16], true).await.unwrap();
        assert_eq!(v, default_vector());
    }

    #[test]
    fn test_record_sync_failure() {
        let mut ctx = AuthenticationContext::new("0208930000000003@nai.5gc.mnc093.mcc208.3gppnetwork.org");
        let err = ctx
            .record(&[1; 16], &[2; 16], VectorResponse::SyncFailure { auts: vec![3; 14] })
            .unwrap_err();
        assert_eq!(err, Error::SynchFailure);
        assert_eq!(ctx.auts, Some(vec![3; 14]));
    }

    #[test]
    fn test_five_g_aka_matches_kdf() {
        let mut ctx = AuthenticationContext::new("imsi");
        ctx.record(&[1; 16], &[2; 16], default_vector()).unwrap();
        let sn = kdf::serving_network_name("208", "93");
        let res_star = ctx.five_g_aka(&sn, "208930000000003", &[0, 0]).unwrap();

        let expected = kdf::res_star(&DEFAULT_CK, &DEFAULT_IK, sn.as_bytes(), &[1; 16], &DEFAULT_RES).unwrap();
        assert_eq!(res_star, expected);
        let keys = ctx.subscriber.as_ref().unwrap();
        let kausf = kdf::kausf(&DEFAULT_CK, &DEFAULT_IK, sn.as_bytes(), &[2; 6]).unwrap();
        assert_eq!(keys.kausf, kausf);

        let k1 = ctx.derive_kn3iwf(0).unwrap();
        assert_eq!(ctx.auth_key().unwrap(), k1.to_vec());
    }

    #[test]
    fn test_reauth_counter_must_grow() {
        let mut ctx = AuthenticationContext::new("0208930000000003@wlan.mnc093.mcc208.3gppnetwork.org");
        ctx.record(&[1; 16], &[2; 16], default_vector()).unwrap();
        ctx.aka().unwrap();
        ctx.store_reauth_identity("reauth-1@realm".into()).unwrap();

        let msk1 = ctx.reauthenticate(1, &[9; 16]).unwrap().msk;
        assert!(ctx.reauthenticate(1, &[9; 16]).is_err());
        let msk2 = ctx.reauthenticate(2, &[9; 16]).unwrap().msk;
        assert_ne!(msk1, msk2);

        ctx.reset();
        assert!(ctx.reauth.is_some());
        assert!(ctx.msk.is_none());
    }
}
