//! IKE SA session state
//!
//! Holds everything one IKE SA needs between exchanges: SPIs, nonces, the
//! DH key pair, negotiated algorithms, derived keys and message counters.
//!
//! After an IKE rekey the previous generation of keys stays usable for a
//! grace period, so that late messages on the old SA (the rekey response,
//! a DELETE for the old SA) can still be decrypted and answered.

use std::time::{Duration, Instant};

use rand::RngCore;

use crate::ipsec::{
    crypto::{DhGroup, DhKeyPair, KeyMaterial, SkCodec},
    ikev2::{
        constants::{ExchangeType, IkeFlags, PayloadType},
        message::{IkeHeader, IkeMessage},
        payload::IkePayload,
        proposal::NegotiatedAlgorithms,
    },
    Error, Result,
};

/// Default lifetime of the previous key generation after a rekey
pub const DEFAULT_REKEY_GRACE: Duration = Duration::from_secs(10);

/// IKE SPI pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SpiPair {
    /// Initiator SPI
    pub initiator: [u8; 8],
    /// Responder SPI (zero until IKE_SA_INIT completes)
    pub responder: [u8; 8],
}

impl SpiPair {
    /// Fresh random initiator SPI, zero responder SPI
    pub fn generate() -> Self {
        let mut initiator = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut initiator);
        SpiPair {
            initiator,
            responder: [0u8; 8],
        }
    }

    fn matches(&self, header: &IkeHeader) -> bool {
        self.initiator == header.initiator_spi && self.responder == header.responder_spi
    }
}

/// Which key generation protects a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGeneration {
    /// Keys of the current IKE SA
    Current,
    /// Keys of the SA replaced by the last rekey
    Previous,
}

struct PreviousGeneration {
    spis: SpiPair,
    is_initiator: bool,
    keys: KeyMaterial,
    sk: SkCodec,
    expires_at: Instant,
    next_request_id: u32,
}

/// State of one IKE SA
pub struct IkeSession {
    spis: SpiPair,
    is_initiator: bool,
    next_request_id: u32,
    peer_request_id: u32,
    nonce_i: Vec<u8>,
    nonce_r: Vec<u8>,
    dh: Option<DhKeyPair>,
    algorithms: NegotiatedAlgorithms,
    keys: Option<KeyMaterial>,
    sk: Option<SkCodec>,
    null_pad_len: usize,
    previous: Option<PreviousGeneration>,
    grace: Duration,
    init_request: Vec<u8>,
    init_response: Vec<u8>,
}

impl std::fmt::Debug for IkeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IkeSession")
            .field("spi_i", &hex::encode(self.spis.initiator))
            .field("spi_r", &hex::encode(self.spis.responder))
            .field("is_initiator", &self.is_initiator)
            .field("next_request_id", &self.next_request_id)
            .field("established", &self.keys.is_some())
            .field("has_previous", &self.previous.is_some())
            .finish()
    }
}

impl IkeSession {
    /// Create a session as initiator with a random SPI
    pub fn new() -> Self {
        IkeSession {
            spis: SpiPair::generate(),
            is_initiator: true,
            next_request_id: 0,
            peer_request_id: 0,
            nonce_i: Vec::new(),
            nonce_r: Vec::new(),
            dh: None,
            algorithms: NegotiatedAlgorithms::default(),
            keys: None,
            sk: None,
            null_pad_len: 0,
            previous: None,
            grace: DEFAULT_REKEY_GRACE,
            init_request: Vec::new(),
            init_response: Vec::new(),
        }
    }

    /// Grace period for the previous key generation
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Trailing pad octets under ENCR_NULL (0 or 1)
    pub fn with_null_padding(mut self, len: usize) -> Self {
        self.null_pad_len = len;
        self
    }

    /// Start over with a fresh SPI, keeping configuration
    pub fn restart(&mut self) {
        let grace = self.grace;
        let null_pad_len = self.null_pad_len;
        *self = IkeSession::new().with_grace(grace).with_null_padding(null_pad_len);
    }

    /// Current SPI pair
    pub fn spis(&self) -> SpiPair {
        self.spis
    }

    /// Whether we were the original initiator of the current IKE SA
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Negotiated algorithms of the current IKE SA
    pub fn algorithms(&self) -> NegotiatedAlgorithms {
        self.algorithms
    }

    /// Derived keys, once established
    pub fn keys(&self) -> Result<&KeyMaterial> {
        self.keys
            .as_ref()
            .ok_or_else(|| Error::InvalidState("IKE SA not established".into()))
    }

    /// Whether keys are in place
    pub fn is_established(&self) -> bool {
        self.keys.is_some()
    }

    /// Initiator nonce
    pub fn nonce_i(&self) -> &[u8] {
        &self.nonce_i
    }

    /// Responder nonce
    pub fn nonce_r(&self) -> &[u8] {
        &self.nonce_r
    }

    /// Set our nonce for IKE_SA_INIT
    pub fn set_nonce_i(&mut self, nonce: Vec<u8>) {
        self.nonce_i = nonce;
    }

    /// Generate (or reuse) our DH key pair
    pub fn dh_public(&mut self, group: DhGroup) -> Vec<u8> {
        if self.dh.as_ref().map(|k| k.group()) != Some(group) {
            self.dh = Some(DhKeyPair::generate(group));
        }
        self.dh
            .as_ref()
            .map(|k| k.public_bytes().to_vec())
            .unwrap_or_default()
    }

    /// Store the raw IKE_SA_INIT messages for AUTH computation
    pub fn set_init_messages(&mut self, request: Vec<u8>, response: Vec<u8>) {
        self.init_request = request;
        self.init_response = response;
    }

    /// IKE_SA_INIT request as sent
    pub fn init_request(&self) -> &[u8] {
        &self.init_request
    }

    /// IKE_SA_INIT response as received
    pub fn init_response(&self) -> &[u8] {
        &self.init_response
    }

    /// Allocate the message ID of our next request
    pub fn next_message_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        id
    }

    /// Message ID the next request will use
    pub fn peek_message_id(&self) -> u32 {
        self.next_request_id
    }

    /// Header of a request we send
    pub fn request_header(&mut self, exchange_type: ExchangeType) -> IkeHeader {
        let id = self.next_message_id();
        IkeHeader::new(
            self.spis.initiator,
            self.spis.responder,
            PayloadType::None,
            exchange_type,
            IkeFlags::request(self.is_initiator),
            id,
            0,
        )
    }

    /// Header of a response to a peer request with `message_id`
    pub fn response_header(&mut self, exchange_type: ExchangeType, message_id: u32) -> IkeHeader {
        self.peer_request_id = message_id.wrapping_add(1);
        IkeHeader::new(
            self.spis.initiator,
            self.spis.responder,
            PayloadType::None,
            exchange_type,
            IkeFlags::response(self.is_initiator),
            message_id,
            0,
        )
    }

    /// Message ID expected on the next peer request
    pub fn expected_peer_request_id(&self) -> u32 {
        self.peer_request_id
    }

    /// Check that a received header answers the request with `expected_id`
    pub fn check_response(&self, header: &IkeHeader, expected_id: u32) -> Result<()> {
        if !header.flags.is_response() {
            return Err(Error::InvalidMessage("Expected a response".into()));
        }
        if header.message_id != expected_id {
            return Err(Error::InvalidMessage(format!(
                "Message ID mismatch: expected {}, got {}",
                expected_id, header.message_id
            )));
        }
        if !header.belongs_to(&self.spis.initiator, &self.spis.responder) {
            return Err(Error::InvalidMessage("IKE SPI mismatch".into()));
        }
        Ok(())
    }

    /// Complete IKE_SA_INIT: compute the shared secret and derive keys
    pub fn establish(
        &mut self,
        spi_r: [u8; 8],
        nonce_r: Vec<u8>,
        peer_public: &[u8],
        algorithms: NegotiatedAlgorithms,
    ) -> Result<()> {
        let dh = self
            .dh
            .as_ref()
            .ok_or_else(|| Error::InvalidState("No DH key pair".into()))?;
        let shared = dh.compute_shared(peer_public)?;
        let prf = algorithms.prf()?;

        self.spis.responder = spi_r;
        self.nonce_r = nonce_r;
        let keys = KeyMaterial::derive(
            prf,
            &self.nonce_i,
            &self.nonce_r,
            &shared,
            &self.spis.initiator,
            &self.spis.responder,
            algorithms.encr_key_len(),
            algorithms.integ_key_len(),
        )?;

        self.sk = Some(SkCodec::new(algorithms.encr, algorithms.integ)?.with_null_padding(self.null_pad_len));
        self.keys = Some(keys);
        self.algorithms = algorithms;
        self.dh = None;

        crate::ipsec::logging::log_ike_sa_established(
            &self.spis.initiator,
            &self.spis.responder,
            &format!("{:?}/{:?}/{:?}", algorithms.encr, algorithms.integ, prf),
        );
        Ok(())
    }

    fn codec(&self) -> Result<(&KeyMaterial, &SkCodec)> {
        match (&self.keys, &self.sk) {
            (Some(keys), Some(sk)) => Ok((keys, sk)),
            _ => Err(Error::InvalidState("IKE SA not established".into())),
        }
    }

    /// Protect `inner` with the current keys
    pub fn protect(&self, header: &IkeHeader, inner: &[IkePayload]) -> Result<Vec<u8>> {
        let (keys, sk) = self.codec()?;
        sk.protect(keys, header, inner)
    }

    /// Protect `inner` with the keys of a given generation
    ///
    /// The header SPIs of the previous generation are substituted.
    pub fn protect_with(
        &self,
        generation: KeyGeneration,
        header: &IkeHeader,
        inner: &[IkePayload],
    ) -> Result<Vec<u8>> {
        match generation {
            KeyGeneration::Current => self.protect(header, inner),
            KeyGeneration::Previous => {
                let prev = self.live_previous()?;
                let mut header = header.clone();
                header.initiator_spi = prev.spis.initiator;
                header.responder_spi = prev.spis.responder;
                header.flags = if header.flags.is_response() {
                    IkeFlags::response(prev.is_initiator)
                } else {
                    IkeFlags::request(prev.is_initiator)
                };
                prev.sk.protect(&prev.keys, &header, inner)
            }
        }
    }

    /// Allocate a request ID on the previous generation
    pub fn previous_message_id(&mut self) -> Result<u32> {
        let now = Instant::now();
        match self.previous.as_mut() {
            Some(prev) if prev.expires_at > now => {
                let id = prev.next_request_id;
                prev.next_request_id = prev.next_request_id.wrapping_add(1);
                Ok(id)
            }
            _ => Err(Error::SaNotFound("previous IKE SA".into())),
        }
    }

    fn live_previous(&self) -> Result<&PreviousGeneration> {
        match &self.previous {
            Some(prev) if prev.expires_at > Instant::now() => Ok(prev),
            _ => Err(Error::SaNotFound("previous IKE SA".into())),
        }
    }

    /// Pick the key generation for a received header by its SPIs
    pub fn classify(&self, header: &IkeHeader) -> Result<KeyGeneration> {
        if self.spis.matches(header) {
            return Ok(KeyGeneration::Current);
        }
        if let Ok(prev) = self.live_previous() {
            if prev.spis.matches(header) {
                return Ok(KeyGeneration::Previous);
            }
        }
        Err(Error::SaNotFound(format!(
            "IKE SA {}/{}",
            hex::encode(header.initiator_spi),
            hex::encode(header.responder_spi)
        )))
    }

    /// Verify and decrypt a received protected message
    pub fn unprotect(&self, data: &[u8]) -> Result<(IkeMessage, KeyGeneration)> {
        let header = IkeHeader::from_bytes(data)?;
        let generation = self.classify(&header)?;
        let msg = match generation {
            KeyGeneration::Current => {
                let (keys, sk) = self.codec()?;
                sk.unprotect(keys, data)?
            }
            KeyGeneration::Previous => {
                let prev = self.live_previous()?;
                prev.sk.unprotect(&prev.keys, data)?
            }
        };
        Ok((msg, generation))
    }

    /// Install a rekeyed IKE SA
    ///
    /// * `new_spis` - SPIs of the new SA, initiator of the rekey exchange first
    /// * `nonce_i`, `nonce_r` - nonces of the rekey exchange, same order
    /// * `shared` - DH shared secret of the rekey exchange
    /// * `locally_initiated` - whether we initiated the rekey exchange
    ///
    /// The replaced keys stay available as [`KeyGeneration::Previous`]
    /// until the grace period ends.
    #[allow(clippy::too_many_arguments)]
    pub fn rekey(
        &mut self,
        new_spis: SpiPair,
        nonce_i: Vec<u8>,
        nonce_r: Vec<u8>,
        shared: &[u8],
        algorithms: NegotiatedAlgorithms,
        locally_initiated: bool,
    ) -> Result<()> {
        let old_keys = self.keys()?.clone();
        let new_keys = old_keys.derive_rekey(
            self.algorithms.prf()?,
            algorithms.prf()?,
            &nonce_i,
            &nonce_r,
            shared,
            &new_spis.initiator,
            &new_spis.responder,
            algorithms.encr_key_len(),
            algorithms.integ_key_len(),
        )?;
        let new_sk =
            SkCodec::new(algorithms.encr, algorithms.integ)?.with_null_padding(self.null_pad_len);

        let (_, old_sk) = self.codec()?;
        let old_spis = self.spis;
        self.previous = Some(PreviousGeneration {
            spis: self.spis,
            is_initiator: self.is_initiator,
            keys: old_keys,
            sk: *old_sk,
            expires_at: Instant::now() + self.grace,
            next_request_id: self.next_request_id,
        });

        self.spis = new_spis;
        self.is_initiator = locally_initiated;
        self.nonce_i = nonce_i;
        self.nonce_r = nonce_r;
        self.keys = Some(new_keys);
        self.sk = Some(new_sk);
        self.algorithms = algorithms;
        self.next_request_id = 0;
        self.peer_request_id = 0;

        crate::ipsec::logging::log_ike_rekey_complete(
            &old_spis.initiator,
            &self.spis.initiator,
            &self.spis.responder,
        );
        Ok(())
    }

    /// Forget the previous generation (old SA deleted)
    pub fn drop_previous(&mut self) {
        self.previous = None;
    }

    /// Drop the previous generation once its grace period has ended
    pub fn expire_previous(&mut self) -> bool {
        let expired = matches!(&self.previous, Some(prev) if prev.expires_at <= Instant::now());
        if expired {
            self.previous = None;
        }
        expired
    }

    /// SPIs of the previous generation while it is alive
    pub fn previous_spis(&self) -> Option<SpiPair> {
        self.live_previous().ok().map(|p| p.spis)
    }
}

impl Default for IkeSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::crypto::{EncrAlgorithm, IntegAlgorithm, PrfAlgorithm};
    use crate::ipsec::ikev2::payload::NotifyPayload;

    fn algorithms() -> NegotiatedAlgorithms {
        NegotiatedAlgorithms {
            encr: EncrAlgorithm::AesCbc { key_len: 16 },
            integ: IntegAlgorithm::HmacSha256_128,
            prf: Some(PrfAlgorithm::HmacSha256),
            dh: Some(DhGroup::Modp2048),
            esn: false,
        }
    }

    /// Two sessions sharing keys, as seen from both ends
    fn established_pair() -> (IkeSession, IkeSession) {
        let mut ue = IkeSession::new();
        ue.set_nonce_i(vec![1; 32]);
        let ue_pub = ue.dh_public(DhGroup::Modp2048);

        let mut peer = IkeSession::new();
        peer.spis.initiator = ue.spis.initiator;
        peer.is_initiator = false;
        peer.set_nonce_i(vec![1; 32]);
        let peer_pub = peer.dh_public(DhGroup::Modp2048);

        ue.establish([9; 8], vec![2; 32], &peer_pub, algorithms()).unwrap();
        peer.establish([9; 8], vec![2; 32], &ue_pub, algorithms()).unwrap();
        (ue, peer)
    }

    fn info(session: &mut IkeSession) -> Vec<u8> {
        let header = session.request_header(ExchangeType::Informational);
        session
            .protect(&header, &[IkePayload::N(NotifyPayload::new(16384, vec![]))])
            .unwrap()
    }

    #[test]
    fn test_message_ids_increment() {
        let mut s = IkeSession::new();
        assert_eq!(s.next_message_id(), 0);
        assert_eq!(s.next_message_id(), 1);
        assert_eq!(s.peek_message_id(), 2);
        let h = s.request_header(ExchangeType::IkeAuth);
        assert_eq!(h.message_id, 2);
        assert!(h.flags.is_initiator());
        assert!(!h.flags.is_response());
    }

    #[test]
    fn test_check_response() {
        let mut s = IkeSession::new();
        let req = s.request_header(ExchangeType::IkeSaInit);
        let mut resp = req.clone();
        resp.flags = IkeFlags::new(IkeFlags::RESPONSE);
        assert!(s.check_response(&resp, 0).is_ok());
        assert!(s.check_response(&resp, 1).is_err());
        assert!(s.check_response(&req, 0).is_err());
    }

    #[test]
    fn test_establish_and_exchange() {
        let (mut ue, peer) = established_pair();
        assert!(ue.is_established());
        assert_eq!(ue.keys().unwrap(), peer.keys().unwrap());

        let bytes = info(&mut ue);
        let (msg, generation) = peer.unprotect(&bytes).unwrap();
        assert_eq!(generation, KeyGeneration::Current);
        assert!(msg.notify(16384).is_some());
    }

    #[test]
    fn test_establish_null_encryption_without_integrity() {
        let null = NegotiatedAlgorithms {
            encr: EncrAlgorithm::Null,
            integ: IntegAlgorithm::None,
            ..algorithms()
        };
        let mut ue = IkeSession::new();
        ue.set_nonce_i(vec![1; 32]);
        let ue_pub = ue.dh_public(DhGroup::Modp2048);
        let mut peer = IkeSession::new();
        peer.spis.initiator = ue.spis.initiator;
        peer.is_initiator = false;
        peer.set_nonce_i(vec![1; 32]);
        let peer_pub = peer.dh_public(DhGroup::Modp2048);

        ue.establish([9; 8], vec![2; 32], &peer_pub, null).unwrap();
        peer.establish([9; 8], vec![2; 32], &ue_pub, null).unwrap();
        assert!(ue.keys().unwrap().sk_ai.is_empty());

        let bytes = info(&mut ue);
        let (msg, _) = peer.unprotect(&bytes).unwrap();
        assert!(msg.notify(16384).is_some());

        let new_spis = SpiPair {
            initiator: [3; 8],
            responder: [4; 8],
        };
        ue.rekey(new_spis, vec![5; 32], vec![6; 32], &[7; 256], null, true)
            .unwrap();
        assert_eq!(ue.algorithms().integ, IntegAlgorithm::None);
    }

    #[test]
    fn test_not_established() {
        let s = IkeSession::new();
        assert!(matches!(s.keys(), Err(Error::InvalidState(_))));
        let header = IkeHeader::new(
            s.spis.initiator,
            [0; 8],
            PayloadType::None,
            ExchangeType::Informational,
            IkeFlags::request(true),
            0,
            0,
        );
        assert!(s.protect(&header, &[]).is_err());
    }

    #[test]
    fn test_rekey_keeps_previous_generation() {
        let (mut ue, mut peer) = established_pair();
        let new_spis = SpiPair {
            initiator: [3; 8],
            responder: [4; 8],
        };
        for s in [&mut ue, &mut peer] {
            let initiated = s.is_initiator;
            s.rekey(new_spis, vec![5; 32], vec![6; 32], &[7; 256], algorithms(), initiated)
                .unwrap();
        }
        assert_eq!(ue.spis(), new_spis);
        assert_eq!(ue.peek_message_id(), 0);
        assert_ne!(ue.keys().unwrap().sk_ei, ue.live_previous().unwrap().keys.sk_ei);

        // new SA
        let bytes = info(&mut ue);
        assert_eq!(peer.unprotect(&bytes).unwrap().1, KeyGeneration::Current);

        // old SA, e.g. the DELETE for it
        let id = ue.previous_message_id().unwrap();
        let header = IkeHeader::new(
            [0; 8],
            [0; 8],
            PayloadType::None,
            ExchangeType::Informational,
            IkeFlags::request(true),
            id,
            0,
        );
        let bytes = ue
            .protect_with(KeyGeneration::Previous, &header, &[])
            .unwrap();
        let (msg, generation) = peer.unprotect(&bytes).unwrap();
        assert_eq!(generation, KeyGeneration::Previous);
        assert_eq!(msg.header.message_id, id);

        peer.drop_previous();
        assert!(matches!(peer.unprotect(&bytes), Err(Error::SaNotFound(_))));
    }

    #[test]
    fn test_previous_generation_expires() {
        let (mut ue, _) = established_pair();
        ue.grace = Duration::ZERO;
        ue.rekey(
            SpiPair {
                initiator: [3; 8],
                responder: [4; 8],
            },
            vec![5; 32],
            vec![6; 32],
            &[7; 256],
            algorithms(),
            true,
        )
        .unwrap();
        assert!(ue.previous_spis().is_none());
        assert!(ue.expire_previous());
        assert!(!ue.expire_previous());
    }

    #[test]
    fn test_restart_changes_spi() {
        let (mut ue, _) = established_pair();
        let old = ue.spis();
        ue.restart();
        assert_ne!(ue.spis().initiator, old.initiator);
        assert!(!ue.is_established());
        assert_eq!(ue.peek_message_id(), 0);
    }
}
