//! Child SA (Security Association) management
//!
//! Child SAs are negotiated inside IKE_AUTH or CREATE_CHILD_SA and protect
//! the data traffic with ESP. Each child session is a pair of ESP SAs, one
//! per direction, sharing one negotiated algorithm set.
//!
//! # Key Derivation
//!
//! Child SA keys are derived from the IKE SA's SK_d key:
//!
//! ```text
//! KEYMAT = prf+(SK_d, Ni | Nr)
//!
//! For PFS (Perfect Forward Secrecy):
//! KEYMAT = prf+(SK_d, g^ir (new) | Ni | Nr)
//!
//! Key split:
//! SK_ei | SK_ai | SK_er | SK_ar = KEYMAT
//! ```
//!
//! "i" and "r" refer to the initiator of the exchange that created the
//! child SA, which for a peer-initiated rekey is the peer.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::ipsec::{
    crypto::{ChildKeyMaterial, PrfAlgorithm},
    esp::EspSa,
    ikev2::proposal::NegotiatedAlgorithms,
    Error, Result,
};

/// Child SA State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSaState {
    /// SA is active and can be used for traffic
    Active,

    /// A CREATE_CHILD_SA replacing this SA is in flight
    ///
    /// The SA keeps carrying traffic until the replacement is installed.
    Rekeying,

    /// Replaced by a newer SA, waiting for its DELETE
    Rekeyed,

    /// SA has been deleted
    Deleted,
}

/// What a child SA carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// Signaling SA (NAS over TCP, or the whole tunnel on SWu)
    Signaling,
    /// User plane SA created by the N3IWF
    UserPlane {
        /// QoS flow identifier placed in the GRE key field
        qfi: u8,
        /// Tunnel endpoint of the user plane on the N3IWF side
        up_address: Option<Ipv4Addr>,
    },
}

impl ChildKind {
    /// Whether this is a user plane SA
    pub fn is_user_plane(self) -> bool {
        matches!(self, ChildKind::UserPlane { .. })
    }
}

/// Allocate an SPI for an inbound SA
///
/// Values 1..=255 are reserved by IANA.
pub fn generate_spi() -> u32 {
    rand::thread_rng().gen_range(0x100..=u32::MAX)
}

/// Child Security Association pair
#[derive(Debug, Clone)]
pub struct ChildSession {
    /// SPI we allocated; carried by packets we receive
    pub spi_in: u32,

    /// SPI the peer allocated; carried by packets we send
    pub spi_out: u32,

    /// Negotiated ESP algorithms
    pub algorithms: NegotiatedAlgorithms,

    /// Traffic carried by this SA
    pub kind: ChildKind,

    keys: ChildKeyMaterial,
    locally_initiated: bool,
    state: ChildSaState,
    created_at: Instant,
}

impl ChildSession {
    /// Derive a child session from the IKE SA
    ///
    /// # Arguments
    ///
    /// * `prf` - PRF of the IKE SA
    /// * `sk_d` - SK_d of the IKE SA
    /// * `shared_secret` - DH secret of the exchange, when PFS was negotiated
    /// * `nonce_i`, `nonce_r` - nonces of the exchange, initiator first
    /// * `locally_initiated` - whether we initiated the exchange
    #[allow(clippy::too_many_arguments)]
    pub fn derive(
        prf: PrfAlgorithm,
        sk_d: &[u8],
        shared_secret: Option<&[u8]>,
        nonce_i: &[u8],
        nonce_r: &[u8],
        algorithms: NegotiatedAlgorithms,
        spi_in: u32,
        spi_out: u32,
        locally_initiated: bool,
        kind: ChildKind,
    ) -> Result<Self> {
        if spi_in == 0 || spi_out == 0 {
            return Err(Error::InvalidSpi(0));
        }
        let keys = ChildKeyMaterial::derive(
            prf,
            sk_d,
            shared_secret,
            nonce_i,
            nonce_r,
            algorithms.encr_key_len(),
            algorithms.integ_key_len(),
        )?;

        crate::ipsec::logging::log_child_sa_created(spi_in, spi_out, kind.is_user_plane());
        Ok(ChildSession {
            spi_in,
            spi_out,
            algorithms,
            kind,
            keys,
            locally_initiated,
            state: ChildSaState::Active,
            created_at: Instant::now(),
        })
    }

    /// Whether we initiated the exchange that created this SA
    pub fn locally_initiated(&self) -> bool {
        self.locally_initiated
    }

    /// Current state
    pub fn state(&self) -> ChildSaState {
        self.state
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Raw key material
    pub fn keys(&self) -> &ChildKeyMaterial {
        &self.keys
    }

    fn directional_keys(&self, outbound: bool) -> (&[u8], &[u8]) {
        // initiator -> responder keys come first in KEYMAT
        if outbound == self.locally_initiated {
            (&self.keys.sk_ei, &self.keys.sk_ai)
        } else {
            (&self.keys.sk_er, &self.keys.sk_ar)
        }
    }

    /// ESP SA for packets we send
    pub fn outbound_sa(&self) -> Result<EspSa> {
        let (encr, integ) = self.directional_keys(true);
        EspSa::new(
            self.spi_out,
            self.algorithms.encr,
            self.algorithms.integ,
            encr.to_vec(),
            integ.to_vec(),
        )
    }

    /// ESP SA for packets we receive
    pub fn inbound_sa(&self) -> Result<EspSa> {
        let (encr, integ) = self.directional_keys(false);
        EspSa::new(
            self.spi_in,
            self.algorithms.encr,
            self.algorithms.integ,
            encr.to_vec(),
            integ.to_vec(),
        )
    }

    /// Whether the SA may carry traffic
    pub fn can_use(&self) -> bool {
        matches!(self.state, ChildSaState::Active | ChildSaState::Rekeying)
    }

    /// Begin replacing the SA
    ///
    /// # Errors
    ///
    /// Returns error if SA is not in Active state
    pub fn initiate_rekey(&mut self) -> Result<()> {
        if self.state != ChildSaState::Active {
            return Err(Error::InvalidState(format!(
                "Cannot rekey child SA in state {:?}",
                self.state
            )));
        }
        crate::ipsec::logging::log_child_rekey_start(self.spi_in);
        self.state = ChildSaState::Rekeying;
        Ok(())
    }

    /// Mark the SA as replaced
    ///
    /// A peer-initiated rekey replaces an Active SA directly.
    pub fn mark_rekeyed(&mut self) -> Result<()> {
        match self.state {
            ChildSaState::Active | ChildSaState::Rekeying => {
                self.state = ChildSaState::Rekeyed;
                Ok(())
            }
            other => Err(Error::InvalidState(format!(
                "Cannot mark child SA rekeyed in state {:?}",
                other
            ))),
        }
    }

    /// Mark the SA as deleted
    pub fn mark_deleted(&mut self, reason: &str) {
        if self.state != ChildSaState::Deleted {
            crate::ipsec::logging::log_child_sa_deleted(self.spi_in, reason);
        }
        self.state = ChildSaState::Deleted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::crypto::{EncrAlgorithm, IntegAlgorithm};
    use crate::ipsec::esp::NEXT_HEADER_IPV4;

    fn cbc() -> NegotiatedAlgorithms {
        NegotiatedAlgorithms {
            encr: EncrAlgorithm::AesCbc { key_len: 16 },
            integ: IntegAlgorithm::HmacSha1_96,
            ..Default::default()
        }
    }

    fn gcm() -> NegotiatedAlgorithms {
        NegotiatedAlgorithms {
            encr: EncrAlgorithm::AesGcm {
                key_len: 16,
                icv_len: 16,
            },
            ..Default::default()
        }
    }

    fn pair(algorithms: NegotiatedAlgorithms, pfs: Option<&[u8]>) -> (ChildSession, ChildSession) {
        let ue = ChildSession::derive(
            PrfAlgorithm::HmacSha256,
            &[0x0d; 32],
            pfs,
            &[1; 32],
            &[2; 32],
            algorithms,
            0x1111,
            0x2222,
            true,
            ChildKind::Signaling,
        )
        .unwrap();
        let gw = ChildSession::derive(
            PrfAlgorithm::HmacSha256,
            &[0x0d; 32],
            pfs,
            &[1; 32],
            &[2; 32],
            algorithms,
            0x2222,
            0x1111,
            false,
            ChildKind::Signaling,
        )
        .unwrap();
        (ue, gw)
    }

    #[test]
    fn test_directions_match() {
        for algorithms in [cbc(), gcm()] {
            let (ue, gw) = pair(algorithms, None);
            assert_eq!(ue.outbound_sa().unwrap(), gw.inbound_sa().unwrap());
            assert_eq!(ue.inbound_sa().unwrap(), gw.outbound_sa().unwrap());
            assert_ne!(ue.outbound_sa().unwrap(), ue.inbound_sa().unwrap());

            let mut out = ue.outbound_sa().unwrap();
            let bytes = out.encapsulate(b"hello", NEXT_HEADER_IPV4).unwrap();
            let (plain, _) = gw.inbound_sa().unwrap().decapsulate(&bytes).unwrap();
            assert_eq!(plain, b"hello");
        }
    }

    #[test]
    fn test_key_lengths() {
        let (ue, _) = pair(cbc(), None);
        assert_eq!(ue.keys().sk_ei.len(), 16);
        assert_eq!(ue.keys().sk_ai.len(), 20);

        let (ue, _) = pair(gcm(), None);
        assert_eq!(ue.keys().sk_ei.len(), 20);
        assert!(ue.keys().sk_ai.is_empty());
    }

    #[test]
    fn test_pfs_changes_keys() {
        let (plain, _) = pair(cbc(), None);
        let (pfs, _) = pair(cbc(), Some(&[0x42; 256]));
        assert_ne!(plain.keys(), pfs.keys());
    }

    #[test]
    fn test_zero_spi_rejected() {
        let err = ChildSession::derive(
            PrfAlgorithm::HmacSha1,
            &[0; 20],
            None,
            &[1; 16],
            &[2; 16],
            cbc(),
            0,
            5,
            true,
            ChildKind::Signaling,
        );
        assert!(matches!(err, Err(Error::InvalidSpi(0))));
    }

    #[test]
    fn test_lifecycle() {
        let (mut ue, _) = pair(cbc(), None);
        assert!(ue.can_use());
        ue.initiate_rekey().unwrap();
        assert!(ue.can_use());
        assert!(ue.initiate_rekey().is_err());
        ue.mark_rekeyed().unwrap();
        assert!(!ue.can_use());
        ue.mark_deleted("rekeyed");
        assert_eq!(ue.state(), ChildSaState::Deleted);
        assert!(ue.mark_rekeyed().is_err());
    }

    #[test]
    fn test_generate_spi_not_reserved() {
        for _ in 0..100 {
            assert!(generate_spi() >= 0x100);
        }
    }

    #[test]
    fn test_user_plane_kind() {
        let kind = ChildKind::UserPlane {
            qfi: 9,
            up_address: Some(Ipv4Addr::new(10, 0, 0, 1)),
        };
        assert!(kind.is_user_plane());
        assert!(!ChildKind::Signaling.is_user_plane());
    }
}
