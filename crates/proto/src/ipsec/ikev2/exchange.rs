//! IKEv2 Exchange Builders
//!
//! Request builders and response handlers for the exchanges a UE runs
//! against an N3IWF or ePDG (RFC 7296, TS 24.502, TS 33.402).
//!
//! # IKE_SA_INIT Exchange
//!
//! ```text
//! UE                                 Gateway
//! -----------                        -----------
//! HDR, [N(COOKIE)], SAi1, KEi, Ni,
//!      N(NAT_DETECTION_*)  -->
//!                     <--  HDR, SAr1, KEr, Nr, N(NAT_DETECTION_*)
//!                     <--  HDR, N(COOKIE)             (retry with cookie)
//!                     <--  HDR, N(INVALID_KE_PAYLOAD) (retry with group)
//! ```
//!
//! # IKE_AUTH Exchange with EAP
//!
//! ```text
//! HDR, SK {IDi, [IDr,] CP(CFG_REQUEST), SAi2, TSi, TSr}  -->
//!                     <--  HDR, SK {IDr, [CERT,] EAP}
//! HDR, SK {EAP}  -->
//!                     <--  HDR, SK {EAP}     (repeated per EAP round)
//! HDR, SK {AUTH, [CP]}  -->
//!                     <--  HDR, SK {AUTH, CP(CFG_REPLY), SAr2, TSi, TSr}
//! ```
//!
//! # CREATE_CHILD_SA Exchange
//!
//! ```text
//! HDR, SK {SA, Ni, [KEi]} -->                     (rekey IKE SA)
//! HDR, SK {N(REKEY_SA), SA, Ni, TSi, TSr} -->     (rekey child SA)
//! ```
//!
//! The N3IWF may also open the user plane child SA itself; the UE then
//! answers with the chosen proposal, its nonce and traffic selectors.

use std::net::SocketAddr;

use super::constants::{cfg, notify, ExchangeType, IkeFlags, PayloadType};
use super::eap::EapPacket;
use super::message::{IkeHeader, IkeMessage};
use super::payload::{
    nat_detection_hash, AuthPayload, CfgAttribute, CpPayload, DeletePayload, IdPayload,
    IkePayload, KePayload, NonceBias, NoncePayload, NotifyPayload, TrafficSelector,
};
use super::proposal::{accept_proposal, NegotiatedAlgorithms, Proposal, ProtocolId};
use super::state::AccessVariant;
use crate::ipsec::{crypto::DhGroup, session::IkeSession, Error, Result};

/// Payloads of a received message, sorted by kind
///
/// Unknown payloads and vendor IDs are dropped.
#[derive(Debug, Clone, Default)]
pub struct ExchangePayloads {
    /// Proposals of the SA payload
    pub proposals: Vec<Proposal>,
    /// Key exchange payload
    pub ke: Option<KePayload>,
    /// Nonce data
    pub nonce: Option<Vec<u8>>,
    /// Responder identity
    pub idr: Option<IdPayload>,
    /// AUTH payload
    pub auth: Option<AuthPayload>,
    /// EAP packet
    pub eap: Option<EapPacket>,
    /// Configuration payload
    pub cp: Option<CpPayload>,
    /// Notify payloads in order
    pub notifies: Vec<NotifyPayload>,
    /// Delete payloads in order
    pub deletes: Vec<DeletePayload>,
    /// Initiator traffic selectors
    pub tsi: Vec<TrafficSelector>,
    /// Responder traffic selectors
    pub tsr: Vec<TrafficSelector>,
}

impl ExchangePayloads {
    /// Sort a payload chain
    pub fn collect(payloads: &[IkePayload]) -> Self {
        let mut out = ExchangePayloads::default();
        for payload in payloads {
            match payload {
                IkePayload::SA(proposals) => out.proposals = proposals.clone(),
                IkePayload::KE(ke) => out.ke = Some(ke.clone()),
                IkePayload::Nonce(n) => out.nonce = Some(n.nonce.clone()),
                IkePayload::IDr(id) => out.idr = Some(id.clone()),
                IkePayload::AUTH(auth) => out.auth = Some(auth.clone()),
                IkePayload::EAP(eap) => out.eap = Some(eap.clone()),
                IkePayload::CP(cp) => out.cp = Some(cp.clone()),
                IkePayload::N(n) => out.notifies.push(n.clone()),
                IkePayload::D(d) => out.deletes.push(d.clone()),
                IkePayload::TSi(ts) => out.tsi = ts.clone(),
                IkePayload::TSr(ts) => out.tsr = ts.clone(),
                _ => {}
            }
        }
        out
    }

    /// First notify of a given type
    pub fn notify(&self, notify_type: u16) -> Option<&NotifyPayload> {
        self.notifies.iter().find(|n| n.notify_type == notify_type)
    }

    /// Fail on the first error notify
    pub fn check_errors(&self) -> Result<()> {
        match self.notifies.iter().find(|n| n.is_error()) {
            Some(n) => Err(Error::ProtocolNotify(n.notify_type)),
            None => Ok(()),
        }
    }

    /// Nonce, or an error naming the missing payload
    pub fn require_nonce(&self) -> Result<&[u8]> {
        self.nonce
            .as_deref()
            .ok_or_else(|| Error::MandatoryInformationMissing("Nonce".into()))
    }

    /// The single chosen proposal of a response
    pub fn chosen_proposal(&self) -> Result<&Proposal> {
        match self.proposals.as_slice() {
            [one] => Ok(one),
            [] => Err(Error::MandatoryInformationMissing("SA".into())),
            _ => Err(Error::InvalidProposal(format!(
                "Response carries {} proposals",
                self.proposals.len()
            ))),
        }
    }
}

/// Result of an IKE_SA_INIT response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// Keys derived; `nat_detected` when either NAT hash mismatched
    Established {
        /// Whether signaling must move to the NAT-T port
        nat_detected: bool,
    },
    /// The responder wants the request repeated with this cookie
    Cookie(Vec<u8>),
    /// The responder wants a different DH group
    InvalidKe(u16),
}

/// IKE_SA_INIT exchange
pub struct IkeSaInitExchange;

impl IkeSaInitExchange {
    /// Build the IKE_SA_INIT request
    ///
    /// The DH group is taken from the first offered proposal. The nonce
    /// is generated once and reused when the request is repeated.
    ///
    /// # Arguments
    ///
    /// * `session` - IKE session (provides SPI, DH pair and nonce)
    /// * `offered` - IKE proposals in preference order
    /// * `cookie` - cookie echoed from a previous response
    /// * `local`, `peer` - addresses hashed into the NAT detection notifies
    pub fn create_request(
        session: &mut IkeSession,
        offered: &[Proposal],
        cookie: Option<&[u8]>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<Vec<u8>> {
        let first = offered
            .first()
            .ok_or_else(|| Error::InvalidProposal("No IKE proposal to offer".into()))?;
        let group_id = first
            .dh_group_id()
            .ok_or_else(|| Error::InvalidProposal("IKE proposal without DH group".into()))?;
        let group = DhGroup::from_transform_id(group_id)?;
        let public = session.dh_public(group);

        if session.nonce_i().is_empty() {
            session.set_nonce_i(NoncePayload::generate(NonceBias::Random).nonce);
        }

        let spi_i = session.spis().initiator;
        let spi_r = [0u8; 8];

        let mut payloads = Vec::with_capacity(6);
        if let Some(cookie) = cookie {
            payloads.push(IkePayload::N(NotifyPayload::new(notify::COOKIE, cookie.to_vec())));
        }
        payloads.push(IkePayload::SA(offered.to_vec()));
        payloads.push(IkePayload::KE(KePayload::new(group_id, public)));
        payloads.push(IkePayload::Nonce(NoncePayload::new(session.nonce_i().to_vec())?));
        payloads.push(IkePayload::N(NotifyPayload::new(
            notify::NAT_DETECTION_SOURCE_IP,
            nat_detection_hash(&spi_i, &spi_r, local.ip(), local.port()),
        )));
        payloads.push(IkePayload::N(NotifyPayload::new(
            notify::NAT_DETECTION_DESTINATION_IP,
            nat_detection_hash(&spi_i, &spi_r, peer.ip(), peer.port()),
        )));

        let header = IkeHeader::new(
            spi_i,
            spi_r,
            PayloadType::None,
            ExchangeType::IkeSaInit,
            IkeFlags::request(true),
            0,
            0,
        );
        IkeMessage::new(header, payloads).to_bytes()
    }

    /// Process the IKE_SA_INIT response
    ///
    /// On success the session holds the derived keys and both raw INIT
    /// messages, and message ID 0 is consumed.
    pub fn process_response(
        session: &mut IkeSession,
        offered: &[Proposal],
        request: &[u8],
        response: &[u8],
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Result<InitOutcome> {
        let msg = IkeMessage::from_bytes(response)?;
        let header = &msg.header;
        if header.exchange_type != ExchangeType::IkeSaInit {
            return Err(Error::InvalidMessage(format!(
                "Expected IKE_SA_INIT, got {:?}",
                header.exchange_type
            )));
        }
        session.check_response(header, 0)?;

        if let Some(cookie) = msg.notify(notify::COOKIE) {
            return Ok(InitOutcome::Cookie(cookie.data.clone()));
        }
        if let Some(invalid_ke) = msg.notify(notify::INVALID_KE_PAYLOAD) {
            let group = invalid_ke
                .data
                .get(..2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or_else(|| Error::InvalidPayload("INVALID_KE_PAYLOAD without group".into()))?;
            return Ok(InitOutcome::InvalidKe(group));
        }

        let payloads = ExchangePayloads::collect(&msg.payloads);
        payloads.check_errors()?;

        let chosen = accept_proposal(offered, payloads.chosen_proposal()?)?;
        crate::ipsec::logging::log_proposal_negotiation(offered.len(), Some(chosen.proposal_num));
        let algorithms = NegotiatedAlgorithms::from_proposal(&chosen)?;
        let ke = payloads
            .ke
            .as_ref()
            .ok_or_else(|| Error::MandatoryInformationMissing("KE".into()))?;
        if algorithms.dh.map(DhGroup::transform_id) != Some(ke.dh_group) {
            return Err(Error::InvalidPayload(format!(
                "KE group {} does not match the chosen proposal",
                ke.dh_group
            )));
        }
        let nonce_r = payloads.require_nonce()?.to_vec();

        let spi_i = header.initiator_spi;
        let spi_r = header.responder_spi;
        session.establish(spi_r, nonce_r, &ke.key_data, algorithms)?;
        session.set_init_messages(
            request.to_vec(),
            response[..header.length as usize].to_vec(),
        );
        session.next_message_id();

        let source_ok = payloads
            .notify(notify::NAT_DETECTION_SOURCE_IP)
            .map_or(true, |n| {
                n.data == nat_detection_hash(&spi_i, &spi_r, peer.ip(), peer.port())
            });
        let destination_ok = payloads
            .notify(notify::NAT_DETECTION_DESTINATION_IP)
            .map_or(true, |n| {
                n.data == nat_detection_hash(&spi_i, &spi_r, local.ip(), local.port())
            });

        Ok(InitOutcome::Established {
            nat_detected: !(source_ok && destination_ok),
        })
    }
}

/// IKE_AUTH exchange
pub struct IkeAuthExchange;

impl IkeAuthExchange {
    /// Configuration request of the first IKE_AUTH message
    pub fn config_request(variant: AccessVariant) -> CpPayload {
        let mut attributes = vec![
            CfgAttribute::request(cfg::INTERNAL_IP4_ADDRESS),
            CfgAttribute::request(cfg::INTERNAL_IP4_DNS),
        ];
        if variant == AccessVariant::Swu {
            attributes.extend([
                CfgAttribute::request(cfg::INTERNAL_IP6_ADDRESS),
                CfgAttribute::request(cfg::INTERNAL_IP6_DNS),
                CfgAttribute::request(cfg::P_CSCF_IP4_ADDRESS),
                CfgAttribute::request(cfg::P_CSCF_IP6_ADDRESS),
            ]);
        }
        CpPayload {
            cfg_type: cfg::REQUEST,
            attributes,
        }
    }

    /// Payloads of the first IKE_AUTH request
    ///
    /// AUTH is omitted to signal EAP. IDr is sent on SWu only (the APN).
    pub fn first_request(
        variant: AccessVariant,
        idi: &IdPayload,
        idr: Option<&IdPayload>,
        child_proposals: &[Proposal],
        spi_in: u32,
    ) -> Vec<IkePayload> {
        let mut payloads = vec![IkePayload::IDi(idi.clone())];
        if let Some(idr) = idr {
            payloads.push(IkePayload::IDr(idr.clone()));
        }
        payloads.push(IkePayload::CP(Self::config_request(variant)));
        payloads.push(IkePayload::SA(with_esp_spi(child_proposals, spi_in)));
        payloads.push(IkePayload::TSi(vec![TrafficSelector::any_ipv4()]));
        payloads.push(IkePayload::TSr(vec![TrafficSelector::any_ipv4()]));
        payloads
    }

    /// Payloads of the final IKE_AUTH request
    pub fn final_request(variant: AccessVariant, auth: AuthPayload) -> Vec<IkePayload> {
        let mut payloads = vec![IkePayload::AUTH(auth)];
        if variant == AccessVariant::Nwu {
            payloads.push(IkePayload::CP(Self::config_request(variant)));
        }
        payloads
    }

    /// Our AUTH over the INIT request, the responder nonce and `prf(SK_pi, IDi')`
    pub fn compute_auth(session: &IkeSession, shared_key: &[u8], idi: &IdPayload) -> Result<AuthPayload> {
        let prf = session.algorithms().prf()?;
        let octets = super::auth::signed_octets(
            prf,
            session.init_request(),
            session.nonce_r(),
            &session.keys()?.sk_pi,
            idi,
        )?;
        super::auth::compute_shared_key_auth(prf, shared_key, &octets)
    }

    /// Check the gateway's AUTH over the INIT response, our nonce and `prf(SK_pr, IDr')`
    pub fn verify_auth(
        session: &IkeSession,
        shared_key: &[u8],
        idr: &IdPayload,
        received: &AuthPayload,
    ) -> Result<()> {
        let prf = session.algorithms().prf()?;
        let octets = super::auth::signed_octets(
            prf,
            session.init_response(),
            session.nonce_i(),
            &session.keys()?.sk_pr,
            idr,
        )?;
        super::auth::verify_shared_key_auth(prf, shared_key, &octets, received)
    }
}

/// Copy of ESP proposals carrying our inbound SPI
pub fn with_esp_spi(proposals: &[Proposal], spi: u32) -> Vec<Proposal> {
    proposals
        .iter()
        .cloned()
        .map(|p| p.with_spi(spi.to_be_bytes().to_vec()))
        .collect()
}

/// CREATE_CHILD_SA exchange
pub struct CreateChildSaExchange;

impl CreateChildSaExchange {
    /// Request rekeying the IKE SA
    ///
    /// `new_spi` becomes our SPI of the new IKE SA.
    pub fn ike_rekey_request(
        proposals: &[Proposal],
        new_spi: [u8; 8],
        ke: KePayload,
        nonce: &NoncePayload,
    ) -> Vec<IkePayload> {
        let proposals = proposals
            .iter()
            .cloned()
            .map(|p| p.with_spi(new_spi.to_vec()))
            .collect();
        vec![
            IkePayload::SA(proposals),
            IkePayload::KE(ke),
            IkePayload::Nonce(nonce.clone()),
        ]
    }

    /// Request rekeying the child SA whose inbound SPI is `old_spi_in`
    ///
    /// `ke` is set when the child SA negotiated a DH group (PFS).
    pub fn child_rekey_request(
        proposals: &[Proposal],
        new_spi_in: u32,
        nonce: &NoncePayload,
        ke: Option<KePayload>,
        old_spi_in: u32,
    ) -> Vec<IkePayload> {
        let mut payloads = vec![
            IkePayload::SA(with_esp_spi(proposals, new_spi_in)),
            IkePayload::Nonce(nonce.clone()),
        ];
        if let Some(ke) = ke {
            payloads.push(IkePayload::KE(ke));
        }
        payloads.extend([
            IkePayload::N(NotifyPayload::with_spi(
                ProtocolId::Esp.to_u8(),
                notify::REKEY_SA,
                old_spi_in.to_be_bytes().to_vec(),
                Vec::new(),
            )),
            IkePayload::TSi(vec![TrafficSelector::any_ipv4()]),
            IkePayload::TSr(vec![TrafficSelector::any_ipv4()]),
        ]);
        payloads
    }

    /// Answer a gateway-initiated child SA by echoing the chosen proposal
    pub fn accept_child(
        chosen: &Proposal,
        spi_in: u32,
        nonce: &NoncePayload,
        request: &ExchangePayloads,
        ke: Option<KePayload>,
    ) -> Vec<IkePayload> {
        let mut payloads = vec![
            IkePayload::SA(vec![chosen.clone().with_spi(spi_in.to_be_bytes().to_vec())]),
            IkePayload::Nonce(nonce.clone()),
            IkePayload::TSi(request.tsi.clone()),
            IkePayload::TSr(request.tsr.clone()),
        ];
        if let Some(ke) = ke {
            payloads.push(IkePayload::KE(ke));
        }
        payloads
    }

    /// Refuse a request with a single error notify
    pub fn refuse(notify_type: u16) -> Vec<IkePayload> {
        vec![IkePayload::N(NotifyPayload::new(notify_type, Vec::new()))]
    }
}

/// INFORMATIONAL exchange
pub struct InformationalExchange;

impl InformationalExchange {
    /// Delete the IKE SA (and with it every child SA)
    pub fn delete_ike() -> Vec<IkePayload> {
        vec![IkePayload::D(DeletePayload::ike())]
    }

    /// Delete child SAs by our inbound SPIs
    pub fn delete_esp(spis: &[u32]) -> Vec<IkePayload> {
        vec![IkePayload::D(DeletePayload::esp(spis))]
    }
}
