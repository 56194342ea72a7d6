//! UE exchange driver
//!
//! [`UeClient`] runs the whole life of one emulated UE against an N3IWF
//! (NWu) or ePDG (SWu): IKE_SA_INIT, the EAP driven IKE_AUTH rounds, the
//! NAS registration over the tunnel (NWu), and the CONNECTED phase where
//! peer requests, rekeys and operator commands are multiplexed.
//!
//! The driver is a single task. Packet forwarding and the NAS relay run as
//! their own tasks and talk to the driver over control channels only.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use n3ue_platform::{AuthVectorProvider, PacketDevice};
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::{
    channel::{self, ControlMessage, ControlReceiver, ControlSender, EpochCounter, UserPlaneParams},
    child_sa::{generate_spi, ChildKind, ChildSession},
    config::UeConfig,
    crypto::{aes128_cbc_decrypt, aes128_cbc_encrypt, DhGroup, DhKeyPair},
    forwarder::{DataPath, EspTransport, Forwarder, ForwarderHandle},
    ikev2::{
        constants::{cfg, notify, ExchangeType, IkeFlags, PayloadType, NON_ESP_MARKER},
        eap::{
            an_param, attr, code, decode_attributes, encode_attributes, eap5g, method, subtype,
            AnParameter, Eap5gMessage, EapAttribute, EapBody, EapPacket, NOTIFICATION_SUCCESS_BIT,
        },
        exchange::{
            CreateChildSaExchange, ExchangePayloads, IkeAuthExchange, IkeSaInitExchange,
            InformationalExchange, InitOutcome,
        },
        message::IkeHeader,
        payload::{DeletePayload, IdPayload, IkePayload, KePayload, NonceBias, NoncePayload},
        proposal::{
            accept_proposal, filter_by_dh_group, select_proposal, NegotiatedAlgorithms, Proposal,
            ProtocolId,
        },
        state::{AccessVariant, ExchangeStateMachine, UeState},
    },
    logging,
    relay::{self, NasRelay},
    session::{IkeSession, KeyGeneration, SpiPair},
    Error, Result,
};
use crate::mobile::{
    nas::{self, sec_header, NasMessage, NasSecurityContext, PduSessionAccept, SecuredNas},
    vector::{resolve_vector, AuthenticationContext},
};

/// Largest datagram read from the signaling socket
const MAX_DATAGRAM: usize = 65535;

/// Extra IKE_SA_INIT attempts per kind (COOKIE, INVALID_KE_PAYLOAD)
const INIT_REPEATS: u32 = 2;

/// Extra rounds per kind during authentication (resync, identity or notification)
const AUTH_REPEATS: u32 = 1;

/// EAP requests answered within one SWu EAP state
const MAX_EAP_ROUNDS: u32 = 8;

/// Housekeeping period in CONNECTED
const TICK: Duration = Duration::from_millis(500);

const PDU_SESSION_ID: u8 = 1;
const PTI: u8 = 1;
const DEFAULT_QFI: u8 = 1;

/// GUAMI advertised in the AN parameters (region, set, pointer)
const GUAMI: (u8, u16, u8) = (0xca, 0x3f8, 0);

/// AT_KDF value of the EAP-AKA' key derivation
const KDF_AKA_PRIME: u16 = 1;

/// Command from the operator console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Release the PDU session, close the NAS session and delete the IKE SA
    Quit,
    /// Rekey the IKE SA
    RekeyIke,
    /// Rekey the signaling child SA
    RekeyChild,
    /// Delete the IKE SA and start over, using the fast reauth identity
    Reauthenticate,
}

impl OperatorCommand {
    /// Parse a console line (`q`, `i`, `c`, `r`)
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "q" | "quit" => Some(OperatorCommand::Quit),
            "i" => Some(OperatorCommand::RekeyIke),
            "c" => Some(OperatorCommand::RekeyChild),
            "r" => Some(OperatorCommand::Reauthenticate),
            _ => None,
        }
    }

    /// Short name for logging
    pub fn name(self) -> &'static str {
        match self {
            OperatorCommand::Quit => "quit",
            OperatorCommand::RekeyIke => "rekey_ike",
            OperatorCommand::RekeyChild => "rekey_child",
            OperatorCommand::Reauthenticate => "reauthenticate",
        }
    }
}

/// How a CONNECTED phase ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Quit,
    PeerDeleted,
    Reauthenticate,
}

enum Event {
    Ike(Vec<u8>),
    Worker(Option<ControlMessage>),
    Command(Option<OperatorCommand>),
    Tick,
    Failed(Error),
}

/// Our outstanding request in CONNECTED
struct Pending {
    message_id: u32,
    generation: KeyGeneration,
    bytes: Vec<u8>,
    sent_at: Instant,
    attempts: u32,
    request: PendingRequest,
}

enum PendingRequest {
    RekeyIke {
        dh: DhKeyPair,
        nonce: Vec<u8>,
        spi: [u8; 8],
        proposals: Vec<Proposal>,
    },
    RekeyChild {
        old_spi_in: u32,
        dh: Option<DhKeyPair>,
        nonce: Vec<u8>,
        spi_in: u32,
        proposals: Vec<Proposal>,
    },
    DeleteOldIke,
    DeleteChild {
        spi_in: u32,
    },
}

enum Answer {
    Response(EapPacket),
    SyncFailure(EapPacket),
}

/// Kind of reply queued for an SWu EAP request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Answer,
    Resync,
    Notification,
}

/// Repeats spent per kind in one phase of establishment
#[derive(Debug, Default, Clone, Copy)]
struct RepeatBudget {
    cookie: u32,
    synch: u32,
    state: u32,
}

impl RepeatBudget {
    /// Take one repeat of the kind of `error`; false once `limit` is spent
    fn spend(&mut self, error: &Error, limit: u32) -> bool {
        let used = match error {
            Error::RepeatStateCookie(_) => &mut self.cookie,
            Error::SynchFailure => &mut self.synch,
            _ => &mut self.state,
        };
        if *used >= limit {
            return false;
        }
        *used += 1;
        true
    }

    fn spent(&self) -> u32 {
        self.cookie + self.synch + self.state
    }
}

/// Emulated UE
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use n3ue_proto::ipsec::{UeClient, UeConfig};
/// use n3ue_proto::mobile::milenage::MilenageProvider;
///
/// let config = UeConfig::builder()
///     .with_imsi("208930000000003")
///     .with_ki_hex("8baf473f2f8fd09487cccbd7097c6862")?
///     .with_opc_hex("8e27b6af0e692e750f32667a3b14605d")?
///     .with_server("10.0.0.1".parse()?)
///     .build()?;
/// let provider = Arc::new(MilenageProvider::new(config.milenage()).with_imsi(&config.imsi));
///
/// let mut ue = UeClient::new(config, provider);
/// ue.run(None).await?;
/// ```
pub struct UeClient {
    config: UeConfig,
    provider: Arc<dyn AuthVectorProvider>,
    signaling_device: Option<Arc<dyn PacketDevice>>,
    user_plane_device: Option<Arc<dyn PacketDevice>>,

    machine: ExchangeStateMachine,
    session: IkeSession,
    auth: AuthenticationContext,
    ike_proposals: Vec<Proposal>,

    socket: Option<UdpSocket>,
    local: SocketAddr,
    peer: SocketAddr,
    nat_t: bool,

    to_driver: ControlSender,
    from_workers: ControlReceiver,
    forwarder: Option<ForwarderHandle>,
    relay: Option<(ControlSender, JoinHandle<Result<()>>)>,
    epochs: EpochCounter,

    idi: IdPayload,
    idr: Option<IdPayload>,
    cookie: Option<Vec<u8>>,
    child_spi: u32,
    pending_eap: Option<EapPacket>,
    initial_nas: Vec<u8>,
    nas_security: Option<NasSecurityContext>,
    registered: bool,
    init_repeats: RepeatBudget,
    auth_repeats: RepeatBudget,

    tunnel_address: Option<Ipv4Addr>,
    dns: Vec<Ipv4Addr>,
    nas_endpoint: Option<SocketAddr>,
    pdu_session: Option<PduSessionAccept>,
    user_plane_params: Option<UserPlaneParams>,

    children: Vec<ChildSession>,
    retired: Vec<ChildSession>,
    pending: Option<Pending>,
    last_response: Option<([u8; 8], u32, Vec<u8>)>,
}

impl UeClient {
    /// Create a UE; no packets are sent until [`UeClient::connect`] or [`UeClient::run`]
    pub fn new(config: UeConfig, provider: Arc<dyn AuthVectorProvider>) -> Self {
        let (to_driver, from_workers) = channel::control_channel();
        let session = IkeSession::new()
            .with_grace(config.rekey_grace)
            .with_null_padding(config.null_padding);
        let peer = SocketAddr::new(IpAddr::V4(config.server), config.ike_port);
        let idi = initial_identity(&config, None);

        UeClient {
            machine: ExchangeStateMachine::new(config.variant),
            auth: AuthenticationContext::new(config.nai()),
            ike_proposals: config.ike_proposals.clone(),
            provider,
            signaling_device: None,
            user_plane_device: None,
            session,
            socket: None,
            local: SocketAddr::new(IpAddr::V4(config.local), 0),
            peer,
            nat_t: false,
            to_driver,
            from_workers,
            forwarder: None,
            relay: None,
            epochs: EpochCounter::new(),
            idi,
            idr: None,
            cookie: None,
            child_spi: generate_spi(),
            pending_eap: None,
            initial_nas: Vec::new(),
            nas_security: None,
            registered: false,
            init_repeats: RepeatBudget::default(),
            auth_repeats: RepeatBudget::default(),
            tunnel_address: None,
            dns: Vec::new(),
            nas_endpoint: None,
            pdu_session: None,
            user_plane_params: None,
            children: Vec::new(),
            retired: Vec::new(),
            pending: None,
            last_response: None,
            config,
        }
    }

    /// Attach the tunnel devices
    ///
    /// Without a signaling device the data path is not started and only
    /// the IKE exchanges run.
    pub fn with_devices(
        mut self,
        signaling: Arc<dyn PacketDevice>,
        user_plane: Option<Arc<dyn PacketDevice>>,
    ) -> Self {
        self.signaling_device = Some(signaling);
        self.user_plane_device = user_plane;
        self
    }

    /// Current exchange state
    pub fn state(&self) -> UeState {
        self.machine.state()
    }

    /// Inner address assigned by the gateway
    pub fn tunnel_address(&self) -> Option<Ipv4Addr> {
        self.tunnel_address
    }

    /// DNS servers assigned by the gateway
    pub fn dns_servers(&self) -> &[Ipv4Addr] {
        &self.dns
    }

    /// Accepted PDU session (NWu)
    pub fn pdu_session(&self) -> Option<&PduSessionAccept> {
        self.pdu_session.as_ref()
    }

    /// Establish the tunnel: IKE_SA_INIT through CONNECTED
    pub async fn connect(&mut self) -> Result<()> {
        if self.machine.state() != UeState::Init {
            return Err(Error::InvalidState(format!(
                "connect from {}",
                self.machine.state()
            )));
        }
        let started = Instant::now();
        self.open_socket().await?;
        let peer = self.peer.to_string();
        logging::log_handshake_start(&peer, &format!("{:?}", self.config.variant));

        match self.establish().await {
            Ok(()) => {
                logging::log_handshake_complete(&peer, started.elapsed().as_millis() as u64);
                Ok(())
            }
            Err(e) => {
                logging::log_handshake_failed(&peer, &e.to_string());
                Err(e)
            }
        }
    }

    /// Run establishment and CONNECTED until quit or the iteration budget is spent
    ///
    /// A peer delete or a failed attempt consumes one iteration and starts
    /// over; an operator reauthentication starts over without consuming one.
    pub async fn run(&mut self, mut commands: Option<mpsc::Receiver<OperatorCommand>>) -> Result<()> {
        let mut completed = 0u32;
        let mut restart: Option<bool> = None;

        while completed < self.config.iterations {
            if let Some(reauth) = restart.take() {
                self.reset_for_restart(reauth)?;
            }
            let result = match self.connect().await {
                Ok(()) => self.serve(&mut commands).await,
                Err(e) => Err(e),
            };
            self.teardown().await;

            match result {
                Ok(Outcome::Quit) => {
                    info!("UE stopped by operator");
                    return Ok(());
                }
                Ok(Outcome::PeerDeleted) => {
                    completed += 1;
                    info!(iteration = completed, "IKE SA deleted by peer");
                    restart = Some(false);
                }
                Ok(Outcome::Reauthenticate) => {
                    restart = Some(true);
                }
                Err(e) => {
                    completed += 1;
                    logging::log_error("iteration", &e.to_string());
                    if completed >= self.config.iterations {
                        return Err(e);
                    }
                    restart = Some(false);
                }
            }
        }
        Ok(())
    }

    async fn open_socket(&mut self) -> Result<()> {
        self.peer = SocketAddr::new(IpAddr::V4(self.config.server), self.config.ike_port);
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(self.config.local), 0)).await?;
        self.local = local_endpoint(&socket, self.peer).await?;
        self.socket = Some(socket);
        self.nat_t = false;
        Ok(())
    }

    async fn switch_to_nat_t(&mut self, nat_detected: bool) -> Result<()> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(self.config.local), 0)).await?;
        self.peer = SocketAddr::new(IpAddr::V4(self.config.server), self.config.nat_port);
        self.local = local_endpoint(&socket, self.peer).await?;
        self.socket = Some(socket);
        self.nat_t = true;
        info!(nat_detected, peer = %self.peer, "Signaling moved to the NAT-T port");
        Ok(())
    }

    async fn send_ike(&self, message: &[u8]) -> Result<()> {
        logging::log_message_send("IKE", &self.peer.to_string(), message.len());
        if let Some(socket) = &self.socket {
            if self.nat_t {
                let mut datagram = Vec::with_capacity(NON_ESP_MARKER.len() + message.len());
                datagram.extend_from_slice(&NON_ESP_MARKER);
                datagram.extend_from_slice(message);
                socket.send_to(&datagram, self.peer).await?;
            } else {
                socket.send_to(message, self.peer).await?;
            }
            return Ok(());
        }
        match &self.forwarder {
            Some(forwarder) => forwarder.send_ike(message.to_vec()).await,
            None => Err(Error::InvalidState("No signaling path".into())),
        }
    }

    async fn recv_ike(&mut self) -> Result<Vec<u8>> {
        let socket = self.socket.as_ref();
        let (peer, nat_t) = (self.peer, self.nat_t);
        loop {
            tokio::select! {
                datagram = recv_signaling(socket, peer, nat_t) => return datagram,
                message = self.from_workers.recv() => match message {
                    Some(ControlMessage::Ike(data)) => return Ok(data),
                    Some(other) => debug!(message = other.name(), "Control message dropped during exchange"),
                    None => return Err(Error::ChannelClosed),
                },
            }
        }
    }

    /// Send `request` and wait for a datagram `accept` takes
    ///
    /// Datagrams `accept` rejects are dropped. The request is resent on
    /// each step timeout, `retries` times.
    async fn transact<T, F>(&mut self, request: &[u8], accept: F) -> Result<T>
    where
        F: Fn(&IkeSession, &[u8]) -> Result<T>,
    {
        let state = self.machine.state();
        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                logging::log_retry(state, attempt, "no response");
            }
            self.send_ike(request).await?;
            let deadline = Instant::now() + self.config.step_timeout;
            loop {
                match tokio::time::timeout_at(deadline, self.recv_ike()).await {
                    Err(_) => break,
                    Ok(received) => {
                        let data = received?;
                        logging::log_message_recv("IKE", &self.peer.to_string(), data.len());
                        match accept(&self.session, &data) {
                            Ok(value) => return Ok(value),
                            Err(e) => debug!(error = %e, "Dropping unexpected IKE datagram"),
                        }
                    }
                }
            }
        }
        Err(Error::Timeout)
    }

    async fn establish(&mut self) -> Result<()> {
        self.init_repeats = RepeatBudget::default();
        self.auth_repeats = RepeatBudget::default();
        loop {
            let state = self.machine.state();
            if state.is_connected() {
                return Ok(());
            }
            match self.run_step(state).await {
                Ok(()) => {
                    self.machine.advance()?;
                }
                Err(e) if e.is_repeat() => {
                    let budget = if state == UeState::Init {
                        self.init_repeats.spend(&e, INIT_REPEATS)
                            .then_some(self.init_repeats.spent())
                    } else {
                        self.auth_repeats.spend(&e, AUTH_REPEATS)
                            .then_some(self.auth_repeats.spent())
                    };
                    let Some(spent) = budget else {
                        warn!(state = %state, error = %e, "Repeat limit reached");
                        return Err(e);
                    };
                    logging::log_retry(state, spent, &e.to_string());
                    if let Error::RepeatStateCookie(cookie) = e {
                        self.cookie = Some(cookie);
                    }
                    self.machine.transition(state)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_step(&mut self, state: UeState) -> Result<()> {
        match (self.config.variant, state) {
            (_, UeState::Init) => self.step_init().await,
            (AccessVariant::Nwu, UeState::Auth1) => self.nwu_start().await,
            (AccessVariant::Nwu, UeState::Auth2) => self.nwu_authentication().await,
            (AccessVariant::Nwu, UeState::Auth3) => self.nwu_security_mode().await,
            (AccessVariant::Nwu, UeState::Auth4) => self.nwu_eap_success().await,
            (AccessVariant::Nwu, UeState::Auth5) => self.final_auth().await,
            (AccessVariant::Nwu, UeState::Auth6) => self.nwu_registration().await,
            (AccessVariant::Swu, UeState::Auth1) => self.swu_start().await,
            (AccessVariant::Swu, UeState::Auth2) => self.swu_eap().await,
            (AccessVariant::Swu, UeState::Auth3) => self.final_auth().await,
            (_, other) => Err(Error::InvalidState(format!(
                "No establishment step for {}",
                other
            ))),
        }
    }

    async fn step_init(&mut self) -> Result<()> {
        let offered = self.ike_proposals.clone();
        let request = IkeSaInitExchange::create_request(
            &mut self.session,
            &offered,
            self.cookie.as_deref(),
            self.local,
            self.peer,
        )?;
        let response = self.transact(&request, init_response).await?;

        match IkeSaInitExchange::process_response(
            &mut self.session,
            &offered,
            &request,
            &response,
            self.local,
            self.peer,
        )? {
            InitOutcome::Established { nat_detected } => {
                self.cookie = None;
                if nat_detected || self.config.data_path == DataPath::Udp {
                    self.switch_to_nat_t(nat_detected).await?;
                }
                Ok(())
            }
            InitOutcome::Cookie(cookie) => Err(Error::RepeatStateCookie(cookie)),
            InitOutcome::InvalidKe(group) => {
                let filtered = filter_by_dh_group(&self.config.ike_proposals, group);
                if filtered.is_empty() {
                    return Err(Error::ProtocolNotify(notify::INVALID_KE_PAYLOAD));
                }
                info!(group, "Responder asked for another DH group");
                self.ike_proposals = filtered;
                Err(Error::RepeatState)
            }
        }
    }

    /// One protected IKE_AUTH round; error notifies fail the step
    async fn auth_round(&mut self, payloads: Vec<IkePayload>) -> Result<ExchangePayloads> {
        let header = self.session.request_header(ExchangeType::IkeAuth);
        let message_id = header.message_id;
        let request = self.session.protect(&header, &payloads)?;
        let response = self
            .transact(&request, |session, data| {
                protected_response(session, data, ExchangeType::IkeAuth, message_id)
            })
            .await?;
        response.check_errors()?;
        Ok(response)
    }

    async fn eap_round(&mut self) -> Result<ExchangePayloads> {
        let eap = self
            .pending_eap
            .take()
            .ok_or_else(|| Error::InvalidState("No EAP response to send".into()))?;
        self.auth_round(vec![IkePayload::EAP(eap)]).await
    }

    async fn nwu_start(&mut self) -> Result<()> {
        let payloads = IkeAuthExchange::first_request(
            AccessVariant::Nwu,
            &self.idi,
            None,
            &self.config.child_proposals,
            self.child_spi,
        );
        let response = self.auth_round(payloads).await?;
        if response.idr.is_some() {
            self.idr = response.idr.clone();
        }

        let eap = response
            .eap
            .ok_or_else(|| Error::MandatoryInformationMissing("EAP".into()))?;
        match eap.eap5g() {
            Some(start) if start.message_id == eap5g::START => {}
            _ => {
                return Err(Error::MandatoryInformationMissing(
                    "EAP-5G start".into(),
                ))
            }
        }

        let registration =
            nas::registration_request(&self.config.mcc, &self.config.mnc, &self.config.imsi)?;
        logging::log_nas_message("uplink", nas::msg::REGISTRATION_REQUEST, registration.len());
        self.pending_eap = Some(registration_eap(
            &self.config,
            eap.identifier,
            registration.clone(),
        )?);
        self.initial_nas = registration;
        Ok(())
    }

    async fn nwu_authentication(&mut self) -> Result<()> {
        let response = self.eap_round().await?;
        let (identifier, pdu) = eap5g_nas(&response)?;
        let message = NasMessage::decode(&pdu)?;
        debug!(message = message.name(), "NAS message in EAP-5G");

        match message {
            NasMessage::AuthenticationRequest(request) => {
                let abba = request.abba.clone();
                let reply = match (&request.eap, request.rand, request.autn) {
                    (Some(eap), _, _) => {
                        let packet = EapPacket::from_bytes(eap)?;
                        match self.answer_challenge(&packet, Some(&abba)).await? {
                            Answer::Response(answer) => {
                                nas::authentication_response(None, Some(&answer.to_bytes()))
                            }
                            Answer::SyncFailure(answer) => {
                                self.pending_eap = Some(nas_eap(
                                    identifier,
                                    nas::authentication_response(None, Some(&answer.to_bytes())),
                                ));
                                return Err(Error::SynchFailure);
                            }
                        }
                    }
                    (None, Some(rand), Some(autn)) => {
                        let vector = resolve_vector(
                            self.provider.as_ref(),
                            &rand,
                            &autn,
                            self.config.fallback_to_default_vector,
                        )
                        .await?;
                        match self.auth.record(&rand, &autn, vector) {
                            Ok(()) => {}
                            Err(Error::SynchFailure) => {
                                let auts = self.auth.auts.clone().unwrap_or_default();
                                warn!("5G-AKA synchronization failure, sending AUTS");
                                self.pending_eap = Some(nas_eap(
                                    identifier,
                                    nas::authentication_failure(
                                        nas::CAUSE_SYNCH_FAILURE,
                                        Some(&auts),
                                    ),
                                ));
                                return Err(Error::SynchFailure);
                            }
                            Err(e) => return Err(e),
                        }
                        let res_star = self.auth.five_g_aka(
                            &self.config.serving_network_name(),
                            &self.config.imsi,
                            &abba,
                        )?;
                        nas::authentication_response(Some(&res_star), None)
                    }
                    _ => {
                        return Err(Error::MandatoryInformationMissing(
                            "RAND/AUTN or EAP message".into(),
                        ))
                    }
                };
                logging::log_nas_message("uplink", nas::msg::AUTHENTICATION_RESPONSE, reply.len());
                self.pending_eap = Some(nas_eap(identifier, reply));
                Ok(())
            }
            NasMessage::IdentityRequest(identity_type) => {
                debug!(identity_type, "Identity requested");
                let reply =
                    nas::identity_response(&self.config.mcc, &self.config.mnc, &self.config.imsi)?;
                self.pending_eap = Some(nas_eap(identifier, reply));
                Err(Error::RepeatState)
            }
            NasMessage::AuthenticationReject => Err(Error::AuthenticationFailed(
                "Authentication reject".into(),
            )),
            NasMessage::RegistrationReject(cause) => Err(Error::AuthenticationFailed(format!(
                "Registration reject, cause {}",
                cause
            ))),
            other => Err(Error::InvalidNas(format!(
                "Expected authentication request, got {}",
                other.name()
            ))),
        }
    }

    async fn nwu_security_mode(&mut self) -> Result<()> {
        let response = self.eap_round().await?;
        let (identifier, pdu) = eap5g_nas(&response)?;
        let secured = SecuredNas::parse(&pdu)?;
        let command = match NasMessage::decode(&secured.message)? {
            NasMessage::SecurityModeCommand(command) => command,
            NasMessage::AuthenticationReject => {
                return Err(Error::AuthenticationFailed("Authentication reject".into()))
            }
            other => {
                return Err(Error::InvalidNas(format!(
                    "Expected security mode command, got {}",
                    other.name()
                )))
            }
        };

        let keys = self
            .auth
            .subscriber
            .as_ref()
            .ok_or_else(|| Error::InvalidState("No NAS keys derived".into()))?;
        let mut context = NasSecurityContext::new(keys, command.integrity, command.ciphering)?;
        context.unprotect(&secured)?;
        info!(
            integrity = command.integrity,
            ciphering = command.ciphering,
            "NAS security mode command accepted"
        );

        let imeisv = if command.imeisv_requested {
            self.config.imeisv.as_deref()
        } else {
            None
        };
        let container = command
            .retransmit_initial_nas
            .then_some(self.initial_nas.as_slice());
        let complete = nas::security_mode_complete(imeisv, container)?;
        let count = context.uplink_count().value();
        let protected = context.protect(
            &complete,
            sec_header::INTEGRITY_PROTECTED_AND_CIPHERED_NEW_CONTEXT,
        )?;
        logging::log_nas_message("uplink", nas::msg::SECURITY_MODE_COMPLETE, protected.len());

        self.auth.derive_kn3iwf(count)?;
        self.nas_security = Some(context);
        self.pending_eap = Some(nas_eap(identifier, protected));
        Ok(())
    }

    async fn nwu_eap_success(&mut self) -> Result<()> {
        let response = self.eap_round().await?;
        match response.eap {
            Some(eap) if eap.is_success() => Ok(()),
            Some(eap) if eap.is_failure() => {
                Err(Error::AuthenticationFailed("EAP failure".into()))
            }
            Some(_) => Err(Error::InvalidMessage("Expected EAP success".into())),
            None => Err(Error::MandatoryInformationMissing("EAP".into())),
        }
    }

    async fn swu_start(&mut self) -> Result<()> {
        let idr = IdPayload::from_key_id(self.config.dnn.as_bytes());
        let payloads = IkeAuthExchange::first_request(
            AccessVariant::Swu,
            &self.idi,
            Some(&idr),
            &self.config.child_proposals,
            self.child_spi,
        );
        let response = self.auth_round(payloads).await?;
        if response.idr.is_some() {
            self.idr = response.idr.clone();
        }
        let eap = response
            .eap
            .ok_or_else(|| Error::MandatoryInformationMissing("EAP".into()))?;
        // a stale first challenge or failure notification uses up that repeat
        match self.answer_eap(&eap).await? {
            Reply::Answer => {}
            Reply::Resync => {
                self.auth_repeats.spend(&Error::SynchFailure, AUTH_REPEATS);
            }
            Reply::Notification => {
                self.auth_repeats.spend(&Error::RepeatState, AUTH_REPEATS);
            }
        }
        Ok(())
    }

    /// EAP dialogue after the first request, until EAP success
    ///
    /// Identity and challenge rounds stay in this state. A resync or an
    /// AT_NOTIFICATION repeats the state, each at most once.
    async fn swu_eap(&mut self) -> Result<()> {
        for _ in 0..MAX_EAP_ROUNDS {
            let response = self.eap_round().await?;
            let eap = response
                .eap
                .ok_or_else(|| Error::MandatoryInformationMissing("EAP".into()))?;
            if eap.is_success() {
                return Ok(());
            }
            if eap.is_failure() {
                return Err(Error::AuthenticationFailed("EAP failure".into()));
            }
            match self.answer_eap(&eap).await? {
                Reply::Answer => continue,
                Reply::Resync => return Err(Error::SynchFailure),
                Reply::Notification => return Err(Error::RepeatState),
            }
        }
        Err(Error::AuthenticationFailed(format!(
            "No EAP success after {} rounds",
            MAX_EAP_ROUNDS
        )))
    }

    /// Build the reply to an EAP request of the SWu dialogue
    async fn answer_eap(&mut self, eap: &EapPacket) -> Result<Reply> {
        if eap.code != code::REQUEST {
            return Err(Error::InvalidMessage(format!(
                "Expected EAP request, got code {}",
                eap.code
            )));
        }
        let (reply, kind) = match &eap.body {
            EapBody::Other {
                eap_type: method::IDENTITY,
                ..
            } => {
                logging::log_eap_round(eap.code, method::IDENTITY, 0);
                let identity = EapPacket {
                    code: code::RESPONSE,
                    identifier: eap.identifier,
                    body: EapBody::Other {
                        eap_type: method::IDENTITY,
                        data: self.eap_identity().into_bytes(),
                    },
                };
                (identity, Reply::Answer)
            }
            EapBody::Aka(aka) => {
                logging::log_eap_round(eap.code, aka.method, aka.subtype);
                match aka.subtype {
                    subtype::CHALLENGE => match self.answer_challenge(eap, None).await? {
                        Answer::Response(p) => (p, Reply::Answer),
                        Answer::SyncFailure(p) => (p, Reply::Resync),
                    },
                    subtype::IDENTITY => (
                        EapPacket::aka_response(
                            eap.identifier,
                            aka.method,
                            subtype::IDENTITY,
                            vec![EapAttribute::with_length(
                                attr::IDENTITY,
                                self.eap_identity().as_bytes(),
                            )],
                        ),
                        Reply::Answer,
                    ),
                    subtype::NOTIFICATION => {
                        let kind = match aka.notification() {
                            Some(notification) if notification & NOTIFICATION_SUCCESS_BIT == 0 => {
                                warn!(notification, "EAP-AKA failure notification");
                                Reply::Notification
                            }
                            Some(notification) => {
                                info!(notification, "EAP-AKA notification");
                                Reply::Answer
                            }
                            None => Reply::Answer,
                        };
                        let ack = EapPacket::aka_response(
                            eap.identifier,
                            aka.method,
                            subtype::NOTIFICATION,
                            Vec::new(),
                        );
                        (ack, kind)
                    }
                    subtype::REAUTHENTICATION => (self.answer_reauthentication(eap)?, Reply::Answer),
                    subtype::AUTHENTICATION_REJECT => {
                        return Err(Error::AuthenticationFailed(
                            "EAP-AKA authentication reject".into(),
                        ))
                    }
                    other => {
                        warn!(subtype = other, "Unsupported EAP-AKA subtype");
                        let error = EapPacket::aka_response(
                            eap.identifier,
                            aka.method,
                            subtype::CLIENT_ERROR,
                            vec![EapAttribute::with_u16(attr::CLIENT_ERROR_CODE, 0)],
                        );
                        (error, Reply::Answer)
                    }
                }
            }
            EapBody::Other { eap_type, .. } => {
                return Err(Error::InvalidMessage(format!(
                    "Unsupported EAP method {}",
                    eap_type
                )))
            }
            _ => return Err(Error::InvalidMessage("Unexpected EAP body".into())),
        };
        self.pending_eap = Some(reply);
        Ok(kind)
    }

    fn eap_identity(&self) -> String {
        match &self.auth.reauth {
            Some(state) => state.identity.clone(),
            None => self.config.nai(),
        }
    }

    /// Answer an AKA or AKA' challenge, or build the resync reply
    ///
    /// `abba` is set when the challenge came inside NAS, and then the 5G
    /// key hierarchy is derived too.
    async fn answer_challenge(&mut self, eap: &EapPacket, abba: Option<&[u8]>) -> Result<Answer> {
        let aka = eap
            .aka()
            .ok_or_else(|| Error::InvalidMessage("Expected EAP-AKA challenge".into()))?;
        let rand: [u8; 16] = aka
            .rand()
            .and_then(|r| r.try_into().ok())
            .ok_or_else(|| Error::MandatoryInformationMissing("AT_RAND".into()))?;
        let autn: [u8; 16] = aka
            .autn()
            .and_then(|a| a.try_into().ok())
            .ok_or_else(|| Error::MandatoryInformationMissing("AT_AUTN".into()))?;

        let vector = resolve_vector(
            self.provider.as_ref(),
            &rand,
            &autn,
            self.config.fallback_to_default_vector,
        )
        .await?;
        match self.auth.record(&rand, &autn, vector) {
            Ok(()) => {}
            Err(Error::SynchFailure) => {
                warn!(method = aka.method, "EAP-AKA synchronization failure, sending AUTS");
                let auts = self.auth.auts.clone().unwrap_or_default();
                let mut attributes = vec![EapAttribute::raw(attr::AUTS, auts)];
                if aka.method == method::AKA_PRIME {
                    attributes.push(EapAttribute::with_u16(attr::KDF, KDF_AKA_PRIME));
                }
                return Ok(Answer::SyncFailure(EapPacket::aka_response(
                    eap.identifier,
                    aka.method,
                    subtype::SYNCHRONIZATION_FAILURE,
                    attributes,
                )));
            }
            Err(e) => return Err(e),
        }

        let k_aut = if aka.method == method::AKA_PRIME {
            if let Some(kdf) = aka.kdf() {
                if kdf != KDF_AKA_PRIME {
                    return Err(Error::AuthenticationFailed(format!(
                        "Unsupported AT_KDF {}",
                        kdf
                    )));
                }
            }
            let network_name = match aka.kdf_input() {
                Some(name) => name.to_vec(),
                None => self
                    .config
                    .kdf_input
                    .clone()
                    .unwrap_or_else(|| self.config.serving_network_name())
                    .into_bytes(),
            };
            let supi = abba.map(|abba| (self.config.imsi.as_str(), abba));
            Zeroizing::new(self.auth.aka_prime(&network_name, supi)?.k_aut.to_vec())
        } else {
            Zeroizing::new(self.auth.aka()?.k_aut.to_vec())
        };
        eap.verify_mac(&k_aut, &[])?;

        if aka.method == method::AKA {
            if let (Some(iv), Some(encrypted)) =
                (aka.attribute(attr::IV), aka.attribute(attr::ENCR_DATA))
            {
                let k_encr = self
                    .auth
                    .aka
                    .as_ref()
                    .map(|keys| Zeroizing::new(keys.k_encr))
                    .ok_or_else(|| Error::InvalidState("No K_encr".into()))?;
                let inner = decrypt_encr_data(&k_encr[..], iv, encrypted)?;
                if let Some(identity) = find_attribute(&inner, attr::NEXT_REAUTH_ID)
                    .and_then(EapAttribute::as_length_prefixed)
                {
                    let identity = String::from_utf8_lossy(identity).into_owned();
                    debug!(identity = %identity, "Fast reauthentication identity received");
                    self.auth.store_reauth_identity(identity)?;
                }
            }
        }

        let mut reply = EapPacket::aka_response(
            eap.identifier,
            aka.method,
            subtype::CHALLENGE,
            vec![EapAttribute::res(&self.auth.res), EapAttribute::empty_mac()],
        );
        reply.sign(&k_aut, &[])?;
        Ok(Answer::Response(reply))
    }

    fn answer_reauthentication(&mut self, eap: &EapPacket) -> Result<EapPacket> {
        let aka = eap
            .aka()
            .ok_or_else(|| Error::InvalidMessage("Expected EAP-AKA reauthentication".into()))?;
        let (k_aut, k_encr) = {
            let state = self
                .auth
                .reauth
                .as_ref()
                .ok_or_else(|| Error::InvalidState("No fast reauth identity".into()))?;
            (Zeroizing::new(state.k_aut), Zeroizing::new(state.k_encr))
        };
        eap.verify_mac(&k_aut[..], &[])?;

        let iv = aka
            .attribute(attr::IV)
            .ok_or_else(|| Error::MandatoryInformationMissing("AT_IV".into()))?;
        let encrypted = aka
            .attribute(attr::ENCR_DATA)
            .ok_or_else(|| Error::MandatoryInformationMissing("AT_ENCR_DATA".into()))?;
        let inner = decrypt_encr_data(&k_encr[..], iv, encrypted)?;
        let counter = find_attribute(&inner, attr::COUNTER)
            .and_then(EapAttribute::as_u16)
            .ok_or_else(|| Error::MandatoryInformationMissing("AT_COUNTER".into()))?;
        let nonce_s = find_attribute(&inner, attr::NONCE_S)
            .and_then(EapAttribute::as_bytes16)
            .ok_or_else(|| Error::MandatoryInformationMissing("AT_NONCE_S".into()))?
            .to_vec();
        let next_identity = find_attribute(&inner, attr::NEXT_REAUTH_ID)
            .and_then(EapAttribute::as_length_prefixed)
            .map(|id| String::from_utf8_lossy(id).into_owned());

        let mut reply_inner = vec![EapAttribute::with_u16(attr::COUNTER, counter)];
        match self.auth.reauthenticate(counter, &nonce_s) {
            Ok(_) => info!(counter, "Fast reauthentication accepted"),
            Err(Error::AuthenticationFailed(reason)) => {
                warn!(counter, reason = %reason, "Fast reauthentication counter too small");
                reply_inner.push(EapAttribute::raw(attr::COUNTER_TOO_SMALL, vec![0, 0]));
            }
            Err(e) => return Err(e),
        }
        let len: usize = reply_inner.iter().map(EapAttribute::encoded_len).sum();
        if let Some(padding) = EapAttribute::padding_for(len) {
            reply_inner.push(padding);
        }

        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);
        let encrypted = aes128_cbc_encrypt(&k_encr[..], &iv, &encode_attributes(&reply_inner))?;
        let mut reply = EapPacket::aka_response(
            eap.identifier,
            aka.method,
            subtype::REAUTHENTICATION,
            vec![
                EapAttribute::with_reserved(attr::IV, &iv),
                EapAttribute::with_reserved(attr::ENCR_DATA, &encrypted),
                EapAttribute::empty_mac(),
            ],
        );
        reply.sign(&k_aut[..], &nonce_s)?;

        if let (Some(identity), Some(state)) = (next_identity, self.auth.reauth.as_mut()) {
            debug!(identity = %identity, "Next fast reauthentication identity");
            state.identity = identity;
        }
        Ok(reply)
    }

    async fn final_auth(&mut self) -> Result<()> {
        let key = Zeroizing::new(self.auth.auth_key()?);
        let auth = IkeAuthExchange::compute_auth(&self.session, &key, &self.idi)?;
        let response = self
            .auth_round(IkeAuthExchange::final_request(self.config.variant, auth))
            .await?;
        self.complete_auth(response, &key).await
    }

    async fn complete_auth(&mut self, response: ExchangePayloads, key: &[u8]) -> Result<()> {
        let idr = response.idr.clone().or_else(|| self.idr.clone());
        let received = response
            .auth
            .as_ref()
            .ok_or_else(|| Error::MandatoryInformationMissing("AUTH".into()))?;
        let peer_id = idr
            .as_ref()
            .and_then(IdPayload::as_string)
            .unwrap_or_else(|| self.peer.ip().to_string());
        match &idr {
            Some(idr) => {
                if let Err(e) = IkeAuthExchange::verify_auth(&self.session, key, idr, received) {
                    logging::log_authentication_failed(&peer_id, &e.to_string());
                    return Err(e);
                }
            }
            None => warn!("Gateway sent no IDr, its AUTH is not verified"),
        }
        logging::log_authentication_success(&peer_id, "EAP");

        let cp = response
            .cp
            .as_ref()
            .ok_or_else(|| Error::MandatoryInformationMissing("CP".into()))?;
        let tunnel = cp
            .ipv4_addresses(cfg::INTERNAL_IP4_ADDRESS)
            .last()
            .copied()
            .ok_or_else(|| Error::MandatoryInformationMissing("INTERNAL_IP4_ADDRESS".into()))?;
        self.dns = cp.ipv4_addresses(cfg::INTERNAL_IP4_DNS);
        self.tunnel_address = Some(tunnel);
        if self.config.variant == AccessVariant::Nwu {
            self.nas_endpoint = Some(nas_endpoint(&response)?);
        }
        info!(
            tunnel = %tunnel,
            dns = ?self.dns,
            nas = ?self.nas_endpoint,
            "Tunnel configuration received"
        );

        let chosen = accept_proposal(&self.config.child_proposals, response.chosen_proposal()?)?;
        let spi_out = chosen.esp_spi()?;
        let algorithms = NegotiatedAlgorithms::from_proposal(&chosen)?;
        let keys = self.session.keys()?;
        let child = ChildSession::derive(
            self.session.algorithms().prf()?,
            &keys.sk_d,
            None,
            self.session.nonce_i(),
            self.session.nonce_r(),
            algorithms,
            self.child_spi,
            spi_out,
            true,
            ChildKind::Signaling,
        )?;
        self.start_data_path(&child).await?;
        self.children.push(child);
        Ok(())
    }

    async fn start_data_path(&mut self, child: &ChildSession) -> Result<()> {
        let Some(signaling) = self.signaling_device.clone() else {
            debug!("No packet device attached, data path not started");
            return Ok(());
        };
        let transport = match self.socket.take() {
            Some(socket) if self.nat_t => EspTransport::from_udp_socket(socket, self.peer),
            socket => {
                self.socket = socket;
                let local = (!self.config.local.is_unspecified()).then_some(self.config.local);
                EspTransport::raw_esp(local, self.config.server)?
            }
        };
        if self.nat_t && self.config.data_path == DataPath::RawEsp {
            info!("NAT detected, ESP is UDP encapsulated");
        }

        let forwarder = Forwarder::new(
            transport,
            signaling,
            self.user_plane_device.clone(),
            self.config.reassembly,
        )
        .spawn(self.to_driver.clone());
        let epoch = self.epochs.next_epoch();
        forwarder.install_child(child, epoch, None, false).await?;
        logging::log_sa_update("create", child.spi_in, epoch);
        self.forwarder = Some(forwarder);
        Ok(())
    }

    async fn nwu_registration(&mut self) -> Result<()> {
        let tunnel = self
            .tunnel_address
            .ok_or_else(|| Error::InvalidState("No tunnel address".into()))?;
        let endpoint = self
            .nas_endpoint
            .ok_or_else(|| Error::InvalidState("No NAS endpoint".into()))?;
        let stream = relay::connect(tunnel, endpoint).await?;
        self.relay = Some(NasRelay::spawn(stream, self.to_driver.clone()));

        let deadline = Instant::now() + self.config.step_timeout * (self.config.retries + 1);
        while !self.registered {
            let message = tokio::time::timeout_at(deadline, self.from_workers.recv())
                .await
                .map_err(|_| Error::Timeout)?;
            match message {
                Some(ControlMessage::Nas(pdu)) => self.handle_nas(&pdu).await?,
                Some(ControlMessage::Ike(data)) => {
                    if let Err(e) = self.handle_datagram(&data).await {
                        logging::log_error("ike", &e.to_string());
                    }
                }
                Some(ControlMessage::NasTerminate) => {
                    return Err(Error::Other("NAS session closed before registration".into()))
                }
                Some(other) => debug!(message = other.name(), "Control message ignored"),
                None => return Err(Error::ChannelClosed),
            }
        }
        Ok(())
    }

    async fn send_nas(&mut self, plain: &[u8]) -> Result<()> {
        let context = self
            .nas_security
            .as_mut()
            .ok_or_else(|| Error::InvalidState("No NAS security context".into()))?;
        let protected = context.protect(plain, sec_header::INTEGRITY_PROTECTED_AND_CIPHERED)?;
        logging::log_nas_message(
            "uplink",
            plain.get(2).copied().unwrap_or_default(),
            protected.len(),
        );
        let (relay, _) = self
            .relay
            .as_ref()
            .ok_or_else(|| Error::InvalidState("NAS relay not running".into()))?;
        channel::send(relay, ControlMessage::Nas(protected)).await
    }

    async fn handle_nas(&mut self, pdu: &[u8]) -> Result<()> {
        let plain = match SecuredNas::header_type(pdu) {
            Some(sec_header::PLAIN) | None => pdu.to_vec(),
            Some(_) => {
                let secured = SecuredNas::parse(pdu)?;
                self.nas_security
                    .as_mut()
                    .ok_or_else(|| Error::InvalidState("No NAS security context".into()))?
                    .unprotect(&secured)?
            }
        };
        logging::log_nas_message(
            "downlink",
            plain.get(2).copied().unwrap_or_default(),
            pdu.len(),
        );

        match NasMessage::decode(&plain)? {
            NasMessage::RegistrationAccept(accept) => {
                info!(guti = ?accept.guti, "Registration accepted");
                self.send_nas(&nas::registration_complete()).await?;
                let request = nas::pdu_session_establishment_request(
                    PDU_SESSION_ID,
                    PTI,
                    nas::PDU_SESSION_TYPE_IPV4,
                );
                let s_nssai = self
                    .config
                    .nssai
                    .first()
                    .map(|(sst, sd)| nas::s_nssai(*sst, *sd));
                let transport = nas::ul_nas_transport(
                    &request,
                    PDU_SESSION_ID,
                    Some(nas::REQUEST_TYPE_INITIAL),
                    s_nssai.as_deref(),
                    Some(&nas::dnn(&self.config.dnn)),
                );
                self.send_nas(&transport).await?;
                self.registered = true;
                Ok(())
            }
            NasMessage::RegistrationReject(cause) => Err(Error::AuthenticationFailed(format!(
                "Registration reject, cause {}",
                cause
            ))),
            NasMessage::DlNasTransport(transport) => {
                match NasMessage::decode(&transport.payload)? {
                    NasMessage::PduSessionAccept(accept) => {
                        info!(
                            pdu_session_id = accept.pdu_session_id,
                            address = ?accept.ipv4,
                            dns = ?accept.dns_v4,
                            "PDU session established"
                        );
                        self.pdu_session = Some(accept);
                    }
                    NasMessage::PduSessionReject(cause) => {
                        warn!(cause, "PDU session establishment rejected");
                    }
                    NasMessage::PduSessionReleaseCommand(cause) => {
                        info!(cause, "PDU session released by the network");
                        self.pdu_session = None;
                    }
                    other => debug!(message = other.name(), "Ignoring N1 SM message"),
                }
                Ok(())
            }
            other => {
                debug!(message = other.name(), "Ignoring NAS message");
                Ok(())
            }
        }
    }

    async fn serve(
        &mut self,
        commands: &mut Option<mpsc::Receiver<OperatorCommand>>,
    ) -> Result<Outcome> {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match self.next_event(commands, &mut tick).await {
                Event::Ike(data) | Event::Worker(Some(ControlMessage::Ike(data))) => {
                    match self.handle_datagram(&data).await {
                        Ok(Some(outcome)) => return Ok(outcome),
                        Ok(None) => {}
                        Err(e) => logging::log_error("ike", &e.to_string()),
                    }
                }
                Event::Worker(Some(ControlMessage::Nas(pdu))) => {
                    if let Err(e) = self.handle_nas(&pdu).await {
                        logging::log_error("nas", &e.to_string());
                    }
                }
                Event::Worker(Some(ControlMessage::NasTerminate)) => {
                    warn!("NAS session closed by the network");
                    self.stop_relay().await;
                }
                Event::Worker(Some(other)) => {
                    debug!(message = other.name(), "Control message ignored");
                }
                Event::Worker(None) => return Err(Error::ChannelClosed),
                Event::Command(Some(command)) => {
                    if let Some(outcome) = self.handle_command(command).await? {
                        return Ok(outcome);
                    }
                }
                Event::Command(None) => {
                    debug!("Operator console closed");
                    *commands = None;
                }
                Event::Tick => self.on_tick().await?,
                Event::Failed(e) => return Err(e),
            }
        }
    }

    async fn next_event(
        &mut self,
        commands: &mut Option<mpsc::Receiver<OperatorCommand>>,
        tick: &mut Interval,
    ) -> Event {
        let socket = self.socket.as_ref();
        let (peer, nat_t) = (self.peer, self.nat_t);
        tokio::select! {
            biased;

            message = self.from_workers.recv() => Event::Worker(message),
            datagram = recv_signaling(socket, peer, nat_t) => match datagram {
                Ok(data) => Event::Ike(data),
                Err(e) => Event::Failed(e),
            },
            command = recv_command(commands) => Event::Command(command),
            _ = tick.tick() => Event::Tick,
        }
    }

    async fn handle_datagram(&mut self, data: &[u8]) -> Result<Option<Outcome>> {
        let header = IkeHeader::from_bytes(data)?;
        if header.flags.is_response() {
            self.on_response(&header, data).await?;
            return Ok(None);
        }

        if let Some((spi, message_id, response)) = &self.last_response {
            if *spi == header.initiator_spi && *message_id == header.message_id {
                debug!(message_id, "Retransmitted request, resending our response");
                let response = response.clone();
                self.send_ike(&response).await?;
                return Ok(None);
            }
        }

        let (message, generation) = self.session.unprotect(data)?;
        let payloads = ExchangePayloads::collect(&message.payloads);
        match header.exchange_type {
            ExchangeType::Informational => {
                self.on_informational(&header, generation, payloads).await
            }
            ExchangeType::CreateChildSa => {
                self.on_create_child(&header, generation, payloads).await?;
                Ok(None)
            }
            other => {
                warn!(exchange = ?other, "Unexpected request in CONNECTED");
                Ok(None)
            }
        }
    }

    async fn respond(
        &mut self,
        generation: KeyGeneration,
        request: &IkeHeader,
        payloads: &[IkePayload],
    ) -> Result<()> {
        let header = self
            .session
            .response_header(request.exchange_type, request.message_id);
        let bytes = self.session.protect_with(generation, &header, payloads)?;
        self.send_ike(&bytes).await?;
        self.last_response = Some((request.initiator_spi, request.message_id, bytes));
        Ok(())
    }

    async fn on_informational(
        &mut self,
        header: &IkeHeader,
        generation: KeyGeneration,
        payloads: ExchangePayloads,
    ) -> Result<Option<Outcome>> {
        let mut reply = Vec::new();
        let mut outcome = None;
        let mut drop_previous = false;

        for delete in &payloads.deletes {
            if delete.protocol_id == ProtocolId::Ike.to_u8() {
                match generation {
                    KeyGeneration::Previous => {
                        info!("Peer deleted the replaced IKE SA");
                        drop_previous = true;
                    }
                    KeyGeneration::Current => {
                        info!("Peer deleted the IKE SA");
                        if let Err(e) = self.machine.transition(UeState::Delete) {
                            debug!(error = %e, "Peer delete during a pending exchange");
                        }
                        outcome = Some(Outcome::PeerDeleted);
                    }
                }
            } else if delete.protocol_id == ProtocolId::Esp.to_u8() {
                let ours = self.delete_children(&delete.esp_spis()).await?;
                if !ours.is_empty() {
                    reply.push(IkePayload::D(DeletePayload::esp(&ours)));
                }
            } else {
                debug!(protocol = delete.protocol_id, "Delete for unknown protocol");
            }
        }
        if payloads.deletes.is_empty() {
            debug!("Liveness check answered");
        }

        self.respond(generation, header, &reply).await?;
        if drop_previous {
            self.session.drop_previous();
        }
        Ok(outcome)
    }

    /// Remove child SAs by their outbound SPIs; returns our inbound SPIs
    async fn delete_children(&mut self, spis_out: &[u32]) -> Result<Vec<u32>> {
        let mut ours = Vec::new();
        let mut remaining = Vec::with_capacity(self.children.len());
        for mut child in std::mem::take(&mut self.children) {
            if !spis_out.contains(&child.spi_out) {
                remaining.push(child);
                continue;
            }
            child.mark_deleted("deleted by peer");
            ours.push(child.spi_in);
            if child.kind.is_user_plane() {
                self.user_plane_params = None;
                if let Some(forwarder) = &self.forwarder {
                    forwarder.delete_user_plane().await?;
                }
            } else {
                warn!(spi_in = child.spi_in, "Peer deleted the signaling child SA");
            }
        }
        self.children = remaining;

        self.retired.retain(|child| {
            if spis_out.contains(&child.spi_out) {
                ours.push(child.spi_in);
                false
            } else {
                true
            }
        });
        Ok(ours)
    }

    async fn on_create_child(
        &mut self,
        header: &IkeHeader,
        generation: KeyGeneration,
        payloads: ExchangePayloads,
    ) -> Result<()> {
        let protocol = payloads.proposals.first().map(|p| p.protocol_id);
        let rekey = payloads.notify(notify::REKEY_SA).cloned();

        match (protocol, rekey) {
            (Some(ProtocolId::Ike), _) => {
                info!("Peer requested an IKE rekey, starting our own");
                self.respond(
                    generation,
                    header,
                    &CreateChildSaExchange::refuse(notify::TEMPORARY_FAILURE),
                )
                .await?;
                self.start_ike_rekey(NonceBias::Lowest).await
            }
            (Some(ProtocolId::Esp), None) if self.config.variant == AccessVariant::Nwu => {
                match self.accept_user_plane(&payloads) {
                    Ok((reply, child, params)) => {
                        self.respond(generation, header, &reply).await?;
                        self.install_user_plane(child, params).await
                    }
                    Err(e) => {
                        warn!(error = %e, "User plane child SA refused");
                        self.respond(
                            generation,
                            header,
                            &CreateChildSaExchange::refuse(notify::NO_PROPOSAL_CHOSEN),
                        )
                        .await
                    }
                }
            }
            (Some(ProtocolId::Esp), Some(rekey)) => {
                info!("Peer requested a child rekey, starting our own");
                self.respond(
                    generation,
                    header,
                    &CreateChildSaExchange::refuse(notify::NO_PROPOSAL_CHOSEN),
                )
                .await?;
                let old_spi_out = spi_from_bytes(&rekey.spi)?;
                match self.children.iter().position(|c| c.spi_out == old_spi_out) {
                    Some(index) => self.start_child_rekey(index).await,
                    None => {
                        warn!(spi = %format!("{:#010x}", old_spi_out), "Rekey for unknown child SA");
                        Ok(())
                    }
                }
            }
            _ => {
                self.respond(
                    generation,
                    header,
                    &CreateChildSaExchange::refuse(notify::NO_PROPOSAL_CHOSEN),
                )
                .await
            }
        }
    }

    /// Accept an N3IWF initiated user plane child SA
    fn accept_user_plane(
        &self,
        request: &ExchangePayloads,
    ) -> Result<(Vec<IkePayload>, ChildSession, UserPlaneParams)> {
        let chosen = select_proposal(&request.proposals, &self.config.child_proposals)?.clone();
        let spi_out = chosen.esp_spi()?;
        let algorithms = NegotiatedAlgorithms::from_proposal(&chosen)?;
        let peer_nonce = request.require_nonce()?;

        let up_address = request
            .notify(notify::UP_IP4_ADDRESS)
            .and_then(|n| ipv4_from(&n.data))
            .ok_or_else(|| Error::MandatoryInformationMissing("UP_IP4_ADDRESS".into()))?;
        let qfi = match request.notify(notify::QOS_INFO_5G) {
            Some(n) => qos_flow_id(&n.data).unwrap_or_else(|| {
                warn!(len = n.data.len(), "Short 5G_QOS_INFO, using the default QFI");
                DEFAULT_QFI
            }),
            None => DEFAULT_QFI,
        };

        let (shared, ke) = match &request.ke {
            Some(ke) => {
                let pair = DhKeyPair::generate(DhGroup::from_transform_id(ke.dh_group)?);
                let shared = pair.compute_shared(&ke.key_data)?;
                (
                    Some(shared),
                    Some(KePayload::new(ke.dh_group, pair.public_bytes().to_vec())),
                )
            }
            None => (None, None),
        };

        let nonce = NoncePayload::generate(NonceBias::Random);
        let spi_in = generate_spi();
        let keys = self.session.keys()?;
        let child = ChildSession::derive(
            self.session.algorithms().prf()?,
            &keys.sk_d,
            shared.as_ref().map(|s| s.as_slice()),
            peer_nonce,
            &nonce.nonce,
            algorithms,
            spi_in,
            spi_out,
            false,
            ChildKind::UserPlane {
                qfi,
                up_address: Some(up_address),
            },
        )?;
        let params = UserPlaneParams {
            qfi,
            up_address,
            tunnel_address: self.tunnel_address.unwrap_or(Ipv4Addr::UNSPECIFIED),
        };
        let reply = CreateChildSaExchange::accept_child(&chosen, spi_in, &nonce, request, ke);
        Ok((reply, child, params))
    }

    async fn install_user_plane(&mut self, child: ChildSession, params: UserPlaneParams) -> Result<()> {
        let update = self.children.iter().any(|c| c.kind.is_user_plane());
        if let Some(forwarder) = &self.forwarder {
            let epoch = self.epochs.next_epoch();
            forwarder
                .install_child(&child, epoch, Some(params), update)
                .await?;
            logging::log_sa_update(if update { "update" } else { "create" }, child.spi_in, epoch);
        }
        for old in self.children.iter_mut().filter(|c| c.kind.is_user_plane()) {
            old.mark_deleted("replaced by a new user plane SA");
        }
        self.children.retain(|c| !c.kind.is_user_plane());
        info!(
            spi_in = %format!("{:#010x}", child.spi_in),
            qfi = params.qfi,
            up_address = %params.up_address,
            "User plane child SA installed"
        );
        self.user_plane_params = Some(params);
        self.children.push(child);
        Ok(())
    }

    async fn send_request(
        &mut self,
        exchange: ExchangeType,
        generation: KeyGeneration,
        payloads: &[IkePayload],
        request: PendingRequest,
    ) -> Result<()> {
        let header = match generation {
            KeyGeneration::Current => self.session.request_header(exchange),
            KeyGeneration::Previous => {
                let spis = self.session.spis();
                IkeHeader::new(
                    spis.initiator,
                    spis.responder,
                    PayloadType::None,
                    exchange,
                    IkeFlags::request(self.session.is_initiator()),
                    self.session.previous_message_id()?,
                    0,
                )
            }
        };
        let bytes = self.session.protect_with(generation, &header, payloads)?;
        self.send_ike(&bytes).await?;
        self.pending = Some(Pending {
            message_id: header.message_id,
            generation,
            bytes,
            sent_at: Instant::now(),
            attempts: 1,
            request,
        });
        Ok(())
    }

    async fn start_ike_rekey(&mut self, bias: NonceBias) -> Result<()> {
        if self.pending.is_some() {
            warn!("IKE rekey skipped, a request is outstanding");
            return Ok(());
        }
        let group = self
            .session
            .algorithms()
            .dh
            .ok_or_else(|| Error::InvalidState("No DH group negotiated".into()))?;
        let spis = self.session.spis();
        logging::log_ike_rekey_start(&spis.initiator, &spis.responder);
        self.machine.transition(UeState::RekeyIke)?;

        let dh = DhKeyPair::generate(group);
        let nonce = NoncePayload::generate(bias);
        let mut spi = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut spi);
        let mut proposals = filter_by_dh_group(&self.config.ike_proposals, group.transform_id());
        if proposals.is_empty() {
            proposals = self.ike_proposals.clone();
        }
        let payloads = CreateChildSaExchange::ike_rekey_request(
            &proposals,
            spi,
            KePayload::new(group.transform_id(), dh.public_bytes().to_vec()),
            &nonce,
        );
        self.send_request(
            ExchangeType::CreateChildSa,
            KeyGeneration::Current,
            &payloads,
            PendingRequest::RekeyIke {
                dh,
                nonce: nonce.nonce,
                spi,
                proposals,
            },
        )
        .await
    }

    async fn start_child_rekey(&mut self, index: usize) -> Result<()> {
        if self.pending.is_some() {
            warn!("Child rekey skipped, a request is outstanding");
            return Ok(());
        }
        let child = self
            .children
            .get_mut(index)
            .ok_or_else(|| Error::SaNotFound("child SA".into()))?;
        child.initiate_rekey()?;
        let old_spi_in = child.spi_in;
        let pfs = child.algorithms.dh;
        self.machine.transition(UeState::RekeyChild)?;

        let spi_in = generate_spi();
        let nonce = NoncePayload::generate(NonceBias::Random);
        let (proposals, dh) = match pfs {
            Some(group) => {
                let mut proposals =
                    filter_by_dh_group(&self.config.child_proposals, group.transform_id());
                if proposals.is_empty() {
                    proposals = self.config.child_proposals.clone();
                }
                (proposals, Some(DhKeyPair::generate(group)))
            }
            None => (self.config.child_proposals.clone(), None),
        };
        let ke = dh
            .as_ref()
            .map(|pair| KePayload::new(pair.group().transform_id(), pair.public_bytes().to_vec()));
        let payloads =
            CreateChildSaExchange::child_rekey_request(&proposals, spi_in, &nonce, ke, old_spi_in);
        self.send_request(
            ExchangeType::CreateChildSa,
            KeyGeneration::Current,
            &payloads,
            PendingRequest::RekeyChild {
                old_spi_in,
                dh,
                nonce: nonce.nonce,
                spi_in,
                proposals,
            },
        )
        .await
    }

    async fn on_response(&mut self, header: &IkeHeader, data: &[u8]) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            debug!(message_id = header.message_id, "Unsolicited response dropped");
            return Ok(());
        };
        let matches = header.message_id == pending.message_id
            && self.session.classify(header).ok() == Some(pending.generation);
        if !matches {
            debug!(message_id = header.message_id, "Response to another request dropped");
            self.pending = Some(pending);
            return Ok(());
        }
        let message = match self.session.unprotect(data) {
            Ok((message, _)) => message,
            Err(e) => {
                self.pending = Some(pending);
                return Err(e);
            }
        };
        let payloads = ExchangePayloads::collect(&message.payloads);

        match pending.request {
            PendingRequest::RekeyIke {
                dh,
                nonce,
                spi,
                proposals,
            } => {
                let result = self
                    .complete_ike_rekey(payloads, dh, nonce, spi, &proposals)
                    .await;
                self.back_to_connected()?;
                result
            }
            PendingRequest::RekeyChild {
                old_spi_in,
                dh,
                nonce,
                spi_in,
                proposals,
            } => {
                let result = self
                    .complete_child_rekey(payloads, old_spi_in, dh, nonce, spi_in, &proposals)
                    .await;
                self.back_to_connected()?;
                result
            }
            PendingRequest::DeleteOldIke => {
                info!("Replaced IKE SA deleted");
                self.session.drop_previous();
                Ok(())
            }
            PendingRequest::DeleteChild { spi_in } => {
                self.retired.retain(|c| c.spi_in != spi_in);
                Ok(())
            }
        }
    }

    fn back_to_connected(&mut self) -> Result<()> {
        if self.machine.state() != UeState::Connected {
            self.machine.transition(UeState::Connected)?;
        }
        Ok(())
    }

    async fn complete_ike_rekey(
        &mut self,
        payloads: ExchangePayloads,
        dh: DhKeyPair,
        nonce_i: Vec<u8>,
        spi: [u8; 8],
        proposals: &[Proposal],
    ) -> Result<()> {
        payloads.check_errors()?;
        let chosen = accept_proposal(proposals, payloads.chosen_proposal()?)?;
        let algorithms = NegotiatedAlgorithms::from_proposal(&chosen)?;
        let peer_spi: [u8; 8] = chosen
            .spi
            .as_slice()
            .try_into()
            .map_err(|_| Error::InvalidPayload("IKE SPI must be 8 bytes".into()))?;
        let shared = pfs_secret(&dh, payloads.ke.as_ref())?;
        let nonce_r = payloads.require_nonce()?.to_vec();

        self.session.rekey(
            SpiPair {
                initiator: spi,
                responder: peer_spi,
            },
            nonce_i,
            nonce_r,
            &shared,
            algorithms,
            true,
        )?;
        self.send_request(
            ExchangeType::Informational,
            KeyGeneration::Previous,
            &InformationalExchange::delete_ike(),
            PendingRequest::DeleteOldIke,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete_child_rekey(
        &mut self,
        payloads: ExchangePayloads,
        old_spi_in: u32,
        dh: Option<DhKeyPair>,
        nonce_i: Vec<u8>,
        spi_in: u32,
        proposals: &[Proposal],
    ) -> Result<()> {
        let index = self
            .children
            .iter()
            .position(|c| c.spi_in == old_spi_in)
            .ok_or_else(|| Error::SaNotFound(format!("child SA {:#010x}", old_spi_in)))?;
        payloads.check_errors()?;
        let chosen = accept_proposal(proposals, payloads.chosen_proposal()?)?;
        let spi_out = chosen.esp_spi()?;
        let algorithms = NegotiatedAlgorithms::from_proposal(&chosen)?;
        let nonce_r = payloads.require_nonce()?;
        let shared = match &dh {
            Some(pair) => Some(pfs_secret(pair, payloads.ke.as_ref())?),
            None => None,
        };

        let keys = self.session.keys()?;
        let child = ChildSession::derive(
            self.session.algorithms().prf()?,
            &keys.sk_d,
            shared.as_ref().map(|s| s.as_slice()),
            &nonce_i,
            nonce_r,
            algorithms,
            spi_in,
            spi_out,
            true,
            self.children[index].kind,
        )?;
        let params = if child.kind.is_user_plane() {
            self.user_plane_params
        } else {
            None
        };
        if let Some(forwarder) = &self.forwarder {
            let epoch = self.epochs.next_epoch();
            forwarder.install_child(&child, epoch, params, true).await?;
            logging::log_sa_update("update", child.spi_in, epoch);
        }
        logging::log_child_rekey_complete(old_spi_in, child.spi_in);

        let mut old = std::mem::replace(&mut self.children[index], child);
        old.mark_rekeyed()?;
        self.retired.push(old);
        self.send_request(
            ExchangeType::Informational,
            KeyGeneration::Current,
            &InformationalExchange::delete_esp(&[old_spi_in]),
            PendingRequest::DeleteChild { spi_in: old_spi_in },
        )
        .await
    }

    async fn on_tick(&mut self) -> Result<()> {
        if self.session.expire_previous() {
            debug!("Grace period of the replaced IKE SA ended");
        }
        let state = self.machine.state();
        let retries = self.config.retries;
        let bytes = match self.pending.as_mut() {
            None => return Ok(()),
            Some(pending) if pending.sent_at.elapsed() < self.config.step_timeout => return Ok(()),
            Some(pending) if pending.attempts > retries => None,
            Some(pending) => {
                pending.attempts += 1;
                pending.sent_at = Instant::now();
                logging::log_retry(state, pending.attempts - 1, "no response");
                Some(pending.bytes.clone())
            }
        };

        match bytes {
            Some(bytes) => self.send_ike(&bytes).await,
            None => match self.pending.take().map(|p| p.request) {
                Some(PendingRequest::DeleteOldIke) => {
                    warn!("Delete of the replaced IKE SA not acknowledged");
                    self.session.drop_previous();
                    Ok(())
                }
                Some(PendingRequest::DeleteChild { spi_in }) => {
                    warn!(spi = %format!("{:#010x}", spi_in), "Child SA delete not acknowledged");
                    self.retired.retain(|c| c.spi_in != spi_in);
                    Ok(())
                }
                _ => Err(Error::Timeout),
            },
        }
    }

    async fn handle_command(&mut self, command: OperatorCommand) -> Result<Option<Outcome>> {
        logging::log_operator_command(command.name());
        match command {
            OperatorCommand::Quit => {
                if self.config.variant == AccessVariant::Nwu && self.relay.is_some() {
                    let release = nas::ul_nas_transport(
                        &nas::pdu_session_release_request(
                            PDU_SESSION_ID,
                            PTI,
                            nas::CAUSE_REGULAR_DEACTIVATION,
                        ),
                        PDU_SESSION_ID,
                        None,
                        None,
                        None,
                    );
                    if let Err(e) = self.send_nas(&release).await {
                        logging::log_error("pdu session release", &e.to_string());
                    }
                }
                self.stop_relay().await;
                self.delete_ike_sa().await;
                Ok(Some(Outcome::Quit))
            }
            OperatorCommand::RekeyIke => {
                self.start_ike_rekey(NonceBias::Random).await?;
                Ok(None)
            }
            OperatorCommand::RekeyChild => {
                match self.children.iter().position(|c| !c.kind.is_user_plane()) {
                    Some(index) => self.start_child_rekey(index).await?,
                    None => warn!("No signaling child SA to rekey"),
                }
                Ok(None)
            }
            OperatorCommand::Reauthenticate => {
                self.delete_ike_sa().await;
                Ok(Some(Outcome::Reauthenticate))
            }
        }
    }

    /// Best effort INFORMATIONAL delete of the IKE SA
    async fn delete_ike_sa(&mut self) {
        self.pending = None;
        if let Err(e) = self.machine.transition(UeState::Delete) {
            debug!(error = %e, "Delete outside CONNECTED");
        }
        let header = self.session.request_header(ExchangeType::Informational);
        let message_id = header.message_id;
        let result = match self
            .session
            .protect(&header, &InformationalExchange::delete_ike())
        {
            Ok(request) => self
                .transact(&request, |session, data| {
                    protected_response(session, data, ExchangeType::Informational, message_id)
                })
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => info!("IKE SA deleted"),
            Err(e) => logging::log_error("delete IKE SA", &e.to_string()),
        }
    }

    async fn stop_relay(&mut self) {
        let Some((relay, task)) = self.relay.take() else {
            return;
        };
        // the relay may already have stopped on its own
        let _ = channel::send(&relay, ControlMessage::NasTerminate).await;
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => logging::log_error("NAS relay", &e.to_string()),
            Err(e) => logging::log_error("NAS relay", &e.to_string()),
        }
    }

    async fn teardown(&mut self) {
        self.stop_relay().await;
        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.shutdown().await {
                logging::log_error("forwarder", &e.to_string());
            }
        }
        for child in self.children.iter_mut() {
            child.mark_deleted("session closed");
        }
        self.children.clear();
        self.retired.clear();
        self.pending = None;
        self.socket = None;
        self.machine.close();
    }

    fn reset_for_restart(&mut self, reauth: bool) -> Result<()> {
        self.machine.transition(UeState::Init)?;
        self.session.restart();
        self.auth.reset();
        self.ike_proposals = self.config.ike_proposals.clone();
        self.idr = None;
        self.cookie = None;
        self.child_spi = generate_spi();
        self.pending_eap = None;
        self.initial_nas.clear();
        self.nas_security = None;
        self.registered = false;
        self.tunnel_address = None;
        self.dns.clear();
        self.nas_endpoint = None;
        self.pdu_session = None;
        self.user_plane_params = None;
        self.last_response = None;
        while self.from_workers.try_recv().is_ok() {}

        let reauth_identity = if reauth {
            self.auth.reauth.as_ref().map(|state| state.identity.as_str())
        } else {
            None
        };
        if reauth && reauth_identity.is_none() {
            info!("No fast reauth identity, restarting with a full authentication");
        }
        self.idi = initial_identity(&self.config, reauth_identity);
        Ok(())
    }
}

/// IDi of a fresh attempt
///
/// A fast reauth identity wins; otherwise SWu uses the NAI and NWu a
/// random key ID.
fn initial_identity(config: &UeConfig, reauth_identity: Option<&str>) -> IdPayload {
    match (reauth_identity, config.variant) {
        (Some(identity), _) => IdPayload::from_email(identity),
        (None, AccessVariant::Swu) => IdPayload::from_email(&config.nai()),
        (None, AccessVariant::Nwu) => {
            let mut key_id = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut key_id);
            IdPayload::from_key_id(&key_id)
        }
    }
}

async fn local_endpoint(socket: &UdpSocket, peer: SocketAddr) -> Result<SocketAddr> {
    let mut local = socket.local_addr()?;
    if local.ip().is_unspecified() {
        let probe = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        probe.connect(peer).await?;
        local.set_ip(probe.local_addr()?.ip());
    }
    Ok(local)
}

/// Next IKE datagram from the signaling socket
///
/// Datagrams from other sources are skipped; on the NAT-T port only
/// marker-prefixed datagrams are IKE. Never resolves without a socket.
async fn recv_signaling(socket: Option<&UdpSocket>, peer: SocketAddr, nat_t: bool) -> Result<Vec<u8>> {
    let Some(socket) = socket else {
        return std::future::pending().await;
    };
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        if from != peer {
            debug!(from = %from, "Datagram from unknown source dropped");
            continue;
        }
        let data = &buf[..len];
        if !nat_t {
            return Ok(data.to_vec());
        }
        match data.strip_prefix(&NON_ESP_MARKER[..]) {
            Some(ike) => return Ok(ike.to_vec()),
            None => debug!(len, "Non-IKE datagram on the signaling socket dropped"),
        }
    }
}

async fn recv_command(commands: &mut Option<mpsc::Receiver<OperatorCommand>>) -> Option<OperatorCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn init_response(session: &IkeSession, data: &[u8]) -> Result<Vec<u8>> {
    let header = IkeHeader::from_bytes(data)?;
    if header.exchange_type != ExchangeType::IkeSaInit {
        return Err(Error::InvalidMessage(format!(
            "Expected IKE_SA_INIT, got {:?}",
            header.exchange_type
        )));
    }
    session.check_response(&header, 0)?;
    Ok(data.to_vec())
}

fn protected_response(
    session: &IkeSession,
    data: &[u8],
    exchange: ExchangeType,
    message_id: u32,
) -> Result<ExchangePayloads> {
    let header = IkeHeader::from_bytes(data)?;
    if header.exchange_type != exchange {
        return Err(Error::InvalidMessage(format!(
            "Expected {:?}, got {:?}",
            exchange, header.exchange_type
        )));
    }
    session.check_response(&header, message_id)?;
    let (message, _) = session.unprotect(data)?;
    Ok(ExchangePayloads::collect(&message.payloads))
}

/// EAP-5G NAS response carrying the registration request and AN parameters
fn registration_eap(config: &UeConfig, identifier: u8, registration: Vec<u8>) -> Result<EapPacket> {
    let an_parameters = vec![
        AnParameter::guami(&config.mcc, &config.mnc, GUAMI.0, GUAMI.1, GUAMI.2)?,
        AnParameter::plmn(&config.mcc, &config.mnc)?,
        AnParameter::nssai(&config.nssai),
        AnParameter::establishment_cause(an_param::CAUSE_MO_DATA),
    ];
    Ok(EapPacket::eap5g_response(
        identifier,
        Eap5gMessage::nas(an_parameters, registration),
    ))
}

fn nas_eap(identifier: u8, pdu: Vec<u8>) -> EapPacket {
    EapPacket::eap5g_response(identifier, Eap5gMessage::nas(Vec::new(), pdu))
}

/// Identifier and NAS PDU of an EAP-5G NAS request
fn eap5g_nas(payloads: &ExchangePayloads) -> Result<(u8, Vec<u8>)> {
    let eap = payloads
        .eap
        .as_ref()
        .ok_or_else(|| Error::MandatoryInformationMissing("EAP".into()))?;
    if eap.is_failure() {
        return Err(Error::AuthenticationFailed("EAP failure".into()));
    }
    let message = eap
        .eap5g()
        .ok_or_else(|| Error::InvalidMessage("Expected EAP-5G".into()))?;
    if message.message_id == eap5g::STOP {
        return Err(Error::AuthenticationFailed("EAP-5G stop".into()));
    }
    let pdu = message
        .nas_pdu
        .clone()
        .ok_or_else(|| Error::MandatoryInformationMissing("NAS PDU".into()))?;
    Ok((eap.identifier, pdu))
}

/// NAS address and TCP port from the final IKE_AUTH notifies
fn nas_endpoint(payloads: &ExchangePayloads) -> Result<SocketAddr> {
    let address = payloads
        .notify(notify::NAS_IP4_ADDRESS)
        .and_then(|n| ipv4_from(&n.data))
        .ok_or_else(|| Error::MandatoryInformationMissing("NAS_IP4_ADDRESS".into()))?;
    let port = payloads
        .notify(notify::NAS_TCP_PORT)
        .and_then(|n| n.data.get(..2))
        .map(|p| u16::from_be_bytes([p[0], p[1]]))
        .ok_or_else(|| Error::MandatoryInformationMissing("NAS_TCP_PORT".into()))?;
    Ok(SocketAddr::new(IpAddr::V4(address), port))
}

/// DH secret of a CREATE_CHILD_SA response, which must answer our KE group
fn pfs_secret(pair: &DhKeyPair, ke: Option<&KePayload>) -> Result<Zeroizing<Vec<u8>>> {
    let ke = ke.ok_or_else(|| Error::MandatoryInformationMissing("KE".into()))?;
    if ke.dh_group != pair.group().transform_id() {
        return Err(Error::InvalidPayload(format!(
            "KE group {} does not match our offer",
            ke.dh_group
        )));
    }
    pair.compute_shared(&ke.key_data)
}

fn ipv4_from(data: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// First QFI of a 5G_QOS_INFO notify
fn qos_flow_id(data: &[u8]) -> Option<u8> {
    data.get(3).map(|qfi| qfi & 0x3f)
}

fn spi_from_bytes(spi: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = spi
        .try_into()
        .map_err(|_| Error::InvalidSpi(0))?;
    Ok(u32::from_be_bytes(bytes))
}

fn find_attribute(attributes: &[EapAttribute], attr_type: u8) -> Option<&EapAttribute> {
    attributes.iter().find(|a| a.attr_type == attr_type)
}

/// Decrypt AT_ENCR_DATA into its nested attributes
fn decrypt_encr_data(
    k_encr: &[u8],
    iv: &EapAttribute,
    encrypted: &EapAttribute,
) -> Result<Vec<EapAttribute>> {
    let iv = iv
        .as_bytes16()
        .ok_or_else(|| Error::MandatoryInformationMissing("AT_IV".into()))?;
    let plain = aes128_cbc_decrypt(k_encr, iv, encrypted.as_tail())?;
    decode_attributes(&plain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::{
        message::IkeMessage,
        payload::NotifyPayload,
    };
    use crate::mobile::milenage::MilenageProvider;

    fn config(port: u16) -> UeConfig {
        UeConfig::builder()
            .with_imsi("208930000000003")
            .with_ki([0x46; 16])
            .with_opc([0xcd; 16])
            .with_server(Ipv4Addr::LOCALHOST)
            .with_local(Ipv4Addr::LOCALHOST)
            .with_ports(port, port)
            .with_step_timeout(Duration::from_millis(100))
            .with_retries(1)
            .build()
            .unwrap()
    }

    fn client(config: UeConfig) -> UeClient {
        let provider = Arc::new(MilenageProvider::new(config.milenage()).with_imsi(&config.imsi));
        UeClient::new(config, provider)
    }

    #[test]
    fn test_operator_command_parse() {
        assert_eq!(OperatorCommand::parse("q"), Some(OperatorCommand::Quit));
        assert_eq!(OperatorCommand::parse("quit\n"), Some(OperatorCommand::Quit));
        assert_eq!(OperatorCommand::parse(" i "), Some(OperatorCommand::RekeyIke));
        assert_eq!(OperatorCommand::parse("c"), Some(OperatorCommand::RekeyChild));
        assert_eq!(OperatorCommand::parse("r"), Some(OperatorCommand::Reauthenticate));
        assert_eq!(OperatorCommand::parse("x"), None);
        assert_eq!(OperatorCommand::RekeyChild.name(), "rekey_child");
    }

    #[test]
    fn test_registration_eap() {
        let config = config(500);
        let registration = nas::registration_request("208", "93", "208930000000003").unwrap();
        let packet = registration_eap(&config, 7, registration.clone()).unwrap();
        assert_eq!(packet.code, code::RESPONSE);
        assert_eq!(packet.identifier, 7);

        let decoded = EapPacket::from_bytes(&packet.to_bytes()).unwrap();
        let message = decoded.eap5g().unwrap();
        assert_eq!(message.message_id, eap5g::NAS);
        assert_eq!(message.nas_pdu.as_deref(), Some(registration.as_slice()));
        let kinds: Vec<u8> = message.an_parameters.iter().map(|p| p.param_type).collect();
        assert_eq!(
            kinds,
            vec![
                an_param::GUAMI,
                an_param::SELECTED_PLMN_ID,
                an_param::REQUESTED_NSSAI,
                an_param::ESTABLISHMENT_CAUSE
            ]
        );
    }

    #[test]
    fn test_nas_endpoint() {
        let payloads = ExchangePayloads::collect(&[
            IkePayload::N(NotifyPayload::new(notify::NAS_IP4_ADDRESS, vec![10, 0, 0, 1])),
            IkePayload::N(NotifyPayload::new(notify::NAS_TCP_PORT, vec![0x4e, 0x20])),
        ]);
        assert_eq!(
            nas_endpoint(&payloads).unwrap(),
            "10.0.0.1:20000".parse::<SocketAddr>().unwrap()
        );

        let missing_port = ExchangePayloads::collect(&[IkePayload::N(NotifyPayload::new(
            notify::NAS_IP4_ADDRESS,
            vec![10, 0, 0, 1],
        ))]);
        assert!(matches!(
            nas_endpoint(&missing_port),
            Err(Error::MandatoryInformationMissing(_))
        ));
    }

    #[test]
    fn test_qos_flow_id() {
        assert_eq!(qos_flow_id(&[4, 1, 1, 9]), Some(9));
        assert_eq!(qos_flow_id(&[4, 1, 1, 0xc5]), Some(5));
        assert_eq!(qos_flow_id(&[4, 1]), None);
        assert_eq!(spi_from_bytes(&[0, 0, 1, 0]).unwrap(), 256);
        assert!(spi_from_bytes(&[1, 2]).is_err());
    }

    #[test]
    fn test_encr_data_decrypt() {
        let k_encr = [0x2a; 16];
        let iv = [0x11; 16];
        let mut inner = vec![
            EapAttribute::with_u16(attr::COUNTER, 3),
            EapAttribute::with_reserved(attr::NONCE_S, &[0x55; 16]),
        ];
        let len: usize = inner.iter().map(EapAttribute::encoded_len).sum();
        if let Some(padding) = EapAttribute::padding_for(len) {
            inner.push(padding);
        }
        let encrypted = aes128_cbc_encrypt(&k_encr, &iv, &encode_attributes(&inner)).unwrap();

        let decoded = decrypt_encr_data(
            &k_encr,
            &EapAttribute::with_reserved(attr::IV, &iv),
            &EapAttribute::with_reserved(attr::ENCR_DATA, &encrypted),
        )
        .unwrap();
        assert_eq!(
            find_attribute(&decoded, attr::COUNTER).and_then(EapAttribute::as_u16),
            Some(3)
        );
        assert_eq!(
            find_attribute(&decoded, attr::NONCE_S).and_then(EapAttribute::as_bytes16),
            Some(&[0x55; 16][..])
        );
    }

    #[test]
    fn test_initial_identity() {
        let nwu = config(500);
        let id = initial_identity(&nwu, None);
        assert_eq!(id.data.len(), 16);

        let id = initial_identity(&nwu, Some("4reauth@nai.epc"));
        assert_eq!(id.as_string().as_deref(), Some("4reauth@nai.epc"));
    }

    #[test]
    fn test_repeat_budget_per_kind() {
        let mut auth = RepeatBudget::default();
        assert!(auth.spend(&Error::SynchFailure, AUTH_REPEATS));
        assert!(!auth.spend(&Error::SynchFailure, AUTH_REPEATS));
        // a notification repeat is counted apart from the resync
        assert!(auth.spend(&Error::RepeatState, AUTH_REPEATS));
        assert!(!auth.spend(&Error::RepeatState, AUTH_REPEATS));
        assert_eq!(auth.spent(), 2);

        let mut init = RepeatBudget::default();
        for _ in 0..INIT_REPEATS {
            assert!(init.spend(&Error::RepeatStateCookie(vec![1; 8]), INIT_REPEATS));
        }
        assert!(!init.spend(&Error::RepeatStateCookie(vec![1; 8]), INIT_REPEATS));
        assert!(init.spend(&Error::RepeatState, INIT_REPEATS));
    }

    #[tokio::test]
    async fn test_init_timeout_after_retries() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();
        let counter = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let mut received = 0;
            while tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf))
                .await
                .is_ok()
            {
                received += 1;
            }
            received
        });

        let mut ue = client(config(port));
        let result = ue.connect().await;
        assert_eq!(result, Err(Error::Timeout));
        assert_eq!(counter.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_init_no_proposal_chosen() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (len, from) = peer.recv_from(&mut buf).await.unwrap();
            let request = IkeMessage::from_bytes(&buf[..len]).unwrap();
            let header = IkeHeader::new(
                request.header.initiator_spi,
                [0u8; 8],
                PayloadType::None,
                ExchangeType::IkeSaInit,
                IkeFlags::response(false),
                0,
                0,
            );
            let mut reply = IkeMessage::new(
                header,
                vec![IkePayload::N(NotifyPayload::new(
                    notify::NO_PROPOSAL_CHOSEN,
                    Vec::new(),
                ))],
            );
            peer.send_to(&reply.to_bytes().unwrap(), from).await.unwrap();
        });

        let mut ue = client(config(port));
        assert_eq!(
            ue.connect().await,
            Err(Error::ProtocolNotify(notify::NO_PROPOSAL_CHOSEN))
        );
        assert_eq!(ue.state(), UeState::Init);
        assert!(ue.tunnel_address().is_none());
    }
}
