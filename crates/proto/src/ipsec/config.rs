//! UE Configuration
//!
//! Provides the configuration structure and builder pattern for [`UeClient`].
//!
//! [`UeClient`]: super::client::UeClient

use std::net::Ipv4Addr;
use std::time::Duration;

use super::{
    crypto::{DhGroup, EncrAlgorithm, IntegAlgorithm, PrfAlgorithm},
    forwarder::{DataPath, ReassemblyLimits},
    ikev2::{
        constants::{IKE_NAT_PORT, IKE_PORT},
        proposal::{Proposal, ProtocolId, Transform},
        state::AccessVariant,
    },
    session::DEFAULT_REKEY_GRACE,
    Error, Result,
};
use crate::mobile::{kdf, milenage::Milenage, nas::SST_EMBB};

/// Operator variant key
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum OperatorKey {
    /// OP, OPc is derived from it
    Op([u8; 16]),
    /// OPc as provisioned
    Opc([u8; 16]),
}

impl std::fmt::Debug for OperatorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatorKey::Op(_) => f.write_str("Op([REDACTED])"),
            OperatorKey::Opc(_) => f.write_str("Opc([REDACTED])"),
        }
    }
}

/// UE configuration
#[derive(Clone)]
pub struct UeConfig {
    /// Access variant (5G NWu or legacy SWu)
    pub variant: AccessVariant,

    /// IMSI digits
    pub imsi: String,

    /// Mobile country code (3 digits)
    pub mcc: String,

    /// Mobile network code (2 or 3 digits)
    pub mnc: String,

    /// Subscriber key Ki
    pub ki: [u8; 16],

    /// OP or OPc
    pub operator_key: OperatorKey,

    /// N3IWF / ePDG address
    pub server: Ipv4Addr,

    /// Local address to bind, unspecified for any
    pub local: Ipv4Addr,

    /// IKE port (500)
    pub ike_port: u16,

    /// NAT traversal port (4500)
    pub nat_port: u16,

    /// IKE SA proposals, in preference order
    pub ike_proposals: Vec<Proposal>,

    /// Child SA proposals, in preference order
    pub child_proposals: Vec<Proposal>,

    /// Time to wait for the answer to one request
    pub step_timeout: Duration,

    /// Retransmissions of a request before giving up
    pub retries: u32,

    /// Full restarts of the establishment flow before giving up
    pub iterations: u32,

    /// Trailing pad octets in SK payloads under ENCR_NULL (0 or 1)
    pub null_padding: usize,

    /// Use a fixed vector when the vector provider fails
    pub fallback_to_default_vector: bool,

    /// Data network name (APN)
    pub dnn: String,

    /// IMEISV digits, sent when the network asks for it
    pub imeisv: Option<String>,

    /// Requested slices (SST, SD)
    pub nssai: Vec<(u8, Option<u32>)>,

    /// EAP-AKA' network name; taken from AT_KDF_INPUT when `None`
    pub kdf_input: Option<String>,

    /// User plane transport
    pub data_path: DataPath,

    /// Bounds of the fragment reassembly table
    pub reassembly: ReassemblyLimits,

    /// Lifetime of the previous IKE keys after a rekey
    pub rekey_grace: Duration,
}

impl std::fmt::Debug for UeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UeConfig")
            .field("variant", &self.variant)
            .field("imsi", &self.imsi)
            .field("mcc", &self.mcc)
            .field("mnc", &self.mnc)
            .field("server", &self.server)
            .field("ike_proposals", &self.ike_proposals.len())
            .field("child_proposals", &self.child_proposals.len())
            .field("step_timeout", &self.step_timeout)
            .field("retries", &self.retries)
            .field("iterations", &self.iterations)
            .field("data_path", &self.data_path)
            .finish()
    }
}

impl UeConfig {
    /// Create builder for UE configuration
    pub fn builder() -> UeConfigBuilder {
        UeConfigBuilder::new()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(6..=15).contains(&self.imsi.len()) || !self.imsi.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidParameter(format!(
                "IMSI must be 6 to 15 digits: {:?}",
                self.imsi
            )));
        }
        if self.mcc.len() != 3 || !self.mcc.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidParameter("MCC must be 3 digits".into()));
        }
        if !(2..=3).contains(&self.mnc.len()) || !self.mnc.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidParameter("MNC must be 2 or 3 digits".into()));
        }
        if !self.imsi.starts_with(&format!("{}{}", self.mcc, self.mnc)) {
            return Err(Error::InvalidParameter(
                "IMSI does not start with MCC and MNC".into(),
            ));
        }
        if self.server.is_unspecified() {
            return Err(Error::InvalidParameter("server address cannot be unspecified".into()));
        }
        if self.ike_proposals.is_empty() {
            return Err(Error::InvalidParameter(
                "At least one IKE proposal required".into(),
            ));
        }
        if self.child_proposals.is_empty() {
            return Err(Error::InvalidParameter(
                "At least one child SA proposal required".into(),
            ));
        }
        if self.step_timeout.is_zero() {
            return Err(Error::InvalidParameter("step timeout must be positive".into()));
        }
        if self.iterations == 0 {
            return Err(Error::InvalidParameter("iterations must be positive".into()));
        }
        if self.reassembly.max_age.is_zero() {
            return Err(Error::InvalidParameter(
                "reassembly max age must be positive".into(),
            ));
        }
        if self.reassembly.max_entries == 0 {
            return Err(Error::InvalidParameter(
                "reassembly table size must be positive".into(),
            ));
        }
        if self.null_padding > 1 {
            return Err(Error::InvalidParameter("null padding must be 0 or 1".into()));
        }
        if let Some(imeisv) = &self.imeisv {
            if imeisv.len() != 16 || !imeisv.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::InvalidParameter("IMEISV must be 16 digits".into()));
            }
        }
        Ok(())
    }

    /// Milenage instance for the configured credentials
    pub fn milenage(&self) -> Milenage {
        match &self.operator_key {
            OperatorKey::Op(op) => Milenage::with_op(&self.ki, op),
            OperatorKey::Opc(opc) => Milenage::with_opc(&self.ki, opc),
        }
    }

    /// MNC padded to three digits
    pub fn mnc3(&self) -> String {
        format!("{:0>3}", self.mnc)
    }

    /// NAI presented as IDi and EAP identity
    ///
    /// The leading `0` marks a permanent identity for EAP-AKA.
    pub fn nai(&self) -> String {
        match self.variant {
            AccessVariant::Nwu => format!(
                "0{}@nai.5gc.mnc{}.mcc{}.3gppnetwork.org",
                self.imsi,
                self.mnc3(),
                self.mcc
            ),
            AccessVariant::Swu => format!(
                "0{}@nai.epc.mnc{}.mcc{}.3gppnetwork.org",
                self.imsi,
                self.mnc3(),
                self.mcc
            ),
        }
    }

    /// Serving network name for 5G key derivation
    pub fn serving_network_name(&self) -> String {
        kdf::serving_network_name(&self.mcc, &self.mnc)
    }
}

/// Default IKE proposals
///
/// AES-CBC-128 / HMAC-SHA1-96 / PRF-HMAC-SHA1 / MODP-2048, then
/// AES-GCM-16-128 / PRF-HMAC-SHA256 / MODP-2048.
pub fn default_ike_proposals() -> Vec<Proposal> {
    vec![
        Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr(EncrAlgorithm::AesCbc { key_len: 16 }))
            .add_transform(Transform::prf(PrfAlgorithm::HmacSha1))
            .add_transform(Transform::integ(IntegAlgorithm::HmacSha1_96))
            .add_transform(Transform::dh(DhGroup::Modp2048)),
        Proposal::new(2, ProtocolId::Ike)
            .add_transform(Transform::encr(EncrAlgorithm::AesGcm {
                key_len: 16,
                icv_len: 16,
            }))
            .add_transform(Transform::prf(PrfAlgorithm::HmacSha256))
            .add_transform(Transform::dh(DhGroup::Modp2048)),
    ]
}

/// Default child SA proposals
///
/// AES-CBC-128 / HMAC-SHA1-96, then AES-GCM-16-128, both without ESN.
pub fn default_child_proposals() -> Vec<Proposal> {
    vec![
        Proposal::new(1, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrAlgorithm::AesCbc { key_len: 16 }))
            .add_transform(Transform::integ(IntegAlgorithm::HmacSha1_96))
            .add_transform(Transform::esn(false)),
        Proposal::new(2, ProtocolId::Esp)
            .add_transform(Transform::encr(EncrAlgorithm::AesGcm {
                key_len: 16,
                icv_len: 16,
            }))
            .add_transform(Transform::esn(false)),
    ]
}

/// Builder for UeConfig
#[derive(Default)]
pub struct UeConfigBuilder {
    variant: Option<AccessVariant>,
    imsi: Option<String>,
    mcc: Option<String>,
    mnc: Option<String>,
    ki: Option<[u8; 16]>,
    operator_key: Option<OperatorKey>,
    server: Option<Ipv4Addr>,
    local: Option<Ipv4Addr>,
    ike_port: Option<u16>,
    nat_port: Option<u16>,
    ike_proposals: Option<Vec<Proposal>>,
    child_proposals: Option<Vec<Proposal>>,
    step_timeout: Option<Duration>,
    retries: Option<u32>,
    iterations: Option<u32>,
    null_padding: Option<usize>,
    fallback_to_default_vector: bool,
    dnn: Option<String>,
    imeisv: Option<String>,
    nssai: Option<Vec<(u8, Option<u32>)>>,
    kdf_input: Option<String>,
    data_path: Option<DataPath>,
    reassembly: Option<ReassemblyLimits>,
    rekey_grace: Option<Duration>,
}

fn parse_key(hex_key: &str, what: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| Error::InvalidParameter(format!("{} is not hex: {}", what, e)))?;
    bytes.as_slice().try_into().map_err(|_| Error::InvalidKeyLength {
        expected: 16,
        actual: bytes.len(),
    })
}

impl UeConfigBuilder {
    /// Create new UE config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set access variant
    pub fn with_variant(mut self, variant: AccessVariant) -> Self {
        self.variant = Some(variant);
        self
    }

    /// Set IMSI; MCC and MNC default to its first 3 and 2 digits
    pub fn with_imsi(mut self, imsi: impl Into<String>) -> Self {
        self.imsi = Some(imsi.into());
        self
    }

    /// Set MCC
    pub fn with_mcc(mut self, mcc: impl Into<String>) -> Self {
        self.mcc = Some(mcc.into());
        self
    }

    /// Set MNC
    pub fn with_mnc(mut self, mnc: impl Into<String>) -> Self {
        self.mnc = Some(mnc.into());
        self
    }

    /// Set Ki
    pub fn with_ki(mut self, ki: [u8; 16]) -> Self {
        self.ki = Some(ki);
        self
    }

    /// Set Ki from hex
    pub fn with_ki_hex(mut self, ki: &str) -> Result<Self> {
        self.ki = Some(parse_key(ki, "Ki")?);
        Ok(self)
    }

    /// Set OP
    pub fn with_op(mut self, op: [u8; 16]) -> Self {
        self.operator_key = Some(OperatorKey::Op(op));
        self
    }

    /// Set OPc
    pub fn with_opc(mut self, opc: [u8; 16]) -> Self {
        self.operator_key = Some(OperatorKey::Opc(opc));
        self
    }

    /// Set OP from hex
    pub fn with_op_hex(mut self, op: &str) -> Result<Self> {
        self.operator_key = Some(OperatorKey::Op(parse_key(op, "OP")?));
        Ok(self)
    }

    /// Set OPc from hex
    pub fn with_opc_hex(mut self, opc: &str) -> Result<Self> {
        self.operator_key = Some(OperatorKey::Opc(parse_key(opc, "OPc")?));
        Ok(self)
    }

    /// Set gateway address
    pub fn with_server(mut self, server: Ipv4Addr) -> Self {
        self.server = Some(server);
        self
    }

    /// Set local bind address
    pub fn with_local(mut self, local: Ipv4Addr) -> Self {
        self.local = Some(local);
        self
    }

    /// Set IKE and NAT-T ports
    pub fn with_ports(mut self, ike_port: u16, nat_port: u16) -> Self {
        self.ike_port = Some(ike_port);
        self.nat_port = Some(nat_port);
        self
    }

    /// Set IKE proposals
    pub fn with_ike_proposals(mut self, proposals: Vec<Proposal>) -> Self {
        self.ike_proposals = Some(proposals);
        self
    }

    /// Set child SA proposals
    pub fn with_child_proposals(mut self, proposals: Vec<Proposal>) -> Self {
        self.child_proposals = Some(proposals);
        self
    }

    /// Set per-request timeout
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    /// Set retransmissions per request
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Set number of establishment attempts
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = Some(iterations);
        self
    }

    /// Set trailing pad octets under ENCR_NULL
    pub fn with_null_padding(mut self, len: usize) -> Self {
        self.null_padding = Some(len);
        self
    }

    /// Fall back to a fixed vector when the provider fails
    pub fn with_default_vector_fallback(mut self, enabled: bool) -> Self {
        self.fallback_to_default_vector = enabled;
        self
    }

    /// Set DNN
    pub fn with_dnn(mut self, dnn: impl Into<String>) -> Self {
        self.dnn = Some(dnn.into());
        self
    }

    /// Set IMEISV
    pub fn with_imeisv(mut self, imeisv: impl Into<String>) -> Self {
        self.imeisv = Some(imeisv.into());
        self
    }

    /// Set requested slices
    pub fn with_nssai(mut self, nssai: Vec<(u8, Option<u32>)>) -> Self {
        self.nssai = Some(nssai);
        self
    }

    /// Override the EAP-AKA' network name
    pub fn with_kdf_input(mut self, name: impl Into<String>) -> Self {
        self.kdf_input = Some(name.into());
        self
    }

    /// Set user plane transport
    pub fn with_data_path(mut self, path: DataPath) -> Self {
        self.data_path = Some(path);
        self
    }

    /// Set reassembly limits
    pub fn with_reassembly(mut self, limits: ReassemblyLimits) -> Self {
        self.reassembly = Some(limits);
        self
    }

    /// Set previous IKE key lifetime after rekey
    pub fn with_rekey_grace(mut self, grace: Duration) -> Self {
        self.rekey_grace = Some(grace);
        self
    }

    /// Build UeConfig with validation
    pub fn build(self) -> Result<UeConfig> {
        let imsi = self
            .imsi
            .ok_or_else(|| Error::InvalidParameter("imsi is required".into()))?;
        let mcc = match self.mcc {
            Some(mcc) => mcc,
            None => imsi.get(..3).unwrap_or_default().to_string(),
        };
        let mnc = match self.mnc {
            Some(mnc) => mnc,
            None => imsi.get(3..5).unwrap_or_default().to_string(),
        };

        let config = UeConfig {
            variant: self.variant.unwrap_or_default(),
            imsi,
            mcc,
            mnc,
            ki: self
                .ki
                .ok_or_else(|| Error::InvalidParameter("ki is required".into()))?,
            operator_key: self
                .operator_key
                .ok_or_else(|| Error::InvalidParameter("op or opc is required".into()))?,
            server: self
                .server
                .ok_or_else(|| Error::InvalidParameter("server is required".into()))?,
            local: self.local.unwrap_or(Ipv4Addr::UNSPECIFIED),
            ike_port: self.ike_port.unwrap_or(IKE_PORT),
            nat_port: self.nat_port.unwrap_or(IKE_NAT_PORT),
            ike_proposals: self.ike_proposals.unwrap_or_else(default_ike_proposals),
            child_proposals: self.child_proposals.unwrap_or_else(default_child_proposals),
            step_timeout: self.step_timeout.unwrap_or(Duration::from_secs(2)),
            retries: self.retries.unwrap_or(2),
            iterations: self.iterations.unwrap_or(3),
            null_padding: self.null_padding.unwrap_or(0),
            fallback_to_default_vector: self.fallback_to_default_vector,
            dnn: self.dnn.unwrap_or_else(|| "internet".to_string()),
            imeisv: self.imeisv,
            nssai: self.nssai.unwrap_or_else(|| vec![(SST_EMBB, None)]),
            kdf_input: self.kdf_input,
            data_path: self.data_path.unwrap_or(DataPath::Udp),
            reassembly: self.reassembly.unwrap_or_default(),
            rekey_grace: self.rekey_grace.unwrap_or(DEFAULT_REKEY_GRACE),
        };

        config.validate()?;
        Ok(config)
    }
}
