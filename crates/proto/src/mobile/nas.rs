//! Minimal 5GS NAS codec and NAS security (TS 24.501, TS 33.501 Annex D)
//!
//! Only the messages a single-PDU-session non-3GPP UE exchanges are
//! understood: registration, authentication, identity, security mode,
//! UL/DL NAS transport and PDU session establishment/release. Everything
//! else decodes to [`NasMessage::Other`] and is passed through untouched.
//!
//! Security protected messages are framed as
//!
//! ```text
//! EPD (0x7e) | security header type | MAC (4) | SQN (1) | message
//! ```
//!
//! where the MAC covers `SQN || message` and `message` is ciphered for
//! header types 2 and 4.

use std::net::{Ipv4Addr, Ipv6Addr};

use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use cmac::{Cmac, Mac};
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ipsec::{Error, Result};
use crate::mobile::kdf::SubscriberKeys;
use crate::mobile::{snow3g, zuc};

/// Extended protocol discriminator: 5GS mobility management
pub const EPD_5GMM: u8 = 0x7e;
/// Extended protocol discriminator: 5GS session management
pub const EPD_5GSM: u8 = 0x2e;

/// Message types (TS 24.501 Section 9.7)
pub mod msg {
    /// Registration request
    pub const REGISTRATION_REQUEST: u8 = 0x41;
    /// Registration accept
    pub const REGISTRATION_ACCEPT: u8 = 0x42;
    /// Registration complete
    pub const REGISTRATION_COMPLETE: u8 = 0x43;
    /// Registration reject
    pub const REGISTRATION_REJECT: u8 = 0x44;
    /// Deregistration request (UE terminated)
    pub const DEREGISTRATION_REQUEST_UE_TERMINATED: u8 = 0x47;
    /// Authentication request
    pub const AUTHENTICATION_REQUEST: u8 = 0x56;
    /// Authentication response
    pub const AUTHENTICATION_RESPONSE: u8 = 0x57;
    /// Authentication reject
    pub const AUTHENTICATION_REJECT: u8 = 0x58;
    /// Authentication failure
    pub const AUTHENTICATION_FAILURE: u8 = 0x59;
    /// Authentication result
    pub const AUTHENTICATION_RESULT: u8 = 0x5a;
    /// Identity request
    pub const IDENTITY_REQUEST: u8 = 0x5b;
    /// Identity response
    pub const IDENTITY_RESPONSE: u8 = 0x5c;
    /// Security mode command
    pub const SECURITY_MODE_COMMAND: u8 = 0x5d;
    /// Security mode complete
    pub const SECURITY_MODE_COMPLETE: u8 = 0x5e;
    /// Security mode reject
    pub const SECURITY_MODE_REJECT: u8 = 0x5f;
    /// UL NAS transport
    pub const UL_NAS_TRANSPORT: u8 = 0x67;
    /// DL NAS transport
    pub const DL_NAS_TRANSPORT: u8 = 0x68;
    /// PDU session establishment request
    pub const PDU_SESSION_ESTABLISHMENT_REQUEST: u8 = 0xc1;
    /// PDU session establishment accept
    pub const PDU_SESSION_ESTABLISHMENT_ACCEPT: u8 = 0xc2;
    /// PDU session establishment reject
    pub const PDU_SESSION_ESTABLISHMENT_REJECT: u8 = 0xc3;
    /// PDU session release request
    pub const PDU_SESSION_RELEASE_REQUEST: u8 = 0xd1;
    /// PDU session release command
    pub const PDU_SESSION_RELEASE_COMMAND: u8 = 0xd3;
}

/// Security header types
pub mod sec_header {
    /// Plain NAS message
    pub const PLAIN: u8 = 0;
    /// Integrity protected
    pub const INTEGRITY_PROTECTED: u8 = 1;
    /// Integrity protected and ciphered
    pub const INTEGRITY_PROTECTED_AND_CIPHERED: u8 = 2;
    /// Integrity protected with new 5G NAS security context
    pub const INTEGRITY_PROTECTED_NEW_CONTEXT: u8 = 3;
    /// Integrity protected and ciphered with new 5G NAS security context
    pub const INTEGRITY_PROTECTED_AND_CIPHERED_NEW_CONTEXT: u8 = 4;
}

/// 5GMM cause #21 synch failure
pub const CAUSE_SYNCH_FAILURE: u8 = 21;
/// 5GSM cause #36 regular deactivation
pub const CAUSE_REGULAR_DEACTIVATION: u8 = 36;

/// Type of identity: SUCI
pub const IDENTITY_TYPE_SUCI: u8 = 1;
/// Type of identity: 5G-GUTI
pub const IDENTITY_TYPE_GUTI: u8 = 2;
/// Type of identity: IMEISV
pub const IDENTITY_TYPE_IMEISV: u8 = 5;

/// Registration type: initial registration, follow-on request pending
pub const REGISTRATION_INITIAL_FOR: u8 = 0x09;
/// ngKSI value "no key available"
pub const NGKSI_NONE: u8 = 7;

/// Payload container type: N1 SM information
pub const PAYLOAD_CONTAINER_N1_SM: u8 = 1;
/// Request type: initial request
pub const REQUEST_TYPE_INITIAL: u8 = 1;
/// Request type: existing PDU session (handover)
pub const REQUEST_TYPE_EXISTING: u8 = 2;

/// PDU session type IPv4
pub const PDU_SESSION_TYPE_IPV4: u8 = 1;
/// PDU session type IPv6
pub const PDU_SESSION_TYPE_IPV6: u8 = 2;
/// PDU session type IPv4v6
pub const PDU_SESSION_TYPE_IPV4V6: u8 = 3;

/// PCO container: DNS server IPv6 address request
pub const PCO_DNS_IPV6: u16 = 0x0003;
/// PCO container: DNS server IPv4 address request
pub const PCO_DNS_IPV4: u16 = 0x000d;

/// SST for enhanced mobile broadband
pub const SST_EMBB: u8 = 1;

/// NAS bearer (connection identifier) used for non-3GPP access
pub const NAS_BEARER_NON_3GPP: u8 = 0x02;
/// Uplink direction bit
pub const DIRECTION_UPLINK: u8 = 0;
/// Downlink direction bit
pub const DIRECTION_DOWNLINK: u8 = 1;

fn digit(c: u8) -> Result<u8> {
    if c.is_ascii_digit() {
        Ok(c - b'0')
    } else {
        Err(Error::InvalidParameter(format!(
            "Non-digit '{}' in identity",
            c as char
        )))
    }
}

/// PLMN identity in BCD, MCC2|MCC1, MNC3|MCC3, MNC2|MNC1
///
/// A two-digit MNC puts 0xF in the MNC3 nibble.
pub fn plmn_bytes(mcc: &str, mnc: &str) -> Result<[u8; 3]> {
    let mcc = mcc.as_bytes();
    let mnc = mnc.as_bytes();
    if mcc.len() != 3 || !(2..=3).contains(&mnc.len()) {
        return Err(Error::InvalidParameter(format!(
            "MCC/MNC must have 3 and 2-3 digits, got {} and {}",
            mcc.len(),
            mnc.len()
        )));
    }
    let mnc3 = if mnc.len() == 3 { digit(mnc[2])? } else { 0x0f };
    Ok([
        (digit(mcc[1])? << 4) | digit(mcc[0])?,
        (mnc3 << 4) | digit(mcc[2])?,
        (digit(mnc[1])? << 4) | digit(mnc[0])?,
    ])
}

/// Swapped-nibble BCD, padded with 0xF
fn bcd(digits: &str) -> Result<Vec<u8>> {
    let raw = digits.as_bytes();
    let mut out = Vec::with_capacity(raw.len().div_ceil(2));
    for pair in raw.chunks(2) {
        let low = digit(pair[0])?;
        let high = match pair.get(1) {
            Some(c) => digit(*c)?,
            None => 0x0f,
        };
        out.push((high << 4) | low);
    }
    Ok(out)
}

fn push_lv_e(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn push_tlv(out: &mut Vec<u8>, iei: u8, value: &[u8]) {
    out.push(iei);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

fn push_tlv_e(out: &mut Vec<u8>, iei: u8, value: &[u8]) {
    out.push(iei);
    push_lv_e(out, value);
}

/// 5GS mobile identity: SUCI with null protection scheme
///
/// Routing indicator 0, home network public key identifier 0.
pub fn suci_null_scheme(mcc: &str, mnc: &str, imsi: &str) -> Result<Vec<u8>> {
    let msin = imsi
        .get(mcc.len() + mnc.len()..)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::InvalidParameter("IMSI shorter than MCC+MNC".into()))?;
    let mut suci = vec![IDENTITY_TYPE_SUCI];
    suci.extend_from_slice(&plmn_bytes(mcc, mnc)?);
    suci.extend_from_slice(&[0xf0, 0xff, 0x00, 0x00]);
    suci.extend_from_slice(&bcd(msin)?);
    Ok(suci)
}

/// 5GS mobile identity: IMEISV (16 digits) or IMEI (15 digits)
pub fn imeisv_identity(digits: &str) -> Result<Vec<u8>> {
    let raw = digits.as_bytes();
    let first = digit(
        *raw.first()
            .ok_or_else(|| Error::InvalidParameter("Empty IMEISV".into()))?,
    )?;
    let odd = if raw.len() % 2 == 1 { 0x08 } else { 0x00 };
    let mut out = vec![(first << 4) | odd | IDENTITY_TYPE_IMEISV];
    out.extend_from_slice(&bcd(&digits[1..])?);
    Ok(out)
}

/// S-NSSAI value (SST with optional SD)
pub fn s_nssai(sst: u8, sd: Option<u32>) -> Vec<u8> {
    let mut out = vec![sst];
    if let Some(sd) = sd {
        out.extend_from_slice(&sd.to_be_bytes()[1..]);
    }
    out
}

/// DNN in length-prefixed label form
pub fn dnn(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 1);
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out
}

/// Extended PCO asking for DNS servers of the session's address family
pub fn pco_dns_request(session_type: u8) -> Vec<u8> {
    let mut out = vec![0x80];
    let ids: &[u16] = match session_type {
        PDU_SESSION_TYPE_IPV6 => &[PCO_DNS_IPV6],
        PDU_SESSION_TYPE_IPV4V6 => &[PCO_DNS_IPV4, PCO_DNS_IPV6],
        _ => &[PCO_DNS_IPV4],
    };
    for id in ids {
        out.extend_from_slice(&id.to_be_bytes());
        out.push(0);
    }
    out
}

/// Registration request carrying a null-scheme SUCI
pub fn registration_request(mcc: &str, mnc: &str, imsi: &str) -> Result<Vec<u8>> {
    let mut out = vec![
        EPD_5GMM,
        sec_header::PLAIN,
        msg::REGISTRATION_REQUEST,
        (NGKSI_NONE << 4) | REGISTRATION_INITIAL_FOR,
    ];
    push_lv_e(&mut out, &suci_null_scheme(mcc, mnc, imsi)?);
    // 5GMM capability
    push_tlv(&mut out, 0x10, &[0x06]);
    // UE security capability: 5G-EA0..EA3, 128-5G-IA1..IA3
    push_tlv(&mut out, 0x2e, &[0xf0, 0x70]);
    Ok(out)
}

/// Authentication response with RES* (5G-AKA) or an EAP message (EAP-AKA')
pub fn authentication_response(res_star: Option<&[u8]>, eap: Option<&[u8]>) -> Vec<u8> {
    let mut out = vec![EPD_5GMM, sec_header::PLAIN, msg::AUTHENTICATION_RESPONSE];
    if let Some(res) = res_star {
        push_tlv(&mut out, 0x2d, res);
    }
    if let Some(eap) = eap {
        push_tlv_e(&mut out, 0x78, eap);
    }
    out
}

/// Authentication failure with a 5GMM cause and optional AUTS
pub fn authentication_failure(cause: u8, auts: Option<&[u8]>) -> Vec<u8> {
    let mut out = vec![
        EPD_5GMM,
        sec_header::PLAIN,
        msg::AUTHENTICATION_FAILURE,
        cause,
    ];
    if let Some(auts) = auts {
        push_tlv(&mut out, 0x30, auts);
    }
    out
}

/// Identity response carrying the SUCI
pub fn identity_response(mcc: &str, mnc: &str, imsi: &str) -> Result<Vec<u8>> {
    let mut out = vec![EPD_5GMM, sec_header::PLAIN, msg::IDENTITY_RESPONSE];
    push_lv_e(&mut out, &suci_null_scheme(mcc, mnc, imsi)?);
    Ok(out)
}

/// Security mode complete, optionally with IMEISV and the initial NAS message
pub fn security_mode_complete(imeisv: Option<&str>, nas_container: Option<&[u8]>) -> Result<Vec<u8>> {
    let mut out = vec![EPD_5GMM, sec_header::PLAIN, msg::SECURITY_MODE_COMPLETE];
    if let Some(imeisv) = imeisv {
        push_tlv_e(&mut out, 0x77, &imeisv_identity(imeisv)?);
    }
    if let Some(nas) = nas_container {
        push_tlv_e(&mut out, 0x71, nas);
    }
    Ok(out)
}

/// Registration complete
pub fn registration_complete() -> Vec<u8> {
    vec![EPD_5GMM, sec_header::PLAIN, msg::REGISTRATION_COMPLETE]
}

/// PDU session establishment request (IPv4, full-rate integrity, DNS request)
pub fn pdu_session_establishment_request(pdu_session_id: u8, pti: u8, session_type: u8) -> Vec<u8> {
    let mut out = vec![
        EPD_5GSM,
        pdu_session_id,
        pti,
        msg::PDU_SESSION_ESTABLISHMENT_REQUEST,
        0xff,
        0xff,
        0x90 | (session_type & 0x07),
    ];
    push_tlv_e(&mut out, 0x7b, &pco_dns_request(session_type));
    out
}

/// PDU session release request with 5GSM cause
pub fn pdu_session_release_request(pdu_session_id: u8, pti: u8, cause: u8) -> Vec<u8> {
    vec![
        EPD_5GSM,
        pdu_session_id,
        pti,
        msg::PDU_SESSION_RELEASE_REQUEST,
        0x59,
        cause,
    ]
}

/// UL NAS transport of an N1 SM message
pub fn ul_nas_transport(
    payload: &[u8],
    pdu_session_id: u8,
    request_type: Option<u8>,
    s_nssai: Option<&[u8]>,
    dnn: Option<&[u8]>,
) -> Vec<u8> {
    let mut out = vec![
        EPD_5GMM,
        sec_header::PLAIN,
        msg::UL_NAS_TRANSPORT,
        PAYLOAD_CONTAINER_N1_SM,
    ];
    push_lv_e(&mut out, payload);
    out.push(0x12);
    out.push(pdu_session_id);
    if let Some(rt) = request_type {
        out.push(0x80 | (rt & 0x07));
    }
    if let Some(s) = s_nssai {
        push_tlv(&mut out, 0x22, s);
    }
    if let Some(d) = dnn {
        push_tlv(&mut out, 0x25, d);
    }
    out
}

/// Cursor over a NAS message body
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let out = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(Error::BufferTooShort {
                required: self.pos + n,
                available: self.data.len(),
            })?;
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn lv(&mut self) -> Result<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    fn lv_e(&mut self) -> Result<&'a [u8]> {
        let raw = self.take(2)?;
        let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
        self.take(len)
    }

    /// Walk the optional IEs, returning (IEI, value) pairs
    ///
    /// IEIs `0x70..=0x7f` are TLV-E, IEIs with the top bit set are
    /// half-byte TV (IEI in the high nibble), and `fixed` lists TV
    /// IEIs with a fixed value length. Everything else is TLV.
    fn optional_ies(&mut self, fixed: &[(u8, usize)]) -> Result<Vec<(u8, &'a [u8])>> {
        let mut ies = Vec::new();
        while self.remaining() > 0 {
            let iei = self.u8()?;
            if let Some((_, len)) = fixed.iter().find(|(t, _)| *t == iei) {
                ies.push((iei, self.take(*len)?));
            } else if iei & 0x80 != 0 {
                ies.push((iei >> 4, &self.data[self.pos - 1..self.pos]));
            } else if (0x70..=0x7f).contains(&iei) {
                ies.push((iei, self.lv_e()?));
            } else {
                ies.push((iei, self.lv()?));
            }
        }
        Ok(ies)
    }
}

fn find<'a>(ies: &[(u8, &'a [u8])], iei: u8) -> Option<&'a [u8]> {
    ies.iter().find(|(t, _)| *t == iei).map(|(_, v)| *v)
}

/// Decoded 5G-GUTI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guti {
    /// PLMN identity (BCD)
    pub plmn: [u8; 3],
    /// AMF region ID
    pub amf_region_id: u8,
    /// AMF set ID (10 bits)
    pub amf_set_id: u16,
    /// AMF pointer (6 bits)
    pub amf_pointer: u8,
    /// 5G-TMSI
    pub tmsi: u32,
}

impl Guti {
    /// Parse a 5GS mobile identity of type 5G-GUTI
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 11 || data[0] & 0x07 != IDENTITY_TYPE_GUTI {
            return Err(Error::InvalidNas("Not a 5G-GUTI mobile identity".into()));
        }
        Ok(Guti {
            plmn: [data[1], data[2], data[3]],
            amf_region_id: data[4],
            amf_set_id: (u16::from(data[5]) << 2) | u16::from(data[6] >> 6),
            amf_pointer: data[6] & 0x3f,
            tmsi: u32::from_be_bytes([data[7], data[8], data[9], data[10]]),
        })
    }
}

/// Authentication request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationRequest {
    /// ngKSI (low nibble)
    pub ngksi: u8,
    /// ABBA
    pub abba: Vec<u8>,
    /// RAND for 5G-AKA
    pub rand: Option<[u8; 16]>,
    /// AUTN for 5G-AKA
    pub autn: Option<[u8; 16]>,
    /// EAP message for EAP-AKA'
    pub eap: Option<Vec<u8>>,
}

/// Security mode command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityModeCommand {
    /// Selected ciphering algorithm (high nibble of the algorithms octet)
    pub ciphering: u8,
    /// Selected integrity algorithm (low nibble)
    pub integrity: u8,
    /// ngKSI
    pub ngksi: u8,
    /// Replayed UE security capabilities
    pub replayed_capabilities: Vec<u8>,
    /// IMEISV requested
    pub imeisv_requested: bool,
    /// Retransmission of the initial NAS message requested
    pub retransmit_initial_nas: bool,
    /// EAP message (EAP-Success for EAP-AKA')
    pub eap: Option<Vec<u8>>,
}

/// Registration accept
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationAccept {
    /// 5GS registration result
    pub result: Vec<u8>,
    /// Assigned 5G-GUTI
    pub guti: Option<Guti>,
}

/// DL NAS transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlNasTransport {
    /// Payload container type
    pub container_type: u8,
    /// Payload container
    pub payload: Vec<u8>,
    /// PDU session identity
    pub pdu_session_id: Option<u8>,
}

/// PDU session establishment accept
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PduSessionAccept {
    /// PDU session identity
    pub pdu_session_id: u8,
    /// Procedure transaction identity
    pub pti: u8,
    /// Selected PDU session type
    pub session_type: u8,
    /// Allocated IPv4 address
    pub ipv4: Option<Ipv4Addr>,
    /// Allocated IPv6 interface identifier
    pub ipv6_iid: Option<[u8; 8]>,
    /// DNS servers (IPv4)
    pub dns_v4: Vec<Ipv4Addr>,
    /// DNS servers (IPv6)
    pub dns_v6: Vec<Ipv6Addr>,
}

/// Plain NAS message, decoded as far as the UE needs it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasMessage {
    /// Authentication request
    AuthenticationRequest(AuthenticationRequest),
    /// Authentication reject
    AuthenticationReject,
    /// Identity request with the requested identity type
    IdentityRequest(u8),
    /// Security mode command
    SecurityModeCommand(SecurityModeCommand),
    /// Registration accept
    RegistrationAccept(RegistrationAccept),
    /// Registration reject with 5GMM cause
    RegistrationReject(u8),
    /// DL NAS transport
    DlNasTransport(DlNasTransport),
    /// PDU session establishment accept
    PduSessionAccept(PduSessionAccept),
    /// PDU session establishment reject with 5GSM cause
    PduSessionReject(u8),
    /// PDU session release command with 5GSM cause
    PduSessionReleaseCommand(u8),
    /// Anything else
    Other {
        /// Extended protocol discriminator
        epd: u8,
        /// Message type
        message_type: u8,
    },
}

impl NasMessage {
    /// Decode a plain (security header type 0) 5GMM or 5GSM message
    pub fn decode(pdu: &[u8]) -> Result<Self> {
        let mut r = Reader::new(pdu);
        let epd = r.u8()?;
        match epd {
            EPD_5GMM => {
                let header = r.u8()? & 0x0f;
                if header != sec_header::PLAIN {
                    return Err(Error::InvalidNas(format!(
                        "Security protected message (header type {}) passed to plain decoder",
                        header
                    )));
                }
                let message_type = r.u8()?;
                decode_mm(message_type, &mut r)
            }
            EPD_5GSM => {
                let pdu_session_id = r.u8()?;
                let pti = r.u8()?;
                let message_type = r.u8()?;
                decode_sm(pdu_session_id, pti, message_type, &mut r)
            }
            other => Err(Error::InvalidNas(format!(
                "Unknown protocol discriminator 0x{:02x}",
                other
            ))),
        }
    }

    /// Message type for logging
    pub fn name(&self) -> &'static str {
        match self {
            NasMessage::AuthenticationRequest(_) => "AUTHENTICATION_REQUEST",
            NasMessage::AuthenticationReject => "AUTHENTICATION_REJECT",
            NasMessage::IdentityRequest(_) => "IDENTITY_REQUEST",
            NasMessage::SecurityModeCommand(_) => "SECURITY_MODE_COMMAND",
            NasMessage::RegistrationAccept(_) => "REGISTRATION_ACCEPT",
            NasMessage::RegistrationReject(_) => "REGISTRATION_REJECT",
            NasMessage::DlNasTransport(_) => "DL_NAS_TRANSPORT",
            NasMessage::PduSessionAccept(_) => "PDU_SESSION_ESTABLISHMENT_ACCEPT",
            NasMessage::PduSessionReject(_) => "PDU_SESSION_ESTABLISHMENT_REJECT",
            NasMessage::PduSessionReleaseCommand(_) => "PDU_SESSION_RELEASE_COMMAND",
            NasMessage::Other { .. } => "OTHER",
        }
    }
}

fn array16(v: &[u8]) -> Result<[u8; 16]> {
    v.try_into().map_err(|_| Error::InvalidLength {
        expected: 16,
        actual: v.len(),
    })
}

fn decode_mm(message_type: u8, r: &mut Reader<'_>) -> Result<NasMessage> {
    let message = match message_type {
        msg::AUTHENTICATION_REQUEST => {
            let ngksi = r.u8()? & 0x0f;
            let abba = r.lv()?.to_vec();
            let ies = r.optional_ies(&[(0x21, 16)])?;
            NasMessage::AuthenticationRequest(AuthenticationRequest {
                ngksi,
                abba,
                rand: find(&ies, 0x21).map(array16).transpose()?,
                autn: find(&ies, 0x20).map(array16).transpose()?,
                eap: find(&ies, 0x78).map(<[u8]>::to_vec),
            })
        }
        msg::AUTHENTICATION_REJECT => NasMessage::AuthenticationReject,
        msg::IDENTITY_REQUEST => NasMessage::IdentityRequest(r.u8()? & 0x07),
        msg::SECURITY_MODE_COMMAND => {
            let algorithms = r.u8()?;
            let ngksi = r.u8()? & 0x0f;
            let replayed_capabilities = r.lv()?.to_vec();
            let ies = r.optional_ies(&[(0x57, 1)])?;
            let imeisv_requested = find(&ies, 0x0e).map_or(false, |v| v[0] & 0x07 == 1);
            let retransmit_initial_nas = find(&ies, 0x36)
                .and_then(|v| v.first())
                .map_or(false, |b| b & 0x01 == 1);
            NasMessage::SecurityModeCommand(SecurityModeCommand {
                ciphering: algorithms >> 4,
                integrity: algorithms & 0x0f,
                ngksi,
                replayed_capabilities,
                imeisv_requested,
                retransmit_initial_nas,
                eap: find(&ies, 0x78).map(<[u8]>::to_vec),
            })
        }
        msg::REGISTRATION_ACCEPT => {
            let result = r.lv()?.to_vec();
            let ies = r.optional_ies(&[])?;
            let guti = find(&ies, 0x77).map(Guti::parse).transpose()?;
            NasMessage::RegistrationAccept(RegistrationAccept { result, guti })
        }
        msg::REGISTRATION_REJECT => NasMessage::RegistrationReject(r.u8()?),
        msg::DL_NAS_TRANSPORT => {
            let container_type = r.u8()? & 0x0f;
            let payload = r.lv_e()?.to_vec();
            let ies = r.optional_ies(&[(0x12, 1), (0x58, 1)])?;
            NasMessage::DlNasTransport(DlNasTransport {
                container_type,
                payload,
                pdu_session_id: find(&ies, 0x12).map(|v| v[0]),
            })
        }
        other => NasMessage::Other {
            epd: EPD_5GMM,
            message_type: other,
        },
    };
    Ok(message)
}

fn decode_sm(pdu_session_id: u8, pti: u8, message_type: u8, r: &mut Reader<'_>) -> Result<NasMessage> {
    let message = match message_type {
        msg::PDU_SESSION_ESTABLISHMENT_ACCEPT => {
            let first = r.u8()?;
            let _qos_rules = r.lv_e()?;
            let _ambr = r.lv()?;
            let ies = r.optional_ies(&[(0x59, 1), (0x56, 1)])?;

            let mut accept = PduSessionAccept {
                pdu_session_id,
                pti,
                session_type: first & 0x07,
                ..Default::default()
            };
            if let Some(addr) = find(&ies, 0x29) {
                parse_pdu_address(addr, &mut accept)?;
            }
            if let Some(epco) = find(&ies, 0x7b) {
                parse_pco_dns(epco, &mut accept);
            }
            NasMessage::PduSessionAccept(accept)
        }
        msg::PDU_SESSION_ESTABLISHMENT_REJECT => NasMessage::PduSessionReject(r.u8()?),
        msg::PDU_SESSION_RELEASE_COMMAND => NasMessage::PduSessionReleaseCommand(r.u8()?),
        other => NasMessage::Other {
            epd: EPD_5GSM,
            message_type: other,
        },
    };
    Ok(message)
}

fn parse_pdu_address(addr: &[u8], accept: &mut PduSessionAccept) -> Result<()> {
    let short = || Error::InvalidNas("Truncated PDU address".into());
    let kind = *addr.first().ok_or_else(short)? & 0x07;
    let ipv4_at = |offset: usize| -> Result<Ipv4Addr> {
        let b = addr.get(offset..offset + 4).ok_or_else(short)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    };
    let iid = || -> Result<[u8; 8]> {
        let b = addr.get(1..9).ok_or_else(short)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(b);
        Ok(out)
    };
    match kind {
        PDU_SESSION_TYPE_IPV4 => accept.ipv4 = Some(ipv4_at(1)?),
        PDU_SESSION_TYPE_IPV6 => accept.ipv6_iid = Some(iid()?),
        PDU_SESSION_TYPE_IPV4V6 => {
            accept.ipv6_iid = Some(iid()?);
            accept.ipv4 = Some(ipv4_at(9)?);
        }
        _ => {}
    }
    Ok(())
}

fn parse_pco_dns(epco: &[u8], accept: &mut PduSessionAccept) {
    let mut pos = 1;
    while pos + 3 <= epco.len() {
        let id = u16::from_be_bytes([epco[pos], epco[pos + 1]]);
        let len = epco[pos + 2] as usize;
        let Some(value) = epco.get(pos + 3..pos + 3 + len) else {
            break;
        };
        match (id, len) {
            (PCO_DNS_IPV4, 4) => accept
                .dns_v4
                .push(Ipv4Addr::new(value[0], value[1], value[2], value[3])),
            (PCO_DNS_IPV6, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(value);
                accept.dns_v6.push(Ipv6Addr::from(octets));
            }
            _ => {}
        }
        pos += 3 + len;
    }
}

/// Outer framing of a security protected 5GMM message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecuredNas {
    /// Security header type
    pub header_type: u8,
    /// Message authentication code
    pub mac: [u8; 4],
    /// Sequence number (low 8 bits of NAS COUNT)
    pub sqn: u8,
    /// Inner message, possibly ciphered
    pub message: Vec<u8>,
}

impl SecuredNas {
    /// Security header type of any 5GMM PDU
    pub fn header_type(pdu: &[u8]) -> Option<u8> {
        match pdu {
            [EPD_5GMM, header, ..] => Some(header & 0x0f),
            _ => None,
        }
    }

    /// Parse a protected PDU (header type 1..4)
    pub fn parse(pdu: &[u8]) -> Result<Self> {
        let mut r = Reader::new(pdu);
        if r.u8()? != EPD_5GMM {
            return Err(Error::InvalidNas("Protected NAS must be 5GMM".into()));
        }
        let header_type = r.u8()? & 0x0f;
        if header_type == sec_header::PLAIN {
            return Err(Error::InvalidNas("NAS message is not protected".into()));
        }
        let mut mac = [0u8; 4];
        mac.copy_from_slice(r.take(4)?);
        let sqn = r.u8()?;
        let message = r.take(r.remaining())?.to_vec();
        Ok(SecuredNas {
            header_type,
            mac,
            sqn,
            message,
        })
    }

    /// Whether the inner message is ciphered
    pub fn is_ciphered(&self) -> bool {
        matches!(
            self.header_type,
            sec_header::INTEGRITY_PROTECTED_AND_CIPHERED
                | sec_header::INTEGRITY_PROTECTED_AND_CIPHERED_NEW_CONTEXT
        )
    }

    /// Serialize
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(7 + self.message.len());
        out.push(EPD_5GMM);
        out.push(self.header_type);
        out.extend_from_slice(&self.mac);
        out.push(self.sqn);
        out.extend_from_slice(&self.message);
        out
    }
}

/// 24-bit NAS COUNT (overflow counter and sequence number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NasCount(u32);

impl NasCount {
    /// Largest representable COUNT
    pub const MAX: u32 = 0x00ff_ffff;

    /// COUNT with a given value, truncated to 24 bits
    pub fn new(value: u32) -> Self {
        NasCount(value & Self::MAX)
    }

    /// Numeric value
    pub fn value(self) -> u32 {
        self.0
    }

    /// Sequence number (low 8 bits)
    pub fn sqn(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// Next value, wrapping from 2^24 - 1 to 0
    pub fn next(self) -> Self {
        if self.0 == Self::MAX {
            NasCount(0)
        } else {
            NasCount(self.0 + 1)
        }
    }

    /// COUNT implied by a received SQN, bumping the overflow when SQN wrapped
    pub fn estimate(self, sqn: u8) -> Self {
        let overflow = self.0 >> 8;
        let overflow = if sqn < self.sqn() { overflow + 1 } else { overflow };
        NasCount::new((overflow << 8) | u32::from(sqn))
    }
}

/// NAS integrity algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NasIntegrity {
    /// 5G-IA0 (null)
    Nia0,
    /// 128-5G-IA1 (SNOW 3G)
    Nia1,
    /// 128-5G-IA2 (AES-CMAC)
    Nia2,
    /// 128-5G-IA3 (ZUC)
    Nia3,
}

/// NAS ciphering algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NasCiphering {
    /// 5G-EA0 (null)
    Nea0,
    /// 128-5G-EA1 (SNOW 3G)
    Nea1,
    /// 128-5G-EA2 (AES-CTR)
    Nea2,
    /// 128-5G-EA3 (ZUC)
    Nea3,
}

impl NasIntegrity {
    /// Map a type-of-integrity-protection identifier
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(NasIntegrity::Nia0),
            1 => Ok(NasIntegrity::Nia1),
            2 => Ok(NasIntegrity::Nia2),
            3 => Ok(NasIntegrity::Nia3),
            other => Err(Error::UnsupportedAlgorithm(format!("5G-IA{}", other))),
        }
    }

    /// Algorithm identifier
    pub fn id(self) -> u8 {
        match self {
            NasIntegrity::Nia0 => 0,
            NasIntegrity::Nia1 => 1,
            NasIntegrity::Nia2 => 2,
            NasIntegrity::Nia3 => 3,
        }
    }
}

impl NasCiphering {
    /// Map a type-of-ciphering-algorithm identifier
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(NasCiphering::Nea0),
            1 => Ok(NasCiphering::Nea1),
            2 => Ok(NasCiphering::Nea2),
            3 => Ok(NasCiphering::Nea3),
            other => Err(Error::UnsupportedAlgorithm(format!("5G-EA{}", other))),
        }
    }

    /// Algorithm identifier
    pub fn id(self) -> u8 {
        match self {
            NasCiphering::Nea0 => 0,
            NasCiphering::Nea1 => 1,
            NasCiphering::Nea2 => 2,
            NasCiphering::Nea3 => 3,
        }
    }
}

fn key128(key: &[u8]) -> Result<&[u8; 16]> {
    key.try_into().map_err(|_| Error::InvalidKeyLength {
        expected: 16,
        actual: key.len(),
    })
}

fn count_block(count: u32, bearer: u8, direction: u8) -> [u8; 8] {
    let mut block = [0u8; 8];
    block[..4].copy_from_slice(&count.to_be_bytes());
    block[4] = ((bearer & 0x1f) << 3) | ((direction & 0x01) << 2);
    block
}

/// 128-NIA2: first 32 bits of AES-CMAC over COUNT|BEARER|DIRECTION|0^26|message
pub fn nia2(key: &[u8], count: u32, bearer: u8, direction: u8, message: &[u8]) -> Result<[u8; 4]> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key).map_err(|_| Error::InvalidKeyLength {
        expected: 16,
        actual: key.len(),
    })?;
    mac.update(&count_block(count, bearer, direction));
    mac.update(message);
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 4];
    out.copy_from_slice(&tag[..4]);
    Ok(out)
}

/// 128-NEA2: AES-CTR keystream starting at COUNT|BEARER|DIRECTION|0^90
pub fn nea2(key: &[u8], count: u32, bearer: u8, direction: u8, data: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&count_block(count, bearer, direction));
    let mut cipher = ctr::Ctr128BE::<Aes128>::new_from_slices(key, &iv).map_err(|_| {
        Error::InvalidKeyLength {
            expected: 16,
            actual: key.len(),
        }
    })?;
    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}

/// 128-NIA1: SNOW 3G f9 with FRESH = BEARER << 27
pub fn nia1(key: &[u8], count: u32, bearer: u8, direction: u8, message: &[u8]) -> Result<[u8; 4]> {
    let fresh = u32::from(bearer & 0x1f) << 27;
    Ok(snow3g::f9(key128(key)?, count, fresh, direction, message, message.len() as u64 * 8))
}

/// 128-NEA1: SNOW 3G f8
pub fn nea1(key: &[u8], count: u32, bearer: u8, direction: u8, data: &[u8]) -> Result<Vec<u8>> {
    Ok(snow3g::f8(key128(key)?, count, bearer, direction, data, data.len() * 8))
}

/// 128-NIA3: ZUC based EIA3
pub fn nia3(key: &[u8], count: u32, bearer: u8, direction: u8, message: &[u8]) -> Result<[u8; 4]> {
    Ok(zuc::eia3(key128(key)?, count, bearer, direction, message, message.len() * 8))
}

/// 128-NEA3: ZUC based EEA3
pub fn nea3(key: &[u8], count: u32, bearer: u8, direction: u8, data: &[u8]) -> Result<Vec<u8>> {
    Ok(zuc::eea3(key128(key)?, count, bearer, direction, data, data.len() * 8))
}

/// NAS security context for the non-3GPP signalling connection
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct NasSecurityContext {
    #[zeroize(skip)]
    integrity: NasIntegrity,
    #[zeroize(skip)]
    ciphering: NasCiphering,
    int_key: [u8; 16],
    enc_key: [u8; 16],
    #[zeroize(skip)]
    uplink: NasCount,
    #[zeroize(skip)]
    downlink: NasCount,
    #[zeroize(skip)]
    downlink_seen: bool,
}

impl std::fmt::Debug for NasSecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NasSecurityContext")
            .field("integrity", &self.integrity)
            .field("ciphering", &self.ciphering)
            .field("uplink", &self.uplink)
            .field("downlink", &self.downlink)
            .finish()
    }
}

impl NasSecurityContext {
    /// Context for the algorithms selected by a security mode command
    pub fn new(keys: &SubscriberKeys, integrity: u8, ciphering: u8) -> Result<Self> {
        let integrity_alg = NasIntegrity::from_id(integrity)?;
        let ciphering_alg = NasCiphering::from_id(ciphering)?;
        Ok(NasSecurityContext {
            integrity: integrity_alg,
            ciphering: ciphering_alg,
            int_key: keys.nas_int[integrity as usize],
            enc_key: keys.nas_enc[ciphering as usize],
            uplink: NasCount::default(),
            downlink: NasCount::default(),
            downlink_seen: false,
        })
    }

    /// Selected integrity algorithm
    pub fn integrity(&self) -> NasIntegrity {
        self.integrity
    }

    /// Selected ciphering algorithm
    pub fn ciphering(&self) -> NasCiphering {
        self.ciphering
    }

    /// Next uplink COUNT to be used
    pub fn uplink_count(&self) -> NasCount {
        self.uplink
    }

    /// Last accepted downlink COUNT
    pub fn downlink_count(&self) -> NasCount {
        self.downlink
    }

    fn mac(&self, count: u32, direction: u8, sqn: u8, message: &[u8]) -> Result<[u8; 4]> {
        let algorithm: fn(&[u8], u32, u8, u8, &[u8]) -> Result<[u8; 4]> = match self.integrity {
            NasIntegrity::Nia0 => return Ok([0; 4]),
            NasIntegrity::Nia1 => nia1,
            NasIntegrity::Nia2 => nia2,
            NasIntegrity::Nia3 => nia3,
        };
        let mut input = Vec::with_capacity(1 + message.len());
        input.push(sqn);
        input.extend_from_slice(message);
        algorithm(&self.int_key, count, NAS_BEARER_NON_3GPP, direction, &input)
    }

    fn cipher(&self, count: u32, direction: u8, data: &[u8]) -> Result<Vec<u8>> {
        match self.ciphering {
            NasCiphering::Nea0 => Ok(data.to_vec()),
            NasCiphering::Nea1 => nea1(&self.enc_key, count, NAS_BEARER_NON_3GPP, direction, data),
            NasCiphering::Nea2 => nea2(&self.enc_key, count, NAS_BEARER_NON_3GPP, direction, data),
            NasCiphering::Nea3 => nea3(&self.enc_key, count, NAS_BEARER_NON_3GPP, direction, data),
        }
    }

    /// Protect a plain uplink message, consuming one uplink COUNT
    pub fn protect(&mut self, plain: &[u8], header_type: u8) -> Result<Vec<u8>> {
        let count = self.uplink;
        let ciphered = matches!(
            header_type,
            sec_header::INTEGRITY_PROTECTED_AND_CIPHERED
                | sec_header::INTEGRITY_PROTECTED_AND_CIPHERED_NEW_CONTEXT
        );
        let message = if ciphered {
            self.cipher(count.value(), DIRECTION_UPLINK, plain)?
        } else {
            plain.to_vec()
        };
        let mac = self.mac(count.value(), DIRECTION_UPLINK, count.sqn(), &message)?;
        self.uplink = count.next();

        Ok(SecuredNas {
            header_type,
            mac,
            sqn: count.sqn(),
            message,
        }
        .to_bytes())
    }

    /// Verify a protected downlink message and return the plain inner message
    ///
    /// The downlink COUNT only advances when the MAC verifies.
    pub fn unprotect(&mut self, secured: &SecuredNas) -> Result<Vec<u8>> {
        let count = if self.downlink_seen {
            self.downlink.estimate(secured.sqn)
        } else {
            NasCount::new(u32::from(secured.sqn))
        };
        let expected = self.mac(count.value(), DIRECTION_DOWNLINK, secured.sqn, &secured.message)?;
        if self.integrity != NasIntegrity::Nia0 && !bool::from(expected.ct_eq(&secured.mac)) {
            debug!(count = count.value(), "NAS MAC mismatch");
            return Err(Error::IntegrityCheckFailed);
        }
        self.downlink = count;
        self.downlink_seen = true;

        if secured.is_ciphered() {
            self.cipher(count.value(), DIRECTION_DOWNLINK, &secured.message)
        } else {
            Ok(secured.message.clone())
        }
    }
}
