//! EAP payload codec (RFC 3748, RFC 4187, RFC 5448, TS 24.502 EAP-5G)
//!
//! The EAP payload carried in IKE_AUTH holds one of:
//!
//! - EAP-AKA / EAP-AKA' messages made of 4-byte aligned attributes
//! - EAP-5G (Expanded Type, vendor 3GPP) wrapping AN parameters and a NAS PDU
//! - EAP Success / Failure
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Code      |  Identifier   |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |    Subtype    |           Reserved            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use crate::ipsec::crypto::{hmac_sha1, hmac_sha256};
use crate::ipsec::{Error, Result};
use crate::mobile::nas::plmn_bytes;

/// EAP codes
pub mod code {
    /// Request
    pub const REQUEST: u8 = 1;
    /// Response
    pub const RESPONSE: u8 = 2;
    /// Success
    pub const SUCCESS: u8 = 3;
    /// Failure
    pub const FAILURE: u8 = 4;
}

/// EAP method types
pub mod method {
    /// Identity
    pub const IDENTITY: u8 = 1;
    /// EAP-AKA (RFC 4187)
    pub const AKA: u8 = 23;
    /// EAP-AKA' (RFC 5448)
    pub const AKA_PRIME: u8 = 50;
    /// Expanded Type
    pub const EXPANDED: u8 = 254;
}

/// EAP-AKA subtypes
pub mod subtype {
    /// AKA-Challenge
    pub const CHALLENGE: u8 = 1;
    /// AKA-Authentication-Reject
    pub const AUTHENTICATION_REJECT: u8 = 2;
    /// AKA-Synchronization-Failure
    pub const SYNCHRONIZATION_FAILURE: u8 = 4;
    /// AKA-Identity
    pub const IDENTITY: u8 = 5;
    /// AKA-Notification
    pub const NOTIFICATION: u8 = 12;
    /// AKA-Reauthentication
    pub const REAUTHENTICATION: u8 = 13;
    /// AKA-Client-Error
    pub const CLIENT_ERROR: u8 = 14;
}

/// EAP-AKA attribute types
pub mod attr {
    /// AT_RAND
    pub const RAND: u8 = 1;
    /// AT_AUTN
    pub const AUTN: u8 = 2;
    /// AT_RES
    pub const RES: u8 = 3;
    /// AT_AUTS
    pub const AUTS: u8 = 4;
    /// AT_PADDING
    pub const PADDING: u8 = 6;
    /// AT_PERMANENT_ID_REQ
    pub const PERMANENT_ID_REQ: u8 = 10;
    /// AT_MAC
    pub const MAC: u8 = 11;
    /// AT_NOTIFICATION
    pub const NOTIFICATION: u8 = 12;
    /// AT_ANY_ID_REQ
    pub const ANY_ID_REQ: u8 = 13;
    /// AT_IDENTITY
    pub const IDENTITY: u8 = 14;
    /// AT_FULLAUTH_ID_REQ
    pub const FULLAUTH_ID_REQ: u8 = 17;
    /// AT_COUNTER
    pub const COUNTER: u8 = 19;
    /// AT_COUNTER_TOO_SMALL
    pub const COUNTER_TOO_SMALL: u8 = 20;
    /// AT_NONCE_S
    pub const NONCE_S: u8 = 21;
    /// AT_CLIENT_ERROR_CODE
    pub const CLIENT_ERROR_CODE: u8 = 22;
    /// AT_KDF_INPUT (EAP-AKA')
    pub const KDF_INPUT: u8 = 23;
    /// AT_KDF (EAP-AKA')
    pub const KDF: u8 = 24;
    /// AT_IV
    pub const IV: u8 = 129;
    /// AT_ENCR_DATA
    pub const ENCR_DATA: u8 = 130;
    /// AT_NEXT_PSEUDONYM
    pub const NEXT_PSEUDONYM: u8 = 132;
    /// AT_NEXT_REAUTH_ID
    pub const NEXT_REAUTH_ID: u8 = 133;
    /// AT_CHECKCODE
    pub const CHECKCODE: u8 = 134;
    /// AT_RESULT_IND
    pub const RESULT_IND: u8 = 135;
}

/// EAP-5G constants (TS 24.502 Section 9.3.2)
pub mod eap5g {
    /// 3GPP vendor identifier
    pub const VENDOR_ID_3GPP: u32 = 10415;
    /// EAP-5G method vendor type
    pub const VENDOR_TYPE_EAP_5G: u32 = 3;

    /// 5G-Start
    pub const START: u8 = 1;
    /// 5G-NAS
    pub const NAS: u8 = 2;
    /// 5G-Notification
    pub const NOTIFICATION: u8 = 3;
    /// 5G-Stop
    pub const STOP: u8 = 4;
}

/// AN parameter types and establishment causes (TS 24.502 Section 9.3.2.2.2)
pub mod an_param {
    /// GUAMI
    pub const GUAMI: u8 = 1;
    /// Selected PLMN ID
    pub const SELECTED_PLMN_ID: u8 = 2;
    /// Requested NSSAI
    pub const REQUESTED_NSSAI: u8 = 3;
    /// Establishment cause
    pub const ESTABLISHMENT_CAUSE: u8 = 4;
    /// Selected NID
    pub const SELECTED_NID: u8 = 5;
    /// UE identity (5G-GUTI or SUCI)
    pub const UE_IDENTITY: u8 = 6;

    /// Emergency
    pub const CAUSE_EMERGENCY: u8 = 0;
    /// High priority access
    pub const CAUSE_HIGH_PRIORITY_ACCESS: u8 = 1;
    /// MO signalling
    pub const CAUSE_MO_SIGNALLING: u8 = 3;
    /// MO data
    pub const CAUSE_MO_DATA: u8 = 4;
}

/// Notification codes below this value report a failure (RFC 4187 Section 10.19)
pub const NOTIFICATION_SUCCESS_BIT: u16 = 0x8000;

/// One EAP-AKA attribute
///
/// `value` holds everything after the type and length octets, so its
/// length is always `4 * n - 2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapAttribute {
    /// Attribute type
    pub attr_type: u8,
    /// Attribute body after the 2-byte header
    pub value: Vec<u8>,
}

impl EapAttribute {
    /// Attribute with raw body, zero-padded to 4-byte alignment
    pub fn raw(attr_type: u8, mut value: Vec<u8>) -> Self {
        while (value.len() + 2) % 4 != 0 {
            value.push(0);
        }
        EapAttribute { attr_type, value }
    }

    /// Attribute carrying a single 16-bit value (AT_COUNTER, AT_KDF, ...)
    pub fn with_u16(attr_type: u8, v: u16) -> Self {
        EapAttribute {
            attr_type,
            value: v.to_be_bytes().to_vec(),
        }
    }

    /// Attribute with 2 reserved bytes followed by data (AT_RAND, AT_MAC, AT_IV, ...)
    pub fn with_reserved(attr_type: u8, data: &[u8]) -> Self {
        let mut value = vec![0, 0];
        value.extend_from_slice(data);
        Self::raw(attr_type, value)
    }

    /// Attribute with an actual-length prefix in bytes (AT_IDENTITY, AT_KDF_INPUT, ...)
    pub fn with_length(attr_type: u8, data: &[u8]) -> Self {
        let mut value = (data.len() as u16).to_be_bytes().to_vec();
        value.extend_from_slice(data);
        Self::raw(attr_type, value)
    }

    /// AT_RES, whose length prefix counts bits
    pub fn res(res: &[u8]) -> Self {
        let mut value = ((res.len() * 8) as u16).to_be_bytes().to_vec();
        value.extend_from_slice(res);
        Self::raw(attr::RES, value)
    }

    /// AT_MAC with a zeroed MAC value
    pub fn empty_mac() -> Self {
        Self::with_reserved(attr::MAC, &[0u8; 16])
    }

    /// AT_PADDING bringing `len` up to a multiple of 16
    ///
    /// Returns `None` when `len` is already aligned.
    pub fn padding_for(len: usize) -> Option<Self> {
        let missing = (16 - len % 16) % 16;
        if missing == 0 {
            return None;
        }
        Some(EapAttribute {
            attr_type: attr::PADDING,
            value: vec![0u8; missing - 2],
        })
    }

    /// Encoded length in bytes
    pub fn encoded_len(&self) -> usize {
        2 + self.value.len()
    }

    /// Leading 16-bit value
    pub fn as_u16(&self) -> Option<u16> {
        (self.value.len() >= 2).then(|| u16::from_be_bytes([self.value[0], self.value[1]]))
    }

    /// Data after the 2 reserved bytes, limited to 16 bytes
    pub fn as_bytes16(&self) -> Option<&[u8]> {
        self.value.get(2..18)
    }

    /// Data after an actual-length prefix (bytes)
    pub fn as_length_prefixed(&self) -> Option<&[u8]> {
        let len = self.as_u16()? as usize;
        self.value.get(2..2 + len)
    }

    /// RES value from AT_RES (bit-length prefix)
    pub fn as_res(&self) -> Option<&[u8]> {
        let bits = self.as_u16()? as usize;
        self.value.get(2..2 + bits.div_ceil(8))
    }

    /// AUTS value (14 bytes right after the header)
    pub fn as_auts(&self) -> Option<&[u8]> {
        self.value.get(0..14)
    }

    /// Data after the 2 reserved bytes, unbounded (AT_ENCR_DATA)
    pub fn as_tail(&self) -> &[u8] {
        self.value.get(2..).unwrap_or_default()
    }
}

/// Decode a run of EAP-AKA attributes
pub fn decode_attributes(data: &[u8]) -> Result<Vec<EapAttribute>> {
    let mut attributes = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if data.len() < pos + 2 {
            return Err(Error::InvalidNas("truncated EAP attribute header".into()));
        }
        let attr_type = data[pos];
        let len = data[pos + 1] as usize * 4;
        if len == 0 {
            return Err(Error::InvalidNas(format!(
                "EAP attribute {} with zero length",
                attr_type
            )));
        }
        if data.len() < pos + len {
            return Err(Error::BufferTooShort {
                required: pos + len,
                available: data.len(),
            });
        }
        attributes.push(EapAttribute {
            attr_type,
            value: data[pos + 2..pos + len].to_vec(),
        });
        pos += len;
    }
    Ok(attributes)
}

/// Encode a run of EAP-AKA attributes
pub fn encode_attributes(attributes: &[EapAttribute]) -> Vec<u8> {
    let mut out = Vec::new();
    for a in attributes {
        out.push(a.attr_type);
        out.push((a.encoded_len() / 4) as u8);
        out.extend_from_slice(&a.value);
    }
    out
}

/// EAP-AKA or EAP-AKA' message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AkaMessage {
    /// `method::AKA` or `method::AKA_PRIME`
    pub method: u8,
    /// Subtype
    pub subtype: u8,
    /// Attributes in wire order
    pub attributes: Vec<EapAttribute>,
}

impl AkaMessage {
    /// First attribute of a given type
    pub fn attribute(&self, attr_type: u8) -> Option<&EapAttribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    /// AT_RAND value
    pub fn rand(&self) -> Option<&[u8]> {
        self.attribute(attr::RAND).and_then(EapAttribute::as_bytes16)
    }

    /// AT_AUTN value
    pub fn autn(&self) -> Option<&[u8]> {
        self.attribute(attr::AUTN).and_then(EapAttribute::as_bytes16)
    }

    /// AT_MAC value
    pub fn mac(&self) -> Option<&[u8]> {
        self.attribute(attr::MAC).and_then(EapAttribute::as_bytes16)
    }

    /// AT_KDF value
    pub fn kdf(&self) -> Option<u16> {
        self.attribute(attr::KDF).and_then(EapAttribute::as_u16)
    }

    /// AT_KDF_INPUT (network name) value
    pub fn kdf_input(&self) -> Option<&[u8]> {
        self.attribute(attr::KDF_INPUT)
            .and_then(EapAttribute::as_length_prefixed)
    }

    /// AT_NOTIFICATION value
    pub fn notification(&self) -> Option<u16> {
        self.attribute(attr::NOTIFICATION)
            .and_then(EapAttribute::as_u16)
    }
}

/// AN parameter (type, length, value)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnParameter {
    /// Parameter type
    pub param_type: u8,
    /// Parameter value
    pub value: Vec<u8>,
}

impl AnParameter {
    /// Selected PLMN ID
    pub fn plmn(mcc: &str, mnc: &str) -> Result<Self> {
        Ok(AnParameter {
            param_type: an_param::SELECTED_PLMN_ID,
            value: plmn_bytes(mcc, mnc)?.to_vec(),
        })
    }

    /// Establishment cause
    pub fn establishment_cause(cause: u8) -> Self {
        AnParameter {
            param_type: an_param::ESTABLISHMENT_CAUSE,
            value: vec![cause],
        }
    }

    /// GUAMI: PLMN, AMF region, 10-bit AMF set ID, 6-bit AMF pointer
    pub fn guami(mcc: &str, mnc: &str, region: u8, set_id: u16, pointer: u8) -> Result<Self> {
        let mut value = plmn_bytes(mcc, mnc)?.to_vec();
        value.push(region);
        let tail = ((set_id & 0x03ff) << 6) | u16::from(pointer & 0x3f);
        value.extend_from_slice(&tail.to_be_bytes());
        Ok(AnParameter {
            param_type: an_param::GUAMI,
            value,
        })
    }

    /// Requested NSSAI from (SST, optional SD) pairs
    pub fn nssai(slices: &[(u8, Option<u32>)]) -> Self {
        let mut value = Vec::new();
        for (sst, sd) in slices {
            match sd {
                Some(sd) => {
                    value.push(4);
                    value.push(*sst);
                    value.extend_from_slice(&sd.to_be_bytes()[1..]);
                }
                None => {
                    value.push(1);
                    value.push(*sst);
                }
            }
        }
        AnParameter {
            param_type: an_param::REQUESTED_NSSAI,
            value,
        }
    }
}

fn encode_an_parameters(params: &[AnParameter], out: &mut Vec<u8>) {
    let mut body = Vec::new();
    for p in params {
        body.push(p.param_type);
        body.push(p.value.len() as u8);
        body.extend_from_slice(&p.value);
    }
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(&body);
}

fn decode_an_parameters(data: &[u8]) -> Result<Vec<AnParameter>> {
    let mut params = Vec::new();
    let mut pos = 0;
    while pos + 2 <= data.len() {
        let len = data[pos + 1] as usize;
        let value = data
            .get(pos + 2..pos + 2 + len)
            .ok_or_else(|| Error::InvalidNas("truncated AN parameter".into()))?;
        params.push(AnParameter {
            param_type: data[pos],
            value: value.to_vec(),
        });
        pos += 2 + len;
    }
    Ok(params)
}

fn read_u16_field(data: &[u8], pos: usize) -> Result<(usize, usize)> {
    let raw = data
        .get(pos..pos + 2)
        .ok_or_else(|| Error::InvalidNas("truncated EAP-5G length field".into()))?;
    let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
    if data.len() < pos + 2 + len {
        return Err(Error::BufferTooShort {
            required: pos + 2 + len,
            available: data.len(),
        });
    }
    Ok((pos + 2, len))
}

/// EAP-5G message (Expanded Type, vendor 3GPP, type 3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eap5gMessage {
    /// Message ID (`eap5g::START` .. `eap5g::STOP`)
    pub message_id: u8,
    /// AN parameters (NAS response, notification request)
    pub an_parameters: Vec<AnParameter>,
    /// NAS PDU (NAS request/response)
    pub nas_pdu: Option<Vec<u8>>,
}

impl Eap5gMessage {
    /// 5G-NAS message carrying a NAS PDU
    pub fn nas(an_parameters: Vec<AnParameter>, nas_pdu: Vec<u8>) -> Self {
        Eap5gMessage {
            message_id: eap5g::NAS,
            an_parameters,
            nas_pdu: Some(nas_pdu),
        }
    }

    /// Message with no body (5G-Start, 5G-Stop, notification response)
    pub fn bare(message_id: u8) -> Self {
        Eap5gMessage {
            message_id,
            an_parameters: Vec::new(),
            nas_pdu: None,
        }
    }

    fn encode(&self, eap_code: u8, out: &mut Vec<u8>) {
        out.extend_from_slice(&eap5g::VENDOR_ID_3GPP.to_be_bytes()[1..]);
        out.extend_from_slice(&eap5g::VENDOR_TYPE_EAP_5G.to_be_bytes());
        out.push(self.message_id);
        out.push(0);

        let nas = self.nas_pdu.as_deref().unwrap_or_default();
        match (self.message_id, eap_code) {
            (eap5g::NAS, code::RESPONSE) => {
                encode_an_parameters(&self.an_parameters, out);
                out.extend_from_slice(&(nas.len() as u16).to_be_bytes());
                out.extend_from_slice(nas);
            }
            (eap5g::NAS, _) => {
                out.extend_from_slice(&(nas.len() as u16).to_be_bytes());
                out.extend_from_slice(nas);
            }
            (eap5g::NOTIFICATION, code::REQUEST) => {
                encode_an_parameters(&self.an_parameters, out);
            }
            _ => {}
        }
    }

    /// `data` starts at the message ID
    fn decode(eap_code: u8, data: &[u8]) -> Result<Self> {
        let message_id = *data
            .first()
            .ok_or_else(|| Error::InvalidNas("EAP-5G without message ID".into()))?;
        let mut msg = Eap5gMessage::bare(message_id);

        match (message_id, eap_code) {
            (eap5g::NAS, code::RESPONSE) => {
                let (start, len) = read_u16_field(data, 2)?;
                msg.an_parameters = decode_an_parameters(&data[start..start + len])?;
                let (nas_start, nas_len) = read_u16_field(data, start + len)?;
                if nas_len > 0 {
                    msg.nas_pdu = Some(data[nas_start..nas_start + nas_len].to_vec());
                }
            }
            (eap5g::NAS, code::REQUEST) => {
                let (start, len) = read_u16_field(data, 2)?;
                if len > 0 {
                    msg.nas_pdu = Some(data[start..start + len].to_vec());
                }
            }
            (eap5g::NOTIFICATION, code::REQUEST) => {
                let (start, len) = read_u16_field(data, 2)?;
                msg.an_parameters = decode_an_parameters(&data[start..start + len])?;
            }
            _ => {}
        }
        Ok(msg)
    }
}

/// EAP message body by method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapBody {
    /// Success / Failure carry no type
    Empty,
    /// EAP-AKA or EAP-AKA'
    Aka(AkaMessage),
    /// EAP-5G
    Eap5g(Eap5gMessage),
    /// Any other method, kept opaque
    Other {
        /// EAP method type
        eap_type: u8,
        /// Type-data
        data: Vec<u8>,
    },
}

/// EAP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapPacket {
    /// Code (`code::REQUEST` ..)
    pub code: u8,
    /// Identifier echoed in the response
    pub identifier: u8,
    /// Body
    pub body: EapBody,
}

impl EapPacket {
    /// EAP-AKA / EAP-AKA' response
    pub fn aka_response(identifier: u8, method: u8, subtype: u8, attributes: Vec<EapAttribute>) -> Self {
        EapPacket {
            code: code::RESPONSE,
            identifier,
            body: EapBody::Aka(AkaMessage {
                method,
                subtype,
                attributes,
            }),
        }
    }

    /// EAP-5G response
    pub fn eap5g_response(identifier: u8, message: Eap5gMessage) -> Self {
        EapPacket {
            code: code::RESPONSE,
            identifier,
            body: EapBody::Eap5g(message),
        }
    }

    /// Whether this is an EAP Success
    pub fn is_success(&self) -> bool {
        self.code == code::SUCCESS
    }

    /// Whether this is an EAP Failure
    pub fn is_failure(&self) -> bool {
        self.code == code::FAILURE
    }

    /// AKA body, if any
    pub fn aka(&self) -> Option<&AkaMessage> {
        match &self.body {
            EapBody::Aka(m) => Some(m),
            _ => None,
        }
    }

    /// EAP-5G body, if any
    pub fn eap5g(&self) -> Option<&Eap5gMessage> {
        match &self.body {
            EapBody::Eap5g(m) => Some(m),
            _ => None,
        }
    }

    /// Serialize the packet
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![self.code, self.identifier, 0, 0];
        match &self.body {
            EapBody::Empty => {}
            EapBody::Aka(m) => {
                out.push(m.method);
                out.push(m.subtype);
                out.extend_from_slice(&[0, 0]);
                out.extend_from_slice(&encode_attributes(&m.attributes));
            }
            EapBody::Eap5g(m) => {
                out.push(method::EXPANDED);
                m.encode(self.code, &mut out);
            }
            EapBody::Other { eap_type, data } => {
                out.push(*eap_type);
                out.extend_from_slice(data);
            }
        }
        let len = out.len() as u16;
        out[2..4].copy_from_slice(&len.to_be_bytes());
        out
    }

    /// Parse a packet
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }
        let code = data[0];
        let identifier = data[1];
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if len < 4 || data.len() < len {
            return Err(Error::InvalidLength {
                expected: len,
                actual: data.len(),
            });
        }
        let data = &data[..len];

        let body = match code {
            code::SUCCESS | code::FAILURE => EapBody::Empty,
            code::REQUEST | code::RESPONSE => {
                let eap_type = *data
                    .get(4)
                    .ok_or_else(|| Error::InvalidNas("EAP request without type".into()))?;
                match eap_type {
                    method::AKA | method::AKA_PRIME => {
                        if data.len() < 8 {
                            return Err(Error::BufferTooShort {
                                required: 8,
                                available: data.len(),
                            });
                        }
                        EapBody::Aka(AkaMessage {
                            method: eap_type,
                            subtype: data[5],
                            attributes: decode_attributes(&data[8..])?,
                        })
                    }
                    method::EXPANDED if data.len() >= 13 => {
                        let vendor_id = u32::from_be_bytes([0, data[5], data[6], data[7]]);
                        let vendor_type =
                            u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
                        if vendor_id == eap5g::VENDOR_ID_3GPP
                            && vendor_type == eap5g::VENDOR_TYPE_EAP_5G
                        {
                            EapBody::Eap5g(Eap5gMessage::decode(code, &data[12..])?)
                        } else {
                            EapBody::Other {
                                eap_type,
                                data: data[5..].to_vec(),
                            }
                        }
                    }
                    _ => EapBody::Other {
                        eap_type,
                        data: data[5..].to_vec(),
                    },
                }
            }
            other => {
                return Err(Error::InvalidNas(format!("Unknown EAP code: {}", other)));
            }
        };

        Ok(EapPacket {
            code,
            identifier,
            body,
        })
    }

    /// Fill in AT_MAC over the encoded packet followed by `extra`
    ///
    /// EAP-AKA uses HMAC-SHA1-128 with K_aut, EAP-AKA' HMAC-SHA256-128.
    pub fn sign(&mut self, k_aut: &[u8], extra: &[u8]) -> Result<()> {
        let mac = self.compute_mac(k_aut, extra)?;
        if let EapBody::Aka(m) = &mut self.body {
            if let Some(a) = m.attributes.iter_mut().find(|a| a.attr_type == attr::MAC) {
                *a = EapAttribute::with_reserved(attr::MAC, &mac);
                return Ok(());
            }
        }
        Err(Error::MandatoryInformationMissing("AT_MAC".into()))
    }

    /// Check AT_MAC of a received packet
    pub fn verify_mac(&self, k_aut: &[u8], extra: &[u8]) -> Result<()> {
        let received = self
            .aka()
            .and_then(AkaMessage::mac)
            .ok_or_else(|| Error::MandatoryInformationMissing("AT_MAC".into()))?
            .to_vec();
        let expected = self.compute_mac(k_aut, extra)?;
        if subtle::ConstantTimeEq::ct_eq(expected.as_slice(), received.as_slice()).into() {
            Ok(())
        } else {
            Err(Error::AuthenticationFailed("EAP AT_MAC mismatch".into()))
        }
    }

    fn compute_mac(&self, k_aut: &[u8], extra: &[u8]) -> Result<Vec<u8>> {
        let m = self
            .aka()
            .ok_or_else(|| Error::InvalidState("AT_MAC on a non-AKA packet".into()))?;
        let mut zeroed = self.clone();
        if let EapBody::Aka(z) = &mut zeroed.body {
            for a in z.attributes.iter_mut().filter(|a| a.attr_type == attr::MAC) {
                *a = EapAttribute::empty_mac();
            }
        }
        let mut input = zeroed.to_bytes();
        input.extend_from_slice(extra);

        let mut mac = if m.method == method::AKA_PRIME {
            hmac_sha256(k_aut, &input)?
        } else {
            hmac_sha1(k_aut, &input)?
        };
        mac.truncate(16);
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aka_challenge_response_layout() {
        let res = [0x11u8; 8];
        let packet = EapPacket::aka_response(
            7,
            method::AKA,
            subtype::CHALLENGE,
            vec![EapAttribute::res(&res), EapAttribute::empty_mac()],
        );
        let bytes = packet.to_bytes();

        let mut expected = vec![2, 7, 0x00, 0x28, 0x17, 0x01, 0x00, 0x00, 0x03, 0x03, 0x00, 0x40];
        expected.extend_from_slice(&res);
        expected.extend_from_slice(&[0x0b, 0x05, 0x00, 0x00]);
        expected.extend_from_slice(&[0u8; 16]);
        assert_eq!(bytes, expected);

        let parsed = EapPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(
            parsed.aka().unwrap().attribute(attr::RES).unwrap().as_res(),
            Some(&res[..])
        );
    }

    #[test]
    fn test_challenge_request_accessors() {
        let mut bytes = vec![1, 3, 0, 0, 50, 1, 0, 0];
        bytes.extend_from_slice(&[attr::RAND, 5, 0, 0]);
        bytes.extend_from_slice(&[0xaa; 16]);
        bytes.extend_from_slice(&[attr::AUTN, 5, 0, 0]);
        bytes.extend_from_slice(&[0xbb; 16]);
        bytes.extend_from_slice(&[attr::KDF, 1, 0, 1]);
        bytes.extend_from_slice(&[attr::KDF_INPUT, 2, 0, 3, b'W', b'L', b'N', 0]);
        let len = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&len.to_be_bytes());

        let packet = EapPacket::from_bytes(&bytes).unwrap();
        let aka = packet.aka().unwrap();
        assert_eq!(aka.method, method::AKA_PRIME);
        assert_eq!(aka.rand(), Some(&[0xaa; 16][..]));
        assert_eq!(aka.autn(), Some(&[0xbb; 16][..]));
        assert_eq!(aka.kdf(), Some(1));
        assert_eq!(aka.kdf_input(), Some(&b"WLN"[..]));
        assert_eq!(packet.to_bytes(), bytes);
    }

    #[test]
    fn test_success_and_failure() {
        let success = EapPacket::from_bytes(&[3, 9, 0, 4]).unwrap();
        assert!(success.is_success());
        assert_eq!(success.body, EapBody::Empty);
        assert!(EapPacket::from_bytes(&[4, 9, 0, 4]).unwrap().is_failure());
        assert!(EapPacket::from_bytes(&[9, 9, 0, 4]).is_err());
        assert!(EapPacket::from_bytes(&[1, 9, 0, 40]).is_err());
    }

    #[test]
    fn test_eap5g_nas_response_layout() {
        let msg = Eap5gMessage::nas(
            vec![AnParameter::establishment_cause(an_param::CAUSE_MO_DATA)],
            vec![0x7e, 0x00, 0x41],
        );
        let packet = EapPacket::eap5g_response(5, msg.clone());
        let bytes = packet.to_bytes();

        assert_eq!(&bytes[4..12], &[254, 0x00, 0x28, 0xaf, 0, 0, 0, 3]);
        assert_eq!(bytes[12], eap5g::NAS);
        assert_eq!(&bytes[14..16], &[0, 3]);
        assert_eq!(&bytes[16..19], &[an_param::ESTABLISHMENT_CAUSE, 1, 4]);
        assert_eq!(&bytes[19..21], &[0, 3]);

        let parsed = EapPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.eap5g(), Some(&msg));
    }

    #[test]
    fn test_eap5g_nas_request() {
        let request = EapPacket {
            code: code::REQUEST,
            identifier: 1,
            body: EapBody::Eap5g(Eap5gMessage::nas(Vec::new(), vec![1, 2, 3, 4])),
        };
        let bytes = request.to_bytes();
        assert_eq!(&bytes[14..16], &[0, 4]);
        let parsed = EapPacket::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.eap5g().unwrap().nas_pdu.as_deref(), Some(&[1u8, 2, 3, 4][..]));

        let start = EapPacket {
            code: code::REQUEST,
            identifier: 2,
            body: EapBody::Eap5g(Eap5gMessage::bare(eap5g::START)),
        };
        assert_eq!(EapPacket::from_bytes(&start.to_bytes()).unwrap(), start);
    }

    #[test]
    fn test_an_parameters() {
        let guami = AnParameter::guami("208", "93", 0xca, 0x3f8, 0).unwrap();
        assert_eq!(guami.value, vec![0x02, 0xf8, 0x39, 0xca, 0xfe, 0x00]);

        let nssai = AnParameter::nssai(&[(1, Some(0x010203)), (1, None)]);
        assert_eq!(nssai.value, vec![4, 1, 1, 2, 3, 1, 1]);
    }

    #[test]
    fn test_mac_sign_and_verify() {
        let k_aut = [0x42u8; 16];
        let mut packet = EapPacket::aka_response(
            1,
            method::AKA,
            subtype::CHALLENGE,
            vec![EapAttribute::res(&[1; 8]), EapAttribute::empty_mac()],
        );
        packet.sign(&k_aut, &[]).unwrap();
        assert_ne!(packet.aka().unwrap().mac(), Some(&[0u8; 16][..]));
        packet.verify_mac(&k_aut, &[]).unwrap();
        assert!(packet.verify_mac(&k_aut, b"nonce").is_err());
        assert!(packet.verify_mac(&[0u8; 16], &[]).is_err());
    }

    #[test]
    fn test_padding_attribute() {
        let pad = EapAttribute::padding_for(4).unwrap();
        assert_eq!(pad.encoded_len(), 12);
        assert!(EapAttribute::padding_for(32).is_none());
    }

    #[test]
    fn test_truncated_attributes_rejected() {
        assert!(decode_attributes(&[attr::RAND, 5, 0, 0, 1]).is_err());
        assert!(decode_attributes(&[attr::RAND, 0]).is_err());
    }
}
