//! IKEv2 protocol constants from RFC 7296
//!
//! Also carries the 3GPP private notify types (TS 24.302 / 24.502) and the
//! identification, traffic selector and configuration attribute registries
//! the UE uses.

/// IKE version 2 (major version = 2, minor version = 0)
pub const IKE_VERSION: u8 = 0x20;

/// Maximum IKE message size (64KB - 1)
pub const MAX_IKE_MESSAGE_SIZE: u32 = 65535;

/// IKE header size (28 bytes)
pub const IKE_HEADER_SIZE: usize = 28;

/// Exchange Types (RFC 7296 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// IKE_SA_INIT exchange (34)
    IkeSaInit = 34,
    /// IKE_AUTH exchange (35)
    IkeAuth = 35,
    /// CREATE_CHILD_SA exchange (36)
    CreateChildSa = 36,
    /// INFORMATIONAL exchange (37)
    Informational = 37,
}

impl ExchangeType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            34 => Some(ExchangeType::IkeSaInit),
            35 => Some(ExchangeType::IkeAuth),
            36 => Some(ExchangeType::CreateChildSa),
            37 => Some(ExchangeType::Informational),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// IKE message flags (RFC 7296 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkeFlags(u8);

impl IkeFlags {
    /// Response flag (bit 5)
    pub const RESPONSE: u8 = 0x20;
    /// Version flag (bit 4)
    pub const VERSION: u8 = 0x10;
    /// Initiator flag (bit 3)
    pub const INITIATOR: u8 = 0x08;

    /// Create new flags
    pub fn new(value: u8) -> Self {
        IkeFlags(value & 0x38) // Mask to only keep bits 3-5
    }

    /// Create flags for request
    pub fn request(is_initiator: bool) -> Self {
        if is_initiator {
            IkeFlags(Self::INITIATOR)
        } else {
            IkeFlags(0)
        }
    }

    /// Create flags for response
    pub fn response(is_initiator: bool) -> Self {
        let mut flags = Self::RESPONSE;
        if is_initiator {
            flags |= Self::INITIATOR;
        }
        IkeFlags(flags)
    }

    /// Check if this is a response
    pub fn is_response(self) -> bool {
        (self.0 & Self::RESPONSE) != 0
    }

    /// Check if this is from initiator
    pub fn is_initiator(self) -> bool {
        (self.0 & Self::INITIATOR) != 0
    }

    /// Get raw value
    pub fn value(self) -> u8 {
        self.0
    }
}

/// Payload Types (RFC 7296 Section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// No next payload (0)
    None = 0,
    /// Security Association (33)
    SA = 33,
    /// Key Exchange (34)
    KE = 34,
    /// Identification - Initiator (35)
    IDi = 35,
    /// Identification - Responder (36)
    IDr = 36,
    /// Certificate (37)
    CERT = 37,
    /// Certificate Request (38)
    CERTREQ = 38,
    /// Authentication (39)
    AUTH = 39,
    /// Nonce (40)
    Nonce = 40,
    /// Notify (41)
    N = 41,
    /// Delete (42)
    D = 42,
    /// Vendor ID (43)
    V = 43,
    /// Traffic Selector - Initiator (44)
    TSi = 44,
    /// Traffic Selector - Responder (45)
    TSr = 45,
    /// Encrypted and Authenticated (46)
    SK = 46,
    /// Configuration (47)
    CP = 47,
    /// Extensible Authentication (48)
    EAP = 48,
}

impl PayloadType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadType::None),
            33 => Some(PayloadType::SA),
            34 => Some(PayloadType::KE),
            35 => Some(PayloadType::IDi),
            36 => Some(PayloadType::IDr),
            37 => Some(PayloadType::CERT),
            38 => Some(PayloadType::CERTREQ),
            39 => Some(PayloadType::AUTH),
            40 => Some(PayloadType::Nonce),
            41 => Some(PayloadType::N),
            42 => Some(PayloadType::D),
            43 => Some(PayloadType::V),
            44 => Some(PayloadType::TSi),
            45 => Some(PayloadType::TSr),
            46 => Some(PayloadType::SK),
            47 => Some(PayloadType::CP),
            48 => Some(PayloadType::EAP),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// IKE port
pub const IKE_PORT: u16 = 500;

/// IKE NAT traversal port (RFC 3948)
pub const IKE_NAT_PORT: u16 = 4500;

/// Non-ESP marker prepended to IKE messages on port 4500
pub const NON_ESP_MARKER: [u8; 4] = [0, 0, 0, 0];

/// Notify message types (RFC 7296 Section 3.10.1, TS 24.302, TS 24.502)
pub mod notify {
    /// UNSUPPORTED_CRITICAL_PAYLOAD
    pub const UNSUPPORTED_CRITICAL_PAYLOAD: u16 = 1;
    /// INVALID_IKE_SPI
    pub const INVALID_IKE_SPI: u16 = 4;
    /// INVALID_MAJOR_VERSION
    pub const INVALID_MAJOR_VERSION: u16 = 5;
    /// INVALID_SYNTAX
    pub const INVALID_SYNTAX: u16 = 7;
    /// INVALID_MESSAGE_ID
    pub const INVALID_MESSAGE_ID: u16 = 9;
    /// INVALID_SPI
    pub const INVALID_SPI: u16 = 11;
    /// NO_PROPOSAL_CHOSEN
    pub const NO_PROPOSAL_CHOSEN: u16 = 14;
    /// INVALID_KE_PAYLOAD
    pub const INVALID_KE_PAYLOAD: u16 = 17;
    /// AUTHENTICATION_FAILED
    pub const AUTHENTICATION_FAILED: u16 = 24;
    /// SINGLE_PAIR_REQUIRED
    pub const SINGLE_PAIR_REQUIRED: u16 = 34;
    /// NO_ADDITIONAL_SAS
    pub const NO_ADDITIONAL_SAS: u16 = 35;
    /// INTERNAL_ADDRESS_FAILURE
    pub const INTERNAL_ADDRESS_FAILURE: u16 = 36;
    /// FAILED_CP_REQUIRED
    pub const FAILED_CP_REQUIRED: u16 = 37;
    /// TS_UNACCEPTABLE
    pub const TS_UNACCEPTABLE: u16 = 38;
    /// TEMPORARY_FAILURE
    pub const TEMPORARY_FAILURE: u16 = 43;
    /// CHILD_SA_NOT_FOUND
    pub const CHILD_SA_NOT_FOUND: u16 = 44;

    /// Status types start here; anything below is an error
    pub const FIRST_STATUS_TYPE: u16 = 16384;

    /// INITIAL_CONTACT
    pub const INITIAL_CONTACT: u16 = 16384;
    /// NAT_DETECTION_SOURCE_IP
    pub const NAT_DETECTION_SOURCE_IP: u16 = 16388;
    /// NAT_DETECTION_DESTINATION_IP
    pub const NAT_DETECTION_DESTINATION_IP: u16 = 16389;
    /// COOKIE
    pub const COOKIE: u16 = 16390;
    /// REKEY_SA
    pub const REKEY_SA: u16 = 16393;
    /// DEVICE_IDENTITY (TS 24.302)
    pub const DEVICE_IDENTITY: u16 = 41101;
    /// 5G_QOS_INFO (TS 24.502)
    pub const QOS_INFO_5G: u16 = 55501;
    /// NAS_IP4_ADDRESS (TS 24.502)
    pub const NAS_IP4_ADDRESS: u16 = 55502;
    /// NAS_IP6_ADDRESS (TS 24.502)
    pub const NAS_IP6_ADDRESS: u16 = 55503;
    /// UP_IP4_ADDRESS (TS 24.502)
    pub const UP_IP4_ADDRESS: u16 = 55504;
    /// UP_IP6_ADDRESS (TS 24.502)
    pub const UP_IP6_ADDRESS: u16 = 55505;
    /// NAS_TCP_PORT (TS 24.502)
    pub const NAS_TCP_PORT: u16 = 55506;

    /// Whether a notify type reports an error
    pub fn is_error(notify_type: u16) -> bool {
        notify_type < FIRST_STATUS_TYPE
    }
}

/// Traffic selector types (RFC 7296 Section 3.13.1)
pub mod ts_type {
    /// TS_IPV4_ADDR_RANGE
    pub const IPV4_ADDR_RANGE: u8 = 7;
    /// TS_IPV6_ADDR_RANGE
    pub const IPV6_ADDR_RANGE: u8 = 8;
}

/// Configuration payload types and attributes (RFC 7296 Section 3.15)
pub mod cfg {
    /// CFG_REQUEST
    pub const REQUEST: u8 = 1;
    /// CFG_REPLY
    pub const REPLY: u8 = 2;
    /// CFG_SET
    pub const SET: u8 = 3;
    /// CFG_ACK
    pub const ACK: u8 = 4;

    /// INTERNAL_IP4_ADDRESS
    pub const INTERNAL_IP4_ADDRESS: u16 = 1;
    /// INTERNAL_IP4_NETMASK
    pub const INTERNAL_IP4_NETMASK: u16 = 2;
    /// INTERNAL_IP4_DNS
    pub const INTERNAL_IP4_DNS: u16 = 3;
    /// INTERNAL_IP4_NBNS
    pub const INTERNAL_IP4_NBNS: u16 = 4;
    /// INTERNAL_IP4_DHCP
    pub const INTERNAL_IP4_DHCP: u16 = 6;
    /// INTERNAL_IP6_ADDRESS
    pub const INTERNAL_IP6_ADDRESS: u16 = 8;
    /// INTERNAL_IP6_DNS
    pub const INTERNAL_IP6_DNS: u16 = 10;
    /// INTERNAL_IP6_DHCP
    pub const INTERNAL_IP6_DHCP: u16 = 12;
    /// INTERNAL_IP4_SUBNET
    pub const INTERNAL_IP4_SUBNET: u16 = 13;
    /// INTERNAL_IP6_SUBNET
    pub const INTERNAL_IP6_SUBNET: u16 = 15;
    /// P_CSCF_IP4_ADDRESS (RFC 7651)
    pub const P_CSCF_IP4_ADDRESS: u16 = 20;
    /// P_CSCF_IP6_ADDRESS (RFC 7651)
    pub const P_CSCF_IP6_ADDRESS: u16 = 21;

    /// Fixed value length of known attributes, `None` for opaque ones
    ///
    /// A length of 4 may repeat (address lists), 8 is address + netmask and
    /// 17 is an IPv6 address followed by a prefix length.
    pub fn fixed_len(attr_type: u16) -> Option<usize> {
        match attr_type {
            INTERNAL_IP4_ADDRESS | INTERNAL_IP4_NETMASK | INTERNAL_IP4_DNS
            | INTERNAL_IP4_NBNS | INTERNAL_IP4_DHCP | P_CSCF_IP4_ADDRESS => Some(4),
            INTERNAL_IP4_SUBNET => Some(8),
            INTERNAL_IP6_DNS | INTERNAL_IP6_DHCP | P_CSCF_IP6_ADDRESS => Some(16),
            INTERNAL_IP6_ADDRESS | INTERNAL_IP6_SUBNET => Some(17),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_type_conversion() {
        assert_eq!(ExchangeType::from_u8(34), Some(ExchangeType::IkeSaInit));
        assert_eq!(ExchangeType::from_u8(35), Some(ExchangeType::IkeAuth));
        assert_eq!(ExchangeType::from_u8(36), Some(ExchangeType::CreateChildSa));
        assert_eq!(ExchangeType::from_u8(37), Some(ExchangeType::Informational));
        assert_eq!(ExchangeType::from_u8(99), None);

        assert_eq!(ExchangeType::IkeSaInit.to_u8(), 34);
        assert_eq!(ExchangeType::IkeAuth.to_u8(), 35);
    }

    #[test]
    fn test_ike_flags() {
        let flags = IkeFlags::request(true);
        assert!(!flags.is_response());
        assert!(flags.is_initiator());

        let flags = IkeFlags::response(false);
        assert!(flags.is_response());
        assert!(!flags.is_initiator());

        let flags = IkeFlags::response(true);
        assert!(flags.is_response());
        assert!(flags.is_initiator());
        assert_eq!(flags.value(), IkeFlags::RESPONSE | IkeFlags::INITIATOR);
    }

    #[test]
    fn test_payload_type_conversion() {
        assert_eq!(PayloadType::from_u8(0), Some(PayloadType::None));
        assert_eq!(PayloadType::from_u8(33), Some(PayloadType::SA));
        assert_eq!(PayloadType::from_u8(40), Some(PayloadType::Nonce));
        assert_eq!(PayloadType::from_u8(255), None);

        assert_eq!(PayloadType::SA.to_u8(), 33);
        assert_eq!(PayloadType::Nonce.to_u8(), 40);
    }

    #[test]
    fn test_notify_is_error() {
        assert!(notify::is_error(notify::AUTHENTICATION_FAILED));
        assert!(notify::is_error(16383));
        assert!(!notify::is_error(notify::COOKIE));
        assert!(!notify::is_error(notify::NAS_TCP_PORT));
    }

    #[test]
    fn test_cfg_fixed_len() {
        assert_eq!(cfg::fixed_len(cfg::INTERNAL_IP4_DNS), Some(4));
        assert_eq!(cfg::fixed_len(cfg::INTERNAL_IP4_SUBNET), Some(8));
        assert_eq!(cfg::fixed_len(cfg::INTERNAL_IP6_DNS), Some(16));
        assert_eq!(cfg::fixed_len(cfg::INTERNAL_IP6_ADDRESS), Some(17));
        assert_eq!(cfg::fixed_len(7), None);
    }

    #[test]
    fn test_constants() {
        assert_eq!(IKE_VERSION, 0x20);
        assert_eq!(MAX_IKE_MESSAGE_SIZE, 65535);
        assert_eq!(IKE_HEADER_SIZE, 28);
    }
}
