//! Error types for the UE protocol engine
//!
//! This module defines a unified error type for IKEv2, EAP, NAS and ESP
//! operations. Every variant maps onto one of the coarse [`ErrorKind`]s
//! the exchange driver uses to decide between retrying, repeating a
//! state and aborting the session.

use std::fmt;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by the exchange driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No response within the per-step deadline
    Timeout,
    /// Malformed header, payload chain or NAS/EAP body
    DecodingError,
    /// Expected payload or information element absent
    MandatoryInformationMissing,
    /// Peer sent an error notify (type below 16384)
    ProtocolNotify,
    /// Current state must be run again
    RepeatState,
    /// Current state must be run again carrying a cookie
    RepeatStateCookie,
    /// AUTN sequence number rejected, resynchronisation sent
    SynchFailure,
    /// Everything else
    OtherError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::DecodingError => "DECODING_ERROR",
            ErrorKind::MandatoryInformationMissing => "MANDATORY_INFORMATION_MISSING",
            ErrorKind::ProtocolNotify => "PROTOCOL_NOTIFY",
            ErrorKind::RepeatState => "REPEAT_STATE",
            ErrorKind::RepeatStateCookie => "REPEAT_STATE_COOKIE",
            ErrorKind::SynchFailure => "SYNCH_FAILURE",
            ErrorKind::OtherError => "OTHER_ERROR",
        };
        f.write_str(name)
    }
}

/// Protocol engine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid IKEv2 message format
    InvalidMessage(String),

    /// Invalid IKEv2 payload
    InvalidPayload(String),

    /// Invalid EAP or NAS body
    InvalidNas(String),

    /// Unsupported protocol version
    UnsupportedVersion(u8),

    /// Message exceeds the maximum IKE message size
    MessageTooLarge(u32),

    /// Unsupported exchange type
    UnsupportedExchangeType(u8),

    /// Algorithm identifier we cannot run
    UnsupportedAlgorithm(String),

    /// No acceptable proposal found
    NoProposalChosen,

    /// Invalid proposal structure
    InvalidProposal(String),

    /// Authentication failed
    AuthenticationFailed(String),

    /// Expected payload or information element is absent
    MandatoryInformationMissing(String),

    /// Error notify received from the peer
    ProtocolNotify(u16),

    /// Timed out waiting for the peer
    Timeout,

    /// State must be repeated
    RepeatState,

    /// State must be repeated with the cookie sent by the responder
    RepeatStateCookie(Vec<u8>),

    /// Sequence number resynchronisation was requested
    SynchFailure,

    /// Security Association not found
    SaNotFound(String),

    /// Cryptographic operation failed
    CryptoError(String),

    /// Integrity check value mismatch
    IntegrityCheckFailed,

    /// Invalid key length
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid IV length
    InvalidIvLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid packet length
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Invalid Security Parameter Index
    InvalidSpi(u32),

    /// Invalid configuration parameter
    InvalidParameter(String),

    /// State machine error
    InvalidState(String),

    /// Authentication vector provider failure
    VectorProvider(String),

    /// Control channel closed
    ChannelClosed,

    /// I/O error
    Io(String),

    /// Catch-all with a descriptive reason
    Other(String),
}

impl Error {
    /// Classify the error for the exchange driver
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout => ErrorKind::Timeout,
            Error::InvalidMessage(_)
            | Error::InvalidPayload(_)
            | Error::InvalidNas(_)
            | Error::UnsupportedVersion(_)
            | Error::MessageTooLarge(_)
            | Error::InvalidLength { .. }
            | Error::BufferTooShort { .. }
            | Error::IntegrityCheckFailed => ErrorKind::DecodingError,
            Error::MandatoryInformationMissing(_) => ErrorKind::MandatoryInformationMissing,
            Error::ProtocolNotify(_) | Error::NoProposalChosen => ErrorKind::ProtocolNotify,
            Error::RepeatState => ErrorKind::RepeatState,
            Error::RepeatStateCookie(_) => ErrorKind::RepeatStateCookie,
            Error::SynchFailure => ErrorKind::SynchFailure,
            _ => ErrorKind::OtherError,
        }
    }

    /// Whether the driver should run the same state again
    pub fn is_repeat(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RepeatState | ErrorKind::RepeatStateCookie | ErrorKind::SynchFailure
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidMessage(msg) => write!(f, "Invalid IKE message: {}", msg),
            Error::InvalidPayload(msg) => write!(f, "Invalid IKE payload: {}", msg),
            Error::InvalidNas(msg) => write!(f, "Invalid EAP/NAS message: {}", msg),
            Error::UnsupportedVersion(v) => {
                write!(f, "Unsupported IKE version: 0x{:02x}", v)
            }
            Error::MessageTooLarge(len) => write!(f, "Message too large: {} bytes", len),
            Error::UnsupportedExchangeType(t) => {
                write!(f, "Unsupported exchange type: {}", t)
            }
            Error::UnsupportedAlgorithm(alg) => write!(f, "Unsupported algorithm: {}", alg),
            Error::NoProposalChosen => {
                write!(f, "No acceptable proposal found in negotiation")
            }
            Error::InvalidProposal(msg) => write!(f, "Invalid proposal: {}", msg),
            Error::AuthenticationFailed(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            Error::MandatoryInformationMissing(what) => {
                write!(f, "Mandatory information missing: {}", what)
            }
            Error::ProtocolNotify(code) => {
                write!(f, "Peer error notify: {}", code)
            }
            Error::Timeout => write!(f, "Timed out waiting for peer"),
            Error::RepeatState => write!(f, "State must be repeated"),
            Error::RepeatStateCookie(cookie) => {
                write!(f, "State must be repeated with cookie ({} bytes)", cookie.len())
            }
            Error::SynchFailure => write!(f, "Sequence number synchronisation failure"),
            Error::SaNotFound(id) => write!(f, "Security Association not found: {}", id),
            Error::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::IntegrityCheckFailed => write!(f, "Integrity check failed"),
            Error::InvalidKeyLength { expected, actual } => {
                write!(f, "Invalid key length: expected {}, got {}", expected, actual)
            }
            Error::InvalidIvLength { expected, actual } => {
                write!(f, "Invalid IV length: expected {}, got {}", expected, actual)
            }
            Error::InvalidLength { expected, actual } => {
                write!(
                    f,
                    "Invalid length: expected {}, got {}",
                    expected, actual
                )
            }
            Error::BufferTooShort {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too short: need {} bytes, have {}",
                    required, available
                )
            }
            Error::InvalidSpi(spi) => write!(f, "Invalid SPI: 0x{:08x}", spi),
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::VectorProvider(msg) => write!(f, "Vector provider error: {}", msg),
            Error::ChannelClosed => write!(f, "Control channel closed"),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

// Convert from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            return Error::Timeout;
        }
        Error::Io(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

impl From<n3ue_platform::PlatformError> for Error {
    fn from(err: n3ue_platform::PlatformError) -> Self {
        match err {
            n3ue_platform::PlatformError::Io(e) => Error::Io(e.to_string()),
            other => Error::VectorProvider(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidMessage("test".to_string());
        assert_eq!(err.to_string(), "Invalid IKE message: test");

        let err = Error::UnsupportedVersion(0x10);
        assert_eq!(err.to_string(), "Unsupported IKE version: 0x10");

        let err = Error::InvalidLength {
            expected: 10,
            actual: 5,
        };
        assert_eq!(err.to_string(), "Invalid length: expected 10, got 5");

        let err = Error::ProtocolNotify(14);
        assert_eq!(err.to_string(), "Peer error notify: 14");
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            Error::InvalidPayload("x".into()).kind(),
            ErrorKind::DecodingError
        );
        assert_eq!(
            Error::MandatoryInformationMissing("KE".into()).kind(),
            ErrorKind::MandatoryInformationMissing
        );
        assert_eq!(Error::ProtocolNotify(24).kind(), ErrorKind::ProtocolNotify);
        assert_eq!(
            Error::RepeatStateCookie(vec![1, 2]).kind(),
            ErrorKind::RepeatStateCookie
        );
        assert_eq!(Error::SynchFailure.kind(), ErrorKind::SynchFailure);
        assert_eq!(Error::Other("x".into()).kind(), ErrorKind::OtherError);
        assert_eq!(ErrorKind::SynchFailure.to_string(), "SYNCH_FAILURE");
    }

    #[test]
    fn test_is_repeat() {
        assert!(Error::RepeatState.is_repeat());
        assert!(Error::SynchFailure.is_repeat());
        assert!(!Error::Timeout.is_repeat());
        assert!(!Error::ProtocolNotify(7).is_repeat());
    }

    #[test]
    fn test_error_clone() {
        let err1 = Error::NoProposalChosen;
        let err2 = err1.clone();
        assert_eq!(err1, err2);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        match err {
            Error::Io(msg) => assert!(msg.contains("file not found")),
            _ => panic!("Expected Io error"),
        }

        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(Error::from(io_err), Error::Timeout);
    }

    #[test]
    fn test_buffer_too_short() {
        let err = Error::BufferTooShort {
            required: 100,
            available: 50,
        };
        assert!(err.to_string().contains("Buffer too short"));
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("50"));
    }
}
