//! Error types shared by collaborators

use std::fmt;

/// Error type returned by collaborators (vector providers, packet devices)
#[derive(Debug)]
pub enum PlatformError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error reported by the collaborator
    Protocol(String),

    /// Security error (MAC failure, rejected challenge, etc.)
    Security(String),

    /// Collaborator is not reachable or not ready
    Unavailable(String),

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformError::Io(e) => write!(f, "IO error: {}", e),
            PlatformError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PlatformError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PlatformError::Security(msg) => write!(f, "Security error: {}", msg),
            PlatformError::Unavailable(msg) => write!(f, "Collaborator unavailable: {}", msg),
            PlatformError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            PlatformError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlatformError::Io(e) => Some(e),
            PlatformError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PlatformError {
    fn from(err: std::io::Error) -> Self {
        PlatformError::Io(err)
    }
}

/// Result type for collaborator operations
pub type PlatformResult<T> = Result<T, PlatformError>;
