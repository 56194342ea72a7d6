//! # n3ue Platform
//!
//! Shared types and collaborator traits for the n3ue non-3GPP UE emulator.
//!
//! This crate provides:
//! - Unified error types (`PlatformError`, `PlatformResult`)
//! - Collaborator traits (`Collaborator`, `AuthVectorProvider`, `PacketDevice`)
//! - The authentication-vector data exchanged at the provider seam
//!
//! The protocol engine in `n3ue-proto` depends only on these traits, so a
//! SIM reader, a remote vector server or a local Milenage implementation
//! can be plugged in without touching the state machine.
//!
//! # Examples
//!
//! ```
//! use n3ue_platform::{PlatformError, PlatformResult, VectorResponse};
//!
//! fn classify(resp: &VectorResponse) -> PlatformResult<&[u8]> {
//!     match resp {
//!         VectorResponse::Success { res, .. } => Ok(res),
//!         VectorResponse::SyncFailure { .. } => {
//!             Err(PlatformError::Security("resync required".into()))
//!         }
//!     }
//! }
//!
//! # fn main() -> PlatformResult<()> {
//! let resp = VectorResponse::Success {
//!     res: vec![1; 8],
//!     ck: vec![2; 16],
//!     ik: vec![3; 16],
//! };
//! assert_eq!(classify(&resp)?.len(), 8);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{PlatformError, PlatformResult};
pub use traits::{AuthVectorProvider, Collaborator, PacketDevice, VectorResponse};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
