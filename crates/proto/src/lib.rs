//! Protocol engine of a non-3GPP UE emulator.
//!
//! The crate drives a UE through untrusted non-3GPP access: towards an
//! N3IWF over NWu (5GC) or an ePDG over SWu (EPC). It contains:
//!
//! - **IKEv2** with EAP-5G, EAP-AKA and EAP-AKA' authentication (RFC 7296, TS 24.502)
//! - **ESP** tunnel data path with NAT-T and GRE for the user plane (RFC 4303, RFC 3948)
//! - **NAS** 5GMM/5GSM messaging with NAS security (TS 24.501, TS 33.501)
//! - **Milenage** and the subscriber key hierarchy (TS 35.206, TS 33.501 Annex A)
//!
//! # Features
//!
//! - `ipsec` (default) - IKEv2/ESP engine and the UE driver
//! - `serde` - serialization of configuration types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use n3ue_proto::ipsec::{UeClient, UeConfig};
//! use n3ue_proto::mobile::MilenageProvider;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = UeConfig::builder()
//!     .with_imsi("208930000000003")
//!     .with_ki_hex("8baf473f2f8fd09487cccbd7097c6862")?
//!     .with_opc_hex("8e27b6af0e692e750f32667a3b14605d")?
//!     .with_server("10.0.0.1".parse()?)
//!     .build()?;
//! let provider = Arc::new(MilenageProvider::new(config.milenage()));
//!
//! let mut ue = UeClient::new(config, provider);
//! ue.run(None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - No unsafe code
//! - Constant-time comparison of MACs and authentication tokens
//! - Key material is zeroized on drop

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ipsec")]
pub mod ipsec;
#[cfg(feature = "ipsec")]
pub mod mobile;
