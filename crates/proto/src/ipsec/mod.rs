//! IKEv2 and ESP engine of the UE (NWu and SWu)
//!
//! This module implements the untrusted non-3GPP access procedures of a UE:
//!
//! - **IKEv2** (Internet Key Exchange v2) - RFC 7296
//! - **EAP-5G** over IKE_AUTH towards an N3IWF - TS 24.502
//! - **EAP-AKA / EAP-AKA'** over IKE_AUTH towards an ePDG - TS 33.402, RFC 5448
//! - **ESP** (Encapsulating Security Payload) - RFC 4303
//! - **NAT-T** (UDP encapsulation) - RFC 3948
//!
//! # Architecture
//!
//! ```text
//! UeClient (one task)
//!   ├── IKE_SA_INIT / IKE_AUTH / CREATE_CHILD_SA / INFORMATIONAL
//!   ├── EAP and NAS authentication
//!   └── operator commands
//!        │ control channel (CreateSa / UpdateSa / DeleteSa / Ike / Nas)
//!        ↓
//! Forwarder                          NasRelay
//!   ├── uplink: device → ESP           └── NAS over TCP inside the tunnel
//!   └── downlink: ESP → device, GRE, reassembly
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use n3ue_proto::ipsec::{AccessVariant, UeClient, UeConfig};
//! use n3ue_proto::mobile::MilenageProvider;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = UeConfig::builder()
//!         .with_variant(AccessVariant::Swu)
//!         .with_imsi("001010000000001")
//!         .with_ki_hex("000102030405060708090a0b0c0d0e0f")?
//!         .with_op_hex("00112233445566778899aabbccddeeff")?
//!         .with_server("192.0.2.1".parse()?)
//!         .with_dnn("ims")
//!         .build()?;
//!     let provider = Arc::new(MilenageProvider::new(config.milenage()));
//!
//!     let mut ue = UeClient::new(config, provider);
//!     ue.connect().await?;
//!     println!("Tunnel address: {:?}", ue.tunnel_address());
//!     Ok(())
//! }
//! ```
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 Protocol
//! - [RFC 4303](https://datatracker.ietf.org/doc/html/rfc4303) - ESP Protocol
//! - [RFC 3948](https://datatracker.ietf.org/doc/html/rfc3948) - NAT Traversal
//! - 3GPP TS 24.502 - Access to the 5GCN via non-3GPP access networks

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod channel;
pub mod child_sa;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod esp;
pub mod forwarder;
pub mod ikev2;
pub mod logging;
pub mod relay;
pub mod session;

// Re-export commonly used types
pub use client::{OperatorCommand, UeClient};
pub use config::UeConfig;
pub use error::{Error, ErrorKind, Result};
pub use ikev2::state::{AccessVariant, UeState};
