//! IKEv2 wire format and exchange builders for the initiator
//!
//! The UE only ever starts the IKE SA, so this module carries the
//! initiator half of RFC 7296:
//!
//! | Exchange          | Module              | Used for                              |
//! |-------------------|---------------------|---------------------------------------|
//! | IKE_SA_INIT       | [`exchange`]        | proposals, MODP DH, nonces, NAT-D     |
//! | IKE_AUTH          | [`exchange`], [`eap`] | EAP-5G (NWu) or EAP-AKA/AKA' (SWu)  |
//! | CREATE_CHILD_SA   | [`exchange`]        | IKE/child rekey, N3IWF user plane SAs |
//! | INFORMATIONAL     | [`exchange`]        | deletes and liveness                  |
//!
//! [`message`] holds the 28-byte header and the payload chain, [`payload`]
//! the payload bodies as one enum, [`proposal`] the SA payload and the
//! negotiated algorithm set. [`auth`] computes the shared key AUTH value
//! and [`state`] the establishment states of both access variants.
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 Protocol
//! - [RFC 4187](https://datatracker.ietf.org/doc/html/rfc4187) - EAP-AKA
//! - [RFC 5448](https://datatracker.ietf.org/doc/html/rfc5448) - EAP-AKA'
//! - 3GPP TS 24.502 - EAP-5G

pub mod auth;
pub mod constants;
pub mod eap;
pub mod exchange;
pub mod message;
pub mod payload;
pub mod proposal;
pub mod state;

pub use auth::*;
pub use constants::*;
pub use exchange::*;
pub use message::*;
pub use payload::*;
pub use proposal::*;
pub use state::*;
