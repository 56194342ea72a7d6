//! IPSec cryptographic operations
//!
//! This module provides cryptographic primitives for IKEv2 and ESP:
//! - PRF and integrity algorithms, IKE and Child SA key derivation
//! - Block and AEAD ciphers shared by SK payloads and ESP
//! - MODP Diffie-Hellman groups
//! - SK payload protection

pub mod cipher;
pub mod dh;
pub mod prf;
pub mod sk;

pub use cipher::*;
pub use dh::*;
pub use prf::*;
pub use sk::SkCodec;
