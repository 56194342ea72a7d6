//! Subscriber side of 5G and EPC authentication
//!
//! - [`milenage`]: the f1..f5* functions and a local vector provider
//! - [`kdf`]: the key hierarchy below CK/IK for 5G-AKA, EAP-AKA and EAP-AKA'
//! - [`vector`]: challenge bookkeeping and fast reauthentication state
//! - [`nas`]: the 5GMM/5GSM messages a UE sends and accepts, with NAS security
//! - [`snow3g`], [`zuc`]: the stream ciphers behind 5G-EA1/IA1 and 5G-EA3/IA3

pub mod kdf;
pub mod milenage;
pub mod nas;
pub mod snow3g;
pub mod vector;
pub mod zuc;

pub use milenage::{Milenage, MilenageProvider};
pub use nas::{NasMessage, NasSecurityContext};
pub use vector::AuthenticationContext;
