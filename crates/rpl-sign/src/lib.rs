//! Image signing: Ed25519 signatures over registry digests.
//!
//! Private key material lives only for the duration of a single `sign` call.
//! Verification needs nothing but the public key, so deploy stages never touch
//! the private key.

pub mod error;
pub mod keys;
pub mod secrets;
pub mod service;

pub use error::*;
pub use keys::*;
pub use secrets::*;
pub use service::*;
