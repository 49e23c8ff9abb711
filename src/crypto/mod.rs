//! Cryptography primitives
//!
//! Content addressing, envelope encryption, and key material.

pub mod encryption;
pub mod hashing;
pub mod keys;

pub use encryption::{open, seal, EncryptionError, XCHACHA20_POLY1305};
pub use hashing::{verify_payload, ContentHash, ShardId};
pub use keys::{generate_identity, identity_from_secret, SessionKey};
