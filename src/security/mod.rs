//! Security gateway
//!
//! Seals exchange messages, authenticates peers against their pinned keys,
//! and enforces read grants on sensitive shards.

mod access;
mod gateway;

pub use access::AccessPolicy;
pub use gateway::{
    fresh_challenge, handshake_message, Envelope, HandshakeRole, PeerCredentials, SecurityError, SecurityGateway,
};
