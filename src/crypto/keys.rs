//! Session and identity key material
//!
//! The symmetric session key is established by an external key-exchange layer
//! and handed to us as a shared secret. We only stretch it into a fixed-size
//! key and make sure it is wiped on drop.

use libp2p::identity::{self, Keypair};
use zeroize::ZeroizeOnDrop;

/// Symmetric key used to seal exchange envelopes
#[derive(Clone, ZeroizeOnDrop)]
pub struct SessionKey {
    key: [u8; 32],
}

impl SessionKey {
    /// Derive a session key from the secret agreed by the session-establishment layer
    pub fn derive(shared_secret: &[u8]) -> Self {
        Self {
            key: blake3::derive_key("shardsync session key v1", shared_secret),
        }
    }

    /// Use raw key bytes as-is
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Generate a fresh ed25519 identity for a node
pub fn generate_identity() -> Keypair {
    Keypair::generate_ed25519()
}

/// Build an ed25519 identity from a fixed 32-byte secret
pub fn identity_from_secret(secret: [u8; 32]) -> Result<Keypair, identity::DecodingError> {
    let key = identity::ed25519::SecretKey::try_from_bytes(secret)?;
    Ok(Keypair::from(identity::ed25519::Keypair::from(key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_deterministic() {
        let a = SessionKey::derive(b"ratchet output");
        let b = SessionKey::derive(b"ratchet output");
        let c = SessionKey::derive(b"other output");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_identity_from_secret_is_stable() {
        let a = identity_from_secret([7u8; 32]).unwrap();
        let b = identity_from_secret([7u8; 32]).unwrap();
        assert_eq!(a.public(), b.public());
    }
}
