//! Security gateway: envelope sealing, peer authentication, access control
//!
//! Every exchange message crosses this boundary. The session key comes from the
//! external session-establishment layer and is never generated here.

use libp2p::identity::PublicKey;
use libp2p::PeerId;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::access::AccessPolicy;
use crate::crypto::{self, EncryptionError, SessionKey, ShardId, XCHACHA20_POLY1305};

/// Domain separation prefixes for handshake signatures, one per direction
const RESPONDER_DOMAIN: &[u8] = b"shardsync-hello";
const INITIATOR_DOMAIN: &[u8] = b"shardsync-proof";

/// Length of a handshake challenge
const CHALLENGE_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

/// Wire wrapper around every exchange message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub algorithm: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    /// Bytes this envelope puts on the wire, excluding framing
    pub fn wire_size(&self) -> u64 {
        (self.algorithm.len() + self.nonce.len() + self.ciphertext.len()) as u64
    }
}

/// Which side of the mutual handshake produced a signature.
///
/// A node answers any `Hello`, so the two directions sign under different
/// prefixes and one cannot be replayed as the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Answers the initiator's challenge
    Responder,
    /// Answers the challenge returned by the responder
    Initiator,
}

/// Proof of identity presented by a peer during the handshake
#[derive(Debug, Clone)]
pub struct PeerCredentials {
    pub peer_id: PeerId,
    pub role: HandshakeRole,
    /// Key pinned for this peer in the registry
    pub pinned_key: PublicKey,
    pub challenge: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Random challenge for one handshake direction
pub fn fresh_challenge() -> Vec<u8> {
    let mut challenge = vec![0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

/// Bytes a peer in `role` signs to answer a handshake challenge
pub fn handshake_message(role: HandshakeRole, challenge: &[u8]) -> Vec<u8> {
    let domain = match role {
        HandshakeRole::Responder => RESPONDER_DOMAIN,
        HandshakeRole::Initiator => INITIATOR_DOMAIN,
    };
    let mut message = Vec::with_capacity(domain.len() + challenge.len());
    message.extend_from_slice(domain);
    message.extend_from_slice(challenge);
    message
}

pub struct SecurityGateway {
    key: SessionKey,
    access: RwLock<AccessPolicy>,
}

impl SecurityGateway {
    pub fn new(key: SessionKey) -> Self {
        Self {
            key,
            access: RwLock::new(AccessPolicy::new()),
        }
    }

    /// Seal a payload for transmission
    pub fn encrypt_data(&self, payload: &[u8]) -> Result<Envelope, SecurityError> {
        let (nonce, ciphertext) = crypto::seal(&self.key, payload)?;
        Ok(Envelope {
            algorithm: XCHACHA20_POLY1305.to_string(),
            nonce,
            ciphertext,
        })
    }

    /// Open an envelope sealed with the session key
    pub fn decrypt_data(&self, envelope: &Envelope) -> Result<Vec<u8>, SecurityError> {
        if envelope.algorithm != XCHACHA20_POLY1305 {
            return Err(EncryptionError::UnsupportedAlgorithm(envelope.algorithm.clone()).into());
        }
        Ok(crypto::open(&self.key, &envelope.nonce, &envelope.ciphertext)?)
    }

    /// Verify a handshake signature against the pinned key.
    ///
    /// Fails closed: any malformed input yields `false`.
    pub fn authenticate_peer(&self, credentials: &PeerCredentials) -> bool {
        if credentials.challenge.is_empty() || credentials.signature.is_empty() {
            warn!("Empty handshake from {}", credentials.peer_id);
            return false;
        }

        if PeerId::from_public_key(&credentials.pinned_key) != credentials.peer_id {
            warn!("Pinned key does not match identity of {}", credentials.peer_id);
            return false;
        }

        let verified = credentials.pinned_key.verify(
            &handshake_message(credentials.role, &credentials.challenge),
            &credentials.signature,
        );
        if !verified {
            warn!("Handshake signature from {} rejected", credentials.peer_id);
        }
        verified
    }

    /// Whether `peer` may receive `shard`
    pub async fn check_access(&self, peer: &PeerId, shard: &ShardId) -> bool {
        self.access.read().await.allows(peer, shard)
    }

    pub async fn mark_sensitive(&self, shard: ShardId) {
        self.access.write().await.mark_sensitive(shard);
        debug!("Shard {} marked sensitive", shard);
    }

    pub async fn grant_access(&self, peer: PeerId, shard: ShardId) {
        self.access.write().await.grant(peer, shard);
    }

    pub async fn revoke_access(&self, peer: &PeerId, shard: &ShardId) {
        self.access.write().await.revoke(peer, shard);
    }

    /// Forget every grant held by a removed peer
    pub async fn forget_peer(&self, peer: &PeerId) {
        self.access.write().await.revoke_all(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{identity_from_secret, ContentHash};

    fn gateway() -> SecurityGateway {
        SecurityGateway::new(SessionKey::derive(b"session"))
    }

    fn credentials(signer: u8, pinned: u8, challenge: &[u8]) -> PeerCredentials {
        let signer = identity_from_secret([signer; 32]).unwrap();
        let pinned = identity_from_secret([pinned; 32]).unwrap();
        PeerCredentials {
            peer_id: PeerId::from(pinned.public()),
            role: HandshakeRole::Responder,
            pinned_key: pinned.public(),
            challenge: challenge.to_vec(),
            signature: signer
                .sign(&handshake_message(HandshakeRole::Responder, challenge))
                .unwrap(),
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let gateway = gateway();
        let envelope = gateway.encrypt_data(b"summary request").unwrap();
        assert_eq!(envelope.algorithm, XCHACHA20_POLY1305);
        assert_eq!(gateway.decrypt_data(&envelope).unwrap(), b"summary request");
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let gateway = gateway();
        let mut envelope = gateway.encrypt_data(b"x").unwrap();
        envelope.algorithm = "rot13".to_string();
        assert!(matches!(
            gateway.decrypt_data(&envelope),
            Err(SecurityError::Encryption(EncryptionError::UnsupportedAlgorithm(_)))
        ));
    }

    #[test]
    fn test_authenticate_valid_signature() {
        assert!(gateway().authenticate_peer(&credentials(1, 1, b"nonce-123")));
    }

    #[test]
    fn test_authenticate_fails_closed() {
        let gateway = gateway();
        // Signed by a key other than the pinned one
        assert!(!gateway.authenticate_peer(&credentials(2, 1, b"nonce")));
        // Garbage signature
        let mut garbage = credentials(1, 1, b"nonce");
        garbage.signature = vec![0xff; 3];
        assert!(!gateway.authenticate_peer(&garbage));
        // Empty challenge
        assert!(!gateway.authenticate_peer(&credentials(1, 1, b"")));
        // Identity not bound to the pinned key
        let mut rebound = credentials(1, 1, b"nonce");
        rebound.peer_id = PeerId::random();
        assert!(!gateway.authenticate_peer(&rebound));
    }

    #[test]
    fn test_responder_signature_not_accepted_as_proof() {
        let gateway = gateway();
        let mut reflected = credentials(1, 1, b"nonce");
        reflected.role = HandshakeRole::Initiator;
        assert!(!gateway.authenticate_peer(&reflected));
    }

    #[tokio::test]
    async fn test_check_access_default_deny_for_sensitive() {
        let gateway = gateway();
        let peer = PeerId::random();
        let shard = ShardId::derive("g", &ContentHash::of(b"secret"));

        assert!(gateway.check_access(&peer, &shard).await);
        gateway.mark_sensitive(shard).await;
        assert!(!gateway.check_access(&peer, &shard).await);
        gateway.grant_access(peer, shard).await;
        assert!(gateway.check_access(&peer, &shard).await);
        gateway.revoke_access(&peer, &shard).await;
        assert!(!gateway.check_access(&peer, &shard).await);
    }
}
