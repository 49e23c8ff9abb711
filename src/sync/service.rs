//! Responder side of the exchange protocol
//!
//! Answers sealed requests from other nodes. A caller must first complete the
//! mutual handshake against the key pinned for it in the registry; until then
//! only `Hello`, `Prove` and `Ping` are answered. Incoming shards go through the
//! same validation and resolution path as shards fetched by the orchestrator.

use async_trait::async_trait;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::replicas::ReplicaMap;
use crate::crypto::{ContentHash, ShardId};
use crate::integrity::IntegrityVerifier;
use crate::network::{InboundHandler, SyncRequest, SyncResponse};
use crate::peers::{PeerRegistry, ReputationOutcome};
use crate::resolver::ConflictResolver;
use crate::security::{
    fresh_challenge, handshake_message, Envelope, HandshakeRole, PeerCredentials, SecurityGateway,
};
use crate::storage::{Shard, ShardStore, ShardSummary};

/// Outstanding challenges kept per peer; older ones are dropped first
const PENDING_CHALLENGES: usize = 4;

pub struct SyncService {
    keypair: Keypair,
    store: Arc<ShardStore>,
    resolver: Arc<ConflictResolver>,
    gateway: Arc<SecurityGateway>,
    registry: Arc<PeerRegistry>,
    replicas: Arc<ReplicaMap>,
    /// Challenges this node issued and has not seen answered yet
    pending: Mutex<HashMap<PeerId, Vec<Vec<u8>>>>,
    /// Peers that proved their pinned key
    admitted: RwLock<HashSet<PeerId>>,
}

impl SyncService {
    pub fn new(
        keypair: Keypair,
        store: Arc<ShardStore>,
        resolver: Arc<ConflictResolver>,
        gateway: Arc<SecurityGateway>,
        registry: Arc<PeerRegistry>,
        replicas: Arc<ReplicaMap>,
    ) -> Self {
        Self {
            keypair,
            store,
            resolver,
            gateway,
            registry,
            replicas,
            pending: Mutex::new(HashMap::new()),
            admitted: RwLock::new(HashSet::new()),
        }
    }

    /// Answer one decoded request
    pub async fn respond(&self, from: PeerId, request: SyncRequest) -> SyncResponse {
        match request {
            SyncRequest::Hello { challenge } => return self.hello(from, challenge).await,
            SyncRequest::Prove { signature } => return self.prove(from, signature).await,
            SyncRequest::Ping => return SyncResponse::Pong,
            _ => {}
        }

        if !self.is_admitted(&from).await {
            debug!("Refusing request from unauthenticated {}", from);
            return SyncResponse::Unauthorized;
        }

        match request {
            SyncRequest::Summary => self.summary_for(&from).await,
            SyncRequest::FetchShard { shard_id } => self.serve_shard(&from, shard_id).await,
            SyncRequest::StoreShard { shard, supersedes } => self.accept_shard(from, shard, supersedes).await,
            SyncRequest::Peers => SyncResponse::Peers {
                peers: self.registry.adverts(&from).await,
            },
            SyncRequest::Hello { .. } | SyncRequest::Prove { .. } | SyncRequest::Ping => SyncResponse::Error {
                message: "handshake request out of place".to_string(),
            },
        }
    }

    /// Drop any admission or outstanding challenge held for `peer`
    pub async fn forget_peer(&self, peer: &PeerId) {
        self.admitted.write().await.remove(peer);
        self.pending.lock().await.remove(peer);
    }

    async fn is_admitted(&self, peer: &PeerId) -> bool {
        // Removal from the registry revokes admission as well
        self.admitted.read().await.contains(peer) && self.registry.contains(peer).await
    }

    // Sign the caller's challenge and hand back one for it to sign.
    async fn hello(&self, from: PeerId, challenge: Vec<u8>) -> SyncResponse {
        if challenge.is_empty() || !self.registry.contains(&from).await {
            warn!("Hello from unregistered peer {}", from);
            return SyncResponse::Unauthorized;
        }

        let signature = match self.keypair.sign(&handshake_message(HandshakeRole::Responder, &challenge)) {
            Ok(signature) => signature,
            Err(e) => {
                return SyncResponse::Error {
                    message: format!("signing failed: {}", e),
                }
            }
        };

        let ours = fresh_challenge();
        let mut pending = self.pending.lock().await;
        let issued = pending.entry(from).or_default();
        if issued.len() >= PENDING_CHALLENGES {
            issued.remove(0);
        }
        issued.push(ours.clone());

        SyncResponse::Hello {
            signature,
            challenge: ours,
        }
    }

    async fn prove(&self, from: PeerId, signature: Vec<u8>) -> SyncResponse {
        let Some(peer) = self.registry.get_peer(&from).await else {
            return SyncResponse::Unauthorized;
        };
        let issued = self.pending.lock().await.get(&from).cloned().unwrap_or_default();

        let answered = issued.into_iter().find(|challenge| {
            self.gateway.authenticate_peer(&PeerCredentials {
                peer_id: from,
                role: HandshakeRole::Initiator,
                pinned_key: peer.public_key.clone(),
                challenge: challenge.clone(),
                signature: signature.clone(),
            })
        });
        let Some(answered) = answered else {
            warn!("Peer {} failed to prove its pinned key", from);
            if let Err(e) = self
                .registry
                .update_reputation(&from, ReputationOutcome::IntegrityViolation)
                .await
            {
                debug!("No reputation to penalize for {}: {}", from, e);
            }
            return SyncResponse::Unauthorized;
        };

        if let Some(issued) = self.pending.lock().await.get_mut(&from) {
            issued.retain(|challenge| *challenge != answered);
        }
        self.admitted.write().await.insert(from);
        debug!("Admitted {}", from);
        SyncResponse::Welcome
    }

    // Sensitive shards the requester may not read are left out entirely.
    async fn summary_for(&self, peer: &PeerId) -> SyncResponse {
        let full = match self.store.summary() {
            Ok(summary) => summary,
            Err(e) => return SyncResponse::Error { message: e.to_string() },
        };

        let mut summary = ShardSummary::new();
        for (id, digest) in full {
            if self.gateway.check_access(peer, &id).await {
                summary.insert(id, digest);
            }
        }

        let merkle_root = IntegrityVerifier::root_of_summary(&summary);
        SyncResponse::Summary { summary, merkle_root }
    }

    async fn serve_shard(&self, peer: &PeerId, shard_id: ShardId) -> SyncResponse {
        if !self.gateway.check_access(peer, &shard_id).await {
            warn!("Denied shard {} to {}", shard_id, peer);
            return SyncResponse::Denied { shard_id };
        }

        match self.store.find(&shard_id) {
            Ok(Some(shard)) if shard.is_valid() => SyncResponse::Shard { shard },
            Ok(Some(_)) => {
                warn!("Not serving corrupt local copy of {}", shard_id);
                SyncResponse::NotFound { shard_id }
            }
            Ok(None) => SyncResponse::NotFound { shard_id },
            Err(e) => SyncResponse::Error { message: e.to_string() },
        }
    }

    async fn accept_shard(&self, from: PeerId, shard: Shard, supersedes: Option<ContentHash>) -> SyncResponse {
        let shard_id = shard.id;

        if !ShardStore::validate_shard(&shard) {
            warn!("Rejected shard {} from {}: hash mismatch", shard_id, from);
            return SyncResponse::Rejected {
                shard_id,
                reason: "hash mismatch".to_string(),
            };
        }

        // The sender diffed against a version we no longer hold
        let current = match self.store.find(&shard_id) {
            Ok(current) => current,
            Err(e) => return SyncResponse::Error { message: e.to_string() },
        };
        if let (Some(expected), Some(current)) = (supersedes, current.as_ref()) {
            if current.is_valid() && current.hash != expected {
                debug!("Stale push of {} from {}", shard_id, from);
                return SyncResponse::Rejected {
                    shard_id,
                    reason: "stale".to_string(),
                };
            }
        }

        let held = match self.resolver.settle(&shard) {
            Ok(settled) => settled.held(),
            Err(e) => {
                warn!("Conflict on pushed shard {}: {}", shard_id, e);
                return SyncResponse::Rejected {
                    shard_id,
                    reason: e.to_string(),
                };
            }
        };

        self.replicas.add_holder(shard_id, from).await;
        info!("Stored shard {} pushed by {}", shard_id, from);
        SyncResponse::Stored { shard_id, hash: held }
    }

    fn seal(&self, response: &SyncResponse) -> Envelope {
        let sealed = serde_json::to_vec(response)
            .map_err(|e| e.to_string())
            .and_then(|plain| self.gateway.encrypt_data(&plain).map_err(|e| e.to_string()));

        match sealed {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Failed to seal response: {}", e);
                // Fails to open on the other side, which surfaces as an exchange error
                Envelope {
                    algorithm: String::new(),
                    nonce: Vec::new(),
                    ciphertext: Vec::new(),
                }
            }
        }
    }
}

#[async_trait]
impl InboundHandler for SyncService {
    async fn handle(&self, from: PeerId, envelope: Envelope) -> Envelope {
        let request = self
            .gateway
            .decrypt_data(&envelope)
            .map_err(|e| e.to_string())
            .and_then(|plain| serde_json::from_slice::<SyncRequest>(&plain).map_err(|e| e.to_string()));

        let response = match request {
            Ok(request) => self.respond(from, request).await,
            Err(message) => {
                warn!("Unreadable request from {}: {}", from, message);
                SyncResponse::Error { message }
            }
        };

        self.seal(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{identity_from_secret, SessionKey};
    use crate::peers::{Peer, ReputationConfig};
    use crate::storage::RedundancyGroup;

    struct Fixture {
        store: Arc<ShardStore>,
        gateway: Arc<SecurityGateway>,
        registry: Arc<PeerRegistry>,
        service: SyncService,
    }

    fn service() -> Fixture {
        let store = Arc::new(ShardStore::open_temporary(4096).unwrap());
        let gateway = Arc::new(SecurityGateway::new(SessionKey::derive(b"cluster")));
        let registry = Arc::new(PeerRegistry::new(ReputationConfig::default(), 8));
        let service = SyncService::new(
            identity_from_secret([1; 32]).unwrap(),
            store.clone(),
            Arc::new(ConflictResolver::new(store.clone())),
            gateway.clone(),
            registry.clone(),
            Arc::new(ReplicaMap::new()),
        );
        Fixture {
            store,
            gateway,
            registry,
            service,
        }
    }

    async fn register(fixture: &Fixture, n: u8) -> Keypair {
        let keypair = identity_from_secret([n; 32]).unwrap();
        fixture
            .registry
            .add_peer(Peer::new(format!("/memory/{}", n).parse().unwrap(), keypair.public()))
            .await
            .unwrap();
        keypair
    }

    async fn hello(fixture: &Fixture, peer: PeerId) -> (Vec<u8>, Vec<u8>) {
        match fixture
            .service
            .respond(peer, SyncRequest::Hello { challenge: b"abc".to_vec() })
            .await
        {
            SyncResponse::Hello { signature, challenge } => (signature, challenge),
            other => panic!("unexpected response {:?}", other),
        }
    }

    // Registered peer that completed the handshake
    async fn admitted(fixture: &Fixture, n: u8) -> PeerId {
        let keypair = register(fixture, n).await;
        let peer = PeerId::from(keypair.public());
        let (_, challenge) = hello(fixture, peer).await;
        let signature = keypair
            .sign(&handshake_message(HandshakeRole::Initiator, &challenge))
            .unwrap();
        assert_eq!(
            fixture.service.respond(peer, SyncRequest::Prove { signature }).await,
            SyncResponse::Welcome
        );
        peer
    }

    #[tokio::test]
    async fn test_hello_is_signed_by_node_key() {
        let fixture = service();
        let keypair = identity_from_secret([1; 32]).unwrap();
        let peer = PeerId::from(register(&fixture, 2).await.public());

        let (signature, challenge) = hello(&fixture, peer).await;
        assert!(keypair
            .public()
            .verify(&handshake_message(HandshakeRole::Responder, b"abc"), &signature));
        assert!(!keypair
            .public()
            .verify(&handshake_message(HandshakeRole::Initiator, b"abc"), &signature));
        assert!(!challenge.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_peer_is_refused() {
        let fixture = service();
        let stranger = PeerId::random();
        let shard = Shard::new(RedundancyGroup::overwrite("g"), b"pushed".to_vec(), 1);

        assert_eq!(
            fixture
                .service
                .respond(stranger, SyncRequest::Hello { challenge: b"abc".to_vec() })
                .await,
            SyncResponse::Unauthorized
        );
        assert_eq!(
            fixture.service.respond(stranger, SyncRequest::Summary).await,
            SyncResponse::Unauthorized
        );
        assert_eq!(
            fixture
                .service
                .respond(
                    stranger,
                    SyncRequest::StoreShard {
                        shard: shard.clone(),
                        supersedes: None
                    }
                )
                .await,
            SyncResponse::Unauthorized
        );
        assert!(!fixture.store.has(&shard.id).unwrap());
        assert_eq!(fixture.service.respond(stranger, SyncRequest::Ping).await, SyncResponse::Pong);
    }

    #[tokio::test]
    async fn test_registered_peer_must_prove_key() {
        let fixture = service();
        let keypair = register(&fixture, 2).await;
        let peer = PeerId::from(keypair.public());

        assert_eq!(
            fixture.service.respond(peer, SyncRequest::Peers).await,
            SyncResponse::Unauthorized
        );

        // Replaying a responder-side signature is not a proof
        let (_, challenge) = hello(&fixture, peer).await;
        let reflected = keypair
            .sign(&handshake_message(HandshakeRole::Responder, &challenge))
            .unwrap();
        assert_eq!(
            fixture
                .service
                .respond(peer, SyncRequest::Prove { signature: reflected })
                .await,
            SyncResponse::Unauthorized
        );
        assert!(fixture.registry.get_reputation(&peer).await.unwrap() < 0.5);
        assert_eq!(
            fixture.service.respond(peer, SyncRequest::Summary).await,
            SyncResponse::Unauthorized
        );

        let signature = keypair
            .sign(&handshake_message(HandshakeRole::Initiator, &challenge))
            .unwrap();
        assert_eq!(
            fixture.service.respond(peer, SyncRequest::Prove { signature }).await,
            SyncResponse::Welcome
        );
        assert!(matches!(
            fixture.service.respond(peer, SyncRequest::Summary).await,
            SyncResponse::Summary { .. }
        ));
    }

    #[tokio::test]
    async fn test_admission_revoked_with_peer() {
        let fixture = service();
        let peer = admitted(&fixture, 2).await;
        let other = admitted(&fixture, 3).await;

        fixture.service.forget_peer(&peer).await;
        assert_eq!(
            fixture.service.respond(peer, SyncRequest::Summary).await,
            SyncResponse::Unauthorized
        );

        fixture.registry.remove_peer(&other).await;
        assert_eq!(
            fixture.service.respond(other, SyncRequest::Summary).await,
            SyncResponse::Unauthorized
        );
    }

    #[tokio::test]
    async fn test_sensitive_shard_hidden_and_denied() {
        let fixture = service();
        let open = fixture
            .store
            .create_shard(RedundancyGroup::overwrite("g"), b"open".to_vec())
            .unwrap();
        let secret = fixture
            .store
            .create_shard(RedundancyGroup::overwrite("g"), b"secret".to_vec())
            .unwrap();
        fixture.gateway.mark_sensitive(secret).await;
        let peer = admitted(&fixture, 2).await;

        match fixture.service.respond(peer, SyncRequest::Summary).await {
            SyncResponse::Summary { summary, .. } => {
                assert!(summary.contains_key(&open));
                assert!(!summary.contains_key(&secret));
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert!(matches!(
            fixture
                .service
                .respond(peer, SyncRequest::FetchShard { shard_id: secret })
                .await,
            SyncResponse::Denied { .. }
        ));

        fixture.gateway.grant_access(peer, secret).await;
        assert!(matches!(
            fixture
                .service
                .respond(peer, SyncRequest::FetchShard { shard_id: secret })
                .await,
            SyncResponse::Shard { .. }
        ));
    }

    #[tokio::test]
    async fn test_store_rejects_corrupt_and_stale() {
        let fixture = service();
        let store = &fixture.store;
        let peer = admitted(&fixture, 2).await;

        let mut corrupt = Shard::new(RedundancyGroup::overwrite("g"), b"ok".to_vec(), 1);
        corrupt.payload = b"not ok".to_vec();
        assert!(matches!(
            fixture
                .service
                .respond(peer, SyncRequest::StoreShard { shard: corrupt.clone(), supersedes: None })
                .await,
            SyncResponse::Rejected { .. }
        ));
        assert!(!store.has(&corrupt.id).unwrap());

        let id = store
            .create_shard(RedundancyGroup::overwrite("g"), b"local".to_vec())
            .unwrap();
        let local = store.get(&id).unwrap();
        let pushed = local.next_version(b"remote".to_vec(), local.timestamp + 10);
        let stale = SyncRequest::StoreShard {
            shard: pushed.clone(),
            supersedes: Some(ContentHash::of(b"something else")),
        };
        assert!(matches!(
            fixture.service.respond(peer, stale).await,
            SyncResponse::Rejected { reason, .. } if reason == "stale"
        ));

        let fresh = SyncRequest::StoreShard {
            shard: pushed.clone(),
            supersedes: Some(local.hash),
        };
        assert!(matches!(
            fixture.service.respond(peer, fresh).await,
            SyncResponse::Stored { hash, .. } if hash == pushed.hash
        ));
        assert_eq!(store.get(&id).unwrap(), pushed);
        assert_eq!(store.audit_trail().unwrap()[0].discarded, vec![local]);
    }

    #[tokio::test]
    async fn test_garbage_envelope_gets_error_reply() {
        let fixture = service();
        let reply = fixture
            .service
            .handle(
                PeerId::random(),
                Envelope {
                    algorithm: "xchacha20-poly1305".to_string(),
                    nonce: vec![0; 24],
                    ciphertext: vec![1, 2, 3],
                },
            )
            .await;

        let opened = fixture.gateway.decrypt_data(&reply).unwrap();
        let response: SyncResponse = serde_json::from_slice(&opened).unwrap();
        assert!(matches!(response, SyncResponse::Error { .. }));
    }
}
