//! One shard sync peer
//!
//! Wires the registry, store, gateway, resolver, verifier, metrics,
//! orchestrator and recovery manager together and runs the periodic loop.

use libp2p::identity::{Keypair, PublicKey};
use libp2p::{Multiaddr, PeerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ConfigHandle, ConfigUpdate, SyncConfig};
use crate::crypto::{SessionKey, ShardId};
use crate::integrity::IntegrityVerifier;
use crate::metrics::{MetricsCollector, NetworkMetrics};
use crate::network::{PeerClient, Transport};
use crate::peers::{Peer, PeerRegistry, RegistryError, ReputationConfig};
use crate::recovery::{AvailabilityReport, RecoveryError, RecoveryManager};
use crate::resolver::ConflictResolver;
use crate::security::SecurityGateway;
use crate::storage::{RedundancyGroup, Shard, ShardStore, StorageError};
use crate::sync::{ReplicaMap, RoundReport, SyncOrchestrator, SyncParts, SyncService};

pub struct ShardSyncNode {
    peer_id: PeerId,
    public_key: PublicKey,
    address: Multiaddr,
    config: ConfigHandle,
    store: Arc<ShardStore>,
    registry: Arc<PeerRegistry>,
    gateway: Arc<SecurityGateway>,
    verifier: Arc<IntegrityVerifier>,
    metrics: Arc<MetricsCollector>,
    orchestrator: Arc<SyncOrchestrator>,
    recovery: Arc<RecoveryManager>,
    service: Arc<SyncService>,
    trigger: Notify,
}

impl ShardSyncNode {
    /// Assemble a node. `session_key` comes from the session-establishment layer.
    pub async fn new(
        keypair: Keypair,
        address: Multiaddr,
        session_key: SessionKey,
        config: ConfigHandle,
        store: ShardStore,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let peer_id = PeerId::from(keypair.public());
        let snapshot = config.current().await;
        info!("Local peer ID: {}", peer_id);

        store.set_shard_size_limit(snapshot.shard_size_bytes);
        let store = Arc::new(store);
        let registry = Arc::new(PeerRegistry::new(ReputationConfig::default(), snapshot.max_peers));
        let gateway = Arc::new(SecurityGateway::new(session_key));
        let resolver = Arc::new(ConflictResolver::new(store.clone()));
        let verifier = Arc::new(IntegrityVerifier::new(store.clone()));
        let metrics = Arc::new(MetricsCollector::new(snapshot.metrics_window));
        let replicas = Arc::new(ReplicaMap::new());
        let client = PeerClient::new(transport, gateway.clone());

        let orchestrator = Arc::new(
            SyncOrchestrator::new(
                peer_id,
                config.clone(),
                SyncParts {
                    identity: keypair.clone(),
                    registry: registry.clone(),
                    store: store.clone(),
                    resolver: resolver.clone(),
                    verifier: verifier.clone(),
                    gateway: gateway.clone(),
                    metrics: metrics.clone(),
                    replicas: replicas.clone(),
                    client,
                },
            )
            .await,
        );

        let recovery = Arc::new(RecoveryManager::new(
            config.clone(),
            store.clone(),
            verifier.clone(),
            registry.clone(),
            metrics.clone(),
            gateway.clone(),
            orchestrator.clone(),
        ));

        let service = Arc::new(SyncService::new(
            keypair.clone(),
            store.clone(),
            resolver,
            gateway.clone(),
            registry.clone(),
            replicas,
        ));

        Self {
            peer_id,
            public_key: keypair.public(),
            address,
            config,
            store,
            registry,
            gateway,
            verifier,
            metrics,
            orchestrator,
            recovery,
            service,
            trigger: Notify::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn address(&self) -> &Multiaddr {
        &self.address
    }

    /// How other nodes register this one
    pub fn as_peer(&self) -> Peer {
        Peer::new(self.address.clone(), self.public_key.clone())
    }

    /// Inbound handler to attach to the transport
    pub fn service(&self) -> Arc<SyncService> {
        self.service.clone()
    }

    pub fn store(&self) -> &Arc<ShardStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<SecurityGateway> {
        &self.gateway
    }

    pub fn verifier(&self) -> &Arc<IntegrityVerifier> {
        &self.verifier
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub async fn config(&self) -> Arc<SyncConfig> {
        self.config.current().await
    }

    pub async fn add_peer(&self, peer: Peer) -> Result<(), RegistryError> {
        if peer.id == self.peer_id {
            return Ok(());
        }
        self.registry.add_peer(peer).await
    }

    /// Evict a peer and everything tracked for it
    pub async fn remove_peer(&self, peer_id: &PeerId) -> Option<Peer> {
        let removed = self.registry.remove_peer(peer_id).await;
        self.service.forget_peer(peer_id).await;
        self.gateway.forget_peer(peer_id).await;
        self.orchestrator.replicas().remove_peer(peer_id).await;
        self.orchestrator.forget_peer(peer_id).await;
        self.metrics.forget_peer(peer_id).await;
        removed
    }

    pub fn create_shard(&self, group: RedundancyGroup, payload: Vec<u8>) -> Result<ShardId, StorageError> {
        self.store.create_shard(group, payload)
    }

    pub fn update_shard(&self, shard_id: &ShardId, payload: Vec<u8>) -> Result<Shard, StorageError> {
        self.store.update_shard(shard_id, payload)
    }

    /// Validate and swap the public tunables. Limits take effect when the next
    /// round starts; a round already running keeps its snapshot.
    pub async fn update_configuration(&self, update: ConfigUpdate) -> Result<Arc<SyncConfig>, ConfigError> {
        self.config.update_configuration(update).await
    }

    pub async fn sync_now(&self) -> RoundReport {
        self.orchestrator.synchronize_with_peers().await
    }

    pub async fn discover_peers(&self) -> usize {
        self.orchestrator.discover_peers().await
    }

    pub async fn get_metrics(&self) -> NetworkMetrics {
        self.metrics.get_metrics().await
    }

    pub async fn check_data_availability(&self) -> Result<AvailabilityReport, RecoveryError> {
        self.recovery.check_data_availability().await
    }

    /// Wake the run loop for an immediate round
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run rounds every `sync_interval_ms` (re-read each tick) or on trigger,
    /// until `shutdown` turns true or its sender goes away.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Node {} running", self.peer_id);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let interval = Duration::from_millis(self.config.current().await.sync_interval_ms);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.trigger.notified() => debug!("Sync triggered on demand"),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.tick().await;
        }

        if let Err(e) = self.store.flush() {
            warn!("Failed to flush shard store: {}", e);
        }
        info!("Node {} stopped", self.peer_id);
    }

    async fn tick(&self) {
        let report = self.sync_now().await;
        debug!(
            "Round: success={} contacted={} synced={}",
            report.success, report.peers_contacted, report.peers_synced
        );

        let discovered = self.discover_peers().await;
        if discovered > 0 {
            self.trigger();
        }

        match self.recovery.sweep().await {
            Ok(sweep) => {
                if !sweep.recovered.is_empty() || !sweep.unrecovered.is_empty() {
                    info!(
                        "Recovery sweep: {} recovered, {} pending",
                        sweep.recovered.len(),
                        sweep.unrecovered.len()
                    );
                }
            }
            Err(e) => warn!("Recovery sweep failed: {}", e),
        }

        self.orchestrator.probe_demoted_peers().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity_from_secret;
    use crate::metrics::PartitionStatus;
    use crate::network::MemoryNetwork;
    use crate::peers::ReputationOutcome;
    use crate::resolver::AdditivePayload;
    use crate::storage::ResolutionStrategy;
    use crate::sync::{SyncFailure, SyncOutcome};
    use serde_json::json;

    fn test_config() -> SyncConfig {
        SyncConfig {
            exchange_timeout_ms: 500,
            backoff_base_ms: 50,
            backoff_max_ms: 1_000,
            ..Default::default()
        }
    }

    async fn spawn_node(network: &Arc<MemoryNetwork>, n: u8, config: SyncConfig) -> Arc<ShardSyncNode> {
        let keypair = identity_from_secret([n; 32]).unwrap();
        let peer_id = PeerId::from(keypair.public());
        let node = Arc::new(
            ShardSyncNode::new(
                keypair,
                format!("/memory/{}", n).parse().unwrap(),
                SessionKey::derive(b"test cluster"),
                ConfigHandle::new(config).unwrap(),
                ShardStore::open_temporary(1024 * 1024).unwrap(),
                Arc::new(network.transport_for(peer_id)),
            )
            .await,
        );
        network.register(peer_id, node.service()).await;
        node
    }

    async fn connect(a: &ShardSyncNode, b: &ShardSyncNode) {
        a.add_peer(b.as_peer()).await.unwrap();
        b.add_peer(a.as_peer()).await.unwrap();
    }

    async fn cluster(size: u8, config: SyncConfig) -> (Arc<MemoryNetwork>, Vec<Arc<ShardSyncNode>>) {
        let network = MemoryNetwork::new();
        let mut nodes = Vec::new();
        for n in 1..=size {
            nodes.push(spawn_node(&network, n, config.clone()).await);
        }
        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                connect(&nodes[i], &nodes[j]).await;
            }
        }
        (network, nodes)
    }

    #[tokio::test]
    async fn test_two_peers_converge_on_later_write() {
        let (_network, nodes) = cluster(2, test_config()).await;
        let (a, b) = (&nodes[0], &nodes[1]);

        let id = a
            .create_shard(RedundancyGroup::overwrite("ballot"), b"v1".to_vec())
            .unwrap();
        assert!(a.sync_now().await.success);
        assert_eq!(b.store().get(&id).unwrap(), a.store().get(&id).unwrap());

        let from_a = a.store().apply_update(&id, b"from a".to_vec(), 100).unwrap();
        b.store().apply_update(&id, b"from b".to_vec(), 200).unwrap();
        assert_eq!(from_a.version, 2);

        let report = a.sync_now().await;
        assert!(report.success);
        assert_eq!(report.peers_contacted, 1);

        let on_a = a.store().get(&id).unwrap();
        let on_b = b.store().get(&id).unwrap();
        assert_eq!(on_a, on_b);
        assert_eq!(on_a.payload, b"from b");
        assert_eq!(on_a.timestamp, 200);

        let trail = a.store().audit_trail().unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].strategy, ResolutionStrategy::LastWriteWins);
        assert_eq!(trail[0].discarded, vec![from_a]);
    }

    #[tokio::test]
    async fn test_additive_group_merges_concurrent_updates() {
        let (_network, nodes) = cluster(2, test_config()).await;
        let (a, b) = (&nodes[0], &nodes[1]);

        let empty = serde_json::to_vec(&json!({ "records": [], "totals": {} })).unwrap();
        let id = a.create_shard(RedundancyGroup::additive("tally"), empty).unwrap();
        a.sync_now().await;

        let vote_a = serde_json::to_vec(&json!({ "records": [{"voter": "a"}], "totals": {"yes": 1} })).unwrap();
        let vote_b = serde_json::to_vec(&json!({ "records": [{"voter": "b"}], "totals": {"no": 1} })).unwrap();
        a.store().apply_update(&id, vote_a, 100).unwrap();
        b.store().apply_update(&id, vote_b, 200).unwrap();

        assert!(a.sync_now().await.success);

        let on_a = a.store().get(&id).unwrap();
        assert_eq!(on_a, b.store().get(&id).unwrap());
        assert_eq!(on_a.version, 3);

        let payload = AdditivePayload::decode(&on_a.payload).unwrap();
        assert_eq!(payload.records.len(), 2);
        assert_eq!(payload.totals["yes"], 1);
        assert_eq!(payload.totals["no"], 1);
        assert_eq!(a.store().audit_trail().unwrap()[0].strategy, ResolutionStrategy::Merged);
    }

    #[tokio::test]
    async fn test_five_failures_drop_peer_from_selection() {
        let (_network, nodes) = cluster(3, test_config()).await;
        let a = &nodes[0];
        let (b, c) = (nodes[1].peer_id(), nodes[2].peer_id());

        assert_eq!(a.orchestrator().select_sync_peers().await.len(), 2);

        for _ in 0..5 {
            a.registry()
                .update_reputation(&b, ReputationOutcome::SyncFailure)
                .await
                .unwrap();
        }
        assert!(a.registry().get_reputation(&b).await.unwrap() < test_config().min_selection_reliability);

        let selected: Vec<_> = a
            .orchestrator()
            .select_sync_peers()
            .await
            .into_iter()
            .map(|peer| peer.id)
            .collect();
        assert_eq!(selected, vec![c]);
    }

    #[tokio::test]
    async fn test_unreachable_peer_backs_off_without_failing_round() {
        let (network, nodes) = cluster(3, test_config()).await;
        let a = &nodes[0];
        let down = nodes[1].peer_id();
        network.set_offline(down, true).await;

        let report = a.sync_now().await;
        assert!(report.success);
        assert_eq!(report.peers_contacted, 2);
        assert_eq!(report.peers_synced, 1);
        let failed = report.peers.iter().find(|r| r.peer_id == down).unwrap();
        assert!(matches!(failed.outcome, SyncOutcome::Failure(SyncFailure::Exchange(_))));

        assert_eq!(a.orchestrator().get_backoff_time(&down).await, Duration::from_millis(50));
        assert!(a.registry().get_reputation(&down).await.unwrap() < 0.5);

        // Still backing off, so the next round skips it
        let next = a.sync_now().await;
        assert_eq!(next.peers_contacted, 1);
    }

    #[tokio::test]
    async fn test_stalled_peer_times_out() {
        let config = SyncConfig {
            exchange_timeout_ms: 100,
            ..test_config()
        };
        let (network, nodes) = cluster(3, config).await;
        let a = &nodes[0];
        let stalled = nodes[2].peer_id();
        network.set_stalled(stalled, true).await;

        let report = tokio::time::timeout(Duration::from_secs(5), a.sync_now())
            .await
            .expect("round must not hang on a stalled peer");

        assert!(report.success);
        let timed_out = report.peers.iter().find(|r| r.peer_id == stalled).unwrap();
        assert!(matches!(timed_out.outcome, SyncOutcome::Timeout));

        let metrics = a.get_metrics().await;
        assert_eq!(metrics.sessions, 2);
        assert_eq!(metrics.failed, 1);
    }

    #[tokio::test]
    async fn test_impostor_fails_authentication() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, 1, test_config()).await;
        let honest = spawn_node(&network, 2, test_config()).await;
        let impostor = spawn_node(&network, 3, test_config()).await;

        // Requests for the honest id land on a node holding a different key
        network.register(honest.peer_id(), impostor.service()).await;
        impostor.add_peer(a.as_peer()).await.unwrap();
        a.add_peer(honest.as_peer()).await.unwrap();

        let report = a.sync_now().await;
        assert!(!report.success);
        assert!(matches!(
            report.peers[0].outcome,
            SyncOutcome::Failure(SyncFailure::Authentication)
        ));
        assert_eq!(a.registry().get_reputation(&honest.peer_id()).await, Some(0.25));
    }

    #[tokio::test]
    async fn test_unknown_initiator_is_refused() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, 1, test_config()).await;
        let b = spawn_node(&network, 2, test_config()).await;
        // Only a knows b; b has never pinned a key for a
        a.add_peer(b.as_peer()).await.unwrap();
        let id = a
            .create_shard(RedundancyGroup::overwrite("doc"), b"unsolicited".to_vec())
            .unwrap();

        let report = a.sync_now().await;
        assert!(!report.success);
        assert!(matches!(
            report.peers[0].outcome,
            SyncOutcome::Failure(SyncFailure::Refused)
        ));
        assert!(!b.store().has(&id).unwrap());

        b.add_peer(a.as_peer()).await.unwrap();
        a.orchestrator().forget_peer(&b.peer_id()).await;
        assert!(a.sync_now().await.success);
        assert!(b.store().has(&id).unwrap());
    }

    #[tokio::test]
    async fn test_removed_peer_cannot_pin_new_key() {
        let (_network, nodes) = cluster(2, test_config()).await;
        let a = &nodes[0];
        let b = nodes[1].as_peer();

        let rogue = Peer {
            public_key: identity_from_secret([42; 32]).unwrap().public(),
            ..b.clone()
        };
        assert_eq!(
            a.add_peer(rogue).await,
            Err(RegistryError::DuplicateRejected(b.id))
        );

        a.remove_peer(&b.id).await;
        assert!(a.registry().get_peer(&b.id).await.is_none());
        assert!(a.orchestrator().select_sync_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_availability_drops_and_recovers() {
        let config = SyncConfig {
            redundancy_factor: 3,
            ..test_config()
        };
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, 1, config.clone()).await;
        let b = spawn_node(&network, 2, config.clone()).await;
        let c = spawn_node(&network, 3, config.clone()).await;
        let d = spawn_node(&network, 4, config.clone()).await;
        connect(&a, &b).await;
        connect(&a, &c).await;

        let id = a
            .create_shard(RedundancyGroup::overwrite("doc"), b"content".to_vec())
            .unwrap();
        a.sync_now().await;
        let before = a.check_data_availability().await.unwrap();
        assert_eq!(before.fraction, 1.0);

        connect(&a, &d).await;
        let scheduled = a.recovery().handle_node_failure(&b.peer_id()).await.unwrap();
        assert_eq!(scheduled, vec![id]);

        let degraded = a.check_data_availability().await.unwrap();
        assert!(degraded.fraction < before.fraction);
        assert_eq!(degraded.under_replicated, vec![id]);

        let outcome = a.recovery().recover_shard(&id).await.unwrap();
        assert_eq!(outcome.replicated_to, vec![d.peer_id()]);
        assert_eq!(outcome.redundancy, 3);
        assert!(d.store().has(&id).unwrap());

        let restored = a.check_data_availability().await.unwrap();
        assert_eq!(restored.fraction, before.fraction);
    }

    #[tokio::test]
    async fn test_lost_shard_rebuilt_from_peer() {
        let (_network, nodes) = cluster(2, test_config()).await;
        let (a, b) = (&nodes[0], &nodes[1]);

        let id = b
            .create_shard(RedundancyGroup::overwrite("doc"), b"precious".to_vec())
            .unwrap();
        b.sync_now().await;
        assert!(a.store().has(&id).unwrap());

        a.store().remove(&id).unwrap();
        let outcome = a.recovery().rebuild_shard(&id).await.unwrap();
        assert!(outcome.repaired);
        assert_eq!(a.store().get(&id).unwrap().payload, b"precious");
    }

    #[tokio::test]
    async fn test_rebuild_skips_unusable_source() {
        let (_network, nodes) = cluster(3, test_config()).await;
        let (a, bad, good) = (&nodes[0], &nodes[1], &nodes[2]);

        let id = a
            .create_shard(RedundancyGroup::overwrite("doc"), b"original".to_vec())
            .unwrap();
        good.store().commit(&a.store().get(&id).unwrap()).unwrap();

        // Hashes check out, but the group mode clashes with what a pinned
        let mut forged = Shard::new(RedundancyGroup::additive("doc"), b"forged".to_vec(), 1);
        forged.id = id;
        bad.store().commit(&forged).unwrap();

        // Rank the bad source first
        a.registry()
            .update_reputation(&good.peer_id(), ReputationOutcome::SyncFailure)
            .await
            .unwrap();

        a.store().remove(&id).unwrap();
        let outcome = a.recovery().rebuild_shard(&id).await.unwrap();
        assert!(outcome.repaired);
        assert_eq!(a.store().get(&id).unwrap().payload, b"original");
        assert_eq!(a.registry().get_reputation(&bad.peer_id()).await, Some(0.25));
    }

    #[tokio::test]
    async fn test_sweep_repairs_corrupt_shard() {
        let (_network, nodes) = cluster(2, test_config()).await;
        let (a, b) = (&nodes[0], &nodes[1]);

        let id = a
            .create_shard(RedundancyGroup::overwrite("doc"), b"intact".to_vec())
            .unwrap();
        a.sync_now().await;
        assert!(b.store().has(&id).unwrap());

        a.store().tamper_payload(&id, b"bit rot").unwrap();
        let sweep = a.recovery().sweep().await.unwrap();

        assert_eq!(sweep.corrupt, vec![id]);
        assert!(sweep.recovered.iter().any(|o| o.shard_id == id && o.repaired));
        assert!(a.verifier().verify_shard(&id).unwrap());
        assert_eq!(a.store().get(&id).unwrap().payload, b"intact");
    }

    #[tokio::test]
    async fn test_sweep_handles_suspected_node_failure() {
        let config = SyncConfig {
            suspect_failure_threshold: 1,
            ..test_config()
        };
        let (network, nodes) = cluster(2, config).await;
        let a = &nodes[0];
        let b = nodes[1].peer_id();
        network.set_offline(b, true).await;

        a.sync_now().await;
        let sweep = a.recovery().sweep().await.unwrap();

        assert_eq!(sweep.failed_nodes, vec![b]);
        assert!(!a.registry().get_peer(&b).await.unwrap().is_active());
        assert_eq!(
            a.metrics()
                .detect_partition(&crate::config::PartitionPolicy::ZeroActivePeers, a.registry().active_peers().await.len())
                .await,
            PartitionStatus::Suspected
        );
    }

    #[tokio::test]
    async fn test_gossip_discovers_transitive_peers() {
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, 1, test_config()).await;
        let b = spawn_node(&network, 2, test_config()).await;
        let c = spawn_node(&network, 3, test_config()).await;
        connect(&a, &b).await;
        connect(&b, &c).await;

        assert_eq!(a.discover_peers().await, 1);
        assert!(a.registry().contains(&c.peer_id()).await);
        assert_eq!(a.discover_peers().await, 0);
    }

    #[tokio::test]
    async fn test_gossip_survives_stalled_peer() {
        let config = SyncConfig {
            exchange_timeout_ms: 100,
            ..test_config()
        };
        let network = MemoryNetwork::new();
        let a = spawn_node(&network, 1, config.clone()).await;
        let stalled = spawn_node(&network, 2, config.clone()).await;
        let b = spawn_node(&network, 3, config.clone()).await;
        let c = spawn_node(&network, 4, config.clone()).await;
        connect(&a, &stalled).await;
        connect(&a, &b).await;
        connect(&b, &c).await;
        network.set_stalled(stalled.peer_id(), true).await;

        let discovered = tokio::time::timeout(Duration::from_secs(2), a.discover_peers())
            .await
            .expect("gossip must not hang on a stalled peer");
        assert_eq!(discovered, 1);
        assert!(a.registry().contains(&c.peer_id()).await);
    }

    #[tokio::test]
    async fn test_synced_stores_share_merkle_root() {
        let (_network, nodes) = cluster(2, test_config()).await;
        let (a, b) = (&nodes[0], &nodes[1]);

        let empty = serde_json::to_vec(&json!({ "records": [], "totals": {} })).unwrap();
        let tally = a.create_shard(RedundancyGroup::additive("tally"), empty).unwrap();
        let doc = a
            .create_shard(RedundancyGroup::overwrite("doc"), b"draft".to_vec())
            .unwrap();
        b.create_shard(RedundancyGroup::overwrite("notes"), b"only on b".to_vec())
            .unwrap();
        a.sync_now().await;

        let vote = serde_json::to_vec(&json!({ "records": [{"voter": "b"}], "totals": {"yes": 1} })).unwrap();
        b.store().apply_update(&tally, vote, 300).unwrap();
        a.store().apply_update(&doc, b"edited on a".to_vec(), 400).unwrap();
        b.store().apply_update(&doc, b"edited on b".to_vec(), 350).unwrap();
        assert!(a.sync_now().await.success);

        let root_a = a.verifier().local_root().unwrap();
        let root_b = b.verifier().local_root().unwrap();
        assert_eq!(root_a, root_b);

        let summary_a = a.store().summary().unwrap();
        let summary_b = b.store().summary().unwrap();
        assert_eq!(summary_a.len(), 3);
        assert!(IntegrityVerifier::diff(&summary_a, &summary_b).is_empty());
        assert_eq!(b.store().get(&doc).unwrap().payload, b"edited on a");
    }

    #[tokio::test]
    async fn test_latency_probe() {
        let (_network, nodes) = cluster(2, test_config()).await;
        let a = &nodes[0];
        let b = nodes[1].peer_id();

        a.metrics()
            .measure_latency(a.orchestrator().client(), &b, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(a.metrics().latency(&b).await.is_some());
    }

    #[tokio::test]
    async fn test_configuration_update_applies_to_components() {
        let (_network, nodes) = cluster(1, test_config()).await;
        let a = &nodes[0];

        let bad = ConfigUpdate {
            max_peers: -1,
            sync_interval_ms: 1_000,
            shard_size_bytes: 16,
            redundancy_factor: 2,
        };
        assert!(a.update_configuration(bad).await.is_err());
        assert_eq!(a.config().await.max_peers, test_config().max_peers);

        a.update_configuration(ConfigUpdate { max_peers: 4, ..bad })
            .await
            .unwrap();
        assert_eq!(a.config().await.max_peers, 4);
        assert_eq!(a.store().shard_size_limit(), 1024 * 1024);
        assert_eq!(a.registry().max_peers(), test_config().max_peers);

        // Applied from the snapshot taken when the next round starts
        a.sync_now().await;
        assert_eq!(a.store().shard_size_limit(), 16);
        assert_eq!(a.registry().max_peers(), 4);
        assert!(matches!(
            a.create_shard(RedundancyGroup::overwrite("g"), vec![0; 17]),
            Err(StorageError::ShardTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_loop_syncs_on_trigger_and_stops() {
        let config = SyncConfig {
            sync_interval_ms: 60_000,
            ..test_config()
        };
        let (_network, nodes) = cluster(2, config).await;
        let (a, b) = (nodes[0].clone(), nodes[1].clone());
        let id = a
            .create_shard(RedundancyGroup::overwrite("g"), b"loop".to_vec())
            .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(a.clone().run(shutdown_rx));

        a.trigger();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !b.store().has(&id).unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("triggered round should replicate the shard");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run loop should stop")
            .unwrap();
    }
}
