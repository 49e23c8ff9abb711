//! Recovery manager
//!
//! Repairs corrupt shards and rebuilds lost ones from peers, reacts to node
//! failures, and keeps every shard at `redundancy_factor` holders where the
//! peer set allows it.

use libp2p::PeerId;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ConfigHandle;
use crate::crypto::ShardId;
use crate::integrity::{IntegrityError, IntegrityVerifier};
use crate::metrics::MetricsCollector;
use crate::peers::{Peer, PeerRegistry, PeerStatus, ReputationOutcome};
use crate::security::SecurityGateway;
use crate::storage::{ShardStore, StorageError};
use crate::sync::{SyncFailure, SyncOrchestrator};
use crate::unix_millis;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("No peer could supply shard {0}")]
    Unrecoverable(ShardId),
    #[error("Recovered copy of {0} failed verification")]
    VerificationFailed(ShardId),
}

/// What a recovery did for one shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    pub shard_id: ShardId,
    /// Local copy was replaced from a peer
    pub repaired: bool,
    /// New holders the shard was pushed to
    pub replicated_to: Vec<PeerId>,
    /// Holders known after recovery, this node included
    pub redundancy: usize,
}

/// Health signal for operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailabilityReport {
    pub tracked: usize,
    pub available: usize,
    /// `available / tracked`, 1.0 when nothing is tracked
    pub fraction: f64,
    #[serde(skip)]
    pub under_replicated: Vec<ShardId>,
}

/// What one sweep did
#[derive(Debug, Default)]
pub struct SweepReport {
    pub failed_nodes: Vec<PeerId>,
    pub corrupt: Vec<ShardId>,
    pub recovered: Vec<RecoveryOutcome>,
    pub unrecovered: Vec<ShardId>,
    pub aged_out: Vec<PeerId>,
}

pub struct RecoveryManager {
    config: ConfigHandle,
    store: Arc<ShardStore>,
    verifier: Arc<IntegrityVerifier>,
    registry: Arc<PeerRegistry>,
    metrics: Arc<MetricsCollector>,
    gateway: Arc<SecurityGateway>,
    orchestrator: Arc<SyncOrchestrator>,
    scheduled: Mutex<BTreeSet<ShardId>>,
}

impl RecoveryManager {
    pub fn new(
        config: ConfigHandle,
        store: Arc<ShardStore>,
        verifier: Arc<IntegrityVerifier>,
        registry: Arc<PeerRegistry>,
        metrics: Arc<MetricsCollector>,
        gateway: Arc<SecurityGateway>,
        orchestrator: Arc<SyncOrchestrator>,
    ) -> Self {
        Self {
            config,
            store,
            verifier,
            registry,
            metrics,
            gateway,
            orchestrator,
            scheduled: Mutex::new(BTreeSet::new()),
        }
    }

    /// Holders of a shard, counting this node only when its copy is intact
    pub async fn redundancy(&self, shard_id: &ShardId) -> Result<usize, RecoveryError> {
        let local = match self.store.find(shard_id) {
            Ok(Some(shard)) => usize::from(shard.is_valid()),
            Ok(None) | Err(StorageError::Encoding(_)) => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(local + self.orchestrator.replicas().holder_count(shard_id).await)
    }

    /// Repair a shard from peers. A missing shard is rebuilt; an intact one
    /// is only re-replicated.
    pub async fn recover_shard(&self, shard_id: &ShardId) -> Result<RecoveryOutcome, RecoveryError> {
        if self.store.has(shard_id)? {
            self.recover_present(shard_id).await
        } else {
            self.rebuild_missing(shard_id).await
        }
    }

    /// Reconstruct a shard that is entirely absent locally
    pub async fn rebuild_shard(&self, shard_id: &ShardId) -> Result<RecoveryOutcome, RecoveryError> {
        if self.store.has(shard_id)? {
            return self.recover_present(shard_id).await;
        }
        self.rebuild_missing(shard_id).await
    }

    async fn recover_present(&self, shard_id: &ShardId) -> Result<RecoveryOutcome, RecoveryError> {
        let intact = match self.store.find(shard_id) {
            Ok(shard) => shard.map(|s| s.is_valid()).unwrap_or(false),
            // Undecodable record
            Err(StorageError::Encoding(_)) => false,
            Err(e) => return Err(e.into()),
        };

        if !intact {
            warn!("Recovering corrupt shard {}", shard_id);
            self.restore_from_peers(shard_id).await?;
        }
        self.finish(shard_id, !intact).await
    }

    async fn rebuild_missing(&self, shard_id: &ShardId) -> Result<RecoveryOutcome, RecoveryError> {
        info!("Rebuilding lost shard {}", shard_id);
        self.restore_from_peers(shard_id).await?;
        self.finish(shard_id, true).await
    }

    async fn finish(&self, shard_id: &ShardId, repaired: bool) -> Result<RecoveryOutcome, RecoveryError> {
        let replicated_to = self.replicate(shard_id).await?;
        let redundancy = self.redundancy(shard_id).await?;
        if repaired || !replicated_to.is_empty() {
            info!(
                "Shard {} recovered: repaired={} redundancy={}",
                shard_id, repaired, redundancy
            );
        }
        Ok(RecoveryOutcome {
            shard_id: *shard_id,
            repaired,
            replicated_to,
            redundancy,
        })
    }

    // Known holders first, then every other active peer
    async fn sources(&self, shard_id: &ShardId) -> Vec<Peer> {
        let holders = self.orchestrator.replicas().holders(shard_id).await;
        let mut peers = self.registry.ranked_peers().await;
        peers.retain(|peer| peer.is_active());
        peers.sort_by_key(|peer| !holders.contains(&peer.id));
        peers
    }

    async fn restore_from_peers(&self, shard_id: &ShardId) -> Result<(), RecoveryError> {
        for peer in self.sources(shard_id).await {
            let shard = match self.orchestrator.fetch_shard(&peer, shard_id).await {
                Ok(Some(shard)) => shard,
                Ok(None) => continue,
                Err(failure) => {
                    self.note_source_failure(&peer, &failure).await;
                    continue;
                }
            };

            match self.store.commit(&shard) {
                Ok(()) => {}
                Err(e @ (StorageError::Database(_) | StorageError::Encoding(_))) => return Err(e.into()),
                Err(e) => {
                    warn!("Recovery source {} offered an unusable copy of {}: {}", peer.id, shard_id, e);
                    let _ = self
                        .registry
                        .update_reputation(&peer.id, ReputationOutcome::IntegrityViolation)
                        .await;
                    continue;
                }
            }
            if !self.verifier.verify_shard(shard_id)? {
                return Err(RecoveryError::VerificationFailed(*shard_id));
            }
            self.orchestrator.replicas().add_holder(*shard_id, peer.id).await;
            debug!("Shard {} restored from {}", shard_id, peer.id);
            return Ok(());
        }

        Err(RecoveryError::Unrecoverable(*shard_id))
    }

    async fn note_source_failure(&self, peer: &Peer, failure: &SyncFailure) {
        warn!("Recovery source {} failed: {}", peer.id, failure);
        if failure.is_violation() {
            let _ = self
                .registry
                .update_reputation(&peer.id, ReputationOutcome::IntegrityViolation)
                .await;
        } else {
            self.orchestrator.handle_sync_failure(&peer.id).await;
        }
    }

    // Push the local copy to healthy non-holders until the redundancy factor holds
    async fn replicate(&self, shard_id: &ShardId) -> Result<Vec<PeerId>, RecoveryError> {
        let factor = self.config.current().await.redundancy_factor;
        let mut redundancy = self.redundancy(shard_id).await?;
        let mut replicated_to = Vec::new();
        if redundancy >= factor {
            return Ok(replicated_to);
        }

        let Some(shard) = self.store.find(shard_id)? else {
            return Ok(replicated_to);
        };
        let holders = self.orchestrator.replicas().holders(shard_id).await;

        for peer in self.registry.ranked_peers().await {
            if redundancy >= factor {
                break;
            }
            if !peer.is_active() || holders.contains(&peer.id) {
                continue;
            }
            if !self.gateway.check_access(&peer.id, shard_id).await {
                continue;
            }

            match self.orchestrator.push_shard(&peer, shard.clone()).await {
                Ok(true) => {
                    redundancy += 1;
                    replicated_to.push(peer.id);
                }
                Ok(false) => {}
                Err(failure) => self.note_source_failure(&peer, &failure).await,
            }
        }

        if redundancy < factor {
            warn!(
                "Shard {} below redundancy factor: {}/{}",
                shard_id, redundancy, factor
            );
        }
        Ok(replicated_to)
    }

    /// Mark a peer unreachable, penalize it, and schedule recovery for every
    /// shard that fell below the redundancy factor. Returns the scheduled ids.
    pub async fn handle_node_failure(&self, node_id: &PeerId) -> Result<Vec<ShardId>, RecoveryError> {
        warn!("Handling failure of node {}", node_id);
        let _ = self.registry.mark_unreachable(node_id).await;
        let _ = self
            .registry
            .update_reputation(node_id, ReputationOutcome::NodeFailure)
            .await;
        self.metrics.forget_peer(node_id).await;

        let factor = self.config.current().await.redundancy_factor;
        let affected = self.orchestrator.replicas().remove_peer(node_id).await;

        let mut newly_scheduled = Vec::new();
        for shard_id in affected {
            if self.redundancy(&shard_id).await? < factor {
                newly_scheduled.push(shard_id);
            }
        }

        self.scheduled.lock().await.extend(newly_scheduled.iter().copied());
        if !newly_scheduled.is_empty() {
            info!(
                "Scheduled recovery of {} shards after failure of {}",
                newly_scheduled.len(),
                node_id
            );
        }
        Ok(newly_scheduled)
    }

    pub async fn schedule(&self, shard_id: ShardId) {
        self.scheduled.lock().await.insert(shard_id);
    }

    pub async fn scheduled(&self) -> Vec<ShardId> {
        self.scheduled.lock().await.iter().copied().collect()
    }

    /// Recover every scheduled shard. Failed shards stay scheduled.
    pub async fn run_scheduled(&self) -> (Vec<RecoveryOutcome>, Vec<ShardId>) {
        let pending: Vec<ShardId> = std::mem::take(&mut *self.scheduled.lock().await)
            .into_iter()
            .collect();

        let mut recovered = Vec::new();
        let mut failed = Vec::new();
        for shard_id in pending {
            match self.recover_shard(&shard_id).await {
                Ok(outcome) => recovered.push(outcome),
                Err(e) => {
                    warn!("Recovery of {} failed: {}", shard_id, e);
                    failed.push(shard_id);
                }
            }
        }

        self.scheduled.lock().await.extend(failed.iter().copied());
        (recovered, failed)
    }

    /// Fraction of tracked shards meeting the redundancy factor. Read-only.
    pub async fn check_data_availability(&self) -> Result<AvailabilityReport, RecoveryError> {
        let factor = self.config.current().await.redundancy_factor;

        let mut tracked: BTreeSet<ShardId> = self.store.list_shards()?.into_iter().collect();
        tracked.extend(self.orchestrator.replicas().tracked_shards().await);

        let mut under_replicated = Vec::new();
        for shard_id in &tracked {
            if self.redundancy(shard_id).await? < factor {
                under_replicated.push(*shard_id);
            }
        }

        let available = tracked.len() - under_replicated.len();
        let fraction = if tracked.is_empty() {
            1.0
        } else {
            available as f64 / tracked.len() as f64
        };

        Ok(AvailabilityReport {
            tracked: tracked.len(),
            available,
            fraction,
            under_replicated,
        })
    }

    /// Remove peers unreachable for longer than `peer_expiry_ms`
    pub async fn age_out_peers(&self) -> Vec<PeerId> {
        let expiry = self.config.current().await.peer_expiry_ms;
        let cutoff = unix_millis().saturating_sub(expiry);

        let mut aged_out = Vec::new();
        for peer in self.registry.peers().await {
            let PeerStatus::Unreachable { since } = peer.status else {
                continue;
            };
            if since > cutoff {
                continue;
            }
            self.registry.remove_peer(&peer.id).await;
            self.gateway.forget_peer(&peer.id).await;
            self.orchestrator.replicas().remove_peer(&peer.id).await;
            self.orchestrator.forget_peer(&peer.id).await;
            info!("Aged out peer {}", peer.id);
            aged_out.push(peer.id);
        }
        aged_out
    }

    /// One maintenance pass: suspected node failures, corruption scan,
    /// shards flagged during sync, scheduled recoveries, peer ageing.
    pub async fn sweep(&self) -> Result<SweepReport, RecoveryError> {
        let threshold = self.config.current().await.suspect_failure_threshold;
        let mut report = SweepReport::default();

        for peer in self.metrics.suspected_failures(threshold).await {
            if self.registry.contains(&peer).await {
                self.handle_node_failure(&peer).await?;
                report.failed_nodes.push(peer);
            } else {
                self.metrics.forget_peer(&peer).await;
            }
        }

        report.corrupt = self.verifier.scan_corrupt()?;
        let flagged = self.orchestrator.take_flagged().await;
        {
            let mut scheduled = self.scheduled.lock().await;
            scheduled.extend(report.corrupt.iter().copied());
            scheduled.extend(flagged);
        }

        let (recovered, unrecovered) = self.run_scheduled().await;
        report.recovered = recovered;
        report.unrecovered = unrecovered;
        report.aged_out = self.age_out_peers().await;

        Ok(report)
    }
}
