//! Sync orchestrator
//!
//! Drives sync rounds: pick peers by reliability, exchange summaries with each
//! of them concurrently, fetch and reconcile whatever differs, push back what
//! the peer lacks. A failing peer only affects its own exchange; it is folded
//! into backoff and reputation and the round carries on.

use futures::stream::{self, StreamExt};
use libp2p::identity::{Keypair, SigningError};
use libp2p::PeerId;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::backoff::BackoffTracker;
use super::replicas::ReplicaMap;
use super::state::{RoundStateMachine, SyncState};
use crate::config::{ConfigHandle, SyncConfig};
use crate::crypto::{ContentHash, ShardId};
use crate::integrity::IntegrityVerifier;
use crate::metrics::{MetricsCollector, PartitionStatus, SyncSession};
use crate::network::{ExchangeError, PeerAdvert, PeerClient, SyncRequest, SyncResponse};
use crate::peers::{Peer, PeerRegistry, ReputationOutcome};
use crate::resolver::{ConflictResolver, ResolveError, Settled};
use crate::security::{fresh_challenge, handshake_message, HandshakeRole, PeerCredentials, SecurityGateway};
use crate::storage::{Shard, ShardStore, StorageError};
use crate::unix_millis;

/// Why an exchange with a peer stopped
#[derive(Error, Debug)]
pub enum SyncFailure {
    #[error("Peer failed authentication")]
    Authentication,
    /// The peer does not know or has not admitted this node
    #[error("Peer refused the exchange")]
    Refused,
    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),
    #[error("Peer sent corrupt shard {0}")]
    Integrity(ShardId),
    #[error("Session invalidated")]
    SessionInvalidated,
    #[error("Peer not registered")]
    UnknownPeer,
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl SyncFailure {
    /// Failures that say something about the peer's honesty, not its uptime
    pub fn is_violation(&self) -> bool {
        matches!(self, SyncFailure::Authentication | SyncFailure::Integrity(_))
    }
}

/// A conflict that could not be settled automatically
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictAnomaly {
    pub peer_id: PeerId,
    pub shard_id: ShardId,
    pub reason: String,
}

/// Work done in one successful exchange
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub fetched: usize,
    pub pushed: usize,
    /// Conflicts settled by last-write-wins or merge
    pub resolved: usize,
    pub anomalies: Vec<ConflictAnomaly>,
}

#[derive(Debug)]
pub enum SyncOutcome {
    Success(SyncStats),
    Failure(SyncFailure),
    Timeout,
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success(_))
    }
}

/// One peer's part of a round
#[derive(Debug)]
pub struct PeerReport {
    pub peer_id: PeerId,
    pub outcome: SyncOutcome,
    pub duration: Duration,
    pub bytes_transferred: u64,
}

/// Result of `synchronize_with_peers`
#[derive(Debug)]
pub struct RoundReport {
    /// At least one peer exchange completed
    pub success: bool,
    pub peers_contacted: usize,
    pub peers_synced: usize,
    pub peers: Vec<PeerReport>,
    pub anomalies: Vec<ConflictAnomaly>,
    /// Root of the local shard set after reconciliation
    pub merkle_root: Option<String>,
    pub partition: PartitionStatus,
}

/// Components the orchestrator drives
pub struct SyncParts {
    /// Node identity, used to prove ourselves to responders
    pub identity: Keypair,
    pub registry: Arc<PeerRegistry>,
    pub store: Arc<ShardStore>,
    pub resolver: Arc<ConflictResolver>,
    pub verifier: Arc<IntegrityVerifier>,
    pub gateway: Arc<SecurityGateway>,
    pub metrics: Arc<MetricsCollector>,
    pub replicas: Arc<ReplicaMap>,
    pub client: PeerClient,
}

pub struct SyncOrchestrator {
    local_id: PeerId,
    config: ConfigHandle,
    parts: SyncParts,
    backoff: Mutex<BackoffTracker>,
    state: Mutex<RoundStateMachine>,
    round: Mutex<()>,
    flagged: Mutex<BTreeSet<ShardId>>,
}

impl SyncOrchestrator {
    pub async fn new(local_id: PeerId, config: ConfigHandle, parts: SyncParts) -> Self {
        let snapshot = config.current().await;
        Self {
            local_id,
            backoff: Mutex::new(BackoffTracker::new(
                Duration::from_millis(snapshot.backoff_base_ms),
                Duration::from_millis(snapshot.backoff_max_ms),
            )),
            config,
            parts,
            state: Mutex::new(RoundStateMachine::new()),
            round: Mutex::new(()),
            flagged: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn replicas(&self) -> &Arc<ReplicaMap> {
        &self.parts.replicas
    }

    pub fn client(&self) -> &PeerClient {
        &self.parts.client
    }

    pub async fn state(&self) -> SyncState {
        self.state.lock().await.current_state()
    }

    pub async fn rounds_completed(&self) -> u64 {
        self.state.lock().await.rounds_completed()
    }

    async fn enter(&self, next: SyncState) {
        let mut machine = self.state.lock().await;
        if !machine.transition(next) {
            debug!("Ignoring sync transition {:?} -> {:?}", machine.current_state(), next);
        }
    }

    /// Highest-reliability peers eligible this round, up to the fan-out
    pub async fn select_sync_peers(&self) -> Vec<Peer> {
        let config = self.config.current().await;
        self.select_with(&config).await
    }

    async fn select_with(&self, config: &SyncConfig) -> Vec<Peer> {
        let ranked = self.parts.registry.ranked_peers().await;
        let backoff = self.backoff.lock().await;

        ranked
            .into_iter()
            .filter(|peer| peer.is_active())
            .filter(|peer| peer.reliability >= config.min_selection_reliability)
            .filter(|peer| !backoff.in_backoff(&peer.id))
            .take(config.effective_fan_out())
            .collect()
    }

    /// Run one full round. Per-peer failures are reported, never returned.
    pub async fn synchronize_with_peers(&self) -> RoundReport {
        let _round = self.round.lock().await;
        let config = self.config.current().await;
        self.apply_limits(&config).await;

        self.enter(SyncState::SelectingPeers).await;
        let peers = self.select_with(&config).await;

        if peers.is_empty() {
            self.enter(SyncState::Idle).await;
            let active = self.parts.registry.active_peers().await.len();
            debug!("No peers eligible for sync");
            return RoundReport {
                success: false,
                peers_contacted: 0,
                peers_synced: 0,
                peers: Vec::new(),
                anomalies: Vec::new(),
                merkle_root: None,
                partition: self
                    .parts
                    .metrics
                    .detect_partition(&config.partition_policy, active)
                    .await,
            };
        }

        info!("Sync round starting with {} peers", peers.len());
        self.enter(SyncState::Exchanging).await;

        // Bounded by fan-out, which never exceeds max_peers
        let concurrency = config.effective_fan_out().max(1);
        let reports: Vec<PeerReport> = stream::iter(peers)
            .map(|peer| {
                let config = config.clone();
                async move { self.sync_with_peer(&peer, &config).await }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        if reports.iter().any(|report| !report.outcome.is_success()) {
            self.enter(SyncState::Backoff).await;
        }
        self.enter(SyncState::Reconciling).await;

        let merkle_root = match self.parts.verifier.local_root() {
            Ok(root) => Some(root),
            Err(e) => {
                warn!("Could not certify local shard set: {}", e);
                None
            }
        };

        let anomalies: Vec<ConflictAnomaly> = reports
            .iter()
            .filter_map(|report| match &report.outcome {
                SyncOutcome::Success(stats) => Some(stats.anomalies.clone()),
                _ => None,
            })
            .flatten()
            .collect();

        let peers_synced = reports.iter().filter(|r| r.outcome.is_success()).count();
        let active = self.parts.registry.active_peers().await.len();
        let partition = self
            .parts
            .metrics
            .detect_partition(&config.partition_policy, active)
            .await;

        self.enter(SyncState::Idle).await;
        info!(
            "Sync round finished: {}/{} peers synced, {} anomalies",
            peers_synced,
            reports.len(),
            anomalies.len()
        );

        RoundReport {
            success: peers_synced > 0,
            peers_contacted: reports.len(),
            peers_synced,
            peers: reports,
            anomalies,
            merkle_root,
            partition,
        }
    }

    // Limits from the round's config snapshot; updates in between wait for the next round.
    async fn apply_limits(&self, config: &SyncConfig) {
        self.backoff.lock().await.set_bounds(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        self.parts.store.set_shard_size_limit(config.shard_size_bytes);
        self.parts.registry.set_max_peers(config.max_peers);
        self.parts.metrics.set_capacity(config.metrics_window);
    }

    /// Exchange with one peer and fold the outcome into metrics, reputation and backoff
    pub async fn sync_with_peer(&self, peer: &Peer, config: &SyncConfig) -> PeerReport {
        let started_at = unix_millis();
        let clock = Instant::now();
        let mut bytes = 0u64;

        let outcome = match self.exchange_with(peer, config, &mut bytes).await {
            Ok(stats) => SyncOutcome::Success(stats),
            Err(SyncFailure::Exchange(ExchangeError::Timeout(_))) => SyncOutcome::Timeout,
            Err(failure) => SyncOutcome::Failure(failure),
        };
        let duration = clock.elapsed();

        self.parts
            .metrics
            .record_sync(SyncSession {
                peer_id: peer.id,
                started_at,
                duration,
                bytes_transferred: bytes,
                success: outcome.is_success(),
            })
            .await;

        match &outcome {
            SyncOutcome::Success(stats) => {
                debug!(
                    "Synced with {}: fetched {}, pushed {}, resolved {}",
                    peer.id, stats.fetched, stats.pushed, stats.resolved
                );
                self.backoff.lock().await.record_success(&peer.id);
                self.parts.registry.mark_seen(&peer.id).await;
                let _ = self
                    .parts
                    .registry
                    .update_reputation(&peer.id, ReputationOutcome::SuccessfulSync)
                    .await;
            }
            SyncOutcome::Failure(SyncFailure::SessionInvalidated | SyncFailure::UnknownPeer) => {
                debug!("Peer {} left during sync", peer.id);
            }
            SyncOutcome::Failure(failure) if failure.is_violation() => {
                warn!("Sync with {} aborted: {}", peer.id, failure);
                let _ = self
                    .parts
                    .registry
                    .update_reputation(&peer.id, ReputationOutcome::IntegrityViolation)
                    .await;
                self.schedule_retry(&peer.id).await;
            }
            SyncOutcome::Failure(failure) => {
                warn!("Sync with {} failed: {}", peer.id, failure);
                self.handle_sync_failure(&peer.id).await;
            }
            SyncOutcome::Timeout => {
                warn!("Sync with {} timed out", peer.id);
                self.handle_sync_failure(&peer.id).await;
            }
        }

        PeerReport {
            peer_id: peer.id,
            outcome,
            duration,
            bytes_transferred: bytes,
        }
    }

    /// Penalize a failed exchange and schedule the next attempt. Returns the delay.
    pub async fn handle_sync_failure(&self, peer_id: &PeerId) -> Duration {
        let _ = self
            .parts
            .registry
            .update_reputation(peer_id, ReputationOutcome::SyncFailure)
            .await;
        self.schedule_retry(peer_id).await
    }

    async fn schedule_retry(&self, peer_id: &PeerId) -> Duration {
        let delay = self.backoff.lock().await.record_failure(*peer_id);
        debug!("Backing off {} for {:?}", peer_id, delay);
        delay
    }

    /// Delay implied by the peer's consecutive failures
    pub async fn get_backoff_time(&self, peer_id: &PeerId) -> Duration {
        self.backoff.lock().await.get_backoff_time(peer_id)
    }

    pub async fn forget_peer(&self, peer_id: &PeerId) {
        self.backoff.lock().await.forget(peer_id);
    }

    async fn exchange_with(&self, peer: &Peer, config: &SyncConfig, bytes: &mut u64) -> Result<SyncStats, SyncFailure> {
        let timeout = Duration::from_millis(config.exchange_timeout_ms);
        let ticket = self
            .parts
            .registry
            .begin_session(&peer.id)
            .await
            .map_err(|_| SyncFailure::UnknownPeer)?;

        self.authenticate(peer, timeout, bytes).await?;

        let (remote, remote_root) = match self.call(&peer.id, SyncRequest::Summary, timeout, bytes).await? {
            SyncResponse::Summary { summary, merkle_root } => (summary, merkle_root),
            _ => return Err(ExchangeError::Unexpected("summary").into()),
        };
        self.parts
            .replicas
            .record_summary(peer.id, remote.keys().copied())
            .await;

        let local = self.parts.store.summary()?;
        let diff = IntegrityVerifier::compare(&local, &remote, &remote_root);
        let mut stats = SyncStats::default();
        if diff.is_empty() {
            self.parts.registry.end_session(&ticket).await;
            return Ok(stats);
        }
        debug!("{} shards differ from {}", diff.len(), peer.id);

        for id in diff.missing_locally.iter().chain(diff.differing.iter()) {
            let shard = match self
                .call(&peer.id, SyncRequest::FetchShard { shard_id: *id }, timeout, bytes)
                .await?
            {
                SyncResponse::Shard { shard } => shard,
                SyncResponse::NotFound { .. } | SyncResponse::Denied { .. } => continue,
                _ => return Err(ExchangeError::Unexpected("fetch").into()),
            };

            if shard.id != *id || !ShardStore::validate_shard(&shard) {
                warn!("Peer {} sent corrupt copy of {}", peer.id, id);
                self.flag_for_recovery(*id).await;
                return Err(SyncFailure::Integrity(*id));
            }

            if !self.parts.registry.session_valid(&ticket).await {
                return Err(SyncFailure::SessionInvalidated);
            }

            if let Err(reason) = self.ingest(&shard, &mut stats) {
                stats.anomalies.push(ConflictAnomaly {
                    peer_id: peer.id,
                    shard_id: *id,
                    reason,
                });
            }
        }

        // Push every local shard the peer lacks or holds differently
        for (id, digest) in self.parts.store.summary()? {
            let remote_hash = remote.get(&id).map(|d| d.hash);
            if remote_hash == Some(digest.hash) {
                continue;
            }
            if !self.parts.gateway.check_access(&peer.id, &id).await {
                continue;
            }
            let Some(shard) = self.parts.store.find(&id)? else {
                continue;
            };
            if self.offer(&peer.id, shard, remote_hash, timeout, bytes).await? {
                stats.pushed += 1;
            }
        }

        self.parts.registry.end_session(&ticket).await;
        Ok(stats)
    }

    // Commit a validated incoming shard through the resolver. `Err` carries the
    // reason reported as a conflict anomaly for this shard.
    fn ingest(&self, shard: &Shard, stats: &mut SyncStats) -> Result<(), String> {
        match self.parts.resolver.settle(shard) {
            Ok(settled) => {
                if let Settled::Committed { .. } = settled {
                    stats.fetched += 1;
                }
                if settled.resolved() {
                    stats.resolved += 1;
                }
                Ok(())
            }
            Err(ResolveError::Storage(e)) => Err(e.to_string()),
            Err(e) => {
                warn!("Unresolved conflict on {}: {}", shard.id, e);
                Err(e.to_string())
            }
        }
    }

    async fn call(
        &self,
        peer: &PeerId,
        request: SyncRequest,
        timeout: Duration,
        bytes: &mut u64,
    ) -> Result<SyncResponse, SyncFailure> {
        let exchange = self.parts.client.call_with_timeout(peer, &request, timeout).await?;
        *bytes += exchange.bytes;
        match exchange.response {
            SyncResponse::Unauthorized => Err(SyncFailure::Refused),
            response => Ok(response),
        }
    }

    /// Mutual handshake. The peer signs our challenge with its pinned key, then
    /// we sign the challenge it returned so that it admits us.
    async fn authenticate(&self, peer: &Peer, timeout: Duration, bytes: &mut u64) -> Result<(), SyncFailure> {
        let challenge = fresh_challenge();

        let (signature, theirs) = match self
            .call(&peer.id, SyncRequest::Hello { challenge: challenge.clone() }, timeout, bytes)
            .await?
        {
            SyncResponse::Hello { signature, challenge } => (signature, challenge),
            _ => return Err(ExchangeError::Unexpected("hello").into()),
        };

        let credentials = PeerCredentials {
            peer_id: peer.id,
            role: HandshakeRole::Responder,
            pinned_key: peer.public_key.clone(),
            challenge,
            signature,
        };
        if !self.parts.gateway.authenticate_peer(&credentials) {
            return Err(SyncFailure::Authentication);
        }

        let proof = self
            .parts
            .identity
            .sign(&handshake_message(HandshakeRole::Initiator, &theirs))?;
        match self.call(&peer.id, SyncRequest::Prove { signature: proof }, timeout, bytes).await? {
            SyncResponse::Welcome => Ok(()),
            _ => Err(ExchangeError::Unexpected("prove").into()),
        }
    }

    // Push one shard; true when the peer now holds a version of it.
    async fn offer(
        &self,
        peer: &PeerId,
        shard: Shard,
        supersedes: Option<ContentHash>,
        timeout: Duration,
        bytes: &mut u64,
    ) -> Result<bool, SyncFailure> {
        let shard_id = shard.id;
        match self
            .call(peer, SyncRequest::StoreShard { shard, supersedes }, timeout, bytes)
            .await?
        {
            SyncResponse::Stored { .. } => {
                self.parts.replicas.add_holder(shard_id, *peer).await;
                Ok(true)
            }
            SyncResponse::Rejected { reason, .. } => {
                debug!("Peer {} rejected {}: {}", peer, shard_id, reason);
                Ok(false)
            }
            SyncResponse::Denied { .. } => Ok(false),
            _ => Err(ExchangeError::Unexpected("store").into()),
        }
    }

    /// Authenticated fetch of one shard, validated before it is returned
    pub async fn fetch_shard(&self, peer: &Peer, shard_id: &ShardId) -> Result<Option<Shard>, SyncFailure> {
        let timeout = Duration::from_millis(self.config.current().await.exchange_timeout_ms);
        let mut bytes = 0;
        self.authenticate(peer, timeout, &mut bytes).await?;

        match self
            .call(&peer.id, SyncRequest::FetchShard { shard_id: *shard_id }, timeout, &mut bytes)
            .await?
        {
            SyncResponse::Shard { shard } => {
                if shard.id != *shard_id || !ShardStore::validate_shard(&shard) {
                    return Err(SyncFailure::Integrity(*shard_id));
                }
                Ok(Some(shard))
            }
            SyncResponse::NotFound { .. } | SyncResponse::Denied { .. } => Ok(None),
            _ => Err(ExchangeError::Unexpected("fetch").into()),
        }
    }

    /// Authenticated push of one shard to a peer
    pub async fn push_shard(&self, peer: &Peer, shard: Shard) -> Result<bool, SyncFailure> {
        let timeout = Duration::from_millis(self.config.current().await.exchange_timeout_ms);
        let mut bytes = 0;
        self.authenticate(peer, timeout, &mut bytes).await?;
        self.offer(&peer.id, shard, None, timeout, &mut bytes).await
    }

    /// Ping peers excluded from selection once their backoff has run out, so
    /// that a recovered peer can earn its way back.
    pub async fn probe_demoted_peers(&self) -> usize {
        let config = self.config.current().await;
        let timeout = Duration::from_millis(config.exchange_timeout_ms);

        let mut candidates = Vec::new();
        {
            let peers = self.parts.registry.peers().await;
            let backoff = self.backoff.lock().await;
            for peer in peers {
                let demoted = !peer.is_active() || peer.reliability < config.min_selection_reliability;
                if demoted && !backoff.in_backoff(&peer.id) {
                    candidates.push(peer);
                }
            }
        }

        let mut revived = 0;
        for peer in candidates {
            match self
                .parts
                .metrics
                .measure_latency(&self.parts.client, &peer.id, timeout)
                .await
            {
                Ok(_) => {
                    self.backoff.lock().await.record_success(&peer.id);
                    self.parts.registry.mark_seen(&peer.id).await;
                    let _ = self
                        .parts
                        .registry
                        .update_reputation(&peer.id, ReputationOutcome::SuccessfulSync)
                        .await;
                    revived += 1;
                }
                Err(e) => {
                    debug!("Probe of {} failed: {}", peer.id, e);
                    self.schedule_retry(&peer.id).await;
                }
            }
        }
        revived
    }

    /// Gossip round: ask every active peer for the peers it knows and add the
    /// ones not registered yet. Peers are queried concurrently, each under the
    /// exchange timeout. Returns how many peers were new.
    pub async fn discover_peers(&self) -> usize {
        let config = self.config.current().await;
        let timeout = Duration::from_millis(config.exchange_timeout_ms);
        let peers = self.parts.registry.active_peers().await;
        let concurrency = peers.len().max(1);

        let answers: Vec<Vec<PeerAdvert>> = stream::iter(peers)
            .map(|peer| async move {
                match self.gossip_with(&peer, timeout).await {
                    Ok(adverts) => adverts,
                    Err(e) => {
                        debug!("Gossip with {} failed: {}", peer.id, e);
                        Vec::new()
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut discovered = 0;
        for adverts in answers {
            discovered += self.parts.registry.merge_adverts(&self.local_id, adverts).await;
        }
        if discovered > 0 {
            info!("Discovered {} new peers", discovered);
        }
        discovered
    }

    async fn gossip_with(&self, peer: &Peer, timeout: Duration) -> Result<Vec<PeerAdvert>, SyncFailure> {
        let mut bytes = 0;
        self.authenticate(peer, timeout, &mut bytes).await?;
        match self.call(&peer.id, SyncRequest::Peers, timeout, &mut bytes).await? {
            SyncResponse::Peers { peers } => Ok(peers),
            _ => Err(ExchangeError::Unexpected("peers").into()),
        }
    }

    /// Queue a shard for the recovery manager
    pub async fn flag_for_recovery(&self, shard_id: ShardId) {
        self.flagged.lock().await.insert(shard_id);
    }

    pub async fn take_flagged(&self) -> Vec<ShardId> {
        std::mem::take(&mut *self.flagged.lock().await)
            .into_iter()
            .collect()
    }
}
