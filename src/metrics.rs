//! Network metrics
//!
//! Rolling window of per-peer sync sessions, aggregated on demand. Reads are
//! side-effect free and cost O(window).

use libp2p::PeerId;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::PartitionPolicy;
use crate::network::{ExchangeError, PeerClient, SyncRequest, SyncResponse};
use crate::unix_millis;

/// One exchange with one peer
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSession {
    pub peer_id: PeerId,
    /// Milliseconds since the Unix epoch
    pub started_at: u64,
    pub duration: Duration,
    pub bytes_transferred: u64,
    pub success: bool,
}

/// Aggregates over the current window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkMetrics {
    pub sessions: usize,
    pub successful: usize,
    pub failed: usize,
    pub bytes_transferred: u64,
    pub mean_duration_ms: f64,
    /// 0 when the window is empty
    pub success_rate: f64,
    /// Sessions recorded since start, including those that left the window
    pub lifetime_sessions: u64,
}

/// Verdict of the partition heuristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Connected,
    /// No peer is usable under the configured policy
    Suspected,
}

#[derive(Default)]
struct PeerActivity {
    consecutive_failures: u32,
    last_success: Option<u64>,
    latency: Option<Duration>,
}

#[derive(Default)]
struct Window {
    sessions: VecDeque<SyncSession>,
    lifetime: u64,
    peers: HashMap<PeerId, PeerActivity>,
}

pub struct MetricsCollector {
    window: RwLock<Window>,
    capacity: AtomicUsize,
}

impl MetricsCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: RwLock::new(Window::default()),
            capacity: AtomicUsize::new(capacity.max(1)),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity.max(1), Ordering::Relaxed);
    }

    /// Append a session, dropping the oldest once the window is full
    pub async fn record_sync(&self, session: SyncSession) {
        let mut window = self.window.write().await;
        let capacity = self.capacity.load(Ordering::Relaxed);

        let activity = window.peers.entry(session.peer_id).or_default();
        if session.success {
            activity.consecutive_failures = 0;
            activity.last_success = Some(session.started_at + session.duration.as_millis() as u64);
        } else {
            activity.consecutive_failures += 1;
        }

        window.sessions.push_back(session);
        window.lifetime += 1;
        while window.sessions.len() > capacity {
            window.sessions.pop_front();
        }
    }

    pub async fn get_metrics(&self) -> NetworkMetrics {
        let window = self.window.read().await;
        let sessions = window.sessions.len();
        if sessions == 0 {
            return NetworkMetrics {
                lifetime_sessions: window.lifetime,
                ..Default::default()
            };
        }

        let successful = window.sessions.iter().filter(|s| s.success).count();
        let bytes_transferred = window.sessions.iter().map(|s| s.bytes_transferred).sum();
        let total_ms: f64 = window
            .sessions
            .iter()
            .map(|s| s.duration.as_secs_f64() * 1000.0)
            .sum();

        NetworkMetrics {
            sessions,
            successful,
            failed: sessions - successful,
            bytes_transferred,
            mean_duration_ms: total_ms / sessions as f64,
            success_rate: successful as f64 / sessions as f64,
            lifetime_sessions: window.lifetime,
        }
    }

    /// Partition heuristic.
    ///
    /// This is an inference from local observations only. Zero active peers or a
    /// quiet staleness window is equally consistent with every peer having
    /// crashed, and a reachable peer does not prove the rest of the network is.
    pub async fn detect_partition(&self, policy: &PartitionPolicy, active_peers: usize) -> PartitionStatus {
        let suspected = match policy {
            PartitionPolicy::ZeroActivePeers => active_peers == 0,
            PartitionPolicy::Staleness { window_ms } => {
                let cutoff = unix_millis().saturating_sub(*window_ms);
                let window = self.window.read().await;
                !window
                    .peers
                    .values()
                    .any(|activity| activity.last_success.is_some_and(|at| at >= cutoff))
            }
        };

        if suspected {
            warn!("Partition suspected under {:?}", policy);
            PartitionStatus::Suspected
        } else {
            PartitionStatus::Connected
        }
    }

    /// Round-trip a ping and remember the latency
    pub async fn measure_latency(
        &self,
        client: &PeerClient,
        peer: &PeerId,
        timeout: Duration,
    ) -> Result<Duration, ExchangeError> {
        let started = Instant::now();
        let exchange = client.call_with_timeout(peer, &SyncRequest::Ping, timeout).await?;
        if !matches!(exchange.response, SyncResponse::Pong) {
            return Err(ExchangeError::Unexpected("ping"));
        }

        let latency = started.elapsed();
        self.window
            .write()
            .await
            .peers
            .entry(*peer)
            .or_default()
            .latency = Some(latency);
        debug!("Latency to {}: {:?}", peer, latency);
        Ok(latency)
    }

    pub async fn latency(&self, peer: &PeerId) -> Option<Duration> {
        self.window
            .read()
            .await
            .peers
            .get(peer)
            .and_then(|activity| activity.latency)
    }

    /// Peers whose last `threshold` sessions all failed
    pub async fn suspected_failures(&self, threshold: u32) -> Vec<PeerId> {
        self.window
            .read()
            .await
            .peers
            .iter()
            .filter(|(_, activity)| activity.consecutive_failures >= threshold)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Drop per-peer tracking once a failure has been handled
    pub async fn forget_peer(&self, peer: &PeerId) {
        self.window.write().await.peers.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::identity_from_secret;

    fn test_peer(n: u8) -> PeerId {
        PeerId::from(identity_from_secret([n; 32]).unwrap().public())
    }

    fn session(peer: PeerId, ms: u64, bytes: u64, success: bool) -> SyncSession {
        SyncSession {
            peer_id: peer,
            started_at: unix_millis(),
            duration: Duration::from_millis(ms),
            bytes_transferred: bytes,
            success,
        }
    }

    #[tokio::test]
    async fn test_aggregates() {
        let metrics = MetricsCollector::new(16);
        let peer = test_peer(1);
        metrics.record_sync(session(peer, 10, 100, true)).await;
        metrics.record_sync(session(peer, 30, 50, false)).await;

        let snapshot = metrics.get_metrics().await;
        assert_eq!(snapshot.sessions, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.bytes_transferred, 150);
        assert!((snapshot.mean_duration_ms - 20.0).abs() < 1e-9);
        assert!((snapshot.success_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_window_rolls() {
        let metrics = MetricsCollector::new(3);
        let peer = test_peer(1);
        for _ in 0..5 {
            metrics.record_sync(session(peer, 1, 1, true)).await;
        }

        let snapshot = metrics.get_metrics().await;
        assert_eq!(snapshot.sessions, 3);
        assert_eq!(snapshot.lifetime_sessions, 5);
    }

    #[tokio::test]
    async fn test_empty_window() {
        let snapshot = MetricsCollector::new(4).get_metrics().await;
        assert_eq!(snapshot, NetworkMetrics::default());
    }

    #[tokio::test]
    async fn test_partition_policies() {
        let metrics = MetricsCollector::new(8);
        assert_eq!(
            metrics.detect_partition(&PartitionPolicy::ZeroActivePeers, 0).await,
            PartitionStatus::Suspected
        );
        assert_eq!(
            metrics.detect_partition(&PartitionPolicy::ZeroActivePeers, 2).await,
            PartitionStatus::Connected
        );

        let staleness = PartitionPolicy::Staleness { window_ms: 60_000 };
        assert_eq!(metrics.detect_partition(&staleness, 2).await, PartitionStatus::Suspected);

        metrics.record_sync(session(test_peer(1), 5, 0, true)).await;
        assert_eq!(metrics.detect_partition(&staleness, 2).await, PartitionStatus::Connected);
    }

    #[tokio::test]
    async fn test_suspected_failures_reset_on_success() {
        let metrics = MetricsCollector::new(32);
        let flaky = test_peer(1);
        let dead = test_peer(2);

        for _ in 0..3 {
            metrics.record_sync(session(dead, 1, 0, false)).await;
            metrics.record_sync(session(flaky, 1, 0, false)).await;
        }
        metrics.record_sync(session(flaky, 1, 0, true)).await;

        assert_eq!(metrics.suspected_failures(3).await, vec![dead]);

        metrics.forget_peer(&dead).await;
        assert!(metrics.suspected_failures(3).await.is_empty());
    }
}
