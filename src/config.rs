//! Process-wide tunables
//!
//! The live configuration is an `Arc<SyncConfig>` that is swapped as a whole.
//! A sync round takes one snapshot when it starts, so an update is seen by the
//! next round and never halfway through one.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {field} must be positive (got {value})")]
    InvalidConfiguration { field: &'static str, value: i64 },
    #[error("Invalid configuration: {0}")]
    Inconsistent(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How the metrics collector decides that this node is partitioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PartitionPolicy {
    /// Partitioned when no peer is currently considered active
    ZeroActivePeers,
    /// Partitioned when no peer answered within the window
    Staleness { window_ms: u64 },
}

/// Full engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on tracked peers and simultaneous outbound exchanges
    pub max_peers: usize,
    /// Delay between scheduled sync rounds
    pub sync_interval_ms: u64,
    /// Largest payload accepted for a single shard
    pub shard_size_bytes: usize,
    /// Number of holders (including this node) a shard should have
    pub redundancy_factor: usize,
    /// Peers contacted per round
    pub fan_out: usize,
    /// Per-peer exchange deadline
    pub exchange_timeout_ms: u64,
    /// First backoff delay after a failed exchange
    pub backoff_base_ms: u64,
    /// Backoff ceiling
    pub backoff_max_ms: u64,
    /// Number of sync sessions kept for metrics
    pub metrics_window: usize,
    /// Peers below this reliability are not selected for sync
    pub min_selection_reliability: f64,
    pub partition_policy: PartitionPolicy,
    /// Consecutive failed sessions after which a peer is suspected down
    pub suspect_failure_threshold: u32,
    /// Unreachable peers older than this are removed from the registry
    pub peer_expiry_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_peers: 32,
            sync_interval_ms: 30_000,
            shard_size_bytes: 1024 * 1024,
            redundancy_factor: 3,
            fan_out: 8,
            exchange_timeout_ms: 10_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            metrics_window: 256,
            min_selection_reliability: 0.25,
            partition_policy: PartitionPolicy::ZeroActivePeers,
            suspect_failure_threshold: 3,
            peer_expiry_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl SyncConfig {
    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path)?;
        let config: SyncConfig = serde_json::from_slice(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero values and inconsistent bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("max_peers", self.max_peers as i64)?;
        positive("sync_interval_ms", self.sync_interval_ms as i64)?;
        positive("shard_size_bytes", self.shard_size_bytes as i64)?;
        positive("redundancy_factor", self.redundancy_factor as i64)?;
        positive("fan_out", self.fan_out as i64)?;
        positive("exchange_timeout_ms", self.exchange_timeout_ms as i64)?;
        positive("backoff_base_ms", self.backoff_base_ms as i64)?;
        positive("metrics_window", self.metrics_window as i64)?;

        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Inconsistent(
                "backoff_max_ms is below backoff_base_ms".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_selection_reliability) {
            return Err(ConfigError::Inconsistent(
                "min_selection_reliability must lie in [0, 1]".to_string(),
            ));
        }
        if let PartitionPolicy::Staleness { window_ms: 0 } = self.partition_policy {
            return Err(ConfigError::Inconsistent(
                "staleness window must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Peers contacted concurrently in one round
    pub fn effective_fan_out(&self) -> usize {
        self.fan_out.min(self.max_peers)
    }
}

fn positive(field: &'static str, value: i64) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(ConfigError::InvalidConfiguration { field, value });
    }
    Ok(())
}

/// Externally supplied update of the four public tunables.
///
/// Values are signed so that out-of-range input such as `-1` reaches validation
/// instead of failing to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdate {
    pub max_peers: i64,
    pub sync_interval_ms: i64,
    pub shard_size_bytes: i64,
    pub redundancy_factor: i64,
}

impl ConfigUpdate {
    /// Apply on top of `base`, or fail without producing anything
    pub fn apply_to(&self, base: &SyncConfig) -> Result<SyncConfig, ConfigError> {
        positive("max_peers", self.max_peers)?;
        positive("sync_interval_ms", self.sync_interval_ms)?;
        positive("shard_size_bytes", self.shard_size_bytes)?;
        positive("redundancy_factor", self.redundancy_factor)?;

        let next = SyncConfig {
            max_peers: self.max_peers as usize,
            sync_interval_ms: self.sync_interval_ms as u64,
            shard_size_bytes: self.shard_size_bytes as usize,
            redundancy_factor: self.redundancy_factor as usize,
            ..base.clone()
        };
        next.validate()?;
        Ok(next)
    }
}

/// Shared handle to the live configuration
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<SyncConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: SyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// Snapshot of the configuration in effect right now
    pub async fn current(&self) -> Arc<SyncConfig> {
        self.inner.read().await.clone()
    }

    /// Validate and atomically replace the four public tunables
    pub async fn update_configuration(&self, update: ConfigUpdate) -> Result<Arc<SyncConfig>, ConfigError> {
        let mut guard = self.inner.write().await;
        let next = Arc::new(update.apply_to(&guard)?);
        *guard = next.clone();
        info!(
            "Configuration updated: max_peers={} interval={}ms shard_size={} redundancy={}",
            next.max_peers, next.sync_interval_ms, next.shard_size_bytes, next.redundancy_factor
        );
        Ok(next)
    }

    /// Replace the whole configuration
    pub async fn replace(&self, config: SyncConfig) -> Result<(), ConfigError> {
        config.validate()?;
        *self.inner.write().await = Arc::new(config);
        Ok(())
    }
}
