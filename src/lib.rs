//! ShardSync - peer-to-peer shard synchronization engine
//!
//! Every node keeps a local set of shards and periodically reconciles it with
//! a handful of trusted peers:
//! - Shards are content-addressed with BLAKE3 and carry a version and timestamp
//! - Traffic between peers is sealed with XChaCha20-Poly1305
//! - Both sides of an exchange prove their identity by signing a fresh
//!   challenge with the key the other side pinned for them
//! - Concurrent updates are settled by last-write-wins or additive merge,
//!   depending on the shard's redundancy group
//! - Lost or corrupt shards are rebuilt from peers that still hold them

pub mod config;
pub mod crypto;
pub mod integrity;
pub mod metrics;
pub mod network;
pub mod node;
pub mod peers;
pub mod recovery;
pub mod resolver;
pub mod security;
pub mod storage;
pub mod sync;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types
pub use config::{ConfigError, ConfigHandle, ConfigUpdate, PartitionPolicy, SyncConfig};
pub use crypto::{ContentHash, SessionKey, ShardId};
pub use integrity::{IntegrityVerifier, SummaryDiff};
pub use metrics::{MetricsCollector, NetworkMetrics, PartitionStatus, SyncSession};
pub use network::{MemoryNetwork, PeerClient, SyncRequest, SyncResponse, Transport};
pub use node::ShardSyncNode;
pub use peers::{Peer, PeerRegistry, PeerStatus, RegistryError, ReputationOutcome};
pub use recovery::{AvailabilityReport, RecoveryError, RecoveryManager, RecoveryOutcome, SweepReport};
pub use resolver::{ConflictResolution, ConflictResolver, ResolveError};
pub use security::{SecurityError, SecurityGateway};
pub use storage::{
    ConflictRecord, GroupId, MergeMode, RedundancyGroup, ResolutionStrategy, Shard, ShardStore,
    StorageError,
};
pub use sync::{RoundReport, SyncFailure, SyncOrchestrator, SyncOutcome, SyncState};

/// Milliseconds since the Unix epoch
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
