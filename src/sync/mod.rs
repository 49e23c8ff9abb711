//! Shard synchronization
//!
//! - `orchestrator`: initiator side, one round at a time
//! - `service`: responder side, answers requests from other nodes
//! - `state`: round state machine
//! - `backoff`: per-peer retry scheduling
//! - `replicas`: which peers hold which shards

mod backoff;
mod orchestrator;
mod replicas;
mod service;
mod state;

pub use backoff::BackoffTracker;
pub use orchestrator::{
    ConflictAnomaly, PeerReport, RoundReport, SyncFailure, SyncOrchestrator, SyncOutcome, SyncParts, SyncStats,
};
pub use replicas::ReplicaMap;
pub use service::SyncService;
pub use state::{RoundStateMachine, SyncState, TransitionRecord};
