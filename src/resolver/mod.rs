//! Conflict & consensus resolution
//!
//! Two modes, chosen by the redundancy group's declared merge mode:
//! - `Overwrite`: last-write-wins by timestamp, ties broken by content hash
//! - `Additive`: a version derived from the other wins outright; concurrent
//!   branches merge by union of records and sum of totals into a new version
//!
//! The two are never mixed on the same group.

mod conflict;
mod merge;

use thiserror::Error;

use crate::crypto::ShardId;
use crate::storage::{GroupId, StorageError};

pub use conflict::{
    merge_additive, resolve_last_write_wins, ConflictCheck, ConflictResolution, ConflictResolver, Reconciled,
    Resolved, Settled,
};
pub use merge::{merge_payloads, AdditivePayload};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Conflict on shard {shard_id} needs merge-policy review: {reason}")]
    ConflictAnomaly { shard_id: ShardId, reason: String },
    #[error("Group {0} is not declared additive")]
    NotAdditive(GroupId),
    #[error("Group {0} is not declared overwrite")]
    NotOverwrite(GroupId),
    #[error("Total {0} overflowed while merging")]
    Overflow(String),
    #[error("Malformed additive payload: {0}")]
    Malformed(serde_json::Error),
    #[error("No versions to resolve")]
    Empty,
    #[error("Shard {0} kept changing while it was being resolved")]
    Contended(ShardId),
}
