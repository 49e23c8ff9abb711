//! Storage module for local shard persistence
//!
//! Uses sled embedded database for fast, reliable storage.

pub mod model;
pub mod shards;

pub use model::{
    ConflictRecord, GroupId, MergeMode, RedundancyGroup, ResolutionStrategy, Shard, ShardDigest,
    ShardSummary,
};
pub use shards::{ShardStore, StorageError};
