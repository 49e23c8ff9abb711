//! Shard data model

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::crypto::{verify_payload, ContentHash, ShardId};

/// Identifier of a redundancy group: all copies of one logical unit
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", self.0)
    }
}

/// How concurrent versions inside a group are reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Latest timestamp wins, ties broken by content hash
    Overwrite,
    /// Payloads are unioned and their totals summed
    Additive,
}

/// A redundancy group together with its declared merge mode
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RedundancyGroup {
    pub id: GroupId,
    pub mode: MergeMode,
}

impl RedundancyGroup {
    pub fn overwrite(id: impl Into<String>) -> Self {
        Self {
            id: GroupId::new(id),
            mode: MergeMode::Overwrite,
        }
    }

    pub fn additive(id: impl Into<String>) -> Self {
        Self {
            id: GroupId::new(id),
            mode: MergeMode::Additive,
        }
    }
}

/// One version of a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub group: RedundancyGroup,
    pub payload: Vec<u8>,
    pub hash: ContentHash,
    pub version: u64,
    /// Milliseconds since the Unix epoch of the last write
    pub timestamp: u64,
    /// Hashes of every earlier version this one was derived from
    #[serde(default)]
    pub ancestry: BTreeSet<ContentHash>,
}

impl Shard {
    /// Build version 1 of a new shard
    pub fn new(group: RedundancyGroup, payload: Vec<u8>, timestamp: u64) -> Self {
        let hash = ContentHash::of(&payload);
        Self {
            id: ShardId::derive(group.id.as_str(), &hash),
            group,
            payload,
            hash,
            version: 1,
            timestamp,
            ancestry: BTreeSet::new(),
        }
    }

    /// Produce the next version carrying `payload`. The receiver is left untouched.
    pub fn next_version(&self, payload: Vec<u8>, timestamp: u64) -> Self {
        let mut ancestry = self.ancestry.clone();
        ancestry.insert(self.hash);
        Self {
            id: self.id,
            group: self.group.clone(),
            hash: ContentHash::of(&payload),
            payload,
            version: self.version + 1,
            timestamp,
            ancestry,
        }
    }

    /// `other` is one of the versions this one was derived from
    pub fn descends_from(&self, other: &Shard) -> bool {
        self.hash != other.hash && self.ancestry.contains(&other.hash)
    }

    /// `hash` matches the digest of `payload`
    pub fn is_valid(&self) -> bool {
        verify_payload(&self.hash, &self.payload)
    }

    pub fn digest(&self) -> ShardDigest {
        ShardDigest {
            hash: self.hash,
            version: self.version,
            group: self.group.id.clone(),
        }
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }
}

/// What a peer advertises about one shard without sending the payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDigest {
    pub hash: ContentHash,
    pub version: u64,
    pub group: GroupId,
}

/// Shard id to digest, ordered canonically by id
pub type ShardSummary = BTreeMap<ShardId, ShardDigest>;

/// Strategy that settled a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    Merged,
}

/// Audit entry for a settled conflict. The losing versions are kept in full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub shard_id: ShardId,
    pub group: GroupId,
    pub strategy: ResolutionStrategy,
    pub winner: ContentHash,
    pub discarded: Vec<Shard>,
    pub resolved_at: u64,
}
