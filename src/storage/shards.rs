//! Local shard storage using sled embedded database
//!
//! The store is the only writer of shard versions. Every record holds the
//! payload together with its hash, so a reader never sees one without the other.

use sled::{Db, Tree};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::model::{ConflictRecord, GroupId, MergeMode, RedundancyGroup, Shard, ShardSummary};
use crate::crypto::{ContentHash, ShardId};
use crate::unix_millis;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Shard not found: {0}")]
    NotFound(ShardId),
    #[error("Shard of {size} bytes exceeds the {limit} byte limit")]
    ShardTooLarge { size: usize, limit: usize },
    #[error("Hash mismatch for shard {0}")]
    HashMismatch(ShardId),
    #[error("Group {group} is declared {declared:?}, shard claims {claimed:?}")]
    GroupModeMismatch {
        group: GroupId,
        declared: MergeMode,
        claimed: MergeMode,
    },
    #[error("Shard {0} already belongs to another redundancy group")]
    GroupChanged(ShardId),
}

/// Local storage for shards, group declarations, and the conflict audit trail
pub struct ShardStore {
    db: Db,
    shards: Tree,
    groups: Tree,
    audit: Tree,
    max_shard_bytes: AtomicUsize,
}

impl ShardStore {
    /// Open or create a shard store at the given path
    pub fn open(path: impl AsRef<Path>, max_shard_bytes: usize) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?, max_shard_bytes)
    }

    /// Open a store that lives only as long as the process
    pub fn open_temporary(max_shard_bytes: usize) -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?, max_shard_bytes)
    }

    fn from_db(db: Db, max_shard_bytes: usize) -> Result<Self, StorageError> {
        let shards = db.open_tree("shards")?;
        let groups = db.open_tree("groups")?;
        let audit = db.open_tree("audit")?;

        info!("Shard store opened with {} shards", shards.len());

        Ok(Self {
            db,
            shards,
            groups,
            audit,
            max_shard_bytes: AtomicUsize::new(max_shard_bytes),
        })
    }

    pub fn shard_size_limit(&self) -> usize {
        self.max_shard_bytes.load(Ordering::Relaxed)
    }

    pub fn set_shard_size_limit(&self, limit: usize) {
        self.max_shard_bytes.store(limit, Ordering::Relaxed);
    }

    fn check_size(&self, size: usize) -> Result<(), StorageError> {
        let limit = self.shard_size_limit();
        if size > limit {
            return Err(StorageError::ShardTooLarge { size, limit });
        }
        Ok(())
    }

    /// Create version 1 of a new shard and return its id
    pub fn create_shard(&self, group: RedundancyGroup, payload: Vec<u8>) -> Result<ShardId, StorageError> {
        self.check_size(payload.len())?;
        self.declare_group(&group)?;

        let shard = Shard::new(group, payload, unix_millis());
        self.shards
            .insert(shard.id.as_bytes(), serde_json::to_vec(&shard)?)?;

        debug!("Created shard {} in group {}", shard.id, shard.group.id);
        Ok(shard.id)
    }

    /// Recompute the payload hash and compare. No side effects.
    pub fn validate_shard(shard: &Shard) -> bool {
        shard.is_valid()
    }

    /// Retrieve the current version of a shard
    pub fn get(&self, id: &ShardId) -> Result<Shard, StorageError> {
        self.find(id)?.ok_or(StorageError::NotFound(*id))
    }

    /// Retrieve a shard if present
    pub fn find(&self, id: &ShardId) -> Result<Option<Shard>, StorageError> {
        match self.shards.get(id.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, id: &ShardId) -> Result<bool, StorageError> {
        Ok(self.shards.contains_key(id.as_bytes())?)
    }

    /// Replace the payload of a local shard, bumping its version
    pub fn update_shard(&self, id: &ShardId, payload: Vec<u8>) -> Result<Shard, StorageError> {
        self.apply_update(id, payload, unix_millis())
    }

    /// Version bump with an explicit timestamp.
    ///
    /// Read-modify-write via compare-and-swap so concurrent writers cannot lose
    /// a version or pair a payload with a stale hash.
    pub(crate) fn apply_update(
        &self,
        id: &ShardId,
        payload: Vec<u8>,
        timestamp: u64,
    ) -> Result<Shard, StorageError> {
        self.check_size(payload.len())?;

        loop {
            let old = self
                .shards
                .get(id.as_bytes())?
                .ok_or(StorageError::NotFound(*id))?;
            let current: Shard = serde_json::from_slice(&old)?;
            let next = current.next_version(payload.clone(), timestamp);
            let encoded = serde_json::to_vec(&next)?;

            match self
                .shards
                .compare_and_swap(id.as_bytes(), Some(old), Some(encoded))?
            {
                Ok(()) => {
                    debug!("Shard {} now at version {}", id, next.version);
                    return Ok(next);
                }
                Err(_) => continue,
            }
        }
    }

    fn check_commit(&self, shard: &Shard) -> Result<(), StorageError> {
        if !shard.is_valid() {
            warn!("Rejecting shard {} with mismatched hash", shard.id);
            return Err(StorageError::HashMismatch(shard.id));
        }
        self.check_size(shard.size())?;
        self.declare_group(&shard.group)
    }

    /// Commit a shard version produced elsewhere (received or resolved).
    ///
    /// The shard must pass hash validation and agree with the declared group mode.
    pub fn commit(&self, shard: &Shard) -> Result<(), StorageError> {
        self.check_commit(shard)?;

        // An undecodable record is corrupt and may be replaced
        if let Some(raw) = self.shards.get(shard.id.as_bytes())? {
            if let Ok(existing) = serde_json::from_slice::<Shard>(&raw) {
                if existing.group.id != shard.group.id {
                    return Err(StorageError::GroupChanged(shard.id));
                }
            }
        }

        self.shards
            .insert(shard.id.as_bytes(), serde_json::to_vec(shard)?)?;
        debug!("Committed shard {} version {}", shard.id, shard.version);
        Ok(())
    }

    /// Commit `shard` only while the stored version still hashes to `expected`
    /// (`None` when nothing was stored).
    ///
    /// Returns `false` without writing when another writer got there first.
    pub fn commit_if(&self, expected: Option<ContentHash>, shard: &Shard) -> Result<bool, StorageError> {
        self.check_commit(shard)?;
        let encoded = serde_json::to_vec(shard)?;

        loop {
            let old = self.shards.get(shard.id.as_bytes())?;
            let current = match &old {
                Some(raw) => Some(serde_json::from_slice::<Shard>(raw)?),
                None => None,
            };
            if current.as_ref().map(|existing| existing.hash) != expected {
                debug!("Shard {} moved on before commit", shard.id);
                return Ok(false);
            }
            if let Some(existing) = &current {
                if existing.group.id != shard.group.id {
                    return Err(StorageError::GroupChanged(shard.id));
                }
            }

            match self
                .shards
                .compare_and_swap(shard.id.as_bytes(), old, Some(encoded.clone()))?
            {
                Ok(()) => {
                    debug!("Committed shard {} version {}", shard.id, shard.version);
                    return Ok(true);
                }
                Err(_) => continue,
            }
        }
    }

    /// Evict a shard
    pub fn remove(&self, id: &ShardId) -> Result<Option<Shard>, StorageError> {
        match self.shards.remove(id.as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Pin the merge mode of a group on first sight; later declarations must agree
    pub fn declare_group(&self, group: &RedundancyGroup) -> Result<(), StorageError> {
        let key = group.id.as_str().as_bytes();
        let encoded = serde_json::to_vec(&group.mode)?;

        match self.groups.compare_and_swap(key, None as Option<&[u8]>, Some(encoded))? {
            Ok(()) => {
                debug!("Declared group {} as {:?}", group.id, group.mode);
                Ok(())
            }
            Err(cas) => {
                let declared: MergeMode = match cas.current {
                    Some(raw) => serde_json::from_slice(&raw)?,
                    None => group.mode,
                };
                if declared != group.mode {
                    return Err(StorageError::GroupModeMismatch {
                        group: group.id.clone(),
                        declared,
                        claimed: group.mode,
                    });
                }
                Ok(())
            }
        }
    }

    /// Declared mode of a group, if known
    pub fn group_mode(&self, group: &GroupId) -> Result<Option<MergeMode>, StorageError> {
        match self.groups.get(group.as_str().as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// List all stored shard IDs
    pub fn list_shards(&self) -> Result<Vec<ShardId>, StorageError> {
        let mut ids = Vec::new();
        for item in self.shards.iter() {
            let (key, _) = item?;
            if let Ok(bytes) = <[u8; 32]>::try_from(key.as_ref()) {
                ids.push(ShardId::from_bytes(bytes));
            }
        }
        Ok(ids)
    }

    /// Every record, with `None` where the record cannot be decoded
    pub fn records(&self) -> Result<Vec<(ShardId, Option<Shard>)>, StorageError> {
        let mut records = Vec::new();
        for item in self.shards.iter() {
            let (key, value) = item?;
            let Ok(bytes) = <[u8; 32]>::try_from(key.as_ref()) else {
                continue;
            };
            records.push((ShardId::from_bytes(bytes), serde_json::from_slice(&value).ok()));
        }
        Ok(records)
    }

    /// Digest of every intact shard. Corrupt shards are left out so that peers
    /// push their good copy back.
    pub fn summary(&self) -> Result<ShardSummary, StorageError> {
        let mut summary = ShardSummary::new();
        for (id, record) in self.records()? {
            match record {
                Some(shard) if shard.is_valid() => {
                    summary.insert(id, shard.digest());
                }
                _ => debug!("Leaving corrupt shard {} out of summary", id),
            }
        }
        Ok(summary)
    }

    /// All shards currently stored for a group
    pub fn shards_in_group(&self, group: &GroupId) -> Result<Vec<Shard>, StorageError> {
        Ok(self
            .records()?
            .into_iter()
            .filter_map(|(_, record)| record)
            .filter(|shard| &shard.group.id == group)
            .collect())
    }

    /// Append a settled conflict to the audit trail
    pub fn record_conflict(&self, record: &ConflictRecord) -> Result<(), StorageError> {
        let key = self.db.generate_id()?.to_be_bytes();
        self.audit.insert(key, serde_json::to_vec(record)?)?;
        Ok(())
    }

    /// Settled conflicts, oldest first
    pub fn audit_trail(&self) -> Result<Vec<ConflictRecord>, StorageError> {
        let mut trail = Vec::new();
        for item in self.audit.iter() {
            let (_, value) = item?;
            trail.push(serde_json::from_slice(&value)?);
        }
        Ok(trail)
    }

    /// Get total payload bytes stored
    pub fn total_size(&self) -> Result<u64, StorageError> {
        let mut total = 0u64;
        for (_, record) in self.records()? {
            if let Some(shard) = record {
                total += shard.size() as u64;
            }
        }
        Ok(total)
    }

    /// Get number of stored shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Flush changes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    /// Overwrite a payload without rehashing, to simulate disk corruption
    #[cfg(test)]
    pub(crate) fn tamper_payload(&self, id: &ShardId, payload: &[u8]) -> Result<(), StorageError> {
        let mut shard = self.get(id)?;
        shard.payload = payload.to_vec();
        self.shards
            .insert(id.as_bytes(), serde_json::to_vec(&shard)?)?;
        Ok(())
    }
}
