//! Integrity verifier
//!
//! Certifies the local shard set by Merkle root and computes the shard-by-shard
//! difference against a remote summary when roots disagree.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::merkle;
use crate::crypto::ShardId;
use crate::storage::{ShardStore, ShardSummary, StorageError};

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Shard not held locally: {0}")]
    UnknownShard(ShardId),
}

/// Shard ids on which two summaries disagree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryDiff {
    /// Held remotely, absent here
    pub missing_locally: Vec<ShardId>,
    /// Held here, absent remotely
    pub missing_remotely: Vec<ShardId>,
    /// Held on both sides with different content hashes
    pub differing: Vec<ShardId>,
}

impl SummaryDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_locally.is_empty() && self.missing_remotely.is_empty() && self.differing.is_empty()
    }

    pub fn len(&self) -> usize {
        self.missing_locally.len() + self.missing_remotely.len() + self.differing.len()
    }
}

pub struct IntegrityVerifier {
    store: Arc<ShardStore>,
}

impl IntegrityVerifier {
    pub fn new(store: Arc<ShardStore>) -> Self {
        Self { store }
    }

    /// Merkle root over the given local shards, in canonical id order
    pub fn calculate_merkle_root(&self, shard_ids: &[ShardId]) -> Result<String, IntegrityError> {
        let mut entries = Vec::with_capacity(shard_ids.len());
        for id in shard_ids {
            let shard = self
                .store
                .find(id)?
                .ok_or(IntegrityError::UnknownShard(*id))?;
            entries.push((*id, shard.hash));
        }
        Ok(merkle::root_of(entries.iter().map(|(id, hash)| (id, hash))))
    }

    /// Root of a summary as a peer would compute it
    pub fn root_of_summary(summary: &ShardSummary) -> String {
        merkle::root_of(summary.iter().map(|(id, digest)| (id, &digest.hash)))
    }

    /// Root over every intact local shard
    pub fn local_root(&self) -> Result<String, IntegrityError> {
        Ok(Self::root_of_summary(&self.store.summary()?))
    }

    /// Shard-by-shard comparison of two summaries
    pub fn diff(local: &ShardSummary, remote: &ShardSummary) -> SummaryDiff {
        let mut diff = SummaryDiff::default();

        for (id, digest) in remote {
            match local.get(id) {
                None => diff.missing_locally.push(*id),
                Some(mine) if mine.hash != digest.hash => diff.differing.push(*id),
                Some(_) => {}
            }
        }
        for id in local.keys() {
            if !remote.contains_key(id) {
                diff.missing_remotely.push(*id);
            }
        }

        diff
    }

    /// Diff only when the advertised root disagrees with ours
    pub fn compare(local: &ShardSummary, remote: &ShardSummary, remote_root: &str) -> SummaryDiff {
        if Self::root_of_summary(local) == remote_root {
            debug!("Merkle roots agree; skipping shard diff");
            return SummaryDiff::default();
        }
        Self::diff(local, remote)
    }

    /// Whether the stored copy of a shard still matches its hash
    pub fn verify_shard(&self, id: &ShardId) -> Result<bool, IntegrityError> {
        Ok(self.store.get(id)?.is_valid())
    }

    /// Ids of stored shards whose record is unreadable or whose hash fails
    pub fn scan_corrupt(&self) -> Result<Vec<ShardId>, IntegrityError> {
        let mut corrupt = Vec::new();
        for (id, record) in self.store.records()? {
            let intact = record.map(|shard| shard.is_valid()).unwrap_or(false);
            if !intact {
                warn!("Shard {} failed integrity check", id);
                corrupt.push(id);
            }
        }
        Ok(corrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RedundancyGroup;

    fn verifier() -> (Arc<ShardStore>, IntegrityVerifier) {
        let store = Arc::new(ShardStore::open_temporary(1024).unwrap());
        (store.clone(), IntegrityVerifier::new(store))
    }

    #[test]
    fn test_root_is_canonical() {
        let (store, verifier) = verifier();
        let ids: Vec<_> = (0..4u8)
            .map(|n| {
                store
                    .create_shard(RedundancyGroup::overwrite("g"), vec![n])
                    .unwrap()
            })
            .collect();

        let mut reversed = ids.clone();
        reversed.reverse();
        assert_eq!(
            verifier.calculate_merkle_root(&ids).unwrap(),
            verifier.calculate_merkle_root(&reversed).unwrap()
        );
        assert_eq!(
            verifier.calculate_merkle_root(&ids).unwrap(),
            verifier.local_root().unwrap()
        );
    }

    #[test]
    fn test_unknown_shard_is_error() {
        let (_store, verifier) = verifier();
        let missing = ShardId::from_bytes([9; 32]);
        assert!(matches!(
            verifier.calculate_merkle_root(&[missing]),
            Err(IntegrityError::UnknownShard(id)) if id == missing
        ));
    }

    #[test]
    fn test_matching_roots_mean_empty_diff() {
        let (store, _verifier) = verifier();
        for n in 0..6u8 {
            store
                .create_shard(RedundancyGroup::overwrite("g"), vec![n; 3])
                .unwrap();
        }

        let local = store.summary().unwrap();
        let remote = local.clone();
        let root = IntegrityVerifier::root_of_summary(&remote);

        assert!(IntegrityVerifier::compare(&local, &remote, &root).is_empty());
        assert!(IntegrityVerifier::diff(&local, &remote).is_empty());
    }

    #[test]
    fn test_diff_classifies_entries() {
        let (store, _verifier) = verifier();
        let shared = store
            .create_shard(RedundancyGroup::overwrite("g"), b"shared".to_vec())
            .unwrap();
        let changed = store
            .create_shard(RedundancyGroup::overwrite("g"), b"v1".to_vec())
            .unwrap();
        let only_local = store
            .create_shard(RedundancyGroup::overwrite("g"), b"mine".to_vec())
            .unwrap();
        let local = store.summary().unwrap();

        let mut remote = local.clone();
        remote.remove(&only_local);
        let other = crate::storage::Shard::new(RedundancyGroup::overwrite("g"), b"theirs".to_vec(), 5);
        remote.insert(other.id, other.digest());
        if let Some(digest) = remote.get_mut(&changed) {
            digest.hash = crate::crypto::ContentHash::of(b"v2");
        }

        let root = IntegrityVerifier::root_of_summary(&remote);
        let diff = IntegrityVerifier::compare(&local, &remote, &root);
        assert_eq!(diff.missing_locally, vec![other.id]);
        assert_eq!(diff.missing_remotely, vec![only_local]);
        assert_eq!(diff.differing, vec![changed]);
        assert!(!diff.differing.contains(&shared));
        assert_eq!(diff.len(), 3);
    }

    #[test]
    fn test_scan_finds_tampered_shard() {
        let (store, verifier) = verifier();
        let good = store
            .create_shard(RedundancyGroup::overwrite("g"), b"good".to_vec())
            .unwrap();
        let bad = store
            .create_shard(RedundancyGroup::overwrite("g"), b"bad".to_vec())
            .unwrap();
        store.tamper_payload(&bad, b"worse").unwrap();

        assert_eq!(verifier.scan_corrupt().unwrap(), vec![bad]);
        assert!(verifier.verify_shard(&good).unwrap());
        assert!(!verifier.verify_shard(&bad).unwrap());
    }
}
