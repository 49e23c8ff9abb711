//! Binary Merkle tree over shard digests
//!
//! Leaves are BLAKE3(shard id || content hash) in canonical id order. An odd
//! node at any level is paired with itself. The empty set has an all-zero root.

use crate::crypto::{ContentHash, ShardId};

/// Root of the empty shard set
pub const EMPTY_ROOT: [u8; 32] = [0u8; 32];

/// Leaf hash for one shard
pub fn leaf(id: &ShardId, hash: &ContentHash) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(id.as_bytes());
    hasher.update(hash.as_bytes());
    *hasher.finalize().as_bytes()
}

fn parent(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left);
    hasher.update(right);
    *hasher.finalize().as_bytes()
}

/// Fold leaves (already in canonical order) up to the root
pub fn root_of_leaves(mut level: Vec<[u8; 32]>) -> [u8; 32] {
    if level.is_empty() {
        return EMPTY_ROOT;
    }

    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => parent(left, right),
                [single] => parent(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }

    level[0]
}

/// Root over `(id, hash)` entries. Entries are sorted and deduplicated by id
/// first, so input order never affects the result.
pub fn root_of<'a>(entries: impl IntoIterator<Item = (&'a ShardId, &'a ContentHash)>) -> String {
    let mut entries: Vec<_> = entries.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.dedup_by(|a, b| a.0 == b.0);

    hex::encode(root_of_leaves(
        entries.into_iter().map(|(id, hash)| leaf(id, hash)).collect(),
    ))
}
