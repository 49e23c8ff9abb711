//! Which peers hold which shards
//!
//! Filled from remote summaries and acknowledged pushes. The recovery manager
//! counts redundancy from it.

use libp2p::PeerId;
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;

use crate::crypto::ShardId;

#[derive(Default)]
pub struct ReplicaMap {
    holders: RwLock<BTreeMap<ShardId, HashSet<PeerId>>>,
}

impl ReplicaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything known about `peer` with the ids of its latest summary
    pub async fn record_summary(&self, peer: PeerId, shards: impl IntoIterator<Item = ShardId>) {
        let mut holders = self.holders.write().await;
        for set in holders.values_mut() {
            set.remove(&peer);
        }
        for id in shards {
            holders.entry(id).or_default().insert(peer);
        }
        holders.retain(|_, set| !set.is_empty());
    }

    pub async fn add_holder(&self, shard: ShardId, peer: PeerId) {
        self.holders.write().await.entry(shard).or_default().insert(peer);
    }

    /// Forget a peer everywhere. Returns the shards it was holding.
    pub async fn remove_peer(&self, peer: &PeerId) -> Vec<ShardId> {
        let mut holders = self.holders.write().await;
        let mut affected = Vec::new();
        for (id, set) in holders.iter_mut() {
            if set.remove(peer) {
                affected.push(*id);
            }
        }
        holders.retain(|_, set| !set.is_empty());
        affected
    }

    pub async fn holders(&self, shard: &ShardId) -> Vec<PeerId> {
        self.holders
            .read()
            .await
            .get(shard)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn holder_count(&self, shard: &ShardId) -> usize {
        self.holders
            .read()
            .await
            .get(shard)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// Shards known to be held by at least one peer
    pub async fn tracked_shards(&self) -> Vec<ShardId> {
        self.holders.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> ShardId {
        ShardId::from_bytes([n; 32])
    }

    #[tokio::test]
    async fn test_summary_replaces_peer_holdings() {
        let replicas = ReplicaMap::new();
        let peer = PeerId::random();

        replicas.record_summary(peer, [id(1), id(2)]).await;
        replicas.record_summary(peer, [id(2), id(3)]).await;

        assert_eq!(replicas.holder_count(&id(1)).await, 0);
        assert_eq!(replicas.holder_count(&id(2)).await, 1);
        assert_eq!(replicas.tracked_shards().await, vec![id(2), id(3)]);
    }

    #[tokio::test]
    async fn test_remove_peer_reports_affected() {
        let replicas = ReplicaMap::new();
        let a = PeerId::random();
        let b = PeerId::random();
        replicas.add_holder(id(1), a).await;
        replicas.add_holder(id(1), b).await;
        replicas.add_holder(id(2), a).await;

        let mut affected = replicas.remove_peer(&a).await;
        affected.sort();
        assert_eq!(affected, vec![id(1), id(2)]);
        assert_eq!(replicas.holders(&id(1)).await, vec![b]);
        assert_eq!(replicas.holder_count(&id(2)).await, 0);
    }
}
