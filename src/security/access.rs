//! Capability checks for sensitive shards

use libp2p::PeerId;
use std::collections::{HashMap, HashSet};

use crate::crypto::ShardId;

/// Which peers may read which sensitive shards.
///
/// Shards never marked sensitive are readable by every registered peer.
/// Sensitive shards are readable only by peers holding an explicit grant.
#[derive(Debug, Default, Clone)]
pub struct AccessPolicy {
    sensitive: HashSet<ShardId>,
    grants: HashMap<ShardId, HashSet<PeerId>>,
}

impl AccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_sensitive(&mut self, shard: ShardId) {
        self.sensitive.insert(shard);
    }

    pub fn is_sensitive(&self, shard: &ShardId) -> bool {
        self.sensitive.contains(shard)
    }

    pub fn grant(&mut self, peer: PeerId, shard: ShardId) {
        self.grants.entry(shard).or_default().insert(peer);
    }

    pub fn revoke(&mut self, peer: &PeerId, shard: &ShardId) {
        if let Some(peers) = self.grants.get_mut(shard) {
            peers.remove(peer);
            if peers.is_empty() {
                self.grants.remove(shard);
            }
        }
    }

    /// Drop every grant held by a peer
    pub fn revoke_all(&mut self, peer: &PeerId) {
        self.grants.retain(|_, peers| {
            peers.remove(peer);
            !peers.is_empty()
        });
    }

    pub fn allows(&self, peer: &PeerId, shard: &ShardId) -> bool {
        if !self.is_sensitive(shard) {
            return true;
        }
        self.grants
            .get(shard)
            .map(|peers| peers.contains(peer))
            .unwrap_or(false)
    }
}
