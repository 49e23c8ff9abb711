//! In-process transport
//!
//! Routes envelopes between nodes living in the same process. Used by the
//! local cluster runner and by multi-node tests, which can also take a peer
//! offline or make it hang to exercise failure and timeout handling.

use async_trait::async_trait;
use libp2p::PeerId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::transport::{InboundHandler, Transport, TransportError};
use crate::security::Envelope;

/// Shared switchboard for in-process nodes
#[derive(Default)]
pub struct MemoryNetwork {
    handlers: RwLock<HashMap<PeerId, Arc<dyn InboundHandler>>>,
    offline: RwLock<HashSet<PeerId>>,
    stalled: RwLock<HashSet<PeerId>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node's inbound handler
    pub async fn register(&self, peer: PeerId, handler: Arc<dyn InboundHandler>) {
        self.handlers.write().await.insert(peer, handler);
    }

    /// Make every request to `peer` fail immediately
    pub async fn set_offline(&self, peer: PeerId, offline: bool) {
        let mut set = self.offline.write().await;
        if offline {
            set.insert(peer);
        } else {
            set.remove(&peer);
        }
    }

    /// Make every request to `peer` hang until the caller gives up
    pub async fn set_stalled(&self, peer: PeerId, stalled: bool) {
        let mut set = self.stalled.write().await;
        if stalled {
            set.insert(peer);
        } else {
            set.remove(&peer);
        }
    }

    /// Transport handle for the node `local`
    pub fn transport_for(self: &Arc<Self>, local: PeerId) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local,
        }
    }
}

/// One node's view of a `MemoryNetwork`
#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    local: PeerId,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: &PeerId, envelope: Envelope) -> Result<Envelope, TransportError> {
        if self.network.offline.read().await.contains(peer) {
            return Err(TransportError::Unreachable(*peer));
        }
        if self.network.stalled.read().await.contains(peer) {
            debug!("Request from {} to stalled peer {}", self.local, peer);
            futures::future::pending::<()>().await;
        }

        let handler = self
            .network
            .handlers
            .read()
            .await
            .get(peer)
            .cloned()
            .ok_or(TransportError::Unreachable(*peer))?;

        Ok(handler.handle(self.local, envelope).await)
    }
}
