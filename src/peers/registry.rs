//! Peer registry
//!
//! Sole owner and writer of peer entries and their reliability. Other
//! components get cloned `Peer` views.

use libp2p::identity::PublicKey;
use libp2p::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::reputation::{PeerReputation, ReputationConfig, ReputationOutcome};
use crate::network::PeerAdvert;
use crate::unix_millis;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Peer {0} is already pinned to a different public key")]
    DuplicateRejected(PeerId),
    #[error("Unknown peer {0}")]
    UnknownPeer(PeerId),
}

/// Reachability of a peer as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Active,
    /// Confirmed failure, with the time it was recorded
    Unreachable { since: u64 },
}

/// Read-only view of a registered peer
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub id: PeerId,
    pub address: Multiaddr,
    pub public_key: PublicKey,
    /// Reliability in [0, 1]
    pub reliability: f64,
    /// Milliseconds since the Unix epoch
    pub last_seen: u64,
    pub status: PeerStatus,
}

impl Peer {
    /// A peer as presented by a handshake; reliability is assigned on insert
    pub fn new(address: Multiaddr, public_key: PublicKey) -> Self {
        Self {
            id: PeerId::from_public_key(&public_key),
            address,
            public_key,
            reliability: 0.0,
            last_seen: unix_millis(),
            status: PeerStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PeerStatus::Active
    }

    pub fn advert(&self) -> PeerAdvert {
        PeerAdvert::new(self.id, self.address.clone(), &self.public_key)
    }
}

/// Ticket for one exchange with one peer. Removing the peer invalidates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTicket {
    pub peer: PeerId,
    generation: u64,
}

struct PeerEntry {
    peer: Peer,
    reputation: PeerReputation,
    session: Option<u64>,
}

pub struct PeerRegistry {
    config: ReputationConfig,
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
    max_peers: AtomicUsize,
    next_session: AtomicU64,
}

impl PeerRegistry {
    pub fn new(config: ReputationConfig, max_peers: usize) -> Self {
        Self {
            config,
            peers: RwLock::new(HashMap::new()),
            max_peers: AtomicUsize::new(max_peers),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers.load(Ordering::Relaxed)
    }

    /// New bound applies to future inserts; existing entries are kept
    pub fn set_max_peers(&self, max_peers: usize) {
        self.max_peers.store(max_peers, Ordering::Relaxed);
    }

    /// Insert a new peer or refresh a known one.
    ///
    /// A known id presenting a different public key is rejected. When the table
    /// is full the lowest-reliability entry makes room.
    pub async fn add_peer(&self, peer: Peer) -> Result<(), RegistryError> {
        let mut peers = self.peers.write().await;

        if let Some(entry) = peers.get_mut(&peer.id) {
            if entry.peer.public_key != peer.public_key {
                warn!("Rejecting key change for pinned peer {}", peer.id);
                return Err(RegistryError::DuplicateRejected(peer.id));
            }
            entry.peer.address = peer.address;
            entry.peer.last_seen = unix_millis();
            entry.peer.status = PeerStatus::Active;
            return Ok(());
        }

        if peers.len() >= self.max_peers() {
            Self::evict_lowest(&mut peers);
        }

        let reputation = PeerReputation::new(self.config.baseline);
        let id = peer.id;
        peers.insert(
            id,
            PeerEntry {
                peer: Peer {
                    reliability: reputation.score(),
                    last_seen: unix_millis(),
                    status: PeerStatus::Active,
                    ..peer
                },
                reputation,
                session: None,
            },
        );
        info!("Added peer {}", id);
        Ok(())
    }

    fn evict_lowest(peers: &mut HashMap<PeerId, PeerEntry>) {
        let lowest = peers
            .values()
            .min_by(|a, b| {
                a.peer
                    .reliability
                    .partial_cmp(&b.peer.reliability)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.peer.id.cmp(&b.peer.id))
            })
            .map(|entry| entry.peer.id);

        if let Some(id) = lowest {
            peers.remove(&id);
            info!("Evicted lowest-reliability peer {}", id);
        }
    }

    /// Evict a peer; any session ticket issued for it stops being valid
    pub async fn remove_peer(&self, id: &PeerId) -> Option<Peer> {
        let removed = self.peers.write().await.remove(id).map(|entry| entry.peer);
        if removed.is_some() {
            info!("Removed peer {}", id);
        }
        removed
    }

    pub async fn get_peer(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().await.get(id).map(|entry| entry.peer.clone())
    }

    pub async fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn peers(&self) -> Vec<Peer> {
        self.peers
            .read()
            .await
            .values()
            .map(|entry| entry.peer.clone())
            .collect()
    }

    pub async fn active_peers(&self) -> Vec<Peer> {
        self.peers
            .read()
            .await
            .values()
            .filter(|entry| entry.peer.is_active())
            .map(|entry| entry.peer.clone())
            .collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Apply a sync outcome to a peer's reliability
    pub async fn update_reputation(&self, id: &PeerId, outcome: ReputationOutcome) -> Result<f64, RegistryError> {
        let mut peers = self.peers.write().await;
        let entry = peers.get_mut(id).ok_or(RegistryError::UnknownPeer(*id))?;

        let score = entry.reputation.record(outcome, &self.config);
        entry.peer.reliability = score;
        debug!("Reputation of {} after {:?}: {:.3}", id, outcome, score);
        Ok(score)
    }

    pub async fn get_reputation(&self, id: &PeerId) -> Option<f64> {
        self.peers.read().await.get(id).map(|entry| entry.peer.reliability)
    }

    /// Peers sorted by reliability, highest first; ties by id
    pub async fn ranked_peers(&self) -> Vec<Peer> {
        let mut peers = self.peers().await;
        peers.sort_by(|a, b| {
            b.reliability
                .partial_cmp(&a.reliability)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        peers
    }

    /// Average reliability across the table
    pub async fn average_reliability(&self) -> f64 {
        let peers = self.peers.read().await;
        if peers.is_empty() {
            return self.config.baseline;
        }
        peers.values().map(|entry| entry.peer.reliability).sum::<f64>() / peers.len() as f64
    }

    pub async fn mark_seen(&self, id: &PeerId) {
        if let Some(entry) = self.peers.write().await.get_mut(id) {
            entry.peer.last_seen = unix_millis();
            entry.peer.status = PeerStatus::Active;
        }
    }

    pub async fn mark_unreachable(&self, id: &PeerId) -> Result<(), RegistryError> {
        let mut peers = self.peers.write().await;
        let entry = peers.get_mut(id).ok_or(RegistryError::UnknownPeer(*id))?;
        if entry.peer.is_active() {
            entry.peer.status = PeerStatus::Unreachable { since: unix_millis() };
        }
        entry.session = None;
        Ok(())
    }

    /// Open an exchange session with a peer
    pub async fn begin_session(&self, id: &PeerId) -> Result<SessionTicket, RegistryError> {
        let mut peers = self.peers.write().await;
        let entry = peers.get_mut(id).ok_or(RegistryError::UnknownPeer(*id))?;
        let generation = self.next_session.fetch_add(1, Ordering::Relaxed);
        entry.session = Some(generation);
        Ok(SessionTicket { peer: *id, generation })
    }

    /// Whether results gathered under `ticket` may still be committed
    pub async fn session_valid(&self, ticket: &SessionTicket) -> bool {
        self.peers
            .read()
            .await
            .get(&ticket.peer)
            .map(|entry| entry.session == Some(ticket.generation))
            .unwrap_or(false)
    }

    pub async fn end_session(&self, ticket: &SessionTicket) {
        if let Some(entry) = self.peers.write().await.get_mut(&ticket.peer) {
            if entry.session == Some(ticket.generation) {
                entry.session = None;
            }
        }
    }

    /// Gossip entries for every active peer except `exclude`
    pub async fn adverts(&self, exclude: &PeerId) -> Vec<PeerAdvert> {
        self.peers
            .read()
            .await
            .values()
            .filter(|entry| entry.peer.is_active() && entry.peer.id != *exclude)
            .map(|entry| entry.peer.advert())
            .collect()
    }

    /// Insert adverts for peers not yet known. Returns how many were new.
    pub async fn merge_adverts(&self, local: &PeerId, adverts: Vec<PeerAdvert>) -> usize {
        let mut discovered = 0;

        for advert in adverts {
            if advert.peer_id == *local || self.contains(&advert.peer_id).await {
                continue;
            }
            let Some(public_key) = advert.decode_key() else {
                warn!("Ignoring advert for {} with malformed key", advert.peer_id);
                continue;
            };
            if PeerId::from_public_key(&public_key) != advert.peer_id {
                warn!("Ignoring advert for {} with foreign key", advert.peer_id);
                continue;
            }

            if self.add_peer(Peer::new(advert.address, public_key)).await.is_ok() {
                discovered += 1;
            }
        }

        discovered
    }
}
