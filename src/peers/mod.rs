//! Peer registry
//!
//! Tracks known peers, their pinned keys, reachability and reliability.
//! Reliability is the only signal used to rank peers for synchronization.

mod registry;
mod reputation;

pub use registry::{Peer, PeerRegistry, PeerStatus, RegistryError, SessionTicket};
pub use reputation::{PeerReputation, ReputationConfig, ReputationEvent, ReputationOutcome};
