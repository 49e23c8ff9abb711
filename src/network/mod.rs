//! Peer exchange layer
//!
//! - `protocol`: request/response messages and the libp2p envelope codec
//! - `transport`: the seam to whatever physically moves bytes between peers
//! - `client`: sealed request/response on top of a transport
//! - `memory`: in-process transport for local clusters and tests

pub mod client;
pub mod memory;
pub mod protocol;
pub mod transport;

pub use client::{Exchange, ExchangeError, PeerClient};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use protocol::{EnvelopeCodec, PeerAdvert, SyncRequest, SyncResponse, EXCHANGE_PROTOCOL};
pub use transport::{InboundHandler, Transport, TransportError};
