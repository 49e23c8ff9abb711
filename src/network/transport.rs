//! Transport seam
//!
//! The engine never opens sockets. It hands sealed envelopes to a `Transport`
//! and answers envelopes delivered to its `InboundHandler`.

use async_trait::async_trait;
use libp2p::PeerId;
use thiserror::Error;

use crate::security::Envelope;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Peer {0} is unreachable")]
    Unreachable(PeerId),
    #[error("Connection closed: {0}")]
    Closed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound request/response delivery
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `envelope` to `peer` and wait for its reply
    async fn send(&self, peer: &PeerId, envelope: Envelope) -> Result<Envelope, TransportError>;
}

/// Receiver side of the exchange protocol
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, from: PeerId, envelope: Envelope) -> Envelope;
}
