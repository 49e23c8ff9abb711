//! Sealed request/response client
//!
//! Serializes a request, seals it through the security gateway, hands it to the
//! transport, and opens the reply.

use libp2p::PeerId;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::protocol::{SyncRequest, SyncResponse};
use super::transport::{Transport, TransportError};
use crate::security::{SecurityError, SecurityGateway};

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),
    #[error("Message encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Remote error: {0}")]
    Remote(String),
    #[error("Unexpected response to {0}")]
    Unexpected(&'static str),
}

/// A reply together with the bytes the exchange put on the wire
#[derive(Debug)]
pub struct Exchange {
    pub response: SyncResponse,
    pub bytes: u64,
}

#[derive(Clone)]
pub struct PeerClient {
    transport: Arc<dyn Transport>,
    gateway: Arc<SecurityGateway>,
}

impl PeerClient {
    pub fn new(transport: Arc<dyn Transport>, gateway: Arc<SecurityGateway>) -> Self {
        Self { transport, gateway }
    }

    /// Send one request and wait for the reply
    pub async fn call(&self, peer: &PeerId, request: &SyncRequest) -> Result<Exchange, ExchangeError> {
        let plaintext = serde_json::to_vec(request)?;
        let outbound = self.gateway.encrypt_data(&plaintext)?;
        let sent = outbound.wire_size();

        let inbound = self.transport.send(peer, outbound).await?;
        let received = inbound.wire_size();

        let opened = self.gateway.decrypt_data(&inbound)?;
        let response: SyncResponse = serde_json::from_slice(&opened)?;

        if let SyncResponse::Error { message } = response {
            return Err(ExchangeError::Remote(message));
        }

        Ok(Exchange {
            response,
            bytes: sent + received,
        })
    }

    /// `call` bounded by a deadline
    pub async fn call_with_timeout(
        &self,
        peer: &PeerId,
        request: &SyncRequest,
        timeout: Duration,
    ) -> Result<Exchange, ExchangeError> {
        tokio::time::timeout(timeout, self.call(peer, request))
            .await
            .map_err(|_| ExchangeError::Timeout(timeout))?
    }
}
