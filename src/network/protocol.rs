//! Peer exchange protocol definitions

use futures::prelude::*;
use libp2p::{identity::PublicKey, request_response::Codec, Multiaddr, PeerId, StreamProtocol};
use serde::{Deserialize, Serialize};
use std::io;

use crate::crypto::{ContentHash, ShardId};
use crate::security::Envelope;
use crate::storage::{Shard, ShardSummary};

/// Protocol name for sealed exchange messages
pub const EXCHANGE_PROTOCOL: StreamProtocol = StreamProtocol::new("/shardsync/exchange/1.0.0");

/// Largest envelope accepted from the wire
pub const MAX_ENVELOPE_BYTES: u64 = 64 * 1024 * 1024;

/// Request carried inside an envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncRequest {
    /// Ask the peer to sign a fresh challenge
    Hello { challenge: Vec<u8> },
    /// Answer the challenge returned in `Hello`, proving the initiator's key.
    /// Everything except `Hello`, `Prove` and `Ping` requires it.
    Prove { signature: Vec<u8> },
    /// Ask for the shard id → hash + version map
    Summary,
    /// Ask for the full current version of a shard
    FetchShard { shard_id: ShardId },
    /// Offer a shard version. `supersedes` is the hash the sender last saw on
    /// the receiving peer; a push whose base has moved on is rejected as stale.
    StoreShard {
        shard: Shard,
        supersedes: Option<ContentHash>,
    },
    /// Ask for the peer's known peers (gossip)
    Peers,
    /// Round-trip probe
    Ping,
}

/// Response carried inside an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncResponse {
    /// Signature over the initiator's challenge, plus a challenge in return
    Hello { signature: Vec<u8>, challenge: Vec<u8> },
    /// Proof accepted; the initiator is admitted
    Welcome,
    /// The requester is unknown or has not proven its key
    Unauthorized,
    Summary {
        summary: ShardSummary,
        merkle_root: String,
    },
    Shard { shard: Shard },
    NotFound { shard_id: ShardId },
    Denied { shard_id: ShardId },
    Stored { shard_id: ShardId, hash: ContentHash },
    Rejected { shard_id: ShardId, reason: String },
    Peers { peers: Vec<PeerAdvert> },
    Pong,
    Error { message: String },
}

/// Gossip entry describing a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAdvert {
    pub peer_id: PeerId,
    pub address: Multiaddr,
    /// Protobuf-encoded public key
    pub public_key: Vec<u8>,
}

impl PeerAdvert {
    pub fn new(peer_id: PeerId, address: Multiaddr, public_key: &PublicKey) -> Self {
        Self {
            peer_id,
            address,
            public_key: public_key.encode_protobuf(),
        }
    }

    /// Decode the advertised key; `None` when it is malformed
    pub fn decode_key(&self) -> Option<PublicKey> {
        PublicKey::try_decode_protobuf(&self.public_key).ok()
    }
}

/// JSON codec for sealed envelopes
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec;

#[async_trait::async_trait]
impl Codec for EnvelopeCodec {
    type Protocol = StreamProtocol;
    type Request = Envelope;
    type Response = Envelope;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_envelope(io).await
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_envelope(io).await
    }

    async fn write_request<T>(&mut self, _: &Self::Protocol, io: &mut T, req: Self::Request) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_envelope(io, &req).await
    }

    async fn write_response<T>(&mut self, _: &Self::Protocol, io: &mut T, res: Self::Response) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_envelope(io, &res).await
    }
}

async fn read_envelope<T>(io: &mut T) -> io::Result<Envelope>
where
    T: AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    io.take(MAX_ENVELOPE_BYTES).read_to_end(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_envelope<T>(io: &mut T, envelope: &Envelope) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    let buf = serde_json::to_vec(envelope).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    io.write_all(&buf).await?;
    io.close().await?;
    Ok(())
}
