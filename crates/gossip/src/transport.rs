//! Abstraction over the peer messages the anti-entropy loop sends.
//!
//! Concrete implementation lives in `shardkv-net::client`.

use shardkv_common::{EntryBatch, ShardSnapshot, TimeDigest};

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("RPC to {peer} failed: {reason}")]
    RpcFailed { peer: String, reason: String },
    #[error("RPC to {peer} timed out")]
    Timeout { peer: String },
}

/// Outbound gossip messages, addressed by peer `ip:port`.
#[async_trait::async_trait]
pub trait GossipTransport: Send + Sync + 'static {
    /// Send our digest; the peer answers with the part it is not exactly
    /// current on.
    async fn exchange_digest(
        &self,
        peer: &str,
        digest: &TimeDigest,
    ) -> Result<TimeDigest, PeerError>;

    /// Push entries for the peer to merge. No reply.
    async fn send_entries(&self, peer: &str, batch: &EntryBatch) -> Result<(), PeerError>;

    /// Push our shard layout for the peer to adopt. No reply.
    async fn send_shards(&self, peer: &str, snapshot: &ShardSnapshot) -> Result<(), PeerError>;

    /// Ask the peer to run a round right away.
    async fn request_help(&self, peer: &str) -> Result<(), PeerError>;
}
