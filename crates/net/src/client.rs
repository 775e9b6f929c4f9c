//! The dialing side of the peer protocol.
//!
//! `TcpPeerClient` opens one connection per request and bounds the whole
//! exchange (connect included) by its timeout.

use crate::error::NetError;
use crate::protocol::{
    decode, encode, read_frame, write_command, write_frame, Command, ContainsRequest,
    ContainsResponse, DeleteRequest, DeleteResponse, GetRequest, GetResponse, PutRequest,
    PutResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shardkv_common::{EntryBatch, ShardSnapshot, TimeDigest};
use shardkv_gossip::{GossipTransport, PeerError};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug, Clone)]
pub struct TcpPeerClient {
    timeout: Duration,
}

impl Default for TcpPeerClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl TcpPeerClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send one command and, if the command answers, return the reply frame.
    pub async fn call(
        &self,
        peer: &str,
        cmd: Command,
        payload: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, NetError> {
        let m = shardkv_metrics::metrics();
        m.peer_sent.with_label_values(&[cmd.as_str()]).inc();
        let _timer = shardkv_metrics::start_peer_timer(cmd.as_str());

        tokio::time::timeout(self.timeout, Self::exchange(peer, cmd, payload))
            .await
            .map_err(|_| NetError::Timeout)?
    }

    async fn exchange(
        peer: &str,
        cmd: Command,
        payload: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, NetError> {
        let stream = TcpStream::connect(peer).await?;
        stream.set_nodelay(true)?;
        let (read_half, mut write_half) = stream.into_split();

        let mut request = Vec::new();
        write_command(&mut request, cmd).await?;
        if cmd.has_payload() {
            write_frame(&mut request, payload.unwrap_or_default()).await?;
        }
        write_half.write_all(&request).await?;
        write_half.flush().await?;

        if !cmd.expects_reply() {
            write_half.shutdown().await?;
            return Ok(None);
        }
        let mut reader = BufReader::new(read_half);
        let reply = read_frame(&mut reader).await?;
        Ok(Some(reply))
    }

    /// Typed request/response round trip.
    pub async fn request<Req, Resp>(&self, peer: &str, cmd: Command, req: &Req) -> Result<Resp, NetError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = encode(req)?;
        let reply = self
            .call(peer, cmd, Some(&payload))
            .await?
            .ok_or(NetError::Closed)?;
        decode(&reply)
    }

    /// Typed one-way message.
    pub async fn send<Req: Serialize>(&self, peer: &str, cmd: Command, req: &Req) -> Result<(), NetError> {
        let payload = encode(req)?;
        self.call(peer, cmd, Some(&payload)).await?;
        Ok(())
    }

    // ── Forwarded single-key operations ──

    pub async fn forward_contains(&self, peer: &str, req: &ContainsRequest) -> Result<ContainsResponse, NetError> {
        self.request(peer, Command::Contains, req).await
    }

    pub async fn forward_get(&self, peer: &str, req: &GetRequest) -> Result<GetResponse, NetError> {
        self.request(peer, Command::Get, req).await
    }

    pub async fn forward_put(&self, peer: &str, req: &PutRequest) -> Result<PutResponse, NetError> {
        self.request(peer, Command::Put, req).await
    }

    pub async fn forward_delete(&self, peer: &str, req: &DeleteRequest) -> Result<DeleteResponse, NetError> {
        self.request(peer, Command::Delete, req).await
    }
}

fn peer_error(peer: &str, e: NetError) -> PeerError {
    match e {
        NetError::Timeout => PeerError::Timeout {
            peer: peer.to_string(),
        },
        other => PeerError::RpcFailed {
            peer: peer.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait::async_trait]
impl GossipTransport for TcpPeerClient {
    async fn exchange_digest(&self, peer: &str, digest: &TimeDigest) -> Result<TimeDigest, PeerError> {
        self.request(peer, Command::Time, digest)
            .await
            .map_err(|e| peer_error(peer, e))
    }

    async fn send_entries(&self, peer: &str, batch: &EntryBatch) -> Result<(), PeerError> {
        self.send(peer, Command::Entry, batch)
            .await
            .map_err(|e| peer_error(peer, e))
    }

    async fn send_shards(&self, peer: &str, snapshot: &ShardSnapshot) -> Result<(), PeerError> {
        self.send(peer, Command::Shard, snapshot)
            .await
            .map_err(|e| peer_error(peer, e))
    }

    async fn request_help(&self, peer: &str) -> Result<(), PeerError> {
        self.call(peer, Command::Help, None)
            .await
            .map(|_| ())
            .map_err(|e| peer_error(peer, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, HandlerResult};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn echo_contains(payload: Vec<u8>) -> HandlerResult {
        let req: ContainsRequest = decode(&payload)?;
        Ok(Some(encode(&ContainsResponse {
            alive: req.key == "present",
            version: req.key.len() as u64,
        })?))
    }

    async fn start(endpoint: Arc<Endpoint>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(endpoint.serve(listener));
        addr.to_string()
    }

    #[tokio::test]
    async fn test_forward_round_trip() {
        let endpoint = Arc::new(Endpoint::new());
        endpoint.register(Command::Contains, echo_contains);
        let addr = start(endpoint).await;

        let client = TcpPeerClient::default();
        let resp = client
            .forward_contains(&addr, &ContainsRequest { key: "present".into() })
            .await
            .unwrap();
        assert!(resp.alive);
        assert_eq!(resp.version, 7);
    }

    #[tokio::test]
    async fn test_one_way_message_is_delivered() {
        let endpoint = Arc::new(Endpoint::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        endpoint.register(Command::Shard, move |payload| {
            let tx = tx.clone();
            async move {
                let snapshot: ShardSnapshot = decode(&payload)?;
                let _ = tx.send(snapshot);
                HandlerResult::Ok(None)
            }
        });
        let addr = start(endpoint).await;

        let snapshot = ShardSnapshot::from_peers(&["a", "b"], 2);
        TcpPeerClient::default()
            .send_shards(&addr, &snapshot)
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(snapshot));
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_an_error() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().to_string()
        };
        let client = TcpPeerClient::new(Duration::from_millis(500));
        let err = client.request_help(&addr).await.unwrap_err();
        assert!(matches!(err, PeerError::RpcFailed { .. } | PeerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        // Accepts but never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((s, _)) = listener.accept().await {
                held.push(s);
            }
        });

        let client = TcpPeerClient::new(Duration::from_millis(200));
        let err = client
            .exchange_digest(&addr, &TimeDigest::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Timeout { .. }));
    }
}
