//! Peer command handlers registered on the node's [`Endpoint`].

use crate::service::{Forwarder, KvService};
use shardkv_common::{EntryBatch, ShardSnapshot, TimeDigest};
use shardkv_gossip::{AntiEntropyEngine, GossipTransport};
use shardkv_net::endpoint::HandlerResult;
use shardkv_net::protocol::{
    decode, encode, ContainsRequest, DeleteRequest, GetRequest, PutRequest,
};
use shardkv_net::{Command, Endpoint, NetError};
use std::sync::Arc;

/// Wire every peer command to the anti-entropy engine or the KV service.
pub fn register<T, F>(endpoint: &Endpoint, engine: Arc<AntiEntropyEngine<T>>, service: Arc<KvService<F>>)
where
    T: GossipTransport,
    F: Forwarder,
{
    let e = engine.clone();
    endpoint.register(Command::Time, move |payload| {
        let e = e.clone();
        async move {
            let digest: TimeDigest = decode(&payload)?;
            let wanted = e.prune_digest(&digest);
            tracing::debug!(offered = digest.len(), wanted = wanted.len(), "digest pruned");
            HandlerResult::Ok(Some(encode(&wanted)?))
        }
    });

    let e = engine.clone();
    endpoint.register(Command::Entry, move |payload| {
        let e = e.clone();
        async move {
            let batch: EntryBatch = decode(&payload)?;
            e.merge_entries(batch);
            HandlerResult::Ok(None)
        }
    });

    let e = engine.clone();
    endpoint.register(Command::Shard, move |payload| {
        let e = e.clone();
        async move {
            let snapshot: ShardSnapshot = decode(&payload)?;
            if e.apply_snapshot(&snapshot) {
                tracing::info!(shards = snapshot.shards.len(), "adopted shard layout from peer");
            }
            HandlerResult::Ok(None)
        }
    });

    let e = engine;
    endpoint.register(Command::Help, move |_| {
        e.request_help();
        async { HandlerResult::Ok(None) }
    });

    let s = service.clone();
    endpoint.register(Command::Contains, move |payload| {
        let s = s.clone();
        async move {
            let req: ContainsRequest = decode(&payload)?;
            HandlerResult::Ok(Some(encode(&s.local_contains(&req))?))
        }
    });

    let s = service.clone();
    endpoint.register(Command::Get, move |payload| {
        let s = s.clone();
        async move {
            let req: GetRequest = decode(&payload)?;
            HandlerResult::Ok(Some(encode(&s.local_get(&req))?))
        }
    });

    let s = service.clone();
    endpoint.register(Command::Put, move |payload| {
        let s = s.clone();
        async move {
            let req: PutRequest = decode(&payload)?;
            let resp = s
                .local_put(req)
                .map_err(|e| NetError::Handler(e.to_string()))?;
            HandlerResult::Ok(Some(encode(&resp)?))
        }
    });

    let s = service;
    endpoint.register(Command::Delete, move |payload| {
        let s = s.clone();
        async move {
            let req: DeleteRequest = decode(&payload)?;
            let resp = s
                .local_delete(&req)
                .map_err(|e| NetError::Handler(e.to_string()))?;
            HandlerResult::Ok(Some(encode(&resp)?))
        }
    });
}
