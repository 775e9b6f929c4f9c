//! Metrics and tracing setup for shardkv.
//!
//! Provides a global [`NodeMetrics`] singleton backed by the `prometheus`
//! crate. The text exposition is served by the node's HTTP API on the shared
//! listening port.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

static METRICS: OnceLock<NodeMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static NodeMetrics {
    METRICS.get_or_init(NodeMetrics::new)
}

/// All Prometheus metrics for a shardkv node.
pub struct NodeMetrics {
    pub registry: Registry,

    // ── Peer protocol ──
    pub peer_sent: IntCounterVec,
    pub peer_received: IntCounterVec,
    pub peer_latency_secs: HistogramVec,

    // ── Anti-entropy ──
    pub gossip_rounds: IntCounter,
    pub gossip_partner_failures: IntCounter,
    pub entries_merged: IntCounter,
    pub entries_discarded: IntCounter,

    // ── Client operations ──
    pub kv_ops: IntCounterVec,
    pub kv_forwarded: IntCounterVec,
    pub kv_latency_secs: HistogramVec,

    // ── Topology ──
    pub topology_changes: IntCounter,
}

impl std::fmt::Debug for NodeMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeMetrics").finish_non_exhaustive()
    }
}

/// Histogram buckets (seconds) for peer and KV latency.
const LATENCY_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts");
    registry
        .register(Box::new(c.clone()))
        .expect("unique counter name");
    c
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter vec opts");
    registry
        .register(Box::new(c.clone()))
        .expect("unique counter vec name");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(
        HistogramOpts::new(name, help).buckets(LATENCY_BUCKETS.to_vec()),
        labels,
    )
    .expect("valid histogram opts");
    registry
        .register(Box::new(h.clone()))
        .expect("unique histogram name");
    h
}

impl NodeMetrics {
    fn new() -> Self {
        let registry = Registry::new();
        let r = &registry;

        Self {
            peer_sent: counter_vec(
                r,
                "shardkv_peer_messages_sent_total",
                "Peer protocol messages sent, by command",
                &["command"],
            ),
            peer_received: counter_vec(
                r,
                "shardkv_peer_messages_received_total",
                "Peer protocol messages received, by command",
                &["command"],
            ),
            peer_latency_secs: histogram_vec(
                r,
                "shardkv_peer_latency_seconds",
                "Outbound peer request latency in seconds",
                &["command"],
            ),
            gossip_rounds: counter(r, "shardkv_gossip_rounds_total", "Anti-entropy rounds run"),
            gossip_partner_failures: counter(
                r,
                "shardkv_gossip_partner_failures_total",
                "Gossip exchanges abandoned because a partner failed",
            ),
            entries_merged: counter(
                r,
                "shardkv_entries_merged_total",
                "Remote entries that replaced the local copy",
            ),
            entries_discarded: counter(
                r,
                "shardkv_entries_discarded_total",
                "Remote entries that lost conflict resolution",
            ),
            kv_ops: counter_vec(
                r,
                "shardkv_kv_ops_total",
                "Client KV operations, by kind",
                &["op"],
            ),
            kv_forwarded: counter_vec(
                r,
                "shardkv_kv_forwarded_total",
                "Client KV operations forwarded to another shard, by kind",
                &["op"],
            ),
            kv_latency_secs: histogram_vec(
                r,
                "shardkv_kv_latency_seconds",
                "Client KV operation latency in seconds",
                &["op"],
            ),
            topology_changes: counter(
                r,
                "shardkv_topology_changes_total",
                "Shard topology changes propagated",
            ),
            registry,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&metrics().registry.gather(), &mut buf) {
        return format!("# metrics encoding failed: {e}\n");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Start a timer for an outbound peer request; records on drop.
pub fn start_peer_timer(command: &str) -> prometheus::HistogramTimer {
    metrics()
        .peer_latency_secs
        .with_label_values(&[command])
        .start_timer()
}

/// Start a timer for a client KV operation; records on drop.
pub fn start_kv_timer(op: &str) -> prometheus::HistogramTimer {
    metrics()
        .kv_latency_secs
        .with_label_values(&[op])
        .start_timer()
}

// ────────────────────────── Tests ──────────────────────────
