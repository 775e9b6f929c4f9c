//! shardkv-node: entry point for a sharded, replicated KV node.
//!
//! Loads config, applies `VIEW` / `S` / `IP_PORT` overrides, then serves the
//! peer protocol and the HTTP API on the configured listen address until
//! Ctrl+C.

use shardkv_config::NodeConfig;
use shardkv_node::Node;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    shardkv_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let mut config = shardkv_config::load_from_file(std::path::Path::new(&config_path))
        .unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            NodeConfig::default()
        });
    config.apply_env()?;

    let mut node = Node::start(config).await?;
    tracing::info!("serving {} on {}", node.identity(), node.local_addr());

    tokio::select! {
        result = node.serve_until_error() => {
            if let Err(e) = result {
                tracing::error!("server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    node.shutdown().await?;
    Ok(())
}
