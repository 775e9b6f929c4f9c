//! Node-to-node networking for shardkv.
//!
//! Provides:
//! - `protocol`: command names, length-prefixed bincode framing, and the
//!   single-key request/response payloads
//! - `Endpoint`: the listening side, a command dispatch table plus HTTP
//!   sniffing so the REST API shares the same port
//! - `TcpPeerClient`: the dialing side, implementing `GossipTransport` and
//!   the forwarded single-key operations

pub mod client;
pub mod endpoint;
pub mod error;
pub mod protocol;

pub use client::TcpPeerClient;
pub use endpoint::{Endpoint, HttpHandler};
pub use error::NetError;
pub use protocol::Command;
