//! Anti-entropy for shardkv.
//!
//! Replicas periodically swap a key -> timestamp digest with a few partners,
//! ship the entries the partner is not exactly current on, and the receiver
//! keeps whichever copy wins [`remote_wins`].

pub mod conflict;
pub mod engine;
pub mod transport;

pub use conflict::remote_wins;
pub use engine::{AntiEntropyEngine, GossipConfig};
pub use transport::{GossipTransport, PeerError};
