//! # meshmap
//!
//! A peer-to-peer replicator for a shared in-memory key/value map.
//!
//! Each node holds a local copy of the map; mutations made on any node
//! propagate asynchronously to every other node so that, absent further
//! writes, all nodes converge. The model is eventual consistency with
//! last-writer-wins conflict resolution (identifier tiebreak).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                              meshmap node                              │
//! │                                                                        │
//! │  application ──► SharedMap ──┬─► ModificationIterator (per peer)       │
//! │                  (LWW merge) │        │ dirty-slot bitset + cursor     │
//! │                              │        ▼                                │
//! │                              │   PeerSession ◄──► framing codec ◄──► TCP
//! │                              │        ▲                                │
//! │                              │   Replicator (listener, connectors,     │
//! │                              │               shutdown, backoff)        │
//! │                              └─► DatagramReplicator (optional, lossy)  │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Peers exchange a 9-byte welcome (identifier + highest locally observed
//! timestamp) on connect, seed a per-peer backlog of everything the remote
//! missed, then stream length-prefixed entry records in both directions.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshmap::{Replicator, ReplicatorConfig, SharedMap, PeerAddress};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> meshmap::Result<()> {
//!     let map = Arc::new(SharedMap::new(1));
//!     let config = ReplicatorConfig {
//!         identifier: 1,
//!         listen_port: Some(8076),
//!         peers: vec![PeerAddress::new("10.0.0.2", 8076)],
//!         ..ReplicatorConfig::for_testing(1)
//!     };
//!
//!     let mut replicator = Replicator::new(config, Arc::clone(&map));
//!     replicator.start().await?;
//!
//!     map.put(b"greeting".to_vec(), b"hello".to_vec())?;
//!     // ... the mesh converges in the background ...
//!
//!     replicator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod engine;
pub mod entry;
pub mod error;
pub mod iter;
pub mod metrics;
pub mod resilience;
pub mod session;
pub mod store;
pub mod udp;

// Re-exports for convenience
pub use config::{PeerAddress, ReplicatorConfig, UdpConfig};
pub use engine::{EngineState, Replicator};
pub use entry::{Entry, Version, MAX_IDENTIFIER, MIN_IDENTIFIER};
pub use error::{ReplicationError, Result};
pub use iter::{EntrySink, ModificationIterator};
pub use resilience::RetryConfig;
pub use session::SessionRegistry;
pub use store::{ReplicatedStore, SharedMap};
