//! Cluster-Cache: peer membership and transport for a clustered in-memory cache
//!
//! Every node owns a local cache and keeps a live registry of sibling
//! nodes. A cluster grows by one node dialing a single existing member and
//! being admitted:
//! - framed TCP connections with exact-size timed reads
//! - an identity handshake that rejects duplicate members
//! - a registry shared by the accept path, the join path and disconnects
//!
//! # Example
//!
//! ```no_run
//! use cluster_cache::network::{Node, NodeConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut seed = Node::new(NodeConfig {
//!     local_port: 9001,
//!     ..Default::default()
//! });
//! seed.start().await?;
//!
//! let mut joiner = Node::new(NodeConfig {
//!     local_port: 9002,
//!     join: true,
//!     join_address: "127.0.0.1:9001".to_string(),
//!     ..Default::default()
//! });
//! joiner.start().await?;
//!
//! println!("{} knows {:?}", joiner.id(), joiner.peer_ids());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod network;

// Re-export commonly used types
pub use cache::{Cache, CacheConfig};
pub use network::{FatalEvent, Node, NodeConfig, NodeError, NodeStatus, RemoteNode};
