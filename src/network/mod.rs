//! Cluster networking module
//!
//! Membership and transport for a cluster of cache nodes.
//!
//! # Features
//! - Framed TCP connections with timed exact-size reads
//! - Identity handshake with duplicate rejection
//! - Ordered member registry with stable handles
//! - Accept loop with bounded backoff and fatal event reporting
//! - Keep-alive pings and idle detection for active peers

pub mod config;
pub mod connection;
pub mod identity;
pub mod message;
pub mod node;
pub mod registry;
pub mod remote;
pub mod server;

pub use config::{ConfigError, NodeConfig, DEFAULT_PORT};
pub use connection::{Connection, ConnectionError};
pub use identity::{IdGenerator, RandomIdGenerator, NODE_ID_LENGTH};
pub use message::{
    IdentifyMessage, Message, MessageCodec, MessageError, VerifyMessage, MAGIC, MAX_MESSAGE_SIZE,
    PROTOCOL_VERSION,
};
pub use node::{Node, NodeError, NodeStatus};
pub use registry::{Member, MemberHandle, Registry};
pub use remote::{
    Direction, LocalIdentity, NodeEvent, PeerError, PeerInfo, PeerSettings, PeerState, RemoteNode,
};
pub use server::{AcceptPolicy, FailureAction, FailureTracker, FatalEvent, Server};
