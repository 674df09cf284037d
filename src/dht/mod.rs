//! DHT (Distributed Hash Table) module
//!
//! Kademlia-style peer discovery over KRPC/UDP.

pub mod dht;
pub mod message;
pub mod node;
pub mod routing;

pub use dht::{Dht, DhtConfig, DEFAULT_BOOTSTRAP_NODES};
pub use message::{error_code, KrpcBody, KrpcError, KrpcMessage, Query, Response};
pub use node::{NodeId, NodeSession, COMPACT_NODE_LEN, COMPACT_PEER_LEN};
pub use routing::{InsertResult, NodeTable, DEFAULT_BUCKET_SIZE};
