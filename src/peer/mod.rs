//! Peer module
//!
//! Peer-wire connections and the shared table of known peers.

pub mod connection;
pub mod state;
pub mod table;

pub use connection::{ConnectionConfig, ConnectionState, PeerConnection, PeerContext};
pub use state::{PeerKey, PeerSession, PeerSource, PeerState};
pub use table::PeerTable;
