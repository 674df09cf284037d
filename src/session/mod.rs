//! Torrent sessions
//!
//! Per-torrent shared state and the arena that owns it.

pub mod assembly;
pub mod context;
pub mod torrent;

pub use assembly::{PieceAssembly, DEFAULT_BLOCK_SIZE};
pub use context::TorrentContext;
pub use torrent::{PeerCommand, TorrentSession};
