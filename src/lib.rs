//! bt-engine
//!
//! A BitTorrent download engine: metadata parsing, verified piece storage,
//! the peer-wire protocol, tracker/DHT/LSD peer discovery and a persistent
//! download task state machine.

pub mod bencode;
pub mod cli;
pub mod dht;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod lsd;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use cli::{CliArgs, DownloadStats, EngineConfig, ProgressDisplay};
pub use dht::{Dht, DhtConfig, NodeId, NodeTable};
pub use downloader::{Downloader, Protocol, TaskEntity, TaskRepository, TaskStatus, TorrentTransfer, Transfer};
pub use engine::{Engine, EngineEvent, EventSink, NoopEventSink};
pub use lsd::LsdService;
pub use peer::{PeerConnection, PeerSession, PeerSource, PeerState, PeerTable};
pub use protocol::{Handshake, Message, MessageId, Wire};
pub use session::{TorrentContext, TorrentSession};
pub use storage::{ByteStorage, FileByteStorage, MemoryByteStorage, PieceStorage};
pub use torrent::{InfoHash, MagnetLink, TorrentMetadata, TorrentParser};
pub use tracker::TrackerClient;
