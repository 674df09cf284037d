//! Torrent metadata module
//!
//! Parsing of .torrent files and magnet links into immutable metadata.

pub mod info;
pub mod magnet;
pub mod parser;

pub use info::{InfoHash, TorrentFile, TorrentMetadata};
pub use magnet::{is_magnet_link, MagnetLink};
pub use parser::TorrentParser;
