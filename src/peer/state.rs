//! Peer session state
//!
//! Per-remote-peer record shared by every discovery source and by the
//! connection that talks to the peer.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use bit_vec::BitVec;
use bitmask_enum::bitmask;

use crate::torrent::info::InfoHash;

/// Unique id of a peer within a torrent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub addr: SocketAddr,
    pub info_hash: InfoHash,
}

impl PeerKey {
    pub fn new(addr: SocketAddr, info_hash: InfoHash) -> Self {
        Self { addr, info_hash }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.addr, &self.info_hash.to_hex()[..8])
    }
}

/// Where a peer was learned from; a peer can carry several marks
#[bitmask(u8)]
#[bitmask_config(vec_debug)]
pub enum PeerSource {
    Tracker,
    Dht,
    Lsd,
    Pex,
    Incoming,
    Manual,
}

/// Connection state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Known, not connected
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Everything known about one peer of one torrent
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub key: PeerKey,
    pub peer_id: Option<[u8; 20]>,
    pub sources: PeerSource,
    pub state: PeerState,
    /// Pieces the peer advertised
    pub bitfield: Option<BitVec>,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    /// Peer advertised the DHT bit in its handshake
    pub supports_dht: bool,
    /// DHT port from a `port` message
    pub dht_port: Option<u16>,
    /// False once connecting failed too often
    pub available: bool,
    pub failures: u32,
    pub downloaded: u64,
    pub uploaded: u64,
    pub discovered_at: Instant,
}

impl PeerSession {
    pub fn new(key: PeerKey, source: PeerSource) -> Self {
        Self {
            key,
            peer_id: None,
            sources: source,
            state: PeerState::Disconnected,
            bitfield: None,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            supports_dht: false,
            dht_port: None,
            available: true,
            failures: 0,
            downloaded: 0,
            uploaded: 0,
            discovered_at: Instant::now(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.key.addr
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    /// Available and not already connected or connecting
    pub fn is_connectable(&self) -> bool {
        self.available && self.state == PeerState::Disconnected
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bitfield
            .as_ref()
            .and_then(|bits| bits.get(index))
            .unwrap_or(false)
    }

    /// Record a `have`; the bitfield grows lazily to `pieces_count`
    pub fn set_have(&mut self, index: usize, pieces_count: usize) {
        if index >= pieces_count {
            return;
        }
        let bits = self
            .bitfield
            .get_or_insert_with(|| BitVec::from_elem(pieces_count, false));
        if bits.len() < pieces_count {
            bits.grow(pieces_count - bits.len(), false);
        }
        bits.set(index, true);
    }

    /// Whether we can expect blocks from this peer
    pub fn can_request(&self) -> bool {
        self.is_connected() && self.am_interested && !self.peer_choking
    }

    pub fn piece_count(&self) -> usize {
        self.bitfield.as_ref().map(|b| b.count_ones() as usize).unwrap_or(0)
    }
}
