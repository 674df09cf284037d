//! DHT node identity
//!
//! Node ids, node sessions and the compact node/peer encodings.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;

use crate::error::TorrentError;
use crate::torrent::info::InfoHash;

/// Bytes per compact node: id + IPv4 + port
pub const COMPACT_NODE_LEN: usize = 26;

/// Bytes per compact peer: IPv4 + port
pub const COMPACT_PEER_LEN: usize = 6;

/// A node that has not answered for this long is stale
pub const NODE_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Failed queries after which a node is stale
pub const NODE_MAX_FAILURES: u32 = 2;

/// DHT node identifier (20 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 20]);

impl NodeId {
    pub fn random() -> Self {
        let mut id = [0u8; 20];
        rand::thread_rng().fill(&mut id);
        Self(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let id: [u8; 20] = bytes.try_into().map_err(|_| {
            TorrentError::protocol_error_with_source("Invalid node id", format!("{} bytes", bytes.len()))
        })?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance; compares big-endian
    pub fn distance(&self, other: &NodeId) -> [u8; 20] {
        let mut d = [0u8; 20];
        for (i, byte) in d.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        d
    }
}

impl From<InfoHash> for NodeId {
    fn from(hash: InfoHash) -> Self {
        NodeId(hash.0)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A known DHT node
#[derive(Debug, Clone)]
pub struct NodeSession {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub failures: u32,
}

impl NodeSession {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            failures: 0,
        }
    }

    /// Not heard from for 15 minutes or failed too many queries
    pub fn is_stale(&self) -> bool {
        self.failures >= NODE_MAX_FAILURES || self.last_seen.elapsed() >= NODE_STALE_AFTER
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.failures = 0;
    }
}

/// Compact IPv4 address + port; other address families are skipped
pub fn encode_compact_peer(addr: &SocketAddr, out: &mut Vec<u8>) -> bool {
    match addr {
        SocketAddr::V4(v4) => {
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
            true
        }
        SocketAddr::V6(_) => false,
    }
}

pub fn decode_compact_peer(chunk: &[u8]) -> Option<SocketAddr> {
    if chunk.len() != COMPACT_PEER_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Decode a blob of 6-byte peers
pub fn decode_compact_peers(blob: &[u8]) -> Result<Vec<SocketAddr>> {
    if blob.len() % COMPACT_PEER_LEN != 0 {
        return Err(TorrentError::protocol_error_with_source(
            "Compact peer list has a partial entry",
            format!("{} bytes", blob.len()),
        )
        .into());
    }
    Ok(blob.chunks_exact(COMPACT_PEER_LEN).filter_map(decode_compact_peer).collect())
}

pub fn encode_compact_nodes(nodes: &[NodeSession]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        if let SocketAddr::V4(_) = node.addr {
            out.extend_from_slice(node.id.as_bytes());
            encode_compact_peer(&node.addr, &mut out);
        }
    }
    out
}

/// Decode a blob of 26-byte nodes
pub fn decode_compact_nodes(blob: &[u8]) -> Result<Vec<(NodeId, SocketAddr)>> {
    if blob.len() % COMPACT_NODE_LEN != 0 {
        return Err(TorrentError::protocol_error_with_source(
            "Compact node list has a partial entry",
            format!("{} bytes", blob.len()),
        )
        .into());
    }
    blob.chunks_exact(COMPACT_NODE_LEN)
        .map(|chunk| {
            let id = NodeId::from_slice(&chunk[..20])?;
            let addr = decode_compact_peer(&chunk[20..])
                .ok_or_else(|| TorrentError::protocol_error("Invalid compact node address"))?;
            Ok((id, addr))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_node_layout() {
        let node = NodeSession::new(NodeId([0x11; 20]), "1.2.3.4:6881".parse().unwrap());
        let blob = encode_compact_nodes(&[node]);
        assert_eq!(blob.len(), 26);
        assert_eq!(&blob[..20], &[0x11; 20]);
        assert_eq!(&blob[20..], &[1, 2, 3, 4, 0x1a, 0xe1]);

        let decoded = decode_compact_nodes(&blob).unwrap();
        assert_eq!(decoded, vec![(NodeId([0x11; 20]), "1.2.3.4:6881".parse().unwrap())]);
        assert!(decode_compact_nodes(&blob[..25]).is_err());
    }

    #[test]
    fn test_compact_peers() {
        let mut blob = Vec::new();
        assert!(encode_compact_peer(&"10.0.0.2:80".parse().unwrap(), &mut blob));
        assert!(!encode_compact_peer(&"[::1]:80".parse().unwrap(), &mut blob));
        assert_eq!(blob, vec![10, 0, 0, 2, 0, 80]);
        assert_eq!(decode_compact_peers(&blob).unwrap(), vec!["10.0.0.2:80".parse().unwrap()]);
        assert!(decode_compact_peers(&blob[..5]).is_err());
    }

    #[test]
    fn test_staleness() {
        let mut node = NodeSession::new(NodeId::random(), "1.1.1.1:1".parse().unwrap());
        assert!(!node.is_stale());
        node.failures = NODE_MAX_FAILURES;
        assert!(node.is_stale());
        node.touch();
        assert!(!node.is_stale());
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), [0u8; 20]);
    }
}
