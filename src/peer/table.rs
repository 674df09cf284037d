//! Peer table
//!
//! Process-wide store of [`PeerSession`]s keyed by (address, info-hash).
//! Discovery sources enrich existing sessions instead of replacing them.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::peer::state::{PeerKey, PeerSession, PeerSource, PeerState};
use crate::torrent::info::InfoHash;

/// Failed connection attempts after which a peer is no longer offered
pub const MAX_CONNECT_FAILURES: u32 = 3;

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<PeerKey, PeerSession>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peer or add `source` to the existing session.
    ///
    /// Returns true when the session was created.
    pub async fn upsert(&self, addr: SocketAddr, info_hash: InfoHash, source: PeerSource) -> bool {
        let key = PeerKey::new(addr, info_hash);
        let mut peers = self.peers.write().await;
        match peers.get_mut(&key) {
            Some(session) => {
                session.sources |= source;
                false
            }
            None => {
                trace!("New peer {} from {:?}", key, source);
                peers.insert(key, PeerSession::new(key, source));
                true
            }
        }
    }

    /// Upsert many addresses; returns how many were new
    pub async fn upsert_all(&self, addrs: &[SocketAddr], info_hash: InfoHash, source: PeerSource) -> usize {
        let mut added = 0;
        for addr in addrs {
            if self.upsert(*addr, info_hash, source).await {
                added += 1;
            }
        }
        if added > 0 {
            debug!("Added {} peers for {} from {:?}", added, info_hash, source);
        }
        added
    }

    pub async fn get(&self, key: &PeerKey) -> Option<PeerSession> {
        self.peers.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &PeerKey) -> bool {
        self.peers.read().await.contains_key(key)
    }

    /// Mutate a session in place; false when it does not exist
    pub async fn update<F>(&self, key: &PeerKey, f: F) -> bool
    where
        F: FnOnce(&mut PeerSession),
    {
        match self.peers.write().await.get_mut(key) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, key: &PeerKey) -> Option<PeerSession> {
        let removed = self.peers.write().await.remove(key);
        if removed.is_some() {
            trace!("Removed peer {}", key);
        }
        removed
    }

    /// Drop every session of a torrent
    pub async fn remove_torrent(&self, info_hash: &InfoHash) -> usize {
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|k, _| &k.info_hash != info_hash);
        let removed = before - peers.len();
        debug!("Removed {} peers of torrent {}", removed, info_hash);
        removed
    }

    pub async fn peers_for(&self, info_hash: &InfoHash) -> Vec<PeerSession> {
        self.peers
            .read()
            .await
            .values()
            .filter(|s| &s.key.info_hash == info_hash)
            .cloned()
            .collect()
    }

    /// Peers worth dialing, fewest failures first
    pub async fn connectable(&self, info_hash: &InfoHash, limit: usize) -> Vec<SocketAddr> {
        let peers = self.peers.read().await;
        let mut candidates: Vec<&PeerSession> = peers
            .values()
            .filter(|s| &s.key.info_hash == info_hash && s.is_connectable())
            .collect();
        candidates.sort_by_key(|s| (s.failures, s.discovered_at));
        candidates.into_iter().take(limit).map(|s| s.addr()).collect()
    }

    /// Peers that are both available and connected, for DHT `get_peers` replies
    pub async fn available_connected(&self, info_hash: &InfoHash, limit: usize) -> Vec<SocketAddr> {
        self.peers
            .read()
            .await
            .values()
            .filter(|s| &s.key.info_hash == info_hash && s.available && s.is_connected())
            .take(limit)
            .map(|s| s.addr())
            .collect()
    }

    /// Claim a peer for dialing; false when it is missing or already busy
    pub async fn mark_connecting(&self, key: &PeerKey) -> bool {
        match self.peers.write().await.get_mut(key) {
            Some(session) if session.is_connectable() => {
                session.state = PeerState::Connecting;
                true
            }
            _ => false,
        }
    }

    pub async fn mark_connected(&self, key: &PeerKey, peer_id: [u8; 20]) {
        self.update(key, |s| {
            s.state = PeerState::Connected;
            s.peer_id = Some(peer_id);
            s.failures = 0;
        })
        .await;
    }

    /// Count a failed attempt; too many make the peer unavailable
    pub async fn mark_failed(&self, key: &PeerKey) {
        self.update(key, |s| {
            s.state = PeerState::Disconnected;
            s.failures += 1;
            if s.failures >= MAX_CONNECT_FAILURES {
                debug!("Peer {} unavailable after {} failures", s.key, s.failures);
                s.available = false;
            }
        })
        .await;
    }

    pub async fn count(&self, info_hash: &InfoHash) -> usize {
        self.peers
            .read()
            .await
            .keys()
            .filter(|k| &k.info_hash == info_hash)
            .count()
    }

    pub async fn connected_count(&self, info_hash: &InfoHash) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|s| &s.key.info_hash == info_hash && s.is_connected())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: InfoHash = InfoHash([7u8; 20]);

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_upsert_deduplicates_and_merges_sources() {
        let table = PeerTable::new();
        assert!(table.upsert(addr(1), HASH, PeerSource::Dht).await);
        assert!(!table.upsert(addr(1), HASH, PeerSource::Tracker).await);
        assert_eq!(table.len().await, 1);

        let session = table.get(&PeerKey::new(addr(1), HASH)).await.unwrap();
        assert!(session.sources.contains(PeerSource::Dht));
        assert!(session.sources.contains(PeerSource::Tracker));
    }

    #[tokio::test]
    async fn test_same_address_different_torrents() {
        let table = PeerTable::new();
        table.upsert(addr(1), HASH, PeerSource::Lsd).await;
        table.upsert(addr(1), InfoHash([8u8; 20]), PeerSource::Lsd).await;
        assert_eq!(table.len().await, 2);
        assert_eq!(table.remove_torrent(&HASH).await, 1);
        assert_eq!(table.count(&HASH).await, 0);
    }

    #[tokio::test]
    async fn test_failures_make_peer_unavailable() {
        let table = PeerTable::new();
        table.upsert(addr(1), HASH, PeerSource::Tracker).await;
        table.upsert(addr(2), HASH, PeerSource::Tracker).await;
        let key = PeerKey::new(addr(1), HASH);

        for _ in 0..MAX_CONNECT_FAILURES {
            assert!(table.mark_connecting(&key).await);
            table.mark_failed(&key).await;
        }
        assert!(!table.mark_connecting(&key).await);
        assert_eq!(table.connectable(&HASH, 10).await, vec![addr(2)]);
    }

    #[tokio::test]
    async fn test_available_connected_filter_and_limit() {
        let table = PeerTable::new();
        for port in 1..=5 {
            table.upsert(addr(port), HASH, PeerSource::Tracker).await;
        }
        for port in 1..=3 {
            table.mark_connected(&PeerKey::new(addr(port), HASH), [0u8; 20]).await;
        }
        assert_eq!(table.available_connected(&HASH, 10).await.len(), 3);
        assert_eq!(table.available_connected(&HASH, 2).await.len(), 2);
        assert_eq!(table.connected_count(&HASH).await, 3);
        assert_eq!(table.connectable(&HASH, 10).await.len(), 2);
    }
}
