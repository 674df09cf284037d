//! Torrent session
//!
//! Everything the peer channels of one torrent share: metadata, the piece
//! storage, the set of pieces currently being fetched and a command sender
//! per open channel.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bit_vec::BitVec;
use tokio::sync::{mpsc, watch, Mutex, RwLock, Semaphore};
use tracing::{debug, info, trace, warn};

use crate::engine::events::{EngineEvent, EventSink};
use crate::engine::reactor::run_blocking;
use crate::protocol::message::BlockRequest;
use crate::storage::piece::PieceStorage;
use crate::torrent::info::{InfoHash, TorrentMetadata};

/// Commands a session sends to its peer channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    Have(u32),
    Close,
}

#[derive(Debug)]
pub struct TorrentSession {
    metadata: Arc<TorrentMetadata>,
    storage: Arc<PieceStorage>,
    /// Pieces touching a selected file
    wanted: BitVec,
    block_size: usize,
    in_flight: Mutex<HashSet<usize>>,
    channels: RwLock<HashMap<SocketAddr, mpsc::UnboundedSender<PeerCommand>>>,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
    disk: Arc<Semaphore>,
    events: Arc<dyn EventSink>,
    progress: watch::Sender<usize>,
    /// First storage failure seen by a channel; fails the owning task
    failure: Mutex<Option<String>>,
}

impl TorrentSession {
    pub async fn new(
        metadata: Arc<TorrentMetadata>,
        storage: PieceStorage,
        selection: &[String],
        block_size: usize,
        disk: Arc<Semaphore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let wanted = wanted_pieces(&metadata, selection);
        let available = storage.available_count().await;
        let (progress, _) = watch::channel(available);
        info!(
            "Session {} ({}): {}/{} pieces present, {} wanted",
            metadata.name,
            metadata.info_hash,
            available,
            metadata.piece_count(),
            wanted.count_ones()
        );
        Self {
            metadata,
            storage: Arc::new(storage),
            wanted,
            block_size,
            in_flight: Mutex::new(HashSet::new()),
            channels: RwLock::new(HashMap::new()),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            disk,
            events,
            progress,
            failure: Mutex::new(None),
        }
    }

    pub fn info_hash(&self) -> InfoHash {
        self.metadata.info_hash
    }

    pub fn metadata(&self) -> &Arc<TorrentMetadata> {
        &self.metadata
    }

    pub fn storage(&self) -> &Arc<PieceStorage> {
        &self.storage
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_wanted(&self, index: usize) -> bool {
        self.wanted.get(index).unwrap_or(false)
    }

    /// Every wanted piece is on disk
    pub async fn is_complete(&self) -> bool {
        if self.storage.is_finished().await {
            return true;
        }
        let available = self.storage.available_pieces().await;
        self.wanted
            .iter()
            .zip(available.iter())
            .all(|(wanted, have)| !wanted || have)
    }

    /// Bytes of wanted pieces still missing
    pub async fn left(&self) -> u64 {
        let available = self.storage.available_pieces().await;
        (0..self.metadata.piece_count())
            .filter(|&i| self.is_wanted(i) && !available.get(i).unwrap_or(false))
            .map(|i| self.metadata.piece_len(i))
            .sum()
    }

    /// Bytes of all wanted pieces
    pub fn wanted_size(&self) -> u64 {
        (0..self.metadata.piece_count())
            .filter(|&i| self.is_wanted(i))
            .map(|i| self.metadata.piece_len(i))
            .sum()
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Count of available pieces, updated after every saved piece
    pub fn subscribe_progress(&self) -> watch::Receiver<usize> {
        self.progress.subscribe()
    }

    /// Claim the first piece the remote has, we lack and nobody else is fetching
    pub async fn pick_piece(&self, remote: &BitVec) -> Option<usize> {
        let available = self.storage.available_pieces().await;
        let mut in_flight = self.in_flight.lock().await;
        let index = (0..self.metadata.piece_count()).find(|&i| {
            self.is_wanted(i)
                && remote.get(i).unwrap_or(false)
                && !available.get(i).unwrap_or(false)
                && !in_flight.contains(&i)
        })?;
        in_flight.insert(index);
        trace!("Picked piece {} of {}", index, self.metadata.info_hash);
        Some(index)
    }

    /// Whether the remote has anything we still want
    pub async fn wants_any(&self, remote: &BitVec) -> bool {
        let available = self.storage.available_pieces().await;
        (0..self.metadata.piece_count())
            .any(|i| self.is_wanted(i) && remote.get(i).unwrap_or(false) && !available.get(i).unwrap_or(false))
    }

    /// Give a claimed piece back so another channel can fetch it
    pub async fn release_piece(&self, index: usize) {
        self.in_flight.lock().await.remove(&index);
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Verify an assembled piece and persist it.
    ///
    /// Returns false when the hash does not match; the piece is released for
    /// another attempt.
    pub async fn complete_piece(&self, index: usize, data: Vec<u8>) -> Result<bool> {
        let metadata = Arc::clone(&self.metadata);
        let (valid, data) = run_blocking(&self.disk, move || {
            let valid = metadata.verify_piece(index, &data);
            (valid, data)
        })
        .await?;

        if !valid {
            warn!("Piece {} of {} failed hash check", index, self.metadata.info_hash);
            self.release_piece(index).await;
            return Ok(false);
        }

        let saved = self.storage.save_piece(index, &data).await;
        self.release_piece(index).await;
        if saved? {
            self.downloaded.fetch_add(data.len() as u64, Ordering::Relaxed);
        }
        if !self.storage.is_finished().await && self.is_complete().await {
            self.storage.finalize_present_files().await?;
        }

        let available = self.storage.available_count().await;
        self.progress.send_replace(available);
        self.events.emit(EngineEvent::PieceSaved {
            info_hash: self.metadata.info_hash,
            index,
            available,
            total: self.metadata.piece_count(),
        });
        debug!(
            "Saved piece {} of {} ({}/{})",
            index,
            self.metadata.info_hash,
            available,
            self.metadata.piece_count()
        );
        self.broadcast(PeerCommand::Have(index as u32)).await;
        Ok(true)
    }

    /// Serve an upload request
    pub async fn read_block(&self, request: &BlockRequest) -> Result<Vec<u8>> {
        let block = self
            .storage
            .read_piece_part(request.index as usize, request.begin as u64, request.length as usize)
            .await?;
        self.uploaded.fetch_add(block.len() as u64, Ordering::Relaxed);
        Ok(block)
    }

    pub async fn register_channel(&self, addr: SocketAddr, sender: mpsc::UnboundedSender<PeerCommand>) {
        self.channels.write().await.insert(addr, sender);
    }

    pub async fn unregister_channel(&self, addr: &SocketAddr) {
        self.channels.write().await.remove(addr);
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn has_channel(&self, addr: &SocketAddr) -> bool {
        self.channels.read().await.contains_key(addr)
    }

    async fn broadcast(&self, command: PeerCommand) {
        let channels = self.channels.read().await;
        for sender in channels.values() {
            let _ = sender.send(command);
        }
    }

    /// Ask every channel to close
    pub async fn close_channels(&self) {
        self.broadcast(PeerCommand::Close).await;
    }

    /// Record a storage failure; only the first one is kept
    pub async fn fail(&self, cause: impl Into<String>) {
        let mut failure = self.failure.lock().await;
        if failure.is_none() {
            let cause = cause.into();
            warn!("Session {} failed: {}", self.metadata.info_hash, cause);
            *failure = Some(cause);
        }
    }

    pub async fn failure(&self) -> Option<String> {
        self.failure.lock().await.clone()
    }

    pub fn emit(&self, event: EngineEvent) {
        self.events.emit(event);
    }
}

/// Pieces overlapping the selected files; an empty selection wants all
fn wanted_pieces(metadata: &TorrentMetadata, selection: &[String]) -> BitVec {
    let count = metadata.piece_count();
    if selection.is_empty() {
        return BitVec::from_elem(count, true);
    }
    let mut wanted = BitVec::from_elem(count, false);
    let piece_length = metadata.piece_length;
    for file in &metadata.files {
        let path = file.path.to_string_lossy();
        if file.length == 0 || !selection.iter().any(|s| s.as_str() == path) {
            continue;
        }
        let first = (file.offset / piece_length) as usize;
        let last = ((file.offset + file.length - 1) / piece_length) as usize;
        for index in first..=last.min(count.saturating_sub(1)) {
            wanted.set(index, true);
        }
    }
    wanted
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::events::NoopEventSink;
    use crate::storage::backend::{ByteStorage, MemoryByteStorage};
    use sha1::{Digest, Sha1};
    use std::path::PathBuf;

    pub(crate) const PIECE: usize = 32;

    pub(crate) fn metadata(data: &[u8], files: &[(&str, u64)]) -> Arc<TorrentMetadata> {
        let pieces: Vec<[u8; 20]> = data.chunks(PIECE).map(|c| Sha1::digest(c).into()).collect();
        let files = files.iter().map(|(p, l)| (PathBuf::from(p), *l)).collect();
        Arc::new(
            TorrentMetadata::new(InfoHash([6; 20]), "t".into(), PIECE as u64, pieces, files, true).unwrap(),
        )
    }

    pub(crate) fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    pub(crate) async fn session(data: &[u8], selection: &[String]) -> TorrentSession {
        let meta = metadata(data, &[("t/a", 40), ("t/b", data.len() as u64 - 40)]);
        let store: Arc<dyn ByteStorage> = Arc::new(MemoryByteStorage::new(data.len() as u64));
        let storage = PieceStorage::empty(store, PIECE as u64).unwrap();
        TorrentSession::new(
            meta,
            storage,
            selection,
            16,
            Arc::new(Semaphore::new(2)),
            Arc::new(NoopEventSink),
        )
        .await
    }

    #[tokio::test]
    async fn test_pick_skips_in_flight_and_missing() {
        let data = payload(100);
        let session = session(&data, &[]).await;
        let mut remote = BitVec::from_elem(4, false);
        remote.set(1, true);
        remote.set(2, true);

        assert_eq!(session.pick_piece(&remote).await, Some(1));
        assert_eq!(session.pick_piece(&remote).await, Some(2));
        assert_eq!(session.pick_piece(&remote).await, None);
        session.release_piece(1).await;
        assert_eq!(session.pick_piece(&remote).await, Some(1));
    }

    #[tokio::test]
    async fn test_complete_piece_verifies_and_broadcasts() {
        let data = payload(100);
        let session = session(&data, &[]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.register_channel("10.0.0.1:1".parse().unwrap(), tx).await;
        let mut progress = session.subscribe_progress();

        let all = BitVec::from_elem(4, true);
        assert_eq!(session.pick_piece(&all).await, Some(0));
        assert!(!session.complete_piece(0, vec![0u8; PIECE]).await.unwrap());
        assert_eq!(session.in_flight_count().await, 0);
        assert!(rx.try_recv().is_err());

        assert_eq!(session.pick_piece(&all).await, Some(0));
        assert!(session.complete_piece(0, data[..PIECE].to_vec()).await.unwrap());
        assert_eq!(rx.try_recv().unwrap(), PeerCommand::Have(0));
        assert!(session.storage().has_piece(0).await);
        assert_eq!(session.downloaded(), PIECE as u64);
        progress.changed().await.unwrap();
        assert_eq!(*progress.borrow(), 1);
        assert_eq!(session.pick_piece(&all).await, Some(1));
    }

    #[tokio::test]
    async fn test_selection_limits_wanted_pieces() {
        let data = payload(100);
        let session = session(&data, &["t/a".to_string()]).await;
        assert!(session.is_wanted(0));
        assert!(session.is_wanted(1));
        assert!(!session.is_wanted(2));
        assert_eq!(session.left().await, 64);

        session.complete_piece(0, data[..32].to_vec()).await.unwrap();
        assert!(!session.is_complete().await);
        session.complete_piece(1, data[32..64].to_vec()).await.unwrap();
        assert!(session.is_complete().await);
        assert!(!session.storage().is_finished().await);
    }
}
