//! Piece storage
//!
//! Tracks which pieces of a torrent are present and serializes piece reads
//! and writes against the underlying [`ByteStorage`].

use std::sync::Arc;

use anyhow::Result;
use bit_vec::BitVec;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::storage::backend::ByteStorage;

#[derive(Debug)]
struct PieceState {
    /// `None` once every piece is present
    available: Option<BitVec>,
    closed_fully: bool,
}

/// Piece-addressed view over a byte storage.
///
/// Writes take the write lock and exclude every other operation; reads of
/// different pieces share the read lock.
#[derive(Debug)]
pub struct PieceStorage {
    storage: Arc<dyn ByteStorage>,
    piece_size: u64,
    pieces_count: usize,
    state: RwLock<PieceState>,
}

impl PieceStorage {
    /// Piece storage with the given availability.
    ///
    /// A full bitset is stored as the finished sentinel right away.
    pub fn new(storage: Arc<dyn ByteStorage>, piece_size: u64, available: BitVec) -> Result<Self> {
        if piece_size == 0 {
            return Err(TorrentError::validation_error_with_field("Piece size must be positive", "piece_size").into());
        }
        let pieces_count = storage.capacity().div_ceil(piece_size) as usize;
        if available.len() != pieces_count {
            return Err(TorrentError::validation_error_with_field(
                format!("Bitset has {} entries, storage holds {} pieces", available.len(), pieces_count),
                "available",
            )
            .into());
        }

        let finished = available.all();
        debug!(
            "Piece storage: {} pieces of {} bytes, {} available",
            pieces_count,
            piece_size,
            available.count_ones()
        );
        Ok(Self {
            storage,
            piece_size,
            pieces_count,
            state: RwLock::new(PieceState {
                available: if finished { None } else { Some(available) },
                closed_fully: false,
            }),
        })
    }

    /// Nothing downloaded yet
    pub fn empty(storage: Arc<dyn ByteStorage>, piece_size: u64) -> Result<Self> {
        let count = storage.capacity().div_ceil(piece_size.max(1)) as usize;
        Self::new(storage, piece_size, BitVec::from_elem(count, false))
    }

    /// Everything already present
    pub fn complete(storage: Arc<dyn ByteStorage>, piece_size: u64) -> Result<Self> {
        let count = storage.capacity().div_ceil(piece_size.max(1)) as usize;
        Self::new(storage, piece_size, BitVec::from_elem(count, true))
    }

    pub fn pieces_count(&self) -> usize {
        self.pieces_count
    }

    /// Nominal piece size
    pub fn piece_size(&self) -> u64 {
        self.piece_size
    }

    /// Actual length of piece `index`; the last piece may be short
    pub fn piece_length(&self, index: usize) -> u64 {
        if index >= self.pieces_count {
            return 0;
        }
        let start = index as u64 * self.piece_size;
        (self.storage.capacity() - start).min(self.piece_size)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.pieces_count {
            return Err(TorrentError::validation_error_with_field(
                format!("Piece index {} out of range 0..{}", index, self.pieces_count),
                "index",
            )
            .into());
        }
        Ok(())
    }

    fn closed_error() -> anyhow::Error {
        TorrentError::storage_error("Piece storage has been closed fully").into()
    }

    /// Store piece `index`.
    ///
    /// Returns `false` without touching the storage when the piece is
    /// already present. Completing the last piece finalizes the storage and
    /// reopens it read-only.
    pub async fn save_piece(&self, index: usize, data: &[u8]) -> Result<bool> {
        self.check_index(index)?;
        let expected = self.piece_length(index);
        if data.len() as u64 != expected {
            return Err(TorrentError::validation_error_with_field(
                format!("Piece {} must be {} bytes, got {}", index, expected, data.len()),
                "data",
            )
            .into());
        }

        {
            let state = self.state.read().await;
            if state.closed_fully {
                return Err(Self::closed_error());
            }
            match &state.available {
                None => return Ok(false),
                Some(bits) if bits.get(index).unwrap_or(false) => return Ok(false),
                _ => {}
            }
        }

        let mut state = self.state.write().await;
        if state.closed_fully {
            return Err(Self::closed_error());
        }
        let bits = match state.available.as_mut() {
            None => return Ok(false),
            Some(bits) if bits.get(index).unwrap_or(false) => return Ok(false),
            Some(bits) => bits,
        };

        self.storage.open(false).await?;
        self.storage.write(index as u64 * self.piece_size, data).await?;
        bits.set(index, true);
        trace!("Saved piece {} ({} bytes)", index, data.len());

        if bits.all() {
            info!("All {} pieces present, finalizing storage", self.pieces_count);
            state.available = None;
            self.storage.finalize().await?;
            self.storage.close().await?;
            self.storage.open(true).await?;
        }
        Ok(true)
    }

    /// Read `length` bytes at `offset` inside piece `index`
    pub async fn read_piece_part(&self, index: usize, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.check_index(index)?;
        let piece_len = self.piece_length(index);
        if offset.saturating_add(length as u64) > piece_len {
            return Err(TorrentError::validation_error_with_field(
                format!("Range {}+{} exceeds piece {} of {} bytes", offset, length, index, piece_len),
                "offset",
            )
            .into());
        }

        let state = self.state.read().await;
        if state.closed_fully {
            return Err(Self::closed_error());
        }
        let finished = match &state.available {
            None => true,
            Some(bits) if bits.get(index).unwrap_or(false) => false,
            Some(_) => {
                return Err(TorrentError::storage_error(format!("Piece {} is not available", index)).into());
            }
        };

        if !self.storage.is_open().await {
            self.storage.open(finished).await?;
        }
        self.storage.read(index as u64 * self.piece_size + offset, length).await
    }

    /// Whether piece `index` is present
    pub async fn has_piece(&self, index: usize) -> bool {
        match &self.state.read().await.available {
            None => index < self.pieces_count,
            Some(bits) => bits.get(index).unwrap_or(false),
        }
    }

    /// Snapshot of the availability set; full once finished
    pub async fn available_pieces(&self) -> BitVec {
        match &self.state.read().await.available {
            None => BitVec::from_elem(self.pieces_count, true),
            Some(bits) => bits.clone(),
        }
    }

    pub async fn available_count(&self) -> usize {
        match &self.state.read().await.available {
            None => self.pieces_count,
            Some(bits) => bits.count_ones() as usize,
        }
    }

    /// Availability encoded as a peer-wire bitfield payload
    pub async fn bitfield_bytes(&self) -> Vec<u8> {
        self.available_pieces().await.to_bytes()
    }

    pub async fn is_finished(&self) -> bool {
        self.state.read().await.available.is_none()
    }

    /// Finalize each file whose pieces are all present.
    ///
    /// Used when only part of the torrent is wanted and the last piece will
    /// never arrive. Returns how many files were moved.
    pub async fn finalize_present_files(&self) -> Result<usize> {
        let state = self.state.write().await;
        if state.closed_fully {
            return Err(Self::closed_error());
        }
        let Some(bits) = &state.available else {
            return Ok(0);
        };

        let mut moved = 0;
        for (index, (offset, length)) in self.storage.file_spans().into_iter().enumerate() {
            if length == 0 {
                continue;
            }
            let first = (offset / self.piece_size) as usize;
            let last = ((offset + length - 1) / self.piece_size) as usize;
            if (first..=last).all(|piece| bits.get(piece).unwrap_or(false)) && self.storage.finalize_file(index).await? {
                moved += 1;
            }
        }
        if moved > 0 {
            info!("Finalized {} complete file(s)", moved);
        }
        Ok(moved)
    }

    /// Release file handles; the storage reopens lazily on next use
    pub async fn close(&self) -> Result<()> {
        let _state = self.state.write().await;
        self.storage.close().await
    }

    /// Close for good; later saves and reads fail
    pub async fn close_fully(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.closed_fully {
            return Ok(());
        }
        state.closed_fully = true;
        if let Err(e) = self.storage.close_fully().await {
            warn!("Closing byte storage failed: {}", e);
            return Err(e);
        }
        debug!("Piece storage closed fully");
        Ok(())
    }

    pub fn byte_storage(&self) -> &Arc<dyn ByteStorage> {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryByteStorage;

    const PIECE: u64 = 16 * 1024;

    fn piece_data(index: usize, len: usize) -> Vec<u8> {
        (0..len).map(|i| (i + index * 7) as u8).collect()
    }

    fn storage(pieces: u64) -> (Arc<MemoryByteStorage>, PieceStorage) {
        let bytes = Arc::new(MemoryByteStorage::new(pieces * PIECE));
        let ps = PieceStorage::empty(bytes.clone(), PIECE).unwrap();
        (bytes, ps)
    }

    #[tokio::test]
    async fn test_piece_round_trip() {
        let (_, ps) = storage(4);
        for i in 0..4 {
            let data = piece_data(i, PIECE as usize);
            assert!(ps.save_piece(i, &data).await.unwrap());
            assert_eq!(ps.read_piece_part(i, 0, data.len()).await.unwrap(), data);
        }
        let tail = ps.read_piece_part(2, 100, 50).await.unwrap();
        assert_eq!(tail, piece_data(2, PIECE as usize)[100..150].to_vec());
    }

    #[tokio::test]
    async fn test_ten_pieces_completion_sentinel() {
        let (bytes, ps) = storage(10);
        for i in 0..9 {
            ps.save_piece(i, &piece_data(i, PIECE as usize)).await.unwrap();
        }
        assert!(!ps.is_finished().await);
        assert_eq!(ps.available_pieces().await.count_ones(), 9);
        assert!(!bytes.is_finalized().await);

        ps.save_piece(9, &piece_data(9, PIECE as usize)).await.unwrap();
        assert!(ps.is_finished().await);
        let all = ps.available_pieces().await;
        assert_eq!(all.len(), 10);
        assert_eq!(all.count_ones(), 10);
        assert!(bytes.is_finalized().await);
        assert!(bytes.is_open().await);
        assert!(bytes.write(0, b"x").await.is_err());
        assert_eq!(ps.read_piece_part(9, 0, 4).await.unwrap(), piece_data(9, 4));
    }

    #[tokio::test]
    async fn test_finalize_present_files_moves_only_complete_files() {
        use crate::storage::file::FileByteStorage;
        use crate::torrent::TorrentFile;

        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            TorrentFile {
                path: "set/a.bin".into(),
                length: PIECE + 10,
                offset: 0,
            },
            TorrentFile {
                path: "set/b.bin".into(),
                length: 2 * PIECE - 10,
                offset: PIECE + 10,
            },
        ];
        let bytes: Arc<dyn ByteStorage> = Arc::new(FileByteStorage::new(dir.path(), files));
        let ps = PieceStorage::empty(bytes, PIECE).unwrap();

        ps.save_piece(0, &piece_data(0, PIECE as usize)).await.unwrap();
        assert_eq!(ps.finalize_present_files().await.unwrap(), 0);

        ps.save_piece(1, &piece_data(1, PIECE as usize)).await.unwrap();
        assert_eq!(ps.finalize_present_files().await.unwrap(), 1);
        assert!(dir.path().join("set/a.bin").exists());
        assert!(!dir.path().join("set/a.bin.part").exists());
        assert!(dir.path().join("set/b.bin.part").exists());
        assert!(!ps.is_finished().await);
        assert_eq!(ps.read_piece_part(1, 0, 8).await.unwrap(), piece_data(1, 8));
    }

    #[tokio::test]
    async fn test_save_twice_is_noop() {
        let (bytes, ps) = storage(2);
        let first = vec![1u8; PIECE as usize];
        let second = vec![2u8; PIECE as usize];
        assert!(ps.save_piece(0, &first).await.unwrap());
        assert!(!ps.save_piece(0, &second).await.unwrap());
        assert_eq!(bytes.snapshot().await[..PIECE as usize], first[..]);
    }

    #[tokio::test]
    async fn test_out_of_range_index_fails_without_touching_storage() {
        let (bytes, ps) = storage(3);
        assert!(ps.save_piece(3, &vec![0u8; PIECE as usize]).await.is_err());
        assert!(ps.read_piece_part(3, 0, 1).await.is_err());
        assert!(ps.read_piece_part(usize::MAX, 0, 1).await.is_err());
        assert!(!bytes.is_open().await);
        assert!(bytes.is_blank().await.unwrap());
    }

    #[tokio::test]
    async fn test_read_missing_piece_fails() {
        let (_, ps) = storage(2);
        ps.save_piece(0, &vec![5u8; PIECE as usize]).await.unwrap();
        assert!(ps.read_piece_part(1, 0, 10).await.is_err());
        assert!(ps.read_piece_part(0, PIECE - 5, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_short_last_piece() {
        let bytes = Arc::new(MemoryByteStorage::new(2 * PIECE + 100));
        let ps = PieceStorage::empty(bytes, PIECE).unwrap();
        assert_eq!(ps.pieces_count(), 3);
        assert_eq!(ps.piece_length(2), 100);
        assert!(ps.save_piece(2, &vec![1u8; PIECE as usize]).await.is_err());
        assert!(ps.save_piece(2, &vec![1u8; 100]).await.unwrap());
    }

    #[tokio::test]
    async fn test_close_fully_is_permanent() {
        let (_, ps) = storage(2);
        ps.save_piece(0, &vec![1u8; PIECE as usize]).await.unwrap();
        ps.close_fully().await.unwrap();
        assert!(ps.save_piece(1, &vec![1u8; PIECE as usize]).await.is_err());
        assert!(ps.read_piece_part(0, 0, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_bitfield_bytes_msb_first() {
        let (_, ps) = storage(10);
        ps.save_piece(0, &vec![0u8; PIECE as usize]).await.unwrap();
        ps.save_piece(9, &vec![0u8; PIECE as usize]).await.unwrap();
        assert_eq!(ps.bitfield_bytes().await, vec![0b1000_0000, 0b0100_0000]);
    }

    #[tokio::test]
    async fn test_complete_storage_is_finished() {
        let bytes = Arc::new(MemoryByteStorage::with_data(vec![1u8; 3 * PIECE as usize]));
        let ps = PieceStorage::complete(bytes, PIECE).unwrap();
        assert!(ps.is_finished().await);
        assert_eq!(ps.available_count().await, 3);
        assert!(!ps.save_piece(1, &vec![0u8; PIECE as usize]).await.unwrap());
        assert_eq!(ps.read_piece_part(1, 0, 2).await.unwrap(), vec![1u8, 1u8]);
    }
}
