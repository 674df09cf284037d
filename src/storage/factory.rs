//! Piece storage construction strategies
//!
//! A download starts from nothing, from a file already known to be complete,
//! or from whatever is on disk, re-hashed piece by piece.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bit_vec::BitVec;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::error::TorrentError;
use crate::storage::backend::ByteStorage;
use crate::storage::piece::PieceStorage;
use crate::torrent::info::TorrentMetadata;

/// Builds a [`PieceStorage`] for a torrent over a byte storage
#[async_trait]
pub trait PieceStorageFactory: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, metadata: &TorrentMetadata, storage: Arc<dyn ByteStorage>) -> Result<PieceStorage>;
}

fn check_capacity(metadata: &TorrentMetadata, storage: &Arc<dyn ByteStorage>) -> Result<()> {
    if storage.capacity() != metadata.total_size() {
        return Err(TorrentError::validation_error_with_field(
            format!(
                "Storage holds {} bytes, torrent needs {}",
                storage.capacity(),
                metadata.total_size()
            ),
            "capacity",
        )
        .into());
    }
    Ok(())
}

/// Fresh download: no piece present
#[derive(Debug, Default)]
pub struct EmptyPieceStorageFactory;

#[async_trait]
impl PieceStorageFactory for EmptyPieceStorageFactory {
    fn name(&self) -> &'static str {
        "empty"
    }

    async fn create(&self, metadata: &TorrentMetadata, storage: Arc<dyn ByteStorage>) -> Result<PieceStorage> {
        check_capacity(metadata, &storage)?;
        PieceStorage::empty(storage, metadata.piece_length)
    }
}

/// Seeding a finished download: every piece present
#[derive(Debug, Default)]
pub struct CompletePieceStorageFactory;

#[async_trait]
impl PieceStorageFactory for CompletePieceStorageFactory {
    fn name(&self) -> &'static str {
        "complete"
    }

    async fn create(&self, metadata: &TorrentMetadata, storage: Arc<dyn ByteStorage>) -> Result<PieceStorage> {
        check_capacity(metadata, &storage)?;
        PieceStorage::complete(storage, metadata.piece_length)
    }
}

/// Resume: hash every piece on disk and keep those that match.
///
/// A piece that cannot be read or does not match simply stays missing.
#[derive(Debug, Default)]
pub struct VerifyingPieceStorageFactory;

impl VerifyingPieceStorageFactory {
    async fn piece_matches(metadata: &TorrentMetadata, storage: &Arc<dyn ByteStorage>, index: usize) -> bool {
        let Some((start, end)) = metadata.piece_range(index) else {
            return false;
        };
        let data = match storage.read(start, (end - start) as usize).await {
            Ok(data) => data,
            Err(e) => {
                debug!("Piece {} unreadable during verify: {}", index, e);
                return false;
            }
        };
        let Some(expected) = metadata.piece_hash(index).copied() else {
            return false;
        };

        match tokio::task::spawn_blocking(move || <[u8; 20]>::from(Sha1::digest(&data)) == expected).await {
            Ok(matches) => matches,
            Err(e) => {
                warn!("Hash task for piece {} failed: {}", index, e);
                false
            }
        }
    }
}

#[async_trait]
impl PieceStorageFactory for VerifyingPieceStorageFactory {
    fn name(&self) -> &'static str {
        "verifying"
    }

    async fn create(&self, metadata: &TorrentMetadata, storage: Arc<dyn ByteStorage>) -> Result<PieceStorage> {
        check_capacity(metadata, &storage)?;
        let count = metadata.piece_count();
        let mut available = BitVec::from_elem(count, false);

        match storage.open(false).await {
            Ok(()) => {
                for index in 0..count {
                    if Self::piece_matches(metadata, &storage, index).await {
                        available.set(index, true);
                    }
                }
            }
            Err(e) => warn!("Could not open storage for verification, starting empty: {}", e),
        }

        info!(
            "Verified {}: {}/{} pieces intact",
            metadata.name,
            available.count_ones(),
            count
        );
        let finished = available.all();
        let pieces = PieceStorage::new(storage.clone(), metadata.piece_length, available)?;
        if finished {
            storage.finalize().await?;
        }
        Ok(pieces)
    }
}

/// Pick the strategy for a task: completed tasks seed, blank storage starts
/// empty, anything else is verified
pub async fn select_factory(completed: bool, storage: &Arc<dyn ByteStorage>) -> Result<Box<dyn PieceStorageFactory>> {
    let factory: Box<dyn PieceStorageFactory> = if completed {
        Box::new(CompletePieceStorageFactory)
    } else if storage.is_blank().await? {
        Box::new(EmptyPieceStorageFactory)
    } else {
        Box::new(VerifyingPieceStorageFactory)
    };
    debug!("Selected {} piece storage factory", factory.name());
    Ok(factory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::backend::MemoryByteStorage;
    use crate::storage::file::FileByteStorage;
    use crate::torrent::info::InfoHash;
    use std::path::PathBuf;
    use tempfile::tempdir;

    const PIECE: usize = 1024;

    fn metadata_for(data: &[u8]) -> TorrentMetadata {
        let pieces: Vec<[u8; 20]> = data.chunks(PIECE).map(|c| Sha1::digest(c).into()).collect();
        TorrentMetadata::new(
            InfoHash([4u8; 20]),
            "blob.bin".to_string(),
            PIECE as u64,
            pieces,
            vec![(PathBuf::from("blob.bin"), data.len() as u64)],
            false,
        )
        .unwrap()
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_verifying_marks_only_matching_pieces() {
        let good = content(5 * PIECE);
        let meta = metadata_for(&good);
        let mut damaged = good.clone();
        damaged[PIECE + 3] ^= 0xff;
        damaged[4 * PIECE] ^= 0x01;

        let storage: Arc<dyn ByteStorage> = Arc::new(MemoryByteStorage::with_data(damaged));
        let ps = VerifyingPieceStorageFactory.create(&meta, storage).await.unwrap();

        let bits = ps.available_pieces().await;
        let marked: Vec<usize> = (0..5).filter(|i| bits[*i]).collect();
        assert_eq!(marked, vec![0, 2, 3]);
        assert!(!ps.is_finished().await);
    }

    #[tokio::test]
    async fn test_verifying_all_good_is_finished() {
        let good = content(3 * PIECE + 10);
        let meta = metadata_for(&good);
        let storage: Arc<dyn ByteStorage> = Arc::new(MemoryByteStorage::with_data(good));
        let ps = VerifyingPieceStorageFactory.create(&meta, storage).await.unwrap();
        assert!(ps.is_finished().await);
    }

    #[tokio::test]
    async fn test_verifying_tolerates_truncated_file() {
        let dir = tempdir().unwrap();
        let good = content(4 * PIECE);
        let meta = metadata_for(&good);
        std::fs::write(dir.path().join("blob.bin.part"), &good[..2 * PIECE + 100]).unwrap();

        let storage: Arc<dyn ByteStorage> = Arc::new(FileByteStorage::new(dir.path(), meta.files.clone()));
        assert!(!storage.is_blank().await.unwrap());
        let ps = VerifyingPieceStorageFactory.create(&meta, storage).await.unwrap();
        assert_eq!(ps.available_count().await, 2);
        assert!(!ps.is_finished().await);
    }

    #[tokio::test]
    async fn test_empty_and_complete_factories() {
        let data = content(2 * PIECE);
        let meta = metadata_for(&data);

        let storage: Arc<dyn ByteStorage> = Arc::new(MemoryByteStorage::new(data.len() as u64));
        let empty = EmptyPieceStorageFactory.create(&meta, storage).await.unwrap();
        assert_eq!(empty.available_count().await, 0);

        let storage: Arc<dyn ByteStorage> = Arc::new(MemoryByteStorage::with_data(data));
        let complete = CompletePieceStorageFactory.create(&meta, storage).await.unwrap();
        assert!(complete.is_finished().await);
    }

    #[tokio::test]
    async fn test_capacity_mismatch_rejected() {
        let meta = metadata_for(&content(2 * PIECE));
        let storage: Arc<dyn ByteStorage> = Arc::new(MemoryByteStorage::new(10));
        assert!(EmptyPieceStorageFactory.create(&meta, storage).await.is_err());
    }

    #[tokio::test]
    async fn test_select_factory() {
        let blank: Arc<dyn ByteStorage> = Arc::new(MemoryByteStorage::new(8));
        let used: Arc<dyn ByteStorage> = Arc::new(MemoryByteStorage::with_data(vec![0u8; 8]));
        assert_eq!(select_factory(false, &blank).await.unwrap().name(), "empty");
        assert_eq!(select_factory(false, &used).await.unwrap().name(), "verifying");
        assert_eq!(select_factory(true, &blank).await.unwrap().name(), "complete");
    }
}
