//! Byte storage abstraction
//!
//! A torrent's files form one contiguous byte stream. [`ByteStorage`] exposes
//! that stream by absolute offset, independent of how it is laid out on disk.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::TorrentError;

/// Offset-addressed backing store for a torrent's bytes.
///
/// Callers serialize writes themselves (see `PieceStorage`); implementations
/// only need to be safe for concurrent reads.
#[async_trait]
pub trait ByteStorage: Send + Sync + fmt::Debug {
    /// Open for reading and, unless `read_only`, writing.
    ///
    /// Reopening in another mode closes the current handles first.
    async fn open(&self, read_only: bool) -> Result<()>;

    async fn is_open(&self) -> bool;

    /// Read exactly `len` bytes at `offset`
    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `data` at `offset`; fails when opened read-only
    async fn write(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Move the data to its final layout once every byte is present
    async fn finalize(&self) -> Result<()>;

    /// Release handles; the storage can be opened again
    async fn close(&self) -> Result<()>;

    /// Release handles for good; later opens fail
    async fn close_fully(&self) -> Result<()>;

    /// True when nothing of this layout exists yet
    async fn is_blank(&self) -> Result<bool>;

    /// Total number of bytes
    fn capacity(&self) -> u64;

    /// `(offset, length)` of every file in the stream
    fn file_spans(&self) -> Vec<(u64, u64)> {
        vec![(0, self.capacity())]
    }

    /// Move one file to its final layout while others are still incomplete.
    ///
    /// Returns `false` when the layout has nothing to move.
    async fn finalize_file(&self, _index: usize) -> Result<bool> {
        Ok(false)
    }
}

/// Fail when `offset..offset+len` is outside `capacity`
pub(crate) fn check_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(TorrentError::storage_error(format!(
            "Range {}+{} exceeds storage capacity {}",
            offset, len, capacity
        ))
        .into()),
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    data: Vec<u8>,
    open: Option<bool>,
    written: bool,
    finalized: bool,
    closed_fully: bool,
}

/// In-memory byte storage
#[derive(Debug)]
pub struct MemoryByteStorage {
    capacity: u64,
    state: Mutex<MemoryState>,
}

impl MemoryByteStorage {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(MemoryState {
                data: vec![0u8; capacity as usize],
                ..Default::default()
            }),
        }
    }

    /// Storage pre-filled with `data`, as if it had been downloaded before
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            capacity: data.len() as u64,
            state: Mutex::new(MemoryState {
                data,
                written: true,
                ..Default::default()
            }),
        }
    }

    pub async fn is_finalized(&self) -> bool {
        self.state.lock().await.finalized
    }

    /// Copy of the current contents
    pub async fn snapshot(&self) -> Vec<u8> {
        self.state.lock().await.data.clone()
    }
}

#[async_trait]
impl ByteStorage for MemoryByteStorage {
    async fn open(&self, read_only: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed_fully {
            return Err(TorrentError::storage_error("Storage has been closed fully").into());
        }
        debug!("Opening memory storage (read_only={})", read_only);
        state.open = Some(read_only);
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.state.lock().await.open.is_some()
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.capacity)?;
        let state = self.state.lock().await;
        if state.open.is_none() {
            return Err(TorrentError::storage_error("Storage is not open").into());
        }
        let start = offset as usize;
        Ok(state.data[start..start + len].to_vec())
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len(), self.capacity)?;
        let mut state = self.state.lock().await;
        match state.open {
            Some(false) => {}
            Some(true) => return Err(TorrentError::storage_error("Storage is open read-only").into()),
            None => return Err(TorrentError::storage_error("Storage is not open").into()),
        }
        trace!("Memory write {} bytes at {}", data.len(), offset);
        let start = offset as usize;
        state.data[start..start + data.len()].copy_from_slice(data);
        state.written = true;
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        self.state.lock().await.finalized = true;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().await.open = None;
        Ok(())
    }

    async fn close_fully(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.open = None;
        state.closed_fully = true;
        Ok(())
    }

    async fn is_blank(&self) -> Result<bool> {
        Ok(!self.state.lock().await.written)
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_read_write() {
        let storage = MemoryByteStorage::new(64);
        assert!(storage.is_blank().await.unwrap());
        assert!(storage.read(0, 4).await.is_err());

        storage.open(false).await.unwrap();
        storage.write(10, b"abcd").await.unwrap();
        assert_eq!(storage.read(10, 4).await.unwrap(), b"abcd".to_vec());
        assert!(!storage.is_blank().await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_storage_bounds_and_modes() {
        let storage = MemoryByteStorage::new(8);
        storage.open(true).await.unwrap();
        assert!(storage.write(0, b"x").await.is_err());
        assert!(storage.read(6, 4).await.is_err());

        storage.close_fully().await.unwrap();
        assert!(storage.open(false).await.is_err());
    }

    #[test]
    fn test_check_range_overflow() {
        assert!(check_range(u64::MAX, 2, 10).is_err());
        assert!(check_range(8, 2, 10).is_ok());
        assert!(check_range(9, 2, 10).is_err());
    }
}
