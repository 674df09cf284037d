//! File-backed byte storage
//!
//! Lays the torrent's byte stream out over its file list under a download
//! directory. Unfinished files carry a `.part` suffix until `finalize`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::storage::backend::{check_range, ByteStorage};
use crate::torrent::info::TorrentFile;

const PART_SUFFIX: &str = ".part";

#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    file: Mutex<File>,
}

#[derive(Debug)]
struct Handles {
    read_only: bool,
    files: Vec<OpenFile>,
}

/// Multi-file storage rooted at a download directory
#[derive(Debug)]
pub struct FileByteStorage {
    root: PathBuf,
    files: Vec<TorrentFile>,
    capacity: u64,
    handles: RwLock<Option<Handles>>,
    closed_fully: AtomicBool,
}

/// One contiguous slice of a read or write that falls inside a single file
#[derive(Debug, PartialEq, Eq)]
struct Segment {
    file: usize,
    file_offset: u64,
    buf_offset: usize,
    len: usize,
}

fn part_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(PART_SUFFIX);
    PathBuf::from(s)
}

fn io_error(message: &str, path: &Path, e: std::io::Error) -> anyhow::Error {
    error!("{} '{}': {}", message, path.display(), e);
    TorrentError::storage_error_full(message, path.display().to_string(), e.to_string()).into()
}

impl FileByteStorage {
    pub fn new(root: impl Into<PathBuf>, files: Vec<TorrentFile>) -> Self {
        let capacity = files.iter().map(|f| f.length).sum();
        Self {
            root: root.into(),
            files,
            capacity,
            handles: RwLock::new(None),
            closed_fully: AtomicBool::new(false),
        }
    }

    /// Final on-disk path of file `index`
    pub fn final_path(&self, index: usize) -> PathBuf {
        self.root.join(&self.files[index].path)
    }

    /// Split `offset..offset+len` by cumulative file offsets
    fn segments(&self, offset: u64, len: usize) -> Vec<Segment> {
        let end = offset + len as u64;
        self.files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.length > 0 && f.offset < end && f.offset + f.length > offset)
            .map(|(i, f)| {
                let start = offset.max(f.offset);
                let stop = end.min(f.offset + f.length);
                Segment {
                    file: i,
                    file_offset: start - f.offset,
                    buf_offset: (start - offset) as usize,
                    len: (stop - start) as usize,
                }
            })
            .collect()
    }

    /// `.part` path while incomplete, final path once only that exists
    async fn resolve(&self, index: usize) -> PathBuf {
        let final_path = self.final_path(index);
        let part = part_path(&final_path);
        let final_exists = fs::try_exists(&final_path).await.unwrap_or(false);
        let part_exists = fs::try_exists(&part).await.unwrap_or(false);
        if final_exists && !part_exists {
            final_path
        } else {
            part
        }
    }

    async fn open_file(&self, index: usize, read_only: bool) -> Result<OpenFile> {
        let path = self.resolve(index).await;
        let length = self.files[index].length;

        if read_only {
            let file = File::open(&path)
                .await
                .map_err(|e| io_error("Failed to open file for reading", &path, e))?;
            return Ok(OpenFile { path, file: Mutex::new(file) });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("Failed to create directory", parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| io_error("Failed to open file for writing", &path, e))?;
        let current = file
            .metadata()
            .await
            .map_err(|e| io_error("Failed to stat file", &path, e))?
            .len();
        if current != length {
            debug!("Resizing {} from {} to {} bytes", path.display(), current, length);
            file.set_len(length)
                .await
                .map_err(|e| io_error("Failed to set file length", &path, e))?;
        }
        Ok(OpenFile { path, file: Mutex::new(file) })
    }

    fn ensure_not_closed(&self) -> Result<()> {
        if self.closed_fully.load(Ordering::Acquire) {
            return Err(TorrentError::storage_error_with_path(
                "Storage has been closed fully",
                self.root.display().to_string(),
            )
            .into());
        }
        Ok(())
    }

    async fn flush_handles(handles: &Handles) -> Result<()> {
        if handles.read_only {
            return Ok(());
        }
        for open in &handles.files {
            let mut file = open.file.lock().await;
            file.flush().await.map_err(|e| io_error("Failed to flush file", &open.path, e))?;
            file.sync_all().await.map_err(|e| io_error("Failed to sync file", &open.path, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ByteStorage for FileByteStorage {
    async fn open(&self, read_only: bool) -> Result<()> {
        self.ensure_not_closed()?;
        let mut guard = self.handles.write().await;
        if let Some(handles) = guard.as_ref() {
            if handles.read_only == read_only {
                return Ok(());
            }
            Self::flush_handles(handles).await?;
        }

        info!(
            "Opening {} files under {} (read_only={})",
            self.files.len(),
            self.root.display(),
            read_only
        );
        let mut files = Vec::with_capacity(self.files.len());
        for index in 0..self.files.len() {
            files.push(self.open_file(index, read_only).await?);
        }
        *guard = Some(Handles { read_only, files });
        Ok(())
    }

    async fn is_open(&self) -> bool {
        self.handles.read().await.is_some()
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        check_range(offset, len, self.capacity)?;
        let guard = self.handles.read().await;
        let handles = guard
            .as_ref()
            .ok_or_else(|| TorrentError::storage_error_with_path("Storage is not open", self.root.display().to_string()))?;

        let mut buf = vec![0u8; len];
        for seg in self.segments(offset, len) {
            let open = &handles.files[seg.file];
            trace!("Reading {} bytes from {} at {}", seg.len, open.path.display(), seg.file_offset);
            let mut file = open.file.lock().await;
            file.seek(std::io::SeekFrom::Start(seg.file_offset))
                .await
                .map_err(|e| io_error("Failed to seek in file", &open.path, e))?;
            file.read_exact(&mut buf[seg.buf_offset..seg.buf_offset + seg.len])
                .await
                .map_err(|e| io_error("Failed to read from file", &open.path, e))?;
        }
        Ok(buf)
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        check_range(offset, data.len(), self.capacity)?;
        let guard = self.handles.read().await;
        let handles = guard
            .as_ref()
            .ok_or_else(|| TorrentError::storage_error_with_path("Storage is not open", self.root.display().to_string()))?;
        if handles.read_only {
            return Err(TorrentError::storage_error_with_path(
                "Storage is open read-only",
                self.root.display().to_string(),
            )
            .into());
        }

        for seg in self.segments(offset, data.len()) {
            let open = &handles.files[seg.file];
            trace!("Writing {} bytes to {} at {}", seg.len, open.path.display(), seg.file_offset);
            let mut file = open.file.lock().await;
            file.seek(std::io::SeekFrom::Start(seg.file_offset))
                .await
                .map_err(|e| io_error("Failed to seek in file", &open.path, e))?;
            file.write_all(&data[seg.buf_offset..seg.buf_offset + seg.len])
                .await
                .map_err(|e| io_error("Failed to write to file", &open.path, e))?;
        }
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        self.ensure_not_closed()?;
        let mut guard = self.handles.write().await;
        if let Some(handles) = guard.take() {
            Self::flush_handles(&handles).await?;
        }

        for index in 0..self.files.len() {
            let final_path = self.final_path(index);
            let part = part_path(&final_path);
            if fs::try_exists(&part).await.unwrap_or(false) {
                debug!("Renaming {} -> {}", part.display(), final_path.display());
                fs::rename(&part, &final_path)
                    .await
                    .map_err(|e| io_error("Failed to rename finished file", &part, e))?;
            }
        }
        info!("Finalized storage under {}", self.root.display());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.handles.write().await;
        if let Some(handles) = guard.take() {
            if let Err(e) = Self::flush_handles(&handles).await {
                warn!("Flush on close failed: {}", e);
            }
            debug!("Closed storage under {}", self.root.display());
        }
        Ok(())
    }

    async fn close_fully(&self) -> Result<()> {
        self.close().await?;
        self.closed_fully.store(true, Ordering::Release);
        Ok(())
    }

    async fn is_blank(&self) -> Result<bool> {
        for index in 0..self.files.len() {
            let final_path = self.final_path(index);
            if fs::try_exists(&final_path).await.unwrap_or(false)
                || fs::try_exists(part_path(&final_path)).await.unwrap_or(false)
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn file_spans(&self) -> Vec<(u64, u64)> {
        self.files.iter().map(|f| (f.offset, f.length)).collect()
    }

    async fn finalize_file(&self, index: usize) -> Result<bool> {
        self.ensure_not_closed()?;
        if index >= self.files.len() {
            return Err(TorrentError::storage_error(format!("No file at index {}", index)).into());
        }
        let final_path = self.final_path(index);
        let part = part_path(&final_path);
        if !fs::try_exists(&part).await.unwrap_or(false) {
            return Ok(false);
        }

        // handles point at the .part paths; the next open resolves again
        let mut guard = self.handles.write().await;
        if let Some(handles) = guard.take() {
            Self::flush_handles(&handles).await?;
        }
        debug!("Renaming {} -> {}", part.display(), final_path.display());
        fs::rename(&part, &final_path)
            .await
            .map_err(|e| io_error("Failed to rename finished file", &part, e))?;
        Ok(true)
    }
}
