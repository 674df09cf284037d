//! Download tasks
//!
//! The persisted record of one download and the status transitions it may
//! go through.

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::TorrentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Await,
    Download,
    Pause,
    Completed,
    Fail,
    Delete,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Fail | TaskStatus::Delete)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Delete, _) => false,
            (_, Delete) => true,
            (Await, Download) => true,
            (Download, Completed | Fail) => true,
            (Await | Download, Pause) => true,
            // resume a paused task or retry a failed one
            (Pause | Fail, Await) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Await => "AWAIT",
            TaskStatus::Download => "DOWNLOAD",
            TaskStatus::Pause => "PAUSE",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Fail => "FAIL",
            TaskStatus::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A persisted download task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntity {
    pub id: String,
    pub name: String,
    /// `.torrent` path or magnet link
    pub url: String,
    /// Download directory
    pub file: PathBuf,
    pub status: TaskStatus,
    /// Bytes of the selected files, known once metadata is resolved
    pub size: u64,
    /// Selected sub-file paths; empty selects everything
    #[serde(default)]
    pub description: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl TaskEntity {
    pub fn new(url: impl Into<String>, file: impl Into<PathBuf>, selection: Vec<String>) -> Self {
        let url = url.into();
        let now = unix_now();
        Self {
            id: rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(16)
                .map(char::from)
                .collect(),
            name: url.clone(),
            url,
            file: file.into(),
            status: TaskStatus::Await,
            size: 0,
            description: selection,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, failing on an illegal transition
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition(next) {
            return Err(TorrentError::validation_error_with_field(
                format!("Task {} cannot go from {} to {}", self.id, self.status, next),
                "status",
            )
            .into());
        }
        self.status = next;
        self.updated_at = unix_now();
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
