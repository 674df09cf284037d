//! Download tasks
//!
//! Persistent tasks, the transfers that move their bytes and the state
//! machine between them.

pub mod downloader;
pub mod repository;
pub mod task;
pub mod transfer;

pub use downloader::Downloader;
pub use repository::TaskRepository;
pub use task::{TaskEntity, TaskStatus};
pub use transfer::{check_finish, Protocol, TorrentTransfer, Transfer};
