//! CLI module
//!
//! Command-line arguments, engine configuration and progress output.

pub mod args;
pub mod config;
pub mod progress;

pub use args::CliArgs;
pub use config::EngineConfig;
pub use progress::{DownloadStats, ProgressDisplay};
