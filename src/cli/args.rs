//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for the engine binary
#[derive(Debug, Parser)]
#[command(name = "bt-engine")]
#[command(about = "Download a torrent or magnet link", long_about = None)]
pub struct CliArgs {
    /// Path to a .torrent file or a magnet link
    #[arg(value_name = "TORRENT_OR_MAGNET")]
    pub source: String,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Listening port for incoming connections
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Maximum number of peer connections
    #[arg(short, long)]
    pub max_connections: Option<usize>,

    /// Disable DHT peer discovery
    #[arg(long)]
    pub no_dht: bool,

    /// Disable tracker announces
    #[arg(long)]
    pub no_tracker: bool,

    /// Disable local service discovery
    #[arg(long)]
    pub no_lsd: bool,

    /// JSON engine configuration
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = CliArgs::parse_from(["bt-engine", "file.torrent"]);
        assert_eq!(args.source, "file.torrent");
        assert!(args.output_dir.is_none());
        assert!(args.port.is_none());
        assert!(!args.no_dht);
        assert!(!args.no_lsd);
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_flags() {
        let args = CliArgs::parse_from([
            "bt-engine",
            "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567",
            "-m",
            "20",
            "--no-tracker",
            "--config",
            "engine.json",
            "-q",
        ]);
        assert!(args.source.starts_with("magnet:"));
        assert_eq!(args.max_connections, Some(20));
        assert!(args.no_tracker);
        assert_eq!(args.config, Some(PathBuf::from("engine.json")));
        assert!(args.is_quiet());
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(CliArgs::try_parse_from(["bt-engine", "x", "-v", "-q"]).is_err());
    }
}
