//! Engine configuration
//!
//! Every tunable of the engine in one serde struct, loadable from a JSON
//! file and overridable from the command line.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::cli::args::CliArgs;
use crate::dht::{DhtConfig, DEFAULT_BOOTSTRAP_NODES, DEFAULT_BUCKET_SIZE};
use crate::error::TorrentError;
use crate::peer::connection::ConnectionConfig;
use crate::session::DEFAULT_BLOCK_SIZE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub download_dir: PathBuf,
    pub listen_ip: IpAddr,
    /// TCP port for peers; the DHT binds the same UDP port
    pub listen_port: u16,
    /// Peer connections per torrent
    pub max_connections: usize,
    pub enable_dht: bool,
    pub enable_tracker: bool,
    pub enable_lsd: bool,
    pub dht_bootstrap_nodes: Vec<String>,
    pub dht_query_timeout_secs: u64,
    pub dht_token_lifetime_secs: u64,
    pub dht_max_peers_per_reply: usize,
    pub dht_bucket_size: usize,
    pub tracker_timeout_secs: u64,
    pub tracker_min_interval_secs: u64,
    pub connect_timeout_secs: u64,
    /// Outstanding block requests per peer
    pub pipeline_depth: usize,
    pub block_size: usize,
    pub disk_workers: usize,
    /// Announce rounds without progress before a task fails
    pub retry_budget: u32,
    /// Where tasks are persisted; defaults to `<download_dir>/tasks.json`
    pub task_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 6881,
            max_connections: 50,
            enable_dht: true,
            enable_tracker: true,
            enable_lsd: true,
            dht_bootstrap_nodes: DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
            dht_query_timeout_secs: 5,
            dht_token_lifetime_secs: 600,
            dht_max_peers_per_reply: 32,
            dht_bucket_size: DEFAULT_BUCKET_SIZE,
            tracker_timeout_secs: 15,
            tracker_min_interval_secs: 60,
            connect_timeout_secs: 10,
            pipeline_depth: 5,
            block_size: DEFAULT_BLOCK_SIZE,
            disk_workers: 4,
            retry_budget: 5,
            task_file: None,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config; missing keys keep their defaults
    pub async fn load(path: &Path) -> Result<Self> {
        info!("Loading config from {}", path.display());
        let data = fs::read(path).await.map_err(|e| {
            TorrentError::config_error_with_field(format!("Cannot read {}: {}", path.display(), e), "config")
        })?;
        let config: Self = serde_json::from_slice(&data)?;
        debug!("Loaded config: {:?}", config);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }

    /// Apply command line overrides
    pub fn apply_args(&mut self, args: &CliArgs) {
        if let Some(dir) = &args.output_dir {
            self.download_dir = dir.clone();
        }
        if let Some(port) = args.port {
            self.listen_port = port;
        }
        if let Some(max) = args.max_connections {
            self.max_connections = max;
        }
        if args.no_dht {
            self.enable_dht = false;
        }
        if args.no_tracker {
            self.enable_tracker = false;
        }
        if args.no_lsd {
            self.enable_lsd = false;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "listen_port").into());
        }
        if self.max_connections == 0 {
            return Err(
                TorrentError::config_error_with_field("max_connections must be at least 1", "max_connections").into(),
            );
        }
        if self.block_size == 0 {
            return Err(TorrentError::config_error_with_field("block_size must be at least 1", "block_size").into());
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("download_dir cannot be empty", "download_dir").into());
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn task_file(&self) -> PathBuf {
        self.task_file
            .clone()
            .unwrap_or_else(|| self.download_dir.join("tasks.json"))
    }

    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker_timeout_secs)
    }

    pub fn tracker_min_interval(&self) -> Duration {
        Duration::from_secs(self.tracker_min_interval_secs)
    }

    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            bucket_size: self.dht_bucket_size.max(1),
            query_timeout: Duration::from_secs(self.dht_query_timeout_secs),
            token_lifetime: Duration::from_secs(self.dht_token_lifetime_secs),
            max_peers_per_reply: self.dht_max_peers_per_reply,
            bootstrap_nodes: self.dht_bootstrap_nodes.clone(),
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            pipeline_depth: self.pipeline_depth.max(1),
            ..ConnectionConfig::default()
        }
    }
}
