//! Error types for the download engine
//!
//! Every subsystem reports failures as a [`TorrentError`] wrapped in an
//! `anyhow::Error`. The variant tells the caller how far a failure should
//! travel: protocol violations only drop the channel they arrived on, storage
//! and task errors fail the owning download task.

use std::fmt;

/// Error type for engine operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Metadata / bencode parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// Peer wire protocol violations (bad handshake, malformed frame)
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Byte storage and piece storage errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// DHT (KRPC) errors
    DHTError {
        message: String,
        node: Option<String>,
        source: Option<String>,
    },

    /// Tracker announce / scrape errors
    TrackerError {
        message: String,
        tracker: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },

    /// Download task lifecycle errors
    TaskError {
        message: String,
        task: Option<String>,
    },
}

impl TorrentError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path
    pub fn storage_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new DHTError
    pub fn dht_error(message: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: None,
            source: None,
        }
    }

    /// Create a new DHTError with node and source
    pub fn dht_error_full(message: impl Into<String>, node: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::DHTError {
            message: message.into(),
            node: Some(node.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError with tracker url
    pub fn tracker_error(message: impl Into<String>, tracker: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: None,
        }
    }

    /// Create a new TrackerError with tracker url and source
    pub fn tracker_error_full(message: impl Into<String>, tracker: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            tracker: Some(tracker.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ValidationError
    pub fn validation_error(message: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new TaskError for a task id
    pub fn task_error(message: impl Into<String>, task: impl Into<String>) -> Self {
        TorrentError::TaskError {
            message: message.into(),
            task: Some(task.into()),
        }
    }

    /// Whether the error only invalidates the channel or response it came from
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TorrentError::ProtocolError { .. }
                | TorrentError::ParseError { .. }
                | TorrentError::ValidationError { .. }
        )
    }

    /// Find the domain error inside an `anyhow::Error`, if any
    pub fn find(err: &anyhow::Error) -> Option<&TorrentError> {
        err.chain().find_map(|cause| cause.downcast_ref::<TorrentError>())
    }

    /// Short label for the variant, used as the message prefix
    pub fn kind(&self) -> &'static str {
        match self {
            TorrentError::ParseError { .. } => "Parse error",
            TorrentError::ProtocolError { .. } => "Protocol error",
            TorrentError::PeerError { .. } => "Peer error",
            TorrentError::StorageError { .. } => "Storage error",
            TorrentError::DHTError { .. } => "DHT error",
            TorrentError::TrackerError { .. } => "Tracker error",
            TorrentError::ConfigError { .. } => "Config error",
            TorrentError::NetworkError { .. } => "Network error",
            TorrentError::ValidationError { .. } => "Validation error",
            TorrentError::TaskError { .. } => "Task error",
        }
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (message, subject, source) = match self {
            TorrentError::ParseError { message, source } | TorrentError::ProtocolError { message, source } => {
                (message, None, source)
            }
            TorrentError::PeerError { message, peer, source } => (message, Some(("peer", peer)), source),
            TorrentError::StorageError { message, path, source } => (message, Some(("path", path)), source),
            TorrentError::DHTError { message, node, source } => (message, Some(("node", node)), source),
            TorrentError::TrackerError { message, tracker, source } => {
                (message, Some(("tracker", tracker)), source)
            }
            TorrentError::NetworkError { message, address, source } => {
                (message, Some(("address", address)), source)
            }
            TorrentError::ConfigError { message, field } | TorrentError::ValidationError { message, field } => {
                (message, Some(("field", field)), &None)
            }
            TorrentError::TaskError { message, task } => (message, Some(("task", task)), &None),
        };

        write!(f, "{}: {}", self.kind(), message)?;
        let mut details = Vec::with_capacity(2);
        if let Some((label, Some(value))) = subject {
            details.push(format!("{}: {}", label, value));
        }
        if let Some(src) = source {
            details.push(format!("source: {}", src));
        }
        if !details.is_empty() {
            write!(f, " ({})", details.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to parse bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::parse_error_with_source("Invalid JSON", err.to_string())
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}
