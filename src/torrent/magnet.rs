//! Magnet link parser
//!
//! Extracts the info-hash, display name and trackers from `magnet:?` URIs.
//! Hashes may be 40 hex characters or 32 base32 characters.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TorrentError;
use crate::torrent::info::InfoHash;

const BTIH_PREFIX: &str = "urn:btih:";

/// Parsed magnet link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    /// `dn` parameter
    pub display_name: Option<String>,
    /// `tr` parameters, in order
    pub trackers: Vec<String>,
    /// `xl` parameter
    pub total_size: Option<u64>,
}

impl MagnetLink {
    /// Parse a magnet URI
    pub fn parse(uri: &str) -> Result<Self> {
        info!("Parsing magnet link: {}", uri);

        let url = Url::parse(uri.trim()).map_err(|e| {
            warn!("Invalid magnet URL format: {}", e);
            TorrentError::parse_error_with_source("Invalid magnet URL", e.to_string())
        })?;
        if url.scheme() != "magnet" {
            return Err(TorrentError::validation_error_with_field(
                format!("Expected magnet scheme, got '{}'", url.scheme()),
                "scheme",
            )
            .into());
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut total_size = None;

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = Self::decode_topic(&value)? {
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "xl" => match value.parse::<u64>() {
                    Ok(size) => total_size = Some(size),
                    Err(_) => warn!("Ignoring invalid xl value: {}", value),
                },
                other => debug!("Ignoring magnet parameter: {}", other),
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            TorrentError::validation_error_with_field("Magnet link has no urn:btih topic", "xt")
        })?;

        debug!(
            "Magnet {} name={:?} trackers={}",
            info_hash,
            display_name,
            trackers.len()
        );
        Ok(Self {
            info_hash,
            display_name,
            trackers,
            total_size,
        })
    }

    /// Decode an `xt` value; topics other than `urn:btih` yield `None`
    fn decode_topic(xt: &str) -> Result<Option<InfoHash>> {
        let Some(encoded) = xt.strip_prefix(BTIH_PREFIX) else {
            debug!("Skipping non-BitTorrent topic: {}", xt);
            return Ok(None);
        };

        let bytes = match encoded.len() {
            40 => hex::decode(encoded)
                .map_err(|e| TorrentError::parse_error_with_source("Invalid hex info hash", e.to_string()))?,
            32 => base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &encoded.to_ascii_uppercase())
                .ok_or_else(|| TorrentError::parse_error("Invalid base32 info hash"))?,
            n => {
                return Err(TorrentError::validation_error_with_field(
                    format!("Info hash has {} characters, expected 40 (hex) or 32 (base32)", n),
                    "xt",
                )
                .into())
            }
        };
        InfoHash::from_slice(&bytes).map(Some)
    }

    /// Where a `.torrent` for this link is looked up
    pub fn cached_torrent_path(&self, download_dir: &Path) -> PathBuf {
        download_dir.join(format!("{}.torrent", self.info_hash.to_hex()))
    }

    /// Name to show before metadata is known
    pub fn name(&self) -> String {
        self.display_name.clone().unwrap_or_else(|| self.info_hash.to_hex())
    }
}

/// Whether `input` looks like a magnet URI
pub fn is_magnet_link(input: &str) -> bool {
    let trimmed = input.trim();
    trimmed.starts_with("magnet:?") || trimmed.starts_with("magnet://")
}
