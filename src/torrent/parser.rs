//! Torrent file parser
//!
//! Turns a bencoded `.torrent` into validated [`TorrentMetadata`].

use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use tracing::{debug, error, info, trace};

use crate::bencode::{self, as_bytes, as_dict, as_list, Dict, DictExt, Value};
use crate::error::TorrentError;
use crate::torrent::info::{InfoHash, TorrentMetadata};

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentMetadata> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode_dict(data)?;
        Self::convert(&root)
    }

    /// Parse a .torrent file from a file path
    pub async fn parse_file(path: &Path) -> Result<TorrentMetadata> {
        info!("Loading torrent file from: {}", path.display());

        let data = tokio::fs::read(path).await.map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn convert(root: &Dict) -> Result<TorrentMetadata> {
        let info_value = root
            .value("info")
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;
        let info_dict = as_dict(info_value).ok_or_else(|| TorrentError::parse_error("info is not a dictionary"))?;

        let info_hash = InfoHash::of(&bencode::encode(info_value)?);
        debug!("Computed info hash {}", info_hash);

        let name = info_dict
            .string("name")
            .ok_or_else(|| TorrentError::parse_error("Missing name field"))?;
        let name = sanitize_component(&name)?;

        let piece_length = info_dict.require_int("piece length")?;
        if piece_length <= 0 {
            return Err(TorrentError::validation_error_with_field("Piece length must be positive", "piece length").into());
        }

        let pieces = TorrentMetadata::parse_piece_hashes(info_dict.require_bytes("pieces")?)?;

        let (files, multi_file) = if let Some(length) = info_dict.int("length") {
            if length < 0 {
                return Err(TorrentError::validation_error_with_field("Negative file length", "length").into());
            }
            (vec![(PathBuf::from(&name), length as u64)], false)
        } else if let Some(list) = info_dict.list("files") {
            (Self::parse_files(&name, list)?, true)
        } else {
            return Err(TorrentError::parse_error("Neither length nor files found in info dict").into());
        };

        let mut metadata =
            TorrentMetadata::new(info_hash, name, piece_length as u64, pieces, files, multi_file)?;

        metadata.announce = root.string("announce");
        let mut announce_list: Vec<String> = metadata.announce.iter().cloned().collect();
        for tier in root.list("announce-list").unwrap_or(&[]) {
            for url in as_list(tier).unwrap_or(&[]) {
                if let Some(bytes) = as_bytes(url) {
                    let url = String::from_utf8_lossy(bytes).into_owned();
                    if !announce_list.contains(&url) {
                        announce_list.push(url);
                    }
                }
            }
        }
        metadata.announce_list = announce_list;

        info!(
            "Parsed torrent '{}': {} files, {} pieces of {} bytes",
            metadata.name,
            metadata.files.len(),
            metadata.piece_count(),
            metadata.piece_length
        );
        Ok(metadata)
    }

    fn parse_files(name: &str, list: &[Value]) -> Result<Vec<(PathBuf, u64)>> {
        let mut files = Vec::with_capacity(list.len());
        for entry in list {
            let file_dict = as_dict(entry).ok_or_else(|| TorrentError::parse_error("File entry is not a dictionary"))?;
            let length = file_dict.require_int("length")?;
            if length < 0 {
                return Err(TorrentError::validation_error_with_field("Negative file length", "length").into());
            }

            let components = file_dict
                .list("path")
                .ok_or_else(|| TorrentError::parse_error("Missing file path"))?;
            let mut path = PathBuf::from(name);
            for component in components {
                let part = as_bytes(component).ok_or_else(|| TorrentError::parse_error("Path component is not a string"))?;
                path.push(sanitize_component(&String::from_utf8_lossy(part))?);
            }
            files.push((path, length as u64));
        }
        Ok(files)
    }
}

/// Reject path components that would escape the download directory
fn sanitize_component(part: &str) -> Result<String> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(part.to_string()),
        _ => Err(TorrentError::validation_error_with_field(format!("Unsafe path component '{}'", part), "path").into()),
    }
}

impl TorrentMetadata {
    /// Parse and validate a bencoded `.torrent`
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        TorrentParser::parse_bytes(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::bencode::DictBuilder;
    use sha1::{Digest, Sha1};

    /// Bencoded torrent with one file per entry of `files`, hashed from `data`
    pub(crate) fn build_torrent(name: &str, piece_length: usize, files: &[(&str, usize)], data: &[u8]) -> Vec<u8> {
        let pieces: Vec<u8> = data
            .chunks(piece_length)
            .flat_map(|chunk| <[u8; 20]>::from(Sha1::digest(chunk)))
            .collect();
        let mut info = DictBuilder::new()
            .bytes("name", name.as_bytes().to_vec())
            .int("piece length", piece_length as i64)
            .bytes("pieces", pieces);
        if files.len() == 1 && files[0].0 == name {
            info = info.int("length", files[0].1 as i64);
        } else {
            let list = files
                .iter()
                .map(|(path, len)| {
                    DictBuilder::new()
                        .int("length", *len as i64)
                        .value(
                            "path",
                            Value::List(path.split('/').map(|p| Value::Bytes(p.as_bytes().to_vec())).collect()),
                        )
                        .build()
                })
                .collect();
            info = info.value("files", Value::List(list));
        }
        let root = DictBuilder::new()
            .bytes("announce", b"http://tracker.example.com/announce".to_vec())
            .value(
                "announce-list",
                Value::List(vec![Value::List(vec![
                    Value::Bytes(b"http://tracker.example.com/announce".to_vec()),
                    Value::Bytes(b"udp://tracker.example.org:6969".to_vec()),
                ])]),
            )
            .value("info", info.build())
            .build();
        bencode::encode(&root).unwrap()
    }

    #[test]
    fn test_parse_single_file() {
        let data = vec![9u8; 3000];
        let bytes = build_torrent("movie.bin", 1024, &[("movie.bin", 3000)], &data);
        let meta = TorrentMetadata::from_bytes(&bytes).unwrap();

        assert_eq!(meta.name, "movie.bin");
        assert!(!meta.is_multi_file());
        assert_eq!(meta.piece_count(), 3);
        assert_eq!(meta.total_size(), 3000);
        assert_eq!(meta.files[0].path, PathBuf::from("movie.bin"));
        assert_eq!(meta.announce.as_deref(), Some("http://tracker.example.com/announce"));
        assert_eq!(meta.announce_list.len(), 2);
        assert!(meta.verify_piece(2, &data[2048..]));
    }

    #[test]
    fn test_parse_multi_file() {
        let data = vec![1u8; 1500];
        let bytes = build_torrent("album", 512, &[("cd1/a.flac", 1000), ("b.flac", 500)], &data);
        let meta = TorrentMetadata::from_bytes(&bytes).unwrap();

        assert!(meta.is_multi_file());
        assert_eq!(meta.files[0].path, PathBuf::from("album/cd1/a.flac"));
        assert_eq!(meta.files[1].offset, 1000);
    }

    #[test]
    fn test_info_hash_is_sha1_of_info_dict() {
        let data = vec![3u8; 100];
        let bytes = build_torrent("x", 64, &[("x", 100)], &data);
        let meta = TorrentMetadata::from_bytes(&bytes).unwrap();

        let root = bencode::decode_dict(&bytes).unwrap();
        let info = bencode::encode(root.value("info").unwrap()).unwrap();
        assert_eq!(meta.info_hash, InfoHash::of(&info));
    }

    #[test]
    fn test_reject_path_traversal() {
        let data = vec![0u8; 10];
        let bytes = build_torrent("evil", 16, &[("../etc/passwd", 10)], &data);
        assert!(TorrentMetadata::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_reject_missing_info() {
        assert!(TorrentMetadata::from_bytes(b"d8:announce3:urle").is_err());
        assert!(TorrentMetadata::from_bytes(b"not bencode").is_err());
    }
}
