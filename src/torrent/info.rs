//! Torrent metadata structures
//!
//! Immutable description of a torrent: info-hash, piece hashes and the
//! ordered file layout.

use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// 20-byte SHA-1 digest identifying a torrent
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Hash of a bencoded info dictionary
    pub fn of(info_dict_bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        InfoHash(hasher.finalize().into())
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| {
            TorrentError::validation_error_with_field(
                format!("Info hash must be 20 bytes, got {}", bytes.len()),
                "info_hash",
            )
        })?;
        Ok(InfoHash(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| TorrentError::parse_error_with_source("Invalid hex info hash", e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

/// A file inside the torrent's contiguous byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path relative to the download directory
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of the first byte of this file within the torrent
    pub offset: u64,
}

/// Parsed, validated metainfo
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    pub name: String,
    /// Primary tracker, if any
    pub announce: Option<String>,
    /// Every tracker, primary first, deduplicated
    pub announce_list: Vec<String>,
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    pub files: Vec<TorrentFile>,
    pub multi_file: bool,
}

impl TorrentMetadata {
    /// Build metadata from already-extracted fields and validate it.
    ///
    /// `files` holds (path, length) pairs in torrent order; offsets are
    /// computed here.
    pub fn new(
        info_hash: InfoHash,
        name: String,
        piece_length: u64,
        pieces: Vec<[u8; 20]>,
        files: Vec<(PathBuf, u64)>,
        multi_file: bool,
    ) -> Result<Self> {
        let mut offset = 0u64;
        let files = files
            .into_iter()
            .map(|(path, length)| {
                let file = TorrentFile { path, length, offset };
                offset += length;
                file
            })
            .collect();

        let metadata = Self {
            info_hash,
            name,
            announce: None,
            announce_list: Vec::new(),
            piece_length,
            pieces,
            files,
            multi_file,
        };
        metadata.validate()?;
        Ok(metadata)
    }

    /// Check the piece table against the file layout
    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(TorrentError::validation_error_with_field("Piece length must be positive", "piece length").into());
        }
        if self.files.is_empty() {
            return Err(TorrentError::validation_error_with_field("Torrent has no files", "files").into());
        }
        let expected = self.total_size().div_ceil(self.piece_length);
        if expected != self.pieces.len() as u64 {
            return Err(TorrentError::validation_error_with_field(
                format!("Expected {} pieces for {} bytes, found {}", expected, self.total_size(), self.pieces.len()),
                "pieces",
            )
            .into());
        }
        Ok(())
    }

    /// Total size of all files
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_hash(&self, index: usize) -> Option<&[u8; 20]> {
        self.pieces.get(index)
    }

    /// Byte range `[start, end)` of a piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_size());
        Some((start, end))
    }

    /// Actual length of a piece; the last one may be short
    pub fn piece_len(&self, index: usize) -> u64 {
        self.piece_range(index).map(|(s, e)| e - s).unwrap_or(0)
    }

    /// Whether `data` hashes to the expected digest of piece `index`
    pub fn verify_piece(&self, index: usize, data: &[u8]) -> bool {
        match self.piece_hash(index) {
            Some(expected) => {
                let digest: [u8; 20] = Sha1::digest(data).into();
                &digest == expected
            }
            None => false,
        }
    }

    /// Size of the files named in `selection`; an empty selection means all
    pub fn selected_size(&self, selection: &[String]) -> u64 {
        if selection.is_empty() {
            return self.total_size();
        }
        self.files
            .iter()
            .filter(|f| selection.iter().any(|s| f.path.to_string_lossy() == s.as_str()))
            .map(|f| f.length)
            .sum()
    }

    /// Fail when a selection entry names no file of this torrent
    pub fn check_selection(&self, selection: &[String]) -> Result<()> {
        let unknown: Vec<&str> = selection
            .iter()
            .filter(|s| !self.files.iter().any(|f| f.path.to_string_lossy() == s.as_str()))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(TorrentError::validation_error_with_field(
                format!("Selected files not in torrent {}: {}", self.name, unknown.join(", ")),
                "description",
            )
            .into());
        }
        Ok(())
    }

    pub fn is_multi_file(&self) -> bool {
        self.multi_file
    }

    /// Split piece hashes out of the concatenated `pieces` string
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::validation_error_with_field(
                format!("Pieces field length must be a multiple of 20, got {}", pieces_bytes.len()),
                "pieces",
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(lengths: &[u64], piece_length: u64, pieces: usize) -> Result<TorrentMetadata> {
        let files = lengths
            .iter()
            .enumerate()
            .map(|(i, l)| (PathBuf::from(format!("dir/file{}.bin", i)), *l))
            .collect();
        TorrentMetadata::new(
            InfoHash([1u8; 20]),
            "dir".to_string(),
            piece_length,
            vec![[0u8; 20]; pieces],
            files,
            lengths.len() > 1,
        )
    }

    #[test]
    fn test_info_hash_hex_round_trip() {
        let hash = InfoHash([0xab; 20]);
        assert_eq!(InfoHash::from_hex(&hash.to_hex()).unwrap(), hash);
        assert!(InfoHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_file_offsets_are_cumulative() {
        let meta = sample(&[500, 524, 1000], 1024, 2).unwrap();
        let offsets: Vec<u64> = meta.files.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 500, 1024]);
        assert_eq!(meta.total_size(), 2024);
        assert!(meta.is_multi_file());
    }

    #[test]
    fn test_last_piece_is_short() {
        let meta = sample(&[2500], 1024, 3).unwrap();
        assert_eq!(meta.piece_len(0), 1024);
        assert_eq!(meta.piece_len(2), 452);
        assert_eq!(meta.piece_range(2), Some((2048, 2500)));
        assert_eq!(meta.piece_range(3), None);
    }

    #[test]
    fn test_piece_count_mismatch_rejected() {
        assert!(sample(&[2500], 1024, 2).is_err());
        assert!(sample(&[2500], 0, 0).is_err());
    }

    #[test]
    fn test_verify_piece() {
        let data = b"hello piece";
        let digest: [u8; 20] = Sha1::digest(data).into();
        let meta = TorrentMetadata::new(
            InfoHash([2u8; 20]),
            "one".to_string(),
            16,
            vec![digest],
            vec![(PathBuf::from("one"), data.len() as u64)],
            false,
        )
        .unwrap();
        assert!(meta.verify_piece(0, data));
        assert!(!meta.verify_piece(0, b"other"));
        assert!(!meta.verify_piece(1, data));
    }

    #[test]
    fn test_selection_must_name_known_files() {
        let meta = sample(&[500, 524], 1024, 1).unwrap();
        assert!(meta.check_selection(&[]).is_ok());
        assert!(meta.check_selection(&["dir/file1.bin".to_string()]).is_ok());
        assert_eq!(meta.selected_size(&["dir/file1.bin".to_string()]), 524);

        let err = meta
            .check_selection(&["dir/file1.bin".to_string(), "file1.bin".to_string()])
            .unwrap_err();
        assert!(matches!(
            TorrentError::find(&err),
            Some(TorrentError::ValidationError { .. })
        ));
        assert!(err.to_string().contains("file1.bin"));
    }

    #[test]
    fn test_parse_piece_hashes() {
        let hashes = TorrentMetadata::parse_piece_hashes(&[7u8; 40]).unwrap();
        assert_eq!(hashes.len(), 2);
        assert!(TorrentMetadata::parse_piece_hashes(&[7u8; 41]).is_err());
    }
}
