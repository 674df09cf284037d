//! Piece assembly
//!
//! Buffers the blocks of one piece while they arrive from a peer.

use std::time::{Duration, Instant};

use anyhow::Result;

use crate::error::TorrentError;
use crate::protocol::message::BlockRequest;

/// Default size of one requested block
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

#[derive(Debug)]
pub struct PieceAssembly {
    index: usize,
    length: usize,
    block_size: usize,
    data: Vec<u8>,
    received: Vec<bool>,
    requested: Vec<bool>,
    started_at: Instant,
}

impl PieceAssembly {
    pub fn new(index: usize, length: usize, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        let blocks = length.div_ceil(block_size);
        Self {
            index,
            length,
            block_size,
            data: vec![0u8; length],
            received: vec![false; blocks],
            requested: vec![false; blocks],
            started_at: Instant::now(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn block_count(&self) -> usize {
        self.received.len()
    }

    fn block_len(&self, block: usize) -> usize {
        let begin = block * self.block_size;
        self.block_size.min(self.length - begin)
    }

    /// Next block nobody asked for yet; marks it requested
    pub fn next_request(&mut self) -> Option<BlockRequest> {
        let block = (0..self.block_count()).find(|&b| !self.requested[b] && !self.received[b])?;
        self.requested[block] = true;
        Some(BlockRequest {
            index: self.index as u32,
            begin: (block * self.block_size) as u32,
            length: self.block_len(block) as u32,
        })
    }

    /// Requested but not yet received
    pub fn outstanding(&self) -> usize {
        self.requested
            .iter()
            .zip(&self.received)
            .filter(|(req, got)| **req && !**got)
            .count()
    }

    /// Store one block. Returns false for a duplicate block.
    pub fn add_block(&mut self, begin: u32, block: &[u8]) -> Result<bool> {
        let begin = begin as usize;
        if begin % self.block_size != 0 || begin >= self.length {
            return Err(TorrentError::protocol_error_with_source(
                "Block offset out of range",
                format!("piece {} offset {}", self.index, begin),
            )
            .into());
        }
        let slot = begin / self.block_size;
        if block.len() != self.block_len(slot) {
            return Err(TorrentError::protocol_error_with_source(
                "Unexpected block length",
                format!("piece {} offset {} length {}", self.index, begin, block.len()),
            )
            .into());
        }
        if self.received[slot] {
            return Ok(false);
        }
        self.data[begin..begin + block.len()].copy_from_slice(block);
        self.received[slot] = true;
        self.requested[slot] = true;
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|&got| got)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_cover_piece_with_short_tail() {
        let mut piece = PieceAssembly::new(3, 40, 16);
        let requests: Vec<BlockRequest> = std::iter::from_fn(|| piece.next_request()).collect();
        assert_eq!(
            requests,
            vec![
                BlockRequest { index: 3, begin: 0, length: 16 },
                BlockRequest { index: 3, begin: 16, length: 16 },
                BlockRequest { index: 3, begin: 32, length: 8 },
            ]
        );
        assert_eq!(piece.outstanding(), 3);
    }

    #[test]
    fn test_assembles_in_any_order() {
        let mut piece = PieceAssembly::new(0, 40, 16);
        assert!(piece.add_block(32, &[3u8; 8]).unwrap());
        assert!(piece.add_block(0, &[1u8; 16]).unwrap());
        assert!(!piece.is_complete());
        assert!(!piece.add_block(0, &[9u8; 16]).unwrap());
        assert!(piece.add_block(16, &[2u8; 16]).unwrap());
        assert!(piece.is_complete());

        let data = piece.into_data();
        assert_eq!(&data[..16], &[1u8; 16]);
        assert_eq!(&data[16..32], &[2u8; 16]);
        assert_eq!(&data[32..], &[3u8; 8]);
    }

    #[test]
    fn test_rejects_misaligned_and_wrong_length() {
        let mut piece = PieceAssembly::new(0, 40, 16);
        assert!(piece.add_block(5, &[0u8; 16]).is_err());
        assert!(piece.add_block(48, &[0u8; 16]).is_err());
        assert!(piece.add_block(32, &[0u8; 16]).is_err());
    }
}
