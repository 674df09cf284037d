//! Wire framing
//!
//! Reads and writes handshakes and length-prefixed messages on any async
//! stream half.

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use super::handshake::{Handshake, HANDSHAKE_LEN};
use super::message::Message;
use crate::error::TorrentError;

/// Bytes of framing around a piece block: id, index, begin
const PIECE_OVERHEAD: usize = 9;

/// Frame reader/writer with a size limit derived from the block size and
/// piece count
#[derive(Debug, Clone, Copy)]
pub struct Wire {
    max_frame: usize,
}

impl Wire {
    /// Frames may carry one block or a bitfield for `pieces_count` pieces
    pub fn new(block_size: usize, pieces_count: usize) -> Self {
        let bitfield = 1 + pieces_count.div_ceil(8);
        Self {
            max_frame: (block_size + PIECE_OVERHEAD + 4).max(bitfield),
        }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    pub async fn read_handshake<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Handshake> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf).await.map_err(|e| {
            TorrentError::protocol_error_with_source("Connection closed during handshake", e.to_string())
        })?;
        Handshake::decode(&buf)
    }

    pub async fn write_handshake<W: AsyncWrite + Unpin>(&self, writer: &mut W, handshake: &Handshake) -> Result<()> {
        writer.write_all(&handshake.encode()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one frame; oversized frames are protocol violations
    pub async fn read_message<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Message> {
        let length = reader.read_u32().await? as usize;
        if length > self.max_frame {
            warn!("Frame of {} bytes exceeds limit {}", length, self.max_frame);
            return Err(TorrentError::protocol_error_with_source(
                "Frame too large",
                format!("{} > {}", length, self.max_frame),
            )
            .into());
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        trace!("Read frame of {} bytes", length);
        Message::decode(&body)
    }

    pub async fn write_message<W: AsyncWrite + Unpin>(&self, writer: &mut W, message: &Message) -> Result<()> {
        writer.write_all(&message.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::BlockRequest;
    use crate::torrent::info::InfoHash;

    #[tokio::test]
    async fn test_messages_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let wire = Wire::new(16 * 1024, 100);

        let hs = Handshake::new(InfoHash([5; 20]), [6; 20]);
        wire.write_handshake(&mut a, &hs).await.unwrap();
        wire.write_message(&mut a, &Message::Interested).await.unwrap();
        wire.write_message(&mut a, &Message::KeepAlive).await.unwrap();
        let req = BlockRequest { index: 2, begin: 0, length: 16384 };
        wire.write_message(&mut a, &Message::Request(req)).await.unwrap();

        assert_eq!(wire.read_handshake(&mut b).await.unwrap(), hs);
        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::Interested);
        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::KeepAlive);
        assert_eq!(wire.read_message(&mut b).await.unwrap(), Message::Request(req));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let wire = Wire::new(16, 8);
        a.write_u32(10_000).await.unwrap();
        let err = wire.read_message(&mut b).await.unwrap_err();
        assert!(TorrentError::find(&err).unwrap().is_protocol_violation());
    }

    #[test]
    fn test_limit_covers_large_bitfields() {
        assert_eq!(Wire::new(16384, 10).max_frame(), 16384 + 13);
        assert_eq!(Wire::new(16, 10_000).max_frame(), 1 + 1250);
    }
}
