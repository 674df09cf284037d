//! Peer-wire handshake
//!
//! Fixed 68-byte frame: `19 | "BitTorrent protocol" | 8 reserved | info-hash | peer id`.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::torrent::info::InfoHash;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Size of an encoded handshake
pub const HANDSHAKE_LEN: usize = 68;

/// Client prefix of generated peer ids
const PEER_ID_PREFIX: &[u8; 8] = b"-BE0100-";

/// Reserved-byte flag advertising DHT support (BEP 5)
const RESERVED_DHT: u8 = 0x01;

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Handshake advertising DHT support
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[7] |= RESERVED_DHT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Random peer id with the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated peer ID: {}", String::from_utf8_lossy(&peer_id[..8]));
        peer_id
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & RESERVED_DHT != 0
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(&self.peer_id);

        let mut out = [0u8; HANDSHAKE_LEN];
        out.copy_from_slice(&buf);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        trace!("Decoding handshake from {} bytes", data.len());
        if data.len() != HANDSHAKE_LEN {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid handshake length",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )
            .into());
        }
        if data[0] != PROTOCOL_LENGTH {
            warn!("Invalid protocol length: {}", data[0]);
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, data[0]),
            )
            .into());
        }
        if &data[1..20] != PROTOCOL_STRING {
            warn!("Invalid protocol string in handshake");
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let info_hash = InfoHash::from_slice(&data[28..48])?;
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        debug!("Handshake for {} (reserved {})", info_hash, hex::encode(reserved));
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Fail when the remote side talks about another torrent
    pub fn expect_info_hash(&self, expected: &InfoHash) -> Result<()> {
        if &self.info_hash != expected {
            return Err(TorrentError::protocol_error_with_source(
                "Info hash mismatch",
                format!("expected {}, got {}", expected, self.info_hash),
            )
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let hs = Handshake::new(InfoHash([0xaa; 20]), [0xbb; 20]);
        let bytes = hs.encode();
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(bytes[27], 0x01);
        assert_eq!(&bytes[28..48], &[0xaa; 20]);
        assert_eq!(&bytes[48..68], &[0xbb; 20]);
        assert_eq!(Handshake::decode(&bytes).unwrap(), hs);
    }

    #[test]
    fn test_reject_malformed() {
        let mut bytes = Handshake::new(InfoHash([1; 20]), [2; 20]).encode();
        assert!(Handshake::decode(&bytes[..67]).is_err());
        bytes[0] = 18;
        assert!(Handshake::decode(&bytes).is_err());
        bytes[0] = 19;
        bytes[5] = b'X';
        let err = Handshake::decode(&bytes).unwrap_err();
        assert!(TorrentError::find(&err).unwrap().is_protocol_violation());
    }

    #[test]
    fn test_info_hash_mismatch() {
        let hs = Handshake::new(InfoHash([1; 20]), [2; 20]);
        assert!(hs.expect_info_hash(&InfoHash([1; 20])).is_ok());
        assert!(hs.expect_info_hash(&InfoHash([3; 20])).is_err());
    }

    #[test]
    fn test_generate_peer_id() {
        let a = Handshake::generate_peer_id();
        let b = Handshake::generate_peer_id();
        assert_eq!(&a[..8], b"-BE0100-");
        assert_ne!(a, b);
        assert!(Handshake::new(InfoHash([0; 20]), a).supports_dht());
    }
}
