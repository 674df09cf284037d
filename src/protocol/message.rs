//! Peer-wire messages
//!
//! Each frame is a 4-byte big-endian length, a 1-byte id and a payload.
//! Unknown ids decode to [`Message::Unknown`] so callers can skip them.

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::error::TorrentError;

/// BitTorrent message IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageId {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => MessageId::Choke,
            1 => MessageId::Unchoke,
            2 => MessageId::Interested,
            3 => MessageId::NotInterested,
            4 => MessageId::Have,
            5 => MessageId::Bitfield,
            6 => MessageId::Request,
            7 => MessageId::Piece,
            8 => MessageId::Cancel,
            9 => MessageId::Port,
            _ => return None,
        })
    }
}

/// A block request, also used to identify a cancel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

fn expect_len(id: MessageId, actual: usize, len: usize) -> Result<()> {
    if actual != len {
        return Err(TorrentError::protocol_error_with_source(
            format!("Bad payload length for {:?}", id),
            format!("expected {}, got {}", len, actual),
        )
        .into());
    }
    Ok(())
}

/// BitTorrent protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield { bitfield: Vec<u8> },
    Request(BlockRequest),
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel(BlockRequest),
    Port { listen_port: u16 },
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    pub fn message_id(&self) -> Option<u8> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield { .. } => MessageId::Bitfield,
            Message::Request(_) => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel(_) => MessageId::Cancel,
            Message::Port { .. } => MessageId::Port,
            Message::Unknown { id, .. } => return Some(*id),
        };
        Some(id as u8)
    }

    /// Encoded frame, length prefix included
    pub fn encode(&self) -> Vec<u8> {
        let mut body = BytesMut::new();
        if let Some(id) = self.message_id() {
            body.put_u8(id);
        }
        match self {
            Message::Have { piece_index } => body.put_u32(*piece_index),
            Message::Bitfield { bitfield } => body.put_slice(bitfield),
            Message::Request(req) | Message::Cancel(req) => {
                body.put_u32(req.index);
                body.put_u32(req.begin);
                body.put_u32(req.length);
            }
            Message::Piece { index, begin, block } => {
                body.put_u32(*index);
                body.put_u32(*begin);
                body.put_slice(block);
            }
            Message::Port { listen_port } => body.put_u16(*listen_port),
            Message::Unknown { payload, .. } => body.put_slice(payload),
            _ => {}
        }

        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        frame.to_vec()
    }

    /// Decode a frame body (everything after the length prefix)
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let raw_id = body[0];
        let mut payload = &body[1..];
        trace!("Decoding message id {} with {} payload bytes", raw_id, payload.len());

        let Some(id) = MessageId::from_u8(raw_id) else {
            return Ok(Message::Unknown {
                id: raw_id,
                payload: payload.to_vec(),
            });
        };

        let message = match id {
            MessageId::Choke => {
                expect_len(id, payload.len(), 0)?;
                Message::Choke
            }
            MessageId::Unchoke => {
                expect_len(id, payload.len(), 0)?;
                Message::Unchoke
            }
            MessageId::Interested => {
                expect_len(id, payload.len(), 0)?;
                Message::Interested
            }
            MessageId::NotInterested => {
                expect_len(id, payload.len(), 0)?;
                Message::NotInterested
            }
            MessageId::Have => {
                expect_len(id, payload.len(), 4)?;
                Message::Have {
                    piece_index: payload.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield {
                bitfield: payload.to_vec(),
            },
            MessageId::Request | MessageId::Cancel => {
                expect_len(id, payload.len(), 12)?;
                let req = BlockRequest {
                    index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                };
                if id == MessageId::Request {
                    Message::Request(req)
                } else {
                    Message::Cancel(req)
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(TorrentError::protocol_error("Piece message shorter than its header").into());
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: payload.to_vec(),
                }
            }
            MessageId::Port => {
                expect_len(id, payload.len(), 2)?;
                Message::Port {
                    listen_port: payload.get_u16(),
                }
            }
        };
        Ok(message)
    }
}
