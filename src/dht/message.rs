//! KRPC messages
//!
//! Bencoded dictionaries exchanged over UDP: `t` transaction id, `y` kind
//! (`q`, `r`, `e`), then `q`+`a` for queries, `r` for responses, `e` for
//! errors. Encoding and decoding are written out per message.

use std::net::SocketAddr;

use anyhow::Result;
use tracing::trace;

use crate::bencode::{self, as_bytes, as_int, DictBuilder, DictExt, Value};
use crate::dht::node::{decode_compact_nodes, decode_compact_peer, encode_compact_peer, NodeId, COMPACT_NODE_LEN};
use crate::error::TorrentError;
use crate::torrent::info::InfoHash;

/// KRPC error codes
pub mod error_code {
    pub const GENERIC: i64 = 201;
    pub const SERVER: i64 = 202;
    pub const PROTOCOL: i64 = 203;
    pub const METHOD_UNKNOWN: i64 = 204;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: InfoHash,
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
    /// Method we do not implement; answered with 204
    Unknown {
        id: NodeId,
        method: String,
    },
}

impl Query {
    pub fn method(&self) -> &str {
        match self {
            Query::Ping { .. } => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
            Query::Unknown { method, .. } => method,
        }
    }

    /// Id of the querying node
    pub fn sender(&self) -> NodeId {
        match self {
            Query::Ping { id }
            | Query::FindNode { id, .. }
            | Query::GetPeers { id, .. }
            | Query::AnnouncePeer { id, .. }
            | Query::Unknown { id, .. } => *id,
        }
    }
}

/// Response arguments; which fields are set depends on the query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: NodeId,
    pub nodes: Vec<(NodeId, SocketAddr)>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

impl Response {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            nodes: Vec::new(),
            values: Vec::new(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcError {
    pub code: i64,
    pub message: String,
}

impl KrpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrpcBody {
    Query(Query),
    Response(Response),
    Error(KrpcError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KrpcMessage {
    pub transaction_id: Vec<u8>,
    pub body: KrpcBody,
}

fn protocol_error(message: impl Into<String>) -> anyhow::Error {
    TorrentError::protocol_error(message).into()
}

fn node_id(dict: &bencode::Dict, key: &str) -> Result<NodeId> {
    let bytes = dict
        .bytes(key)
        .ok_or_else(|| protocol_error(format!("Missing '{}'", key)))?;
    NodeId::from_slice(bytes)
}

impl KrpcMessage {
    pub fn query(transaction_id: Vec<u8>, query: Query) -> Self {
        Self {
            transaction_id,
            body: KrpcBody::Query(query),
        }
    }

    pub fn response(transaction_id: Vec<u8>, response: Response) -> Self {
        Self {
            transaction_id,
            body: KrpcBody::Response(response),
        }
    }

    pub fn error(transaction_id: Vec<u8>, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            body: KrpcBody::Error(KrpcError::new(code, message)),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let builder = DictBuilder::new().bytes("t", self.transaction_id.clone());
        let builder = match &self.body {
            KrpcBody::Query(query) => {
                let args = match query {
                    Query::Ping { id } | Query::Unknown { id, .. } => DictBuilder::new().bytes("id", id.0.to_vec()),
                    Query::FindNode { id, target } => DictBuilder::new()
                        .bytes("id", id.0.to_vec())
                        .bytes("target", target.0.to_vec()),
                    Query::GetPeers { id, info_hash } => DictBuilder::new()
                        .bytes("id", id.0.to_vec())
                        .bytes("info_hash", info_hash.0.to_vec()),
                    Query::AnnouncePeer {
                        id,
                        info_hash,
                        port,
                        token,
                        implied_port,
                    } => DictBuilder::new()
                        .bytes("id", id.0.to_vec())
                        .bytes("info_hash", info_hash.0.to_vec())
                        .int("port", *port as i64)
                        .bytes("token", token.clone())
                        .int("implied_port", *implied_port as i64),
                };
                builder
                    .bytes("y", b"q".to_vec())
                    .bytes("q", query.method().as_bytes().to_vec())
                    .value("a", args.build())
            }
            KrpcBody::Response(response) => {
                let mut r = DictBuilder::new().bytes("id", response.id.0.to_vec());
                if !response.nodes.is_empty() {
                    let mut blob = Vec::with_capacity(response.nodes.len() * COMPACT_NODE_LEN);
                    for (id, addr) in &response.nodes {
                        let mut entry = id.0.to_vec();
                        if encode_compact_peer(addr, &mut entry) {
                            blob.extend_from_slice(&entry);
                        }
                    }
                    r = r.bytes("nodes", blob);
                }
                if !response.values.is_empty() {
                    let values = response
                        .values
                        .iter()
                        .filter_map(|addr| {
                            let mut out = Vec::with_capacity(6);
                            encode_compact_peer(addr, &mut out).then_some(Value::Bytes(out))
                        })
                        .collect();
                    r = r.value("values", Value::List(values));
                }
                r = r.opt_bytes("token", response.token.clone());
                builder.bytes("y", b"r".to_vec()).value("r", r.build())
            }
            KrpcBody::Error(error) => builder.bytes("y", b"e".to_vec()).value(
                "e",
                Value::List(vec![
                    Value::Int(error.code),
                    Value::Bytes(error.message.as_bytes().to_vec()),
                ]),
            ),
        };
        bencode::encode(&builder.build())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let dict = bencode::decode_dict(data)
            .map_err(|e| TorrentError::protocol_error_with_source("Malformed KRPC datagram", e.to_string()))?;
        let transaction_id = dict
            .bytes("t")
            .ok_or_else(|| protocol_error("Missing transaction id"))?
            .to_vec();
        let kind = dict.bytes("y").ok_or_else(|| protocol_error("Missing message kind"))?;
        trace!("KRPC '{}' message, tid {}", String::from_utf8_lossy(kind), hex::encode(&transaction_id));

        let body = match kind {
            b"q" => KrpcBody::Query(Self::decode_query(&dict)?),
            b"r" => KrpcBody::Response(Self::decode_response(&dict)?),
            b"e" => {
                let list = dict.list("e").ok_or_else(|| protocol_error("Missing error list"))?;
                let code = list.first().and_then(as_int).unwrap_or(error_code::GENERIC);
                let message = list
                    .get(1)
                    .and_then(as_bytes)
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                KrpcBody::Error(KrpcError { code, message })
            }
            other => {
                return Err(protocol_error(format!(
                    "Unknown message kind '{}'",
                    String::from_utf8_lossy(other)
                )))
            }
        };
        Ok(Self { transaction_id, body })
    }

    fn decode_query(dict: &bencode::Dict) -> Result<Query> {
        let method = dict.string("q").ok_or_else(|| protocol_error("Missing query method"))?;
        let args = dict.dict("a").ok_or_else(|| protocol_error("Missing query arguments"))?;
        let id = node_id(args, "id")?;

        let query = match method.as_str() {
            "ping" => Query::Ping { id },
            "find_node" => Query::FindNode {
                id,
                target: node_id(args, "target")?,
            },
            "get_peers" => Query::GetPeers {
                id,
                info_hash: InfoHash::from_slice(args.require_bytes("info_hash")?)?,
            },
            "announce_peer" => {
                let port = args.int("port").unwrap_or(0);
                let implied_port = args.int("implied_port").unwrap_or(0) != 0;
                if !implied_port && !(1..=u16::MAX as i64).contains(&port) {
                    return Err(protocol_error(format!("Invalid announce port {}", port)));
                }
                Query::AnnouncePeer {
                    id,
                    info_hash: InfoHash::from_slice(args.require_bytes("info_hash")?)?,
                    port: port.clamp(0, u16::MAX as i64) as u16,
                    token: args.require_bytes("token")?.to_vec(),
                    implied_port,
                }
            }
            _ => Query::Unknown { id, method },
        };
        Ok(query)
    }

    fn decode_response(dict: &bencode::Dict) -> Result<Response> {
        let r = dict.dict("r").ok_or_else(|| protocol_error("Missing response arguments"))?;
        let mut response = Response::new(node_id(r, "id")?);
        if let Some(blob) = r.bytes("nodes") {
            response.nodes = decode_compact_nodes(blob)?;
        }
        if let Some(values) = r.list("values") {
            response.values = values
                .iter()
                .filter_map(as_bytes)
                .filter_map(decode_compact_peer)
                .collect();
        }
        response.token = r.bytes("token").map(|t| t.to_vec());
        Ok(response)
    }
}

/// Best-effort transaction id of a datagram that failed to decode
pub fn peek_transaction_id(data: &[u8]) -> Option<Vec<u8>> {
    let dict = bencode::decode_dict(data).ok()?;
    dict.bytes("t").map(|t| t.to_vec())
}
