//! Bencode value helpers
//!
//! Wire structures (KRPC, tracker replies, metainfo) are decoded into
//! `serde_bencode::value::Value` and walked by explicit per-message code.

use std::collections::HashMap;

use anyhow::Result;
use tracing::trace;

use crate::error::TorrentError;

pub use serde_bencode::value::Value;

/// A decoded bencode dictionary
pub type Dict = HashMap<Vec<u8>, Value>;

/// Decode a complete bencoded buffer
pub fn decode(data: &[u8]) -> Result<Value> {
    trace!("Decoding {} bencoded bytes", data.len());
    let value: Value = serde_bencode::from_bytes(data).map_err(TorrentError::from)?;
    Ok(value)
}

/// Decode a buffer that must hold a dictionary at its root
pub fn decode_dict(data: &[u8]) -> Result<Dict> {
    match decode(data)? {
        Value::Dict(dict) => Ok(dict),
        _ => Err(TorrentError::parse_error("Root value is not a dictionary").into()),
    }
}

/// Encode a value; dictionary keys come out sorted
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let bytes = serde_bencode::to_bytes(value).map_err(TorrentError::from)?;
    Ok(bytes)
}

pub fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        _ => None,
    }
}

pub fn as_bytes(value: &Value) -> Option<&[u8]> {
    match value {
        Value::Bytes(b) => Some(b.as_slice()),
        _ => None,
    }
}

pub fn as_str(value: &Value) -> Option<String> {
    as_bytes(value).map(|b| String::from_utf8_lossy(b).into_owned())
}

pub fn as_list(value: &Value) -> Option<&[Value]> {
    match value {
        Value::List(l) => Some(l.as_slice()),
        _ => None,
    }
}

pub fn as_dict(value: &Value) -> Option<&Dict> {
    match value {
        Value::Dict(d) => Some(d),
        _ => None,
    }
}

/// Typed lookups on a decoded dictionary
pub trait DictExt {
    fn value(&self, key: &str) -> Option<&Value>;

    fn int(&self, key: &str) -> Option<i64> {
        self.value(key).and_then(as_int)
    }

    fn bytes(&self, key: &str) -> Option<&[u8]> {
        self.value(key).and_then(as_bytes)
    }

    fn string(&self, key: &str) -> Option<String> {
        self.value(key).and_then(as_str)
    }

    fn list(&self, key: &str) -> Option<&[Value]> {
        self.value(key).and_then(as_list)
    }

    fn dict(&self, key: &str) -> Option<&Dict> {
        self.value(key).and_then(as_dict)
    }

    /// Integer that must be present
    fn require_int(&self, key: &str) -> Result<i64> {
        self.int(key)
            .ok_or_else(|| TorrentError::validation_error_with_field("Missing integer key", key).into())
    }

    /// Byte string that must be present
    fn require_bytes(&self, key: &str) -> Result<&[u8]> {
        self.bytes(key)
            .ok_or_else(|| TorrentError::validation_error_with_field("Missing byte string key", key).into())
    }

    /// Dictionary that must be present
    fn require_dict(&self, key: &str) -> Result<&Dict> {
        self.dict(key)
            .ok_or_else(|| TorrentError::validation_error_with_field("Missing dictionary key", key).into())
    }
}

impl DictExt for Dict {
    fn value(&self, key: &str) -> Option<&Value> {
        self.get(key.as_bytes())
    }
}

/// Builder for outgoing dictionaries
#[derive(Debug, Default)]
pub struct DictBuilder {
    dict: Dict,
}

impl DictBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.dict.insert(key.as_bytes().to_vec(), Value::Bytes(value.into()));
        self
    }

    pub fn int(mut self, key: &str, value: i64) -> Self {
        self.dict.insert(key.as_bytes().to_vec(), Value::Int(value));
        self
    }

    pub fn value(mut self, key: &str, value: Value) -> Self {
        self.dict.insert(key.as_bytes().to_vec(), value);
        self
    }

    /// Insert only when `value` is `Some`
    pub fn opt_bytes(self, key: &str, value: Option<impl Into<Vec<u8>>>) -> Self {
        match value {
            Some(v) => self.bytes(key, v),
            None => self,
        }
    }

    pub fn build(self) -> Value {
        Value::Dict(self.dict)
    }

    pub fn into_dict(self) -> Dict {
        self.dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_dict_lookup() {
        let dict = decode_dict(b"d3:bar4:spam3:fooi42e4:listl1:a1:bee").unwrap();
        assert_eq!(dict.int("foo"), Some(42));
        assert_eq!(dict.bytes("bar"), Some(&b"spam"[..]));
        assert_eq!(dict.string("bar").as_deref(), Some("spam"));
        assert_eq!(dict.list("list").map(|l| l.len()), Some(2));
        assert!(dict.int("missing").is_none());
    }

    #[test]
    fn test_require_missing_is_validation_error() {
        let dict = decode_dict(b"d3:fooi1ee").unwrap();
        let err = dict.require_int("interval").unwrap_err();
        let domain = TorrentError::find(&err).unwrap();
        assert!(matches!(domain, TorrentError::ValidationError { .. }));
    }

    #[test]
    fn test_non_dict_root_rejected() {
        assert!(decode_dict(b"li1ei2ee").is_err());
        assert!(decode(b"d3:foo").is_err());
    }

    #[test]
    fn test_builder_encodes_sorted_keys() {
        let value = DictBuilder::new()
            .int("zeta", 1)
            .bytes("alpha", b"x".to_vec())
            .build();
        assert_eq!(encode(&value).unwrap(), b"d5:alpha1:x4:zetai1ee".to_vec());
    }
}
