//! Tracker response parsing

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use anyhow::Result;
use tracing::{debug, trace};

use super::{AnnounceResponse, ScrapeStats};
use crate::bencode::{self, as_dict, as_str, DictExt, Value};
use crate::dht::node::decode_compact_peers;
use crate::error::TorrentError;
use crate::torrent::info::InfoHash;

fn count(dict: &bencode::Dict, key: &str) -> u32 {
    dict.int(key).map(|v| v.clamp(0, u32::MAX as i64) as u32).unwrap_or(0)
}

/// Parse an HTTP announce reply; both compact and dictionary peer lists are accepted
pub fn parse_announce_response(data: &[u8], tracker: &str) -> Result<AnnounceResponse> {
    let dict = bencode::decode_dict(data)
        .map_err(|e| TorrentError::tracker_error_full("Malformed tracker response", tracker, e.to_string()))?;

    if let Some(reason) = dict.string("failure reason") {
        debug!("Tracker {} refused announce: {}", tracker, reason);
        return Err(TorrentError::tracker_error_full("Tracker returned failure", tracker, reason).into());
    }

    let interval = dict
        .int("interval")
        .filter(|v| *v >= 0)
        .ok_or_else(|| TorrentError::validation_error_with_field("Tracker response without interval", "interval"))?;

    let peers = match dict.value("peers") {
        Some(Value::Bytes(blob)) => decode_compact_peers(blob)?,
        Some(Value::List(entries)) => entries.iter().filter_map(dict_peer).collect(),
        Some(_) => {
            return Err(TorrentError::validation_error_with_field("Unexpected peers encoding", "peers").into());
        }
        None => Vec::new(),
    };
    trace!("Tracker {} returned {} peers", tracker, peers.len());

    Ok(AnnounceResponse {
        interval: interval.min(u32::MAX as i64) as u32,
        min_interval: dict.int("min interval").map(|v| v.clamp(0, u32::MAX as i64) as u32),
        complete: count(&dict, "complete"),
        incomplete: count(&dict, "incomplete"),
        peers,
    })
}

/// `{ip, port}` entry of a non-compact peer list
fn dict_peer(value: &Value) -> Option<SocketAddr> {
    let entry = as_dict(value)?;
    let ip: IpAddr = entry.value("ip").and_then(as_str)?.parse().ok()?;
    let port = u16::try_from(entry.int("port")?).ok()?;
    (port != 0).then(|| SocketAddr::new(ip, port))
}

/// Parse a scrape reply into per-torrent counters
pub fn parse_scrape_response(data: &[u8], tracker: &str) -> Result<HashMap<InfoHash, ScrapeStats>> {
    let dict = bencode::decode_dict(data)
        .map_err(|e| TorrentError::tracker_error_full("Malformed scrape response", tracker, e.to_string()))?;
    if let Some(reason) = dict.string("failure reason") {
        return Err(TorrentError::tracker_error_full("Tracker returned failure", tracker, reason).into());
    }

    let files = dict.require_dict("files")?;
    let mut stats = HashMap::with_capacity(files.len());
    for (key, value) in files {
        let (Ok(hash), Some(entry)) = (InfoHash::from_slice(key), as_dict(value)) else {
            continue;
        };
        stats.insert(
            hash,
            ScrapeStats {
                complete: count(entry, "complete"),
                downloaded: count(entry, "downloaded"),
                incomplete: count(entry, "incomplete"),
            },
        );
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_response() {
        let mut body = b"d8:completei5e10:incompletei2e8:intervali1800e5:peers6:".to_vec();
        body.extend_from_slice(&[192, 168, 1, 10, 0x1a, 0xe1]);
        body.push(b'e');

        let response = parse_announce_response(&body, "t").unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.complete, 5);
        assert_eq!(response.incomplete, 2);
        assert_eq!(response.min_interval, None);
        assert_eq!(response.peers, vec!["192.168.1.10:6881".parse().unwrap()]);
    }

    #[test]
    fn test_dictionary_peers() {
        let body = b"d8:intervali900e12:min intervali60e5:peersld2:ip8:10.0.0.17:peer id20:aaaaaaaaaaaaaaaaaaaa4:porti51413eed2:ip3:bad4:porti1eeee";
        let response = parse_announce_response(body, "t").unwrap();
        assert_eq!(response.min_interval, Some(60));
        assert_eq!(response.peers, vec!["10.0.0.1:51413".parse().unwrap()]);
    }

    #[test]
    fn test_failure_reason_is_tracker_error() {
        let err = parse_announce_response(b"d14:failure reason9:not founde", "t").unwrap_err();
        assert!(matches!(TorrentError::find(&err), Some(TorrentError::TrackerError { .. })));
    }

    #[test]
    fn test_missing_interval_is_validation_error() {
        let err = parse_announce_response(b"d5:peers0:e", "t").unwrap_err();
        assert!(matches!(TorrentError::find(&err), Some(TorrentError::ValidationError { .. })));
    }

    #[test]
    fn test_scrape_files() {
        let mut body = b"d5:filesd20:".to_vec();
        body.extend_from_slice(&[7u8; 20]);
        body.extend_from_slice(b"d8:completei3e10:downloadedi10e10:incompletei1eeee");
        let stats = parse_scrape_response(&body, "t").unwrap();
        assert_eq!(
            stats[&InfoHash([7; 20])],
            ScrapeStats {
                complete: 3,
                downloaded: 10,
                incomplete: 1
            }
        );
    }
}
