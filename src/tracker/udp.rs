//! UDP tracker protocol (BEP 15)

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use bytes::{Buf, BufMut, BytesMut};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};
use url::Url;

use super::{AnnounceRequest, AnnounceResponse};
use crate::dht::node::{decode_compact_peers, COMPACT_PEER_LEN};
use crate::error::TorrentError;

/// Connection id every connect request carries
pub const PROTOCOL_MAGIC: u64 = 0x41727101980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const CONNECT_RESPONSE_LEN: usize = 16;
const ANNOUNCE_HEADER_LEN: usize = 20;

pub fn encode_connect(transaction_id: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_u64(PROTOCOL_MAGIC);
    buf.put_u32(ACTION_CONNECT);
    buf.put_u32(transaction_id);
    buf.to_vec()
}

pub fn encode_announce(connection_id: u64, transaction_id: u32, request: &AnnounceRequest) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_u64(connection_id);
    buf.put_u32(ACTION_ANNOUNCE);
    buf.put_u32(transaction_id);
    buf.put_slice(request.info_hash.as_bytes());
    buf.put_slice(&request.peer_id);
    buf.put_u64(request.downloaded);
    buf.put_u64(request.left);
    buf.put_u64(request.uploaded);
    buf.put_u32(request.event.udp_code());
    buf.put_u32(0); // ip: use the packet source
    buf.put_u32(rand::random());
    buf.put_u32(request.num_want);
    buf.put_u16(request.port);
    buf.to_vec()
}

fn tracker_error(message: &str, tracker: &str) -> anyhow::Error {
    TorrentError::tracker_error(message, tracker).into()
}

/// Check action and transaction id; an error action becomes a tracker error
fn check_header(mut frame: &[u8], action: u32, transaction_id: u32, tracker: &str) -> Result<()> {
    if frame.len() < 8 {
        return Err(TorrentError::protocol_error_with_source("Short UDP tracker reply", tracker).into());
    }
    let got_action = frame.get_u32();
    let got_tid = frame.get_u32();
    if got_tid != transaction_id {
        return Err(TorrentError::protocol_error_with_source("UDP tracker transaction mismatch", tracker).into());
    }
    if got_action == ACTION_ERROR {
        let message = String::from_utf8_lossy(frame).into_owned();
        return Err(TorrentError::tracker_error_full("Tracker returned failure", tracker, message).into());
    }
    if got_action != action {
        return Err(TorrentError::protocol_error_with_source(
            "Unexpected UDP tracker action",
            format!("{} from {}", got_action, tracker),
        )
        .into());
    }
    Ok(())
}

pub fn decode_connect(frame: &[u8], transaction_id: u32, tracker: &str) -> Result<u64> {
    check_header(frame, ACTION_CONNECT, transaction_id, tracker)?;
    if frame.len() < CONNECT_RESPONSE_LEN {
        return Err(tracker_error("Short connect reply", tracker));
    }
    Ok((&frame[8..16]).get_u64())
}

pub fn decode_announce(frame: &[u8], transaction_id: u32, tracker: &str) -> Result<AnnounceResponse> {
    check_header(frame, ACTION_ANNOUNCE, transaction_id, tracker)?;
    if frame.len() < ANNOUNCE_HEADER_LEN {
        return Err(tracker_error("Short announce reply", tracker));
    }
    let mut body = &frame[8..];
    let interval = body.get_u32();
    let incomplete = body.get_u32();
    let complete = body.get_u32();
    let usable = body.len() - body.len() % COMPACT_PEER_LEN;
    let peers = decode_compact_peers(&body[..usable])?;
    Ok(AnnounceResponse {
        interval,
        min_interval: None,
        complete,
        incomplete,
        peers,
    })
}

/// One `udp://host:port` tracker
#[derive(Debug, Clone)]
pub struct UdpTracker {
    url: String,
    timeout: Duration,
}

impl UdpTracker {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let parsed = Url::parse(&self.url)
            .map_err(|e| TorrentError::tracker_error_full("Invalid tracker URL", &self.url, e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| tracker_error("Tracker URL without host", &self.url))?;
        let port = parsed
            .port()
            .ok_or_else(|| tracker_error("Tracker URL without port", &self.url))?;
        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TorrentError::network_error_full("Failed to resolve tracker", host, e.to_string()))?;
        addrs
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| TorrentError::network_error_full("No IPv4 address for tracker", host, "lookup").into())
    }

    async fn exchange(&self, socket: &UdpSocket, frame: &[u8]) -> Result<Vec<u8>> {
        socket.send(frame).await?;
        let mut buf = vec![0u8; 2048];
        let len = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| TorrentError::tracker_error("UDP tracker timed out", &self.url))??;
        buf.truncate(len);
        Ok(buf)
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let addr = self.resolve().await?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        let tid = rand::random::<u32>();
        let reply = self.exchange(&socket, &encode_connect(tid)).await?;
        let connection_id = decode_connect(&reply, tid, &self.url)?;
        trace!("UDP tracker {} connection id {:x}", self.url, connection_id);

        let tid = rand::random::<u32>();
        let reply = self.exchange(&socket, &encode_announce(connection_id, tid, request)).await?;
        let response = decode_announce(&reply, tid, &self.url)?;
        debug!(
            "UDP tracker {} returned {} peers, interval {}s",
            self.url,
            response.peers.len(),
            response.interval
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::info::InfoHash;
    use crate::tracker::AnnounceEvent;

    #[test]
    fn test_connect_frame() {
        let frame = encode_connect(0x01020304);
        assert_eq!(
            frame,
            vec![0, 0, 0x04, 0x17, 0x27, 0x10, 0x19, 0x80, 0, 0, 0, 0, 1, 2, 3, 4]
        );
    }

    #[test]
    fn test_announce_frame_layout() {
        let mut request = AnnounceRequest::new(InfoHash([9; 20]), [8; 20], 6881);
        request.event = AnnounceEvent::Completed;
        request.left = 5;
        let frame = encode_announce(77, 3, &request);
        assert_eq!(frame.len(), 98);
        assert_eq!(&frame[..8], &77u64.to_be_bytes());
        assert_eq!(&frame[8..12], &1u32.to_be_bytes());
        assert_eq!(&frame[16..36], &[9; 20]);
        assert_eq!(&frame[64..72], &5u64.to_be_bytes());
        assert_eq!(&frame[80..84], &1u32.to_be_bytes());
        assert_eq!(&frame[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn test_error_action() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&3u32.to_be_bytes());
        frame.extend_from_slice(&9u32.to_be_bytes());
        frame.extend_from_slice(b"unregistered torrent");
        let err = decode_announce(&frame, 9, "udp://t").unwrap_err();
        assert!(err.to_string().contains("unregistered torrent"));
        assert!(decode_announce(&frame, 10, "udp://t").is_err());
    }

    #[tokio::test]
    async fn test_announce_against_local_tracker() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let url = format!("udp://{}/announce", server.local_addr().unwrap());

        let fake = tokio::spawn(async move {
            let mut buf = [0u8; 256];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 16);
            assert_eq!(&buf[..8], &PROTOCOL_MAGIC.to_be_bytes());
            let mut reply = Vec::new();
            reply.extend_from_slice(&0u32.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&0xdeadu64.to_be_bytes());
            server.send_to(&reply, from).await.unwrap();

            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, 98);
            assert_eq!(&buf[..8], &0xdeadu64.to_be_bytes());
            let mut reply = Vec::new();
            reply.extend_from_slice(&1u32.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(&600u32.to_be_bytes());
            reply.extend_from_slice(&1u32.to_be_bytes());
            reply.extend_from_slice(&4u32.to_be_bytes());
            reply.extend_from_slice(&[10, 1, 2, 3, 0x1a, 0xe1]);
            server.send_to(&reply, from).await.unwrap();
        });

        let tracker = UdpTracker::new(url, Duration::from_secs(2));
        let request = AnnounceRequest::new(InfoHash([1; 20]), [2; 20], 6881);
        let response = tracker.announce(&request).await.unwrap();
        assert_eq!(response.interval, 600);
        assert_eq!(response.incomplete, 1);
        assert_eq!(response.complete, 4);
        assert_eq!(response.peers, vec!["10.1.2.3:6881".parse().unwrap()]);
        fake.await.unwrap();
    }
}
