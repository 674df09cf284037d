//! Local Service Discovery (BEP 14)
//!
//! Announces the torrents we serve on the LAN multicast group and turns
//! announcements from other clients into [`PeerSession`]s.
//!
//! [`PeerSession`]: crate::peer::state::PeerSession

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::distributions::Alphanumeric;
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use crate::engine::reactor::Shutdown;
use crate::error::TorrentError;
use crate::peer::state::PeerSource;
use crate::peer::table::PeerTable;
use crate::torrent::info::InfoHash;

pub const LSD_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 192, 152, 143);
pub const LSD_PORT: u16 = 6771;

const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const REQUEST_LINE: &str = "BT-SEARCH * HTTP/1.1";

/// One `BT-SEARCH` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LsdAnnounce {
    pub port: u16,
    pub info_hashes: Vec<InfoHash>,
    pub cookie: Option<String>,
}

impl LsdAnnounce {
    pub fn encode(&self) -> String {
        let mut frame = format!(
            "{}\r\nHost: {}:{}\r\nPort: {}\r\n",
            REQUEST_LINE, LSD_MULTICAST_ADDR, LSD_PORT, self.port
        );
        for hash in &self.info_hashes {
            frame.push_str("Infohash: ");
            frame.push_str(&hash.to_hex());
            frame.push_str("\r\n");
        }
        if let Some(cookie) = &self.cookie {
            frame.push_str("cookie: ");
            frame.push_str(cookie);
            frame.push_str("\r\n");
        }
        frame.push_str("\r\n\r\n");
        frame
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| TorrentError::protocol_error_with_source("LSD frame is not text", e.to_string()))?;
        let mut lines = text.split("\r\n");
        if lines.next().map(str::trim) != Some(REQUEST_LINE) {
            return Err(TorrentError::protocol_error("Not a BT-SEARCH frame").into());
        }

        let mut port = None;
        let mut info_hashes = Vec::new();
        let mut cookie = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.trim().to_ascii_lowercase().as_str() {
                "port" => port = value.parse::<u16>().ok().filter(|p| *p != 0),
                "infohash" => match InfoHash::from_hex(value) {
                    Ok(hash) => info_hashes.push(hash),
                    Err(_) => trace!("Skipping bad LSD infohash {:?}", value),
                },
                "cookie" => cookie = Some(value.to_string()),
                _ => {}
            }
        }

        let port = port.ok_or_else(|| TorrentError::protocol_error("LSD frame without valid port"))?;
        if info_hashes.is_empty() {
            return Err(TorrentError::protocol_error("LSD frame without infohash").into());
        }
        Ok(Self {
            port,
            info_hashes,
            cookie,
        })
    }
}

/// UDP socket that shares its port with other LSD clients on the host
fn bind_reusable(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// LSD socket plus the set of torrents it announces
#[derive(Debug)]
pub struct LsdService {
    socket: UdpSocket,
    target: SocketAddr,
    cookie: String,
    listen_port: u16,
    peers: Arc<PeerTable>,
    tracked: RwLock<HashSet<InfoHash>>,
}

impl LsdService {
    /// Join the LSD multicast group
    pub async fn bind(listen_port: u16, peers: Arc<PeerTable>) -> Result<Self> {
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, LSD_PORT));
        let socket = bind_reusable(bind_addr).map_err(|e| {
            error!("Failed to bind LSD socket on {}: {}", bind_addr, e);
            TorrentError::network_error_full("Failed to bind UDP socket", bind_addr.to_string(), e.to_string())
        })?;
        socket
            .join_multicast_v4(LSD_MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED)
            .map_err(|e| TorrentError::network_error_full("Failed to join LSD group", LSD_MULTICAST_ADDR.to_string(), e.to_string()))?;
        socket.set_multicast_loop_v4(true)?;
        info!("LSD joined {}:{}", LSD_MULTICAST_ADDR, LSD_PORT);

        let target = SocketAddr::V4(SocketAddrV4::new(LSD_MULTICAST_ADDR, LSD_PORT));
        Ok(Self::with_socket(socket, target, listen_port, peers))
    }

    /// Use an already bound socket and send announcements to `target`
    pub fn with_socket(socket: UdpSocket, target: SocketAddr, listen_port: u16, peers: Arc<PeerTable>) -> Self {
        let cookie: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        Self {
            socket,
            target,
            cookie,
            listen_port,
            peers,
            tracked: RwLock::new(HashSet::new()),
        }
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn track(&self, info_hash: InfoHash) {
        self.tracked.write().await.insert(info_hash);
    }

    pub async fn untrack(&self, info_hash: &InfoHash) {
        self.tracked.write().await.remove(info_hash);
    }

    /// Announce every tracked torrent in one frame
    pub async fn announce(&self) -> Result<usize> {
        let info_hashes: Vec<InfoHash> = self.tracked.read().await.iter().copied().collect();
        if info_hashes.is_empty() {
            return Ok(0);
        }
        let frame = LsdAnnounce {
            port: self.listen_port,
            info_hashes,
            cookie: Some(self.cookie.clone()),
        };
        self.socket.send_to(frame.encode().as_bytes(), self.target).await?;
        debug!("LSD announced {} torrents", frame.info_hashes.len());
        Ok(frame.info_hashes.len())
    }

    /// Returns the number of peer sessions created
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> usize {
        let frame = match LsdAnnounce::parse(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Ignoring LSD datagram from {}: {}", from, e);
                return 0;
            }
        };
        if frame.cookie.as_deref() == Some(self.cookie.as_str()) {
            trace!("Ignoring our own LSD announce");
            return 0;
        }

        let tracked = self.tracked.read().await;
        let peer = SocketAddr::new(from.ip(), frame.port);
        let mut added = 0;
        for hash in frame.info_hashes.iter().filter(|h| tracked.contains(*h)) {
            if self.peers.upsert(peer, *hash, PeerSource::Lsd).await {
                added += 1;
            }
        }
        if added > 0 {
            debug!("LSD discovered {} for {} torrents", peer, added);
        }
        added
    }

    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut buffer = vec![0u8; 1500];
        let mut ticker = interval(ANNOUNCE_INTERVAL);
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => match result {
                    Ok((len, from)) => {
                        self.handle_datagram(&buffer[..len], from).await;
                    }
                    Err(e) => warn!("LSD receive failed: {}", e),
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.announce().await {
                        warn!("LSD announce failed: {}", e);
                    }
                }
                _ = shutdown.triggered() => break,
            }
        }
        info!("LSD loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::state::PeerKey;

    #[test]
    fn test_frame_round_trip() {
        let frame = LsdAnnounce {
            port: 6881,
            info_hashes: vec![InfoHash([0xab; 20]), InfoHash([0x01; 20])],
            cookie: Some("xyz".to_string()),
        };
        let text = frame.encode();
        assert!(text.starts_with("BT-SEARCH * HTTP/1.1\r\nHost: 239.192.152.143:6771\r\nPort: 6881\r\n"));
        assert!(text.contains(&format!("Infohash: {}\r\n", "ab".repeat(20))));
        assert_eq!(LsdAnnounce::parse(text.as_bytes()).unwrap(), frame);
    }

    #[tokio::test]
    async fn test_reusable_bind_shares_port() {
        let first = bind_reusable(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        let addr = first.local_addr().unwrap();
        let second = bind_reusable(addr).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(LsdAnnounce::parse(b"GET / HTTP/1.1\r\n\r\n").is_err());
        let no_port = format!("BT-SEARCH * HTTP/1.1\r\nInfohash: {}\r\n\r\n", "00".repeat(20));
        assert!(LsdAnnounce::parse(no_port.as_bytes()).is_err());
        assert!(LsdAnnounce::parse(b"BT-SEARCH * HTTP/1.1\r\nPort: 1\r\n\r\n").is_err());
    }

    async fn service(peers: Arc<PeerTable>, target: SocketAddr) -> LsdService {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        LsdService::with_socket(socket, target, 7000, peers)
    }

    #[tokio::test]
    async fn test_announce_between_services() {
        let hash = InfoHash([3; 20]);
        let peers_b = Arc::new(PeerTable::new());
        let b = service(Arc::clone(&peers_b), "127.0.0.1:9".parse().unwrap()).await;
        b.track(hash).await;

        let a = service(Arc::new(PeerTable::new()), b.local_addr().unwrap()).await;
        a.track(hash).await;
        a.track(InfoHash([4; 20])).await;
        assert_eq!(a.announce().await.unwrap(), 2);

        let mut buf = [0u8; 1500];
        let (len, from) = b.socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(b.handle_datagram(&buf[..len], from).await, 1);
        let key = PeerKey::new(SocketAddr::new(from.ip(), 7000), hash);
        assert!(peers_b.get(&key).await.unwrap().sources.contains(PeerSource::Lsd));
        assert_eq!(peers_b.len().await, 1);
    }

    #[tokio::test]
    async fn test_own_cookie_ignored() {
        let peers = Arc::new(PeerTable::new());
        let svc = service(Arc::clone(&peers), "127.0.0.1:9".parse().unwrap()).await;
        let hash = InfoHash([5; 20]);
        svc.track(hash).await;
        let frame = LsdAnnounce {
            port: 7000,
            info_hashes: vec![hash],
            cookie: Some(svc.cookie().to_string()),
        };
        let from: SocketAddr = "10.0.0.9:6771".parse().unwrap();
        assert_eq!(svc.handle_datagram(frame.encode().as_bytes(), from).await, 0);
        assert!(peers.is_empty().await);
    }
}
