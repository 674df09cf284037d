//! DHT service
//!
//! Owns the UDP socket, the routing table and the outstanding query set.
//! Incoming queries are answered from the routing table and the shared
//! [`PeerTable`]; responses are matched to waiting callers by transaction id.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::dht::message::{error_code, peek_transaction_id, KrpcBody, KrpcError, KrpcMessage, Query, Response};
use crate::dht::node::NodeId;
use crate::dht::routing::{NodeTable, DEFAULT_BUCKET_SIZE};
use crate::engine::reactor::Shutdown;
use crate::error::TorrentError;
use crate::peer::state::PeerSource;
use crate::peer::table::PeerTable;
use crate::torrent::info::InfoHash;

/// Largest datagram we accept
const MAX_DATAGRAM: usize = 4096;

/// Interval between transaction sweeps and bucket refreshes
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Buckets untouched this long get a refresh lookup
const BUCKET_REFRESH_AFTER: Duration = Duration::from_secs(15 * 60);

const TOKEN_LEN: usize = 8;

pub const DEFAULT_BOOTSTRAP_NODES: &[&str] = &[
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "router.utorrent.com:6881",
];

/// DHT tunables
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub bucket_size: usize,
    pub query_timeout: Duration,
    pub token_lifetime: Duration,
    /// Peers returned in one `get_peers` reply
    pub max_peers_per_reply: usize,
    pub bootstrap_nodes: Vec<String>,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            query_timeout: Duration::from_secs(5),
            token_lifetime: Duration::from_secs(10 * 60),
            max_peers_per_reply: 32,
            bootstrap_nodes: DEFAULT_BOOTSTRAP_NODES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

struct PendingQuery {
    addr: SocketAddr,
    method: String,
    sent_at: Instant,
    reply: oneshot::Sender<std::result::Result<Response, KrpcError>>,
}

#[derive(Debug, Clone)]
struct IssuedToken {
    token: Vec<u8>,
    issued_at: Instant,
}

pub struct Dht {
    socket: UdpSocket,
    local_addr: SocketAddr,
    config: DhtConfig,
    table: RwLock<NodeTable>,
    peers: Arc<PeerTable>,
    pending: Mutex<HashMap<u16, PendingQuery>>,
    next_transaction: AtomicU16,
    /// Most recent `get_peers` token handed to each requester address
    issued_tokens: Mutex<HashMap<IpAddr, IssuedToken>>,
    /// Tokens remote nodes gave us, per info-hash
    received_tokens: Mutex<HashMap<InfoHash, HashMap<SocketAddr, Vec<u8>>>>,
}

impl std::fmt::Debug for Dht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht").field("local_addr", &self.local_addr).finish()
    }
}

impl Dht {
    /// Bind the DHT socket
    pub async fn bind(bind_addr: SocketAddr, own_id: NodeId, config: DhtConfig, peers: Arc<PeerTable>) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            error!("Failed to bind DHT socket on {}: {}", bind_addr, e);
            TorrentError::network_error_full("Failed to bind UDP socket", bind_addr.to_string(), e.to_string())
        })?;
        let local_addr = socket.local_addr()?;
        info!("DHT listening on {} as {}", local_addr, own_id);

        Ok(Self {
            socket,
            local_addr,
            table: RwLock::new(NodeTable::new(own_id, config.bucket_size)),
            config,
            peers,
            pending: Mutex::new(HashMap::new()),
            next_transaction: AtomicU16::new(rand::thread_rng().gen()),
            issued_tokens: Mutex::new(HashMap::new()),
            received_tokens: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn own_id(&self) -> NodeId {
        self.table.read().await.own_id()
    }

    pub async fn node_count(&self) -> usize {
        self.table.read().await.len()
    }

    /// Add a node learned out of band, e.g. from a peer's `port` message
    pub async fn add_node(&self, id: NodeId, addr: SocketAddr) {
        self.table.write().await.insert(id, addr);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    fn new_token() -> Vec<u8> {
        let mut token = vec![0u8; TOKEN_LEN];
        rand::thread_rng().fill(&mut token[..]);
        token
    }

    /// Issue a fresh token for `ip`, superseding any previous one
    async fn issue_token(&self, ip: IpAddr) -> Vec<u8> {
        let token = Self::new_token();
        self.issued_tokens.lock().await.insert(
            ip,
            IssuedToken {
                token: token.clone(),
                issued_at: Instant::now(),
            },
        );
        token
    }

    async fn token_is_valid(&self, ip: IpAddr, token: &[u8]) -> bool {
        match self.issued_tokens.lock().await.get(&ip) {
            Some(issued) => issued.token == token && issued.issued_at.elapsed() < self.config.token_lifetime,
            None => false,
        }
    }

    /// Answer one incoming query
    pub async fn handle_query(&self, query: Query, from: SocketAddr) -> KrpcBody {
        let own_id = {
            let mut table = self.table.write().await;
            table.insert(query.sender(), from);
            table.own_id()
        };
        let k = self.config.bucket_size;

        match query {
            Query::Ping { .. } => KrpcBody::Response(Response::new(own_id)),
            Query::FindNode { target, .. } => {
                let mut response = Response::new(own_id);
                response.nodes = self.closest_pairs(&target, k).await;
                KrpcBody::Response(response)
            }
            Query::GetPeers { info_hash, .. } => {
                let mut response = Response::new(own_id);
                let values = self
                    .peers
                    .available_connected(&info_hash, self.config.max_peers_per_reply)
                    .await;
                if values.is_empty() {
                    response.nodes = self.closest_pairs(&NodeId::from(info_hash), k).await;
                } else {
                    response.values = values;
                }
                response.token = Some(self.issue_token(from.ip()).await);
                KrpcBody::Response(response)
            }
            Query::AnnouncePeer {
                info_hash,
                port,
                token,
                implied_port,
                ..
            } => {
                if !self.token_is_valid(from.ip(), &token).await {
                    debug!("Rejecting announce_peer from {} with bad token", from);
                    return KrpcBody::Error(KrpcError::new(error_code::PROTOCOL, "bad token"));
                }
                let port = if implied_port { from.port() } else { port };
                if port == 0 {
                    return KrpcBody::Error(KrpcError::new(error_code::PROTOCOL, "invalid port"));
                }
                let peer = SocketAddr::new(from.ip(), port);
                self.peers.upsert(peer, info_hash, PeerSource::Dht).await;
                debug!("Peer {} announced {} via DHT", peer, info_hash);
                KrpcBody::Response(Response::new(own_id))
            }
            Query::Unknown { method, .. } => {
                debug!("Unknown DHT method {:?} from {}", method, from);
                KrpcBody::Error(KrpcError::new(error_code::METHOD_UNKNOWN, "Method Unknown"))
            }
        }
    }

    async fn closest_pairs(&self, target: &NodeId, count: usize) -> Vec<(NodeId, SocketAddr)> {
        self.table
            .read()
            .await
            .closest(target, count)
            .into_iter()
            .map(|n| (n.id, n.addr))
            .collect()
    }

    /// Process one datagram read from the socket
    pub async fn handle_datagram(&self, data: &[u8], from: SocketAddr) -> Result<()> {
        let message = match KrpcMessage::decode(data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Malformed KRPC datagram from {}: {}", from, e);
                if let Some(tid) = peek_transaction_id(data) {
                    let reply = KrpcMessage::error(tid, error_code::PROTOCOL, "malformed message");
                    self.send(&reply, from).await?;
                }
                return Ok(());
            }
        };

        match message.body {
            KrpcBody::Query(query) => {
                trace!("DHT {} query from {}", query.method(), from);
                let body = self.handle_query(query, from).await;
                let reply = KrpcMessage {
                    transaction_id: message.transaction_id,
                    body,
                };
                self.send(&reply, from).await
            }
            KrpcBody::Response(response) => {
                self.complete(&message.transaction_id, from, Ok(response)).await;
                Ok(())
            }
            KrpcBody::Error(err) => {
                debug!("DHT error {} from {}: {}", err.code, from, err.message);
                self.complete(&message.transaction_id, from, Err(err)).await;
                Ok(())
            }
        }
    }

    /// Hand a reply to whoever is waiting on `tid`; unknown or late replies are dropped
    async fn complete(&self, tid: &[u8], from: SocketAddr, outcome: std::result::Result<Response, KrpcError>) {
        let Ok(key) = <[u8; 2]>::try_from(tid).map(u16::from_be_bytes) else {
            trace!("Discarding reply with foreign transaction id from {}", from);
            return;
        };
        let pending = {
            let mut pending = self.pending.lock().await;
            match pending.get(&key) {
                Some(p) if p.addr == from => pending.remove(&key),
                _ => None,
            }
        };
        let Some(pending) = pending else {
            trace!("Discarding unmatched reply from {}", from);
            return;
        };

        if let Ok(response) = &outcome {
            let mut table = self.table.write().await;
            table.insert(response.id, from);
            for (id, addr) in &response.nodes {
                table.insert(*id, *addr);
            }
        }
        trace!("{} answered in {:?}", pending.method, pending.sent_at.elapsed());
        let _ = pending.reply.send(outcome);
    }

    async fn send(&self, message: &KrpcMessage, to: SocketAddr) -> Result<()> {
        let bytes = message.encode()?;
        self.socket.send_to(&bytes, to).await.map_err(|e| {
            TorrentError::network_error_full("Failed to send DHT datagram", to.to_string(), e.to_string())
        })?;
        Ok(())
    }

    /// Send a query and wait for its response within the query timeout
    pub async fn query(&self, addr: SocketAddr, query: Query) -> Result<Response> {
        let key = self.next_transaction.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let method = query.method().to_string();
        self.pending.lock().await.insert(
            key,
            PendingQuery {
                addr,
                method: method.clone(),
                sent_at: Instant::now(),
                reply: tx,
            },
        );

        let message = KrpcMessage::query(key.to_be_bytes().to_vec(), query);
        if let Err(e) = self.send(&message, addr).await {
            self.pending.lock().await.remove(&key);
            return Err(e);
        }

        match timeout(self.config.query_timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(err))) => Err(TorrentError::dht_error_full(
                format!("{} rejected", method),
                addr.to_string(),
                format!("{} {}", err.code, err.message),
            )
            .into()),
            Ok(Err(_)) => Err(TorrentError::dht_error_full("Query abandoned", addr.to_string(), method).into()),
            Err(_) => {
                self.pending.lock().await.remove(&key);
                self.table.write().await.mark_failed_addr(&addr);
                debug!("DHT {} to {} timed out", method, addr);
                Err(TorrentError::dht_error_full("Query timed out", addr.to_string(), method).into())
            }
        }
    }

    pub async fn ping(&self, addr: SocketAddr) -> Result<NodeId> {
        let id = self.own_id().await;
        Ok(self.query(addr, Query::Ping { id }).await?.id)
    }

    pub async fn find_node(&self, addr: SocketAddr, target: NodeId) -> Result<Vec<(NodeId, SocketAddr)>> {
        let id = self.own_id().await;
        Ok(self.query(addr, Query::FindNode { id, target }).await?.nodes)
    }

    /// Drop transactions that outlived the query timeout
    pub async fn sweep_transactions(&self) -> usize {
        let limit = self.config.query_timeout;
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, p| p.sent_at.elapsed() <= limit);
        let removed = before - pending.len();
        if removed > 0 {
            debug!("Swept {} expired DHT transactions", removed);
        }
        drop(pending);

        let lifetime = self.config.token_lifetime;
        self.issued_tokens.lock().await.retain(|_, t| t.issued_at.elapsed() < lifetime);
        removed
    }

    /// Resolve the bootstrap names and ask each for nodes near our own id
    pub async fn bootstrap(&self) -> Result<usize> {
        info!("Bootstrapping DHT from {} nodes", self.config.bootstrap_nodes.len());
        let own_id = self.own_id().await;
        let mut addrs = Vec::new();
        for name in &self.config.bootstrap_nodes {
            match tokio::net::lookup_host(name.as_str()).await {
                Ok(resolved) => addrs.extend(resolved.filter(SocketAddr::is_ipv4)),
                Err(e) => warn!("Failed to resolve bootstrap node {}: {}", name, e),
            }
        }

        let mut learned = 0;
        for addr in addrs {
            match self.find_node(addr, own_id).await {
                Ok(nodes) => learned += nodes.len(),
                Err(e) => debug!("Bootstrap node {} failed: {}", addr, e),
            }
        }
        let count = self.node_count().await;
        if count == 0 {
            return Err(TorrentError::dht_error("DHT bootstrap found no nodes").into());
        }
        info!("DHT bootstrap learned {} nodes, table holds {}", learned, count);
        Ok(count)
    }

    /// One round of `get_peers` against the closest known nodes
    pub async fn lookup_peers(&self, info_hash: InfoHash) -> Result<Vec<SocketAddr>> {
        let own_id = self.own_id().await;
        let targets = self.closest_pairs(&NodeId::from(info_hash), self.config.bucket_size).await;
        if targets.is_empty() {
            return Err(TorrentError::dht_error("No DHT nodes to query").into());
        }

        let mut found = Vec::new();
        for (_, addr) in targets {
            let query = Query::GetPeers { id: own_id, info_hash };
            let response = match self.query(addr, query).await {
                Ok(response) => response,
                Err(e) => {
                    trace!("get_peers to {} failed: {}", addr, e);
                    continue;
                }
            };
            if let Some(token) = response.token {
                self.received_tokens
                    .lock()
                    .await
                    .entry(info_hash)
                    .or_default()
                    .insert(addr, token);
            }
            for peer in response.values {
                if !found.contains(&peer) {
                    found.push(peer);
                }
            }
        }

        let added = self.peers.upsert_all(&found, info_hash, PeerSource::Dht).await;
        debug!("DHT lookup for {} found {} peers ({} new)", info_hash, found.len(), added);
        Ok(found)
    }

    /// Announce ourselves to every node that gave us a token for `info_hash`
    pub async fn announce(&self, info_hash: InfoHash, port: u16) -> usize {
        let own_id = self.own_id().await;
        let tokens: Vec<(SocketAddr, Vec<u8>)> = self
            .received_tokens
            .lock()
            .await
            .get(&info_hash)
            .map(|m| m.iter().map(|(a, t)| (*a, t.clone())).collect())
            .unwrap_or_default();

        let mut accepted = 0;
        for (addr, token) in tokens {
            let query = Query::AnnouncePeer {
                id: own_id,
                info_hash,
                port,
                token,
                implied_port: false,
            };
            match self.query(addr, query).await {
                Ok(_) => accepted += 1,
                Err(e) => debug!("announce_peer to {} failed: {}", addr, e),
            }
        }
        debug!("Announced {} to {} DHT nodes", info_hash, accepted);
        accepted
    }

    /// Forget tokens for a torrent that is no longer active
    pub async fn forget(&self, info_hash: &InfoHash) {
        self.received_tokens.lock().await.remove(info_hash);
    }

    async fn refresh_buckets(self: &Arc<Self>) {
        let (stale, targets) = {
            let table = self.table.read().await;
            let stale = table.stale_buckets(BUCKET_REFRESH_AFTER);
            let targets: Vec<(NodeId, Vec<SocketAddr>)> = stale
                .iter()
                .map(|&i| {
                    let target = table.random_id_in_bucket(i);
                    let nodes = table.closest(&target, 1).into_iter().map(|n| n.addr).collect();
                    (target, nodes)
                })
                .collect();
            (stale.len(), targets)
        };
        if stale == 0 {
            return;
        }
        debug!("Refreshing {} stale buckets", stale);
        for (target, addrs) in targets {
            for addr in addrs {
                let dht = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = dht.find_node(addr, target).await {
                        trace!("Refresh lookup to {} failed: {}", addr, e);
                    }
                });
            }
        }
    }

    /// Receive loop; returns when `shutdown` fires
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) {
        info!("DHT loop started on {}", self.local_addr);
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let mut maintenance = interval(MAINTENANCE_INTERVAL);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, from)) => {
                            if let Err(e) = self.handle_datagram(&buffer[..len], from).await {
                                debug!("Error handling datagram from {}: {}", from, e);
                            }
                        }
                        Err(e) => warn!("DHT receive failed: {}", e),
                    }
                }
                _ = maintenance.tick() => {
                    self.sweep_transactions().await;
                    self.refresh_buckets().await;
                }
                _ = shutdown.triggered() => break,
            }
        }
        self.pending.lock().await.clear();
        info!("DHT loop stopped");
    }
}
