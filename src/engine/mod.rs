//! Engine context
//!
//! One [`Engine`] per process: the shared peer table, the torrent arena, the
//! discovery services and the reactor that owns every spawned loop.

pub mod events;
pub mod reactor;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

use crate::cli::config::EngineConfig;
use crate::dht::{Dht, NodeId};
use crate::error::TorrentError;
use crate::lsd::LsdService;
use crate::peer::connection::{PeerConnection, PeerContext};
use crate::peer::table::PeerTable;
use crate::protocol::Handshake;
use crate::session::TorrentContext;
use crate::tracker::TrackerClient;

pub use events::{EngineEvent, EventSink, NoopEventSink};
pub use reactor::{Reactor, Shutdown};

#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    peer_id: [u8; 20],
    node_id: NodeId,
    peers: Arc<PeerTable>,
    torrents: Arc<TorrentContext>,
    tracker: TrackerClient,
    dht: Option<Arc<Dht>>,
    lsd: Option<Arc<LsdService>>,
    peer_ctx: Arc<PeerContext>,
    reactor: Reactor,
    events: Arc<dyn EventSink>,
    listen_addr: SocketAddr,
}

impl Engine {
    /// Bind the peer listener and the enabled discovery sockets, then spawn
    /// their loops
    pub async fn start(config: EngineConfig, events: Arc<dyn EventSink>) -> Result<Arc<Self>> {
        let peer_id = Handshake::generate_peer_id();
        let node_id = NodeId::random();
        let peers = Arc::new(PeerTable::new());
        let reactor = Reactor::new(config.disk_workers);
        let tracker = TrackerClient::new(config.tracker_timeout(), config.tracker_min_interval())?;

        let listener = TcpListener::bind(config.listen_addr()).await.map_err(|e| {
            TorrentError::network_error_full("Failed to bind peer listener", config.listen_addr().to_string(), e.to_string())
        })?;
        let listen_addr = listener.local_addr()?;
        info!("Listening for peers on {}", listen_addr);

        let dht = if config.enable_dht {
            let bind = SocketAddr::new(config.listen_ip, listen_addr.port());
            let dht = Dht::bind(bind, node_id, config.dht_config(), Arc::clone(&peers)).await?;
            Some(Arc::new(dht))
        } else {
            None
        };

        let lsd = if config.enable_lsd {
            match LsdService::bind(listen_addr.port(), Arc::clone(&peers)).await {
                Ok(lsd) => Some(Arc::new(lsd)),
                Err(e) => {
                    warn!("Local service discovery unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let mut peer_ctx = PeerContext::new(peer_id, Arc::clone(&peers), config.connection_config());
        if let Some(dht) = &dht {
            peer_ctx = peer_ctx.with_dht(Arc::clone(dht));
        }

        let engine = Arc::new(Self {
            config,
            peer_id,
            node_id,
            peers,
            torrents: Arc::new(TorrentContext::new()),
            tracker,
            dht,
            lsd,
            peer_ctx: Arc::new(peer_ctx),
            reactor,
            events,
            listen_addr,
        });
        engine.spawn_services(listener).await;
        Ok(engine)
    }

    async fn spawn_services(self: &Arc<Self>, listener: TcpListener) {
        let engine = Arc::clone(self);
        let shutdown = self.reactor.shutdown_signal();
        self.reactor
            .spawn_service(engine.accept_loop(listener, shutdown))
            .await;

        if let Some(dht) = &self.dht {
            self.reactor
                .spawn_service(Arc::clone(dht).run(self.reactor.shutdown_signal()))
                .await;
            let dht = Arc::clone(dht);
            self.reactor
                .spawn_service(async move {
                    match dht.bootstrap().await {
                        Ok(nodes) => info!("DHT bootstrapped with {} nodes", nodes),
                        Err(e) => warn!("DHT bootstrap failed: {}", e),
                    }
                })
                .await;
        }

        if let Some(lsd) = &self.lsd {
            self.reactor
                .spawn_service(Arc::clone(lsd).run(self.reactor.shutdown_signal()))
                .await;
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: Shutdown) {
        let incoming = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        loop {
            let accepted = tokio::select! {
                _ = shutdown.triggered() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let Ok(permit) = Arc::clone(&incoming).try_acquire_owned() else {
                debug!("Refusing {}: too many incoming connections", addr);
                continue;
            };
            trace!("Incoming connection from {}", addr);
            let torrents = Arc::clone(&self.torrents);
            let ctx = Arc::clone(&self.peer_ctx);
            self.reactor
                .spawn_service(async move {
                    if let Err(e) = PeerConnection::accept(stream, &torrents, ctx).await {
                        debug!("Incoming peer {} closed: {}", addr, e);
                    }
                    drop(permit);
                })
                .await;
        }
        debug!("Peer listener stopped");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn torrents(&self) -> &Arc<TorrentContext> {
        &self.torrents
    }

    pub fn tracker(&self) -> &TrackerClient {
        &self.tracker
    }

    pub fn dht(&self) -> Option<&Arc<Dht>> {
        self.dht.as_ref()
    }

    pub fn lsd(&self) -> Option<&Arc<LsdService>> {
        self.lsd.as_ref()
    }

    pub fn peer_context(&self) -> &Arc<PeerContext> {
        &self.peer_ctx
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Close every torrent's channels and stop all loops
    pub async fn shutdown(&self) {
        for info_hash in self.torrents.info_hashes().await {
            if let Some(session) = self.torrents.get(&info_hash).await {
                session.close_channels().await;
            }
        }
        self.reactor.shutdown_and_wait().await;
        info!("Engine stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    /// Loopback engine with every discovery service off
    pub(crate) async fn local_engine(download_dir: &std::path::Path) -> Arc<Engine> {
        let config = EngineConfig {
            download_dir: download_dir.to_path_buf(),
            listen_ip: Ipv4Addr::LOCALHOST.into(),
            listen_port: 0,
            enable_dht: false,
            enable_tracker: false,
            enable_lsd: false,
            connect_timeout_secs: 2,
            tracker_min_interval_secs: 1,
            ..EngineConfig::default()
        };
        Engine::start(config, Arc::new(NoopEventSink)).await.unwrap()
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let engine = local_engine(dir.path()).await;
        assert_ne!(engine.listen_addr().port(), 0);
        assert!(engine.dht().is_none());
        assert!(engine.lsd().is_none());
        assert_eq!(&engine.peer_id()[..3], b"-BE");

        tokio::time::timeout(Duration::from_secs(2), engine.shutdown())
            .await
            .unwrap();
        assert!(engine.reactor().is_shutdown());
    }

    #[tokio::test]
    async fn test_engine_with_dht_binds_udp() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            download_dir: dir.path().to_path_buf(),
            listen_ip: Ipv4Addr::LOCALHOST.into(),
            listen_port: 0,
            enable_lsd: false,
            dht_bootstrap_nodes: Vec::new(),
            ..EngineConfig::default()
        };
        let engine = Engine::start(config, Arc::new(NoopEventSink)).await.unwrap();
        let dht = engine.dht().unwrap();
        assert_eq!(dht.own_id().await, engine.node_id());
        assert!(engine.peer_context().dht.is_some());
        engine.shutdown().await;
    }
}
