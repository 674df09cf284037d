//! Transfers
//!
//! The capability a download task drives: open, download, check completion,
//! release. [`Protocol`] picks how metadata is resolved; the transfer itself
//! is the same for every source.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::task::TaskEntity;
use crate::engine::reactor::Shutdown;
use crate::engine::Engine;
use crate::error::TorrentError;
use crate::peer::connection::PeerConnection;
use crate::peer::state::PeerKey;
use crate::session::TorrentSession;
use crate::storage::{select_factory, ByteStorage, FileByteStorage};
use crate::torrent::{is_magnet_link, MagnetLink, TorrentMetadata, TorrentParser};
use crate::tracker::{AnnounceEvent, AnnounceRequest};

/// How often the transfer tops up its peer connections
const PEER_TICK: Duration = Duration::from_secs(1);

#[async_trait]
pub trait Transfer: Send + Sync {
    /// Resolve metadata and attach the torrent session
    async fn open(&mut self) -> Result<()>;

    /// Drive the transfer until it completes, fails or `stop` fires
    async fn download(&mut self, stop: Shutdown) -> Result<()>;

    async fn check_completed(&self) -> Result<bool>;

    /// Close channels and storage handles; safe to call more than once
    async fn release(&mut self);

    /// Display name, known after `open`
    fn name(&self) -> Option<String>;

    /// Bytes of the selected files, known after `open`
    fn size(&self) -> u64;
}

/// Where a task's metadata comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    Torrent(PathBuf),
    Magnet(MagnetLink),
}

impl Protocol {
    pub fn detect(url: &str) -> Result<Self> {
        if is_magnet_link(url) {
            return Ok(Protocol::Magnet(MagnetLink::parse(url)?));
        }
        if url.starts_with("http://") || url.starts_with("https://") || url.starts_with("ftp://") {
            return Err(TorrentError::validation_error_with_field(
                format!("Unsupported download source: {}", url),
                "url",
            )
            .into());
        }
        Ok(Protocol::Torrent(PathBuf::from(url)))
    }

    /// Name to show before metadata is resolved
    pub fn display_name(&self) -> String {
        match self {
            Protocol::Torrent(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            Protocol::Magnet(link) => link.name(),
        }
    }

    pub fn transfer(self, engine: Arc<Engine>, task: TaskEntity) -> TorrentTransfer {
        TorrentTransfer::new(self, engine, task)
    }
}

/// Done when the source is exhausted (`bytes_read < 0`) or
/// the declared size is reached; a declared size of 0 means unknown
pub fn check_finish(bytes_read: i64, total: u64, declared: u64) -> bool {
    bytes_read < 0 || (declared > 0 && total >= declared)
}

#[derive(Debug)]
pub struct TorrentTransfer {
    protocol: Protocol,
    engine: Arc<Engine>,
    task: TaskEntity,
    trackers: Vec<String>,
    session: Option<Arc<TorrentSession>>,
    size: u64,
    started: bool,
    /// Trust the files on disk as complete instead of verifying them
    seeding: bool,
}

impl TorrentTransfer {
    pub fn new(protocol: Protocol, engine: Arc<Engine>, task: TaskEntity) -> Self {
        Self {
            protocol,
            engine,
            task,
            trackers: Vec::new(),
            session: None,
            size: 0,
            started: false,
            seeding: false,
        }
    }

    /// Serve an already completed download without re-hashing it
    pub fn seeding(mut self) -> Self {
        self.seeding = true;
        self
    }

    pub fn session(&self) -> Option<&Arc<TorrentSession>> {
        self.session.as_ref()
    }

    async fn resolve_metadata(&mut self) -> Result<TorrentMetadata> {
        match &self.protocol {
            Protocol::Torrent(path) => TorrentParser::parse_file(path).await,
            Protocol::Magnet(link) => {
                let cached = link.cached_torrent_path(&self.task.file);
                if !tokio::fs::try_exists(&cached).await.unwrap_or(false) {
                    return Err(TorrentError::task_error(
                        format!("No metadata for magnet link, expected {}", cached.display()),
                        self.task.id.clone(),
                    )
                    .into());
                }
                let metadata = TorrentParser::parse_file(&cached).await?;
                if metadata.info_hash != link.info_hash {
                    return Err(TorrentError::validation_error_with_field(
                        format!("Cached torrent is {}, magnet asks for {}", metadata.info_hash, link.info_hash),
                        "xt",
                    )
                    .into());
                }
                self.trackers.extend(link.trackers.iter().cloned());
                Ok(metadata)
            }
        }
    }

    fn require_session(&self) -> Result<Arc<TorrentSession>> {
        self.session
            .clone()
            .ok_or_else(|| TorrentError::task_error("Transfer is not open", self.task.id.clone()).into())
    }

    /// Announce to trackers and ask the DHT and LSD for peers; returns the
    /// delay until the next round
    async fn discover(&self, session: &TorrentSession, event: AnnounceEvent) -> Duration {
        let engine = &self.engine;
        let info_hash = session.info_hash();
        let port = engine.listen_addr().port();
        let mut wait = engine.tracker().min_interval();

        if engine.config().enable_tracker && !self.trackers.is_empty() {
            let request = AnnounceRequest {
                uploaded: session.uploaded(),
                downloaded: session.downloaded(),
                left: session.left().await,
                event,
                ..AnnounceRequest::new(info_hash, engine.peer_id(), port)
            };
            let summary = engine
                .tracker()
                .announce_all(&self.trackers, &request, engine.peers())
                .await;
            if let Some(interval) = summary.interval {
                wait = interval;
            }
        }

        if let Some(dht) = engine.dht() {
            match dht.lookup_peers(info_hash).await {
                Ok(found) => {
                    debug!("DHT returned {} peers for {}", found.len(), info_hash);
                    dht.announce(info_hash, port).await;
                }
                Err(e) => debug!("DHT lookup for {} failed: {}", info_hash, e),
            }
        }

        if let Some(lsd) = engine.lsd() {
            if let Err(e) = lsd.announce().await {
                debug!("LSD announce failed: {}", e);
            }
        }
        wait
    }

    /// Dial known peers until the connection limit is reached
    async fn connect_peers(&self, session: &Arc<TorrentSession>) {
        let engine = &self.engine;
        let info_hash = session.info_hash();
        let active = engine.reactor().channel_count(&info_hash).await;
        let limit = engine.config().max_connections;
        if active >= limit {
            return;
        }
        for addr in engine.peers().connectable(&info_hash, limit - active).await {
            if addr == engine.listen_addr() {
                continue;
            }
            if !engine.peers().mark_connecting(&PeerKey::new(addr, info_hash)).await {
                continue;
            }
            let session = Arc::clone(session);
            let ctx = Arc::clone(engine.peer_context());
            engine
                .reactor()
                .spawn_channel(info_hash, async move {
                    if let Err(e) = PeerConnection::connect(addr, session, ctx).await {
                        debug!("Peer {} closed: {}", addr, e);
                    }
                })
                .await;
        }
    }
}

#[async_trait]
impl Transfer for TorrentTransfer {
    async fn open(&mut self) -> Result<()> {
        let metadata = self.resolve_metadata().await?;
        metadata.check_selection(&self.task.description)?;
        let info_hash = metadata.info_hash;
        if self.engine.torrents().get(&info_hash).await.is_some() {
            return Err(TorrentError::task_error(
                format!("Torrent {} is already active", info_hash),
                self.task.id.clone(),
            )
            .into());
        }

        for url in &metadata.announce_list {
            if !self.trackers.contains(url) {
                self.trackers.push(url.clone());
            }
        }
        self.size = metadata.selected_size(&self.task.description);

        let bytes: Arc<dyn ByteStorage> = Arc::new(FileByteStorage::new(&self.task.file, metadata.files.clone()));
        let factory = select_factory(self.seeding, &bytes).await?;
        let pieces = factory.create(&metadata, bytes).await?;

        let config = self.engine.config();
        let session = TorrentSession::new(
            Arc::new(metadata),
            pieces,
            &self.task.description,
            config.block_size,
            self.engine.reactor().disk_pool(),
            Arc::clone(self.engine.events()),
        )
        .await;
        self.session = Some(self.engine.torrents().attach(session).await);
        info!("Opened task {} for torrent {}", self.task.id, info_hash);
        Ok(())
    }

    async fn download(&mut self, mut stop: Shutdown) -> Result<()> {
        let session = self.require_session()?;
        let info_hash = session.info_hash();
        let budget = self.engine.config().retry_budget;
        if let Some(lsd) = self.engine.lsd() {
            lsd.track(info_hash).await;
        }

        let mut engine_stop = self.engine.reactor().shutdown_signal();
        let mut progress = session.subscribe_progress();
        let mut tick = interval(PEER_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next_round = Instant::now();
        let mut rounds = 0u32;
        let mut stalled = 0u32;
        let mut last_available = session.storage().available_count().await;

        loop {
            if let Some(cause) = session.failure().await {
                return Err(TorrentError::storage_error(cause).into());
            }
            if session.is_complete().await {
                info!("Torrent {} complete", info_hash);
                if self.started {
                    self.discover(&session, AnnounceEvent::Completed).await;
                }
                return Ok(());
            }

            if Instant::now() >= next_round {
                let event = if self.started { AnnounceEvent::None } else { AnnounceEvent::Started };
                let wait = self.discover(&session, event).await;
                self.started = true;
                next_round = Instant::now() + wait;

                let available = session.storage().available_count().await;
                if rounds > 0 && available == last_available {
                    stalled += 1;
                    debug!("No progress on {} for {} rounds", info_hash, stalled);
                } else {
                    stalled = 0;
                }
                last_available = available;
                rounds += 1;
                if stalled > budget {
                    return Err(TorrentError::task_error(
                        format!("No download progress after {} announce rounds", stalled),
                        self.task.id.clone(),
                    )
                    .into());
                }
            }

            self.connect_peers(&session).await;
            tokio::select! {
                _ = stop.triggered() => {
                    debug!("Task {} stopped", self.task.id);
                    return Ok(());
                }
                _ = engine_stop.triggered() => return Ok(()),
                _ = progress.changed() => trace!("Progress on {}", info_hash),
                _ = tick.tick() => {}
            }
        }
    }

    async fn check_completed(&self) -> Result<bool> {
        let session = self.require_session()?;
        let left = session.left().await;
        Ok(session.is_complete().await && check_finish(0, self.size.saturating_sub(left), self.size))
    }

    async fn release(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let engine = &self.engine;
        let info_hash = session.info_hash();

        if self.started && engine.config().enable_tracker && !self.trackers.is_empty() {
            let request = AnnounceRequest {
                uploaded: session.uploaded(),
                downloaded: session.downloaded(),
                left: session.left().await,
                event: AnnounceEvent::Stopped,
                ..AnnounceRequest::new(info_hash, engine.peer_id(), engine.listen_addr().port())
            };
            for url in &self.trackers {
                if let Err(e) = engine.tracker().announce(url, &request).await {
                    debug!("Stopped announce to {} failed: {}", url, e);
                }
            }
        }
        if let Some(lsd) = engine.lsd() {
            lsd.untrack(&info_hash).await;
        }
        if let Some(dht) = engine.dht() {
            dht.forget(&info_hash).await;
        }
        engine.tracker().forget(&info_hash).await;

        session.close_channels().await;
        let closed = engine.reactor().close_channels(&info_hash).await;
        let removed = engine.peers().remove_torrent(&info_hash).await;
        engine.torrents().remove(&info_hash).await;
        // late incoming channels may still hold the session
        if let Err(e) = session.storage().close_fully().await {
            warn!("Closing storage of {} failed: {}", info_hash, e);
        }
        info!(
            "Released {}: {} channels closed, {} peers dropped",
            info_hash, closed, removed
        );
    }

    fn name(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.metadata().name.clone())
    }

    fn size(&self) -> u64 {
        self.size
    }
}
