//! Reactor
//!
//! Owns the shutdown signal, the per-torrent channel sets and the bounded
//! blocking pool used for hashing and other CPU-bound disk work.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;
use crate::torrent::info::InfoHash;

/// Receiving side of the engine-wide shutdown signal
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl From<watch::Receiver<bool>> for Shutdown {
    fn from(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }
}

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown was requested or the reactor is gone
    pub async fn triggered(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug)]
pub struct Reactor {
    shutdown_tx: watch::Sender<bool>,
    channels: Mutex<HashMap<InfoHash, JoinSet<()>>>,
    services: Mutex<JoinSet<()>>,
    disk: Arc<Semaphore>,
}

impl Reactor {
    pub fn new(disk_workers: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            channels: Mutex::new(HashMap::new()),
            services: Mutex::new(JoinSet::new()),
            disk: Arc::new(Semaphore::new(disk_workers.max(1))),
        }
    }

    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown {
            rx: self.shutdown_tx.subscribe(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn an engine-wide loop (listener, DHT, LSD) or an incoming channel
    pub async fn spawn_service<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut services = self.services.lock().await;
        reap(&mut services, "Service");
        services.spawn(future);
    }

    /// Spawn a peer channel owned by one torrent
    pub async fn spawn_channel<F>(&self, info_hash: InfoHash, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut channels = self.channels.lock().await;
        let set = channels.entry(info_hash).or_default();
        reap(set, "Channel");
        set.spawn(future);
        trace!("Torrent {} has {} channel tasks", info_hash, set.len());
    }

    /// Channels of `info_hash` that have not finished yet
    pub async fn channel_count(&self, info_hash: &InfoHash) -> usize {
        let mut channels = self.channels.lock().await;
        match channels.get_mut(info_hash) {
            Some(set) => {
                while set.try_join_next().is_some() {}
                set.len()
            }
            None => 0,
        }
    }

    /// Abort every channel of a torrent
    pub async fn close_channels(&self, info_hash: &InfoHash) -> usize {
        let set = self.channels.lock().await.remove(info_hash);
        match set {
            Some(mut set) => {
                let count = set.len();
                set.shutdown().await;
                debug!("Closed {} channels of {}", count, info_hash);
                count
            }
            None => 0,
        }
    }

    /// Run CPU-bound work on the bounded blocking pool
    pub async fn run_blocking<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(&self.disk, work).await
    }

    pub fn disk_pool(&self) -> Arc<Semaphore> {
        Arc::clone(&self.disk)
    }

    /// Signal every loop to stop
    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!("Reactor shutting down");
        }
    }

    /// Signal shutdown, abort all channels and wait for the services to exit
    pub async fn shutdown_and_wait(&self) {
        self.shutdown();
        let channels: Vec<JoinSet<()>> = self.channels.lock().await.drain().map(|(_, set)| set).collect();
        for mut set in channels {
            set.shutdown().await;
        }
        let mut services = self.services.lock().await;
        while let Some(result) = services.join_next().await {
            if let Err(e) = result {
                warn!("Service task ended abnormally: {}", e);
            }
        }
    }
}

/// Drop finished tasks from `set`
fn reap(set: &mut JoinSet<()>, kind: &str) {
    while let Some(result) = set.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                warn!("{} task panicked: {}", kind, e);
            }
        }
    }
}

/// Acquire a pool permit and run `work` on a blocking thread
pub async fn run_blocking<F, T>(pool: &Semaphore, work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let _permit = pool
        .acquire()
        .await
        .map_err(|e| TorrentError::task_error("Disk pool closed", e.to_string()))?;
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| TorrentError::task_error("Blocking task failed", e.to_string()).into())
}
