//! Tracker client
//!
//! Keeps one [`TrackerState`] per (torrent, tracker URL). A tracker that
//! fails or answers with a malformed reply is unusable until its next
//! scheduled announce and is skipped by [`TrackerClient::announce_all`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Result;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::http::HttpTracker;
use super::udp::UdpTracker;
use super::{AnnounceRequest, AnnounceResponse, ScrapeStats};
use crate::error::TorrentError;
use crate::peer::state::PeerSource;
use crate::peer::table::PeerTable;
use crate::torrent::info::InfoHash;

/// Interval assumed before a tracker told us one
const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone)]
pub struct TrackerState {
    pub url: String,
    pub interval: Duration,
    pub last_announce: Option<Instant>,
    pub unusable_until: Option<Instant>,
    pub failures: u32,
    pub last_error: Option<String>,
    pub seeders: u32,
    pub leechers: u32,
}

impl TrackerState {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            interval: DEFAULT_INTERVAL,
            last_announce: None,
            unusable_until: None,
            failures: 0,
            last_error: None,
            seeders: 0,
            leechers: 0,
        }
    }

    pub fn is_usable(&self, now: Instant) -> bool {
        self.unusable_until.map_or(true, |until| now >= until)
    }
}

/// Result of one announce round over all trackers of a torrent
#[derive(Debug, Clone, Default)]
pub struct AnnounceSummary {
    pub peers: Vec<SocketAddr>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Shortest interval any tracker asked for
    pub interval: Option<Duration>,
}

#[derive(Debug)]
pub struct TrackerClient {
    http: Client,
    timeout: Duration,
    min_interval: Duration,
    states: Mutex<HashMap<(InfoHash, String), TrackerState>>,
}

impl TrackerClient {
    pub fn new(timeout: Duration, min_interval: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpTracker::client(timeout)?,
            timeout,
            min_interval,
            states: Mutex::new(HashMap::new()),
        })
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Announce to one tracker and record the outcome in its state
    pub async fn announce(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let result = self.dispatch(url, request).await;
        let now = Instant::now();
        let mut states = self.states.lock().await;
        let state = states
            .entry((request.info_hash, url.to_string()))
            .or_insert_with(|| TrackerState::new(url));
        state.last_announce = Some(now);

        match &result {
            Ok(response) => {
                let asked = response.min_interval.unwrap_or(0).max(response.interval);
                state.interval = Duration::from_secs(asked as u64).max(self.min_interval);
                state.unusable_until = None;
                state.failures = 0;
                state.last_error = None;
                state.seeders = response.complete;
                state.leechers = response.incomplete;
            }
            Err(e) => {
                let backoff = state.interval.max(self.min_interval);
                state.unusable_until = Some(now + backoff);
                state.failures += 1;
                state.last_error = Some(e.to_string());
                warn!("Tracker {} unusable for {:?}: {}", url, backoff, e);
            }
        }
        result
    }

    async fn dispatch(&self, url: &str, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        if url.starts_with("http://") || url.starts_with("https://") {
            HttpTracker::new(url, self.http.clone()).announce(request).await
        } else if url.starts_with("udp://") {
            UdpTracker::new(url, self.timeout).announce(request).await
        } else {
            Err(TorrentError::validation_error_with_field(format!("Unsupported tracker scheme: {}", url), "announce").into())
        }
    }

    pub async fn is_usable(&self, info_hash: &InfoHash, url: &str) -> bool {
        self.states
            .lock()
            .await
            .get(&(*info_hash, url.to_string()))
            .map_or(true, |s| s.is_usable(Instant::now()))
    }

    pub async fn state(&self, info_hash: &InfoHash, url: &str) -> Option<TrackerState> {
        self.states.lock().await.get(&(*info_hash, url.to_string())).cloned()
    }

    /// Announce to every usable tracker and feed the peers into `peers`
    pub async fn announce_all(
        &self,
        urls: &[String],
        request: &AnnounceRequest,
        peers: &PeerTable,
    ) -> AnnounceSummary {
        let mut summary = AnnounceSummary::default();
        for url in urls {
            if !self.is_usable(&request.info_hash, url).await {
                debug!("Skipping unusable tracker {}", url);
                summary.skipped += 1;
                continue;
            }
            match self.announce(url, request).await {
                Ok(response) => {
                    summary.succeeded += 1;
                    let interval = Duration::from_secs(response.interval as u64).max(self.min_interval);
                    summary.interval = Some(summary.interval.map_or(interval, |i| i.min(interval)));
                    for peer in response.peers {
                        if !summary.peers.contains(&peer) {
                            summary.peers.push(peer);
                        }
                    }
                }
                Err(_) => summary.failed += 1,
            }
        }

        let added = peers
            .upsert_all(&summary.peers, request.info_hash, PeerSource::Tracker)
            .await;
        info!(
            "Announced {} ({}) to {} trackers: {} peers, {} new, {} failed, {} skipped",
            request.info_hash,
            request.event,
            summary.succeeded,
            summary.peers.len(),
            added,
            summary.failed,
            summary.skipped
        );
        summary
    }

    /// Scrape an HTTP tracker
    pub async fn scrape(&self, url: &str, hashes: &[InfoHash]) -> Result<HashMap<InfoHash, ScrapeStats>> {
        HttpTracker::new(url, self.http.clone()).scrape(hashes).await
    }

    /// Drop every tracker state of a removed torrent
    pub async fn forget(&self, info_hash: &InfoHash) {
        self.states.lock().await.retain(|(hash, _), _| hash != info_hash);
    }
}
