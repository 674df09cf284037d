//! Torrent context
//!
//! Arena of live [`TorrentSession`]s keyed by info-hash. Peer channels and
//! tasks look sessions up here instead of holding back-pointers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use super::torrent::TorrentSession;
use crate::torrent::info::InfoHash;

#[derive(Debug, Default)]
pub struct TorrentContext {
    sessions: RwLock<HashMap<InfoHash, Arc<TorrentSession>>>,
}

impl TorrentContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, info_hash: &InfoHash) -> Option<Arc<TorrentSession>> {
        self.sessions.read().await.get(info_hash).cloned()
    }

    /// Insert `session` unless one already exists; returns the live session
    pub async fn attach(&self, session: TorrentSession) -> Arc<TorrentSession> {
        let mut sessions = self.sessions.write().await;
        let info_hash = session.info_hash();
        Arc::clone(sessions.entry(info_hash).or_insert_with(|| {
            debug!("Attached session {}", info_hash);
            Arc::new(session)
        }))
    }

    pub async fn remove(&self, info_hash: &InfoHash) -> Option<Arc<TorrentSession>> {
        let removed = self.sessions.write().await.remove(info_hash);
        if removed.is_some() {
            debug!("Detached session {}", info_hash);
        }
        removed
    }

    pub async fn info_hashes(&self) -> Vec<InfoHash> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::torrent::tests::{payload, session};

    #[tokio::test]
    async fn test_attach_keeps_first_session() {
        let context = TorrentContext::new();
        let data = payload(100);
        let first = context.attach(session(&data, &[]).await).await;
        let second = context.attach(session(&data, &["t/a".to_string()]).await).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(context.len().await, 1);
        assert!(context.get(&first.info_hash()).await.is_some());
        assert!(context.remove(&first.info_hash()).await.is_some());
        assert!(context.is_empty().await);
    }
}
