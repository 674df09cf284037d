//! Engine events
//!
//! Plain notifications for whoever embeds the engine. Rendering is the
//! caller's business.

use std::fmt::Debug;
use std::net::SocketAddr;

use tokio::sync::mpsc::UnboundedSender;

use crate::downloader::task::TaskStatus;
use crate::torrent::info::InfoHash;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TaskStatusChanged { task_id: String, status: TaskStatus },
    TaskCompleted { task_id: String },
    /// Emitted once per failed run with a human readable cause
    TaskFailed { task_id: String, cause: String },
    PeerConnected { info_hash: InfoHash, addr: SocketAddr },
    PeerDisconnected { info_hash: InfoHash, addr: SocketAddr },
    PieceSaved {
        info_hash: InfoHash,
        index: usize,
        available: usize,
        total: usize,
    },
}

pub trait EventSink: Send + Sync + Debug {
    fn emit(&self, event: EngineEvent);
}

impl EventSink for UnboundedSender<EngineEvent> {
    fn emit(&self, event: EngineEvent) {
        // a dropped receiver only means nobody listens
        let _ = self.send(event);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: EngineEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_channel_sink_delivers_and_tolerates_closed_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.emit(EngineEvent::TaskCompleted { task_id: "t1".into() });
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineEvent::TaskCompleted { task_id: "t1".into() }
        );
        drop(rx);
        tx.emit(EngineEvent::TaskCompleted { task_id: "t2".into() });
        NoopEventSink.emit(EngineEvent::TaskCompleted { task_id: "t3".into() });
    }
}
