//! Peer connection module
//!
//! One peer-wire channel: handshake, then the message loop that exchanges
//! pieces with the remote side.
//!
//! Outgoing channels go `ConnectPending -> HandshakeSent -> HandshakeReceived
//! -> MessageLoop -> Closed`; incoming ones start at `HandshakeReceived`.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bit_vec::BitVec;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::dht::Dht;
use crate::engine::events::EngineEvent;
use crate::error::TorrentError;
use crate::peer::state::{PeerKey, PeerSource};
use crate::peer::table::PeerTable;
use crate::protocol::{BlockRequest, Handshake, Message, Wire};
use crate::session::{PeerCommand, PieceAssembly, TorrentContext, TorrentSession};

/// Queued upload requests per channel
const MAX_UPLOAD_QUEUE: usize = 256;

/// Messages buffered between the reader task and the loop
const INBOX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ConnectPending,
    HandshakeSent,
    HandshakeReceived,
    MessageLoop,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::ConnectPending => "connect-pending",
            ConnectionState::HandshakeSent => "handshake-sent",
            ConnectionState::HandshakeReceived => "handshake-received",
            ConnectionState::MessageLoop => "message-loop",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    /// Outstanding block requests per channel
    pub pipeline_depth: usize,
    pub keepalive_interval: Duration,
    /// Close the channel after this long without any message
    pub idle_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pipeline_depth: 5,
            keepalive_interval: Duration::from_secs(90),
            idle_timeout: Duration::from_secs(180),
        }
    }
}

/// Shared dependencies of every channel
#[derive(Debug)]
pub struct PeerContext {
    pub peer_id: [u8; 20],
    pub peers: Arc<PeerTable>,
    pub config: ConnectionConfig,
    pub dht: Option<Arc<Dht>>,
}

impl PeerContext {
    pub fn new(peer_id: [u8; 20], peers: Arc<PeerTable>, config: ConnectionConfig) -> Self {
        Self {
            peer_id,
            peers,
            config,
            dht: None,
        }
    }

    pub fn with_dht(mut self, dht: Arc<Dht>) -> Self {
        self.dht = Some(dht);
        self
    }

    fn handshake(&self, session: &TorrentSession) -> Handshake {
        Handshake::new(session.info_hash(), self.peer_id)
    }
}

/// A peer-wire channel bound to one torrent session
pub struct PeerConnection {
    addr: SocketAddr,
    key: PeerKey,
    state: ConnectionState,
    session: Arc<TorrentSession>,
    ctx: Arc<PeerContext>,
    wire: Wire,
    remote_bitfield: BitVec,
    remote_dht: bool,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    assembly: Option<PieceAssembly>,
    uploads: VecDeque<BlockRequest>,
    last_received: Instant,
}

impl PeerConnection {
    fn new(addr: SocketAddr, session: Arc<TorrentSession>, ctx: Arc<PeerContext>, state: ConnectionState) -> Self {
        let pieces = session.metadata().piece_count();
        Self {
            addr,
            key: PeerKey::new(addr, session.info_hash()),
            state,
            wire: Wire::new(session.block_size(), pieces),
            remote_bitfield: BitVec::from_elem(pieces, false),
            remote_dht: false,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            assembly: None,
            uploads: VecDeque::new(),
            last_received: Instant::now(),
            session,
            ctx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!("Peer {} {} -> {}", self.addr, self.state, next);
        self.state = next;
    }

    /// Dial a peer and run the channel until it closes
    pub async fn connect(addr: SocketAddr, session: Arc<TorrentSession>, ctx: Arc<PeerContext>) -> Result<()> {
        let mut conn = Self::new(addr, session, ctx, ConnectionState::ConnectPending);
        if !conn.ctx.peers.contains(&conn.key).await {
            conn.ctx.peers.upsert(addr, conn.key.info_hash, PeerSource::Manual).await;
        }

        match conn.outbound_handshake().await {
            Ok((stream, handshake)) => conn.run(stream, handshake).await,
            Err(e) => {
                conn.transition(ConnectionState::Closed);
                if TorrentError::find(&e).is_some_and(|err| err.is_protocol_violation()) {
                    debug!("Dropping peer {} after bad handshake: {}", addr, e);
                    conn.ctx.peers.remove(&conn.key).await;
                } else {
                    conn.ctx.peers.mark_failed(&conn.key).await;
                }
                Err(e)
            }
        }
    }

    async fn outbound_handshake(&mut self) -> Result<(TcpStream, Handshake)> {
        let addr = self.addr;
        debug!("Connecting to peer: {}", addr);
        let mut stream = timeout(self.ctx.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|e| {
                debug!("Connection timeout to {}", addr);
                TorrentError::network_error_full("Connection timeout", addr.to_string(), e.to_string())
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", addr, e);
                TorrentError::network_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;

        let ours = self.ctx.handshake(&self.session);
        self.wire.write_handshake(&mut stream, &ours).await?;
        self.transition(ConnectionState::HandshakeSent);

        let theirs = timeout(self.ctx.config.connect_timeout, self.wire.read_handshake(&mut stream))
            .await
            .map_err(|e| TorrentError::peer_error_full("Handshake timeout", addr.to_string(), e.to_string()))??;
        theirs.expect_info_hash(&self.session.info_hash())?;
        self.transition(ConnectionState::HandshakeReceived);
        Ok((stream, theirs))
    }

    /// Serve an incoming connection; the torrent is chosen by the remote handshake
    pub async fn accept(mut stream: TcpStream, context: &TorrentContext, ctx: Arc<PeerContext>) -> Result<()> {
        let addr = stream.peer_addr()?;
        let reader = Wire::new(0, 0);
        let theirs = timeout(ctx.config.connect_timeout, reader.read_handshake(&mut stream))
            .await
            .map_err(|e| TorrentError::peer_error_full("Handshake timeout", addr.to_string(), e.to_string()))??;

        let Some(session) = context.get(&theirs.info_hash).await else {
            debug!("Incoming peer {} asked for unknown torrent {}", addr, theirs.info_hash);
            return Err(TorrentError::protocol_error_with_source("Unknown info hash", theirs.info_hash.to_string()).into());
        };

        let mut conn = Self::new(addr, session, ctx, ConnectionState::HandshakeReceived);
        let ours = conn.ctx.handshake(&conn.session);
        conn.wire.write_handshake(&mut stream, &ours).await?;
        conn.ctx
            .peers
            .upsert(addr, conn.key.info_hash, PeerSource::Incoming)
            .await;
        conn.run(stream, theirs).await
    }

    async fn run(mut self, stream: TcpStream, handshake: Handshake) -> Result<()> {
        self.transition(ConnectionState::MessageLoop);
        self.remote_dht = handshake.supports_dht();
        self.ctx.peers.mark_connected(&self.key, handshake.peer_id).await;
        let remote_dht = self.remote_dht;
        self.ctx
            .peers
            .update(&self.key, |s| s.supports_dht = remote_dht)
            .await;

        let (commands_tx, commands) = mpsc::unbounded_channel();
        self.session.register_channel(self.addr, commands_tx).await;
        self.session.emit(EngineEvent::PeerConnected {
            info_hash: self.key.info_hash,
            addr: self.addr,
        });
        info!("Peer {} connected for {}", self.addr, self.key.info_hash);

        let (mut reader, mut writer) = stream.into_split();
        let (inbox_tx, inbox) = mpsc::channel(INBOX_DEPTH);
        let wire = self.wire;
        let reader_task = tokio::spawn(async move {
            loop {
                let result = wire.read_message(&mut reader).await;
                if let Err(e) = &result {
                    if is_eof(e) {
                        break;
                    }
                }
                let failed = result.is_err();
                if inbox_tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });

        let result = self.message_loop(&mut writer, inbox, commands).await;
        reader_task.abort();
        self.close().await;

        match &result {
            Ok(()) => debug!("Peer {} closed", self.addr),
            Err(e) => match TorrentError::find(e) {
                Some(err) if err.is_protocol_violation() => warn!("Dropping peer {}: {}", self.addr, e),
                Some(TorrentError::StorageError { .. }) => error!("Storage failure with peer {}: {}", self.addr, e),
                _ => debug!("Peer {} disconnected: {}", self.addr, e),
            },
        }
        result
    }

    async fn message_loop<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        mut inbox: mpsc::Receiver<Result<Message>>,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
    ) -> Result<()> {
        let bitfield = self.session.storage().bitfield_bytes().await;
        if bitfield.iter().any(|b| *b != 0) {
            self.send(writer, Message::Bitfield { bitfield }).await?;
        }
        if self.remote_dht {
            if let Some(dht) = &self.ctx.dht {
                let listen_port = dht.local_addr().port();
                self.send(writer, Message::Port { listen_port }).await?;
            }
        }

        let mut keepalive = interval(self.ctx.config.keepalive_interval);
        keepalive.tick().await;
        loop {
            tokio::select! {
                received = inbox.recv() => {
                    let Some(message) = received else {
                        return Ok(());
                    };
                    self.last_received = Instant::now();
                    self.handle_message(writer, message?).await?;
                }
                command = commands.recv() => match command {
                    Some(PeerCommand::Have(index)) => {
                        self.send(writer, Message::Have { piece_index: index }).await?;
                    }
                    Some(PeerCommand::Close) | None => return Ok(()),
                },
                _ = keepalive.tick() => {
                    if self.last_received.elapsed() > self.ctx.config.idle_timeout {
                        return Err(TorrentError::peer_error_with_peer("Peer idle", self.addr.to_string()).into());
                    }
                    self.send(writer, Message::KeepAlive).await?;
                }
            }
            self.update_interest(writer).await?;
            self.fill_requests(writer).await?;
            self.serve_uploads(writer).await?;
            self.publish_flags().await;
        }
    }

    /// Mirror the choke/interest flags into the peer table
    async fn publish_flags(&self) {
        let (am_choking, am_interested) = (self.am_choking, self.am_interested);
        let (peer_choking, peer_interested) = (self.peer_choking, self.peer_interested);
        self.ctx
            .peers
            .update(&self.key, |s| {
                s.am_choking = am_choking;
                s.am_interested = am_interested;
                s.peer_choking = peer_choking;
                s.peer_interested = peer_interested;
            })
            .await;
    }

    async fn send<W: AsyncWrite + Unpin>(&self, writer: &mut W, message: Message) -> Result<()> {
        trace!("Sending {:?} to {}", message.message_id(), self.addr);
        self.wire.write_message(writer, &message).await.map_err(|e| {
            TorrentError::peer_error_full("Failed to send message", self.addr.to_string(), e.to_string()).into()
        })
    }

    fn check_index(&self, index: u32) -> Result<usize> {
        let index = index as usize;
        if index >= self.remote_bitfield.len() {
            return Err(TorrentError::protocol_error_with_source(
                "Piece index out of range",
                format!("{} from {}", index, self.addr),
            )
            .into());
        }
        Ok(index)
    }

    async fn handle_message<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, message: Message) -> Result<()> {
        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking = true;
                // pending requests are void; let other channels take the piece
                if let Some(assembly) = self.assembly.take() {
                    trace!("Choked by {}, releasing piece {}", self.addr, assembly.index());
                    self.session.release_piece(assembly.index()).await;
                }
            }
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => {
                self.peer_interested = true;
                if self.am_choking {
                    self.am_choking = false;
                    self.send(writer, Message::Unchoke).await?;
                }
            }
            Message::NotInterested => self.peer_interested = false,
            Message::Have { piece_index } => {
                let index = self.check_index(piece_index)?;
                self.remote_bitfield.set(index, true);
                let pieces = self.remote_bitfield.len();
                self.ctx.peers.update(&self.key, |s| s.set_have(index, pieces)).await;
            }
            Message::Bitfield { bitfield } => {
                let pieces = self.remote_bitfield.len();
                if bitfield.len() != pieces.div_ceil(8) {
                    return Err(TorrentError::protocol_error_with_source(
                        "Bitfield length mismatch",
                        format!("{} bytes for {} pieces", bitfield.len(), pieces),
                    )
                    .into());
                }
                let mut bits = BitVec::from_bytes(&bitfield);
                bits.truncate(pieces);
                self.remote_bitfield = bits.clone();
                self.ctx.peers.update(&self.key, |s| s.bitfield = Some(bits)).await;
            }
            Message::Request(request) => self.queue_upload(request).await?,
            Message::Piece { index, begin, block } => self.receive_block(index, begin, block).await?,
            Message::Cancel(request) => self.uploads.retain(|r| r != &request),
            Message::Port { listen_port } => {
                self.ctx.peers.update(&self.key, |s| s.dht_port = Some(listen_port)).await;
                if let Some(dht) = &self.ctx.dht {
                    let node = SocketAddr::new(self.addr.ip(), listen_port);
                    let dht = Arc::clone(dht);
                    tokio::spawn(async move {
                        if let Err(e) = dht.ping(node).await {
                            trace!("DHT ping to {} failed: {}", node, e);
                        }
                    });
                }
            }
            Message::Unknown { id, payload } => {
                debug!("Skipping unknown message id {} ({} bytes) from {}", id, payload.len(), self.addr);
            }
        }
        Ok(())
    }

    async fn queue_upload(&mut self, request: BlockRequest) -> Result<()> {
        let index = self.check_index(request.index)?;
        if self.am_choking {
            trace!("Ignoring request from choked peer {}", self.addr);
            return Ok(());
        }
        let piece_len = self.session.metadata().piece_len(index);
        let end = request.begin as u64 + request.length as u64;
        if request.length == 0 || request.length as usize > self.session.block_size() || end > piece_len {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid block request",
                format!("{:?} from {}", request, self.addr),
            )
            .into());
        }
        if self.uploads.len() < MAX_UPLOAD_QUEUE && !self.uploads.contains(&request) {
            self.uploads.push_back(request);
        }
        Ok(())
    }

    async fn receive_block(&mut self, index: u32, begin: u32, block: Vec<u8>) -> Result<()> {
        let Some(assembly) = self.assembly.as_mut() else {
            trace!("Unexpected block {}:{} from {}", index, begin, self.addr);
            return Ok(());
        };
        if assembly.index() != index as usize {
            trace!("Stale block {}:{} from {}", index, begin, self.addr);
            return Ok(());
        }
        assembly.add_block(begin, &block)?;
        self.ctx
            .peers
            .update(&self.key, |s| s.downloaded += block.len() as u64)
            .await;
        if !assembly.is_complete() {
            return Ok(());
        }

        let Some(assembly) = self.assembly.take() else {
            return Ok(());
        };
        let index = assembly.index();
        trace!("Piece {} assembled from {} in {:?}", index, self.addr, assembly.elapsed());
        match self.session.complete_piece(index, assembly.into_data()).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.ctx.peers.mark_failed(&self.key).await;
                Err(TorrentError::peer_error_with_peer("Sent corrupt piece", self.addr.to_string()).into())
            }
            Err(e) => {
                self.session.fail(e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn update_interest<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<()> {
        let interested = self.assembly.is_some() || self.session.wants_any(&self.remote_bitfield).await;
        if interested != self.am_interested {
            self.am_interested = interested;
            let message = if interested { Message::Interested } else { Message::NotInterested };
            self.send(writer, message).await?;
        }
        Ok(())
    }

    async fn fill_requests<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<()> {
        if self.peer_choking || !self.am_interested {
            return Ok(());
        }
        if self.assembly.is_none() {
            if let Some(index) = self.session.pick_piece(&self.remote_bitfield).await {
                let length = self.session.metadata().piece_len(index) as usize;
                self.assembly = Some(PieceAssembly::new(index, length, self.session.block_size()));
            }
        }
        let depth = self.ctx.config.pipeline_depth.max(1);
        let mut requests = Vec::new();
        if let Some(assembly) = self.assembly.as_mut() {
            while assembly.outstanding() < depth {
                match assembly.next_request() {
                    Some(request) => requests.push(request),
                    None => break,
                }
            }
        }
        for request in requests {
            self.send(writer, Message::Request(request)).await?;
        }
        Ok(())
    }

    async fn serve_uploads<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> Result<()> {
        while let Some(request) = self.uploads.pop_front() {
            if self.am_choking {
                self.uploads.clear();
                break;
            }
            let block = match self.session.read_block(&request).await {
                Ok(block) => block,
                Err(e) => {
                    debug!("Cannot serve {:?} to {}: {}", request, self.addr, e);
                    continue;
                }
            };
            let length = block.len() as u64;
            self.send(
                writer,
                Message::Piece {
                    index: request.index,
                    begin: request.begin,
                    block,
                },
            )
            .await?;
            self.ctx.peers.update(&self.key, |s| s.uploaded += length).await;
        }
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(assembly) = self.assembly.take() {
            self.session.release_piece(assembly.index()).await;
        }
        self.session.unregister_channel(&self.addr).await;
        self.ctx.peers.remove(&self.key).await;
        self.transition(ConnectionState::Closed);
        self.session.emit(EngineEvent::PeerDisconnected {
            info_hash: self.key.info_hash,
            addr: self.addr,
        });
    }
}

/// Remote closed the stream between or inside a frame
fn is_eof(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::NoopEventSink;
    use crate::session::torrent::tests::{metadata, payload, PIECE};
    use crate::storage::backend::{ByteStorage, MemoryByteStorage};
    use crate::storage::piece::PieceStorage;
    use crate::torrent::info::InfoHash;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::Semaphore;

    async fn make_session(data: &[u8], complete: bool) -> TorrentSession {
        let meta = metadata(data, &[("t/a", 40), ("t/b", data.len() as u64 - 40)]);
        let storage = if complete {
            let store: Arc<dyn ByteStorage> = Arc::new(MemoryByteStorage::with_data(data.to_vec()));
            PieceStorage::complete(store, PIECE as u64).unwrap()
        } else {
            let store: Arc<dyn ByteStorage> = Arc::new(MemoryByteStorage::new(data.len() as u64));
            PieceStorage::empty(store, PIECE as u64).unwrap()
        };
        TorrentSession::new(meta, storage, &[], 16, Arc::new(Semaphore::new(2)), Arc::new(NoopEventSink)).await
    }

    fn context(byte: u8) -> Arc<PeerContext> {
        let config = ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            pipeline_depth: 3,
            ..ConnectionConfig::default()
        };
        Arc::new(PeerContext::new([byte; 20], Arc::new(PeerTable::new()), config))
    }

    #[tokio::test]
    async fn test_leecher_downloads_everything_from_seeder() {
        let data = payload(100);
        let torrents = Arc::new(TorrentContext::new());
        let seeder = torrents.attach(make_session(&data, true).await).await;
        let leecher = Arc::new(make_session(&data, false).await);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seed_ctx = context(1);
        let accept_torrents = Arc::clone(&torrents);
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            PeerConnection::accept(stream, &accept_torrents, seed_ctx).await
        });

        let leech_ctx = context(2);
        let client = tokio::spawn(PeerConnection::connect(addr, Arc::clone(&leecher), Arc::clone(&leech_ctx)));

        let mut progress = leecher.subscribe_progress();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *progress.borrow_and_update() < 4 {
                progress.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        assert!(leecher.storage().is_finished().await);
        assert_eq!(leecher.downloaded(), 100);
        assert_eq!(leecher.in_flight_count().await, 0);
        let stored = leecher.storage().read_piece_part(3, 0, 4).await.unwrap();
        assert_eq!(stored, data[96..].to_vec());

        leecher.close_channels().await;
        tokio::time::timeout(Duration::from_secs(2), client).await.unwrap().unwrap().unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(2), server).await.unwrap().unwrap();
        assert_eq!(seeder.uploaded(), 100);
        assert_eq!(leecher.channel_count().await, 0);
        assert!(leech_ctx.peers.is_empty().await);
    }

    #[tokio::test]
    async fn test_wrong_info_hash_closes_and_drops_peer() {
        let data = payload(100);
        let leecher = Arc::new(make_session(&data, false).await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let wire = Wire::new(16, 4);
            let _ = wire.read_handshake(&mut stream).await.unwrap();
            let reply = Handshake::new(InfoHash([0xee; 20]), [3; 20]);
            wire.write_handshake(&mut stream, &reply).await.unwrap();
        });

        let ctx = context(2);
        let err = PeerConnection::connect(addr, Arc::clone(&leecher), Arc::clone(&ctx))
            .await
            .unwrap_err();
        server.await.unwrap();
        assert!(TorrentError::find(&err).unwrap().is_protocol_violation());

        assert!(!ctx.peers.contains(&PeerKey::new(addr, leecher.info_hash())).await);
        assert_eq!(leecher.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_refused_connect_counts_failure() {
        let data = payload(100);
        let leecher = Arc::new(make_session(&data, false).await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let ctx = context(2);
        let err = PeerConnection::connect(addr, Arc::clone(&leecher), Arc::clone(&ctx))
            .await
            .unwrap_err();
        assert!(!TorrentError::find(&err).unwrap().is_protocol_violation());
        let session = ctx.peers.get(&PeerKey::new(addr, leecher.info_hash())).await.unwrap();
        assert_eq!(session.failures, 1);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_choke_releases_claimed_piece() {
        let data = payload(100);
        let leecher = Arc::new(make_session(&data, false).await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let wire = Wire::new(16, 4);
            let theirs = wire.read_handshake(&mut stream).await.unwrap();
            wire.write_handshake(&mut stream, &Handshake::new(theirs.info_hash, [3; 20]))
                .await
                .unwrap();
            wire.write_message(&mut stream, &Message::Bitfield { bitfield: vec![0xf0] })
                .await
                .unwrap();
            assert_eq!(wire.read_message(&mut stream).await.unwrap(), Message::Interested);
            wire.write_message(&mut stream, &Message::Unchoke).await.unwrap();
            let Message::Request(request) = wire.read_message(&mut stream).await.unwrap() else {
                panic!("expected a block request");
            };
            wire.write_message(&mut stream, &Message::Choke).await.unwrap();
            (stream, request.index as usize)
        });

        let client = tokio::spawn(PeerConnection::connect(addr, Arc::clone(&leecher), context(2)));
        let (stream, claimed) = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while leecher.in_flight_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        let other = BitVec::from_elem(4, true);
        assert_eq!(leecher.pick_piece(&other).await, Some(claimed));

        // unread requests may turn the close into a reset
        drop(stream);
        let _ = tokio::time::timeout(Duration::from_secs(2), client).await.unwrap().unwrap();
        assert_eq!(leecher.channel_count().await, 0);
        assert_eq!(leecher.in_flight_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_message_is_skipped() {
        let data = payload(100);
        let torrents = TorrentContext::new();
        torrents.attach(make_session(&data, true).await).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let wire = Wire::new(16, 4);
            wire.write_handshake(&mut stream, &Handshake::new(InfoHash([6; 20]), [9; 20]))
                .await
                .unwrap();
            let reply = wire.read_handshake(&mut stream).await.unwrap();
            assert_eq!(reply.peer_id, [1; 20]);
            assert!(matches!(wire.read_message(&mut stream).await.unwrap(), Message::Bitfield { .. }));

            let unknown = Message::Unknown { id: 20, payload: vec![1, 2, 3] };
            wire.write_message(&mut stream, &unknown).await.unwrap();
            wire.write_message(&mut stream, &Message::Interested).await.unwrap();
            assert_eq!(wire.read_message(&mut stream).await.unwrap(), Message::Unchoke);
            stream.shutdown().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        PeerConnection::accept(stream, &torrents, context(1)).await.unwrap();
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_incoming_for_unknown_torrent_rejected() {
        let torrents = TorrentContext::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let wire = Wire::new(16, 4);
            wire.write_handshake(&mut stream, &Handshake::new(InfoHash([7; 20]), [9; 20]))
                .await
                .unwrap();
        });
        let (stream, _) = listener.accept().await.unwrap();
        let err = PeerConnection::accept(stream, &torrents, context(1)).await.unwrap_err();
        assert!(TorrentError::find(&err).unwrap().is_protocol_violation());
        client.await.unwrap();
    }
}
