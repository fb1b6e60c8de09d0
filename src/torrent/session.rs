//! Peer exchange session
//!
//! One session per peer connection. After the handshake the stream is split:
//! a write task owns the write half and drains a bounded queue of outgoing
//! messages (sending keep-alives when idle and `Have` for every piece the
//! torrent verifies), while the read loop decodes messages and dispatches
//! them against the torrent. Both sides share a cancellation token; either
//! one failing, or the torrent shutting down, stops the other.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitvec::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::mse::{self, PeerStream};
use super::peer::{self, Handshake, MessageDecoder, PeerMessage};
use super::piece::BlockRequest;
use super::{BlockOutcome, Sha1Hash, Torrent};
use crate::error::{EngineError, HandshakeError, Result, WireError};
use crate::instrument::SharedInstrumentation;

/// Counters reported when a session ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Remote peer id
    pub peer_id: [u8; 20],
    /// Whether the connection was encrypted
    pub encrypted: bool,
    /// Block bytes received
    pub downloaded: u64,
    /// Block bytes sent
    pub uploaded: u64,
    /// Pieces this session delivered the last block of
    pub pieces_completed: u32,
    /// Messages decoded
    pub messages_received: u64,
}

/// Protocol state of one connection
struct PeerState {
    fast: bool,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    /// Pieces the peer has announced
    peer_pieces: BitVec<u8, Msb0>,
    /// Pieces we may request while choked (BEP 6)
    allowed_fast: HashSet<u32>,
    /// Pieces the peer suggested (BEP 6)
    suggested: Vec<u32>,
    /// Our requests awaiting data
    outstanding: HashSet<BlockRequest>,
    /// Whether any message has arrived yet
    started: bool,
}

impl PeerState {
    fn new(num_pieces: usize, fast: bool) -> Self {
        Self {
            fast,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_pieces: bitvec![u8, Msb0; 0; num_pieces],
            allowed_fast: HashSet::new(),
            suggested: Vec::new(),
            outstanding: HashSet::new(),
            started: false,
        }
    }

    fn check_piece(&self, piece: u32) -> Result<()> {
        if (piece as usize) < self.peer_pieces.len() {
            Ok(())
        } else {
            Err(EngineError::peer_protocol(format!(
                "Piece index {} out of range ({} pieces)",
                piece,
                self.peer_pieces.len()
            )))
        }
    }

    fn require_fast(&self, what: &str) -> Result<()> {
        if self.fast {
            Ok(())
        } else {
            Err(EngineError::peer_protocol(format!(
                "{} without fast extension",
                what
            )))
        }
    }
}

/// Exchange session with one peer
pub struct PeerSession {
    torrent: Arc<Torrent>,
    id: u64,
    tx: mpsc::Sender<PeerMessage>,
    cancel: CancellationToken,
    instrument: SharedInstrumentation,
    state: PeerState,
    stats: SessionStats,
}

impl PeerSession {
    /// Open an outgoing session over a connected transport.
    ///
    /// Runs the encryption handshake per the torrent's policy (our protocol
    /// handshake rides along as initial payload), checks the remote
    /// handshake, then exchanges pieces until the peer leaves.
    pub async fn connect<S>(torrent: Arc<Torrent>, stream: S) -> Result<SessionStats>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = &torrent.config().encryption;
        let ours = Handshake::new(*torrent.info_hash(), torrent.peer_id());
        let started = Instant::now();

        let negotiated = async {
            let mut stream =
                mse::connect_stream(stream, torrent.info_hash(), &ours.encode(), config).await?;
            stream.flush().await?;
            let theirs = peer::read_handshake(&mut stream).await?;
            if theirs.info_hash != *torrent.info_hash() {
                return Err(HandshakeError::InvalidProtocol(
                    "Info hash mismatch".to_string(),
                ));
            }
            Ok((stream, theirs))
        };
        let (stream, theirs) =
            match tokio::time::timeout(config.handshake_timeout(), negotiated).await {
                Ok(Ok(done)) => done,
                Ok(Err(e)) => return Err(handshake_failed(&torrent, e)),
                Err(_) => return Err(handshake_failed(&torrent, HandshakeError::Timeout)),
            };

        torrent
            .instrumentation()
            .handshake_completed(stream.is_encrypted(), started.elapsed());
        Self::run(torrent, stream, theirs).await
    }

    /// Accept an incoming session for whichever of `torrents` the peer asks
    /// for.
    pub async fn accept<S>(torrents: &[Arc<Torrent>], stream: S) -> Result<SessionStats>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(first) = torrents.first() else {
            return Err(EngineError::invalid_input("torrents", "No torrents to serve"));
        };
        let config = first.config().encryption.clone();
        let skeys: Vec<Sha1Hash> = torrents.iter().map(|t| *t.info_hash()).collect();
        let started = Instant::now();

        let negotiated = async {
            let (mut stream, skey) = mse::accept_stream(stream, &skeys, &config).await?;
            let theirs = peer::read_handshake(&mut stream).await?;
            let torrent = torrents
                .iter()
                .find(|t| *t.info_hash() == theirs.info_hash)
                .ok_or(HandshakeError::UnknownInfoHash)?;
            if skey.is_some_and(|skey| skey != theirs.info_hash) {
                return Err(HandshakeError::InvalidProtocol(
                    "Info hash differs from the encrypted handshake".to_string(),
                ));
            }

            let ours = Handshake::new(*torrent.info_hash(), torrent.peer_id());
            peer::write_handshake(&mut stream, &ours).await?;
            Ok((stream, theirs, Arc::clone(torrent)))
        };
        let (stream, theirs, torrent) =
            match tokio::time::timeout(config.handshake_timeout(), negotiated).await {
                Ok(Ok(done)) => done,
                Ok(Err(e)) => return Err(handshake_failed(first, e)),
                Err(_) => return Err(handshake_failed(first, HandshakeError::Timeout)),
            };

        torrent
            .instrumentation()
            .handshake_completed(stream.is_encrypted(), started.elapsed());
        Self::run(torrent, stream, theirs).await
    }

    /// Exchange pieces over an established stream until either side stops.
    ///
    /// A clean close by the peer ends the session with `Ok`; framing errors
    /// and protocol violations end it with the error.
    pub async fn run<S>(
        torrent: Arc<Torrent>,
        stream: PeerStream<S>,
        remote: Handshake,
    ) -> Result<SessionStats>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let config = torrent.config().session.clone();
        let ours = Handshake::new(*torrent.info_hash(), torrent.peer_id());
        let fast = ours.reserved.supports_fast() && remote.reserved.supports_fast();
        let encrypted = stream.is_encrypted();

        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(config.channel_capacity);
        let cancel = torrent.shutdown_token();
        let instrument = Arc::clone(torrent.instrumentation());

        let writer_task = spawn_writer(
            writer,
            rx,
            torrent.subscribe_completions(),
            config.keepalive_interval(),
            cancel.clone(),
            Arc::clone(&instrument),
        );

        let mut session = PeerSession {
            id: torrent.next_session_id(),
            state: PeerState::new(torrent.num_pieces(), fast),
            stats: SessionStats {
                peer_id: remote.peer_id,
                encrypted,
                ..SessionStats::default()
            },
            torrent,
            tx,
            cancel: cancel.clone(),
            instrument,
        };

        tracing::debug!(
            session = session.id,
            peer = %String::from_utf8_lossy(&remote.peer_id[..8]),
            encrypted,
            fast,
            "Session started"
        );

        let decoder = MessageDecoder::new(reader, config.max_message_length);
        let result = session.read_loop(decoder, config.max_pending_requests).await;

        cancel.cancel();
        session.torrent.release_session(session.id);
        let write_result = writer_task.await;

        tracing::debug!(
            session = session.id,
            downloaded = session.stats.downloaded,
            uploaded = session.stats.uploaded,
            "Session ended"
        );

        let peer_closed = result?;
        match write_result {
            Ok(Ok(())) => Ok(session.stats),
            // Messages still queued when the peer hung up are lost either way
            Ok(Err(_)) if peer_closed => Ok(session.stats),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_loop<R>(
        &mut self,
        mut decoder: MessageDecoder<ReadHalf<R>>,
        max_pending: usize,
    ) -> Result<bool>
    where
        R: AsyncRead + AsyncWrite + Unpin,
    {
        self.send_initial_state().await?;

        loop {
            // Only cancellation races the decode; anything else would drop a
            // half-read frame and desync the stream.
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(false),
                msg = decoder.decode() => msg,
            };

            let msg = match msg {
                Ok(msg) => msg,
                Err(WireError::Ended) => {
                    tracing::debug!(session = self.id, "Peer closed the connection");
                    return Ok(true);
                }
                Err(e) => {
                    tracing::debug!(session = self.id, error = %e, "Read failed");
                    return Err(e.into());
                }
            };

            self.stats.messages_received += 1;
            self.instrument.message_received(msg.id(), msg.body_len());
            tracing::trace!(session = self.id, ?msg, "Received");

            if let Err(e) = self.handle_message(msg).await {
                if matches!(e, EngineError::PeerProtocol(_)) {
                    tracing::warn!(session = self.id, error = %e, "Peer protocol violation");
                }
                return Err(e);
            }
            self.fill_requests(max_pending).await?;
        }
    }

    async fn send(&self, msg: PeerMessage) -> Result<()> {
        self.tx.send(msg).await.map_err(|_| EngineError::Shutdown)
    }

    async fn send_initial_state(&mut self) -> Result<()> {
        let have = self.torrent.bitfield();
        let msg = if self.state.fast && have.all() {
            PeerMessage::HaveAll
        } else if self.state.fast && have.not_any() {
            PeerMessage::HaveNone
        } else if have.not_any() {
            return Ok(());
        } else {
            PeerMessage::Bitfield { bitfield: have }
        };
        self.send(msg).await
    }

    async fn handle_message(&mut self, msg: PeerMessage) -> Result<()> {
        let first = !self.state.started;
        self.state.started = true;

        match msg {
            PeerMessage::KeepAlive => {}

            PeerMessage::Choke => {
                self.state.peer_choking = true;
                // With the fast extension, outstanding requests are rejected
                // explicitly instead of being dropped by the choke
                if !self.state.fast {
                    let dropped: Vec<BlockRequest> = self.state.outstanding.drain().collect();
                    self.torrent.release_requests(self.id, &dropped);
                }
            }

            PeerMessage::Unchoke => {
                self.state.peer_choking = false;
            }

            PeerMessage::Interested => {
                self.state.peer_interested = true;
                if self.state.am_choking {
                    self.state.am_choking = false;
                    self.send(PeerMessage::Unchoke).await?;
                }
            }

            PeerMessage::NotInterested => {
                self.state.peer_interested = false;
            }

            PeerMessage::Have { piece_index } => {
                self.state.check_piece(piece_index)?;
                self.state.peer_pieces.set(piece_index as usize, true);
                self.update_interest().await?;
            }

            PeerMessage::Bitfield { bitfield } => {
                if !first {
                    return Err(EngineError::peer_protocol("Bitfield after first message"));
                }
                let num_pieces = self.state.peer_pieces.len();
                if bitfield.len() != num_pieces.div_ceil(8) * 8 {
                    return Err(EngineError::peer_protocol(format!(
                        "Bitfield of {} bits for {} pieces",
                        bitfield.len(),
                        num_pieces
                    )));
                }
                if bitfield[num_pieces..].any() {
                    return Err(EngineError::peer_protocol("Bitfield spare bits set"));
                }
                self.state.peer_pieces.copy_from_bitslice(&bitfield[..num_pieces]);
                self.update_interest().await?;
            }

            PeerMessage::HaveAll => self.peer_has_all(true, first).await?,

            PeerMessage::HaveNone => self.peer_has_all(false, first).await?,

            PeerMessage::Request {
                index,
                begin,
                length,
            } => {
                self.serve_request(index, begin, length).await?;
            }

            PeerMessage::Piece { index, begin, block } => {
                let request = BlockRequest::new(index, begin, block.len() as u32);
                if !self.state.outstanding.remove(&request) {
                    tracing::trace!(session = self.id, index, begin, "Unrequested block dropped");
                    return Ok(());
                }
                self.stats.downloaded += block.len() as u64;

                match self.torrent.write_block(index, begin, block).await? {
                    BlockOutcome::PieceCompleted => self.stats.pieces_completed += 1,
                    BlockOutcome::PieceFailed => {
                        tracing::debug!(session = self.id, index, "Piece failed, requeued");
                    }
                    BlockOutcome::Stored | BlockOutcome::Unexpected => {}
                }
            }

            PeerMessage::Cancel { .. } => {
                // Requests are served as they arrive; nothing is queued to cancel
            }

            PeerMessage::Port { port } => {
                tracing::trace!(session = self.id, port, "Ignoring DHT port");
            }

            PeerMessage::SuggestPiece { piece_index } => {
                self.state.require_fast("Suggest")?;
                self.state.check_piece(piece_index)?;
                if !self.state.suggested.contains(&piece_index) {
                    self.state.suggested.push(piece_index);
                }
            }

            PeerMessage::RejectRequest {
                index,
                begin,
                length,
            } => {
                self.state.require_fast("Reject")?;
                let request = BlockRequest::new(index, begin, length);
                if self.state.outstanding.remove(&request) {
                    self.torrent.release_requests(self.id, &[request]);
                } else {
                    tracing::debug!(session = self.id, index, begin, "Reject for unknown request");
                }
            }

            PeerMessage::AllowedFast { piece_index } => {
                self.state.require_fast("AllowedFast")?;
                self.state.check_piece(piece_index)?;
                self.state.allowed_fast.insert(piece_index);
            }

            PeerMessage::Extended { id, .. } => {
                tracing::trace!(session = self.id, id, "Ignoring extension message");
            }
        }

        Ok(())
    }

    async fn peer_has_all(&mut self, all: bool, first: bool) -> Result<()> {
        self.state.require_fast("HaveAll/HaveNone")?;
        if !first {
            return Err(EngineError::peer_protocol(
                "HaveAll/HaveNone after first message",
            ));
        }
        self.state.peer_pieces.fill(all);
        self.update_interest().await
    }

    async fn serve_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.state.check_piece(index)?;
        let max_block = self
            .torrent
            .config()
            .session
            .max_message_length
            .saturating_sub(9);
        if length == 0 || length > max_block {
            return Err(EngineError::peer_protocol(format!(
                "Request length {} outside 1..={}",
                length, max_block
            )));
        }

        let reject = PeerMessage::RejectRequest {
            index,
            begin,
            length,
        };

        if self.state.am_choking {
            tracing::trace!(
                "Ignoring request from choked peer (piece={}, offset={}, len={})",
                index,
                begin,
                length
            );
            if self.state.fast {
                self.send(reject).await?;
            }
            return Ok(());
        }

        match self.torrent.read_block(index, begin, length).await {
            Ok(Some(block)) => {
                self.stats.uploaded += block.len() as u64;
                self.send(PeerMessage::Piece { index, begin, block }).await
            }
            Ok(None) => {
                tracing::debug!(session = self.id, index, "Request for a piece we don't have");
                if self.state.fast {
                    self.send(reject).await?;
                }
                Ok(())
            }
            Err(EngineError::Storage(e)) => {
                tracing::warn!(session = self.id, index, error = %e, "Cannot serve request");
                if self.state.fast {
                    self.send(reject).await?;
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn update_interest(&mut self) -> Result<()> {
        let interested = self.torrent.is_interesting(&self.state.peer_pieces);
        if interested != self.state.am_interested {
            self.state.am_interested = interested;
            let msg = if interested {
                PeerMessage::Interested
            } else {
                PeerMessage::NotInterested
            };
            self.send(msg).await?;
        }
        Ok(())
    }

    /// Top up outstanding requests
    async fn fill_requests(&mut self, max_pending: usize) -> Result<()> {
        if self.state.am_interested && self.torrent.is_complete() {
            self.update_interest().await?;
        }
        if !self.state.am_interested || self.state.outstanding.len() >= max_pending {
            return Ok(());
        }

        let only = if self.state.peer_choking {
            if self.state.allowed_fast.is_empty() {
                return Ok(());
            }
            Some(&self.state.allowed_fast)
        } else {
            None
        };

        self.state.suggested.retain(|piece| !self.torrent.have_piece(*piece));
        let requests = self.torrent.next_requests(
            self.id,
            &self.state.peer_pieces,
            only,
            &self.state.suggested,
            max_pending - self.state.outstanding.len(),
        );

        for request in requests {
            self.state.outstanding.insert(request);
            self.send(request.to_request()).await?;
        }
        Ok(())
    }
}

fn handshake_failed(torrent: &Torrent, error: HandshakeError) -> EngineError {
    tracing::debug!(error = %error, "Handshake failed");
    torrent.instrumentation().handshake_failed(&error.to_string());
    error.into()
}

/// Spawn the task that owns the write half
fn spawn_writer<W>(
    writer: WriteHalf<W>,
    rx: mpsc::Receiver<PeerMessage>,
    completions: broadcast::Receiver<u32>,
    keepalive: Duration,
    cancel: CancellationToken,
    instrument: SharedInstrumentation,
) -> JoinHandle<std::result::Result<(), WireError>>
where
    W: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = write_loop(writer, rx, completions, keepalive, &cancel, instrument).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, "Write failed");
        }
        // Stop the read loop too
        cancel.cancel();
        result
    })
}

async fn write_loop<W>(
    mut writer: WriteHalf<W>,
    mut rx: mpsc::Receiver<PeerMessage>,
    mut completions: broadcast::Receiver<u32>,
    keepalive: Duration,
    cancel: &CancellationToken,
    instrument: SharedInstrumentation,
) -> std::result::Result<(), WireError>
where
    W: AsyncRead + AsyncWrite + Unpin,
{
    let mut completions_open = true;

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            completed = completions.recv(), if completions_open => match completed {
                Ok(piece_index) => PeerMessage::Have { piece_index },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "Completion notifications lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    completions_open = false;
                    continue;
                }
            },
            _ = tokio::time::sleep(keepalive) => PeerMessage::KeepAlive,
        };

        peer::write_message(&mut writer, &msg).await?;
        if rx.is_empty() {
            writer.flush().await?;
        }
        instrument.message_sent(msg.id(), msg.body_len());
    }

    writer.flush().await?;
    Ok(())
}
