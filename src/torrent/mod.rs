//! BitTorrent Module
//!
//! The data plane for one torrent:
//! - Decoded metadata and piece arithmetic (metainfo)
//! - Peer wire protocol codec (peer)
//! - MSE/PE obfuscated handshake (mse)
//! - Block bookkeeping for pieces in flight (piece)
//! - Per-peer exchange sessions (session)
//!
//! `Torrent` owns the storage backend and the priority index. Sessions hold
//! an `Arc<Torrent>` and go through it for every piece operation; the torrent
//! never references its sessions.

pub mod metainfo;
pub mod mse;
pub mod peer;
pub mod piece;
pub mod session;

// Re-export commonly used types
pub use metainfo::{FileInfo, FileSegment, Info, Metainfo, Sha1Hash};
pub use mse::{accept_stream, connect_stream, PeerStream};
pub use peer::{Handshake, MessageDecoder, PeerMessage, ReservedBytes, BLOCK_SIZE};
pub use piece::{BlockRequest, PendingPiece, PieceProgress};
pub use session::{PeerSession, SessionStats};

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitvec::prelude::*;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::error::{EngineError, Result, StorageError};
use crate::instrument::{self, SharedInstrumentation};
use crate::priority_queue::PiecePriorityQueue;
use crate::storage::{self, PieceStorage};

/// Priority key given to every missing piece when a torrent is opened
pub const DEFAULT_PRIORITY: i64 = 0;

/// Capacity of the piece-completion broadcast
const COMPLETION_CHANNEL_CAPACITY: usize = 256;

/// What happened to a block handed to `Torrent::write_block`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Written; the piece still has missing blocks
    Stored,
    /// Written, and the piece verified and completed
    PieceCompleted,
    /// The piece failed storage or verification and is wanted again
    PieceFailed,
    /// Nobody is waiting for this block; it was dropped
    Unexpected,
}

/// Owner of one torrent's storage, priority index and progress
pub struct Torrent {
    info_hash: Sha1Hash,
    info: Arc<Info>,
    peer_id: [u8; 20],
    config: CoreConfig,
    storage: Arc<dyn PieceStorage>,

    /// Pieces still to request, in priority order
    wanted: PiecePriorityQueue,

    /// Pieces with at least one outstanding or received block
    pending: Mutex<HashMap<u32, PendingPiece>>,

    /// Bitfield of verified pieces
    have: RwLock<BitVec<u8, Msb0>>,

    /// Total bytes verified
    verified_bytes: AtomicU64,

    /// Peers handed to us by discovery, not yet connected
    known_peers: Mutex<HashSet<SocketAddr>>,

    completions: broadcast::Sender<u32>,
    next_session: AtomicU64,
    shutdown: CancellationToken,
    instrument: SharedInstrumentation,
}

impl Torrent {
    /// Open a torrent with the storage backend selected in `config`.
    ///
    /// Opening checks completion for every piece, which may touch the disk.
    pub fn open(metainfo: Metainfo, config: CoreConfig) -> Result<Arc<Self>> {
        Self::open_with_instrumentation(metainfo, config, instrument::noop())
    }

    /// Same as `open`, reporting events to `instrument`
    pub fn open_with_instrumentation(
        metainfo: Metainfo,
        config: CoreConfig,
        instrument: SharedInstrumentation,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let info = Arc::new(metainfo.info);
        let storage = storage::open_storage(
            &metainfo.info_hash,
            info.clone(),
            &config.storage,
            instrument.clone(),
        )?;
        Self::with_storage(metainfo.info_hash, info, storage, config, instrument)
    }

    /// Build a torrent over an already opened storage backend
    pub fn with_storage(
        info_hash: Sha1Hash,
        info: Arc<Info>,
        storage: Arc<dyn PieceStorage>,
        config: CoreConfig,
        instrument: SharedInstrumentation,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let num_pieces = info.num_pieces();
        let wanted = PiecePriorityQueue::new();
        let mut have = bitvec![u8, Msb0; 0; num_pieces];
        let mut verified_bytes = 0u64;

        for piece in 0..num_pieces {
            if storage.is_complete(piece as u32) {
                have.set(piece, true);
                verified_bytes += info.piece_size(piece).unwrap_or(0);
            } else {
                wanted.set_piece(piece as u32, DEFAULT_PRIORITY);
            }
        }

        tracing::debug!(
            info_hash = %hex::encode(info_hash),
            pieces = num_pieces,
            complete = have.count_ones(),
            "Opened torrent"
        );

        let (completions, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            info_hash,
            info,
            peer_id: generate_peer_id(),
            config,
            storage,
            wanted,
            pending: Mutex::new(HashMap::new()),
            have: RwLock::new(have),
            verified_bytes: AtomicU64::new(verified_bytes),
            known_peers: Mutex::new(HashSet::new()),
            completions,
            next_session: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            instrument,
        }))
    }

    /// Get the info hash
    pub fn info_hash(&self) -> &Sha1Hash {
        &self.info_hash
    }

    /// Get info hash as hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Decoded metadata
    pub fn info(&self) -> &Arc<Info> {
        &self.info
    }

    /// Our peer id for this torrent
    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Get the configuration.
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Handle to the storage backend
    pub fn storage(&self) -> Arc<dyn PieceStorage> {
        Arc::clone(&self.storage)
    }

    pub fn instrumentation(&self) -> &SharedInstrumentation {
        &self.instrument
    }

    /// Get the total number of pieces
    pub fn num_pieces(&self) -> usize {
        self.info.num_pieces()
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Set the priority key of a missing piece. Lower keys are requested
    /// first. Completed pieces are left alone.
    pub fn set_priority(&self, piece: u32, priority: i64) -> Result<()> {
        if piece as usize >= self.num_pieces() {
            return Err(EngineError::invalid_input(
                "piece",
                format!("Piece {} out of range ({} pieces)", piece, self.num_pieces()),
            ));
        }
        if self.have_piece(piece) {
            return Ok(());
        }

        let mut pending = self.pending.lock();
        if let Some(in_flight) = pending.get_mut(&piece) {
            in_flight.priority = priority;
            if !in_flight.is_fully_requested() {
                self.wanted.set_piece(piece, priority);
            }
            return Ok(());
        }
        self.wanted.set_piece(piece, priority);
        Ok(())
    }

    /// Current priority key of a missing piece
    pub fn priority_of(&self, piece: u32) -> Option<i64> {
        if let Some(in_flight) = self.pending.lock().get(&piece) {
            return Some(in_flight.priority);
        }
        self.wanted.priority_of(piece)
    }

    /// Pieces still waiting to be requested, in request order
    pub fn wanted_pieces(&self) -> Vec<u32> {
        self.wanted.snapshot()
    }

    /// Pick up to `max` blocks to request from a peer holding `peer_pieces`.
    ///
    /// `suggested` pieces are tried before the priority order. When `only`
    /// is set (the peer has us choked), nothing outside it is requested.
    /// A piece leaves the wanted set once all its missing blocks are
    /// requested.
    pub fn next_requests(
        &self,
        session: u64,
        peer_pieces: &BitSlice<u8, Msb0>,
        only: Option<&HashSet<u32>>,
        suggested: &[u32],
        max: usize,
    ) -> Vec<BlockRequest> {
        let mut requests = Vec::new();
        if max == 0 {
            return requests;
        }

        let block_size = self.config.session.block_size;
        let mut pending = self.pending.lock();
        let candidates = suggested
            .iter()
            .copied()
            .filter(|piece| self.wanted.contains(*piece))
            .chain(self.wanted.iter());

        for piece in candidates {
            if requests.len() >= max {
                break;
            }
            if !peer_pieces.get(piece as usize).map(|b| *b).unwrap_or(false) {
                continue;
            }
            if only.is_some_and(|allowed| !allowed.contains(&piece)) {
                continue;
            }
            if self.have_piece(piece) {
                self.wanted.delete_piece(piece);
                continue;
            }

            let in_flight = match pending.entry(piece) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let Some(length) = self.info.piece_size(piece as usize) else {
                        self.wanted.delete_piece(piece);
                        continue;
                    };
                    let priority = self.wanted.priority_of(piece).unwrap_or(DEFAULT_PRIORITY);
                    entry.insert(PendingPiece::new(piece, length, block_size, priority))
                }
            };

            for (offset, length) in in_flight
                .unrequested_blocks()
                .into_iter()
                .take(max - requests.len())
            {
                in_flight.mark_requested(offset / block_size, session);
                requests.push(BlockRequest::new(piece, offset, length));
            }

            if in_flight.is_fully_requested() {
                self.wanted.delete_piece(piece);
            }
        }

        requests
    }

    /// Return requests made by `session` to the wanted set
    pub fn release_requests(&self, session: u64, requests: &[BlockRequest]) {
        let mut pending = self.pending.lock();
        for request in requests {
            let Some(in_flight) = pending.get_mut(&request.piece) else {
                continue;
            };
            let block = request.offset / in_flight.block_size;
            if in_flight.requested_blocks.get(&block) == Some(&session)
                && in_flight.release_block(request.offset)
            {
                self.wanted.set_piece(request.piece, in_flight.priority);
            }
        }
    }

    /// Return every request made by `session` to the wanted set
    pub fn release_session(&self, session: u64) {
        let mut pending = self.pending.lock();
        for (piece, in_flight) in pending.iter_mut() {
            if in_flight.release_session(session) > 0 {
                self.wanted.set_piece(*piece, in_flight.priority);
            }
        }
    }

    // ------------------------------------------------------------------
    // Piece data
    // ------------------------------------------------------------------

    /// Persist a received block; verifies and completes the piece when it
    /// was the last one missing.
    ///
    /// Storage failures do not propagate: the piece goes back to the wanted
    /// set and the outcome says so.
    pub async fn write_block(
        &self,
        piece: u32,
        offset: u32,
        data: Bytes,
    ) -> Result<BlockOutcome> {
        let length = data.len() as u32;
        let expected = self
            .pending
            .lock()
            .get(&piece)
            .map(|in_flight| in_flight.is_block_missing(offset, length))
            .unwrap_or(false);
        if !expected {
            return Ok(BlockOutcome::Unexpected);
        }

        let storage = self.storage();
        let started = Instant::now();
        let written =
            tokio::task::spawn_blocking(move || storage.write_at(piece, offset as u64, &data))
                .await?;

        match written {
            Ok(_) => {}
            Err(StorageError::AlreadyComplete(_)) => {
                tracing::debug!(piece, "Piece completed elsewhere");
                self.pending.lock().remove(&piece);
                self.record_completion(piece);
                return Ok(BlockOutcome::PieceCompleted);
            }
            Err(e) => {
                tracing::warn!(piece, offset, error = %e, "Block write failed, piece wanted again");
                self.fail_piece(piece);
                return Ok(BlockOutcome::PieceFailed);
            }
        }
        self.instrument
            .block_written(piece, length as usize, started.elapsed());

        let finished = {
            let mut pending = self.pending.lock();
            let done = match pending.get_mut(&piece) {
                Some(in_flight) => {
                    in_flight.mark_received(offset, length);
                    in_flight.is_complete()
                }
                None => false,
            };
            if done {
                pending.remove(&piece)
            } else {
                None
            }
        };

        match finished {
            Some(in_flight) => self.verify_and_complete(in_flight).await,
            None => Ok(BlockOutcome::Stored),
        }
    }

    /// Hash-check a fully written piece and record the result
    async fn verify_and_complete(&self, in_flight: PendingPiece) -> Result<BlockOutcome> {
        let piece = in_flight.index;
        let storage = self.storage();
        let info = Arc::clone(&self.info);

        let result = tokio::task::spawn_blocking(move || {
            if !storage::verify_piece(storage.as_ref(), &info, piece)? {
                return Err(StorageError::HashMismatch(piece));
            }
            storage.mark_complete(piece)
        })
        .await?;

        match result {
            Ok(()) | Err(StorageError::AlreadyComplete(_)) => {
                self.record_completion(piece);
                // Completing may have evicted older pieces
                self.drop_evicted();
                Ok(BlockOutcome::PieceCompleted)
            }
            Err(e) => {
                tracing::warn!(
                    piece,
                    elapsed_ms = in_flight.started_at.elapsed().as_millis() as u64,
                    error = %e,
                    "Piece failed verification"
                );
                self.instrument.piece_failed(piece);
                self.wanted.set_piece(piece, in_flight.priority);
                Ok(BlockOutcome::PieceFailed)
            }
        }
    }

    /// Drop a piece's progress and want it again
    fn fail_piece(&self, piece: u32) {
        let priority = match self.pending.lock().remove(&piece) {
            Some(in_flight) => in_flight.priority,
            None => self.wanted.priority_of(piece).unwrap_or(DEFAULT_PRIORITY),
        };
        self.instrument.piece_failed(piece);
        self.wanted.set_piece(piece, priority);
    }

    fn record_completion(&self, piece: u32) {
        let newly = {
            let mut have = self.have.write();
            match have.get(piece as usize).map(|b| *b) {
                Some(false) => {
                    have.set(piece as usize, true);
                    true
                }
                _ => false,
            }
        };
        if !newly {
            return;
        }

        let size = self.info.piece_size(piece as usize).unwrap_or(0);
        self.verified_bytes.fetch_add(size, Ordering::Relaxed);
        self.wanted.delete_piece(piece);
        tracing::info!(piece, bytes = size, "Piece verified");
        self.instrument.piece_completed(piece);
        // No receivers just means no sessions are running
        let _ = self.completions.send(piece);
    }

    /// Un-have pieces the storage dropped and want them again
    fn drop_evicted(&self) {
        for piece in self.storage.take_evicted() {
            self.lose_piece(piece);
        }
    }

    fn lose_piece(&self, piece: u32) {
        let lost = {
            let mut have = self.have.write();
            match have.get(piece as usize).map(|b| *b) {
                Some(true) => {
                    have.set(piece as usize, false);
                    true
                }
                _ => false,
            }
        };
        if !lost {
            return;
        }

        let size = self.info.piece_size(piece as usize).unwrap_or(0);
        self.verified_bytes.fetch_sub(size, Ordering::Relaxed);
        self.wanted.set_piece(piece, DEFAULT_PRIORITY);
        tracing::debug!(piece, bytes = size, "Piece no longer in storage, wanted again");
    }

    /// Read a block of a verified piece for upload. `None` if we don't have
    /// the piece.
    pub async fn read_block(&self, piece: u32, offset: u32, length: u32) -> Result<Option<Bytes>> {
        if !self.have_piece(piece) {
            return Ok(None);
        }
        let size = self.info.piece_size(piece as usize).unwrap_or(0);
        if offset as u64 + length as u64 > size {
            return Err(EngineError::peer_protocol(format!(
                "Request {}+{} beyond piece {} of {} bytes",
                offset, length, piece, size
            )));
        }

        let storage = self.storage();
        let block = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; length as usize];
            let n = storage.read_at(piece, offset as u64, &mut buf)?;
            if n < buf.len() {
                return Err(StorageError::UnexpectedShortRead {
                    piece,
                    offset: offset as u64,
                    read: n,
                    expected: buf.len(),
                });
            }
            Ok(Bytes::from(buf))
        })
        .await?;

        match block {
            Ok(block) => Ok(Some(block)),
            // Evicted from a store shared with another torrent
            Err(StorageError::UnexpectedShortRead { .. }) if !self.storage.is_complete(piece) => {
                self.drop_evicted();
                self.lose_piece(piece);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Hash-check pieces storage does not know to be complete, and complete
    /// those that match. Returns the number of pieces found valid.
    ///
    /// Used after restarting on the file-tree and mmap backends when their
    /// completion database is off or missing, and to adopt data placed in
    /// the download directory by other means.
    pub async fn recheck(&self) -> Result<usize> {
        let mut valid = 0;
        for piece in 0..self.num_pieces() as u32 {
            if self.have_piece(piece) || self.pending.lock().contains_key(&piece) {
                continue;
            }

            let storage = self.storage();
            let info = Arc::clone(&self.info);
            let matched = tokio::task::spawn_blocking(move || {
                match storage::verify_piece(storage.as_ref(), &info, piece) {
                    Ok(true) => storage.mark_complete(piece).map(|_| true),
                    Ok(false) => Ok(false),
                    // Missing data just means the piece is not there yet
                    Err(e) if e.is_integrity_failure() => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await??;

            if matched {
                self.record_completion(piece);
                self.drop_evicted();
                valid += 1;
            }
        }

        tracing::debug!(valid, "Rechecked existing data");
        Ok(valid)
    }

    // ------------------------------------------------------------------
    // Progress
    // ------------------------------------------------------------------

    /// Check if we have a verified piece
    pub fn have_piece(&self, piece: u32) -> bool {
        self.have
            .read()
            .get(piece as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// Get our bitfield
    pub fn bitfield(&self) -> BitVec<u8, Msb0> {
        self.have.read().clone()
    }

    /// Check whether a peer holding `peer_pieces` has anything we lack
    pub fn is_interesting(&self, peer_pieces: &BitSlice<u8, Msb0>) -> bool {
        let have = self.have.read();
        peer_pieces
            .iter_ones()
            .any(|piece| have.get(piece).map(|b| !*b).unwrap_or(false))
    }

    /// Get progress information
    pub fn progress(&self) -> PieceProgress {
        PieceProgress {
            total_pieces: self.num_pieces(),
            have_pieces: self.have.read().count_ones(),
            pending_pieces: self.pending.lock().len(),
            verified_bytes: self.verified_bytes.load(Ordering::Relaxed),
            total_size: self.info.total_size,
        }
    }

    /// Check if every piece is verified
    pub fn is_complete(&self) -> bool {
        self.have.read().all()
    }

    /// Receive the index of every piece verified from now on
    pub fn subscribe_completions(&self) -> broadcast::Receiver<u32> {
        self.completions.subscribe()
    }

    // ------------------------------------------------------------------
    // Peers and lifecycle
    // ------------------------------------------------------------------

    /// Add discovered peers to the known peers list.
    pub fn add_peers(&self, peers: impl IntoIterator<Item = SocketAddr>) {
        let mut known = self.known_peers.lock();
        known.extend(peers);
    }

    /// Take up to `max` known peers for connecting
    pub fn take_peers(&self, max: usize) -> Vec<SocketAddr> {
        let mut known = self.known_peers.lock();
        let taken: Vec<SocketAddr> = known.iter().take(max).copied().collect();
        for addr in &taken {
            known.remove(addr);
        }
        taken
    }

    /// Number of known, unconnected peers
    pub fn known_peer_count(&self) -> usize {
        self.known_peers.lock().len()
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Token cancelled when the torrent shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Check if shutdown was requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop every session and flush storage
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let storage = self.storage();
        tokio::task::spawn_blocking(move || storage.flush()).await??;
        tracing::debug!(info_hash = %self.info_hash_hex(), "Torrent shut down");
        Ok(())
    }
}

/// Generate a random peer ID in Azureus-style
///
/// Format: -<2-char client><4-char version>-<12 random bytes>
/// Example: -GB0001-xxxxxxxxxxxx
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-GB0001-");
    rand::rng().fill(&mut peer_id[8..]);
    peer_id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackendKind;
    use sha1::{Digest, Sha1};
    use std::path::PathBuf;

    fn sample(len: usize, piece_length: usize) -> (Vec<u8>, Metainfo) {
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        let pieces = data
            .chunks(piece_length)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        let info = Info::new(
            "sample",
            piece_length as u64,
            pieces,
            vec![(PathBuf::from("sample.bin"), len as u64)],
        )
        .unwrap();
        (data, Metainfo::new([7u8; 20], info))
    }

    fn open(dir: &std::path::Path, metainfo: Metainfo, block_size: u32) -> Arc<Torrent> {
        let mut config = CoreConfig::new()
            .base_dir(dir)
            .backend(StorageBackendKind::File);
        config.session.block_size = block_size;
        Torrent::open(metainfo, config).unwrap()
    }

    fn all(n: usize) -> BitVec<u8, Msb0> {
        bitvec![u8, Msb0; 1; n]
    }

    #[test]
    fn test_generate_peer_id() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-GB0001-");
        assert_ne!(generate_peer_id(), id);
    }

    #[test]
    fn test_requests_follow_priority() {
        let dir = tempfile::tempdir().unwrap();
        let (_, metainfo) = sample(64, 16);
        let torrent = open(dir.path(), metainfo, 8);

        torrent.set_priority(3, -5).unwrap();
        torrent.set_priority(1, -1).unwrap();

        let requests = torrent.next_requests(1, &all(4), None, &[], 3);
        assert_eq!(
            requests,
            vec![
                BlockRequest::new(3, 0, 8),
                BlockRequest::new(3, 8, 8),
                BlockRequest::new(1, 0, 8),
            ]
        );
        // Fully requested pieces leave the wanted set
        assert!(!torrent.wanted_pieces().contains(&3));
        assert!(torrent.wanted_pieces().contains(&1));
    }

    #[test]
    fn test_requests_respect_peer_bitfield_and_allowed_set() {
        let dir = tempfile::tempdir().unwrap();
        let (_, metainfo) = sample(64, 16);
        let torrent = open(dir.path(), metainfo, 16);

        let mut peer = bitvec![u8, Msb0; 0; 4];
        peer.set(2, true);
        peer.set(3, true);
        let requests = torrent.next_requests(1, &peer, None, &[], 10);
        let pieces: HashSet<u32> = requests.iter().map(|r| r.piece).collect();
        assert_eq!(pieces, HashSet::from([2, 3]));

        torrent.release_session(1);
        let only = HashSet::from([3]);
        let requests = torrent.next_requests(2, &peer, Some(&only), &[], 10);
        assert_eq!(requests, vec![BlockRequest::new(3, 0, 16)]);
    }

    #[test]
    fn test_released_requests_are_wanted_again() {
        let dir = tempfile::tempdir().unwrap();
        let (_, metainfo) = sample(32, 16);
        let torrent = open(dir.path(), metainfo, 16);

        let first = torrent.next_requests(1, &all(2), None, &[], 10);
        assert_eq!(first.len(), 2);
        assert!(torrent.next_requests(2, &all(2), None, &[], 10).is_empty());

        // Another session cannot release what it did not request
        torrent.release_requests(2, &first);
        assert!(torrent.wanted_pieces().is_empty());

        torrent.release_requests(1, &first[..1]);
        assert_eq!(
            torrent.next_requests(2, &all(2), None, &[], 10),
            vec![first[0]]
        );
    }

    #[test]
    fn test_suggested_pieces_go_first() {
        let dir = tempfile::tempdir().unwrap();
        let (_, metainfo) = sample(64, 16);
        let torrent = open(dir.path(), metainfo, 16);
        torrent.set_priority(0, -10).unwrap();

        let requests = torrent.next_requests(1, &all(4), None, &[2], 2);
        assert_eq!(requests[0].piece, 2);
        assert_eq!(requests[1].piece, 0);
    }

    #[tokio::test]
    async fn test_blocks_complete_piece() {
        let dir = tempfile::tempdir().unwrap();
        let (data, metainfo) = sample(40, 16);
        let torrent = open(dir.path(), metainfo, 8);
        let mut completions = torrent.subscribe_completions();

        let requests = torrent.next_requests(1, &all(3), None, &[], 100);
        assert_eq!(requests.len(), 5);

        let mut outcomes = Vec::new();
        for request in requests.iter().filter(|r| r.piece == 2) {
            let start = (request.piece * 16 + request.offset) as usize;
            let block = Bytes::copy_from_slice(&data[start..start + request.length as usize]);
            outcomes.push(
                torrent
                    .write_block(request.piece, request.offset, block)
                    .await
                    .unwrap(),
            );
        }

        assert_eq!(outcomes, vec![BlockOutcome::PieceCompleted]);
        assert!(torrent.have_piece(2));
        assert_eq!(completions.recv().await.unwrap(), 2);

        let progress = torrent.progress();
        assert_eq!(progress.have_pieces, 1);
        assert_eq!(progress.verified_bytes, 8);
        assert_eq!(progress.pending_pieces, 2);

        let block = torrent.read_block(2, 0, 8).await.unwrap().unwrap();
        assert_eq!(&block[..], &data[32..40]);
        assert!(torrent.read_block(0, 0, 8).await.unwrap().is_none());
        assert!(torrent.read_block(2, 4, 8).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_wanted_again() {
        let dir = tempfile::tempdir().unwrap();
        let (_, metainfo) = sample(32, 16);
        let torrent = open(dir.path(), metainfo, 16);
        torrent.set_priority(1, 4).unwrap();

        let requests = torrent.next_requests(1, &all(2), None, &[], 10);
        let bad = requests.iter().find(|r| r.piece == 1).unwrap();
        let outcome = torrent
            .write_block(1, bad.offset, Bytes::from(vec![0xAA; 16]))
            .await
            .unwrap();

        assert_eq!(outcome, BlockOutcome::PieceFailed);
        assert!(!torrent.have_piece(1));
        assert_eq!(torrent.priority_of(1), Some(4));
        assert!(torrent.wanted_pieces().contains(&1));
    }

    #[tokio::test]
    async fn test_unrequested_block_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (data, metainfo) = sample(32, 16);
        let torrent = open(dir.path(), metainfo, 16);

        let outcome = torrent
            .write_block(0, 0, Bytes::copy_from_slice(&data[..16]))
            .await
            .unwrap();
        assert_eq!(outcome, BlockOutcome::Unexpected);
        assert!(!dir.path().join("sample.bin").exists());
    }

    #[tokio::test]
    async fn test_recheck_finds_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let (data, metainfo) = sample(48, 16);
        let mut damaged = data.clone();
        damaged[20] ^= 0xff;
        std::fs::write(dir.path().join("sample.bin"), &damaged).unwrap();

        let torrent = open(dir.path(), metainfo, 16);
        assert_eq!(torrent.recheck().await.unwrap(), 2);
        assert!(torrent.have_piece(0));
        assert!(!torrent.have_piece(1));
        assert!(torrent.have_piece(2));
        assert_eq!(torrent.wanted_pieces(), vec![1]);
    }

    #[tokio::test]
    async fn test_evicted_piece_is_wanted_again() {
        let dir = tempfile::tempdir().unwrap();
        let (data, metainfo) = sample(48, 16);
        let mut config = CoreConfig::new()
            .base_dir(dir.path())
            .backend(StorageBackendKind::PieceStore)
            .capacity(Some(32));
        config.session.block_size = 16;
        let torrent = Torrent::open(metainfo, config).unwrap();

        let requests = torrent.next_requests(1, &all(3), None, &[], 100);
        assert_eq!(requests.len(), 3);
        for request in requests {
            let start = (request.piece * 16) as usize;
            let block = Bytes::copy_from_slice(&data[start..start + 16]);
            let outcome = torrent
                .write_block(request.piece, request.offset, block)
                .await
                .unwrap();
            assert_eq!(outcome, BlockOutcome::PieceCompleted);
        }

        // Only two pieces fit; the torrent agrees with its storage
        let storage = torrent.storage();
        for piece in 0..3 {
            assert_eq!(torrent.have_piece(piece), storage.is_complete(piece), "piece {}", piece);
        }
        assert!(!torrent.is_complete());
        let progress = torrent.progress();
        assert_eq!(progress.have_pieces, 2);
        assert_eq!(progress.verified_bytes, 32);

        let lost: Vec<u32> = (0..3).filter(|p| !torrent.have_piece(*p)).collect();
        assert_eq!(lost.len(), 1);
        assert_eq!(torrent.wanted_pieces(), lost);
        assert!(torrent.read_block(lost[0], 0, 16).await.unwrap().is_none());
        assert_eq!(
            torrent.next_requests(2, &all(3), None, &[], 10),
            vec![BlockRequest::new(lost[0], 0, 16)]
        );
    }

    #[test]
    fn test_with_storage_validates_config() {
        let dir = tempfile::tempdir().unwrap();
        let (_, metainfo) = sample(32, 16);
        let torrent = open(dir.path(), metainfo, 16);

        let mut config = torrent.config().clone();
        config.session.max_message_length = 4;
        let rebuilt = Torrent::with_storage(
            *torrent.info_hash(),
            Arc::clone(torrent.info()),
            torrent.storage(),
            config,
            instrument::noop(),
        );
        assert!(matches!(
            rebuilt,
            Err(EngineError::InvalidInput { field: "max_message_length", .. })
        ));
    }

    #[test]
    fn test_set_priority_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let (_, metainfo) = sample(32, 16);
        let torrent = open(dir.path(), metainfo, 16);
        assert!(matches!(
            torrent.set_priority(2, 0),
            Err(EngineError::InvalidInput { field: "piece", .. })
        ));
    }

    #[test]
    fn test_peer_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (_, metainfo) = sample(16, 16);
        let torrent = open(dir.path(), metainfo, 16);

        let a: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        torrent.add_peers([a, b, a]);
        assert_eq!(torrent.known_peer_count(), 2);

        let taken = torrent.take_peers(1);
        assert_eq!(taken.len(), 1);
        assert_eq!(torrent.known_peer_count(), 1);
        assert_eq!(torrent.take_peers(5).len(), 1);
        assert!(torrent.take_peers(5).is_empty());
    }

    #[test]
    fn test_interest() {
        let dir = tempfile::tempdir().unwrap();
        let (_, metainfo) = sample(32, 16);
        let torrent = open(dir.path(), metainfo, 16);

        assert!(torrent.is_interesting(&all(2)));
        assert!(!torrent.is_interesting(&bitvec![u8, Msb0; 0; 2]));
    }
}
