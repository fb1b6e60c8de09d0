//! Storage Module
//!
//! Piece data persistence. Every backend addresses bytes by (piece index,
//! offset inside the piece), keeps per-piece completion state, and refuses
//! writes to pieces that are already complete.
//!
//! The backends do blocking filesystem work. Async callers run them on the
//! blocking pool (`tokio::task::spawn_blocking`), as the session does.

pub mod completion;
pub mod file;
pub mod mmap;
pub mod piece_store;

pub use completion::{CompletionStore, PieceCompletion, COMPLETION_DB_NAME};
pub use file::FileStorage;
pub use mmap::MmapStorage;
pub use piece_store::PieceStore;

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use sha1::{Digest, Sha1};

use crate::config::{StorageBackendKind, StorageConfig};
use crate::error::StorageError;
use crate::instrument::SharedInstrumentation;
use crate::torrent::metainfo::{Info, Sha1Hash};

/// Piece-addressed storage for one torrent
pub trait PieceStorage: Send + Sync {
    /// Number of pieces in the torrent
    fn num_pieces(&self) -> usize;

    /// Read into `buf` starting at `offset` inside `piece`.
    ///
    /// The read may continue into following pieces. It returns fewer than
    /// `buf.len()` bytes only when it reaches the end of the torrent; any
    /// other shortfall is `StorageError::UnexpectedShortRead`, with the bytes
    /// before the gap already in `buf`.
    fn read_at(&self, piece: u32, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Write `data` at `offset` inside `piece`. The range must lie inside the
    /// piece, and the piece must not be complete.
    fn write_at(&self, piece: u32, offset: u64, data: &[u8]) -> Result<usize, StorageError>;

    /// Record that `piece` passed verification. Fails with `AlreadyComplete`
    /// on the second call.
    fn mark_complete(&self, piece: u32) -> Result<(), StorageError>;

    /// Check whether `piece` is complete
    fn is_complete(&self, piece: u32) -> bool;

    /// Flush buffered state to disk
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Pieces that were complete and have since been dropped by the backend
    /// (evicted to stay under a capacity). Each is reported once.
    fn take_evicted(&self) -> Vec<u32> {
        Vec::new()
    }
}

/// Open the backend selected in `config` for the torrent `info_hash`
pub fn open_storage(
    info_hash: &Sha1Hash,
    info: Arc<Info>,
    config: &StorageConfig,
    instrument: SharedInstrumentation,
) -> Result<Arc<dyn PieceStorage>, StorageError> {
    tracing::debug!(
        backend = %config.backend,
        base_dir = ?config.base_dir,
        pieces = info.num_pieces(),
        "Opening piece storage"
    );

    Ok(match config.backend {
        StorageBackendKind::File => {
            let storage = FileStorage::new(info, &config.base_dir);
            match open_completion(info_hash, config) {
                Some(completion) => Arc::new(storage.with_completion(completion)?),
                None => Arc::new(storage),
            }
        }
        StorageBackendKind::Mmap => {
            let storage = MmapStorage::open(info, &config.base_dir)?;
            match open_completion(info_hash, config) {
                Some(completion) => Arc::new(storage.with_completion(completion)?),
                None => Arc::new(storage),
            }
        }
        StorageBackendKind::PieceStore => Arc::new(
            PieceStore::open(info, &config.base_dir, config.capacity)?
                .with_instrumentation(instrument),
        ),
    })
}

/// Completion database for the file-tree and mmap backends. A database that
/// cannot be opened leaves completion in memory only.
fn open_completion(info_hash: &Sha1Hash, config: &StorageConfig) -> Option<PieceCompletion> {
    if !config.persist_completion {
        return None;
    }
    match CompletionStore::open_in_dir(&config.base_dir) {
        Ok(store) => Some(PieceCompletion::new(Arc::new(store), *info_hash)),
        Err(e) => {
            tracing::warn!(
                base_dir = ?config.base_dir,
                error = %e,
                "Cannot open piece completion database, completion kept in memory"
            );
            None
        }
    }
}

/// Read a whole piece back and compare it with its expected hash
pub fn verify_piece(
    storage: &dyn PieceStorage,
    info: &Info,
    piece: u32,
) -> Result<bool, StorageError> {
    let size = piece_size(info, piece)?;
    let expected = info.pieces[piece as usize];

    let mut data = vec![0u8; size as usize];
    let n = storage.read_at(piece, 0, &mut data)?;
    if n != data.len() {
        return Err(StorageError::UnexpectedShortRead {
            piece,
            offset: 0,
            read: n,
            expected: data.len(),
        });
    }

    let actual: [u8; 20] = Sha1::digest(&data).into();
    Ok(actual == expected)
}

/// One lock per piece, serializing writers of the same piece
pub(crate) struct PieceLocks(Vec<Mutex<()>>);

impl PieceLocks {
    pub(crate) fn new(num_pieces: usize) -> Self {
        Self((0..num_pieces).map(|_| Mutex::new(())).collect())
    }

    pub(crate) fn lock(&self, piece: u32) -> MutexGuard<'_, ()> {
        self.0[piece as usize].lock()
    }
}

/// Length of `piece`, or `PieceOutOfRange`
pub(crate) fn piece_size(info: &Info, piece: u32) -> Result<u64, StorageError> {
    info.piece_size(piece as usize)
        .ok_or(StorageError::PieceOutOfRange {
            piece,
            num_pieces: info.num_pieces(),
        })
}

/// Torrent-space offset and readable length of a read request
pub(crate) fn read_span(
    info: &Info,
    piece: u32,
    offset: u64,
    length: usize,
) -> Result<(u64, usize), StorageError> {
    let size = piece_size(info, piece)?;
    if offset > size {
        return Err(StorageError::RangeOutOfBounds {
            piece,
            offset,
            length,
            piece_length: size,
        });
    }

    let start = piece as u64 * info.piece_length + offset;
    let readable = (info.total_size - start).min(length as u64) as usize;
    Ok((start, readable))
}

/// Torrent-space offset of a write that must stay inside one piece
pub(crate) fn write_span(
    info: &Info,
    piece: u32,
    offset: u64,
    length: usize,
) -> Result<u64, StorageError> {
    let size = piece_size(info, piece)?;
    if offset + length as u64 > size {
        return Err(StorageError::RangeOutOfBounds {
            piece,
            offset,
            length,
            piece_length: size,
        });
    }
    Ok(piece as u64 * info.piece_length + offset)
}

/// Map a torrent-space position back to (piece, offset in piece)
pub(crate) fn locate(info: &Info, torrent_offset: u64) -> (u32, u64) {
    (
        (torrent_offset / info.piece_length) as u32,
        torrent_offset % info.piece_length,
    )
}
