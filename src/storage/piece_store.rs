//! Content-addressed piece store
//!
//! Pieces are stored as standalone objects named by the hex of their SHA-1:
//!
//! ```text
//! <root>/incomplete/<hex>   blocks as they arrive
//! <root>/completed/<hex>    verified pieces, shared by every torrent
//! ```
//!
//! Completing a piece copies the incomplete object into the completed
//! namespace while hashing it. With a capacity set, the least recently used
//! completed objects are evicted to make room first; pieces of this torrent
//! lost that way are queued for `take_evicted`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::file::read_full;
use super::{locate, piece_size, read_span, write_span, PieceLocks, PieceStorage};
use crate::error::StorageError;
use crate::instrument::{self, SharedInstrumentation};
use crate::torrent::metainfo::{Info, Sha1Hash};

const INCOMPLETE_DIR: &str = "incomplete";
const COMPLETED_DIR: &str = "completed";

/// Copy buffer size for completion
const COPY_CHUNK: usize = 64 * 1024;

/// A completed object found while making space
struct StoredObject {
    path: PathBuf,
    size: u64,
    last_used: SystemTime,
}

/// Piece storage in a content-addressed object store
pub struct PieceStore {
    info: Arc<Info>,
    root: PathBuf,
    capacity: Option<u64>,
    /// Known completion by piece hash. Absent means "look on disk".
    completion: Mutex<HashMap<Sha1Hash, bool>>,
    /// Piece indices by hash; identical pieces share an object
    pieces_by_hash: HashMap<Sha1Hash, Vec<u32>>,
    /// Complete pieces whose objects were evicted since the last drain
    evicted: Mutex<Vec<u32>>,
    locks: PieceLocks,
    instrument: SharedInstrumentation,
}

impl PieceStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Completed objects already present for this torrent's pieces are
    /// picked up as complete.
    pub fn open(
        info: Arc<Info>,
        root: impl AsRef<Path>,
        capacity: Option<u64>,
    ) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        for dir in [INCOMPLETE_DIR, COMPLETED_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|e| StorageError::io(&path, e))?;
        }

        let mut pieces_by_hash: HashMap<Sha1Hash, Vec<u32>> = HashMap::new();
        for (piece, hash) in info.pieces.iter().enumerate() {
            pieces_by_hash.entry(*hash).or_default().push(piece as u32);
        }

        let store = Self {
            locks: PieceLocks::new(info.num_pieces()),
            completion: Mutex::new(HashMap::new()),
            pieces_by_hash,
            evicted: Mutex::new(Vec::new()),
            info,
            root,
            capacity,
            instrument: instrument::noop(),
        };
        store.seed_completion()?;
        Ok(store)
    }

    /// Report evictions to `instrument`
    pub fn with_instrumentation(mut self, instrument: SharedInstrumentation) -> Self {
        self.instrument = instrument;
        self
    }

    /// Configured capacity of the completed namespace
    pub fn capacity(&self) -> Option<u64> {
        self.capacity
    }

    fn incomplete_path(&self, hash: &Sha1Hash) -> PathBuf {
        self.root.join(INCOMPLETE_DIR).join(hex::encode(hash))
    }

    fn completed_path(&self, hash: &Sha1Hash) -> PathBuf {
        self.root.join(COMPLETED_DIR).join(hex::encode(hash))
    }

    fn hash_of(&self, piece: u32) -> Result<Sha1Hash, StorageError> {
        self.info
            .piece_hash(piece as usize)
            .copied()
            .ok_or(StorageError::PieceOutOfRange {
                piece,
                num_pieces: self.info.num_pieces(),
            })
    }

    fn seed_completion(&self) -> Result<(), StorageError> {
        let mut sizes: HashMap<Sha1Hash, u64> = HashMap::new();
        for (hash, pieces) in &self.pieces_by_hash {
            if let Some(size) = self.info.piece_size(pieces[0] as usize) {
                sizes.insert(*hash, size);
            }
        }

        let dir = self.root.join(COMPLETED_DIR);
        let entries = fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;
        let mut completion = self.completion.lock();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&dir, e))?;
            let Some(hash) = parse_object_name(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            let Some(expected) = sizes.get(&hash) else {
                continue;
            };
            let len = entry
                .metadata()
                .map_err(|e| StorageError::io(entry.path(), e))?
                .len();
            completion.insert(hash, len == *expected);
        }

        tracing::debug!(
            root = ?self.root,
            complete = completion.values().filter(|c| **c).count(),
            "Seeded piece store completion"
        );
        Ok(())
    }

    fn piece_complete(&self, piece: u32) -> Result<bool, StorageError> {
        let hash = self.hash_of(piece)?;
        if let Some(known) = self.completion.lock().get(&hash) {
            return Ok(*known);
        }

        let size = piece_size(&self.info, piece)?;
        let complete = match fs::metadata(self.completed_path(&hash)) {
            Ok(meta) => meta.len() == size,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(StorageError::io(self.completed_path(&hash), e)),
        };
        self.completion.lock().insert(hash, complete);
        Ok(complete)
    }

    fn forget(&self, hash: &Sha1Hash) {
        self.completion.lock().remove(hash);
    }

    /// Forget an evicted object, queueing our pieces that were complete
    fn evict(&self, hash: &Sha1Hash) {
        let was_complete = self.completion.lock().remove(hash) == Some(true);
        if !was_complete {
            return;
        }
        if let Some(pieces) = self.pieces_by_hash.get(hash) {
            self.evicted.lock().extend_from_slice(pieces);
        }
    }

    /// Read from one piece's object. Returns the bytes read; fewer than
    /// `buf.len()` means the object ended early or is missing.
    fn read_piece(&self, piece: u32, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let hash = self.hash_of(piece)?;

        if self.piece_complete(piece)? {
            let path = self.completed_path(&hash);
            match File::open(&path) {
                Ok(mut file) => return read_object(&mut file, &path, offset, buf),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::debug!(piece, "Completed object vanished, falling back to incomplete");
                    self.forget(&hash);
                }
                Err(e) => return Err(StorageError::io(path, e)),
            }
        }

        let path = self.incomplete_path(&hash);
        match File::open(&path) {
            Ok(mut file) => read_object(&mut file, &path, offset, buf),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    /// Evict least recently used completed objects until `space` more bytes
    /// fit under the capacity
    pub fn make_space(&self, space: u64) -> Result<(), StorageError> {
        let Some(capacity) = self.capacity else {
            return Ok(());
        };
        if space > capacity {
            return Err(StorageError::CapacityExceeded {
                requested: space,
                capacity,
            });
        }

        let dir = self.root.join(COMPLETED_DIR);
        let mut objects = Vec::new();
        let mut total = 0u64;
        for entry in fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))? {
            let entry = entry.map_err(|e| StorageError::io(&dir, e))?;
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                // Removed concurrently
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io(entry.path(), e)),
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let accessed = meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
            total += meta.len();
            objects.push(StoredObject {
                path: entry.path(),
                size: meta.len(),
                last_used: modified.max(accessed),
            });
        }

        let limit = capacity - space;
        if total <= limit {
            return Ok(());
        }

        objects.sort_by_key(|object| object.last_used);
        let mut evicted = 0u64;
        for object in objects {
            if total <= limit {
                break;
            }
            match fs::remove_file(&object.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(&object.path, e)),
            }
            if let Some(hash) = object
                .path
                .file_name()
                .and_then(|name| parse_object_name(&name.to_string_lossy()))
            {
                self.evict(&hash);
            }
            total -= object.size;
            evicted += object.size;
        }

        tracing::debug!(evicted, total, capacity, "Evicted completed pieces");
        self.instrument.piece_evicted(evicted);
        Ok(())
    }
}

fn parse_object_name(name: &str) -> Option<Sha1Hash> {
    let bytes = hex::decode(name).ok()?;
    bytes.try_into().ok()
}

fn read_object(
    file: &mut File,
    path: &Path,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize, StorageError> {
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| StorageError::io(path, e))?;
    read_full(file, buf).map_err(|e| StorageError::io(path, e))
}

impl PieceStorage for PieceStore {
    fn num_pieces(&self) -> usize {
        self.info.num_pieces()
    }

    fn read_at(&self, piece: u32, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let (start, readable) = read_span(&self.info, piece, offset, buf.len())?;

        let mut done = 0usize;
        while done < readable {
            let (current, in_piece) = locate(&self.info, start + done as u64);
            let size = piece_size(&self.info, current)?;
            let want = ((size - in_piece) as usize).min(readable - done);

            let n = self.read_piece(current, in_piece, &mut buf[done..done + want])?;
            done += n;
            if n < want {
                return Err(StorageError::UnexpectedShortRead {
                    piece,
                    offset,
                    read: done,
                    expected: readable,
                });
            }
        }

        Ok(done)
    }

    fn write_at(&self, piece: u32, offset: u64, data: &[u8]) -> Result<usize, StorageError> {
        write_span(&self.info, piece, offset, data.len())?;
        let hash = self.hash_of(piece)?;
        let _guard = self.locks.lock(piece);
        if self.piece_complete(piece)? {
            return Err(StorageError::AlreadyComplete(piece));
        }

        let path = self.incomplete_path(&hash);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::io(&path, e))?;
        file.write_all(data).map_err(|e| match e.kind() {
            io::ErrorKind::WriteZero => StorageError::UnexpectedShortWrite {
                piece,
                offset,
                written: 0,
                expected: data.len(),
            },
            _ => StorageError::io(&path, e),
        })?;

        Ok(data.len())
    }

    fn mark_complete(&self, piece: u32) -> Result<(), StorageError> {
        let hash = self.hash_of(piece)?;
        let size = piece_size(&self.info, piece)?;
        let _guard = self.locks.lock(piece);
        if self.piece_complete(piece)? {
            return Err(StorageError::AlreadyComplete(piece));
        }

        self.make_space(size)?;

        let source_path = self.incomplete_path(&hash);
        let mut source = match File::open(&source_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::UnexpectedShortRead {
                    piece,
                    offset: 0,
                    read: 0,
                    expected: size as usize,
                })
            }
            Err(e) => return Err(StorageError::io(source_path, e)),
        };

        let target_path = self.completed_path(&hash);
        let mut target = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyInNamespace(piece))
            }
            Err(e) => return Err(StorageError::io(target_path, e)),
        };

        let copied = copy_hashing(&mut source, &mut target, size).and_then(|(copied, digest)| {
            target.sync_all()?;
            Ok((copied, digest))
        });
        let failure = match copied {
            Ok((copied, _)) if copied < size => Some(StorageError::UnexpectedShortRead {
                piece,
                offset: 0,
                read: copied as usize,
                expected: size as usize,
            }),
            Ok((_, digest)) if digest != hash => Some(StorageError::HashMismatch(piece)),
            Ok(_) => None,
            Err(e) => Some(StorageError::io(&target_path, e)),
        };

        if let Some(error) = failure {
            drop(target);
            if let Err(e) = fs::remove_file(&target_path) {
                tracing::warn!(piece, error = %e, "Failed to remove rejected completed object");
            }
            return Err(error);
        }

        if let Err(e) = fs::remove_file(&source_path) {
            tracing::warn!(piece, error = %e, "Failed to remove incomplete object");
        }
        self.completion.lock().insert(hash, true);
        tracing::debug!(piece, hash = %hex::encode(hash), "Piece stored in completed namespace");
        Ok(())
    }

    fn is_complete(&self, piece: u32) -> bool {
        match self.piece_complete(piece) {
            Ok(complete) => complete,
            Err(e) => {
                tracing::warn!(piece, error = %e, "Could not determine piece completion");
                false
            }
        }
    }

    fn take_evicted(&self) -> Vec<u32> {
        std::mem::take(&mut *self.evicted.lock())
    }
}

/// Copy at most `limit` bytes, hashing them on the way
fn copy_hashing(source: &mut File, target: &mut File, limit: u64) -> io::Result<(u64, Sha1Hash)> {
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;

    while copied < limit {
        let want = ((limit - copied) as usize).min(buf.len());
        let n = source.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        target.write_all(&buf[..n])?;
        copied += n as u64;
    }

    Ok((copied, hasher.finalize().into()))
}
