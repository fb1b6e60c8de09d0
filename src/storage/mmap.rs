//! Memory-mapped storage
//!
//! Every non-empty file of the torrent is created (or extended) to its full
//! length and mapped read-write when the storage is opened. Piece I/O is then
//! plain memory copies through the mappings. A piece's mapped range is
//! flushed before its completion is recorded.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitvec::prelude::*;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock};

use super::completion::PieceCompletion;
use super::{read_span, write_span, PieceLocks, PieceStorage};
use crate::error::StorageError;
use crate::torrent::metainfo::Info;

/// One mapped file
struct MappedFile {
    path: PathBuf,
    map: RwLock<MmapMut>,
}

/// Piece storage over memory-mapped files
pub struct MmapStorage {
    info: Arc<Info>,
    /// Indexed like `Info::files`; `None` for zero-length files
    files: Vec<Option<MappedFile>>,
    completed: Mutex<BitVec<u8, Msb0>>,
    persisted: Option<PieceCompletion>,
    locks: PieceLocks,
}

impl MmapStorage {
    /// Create, size and map every file below `base_dir`.
    ///
    /// On failure, mappings made so far are released before returning.
    pub fn open(info: Arc<Info>, base_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_dir = base_dir.as_ref();
        let mut files = Vec::with_capacity(info.files.len());

        for file in &info.files {
            let path = base_dir.join(&file.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }

            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| StorageError::io(&path, e))?;

            let current = handle
                .metadata()
                .map_err(|e| StorageError::io(&path, e))?
                .len();
            if current < file.length {
                handle
                    .set_len(file.length)
                    .map_err(|e| StorageError::io(&path, e))?;
            }

            if file.length == 0 {
                files.push(None);
                continue;
            }

            // SAFETY: the files below base_dir belong to this storage and are
            // not truncated by us while mapped.
            let map = unsafe { MmapOptions::new().len(file.length as usize).map_mut(&handle) }
                .map_err(|e| StorageError::Mmap {
                    path: path.clone(),
                    message: e.to_string(),
                })?;

            files.push(Some(MappedFile {
                path,
                map: RwLock::new(map),
            }));
        }

        tracing::debug!(
            dir = ?base_dir,
            mapped = files.iter().filter(|f| f.is_some()).count(),
            "Mapped torrent files"
        );

        let num_pieces = info.num_pieces();
        Ok(Self {
            info,
            files,
            completed: Mutex::new(bitvec![u8, Msb0; 0; num_pieces]),
            persisted: None,
            locks: PieceLocks::new(num_pieces),
        })
    }

    /// Record completion in `completion`, starting from what it already
    /// holds for this torrent
    pub fn with_completion(mut self, completion: PieceCompletion) -> Result<Self, StorageError> {
        *self.completed.get_mut() = completion.load(self.info.num_pieces())?;
        self.persisted = Some(completion);
        Ok(self)
    }

    fn mapped(&self, file_index: usize) -> Result<&MappedFile, StorageError> {
        self.files
            .get(file_index)
            .and_then(Option::as_ref)
            .ok_or_else(|| StorageError::Mmap {
                path: self.info.files[file_index].path.clone(),
                message: "file is not mapped".to_string(),
            })
    }

    fn flush_piece(&self, piece: u32) -> Result<(), StorageError> {
        for segment in self.info.files_for_piece(piece as usize) {
            let file = self.mapped(segment.file_index)?;
            file.map
                .read()
                .flush_range(segment.file_offset as usize, segment.length as usize)
                .map_err(|e| StorageError::io(&file.path, e))?;
        }
        Ok(())
    }
}

impl PieceStorage for MmapStorage {
    fn num_pieces(&self) -> usize {
        self.info.num_pieces()
    }

    fn read_at(&self, piece: u32, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let (start, readable) = read_span(&self.info, piece, offset, buf.len())?;

        let mut done = 0usize;
        for segment in self.info.file_segments(start, readable as u64) {
            let file = self.mapped(segment.file_index)?;
            let from = segment.file_offset as usize;
            let len = segment.length as usize;
            buf[done..done + len].copy_from_slice(&file.map.read()[from..from + len]);
            done += len;
        }

        Ok(done)
    }

    fn write_at(&self, piece: u32, offset: u64, data: &[u8]) -> Result<usize, StorageError> {
        let start = write_span(&self.info, piece, offset, data.len())?;
        let _guard = self.locks.lock(piece);
        if self.is_complete(piece) {
            return Err(StorageError::AlreadyComplete(piece));
        }

        let mut done = 0usize;
        for segment in self.info.file_segments(start, data.len() as u64) {
            let file = self.mapped(segment.file_index)?;
            let to = segment.file_offset as usize;
            let len = segment.length as usize;
            file.map.write()[to..to + len].copy_from_slice(&data[done..done + len]);
            done += len;
        }

        Ok(done)
    }

    fn mark_complete(&self, piece: u32) -> Result<(), StorageError> {
        super::piece_size(&self.info, piece)?;
        let _guard = self.locks.lock(piece);
        if self.is_complete(piece) {
            return Err(StorageError::AlreadyComplete(piece));
        }

        self.flush_piece(piece)?;
        if let Some(persisted) = &self.persisted {
            persisted.set(piece, true)?;
        }
        self.completed.lock().set(piece as usize, true);
        Ok(())
    }

    fn is_complete(&self, piece: u32) -> bool {
        self.completed
            .lock()
            .get(piece as usize)
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    fn flush(&self) -> Result<(), StorageError> {
        for file in self.files.iter().flatten() {
            file.map
                .read()
                .flush()
                .map_err(|e| StorageError::io(&file.path, e))?;
        }
        Ok(())
    }
}
