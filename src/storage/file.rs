//! File-tree storage
//!
//! Torrent bytes live in the torrent's own file layout below a base
//! directory. Files are opened per operation and created on first write.
//! Completion is kept in memory, and in a completion database when one is
//! attached.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitvec::prelude::*;
use parking_lot::Mutex;

use super::completion::PieceCompletion;
use super::{read_span, write_span, PieceLocks, PieceStorage};
use crate::error::StorageError;
use crate::torrent::metainfo::Info;

/// Piece storage over a plain directory tree
pub struct FileStorage {
    info: Arc<Info>,
    base_dir: PathBuf,
    completed: Mutex<BitVec<u8, Msb0>>,
    persisted: Option<PieceCompletion>,
    locks: PieceLocks,
}

impl FileStorage {
    pub fn new(info: Arc<Info>, base_dir: impl AsRef<Path>) -> Self {
        let num_pieces = info.num_pieces();
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            completed: Mutex::new(bitvec![u8, Msb0; 0; num_pieces]),
            persisted: None,
            locks: PieceLocks::new(num_pieces),
            info,
        }
    }

    /// Record completion in `completion`, starting from what it already
    /// holds for this torrent
    pub fn with_completion(mut self, completion: PieceCompletion) -> Result<Self, StorageError> {
        let loaded = completion.load(self.info.num_pieces())?;
        tracing::debug!(
            dir = ?self.base_dir,
            complete = loaded.count_ones(),
            "Loaded piece completion"
        );
        *self.completed.get_mut() = loaded;
        self.persisted = Some(completion);
        Ok(self)
    }

    /// Directory the file tree is rooted at
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_of(&self, file_index: usize) -> PathBuf {
        self.base_dir.join(&self.info.files[file_index].path)
    }
}

/// Read until `buf` is full or the file ends
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl PieceStorage for FileStorage {
    fn num_pieces(&self) -> usize {
        self.info.num_pieces()
    }

    fn read_at(&self, piece: u32, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let (start, readable) = read_span(&self.info, piece, offset, buf.len())?;
        let short = |read: usize| StorageError::UnexpectedShortRead {
            piece,
            offset,
            read,
            expected: readable,
        };

        let mut done = 0usize;
        for segment in self.info.file_segments(start, readable as u64) {
            let path = self.path_of(segment.file_index);
            let mut file = match File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(short(done)),
                Err(e) => return Err(StorageError::io(path, e)),
            };

            let want = segment.length as usize;
            file.seek(SeekFrom::Start(segment.file_offset))
                .map_err(|e| StorageError::io(&path, e))?;
            let n = read_full(&mut file, &mut buf[done..done + want])
                .map_err(|e| StorageError::io(&path, e))?;
            done += n;
            if n < want {
                return Err(short(done));
            }
        }

        tracing::trace!(piece, offset, bytes = done, "File storage read");
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
            let path = self.path_of(segment.file_index);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| StorageError::io(&path, e))?;
            file.seek(SeekFrom::Start(segment.file_offset))
                .map_err(|e| StorageError::io(&path, e))?;

            let chunk = &data[done..done + segment.length as usize];
            let mut written = 0;
            while written < chunk.len() {
                match file.write(&chunk[written..]) {
                    Ok(0) => {
                        return Err(StorageError::UnexpectedShortWrite {
                            piece,
                            offset,
                            written: done + written,
                            expected: data.len(),
                        });
                    }
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(StorageError::io(&path, e)),
                }
            }
            done += written;
        }

        Ok(done)
    }

    fn mark_complete(&self, piece: u32) -> Result<(), StorageError> {
        super::piece_size(&self.info, piece)?;
        let _guard = self.locks.lock(piece);
        if self.is_complete(piece) {
            return Err(StorageError::AlreadyComplete(piece));
        }
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
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;

    #[test]
    fn test_read_spans_files() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample_data(17);
        let info = info_for(&data, 4, &[("a.bin", 10), ("sub/b.bin", 7)]);
        let storage = FileStorage::new(info.clone(), dir.path());
        write_all(&storage, &info, &data);

        assert_eq!(fs::read(dir.path().join("a.bin")).unwrap(), &data[..10]);
        assert_eq!(fs::read(dir.path().join("sub/b.bin")).unwrap(), &data[10..]);

        // Starts in piece 2, crosses the file boundary and two pieces
        let mut buf = vec![0u8; 6];
        assert_eq!(storage.read_at(2, 1, &mut buf).unwrap(), 6);
        assert_eq!(buf, &data[9..15]);
    }

    #[test]
    fn test_read_past_end_is_short_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample_data(17);
        let info = info_for(&data, 4, &[("a.bin", 10), ("b.bin", 7)]);
        let storage = FileStorage::new(info.clone(), dir.path());
        write_all(&storage, &info, &data);

        let mut buf = vec![0u8; 8];
        assert_eq!(storage.read_at(3, 2, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &data[14..]);
    }

    #[test]
    fn test_missing_file_is_short_read_at_first_gap() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample_data(17);
        let info = info_for(&data, 4, &[("a.bin", 10), ("b.bin", 7)]);
        let storage = FileStorage::new(info.clone(), dir.path());

        // Only the first file exists
        storage.write_at(0, 0, &data[0..4]).unwrap();
        storage.write_at(1, 0, &data[4..8]).unwrap();
        storage.write_at(2, 0, &data[8..10]).unwrap();

        let mut buf = vec![0u8; 8];
        match storage.read_at(1, 0, &mut buf) {
            Err(StorageError::UnexpectedShortRead { read, expected, .. }) => {
                assert_eq!(read, 6);
                assert_eq!(expected, 8);
            }
            other => panic!("expected short read, got {:?}", other),
        }
        assert_eq!(&buf[..6], &data[4..10]);
    }

    #[test]
    fn test_truncated_file_is_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample_data(8);
        let info = info_for(&data, 4, &[("a.bin", 8)]);
        let storage = FileStorage::new(info, dir.path());
        storage.write_at(0, 0, &data[..4]).unwrap();

        let mut buf = vec![0u8; 8];
        assert!(matches!(
            storage.read_at(0, 0, &mut buf),
            Err(StorageError::UnexpectedShortRead { read: 4, .. })
        ));
    }

    #[test]
    fn test_complete_piece_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample_data(8);
        let info = info_for(&data, 4, &[("a.bin", 8)]);
        let storage = FileStorage::new(info.clone(), dir.path());
        write_all(&storage, &info, &data);

        storage.mark_complete(1).unwrap();
        assert!(storage.is_complete(1));
        assert!(matches!(
            storage.mark_complete(1),
            Err(StorageError::AlreadyComplete(1))
        ));
        assert!(matches!(
            storage.write_at(1, 0, b"zz"),
            Err(StorageError::AlreadyComplete(1))
        ));
        // Other pieces stay writable
        storage.write_at(0, 2, b"zz").unwrap();
    }

    #[test]
    fn test_completion_survives_reopen() {
        use crate::storage::completion::CompletionStore;

        let dir = tempfile::tempdir().unwrap();
        let data = sample_data(12);
        let info = info_for(&data, 4, &[("a.bin", 12)]);
        let hash = [4u8; 20];
        let completion = |dir: &Path| {
            let store = Arc::new(CompletionStore::open_in_dir(dir).unwrap());
            PieceCompletion::new(store, hash)
        };

        {
            let storage = FileStorage::new(info.clone(), dir.path())
                .with_completion(completion(dir.path()))
                .unwrap();
            write_all(&storage, &info, &data);
            storage.mark_complete(0).unwrap();
            storage.mark_complete(2).unwrap();
        }

        let storage = FileStorage::new(info.clone(), dir.path())
            .with_completion(completion(dir.path()))
            .unwrap();
        assert!(storage.is_complete(0));
        assert!(!storage.is_complete(1));
        assert!(storage.is_complete(2));
        assert!(matches!(
            storage.write_at(2, 0, b"x"),
            Err(StorageError::AlreadyComplete(2))
        ));

        // Without the database nothing is known
        let bare = FileStorage::new(info, dir.path());
        assert!(!bare.is_complete(0));
    }

    #[test]
    fn test_write_out_of_piece_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = sample_data(8);
        let info = info_for(&data, 4, &[("a.bin", 8)]);
        let storage = FileStorage::new(info, dir.path());

        assert!(matches!(
            storage.write_at(0, 3, b"ab"),
            Err(StorageError::RangeOutOfBounds { .. })
        ));
        assert!(matches!(
            storage.write_at(2, 0, b"a"),
            Err(StorageError::PieceOutOfRange { .. })
        ));
        assert!(!storage.is_complete(7));
    }
}
