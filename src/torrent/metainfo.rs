//! Decoded torrent metadata
//!
//! The data plane never parses bencode. The discovery/metadata layer hands it
//! an already-decoded `Metainfo`, and everything here is arithmetic over the
//! logical byte space: piece ranges, piece hashes and the file layout.

use std::path::{Component, Path, PathBuf};

use crate::error::{EngineError, Result, StorageError};

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// Decoded torrent metadata
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 hash of the bencoded info dictionary
    pub info_hash: Sha1Hash,
    /// The decoded info dictionary
    pub info: Info,
}

/// The info dictionary
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or directory
    pub name: String,
    /// Number of bytes per piece
    pub piece_length: u64,
    /// SHA-1 hash of each piece
    pub pieces: Vec<Sha1Hash>,
    /// Files in this torrent, in stream order
    pub files: Vec<FileInfo>,
    /// Total size of all files
    pub total_size: u64,
}

/// Information about a single file in the torrent
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Relative path below the torrent root
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Byte offset in the concatenated file stream
    pub offset: u64,
}

/// The part of one file covered by a byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSegment {
    /// Index into `Info::files`
    pub file_index: usize,
    /// Offset inside that file
    pub file_offset: u64,
    /// Bytes of the range that live in this file
    pub length: u64,
}

impl Metainfo {
    pub fn new(info_hash: Sha1Hash, info: Info) -> Self {
        Self { info_hash, info }
    }

    /// Get the info_hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

impl Info {
    /// Build the layout from a file list.
    ///
    /// Panics if `piece_length` is zero; that is a defect in whatever decoded
    /// the metadata, not a condition this layer can recover from.
    pub fn new(
        name: impl Into<String>,
        piece_length: u64,
        pieces: Vec<Sha1Hash>,
        files: Vec<(PathBuf, u64)>,
    ) -> Result<Self> {
        assert!(piece_length > 0, "piece length must be positive");

        let mut layout = Vec::with_capacity(files.len());
        let mut offset = 0u64;
        for (path, length) in files {
            for component in path.components() {
                validate_path_component(&component)?;
            }
            layout.push(FileInfo {
                path,
                length,
                offset,
            });
            offset += length;
        }

        let expected_pieces = offset.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(EngineError::invalid_input(
                "pieces",
                format!(
                    "Piece count mismatch: have {}, expected {} for {} bytes with {} byte pieces",
                    pieces.len(),
                    expected_pieces,
                    offset,
                    piece_length
                ),
            ));
        }

        Ok(Self {
            name: name.into(),
            piece_length,
            pieces,
            files: layout,
            total_size: offset,
        })
    }

    /// Single-file layout named after the torrent
    pub fn single_file(
        name: impl Into<String>,
        piece_length: u64,
        pieces: Vec<Sha1Hash>,
        length: u64,
    ) -> Result<Self> {
        let name = name.into();
        let path = PathBuf::from(&name);
        Self::new(name, piece_length, pieces, vec![(path, length)])
    }

    /// Get the total number of pieces
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Get the piece hash for a given piece index
    pub fn piece_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.pieces.get(index)
    }

    /// Get the byte range for a piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let start = index as u64 * self.piece_length;
        let end = std::cmp::min(start + self.piece_length, self.total_size);

        Some((start, end))
    }

    /// Get the length of a piece (last piece may be shorter)
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }

    /// Files overlapping a piece
    pub fn files_for_piece(&self, index: usize) -> Vec<FileSegment> {
        match self.piece_range(index) {
            Some((start, end)) => self.file_segments(start, end - start),
            None => Vec::new(),
        }
    }

    /// Split a torrent-space byte range at file boundaries.
    ///
    /// Zero-length files never appear in the result. The range is clipped to
    /// the end of the torrent.
    pub fn file_segments(&self, offset: u64, length: u64) -> Vec<FileSegment> {
        let range_end = offset.saturating_add(length).min(self.total_size);
        let mut result = Vec::new();
        if offset >= range_end {
            return result;
        }

        for (file_index, file) in self.files.iter().enumerate() {
            let file_start = file.offset;
            let file_end = file.offset + file.length;

            if file.length == 0 || file_start >= range_end || file_end <= offset {
                continue;
            }

            let overlap_start = std::cmp::max(offset, file_start);
            let overlap_end = std::cmp::min(range_end, file_end);

            result.push(FileSegment {
                file_index,
                file_offset: overlap_start - file_start,
                length: overlap_end - overlap_start,
            });
        }

        result
    }

    /// Absolute path of a file below `base_dir`
    pub fn file_path(&self, base_dir: &Path, file_index: usize) -> Option<PathBuf> {
        self.files.get(file_index).map(|f| base_dir.join(&f.path))
    }
}

/// Reject path components that would escape the storage directory
pub fn validate_path_component(component: &Component) -> std::result::Result<(), StorageError> {
    match component {
        Component::ParentDir => Err(StorageError::InvalidPath(
            "file path contains parent directory reference (..)".to_string(),
        )),
        Component::RootDir | Component::Prefix(_) => Err(StorageError::InvalidPath(
            "file path contains absolute path".to_string(),
        )),
        _ => Ok(()),
    }
}
