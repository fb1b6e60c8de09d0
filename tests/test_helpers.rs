//! Test Helpers
//!
//! Builders for torrent layouts with known content, plus small helpers for
//! configurations and waiting on asynchronous conditions.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use gosh_bt::torrent::{Info, Metainfo};
use gosh_bt::{CoreConfig, EncryptionPolicy, StorageBackendKind};
use sha1::{Digest, Sha1};

/// Builder for creating test torrent data
pub struct TestTorrentBuilder {
    name: String,
    piece_length: u64,
    files: Vec<TestFile>,
}

/// A file in the test torrent
struct TestFile {
    path: PathBuf,
    content: Vec<u8>,
}

impl TestTorrentBuilder {
    /// Create a new test torrent builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            piece_length: 16384, // 16KB default
            files: Vec::new(),
        }
    }

    /// Set the piece length
    pub fn piece_length(mut self, length: u64) -> Self {
        self.piece_length = length;
        self
    }

    /// Add a file with specific content
    pub fn add_file(mut self, path: impl Into<PathBuf>, content: Vec<u8>) -> Self {
        self.files.push(TestFile {
            path: path.into(),
            content,
        });
        self
    }

    /// Create a single-file torrent with patterned content
    pub fn single_file(name: impl Into<String>, size: usize) -> Self {
        let name = name.into();
        let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        Self::new(&name).add_file(&name, content)
    }

    /// Create a multi-file torrent whose pieces straddle file boundaries
    pub fn multi_file(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(&name)
            .piece_length(64)
            .add_file(format!("{}/file1.txt", name), b"Hello World!".to_vec())
            .add_file(format!("{}/empty", name), Vec::new())
            .add_file(format!("{}/file2.txt", name), b"Test content here".to_vec())
            .add_file(
                format!("{}/subdir/file3.bin", name),
                (0..1000).map(|i| (i % 256) as u8).collect(),
            )
    }

    /// All file content, concatenated in torrent order
    pub fn content(&self) -> Vec<u8> {
        self.files
            .iter()
            .flat_map(|f| f.content.iter().copied())
            .collect()
    }

    /// Get the piece data for a specific piece index
    pub fn get_piece_data(&self, piece_index: usize) -> Vec<u8> {
        let all_content = self.content();
        let start = piece_index * self.piece_length as usize;
        let end = (start + self.piece_length as usize).min(all_content.len());

        if start >= all_content.len() {
            return Vec::new();
        }

        all_content[start..end].to_vec()
    }

    /// Build the metainfo; the info hash is the SHA-1 of the name
    pub fn build(&self) -> Metainfo {
        let piece_hashes: Vec<[u8; 20]> = self
            .content()
            .chunks(self.piece_length as usize)
            .map(|piece| Sha1::digest(piece).into())
            .collect();

        let files = self
            .files
            .iter()
            .map(|f| (f.path.clone(), f.content.len() as u64))
            .collect();
        let info = Info::new(&self.name, self.piece_length, piece_hashes, files)
            .expect("valid test layout");
        let info_hash: [u8; 20] = Sha1::digest(self.name.as_bytes()).into();

        Metainfo::new(info_hash, info)
    }

    /// Write every file below `dir`, as a finished download would have
    pub fn write_files(&self, dir: &Path) {
        for file in &self.files {
            let path = dir.join(&file.path);
            std::fs::create_dir_all(path.parent().expect("file has a parent")).unwrap();
            std::fs::write(path, &file.content).unwrap();
        }
    }
}

/// Configuration for tests: given backend and directory, small blocks
pub fn test_config(
    dir: &Path,
    backend: StorageBackendKind,
    policy: EncryptionPolicy,
) -> CoreConfig {
    let mut config = CoreConfig::new()
        .base_dir(dir)
        .backend(backend)
        .encryption_policy(policy);
    config.session.block_size = 16;
    config.session.max_pending_requests = 8;
    config.encryption.handshake_timeout_secs = 10;
    config
}

/// Create a temporary directory for test downloads
pub fn create_temp_download_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(timeout_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_file_layout() {
        let builder = TestTorrentBuilder::single_file("test.txt", 32768);
        let metainfo = builder.build();

        // Should have 2 pieces (32KB / 16KB)
        assert_eq!(metainfo.info.num_pieces(), 2);
        assert_eq!(metainfo.info.total_size, 32768);
    }

    #[test]
    fn test_multi_file_layout() {
        let builder = TestTorrentBuilder::multi_file("multi");
        let metainfo = builder.build();

        assert_eq!(metainfo.info.files.len(), 4);
        assert_eq!(metainfo.info.total_size, 12 + 17 + 1000);
        assert_eq!(builder.get_piece_data(0).len(), 64);
        assert_eq!(builder.get_piece_data(16).len(), 1029 - 16 * 64);
    }
}
