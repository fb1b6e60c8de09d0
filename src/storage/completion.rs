//! Persistent piece completion
//!
//! The file-tree and mmap backends keep verified pieces in the torrent's own
//! files, which say nothing about which pieces were checked. Completion is
//! recorded in a small SQLite database next to the data instead, keyed by
//! (info hash, piece index), so a restart does not have to hash everything
//! again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bitvec::prelude::*;
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::StorageError;
use crate::torrent::metainfo::Sha1Hash;

/// Database file created in the storage root
pub const COMPLETION_DB_NAME: &str = ".torrent.db";

/// How long a write waits for another connection holding the database
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CURRENT_SCHEMA_VERSION: u32 = 1;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS completed (
    info_hash TEXT NOT NULL,
    piece INTEGER NOT NULL,
    UNIQUE (info_hash, piece) ON CONFLICT IGNORE
);
"#;

/// Completion database shared by every torrent under one root
pub struct CompletionStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl CompletionStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }

        let conn = Connection::open(path)?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migrate(&conn)?;

        tracing::debug!(path = ?path, "Opened piece completion database");
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open `.torrent.db` inside `dir`
    pub fn open_in_dir(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open(dir.as_ref().join(COMPLETION_DB_NAME))
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Database file, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Check one piece
    pub fn get(&self, info_hash: &Sha1Hash, piece: u32) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        let complete = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM completed WHERE info_hash = ?1 AND piece = ?2)",
            params![hex::encode(info_hash), piece],
            |row| row.get(0),
        )?;
        Ok(complete)
    }

    /// Record or clear completion of one piece
    pub fn set(
        &self,
        info_hash: &Sha1Hash,
        piece: u32,
        complete: bool,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        let hash = hex::encode(info_hash);
        if complete {
            conn.execute(
                "INSERT INTO completed (info_hash, piece) VALUES (?1, ?2)",
                params![hash, piece],
            )?;
        } else {
            conn.execute(
                "DELETE FROM completed WHERE info_hash = ?1 AND piece = ?2",
                params![hash, piece],
            )?;
        }
        Ok(())
    }

    /// Bitfield of the pieces recorded complete for a torrent. Rows past
    /// `num_pieces` are ignored.
    pub fn load(
        &self,
        info_hash: &Sha1Hash,
        num_pieces: usize,
    ) -> Result<BitVec<u8, Msb0>, StorageError> {
        let mut completed = bitvec![u8, Msb0; 0; num_pieces];
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT piece FROM completed WHERE info_hash = ?1")?;
        let rows = stmt.query_map(params![hex::encode(info_hash)], |row| row.get::<_, i64>(0))?;

        for piece in rows {
            let piece = piece?;
            if piece >= 0 && (piece as usize) < num_pieces {
                completed.set(piece as usize, true);
            }
        }
        Ok(completed)
    }
}

/// Completion records of one torrent
#[derive(Clone)]
pub struct PieceCompletion {
    store: Arc<CompletionStore>,
    info_hash: Sha1Hash,
}

impl PieceCompletion {
    pub fn new(store: Arc<CompletionStore>, info_hash: Sha1Hash) -> Self {
        Self { store, info_hash }
    }

    /// Torrent this handle records for
    pub fn info_hash(&self) -> &Sha1Hash {
        &self.info_hash
    }

    pub fn load(&self, num_pieces: usize) -> Result<BitVec<u8, Msb0>, StorageError> {
        self.store.load(&self.info_hash, num_pieces)
    }

    pub fn get(&self, piece: u32) -> Result<bool, StorageError> {
        self.store.get(&self.info_hash, piece)
    }

    pub fn set(&self, piece: u32, complete: bool) -> Result<(), StorageError> {
        self.store.set(&self.info_hash, piece, complete)
    }
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    }

    Ok(())
}
