//! Typed error hierarchy for gosh-bt
//!
//! Every layer of the data plane has its own error enum so callers can decide
//! what a failure means for them: wire and handshake errors end the
//! connection, storage errors end the piece, selection errors do not exist.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Peer wire framing and parsing errors
#[derive(Debug, Error)]
pub enum WireError {
    /// Declared frame length exceeds the caller's maximum
    #[error("Message too long: {length} bytes (max {max})")]
    MessageTooLong { length: u32, max: u32 },

    /// Bytes left in the frame after the type-specific fields were parsed
    #[error("{count} bytes unused in message type {message_type}")]
    TrailingBytes { count: usize, message_type: u8 },

    /// Stream ended in the middle of a frame
    #[error("Unexpected end of stream inside a message")]
    UnexpectedEnd,

    /// Type tag not known to this codec
    #[error("Unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    /// Stream ended cleanly on a frame boundary
    #[error("Peer closed the connection")]
    Ended,

    /// Transport error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// True when the peer closed the stream on a message boundary
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::Ended)
    }
}

/// Connection handshake errors (plaintext or MSE/PE)
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peers share no crypto method
    #[error("No mutually acceptable crypto method (offered {offered:#x}, allowed {allowed:#x})")]
    NoMutualCryptoMethod { offered: u32, allowed: u32 },

    /// The synchronisation marker was not found in the bounded window
    #[error("Synchronisation marker not found within {window} bytes")]
    MarkerNotFound { window: usize },

    /// The key exchange value or verification block is malformed
    #[error("Malformed key exchange: {0}")]
    MalformedKeyExchange(String),

    /// Handshake did not complete in time
    #[error("Handshake timed out")]
    Timeout,

    /// Initiator asked for a torrent we do not serve
    #[error("Peer requested an unknown info hash")]
    UnknownInfoHash,

    /// Plaintext protocol header or info hash did not match
    #[error("Invalid protocol handshake: {0}")]
    InvalidProtocol(String),

    /// Policy requires encryption but the peer spoke plaintext
    #[error("Encryption required but peer did not negotiate it")]
    EncryptionRequired,

    /// Transport error
    #[error("I/O error during handshake: {0}")]
    Io(#[from] io::Error),
}

/// Piece storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Fewer bytes were available than requested before the end of the torrent
    #[error("Short read on piece {piece} at offset {offset}: got {read} of {expected} bytes")]
    UnexpectedShortRead {
        piece: u32,
        offset: u64,
        read: usize,
        expected: usize,
    },

    /// A write stopped before all bytes were persisted
    #[error("Short write on piece {piece} at offset {offset}: wrote {written} of {expected} bytes")]
    UnexpectedShortWrite {
        piece: u32,
        offset: u64,
        written: usize,
        expected: usize,
    },

    /// Piece is already complete and therefore immutable
    #[error("Piece {0} is already complete")]
    AlreadyComplete(u32),

    /// Target object already exists in the completed namespace
    #[error("Piece {0} already exists in the completed namespace")]
    AlreadyInNamespace(u32),

    /// Space requested exceeds the configured capacity
    #[error("Requested {requested} bytes exceeds capacity {capacity}")]
    CapacityExceeded { requested: u64, capacity: u64 },

    /// Data did not hash to the expected piece hash
    #[error("Piece {0} failed hash verification")]
    HashMismatch(u32),

    /// Piece index outside the torrent
    #[error("Piece {piece} out of range (torrent has {num_pieces} pieces)")]
    PieceOutOfRange { piece: u32, num_pieces: usize },

    /// Request runs past the end of the piece
    #[error("Range {offset}+{length} exceeds piece {piece} length {piece_length}")]
    RangeOutOfBounds {
        piece: u32,
        offset: u64,
        length: usize,
        piece_length: u64,
    },

    /// Filesystem error on a backing file
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Memory mapping failed
    #[error("Failed to map {path:?}: {message}")]
    Mmap { path: PathBuf, message: String },

    /// Torrent path would escape the storage directory
    #[error("Invalid path in torrent: {0}")]
    InvalidPath(String),

    /// Piece completion database error
    #[error("Completion database error: {0}")]
    Database(String),
}

impl StorageError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Data integrity problem: the piece should be aborted
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedShortRead { .. }
                | Self::UnexpectedShortWrite { .. }
                | Self::HashMismatch(_)
        )
    }

    /// Lost a race against another writer; the loser can ignore it
    pub fn is_benign_race(&self) -> bool {
        matches!(self, Self::AlreadyComplete(_) | Self::AlreadyInNamespace(_))
    }

    /// Caller must wait or shrink its working set
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Main error type for the data plane
#[derive(Debug, Error)]
pub enum EngineError {
    /// Peer wire protocol error
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Handshake error
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Peer sent something that is well-framed but semantically wrong
    #[error("Peer protocol violation: {0}")]
    PeerProtocol(String),

    /// Invalid input from the embedder
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Session or torrent is shutting down
    #[error("Shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The connection must be closed and the peer dropped
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            Self::Wire(_) | Self::Handshake(_) | Self::PeerProtocol(_)
        )
    }

    /// Worth retrying (with another peer, or later)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Handshake(e) => matches!(
                e,
                HandshakeError::Timeout
                    | HandshakeError::Io(_)
                    | HandshakeError::MarkerNotFound { .. }
            ),
            Self::Storage(e) => e.is_capacity() || matches!(e, StorageError::Io { .. }),
            Self::Wire(WireError::Io(_)) => true,
            _ => false,
        }
    }

    /// Create a peer protocol error
    pub fn peer_protocol(message: impl Into<String>) -> Self {
        Self::PeerProtocol(message.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for data plane operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        Self::Wire(WireError::Io(err))
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("task failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_clean_close() {
        assert!(WireError::Ended.is_clean_close());
        assert!(!WireError::UnexpectedEnd.is_clean_close());
    }

    #[test]
    fn test_trailing_bytes_message() {
        let err = WireError::TrailingBytes {
            count: 1,
            message_type: 4,
        };
        assert_eq!(err.to_string(), "1 bytes unused in message type 4");
    }

    #[test]
    fn test_storage_error_classification() {
        let short = StorageError::UnexpectedShortRead {
            piece: 1,
            offset: 0,
            read: 3,
            expected: 10,
        };
        assert!(short.is_integrity_failure());
        assert!(!short.is_benign_race());

        assert!(StorageError::AlreadyComplete(3).is_benign_race());
        assert!(StorageError::AlreadyInNamespace(3).is_benign_race());

        let cap = StorageError::CapacityExceeded {
            requested: 10,
            capacity: 5,
        };
        assert!(cap.is_capacity());
        assert!(!cap.is_integrity_failure());
    }

    #[test]
    fn test_fatal_classification() {
        let wire: EngineError = WireError::UnexpectedEnd.into();
        assert!(wire.is_fatal_to_connection());

        let hs: EngineError = HandshakeError::Timeout.into();
        assert!(hs.is_fatal_to_connection());
        assert!(hs.is_retryable());

        let storage: EngineError = StorageError::AlreadyComplete(0).into();
        assert!(!storage.is_fatal_to_connection());
        assert!(!storage.is_retryable());
    }
}
