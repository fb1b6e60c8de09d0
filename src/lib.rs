//! # gosh-bt
//!
//! The data plane of a BitTorrent client: everything between an open
//! transport and bytes on disk.
//!
//! ## Features
//!
//! - **Peer wire codec**: Length-prefixed framing with the fast (BEP 6) and
//!   extension (BEP 10) messages
//! - **MSE/PE**: Obfuscated handshake with RC4 stream encryption, negotiated
//!   per connection policy
//! - **Piece storage**: File, memory-mapped, and content-addressed piece
//!   store backends with SHA-1 verification
//! - **Piece ordering**: Priority index deciding which piece to request next
//!
//! Trackers, DHT, metadata decoding and transport setup are left to the
//! caller; a session runs over any `AsyncRead + AsyncWrite` stream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gosh_bt::torrent::{Info, Metainfo, PeerSession, Torrent};
//! use gosh_bt::CoreConfig;
//! use tokio::net::TcpStream;
//!
//! # async fn run(info_hash: [u8; 20], info: Info) -> Result<(), Box<dyn std::error::Error>> {
//! let config = CoreConfig::new().base_dir("/tmp/downloads");
//! let torrent = Torrent::open(Metainfo::new(info_hash, info), config)?;
//!
//! let stream = TcpStream::connect("203.0.113.7:6881").await?;
//! let stats = PeerSession::connect(torrent.clone(), stream).await?;
//! println!("Downloaded {} bytes", stats.downloaded);
//! # Ok(())
//! # }
//! ```

// Modules
pub mod config;
pub mod error;
pub mod instrument;
pub mod priority_queue;
pub mod storage;
pub mod torrent;

// Re-exports for convenience
pub use config::{
    CoreConfig, EncryptionConfig, EncryptionPolicy, SessionConfig, StorageBackendKind,
    StorageConfig,
};
pub use error::{EngineError, HandshakeError, Result, StorageError, WireError};
pub use instrument::{Instrumentation, NoopInstrumentation, SharedInstrumentation};

// Storage exports
pub use storage::{
    open_storage, verify_piece, CompletionStore, FileStorage, MmapStorage, PieceStorage,
    PieceStore,
};

// Priority queue exports
pub use priority_queue::PiecePriorityQueue;

// Torrent exports
pub use torrent::{BlockOutcome, PeerSession, SessionStats, Torrent};
