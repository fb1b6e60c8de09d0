//! Data plane configuration
//!
//! Plain serde structs with defaults. Loading them from files or flags is the
//! embedder's concern.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for one torrent's data plane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Connection encryption (MSE/PE)
    #[serde(default)]
    pub encryption: EncryptionConfig,

    /// Per-peer session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Piece storage settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Encryption policy for peer connections (MSE/PE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPolicy {
    /// Disable encryption entirely (plaintext only)
    Disabled,
    /// Accept encrypted inbound connections, connect out in plaintext
    Allowed,
    /// Prefer encryption, fall back to plaintext if the peer selects it
    #[default]
    Preferred,
    /// Require encryption (reject plaintext peers)
    Required,
}

impl std::fmt::Display for EncryptionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::Allowed => write!(f, "allowed"),
            Self::Preferred => write!(f, "preferred"),
            Self::Required => write!(f, "required"),
        }
    }
}

impl std::str::FromStr for EncryptionPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "allowed" => Ok(Self::Allowed),
            "preferred" => Ok(Self::Preferred),
            "required" => Ok(Self::Required),
            _ => Err(format!("Invalid encryption policy: {}", s)),
        }
    }
}

/// Encryption configuration for peer connections (MSE/PE)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Encryption policy
    #[serde(default)]
    pub policy: EncryptionPolicy,

    /// Offer/accept plaintext after the obfuscated handshake
    #[serde(default = "default_true")]
    pub allow_plaintext: bool,

    /// Offer/accept RC4
    #[serde(default = "default_true")]
    pub allow_rc4: bool,

    /// Minimum random padding bytes
    #[serde(default)]
    pub min_padding: usize,

    /// Maximum random padding bytes (protocol limit is 512)
    #[serde(default = "default_max_padding")]
    pub max_padding: usize,

    /// Upper bound for the whole key exchange, in seconds
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_padding() -> usize {
    512
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            policy: EncryptionPolicy::Preferred,
            allow_plaintext: true,
            allow_rc4: true,
            min_padding: 0,
            max_padding: 512,
            handshake_timeout_secs: 30,
        }
    }
}

impl EncryptionConfig {
    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Per-peer session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Largest frame (type byte + payload) accepted from a peer
    #[serde(default = "default_max_message_length")]
    pub max_message_length: u32,

    /// Maximum outstanding block requests per peer
    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: usize,

    /// Capacity of the bounded queue between the read and write tasks
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Block size used for requests
    #[serde(default = "default_block_size")]
    pub block_size: u32,

    /// Send a keep-alive after this many idle seconds
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
}

fn default_max_message_length() -> u32 {
    256 * 1024
}

fn default_max_pending_requests() -> usize {
    16
}

fn default_channel_capacity() -> usize {
    64
}

fn default_block_size() -> u32 {
    16 * 1024
}

fn default_keepalive_interval_secs() -> u64 {
    120
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
            max_pending_requests: default_max_pending_requests(),
            channel_capacity: default_channel_capacity(),
            block_size: default_block_size(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
        }
    }
}

impl SessionConfig {
    /// Keep-alive interval as a duration
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

/// Which storage backend a torrent uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// Files laid out as in the torrent
    #[default]
    File,
    /// Preallocated, memory-mapped files
    Mmap,
    /// One object per piece, keyed by piece hash
    PieceStore,
}

impl std::fmt::Display for StorageBackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Mmap => write!(f, "mmap"),
            Self::PieceStore => write!(f, "piecestore"),
        }
    }
}

impl std::str::FromStr for StorageBackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(Self::File),
            "mmap" => Ok(Self::Mmap),
            "piecestore" | "piece-store" | "blob" => Ok(Self::PieceStore),
            _ => Err(format!("Invalid storage backend: {}", s)),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selected when the torrent is opened
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Root directory for torrent data
    pub base_dir: PathBuf,

    /// Byte budget for completed pieces (piece store only, None = unbounded)
    #[serde(default)]
    pub capacity: Option<u64>,

    /// Record verified pieces in `<base_dir>/.torrent.db` (file-tree and
    /// mmap backends)
    #[serde(default = "default_true")]
    pub persist_completion: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::File,
            base_dir: PathBuf::from("."),
            capacity: None,
            persist_completion: true,
        }
    }
}

impl CoreConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage root
    pub fn base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.base_dir = path.into();
        self
    }

    /// Select the storage backend
    pub fn backend(mut self, backend: StorageBackendKind) -> Self {
        self.storage.backend = backend;
        self
    }

    /// Bound the piece store
    pub fn capacity(mut self, capacity: Option<u64>) -> Self {
        self.storage.capacity = capacity;
        self
    }

    /// Set the encryption policy
    pub fn encryption_policy(mut self, policy: EncryptionPolicy) -> Self {
        self.encryption.policy = policy;
        self
    }

    /// Set the maximum accepted frame length
    pub fn max_message_length(mut self, max: u32) -> Self {
        self.session.max_message_length = max;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let enc = &self.encryption;
        if enc.min_padding > enc.max_padding {
            return Err(EngineError::invalid_input(
                "min_padding",
                "Must be <= max_padding",
            ));
        }
        if enc.max_padding > 512 {
            return Err(EngineError::invalid_input(
                "max_padding",
                "Protocol allows at most 512 bytes of padding",
            ));
        }
        if enc.policy != EncryptionPolicy::Disabled && !enc.allow_plaintext && !enc.allow_rc4 {
            return Err(EngineError::invalid_input(
                "encryption",
                "At least one of allow_plaintext/allow_rc4 must be set",
            ));
        }
        if enc.policy == EncryptionPolicy::Required && !enc.allow_rc4 {
            return Err(EngineError::invalid_input(
                "allow_rc4",
                "Required encryption needs RC4 enabled",
            ));
        }

        let session = &self.session;
        if session.block_size == 0 {
            return Err(EngineError::invalid_input("block_size", "Must be at least 1"));
        }
        // A Piece frame carries 9 bytes of header in front of the block.
        if session.max_message_length < session.block_size + 9 {
            return Err(EngineError::invalid_input(
                "max_message_length",
                format!("Must fit a block: at least {}", session.block_size + 9),
            ));
        }
        if session.channel_capacity == 0 {
            return Err(EngineError::invalid_input(
                "channel_capacity",
                "Must be at least 1",
            ));
        }
        if session.max_pending_requests == 0 {
            return Err(EngineError::invalid_input(
                "max_pending_requests",
                "Must be at least 1",
            ));
        }

        if self.storage.capacity == Some(0) {
            return Err(EngineError::invalid_input("capacity", "Must be positive"));
        }

        Ok(())
    }
}
