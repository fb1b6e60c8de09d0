//! Block bookkeeping for pieces in flight
//!
//! A piece is fetched as a run of fixed-size blocks. `PendingPiece` tracks
//! which blocks have been requested (and by which session) and which have
//! landed in storage. Block data itself goes straight to the storage
//! backend; only the bookkeeping lives here.

use std::collections::HashMap;
use std::time::Instant;

use bitvec::prelude::*;

use super::peer::PeerMessage;

/// A piece being downloaded
#[derive(Debug)]
pub struct PendingPiece {
    /// Piece index
    pub index: u32,
    /// Expected piece length
    pub length: u64,
    /// Priority key the piece had when it left the wanted set
    pub priority: i64,
    /// Block size used
    pub block_size: u32,
    /// Blocks persisted to storage
    received: BitVec<u8, Msb0>,
    /// Number of blocks received
    pub blocks_received: usize,
    /// When we started downloading this piece
    pub started_at: Instant,
    /// Last time we received a block (for stale detection)
    pub last_activity: Instant,
    /// Which blocks have been requested (block index -> requesting session)
    pub requested_blocks: HashMap<u32, u64>,
}

impl PendingPiece {
    /// Create a new pending piece
    pub fn new(index: u32, piece_length: u64, block_size: u32, priority: i64) -> Self {
        assert!(block_size > 0, "block size must be positive");
        let num_blocks = piece_length.div_ceil(block_size as u64) as usize;

        let now = Instant::now();
        Self {
            index,
            length: piece_length,
            priority,
            block_size,
            received: bitvec![u8, Msb0; 0; num_blocks],
            blocks_received: 0,
            started_at: now,
            last_activity: now,
            requested_blocks: HashMap::new(),
        }
    }

    /// Number of blocks in the piece
    pub fn num_blocks(&self) -> usize {
        self.received.len()
    }

    fn block_length(&self, block_index: usize) -> u32 {
        let offset = block_index as u64 * self.block_size as u64;
        (self.length - offset).min(self.block_size as u64) as u32
    }

    /// Index of the block at `offset`, if `(offset, length)` is exactly one
    /// block of this piece
    pub fn block_index(&self, offset: u32, length: u32) -> Option<u32> {
        if offset % self.block_size != 0 {
            tracing::warn!(
                "Block offset {} is not aligned to block size {}",
                offset,
                self.block_size
            );
            return None;
        }

        let block_index = (offset / self.block_size) as usize;
        if block_index >= self.num_blocks() {
            return None;
        }

        let expected = self.block_length(block_index);
        if length != expected {
            tracing::warn!(
                "Block {} has wrong size: expected {}, got {}",
                block_index,
                expected,
                length
            );
            return None;
        }

        Some(block_index as u32)
    }

    /// Check whether the block at `offset` still needs data
    pub fn is_block_missing(&self, offset: u32, length: u32) -> bool {
        self.block_index(offset, length)
            .map(|i| !self.received[i as usize])
            .unwrap_or(false)
    }

    /// Record that a block is in storage. Returns false for invalid or
    /// duplicate blocks.
    pub fn mark_received(&mut self, offset: u32, length: u32) -> bool {
        let Some(block_index) = self.block_index(offset, length) else {
            return false;
        };

        self.requested_blocks.remove(&block_index);
        self.last_activity = Instant::now();

        // Don't count duplicates
        if self.received[block_index as usize] {
            return false;
        }
        self.received.set(block_index as usize, true);
        self.blocks_received += 1;
        true
    }

    /// Check if all blocks have been received
    pub fn is_complete(&self) -> bool {
        self.blocks_received == self.num_blocks()
    }

    /// Check if every missing block has an outstanding request
    pub fn is_fully_requested(&self) -> bool {
        self.blocks_received + self.requested_blocks.len() >= self.num_blocks()
    }

    /// Get blocks that haven't been requested yet
    pub fn unrequested_blocks(&self) -> Vec<(u32, u32)> {
        (0..self.num_blocks())
            .filter(|&i| !self.received[i] && !self.requested_blocks.contains_key(&(i as u32)))
            .map(|i| (i as u32 * self.block_size, self.block_length(i)))
            .collect()
    }

    /// Mark a block as requested
    pub fn mark_requested(&mut self, block_index: u32, session: u64) {
        self.requested_blocks.insert(block_index, session);
    }

    /// Forget an outstanding request. Returns true if it was outstanding.
    pub fn release_block(&mut self, offset: u32) -> bool {
        self.requested_blocks
            .remove(&(offset / self.block_size))
            .is_some()
    }

    /// Forget every request made by `session`; returns how many there were
    pub fn release_session(&mut self, session: u64) -> usize {
        let before = self.requested_blocks.len();
        self.requested_blocks.retain(|_, owner| *owner != session);
        before - self.requested_blocks.len()
    }

    /// Start over after the piece failed verification or storage
    pub fn reset(&mut self) {
        self.received.fill(false);
        self.blocks_received = 0;
        self.requested_blocks.clear();
        self.last_activity = Instant::now();
    }
}

/// Block request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    /// Piece index
    pub piece: u32,
    /// Block offset within piece
    pub offset: u32,
    /// Block length
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }

    /// The Request message for this block
    pub fn to_request(self) -> PeerMessage {
        PeerMessage::Request {
            index: self.piece,
            begin: self.offset,
            length: self.length,
        }
    }

    /// The Cancel message for this block
    pub fn to_cancel(self) -> PeerMessage {
        PeerMessage::Cancel {
            index: self.piece,
            begin: self.offset,
            length: self.length,
        }
    }
}

/// Piece download progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceProgress {
    /// Total number of pieces
    pub total_pieces: usize,
    /// Number of pieces we have
    pub have_pieces: usize,
    /// Number of pieces being downloaded
    pub pending_pieces: usize,
    /// Total verified bytes
    pub verified_bytes: u64,
    /// Total size of all files
    pub total_size: u64,
}

impl PieceProgress {
    /// Calculate percentage complete
    pub fn percentage(&self) -> f64 {
        if self.total_pieces == 0 {
            return 0.0;
        }
        (self.have_pieces as f64 / self.total_pieces as f64) * 100.0
    }

    /// Calculate bytes remaining
    pub fn bytes_remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.verified_bytes)
    }

    /// Check if every piece is verified
    pub fn is_complete(&self) -> bool {
        self.have_pieces == self.total_pieces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_piece() {
        let mut piece = PendingPiece::new(0, 32768, 16384, 0); // 2 blocks of 16KB

        assert_eq!(piece.num_blocks(), 2);
        assert!(!piece.is_complete());

        assert!(piece.mark_received(0, 16384));
        assert!(!piece.is_complete());

        // Duplicates are not counted twice
        assert!(!piece.mark_received(0, 16384));
        assert_eq!(piece.blocks_received, 1);

        assert!(piece.mark_received(16384, 16384));
        assert!(piece.is_complete());
    }

    #[test]
    fn test_unrequested_blocks() {
        let mut piece = PendingPiece::new(0, 32768, 16384, 0);

        let blocks = piece.unrequested_blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], (0, 16384));
        assert_eq!(blocks[1], (16384, 16384));

        piece.mark_requested(1, 7);
        assert_eq!(piece.unrequested_blocks(), vec![(0, 16384)]);
        assert!(!piece.is_fully_requested());

        piece.mark_requested(0, 8);
        assert!(piece.is_fully_requested());
    }

    #[test]
    fn test_last_block_size() {
        // Piece with non-standard size (e.g., last piece)
        let piece = PendingPiece::new(0, 20000, 16384, 0);

        let blocks = piece.unrequested_blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], (0, 16384));
        assert_eq!(blocks[1], (16384, 3616)); // 20000 - 16384 = 3616
    }

    #[test]
    fn test_block_index_validation() {
        let piece = PendingPiece::new(3, 20000, 16384, 0);
        assert_eq!(piece.block_index(0, 16384), Some(0));
        assert_eq!(piece.block_index(16384, 3616), Some(1));
        assert_eq!(piece.block_index(16384, 16384), None);
        assert_eq!(piece.block_index(100, 16384), None);
        assert_eq!(piece.block_index(32768, 16384), None);
    }

    #[test]
    fn test_release_by_session() {
        let mut piece = PendingPiece::new(0, 4 * 16384, 16384, 2);
        piece.mark_requested(0, 1);
        piece.mark_requested(1, 2);
        piece.mark_requested(2, 1);

        assert_eq!(piece.release_session(1), 2);
        assert_eq!(piece.unrequested_blocks().len(), 3);
        assert!(piece.release_block(16384));
        assert!(!piece.release_block(16384));
    }

    #[test]
    fn test_reset_clears_progress() {
        let mut piece = PendingPiece::new(0, 32768, 16384, 0);
        piece.mark_received(0, 16384);
        piece.mark_requested(1, 4);
        piece.reset();

        assert_eq!(piece.blocks_received, 0);
        assert_eq!(piece.unrequested_blocks().len(), 2);
        assert!(piece.is_block_missing(0, 16384));
    }

    #[test]
    fn test_block_request_messages() {
        let req = BlockRequest::new(5, 16384, 16384);
        assert_eq!(
            req.to_request(),
            PeerMessage::Request {
                index: 5,
                begin: 16384,
                length: 16384
            }
        );
        assert!(matches!(req.to_cancel(), PeerMessage::Cancel { index: 5, .. }));
    }

    #[test]
    fn test_piece_progress() {
        let progress = PieceProgress {
            total_pieces: 100,
            have_pieces: 50,
            pending_pieces: 5,
            verified_bytes: 50 * 32768,
            total_size: 100 * 32768,
        };

        assert_eq!(progress.percentage(), 50.0);
        assert_eq!(progress.bytes_remaining(), 50 * 32768);
        assert!(!progress.is_complete());
    }
}
