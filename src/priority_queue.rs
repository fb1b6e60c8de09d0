//! Piece priority index
//!
//! Keeps the set of wanted pieces ordered by a caller-assigned priority key
//! (lower keys are served first). Pieces that share a key get a random
//! tie-break when they are inserted or moved, so peers that insert in the
//! same order still start on different pieces, while repeated iteration over
//! an unchanged index stays stable.
//!
//! The index is shared by every session of a torrent. Iteration takes the
//! lock once per step, so callers can do I/O against a yielded piece, or
//! delete it, without holding the lock or invalidating the cursor.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;

/// Position of a piece in the order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    priority: i64,
    /// Random, fixed until the piece is moved
    tiebreak: u64,
    piece: u32,
}

/// Internal state of the index
#[derive(Default)]
struct PriorityIndexInner {
    /// Pieces in serve order
    order: BTreeSet<Slot>,
    /// Current slot of each piece (for relocation)
    slots: HashMap<u32, Slot>,
}

/// Priority-ordered set of wanted pieces
#[derive(Default)]
pub struct PiecePriorityQueue {
    inner: Mutex<PriorityIndexInner>,
}

impl PiecePriorityQueue {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a piece, or move it to a new priority.
    ///
    /// Setting the priority it already has keeps its position.
    pub fn set_piece(&self, piece: u32, priority: i64) {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.slots.get(&piece).copied() {
            if existing.priority == priority {
                return;
            }
            inner.order.remove(&existing);
        }

        let slot = Slot {
            priority,
            tiebreak: rand::rng().random(),
            piece,
        };
        inner.order.insert(slot);
        inner.slots.insert(piece, slot);
    }

    /// Remove a piece. Absent pieces are ignored.
    pub fn delete_piece(&self, piece: u32) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.remove(&piece) {
            inner.order.remove(&slot);
        }
    }

    /// The piece that would be served first
    pub fn first(&self) -> Option<u32> {
        self.inner.lock().order.first().map(|slot| slot.piece)
    }

    /// Iterate pieces from lowest to highest priority key.
    ///
    /// The cursor remembers its position rather than holding the lock, so
    /// the index may change between steps. Deleting the piece just returned
    /// is always safe; pieces moved behind the cursor are not revisited.
    pub fn iter(&self) -> PieceCursor<'_> {
        PieceCursor {
            queue: self,
            last: None,
        }
    }

    /// Current priority of a piece
    pub fn priority_of(&self, piece: u32) -> Option<i64> {
        self.inner.lock().slots.get(&piece).map(|slot| slot.priority)
    }

    /// Check if a piece is wanted
    pub fn contains(&self, piece: u32) -> bool {
        self.inner.lock().slots.contains_key(&piece)
    }

    /// Number of wanted pieces
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Check if no pieces are wanted
    pub fn is_empty(&self) -> bool {
        self.inner.lock().order.is_empty()
    }

    /// Pieces in serve order, taken under one lock
    pub fn snapshot(&self) -> Vec<u32> {
        self.inner.lock().order.iter().map(|slot| slot.piece).collect()
    }

    fn next_after(&self, last: Option<Slot>) -> Option<Slot> {
        let inner = self.inner.lock();
        match last {
            None => inner.order.first().copied(),
            Some(last) => inner
                .order
                .range((Bound::Excluded(last), Bound::Unbounded))
                .next()
                .copied(),
        }
    }
}

/// Lock-per-step iterator over a `PiecePriorityQueue`
pub struct PieceCursor<'a> {
    queue: &'a PiecePriorityQueue,
    last: Option<Slot>,
}

impl Iterator for PieceCursor<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let slot = self.queue.next_after(self.last)?;
        self.last = Some(slot);
        Some(slot.piece)
    }
}
