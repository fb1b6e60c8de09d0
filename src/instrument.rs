//! Optional instrumentation hooks
//!
//! Sessions and storage report notable events through an `Instrumentation`
//! handle. Every method has an empty default body, so implementors only
//! override what they record.

use std::sync::Arc;
use std::time::Duration;

/// Event sink for data plane observations
pub trait Instrumentation: Send + Sync {
    /// A handshake finished; `encrypted` is false for plaintext.
    fn handshake_completed(&self, _encrypted: bool, _elapsed: Duration) {}

    /// A handshake attempt failed.
    fn handshake_failed(&self, _reason: &str) {}

    /// A message was decoded from a peer.
    fn message_received(&self, _message_type: Option<u8>, _length: usize) {}

    /// A message was written to a peer.
    fn message_sent(&self, _message_type: Option<u8>, _length: usize) {}

    /// A block write to storage finished.
    fn block_written(&self, _piece: u32, _length: usize, _elapsed: Duration) {}

    /// A piece passed verification and was marked complete.
    fn piece_completed(&self, _piece: u32) {}

    /// A piece failed verification or storage and went back to the wanted set.
    fn piece_failed(&self, _piece: u32) {}

    /// A piece object was evicted to make room.
    fn piece_evicted(&self, _bytes: u64) {}
}

/// Instrumentation that records nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumentation;

impl Instrumentation for NoopInstrumentation {}

/// Shared handle to an instrumentation sink
pub type SharedInstrumentation = Arc<dyn Instrumentation>;

/// The default sink
pub fn noop() -> SharedInstrumentation {
    Arc::new(NoopInstrumentation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counting {
        completed: AtomicU32,
    }

    impl Instrumentation for Counting {
        fn piece_completed(&self, _piece: u32) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_override_single_hook() {
        let counting = Arc::new(Counting::default());
        let sink: SharedInstrumentation = counting.clone();
        sink.piece_completed(1);
        sink.piece_failed(2);
        sink.piece_completed(3);
        assert_eq!(counting.completed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_noop_is_callable() {
        let sink = noop();
        sink.handshake_completed(true, Duration::from_millis(5));
        sink.message_received(Some(7), 100);
    }
}
