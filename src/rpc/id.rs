//! Correlation id source for outgoing requests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe generator of strictly increasing request ids, starting at 1.
///
/// A `u64` counter cannot be exhausted by a live connection, so wraparound
/// is not handled.
#[derive(Debug)]
pub struct MessageIdGenerator {
    next: AtomicU64,
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageIdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next id. Never returns the same value twice.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
