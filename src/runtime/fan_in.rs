//! Fan-in completion counter
//!
//! Several workers finish independently; exactly one of them, the last, gets to
//! run the "all done" step.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct CompletionCounter {
    pending: AtomicUsize,
}

impl CompletionCounter {
    pub fn new(participants: usize) -> Self {
        Self {
            pending: AtomicUsize::new(participants),
        }
    }

    /// Re-arm for a new round of `participants`
    pub fn reset(&self, participants: usize) {
        self.pending.store(participants, Ordering::SeqCst);
    }

    /// Record one completion; `true` for the participant that brought the count to zero
    ///
    /// Arrivals past zero are ignored and return `false`.
    pub fn arrive(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            == Ok(1)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}
