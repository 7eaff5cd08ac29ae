//! Single-use countdown synchronization

use std::sync::{Condvar, Mutex};

/// One-shot countdown used by drivers to wait until every worker of a
/// parallel region has finished.
///
/// The counter only ever decreases and becomes ready exactly once; a `Latch`
/// is never reused across regions.
pub(crate) struct Latch {
    remaining: Mutex<usize>,
    completed: Condvar,
}
//
impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            completed: Condvar::new(),
        }
    }

    /// Signal that one participant is done; the last one wakes all waiters.
    pub fn count_down(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        debug_assert!(*remaining > 0, "latch counted down too many times");
        *remaining -= 1;
        if *remaining == 0 {
            self.completed.notify_all();
        }
    }

    /// Block until the counter reaches zero.
    pub fn wait(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining != 0 {
            remaining = self.completed.wait(remaining).unwrap();
        }
    }
}
