use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Point-in-time set of (option, count) pairs taken by [`Accumulator::drain`].
pub type Snapshot = HashMap<String, u64>;

/// Pending vote counts per option, waiting to be written to the database.
///
/// Increments and drains go through the same lock, so a drain splits the
/// increment history cleanly: everything recorded before it is in the
/// snapshot, everything after it stays pending for the next one.
#[derive(Debug, Default)]
pub struct Accumulator {
    counts: Mutex<Snapshot>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, option: &str) {
        let mut counts = self.lock();
        match counts.get_mut(option) {
            Some(count) => *count += 1,
            None => {
                counts.insert(option.to_string(), 1);
            }
        }
    }

    /// Takes every pending count and leaves the accumulator empty.
    pub fn drain(&self) -> Snapshot {
        std::mem::take(&mut *self.lock())
    }

    /// Adds counts from a failed flush back so the next drain picks them up.
    pub fn restore<I>(&self, deltas: I)
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let mut counts = self.lock();
        for (option, count) in deltas {
            if count == 0 {
                continue;
            }
            *counts.entry(option).or_insert(0) += count;
        }
    }

    // A panic while holding the lock can only happen between two plain map
    // operations, so the map is still consistent and safe to keep using.
    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
