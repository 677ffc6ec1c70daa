//! Adaptive wait timeout: poll fast right after a change, then back off.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const FALLBACK_STEP: Duration = Duration::from_millis(500);

/// Table of decreasing wait durations with a lock-free position counter.
///
/// Index 0 is the slowest step. [`reset`](Self::reset) jumps to the last
/// (fastest) index; [`back_off`](Self::back_off) moves one step slower.
#[derive(Debug)]
pub struct AdaptiveTimeout {
    steps: Vec<Duration>,
    counter: AtomicUsize,
}

impl AdaptiveTimeout {
    /// Build from a slowest-first table. An empty table behaves as a single
    /// 500 ms step. The counter starts on the slowest step.
    #[must_use]
    pub fn new(steps: Vec<Duration>) -> Self {
        let steps = if steps.is_empty() {
            vec![FALLBACK_STEP]
        } else {
            steps
        };
        Self {
            steps,
            counter: AtomicUsize::new(0),
        }
    }

    /// Duration for the next wait.
    #[must_use]
    pub fn current(&self) -> Duration {
        let index = self.index().min(self.fastest_index());
        self.steps.get(index).copied().unwrap_or(FALLBACK_STEP)
    }

    /// Current position in the table.
    #[must_use]
    pub fn index(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Index of the fastest step.
    #[must_use]
    pub fn fastest_index(&self) -> usize {
        self.steps.len() - 1
    }

    /// Jump to the fastest step.
    pub fn reset(&self) {
        self.counter.store(self.fastest_index(), Ordering::SeqCst);
    }

    /// Move one step towards the slowest entry; no-op once there.
    pub fn back_off(&self) {
        let _ = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |index| {
                index.checked_sub(1)
            });
    }
}
