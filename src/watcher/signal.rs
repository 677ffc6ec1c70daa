//! Cross-thread rescan request.
//!
//! The signal is a generation counter. Raising it bumps the generation;
//! a waiter remembers the generation it last consumed and wakes as soon as
//! the counter moves past it. Any number of raises between two waits
//! coalesce into one wake.

use std::sync::Arc;

use tokio::sync::watch;

/// Coalescing wake-up shared by every caller of `update()`.
#[derive(Debug, Clone)]
pub struct UpdateSignal {
    generation: Arc<watch::Sender<u64>>,
}

impl Default for UpdateSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateSignal {
    /// Create a signal at generation 0.
    #[must_use]
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            generation: Arc::new(generation),
        }
    }

    /// Request a rescan. Never blocks.
    pub fn raise(&self) {
        self.generation
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Resolve once the signal has been raised after generation `seen`.
    pub async fn raised_since(&self, seen: u64) {
        let mut rx = self.generation.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|generation| *generation != seen).await;
    }
}
