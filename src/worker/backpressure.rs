//! Slot accounting for the worker's claim loop.
//!
//! Unlike a watermark-hysteresis backpressure scheme, the dispatcher never "pauses" below full
//! capacity — it simply never issues a claim for a slot that's already occupied. This is the
//! first of the two limiting layers the run processor relies on; the Store's per-bucket
//! concurrency predicate (`§4.1`) is the second, and is enforced independently of anything here.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Tracks how many of a worker's `concurrency` slots are currently occupied by an in-flight
/// processor. Atomic so the claim loop and each spawned processor's cleanup path can update it
/// without a lock.
pub struct LoadState {
    concurrency: usize,
    current_load: AtomicUsize,
}

impl LoadState {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            current_load: AtomicUsize::new(0),
        }
    }

    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Acquire)
    }

    /// Slots with no in-flight processor, i.e. the number of claims worth attempting this pass.
    pub fn available_slots(&self) -> usize {
        self.concurrency.saturating_sub(self.current_load())
    }

    pub fn load_ratio(&self) -> f64 {
        if self.concurrency == 0 {
            0.0
        } else {
            self.current_load() as f64 / self.concurrency as f64
        }
    }

    pub fn slot_claimed(&self) {
        self.current_load.fetch_add(1, Ordering::AcqRel);
    }

    pub fn slot_released(&self) {
        self.current_load.fetch_sub(1, Ordering::AcqRel);
    }
}
