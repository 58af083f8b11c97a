// =============================================================================
// Tick Buffer — per-consumer bounded queue with drop-oldest overflow
// =============================================================================
//
// The feed task pushes, the owning tracker drains. Pushing never blocks: when
// the buffer is full the oldest tick is discarded and counted, because a
// tracker only ever acts on the latest price.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

#[derive(Debug)]
pub struct TickBuffer {
    capacity: usize,
    ticks: Mutex<VecDeque<f64>>,
    dropped: AtomicU64,
}

impl TickBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ticks: Mutex::new(VecDeque::with_capacity(capacity)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, price: f64) {
        let mut ticks = self.ticks.lock();
        if ticks.len() >= self.capacity {
            ticks.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        ticks.push_back(price);
    }

    /// Take every queued tick, oldest first.
    #[cfg(test)]
    pub fn drain(&self) -> Vec<f64> {
        self.ticks.lock().drain(..).collect()
    }

    /// Take the newest queued tick and discard the rest.
    pub fn take_latest(&self) -> Option<f64> {
        let mut ticks = self.ticks.lock();
        let latest = ticks.back().copied();
        ticks.clear();
        latest
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ticks.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ticks discarded because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
