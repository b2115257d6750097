// ============================================================================
// SECTION 10: METRIC PIPELINE
// ============================================================================
// Producers never block:
// - one Accumulator per plugin, all sharing a single bounded channel
// - on overflow the oldest queued batch is evicted, then the new batch is
//   retried once and dropped if there is still no room
// - a single fan-out task in RunningOutput drains the channel into every
//   registered output
// ============================================================================

mod accumulator;
mod running;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};

use serde::{Deserialize, Serialize};

pub use accumulator::Accumulator;
pub use running::{OutputRegistration, RunningOutput};

/// Capacity of the shared batch channel.
pub const DEFAULT_BUFFER_CAPACITY: usize = 128;

// ----------------------------------------------------------------------------
// 10.1 Channel Statistics
// ----------------------------------------------------------------------------

/// Counters for the shared batch channel.
#[derive(Debug, Default)]
pub struct ChannelStats {
    /// Batches accepted into the channel
    pub sent: AtomicU64,
    /// Batches taken by the fan-out task
    pub received: AtomicU64,
    /// Batches discarded on overflow (evicted or rejected)
    pub dropped: AtomicU64,
    /// Current queue depth
    pub depth: AtomicUsize,
    /// High water mark (max depth seen)
    pub high_water_mark: AtomicUsize,
    /// Times a producer found the channel full
    pub backpressure_events: AtomicU64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send(&self) {
        self.sent.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_receive(&self) {
        self.received.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_drop(&self, count: u64) {
        self.dropped.fetch_add(count, AtomicOrdering::Relaxed);
    }

    pub fn update_depth(&self, depth: usize) {
        self.depth.store(depth, AtomicOrdering::Relaxed);

        let mut hwm = self.high_water_mark.load(AtomicOrdering::Relaxed);
        while depth > hwm {
            match self.high_water_mark.compare_exchange_weak(
                hwm,
                depth,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => break,
                Err(h) => hwm = h,
            }
        }
    }

    pub fn record_backpressure(&self) {
        self.backpressure_events.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            sent: self.sent.load(AtomicOrdering::Relaxed),
            received: self.received.load(AtomicOrdering::Relaxed),
            dropped: self.dropped.load(AtomicOrdering::Relaxed),
            depth: self.depth.load(AtomicOrdering::Relaxed),
            high_water_mark: self.high_water_mark.load(AtomicOrdering::Relaxed),
            backpressure_events: self.backpressure_events.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatsSnapshot {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub depth: usize,
    pub high_water_mark: usize,
    pub backpressure_events: u64,
}
