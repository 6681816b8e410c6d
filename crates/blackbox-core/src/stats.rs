//! Loss accounting.
//!
//! Counters are kept per buffer and only ever incremented by producers, so
//! relaxed atomics are enough; a snapshot taken while writers are live is
//! approximate by nature.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::segment::CachePadded;

/// Point-in-time counters for one per-core buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Records refused because the buffer was full, the record was larger
    /// than a segment, or a writer blew the nesting limit.
    pub events_lost: u64,
    /// Segments reclaimed from a stalled writer in overwrite mode; their
    /// contents were dropped mid-write.
    pub corrupted_segments: u64,
}

impl BufferStats {
    /// `true` when nothing was lost.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.events_lost == 0 && self.corrupted_segments == 0
    }
}

/// Writer-side counters behind [`BufferStats`] snapshots.
#[derive(Debug)]
pub(crate) struct AtomicBufferStats {
    events_lost: CachePadded<AtomicU64>,
    corrupted_segments: CachePadded<AtomicU64>,
}

impl AtomicBufferStats {
    pub(crate) const fn new() -> Self {
        Self {
            events_lost: CachePadded::new(AtomicU64::new(0)),
            corrupted_segments: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn record_lost(&self) {
        self.events_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_corrupted(&self) {
        self.corrupted_segments.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BufferStats {
        BufferStats {
            events_lost: self.events_lost.load(Ordering::Relaxed),
            corrupted_segments: self.corrupted_segments.load(Ordering::Relaxed),
        }
    }
}

/// Per-buffer snapshots for a whole channel, indexed by core.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    /// One entry per buffer, in core order.
    pub buffers: Vec<BufferStats>,
}

impl ChannelStats {
    /// Sums the per-buffer counters.
    #[must_use]
    pub fn total(&self) -> BufferStats {
        let mut total = BufferStats::default();
        for stats in &self.buffers {
            total.events_lost += stats.events_lost;
            total.corrupted_segments += stats.corrupted_segments;
        }
        total
    }
}
