//! Timestamp sources for record and segment headers.
//!
//! Every reservation stamps its record at reserve time, and segment headers
//! carry the clock frequency so readers can convert ticks to wall time. The
//! trait is the seam for plugging in a TSC-backed source on pinned cores;
//! the default reads the process-monotonic clock in nanoseconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic timestamp source shared by all buffers of a channel.
///
/// Implementations must be cheap enough to call on every reservation and
/// must never return a value smaller than a previously returned one.
pub trait Clock: Send + Sync {
    /// Current timestamp in clock ticks.
    fn now(&self) -> u64;

    /// Tick rate in Hz, recorded in every segment header.
    fn frequency_hz(&self) -> u64;
}

/// Process-monotonic nanosecond clock anchored at construction.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Creates a clock whose tick zero is the moment of construction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now(&self) -> u64 {
        // u64 nanoseconds cover centuries of process uptime.
        self.origin.elapsed().as_nanos() as u64
    }

    fn frequency_hz(&self) -> u64 {
        1_000_000_000
    }
}

/// Hand-driven clock for tests and simulations.
///
/// `now()` returns whatever the test last set, so header width decisions
/// (narrow vs wide) become deterministic.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    /// Creates a manual clock starting at `ticks`.
    #[must_use]
    pub fn new(ticks: u64) -> Self {
        Self {
            ticks: AtomicU64::new(ticks),
        }
    }

    /// Advances the clock by `delta` ticks.
    pub fn advance(&self, delta: u64) {
        self.ticks.fetch_add(delta, Ordering::Relaxed);
    }

    /// Sets the clock to an absolute tick value.
    pub fn set(&self, ticks: u64) {
        self.ticks.store(ticks, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn frequency_hz(&self) -> u64 {
        1_000_000_000
    }
}
