//! Channel lifecycle: opening the per-core buffers, forcing switches
//! across all of them, and the teardown flush with loss reporting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::buffer::{SwitchMode, TraceBuffer};
use crate::clock::{Clock, SystemClock};
use crate::config::ChannelConfig;
use crate::stats::ChannelStats;

/// Callbacks fired around segment lifecycle transitions.
///
/// Called from inside the reservation path of whichever writer triggered
/// the transition, after that writer won its CAS. Implementations must
/// not block; reserving from inside a hook is reentrant and counts
/// against the nesting limit.
pub trait SegmentHooks: Send + Sync {
    /// A fresh segment generation was opened.
    fn segment_opened(&self, _buffer: &TraceBuffer, _timestamp: u64, _segment: usize) {}

    /// A segment generation was closed. `end_offset` is the logical stream
    /// offset one past the generation's last record byte; the tail up to
    /// the next segment boundary was accounted as padding.
    fn segment_closed(
        &self,
        _buffer: &TraceBuffer,
        _timestamp: u64,
        _end_offset: u64,
        _segment: usize,
    ) {
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SegmentHooks for NoopHooks {}

/// A named set of per-core trace buffers sharing one configuration.
///
/// Producers grab their core's buffer once and reserve on it directly;
/// the channel itself is only touched at open, switch-all, and teardown.
#[derive(Debug)]
pub struct Channel {
    config: ChannelConfig,
    buffers: Vec<Arc<TraceBuffer>>,
    finished: AtomicBool,
}

impl Channel {
    /// Opens a channel with the system clock and no-op hooks.
    ///
    /// # Errors
    ///
    /// [`ChannelError::InvalidConfig`](crate::ChannelError::InvalidConfig)
    /// when the configuration fails validation.
    pub fn open(config: ChannelConfig) -> crate::Result<Self> {
        Self::open_with(config, Arc::new(SystemClock::new()), Arc::new(NoopHooks))
    }

    /// Opens a channel with custom lifecycle hooks.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_with_hooks(
        config: ChannelConfig,
        hooks: Arc<dyn SegmentHooks>,
    ) -> crate::Result<Self> {
        Self::open_with(config, Arc::new(SystemClock::new()), hooks)
    }

    /// Opens a channel with a custom clock and hooks.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_with(
        config: ChannelConfig,
        clock: Arc<dyn Clock>,
        hooks: Arc<dyn SegmentHooks>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let buffers = (0..config.buffers)
            .map(|core| {
                Arc::new(TraceBuffer::new(core, &config, clock.clone(), hooks.clone()))
            })
            .collect();
        tracing::debug!(
            name = %config.name,
            buffers = config.buffers,
            segment_size = config.segment_size,
            segment_count = config.segment_count,
            overwrite = config.overwrite,
            "channel opened"
        );
        Ok(Self {
            config,
            buffers,
            finished: AtomicBool::new(false),
        })
    }

    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The configuration the channel was opened with.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Buffer for `core`, if configured.
    #[must_use]
    pub fn buffer(&self, core: usize) -> Option<&Arc<TraceBuffer>> {
        self.buffers.get(core)
    }

    /// All buffers, in core order.
    #[must_use]
    pub fn buffers(&self) -> &[Arc<TraceBuffer>] {
        &self.buffers
    }

    /// Forces a segment switch on every buffer.
    pub fn force_switch_all(&self, mode: SwitchMode) {
        tracing::debug!(channel = %self.config.name, ?mode, "forcing segment switch");
        for buffer in &self.buffers {
            buffer.force_switch(mode);
        }
    }

    /// Per-buffer loss counters, in core order.
    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            buffers: self.buffers.iter().map(|buffer| buffer.stats()).collect(),
        }
    }

    /// Flushes every buffer, wakes writers blocked on space, reports
    /// losses, and returns the final counters.
    ///
    /// The buffers stay readable afterwards, so a consumer can finish
    /// draining once the producers are gone. Idempotent; dropping the
    /// channel runs it as a fallback.
    pub fn finish(&self) -> ChannelStats {
        if !self.finished.swap(true, Ordering::AcqRel) {
            for buffer in &self.buffers {
                buffer.finalize();
                self.report_buffer(buffer);
            }
        }
        self.stats()
    }

    fn report_buffer(&self, buffer: &TraceBuffer) {
        let stats = buffer.stats();
        if stats.events_lost > 0 {
            tracing::warn!(
                channel = %self.config.name,
                core = buffer.core(),
                events_lost = stats.events_lost,
                "events were lost; consider a larger buffer or a faster consumer"
            );
        }
        if stats.corrupted_segments > 0 {
            tracing::warn!(
                channel = %self.config.name,
                core = buffer.core(),
                corrupted_segments = stats.corrupted_segments,
                "segments were reclaimed from stalled writers"
            );
        }
        self.report_unconsumed(buffer);
    }

    fn report_unconsumed(&self, buffer: &TraceBuffer) {
        let geometry = buffer.geometry();
        let write_offset = buffer.write_offset();
        let mut offset = buffer.consumed();
        let mut unconsumed = 0u64;
        while geometry.trunc(offset) < geometry.trunc(write_offset) {
            let index = geometry.index(offset);
            if geometry.offset_in_segment(buffer.segment_commit_count(index)) != 0 {
                tracing::warn!(
                    channel = %self.config.name,
                    core = buffer.core(),
                    segment = index,
                    "segment incomplete at teardown: a reservation was never committed"
                );
            }
            unconsumed += 1;
            offset = geometry.align_up_next(offset);
        }
        if unconsumed > 0 {
            tracing::debug!(
                channel = %self.config.name,
                core = buffer.core(),
                segments = unconsumed,
                "unconsumed segments remain"
            );
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Acquire) {
            self.finish();
        }
    }
}
