//! Channel configuration.

use crate::error::ChannelError;
use crate::header::{RECORD_HEADER_WIDE_LEN, SEGMENT_HEADER_LEN};

/// Default segment size in bytes.
pub const DEFAULT_SEGMENT_SIZE: usize = 4096;

/// Minimum segment size (must hold the segment header plus a usable record).
pub const MIN_SEGMENT_SIZE: usize = 256;

/// Maximum segment size (the segment header stores it as a `u32`).
pub const MAX_SEGMENT_SIZE: usize = 1 << 30;

/// Default number of segments per buffer.
pub const DEFAULT_SEGMENT_COUNT: usize = 8;

/// Minimum number of segments per buffer. With a single segment the open
/// and close of the same generation would race, so two is the floor.
pub const MIN_SEGMENT_COUNT: usize = 2;

/// Maximum number of segments per buffer.
pub const MAX_SEGMENT_COUNT: usize = 1 << 20;

/// Default and maximum compaction window in clock ticks.
///
/// Narrow record headers keep only the low 32 bits of the timestamp, and
/// the reader resolves them with serial-number arithmetic. That stays
/// exact only while full timestamps are at most half the 32-bit space
/// apart, so the window may never exceed `1 << 31`.
pub const DEFAULT_COMPACT_WINDOW: u64 = 1 << 31;

/// Upper bound on [`ChannelConfig::compact_window`].
pub const MAX_COMPACT_WINDOW: u64 = 1 << 31;

/// Default bound on reentrant reservations per thread.
pub const DEFAULT_MAX_NESTING: u32 = 4;

/// Configuration for a trace channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel name, used in logs.
    pub name: String,

    /// Segment size in bytes. Must be a power of two.
    pub segment_size: usize,

    /// Segments per buffer. Must be a power of two.
    pub segment_count: usize,

    /// Number of per-core buffers in the channel.
    pub buffers: usize,

    /// Overwrite mode: producers reclaim the oldest unread segment when
    /// the buffer is full instead of dropping the new record.
    pub overwrite: bool,

    /// Maximum clock distance between a record and the last full
    /// timestamp before the record header is widened.
    pub compact_window: u64,

    /// Maximum reentrant reservations a single thread may stack.
    pub max_nesting: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: String::from("trace"),
            segment_size: DEFAULT_SEGMENT_SIZE,
            segment_count: DEFAULT_SEGMENT_COUNT,
            buffers: 1,
            overwrite: false,
            compact_window: DEFAULT_COMPACT_WINDOW,
            max_nesting: DEFAULT_MAX_NESTING,
        }
    }
}

impl ChannelConfig {
    /// Creates a named configuration with default sizing.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Creates a builder for custom configuration.
    #[must_use]
    pub fn builder() -> ChannelConfigBuilder {
        ChannelConfigBuilder::default()
    }

    /// Total bytes per buffer.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.segment_size * self.segment_count
    }

    /// Largest payload a single record can carry.
    #[must_use]
    pub fn max_payload_len(&self) -> usize {
        self.segment_size - SEGMENT_HEADER_LEN - RECORD_HEADER_WIDE_LEN
    }

    /// Checks the configuration against the protocol's requirements.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if !self.segment_size.is_power_of_two()
            || self.segment_size < MIN_SEGMENT_SIZE
            || self.segment_size > MAX_SEGMENT_SIZE
        {
            return Err(ChannelError::InvalidConfig {
                reason: format!(
                    "segment_size {} must be a power of two in {MIN_SEGMENT_SIZE}..={MAX_SEGMENT_SIZE}",
                    self.segment_size
                ),
            });
        }
        if !self.segment_count.is_power_of_two()
            || self.segment_count < MIN_SEGMENT_COUNT
            || self.segment_count > MAX_SEGMENT_COUNT
        {
            return Err(ChannelError::InvalidConfig {
                reason: format!(
                    "segment_count {} must be a power of two in {MIN_SEGMENT_COUNT}..={MAX_SEGMENT_COUNT}",
                    self.segment_count
                ),
            });
        }
        if self.buffers == 0 {
            return Err(ChannelError::InvalidConfig {
                reason: String::from("buffers must be at least 1"),
            });
        }
        if self.compact_window == 0 || self.compact_window > MAX_COMPACT_WINDOW {
            return Err(ChannelError::InvalidConfig {
                reason: format!(
                    "compact_window {} must be in 1..={MAX_COMPACT_WINDOW}",
                    self.compact_window
                ),
            });
        }
        if self.max_nesting == 0 {
            return Err(ChannelError::InvalidConfig {
                reason: String::from("max_nesting must be at least 1"),
            });
        }
        Ok(())
    }
}

/// Builder for [`ChannelConfig`].
#[derive(Debug, Default)]
pub struct ChannelConfigBuilder {
    name: Option<String>,
    segment_size: Option<usize>,
    segment_count: Option<usize>,
    buffers: Option<usize>,
    overwrite: Option<bool>,
    compact_window: Option<u64>,
    max_nesting: Option<u32>,
}

impl ChannelConfigBuilder {
    /// Sets the channel name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the segment size in bytes.
    #[must_use]
    pub fn segment_size(mut self, size: usize) -> Self {
        self.segment_size = Some(size);
        self
    }

    /// Sets the number of segments per buffer.
    #[must_use]
    pub fn segment_count(mut self, count: usize) -> Self {
        self.segment_count = Some(count);
        self
    }

    /// Sets the number of per-core buffers.
    #[must_use]
    pub fn buffers(mut self, buffers: usize) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Enables or disables overwrite mode.
    #[must_use]
    pub fn overwrite(mut self, enabled: bool) -> Self {
        self.overwrite = Some(enabled);
        self
    }

    /// Sets the timestamp compaction window.
    #[must_use]
    pub fn compact_window(mut self, ticks: u64) -> Self {
        self.compact_window = Some(ticks);
        self
    }

    /// Sets the per-thread nesting limit.
    #[must_use]
    pub fn max_nesting(mut self, limit: u32) -> Self {
        self.max_nesting = Some(limit);
        self
    }

    /// Builds the configuration. Validation happens when the channel is
    /// opened.
    #[must_use]
    pub fn build(self) -> ChannelConfig {
        let defaults = ChannelConfig::default();
        ChannelConfig {
            name: self.name.unwrap_or(defaults.name),
            segment_size: self.segment_size.unwrap_or(defaults.segment_size),
            segment_count: self.segment_count.unwrap_or(defaults.segment_count),
            buffers: self.buffers.unwrap_or(defaults.buffers),
            overwrite: self.overwrite.unwrap_or(defaults.overwrite),
            compact_window: self.compact_window.unwrap_or(defaults.compact_window),
            max_nesting: self.max_nesting.unwrap_or(defaults.max_nesting),
        }
    }
}
