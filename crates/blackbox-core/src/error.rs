//! Error taxonomy for producers, the consumer, and channel construction.
//!
//! Loss-class failures (`Full`, `RecordTooLarge`, `NestingLimitExceeded`,
//! `Timeout`) are soft: the event is dropped, the buffer's `events_lost`
//! counter is incremented, and tracing continues. `StaleRead` is hard only
//! for the segment being read; the consumer discards the copy and claims
//! again. Nothing in this taxonomy stops the channel.

use thiserror::Error;

/// Errors surfaced by channel, buffer, and consumer operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Non-overwrite buffer has no consumable space; the event was dropped.
    #[error("buffer full: event lost (consumer too slow or absent)")]
    Full,

    /// The record cannot fit even in an empty segment.
    #[error("record of {size} bytes exceeds segment payload capacity of {capacity}")]
    RecordTooLarge {
        /// Requested payload size in bytes.
        size: usize,
        /// Largest payload an empty segment can hold.
        capacity: usize,
    },

    /// A reentrant reservation exceeded the nesting limit; the event was
    /// dropped.
    #[error("reservation nesting deeper than {limit}: event lost")]
    NestingLimitExceeded {
        /// Configured nesting limit.
        limit: u32,
    },

    /// No fully committed segment is available to read right now.
    #[error("no complete segment available")]
    WouldBlock,

    /// Another reader already holds a claim on this buffer.
    #[error("a reader is already active on this buffer")]
    AlreadyActive,

    /// The claimed segment was reclaimed by writers while it was being
    /// read; the copied bytes must be discarded.
    #[error("segment overwritten during read: discard and retry")]
    StaleRead,

    /// A blocking reservation hit its deadline while waiting for space.
    #[error("timed out waiting for free buffer space")]
    Timeout,

    /// Configuration rejected at channel construction.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Human-readable rejection cause.
        reason: String,
    },

    /// Drained segment bytes could not be decoded.
    #[error("segment decode failed: {reason}")]
    Decode {
        /// What the parser found.
        reason: &'static str,
    },
}

impl ChannelError {
    /// Returns `true` for failures that dropped an event and were counted
    /// in `events_lost`.
    #[must_use]
    pub fn is_event_loss(&self) -> bool {
        matches!(
            self,
            Self::Full
                | Self::RecordTooLarge { .. }
                | Self::NestingLimitExceeded { .. }
                | Self::Timeout
        )
    }
}
