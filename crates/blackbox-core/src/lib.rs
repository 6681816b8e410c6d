//! # Blackbox Core
//!
//! Lock-free, per-core event tracing channels: many concurrent producers
//! append framed records into circular segment logs, and a single consumer
//! drains whole segments at a time.
//!
//! This crate provides:
//! - **Channel**: a named set of per-core buffers with one configuration,
//!   forced switches, and teardown loss reporting
//! - **`TraceBuffer`**: the lock-free reservation / commit / switch core
//! - **`SegmentGuard`**: consumer claims that copy a segment out and
//!   validate the claim after the copy
//! - **`SegmentView`**: the decoder for drained segment bytes
//!
//! ## Design Principles
//!
//! 1. **One CAS per record** - producers race a single compare-exchange on
//!    the write offset; everything after it is wait-free
//! 2. **Commit counters, not locks** - segment completion is arithmetic
//!    over per-segment fetch-adds, tolerant of out-of-order commits
//! 3. **Writers never wait for the reader** - overwrite mode pushes the
//!    reader forward instead of stalling the hot path
//! 4. **Loss is counted, never silent** - refused records and reclaimed
//!    segments are tallied per buffer and reported at teardown
//!
//! ## Example
//!
//! ```rust,ignore
//! use blackbox_core::{Channel, ChannelConfig, SwitchMode};
//!
//! let channel = Channel::open(ChannelConfig::named("sched"))?;
//! let buffer = channel.buffer(0).unwrap();
//!
//! let mut slot = buffer.reserve(16)?;
//! slot.write(b"ctx-switch 7>12 ");
//! slot.commit();
//!
//! // drain everything written so far
//! channel.force_switch_all(SwitchMode::Flush);
//! let mut bytes = Vec::new();
//! buffer.consume_segment(&mut bytes)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)] // Selectively allowed in the segment arena with safety notes
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod channel;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod error;
pub mod header;
mod segment;
pub mod stats;

// Re-export key types
pub use buffer::{Reservation, SwitchMode, TraceBuffer};
pub use channel::{Channel, NoopHooks, SegmentHooks};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ChannelConfig;
pub use consumer::SegmentGuard;
pub use error::ChannelError;
pub use header::{Record, SegmentView};
pub use stats::{BufferStats, ChannelStats};

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;
