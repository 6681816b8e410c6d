//! Per-core ring buffer: lock-free reservation, commit accounting, and
//! segment switching.
//!
//! Producers race a single CAS on the write offset; everything after the
//! CAS touches only the reserved byte range and the per-segment commit
//! counters, so writers never wait on each other. The consumer takes no
//! lock against producers either: it claims the oldest segment by offset,
//! copies it out, and validates the claim afterwards.
//!
//! Offsets are logical `u64` values that only grow. The geometry masks
//! them down to physical positions, and all fullness checks subtract
//! truncated offsets as signed values so a reader pushed past a stale
//! snapshot cannot produce a bogus huge distance.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::channel::SegmentHooks;
use crate::clock::Clock;
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::header::{
    encode_close_fields, record_header_len, RecordHeader, SegmentHeader, CLOSE_FIELDS_OFFSET,
    RECORD_HEADER_WIDE_LEN, SEGMENT_HEADER_LEN,
};
use crate::segment::{CachePadded, Geometry, SegmentArena};
use crate::stats::{AtomicBufferStats, BufferStats};

/// Worst-case framing bytes a record may need once space frees up: a
/// segment header if the record opens a segment, plus a wide record
/// header. Used by the blocking path to wait for enough room.
const BLOCKING_HEADROOM: u64 = (SEGMENT_HEADER_LEN + RECORD_HEADER_WIDE_LEN) as u64;

thread_local! {
    static NESTING_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Depth ticket for the current thread's reservation stack.
///
/// Incremented on reserve, decremented when the reservation is committed
/// or dropped. The raw-pointer marker keeps the ticket (and everything
/// holding it) off other threads, where the decrement would hit the wrong
/// counter.
#[derive(Debug)]
struct NestingGuard {
    _not_send: PhantomData<*const ()>,
}

impl NestingGuard {
    fn enter(limit: u32) -> Result<Self, ChannelError> {
        NESTING_DEPTH.with(|depth| {
            let current = depth.get();
            if current >= limit {
                return Err(ChannelError::NestingLimitExceeded { limit });
            }
            depth.set(current + 1);
            Ok(Self {
                _not_send: PhantomData,
            })
        })
    }
}

impl Drop for NestingGuard {
    fn drop(&mut self) {
        NESTING_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// How a forced switch leaves the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchMode {
    /// Close the current segment and immediately open the next one.
    #[default]
    Active,

    /// Close the current segment without opening a successor; the next
    /// reservation reopens the buffer. Used when draining.
    Flush,
}

/// Everything a successful reservation CAS committed to.
struct ReserveOffsets {
    old: u64,
    begin: u64,
    end: u64,
    record_len: u64,
    wide: bool,
    begin_switch: bool,
    end_switch_old: bool,
    end_switch_current: bool,
    reserve_commit_diff: u64,
    tsc: u64,
}

struct SwitchOffsets {
    old: u64,
    begin: u64,
    end: u64,
    reserve_commit_diff: u64,
    tsc: u64,
}

/// One per-core circular event log.
///
/// Any number of threads may reserve and commit concurrently, including
/// reentrant contexts on the same thread up to the configured nesting
/// limit. At most one reader may hold a segment claim at a time.
pub struct TraceBuffer {
    core: usize,
    overwrite: bool,
    compact_window: u64,
    max_nesting: u32,
    geometry: Geometry,
    arena: SegmentArena,
    clock: Arc<dyn Clock>,
    hooks: Arc<dyn SegmentHooks>,

    write_offset: CachePadded<AtomicU64>,
    consumed: CachePadded<AtomicU64>,
    commit_counts: Box<[CachePadded<AtomicU64>]>,
    last_full_tsc: AtomicU64,

    active_readers: AtomicU32,
    finalized: AtomicBool,
    wakeup: AtomicBool,
    stats: AtomicBufferStats,

    full_lock: Mutex<()>,
    space_available: Condvar,
}

impl TraceBuffer {
    /// Creates the buffer with segment 0 already open.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn new(
        core: usize,
        config: &ChannelConfig,
        clock: Arc<dyn Clock>,
        hooks: Arc<dyn SegmentHooks>,
    ) -> Self {
        let geometry = Geometry::new(config.segment_size, config.segment_count);
        let arena = SegmentArena::new(config.segment_size, config.segment_count);
        let commit_counts = (0..config.segment_count)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let buffer = Self {
            core,
            overwrite: config.overwrite,
            compact_window: config.compact_window,
            max_nesting: config.max_nesting,
            geometry,
            arena,
            clock,
            hooks,
            write_offset: CachePadded::new(AtomicU64::new(SEGMENT_HEADER_LEN as u64)),
            consumed: CachePadded::new(AtomicU64::new(0)),
            commit_counts,
            last_full_tsc: AtomicU64::new(0),
            active_readers: AtomicU32::new(0),
            finalized: AtomicBool::new(false),
            wakeup: AtomicBool::new(false),
            stats: AtomicBufferStats::new(),
            full_lock: Mutex::new(()),
            space_available: Condvar::new(),
        };

        let tsc = buffer.clock.now();
        buffer.hooks.segment_opened(&buffer, tsc, 0);
        let header = SegmentHeader::open(
            config.segment_size as u32,
            tsc,
            buffer.clock.frequency_hz(),
        );
        buffer.arena.write(0, 0, &header.to_bytes());
        buffer.commit_counts[0].store(SEGMENT_HEADER_LEN as u64, Ordering::Relaxed);
        buffer.last_full_tsc.store(tsc, Ordering::Relaxed);
        buffer
    }

    /// Reserves a slot for `payload_len` bytes, failing fast when the
    /// buffer cannot take the record.
    ///
    /// The returned [`Reservation`] must be filled and committed; a
    /// dropped reservation leaves its segment permanently short, and the
    /// segment is later reclaimed as corrupted.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Full`] when the buffer is not in overwrite mode and
    /// the next segment still holds unconsumed data,
    /// [`ChannelError::RecordTooLarge`] when the record cannot fit in an
    /// empty segment, and [`ChannelError::NestingLimitExceeded`] when the
    /// calling thread already holds too many reservations. All three drop
    /// the event and count it in `events_lost`.
    pub fn reserve(&self, payload_len: usize) -> crate::Result<Reservation<'_>> {
        let nesting = match NestingGuard::enter(self.max_nesting) {
            Ok(guard) => guard,
            Err(err) => {
                self.stats.record_lost();
                return Err(err);
            }
        };
        self.reserve_with_guard(payload_len, nesting)
    }

    /// Reserves a slot, waiting for the consumer to free space when the
    /// buffer is full.
    ///
    /// Overwrite-mode buffers and records too large for any segment never
    /// wait. Must not be called while the thread already holds a
    /// reservation: the outstanding slot keeps its segment from ever
    /// completing, so the wait could not end.
    ///
    /// # Errors
    ///
    /// Same as [`reserve`](Self::reserve); [`ChannelError::Full`] is still
    /// possible when the buffer refills between the wakeup and the
    /// reservation, or when the buffer is finalized while waiting.
    pub fn reserve_blocking(&self, payload_len: usize) -> crate::Result<Reservation<'_>> {
        self.reserve_blocking_inner(payload_len, None)
    }

    /// Like [`reserve_blocking`](Self::reserve_blocking) with a bound on
    /// the wait.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Timeout`] when the deadline passes with the buffer
    /// still full; otherwise as [`reserve_blocking`](Self::reserve_blocking).
    pub fn reserve_blocking_timeout(
        &self,
        payload_len: usize,
        timeout: Duration,
    ) -> crate::Result<Reservation<'_>> {
        self.reserve_blocking_inner(payload_len, Some(Instant::now() + timeout))
    }

    fn reserve_blocking_inner(
        &self,
        payload_len: usize,
        deadline: Option<Instant>,
    ) -> crate::Result<Reservation<'_>> {
        let nesting = match NestingGuard::enter(self.max_nesting) {
            Ok(guard) => guard,
            Err(err) => {
                self.stats.record_lost();
                return Err(err);
            }
        };

        let payload = payload_len as u64;
        // Oversized records skip the wait: no amount of draining helps.
        if !self.overwrite && BLOCKING_HEADROOM + payload <= self.geometry.segment_size() {
            let mut guard = self.full_lock.lock();
            while self.would_block(payload) && !self.finalized.load(Ordering::Acquire) {
                match deadline {
                    Some(deadline) => {
                        if self
                            .space_available
                            .wait_until(&mut guard, deadline)
                            .timed_out()
                        {
                            if self.would_block(payload)
                                && !self.finalized.load(Ordering::Acquire)
                            {
                                drop(guard);
                                self.stats.record_lost();
                                return Err(ChannelError::Timeout);
                            }
                            break;
                        }
                    }
                    None => self.space_available.wait(&mut guard),
                }
            }
            drop(guard);
        }

        // Single attempt: the wait only made space likely, not certain.
        let result = self.reserve_with_guard(payload_len, nesting);
        if matches!(result, Err(ChannelError::Full)) {
            tracing::warn!(
                core = self.core,
                "event lost after blocking wait: buffer refilled before the reservation"
            );
        }
        result
    }

    fn reserve_with_guard(
        &self,
        payload_len: usize,
        nesting: NestingGuard,
    ) -> crate::Result<Reservation<'_>> {
        let offsets = loop {
            let offsets = self.try_reserve(payload_len)?;
            if self
                .write_offset
                .compare_exchange(offsets.old, offsets.end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break offsets;
            }
        };
        Ok(self.finish_reservation(offsets, payload_len, nesting))
    }

    /// Computes where a record of `payload_len` bytes would go, without
    /// publishing anything. Side effects happen only after the caller wins
    /// the CAS, except for the loss counters on the error paths.
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    fn try_reserve(&self, payload_len: usize) -> crate::Result<ReserveOffsets> {
        let seg = self.geometry.segment_size();
        let payload = payload_len as u64;

        let old = self.write_offset.load(Ordering::Acquire);
        let mut begin = old;
        let tsc = self.clock.now();
        let wide_by_window = tsc.wrapping_sub(self.last_full_tsc.load(Ordering::Relaxed))
            >= self.compact_window;

        let mut begin_switch = false;
        let mut end_switch_old = false;

        if self.geometry.offset_in_segment(begin) == 0 {
            // the record lands on a fresh segment and must open it
            begin_switch = true;
        } else {
            let record_len = record_header_len(wide_by_window) as u64 + payload;
            if self.geometry.offset_in_segment(begin) + record_len > seg {
                // no room left in the current segment
                end_switch_old = true;
                begin_switch = true;
            }
        }

        let mut reserve_commit_diff = 0;
        if begin_switch {
            if end_switch_old {
                begin = self.geometry.align_up_next(begin);
            }
            begin += SEGMENT_HEADER_LEN as u64;
            let index = self.geometry.index(begin);
            let commit_count = self.commit_counts[index].load(Ordering::Acquire);
            reserve_commit_diff =
                self.geometry.offset_in_segment(seg.wrapping_sub(commit_count));
            if reserve_commit_diff == 0 && !self.overwrite {
                let consumed = self.consumed.load(Ordering::Acquire);
                let used = self
                    .geometry
                    .trunc(begin)
                    .wrapping_sub(self.geometry.trunc(consumed));
                if used as i64 >= self.geometry.buffer_size() as i64 {
                    self.stats.record_lost();
                    return Err(ChannelError::Full);
                }
            }
            // reserve_commit_diff != 0: the target segment's previous
            // generation never finished committing. Take it anyway;
            // push_reader repairs the commit count.
        }

        let wide = begin_switch || wide_by_window;
        let record_len = record_header_len(wide) as u64 + payload;

        if self.geometry.offset_in_segment(begin) + record_len > seg {
            // cannot fit even at the start of an empty segment
            self.stats.record_lost();
            return Err(ChannelError::RecordTooLarge {
                size: payload_len,
                capacity: seg as usize - SEGMENT_HEADER_LEN - RECORD_HEADER_WIDE_LEN,
            });
        }

        let end = begin + record_len;
        let end_switch_current = self.geometry.offset_in_segment(end) == 0;

        Ok(ReserveOffsets {
            old,
            begin,
            end,
            record_len,
            wide,
            begin_switch,
            end_switch_old,
            end_switch_current,
            reserve_commit_diff,
            tsc,
        })
    }

    /// Runs the post-CAS protocol and hands the slot to the caller.
    #[allow(clippy::cast_possible_truncation)]
    fn finish_reservation(
        &self,
        offsets: ReserveOffsets,
        payload_len: usize,
        nesting: NestingGuard,
    ) -> Reservation<'_> {
        self.push_reader(offsets.end, offsets.begin, offsets.reserve_commit_diff);
        if offsets.end_switch_old {
            self.close_segment(offsets.old, offsets.tsc);
        }
        if offsets.begin_switch {
            self.open_segment(offsets.begin, offsets.tsc);
        }
        if offsets.end_switch_current {
            self.close_segment(offsets.end, offsets.tsc);
        }

        let segment = self.geometry.index(offsets.begin);
        let record_offset = self.geometry.offset_in_segment(offsets.begin) as usize;
        let header = if offsets.wide {
            RecordHeader::Wide {
                payload_len: payload_len as u32,
                timestamp: offsets.tsc,
            }
        } else {
            RecordHeader::Narrow {
                payload_len: payload_len as u32,
                // narrow headers carry only the low word
                tsc_low: offsets.tsc as u32,
            }
        };
        let mut encoded = [0u8; RECORD_HEADER_WIDE_LEN];
        let header_len = header.encode_into(&mut encoded);
        self.arena.write(segment, record_offset, &encoded[..header_len]);
        if offsets.wide {
            self.last_full_tsc.store(offsets.tsc, Ordering::Relaxed);
        }

        Reservation {
            buffer: self,
            segment,
            payload_offset: record_offset + header_len,
            payload_len,
            record_len: offsets.record_len,
            written: 0,
            _nesting: nesting,
        }
    }

    /// Moves the consumed offset out of the writer's way when the write
    /// position has lapped it. Many writers may race here; the CAS makes
    /// exactly one of them advance the reader per segment.
    #[allow(clippy::cast_possible_wrap)]
    fn push_reader(&self, end: u64, begin: u64, reserve_commit_diff: u64) {
        loop {
            let consumed_old = self.consumed.load(Ordering::Acquire);
            let lap = self
                .geometry
                .trunc(end.wrapping_sub(1))
                .wrapping_sub(self.geometry.trunc(consumed_old));
            if (lap as i64) < self.geometry.buffer_size() as i64 {
                return;
            }
            if self
                .consumed
                .compare_exchange(
                    consumed_old,
                    self.geometry.align_up_next(consumed_old),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }
        if reserve_commit_diff != 0 {
            // The reclaimed segment was left short by a writer that never
            // committed; fold the missing bytes back in so the counter
            // lines up for the new generation. The old contents are gone.
            self.commit_counts[self.geometry.index(begin)]
                .fetch_add(reserve_commit_diff, Ordering::AcqRel);
            self.stats.record_corrupted();
        }
    }

    /// Closes the segment generation that ends at `at`: patches the close
    /// fields and accounts the padding as committed bytes.
    #[allow(clippy::cast_possible_truncation)]
    fn close_segment(&self, at: u64, tsc: u64) {
        let index = self.geometry.index(at.wrapping_sub(1));
        let data_end = self.geometry.offset_in_segment(at.wrapping_sub(1)) + 1;
        let padding = self.geometry.segment_size() - data_end;
        self.hooks.segment_closed(self, tsc, at, index);
        self.arena.write(
            index,
            CLOSE_FIELDS_OFFSET,
            &encode_close_fields(padding as u32, tsc),
        );
        let count = self.commit_counts[index].fetch_add(padding, Ordering::AcqRel) + padding;
        if self.geometry.offset_in_segment(count) == 0 {
            self.deliver();
        }
    }

    /// Opens a fresh generation of the segment holding `begin`: writes the
    /// open header and accounts it as committed bytes.
    #[allow(clippy::cast_possible_truncation)]
    fn open_segment(&self, begin: u64, tsc: u64) {
        let index = self.geometry.index(begin);
        self.hooks.segment_opened(self, tsc, index);
        let header = SegmentHeader::open(
            self.geometry.segment_size() as u32,
            tsc,
            self.clock.frequency_hz(),
        );
        self.arena.write(index, 0, &header.to_bytes());
        let count = self.commit_counts[index]
            .fetch_add(SEGMENT_HEADER_LEN as u64, Ordering::AcqRel)
            + SEGMENT_HEADER_LEN as u64;
        if self.geometry.offset_in_segment(count) == 0 {
            self.deliver();
        }
    }

    /// Closes the segment currently being written, even half full.
    ///
    /// `Active` immediately opens the next segment; `Flush` leaves the
    /// buffer parked on the boundary so a drain sees everything written so
    /// far. Does nothing when the current segment holds no data, or when
    /// an `Active` switch would stomp unconsumed data in a non-overwrite
    /// buffer.
    pub fn force_switch(&self, mode: SwitchMode) {
        let offsets = loop {
            let Some(offsets) = self.try_switch(mode) else {
                return;
            };
            if self
                .write_offset
                .compare_exchange(offsets.old, offsets.end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break offsets;
            }
        };
        // Flush parks the buffer on the boundary without claiming new
        // space, so only an Active switch may displace the reader.
        if mode == SwitchMode::Active {
            self.push_reader(offsets.end, offsets.begin, offsets.reserve_commit_diff);
        }
        self.close_segment(offsets.old, offsets.tsc);
        if mode == SwitchMode::Active {
            self.open_segment(offsets.begin, offsets.tsc);
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn try_switch(&self, mode: SwitchMode) -> Option<SwitchOffsets> {
        let old = self.write_offset.load(Ordering::Acquire);
        let tsc = self.clock.now();
        if self.geometry.offset_in_segment(old) == 0 {
            // segment is fresh (or the buffer is parked); nothing to close
            return None;
        }
        let mut begin = self.geometry.align_up_next(old);
        if mode == SwitchMode::Active {
            begin += SEGMENT_HEADER_LEN as u64;
        }
        let index = self.geometry.index(begin);
        let commit_count = self.commit_counts[index].load(Ordering::Acquire);
        let reserve_commit_diff = self
            .geometry
            .offset_in_segment(self.geometry.segment_size().wrapping_sub(commit_count));
        if reserve_commit_diff == 0
            && mode == SwitchMode::Active
            && !self.overwrite
            && begin.wrapping_sub(self.consumed.load(Ordering::Acquire)) as i64
                >= self.geometry.buffer_size() as i64
        {
            // opening the next segment would stomp unread data
            return None;
        }
        Some(SwitchOffsets {
            old,
            begin,
            end: begin,
            reserve_commit_diff,
            tsc,
        })
    }

    /// Marks a delivery: some segment just became fully committed.
    fn deliver(&self) {
        self.wakeup.store(true, Ordering::Release);
    }

    /// Clears and returns the pending delivery flag. A polling consumer
    /// uses this to skip buffers with nothing new since its last visit.
    pub fn take_wakeup(&self) -> bool {
        self.wakeup.swap(false, Ordering::AcqRel)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn would_block(&self, payload: u64) -> bool {
        let write_offset = self.write_offset.load(Ordering::Acquire);
        let consumed = self.consumed.load(Ordering::Acquire);
        let needed = write_offset + BLOCKING_HEADROOM + payload;
        needed.wrapping_sub(self.geometry.trunc(consumed)) as i64
            >= self.geometry.buffer_size() as i64
    }

    /// Claims the oldest fully committed segment for reading.
    ///
    /// Returns the claim offset and the segment index to copy.
    pub(crate) fn reader_acquire(&self) -> crate::Result<(u64, usize)> {
        if self.active_readers.fetch_add(1, Ordering::AcqRel) != 0 {
            self.active_readers.fetch_sub(1, Ordering::AcqRel);
            return Err(ChannelError::AlreadyActive);
        }
        let consumed_old = self.consumed.load(Ordering::Acquire);
        let index = self.geometry.index(consumed_old);
        let commit_count = self.commit_counts[index].load(Ordering::Acquire);
        if self.geometry.offset_in_segment(commit_count) != 0 {
            // segment still has uncommitted reservations, or a new
            // generation is already in flight
            self.active_readers.fetch_sub(1, Ordering::AcqRel);
            return Err(ChannelError::WouldBlock);
        }
        let write_offset = self.write_offset.load(Ordering::Acquire);
        if self.geometry.trunc(write_offset) == self.geometry.trunc(consumed_old) {
            // writers are still inside this segment
            self.active_readers.fetch_sub(1, Ordering::AcqRel);
            return Err(ChannelError::WouldBlock);
        }
        Ok((consumed_old, index))
    }

    /// Releases a read claim, advancing the consumed offset past the
    /// segment and waking writers blocked on space.
    pub(crate) fn reader_release(&self, consumed_old: u64) -> crate::Result<()> {
        let consumed_new = self.geometry.align_up_next(consumed_old);
        let guard = self.full_lock.lock();
        let result = if self
            .consumed
            .compare_exchange(consumed_old, consumed_new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.space_available.notify_all();
            Ok(())
        } else {
            // a writer pushed past us while we copied; the copy is stale
            Err(ChannelError::StaleRead)
        };
        self.active_readers.fetch_sub(1, Ordering::AcqRel);
        drop(guard);
        result
    }

    /// Drops a read claim without consuming the segment.
    pub(crate) fn reader_abandon(&self) {
        self.active_readers.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn copy_segment(&self, index: usize, out: &mut Vec<u8>) {
        self.arena.copy_segment_into(index, out);
    }

    /// Flushes the buffer and wakes every writer blocked on space.
    /// Idempotent; records written afterwards are still accepted.
    pub(crate) fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        self.force_switch(SwitchMode::Flush);
        let guard = self.full_lock.lock();
        self.space_available.notify_all();
        drop(guard);
    }

    /// The core this buffer belongs to.
    #[must_use]
    pub fn core(&self) -> usize {
        self.core
    }

    /// Loss counters accumulated so far.
    #[must_use]
    pub fn stats(&self) -> BufferStats {
        self.stats.snapshot()
    }

    /// `true` once the owning channel started tearing down.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Current logical write offset.
    #[must_use]
    pub fn write_offset(&self) -> u64 {
        self.write_offset.load(Ordering::Acquire)
    }

    /// Current logical consumed offset.
    #[must_use]
    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// Segment size in bytes.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn segment_size(&self) -> usize {
        self.geometry.segment_size() as usize
    }

    /// Number of segments in the ring.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.geometry.segment_count()
    }

    pub(crate) fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub(crate) fn segment_commit_count(&self, index: usize) -> u64 {
        self.commit_counts[index].load(Ordering::Acquire)
    }
}

impl fmt::Debug for TraceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceBuffer")
            .field("core", &self.core)
            .field("overwrite", &self.overwrite)
            .field("write_offset", &self.write_offset.load(Ordering::Relaxed))
            .field("consumed", &self.consumed.load(Ordering::Relaxed))
            .field("finalized", &self.finalized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// An in-flight record slot.
///
/// The record header is already in place; the caller writes the payload
/// and commits. Bytes never written keep whatever the arena last held at
/// that position. Holds the thread's nesting ticket, so it cannot move to
/// another thread; dropping it without committing leaves the segment
/// short, and the generation is reclaimed as corrupted the next time
/// writers lap it.
#[derive(Debug)]
#[must_use = "an uncommitted reservation corrupts its segment"]
pub struct Reservation<'a> {
    buffer: &'a TraceBuffer,
    segment: usize,
    payload_offset: usize,
    payload_len: usize,
    record_len: u64,
    written: usize,
    _nesting: NestingGuard,
}

impl Reservation<'_> {
    /// Reserved payload length.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Payload bytes not yet written.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.payload_len - self.written
    }

    /// Appends payload bytes to the slot.
    ///
    /// # Panics
    ///
    /// Panics if `data` overruns the reserved payload length.
    pub fn write(&mut self, data: &[u8]) {
        assert!(
            self.written + data.len() <= self.payload_len,
            "payload overruns reservation"
        );
        self.buffer
            .arena
            .write(self.segment, self.payload_offset + self.written, data);
        self.written += data.len();
    }

    /// Publishes the record by adding its bytes to the segment's commit
    /// count. Out-of-order commits are fine; the segment completes when
    /// every reserved byte has been committed.
    pub fn commit(self) {
        let count = self.buffer.commit_counts[self.segment]
            .fetch_add(self.record_len, Ordering::AcqRel)
            + self.record_len;
        if self.buffer.geometry.offset_in_segment(count) == 0 {
            self.buffer.deliver();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::header::{SegmentView, LOST_SIZE_OPEN};
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Hooks;

    impl SegmentHooks for Hooks {}

    fn test_buffer(segment_size: usize, segment_count: usize, overwrite: bool) -> TraceBuffer {
        let config = ChannelConfig::builder()
            .segment_size(segment_size)
            .segment_count(segment_count)
            .overwrite(overwrite)
            .build();
        TraceBuffer::new(0, &config, Arc::new(ManualClock::new(1_000)), Arc::new(Hooks))
    }

    fn header_at(buffer: &TraceBuffer, segment: usize) -> SegmentHeader {
        SegmentHeader::from_bytes(&buffer.arena.read(segment, 0, SEGMENT_HEADER_LEN)).unwrap()
    }

    #[test]
    fn test_new_buffer_state() {
        let buffer = test_buffer(256, 4, false);
        assert_eq!(buffer.write_offset(), SEGMENT_HEADER_LEN as u64);
        assert_eq!(buffer.consumed(), 0);
        assert!(buffer.stats().is_clean());
        assert!(!buffer.take_wakeup());

        let header = header_at(&buffer, 0);
        assert_eq!(header.begin_timestamp, 1_000);
        assert_eq!(header.lost_size, LOST_SIZE_OPEN);

        // nothing complete yet
        assert_eq!(buffer.reader_acquire().unwrap_err(), ChannelError::WouldBlock);
    }

    #[test]
    fn test_reserve_write_commit() {
        let buffer = test_buffer(256, 4, false);
        let mut reservation = buffer.reserve(10).unwrap();
        assert_eq!(reservation.payload_len(), 10);
        assert_eq!(reservation.remaining(), 10);
        reservation.write(b"01234");
        reservation.write(b"56789");
        assert_eq!(reservation.remaining(), 0);
        reservation.commit();

        // narrow header (8 bytes) + payload
        assert_eq!(buffer.write_offset(), 40 + 18);
        assert_eq!(buffer.segment_commit_count(0), 40 + 18);
        assert_eq!(buffer.arena.read(0, 48, 10), b"0123456789");
    }

    #[test]
    fn test_boundary_fill_closes_segment() {
        let buffer = test_buffer(256, 4, false);

        let r1 = buffer.reserve(100).unwrap();
        r1.commit();
        assert_eq!(buffer.write_offset(), 148);

        // 8 + 100 lands exactly on the segment boundary
        let r2 = buffer.reserve(100).unwrap();
        assert_eq!(buffer.write_offset(), 256);

        // segment 0 is closed with zero padding, but not yet complete:
        // the second record is still uncommitted
        let header = header_at(&buffer, 0);
        assert!(header.is_closed());
        assert_eq!(header.lost_size, 0);
        assert!(!buffer.take_wakeup());

        r2.commit();
        assert_eq!(buffer.segment_commit_count(0), 256);
        assert!(buffer.take_wakeup());

        // next record opens segment 1 with a wide header
        let r3 = buffer.reserve(10).unwrap();
        assert_eq!(buffer.write_offset(), 256 + 40 + 12 + 10);
        assert_eq!(buffer.segment_commit_count(1), 40);
        r3.commit();
    }

    #[test]
    fn test_full_refused_until_consumed() {
        let buffer = test_buffer(256, 2, false);
        buffer.reserve(200).unwrap().commit();
        buffer.reserve(200).unwrap().commit();

        // both segments hold data the consumer has not taken
        assert_eq!(buffer.reserve(200).unwrap_err(), ChannelError::Full);
        assert_eq!(buffer.stats().events_lost, 1);

        let (claim, index) = buffer.reader_acquire().unwrap();
        assert_eq!(index, 0);
        let mut copy = Vec::new();
        buffer.copy_segment(index, &mut copy);
        SegmentView::parse(&copy).unwrap();
        buffer.reader_release(claim).unwrap();
        assert_eq!(buffer.consumed(), 256);

        buffer.reserve(200).unwrap().commit();
        assert_eq!(buffer.stats().events_lost, 1);
    }

    #[test]
    fn test_record_too_large() {
        let buffer = test_buffer(256, 4, false);

        let err = buffer.reserve(500).unwrap_err();
        assert_eq!(
            err,
            ChannelError::RecordTooLarge {
                size: 500,
                capacity: 204,
            }
        );

        // too large only after the segment switch it would force
        assert!(buffer.reserve(210).is_err());
        // failed attempts must not move the write offset
        assert_eq!(buffer.write_offset(), 40);
        assert_eq!(buffer.stats().events_lost, 2);

        // the largest payload that fits mid-segment
        buffer.reserve(204).unwrap().commit();
        assert_eq!(buffer.write_offset(), 252);
    }

    #[test]
    fn test_nesting_limit() {
        let config = ChannelConfig::builder()
            .segment_size(256)
            .segment_count(4)
            .max_nesting(2)
            .build();
        let buffer =
            TraceBuffer::new(0, &config, Arc::new(ManualClock::new(1_000)), Arc::new(Hooks));

        let outer = buffer.reserve(4).unwrap();
        let inner = buffer.reserve(4).unwrap();
        assert_eq!(
            buffer.reserve(4).unwrap_err(),
            ChannelError::NestingLimitExceeded { limit: 2 }
        );
        assert_eq!(buffer.stats().events_lost, 1);

        inner.commit();
        // depth dropped back under the limit
        buffer.reserve(4).unwrap().commit();
        outer.commit();
    }

    #[test]
    fn test_uncommitted_reservation_reclaimed_as_corrupted() {
        let buffer = test_buffer(256, 2, true);

        // reserve and abandon: segment 0 stays 18 bytes short
        drop(buffer.reserve(10).unwrap());

        buffer.reserve(150).unwrap().commit();
        buffer.reserve(150).unwrap().commit(); // switches to segment 1
        assert_eq!(buffer.stats().corrupted_segments, 0);

        // laps back onto segment 0: reader pushed, counter repaired
        buffer.reserve(150).unwrap().commit();
        assert_eq!(buffer.stats().corrupted_segments, 1);
        assert_eq!(buffer.consumed(), 256);
        assert_eq!(buffer.stats().events_lost, 0);
        assert!(buffer.take_wakeup());
    }

    #[test]
    fn test_force_switch_flush() {
        let buffer = test_buffer(256, 2, false);

        buffer.force_switch(SwitchMode::Flush);
        assert_eq!(buffer.write_offset(), 256);
        assert!(buffer.take_wakeup());

        // parked on the boundary: a second flush is a no-op
        buffer.force_switch(SwitchMode::Flush);
        assert_eq!(buffer.write_offset(), 256);

        // the record-free segment is still consumable
        let (claim, index) = buffer.reader_acquire().unwrap();
        let mut copy = Vec::new();
        buffer.copy_segment(index, &mut copy);
        let view = SegmentView::parse(&copy).unwrap();
        assert_eq!(view.header().lost_size, 256 - 40);
        assert_eq!(view.records().count(), 0);
        buffer.reader_release(claim).unwrap();

        // next reservation reopens the buffer
        buffer.reserve(10).unwrap().commit();
        assert_eq!(buffer.write_offset(), 256 + 40 + 12 + 10);
    }

    #[test]
    fn test_force_switch_active_reopens() {
        let buffer = test_buffer(256, 2, false);
        buffer.reserve(10).unwrap().commit();

        buffer.force_switch(SwitchMode::Active);
        assert_eq!(buffer.write_offset(), 256 + 40);
        assert_eq!(buffer.segment_commit_count(0), 256);
        assert_eq!(buffer.segment_commit_count(1), 40);
        assert!(buffer.take_wakeup());

        // writes continue in the fresh segment without another switch
        buffer.reserve(5).unwrap().commit();
        assert_eq!(buffer.write_offset(), 256 + 40 + 8 + 5);
    }

    #[test]
    fn test_flush_switch_leaves_reader_in_place() {
        let buffer = test_buffer(256, 2, true);
        for _ in 0..20 {
            buffer.reserve(64).unwrap().commit();
        }
        assert!(buffer.write_offset() % 256 != 0, "setup must end mid-segment");
        assert!(buffer.consumed() > 0, "the lapped ring must have pushed");

        // a flush only parks the buffer; it claims no new segment, so the
        // reader stays where it is
        let consumed_before = buffer.consumed();
        buffer.force_switch(SwitchMode::Flush);
        assert_eq!(buffer.consumed(), consumed_before);

        // an active switch claims the next segment immediately and has to
        // push the reader off it
        buffer.reserve(64).unwrap().commit();
        buffer.reserve(64).unwrap().commit();
        let consumed_mid = buffer.consumed();
        buffer.force_switch(SwitchMode::Active);
        assert_eq!(buffer.consumed(), consumed_mid + 256);

        // flushing the reopened segment still leaves the reader alone
        buffer.force_switch(SwitchMode::Flush);
        assert_eq!(buffer.consumed(), consumed_mid + 256);
    }

    #[test]
    fn test_wide_header_after_compact_window() {
        let config = ChannelConfig::builder()
            .segment_size(256)
            .segment_count(4)
            .compact_window(100)
            .build();
        let clock = Arc::new(ManualClock::new(1_000));
        let buffer = TraceBuffer::new(0, &config, clock.clone(), Arc::new(Hooks));

        buffer.reserve(4).unwrap().commit(); // narrow at 40
        clock.advance(150);
        buffer.reserve(4).unwrap().commit(); // wide at 52: window exceeded
        clock.advance(50);
        buffer.reserve(4).unwrap().commit(); // narrow at 68: base refreshed

        assert_eq!(buffer.arena.read(0, 40, 1)[0] & 1, 0);
        assert_eq!(buffer.arena.read(0, 52, 1)[0] & 1, 1);
        assert_eq!(buffer.arena.read(0, 68, 1)[0] & 1, 0);
        assert_eq!(buffer.write_offset(), 40 + 12 + 16 + 12);
    }

    #[test]
    fn test_hooks_fire_on_switches() {
        #[derive(Default)]
        struct Counting {
            opened: AtomicUsize,
            closed: AtomicUsize,
        }

        impl SegmentHooks for Counting {
            fn segment_opened(&self, _buffer: &TraceBuffer, _timestamp: u64, _segment: usize) {
                self.opened.fetch_add(1, Ordering::Relaxed);
            }

            fn segment_closed(
                &self,
                _buffer: &TraceBuffer,
                _timestamp: u64,
                _end_offset: u64,
                _segment: usize,
            ) {
                self.closed.fetch_add(1, Ordering::Relaxed);
            }
        }

        let config = ChannelConfig::builder()
            .segment_size(256)
            .segment_count(2)
            .overwrite(true)
            .build();
        let hooks = Arc::new(Counting::default());
        let buffer = TraceBuffer::new(
            0,
            &config,
            Arc::new(ManualClock::new(1_000)),
            hooks.clone(),
        );
        assert_eq!(hooks.opened.load(Ordering::Relaxed), 1);

        buffer.reserve(200).unwrap().commit();
        buffer.force_switch(SwitchMode::Active);
        buffer.force_switch(SwitchMode::Flush);
        buffer.reserve(10).unwrap().commit();

        assert_eq!(hooks.opened.load(Ordering::Relaxed), 3);
        assert_eq!(hooks.closed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_hooks_receive_transition_offsets() {
        #[derive(Default)]
        struct Recording {
            opened: Mutex<Vec<(u64, usize)>>,
            closed: Mutex<Vec<(u64, u64, usize)>>,
        }

        impl SegmentHooks for Recording {
            fn segment_opened(&self, _buffer: &TraceBuffer, timestamp: u64, segment: usize) {
                self.opened.lock().push((timestamp, segment));
            }

            fn segment_closed(
                &self,
                _buffer: &TraceBuffer,
                timestamp: u64,
                end_offset: u64,
                segment: usize,
            ) {
                self.closed.lock().push((timestamp, end_offset, segment));
            }
        }

        let config = ChannelConfig::builder()
            .segment_size(256)
            .segment_count(4)
            .build();
        let clock = Arc::new(ManualClock::new(1_000));
        let hooks = Arc::new(Recording::default());
        let buffer = TraceBuffer::new(0, &config, clock.clone(), hooks.clone());

        buffer.reserve(150).unwrap().commit(); // fills segment 0 up to offset 198
        clock.advance(10);
        buffer.reserve(150).unwrap().commit(); // does not fit: closes 0, opens 1
        clock.advance(5);
        buffer.reserve(46).unwrap().commit(); // lands exactly on the boundary

        assert_eq!(*hooks.opened.lock(), vec![(1_000, 0), (1_010, 1)]);
        // close offsets are stream positions: segment 0's data ends at 198
        // (58 bytes of padding follow), segment 1 closes exactly at 512
        assert_eq!(*hooks.closed.lock(), vec![(1_010, 198, 0), (1_015, 512, 1)]);
    }

    #[test]
    fn test_blocking_reserve_times_out() {
        let buffer = test_buffer(256, 2, false);
        buffer.reserve(200).unwrap().commit();
        buffer.reserve(200).unwrap().commit();

        let err = buffer
            .reserve_blocking_timeout(200, Duration::from_millis(30))
            .unwrap_err();
        assert_eq!(err, ChannelError::Timeout);
        assert_eq!(buffer.stats().events_lost, 1);
    }

    #[test]
    fn test_blocking_reserve_wakes_on_consume() {
        let buffer = Arc::new(test_buffer(256, 2, false));
        buffer.reserve(200).unwrap().commit();
        buffer.reserve(200).unwrap().commit();

        let reader = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                let (claim, _index) = buffer.reader_acquire().unwrap();
                buffer.reader_release(claim).unwrap();
            })
        };

        buffer.reserve_blocking(200).unwrap().commit();
        reader.join().unwrap();
        assert_eq!(buffer.stats().events_lost, 0);
    }

    #[test]
    fn test_finalize_wakes_blocked_writer() {
        let buffer = Arc::new(test_buffer(256, 2, false));
        buffer.reserve(200).unwrap().commit();
        buffer.reserve(200).unwrap().commit();

        let finisher = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                buffer.finalize();
            })
        };

        // woken by finalize, and the buffer is still full
        let err = buffer.reserve_blocking(200).unwrap_err();
        assert_eq!(err, ChannelError::Full);
        finisher.join().unwrap();
        assert!(buffer.is_finalized());
        assert_eq!(buffer.stats().events_lost, 1);
    }

    #[test]
    fn test_reader_conflicts() {
        let buffer = test_buffer(256, 2, false);
        buffer.force_switch(SwitchMode::Flush);

        let (claim, _index) = buffer.reader_acquire().unwrap();
        assert_eq!(buffer.reader_acquire().unwrap_err(), ChannelError::AlreadyActive);
        buffer.reader_release(claim).unwrap();

        // everything consumed again
        assert_eq!(buffer.reader_acquire().unwrap_err(), ChannelError::WouldBlock);
    }
}
