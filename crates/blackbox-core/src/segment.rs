//! Segment memory: the per-buffer byte arena, power-of-two offset
//! arithmetic, and cache-line padding for the hot atomics.
//!
//! Logical offsets are u64 values that only ever grow; every physical
//! address is derived by masking. All arena access goes through
//! `(segment index, offset)` pairs validated against the geometry; no raw
//! pointers escape this module.

use std::cell::UnsafeCell;

/// Pads and aligns a value to a 64-byte cache line to prevent false
/// sharing between adjacent atomics.
///
/// The write offset, consumed offset, and each per-segment commit counter
/// are updated by different threads at high rates; sharing a line between
/// any two of them serializes the producers on cache-coherency traffic.
#[repr(C, align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Creates a new cache-padded value.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Default> Default for CachePadded<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePadded")
            .field("value", &self.value)
            .finish()
    }
}

/// Power-of-two segment geometry for one buffer.
///
/// Mirrors the index/offset/align/trunc operations used throughout the
/// reservation and consumer paths, all reduced to masks.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    segment_size: u64,
    buffer_size: u64,
}

impl Geometry {
    pub(crate) fn new(segment_size: usize, segment_count: usize) -> Self {
        debug_assert!(segment_size.is_power_of_two());
        debug_assert!(segment_count.is_power_of_two());
        Self {
            segment_size: segment_size as u64,
            buffer_size: (segment_size * segment_count) as u64,
        }
    }

    #[inline]
    pub(crate) fn segment_size(&self) -> u64 {
        self.segment_size
    }

    #[inline]
    pub(crate) fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn segment_count(&self) -> usize {
        (self.buffer_size / self.segment_size) as usize
    }

    /// Segment index holding the byte at `offset`.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn index(&self, offset: u64) -> usize {
        ((offset & (self.buffer_size - 1)) / self.segment_size) as usize
    }

    /// Position of `offset` inside its segment.
    #[inline]
    pub(crate) fn offset_in_segment(&self, offset: u64) -> u64 {
        offset & (self.segment_size - 1)
    }

    /// Next segment boundary strictly greater than `offset`.
    #[inline]
    pub(crate) fn align_up_next(&self, offset: u64) -> u64 {
        (offset + self.segment_size) & !(self.segment_size - 1)
    }

    /// `offset` truncated down to its segment boundary.
    #[inline]
    pub(crate) fn trunc(&self, offset: u64) -> u64 {
        offset & !(self.segment_size - 1)
    }
}

/// Raw storage for one buffer: `segment_count` fixed segments written
/// concurrently through the reservation protocol and copied out whole by
/// the consumer.
pub(crate) struct SegmentArena {
    bytes: Box<[UnsafeCell<u8>]>,
    segment_size: usize,
}

// SAFETY: concurrent access is governed by the reservation protocol.
// Writers own disjoint reserved ranges; the consumer copies a segment out
// and then validates its claim. In overwrite mode a copy may race a writer
// that pushed past the reader; the stale-claim check makes the consumer
// discard such bytes, so racy data is never interpreted.
#[allow(unsafe_code)]
unsafe impl Send for SegmentArena {}

#[allow(unsafe_code)]
unsafe impl Sync for SegmentArena {}

impl SegmentArena {
    pub(crate) fn new(segment_size: usize, segment_count: usize) -> Self {
        let bytes: Box<[UnsafeCell<u8>]> = (0..segment_size * segment_count)
            .map(|_| UnsafeCell::new(0u8))
            .collect();
        Self {
            bytes,
            segment_size,
        }
    }

    /// Writes `data` at `offset` inside `segment`.
    ///
    /// # Panics
    ///
    /// Panics if the range leaves the segment; reservation arithmetic never
    /// produces a record that crosses a boundary.
    pub(crate) fn write(&self, segment: usize, offset: usize, data: &[u8]) {
        assert!(
            offset + data.len() <= self.segment_size,
            "write crosses segment boundary"
        );
        let base = segment * self.segment_size + offset;
        assert!(base + data.len() <= self.bytes.len(), "segment out of range");
        // SAFETY: range checked above; overlap with other writers is
        // excluded by exclusive [begin, end) ownership after the
        // reservation CAS.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.bytes[base].get(), data.len());
        }
    }

    /// Copies one whole segment into `dst`, replacing its contents.
    ///
    /// The copy may race an overwrite-mode writer; callers must validate
    /// their claim afterwards and discard the bytes on a stale read.
    pub(crate) fn copy_segment_into(&self, segment: usize, dst: &mut Vec<u8>) {
        let base = segment * self.segment_size;
        assert!(base + self.segment_size <= self.bytes.len(), "segment out of range");
        dst.clear();
        dst.resize(self.segment_size, 0);
        // SAFETY: source range is one whole in-bounds segment; dst was just
        // resized to segment_size.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.bytes[base].get().cast_const(),
                dst.as_mut_ptr(),
                self.segment_size,
            );
        }
    }

    /// Reads `len` bytes at `offset` inside `segment`. Test support for
    /// inspecting written slots without a consumer claim.
    #[cfg(test)]
    pub(crate) fn read(&self, segment: usize, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.segment_size);
        let base = segment * self.segment_size + offset;
        let mut out = vec![0u8; len];
        // SAFETY: range checked above.
        #[allow(unsafe_code)]
        unsafe {
            std::ptr::copy_nonoverlapping(self.bytes[base].get().cast_const(), out.as_mut_ptr(), len);
        }
        out
    }
}
