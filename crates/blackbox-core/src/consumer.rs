//! Consumer-side segment claims.
//!
//! The consumer never parses shared memory in place. It claims the oldest
//! complete segment, copies the whole segment out, and only then consumes
//! the claim; if writers reclaimed the segment during the copy, the
//! release fails and the copy is discarded. Decoding always happens on a
//! validated private copy, so racy bytes are never interpreted.

use crate::buffer::TraceBuffer;
use crate::error::ChannelError;

impl TraceBuffer {
    /// Claims the oldest fully committed segment for reading.
    ///
    /// At most one claim may be live per buffer.
    ///
    /// # Errors
    ///
    /// [`ChannelError::WouldBlock`] when no complete unread segment is
    /// available, [`ChannelError::AlreadyActive`] when another claim is
    /// still live.
    pub fn read_segment(&self) -> crate::Result<SegmentGuard<'_>> {
        let (claim, index) = self.reader_acquire()?;
        Ok(SegmentGuard {
            buffer: self,
            claim,
            index,
            released: false,
        })
    }

    /// Claims, copies, and consumes the oldest complete segment in one
    /// call, retrying the copy when a writer invalidates it.
    ///
    /// On success `out` holds exactly one segment, ready for
    /// [`SegmentView::parse`](crate::header::SegmentView::parse).
    ///
    /// # Errors
    ///
    /// Same as [`read_segment`](Self::read_segment); `StaleRead` is
    /// handled internally.
    pub fn consume_segment(&self, out: &mut Vec<u8>) -> crate::Result<()> {
        loop {
            let guard = self.read_segment()?;
            guard.copy_into(out);
            match guard.release() {
                Ok(()) => return Ok(()),
                Err(ChannelError::StaleRead) => {}
                Err(err) => return Err(err),
            }
        }
    }
}

/// Exclusive read claim on one buffer's oldest complete segment.
///
/// The guard does not borrow the segment bytes. Copy them out with
/// [`copy_into`](Self::copy_into), then call [`release`](Self::release):
/// a successful release validates the copy, a `StaleRead` means writers
/// reclaimed the segment mid-copy and the bytes must be discarded.
/// Dropping the guard without releasing leaves the segment unconsumed, so
/// the next claim returns it again.
#[derive(Debug)]
pub struct SegmentGuard<'a> {
    buffer: &'a TraceBuffer,
    claim: u64,
    index: usize,
    released: bool,
}

impl SegmentGuard<'_> {
    /// Index of the claimed segment.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Copies the claimed segment into `out`, replacing its contents.
    ///
    /// The copy is unvalidated until [`release`](Self::release) succeeds.
    pub fn copy_into(&self, out: &mut Vec<u8>) {
        self.buffer.copy_segment(self.index, out);
    }

    /// Consumes the segment, advancing the buffer past it and waking
    /// writers blocked on space.
    ///
    /// # Errors
    ///
    /// [`ChannelError::StaleRead`] when writers pushed past the claim
    /// while it was held; bytes copied under this claim are torn.
    pub fn release(mut self) -> crate::Result<()> {
        self.released = true;
        self.buffer.reader_release(self.claim)
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.buffer.reader_abandon();
        }
    }
}
