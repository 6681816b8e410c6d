//! On-wire layout of segments and records.
//!
//! Every segment starts with a fixed 40-byte header. The open fields are
//! written when a producer opens the segment; the close fields are patched
//! in place when the generation is closed. A physical end-of-segment
//! trailer would not work: a record may end exactly on the boundary with
//! zero padding, so close metadata has to live at a fixed position.
//!
//! ```text
//!  0       4       8               16              24      28      32              40
//!  +-------+-------+---------------+---------------+-------+-------+---------------+
//!  | magic | size  | begin_tsc     | clock_freq_hz | lost  | rsvd  | end_tsc       |
//!  +-------+-------+---------------+---------------+-------+-------+---------------+
//!  |<-- written at open -------------------------->|<-- patched at close --------->|
//! ```
//!
//! Records follow back to back, each led by a narrow (8-byte) or wide
//! (12-byte) header. Bit 0 of the leading word selects the width; the rest
//! is the payload length. A narrow header carries only the low 32 bits of
//! the timestamp and is resolved against the last full timestamp seen in
//! the segment; a wide header carries the full value and resets that base.
//! All fields are little-endian.

use crate::error::ChannelError;

/// Marker at offset 0 of every segment ("BBX1").
pub const SEGMENT_MAGIC: u32 = u32::from_le_bytes(*b"BBX1");

/// Encoded segment header length.
pub const SEGMENT_HEADER_LEN: usize = 40;

/// `lost_size` value carried by a segment that was never closed.
pub const LOST_SIZE_OPEN: u32 = u32::MAX;

/// Encoded length of a narrow record header.
pub const RECORD_HEADER_NARROW_LEN: usize = 8;

/// Encoded length of a wide record header.
pub const RECORD_HEADER_WIDE_LEN: usize = 12;

/// Byte offset of the close fields inside the segment header.
pub(crate) const CLOSE_FIELDS_OFFSET: usize = 24;

/// Fixed-size block at the start of every segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Format marker, always [`SEGMENT_MAGIC`].
    pub magic: u32,
    /// Segment size echoed for readers that only have the bytes.
    pub segment_size: u32,
    /// Timestamp at which the segment was opened.
    pub begin_timestamp: u64,
    /// Clock tick rate, for converting timestamps to wall time.
    pub clock_freq_hz: u64,
    /// Unused tail bytes of the closed segment; [`LOST_SIZE_OPEN`] while
    /// the segment is still open.
    pub lost_size: u32,
    /// Timestamp at which the segment was closed; zero while open.
    pub end_timestamp: u64,
}

impl SegmentHeader {
    /// Header for a freshly opened segment.
    #[must_use]
    pub fn open(segment_size: u32, begin_timestamp: u64, clock_freq_hz: u64) -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            segment_size,
            begin_timestamp,
            clock_freq_hz,
            lost_size: LOST_SIZE_OPEN,
            end_timestamp: 0,
        }
    }

    /// `true` once the close fields have been patched.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lost_size != LOST_SIZE_OPEN
    }

    /// First byte past the last record, valid only for closed segments.
    #[must_use]
    pub fn data_end(&self) -> usize {
        self.segment_size as usize - self.lost_size as usize
    }

    /// Serializes the header.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut out = [0u8; SEGMENT_HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.segment_size.to_le_bytes());
        out[8..16].copy_from_slice(&self.begin_timestamp.to_le_bytes());
        out[16..24].copy_from_slice(&self.clock_freq_hz.to_le_bytes());
        out[24..28].copy_from_slice(&self.lost_size.to_le_bytes());
        // 28..32 reserved
        out[32..40].copy_from_slice(&self.end_timestamp.to_le_bytes());
        out
    }

    /// Parses a header, returning `None` when the input is too short or
    /// the magic does not match.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < SEGMENT_HEADER_LEN {
            return None;
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().ok()?);
        if magic != SEGMENT_MAGIC {
            return None;
        }
        Some(Self {
            magic,
            segment_size: u32::from_le_bytes(data[4..8].try_into().ok()?),
            begin_timestamp: u64::from_le_bytes(data[8..16].try_into().ok()?),
            clock_freq_hz: u64::from_le_bytes(data[16..24].try_into().ok()?),
            lost_size: u32::from_le_bytes(data[24..28].try_into().ok()?),
            end_timestamp: u64::from_le_bytes(data[32..40].try_into().ok()?),
        })
    }
}

/// Serialized close fields, written over bytes
/// `CLOSE_FIELDS_OFFSET..SEGMENT_HEADER_LEN` of the segment header.
pub(crate) fn encode_close_fields(lost_size: u32, end_timestamp: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..4].copy_from_slice(&lost_size.to_le_bytes());
    // 4..8 reserved
    out[8..16].copy_from_slice(&end_timestamp.to_le_bytes());
    out
}

/// Record header: narrow (low timestamp bits) or wide (full timestamp).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordHeader {
    /// 8 bytes; timestamp resolved against the segment's running base.
    Narrow {
        /// Payload length in bytes.
        payload_len: u32,
        /// Low 32 bits of the record timestamp.
        tsc_low: u32,
    },
    /// 12 bytes; carries the full timestamp and resets the base.
    Wide {
        /// Payload length in bytes.
        payload_len: u32,
        /// Full record timestamp.
        timestamp: u64,
    },
}

impl RecordHeader {
    /// Encoded length of this header.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Narrow { .. } => RECORD_HEADER_NARROW_LEN,
            Self::Wide { .. } => RECORD_HEADER_WIDE_LEN,
        }
    }

    /// Payload length the header announces.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Narrow { payload_len, .. } | Self::Wide { payload_len, .. } => {
                *payload_len as usize
            }
        }
    }

    /// Serializes the header into `out`, returning the encoded length.
    ///
    /// # Panics
    ///
    /// Panics if `out` is shorter than the encoded length.
    pub(crate) fn encode_into(&self, out: &mut [u8]) -> usize {
        match *self {
            Self::Narrow {
                payload_len,
                tsc_low,
            } => {
                out[0..4].copy_from_slice(&(payload_len << 1).to_le_bytes());
                out[4..8].copy_from_slice(&tsc_low.to_le_bytes());
                RECORD_HEADER_NARROW_LEN
            }
            Self::Wide {
                payload_len,
                timestamp,
            } => {
                out[0..4].copy_from_slice(&(payload_len << 1 | 1).to_le_bytes());
                out[4..12].copy_from_slice(&timestamp.to_le_bytes());
                RECORD_HEADER_WIDE_LEN
            }
        }
    }

    /// Parses a record header, returning the header and its encoded
    /// length, or `None` when the input is too short.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < 4 {
            return None;
        }
        let len_word = u32::from_le_bytes(data[0..4].try_into().ok()?);
        let payload_len = len_word >> 1;
        if len_word & 1 == 0 {
            if data.len() < RECORD_HEADER_NARROW_LEN {
                return None;
            }
            let tsc_low = u32::from_le_bytes(data[4..8].try_into().ok()?);
            Some((
                Self::Narrow {
                    payload_len,
                    tsc_low,
                },
                RECORD_HEADER_NARROW_LEN,
            ))
        } else {
            if data.len() < RECORD_HEADER_WIDE_LEN {
                return None;
            }
            let timestamp = u64::from_le_bytes(data[4..12].try_into().ok()?);
            Some((
                Self::Wide {
                    payload_len,
                    timestamp,
                },
                RECORD_HEADER_WIDE_LEN,
            ))
        }
    }
}

/// Encoded record header length for the chosen width.
#[inline]
pub(crate) fn record_header_len(wide: bool) -> usize {
    if wide {
        RECORD_HEADER_WIDE_LEN
    } else {
        RECORD_HEADER_NARROW_LEN
    }
}

/// Resolves a narrow header's low word against the running base timestamp.
///
/// Serial-number arithmetic: a low word that jumped backward by more than
/// half the 32-bit space is a rollover into the next epoch; anything
/// smaller is a cross-producer inversion and keeps the base's high word.
/// Exact as long as writers keep narrow records within 2^31 ticks of the
/// last full timestamp, which the config guarantees.
#[must_use]
pub fn resolve_narrow_timestamp(base: u64, tsc_low: u32) -> u64 {
    let candidate = (base & !0xFFFF_FFFF) | u64::from(tsc_low);
    #[allow(clippy::cast_possible_truncation)]
    let base_low = base as u32;
    if tsc_low < base_low && base_low - tsc_low > u32::MAX / 2 {
        candidate + (1 << 32)
    } else {
        candidate
    }
}

/// One decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    /// Resolved record timestamp.
    pub timestamp: u64,
    /// Payload bytes.
    pub payload: &'a [u8],
}

/// Decoded view over the bytes of one drained segment.
///
/// Works on the copy produced by a segment guard; only closed segments
/// parse successfully.
#[derive(Debug)]
pub struct SegmentView<'a> {
    header: SegmentHeader,
    bytes: &'a [u8],
}

impl<'a> SegmentView<'a> {
    /// Parses segment bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Decode`] when the bytes are truncated, the
    /// magic is wrong, the segment was never closed, or the close fields
    /// are inconsistent with the geometry.
    pub fn parse(bytes: &'a [u8]) -> crate::Result<Self> {
        let header = SegmentHeader::from_bytes(bytes).ok_or(ChannelError::Decode {
            reason: "shorter than a segment header or bad magic",
        })?;
        if header.segment_size as usize != bytes.len() {
            return Err(ChannelError::Decode {
                reason: "segment length does not match header",
            });
        }
        if !header.is_closed() {
            return Err(ChannelError::Decode {
                reason: "segment was never closed",
            });
        }
        if header.lost_size as usize > bytes.len() - SEGMENT_HEADER_LEN {
            return Err(ChannelError::Decode {
                reason: "lost size larger than segment body",
            });
        }
        Ok(Self { header, bytes })
    }

    /// The parsed segment header.
    #[must_use]
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Iterates the records between the header and the padding.
    #[must_use]
    pub fn records(&self) -> RecordIter<'a> {
        RecordIter {
            bytes: self.bytes,
            pos: SEGMENT_HEADER_LEN,
            end: self.header.data_end(),
            base: self.header.begin_timestamp,
        }
    }
}

/// Iterator over the records of a closed segment.
///
/// Yields an `Err` item and stops if the byte stream is malformed.
#[derive(Debug)]
pub struct RecordIter<'a> {
    bytes: &'a [u8],
    pos: usize,
    end: usize,
    base: u64,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = crate::Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let Some((header, header_len)) = RecordHeader::decode(&self.bytes[self.pos..self.end])
        else {
            self.pos = self.end;
            return Some(Err(ChannelError::Decode {
                reason: "truncated record header",
            }));
        };
        let start = self.pos + header_len;
        let payload_len = header.payload_len();
        if start + payload_len > self.end {
            self.pos = self.end;
            return Some(Err(ChannelError::Decode {
                reason: "record payload overruns data end",
            }));
        }
        let timestamp = match header {
            RecordHeader::Wide { timestamp, .. } => {
                self.base = timestamp;
                timestamp
            }
            RecordHeader::Narrow { tsc_low, .. } => resolve_narrow_timestamp(self.base, tsc_low),
        };
        self.pos = start + payload_len;
        Some(Ok(Record {
            timestamp,
            payload: &self.bytes[start..start + payload_len],
        }))
    }
}
