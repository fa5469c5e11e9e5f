//! Segment planning: split a requested byte range into response-sized pieces.

use crate::protocol::SEGMENT_CAPACITY;

/// One slice of a requested range, carried by a single RESPONSE packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Segment {
    pub offset: u64,
    pub len: usize,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }
}

/// Number of segments needed for `length` bytes: `ceil(length / capacity)`.
pub fn segment_count(length: u64, capacity: usize) -> usize {
    let capacity = effective_capacity(capacity) as u64;
    length.div_ceil(capacity) as usize
}

/// Split `[offset, offset + length)` into consecutive segments of at most
/// `capacity` bytes, in increasing offset order. Zero capacity means
/// [`SEGMENT_CAPACITY`].
pub fn split_into_segments(offset: u64, length: u64, capacity: usize) -> Vec<Segment> {
    let size = effective_capacity(capacity) as u64;
    let end = offset + length;
    let mut out = Vec::with_capacity(segment_count(length, capacity));
    let mut start = offset;
    while start < end {
        let stop = (start + size).min(end);
        out.push(Segment {
            offset: start,
            len: (stop - start) as usize,
        });
        start = stop;
    }
    out
}

fn effective_capacity(capacity: usize) -> usize {
    if capacity == 0 {
        SEGMENT_CAPACITY
    } else {
        capacity
    }
}
