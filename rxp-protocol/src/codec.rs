//! Segment codec
//!
//! Splits application data into segments, builds control segments and
//! computes/validates the 16-bit one's-complement checksum that covers the
//! whole encoded segment.

use crate::segment::{Flags, Segment, SegmentError, CHECKSUM_OFFSET, HEADER_SIZE, MAX_SEGMENT_PAYLOAD};
use crate::sequence::SeqNumber;
use bytes::Bytes;

/// Split `data` into segments of at most `mss` payload bytes
///
/// Segment `i + 1` starts at segment `i`'s sequence number plus its payload
/// length. Empty input yields a single empty segment. `mss` is clamped to
/// what one datagram can carry.
pub fn packetize(src_port: u16, dst_port: u16, seq_num: SeqNumber, data: &[u8], mss: usize) -> Vec<Segment> {
    let mss = mss.clamp(1, MAX_SEGMENT_PAYLOAD);
    if data.is_empty() {
        return vec![compute_checksum(Segment::new(src_port, dst_port, seq_num, Bytes::new()))];
    }

    let mut seq = seq_num;
    data.chunks(mss)
        .map(|chunk| {
            let segment = Segment::new(src_port, dst_port, seq, Bytes::copy_from_slice(chunk));
            seq += chunk.len() as u32;
            compute_checksum(segment)
        })
        .collect()
}

/// Build a payload-less segment carrying the requested flags
pub fn control_segment(
    src_port: u16,
    dst_port: u16,
    seq_num: SeqNumber,
    ack_num: SeqNumber,
    yo: bool,
    cya: bool,
    ack: bool,
) -> Segment {
    let mut segment = Segment::new(src_port, dst_port, seq_num, Bytes::new());
    segment.header.flags = Flags { yo, cya, ack };
    if ack {
        segment.header.ack = ack_num;
    }
    compute_checksum(segment)
}

/// Store a freshly computed checksum in the segment
pub fn compute_checksum(mut segment: Segment) -> Segment {
    segment.header.checksum = 0;
    let checksum = internet_checksum(&segment.to_bytes());
    segment.header.checksum = checksum;
    segment
}

/// Recompute the checksum with the checksum field zeroed and compare
pub fn validate_checksum(segment: &Segment) -> bool {
    let mut bytes = segment.to_bytes();
    bytes[CHECKSUM_OFFSET] = 0;
    bytes[CHECKSUM_OFFSET + 1] = 0;
    internet_checksum(&bytes) == segment.header.checksum
}

/// Decode a received datagram into a segment
///
/// The checksum is verified over the raw bytes before any other field is
/// interpreted.
pub fn decode(bytes: &[u8]) -> Result<Segment, SegmentError> {
    if bytes.len() < HEADER_SIZE {
        return Err(SegmentError::InsufficientData {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }

    let carried = u16::from_be_bytes([bytes[CHECKSUM_OFFSET], bytes[CHECKSUM_OFFSET + 1]]);
    let mut zeroed = bytes.to_vec();
    zeroed[CHECKSUM_OFFSET] = 0;
    zeroed[CHECKSUM_OFFSET + 1] = 0;
    let computed = internet_checksum(&zeroed);
    if computed != carried {
        return Err(SegmentError::ChecksumMismatch { carried, computed });
    }

    Segment::from_bytes(bytes)
}

/// Encode a segment for transmission
pub fn encode(segment: &Segment) -> Result<Bytes, SegmentError> {
    if segment.payload.len() > MAX_SEGMENT_PAYLOAD {
        return Err(SegmentError::PayloadTooLarge {
            size: segment.payload.len(),
            max: MAX_SEGMENT_PAYLOAD,
        });
    }
    Ok(segment.to_bytes().freeze())
}

/// 16-bit one's-complement sum with end-around carry, complemented
///
/// A trailing odd byte is padded with zero.
pub fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut words = bytes.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}
