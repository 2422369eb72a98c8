//! Property-based tests for segment encoding
//!
//! Random segments must survive encode/decode with a valid checksum, any
//! single corrupted byte must be rejected, and packetizing must preserve the
//! byte stream and sequence continuity.

use bytes::Bytes;
use proptest::prelude::*;
use rxp_protocol::codec::{self, compute_checksum, validate_checksum};
use rxp_protocol::{Flags, Segment, SegmentError, SeqNumber};

fn flags_strategy() -> impl Strategy<Value = Flags> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(yo, cya, ack)| Flags { yo, cya, ack })
}

fn segment_strategy() -> impl Strategy<Value = Segment> {
    (
        any::<u16>(),
        any::<u16>(),
        any::<u32>(),
        any::<u32>(),
        any::<u16>(),
        flags_strategy(),
        prop::collection::vec(any::<u8>(), 0..=2048),
    )
        .prop_map(|(src, dst, seq, ack, window, flags, payload)| {
            let mut segment = Segment::new(src, dst, SeqNumber::new(seq), Bytes::from(payload));
            segment.header.ack = SeqNumber::new(ack);
            segment.header.window = window;
            segment.header.flags = flags;
            segment
        })
}

proptest! {
    #[test]
    fn prop_checksum_roundtrip(segment in segment_strategy()) {
        let segment = compute_checksum(segment);
        prop_assert!(validate_checksum(&segment));

        let bytes = codec::encode(&segment).unwrap();
        let decoded = codec::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, segment);
    }

    #[test]
    fn prop_single_byte_corruption_detected(
        segment in segment_strategy(),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let segment = compute_checksum(segment);
        let mut bytes = codec::encode(&segment).unwrap().to_vec();
        let i = index.index(bytes.len());
        bytes[i] ^= flip;

        prop_assert!(codec::decode(&bytes).is_err());
    }

    #[test]
    fn prop_packetize_roundtrip(
        data in prop::collection::vec(any::<u8>(), 1..8192),
        mss in 1usize..=1500,
        start in any::<u32>(),
    ) {
        let segments = codec::packetize(1000, 2000, SeqNumber::new(start), &data, mss);

        let mut joined = Vec::with_capacity(data.len());
        let mut expected_seq = SeqNumber::new(start);
        for segment in &segments {
            prop_assert_eq!(segment.seq(), expected_seq);
            prop_assert!(segment.payload.len() <= mss);
            prop_assert!(validate_checksum(segment));
            joined.extend_from_slice(&segment.payload);
            expected_seq = segment.seq() + segment.payload.len() as u32;
        }

        prop_assert_eq!(joined, data);
    }
}

#[test]
fn test_truncated_datagram_rejected() {
    let segment = codec::packetize(1, 2, SeqNumber::new(9), b"hello", 1024).remove(0);
    let bytes = codec::encode(&segment).unwrap();

    assert!(matches!(
        codec::decode(&bytes[..10]),
        Err(SegmentError::InsufficientData { .. })
    ));
}

#[test]
fn test_control_segments_consume_sequence_space() {
    let yo = codec::control_segment(1, 2, SeqNumber::new(u32::MAX), SeqNumber::new(0), true, false, false);
    assert_eq!(yo.seq_len(), 1);
    assert_eq!(yo.end_seq(), SeqNumber::new(0));

    let ack = codec::control_segment(1, 2, SeqNumber::new(5), SeqNumber::new(77), false, false, true);
    assert_eq!(ack.seq_len(), 0);
    assert_eq!(ack.ack_num(), SeqNumber::new(77));
    assert!(validate_checksum(&ack));
}
