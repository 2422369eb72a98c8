//! Send and receive buffers
//!
//! The send buffer holds every outbound segment until the peer acknowledges
//! it; the receive buffer holds in-order bytes until the application reads
//! them. Neither buffer reorders: the receive side accepts only the exact
//! next expected sequence number.

use crate::codec::{self, compute_checksum};
use crate::segment::{Flags, Segment, MAX_SEGMENT_PAYLOAD};
use crate::sequence::SeqNumber;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Buffer errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer is full")]
    Full,
}

/// Stored segment with transmission metadata
#[derive(Clone)]
struct StoredSegment {
    segment: Segment,
    /// Time of the first transmission
    first_sent: Option<Instant>,
    /// Number of times this segment has been handed out for sending
    send_count: u32,
    /// Waiting to be (re)sent by the next flush
    pending: bool,
}

/// Result of processing a cumulative acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckOutcome {
    /// Number of segments discarded
    pub acked_segments: usize,
    /// Payload bytes discarded
    pub acked_bytes: usize,
    /// Round-trip sample from a segment that was sent exactly once
    pub rtt_sample: Option<Duration>,
}

impl AckOutcome {
    /// True if the acknowledgment covered new data
    pub fn is_new(&self) -> bool {
        self.acked_segments > 0
    }
}

/// Outbound segment queue for one connection
pub struct SendBuffer {
    segments: VecDeque<StoredSegment>,
    /// Maximum number of queued segments
    capacity: usize,
    mss: usize,
    src_port: u16,
    dst_port: u16,
    /// Next sequence number to assign
    next_seq: SeqNumber,
    /// Highest cumulative acknowledgment observed
    last_ack: SeqNumber,
    retransmissions: u64,
}

impl SendBuffer {
    /// Create a send buffer whose first segment will carry `base_seq`
    pub fn new(src_port: u16, dst_port: u16, base_seq: SeqNumber, capacity: usize, mss: usize) -> Self {
        SendBuffer {
            segments: VecDeque::new(),
            capacity: capacity.max(1),
            mss: mss.clamp(1, MAX_SEGMENT_PAYLOAD),
            src_port,
            dst_port,
            next_seq: base_seq,
            last_ack: base_seq,
            retransmissions: 0,
        }
    }

    /// Queue application data
    ///
    /// Accepts as many whole segments as fit and returns the number of bytes
    /// taken. Fails with [`BufferError::Full`] if not even one segment fits.
    pub fn put(&mut self, data: &[u8]) -> Result<usize, BufferError> {
        if data.is_empty() {
            return Ok(0);
        }

        let free = self.available_space();
        if free == 0 {
            return Err(BufferError::Full);
        }

        let accepted = data.len().min(free * self.mss);
        for segment in codec::packetize(self.src_port, self.dst_port, self.next_seq, &data[..accepted], self.mss) {
            self.next_seq = segment.end_seq();
            self.push(segment);
        }

        Ok(accepted)
    }

    /// Queue a YO or CYA control segment
    ///
    /// Control segments are never refused for lack of space; they occupy one
    /// sequence number.
    pub fn put_control(&mut self, flags: Flags) -> Result<SeqNumber, BufferError> {
        let seq = self.next_seq;
        let segment = codec::control_segment(
            self.src_port,
            self.dst_port,
            seq,
            SeqNumber::new(0),
            flags.yo,
            flags.cya,
            false,
        );
        self.next_seq = segment.end_seq();
        self.push(segment);
        Ok(seq)
    }

    fn push(&mut self, segment: Segment) {
        self.segments.push_back(StoredSegment {
            segment,
            first_sent: None,
            send_count: 0,
            pending: true,
        });
    }

    /// Process the peer's cumulative "next expected" number
    ///
    /// Stale acknowledgments (behind the last one seen) and acknowledgments
    /// for data never sent are ignored.
    pub fn notify_ack(&mut self, ack_num: SeqNumber) -> AckOutcome {
        let mut outcome = AckOutcome::default();

        if ack_num.lt(self.last_ack) || ack_num.gt(self.next_seq) {
            tracing::trace!(
                "Ignoring ack {} outside [{}, {}]",
                ack_num,
                self.last_ack,
                self.next_seq
            );
            return outcome;
        }
        self.last_ack = ack_num;

        let now = Instant::now();
        while let Some(front) = self.segments.front() {
            if !front.segment.end_seq().le(ack_num) {
                break;
            }
            if let Some(stored) = self.segments.pop_front() {
                outcome.acked_segments += 1;
                outcome.acked_bytes += stored.segment.payload.len();
                if stored.send_count == 1 {
                    if let Some(sent) = stored.first_sent {
                        outcome.rtt_sample = Some(now.duration_since(sent));
                    }
                }
            }
        }

        outcome
    }

    /// Hand out up to `max_segments` segments from the front of the buffer
    ///
    /// At least one segment is returned when anything is buffered, so a
    /// closed window still gets a segment. Segments stay buffered until
    /// acknowledged.
    pub fn take(&mut self, include_ack: bool, ack_num: SeqNumber, window: u16, max_segments: usize) -> Vec<Segment> {
        self.take_filtered(include_ack, ack_num, window, max_segments, false)
    }

    /// Like [`SendBuffer::take`] but only returns segments not sent since
    /// they were queued or since the last [`SendBuffer::rewind`]
    pub fn take_unsent(
        &mut self,
        include_ack: bool,
        ack_num: SeqNumber,
        window: u16,
        max_segments: usize,
    ) -> Vec<Segment> {
        self.take_filtered(include_ack, ack_num, window, max_segments, true)
    }

    fn take_filtered(
        &mut self,
        include_ack: bool,
        ack_num: SeqNumber,
        window: u16,
        max_segments: usize,
        unsent_only: bool,
    ) -> Vec<Segment> {
        let now = Instant::now();
        let limit = max_segments.max(1);
        let mut out = Vec::new();

        for stored in self.segments.iter_mut().take(limit) {
            if unsent_only && !stored.pending {
                continue;
            }

            let mut segment = stored.segment.clone();
            if include_ack {
                segment.set_ack(ack_num);
            } else {
                segment.clear_ack();
            }
            segment.set_window(window);
            out.push(compute_checksum(segment));

            if stored.send_count > 0 {
                self.retransmissions += 1;
            }
            stored.send_count += 1;
            stored.pending = false;
            stored.first_sent.get_or_insert(now);
        }

        out
    }

    /// Mark every buffered segment for retransmission
    ///
    /// After a timeout the whole window is resent from the front as the
    /// congestion window reopens.
    pub fn rewind(&mut self) {
        for stored in self.segments.iter_mut() {
            stored.pending = true;
        }
    }

    /// Build a payload-less acknowledgment at the current send position
    pub fn ack_segment(&self, ack_num: SeqNumber, window: u16) -> Segment {
        let mut segment = Segment::new(self.src_port, self.dst_port, self.next_seq, Bytes::new());
        segment.set_ack(ack_num);
        segment.set_window(window);
        compute_checksum(segment)
    }

    /// Number of buffered segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if some buffered segment is waiting to be (re)sent
    pub fn has_unsent(&self) -> bool {
        self.segments.iter().any(|stored| stored.pending)
    }

    /// True if some segment has been sent and not rewound or acknowledged
    pub fn has_in_flight(&self) -> bool {
        self.segments.iter().any(|stored| !stored.pending)
    }

    /// Number of segments from the front whose payloads together fit in
    /// `max_bytes`
    ///
    /// Counting starts at the oldest unacknowledged segment, so segments
    /// already in flight use up the budget first. Control segments carry no
    /// payload and always fit.
    pub fn segments_within(&self, max_bytes: usize) -> usize {
        let mut used = 0;
        self.segments
            .iter()
            .take_while(|stored| {
                used += stored.segment.payload.len();
                used <= max_bytes
            })
            .count()
    }

    /// Free slots (in segments)
    pub fn available_space(&self) -> usize {
        self.capacity.saturating_sub(self.segments.len())
    }

    pub fn next_seq(&self) -> SeqNumber {
        self.next_seq
    }

    pub fn last_ack(&self) -> SeqNumber {
        self.last_ack
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    /// Number of segments handed out again after their first transmission
    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }
}

/// In-order receive buffer for one connection
pub struct ReceiveBuffer {
    data: BytesMut,
    capacity: usize,
    expected: SeqNumber,
}

impl ReceiveBuffer {
    /// Create a receive buffer expecting `base_seq` next
    pub fn new(base_seq: SeqNumber, capacity: usize) -> Self {
        ReceiveBuffer {
            data: BytesMut::with_capacity(capacity),
            capacity,
            expected: base_seq,
        }
    }

    /// True iff `segment` carries the next expected sequence number
    #[inline]
    pub fn is_expecting(&self, segment: &Segment) -> bool {
        segment.seq() == self.expected
    }

    /// Accept the segment if it is the next one in order and fits
    ///
    /// Returns whether the segment was accepted. Rejected segments leave the
    /// buffer untouched.
    pub fn put(&mut self, segment: &Segment) -> bool {
        if !self.is_expecting(segment) || segment.seq_len() == 0 {
            return false;
        }

        if !segment.payload.is_empty() {
            if segment.payload.len() > self.window_size() {
                tracing::trace!(
                    "Dropping {} byte segment, window is {}",
                    segment.payload.len(),
                    self.window_size()
                );
                return false;
            }
            self.data.extend_from_slice(&segment.payload);
        }

        self.expected = segment.end_seq();
        true
    }

    /// Remove and return up to `max_bytes` from the front
    pub fn take(&mut self, max_bytes: usize) -> Bytes {
        let n = max_bytes.min(self.data.len());
        self.data.split_to(n).freeze()
    }

    /// Remaining capacity in bytes
    pub fn window_size(&self) -> usize {
        self.capacity.saturating_sub(self.data.len())
    }

    /// Window as advertised on the wire
    pub fn advertised_window(&self) -> u16 {
        self.window_size().min(u16::MAX as usize) as u16
    }

    pub fn expected_seq(&self) -> SeqNumber {
        self.expected
    }

    /// Buffered byte count
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
