//! RxP Protocol Core Implementation
//!
//! This crate implements the sans-IO core of RxP, a reliable
//! connection-oriented transport over unreliable datagrams: segment layout
//! and checksums, wraparound sequence numbers, send/receive buffers, the
//! retransmission timeout estimator, congestion control and the connection
//! state enumeration.

pub mod buffer;
pub mod codec;
pub mod congestion;
pub mod rto;
pub mod segment;
pub mod sequence;
pub mod state;

pub use buffer::{AckOutcome, BufferError, ReceiveBuffer, SendBuffer};
pub use codec::{compute_checksum, control_segment, decode, encode, packetize, validate_checksum};
pub use congestion::{CongestionController, CongestionPhase};
pub use rto::RtoEstimator;
pub use segment::{Flags, Segment, SegmentError, SegmentHeader, HEADER_SIZE, MAX_SEGMENT_PAYLOAD, MSS};
pub use sequence::{SeqNumber, MAX_SEQ_NUM};
pub use state::ConnectionState;
