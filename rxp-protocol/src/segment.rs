//! RxP Segment Structures and Serialization
//!
//! Every RxP segment consists of a fixed 20-byte header followed by an
//! optional payload. All multi-byte fields are in network byte order:
//!
//! ```text
//!  0               2               4
//! +---------------+---------------+
//! | source port   | dest port     |
//! +---------------+---------------+
//! | sequence number               |
//! +-------------------------------+
//! | acknowledgment number         |
//! +---------------+---------------+
//! | window        | checksum      |
//! +---------------+---------------+
//! | flags         | payload len   |
//! +---------------+---------------+
//! | payload ...                   |
//! ```

use crate::sequence::SeqNumber;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

/// Size of the RxP segment header in bytes
pub const HEADER_SIZE: usize = 20;

/// Byte offset of the checksum field within the header
pub const CHECKSUM_OFFSET: usize = 14;

/// Default maximum segment size (payload bytes per segment)
pub const MSS: usize = 1024;

/// Largest payload the length field can describe
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Largest payload whose encoded segment still fits in one UDP datagram
pub const MAX_SEGMENT_PAYLOAD: usize = MAX_PAYLOAD_SIZE - HEADER_SIZE;

const YO_BIT: u16 = 0x0001;
const CYA_BIT: u16 = 0x0002;
const ACK_BIT: u16 = 0x0004;
const KNOWN_BITS: u16 = YO_BIT | CYA_BIT | ACK_BIT;

/// Segment control flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    /// Connection open (analogous to SYN)
    pub yo: bool,
    /// Connection close (analogous to FIN)
    pub cya: bool,
    /// Acknowledgment number is valid
    pub ack: bool,
}

impl Flags {
    pub const NONE: Flags = Flags {
        yo: false,
        cya: false,
        ack: false,
    };

    pub const YO: Flags = Flags {
        yo: true,
        cya: false,
        ack: false,
    };

    pub const CYA: Flags = Flags {
        yo: false,
        cya: true,
        ack: false,
    };

    /// Parse flags, rejecting reserved bits
    pub fn from_bits(bits: u16) -> Option<Self> {
        if bits & !KNOWN_BITS != 0 {
            return None;
        }
        Some(Flags {
            yo: bits & YO_BIT != 0,
            cya: bits & CYA_BIT != 0,
            ack: bits & ACK_BIT != 0,
        })
    }

    pub fn bits(self) -> u16 {
        let mut bits = 0;
        if self.yo {
            bits |= YO_BIT;
        }
        if self.cya {
            bits |= CYA_BIT;
        }
        if self.ack {
            bits |= ACK_BIT;
        }
        bits
    }

    /// True if the segment opens or closes a connection
    #[inline]
    pub fn is_control(self) -> bool {
        self.yo || self.cya
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::with_capacity(3);
        if self.yo {
            names.push("YO");
        }
        if self.cya {
            names.push("CYA");
        }
        if self.ack {
            names.push("ACK");
        }
        if names.is_empty() {
            write!(f, "DATA")
        } else {
            write!(f, "{}", names.join("+"))
        }
    }
}

/// Segment header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: SeqNumber,
    pub ack: SeqNumber,
    /// Advertised receive window in bytes
    pub window: u16,
    pub checksum: u16,
    pub flags: Flags,
}

impl SegmentHeader {
    /// Parse header from bytes (network byte order)
    ///
    /// Returns the header together with the declared payload length.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), SegmentError> {
        if bytes.len() < HEADER_SIZE {
            return Err(SegmentError::InsufficientData {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let mut buf = &bytes[..HEADER_SIZE];
        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let seq = SeqNumber::new(buf.get_u32());
        let ack = SeqNumber::new(buf.get_u32());
        let window = buf.get_u16();
        let checksum = buf.get_u16();
        let raw_flags = buf.get_u16();
        let payload_len = buf.get_u16() as usize;

        let flags = Flags::from_bits(raw_flags).ok_or(SegmentError::InvalidFlags(raw_flags))?;

        Ok((
            SegmentHeader {
                src_port,
                dst_port,
                seq,
                ack,
                window,
                checksum,
                flags,
            },
            payload_len,
        ))
    }

    /// Serialize header to bytes (network byte order)
    pub fn to_bytes(&self, payload_len: u16, buf: &mut BytesMut) {
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u32(self.seq.as_raw());
        buf.put_u32(self.ack.as_raw());
        buf.put_u16(self.window);
        buf.put_u16(self.checksum);
        buf.put_u16(self.flags.bits());
        buf.put_u16(payload_len);
    }
}

/// A single RxP segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: SegmentHeader,
    pub payload: Bytes,
}

impl Segment {
    /// Create a segment with no flags set and a zero checksum
    pub fn new(src_port: u16, dst_port: u16, seq: SeqNumber, payload: Bytes) -> Self {
        Segment {
            header: SegmentHeader {
                src_port,
                dst_port,
                seq,
                ack: SeqNumber::new(0),
                window: 0,
                checksum: 0,
                flags: Flags::NONE,
            },
            payload,
        }
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        self.header.src_port
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        self.header.dst_port
    }

    #[inline]
    pub fn seq(&self) -> SeqNumber {
        self.header.seq
    }

    #[inline]
    pub fn ack_num(&self) -> SeqNumber {
        self.header.ack
    }

    #[inline]
    pub fn window(&self) -> u16 {
        self.header.window
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        self.header.checksum
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        self.header.flags
    }

    #[inline]
    pub fn is_yo(&self) -> bool {
        self.header.flags.yo
    }

    #[inline]
    pub fn is_cya(&self) -> bool {
        self.header.flags.cya
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.header.flags.ack
    }

    /// Mark the acknowledgment field valid and set it
    pub fn set_ack(&mut self, ack: SeqNumber) {
        self.header.flags.ack = true;
        self.header.ack = ack;
    }

    /// Clear the acknowledgment flag and field
    pub fn clear_ack(&mut self) {
        self.header.flags.ack = false;
        self.header.ack = SeqNumber::new(0);
    }

    pub fn set_window(&mut self, window: u16) {
        self.header.window = window;
    }

    /// Amount of sequence space this segment occupies
    ///
    /// Payload bytes count one each and a YO or CYA flag adds one more, so
    /// a bare ACK occupies none.
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + u32::from(self.header.flags.is_control())
    }

    /// Sequence number immediately after this segment
    #[inline]
    pub fn end_seq(&self) -> SeqNumber {
        self.header.seq + self.seq_len()
    }

    /// Total encoded size (header + payload)
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Serialize the segment exactly as it would go on the wire
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.size());
        // An oversized payload saturates the length field, so decoding
        // reports a length mismatch instead of reading a wrapped length
        let payload_len = u16::try_from(self.payload.len()).unwrap_or(u16::MAX);
        self.header.to_bytes(payload_len, &mut buf);
        buf.put_slice(&self.payload);
        buf
    }

    /// Parse a segment from bytes without checking the checksum
    ///
    /// Use [`crate::codec::decode`] on the receive path; it validates the
    /// checksum before any field is trusted.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SegmentError> {
        let (header, payload_len) = SegmentHeader::from_bytes(bytes)?;
        let actual = bytes.len() - HEADER_SIZE;
        if actual != payload_len {
            return Err(SegmentError::LengthMismatch {
                declared: payload_len,
                actual,
            });
        }

        Ok(Segment {
            header,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {}->{} seq={} ack={} win={} len={}]",
            self.header.flags,
            self.header.src_port,
            self.header.dst_port,
            self.header.seq,
            self.header.ack,
            self.header.window,
            self.payload.len()
        )
    }
}

/// Segment parsing and validation errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SegmentError {
    #[error("Insufficient data: expected {expected} bytes, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("Payload length mismatch: header declares {declared} bytes, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Invalid flag bits: {0:#06x}")]
    InvalidFlags(u16),

    #[error("Checksum mismatch: carried {carried:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { carried: u16, computed: u16 },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}
