//! Sequence Number Handling
//!
//! RxP sequence numbers are full 32-bit values taken modulo `MAX_SEQ_NUM`
//! (2^32). This module provides a wrapped sequence number type whose
//! arithmetic and ordering account for wraparound.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// Sequence number modulus (2^32)
pub const MAX_SEQ_NUM: u64 = 1 << 32;

/// Half of the sequence space; gaps larger than this are treated as wrapped
const HALF_SPACE: u32 = (MAX_SEQ_NUM / 2) as u32;

/// Sequence number with 32-bit wraparound semantics
///
/// Ordering between two sequence numbers is defined by the shorter way
/// around the circle: `a` is before `b` when `b` can be reached from `a` by
/// moving forward less than half the sequence space.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct SeqNumber(u32);

impl SeqNumber {
    /// Create a new sequence number
    #[inline]
    pub const fn new(value: u32) -> Self {
        SeqNumber(value)
    }

    /// Get the raw sequence number value
    #[inline]
    pub fn as_raw(self) -> u32 {
        self.0
    }

    /// Increment the sequence number by 1
    #[inline]
    pub fn increment(&mut self) {
        self.0 = self.0.wrapping_add(1);
    }

    /// Get the next sequence number
    #[inline]
    pub fn next(self) -> Self {
        SeqNumber(self.0.wrapping_add(1))
    }

    /// Calculate the distance from this sequence number to another
    ///
    /// Returns a signed distance that accounts for wraparound. Positive values
    /// mean `other` is ahead of `self`, negative means `other` is behind.
    #[inline]
    pub fn distance_to(self, other: SeqNumber) -> i64 {
        let forward = other.0.wrapping_sub(self.0);
        if forward > HALF_SPACE {
            forward as i64 - MAX_SEQ_NUM as i64
        } else {
            forward as i64
        }
    }

    /// Check if this sequence number is less than another (accounting for wraparound)
    #[inline]
    pub fn lt(self, other: SeqNumber) -> bool {
        self.distance_to(other) > 0
    }

    /// Check if this sequence number is less than or equal to another
    #[inline]
    pub fn le(self, other: SeqNumber) -> bool {
        self == other || self.lt(other)
    }

    /// Check if this sequence number is greater than another
    #[inline]
    pub fn gt(self, other: SeqNumber) -> bool {
        self.distance_to(other) < 0
    }

    /// Check if this sequence number is greater than or equal to another
    #[inline]
    pub fn ge(self, other: SeqNumber) -> bool {
        self == other || self.gt(other)
    }
}

impl fmt::Debug for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SeqNumber({})", self.0)
    }
}

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SeqNumber {
    fn from(value: u32) -> Self {
        SeqNumber(value)
    }
}

impl From<SeqNumber> for u32 {
    fn from(seq: SeqNumber) -> u32 {
        seq.0
    }
}

impl Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs))
    }
}

impl Sub for SeqNumber {
    type Output = i64;

    /// Calculate the signed distance between two sequence numbers
    fn sub(self, rhs: SeqNumber) -> i64 {
        rhs.distance_to(self)
    }
}
