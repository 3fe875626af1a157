//! Unsigned 128 bit integers made of two 64 bit halves.
//!
//! Octant linear ids on deep levels need up to `3 * MAX_LEVEL` bits. A
//! [WideIndex] holds them as a plain value type with explicit carry and
//! borrow handling.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, BitAnd, BitOr, BitOrAssign, Shl, Shr, Sub};

use num::traits::{Bounded, CheckedAdd, CheckedSub, Zero};

/// An unsigned integer in `[0, 2^128)`.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, Debug)]
pub struct WideIndex {
    high: u64,
    low: u64,
}

impl WideIndex {
    /// The index `1`.
    pub const ONE: WideIndex = WideIndex::new(0, 1);

    /// Create a new index from its high and low bits.
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// The upper 64 bits.
    pub const fn high(&self) -> u64 {
        self.high
    }

    /// The lower 64 bits.
    pub const fn low(&self) -> u64 {
        self.low
    }

    /// Compare two indices, returning `-1`, `0` or `1`.
    pub fn compare(&self, other: &WideIndex) -> i32 {
        match self.cmp(other) {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        }
    }

    /// Add `other` to `self` in place.
    ///
    /// The sum must fit into 128 bits. This is checked in debug builds.
    pub fn add_to(&mut self, other: &WideIndex) {
        let (low, carry) = self.low.overflowing_add(other.low);
        let (high, overflow_high) = self.high.overflowing_add(other.high);
        let (high, overflow_carry) = high.overflowing_add(carry as u64);
        debug_assert!(
            !(overflow_high || overflow_carry),
            "WideIndex addition overflows 128 bits"
        );
        self.high = high;
        self.low = low;
    }

    /// Return `self - other`.
    ///
    /// # Panics
    /// Requires `self >= other`. The difference of a smaller minus a larger
    /// index is not representable and is reported instead of clamped.
    pub fn subtract(&self, other: &WideIndex) -> WideIndex {
        assert!(
            *self >= *other,
            "WideIndex subtraction requires minuend >= subtrahend ({} < {})",
            self,
            other
        );
        let (low, borrow) = self.low.overflowing_sub(other.low);
        let high = self.high - other.high - borrow as u64;
        WideIndex { high, low }
    }

    /// Bitwise and of two indices.
    pub fn bitwise_and(&self, other: &WideIndex) -> WideIndex {
        WideIndex {
            high: self.high & other.high,
            low: self.low & other.low,
        }
    }

    /// Bitwise or of `other` into `self`.
    pub fn bitwise_or_in_place(&mut self, other: &WideIndex) {
        self.high |= other.high;
        self.low |= other.low;
    }

    /// Shift left by `count` bits. Bits shifted beyond 128 are lost.
    pub fn left_shift(&self, count: u32) -> WideIndex {
        match count {
            0 => *self,
            1..=63 => WideIndex {
                high: (self.high << count) | (self.low >> (64 - count)),
                low: self.low << count,
            },
            64..=127 => WideIndex {
                high: self.low << (count - 64),
                low: 0,
            },
            _ => WideIndex::zero(),
        }
    }

    /// Shift right by `count` bits.
    pub fn right_shift(&self, count: u32) -> WideIndex {
        match count {
            0 => *self,
            1..=63 => WideIndex {
                high: self.high >> count,
                low: (self.low >> count) | (self.high << (64 - count)),
            },
            64..=127 => WideIndex {
                high: 0,
                low: self.high >> (count - 64),
            },
            _ => WideIndex::zero(),
        }
    }

    /// Set bit number `bit` (counted from the least significant bit) to one.
    pub fn set_bit(&mut self, bit: u32) {
        assert!(bit < 128, "bit {} is outside a 128 bit index", bit);
        if bit < 64 {
            self.low |= 1 << bit;
        } else {
            self.high |= 1 << (bit - 64);
        }
    }

    /// Return true if bit number `bit` is set.
    pub fn bit(&self, bit: u32) -> bool {
        match bit {
            0..=63 => (self.low >> bit) & 1 == 1,
            64..=127 => (self.high >> (bit - 64)) & 1 == 1,
            _ => false,
        }
    }

    /// Return `2^exponent - 1`, a mask of the lowest `exponent` bits.
    pub fn low_mask(exponent: u32) -> WideIndex {
        if exponent >= 128 {
            return WideIndex::max_value();
        }
        WideIndex::ONE.left_shift(exponent).subtract(&WideIndex::ONE)
    }
}

impl Ord for WideIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.high
            .cmp(&other.high)
            .then_with(|| self.low.cmp(&other.low))
    }
}

impl PartialOrd for WideIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<u64> for WideIndex {
    fn from(value: u64) -> Self {
        WideIndex::new(0, value)
    }
}

impl From<usize> for WideIndex {
    fn from(value: usize) -> Self {
        WideIndex::new(0, value as u64)
    }
}

impl From<u128> for WideIndex {
    fn from(value: u128) -> Self {
        WideIndex::new((value >> 64) as u64, value as u64)
    }
}

impl From<WideIndex> for u128 {
    fn from(value: WideIndex) -> Self {
        ((value.high as u128) << 64) | value.low as u128
    }
}

/// Error returned when a [WideIndex] does not fit into 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("index {0} does not fit into 64 bits")]
pub struct IndexOverflow(pub WideIndex);

impl TryFrom<WideIndex> for u64 {
    type Error = IndexOverflow;

    fn try_from(value: WideIndex) -> Result<Self, Self::Error> {
        if value.high == 0 {
            Ok(value.low)
        } else {
            Err(IndexOverflow(value))
        }
    }
}

impl Add for WideIndex {
    type Output = WideIndex;

    fn add(mut self, rhs: Self) -> Self::Output {
        self.add_to(&rhs);
        self
    }
}

impl AddAssign for WideIndex {
    fn add_assign(&mut self, rhs: Self) {
        self.add_to(&rhs);
    }
}

impl Sub for WideIndex {
    type Output = WideIndex;

    fn sub(self, rhs: Self) -> Self::Output {
        self.subtract(&rhs)
    }
}

impl BitAnd for WideIndex {
    type Output = WideIndex;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.bitwise_and(&rhs)
    }
}

impl BitOr for WideIndex {
    type Output = WideIndex;

    fn bitor(mut self, rhs: Self) -> Self::Output {
        self.bitwise_or_in_place(&rhs);
        self
    }
}

impl BitOrAssign for WideIndex {
    fn bitor_assign(&mut self, rhs: Self) {
        self.bitwise_or_in_place(&rhs);
    }
}

impl Shl<u32> for WideIndex {
    type Output = WideIndex;

    fn shl(self, rhs: u32) -> Self::Output {
        self.left_shift(rhs)
    }
}

impl Shr<u32> for WideIndex {
    type Output = WideIndex;

    fn shr(self, rhs: u32) -> Self::Output {
        self.right_shift(rhs)
    }
}

impl Zero for WideIndex {
    fn zero() -> Self {
        WideIndex::new(0, 0)
    }

    fn is_zero(&self) -> bool {
        self.high == 0 && self.low == 0
    }
}

impl Bounded for WideIndex {
    fn min_value() -> Self {
        WideIndex::zero()
    }

    fn max_value() -> Self {
        WideIndex::new(u64::MAX, u64::MAX)
    }
}

impl CheckedAdd for WideIndex {
    fn checked_add(&self, v: &Self) -> Option<Self> {
        let (low, carry) = self.low.overflowing_add(v.low);
        let high = self
            .high
            .checked_add(v.high)?
            .checked_add(carry as u64)?;
        Some(WideIndex { high, low })
    }
}

impl CheckedSub for WideIndex {
    fn checked_sub(&self, v: &Self) -> Option<Self> {
        if self < v {
            None
        } else {
            Some(self.subtract(v))
        }
    }
}

impl fmt::Display for WideIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.high == 0 {
            write!(f, "{:#x}", self.low)
        } else {
            write!(f, "{:#x}{:016x}", self.high, self.low)
        }
    }
}
