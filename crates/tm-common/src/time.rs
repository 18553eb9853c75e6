//! Wide (hi/lo split) time values and unit conversions.
//!
//! Collaborators exchange 64-bit times as two 32-bit halves. Addition and
//! subtraction propagate the carry/borrow between halves explicitly and report
//! results that do not fit in 64 bits instead of wrapping.

use crate::error::{TmError, TmResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Microseconds per millisecond.
pub const MICROS_PER_MILLI: u64 = 1_000;
/// Microseconds per second.
pub const MICROS_PER_SECOND: u64 = 1_000_000;
/// Nanoseconds per microsecond.
pub const NANOS_PER_MICRO: u64 = 1_000;
/// Nanoseconds per second.
pub const NANOS_PER_SECOND: u64 = 1_000_000_000;
/// Classic system ticks per second.
pub const TICKS_PER_SECOND: u64 = 60;

/// 64-bit unsigned value stored as high and low 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct UnsignedWide {
    /// Upper 32 bits.
    pub hi: u32,
    /// Lower 32 bits.
    pub lo: u32,
}

impl UnsignedWide {
    /// Zero.
    pub const ZERO: Self = Self { hi: 0, lo: 0 };
    /// Largest representable value.
    pub const MAX: Self = Self {
        hi: u32::MAX,
        lo: u32::MAX,
    };

    /// Build from explicit halves.
    #[must_use]
    pub const fn new(hi: u32, lo: u32) -> Self {
        Self { hi, lo }
    }

    /// Split a 64-bit value.
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self {
            hi: (value >> 32) as u32,
            lo: value as u32,
        }
    }

    /// Join the halves back into a 64-bit value.
    #[must_use]
    pub const fn to_u64(self) -> u64 {
        ((self.hi as u64) << 32) | self.lo as u64
    }
}

impl From<u64> for UnsignedWide {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl From<UnsignedWide> for u64 {
    fn from(value: UnsignedWide) -> Self {
        value.to_u64()
    }
}

impl fmt::Display for UnsignedWide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_u64())
    }
}

/// Add two wide values, carrying from the low word into the high word.
///
/// # Errors
///
/// Returns [`TmError::Overflow`] when the high word overflows.
pub fn add_wide(a: UnsignedWide, b: UnsignedWide) -> TmResult<UnsignedWide> {
    let (lo, carry) = a.lo.overflowing_add(b.lo);
    let (hi, over1) = a.hi.overflowing_add(b.hi);
    let (hi, over2) = hi.overflowing_add(u32::from(carry));
    if over1 || over2 {
        return Err(TmError::Overflow);
    }
    Ok(UnsignedWide { hi, lo })
}

/// Subtract `b` from `a`, borrowing from the high word.
///
/// # Errors
///
/// Returns [`TmError::Underflow`] when `b > a`.
pub fn sub_wide(a: UnsignedWide, b: UnsignedWide) -> TmResult<UnsignedWide> {
    let (lo, borrow) = a.lo.overflowing_sub(b.lo);
    let (hi, under1) = a.hi.overflowing_sub(b.hi);
    let (hi, under2) = hi.overflowing_sub(u32::from(borrow));
    if under1 || under2 {
        return Err(TmError::Underflow);
    }
    Ok(UnsignedWide { hi, lo })
}

/// Convert milliseconds to 60 Hz ticks (truncating).
#[must_use]
pub fn millis_to_ticks(millis: u64) -> u64 {
    millis.saturating_mul(TICKS_PER_SECOND) / 1_000
}

/// Convert 60 Hz ticks to milliseconds.
#[must_use]
pub fn ticks_to_millis(ticks: u64) -> u64 {
    ticks.saturating_mul(1_000) / TICKS_PER_SECOND
}

/// Convert microseconds to 60 Hz ticks (truncating).
#[must_use]
pub fn micros_to_ticks(micros: u64) -> u64 {
    micros.saturating_mul(TICKS_PER_SECOND) / MICROS_PER_SECOND
}

/// Convert 60 Hz ticks to microseconds.
#[must_use]
pub fn ticks_to_micros(ticks: u64) -> u64 {
    ticks.saturating_mul(MICROS_PER_SECOND) / TICKS_PER_SECOND
}

/// Decode a classic signed delay count: positive values are milliseconds,
/// negative values are microseconds.
#[must_use]
pub fn count_to_micros(count: i32) -> u64 {
    if count >= 0 {
        u64::from(count.unsigned_abs()) * MICROS_PER_MILLI
    } else {
        u64::from(count.unsigned_abs())
    }
}
