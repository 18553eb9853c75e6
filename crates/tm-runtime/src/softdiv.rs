//! Shift-subtract division for targets without a 64-bit hardware divider.
//!
//! Used only when deriving fixed-point ratios at calibration time; hot paths
//! multiply by the precomputed ratios instead of dividing.

/// Binary long division of a 128-bit numerator by a 64-bit divisor.
///
/// Returns `(quotient, remainder)`, or `None` when `divisor` is zero.
#[must_use]
pub fn div_wide(numerator: u128, divisor: u64) -> Option<(u128, u64)> {
    if divisor == 0 {
        return None;
    }
    let divisor = u128::from(divisor);
    let mut quotient: u128 = 0;
    let mut remainder: u128 = 0;

    let bits = 128 - numerator.leading_zeros();
    for bit in (0..bits).rev() {
        remainder = (remainder << 1) | ((numerator >> bit) & 1);
        if remainder >= divisor {
            remainder -= divisor;
            quotient |= 1 << bit;
        }
    }

    // remainder < divisor <= u64::MAX
    #[allow(clippy::cast_possible_truncation)]
    Some((quotient, remainder as u64))
}

/// 64-bit by 64-bit long division.
#[must_use]
pub fn div_u64(numerator: u64, divisor: u64) -> Option<(u64, u64)> {
    let (q, r) = div_wide(u128::from(numerator), divisor)?;
    // quotient <= numerator
    #[allow(clippy::cast_possible_truncation)]
    Some((q as u64, r))
}

/// Quotient saturated to `u64`, `None` on division by zero.
#[must_use]
pub fn div_wide_saturating(numerator: u128, divisor: u64) -> Option<u64> {
    let (q, _) = div_wide(numerator, divisor)?;
    Some(u64::try_from(q).unwrap_or(u64::MAX))
}

/// Ceiling division, `None` on division by zero.
#[must_use]
pub fn div_ceil_u64(numerator: u64, divisor: u64) -> Option<u64> {
    let (q, r) = div_u64(numerator, divisor)?;
    Some(if r == 0 { q } else { q + 1 })
}
