//! Millisecond service time.
//!
//! Protocol timestamps are 32-bit millisecond counters that wrap. Two timestamps are
//! ordered by looking at their wrapping difference: a difference larger than one day
//! means the "later" value actually wrapped around and is the earlier one.

/// Wrapping distance beyond which a difference is treated as negative.
pub const TIME_OVERFLOW: u32 = 86_400_000;

/// Returns true when `a` is strictly earlier than `b`.
#[inline]
pub fn time_less(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) >= TIME_OVERFLOW
}

/// Returns true when `a` is strictly later than `b`.
#[inline]
pub fn time_greater(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) >= TIME_OVERFLOW
}

/// Returns true when `a` is earlier than or equal to `b`.
#[inline]
pub fn time_less_equal(a: u32, b: u32) -> bool {
    !time_greater(a, b)
}

/// Returns true when `a` is later than or equal to `b`.
#[inline]
pub fn time_greater_equal(a: u32, b: u32) -> bool {
    !time_less(a, b)
}

/// Absolute distance between two timestamps, honouring wraparound.
#[inline]
pub fn time_difference(a: u32, b: u32) -> u32 {
    if a.wrapping_sub(b) >= TIME_OVERFLOW {
        b.wrapping_sub(a)
    } else {
        a.wrapping_sub(b)
    }
}
