//! Sequence number comparisons on the 32-bit ring.
//!
//! Two sequence numbers compare by the sign of their wrapping difference, so
//! the comparisons hold as long as the numbers are less than 2^31 apart.

/// a < b under modular arithmetic
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// a <= b under modular arithmetic
pub fn seq_leq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// a > b under modular arithmetic
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// a >= b under modular arithmetic
pub fn seq_geq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Is `b` in the closed range `[a, c]` when accounting for modular arithmetic?
pub fn seq_between(a: u32, b: u32, c: u32) -> bool {
    seq_geq(b, a) && seq_leq(b, c)
}
