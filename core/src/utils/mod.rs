//! Small shared utilities.

pub mod streamstat;

/// Returns `true` if sequence number `lhs` is strictly before `rhs`,
/// accounting for 32-bit wraparound.
///
/// From RFC1323: a value is "old" if it is more than 2**31 behind the
/// comparison point, so the signed interpretation of the wrapped
/// difference carries the ordering within any 2**31 neighbourhood.
#[inline]
pub fn seq_lt(lhs: u32, rhs: u32) -> bool {
    lhs != rhs && lhs.wrapping_sub(rhs) > (1 << 31)
}

/// Returns `true` if sequence number `lhs` is strictly after `rhs`,
/// accounting for 32-bit wraparound.
#[inline]
pub fn seq_gt(lhs: u32, rhs: u32) -> bool {
    seq_lt(rhs, lhs)
}

/// Returns `true` if `lhs` is at or after `rhs`, accounting for wraparound.
#[inline]
pub fn seq_geq(lhs: u32, rhs: u32) -> bool {
    !seq_lt(lhs, rhs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_seq_compare_total_order() {
        let pairs = [
            (0u32, 1u32),
            (100, 200),
            (u32::MAX - 100, 100),
            (u32::MAX, 0),
            (1 << 30, (1 << 30) + 1),
        ];
        for (a, b) in pairs {
            assert!(seq_lt(a, b), "{} < {}", a, b);
            assert!(seq_gt(b, a), "{} > {}", b, a);
            assert!(!seq_lt(b, a));
            assert!(!seq_gt(a, b));
        }
        assert!(!seq_lt(42, 42));
        assert!(!seq_gt(42, 42));
        assert!(seq_geq(42, 42));
    }

    #[test]
    fn core_seq_compare_antisymmetric_in_neighbourhood() {
        // within a 2^31 window exactly one of <, =, > holds
        let base = u32::MAX - 1000;
        for off in [1u32, 500, 1000, 100_000, (1 << 31) - 1] {
            let other = base.wrapping_add(off);
            assert!(seq_lt(base, other));
            assert!(!seq_lt(other, base));
        }
    }
}
