//! Remainder computation shared by the hash and modulo distribution
//! strategies.
//!
//! The result must equal `n % d` for every input; the specialized paths
//! exist because the divisor is a node count fixed for the life of a
//! relation, and the same reduction runs on every routed row.

/// `n mod d`, with `d > 0`.
///
/// Three paths: a mask when `d` is a power of two, a digit-fold when `d` is
/// one less than a power of two (a Mersenne-style divisor), and the plain
/// `%` operator otherwise. All three produce identical mappings; node maps
/// built on one coordinator stay valid on another regardless of which path
/// its divisor takes.
pub fn compute_modulo(n: u32, d: u32) -> u32 {
    debug_assert!(d > 0, "modulo by zero node count");
    if d.is_power_of_two() {
        return n & (d - 1);
    }
    match d.checked_add(1) {
        Some(d1) if d1.is_power_of_two() => mersenne_modulo(n, d, d1.trailing_zeros()),
        _ => n % d,
    }
}

/// Reduce-and-fold for `d = 2^k - 1`: the sum of the base-`2^k` digits of
/// `n` is congruent to `n` modulo `d`, so folding until the value fits
/// leaves either the remainder or exactly `d` (which stands for zero).
fn mersenne_modulo(n: u32, d: u32, k: u32) -> u32 {
    let mut m = n;
    while m > d {
        let mut folded = 0u32;
        let mut rest = m;
        while rest != 0 {
            folded += rest & d;
            rest >>= k;
        }
        m = folded;
    }
    if m == d {
        0
    } else {
        m
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn all_three_paths() {
        // power of two
        assert_eq!(compute_modulo(0x5C20F8FB, 4), 0x5C20F8FB % 4);
        assert_eq!(compute_modulo(1023, 8), 7);
        // d + 1 power of two
        assert_eq!(compute_modulo(1000, 7), 1000 % 7);
        assert_eq!(compute_modulo(u32::MAX, 15), u32::MAX % 15);
        assert_eq!(compute_modulo(21, 7), 0);
        assert_eq!(compute_modulo(6, 7), 6);
        // neither
        assert_eq!(compute_modulo(1000, 6), 4);
        assert_eq!(compute_modulo(12345, 10), 5);
    }

    #[test]
    fn degenerate_divisors() {
        assert_eq!(compute_modulo(42, 1), 0);
        assert_eq!(compute_modulo(0, 3), 0);
        assert_eq!(compute_modulo(u32::MAX, u32::MAX), 0);
        assert_eq!(compute_modulo(u32::MAX - 1, u32::MAX), u32::MAX - 1);
    }

    proptest! {
        #[test]
        fn matches_remainder_operator(n: u32, d in 1u32..) {
            prop_assert_eq!(compute_modulo(n, d), n % d);
        }

        #[test]
        fn mersenne_divisors_match(n: u32, k in 1u32..31) {
            let d = (1u32 << k) - 1;
            prop_assert_eq!(compute_modulo(n, d), n % d);
        }
    }
}
