
use std::sync::OnceLock;
use std::time;

// Timestamps are 32-bit millisecond counts which wrap after ~49 days.
// Comparisons treat differences of less than a day as in-order; anything
// larger is assumed to have wrapped.
const TIME_OVERFLOW: u32 = 86_400_000;

static CLOCK_BASE: OnceLock<time::Instant> = OnceLock::new();

/// Returns the monotonic clock in milliseconds. The first call establishes
/// the epoch and returns a small positive value, so 0 can mean "unset".
pub(crate) fn time_get() -> u32 {
    let base = CLOCK_BASE.get_or_init(time::Instant::now);
    (base.elapsed().as_millis() as u32).wrapping_add(1)
}

pub(crate) fn time_less(a: u32, b: u32) -> bool {
    a.wrapping_sub(b) >= TIME_OVERFLOW
}

pub(crate) fn time_greater_equal(a: u32, b: u32) -> bool {
    !time_less(a, b)
}

pub(crate) fn time_difference(a: u32, b: u32) -> u32 {
    if a.wrapping_sub(b) >= TIME_OVERFLOW {
        b.wrapping_sub(a)
    } else {
        a.wrapping_sub(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(time_less(5, 10));
        assert!(!time_less(10, 5));
        assert!(time_greater_equal(10, 10));
        assert!(time_greater_equal(11, 10));
    }

    #[test]
    fn test_wraparound() {
        let before = u32::MAX - 50;
        let after = 50u32;

        assert!(time_less(before, after));
        assert!(time_greater_equal(after, before));
        assert_eq!(time_difference(after, before), 101);
        assert_eq!(time_difference(before, after), 101);
    }

    #[test]
    fn test_first_call_is_positive() {
        assert_ne!(time_get(), 0);
    }
}
