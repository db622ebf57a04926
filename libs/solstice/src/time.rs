//! Clock access for the runtime.
//!
//! All loop bookkeeping uses [`now`], the monotonic clock, expressed as a
//! [`Duration`] since an arbitrary epoch. [`realtime`] reads the wall clock
//! for timestamping only; it must never drive scheduling.

use std::time::Duration;

use rustix::time::{ClockId, clock_gettime};

fn from_timespec(ts: rustix::time::Timespec) -> Duration {
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Monotonic clock reading.
pub fn now() -> Duration {
    from_timespec(clock_gettime(ClockId::Monotonic))
}

/// Wall clock reading.
pub fn realtime() -> Duration {
    from_timespec(clock_gettime(ClockId::Realtime))
}

/// Time remaining until `deadline`, `Duration::ZERO` if it already passed.
pub fn until(deadline: Duration) -> Duration {
    deadline.saturating_sub(now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_nondecreasing() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn duration_arithmetic_normalizes() {
        let a = Duration::new(1, 999_999_999);
        let b = Duration::new(0, 2);
        let sum = a + b;
        assert_eq!(sum, Duration::new(2, 1));
        assert_eq!(sum - b, a);
        assert_eq!(sum.subsec_nanos(), 1);
    }

    #[test]
    fn saturating_sub_floors_at_zero() {
        let a = Duration::from_millis(5);
        let b = Duration::from_millis(7);
        assert_eq!(a.saturating_sub(b), Duration::ZERO);
    }

    #[test]
    fn until_passed_deadline_is_zero() {
        assert_eq!(until(Duration::ZERO), Duration::ZERO);
    }
}
