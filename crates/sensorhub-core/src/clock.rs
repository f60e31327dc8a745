//! Monotonic, slew-adjusted wall-clock provider.
//!
//! Grounded in `original_source/src/datetime.h`: the clock never runs
//! backwards, and any correction towards an external time source is applied
//! gradually (by `adjust_rate` of the discrepancy) rather than as a jump.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default slew rate: 2.5% of the observed discrepancy per adjustment.
pub const DEFAULT_ADJUST_RATE: f64 = 0.025;

/// Slew rate used when an XSens device (which reports `ut` at high
/// frequency) is the active time source.
pub const XSENS_ADJUST_RATE: f64 = 0.0001;

fn sys_time_sec() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_secs_f64()
}

struct ClockState {
    value: f64,
    offset: f64,
    adjust_rate: f64,
}

/// A monotonic, slew-adjusted clock. Cheaply cloneable; all instances backed
/// by the same clone share state (the service holds exactly one).
pub struct Clock {
    state: Mutex<ClockState>,
}

impl Clock {
    /// Construct a clock whose first `now()` is close to true UTC: the
    /// initial offset is `wall_time_now() - sys_time_now()`, which is
    /// approximately zero unless the caller supplies a different wall time
    /// source in a test.
    pub fn new() -> Self {
        Clock {
            state: Mutex::new(ClockState {
                value: sys_time_sec(),
                offset: 0.0,
                adjust_rate: DEFAULT_ADJUST_RATE,
            }),
        }
    }

    /// Publish `max(previous, sys_time() + offset)`.
    pub fn now(&self) -> f64 {
        let mut state = self.state.lock().unwrap();
        let candidate = sys_time_sec() + state.offset;
        state.value = state.value.max(candidate);
        state.value
    }

    /// Adjust the offset towards making `now()` converge on `target`.
    pub fn adjust(&self, target: f64) {
        let mut state = self.state.lock().unwrap();
        let rate = state.adjust_rate;
        state.offset += rate * (target - sys_time_sec());
    }

    /// Adjust the offset by `adjust_rate * delta`, where `delta` is a
    /// caller-observed `(reported_time - stamp)` discrepancy.
    pub fn adjust_diff(&self, delta: f64) {
        let mut state = self.state.lock().unwrap();
        let rate = state.adjust_rate;
        state.offset += rate * delta;
    }

    /// Set the slew rate used by future `adjust`/`adjust_diff` calls.
    pub fn set_adjust_rate(&self, rate: f64) {
        self.state.lock().unwrap().adjust_rate = rate;
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_non_decreasing_under_negative_adjust() {
        let clock = Clock::new();
        clock.set_adjust_rate(0.5);
        let t0 = clock.now();
        // Target one second behind system time.
        clock.adjust(sys_time_sec() - 1.0);
        let t1 = clock.now();
        let t2 = clock.now();
        let t3 = clock.now();
        assert!(t1 >= t0);
        assert!(t2 >= t1);
        assert!(t3 >= t2);
        let sys = sys_time_sec();
        assert!((t3 - sys).abs() < 0.5);
    }

    #[test]
    fn adjust_diff_matches_adjust() {
        let a = Clock::new();
        let b = Clock::new();
        a.adjust(sys_time_sec() - 2.0);
        b.adjust_diff(-2.0);
        assert!((a.now() - b.now()).abs() < 1e-6);
    }
}
