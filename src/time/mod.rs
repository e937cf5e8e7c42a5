//! Time keeping and tick sources.
//!
//! The kernel keeps one monotonic millisecond counter, bumped by the
//! SysTick handler and readable from any context. When the application
//! moves the tick to a general-purpose periodic timer the counter stops
//! advancing on its own; timed APIs then resolve at the granularity the
//! application drives.

use portable_atomic::{AtomicU32, Ordering};

/// Milliseconds since boot. The SysTick handler is the only writer.
pub(crate) static MILLIS: AtomicU32 = AtomicU32::new(0);

/// Milliseconds elapsed since boot. Wraps after ~49.7 days; compare with
/// `wrapping_sub`.
pub fn millis() -> u32 {
    MILLIS.load(Ordering::Relaxed)
}

/// Advance the clock by hand. Host testing only; on the target the tick
/// interrupt owns the counter.
#[cfg(any(test, feature = "std-shim"))]
pub fn advance_millis(ms: u32) {
    MILLIS.fetch_add(ms, Ordering::Relaxed);
}

/// Driver interface for a general-purpose periodic timer usable as the
/// tick source.
///
/// The kernel consumes this when the application calls
/// [`crate::Threads::set_micro_timer`]; implementations wrap whatever
/// peripheral the board provides.
pub trait TickTimer {
    /// Start the timer firing `isr` every `tick_micros` microseconds.
    /// Returns `false` when the interval cannot be programmed.
    fn begin(&mut self, isr: unsafe extern "C" fn(), tick_micros: u32) -> bool;

    /// Set the timer's interrupt priority. The kernel asks for the lowest.
    fn set_priority(&mut self, level: u8);

    /// Address of the pending-flag register the switch stub must write to
    /// acknowledge each tick.
    fn flag_addr(&self) -> *mut u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TimerError;
    use crate::kernel::{threads, TEST_GUARD};

    struct MockTimer {
        flag: u32,
        begun_with: Option<u32>,
        priority: Option<u8>,
    }

    impl MockTimer {
        fn new() -> Self {
            Self {
                flag: 0,
                begun_with: None,
                priority: None,
            }
        }
    }

    impl TickTimer for MockTimer {
        fn begin(&mut self, _isr: unsafe extern "C" fn(), tick_micros: u32) -> bool {
            self.begun_with = Some(tick_micros);
            true
        }

        fn set_priority(&mut self, level: u8) {
            self.priority = Some(level);
        }

        fn flag_addr(&self) -> *mut u32 {
            &self.flag as *const u32 as *mut u32
        }
    }

    struct BrokenTimer;

    impl TickTimer for BrokenTimer {
        fn begin(&mut self, _isr: unsafe extern "C" fn(), _tick_micros: u32) -> bool {
            false
        }

        fn set_priority(&mut self, _level: u8) {}

        fn flag_addr(&self) -> *mut u32 {
            core::ptr::null_mut()
        }
    }

    #[test]
    fn clock_is_monotonic() {
        let before = millis();
        advance_millis(3);
        assert!(millis().wrapping_sub(before) >= 3);
    }

    #[test]
    fn micro_timer_takes_over_the_tick() {
        let _test = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let mut timer = MockTimer::new();
        threads.set_micro_timer(&mut timer, 100).unwrap();

        assert_eq!(timer.begun_with, Some(100));
        assert_eq!(timer.priority, Some(255));
        assert!(!threads.test_use_systick());
        assert_eq!(threads.test_timer_flag(), timer.flag_addr());
    }

    #[test]
    fn refused_timer_reports_unavailable() {
        let _test = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let mut timer = BrokenTimer;
        assert_eq!(
            threads.set_micro_timer(&mut timer, 100),
            Err(TimerError::Unavailable)
        );
        // Still on SysTick after the failure.
        assert!(threads.test_use_systick());
    }

    #[test]
    fn slice_micros_means_one_tick_per_slice() {
        let _test = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let mut timer = MockTimer::new();
        threads.set_slice_micros(&mut timer, 250).unwrap();

        assert_eq!(timer.begun_with, Some(250));

        extern "C" fn idle(_arg: usize) {}
        let id = threads.add_thread(idle, 0).unwrap();
        assert_eq!(threads.test_ticks_of(id), 0);
    }

    #[test]
    fn slice_millis_on_systick_only_adjusts_the_default() {
        let _test = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let mut timer = MockTimer::new();
        threads.set_slice_millis(&mut timer, 5).unwrap();

        // No switch away from SysTick.
        assert_eq!(timer.begun_with, None);
        assert!(threads.test_use_systick());

        extern "C" fn idle(_arg: usize) {}
        let id = threads.add_thread(idle, 0).unwrap();
        assert_eq!(threads.test_ticks_of(id), 4);
    }

    #[test]
    fn slice_millis_reprograms_a_running_micro_timer() {
        let _test = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let mut timer = MockTimer::new();
        threads.set_micro_timer(&mut timer, 100).unwrap();
        threads.set_slice_millis(&mut timer, 2).unwrap();

        assert_eq!(timer.begun_with, Some(2_000));
    }
}
