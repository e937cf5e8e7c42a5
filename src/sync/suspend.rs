//! Scoped scheduler suspension.

use crate::kernel::threads;
use crate::sched::ActiveState;

/// Disables preemption for the lifetime of the guard.
///
/// Construction saves the scheduling state and stops the scheduler; drop
/// restores what was saved, so guards nest correctly and release on every
/// exit path, including unwinds and early returns.
///
/// The tick interrupt still fires inside the scope; it just declines to
/// switch. Keep the scope short.
pub struct SuspendGuard {
    saved: ActiveState,
}

impl SuspendGuard {
    pub fn new() -> Self {
        Self {
            saved: threads().stop(),
        }
    }
}

impl Default for SuspendGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SuspendGuard {
    fn drop(&mut self) {
        threads().start(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::TEST_GUARD;

    #[test]
    fn guard_stops_and_restores_scheduling() {
        let _test = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();
        threads.start(ActiveState::Started);

        {
            let _guard = SuspendGuard::new();
            assert_eq!(threads.active_state(), ActiveState::Stopped);
        }
        assert_eq!(threads.active_state(), ActiveState::Started);
    }

    #[test]
    fn guards_nest() {
        let _test = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();
        threads.start(ActiveState::Started);

        let outer = SuspendGuard::new();
        assert_eq!(threads.active_state(), ActiveState::Stopped);
        {
            let _inner = SuspendGuard::new();
            assert_eq!(threads.active_state(), ActiveState::Stopped);
        }
        // Inner exit must not resume early.
        assert_eq!(threads.active_state(), ActiveState::Stopped);
        drop(outer);
        assert_eq!(threads.active_state(), ActiveState::Started);
    }

    #[test]
    fn guard_preserves_the_boot_state() {
        let _test = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        {
            let _guard = SuspendGuard::new();
        }
        assert_eq!(threads.active_state(), ActiveState::FirstRun);
    }
}
