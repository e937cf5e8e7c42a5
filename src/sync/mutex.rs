//! Binary mutex with a yielding hand-off.
//!
//! The lock tracks at most one waiter, by thread id. The first thread to
//! find the lock held suspends itself and records its id and remaining
//! slice; `unlock` re-animates it with a one-shot priority boost sized to
//! that remaining slice and yields the CPU straight to it. Any further
//! contenders poll through plain yields; fair queueing is out of scope.
//!
//! All state transitions run with scheduling stopped, which makes them
//! atomic with respect to the tick handler.

use crate::arch::{Arch, DefaultArch as A};
use crate::kernel::threads;
use crate::thread::ThreadId;
use crate::time;
use core::cell::UnsafeCell;

struct MutexInner {
    /// 0 free, 1 held
    state: u32,
    /// The single tracked waiter
    wait_thread: Option<ThreadId>,
    /// Waiter's remaining slice, replayed as its boost on hand-off
    wait_count: u32,
}

/// A binary lock usable from any thread.
pub struct Mutex {
    inner: UnsafeCell<MutexInner>,
}

// Guarded by scheduler stop on every access.
unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(MutexInner {
                state: 0,
                wait_thread: None,
                wait_count: 0,
            }),
        }
    }

    /// Acquire without blocking. Atomic with respect to the scheduler.
    pub fn try_lock(&self) -> bool {
        let threads = threads();
        let prev = threads.stop();
        let inner = unsafe { &mut *self.inner.get() };
        let acquired = if inner.state == 0 {
            inner.state = 1;
            true
        } else {
            false
        };
        threads.start(prev);
        acquired
    }

    /// Acquire, yielding until the lock is free. `timeout_ms == 0` waits
    /// forever; otherwise returns `false` once the deadline passes.
    pub fn lock(&self, timeout_ms: u32) -> bool {
        if self.try_lock() {
            A::dmb();
            return true;
        }

        let threads = threads();
        let start = time::millis();
        loop {
            if self.try_lock() {
                A::dmb();
                return true;
            }
            if timeout_ms != 0 && time::millis().wrapping_sub(start) > timeout_ms {
                self.abandon_wait();
                return false;
            }

            let prev = threads.stop();
            let inner = unsafe { &mut *self.inner.get() };
            if inner.wait_thread.is_none() {
                let me = threads.id();
                inner.wait_thread = Some(me);
                inner.wait_count = threads.current_slice_remaining();
                threads.suspend(me);
            }
            threads.start(prev);

            threads.yield_now();
        }
    }

    /// Acquire and return a guard that unlocks on drop. Waits forever.
    pub fn lock_guard(&self) -> MutexGuard<'_> {
        self.lock(0);
        MutexGuard { mutex: self }
    }

    /// Release the lock.
    ///
    /// If a waiter is recorded it is made Running, boosted to run next, and
    /// the CPU is handed over immediately. Unlocking an unheld mutex has no
    /// effect.
    pub fn unlock(&self) {
        let threads = threads();
        let prev = threads.stop();
        let inner = unsafe { &mut *self.inner.get() };
        if inner.state == 1 {
            inner.state = 0;
            if let Some(waiter) = inner.wait_thread.take() {
                threads.set_priority(waiter, inner.wait_count);
                threads.restart(waiter);
                A::dmb();
                // Re-enables scheduling and switches in one trap; the saved
                // `prev` is deliberately dropped on this path.
                threads.yield_and_start();
                return;
            }
        }
        A::dmb();
        threads.start(prev);
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        let threads = threads();
        let prev = threads.stop();
        let state = unsafe { (*self.inner.get()).state };
        threads.start(prev);
        state != 0
    }

    /// Drop a timed-out waiter registration left by [`Mutex::lock`].
    fn abandon_wait(&self) {
        let threads = threads();
        let prev = threads.stop();
        let inner = unsafe { &mut *self.inner.get() };
        let me = threads.id();
        if inner.wait_thread == Some(me) {
            inner.wait_thread = None;
            threads.restart(me);
        }
        threads.start(prev);
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII lock handle returned by [`Mutex::lock_guard`].
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
