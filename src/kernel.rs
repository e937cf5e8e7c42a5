//! The kernel singleton: thread lifecycle, scheduling control, and the
//! storage shared with the context-switch stub.
//!
//! The thread table, the hot mirror, and `active` are shared between
//! application code and the tick/SVC handlers. Application-side mutations
//! either stop scheduling for the duration (`stop`/`start` pair, table
//! surgery) or ride on a single interrupt-masked store (state flips). The
//! handlers observe `active == 0` and return without touching anything.

use crate::arch::frame::{self, ContextSave, EXC_RETURN_PSP, MIN_STACK_SIZE, ThreadFn};
use crate::arch::{Arch, DefaultArch as A};
use crate::errors::{SpawnError, TimerError, WaitError};
use crate::mem::Stack;
use crate::sched::{ActiveState, SwitchContext, ThreadTable, MAX_THREADS};
use crate::thread::{ThreadId, ThreadState};
use crate::time::{self, TickTimer};
use core::cell::UnsafeCell;
use portable_atomic::{AtomicBool, Ordering};

extern crate alloc;
use alloc::boxed::Box;

struct TableCell(UnsafeCell<ThreadTable>);

// Shared with the ISR path; every access point is masked or runs with
// scheduling stopped.
unsafe impl Sync for TableCell {}

static TABLE: TableCell = TableCell(UnsafeCell::new(ThreadTable::new()));

pub(crate) struct SwitchCell(UnsafeCell<SwitchContext>);

unsafe impl Sync for SwitchCell {}

/// Hot mirror read by the switch stub. See [`SwitchContext`].
pub(crate) static SWITCH_CTX: SwitchCell = SwitchCell(UnsafeCell::new(SwitchContext::new()));

/// # Safety
///
/// Caller must hold the interrupt mask or have scheduling stopped.
unsafe fn table() -> &'static mut ThreadTable {
    unsafe { &mut *TABLE.0.get() }
}

/// # Safety
///
/// Caller must hold the interrupt mask or have scheduling stopped.
unsafe fn switch_ctx() -> &'static mut SwitchContext {
    unsafe { &mut *SWITCH_CTX.0.get() }
}

/// Scheduler entry invoked by the switch stub after the outgoing stack
/// pointer has been recorded in the mirror.
#[unsafe(no_mangle)]
pub(crate) extern "C" fn switcher_next_thread() {
    unsafe {
        let t = &mut *TABLE.0.get();
        let ctx = &mut *SWITCH_CTX.0.get();
        t.next_thread(ctx);
    }
}

/// Landing pad for a thread function that returns.
///
/// Marks the slot Ended, then parks. The park is load-bearing: the thread
/// keeps running until the next switch, and the scheduler never selects an
/// Ended slot, so control leaves this loop exactly once and never returns.
pub(crate) extern "C" fn thread_exit() -> ! {
    let threads = threads();
    let old = threads.stop();
    unsafe {
        let t = table();
        let current = t.current;
        t.tcbs[current].state = ThreadState::Ended;
        t.thread_count = t.thread_count.saturating_sub(1);
    }
    threads.start(old);
    loop {
        core::hint::spin_loop();
    }
}

static INSTANCE: Threads = Threads {
    initialized: AtomicBool::new(false),
};

/// Handle to the process-wide threading kernel.
pub fn threads() -> &'static Threads {
    &INSTANCE
}

/// The threading kernel. One per process; obtain it with [`threads`].
pub struct Threads {
    initialized: AtomicBool,
}

impl Threads {
    /// Bind the hot mirror to slot 0 (the calling context).
    ///
    /// Runs once; later calls are no-ops. Invoked defensively from
    /// [`Threads::add_thread`], so calling it explicitly is optional.
    pub fn init(&self) {
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        A::with_irqs_masked(|| unsafe {
            let t = table();
            let ctx = switch_ctx();
            t.refresh_mirror(ctx);
            ctx.count = t.default_ticks as i32;
            ctx.active = ActiveState::FirstRun as u32;
        });
    }

    fn ensure_init(&self) {
        if !self.initialized.load(Ordering::Acquire) {
            self.init();
        }
    }

    /// Stop scheduling. Returns the previous state so it can be handed back
    /// to [`Threads::start`].
    pub fn stop(&self) -> ActiveState {
        A::with_irqs_masked(|| unsafe {
            let ctx = switch_ctx();
            let old = ActiveState::from_u32(ctx.active);
            ctx.active = ActiveState::Stopped as u32;
            old
        })
    }

    /// Set the scheduling state, normally to a value a prior
    /// [`Threads::stop`] returned. Returns the state that was replaced.
    pub fn start(&self, state: ActiveState) -> ActiveState {
        A::with_irqs_masked(|| unsafe {
            let ctx = switch_ctx();
            let old = ActiveState::from_u32(ctx.active);
            ctx.active = state as u32;
            old
        })
    }

    pub(crate) fn active_state(&self) -> ActiveState {
        A::with_irqs_masked(|| unsafe { ActiveState::from_u32(switch_ctx().active) })
    }

    #[cfg(not(target_arch = "arm"))]
    pub(crate) fn mark_started(&self) {
        self.start(ActiveState::Started);
    }

    /// Id of the calling thread.
    pub fn id(&self) -> ThreadId {
        A::with_irqs_masked(|| unsafe { ThreadId(table().current) })
    }

    /// Scheduling state of a slot. Out-of-range ids read as `Empty`.
    pub fn state(&self, id: ThreadId) -> ThreadState {
        if id.get() >= MAX_THREADS {
            return ThreadState::Empty;
        }
        A::with_irqs_masked(|| unsafe { table().tcbs[id.get()].state })
    }

    /// Create a thread running `entry(arg)` on a kernel-allocated stack of
    /// the default size.
    ///
    /// The first successful call also starts scheduling.
    pub fn add_thread(&self, entry: ThreadFn, arg: usize) -> Result<ThreadId, SpawnError> {
        self.add_thread_inner(entry, arg, None)
    }

    /// Create a thread on a caller-provided stack.
    pub fn add_thread_with_stack(
        &self,
        entry: ThreadFn,
        arg: usize,
        stack: Stack,
    ) -> Result<ThreadId, SpawnError> {
        self.add_thread_inner(entry, arg, Some(stack))
    }

    /// Create a thread from a closure.
    ///
    /// The closure is boxed and reclaimed by a trampoline on the new
    /// thread's first instruction, so captured state moves with it.
    pub fn spawn<F>(&self, f: F) -> Result<ThreadId, SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        extern "C" fn trampoline<F: FnOnce() + Send + 'static>(arg: usize) {
            let f = unsafe { Box::from_raw(arg as *mut F) };
            f();
        }

        let ptr = Box::into_raw(Box::new(f));
        match self.add_thread(trampoline::<F>, ptr as usize) {
            Ok(id) => Ok(id),
            Err(e) => {
                drop(unsafe { Box::from_raw(ptr) });
                Err(e)
            }
        }
    }

    fn add_thread_inner(
        &self,
        entry: ThreadFn,
        arg: usize,
        stack: Option<Stack>,
    ) -> Result<ThreadId, SpawnError> {
        self.ensure_init();
        let old = self.stop();
        let result = unsafe { self.install(entry, arg, stack) };
        match (&result, old) {
            (Ok(_), ActiveState::Started | ActiveState::FirstRun) => {
                self.start(ActiveState::Started);
            }
            _ => {
                self.start(old);
            }
        }
        result
    }

    /// # Safety
    ///
    /// Scheduling must be stopped.
    unsafe fn install(
        &self,
        entry: ThreadFn,
        arg: usize,
        stack: Option<Stack>,
    ) -> Result<ThreadId, SpawnError> {
        let t = unsafe { table() };
        let slot = t.claim_slot().ok_or(SpawnError::TableFull)?;

        // Lazy free of the previous occupant's stack, before any new
        // allocation.
        t.tcbs[slot].stack = None;

        let stack = match stack {
            Some(stack) => stack,
            None => Stack::with_size(t.default_stack_size).ok_or(SpawnError::StackAlloc)?,
        };
        if stack.size() < MIN_STACK_SIZE {
            return Err(SpawnError::StackTooSmall(stack.size()));
        }

        let sp = unsafe { frame::prepare_stack(stack.base(), stack.size(), entry, arg, thread_exit) };

        let tcb = &mut t.tcbs[slot];
        tcb.sp = sp;
        tcb.stack = Some(stack);
        tcb.ticks = t.default_ticks;
        tcb.priority = 0;
        tcb.save = ContextSave::zeroed_with(EXC_RETURN_PSP);
        tcb.state = ThreadState::Running;
        t.thread_count += 1;

        trace!("thread {=usize} created", slot);
        Ok(ThreadId(slot))
    }

    /// Remove a thread from the schedulable set.
    ///
    /// Asynchronous and cooperative: a currently executing target finishes
    /// its slice first. Killing slot 0 or a stale id is a no-op. The
    /// thread's stack is freed when the slot is next reused.
    pub fn kill(&self, id: ThreadId) {
        let idx = id.get();
        if idx == 0 || idx >= MAX_THREADS {
            return;
        }
        A::with_irqs_masked(|| unsafe {
            let t = table();
            match t.tcbs[idx].state {
                ThreadState::Running => {
                    t.tcbs[idx].state = ThreadState::Ended;
                    t.thread_count -= 1;
                }
                ThreadState::Suspended => {
                    t.tcbs[idx].state = ThreadState::Ended;
                }
                _ => {}
            }
        });
        trace!("thread {=usize} killed", idx);
    }

    /// Park a Running thread until [`Threads::restart`]. Slot 0 must stay
    /// Running, so suspending it is a no-op, like stale ids.
    pub fn suspend(&self, id: ThreadId) {
        let idx = id.get();
        if idx == 0 || idx >= MAX_THREADS {
            return;
        }
        A::with_irqs_masked(|| unsafe {
            let t = table();
            if t.tcbs[idx].state == ThreadState::Running {
                t.tcbs[idx].state = ThreadState::Suspended;
                if idx > 0 {
                    t.thread_count -= 1;
                }
            }
        });
    }

    /// Make a Suspended thread schedulable again. Slot 0 is never in that
    /// state, so it is ignored here as well.
    pub fn restart(&self, id: ThreadId) {
        let idx = id.get();
        if idx == 0 || idx >= MAX_THREADS {
            return;
        }
        A::with_irqs_masked(|| unsafe {
            let t = table();
            if t.tcbs[idx].state == ThreadState::Suspended {
                t.tcbs[idx].state = ThreadState::Running;
                if idx > 0 {
                    t.thread_count += 1;
                }
            }
        });
    }

    /// Block until `id` leaves the Running state. Any non-Running state
    /// counts as done. `timeout_ms == 0` waits forever.
    pub fn wait(&self, id: ThreadId, timeout_ms: u32) -> Result<ThreadId, WaitError> {
        if id.get() >= MAX_THREADS {
            return Err(WaitError::BadId(id.get()));
        }
        let start = time::millis();
        loop {
            if self.state(id) != ThreadState::Running {
                return Ok(id);
            }
            if timeout_ms != 0 && time::millis().wrapping_sub(start) > timeout_ms {
                return Err(WaitError::Timeout);
            }
            A::svc_yield();
        }
    }

    /// Set a thread's time slice in ticks. Takes effect the next time the
    /// thread is selected.
    pub fn set_time_slice(&self, id: ThreadId, ticks: u32) {
        let idx = id.get();
        if idx >= MAX_THREADS {
            return;
        }
        A::with_irqs_masked(|| unsafe {
            table().tcbs[idx].ticks = ticks.saturating_sub(1);
        });
    }

    /// Set the slice newly created threads inherit.
    pub fn set_default_time_slice(&self, ticks: u32) {
        A::with_irqs_masked(|| unsafe {
            table().default_ticks = ticks.saturating_sub(1);
        });
    }

    /// Set the stack size for kernel-allocated stacks.
    pub fn set_default_stack_size(&self, bytes: usize) {
        A::with_irqs_masked(|| unsafe {
            table().default_stack_size = bytes;
        });
    }

    /// One-shot scheduling boost: the target becomes the next selection if
    /// it is Running, and the boost is consumed by that selection.
    pub fn set_priority(&self, id: ThreadId, level: u32) {
        let idx = id.get();
        if idx >= MAX_THREADS {
            return;
        }
        A::with_irqs_masked(|| unsafe {
            table().tcbs[idx].priority = level;
        });
    }

    /// Give up the rest of the current slice.
    pub fn yield_now(&self) {
        A::svc_yield();
    }

    /// Yield that also re-enables scheduling; the mutex hand-off path.
    pub(crate) fn yield_and_start(&self) {
        A::svc_yield_and_start();
    }

    /// Yield repeatedly for at least `ms` milliseconds.
    pub fn delay(&self, ms: u32) {
        let start = time::millis();
        while time::millis().wrapping_sub(start) < ms {
            A::svc_yield();
        }
    }

    /// Ticks left in the current slice, as the stub last saw it.
    pub(crate) fn current_slice_remaining(&self) -> u32 {
        A::with_irqs_masked(|| unsafe { switch_ctx().count.max(0) as u32 })
    }

    /// Bytes of stack consumed, measured at the thread's last suspension.
    /// `None` for slot 0 (main stack) and stale ids.
    pub fn stack_used(&self, id: ThreadId) -> Option<usize> {
        if id.get() >= MAX_THREADS {
            return None;
        }
        A::with_irqs_masked(|| unsafe {
            let tcb = &table().tcbs[id.get()];
            let stack = tcb.stack.as_ref()?;
            debug_assert!(stack.contains(tcb.sp));
            Some(stack.base() as usize + stack.size() - tcb.sp as usize)
        })
    }

    /// Bytes of stack still unused at the thread's last suspension.
    pub fn stack_remaining(&self, id: ThreadId) -> Option<usize> {
        if id.get() >= MAX_THREADS {
            return None;
        }
        A::with_irqs_masked(|| unsafe {
            let tcb = &table().tcbs[id.get()];
            let stack = tcb.stack.as_ref()?;
            Some(tcb.sp as usize - stack.base() as usize)
        })
    }

    /// Move the tick from SysTick to a general-purpose periodic timer
    /// firing every `tick_micros` microseconds. There is no path back.
    pub fn set_micro_timer(
        &self,
        timer: &mut dyn TickTimer,
        tick_micros: u32,
    ) -> Result<(), TimerError> {
        self.ensure_init();
        // Lowest priority so the tick never preempts other handlers.
        timer.set_priority(255);
        if !timer.begin(crate::arch::context_switch_pit_isr, tick_micros) {
            return Err(TimerError::Unavailable);
        }
        let flag = timer.flag_addr();
        A::with_irqs_masked(|| unsafe {
            let ctx = switch_ctx();
            ctx.timer_flag = flag;
            ctx.use_systick = 0;
        });
        trace!("tick moved to periodic timer, {=u32} us", tick_micros);
        Ok(())
    }

    /// Slice length in microseconds: one tick of the periodic timer per
    /// slice.
    pub fn set_slice_micros(
        &self,
        timer: &mut dyn TickTimer,
        micros: u32,
    ) -> Result<(), TimerError> {
        self.set_micro_timer(timer, micros)?;
        self.set_default_time_slice(1);
        Ok(())
    }

    /// Slice length in milliseconds. On SysTick this only adjusts the
    /// default slice; on the periodic timer it re-programs the interval.
    pub fn set_slice_millis(
        &self,
        timer: &mut dyn TickTimer,
        ms: u32,
    ) -> Result<(), TimerError> {
        let on_systick = A::with_irqs_masked(|| unsafe { switch_ctx().use_systick != 0 });
        if on_systick {
            self.set_default_time_slice(ms);
            Ok(())
        } else {
            self.set_slice_micros(timer, ms * 1_000)
        }
    }

    #[cfg(test)]
    pub(crate) fn test_thread_count(&self) -> usize {
        A::with_irqs_masked(|| unsafe { table().thread_count })
    }

    #[cfg(test)]
    pub(crate) fn test_ticks_of(&self, id: ThreadId) -> u32 {
        A::with_irqs_masked(|| unsafe { table().tcbs[id.get()].ticks })
    }

    #[cfg(test)]
    pub(crate) fn test_priority_of(&self, id: ThreadId) -> u32 {
        A::with_irqs_masked(|| unsafe { table().tcbs[id.get()].priority })
    }

    #[cfg(test)]
    pub(crate) fn test_use_systick(&self) -> bool {
        A::with_irqs_masked(|| unsafe { switch_ctx().use_systick != 0 })
    }

    #[cfg(test)]
    pub(crate) fn test_timer_flag(&self) -> *mut u32 {
        A::with_irqs_masked(|| unsafe { switch_ctx().timer_flag })
    }

    /// Put the singleton back into its boot state between tests.
    #[cfg(test)]
    pub(crate) fn test_reset(&self) {
        use crate::sched::{DEFAULT_STACK_SIZE, DEFAULT_TICKS};
        use crate::thread::Tcb;

        A::with_irqs_masked(|| unsafe {
            let t = table();
            for i in 1..MAX_THREADS {
                t.tcbs[i] = Tcb::empty();
            }
            t.tcbs[0].state = ThreadState::Running;
            t.tcbs[0].priority = 0;
            t.tcbs[0].ticks = DEFAULT_TICKS;
            t.current = 0;
            t.thread_count = 0;
            t.default_ticks = DEFAULT_TICKS;
            t.default_stack_size = DEFAULT_STACK_SIZE;

            let ctx = switch_ctx();
            t.refresh_mirror(ctx);
            ctx.active = ActiveState::FirstRun as u32;
            ctx.count = DEFAULT_TICKS as i32;
            ctx.use_systick = 1;
            ctx.timer_flag = core::ptr::null_mut();
        });
        self.initialized.store(true, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) static TEST_GUARD: spin::Mutex<()> = spin::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn spin_forever(_arg: usize) {
        loop {
            core::hint::spin_loop();
        }
    }

    #[test]
    fn slot_is_reused_after_kill() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let first = threads.add_thread(spin_forever, 0).unwrap();
        let second = threads.add_thread(spin_forever, 0).unwrap();
        assert_ne!(first, second);

        threads.kill(first);
        assert_eq!(threads.state(first), ThreadState::Ended);

        let reused = threads.add_thread(spin_forever, 0).unwrap();
        assert_eq!(reused, first);
        assert_eq!(threads.state(reused), ThreadState::Running);
    }

    #[test]
    fn table_capacity_is_enforced() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        for _ in 1..MAX_THREADS {
            threads.add_thread(spin_forever, 0).unwrap();
        }
        assert_eq!(
            threads.add_thread(spin_forever, 0),
            Err(SpawnError::TableFull)
        );
    }

    #[test]
    fn first_thread_starts_scheduling() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        assert_eq!(threads.active_state(), ActiveState::FirstRun);
        threads.add_thread(spin_forever, 0).unwrap();
        assert_eq!(threads.active_state(), ActiveState::Started);
    }

    #[test]
    fn wait_returns_once_the_target_is_not_running() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let id = threads.add_thread(spin_forever, 0).unwrap();
        threads.kill(id);
        assert_eq!(threads.wait(id, 500), Ok(id));
    }

    #[test]
    fn wait_times_out_on_a_running_target() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let id = threads.add_thread(spin_forever, 0).unwrap();
        assert_eq!(threads.wait(id, 30), Err(WaitError::Timeout));
    }

    #[test]
    fn wait_rejects_out_of_range_ids() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        assert_eq!(
            threads.wait(ThreadId(MAX_THREADS), 10),
            Err(WaitError::BadId(MAX_THREADS))
        );
    }

    #[test]
    fn suspend_and_restart_toggle_the_state() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let id = threads.add_thread(spin_forever, 0).unwrap();
        assert_eq!(threads.test_thread_count(), 1);

        threads.suspend(id);
        assert_eq!(threads.state(id), ThreadState::Suspended);
        assert_eq!(threads.test_thread_count(), 0);

        threads.restart(id);
        assert_eq!(threads.state(id), ThreadState::Running);
        assert_eq!(threads.test_thread_count(), 1);
    }

    #[test]
    fn killing_the_main_slot_is_ignored() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        threads.kill(ThreadId::MAIN);
        assert_eq!(threads.state(ThreadId::MAIN), ThreadState::Running);
    }

    #[test]
    fn time_slice_is_stored_minus_one() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let id = threads.add_thread(spin_forever, 0).unwrap();
        threads.set_time_slice(id, 5);
        assert_eq!(threads.test_ticks_of(id), 4);

        threads.set_default_time_slice(20);
        let other = threads.add_thread(spin_forever, 0).unwrap();
        assert_eq!(threads.test_ticks_of(other), 19);
    }

    #[test]
    fn priority_boost_is_recorded() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let id = threads.add_thread(spin_forever, 0).unwrap();
        threads.set_priority(id, 5);
        assert_eq!(threads.test_priority_of(id), 5);
    }

    #[test]
    fn stack_accounting_splits_the_region() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let id = threads.add_thread(spin_forever, 0).unwrap();
        let used = threads.stack_used(id).unwrap();
        let remaining = threads.stack_remaining(id).unwrap();

        // Frame plus alignment pad, measured from the region top.
        assert_eq!(used, 40);
        assert_eq!(used + remaining, 1024);
    }

    #[test]
    fn main_slot_has_no_stack_diagnostics() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        assert_eq!(threads.stack_used(ThreadId::MAIN), None);
    }

    #[test]
    fn custom_stack_is_honored() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let stack = Stack::with_size(4096).unwrap();
        let id = threads.add_thread_with_stack(spin_forever, 0, stack).unwrap();
        let used = threads.stack_used(id).unwrap();
        let remaining = threads.stack_remaining(id).unwrap();
        assert_eq!(used + remaining, 4096);
    }

    #[test]
    fn undersized_stack_is_rejected() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let stack = Stack::with_size(32).unwrap();
        assert_eq!(
            threads.add_thread_with_stack(spin_forever, 0, stack),
            Err(SpawnError::StackTooSmall(32))
        );
    }

    #[test]
    fn spawn_accepts_a_capturing_closure() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let payload = 7usize;
        let id = threads.spawn(move || {
            let _ = payload;
        });
        assert!(id.is_ok());
        assert_eq!(threads.state(id.unwrap()), ThreadState::Running);
    }

    #[test]
    fn delay_advances_with_the_clock() {
        let _guard = TEST_GUARD.lock();
        let threads = threads();
        threads.test_reset();

        let before = time::millis();
        threads.delay(5);
        assert!(time::millis().wrapping_sub(before) >= 5);
    }
}
