//! Scheduler core: the fixed thread table, the selection algorithm, and the
//! hot mirror the context-switch stub works from.
//!
//! Selection is two-pass. A priority pass picks the first Running slot
//! carrying a one-shot boost (lowest index wins) and consumes the boost.
//! Failing that, a round-robin pass advances from the current slot, skipping
//! everything that is not Running, with slot 0 as the wrap-around fallback;
//! slot 0 hosts the main context and is never destroyed.
//!
//! Everything here is pure in-memory state manipulation so it runs
//! unmodified in host tests; hardware stays behind [`crate::arch`].

use crate::arch::frame::ContextSave;
use crate::thread::{Tcb, ThreadState};
use core::mem::offset_of;

/// Number of slots in the thread table, including slot 0.
pub const MAX_THREADS: usize = 16;

/// Default time slice, stored minus one: ten ticks of residence.
pub(crate) const DEFAULT_TICKS: u32 = 9;

/// Default size of kernel-allocated stacks.
pub(crate) const DEFAULT_STACK_SIZE: usize = 1024;

/// Whether the scheduler acts on tick and yield traps.
///
/// `Stopped` makes the switch stub return without scheduling; it doubles as
/// the sentinel the scoped suspend guard writes. `FirstRun` is the boot
/// value, replaced by `Started` when the first thread is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ActiveState {
    Stopped = 0,
    FirstRun = 1,
    Started = 2,
}

impl ActiveState {
    pub(crate) fn from_u32(v: u32) -> Self {
        match v {
            0 => ActiveState::Stopped,
            1 => ActiveState::FirstRun,
            _ => ActiveState::Started,
        }
    }
}

/// Hot mirror of the current thread's scheduling state.
///
/// The context-switch stub addresses these fields by the `O_*` offsets, so
/// the layout is frozen. The mirror is a cache of `table[current]`, never
/// the source of truth; [`ThreadTable::next_thread`] is the only writer of
/// the pointer fields.
#[repr(C)]
pub(crate) struct SwitchContext {
    /// [`ActiveState`] as a raw word
    pub(crate) active: u32,
    /// Ticks left in the current slice; the stub decrements and switches
    /// when it goes negative
    pub(crate) count: i32,
    /// Save area of the current thread
    pub(crate) save: *mut ContextSave,
    /// Saved stack pointer of the current thread
    pub(crate) sp: *mut u8,
    /// Non-zero while slot 0 (MSP context) is current
    pub(crate) use_main_stack: u32,
    /// Non-zero while SysTick drives the tick
    pub(crate) use_systick: u32,
    /// Pending-flag register of the periodic timer, or null
    pub(crate) timer_flag: *mut u32,
}

impl SwitchContext {
    pub(crate) const O_ACTIVE: usize = offset_of!(SwitchContext, active);
    pub(crate) const O_COUNT: usize = offset_of!(SwitchContext, count);
    pub(crate) const O_SAVE: usize = offset_of!(SwitchContext, save);
    pub(crate) const O_SP: usize = offset_of!(SwitchContext, sp);
    pub(crate) const O_USE_MAIN_STACK: usize = offset_of!(SwitchContext, use_main_stack);
    pub(crate) const O_USE_SYSTICK: usize = offset_of!(SwitchContext, use_systick);
    pub(crate) const O_TIMER_FLAG: usize = offset_of!(SwitchContext, timer_flag);

    pub(crate) const fn new() -> Self {
        // Boots Stopped: the stub must not walk a null save pointer if a
        // tick fires before `Threads::init` binds the mirror to slot 0.
        Self {
            active: ActiveState::Stopped as u32,
            count: DEFAULT_TICKS as i32,
            save: core::ptr::null_mut(),
            sp: core::ptr::null_mut(),
            use_main_stack: 1,
            use_systick: 1,
            timer_flag: core::ptr::null_mut(),
        }
    }
}

/// The fixed table of thread-control blocks plus scheduling bookkeeping.
pub(crate) struct ThreadTable {
    pub(crate) tcbs: [Tcb; MAX_THREADS],
    pub(crate) current: usize,
    /// Slots above 0 currently Running
    pub(crate) thread_count: usize,
    pub(crate) default_ticks: u32,
    pub(crate) default_stack_size: usize,
}

impl ThreadTable {
    pub(crate) const fn new() -> Self {
        const EMPTY: Tcb = Tcb::empty();
        // Slot 0 is the main context; the literal keeps construction free of
        // drops so the table can live in a static.
        Self {
            tcbs: [
                Tcb::main(),
                EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY,
                EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY, EMPTY,
            ],
            current: 0,
            thread_count: 0,
            default_ticks: DEFAULT_TICKS,
            default_stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Find a reusable slot, excluding slot 0.
    pub(crate) fn claim_slot(&mut self) -> Option<usize> {
        (1..MAX_THREADS).find(|&i| {
            matches!(
                self.tcbs[i].state,
                ThreadState::Empty | ThreadState::Ended
            )
        })
    }

    /// Point the mirror's cached fields at `table[current]`.
    pub(crate) fn refresh_mirror(&mut self, ctx: &mut SwitchContext) {
        let current = self.current;
        let tcb = &mut self.tcbs[current];
        ctx.save = &mut tcb.save;
        ctx.sp = tcb.sp;
        ctx.use_main_stack = (current == 0) as u32;
    }

    /// Select the next thread. Called only from the switch stub, after the
    /// outgoing context's SP has been stored into the mirror.
    pub(crate) fn next_thread(&mut self, ctx: &mut SwitchContext) {
        debug_assert_eq!(
            ctx.save,
            &mut self.tcbs[self.current].save as *mut ContextSave,
            "mirror out of sync with table on stub entry"
        );

        // Outgoing SP, as recorded by the stub.
        self.tcbs[self.current].sp = ctx.sp;

        // Priority pass: first Running slot with a pending boost.
        let boosted = (0..MAX_THREADS).find(|&i| {
            self.tcbs[i].priority != 0 && self.tcbs[i].state == ThreadState::Running
        });

        if let Some(i) = boosted {
            self.current = i;
            self.tcbs[i].priority = 0;
            ctx.count = self.tcbs[i].ticks as i32;
        } else {
            // Round-robin pass. Slot 0 is the guaranteed wrap fallback.
            loop {
                self.current += 1;
                if self.current >= MAX_THREADS {
                    self.current = 0;
                    break;
                }
                if self.tcbs[self.current].state == ThreadState::Running {
                    break;
                }
            }
            ctx.count = self.tcbs[self.current].ticks as i32;
        }

        self.refresh_mirror(ctx);
    }
}
