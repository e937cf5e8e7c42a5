//! Thread identity, state, and the thread-control block.

use crate::arch::frame::{ContextSave, EXC_RETURN_MSP};
use crate::mem::Stack;
use crate::sched::DEFAULT_TICKS;

/// Identifier of a thread table slot.
///
/// Slot 0 is the initial main context; ids for created threads come from
/// [`crate::Threads::add_thread`] and friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) usize);

impl ThreadId {
    /// The main context, always present in slot 0.
    pub const MAIN: ThreadId = ThreadId(0);

    /// Get the raw slot index.
    pub fn get(self) -> usize {
        self.0
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling state of a table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Slot has never held a thread
    Empty = 0,
    /// Schedulable
    Running = 1,
    /// Finished or killed; slot is reusable
    Ended = 2,
    /// Parked until restarted
    Suspended = 3,
}

/// Thread-control block, one per slot.
///
/// Mutated only with scheduling disabled or from the switch stub itself.
/// `sp` is meaningful only while the thread is not current; it then points
/// at the saved exception frame inside the thread's stack region.
pub(crate) struct Tcb {
    pub(crate) state: ThreadState,
    pub(crate) stack: Option<Stack>,
    pub(crate) sp: *mut u8,
    pub(crate) save: ContextSave,
    pub(crate) ticks: u32,
    pub(crate) priority: u32,
}

impl Tcb {
    pub(crate) const fn empty() -> Self {
        Self {
            state: ThreadState::Empty,
            stack: None,
            sp: core::ptr::null_mut(),
            save: ContextSave::zeroed_with(0),
            ticks: DEFAULT_TICKS,
            priority: 0,
        }
    }

    /// Slot 0: the context that called into the kernel first. Runs on the
    /// main stack and owns no stack region of its own.
    pub(crate) const fn main() -> Self {
        Self {
            state: ThreadState::Running,
            stack: None,
            sp: core::ptr::null_mut(),
            save: ContextSave::zeroed_with(EXC_RETURN_MSP),
            ticks: DEFAULT_TICKS,
            priority: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_slot_starts_unschedulable() {
        let tcb = Tcb::empty();
        assert_eq!(tcb.state, ThreadState::Empty);
        assert!(tcb.stack.is_none());
        assert_eq!(tcb.priority, 0);
    }

    #[test]
    fn main_slot_is_born_running() {
        let tcb = Tcb::main();
        assert_eq!(tcb.state, ThreadState::Running);
        assert!(tcb.stack.is_none());
        assert_eq!(tcb.save.exc_return, 0xFFFF_FFF9);
    }

    #[test]
    fn thread_id_display_is_the_slot_index() {
        extern crate std;
        use std::string::ToString;
        assert_eq!(ThreadId(3).to_string(), "3");
        assert_eq!(ThreadId::MAIN.get(), 0);
    }
}
