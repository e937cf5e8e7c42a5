//! Synchronization primitives built on the scheduler.

pub mod mutex;
pub mod suspend;

pub use mutex::{Mutex, MutexGuard};
pub use suspend::SuspendGuard;
