//! Error types for the threading kernel.
//!
//! All fallible operations return these enums instead of the raw sentinel
//! integers a C API would use. Misuse cases (killing slot 0, unlocking an
//! unheld mutex) are documented no-ops and never produce an error.

use core::fmt;

/// Result type for threading operations.
pub type ThreadsResult<T> = Result<T, ThreadsError>;

/// Top-level error type for all threading operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadsError {
    /// Thread creation errors
    Spawn(SpawnError),
    /// Timed wait errors
    Wait(WaitError),
    /// Tick source errors
    Timer(TimerError),
}

/// Errors that can occur while creating a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// Every slot in the thread table is occupied
    TableFull,
    /// The heap could not provide a default stack
    StackAlloc,
    /// The provided stack region cannot hold an initial frame
    StackTooSmall(usize),
}

/// Errors that can occur while waiting on another thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The target stayed Running past the deadline
    Timeout,
    /// The id does not name a usable slot
    BadId(usize),
}

/// Errors from configuring the tick source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// The periodic timer driver refused the requested interval
    Unavailable,
}

impl fmt::Display for ThreadsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadsError::Spawn(e) => write!(f, "thread spawn error: {}", e),
            ThreadsError::Wait(e) => write!(f, "thread wait error: {}", e),
            ThreadsError::Timer(e) => write!(f, "tick timer error: {}", e),
        }
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::TableFull => write!(f, "thread table is full"),
            SpawnError::StackAlloc => write!(f, "stack allocation failed"),
            SpawnError::StackTooSmall(size) => write!(f, "stack of {} bytes is too small", size),
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "wait timed out"),
            WaitError::BadId(id) => write!(f, "invalid thread id {}", id),
        }
    }
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::Unavailable => write!(f, "periodic timer unavailable"),
        }
    }
}

impl From<SpawnError> for ThreadsError {
    fn from(error: SpawnError) -> Self {
        ThreadsError::Spawn(error)
    }
}

impl From<WaitError> for ThreadsError {
    fn from(error: WaitError) -> Self {
        ThreadsError::Wait(error)
    }
}

impl From<TimerError> for ThreadsError {
    fn from(error: TimerError) -> Self {
        ThreadsError::Timer(error)
    }
}
