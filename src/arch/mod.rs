//! Architecture abstraction layer.
//!
//! The kernel's state machines are hardware-independent; everything that
//! touches the CPU goes through the [`Arch`] trait. The real implementation
//! lives in [`armv7m`] and is compiled only for ARM targets. Everywhere else
//! a no-op host implementation stands in so the kernel logic can run under
//! `cargo test` on a development machine.

pub mod frame;

pub use frame::{ContextSave, ExceptionFrame, ThreadFn};

/// Architecture abstraction trait.
///
/// Implementations provide the small set of privileged operations the
/// kernel needs: interrupt masking, the data memory barrier issued around
/// context switches, and the supervisor calls that request a cooperative
/// switch.
pub trait Arch {
    /// Run `f` with interrupts masked, restoring the previous mask state
    /// afterwards. Nesting is safe.
    fn with_irqs_masked<R>(f: impl FnOnce() -> R) -> R;

    /// Data memory barrier.
    fn dmb();

    /// Request a cooperative context switch.
    fn svc_yield();

    /// Request a cooperative context switch that also re-enables
    /// scheduling. Used by the mutex hand-off path.
    fn svc_yield_and_start();
}

#[cfg(target_arch = "arm")]
pub mod armv7m;
#[cfg(not(target_arch = "arm"))]
pub mod host;

#[cfg(target_arch = "arm")]
pub use armv7m::CortexM as DefaultArch;
#[cfg(not(target_arch = "arm"))]
pub use host::HostArch as DefaultArch;

/// Periodic-timer tick entry point, handed to [`crate::time::TickTimer::begin`].
#[cfg(target_arch = "arm")]
pub use armv7m::context_switch_pit_isr;
#[cfg(not(target_arch = "arm"))]
pub use host::context_switch_pit_isr;
