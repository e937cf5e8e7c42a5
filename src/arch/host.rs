//! Host stand-in for the Cortex-M layer, used when the crate is compiled
//! for a development machine. Interrupt masking and barriers are no-ops;
//! a yield advances the test clock by one millisecond so that timed loops
//! (`delay`, `wait`, mutex timeouts) make progress without a hardware tick.

use super::Arch;

pub struct HostArch;

impl Arch for HostArch {
    fn with_irqs_masked<R>(f: impl FnOnce() -> R) -> R {
        f()
    }

    fn dmb() {}

    fn svc_yield() {
        #[cfg(any(test, feature = "std-shim"))]
        crate::time::advance_millis(1);
        core::hint::spin_loop();
    }

    fn svc_yield_and_start() {
        // The SVCall dispatcher marks scheduling started before switching;
        // mirror that side effect here.
        crate::kernel::threads().mark_started();
        Self::svc_yield();
    }
}

/// Signature-compatible stand-in for the periodic-timer ISR.
pub unsafe extern "C" fn context_switch_pit_isr() {}
