//! ARM Cortex-M (Armv7-M and Armv7E-M) implementation.
//!
//! This module owns everything the hardware actually sees: the SysTick and
//! SVCall exception handlers and the context-switch stub they branch into.
//! The stub communicates with the scheduler exclusively through the
//! [`SwitchContext`] hot mirror, reading and writing its fields by the
//! offsets exported below; the scheduler proper runs in Rust via
//! [`crate::kernel::switcher_next_thread`].
//!
//! The handlers are naked functions. On exception entry the CPU has already
//! stacked `r0`-`r3`, `r12`, `lr`, `pc` and `xPSR` onto the outgoing
//! context's stack, so the handler body may clobber only those registers
//! until the callee-saved set has been parked in the save area.

use super::Arch;
use crate::sched::SwitchContext;
use core::arch::naked_asm;

/// SVC immediate requesting a cooperative context switch.
pub(crate) const SVC_YIELD: u32 = 0x21;

/// SVC immediate requesting a switch that first re-enables scheduling.
pub(crate) const SVC_YIELD_AND_START: u32 = 0x22;

/// `active` value stored by the SVC_YIELD_AND_START dispatch path.
const ACTIVE_STARTED: u32 = 2;

pub struct CortexM;

impl Arch for CortexM {
    fn with_irqs_masked<R>(f: impl FnOnce() -> R) -> R {
        cortex_m::interrupt::free(|_| f())
    }

    #[inline(always)]
    fn dmb() {
        cortex_m::asm::dmb();
    }

    #[inline(always)]
    fn svc_yield() {
        unsafe {
            core::arch::asm!("svc #{n}", n = const SVC_YIELD);
        }
    }

    #[inline(always)]
    fn svc_yield_and_start() {
        unsafe {
            core::arch::asm!("svc #{n}", n = const SVC_YIELD_AND_START);
        }
    }
}

/// Program SysTick for a 1 ms tick and enable its interrupt.
///
/// The kernel piggy-backs on SysTick until [`crate::Threads::set_micro_timer`]
/// moves the tick to a general-purpose timer.
pub fn init_systick(syst: &mut cortex_m::peripheral::SYST, core_hz: u32) {
    use cortex_m::peripheral::syst::SystClkSource;

    crate::kernel::threads().init();

    syst.set_clock_source(SystClkSource::Core);
    syst.set_reload(core_hz / 1_000 - 1);
    syst.clear_current();
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Drop SVCall to the lowest exception priority so a cooperative yield never
/// preempts another interrupt handler.
pub fn init_handler_priorities(scb: &mut cortex_m::peripheral::SCB) {
    use cortex_m::peripheral::scb::SystemHandler;

    unsafe {
        scb.set_priority(SystemHandler::SVCall, 0xff);
    }
}

/// SysTick exception handler.
///
/// Bumps the millisecond counter, then branches into the preemptive entry of
/// the switch stub while `use_systick` is set. The branch (rather than a
/// call) preserves `lr`, which still holds the EXC_RETURN value.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
#[unsafe(naked)]
unsafe extern "C" fn SysTick() {
    naked_asm!(
        "
        ldr     r0, ={millis}
        ldr     r1, [r0]
        adds    r1, r1, #1
        str     r1, [r0]
        ldr     r0, ={ctx}
        ldr     r1, [r0, #{o_use_systick}]
        cmp     r1, #0
        bne     {switch}
        bx      lr
        ",
        millis = sym crate::time::MILLIS,
        ctx = sym crate::kernel::SWITCH_CTX,
        o_use_systick = const SwitchContext::O_USE_SYSTICK,
        switch = sym context_switch,
    )
}

/// SVCall exception handler.
///
/// Recovers the SVC immediate from the instruction preceding the stacked
/// `pc` and dispatches the two switch requests. Unknown immediates return
/// untouched.
#[allow(non_snake_case)]
#[unsafe(no_mangle)]
#[unsafe(naked)]
unsafe extern "C" fn SVCall() {
    naked_asm!(
        "
        tst     lr, #4
        ite     eq
        mrseq   r0, msp
        mrsne   r0, psp
        ldr     r1, [r0, #24]
        ldrb    r1, [r1, #-2]
        cmp     r1, #{svc_yield}
        beq     {direct}
        cmp     r1, #{svc_yield_start}
        bne     99f
        ldr     r0, ={ctx}
        movs    r2, #{started}
        str     r2, [r0, #{o_active}]
        b       {direct_active}
    99:
        bx      lr
        ",
        svc_yield = const SVC_YIELD,
        svc_yield_start = const SVC_YIELD_AND_START,
        started = const ACTIVE_STARTED,
        ctx = sym crate::kernel::SWITCH_CTX,
        o_active = const SwitchContext::O_ACTIVE,
        direct = sym context_switch_direct,
        direct_active = sym context_switch_direct_active,
    )
}

/// Preemptive entry, reached from the tick interrupt.
///
/// Returns without switching while scheduling is stopped or the current
/// slice still has ticks left.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn context_switch() {
    naked_asm!(
        "
        ldr     r0, ={ctx}
        ldr     r1, [r0, #{o_active}]
        cmp     r1, #0
        beq     99f
        ldr     r1, [r0, #{o_count}]
        subs    r1, r1, #1
        str     r1, [r0, #{o_count}]
        bge     99f
        b       {direct_active}
    99:
        bx      lr
        ",
        ctx = sym crate::kernel::SWITCH_CTX,
        o_active = const SwitchContext::O_ACTIVE,
        o_count = const SwitchContext::O_COUNT,
        direct_active = sym context_switch_direct_active,
    )
}

/// Cooperative entry (SVC_YIELD): switch immediately unless scheduling is
/// stopped.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn context_switch_direct() {
    naked_asm!(
        "
        ldr     r0, ={ctx}
        ldr     r1, [r0, #{o_active}]
        cmp     r1, #0
        beq     99f
        b       {direct_active}
    99:
        bx      lr
        ",
        ctx = sym crate::kernel::SWITCH_CTX,
        o_active = const SwitchContext::O_ACTIVE,
        direct_active = sym context_switch_direct_active,
    )
}

/// Unconditional save/select/restore. Every switch funnels through here.
///
/// The outgoing context's callee-saved registers and EXC_RETURN go into its
/// save area, its stack pointer into the mirror; the scheduler repoints the
/// mirror at the incoming context and the sequence runs in reverse. The
/// `dmb` gives cross-thread writes a consistent view on every switch.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn context_switch_direct_active() {
    naked_asm!(
        "
        ldr     r0, ={ctx}
        ldr     r2, [r0, #{o_save}]
        stmia   r2!, {{r4-r11}}
        str     lr, [r2]
        ldr     r1, [r0, #{o_main_stack}]
        cmp     r1, #0
        ite     eq
        mrseq   r3, psp
        mrsne   r3, msp
        str     r3, [r0, #{o_sp}]
        bl      {next}
        ldr     r0, ={ctx}
        ldr     r1, [r0, #{o_main_stack}]
        ldr     r3, [r0, #{o_sp}]
        cmp     r1, #0
        ite     eq
        msreq   psp, r3
        msrne   msp, r3
        ldr     r2, [r0, #{o_save}]
        ldmia   r2!, {{r4-r11}}
        ldr     lr, [r2]
        dmb
        bx      lr
        ",
        ctx = sym crate::kernel::SWITCH_CTX,
        o_save = const SwitchContext::O_SAVE,
        o_sp = const SwitchContext::O_SP,
        o_main_stack = const SwitchContext::O_USE_MAIN_STACK,
        next = sym crate::kernel::switcher_next_thread,
    )
}

/// Tick entry for a general-purpose periodic timer. Acknowledges the
/// timer's pending flag, then behaves exactly like the SysTick path.
#[unsafe(no_mangle)]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch_pit_isr() {
    naked_asm!(
        "
        ldr     r0, ={ctx}
        ldr     r1, [r0, #{o_timer_flag}]
        cmp     r1, #0
        beq     98f
        movs    r2, #1
        str     r2, [r1]
    98:
        b       {switch}
        ",
        ctx = sym crate::kernel::SWITCH_CTX,
        o_timer_flag = const SwitchContext::O_TIMER_FLAG,
        switch = sym context_switch,
    )
}
