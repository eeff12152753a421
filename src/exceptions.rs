// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! EL3 exception vectors and running the non-secure world.

use crate::context::{EntryPointInfo, ExecutionState};
use arm_sysregs::{ScrEl3, SctlrEl2, write_scr_el3, write_sctlr_el2};
#[cfg(not(test))]
use core::arch::asm;
use core::fmt::{self, Display, Formatter};
use log::trace;

/// Reset value for `SCTLR_EL2` with all RES1 bits set, MMU and caches off and little-endian data
/// accesses.
const SCTLR_EL2_RESET_VAL: u64 = 0x30c5_0830;

/// Exception class of an SMC from AArch32 state.
const EC_SMC32: u64 = 0x13;
/// Exception class of an SMC from AArch64 state.
const EC_SMC64: u64 = 0x17;
const ESR_EC_SHIFT: u64 = 26;
const ESR_EC_MASK: u64 = 0x3f;

/// The kind of exception, as recorded by the vector table entry which took it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum ExceptionKind {
    Sync = 0,
    Irq = 1,
    Fiq = 2,
    SError = 3,
}

impl ExceptionKind {
    fn from_raw(raw: u64) -> Self {
        match raw {
            0 => Self::Sync,
            1 => Self::Irq,
            2 => Self::Fiq,
            3 => Self::SError,
            _ => panic!("Invalid exception kind {raw}"),
        }
    }
}

impl Display for ExceptionKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            Self::Sync => "synchronous",
            Self::Irq => "IRQ",
            Self::Fiq => "FIQ",
            Self::SError => "SError",
        };
        f.write_str(name)
    }
}

/// Describes the reason why execution returned to EL3 after running a lower EL.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunResult {
    /// The lower EL executed an SMC instruction.
    Smc,
    /// A FIQ routed to EL3 was taken while running the lower EL.
    Fiq,
}

impl RunResult {
    /// Works out why the lower EL exited, panicking if it is not something BL31 handles.
    fn classify(kind: ExceptionKind, esr: u64, elr: u64) -> Self {
        match kind {
            ExceptionKind::Sync
                if matches!((esr >> ESR_EC_SHIFT) & ESR_EC_MASK, EC_SMC32 | EC_SMC64) =>
            {
                Self::Smc
            }
            ExceptionKind::Fiq => Self::Fiq,
            _ => panic!("Unexpected {kind} exception from lower EL, ESR {esr:#x}, ELR {elr:#x}"),
        }
    }
}

/// The saved state of the lower EL while EL3 is running.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct WorldContext {
    /// General purpose registers `x0` to `x30`.
    pub gpregs: [u64; 31],
    /// EL3's own stack pointer while the lower EL runs.
    el3_sp: u64,
    pub elr_el3: u64,
    pub spsr_el3: u64,
}

impl WorldContext {
    /// Returns the context for entering the given image for the first time.
    pub fn new(entry_point: &EntryPointInfo) -> Self {
        let mut gpregs = [0; 31];
        gpregs[..entry_point.args.len()].copy_from_slice(&entry_point.args);
        Self {
            gpregs,
            el3_sp: 0,
            elr_el3: entry_point.pc as u64,
            spsr_el3: entry_point.spsr.bits(),
        }
    }
}

/// Returns the `SCR_EL3` value for running the non-secure world in the given execution state, with
/// the given interrupt routing.
pub fn non_secure_scr(execution_state: ExecutionState, routing: ScrEl3) -> ScrEl3 {
    let mut scr = ScrEl3::RES1 | ScrEl3::NS | ScrEl3::HCE | ScrEl3::SIF | routing;
    if execution_state == ExecutionState::AArch64 {
        scr |= ScrEl3::RW;
    }
    scr
}

/// Prepares the EL3 and EL2 system registers for running the given image in the non-secure world.
pub fn prepare_non_secure_entry(entry_point: &EntryPointInfo, routing: ScrEl3) {
    let execution_state = entry_point.execution_state();
    // SAFETY: BL31 itself runs at EL3 and doesn't depend on SCR_EL3, which only affects the lower
    // ELs that are entered afterwards.
    unsafe {
        write_scr_el3(non_secure_scr(execution_state, routing));
    }
    if execution_state == ExecutionState::AArch64 {
        // SAFETY: EL2 isn't running yet, the non-secure image is entered there with this state.
        unsafe {
            write_sctlr_el2(SctlrEl2::from_bits_retain(SCTLR_EL2_RESET_VAL));
        }
    }
}

/// Runs the lower EL with the given context until it next traps to EL3.
///
/// The context's registers are loaded and EL3 returns to `elr_el3` with `spsr_el3`. When an
/// exception from the lower EL is taken, its registers are saved back into `context` and the
/// reason is returned.
pub fn enter_world(context: &mut WorldContext) -> RunResult {
    trace!(
        "Entering lower EL at {:#x} with SPSR {:#x}",
        context.elr_el3, context.spsr_el3
    );

    let kind: u64;
    let esr: u64;

    // SAFETY: The context is a valid `WorldContext`, which `el3_exit` uses until the lower EL
    // traps back to EL3. `el3_exit` preserves the callee-saved registers and stack pointer.
    #[cfg(not(test))]
    unsafe {
        asm!(
            "bl el3_exit",
            inout("x0") &raw mut *context => kind,
            lateout("x1") esr,
            clobber_abi("C"),
        );
    }
    #[cfg(test)]
    {
        kind = ExceptionKind::Sync as u64;
        esr = EC_SMC64 << ESR_EC_SHIFT;
    }

    let result = RunResult::classify(ExceptionKind::from_raw(kind), esr, context.elr_el3);
    trace!("Returned from lower EL with result {result:?}");
    result
}

/// Handles an exception taken from EL3 itself, which is always fatal.
#[cfg_attr(test, allow(unused))]
extern "C" fn unexpected_el3_exception(kind: u64, esr: u64, elr: u64) -> ! {
    panic!(
        "Unexpected {} exception at EL3, ESR {esr:#x}, ELR {elr:#x}",
        ExceptionKind::from_raw(kind)
    );
}

#[cfg(all(target_arch = "aarch64", not(test)))]
mod asm {
    use super::*;
    use core::{arch::global_asm, mem::offset_of};

    global_asm!(
        // Fatal exception taken at EL3.
        ".macro el3_unexpected kind",
        "  .balign 0x80",
        "  mov x0, #\\kind",
        "  mrs x1, esr_el3",
        "  mrs x2, elr_el3",
        "  b {unexpected_el3_exception}",
        ".endm",

        // Exception from the lower EL. SP points at its `WorldContext` while it runs.
        ".macro lower_el kind",
        "  .balign 0x80",
        "  stp x0, x1, [sp, #0x00]",
        "  mov x0, #\\kind",
        "  b lower_el_exit",
        ".endm",

        ".section .text.vectors, \"ax\"",
        ".balign 0x800",
        ".global el3_vectors",
        "el3_vectors:",
        // Current EL with SP0.
        "el3_unexpected {SYNC}",
        "el3_unexpected {IRQ}",
        "el3_unexpected {FIQ}",
        "el3_unexpected {SERROR}",
        // Current EL with SPx.
        "el3_unexpected {SYNC}",
        "el3_unexpected {IRQ}",
        "el3_unexpected {FIQ}",
        "el3_unexpected {SERROR}",
        // Lower EL using AArch64.
        "lower_el {SYNC}",
        "lower_el {IRQ}",
        "lower_el {FIQ}",
        "lower_el {SERROR}",
        // Lower EL using AArch32.
        "lower_el {SYNC}",
        "lower_el {IRQ}",
        "lower_el {FIQ}",
        "lower_el {SERROR}",

        // Saves the lower EL's registers, switches back to the EL3 stack and returns from
        // `el3_exit` with the exception kind in x0 and ESR_EL3 in x1.
        "lower_el_exit:",
        "  stp x2, x3, [sp, #0x10]",
        "  stp x4, x5, [sp, #0x20]",
        "  stp x6, x7, [sp, #0x30]",
        "  stp x8, x9, [sp, #0x40]",
        "  stp x10, x11, [sp, #0x50]",
        "  stp x12, x13, [sp, #0x60]",
        "  stp x14, x15, [sp, #0x70]",
        "  stp x16, x17, [sp, #0x80]",
        "  stp x18, x19, [sp, #0x90]",
        "  stp x20, x21, [sp, #0xa0]",
        "  stp x22, x23, [sp, #0xb0]",
        "  stp x24, x25, [sp, #0xc0]",
        "  stp x26, x27, [sp, #0xd0]",
        "  stp x28, x29, [sp, #0xe0]",
        "  str x30, [sp, #0xf0]",
        "  mrs x2, elr_el3",
        "  mrs x3, spsr_el3",
        "  stp x2, x3, [sp, #{ELR_OFFSET}]",
        "  mrs x1, esr_el3",
        "  ldr x2, [sp, #{EL3_SP_OFFSET}]",
        "  mov sp, x2",
        "  ldp x18, x19, [sp], #16",
        "  ldp x20, x21, [sp], #16",
        "  ldp x22, x23, [sp], #16",
        "  ldp x24, x25, [sp], #16",
        "  ldp x26, x27, [sp], #16",
        "  ldp x28, x29, [sp], #16",
        "  ldr x30, [sp], #16",
        "  ret",

        // Enters the lower EL with the `WorldContext` in x0.
        ".section .text.el3_exit, \"ax\"",
        ".global el3_exit",
        "el3_exit:",
        "  str x30, [sp, #-16]!",
        "  stp x28, x29, [sp, #-16]!",
        "  stp x26, x27, [sp, #-16]!",
        "  stp x24, x25, [sp, #-16]!",
        "  stp x22, x23, [sp, #-16]!",
        "  stp x20, x21, [sp, #-16]!",
        "  stp x18, x19, [sp, #-16]!",
        "  mov x1, sp",
        "  str x1, [x0, #{EL3_SP_OFFSET}]",
        "  ldp x1, x2, [x0, #{ELR_OFFSET}]",
        "  msr elr_el3, x1",
        "  msr spsr_el3, x2",
        "  mov sp, x0",
        "  ldp x2, x3, [sp, #0x10]",
        "  ldp x4, x5, [sp, #0x20]",
        "  ldp x6, x7, [sp, #0x30]",
        "  ldp x8, x9, [sp, #0x40]",
        "  ldp x10, x11, [sp, #0x50]",
        "  ldp x12, x13, [sp, #0x60]",
        "  ldp x14, x15, [sp, #0x70]",
        "  ldp x16, x17, [sp, #0x80]",
        "  ldp x18, x19, [sp, #0x90]",
        "  ldp x20, x21, [sp, #0xa0]",
        "  ldp x22, x23, [sp, #0xb0]",
        "  ldp x24, x25, [sp, #0xc0]",
        "  ldp x26, x27, [sp, #0xd0]",
        "  ldp x28, x29, [sp, #0xe0]",
        "  ldr x30, [sp, #0xf0]",
        "  ldp x0, x1, [sp, #0x00]",
        "  eret",
        "  dsb nsh",
        "  isb",

        ".purgem el3_unexpected",
        ".purgem lower_el",

        SYNC = const ExceptionKind::Sync as u64,
        IRQ = const ExceptionKind::Irq as u64,
        FIQ = const ExceptionKind::Fiq as u64,
        SERROR = const ExceptionKind::SError as u64,
        ELR_OFFSET = const offset_of!(WorldContext, elr_el3),
        EL3_SP_OFFSET = const offset_of!(WorldContext, el3_sp),
        unexpected_el3_exception = sym unexpected_el3_exception,
    );
}
