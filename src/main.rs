// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! EL3 runtime firmware (BL31) for the Raspberry Pi 4.
//!
//! Patches the device tree handed over by the VideoCore, enters the non-secure image and then
//! services the PCC mailbox interrupt which the VideoCore raises to report performance counters,
//! change the ARM clock and drive the PoE HAT fan.

#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), no_std)]

mod aarch64;
mod bcm2711;
mod boot;
mod context;
mod dtb;
mod exceptions;
mod fdt;
mod firmware;
mod gicv2;
mod handoff;
mod interrupts;
#[cfg_attr(test, path = "layout_fake.rs")]
mod layout;
mod logger;
mod pagetable;
mod pcc;
mod platform;
mod psci;
mod smccc;
mod stacks;

use crate::{
    bcm2711::PmWatchdog,
    boot::{BootContext, Runtime, early_setup, setup_runtime},
    context::World,
    dtb::dtb_working_buffer,
    exceptions::{RunResult, WorldContext, enter_world, prepare_non_secure_entry},
    interrupts::INTERRUPTS,
    pagetable::{init_runtime_mapping, plan_address_space},
    pcc::PccMailbox,
    platform::{Platform, PlatformImpl},
    smccc::handle_smc,
};
use log::{debug, info};

#[cfg_attr(test, allow(unused))]
extern "C" fn bl31_main() -> ! {
    // SAFETY: This is the only place the peripherals are taken.
    let mut peripherals = unsafe { PlatformImpl::peripherals() };
    let mut boot = early_setup(&mut peripherals);

    let (plan, dtb_address) = match plan_address_space(boot.dtb_address()) {
        Ok(planned) => planned,
        Err(e) => panic!("Failed to plan EL3 address space: {e}"),
    };
    if dtb_address.is_none() {
        boot.forget_dtb();
    }
    init_runtime_mapping(&plan);
    info!("Page table activated.");

    // SAFETY: The GIC and the VideoCore mailbox are only created here, after the MMU is enabled.
    let (gic, firmware) = unsafe { (PlatformImpl::create_gic(), PlatformImpl::create_firmware()) };
    let mailbox = PccMailbox::new(
        peripherals.arm_local,
        peripherals.system_timer,
        peripherals.pcc_regions,
    );
    let dtb = boot.dtb_address().map(|address| {
        // SAFETY: The device tree window was mapped read-write by `plan_address_space`, and
        // nothing else in BL31 touches it.
        unsafe { dtb_working_buffer(address) }
    });
    let runtime = Runtime {
        gic,
        mailbox,
        firmware,
    };
    setup_runtime(dtb, runtime, &mut INTERRUPTS.lock());

    run_non_secure_world(&boot, PmWatchdog::new(peripherals.pm))
}

/// Enters the non-secure image and handles everything it traps to EL3 for, forever.
fn run_non_secure_world(boot: &BootContext, mut power: PmWatchdog<'static>) -> ! {
    let Some(entry_point) = boot.next_image_entry_point(World::NonSecure) else {
        panic!("No non-secure image to run");
    };
    let routing = INTERRUPTS.lock().scr_routing(World::NonSecure);
    prepare_non_secure_entry(entry_point, routing);
    info!("Entering non-secure world at {:#x}", entry_point.pc);

    let mut context = WorldContext::new(entry_point);
    loop {
        match enter_world(&mut context) {
            RunResult::Smc => {
                let mut regs = [0; 4];
                regs.copy_from_slice(&context.gpregs[..4]);
                context.gpregs[0] = handle_smc(&regs, &mut power);
            }
            RunResult::Fiq => {
                if interrupts::dispatch(World::NonSecure).is_none() {
                    debug!("No handler for FIQ from non-secure world");
                }
            }
        }
    }
}

#[cfg(all(target_arch = "aarch64", not(test)))]
mod asm {
    use super::*;
    use crate::handoff::{STUB_HEADER_OFFSET, STUB_MAGIC};
    use arm_sysregs::SctlrEl3;
    use core::arch::global_asm;

    /// Frequency of the generic timer, from the 54 MHz crystal.
    const COUNTER_FREQUENCY: u32 = 54_000_000;
    /// Version of the stub header layout.
    const STUB_VERSION: u32 = 0;
    const MPIDR_AFFINITY_MASK: u32 = 0x00ff_ffff;

    global_asm!(
        // The VideoCore starts every core at address 0, and fills in the stub header before it
        // does so.
        ".pushsection .text.stub, \"ax\"",
        ".global bl31_stub",
        "bl31_stub:",
        "  b bl31_entrypoint",
        ".org {STUB_HEADER_OFFSET}",
        "  .word {STUB_MAGIC}",
        "  .word {STUB_VERSION}",
        // dtb_ptr32
        "  .word 0",
        // kernel_entry32
        "  .word 0",
        ".popsection",
        STUB_HEADER_OFFSET = const STUB_HEADER_OFFSET,
        STUB_MAGIC = const STUB_MAGIC,
        STUB_VERSION = const STUB_VERSION,
    );

    /// The cold boot entrypoint. Only the primary core continues, the others wait forever.
    #[unsafe(naked)]
    #[unsafe(no_mangle)]
    #[unsafe(link_section = ".text.entry")]
    unsafe extern "C" fn bl31_entrypoint() -> ! {
        core::arch::naked_asm!(
            "mrs x0, mpidr_el1",
            "and x0, x0, #{MPIDR_AFFINITY_MASK}",
            "cbz x0, 2f",
            "1:",
            "  wfe",
            "  b 1b",
            "2:",
            "adrp x0, primary_stack_top",
            "add x0, x0, :lo12:primary_stack_top",
            "mov sp, x0",
            "adrp x0, el3_vectors",
            "add x0, x0, :lo12:el3_vectors",
            "msr vbar_el3, x0",
            "ldr x0, ={COUNTER_FREQUENCY}",
            "msr cntfrq_el0, x0",
            // Enable the instruction cache, the MMU comes later.
            "mrs x0, sctlr_el3",
            "orr x0, x0, #{SCTLR_I_BIT}",
            "msr sctlr_el3, x0",
            "isb",
            // Zero the bss, which the linker script keeps 16 byte aligned.
            "adrp x0, __BSS_START__",
            "add x0, x0, :lo12:__BSS_START__",
            "adrp x1, __BSS_END__",
            "add x1, x1, :lo12:__BSS_END__",
            "3:",
            "  cmp x0, x1",
            "  b.hs 4f",
            "  stp xzr, xzr, [x0], #16",
            "  b 3b",
            "4:",
            "bl {bl31_main}",
            MPIDR_AFFINITY_MASK = const MPIDR_AFFINITY_MASK,
            COUNTER_FREQUENCY = const COUNTER_FREQUENCY,
            SCTLR_I_BIT = const SctlrEl3::I.bits(),
            bl31_main = sym bl31_main,
        );
    }
}
