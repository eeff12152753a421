// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Register blocks of the BCM2711 SoC used directly by BL31.

use crate::{
    aarch64::{dsb_sy, isb, wfi},
    psci::SystemPower,
};
use log::info;
use safe_mmio::{
    UniqueMmioPointer, field, field_shared,
    fields::{ReadPure, ReadPureWrite, ReadWrite},
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Prescaler value which makes the ARM local timer tick once per crystal cycle.
const LOCAL_TIMER_PRESCALER_1_1: u32 = 0x8000_0000;

/// Every write to a power management register must carry this in its top byte.
const PM_PASSWORD: u32 = 0x5a00_0000;
const PM_RSTC_WRCFG_MASK: u32 = 0x0000_0030;
const PM_RSTC_WRCFG_FULL_RESET: u32 = 0x0000_0020;
/// Boot partition 63, which the VideoCore firmware takes as a request to halt after reset.
const PM_RSTS_PARTITION_HALT: u32 = 0x0000_0555;
/// Watchdog ticks before the reset fires.
const PM_WDOG_RESET_TICKS: u32 = 10;

/// The ARM local peripherals block.
#[derive(Clone, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
#[repr(C, align(4))]
pub struct ArmLocalRegisters {
    /// Timer source and increment control.
    pub control: ReadPureWrite<u32>,
    _reserved0: u32,
    /// Core timer prescaler.
    pub prescaler: ReadPureWrite<u32>,
    _reserved1: [u32; 45],
    /// Doorbell status raised by the VideoCore for the PCC mailbox. Bits are acknowledged by
    /// writing them back.
    pub mailbox_status: ReadWrite<u32>,
}

/// The free-running system timer.
#[derive(Clone, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
#[repr(C, align(4))]
pub struct SystemTimerRegisters {
    /// Control/status.
    pub cs: ReadPureWrite<u32>,
    /// Lower 32 bits of the free-running counter.
    pub clo: ReadPure<u32>,
    /// Upper 32 bits of the free-running counter.
    pub chi: ReadPure<u32>,
}

/// The power management block, which holds the watchdog.
#[derive(Clone, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
#[repr(C, align(4))]
pub struct PmRegisters {
    _reserved0: [u32; 7],
    /// Reset control.
    pub rstc: ReadPureWrite<u32>,
    /// Reset status, read by the VideoCore firmware after a reset.
    pub rsts: ReadPureWrite<u32>,
    /// Watchdog timer.
    pub wdog: ReadPureWrite<u32>,
}

/// Starts the watchdog for a full reset of the SoC a few ticks from now.
pub fn watchdog_reset(pm: &mut UniqueMmioPointer<PmRegisters>) {
    field!(*pm, wdog).write(PM_PASSWORD | PM_WDOG_RESET_TICKS);
    field!(*pm, rstc)
        .modify(|rstc| (rstc & !PM_RSTC_WRCFG_MASK) | PM_PASSWORD | PM_RSTC_WRCFG_FULL_RESET);
}

/// Marks the next reset as a halt. The board can't power itself off, so this is as close as it
/// gets.
pub fn request_halt(pm: &mut UniqueMmioPointer<PmRegisters>) {
    field!(*pm, rsts).modify(|rsts| rsts | PM_PASSWORD | PM_RSTS_PARTITION_HALT);
}

/// Turns the board off or resets it with the power management watchdog.
pub struct PmWatchdog<'a> {
    regs: UniqueMmioPointer<'a, PmRegisters>,
}

impl<'a> PmWatchdog<'a> {
    pub fn new(regs: UniqueMmioPointer<'a, PmRegisters>) -> Self {
        Self { regs }
    }

    fn reset(&mut self) -> ! {
        log::logger().flush();
        dsb_sy();
        isb();
        watchdog_reset(&mut self.regs);
        loop {
            wfi();
        }
    }
}

impl SystemPower for PmWatchdog<'_> {
    fn system_off(&mut self) -> ! {
        info!("PSCI_SYSTEM_OFF: Invoking watchdog reset");
        request_halt(&mut self.regs);
        self.reset()
    }

    fn system_reset(&mut self) -> ! {
        info!("PSCI_SYSTEM_RESET: Invoking watchdog reset");
        self.reset()
    }
}

/// Selects the crystal as the ARM local timer source, incrementing by one, with a 1:1 prescaler.
pub fn configure_local_timer(arm_local: &mut UniqueMmioPointer<ArmLocalRegisters>) {
    field!(*arm_local, control).write(0);
    field!(*arm_local, prescaler).write(LOCAL_TIMER_PRESCALER_1_1);
}

/// Returns the low word of the free-running system timer.
pub fn read_counter(timer: &UniqueMmioPointer<SystemTimerRegisters>) -> u32 {
    field_shared!(*timer, clo).read()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;
    use zerocopy::FromZeros;

    #[test]
    fn register_offsets() {
        assert_eq!(offset_of!(ArmLocalRegisters, prescaler), 0x08);
        assert_eq!(offset_of!(ArmLocalRegisters, mailbox_status), 0xc0);
        assert_eq!(offset_of!(SystemTimerRegisters, clo), 0x04);
        assert_eq!(offset_of!(PmRegisters, rstc), 0x1c);
        assert_eq!(offset_of!(PmRegisters, rsts), 0x20);
        assert_eq!(offset_of!(PmRegisters, wdog), 0x24);
    }

    #[test]
    fn watchdog_full_reset() {
        let mut regs = PmRegisters::new_zeroed();
        regs.rstc = ReadPureWrite(0x0000_0132);
        watchdog_reset(&mut UniqueMmioPointer::from(&mut regs));
        assert_eq!(regs.wdog.0, 0x5a00_000a);
        // Only the reset configuration changes.
        assert_eq!(regs.rstc.0, 0x5a00_0122);
        assert_eq!(regs.rsts.0, 0);
    }

    #[test]
    fn halt_marks_partition() {
        let mut regs = PmRegisters::new_zeroed();
        regs.rsts = ReadPureWrite(0x1000);
        request_halt(&mut UniqueMmioPointer::from(&mut regs));
        assert_eq!(regs.rsts.0, 0x5a00_1555);
        assert_eq!(regs.wdog.0, 0);
    }

    #[test]
    fn local_timer_setup() {
        let mut regs = ArmLocalRegisters::new_zeroed();
        regs.control = ReadPureWrite(0x100);
        {
            let mut arm_local = UniqueMmioPointer::from(&mut regs);
            configure_local_timer(&mut arm_local);
        }
        assert_eq!(regs.control.0, 0);
        assert_eq!(regs.prescaler.0, 0x8000_0000);
    }

    #[test]
    fn counter_reads_low_word() {
        let mut regs = SystemTimerRegisters::new_zeroed();
        regs.clo = ReadPure(1234);
        regs.chi = ReadPure(1);
        let timer = UniqueMmioPointer::from(&mut regs);
        assert_eq!(read_counter(&timer), 1234);
    }
}
