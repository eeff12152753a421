// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

macro_rules! select_platform {
    (platform = $condition:literal, $mod:ident::$plat_impl:ident) => {
        #[cfg(platform = $condition)]
        mod $mod;

        #[cfg(platform = $condition)]
        pub use $mod::$plat_impl as PlatformImpl;
    };
    (test, $mod:ident::$plat_impl:ident) => {
        #[cfg(test)]
        pub mod $mod;

        #[cfg(test)]
        pub use $mod::$plat_impl as PlatformImpl;
    };
}

select_platform!(platform = "rpi4", rpi4::Rpi4);
select_platform!(test, test::TestPlatform);

use crate::{
    bcm2711::{ArmLocalRegisters, PmRegisters, SystemTimerRegisters},
    firmware::Firmware,
    gicv2::{Gic, GicConfig},
    handoff::{BootConfig, StubHeader},
    logger::LogSink,
    pagetable::{MappingError, MemoryPlan},
    pcc::PccRegions,
};
use safe_mmio::UniqueMmioPointer;

/// Type alias for convenience, to avoid having to use the complicated type name everywhere.
pub type LogSinkImpl = <PlatformImpl as Platform>::LogSinkImpl;

pub type FirmwareImpl = <PlatformImpl as Platform>::FirmwareImpl;

/// The SoC peripherals used during boot and by the PCC interrupt handler.
pub struct Peripherals {
    /// The header of the armstub, filled in by the VideoCore before the ARM cores start.
    pub boot_stub: UniqueMmioPointer<'static, StubHeader>,
    pub arm_local: UniqueMmioPointer<'static, ArmLocalRegisters>,
    pub system_timer: UniqueMmioPointer<'static, SystemTimerRegisters>,
    /// The PCC channel regions shared with the VideoCore.
    pub pcc_regions: UniqueMmioPointer<'static, PccRegions>,
    /// The power management block, whose watchdog resets the system.
    pub pm: UniqueMmioPointer<'static, PmRegisters>,
}

/// The hooks implemented by all platforms.
pub trait Platform {
    /// The size in bytes of the largest cache line across all the cache levels in the platform.
    const CACHE_WRITEBACK_GRANULE: usize;

    /// The number of pages to reserve for the page heap.
    const PAGE_HEAP_PAGE_COUNT: usize = 8;

    /// The GIC configuration.
    const GIC_CONFIG: GicConfig;

    /// Where the next stage and its device tree were loaded, and how to enter it.
    const BOOT_CONFIG: BootConfig = BootConfig::from_build_env();

    /// Platform dependent LogSink implementation type for Logger.
    type LogSinkImpl: LogSink;

    /// Platform dependent client for the VideoCore firmware.
    type FirmwareImpl: Firmware + Send;

    /// Initialises the console and the logger. This will be called before the MMU is enabled.
    ///
    /// Any logs sent before this is called will be ignored.
    fn init_console();

    /// Adds device memory and any other regions specific to the platform to the address space
    /// plan, before the MMU is enabled.
    fn map_extra_regions(plan: &mut MemoryPlan) -> Result<(), MappingError>;

    /// Returns the peripherals used by the boot sequence and the PCC handler.
    ///
    /// # Safety
    ///
    /// This must only be called once, to avoid creating aliases of the peripherals.
    unsafe fn peripherals() -> Peripherals;

    /// Creates instance of GIC driver.
    ///
    /// # Safety
    ///
    /// This must only be called once, to avoid creating aliases of the GIC driver.
    unsafe fn create_gic() -> Gic<'static>;

    /// Creates the VideoCore firmware client.
    ///
    /// # Safety
    ///
    /// This must only be called once, to avoid creating aliases of the VideoCore mailbox, and only
    /// after the memory holding the message buffer has been mapped.
    unsafe fn create_firmware() -> Self::FirmwareImpl;
}
