// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::{Peripherals, Platform};
use crate::{
    bcm2711::{ArmLocalRegisters, PmRegisters, SystemTimerRegisters},
    firmware::{PropertyMessage, VcMailbox, VcMailboxRegisters},
    gicv2::{Gic, GicConfig, InterruptConfig},
    handoff::{STUB_HEADER_OFFSET, StubHeader},
    logger::{self, Flush, LockedWriter},
    pagetable::{GRANULE_SIZE, MT_DEVICE, MT_NON_CACHEABLE, MappingError, MemoryPlan, NON_SECURE},
    pcc::{PCC_REGIONS_BASE, PccRegions, SECURE_TRIGGER},
};
use arm_gic::{
    InterruptGroup, Trigger,
    gicv2::registers::{Gicc, Gicd},
};
use arm_pl011_uart::{PL011Registers, Uart};
use core::{hint::spin_loop, ptr::NonNull};
use safe_mmio::UniqueMmioPointer;
use spin::mutex::{SpinMutex, SpinMutexGuard};

/// The SoC peripherals, from the ARM's point of view in low peripheral mode.
const DEVICE_BASE: usize = 0xfc00_0000;
const DEVICE_END: usize = 0x1_0000_0000;

/// Base address of the PL011 UART which the firmware sets up as the console.
const UART0_BASE: usize = 0xfe20_1000;
const SYSTEM_TIMER_BASE: usize = 0xfe00_3000;
const PM_BASE: usize = 0xfe10_0000;
const VC_MAILBOX_BASE: usize = 0xfe00_b880;
const ARM_LOCAL_BASE: usize = 0xff80_0000;
const GICD_BASE: usize = 0xff84_1000;
const GICC_BASE: usize = 0xff84_2000;

const PL011_BASE_ADDRESS: *mut PL011Registers = UART0_BASE as _;
const SYSTEM_TIMER_ADDRESS: *mut SystemTimerRegisters = SYSTEM_TIMER_BASE as _;
const PM_ADDRESS: *mut PmRegisters = PM_BASE as _;
const VC_MAILBOX_ADDRESS: *mut VcMailboxRegisters = VC_MAILBOX_BASE as _;
const ARM_LOCAL_ADDRESS: *mut ArmLocalRegisters = ARM_LOCAL_BASE as _;
const GICD_BASE_ADDRESS: *mut Gicd = GICD_BASE as _;
const GICC_BASE_ADDRESS: *mut Gicc = GICC_BASE as _;
/// The armstub header, within the first page of BL31.
const STUB_HEADER_ADDRESS: *mut StubHeader = STUB_HEADER_OFFSET as _;
const PCC_REGIONS_ADDRESS: *mut PccRegions = PCC_REGIONS_BASE as _;

/// The PCC trigger is the only secure interrupt.
const GIC_CONFIG: GicConfig = GicConfig {
    interrupts_config: &[(
        SECURE_TRIGGER,
        InterruptConfig {
            priority: 0x00,
            group: InterruptGroup::Group0,
            trigger: Trigger::Level,
        },
    )],
};

/// The buffer for messages to the VideoCore. Being a static in BL31 it is below 4 GiB.
static MESSAGE: SpinMutex<PropertyMessage> = SpinMutex::new(PropertyMessage::EMPTY);

/// The Raspberry Pi 4 Model B, with a BCM2711 SoC.
pub struct Rpi4;

impl Platform for Rpi4 {
    const CACHE_WRITEBACK_GRANULE: usize = 1 << 6;

    const GIC_CONFIG: GicConfig = GIC_CONFIG;

    type LogSinkImpl = LockedWriter<Uart<'static>>;
    type FirmwareImpl = VcMailbox<'static>;

    fn init_console() {
        // SAFETY: `PL011_BASE_ADDRESS` is the base address of a PL011 device, and nothing else
        // accesses that address range. The MMU is still off, and the address stays valid
        // afterwards as it's within the device region which is identity mapped.
        let uart_pointer =
            unsafe { UniqueMmioPointer::new(NonNull::new(PL011_BASE_ADDRESS).unwrap()) };
        logger::init(LockedWriter::new(Uart::new(uart_pointer)))
            .expect("Failed to initialise logger");
    }

    fn map_extra_regions(plan: &mut MemoryPlan) -> Result<(), MappingError> {
        plan.add(DEVICE_BASE..DEVICE_END, MT_DEVICE)?;
        plan.add(
            PCC_REGIONS_BASE..PCC_REGIONS_BASE + GRANULE_SIZE,
            MT_NON_CACHEABLE.union(NON_SECURE),
        )
    }

    unsafe fn peripherals() -> Peripherals {
        // SAFETY: These are the addresses of the corresponding register blocks, or in the case of
        // the stub header and PCC regions of memory owned by BL31 and the VideoCore. Our caller
        // promises that this is only called once, so nothing else in BL31 accesses them.
        unsafe {
            Peripherals {
                boot_stub: UniqueMmioPointer::new(NonNull::new(STUB_HEADER_ADDRESS).unwrap()),
                arm_local: UniqueMmioPointer::new(NonNull::new(ARM_LOCAL_ADDRESS).unwrap()),
                system_timer: UniqueMmioPointer::new(NonNull::new(SYSTEM_TIMER_ADDRESS).unwrap()),
                pcc_regions: UniqueMmioPointer::new(NonNull::new(PCC_REGIONS_ADDRESS).unwrap()),
                pm: UniqueMmioPointer::new(NonNull::new(PM_ADDRESS).unwrap()),
            }
        }
    }

    unsafe fn create_gic() -> Gic<'static> {
        // SAFETY: The GIC-400 distributor and CPU interface are at these addresses, they are
        // identity mapped as device memory, and our caller promises that this is only called once.
        unsafe { Gic::new(GICD_BASE_ADDRESS, GICC_BASE_ADDRESS, &GIC_CONFIG) }
    }

    unsafe fn create_firmware() -> Self::FirmwareImpl {
        // SAFETY: The VideoCore mailbox is at this address, and our caller promises that this is
        // only called once.
        let regs = unsafe { UniqueMmioPointer::new(NonNull::new(VC_MAILBOX_ADDRESS).unwrap()) };
        VcMailbox::new(regs, SpinMutexGuard::leak(MESSAGE.lock()))
    }
}

impl Flush for Uart<'_> {
    fn flush(&mut self) {
        while self.is_busy() {
            spin_loop();
        }
    }
}
