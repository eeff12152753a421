// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The cold boot sequence, split into the phase before the MMU is enabled and the phase after.

use crate::{
    aarch64::spin_delay,
    bcm2711::configure_local_timer,
    context::{EntryPointInfo, ExecutionState, World},
    dtb::prepare_dtb,
    firmware::{Firmware, PowerDomain},
    gicv2::Gic,
    handoff::{BootConfig, BootHandoff},
    interrupts::{InterruptManager, InterruptType, RoutingFlags, set_interrupt_rm_flag},
    pcc::{self, PccMailbox},
    platform::{FirmwareImpl, Peripherals, Platform, PlatformImpl},
};
use log::{error, info};
use spin::{Once, mutex::SpinMutex};

/// Iterations to wait for the local timer to settle after it is reconfigured.
const LOCAL_TIMER_SETTLE_ITERATIONS: u32 = 100_000;

/// The power domains switched on before the non-secure world starts.
const BOOT_POWER_DOMAINS: [PowerDomain; 3] =
    [PowerDomain::I2c0, PowerDomain::I2c1, PowerDomain::I2c2];

/// The state the PCC interrupt handler needs, once the boot sequence has set it up.
pub struct Runtime {
    pub gic: Gic<'static>,
    pub mailbox: PccMailbox<'static>,
    pub firmware: FirmwareImpl,
}

static RUNTIME: Once<SpinMutex<Runtime>> = Once::new();

/// Publishes the runtime state for the PCC interrupt handler, then runs [`late_setup`] on it.
///
/// The state is published before the GIC is configured, so the PCC interrupt can't be enabled
/// while its handler has nothing to acknowledge it with. FIQs stay masked at EL3, so the handler
/// first runs once the non-secure world is entered, after the lock has been released.
pub fn setup_runtime(
    dtb: Option<&mut [u8]>,
    runtime: Runtime,
    interrupts: &mut InterruptManager,
) -> &'static SpinMutex<Runtime> {
    let published = RUNTIME.call_once(|| SpinMutex::new(runtime));
    let mut guard = published.lock();
    let Runtime {
        gic,
        mailbox,
        firmware,
    } = &mut *guard;
    late_setup(dtb, gic, firmware, mailbox, interrupts);
    drop(guard);
    published
}

/// The entry points of the next images and where their device tree is.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootContext {
    non_secure: EntryPointInfo,
    secure: EntryPointInfo,
    dtb_address: Option<usize>,
}

impl BootContext {
    /// Works out how to enter the non-secure image from the build configuration and what the
    /// VideoCore left in the stub header.
    ///
    /// There is no secure payload.
    pub fn new(config: &BootConfig, handoff: &BootHandoff) -> Self {
        let dtb_address = handoff.dtb_address(config);
        let execution_state = config.bl33_execution_state;

        let mut args = [0; 8];
        if config.direct_linux_boot {
            let dtb = dtb_address.unwrap_or_default() as u64;
            match execution_state {
                // x0 = dtb, x1..x3 reserved.
                ExecutionState::AArch64 => args[0] = dtb,
                // r0 = 0, r1 = machine type (none, use the device tree), r2 = dtb.
                ExecutionState::AArch32 => {
                    args[1] = 0xffff_ffff;
                    args[2] = dtb;
                }
            }
        }

        let non_secure = EntryPointInfo {
            pc: handoff.non_secure_entry_address(config),
            spsr: execution_state.non_secure_spsr(),
            security_state: World::NonSecure,
            args,
        };
        info!(
            "BL33 entry point {:#x} ({:?}), DTB {:x?}",
            non_secure.pc, execution_state, dtb_address
        );

        Self {
            non_secure,
            secure: EntryPointInfo::empty(World::Secure),
            dtb_address,
        }
    }

    /// Returns the entry point of the image to run in the given world, if there is one.
    pub fn next_image_entry_point(&self, world: World) -> Option<&EntryPointInfo> {
        let entry_point = match world {
            World::Secure => &self.secure,
            World::NonSecure => &self.non_secure,
        };
        entry_point.is_valid().then_some(entry_point)
    }

    /// Returns the address of the device tree passed on to the non-secure world, if known.
    pub fn dtb_address(&self) -> Option<usize> {
        self.dtb_address
    }

    /// Treats the device tree as absent, because it couldn't be mapped.
    pub fn forget_dtb(&mut self) {
        self.dtb_address = None;
    }
}

/// Runs the part of the boot sequence before the MMU is enabled: sets up the local timer and the
/// console, then reads the stub header to find the next image.
#[cfg_attr(test, allow(unused))]
pub fn early_setup(peripherals: &mut Peripherals) -> BootContext {
    configure_local_timer(&mut peripherals.arm_local);
    spin_delay(LOCAL_TIMER_SETTLE_ITERATIONS);

    PlatformImpl::init_console();
    info!("Raspberry Pi 4 BL31 starting");

    let handoff = BootHandoff::read(&mut peripherals.boot_stub);
    BootContext::new(&PlatformImpl::BOOT_CONFIG, &handoff)
}

/// Runs the part of the boot sequence after the MMU is enabled.
///
/// Patches the device tree if there is one, sets up the GIC and the PCC interrupt handler, then
/// asks the VideoCore to power the I2C controllers, turn the fan off, and reports the board. Every
/// failure is logged and the boot carries on.
pub fn late_setup(
    dtb: Option<&mut [u8]>,
    gic: &mut Gic,
    firmware: &mut impl Firmware,
    mailbox: &mut PccMailbox,
    interrupts: &mut InterruptManager,
) {
    if let Some(blob) = dtb {
        prepare_dtb(blob);
    }

    gic.distributor_init();
    gic.pcpu_distributor_init();
    gic.cpu_interface_enable();
    info!("GIC configured.");

    let mut flags = RoutingFlags::empty();
    set_interrupt_rm_flag(&mut flags, World::NonSecure);
    if let Err(e) = interrupts.register_interrupt_type_handler(
        InterruptType::El3,
        mailbox_interrupt_handler,
        flags,
    ) {
        error!("Failed to register PCC interrupt handler: {e}");
    }

    for domain in BOOT_POWER_DOMAINS {
        if let Err(e) = firmware.set_power(domain, true, true) {
            error!("Failed to power on {domain:?}: {e}");
        }
    }

    match firmware.board_revision() {
        Ok(revision) => info!("board rev {revision:x}"),
        Err(e) => error!("Failed to get board revision: {e}"),
    }
    match firmware.arm_clock_rate() {
        Ok(rate) => info!("clock rate {rate}"),
        Err(e) => error!("Failed to get clock rate: {e}"),
    }
    match firmware.max_arm_clock_rate() {
        Ok(rate) => info!("max clock rate {rate}"),
        Err(e) => error!("Failed to get max clock rate: {e}"),
    }

    // Start the next stage with the fan off.
    if let Err(e) = firmware.set_pwm(0) {
        error!("Failed to turn fan off: {e}");
    }

    mailbox.idle_all();
}

/// The EL3 interrupt handler for FIQs taken from the non-secure world.
fn mailbox_interrupt_handler(_world: World) -> u64 {
    let Some(runtime) = RUNTIME.get() else {
        error!("PCC interrupt taken before boot finished");
        return 0;
    };
    let mut runtime = runtime.lock();
    let Runtime {
        gic,
        mailbox,
        firmware,
    } = &mut *runtime;
    pcc::handle_interrupt(gic, mailbox, firmware)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bcm2711::{ArmLocalRegisters, SystemTimerRegisters},
        dtb::DTB_WORKING_SIZE,
        fdt::{builder::FdtBuilder, check_header},
        firmware::FirmwareError,
        gicv2::GicConfig,
        pcc::PccRegions,
        platform::test::{FakeFirmware, FakeGic, FirmwareCall},
    };
    use arm_sysregs::{ScrEl3, SpsrEl3};
    use safe_mmio::UniqueMmioPointer;
    use zerocopy::FromZeros;

    static CONFIG: GicConfig = PlatformImpl::GIC_CONFIG;

    const DIRECT_BOOT: BootConfig = BootConfig {
        preloaded_bl33_base: None,
        preloaded_dtb_base: None,
        direct_linux_boot: true,
        bl33_execution_state: ExecutionState::AArch64,
    };

    const FIRMWARE_HANDOFF: BootHandoff = BootHandoff {
        stub_cleared: true,
        dtb_ptr32: 0x2eff_2e00,
        kernel_entry32: 0x20_0000,
    };

    #[test]
    fn direct_boot_aarch64() {
        let boot = BootContext::new(&DIRECT_BOOT, &FIRMWARE_HANDOFF);

        let entry = boot.next_image_entry_point(World::NonSecure).unwrap();
        assert_eq!(entry.pc, 0x20_0000);
        assert_eq!(entry.spsr, ExecutionState::AArch64.non_secure_spsr());
        assert_eq!(entry.security_state, World::NonSecure);
        assert_eq!(entry.args, [0x2eff_2e00, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(boot.dtb_address(), Some(0x2eff_2e00));
    }

    #[test]
    fn direct_boot_aarch32() {
        let config = BootConfig {
            bl33_execution_state: ExecutionState::AArch32,
            ..DIRECT_BOOT
        };
        let boot = BootContext::new(&config, &FIRMWARE_HANDOFF);

        let entry = boot.next_image_entry_point(World::NonSecure).unwrap();
        assert!(entry.spsr.contains(SpsrEl3::M_4));
        assert_eq!(entry.execution_state(), ExecutionState::AArch32);
        assert_eq!(entry.args, [0, 0xffff_ffff, 0x2eff_2e00, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn firmware_boot_has_no_arguments() {
        let config = BootConfig {
            direct_linux_boot: false,
            ..DIRECT_BOOT
        };
        let boot = BootContext::new(&config, &FIRMWARE_HANDOFF);
        assert_eq!(
            boot.next_image_entry_point(World::NonSecure).unwrap().args,
            [0; 8]
        );
    }

    #[test]
    fn magic_not_cleared() {
        let handoff = BootHandoff {
            stub_cleared: false,
            ..FIRMWARE_HANDOFF
        };
        let boot = BootContext::new(&DIRECT_BOOT, &handoff);

        assert_eq!(
            boot.next_image_entry_point(World::NonSecure).unwrap().pc,
            0x8_0000
        );
        assert_eq!(boot.dtb_address(), None);
    }

    #[test]
    fn preloaded_addresses_win() {
        let config = BootConfig {
            preloaded_bl33_base: Some(0x3_0000),
            preloaded_dtb_base: Some(0x40_0000),
            ..DIRECT_BOOT
        };
        let boot = BootContext::new(&config, &FIRMWARE_HANDOFF);

        let entry = boot.next_image_entry_point(World::NonSecure).unwrap();
        assert_eq!(entry.pc, 0x3_0000);
        assert_eq!(entry.args[0], 0x40_0000);
        assert_eq!(boot.dtb_address(), Some(0x40_0000));
    }

    #[test]
    fn no_secure_payload() {
        let boot = BootContext::new(&DIRECT_BOOT, &FIRMWARE_HANDOFF);
        assert_eq!(boot.next_image_entry_point(World::Secure), None);
    }

    #[test]
    fn forgotten_dtb() {
        let mut boot = BootContext::new(&DIRECT_BOOT, &FIRMWARE_HANDOFF);
        boot.forget_dtb();
        assert_eq!(boot.dtb_address(), None);
        // The entry point is unaffected.
        assert!(boot.next_image_entry_point(World::NonSecure).is_some());
    }

    struct FakeHardware {
        gic: FakeGic,
        arm_local: ArmLocalRegisters,
        timer: SystemTimerRegisters,
        regions: PccRegions,
    }

    impl FakeHardware {
        fn new() -> Box<Self> {
            Box::new(Self {
                gic: FakeGic::new(),
                arm_local: ArmLocalRegisters::new_zeroed(),
                timer: SystemTimerRegisters::new_zeroed(),
                regions: PccRegions::new_zeroed(),
            })
        }

        fn late_setup(
            &mut self,
            dtb: Option<&mut [u8]>,
            firmware: &mut FakeFirmware,
            interrupts: &mut InterruptManager,
        ) {
            let mut gic = self.gic.build(&CONFIG);
            let mut mailbox = PccMailbox::new(
                UniqueMmioPointer::from(&mut self.arm_local),
                UniqueMmioPointer::from(&mut self.timer),
                UniqueMmioPointer::from(&mut self.regions),
            );
            late_setup(dtb, &mut gic, firmware, &mut mailbox, interrupts);
        }
    }

    #[test]
    fn late_setup_order() {
        let mut hardware = FakeHardware::new();
        let mut firmware = FakeFirmware {
            board_revision: 0x00c0_3111,
            clock_rate: 1_500_000_000,
            max_clock_rate: 1_800_000_000,
            pwm: 0x40,
            ..Default::default()
        };
        let mut interrupts = InterruptManager::new();

        hardware.late_setup(None, &mut firmware, &mut interrupts);

        assert_eq!(
            firmware.calls,
            [
                FirmwareCall::SetPower(PowerDomain::I2c0, true, true),
                FirmwareCall::SetPower(PowerDomain::I2c1, true, true),
                FirmwareCall::SetPower(PowerDomain::I2c2, true, true),
                FirmwareCall::BoardRevision,
                FirmwareCall::ArmClockRate,
                FirmwareCall::MaxArmClockRate,
                FirmwareCall::SetPwm(0),
            ]
        );
        assert_eq!(firmware.pwm, 0);

        // Both channels are idle.
        assert_eq!(hardware.regions.channel0.signature.0, 0x5043_4300);
        assert_eq!(hardware.regions.channel0.status.0, 1);
        assert_eq!(hardware.regions.channel1.signature.0, 0x5043_4301);
        assert_eq!(hardware.regions.channel1.status.0, 1);

        // The GIC is enabled, and FIQs from the non-secure world are routed to EL3.
        assert_ne!(hardware.gic.gicd.ctlr.0.bits(), 0);
        assert_ne!(hardware.gic.gicc.ctlr.0, 0);
        assert_eq!(interrupts.scr_routing(World::NonSecure), ScrEl3::FIQ);
        assert_eq!(interrupts.scr_routing(World::Secure), ScrEl3::empty());
        assert!(interrupts.handler_for(World::NonSecure).is_some());
    }

    #[test]
    fn late_setup_survives_firmware_errors() {
        let mut hardware = FakeHardware::new();
        let mut firmware = FakeFirmware {
            error: Some(FirmwareError::RequestFailed(0x8000_0001)),
            ..Default::default()
        };
        let mut interrupts = InterruptManager::new();

        hardware.late_setup(None, &mut firmware, &mut interrupts);

        // Every request is still attempted once.
        assert_eq!(firmware.calls.len(), 7);
        assert_eq!(firmware.calls.last(), Some(&FirmwareCall::SetPwm(0)));
        assert_eq!(hardware.regions.channel1.status.0, 1);
        assert!(interrupts.handler_for(World::NonSecure).is_some());
    }

    #[test]
    fn late_setup_patches_dtb() {
        let mut blob = FdtBuilder::new().tree(|builder| {
            builder.begin_node("");
            builder.property_u32("#address-cells", 2);
            builder.property_u32("#size-cells", 1);
            builder.begin_node("chosen");
            builder.end_node();
            builder.begin_node("cpus");
            builder.begin_node("cpu@0");
            builder.property_string("device_type", "cpu");
            builder.end_node();
            builder.end_node();
            builder.end_node();
        });
        blob.resize(DTB_WORKING_SIZE, 0);
        let mut hardware = FakeHardware::new();
        let mut firmware = FakeFirmware::default();
        let mut interrupts = InterruptManager::new();

        hardware.late_setup(Some(blob.as_mut_slice()), &mut firmware, &mut interrupts);

        let size = check_header(&blob).unwrap();
        let fdt = ::fdt::Fdt::new(&blob[..size]).unwrap();
        assert!(fdt.find_node("/psci").is_some());
        assert!(fdt.find_node("/reserved-memory/atf@0").is_some());
    }

    #[test]
    fn second_registration_is_logged() {
        let mut hardware = FakeHardware::new();
        let mut firmware = FakeFirmware::default();
        let mut interrupts = InterruptManager::new();

        hardware.late_setup(None, &mut firmware, &mut interrupts);
        hardware.late_setup(None, &mut firmware, &mut interrupts);

        // The rest of the sequence still runs.
        assert_eq!(firmware.calls.len(), 14);
        assert!(interrupts.handler_for(World::NonSecure).is_some());
    }

    /// The only test which publishes the runtime state.
    #[test]
    fn interrupt_is_ended_once_runtime_published() {
        // Before anything is published the handler has no GIC to acknowledge with.
        assert!(RUNTIME.get().is_none());
        assert_eq!(mailbox_interrupt_handler(World::NonSecure), 0);

        let fake = Box::leak(Box::new(FakeGic::new()));
        fake.gicc.iar.0 = 32;
        let gicd = &raw mut *fake.gicd;
        let gicc = &raw mut *fake.gicc;
        // SAFETY: The fake registers are leaked, and from here on only accessed through these
        // pointers.
        let gic = unsafe { Gic::new(gicd, gicc, &CONFIG) };
        // SAFETY: Only this test takes the fake peripherals.
        let peripherals = unsafe { PlatformImpl::peripherals() };
        let runtime = Runtime {
            gic,
            mailbox: PccMailbox::new(
                peripherals.arm_local,
                peripherals.system_timer,
                peripherals.pcc_regions,
            ),
            firmware: FakeFirmware::default(),
        };
        let mut interrupts = InterruptManager::new();

        let published = setup_runtime(None, runtime, &mut interrupts);

        assert!(core::ptr::eq(published, RUNTIME.get().unwrap()));
        let handler = interrupts.handler_for(World::NonSecure).unwrap();
        assert_eq!(handler(World::NonSecure), 0);
        // SAFETY: The interrupt handler has returned, so nothing else is using the fake GIC.
        assert_eq!(unsafe { (*gicc).eoir.0 }, 32);
        assert!(matches!(
            published.lock().firmware.calls.last(),
            Some(FirmwareCall::SetArmClockRate(_))
        ));
    }
}
