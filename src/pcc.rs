// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The PCC mailbox shared with the VideoCore, and the secure interrupt handler which services it.
//!
//! The VideoCore raises SPI 0 after setting doorbell bits in the ARM local mailbox status
//! register. Channel requests are answered through two small regions in non-secure memory, each
//! holding a signature, a command, a status and an 8 byte payload.

use crate::{
    bcm2711::{ArmLocalRegisters, SystemTimerRegisters, read_counter},
    firmware::Firmware,
    interrupts::InterruptController,
};
use arm_gic::IntId;
use bitflags::bitflags;
use log::{debug, error, info};
use safe_mmio::{UniqueMmioPointer, field, fields::ReadPureWrite};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The interrupt the VideoCore raises for the PCC mailbox.
pub const SECURE_TRIGGER: IntId = IntId::spi(0);

/// Physical address of the PCC regions.
pub const PCC_REGIONS_BASE: usize = 0x1f_0000;

/// Command code of a read request.
const COMMAND_READ: u16 = 0;
/// Status code meaning the last command has completed.
const STATUS_COMMAND_COMPLETE: u16 = 1;

/// Bits of the mailbox status holding a requested clock frequency in MHz.
const FREQUENCY_MASK: u32 = 0x07ff_ffff;
const MIN_FREQUENCY_MHZ: u32 = 600;
const MAX_FREQUENCY_MHZ: u32 = 2200;
/// Bits of the mailbox status holding a requested fan duty cycle.
const FAN_DUTY_MASK: u32 = 0xff;

/// Delivered counts are derived from the clock rate in units of this many Hz.
const DELIVERED_RATE_UNIT: u32 = 100_000_000;
const DELIVERED_RATE_DIVISOR: u32 = 15;

bitflags! {
    /// Doorbell bits in the ARM local mailbox status register.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct Doorbell: u32 {
        const CHANNEL0 = 1 << 27;
        const CHANNEL1 = 1 << 28;
        const FAN = 1 << 30;
        const _ = !0;
    }
}

/// One PCC channel's shared region.
#[derive(Clone, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
#[repr(C, align(4))]
pub struct PccRegion {
    pub signature: ReadPureWrite<u32>,
    pub command: ReadPureWrite<u16>,
    pub status: ReadPureWrite<u16>,
    /// Command specific payload.
    pub com_space: ReadPureWrite<[u8; 8]>,
}

/// Both PCC channels, as laid out from [`PCC_REGIONS_BASE`].
#[derive(Clone, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
#[repr(C, align(4))]
pub struct PccRegions {
    pub channel0: PccRegion,
    _reserved: [u32; 28],
    pub channel1: PccRegion,
}

/// A PCC channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PccChannel {
    /// Performance counter reads.
    Channel0,
    /// Fan PWM reads.
    Channel1,
}

impl PccChannel {
    /// The value which identifies the channel's region when it is idle.
    pub const fn signature(self) -> u32 {
        match self {
            Self::Channel0 => 0x5043_4300,
            Self::Channel1 => 0x5043_4301,
        }
    }
}

/// The hardware behind the PCC mailbox.
pub struct PccMailbox<'a> {
    arm_local: UniqueMmioPointer<'a, ArmLocalRegisters>,
    timer: UniqueMmioPointer<'a, SystemTimerRegisters>,
    regions: UniqueMmioPointer<'a, PccRegions>,
}

impl<'a> PccMailbox<'a> {
    pub fn new(
        arm_local: UniqueMmioPointer<'a, ArmLocalRegisters>,
        timer: UniqueMmioPointer<'a, SystemTimerRegisters>,
        regions: UniqueMmioPointer<'a, PccRegions>,
    ) -> Self {
        Self {
            arm_local,
            timer,
            regions,
        }
    }

    fn region(&mut self, channel: PccChannel) -> UniqueMmioPointer<'_, PccRegion> {
        match channel {
            PccChannel::Channel0 => field!(self.regions, channel0),
            PccChannel::Channel1 => field!(self.regions, channel1),
        }
    }

    /// Resets the channel's region to its signature, command 0 and status complete.
    pub fn idle(&mut self, channel: PccChannel) {
        let mut region = self.region(channel);
        field!(region, signature).write(channel.signature());
        field!(region, command).write(COMMAND_READ);
        field!(region, status).write(STATUS_COMMAND_COMPLETE);
    }

    /// Resets both channels' regions.
    pub fn idle_all(&mut self) {
        self.idle(PccChannel::Channel0);
        self.idle(PccChannel::Channel1);
    }

    /// Handles every request flagged in the mailbox status register, then leaves both channels
    /// idle.
    pub fn service(&mut self, firmware: &mut impl Firmware) {
        let mut mailbox_status = field!(self.arm_local, mailbox_status);
        let raw = mailbox_status.read();
        // The interrupt line stays asserted until the bits are written back.
        mailbox_status.write(raw);
        let doorbell = Doorbell::from_bits_retain(raw);

        if doorbell.contains(Doorbell::CHANNEL1) {
            self.read_pwm(firmware);
            self.idle(PccChannel::Channel1);
        }
        if doorbell.contains(Doorbell::CHANNEL0) {
            self.read_counters(firmware);
            self.idle(PccChannel::Channel0);
        }

        if doorbell.contains(Doorbell::FAN) {
            let duty = (raw & FAN_DUTY_MASK) as u8;
            if let Err(e) = firmware.set_pwm(duty) {
                error!("Failed to set fan speed {duty}: {e}");
            }
            info!("Fan speed {duty}");
        } else if !doorbell.intersects(Doorbell::CHANNEL0 | Doorbell::CHANNEL1) {
            let mhz = (raw & FREQUENCY_MASK).clamp(MIN_FREQUENCY_MHZ, MAX_FREQUENCY_MHZ);
            if let Err(e) = firmware.set_arm_clock_rate(mhz * 1_000_000) {
                error!("Failed to set ARM clock to {mhz} MHz: {e}");
            }
        }

        self.idle_all();
    }

    /// Answers a channel 1 request with the current fan duty cycle.
    fn read_pwm(&mut self, firmware: &mut impl Firmware) {
        let mut region = self.region(PccChannel::Channel1);
        let command = field!(region, command).read();
        let status = field!(region, status).read();
        let com_space = field!(region, com_space).read();
        if command != COMMAND_READ {
            error!("PCC channel 1 command {command:#x} status {status:#x} {com_space:02x?}");
            return;
        }
        match firmware.pwm() {
            Ok(duty) => info!("PCC fan duty {duty} status {status:#x} {com_space:02x?}"),
            Err(e) => error!("Failed to read fan duty: {e}"),
        }
    }

    /// Answers a channel 0 request with the reference and delivered performance counters.
    fn read_counters(&mut self, firmware: &mut impl Firmware) {
        let counter = read_counter(&self.timer);
        let mut region = self.region(PccChannel::Channel0);
        let command = field!(region, command).read();
        if command != COMMAND_READ {
            let status = field!(region, status).read();
            let com_space = field!(region, com_space).read();
            error!("PCC channel 0 command {command:#x} status {status:#x} {com_space:02x?}");
            return;
        }

        let rate = firmware.arm_clock_rate().unwrap_or_else(|e| {
            error!("Failed to read ARM clock rate: {e}");
            0
        });
        let delivered =
            counter.wrapping_mul(rate / DELIVERED_RATE_UNIT) / DELIVERED_RATE_DIVISOR;

        let mut com_space = [0; 8];
        com_space[..4].copy_from_slice(&counter.to_le_bytes());
        com_space[4..].copy_from_slice(&delivered.to_le_bytes());
        field!(region, com_space).write(com_space);
    }
}

/// Handles the PCC mailbox interrupt.
///
/// Acknowledges the pending interrupt, services the mailbox if it is the secure trigger, and
/// signals end of interrupt exactly once. Always returns 0.
pub fn handle_interrupt(
    gic: &mut impl InterruptController,
    mailbox: &mut PccMailbox,
    firmware: &mut impl Firmware,
) -> u64 {
    let handle = gic.acknowledge_interrupt();
    log::logger().flush();

    if handle.id() == u32::from(SECURE_TRIGGER) {
        mailbox.service(firmware);
    } else {
        debug!("Ignoring interrupt {}", handle.id());
    }

    gic.end_of_interrupt(handle);
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        firmware::FirmwareError,
        platform::test::{FakeFirmware, FakeInterruptController, FirmwareCall},
    };
    use core::mem::offset_of;
    use safe_mmio::fields::{ReadPure, ReadWrite};
    use zerocopy::FromZeros;

    struct FakeHardware {
        arm_local: ArmLocalRegisters,
        timer: SystemTimerRegisters,
        regions: PccRegions,
    }

    impl FakeHardware {
        fn new(status: u32) -> Self {
            let mut hardware = Self {
                arm_local: ArmLocalRegisters::new_zeroed(),
                timer: SystemTimerRegisters::new_zeroed(),
                regions: PccRegions::new_zeroed(),
            };
            hardware.arm_local.mailbox_status = ReadWrite(status);
            hardware
        }

        fn interrupt(&mut self, gic: &mut FakeInterruptController, firmware: &mut FakeFirmware) {
            let mut mailbox = PccMailbox::new(
                UniqueMmioPointer::from(&mut self.arm_local),
                UniqueMmioPointer::from(&mut self.timer),
                UniqueMmioPointer::from(&mut self.regions),
            );
            assert_eq!(handle_interrupt(gic, &mut mailbox, firmware), 0);
        }
    }

    fn assert_idle(region: &PccRegion, signature: u32) {
        assert_eq!(region.signature.0, signature);
        assert_eq!(region.command.0, 0);
        assert_eq!(region.status.0, 1);
    }

    #[test]
    fn region_layout() {
        assert_eq!(size_of::<PccRegion>(), 16);
        assert_eq!(offset_of!(PccRegion, com_space), 8);
        assert_eq!(offset_of!(PccRegions, channel1), 0x80);
    }

    #[test]
    fn idle_all_channels() {
        let mut hardware = FakeHardware::new(0);
        hardware.regions.channel0.status = ReadPureWrite(0x55);
        {
            let mut mailbox = PccMailbox::new(
                UniqueMmioPointer::from(&mut hardware.arm_local),
                UniqueMmioPointer::from(&mut hardware.timer),
                UniqueMmioPointer::from(&mut hardware.regions),
            );
            mailbox.idle_all();
        }
        assert_idle(&hardware.regions.channel0, 0x5043_4300);
        assert_idle(&hardware.regions.channel1, 0x5043_4301);
    }

    #[test]
    fn channel1_read() {
        let mut hardware = FakeHardware::new(0x1000_0000);
        hardware.regions.channel1.command = ReadPureWrite(0);
        hardware.regions.channel1.status = ReadPureWrite(0);
        hardware.regions.channel1.com_space = ReadPureWrite([1, 2, 3, 4, 5, 6, 7, 8]);
        let mut gic = FakeInterruptController::with_pending(32);
        let mut firmware = FakeFirmware::default();

        hardware.interrupt(&mut gic, &mut firmware);

        assert_eq!(firmware.calls, [FirmwareCall::Pwm]);
        assert_eq!(hardware.arm_local.mailbox_status.0, 0x1000_0000);
        assert_idle(&hardware.regions.channel1, 0x5043_4301);
        assert_eq!(
            hardware.regions.channel1.com_space.0,
            [1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert_eq!(gic.acknowledged, 1);
        assert_eq!(gic.ended, [32]);
    }

    #[test]
    fn channel0_counters() {
        let mut hardware = FakeHardware::new(0x0800_0000);
        hardware.timer.clo = ReadPure(3_000);
        let mut gic = FakeInterruptController::with_pending(32);
        let mut firmware = FakeFirmware {
            clock_rate: 1_500_000_000,
            ..Default::default()
        };

        hardware.interrupt(&mut gic, &mut firmware);

        assert_eq!(firmware.calls, [FirmwareCall::ArmClockRate]);
        let com_space = hardware.regions.channel0.com_space.0;
        assert_eq!(u32::from_le_bytes(com_space[..4].try_into().unwrap()), 3_000);
        // 3000 * 15 / 15
        assert_eq!(u32::from_le_bytes(com_space[4..].try_into().unwrap()), 3_000);
        assert_idle(&hardware.regions.channel0, 0x5043_4300);
    }

    #[test]
    fn channel0_counters_wrap() {
        let mut hardware = FakeHardware::new(0x0800_0000);
        hardware.timer.clo = ReadPure(0x8000_0000);
        let mut gic = FakeInterruptController::with_pending(32);
        let mut firmware = FakeFirmware {
            clock_rate: 1_800_000_000,
            ..Default::default()
        };

        hardware.interrupt(&mut gic, &mut firmware);

        let com_space = hardware.regions.channel0.com_space.0;
        assert_eq!(com_space[..4], 0x8000_0000u32.to_le_bytes());
        // 0x8000_0000 * 18 wraps to 0.
        assert_eq!(com_space[4..], [0, 0, 0, 0]);
    }

    #[test]
    fn channel0_without_clock_rate() {
        let mut hardware = FakeHardware::new(0x0800_0000);
        hardware.timer.clo = ReadPure(77);
        let mut gic = FakeInterruptController::with_pending(32);
        let mut firmware = FakeFirmware {
            error: Some(FirmwareError::RequestFailed(0)),
            ..Default::default()
        };

        hardware.interrupt(&mut gic, &mut firmware);

        let com_space = hardware.regions.channel0.com_space.0;
        assert_eq!(com_space, [77, 0, 0, 0, 0, 0, 0, 0]);
        assert_idle(&hardware.regions.channel0, 0x5043_4300);
    }

    #[test]
    fn unsupported_write_is_completed() {
        let mut hardware = FakeHardware::new(0x0800_0000);
        hardware.regions.channel0.command = ReadPureWrite(1);
        hardware.regions.channel0.com_space = ReadPureWrite([9; 8]);
        let mut gic = FakeInterruptController::with_pending(32);
        let mut firmware = FakeFirmware::default();

        hardware.interrupt(&mut gic, &mut firmware);

        assert!(firmware.calls.is_empty());
        assert_eq!(hardware.regions.channel0.com_space.0, [9; 8]);
        assert_idle(&hardware.regions.channel0, 0x5043_4300);
    }

    #[test]
    fn both_channels_idle_after_any_request() {
        let mut hardware = FakeHardware::new(0x3000_0000);
        hardware.regions.channel0.signature = ReadPureWrite(0);
        hardware.regions.channel0.command = ReadPureWrite(5);
        hardware.regions.channel1.command = ReadPureWrite(7);
        let mut gic = FakeInterruptController::with_pending(32);
        let mut firmware = FakeFirmware::default();

        hardware.interrupt(&mut gic, &mut firmware);

        assert!(firmware.calls.is_empty());
        assert_idle(&hardware.regions.channel0, 0x5043_4300);
        assert_idle(&hardware.regions.channel1, 0x5043_4301);
    }

    #[test]
    fn clock_request_clamped() {
        for (requested, expected) in [
            (0, 600_000_000),
            (599, 600_000_000),
            (1_500, 1_500_000_000),
            (2_200, 2_200_000_000),
            (0x07ff_ffff, 2_200_000_000),
        ] {
            let mut hardware = FakeHardware::new(requested);
            let mut gic = FakeInterruptController::with_pending(32);
            let mut firmware = FakeFirmware::default();

            hardware.interrupt(&mut gic, &mut firmware);

            assert_eq!(firmware.calls, [FirmwareCall::SetArmClockRate(expected)]);
            assert_idle(&hardware.regions.channel0, 0x5043_4300);
            assert_idle(&hardware.regions.channel1, 0x5043_4301);
        }
    }

    #[test]
    fn fan_request() {
        let mut hardware = FakeHardware::new(0x4000_01ff);
        let mut gic = FakeInterruptController::with_pending(32);
        let mut firmware = FakeFirmware::default();

        hardware.interrupt(&mut gic, &mut firmware);

        assert_eq!(firmware.calls, [FirmwareCall::SetPwm(0xff)]);
    }

    #[test]
    fn fan_and_channel_requests_together() {
        let mut hardware = FakeHardware::new(0x5800_0010);
        let mut gic = FakeInterruptController::with_pending(32);
        let mut firmware = FakeFirmware::default();

        hardware.interrupt(&mut gic, &mut firmware);

        assert_eq!(
            firmware.calls,
            [
                FirmwareCall::Pwm,
                FirmwareCall::ArmClockRate,
                FirmwareCall::SetPwm(0x10)
            ]
        );
    }

    #[test]
    fn other_interrupt_ignored() {
        let mut hardware = FakeHardware::new(0x4000_0020);
        let mut gic = FakeInterruptController::with_pending(1023);
        let mut firmware = FakeFirmware::default();

        hardware.interrupt(&mut gic, &mut firmware);

        assert!(firmware.calls.is_empty());
        assert_eq!(hardware.arm_local.mailbox_status.0, 0x4000_0020);
        assert_eq!(hardware.regions.channel0.signature.0, 0);
        assert_eq!(gic.acknowledged, 1);
        assert_eq!(gic.ended, [1023]);
    }
}
