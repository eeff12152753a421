// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Requests to the VideoCore firmware, through the mailbox property interface.

use crate::{
    aarch64::{clean_dcache_range, clean_invalidate_dcache_range, dsb_sy},
    platform::{Platform, PlatformImpl},
};
use bitflags::bitflags;
use core::hint::spin_loop;
use log::{debug, trace};
use num_enum::IntoPrimitive;
use safe_mmio::{
    UniqueMmioPointer, field, field_shared,
    fields::{ReadOnly, ReadPure, ReadPureWrite, WriteOnly},
};
use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The mailbox channel for property tags from the ARM to the VideoCore.
const PROPERTY_CHANNEL: u32 = 8;

/// Request code for a property message.
const PROCESS_REQUEST: u32 = 0;
/// Response code for a property message which was processed successfully.
const REQUEST_SUCCESSFUL: u32 = 0x8000_0000;
/// Set in a tag's request code by the firmware once it has handled the tag.
const TAG_RESPONSE: u32 = 0x8000_0000;

const TAG_GET_BOARD_REVISION: u32 = 0x0001_0002;
const TAG_SET_POWER_STATE: u32 = 0x0002_8001;
const TAG_GET_CLOCK_RATE: u32 = 0x0003_0002;
const TAG_GET_MAX_CLOCK_RATE: u32 = 0x0003_0004;
const TAG_SET_CLOCK_RATE: u32 = 0x0003_8002;
const TAG_GET_POE_HAT_VAL: u32 = 0x0003_0049;
const TAG_SET_POE_HAT_VAL: u32 = 0x0003_0050;

/// The firmware's ID for the ARM cores' clock.
const CLOCK_ID_ARM: u32 = 3;
/// The PoE HAT register holding the fan PWM duty cycle.
const POE_HAT_PWM_REGISTER: u32 = 0;

/// The size in bytes of the value buffer of a [`PropertyMessage`].
const VALUE_BUFFER_SIZE: usize = 12;

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct MailboxStatus: u32 {
        const FULL = 1 << 31;
        const EMPTY = 1 << 30;
    }

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct PowerState: u32 {
        const ON = 1 << 0;
        const WAIT = 1 << 1;
    }
}

/// Set in the power state response if the device doesn't exist.
const POWER_STATE_NO_DEVICE: u32 = 1 << 1;

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum FirmwareError {
    #[error("Firmware failed to process request, response code {0:#010x}")]
    RequestFailed(u32),
    #[error("Firmware did not handle tag {0:#010x}")]
    TagNotHandled(u32),
    #[error("Power domain {0:?} does not exist")]
    NoSuchDevice(PowerDomain),
}

/// The power domains the firmware can switch.
#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq)]
#[repr(u32)]
pub enum PowerDomain {
    Sdcard = 0,
    Uart0 = 1,
    Uart1 = 2,
    UsbHcd = 3,
    I2c0 = 4,
    I2c1 = 5,
    I2c2 = 6,
    Spi = 7,
    Ccp2tx = 8,
}

/// The requests BL31 makes to the VideoCore firmware.
///
/// Every request is synchronous.
pub trait Firmware {
    /// Returns the board revision code.
    fn board_revision(&mut self) -> Result<u32, FirmwareError>;

    /// Returns the current ARM clock rate in Hz.
    fn arm_clock_rate(&mut self) -> Result<u32, FirmwareError>;

    /// Returns the maximum supported ARM clock rate in Hz.
    fn max_arm_clock_rate(&mut self) -> Result<u32, FirmwareError>;

    /// Sets the ARM clock rate in Hz.
    fn set_arm_clock_rate(&mut self, hz: u32) -> Result<(), FirmwareError>;

    /// Returns the current PoE HAT fan duty cycle.
    fn pwm(&mut self) -> Result<u32, FirmwareError>;

    /// Sets the PoE HAT fan duty cycle, from 0 (off) to 255 (full speed).
    fn set_pwm(&mut self, duty: u8) -> Result<(), FirmwareError>;

    /// Switches the given power domain on or off, optionally waiting for it to become stable.
    fn set_power(&mut self, domain: PowerDomain, on: bool, wait: bool)
    -> Result<(), FirmwareError>;
}

/// VideoCore mailbox registers.
#[derive(Clone, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
#[repr(C, align(4))]
pub struct VcMailboxRegisters {
    /// Mailbox 0 read register, for messages from the VideoCore.
    pub read: ReadOnly<u32>,
    _reserved: [u32; 3],
    /// Reads the next message without removing it.
    pub peek: ReadPure<u32>,
    pub sender: ReadPure<u32>,
    /// Mailbox 0 status.
    pub status: ReadPure<u32>,
    pub config: ReadPureWrite<u32>,
    /// Mailbox 1 write register, for messages to the VideoCore.
    pub write: WriteOnly<u32>,
}

/// A property message with a single tag, shared with the VideoCore.
#[derive(Clone, Debug, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
#[repr(C, align(16))]
pub struct PropertyMessage {
    size: u32,
    code: u32,
    tag: u32,
    value_size: u32,
    tag_code: u32,
    values: [u32; 3],
    end: u32,
    _padding: [u32; 3],
}

impl PropertyMessage {
    /// A message buffer with nothing in it yet.
    pub const EMPTY: Self = Self {
        size: 0,
        code: 0,
        tag: 0,
        value_size: 0,
        tag_code: 0,
        values: [0; 3],
        end: 0,
        _padding: [0; 3],
    };

    /// Creates a request for the given tag with the given request values.
    fn request(tag: u32, request: &[u32]) -> Self {
        let mut values = [0; 3];
        values[..request.len()].copy_from_slice(request);
        Self {
            size: size_of::<Self>() as u32,
            code: PROCESS_REQUEST,
            tag,
            value_size: VALUE_BUFFER_SIZE as u32,
            tag_code: size_of_val(request) as u32,
            values,
            end: 0,
            _padding: [0; 3],
        }
    }

    /// Checks that the firmware handled the request, and returns the response values.
    fn response(&self) -> Result<[u32; 3], FirmwareError> {
        if self.code != REQUEST_SUCCESSFUL {
            return Err(FirmwareError::RequestFailed(self.code));
        }
        if self.tag_code & TAG_RESPONSE == 0 {
            return Err(FirmwareError::TagNotHandled(self.tag));
        }
        Ok(self.values)
    }
}

/// A client for the VideoCore mailbox property interface.
pub struct VcMailbox<'a> {
    regs: UniqueMmioPointer<'a, VcMailboxRegisters>,
    message: &'a mut PropertyMessage,
}

impl<'a> VcMailbox<'a> {
    /// Creates a client using the given registers, passing messages through `message`.
    ///
    /// `message` must be at a physical address below 4 GiB, identity mapped.
    pub fn new(
        regs: UniqueMmioPointer<'a, VcMailboxRegisters>,
        message: &'a mut PropertyMessage,
    ) -> Self {
        Self { regs, message }
    }

    /// Sends a single tag to the firmware and waits for the response.
    fn call(&mut self, tag: u32, request: &[u32]) -> Result<[u32; 3], FirmwareError> {
        let address = (&raw const *self.message).addr();
        // The message is 16-byte aligned, leaving the low bits for the channel.
        let token = address as u32 | PROPERTY_CHANNEL;

        *self.message = PropertyMessage::request(tag, request);
        let granule = PlatformImpl::CACHE_WRITEBACK_GRANULE;
        clean_dcache_range(address, size_of::<PropertyMessage>(), granule);

        while self.status().contains(MailboxStatus::FULL) {
            spin_loop();
        }
        trace!("Mailbox request {tag:#010x} {request:#x?}");
        field!(self.regs, write).write(token);

        loop {
            while self.status().contains(MailboxStatus::EMPTY) {
                spin_loop();
            }
            let value = field!(self.regs, read).read();
            if value == token {
                break;
            }
            debug!("Ignoring unexpected mailbox message {value:#010x}");
        }

        clean_invalidate_dcache_range(address, size_of::<PropertyMessage>(), granule);
        dsb_sy();
        self.message.response()
    }

    fn status(&self) -> MailboxStatus {
        MailboxStatus::from_bits_retain(field_shared!(self.regs, status).read())
    }
}

impl Firmware for VcMailbox<'_> {
    fn board_revision(&mut self) -> Result<u32, FirmwareError> {
        Ok(self.call(TAG_GET_BOARD_REVISION, &[])?[0])
    }

    fn arm_clock_rate(&mut self) -> Result<u32, FirmwareError> {
        Ok(self.call(TAG_GET_CLOCK_RATE, &[CLOCK_ID_ARM])?[1])
    }

    fn max_arm_clock_rate(&mut self) -> Result<u32, FirmwareError> {
        Ok(self.call(TAG_GET_MAX_CLOCK_RATE, &[CLOCK_ID_ARM])?[1])
    }

    fn set_arm_clock_rate(&mut self, hz: u32) -> Result<(), FirmwareError> {
        // The last value asks the firmware not to skip setting turbo mode.
        self.call(TAG_SET_CLOCK_RATE, &[CLOCK_ID_ARM, hz, 0])?;
        Ok(())
    }

    fn pwm(&mut self) -> Result<u32, FirmwareError> {
        Ok(self.call(TAG_GET_POE_HAT_VAL, &[POE_HAT_PWM_REGISTER, 0])?[1])
    }

    fn set_pwm(&mut self, duty: u8) -> Result<(), FirmwareError> {
        self.call(TAG_SET_POE_HAT_VAL, &[POE_HAT_PWM_REGISTER, duty.into()])?;
        Ok(())
    }

    fn set_power(
        &mut self,
        domain: PowerDomain,
        on: bool,
        wait: bool,
    ) -> Result<(), FirmwareError> {
        let mut state = PowerState::empty();
        state.set(PowerState::ON, on);
        state.set(PowerState::WAIT, wait);
        let response = self.call(TAG_SET_POWER_STATE, &[domain.into(), state.bits()])?;
        if response[1] & POWER_STATE_NO_DEVICE != 0 {
            return Err(FirmwareError::NoSuchDevice(domain));
        }
        Ok(())
    }
}
