// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Types and helpers related to the SMC Calling Convention.

use crate::psci::{self, SystemPower};
use core::fmt::{self, Debug, Display, Formatter};
use log::debug;

const FAST_CALL: u32 = 0x8000_0000;
const SMC64: u32 = 0x4000_0000;
const OEN_MASK: u32 = 0x3f00_0000;
const OEN_SHIFT: u8 = 24;
const SVE_HINT: u32 = 1 << 16;

/// The call is not supported by the implementation.
pub const NOT_SUPPORTED: i32 = -1;

/// SMCCC version 1.1, as returned by `SMCCC_VERSION`.
const SMCCC_VERSION_1_1: u64 = 0x1_0001;

/// The `SMCCC_VERSION` function.
pub const SMCCC_VERSION: FunctionId =
    FunctionId::new(SmcccCallType::Fast32, OwningEntityNumber::ARM_ARCHITECTURE, 0);

/// The type of an SMCCC call: whether it is a fast call or yielding call, and which calling
/// convention it uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SmcccCallType {
    /// An SMC32/HVC32 fast call.
    Fast32,
    /// An SMC64/HVC64 fast call.
    Fast64,
    /// A yielding call.
    Yielding,
}

/// Owning Entity Number (OEN)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OwningEntityNumber(pub u8);

impl OwningEntityNumber {
    pub const ARM_ARCHITECTURE: Self = Self(0);
    pub const STANDARD_SECURE: Self = Self(4);
}

impl Display for OwningEntityNumber {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An SMCCC function ID.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct FunctionId(pub u32);

impl FunctionId {
    /// Creates a new `FunctionId` from its components.
    pub const fn new(call_type: SmcccCallType, oen: OwningEntityNumber, number: u16) -> Self {
        let type_bits = match call_type {
            SmcccCallType::Fast32 => FAST_CALL,
            SmcccCallType::Fast64 => FAST_CALL | SMC64,
            SmcccCallType::Yielding => 0,
        };
        Self(type_bits | (((oen.0 as u32) << OEN_SHIFT) & OEN_MASK) | (number as u32))
    }

    /// Returns the Owning Entity Number of the function ID.
    pub fn oen(self) -> OwningEntityNumber {
        OwningEntityNumber(((self.0 & OEN_MASK) >> OEN_SHIFT) as u8)
    }

    /// Returns the lower 16 bits of the function ID.
    pub fn number(self) -> u16 {
        self.0 as u16
    }

    /// Returns what type of call this is.
    pub fn call_type(self) -> SmcccCallType {
        if self.0 & FAST_CALL != 0 {
            if self.0 & SMC64 != 0 {
                SmcccCallType::Fast64
            } else {
                SmcccCallType::Fast32
            }
        } else {
            SmcccCallType::Yielding
        }
    }

    /// Clears the SVE hint bit.
    pub fn clear_sve_hint(&mut self) {
        self.0 &= !SVE_HINT
    }
}

impl Display for FunctionId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Debug for FunctionId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:#010x} ({:?} OEN {})",
            self.0,
            self.call_type(),
            self.oen(),
        )
    }
}

/// Handles an SMC from the non-secure world with the given `x0` to `x3`, returning the value for
/// its `x0`.
///
/// `SMCCC_VERSION` and the PSCI functions are implemented. The upper 32 bits of `x0` are ignored,
/// as SMCCC requires.
pub fn handle_smc(regs: &[u64; 4], power: &mut impl SystemPower) -> u64 {
    let mut function = FunctionId(regs[0] as u32);
    function.clear_sve_hint();
    if function == SMCCC_VERSION {
        SMCCC_VERSION_1_1
    } else if psci::owns(function) {
        let mut regs = *regs;
        regs[0] = function.0.into();
        psci::handle_psci(&regs, power)
    } else {
        debug!("Unsupported SMC {function:?}");
        NOT_SUPPORTED as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fdt::{Fdt, builder::FdtBuilder, fixup::add_psci_node},
        platform::test::FakeSystemPower,
    };
    use arm_psci::FunctionId as PsciFunctionId;

    fn smc(x0: u64, x1: u64) -> u64 {
        handle_smc(&[x0, x1, 0, 0], &mut FakeSystemPower)
    }

    #[test]
    fn function_id_fields() {
        let function = FunctionId(0xc400_0003);
        assert_eq!(function.call_type(), SmcccCallType::Fast64);
        assert_eq!(function.oen(), OwningEntityNumber::STANDARD_SECURE);
        assert_eq!(function.number(), 3);
        assert_eq!(FunctionId(0x0100_0000).call_type(), SmcccCallType::Yielding);
    }

    #[test]
    fn smccc_version() {
        assert_eq!(smc(0x8000_0000, 0), 0x1_0001);
        assert_eq!(smc(0xffff_ffff_8000_0000, 0), 0x1_0001);
        assert_eq!(smc(0x8001_0000, 0), 0x1_0001);
    }

    #[test]
    fn psci_version_matches_device_tree() {
        let mut blob = FdtBuilder::new().tree(|builder| {
            builder.begin_node("");
            builder.end_node();
        });
        blob.resize(0x1000, 0);
        let mut fdt = Fdt::open_into(&mut blob).unwrap();
        add_psci_node(&mut fdt).unwrap();
        let psci = fdt.path_offset("/psci").unwrap();

        // The newest compatible version is the one the node promises.
        let compatible = fdt.property(psci, "compatible").unwrap();
        let newest = compatible.split(|byte| *byte == 0).next().unwrap();
        let (major, minor) = core::str::from_utf8(newest)
            .unwrap()
            .strip_prefix("arm,psci-")
            .unwrap()
            .split_once('.')
            .unwrap();
        let version = smc(u32::from(PsciFunctionId::PsciVersion).into(), 0);
        assert_eq!(version >> 16, major.parse().unwrap());
        assert_eq!(version & 0xffff, minor.parse().unwrap());

        // Every function ID in the node is implemented.
        for name in ["sys_poweroff", "sys_reset"] {
            let id = u32::from_be_bytes(fdt.property(psci, name).unwrap().try_into().unwrap());
            let features = u32::from(PsciFunctionId::PsciFeatures).into();
            assert_eq!(smc(features, id.into()), 0, "{name}");
        }
        assert_eq!(fdt.property(psci, "cpu_on"), Err(crate::fdt::FdtError::NotFound));
    }

    #[test]
    fn psci_with_sve_hint() {
        assert_eq!(smc(0x8401_0000, 0), 0x1_0000);
    }

    #[test]
    fn everything_else_not_supported() {
        assert_eq!(smc(0x8200_0000, 0), u64::MAX);
        assert_eq!(smc(0x8400_0020, 0), u64::MAX);
        assert_eq!(smc(0xc300_0001, 0), u64::MAX);
    }
}
