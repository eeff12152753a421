// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The Power State Coordination Interface, as far as BL31 implements it.
//!
//! Only the system-wide power functions are implemented. Secondary cores stay parked, so the CPU
//! power management functions return `NOT_SUPPORTED`.

use crate::smccc::{FunctionId as SmcFunctionId, OwningEntityNumber};
use arm_psci::{ErrorCode, Function, FunctionId, MigrateInfoType, PsciFeature, Version};
use log::debug;

const FUNCTION_NUMBER_MIN: u16 = 0x0000;
const FUNCTION_NUMBER_MAX: u16 = 0x001f;

/// The PSCI version returned by `PSCI_VERSION`. The `/psci` device tree node is compatible with
/// the same version.
pub const PSCI_VERSION: Version = Version { major: 1, minor: 0 };

/// The `compatible` strings of the `/psci` device tree node, newest version first.
pub const COMPATIBLE: [&str; 3] = ["arm,psci-1.0", "arm,psci-0.2", "arm,psci"];

/// The functions listed with their IDs in the `/psci` device tree node.
pub const ADVERTISED_FUNCTIONS: [(&str, FunctionId); 2] = [
    ("sys_poweroff", FunctionId::SystemOff),
    ("sys_reset", FunctionId::SystemReset),
];

/// System power control provided by the platform.
pub trait SystemPower {
    /// Turns the system off.
    fn system_off(&mut self) -> !;

    /// Resets the system, equivalent to a power cycle.
    fn system_reset(&mut self) -> !;
}

/// Returns whether the function belongs to PSCI.
pub fn owns(function: SmcFunctionId) -> bool {
    function.oen() == OwningEntityNumber::STANDARD_SECURE
        && (FUNCTION_NUMBER_MIN..=FUNCTION_NUMBER_MAX).contains(&function.number())
}

/// Handles a PSCI call with the given `x0` to `x3`, returning the value for `x0`.
///
/// `SYSTEM_OFF` and `SYSTEM_RESET` don't return.
pub fn handle_psci(regs: &[u64; 4], power: &mut impl SystemPower) -> u64 {
    match handle_psci_inner(regs, power) {
        Ok(result) => result,
        Err(error_code) => error_code.into(),
    }
}

fn handle_psci_inner(regs: &[u64; 4], power: &mut impl SystemPower) -> Result<u64, ErrorCode> {
    match Function::try_from(regs)? {
        Function::Version => Ok(u32::from(PSCI_VERSION).into()),
        Function::Features { psci_func_id } => handle_features(psci_func_id),
        Function::MigrateInfoType => Ok(u32::from(MigrateInfoType::MigrationNotRequired).into()),
        Function::SystemOff => power.system_off(),
        Function::SystemReset => power.system_reset(),
        _ => {
            debug!("Unsupported PSCI function {:#010x}", regs[0]);
            Err(ErrorCode::NotSupported)
        }
    }
}

/// Handles `PSCI_FEATURES`.
fn handle_features(feature: PsciFeature) -> Result<u64, ErrorCode> {
    const SUCCESS: u64 = 0;

    match feature {
        PsciFeature::PsciFunction(
            FunctionId::PsciVersion
            | FunctionId::PsciFeatures
            | FunctionId::MigrateInfoType
            | FunctionId::SystemOff
            | FunctionId::SystemReset,
        ) => Ok(SUCCESS),
        PsciFeature::PsciFunction(_) => Err(ErrorCode::NotSupported),
        PsciFeature::SmcccVersion => Ok(SUCCESS),
    }
}
