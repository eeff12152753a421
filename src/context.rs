// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use arm_sysregs::SpsrEl3;

/// A security state which a lower exception level can run in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum World {
    Secure,
    NonSecure,
}

/// The execution state the next image is entered in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExecutionState {
    AArch64,
    AArch32,
}

/// `SPSR.M[3:0]` value for AArch32 Supervisor mode.
const SPSR_M_AARCH32_SVC: u64 = 0b0011;

impl ExecutionState {
    /// Returns the `spsr_el3` value to enter a non-secure image in this execution state, with all
    /// exceptions masked.
    ///
    /// AArch64 images are entered at EL2 using `SP_EL2`, AArch32 images in Supervisor mode.
    pub fn non_secure_spsr(self) -> SpsrEl3 {
        match self {
            Self::AArch64 => {
                SpsrEl3::D | SpsrEl3::A | SpsrEl3::I | SpsrEl3::F | SpsrEl3::M_AARCH64_EL2H
            }
            Self::AArch32 => {
                SpsrEl3::A
                    | SpsrEl3::I
                    | SpsrEl3::F
                    | SpsrEl3::M_4
                    | SpsrEl3::from_bits_retain(SPSR_M_AARCH32_SVC)
            }
        }
    }
}

/// Information about the entry point for a next stage (e.g. BL32 or BL33).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EntryPointInfo {
    /// The entry point address.
    pub pc: usize,
    /// The `spsr_el3` value to set before `eret`, to set the appropriate PSTATE.
    pub spsr: SpsrEl3,
    /// The security state to enter the image in.
    pub security_state: World,
    /// Boot arguments to pass in `x0`-`x7`.
    pub args: [u64; 8],
}

impl EntryPointInfo {
    /// Returns an entry point with no image, for a world which has nothing to run.
    pub const fn empty(security_state: World) -> Self {
        Self {
            pc: 0,
            spsr: SpsrEl3::empty(),
            security_state,
            args: [0; 8],
        }
    }

    /// Returns whether there is an image to enter.
    pub fn is_valid(&self) -> bool {
        self.pc != 0
    }

    /// Returns the execution state the image will run in.
    pub fn execution_state(&self) -> ExecutionState {
        if self.spsr.contains(SpsrEl3::M_4) {
            ExecutionState::AArch32
        } else {
            ExecutionState::AArch64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aarch64_spsr() {
        let spsr = ExecutionState::AArch64.non_secure_spsr();
        assert_eq!(spsr.bits(), 0x3c9);
    }

    #[test]
    fn aarch32_spsr() {
        let spsr = ExecutionState::AArch32.non_secure_spsr();
        assert_eq!(spsr.bits(), 0x1d3);
    }

    #[test]
    fn execution_state_from_spsr() {
        let mut entry = EntryPointInfo::empty(World::NonSecure);
        assert!(!entry.is_valid());
        entry.pc = 0x8_0000;
        entry.spsr = ExecutionState::AArch32.non_secure_spsr();
        assert!(entry.is_valid());
        assert_eq!(entry.execution_state(), ExecutionState::AArch32);
    }
}
