// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::Builder;

pub struct Rpi4Builder;

impl Rpi4Builder {
    pub const PLAT_NAME: &str = "rpi4";

    /// The VideoCore loads the armstub at address 0 and starts the ARM cores there.
    const BL31_BASE: u64 = 0;
    /// Everything up to the default kernel address, which is what the device tree reserves.
    const BL31_SIZE: u64 = 0x8_0000;
}

impl Builder for Rpi4Builder {
    fn bl31_base(&self) -> u64 {
        Self::BL31_BASE
    }

    fn bl31_size(&self) -> u64 {
        Self::BL31_SIZE
    }
}
