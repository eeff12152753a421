// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

mod rpi4;

use rpi4::Rpi4Builder;
use std::{error::Error, path::Path};

pub const PLATFORMS: [&str; 1] = [Rpi4Builder::PLAT_NAME];

pub trait Builder {
    /// Base address of the BL31 binary.
    ///
    /// This is passed to the linker script through the `BL31_BASE` symbol.
    fn bl31_base(&self) -> u64;

    /// Size of the BL31 binary.
    ///
    /// This is passed to the linker script through the `BL31_SIZE` symbol.
    fn bl31_size(&self) -> u64;
}

pub fn get_builder(platform: &str) -> Result<Box<dyn Builder>, Box<dyn Error>> {
    match platform {
        Rpi4Builder::PLAT_NAME => Ok(Box::new(Rpi4Builder)),
        _ => Err(format!(
            "Unexpected platform name {platform:?}. Supported platforms: {PLATFORMS:?}"
        )
        .into()),
    }
}

pub fn add_linker_script(path: &Path) {
    println!("cargo:rustc-link-arg=-T{}", path.display());
    println!("cargo:rerun-if-changed={}", path.display());
}

pub fn define_linker_symbol(name: &str, value: u64) {
    println!("cargo:rustc-link-arg=--defsym=\"{name}\"={value}");
}
