// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Build script for the Raspberry Pi 4 BL31.

mod platforms;

use platforms::{Builder, PLATFORMS, add_linker_script, define_linker_symbol, get_builder};
use std::{env, path::Path};

fn setup_linker(builder: &dyn Builder) {
    define_linker_symbol("BL31_BASE", builder.bl31_base());
    define_linker_symbol("BL31_SIZE", builder.bl31_size());
    add_linker_script(Path::new("bl31.ld"));
}

fn main() {
    println!(
        "cargo::rustc-check-cfg=cfg(platform, values(\"{}\"))",
        PLATFORMS.join("\", \""),
    );
    println!("cargo:rerun-if-env-changed=RPI4_PRELOADED_BL33_BASE");
    println!("cargo:rerun-if-env-changed=RPI4_PRELOADED_DTB_BASE");
    println!("cargo:rerun-if-env-changed=LOG_LEVEL");

    if env::var("CARGO_CFG_TARGET_OS").unwrap() == "none" {
        let platform = env::var("CARGO_CFG_PLATFORM").expect("Missing platform name");

        let platform_builder = get_builder(&platform).unwrap();

        setup_linker(&*platform_builder);
    }
}
