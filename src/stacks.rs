// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use crate::platform::{Platform, PlatformImpl};

/// The number of bytes of stack space to reserve for the primary core.
const STACK_SIZE: usize = 0x4000;

#[allow(unused)]
const _: () = assert!(
    STACK_SIZE % PlatformImpl::CACHE_WRITEBACK_GRANULE == 0,
    "Stack size not correctly aligned"
);

#[cfg(all(target_arch = "aarch64", not(test)))]
mod asm {
    use super::*;
    use core::arch::global_asm;

    global_asm!(
        ".section .stacks, \"aw\", %nobits",
        ".balign {CACHE_WRITEBACK_GRANULE}",
        "primary_stack:",
        ".space {STACK_SIZE}, 0",
        ".global primary_stack_top",
        "primary_stack_top:",
        CACHE_WRITEBACK_GRANULE = const PlatformImpl::CACHE_WRITEBACK_GRANULE,
        STACK_SIZE = const STACK_SIZE,
    );
}
