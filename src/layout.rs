// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Address ranges of the BL31 image, from symbols defined by the linker script.

use core::ops::Range;

unsafe extern "C" {
    // These aren't really variables, just symbols defined by the linker script whose addresses we
    // need to get. They should never be read or written.
    static __BL31_START__: u32;
    static __BL31_END__: u32;
    static __TEXT_START__: u32;
    static __TEXT_END__: u32;
    static __RODATA_START__: u32;
    static __RODATA_END__: u32;
}

/// Returns the whole BL31 image after the boot stub page, including its stack and bss.
pub fn bl31_image() -> Range<usize> {
    (&raw const __BL31_START__) as usize..(&raw const __BL31_END__) as usize
}

/// Returns the range of executable code.
pub fn code() -> Range<usize> {
    (&raw const __TEXT_START__) as usize..(&raw const __TEXT_END__) as usize
}

/// Returns the range of read-only data.
pub fn rodata() -> Range<usize> {
    (&raw const __RODATA_START__) as usize..(&raw const __RODATA_END__) as usize
}
