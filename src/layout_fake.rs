// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use core::ops::Range;

pub fn bl31_image() -> Range<usize> {
    0x1000..0x8_0000
}

pub fn code() -> Range<usize> {
    0x1000..0x2_0000
}

pub fn rodata() -> Range<usize> {
    0x2_0000..0x3_0000
}
