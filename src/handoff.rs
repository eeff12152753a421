// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The handshake with the VideoCore boot firmware, and the build-time boot configuration.
//!
//! The firmware loads BL31 at address 0 and, if it recognises the stub header, clears the magic
//! word and fills in the device tree and kernel addresses before starting the primary core.

use crate::context::ExecutionState;
use log::warn;
use safe_mmio::{
    UniqueMmioPointer, field,
    fields::{ReadPure, ReadPureWrite},
};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Offset of the stub header from the start of the image.
pub const STUB_HEADER_OFFSET: usize = 0xf0;

/// Value of the magic word before the firmware has processed the header.
pub const STUB_MAGIC: u32 = 0x5afe_570b;

/// Where the kernel is expected when the firmware didn't tell us.
pub const DEFAULT_KERNEL_ADDRESS: usize = 0x8_0000;

/// The words at [`STUB_HEADER_OFFSET`] shared with the VideoCore firmware.
#[derive(Clone, Debug, Default, Eq, FromBytes, Immutable, IntoBytes, KnownLayout, PartialEq)]
#[repr(C, align(4))]
pub struct StubHeader {
    /// [`STUB_MAGIC`], or 0 once the firmware has filled in the rest of the header.
    pub magic: ReadPureWrite<u32>,
    /// Header version.
    pub version: ReadPure<u32>,
    /// Physical address of the device tree blob.
    pub dtb_ptr32: ReadPure<u32>,
    /// Physical address of the kernel image.
    pub kernel_entry32: ReadPure<u32>,
}

/// Boot options fixed at build time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BootConfig {
    /// Entry point of an already loaded BL33, overriding the address from the stub header.
    pub preloaded_bl33_base: Option<usize>,
    /// Address of an already loaded device tree, overriding the address from the stub header.
    pub preloaded_dtb_base: Option<usize>,
    /// Whether BL33 is a Linux kernel which expects its boot arguments from us.
    pub direct_linux_boot: bool,
    /// The execution state of BL33.
    pub bl33_execution_state: ExecutionState,
}

impl BootConfig {
    /// Returns the configuration selected by the Cargo features `direct-linux-boot` and
    /// `bl33-aarch32`, and the build-time environment variables `RPI4_PRELOADED_BL33_BASE` and
    /// `RPI4_PRELOADED_DTB_BASE`.
    pub const fn from_build_env() -> Self {
        Self {
            preloaded_bl33_base: parse_address(option_env!("RPI4_PRELOADED_BL33_BASE")),
            preloaded_dtb_base: parse_address(option_env!("RPI4_PRELOADED_DTB_BASE")),
            direct_linux_boot: cfg!(feature = "direct-linux-boot"),
            bl33_execution_state: if cfg!(feature = "bl33-aarch32") {
                ExecutionState::AArch32
            } else {
                ExecutionState::AArch64
            },
        }
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal address at compile time.
///
/// Panics (failing the build when used in a const context) if the string is not a valid address.
const fn parse_address(value: Option<&str>) -> Option<usize> {
    let Some(value) = value else {
        return None;
    };
    let bytes = value.as_bytes();
    let (radix, mut i) = if bytes.len() > 2 && bytes[0] == b'0' && (bytes[1] | 0x20) == b'x' {
        (16, 2)
    } else {
        (10, 0)
    };
    assert!(i < bytes.len(), "Empty address");
    let mut address: usize = 0;
    while i < bytes.len() {
        let digit = match bytes[i] {
            b'0'..=b'9' => bytes[i] - b'0',
            b'a'..=b'f' if radix == 16 => bytes[i] - b'a' + 10,
            b'A'..=b'F' if radix == 16 => bytes[i] - b'A' + 10,
            b'_' => {
                i += 1;
                continue;
            }
            _ => panic!("Invalid digit in address"),
        };
        address = match address.checked_mul(radix) {
            Some(shifted) => match shifted.checked_add(digit as usize) {
                Some(address) => address,
                None => panic!("Address out of range"),
            },
            None => panic!("Address out of range"),
        };
        i += 1;
    }
    Some(address)
}

/// A snapshot of the stub header, taken once during early boot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BootHandoff {
    /// Whether the firmware cleared the magic word, so the other fields are meaningful.
    pub stub_cleared: bool,
    /// Device tree address provided by the firmware.
    pub dtb_ptr32: u32,
    /// Kernel address provided by the firmware.
    pub kernel_entry32: u32,
}

impl BootHandoff {
    /// Reads the stub header.
    pub fn read(header: &mut UniqueMmioPointer<StubHeader>) -> Self {
        Self {
            stub_cleared: field!(*header, magic).read() == 0,
            dtb_ptr32: field!(*header, dtb_ptr32).read(),
            kernel_entry32: field!(*header, kernel_entry32).read(),
        }
    }

    /// Returns the entry point of the non-secure image.
    ///
    /// A preloaded address takes precedence, then the address provided by the firmware. If neither
    /// is available the kernel is assumed to be at [`DEFAULT_KERNEL_ADDRESS`].
    pub fn non_secure_entry_address(&self, config: &BootConfig) -> usize {
        if let Some(base) = config.preloaded_bl33_base {
            base
        } else if self.stub_cleared {
            self.kernel_entry32 as usize
        } else {
            warn!("Stub magic failure, using default kernel address {DEFAULT_KERNEL_ADDRESS:#x}");
            DEFAULT_KERNEL_ADDRESS
        }
    }

    /// Returns the address of the device tree blob, if known.
    pub fn dtb_address(&self, config: &BootConfig) -> Option<usize> {
        if let Some(base) = config.preloaded_dtb_base {
            Some(base)
        } else if self.stub_cleared {
            Some(self.dtb_ptr32 as usize)
        } else {
            warn!("DTB address unknown");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_PRELOAD: BootConfig = BootConfig {
        preloaded_bl33_base: None,
        preloaded_dtb_base: None,
        direct_linux_boot: false,
        bl33_execution_state: ExecutionState::AArch64,
    };

    fn handoff(magic: u32, dtb: u32, kernel: u32) -> BootHandoff {
        let mut header = StubHeader {
            magic: ReadPureWrite(magic),
            version: ReadPure(0),
            dtb_ptr32: ReadPure(dtb),
            kernel_entry32: ReadPure(kernel),
        };
        BootHandoff::read(&mut UniqueMmioPointer::from(&mut header))
    }

    #[test]
    fn parse_addresses() {
        assert_eq!(parse_address(None), None);
        assert_eq!(parse_address(Some("0x20_0000")), Some(0x20_0000));
        assert_eq!(parse_address(Some("0X8000")), Some(0x8000));
        assert_eq!(parse_address(Some("4096")), Some(4096));
        assert_eq!(parse_address(Some("0xdeadBEEF")), Some(0xdead_beef));
    }

    #[test]
    #[should_panic]
    fn parse_invalid_address() {
        parse_address(Some("0xfoo"));
    }

    #[test]
    fn cleared_stub_provides_addresses() {
        let handoff = handoff(0, 0x2eff_2900, 0x20_0000);
        assert!(handoff.stub_cleared);
        assert_eq!(handoff.non_secure_entry_address(&NO_PRELOAD), 0x20_0000);
        assert_eq!(handoff.dtb_address(&NO_PRELOAD), Some(0x2eff_2900));
    }

    #[test]
    fn uncleared_stub_falls_back() {
        let handoff = handoff(STUB_MAGIC, 0x2eff_2900, 0x20_0000);
        assert!(!handoff.stub_cleared);
        assert_eq!(
            handoff.non_secure_entry_address(&NO_PRELOAD),
            DEFAULT_KERNEL_ADDRESS
        );
        assert_eq!(handoff.dtb_address(&NO_PRELOAD), None);
    }

    #[test]
    fn preloaded_addresses_take_precedence() {
        let config = BootConfig {
            preloaded_bl33_base: Some(0x1000_0000),
            preloaded_dtb_base: Some(0x3000_0000),
            ..NO_PRELOAD
        };
        for magic in [0, STUB_MAGIC] {
            let handoff = handoff(magic, 0x2eff_2900, 0x20_0000);
            assert_eq!(handoff.non_secure_entry_address(&config), 0x1000_0000);
            assert_eq!(handoff.dtb_address(&config), Some(0x3000_0000));
        }
    }
}
