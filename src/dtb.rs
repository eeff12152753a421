// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Patches the device tree handed to the non-secure world so that it describes BL31.

use crate::{
    aarch64::clean_dcache_range,
    fdt::{
        Fdt, check_header,
        fixup::{add_psci_cpu_enable_methods, add_psci_node, add_reserved_memory},
    },
    platform::{Platform, PlatformImpl},
};
use log::{error, info, warn};

/// How much the device tree may grow to while it is being patched.
pub const DTB_WORKING_SIZE: usize = 0x10_0000;

/// Name of the reserved-memory node covering BL31.
const RESERVED_NODE_NAME: &str = "atf@0";
const BL31_RESERVED_BASE: u64 = 0;
const BL31_RESERVED_SIZE: u64 = 0x8_0000;

const GIC_COMPATIBLE: &str = "arm,gic-400";
/// PPI 9, targeting all four cores, level triggered active high.
const GIC_MAINTENANCE_INTERRUPT: [u32; 3] = [1, 9, 0x0f04];

const STDOUT_PATH: &str = "serial0";

/// Returns the device tree working buffer at the given address.
///
/// # Safety
///
/// `address` must be mapped read-write for [`DTB_WORKING_SIZE`] bytes, and nothing else may access
/// that memory for the lifetime of the returned slice.
pub unsafe fn dtb_working_buffer(address: usize) -> &'static mut [u8] {
    // SAFETY: Our caller guarantees that the memory is mapped and not aliased.
    unsafe { core::slice::from_raw_parts_mut(address as *mut u8, DTB_WORKING_SIZE) }
}

/// Patches the device tree in `blob` to advertise PSCI, reserve BL31's memory, describe the GIC
/// maintenance interrupt and set the console.
///
/// This does its best and never fails: a missing or invalid device tree is left alone, and if the
/// PSCI description can't be added nothing more is done. Otherwise the blob is packed and cleaned
/// to memory so that the next stage sees it with its caches off.
pub fn prepare_dtb(blob: &mut [u8]) {
    let address = blob.as_ptr() as usize;
    if let Err(e) = check_header(blob) {
        warn!("No valid Device Tree at {address:#x}: {e}");
        return;
    }

    let mut fdt = match Fdt::open_into(blob) {
        Ok(fdt) => fdt,
        Err(e) => {
            error!("Invalid Device Tree at {address:#x}: {e}");
            return;
        }
    };

    if let Err(e) = add_psci_node(&mut fdt) {
        error!("Failed to add PSCI Device Tree node: {e}");
        return;
    }
    if let Err(e) = add_psci_cpu_enable_methods(&mut fdt) {
        error!("Failed to add PSCI cpu enable methods in Device Tree: {e}");
        return;
    }
    if let Err(e) = add_reserved_memory(
        &mut fdt,
        RESERVED_NODE_NAME,
        BL31_RESERVED_BASE,
        BL31_RESERVED_SIZE,
    ) {
        warn!("Failed to add reserved memory nodes to DT: {e}");
    }
    set_gic_interrupts(&mut fdt);
    set_stdout_path(&mut fdt);

    if let Err(e) = fdt.pack() {
        error!("Failed to pack Device Tree at {address:#x}: {e}");
    }

    clean_dcache_range(
        address,
        fdt.total_size(),
        PlatformImpl::CACHE_WRITEBACK_GRANULE,
    );
    info!("Changed device tree to advertise PSCI.");
}

fn set_gic_interrupts(fdt: &mut Fdt) {
    let gic = match fdt.node_offset_by_compatible(GIC_COMPATIBLE) {
        Ok(gic) => gic,
        Err(e) => {
            warn!("No {GIC_COMPATIBLE} node in Device Tree: {e}");
            return;
        }
    };
    let mut interrupts = [0; 12];
    for (cell, value) in interrupts.chunks_exact_mut(4).zip(GIC_MAINTENANCE_INTERRUPT) {
        cell.copy_from_slice(&value.to_be_bytes());
    }
    if let Err(e) = fdt.set_property(gic, "interrupts", &interrupts) {
        error!("Failed to set GIC interrupts in Device Tree: {e}");
    }
}

fn set_stdout_path(fdt: &mut Fdt) {
    let chosen = match fdt.path_offset("/chosen") {
        Ok(chosen) => chosen,
        Err(e) => {
            warn!("No /chosen node in Device Tree: {e}");
            return;
        }
    };
    if let Err(e) = fdt.set_property_string(chosen, "stdout-path", STDOUT_PATH) {
        error!("Failed to set stdout-path in Device Tree: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdt::builder::FdtBuilder;

    fn firmware_dtb(with_gic: bool) -> Vec<u8> {
        let mut blob = FdtBuilder::new().tree(|builder| {
            builder.begin_node("");
            builder.property_stringlist("compatible", &["raspberrypi,4-model-b", "brcm,bcm2711"]);
            builder.property_u32("#address-cells", 2);
            builder.property_u32("#size-cells", 1);
            builder.begin_node("aliases");
            builder.property_string("serial0", "/soc/serial@7e201000");
            builder.end_node();
            builder.begin_node("chosen");
            builder.property_string("bootargs", "console=ttyS0");
            builder.end_node();
            builder.begin_node("cpus");
            builder.property_u32("#address-cells", 1);
            builder.property_u32("#size-cells", 0);
            for cpu in 0..4 {
                builder.begin_node(&format!("cpu@{cpu}"));
                builder.property_string("device_type", "cpu");
                builder.property_string("compatible", "arm,cortex-a72");
                builder.property_string("enable-method", "spin-table");
                builder.property_u32("reg", cpu);
                builder.end_node();
            }
            builder.end_node();
            builder.begin_node("soc");
            if with_gic {
                builder.begin_node("interrupt-controller@40041000");
                builder.property_stringlist("compatible", &["arm,gic-400"]);
                builder.property("interrupts", &[0, 0, 0, 1, 0, 0, 0, 9, 0, 0, 0xff, 0x04]);
                builder.end_node();
            }
            builder.end_node();
            builder.end_node();
        });
        blob.resize(DTB_WORKING_SIZE, 0);
        blob
    }

    fn check_patched(blob: &[u8]) {
        let size = check_header(blob).unwrap();
        assert!(size < DTB_WORKING_SIZE);
        let fdt = ::fdt::Fdt::new(&blob[..size]).unwrap();

        let psci = fdt.find_node("/psci").unwrap();
        assert_eq!(psci.property("method").unwrap().as_str(), Some("smc"));
        for cpu in fdt.find_node("/cpus").unwrap().children() {
            assert_eq!(
                cpu.property("enable-method").unwrap().as_str(),
                Some("psci")
            );
        }
        let reserved = fdt.find_node("/reserved-memory/atf@0").unwrap();
        assert_eq!(
            reserved.property("reg").unwrap().value,
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0x08, 0, 0]
        );
        let gic = fdt.find_compatible(&["arm,gic-400"]).unwrap();
        assert_eq!(
            gic.property("interrupts").unwrap().value,
            [0, 0, 0, 1, 0, 0, 0, 9, 0, 0, 0x0f, 0x04]
        );
        let chosen = fdt.find_node("/chosen").unwrap();
        assert_eq!(
            chosen.property("stdout-path").unwrap().as_str(),
            Some("serial0")
        );
        assert_eq!(
            chosen.property("bootargs").unwrap().as_str(),
            Some("console=ttyS0")
        );
    }

    #[test]
    fn patch_firmware_dtb() {
        let mut blob = firmware_dtb(true);
        prepare_dtb(&mut blob);
        check_patched(&blob);
    }

    #[test]
    fn patch_twice() {
        let mut blob = firmware_dtb(true);
        prepare_dtb(&mut blob);
        let size = check_header(&blob).unwrap();
        prepare_dtb(&mut blob);
        check_patched(&blob);
        // Nothing was duplicated.
        assert_eq!(check_header(&blob), Ok(size));
        let fdt = ::fdt::Fdt::new(&blob[..size]).unwrap();
        let reserved = fdt.find_node("/reserved-memory").unwrap();
        assert_eq!(reserved.children().count(), 1);
    }

    #[test]
    fn missing_gic_is_skipped() {
        let mut blob = firmware_dtb(false);
        prepare_dtb(&mut blob);
        let size = check_header(&blob).unwrap();
        let fdt = ::fdt::Fdt::new(&blob[..size]).unwrap();
        assert!(fdt.find_node("/psci").is_some());
        assert_eq!(
            fdt.find_node("/chosen")
                .unwrap()
                .property("stdout-path")
                .unwrap()
                .as_str(),
            Some("serial0")
        );
    }

    #[test]
    fn stops_without_cpus() {
        let mut blob = FdtBuilder::new().tree(|builder| {
            builder.begin_node("");
            builder.begin_node("chosen");
            builder.end_node();
            builder.end_node();
        });
        blob.resize(DTB_WORKING_SIZE, 0);
        prepare_dtb(&mut blob);

        // The blob was opened and given a PSCI node, but neither packed nor given a console.
        assert_eq!(check_header(&blob), Ok(DTB_WORKING_SIZE));
        let fdt = ::fdt::Fdt::new(&blob).unwrap();
        assert!(fdt.find_node("/psci").is_some());
        assert!(fdt.find_node("/reserved-memory").is_none());
        assert!(
            fdt.find_node("/chosen")
                .unwrap()
                .property("stdout-path")
                .is_none()
        );
    }

    #[test]
    fn invalid_blob_untouched() {
        let mut blob = vec![0xa5; 256];
        prepare_dtb(&mut blob);
        assert!(blob.iter().all(|byte| *byte == 0xa5));
    }
}
