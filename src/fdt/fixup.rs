// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Device tree changes describing the services BL31 provides to the non-secure world.

use super::{Fdt, FdtError};
use crate::psci::{ADVERTISED_FUNCTIONS, COMPATIBLE};
use arrayvec::ArrayVec;
use log::warn;

/// Adds a `/psci` node advertising the PSCI conduit and the IDs of the functions BL31 implements.
///
/// An existing `/psci` node is left alone.
pub fn add_psci_node(fdt: &mut Fdt) -> Result<(), FdtError> {
    if fdt.path_offset("/psci").is_ok() {
        warn!("PSCI Device Tree node already exists!");
        return Ok(());
    }

    let root = fdt.root()?;
    let node = fdt.add_subnode(root, "psci")?;
    fdt.set_property_stringlist(node, "compatible", &COMPATIBLE)?;
    fdt.set_property_string(node, "method", "smc")?;
    for (name, function) in ADVERTISED_FUNCTIONS {
        fdt.set_property_u32(node, name, function.into())?;
    }
    Ok(())
}

/// Sets `enable-method = "psci"` on every CPU node under `/cpus`.
pub fn add_psci_cpu_enable_methods(fdt: &mut Fdt) -> Result<(), FdtError> {
    let cpus = fdt.path_offset("/cpus")?;
    let mut next = fdt.first_subnode(cpus)?;
    while let Some(node) = next {
        if fdt
            .property(node, "device_type")
            .is_ok_and(|device_type| device_type == b"cpu\0")
        {
            // Properties are inserted inside the node, so its offset stays valid.
            fdt.set_property_string(node, "enable-method", "psci")?;
        }
        next = fdt.next_subnode(node)?;
    }
    Ok(())
}

/// Adds a `no-map` child called `name` to `/reserved-memory`, covering `size` bytes from `base`.
///
/// `/reserved-memory` is created with the root's cell sizes if it doesn't exist. Fails with
/// [`FdtError::Exists`] if the child is already there.
pub fn add_reserved_memory(
    fdt: &mut Fdt,
    name: &str,
    base: u64,
    size: u64,
) -> Result<(), FdtError> {
    let reserved = match fdt.path_offset("/reserved-memory") {
        Ok(node) => node,
        Err(FdtError::NotFound) => {
            let root = fdt.root()?;
            let address_cells = fdt.address_cells(root)?;
            let size_cells = fdt.size_cells(root)?;
            let node = fdt.add_subnode(root, "reserved-memory")?;
            fdt.set_property_u32(node, "#address-cells", address_cells)?;
            fdt.set_property_u32(node, "#size-cells", size_cells)?;
            fdt.set_property_empty(node, "ranges")?;
            node
        }
        Err(e) => return Err(e),
    };

    let mut reg = ArrayVec::<u8, 16>::new();
    push_cells(&mut reg, base, fdt.address_cells(reserved)?)?;
    push_cells(&mut reg, size, fdt.size_cells(reserved)?)?;

    let node = fdt.add_subnode(reserved, name)?;
    fdt.set_property(node, "reg", &reg)?;
    fdt.set_property_empty(node, "no-map")?;
    Ok(())
}

/// Appends `value` encoded as `cells` big-endian cells.
fn push_cells(reg: &mut ArrayVec<u8, 16>, value: u64, cells: u32) -> Result<(), FdtError> {
    match cells {
        1 => {
            let value = u32::try_from(value).map_err(|_| FdtError::BadStructure)?;
            reg.try_extend_from_slice(&value.to_be_bytes())
        }
        2 => reg.try_extend_from_slice(&value.to_be_bytes()),
        _ => return Err(FdtError::BadStructure),
    }
    .map_err(|_| FdtError::BadStructure)
}
