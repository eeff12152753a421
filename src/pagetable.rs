// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Planning of the EL3 address space, and the identity map built from the plan.

use crate::{
    aarch64::{dsb_sy, isb},
    layout::{bl31_image, code, rodata},
    platform::{Platform, PlatformImpl},
};
use aarch64_paging::{
    Mapping,
    descriptor::{El23Attributes as Attributes, PhysicalAddress, VirtualAddress},
    mair::{Mair, MairAttribute, NormalMemory},
    paging::{Constraints, El3, MemoryRegion, PageTable, Translation},
};
use arm_sysregs::SctlrEl3;
use arrayvec::ArrayVec;
use core::{
    fmt::{self, Debug, Formatter},
    ops::Range,
    ptr::NonNull,
};
use log::{debug, info, trace, warn};
use spin::{
    Once,
    mutex::{SpinMutex, SpinMutexGuard},
};
use thiserror::Error;

const ROOT_LEVEL: usize = 1;

// Indices of entries in the Memory Attribute Indirection Register.
const MAIR_IWTRWA_OWTRWA_NTR_INDEX: u8 = 0;
const MAIR_DEVICE_INDEX: u8 = 1;
const MAIR_NON_CACHEABLE_INDEX: u8 = 2;

// Values for MAIR entries.
const MAIR_DEVICE: MairAttribute = MairAttribute::DEVICE_NGNRE;

// Write-through, so that everything BL31 writes reaches memory before it is read with the MMU off
// or by another observer, such as the patched device tree read by the next stage before it turns
// on its caches.
const MAIR_IWTRWA_OWTRWA_NTR: MairAttribute = MairAttribute::normal(
    NormalMemory::WriteThroughTransientReadWriteAllocate,
    NormalMemory::WriteThroughTransientReadWriteAllocate,
);
const MAIR_NON_CACHEABLE: MairAttribute =
    MairAttribute::normal(NormalMemory::NonCacheable, NormalMemory::NonCacheable);

#[cfg_attr(test, allow(unused))]
const MAIR: Mair = Mair::EMPTY
    .with_attribute(MAIR_DEVICE_INDEX, MAIR_DEVICE)
    .with_attribute(MAIR_IWTRWA_OWTRWA_NTR_INDEX, MAIR_IWTRWA_OWTRWA_NTR)
    .with_attribute(MAIR_NON_CACHEABLE_INDEX, MAIR_NON_CACHEABLE);

#[cfg_attr(test, allow(unused))]
const TCR: u64 = (1 << 31) | (1 << 23) // RES1
        | (0b001 << 16) // 36 bit physical address size (64 GiB).
        | (64 - 39); // Size offset is 2**39 bytes (512 GiB).

pub const GRANULE_SIZE: usize = 4096; // Using 4k pages.

/// The device tree window is aligned to this.
const DTB_WINDOW_ALIGNMENT: usize = 0x20_0000;
/// The device tree window covers the block holding the blob plus the next one, leaving room for
/// it to grow while being patched.
const DTB_WINDOW_SIZE: usize = 2 * DTB_WINDOW_ALIGNMENT;

/// The most mapping requests a plan can hold.
const MAX_MAPPING_REQUESTS: usize = 16;

// Attribute values corresponding to the above MAIR indices.
const IWTRWA_OWTRWA_NTR: Attributes = Attributes::ATTRIBUTE_INDEX_0;
const DEVICE: Attributes = Attributes::ATTRIBUTE_INDEX_1;
const NON_CACHEABLE: Attributes = Attributes::ATTRIBUTE_INDEX_2;

/// Attribute bits which are RES1 for the EL3 translation regime, as we configure it.
///
/// From Arm ARM K.a, D8.3.1.2 Fig. D8-16: lower attributes AP\[1\] bit 6
/// and D8.4.1.2.1 Stage 1 data accesses using Direct permissions:
/// "For a stage 1 translation that supports one Exception level, AP\[1\] is RES1."
const EL3_RES1: Attributes = Attributes::USER_RES1;

/// The NS bit of a block or page descriptor, making the access go to the non-secure physical
/// address space.
pub const NON_SECURE: Attributes = Attributes::NS;

/// Attributes used for all mappings.
///
/// We always set the access flag, as we don't manage access flag faults.
const BASE: Attributes = EL3_RES1
    .union(Attributes::ACCESSED)
    .union(Attributes::VALID);

/// Attributes used for device mappings.
///
/// Device memory is always mapped as execute-never to avoid the possibility of a speculative
/// instruction fetch, which could be an issue if the memory region corresponds to a read-sensitive
/// peripheral.
pub const MT_DEVICE: Attributes = DEVICE.union(BASE).union(Attributes::XN);

/// Attributes used for non-cacheable read-write memory.
pub const MT_NON_CACHEABLE: Attributes = NON_CACHEABLE.union(BASE).union(Attributes::XN);

/// Attributes used for regular memory mappings.
pub const MT_MEMORY: Attributes = IWTRWA_OWTRWA_NTR
    .union(BASE)
    .union(Attributes::INNER_SHAREABLE);

/// Attributes used for code (i.e. text) mappings.
pub const MT_CODE: Attributes = MT_MEMORY.union(Attributes::READ_ONLY);

/// Attributes used for read-only data mappings.
pub const MT_RO_DATA: Attributes = MT_MEMORY
    .union(Attributes::READ_ONLY)
    .union(Attributes::XN);

/// Attributes used for read-write data mappings.
pub const MT_RW_DATA: Attributes = MT_MEMORY.union(Attributes::XN);

static PAGE_HEAP: SpinMutex<[PageTable<Attributes>; PlatformImpl::PAGE_HEAP_PAGE_COUNT]> =
    SpinMutex::new([PageTable::EMPTY; PlatformImpl::PAGE_HEAP_PAGE_COUNT]);
static PAGE_TABLE: Once<SpinMutex<IdMap>> = Once::new();

/// An error adding a region to a [`MemoryPlan`].
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum MappingError {
    #[error("Region {requested:#x?} conflicts with {existing:#x?}")]
    Conflict {
        requested: Range<usize>,
        existing: Range<usize>,
    },
    #[error("Region {0:#x?} is empty or not page aligned")]
    Unaligned(Range<usize>),
    #[error("Too many memory regions")]
    TooManyRegions,
}

/// A region of the address space to map, and how.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MappingRequest {
    pub range: Range<usize>,
    pub attributes: Attributes,
}

/// The ordered list of regions that make up the EL3 address space.
///
/// A region may only overlap earlier ones by lying entirely within one of them with the same
/// security state, in which case its attributes take precedence over the enclosing region's.
#[derive(Clone, Debug, Default)]
pub struct MemoryPlan {
    requests: ArrayVec<MappingRequest, MAX_MAPPING_REQUESTS>,
}

impl MemoryPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a region to the end of the plan.
    pub fn add(&mut self, range: Range<usize>, attributes: Attributes) -> Result<(), MappingError> {
        if range.is_empty() || range.start % GRANULE_SIZE != 0 || range.end % GRANULE_SIZE != 0 {
            return Err(MappingError::Unaligned(range));
        }
        let non_secure = attributes.contains(NON_SECURE);
        for existing in &self.requests {
            let overlaps = range.start < existing.range.end && existing.range.start < range.end;
            let refines = existing.range.start <= range.start
                && range.end <= existing.range.end
                && existing.attributes.contains(NON_SECURE) == non_secure;
            if overlaps && !refines {
                return Err(MappingError::Conflict {
                    requested: range,
                    existing: existing.range.clone(),
                });
            }
        }
        self.requests
            .try_push(MappingRequest { range, attributes })
            .map_err(|_| MappingError::TooManyRegions)
    }

    /// Returns the requests in the order they will be mapped.
    pub fn requests(&self) -> &[MappingRequest] {
        &self.requests
    }
}

/// Returns the 4 MiB window mapped for a device tree at the given address.
pub fn dtb_window(dtb_address: usize) -> Range<usize> {
    let start = dtb_address & !(DTB_WINDOW_ALIGNMENT - 1);
    start..start + DTB_WINDOW_SIZE
}

/// Plans the EL3 address space.
///
/// The device tree window is added last, so that it can't displace anything BL31 needs. If it
/// conflicts with an earlier region the device tree is left unmapped, and `None` is returned in
/// place of its address. Any other region which can't be added is an error, as BL31 can't run
/// without it.
pub fn plan_address_space(
    dtb_address: Option<usize>,
) -> Result<(MemoryPlan, Option<usize>), MappingError> {
    let mut plan = MemoryPlan::new();
    add_fixed_regions(&mut plan)?;

    let dtb_address = dtb_address.filter(|&address| {
        match plan.add(dtb_window(address), MT_RW_DATA.union(NON_SECURE)) {
            Ok(()) => true,
            Err(e) => {
                warn!("Not mapping Device Tree at {address:#x}: {e}");
                false
            }
        }
    });

    Ok((plan, dtb_address))
}

/// Adds the regions BL31 always needs: the boot stub page, BL31 itself and the platform's devices.
fn add_fixed_regions(plan: &mut MemoryPlan) -> Result<(), MappingError> {
    // The boot stub page, whose header the VideoCore writes with its caches off.
    plan.add(0..GRANULE_SIZE, MT_NON_CACHEABLE)?;

    plan.add(bl31_image(), MT_RW_DATA)?;
    plan.add(code(), MT_CODE)?;
    plan.add(rodata(), MT_RO_DATA)?;

    PlatformImpl::map_extra_regions(plan)
}

/// Builds the identity map described by `plan` and turns on the MMU and caches.
///
/// This should be called once, by the primary core, with the MMU off.
pub fn init_runtime_mapping(plan: &MemoryPlan) {
    PAGE_TABLE.call_once(|| {
        let page_heap =
            SpinMutexGuard::leak(PAGE_HEAP.try_lock().expect("Page heap was already taken"));
        let mut idmap = init_page_table(page_heap, plan);

        trace!("Page table: {idmap:?}");

        info!("Setting MMU config");

        // Ensure all translation table writes have drained into memory.
        dsb_sy();
        isb();

        #[cfg(all(target_arch = "aarch64", not(test)))]
        enable_mmu(
            idmap.root_address().0,
            (SctlrEl3::M | SctlrEl3::C | SctlrEl3::I | SctlrEl3::WXN).bits(),
            SctlrEl3::A.bits(),
        );

        info!("Marking page table as active");
        idmap.mark_active();

        SpinMutex::new(idmap)
    });
}

/// Enables the MMU.
///
/// Sets `MAIR_EL3`, `TCR_EL3` and `TTBR0_EL3` then sets
/// `SCTLR_EL3 = (SCTLR_EL3 | sctlr_set) & !sctlr_clear`.
#[cfg(all(target_arch = "aarch64", not(test)))]
#[unsafe(naked)]
extern "C" fn enable_mmu(ttbr: usize, sctlr_set: u64, sctlr_clear: u64) {
    core::arch::naked_asm!(
        "tlbi	alle3

        ldr	x3, ={mair}
        msr	mair_el3, x3

        ldr	x3, ={tcr}
        msr	tcr_el3, x3

        msr	ttbr0_el3, x0

        dsb	sy
        isb

        mrs	x3, sctlr_el3

        orr	x3, x3, x1
        bic	x3, x3, x2

        msr	sctlr_el3, x3

        isb
        ret",
        mair = const MAIR.0,
        tcr = const TCR,
    )
}

/// Creates the page table and maps every region of the plan, in order.
fn init_page_table(pages: &'static mut [PageTable<Attributes>], plan: &MemoryPlan) -> IdMap {
    let mut idmap = IdMap::new(pages);
    for request in plan.requests() {
        // SAFETY: The MMU isn't enabled yet, and the plan maps BL31 itself with the right
        // attributes.
        unsafe {
            idmap.map_region(
                &MemoryRegion::new(request.range.start, request.range.end),
                request.attributes,
            );
        }
    }
    idmap
}

struct IdTranslation {
    /// Pages which can be allocated for page tables.
    pages: &'static mut [PageTable<Attributes>],
    /// Record of which `pages` are currently allocated.
    allocated: [bool; PlatformImpl::PAGE_HEAP_PAGE_COUNT],
}

impl Debug for IdTranslation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("IdTranslation")
            .field("pages", &self.pages.len())
            .field("allocated", &self.allocated)
            .finish()
    }
}

impl IdTranslation {
    fn virtual_to_physical(va: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress(va.0)
    }
}

impl Translation<Attributes> for IdTranslation {
    fn allocate_table(&mut self) -> (NonNull<PageTable<Attributes>>, PhysicalAddress) {
        let index = self
            .allocated
            .iter()
            .position(|&allocated| !allocated)
            .expect("Failed to allocate page table");
        self.allocated[index] = true;
        let table = NonNull::from(&mut self.pages[index]);
        (
            table,
            Self::virtual_to_physical(VirtualAddress(table.as_ptr() as usize)),
        )
    }

    unsafe fn deallocate_table(&mut self, page_table: NonNull<PageTable<Attributes>>) {
        let index =
            (page_table.addr().get() - &raw const self.pages[0] as usize) / size_of::<PageTable<Attributes>>();
        self.allocated[index] = false;
    }

    fn physical_to_virtual(
        &self,
        page_table_pa: PhysicalAddress,
    ) -> NonNull<PageTable<Attributes>> {
        NonNull::new(page_table_pa.0 as *mut PageTable<Attributes>)
            .expect("Got physical address 0 for pagetable")
    }
}

#[derive(Debug)]
struct IdMap {
    mapping: Mapping<IdTranslation, El3>,
}

impl IdMap {
    fn new(pages: &'static mut [PageTable<Attributes>]) -> Self {
        Self {
            mapping: Mapping::new(
                IdTranslation {
                    pages,
                    allocated: [false; PlatformImpl::PAGE_HEAP_PAGE_COUNT],
                },
                ROOT_LEVEL,
                El3,
            ),
        }
    }

    fn mark_active(&mut self) {
        self.mapping.mark_active();
    }

    fn root_address(&self) -> PhysicalAddress {
        self.mapping.root_address()
    }

    /// Adds the given region to the page table with the given attributes, logging it first.
    ///
    /// # Safety
    ///
    /// Memory which is still used by BL31 must not be unmapped, or mapped with incorrect
    /// attributes.
    unsafe fn map_region(&mut self, region: &MemoryRegion, attributes: Attributes) {
        debug!("Mapping {region} as {attributes:?}.");
        assert!(attributes.contains(Attributes::VALID));
        let pa = IdTranslation::virtual_to_physical(region.start());
        self.mapping
            .map_range(region, pa, attributes, Constraints::empty())
            .expect("Error mapping memory range");
    }
}
