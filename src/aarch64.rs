// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

#[cfg(target_arch = "aarch64")]
use core::arch::asm;

/// Issues a data synchronization barrier (`dsb`) instruction for the full system (`sy`).
pub fn dsb_sy() {
    // SAFETY: `dsb` does not violate safe Rust guarantees.
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("dsb sy", options(nostack));
    }
}

/// Issues an instruction synchronization barrier (`isb`) instruction.
pub fn isb() {
    // SAFETY: `isb` does not violate safe Rust guarantees.
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("isb", options(nostack));
    }
}

/// Waits for an event.
#[cfg_attr(test, allow(unused))]
pub fn wfe() {
    // SAFETY: `wfe` does not violate safe Rust guarantees.
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("wfe", options(nomem, nostack, preserves_flags));
    }
}

/// Waits for an interrupt.
#[cfg_attr(test, allow(unused))]
pub fn wfi() {
    // SAFETY: `wfi` does not violate safe Rust guarantees.
    #[cfg(target_arch = "aarch64")]
    unsafe {
        asm!("wfi", options(nomem, nostack, preserves_flags));
    }
}

/// Cleans the data cache lines covering `[start, start + size)` to the point of coherency, so that
/// agents which don't snoop our caches see the latest contents.
///
/// `granule` is the cache writeback granule in bytes and must be a power of two.
pub fn clean_dcache_range(start: usize, size: usize, granule: usize) {
    for _line in cache_lines(start, size, granule) {
        // SAFETY: `dc cvac` only writes back cache contents, it doesn't change memory as seen by
        // this core.
        #[cfg(target_arch = "aarch64")]
        unsafe {
            asm!("dc cvac, {line}", line = in(reg) _line, options(nostack, preserves_flags));
        }
    }
    dsb_sy();
}

/// Cleans and invalidates the data cache lines covering `[start, start + size)`, so that data
/// written to memory by another agent is visible to subsequent reads.
pub fn clean_invalidate_dcache_range(start: usize, size: usize, granule: usize) {
    for _line in cache_lines(start, size, granule) {
        // SAFETY: `dc civac` writes back dirty lines before discarding them, so no data written by
        // this core is lost.
        #[cfg(target_arch = "aarch64")]
        unsafe {
            asm!("dc civac, {line}", line = in(reg) _line, options(nostack, preserves_flags));
        }
    }
    dsb_sy();
}

/// Returns the start address of every cache line touching `[start, start + size)`.
fn cache_lines(start: usize, size: usize, granule: usize) -> impl Iterator<Item = usize> {
    let first = start & !(granule - 1);
    let end = if size == 0 { first } else { start + size };
    (first..end).step_by(granule)
}

/// Spins for roughly `iterations` loop iterations.
///
/// This is not calibrated against any timer; it is only meant for settling delays which were
/// determined empirically.
pub fn spin_delay(iterations: u32) {
    for _ in 0..iterations {
        core::hint::spin_loop();
    }
}
