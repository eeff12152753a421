// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Driver for the GIC-400 (GICv2) as seen from the secure side.

use crate::{
    aarch64::{dsb_sy, isb},
    interrupts::{InterruptController, InterruptHandle},
};
use arm_gic::{
    IntId, InterruptGroup, Trigger, UniqueMmioPointer,
    gicv2::{
        GicV2,
        registers::{Gicc, Gicd},
    },
};
use bitflags::bitflags;
use core::ptr::NonNull;
use log::{debug, warn};
use safe_mmio::field;

const GIC_HIGHEST_NS_PRIORITY: u8 = 0x80;
const GIC_PRI_MASK: u8 = 0xff;

/// Number of SGIs and PPIs, which are banked per CPU.
const PRIVATE_INTERRUPT_COUNT: u32 = 32;
/// Interrupt IDs from 1020 up are special.
const MAX_INTERRUPT_LINES: u32 = 1020;

bitflags! {
    /// The secure view of `GICC_CTLR`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    struct GiccCtlr: u32 {
        const ENABLE_GRP0 = 1 << 0;
        const ENABLE_GRP1 = 1 << 1;
        const FIQ_EN = 1 << 3;
        const FIQ_BYP_DIS_GRP0 = 1 << 5;
        const IRQ_BYP_DIS_GRP0 = 1 << 6;
        const FIQ_BYP_DIS_GRP1 = 1 << 7;
        const IRQ_BYP_DIS_GRP1 = 1 << 8;
    }
}

/// The configuration of a single interrupt.
#[derive(Clone, Copy, Debug)]
pub struct InterruptConfig {
    /// Interrupt priority.
    /// 0x00 is highest priority, 0xFF is the lowest.
    pub priority: u8,
    /// Interrupt group that this interrupt should belong to. On a GICv2 group 0 is secure.
    pub group: InterruptGroup,
    /// To specify whether this interrupt should be edge or level triggered.
    pub trigger: Trigger,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            priority: GIC_HIGHEST_NS_PRIORITY,
            group: InterruptGroup::Group1,
            trigger: Trigger::Level,
        }
    }
}

pub type InterruptConfigEntry = (IntId, InterruptConfig);

/// The configuration of platform's GIC.
pub struct GicConfig {
    /// This list specifies which interrupts will be configured
    /// to non-default setup. These are also the only interrupts which get enabled.
    pub interrupts_config: &'static [InterruptConfigEntry],
}

/// A GICv2 distributor and the CPU interface of the boot core.
pub struct Gic<'a> {
    gic: GicV2<'a>,
    /// The distributor again, only for `GICD_IPRIORITYR` and `GICD_ITARGETSR`. `GicV2` writes
    /// priorities a whole word at a time and has no way to set targets.
    gicd: UniqueMmioPointer<'a, Gicd>,
    /// The CPU interface again, only for `GICC_CTLR`, which `GicV2` can't set up for FIQs.
    gicc: UniqueMmioPointer<'a, Gicc>,
    config: &'static GicConfig,
}

impl Gic<'_> {
    /// Creates a driver for the given distributor and CPU interface.
    ///
    /// # Safety
    ///
    /// `gicd` and `gicc` must point to the GIC distributor and CPU interface registers, mapped as
    /// device memory, and must not be accessed any other way while the driver exists.
    pub unsafe fn new(gicd: *mut Gicd, gicc: *mut Gicc, config: &'static GicConfig) -> Self {
        // SAFETY: Our caller promises that the pointers are valid and otherwise unused. `GicV2` and
        // the extra pointers never touch the same registers: see the field docs.
        unsafe {
            Self {
                gic: GicV2::new(gicd, gicc),
                gicd: UniqueMmioPointer::new(NonNull::new(gicd).unwrap()),
                gicc: UniqueMmioPointer::new(NonNull::new(gicc).unwrap()),
                config,
            }
        }
    }

    /// Returns the number of SPIs the distributor supports.
    fn num_spis(&self) -> u32 {
        self.gic.typer().num_irqs().min(MAX_INTERRUPT_LINES) - PRIVATE_INTERRUPT_COUNT
    }

    /// Configures the shared interrupts: everything is made non-secure, then the configured SPIs are
    /// set up, targeted at this CPU and enabled.
    pub fn distributor_init(&mut self) {
        self.gic.enable_group0(false);
        self.gic.enable_group1(false);

        let num_spis = self.num_spis();
        for int_id in IntId::spis().take(num_spis as usize) {
            self.disable(int_id);
            self.apply(int_id, &InterruptConfig::default());
        }

        let target = self.current_cpu_target();
        for (int_id, config) in self.config.interrupts_config {
            if !(PRIVATE_INTERRUPT_COUNT..PRIVATE_INTERRUPT_COUNT + num_spis)
                .contains(&u32::from(*int_id))
            {
                continue;
            }
            self.apply(*int_id, config);
            self.set_target(*int_id, target);
            self.enable(*int_id);
        }

        self.gic.enable_group0(true);
        self.gic.enable_group1(true);
        debug!("GIC distributor configured with {num_spis} SPIs");
    }

    /// Configures the banked SGIs and PPIs of this CPU.
    pub fn pcpu_distributor_init(&mut self) {
        for int_id in IntId::private() {
            self.disable(int_id);
            self.apply(int_id, &InterruptConfig::default());
        }

        for (int_id, config) in self.config.interrupts_config {
            if !int_id.is_private() {
                continue;
            }
            self.apply(*int_id, config);
            self.enable(*int_id);
        }
    }

    /// Enables the CPU interface, signalling group 0 interrupts as FIQs and with the legacy bypass
    /// disabled.
    pub fn cpu_interface_enable(&mut self) {
        self.gic.set_priority_mask(GIC_PRI_MASK);
        let ctlr = GiccCtlr::ENABLE_GRP0
            | GiccCtlr::FIQ_EN
            | GiccCtlr::FIQ_BYP_DIS_GRP0
            | GiccCtlr::IRQ_BYP_DIS_GRP0
            | GiccCtlr::FIQ_BYP_DIS_GRP1
            | GiccCtlr::IRQ_BYP_DIS_GRP1;
        field!(self.gicc, ctlr).write(ctlr.bits());
        isb();
        dsb_sy();
    }

    fn apply(&mut self, int_id: IntId, config: &InterruptConfig) {
        self.gic.set_group(int_id, config.group);
        self.set_priority(int_id, config.priority);
        // The trigger of SGIs is fixed.
        if !int_id.is_sgi() {
            self.gic.set_trigger(int_id, config.trigger);
        }
    }

    fn enable(&mut self, int_id: IntId) {
        if let Err(e) = self.gic.enable_interrupt(int_id, true) {
            warn!("{e}");
        }
    }

    fn disable(&mut self, int_id: IntId) {
        // Only enabling is checked.
        let _ = self.gic.enable_interrupt(int_id, false);
    }

    /// Sets the priority byte of the interrupt, leaving the other three in the register alone.
    fn set_priority(&mut self, int_id: IntId, priority: u8) {
        let raw = u32::from(int_id);
        let shift = (raw % 4) * 8;
        let mut ipriorityr = field!(self.gicd, ipriorityr);
        let Some(mut register) = ipriorityr.get(raw as usize / 4) else {
            return;
        };
        register.modify(|value| (value & !(0xff << shift)) | (u32::from(priority) << shift));
    }

    /// Returns the target mask of this CPU, from the banked `GICD_ITARGETSR0..7`.
    fn current_cpu_target(&mut self) -> u8 {
        let mut itargetsr = field!(self.gicd, itargetsr);
        for index in 0..PRIVATE_INTERRUPT_COUNT as usize / 4 {
            let Some(mut register) = itargetsr.get(index) else {
                break;
            };
            // SAFETY: Reading `GICD_ITARGETSR` has no side effects.
            let targets = unsafe { register.read_unsafe() };
            if let Some(target) = targets.to_le_bytes().into_iter().find(|target| *target != 0) {
                return target;
            }
        }
        1
    }

    /// Sets the target byte of the interrupt, leaving the other three in the register alone.
    fn set_target(&mut self, int_id: IntId, target: u8) {
        let raw = u32::from(int_id);
        let shift = (raw % 4) * 8;
        let mut itargetsr = field!(self.gicd, itargetsr);
        let Some(mut register) = itargetsr.get(raw as usize / 4) else {
            return;
        };
        // SAFETY: Reading `GICD_ITARGETSR` has no side effects, and the targets of SPIs may be
        // written at any time.
        unsafe {
            let targets = register.read_unsafe();
            register.write_unsafe((targets & !(0xff << shift)) | (u32::from(target) << shift));
        }
    }
}

impl InterruptController for Gic<'_> {
    fn acknowledge_interrupt(&mut self) -> InterruptHandle {
        let int_id = self
            .gic
            .get_and_acknowledge_interrupt(InterruptGroup::Group0)
            .unwrap_or(IntId::SPECIAL_NONE);
        InterruptHandle::new(int_id.into())
    }

    fn end_of_interrupt(&mut self, handle: InterruptHandle) {
        // Only SPIs are in group 0, so there are no source CPU bits to pass back.
        match IntId::try_from(handle.id()) {
            Ok(int_id) => self.gic.end_interrupt(int_id, InterruptGroup::Group0),
            Err(e) => warn!("{e}"),
        }
    }
}
