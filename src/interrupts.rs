// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Interrupt type handler registration and routing.

use crate::context::World;
use arm_sysregs::ScrEl3;
use bitflags::bitflags;
use log::debug;
use spin::mutex::SpinMutex;
use thiserror::Error;

/// Mask for the interrupt ID field of an acknowledged interrupt.
const INTERRUPT_ID_MASK: u32 = 0x3ff;

/// The raw value returned by the interrupt controller when an interrupt is acknowledged.
///
/// For a GICv2 this also carries the source CPU of SGIs, so it must be passed back unchanged to
/// end the interrupt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct InterruptHandle(u32);

impl InterruptHandle {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns the interrupt ID.
    pub const fn id(self) -> u32 {
        self.0 & INTERRUPT_ID_MASK
    }
}

/// The operations an interrupt handler needs from the interrupt controller.
pub trait InterruptController {
    /// Acknowledges the highest priority pending interrupt.
    fn acknowledge_interrupt(&mut self) -> InterruptHandle;

    /// Signals that handling of the given interrupt is complete.
    fn end_of_interrupt(&mut self, handle: InterruptHandle);
}

/// Specifies where an interrupt should be handled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptType {
    El3,
    Secure,
    NonSecure,
}

impl InterruptType {
    const fn index(self) -> usize {
        match self {
            Self::El3 => 0,
            Self::Secure => 1,
            Self::NonSecure => 2,
        }
    }
}

bitflags! {
    /// For each world, whether interrupts of a type taken while that world is running are routed
    /// to EL3.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RoutingFlags: u32 {
        const FROM_SECURE = 1 << 0;
        const FROM_NON_SECURE = 1 << 1;
    }
}

impl RoutingFlags {
    const fn for_world(world: World) -> Self {
        match world {
            World::Secure => Self::FROM_SECURE,
            World::NonSecure => Self::FROM_NON_SECURE,
        }
    }
}

/// Sets the routing flag for the given world.
pub fn set_interrupt_rm_flag(flags: &mut RoutingFlags, world: World) {
    *flags |= RoutingFlags::for_world(world);
}

/// A handler for an interrupt type, called with the world which was interrupted.
///
/// The return value carries no meaning to the caller.
pub type InterruptTypeHandler = fn(World) -> u64;

#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
pub enum InterruptError {
    #[error("A handler is already registered for {0:?} interrupts")]
    AlreadyRegistered(InterruptType),
    #[error("Routing model {1:?} is not valid for {0:?} interrupts")]
    InvalidRoutingModel(InterruptType, RoutingFlags),
}

#[derive(Clone, Copy, Debug)]
struct Registration {
    handler: InterruptTypeHandler,
    flags: RoutingFlags,
}

/// Registered interrupt type handlers.
#[derive(Debug)]
pub struct InterruptManager {
    registrations: [Option<Registration>; 3],
}

/// The interrupt handlers used by the lower-EL FIQ vector.
pub static INTERRUPTS: SpinMutex<InterruptManager> = SpinMutex::new(InterruptManager::new());

impl InterruptManager {
    pub const fn new() -> Self {
        Self {
            registrations: [None; 3],
        }
    }

    /// Registers the handler for the given type of interrupt.
    ///
    /// There can be only one handler per type. EL3 interrupts must be routed to EL3 at least while
    /// the non-secure world is running, as nothing else could handle them.
    pub fn register_interrupt_type_handler(
        &mut self,
        interrupt_type: InterruptType,
        handler: InterruptTypeHandler,
        flags: RoutingFlags,
    ) -> Result<(), InterruptError> {
        if interrupt_type == InterruptType::El3 && !flags.contains(RoutingFlags::FROM_NON_SECURE) {
            return Err(InterruptError::InvalidRoutingModel(interrupt_type, flags));
        }
        let slot = &mut self.registrations[interrupt_type.index()];
        if slot.is_some() {
            return Err(InterruptError::AlreadyRegistered(interrupt_type));
        }
        *slot = Some(Registration { handler, flags });
        debug!("Registered {interrupt_type:?} interrupt handler with routing {flags:?}");
        Ok(())
    }

    /// Returns the `scr_el3` routing bits to use while running in the given world.
    ///
    /// Group 0 interrupts are signalled as FIQs, so only `SCR_EL3.FIQ` is ever set.
    pub fn scr_routing(&self, world: World) -> ScrEl3 {
        let routed = self
            .registrations
            .iter()
            .flatten()
            .any(|registration| registration.flags.contains(RoutingFlags::for_world(world)));
        if routed { ScrEl3::FIQ } else { ScrEl3::empty() }
    }

    /// Returns the handler to call for an FIQ taken from the given world, if it is routed to EL3.
    pub fn handler_for(&self, world: World) -> Option<InterruptTypeHandler> {
        let registration = self.registrations[InterruptType::El3.index()]?;
        registration
            .flags
            .contains(RoutingFlags::for_world(world))
            .then_some(registration.handler)
    }
}

impl Default for InterruptManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Calls the registered EL3 interrupt handler for an FIQ taken from the given world.
///
/// Returns `None` if no handler applies.
#[cfg_attr(test, allow(unused))]
pub fn dispatch(world: World) -> Option<u64> {
    // Release the lock before calling the handler so that it may inspect the registrations.
    let handler = INTERRUPTS.lock().handler_for(world)?;
    Some(handler(world))
}
