//! Capability layer - typed, owned capabilities on top of the kernel ABI
//!
//! # Purpose
//! Every kernel object is reached through a capability. This crate wraps the
//! raw invocation trap in typed operations and makes capability handles
//! move-only, so a handle that has been deleted or given away cannot be used
//! again by accident.
//!
//! # Integration Points
//! - Depends on: `tern-platform` (ABI, [`Kernel`] trait)
//! - Provides to: IPC, paging, init
//!
//! # Architecture
//! - [`Capability`]: owned handle naming one slot
//! - [`CSpace`]: the domain's root CNode plus a slot allocator
//! - [`invoke`]: operations on table, dispatcher, IRQ and kernel capabilities
//! - [`RamPool`]: watermark allocator carving objects out of one RAM region
//!
//! All argument checks happen before the trap and are reported as
//! [`CapError::InvalidArgument`]; the kernel itself applies each invocation
//! atomically.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

mod capability;
mod cspace;
pub mod invoke;
mod ram;

pub use capability::{Capability, Slot};
pub use cspace::{CSpace, SlotAllocator};
pub use invoke::Identity;
pub use ram::{align_down, align_up, checked_align_up, pages_needed, RamPool};

pub use tern_platform::{CapRights, Kernel, KernelError, MapFlags, ObjType};

use thiserror::Error;

/// Error types for capability operations
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    #[error("Out of capability slots")]
    OutOfSlots,

    #[error("Out of RAM (requested: {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Capability type mismatch (expected {expected:?}, found {found:?})")]
    TypeMismatch { expected: ObjType, found: ObjType },

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
}

pub type Result<T> = core::result::Result<T, CapError>;
