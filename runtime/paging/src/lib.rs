//! Tern Paging - per-domain self-paging virtual memory
//!
//! # Purpose
//! Each domain manages its own address space: it reserves virtual ranges
//! from a bump-allocated heap, and pages memory in on demand when it touches
//! a reserved but unbacked address.
//!
//! # Integration Points
//! - Depends on: `tern-cap` (frames, table invocations), `tern-platform`
//! - Provides to: every domain's runtime (fault handler, heap growth)
//! - Capabilities required: the domain's L1 table and a source of RAM
//!
//! # Design
//! - Two-level ARMv7 short-descriptor translation: the L1 index is
//!   `v >> 20`, the L2 index `(v >> 12) & 0x3FF`
//! - L2 tables are created on first use and recorded with a page-exists
//!   bitmap
//! - Revocable pages are carved from 1 MiB frames kept in FIFO order
//! - Address space is never reclaimed; `unmap` is accepted and ignored

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod frames;
pub mod state;
pub mod table;

use tern_cap::CapError;
use thiserror::Error;

pub use frames::{FrameRecord, FrameSource};
pub use state::{Backing, FaultOutcome, PagingContext, PagingState};
pub use table::L2Table;

/// Paging configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingConfig {
    /// First heap address
    pub heap_base: usize,
    /// The heap never grows past this address
    pub heap_limit: usize,
    /// Size of each revocable frame
    pub frame_bytes: usize,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self { heap_base: 0x4000_0000, heap_limit: 0x6000_0000, frame_bytes: 1 << 20 }
    }
}

/// Paging errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PagingError {
    /// Fault at an address the domain never reserved
    #[error("page fault at {addr:#x} outside the heap")]
    OutsideHeap { addr: usize },

    /// Paging in a page that is already present
    #[error("page at {addr:#x} is already resident")]
    AlreadyResident { addr: usize },

    #[error("virtual address space exhausted ({requested} bytes requested)")]
    OutOfVirtualSpace { requested: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error(transparent)]
    Cap(#[from] CapError),
}

impl PagingError {
    /// The domain cannot continue after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::OutsideHeap { .. } | Self::AlreadyResident { .. })
    }
}

pub type Result<T> = core::result::Result<T, PagingError>;
