//! Physical backing for the paging manager
//!
//! Revocable pages come out of fixed-size frames kept in a FIFO list. New
//! frames are appended at the tail and pages are handed out from the tail
//! frame until it is full; the head is the oldest frame and therefore the
//! first an eviction policy would reclaim.

use alloc::vec::Vec;

use tern_cap::{CSpace, CapError, Capability, RamPool};
use tern_platform::{Kernel, ObjType, BASE_PAGE_SIZE, L1_SECTION_SIZE};

/// Where the paging manager gets its objects from
pub trait FrameSource {
    /// Retype a `bytes`-sized object of type `ty`
    fn alloc_object<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        cspace: &mut CSpace,
        ty: ObjType,
        bytes: usize,
    ) -> Result<Capability, CapError>;
}

impl FrameSource for RamPool {
    fn alloc_object<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        cspace: &mut CSpace,
        ty: ObjType,
        bytes: usize,
    ) -> Result<Capability, CapError> {
        let align = if bytes.is_power_of_two() {
            bytes.min(L1_SECTION_SIZE)
        } else {
            BASE_PAGE_SIZE
        };
        self.alloc(kernel, cspace, ty, bytes, align)
    }
}

/// One revocable frame and the virtual pages living in it
#[derive(Debug)]
pub struct FrameRecord {
    cap: Capability,
    /// Virtual page held by each 4 KiB slot
    slots: Vec<Option<usize>>,
    /// Per-mapping copies of `cap`
    mappings: Vec<Capability>,
}

impl FrameRecord {
    pub fn new(cap: Capability, bytes: usize) -> Self {
        Self { cap, slots: alloc::vec![None; bytes / BASE_PAGE_SIZE], mappings: Vec::new() }
    }

    pub fn cap(&self) -> &Capability {
        &self.cap
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn used(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_full(&self) -> bool {
        self.used() == self.capacity()
    }

    /// Next unused slot
    pub(crate) fn next_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    pub(crate) fn occupy(&mut self, slot: usize, vpage: usize, mapping: Capability) {
        self.slots[slot] = Some(vpage);
        self.mappings.push(mapping);
    }

    /// Virtual page backed by slot `slot`
    pub fn vpage_at(&self, slot: usize) -> Option<usize> {
        self.slots.get(slot).copied().flatten()
    }

    /// Virtual pages backed by this frame, in slot order
    pub fn vpages(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().filter_map(|s| *s)
    }
}
