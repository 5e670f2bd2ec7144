//! CSpace management - slot allocation and capability derivation
//!
//! A domain's capabilities live in its root CNode. The [`SlotAllocator`]
//! hands out slots from the range left free after the well-known slots, and
//! [`CSpace`] combines it with the root CNode capability so that operations
//! producing a new capability (copy, mint, retype, create) can pick their
//! destination slot themselves.

use alloc::vec::Vec;
use log::trace;
use tern_platform::{
    slots, CNodeId, CapAddr, CapRights, Kernel, ObjType, Opcode, Word, CNODE_SLOTS, LMP_MSG_WORDS,
};

use crate::capability::{Capability, Slot};
use crate::{CapError, Result};

/// Slot allocator over [next, max) with a free list
///
/// Freed slots are reused before the watermark advances.
#[derive(Debug)]
pub struct SlotAllocator {
    next_slot: u32,
    max_slots: u32,
    free_slots: Vec<u32>,
}

impl SlotAllocator {
    pub fn new(initial_slot: u32, max_slots: u32) -> Self {
        Self { next_slot: initial_slot, max_slots, free_slots: Vec::new() }
    }

    pub fn allocate(&mut self) -> Result<u32> {
        if let Some(slot) = self.free_slots.pop() {
            return Ok(slot);
        }
        if self.next_slot >= self.max_slots {
            return Err(CapError::OutOfSlots);
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        Ok(slot)
    }

    pub fn free(&mut self, slot: u32) {
        self.free_slots.push(slot);
    }

    /// Slots still available
    pub fn available(&self) -> usize {
        (self.max_slots - self.next_slot) as usize + self.free_slots.len()
    }
}

/// A domain's capability space
#[derive(Debug)]
pub struct CSpace {
    root: Capability,
    slots: SlotAllocator,
}

impl CSpace {
    /// Manage the root CNode named by `root`, allocating from [first_free, end)
    pub fn new(root: Capability, first_free: u32, end: u32) -> Result<Self> {
        root.expect(ObjType::CNode)?;
        if first_free == 0 || first_free > end || end > CNODE_SLOTS {
            return Err(CapError::InvalidArgument("slot range"));
        }
        Ok(Self { root, slots: SlotAllocator::new(first_free, end) })
    }

    /// The calling domain's own CSpace, laid out with the well-known slots
    pub fn for_domain<K: Kernel + ?Sized>(kernel: &K) -> Result<Self> {
        let root = Capability::from_raw(
            CapAddr::new(kernel.root_cnode(), slots::ROOT_CNODE),
            ObjType::CNode,
        );
        Self::new(root, slots::FIRST_FREE, CNODE_SLOTS)
    }

    pub fn cnode(&self) -> CNodeId {
        self.root.addr().cnode
    }

    pub fn root(&self) -> &Capability {
        &self.root
    }

    /// Handle for one of the well-known slots
    pub fn well_known(&self, slot: u32, kind: ObjType) -> Capability {
        Capability::from_raw(CapAddr::new(self.cnode(), slot), kind)
    }

    pub fn alloc_slot(&mut self) -> Result<Slot> {
        let slot = self.slots.allocate()?;
        Ok(Slot::new(CapAddr::new(self.cnode(), slot)))
    }

    /// Return an empty slot to the allocator
    pub fn free_slot(&mut self, slot: Slot) {
        self.slots.free(slot.addr().slot);
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available()
    }

    /// Run `op` against a fresh slot, returning the slot on failure
    fn into_new_slot<F>(&mut self, kind: ObjType, op: F) -> Result<Capability>
    where
        F: FnOnce(CapAddr) -> Result<[Word; 2]>,
    {
        let slot = self.alloc_slot()?;
        match op(slot.addr()) {
            Ok(_) => Ok(slot.into_capability(kind)),
            Err(e) => {
                self.free_slot(slot);
                Err(e)
            }
        }
    }

    /// Retype one object of `ty` out of `src` at byte `offset`
    ///
    /// # Arguments
    /// * `src` - RAM capability (or dispatcher, for endpoints)
    /// * `offset` - byte offset into the source region
    /// * `ty` - type of the new object
    /// * `objsize` - object size in bytes (buffer words for endpoints)
    ///
    /// # Errors
    /// `InvalidArgument` for a zero size, `OutOfSlots` when no slot is free,
    /// or the kernel's error when the region is too small, misaligned or
    /// already carved at that offset.
    pub fn retype<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        src: &Capability,
        offset: usize,
        ty: ObjType,
        objsize: usize,
    ) -> Result<Capability> {
        if objsize == 0 {
            return Err(CapError::InvalidArgument("zero object size"));
        }
        match (src.kind(), ty) {
            (ObjType::Ram, _) | (ObjType::Dispatcher, ObjType::Endpoint) => {}
            (found, _) => return Err(CapError::TypeMismatch { expected: ObjType::Ram, found }),
        }
        trace!("retype {:?} -> {:?} ({} @ {:#x})", src.addr(), ty, objsize, offset);
        self.into_new_slot(ty, |dest| {
            src.invoke(
                kernel,
                Opcode::Retype,
                &[offset, ty as Word, objsize, 1, dest.cnode.0 as Word, dest.slot as Word],
            )
        })
    }

    /// Retype an endpoint with a `buf_words` receive buffer from a dispatcher
    pub fn retype_endpoint<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        dispatcher: &Capability,
        buf_words: usize,
    ) -> Result<Capability> {
        dispatcher.expect(ObjType::Dispatcher)?;
        if buf_words < LMP_MSG_WORDS + 1 {
            return Err(CapError::InvalidArgument("endpoint buffer smaller than one message"));
        }
        self.retype(kernel, dispatcher, 0, ObjType::Endpoint, buf_words)
    }

    /// Create a capability to physical memory from the kernel capability
    pub fn create<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        kernel_cap: &Capability,
        ty: ObjType,
        base: usize,
        bytes: usize,
    ) -> Result<Capability> {
        kernel_cap.expect(ObjType::Kernel)?;
        if bytes == 0 {
            return Err(CapError::InvalidArgument("zero object size"));
        }
        self.into_new_slot(ty, |dest| {
            kernel_cap.invoke(
                kernel,
                Opcode::Create,
                &[ty as Word, base, bytes, dest.cnode.0 as Word, dest.slot as Word],
            )
        })
    }

    /// Copy `src` into a fresh slot of this CSpace
    pub fn copy<K: Kernel + ?Sized>(&mut self, kernel: &K, src: &Capability) -> Result<Capability> {
        src.validate()?;
        let src_addr = src.addr();
        let root = &self.root;
        let kind = src.kind();
        let slot = self.slots.allocate()?;
        let dest = CapAddr::new(root.addr().cnode, slot);
        let result = root.invoke(
            kernel,
            Opcode::Copy,
            &[dest.slot as Word, src_addr.cnode.0 as Word, src_addr.slot as Word],
        );
        match result {
            Ok(_) => Ok(Capability::from_raw(dest, kind)),
            Err(e) => {
                self.slots.free(slot);
                Err(e)
            }
        }
    }

    /// Copy `src` into a fresh slot with rights reduced to `rights`
    pub fn mint<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        src: &Capability,
        rights: CapRights,
    ) -> Result<Capability> {
        src.validate()?;
        let src_addr = src.addr();
        let kind = src.kind();
        let slot = self.slots.allocate()?;
        let result = self.root.invoke(
            kernel,
            Opcode::Mint,
            &[
                slot as Word,
                src_addr.cnode.0 as Word,
                src_addr.slot as Word,
                rights.bits(),
            ],
        );
        match result {
            Ok(_) => Ok(Capability::from_raw(CapAddr::new(self.cnode(), slot), kind)),
            Err(e) => {
                self.slots.free(slot);
                Err(e)
            }
        }
    }

    /// Copy `src` into `dest_slot` of a foreign CNode this domain holds
    pub fn copy_into<K: Kernel + ?Sized>(
        &self,
        kernel: &K,
        dest_cnode: &Capability,
        dest_slot: u32,
        src: &Capability,
    ) -> Result<()> {
        dest_cnode.expect(ObjType::CNode)?;
        src.validate()?;
        if dest_slot == 0 || dest_slot >= CNODE_SLOTS {
            return Err(CapError::InvalidArgument("destination slot out of range"));
        }
        let src_addr = src.addr();
        dest_cnode.invoke(
            kernel,
            Opcode::Copy,
            &[dest_slot as Word, src_addr.cnode.0 as Word, src_addr.slot as Word],
        )?;
        Ok(())
    }

    /// Delete a capability and return its slot to the allocator
    ///
    /// Other copies of the object stay valid; see [`CSpace::revoke`].
    pub fn delete<K: Kernel + ?Sized>(&mut self, kernel: &K, cap: Capability) -> Result<()> {
        cap.invoke(kernel, Opcode::Delete, &[])?;
        if cap.addr().cnode == self.cnode() {
            self.slots.free(cap.addr().slot);
        }
        Ok(())
    }

    /// Delete every capability derived from `cap`, wherever it lives
    pub fn revoke<K: Kernel + ?Sized>(&self, kernel: &K, cap: &Capability) -> Result<()> {
        cap.invoke(kernel, Opcode::Revoke, &[])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoke;
    use tern_kernel_mock::{MockConfig, MockKernel};
    use tern_platform::BASE_PAGE_SIZE;

    #[test]
    fn test_slot_allocator_reuses_freed_slots() {
        let mut alloc = SlotAllocator::new(16, 18);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_eq!((a, b), (16, 17));
        assert_eq!(alloc.allocate(), Err(CapError::OutOfSlots));
        alloc.free(a);
        assert_eq!(alloc.available(), 1);
        assert_eq!(alloc.allocate(), Ok(16));
    }

    #[test]
    fn test_copy_and_delete() {
        let (_kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let ram = cspace.well_known(slots::BOOT_RAM, ObjType::Ram);

        let frame = cspace.retype(&init, &ram, 0, ObjType::Frame, BASE_PAGE_SIZE).unwrap();
        let copy = cspace.copy(&init, &frame).unwrap();
        assert_ne!(copy.addr(), frame.addr());

        let copy_addr = copy.addr();
        cspace.delete(&init, copy).unwrap();
        assert_eq!(init.slot_kind(copy_addr), None);
        assert_eq!(init.slot_kind(frame.addr()), Some(ObjType::Frame));
        assert!(invoke::identify(&init, &frame).is_ok());
    }

    #[test]
    fn test_failed_retype_returns_slot() {
        let (_kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let ram = cspace.well_known(slots::BOOT_RAM, ObjType::Ram);
        let before = cspace.available_slots();

        let result = cspace.retype(&init, &ram, 3, ObjType::Frame, BASE_PAGE_SIZE);
        assert!(matches!(result, Err(CapError::Kernel(_))));
        assert_eq!(cspace.available_slots(), before);
    }

    #[test]
    fn test_revoke_reaches_minted_copies() {
        let (_kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let ram = cspace.well_known(slots::BOOT_RAM, ObjType::Ram);
        let region = cspace.retype(&init, &ram, 0, ObjType::Ram, 1 << 20).unwrap();
        let ro = cspace.mint(&init, &region, CapRights::READ).unwrap();

        cspace.revoke(&init, &region).unwrap();
        assert_eq!(init.slot_kind(ro.addr()), None);
        assert_eq!(init.slot_kind(region.addr()), Some(ObjType::Ram));
    }

    #[test]
    fn test_retype_from_endpoint_rejected() {
        let (_kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let disp = cspace.well_known(slots::DISPATCHER, ObjType::Dispatcher);
        let ep = cspace.retype_endpoint(&init, &disp, 64).unwrap();
        assert!(matches!(
            cspace.retype(&init, &ep, 0, ObjType::Frame, BASE_PAGE_SIZE),
            Err(CapError::TypeMismatch { .. })
        ));
        assert_eq!(
            cspace.retype_endpoint(&init, &disp, 4),
            Err(CapError::InvalidArgument("endpoint buffer smaller than one message"))
        );
    }
}
