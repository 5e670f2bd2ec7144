//! RAM pool - carve typed objects out of one RAM capability
//!
//! A watermark allocator in the manner of an untyped region: objects are
//! retyped at increasing, aligned offsets and never returned. Revoking the
//! pool's capability reclaims everything at once.

use log::debug;
use tern_platform::{Kernel, ObjType, BASE_PAGE_SIZE};

use crate::capability::Capability;
use crate::cspace::CSpace;
use crate::invoke;
use crate::{CapError, Result};

/// Pages needed to hold `size` bytes
pub fn pages_needed(size: usize) -> usize {
    (size + BASE_PAGE_SIZE - 1) / BASE_PAGE_SIZE
}

/// Align `addr` down to `align` (a power of two)
pub fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Align `addr` up to `align` (a power of two)
pub fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// Align `addr` up to `align` (a power of two), or `None` past the end of
/// the address space
pub fn checked_align_up(addr: usize, align: usize) -> Option<usize> {
    addr.checked_add(align - 1).map(|a| a & !(align - 1))
}

/// Watermark allocator over one RAM region
#[derive(Debug)]
pub struct RamPool {
    cap: Capability,
    base: usize,
    size: usize,
    allocated: usize,
}

impl RamPool {
    /// Wrap `cap`, asking the kernel for its extent
    pub fn new<K: Kernel + ?Sized>(kernel: &K, cap: Capability) -> Result<Self> {
        cap.expect(ObjType::Ram)?;
        let id = invoke::identify(kernel, &cap)?;
        Ok(Self::with_region(cap, id.base, id.bytes))
    }

    /// Wrap `cap` whose extent is already known
    pub fn with_region(cap: Capability, base: usize, size: usize) -> Self {
        Self { cap, base, size, allocated: 0 }
    }

    pub fn cap(&self) -> &Capability {
        &self.cap
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn available(&self) -> usize {
        self.size - self.allocated
    }

    /// Retype a `bytes`-sized object of type `ty` at the next `align`-aligned
    /// offset
    ///
    /// # Errors
    /// `InvalidArgument` if `bytes` is zero or `align` is not a power of two,
    /// `OutOfMemory` when the region is exhausted.
    pub fn alloc<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        cspace: &mut CSpace,
        ty: ObjType,
        bytes: usize,
        align: usize,
    ) -> Result<Capability> {
        if bytes == 0 {
            return Err(CapError::InvalidArgument("zero-sized allocation"));
        }
        if !align.is_power_of_two() {
            return Err(CapError::InvalidArgument("alignment not a power of two"));
        }
        let requested = bytes;
        let align = align.max(BASE_PAGE_SIZE);
        let placed = checked_align_up(bytes.max(ty.fixed_size().unwrap_or(0)), BASE_PAGE_SIZE).and_then(|bytes| {
            let offset = checked_align_up(self.base + self.allocated, align)? - self.base;
            offset.checked_add(bytes).filter(|&end| end <= self.size).map(|_| (offset, bytes))
        });
        let Some((offset, bytes)) = placed else {
            return Err(CapError::OutOfMemory { requested });
        };
        let cap = cspace.retype(kernel, &self.cap, offset, ty, bytes)?;
        self.allocated = offset + bytes;
        debug!("ram pool: {:?} of {} bytes at {:#x}", ty, bytes, self.base + offset);
        Ok(cap)
    }

    /// Retype an object at a fixed physical address inside the region
    ///
    /// Does not move the watermark; the kernel refuses overlapping retypes.
    pub fn alloc_at<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        cspace: &mut CSpace,
        ty: ObjType,
        paddr: usize,
        bytes: usize,
    ) -> Result<Capability> {
        if bytes == 0 {
            return Err(CapError::InvalidArgument("zero-sized allocation"));
        }
        let start = align_down(paddr, BASE_PAGE_SIZE);
        let end = paddr
            .checked_add(bytes)
            .and_then(|end| checked_align_up(end, BASE_PAGE_SIZE))
            .filter(|&end| start >= self.base && end - self.base <= self.size)
            .ok_or(CapError::InvalidArgument("address outside region"))?;
        let bytes = end - start;
        cspace.retype(kernel, &self.cap, start - self.base, ty, bytes)
    }
}
