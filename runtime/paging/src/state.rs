//! Per-domain paging state and the page-in algorithm
//!
//! Virtual addresses in a domain move through four states: unreserved,
//! reserved (inside `[heap_begin, heap_end)` but not backed), mapped
//! revocable (backed by a slot of a list frame) and mapped irrevocable
//! (backed by a dedicated frame). Only a fault in a reserved page is
//! serviced; anything else outside the heap is fatal for the domain.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::ops::Range;

use log::{debug, trace, warn};
use tern_cap::{align_down, checked_align_up, invoke, CSpace, Capability};
use tern_platform::{Kernel, MapFlags, ObjType, BASE_PAGE_SIZE, L1_ENTRIES, OBJSIZE_L2};

use crate::frames::{FrameRecord, FrameSource};
use crate::table::{l1_index, l2_index, pages_left_in_section, L2Table};
use crate::{PagingConfig, PagingError, Result};

/// How a page-in is backed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// One slot of a list frame per page; may later be evicted
    Revocable,
    /// A dedicated frame of exactly the requested size
    Irrevocable,
}

/// Result of a page fault that did not kill the domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    PagedIn,
    /// The page was already mapped; nothing was done
    Spurious,
}

/// What page-in needs from the domain
pub struct PagingContext<'a, K: ?Sized, F> {
    pub kernel: &'a K,
    pub cspace: &'a mut CSpace,
    pub frames: &'a mut F,
}

impl<'a, K: Kernel + ?Sized, F: FrameSource> PagingContext<'a, K, F> {
    pub fn new(kernel: &'a K, cspace: &'a mut CSpace, frames: &'a mut F) -> Self {
        Self { kernel, cspace, frames }
    }
}

/// A dedicated frame and the copies of it installed in tables
#[derive(Debug)]
struct FixedMapping {
    frame: Option<Capability>,
    copies: Vec<Capability>,
}

pub struct PagingState {
    config: PagingConfig,
    l1: Capability,
    heap_begin: usize,
    heap_end: usize,
    tables: Vec<Option<Box<L2Table>>>,
    frames: VecDeque<FrameRecord>,
    fixed: Vec<FixedMapping>,
}

impl PagingState {
    /// Manage the address space rooted at `l1`
    pub fn new(config: PagingConfig, l1: Capability) -> Result<Self> {
        if l1.kind() != ObjType::L1Table {
            return Err(PagingError::InvalidArgument("not an L1 table"));
        }
        if config.heap_base % BASE_PAGE_SIZE != 0 || config.heap_base >= config.heap_limit {
            return Err(PagingError::InvalidArgument("heap range"));
        }
        if config.frame_bytes < BASE_PAGE_SIZE || !config.frame_bytes.is_power_of_two() {
            return Err(PagingError::InvalidArgument("frame size"));
        }
        let mut tables = Vec::with_capacity(L1_ENTRIES);
        tables.resize_with(L1_ENTRIES, || None);
        Ok(Self {
            heap_begin: config.heap_base,
            heap_end: config.heap_base,
            config,
            l1,
            tables,
            frames: VecDeque::new(),
            fixed: Vec::new(),
        })
    }

    pub fn config(&self) -> &PagingConfig {
        &self.config
    }

    /// Reserved virtual range `[heap_begin, heap_end)`
    pub fn heap_range(&self) -> Range<usize> {
        self.heap_begin..self.heap_end
    }

    /// Reserve `bytes` of virtual address space aligned to `align`
    ///
    /// Pure bump allocation: ranges are never handed out twice and the heap
    /// only grows.
    pub fn alloc(&mut self, bytes: usize, align: usize) -> Result<usize> {
        if bytes == 0 {
            return Err(PagingError::InvalidArgument("zero-sized allocation"));
        }
        if !align.is_power_of_two() {
            return Err(PagingError::InvalidArgument("alignment not a power of two"));
        }
        let (start, end) = checked_align_up(self.heap_end, align.max(BASE_PAGE_SIZE))
            .zip(checked_align_up(bytes, BASE_PAGE_SIZE))
            .and_then(|(start, len)| Some((start, start.checked_add(len)?)))
            .filter(|&(_, end)| end <= self.config.heap_limit)
            .ok_or(PagingError::OutOfVirtualSpace { requested: bytes })?;
        self.heap_end = end;
        trace!("paging alloc {:#x}..{:#x}", start, end);
        Ok(start)
    }

    /// Accepted and ignored; address space is never given back
    pub fn unmap(&mut self, vaddr: usize) -> Result<()> {
        debug!("unmap {:#x} ignored", vaddr);
        Ok(())
    }

    pub fn is_mapped(&self, vaddr: usize) -> bool {
        self.tables
            .get(l1_index(vaddr))
            .and_then(Option::as_deref)
            .map_or(false, |t| t.is_present(l2_index(vaddr)))
    }

    /// Capabilities held for irrevocable and fixed mappings
    pub fn pinned_caps(&self) -> usize {
        self.fixed.iter().map(|m| m.copies.len() + m.frame.is_some() as usize).sum()
    }

    /// Oldest revocable frame
    pub fn eviction_candidate(&self) -> Option<&FrameRecord> {
        self.frames.front()
    }

    /// Revocable frames, oldest first
    pub fn frames(&self) -> impl Iterator<Item = &FrameRecord> {
        self.frames.iter()
    }

    /// Resolve a fault at `addr`
    ///
    /// # Errors
    /// `OutsideHeap` for an address outside `[heap_begin, heap_end)`; the
    /// domain cannot continue.
    pub fn handle_page_fault<K, F>(
        &mut self,
        ctx: &mut PagingContext<'_, K, F>,
        addr: usize,
    ) -> Result<FaultOutcome>
    where
        K: Kernel + ?Sized,
        F: FrameSource,
    {
        if !self.heap_range().contains(&addr) {
            return Err(PagingError::OutsideHeap { addr });
        }
        if self.is_mapped(addr) {
            return Ok(FaultOutcome::Spurious);
        }
        self.page_in(ctx, align_down(addr, BASE_PAGE_SIZE), 1, Backing::Revocable)?;
        Ok(FaultOutcome::PagedIn)
    }

    /// Back `n` pages starting at `vaddr`
    ///
    /// # Errors
    /// `AlreadyResident` if any of the pages is mapped (paging back in from
    /// a backing store is not supported); nothing is mapped in that case.
    pub fn page_in<K, F>(
        &mut self,
        ctx: &mut PagingContext<'_, K, F>,
        vaddr: usize,
        n: usize,
        backing: Backing,
    ) -> Result<()>
    where
        K: Kernel + ?Sized,
        F: FrameSource,
    {
        let vaddr = self.check_range(vaddr, n)?;
        match backing {
            Backing::Revocable => {
                for page in 0..n {
                    self.back_revocable(ctx, vaddr + page * BASE_PAGE_SIZE)?;
                }
            }
            Backing::Irrevocable => {
                let frame = ctx.frames.alloc_object(
                    ctx.kernel,
                    ctx.cspace,
                    ObjType::Frame,
                    n * BASE_PAGE_SIZE,
                )?;
                self.map_dedicated(ctx, vaddr, frame, n, MapFlags::READ_WRITE)?;
            }
        }
        trace!("paged in {} page(s) at {:#x} ({:?})", n, vaddr, backing);
        Ok(())
    }

    /// Map `bytes` of `frame` at the fixed address `vaddr`
    ///
    /// The frame stays with the caller; copies of it are installed.
    pub fn map_fixed_attr<K, F>(
        &mut self,
        ctx: &mut PagingContext<'_, K, F>,
        vaddr: usize,
        frame: &Capability,
        bytes: usize,
        flags: MapFlags,
    ) -> Result<()>
    where
        K: Kernel + ?Sized,
        F: FrameSource,
    {
        if !matches!(frame.kind(), ObjType::Frame | ObjType::DevFrame) {
            return Err(PagingError::InvalidArgument("not a frame"));
        }
        if vaddr % BASE_PAGE_SIZE != 0 {
            return Err(PagingError::InvalidArgument("address not page aligned"));
        }
        let n = checked_align_up(bytes, BASE_PAGE_SIZE)
            .ok_or(PagingError::OutOfVirtualSpace { requested: bytes })?
            / BASE_PAGE_SIZE;
        let vaddr = self.check_range(vaddr, n)?;
        let copies = self.map_segments(ctx, vaddr, frame, n, flags)?;
        self.fixed.push(FixedMapping { frame: None, copies });
        Ok(())
    }

    /// Reserve address space for `frame` and map it there
    pub fn map_frame_attr<K, F>(
        &mut self,
        ctx: &mut PagingContext<'_, K, F>,
        frame: &Capability,
        bytes: usize,
        flags: MapFlags,
    ) -> Result<usize>
    where
        K: Kernel + ?Sized,
        F: FrameSource,
    {
        let vaddr = self.alloc(bytes, BASE_PAGE_SIZE)?;
        self.map_fixed_attr(ctx, vaddr, frame, bytes, flags)?;
        Ok(vaddr)
    }

    /// Page-align `vaddr` and refuse ranges with a resident page
    fn check_range(&self, vaddr: usize, n: usize) -> Result<usize> {
        if n == 0 {
            return Err(PagingError::InvalidArgument("zero pages"));
        }
        let vaddr = align_down(vaddr, BASE_PAGE_SIZE);
        if n.checked_mul(BASE_PAGE_SIZE).and_then(|len| vaddr.checked_add(len)).is_none() {
            return Err(PagingError::InvalidArgument("range wraps"));
        }
        if let Some(addr) = (0..n)
            .map(|page| vaddr + page * BASE_PAGE_SIZE)
            .find(|&addr| self.is_mapped(addr))
        {
            return Err(PagingError::AlreadyResident { addr });
        }
        Ok(vaddr)
    }

    /// Make sure an L2 table covers `vaddr`
    ///
    /// The table is fully built before it is installed in the L1 table and
    /// only published in `tables` once installed, so a failure at any step
    /// leaves no half-made descriptor behind.
    fn ensure_table<K, F>(&mut self, ctx: &mut PagingContext<'_, K, F>, vaddr: usize) -> Result<()>
    where
        K: Kernel + ?Sized,
        F: FrameSource,
    {
        let i1 = l1_index(vaddr);
        if self.tables[i1].is_some() {
            return Ok(());
        }
        let cap = ctx.frames.alloc_object(ctx.kernel, ctx.cspace, ObjType::L2Table, OBJSIZE_L2)?;
        let table = L2Table::new(cap);
        if let Err(e) = invoke::vnode_map(ctx.kernel, &self.l1, i1, table.cap(), MapFlags::empty(), 0, 1) {
            ctx.cspace.delete(ctx.kernel, table.into_cap())?;
            return Err(e.into());
        }
        self.tables[i1] = Some(Box::new(table));
        debug!("L2 table installed for {:#x}", i1 << 20);
        Ok(())
    }

    fn table_mut(&mut self, vaddr: usize) -> Result<&mut L2Table> {
        self.tables[l1_index(vaddr)]
            .as_deref_mut()
            .ok_or(PagingError::InvalidArgument("no L2 table"))
    }

    /// Back one page from the tail frame, appending a new frame if full
    fn back_revocable<K, F>(&mut self, ctx: &mut PagingContext<'_, K, F>, vaddr: usize) -> Result<()>
    where
        K: Kernel + ?Sized,
        F: FrameSource,
    {
        self.ensure_table(ctx, vaddr)?;
        if self.frames.back().map_or(true, FrameRecord::is_full) {
            let bytes = self.config.frame_bytes;
            let cap = ctx.frames.alloc_object(ctx.kernel, ctx.cspace, ObjType::Frame, bytes)?;
            debug!("new {} KiB paging frame at {:?}", bytes >> 10, cap.addr());
            self.frames.push_back(FrameRecord::new(cap, bytes));
        }
        let (slot, copy) = {
            let record = self.frames.back().ok_or(PagingError::InvalidArgument("no frame"))?;
            let slot = record.next_slot().ok_or(PagingError::InvalidArgument("frame full"))?;
            (slot, ctx.cspace.copy(ctx.kernel, record.cap())?)
        };
        let i2 = l2_index(vaddr);
        let mapped = {
            let table = self.table_mut(vaddr)?;
            invoke::vnode_map(
                ctx.kernel,
                table.cap(),
                i2,
                &copy,
                MapFlags::READ_WRITE,
                slot * BASE_PAGE_SIZE,
                1,
            )
        };
        if let Err(e) = mapped {
            ctx.cspace.delete(ctx.kernel, copy)?;
            return Err(e.into());
        }
        self.table_mut(vaddr)?.set_present(i2);
        if let Some(record) = self.frames.back_mut() {
            record.occupy(slot, vaddr, copy);
        }
        Ok(())
    }

    fn map_dedicated<K, F>(
        &mut self,
        ctx: &mut PagingContext<'_, K, F>,
        vaddr: usize,
        frame: Capability,
        n: usize,
        flags: MapFlags,
    ) -> Result<()>
    where
        K: Kernel + ?Sized,
        F: FrameSource,
    {
        match self.map_segments(ctx, vaddr, &frame, n, flags) {
            Ok(copies) => {
                self.fixed.push(FixedMapping { frame: Some(frame), copies });
                Ok(())
            }
            Err(e) => {
                if let Err(del) = ctx.cspace.delete(ctx.kernel, frame) {
                    warn!("leaking dedicated frame for {:#x}: {}", vaddr, del);
                }
                Err(e)
            }
        }
    }

    /// Map `n` pages of `frame` at `vaddr`, one copy per 1 MiB section
    ///
    /// All or nothing: if any section fails, the sections already installed
    /// are unmapped and their copies deleted before the error is returned.
    fn map_segments<K, F>(
        &mut self,
        ctx: &mut PagingContext<'_, K, F>,
        vaddr: usize,
        frame: &Capability,
        n: usize,
        flags: MapFlags,
    ) -> Result<Vec<Capability>>
    where
        K: Kernel + ?Sized,
        F: FrameSource,
    {
        let mut installed: Vec<(usize, usize, Capability)> = Vec::new();
        let mut done = 0;
        while done < n {
            let v = vaddr + done * BASE_PAGE_SIZE;
            let count = pages_left_in_section(v).min(n - done);
            match self.map_section(ctx, v, frame, done, count, flags) {
                Ok(copy) => installed.push((v, count, copy)),
                Err(e) => {
                    self.unwind_sections(ctx, installed);
                    return Err(e);
                }
            }
            done += count;
        }
        Ok(installed.into_iter().map(|(_, _, copy)| copy).collect())
    }

    /// Map `count` pages of `frame`, starting `first` pages in, at `v`
    fn map_section<K, F>(
        &mut self,
        ctx: &mut PagingContext<'_, K, F>,
        v: usize,
        frame: &Capability,
        first: usize,
        count: usize,
        flags: MapFlags,
    ) -> Result<Capability>
    where
        K: Kernel + ?Sized,
        F: FrameSource,
    {
        self.ensure_table(ctx, v)?;
        let copy = ctx.cspace.copy(ctx.kernel, frame)?;
        let i2 = l2_index(v);
        let table = self.table_mut(v)?;
        if let Err(e) = invoke::vnode_map(ctx.kernel, table.cap(), i2, &copy, flags, first * BASE_PAGE_SIZE, count) {
            ctx.cspace.delete(ctx.kernel, copy)?;
            return Err(e.into());
        }
        for i in i2..i2 + count {
            table.set_present(i);
        }
        Ok(copy)
    }

    /// Take down sections installed by a `map_segments` that did not finish
    fn unwind_sections<K, F>(
        &mut self,
        ctx: &mut PagingContext<'_, K, F>,
        installed: Vec<(usize, usize, Capability)>,
    ) where
        K: Kernel + ?Sized,
        F: FrameSource,
    {
        for (v, count, copy) in installed {
            let i2 = l2_index(v);
            if let Some(table) = self.tables[l1_index(v)].as_deref_mut() {
                if let Err(e) = invoke::vnode_unmap(ctx.kernel, table.cap(), i2, count) {
                    warn!("unwinding {:#x}: unmap failed: {}", v, e);
                }
                for i in i2..i2 + count {
                    table.clear_present(i);
                }
            }
            if let Err(e) = ctx.cspace.delete(ctx.kernel, copy) {
                warn!("unwinding {:#x}: leaking mapping copy: {}", v, e);
            }
        }
    }
}
