//! Object graph of the simulated kernel
//!
//! Every capability is a record in `caps`; a record either sits in a CNode
//! slot or is held by the kernel itself (queued in an endpoint buffer, stored
//! in an IRQ table, or backing an L1 entry). An object lives as long as at
//! least one record names it.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Range;

use log::{debug, trace};
use tern_platform::{
    CNodeId, CapAddr, CapRights, Invocation, KernelError, LmpRecv, MapFlags, ObjType, Opcode,
    Word, BASE_PAGE_SIZE, CNODE_SLOTS, L1_ENTRIES, L2_ENTRIES, L2_INDEX_MASK, LMP_MSG_WORDS,
    OBJSIZE_CNODE, OBJSIZE_DISPATCHER, OBJSIZE_L1,
};

type KResult<T> = Result<T, KernelError>;

/// Highest IRQ vector an IRQ table accepts
pub(crate) const MAX_IRQ: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ObjId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct CapId(u64);

#[derive(Debug)]
pub(crate) struct Object {
    pub kind: ObjType,
    pub base: usize,
    pub bytes: usize,
    pub device: bool,
    /// RAM object this one was retyped from
    pub parent: Option<ObjId>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Mapping {
    pub table: ObjId,
    pub index: usize,
    pub count: usize,
}

#[derive(Debug)]
pub(crate) struct CapRecord {
    pub obj: ObjId,
    pub kind: ObjType,
    pub rights: CapRights,
    /// Capability this one was copied or retyped from
    pub parent: Option<CapId>,
    pub loc: Option<CapAddr>,
    pub mapping: Option<Mapping>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Pte {
    pub frame_cap: CapId,
    pub paddr: usize,
    pub flags: MapFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    pub cspace: Option<CNodeId>,
    pub vspace: Option<ObjId>,
    pub entry: usize,
    pub run: RunState,
}

#[derive(Debug)]
struct Queued {
    words: Vec<Word>,
    cap: Option<CapId>,
}

#[derive(Debug)]
struct EndpointObj {
    owner: ObjId,
    capacity: usize,
    used: usize,
    queue: VecDeque<Queued>,
}

pub(crate) struct State {
    next_obj: u64,
    next_cap: u64,
    next_cnode: u32,
    next_kernel_paddr: usize,
    objects: BTreeMap<ObjId, Object>,
    caps: BTreeMap<CapId, CapRecord>,
    cnodes: BTreeMap<CNodeId, BTreeMap<u32, CapId>>,
    cnode_of: BTreeMap<ObjId, CNodeId>,
    l1: BTreeMap<ObjId, BTreeMap<usize, (ObjId, CapId)>>,
    l2: BTreeMap<ObjId, BTreeMap<usize, Pte>>,
    dispatchers: BTreeMap<ObjId, Dispatcher>,
    endpoints: BTreeMap<ObjId, EndpointObj>,
    irq_tables: BTreeMap<ObjId, BTreeMap<usize, CapId>>,
    memory: BTreeMap<usize, Box<[u8; BASE_PAGE_SIZE]>>,
    pub core_id: usize,
    /// Dispatchers made runnable since the last drain
    pub pending_starts: Vec<ObjId>,
}

impl State {
    pub fn new(core_id: usize) -> Self {
        Self {
            next_obj: 1,
            next_cap: 1,
            next_cnode: 1,
            next_kernel_paddr: 0x1000_0000,
            objects: BTreeMap::new(),
            caps: BTreeMap::new(),
            cnodes: BTreeMap::new(),
            cnode_of: BTreeMap::new(),
            l1: BTreeMap::new(),
            l2: BTreeMap::new(),
            dispatchers: BTreeMap::new(),
            endpoints: BTreeMap::new(),
            irq_tables: BTreeMap::new(),
            memory: BTreeMap::new(),
            core_id,
            pending_starts: Vec::new(),
        }
    }

    // ---- object and record bookkeeping ----

    pub fn new_object(
        &mut self,
        kind: ObjType,
        base: usize,
        bytes: usize,
        device: bool,
        parent: Option<ObjId>,
    ) -> ObjId {
        let id = ObjId(self.next_obj);
        self.next_obj += 1;
        match kind {
            ObjType::CNode => {
                let cnode = CNodeId(self.next_cnode);
                self.next_cnode += 1;
                self.cnodes.insert(cnode, BTreeMap::new());
                self.cnode_of.insert(id, cnode);
            }
            ObjType::L1Table => {
                self.l1.insert(id, BTreeMap::new());
            }
            ObjType::L2Table => {
                self.l2.insert(id, BTreeMap::new());
            }
            ObjType::Dispatcher => {
                self.dispatchers.insert(
                    id,
                    Dispatcher { cspace: None, vspace: None, entry: 0, run: RunState::Created },
                );
            }
            ObjType::IrqTable => {
                self.irq_tables.insert(id, BTreeMap::new());
            }
            _ => {}
        }
        self.objects.insert(id, Object { kind, base, bytes, device, parent });
        id
    }

    /// Create an object outside any RAM region (boot-time kernel objects)
    pub fn new_kernel_object(&mut self, kind: ObjType) -> ObjId {
        let bytes = match kind {
            ObjType::CNode => OBJSIZE_CNODE,
            ObjType::L1Table => OBJSIZE_L1,
            ObjType::Dispatcher => OBJSIZE_DISPATCHER,
            _ => BASE_PAGE_SIZE,
        };
        let base = self.next_kernel_paddr;
        self.next_kernel_paddr += bytes;
        self.new_object(kind, base, bytes, false, None)
    }

    pub fn new_cap(
        &mut self,
        obj: ObjId,
        kind: ObjType,
        rights: CapRights,
        parent: Option<CapId>,
        loc: Option<CapAddr>,
    ) -> CapId {
        let id = CapId(self.next_cap);
        self.next_cap += 1;
        if let Some(addr) = loc {
            if let Some(cnode) = self.cnodes.get_mut(&addr.cnode) {
                cnode.insert(addr.slot, id);
            }
        }
        self.caps.insert(id, CapRecord { obj, kind, rights, parent, loc, mapping: None });
        id
    }

    pub fn cnode_id(&self, obj: ObjId) -> Option<CNodeId> {
        self.cnode_of.get(&obj).copied()
    }

    pub fn dispatcher(&self, obj: ObjId) -> Option<&Dispatcher> {
        self.dispatchers.get(&obj)
    }

    pub fn dispatcher_mut(&mut self, obj: ObjId) -> Option<&mut Dispatcher> {
        self.dispatchers.get_mut(&obj)
    }

    pub fn dispatcher_ids(&self) -> Vec<ObjId> {
        self.dispatchers.keys().copied().collect()
    }

    pub fn root_cnode(&self, dom: ObjId) -> KResult<CNodeId> {
        self.dispatchers
            .get(&dom)
            .and_then(|d| d.cspace)
            .ok_or(KernelError::DispatcherStopped)
    }

    pub fn check_running(&self, dom: ObjId) -> KResult<()> {
        match self.dispatchers.get(&dom) {
            Some(d) if d.run == RunState::Running => Ok(()),
            _ => Err(KernelError::DispatcherStopped),
        }
    }

    /// A domain can name its root CNode and any CNode it holds a capability to
    /// in that root
    fn accessible(&self, dom: ObjId, cnode: CNodeId) -> bool {
        let root = match self.root_cnode(dom) {
            Ok(root) => root,
            Err(_) => return false,
        };
        if root == cnode {
            return true;
        }
        self.cnodes.get(&root).map_or(false, |slots| {
            slots.values().any(|id| {
                self.caps
                    .get(id)
                    .filter(|rec| rec.kind == ObjType::CNode)
                    .and_then(|rec| self.cnode_of.get(&rec.obj))
                    == Some(&cnode)
            })
        })
    }

    pub fn resolve(&self, dom: ObjId, addr: CapAddr) -> KResult<CapId> {
        if addr.is_null() || !self.accessible(dom, addr.cnode) {
            return Err(KernelError::InvalidCapability);
        }
        if addr.slot >= CNODE_SLOTS {
            return Err(KernelError::RangeError);
        }
        self.cnodes
            .get(&addr.cnode)
            .and_then(|slots| slots.get(&addr.slot))
            .copied()
            .ok_or(KernelError::InvalidCapability)
    }

    fn check_empty_slot(&self, dom: ObjId, addr: CapAddr) -> KResult<()> {
        if !self.accessible(dom, addr.cnode) {
            return Err(KernelError::InvalidCapability);
        }
        if addr.slot == 0 || addr.slot >= CNODE_SLOTS {
            return Err(KernelError::RangeError);
        }
        match self.cnodes.get(&addr.cnode).and_then(|s| s.get(&addr.slot)) {
            Some(_) => Err(KernelError::SlotInUse),
            None => Ok(()),
        }
    }

    pub fn slot_kind(&self, addr: CapAddr) -> Option<ObjType> {
        self.cnodes
            .get(&addr.cnode)
            .and_then(|s| s.get(&addr.slot))
            .and_then(|id| self.caps.get(id))
            .map(|rec| rec.kind)
    }

    fn record(&self, id: CapId) -> KResult<&CapRecord> {
        self.caps.get(&id).ok_or(KernelError::InvalidCapability)
    }

    fn object(&self, id: ObjId) -> KResult<&Object> {
        self.objects.get(&id).ok_or(KernelError::InvalidCapability)
    }

    fn remove_cap(&mut self, id: CapId) {
        let rec = match self.caps.remove(&id) {
            Some(rec) => rec,
            None => return,
        };
        if let Some(mapping) = rec.mapping {
            self.clear_mapping(id, mapping);
        }
        if let Some(addr) = rec.loc {
            if let Some(slots) = self.cnodes.get_mut(&addr.cnode) {
                slots.remove(&addr.slot);
            }
        }
        for child in self.caps.values_mut() {
            if child.parent == Some(id) {
                child.parent = rec.parent;
            }
        }
        self.collect_object(rec.obj);
    }

    fn clear_mapping(&mut self, cap: CapId, mapping: Mapping) {
        if let Some(entries) = self.l1.get_mut(&mapping.table) {
            entries.remove(&mapping.index);
        } else if let Some(entries) = self.l2.get_mut(&mapping.table) {
            for idx in mapping.index..mapping.index + mapping.count {
                if entries.get(&idx).map_or(false, |pte| pte.frame_cap == cap) {
                    entries.remove(&idx);
                }
            }
        }
    }

    fn collect_object(&mut self, obj: ObjId) {
        if self.caps.values().any(|rec| rec.obj == obj) {
            return;
        }
        let Some(object) = self.objects.remove(&obj) else {
            return;
        };
        trace!("collect {:?} {:?}", obj, object.kind);
        let mut held = Vec::new();
        if let Some(cnode) = self.cnode_of.remove(&obj) {
            if let Some(slots) = self.cnodes.remove(&cnode) {
                held.extend(slots.into_values());
            }
        }
        if let Some(entries) = self.l1.remove(&obj) {
            held.extend(entries.into_values().map(|(_, cap)| cap));
        }
        self.l2.remove(&obj);
        if let Some(ep) = self.endpoints.remove(&obj) {
            held.extend(ep.queue.into_iter().filter_map(|q| q.cap));
        }
        if let Some(table) = self.irq_tables.remove(&obj) {
            held.extend(table.into_values());
        }
        self.dispatchers.remove(&obj);
        for cap in held {
            if let Some(rec) = self.caps.get_mut(&cap) {
                rec.loc = None;
            }
            self.remove_cap(cap);
        }
    }

    fn descendants(&self, root: CapId) -> Vec<CapId> {
        self.caps
            .iter()
            .filter(|(_, rec)| {
                let mut parent = rec.parent;
                while let Some(p) = parent {
                    if p == root {
                        return true;
                    }
                    parent = self.caps.get(&p).and_then(|r| r.parent);
                }
                false
            })
            .map(|(id, _)| *id)
            .collect()
    }

    // ---- invocations ----

    pub fn invoke(&mut self, dom: ObjId, inv: &Invocation) -> KResult<[Word; 2]> {
        self.check_running(dom)?;
        let cap = self.resolve(dom, inv.cap)?;
        trace!("invoke {:?} on {:?}", inv.op, inv.cap);
        match inv.op {
            Opcode::Retype => self.retype(dom, cap, inv),
            Opcode::Create => self.create(dom, cap, inv),
            Opcode::Copy => self.copy(dom, cap, inv, None),
            Opcode::Mint => {
                let rights = CapRights::from_bits_truncate(inv.arg(3)?);
                self.copy(dom, cap, inv, Some(rights))
            }
            Opcode::Delete => {
                self.remove_cap(cap);
                Ok([0; 2])
            }
            Opcode::Revoke => {
                for child in self.descendants(cap) {
                    self.remove_cap(child);
                }
                Ok([0; 2])
            }
            Opcode::Identify => self.identify(cap),
            Opcode::Map => self.map(dom, cap, inv),
            Opcode::Unmap => self.unmap(cap, inv),
            Opcode::ModifyFlags => self.modify_flags(cap, inv),
            Opcode::DispatcherSetup => self.dispatcher_setup(dom, cap, inv),
            Opcode::DispatcherStop => self.dispatcher_stop(cap),
            Opcode::IrqTableSet => self.irq_set(dom, cap, inv),
            Opcode::IrqTableDelete => self.irq_delete(cap, inv),
            Opcode::GetCoreId => {
                self.expect_kind(cap, ObjType::Kernel)?;
                Ok([self.core_id, 0])
            }
        }
    }

    fn expect_kind(&self, cap: CapId, kind: ObjType) -> KResult<&CapRecord> {
        let rec = self.record(cap)?;
        if rec.kind != kind {
            return Err(KernelError::TypeMismatch);
        }
        Ok(rec)
    }

    fn dest_addr(inv: &Invocation, cnode_arg: usize) -> KResult<CapAddr> {
        Ok(CapAddr::new(CNodeId(inv.arg(cnode_arg)? as u32), inv.arg(cnode_arg + 1)? as u32))
    }

    fn retype(&mut self, dom: ObjId, src: CapId, inv: &Invocation) -> KResult<[Word; 2]> {
        let offset = inv.arg(0)?;
        let ty = ObjType::from_word(inv.arg(1)?).ok_or(KernelError::InvalidArgument)?;
        let objsize = inv.arg(2)?;
        let count = inv.arg(3)?;
        let dest = Self::dest_addr(inv, 4)?;
        if count == 0 || objsize == 0 {
            return Err(KernelError::InvalidArgument);
        }
        for i in 0..count {
            self.check_empty_slot(dom, CapAddr::new(dest.cnode, dest.slot + i as u32))?;
        }
        let (src_obj, src_kind) = {
            let rec = self.record(src)?;
            (rec.obj, rec.kind)
        };
        let (base, bytes, device) = {
            let o = self.object(src_obj)?;
            (o.base, o.bytes, o.device)
        };

        match src_kind {
            ObjType::Dispatcher => {
                if ty != ObjType::Endpoint {
                    return Err(KernelError::TypeMismatch);
                }
                if count != 1 || objsize < LMP_MSG_WORDS + 1 {
                    return Err(KernelError::InvalidArgument);
                }
                let ep = self.new_object(ObjType::Endpoint, base, objsize, false, Some(src_obj));
                self.endpoints.insert(
                    ep,
                    EndpointObj { owner: src_obj, capacity: objsize, used: 0, queue: VecDeque::new() },
                );
                self.new_cap(ep, ObjType::Endpoint, CapRights::ALL, Some(src), Some(dest));
                Ok([0; 2])
            }
            ObjType::Ram => {
                match ty {
                    ObjType::Ram
                    | ObjType::CNode
                    | ObjType::L1Table
                    | ObjType::L2Table
                    | ObjType::Dispatcher => {}
                    ObjType::Frame if !device => {}
                    ObjType::DevFrame if device => {}
                    _ => return Err(KernelError::TypeMismatch),
                }
                if offset % BASE_PAGE_SIZE != 0 || objsize % BASE_PAGE_SIZE != 0 {
                    return Err(KernelError::AlignmentError);
                }
                if ty.fixed_size().map_or(false, |min| objsize < min) {
                    return Err(KernelError::InvalidArgument);
                }
                let total = objsize.checked_mul(count).ok_or(KernelError::RangeError)?;
                let end = offset.checked_add(total).ok_or(KernelError::RangeError)?;
                if end > bytes {
                    return Err(KernelError::RangeError);
                }
                let start_pa = base + offset;
                let end_pa = base + end;
                let overlaps = self.objects.values().any(|o| {
                    o.parent == Some(src_obj) && o.base < end_pa && start_pa < o.base + o.bytes
                });
                if overlaps {
                    return Err(KernelError::Overlap);
                }
                for i in 0..count {
                    let obj = self.new_object(ty, start_pa + i * objsize, objsize, device, Some(src_obj));
                    let loc = CapAddr::new(dest.cnode, dest.slot + i as u32);
                    self.new_cap(obj, ty, CapRights::ALL, Some(src), Some(loc));
                }
                debug!("retype {:?} x{} at {:#x} ({} bytes each)", ty, count, start_pa, objsize);
                Ok([0; 2])
            }
            _ => Err(KernelError::TypeMismatch),
        }
    }

    fn create(&mut self, dom: ObjId, cap: CapId, inv: &Invocation) -> KResult<[Word; 2]> {
        self.expect_kind(cap, ObjType::Kernel)?;
        let ty = ObjType::from_word(inv.arg(0)?).ok_or(KernelError::InvalidArgument)?;
        let base = inv.arg(1)?;
        let bytes = inv.arg(2)?;
        let dest = Self::dest_addr(inv, 3)?;
        if !matches!(ty, ObjType::Ram | ObjType::Frame | ObjType::DevFrame) {
            return Err(KernelError::TypeMismatch);
        }
        if bytes == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if base % BASE_PAGE_SIZE != 0 || bytes % BASE_PAGE_SIZE != 0 {
            return Err(KernelError::AlignmentError);
        }
        self.check_empty_slot(dom, dest)?;
        let obj = self.new_object(ty, base, bytes, ty == ObjType::DevFrame, None);
        self.new_cap(obj, ty, CapRights::ALL, None, Some(dest));
        Ok([0; 2])
    }

    /// Copy and mint are invoked on the CNode capability naming the destination
    fn copy(
        &mut self,
        dom: ObjId,
        dest_cnode_cap: CapId,
        inv: &Invocation,
        rights: Option<CapRights>,
    ) -> KResult<[Word; 2]> {
        let dest_cnode = {
            let rec = self.expect_kind(dest_cnode_cap, ObjType::CNode)?;
            self.cnode_id(rec.obj).ok_or(KernelError::InvalidCapability)?
        };
        let dest = CapAddr::new(dest_cnode, inv.arg(0)? as u32);
        let src = self.resolve(dom, Self::dest_addr(inv, 1)?)?;
        self.check_empty_slot(dom, dest)?;
        let (obj, kind, src_rights) = {
            let rec = self.record(src)?;
            (rec.obj, rec.kind, rec.rights)
        };
        let rights = match rights {
            Some(mask) if !src_rights.contains(mask) => return Err(KernelError::InsufficientRights),
            Some(mask) => mask,
            None => src_rights,
        };
        self.new_cap(obj, kind, rights, Some(src), Some(dest));
        Ok([0; 2])
    }

    fn identify(&self, cap: CapId) -> KResult<[Word; 2]> {
        let rec = self.record(cap)?;
        let o = self.object(rec.obj)?;
        let bits = if o.bytes <= 1 {
            0
        } else {
            (usize::BITS - (o.bytes - 1).leading_zeros()) as usize
        };
        Ok([o.base | bits, o.bytes])
    }

    fn map(&mut self, dom: ObjId, table_cap: CapId, inv: &Invocation) -> KResult<[Word; 2]> {
        let index = inv.arg(0)?;
        let src = self.resolve(dom, Self::dest_addr(inv, 1)?)?;
        let flags = MapFlags::from_bits_truncate(inv.arg(3)?);
        let offset = inv.arg(4)?;
        let count = inv.arg(5)?;

        let (table, table_kind) = {
            let rec = self.record(table_cap)?;
            (rec.obj, rec.kind)
        };
        let (src_obj, src_kind, src_rights, src_mapped) = {
            let rec = self.record(src)?;
            (rec.obj, rec.kind, rec.rights, rec.mapping.is_some())
        };
        if src_mapped {
            return Err(KernelError::AlreadyMapped);
        }

        match table_kind {
            ObjType::L1Table => {
                if src_kind != ObjType::L2Table {
                    return Err(KernelError::TypeMismatch);
                }
                if index >= L1_ENTRIES {
                    return Err(KernelError::RangeError);
                }
                if count != 1 {
                    return Err(KernelError::InvalidArgument);
                }
                let entries = self.l1.get_mut(&table).ok_or(KernelError::InvalidCapability)?;
                if entries.contains_key(&index) {
                    return Err(KernelError::AlreadyMapped);
                }
                entries.insert(index, (src_obj, src));
            }
            ObjType::L2Table => {
                if !matches!(src_kind, ObjType::Frame | ObjType::DevFrame) {
                    return Err(KernelError::TypeMismatch);
                }
                let span = l2_span(index, count).ok_or(KernelError::RangeError)?;
                if offset % BASE_PAGE_SIZE != 0 {
                    return Err(KernelError::AlignmentError);
                }
                let frame = self.object(src_obj)?;
                let end = count.checked_mul(BASE_PAGE_SIZE).and_then(|b| offset.checked_add(b));
                if end.map_or(true, |end| end > frame.bytes) {
                    return Err(KernelError::RangeError);
                }
                if flags.contains(MapFlags::WRITE) && !src_rights.contains(CapRights::WRITE) {
                    return Err(KernelError::InsufficientRights);
                }
                let frame_base = frame.base;
                let entries = self.l2.get_mut(&table).ok_or(KernelError::InvalidCapability)?;
                if span.clone().any(|i| entries.contains_key(&i)) {
                    return Err(KernelError::AlreadyMapped);
                }
                for i in 0..count {
                    entries.insert(
                        index + i,
                        Pte { frame_cap: src, paddr: frame_base + offset + i * BASE_PAGE_SIZE, flags },
                    );
                }
            }
            _ => return Err(KernelError::TypeMismatch),
        }

        if let Some(rec) = self.caps.get_mut(&src) {
            rec.mapping = Some(Mapping { table, index, count });
        }
        Ok([0; 2])
    }

    fn unmap(&mut self, table_cap: CapId, inv: &Invocation) -> KResult<[Word; 2]> {
        let index = inv.arg(0)?;
        let count = inv.arg(1)?;
        let (table, kind) = {
            let rec = self.record(table_cap)?;
            (rec.obj, rec.kind)
        };
        let removed: Vec<CapId> = match kind {
            ObjType::L1Table => {
                let entries = self.l1.get_mut(&table).ok_or(KernelError::InvalidCapability)?;
                let (_, cap) = entries.remove(&index).ok_or(KernelError::NotMapped)?;
                vec![cap]
            }
            ObjType::L2Table => {
                let entries = self.l2.get_mut(&table).ok_or(KernelError::InvalidCapability)?;
                let span = l2_span(index, count).ok_or(KernelError::NotMapped)?;
                if !span.clone().all(|i| entries.contains_key(&i)) {
                    return Err(KernelError::NotMapped);
                }
                span.filter_map(|i| entries.remove(&i))
                    .map(|pte| pte.frame_cap)
                    .collect()
            }
            _ => return Err(KernelError::TypeMismatch),
        };
        for cap in removed {
            let still_mapped = self
                .l2
                .get(&table)
                .map_or(false, |e| e.values().any(|pte| pte.frame_cap == cap));
            if !still_mapped {
                if let Some(rec) = self.caps.get_mut(&cap) {
                    rec.mapping = None;
                }
            }
        }
        Ok([0; 2])
    }

    fn modify_flags(&mut self, table_cap: CapId, inv: &Invocation) -> KResult<[Word; 2]> {
        let index = inv.arg(0)?;
        let count = inv.arg(1)?;
        let flags = MapFlags::from_bits_truncate(inv.arg(2)?);
        let table = self.expect_kind(table_cap, ObjType::L2Table)?.obj;
        let entries = self.l2.get(&table).ok_or(KernelError::InvalidCapability)?;
        let span = l2_span(index, count).ok_or(KernelError::NotMapped)?;
        if !span.clone().all(|i| entries.contains_key(&i)) {
            return Err(KernelError::NotMapped);
        }
        let needs_write = flags.contains(MapFlags::WRITE);
        for i in span.clone() {
            let frame_cap = entries[&i].frame_cap;
            if needs_write && !self.record(frame_cap)?.rights.contains(CapRights::WRITE) {
                return Err(KernelError::InsufficientRights);
            }
        }
        let entries = self.l2.get_mut(&table).ok_or(KernelError::InvalidCapability)?;
        for i in span {
            if let Some(pte) = entries.get_mut(&i) {
                pte.flags = flags;
            }
        }
        Ok([0; 2])
    }

    fn dispatcher_setup(&mut self, dom: ObjId, cap: CapId, inv: &Invocation) -> KResult<[Word; 2]> {
        let disp = self.expect_kind(cap, ObjType::Dispatcher)?.obj;
        let cspace = {
            let id = self.resolve(dom, Self::dest_addr(inv, 0)?)?;
            let rec = self.expect_kind(id, ObjType::CNode)?;
            self.cnode_id(rec.obj).ok_or(KernelError::InvalidCapability)?
        };
        let vspace = {
            let id = self.resolve(dom, Self::dest_addr(inv, 2)?)?;
            self.expect_kind(id, ObjType::L1Table)?.obj
        };
        let entry = inv.arg(4)?;
        let run = inv.arg(5)? != 0;
        let d = self.dispatchers.get_mut(&disp).ok_or(KernelError::InvalidCapability)?;
        if d.run == RunState::Stopped {
            return Err(KernelError::IllegalOperation);
        }
        d.cspace = Some(cspace);
        d.vspace = Some(vspace);
        d.entry = entry;
        if run && d.run != RunState::Running {
            d.run = RunState::Running;
            self.pending_starts.push(disp);
        }
        Ok([0; 2])
    }

    fn dispatcher_stop(&mut self, cap: CapId) -> KResult<[Word; 2]> {
        let disp = self.expect_kind(cap, ObjType::Dispatcher)?.obj;
        let d = self.dispatchers.get_mut(&disp).ok_or(KernelError::InvalidCapability)?;
        d.run = RunState::Stopped;
        Ok([0; 2])
    }

    fn irq_set(&mut self, dom: ObjId, cap: CapId, inv: &Invocation) -> KResult<[Word; 2]> {
        let table = self.expect_kind(cap, ObjType::IrqTable)?.obj;
        let irq = inv.arg(0)?;
        if irq >= MAX_IRQ {
            return Err(KernelError::RangeError);
        }
        let ep = self.resolve(dom, Self::dest_addr(inv, 1)?)?;
        let ep_obj = self.expect_kind(ep, ObjType::Endpoint)?.obj;
        let held = self.new_cap(ep_obj, ObjType::Endpoint, CapRights::ALL, Some(ep), None);
        let old = self
            .irq_tables
            .get_mut(&table)
            .and_then(|t| t.insert(irq, held));
        if let Some(old) = old {
            self.remove_cap(old);
        }
        Ok([0; 2])
    }

    fn irq_delete(&mut self, cap: CapId, inv: &Invocation) -> KResult<[Word; 2]> {
        let table = self.expect_kind(cap, ObjType::IrqTable)?.obj;
        let irq = inv.arg(0)?;
        let held = self
            .irq_tables
            .get_mut(&table)
            .and_then(|t| t.remove(&irq))
            .ok_or(KernelError::InvalidArgument)?;
        self.remove_cap(held);
        Ok([0; 2])
    }

    // ---- message transport ----

    pub fn lmp_send(
        &mut self,
        dom: ObjId,
        ep: CapAddr,
        words: &[Word],
        cap: Option<CapAddr>,
    ) -> KResult<()> {
        self.check_running(dom)?;
        if words.len() > LMP_MSG_WORDS {
            return Err(KernelError::InvalidArgument);
        }
        let ep_cap = self.resolve(dom, ep)?;
        let ep_obj = self.expect_kind(ep_cap, ObjType::Endpoint)?.obj;
        {
            let endpoint = self.endpoints.get(&ep_obj).ok_or(KernelError::InvalidCapability)?;
            if endpoint.used + words.len() + 1 > endpoint.capacity {
                return Err(KernelError::BufferFull);
            }
        }
        let transfer = match cap {
            Some(addr) => {
                let src = self.resolve(dom, addr)?;
                let (obj, kind, rights) = {
                    let rec = self.record(src)?;
                    (rec.obj, rec.kind, rec.rights)
                };
                Some(self.new_cap(obj, kind, rights, Some(src), None))
            }
            None => None,
        };
        let endpoint = self.endpoints.get_mut(&ep_obj).ok_or(KernelError::InvalidCapability)?;
        endpoint.used += words.len() + 1;
        endpoint.queue.push_back(Queued { words: words.to_vec(), cap: transfer });
        Ok(())
    }

    pub fn lmp_recv(
        &mut self,
        dom: ObjId,
        ep: CapAddr,
        recv_slot: Option<CapAddr>,
    ) -> KResult<Option<LmpRecv>> {
        self.check_running(dom)?;
        let ep_cap = self.resolve(dom, ep)?;
        let ep_obj = self.expect_kind(ep_cap, ObjType::Endpoint)?.obj;
        let pending_cap = {
            let endpoint = self.endpoints.get(&ep_obj).ok_or(KernelError::InvalidCapability)?;
            if endpoint.owner != dom {
                return Err(KernelError::IllegalOperation);
            }
            match endpoint.queue.front() {
                None => return Ok(None),
                Some(front) => front.cap.filter(|c| self.caps.contains_key(c)),
            }
        };
        if pending_cap.is_some() {
            let slot = recv_slot.ok_or(KernelError::NoReceiveSlot)?;
            self.check_empty_slot(dom, slot)?;
        }
        let endpoint = self.endpoints.get_mut(&ep_obj).ok_or(KernelError::InvalidCapability)?;
        let Some(msg) = endpoint.queue.pop_front() else {
            return Ok(None);
        };
        endpoint.used -= msg.words.len() + 1;

        let mut received = LmpRecv { words: [0; LMP_MSG_WORDS], len: msg.words.len(), cap: None };
        received.words[..msg.words.len()].copy_from_slice(&msg.words);
        if let (Some(cap), Some(slot)) = (pending_cap, recv_slot) {
            if let Some(rec) = self.caps.get_mut(&cap) {
                rec.loc = Some(slot);
                received.cap = Some((slot, rec.kind));
            }
            if let Some(slots) = self.cnodes.get_mut(&slot.cnode) {
                slots.insert(slot.slot, cap);
            }
        }
        Ok(Some(received))
    }

    pub fn has_message(&self, dom: ObjId, eps: &[CapAddr]) -> KResult<bool> {
        self.check_running(dom)?;
        Ok(eps.iter().any(|ep| {
            self.resolve(dom, *ep)
                .ok()
                .and_then(|id| self.caps.get(&id))
                .and_then(|rec| self.endpoints.get(&rec.obj))
                .map_or(false, |e| !e.queue.is_empty())
        }))
    }

    /// Queue a one-word notification on every endpoint bound to `irq`
    pub fn raise_irq(&mut self, irq: usize) -> usize {
        let targets: Vec<ObjId> = self
            .irq_tables
            .values()
            .filter_map(|t| t.get(&irq))
            .filter_map(|cap| self.caps.get(cap))
            .map(|rec| rec.obj)
            .collect();
        let mut delivered = 0;
        for obj in targets {
            if let Some(ep) = self.endpoints.get_mut(&obj) {
                if ep.used + 2 <= ep.capacity {
                    ep.used += 2;
                    ep.queue.push_back(Queued { words: vec![irq], cap: None });
                    delivered += 1;
                }
            }
        }
        delivered
    }

    // ---- memory ----

    fn translate(&self, dom: ObjId, vaddr: usize, write: bool) -> KResult<usize> {
        let vspace = self
            .dispatchers
            .get(&dom)
            .and_then(|d| d.vspace)
            .ok_or(KernelError::NotMapped)?;
        let (l2_obj, _) = self
            .l1
            .get(&vspace)
            .and_then(|e| e.get(&(vaddr >> 20)))
            .ok_or(KernelError::NotMapped)?;
        let pte = self
            .l2
            .get(l2_obj)
            .and_then(|e| e.get(&((vaddr >> 12) & L2_INDEX_MASK)))
            .ok_or(KernelError::NotMapped)?;
        let needed = if write { MapFlags::WRITE } else { MapFlags::READ };
        if !pte.flags.contains(needed) {
            return Err(KernelError::InsufficientRights);
        }
        Ok(pte.paddr + (vaddr & (BASE_PAGE_SIZE - 1)))
    }

    pub fn read_byte(&self, dom: ObjId, vaddr: usize) -> KResult<u8> {
        let paddr = self.translate(dom, vaddr, false)?;
        Ok(self
            .memory
            .get(&(paddr & !(BASE_PAGE_SIZE - 1)))
            .map_or(0, |page| page[paddr & (BASE_PAGE_SIZE - 1)]))
    }

    pub fn write_byte(&mut self, dom: ObjId, vaddr: usize, value: u8) -> KResult<()> {
        let paddr = self.translate(dom, vaddr, true)?;
        let page = self
            .memory
            .entry(paddr & !(BASE_PAGE_SIZE - 1))
            .or_insert_with(|| Box::new([0; BASE_PAGE_SIZE]));
        page[paddr & (BASE_PAGE_SIZE - 1)] = value;
        Ok(())
    }

    pub fn live_caps(&self) -> usize {
        self.caps.len()
    }
}

/// Entries `index..index + count` of an L2 table, if non-empty and in bounds
fn l2_span(index: usize, count: usize) -> Option<Range<usize>> {
    index.checked_add(count).filter(|&end| count != 0 && end <= L2_ENTRIES).map(|end| index..end)
}
