//! Simulated Tern kernel for host development and testing
//!
//! # WARNING: This is NOT the real kernel!
//!
//! The mock keeps the whole object graph (CNodes, RAM regions, frames, page
//! tables, dispatchers, endpoints, IRQ tables) behind one lock and implements
//! [`Kernel`] for each simulated domain. Runnable dispatchers execute a host
//! closure on their own thread, so multi-domain scenarios (init, a service
//! provider, a client) run concurrently the way they would on hardware.
//!
//! Physical memory is backed lazily, one 4 KiB page at a time, the first time
//! a domain writes to it through a mapping.

mod state;

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tern_platform::bootinfo::board;
use tern_platform::{
    slots, BootInfo, BootModule, CNodeId, CapAddr, CapRights, Invocation, Kernel, KernelError,
    LmpRecv, MemRegion, ObjType, SysRet, TrapFrame, Word,
};

pub use state::RunState;
use state::{ObjId, State};

/// Body of a simulated program. Receives the kernel view of its own domain.
pub type Program = Arc<dyn Fn(MockDomain) + Send + Sync>;

/// Physical address of the first boot module image
pub const MODULE_BASE: usize = 0x7000_0000;

/// Spacing between module images
pub const MODULE_STRIDE: usize = 0x0010_0000;

/// A boot module and the program it runs
pub struct MockModule {
    pub name: String,
    pub program: Program,
}

impl MockModule {
    pub fn new<F>(name: &str, program: F) -> Self
    where
        F: Fn(MockDomain) + Send + Sync + 'static,
    {
        Self { name: name.to_string(), program: Arc::new(program) }
    }
}

/// Mock kernel configuration
pub struct MockConfig {
    /// Bytes of RAM handed to init
    pub ram_size: usize,
    /// Core init boots on
    pub core_id: usize,
    /// Boot modules
    pub modules: Vec<MockModule>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self { ram_size: 64 * 1024 * 1024, core_id: 0, modules: Vec::new() }
    }
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    epoch: Instant,
    programs: BTreeMap<usize, Program>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the simulated kernel
#[derive(Clone)]
pub struct MockKernel {
    shared: Arc<Shared>,
}

/// The kernel as seen by one domain
#[derive(Clone)]
pub struct MockDomain {
    kernel: MockKernel,
    dispatcher: ObjId,
}

impl MockKernel {
    /// Boot the simulated machine
    ///
    /// Creates init's dispatcher, root CNode and L1 table and fills init's
    /// well-known slots. Returns the kernel, init's domain view and the boot
    /// information init would find in memory.
    pub fn boot(config: MockConfig) -> (MockKernel, MockDomain, BootInfo) {
        let mut state = State::new(config.core_id);

        let cnode_obj = state.new_kernel_object(ObjType::CNode);
        let disp = state.new_kernel_object(ObjType::Dispatcher);
        let l1 = state.new_kernel_object(ObjType::L1Table);
        let kernel_obj = state.new_kernel_object(ObjType::Kernel);
        let irq = state.new_kernel_object(ObjType::IrqTable);
        let ram = state.new_object(ObjType::Ram, board::RAM_BASE, config.ram_size, false, None);
        let dev = state.new_object(ObjType::Ram, board::DEVICE_BASE, board::DEVICE_SIZE, true, None);

        let root = match state.cnode_id(cnode_obj) {
            Some(root) => root,
            None => unreachable!("fresh CNode object always has an id"),
        };
        let place = |state: &mut State, obj: ObjId, kind: ObjType, slot: u32| {
            state.new_cap(obj, kind, CapRights::ALL, None, Some(CapAddr::new(root, slot)));
        };
        place(&mut state, disp, ObjType::Dispatcher, slots::DISPATCHER);
        place(&mut state, cnode_obj, ObjType::CNode, slots::ROOT_CNODE);
        place(&mut state, l1, ObjType::L1Table, slots::L1_TABLE);
        place(&mut state, kernel_obj, ObjType::Kernel, slots::KERNEL);
        place(&mut state, ram, ObjType::Ram, slots::BOOT_RAM);
        place(&mut state, dev, ObjType::Ram, slots::DEVICE_RAM);
        place(&mut state, irq, ObjType::IrqTable, slots::IRQ_TABLE);

        if let Some(d) = state.dispatcher_mut(disp) {
            d.cspace = Some(root);
            d.vspace = Some(l1);
            d.run = RunState::Running;
        }

        let mut programs = BTreeMap::new();
        let mut modules = Vec::new();
        for (i, module) in config.modules.into_iter().enumerate() {
            let base = MODULE_BASE + i * MODULE_STRIDE;
            programs.insert(base, module.program);
            modules.push(BootModule { name: module.name, base, size: MODULE_STRIDE });
        }

        let info = BootInfo {
            core_id: config.core_id,
            ram: MemRegion { base: board::RAM_BASE, size: config.ram_size },
            device: MemRegion { base: board::DEVICE_BASE, size: board::DEVICE_SIZE },
            modules,
        };
        info!("mock kernel booted: {} MiB RAM, {} modules", config.ram_size >> 20, info.modules.len());

        let kernel = MockKernel {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                cond: Condvar::new(),
                epoch: Instant::now(),
                programs,
                threads: Mutex::new(Vec::new()),
            }),
        };
        let init = MockDomain { kernel: kernel.clone(), dispatcher: disp };
        (kernel, init, info)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_pending(&self, mut state: MutexGuard<'_, State>) {
        let starts = std::mem::take(&mut state.pending_starts);
        let entries: Vec<(ObjId, usize)> = starts
            .into_iter()
            .filter_map(|d| state.dispatcher(d).map(|disp| (d, disp.entry)))
            .collect();
        drop(state);

        for (dispatcher, entry) in entries {
            let Some(program) = self.shared.programs.get(&entry).cloned() else {
                warn!("no program at entry {:#x}; dispatcher stays idle", entry);
                continue;
            };
            let domain = MockDomain { kernel: self.clone(), dispatcher };
            debug!("starting program at {:#x}", entry);
            let handle = std::thread::spawn(move || program(domain));
            self.shared
                .threads
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
        }
    }

    /// Stop every dispatcher and wake all waiters
    pub fn shutdown(&self) {
        let mut state = self.state();
        for id in state.dispatcher_ids() {
            if let Some(d) = state.dispatcher_mut(id) {
                d.run = RunState::Stopped;
            }
        }
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Join every program thread, re-raising the first panic
    pub fn join(&self) {
        loop {
            let handles: Vec<_> = self
                .shared
                .threads
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
                .collect();
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(panic) = handle.join() {
                    std::panic::resume_unwind(panic);
                }
            }
        }
    }

    /// Deliver an interrupt to every endpoint bound to `irq`
    pub fn raise_irq(&self, irq: usize) -> usize {
        let delivered = self.state().raise_irq(irq);
        self.shared.cond.notify_all();
        delivered
    }

    /// Number of live capability records, for leak checks
    pub fn live_caps(&self) -> usize {
        self.state().live_caps()
    }
}

impl MockDomain {
    pub fn kernel(&self) -> &MockKernel {
        &self.kernel
    }

    /// Type of the capability in `addr`, if any
    pub fn slot_kind(&self, addr: CapAddr) -> Option<ObjType> {
        self.kernel.state().slot_kind(addr)
    }

    pub fn run_state(&self) -> Option<RunState> {
        self.kernel.state().dispatcher(self.dispatcher).map(|d| d.run)
    }

    /// Load a byte through this domain's translation tables
    pub fn read_byte(&self, vaddr: usize) -> Result<u8, KernelError> {
        self.kernel.state().read_byte(self.dispatcher, vaddr)
    }

    /// Store a byte through this domain's translation tables
    pub fn write_byte(&self, vaddr: usize, value: u8) -> Result<(), KernelError> {
        self.kernel.state().write_byte(self.dispatcher, vaddr, value)
    }
}

impl Kernel for MockDomain {
    fn syscall(&self, frame: &TrapFrame) -> SysRet {
        let inv = match Invocation::decode(frame) {
            Ok(inv) => inv,
            Err(e) => return SysRet::err(e),
        };
        let mut state = self.kernel.state();
        let result = state.invoke(self.dispatcher, &inv);
        self.kernel.start_pending(state);
        self.kernel.shared.cond.notify_all();
        result.into()
    }

    fn lmp_send(&self, ep: CapAddr, words: &[Word], cap: Option<CapAddr>) -> Result<(), KernelError> {
        self.kernel.state().lmp_send(self.dispatcher, ep, words, cap)?;
        self.kernel.shared.cond.notify_all();
        Ok(())
    }

    fn lmp_recv(&self, ep: CapAddr, recv_slot: Option<CapAddr>) -> Result<Option<LmpRecv>, KernelError> {
        self.kernel.state().lmp_recv(self.dispatcher, ep, recv_slot)
    }

    fn wait_for_messages(&self, eps: &[CapAddr], timeout: Option<Duration>) -> Result<(), KernelError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.kernel.state();
        loop {
            if state.has_message(self.dispatcher, eps)? {
                return Ok(());
            }
            state = match deadline {
                None => self
                    .kernel
                    .shared
                    .cond
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(KernelError::Timeout);
                    }
                    self.kernel
                        .shared
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    fn now(&self) -> Duration {
        self.kernel.shared.epoch.elapsed()
    }

    fn root_cnode(&self) -> CNodeId {
        self.kernel
            .state()
            .root_cnode(self.dispatcher)
            .unwrap_or(CNodeId(0))
    }
}

#[cfg(test)]
mod tests;
