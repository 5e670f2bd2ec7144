//! Domain spawning
//!
//! Builds a new domain out of init's RAM:
//! - CNode, dispatcher and L1 table, retyped from boot RAM
//! - the well-known slots of the child's CNode filled with copies of them
//! - the module image placed by an [`ImageLoader`]
//! - a fresh channel whose endpoint lands in the child's `INIT_EP` slot
//!
//! and finally makes the dispatcher runnable. Any failure releases the
//! domain id; kernel objects already retyped stay carved out of boot RAM.

use alloc::vec::Vec;

use log::{info, warn};
use tern_cap::{invoke, CSpace, Capability};
use tern_ipc::{ChannelId, DomainId, EventLoop, IpcError};
use tern_platform::{
    slots, BootInfo, BootModule, Kernel, ObjType, BASE_PAGE_SIZE, OBJSIZE_CNODE,
    OBJSIZE_DISPATCHER, OBJSIZE_L1,
};

use crate::domains::{DomainState, INIT_DOMAIN};
use crate::memory::MemoryService;
use crate::{Init, InitError, Result};

/// Where boot module images come from
pub trait ModuleSource {
    fn find(&self, name: &str) -> Option<BootModule>;
}

impl ModuleSource for BootInfo {
    fn find(&self, name: &str) -> Option<BootModule> {
        self.module(name).cloned()
    }
}

impl ModuleSource for Vec<BootModule> {
    fn find(&self, name: &str) -> Option<BootModule> {
        self.iter().find(|m| m.name == name).cloned()
    }
}

/// Kernel objects of a domain under construction
#[derive(Debug, Clone, Copy)]
pub struct ChildImage<'a> {
    pub cnode: &'a Capability,
    pub dispatcher: &'a Capability,
    pub l1: &'a Capability,
}

/// Places a module image in a child's address space
pub trait ImageLoader {
    /// Load `module` for `child`, returning the entry point
    fn load(
        &mut self,
        kernel: &dyn Kernel,
        cspace: &mut CSpace,
        memory: &mut MemoryService,
        module: &BootModule,
        child: &ChildImage<'_>,
    ) -> Result<usize>;
}

/// Loader for images linked to run from where the boot image put them
///
/// Nothing is copied; the entry point is the image base.
#[derive(Debug, Default, Clone, Copy)]
pub struct InPlaceLoader;

impl ImageLoader for InPlaceLoader {
    fn load(
        &mut self,
        _kernel: &dyn Kernel,
        _cspace: &mut CSpace,
        _memory: &mut MemoryService,
        module: &BootModule,
        _child: &ChildImage<'_>,
    ) -> Result<usize> {
        if module.size == 0 {
            return Err(InitError::InvalidArgument("empty module image"));
        }
        Ok(module.base)
    }
}

/// What a spawn has built so far
#[derive(Default)]
struct Parts {
    cnode: Option<Capability>,
    dispatcher: Option<Capability>,
    l1: Option<Capability>,
    channel: Option<ChannelId>,
}

impl<K: Kernel + 'static> Init<K> {
    /// Start boot module `name` as a new domain on `core`
    ///
    /// # Errors
    /// `Unsupported` for a core other than init's, `NotFound` for an unknown
    /// module, or whatever step of the construction failed.
    pub fn spawn(&mut self, ev: &mut EventLoop<Self>, name: &str, core: usize) -> Result<DomainId> {
        if core != self.core_id {
            return Err(InitError::Unsupported("spawning on another core"));
        }
        let module = self.modules.find(name).ok_or(InitError::NotFound)?;
        let id = self.domains.alloc(name, core);

        let mut parts = Parts::default();
        let entry = match self.build_domain(ev, &module, &mut parts) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("spawn of {} as domain {} failed: {}", name, id, e);
                self.scrap(ev, parts);
                self.domains.release(id);
                return Err(e);
            }
        };
        if let Some(l1) = parts.l1.take() {
            // The child holds its own copy
            self.discard(l1);
        }
        if let Some(rec) = self.domains.get_mut(id) {
            rec.dispatcher = parts.dispatcher.take();
            rec.cnode = parts.cnode.take();
            rec.channel = parts.channel;
            rec.state = DomainState::Running;
        }
        info!("spawned {} as domain {} on core {} (entry {:#x})", name, id, core, entry);
        Ok(id)
    }

    fn build_domain(
        &mut self,
        ev: &mut EventLoop<Self>,
        module: &BootModule,
        parts: &mut Parts,
    ) -> Result<usize> {
        let cnode = &*parts.cnode.insert(self.memory.alloc_object(
            &self.kernel,
            &mut self.cspace,
            ObjType::CNode,
            OBJSIZE_CNODE,
            BASE_PAGE_SIZE,
        )?);
        let dispatcher = &*parts.dispatcher.insert(self.memory.alloc_object(
            &self.kernel,
            &mut self.cspace,
            ObjType::Dispatcher,
            OBJSIZE_DISPATCHER,
            BASE_PAGE_SIZE,
        )?);
        let l1 = &*parts.l1.insert(self.memory.alloc_object(
            &self.kernel,
            &mut self.cspace,
            ObjType::L1Table,
            OBJSIZE_L1,
            OBJSIZE_L1,
        )?);

        for (slot, cap) in [
            (slots::DISPATCHER, dispatcher),
            (slots::ROOT_CNODE, cnode),
            (slots::L1_TABLE, l1),
        ] {
            self.cspace.copy_into(&self.kernel, cnode, slot, cap)?;
        }

        let child = ChildImage { cnode, dispatcher, l1 };
        let entry = self.loader.load(&self.kernel, &mut self.cspace, &mut self.memory, module, &child)?;

        let chan = self.accept_channel()?;
        parts.channel = Some(chan);
        let local = self.channels.get(chan)?.local().ok_or(IpcError::NotConnected)?;
        self.cspace.copy_into(&self.kernel, cnode, slots::INIT_EP, local)?;
        Self::serve(ev, chan)?;

        invoke::dispatcher_setup(&self.kernel, dispatcher, cnode, l1, entry, true)?;
        Ok(entry)
    }

    fn scrap(&mut self, ev: &mut EventLoop<Self>, parts: Parts) {
        if let Some(chan) = parts.channel {
            self.close_channel(ev, chan);
        }
        for cap in [parts.l1, parts.dispatcher, parts.cnode].into_iter().flatten() {
            self.discard(cap);
        }
    }

    /// Stop domain `id` for good and free its table entry
    ///
    /// Closes every channel init holds on the domain's behalf, so services it
    /// provided disappear from the registry.
    pub fn kill(&mut self, ev: &mut EventLoop<Self>, id: DomainId) -> Result<()> {
        if id == INIT_DOMAIN {
            return Err(InitError::InvalidArgument("init cannot be killed"));
        }
        let rec = self.domains.release(id).ok_or(InitError::NoSuchDomain(id))?;
        if let Some(dispatcher) = &rec.dispatcher {
            if let Err(e) = invoke::dispatcher_stop(&self.kernel, dispatcher) {
                warn!("stopping domain {}: {}", id, e);
            }
        }
        for chan in rec.channel.into_iter().chain(rec.owned_channels.iter().copied()) {
            self.close_channel(ev, chan);
        }
        for cap in [rec.dispatcher, rec.cnode].into_iter().flatten() {
            self.discard(cap);
        }
        info!("killed domain {} ({})", id, rec.name);
        Ok(())
    }

    /// Record that init opened `chan` on behalf of whoever owns `requester`
    pub(crate) fn note_owned(&mut self, requester: ChannelId, chan: ChannelId) {
        if let Some(owner) = self.domains.by_channel(requester) {
            if let Some(rec) = self.domains.get_mut(owner) {
                rec.owned_channels.push(chan);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use core::time::Duration;
    use tern_kernel_mock::{MockConfig, MockDomain, MockKernel, MockModule, RunState};

    use crate::InitConfig;

    fn config() -> InitConfig {
        InitConfig { uart_irq: None, ..InitConfig::default() }
    }

    #[test]
    fn test_in_place_loader_entry() {
        let module = BootModule { name: String::from("a"), base: 0x7000_0000, size: 0x1000 };
        let empty = BootModule { size: 0, ..module.clone() };
        let (_kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let mut memory = MemoryService::new(&init, &cspace).unwrap();
        let cap = cspace.well_known(slots::DISPATCHER, ObjType::Dispatcher);
        let child = ChildImage { cnode: &cap, dispatcher: &cap, l1: &cap };

        let mut loader = InPlaceLoader;
        assert_eq!(loader.load(&init, &mut cspace, &mut memory, &module, &child), Ok(0x7000_0000));
        assert!(loader.load(&init, &mut cspace, &mut memory, &empty, &child).is_err());
    }

    #[test]
    fn test_spawn_fills_table_and_runs() {
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let modules = vec![MockModule::new("child", move |dom: MockDomain| {
            let _ = tx.lock().unwrap().send(dom.run_state());
        })];
        let (kernel, dom, info) = MockKernel::boot(MockConfig { modules, ..MockConfig::default() });
        let mut init = Init::new(dom, &info, config()).unwrap();
        let mut ev = EventLoop::new();

        let id = init.spawn(&mut ev, "child", 0).unwrap();
        assert_eq!(id, 1);
        let rec = init.domains().get(id).unwrap();
        assert_eq!(rec.state, DomainState::Running);
        assert!(rec.dispatcher.is_some() && rec.cnode.is_some());
        assert!(ev.is_armed(rec.channel.unwrap()));

        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(seen, Some(RunState::Running));
        kernel.shutdown();
        kernel.join();
    }

    #[test]
    fn test_spawn_errors_release_id() {
        let modules = vec![MockModule::new("idle", |_| {})];
        let (kernel, dom, info) = MockKernel::boot(MockConfig { modules, ..MockConfig::default() });
        let mut init = Init::new(dom, &info, config()).unwrap();
        let mut ev = EventLoop::new();

        assert_eq!(init.spawn(&mut ev, "missing", 0), Err(InitError::NotFound));
        assert!(matches!(init.spawn(&mut ev, "idle", 1), Err(InitError::Unsupported(_))));
        assert_eq!(init.domains().len(), 1);
        assert_eq!(ev.armed(), 0);
        assert_eq!(init.spawn(&mut ev, "idle", 0), Ok(1));
        kernel.shutdown();
        kernel.join();
    }

    #[test]
    fn test_kill_frees_id_and_channel() {
        let modules = vec![MockModule::new("idle", |_| {})];
        let (kernel, dom, info) = MockKernel::boot(MockConfig { modules, ..MockConfig::default() });
        let mut init = Init::new(dom, &info, config()).unwrap();
        let mut ev = EventLoop::new();

        let a = init.spawn(&mut ev, "idle", 0).unwrap();
        let b = init.spawn(&mut ev, "idle", 0).unwrap();
        assert_eq!((a, b), (1, 2));
        let chan = init.domains().get(a).and_then(|d| d.channel).unwrap();

        init.kill(&mut ev, a).unwrap();
        assert_eq!(init.domains().state(a), DomainState::Free);
        assert!(!ev.is_armed(chan));
        assert_eq!(init.kill(&mut ev, a), Err(InitError::NoSuchDomain(a)));
        assert!(matches!(init.kill(&mut ev, INIT_DOMAIN), Err(InitError::InvalidArgument(_))));

        // The freed id comes back first
        assert_eq!(init.spawn(&mut ev, "idle", 0), Ok(1));
        kernel.shutdown();
        kernel.join();
    }
}
