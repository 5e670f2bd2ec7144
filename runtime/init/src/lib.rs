//! Tern Init - the root user-space process
//!
//! # Purpose
//! Init is the first domain the kernel starts. It owns all boot RAM, the
//! device region and the IRQ table, and turns them into services other
//! domains reach over IPC: RAM and device-frame grants, the console UART,
//! the status LED, domain spawning and service discovery.
//!
//! # Integration Points
//! - Depends on: `tern-ipc` (channels, event loop, protocol), `tern-cap`
//!   (retype, copy, dispatcher and IRQ invocations), `tern-platform`
//! - Provides to: every other domain, through the endpoint init leaves in the
//!   domain's `INIT_EP` slot
//! - Capabilities required: init's well-known slots (RAM, device RAM, kernel,
//!   IRQ table, dispatcher)
//!
//! # Architecture
//! - [`ServiceRegistry`]: service id to provider, init's own services are
//!   [`Provider::Local`]
//! - [`Router`]: lookups waiting for a provider's `DELIVER_EP`, with deadlines
//! - [`DomainTable`]: spawned domains; id 0 is init
//! - [`MemoryService`]: RAM and device-frame grants
//! - [`Init`]: all of the above behind one [`EventLoop`]; every channel init
//!   holds is served by the same message handler
//!
//! # Example
//! ```no_run
//! use tern_init::{Init, InitConfig};
//! use tern_ipc::EventLoop;
//! # fn boot<K: tern_platform::Kernel + 'static>(kernel: K, info: &tern_platform::BootInfo) -> tern_init::Result<()> {
//! let mut init = Init::new(kernel, info, InitConfig::with_autostart(["shell"]))?;
//! let mut ev = EventLoop::new();
//! init.start(&mut ev)?;
//! init.run(&mut ev)?;
//! # Ok(())
//! # }
//! ```

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod config;
pub mod devices;
pub mod domains;
pub mod memory;
pub mod registry;
pub mod router;
mod service;
pub mod spawn;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::time::Duration;

use log::{debug, info, warn};
use tern_cap::{invoke, CSpace, CapError, Capability};
use tern_ipc::{
    Channel, ChannelId, ChannelSet, DomainId, EventLoop, EventSource, Io, IpcError, Message,
    MessageType, ServiceId, Status,
};
use tern_platform::{slots, BootInfo, Kernel, KernelError, ObjType};
use thiserror::Error;

pub use config::{InitConfig, UART_IRQ};
pub use devices::{Led, NullLed, NullUart, Uart};
pub use domains::{DomainRecord, DomainState, DomainTable, INIT_DOMAIN};
pub use memory::MemoryService;
pub use registry::{Provider, ServiceRegistry};
pub use router::{PendingLookup, Router};
pub use spawn::{ChildImage, ImageLoader, InPlaceLoader, ModuleSource};

/// Init error types
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    #[error("not found")]
    NotFound,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("service {0:?} already has a provider")]
    AlreadyRegistered(ServiceId),

    #[error("no domain {0}")]
    NoSuchDomain(DomainId),

    #[error(transparent)]
    Cap(#[from] CapError),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

impl InitError {
    /// Status word reported to the requester
    pub fn status(&self) -> Status {
        match self {
            Self::NotFound | Self::NoSuchDomain(_) => Status::NotFound,
            Self::Unsupported(_) => Status::Unsupported,
            Self::InvalidArgument(_) => Status::InvalidArgument,
            Self::AlreadyRegistered(_) => Status::AlreadyRegistered,
            Self::Cap(e) => match e {
                CapError::OutOfSlots
                | CapError::OutOfMemory { .. }
                | CapError::Kernel(KernelError::NotEnoughMemory) => Status::OutOfMemory,
                CapError::InvalidArgument(_) | CapError::TypeMismatch { .. } => {
                    Status::InvalidArgument
                }
                CapError::Kernel(KernelError::Overlap | KernelError::SlotInUse) => Status::Busy,
                CapError::Kernel(_) => Status::Failed,
            },
            Self::Ipc(e) => match e {
                IpcError::Timeout => Status::Timeout,
                IpcError::BufferFull => Status::Busy,
                IpcError::Malformed | IpcError::MessageTooLong { .. } => Status::InvalidMessage,
                IpcError::Remote(status) => *status,
                IpcError::Cap(c) => Self::Cap(*c).status(),
                _ => Status::Failed,
            },
        }
    }

    /// Init's own dispatcher has been stopped
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Ipc(IpcError::Kernel(KernelError::DispatcherStopped)))
    }
}

pub type Result<T> = core::result::Result<T, InitError>;

/// The root process
pub struct Init<K> {
    pub(crate) kernel: K,
    pub(crate) cspace: CSpace,
    pub(crate) channels: ChannelSet,
    pub(crate) dispatcher: Capability,
    pub(crate) config: InitConfig,
    pub(crate) core_id: usize,
    pub(crate) memory: MemoryService,
    pub(crate) registry: ServiceRegistry,
    pub(crate) router: Router,
    pub(crate) domains: DomainTable,
    pub(crate) modules: Box<dyn ModuleSource>,
    pub(crate) loader: Box<dyn ImageLoader>,
    pub(crate) uart: Box<dyn Uart>,
    pub(crate) led: Box<dyn Led>,
    /// Channels with a `SERIAL_GETCHAR` waiting for input, oldest first
    pub(crate) getchar_waiters: VecDeque<ChannelId>,
    irq_channel: Option<ChannelId>,
}

impl<K: Kernel + 'static> Init<K> {
    /// Take over init's well-known capabilities
    ///
    /// Boot modules are looked up in `info`; the console and LED start out as
    /// [`NullUart`] and [`NullLed`] until replaced.
    pub fn new(kernel: K, info: &BootInfo, config: InitConfig) -> Result<Self> {
        let cspace = CSpace::for_domain(&kernel)?;
        let dispatcher = cspace.well_known(slots::DISPATCHER, ObjType::Dispatcher);
        let core_id = invoke::get_core_id(&kernel, &cspace.well_known(slots::KERNEL, ObjType::Kernel))?;
        let memory = MemoryService::new(&kernel, &cspace)?;
        info!(
            "init on core {}: {} KiB RAM at {:#x}, {} boot modules",
            core_id,
            memory.ram().size() >> 10,
            memory.ram().base(),
            info.modules.len()
        );
        Ok(Self {
            domains: DomainTable::new(config.domain_capacity, core_id),
            kernel,
            cspace,
            channels: ChannelSet::new(),
            dispatcher,
            config,
            core_id,
            memory,
            registry: ServiceRegistry::with_local_services(),
            router: Router::new(),
            modules: Box::new(info.clone()),
            loader: Box::new(InPlaceLoader),
            uart: Box::new(NullUart),
            led: Box::new(NullLed::default()),
            getchar_waiters: VecDeque::new(),
            irq_channel: None,
        })
    }

    pub fn with_uart(mut self, uart: Box<dyn Uart>) -> Self {
        self.uart = uart;
        self
    }

    pub fn with_led(mut self, led: Box<dyn Led>) -> Self {
        self.led = led;
        self
    }

    pub fn with_modules(mut self, modules: Box<dyn ModuleSource>) -> Self {
        self.modules = modules;
        self
    }

    pub fn with_loader(mut self, loader: Box<dyn ImageLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn config(&self) -> &InitConfig {
        &self.config
    }

    pub fn domains(&self) -> &DomainTable {
        &self.domains
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn memory(&self) -> &MemoryService {
        &self.memory
    }

    /// Bind the UART interrupt and spawn the autostart modules
    ///
    /// A module that fails to start is logged and skipped.
    pub fn start(&mut self, ev: &mut EventLoop<Self>) -> Result<()> {
        if let Some(irq) = self.config.uart_irq {
            let id = self.accept_channel()?;
            let table = self.cspace.well_known(slots::IRQ_TABLE, ObjType::IrqTable);
            let local = self.channels.get(id)?.local().ok_or(IpcError::NotConnected)?;
            invoke::irq_table_set(&self.kernel, &table, irq, local)?;
            ev.serve(id, |_, init: &mut Self, _, d| {
                if let Some(cap) = d.cap {
                    init.discard(cap);
                }
                init.pump_serial()
            })?;
            self.irq_channel = Some(id);
            debug!("UART interrupt {} bound to channel {}", irq, id);
        }

        let autostart = self.config.autostart.clone();
        for name in &autostart {
            if let Err(e) = self.spawn(ev, name, self.core_id) {
                warn!("autostart of {} failed: {}", name, e);
            }
        }
        Ok(())
    }

    /// Serve requests until init's dispatcher is stopped
    pub fn run(&mut self, ev: &mut EventLoop<Self>) -> Result<()> {
        loop {
            let wait = self.next_wait();
            let dispatched = if ev.armed() == 0 {
                match self.kernel.wait_for_messages(&[], Some(wait)) {
                    Ok(()) | Err(KernelError::Timeout) => Ok(0),
                    Err(e) => Err(IpcError::from(e)),
                }
            } else {
                ev.dispatch(self, Some(wait))
            };
            match dispatched {
                Ok(_) => {}
                Err(IpcError::Kernel(KernelError::DispatcherStopped)) => {
                    info!("init dispatcher stopped; leaving the event loop");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            self.expire_lookups();
            if let Err(e) = self.pump_serial() {
                warn!("serial input: {}", e);
            }
        }
    }

    fn next_wait(&self) -> Duration {
        let idle = self.config.idle_poll;
        match self.router.next_deadline() {
            Some(deadline) => deadline.saturating_sub(self.kernel.now()).min(idle),
            None => idle,
        }
    }

    /// Answer every lookup past its deadline with `Timeout`
    pub fn expire_lookups(&mut self) -> usize {
        let expired = self.router.expire(self.kernel.now());
        for (token, pending) in &expired {
            info!("lookup {} for {:?} timed out", token.0, pending.service);
            let reply = Message::reply(MessageType::FindService, Status::Timeout);
            if let Err(e) = self.send_on(pending.requester, &reply, None) {
                warn!("cannot report timeout on channel {}: {}", pending.requester, e);
            }
        }
        expired.len()
    }

    /// Answer waiting `SERIAL_GETCHAR`s while the UART has input
    pub fn pump_serial(&mut self) -> tern_ipc::Result<()> {
        while let Some(&chan) = self.getchar_waiters.front() {
            let Some(c) = self.uart.getchar() else {
                break;
            };
            self.getchar_waiters.pop_front();
            let reply = Message::reply(MessageType::SerialGetchar, Status::Ok).with_args(&[c as usize])?;
            match self.send_on(chan, &reply, None) {
                Ok(()) => {}
                Err(IpcError::Kernel(KernelError::DispatcherStopped)) => {
                    return Err(IpcError::Kernel(KernelError::DispatcherStopped));
                }
                Err(e) => warn!("dropping input byte for channel {}: {}", chan, e),
            }
        }
        Ok(())
    }

    /// Arm the common message handler on `chan`
    pub(crate) fn serve(ev: &mut EventLoop<Self>, chan: ChannelId) -> Result<()> {
        ev.serve(chan, |ev, init: &mut Self, chan, d| init.on_message(ev, chan, d))?;
        Ok(())
    }

    pub(crate) fn accept_channel(&mut self) -> Result<ChannelId> {
        let chan = Channel::accept(&self.kernel, &mut self.cspace, &self.dispatcher, self.config.buf_words)?;
        Ok(self.channels.insert(chan))
    }

    pub(crate) fn send_on(
        &self,
        chan: ChannelId,
        msg: &Message,
        cap: Option<&Capability>,
    ) -> tern_ipc::Result<()> {
        self.channels.get(chan)?.send(&self.kernel, msg, cap)
    }

    /// Tear down one of init's channels and everything routed over it
    pub(crate) fn close_channel(&mut self, ev: &mut EventLoop<Self>, chan: ChannelId) {
        ev.deregister(chan);
        for sid in self.registry.remove_channel(chan) {
            info!("{:?} lost its provider", sid);
        }
        let dropped = self.router.drop_requester(chan);
        if dropped > 0 {
            debug!("dropped {} pending lookups of channel {}", dropped, chan);
        }
        self.getchar_waiters.retain(|&c| c != chan);
        if let Ok(channel) = self.channels.remove(chan) {
            if let Err(e) = channel.destroy(&self.kernel, &mut self.cspace) {
                warn!("channel {} teardown: {}", chan, e);
            }
        }
    }

    /// Delete a capability init has no use for
    pub(crate) fn discard(&mut self, cap: Capability) {
        let addr = cap.addr();
        if let Err(e) = self.cspace.delete(&self.kernel, cap) {
            warn!("cannot delete {:?}: {}", addr, e);
        }
    }
}

impl<K: Kernel> EventSource for Init<K> {
    type Kernel = K;

    fn io(&mut self) -> Io<'_, K> {
        Io { kernel: &self.kernel, cspace: &mut self.cspace, channels: &mut self.channels }
    }
}
