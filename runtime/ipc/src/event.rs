//! Cooperative per-domain event loop
//!
//! Handlers are armed per channel. A one-shot handler ([`EventLoop::register_recv`])
//! runs for the next message only and may re-arm itself; a persistent one
//! ([`EventLoop::serve`]) stays armed until deregistered. Handlers run to
//! completion, one at a time, with mutable access to the loop and to the
//! domain context `C`.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::time::Duration;

use log::{trace, warn};
use tern_cap::CSpace;
use tern_platform::{CapAddr, Kernel, KernelError};

use crate::channel::{ChannelId, ChannelSet};
use crate::message::Delivery;
use crate::{IpcError, Result};

/// Borrowed view of the pieces the loop needs from a domain
pub struct Io<'a, K> {
    pub kernel: &'a K,
    pub cspace: &'a mut CSpace,
    pub channels: &'a mut ChannelSet,
}

/// Domain state an [`EventLoop`] can drive
pub trait EventSource {
    type Kernel: Kernel;

    fn io(&mut self) -> Io<'_, Self::Kernel>;
}

type OnceFn<C> = Box<dyn FnOnce(&mut EventLoop<C>, &mut C, ChannelId, Delivery) -> Result<()>>;
type ServeFn<C> = Box<dyn FnMut(&mut EventLoop<C>, &mut C, ChannelId, Delivery) -> Result<()>>;

enum Handler<C> {
    Once(OnceFn<C>),
    Serve(ServeFn<C>),
}

/// Receive handlers keyed by channel
pub struct EventLoop<C> {
    handlers: BTreeMap<ChannelId, Handler<C>>,
    running: Option<ChannelId>,
    cancelled: bool,
}

impl<C> Default for EventLoop<C> {
    fn default() -> Self {
        Self { handlers: BTreeMap::new(), running: None, cancelled: false }
    }
}

impl<C: EventSource> EventLoop<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `handler` the next time a message arrives on `chan`
    pub fn register_recv<F>(&mut self, chan: ChannelId, handler: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop<C>, &mut C, ChannelId, Delivery) -> Result<()> + 'static,
    {
        self.arm(chan, Handler::Once(Box::new(handler)))
    }

    /// Run `handler` for every message on `chan` until deregistered
    pub fn serve<F>(&mut self, chan: ChannelId, handler: F) -> Result<()>
    where
        F: FnMut(&mut EventLoop<C>, &mut C, ChannelId, Delivery) -> Result<()> + 'static,
    {
        self.arm(chan, Handler::Serve(Box::new(handler)))
    }

    fn arm(&mut self, chan: ChannelId, handler: Handler<C>) -> Result<()> {
        if self.handlers.contains_key(&chan) {
            return Err(IpcError::AlreadyRegistered(chan));
        }
        self.handlers.insert(chan, handler);
        Ok(())
    }

    /// Disarm `chan`; returns whether a handler was armed
    pub fn deregister(&mut self, chan: ChannelId) -> bool {
        if self.handlers.remove(&chan).is_some() {
            return true;
        }
        if self.running == Some(chan) {
            self.cancelled = true;
            return true;
        }
        false
    }

    pub fn is_armed(&self, chan: ChannelId) -> bool {
        self.handlers.contains_key(&chan) || (self.running == Some(chan) && !self.cancelled)
    }

    pub fn armed(&self) -> usize {
        self.handlers.len()
    }

    /// Run every handler whose channel has a message, then, if none ran,
    /// wait up to `timeout` and try once more
    ///
    /// Returns the number of handlers run. A receive that fails transiently
    /// leaves the handler armed; a handler's own error is logged. Only a
    /// stopped dispatcher ends the loop with an error.
    pub fn dispatch(&mut self, ctx: &mut C, timeout: Option<Duration>) -> Result<usize> {
        let ran = self.poll(ctx)?;
        if ran > 0 {
            return Ok(ran);
        }
        let eps: Vec<CapAddr> = {
            let io = ctx.io();
            self.handlers
                .keys()
                .filter_map(|&id| io.channels.get(id).ok()?.local().map(|c| c.addr()))
                .collect()
        };
        if eps.is_empty() {
            return Ok(0);
        }
        match ctx.io().kernel.wait_for_messages(&eps, timeout) {
            Ok(()) => {}
            Err(KernelError::Timeout) => return Ok(0),
            Err(e) => return Err(e.into()),
        }
        self.poll(ctx)
    }

    /// One pass over the armed channels without waiting
    pub fn poll(&mut self, ctx: &mut C) -> Result<usize> {
        let armed: Vec<ChannelId> = self.handlers.keys().copied().collect();
        let mut ran = 0;
        for id in armed {
            if !self.handlers.contains_key(&id) {
                continue;
            }
            let received = {
                let io = ctx.io();
                match io.channels.get_mut(id) {
                    Ok(chan) => chan.try_recv(io.kernel, io.cspace),
                    Err(e) => Err(e),
                }
            };
            let delivery = match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(IpcError::UnknownChannel(id)) => {
                    warn!("channel {} vanished; dropping its handler", id);
                    self.handlers.remove(&id);
                    continue;
                }
                Err(e) if e.is_transient() => {
                    trace!("channel {}: {}; staying armed", id, e);
                    continue;
                }
                Err(IpcError::Kernel(KernelError::DispatcherStopped)) => {
                    return Err(IpcError::Kernel(KernelError::DispatcherStopped));
                }
                Err(e) => {
                    warn!("channel {}: receive failed: {}", id, e);
                    continue;
                }
            };
            let Some(handler) = self.handlers.remove(&id) else {
                continue;
            };
            ran += 1;
            self.running = Some(id);
            self.cancelled = false;
            let outcome = match handler {
                Handler::Once(f) => f(self, ctx, id, delivery),
                Handler::Serve(mut f) => {
                    let outcome = f(self, ctx, id, delivery);
                    if !self.cancelled
                        && !self.handlers.contains_key(&id)
                        && ctx.io().channels.contains(id)
                    {
                        self.handlers.insert(id, Handler::Serve(f));
                    }
                    outcome
                }
            };
            self.running = None;
            match outcome {
                Ok(()) => {}
                Err(IpcError::Kernel(KernelError::DispatcherStopped)) => {
                    return Err(IpcError::Kernel(KernelError::DispatcherStopped));
                }
                Err(e) => warn!("channel {}: handler failed: {}", id, e),
            }
        }
        Ok(ran)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::message::Message;
    use crate::protocol::MessageType;
    use alloc::rc::Rc;
    use core::cell::Cell;
    use tern_cap::Capability;
    use tern_kernel_mock::{MockConfig, MockDomain, MockKernel};
    use tern_platform::{slots, ObjType, DEFAULT_ENDPOINT_BUF_WORDS};

    struct Ctx {
        kernel: MockDomain,
        cspace: CSpace,
        channels: ChannelSet,
        seen: Vec<usize>,
    }

    impl EventSource for Ctx {
        type Kernel = MockDomain;

        fn io(&mut self) -> Io<'_, MockDomain> {
            Io { kernel: &self.kernel, cspace: &mut self.cspace, channels: &mut self.channels }
        }
    }

    /// A context with one channel connected to itself
    fn looped() -> (MockKernel, Ctx, ChannelId) {
        let (kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let disp: Capability = cspace.well_known(slots::DISPATCHER, ObjType::Dispatcher);
        let mut chan = Channel::accept(&init, &mut cspace, &disp, DEFAULT_ENDPOINT_BUF_WORDS).unwrap();
        let ep = cspace.copy(&init, chan.local().unwrap()).unwrap();
        chan.set_remote(ep).unwrap();
        let mut channels = ChannelSet::new();
        let id = channels.insert(chan);
        (kernel, Ctx { kernel: init, cspace, channels, seen: Vec::new() }, id)
    }

    fn send(ctx: &Ctx, id: ChannelId, value: usize) {
        let msg = Message::new(MessageType::Ping).with_args(&[value]).unwrap();
        ctx.channels.get(id).unwrap().send(&ctx.kernel, &msg, None).unwrap();
    }

    #[test]
    fn test_one_shot_runs_once() {
        let (_kernel, mut ctx, id) = looped();
        let mut ev = EventLoop::new();
        ev.register_recv(id, |_, ctx: &mut Ctx, _, d| {
            ctx.seen.push(d.msg.arg(1)?);
            Ok(())
        })
        .unwrap();
        send(&ctx, id, 1);
        send(&ctx, id, 2);
        assert_eq!(ev.dispatch(&mut ctx, Some(Duration::from_millis(10))), Ok(1));
        assert!(!ev.is_armed(id));
        assert_eq!(ev.dispatch(&mut ctx, Some(Duration::from_millis(10))), Ok(0));
        assert_eq!(ctx.seen, vec![1]);
    }

    #[test]
    fn test_one_shot_can_rearm() {
        fn handler(ev: &mut EventLoop<Ctx>, ctx: &mut Ctx, id: ChannelId, d: Delivery) -> Result<()> {
            ctx.seen.push(d.msg.arg(1)?);
            ev.register_recv(id, handler)
        }
        let (_kernel, mut ctx, id) = looped();
        let mut ev = EventLoop::new();
        ev.register_recv(id, handler).unwrap();
        for v in 0..3 {
            send(&ctx, id, v);
        }
        for _ in 0..3 {
            ev.dispatch(&mut ctx, None).unwrap();
        }
        assert_eq!(ctx.seen, vec![0, 1, 2]);
        assert!(ev.is_armed(id));
    }

    #[test]
    fn test_serve_and_cancel_from_handler() {
        let (_kernel, mut ctx, id) = looped();
        let mut ev = EventLoop::new();
        ev.serve(id, |ev, ctx: &mut Ctx, id, d| {
            let v = d.msg.arg(1)?;
            ctx.seen.push(v);
            if v == 2 {
                ev.deregister(id);
            }
            Ok(())
        })
        .unwrap();
        for v in 1..=3 {
            send(&ctx, id, v);
        }
        for _ in 0..3 {
            ev.dispatch(&mut ctx, Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(ctx.seen, vec![1, 2]);
        assert!(!ev.is_armed(id));
    }

    #[test]
    fn test_handler_error_keeps_serving() {
        let (_kernel, mut ctx, id) = looped();
        let mut ev = EventLoop::new();
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        ev.serve(id, move |_, _: &mut Ctx, _, _| {
            counter.set(counter.get() + 1);
            Err(IpcError::Malformed)
        })
        .unwrap();
        send(&ctx, id, 1);
        send(&ctx, id, 2);
        ev.dispatch(&mut ctx, None).unwrap();
        ev.dispatch(&mut ctx, None).unwrap();
        assert_eq!(calls.get(), 2);
        assert!(ev.is_armed(id));
    }

    #[test]
    fn test_double_registration_rejected() {
        let (_kernel, _ctx, id) = looped();
        let mut ev: EventLoop<Ctx> = EventLoop::new();
        ev.serve(id, |_, _, _, _| Ok(())).unwrap();
        assert_eq!(
            ev.register_recv(id, |_, _, _, _| Ok(())).err(),
            Some(IpcError::AlreadyRegistered(id))
        );
    }

    #[test]
    fn test_stopped_dispatcher_ends_loop() {
        let (kernel, mut ctx, id) = looped();
        let mut ev = EventLoop::new();
        ev.serve(id, |_, _: &mut Ctx, _, _| Ok(())).unwrap();
        kernel.shutdown();
        assert_eq!(
            ev.dispatch(&mut ctx, None),
            Err(IpcError::Kernel(KernelError::DispatcherStopped))
        );
    }
}
