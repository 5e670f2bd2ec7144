//! Init's message handler
//!
//! Every channel init holds (domain init channels, router channels to
//! providers, channels accepted for local services) is served by
//! [`Init::on_message`]. Requests that fail are answered with the failure's
//! status; messages that expect no reply are only logged.

use log::{debug, info, warn};
use tern_cap::Capability;
use tern_ipc::message::max_str_bytes;
use tern_ipc::rpc::PIDS_PER_REPLY;
use tern_ipc::{
    Channel, ChannelId, CorrelationId, Delivery, EventLoop, IpcError, Message, MessageType,
    ServiceId, Status, REPLY_BIT,
};
use tern_platform::{Kernel, KernelError, ObjType, Word};

use crate::registry::Provider;
use crate::{Init, InitError, Result};

/// Requests answered with a status even when they fail
fn expects_reply(ty: MessageType) -> bool {
    !matches!(
        ty,
        MessageType::Ack
            | MessageType::SerialPutchar
            | MessageType::SerialPutstr
            | MessageType::DeliverEp
    )
}

/// Requests that may carry a capability init keeps or forwards
fn takes_cap(ty: Option<MessageType>) -> bool {
    matches!(
        ty,
        Some(MessageType::InitConnect | MessageType::RegisterService | MessageType::DeliverEp)
    )
}

impl<K: Kernel + 'static> Init<K> {
    pub(crate) fn on_message(
        &mut self,
        ev: &mut EventLoop<Self>,
        chan: ChannelId,
        d: Delivery,
    ) -> tern_ipc::Result<()> {
        let Delivery { msg, cap } = d;
        let ty = msg.msg_type();
        let cap = match cap {
            Some(cap) if !takes_cap(ty) || msg.is_reply() => {
                self.discard(cap);
                None
            }
            cap => cap,
        };
        if msg.is_reply() {
            warn!("channel {}: stray reply {:#x}", chan, msg.tag());
            return Ok(());
        }

        let outcome = match ty {
            Some(MessageType::InitConnect) => self.on_connect(chan, cap),
            Some(MessageType::Ping) => Self::on_ping(&msg),
            Some(MessageType::GetRamCap) => self.on_get_ram_cap(chan, &msg),
            Some(MessageType::GetDeviceCap) => self.on_get_device_cap(chan, &msg),
            Some(MessageType::SerialPutchar) => self.on_putchar(&msg),
            Some(MessageType::SerialPutstr) => self.on_putstr(&msg),
            Some(MessageType::SerialGetchar) => self.on_getchar(chan, &msg),
            Some(MessageType::LedSet) => self.on_led_set(&msg),
            Some(MessageType::RegisterService) => self.on_register(ev, chan, &msg, cap),
            Some(MessageType::FindService) => self.on_find(ev, chan, &msg),
            Some(MessageType::DeliverEp) => self.on_deliver(&msg, cap),
            Some(MessageType::SpawnDomain) => self.on_spawn(ev, &msg),
            Some(MessageType::GetProcessName) => self.on_process_name(&msg),
            Some(MessageType::GetAllPids) => self.on_all_pids(&msg),
            Some(MessageType::KillDomain) => self.on_kill(ev, chan, &msg),
            Some(MessageType::OpenFile | MessageType::ReadFile | MessageType::CloseFile) => {
                Err(InitError::Unsupported("init serves no files"))
            }
            Some(MessageType::Ack) => {
                debug!("channel {}: stray ACK", chan);
                Ok(None)
            }
            Some(MessageType::RequestEp) | None => {
                warn!("channel {}: unknown message {:#x}", chan, msg.tag());
                Message::from_words(&[msg.tag() | REPLY_BIT, Status::InvalidMessage.as_word()])
                    .map(Some)
                    .map_err(InitError::from)
            }
        };

        match outcome {
            Ok(Some(reply)) => settle(self.send_on(chan, &reply, None)),
            Ok(None) => Ok(()),
            Err(e) if e.is_stopped() => Err(IpcError::Kernel(KernelError::DispatcherStopped)),
            Err(e) => match ty.filter(|t| expects_reply(*t)) {
                Some(t) => {
                    debug!("channel {}: {:?} failed: {}", chan, t, e);
                    settle(self.send_on(chan, &Message::reply(t, e.status()), None))
                }
                None => {
                    warn!("channel {}: {:#x} failed: {}", chan, msg.tag(), e);
                    Ok(())
                }
            },
        }
    }

    fn on_connect(&mut self, chan: ChannelId, cap: Option<Capability>) -> Result<Option<Message>> {
        let Self { kernel, cspace, channels, .. } = self;
        channels.get_mut(chan)?.complete_handshake(&*kernel, cspace, cap)?;
        debug!("channel {} connected", chan);
        Ok(None)
    }

    fn on_ping(msg: &Message) -> Result<Option<Message>> {
        let reply = Message::reply(MessageType::Ping, Status::Ok).with_args(&[msg.arg(1)?])?;
        Ok(Some(reply))
    }

    fn on_get_ram_cap(&mut self, chan: ChannelId, msg: &Message) -> Result<Option<Message>> {
        let bits = u8::try_from(msg.arg(1)?)
            .map_err(|_| InitError::InvalidArgument("RAM size bits out of range"))?;
        let cap = self.memory.grant_ram(&self.kernel, &mut self.cspace, bits)?;
        let reply = Message::reply(MessageType::GetRamCap, Status::Ok).with_args(&[bits as Word])?;
        let sent = self.send_on(chan, &reply, Some(&cap));
        // The client holds the only copy from here on
        self.discard(cap);
        sent?;
        debug!("granted 2^{} bytes of RAM on channel {}", bits, chan);
        Ok(None)
    }

    fn on_get_device_cap(&mut self, chan: ChannelId, msg: &Message) -> Result<Option<Message>> {
        let (paddr, bytes) = (msg.arg(1)?, msg.arg(2)?);
        let cap = self.memory.grant_device(&self.kernel, &mut self.cspace, paddr, bytes)?;
        let sent = self.send_on(chan, &Message::reply(MessageType::GetDeviceCap, Status::Ok), Some(&cap));
        self.discard(cap);
        sent?;
        debug!("granted device frame {:#x}+{:#x} on channel {}", paddr, bytes, chan);
        Ok(None)
    }

    fn on_putchar(&mut self, msg: &Message) -> Result<Option<Message>> {
        self.uart.putchar(msg.arg(1)? as u8);
        Ok(None)
    }

    fn on_putstr(&mut self, msg: &Message) -> Result<Option<Message>> {
        let mut buf = [0u8; max_str_bytes(1)];
        let n = msg.str_at(1, &mut buf)?;
        self.uart.write(&buf[..n]);
        Ok(None)
    }

    fn on_getchar(&mut self, chan: ChannelId, msg: &Message) -> Result<Option<Message>> {
        let domain = msg.arg(1)?;
        if let Some(c) = self.uart.getchar() {
            let reply = Message::reply(MessageType::SerialGetchar, Status::Ok).with_args(&[c as Word])?;
            return Ok(Some(reply));
        }
        debug!("domain {} waits for serial input on channel {}", domain, chan);
        self.getchar_waiters.push_back(chan);
        Ok(None)
    }

    fn on_led_set(&mut self, msg: &Message) -> Result<Option<Message>> {
        self.led.set(msg.arg(1)? != 0);
        Ok(Some(Message::reply(MessageType::LedSet, Status::Ok)))
    }

    fn on_register(
        &mut self,
        ev: &mut EventLoop<Self>,
        chan: ChannelId,
        msg: &Message,
        cap: Option<Capability>,
    ) -> Result<Option<Message>> {
        let checked = msg.arg(1).map_err(InitError::from).and_then(|sid| {
            let sid = ServiceId(sid);
            if !sid.is_valid() {
                Err(InitError::InvalidArgument("service id out of range"))
            } else if self.registry.lookup(sid).is_some() {
                Err(InitError::AlreadyRegistered(sid))
            } else {
                Ok(sid)
            }
        });
        let sid = match (checked, &cap) {
            (Ok(_), Some(c)) if c.kind() != ObjType::Endpoint => {
                Err(InitError::InvalidArgument("provider capability is not an endpoint"))
            }
            (checked, _) => checked,
        };
        let sid = match sid {
            Ok(sid) => sid,
            Err(e) => {
                if let Some(cap) = cap {
                    self.discard(cap);
                }
                return Err(e);
            }
        };

        let Some(remote) = cap else {
            self.registry.register(sid, Provider::Channel(chan))?;
            info!("{:?} provided over channel {}", sid, chan);
            return Ok(Some(Message::reply(MessageType::RegisterService, Status::Ok)));
        };

        let mut router = match Channel::accept(&self.kernel, &mut self.cspace, &self.dispatcher, self.config.buf_words) {
            Ok(router) => router,
            Err(e) => {
                self.discard(remote);
                return Err(e.into());
            }
        };
        router.set_remote(remote)?;
        let id = self.channels.insert(router);
        self.registry.register(sid, Provider::Channel(id))?;
        Self::serve(ev, id)?;
        self.note_owned(chan, id);

        let local = self.channels.get(id)?.local();
        self.send_on(chan, &Message::reply(MessageType::RegisterService, Status::Ok), local)?;
        info!("{:?} provided over router channel {}", sid, id);
        Ok(None)
    }

    fn on_find(&mut self, ev: &mut EventLoop<Self>, chan: ChannelId, msg: &Message) -> Result<Option<Message>> {
        let sid = ServiceId(msg.arg(1)?);
        match self.registry.lookup(sid) {
            None => {
                debug!("lookup of unregistered {:?}", sid);
                Err(InitError::NotFound)
            }
            Some(Provider::Local) => {
                let id = self.accept_channel()?;
                Self::serve(ev, id)?;
                self.note_owned(chan, id);
                let local = self.channels.get(id)?.local();
                self.send_on(chan, &Message::reply(MessageType::FindService, Status::Ok), local)?;
                debug!("{:?} served locally on channel {}", sid, id);
                Ok(None)
            }
            Some(Provider::Channel(provider)) => {
                let deadline = self.kernel.now() + self.config.lookup_timeout;
                let token = self.router.begin(chan, sid, deadline);
                let request = Message::new(MessageType::RequestEp).with_args(&[token.0])?;
                if let Err(e) = self.send_on(provider, &request, None) {
                    self.router.complete(token);
                    return Err(e.into());
                }
                debug!("lookup {} of {:?} routed to channel {}", token.0, sid, provider);
                Ok(None)
            }
        }
    }

    fn on_deliver(&mut self, msg: &Message, cap: Option<Capability>) -> Result<Option<Message>> {
        let parsed = msg.arg(1).and_then(|status| Ok((Status::from_word(status), msg.arg(2)?)));
        let (status, token) = match parsed {
            Ok((status, token)) => (status, CorrelationId(token)),
            Err(e) => {
                if let Some(cap) = cap {
                    self.discard(cap);
                }
                return Err(e.into());
            }
        };
        let Some(pending) = self.router.complete(token) else {
            warn!("DELIVER_EP for unknown lookup {}; dropped", token.0);
            if let Some(cap) = cap {
                self.discard(cap);
            }
            return Ok(None);
        };
        let forwarded = if status.is_ok() { cap.as_ref() } else { None };
        let sent = self.send_on(
            pending.requester,
            &Message::reply(MessageType::FindService, status),
            forwarded,
        );
        if let Some(cap) = cap {
            self.discard(cap);
        }
        sent?;
        debug!("lookup {} of {:?} answered {:?}", token.0, pending.service, status);
        Ok(None)
    }

    fn on_spawn(&mut self, ev: &mut EventLoop<Self>, msg: &Message) -> Result<Option<Message>> {
        let core = msg.arg(1)?;
        let mut buf = [0u8; max_str_bytes(2)];
        let n = msg.str_at(2, &mut buf)?;
        let name = core::str::from_utf8(&buf[..n])
            .map_err(|_| InitError::InvalidArgument("module name is not UTF-8"))?;
        let pid = self.spawn(ev, name, core)?;
        Ok(Some(Message::reply(MessageType::SpawnDomain, Status::Ok).with_args(&[pid])?))
    }

    fn on_process_name(&mut self, msg: &Message) -> Result<Option<Message>> {
        let pid = msg.arg(1)?;
        let rec = self.domains.get(pid).ok_or(InitError::NoSuchDomain(pid))?;
        let name = rec.name.as_bytes();
        let mut reply = Message::reply(MessageType::GetProcessName, Status::Ok);
        reply.push_str(&name[..name.len().min(max_str_bytes(2))])?;
        Ok(Some(reply))
    }

    fn on_all_pids(&mut self, msg: &Message) -> Result<Option<Message>> {
        let offset = msg.arg(1)?;
        let total = self.domains.len();
        let page: alloc::vec::Vec<Word> = self.domains.ids().skip(offset).take(PIDS_PER_REPLY).collect();
        let mut reply = Message::reply(MessageType::GetAllPids, Status::Ok).with_args(&[total, page.len()])?;
        for pid in page {
            reply.push(pid)?;
        }
        Ok(Some(reply))
    }

    fn on_kill(&mut self, ev: &mut EventLoop<Self>, chan: ChannelId, msg: &Message) -> Result<Option<Message>> {
        let pid = msg.arg(1)?;
        self.kill(ev, pid)?;
        if !self.channels.contains(chan) {
            // The domain killed itself
            return Ok(None);
        }
        Ok(Some(Message::reply(MessageType::KillDomain, Status::Ok)))
    }
}

/// A failed send is logged; only a stopped dispatcher is passed on
fn settle(sent: tern_ipc::Result<()>) -> tern_ipc::Result<()> {
    match sent {
        Err(IpcError::Kernel(KernelError::DispatcherStopped)) => {
            Err(IpcError::Kernel(KernelError::DispatcherStopped))
        }
        Err(e) => {
            warn!("reply not delivered: {}", e);
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use tern_cap::invoke;
    use tern_kernel_mock::{MockConfig, MockDomain, MockKernel};
    use tern_platform::BootInfo;

    use crate::InitConfig;

    const TICK: Option<Duration> = Some(Duration::from_millis(20));

    /// Init plus a client channel inside init's own domain, so one thread
    /// can drive both ends
    struct Fixture {
        _kernel: MockKernel,
        init: Init<MockDomain>,
        ev: EventLoop<Init<MockDomain>>,
        client: Channel,
        /// Init's side of the client's channel
        served: ChannelId,
    }

    impl Fixture {
        fn new(config: InitConfig) -> Self {
            let (kernel, dom, info) = MockKernel::boot(MockConfig::default());
            Self::with(kernel, dom, &info, config)
        }

        fn with(kernel: MockKernel, dom: MockDomain, info: &BootInfo, config: InitConfig) -> Self {
            let mut init = Init::new(dom, info, config).unwrap();
            let mut ev = EventLoop::new();
            let served = init.accept_channel().unwrap();
            Init::serve(&mut ev, served).unwrap();
            let mut client = Channel::accept(&init.kernel, &mut init.cspace, &init.dispatcher, 64).unwrap();
            let target = {
                let local = init.channels.get(served).unwrap().local().unwrap();
                init.cspace.copy(&init.kernel, local).unwrap()
            };
            client.set_remote(target).unwrap();
            let mut fx = Self { _kernel: kernel, init, ev, client, served };
            let ack = fx.call(&Message::new(MessageType::InitConnect), true);
            assert_eq!(ack.msg.msg_type(), Some(MessageType::Ack));
            fx
        }

        fn send(&mut self, msg: &Message, with_local: bool) {
            let cap = if with_local { self.client.local() } else { None };
            self.client.send(&self.init.kernel, msg, cap).unwrap();
        }

        fn step(&mut self) {
            self.ev.dispatch(&mut self.init, TICK).unwrap();
        }

        fn recv(&mut self) -> Option<Delivery> {
            self.client.try_recv(&self.init.kernel, &mut self.init.cspace).unwrap()
        }

        /// Send and step init until the reply shows up
        fn call(&mut self, msg: &Message, with_local: bool) -> Delivery {
            self.send(msg, with_local);
            for _ in 0..8 {
                self.step();
                if let Some(reply) = self.recv() {
                    return reply;
                }
            }
            panic!("no reply to {:#x}", msg.tag());
        }
    }

    fn fixture() -> Fixture {
        Fixture::new(InitConfig { uart_irq: None, ..InitConfig::default() })
    }

    #[test]
    fn test_ping_echo() {
        let mut fx = fixture();
        let reply = fx.call(&Message::new(MessageType::Ping).with_args(&[7]).unwrap(), false);
        assert_eq!(reply.msg.tag(), MessageType::Ping.reply_tag());
        assert_eq!(reply.msg.status(), Ok(Status::Ok));
        assert_eq!(reply.msg.arg(2), Ok(7));
    }

    #[test]
    fn test_ram_grant_drops_init_copy() {
        let mut fx = fixture();
        let reply = fx.call(&Message::new(MessageType::GetRamCap).with_args(&[12]).unwrap(), false);
        assert_eq!(reply.msg.status(), Ok(Status::Ok));
        assert_eq!(reply.msg.arg(2), Ok(12));
        let cap = reply.cap.unwrap();
        assert_eq!(cap.kind(), ObjType::Ram);
        assert!(invoke::identify(&fx.init.kernel, &cap).unwrap().bytes >= 4096);

        let bad = fx.call(&Message::new(MessageType::GetRamCap).with_args(&[40]).unwrap(), false);
        assert_eq!(bad.msg.status(), Ok(Status::InvalidArgument));
        assert!(bad.cap.is_none());
    }

    #[test]
    fn test_unregistered_lookup_fails_at_once() {
        let mut fx = fixture();
        let reply = fx.call(&Message::new(MessageType::FindService).with_args(&[ServiceId::TEST.0]).unwrap(), false);
        assert_eq!(reply.msg.status(), Ok(Status::NotFound));
        assert!(reply.cap.is_none());
        assert!(fx.init.router().is_empty());
    }

    #[test]
    fn test_local_lookup_hands_out_channel() {
        let mut fx = fixture();
        let reply = fx.call(&Message::new(MessageType::FindService).with_args(&[ServiceId::RAM.0]).unwrap(), false);
        assert_eq!(reply.msg.status(), Ok(Status::Ok));
        let ep = reply.cap.unwrap();
        assert_eq!(ep.kind(), ObjType::Endpoint);
        // Served alongside the client's own channel
        assert_eq!(fx.ev.armed(), 2);
    }

    #[test]
    fn test_register_without_cap_then_route() {
        let mut fx = fixture();
        let reply = fx.call(&Message::new(MessageType::RegisterService).with_args(&[ServiceId::TEST.0]).unwrap(), false);
        assert_eq!(reply.msg.status(), Ok(Status::Ok));
        assert_eq!(fx.init.registry().lookup(ServiceId::TEST), Some(Provider::Channel(fx.served)));

        let again = fx.call(&Message::new(MessageType::RegisterService).with_args(&[ServiceId::TEST.0]).unwrap(), false);
        assert_eq!(again.msg.status(), Ok(Status::AlreadyRegistered));

        // The lookup is routed back to us as the provider
        fx.send(&Message::new(MessageType::FindService).with_args(&[ServiceId::TEST.0]).unwrap(), false);
        fx.step();
        let request = fx.recv().unwrap();
        assert_eq!(request.msg.msg_type(), Some(MessageType::RequestEp));
        assert!(!request.msg.is_reply());
        let token = request.msg.arg(1).unwrap();
        assert_eq!(fx.init.router().len(), 1);

        // Answer with our own endpoint; init forwards it as the lookup reply
        let deliver = Message::new(MessageType::DeliverEp).with_args(&[Status::Ok.as_word(), token]).unwrap();
        fx.send(&deliver, true);
        fx.step();
        let found = fx.recv().unwrap();
        assert_eq!(found.msg.tag(), MessageType::FindService.reply_tag());
        assert_eq!(found.msg.status(), Ok(Status::Ok));
        assert_eq!(found.cap.map(|c| c.kind()), Some(ObjType::Endpoint));
        assert!(fx.init.router().is_empty());

        // A repeated delivery has no lookup to answer
        fx.send(&deliver, false);
        fx.step();
        assert!(fx.recv().is_none());
    }

    #[test]
    fn test_lookup_expires() {
        let mut fx = Fixture::new(InitConfig {
            uart_irq: None,
            lookup_timeout: Duration::from_millis(10),
            ..InitConfig::default()
        });
        fx.call(&Message::new(MessageType::RegisterService).with_args(&[ServiceId::TEST.0]).unwrap(), false);
        fx.send(&Message::new(MessageType::FindService).with_args(&[ServiceId::TEST.0]).unwrap(), false);
        fx.step();
        let request = fx.recv().unwrap();
        assert_eq!(request.msg.msg_type(), Some(MessageType::RequestEp));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(fx.init.expire_lookups(), 1);
        let timeout = fx.recv().unwrap();
        assert_eq!(timeout.msg.tag(), MessageType::FindService.reply_tag());
        assert_eq!(timeout.msg.status(), Ok(Status::Timeout));
    }

    #[test]
    fn test_process_queries() {
        let mut fx = fixture();
        let reply = fx.call(&Message::new(MessageType::GetAllPids).with_args(&[0]).unwrap(), false);
        assert_eq!(reply.msg.arg(2), Ok(1));
        assert_eq!(reply.msg.arg(3), Ok(1));
        assert_eq!(reply.msg.arg(4), Ok(0));

        let reply = fx.call(&Message::new(MessageType::GetProcessName).with_args(&[0]).unwrap(), false);
        let mut name = [0u8; 16];
        let n = reply.msg.str_at(2, &mut name).unwrap();
        assert_eq!(&name[..n], b"init");

        let missing = fx.call(&Message::new(MessageType::GetProcessName).with_args(&[9]).unwrap(), false);
        assert_eq!(missing.msg.status(), Ok(Status::NotFound));

        let kill = fx.call(&Message::new(MessageType::KillDomain).with_args(&[0]).unwrap(), false);
        assert_eq!(kill.msg.status(), Ok(Status::InvalidArgument));
    }

    #[test]
    fn test_unknown_and_file_messages() {
        let mut fx = fixture();
        let reply = fx.call(&Message::from_words(&[0x77]).unwrap(), false);
        assert_eq!(reply.msg.tag(), 0x77 | REPLY_BIT);
        assert_eq!(reply.msg.status(), Ok(Status::InvalidMessage));

        let reply = fx.call(&Message::new(MessageType::CloseFile).with_args(&[1]).unwrap(), false);
        assert_eq!(reply.msg.status(), Ok(Status::Unsupported));

        // Malformed request: the argument is missing
        let reply = fx.call(&Message::new(MessageType::Ping), false);
        assert_eq!(reply.msg.status(), Ok(Status::InvalidMessage));
    }

    #[test]
    fn test_serial_and_led_without_reply() {
        let mut fx = fixture();
        fx.send(&Message::new(MessageType::SerialPutchar).with_args(&[b'x' as Word]).unwrap(), false);
        let mut putstr = Message::new(MessageType::SerialPutstr);
        putstr.push_str(b"hello").unwrap();
        fx.send(&putstr, false);
        fx.step();
        assert!(fx.recv().is_none());

        let reply = fx.call(&Message::new(MessageType::LedSet).with_args(&[1]).unwrap(), false);
        assert_eq!(reply.msg.status(), Ok(Status::Ok));

        // Null UART has no input: the request waits
        fx.send(&Message::new(MessageType::SerialGetchar).with_args(&[0]).unwrap(), false);
        fx.step();
        assert!(fx.recv().is_none());
        assert_eq!(fx.init.getchar_waiters.len(), 1);
    }
}
