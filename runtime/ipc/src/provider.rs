//! Service provider side of service discovery
//!
//! A provider registers with init over a dedicated router channel. When a
//! client looks the service up, init sends `REQUEST_EP(corr)` down that
//! channel; the provider accepts a fresh channel for the client and answers
//! `DELIVER_EP(status, corr)` carrying the new channel's endpoint, which init
//! forwards. The client then runs the connection handshake on the new channel
//! and starts sending requests.

use alloc::rc::Rc;
use core::time::Duration;

use log::{debug, info, warn};
use tern_cap::Capability;
use tern_platform::Kernel;

use crate::channel::ChannelId;
use crate::domain::DomainIo;
use crate::event::EventLoop;
use crate::message::{Delivery, Message};
use crate::protocol::{MessageType, ServiceId, Status};
use crate::{IpcError, Result};

/// Application handler: a request on a client channel, answered by the
/// returned reply (if any)
pub type RequestHandler<K> = Rc<dyn Fn(&mut DomainIo<K>, ChannelId, &Message) -> Option<Message>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceProvider {
    pub service: ServiceId,
    /// Channel init routes endpoint requests down
    pub router: ChannelId,
}

impl ServiceProvider {
    /// Register `service` with init over `init_chan` and start answering
    /// endpoint requests
    pub fn start<K: Kernel + 'static>(
        dom: &mut DomainIo<K>,
        ev: &mut EventLoop<DomainIo<K>>,
        service: ServiceId,
        init_chan: ChannelId,
        timeout: Option<Duration>,
        on_request: RequestHandler<K>,
    ) -> Result<Self> {
        let router = dom.accept_channel()?;
        let ours = {
            let local = dom.channels.get(router)?.local().ok_or(IpcError::NotConnected)?;
            dom.cspace.copy(&dom.kernel, local)?
        };
        let registered = dom.rpc(init_chan, timeout)?.register_service(service, Some(&ours));
        dom.cspace.delete(&dom.kernel, ours)?;
        let remote = match registered {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                dom.close(router)?;
                return Err(IpcError::Malformed);
            }
            Err(e) => {
                dom.close(router)?;
                return Err(e);
            }
        };
        dom.channels.get_mut(router)?.set_remote(remote)?;

        ev.serve(router, move |ev, dom: &mut DomainIo<K>, router, d| {
            Self::on_router_message(ev, dom, router, d, &on_request)
        })?;
        info!("providing {:?} on router channel {}", service, router);
        Ok(Self { service, router })
    }

    fn on_router_message<K: Kernel + 'static>(
        ev: &mut EventLoop<DomainIo<K>>,
        dom: &mut DomainIo<K>,
        router: ChannelId,
        d: Delivery,
        on_request: &RequestHandler<K>,
    ) -> Result<()> {
        discard(dom, d.cap)?;
        if d.msg.msg_type() != Some(MessageType::RequestEp) {
            warn!("router channel: unexpected message {:#x}", d.msg.tag());
            return Ok(());
        }
        let corr = d.msg.arg(1)?;
        let client = match dom.accept_channel() {
            Ok(client) => client,
            Err(e) => {
                warn!("cannot accept client channel: {}", e);
                let reply = Message::new(MessageType::DeliverEp)
                    .with_args(&[Status::OutOfMemory.as_word(), corr])?;
                return dom.channels.get(router)?.send(&dom.kernel, &reply, None);
            }
        };
        let reply = Message::new(MessageType::DeliverEp).with_args(&[Status::Ok.as_word(), corr])?;
        let endpoint = dom.channels.get(client)?.local();
        let sent = dom.channels.get(router)?.send(&dom.kernel, &reply, endpoint);
        if let Err(e) = sent {
            dom.close(client)?;
            return Err(e);
        }
        debug!("delivered client channel {} for request {}", client, corr);
        Self::serve_client(ev, client, on_request.clone())
    }

    /// Answer the handshake, `PING` and application requests on `client`
    pub fn serve_client<K: Kernel + 'static>(
        ev: &mut EventLoop<DomainIo<K>>,
        client: ChannelId,
        on_request: RequestHandler<K>,
    ) -> Result<()> {
        ev.serve(client, move |_, dom: &mut DomainIo<K>, id, d| {
            match d.msg.msg_type() {
                Some(MessageType::InitConnect) => {
                    let DomainIo { kernel, cspace, channels, .. } = &mut *dom;
                    channels.get_mut(id)?.complete_handshake(&*kernel, cspace, d.cap)
                }
                Some(MessageType::Ping) => {
                    discard(dom, d.cap)?;
                    let reply = Message::reply(MessageType::Ping, Status::Ok).with_args(&[d.msg.arg(1)?])?;
                    dom.channels.get(id)?.send(&dom.kernel, &reply, None)
                }
                _ => {
                    discard(dom, d.cap)?;
                    match on_request(dom, id, &d.msg) {
                        Some(reply) => dom.channels.get(id)?.send(&dom.kernel, &reply, None),
                        None => Ok(()),
                    }
                }
            }
        })
    }
}

fn discard<K: Kernel>(dom: &mut DomainIo<K>, cap: Option<Capability>) -> Result<()> {
    if let Some(cap) = cap {
        dom.cspace.delete(&dom.kernel, cap)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use tern_kernel_mock::{MockConfig, MockDomain, MockKernel};

    #[test]
    fn test_client_channel_protocol() {
        let (_kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut dom = DomainIo::new(init).unwrap();
        let mut ev = EventLoop::new();
        let served = dom.accept_channel().unwrap();
        let echo: RequestHandler<MockDomain> =
            Rc::new(|_: &mut DomainIo<MockDomain>, _: ChannelId, msg: &Message| {
                let value = msg.arg(1).ok()?;
                Message::reply(MessageType::OpenFile, Status::Ok).with_args(&[value + 1]).ok()
            });
        ServiceProvider::serve_client(&mut ev, served, echo).unwrap();

        let mut client = Channel::accept(&dom.kernel, &mut dom.cspace, &dom.dispatcher, 64).unwrap();
        let target = dom.cspace.copy(&dom.kernel, dom.channels.get(served).unwrap().local().unwrap()).unwrap();
        client.set_remote(target).unwrap();

        client
            .send(&dom.kernel, &Message::new(MessageType::InitConnect), client.local())
            .unwrap();
        assert_eq!(ev.dispatch(&mut dom, Some(Duration::from_millis(10))), Ok(1));
        let ack = client.try_recv(&dom.kernel, &mut dom.cspace).unwrap().unwrap();
        assert_eq!(ack.msg.msg_type(), Some(MessageType::Ack));

        let ping = Message::new(MessageType::Ping).with_args(&[7]).unwrap();
        client.send(&dom.kernel, &ping, None).unwrap();
        ev.dispatch(&mut dom, Some(Duration::from_millis(10))).unwrap();
        let pong = client.try_recv(&dom.kernel, &mut dom.cspace).unwrap().unwrap();
        assert_eq!(pong.msg.arg(2), Ok(7));

        let open = Message::new(MessageType::OpenFile).with_args(&[41]).unwrap();
        client.send(&dom.kernel, &open, None).unwrap();
        ev.dispatch(&mut dom, Some(Duration::from_millis(10))).unwrap();
        let reply = client.try_recv(&dom.kernel, &mut dom.cspace).unwrap().unwrap();
        assert_eq!(reply.msg.arg(2), Ok(42));
    }
}
