//! LMP channels
//!
//! A channel pairs the endpoint this domain receives on (`local`) with the
//! endpoint it sends to (`remote`). It starts `Uninitialized`, becomes
//! `Accepted` once its local endpoint exists and `Connected` once the remote
//! is known, either out of band or through the `INIT_CONNECT` handshake.
//!
//! Sends never block: a full remote buffer is reported as
//! [`IpcError::BufferFull`] and left to the caller. A capability arriving with
//! a message lands in the channel's receive slot, which is re-supplied lazily
//! before the next receive.

use alloc::vec::Vec;
use core::time::Duration;

use log::{debug, trace};
use tern_cap::{CSpace, Capability, Slot};
use tern_platform::{Kernel, KernelError, ObjType};

use crate::message::{Delivery, Message};
use crate::protocol::MessageType;
use crate::{IpcError, Result};

/// Lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Uninitialized,
    Accepted,
    Connected,
}

/// One bidirectional message channel
#[derive(Debug, Default)]
pub struct Channel {
    local: Option<Capability>,
    remote: Option<Capability>,
    recv_slot: Option<Slot>,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the local endpoint, with a `buf_words` buffer, from `dispatcher`
    pub fn accept<K: Kernel + ?Sized>(
        kernel: &K,
        cspace: &mut CSpace,
        dispatcher: &Capability,
        buf_words: usize,
    ) -> Result<Self> {
        let local = cspace.retype_endpoint(kernel, dispatcher, buf_words)?;
        trace!("channel accepted at {:?}", local.addr());
        Ok(Self { local: Some(local), remote: None, recv_slot: None })
    }

    /// Accept and connect to an endpoint obtained out of band
    pub fn connect_to<K: Kernel + ?Sized>(
        kernel: &K,
        cspace: &mut CSpace,
        dispatcher: &Capability,
        buf_words: usize,
        remote: Capability,
    ) -> Result<Self> {
        let mut chan = Self::accept(kernel, cspace, dispatcher, buf_words)?;
        chan.set_remote(remote)?;
        Ok(chan)
    }

    pub fn state(&self) -> ChannelState {
        match (&self.local, &self.remote) {
            (None, _) => ChannelState::Uninitialized,
            (Some(_), None) => ChannelState::Accepted,
            (Some(_), Some(_)) => ChannelState::Connected,
        }
    }

    pub fn local(&self) -> Option<&Capability> {
        self.local.as_ref()
    }

    pub fn remote(&self) -> Option<&Capability> {
        self.remote.as_ref()
    }

    /// Install the endpoint this channel sends to, returning the previous one
    pub fn set_remote(&mut self, remote: Capability) -> Result<Option<Capability>> {
        if remote.kind() != ObjType::Endpoint {
            return Err(IpcError::Cap(tern_cap::CapError::TypeMismatch {
                expected: ObjType::Endpoint,
                found: remote.kind(),
            }));
        }
        Ok(self.remote.replace(remote))
    }

    /// Send `msg`, optionally transferring a copy of `cap`
    ///
    /// # Errors
    /// `NotConnected` without a remote endpoint; `BufferFull` when the remote
    /// buffer cannot take the message (nothing was sent).
    pub fn send<K: Kernel + ?Sized>(
        &self,
        kernel: &K,
        msg: &Message,
        cap: Option<&Capability>,
    ) -> Result<()> {
        let remote = self.remote.as_ref().ok_or(IpcError::NotConnected)?;
        trace!("send {:#x} ({} words) to {:?}", msg.tag(), msg.len(), remote.addr());
        kernel.lmp_send(remote.addr(), msg.words(), cap.map(Capability::addr))?;
        Ok(())
    }

    /// Take the next message, if one is queued
    pub fn try_recv<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        cspace: &mut CSpace,
    ) -> Result<Option<Delivery>> {
        let local = self.local.as_ref().ok_or(IpcError::NotConnected)?.addr();
        if self.recv_slot.is_none() {
            self.recv_slot = Some(cspace.alloc_slot()?);
        }
        let slot = self.recv_slot.as_ref().map(Slot::addr);
        let Some(received) = kernel.lmp_recv(local, slot)? else {
            return Ok(None);
        };
        let cap = match received.cap {
            Some((_, kind)) => self.recv_slot.take().map(|s| s.into_capability(kind)),
            None => None,
        };
        let msg = match Message::from_words(received.payload()) {
            Ok(msg) => msg,
            Err(e) => {
                if let Some(cap) = cap {
                    cspace.delete(kernel, cap)?;
                }
                return Err(e);
            }
        };
        Ok(Some(Delivery::new(msg, cap)))
    }

    /// Wait for the next message
    ///
    /// `None` waits forever; otherwise `IpcError::Timeout` once `timeout` has
    /// elapsed without a message.
    pub fn recv_blocking<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        cspace: &mut CSpace,
        timeout: Option<Duration>,
    ) -> Result<Delivery> {
        let local = self.local.as_ref().ok_or(IpcError::NotConnected)?.addr();
        let deadline = timeout.map(|t| kernel.now() + t);
        loop {
            if let Some(delivery) = self.try_recv(kernel, cspace)? {
                return Ok(delivery);
            }
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = kernel.now();
                    if now >= deadline {
                        return Err(IpcError::Timeout);
                    }
                    Some(deadline - now)
                }
            };
            kernel.wait_for_messages(&[local], remaining)?;
        }
    }

    /// Initiator side of the connection handshake
    ///
    /// Sends `INIT_CONNECT` carrying the local endpoint and waits for `ACK`.
    pub fn initiate<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        cspace: &mut CSpace,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let local = self.local.as_ref().ok_or(IpcError::NotConnected)?;
        self.send(kernel, &Message::new(MessageType::InitConnect), Some(local))?;
        let reply = self.recv_blocking(kernel, cspace, timeout)?;
        if reply.msg.msg_type() != Some(MessageType::Ack) {
            if let Some(cap) = reply.cap {
                cspace.delete(kernel, cap)?;
            }
            return Err(IpcError::UnexpectedReply {
                expected: MessageType::Ack.tag(),
                got: reply.msg.tag(),
            });
        }
        debug!("channel {:?} connected", self.local.as_ref().map(Capability::addr));
        Ok(())
    }

    /// Acceptor side of the handshake: adopt the initiator's endpoint and ack
    pub fn complete_handshake<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        cspace: &mut CSpace,
        remote: Option<Capability>,
    ) -> Result<()> {
        let remote = remote.ok_or(IpcError::Malformed)?;
        if let Some(old) = self.set_remote(remote)? {
            cspace.delete(kernel, old)?;
        }
        self.send(kernel, &Message::new(MessageType::Ack), None)
    }

    /// Delete both endpoints and give back the receive slot
    pub fn destroy<K: Kernel + ?Sized>(mut self, kernel: &K, cspace: &mut CSpace) -> Result<()> {
        if let Some(slot) = self.recv_slot.take() {
            cspace.free_slot(slot);
        }
        for cap in [self.remote.take(), self.local.take()].into_iter().flatten() {
            match cspace.delete(kernel, cap) {
                Ok(()) | Err(tern_cap::CapError::Kernel(KernelError::InvalidCapability)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Index of a channel in a [`ChannelSet`]
pub type ChannelId = usize;

/// The channels a domain holds, addressed by small integers
///
/// Ids of removed channels are reused, lowest first.
#[derive(Debug, Default)]
pub struct ChannelSet {
    slots: Vec<Option<Channel>>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, chan: Channel) -> ChannelId {
        match self.slots.iter().position(Option::is_none) {
            Some(id) => {
                self.slots[id] = Some(chan);
                id
            }
            None => {
                self.slots.push(Some(chan));
                self.slots.len() - 1
            }
        }
    }

    pub fn get(&self, id: ChannelId) -> Result<&Channel> {
        self.slots.get(id).and_then(Option::as_ref).ok_or(IpcError::UnknownChannel(id))
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        self.slots.get_mut(id).and_then(Option::as_mut).ok_or(IpcError::UnknownChannel(id))
    }

    pub fn remove(&mut self, id: ChannelId) -> Result<Channel> {
        self.slots.get_mut(id).and_then(Option::take).ok_or(IpcError::UnknownChannel(id))
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.get(id).is_ok()
    }

    pub fn ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.slots.iter().enumerate().filter(|(_, c)| c.is_some()).map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
