//! Typed client calls
//!
//! Every call sends one request and waits for exactly one reply on the same
//! channel. The reply must carry the request's tag with the reply bit set;
//! a status other than `Ok` is returned as [`IpcError::Remote`].

use alloc::vec::Vec;
use core::time::Duration;

use log::trace;
use tern_cap::{CSpace, Capability};
use tern_platform::{Kernel, Word};

use crate::channel::Channel;
use crate::message::{max_str_bytes, Delivery, Message};
use crate::protocol::{DomainId, MessageType, ServiceId, Status};
use crate::{IpcError, Result};

/// Smallest and largest RAM request, as log2 bytes
pub const RAM_BITS_MIN: u8 = 12;
pub const RAM_BITS_MAX: u8 = 28;

/// Pids returned per `GET_ALL_PIDS` reply
pub const PIDS_PER_REPLY: usize = 5;

pub struct RpcClient<'a, K> {
    kernel: &'a K,
    cspace: &'a mut CSpace,
    chan: &'a mut Channel,
    timeout: Option<Duration>,
}

impl<'a, K: Kernel> RpcClient<'a, K> {
    pub fn new(
        kernel: &'a K,
        cspace: &'a mut CSpace,
        chan: &'a mut Channel,
        timeout: Option<Duration>,
    ) -> Self {
        Self { kernel, cspace, chan, timeout }
    }

    /// Send `msg` (with `cap`) and wait for its reply
    pub fn call(&mut self, msg: &Message, cap: Option<&Capability>) -> Result<Delivery> {
        let request = msg.msg_type().ok_or(IpcError::Malformed)?;
        self.chan.send(self.kernel, msg, cap)?;
        let reply = self.chan.recv_blocking(self.kernel, self.cspace, self.timeout)?;
        trace!("reply {:#x} to {:?}", reply.msg.tag(), request);
        if reply.msg.tag() != request.reply_tag() {
            self.discard(reply.cap)?;
            return Err(IpcError::UnexpectedReply {
                expected: request.reply_tag(),
                got: reply.msg.tag(),
            });
        }
        match reply.msg.status() {
            Ok(Status::Ok) => Ok(reply),
            Ok(status) => {
                self.discard(reply.cap)?;
                Err(IpcError::Remote(status))
            }
            Err(e) => {
                self.discard(reply.cap)?;
                Err(e)
            }
        }
    }

    /// Send without waiting for a reply
    pub fn notify(&mut self, msg: &Message) -> Result<()> {
        self.chan.send(self.kernel, msg, None)
    }

    fn discard(&mut self, cap: Option<Capability>) -> Result<()> {
        if let Some(cap) = cap {
            self.cspace.delete(self.kernel, cap)?;
        }
        Ok(())
    }

    fn expect_cap(cap: Option<Capability>) -> Result<Capability> {
        cap.ok_or(IpcError::Malformed)
    }

    pub fn ping(&mut self, value: Word) -> Result<Word> {
        let msg = Message::new(MessageType::Ping).with_args(&[value])?;
        self.call(&msg, None)?.msg.arg(2)
    }

    /// Ask init for a RAM capability of `2^size_bits` bytes
    pub fn get_ram_cap(&mut self, size_bits: u8) -> Result<(Capability, u8)> {
        if !(RAM_BITS_MIN..=RAM_BITS_MAX).contains(&size_bits) {
            return Err(IpcError::Remote(Status::InvalidArgument));
        }
        let msg = Message::new(MessageType::GetRamCap).with_args(&[size_bits as Word])?;
        let reply = self.call(&msg, None)?;
        let bits = reply.msg.arg(2)? as u8;
        Ok((Self::expect_cap(reply.cap)?, bits))
    }

    /// Device frame covering `[paddr, paddr + bytes)`
    pub fn get_device_cap(&mut self, paddr: usize, bytes: usize) -> Result<Capability> {
        let msg = Message::new(MessageType::GetDeviceCap).with_args(&[paddr, bytes])?;
        Self::expect_cap(self.call(&msg, None)?.cap)
    }

    pub fn serial_putchar(&mut self, c: u8) -> Result<()> {
        self.notify(&Message::new(MessageType::SerialPutchar).with_args(&[c as Word])?)
    }

    /// Write `s` in as many messages as it takes
    pub fn serial_putstr(&mut self, s: &[u8]) -> Result<()> {
        for chunk in s.chunks(max_str_bytes(1)) {
            let mut msg = Message::new(MessageType::SerialPutstr);
            msg.push_str(chunk)?;
            self.notify(&msg)?;
        }
        Ok(())
    }

    /// Block until init's UART has a character for domain `domain`
    pub fn serial_getchar(&mut self, domain: DomainId) -> Result<u8> {
        let msg = Message::new(MessageType::SerialGetchar).with_args(&[domain])?;
        Ok(self.call(&msg, None)?.msg.arg(2)? as u8)
    }

    pub fn led_set(&mut self, on: bool) -> Result<()> {
        let msg = Message::new(MessageType::LedSet).with_args(&[on as Word])?;
        self.call(&msg, None).map(drop)
    }

    /// Endpoint of the provider of `service`
    ///
    /// An unregistered service fails at once with `Remote(NotFound)`.
    pub fn find_service(&mut self, service: ServiceId) -> Result<Capability> {
        let msg = Message::new(MessageType::FindService).with_args(&[service.0])?;
        Self::expect_cap(self.call(&msg, None)?.cap)
    }

    /// Register as the provider of `service`
    ///
    /// With `endpoint`, init opens a dedicated channel to it and returns the
    /// endpoint this side must send to; without, the calling channel becomes
    /// the provider channel.
    pub fn register_service(
        &mut self,
        service: ServiceId,
        endpoint: Option<&Capability>,
    ) -> Result<Option<Capability>> {
        let msg = Message::new(MessageType::RegisterService).with_args(&[service.0])?;
        Ok(self.call(&msg, endpoint)?.cap)
    }

    pub fn spawn_domain(&mut self, name: &[u8], core: usize) -> Result<DomainId> {
        let mut msg = Message::new(MessageType::SpawnDomain).with_args(&[core])?;
        msg.push_str(name)?;
        self.call(&msg, None)?.msg.arg(2)
    }

    /// Copy the name of `pid` into `out`, returning its length
    pub fn process_name(&mut self, pid: DomainId, out: &mut [u8]) -> Result<usize> {
        let msg = Message::new(MessageType::GetProcessName).with_args(&[pid])?;
        self.call(&msg, None)?.msg.str_at(2, out)
    }

    /// Every live domain id, fetched a page at a time
    pub fn all_pids(&mut self) -> Result<Vec<DomainId>> {
        let mut pids = Vec::new();
        loop {
            let msg = Message::new(MessageType::GetAllPids).with_args(&[pids.len()])?;
            let reply = self.call(&msg, None)?.msg;
            let total = reply.arg(2)?;
            let count = reply.arg(3)?;
            for i in 0..count {
                pids.push(reply.arg(4 + i)?);
            }
            if count == 0 || pids.len() >= total {
                return Ok(pids);
            }
        }
    }

    pub fn kill_domain(&mut self, pid: DomainId) -> Result<()> {
        let msg = Message::new(MessageType::KillDomain).with_args(&[pid])?;
        self.call(&msg, None).map(drop)
    }

    pub fn open_file(&mut self, path: &[u8]) -> Result<Word> {
        let mut msg = Message::new(MessageType::OpenFile);
        msg.push_str(path)?;
        self.call(&msg, None)?.msg.arg(2)
    }

    /// Read up to `out.len()` bytes at `position`; bytes come back inline,
    /// so one call returns at most a reply's worth
    pub fn read_file(&mut self, fd: Word, position: usize, out: &mut [u8]) -> Result<usize> {
        let want = out.len().min(max_str_bytes(2));
        let msg = Message::new(MessageType::ReadFile).with_args(&[fd, position, want])?;
        self.call(&msg, None)?.msg.str_at(2, out)
    }

    pub fn close_file(&mut self, fd: Word) -> Result<()> {
        let msg = Message::new(MessageType::CloseFile).with_args(&[fd])?;
        self.call(&msg, None).map(drop)
    }
}
