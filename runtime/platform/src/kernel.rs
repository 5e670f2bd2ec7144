//! The kernel entry points a domain can reach
//!
//! Capability invocations go through [`Kernel::syscall`]. The lightweight
//! message transport (LMP) has its own entry points because a send may carry a
//! capability and a receive may deposit one.

use core::time::Duration;

use crate::abi::{CNodeId, CapAddr, KernelError, ObjType, Word, LMP_MSG_WORDS};
use crate::invocation::{Invocation, SysRet, TrapFrame};

/// A message taken off an endpoint buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LmpRecv {
    pub words: [Word; LMP_MSG_WORDS],
    pub len: usize,
    /// Slot and type of the transferred capability, if one travelled
    pub cap: Option<(CapAddr, ObjType)>,
}

impl LmpRecv {
    pub fn payload(&self) -> &[Word] {
        &self.words[..self.len]
    }
}

/// Kernel interface seen by one domain
pub trait Kernel {
    /// Perform one capability invocation trap
    fn syscall(&self, frame: &TrapFrame) -> SysRet;

    /// Append a message to the buffer of the endpoint named by `ep`
    ///
    /// Never blocks. Fails with `BufferFull` when the buffer cannot hold the
    /// whole message.
    fn lmp_send(&self, ep: CapAddr, words: &[Word], cap: Option<CapAddr>)
        -> Result<(), KernelError>;

    /// Take the oldest message off an endpoint owned by the caller
    ///
    /// Returns `Ok(None)` when the buffer is empty. A message carrying a
    /// capability is only taken when `recv_slot` names an empty slot,
    /// otherwise it stays queued and `NoReceiveSlot` is returned.
    fn lmp_recv(&self, ep: CapAddr, recv_slot: Option<CapAddr>)
        -> Result<Option<LmpRecv>, KernelError>;

    /// Suspend until one of `eps` holds a message or `timeout` elapses
    fn wait_for_messages(&self, eps: &[CapAddr], timeout: Option<Duration>)
        -> Result<(), KernelError>;

    /// Monotonic time since boot
    fn now(&self) -> Duration;

    /// CNode holding the caller's well-known slots
    fn root_cnode(&self) -> CNodeId;

    /// Encode and issue an invocation
    fn invoke(&self, inv: &Invocation) -> Result<[Word; 2], KernelError> {
        self.syscall(&inv.encode()).into_result()
    }
}

impl<K: Kernel + ?Sized> Kernel for &K {
    fn syscall(&self, frame: &TrapFrame) -> SysRet {
        (**self).syscall(frame)
    }

    fn lmp_send(&self, ep: CapAddr, words: &[Word], cap: Option<CapAddr>) -> Result<(), KernelError> {
        (**self).lmp_send(ep, words, cap)
    }

    fn lmp_recv(&self, ep: CapAddr, recv_slot: Option<CapAddr>) -> Result<Option<LmpRecv>, KernelError> {
        (**self).lmp_recv(ep, recv_slot)
    }

    fn wait_for_messages(&self, eps: &[CapAddr], timeout: Option<Duration>) -> Result<(), KernelError> {
        (**self).wait_for_messages(eps, timeout)
    }

    fn now(&self) -> Duration {
        (**self).now()
    }

    fn root_cnode(&self) -> CNodeId {
        (**self).root_cnode()
    }
}
