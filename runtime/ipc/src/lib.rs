//! Tern IPC - capability-carrying message channels between domains
//!
//! # Purpose
//! Provides the lightweight message transport every domain uses: fixed-size
//! messages of at most nine words that may carry one capability, channels
//! that pair a local receive endpoint with a remote send endpoint, a
//! cooperative event loop, and typed RPC calls to init and service providers.
//!
//! # Integration Points
//! - Depends on: `tern-platform` (LMP entry points), `tern-cap` (endpoints,
//!   receive slots)
//! - Provides to: init, service providers and every client domain
//! - Capabilities required: the domain's dispatcher (endpoints are retyped
//!   from it) and its root CNode
//!
//! # Architecture
//! Sends never block: the kernel appends the whole message to the remote
//! endpoint's word buffer or refuses with `BufferFull`. Receives are polled
//! by an [`EventLoop`] that suspends in the kernel until one of the armed
//! endpoints holds a message. Messages on one channel arrive in order; there
//! is no ordering across channels.
//!
//! # Example
//! ```no_run
//! use core::time::Duration;
//! use tern_ipc::{DomainIo, ServiceId};
//! # fn run<K: tern_platform::Kernel>(kernel: K) -> tern_ipc::Result<()> {
//! let mut dom = DomainIo::new(kernel)?;
//! let init = dom.connect_init(Some(Duration::from_millis(500)))?;
//! let mut rpc = dom.rpc(init, Some(Duration::from_millis(500)))?;
//! assert_eq!(rpc.ping(7)?, 7);
//! let _serial = rpc.find_service(ServiceId::SERIAL)?;
//! # Ok(())
//! # }
//! ```

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod channel;
pub mod domain;
pub mod event;
pub mod message;
pub mod protocol;
pub mod provider;
pub mod rpc;

use tern_cap::CapError;
use tern_platform::{KernelError, Word};
use thiserror::Error;

pub use channel::{Channel, ChannelId, ChannelSet, ChannelState};
pub use domain::DomainIo;
pub use event::{EventLoop, EventSource, Io};
pub use message::{Delivery, Message};
pub use protocol::{CorrelationId, DomainId, MessageType, ServiceId, Status, REPLY_BIT};
pub use provider::{RequestHandler, ServiceProvider};
pub use rpc::RpcClient;

/// IPC error types
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    #[error("channel has no remote endpoint")]
    NotConnected,

    #[error("remote endpoint buffer full")]
    BufferFull,

    #[error("timed out waiting for a message")]
    Timeout,

    #[error("message of {words} words exceeds the LMP limit")]
    MessageTooLong { words: usize },

    #[error("malformed message")]
    Malformed,

    #[error("expected reply tag {expected:#x}, got {got:#x}")]
    UnexpectedReply { expected: Word, got: Word },

    #[error("remote side answered {0:?}")]
    Remote(Status),

    #[error("channel {0} already has a handler")]
    AlreadyRegistered(ChannelId),

    #[error("no channel {0}")]
    UnknownChannel(ChannelId),

    #[error(transparent)]
    Cap(#[from] CapError),

    #[error("kernel: {0}")]
    Kernel(KernelError),
}

impl From<KernelError> for IpcError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::BufferFull => Self::BufferFull,
            KernelError::Timeout => Self::Timeout,
            e => Self::Kernel(e),
        }
    }
}

impl IpcError {
    /// Worth retrying later without changing anything
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BufferFull
                | Self::Kernel(KernelError::NoReceiveSlot)
                | Self::Cap(CapError::Kernel(KernelError::BufferFull))
        )
    }
}

pub type Result<T> = core::result::Result<T, IpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_error_mapping() {
        assert_eq!(IpcError::from(KernelError::BufferFull), IpcError::BufferFull);
        assert_eq!(IpcError::from(KernelError::Timeout), IpcError::Timeout);
        assert_eq!(
            IpcError::from(KernelError::InvalidCapability),
            IpcError::Kernel(KernelError::InvalidCapability)
        );
        assert!(IpcError::Kernel(KernelError::NoReceiveSlot).is_transient());
        assert!(!IpcError::Timeout.is_transient());
    }
}
