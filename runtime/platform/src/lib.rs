//! # Tern Platform
//!
//! The kernel ABI shared by every domain: capability addresses, object types,
//! invocation opcodes, kernel error codes, trap packing and the [`Kernel`]
//! trait through which user space reaches the kernel.
//!
//! A domain never talks to the kernel except through a value implementing
//! [`Kernel`]. On hardware that is a thin trap shim; on a development host it
//! is the simulated kernel in `tern-kernel-mock`.

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

pub mod abi;
pub mod bootinfo;
pub mod invocation;
pub mod kernel;

pub use abi::*;
pub use bootinfo::{BootInfo, BootModule, MemRegion};
pub use invocation::{Invocation, SysRet, TrapFrame, TRAP_FRAME_WORDS};
pub use kernel::{Kernel, LmpRecv};

/// Platform configuration and detection
pub mod config {
    /// Board this build targets
    pub fn board() -> &'static str {
        if cfg!(feature = "board-qemu-virt") {
            "qemu-virt"
        } else {
            "pandaboard"
        }
    }
}
