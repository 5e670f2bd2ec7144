//! Boot information handed to init
//!
//! The kernel passes init a description of the memory it was given and the
//! boot modules packed into the image. The capabilities themselves sit in the
//! well-known slots of init's root CNode (see [`crate::abi::slots`]).

use alloc::string::String;
use alloc::vec::Vec;

/// A physical memory region [base, base + size)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub base: usize,
    pub size: usize,
}

impl MemRegion {
    pub fn end(&self) -> usize {
        self.base + self.size
    }

    pub fn contains(&self, paddr: usize, bytes: usize) -> bool {
        paddr >= self.base && paddr.checked_add(bytes).map_or(false, |end| end <= self.end())
    }
}

/// An executable image packed into the boot image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootModule {
    pub name: String,
    /// Physical address of the image
    pub base: usize,
    pub size: usize,
}

/// Boot information structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootInfo {
    /// Core init is running on
    pub core_id: usize,

    /// RAM region backing the `BOOT_RAM` capability
    pub ram: MemRegion,

    /// Device region backing the `DEVICE_RAM` capability
    pub device: MemRegion,

    /// Boot modules, in image order
    pub modules: Vec<BootModule>,
}

impl BootInfo {
    /// Find a boot module by name
    pub fn module(&self, name: &str) -> Option<&BootModule> {
        self.modules.iter().find(|m| m.name == name)
    }
}

/// Board memory map
pub mod board {
    #[cfg(not(feature = "board-qemu-virt"))]
    mod map {
        pub const RAM_BASE: usize = 0x8000_0000;
        pub const DEVICE_BASE: usize = 0x4800_0000;
        pub const DEVICE_SIZE: usize = 0x0100_0000;
        pub const UART3_BASE: usize = 0x4802_0000;
        pub const GPIO1_BASE: usize = 0x4A31_0000;
    }

    #[cfg(feature = "board-qemu-virt")]
    mod map {
        pub const RAM_BASE: usize = 0x4000_0000;
        pub const DEVICE_BASE: usize = 0x0800_0000;
        pub const DEVICE_SIZE: usize = 0x0100_0000;
        pub const UART3_BASE: usize = 0x0900_0000;
        pub const GPIO1_BASE: usize = 0x0903_0000;
    }

    pub use map::*;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_contains() {
        let r = MemRegion { base: 0x1000, size: 0x2000 };
        assert!(r.contains(0x1000, 0x2000));
        assert!(r.contains(0x2000, 0x1000));
        assert!(!r.contains(0x2000, 0x1001));
        assert!(!r.contains(0x0, 0x10));
        assert!(!r.contains(usize::MAX, 2));
    }

    #[test]
    fn test_module_lookup() {
        let info = BootInfo {
            core_id: 0,
            ram: MemRegion { base: 0, size: 0 },
            device: MemRegion { base: 0, size: 0 },
            modules: vec![BootModule { name: String::from("hello"), base: 0x9000_0000, size: 4096 }],
        };
        assert_eq!(info.module("hello").map(|m| m.base), Some(0x9000_0000));
        assert!(info.module("memeater").is_none());
    }
}
