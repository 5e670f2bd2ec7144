//! RAM and device-frame services
//!
//! General RAM comes out of the boot RAM region with a watermark allocator;
//! every grant is naturally aligned to its size. Device frames are retyped at
//! the physical address the caller asks for, and the kernel refuses to hand
//! out the same device range twice.

use tern_cap::{CSpace, Capability, RamPool};
use tern_ipc::rpc::{RAM_BITS_MAX, RAM_BITS_MIN};
use tern_platform::{slots, Kernel, ObjType};

use crate::{InitError, Result};

#[derive(Debug)]
pub struct MemoryService {
    ram: RamPool,
    devices: RamPool,
}

impl MemoryService {
    /// Wrap the boot RAM and device regions init was started with
    pub fn new<K: Kernel + ?Sized>(kernel: &K, cspace: &CSpace) -> Result<Self> {
        let ram = RamPool::new(kernel, cspace.well_known(slots::BOOT_RAM, ObjType::Ram))?;
        let devices = RamPool::new(kernel, cspace.well_known(slots::DEVICE_RAM, ObjType::Ram))?;
        Ok(Self { ram, devices })
    }

    pub fn ram(&self) -> &RamPool {
        &self.ram
    }

    pub fn devices(&self) -> &RamPool {
        &self.devices
    }

    /// A `2^size_bits`-byte RAM capability for a client
    ///
    /// # Errors
    /// `InvalidArgument` for `size_bits` outside 12..=28, `OutOfMemory`
    /// when the boot region cannot fit an aligned block of that size.
    pub fn grant_ram<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        cspace: &mut CSpace,
        size_bits: u8,
    ) -> Result<Capability> {
        if !(RAM_BITS_MIN..=RAM_BITS_MAX).contains(&size_bits) {
            return Err(InitError::InvalidArgument("RAM size bits out of range"));
        }
        let bytes = 1usize << size_bits;
        Ok(self.ram.alloc(kernel, cspace, ObjType::Ram, bytes, bytes)?)
    }

    /// A device frame covering `[paddr, paddr + bytes)`
    pub fn grant_device<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        cspace: &mut CSpace,
        paddr: usize,
        bytes: usize,
    ) -> Result<Capability> {
        Ok(self.devices.alloc_at(kernel, cspace, ObjType::DevFrame, paddr, bytes)?)
    }

    /// Retype a kernel object for init's own use
    pub fn alloc_object<K: Kernel + ?Sized>(
        &mut self,
        kernel: &K,
        cspace: &mut CSpace,
        ty: ObjType,
        bytes: usize,
        align: usize,
    ) -> Result<Capability> {
        Ok(self.ram.alloc(kernel, cspace, ty, bytes, align)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_cap::{invoke, CapError};
    use tern_kernel_mock::{MockConfig, MockKernel};
    use tern_platform::bootinfo::board;
    use tern_platform::KernelError;

    #[test]
    fn test_grant_ram_sizes() {
        let (_kernel, init, info) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let mut mem = MemoryService::new(&init, &cspace).unwrap();
        assert_eq!(mem.ram().base(), info.ram.base);

        let small = mem.grant_ram(&init, &mut cspace, 12).unwrap();
        let id = invoke::identify(&init, &small).unwrap();
        assert_eq!(id.bytes, 4096);

        let big = mem.grant_ram(&init, &mut cspace, 20).unwrap();
        let id = invoke::identify(&init, &big).unwrap();
        assert_eq!(id.bytes, 1 << 20);
        assert_eq!(id.base % (1 << 20), 0);
    }

    #[test]
    fn test_grant_ram_rejects_bad_sizes() {
        let (_kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let mut mem = MemoryService::new(&init, &cspace).unwrap();
        assert!(matches!(mem.grant_ram(&init, &mut cspace, 11), Err(InitError::InvalidArgument(_))));
        assert!(matches!(mem.grant_ram(&init, &mut cspace, 29), Err(InitError::InvalidArgument(_))));
        // 256 MiB does not fit in the 64 MiB boot region
        assert!(matches!(
            mem.grant_ram(&init, &mut cspace, 28),
            Err(InitError::Cap(CapError::OutOfMemory { .. }))
        ));
    }

    #[test]
    fn test_device_frames_are_exclusive() {
        let (_kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let mut mem = MemoryService::new(&init, &cspace).unwrap();

        let uart = mem.grant_device(&init, &mut cspace, board::UART3_BASE, 0x100).unwrap();
        assert_eq!(uart.kind(), ObjType::DevFrame);
        assert_eq!(invoke::identify(&init, &uart).unwrap().bytes, 4096);

        assert_eq!(
            mem.grant_device(&init, &mut cspace, board::UART3_BASE + 0x10, 4),
            Err(InitError::Cap(CapError::Kernel(KernelError::Overlap)))
        );
        assert!(matches!(
            mem.grant_device(&init, &mut cspace, board::RAM_BASE, 4096),
            Err(InitError::Cap(CapError::InvalidArgument(_)))
        ));
    }

    #[test]
    fn test_device_grant_past_address_space_end() {
        let (_kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let mut mem = MemoryService::new(&init, &cspace).unwrap();
        for (paddr, bytes) in [(usize::MAX - 0x10, 0x100), (board::UART3_BASE, usize::MAX)] {
            assert_eq!(
                mem.grant_device(&init, &mut cspace, paddr, bytes),
                Err(InitError::Cap(CapError::InvalidArgument("address outside region")))
            );
        }
        // the region is still usable afterwards
        mem.grant_device(&init, &mut cspace, board::UART3_BASE, 0x100).unwrap();
    }
}
