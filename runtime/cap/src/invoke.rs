//! Invocations on table, dispatcher, IRQ-table and kernel capabilities
//!
//! Each function validates its arguments, packs them into a single trap and
//! reports the kernel's verdict.

use tern_platform::{
    CapAddr, Kernel, MapFlags, ObjType, Opcode, Word, BASE_PAGE_SIZE, L1_ENTRIES, L2_ENTRIES,
};

use crate::capability::Capability;
use crate::{CapError, Result};

/// Physical extent of the object behind a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub base: usize,
    /// log2 of the object size, rounded up
    pub size_bits: u8,
    pub bytes: usize,
}

/// Identify the object behind `cap`
///
/// The kernel returns base and size bits packed into one word (objects are
/// at least 64-byte aligned, so the low six bits carry the size) plus the
/// exact byte count.
pub fn identify<K: Kernel + ?Sized>(kernel: &K, cap: &Capability) -> Result<Identity> {
    let [packed, bytes] = cap.invoke(kernel, Opcode::Identify, &[])?;
    Ok(Identity { base: packed & !0x3F, size_bits: (packed & 0x3F) as u8, bytes })
}

fn addr_words(addr: CapAddr) -> [Word; 2] {
    [addr.cnode.0 as Word, addr.slot as Word]
}

/// Install `src` at `index` of `table`
///
/// For an L1 table `src` must be an L2 table and `count` 1. For an L2 table
/// `src` is a frame; `count` pages starting `offset` bytes into it are mapped
/// at consecutive entries.
pub fn vnode_map<K: Kernel + ?Sized>(
    kernel: &K,
    table: &Capability,
    index: usize,
    src: &Capability,
    flags: MapFlags,
    offset: usize,
    count: usize,
) -> Result<()> {
    src.validate()?;
    match table.kind() {
        ObjType::L1Table => {
            src.expect(ObjType::L2Table)?;
            if index >= L1_ENTRIES {
                return Err(CapError::InvalidArgument("L1 index out of range"));
            }
            if count != 1 {
                return Err(CapError::InvalidArgument("L1 entries map one table"));
            }
        }
        ObjType::L2Table => {
            if !matches!(src.kind(), ObjType::Frame | ObjType::DevFrame) {
                return Err(CapError::TypeMismatch { expected: ObjType::Frame, found: src.kind() });
            }
            if count == 0 || index.checked_add(count).map_or(true, |end| end > L2_ENTRIES) {
                return Err(CapError::InvalidArgument("L2 range out of bounds"));
            }
            if offset % BASE_PAGE_SIZE != 0 {
                return Err(CapError::InvalidArgument("frame offset not page aligned"));
            }
        }
        found => return Err(CapError::TypeMismatch { expected: ObjType::L2Table, found }),
    }
    let [cnode, slot] = addr_words(src.addr());
    table.invoke(kernel, Opcode::Map, &[index, cnode, slot, flags.bits(), offset, count])?;
    Ok(())
}

/// Remove `count` entries starting at `index` of `table`
pub fn vnode_unmap<K: Kernel + ?Sized>(
    kernel: &K,
    table: &Capability,
    index: usize,
    count: usize,
) -> Result<()> {
    if !matches!(table.kind(), ObjType::L1Table | ObjType::L2Table) {
        return Err(CapError::TypeMismatch { expected: ObjType::L2Table, found: table.kind() });
    }
    if count == 0 {
        return Err(CapError::InvalidArgument("zero entries"));
    }
    table.invoke(kernel, Opcode::Unmap, &[index, count])?;
    Ok(())
}

/// Change the attributes of `count` mapped pages of an L2 table
pub fn modify_flags<K: Kernel + ?Sized>(
    kernel: &K,
    table: &Capability,
    index: usize,
    count: usize,
    flags: MapFlags,
) -> Result<()> {
    table.expect(ObjType::L2Table)?;
    if count == 0 || index.checked_add(count).map_or(true, |end| end > L2_ENTRIES) {
        return Err(CapError::InvalidArgument("L2 range out of bounds"));
    }
    table.invoke(kernel, Opcode::ModifyFlags, &[index, count, flags.bits()])?;
    Ok(())
}

/// Bind a dispatcher to its CSpace and VSpace and optionally make it runnable
pub fn dispatcher_setup<K: Kernel + ?Sized>(
    kernel: &K,
    dispatcher: &Capability,
    cspace: &Capability,
    vspace: &Capability,
    entry: usize,
    run: bool,
) -> Result<()> {
    dispatcher.expect(ObjType::Dispatcher)?;
    cspace.expect(ObjType::CNode)?;
    vspace.expect(ObjType::L1Table)?;
    let [cs_cnode, cs_slot] = addr_words(cspace.addr());
    let [vs_cnode, vs_slot] = addr_words(vspace.addr());
    dispatcher.invoke(
        kernel,
        Opcode::DispatcherSetup,
        &[cs_cnode, cs_slot, vs_cnode, vs_slot, entry, run as Word],
    )?;
    Ok(())
}

/// Stop a dispatcher for good
pub fn dispatcher_stop<K: Kernel + ?Sized>(kernel: &K, dispatcher: &Capability) -> Result<()> {
    dispatcher.expect(ObjType::Dispatcher)?;
    dispatcher.invoke(kernel, Opcode::DispatcherStop, &[])?;
    Ok(())
}

/// Route interrupt `irq` to `endpoint`
pub fn irq_table_set<K: Kernel + ?Sized>(
    kernel: &K,
    irq_table: &Capability,
    irq: usize,
    endpoint: &Capability,
) -> Result<()> {
    irq_table.expect(ObjType::IrqTable)?;
    endpoint.expect(ObjType::Endpoint)?;
    let [cnode, slot] = addr_words(endpoint.addr());
    irq_table.invoke(kernel, Opcode::IrqTableSet, &[irq, cnode, slot])?;
    Ok(())
}

pub fn irq_table_delete<K: Kernel + ?Sized>(
    kernel: &K,
    irq_table: &Capability,
    irq: usize,
) -> Result<()> {
    irq_table.expect(ObjType::IrqTable)?;
    irq_table.invoke(kernel, Opcode::IrqTableDelete, &[irq])?;
    Ok(())
}

/// Core the caller is running on
pub fn get_core_id<K: Kernel + ?Sized>(kernel: &K, kernel_cap: &Capability) -> Result<usize> {
    kernel_cap.expect(ObjType::Kernel)?;
    let [core, _] = kernel_cap.invoke(kernel, Opcode::GetCoreId, &[])?;
    Ok(core)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CSpace;
    use tern_kernel_mock::{MockConfig, MockKernel};
    use tern_platform::{slots, KernelError, OBJSIZE_L2};

    #[test]
    fn test_map_validation_before_trap() {
        let (_kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let ram = cspace.well_known(slots::BOOT_RAM, ObjType::Ram);
        let l1 = cspace.well_known(slots::L1_TABLE, ObjType::L1Table);
        let frame = cspace.retype(&init, &ram, 0, ObjType::Frame, BASE_PAGE_SIZE).unwrap();

        assert!(matches!(
            vnode_map(&init, &l1, 1, &frame, MapFlags::READ, 0, 1),
            Err(CapError::TypeMismatch { .. })
        ));
        let l2 = cspace.retype(&init, &ram, BASE_PAGE_SIZE, ObjType::L2Table, OBJSIZE_L2).unwrap();
        assert_eq!(
            vnode_map(&init, &l1, L1_ENTRIES, &l2, MapFlags::empty(), 0, 1),
            Err(CapError::InvalidArgument("L1 index out of range"))
        );
        assert_eq!(
            vnode_map(&init, &l2, 1020, &frame, MapFlags::READ, 0, 8),
            Err(CapError::InvalidArgument("L2 range out of bounds"))
        );
        assert_eq!(
            vnode_map(&init, &l2, 2, &frame, MapFlags::READ, 0, usize::MAX),
            Err(CapError::InvalidArgument("L2 range out of bounds"))
        );
        assert_eq!(
            modify_flags(&init, &l2, 2, usize::MAX, MapFlags::READ),
            Err(CapError::InvalidArgument("L2 range out of bounds"))
        );
    }

    #[test]
    fn test_map_modify_unmap() {
        let (_kernel, init, _) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let ram = cspace.well_known(slots::BOOT_RAM, ObjType::Ram);
        let l1 = cspace.well_known(slots::L1_TABLE, ObjType::L1Table);
        let l2 = cspace.retype(&init, &ram, 0, ObjType::L2Table, OBJSIZE_L2).unwrap();
        let frame = cspace.retype(&init, &ram, BASE_PAGE_SIZE, ObjType::Frame, 2 * BASE_PAGE_SIZE).unwrap();

        let vaddr = 0x5000_0000;
        let i2 = (vaddr >> 12) & 0x3FF;
        vnode_map(&init, &l1, vaddr >> 20, &l2, MapFlags::empty(), 0, 1).unwrap();
        vnode_map(&init, &l2, i2, &frame, MapFlags::READ_WRITE, 0, 2).unwrap();
        init.write_byte(vaddr + BASE_PAGE_SIZE, 7).unwrap();
        assert_eq!(init.read_byte(vaddr + BASE_PAGE_SIZE), Ok(7));

        modify_flags(&init, &l2, i2, 2, MapFlags::READ).unwrap();
        assert_eq!(init.write_byte(vaddr, 1), Err(KernelError::InsufficientRights));

        vnode_unmap(&init, &l2, i2, 2).unwrap();
        assert_eq!(init.read_byte(vaddr), Err(KernelError::NotMapped));
        assert_eq!(
            vnode_unmap(&init, &l2, i2, 1),
            Err(CapError::Kernel(KernelError::NotMapped))
        );
    }

    #[test]
    fn test_identify_frame() {
        let (_kernel, init, info) = MockKernel::boot(MockConfig::default());
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let ram = cspace.well_known(slots::BOOT_RAM, ObjType::Ram);
        let frame = cspace.retype(&init, &ram, 1 << 20, ObjType::Frame, 1 << 20).unwrap();
        let id = identify(&init, &frame).unwrap();
        assert_eq!(id.base, info.ram.base + (1 << 20));
        assert_eq!(id.size_bits, 20);
        assert_eq!(id.bytes, 1 << 20);
    }

    #[test]
    fn test_core_id_and_irq_table() {
        let (kernel, init, _) = MockKernel::boot(MockConfig { core_id: 1, ..MockConfig::default() });
        let mut cspace = CSpace::for_domain(&init).unwrap();
        let kcap = cspace.well_known(slots::KERNEL, ObjType::Kernel);
        assert_eq!(get_core_id(&init, &kcap), Ok(1));

        let disp = cspace.well_known(slots::DISPATCHER, ObjType::Dispatcher);
        let ep = cspace.retype_endpoint(&init, &disp, 32).unwrap();
        let irqs = cspace.well_known(slots::IRQ_TABLE, ObjType::IrqTable);
        irq_table_set(&init, &irqs, 42, &ep).unwrap();
        assert_eq!(kernel.raise_irq(42), 1);
        irq_table_delete(&init, &irqs, 42).unwrap();
        assert_eq!(kernel.raise_irq(42), 0);
    }
}
