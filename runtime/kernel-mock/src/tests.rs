use super::*;
use tern_platform::{MapFlags, Opcode, BASE_PAGE_SIZE, CPTR_BITS, OBJSIZE_L2};

fn boot() -> (MockKernel, MockDomain) {
    let (kernel, init, _) = MockKernel::boot(MockConfig::default());
    (kernel, init)
}

fn at(dom: &MockDomain, slot: u32) -> CapAddr {
    CapAddr::new(dom.root_cnode(), slot)
}

fn invoke(dom: &MockDomain, cap: CapAddr, op: Opcode, args: &[Word]) -> Result<[Word; 2], KernelError> {
    dom.invoke(&Invocation::with_args(cap, CPTR_BITS, op, args)?)
}

fn retype(dom: &MockDomain, ty: ObjType, offset: usize, size: usize, slot: u32) -> Result<(), KernelError> {
    let cnode = dom.root_cnode().0 as Word;
    invoke(
        dom,
        at(dom, slots::BOOT_RAM),
        Opcode::Retype,
        &[offset, ty as Word, size, 1, cnode, slot as Word],
    )
    .map(|_| ())
}

#[test]
fn test_boot_fills_well_known_slots() {
    let (_k, init) = boot();
    assert_eq!(init.slot_kind(at(&init, slots::DISPATCHER)), Some(ObjType::Dispatcher));
    assert_eq!(init.slot_kind(at(&init, slots::ROOT_CNODE)), Some(ObjType::CNode));
    assert_eq!(init.slot_kind(at(&init, slots::BOOT_RAM)), Some(ObjType::Ram));
    assert_eq!(init.slot_kind(at(&init, slots::FIRST_FREE)), None);
}

#[test]
fn test_retype_rejects_overlap_and_occupied_slot() {
    let (_k, init) = boot();
    retype(&init, ObjType::Frame, 0, 2 * BASE_PAGE_SIZE, 20).unwrap();
    assert_eq!(
        retype(&init, ObjType::Frame, BASE_PAGE_SIZE, BASE_PAGE_SIZE, 21),
        Err(KernelError::Overlap)
    );
    assert_eq!(
        retype(&init, ObjType::Frame, 4 * BASE_PAGE_SIZE, BASE_PAGE_SIZE, 20),
        Err(KernelError::SlotInUse)
    );
    assert_eq!(
        retype(&init, ObjType::Frame, 100, BASE_PAGE_SIZE, 22),
        Err(KernelError::AlignmentError)
    );
}

#[test]
fn test_identify_packs_base_and_bits() {
    let (_k, init) = boot();
    retype(&init, ObjType::Frame, 0, 4 * BASE_PAGE_SIZE, 20).unwrap();
    let [packed, bytes] = invoke(&init, at(&init, 20), Opcode::Identify, &[]).unwrap();
    assert_eq!(packed & !0x3F, board::RAM_BASE);
    assert_eq!(packed & 0x3F, 14);
    assert_eq!(bytes, 4 * BASE_PAGE_SIZE);
}

#[test]
fn test_revoke_removes_copies_and_frees_region() {
    let (_k, init) = boot();
    retype(&init, ObjType::Ram, 0, 1 << 20, 20).unwrap();
    let cnode = init.root_cnode().0 as Word;
    invoke(&init, at(&init, slots::ROOT_CNODE), Opcode::Copy, &[21, cnode, 20]).unwrap();
    assert_eq!(init.slot_kind(at(&init, 21)), Some(ObjType::Ram));

    invoke(&init, at(&init, slots::BOOT_RAM), Opcode::Revoke, &[]).unwrap();
    assert_eq!(init.slot_kind(at(&init, 20)), None);
    assert_eq!(init.slot_kind(at(&init, 21)), None);
    assert_eq!(init.slot_kind(at(&init, slots::BOOT_RAM)), Some(ObjType::Ram));

    retype(&init, ObjType::Frame, 0, BASE_PAGE_SIZE, 20).unwrap();
}

#[test]
fn test_mint_cannot_grow_rights() {
    let (_k, init) = boot();
    retype(&init, ObjType::Frame, 0, BASE_PAGE_SIZE, 20).unwrap();
    let cnode = init.root_cnode().0 as Word;
    invoke(
        &init,
        at(&init, slots::ROOT_CNODE),
        Opcode::Mint,
        &[21, cnode, 20, CapRights::READ.bits()],
    )
    .unwrap();
    assert_eq!(
        invoke(&init, at(&init, slots::ROOT_CNODE), Opcode::Mint, &[22, cnode, 21, CapRights::ALL.bits()]),
        Err(KernelError::InsufficientRights)
    );
}

#[test]
fn test_map_then_access() {
    let (_k, init) = boot();
    let cnode = init.root_cnode().0 as Word;
    retype(&init, ObjType::L2Table, 0, OBJSIZE_L2, 20).unwrap();
    retype(&init, ObjType::Frame, BASE_PAGE_SIZE, BASE_PAGE_SIZE, 21).unwrap();

    let vaddr = 0x4010_2000;
    invoke(&init, at(&init, slots::L1_TABLE), Opcode::Map, &[vaddr >> 20, cnode, 20, 0, 0, 1]).unwrap();
    assert_eq!(init.read_byte(vaddr), Err(KernelError::NotMapped));

    let i2 = (vaddr >> 12) & 0x3FF;
    let flags = MapFlags::READ_WRITE.bits();
    invoke(&init, at(&init, 20), Opcode::Map, &[i2, cnode, 21, flags, 0, 1]).unwrap();
    init.write_byte(vaddr + 5, 0xAB).unwrap();
    assert_eq!(init.read_byte(vaddr + 5), Ok(0xAB));

    // A capability backs at most one mapping
    assert_eq!(
        invoke(&init, at(&init, 20), Opcode::Map, &[i2 + 1, cnode, 21, flags, 0, 1]),
        Err(KernelError::AlreadyMapped)
    );

    invoke(&init, at(&init, 20), Opcode::ModifyFlags, &[i2, 1, MapFlags::READ.bits()]).unwrap();
    assert_eq!(init.write_byte(vaddr, 1), Err(KernelError::InsufficientRights));

    invoke(&init, at(&init, 21), Opcode::Delete, &[]).unwrap();
    assert_eq!(init.read_byte(vaddr), Err(KernelError::NotMapped));
}

#[test]
fn test_l2_range_arithmetic_saturates() {
    let (_k, init) = boot();
    let cnode = init.root_cnode().0 as Word;
    retype(&init, ObjType::L2Table, 0, OBJSIZE_L2, 20).unwrap();
    retype(&init, ObjType::Frame, BASE_PAGE_SIZE, BASE_PAGE_SIZE, 21).unwrap();
    let flags = MapFlags::READ_WRITE.bits();

    assert_eq!(
        invoke(&init, at(&init, 20), Opcode::Map, &[4, cnode, 21, flags, 0, usize::MAX]),
        Err(KernelError::RangeError)
    );
    let top_page = usize::MAX & !(BASE_PAGE_SIZE - 1);
    assert_eq!(
        invoke(&init, at(&init, 20), Opcode::Map, &[4, cnode, 21, flags, top_page, 1]),
        Err(KernelError::RangeError)
    );

    invoke(&init, at(&init, 20), Opcode::Map, &[4, cnode, 21, flags, 0, 1]).unwrap();
    assert_eq!(
        invoke(&init, at(&init, 20), Opcode::ModifyFlags, &[4, usize::MAX, MapFlags::READ.bits()]),
        Err(KernelError::NotMapped)
    );
    assert_eq!(invoke(&init, at(&init, 20), Opcode::Unmap, &[4, usize::MAX]), Err(KernelError::NotMapped));
    invoke(&init, at(&init, 20), Opcode::Unmap, &[4, 1]).unwrap();
}

#[test]
fn test_endpoint_buffer_full_and_order() {
    let (_k, init) = boot();
    let cnode = init.root_cnode().0 as Word;
    invoke(
        &init,
        at(&init, slots::DISPATCHER),
        Opcode::Retype,
        &[0, ObjType::Endpoint as Word, 12, 1, cnode, 30],
    )
    .unwrap();
    let ep = at(&init, 30);
    init.lmp_send(ep, &[1, 2, 3], None).unwrap();
    init.lmp_send(ep, &[4, 5, 6], None).unwrap();
    assert_eq!(init.lmp_send(ep, &[7, 8, 9, 10, 11, 12], None), Err(KernelError::BufferFull));

    assert_eq!(init.lmp_recv(ep, None).unwrap().unwrap().payload(), &[1, 2, 3]);
    assert_eq!(init.lmp_recv(ep, None).unwrap().unwrap().payload(), &[4, 5, 6]);
    assert_eq!(init.lmp_recv(ep, None).unwrap(), None);
}

#[test]
fn test_cap_transfer_needs_receive_slot() {
    let (_k, init) = boot();
    let cnode = init.root_cnode().0 as Word;
    invoke(
        &init,
        at(&init, slots::DISPATCHER),
        Opcode::Retype,
        &[0, ObjType::Endpoint as Word, 64, 1, cnode, 30],
    )
    .unwrap();
    retype(&init, ObjType::Frame, 0, BASE_PAGE_SIZE, 31).unwrap();
    let ep = at(&init, 30);
    init.lmp_send(ep, &[9], Some(at(&init, 31))).unwrap();

    assert_eq!(init.lmp_recv(ep, None), Err(KernelError::NoReceiveSlot));
    let msg = init.lmp_recv(ep, Some(at(&init, 40))).unwrap().unwrap();
    assert_eq!(msg.cap, Some((at(&init, 40), ObjType::Frame)));
    assert_eq!(init.slot_kind(at(&init, 40)), Some(ObjType::Frame));
}

#[test]
fn test_wait_times_out() {
    let (_k, init) = boot();
    let cnode = init.root_cnode().0 as Word;
    invoke(
        &init,
        at(&init, slots::DISPATCHER),
        Opcode::Retype,
        &[0, ObjType::Endpoint as Word, 64, 1, cnode, 30],
    )
    .unwrap();
    let result = init.wait_for_messages(&[at(&init, 30)], Some(Duration::from_millis(10)));
    assert_eq!(result, Err(KernelError::Timeout));
}

#[test]
fn test_irq_delivers_to_bound_endpoint() {
    let (kernel, init) = boot();
    let cnode = init.root_cnode().0 as Word;
    invoke(
        &init,
        at(&init, slots::DISPATCHER),
        Opcode::Retype,
        &[0, ObjType::Endpoint as Word, 64, 1, cnode, 30],
    )
    .unwrap();
    invoke(&init, at(&init, slots::IRQ_TABLE), Opcode::IrqTableSet, &[74, cnode, 30]).unwrap();
    assert_eq!(kernel.raise_irq(74), 1);
    assert_eq!(init.lmp_recv(at(&init, 30), None).unwrap().unwrap().payload(), &[74]);

    invoke(&init, at(&init, slots::IRQ_TABLE), Opcode::IrqTableDelete, &[74]).unwrap();
    assert_eq!(kernel.raise_irq(74), 0);
}

#[test]
fn test_shutdown_stops_waiters() {
    let (kernel, init) = boot();
    kernel.shutdown();
    assert_eq!(
        init.wait_for_messages(&[], Some(Duration::from_millis(1))),
        Err(KernelError::DispatcherStopped)
    );
    assert_eq!(init.run_state(), Some(RunState::Stopped));
}
