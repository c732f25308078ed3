use super::*;

const SHIFT: u32 = 12;

fn ram(ppn: u64) -> Backing {
    Backing::Ram(HostPage::from_raw(ppn as u32))
}

fn rw(paddr: u64) -> Walk {
    Walk {
        paddr,
        writable: true,
        executable: true,
    }
}

fn assert_consistent(mmu: &Mmu) {
    for (i, e) in mmu.tlb_entries().iter().enumerate() {
        if !e.valid {
            continue;
        }
        let slot = mmu.slot(e.vaddr_page << SHIFT);
        assert!(slot.is_valid(), "entry {i} ({:#x}) has no slot", e.vaddr_page);
        assert_eq!(usize::from(slot.tlb_index), i);
        assert_eq!(slot.ppn, e.paddr_page);
        assert_eq!(slot.host_load, e.host_page);
    }
}

#[test]
fn lookup_misses_until_insert() {
    let mut mmu = Mmu::new(AddressWidth::Bits32, SHIFT, 4);
    assert!(mmu.lookup(0x1234, AccessType::Read).is_none());

    let slot = mmu.insert(0x1234, &rw(0x8000), ram(8), true);
    assert_eq!(slot.ppn, 8);
    let l = mmu.lookup(0x1fff, AccessType::Write).unwrap();
    assert_eq!(l.host, Some(HostPage::from_raw(8)));
    assert!(mmu.lookup(0x2000, AccessType::Read).is_none());
}

#[test]
fn read_only_walk_never_gets_a_store_path() {
    let mut mmu = Mmu::new(AddressWidth::Bits32, SHIFT, 4);
    let walk = Walk {
        paddr: 0x3000,
        writable: false,
        executable: false,
    };
    mmu.insert(0x5000, &walk, ram(3), true);
    assert!(mmu.lookup(0x5000, AccessType::Write).is_none());
    assert!(mmu.lookup(0x5000, AccessType::Execute).is_none());
    assert!(mmu.lookup(0x5000, AccessType::Read).is_some());
    assert!(!mmu.allow_store(0x5000));
}

#[test]
fn device_pages_use_the_slow_path() {
    let mut mmu = Mmu::new(AddressWidth::Bits32, SHIFT, 4);
    mmu.insert(0x9000, &rw(0xf000_0000), Backing::Slow, true);
    let l = mmu.lookup(0x9000, AccessType::Write).unwrap();
    assert_eq!(l.host, None);
    assert_eq!(l.ppn, 0xf0000);
    assert!(!mmu.allow_store(0x9000));
}

#[test]
fn eviction_clears_the_old_slot() {
    let mut mmu = Mmu::new(AddressWidth::Bits32, SHIFT, 2);
    mmu.insert(0x1000, &rw(0x1000), ram(1), true);
    mmu.insert(0x2000, &rw(0x2000), ram(2), true);
    mmu.insert(0x3000, &rw(0x3000), ram(3), true);

    assert!(mmu.lookup(0x1000, AccessType::Read).is_none());
    assert!(mmu.lookup(0x2000, AccessType::Read).is_some());
    assert!(mmu.lookup(0x3000, AccessType::Read).is_some());
    #[cfg(feature = "stats")]
    assert_eq!(mmu.stats().unwrap().evictions, 1);
    assert_consistent(&mmu);
}

#[test]
fn remapping_a_page_reuses_its_entry() {
    let mut mmu = Mmu::new(AddressWidth::Bits32, SHIFT, 2);
    mmu.insert(0x1000, &rw(0x1000), ram(1), true);
    mmu.attach_code(0x1000, CodePageId::new(0));
    mmu.insert(0x2000, &rw(0x2000), ram(2), true);

    // Same physical page: code reference survives, no eviction.
    mmu.insert(0x1000, &rw(0x1000), ram(1), false);
    assert_eq!(mmu.slot(0x1000).code, Some(CodePageId::new(0)));
    assert!(mmu.lookup(0x2000, AccessType::Read).is_some());
    assert!(mmu.lookup(0x1000, AccessType::Write).unwrap().host.is_none());

    // New physical page: code reference is dropped.
    mmu.insert(0x1000, &rw(0x7000), ram(7), true);
    assert_eq!(mmu.slot(0x1000).code, None);
    assert_consistent(&mmu);
}

#[test]
fn detach_code_drops_every_alias() {
    let mut mmu = Mmu::new(AddressWidth::Bits32, SHIFT, 8);
    for vaddr in [0x1000, 0x4000, 0x9000] {
        mmu.insert(vaddr, &rw(0x5000), ram(5), true);
        mmu.attach_code(vaddr, CodePageId::new(3));
    }
    mmu.insert(0x2000, &rw(0x6000), ram(6), true);
    mmu.attach_code(0x2000, CodePageId::new(4));

    assert!(mmu.references_code(5));
    assert_eq!(mmu.detach_code(5), 3);
    assert!(!mmu.references_code(5));
    assert!(mmu.references_code(6));

    mmu.detach_all_code();
    assert!(!mmu.references_code(6));
}

#[test]
fn revoke_and_allow_store() {
    let mut mmu = Mmu::new(AddressWidth::Bits32, SHIFT, 8);
    mmu.insert(0x1000, &rw(0x5000), ram(5), true);
    mmu.insert(0x8000, &rw(0x5000), ram(5), true);

    assert_eq!(mmu.revoke_store(5), 2);
    assert!(mmu.lookup(0x1000, AccessType::Write).unwrap().host.is_none());
    assert!(mmu.lookup(0x1000, AccessType::Read).unwrap().host.is_some());

    assert!(mmu.allow_store(0x1000));
    assert!(mmu.lookup(0x1000, AccessType::Write).unwrap().host.is_some());
    assert!(mmu.lookup(0x8000, AccessType::Write).unwrap().host.is_none());
}

#[test]
fn invalidate_range_and_flush() {
    let mut mmu = Mmu::new(AddressWidth::Bits64, SHIFT, 16);
    for i in 0..8u64 {
        let vaddr = 0xffff_8000_0000_0000 + (i << SHIFT);
        mmu.insert(vaddr, &rw(i << SHIFT), ram(i), true);
    }
    mmu.invalidate_range(0xffff_8000_0000_2800, 0xffff_8000_0000_4001);
    for i in 0..8u64 {
        let mapped = mmu
            .lookup(0xffff_8000_0000_0000 + (i << SHIFT), AccessType::Read)
            .is_some();
        assert_eq!(mapped, !(2..=4).contains(&i), "page {i}");
    }
    assert_consistent(&mmu);

    mmu.invalidate_page(0xffff_8000_0000_0000);
    assert!(mmu.lookup(0xffff_8000_0000_0000, AccessType::Read).is_none());

    mmu.flush();
    assert!(mmu.tlb_entries().iter().all(|e| !e.valid));
    assert!(mmu.lookup(0xffff_8000_0000_7000, AccessType::Read).is_none());
}

#[test]
fn narrow_addresses_are_masked() {
    let mut mmu = Mmu::new(AddressWidth::Bits32, SHIFT, 4);
    mmu.insert(0x1_0000_1000, &rw(0x1000), ram(1), true);
    assert!(mmu.lookup(0x1000, AccessType::Read).is_some());
}

fn radix_nodes(mmu: &Mmu) -> (usize, usize) {
    match &mmu.table {
        VphTable::Radix(t) => t.nodes(),
        VphTable::Flat(_) => panic!("expected a radix table"),
    }
}

#[test]
fn sparse_wide_mappings_release_table_nodes() {
    let mut mmu = Mmu::new(AddressWidth::Bits64, SHIFT, 4);
    for i in 0..2000u64 {
        mmu.insert(i << 32, &rw(i << SHIFT), ram(i), true);
        let (top, leaves) = radix_nodes(&mmu);
        assert!(top <= 4 && leaves <= 4, "after {i}: {top} top nodes, {leaves} leaves");
    }
    assert_consistent(&mmu);

    // Neighbouring pages share a leaf.
    mmu.flush();
    for vpn in 0..3u64 {
        mmu.insert(vpn << SHIFT, &rw(vpn << SHIFT), ram(vpn), true);
    }
    assert_eq!(radix_nodes(&mmu), (1, 1));
    mmu.invalidate_page(0);
    assert_eq!(radix_nodes(&mmu), (1, 1));

    mmu.flush();
    assert_eq!(radix_nodes(&mmu), (0, 0));
}

#[cfg(not(target_arch = "wasm32"))]
mod props {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Insert { vpn: u64, ppn: u64, writable: bool },
        Attach { vpn: u64, code: u32 },
        Detach { ppn: u64 },
        Revoke { ppn: u64 },
        Invalidate { vpn: u64 },
        Flush,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            6 => (0u64..24, 0u64..6, any::<bool>())
                .prop_map(|(vpn, ppn, writable)| Op::Insert { vpn, ppn, writable }),
            3 => (0u64..24, 0u32..4).prop_map(|(vpn, code)| Op::Attach { vpn, code }),
            2 => (0u64..6).prop_map(|ppn| Op::Detach { ppn }),
            2 => (0u64..6).prop_map(|ppn| Op::Revoke { ppn }),
            2 => (0u64..24).prop_map(|vpn| Op::Invalidate { vpn }),
            1 => Just(Op::Flush),
        ]
    }

    proptest! {
        #[test]
        fn table_mirrors_tlb(ops in proptest::collection::vec(op(), 1..200), entries in 1usize..8) {
            let mut mmu = Mmu::new(AddressWidth::Bits64, SHIFT, entries);
            for op in ops {
                match op {
                    Op::Insert { vpn, ppn, writable } => {
                        let walk = Walk { paddr: ppn << SHIFT, writable, executable: true };
                        mmu.insert(vpn << SHIFT, &walk, ram(ppn), true);
                    }
                    Op::Attach { vpn, code } => {
                        if mmu.slot(vpn << SHIFT).is_valid() {
                            mmu.attach_code(vpn << SHIFT, CodePageId::new(code));
                        }
                    }
                    Op::Detach { ppn } => {
                        mmu.detach_code(ppn);
                        prop_assert!(!mmu.references_code(ppn));
                    }
                    Op::Revoke { ppn } => {
                        mmu.revoke_store(ppn);
                        for e in mmu.tlb_entries().iter().filter(|e| e.valid && e.paddr_page == ppn) {
                            prop_assert!(mmu.slot(e.vaddr_page << SHIFT).host_store.is_none());
                        }
                    }
                    Op::Invalidate { vpn } => {
                        mmu.invalidate_page(vpn << SHIFT);
                        prop_assert!(!mmu.slot(vpn << SHIFT).is_valid());
                    }
                    Op::Flush => mmu.flush(),
                }

                let valid = mmu.tlb_entries().iter().filter(|e| e.valid).count();
                let populated = (0u64..24).filter(|&v| mmu.slot(v << SHIFT).is_valid()).count();
                prop_assert_eq!(valid, populated);
                prop_assert!(valid <= entries);
                assert_consistent(&mmu);
            }
        }
    }
}
