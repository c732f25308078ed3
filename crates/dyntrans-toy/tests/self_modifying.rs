use dyntrans_core::{HaltReason, Machine, MachineConfig, TranslationCache};
use dyntrans_toy::asm::{encode, op, Asm};
use dyntrans_toy::Toy32;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn machine(config: MachineConfig) -> Machine<Toy32> {
    init_tracing();
    Machine::new(&config).unwrap()
}

fn load(m: &mut Machine<Toy32>, asm: &Asm) {
    m.write_physical(asm.base(), asm.bytes());
}

/// Runs the instruction at 0x1020, overwrites it with `li r1, 42` and runs it again.
fn patching_program() -> Asm {
    let mut a = Asm::new(0x1000);
    a.li(4, 0x1800)
        .lw(3, 4, 0)
        .li(2, 0x1020)
        .j(0x1020)
        .sw(3, 2, 0)
        .j(0x1020)
        .pad_to(0x1020)
        .li(1, 1)
        .bne(5, 0, 0x1030)
        .li(5, 1)
        .j(0x1010)
        .halt();
    assert_eq!(a.pc(), 0x1034);
    a
}

#[test]
fn store_over_translated_code_takes_effect() {
    for cache_translations in [true, false] {
        let mut m = machine(MachineConfig {
            cache_translations,
            ..MachineConfig::default()
        });
        load(&mut m, &patching_program());
        m.write_physical(0x1800, &encode(op::LI, 1, 0, 42).to_le_bytes());
        m.cpu_mut(0).set_pc(0x1000);

        let summary = m.run(1000);
        assert_eq!(summary.instructions, 12);
        assert_eq!(m.cpu(0).regs.gpr[1], 42, "cache_translations={cache_translations}");
        assert_eq!(
            m.cpu(0).halt_reason(),
            Some(&HaltReason::Requested { pc: 0x1030 })
        );
        m.check_consistency().unwrap();
    }
}

#[test]
fn code_page_loses_its_direct_store_path() {
    let mut m = machine(MachineConfig::default());
    load(&mut m, &patching_program());
    m.write_physical(0x1800, &encode(op::LI, 1, 0, 42).to_le_bytes());
    m.cpu_mut(0).set_pc(0x1000);
    m.run(1000);

    let frame = m.memory().frame_of(1).unwrap();
    assert!(m.memory().has_code(frame));
    assert!(m.cache_stats().page_invalidations >= 1);
    let slot = m.cpu(0).mmu().slot(0x1000);
    assert!(slot.host_store.is_none());
}

#[test]
fn host_write_to_data_keeps_translations() {
    let mut a = Asm::new(0x1000);
    a.li(2, 0x5000).lw(1, 2, 0).halt();
    let mut m = machine(MachineConfig::default());
    load(&mut m, &a);
    m.cpu_mut(0).set_pc(0x1000);
    m.run(100);

    m.write_physical(0x5000, &7u32.to_le_bytes());
    m.cpu_mut(0).resume();
    m.cpu_mut(0).set_pc(0x1000);
    m.run(100);
    assert_eq!(m.cpu(0).regs.gpr[1], 7);
    assert_eq!(m.cache_stats().page_invalidations, 0);
    assert_eq!(m.cache_stats().translations, 3);
}

#[test]
fn guest_invalidation_drops_its_own_page() {
    let mut a = Asm::new(0x1000);
    a.li(2, 0x1000).li(3, 3);
    let top = a.pc();
    a.c_addi(1, 1).c_nop().icinv(2).bne(1, 3, top).halt();
    let halt = a.pc() - 4;

    let mut m = machine(MachineConfig::default());
    load(&mut m, &a);
    m.cpu_mut(0).set_pc(0x1000);
    m.run(1000);

    assert_eq!(m.cpu(0).regs.gpr[1], 3);
    assert_eq!(
        m.cpu(0).halt_reason(),
        Some(&HaltReason::Requested { pc: halt })
    );
    assert_eq!(m.cache_stats().page_invalidations, 3);
    m.check_consistency().unwrap();
}

#[test]
fn other_cpu_patches_a_running_loop() {
    let mut m = machine(MachineConfig {
        cpus: 2,
        slice_instructions: 10,
        ..MachineConfig::default()
    });
    let mut spin = Asm::new(0x1000);
    spin.c_addi(1, 1).c_nop().j(0x1000);
    let mut patcher = Asm::new(0x3000);
    patcher
        .li(5, encode(op::HALT, 0, 0, 0) as i16)
        .li(6, 0x1004)
        .li(7, 20);
    let wait = patcher.pc();
    patcher.addi(7, 7, -1).bne(7, 0, wait).sw(5, 6, 0).halt();
    load(&mut m, &spin);
    load(&mut m, &patcher);
    m.cpu_mut(0).set_pc(0x1000);
    m.cpu_mut(1).set_pc(0x3000);

    let summary = m.run(100_000);
    assert_eq!(summary.stopped, 2);
    assert_eq!(
        m.cpu(0).halt_reason(),
        Some(&HaltReason::Requested { pc: 0x1004 })
    );
    assert_eq!(
        m.cpu(1).halt_reason(),
        Some(&HaltReason::Requested { pc: patcher.pc() - 4 })
    );
    assert!(m.cpu(0).regs.gpr[1] >= 10);
    m.check_consistency().unwrap();
}

#[test]
fn cpus_share_translations() {
    let mut m = machine(MachineConfig {
        cpus: 3,
        slice_instructions: 7,
        ..MachineConfig::default()
    });
    let mut a = Asm::new(0x1000);
    a.li(2, 50);
    let top = a.pc();
    a.addi(2, 2, -1).bne(2, 0, top).halt();
    load(&mut m, &a);
    for id in 0..3 {
        m.cpu_mut(id).set_pc(0x1000);
    }

    let summary = m.run(100_000);
    assert_eq!(summary.stopped, 3);
    assert_eq!(summary.instructions, 3 * (1 + 50 * 2));
    assert_eq!(m.cache_stats().allocations, 1);
    assert_eq!(m.cache_stats().translations, 4);
}

#[test]
fn exhausted_cache_flushes_and_keeps_running() {
    let record = TranslationCache::<Toy32>::record_bytes();
    let run = |cache_bytes: usize, cache_translations: bool| {
        let mut m = machine(MachineConfig {
            cache_bytes,
            cache_translations,
            ..MachineConfig::default()
        });
        for page in 1..=3u64 {
            let mut a = Asm::new(page << 12);
            a.c_addi(1, page as i16).c_nop().j(((page % 3) + 1) << 12);
            load(&mut m, &a);
        }
        m.cpu_mut(0).set_pc(0x1000);
        m.run(300);
        m
    };

    let small = run(record * 3, true);
    let reference = run(record * 3, false);
    assert_eq!(small.cpu(0).regs, reference.cpu(0).regs);
    assert!(small.cache_stats().full_flushes >= 1);
    assert!(small.system().cache().live_pages() <= small.system().cache().capacity());
    small.check_consistency().unwrap();
}
