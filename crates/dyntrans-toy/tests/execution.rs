use dyntrans_core::{GuestArch, HaltReason, Machine, MachineConfig};
use dyntrans_toy::asm::{encode, special, Asm};
use dyntrans_toy::{Toy32, Toy64, DEFAULT_EVEC};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn machine<A: GuestArch>(config: MachineConfig) -> Machine<A> {
    init_tracing();
    Machine::new(&config).unwrap()
}

fn load<A: GuestArch>(m: &mut Machine<A>, asm: &Asm) {
    m.write_physical(asm.base(), asm.bytes());
}

/// `r1 += 3` a hundred times, the adds as a fusable compressed pair.
fn counting_loop() -> Asm {
    let mut a = Asm::new(0x1000);
    a.li(1, 0).li(2, 100);
    let top = a.pc();
    a.c_addi(1, 1).c_addi(1, 2).addi(2, 2, -1).bne(2, 0, top).halt();
    a
}

#[test]
fn loop_runs_to_completion_in_every_mode() {
    let modes = [
        MachineConfig::default(),
        MachineConfig {
            cache_translations: false,
            ..MachineConfig::default()
        },
        MachineConfig {
            trace_instructions: true,
            ..MachineConfig::default()
        },
    ];
    for config in modes {
        let mut m = machine::<Toy32>(config.clone());
        load(&mut m, &counting_loop());
        m.cpu_mut(0).set_pc(0x1000);

        let summary = m.run(10_000);
        assert_eq!(summary.instructions, 2 + 100 * 4, "{config:?}");
        assert_eq!(summary.stopped, 1);
        let cpu = m.cpu(0);
        assert_eq!(cpu.regs.gpr[1], 300);
        assert_eq!(cpu.regs.gpr[2], 0);
        assert_eq!(cpu.halt_reason(), Some(&HaltReason::Requested { pc: 0x1014 }));
        m.check_consistency().unwrap();
    }
}

#[test]
fn loop_is_translated_once() {
    let mut m = machine::<Toy32>(MachineConfig::default());
    load(&mut m, &counting_loop());
    m.cpu_mut(0).set_pc(0x1000);
    m.run(10_000);

    let stats = m.cache_stats();
    assert_eq!(stats.translations, 7);
    assert_eq!(stats.allocations, 1);
    assert_eq!(stats.combinations, 1);
}

#[test]
fn budget_is_exact_across_fused_pairs() {
    for steps in 1..=40u64 {
        let mut cached = machine::<Toy32>(MachineConfig {
            poll_interval: 3,
            ..MachineConfig::default()
        });
        let mut uncached = machine::<Toy32>(MachineConfig {
            cache_translations: false,
            ..MachineConfig::default()
        });
        for m in [&mut cached, &mut uncached] {
            load(m, &counting_loop());
            m.cpu_mut(0).set_pc(0x1000);
            assert_eq!(m.run(steps).instructions, steps);
        }
        assert_eq!(cached.cpu(0).regs, uncached.cpu(0).regs, "steps={steps}");
        assert_eq!(cached.cpu(0).pc(), uncached.cpu(0).pc(), "steps={steps}");
    }
}

#[test]
fn instruction_straddling_a_page_runs_and_is_not_cached() {
    let mut a = Asm::new(0x1ff8);
    a.c_nop().c_nop().c_nop().li(1, 7);
    assert_eq!(a.pc(), 0x2002);
    a.halt();

    let mut m = machine::<Toy32>(MachineConfig::default());
    load(&mut m, &a);
    m.cpu_mut(0).set_pc(0x1ff8);

    let summary = m.run(100);
    assert_eq!(summary.instructions, 4);
    assert_eq!(m.cpu(0).regs.gpr[1], 7);
    assert_eq!(
        m.cpu(0).halt_reason(),
        Some(&HaltReason::Requested { pc: 0x2002 })
    );
    let cache = m.system().cache();
    let page = cache.lookup(0x1000).unwrap();
    assert!(cache.page(page).is_translated(2046));
    assert!(!cache.page(page).is_translated(2047));

    // Rewrite the immediate, which lives on the second page.
    m.write_physical(0x2000, &9u16.to_le_bytes());
    m.cpu_mut(0).resume();
    m.cpu_mut(0).set_pc(0x1ff8);
    m.run(100);
    assert_eq!(m.cpu(0).regs.gpr[1], 9);
    m.check_consistency().unwrap();
}

/// Counts entries in r7, records the cause in r8 and returns past a 4-byte instruction.
fn skipping_handler() -> Asm {
    let mut h = Asm::new(DEFAULT_EVEC);
    h.c_addi(7, 1)
        .mfc(8, special::CAUSE)
        .mfc(9, special::EPC)
        .addi(9, 9, 4)
        .mtc(special::EPC, 9)
        .eret();
    h
}

#[test]
fn syscall_and_reserved_instruction_enter_the_handler() {
    let mut a = Asm::new(0x1000);
    a.li(1, 5).syscall().c_addi(1, 1).c_nop().ud().halt();

    let mut m = machine::<Toy32>(MachineConfig::default());
    load(&mut m, &skipping_handler());
    load(&mut m, &a);
    m.cpu_mut(0).set_pc(0x1000);

    let summary = m.run(1000);
    assert_eq!(summary.exceptions, 2);
    assert_eq!(summary.instructions, 3 + 2 * 6);
    let regs = &m.cpu(0).regs;
    assert_eq!(regs.gpr[1], 6);
    assert_eq!(regs.gpr[7], 2);
    assert_eq!(regs.cause, 10);
    assert_eq!(
        m.cpu(0).halt_reason(),
        Some(&HaltReason::Requested { pc: 0x1010 })
    );
}

#[test]
fn interrupts_wait_for_enable() {
    let mut a = Asm::new(0x1000);
    a.ei();
    let top = a.pc();
    a.c_addi(1, 1).c_nop().j(top);
    let mut h = Asm::new(DEFAULT_EVEC);
    h.mfc(9, special::EPC).c_addi(7, 1).c_nop().eret();

    let mut m = machine::<Toy32>(MachineConfig::default());
    load(&mut m, &a);
    load(&mut m, &h);
    m.cpu_mut(0).set_pc(0x1000);
    m.run(100);

    m.cpu_mut(0).regs.irq_line = true;
    let summary = m.run(50);
    assert_eq!(summary.exceptions, 1);
    let regs = &m.cpu(0).regs;
    assert_eq!(regs.gpr[7], 1);
    assert!(!regs.irq_line);
    assert!(regs.irq_enabled);
    assert!((top..top + 8).contains(&regs.gpr[9]));

    let cpu = m.cpu_mut(0);
    cpu.regs.irq_enabled = false;
    cpu.regs.irq_line = true;
    let summary = m.run(50);
    assert_eq!(summary.exceptions, 0);
    assert!(m.cpu(0).regs.irq_line);
}

#[test]
fn unknown_opcode_halts_without_retiring() {
    let mut m = machine::<Toy32>(MachineConfig::default());
    m.write_physical(0x1000, &encode(0x30, 0, 0, 0).to_le_bytes());
    m.cpu_mut(0).set_pc(0x1000);

    let summary = m.run(10);
    assert_eq!(summary.instructions, 0);
    assert!(matches!(
        m.cpu(0).halt_reason(),
        Some(HaltReason::Unimplemented { pc: 0x1000, .. })
    ));
}

#[test]
fn fetch_outside_ram_halts() {
    let mut m = machine::<Toy32>(MachineConfig::default());
    m.cpu_mut(0).set_pc(0x4000_0000);
    m.run(10);
    assert!(matches!(
        m.cpu(0).halt_reason(),
        Some(HaltReason::ExecuteFromDevice {
            paddr: 0x4000_0000,
            ..
        })
    ));
}

fn shifted_one<A: GuestArch<Regs = dyntrans_toy::ToyRegs>>() -> (u64, u64) {
    let mut a = Asm::new(0x1000);
    a.li(0, 5).add(2, 0, 0).li(1, 1).slli(1, 1, 32).halt();
    let mut m = machine::<A>(MachineConfig::default());
    load(&mut m, &a);
    m.cpu_mut(0).set_pc(0x1000);
    m.run(100);
    let regs = &m.cpu(0).regs;
    (regs.gpr[1], regs.gpr[2])
}

#[test]
fn register_width_follows_the_variant() {
    assert_eq!(shifted_one::<Toy32>(), (0, 0));
    assert_eq!(shifted_one::<Toy64>(), (1 << 32, 0));
}
