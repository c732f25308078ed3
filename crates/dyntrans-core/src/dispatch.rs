//! The dispatch loop and the core-internal handlers that live in every translation page.
//!
//! A CPU executes by calling the handler in slot `slot` of its current translation page. Slots
//! that were never decoded hold [`to_be_translated`]; the slot after the last instruction holds
//! [`end_of_page`]. Neither counts as a retired instruction on its own. With caching disabled no
//! translation page is ever entered and every instruction is decoded where it stands.

use dyntrans_mmu::AccessType;

use crate::arch::{
    page_mask, page_size, slots_per_page, DecodeError, ExecResult, GuestArch, HaltReason,
    InstructionCall, Trap, IC_ARGS,
};
use crate::cache::TranslateError;
use crate::cpu::Cpu;
use crate::exec::Exec;
use crate::invalidate;
use crate::machine::System;

const MAX_FETCH: usize = 32;

pub(crate) fn untranslated<A: GuestArch>() -> InstructionCall<A> {
    InstructionCall::new(to_be_translated::<A>, [0; IC_ARGS], 0)
}

pub(crate) fn end_of_page<A: GuestArch>() -> InstructionCall<A> {
    InstructionCall::new(end_of_page_handler::<A>, [0; IC_ARGS], 0)
}

fn unimplemented<E>(pc: u64, source: DecodeError) -> Trap<E> {
    Trap::Halt(HaltReason::Unimplemented { pc, source })
}

/// Decodes the instruction at the current pc, caching it when possible, then runs it.
fn to_be_translated<A: GuestArch>(exec: &mut Exec<'_, A>, _args: &[u64; IC_ARGS]) -> ExecResult<A> {
    let pc = exec.pc();
    let Some(page) = exec.cpu.dispatch.page else {
        return Ok(());
    };
    let paddr =
        exec.sys.cache.page(page).paddr() | (u64::from(exec.cpu.dispatch.slot) << A::INSN_SHIFT);

    match exec.sys.cache.get_or_translate(&exec.sys.mem, paddr) {
        Ok(t) => {
            debug_assert!(!t.flushed, "translation evicted its own page");
            if t.first_on_page {
                invalidate::first_translation(exec.cpu, exec.sys, paddr >> A::PAGE_SHIFT);
            }
            return run_decoded(exec, t.call);
        }
        Err(TranslateError::CrossesPage { .. }) => {}
        Err(TranslateError::Decode(e)) => return Err(unimplemented(pc, e)),
        Err(TranslateError::NotRam { paddr }) => {
            return Err(Trap::Halt(HaltReason::ExecuteFromDevice { pc, paddr }))
        }
    }

    let call = decode_uncached(exec, pc, paddr)?;
    run_decoded(exec, call)
}

/// Decodes without touching the cache, pulling bytes from the next page if the instruction needs
/// them.
fn decode_uncached<A: GuestArch>(
    exec: &mut Exec<'_, A>,
    pc: u64,
    paddr: u64,
) -> Result<InstructionCall<A>, Trap<A::Exception>> {
    debug_assert!(A::MAX_INSN_LEN <= MAX_FETCH);
    let off = (paddr & page_mask::<A>()) as usize;
    let in_page = (page_size::<A>() as usize - off).min(A::MAX_INSN_LEN);
    let mut buf = [0u8; MAX_FETCH];
    exec.sys.mem.read_physical(paddr, &mut buf[..in_page]);

    let decoded = match A::decode(&buf[..in_page], off) {
        Ok(d) => d,
        Err(DecodeError::Truncated { .. }) if in_page < A::MAX_INSN_LEN => {
            for i in in_page..A::MAX_INSN_LEN {
                buf[i] = fetch_byte(exec, pc.wrapping_add(i as u64))?;
            }
            A::decode(&buf[..A::MAX_INSN_LEN], off).map_err(|e| unimplemented(pc, e))?
        }
        Err(e) => return Err(unimplemented(pc, e)),
    };
    Ok(InstructionCall::new(
        decoded.handler,
        decoded.args,
        (decoded.bytes >> A::INSN_SHIFT) as u8,
    ))
}

fn fetch_byte<A: GuestArch>(exec: &mut Exec<'_, A>, vaddr: u64) -> Result<u8, Trap<A::Exception>> {
    let l = exec.cpu.translate(&mut exec.sys.mem, vaddr, AccessType::Execute)?;
    let paddr = (l.ppn << A::PAGE_SHIFT) | (vaddr & page_mask::<A>());
    let mut b = [0u8; 1];
    exec.sys.mem.read_physical(paddr, &mut b);
    Ok(b[0])
}

/// Sets up fall-through for a freshly decoded instruction and executes it.
fn run_decoded<A: GuestArch>(exec: &mut Exec<'_, A>, call: InstructionCall<A>) -> ExecResult<A> {
    let d = &mut exec.cpu.dispatch;
    let next = d.slot + u32::from(call.len);
    if next as usize > slots_per_page::<A>() {
        d.next_pc = Some(d.vbase.wrapping_add(u64::from(next) << A::INSN_SHIFT));
    } else {
        d.next_slot = next;
    }
    exec.retire(1);
    (call.handler)(exec, &call.args)
}

fn end_of_page_handler<A: GuestArch>(exec: &mut Exec<'_, A>, _args: &[u64; IC_ARGS]) -> ExecResult<A> {
    let next = exec.cpu.dispatch.vbase.wrapping_add(page_size::<A>());
    exec.cpu.dispatch.next_pc = Some(next);
    Ok(())
}

/// Finds the translation page for the current pc and makes it current.
fn enter_page<A: GuestArch>(
    cpu: &mut Cpu<A>,
    sys: &mut System<A>,
) -> Result<crate::cache::PhysPageId, Trap<A::Exception>> {
    invalidate::sync_epoch(cpu, sys);
    let pc = cpu.pc();
    let l = cpu.translate(&mut sys.mem, pc, AccessType::Execute)?;
    if l.host.is_none() {
        let paddr = (l.ppn << A::PAGE_SHIFT) | (pc & page_mask::<A>());
        return Err(Trap::Halt(HaltReason::ExecuteFromDevice { pc, paddr }));
    }

    let id = match l.code {
        Some(id) => id,
        None => {
            let (id, flushed) = sys.cache.get_or_alloc(l.ppn << A::PAGE_SHIFT);
            if flushed {
                invalidate::after_full_flush(cpu, sys);
            }
            cpu.mmu.attach_code(pc, id);
            id
        }
    };
    debug_assert_eq!(
        sys.cache.page(id).paddr(),
        l.ppn << A::PAGE_SHIFT,
        "stale translation page for pc {pc:#x}"
    );

    let d = &mut cpu.dispatch;
    d.page = Some(id);
    d.vbase = pc & !page_mask::<A>();
    Ok(id)
}

/// Fetches, decodes and runs the instruction at the current pc without a translation page.
fn step_uncached<A: GuestArch>(cpu: &mut Cpu<A>, sys: &mut System<A>) -> ExecResult<A> {
    let pc = cpu.pc();
    let l = cpu.translate(&mut sys.mem, pc, AccessType::Execute)?;
    let paddr = (l.ppn << A::PAGE_SHIFT) | (pc & page_mask::<A>());
    if l.host.is_none() {
        return Err(Trap::Halt(HaltReason::ExecuteFromDevice { pc, paddr }));
    }
    if sys.trace {
        tracing::trace!(
            target: "dyntrans::insn",
            cpu = cpu.id(),
            pc = format_args!("{pc:#x}"),
        );
    }
    let mut exec = Exec::new(cpu, sys);
    let call = decode_uncached(&mut exec, pc, paddr)?;
    run_decoded(&mut exec, call)
}

/// Runs up to `budget` instructions without polling for interrupts. Returns the number of steps
/// taken: retired instructions plus delivered exceptions.
fn run_chunk<A: GuestArch>(cpu: &mut Cpu<A>, sys: &mut System<A>, budget: u64) -> u64 {
    let per_page = slots_per_page::<A>();
    cpu.dispatch.retired = 0;
    cpu.dispatch.budget = budget;
    let mut exceptions = 0u64;

    while cpu.dispatch.retired + exceptions < budget {
        if !sys.cache_translations {
            let before = cpu.dispatch.retired;
            match step_uncached(cpu, sys) {
                Ok(()) => {
                    let d = &cpu.dispatch;
                    let next = d.next_pc.unwrap_or_else(|| {
                        d.vbase.wrapping_add(u64::from(d.next_slot) << A::INSN_SHIFT)
                    });
                    cpu.set_pc(next);
                }
                Err(Trap::Exception(e)) => {
                    cpu.dispatch.retired = before;
                    cpu.deliver(e);
                    exceptions += 1;
                }
                Err(Trap::Halt(reason)) => {
                    cpu.dispatch.retired = before;
                    cpu.halt(reason);
                    break;
                }
            }
            continue;
        }

        let page = match cpu.dispatch.page {
            Some(page) => page,
            None => match enter_page(cpu, sys) {
                Ok(page) => page,
                Err(Trap::Exception(e)) => {
                    cpu.deliver(e);
                    exceptions += 1;
                    continue;
                }
                Err(Trap::Halt(reason)) => {
                    cpu.halt(reason);
                    break;
                }
            },
        };

        let slot = cpu.dispatch.slot;
        let call = sys.cache.call(page, slot as usize);
        if sys.trace && (slot as usize) < per_page {
            tracing::trace!(
                target: "dyntrans::insn",
                cpu = cpu.id(),
                pc = format_args!("{:#x}", cpu.pc()),
                handler = ?call,
            );
        }

        let before = cpu.dispatch.retired;
        cpu.dispatch.next_slot = slot + u32::from(call.len);
        cpu.dispatch.retired += u64::from(call.len != 0);

        match (call.handler)(&mut Exec::new(cpu, sys), &call.args) {
            Ok(()) => {
                let d = &mut cpu.dispatch;
                match d.next_pc.take() {
                    Some(target) => cpu.set_pc(target),
                    None => d.slot = d.next_slot,
                }
            }
            Err(Trap::Exception(e)) => {
                cpu.dispatch.retired = before;
                cpu.deliver(e);
                exceptions += 1;
            }
            Err(Trap::Halt(reason)) => {
                cpu.dispatch.retired = before;
                cpu.halt(reason);
                break;
            }
        }
    }

    let retired = cpu.dispatch.retired;
    cpu.count(retired, exceptions);
    retired + exceptions
}

/// Runs `cpu` for up to `budget` steps, polling for interrupts every `poll_interval`.
pub(crate) fn run<A: GuestArch>(cpu: &mut Cpu<A>, sys: &mut System<A>, budget: u64) -> u64 {
    let mut steps = 0;
    while steps < budget && cpu.is_running() {
        if let Some(irq) = A::pending_interrupt(&cpu.regs) {
            cpu.deliver(irq);
            cpu.count(0, 1);
            steps += 1;
            continue;
        }
        let chunk = if sys.trace {
            1
        } else {
            sys.poll_interval.min(budget - steps)
        };
        steps += run_chunk(cpu, sys, chunk);
    }
    steps
}
