use dyntrans_mem::PhysicalMemory;
use dyntrans_mmu::AccessType;

use crate::arch::{page_mask, page_size, GuestArch, HaltReason, Trap};
use crate::cpu::Cpu;
use crate::invalidate;
use crate::machine::System;

/// Context handed to instruction handlers.
///
/// Memory accesses go through the CPU's fast-path table and fall back to a page walk and the
/// slow physical path when needed. Control transfers are recorded here and applied by the
/// dispatcher once the handler returns.
pub struct Exec<'a, A: GuestArch> {
    pub(crate) cpu: &'a mut Cpu<A>,
    pub(crate) sys: &'a mut System<A>,
}

impl<'a, A: GuestArch> Exec<'a, A> {
    pub(crate) fn new(cpu: &'a mut Cpu<A>, sys: &'a mut System<A>) -> Self {
        Self { cpu, sys }
    }

    #[inline]
    pub fn cpu_id(&self) -> usize {
        self.cpu.id()
    }

    #[inline]
    pub fn regs(&self) -> &A::Regs {
        &self.cpu.regs
    }

    #[inline]
    pub fn regs_mut(&mut self) -> &mut A::Regs {
        &mut self.cpu.regs
    }

    /// Address of the executing instruction.
    #[inline]
    pub fn pc(&self) -> u64 {
        self.cpu.pc()
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.sys.mem
    }

    /// Loads `size` bytes (1..=8) at `vaddr`, zero-extended.
    pub fn load(&mut self, vaddr: u64, size: usize) -> Result<u64, Trap<A::Exception>> {
        debug_assert!((1..=8).contains(&size), "load of {size} bytes");
        let vaddr = vaddr & self.cpu.mmu.vaddr_mask();
        let off = (vaddr & page_mask::<A>()) as usize;
        if off + size > page_size::<A>() as usize {
            return self.load_split(vaddr, size);
        }

        let l = self.cpu.translate(&mut self.sys.mem, vaddr, AccessType::Read)?;
        match l.host {
            Some(page) => Ok(A::BYTE_ORDER.load(&self.sys.mem.page(page)[off..off + size])),
            None => {
                let mut buf = [0u8; 8];
                let paddr = (l.ppn << A::PAGE_SHIFT) | off as u64;
                self.sys.mem.read_physical(paddr, &mut buf[..size]);
                Ok(A::BYTE_ORDER.load(&buf[..size]))
            }
        }
    }

    fn load_split(&mut self, vaddr: u64, size: usize) -> Result<u64, Trap<A::Exception>> {
        let mut buf = [0u8; 8];
        for (i, b) in buf[..size].iter_mut().enumerate() {
            *b = self.load(vaddr.wrapping_add(i as u64), 1)? as u8;
        }
        Ok(A::BYTE_ORDER.load(&buf[..size]))
    }

    /// Stores the low `size` bytes (1..=8) of `value` at `vaddr`.
    pub fn store(&mut self, vaddr: u64, size: usize, value: u64) -> Result<(), Trap<A::Exception>> {
        debug_assert!((1..=8).contains(&size), "store of {size} bytes");
        let vaddr = vaddr & self.cpu.mmu.vaddr_mask();
        let mut buf = [0u8; 8];
        A::BYTE_ORDER.store(value, &mut buf[..size]);

        let off = (vaddr & page_mask::<A>()) as usize;
        if off + size > page_size::<A>() as usize {
            for (i, &b) in buf[..size].iter().enumerate() {
                self.store(vaddr.wrapping_add(i as u64), 1, u64::from(b))?;
            }
            return Ok(());
        }

        let l = self.cpu.translate(&mut self.sys.mem, vaddr, AccessType::Write)?;
        match l.host {
            Some(page) => {
                self.sys.mem.page_mut(page)[off..off + size].copy_from_slice(&buf[..size]);
            }
            None => {
                let paddr = (l.ppn << A::PAGE_SHIFT) | off as u64;
                self.sys.mem.write_physical(paddr, &buf[..size]);
                invalidate::drain_code_writes(self.cpu, self.sys);
                self.restore_store_path(vaddr);
            }
        }
        Ok(())
    }

    /// After a slow store, lets later stores to a code-free RAM page take the direct path again.
    fn restore_store_path(&mut self, vaddr: u64) {
        if let Some(page) = self.cpu.mmu.slot(vaddr).host_load {
            if !self.sys.mem.has_code(page) {
                self.cpu.mmu.allow_store(vaddr);
            }
        }
    }

    /// Continues execution at `target` after this instruction.
    #[inline]
    pub fn jump(&mut self, target: u64) {
        let target = target & self.cpu.mmu.vaddr_mask();
        let d = &mut self.cpu.dispatch;
        if d.page.is_some() && target & !page_mask::<A>() == d.vbase {
            d.next_slot = ((target & page_mask::<A>()) >> A::INSN_SHIFT) as u32;
            d.next_pc = None;
        } else {
            d.next_pc = Some(target);
        }
    }

    /// Skips `slots` extra instruction slots after this instruction. Used by fused handlers.
    #[inline]
    pub fn skip_slots(&mut self, slots: u32) {
        self.cpu.dispatch.next_slot += slots;
    }

    /// Accounts for `n` extra retired instructions.
    #[inline]
    pub fn retire(&mut self, n: u64) {
        self.cpu.dispatch.retired += n;
    }

    /// Instructions the dispatcher may still retire in this chunk, not counting the current one.
    #[inline]
    pub fn budget_left(&self) -> u64 {
        let d = &self.cpu.dispatch;
        d.budget.saturating_sub(d.retired)
    }

    pub fn flush_tlb(&mut self) {
        self.cpu.flush_tlb();
    }

    /// Drops this CPU's mappings for virtual addresses in `[start, end)`. If the executing page
    /// is among them, the next instruction is fetched through a fresh walk.
    pub fn invalidate_tlb_range(&mut self, start: u64, end: u64) {
        invalidate::invalidate_range(self.cpu, start, end);
    }

    /// Drops all translations of the physical page containing `paddr` on every CPU.
    pub fn invalidate_code(&mut self, paddr: u64) {
        invalidate::invalidate_ppn(self.cpu, self.sys, paddr >> A::PAGE_SHIFT);
    }

    /// Trap that stops this CPU.
    pub fn halt(&self) -> Trap<A::Exception> {
        Trap::Halt(HaltReason::Requested { pc: self.pc() })
    }
}
