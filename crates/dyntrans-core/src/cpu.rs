use dyntrans_mem::{Backing, PhysicalMemory};
use dyntrans_mmu::{AccessType, Lookup, Mmu};

use crate::arch::{page_mask, GuestArch, HaltReason, Trap};
use crate::cache::PhysPageId;

/// Where the dispatcher is inside the current code page.
#[derive(Debug, Clone, Default)]
pub(crate) struct DispatchState {
    /// Translation page being executed; `None` forces a lookup before the next instruction.
    pub(crate) page: Option<PhysPageId>,
    /// Virtual base of the current page.
    pub(crate) vbase: u64,
    pub(crate) slot: u32,
    pub(crate) next_slot: u32,
    /// Pending off-page control transfer.
    pub(crate) next_pc: Option<u64>,
    /// Instructions retired in the current chunk.
    pub(crate) retired: u64,
    /// Instruction budget of the current chunk.
    pub(crate) budget: u64,
    /// Cache epoch this CPU's code references belong to.
    pub(crate) epoch: u64,
}

/// One emulated processor: guest registers, its MMU and dispatch position.
pub struct Cpu<A: GuestArch> {
    id: usize,
    pub regs: A::Regs,
    pub(crate) mmu: Mmu,
    pub(crate) dispatch: DispatchState,
    halt: Option<HaltReason>,
    stopped: bool,
    instructions: u64,
    exceptions: u64,
}

impl<A: GuestArch> Cpu<A> {
    pub fn new(id: usize, tlb_entries: usize) -> Self {
        Self {
            id,
            regs: A::Regs::default(),
            mmu: Mmu::new(A::ADDRESS_WIDTH, A::PAGE_SHIFT, tlb_entries),
            dispatch: DispatchState::default(),
            halt: None,
            stopped: false,
            instructions: 0,
            exceptions: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn pc(&self) -> u64 {
        let d = &self.dispatch;
        d.vbase.wrapping_add(u64::from(d.slot) << A::INSN_SHIFT) & self.mmu.vaddr_mask()
    }

    /// Moves execution to `pc`. The next instruction goes through a full page lookup.
    pub fn set_pc(&mut self, pc: u64) {
        let pc = pc & self.mmu.vaddr_mask();
        let d = &mut self.dispatch;
        d.vbase = pc & !page_mask::<A>();
        d.slot = ((pc & page_mask::<A>()) >> A::INSN_SHIFT) as u32;
        d.next_slot = d.slot;
        d.next_pc = None;
        d.page = None;
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    /// Guest-visible TLB flush. Callers changing translation-relevant registers through
    /// [`Cpu::regs`] must call this.
    pub fn flush_tlb(&mut self) {
        self.mmu.flush();
        self.dispatch.page = None;
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.halt.is_none() && !self.stopped
    }

    pub fn halt_reason(&self) -> Option<&HaltReason> {
        self.halt.as_ref()
    }

    /// Parks the CPU without a halt reason.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Clears any halt and lets the CPU run again.
    pub fn resume(&mut self) {
        self.halt = None;
        self.stopped = false;
    }

    pub(crate) fn halt(&mut self, reason: HaltReason) {
        match &reason {
            HaltReason::Requested { .. } => {
                tracing::debug!(cpu = self.id, arch = A::NAME, %reason, "cpu halted")
            }
            _ => tracing::warn!(cpu = self.id, arch = A::NAME, %reason, "cpu halted"),
        }
        self.halt = Some(reason);
        self.dispatch.next_pc = None;
    }

    /// Instructions retired so far.
    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    /// Exceptions and interrupts delivered so far.
    pub fn exceptions(&self) -> u64 {
        self.exceptions
    }

    pub(crate) fn count(&mut self, instructions: u64, exceptions: u64) {
        self.instructions += instructions;
        self.exceptions += exceptions;
    }

    /// Hands `exception` to the guest and continues at its vector.
    pub(crate) fn deliver(&mut self, exception: A::Exception) {
        let pc = self.pc();
        tracing::trace!(cpu = self.id, pc, ?exception, "delivering exception");
        let vector = A::deliver(&mut self.regs, pc, exception);
        self.set_pc(vector);
    }

    /// Walks `vaddr` and installs the result in the TLB.
    pub(crate) fn fill(
        &mut self,
        mem: &mut PhysicalMemory,
        vaddr: u64,
        access: AccessType,
    ) -> Result<Lookup, Trap<A::Exception>> {
        let vaddr = vaddr & self.mmu.vaddr_mask();
        let walk = A::walk(&self.regs, mem, vaddr, access).map_err(Trap::Exception)?;
        let backing = mem.backing(walk.paddr >> A::PAGE_SHIFT);
        let store_ok = match backing {
            Backing::Ram(page) => !mem.has_code(page),
            Backing::Slow => false,
        };
        self.mmu
            .insert(vaddr, &walk, backing, store_ok)
            .lookup(access)
            .ok_or(Trap::Halt(HaltReason::InconsistentWalk { vaddr, access }))
    }

    /// Fast-path lookup falling back to a walk.
    #[inline]
    pub(crate) fn translate(
        &mut self,
        mem: &mut PhysicalMemory,
        vaddr: u64,
        access: AccessType,
    ) -> Result<Lookup, Trap<A::Exception>> {
        match self.mmu.lookup(vaddr, access) {
            Some(l) => Ok(l),
            None => self.fill(mem, vaddr, access),
        }
    }
}

impl<A: GuestArch> core::fmt::Debug for Cpu<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.id)
            .field("pc", &format_args!("{:#x}", self.pc()))
            .field("regs", &self.regs)
            .field("halt", &self.halt)
            .field("instructions", &self.instructions)
            .finish()
    }
}
