//! Keeps translations coherent with guest memory.
//!
//! The rules:
//! - The first translation on a physical page marks the frame as code and removes every direct
//!   store path to it, so later writes take the slow path.
//! - A slow-path write to a code frame drops the page's translations and every CPU's reference to
//!   that translation page.
//! - Work that affects other CPUs is queued on the [`System`] and applied by the machine before
//!   any other CPU runs again.

use crate::arch::{page_mask, GuestArch};
use crate::cpu::Cpu;
use crate::machine::System;

/// What to invalidate through [`crate::Machine::invalidate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidateScope {
    /// Translations of the physical page containing this address.
    PhysPage(u64),
    /// Every translation on every page.
    All,
    /// TLB mappings intersecting `[start, end)` on every CPU.
    VirtualRange { start: u64, end: u64 },
}

/// Work queued for the CPUs that were not running when it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Propagation {
    RevokeStore(u64),
    DetachCode(u64),
}

pub(crate) fn first_translation<A: GuestArch>(cpu: &mut Cpu<A>, sys: &mut System<A>, ppn: u64) {
    if let Some(page) = sys.mem.frame_of(ppn) {
        sys.mem.mark_code(page);
    }
    cpu.mmu.revoke_store(ppn);
    sys.pending.push(Propagation::RevokeStore(ppn));
    tracing::trace!(cpu = cpu.id(), ppn, "page now holds translations");
}

/// Drops `cpu`'s references to the translation page of `ppn`, including the one it is executing.
pub(crate) fn detach<A: GuestArch>(cpu: &mut Cpu<A>, sys: &System<A>, ppn: u64) {
    cpu.mmu.detach_code(ppn);
    if let Some(id) = cpu.dispatch.page {
        if !sys.cache.is_live(id) || sys.cache.page(id).paddr() >> A::PAGE_SHIFT == ppn {
            cpu.dispatch.page = None;
        }
    }
}

/// Invalidates the translations of `ppn` for `cpu` now and for everyone else via the queue.
pub(crate) fn invalidate_ppn<A: GuestArch>(cpu: &mut Cpu<A>, sys: &mut System<A>, ppn: u64) {
    sys.cache.invalidate_paddr(ppn << A::PAGE_SHIFT);
    if let Some(page) = sys.mem.frame_of(ppn) {
        sys.mem.clear_code(page);
    }
    detach(cpu, sys, ppn);
    sys.pending.push(Propagation::DetachCode(ppn));
}

/// Handles every code frame written since the last call.
pub(crate) fn drain_code_writes<A: GuestArch>(cpu: &mut Cpu<A>, sys: &mut System<A>) {
    if !sys.mem.has_code_writes() {
        return;
    }
    for ppn in sys.mem.take_code_writes() {
        tracing::trace!(cpu = cpu.id(), ppn, "write to translated page");
        invalidate_ppn(cpu, sys, ppn);
    }
}

/// Handles code frames written by a non-CPU agent.
pub(crate) fn drain_external_writes<A: GuestArch>(cpus: &mut [Cpu<A>], sys: &mut System<A>) {
    for ppn in sys.mem.take_code_writes() {
        sys.cache.invalidate_paddr(ppn << A::PAGE_SHIFT);
        for cpu in cpus.iter_mut() {
            detach(cpu, sys, ppn);
        }
    }
}

/// Called when allocating a translation page flushed the whole cache.
pub(crate) fn after_full_flush<A: GuestArch>(cpu: &mut Cpu<A>, sys: &mut System<A>) {
    sys.mem.clear_all_code();
    sync_epoch(cpu, sys);
}

/// Drops stale references if the cache was flushed since `cpu` last looked.
pub(crate) fn sync_epoch<A: GuestArch>(cpu: &mut Cpu<A>, sys: &System<A>) {
    let epoch = sys.cache.epoch();
    if cpu.dispatch.epoch != epoch {
        cpu.mmu.detach_all_code();
        cpu.dispatch.page = None;
        cpu.dispatch.epoch = epoch;
    }
}

/// Applies queued work to a CPU that did not originate it.
pub(crate) fn apply<A: GuestArch>(cpu: &mut Cpu<A>, sys: &System<A>, work: Propagation) {
    match work {
        Propagation::RevokeStore(ppn) => {
            cpu.mmu.revoke_store(ppn);
        }
        Propagation::DetachCode(ppn) => detach(cpu, sys, ppn),
    }
}

/// Flushes the cache and every CPU's references to it.
pub(crate) fn invalidate_all<A: GuestArch>(cpus: &mut [Cpu<A>], sys: &mut System<A>) {
    sys.cache.flush();
    sys.mem.clear_all_code();
    for cpu in cpus.iter_mut() {
        sync_epoch(cpu, sys);
    }
    tracing::debug!(epoch = sys.cache.epoch(), "translation cache flushed");
}

/// Drops `cpu`'s mappings intersecting `[start, end)`, including the page it is executing.
pub(crate) fn invalidate_range<A: GuestArch>(cpu: &mut Cpu<A>, start: u64, end: u64) {
    cpu.mmu.invalidate_range(start, end);
    let vbase = cpu.dispatch.vbase;
    if vbase < end && start <= vbase | page_mask::<A>() {
        cpu.dispatch.page = None;
    }
}

pub(crate) fn invalidate_virtual<A: GuestArch>(cpus: &mut [Cpu<A>], start: u64, end: u64) {
    for cpu in cpus.iter_mut() {
        invalidate_range(cpu, start, end);
    }
}
