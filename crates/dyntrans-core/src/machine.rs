use std::sync::Arc;

use dyntrans_mem::{MemoryError, MmioHandler, PhysicalMemory};
use dyntrans_mmu::MmuStats;
use thiserror::Error;

use crate::arch::GuestArch;
use crate::cache::{CacheStats, PageFlags, TranslationCache};
use crate::config::{ConfigError, MachineConfig};
use crate::cpu::Cpu;
use crate::dispatch;
use crate::invalidate::{self, InvalidateScope, Propagation};

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// A broken cross-structure invariant found by [`Machine::check_consistency`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    #[error("cpu {cpu}: vaddr 0x{vaddr:x} refers to translation page {page} which is not live")]
    DeadCode { cpu: usize, vaddr: u64, page: u32 },

    #[error("cpu {cpu}: vaddr 0x{vaddr:x} maps 0x{expected:x} but its translation page is for 0x{found:x}")]
    StaleCode {
        cpu: usize,
        vaddr: u64,
        expected: u64,
        found: u64,
    },

    #[error("cpu {cpu}: vaddr 0x{vaddr:x} has a direct store path into a frame holding translations")]
    StoreIntoCode { cpu: usize, vaddr: u64 },

    #[error("translation page for 0x{paddr:x} holds translations but its frame is not marked as code")]
    UnmarkedCode { paddr: u64 },
}

/// State shared by all CPUs: physical memory, the translation cache and queued coherence work.
pub struct System<A: GuestArch> {
    pub(crate) mem: PhysicalMemory,
    pub(crate) cache: TranslationCache<A>,
    pub(crate) pending: Vec<Propagation>,
    pub(crate) poll_interval: u64,
    pub(crate) cache_translations: bool,
    pub(crate) trace: bool,
}

impl<A: GuestArch> System<A> {
    pub fn memory(&self) -> &PhysicalMemory {
        &self.mem
    }

    pub fn cache(&self) -> &TranslationCache<A> {
        &self.cache
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub instructions: u64,
    pub exceptions: u64,
    /// CPUs not running when the call returned.
    pub stopped: usize,
}

/// A set of CPUs sharing one physical address space, executed round-robin on the calling thread.
pub struct Machine<A: GuestArch> {
    cpus: Vec<Cpu<A>>,
    sys: System<A>,
    slice: u64,
}

impl<A: GuestArch> Machine<A> {
    pub fn new(config: &MachineConfig) -> Result<Self, MachineError> {
        config.validate(A::PAGE_SHIFT)?;

        let mut mem = PhysicalMemory::new(A::PAGE_SHIFT);
        mem.add_ram(config.ram_base, config.ram_bytes)?;
        let cache = TranslationCache::new(config.cache_bytes)?;
        let cpus = (0..config.cpus)
            .map(|id| Cpu::new(id, config.tlb_entries))
            .collect();

        tracing::debug!(
            arch = A::NAME,
            cpus = config.cpus,
            ram_bytes = config.ram_bytes,
            cache_pages = cache.capacity(),
            cache_translations = config.cache_translations,
            "machine created"
        );
        Ok(Self {
            cpus,
            sys: System {
                mem,
                cache,
                pending: Vec::new(),
                poll_interval: config.poll_interval,
                cache_translations: config.cache_translations,
                trace: config.trace_instructions,
            },
            slice: config.slice_instructions,
        })
    }

    pub fn cpus(&self) -> &[Cpu<A>] {
        &self.cpus
    }

    #[track_caller]
    pub fn cpu(&self, id: usize) -> &Cpu<A> {
        &self.cpus[id]
    }

    #[track_caller]
    pub fn cpu_mut(&mut self, id: usize) -> &mut Cpu<A> {
        &mut self.cpus[id]
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.sys.mem
    }

    pub fn system(&self) -> &System<A> {
        &self.sys
    }

    pub fn map_mmio(
        &mut self,
        base: u64,
        len: u64,
        handler: Arc<dyn MmioHandler>,
    ) -> Result<(), MemoryError> {
        self.sys.mem.map_mmio(base, len, handler)
    }

    /// Writes guest physical memory on behalf of a device or loader, dropping any translations
    /// the write makes stale.
    pub fn write_physical(&mut self, paddr: u64, data: &[u8]) {
        self.sys.mem.write_physical(paddr, data);
        invalidate::drain_external_writes(&mut self.cpus, &mut self.sys);
    }

    pub fn read_physical(&self, paddr: u64, buf: &mut [u8]) {
        self.sys.mem.read_physical(paddr, buf);
    }

    pub fn invalidate(&mut self, scope: InvalidateScope) {
        match scope {
            InvalidateScope::PhysPage(paddr) => {
                let ppn = paddr >> A::PAGE_SHIFT;
                self.sys.cache.invalidate_paddr(paddr);
                if let Some(page) = self.sys.mem.frame_of(ppn) {
                    self.sys.mem.clear_code(page);
                }
                for cpu in self.cpus.iter_mut() {
                    invalidate::detach(cpu, &self.sys, ppn);
                }
            }
            InvalidateScope::All => invalidate::invalidate_all(&mut self.cpus, &mut self.sys),
            InvalidateScope::VirtualRange { start, end } => {
                invalidate::invalidate_virtual(&mut self.cpus, start, end)
            }
        }
    }

    /// Runs every CPU round-robin until `max_steps` instructions and exception deliveries have
    /// happened in total or no CPU is running.
    pub fn run(&mut self, max_steps: u64) -> RunSummary {
        let before: Vec<(u64, u64)> = self
            .cpus
            .iter()
            .map(|c| (c.instructions(), c.exceptions()))
            .collect();

        let mut remaining = max_steps;
        while remaining > 0 {
            let mut progressed = false;
            for i in 0..self.cpus.len() {
                if remaining == 0 {
                    break;
                }
                let cpu = &mut self.cpus[i];
                if !cpu.is_running() {
                    continue;
                }
                let steps = dispatch::run(cpu, &mut self.sys, remaining.min(self.slice));
                remaining -= steps.min(remaining);
                progressed = true;
                self.propagate(i);
            }
            if !progressed {
                break;
            }
        }

        let mut summary = RunSummary::default();
        for (cpu, (instructions, exceptions)) in self.cpus.iter().zip(before) {
            summary.instructions += cpu.instructions() - instructions;
            summary.exceptions += cpu.exceptions() - exceptions;
            summary.stopped += usize::from(!cpu.is_running());
        }
        summary
    }

    /// Applies work queued by CPU `origin` to every other CPU.
    fn propagate(&mut self, origin: usize) {
        let pending = std::mem::take(&mut self.sys.pending);
        for (i, cpu) in self.cpus.iter_mut().enumerate() {
            if i != origin {
                for &work in &pending {
                    invalidate::apply(cpu, &self.sys, work);
                }
            }
            invalidate::sync_epoch(cpu, &self.sys);
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.sys.cache.stats()
    }

    /// TLB counters of CPU `cpu`; `None` for an unknown CPU or without the `stats` feature.
    pub fn mmu_stats(&self, cpu: usize) -> Option<MmuStats> {
        self.cpus.get(cpu)?.mmu.stats()
    }

    /// Cross-checks the TLBs, the translation cache and the code marks.
    pub fn check_consistency(&self) -> Result<(), ConsistencyError> {
        let cache = &self.sys.cache;
        for cpu in &self.cpus {
            let stale_epoch = cpu.dispatch.epoch != cache.epoch();
            for e in cpu.mmu.tlb_entries().iter().filter(|e| e.valid) {
                let vaddr = e.vaddr_page << A::PAGE_SHIFT;
                let slot = cpu.mmu.slot(vaddr);
                if let Some(page) = slot.host_store {
                    if self.sys.mem.has_code(page) {
                        return Err(ConsistencyError::StoreIntoCode { cpu: cpu.id(), vaddr });
                    }
                }
                let Some(code) = slot.code else { continue };
                if stale_epoch || !cache.is_live(code) {
                    return Err(ConsistencyError::DeadCode {
                        cpu: cpu.id(),
                        vaddr,
                        page: code.raw(),
                    });
                }
                let found = cache.page(code).paddr();
                let expected = e.paddr_page << A::PAGE_SHIFT;
                if found != expected {
                    return Err(ConsistencyError::StaleCode {
                        cpu: cpu.id(),
                        vaddr,
                        expected,
                        found,
                    });
                }
            }
        }

        if self.sys.cache_translations {
            for id in 0..cache.live_pages() {
                let page = cache.page(dyntrans_mmu::CodePageId::new(id as u32));
                if !page.flags().contains(PageFlags::TRANSLATIONS) {
                    continue;
                }
                let marked = self
                    .sys
                    .mem
                    .frame_of(page.paddr() >> A::PAGE_SHIFT)
                    .is_some_and(|f| self.sys.mem.has_code(f));
                if !marked {
                    return Err(ConsistencyError::UnmarkedCode {
                        paddr: page.paddr(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl<A: GuestArch> core::fmt::Debug for Machine<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Machine")
            .field("arch", &A::NAME)
            .field("cpus", &self.cpus)
            .field("memory", &self.sys.mem)
            .field("cache_pages", &self.sys.cache.live_pages())
            .finish()
    }
}
