//! Dynamic-translation execution core.
//!
//! Guest instructions are decoded once into per-physical-page arrays of [`InstructionCall`]s and
//! executed by calling their handlers in sequence. A [`GuestArch`] implementation supplies the
//! decoder, the handlers, the page walker and exception delivery; this crate supplies the
//! translation cache, the dispatch loop, the per-CPU fast-path tables and the invalidation rules
//! that keep translations coherent with guest writes.
//!
//! ```text
//!  Machine ──> Cpu (regs, Mmu, dispatch position) ──┐
//!     │                                             ├──> Exec handed to handlers
//!     └────> System (PhysicalMemory, TranslationCache, pending coherence work)
//! ```

mod arch;
mod cache;
mod config;
mod cpu;
mod dispatch;
mod exec;
mod invalidate;
mod machine;

#[cfg(test)]
mod test_arch;

pub use arch::{
    DecodeError, Decoded, ExecResult, GuestArch, HaltReason, Handler, InstructionCall, Trap,
    IC_ARGS,
};
pub use cache::{
    CacheStats, PageFlags, PhysPage, PhysPageId, TranslateError, Translated, TranslationCache,
    DEFAULT_CACHE_BYTES,
};
pub use config::{ConfigError, MachineConfig};
pub use cpu::Cpu;
pub use exec::Exec;
pub use invalidate::InvalidateScope;
pub use machine::{ConsistencyError, Machine, MachineError, RunSummary, System};

pub use dyntrans_mem::{Backing, ByteOrder, HostPage, MemoryError, MmioHandler, PhysicalMemory};
pub use dyntrans_mmu::{AccessType, AddressWidth, MmuStats, Walk};
