use serde::{Deserialize, Serialize};
use thiserror::Error;

use dyntrans_mem::PAGE_SHIFTS;
use dyntrans_mmu::{DEFAULT_TLB_ENTRIES, MAX_TLB_ENTRIES};

use crate::cache::DEFAULT_CACHE_BYTES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse machine config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to serialize machine config: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("page shift {page_shift} is outside the supported {min}..={max}")]
    PageShift { page_shift: u32, min: u32, max: u32 },

    #[error("a machine needs at least one cpu")]
    NoCpus,

    #[error("tlb_entries must be in 1..={MAX_TLB_ENTRIES} (got {entries})")]
    TlbEntries { entries: usize },

    #[error("{field} must be non-zero")]
    Zero { field: &'static str },

    #[error("RAM base=0x{base:x} len=0x{len:x} is not page aligned (page size 0x{page_size:x})")]
    UnalignedRam { base: u64, len: u64, page_size: u64 },

    #[error("cache_bytes={cache_bytes} cannot hold one {record_bytes}-byte translation page plus headroom")]
    CacheTooSmall {
        cache_bytes: usize,
        record_bytes: usize,
    },
}

/// Machine-level settings.
///
/// Every field has a default, so a JSON document only needs the fields it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MachineConfig {
    pub cpus: usize,
    pub ram_base: u64,
    pub ram_bytes: u64,
    /// Byte budget for the translation cache arena.
    pub cache_bytes: usize,
    pub tlb_entries: usize,
    /// Instructions between interrupt polls.
    pub poll_interval: u64,
    /// Instructions a CPU runs before the next CPU gets a turn.
    pub slice_instructions: u64,
    /// When false every instruction is decoded on every execution.
    pub cache_translations: bool,
    /// Emit one `trace` event per executed instruction; also polls for interrupts after every
    /// instruction.
    pub trace_instructions: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            ram_base: 0,
            ram_bytes: 16 << 20,
            cache_bytes: DEFAULT_CACHE_BYTES,
            tlb_entries: DEFAULT_TLB_ENTRIES,
            poll_interval: 1024,
            slice_instructions: 65536,
            cache_translations: true,
            trace_instructions: false,
        }
    }
}

impl MachineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Checks the settings for a guest with `1 << page_shift` byte pages.
    pub fn validate(&self, page_shift: u32) -> Result<(), ConfigError> {
        if !PAGE_SHIFTS.contains(&page_shift) {
            return Err(ConfigError::PageShift {
                page_shift,
                min: *PAGE_SHIFTS.start(),
                max: *PAGE_SHIFTS.end(),
            });
        }
        if self.cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        if !(1..=MAX_TLB_ENTRIES).contains(&self.tlb_entries) {
            return Err(ConfigError::TlbEntries {
                entries: self.tlb_entries,
            });
        }
        if self.poll_interval == 0 {
            return Err(ConfigError::Zero {
                field: "poll_interval",
            });
        }
        if self.slice_instructions == 0 {
            return Err(ConfigError::Zero {
                field: "slice_instructions",
            });
        }
        if self.ram_bytes == 0 {
            return Err(ConfigError::Zero { field: "ram_bytes" });
        }
        let page_size = 1u64 << page_shift;
        if (self.ram_base | self.ram_bytes) & (page_size - 1) != 0 {
            return Err(ConfigError::UnalignedRam {
                base: self.ram_base,
                len: self.ram_bytes,
                page_size,
            });
        }
        Ok(())
    }
}
