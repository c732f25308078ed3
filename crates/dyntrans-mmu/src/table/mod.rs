//! Virtual-page-number indexed fast-path tables.
//!
//! A [`VphSlot`] caches everything a memory access or an instruction fetch needs for one virtual
//! page. Only pages that currently have a TLB entry are populated; every other slot reads as
//! [`VphSlot::default`].

mod flat;
mod radix;

use bitflags::bitflags;
use dyntrans_mem::HostPage;

use crate::{AccessType, CodePageId, Lookup};

pub(crate) use flat::FlatTable;
pub(crate) use radix::RadixTable;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SlotFlags: u8 {
        const VALID = 1 << 0;
        const WRITABLE = 1 << 1;
        const EXECUTABLE = 1 << 2;
    }
}

/// Fast-path state for one virtual page.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VphSlot {
    /// Frame for direct loads and instruction fetches; `None` means take the slow path.
    pub host_load: Option<HostPage>,
    /// Frame for direct stores. Never set while the frame holds translations.
    pub host_store: Option<HostPage>,
    pub ppn: u64,
    pub tlb_index: u16,
    pub flags: SlotFlags,
    /// Translation page for the physical page, once one has been attached.
    pub code: Option<CodePageId>,
}

impl VphSlot {
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.flags.contains(SlotFlags::VALID)
    }

    /// Resolves this slot for `access`, or `None` if a fill is required.
    #[inline]
    pub fn lookup(&self, access: AccessType) -> Option<Lookup> {
        let required = match access {
            AccessType::Read => SlotFlags::VALID,
            AccessType::Write => SlotFlags::VALID | SlotFlags::WRITABLE,
            AccessType::Execute => SlotFlags::VALID | SlotFlags::EXECUTABLE,
        };
        if !self.flags.contains(required) {
            return None;
        }
        let host = match access {
            AccessType::Write => self.host_store,
            AccessType::Read | AccessType::Execute => self.host_load,
        };
        Some(Lookup {
            ppn: self.ppn,
            host,
            code: self.code,
        })
    }
}

pub(crate) enum VphTable {
    Flat(FlatTable),
    Radix(RadixTable),
}

impl VphTable {
    #[inline]
    pub(crate) fn get(&self, vpn: u64) -> VphSlot {
        match self {
            VphTable::Flat(t) => t.get(vpn),
            VphTable::Radix(t) => t.get(vpn),
        }
    }

    #[inline]
    pub(crate) fn set(&mut self, vpn: u64, slot: VphSlot) {
        match self {
            VphTable::Flat(t) => t.set(vpn, slot),
            VphTable::Radix(t) => t.set(vpn, slot),
        }
    }

    #[inline]
    pub(crate) fn clear(&mut self, vpn: u64) {
        self.set(vpn, VphSlot::default());
    }

    #[inline]
    pub(crate) fn update(&mut self, vpn: u64, f: impl FnOnce(&mut VphSlot)) {
        let mut slot = self.get(vpn);
        f(&mut slot);
        self.set(vpn, slot);
    }
}
