//! Software MMU for the dynamic-translation core: a small fully-associative TLB plus a
//! virtual-page indexed table of host frames and translation pages.
//!
//! The table is what the execution core consults on every memory access and every page change.
//! The TLB bounds how many virtual pages are populated in it; evicting a TLB entry clears the
//! corresponding table slot, so a populated slot always has exactly one backing entry.
//!
//! Page walking is left to the guest architecture. [`Mmu::insert`] consumes the result of a walk
//! ([`Walk`]) together with the frame classification from [`dyntrans_mem::PhysicalMemory`].

mod table;
mod tlb;

use dyntrans_mem::{Backing, HostPage};

pub use table::{SlotFlags, VphSlot};
pub use tlb::TlbEntry;

use table::{FlatTable, RadixTable, VphTable};
use tlb::Tlb;

/// Default number of TLB entries.
pub const DEFAULT_TLB_ENTRIES: usize = 128;
/// Largest supported TLB.
pub const MAX_TLB_ENTRIES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressWidth {
    Bits32,
    Bits64,
}

impl AddressWidth {
    #[inline]
    pub const fn mask(self) -> u64 {
        match self {
            AddressWidth::Bits32 => 0xffff_ffff,
            AddressWidth::Bits64 => u64::MAX,
        }
    }
}

/// Result of a successful guest page walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Walk {
    /// Physical address corresponding to the walked virtual address.
    pub paddr: u64,
    pub writable: bool,
    pub executable: bool,
}

/// Index of a translation page owned by the execution core's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodePageId(u32);

impl CodePageId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Fast-path resolution of a virtual address for one access type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookup {
    pub ppn: u64,
    /// Direct frame access, or `None` for the slow path.
    pub host: Option<HostPage>,
    pub code: Option<CodePageId>,
}

/// Optional MMU statistics.
///
/// When the `stats` feature is disabled, this type contains no fields and every accessor returns
/// zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    /// TLB fills following a page walk.
    #[cfg(feature = "stats")]
    pub fills: u64,
    /// Valid entries replaced to make room for a fill.
    #[cfg(feature = "stats")]
    pub evictions: u64,
    /// Whole-TLB flushes.
    #[cfg(feature = "stats")]
    pub flushes: u64,
    /// Translation-page references dropped by [`Mmu::detach_code`] and [`Mmu::detach_all_code`].
    #[cfg(feature = "stats")]
    pub code_detaches: u64,
}

macro_rules! bump {
    ($self:ident . $field:ident) => {
        #[cfg(feature = "stats")]
        {
            $self.stats.$field += 1;
        }
    };
    ($self:ident . $field:ident, $n:expr) => {
        #[cfg(feature = "stats")]
        {
            $self.stats.$field += $n as u64;
        }
        #[cfg(not(feature = "stats"))]
        {
            let _ = $n;
        }
    };
}

impl MmuStats {
    #[inline]
    pub fn fills(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.fills
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    #[inline]
    pub fn evictions(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.evictions
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    #[inline]
    pub fn flushes(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.flushes
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }

    #[inline]
    pub fn code_detaches(&self) -> u64 {
        #[cfg(feature = "stats")]
        {
            self.code_detaches
        }
        #[cfg(not(feature = "stats"))]
        {
            0
        }
    }
}

/// Per-CPU TLB and virtual page table.
pub struct Mmu {
    width: AddressWidth,
    page_shift: u32,
    tlb: Tlb,
    table: VphTable,
    stats: MmuStats,
}

impl Mmu {
    /// Creates an empty MMU. 32-bit address spaces use a directly indexed table, 64-bit ones a
    /// sparse radix table.
    #[track_caller]
    pub fn new(width: AddressWidth, page_shift: u32, tlb_entries: usize) -> Self {
        assert!(
            (1..=MAX_TLB_ENTRIES).contains(&tlb_entries),
            "tlb_entries must be in 1..={MAX_TLB_ENTRIES} (got {tlb_entries})"
        );
        assert!(
            dyntrans_mem::PAGE_SHIFTS.contains(&page_shift),
            "page_shift must be in {:?} (got {page_shift})",
            dyntrans_mem::PAGE_SHIFTS
        );
        let table = match width {
            AddressWidth::Bits32 => VphTable::Flat(FlatTable::new(page_shift)),
            AddressWidth::Bits64 => VphTable::Radix(RadixTable::new()),
        };
        Self {
            width,
            page_shift,
            tlb: Tlb::new(tlb_entries),
            table,
            stats: MmuStats::default(),
        }
    }

    #[inline]
    pub fn address_width(&self) -> AddressWidth {
        self.width
    }

    #[inline]
    pub fn vaddr_mask(&self) -> u64 {
        self.width.mask()
    }

    #[inline]
    fn vpn(&self, vaddr: u64) -> u64 {
        (vaddr & self.width.mask()) >> self.page_shift
    }

    /// Fast-path lookup. `None` means the caller must walk and [`Mmu::insert`].
    #[inline]
    pub fn lookup(&self, vaddr: u64, access: AccessType) -> Option<Lookup> {
        self.table.get(self.vpn(vaddr)).lookup(access)
    }

    /// Current table slot for the page containing `vaddr`.
    #[inline]
    pub fn slot(&self, vaddr: u64) -> VphSlot {
        self.table.get(self.vpn(vaddr))
    }

    pub fn tlb_entries(&self) -> &[TlbEntry] {
        self.tlb.entries()
    }

    /// Installs a mapping for the page containing `vaddr`.
    ///
    /// `store_ok` says whether direct stores into the frame are currently allowed; it is ignored
    /// unless the walk granted write permission and the page is RAM. A translation page attached
    /// to the previous mapping survives only if the physical page did not change.
    pub fn insert(&mut self, vaddr: u64, walk: &Walk, backing: Backing, store_ok: bool) -> VphSlot {
        let vpn = self.vpn(vaddr);
        let ppn = walk.paddr >> self.page_shift;
        let old = self.table.get(vpn);

        let index = if old.is_valid() {
            usize::from(old.tlb_index)
        } else {
            let victim = self.tlb.victim();
            let evicted = *self.tlb.get(victim);
            if evicted.valid {
                self.table.clear(evicted.vaddr_page);
                bump!(self.evictions);
            }
            victim
        };

        let host = match backing {
            Backing::Ram(page) => Some(page),
            Backing::Slow => None,
        };
        self.tlb.fill(
            index,
            TlbEntry {
                valid: true,
                writable: walk.writable,
                executable: walk.executable,
                vaddr_page: vpn,
                paddr_page: ppn,
                host_page: host,
                timestamp: 0,
            },
        );

        let mut flags = SlotFlags::VALID;
        flags.set(SlotFlags::WRITABLE, walk.writable);
        flags.set(SlotFlags::EXECUTABLE, walk.executable);
        let slot = VphSlot {
            host_load: host,
            host_store: if walk.writable && store_ok { host } else { None },
            ppn,
            tlb_index: index as u16,
            flags,
            code: if old.is_valid() && old.ppn == ppn {
                old.code
            } else {
                None
            },
        };
        self.table.set(vpn, slot);
        bump!(self.fills);
        slot
    }

    /// Records the translation page for the (already mapped) page containing `vaddr`.
    pub fn attach_code(&mut self, vaddr: u64, code: CodePageId) {
        let vpn = self.vpn(vaddr);
        self.table.update(vpn, |slot| {
            debug_assert!(slot.is_valid(), "attach_code on unmapped vpn {vpn:#x}");
            slot.code = Some(code);
        });
    }

    /// Drops every reference to the translation page of `ppn`. Returns how many slots changed.
    pub fn detach_code(&mut self, ppn: u64) -> usize {
        let mut n = 0;
        for e in self.tlb.entries() {
            if e.valid && e.paddr_page == ppn {
                self.table.update(e.vaddr_page, |slot| {
                    if slot.code.take().is_some() {
                        n += 1;
                    }
                });
            }
        }
        bump!(self.code_detaches, n);
        n
    }

    /// Drops every translation-page reference, e.g. after the cache was flushed.
    pub fn detach_all_code(&mut self) {
        let mut n = 0;
        for e in self.tlb.entries() {
            if e.valid {
                self.table.update(e.vaddr_page, |slot| {
                    if slot.code.take().is_some() {
                        n += 1;
                    }
                });
            }
        }
        bump!(self.code_detaches, n);
    }

    /// Removes the direct store path for every mapping of `ppn`. Returns how many slots changed.
    pub fn revoke_store(&mut self, ppn: u64) -> usize {
        let mut n = 0;
        for e in self.tlb.entries() {
            if e.valid && e.paddr_page == ppn {
                self.table.update(e.vaddr_page, |slot| {
                    if slot.host_store.take().is_some() {
                        n += 1;
                    }
                });
            }
        }
        n
    }

    /// Re-enables direct stores for the page containing `vaddr` if it is mapped writable RAM.
    ///
    /// The caller is responsible for checking that the frame holds no translations.
    pub fn allow_store(&mut self, vaddr: u64) -> bool {
        let vpn = self.vpn(vaddr);
        let slot = self.table.get(vpn);
        if !slot.flags.contains(SlotFlags::VALID | SlotFlags::WRITABLE) || slot.host_load.is_none()
        {
            return false;
        }
        if slot.host_store.is_none() {
            self.table.update(vpn, |s| s.host_store = s.host_load);
        }
        true
    }

    pub fn invalidate_page(&mut self, vaddr: u64) {
        let vpn = self.vpn(vaddr);
        let slot = self.table.get(vpn);
        if slot.is_valid() {
            self.tlb.invalidate(usize::from(slot.tlb_index));
            self.table.clear(vpn);
        }
    }

    /// Invalidates every mapping whose virtual page intersects `[start, end)`.
    pub fn invalidate_range(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        let first = self.vpn(start);
        let last = self.vpn(end - 1);
        for i in 0..self.tlb.entries().len() {
            let e = *self.tlb.get(i);
            if e.valid && e.vaddr_page >= first && e.vaddr_page <= last {
                self.tlb.invalidate(i);
                self.table.clear(e.vaddr_page);
            }
        }
    }

    pub fn flush(&mut self) {
        for e in self.tlb.entries() {
            if e.valid {
                self.table.clear(e.vaddr_page);
            }
        }
        self.tlb.flush();
        bump!(self.flushes);
        tracing::trace!("tlb flushed");
    }

    /// Whether any populated slot still refers to the translation page of `ppn`.
    pub fn references_code(&self, ppn: u64) -> bool {
        self.tlb
            .entries()
            .iter()
            .any(|e| e.valid && e.paddr_page == ppn && self.table.get(e.vaddr_page).code.is_some())
    }

    /// Returns `None` when the `stats` feature is disabled.
    pub fn stats(&self) -> Option<MmuStats> {
        #[cfg(feature = "stats")]
        {
            Some(self.stats)
        }
        #[cfg(not(feature = "stats"))]
        {
            None
        }
    }
}

impl core::fmt::Debug for Mmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mmu")
            .field("width", &self.width)
            .field("page_shift", &self.page_shift)
            .field("tlb_entries", &self.tlb.entries().len())
            .field(
                "valid",
                &self.tlb.entries().iter().filter(|e| e.valid).count(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests;
