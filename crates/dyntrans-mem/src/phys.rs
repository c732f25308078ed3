use core::fmt;
use std::sync::Arc;

use crate::error::MemoryError;
use crate::mmio::{MmioHandler, MmioRegion};

/// Stable index of a RAM frame owned by a [`PhysicalMemory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPage(u32);

impl HostPage {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw encoding for compact side tables. Only values obtained from [`HostPage::to_raw`] are
    /// meaningful.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0
    }
}

/// How a physical page is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Ordinary RAM; accesses may go straight to the frame.
    Ram(HostPage),
    /// Device memory or unmapped space; every access must go through
    /// [`PhysicalMemory::read_physical`] / [`PhysicalMemory::write_physical`].
    Slow,
}

struct RamBank {
    first_ppn: u64,
    pages: u64,
    first_frame: u32,
}

/// Page-granular guest physical memory with device regions and code tracking.
pub struct PhysicalMemory {
    page_shift: u32,
    banks: Vec<RamBank>,
    frames: Vec<Option<Box<[u8]>>>,
    frame_ppn: Vec<u64>,
    mmio: Vec<MmioRegion>,
    code: Vec<u64>,
    code_writes: Vec<u64>,
    allocated: usize,
}

impl PhysicalMemory {
    /// Creates an empty address space with `1 << page_shift` byte pages.
    #[track_caller]
    pub fn new(page_shift: u32) -> Self {
        assert!(
            crate::PAGE_SHIFTS.contains(&page_shift),
            "page_shift must be in {:?} (got {page_shift})",
            crate::PAGE_SHIFTS
        );
        Self {
            page_shift,
            banks: Vec::new(),
            frames: Vec::new(),
            frame_ppn: Vec::new(),
            mmio: Vec::new(),
            code: Vec::new(),
            code_writes: Vec::new(),
            allocated: 0,
        }
    }

    #[inline]
    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        1u64 << self.page_shift
    }

    #[inline]
    fn page_mask(&self) -> u64 {
        self.page_size() - 1
    }

    /// Total bytes of RAM across all banks.
    pub fn ram_size(&self) -> u64 {
        (self.frames.len() as u64) << self.page_shift
    }

    /// Number of RAM frames that have been touched and allocated so far.
    pub fn allocated_frames(&self) -> usize {
        self.allocated
    }

    fn check_region(&self, base: u64, len: u64, require_aligned: bool) -> Result<u64, MemoryError> {
        if len == 0 {
            return Err(MemoryError::Empty { base });
        }
        if require_aligned && ((base | len) & self.page_mask()) != 0 {
            return Err(MemoryError::Unaligned {
                base,
                len,
                page_size: self.page_size(),
            });
        }
        let end = base
            .checked_add(len)
            .ok_or(MemoryError::AddressOverflow { base, len })?;

        for bank in &self.banks {
            let bank_base = bank.first_ppn << self.page_shift;
            let bank_end = bank_base + (bank.pages << self.page_shift);
            if base < bank_end && bank_base < end {
                return Err(MemoryError::Overlap {
                    base,
                    end,
                    existing: "RAM",
                    existing_base: bank_base,
                    existing_end: bank_end,
                });
            }
        }
        for region in &self.mmio {
            if base < region.end && region.base < end {
                return Err(MemoryError::Overlap {
                    base,
                    end,
                    existing: "MMIO",
                    existing_base: region.base,
                    existing_end: region.end,
                });
            }
        }
        Ok(end)
    }

    /// Adds a bank of zero-filled RAM. Frames are only allocated when first touched.
    pub fn add_ram(&mut self, base: u64, len: u64) -> Result<(), MemoryError> {
        self.check_region(base, len, true)?;

        let pages = len >> self.page_shift;
        let first_frame = self.frames.len();
        let total = (first_frame as u64)
            .checked_add(pages)
            .filter(|&n| n <= u64::from(u32::MAX))
            .ok_or(MemoryError::TooLarge { pages })?;
        let total = usize::try_from(total).map_err(|_| MemoryError::TooLarge { pages })?;

        let first_ppn = base >> self.page_shift;
        self.frames.resize_with(total, || None);
        self.frame_ppn.extend((0..pages).map(|i| first_ppn + i));
        self.code.resize(total.div_ceil(64), 0);

        let at = self.banks.partition_point(|b| b.first_ppn < first_ppn);
        self.banks.insert(
            at,
            RamBank {
                first_ppn,
                pages,
                first_frame: first_frame as u32,
            },
        );
        tracing::debug!(
            base = format_args!("{base:#x}"),
            len = format_args!("{len:#x}"),
            pages,
            "added RAM bank"
        );
        Ok(())
    }

    /// Maps `handler` at `[base, base + len)`.
    pub fn map_mmio(
        &mut self,
        base: u64,
        len: u64,
        handler: Arc<dyn MmioHandler>,
    ) -> Result<(), MemoryError> {
        let end = self.check_region(base, len, false)?;
        let at = self.mmio.partition_point(|r| r.base < base);
        self.mmio.insert(at, MmioRegion { base, end, handler });
        tracing::debug!(
            base = format_args!("{base:#x}"),
            len = format_args!("{len:#x}"),
            "mapped MMIO region"
        );
        Ok(())
    }

    /// Returns the frame backing `ppn` without allocating it.
    pub fn frame_of(&self, ppn: u64) -> Option<HostPage> {
        let at = self.banks.partition_point(|b| b.first_ppn <= ppn);
        let bank = self.banks.get(at.checked_sub(1)?)?;
        let rel = ppn - bank.first_ppn;
        (rel < bank.pages).then(|| HostPage(bank.first_frame + rel as u32))
    }

    /// Classifies `ppn`, allocating its RAM frame if needed.
    pub fn backing(&mut self, ppn: u64) -> Backing {
        match self.frame_of(ppn) {
            Some(page) => {
                self.ensure_frame(page);
                Backing::Ram(page)
            }
            None => Backing::Slow,
        }
    }

    /// Physical address of the first byte of `page`.
    #[inline]
    pub fn frame_paddr(&self, page: HostPage) -> u64 {
        self.frame_ppn[page.index()] << self.page_shift
    }

    fn ensure_frame(&mut self, page: HostPage) -> &mut [u8] {
        let size = self.page_size() as usize;
        let slot = &mut self.frames[page.index()];
        if slot.is_none() {
            self.allocated += 1;
        }
        slot.get_or_insert_with(|| vec![0u8; size].into_boxed_slice())
    }

    /// Contents of a RAM frame. An untouched frame reads as empty.
    #[inline]
    pub fn page(&self, page: HostPage) -> &[u8] {
        self.frames[page.index()].as_deref().unwrap_or(&[])
    }

    /// Mutable contents of a RAM frame.
    ///
    /// Writing through this slice bypasses code tracking, so callers must only use it for frames
    /// that hold no translations.
    #[inline]
    pub fn page_mut(&mut self, page: HostPage) -> &mut [u8] {
        debug_assert!(
            !self.has_code(page),
            "direct store into code frame {:#x}",
            self.frame_paddr(page)
        );
        self.ensure_frame(page)
    }

    /// Returns `len` bytes at `paddr` when they lie inside one allocated RAM frame.
    pub fn ram_slice(&self, paddr: u64, len: usize) -> Option<&[u8]> {
        let off = (paddr & self.page_mask()) as usize;
        if off + len > self.page_size() as usize {
            return None;
        }
        let page = self.frame_of(paddr >> self.page_shift)?;
        let frame = self.frames[page.index()].as_deref()?;
        Some(&frame[off..off + len])
    }

    fn mmio_at(&self, paddr: u64) -> Option<&MmioRegion> {
        let at = self.mmio.partition_point(|r| r.end <= paddr);
        self.mmio.get(at).filter(|r| r.contains(paddr))
    }

    /// Reads guest physical memory. Unbacked addresses read as `0xFF`.
    pub fn read_physical(&self, paddr: u64, dst: &mut [u8]) {
        let mut remaining = dst;
        let mut cur = paddr;

        while !remaining.is_empty() {
            let off = (cur & self.page_mask()) as usize;
            let in_page = (self.page_size() as usize - off).min(remaining.len());

            let take = if let Some(page) = self.frame_of(cur >> self.page_shift) {
                match self.frames[page.index()].as_deref() {
                    Some(frame) => remaining[..in_page].copy_from_slice(&frame[off..off + in_page]),
                    None => remaining[..in_page].fill(0),
                }
                in_page
            } else if let Some(region) = self.mmio_at(cur) {
                let take = ((region.end - cur) as usize).min(in_page);
                region.handler.read(cur - region.base, &mut remaining[..take]);
                take
            } else {
                remaining[0] = 0xFF;
                1
            };

            cur = cur.wrapping_add(take as u64);
            remaining = &mut remaining[take..];
        }
    }

    /// Writes guest physical memory. Writes to unbacked addresses are ignored.
    ///
    /// Writing to a frame with a code mark clears the mark and queues its page number for
    /// [`PhysicalMemory::take_code_writes`].
    pub fn write_physical(&mut self, paddr: u64, src: &[u8]) {
        let mut remaining = src;
        let mut cur = paddr;

        while !remaining.is_empty() {
            let off = (cur & self.page_mask()) as usize;
            let in_page = (self.page_size() as usize - off).min(remaining.len());

            let take = if let Some(page) = self.frame_of(cur >> self.page_shift) {
                self.note_write(page);
                self.ensure_frame(page)[off..off + in_page].copy_from_slice(&remaining[..in_page]);
                in_page
            } else if let Some(region) = self.mmio_at(cur) {
                let take = ((region.end - cur) as usize).min(in_page);
                region.handler.write(cur - region.base, &remaining[..take]);
                take
            } else {
                1
            };

            cur = cur.wrapping_add(take as u64);
            remaining = &remaining[take..];
        }
    }

    fn note_write(&mut self, page: HostPage) {
        if self.has_code(page) {
            self.clear_code(page);
            self.code_writes.push(self.frame_ppn[page.index()]);
        }
    }

    /// Marks `page` as holding translated code.
    #[inline]
    pub fn mark_code(&mut self, page: HostPage) {
        let i = page.index();
        self.code[i / 64] |= 1 << (i % 64);
    }

    #[inline]
    pub fn clear_code(&mut self, page: HostPage) {
        let i = page.index();
        self.code[i / 64] &= !(1 << (i % 64));
    }

    #[inline]
    pub fn has_code(&self, page: HostPage) -> bool {
        let i = page.index();
        self.code[i / 64] & (1 << (i % 64)) != 0
    }

    /// Drops every code mark without queueing anything.
    pub fn clear_all_code(&mut self) {
        self.code.fill(0);
    }

    pub fn has_code_writes(&self) -> bool {
        !self.code_writes.is_empty()
    }

    /// Physical page numbers of code frames written since the last call, in write order.
    pub fn take_code_writes(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.code_writes)
    }
}

impl fmt::Debug for PhysicalMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalMemory")
            .field("page_size", &self.page_size())
            .field("ram_pages", &self.frames.len())
            .field("allocated", &self.allocated)
            .field("mmio_regions", &self.mmio.len())
            .finish()
    }
}
