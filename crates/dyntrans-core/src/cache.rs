//! Translation cache: per-physical-page arrays of pre-decoded instructions.
//!
//! Pages live in a bounded arena whose size is derived from a byte budget. Records are found
//! through a bucket table hashed on the physical page number. When the arena is full the whole
//! cache is flushed at once and the epoch advances; CPUs compare epochs before trusting any
//! [`PhysPageId`] they have cached.

use bitflags::bitflags;
use dyntrans_mem::PhysicalMemory;
use dyntrans_mmu::CodePageId;
use thiserror::Error;

use crate::arch::{page_mask, page_size, slots_per_page, DecodeError, GuestArch, InstructionCall};
use crate::config::ConfigError;
use crate::dispatch;

/// Index of a [`PhysPage`] inside the arena. Only meaningful for the epoch it was obtained in.
pub type PhysPageId = CodePageId;

/// Default arena budget.
pub const DEFAULT_CACHE_BYTES: usize = 16 << 20;

const CHUNKS: usize = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u8 {
        /// At least one slot holds a translation.
        const TRANSLATIONS = 1 << 0;
        /// At least one slot holds a fused handler.
        const COMBINATIONS = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("instruction at 0x{paddr:x} crosses the end of its page")]
    CrossesPage { paddr: u64 },

    #[error("physical address 0x{paddr:x} is not RAM")]
    NotRam { paddr: u64 },

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Translations for one physical page.
pub struct PhysPage<A: GuestArch> {
    /// One entry per instruction slot plus the end-of-page sentinel.
    slots: Box<[InstructionCall<A>]>,
    /// Next record in the same bucket, 1-based; 0 ends the chain.
    next: u32,
    paddr: u64,
    flags: PageFlags,
    /// Bit `i` set when chunk `i` of `slots` may hold translations.
    chunks: u32,
}

impl<A: GuestArch> PhysPage<A> {
    fn new(paddr: u64) -> Self {
        let per_page = slots_per_page::<A>();
        let slots = (0..per_page)
            .map(|_| dispatch::untranslated::<A>())
            .chain(std::iter::once(dispatch::end_of_page::<A>()))
            .collect();
        Self {
            slots,
            next: 0,
            paddr,
            flags: PageFlags::empty(),
            chunks: 0,
        }
    }

    #[inline]
    fn chunk_len() -> usize {
        (slots_per_page::<A>() / CHUNKS).max(1)
    }

    fn clear_translations(&mut self) {
        let per_page = slots_per_page::<A>();
        let chunk_len = Self::chunk_len();
        let mut chunks = self.chunks;
        while chunks != 0 {
            let c = chunks.trailing_zeros() as usize;
            chunks &= chunks - 1;
            let start = c * chunk_len;
            let end = ((c + 1) * chunk_len).min(per_page);
            for slot in &mut self.slots[start..end] {
                *slot = dispatch::untranslated::<A>();
            }
        }
        self.chunks = 0;
        self.flags = PageFlags::empty();
    }

    #[inline]
    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    #[inline]
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// All slots, including the trailing sentinel.
    #[inline]
    pub fn slots(&self) -> &[InstructionCall<A>] {
        &self.slots
    }

    /// Whether `slot` holds a decoded instruction.
    #[inline]
    pub fn is_translated(&self, slot: usize) -> bool {
        slot < slots_per_page::<A>() && self.slots[slot].len != 0
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Instructions decoded into the cache.
    pub translations: u64,
    /// Page records handed out.
    pub allocations: u64,
    /// Flushes caused by arena exhaustion.
    pub full_flushes: u64,
    /// Pages whose translations were dropped.
    pub page_invalidations: u64,
    /// Successful calls to [`GuestArch::combine`].
    pub combinations: u64,
}

/// Result of [`TranslationCache::get_or_translate`].
#[derive(Debug)]
pub struct Translated<A: GuestArch> {
    pub page: PhysPageId,
    pub slot: usize,
    pub call: InstructionCall<A>,
    /// The page had no translations before this call.
    pub first_on_page: bool,
    /// Allocating the page record flushed the cache.
    pub flushed: bool,
}

pub struct TranslationCache<A: GuestArch> {
    pages: Vec<PhysPage<A>>,
    live: usize,
    buckets: Box<[u32]>,
    capacity: usize,
    epoch: u64,
    stats: CacheStats,
}

impl<A: GuestArch> TranslationCache<A> {
    /// Approximate arena footprint of one page record.
    pub fn record_bytes() -> usize {
        core::mem::size_of::<PhysPage<A>>()
            + (slots_per_page::<A>() + 1) * core::mem::size_of::<InstructionCall<A>>()
    }

    /// Creates a cache whose records fit in `cache_bytes`, keeping one record of headroom.
    pub fn new(cache_bytes: usize) -> Result<Self, ConfigError> {
        let record_bytes = Self::record_bytes();
        let capacity = cache_bytes.saturating_sub(record_bytes) / record_bytes;
        if capacity == 0 || capacity > u32::MAX as usize - 1 {
            return Err(ConfigError::CacheTooSmall {
                cache_bytes,
                record_bytes,
            });
        }
        let buckets = capacity.next_power_of_two();
        tracing::debug!(
            arch = A::NAME,
            cache_bytes,
            record_bytes,
            capacity,
            "translation cache created"
        );
        Ok(Self {
            pages: Vec::new(),
            live: 0,
            buckets: vec![0; buckets].into_boxed_slice(),
            capacity,
            epoch: 0,
            stats: CacheStats::default(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn live_pages(&self) -> usize {
        self.live
    }

    /// Advances on every full flush.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    #[inline]
    pub fn is_live(&self, id: PhysPageId) -> bool {
        id.index() < self.live
    }

    #[inline]
    fn bucket_of(&self, paddr: u64) -> usize {
        let ppn = paddr >> A::PAGE_SHIFT;
        let h = ppn.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 32;
        (h as usize) & (self.buckets.len() - 1)
    }

    /// Finds the record for the page containing `paddr`.
    pub fn lookup(&self, paddr: u64) -> Option<PhysPageId> {
        let base = paddr & !page_mask::<A>();
        let mut cur = self.buckets[self.bucket_of(base)];
        while cur != 0 {
            let page = &self.pages[cur as usize - 1];
            if page.paddr == base {
                return Some(CodePageId::new(cur - 1));
            }
            cur = page.next;
        }
        None
    }

    /// Finds or allocates the record for the page containing `paddr`. The flag reports whether a
    /// full flush happened to make room.
    pub fn get_or_alloc(&mut self, paddr: u64) -> (PhysPageId, bool) {
        if let Some(id) = self.lookup(paddr) {
            return (id, false);
        }
        let base = paddr & !page_mask::<A>();

        let flushed = self.live == self.capacity;
        if flushed {
            tracing::debug!(
                capacity = self.capacity,
                epoch = self.epoch,
                "translation cache full; flushing"
            );
            self.flush();
            self.stats.full_flushes += 1;
        }

        let index = self.live;
        if index < self.pages.len() {
            let page = &mut self.pages[index];
            page.clear_translations();
            page.paddr = base;
        } else {
            self.pages.push(PhysPage::new(base));
        }
        self.live += 1;

        let bucket = self.bucket_of(base);
        self.pages[index].next = self.buckets[bucket];
        self.buckets[bucket] = index as u32 + 1;
        self.stats.allocations += 1;
        tracing::trace!(paddr = base, index, "allocated translation page");
        (CodePageId::new(index as u32), flushed)
    }

    #[inline]
    pub fn page(&self, id: PhysPageId) -> &PhysPage<A> {
        debug_assert!(self.is_live(id), "stale translation page {id:?}");
        &self.pages[id.index()]
    }

    #[inline]
    pub fn call(&self, id: PhysPageId, slot: usize) -> InstructionCall<A> {
        self.pages[id.index()].slots[slot]
    }

    /// Stores a translation. Returns true when it is the first one on the page.
    pub fn install(&mut self, id: PhysPageId, slot: usize, call: InstructionCall<A>) -> bool {
        debug_assert!(slot < slots_per_page::<A>(), "install into sentinel slot");
        let chunk = slot / PhysPage::<A>::chunk_len();
        let page = &mut self.pages[id.index()];
        let first = !page.flags.contains(PageFlags::TRANSLATIONS);
        page.slots[slot] = call;
        page.chunks |= 1 << chunk;
        page.flags |= PageFlags::TRANSLATIONS;
        self.stats.translations += 1;
        first
    }

    /// Gives the architecture a chance to fuse the instruction just installed at `slot` with its
    /// predecessors.
    pub fn combine(&mut self, id: PhysPageId, slot: usize) -> bool {
        let per_page = slots_per_page::<A>();
        let page = &mut self.pages[id.index()];
        let combined = A::combine(&mut page.slots[..per_page], slot);
        if combined {
            page.flags |= PageFlags::COMBINATIONS;
            self.stats.combinations += 1;
        }
        combined
    }

    /// Returns the translation for `paddr`, decoding and installing it if needed.
    pub fn get_or_translate(
        &mut self,
        mem: &PhysicalMemory,
        paddr: u64,
    ) -> Result<Translated<A>, TranslateError> {
        let off = (paddr & page_mask::<A>()) as usize;
        debug_assert_eq!(off & ((1 << A::INSN_SHIFT) - 1), 0, "misaligned fetch");
        let slot = off >> A::INSN_SHIFT;

        if let Some(page) = self.lookup(paddr) {
            let existing = self.call(page, slot);
            if existing.len != 0 {
                return Ok(Translated {
                    page,
                    slot,
                    call: existing,
                    first_on_page: false,
                    flushed: false,
                });
            }
        }

        let available = (page_size::<A>() as usize - off).min(A::MAX_INSN_LEN);
        let bytes = mem
            .ram_slice(paddr, available)
            .ok_or(TranslateError::NotRam { paddr })?;
        let decoded = match A::decode(bytes, off) {
            Ok(d) => d,
            Err(DecodeError::Truncated { .. }) => return Err(TranslateError::CrossesPage { paddr }),
            Err(e) => return Err(e.into()),
        };
        debug_assert!(
            decoded.bytes != 0 && decoded.bytes % (1 << A::INSN_SHIFT) == 0,
            "decoder returned {} bytes",
            decoded.bytes
        );
        if off + decoded.bytes > page_size::<A>() as usize {
            return Err(TranslateError::CrossesPage { paddr });
        }

        let (page, flushed) = self.get_or_alloc(paddr);
        let call = InstructionCall::new(
            decoded.handler,
            decoded.args,
            (decoded.bytes >> A::INSN_SHIFT) as u8,
        );
        let first_on_page = self.install(page, slot, call);
        self.combine(page, slot);
        Ok(Translated {
            page,
            slot,
            call: self.call(page, slot),
            first_on_page,
            flushed,
        })
    }

    /// Drops every translation of the page containing `paddr`. The record itself stays allocated.
    pub fn invalidate_paddr(&mut self, paddr: u64) -> bool {
        let Some(id) = self.lookup(paddr) else {
            return false;
        };
        let page = &mut self.pages[id.index()];
        if page.flags.is_empty() {
            return false;
        }
        page.clear_translations();
        self.stats.page_invalidations += 1;
        tracing::trace!(paddr = page.paddr, "invalidated translations");
        true
    }

    /// Forgets every record and advances the epoch.
    pub fn flush(&mut self) {
        self.live = 0;
        self.buckets.fill(0);
        self.epoch += 1;
    }
}
