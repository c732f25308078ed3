use dyntrans_mem::HostPage;

/// One software TLB entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub valid: bool,
    pub writable: bool,
    pub executable: bool,
    /// Virtual page number.
    pub vaddr_page: u64,
    /// Physical page number.
    pub paddr_page: u64,
    pub host_page: Option<HostPage>,
    /// Fill order; the smallest valid timestamp is the eviction victim.
    pub timestamp: u64,
}

/// Fully-associative TLB with LRU-by-fill replacement.
#[derive(Debug, Clone)]
pub(crate) struct Tlb {
    entries: Box<[TlbEntry]>,
    clock: u64,
}

impl Tlb {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            entries: vec![TlbEntry::default(); len].into_boxed_slice(),
            clock: 0,
        }
    }

    #[inline]
    pub(crate) fn entries(&self) -> &[TlbEntry] {
        &self.entries
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> &TlbEntry {
        &self.entries[index]
    }

    /// First invalid entry, otherwise the least recently filled one.
    pub(crate) fn victim(&self) -> usize {
        let mut best = 0;
        let mut best_ts = u64::MAX;
        for (i, e) in self.entries.iter().enumerate() {
            if !e.valid {
                return i;
            }
            if e.timestamp < best_ts {
                best = i;
                best_ts = e.timestamp;
            }
        }
        best
    }

    pub(crate) fn fill(&mut self, index: usize, mut entry: TlbEntry) {
        self.clock += 1;
        entry.valid = true;
        entry.timestamp = self.clock;
        self.entries[index] = entry;
    }

    #[inline]
    pub(crate) fn invalidate(&mut self, index: usize) {
        self.entries[index].valid = false;
    }

    pub(crate) fn flush(&mut self) {
        for e in self.entries.iter_mut() {
            e.valid = false;
        }
    }
}
