use std::sync::Arc;

/// A device mapped into the guest physical address space.
///
/// Offsets are relative to the base of the mapping. Accesses that span the end of the mapping are
/// split by [`crate::PhysicalMemory`] so a handler only ever sees bytes it owns.
pub trait MmioHandler: Send + Sync {
    fn read(&self, offset: u64, data: &mut [u8]);
    fn write(&self, offset: u64, data: &[u8]);
}

pub(crate) struct MmioRegion {
    pub(crate) base: u64,
    /// Exclusive.
    pub(crate) end: u64,
    pub(crate) handler: Arc<dyn MmioHandler>,
}

impl MmioRegion {
    #[inline]
    pub(crate) fn contains(&self, paddr: u64) -> bool {
        paddr >= self.base && paddr < self.end
    }
}
