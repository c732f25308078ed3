use dyntrans_mem::HostPage;

use super::{SlotFlags, VphSlot};
use crate::CodePageId;

const NONE: u32 = 0;

#[inline]
fn encode_host(page: Option<HostPage>) -> u32 {
    page.map_or(NONE, |p| p.to_raw() + 1)
}

#[inline]
fn decode_host(raw: u32) -> Option<HostPage> {
    raw.checked_sub(1).map(HostPage::from_raw)
}

/// Directly indexed table covering a 32-bit virtual address space, one array per field.
pub(crate) struct FlatTable {
    host_load: Box<[u32]>,
    host_store: Box<[u32]>,
    ppn: Box<[u64]>,
    code: Box<[u32]>,
    tlb_index: Box<[u16]>,
    flags: Box<[u8]>,
}

impl FlatTable {
    pub(crate) fn new(page_shift: u32) -> Self {
        let len = 1usize << (32 - page_shift);
        Self {
            host_load: vec![NONE; len].into_boxed_slice(),
            host_store: vec![NONE; len].into_boxed_slice(),
            ppn: vec![0; len].into_boxed_slice(),
            code: vec![NONE; len].into_boxed_slice(),
            tlb_index: vec![0; len].into_boxed_slice(),
            flags: vec![0; len].into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn get(&self, vpn: u64) -> VphSlot {
        let i = vpn as usize;
        if i >= self.flags.len() {
            return VphSlot::default();
        }
        VphSlot {
            host_load: decode_host(self.host_load[i]),
            host_store: decode_host(self.host_store[i]),
            ppn: self.ppn[i],
            tlb_index: self.tlb_index[i],
            flags: SlotFlags::from_bits_retain(self.flags[i]),
            code: self.code[i].checked_sub(1).map(CodePageId::new),
        }
    }

    #[inline]
    pub(crate) fn set(&mut self, vpn: u64, slot: VphSlot) {
        let i = vpn as usize;
        debug_assert!(i < self.flags.len(), "vpn {vpn:#x} outside 32-bit space");
        self.host_load[i] = encode_host(slot.host_load);
        self.host_store[i] = encode_host(slot.host_store);
        self.ppn[i] = slot.ppn;
        self.tlb_index[i] = slot.tlb_index;
        self.flags[i] = slot.flags.bits();
        self.code[i] = slot.code.map_or(NONE, |c| c.raw() + 1);
    }
}
