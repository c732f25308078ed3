use std::collections::HashMap;

use super::VphSlot;

const LEAF_BITS: u32 = 10;
const MID_BITS: u32 = 10;
const LEAF_LEN: usize = 1 << LEAF_BITS;
const MID_LEN: usize = 1 << MID_BITS;

struct Leaf {
    slots: Box<[VphSlot]>,
    /// Slots that differ from the default.
    live: u32,
}

impl Leaf {
    fn new() -> Self {
        Self {
            slots: vec![VphSlot::default(); LEAF_LEN].into_boxed_slice(),
            live: 0,
        }
    }
}

struct Mid {
    leaves: Box<[Option<Leaf>]>,
    /// Leaves present.
    live: u32,
}

impl Mid {
    fn new() -> Self {
        Self {
            leaves: (0..MID_LEN).map(|_| None).collect(),
            live: 0,
        }
    }
}

/// Three-level table for 64-bit address spaces. The top level is sparse, lower levels are
/// allocated on first insertion and freed once their last populated slot is cleared, so the
/// table never holds more leaves than there are populated slots.
pub(crate) struct RadixTable {
    top: HashMap<u64, Box<Mid>>,
}

#[inline]
fn split(vpn: u64) -> (u64, usize, usize) {
    let leaf = (vpn as usize) & (LEAF_LEN - 1);
    let mid = ((vpn >> LEAF_BITS) as usize) & (MID_LEN - 1);
    (vpn >> (LEAF_BITS + MID_BITS), mid, leaf)
}

impl RadixTable {
    pub(crate) fn new() -> Self {
        Self {
            top: HashMap::new(),
        }
    }

    #[inline]
    pub(crate) fn get(&self, vpn: u64) -> VphSlot {
        let (top, mid, leaf) = split(vpn);
        self.top
            .get(&top)
            .and_then(|m| m.leaves[mid].as_ref())
            .map_or_else(VphSlot::default, |l| l.slots[leaf])
    }

    pub(crate) fn set(&mut self, vpn: u64, slot: VphSlot) {
        let (top, mid, leaf) = split(vpn);
        if slot == VphSlot::default() {
            self.clear(top, mid, leaf);
            return;
        }
        let m = self.top.entry(top).or_insert_with(|| Box::new(Mid::new()));
        if m.leaves[mid].is_none() {
            m.live += 1;
        }
        let l = m.leaves[mid].get_or_insert_with(Leaf::new);
        if l.slots[leaf] == VphSlot::default() {
            l.live += 1;
        }
        l.slots[leaf] = slot;
    }

    /// Clearing never allocates.
    fn clear(&mut self, top: u64, mid: usize, leaf: usize) {
        let Some(m) = self.top.get_mut(&top) else {
            return;
        };
        let Some(l) = m.leaves[mid].as_mut() else {
            return;
        };
        if l.slots[leaf] == VphSlot::default() {
            return;
        }
        l.slots[leaf] = VphSlot::default();
        l.live -= 1;
        if l.live == 0 {
            m.leaves[mid] = None;
            m.live -= 1;
            if m.live == 0 {
                self.top.remove(&top);
            }
        }
    }

    /// Allocated (top-level nodes, leaves).
    #[cfg(test)]
    pub(crate) fn nodes(&self) -> (usize, usize) {
        let leaves = self.top.values().map(|m| m.live as usize).sum();
        (self.top.len(), leaves)
    }
}
