//! Hashed page table walked on TLB misses.
//!
//! When `ptlen` is zero, virtual addresses map to themselves with full permissions. Otherwise
//! the table at `ptbase` holds `ptlen` 16-byte entries. Virtual page `vpn` lives in entry
//! `vpn % ptlen`, laid out as two little-endian words:
//!
//! ```text
//! +0  tag  virtual page number the entry maps
//! +8  pte  physical page base | flags
//! ```
//!
//! A miss or a permission failure is a page fault.

use bitflags::bitflags;
use dyntrans_core::{AccessType, PhysicalMemory, Walk};

use crate::{ToyException, ToyRegs, PAGE_SHIFT};

pub const ENTRY_BYTES: u64 = 16;

const PAGE_MASK: u64 = (1 << PAGE_SHIFT) - 1;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        const WRITABLE = 1 << 1;
        const EXECUTABLE = 1 << 2;
    }
}

/// Physical address of the entry `vaddr` hashes to.
pub fn entry_addr(ptbase: u64, ptlen: u64, vaddr: u64) -> u64 {
    let vpn = vaddr >> PAGE_SHIFT;
    ptbase.wrapping_add((vpn % ptlen) * ENTRY_BYTES)
}

/// Encodes an entry mapping the page of `vaddr` to the page of `paddr`.
pub fn encode_entry(vaddr: u64, paddr: u64, flags: PteFlags) -> [u8; ENTRY_BYTES as usize] {
    let mut out = [0u8; ENTRY_BYTES as usize];
    out[..8].copy_from_slice(&(vaddr >> PAGE_SHIFT).to_le_bytes());
    out[8..].copy_from_slice(&((paddr & !PAGE_MASK) | flags.bits()).to_le_bytes());
    out
}

pub(crate) fn walk(
    regs: &ToyRegs,
    mem: &PhysicalMemory,
    vaddr: u64,
    access: AccessType,
) -> Result<Walk, ToyException> {
    if regs.ptlen == 0 {
        return Ok(Walk {
            paddr: vaddr,
            writable: true,
            executable: true,
        });
    }

    let fault = ToyException::PageFault { vaddr, access };
    let mut raw = [0u8; ENTRY_BYTES as usize];
    mem.read_physical(entry_addr(regs.ptbase, regs.ptlen, vaddr), &mut raw);
    let tag = u64::from_le_bytes([raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7]]);
    let pte = u64::from_le_bytes([
        raw[8], raw[9], raw[10], raw[11], raw[12], raw[13], raw[14], raw[15],
    ]);
    let flags = PteFlags::from_bits_truncate(pte);

    if tag != vaddr >> PAGE_SHIFT || !flags.contains(PteFlags::VALID) {
        return Err(fault);
    }
    let permitted = match access {
        AccessType::Read => true,
        AccessType::Write => flags.contains(PteFlags::WRITABLE),
        AccessType::Execute => flags.contains(PteFlags::EXECUTABLE),
    };
    if !permitted {
        return Err(fault);
    }

    Ok(Walk {
        paddr: (pte & !PAGE_MASK) | (vaddr & PAGE_MASK),
        writable: flags.contains(PteFlags::WRITABLE),
        executable: flags.contains(PteFlags::EXECUTABLE),
    })
}
