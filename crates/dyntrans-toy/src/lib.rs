//! A small RISC guest for exercising the dispatcher.
//!
//! The instruction set mixes 32-bit and 16-bit encodings (see [`asm`]) so translation pages use a
//! 2-byte slot granule and full-width instructions can straddle a page boundary. Two variants
//! share the decoder:
//!
//! - [`Toy32`]: 32-bit registers and addresses, flat fast-path table.
//! - [`Toy64`]: 64-bit registers and addresses, radix fast-path table.
//!
//! Sixteen general registers, `r0` reads as zero. Exceptions save the faulting pc in `epc`,
//! disable interrupts and continue at `evec`; `ERET` undoes both.

use dyntrans_core::{
    AccessType, AddressWidth, ByteOrder, DecodeError, Decoded, GuestArch, InstructionCall,
    PhysicalMemory, Walk,
};

pub mod asm;
mod insn;
pub mod paging;

pub const PAGE_SHIFT: u32 = 12;

/// Reset value of `evec`.
pub const DEFAULT_EVEC: u64 = 0x80;

#[derive(Debug, Clone, Copy, Default)]
pub struct Toy<const WIDE: bool>;

pub type Toy32 = Toy<false>;
pub type Toy64 = Toy<true>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToyRegs {
    pub gpr: [u64; 16],
    pub epc: u64,
    pub cause: u64,
    pub badvaddr: u64,
    pub evec: u64,
    /// Physical base of the page table.
    pub ptbase: u64,
    /// Page table entries; zero disables translation.
    pub ptlen: u64,
    /// Level of the external interrupt line.
    pub irq_line: bool,
    pub irq_enabled: bool,
    pub saved_irq_enabled: bool,
}

impl Default for ToyRegs {
    fn default() -> Self {
        Self {
            gpr: [0; 16],
            epc: 0,
            cause: 0,
            badvaddr: 0,
            evec: DEFAULT_EVEC,
            ptbase: 0,
            ptlen: 0,
            irq_line: false,
            irq_enabled: false,
            saved_irq_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToyException {
    PageFault { vaddr: u64, access: AccessType },
    Syscall,
    ReservedInstruction,
    Interrupt,
}

impl ToyException {
    /// Value written to `cause`.
    pub fn code(self) -> u64 {
        match self {
            ToyException::Interrupt => 0,
            ToyException::PageFault {
                access: AccessType::Read,
                ..
            } => 1,
            ToyException::PageFault {
                access: AccessType::Write,
                ..
            } => 2,
            ToyException::PageFault {
                access: AccessType::Execute,
                ..
            } => 3,
            ToyException::Syscall => 8,
            ToyException::ReservedInstruction => 10,
        }
    }
}

impl<const W: bool> GuestArch for Toy<W> {
    type Regs = ToyRegs;
    type Exception = ToyException;

    const NAME: &'static str = if W { "toy64" } else { "toy32" };
    const ADDRESS_WIDTH: AddressWidth = if W {
        AddressWidth::Bits64
    } else {
        AddressWidth::Bits32
    };
    const PAGE_SHIFT: u32 = PAGE_SHIFT;
    const INSN_SHIFT: u32 = 1;
    const MAX_INSN_LEN: usize = 4;
    const BYTE_ORDER: ByteOrder = ByteOrder::Little;

    fn decode(bytes: &[u8], _page_offset: usize) -> Result<Decoded<Self>, DecodeError> {
        insn::decode(bytes)
    }

    fn walk(
        regs: &ToyRegs,
        mem: &PhysicalMemory,
        vaddr: u64,
        access: AccessType,
    ) -> Result<Walk, ToyException> {
        paging::walk(regs, mem, vaddr, access)
    }

    fn deliver(regs: &mut ToyRegs, pc: u64, exception: ToyException) -> u64 {
        regs.epc = pc;
        regs.cause = exception.code();
        match exception {
            ToyException::PageFault { vaddr, .. } => regs.badvaddr = vaddr,
            ToyException::Interrupt => regs.irq_line = false,
            ToyException::Syscall | ToyException::ReservedInstruction => {}
        }
        regs.saved_irq_enabled = regs.irq_enabled;
        regs.irq_enabled = false;
        regs.evec
    }

    fn pending_interrupt(regs: &ToyRegs) -> Option<ToyException> {
        (regs.irq_line && regs.irq_enabled).then_some(ToyException::Interrupt)
    }

    fn combine(slots: &mut [InstructionCall<Self>], slot: usize) -> bool {
        insn::combine(slots, slot)
    }
}
