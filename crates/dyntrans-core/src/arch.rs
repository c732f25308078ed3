use core::fmt;

use dyntrans_mem::{ByteOrder, PhysicalMemory};
use dyntrans_mmu::{AccessType, AddressWidth, Walk};
use thiserror::Error;

use crate::exec::Exec;

/// Number of pre-decoded arguments carried by every [`InstructionCall`].
pub const IC_ARGS: usize = 3;

/// Outcome of an instruction handler.
pub type ExecResult<A> = Result<(), Trap<<A as GuestArch>::Exception>>;

/// Semantic routine for one decoded instruction.
pub type Handler<A> = fn(&mut Exec<'_, A>, &[u64; IC_ARGS]) -> ExecResult<A>;

/// Why a CPU stopped executing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HaltReason {
    #[error("guest requested halt at pc=0x{pc:x}")]
    Requested { pc: u64 },

    #[error("unimplemented instruction at pc=0x{pc:x}: {source}")]
    Unimplemented {
        pc: u64,
        #[source]
        source: DecodeError,
    },

    #[error("instruction fetch at pc=0x{pc:x} hit non-RAM physical address 0x{paddr:x}")]
    ExecuteFromDevice { pc: u64, paddr: u64 },

    #[error("page walk for {access:?} at 0x{vaddr:x} returned a mapping without that permission")]
    InconsistentWalk { vaddr: u64, access: AccessType },
}

/// Non-local exit from an instruction handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trap<E> {
    /// Architectural exception; delivered through [`GuestArch::deliver`].
    Exception(E),
    /// Stops the CPU.
    Halt(HaltReason),
}

impl<E> From<HaltReason> for Trap<E> {
    fn from(reason: HaltReason) -> Self {
        Trap::Halt(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The instruction continues past the bytes supplied.
    #[error("instruction is longer than the {available} bytes available")]
    Truncated { available: usize },

    #[error("{what} (encoding 0x{word:x})")]
    Unimplemented { word: u64, what: &'static str },
}

/// Output of [`GuestArch::decode`].
pub struct Decoded<A: GuestArch> {
    pub handler: Handler<A>,
    pub args: [u64; IC_ARGS],
    /// Encoded length in bytes; a non-zero multiple of the instruction granule.
    pub bytes: usize,
}

/// A pre-decoded instruction: its handler, arguments and length in instruction slots.
///
/// Slots with `len == 0` hold core-internal handlers (not yet translated, end of page).
pub struct InstructionCall<A: GuestArch> {
    pub handler: Handler<A>,
    pub args: [u64; IC_ARGS],
    pub len: u8,
}

impl<A: GuestArch> InstructionCall<A> {
    #[inline]
    pub const fn new(handler: Handler<A>, args: [u64; IC_ARGS], len: u8) -> Self {
        Self { handler, args, len }
    }

    /// Same handler, arguments and length.
    pub fn same_as(&self, other: &Self) -> bool {
        self.handler as usize == other.handler as usize
            && self.args == other.args
            && self.len == other.len
    }
}

impl<A: GuestArch> Clone for InstructionCall<A> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A: GuestArch> Copy for InstructionCall<A> {}

impl<A: GuestArch> fmt::Debug for InstructionCall<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionCall")
            .field("handler", &(self.handler as usize as *const ()))
            .field("args", &self.args)
            .field("len", &self.len)
            .finish()
    }
}

/// A guest instruction set plugged into the dispatcher.
pub trait GuestArch: Sized + 'static {
    type Regs: Default + Clone + fmt::Debug + Send;
    type Exception: Copy + fmt::Debug + Send;

    const NAME: &'static str;
    const ADDRESS_WIDTH: AddressWidth;
    const PAGE_SHIFT: u32;
    /// log2 of the instruction granule in bytes; one translation slot per granule.
    const INSN_SHIFT: u32;
    /// Longest encoding in bytes.
    const MAX_INSN_LEN: usize;
    const BYTE_ORDER: ByteOrder;

    /// Decodes the instruction at the start of `bytes`.
    ///
    /// `bytes` never extends past the end of the page. Returns [`DecodeError::Truncated`] when the
    /// instruction continues onto the next page.
    fn decode(bytes: &[u8], page_offset: usize) -> Result<Decoded<Self>, DecodeError>;

    /// Translates `vaddr` for `access`. The default maps every address to itself.
    fn walk(
        _regs: &Self::Regs,
        _mem: &PhysicalMemory,
        vaddr: u64,
        _access: AccessType,
    ) -> Result<Walk, Self::Exception> {
        Ok(Walk {
            paddr: vaddr,
            writable: true,
            executable: true,
        })
    }

    /// Enters the exception handler for `exception` raised at `pc`; returns the new pc.
    fn deliver(regs: &mut Self::Regs, pc: u64, exception: Self::Exception) -> u64;

    /// Polled between dispatch chunks.
    fn pending_interrupt(_regs: &Self::Regs) -> Option<Self::Exception> {
        None
    }

    /// Called after `slots[slot]` was translated. May rewrite earlier slots of the same page into
    /// a fused handler; returns whether anything changed.
    fn combine(_slots: &mut [InstructionCall<Self>], _slot: usize) -> bool {
        false
    }
}

#[inline]
pub(crate) fn page_size<A: GuestArch>() -> u64 {
    1 << A::PAGE_SHIFT
}

#[inline]
pub(crate) fn page_mask<A: GuestArch>() -> u64 {
    page_size::<A>() - 1
}

#[inline]
pub(crate) fn slots_per_page<A: GuestArch>() -> usize {
    1 << (A::PAGE_SHIFT - A::INSN_SHIFT)
}
