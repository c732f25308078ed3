//! A minimal fixed-width guest used by the unit tests.

use crate::{Decoded, DecodeError, Exec, ExecResult, GuestArch, InstructionCall, Trap, IC_ARGS};
use dyntrans_mem::ByteOrder;
use dyntrans_mmu::AddressWidth;

#[derive(Debug)]
pub(crate) struct Tiny;

#[derive(Debug, Default, Clone)]
pub(crate) struct TinyRegs {
    pub acc: u64,
    pub epc: u64,
    pub traps: u64,
    pub irq: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TinyException {
    Trap,
    Irq,
}

/// `acc += 1`
pub(crate) const ADD: u32 = add(1);
/// `acc += 1`, fused in pairs.
pub(crate) const INC: u32 = 0x02;
pub(crate) const HALT: u32 = 0x04;
pub(crate) const TRAP: u32 = 0x06;
/// First byte of an 8-byte no-op.
pub(crate) const LONG_OPCODE: u8 = 0xef;

pub(crate) const fn add(imm: u8) -> u32 {
    0x01 | (imm as u32) << 8
}

pub(crate) const fn jmp(target: u32) -> u32 {
    0x03 | target << 8
}

/// `mem32[addr] = acc`
pub(crate) const fn store(addr: u32) -> u32 {
    0x05 | addr << 8
}

pub(crate) fn program(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn op_add(exec: &mut Exec<'_, Tiny>, args: &[u64; IC_ARGS]) -> ExecResult<Tiny> {
    exec.regs_mut().acc += args[1];
    Ok(())
}

fn op_inc2(exec: &mut Exec<'_, Tiny>, _args: &[u64; IC_ARGS]) -> ExecResult<Tiny> {
    if exec.budget_left() >= 1 {
        exec.regs_mut().acc += 2;
        exec.retire(1);
        exec.skip_slots(1);
    } else {
        exec.regs_mut().acc += 1;
    }
    Ok(())
}

fn op_jmp(exec: &mut Exec<'_, Tiny>, args: &[u64; IC_ARGS]) -> ExecResult<Tiny> {
    exec.jump(args[1]);
    Ok(())
}

fn op_halt(exec: &mut Exec<'_, Tiny>, _args: &[u64; IC_ARGS]) -> ExecResult<Tiny> {
    Err(exec.halt())
}

fn op_store(exec: &mut Exec<'_, Tiny>, args: &[u64; IC_ARGS]) -> ExecResult<Tiny> {
    let acc = exec.regs().acc;
    exec.store(args[1], 4, acc)
}

fn op_trap(_exec: &mut Exec<'_, Tiny>, _args: &[u64; IC_ARGS]) -> ExecResult<Tiny> {
    Err(Trap::Exception(TinyException::Trap))
}

fn op_nop(_exec: &mut Exec<'_, Tiny>, _args: &[u64; IC_ARGS]) -> ExecResult<Tiny> {
    Ok(())
}

fn inc() -> InstructionCall<Tiny> {
    InstructionCall::new(op_add, [0, 1, 0], 1)
}

impl GuestArch for Tiny {
    type Regs = TinyRegs;
    type Exception = TinyException;

    const NAME: &'static str = "tiny";
    const ADDRESS_WIDTH: AddressWidth = AddressWidth::Bits32;
    const PAGE_SHIFT: u32 = 12;
    const INSN_SHIFT: u32 = 2;
    const MAX_INSN_LEN: usize = 8;
    const BYTE_ORDER: ByteOrder = ByteOrder::Little;

    fn decode(bytes: &[u8], _page_offset: usize) -> Result<Decoded<Self>, DecodeError> {
        if bytes.len() < 4 {
            return Err(DecodeError::Truncated {
                available: bytes.len(),
            });
        }
        let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let imm = u64::from(word >> 8);
        let (handler, imm): (crate::Handler<Tiny>, u64) = match bytes[0] {
            0x01 => (op_add, imm & 0xff),
            0x02 => {
                return Ok(Decoded {
                    handler: inc().handler,
                    args: inc().args,
                    bytes: 4,
                })
            }
            0x03 => (op_jmp, imm),
            0x04 => (op_halt, 0),
            0x05 => (op_store, imm),
            0x06 => (op_trap, 0),
            LONG_OPCODE => {
                if bytes.len() < 8 {
                    return Err(DecodeError::Truncated {
                        available: bytes.len(),
                    });
                }
                return Ok(Decoded {
                    handler: op_nop,
                    args: [0; IC_ARGS],
                    bytes: 8,
                });
            }
            _ => {
                return Err(DecodeError::Unimplemented {
                    word: u64::from(word),
                    what: "unknown opcode",
                })
            }
        };
        Ok(Decoded {
            handler,
            args: [u64::from(bytes[0]), imm, 0],
            bytes: 4,
        })
    }

    fn deliver(regs: &mut TinyRegs, pc: u64, exception: TinyException) -> u64 {
        regs.epc = pc;
        regs.traps += 1;
        match exception {
            TinyException::Trap => pc + 4,
            TinyException::Irq => {
                regs.irq = false;
                pc
            }
        }
    }

    fn pending_interrupt(regs: &TinyRegs) -> Option<TinyException> {
        regs.irq.then_some(TinyException::Irq)
    }

    fn combine(slots: &mut [InstructionCall<Self>], slot: usize) -> bool {
        if slot == 0 || !slots[slot].same_as(&inc()) || !slots[slot - 1].same_as(&inc()) {
            return false;
        }
        slots[slot - 1] = InstructionCall::new(op_inc2, [0, 2, 0], 1);
        true
    }
}
