//! Decoder and instruction handlers.
//!
//! Every handler receives `[rd, rs, imm]` (or `[rd, rs, rt]` for register-register forms).
//! Immediates are stored sign-extended.

use dyntrans_core::{
    DecodeError, Decoded, Exec, ExecResult, Handler, InstructionCall, Trap, IC_ARGS,
};

use crate::asm::{op, special};
use crate::{Toy, ToyException};

type Args = [u64; IC_ARGS];

#[inline]
fn mask<const W: bool>(value: u64) -> u64 {
    if W {
        value
    } else {
        value & 0xffff_ffff
    }
}

#[inline]
fn r<const W: bool>(exec: &Exec<'_, Toy<W>>, reg: u64) -> u64 {
    exec.regs().gpr[reg as usize & 0xf]
}

#[inline]
fn set<const W: bool>(exec: &mut Exec<'_, Toy<W>>, reg: u64, value: u64) {
    let reg = reg as usize & 0xf;
    if reg != 0 {
        exec.regs_mut().gpr[reg] = mask::<W>(value);
    }
}

fn ea<const W: bool>(exec: &Exec<'_, Toy<W>>, args: &Args) -> u64 {
    r(exec, args[1]).wrapping_add(args[2])
}

fn branch_target<const W: bool>(exec: &Exec<'_, Toy<W>>, imm: u64) -> u64 {
    exec.pc().wrapping_add(imm.wrapping_mul(2))
}

fn op_nop<const W: bool>(_exec: &mut Exec<'_, Toy<W>>, _args: &Args) -> ExecResult<Toy<W>> {
    Ok(())
}

fn op_addi<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let v = r(exec, args[1]).wrapping_add(args[2]);
    set(exec, args[0], v);
    Ok(())
}

/// Two back-to-back `rd += imm` on the same register.
///
/// `args[0]` is the register with the second instruction's slot length in bits 8..16.
fn op_addi_pair<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let reg = args[0] & 0xff;
    let mut v = r(exec, reg).wrapping_add(args[1]);
    if exec.budget_left() >= 1 {
        v = v.wrapping_add(args[2]);
        exec.retire(1);
        exec.skip_slots((args[0] >> 8) as u32);
    }
    set(exec, reg, v);
    Ok(())
}

fn op_li<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    set(exec, args[0], args[2]);
    Ok(())
}

fn op_add<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let v = r(exec, args[1]).wrapping_add(r(exec, args[2]));
    set(exec, args[0], v);
    Ok(())
}

fn op_sub<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let v = r(exec, args[1]).wrapping_sub(r(exec, args[2]));
    set(exec, args[0], v);
    Ok(())
}

fn op_mv<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let v = r(exec, args[1]);
    set(exec, args[0], v);
    Ok(())
}

fn op_lui<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    set(exec, args[0], args[2] << 16);
    Ok(())
}

fn op_ori<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let v = r(exec, args[1]) | (args[2] & 0xffff);
    set(exec, args[0], v);
    Ok(())
}

fn op_slli<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let v = r(exec, args[1]) << (args[2] & 63);
    set(exec, args[0], v);
    Ok(())
}

fn load<const W: bool, const N: usize>(
    exec: &mut Exec<'_, Toy<W>>,
    args: &Args,
) -> ExecResult<Toy<W>> {
    let vaddr = ea(exec, args);
    let v = exec.load(vaddr, N)?;
    set(exec, args[0], v);
    Ok(())
}

fn store<const W: bool, const N: usize>(
    exec: &mut Exec<'_, Toy<W>>,
    args: &Args,
) -> ExecResult<Toy<W>> {
    let (vaddr, v) = (ea(exec, args), r(exec, args[0]));
    exec.store(vaddr, N, v)
}

fn op_j<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let target = branch_target(exec, args[2]);
    exec.jump(target);
    Ok(())
}

fn op_bne<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    if r(exec, args[0]) != r(exec, args[1]) {
        let target = branch_target(exec, args[2]);
        exec.jump(target);
    }
    Ok(())
}

fn op_beq<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    if r(exec, args[0]) == r(exec, args[1]) {
        let target = branch_target(exec, args[2]);
        exec.jump(target);
    }
    Ok(())
}

fn op_jr<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let target = r(exec, args[1]) & !1;
    exec.jump(target);
    Ok(())
}

fn op_syscall<const W: bool>(_exec: &mut Exec<'_, Toy<W>>, _args: &Args) -> ExecResult<Toy<W>> {
    Err(Trap::Exception(ToyException::Syscall))
}

fn op_reserved<const W: bool>(_exec: &mut Exec<'_, Toy<W>>, _args: &Args) -> ExecResult<Toy<W>> {
    Err(Trap::Exception(ToyException::ReservedInstruction))
}

fn op_eret<const W: bool>(exec: &mut Exec<'_, Toy<W>>, _args: &Args) -> ExecResult<Toy<W>> {
    let regs = exec.regs_mut();
    regs.irq_enabled = regs.saved_irq_enabled;
    let epc = regs.epc;
    exec.jump(epc);
    Ok(())
}

fn op_tlbflush<const W: bool>(exec: &mut Exec<'_, Toy<W>>, _args: &Args) -> ExecResult<Toy<W>> {
    tracing::trace!(cpu = exec.cpu_id(), pc = exec.pc(), "guest tlb flush");
    exec.flush_tlb();
    Ok(())
}

fn op_tlbinv<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let (start, end) = (r(exec, args[1]), r(exec, args[2]));
    tracing::trace!(cpu = exec.cpu_id(), start, end, "guest tlb range invalidation");
    exec.invalidate_tlb_range(start, end);
    Ok(())
}

fn op_halt<const W: bool>(exec: &mut Exec<'_, Toy<W>>, _args: &Args) -> ExecResult<Toy<W>> {
    Err(exec.halt())
}

fn op_icinv<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let paddr = r(exec, args[1]);
    tracing::trace!(cpu = exec.cpu_id(), paddr, "guest code invalidation");
    exec.invalidate_code(paddr);
    Ok(())
}

fn op_mfc<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let regs = exec.regs();
    let v = match args[2] as i16 {
        special::EPC => regs.epc,
        special::CAUSE => regs.cause,
        special::BADVADDR => regs.badvaddr,
        special::EVEC => regs.evec,
        special::PTBASE => regs.ptbase,
        _ => regs.ptlen,
    };
    set(exec, args[0], v);
    Ok(())
}

fn op_mtc<const W: bool>(exec: &mut Exec<'_, Toy<W>>, args: &Args) -> ExecResult<Toy<W>> {
    let v = r(exec, args[1]);
    let sr = args[2] as i16;
    let regs = exec.regs_mut();
    match sr {
        special::EPC => regs.epc = v,
        special::CAUSE => regs.cause = v,
        special::BADVADDR => regs.badvaddr = v,
        special::EVEC => regs.evec = v,
        special::PTBASE => regs.ptbase = v,
        _ => regs.ptlen = v,
    }
    if sr == special::PTBASE || sr == special::PTLEN {
        exec.flush_tlb();
    }
    Ok(())
}

fn op_ei<const W: bool>(exec: &mut Exec<'_, Toy<W>>, _args: &Args) -> ExecResult<Toy<W>> {
    exec.regs_mut().irq_enabled = true;
    Ok(())
}

fn op_di<const W: bool>(exec: &mut Exec<'_, Toy<W>>, _args: &Args) -> ExecResult<Toy<W>> {
    exec.regs_mut().irq_enabled = false;
    Ok(())
}

fn sext(value: u64, bits: u32) -> u64 {
    let shift = 64 - bits;
    (((value << shift) as i64) >> shift) as u64
}

fn decoded<const W: bool>(handler: Handler<Toy<W>>, args: Args, bytes: usize) -> Decoded<Toy<W>> {
    Decoded {
        handler,
        args,
        bytes,
    }
}

pub(crate) fn decode<const W: bool>(bytes: &[u8]) -> Result<Decoded<Toy<W>>, DecodeError> {
    if bytes.len() < 2 {
        return Err(DecodeError::Truncated {
            available: bytes.len(),
        });
    }
    let half = u64::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    match half & 3 {
        0b00 => return Ok(decoded(op_reserved, [0; IC_ARGS], 2)),
        0b01 => {
            let rd = (half >> 2) & 0xf;
            return Ok(decoded(op_addi, [rd, rd, sext(half >> 6, 10)], 2));
        }
        0b10 => {
            let (rd, rs) = ((half >> 2) & 0xf, (half >> 6) & 0xf);
            if rd == 0 {
                return Ok(decoded(op_nop, [0; IC_ARGS], 2));
            }
            return Ok(decoded(op_mv, [rd, rs, 0], 2));
        }
        _ => {}
    }

    if bytes.len() < 4 {
        return Err(DecodeError::Truncated {
            available: bytes.len(),
        });
    }
    let word = u64::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
    let opcode = ((word >> 2) & 0x3f) as u8;
    let rd = (word >> 8) & 0xf;
    let rs = (word >> 12) & 0xf;
    let imm = sext(word >> 16, 16);
    let args = [rd, rs, imm];

    let handler: Handler<Toy<W>> = match opcode {
        op::NOP => op_nop,
        op::ADDI => op_addi,
        op::LI => op_li,
        op::ADD => return Ok(decoded(op_add, [rd, rs, imm & 0xf], 4)),
        op::SUB => return Ok(decoded(op_sub, [rd, rs, imm & 0xf], 4)),
        op::TLBINV => return Ok(decoded(op_tlbinv, [0, rs, imm & 0xf], 4)),
        op::LW => load::<W, 4>,
        op::SW => store::<W, 4>,
        op::LB => load::<W, 1>,
        op::SB => store::<W, 1>,
        op::LD => load::<W, 8>,
        op::SD => store::<W, 8>,
        op::J => op_j,
        op::BNE => op_bne,
        op::BEQ => op_beq,
        op::JR => op_jr,
        op::SYSCALL => op_syscall,
        op::ERET => op_eret,
        op::TLBFLUSH => op_tlbflush,
        op::HALT => op_halt,
        op::ICINV => op_icinv,
        op::LUI => op_lui,
        op::ORI => op_ori,
        op::SLLI => op_slli,
        op::MFC | op::MTC if !(special::EPC..=special::PTLEN).contains(&(imm as i16)) => {
            return Err(DecodeError::Unimplemented {
                word,
                what: "unknown special register",
            })
        }
        op::MFC => op_mfc,
        op::MTC => op_mtc,
        op::EI => op_ei,
        op::DI => op_di,
        op::UD => op_reserved,
        _ => {
            return Err(DecodeError::Unimplemented {
                word,
                what: "unknown opcode",
            })
        }
    };
    Ok(decoded(handler, args, 4))
}

/// `rd += imm` with `rd == rs` and a writable `rd`.
fn self_add<const W: bool>(call: &InstructionCall<Toy<W>>) -> Option<u64> {
    let addi: Handler<Toy<W>> = op_addi;
    (call.len != 0
        && call.handler as usize == addi as usize
        && call.args[0] == call.args[1]
        && call.args[0] != 0)
        .then_some(call.args[0])
}

/// Fuses a self-add at `slot` into an immediately preceding self-add on the same register.
pub(crate) fn combine<const W: bool>(slots: &mut [InstructionCall<Toy<W>>], slot: usize) -> bool {
    let cur = slots[slot];
    let Some(reg) = self_add(&cur) else {
        return false;
    };
    for back in 1..=2usize {
        let Some(prev_slot) = slot.checked_sub(back) else {
            break;
        };
        let prev = slots[prev_slot];
        if usize::from(prev.len) != back || self_add(&prev) != Some(reg) {
            continue;
        }
        slots[prev_slot] = InstructionCall::new(
            op_addi_pair,
            [reg | u64::from(cur.len) << 8, prev.args[2], cur.args[2]],
            prev.len,
        );
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{c_addi, c_mv, encode};
    use crate::{Toy32, Toy64};

    fn decode32(bytes: &[u8]) -> Result<Decoded<Toy32>, DecodeError> {
        decode::<false>(bytes)
    }

    #[test]
    fn compressed_forms() {
        let d = decode32(&c_addi(3, -5).to_le_bytes()).unwrap();
        assert_eq!(d.bytes, 2);
        assert_eq!(d.args, [3, 3, (-5i64) as u64]);

        let d = decode32(&c_mv(4, 7).to_le_bytes()).unwrap();
        assert_eq!((d.bytes, d.args), (2, [4, 7, 0]));

        assert_eq!(decode32(&[0, 0]).unwrap().bytes, 2);
    }

    #[test]
    fn full_width_needs_four_bytes() {
        let w = encode(op::ADDI, 1, 2, -3).to_le_bytes();
        assert_eq!(
            decode32(&w[..2]).err(),
            Some(DecodeError::Truncated { available: 2 })
        );
        let d = decode32(&w).unwrap();
        assert_eq!((d.bytes, d.args), (4, [1, 2, (-3i64) as u64]));
    }

    #[test]
    fn unknown_encodings_are_unimplemented() {
        let w = encode(0x30, 0, 0, 0).to_le_bytes();
        assert!(matches!(
            decode32(&w),
            Err(DecodeError::Unimplemented { what: "unknown opcode", .. })
        ));
        let w = encode(op::MFC, 1, 0, 9).to_le_bytes();
        assert!(matches!(
            decode::<true>(&w),
            Err(DecodeError::Unimplemented { .. })
        ));
    }

    fn call(bytes: &[u8]) -> InstructionCall<Toy64> {
        let d = decode::<true>(bytes).unwrap();
        InstructionCall::new(d.handler, d.args, (d.bytes / 2) as u8)
    }

    #[test]
    fn adjacent_self_adds_fuse() {
        let nop = call(&c_mv(0, 0).to_le_bytes());
        let wide = call(&encode(op::ADDI, 5, 5, 100).to_le_bytes());
        let narrow = call(&c_addi(5, 1).to_le_bytes());
        let mut slots = vec![wide, nop, narrow, narrow];

        assert!(combine(&mut slots, 2));
        assert_eq!(slots[0].len, 2);
        assert_eq!(slots[0].args, [5 | 1 << 8, 100, 1]);
        assert!(!slots[0].same_as(&wide));

        assert!(combine(&mut slots, 3));
        assert_eq!(slots[2].args, [5 | 1 << 8, 1, 1]);
    }

    #[test]
    fn different_registers_do_not_fuse() {
        let a = call(&c_addi(5, 1).to_le_bytes());
        let b = call(&c_addi(6, 1).to_le_bytes());
        let into_zero = call(&c_addi(0, 1).to_le_bytes());
        let mut slots = vec![a, b, into_zero, into_zero];
        assert!(!combine(&mut slots, 1));
        assert!(!combine(&mut slots, 3));
        let copy = call(&encode(op::ADDI, 6, 5, 1).to_le_bytes());
        let mut slots = vec![b, copy, copy];
        assert!(!combine(&mut slots, 1));
    }
}
