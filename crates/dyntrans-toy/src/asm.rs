//! Encoders for the toy instruction set and a small sequential assembler.
//!
//! Full-width instructions are 32 bits, little-endian:
//!
//! ```text
//!  31            16 15  12 11   8 7      2 1 0
//! +----------------+------+------+--------+---+
//! |      imm16     |  rs  |  rd  | opcode | 11|
//! +----------------+------+------+--------+---+
//! ```
//!
//! Compressed instructions are 16 bits and have low bits `01` (`C.ADDI rd, imm10`) or `10`
//! (`C.MV rd, rs`). A halfword with low bits `00` is a reserved instruction.

/// Full-width opcodes.
pub mod op {
    pub const NOP: u8 = 0x00;
    pub const ADDI: u8 = 0x01;
    pub const LI: u8 = 0x02;
    pub const ADD: u8 = 0x03;
    pub const LW: u8 = 0x04;
    pub const SW: u8 = 0x05;
    pub const LB: u8 = 0x06;
    pub const SB: u8 = 0x07;
    pub const LD: u8 = 0x08;
    pub const SD: u8 = 0x09;
    pub const J: u8 = 0x0a;
    pub const BNE: u8 = 0x0b;
    pub const BEQ: u8 = 0x0c;
    pub const JR: u8 = 0x0d;
    pub const SYSCALL: u8 = 0x0e;
    pub const ERET: u8 = 0x0f;
    pub const TLBFLUSH: u8 = 0x10;
    pub const HALT: u8 = 0x11;
    pub const ICINV: u8 = 0x12;
    pub const LUI: u8 = 0x13;
    pub const ORI: u8 = 0x14;
    pub const SLLI: u8 = 0x15;
    pub const MFC: u8 = 0x16;
    pub const MTC: u8 = 0x17;
    pub const EI: u8 = 0x18;
    pub const DI: u8 = 0x19;
    pub const SUB: u8 = 0x1a;
    /// Drops TLB mappings for virtual addresses in `[rs, rt)`.
    pub const TLBINV: u8 = 0x1b;
    /// Always raises a reserved-instruction exception.
    pub const UD: u8 = 0x3f;
}

/// Special registers reachable through `MFC`/`MTC`.
pub mod special {
    pub const EPC: i16 = 0;
    pub const CAUSE: i16 = 1;
    pub const BADVADDR: i16 = 2;
    pub const EVEC: i16 = 3;
    pub const PTBASE: i16 = 4;
    pub const PTLEN: i16 = 5;
}

pub const C_NOP: u16 = 0x0002;

pub const fn encode(op: u8, rd: u8, rs: u8, imm: i16) -> u32 {
    0b11 | ((op as u32) & 0x3f) << 2
        | ((rd as u32) & 0xf) << 8
        | ((rs as u32) & 0xf) << 12
        | (imm as u16 as u32) << 16
}

#[track_caller]
pub fn c_addi(rd: u8, imm: i16) -> u16 {
    assert!((-512..512).contains(&imm), "C.ADDI immediate {imm} out of range");
    0b01 | (u16::from(rd) & 0xf) << 2 | ((imm as u16) & 0x3ff) << 6
}

pub const fn c_mv(rd: u8, rs: u8) -> u16 {
    0b10 | ((rd as u16) & 0xf) << 2 | ((rs as u16) & 0xf) << 6
}

/// Sequential assembler. Branch helpers take absolute targets.
#[derive(Debug, Clone, Default)]
pub struct Asm {
    base: u64,
    bytes: Vec<u8>,
}

impl Asm {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            bytes: Vec::new(),
        }
    }

    /// Address of the next instruction.
    pub fn pc(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    pub fn word(&mut self, word: u32) -> &mut Self {
        self.bytes.extend_from_slice(&word.to_le_bytes());
        self
    }

    pub fn half(&mut self, half: u16) -> &mut Self {
        self.bytes.extend_from_slice(&half.to_le_bytes());
        self
    }

    /// Pads with `C.NOP` up to `addr`.
    #[track_caller]
    pub fn pad_to(&mut self, addr: u64) -> &mut Self {
        assert!(addr >= self.pc() && addr % 2 == 0, "cannot pad to {addr:#x}");
        while self.pc() < addr {
            self.half(C_NOP);
        }
        self
    }

    fn insn(&mut self, op: u8, rd: u8, rs: u8, imm: i16) -> &mut Self {
        self.word(encode(op, rd, rs, imm))
    }

    #[track_caller]
    fn rel(&self, target: u64) -> i16 {
        let delta = target.wrapping_sub(self.pc()) as i64;
        assert!(delta % 2 == 0, "odd branch target {target:#x}");
        i16::try_from(delta / 2)
            .unwrap_or_else(|_| panic!("branch to {target:#x} from {:#x} out of range", self.pc()))
    }

    pub fn nop(&mut self) -> &mut Self {
        self.insn(op::NOP, 0, 0, 0)
    }

    pub fn addi(&mut self, rd: u8, rs: u8, imm: i16) -> &mut Self {
        self.insn(op::ADDI, rd, rs, imm)
    }

    pub fn li(&mut self, rd: u8, imm: i16) -> &mut Self {
        self.insn(op::LI, rd, 0, imm)
    }

    /// `LUI` + `ORI` for an arbitrary 32-bit value (sign-extended by `LUI`).
    pub fn li32(&mut self, rd: u8, value: u32) -> &mut Self {
        self.insn(op::LUI, rd, 0, (value >> 16) as u16 as i16)
            .insn(op::ORI, rd, rd, value as u16 as i16)
    }

    pub fn add(&mut self, rd: u8, rs: u8, rt: u8) -> &mut Self {
        self.insn(op::ADD, rd, rs, i16::from(rt & 0xf))
    }

    pub fn sub(&mut self, rd: u8, rs: u8, rt: u8) -> &mut Self {
        self.insn(op::SUB, rd, rs, i16::from(rt & 0xf))
    }

    pub fn lw(&mut self, rd: u8, base: u8, imm: i16) -> &mut Self {
        self.insn(op::LW, rd, base, imm)
    }

    /// `mem32[base + imm] = rt`
    pub fn sw(&mut self, rt: u8, base: u8, imm: i16) -> &mut Self {
        self.insn(op::SW, rt, base, imm)
    }

    pub fn lb(&mut self, rd: u8, base: u8, imm: i16) -> &mut Self {
        self.insn(op::LB, rd, base, imm)
    }

    pub fn sb(&mut self, rt: u8, base: u8, imm: i16) -> &mut Self {
        self.insn(op::SB, rt, base, imm)
    }

    pub fn ld(&mut self, rd: u8, base: u8, imm: i16) -> &mut Self {
        self.insn(op::LD, rd, base, imm)
    }

    pub fn sd(&mut self, rt: u8, base: u8, imm: i16) -> &mut Self {
        self.insn(op::SD, rt, base, imm)
    }

    #[track_caller]
    pub fn j(&mut self, target: u64) -> &mut Self {
        let off = self.rel(target);
        self.insn(op::J, 0, 0, off)
    }

    #[track_caller]
    pub fn bne(&mut self, a: u8, b: u8, target: u64) -> &mut Self {
        let off = self.rel(target);
        self.insn(op::BNE, a, b, off)
    }

    #[track_caller]
    pub fn beq(&mut self, a: u8, b: u8, target: u64) -> &mut Self {
        let off = self.rel(target);
        self.insn(op::BEQ, a, b, off)
    }

    pub fn jr(&mut self, rs: u8) -> &mut Self {
        self.insn(op::JR, 0, rs, 0)
    }

    pub fn syscall(&mut self) -> &mut Self {
        self.insn(op::SYSCALL, 0, 0, 0)
    }

    pub fn eret(&mut self) -> &mut Self {
        self.insn(op::ERET, 0, 0, 0)
    }

    pub fn tlbflush(&mut self) -> &mut Self {
        self.insn(op::TLBFLUSH, 0, 0, 0)
    }

    pub fn tlbinv(&mut self, rs: u8, rt: u8) -> &mut Self {
        self.insn(op::TLBINV, 0, rs, i16::from(rt & 0xf))
    }

    pub fn halt(&mut self) -> &mut Self {
        self.insn(op::HALT, 0, 0, 0)
    }

    /// Drops translations of the physical page containing `r[rs]`.
    pub fn icinv(&mut self, rs: u8) -> &mut Self {
        self.insn(op::ICINV, 0, rs, 0)
    }

    pub fn lui(&mut self, rd: u8, imm: i16) -> &mut Self {
        self.insn(op::LUI, rd, 0, imm)
    }

    pub fn ori(&mut self, rd: u8, rs: u8, imm: u16) -> &mut Self {
        self.insn(op::ORI, rd, rs, imm as i16)
    }

    pub fn slli(&mut self, rd: u8, rs: u8, shamt: u8) -> &mut Self {
        self.insn(op::SLLI, rd, rs, i16::from(shamt & 63))
    }

    pub fn mfc(&mut self, rd: u8, sr: i16) -> &mut Self {
        self.insn(op::MFC, rd, 0, sr)
    }

    pub fn mtc(&mut self, sr: i16, rs: u8) -> &mut Self {
        self.insn(op::MTC, 0, rs, sr)
    }

    pub fn ei(&mut self) -> &mut Self {
        self.insn(op::EI, 0, 0, 0)
    }

    pub fn di(&mut self) -> &mut Self {
        self.insn(op::DI, 0, 0, 0)
    }

    pub fn ud(&mut self) -> &mut Self {
        self.insn(op::UD, 0, 0, 0)
    }

    #[track_caller]
    pub fn c_addi(&mut self, rd: u8, imm: i16) -> &mut Self {
        self.half(c_addi(rd, imm))
    }

    pub fn c_mv(&mut self, rd: u8, rs: u8) -> &mut Self {
        self.half(c_mv(rd, rs))
    }

    pub fn c_nop(&mut self) -> &mut Self {
        self.half(C_NOP)
    }
}
