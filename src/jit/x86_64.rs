//! x86-64 instruction encoding for JIT compilation.
//!
//! Only the forms the AMX translation needs are provided. Methods without a
//! width in their name operate on 64-bit registers; `*32` methods operate on
//! the 32-bit halves, which zero-extend into the full register.

use super::codebuf::{CodeBuffer, Label};

/// x86-64 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Register code (lower 3 bits).
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    /// Whether this register requires a REX extension bit.
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

/// x86-64 condition codes (for Jcc, SETcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,  // Overflow
    No = 0x1, // Not overflow
    B = 0x2,  // Below (unsigned <)
    Ae = 0x3, // Above or equal (unsigned >=)
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    Be = 0x6, // Below or equal (unsigned <=)
    A = 0x7,  // Above (unsigned >)
    S = 0x8,  // Sign (negative)
    Ns = 0x9, // Not sign (non-negative)
    P = 0xA,  // Parity even
    Np = 0xB, // Parity odd
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

impl Cond {
    pub fn invert(self) -> Self {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// A memory operand: `[base + index * scale + disp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    base: Reg,
    index: Option<(Reg, u8)>,
    disp: i32,
}

impl Mem {
    pub fn base(base: Reg, disp: i32) -> Self {
        Self {
            base,
            index: None,
            disp,
        }
    }

    /// `scale` must be 1, 2, 4 or 8; `index` must not be RSP.
    pub fn indexed(base: Reg, index: Reg, scale: u8, disp: i32) -> Self {
        debug_assert!(matches!(scale, 1 | 2 | 4 | 8));
        debug_assert_ne!(index, Reg::Rsp);
        Self {
            base,
            index: Some((index, scale)),
            disp,
        }
    }
}

#[derive(Clone, Copy)]
enum Rm {
    Reg(Reg),
    Mem(Mem),
}

impl From<Reg> for Rm {
    fn from(reg: Reg) -> Self {
        Rm::Reg(reg)
    }
}

impl From<Mem> for Rm {
    fn from(mem: Mem) -> Self {
        Rm::Mem(mem)
    }
}

/// Encoding options for one instruction.
#[derive(Clone, Copy, Default)]
struct Enc {
    /// Mandatory or operand-size prefix, emitted before REX.
    prefix: Option<u8>,
    /// REX.W
    wide: bool,
    /// Register operands are byte registers.
    byte: bool,
}

const D: Enc = Enc {
    prefix: None,
    wide: false,
    byte: false,
};
const Q: Enc = Enc {
    prefix: None,
    wide: true,
    byte: false,
};
const B: Enc = Enc {
    prefix: None,
    wide: false,
    byte: true,
};

const fn sse(prefix: u8) -> Enc {
    Enc {
        prefix: Some(prefix),
        wide: false,
        byte: false,
    }
}

/// x86-64 assembler.
pub struct X86_64Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> X86_64Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn buf(&mut self) -> &mut CodeBuffer {
        self.buf
    }

    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    pub fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    pub fn bind(&mut self, label: Label) {
        self.buf.bind(label);
    }

    // ==================== Encoding core ====================

    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Emit prefix, REX, opcode and ModR/M (+SIB, displacement). `reg` is the
    /// full 4-bit register number or opcode extension.
    fn emit(&mut self, enc: Enc, opcode: &[u8], reg: u8, rm: Rm) {
        if let Some(prefix) = enc.prefix {
            self.buf.emit_u8(prefix);
        }

        let (x, b) = match rm {
            Rm::Reg(r) => (0, r as u8 >> 3),
            Rm::Mem(m) => (
                m.index.map_or(0, |(index, _)| index as u8 >> 3),
                m.base as u8 >> 3,
            ),
        };
        let mut rex = 0x40 | (u8::from(enc.wide) << 3) | ((reg >> 3) << 2) | (x << 1) | b;
        // SPL/BPL/SIL/DIL need an empty REX to be addressable as bytes.
        let byte_needs_rex = enc.byte
            && ((4..8).contains(&reg) || matches!(rm, Rm::Reg(r) if (4..8).contains(&(r as u8))));
        if rex != 0x40 || byte_needs_rex {
            rex |= 0x40;
            self.buf.emit_u8(rex);
        }

        self.buf.emit_bytes(opcode);

        match rm {
            Rm::Reg(r) => self.buf.emit_u8(Self::modrm(0b11, reg, r.code())),
            Rm::Mem(m) => self.emit_mem(reg, m),
        }
    }

    fn emit_mem(&mut self, reg: u8, mem: Mem) {
        let base = mem.base.code();
        // [rbp]/[r13] has no disp-less form.
        let mode = if mem.disp == 0 && base != 0b101 {
            0b00
        } else if i8::try_from(mem.disp).is_ok() {
            0b01
        } else {
            0b10
        };

        match mem.index {
            None if base != 0b100 => self.buf.emit_u8(Self::modrm(mode, reg, base)),
            None => {
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf.emit_u8(Self::modrm(0b00, 0b100, base));
            }
            Some((index, scale)) => {
                let ss = match scale {
                    1 => 0b00,
                    2 => 0b01,
                    4 => 0b10,
                    _ => 0b11,
                };
                self.buf.emit_u8(Self::modrm(mode, reg, 0b100));
                self.buf.emit_u8(Self::modrm(ss, index.code(), base));
            }
        }

        match mode {
            0b01 => self.buf.emit_u8(mem.disp as u8),
            0b10 => self.buf.emit_u32(mem.disp as u32),
            _ => {}
        }
    }

    /// Group-1 ALU op with an immediate (`/ext`), short form when it fits.
    fn alu_imm(&mut self, enc: Enc, ext: u8, rm: Rm, imm: i32) {
        if i8::try_from(imm).is_ok() {
            self.emit(enc, &[0x83], ext, rm);
            self.buf.emit_u8(imm as u8);
        } else {
            self.emit(enc, &[0x81], ext, rm);
            self.buf.emit_u32(imm as u32);
        }
    }

    // ==================== Data Movement ====================

    /// MOV r64, r64
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.emit(Q, &[0x89], src as u8, dst.into());
    }

    /// MOV r32, r32
    pub fn mov32_rr(&mut self, dst: Reg, src: Reg) {
        self.emit(D, &[0x89], src as u8, dst.into());
    }

    /// MOV r64, imm64
    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.buf.emit_u8(0x48 | (dst as u8 >> 3));
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u64(imm as u64);
    }

    /// MOV r32, imm32
    pub fn mov32_ri(&mut self, dst: Reg, imm: i32) {
        if dst.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r64, [mem]
    pub fn mov_rm(&mut self, dst: Reg, src: Mem) {
        self.emit(Q, &[0x8B], dst as u8, src.into());
    }

    /// MOV [mem], r64
    pub fn mov_mr(&mut self, dst: Mem, src: Reg) {
        self.emit(Q, &[0x89], src as u8, dst.into());
    }

    /// MOV r32, [mem]
    pub fn mov32_rm(&mut self, dst: Reg, src: Mem) {
        self.emit(D, &[0x8B], dst as u8, src.into());
    }

    /// MOV [mem], r32
    pub fn mov32_mr(&mut self, dst: Mem, src: Reg) {
        self.emit(D, &[0x89], src as u8, dst.into());
    }

    /// MOV dword [mem], imm32
    pub fn mov32_mi(&mut self, dst: Mem, imm: i32) {
        self.emit(D, &[0xC7], 0, dst.into());
        self.buf.emit_u32(imm as u32);
    }

    /// MOV word [mem], r16
    pub fn mov16_mr(&mut self, dst: Mem, src: Reg) {
        let enc = Enc {
            prefix: Some(0x66),
            ..D
        };
        self.emit(enc, &[0x89], src as u8, dst.into());
    }

    /// MOV byte [mem], r8
    pub fn mov8_mr(&mut self, dst: Mem, src: Reg) {
        self.emit(B, &[0x88], src as u8, dst.into());
    }

    /// MOVZX r32, byte [mem]
    pub fn movzx32_m8(&mut self, dst: Reg, src: Mem) {
        self.emit(D, &[0x0F, 0xB6], dst as u8, src.into());
    }

    /// MOVZX r32, word [mem]
    pub fn movzx32_m16(&mut self, dst: Reg, src: Mem) {
        self.emit(D, &[0x0F, 0xB7], dst as u8, src.into());
    }

    /// MOVZX r32, r8
    pub fn movzx32_r8(&mut self, dst: Reg, src: Reg) {
        self.emit(B, &[0x0F, 0xB6], dst as u8, src.into());
    }

    /// MOVSX r32, r8
    pub fn movsx32_r8(&mut self, dst: Reg, src: Reg) {
        self.emit(B, &[0x0F, 0xBE], dst as u8, src.into());
    }

    /// MOVSXD r64, r32
    pub fn movsxd(&mut self, dst: Reg, src: Reg) {
        self.emit(Q, &[0x63], dst as u8, src.into());
    }

    /// LEA r64, [mem]
    pub fn lea(&mut self, dst: Reg, src: Mem) {
        self.emit(Q, &[0x8D], dst as u8, src.into());
    }

    /// LEA r32, [mem]
    pub fn lea32(&mut self, dst: Reg, src: Mem) {
        self.emit(D, &[0x8D], dst as u8, src.into());
    }

    /// XCHG r32, r32
    pub fn xchg32_rr(&mut self, a: Reg, b: Reg) {
        self.emit(D, &[0x87], a as u8, b.into());
    }

    pub fn push(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        if reg.needs_rex_ext() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ==================== Arithmetic Operations ====================

    /// ADD r64, r64
    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.emit(Q, &[0x01], src as u8, dst.into());
    }

    /// ADD r64, imm32 (sign-extended)
    pub fn add_ri32(&mut self, dst: Reg, imm: i32) {
        self.alu_imm(Q, 0, dst.into(), imm);
    }

    /// SUB r64, r64
    pub fn sub_rr(&mut self, dst: Reg, src: Reg) {
        self.emit(Q, &[0x29], src as u8, dst.into());
    }

    /// SUB r64, imm32 (sign-extended)
    pub fn sub_ri32(&mut self, dst: Reg, imm: i32) {
        self.alu_imm(Q, 5, dst.into(), imm);
    }

    /// AND r64, imm32 (sign-extended)
    pub fn and_ri32(&mut self, dst: Reg, imm: i32) {
        self.alu_imm(Q, 4, dst.into(), imm);
    }

    /// ADD r32, r32
    pub fn add32_rr(&mut self, dst: Reg, src: Reg) {
        self.emit(D, &[0x01], src as u8, dst.into());
    }

    /// ADD r32, imm32
    pub fn add32_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_imm(D, 0, dst.into(), imm);
    }

    /// ADD dword [mem], imm32
    pub fn add32_mi(&mut self, dst: Mem, imm: i32) {
        self.alu_imm(D, 0, dst.into(), imm);
    }

    /// ADD r32, [mem]
    pub fn add32_rm(&mut self, dst: Reg, src: Mem) {
        self.emit(D, &[0x03], dst as u8, src.into());
    }

    /// SUB r32, r32
    pub fn sub32_rr(&mut self, dst: Reg, src: Reg) {
        self.emit(D, &[0x29], src as u8, dst.into());
    }

    /// SUB r32, imm32
    pub fn sub32_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_imm(D, 5, dst.into(), imm);
    }

    /// AND r32, r32
    pub fn and32_rr(&mut self, dst: Reg, src: Reg) {
        self.emit(D, &[0x21], src as u8, dst.into());
    }

    /// AND r32, imm32
    pub fn and32_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_imm(D, 4, dst.into(), imm);
    }

    /// OR r32, r32
    pub fn or32_rr(&mut self, dst: Reg, src: Reg) {
        self.emit(D, &[0x09], src as u8, dst.into());
    }

    /// XOR r32, r32
    pub fn xor32_rr(&mut self, dst: Reg, src: Reg) {
        self.emit(D, &[0x31], src as u8, dst.into());
    }

    /// XOR r32, imm32
    pub fn xor32_ri(&mut self, dst: Reg, imm: i32) {
        self.alu_imm(D, 6, dst.into(), imm);
    }

    /// CMP r64, r64
    pub fn cmp_rr(&mut self, a: Reg, b: Reg) {
        self.emit(Q, &[0x39], b as u8, a.into());
    }

    /// CMP r32, r32
    pub fn cmp32_rr(&mut self, a: Reg, b: Reg) {
        self.emit(D, &[0x39], b as u8, a.into());
    }

    /// CMP r32, imm32
    pub fn cmp32_ri(&mut self, a: Reg, imm: i32) {
        self.alu_imm(D, 7, a.into(), imm);
    }

    /// CMP r32, [mem]
    pub fn cmp32_rm(&mut self, a: Reg, b: Mem) {
        self.emit(D, &[0x3B], a as u8, b.into());
    }

    /// CMP dword [mem], imm32
    pub fn cmp32_mi(&mut self, a: Mem, imm: i32) {
        self.alu_imm(D, 7, a.into(), imm);
    }

    /// TEST r32, r32
    pub fn test32_rr(&mut self, a: Reg, b: Reg) {
        self.emit(D, &[0x85], b as u8, a.into());
    }

    /// TEST r64, r64
    pub fn test_rr(&mut self, a: Reg, b: Reg) {
        self.emit(Q, &[0x85], b as u8, a.into());
    }

    /// NOT r32
    pub fn not32(&mut self, dst: Reg) {
        self.emit(D, &[0xF7], 2, dst.into());
    }

    /// NEG r32
    pub fn neg32(&mut self, dst: Reg) {
        self.emit(D, &[0xF7], 3, dst.into());
    }

    /// INC dword [mem]
    pub fn inc32_m(&mut self, dst: Mem) {
        self.emit(D, &[0xFF], 0, dst.into());
    }

    /// DEC dword [mem]
    pub fn dec32_m(&mut self, dst: Mem) {
        self.emit(D, &[0xFF], 1, dst.into());
    }

    /// IMUL r32, r32
    pub fn imul32_rr(&mut self, dst: Reg, src: Reg) {
        self.emit(D, &[0x0F, 0xAF], dst as u8, src.into());
    }

    /// IMUL r32, r32, imm32
    pub fn imul32_rri(&mut self, dst: Reg, src: Reg, imm: i32) {
        if i8::try_from(imm).is_ok() {
            self.emit(D, &[0x6B], dst as u8, src.into());
            self.buf.emit_u8(imm as u8);
        } else {
            self.emit(D, &[0x69], dst as u8, src.into());
            self.buf.emit_u32(imm as u32);
        }
    }

    /// CDQ (sign-extend EAX into EDX:EAX)
    pub fn cdq(&mut self) {
        self.buf.emit_u8(0x99);
    }

    /// IDIV r32 (EDX:EAX / r32, quotient in EAX, remainder in EDX)
    pub fn idiv32(&mut self, src: Reg) {
        self.emit(D, &[0xF7], 7, src.into());
    }

    /// DIV r32 (unsigned)
    pub fn div32(&mut self, src: Reg) {
        self.emit(D, &[0xF7], 6, src.into());
    }

    /// SHL r32, CL
    pub fn shl32_cl(&mut self, dst: Reg) {
        self.emit(D, &[0xD3], 4, dst.into());
    }

    /// SHR r32, CL
    pub fn shr32_cl(&mut self, dst: Reg) {
        self.emit(D, &[0xD3], 5, dst.into());
    }

    /// SAR r32, CL
    pub fn sar32_cl(&mut self, dst: Reg) {
        self.emit(D, &[0xD3], 7, dst.into());
    }

    /// SHL r32, imm8
    pub fn shl32_ri(&mut self, dst: Reg, imm: u8) {
        self.emit(D, &[0xC1], 4, dst.into());
        self.buf.emit_u8(imm);
    }

    /// SHR r32, imm8
    pub fn shr32_ri(&mut self, dst: Reg, imm: u8) {
        self.emit(D, &[0xC1], 5, dst.into());
        self.buf.emit_u8(imm);
    }

    /// SETcc r8
    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        self.emit(B, &[0x0F, 0x90 + cond as u8], 0, dst.into());
    }

    // ==================== String Operations ====================

    pub fn cld(&mut self) {
        self.buf.emit_u8(0xFC);
    }

    /// REP MOVSB
    pub fn rep_movsb(&mut self) {
        self.buf.emit_bytes(&[0xF3, 0xA4]);
    }

    /// REP STOSD
    pub fn rep_stosd(&mut self) {
        self.buf.emit_bytes(&[0xF3, 0xAB]);
    }

    /// REPE CMPSB
    pub fn repe_cmpsb(&mut self) {
        self.buf.emit_bytes(&[0xF3, 0xA6]);
    }

    // ==================== Control Flow ====================

    /// JMP rel32 to a label
    pub fn jmp(&mut self, target: Label) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_label_ref(target);
    }

    /// Jcc rel32 to a label
    pub fn jcc(&mut self, cond: Cond, target: Label) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_label_ref(target);
    }

    /// CALL rel32 to a label
    pub fn call(&mut self, target: Label) {
        self.buf.emit_u8(0xE8);
        self.buf.emit_label_ref(target);
    }

    /// CALL r64
    pub fn call_r(&mut self, reg: Reg) {
        self.emit(D, &[0xFF], 2, reg.into());
    }

    /// JMP r64
    pub fn jmp_r(&mut self, reg: Reg) {
        self.emit(D, &[0xFF], 4, reg.into());
    }

    /// Call an absolute address through R11.
    pub fn call_abs(&mut self, target: usize) {
        self.mov_ri64(Reg::R11, target as i64);
        self.call_r(Reg::R11);
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    pub fn int3(&mut self) {
        self.buf.emit_u8(0xCC);
    }

    // ==================== SSE (single precision) ====================

    /// MOVD xmm, r32
    pub fn movd_xmm_r32(&mut self, xmm: u8, src: Reg) {
        self.emit(sse(0x66), &[0x0F, 0x6E], xmm, src.into());
    }

    /// MOVD r32, xmm
    pub fn movd_r32_xmm(&mut self, dst: Reg, xmm: u8) {
        self.emit(sse(0x66), &[0x0F, 0x7E], xmm, dst.into());
    }

    /// MOVSS xmm, dword [mem]
    pub fn movss_xmm_m(&mut self, xmm: u8, src: Mem) {
        self.emit(sse(0xF3), &[0x0F, 0x10], xmm, src.into());
    }

    fn sse_ss(&mut self, op: u8, dst: u8, src: Mem) {
        self.emit(sse(0xF3), &[0x0F, op], dst, src.into());
    }

    /// ADDSS xmm, dword [mem]
    pub fn addss_m(&mut self, dst: u8, src: Mem) {
        self.sse_ss(0x58, dst, src);
    }

    /// SUBSS xmm, dword [mem]
    pub fn subss_m(&mut self, dst: u8, src: Mem) {
        self.sse_ss(0x5C, dst, src);
    }

    /// MULSS xmm, dword [mem]
    pub fn mulss_m(&mut self, dst: u8, src: Mem) {
        self.sse_ss(0x59, dst, src);
    }

    /// DIVSS xmm, dword [mem]
    pub fn divss_m(&mut self, dst: u8, src: Mem) {
        self.sse_ss(0x5E, dst, src);
    }

    /// SQRTSS xmm, dword [mem]
    pub fn sqrtss_m(&mut self, dst: u8, src: Mem) {
        self.sse_ss(0x51, dst, src);
    }

    /// CVTSI2SS xmm, dword [mem]
    pub fn cvtsi2ss_m(&mut self, dst: u8, src: Mem) {
        self.sse_ss(0x2A, dst, src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(f: impl FnOnce(&mut X86_64Assembler<'_>)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        f(&mut asm);
        buf.code().to_vec()
    }

    #[test]
    fn test_mov_rr() {
        // MOV RBP, RSP = 48 89 E5
        assert_eq!(assemble(|a| a.mov_rr(Reg::Rbp, Reg::Rsp)), [0x48, 0x89, 0xE5]);
        // MOV R12, RDI = 49 89 FC
        assert_eq!(assemble(|a| a.mov_rr(Reg::R12, Reg::Rdi)), [0x49, 0x89, 0xFC]);
    }

    #[test]
    fn test_mov32_rr() {
        // MOV EAX, ECX = 89 C8
        assert_eq!(assemble(|a| a.mov32_rr(Reg::Rax, Reg::Rcx)), [0x89, 0xC8]);
    }

    #[test]
    fn test_mov_ri64() {
        // MOV R11, imm64 = 49 BB imm64
        let code = assemble(|a| a.mov_ri64(Reg::R11, 0x1122334455667788));
        assert_eq!(
            code,
            [0x49, 0xBB, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_mov32_ri() {
        // MOV EAX, 7 = B8 07 00 00 00
        assert_eq!(assemble(|a| a.mov32_ri(Reg::Rax, 7)), [0xB8, 7, 0, 0, 0]);
        // MOV R8D, -1 = 41 B8 FF FF FF FF
        assert_eq!(
            assemble(|a| a.mov32_ri(Reg::R8, -1)),
            [0x41, 0xB8, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_mov_rm_r12_base_needs_sib() {
        // MOV RSP, [R12 + 0] = 49 8B 24 24
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rsp, Mem::base(Reg::R12, 0))),
            [0x49, 0x8B, 0x24, 0x24]
        );
        // MOV RBX, [R12 + 16] = 49 8B 5C 24 10
        assert_eq!(
            assemble(|a| a.mov_rm(Reg::Rbx, Mem::base(Reg::R12, 16))),
            [0x49, 0x8B, 0x5C, 0x24, 0x10]
        );
    }

    #[test]
    fn test_mov32_rm_r13_base_needs_disp() {
        // MOV EAX, [R13 + 0] = 41 8B 45 00
        assert_eq!(
            assemble(|a| a.mov32_rm(Reg::Rax, Mem::base(Reg::R13, 0))),
            [0x41, 0x8B, 0x45, 0x00]
        );
    }

    #[test]
    fn test_mov32_rm_disp32() {
        // MOV EAX, [RBX + 0x1000] = 8B 83 00 10 00 00
        assert_eq!(
            assemble(|a| a.mov32_rm(Reg::Rax, Mem::base(Reg::Rbx, 0x1000))),
            [0x8B, 0x83, 0x00, 0x10, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov32_rm_indexed() {
        // MOV EAX, [RBX + RAX] = 8B 04 03
        assert_eq!(
            assemble(|a| a.mov32_rm(Reg::Rax, Mem::indexed(Reg::Rbx, Reg::Rax, 1, 0))),
            [0x8B, 0x04, 0x03]
        );
        // LEA EAX, [RCX + RAX*4] = 8D 04 81
        assert_eq!(
            assemble(|a| a.lea32(Reg::Rax, Mem::indexed(Reg::Rcx, Reg::Rax, 4, 0))),
            [0x8D, 0x04, 0x81]
        );
    }

    #[test]
    fn test_mov32_mr() {
        // MOV [R14 + 12], EAX = 41 89 46 0C
        assert_eq!(
            assemble(|a| a.mov32_mr(Mem::base(Reg::R14, 12), Reg::Rax)),
            [0x41, 0x89, 0x46, 0x0C]
        );
    }

    #[test]
    fn test_mov32_mi() {
        // MOV DWORD [R13 + 0], 5 = 41 C7 45 00 05 00 00 00
        assert_eq!(
            assemble(|a| a.mov32_mi(Mem::base(Reg::R13, 0), 5)),
            [0x41, 0xC7, 0x45, 0x00, 0x05, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_byte_and_word_stores() {
        // MOV [RBX + RCX], AL = 88 04 0B
        assert_eq!(
            assemble(|a| a.mov8_mr(Mem::indexed(Reg::Rbx, Reg::Rcx, 1, 0), Reg::Rax)),
            [0x88, 0x04, 0x0B]
        );
        // MOV [RBX + RCX], AX = 66 89 04 0B
        assert_eq!(
            assemble(|a| a.mov16_mr(Mem::indexed(Reg::Rbx, Reg::Rcx, 1, 0), Reg::Rax)),
            [0x66, 0x89, 0x04, 0x0B]
        );
    }

    #[test]
    fn test_movzx_movsx() {
        // MOVZX EAX, AL = 0F B6 C0
        assert_eq!(assemble(|a| a.movzx32_r8(Reg::Rax, Reg::Rax)), [0x0F, 0xB6, 0xC0]);
        // MOVSX ECX, CL = 0F BE C9
        assert_eq!(assemble(|a| a.movsx32_r8(Reg::Rcx, Reg::Rcx)), [0x0F, 0xBE, 0xC9]);
        // MOVZX EAX, BYTE [RBX + RAX] = 0F B6 04 03
        assert_eq!(
            assemble(|a| a.movzx32_m8(Reg::Rax, Mem::indexed(Reg::Rbx, Reg::Rax, 1, 0))),
            [0x0F, 0xB6, 0x04, 0x03]
        );
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(assemble(|a| a.push(Reg::Rbp)), [0x55]);
        assert_eq!(assemble(|a| a.push(Reg::R15)), [0x41, 0x57]);
        assert_eq!(assemble(|a| a.pop(Reg::R12)), [0x41, 0x5C]);
    }

    #[test]
    fn test_add_sub_imm() {
        // ADD R13, 8 = 49 83 C5 08
        assert_eq!(assemble(|a| a.add_ri32(Reg::R13, 8)), [0x49, 0x83, 0xC5, 0x08]);
        // SUB RSP, 8 = 48 83 EC 08
        assert_eq!(assemble(|a| a.sub_ri32(Reg::Rsp, 8)), [0x48, 0x83, 0xEC, 0x08]);
        // ADD EAX, 0x1000 = 81 C0 00 10 00 00
        assert_eq!(
            assemble(|a| a.add32_ri(Reg::Rax, 0x1000)),
            [0x81, 0xC0, 0x00, 0x10, 0x00, 0x00]
        );
        // AND RSP, -16 = 48 83 E4 F0
        assert_eq!(assemble(|a| a.and_ri32(Reg::Rsp, -16)), [0x48, 0x83, 0xE4, 0xF0]);
    }

    #[test]
    fn test_alu32() {
        // ADD EAX, ECX = 01 C8
        assert_eq!(assemble(|a| a.add32_rr(Reg::Rax, Reg::Rcx)), [0x01, 0xC8]);
        // SUB EAX, ECX = 29 C8
        assert_eq!(assemble(|a| a.sub32_rr(Reg::Rax, Reg::Rcx)), [0x29, 0xC8]);
        // XOR EAX, EAX = 31 C0
        assert_eq!(assemble(|a| a.xor32_rr(Reg::Rax, Reg::Rax)), [0x31, 0xC0]);
        // CMP EAX, ECX = 39 C8
        assert_eq!(assemble(|a| a.cmp32_rr(Reg::Rax, Reg::Rcx)), [0x39, 0xC8]);
        // NOT EAX = F7 D0
        assert_eq!(assemble(|a| a.not32(Reg::Rax)), [0xF7, 0xD0]);
        // NEG EAX = F7 D8
        assert_eq!(assemble(|a| a.neg32(Reg::Rax)), [0xF7, 0xD8]);
    }

    #[test]
    fn test_mul_div() {
        // IMUL EAX, ECX = 0F AF C1
        assert_eq!(assemble(|a| a.imul32_rr(Reg::Rax, Reg::Rcx)), [0x0F, 0xAF, 0xC1]);
        // IMUL EAX, EAX, 3 = 6B C0 03
        assert_eq!(assemble(|a| a.imul32_rri(Reg::Rax, Reg::Rax, 3)), [0x6B, 0xC0, 0x03]);
        // IDIV ECX = F7 F9
        assert_eq!(assemble(|a| a.idiv32(Reg::Rcx)), [0xF7, 0xF9]);
        // DIV ECX = F7 F1
        assert_eq!(assemble(|a| a.div32(Reg::Rcx)), [0xF7, 0xF1]);
    }

    #[test]
    fn test_shifts() {
        // SHL EAX, CL = D3 E0
        assert_eq!(assemble(|a| a.shl32_cl(Reg::Rax)), [0xD3, 0xE0]);
        // SAR EAX, CL = D3 F8
        assert_eq!(assemble(|a| a.sar32_cl(Reg::Rax)), [0xD3, 0xF8]);
        // SHR ECX, 2 = C1 E9 02
        assert_eq!(assemble(|a| a.shr32_ri(Reg::Rcx, 2)), [0xC1, 0xE9, 0x02]);
    }

    #[test]
    fn test_setcc() {
        // SETL AL = 0F 9C C0
        assert_eq!(assemble(|a| a.setcc(Cond::L, Reg::Rax)), [0x0F, 0x9C, 0xC0]);
        // SETE SIL = 40 0F 94 C6
        assert_eq!(assemble(|a| a.setcc(Cond::E, Reg::Rsi)), [0x40, 0x0F, 0x94, 0xC6]);
    }

    #[test]
    fn test_indirect_branches() {
        // CALL RSI = FF D6
        assert_eq!(assemble(|a| a.call_r(Reg::Rsi)), [0xFF, 0xD6]);
        // JMP RSI = FF E6
        assert_eq!(assemble(|a| a.jmp_r(Reg::Rsi)), [0xFF, 0xE6]);
        // CALL R11 = 41 FF D3
        assert_eq!(assemble(|a| a.call_r(Reg::R11)), [0x41, 0xFF, 0xD3]);
    }

    #[test]
    fn test_label_jumps() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        let top = asm.new_label();
        let done = asm.new_label();
        asm.bind(top);
        asm.jcc(Cond::E, done);
        asm.jmp(top);
        asm.bind(done);
        asm.ret();
        let code = buf.finish().unwrap();
        // JE +5 ; JMP -11 ; RET
        assert_eq!(
            code,
            [0x0F, 0x84, 0x05, 0x00, 0x00, 0x00, 0xE9, 0xF5, 0xFF, 0xFF, 0xFF, 0xC3]
        );
    }

    #[test]
    fn test_sse() {
        // MOVD XMM0, EAX = 66 0F 6E C0
        assert_eq!(assemble(|a| a.movd_xmm_r32(0, Reg::Rax)), [0x66, 0x0F, 0x6E, 0xC0]);
        // MOVD EAX, XMM0 = 66 0F 7E C0
        assert_eq!(assemble(|a| a.movd_r32_xmm(Reg::Rax, 0)), [0x66, 0x0F, 0x7E, 0xC0]);
        // ADDSS XMM0, [R13 + 8] = F3 41 0F 58 45 08
        assert_eq!(
            assemble(|a| a.addss_m(0, Mem::base(Reg::R13, 8))),
            [0xF3, 0x41, 0x0F, 0x58, 0x45, 0x08]
        );
        // CVTSI2SS XMM0, [R13 + 4] = F3 41 0F 2A 45 04
        assert_eq!(
            assemble(|a| a.cvtsi2ss_m(0, Mem::base(Reg::R13, 4))),
            [0xF3, 0x41, 0x0F, 0x2A, 0x45, 0x04]
        );
    }

    #[test]
    fn test_string_ops() {
        assert_eq!(assemble(|a| a.rep_movsb()), [0xF3, 0xA4]);
        assert_eq!(assemble(|a| a.rep_stosd()), [0xF3, 0xAB]);
        assert_eq!(assemble(|a| a.repe_cmpsb()), [0xF3, 0xA6]);
    }

    #[test]
    fn test_cond_invert() {
        assert_eq!(Cond::L.invert(), Cond::Ge);
        assert_eq!(Cond::A.invert(), Cond::Be);
        assert_eq!(Cond::E.invert().invert(), Cond::E);
    }
}
