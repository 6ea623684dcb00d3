//! Template translation of AMX instructions to x86-64.
//!
//! Every opcode has one handler in a table indexed by opcode value. A handler
//! appends the native equivalent of a single instruction; control flow
//! between instructions goes through labels keyed by bytecode address.

use std::sync::LazyLock;

use thiserror::Error;

use super::bridge::{
    self, ERROR, ExternalCode, REG_HEA, REG_HLW, REG_PRI, REG_STP, RETVAL, Runtime, jit_resolve,
    jit_sysreq,
};
use super::codebuf::{CodeBufferError, Label};
use super::disasm::DecodeError;
use super::instruction::Instruction;
use super::intrinsics::{self, Args};
use super::labels::{LabelTable, LabelTag, TaggedAddress};
use super::vm::AmxVm;
use super::x86_64::{Cond, Mem, Reg, X86_64Assembler};
use crate::amx::{AmxError, CELL_SIZE, Cell, Opcode, STACK_MARGIN};
use crate::config::JitConfig;

/// Register conventions for generated code.
///
/// The VM registers live in callee-saved machine registers for the whole
/// run; STK and FRM are kept as absolute addresses:
/// - RAX: PRI
/// - RCX: ALT
/// - RBX: base of the data segment
/// - R12: the `ExecState` of the current call
/// - R13: STK
/// - R14: FRM
/// - RDX, RSI, RDI, R8-R10: scratch
/// - R11: call target scratch
pub mod regs {
    use super::Reg;

    pub const PRI: Reg = Reg::Rax;
    pub const ALT: Reg = Reg::Rcx;
    pub const DATA: Reg = Reg::Rbx;
    pub const STATE: Reg = Reg::R12;
    pub const STK: Reg = Reg::R13;
    pub const FRM: Reg = Reg::R14;

    pub const TMP0: Reg = Reg::Rdx;
    pub const TMP1: Reg = Reg::Rsi;
    pub const TMP2: Reg = Reg::Rdi;
    pub const SAVE: Reg = Reg::R8;
}

use regs::{ALT, DATA, FRM, PRI, SAVE, STATE, STK, TMP0, TMP1, TMP2};

const CELL: Cell = CELL_SIZE as Cell;

/// Why compilation stopped.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{instr}: {reason}")]
    Unsupported {
        instr: Instruction,
        reason: &'static str,
    },
    #[error("{instr}: target {target:#010x} is outside the code segment")]
    TargetOutOfRange { instr: Instruction, target: Cell },
    #[error("{instr}: data address {address:#010x} is outside the data segment")]
    DataOutOfRange { instr: Instruction, address: Cell },
    #[error("{target:#010x} (referenced at {referrer:#010x}) is not an instruction boundary")]
    NotAnInstruction { target: Cell, referrer: Cell },
    #[error(transparent)]
    Code(#[from] CodeBufferError),
}

impl CompileError {
    /// The instruction being translated when the error occurred, if any.
    pub fn instruction(&self) -> Option<&Instruction> {
        match self {
            CompileError::Unsupported { instr, .. }
            | CompileError::TargetOutOfRange { instr, .. }
            | CompileError::DataOutOfRange { instr, .. } => Some(instr),
            _ => None,
        }
    }

    /// Bytecode address the error refers to, if any.
    pub fn address(&self) -> Option<Cell> {
        match self {
            CompileError::Decode(err) => Some(err.address()),
            CompileError::NotAnInstruction { referrer, .. } => Some(*referrer),
            _ => self.instruction().map(Instruction::address),
        }
    }
}

type Handler = fn(&mut CodeGen<'_, '_>, &Instruction) -> Result<(), CompileError>;

static HANDLERS: LazyLock<Vec<Handler>> =
    LazyLock::new(|| Opcode::all().iter().map(|&opcode| handler(opcode)).collect());

/// First operand. The decoder guarantees the operand count of fixed-arity
/// opcodes, so a missing operand is a bug in the table.
fn arg(instr: &Instruction) -> Cell {
    instr.operand(0).unwrap_or_default()
}

fn data(addr: Cell) -> Mem {
    Mem::base(DATA, addr)
}

fn frame(offset: Cell) -> Mem {
    Mem::base(FRM, offset)
}

/// The data cell addressed by a data-relative register.
fn at(reg: Reg) -> Mem {
    Mem::indexed(DATA, reg, 1, 0)
}

fn top() -> Mem {
    Mem::base(STK, 0)
}

/// Per-compilation translation state.
pub(crate) struct CodeGen<'g, 'a> {
    asm: X86_64Assembler<'g>,
    labels: LabelTable,
    runtime: Runtime,
    /// Halt stubs, emitted after the last instruction.
    halts: Vec<(AmxError, Label)>,
    vm: AmxVm<'a>,
    config: JitConfig,
    code_size: Cell,
    data_size: Cell,
    inlined: usize,
}

impl<'g, 'a> CodeGen<'g, 'a> {
    /// Start a translation; emits the runtime stubs first so the entry stub
    /// sits at offset 0.
    pub(crate) fn new(mut asm: X86_64Assembler<'g>, vm: AmxVm<'a>, config: JitConfig) -> Self {
        let runtime = bridge::emit_runtime(&mut asm);
        Self {
            asm,
            labels: LabelTable::new(),
            runtime,
            halts: Vec::new(),
            vm,
            config,
            code_size: vm.code_size() as Cell,
            data_size: vm.data_size() as Cell,
            inlined: 0,
        }
    }

    pub(crate) fn offset(&self) -> usize {
        self.asm.offset()
    }

    /// Translate one instruction at the current offset.
    pub(crate) fn translate(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let key = TaggedAddress::new(instr.address(), LabelTag::Instr);
        self.labels.bind(&mut self.asm, key);
        (HANDLERS[instr.opcode() as usize])(self, instr)
    }

    /// Emit the halt stubs and check that every branch landed on an
    /// instruction. Returns the number of inlined native calls.
    pub(crate) fn finish(mut self) -> Result<usize, CompileError> {
        if let Some((key, referrer)) = self.labels.unbound().next() {
            return Err(CompileError::NotAnInstruction {
                target: key.address,
                referrer: referrer.unwrap_or(key.address),
            });
        }
        for (error, label) in std::mem::take(&mut self.halts) {
            self.asm.bind(label);
            self.asm.mov32_ri(Reg::Rax, error.code());
            self.asm.jmp(self.runtime.halt_common);
        }
        Ok(self.inlined)
    }

    // ==================== Helpers ====================

    /// Label of the stub that halts with `error`.
    fn halt(&mut self, error: AmxError) -> Label {
        if let Some(&(_, label)) = self.halts.iter().find(|(e, _)| *e == error) {
            return label;
        }
        let label = self.asm.new_label();
        self.halts.push((error, label));
        label
    }

    /// Label of the instruction at `target`, validated against the code
    /// segment.
    fn target(&mut self, instr: &Instruction, target: Cell, tag: LabelTag) -> Result<Label, CompileError> {
        if target < 0 || target >= self.code_size || target % CELL != 0 {
            return Err(CompileError::TargetOutOfRange {
                instr: instr.clone(),
                target,
            });
        }
        Ok(self
            .labels
            .get(&mut self.asm, TaggedAddress::new(target, tag), instr.address()))
    }

    /// The data cell named by the first operand, validated against the data
    /// segment.
    fn direct(&self, instr: &Instruction) -> Result<Mem, CompileError> {
        let address = arg(instr);
        if address < 0 || address > self.data_size - CELL {
            return Err(CompileError::DataOutOfRange {
                instr: instr.clone(),
                address,
            });
        }
        Ok(data(address))
    }

    /// Byte count of a block operation; must be a non-negative multiple of
    /// `unit`.
    fn block_len(instr: &Instruction, unit: Cell) -> Result<Cell, CompileError> {
        let len = arg(instr);
        if len < 0 {
            return Err(Self::unsupported(instr, "negative block length"));
        }
        if len % unit != 0 {
            return Err(Self::unsupported(instr, "block length is not a whole number of cells"));
        }
        Ok(len)
    }

    fn unsupported(instr: &Instruction, reason: &'static str) -> CompileError {
        CompileError::Unsupported {
            instr: instr.clone(),
            reason,
        }
    }

    /// `dst = abs - DATA`
    fn relative(&mut self, dst: Reg, abs: Reg) {
        self.asm.mov32_rr(dst, abs);
        self.asm.sub32_rr(dst, DATA);
    }

    /// `abs = DATA + rel`
    fn absolute(&mut self, abs: Reg, rel: Reg) {
        self.asm.mov32_rr(abs, rel);
        self.asm.add_rr(abs, DATA);
    }

    /// Halt with `MemoryAccess` unless `[reg, reg + len)` lies inside the
    /// data segment. `reg` holds a data-relative address.
    fn check_range(&mut self, reg: Reg, len: Cell) {
        if !self.config.memory_checks {
            return;
        }
        let fault = self.halt(AmxError::MemoryAccess);
        if len > self.data_size {
            self.asm.jmp(fault);
            return;
        }
        self.asm.cmp32_ri(reg, self.data_size - len);
        self.asm.jcc(Cond::A, fault);
    }

    fn check_cell(&mut self, reg: Reg) {
        self.check_range(reg, CELL);
    }

    /// Halt with `StackError` when STK has come within the margin of HEA.
    fn check_margin(&mut self) {
        let fault = self.halt(AmxError::StackError);
        bridge::load_regs_ptr(&mut self.asm, TMP0);
        self.asm.mov32_rm(TMP1, Mem::base(TMP0, REG_HEA));
        self.asm.add32_ri(TMP1, STACK_MARGIN);
        self.relative(TMP2, STK);
        self.asm.cmp32_rr(TMP1, TMP2);
        self.asm.jcc(Cond::G, fault);
    }

    fn push_reg(&mut self, reg: Reg) {
        self.asm.sub_ri32(STK, CELL);
        self.asm.mov32_mr(top(), reg);
    }

    fn push_imm(&mut self, value: Cell) {
        self.asm.sub_ri32(STK, CELL);
        self.asm.mov32_mi(top(), value);
    }

    fn pop_reg(&mut self, reg: Reg) {
        self.asm.mov32_rm(reg, top());
        self.asm.add_ri32(STK, CELL);
    }

    /// `PRI = (PRI <cond> ALT)`
    fn compare(&mut self, cond: Cond) {
        self.asm.cmp32_rr(PRI, ALT);
        self.set_pri(cond);
    }

    fn set_pri(&mut self, cond: Cond) {
        self.asm.setcc(cond, PRI);
        self.asm.movzx32_r8(PRI, PRI);
    }

    // ==================== Memory ====================

    fn emit_lref(&mut self, dst: Reg, slot: Mem) {
        self.asm.mov32_rm(dst, slot);
        self.check_cell(dst);
        self.asm.mov32_rm(dst, at(dst));
    }

    fn emit_sref(&mut self, src: Reg, slot: Mem) {
        self.asm.mov32_rm(TMP0, slot);
        self.check_cell(TMP0);
        self.asm.mov32_mr(at(TMP0), src);
    }

    fn emit_load_i(&mut self) {
        self.check_cell(PRI);
        self.asm.mov32_rm(PRI, at(PRI));
    }

    fn emit_lodb_i(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let width = arg(instr);
        if !matches!(width, 1 | 2 | 4) {
            return Err(Self::unsupported(instr, "access width must be 1, 2 or 4"));
        }
        self.check_range(PRI, width);
        match width {
            1 => self.asm.movzx32_m8(PRI, at(PRI)),
            2 => self.asm.movzx32_m16(PRI, at(PRI)),
            _ => self.asm.mov32_rm(PRI, at(PRI)),
        }
        Ok(())
    }

    fn emit_stor_i(&mut self) {
        self.check_cell(ALT);
        self.asm.mov32_mr(at(ALT), PRI);
    }

    fn emit_strb_i(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let width = arg(instr);
        if !matches!(width, 1 | 2 | 4) {
            return Err(Self::unsupported(instr, "access width must be 1, 2 or 4"));
        }
        self.check_range(ALT, width);
        match width {
            1 => self.asm.mov8_mr(at(ALT), PRI),
            2 => self.asm.mov16_mr(at(ALT), PRI),
            _ => self.asm.mov32_mr(at(ALT), PRI),
        }
        Ok(())
    }

    fn emit_lidx(&mut self) {
        self.asm.lea32(PRI, Mem::indexed(ALT, PRI, 4, 0));
        self.emit_load_i();
    }

    fn emit_lidx_b(&mut self, shift: Cell) {
        self.emit_idxaddr_b(shift);
        self.emit_load_i();
    }

    fn emit_idxaddr_b(&mut self, shift: Cell) {
        self.asm.shl32_ri(PRI, shift as u8);
        self.asm.add32_rr(PRI, ALT);
    }

    fn emit_addr(&mut self, dst: Reg, offset: Cell) {
        self.asm.lea32(dst, frame(offset));
        self.asm.sub32_rr(dst, DATA);
    }

    fn emit_align(&mut self, reg: Reg, width: Cell) {
        if (0..CELL).contains(&width) {
            self.asm.xor32_ri(reg, CELL - width);
        }
    }

    fn emit_inc_i(&mut self, delta: Cell) {
        self.check_cell(PRI);
        if delta > 0 {
            self.asm.inc32_m(at(PRI));
        } else {
            self.asm.dec32_m(at(PRI));
        }
    }

    fn emit_movs(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let len = Self::block_len(instr, 1)?;
        self.check_range(PRI, len);
        self.check_range(ALT, len);
        self.asm.mov32_rr(SAVE, ALT);
        self.asm.lea(TMP1, at(PRI));
        self.asm.lea(TMP2, at(ALT));
        self.asm.mov32_ri(Reg::Rcx, len);
        self.asm.rep_movsb();
        self.asm.mov32_rr(ALT, SAVE);
        Ok(())
    }

    fn emit_cmps(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let len = Self::block_len(instr, 1)?;
        self.check_range(PRI, len);
        self.check_range(ALT, len);
        self.asm.mov32_rr(SAVE, ALT);
        self.asm.lea(TMP1, at(ALT));
        self.asm.lea(TMP2, at(PRI));
        self.asm.xor32_rr(PRI, PRI);
        self.asm.mov32_ri(Reg::Rcx, len);
        self.asm.repe_cmpsb();
        self.asm.setcc(Cond::A, PRI);
        self.asm.setcc(Cond::B, TMP0);
        self.asm.movzx32_r8(TMP0, TMP0);
        self.asm.sub32_rr(PRI, TMP0);
        self.asm.mov32_rr(ALT, SAVE);
        Ok(())
    }

    fn emit_fill(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let len = Self::block_len(instr, CELL)?;
        self.check_range(ALT, len);
        self.asm.mov32_rr(SAVE, ALT);
        self.asm.lea(TMP2, at(ALT));
        self.asm.mov32_ri(Reg::Rcx, len / CELL);
        self.asm.rep_stosd();
        self.asm.mov32_rr(ALT, SAVE);
        Ok(())
    }

    // ==================== Special registers ====================

    fn emit_lctrl(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let header = self.vm.header();
        match arg(instr) {
            0 => self.asm.mov32_ri(PRI, header.cod),
            1 => self.asm.mov32_ri(PRI, header.dat),
            2 => {
                bridge::load_regs_ptr(&mut self.asm, TMP0);
                self.asm.mov32_rm(PRI, Mem::base(TMP0, REG_HEA));
            }
            3 => {
                bridge::load_regs_ptr(&mut self.asm, TMP0);
                self.asm.mov32_rm(PRI, Mem::base(TMP0, REG_STP));
            }
            4 => self.relative(PRI, STK),
            5 => self.relative(PRI, FRM),
            6 => self.asm.mov32_ri(PRI, instr.next_address()),
            _ => return Err(Self::unsupported(instr, "unknown control register")),
        }
        Ok(())
    }

    fn emit_sctrl(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        match arg(instr) {
            2 => {
                bridge::load_regs_ptr(&mut self.asm, TMP0);
                self.asm.mov32_mr(Mem::base(TMP0, REG_HEA), PRI);
            }
            4 => self.absolute(STK, PRI),
            5 => self.absolute(FRM, PRI),
            6 => self.emit_computed(None),
            _ => return Err(Self::unsupported(instr, "control register is not writable")),
        }
        Ok(())
    }

    // ==================== Stack ====================

    fn emit_push_r(&mut self, count: Cell) {
        if count <= 0 {
            return;
        }
        let again = self.asm.new_label();
        self.asm.mov32_ri(TMP0, count);
        self.asm.bind(again);
        self.push_reg(PRI);
        self.asm.sub32_ri(TMP0, 1);
        self.asm.jcc(Cond::Ne, again);
    }

    fn emit_push_adr(&mut self, offset: Cell) {
        self.emit_addr(TMP0, offset);
        self.push_reg(TMP0);
    }

    fn emit_swap(&mut self, reg: Reg) {
        self.asm.mov32_rm(TMP0, top());
        self.asm.mov32_mr(top(), reg);
        self.asm.mov32_rr(reg, TMP0);
    }

    fn emit_stack(&mut self, delta: Cell) {
        self.relative(ALT, STK);
        if delta == 0 {
            return;
        }
        self.asm.add_ri32(STK, delta);
        if delta > 0 {
            let fault = self.halt(AmxError::StackLow);
            bridge::load_regs_ptr(&mut self.asm, TMP0);
            self.relative(TMP1, STK);
            self.asm.cmp32_rm(TMP1, Mem::base(TMP0, REG_STP));
            self.asm.jcc(Cond::G, fault);
        } else {
            self.check_margin();
        }
    }

    fn emit_heap(&mut self, delta: Cell) {
        let low = self.halt(AmxError::HeapLow);
        let overflow = self.halt(AmxError::StackError);
        bridge::load_regs_ptr(&mut self.asm, TMP0);
        self.asm.mov32_rm(ALT, Mem::base(TMP0, REG_HEA));
        self.asm.mov32_rr(TMP1, ALT);
        self.asm.add32_ri(TMP1, delta);
        self.asm.mov32_mr(Mem::base(TMP0, REG_HEA), TMP1);
        self.asm.cmp32_rm(TMP1, Mem::base(TMP0, REG_HLW));
        self.asm.jcc(Cond::L, low);
        self.asm.add32_ri(TMP1, STACK_MARGIN);
        self.relative(TMP2, STK);
        self.asm.cmp32_rr(TMP1, TMP2);
        self.asm.jcc(Cond::G, overflow);
    }

    // ==================== Calls ====================

    fn emit_proc(&mut self) {
        self.relative(TMP0, FRM);
        self.push_reg(TMP0);
        self.asm.mov_rr(FRM, STK);
        self.check_margin();
    }

    fn emit_ret(&mut self) {
        self.asm.mov32_rm(TMP0, top());
        self.asm.add_ri32(STK, 2 * CELL);
        self.asm.lea(FRM, Mem::indexed(DATA, TMP0, 1, 0));
        self.asm.ret();
    }

    /// Like `RET`, and also drops the arguments whose byte count sits above
    /// the return address.
    fn emit_retn(&mut self) {
        self.asm.mov32_rm(TMP0, top());
        self.asm.mov32_rm(TMP1, Mem::base(STK, 2 * CELL));
        self.asm.lea(FRM, Mem::indexed(DATA, TMP0, 1, 0));
        self.asm.lea(STK, Mem::indexed(STK, TMP1, 1, 3 * CELL));
        self.asm.ret();
    }

    fn emit_call(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let target = self.target(instr, arg(instr), LabelTag::Instr)?;
        self.push_imm(instr.next_address());
        self.asm.call(target);
        Ok(())
    }

    /// Transfer to the bytecode address in PRI. With `return_to`, pushes it
    /// and calls; otherwise jumps.
    fn emit_computed(&mut self, return_to: Option<Cell>) {
        if let Some(address) = return_to {
            self.push_imm(address);
        }
        {
            let mut ext = ExternalCode::begin(&mut self.asm);
            ext.mov_rr(Reg::Rdi, STATE);
            ext.mov32_rr(Reg::Rsi, PRI);
            ext.call_abs(jit_resolve as *const () as usize);
            ext.mov_rr(TMP1, Reg::Rax);
        }
        self.asm.test_rr(TMP1, TMP1);
        self.asm.jcc(Cond::E, self.runtime.halt_pending);
        bridge::load_regs_ptr(&mut self.asm, TMP0);
        self.asm.mov32_rm(PRI, Mem::base(TMP0, REG_PRI));
        if return_to.is_some() {
            self.asm.call_r(TMP1);
        } else {
            self.asm.jmp_r(TMP1);
        }
    }

    /// `SYSREQ.*`. `index: None` takes the native index from PRI; `nbytes:
    /// None` means the count cell is already on the stack.
    fn emit_sysreq(&mut self, index: Option<Cell>, nbytes: Option<Cell>) {
        if let Some(index) = index {
            if self.emit_intrinsic(index, nbytes) {
                return;
            }
        }
        {
            let mut ext = ExternalCode::begin(&mut self.asm);
            ext.mov_rr(Reg::Rdi, STATE);
            match index {
                Some(index) => ext.mov32_ri(Reg::Rsi, index),
                None => ext.mov32_rr(Reg::Rsi, PRI),
            }
            ext.mov32_ri(Reg::Rdx, nbytes.unwrap_or(0));
            ext.mov32_ri(Reg::Rcx, Cell::from(nbytes.is_some()));
            ext.call_abs(jit_sysreq as *const () as usize);
        }
        self.asm.cmp32_mi(Mem::base(STATE, ERROR), 0);
        self.asm.jcc(Cond::Ne, self.runtime.halt_pending);
    }

    fn emit_intrinsic(&mut self, index: Cell, nbytes: Option<Cell>) -> bool {
        if !self.config.intrinsics {
            return false;
        }
        let Some(intrinsic) = usize::try_from(index)
            .ok()
            .and_then(|index| self.vm.native_name(index))
            .and_then(intrinsics::find)
        else {
            return false;
        };
        match nbytes {
            Some(nbytes) if nbytes != (intrinsic.arity * CELL_SIZE) as Cell => false,
            Some(nbytes) => {
                (intrinsic.emit)(&mut self.asm, Args(0));
                self.asm.add_ri32(STK, nbytes);
                self.inlined += 1;
                true
            }
            None => {
                (intrinsic.emit)(&mut self.asm, Args(CELL));
                self.inlined += 1;
                true
            }
        }
    }

    fn emit_halt(&mut self, code: Cell) {
        self.asm.mov32_mr(Mem::base(STATE, RETVAL), PRI);
        self.asm.mov32_ri(Reg::Rax, code);
        self.asm.jmp(self.runtime.halt_common);
    }

    fn emit_bounds(&mut self, limit: Cell) {
        let fault = self.halt(AmxError::Bounds);
        self.asm.cmp32_ri(PRI, limit);
        self.asm.jcc(Cond::A, fault);
    }

    // ==================== Branches ====================

    fn emit_jump(&mut self, instr: &Instruction, target: Cell) -> Result<(), CompileError> {
        let label = self.target(instr, target, LabelTag::Instr)?;
        self.asm.jmp(label);
        Ok(())
    }

    fn emit_jump_if_zero(&mut self, instr: &Instruction, cond: Cond) -> Result<(), CompileError> {
        let label = self.target(instr, arg(instr), LabelTag::Instr)?;
        self.asm.test32_rr(PRI, PRI);
        self.asm.jcc(cond, label);
        Ok(())
    }

    fn emit_jump_if(&mut self, instr: &Instruction, cond: Cond) -> Result<(), CompileError> {
        let label = self.target(instr, arg(instr), LabelTag::Instr)?;
        self.asm.cmp32_rr(PRI, ALT);
        self.asm.jcc(cond, label);
        Ok(())
    }

    fn emit_switch(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let table = self.target(instr, arg(instr), LabelTag::CaseTable)?;
        self.asm.jmp(table);
        Ok(())
    }

    /// Only reachable through `SWITCH`; falling into a case table from the
    /// previous instruction dispatches as well.
    fn emit_casetbl(&mut self, instr: &Instruction) -> Result<(), CompileError> {
        let default = self.target(instr, instr.operand(1).unwrap_or_default(), LabelTag::Instr)?;
        let key = TaggedAddress::new(instr.address(), LabelTag::CaseTable);
        self.labels.bind(&mut self.asm, key);
        for (value, address) in instr.cases() {
            let label = self.target(instr, address, LabelTag::Instr)?;
            self.asm.cmp32_ri(PRI, value);
            self.asm.jcc(Cond::E, label);
        }
        self.asm.jmp(default);
        Ok(())
    }

    // ==================== Arithmetic ====================

    /// Signed division rounding toward negative infinity; quotient to PRI,
    /// remainder to ALT. With `swap`, divides ALT by PRI.
    fn emit_sdiv(&mut self, swap: bool) {
        let fault = self.halt(AmxError::Divide);
        let general = self.asm.new_label();
        let store = self.asm.new_label();
        let done = self.asm.new_label();
        if swap {
            self.asm.xchg32_rr(PRI, ALT);
        }
        self.asm.test32_rr(ALT, ALT);
        self.asm.jcc(Cond::E, fault);
        // IDIV traps on i32::MIN / -1.
        self.asm.cmp32_ri(ALT, -1);
        self.asm.jcc(Cond::Ne, general);
        self.asm.neg32(PRI);
        self.asm.xor32_rr(ALT, ALT);
        self.asm.jmp(done);

        self.asm.bind(general);
        self.asm.cdq();
        self.asm.idiv32(ALT);
        self.asm.test32_rr(TMP0, TMP0);
        self.asm.jcc(Cond::E, store);
        self.asm.mov32_rr(TMP1, TMP0);
        self.asm.xor32_rr(TMP1, ALT);
        self.asm.jcc(Cond::Ns, store);
        self.asm.sub32_ri(PRI, 1);
        self.asm.add32_rr(TMP0, ALT);
        self.asm.bind(store);
        self.asm.mov32_rr(ALT, TMP0);
        self.asm.bind(done);
    }

    fn emit_udiv(&mut self, swap: bool) {
        let fault = self.halt(AmxError::Divide);
        if swap {
            self.asm.xchg32_rr(PRI, ALT);
        }
        self.asm.test32_rr(ALT, ALT);
        self.asm.jcc(Cond::E, fault);
        self.asm.xor32_rr(TMP0, TMP0);
        self.asm.div32(ALT);
        self.asm.mov32_rr(ALT, TMP0);
    }

    fn emit_shift(&mut self, opcode: Opcode) {
        match opcode {
            Opcode::Shl => self.asm.shl32_cl(PRI),
            Opcode::Shr => self.asm.shr32_cl(PRI),
            _ => self.asm.sar32_cl(PRI),
        }
    }
}

/// Handler for one opcode.
fn handler(opcode: Opcode) -> Handler {
    use Opcode as O;

    match opcode {
        O::None => |_, i| Err(CodeGen::unsupported(i, "invalid instruction")),

        O::LoadPri => |g, i| {
            let cell = g.direct(i)?;
            Ok(g.asm.mov32_rm(PRI, cell))
        },
        O::LoadAlt => |g, i| {
            let cell = g.direct(i)?;
            Ok(g.asm.mov32_rm(ALT, cell))
        },
        O::LoadSPri => |g, i| Ok(g.asm.mov32_rm(PRI, frame(arg(i)))),
        O::LoadSAlt => |g, i| Ok(g.asm.mov32_rm(ALT, frame(arg(i)))),
        O::LrefPri => |g, i| {
            let slot = g.direct(i)?;
            Ok(g.emit_lref(PRI, slot))
        },
        O::LrefAlt => |g, i| {
            let slot = g.direct(i)?;
            Ok(g.emit_lref(ALT, slot))
        },
        O::LrefSPri => |g, i| Ok(g.emit_lref(PRI, frame(arg(i)))),
        O::LrefSAlt => |g, i| Ok(g.emit_lref(ALT, frame(arg(i)))),
        O::LoadI => |g, _| Ok(g.emit_load_i()),
        O::LodbI => |g, i| g.emit_lodb_i(i),
        O::ConstPri => |g, i| Ok(g.asm.mov32_ri(PRI, arg(i))),
        O::ConstAlt => |g, i| Ok(g.asm.mov32_ri(ALT, arg(i))),
        O::AddrPri => |g, i| Ok(g.emit_addr(PRI, arg(i))),
        O::AddrAlt => |g, i| Ok(g.emit_addr(ALT, arg(i))),
        O::StorPri => |g, i| {
            let cell = g.direct(i)?;
            Ok(g.asm.mov32_mr(cell, PRI))
        },
        O::StorAlt => |g, i| {
            let cell = g.direct(i)?;
            Ok(g.asm.mov32_mr(cell, ALT))
        },
        O::StorSPri => |g, i| Ok(g.asm.mov32_mr(frame(arg(i)), PRI)),
        O::StorSAlt => |g, i| Ok(g.asm.mov32_mr(frame(arg(i)), ALT)),
        O::SrefPri => |g, i| {
            let slot = g.direct(i)?;
            Ok(g.emit_sref(PRI, slot))
        },
        O::SrefAlt => |g, i| {
            let slot = g.direct(i)?;
            Ok(g.emit_sref(ALT, slot))
        },
        O::SrefSPri => |g, i| Ok(g.emit_sref(PRI, frame(arg(i)))),
        O::SrefSAlt => |g, i| Ok(g.emit_sref(ALT, frame(arg(i)))),
        O::StorI => |g, _| Ok(g.emit_stor_i()),
        O::StrbI => |g, i| g.emit_strb_i(i),
        O::Lidx => |g, _| Ok(g.emit_lidx()),
        O::LidxB => |g, i| Ok(g.emit_lidx_b(arg(i))),
        O::Idxaddr => |g, _| Ok(g.asm.lea32(PRI, Mem::indexed(ALT, PRI, 4, 0))),
        O::IdxaddrB => |g, i| Ok(g.emit_idxaddr_b(arg(i))),
        O::AlignPri => |g, i| Ok(g.emit_align(PRI, arg(i))),
        O::AlignAlt => |g, i| Ok(g.emit_align(ALT, arg(i))),
        O::Lctrl => |g, i| g.emit_lctrl(i),
        O::Sctrl => |g, i| g.emit_sctrl(i),
        O::MovePri => |g, _| Ok(g.asm.mov32_rr(PRI, ALT)),
        O::MoveAlt => |g, _| Ok(g.asm.mov32_rr(ALT, PRI)),
        O::Xchg => |g, _| Ok(g.asm.xchg32_rr(PRI, ALT)),

        O::PushPri => |g, _| Ok(g.push_reg(PRI)),
        O::PushAlt => |g, _| Ok(g.push_reg(ALT)),
        O::PushR => |g, i| Ok(g.emit_push_r(arg(i))),
        O::PushC => |g, i| Ok(g.push_imm(arg(i))),
        O::Push => |g, i| {
            let cell = g.direct(i)?;
            g.asm.mov32_rm(TMP0, cell);
            Ok(g.push_reg(TMP0))
        },
        O::PushS => |g, i| {
            g.asm.mov32_rm(TMP0, frame(arg(i)));
            Ok(g.push_reg(TMP0))
        },
        O::PopPri => |g, _| Ok(g.pop_reg(PRI)),
        O::PopAlt => |g, _| Ok(g.pop_reg(ALT)),
        O::Stack => |g, i| Ok(g.emit_stack(arg(i))),
        O::Heap => |g, i| Ok(g.emit_heap(arg(i))),
        O::Proc => |g, _| Ok(g.emit_proc()),
        O::Ret => |g, _| Ok(g.emit_ret()),
        O::Retn => |g, _| Ok(g.emit_retn()),
        O::Call => |g, i| g.emit_call(i),
        O::CallPri => |g, i| Ok(g.emit_computed(Some(i.next_address()))),

        O::Jump => |g, i| g.emit_jump(i, arg(i)),
        O::Jrel => |g, i| g.emit_jump(i, i.next_address().wrapping_add(arg(i))),
        O::Jzer => |g, i| g.emit_jump_if_zero(i, Cond::E),
        O::Jnz => |g, i| g.emit_jump_if_zero(i, Cond::Ne),
        O::Jeq => |g, i| g.emit_jump_if(i, Cond::E),
        O::Jneq => |g, i| g.emit_jump_if(i, Cond::Ne),
        O::Jless => |g, i| g.emit_jump_if(i, Cond::B),
        O::Jleq => |g, i| g.emit_jump_if(i, Cond::Be),
        O::Jgrtr => |g, i| g.emit_jump_if(i, Cond::A),
        O::Jgeq => |g, i| g.emit_jump_if(i, Cond::Ae),
        O::Jsless => |g, i| g.emit_jump_if(i, Cond::L),
        O::Jsleq => |g, i| g.emit_jump_if(i, Cond::Le),
        O::Jsgrtr => |g, i| g.emit_jump_if(i, Cond::G),
        O::Jsgeq => |g, i| g.emit_jump_if(i, Cond::Ge),

        O::Shl | O::Shr | O::Sshr => |g, i| Ok(g.emit_shift(i.opcode())),
        O::ShlCPri => |g, i| Ok(g.asm.shl32_ri(PRI, arg(i) as u8)),
        O::ShlCAlt => |g, i| Ok(g.asm.shl32_ri(ALT, arg(i) as u8)),
        O::ShrCPri => |g, i| Ok(g.asm.shr32_ri(PRI, arg(i) as u8)),
        O::ShrCAlt => |g, i| Ok(g.asm.shr32_ri(ALT, arg(i) as u8)),
        O::Smul | O::Umul => |g, _| Ok(g.asm.imul32_rr(PRI, ALT)),
        O::Sdiv => |g, _| Ok(g.emit_sdiv(false)),
        O::SdivAlt => |g, _| Ok(g.emit_sdiv(true)),
        O::Udiv => |g, _| Ok(g.emit_udiv(false)),
        O::UdivAlt => |g, _| Ok(g.emit_udiv(true)),
        O::Add => |g, _| Ok(g.asm.add32_rr(PRI, ALT)),
        O::Sub => |g, _| Ok(g.asm.sub32_rr(PRI, ALT)),
        O::SubAlt => |g, _| {
            g.asm.neg32(PRI);
            Ok(g.asm.add32_rr(PRI, ALT))
        },
        O::And => |g, _| Ok(g.asm.and32_rr(PRI, ALT)),
        O::Or => |g, _| Ok(g.asm.or32_rr(PRI, ALT)),
        O::Xor => |g, _| Ok(g.asm.xor32_rr(PRI, ALT)),
        O::Not => |g, _| {
            g.asm.test32_rr(PRI, PRI);
            Ok(g.set_pri(Cond::E))
        },
        O::Neg => |g, _| Ok(g.asm.neg32(PRI)),
        O::Invert => |g, _| Ok(g.asm.not32(PRI)),
        O::AddC => |g, i| Ok(g.asm.add32_ri(PRI, arg(i))),
        O::SmulC => |g, i| Ok(g.asm.imul32_rri(PRI, PRI, arg(i))),
        O::ZeroPri => |g, _| Ok(g.asm.xor32_rr(PRI, PRI)),
        O::ZeroAlt => |g, _| Ok(g.asm.xor32_rr(ALT, ALT)),
        O::Zero => |g, i| {
            let cell = g.direct(i)?;
            Ok(g.asm.mov32_mi(cell, 0))
        },
        O::ZeroS => |g, i| Ok(g.asm.mov32_mi(frame(arg(i)), 0)),
        O::SignPri => |g, _| Ok(g.asm.movsx32_r8(PRI, PRI)),
        O::SignAlt => |g, _| Ok(g.asm.movsx32_r8(ALT, ALT)),

        O::Eq => |g, _| Ok(g.compare(Cond::E)),
        O::Neq => |g, _| Ok(g.compare(Cond::Ne)),
        O::Less => |g, _| Ok(g.compare(Cond::B)),
        O::Leq => |g, _| Ok(g.compare(Cond::Be)),
        O::Grtr => |g, _| Ok(g.compare(Cond::A)),
        O::Geq => |g, _| Ok(g.compare(Cond::Ae)),
        O::Sless => |g, _| Ok(g.compare(Cond::L)),
        O::Sleq => |g, _| Ok(g.compare(Cond::Le)),
        O::Sgrtr => |g, _| Ok(g.compare(Cond::G)),
        O::Sgeq => |g, _| Ok(g.compare(Cond::Ge)),
        O::EqCPri => |g, i| {
            g.asm.cmp32_ri(PRI, arg(i));
            Ok(g.set_pri(Cond::E))
        },
        O::EqCAlt => |g, i| {
            g.asm.cmp32_ri(ALT, arg(i));
            Ok(g.set_pri(Cond::E))
        },

        O::IncPri => |g, _| Ok(g.asm.add32_ri(PRI, 1)),
        O::IncAlt => |g, _| Ok(g.asm.add32_ri(ALT, 1)),
        O::Inc => |g, i| {
            let cell = g.direct(i)?;
            Ok(g.asm.inc32_m(cell))
        },
        O::IncS => |g, i| Ok(g.asm.inc32_m(frame(arg(i)))),
        O::IncI => |g, _| Ok(g.emit_inc_i(1)),
        O::DecPri => |g, _| Ok(g.asm.sub32_ri(PRI, 1)),
        O::DecAlt => |g, _| Ok(g.asm.sub32_ri(ALT, 1)),
        O::Dec => |g, i| {
            let cell = g.direct(i)?;
            Ok(g.asm.dec32_m(cell))
        },
        O::DecS => |g, i| Ok(g.asm.dec32_m(frame(arg(i)))),
        O::DecI => |g, _| Ok(g.emit_inc_i(-1)),

        O::Movs => |g, i| g.emit_movs(i),
        O::Cmps => |g, i| g.emit_cmps(i),
        O::Fill => |g, i| g.emit_fill(i),
        O::Halt => |g, i| Ok(g.emit_halt(arg(i))),
        O::Bounds => |g, i| Ok(g.emit_bounds(arg(i))),
        O::SysreqPri => |g, _| Ok(g.emit_sysreq(None, None)),
        O::SysreqC => |g, i| Ok(g.emit_sysreq(Some(arg(i)), None)),
        O::SysreqN => |g, i| {
            let nbytes = i.operand(1).unwrap_or_default();
            if nbytes < 0 || nbytes % CELL != 0 {
                return Err(CodeGen::unsupported(i, "argument size is not a whole number of cells"));
            }
            Ok(g.emit_sysreq(Some(arg(i)), Some(nbytes)))
        },
        O::JumpPri => |g, _| Ok(g.emit_computed(None)),
        O::Switch => |g, i| g.emit_switch(i),
        O::Casetbl => |g, i| g.emit_casetbl(i),
        O::SwapPri => |g, _| Ok(g.emit_swap(PRI)),
        O::SwapAlt => |g, _| Ok(g.emit_swap(ALT)),
        O::PushAdr => |g, i| Ok(g.emit_push_adr(arg(i))),

        O::File | O::Line | O::Symbol | O::Srange | O::Symtag | O::Nop | O::Break => |_, _| Ok(()),
    }
}
