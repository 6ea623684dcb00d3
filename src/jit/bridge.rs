//! Runtime bridge between generated code and the host.
//!
//! Generated code keeps the VM registers in machine registers (see
//! [`regs`](super::codegen::regs)) and uses the native stack only for return
//! addresses. Everything here either switches between that discipline and
//! the System V one, or is called from generated code across that switch:
//!
//! - the entry stub, which the host calls to run a compiled function;
//! - the halt stubs, which unwind straight back to the entry stub;
//! - [`ExternalCode`], the paired save/restore around every call out;
//! - `jit_sysreq` and `jit_resolve`, the trampolines behind `SYSREQ.*` and
//!   computed jumps.

use std::mem::offset_of;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

use super::codebuf::Label;
use super::codegen::regs::{ALT, DATA, FRM, PRI, STATE, STK};
use super::compiler::Jitter;
use super::vm::AmxVm;
use super::x86_64::{Mem, Reg, X86_64Assembler};
use crate::amx::{Amx, AmxError, CELL_SIZE, Cell, Registers};

/// A host function callable from bytecode.
///
/// `params[0]` is the argument size in bytes, followed by the arguments.
pub type NativeFn = fn(&mut NativeCall<'_, '_>, &[Cell]) -> Result<Cell, AmxError>;

/// Per-call state shared between the host and generated code. Lives on the
/// host stack for the duration of one `call_function`.
#[repr(C)]
pub(crate) struct ExecState {
    /// Native stack pointer inside the entry stub, restored on halt.
    halt_rsp: u64,
    regs: *mut Registers,
    data: *mut u8,
    /// Type-erased `*const Jitter`.
    jitter: *const (),
    retval: Cell,
    error: Cell,
}

impl ExecState {
    pub(crate) fn new(vm: AmxVm<'_>, jitter: &Jitter<'_>) -> Self {
        Self {
            halt_rsp: 0,
            regs: vm.regs_ptr(),
            data: vm.data_base(),
            jitter: (jitter as *const Jitter<'_>).cast(),
            retval: 0,
            error: 0,
        }
    }

    pub(crate) fn retval(&self) -> Cell {
        self.retval
    }
}

const HALT_RSP: i32 = offset_of!(ExecState, halt_rsp) as i32;
const REGS: i32 = offset_of!(ExecState, regs) as i32;
const DATA_PTR: i32 = offset_of!(ExecState, data) as i32;
pub(crate) const RETVAL: i32 = offset_of!(ExecState, retval) as i32;
pub(crate) const ERROR: i32 = offset_of!(ExecState, error) as i32;

pub(crate) const REG_PRI: i32 = offset_of!(Registers, pri) as i32;
pub(crate) const REG_ALT: i32 = offset_of!(Registers, alt) as i32;
pub(crate) const REG_FRM: i32 = offset_of!(Registers, frm) as i32;
pub(crate) const REG_STK: i32 = offset_of!(Registers, stk) as i32;
pub(crate) const REG_HEA: i32 = offset_of!(Registers, hea) as i32;
pub(crate) const REG_HLW: i32 = offset_of!(Registers, hlw) as i32;
pub(crate) const REG_STP: i32 = offset_of!(Registers, stp) as i32;

/// The entry stub: `status = entry(state, target)`.
pub(crate) type EntryFn = unsafe extern "C" fn(*mut ExecState, *const u8) -> Cell;

/// Shared stubs every compiled image carries.
pub(crate) struct Runtime {
    /// Unwind to the entry stub with the status in EAX.
    pub halt_common: Label,
    /// Unwind with the status recorded in `ExecState::error`.
    pub halt_pending: Label,
}

/// `mov rdx, [state + REGS]`
pub(crate) fn load_regs_ptr(asm: &mut X86_64Assembler<'_>, dst: Reg) {
    asm.mov_rm(dst, Mem::base(STATE, REGS));
}

/// Store the data-relative value of an absolute pointer register.
fn store_relative(asm: &mut X86_64Assembler<'_>, regs: Reg, field: i32, abs: Reg) {
    asm.mov32_rr(Reg::Rsi, abs);
    asm.sub32_rr(Reg::Rsi, DATA);
    asm.mov32_mr(Mem::base(regs, field), Reg::Rsi);
}

/// Load a data-relative register field as an absolute pointer.
fn load_absolute(asm: &mut X86_64Assembler<'_>, abs: Reg, regs: Reg, field: i32) {
    asm.mov32_rm(abs, Mem::base(regs, field));
    asm.add_rr(abs, DATA);
}

/// Emit the entry stub (at the current offset, expected to be 0) and the
/// shared halt paths.
pub(crate) fn emit_runtime(asm: &mut X86_64Assembler<'_>) -> Runtime {
    const SAVED: [Reg; 6] = [Reg::Rbp, Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

    let exit = asm.new_label();
    let halt_common = asm.new_label();
    let halt_pending = asm.new_label();

    for reg in SAVED {
        asm.push(reg);
    }
    // Six pushes plus the return address leave RSP 8 off alignment.
    asm.sub_ri32(Reg::Rsp, 8);
    asm.mov_rr(STATE, Reg::Rdi);
    asm.mov_mr(Mem::base(STATE, HALT_RSP), Reg::Rsp);
    asm.mov_rm(DATA, Mem::base(STATE, DATA_PTR));
    load_regs_ptr(asm, Reg::Rdx);
    load_absolute(asm, STK, Reg::Rdx, REG_STK);
    load_absolute(asm, FRM, Reg::Rdx, REG_FRM);
    asm.mov32_rm(PRI, Mem::base(Reg::Rdx, REG_PRI));
    asm.mov32_rm(ALT, Mem::base(Reg::Rdx, REG_ALT));
    asm.call_r(Reg::Rsi);
    asm.mov32_mr(Mem::base(STATE, RETVAL), PRI);
    asm.xor32_rr(Reg::Rax, Reg::Rax);

    asm.bind(exit);
    load_regs_ptr(asm, Reg::Rdx);
    store_relative(asm, Reg::Rdx, REG_STK, STK);
    store_relative(asm, Reg::Rdx, REG_FRM, FRM);
    asm.add_ri32(Reg::Rsp, 8);
    for reg in SAVED.into_iter().rev() {
        asm.pop(reg);
    }
    asm.ret();

    asm.bind(halt_pending);
    asm.mov32_rm(Reg::Rax, Mem::base(STATE, ERROR));
    asm.bind(halt_common);
    asm.mov_rm(Reg::Rsp, Mem::base(STATE, HALT_RSP));
    asm.jmp(exit);

    Runtime {
        halt_common,
        halt_pending,
    }
}

/// Scope in which generated code runs System V code.
///
/// Construction spills PRI, ALT, STK and FRM into the register file and
/// switches to an aligned native frame; dropping the guard switches back and
/// reloads ALT, STK and FRM. EAX is left untouched on exit so a callee's
/// return value survives.
pub(crate) struct ExternalCode<'g, 'a> {
    asm: &'g mut X86_64Assembler<'a>,
}

impl<'g, 'a> ExternalCode<'g, 'a> {
    pub(crate) fn begin(asm: &'g mut X86_64Assembler<'a>) -> Self {
        load_regs_ptr(asm, Reg::Rdx);
        asm.mov32_mr(Mem::base(Reg::Rdx, REG_PRI), PRI);
        asm.mov32_mr(Mem::base(Reg::Rdx, REG_ALT), ALT);
        store_relative(asm, Reg::Rdx, REG_STK, STK);
        store_relative(asm, Reg::Rdx, REG_FRM, FRM);
        asm.push(Reg::Rbp);
        asm.mov_rr(Reg::Rbp, Reg::Rsp);
        asm.and_ri32(Reg::Rsp, -16);
        Self { asm }
    }
}

impl<'a> Deref for ExternalCode<'_, 'a> {
    type Target = X86_64Assembler<'a>;

    fn deref(&self) -> &Self::Target {
        self.asm
    }
}

impl DerefMut for ExternalCode<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.asm
    }
}

impl Drop for ExternalCode<'_, '_> {
    fn drop(&mut self) {
        let asm = &mut *self.asm;
        asm.mov_rr(Reg::Rsp, Reg::Rbp);
        asm.pop(Reg::Rbp);
        load_regs_ptr(asm, Reg::Rdx);
        load_absolute(asm, STK, Reg::Rdx, REG_STK);
        load_absolute(asm, FRM, Reg::Rdx, REG_FRM);
        asm.mov32_rm(ALT, Mem::base(Reg::Rdx, REG_ALT));
    }
}

/// Where the argument block of a native call comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgBlock {
    /// The bytecode already pushed the byte-count cell (`SYSREQ.C`,
    /// `SYSREQ.PRI`) and releases the block itself.
    OnStack,
    /// The dispatcher pushes the byte count and releases the count and the
    /// arguments afterwards (`SYSREQ.N`).
    Push(Cell),
}

/// Ownership of the argument block of one in-flight native call.
///
/// Dropping the context puts the VM stack pointer back where the native call
/// expects to leave it, whatever the outcome of the call.
pub struct CallContext<'a> {
    vm: AmxVm<'a>,
    block: ArgBlock,
    stk: Cell,
    params: Cell,
}

impl<'a> CallContext<'a> {
    pub fn open(vm: AmxVm<'a>, block: ArgBlock) -> Result<Self, AmxError> {
        let stk = vm.stk();
        if let ArgBlock::Push(nbytes) = block {
            vm.push(nbytes)?;
        }
        Ok(Self {
            vm,
            block,
            stk,
            params: vm.stk(),
        })
    }

    /// Data address of the byte-count cell.
    pub fn params_address(&self) -> Cell {
        self.params
    }

    /// Copy of the parameter block, count cell first.
    pub fn params(&self) -> Result<Vec<Cell>, AmxError> {
        let nbytes = self.vm.cell(self.params)?;
        let count = usize::try_from(nbytes).map_err(|_| AmxError::Params)? / CELL_SIZE;
        (0..=count)
            .map(|n| self.vm.cell(self.params + (n * CELL_SIZE) as Cell))
            .collect()
    }
}

impl Drop for CallContext<'_> {
    fn drop(&mut self) {
        let stk = match self.block {
            ArgBlock::OnStack => self.stk,
            ArgBlock::Push(nbytes) => self.stk + nbytes,
        };
        self.vm.set_stk(stk);
    }
}

/// Handle given to a native function for the duration of its call.
pub struct NativeCall<'j, 'a> {
    jitter: &'j Jitter<'a>,
    params: Cell,
}

impl<'j, 'a> NativeCall<'j, 'a> {
    pub fn amx(&mut self) -> &mut Amx {
        // SAFETY: while a native runs, generated code is suspended and the
        // bridge holds no references into the instance.
        unsafe { self.jitter.vm().amx_mut() }
    }

    pub fn vm(&self) -> AmxVm<'a> {
        self.jitter.vm()
    }

    /// Data address of `params[0]`, for natives that write through
    /// reference arguments.
    pub fn params_address(&self) -> Cell {
        self.params
    }

    pub fn jitter(&self) -> &'j Jitter<'a> {
        self.jitter
    }

    /// Call compiled code at `address`, using cells pushed with
    /// [`Amx::push`] as arguments.
    pub fn call_function(&mut self, address: Cell) -> Result<Cell, AmxError> {
        self.jitter.call_function(address)
    }

    pub fn call_public_function(&mut self, index: usize) -> Result<Cell, AmxError> {
        self.jitter.call_public_function(index)
    }
}

fn dispatch(jitter: &Jitter<'_>, index: Cell, block: ArgBlock) -> Result<Cell, AmxError> {
    let vm = jitter.vm();
    let context = CallContext::open(vm, block)?;

    let index = usize::try_from(index).map_err(|_| AmxError::Index)?;
    let handle = vm.native_address(index).ok_or(AmxError::Index)?;
    let func = vm.amx().native_fn(handle).ok_or(AmxError::NotFound)?;
    let params = context.params()?;

    let mut call = NativeCall {
        jitter,
        params: context.params_address(),
    };
    func(&mut call, &params)
}

/// Native dispatch for `SYSREQ.*`. With `push`, the dispatcher pushes
/// `nbytes` as the count cell; otherwise the count cell is already on the
/// stack and `nbytes` is ignored.
pub(crate) extern "C" fn jit_sysreq(state: *mut ExecState, index: Cell, nbytes: Cell, push: bool) -> Cell {
    // SAFETY: generated code passes the state of the call in progress.
    let state = unsafe { &mut *state };
    // SAFETY: the jitter outlives every call it runs.
    let jitter = unsafe { &*state.jitter.cast::<Jitter<'_>>() };

    let block = if push {
        ArgBlock::Push(nbytes)
    } else {
        ArgBlock::OnStack
    };
    let result = panic::catch_unwind(AssertUnwindSafe(|| dispatch(jitter, index, block)))
        .unwrap_or_else(|_| {
            warn!(index, "native function panicked");
            Err(AmxError::Native)
        });

    match result {
        Ok(value) => value,
        Err(err) => {
            state.error = err.code();
            0
        }
    }
}

/// Translate a computed bytecode target. Returns null (with the error
/// recorded) when the address was never compiled.
pub(crate) extern "C" fn jit_resolve(state: *mut ExecState, address: Cell) -> *const u8 {
    // SAFETY: as in `jit_sysreq`.
    let state = unsafe { &mut *state };
    // SAFETY: as in `jit_sysreq`.
    let jitter = unsafe { &*state.jitter.cast::<Jitter<'_>>() };

    match jitter.get_instr_ptr(address) {
        Some(ptr) => ptr,
        None => {
            warn!(address, "computed jump to an address that was not compiled");
            state.error = AmxError::InvalidInstruction.code();
            std::ptr::null()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amx::{ImageBuilder, Opcode};

    #[test]
    fn test_exec_state_layout() {
        assert_eq!(HALT_RSP, 0);
        assert_eq!(REGS, 8);
        assert_eq!(DATA_PTR, 16);
        assert_eq!(RETVAL, 32);
        assert_eq!(ERROR, 36);
        assert_eq!(REG_STK, 12);
    }

    #[test]
    fn test_entry_stub_prologue() {
        let mut buf = crate::jit::codebuf::CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        emit_runtime(&mut asm);
        // push rbp; push rbx; push r12; push r13; push r14; push r15
        assert_eq!(
            &buf.code()[..10],
            &[0x55, 0x53, 0x41, 0x54, 0x41, 0x55, 0x41, 0x56, 0x41, 0x57]
        );
    }

    #[test]
    fn test_external_code_is_paired() {
        let mut buf = crate::jit::codebuf::CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        {
            let mut ext = ExternalCode::begin(&mut asm);
            ext.int3();
        }
        let code = buf.code();
        let int3 = code.iter().position(|&b| b == 0xCC).unwrap();
        // and rsp, -16 right before the body; mov rsp, rbp; pop rbp right after.
        assert_eq!(&code[int3 - 4..int3], &[0x48, 0x83, 0xE4, 0xF0]);
        assert_eq!(&code[int3 + 1..int3 + 5], &[0x48, 0x89, 0xEC, 0x5D]);
    }

    fn image_with_args(args: &[Cell]) -> Amx {
        let mut b = ImageBuilder::new();
        b.op(Opcode::Retn);
        let mut amx = b.load().unwrap();
        for &arg in args.iter().rev() {
            amx.push(arg).unwrap();
        }
        amx
    }

    #[test]
    fn test_call_context_on_stack() {
        let mut amx = image_with_args(&[8, 10, 20]);
        let vm = AmxVm::new(&mut amx);
        let stk = vm.stk();
        {
            let context = CallContext::open(vm, ArgBlock::OnStack).unwrap();
            assert_eq!(context.params().unwrap(), vec![8, 10, 20]);
            vm.push(99).unwrap();
        }
        assert_eq!(vm.stk(), stk);
    }

    #[test]
    fn test_call_context_push_releases_args() {
        let mut amx = image_with_args(&[10, 20]);
        let vm = AmxVm::new(&mut amx);
        let stk = vm.stk();
        {
            let context = CallContext::open(vm, ArgBlock::Push(8)).unwrap();
            assert_eq!(vm.stk(), stk - 4);
            assert_eq!(context.params().unwrap(), vec![8, 10, 20]);
        }
        assert_eq!(vm.stk(), stk + 8);
    }
}
