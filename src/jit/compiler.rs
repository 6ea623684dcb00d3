//! Whole-image compilation and execution.
//!
//! [`Jitter`] translates the code segment of one AMX instance in a single
//! pass and runs functions from the result. The compiled buffer and its
//! bytecode-to-native map are published together, and only once the whole
//! image translated without error.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use super::bridge::{EntryFn, ExecState};
use super::codebuf::CodeBuffer;
use super::codegen::{CodeGen, CompileError};
use super::disasm::Disassembler;
use super::instruction::Instruction;
use super::memory::ExecutableMemory;
use super::vm::AmxVm;
use super::x86_64::X86_64Assembler;
use crate::amx::{Amx, AmxError, CELL_SIZE, Cell};
use crate::config::JitConfig;

/// Native bytes reserved per code byte before the buffer has to grow.
const CODE_EXPANSION: usize = 8;

/// Output of a successful compilation.
struct Compiled {
    code: ExecutableMemory,
    /// Bytecode address to offset in `code`, one entry per instruction.
    code_map: BTreeMap<Cell, usize>,
    inlined: usize,
}

/// JIT compiler and runner for one AMX instance.
pub struct Jitter<'a> {
    vm: AmxVm<'a>,
    config: JitConfig,
    compiled: Option<Compiled>,
}

impl<'a> Jitter<'a> {
    pub fn new(amx: &'a mut Amx) -> Self {
        Self::with_config(amx, JitConfig::default())
    }

    pub fn with_config(amx: &'a mut Amx, config: JitConfig) -> Self {
        Self {
            vm: AmxVm::new(amx),
            config,
            compiled: None,
        }
    }

    pub fn vm(&self) -> AmxVm<'a> {
        self.vm
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    /// Compile the whole code segment, replacing any earlier result.
    pub fn compile(&mut self) -> Result<(), CompileError> {
        self.compile_with_handler(|_, _| {})
    }

    /// Like [`compile`](Self::compile), reporting a failure to `on_error`
    /// before returning it. Nothing is published on failure.
    pub fn compile_with_handler<F>(&mut self, mut on_error: F) -> Result<(), CompileError>
    where
        F: FnMut(&AmxVm<'a>, &CompileError),
    {
        self.compiled = None;
        debug!(code_size = self.vm.code_size(), intrinsics = self.config.intrinsics, "compiling image");
        match self.translate() {
            Ok(compiled) => {
                debug!(
                    instructions = compiled.code_map.len(),
                    native_bytes = compiled.code.len(),
                    inlined = compiled.inlined,
                    "compiled image"
                );
                self.compiled = Some(compiled);
                Ok(())
            }
            Err(err) => {
                warn!(address = ?err.address(), "compilation failed: {err}");
                on_error(&self.vm, &err);
                Err(err)
            }
        }
    }

    fn translate(&self) -> Result<Compiled, CompileError> {
        let vm = self.vm;
        let mut buf = CodeBuffer::with_capacity(vm.code_size() * CODE_EXPANSION);
        let mut code_map = BTreeMap::new();

        let mut cg = CodeGen::new(X86_64Assembler::new(&mut buf), vm, self.config);
        let mut disasm = Disassembler::new(&vm);
        let mut instr = Instruction::default();
        while disasm.decode_into(&mut instr)? {
            trace!(offset = cg.offset(), "{instr}");
            code_map.insert(instr.address(), cg.offset());
            cg.translate(&instr)?;
        }
        let inlined = cg.finish()?;

        Ok(Compiled {
            code: buf.finalize()?,
            code_map,
            inlined,
        })
    }

    /// The compiled machine code, if compilation succeeded.
    pub fn code(&self) -> Option<&[u8]> {
        self.compiled.as_ref().map(|c| c.code.bytes())
    }

    /// Size in bytes of the compiled machine code; 0 before compilation.
    pub fn code_size(&self) -> usize {
        self.compiled.as_ref().map_or(0, |c| c.code.len())
    }

    /// Number of native calls replaced by inline code.
    pub fn inlined_natives(&self) -> usize {
        self.compiled.as_ref().map_or(0, |c| c.inlined)
    }

    /// Offset of the native code for the instruction at `address`.
    pub fn get_instr_offset(&self, address: Cell) -> Option<usize> {
        self.compiled.as_ref()?.code_map.get(&address).copied()
    }

    /// Native entry point of the instruction at `address`.
    pub fn get_instr_ptr(&self, address: Cell) -> Option<*const u8> {
        let compiled = self.compiled.as_ref()?;
        let offset = *compiled.code_map.get(&address)?;
        // SAFETY: code map offsets lie inside the buffer.
        Some(unsafe { compiled.code.as_ptr().add(offset) })
    }

    /// Entry point of the instruction at `address` within a copy of the
    /// compiled code that starts at `base`.
    pub fn get_instr_ptr_in(&self, address: Cell, base: *const u8) -> Option<*const u8> {
        let offset = self.get_instr_offset(address)?;
        Some(base.wrapping_add(offset))
    }

    /// `(bytecode address, native offset)` for every instruction, in
    /// address order.
    pub fn code_map(&self) -> impl Iterator<Item = (Cell, usize)> + '_ {
        self.compiled
            .iter()
            .flat_map(|c| c.code_map.iter().map(|(&address, &offset)| (address, offset)))
    }

    /// Push an argument for the next call, like [`Amx::push`]. Push the
    /// last argument first.
    pub fn push(&self, value: Cell) -> Result<(), AmxError> {
        // SAFETY: no reference into the instance is live here.
        unsafe { self.vm.amx_mut() }.push(value)
    }

    /// Run the function at `address` with the arguments pushed since the
    /// last call, and return its PRI.
    ///
    /// STK, HEA and FRM are restored afterwards whatever the outcome, so the
    /// pushed arguments are always consumed.
    pub fn call_function(&self, address: Cell) -> Result<Cell, AmxError> {
        let vm = self.vm;
        // SAFETY: no reference into the instance is live here.
        let paramcount = unsafe { vm.amx_mut() }.take_paramcount();
        let saved = vm.regs();
        let reset_stk = saved.stk + (paramcount * CELL_SIZE) as Cell;

        let result = self.run(address, paramcount);

        let mut regs = vm.regs();
        regs.stk = reset_stk;
        regs.hea = saved.hea;
        regs.frm = saved.frm;
        vm.set_regs(regs);

        match result {
            Ok(value) => trace!(address, value, "call returned"),
            Err(err) => debug!(address, "call failed: {err}"),
        }
        result
    }

    fn run(&self, address: Cell, paramcount: usize) -> Result<Cell, AmxError> {
        let compiled = self.compiled.as_ref().ok_or(AmxError::InitJit)?;
        let target = self.get_instr_ptr(address).ok_or(AmxError::Index)?;

        self.vm.push((paramcount * CELL_SIZE) as Cell)?;
        self.vm.push(0)?;

        let mut state = ExecState::new(self.vm, self);
        // SAFETY: the buffer starts with the entry stub.
        let entry: EntryFn = unsafe { std::mem::transmute::<*const u8, EntryFn>(compiled.code.as_ptr()) };
        // SAFETY: `state` outlives the call and `target` is an instruction
        // boundary of the same buffer.
        let status = unsafe { entry(&mut state, target) };

        match AmxError::from_code(status) {
            None => Ok(state.retval()),
            Some(err) => Err(err),
        }
    }

    /// Call the public function with the given index.
    pub fn call_public_function(&self, index: usize) -> Result<Cell, AmxError> {
        let address = self.vm.public_address(index).ok_or(AmxError::Index)?;
        self.call_function(address)
    }

    /// Call `main`, i.e. the entry point named in the header.
    pub fn call_main(&self) -> Result<Cell, AmxError> {
        let cip = self.vm.header().cip;
        if cip < 0 {
            // SAFETY: no reference into the instance is live here.
            unsafe { self.vm.amx_mut() }.take_paramcount();
            return Err(AmxError::Index);
        }
        self.call_function(cip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amx::{ImageBuilder, Opcode};

    fn answer() -> Amx {
        let mut b = ImageBuilder::new();
        let main = b.label();
        b.bind(main);
        b.op(Opcode::Proc);
        b.op1(Opcode::ConstPri, 42);
        b.op(Opcode::Retn);
        b.main(main);
        b.load().unwrap()
    }

    #[test]
    fn test_call_before_compile() {
        let mut amx = answer();
        let jitter = Jitter::new(&mut amx);
        assert_eq!(jitter.call_main(), Err(AmxError::InitJit));
        assert!(jitter.code().is_none());
        assert_eq!(jitter.code_size(), 0);
    }

    #[test]
    fn test_compile_and_call() {
        let mut amx = answer();
        let mut jitter = Jitter::new(&mut amx);
        jitter.compile().unwrap();
        assert!(jitter.code_size() > 0);
        assert_eq!(jitter.call_main(), Ok(42));
    }

    #[test]
    fn test_code_map_is_monotonic() {
        let mut amx = answer();
        let mut jitter = Jitter::new(&mut amx);
        jitter.compile().unwrap();
        let map: Vec<_> = jitter.code_map().collect();
        assert_eq!(map.iter().map(|&(a, _)| a).collect::<Vec<_>>(), vec![0, 4, 12]);
        assert!(map.windows(2).all(|w| w[0].1 < w[1].1));
        assert_eq!(jitter.get_instr_offset(4), Some(map[1].1));
        assert_eq!(jitter.get_instr_offset(8), None);
    }

    #[test]
    fn test_instr_ptr_in_copy() {
        let mut amx = answer();
        let mut jitter = Jitter::new(&mut amx);
        jitter.compile().unwrap();
        let copy = jitter.code().unwrap().to_vec();
        let offset = jitter.get_instr_offset(4).unwrap();

        let ptr = jitter.get_instr_ptr_in(4, copy.as_ptr()).unwrap();
        assert_eq!(ptr, copy.as_ptr().wrapping_add(offset));
        assert_eq!(jitter.get_instr_ptr_in(8, copy.as_ptr()), None);
        assert_eq!(
            jitter.get_instr_ptr_in(4, jitter.code().unwrap().as_ptr()),
            jitter.get_instr_ptr(4)
        );
    }

    #[test]
    fn test_unknown_address() {
        let mut amx = answer();
        let mut jitter = Jitter::new(&mut amx);
        jitter.compile().unwrap();
        assert_eq!(jitter.call_function(8), Err(AmxError::Index));
        assert_eq!(jitter.call_public_function(3), Err(AmxError::Index));
    }

    #[test]
    fn test_failed_compile_publishes_nothing() {
        let mut b = ImageBuilder::new();
        b.op1(Opcode::Jump, 0x400);
        let mut amx = b.load().unwrap();
        let mut jitter = Jitter::new(&mut amx);

        let mut reported = None;
        let result = jitter.compile_with_handler(|_, err| reported = err.address());
        assert!(matches!(result, Err(CompileError::TargetOutOfRange { .. })));
        assert_eq!(reported, Some(0));
        assert!(!jitter.is_compiled());
        assert_eq!(jitter.call_function(0), Err(AmxError::InitJit));
    }
}
