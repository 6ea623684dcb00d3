//! JIT compilation of AMX bytecode to x86-64.
//!
//! - [`Disassembler`] decodes the code segment into [`Instruction`]s
//! - [`Jitter`] translates the whole segment and runs functions from it
//! - the runtime bridge connects generated code with natives and the host
//!
//! Generated code follows the System V ABI, so this module only builds for
//! x86-64 Unix targets.

mod bridge;
mod codebuf;
mod codegen;
mod compiler;
mod disasm;
mod instruction;
pub(crate) mod intrinsics;
mod labels;
mod memory;
mod vm;
pub mod x86_64;

pub use bridge::{ArgBlock, CallContext, NativeCall, NativeFn};
pub use codebuf::{CodeBuffer, CodeBufferError, Label};
pub use codegen::{CompileError, regs};
pub use compiler::Jitter;
pub use disasm::{DecodeError, Disassembler};
pub use instruction::Instruction;
pub use labels::{LabelTable, LabelTag, TaggedAddress};
pub use memory::{ExecutableMemory, MemoryError};
pub use vm::AmxVm;
