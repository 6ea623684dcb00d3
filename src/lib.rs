//! amx-jit - a JIT compiler for Pawn AMX bytecode
//!
//! Loads compiled Pawn images, translates their code segment to x86-64
//! machine code in a single pass, and runs public functions natively with
//! the status codes of the abstract machine.
//!
//! ```no_run
//! use amx_jit::{Amx, Jitter};
//!
//! let mut amx = Amx::load("script.amx")?;
//! amx_jit::natives::register_float_natives(&mut amx);
//! let mut jitter = Jitter::new(&mut amx);
//! jitter.compile()?;
//! let result = jitter.call_main()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#[cfg(not(all(target_arch = "x86_64", unix)))]
compile_error!("amx-jit generates System V x86-64 code and supports only x86-64 Unix targets");

pub mod amx;
pub mod config;
pub mod jit;
pub mod natives;

pub use amx::{Amx, AmxError, Cell, ImageBuilder, Opcode};
pub use config::JitConfig;
pub use jit::{CompileError, Disassembler, Instruction, Jitter, NativeCall, NativeFn};
