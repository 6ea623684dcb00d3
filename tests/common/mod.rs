//! Helpers shared by the integration tests.

#![allow(dead_code)]

use amx_jit::amx::CodeLabel;
use amx_jit::{Amx, AmxError, Cell, ImageBuilder, JitConfig, Jitter, Opcode};

/// Frame offset of argument `n` inside a function that started with `PROC`.
pub fn arg(n: usize) -> Cell {
    (12 + 4 * n) as Cell
}

/// Start a public function: bind its entry, export it and emit `PROC`.
pub fn public(b: &mut ImageBuilder, name: &str) -> CodeLabel {
    let entry = b.label();
    b.bind(entry);
    b.public(name, entry);
    b.op(Opcode::Proc);
    entry
}

/// Start a private function.
pub fn function(b: &mut ImageBuilder) -> CodeLabel {
    let entry = b.label();
    b.bind(entry);
    b.op(Opcode::Proc);
    entry
}

/// Compile `amx` with `config`, panicking on failure.
pub fn compile(amx: &mut Amx, config: JitConfig) -> Jitter<'_> {
    let mut jitter = Jitter::with_config(amx, config);
    jitter.compile().expect("image compiles");
    jitter
}

/// Push `args` (first argument lowest) and call the public `name`.
pub fn call(jitter: &Jitter<'_>, name: &str, args: &[Cell]) -> Result<Cell, AmxError> {
    let index = jitter.vm().find_public(name).expect("public exists");
    for &value in args.iter().rev() {
        jitter.push(value)?;
    }
    jitter.call_public_function(index)
}

/// Compile with the default configuration and call once.
pub fn run(amx: &mut Amx, name: &str, args: &[Cell]) -> Result<Cell, AmxError> {
    let jitter = compile(amx, JitConfig::default());
    call(&jitter, name, args)
}
