//! Inline replacements for the float natives.
//!
//! Each emitter reads its arguments from the VM stack (`args` points at the
//! first argument) and leaves the result in PRI, exactly as the generic
//! native would have returned it.

use super::bridge::ExternalCode;
use super::codegen::regs::{PRI, STK};
use super::x86_64::{Mem, X86_64Assembler};
use crate::amx::CELL_SIZE;
use crate::natives::float_log;

pub(crate) type EmitFn = fn(&mut X86_64Assembler<'_>, Args);

/// Offset of the first argument cell from STK.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Args(pub i32);

impl Args {
    fn get(self, n: usize) -> Mem {
        Mem::base(STK, self.0 + (n * CELL_SIZE) as i32)
    }
}

pub(crate) struct Intrinsic {
    pub name: &'static str,
    /// Number of argument cells.
    pub arity: usize,
    pub emit: EmitFn,
}

pub(crate) static INTRINSICS: &[Intrinsic] = &[
    Intrinsic {
        name: "float",
        arity: 1,
        emit: emit_float,
    },
    Intrinsic {
        name: "floatabs",
        arity: 1,
        emit: emit_floatabs,
    },
    Intrinsic {
        name: "floatadd",
        arity: 2,
        emit: emit_floatadd,
    },
    Intrinsic {
        name: "floatsub",
        arity: 2,
        emit: emit_floatsub,
    },
    Intrinsic {
        name: "floatmul",
        arity: 2,
        emit: emit_floatmul,
    },
    Intrinsic {
        name: "floatdiv",
        arity: 2,
        emit: emit_floatdiv,
    },
    Intrinsic {
        name: "floatsqroot",
        arity: 1,
        emit: emit_floatsqroot,
    },
    Intrinsic {
        name: "floatlog",
        arity: 2,
        emit: emit_floatlog,
    },
];

pub(crate) fn find(name: &str) -> Option<&'static Intrinsic> {
    INTRINSICS.iter().find(|intrinsic| intrinsic.name == name)
}

fn emit_float(asm: &mut X86_64Assembler<'_>, args: Args) {
    asm.cvtsi2ss_m(0, args.get(0));
    asm.movd_r32_xmm(PRI, 0);
}

fn emit_floatabs(asm: &mut X86_64Assembler<'_>, args: Args) {
    asm.mov32_rm(PRI, args.get(0));
    asm.and32_ri(PRI, 0x7FFF_FFFF);
}

fn emit_floatadd(asm: &mut X86_64Assembler<'_>, args: Args) {
    asm.movss_xmm_m(0, args.get(0));
    asm.addss_m(0, args.get(1));
    asm.movd_r32_xmm(PRI, 0);
}

fn emit_floatsub(asm: &mut X86_64Assembler<'_>, args: Args) {
    asm.movss_xmm_m(0, args.get(0));
    asm.subss_m(0, args.get(1));
    asm.movd_r32_xmm(PRI, 0);
}

fn emit_floatmul(asm: &mut X86_64Assembler<'_>, args: Args) {
    asm.movss_xmm_m(0, args.get(0));
    asm.mulss_m(0, args.get(1));
    asm.movd_r32_xmm(PRI, 0);
}

fn emit_floatdiv(asm: &mut X86_64Assembler<'_>, args: Args) {
    asm.movss_xmm_m(0, args.get(0));
    asm.divss_m(0, args.get(1));
    asm.movd_r32_xmm(PRI, 0);
}

fn emit_floatsqroot(asm: &mut X86_64Assembler<'_>, args: Args) {
    asm.sqrtss_m(0, args.get(0));
    asm.movd_r32_xmm(PRI, 0);
}

/// No inline form; calls the helper the generic native uses.
fn emit_floatlog(asm: &mut X86_64Assembler<'_>, args: Args) {
    let mut ext = ExternalCode::begin(asm);
    ext.movss_xmm_m(0, args.get(0));
    ext.movss_xmm_m(1, args.get(1));
    ext.call_abs(float_log as *const () as usize);
    ext.movd_r32_xmm(PRI, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::codebuf::CodeBuffer;

    #[test]
    fn test_lookup() {
        assert_eq!(find("floatadd").map(|i| i.arity), Some(2));
        assert!(find("floatcmp").is_none());
        assert!(find("FloatAdd").is_none());
    }

    #[test]
    fn test_names_unique() {
        for (i, a) in INTRINSICS.iter().enumerate() {
            assert!(INTRINSICS[i + 1..].iter().all(|b| b.name != a.name));
        }
    }

    #[test]
    fn test_floatadd_reads_both_args() {
        let mut buf = CodeBuffer::new();
        let mut asm = X86_64Assembler::new(&mut buf);
        emit_floatadd(&mut asm, Args(CELL_SIZE as i32));
        assert_eq!(
            buf.code(),
            &[
                0xF3, 0x41, 0x0F, 0x10, 0x45, 0x04, // movss xmm0, [r13+4]
                0xF3, 0x41, 0x0F, 0x58, 0x45, 0x08, // addss xmm0, [r13+8]
                0x66, 0x0F, 0x7E, 0xC0, // movd eax, xmm0
            ]
        );
    }
}
