//! Native dispatch, nested calls and the float intrinsics.

mod common;

use amx_jit::natives::register_float_natives;
use amx_jit::{Amx, AmxError, Cell, ImageBuilder, JitConfig, NativeCall, NativeFn, Opcode};
use common::{arg, call, compile, public};

fn sum(_: &mut NativeCall<'_, '_>, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(params[1..].iter().sum())
}

fn refuse(_: &mut NativeCall<'_, '_>, _: &[Cell]) -> Result<Cell, AmxError> {
    Err(AmxError::Assert)
}

fn explode(_: &mut NativeCall<'_, '_>, _: &[Cell]) -> Result<Cell, AmxError> {
    panic!("native blew up");
}

/// `nest(n)`: 0 for n == 0, otherwise 1 + nest(n - 1) through a native.
fn reenter(call: &mut NativeCall<'_, '_>, params: &[Cell]) -> Result<Cell, AmxError> {
    let index = call.vm().find_public("nest").ok_or(AmxError::NotFound)?;
    call.amx().push(params[1] - 1)?;
    Ok(call.call_public_function(index)? + 1)
}

/// Calls a public that halts and swallows the error.
fn swallow(call: &mut NativeCall<'_, '_>, _: &[Cell]) -> Result<Cell, AmxError> {
    let index = call.vm().find_public("abort").ok_or(AmxError::NotFound)?;
    call.amx().push(1)?;
    call.amx().push(2)?;
    match call.call_public_function(index) {
        Err(AmxError::Assert) => Ok(5),
        other => other,
    }
}

fn dispatch_image() -> Amx {
    let mut b = ImageBuilder::new();
    let sum_index = b.native("sum");
    let refuse_index = b.native("refuse");
    let explode_index = b.native("explode");
    let reenter_index = b.native("reenter");
    let swallow_index = b.native("swallow");

    public(&mut b, "sum_c");
    b.op1(Opcode::PushC, 3);
    b.op1(Opcode::PushC, 2);
    b.op1(Opcode::PushC, 8);
    b.op1(Opcode::SysreqC, sum_index);
    b.op1(Opcode::Stack, 12);
    b.op(Opcode::Retn);

    public(&mut b, "sum_n");
    b.op1(Opcode::PushC, 30);
    b.op1(Opcode::PushC, 20);
    b.op1(Opcode::PushC, 10);
    b.op2(Opcode::SysreqN, sum_index, 12);
    b.op(Opcode::Retn);

    public(&mut b, "sum_pri");
    b.op1(Opcode::PushC, 4);
    b.op1(Opcode::PushC, 4);
    b.op1(Opcode::ConstPri, sum_index);
    b.op(Opcode::SysreqPri);
    b.op1(Opcode::Stack, 8);
    b.op(Opcode::Retn);

    for (name, index) in [("refuse", refuse_index), ("explode", explode_index), ("swallow", swallow_index)] {
        public(&mut b, name);
        b.op2(Opcode::SysreqN, index, 0);
        b.op(Opcode::Retn);
    }

    public(&mut b, "nest");
    let zero = b.label();
    b.op1(Opcode::LoadSPri, arg(0));
    b.op1(Opcode::Jzer, zero);
    b.op1(Opcode::PushS, arg(0));
    b.op2(Opcode::SysreqN, reenter_index, 4);
    b.op(Opcode::Retn);
    b.bind(zero);
    b.op(Opcode::ZeroPri);
    b.op(Opcode::Retn);

    public(&mut b, "abort");
    b.op1(Opcode::PushC, 0);
    b.op1(Opcode::Halt, AmxError::Assert.code());

    let mut amx = b.load().unwrap();
    let natives: [(&str, NativeFn); 5] = [
        ("sum", sum),
        ("refuse", refuse),
        ("explode", explode),
        ("reenter", reenter),
        ("swallow", swallow),
    ];
    assert_eq!(amx.register_natives(&natives), 5);
    amx
}

#[test]
fn test_sysreq_forms() {
    let mut amx = dispatch_image();
    let jitter = compile(&mut amx, JitConfig::default());
    let stk = jitter.vm().stk();
    assert_eq!(call(&jitter, "sum_c", &[]), Ok(5));
    assert_eq!(call(&jitter, "sum_n", &[]), Ok(60));
    assert_eq!(call(&jitter, "sum_pri", &[]), Ok(4));
    assert_eq!(jitter.vm().stk(), stk);
}

#[test]
fn test_native_errors_halt() {
    let mut amx = dispatch_image();
    let jitter = compile(&mut amx, JitConfig::default());
    let stk = jitter.vm().stk();
    assert_eq!(call(&jitter, "refuse", &[]), Err(AmxError::Assert));
    assert_eq!(call(&jitter, "explode", &[]), Err(AmxError::Native));
    assert_eq!(jitter.vm().stk(), stk);
    assert_eq!(call(&jitter, "sum_n", &[]), Ok(60));
}

#[test]
fn test_unregistered_native() {
    let mut b = ImageBuilder::new();
    let missing = b.native("missing");
    public(&mut b, "f");
    b.op2(Opcode::SysreqN, missing, 0);
    b.op(Opcode::Retn);
    let mut amx = b.load().unwrap();
    let jitter = compile(&mut amx, JitConfig::default());
    assert_eq!(call(&jitter, "f", &[]), Err(AmxError::NotFound));
}

#[test]
fn test_nested_dispatch_keeps_stack_balanced() {
    let mut amx = dispatch_image();
    let jitter = compile(&mut amx, JitConfig::default());
    let stk = jitter.vm().stk();
    assert_eq!(call(&jitter, "nest", &[0]), Ok(0));
    assert_eq!(call(&jitter, "nest", &[4]), Ok(4));
    assert_eq!(jitter.vm().stk(), stk);
}

#[test]
fn test_nested_halt_is_recoverable() {
    let mut amx = dispatch_image();
    let jitter = compile(&mut amx, JitConfig::default());
    let regs = jitter.vm().regs();
    assert_eq!(call(&jitter, "swallow", &[]), Ok(5));
    assert_eq!(jitter.vm().regs().stk, regs.stk);
    assert_eq!(jitter.vm().regs().frm, regs.frm);
    assert_eq!(call(&jitter, "nest", &[2]), Ok(2));
}

const FLOAT_NAMES: [(&str, usize); 8] = [
    ("float", 1),
    ("floatabs", 1),
    ("floatadd", 2),
    ("floatsub", 2),
    ("floatmul", 2),
    ("floatdiv", 2),
    ("floatsqroot", 1),
    ("floatlog", 2),
];

/// One public per float native and call form: `n_<name>` uses `SYSREQ.N`,
/// `c_<name>` uses `SYSREQ.C`.
fn float_image() -> Amx {
    let mut b = ImageBuilder::new();
    for (name, arity) in FLOAT_NAMES {
        let index = b.native(name);
        let nbytes = (arity * 4) as Cell;

        public(&mut b, &format!("n_{name}"));
        for n in (0..arity).rev() {
            b.op1(Opcode::PushS, arg(n));
        }
        b.op2(Opcode::SysreqN, index, nbytes);
        b.op(Opcode::Retn);

        public(&mut b, &format!("c_{name}"));
        for n in (0..arity).rev() {
            b.op1(Opcode::PushS, arg(n));
        }
        b.op1(Opcode::PushC, nbytes);
        b.op1(Opcode::SysreqC, index);
        b.op1(Opcode::Stack, nbytes + 4);
        b.op(Opcode::Retn);
    }
    let mut amx = b.load().unwrap();
    assert_eq!(register_float_natives(&mut amx), FLOAT_NAMES.len());
    amx
}

fn bits(value: f32) -> Cell {
    value.to_bits() as Cell
}

#[test]
fn test_intrinsics_are_inlined() {
    let mut amx = float_image();
    let jitter = compile(&mut amx, JitConfig::default());
    assert_eq!(jitter.inlined_natives(), 2 * FLOAT_NAMES.len());
    drop(jitter);
    let jitter = compile(&mut amx, JitConfig::default().with_intrinsics(false));
    assert_eq!(jitter.inlined_natives(), 0);
}

#[test]
fn test_intrinsics_match_generic_natives() {
    let floats = [0.0f32, -0.0, 1.5, -2.25, 3.0, 10.0, 1000.0, 1e30, -1e-30, f32::MAX];
    let ints = [0, 1, -7, 16_777_217, i32::MAX, i32::MIN];

    let mut inline_amx = float_image();
    let mut generic_amx = float_image();
    let inline = compile(&mut inline_amx, JitConfig::default());
    let generic = compile(&mut generic_amx, JitConfig::default().with_intrinsics(false));
    let inline_stk = inline.vm().stk();
    let generic_stk = generic.vm().stk();

    for (name, arity) in FLOAT_NAMES {
        let samples: Vec<Vec<Cell>> = match (name, arity) {
            ("float", _) => ints.iter().map(|&i| vec![i]).collect(),
            (_, 1) => floats.iter().map(|&f| vec![bits(f)]).collect(),
            _ => floats
                .iter()
                .flat_map(|&a| floats.iter().map(move |&b| vec![bits(a), bits(b)]))
                .collect(),
        };
        for args in samples {
            for form in ["n", "c"] {
                let public = format!("{form}_{name}");
                let expected = call(&generic, &public, &args);
                let actual = call(&inline, &public, &args);
                assert_eq!(actual, expected, "{public}({args:x?})");
                assert_eq!(inline.vm().stk(), inline_stk);
                assert_eq!(generic.vm().stk(), generic_stk);
            }
        }
    }
}

#[test]
fn test_float_results() {
    let mut amx = float_image();
    let jitter = compile(&mut amx, JitConfig::default());
    let float = |name: &str, args: &[Cell]| f32::from_bits(call(&jitter, name, args).unwrap() as u32);

    assert_eq!(float("n_float", &[-3]), -3.0);
    assert_eq!(float("n_floatadd", &[bits(1.5), bits(2.0)]), 3.5);
    assert_eq!(float("c_floatsub", &[bits(1.5), bits(2.0)]), -0.5);
    assert_eq!(float("n_floatdiv", &[bits(1.0), bits(0.0)]), f32::INFINITY);
    assert_eq!(float("n_floatabs", &[bits(-2.5)]), 2.5);
    assert_eq!(float("c_floatsqroot", &[bits(16.0)]), 4.0);
    assert!(float("n_floatsqroot", &[bits(-1.0)]).is_nan());
    assert!((float("n_floatlog", &[bits(100.0), bits(10.0)]) - 2.0).abs() < 1e-6);
}
