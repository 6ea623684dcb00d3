//! The float natives of the Pawn core library.
//!
//! Cells carry IEEE-754 single precision bit patterns. These are the
//! generic implementations; the compiler inlines equivalents of the same
//! names unless intrinsics are disabled.

use crate::amx::{Amx, AmxError, Cell};
use crate::jit::{NativeCall, NativeFn};

/// Natives provided by this module, by name.
pub static FLOAT_NATIVES: &[(&str, NativeFn)] = &[
    ("float", float),
    ("floatabs", floatabs),
    ("floatadd", floatadd),
    ("floatsub", floatsub),
    ("floatmul", floatmul),
    ("floatdiv", floatdiv),
    ("floatsqroot", floatsqroot),
    ("floatlog", floatlog),
];

/// Register every float native the image imports; returns how many were
/// bound.
pub fn register_float_natives(amx: &mut Amx) -> usize {
    amx.register_natives(FLOAT_NATIVES)
}

/// Logarithm of `value` to `base`. Shared with the inline `floatlog` so both
/// paths round identically.
pub extern "C" fn float_log(value: f32, base: f32) -> f32 {
    if base == 10.0 {
        value.log10()
    } else {
        value.ln() / base.ln()
    }
}

fn to_float(cell: Cell) -> f32 {
    f32::from_bits(cell as u32)
}

fn to_cell(value: f32) -> Cell {
    value.to_bits() as Cell
}

/// Argument `n` (0-based) of a native call.
fn arg(params: &[Cell], n: usize) -> Result<Cell, AmxError> {
    params.get(n + 1).copied().ok_or(AmxError::Params)
}

fn farg(params: &[Cell], n: usize) -> Result<f32, AmxError> {
    arg(params, n).map(to_float)
}

fn float(_: &mut NativeCall<'_, '_>, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(to_cell(arg(params, 0)? as f32))
}

fn floatabs(_: &mut NativeCall<'_, '_>, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(arg(params, 0)? & 0x7FFF_FFFF)
}

fn floatadd(_: &mut NativeCall<'_, '_>, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(to_cell(farg(params, 0)? + farg(params, 1)?))
}

fn floatsub(_: &mut NativeCall<'_, '_>, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(to_cell(farg(params, 0)? - farg(params, 1)?))
}

fn floatmul(_: &mut NativeCall<'_, '_>, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(to_cell(farg(params, 0)? * farg(params, 1)?))
}

fn floatdiv(_: &mut NativeCall<'_, '_>, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(to_cell(farg(params, 0)? / farg(params, 1)?))
}

fn floatsqroot(_: &mut NativeCall<'_, '_>, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(to_cell(farg(params, 0)?.sqrt()))
}

fn floatlog(_: &mut NativeCall<'_, '_>, params: &[Cell]) -> Result<Cell, AmxError> {
    Ok(to_cell(float_log(farg(params, 0)?, farg(params, 1)?)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_log() {
        assert!((float_log(1000.0, 10.0) - 3.0).abs() < 1e-6);
        assert!((float_log(8.0, 2.0) - 3.0).abs() < 1e-6);
        assert!(float_log(-1.0, 10.0).is_nan());
    }

    #[test]
    fn test_cell_conversion() {
        assert_eq!(to_cell(1.0), 0x3F80_0000);
        assert_eq!(to_float(0x4000_0000), 2.0);
        assert_eq!(to_float(to_cell(-0.5)), -0.5);
    }

    #[test]
    fn test_missing_argument() {
        assert_eq!(arg(&[4, 7], 0), Ok(7));
        assert_eq!(arg(&[4, 7], 1), Err(AmxError::Params));
    }

    #[test]
    fn test_table_names_are_intrinsics() {
        for (name, _) in FLOAT_NATIVES {
            assert!(crate::jit::intrinsics::find(name).is_some(), "{name}");
        }
    }
}
