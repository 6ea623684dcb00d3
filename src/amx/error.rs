//! AMX status codes.
//!
//! These mirror the error codes of the Pawn abstract machine so that hosts
//! can branch on them exactly as they would on an interpreter result.
//! `AMX_ERR_NONE` has no variant: success is `Ok(_)`.

use thiserror::Error;

/// A non-success status of the abstract machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(i32)]
pub enum AmxError {
    #[error("forced exit")]
    Exit = 1,
    #[error("assertion failed")]
    Assert = 2,
    #[error("stack/heap collision")]
    StackError = 3,
    #[error("index out of bounds")]
    Bounds = 4,
    #[error("invalid memory access")]
    MemoryAccess = 5,
    #[error("invalid instruction")]
    InvalidInstruction = 6,
    #[error("stack underflow")]
    StackLow = 7,
    #[error("heap underflow")]
    HeapLow = 8,
    #[error("no callback, or invalid callback")]
    Callback = 9,
    #[error("native function failed")]
    Native = 10,
    #[error("divide by zero")]
    Divide = 11,
    #[error("go into sleepmode")]
    Sleep = 12,
    #[error("invalid state for this access")]
    InvalidState = 13,
    #[error("out of memory")]
    Memory = 16,
    #[error("invalid file format")]
    Format = 17,
    #[error("file is for a newer version of the AMX")]
    Version = 18,
    #[error("function not found")]
    NotFound = 19,
    #[error("invalid index parameter (bad entry point)")]
    Index = 20,
    #[error("debugger cannot run")]
    Debug = 21,
    #[error("AMX not initialized (or doubly initialized)")]
    Init = 22,
    #[error("unable to set user data field (table full)")]
    UserData = 23,
    #[error("cannot initialize the JIT")]
    InitJit = 24,
    #[error("parameter error")]
    Params = 25,
    #[error("domain error, expression result does not fit in range")]
    Domain = 26,
    #[error("general error (unknown or unspecific error)")]
    General = 27,
}

impl AmxError {
    /// Numeric status code as seen by the host.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a raw status code back to an error. `0` (no error) is `None`;
    /// codes outside the known set become `General`.
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            0 => return None,
            1 => AmxError::Exit,
            2 => AmxError::Assert,
            3 => AmxError::StackError,
            4 => AmxError::Bounds,
            5 => AmxError::MemoryAccess,
            6 => AmxError::InvalidInstruction,
            7 => AmxError::StackLow,
            8 => AmxError::HeapLow,
            9 => AmxError::Callback,
            10 => AmxError::Native,
            11 => AmxError::Divide,
            12 => AmxError::Sleep,
            13 => AmxError::InvalidState,
            16 => AmxError::Memory,
            17 => AmxError::Format,
            18 => AmxError::Version,
            19 => AmxError::NotFound,
            20 => AmxError::Index,
            21 => AmxError::Debug,
            22 => AmxError::Init,
            23 => AmxError::UserData,
            24 => AmxError::InitJit,
            25 => AmxError::Params,
            26 => AmxError::Domain,
            _ => AmxError::General,
        };
        Some(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for code in 1..=27 {
            if let Some(err) = AmxError::from_code(code) {
                if code == 14 || code == 15 {
                    assert_eq!(err, AmxError::General);
                } else {
                    assert_eq!(err.code(), code);
                }
            }
        }
    }

    #[test]
    fn test_none_and_unknown() {
        assert_eq!(AmxError::from_code(0), None);
        assert_eq!(AmxError::from_code(999), Some(AmxError::General));
        assert_eq!(AmxError::from_code(-3), Some(AmxError::General));
    }
}
