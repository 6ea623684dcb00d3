//! Bytecode decoder.

use std::collections::HashMap;

use thiserror::Error;

use super::instruction::Instruction;
use super::vm::AmxVm;
use crate::amx::{Arity, CELL_SIZE, Cell, Opcode};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid opcode {value:#x} at {address:#010x}")]
    InvalidOpcode { address: Cell, value: Cell },
    #[error("instruction at {address:#010x} runs past the end of the code segment")]
    Truncated { address: Cell },
    #[error("malformed operand count {count} at {address:#010x}")]
    BadCount { address: Cell, count: Cell },
}

impl DecodeError {
    pub fn address(&self) -> Cell {
        match *self {
            DecodeError::InvalidOpcode { address, .. }
            | DecodeError::Truncated { address }
            | DecodeError::BadCount { address, .. } => address,
        }
    }
}

/// Single-pass decoder over a code segment.
///
/// The only state is the instruction pointer, so decoding can restart at any
/// instruction boundary via [`set_ip`](Self::set_ip).
pub struct Disassembler<'c> {
    code: &'c [u8],
    ip: Cell,
    markers: Option<HashMap<Cell, Opcode>>,
    failed: bool,
}

impl<'c> Disassembler<'c> {
    pub fn new(vm: &'c AmxVm<'_>) -> Self {
        Self::from_code(vm.code())
    }

    pub fn from_code(code: &'c [u8]) -> Self {
        Self {
            code,
            ip: 0,
            markers: None,
            failed: false,
        }
    }

    pub fn ip(&self) -> Cell {
        self.ip
    }

    pub fn set_ip(&mut self, ip: Cell) {
        self.ip = ip;
        self.failed = false;
    }

    /// Decode opcode cells as interpreter dispatch markers: `table[n]` is the
    /// value found in the stream for opcode `n`.
    pub fn set_opcode_table(&mut self, table: &[Cell]) {
        let markers = table
            .iter()
            .zip(Opcode::all())
            .map(|(&marker, &opcode)| (marker, opcode))
            .collect();
        self.markers = Some(markers);
    }

    fn read(&self, address: Cell, at: Cell) -> Result<Cell, DecodeError> {
        let start = usize::try_from(at).map_err(|_| DecodeError::Truncated { address })?;
        let bytes = self
            .code
            .get(start..start + CELL_SIZE)
            .ok_or(DecodeError::Truncated { address })?;
        Ok(Cell::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn opcode(&self, address: Cell, value: Cell) -> Result<Opcode, DecodeError> {
        let opcode = match &self.markers {
            Some(markers) => markers.get(&value).copied(),
            None => Opcode::from_cell(value),
        };
        opcode.ok_or(DecodeError::InvalidOpcode { address, value })
    }

    /// Decode the instruction at the current pointer into `instr` and advance.
    ///
    /// Returns `Ok(false)` at the end of the code segment.
    pub fn decode_into(&mut self, instr: &mut Instruction) -> Result<bool, DecodeError> {
        let address = self.ip;
        if address as usize >= self.code.len() {
            return Ok(false);
        }

        let opcode = self.opcode(address, self.read(address, address)?)?;
        let cell = |n: usize| address + ((1 + n) * CELL_SIZE) as Cell;

        let count = match opcode.arity() {
            Arity::Fixed(n) => n,
            Arity::CaseTable => {
                let records = self.read(address, cell(0))?;
                let records = usize::try_from(records)
                    .map_err(|_| DecodeError::BadCount { address, count: records })?;
                2 + 2 * records
            }
            Arity::Payload => {
                let bytes = self.read(address, cell(0))?;
                let bytes = usize::try_from(bytes)
                    .map_err(|_| DecodeError::BadCount { address, count: bytes })?;
                1 + bytes.div_ceil(CELL_SIZE)
            }
        };
        if address as usize + (1 + count) * CELL_SIZE > self.code.len() {
            return Err(DecodeError::Truncated { address });
        }

        let mut operands = Vec::with_capacity(count);
        for n in 0..count {
            operands.push(self.read(address, cell(n))?);
        }

        instr.set_address(address);
        instr.set_opcode(opcode);
        instr.set_operands(operands);
        self.ip = instr.next_address();
        Ok(true)
    }

    /// Decode the next instruction; `Ok(None)` at the end of the code segment.
    pub fn decode(&mut self) -> Result<Option<Instruction>, DecodeError> {
        let mut instr = Instruction::default();
        Ok(self.decode_into(&mut instr)?.then_some(instr))
    }
}

impl Iterator for Disassembler<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let result = self.decode().transpose();
        if matches!(result, Some(Err(_))) {
            self.failed = true;
        }
        result
    }
}
