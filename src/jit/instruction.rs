//! Decoded bytecode instructions.

use std::fmt;

use crate::amx::{CELL_SIZE, Cell, Opcode};

/// One decoded instruction: where it starts, what it does, and its operand
/// cells in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    address: Cell,
    opcode: Opcode,
    operands: Vec<Cell>,
}

impl Default for Instruction {
    fn default() -> Self {
        Self::new(0, Opcode::None)
    }
}

impl Instruction {
    pub fn new(address: Cell, opcode: Opcode) -> Self {
        Self {
            address,
            opcode,
            operands: Vec::new(),
        }
    }

    pub fn with_operands(address: Cell, opcode: Opcode, operands: Vec<Cell>) -> Self {
        Self {
            address,
            opcode,
            operands,
        }
    }

    /// Code address of the opcode cell.
    pub fn address(&self) -> Cell {
        self.address
    }

    pub fn set_address(&mut self, address: Cell) {
        self.address = address;
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.opcode = opcode;
    }

    pub fn operands(&self) -> &[Cell] {
        &self.operands
    }

    pub fn operand(&self, index: usize) -> Option<Cell> {
        self.operands.get(index).copied()
    }

    pub fn push_operand(&mut self, operand: Cell) {
        self.operands.push(operand);
    }

    pub fn set_operands(&mut self, operands: Vec<Cell>) {
        self.operands = operands;
    }

    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        CELL_SIZE * (1 + self.operands.len())
    }

    /// Address of the instruction that follows this one.
    pub fn next_address(&self) -> Cell {
        self.address + self.size() as Cell
    }

    pub fn name(&self) -> &'static str {
        self.opcode.name()
    }

    /// `(value, target)` records of a `CASETBL`; empty for other opcodes.
    pub fn cases(&self) -> impl Iterator<Item = (Cell, Cell)> + '_ {
        let records = if self.opcode == Opcode::Casetbl {
            self.operands.get(2..).unwrap_or(&[])
        } else {
            &[]
        };
        records.chunks_exact(2).map(|pair| (pair[0], pair[1]))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}  {}", self.address, self.name())?;
        match self.opcode {
            Opcode::Casetbl => {
                if let [count, default, ..] = self.operands[..] {
                    write!(f, " {count} default {default:08x}")?;
                }
                for (value, target) in self.cases() {
                    write!(f, " [{value}: {target:08x}]")?;
                }
            }
            Opcode::File | Opcode::Symbol => {
                if let Some(len) = self.operand(0) {
                    write!(f, " <{len} bytes>")?;
                }
            }
            op if op.is_branch() || op == Opcode::Switch => {
                for operand in &self.operands {
                    write!(f, " {operand:08x}")?;
                }
            }
            _ => {
                for operand in &self.operands {
                    write!(f, " {operand}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_and_next() {
        let mut instr = Instruction::new(16, Opcode::SysreqN);
        assert_eq!(instr.size(), 4);
        instr.push_operand(3);
        instr.push_operand(8);
        assert_eq!(instr.num_operands(), 2);
        assert_eq!(instr.size(), 12);
        assert_eq!(instr.next_address(), 28);
    }

    #[test]
    fn test_mutation() {
        let mut instr = Instruction::default();
        instr.set_address(8);
        instr.set_opcode(Opcode::ConstPri);
        instr.set_operands(vec![42]);
        assert_eq!(instr, Instruction::with_operands(8, Opcode::ConstPri, vec![42]));
    }

    #[test]
    fn test_display() {
        let instr = Instruction::with_operands(0x20, Opcode::ConstPri, vec![-5]);
        assert_eq!(instr.to_string(), "00000020  const.pri -5");

        let jump = Instruction::with_operands(0, Opcode::Jump, vec![0x40]);
        assert_eq!(jump.to_string(), "00000000  jump 00000040");
    }

    #[test]
    fn test_cases() {
        let table = Instruction::with_operands(0, Opcode::Casetbl, vec![2, 100, 1, 200, 2, 300]);
        let cases: Vec<_> = table.cases().collect();
        assert_eq!(cases, vec![(1, 200), (2, 300)]);
        assert_eq!(
            table.to_string(),
            "00000000  casetbl 2 default 00000064 [1: 000000c8] [2: 0000012c]"
        );
    }
}
