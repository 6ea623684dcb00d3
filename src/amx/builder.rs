//! In-memory assembler for AMX images.
//!
//! Hosts and tests use this to produce runnable images without an external
//! Pawn compiler. Code is emitted cell by cell; branch targets are
//! [`CodeLabel`]s that are resolved when the image is built.

use thiserror::Error;

use super::image::{AMX_MAGIC, CUR_FILE_VERSION, FUNCSTUB_SIZE, HEADER_SIZE, LoadError, MAX_AMX_VERSION};
use super::opcode::Opcode;
use super::{Amx, CELL_SIZE, Cell};

/// Bytes reserved for heap and stack when no size is given.
pub const DEFAULT_STACK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("label {0} is referenced but never bound")]
    UnboundLabel(usize),
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// A position in the code segment, possibly not yet known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeLabel(usize);

/// An operand cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    Value(Cell),
    /// Code address of a label.
    Label(CodeLabel),
    /// Distance from the end of the current instruction to a label (`JREL`).
    Relative(CodeLabel),
}

impl From<Cell> for Arg {
    fn from(value: Cell) -> Self {
        Arg::Value(value)
    }
}

impl From<CodeLabel> for Arg {
    fn from(label: CodeLabel) -> Self {
        Arg::Label(label)
    }
}

struct Fixup {
    cell: usize,
    label: CodeLabel,
    /// Code address the value is relative to, for `Arg::Relative`.
    base: Option<Cell>,
}

#[derive(Default)]
pub struct ImageBuilder {
    code: Vec<Cell>,
    data: Vec<Cell>,
    labels: Vec<Option<Cell>>,
    fixups: Vec<Fixup>,
    publics: Vec<(String, CodeLabel)>,
    natives: Vec<String>,
    main: Option<CodeLabel>,
    stack_size: Option<usize>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(&mut self) -> CodeLabel {
        self.labels.push(None);
        CodeLabel(self.labels.len() - 1)
    }

    /// Bind `label` to the current code position.
    pub fn bind(&mut self, label: CodeLabel) {
        self.labels[label.0] = Some(self.here());
    }

    /// Current code address.
    pub fn here(&self) -> Cell {
        (self.code.len() * CELL_SIZE) as Cell
    }

    /// Emit a raw code cell.
    pub fn cell(&mut self, value: Cell) {
        self.code.push(value);
    }

    /// Emit an instruction with the given operands; returns its address.
    pub fn emit(&mut self, opcode: Opcode, args: &[Arg]) -> Cell {
        let address = self.here();
        let end = address + ((1 + args.len()) * CELL_SIZE) as Cell;
        self.code.push(opcode as Cell);
        for arg in args {
            match *arg {
                Arg::Value(value) => self.code.push(value),
                Arg::Label(label) => self.reference(label, None),
                Arg::Relative(label) => self.reference(label, Some(end)),
            }
        }
        address
    }

    fn reference(&mut self, label: CodeLabel, base: Option<Cell>) {
        self.fixups.push(Fixup {
            cell: self.code.len(),
            label,
            base,
        });
        self.code.push(0);
    }

    pub fn op(&mut self, opcode: Opcode) -> Cell {
        self.emit(opcode, &[])
    }

    pub fn op1(&mut self, opcode: Opcode, arg: impl Into<Arg>) -> Cell {
        self.emit(opcode, &[arg.into()])
    }

    pub fn op2(&mut self, opcode: Opcode, a: impl Into<Arg>, b: impl Into<Arg>) -> Cell {
        self.emit(opcode, &[a.into(), b.into()])
    }

    /// Emit a `CASETBL` with a default target and `(value, target)` records.
    pub fn casetbl(&mut self, default: CodeLabel, cases: &[(Cell, CodeLabel)]) -> Cell {
        let mut args = vec![Arg::Value(cases.len() as Cell), Arg::Label(default)];
        for &(value, target) in cases {
            args.push(Arg::Value(value));
            args.push(Arg::Label(target));
        }
        self.emit(Opcode::Casetbl, &args)
    }

    /// Append a data cell; returns its data address.
    pub fn data_cell(&mut self, value: Cell) -> Cell {
        self.data_cells(&[value])
    }

    pub fn data_cells(&mut self, values: &[Cell]) -> Cell {
        let address = (self.data.len() * CELL_SIZE) as Cell;
        self.data.extend_from_slice(values);
        address
    }

    /// Append an unpacked NUL-terminated string.
    pub fn data_string(&mut self, value: &str) -> Cell {
        let mut cells: Vec<Cell> = value.chars().map(|c| c as Cell).collect();
        cells.push(0);
        self.data_cells(&cells)
    }

    pub fn public(&mut self, name: &str, entry: CodeLabel) {
        self.publics.push((name.to_string(), entry));
    }

    /// Declare an imported native; returns its index for `SYSREQ`.
    pub fn native(&mut self, name: &str) -> Cell {
        self.natives.push(name.to_string());
        (self.natives.len() - 1) as Cell
    }

    /// Set the entry point recorded in the header (`cip`).
    pub fn main(&mut self, entry: CodeLabel) {
        self.main = Some(entry);
    }

    /// Bytes reserved for heap and stack together.
    pub fn stack_size(&mut self, bytes: usize) {
        self.stack_size = Some(bytes);
    }

    fn resolve(&self, label: CodeLabel) -> Result<Cell, BuildError> {
        self.labels[label.0].ok_or(BuildError::UnboundLabel(label.0))
    }

    pub fn build(&self) -> Result<Vec<u8>, BuildError> {
        let mut code = self.code.clone();
        for fixup in &self.fixups {
            let target = self.resolve(fixup.label)?;
            code[fixup.cell] = target - fixup.base.unwrap_or(0);
        }

        let mut publics = Vec::with_capacity(self.publics.len());
        for (name, label) in &self.publics {
            publics.push((name.as_str(), self.resolve(*label)?));
        }
        publics.sort_by_key(|&(_, address)| address);
        let cip = match self.main {
            Some(label) => self.resolve(label)?,
            None => -1,
        };

        let publics_offset = HEADER_SIZE;
        let natives_offset = publics_offset + publics.len() * FUNCSTUB_SIZE;
        let libraries_offset = natives_offset + self.natives.len() * FUNCSTUB_SIZE;
        let nametable_offset = libraries_offset;

        let names: Vec<&str> = publics
            .iter()
            .map(|&(name, _)| name)
            .chain(self.natives.iter().map(String::as_str))
            .collect();
        let mut nametable = Vec::new();
        let max_name = names.iter().map(|name| name.len()).max().unwrap_or(0);
        nametable.extend_from_slice(&(max_name as u16).to_le_bytes());
        let mut name_offsets = Vec::with_capacity(names.len());
        for name in &names {
            name_offsets.push((nametable_offset + nametable.len()) as u32);
            nametable.extend_from_slice(name.as_bytes());
            nametable.push(0);
        }

        let cod = (nametable_offset + nametable.len()).next_multiple_of(CELL_SIZE);
        let dat = cod + code.len() * CELL_SIZE;
        let hea = dat + self.data.len() * CELL_SIZE;
        let stp = hea + self.stack_size.unwrap_or(DEFAULT_STACK_SIZE);

        let mut image = Vec::with_capacity(hea);
        let put = |image: &mut Vec<u8>, value: usize| {
            image.extend_from_slice(&(value as i32).to_le_bytes());
        };
        put(&mut image, hea);
        image.extend_from_slice(&AMX_MAGIC.to_le_bytes());
        image.push(CUR_FILE_VERSION);
        image.push(MAX_AMX_VERSION);
        image.extend_from_slice(&0i16.to_le_bytes());
        image.extend_from_slice(&(FUNCSTUB_SIZE as i16).to_le_bytes());
        for offset in [cod, dat, hea, stp] {
            put(&mut image, offset);
        }
        image.extend_from_slice(&cip.to_le_bytes());
        for offset in [
            publics_offset,
            natives_offset,
            libraries_offset,
            libraries_offset,
            libraries_offset,
            nametable_offset,
        ] {
            put(&mut image, offset);
        }
        debug_assert_eq!(image.len(), HEADER_SIZE);

        let mut names = name_offsets.into_iter();
        for &(_, address) in &publics {
            image.extend_from_slice(&address.to_le_bytes());
            image.extend_from_slice(&names.next().unwrap_or(0).to_le_bytes());
        }
        for _ in &self.natives {
            image.extend_from_slice(&0i32.to_le_bytes());
            image.extend_from_slice(&names.next().unwrap_or(0).to_le_bytes());
        }
        image.extend_from_slice(&nametable);
        image.resize(cod, 0);
        for value in code.iter().chain(&self.data) {
            image.extend_from_slice(&value.to_le_bytes());
        }
        Ok(image)
    }

    pub fn load(&self) -> Result<Amx, BuildError> {
        Ok(Amx::from_bytes(&self.build()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amx::image::AmxHeader;

    #[test]
    fn test_forward_label() {
        let mut b = ImageBuilder::new();
        let target = b.label();
        b.op1(Opcode::Jump, target);
        b.op(Opcode::Nop);
        b.bind(target);
        b.op(Opcode::Retn);
        let image = b.build().unwrap();
        let header = AmxHeader::parse(&image).unwrap();
        let cod = header.cod as usize;
        let operand = i32::from_le_bytes(image[cod + 4..cod + 8].try_into().unwrap());
        assert_eq!(operand, 12);
    }

    #[test]
    fn test_relative_label() {
        let mut b = ImageBuilder::new();
        let target = b.label();
        b.emit(Opcode::Jrel, &[Arg::Relative(target)]);
        b.op(Opcode::Nop);
        b.bind(target);
        let image = b.build().unwrap();
        let cod = AmxHeader::parse(&image).unwrap().cod as usize;
        let operand = i32::from_le_bytes(image[cod + 4..cod + 8].try_into().unwrap());
        assert_eq!(operand, 4);
    }

    #[test]
    fn test_unbound_label() {
        let mut b = ImageBuilder::new();
        let target = b.label();
        b.op1(Opcode::Call, target);
        assert!(matches!(b.build(), Err(BuildError::UnboundLabel(0))));
    }

    #[test]
    fn test_publics_sorted_by_address() {
        let mut b = ImageBuilder::new();
        let first = b.label();
        let second = b.label();
        b.bind(first);
        b.op(Opcode::Retn);
        b.bind(second);
        b.op(Opcode::Retn);
        b.public("zeta", first);
        b.public("alpha", second);
        let amx = b.load().unwrap();
        assert_eq!(amx.find_public("zeta"), Some(0));
        assert_eq!(amx.find_public("alpha"), Some(1));
    }

    #[test]
    fn test_data_segment() {
        let mut b = ImageBuilder::new();
        b.op(Opcode::Retn);
        let value = b.data_cell(42);
        let text = b.data_string("ok");
        let amx = b.load().unwrap();
        assert_eq!(amx.cell(value).unwrap(), 42);
        assert_eq!(amx.string(text).unwrap(), "ok");
    }
}
