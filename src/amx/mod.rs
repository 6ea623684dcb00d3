//! The Pawn abstract machine instance the compiler works against.
//!
//! An [`Amx`] owns one loaded image laid out in a single contiguous block:
//! header, symbol tables, code, data, heap and stack. The block never moves
//! or grows after loading, so compiled code may hold raw pointers into the
//! data segment for as long as the instance lives.

pub mod builder;
mod error;
pub mod image;
pub mod opcode;

use std::path::Path;

pub use builder::{Arg, BuildError, CodeLabel, ImageBuilder};
pub use error::AmxError;
pub use image::{AmxHeader, LoadError};
pub use opcode::{Arity, Opcode};

use crate::jit::NativeFn;

/// The VM's basic integer/pointer unit.
pub type Cell = i32;
/// Unsigned view of a cell.
pub type UCell = u32;

pub const CELL_SIZE: usize = std::mem::size_of::<Cell>();

/// Minimum distance kept between the top of the heap and the stack.
pub const STACK_MARGIN: Cell = 16 * CELL_SIZE as Cell;

/// The abstract machine registers. All addresses are relative to the start of
/// the data segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub pri: Cell,
    pub alt: Cell,
    pub frm: Cell,
    pub stk: Cell,
    pub hea: Cell,
    pub hlw: Cell,
    pub stp: Cell,
    pub cip: Cell,
}

/// A loaded abstract machine.
pub struct Amx {
    memory: Vec<u8>,
    header: AmxHeader,
    regs: Registers,
    paramcount: usize,
    natives: Vec<NativeFn>,
}

impl std::fmt::Debug for Amx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Amx")
            .field("header", &self.header)
            .field("regs", &self.regs)
            .field("paramcount", &self.paramcount)
            .field("registered_natives", &self.natives.len())
            .finish()
    }
}

impl Amx {
    /// Load an image from memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        let header = AmxHeader::parse(bytes)?;

        let mut memory = bytes[..header.size as usize].to_vec();
        memory.resize(header.stp as usize, 0);

        let hlw = header.hea - header.dat;
        let stp = header.stp - header.dat - CELL_SIZE as Cell;
        let regs = Registers {
            hlw,
            hea: hlw,
            stp,
            stk: stp,
            cip: header.cip,
            ..Registers::default()
        };

        Ok(Self {
            memory,
            header,
            regs,
            paramcount: 0,
            natives: Vec::new(),
        })
    }

    /// Load an image from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn header(&self) -> &AmxHeader {
        &self.header
    }

    /// The whole image block, starting with the header.
    pub fn image(&self) -> &[u8] {
        &self.memory
    }

    pub fn code(&self) -> &[u8] {
        &self.memory[self.header.cod as usize..self.header.dat as usize]
    }

    /// Data segment, including heap and stack.
    pub fn data(&self) -> &[u8] {
        &self.memory[self.header.dat as usize..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let dat = self.header.dat as usize;
        &mut self.memory[dat..]
    }

    pub fn data_size(&self) -> usize {
        self.header.data_size()
    }

    pub fn regs(&self) -> &Registers {
        &self.regs
    }

    pub fn regs_mut(&mut self) -> &mut Registers {
        &mut self.regs
    }

    pub(crate) fn regs_ptr(&mut self) -> *mut Registers {
        &mut self.regs
    }

    pub(crate) fn data_ptr(&mut self) -> *mut u8 {
        self.data_mut().as_mut_ptr()
    }

    /// Number of cells pushed by the host since the last call.
    pub fn paramcount(&self) -> usize {
        self.paramcount
    }

    pub(crate) fn take_paramcount(&mut self) -> usize {
        std::mem::take(&mut self.paramcount)
    }

    fn checked_range(&self, addr: Cell, len: usize) -> Result<std::ops::Range<usize>, AmxError> {
        let start = usize::try_from(addr).map_err(|_| AmxError::MemoryAccess)?;
        let end = start.checked_add(len).ok_or(AmxError::MemoryAccess)?;
        if end > self.data_size() {
            return Err(AmxError::MemoryAccess);
        }
        Ok(start..end)
    }

    /// Read the cell at a data address.
    pub fn cell(&self, addr: Cell) -> Result<Cell, AmxError> {
        let range = self.checked_range(addr, CELL_SIZE)?;
        let bytes = &self.data()[range];
        Ok(Cell::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write the cell at a data address.
    pub fn set_cell(&mut self, addr: Cell, value: Cell) -> Result<(), AmxError> {
        let range = self.checked_range(addr, CELL_SIZE)?;
        self.data_mut()[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read an unpacked string (one character per cell, NUL-terminated).
    pub fn string(&self, addr: Cell) -> Result<String, AmxError> {
        let mut out = String::new();
        let mut at = addr;
        loop {
            let c = self.cell(at)?;
            if c == 0 {
                return Ok(out);
            }
            out.push(char::from_u32(c as u32).unwrap_or(char::REPLACEMENT_CHARACTER));
            at += CELL_SIZE as Cell;
        }
    }

    /// Push an argument for the next call, like `amx_Push`.
    pub fn push(&mut self, value: Cell) -> Result<(), AmxError> {
        let stk = self.regs.stk - CELL_SIZE as Cell;
        if self.regs.hea + STACK_MARGIN > stk {
            return Err(AmxError::StackError);
        }
        self.set_cell(stk, value)?;
        self.regs.stk = stk;
        self.paramcount += 1;
        Ok(())
    }

    /// Reserve `cells` cells on the heap and return their address.
    pub fn allot(&mut self, cells: usize) -> Result<Cell, AmxError> {
        let bytes = Cell::try_from(cells * CELL_SIZE).map_err(|_| AmxError::Memory)?;
        if self.regs.stk - self.regs.hea - bytes < STACK_MARGIN {
            return Err(AmxError::Memory);
        }
        let addr = self.regs.hea;
        self.regs.hea += bytes;
        Ok(addr)
    }

    /// Release heap memory down to `addr`.
    pub fn release(&mut self, addr: Cell) {
        if self.regs.hea > addr {
            self.regs.hea = addr.max(self.regs.hlw);
        }
    }

    /// Copy a string onto the heap (unpacked) and push its address.
    pub fn push_string(&mut self, value: &str) -> Result<Cell, AmxError> {
        let chars: Vec<char> = value.chars().collect();
        let addr = self.allot(chars.len() + 1)?;
        for (i, c) in chars.iter().enumerate() {
            self.set_cell(addr + (i * CELL_SIZE) as Cell, *c as Cell)?;
        }
        self.set_cell(addr + (chars.len() * CELL_SIZE) as Cell, 0)?;
        self.push(addr)?;
        Ok(addr)
    }

    pub fn find_public(&self, name: &str) -> Option<usize> {
        self.header.publics().find(&self.memory, name)
    }

    pub fn find_native(&self, name: &str) -> Option<usize> {
        self.header.natives().find(&self.memory, name)
    }

    /// Bind the native named `name` to `func`.
    ///
    /// The record's address field receives a non-zero handle that identifies
    /// `func` for the lifetime of this instance.
    pub fn register(&mut self, name: &str, func: NativeFn) -> Result<(), AmxError> {
        let index = self.find_native(name).ok_or(AmxError::NotFound)?;
        let offset = self
            .header
            .natives()
            .record_offset(index)
            .ok_or(AmxError::Index)?;

        self.natives.push(func);
        let handle = self.natives.len() as Cell;
        self.memory[offset..offset + CELL_SIZE].copy_from_slice(&handle.to_le_bytes());
        Ok(())
    }

    /// Bind every native in `natives` that the image imports; returns how many
    /// were bound.
    pub fn register_natives(&mut self, natives: &[(&str, NativeFn)]) -> usize {
        natives
            .iter()
            .filter(|(name, func)| self.register(name, *func).is_ok())
            .count()
    }

    /// Function bound to a native handle.
    pub(crate) fn native_fn(&self, handle: Cell) -> Option<NativeFn> {
        let index = usize::try_from(handle).ok()?.checked_sub(1)?;
        self.natives.get(index).copied()
    }
}
