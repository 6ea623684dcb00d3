//! AMX file header and symbol tables.
//!
//! Only what the compiler needs is parsed: the header is validated once when
//! an image is loaded, and symbol tables are read in place from the image
//! bytes whenever they are consulted.

use std::io;

use thiserror::Error;

use super::{CELL_SIZE, Cell};

/// Magic number of images with 32-bit cells.
pub const AMX_MAGIC: u16 = 0xF1E0;
/// Size of the on-disk header in bytes.
pub const HEADER_SIZE: usize = 56;
/// Size of one public/native table record (`AMX_FUNCSTUBNT`).
pub const FUNCSTUB_SIZE: usize = 8;
/// Oldest file format with a name table.
pub const MIN_FILE_VERSION: u8 = 7;
/// Newest file format understood here.
pub const CUR_FILE_VERSION: u8 = 8;
/// Newest abstract machine version required by an image.
pub const MAX_AMX_VERSION: u8 = 8;

pub const FLAG_DEBUG: i16 = 0x02;
pub const FLAG_COMPACT: i16 = 0x04;

/// Image loading failure.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("image is truncated ({0} bytes)")]
    Truncated(usize),
    #[error("bad magic number {0:#06x}")]
    BadMagic(u16),
    #[error("unsupported file version {file} (amx version {amx})")]
    Version { file: u8, amx: u8 },
    #[error("compact encoding is not supported")]
    Compact,
    #[error("unexpected table record size {0}")]
    DefSize(i16),
    #[error("invalid layout: {0}")]
    Layout(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed copy of an `AMX_HEADER`. Offsets are relative to the start of the
/// image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmxHeader {
    pub size: i32,
    pub magic: u16,
    pub file_version: u8,
    pub amx_version: u8,
    pub flags: i16,
    pub defsize: i16,
    pub cod: i32,
    pub dat: i32,
    pub hea: i32,
    pub stp: i32,
    pub cip: i32,
    pub publics: i32,
    pub natives: i32,
    pub libraries: i32,
    pub pubvars: i32,
    pub tags: i32,
    pub nametable: i32,
}

fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn read_i16(bytes: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

impl AmxHeader {
    /// Parse and validate the header at the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < HEADER_SIZE {
            return Err(LoadError::Truncated(bytes.len()));
        }

        let header = AmxHeader {
            size: read_i32(bytes, 0),
            magic: u16::from_le_bytes([bytes[4], bytes[5]]),
            file_version: bytes[6],
            amx_version: bytes[7],
            flags: read_i16(bytes, 8),
            defsize: read_i16(bytes, 10),
            cod: read_i32(bytes, 12),
            dat: read_i32(bytes, 16),
            hea: read_i32(bytes, 20),
            stp: read_i32(bytes, 24),
            cip: read_i32(bytes, 28),
            publics: read_i32(bytes, 32),
            natives: read_i32(bytes, 36),
            libraries: read_i32(bytes, 40),
            pubvars: read_i32(bytes, 44),
            tags: read_i32(bytes, 48),
            nametable: read_i32(bytes, 52),
        };
        header.validate(bytes.len())?;
        Ok(header)
    }

    fn validate(&self, len: usize) -> Result<(), LoadError> {
        if self.magic != AMX_MAGIC {
            return Err(LoadError::BadMagic(self.magic));
        }
        if self.file_version < MIN_FILE_VERSION
            || self.file_version > CUR_FILE_VERSION
            || self.amx_version > MAX_AMX_VERSION
        {
            return Err(LoadError::Version {
                file: self.file_version,
                amx: self.amx_version,
            });
        }
        if self.flags & FLAG_COMPACT != 0 {
            return Err(LoadError::Compact);
        }
        if self.defsize as usize != FUNCSTUB_SIZE {
            return Err(LoadError::DefSize(self.defsize));
        }

        let ordered = [
            HEADER_SIZE as i32,
            self.publics,
            self.natives,
            self.libraries,
            self.pubvars,
            self.tags,
            self.nametable,
            self.cod,
            self.dat,
            self.hea,
            self.stp,
        ];
        if ordered.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(LoadError::Layout("sections are out of order"));
        }
        if self.size < self.hea || self.size as usize > len {
            return Err(LoadError::Truncated(len));
        }
        if (self.natives - self.publics) as usize % FUNCSTUB_SIZE != 0
            || (self.libraries - self.natives) as usize % FUNCSTUB_SIZE != 0
        {
            return Err(LoadError::Layout("symbol table size is not a multiple of the record size"));
        }
        if (self.dat - self.cod) as usize % CELL_SIZE != 0 {
            return Err(LoadError::Layout("code segment is not cell aligned"));
        }
        if self.stp - self.hea < 2 * CELL_SIZE as i32 {
            return Err(LoadError::Layout("no room for a stack"));
        }
        Ok(())
    }

    pub fn code_size(&self) -> usize {
        (self.dat - self.cod) as usize
    }

    /// Size of the data segment including heap and stack.
    pub fn data_size(&self) -> usize {
        (self.stp - self.dat) as usize
    }

    pub fn publics(&self) -> FuncTable {
        FuncTable::new(self.publics, self.natives)
    }

    pub fn natives(&self) -> FuncTable {
        FuncTable::new(self.natives, self.libraries)
    }
}

/// One public/native table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncStub {
    pub address: Cell,
    pub name_offset: u32,
}

/// A contiguous array of `FuncStub` records inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncTable {
    offset: usize,
    len: usize,
}

impl FuncTable {
    fn new(start: i32, end: i32) -> Self {
        Self {
            offset: start as usize,
            len: (end - start) as usize / FUNCSTUB_SIZE,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte offset of record `index` inside the image.
    pub fn record_offset(&self, index: usize) -> Option<usize> {
        (index < self.len).then(|| self.offset + index * FUNCSTUB_SIZE)
    }

    pub fn get(&self, image: &[u8], index: usize) -> Option<FuncStub> {
        let offset = self.record_offset(index)?;
        Some(FuncStub {
            address: read_i32(image, offset),
            name_offset: read_i32(image, offset + CELL_SIZE) as u32,
        })
    }

    /// Name of record `index`; names are NUL-terminated ASCII.
    pub fn name<'a>(&self, image: &'a [u8], index: usize) -> Option<&'a str> {
        let stub = self.get(image, index)?;
        let start = stub.name_offset as usize;
        let tail = image.get(start..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&tail[..end]).ok()
    }

    pub fn find(&self, image: &[u8], name: &str) -> Option<usize> {
        (0..self.len).find(|&index| self.name(image, index) == Some(name))
    }
}
