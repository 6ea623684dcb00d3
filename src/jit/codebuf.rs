//! Code buffer for building JIT code.
//!
//! Machine code is assembled into a plain byte vector and copied into
//! executable memory once complete. Branches to code that has not been
//! emitted yet go through [`Label`]s and are patched in `finish`.

use thiserror::Error;

use super::memory::{ExecutableMemory, MemoryError};

/// A position in the code buffer, bound at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);

#[derive(Debug, Error)]
pub enum CodeBufferError {
    #[error("label {0:?} is referenced but never bound")]
    Unbound(Label),
    #[error("relative offset to label {0:?} out of range")]
    OutOfRange(Label),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// A buffer for building machine code.
#[derive(Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Offsets of bound labels, indexed by label id.
    labels: Vec<Option<usize>>,
    /// Pending rel32 references: (offset of the displacement, target).
    forward_refs: Vec<(usize, Label)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Current offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0 as usize] = Some(self.code.len());
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).copied().flatten()
    }

    /// Emit a 32-bit displacement to `label`, relative to the end of the
    /// displacement.
    pub fn emit_label_ref(&mut self, label: Label) {
        self.forward_refs.push((self.code.len(), label));
        self.emit_u32(0);
    }

    fn patch_forward_refs(&mut self) -> Result<(), CodeBufferError> {
        for (offset, label) in self.forward_refs.drain(..) {
            let target = self.labels[label.0 as usize].ok_or(CodeBufferError::Unbound(label))?;
            let rel = i32::try_from(target as i64 - (offset as i64 + 4))
                .map_err(|_| CodeBufferError::OutOfRange(label))?;
            self.code[offset..offset + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(())
    }

    /// Patch all label references and return the finished code.
    pub fn finish(mut self) -> Result<Vec<u8>, CodeBufferError> {
        self.patch_forward_refs()?;
        Ok(self.code)
    }

    /// Patch all label references and copy the code to executable memory.
    pub fn finalize(self) -> Result<ExecutableMemory, CodeBufferError> {
        let code = self.finish()?;
        Ok(ExecutableMemory::with_code(&code)?)
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Pad with `int3` up to the given power-of-two boundary.
    pub fn align(&mut self, alignment: usize) {
        let aligned = self.code.len().next_multiple_of(alignment);
        self.code.resize(aligned, 0xCC);
    }
}
