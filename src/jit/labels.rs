//! Bytecode address to native label mapping.

use std::collections::BTreeMap;

use super::codebuf::Label;
use super::x86_64::X86_64Assembler;
use crate::amx::Cell;

/// Why a label exists at a bytecode address. One address may carry several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LabelTag {
    /// Start of the instruction; target of jumps, calls and the code map.
    Instr,
    /// Case dispatch of a `CASETBL`, entered from `SWITCH`.
    CaseTable,
}

/// Label key, ordered by address first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaggedAddress {
    pub address: Cell,
    pub tag: LabelTag,
}

impl TaggedAddress {
    pub fn new(address: Cell, tag: LabelTag) -> Self {
        Self { address, tag }
    }
}

#[derive(Debug)]
struct Entry {
    label: Label,
    bound: bool,
    /// First instruction that referenced the label, for diagnostics.
    referrer: Option<Cell>,
}

/// Labels created lazily on first mention and bound when their address is
/// reached during compilation.
#[derive(Debug, Default)]
pub struct LabelTable {
    entries: BTreeMap<TaggedAddress, Entry>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label for `key`, created if this is the first mention.
    pub fn get(&mut self, asm: &mut X86_64Assembler<'_>, key: TaggedAddress, referrer: Cell) -> Label {
        self.entries
            .entry(key)
            .or_insert_with(|| Entry {
                label: asm.new_label(),
                bound: false,
                referrer: Some(referrer),
            })
            .label
    }

    /// Bind the label for `key` to the current code offset.
    pub fn bind(&mut self, asm: &mut X86_64Assembler<'_>, key: TaggedAddress) -> Label {
        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            label: asm.new_label(),
            bound: false,
            referrer: None,
        });
        asm.bind(entry.label);
        entry.bound = true;
        entry.label
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Referenced labels that were never bound, with their first referrer.
    pub fn unbound(&self) -> impl Iterator<Item = (TaggedAddress, Option<Cell>)> + '_ {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.bound)
            .map(|(key, entry)| (*key, entry.referrer))
    }
}
