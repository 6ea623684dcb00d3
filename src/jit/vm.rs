//! Non-owning view of an [`Amx`] used by the compiler and the runtime bridge.
//!
//! Generated code, native functions and the host all touch the same instance
//! while a call is in flight, so the view is a copyable raw handle rather than
//! a borrow. Its lifetime still ties it to an exclusive borrow of the
//! instance, so nothing outside the JIT can observe the aliasing.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::amx::image::FuncTable;
use crate::amx::{Amx, AmxError, AmxHeader, CELL_SIZE, Cell, Registers};

#[derive(Clone, Copy)]
pub struct AmxVm<'a> {
    amx: NonNull<Amx>,
    _marker: PhantomData<&'a mut Amx>,
}

impl std::fmt::Debug for AmxVm<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("AmxVm").field(&self.amx).finish()
    }
}

impl<'a> AmxVm<'a> {
    pub fn new(amx: &'a mut Amx) -> Self {
        Self {
            amx: NonNull::from(amx),
            _marker: PhantomData,
        }
    }

    pub fn amx(&self) -> &Amx {
        // SAFETY: the instance outlives 'a and is only mutated through this
        // view while it exists.
        unsafe { self.amx.as_ref() }
    }

    /// Mutable access to the instance, for as long as the view's borrow.
    ///
    /// # Safety
    /// No other reference into the instance may be alive while the result
    /// is used.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn amx_mut(&self) -> &'a mut Amx {
        // SAFETY: upheld by the caller.
        unsafe { &mut *self.amx.as_ptr() }
    }

    pub fn header(&self) -> AmxHeader {
        *self.amx().header()
    }

    pub fn code(&self) -> &[u8] {
        self.amx().code()
    }

    pub fn code_size(&self) -> usize {
        self.header().code_size()
    }

    pub fn data_size(&self) -> usize {
        self.amx().data_size()
    }

    pub fn code_base(&self) -> *const u8 {
        self.code().as_ptr()
    }

    pub(crate) fn data_base(&self) -> *mut u8 {
        // SAFETY: short-lived exclusive access to take a pointer.
        unsafe { self.amx_mut().data_ptr() }
    }

    pub(crate) fn regs_ptr(&self) -> *mut Registers {
        // SAFETY: short-lived exclusive access to take a pointer.
        unsafe { self.amx_mut().regs_ptr() }
    }

    pub fn regs(&self) -> Registers {
        *self.amx().regs()
    }

    pub(crate) fn set_regs(&self, regs: Registers) {
        // SAFETY: no reference escapes this call.
        unsafe { *self.amx_mut().regs_mut() = regs };
    }

    // ==================== Symbol tables ====================

    fn table_address(&self, table: FuncTable, index: usize) -> Option<Cell> {
        table.get(self.amx().image(), index).map(|stub| stub.address)
    }

    fn table_index(&self, table: FuncTable, address: Cell) -> Option<usize> {
        let image = self.amx().image();
        (0..table.len()).find(|&index| table.get(image, index).map(|s| s.address) == Some(address))
    }

    pub fn num_publics(&self) -> usize {
        self.header().publics().len()
    }

    pub fn num_natives(&self) -> usize {
        self.header().natives().len()
    }

    /// Code address of public function `index`.
    pub fn public_address(&self, index: usize) -> Option<Cell> {
        self.table_address(self.header().publics(), index)
    }

    /// Index of the public function starting at `address`.
    pub fn public_index(&self, address: Cell) -> Option<usize> {
        self.table_index(self.header().publics(), address)
    }

    pub fn public_name(&self, index: usize) -> Option<&str> {
        self.header().publics().name(self.amx().image(), index)
    }

    pub fn find_public(&self, name: &str) -> Option<usize> {
        self.amx().find_public(name)
    }

    /// Handle stored in native record `index` (zero while unregistered).
    pub fn native_address(&self, index: usize) -> Option<Cell> {
        self.table_address(self.header().natives(), index)
    }

    pub fn native_index(&self, address: Cell) -> Option<usize> {
        self.table_index(self.header().natives(), address)
    }

    pub fn native_name(&self, index: usize) -> Option<&str> {
        self.header().natives().name(self.amx().image(), index)
    }

    pub fn find_native(&self, name: &str) -> Option<usize> {
        self.amx().find_native(name)
    }

    // ==================== Stack ====================

    pub fn stk(&self) -> Cell {
        self.amx().regs().stk
    }

    pub(crate) fn set_stk(&self, stk: Cell) {
        // SAFETY: no reference escapes this call.
        unsafe { self.amx_mut().regs_mut().stk = stk };
    }

    pub fn cell(&self, addr: Cell) -> Result<Cell, AmxError> {
        self.amx().cell(addr)
    }

    /// Push one cell onto the VM stack.
    pub fn push(&self, value: Cell) -> Result<(), AmxError> {
        // SAFETY: no reference escapes this call.
        let amx = unsafe { self.amx_mut() };
        let regs = *amx.regs();
        let stk = regs.stk - CELL_SIZE as Cell;
        if stk < regs.hea {
            return Err(AmxError::StackError);
        }
        amx.set_cell(stk, value)?;
        amx.regs_mut().stk = stk;
        Ok(())
    }

    /// Pop one cell off the VM stack.
    pub fn pop(&self) -> Result<Cell, AmxError> {
        let value = self.cell(self.stk())?;
        self.pop_n(1)?;
        Ok(value)
    }

    /// Discard `count` cells.
    pub fn pop_n(&self, count: usize) -> Result<(), AmxError> {
        let regs = self.regs();
        let stk = regs.stk + (count * CELL_SIZE) as Cell;
        if stk > regs.stp {
            return Err(AmxError::StackLow);
        }
        self.set_stk(stk);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amx::{ImageBuilder, Opcode};
    use crate::jit::NativeCall;

    fn nop(_: &mut NativeCall<'_, '_>, _: &[Cell]) -> Result<Cell, AmxError> {
        Ok(0)
    }

    fn sample() -> Amx {
        let mut b = ImageBuilder::new();
        for name in ["first", "second", "third"] {
            let entry = b.label();
            b.bind(entry);
            b.op(Opcode::Proc);
            b.op(Opcode::Retn);
            b.public(name, entry);
        }
        b.native("a");
        b.native("b");
        b.load().unwrap()
    }

    #[test]
    fn test_public_duality() {
        let mut amx = sample();
        let vm = AmxVm::new(&mut amx);
        assert_eq!(vm.num_publics(), 3);
        for index in 0..vm.num_publics() {
            let address = vm.public_address(index).unwrap();
            assert_eq!(vm.public_index(address), Some(index));
        }
        assert_eq!(vm.public_address(1), Some(8));
        assert_eq!(vm.public_name(2), Some("third"));
        assert_eq!(vm.public_address(3), None);
    }

    #[test]
    fn test_native_duality() {
        let mut amx = sample();
        amx.register("a", nop).unwrap();
        amx.register("b", nop).unwrap();
        let vm = AmxVm::new(&mut amx);
        for index in 0..vm.num_natives() {
            let address = vm.native_address(index).unwrap();
            assert_ne!(address, 0);
            assert_eq!(vm.native_index(address), Some(index));
        }
        assert_eq!(vm.find_native("b"), Some(1));
        assert_eq!(vm.native_name(0), Some("a"));
    }

    #[test]
    fn test_push_pop() {
        let mut amx = sample();
        let vm = AmxVm::new(&mut amx);
        let stk = vm.stk();
        vm.push(1).unwrap();
        vm.push(2).unwrap();
        assert_eq!(vm.stk(), stk - 8);
        assert_eq!(vm.pop().unwrap(), 2);
        vm.pop_n(1).unwrap();
        assert_eq!(vm.stk(), stk);
        assert_eq!(vm.pop_n(1), Err(AmxError::StackLow));
    }
}
