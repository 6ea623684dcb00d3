//! Executable memory management using mmap.
//!
//! Pages are mapped read/write, filled, then flipped to read/execute. They are
//! never writable and executable at the same time.

use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory allocation failed: {0}")]
    AllocationFailed(std::io::Error),
    #[error("memory protection change failed: {0}")]
    ProtectionFailed(std::io::Error),
    #[error("memory is already executable")]
    Sealed,
    #[error("invalid memory size")]
    InvalidSize,
}

/// A block of memory holding generated code.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    len: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map a writable block large enough for `size` bytes.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        let page_size = Self::page_size();
        let aligned_size = size.next_multiple_of(page_size);

        // SAFETY: anonymous private mapping with no address hint.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed(std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(MemoryError::InvalidSize)?;

        Ok(Self {
            ptr,
            size: aligned_size,
            len: 0,
            executable: false,
        })
    }

    /// Map a block and copy `code` into it, leaving it executable.
    pub fn with_code(code: &[u8]) -> Result<Self, MemoryError> {
        let mut mem = Self::new(code.len())?;
        mem.write(0, code)?;
        mem.make_executable()?;
        Ok(mem)
    }

    fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).unwrap_or(4096)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping, rounded up to whole pages.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::Sealed);
        }
        let end = offset.checked_add(data.len()).ok_or(MemoryError::InvalidSize)?;
        if end > self.size {
            return Err(MemoryError::InvalidSize);
        }

        // SAFETY: the range was checked against the mapping above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        self.len = self.len.max(end);
        Ok(())
    }

    /// Make the memory read/execute. Further writes fail.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }

        // SAFETY: ptr/size describe a mapping owned by self.
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().cast::<libc::c_void>(),
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed(std::io::Error::last_os_error()));
        }

        self.executable = true;
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// The written bytes.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the first `len` bytes are initialized and readable in both
        // protection states.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned by self and unmapped exactly once.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.size);
        }
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("len", &self.len)
            .field("executable", &self.executable)
            .finish()
    }
}
