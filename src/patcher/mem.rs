//! Reads and writes process memory, adjusting page permissions to patch read-only code

use std::ptr;
use std::slice;

use region::Protection;
use thiserror::Error;

/// Errors when accessing process memory
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Part of the range is not mapped or not readable
    #[error("{len} bytes at {address:#x} are not readable")]
    Unreadable {
        /// Start of the range
        address: usize,
        /// Length of the range
        len: usize,
    },
    /// Error when querying or setting memory protections
    #[error("Error setting memory protections")]
    ProtectionError(#[from] region::Error),
}

/// Access to the memory holding the code being hooked
///
/// # Safety
///
/// Implementors must write exactly the bytes given, at exactly the address given, in a single
/// operation as seen by the calling thread.
pub unsafe trait MemoryAccess: Send + Sync {
    /// Reads `len` bytes at `address`.
    ///
    /// # Safety
    ///
    /// `address` must not be memory that Rust is concurrently mutating
    unsafe fn read(&self, address: usize, len: usize) -> Result<Vec<u8>, MemoryError>;

    /// Reads up to `max` bytes at `address`, stopping early at the end of readable memory.
    ///
    /// # Safety
    ///
    /// Same as [`MemoryAccess::read`]
    unsafe fn read_available(&self, address: usize, max: usize) -> Result<Vec<u8>, MemoryError> {
        self.read(address, max)
    }

    /// Writes `bytes` at `address`, whatever the page permissions are.
    ///
    /// # Safety
    ///
    /// The write must not break code that is executing or memory that Rust tracks.
    /// As always, casting a `&T` or `&mut T` to an address for use here can result in undefined behavior.
    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError>;
}

/// Memory of the current process
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessMemory;

impl ProcessMemory {
    /// Number of readable bytes at `address`, up to `max`
    fn readable_len(address: usize, max: usize) -> Result<usize, MemoryError> {
        let mut len = 0;
        if max == 0 {
            return Ok(0);
        }

        for region in region::query_range(address as *const u8, max)? {
            let region = match region {
                Ok(region) => region,
                Err(region::Error::UnmappedRegion) => break,
                Err(e) => return Err(e.into()),
            };
            let range = region.as_range();
            if range.start > address + len || !region.is_readable() || region.is_guarded() {
                break;
            }
            len = (range.end - address).min(max);
        }

        Ok(len)
    }
}

unsafe impl MemoryAccess for ProcessMemory {
    unsafe fn read(&self, address: usize, len: usize) -> Result<Vec<u8>, MemoryError> {
        if Self::readable_len(address, len)? < len {
            return Err(MemoryError::Unreadable { address, len });
        }
        Ok(slice::from_raw_parts(address as *const u8, len).to_vec())
    }

    unsafe fn read_available(&self, address: usize, max: usize) -> Result<Vec<u8>, MemoryError> {
        let len = Self::readable_len(address, max)?;
        Ok(slice::from_raw_parts(address as *const u8, len).to_vec())
    }

    unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<(), MemoryError> {
        // Restores the previous permissions when dropped
        let _guard = region::protect_with_handle(address as *const u8, bytes.len(), Protection::READ_WRITE_EXECUTE)?;
        ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        Ok(())
    }
}
