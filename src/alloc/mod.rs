//! Allocates executable buffers, optionally near a given address
//!
//! Generated code is append-only: every buffer keeps a write cursor that only moves
//! forward, and code is assembled for the cursor's address while the buffer is locked.
//! Nothing is freed until the allocator itself is dropped.

use std::ops::Range;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;

use crate::error::Result;

pub use self::proximity::ProximityError;

pub mod proximity;
pub mod search;

lazy_static! {
    /// Size of a page on this system
    static ref PAGE_SIZE: usize = region::page::size();
}

/// Alignment of every block of generated code
pub const CODE_ALIGNMENT: usize = 16;

/// Buffers are abandoned in favour of a fresh one this many times before giving up
const EMIT_ATTEMPTS: usize = 3;

/// Size of a page on this system
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Rounds a size up to the closest page boundary.
fn page_ceil(size: usize) -> usize {
    (size + *PAGE_SIZE - 1) & !(*PAGE_SIZE - 1)
}

/// Rounds `value` up to a multiple of `alignment` (a power of two).
fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// A region of executable memory that code is appended to.
pub struct CodeBuffer {
    /// Mapping backing the buffer
    map: proximity::ExecutableMap,
    /// Offset of the first unused byte
    cursor: Mutex<usize>,
}

impl CodeBuffer {
    /// Wraps a fresh mapping
    fn new(map: proximity::ExecutableMap) -> Self {
        Self {
            map,
            cursor: Mutex::new(0),
        }
    }

    /// Address range covered by the buffer
    pub fn range(&self) -> Range<usize> {
        self.map.range()
    }

    /// Returns true if the whole buffer lies inside `window`
    pub fn is_within(&self, window: &Range<usize>) -> bool {
        let range = self.range();
        window.start <= range.start && range.end <= window.end
    }

    /// Number of bytes still available after aligning the cursor
    pub fn remaining(&self) -> usize {
        self.with_lock(|writer| writer.remaining())
    }

    /// Runs `f` with exclusive access to the buffer's write cursor.
    ///
    /// Every emission into the buffer happens inside this critical section, so code
    /// assembled for [`BufferWriter::cursor`] is still placed at that address by
    /// [`BufferWriter::append`].
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut BufferWriter<'_>) -> R) -> R {
        let cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let mut writer = BufferWriter {
            map: &self.map,
            cursor,
        };
        f(&mut writer)
    }
}

/// Exclusive access to a [`CodeBuffer`]'s write cursor
pub struct BufferWriter<'a> {
    /// Mapping being written to
    map: &'a proximity::ExecutableMap,
    /// Locked write cursor
    cursor: MutexGuard<'a, usize>,
}

impl BufferWriter<'_> {
    /// Address the next block of code will be placed at
    pub fn cursor(&self) -> usize {
        self.map.start() + align_up(*self.cursor, CODE_ALIGNMENT)
    }

    /// Bytes available at [`BufferWriter::cursor`]
    pub fn remaining(&self) -> usize {
        self.map
            .len()
            .saturating_sub(align_up(*self.cursor, CODE_ALIGNMENT))
    }

    /// Copies `code` to the cursor and advances it, returning the code's address.
    ///
    /// Returns `None` without writing anything if the code doesn't fit.
    pub fn append(&mut self, code: &[u8]) -> Option<usize> {
        if code.len() > self.remaining() {
            return None;
        }

        let address = self.cursor();
        // Safety: the range was checked against the mapping, and the mapping is writable
        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), address as *mut u8, code.len());
        }
        *self.cursor = address - self.map.start() + code.len();
        Some(address)
    }
}

/// A thread-safe allocator for executable buffers.
pub struct BufferAllocator {
    /// Every buffer mapped so far
    buffers: Mutex<Vec<Arc<CodeBuffer>>>,
    /// Smallest size of a new buffer
    region_size: usize,
}

impl BufferAllocator {
    /// Creates an allocator that maps buffers of at least `region_size` bytes.
    pub fn new(region_size: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            region_size,
        }
    }

    /// Returns a buffer with at least `size` free bytes, entirely inside `window` if one is given.
    ///
    /// Existing buffers are reused when they qualify; otherwise a new one is mapped.
    /// The window is never widened: if nothing fits inside it the allocation fails.
    pub fn find_or_create(
        &self,
        size: usize,
        window: Option<&Range<usize>>,
    ) -> Result<Arc<CodeBuffer>, ProximityError> {
        // A window spanning the whole address space constrains nothing
        let window = window.filter(|window| window.start > 0 || window.end < usize::MAX);
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);

        let existing = buffers.iter().find(|buffer| {
            window.map_or(true, |window| buffer.is_within(window)) && buffer.remaining() >= size
        });
        if let Some(buffer) = existing {
            return Ok(buffer.clone());
        }

        let map_size = page_ceil(size.max(self.region_size));
        let map = match window {
            Some(window) => proximity::map_within(window, map_size)?,
            None => proximity::map_anywhere(map_size)?,
        };

        tracing::debug!(
            start = map.start(),
            len = map.len(),
            constrained = window.is_some(),
            "mapped executable region"
        );

        let buffer = Arc::new(CodeBuffer::new(map));
        buffers.push(buffer.clone());
        Ok(buffer)
    }

    /// Assembles code for its final address and commits it to a buffer inside `window`.
    ///
    /// `assemble` receives the load address and returns the encoded bytes plus any extra
    /// data the caller needs. It runs inside the buffer's critical section, and may run
    /// again for a different address if its output outgrew `estimate`.
    pub fn emit<T>(
        &self,
        window: Option<&Range<usize>>,
        estimate: usize,
        mut assemble: impl FnMut(u64) -> Result<(Vec<u8>, T)>,
    ) -> Result<(usize, T)> {
        let mut required = estimate;

        for _ in 0..EMIT_ATTEMPTS {
            let buffer = self.find_or_create(required, window)?;
            let emitted = buffer.with_lock(|writer| -> Result<Option<(usize, T)>> {
                let (code, extra) = assemble(writer.cursor() as u64)?;
                match writer.append(&code) {
                    Some(address) => Ok(Some((address, extra))),
                    None => {
                        required = code.len();
                        Ok(None)
                    }
                }
            })?;

            if let Some(emitted) = emitted {
                return Ok(emitted);
            }
        }

        let (start, end) = window.map_or((0, usize::MAX), |window| (window.start, window.end));
        Err(ProximityError::OutOfMemory { start, end }.into())
    }
}

/// Returns the window of addresses reachable from `origin` with a displacement of `max_distance`.
pub fn window_around(origin: usize, max_distance: usize) -> Range<usize> {
    origin.saturating_sub(max_distance)..origin.saturating_add(max_distance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Appended code is aligned, copied verbatim and never overlaps
    fn test_append() {
        let allocator = BufferAllocator::new(0x1000);
        let buffer = allocator.find_or_create(64, None).unwrap();

        let (first, second) = buffer.with_lock(|writer| {
            let first = writer.append(&[0x90, 0xc3]).unwrap();
            let second = writer.append(&[0xcc; 3]).unwrap();
            (first, second)
        });

        assert_eq!(first % CODE_ALIGNMENT, 0);
        assert_eq!(second % CODE_ALIGNMENT, 0);
        assert_eq!(second, first + CODE_ALIGNMENT);
        assert_eq!(unsafe { std::slice::from_raw_parts(first as *const u8, 2) }, [0x90, 0xc3]);
        assert_eq!(unsafe { std::slice::from_raw_parts(second as *const u8, 3) }, [0xcc; 3]);
    }

    #[test]
    /// Code that doesn't fit is rejected without moving the cursor
    fn test_append_overflow() {
        let allocator = BufferAllocator::new(0x1000);
        let buffer = allocator.find_or_create(16, None).unwrap();
        let size = buffer.range().len();

        buffer.with_lock(|writer| {
            let before = writer.cursor();
            assert!(writer.append(&vec![0xcc; size + 1]).is_none());
            assert_eq!(writer.cursor(), before);
        });
    }

    #[test]
    /// Buffers with space left are reused; full ones are replaced
    fn test_find_or_create_reuses_buffers() {
        let allocator = BufferAllocator::new(0x1000);
        let first = allocator.find_or_create(16, None).unwrap();
        let again = allocator.find_or_create(16, None).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let larger = allocator.find_or_create(first.range().len() + 1, None).unwrap();
        assert!(!Arc::ptr_eq(&first, &larger));
    }

    #[test]
    /// Emitted code is assembled for the address it ends up at
    fn test_emit_reports_load_address() {
        let origin = test_emit_reports_load_address as usize;
        let window = window_around(origin, 0x4000_0000);
        let allocator = BufferAllocator::new(0x1000);

        let (address, assembled_for) = allocator
            .emit(Some(&window), 8, |ip| Ok((vec![0xc3], ip)))
            .unwrap();

        assert_eq!(address as u64, assembled_for);
        assert!(window.contains(&address));
    }
}
