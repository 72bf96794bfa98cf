//! Maps executable regions, optionally inside an address window
//!
//! Based on the proximity allocator from detour-rs: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::ops::Range;

use thiserror::Error;

use super::search as region_search;

#[derive(Debug, Error)]
/// Errors that occur while creating executable regions
pub enum ProximityError {
    /// No free memory is left inside the requested window
    #[error("no executable memory available within {start:#x}..{end:#x}")]
    OutOfMemory {
        /// Lowest acceptable address
        start: usize,
        /// One past the highest acceptable address
        end: usize,
    },
    /// Error while memmapping a region
    #[error("failed to map memory: {0}")]
    MmapError(mmap::MapError),
    /// Error while querying a memory region
    #[error("failed to query memory: {0}")]
    RegionError(#[from] region::Error),
}

// TODO: Use memmap-rs instead
/// A read-, write- & executable memory map.
pub struct ExecutableMap(mmap::MemoryMap);

impl ExecutableMap {
    /// Address of the first byte in the map
    pub fn start(&self) -> usize {
        self.0.data() as usize
    }

    /// Size of the map in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Address range covered by the map
    pub fn range(&self) -> Range<usize> {
        self.start()..self.start() + self.len()
    }
}

// The map is only written through `CodeBuffer`, which serializes writers
unsafe impl Send for ExecutableMap {}
unsafe impl Sync for ExecutableMap {}

/// Maps `size` bytes of executable memory wherever the system sees fit.
pub fn map_anywhere(size: usize) -> Result<ExecutableMap, ProximityError> {
    mmap::MemoryMap::new(
        size,
        &[
            mmap::MapOption::MapReadable,
            mmap::MapOption::MapWritable,
            mmap::MapOption::MapExecutable,
        ],
    )
    .map(ExecutableMap)
    .map_err(ProximityError::MmapError)
}

/// Maps `size` bytes of executable memory fully inside `window`, as close to its middle as possible.
pub fn map_within(window: &Range<usize>, size: usize) -> Result<ExecutableMap, ProximityError> {
    let origin = window.start + (window.end - window.start) / 2;
    let after = region_search::after(origin, window.clone());
    let before = region_search::before(origin, window.clone());

    // Try to allocate after the specified address first (mostly because
    // macOS cannot allocate memory before the process's address).
    for candidate in after.chain(before) {
        let address = candidate?;
        let fits = address
            .checked_add(size)
            .map_or(false, |end| end <= window.end);

        if !fits || !region_search::is_free(address, size) {
            continue;
        }

        if let Some(map) = map_fixed(address, size) {
            return Ok(map);
        }
    }

    Err(ProximityError::OutOfMemory {
        start: window.start,
        end: window.end,
    })
}

/// Tries to map memory at exactly `address`, never replacing an existing mapping.
fn map_fixed(address: usize, size: usize) -> Option<ExecutableMap> {
    let map = mmap::MemoryMap::new(size, &fixed_options(address)).ok()?;

    // Without kernel support for fixed mappings the address is only a hint
    if map.data() as usize != address {
        return None;
    }

    Some(ExecutableMap(map))
}

#[cfg(target_os = "linux")]
/// Mapping options for a fixed address that fail instead of clobbering an existing mapping.
fn fixed_options(address: usize) -> [mmap::MapOption; 5] {
    [
        mmap::MapOption::MapReadable,
        mmap::MapOption::MapWritable,
        mmap::MapOption::MapExecutable,
        mmap::MapOption::MapAddr(address as *const u8),
        mmap::MapOption::MapNonStandardFlags(
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
        ),
    ]
}

#[cfg(not(target_os = "linux"))]
/// Mapping options for a fixed address.
fn fixed_options(address: usize) -> [mmap::MapOption; 4] {
    [
        mmap::MapOption::MapReadable,
        mmap::MapOption::MapWritable,
        mmap::MapOption::MapExecutable,
        mmap::MapOption::MapAddr(address as *const u8),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Regions mapped within a window must land inside it
    fn test_map_within_window() {
        let origin = test_map_within_window as usize;
        let window = origin.saturating_sub(0x1000_0000)..origin.saturating_add(0x1000_0000);
        let size = region::page::size();

        let map = map_within(&window, size).unwrap();

        assert!(window.contains(&map.start()));
        assert!(map.range().end <= window.end);
        assert!(map.len() >= size);
        assert!(!region_search::is_free(map.start(), size));
    }

    #[test]
    /// A window too small for the request fails without mapping anything
    fn test_map_within_tiny_window() {
        let origin = test_map_within_tiny_window as usize;
        let window = origin..origin + 16;

        let error = map_within(&window, region::page::size()).err().unwrap();
        assert!(matches!(error, ProximityError::OutOfMemory { .. }));
    }
}
