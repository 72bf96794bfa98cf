//! Searches the address space for unmapped pages close to an address
//!
//! Based on the region search from detour-rs: https://github.com/darfink/detour-rs

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

/// Returns an iterator over free pages at or after `origin`, staying inside `range`.
pub fn after(
    origin: usize,
    range: Range<usize>,
) -> impl Iterator<Item = Result<usize, region::Error>> {
    FreeRegionIter::new(origin, range, SearchDirection::After)
}

/// Returns an iterator over free pages before `origin`, staying inside `range`.
pub fn before(
    origin: usize,
    range: Range<usize>,
) -> impl Iterator<Item = Result<usize, region::Error>> {
    FreeRegionIter::new(origin, range, SearchDirection::Before)
}

/// Returns true if every page overlapping `address..address + size` is unmapped.
pub fn is_free(address: usize, size: usize) -> bool {
    let page_size = region::page::size();
    let end = match address.checked_add(size) {
        Some(end) => end,
        None => return false,
    };

    (address..end)
        .step_by(page_size)
        .all(|page| matches!(region::query(page as *const u8), Err(region::Error::UnmappedRegion)))
}

#[allow(clippy::missing_docs_in_private_items)]
/// Direction for the region search.
enum SearchDirection {
    Before,
    After,
}

/// An iterator searching for free regions.
struct FreeRegionIter {
    /// Range we're iterating over
    range: Range<usize>,
    /// Direction we're searching
    search: SearchDirection,
    /// Current location in the search
    current: usize,
}

impl FreeRegionIter {
    /// Creates a new iterator for free regions, starting at the page containing `origin`.
    fn new(origin: usize, range: Range<usize>, search: SearchDirection) -> Self {
        let page_size = region::page::size();
        let current = match search {
            SearchDirection::After => origin & !(page_size - 1),
            SearchDirection::Before => (origin & !(page_size - 1)).saturating_sub(page_size),
        };

        FreeRegionIter {
            range,
            current,
            search,
        }
    }
}

impl Iterator for FreeRegionIter {
    type Item = Result<usize, region::Error>;

    /// Returns the closest free page for the current address.
    fn next(&mut self) -> Option<Self::Item> {
        let page_size = region::page::size();

        while self.current > 0 && self.range.contains(&self.current) {
            match region::query(self.current as *const u8) {
                Ok(region) => {
                    self.current = match self.search {
                        SearchDirection::Before => {
                            region.as_range().start.saturating_sub(page_size)
                        }
                        SearchDirection::After => region.as_range().end,
                    }
                }
                Err(error) => {
                    // Check whether the region is free, otherwise return the error
                    let result = Some(match error {
                        region::Error::UnmappedRegion => Ok(self.current),
                        inner => Err(inner),
                    });

                    // Adjust the offset for repeated calls.
                    self.current = match self.search {
                        SearchDirection::Before => self.current.saturating_sub(page_size),
                        SearchDirection::After => self.current.saturating_add(page_size),
                    };

                    return result;
                }
            }
        }

        None
    }
}
