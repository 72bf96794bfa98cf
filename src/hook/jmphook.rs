//! # Jump Hook
//!
//! This hook type uses an absolute jump to redirect execution. Everything here is computed
//! without modifying the target: the result is a [`HookRecord`] describing what activation
//! has to write.

use std::marker::PhantomData;

use crate::alloc::{window_around, BufferAllocator};
use crate::code::{disasm, pad_with_nops, Architecture};
use crate::context::Settings;
use crate::error::{Error, Result};
use crate::patcher::mem::MemoryAccess;
use crate::patcher::{ChainedPatch, FunctionPatcher, JumpRecord, PatchEntry};

use super::HookRecord;

/// Plans jump hooks for the architecture `A`
pub struct JmpHook<'a, A: Architecture, M: MemoryAccess> {
    /// Where relocated code is placed
    allocator: &'a BufferAllocator,
    /// Accessor used to read the target
    memory: &'a M,
    /// Tunables
    settings: &'a Settings,
    /// Continuation jumps of hooks already installed
    existing: &'a [JumpRecord],
    /// Placeholder for architecture
    _arch: PhantomData<A>,
}

impl<'a, A: Architecture, M: MemoryAccess> JmpHook<'a, A, M> {
    /// Creates a planner
    pub fn new(
        allocator: &'a BufferAllocator,
        memory: &'a M,
        settings: &'a Settings,
        existing: &'a [JumpRecord],
    ) -> Self {
        Self {
            allocator,
            memory,
            settings,
            existing,
            _arch: PhantomData,
        }
    }

    /// Number of bytes to overwrite at `target`.
    ///
    /// # Safety
    ///
    /// `target` must point to code
    pub unsafe fn hook_length(&self, target: usize, explicit: Option<usize>) -> Result<usize> {
        match explicit {
            Some(length) if length < A::JUMP_LENGTH => Err(Error::HookTooShort {
                length,
                required: A::JUMP_LENGTH,
            }),
            // whether it ends on an instruction boundary is checked when the bytes are relocated
            Some(length) => Ok(length),
            None => {
                let lookahead = self.memory.read_available(target, self.settings.lookahead)?;
                disasm::hook_length::<A>(&lookahead, target as u64, A::JUMP_LENGTH)
            }
        }
    }

    /// Plans a hook redirecting `target` to `destination`.
    ///
    /// The original bytes are relocated into a buffer near `target`, followed by a jump back
    /// to the first byte past the overwritten range.
    ///
    /// # Safety
    ///
    /// `target` must point to code at least as long as the hook length
    pub unsafe fn prepare(&self, target: usize, destination: usize, explicit: Option<usize>) -> Result<HookRecord> {
        let hook_length = self.hook_length(target, explicit)?;
        let jump = pad_with_nops(A::absolute_jump(destination), hook_length);
        let original_bytes = self.memory.read(target, hook_length)?;

        let resume = target + hook_length;
        let window = window_around(target, self.settings.max_distance);
        let patcher = FunctionPatcher::<A>::new(self.existing);

        let (original, (continuation, chained)) = self.allocator.emit(
            Some(&window),
            2 * hook_length + A::JUMP_LENGTH,
            |ip| -> Result<(Vec<u8>, (usize, Vec<ChainedPatch>))> {
                let patched = patcher.patch(&original_bytes, target, ip)?;
                let mut code = patched.bytes;
                let continuation = ip as usize + code.len();
                code.extend(A::absolute_jump(resume));
                Ok((code, (continuation, patched.chained)))
            },
        )?;

        tracing::trace!(
            target,
            hook_length,
            original,
            continuation,
            chained = chained.len(),
            "relocated prologue"
        );

        Ok(HookRecord {
            target,
            hook_length,
            jump_patch: PatchEntry {
                address: target,
                bytes: jump,
            },
            original,
            continuation: JumpRecord {
                address: continuation,
                target: resume,
            },
            chained,
        })
    }
}
