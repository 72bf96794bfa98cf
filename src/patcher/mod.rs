//! # Patcher
//!
//! Relocates copied code to a new address, and computes the fixups other hooks need when
//! the code they continue into is moved.

use std::marker::PhantomData;

use iced_x86::{BlockEncoder, BlockEncoderOptions, InstructionBlock};

use crate::code::{disasm, Architecture};
use crate::error::{Error, Result};

pub mod mem;

/// Bytes to write at an address, in a single write
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PatchEntry {
    /// Where to write
    pub address: usize,
    /// What to write
    pub bytes: Vec<u8>,
}

/// A jump installed by an activated hook, continuing into original code
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct JumpRecord {
    /// Address of the jump sequence
    pub address: usize,
    /// Where the jump currently goes
    pub target: usize,
}

/// Redirects an existing jump into a relocated copy of its target
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChainedPatch {
    /// Jump sequence to write over the existing one
    pub entry: PatchEntry,
    /// Target before relocation
    pub old_target: usize,
    /// Target inside the relocated copy
    pub new_target: usize,
}

/// Output of [`FunctionPatcher::patch`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatchedCode {
    /// Relocated code, valid at the destination address
    pub bytes: Vec<u8>,
    /// Fixups for jumps that pointed into the original code
    pub chained: Vec<ChainedPatch>,
}

/// Moves code to a new address without changing what it does
pub struct FunctionPatcher<'a, A: Architecture> {
    /// Jumps installed by earlier hooks
    existing: &'a [JumpRecord],
    /// Placeholder for architecture
    _arch: PhantomData<A>,
}

impl<'a, A: Architecture> FunctionPatcher<'a, A> {
    /// Creates a patcher aware of the jumps already installed by other hooks.
    pub fn new(existing: &'a [JumpRecord]) -> Self {
        Self {
            existing,
            _arch: PhantomData,
        }
    }

    /// Relocates `bytes`, copied from `original`, to run at `destination`.
    ///
    /// Every self-relative branch and memory operand is re-encoded to reach the same absolute
    /// address from `destination`; short branches are widened when needed. Any existing jump
    /// whose target lies inside the copied range is redirected to the same instruction in the
    /// copy.
    pub fn patch(&self, bytes: &[u8], original: usize, destination: u64) -> Result<PatchedCode> {
        let instructions = disasm::decode::<A>(bytes, original as u64)?;
        let block = InstructionBlock::new(&instructions, destination);
        let result = BlockEncoder::encode(
            A::BITNESS,
            block,
            BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS,
        )
        .map_err(|e| Error::Relocation {
            address: original,
            reason: e.to_string(),
        })?;

        let span = original..original + bytes.len();
        let mut chained = Vec::new();
        for record in self.existing.iter().filter(|r| span.contains(&r.target)) {
            let index = instructions
                .iter()
                .position(|i| i.ip() as usize == record.target)
                .ok_or_else(|| Error::Relocation {
                    address: record.target,
                    reason: format!("the jump at {:#x} lands inside an instruction", record.address),
                })?;

            let offset = result.new_instruction_offsets[index];
            if offset == u32::MAX {
                return Err(Error::Relocation {
                    address: record.target,
                    reason: "the instruction targeted by an existing jump was rewritten".into(),
                });
            }

            let new_target = destination as usize + offset as usize;
            tracing::trace!(
                jump = record.address,
                old_target = record.target,
                new_target,
                "chained patch"
            );
            chained.push(ChainedPatch {
                entry: PatchEntry {
                    address: record.address,
                    bytes: A::absolute_jump(new_target),
                },
                old_target: record.target,
                new_target,
            });
        }

        Ok(PatchedCode {
            bytes: result.code_buffer,
            chained,
        })
    }
}
