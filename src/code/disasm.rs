//! Instruction boundaries
//!
//! Thin layer over [`iced_x86::Decoder`] that reports failures as crate errors.

use iced_x86::{Decoder, DecoderError, DecoderOptions, Instruction};

use super::Architecture;
use crate::error::{Error, Result};

/// Decodes every instruction in `bytes`, which were loaded at `ip`.
///
/// Fails if an instruction is invalid or runs past the end of `bytes`.
pub fn decode<A: Architecture>(bytes: &[u8], ip: u64) -> Result<Vec<Instruction>> {
    let mut decoder = Decoder::with_ip(A::BITNESS, bytes, ip, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut instruction = Instruction::default();

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            let address = instruction.ip() as usize;
            return Err(match decoder.last_error() {
                DecoderError::NoMoreBytes => Error::Relocation {
                    address,
                    reason: "the last instruction extends past the end of the region".into(),
                },
                _ => Error::InvalidInstruction(address),
            });
        }
        instructions.push(instruction);
    }

    Ok(instructions)
}

/// Returns the smallest whole-instruction length of `bytes` that is at least `required`.
///
/// `bytes` is a lookahead window read from `ip`. If the window runs out before enough
/// whole instructions are found, the caller has to supply the length explicitly.
pub fn hook_length<A: Architecture>(bytes: &[u8], ip: u64, required: usize) -> Result<usize> {
    let mut decoder = Decoder::with_ip(A::BITNESS, bytes, ip, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    let mut length = 0;

    while length < required {
        if !decoder.can_decode() {
            break;
        }
        decoder.decode_out(&mut instruction);
        if instruction.is_invalid() {
            if decoder.last_error() == DecoderError::NoMoreBytes {
                break;
            }
            return Err(Error::InvalidInstruction(instruction.ip() as usize));
        }
        length += instruction.len();
    }

    if length < required {
        return Err(Error::HookLength {
            address: ip as usize,
            required,
            found: length,
            lookahead: bytes.len(),
        });
    }

    tracing::trace!(address = ip, required, length, "computed hook length");
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{X64, X86};

    /// `mov rax, rcx; add rax, rdx; nop; mov rax, 0x1122334455667788; ret`
    const PROLOGUE: [u8; 18] = [
        0x48, 0x89, 0xc8, 0x48, 0x01, 0xd0, 0x90, 0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33,
        0x22, 0x11, 0xc3,
    ];

    /// Instruction boundaries of [`PROLOGUE`]
    const BOUNDARIES: [usize; 6] = [0, 3, 6, 7, 17, 18];

    #[test]
    /// The returned length always lands on an instruction boundary
    fn test_hook_length_never_splits() {
        for required in 1..=18 {
            let length = hook_length::<X64>(&PROLOGUE, 0x1000, required).unwrap();
            assert!(length >= required);
            assert!(BOUNDARIES.contains(&length), "{length} splits an instruction");
            let previous = BOUNDARIES.iter().rev().find(|b| **b < length).unwrap();
            assert!(*previous < required, "{length} is not the smallest boundary");
        }
    }

    #[test]
    /// A window ending mid-instruction reports how far decoding got
    fn test_hook_length_exhausted() {
        match hook_length::<X64>(&PROLOGUE[..12], 0x1000, 14) {
            Err(Error::HookLength {
                required,
                found,
                lookahead,
                ..
            }) => {
                assert_eq!(required, 14);
                assert_eq!(found, 7);
                assert_eq!(lookahead, 12);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    /// Decoding reports truncated and invalid instructions
    fn test_decode_errors() {
        assert_eq!(decode::<X64>(&PROLOGUE, 0).unwrap().len(), 5);
        assert!(matches!(
            decode::<X64>(&PROLOGUE[..5], 0),
            Err(Error::Relocation { address: 3, .. })
        ));
        // `aaa` doesn't exist in 64-bit mode
        assert!(matches!(
            decode::<X64>(&[0x90, 0x37], 0),
            Err(Error::InvalidInstruction(1))
        ));
        assert_eq!(decode::<X86>(&[0x90, 0x37], 0).unwrap().len(), 2);
    }
}
