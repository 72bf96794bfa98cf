//! x86-64 code generation

use std::mem;

use super::Architecture;
use crate::error::Result;
use crate::wrapper::convention::x64::X64Convention;
use crate::wrapper::convention::Signature;
use crate::wrapper::x64 as generator;

/// 64-bit x86
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct X64;

#[repr(C, packed)]
#[allow(dead_code)]
/// Struct helper for generating an absolute jump
///
/// `push imm32` sign-extends, so the high half is written over separately before returning
/// into the target. No register is clobbered.
struct JmpAbs {
    /// `push imm32`
    push: u8,
    /// Low half of the target
    low: u32,
    /// `mov dword ptr [rsp + 4], imm32`
    mov: [u8; 4],
    /// High half of the target
    high: u32,
    /// `ret`
    ret: u8,
}

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: usize) -> [u8; mem::size_of::<JmpAbs>()] {
    let target = target as u64;
    unsafe {
        // SAFETY: `JmpAbs` is packed plain data of exactly this size
        mem::transmute(JmpAbs {
            push: 0x68,
            low: (target as u32).to_le(),
            mov: [0xc7, 0x44, 0x24, 0x04],
            high: ((target >> 32) as u32).to_le(),
            ret: 0xc3,
        })
    }
}

impl Architecture for X64 {
    const BITNESS: u32 = 64;
    const JUMP_LENGTH: usize = mem::size_of::<JmpAbs>();
    // rel32 reach, minus room for the instruction and the buffer itself
    const MAX_DISPLACEMENT: usize = 0x7fff_0000;

    type Convention = X64Convention;

    fn default_convention() -> X64Convention {
        X64Convention::default()
    }

    fn validate(convention: &X64Convention) -> Result<()> {
        convention.validate()
    }

    fn absolute_jump(target: usize) -> Vec<u8> {
        jmp_abs(target).into()
    }

    fn generate_wrapper(
        function: usize,
        from: &X64Convention,
        to: &X64Convention,
        signature: &Signature,
        address: u64,
    ) -> Result<Vec<u8>> {
        generator::generate_wrapper(function, from, to, signature, address)
    }

    fn generate_thunk(dispatcher: usize, state: usize, parameters: usize, address: u64) -> Result<Vec<u8>> {
        generator::generate_thunk(dispatcher, state, parameters, address)
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::{Code, Decoder, DecoderOptions};

    use super::*;

    #[test]
    /// The jump decodes as three ordinary instructions carrying both halves of the target
    fn test_jmp_abs_decodes() {
        let bytes = jmp_abs(0x1234_5678_9abc_def0);
        assert_eq!(bytes.len(), X64::JUMP_LENGTH);
        assert_eq!(X64::JUMP_LENGTH, 14);

        let instructions: Vec<_> = Decoder::new(64, &bytes, DecoderOptions::NONE)
            .into_iter()
            .collect();
        let codes: Vec<_> = instructions.iter().map(|i| i.code()).collect();
        assert_eq!(
            codes,
            [Code::Pushq_imm32, Code::Mov_rm32_imm32, Code::Retnq]
        );
        assert_eq!(instructions[0].immediate32(), 0x9abc_def0);
        assert_eq!(instructions[1].immediate32(), 0x1234_5678);
    }
}
