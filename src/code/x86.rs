//! 32-bit x86 code generation

use std::mem;

use super::Architecture;
use crate::error::Result;
use crate::wrapper::convention::x86::X86Convention;
use crate::wrapper::convention::Signature;
use crate::wrapper::x86 as generator;

/// 32-bit x86
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct X86;

#[repr(C, packed)]
#[allow(dead_code)]
/// Struct helper for generating an absolute jump (`push imm32; ret`)
struct JmpAbs {
    /// `push imm32`
    push: u8,
    /// Absolute address to jump to
    target: u32,
    /// `ret`
    ret: u8,
}

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: usize) -> [u8; mem::size_of::<JmpAbs>()] {
    unsafe {
        // SAFETY: `JmpAbs` is packed plain data of exactly this size
        mem::transmute(JmpAbs {
            push: 0x68,
            target: (target as u32).to_le(),
            ret: 0xc3,
        })
    }
}

impl Architecture for X86 {
    const BITNESS: u32 = 32;
    const JUMP_LENGTH: usize = mem::size_of::<JmpAbs>();
    // rel32 wraps around the whole 32-bit address space
    const MAX_DISPLACEMENT: usize = u32::MAX as usize;

    type Convention = X86Convention;

    fn default_convention() -> X86Convention {
        X86Convention::default()
    }

    fn validate(convention: &X86Convention) -> Result<()> {
        convention.validate()
    }

    fn absolute_jump(target: usize) -> Vec<u8> {
        jmp_abs(target).into()
    }

    fn generate_wrapper(
        function: usize,
        from: &X86Convention,
        to: &X86Convention,
        signature: &Signature,
        address: u64,
    ) -> Result<Vec<u8>> {
        generator::generate_wrapper(function, from, to, signature, address)
    }

    fn generate_thunk(dispatcher: usize, state: usize, parameters: usize, address: u64) -> Result<Vec<u8>> {
        generator::generate_thunk(dispatcher, state, parameters, address)
    }
}
