//! # Code
//!
//! Architecture-specific code generation: jump sequences, padding and instruction decoding

use std::fmt::Debug;
use std::hash::Hash;

use crate::error::Result;
use crate::wrapper::convention::Signature;

pub mod disasm;
pub mod x64;
pub mod x86;

pub use self::x64::X64;
pub use self::x86::X86;

/// Single-byte `nop`
pub const NOP: u8 = 0x90;

/// An instruction set that code can be generated for
///
/// The implementations are zero-sized markers; everything is an associated item so that
/// generic code like [`crate::patcher::FunctionPatcher`] can be monomorphized per architecture.
pub trait Architecture: Sized + 'static {
    /// Decoder and encoder bitness
    const BITNESS: u32;
    /// Length in bytes of [`Architecture::absolute_jump`]
    const JUMP_LENGTH: usize;
    /// Largest distance a relative branch or displacement can reach
    const MAX_DISPLACEMENT: usize;

    /// Calling convention descriptor for this architecture
    type Convention: Clone + Debug + PartialEq + Eq + Hash + Send + Sync + 'static;

    /// Convention used by `extern "C"` functions on this platform
    fn default_convention() -> Self::Convention;

    /// Checks that a descriptor can be marshalled
    fn validate(convention: &Self::Convention) -> Result<()>;

    /// Encodes a jump to `target` that works from any address.
    ///
    /// The sequence is always [`Architecture::JUMP_LENGTH`] bytes long and decodes as ordinary
    /// instructions, so it can itself be relocated by a later hook on the same address.
    fn absolute_jump(target: usize) -> Vec<u8>;

    /// Generates a trampoline callable under `to` that forwards to `function`, written for `from`.
    ///
    /// `address` is where the code will be placed.
    fn generate_wrapper(
        function: usize,
        from: &Self::Convention,
        to: &Self::Convention,
        signature: &Signature,
        address: u64,
    ) -> Result<Vec<u8>>;

    /// Generates a thunk in the default convention that forwards its `parameters` arguments
    /// to `dispatcher(state, arguments)`.
    ///
    /// `address` is where the code will be placed.
    fn generate_thunk(dispatcher: usize, state: usize, parameters: usize, address: u64) -> Result<Vec<u8>>;
}

#[cfg(target_arch = "x86_64")]
/// Architecture of the running process
pub type Native = X64;
#[cfg(target_arch = "x86")]
/// Architecture of the running process
pub type Native = X86;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("only x86 and x86-64 targets are supported");

/// Convention descriptor for the running process
pub type NativeConvention = <Native as Architecture>::Convention;

/// Pads `code` with single-byte `nop`s up to `length` bytes.
///
/// Code already at least `length` bytes long is returned unchanged.
pub fn pad_with_nops(mut code: Vec<u8>, length: usize) -> Vec<u8> {
    if code.len() < length {
        code.resize(length, NOP);
    }
    code
}
