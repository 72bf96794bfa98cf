//! # Error
//!
//! Errors surfaced by wrapper generation, hook construction and hook activation

use iced_x86::IcedError;
use thiserror::Error;

use crate::alloc::ProximityError;
use crate::patcher::mem::MemoryError;

/// Result type used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while generating code or installing hooks
#[derive(Debug, Error)]
pub enum Error {
    /// A calling convention descriptor is malformed
    #[error("invalid calling convention: {0}")]
    Configuration(String),
    /// A calling convention name did not match any preset
    #[error("unknown calling convention `{0}`")]
    UnknownConvention(String),
    /// Two different conventions were requested without a signature describing the parameters
    #[error("a signature is required to marshal between different calling conventions")]
    MissingSignature,
    /// Floating-point parameters cannot be moved between conventions
    #[error("{0} floating-point parameter(s) cannot be marshalled between calling conventions")]
    UnsupportedParameters(usize),
    /// The lookahead window ended before enough whole instructions were found
    #[error("found only {found} of {required} bytes of whole instructions within {lookahead} bytes at {address:#x}")]
    HookLength {
        /// Address being hooked
        address: usize,
        /// Minimum number of bytes needed for the jump
        required: usize,
        /// Bytes of whole instructions found before decoding stopped
        found: usize,
        /// Size of the lookahead window
        lookahead: usize,
    },
    /// An explicit hook length cannot hold the jump sequence
    #[error("hook length {length} is shorter than the {required}-byte jump")]
    HookTooShort {
        /// Length supplied by the caller
        length: usize,
        /// Length of the jump sequence
        required: usize,
    },
    /// The decoder could not make sense of the bytes at an address
    #[error("invalid instruction at {0:#x}")]
    InvalidInstruction(usize),
    /// Code could not be moved to a new address without changing its meaning
    #[error("cannot relocate code at {address:#x}: {reason}")]
    Relocation {
        /// Address of the code being relocated
        address: usize,
        /// Why relocation failed
        reason: String,
    },
    /// Executable memory could not be obtained
    #[error(transparent)]
    Allocation(#[from] ProximityError),
    /// Reading or writing process memory failed
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// The assembler or block encoder rejected the generated instructions
    #[error("code generation failed: {0}")]
    Assembler(#[from] IcedError),
}
