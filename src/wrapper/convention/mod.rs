//! # Convention
//!
//! Calling convention descriptors for both supported architectures
//!
//! A descriptor is plain data: which registers carry parameters (left to right), which
//! register holds the return value, which registers a callee has to preserve and how the
//! stack is set up and cleaned. Descriptors compare and hash structurally, so two
//! descriptors describing the same ABI are interchangeable.
//!
//! Only integer and pointer-sized parameters are marshalled between conventions. A
//! [`Signature`] containing [`ParameterKind::Float`] can still be used when both sides
//! share a convention, since no code is generated in that case.

use std::collections::HashSet;
use std::hash::Hash;

use crate::error::{Error, Result};

pub mod x64;
pub mod x86;

/// The kind of a single parameter
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParameterKind {
    /// Integer or pointer, passed in a general-purpose register or one stack slot
    Integer,
    /// Floating-point value
    Float,
}

/// Parameter list of a function, left to right
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Parameters in declaration order
    parameters: Vec<ParameterKind>,
}

impl Signature {
    /// Creates a signature from a list of parameter kinds.
    pub fn new(parameters: Vec<ParameterKind>) -> Self {
        Self { parameters }
    }

    /// Creates a signature of `count` integer parameters.
    pub fn integers(count: usize) -> Self {
        Self::new(vec![ParameterKind::Integer; count])
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    /// Returns true if the function takes no parameters
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Parameter kinds, left to right
    pub fn parameters(&self) -> &[ParameterKind] {
        &self.parameters
    }

    /// Fails if any parameter cannot be moved between conventions
    pub(crate) fn check_marshallable(&self) -> Result<()> {
        let floats = self
            .parameters
            .iter()
            .filter(|kind| **kind == ParameterKind::Float)
            .count();
        if floats > 0 {
            return Err(Error::UnsupportedParameters(floats));
        }
        Ok(())
    }
}

/// Who removes stack parameters after a call returns
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StackCleanup {
    /// Nothing is passed on the stack
    None,
    /// The caller adjusts the stack pointer after the call
    Caller,
    /// The callee pops its parameters when returning
    Callee,
}

impl StackCleanup {
    /// Cleanup as it affects generated code: with nothing on the stack, the caller has
    /// nothing to pop either
    pub(crate) fn normalized(self) -> Self {
        match self {
            Self::None => Self::Caller,
            cleanup => cleanup,
        }
    }
}

/// Checks the rules every descriptor shares, regardless of architecture.
///
/// `reserved` holds the stack and frame pointer, which can never carry a value across a call.
fn validate_registers<R>(parameters: &[R], return_register: R, callee_saved: &[R], reserved: &[R]) -> Result<()>
where
    R: Copy + Eq + Hash + std::fmt::Debug,
{
    let mut seen = HashSet::new();
    for register in parameters {
        if reserved.contains(register) {
            return Err(Error::Configuration(format!(
                "{register:?} cannot be used as a parameter register"
            )));
        }
        if !seen.insert(*register) {
            return Err(Error::Configuration(format!(
                "{register:?} is listed as a parameter register more than once"
            )));
        }
    }

    if reserved.contains(&return_register) {
        return Err(Error::Configuration(format!(
            "{return_register:?} cannot be used as the return register"
        )));
    }
    if callee_saved.contains(&return_register) {
        return Err(Error::Configuration(format!(
            "return register {return_register:?} cannot be callee-saved"
        )));
    }

    Ok(())
}
