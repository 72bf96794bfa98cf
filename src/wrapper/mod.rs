//! # Wrapper
//!
//! Generates trampolines that let callers using one calling convention call a function
//! written for another.

use std::marker::PhantomData;
use std::mem;

use crate::alloc::{window_around, BufferAllocator};
use crate::code::Architecture;
use crate::error::{Error, Result};

use self::convention::Signature;

pub mod convention;
pub mod reverse;
pub mod x64;
pub mod x86;

/// Rough size of a trampoline, used to pick a buffer before the code is assembled
fn estimate(parameters: usize) -> usize {
    192 + 16 * parameters
}

/// Executable entry point created by a [`Wrapper`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Trampoline {
    /// Address of the generated code
    address: usize,
    /// Function the code forwards to
    target: usize,
}

impl Trampoline {
    /// Address to call
    pub fn address(&self) -> usize {
        self.address
    }

    /// Function the trampoline forwards to
    pub fn target(&self) -> usize {
        self.target
    }

    /// Returns true if no code was generated and [`Trampoline::address`] is the target itself
    pub fn is_identity(&self) -> bool {
        self.address == self.target
    }

    /// Reinterprets the trampoline as a function pointer.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the trampoline's convention and signature
    pub unsafe fn as_fn<F: Copy>(&self) -> F {
        debug_assert_eq!(mem::size_of::<F>(), mem::size_of::<usize>());
        mem::transmute_copy(&self.address)
    }
}

/// Marshalling code generator for the architecture `A`
pub struct Wrapper<A: Architecture> {
    /// Placeholder for architecture
    _arch: PhantomData<A>,
}

impl<A: Architecture> Wrapper<A> {
    /// Creates a trampoline callable under `to` that forwards to `function`, written for `from`.
    ///
    /// Identical conventions need no code: `function` itself is returned and `signature` is
    /// never looked at. Otherwise `signature` is required, may only contain integer
    /// parameters, and the trampoline is placed within `max_distance` of `function`.
    pub fn create(
        allocator: &BufferAllocator,
        max_distance: usize,
        function: usize,
        from: &A::Convention,
        to: &A::Convention,
        signature: Option<&Signature>,
    ) -> Result<Trampoline> {
        if from == to {
            return Ok(Trampoline {
                address: function,
                target: function,
            });
        }

        let signature = signature.ok_or(Error::MissingSignature)?;
        signature.check_marshallable()?;
        A::validate(from)?;
        A::validate(to)?;

        let window = window_around(function, max_distance);
        let (address, ()) = allocator.emit(Some(&window), estimate(signature.len()), |ip| {
            Ok((A::generate_wrapper(function, from, to, signature, ip)?, ()))
        })?;

        tracing::debug!(
            address,
            function,
            parameters = signature.len(),
            ?from,
            ?to,
            "generated marshalling trampoline"
        );

        Ok(Trampoline {
            address,
            target: function,
        })
    }
}
