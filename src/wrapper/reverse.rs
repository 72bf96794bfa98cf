//! # Reverse wrapper
//!
//! Exposes host code as a native function of a chosen calling convention.
//!
//! A [`HostCallback`] is either a raw function address with a known convention, or a Rust
//! closure. Closures get a small thunk in the default convention which collects the
//! arguments into an array and calls [`dispatch`].

use std::fmt;
use std::slice;
use std::sync::Arc;

use crate::alloc::{window_around, BufferAllocator};
use crate::code::{Architecture, Native, NativeConvention};
use crate::error::Result;
use crate::wrapper::convention::Signature;
use crate::wrapper::{Trampoline, Wrapper};

/// Closure type accepted by [`HostCallback::closure`]
pub type Callback = dyn Fn(&[usize]) -> usize + Send + Sync;

/// Host code that native code should be able to call
#[derive(Clone)]
pub enum HostCallback {
    /// An existing native function
    Native {
        /// Entry point
        address: usize,
        /// Convention the function was written for
        convention: NativeConvention,
    },
    /// A closure over pointer-sized arguments
    Closure {
        /// Number of arguments the closure receives
        parameters: usize,
        /// The closure itself
        callback: Arc<Callback>,
    },
}

impl HostCallback {
    /// Wraps an `extern "C"` function.
    pub fn function(address: usize) -> Self {
        Self::with_convention(address, Native::default_convention())
    }

    /// Wraps a function written for `convention`.
    pub fn with_convention(address: usize, convention: NativeConvention) -> Self {
        Self::Native {
            address,
            convention,
        }
    }

    /// Wraps a closure that receives `parameters` pointer-sized arguments.
    pub fn closure<F>(parameters: usize, callback: F) -> Self
    where
        F: Fn(&[usize]) -> usize + Send + Sync + 'static,
    {
        Self::Closure {
            parameters,
            callback: Arc::new(callback),
        }
    }

    /// Signature implied by the callback, if it has one
    pub fn signature(&self) -> Option<Signature> {
        match self {
            Self::Native { .. } => None,
            Self::Closure { parameters, .. } => Some(Signature::integers(*parameters)),
        }
    }
}

impl fmt::Debug for HostCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native {
                address,
                convention,
            } => f
                .debug_struct("Native")
                .field("address", &format_args!("{address:#x}"))
                .field("convention", convention)
                .finish(),
            Self::Closure { parameters, .. } => f
                .debug_struct("Closure")
                .field("parameters", parameters)
                .finish_non_exhaustive(),
        }
    }
}

/// State a closure thunk passes to [`dispatch`]
pub struct ClosureState {
    /// Number of arguments in the array
    parameters: usize,
    /// Closure to call
    callback: Arc<Callback>,
}

/// Entry point of every closure thunk
///
/// # Safety
///
/// `state` must point to a live [`ClosureState`] and `args` to at least as many values as it expects
unsafe extern "C" fn dispatch(state: *const ClosureState, args: *const usize) -> usize {
    let state = &*state;
    let args = slice::from_raw_parts(args, state.parameters);
    (state.callback)(args)
}

/// Native entry point for a [`HostCallback`]
///
/// For closures, the wrapper owns the state its thunk refers to: the entry point must not be
/// called after the wrapper is dropped. Use [`ReverseWrapper::leak`] when the entry point has to
/// stay valid for the rest of the process.
pub struct ReverseWrapper {
    /// Callable entry point in the requested convention
    trampoline: Trampoline,
    /// Callback entry in its own convention (the closure thunk for closures)
    entry: usize,
    /// Closure state referenced by the thunk
    state: Option<Box<ClosureState>>,
}

impl ReverseWrapper {
    /// Creates a native entry point for `callback`, callable under `convention`.
    ///
    /// `signature` is only needed when the callback's own convention differs from `convention`;
    /// closures default to their argument count.
    pub fn create(
        allocator: &BufferAllocator,
        max_distance: usize,
        callback: HostCallback,
        convention: &NativeConvention,
        signature: Option<&Signature>,
    ) -> Result<Self> {
        let implied = callback.signature();
        let signature = signature.or(implied.as_ref());

        let (entry, own_convention, state) = match callback {
            HostCallback::Native {
                address,
                convention,
            } => (address, convention, None),
            HostCallback::Closure {
                parameters,
                callback,
            } => {
                let state = Box::new(ClosureState {
                    parameters,
                    callback,
                });
                let state_address = &*state as *const ClosureState as usize;
                let dispatcher = dispatch as usize;
                let window = window_around(dispatcher, max_distance);
                let (thunk, ()) = allocator.emit(Some(&window), 128 + 16 * parameters, |ip| {
                    Ok((Native::generate_thunk(dispatcher, state_address, parameters, ip)?, ()))
                })?;

                tracing::debug!(thunk, parameters, "generated closure thunk");
                (thunk, Native::default_convention(), Some(state))
            }
        };

        let trampoline = Wrapper::<Native>::create(
            allocator,
            max_distance,
            entry,
            &own_convention,
            convention,
            signature,
        )?;

        Ok(Self {
            trampoline,
            entry,
            state,
        })
    }

    /// Address native code should call
    pub fn address(&self) -> usize {
        self.trampoline.address()
    }

    /// The callback's own entry point, before any convention conversion
    pub fn entry(&self) -> usize {
        self.entry
    }

    /// Trampoline in the requested convention
    pub fn trampoline(&self) -> Trampoline {
        self.trampoline
    }

    /// Keeps the closure state alive for the rest of the process and returns the entry point.
    pub fn leak(self) -> Trampoline {
        if let Some(state) = self.state {
            Box::leak(state);
        }
        self.trampoline
    }
}

impl fmt::Debug for ReverseWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseWrapper")
            .field("trampoline", &self.trampoline)
            .field("entry", &format_args!("{:#x}", self.entry))
            .field("closure", &self.state.is_some())
            .finish()
    }
}
