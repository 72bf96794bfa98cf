//! # Context
//!
//! Owns everything hooks and trampolines share: the executable buffers, the memory accessor,
//! the settings and the registry of installed jumps.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::alloc::{self, BufferAllocator};
use crate::code::{Architecture, Native, NativeConvention};
use crate::error::Result;
use crate::hook::HookBuilder;
use crate::patcher::mem::{MemoryAccess, ProcessMemory};
use crate::patcher::JumpRecord;
use crate::wrapper::convention::Signature;
use crate::wrapper::reverse::{HostCallback, ReverseWrapper};
use crate::wrapper::{Trampoline, Wrapper};

/// Tunables for a [`HookContext`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Generated code is placed at most this far from the code it calls or relocates
    pub max_distance: usize,
    /// Bytes read from a target when computing the hook length
    pub lookahead: usize,
    /// Smallest executable buffer to map
    pub region_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_distance: Native::MAX_DISPLACEMENT,
            lookahead: 64,
            region_size: alloc::page_size(),
        }
    }
}

/// Shared state for building trampolines and hooks in the current process
///
/// Everything created through a context lives in buffers the context owns. Generated code is
/// never freed individually; dropping the context unmaps all of it, so the context has to
/// outlive every hook and trampoline in use.
pub struct HookContext<M: MemoryAccess = ProcessMemory> {
    /// Executable buffers for generated code
    allocator: BufferAllocator,
    /// Accessor used to read and patch targets
    memory: M,
    /// Tunables
    settings: Settings,
    /// Serializes reverse wrapper creation from start to finish
    reverse_lock: Mutex<()>,
    /// Continuation jumps of every activated hook
    jumps: Mutex<Vec<JumpRecord>>,
}

impl HookContext<ProcessMemory> {
    /// Creates a context for the current process with default settings.
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    /// Creates a context for the current process.
    pub fn with_settings(settings: Settings) -> Self {
        Self::with_memory(ProcessMemory, settings)
    }
}

impl Default for HookContext<ProcessMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MemoryAccess> HookContext<M> {
    /// Creates a context that reads and patches through `memory`.
    pub fn with_memory(memory: M, settings: Settings) -> Self {
        Self {
            allocator: BufferAllocator::new(settings.region_size),
            memory,
            settings,
            reverse_lock: Mutex::new(()),
            jumps: Mutex::new(Vec::new()),
        }
    }

    /// Tunables of this context
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Allocator holding all generated code
    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    /// Memory accessor
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Makes `function`, written for `convention`, callable as an `extern "C"` function.
    pub fn create_wrapper(
        &self,
        function: usize,
        convention: &NativeConvention,
        signature: Option<&Signature>,
    ) -> Result<Trampoline> {
        self.create_trampoline(function, convention, &Native::default_convention(), signature)
    }

    /// Makes `function`, written for `from`, callable under `to`.
    pub fn create_trampoline(
        &self,
        function: usize,
        from: &NativeConvention,
        to: &NativeConvention,
        signature: Option<&Signature>,
    ) -> Result<Trampoline> {
        Wrapper::<Native>::create(
            &self.allocator,
            self.settings.max_distance,
            function,
            from,
            to,
            signature,
        )
    }

    /// Makes `callback` callable as a native function of `convention`.
    ///
    /// Closure state is owned by the returned wrapper; see [`ReverseWrapper`].
    pub fn create_reverse_wrapper(
        &self,
        callback: HostCallback,
        convention: &NativeConvention,
        signature: Option<&Signature>,
    ) -> Result<ReverseWrapper> {
        let _guard = self.reverse_lock.lock().unwrap_or_else(PoisonError::into_inner);
        ReverseWrapper::create(
            &self.allocator,
            self.settings.max_distance,
            callback,
            convention,
            signature,
        )
    }

    /// Starts building a hook redirecting `target` to `replacement`.
    pub fn hook(&self, target: usize, replacement: HostCallback) -> HookBuilder<'_, M> {
        HookBuilder::new(self, target, replacement)
    }

    /// Locks the registry of installed jumps
    pub(crate) fn jumps(&self) -> MutexGuard<'_, Vec<JumpRecord>> {
        self.jumps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}


#[cfg(all(test, target_arch = "x86"))]
mod x86_tests {
    use std::mem;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::wrapper::convention::x86::{Register, X86Convention};
    use crate::wrapper::convention::StackCleanup;

    /// Function pointer for an 8-parameter `cdecl` function
    type CdeclFn = extern "C" fn(u32, u32, u32, u32, u32, u32, u32, u32) -> u32;
    /// Function pointer for an 8-parameter `stdcall` function
    type StdcallFn = extern "stdcall" fn(u32, u32, u32, u32, u32, u32, u32, u32) -> u32;
    /// Function pointer for an 8-parameter `fastcall` function
    type FastcallFn = extern "fastcall" fn(u32, u32, u32, u32, u32, u32, u32, u32) -> u32;

    /// Calls `address` under `convention`, which has to be one of the presets
    fn call(address: usize, convention: &X86Convention, args: [u32; 8]) -> u32 {
        if *convention == X86Convention::cdecl() {
            let f: CdeclFn = unsafe { mem::transmute(address) };
            f(args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7])
        } else if *convention == X86Convention::stdcall() {
            let f: StdcallFn = unsafe { mem::transmute(address) };
            f(args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7])
        } else {
            let f: FastcallFn = unsafe { mem::transmute(address) };
            f(args[0], args[1], args[2], args[3], args[4], args[5], args[6], args[7])
        }
    }

    #[test]
    /// Wrapping A to B and back to A forwards every parameter unchanged
    fn test_roundtrip_transparency() {
        let context = HookContext::new();
        let custom = X86Convention::new(
            vec![Register::Eax, Register::Edx, Register::Ecx],
            Register::Edx,
            vec![Register::Ebx, Register::Esi, Register::Edi, Register::Ebp],
            StackCleanup::Callee,
            8,
        )
        .unwrap();
        let callable = [X86Convention::cdecl(), X86Convention::stdcall(), X86Convention::fastcall()];
        let all = [
            X86Convention::cdecl(),
            X86Convention::stdcall(),
            X86Convention::fastcall(),
            X86Convention::thiscall(),
            custom,
        ];
        let args = [11, 22, 33, 44, 55, 66, 77, 88];

        for count in 0..=8 {
            let signature = Signature::integers(count);
            // the pointer types pass eight parameters, which a callee-cleanup function only
            // pops when it expects all of them
            let callers = if count == 8 { &callable[..] } else { &callable[..1] };
            for a in callers {
                for b in &all {
                    let seen = Arc::new(Mutex::new(Vec::new()));
                    let recorder = seen.clone();
                    let callback = HostCallback::closure(count, move |args| {
                        *recorder.lock().unwrap() = args.to_vec();
                        0xfeed_0000 + args.len()
                    });

                    // the wrapper's state has to outlive every call below
                    let function = context.create_reverse_wrapper(callback, a, None).unwrap();
                    let there = context.create_trampoline(function.address(), a, b, Some(&signature)).unwrap();
                    let back = context.create_trampoline(there.address(), b, a, Some(&signature)).unwrap();

                    let result = call(back.address(), a, args);
                    assert_eq!(result, 0xfeed_0000 + count as u32, "{count} parameters via {b:?}");
                    let expected: Vec<usize> = args[..count].iter().map(|v| *v as usize).collect();
                    assert_eq!(*seen.lock().unwrap(), expected, "{count} parameters via {b:?}");
                }
            }
        }
    }
}
