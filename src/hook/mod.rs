//! # Hook
//!
//! This module covers hooks, which redirect execution from one location to another
//!
//! Hooks are built in two phases. [`HookBuilder::build`] generates every piece of code the
//! hook needs without touching the target, and can fail safely. [`Hook::activate`] then writes
//! the jump over the target, which is the only change other threads can observe.
//!
//! Activated hooks are permanent: there is no way to remove them, and the replacement's
//! state is kept alive for the rest of the process.

use std::fmt;
use std::marker::PhantomData;

use crate::code::{Architecture, Native, NativeConvention};
use crate::context::HookContext;
use crate::error::Result;
use crate::patcher::mem::MemoryAccess;
use crate::patcher::{ChainedPatch, JumpRecord, PatchEntry};
use crate::wrapper::convention::Signature;
use crate::wrapper::reverse::{HostCallback, ReverseWrapper};
use crate::wrapper::Trampoline;

use self::jmphook::JmpHook;

pub mod jmphook;

/// Everything activation needs to install a hook
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HookRecord {
    /// Hooked address
    pub target: usize,
    /// Bytes of original code overwritten
    pub hook_length: usize,
    /// Jump written over the target on activation
    pub jump_patch: PatchEntry,
    /// Relocated copy of the overwritten code, followed by a jump back into the target
    pub original: usize,
    /// The jump back into the target
    pub continuation: JumpRecord,
    /// Fixups for earlier hooks that continue into the overwritten range
    pub chained: Vec<ChainedPatch>,
}

/// Configures a hook before it is built
pub struct HookBuilder<'c, M: MemoryAccess> {
    /// Context the hook is built in
    context: &'c HookContext<M>,
    /// Address to hook
    target: usize,
    /// Code to run instead of the target
    replacement: HostCallback,
    /// Convention the target was written for
    convention: NativeConvention,
    /// Parameters of the target
    signature: Option<Signature>,
    /// Explicit number of bytes to overwrite
    hook_length: Option<usize>,
}

impl<'c, M: MemoryAccess> HookBuilder<'c, M> {
    /// Starts a builder for a target using the default convention
    pub(crate) fn new(context: &'c HookContext<M>, target: usize, replacement: HostCallback) -> Self {
        Self {
            context,
            target,
            replacement,
            convention: Native::default_convention(),
            signature: None,
            hook_length: None,
        }
    }

    /// Sets the convention the target was written for.
    pub fn convention(mut self, convention: NativeConvention) -> Self {
        self.convention = convention;
        self
    }

    /// Sets the target's parameters.
    ///
    /// Needed when the target doesn't use the default convention, unless the replacement is a
    /// closure, whose argument count is used instead.
    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Overwrites exactly `length` bytes instead of computing the length from the code.
    ///
    /// The length has to end on an instruction boundary.
    pub fn hook_length(mut self, length: usize) -> Self {
        self.hook_length = Some(length);
        self
    }

    /// Generates the hook's code without modifying the target.
    ///
    /// # Safety
    ///
    /// `target` must point to a function written for the configured convention, at least as
    /// long as the hook length, and the replacement must match its signature.
    pub unsafe fn build(self) -> Result<Hook<'c, M>> {
        let context = self.context;
        let signature = self.signature.or_else(|| self.replacement.signature());

        let replacement = context.create_reverse_wrapper(self.replacement, &self.convention, signature.as_ref())?;

        // Registry snapshot: hooks activated after this point aren't chained
        let existing = context.jumps().clone();
        let planner = JmpHook::<Native, M>::new(context.allocator(), context.memory(), context.settings(), &existing);
        let record = planner.prepare(self.target, replacement.address(), self.hook_length)?;

        let original_for_host = context.create_wrapper(record.original, &self.convention, signature.as_ref())?;

        tracing::debug!(
            target = record.target,
            hook_length = record.hook_length,
            original = record.original,
            replacement = replacement.address(),
            chained = record.chained.len(),
            "constructed hook"
        );

        Ok(Hook {
            context,
            record,
            replacement,
            original_for_host,
        })
    }
}

/// A hook whose code is generated but not yet installed
pub struct Hook<'c, M: MemoryAccess> {
    /// Context the hook was built in
    context: &'c HookContext<M>,
    /// What activation writes
    record: HookRecord,
    /// Entry point of the replacement, in the target's convention
    replacement: ReverseWrapper,
    /// Relocated original, callable as an `extern "C"` function
    original_for_host: Trampoline,
}

impl<'c, M: MemoryAccess> Hook<'c, M> {
    /// Relocated original code, in the target's own convention
    pub fn original(&self) -> usize {
        self.record.original
    }

    /// Relocated original code, callable as an `extern "C"` function
    pub fn original_for_host(&self) -> Trampoline {
        self.original_for_host
    }

    /// What activation will write
    pub fn record(&self) -> &HookRecord {
        &self.record
    }

    /// Installs the hook.
    ///
    /// Earlier hooks continuing into the overwritten bytes are redirected into the relocated
    /// copy first. The jump over the target is written last, so a failed write leaves the
    /// target as it was.
    ///
    /// # Safety
    ///
    /// No thread may be executing the first [`HookRecord::hook_length`] bytes of the target
    /// while they are overwritten. Threads calling the target around activation may run
    /// either the original or the replacement.
    pub unsafe fn activate(self) -> Result<ActiveHook<'c>> {
        let Hook {
            context,
            record,
            replacement,
            original_for_host,
        } = self;
        // Nothing written below may outlive the replacement, even on failure
        let replacement = replacement.leak();

        let memory = context.memory();
        let mut jumps = context.jumps();

        for chained in &record.chained {
            memory.write(chained.entry.address, &chained.entry.bytes)?;
            if let Some(jump) = jumps.iter_mut().find(|j| j.address == chained.entry.address) {
                jump.target = chained.new_target;
            }
            tracing::debug!(
                jump = chained.entry.address,
                old_target = chained.old_target,
                new_target = chained.new_target,
                "applied chained patch"
            );
        }

        memory.write(record.jump_patch.address, &record.jump_patch.bytes)?;
        jumps.push(record.continuation);

        tracing::debug!(
            target = record.target,
            hook_length = record.hook_length,
            "activated hook"
        );

        Ok(ActiveHook {
            target: record.target,
            hook_length: record.hook_length,
            original: record.original,
            original_for_host,
            replacement,
            _context: PhantomData,
        })
    }
}

impl<M: MemoryAccess> fmt::Debug for Hook<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("record", &self.record)
            .field("replacement", &self.replacement)
            .field("original_for_host", &self.original_for_host)
            .finish()
    }
}

/// An installed hook
///
/// The hook borrows the context it was built in, which owns the code the target now jumps to:
///
/// ```compile_fail
/// use abihook::{HookContext, HostCallback};
///
/// extern "C" fn target() {}
///
/// let hook = {
///     let context = HookContext::new();
///     unsafe {
///         context
///             .hook(target as usize, HostCallback::closure(0, |_| 0))
///             .build()
///             .unwrap()
///             .activate()
///             .unwrap()
///     }
/// };
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveHook<'c> {
    /// Hooked address
    target: usize,
    /// Bytes overwritten at the target
    hook_length: usize,
    /// Relocated original, in the target's convention
    original: usize,
    /// Relocated original, callable as an `extern "C"` function
    original_for_host: Trampoline,
    /// Entry point the target jumps to
    replacement: Trampoline,
    /// Context owning the generated code
    _context: PhantomData<&'c ()>,
}

impl ActiveHook<'_> {
    /// Hooked address
    pub fn target(&self) -> usize {
        self.target
    }

    /// Bytes overwritten at the target
    pub fn hook_length(&self) -> usize {
        self.hook_length
    }

    /// Relocated original code, in the target's own convention
    pub fn original(&self) -> usize {
        self.original
    }

    /// Relocated original code, callable as an `extern "C"` function
    pub fn original_for_host(&self) -> Trampoline {
        self.original_for_host
    }

    /// Entry point the target now jumps to
    pub fn replacement(&self) -> Trampoline {
        self.replacement
    }

    /// Reinterprets the relocated original as a function pointer in the target's convention.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the target
    pub unsafe fn original_fn<F: Copy>(&self) -> F {
        std::mem::transmute_copy(&self.original)
    }
}
