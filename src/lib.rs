#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod context;
pub mod error;
pub mod hook;
pub mod patcher;
pub mod wrapper;

#[cfg(all(test, target_arch = "x86_64"))]
mod test_util;

pub use context::{HookContext, Settings};
pub use error::{Error, Result};
pub use hook::{ActiveHook, Hook, HookBuilder};
pub use wrapper::reverse::{HostCallback, ReverseWrapper};
pub use wrapper::convention::{ParameterKind, Signature, StackCleanup};
pub use wrapper::Trampoline;
