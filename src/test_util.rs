//! Native fixtures for tests that execute generated code

use iced_x86::code_asm::{AsmRegister64, CodeAssembler};
use iced_x86::IcedError;

use crate::code::NativeConvention;
use crate::context::HookContext;
use crate::patcher::mem::MemoryAccess;

/// First two parameter registers of the default convention
pub fn arguments() -> (AsmRegister64, AsmRegister64) {
    let convention = NativeConvention::default();
    let register = |i: usize| convention.parameters()[i].gpr().unwrap();
    (register(0), register(1))
}

/// Assembles a function into the context's executable memory and returns its address
pub fn fixture<M: MemoryAccess>(
    context: &HookContext<M>,
    build: impl Fn(&mut CodeAssembler) -> Result<(), IcedError>,
) -> usize {
    let (address, ()) = context
        .allocator()
        .emit(None, 256, |ip| {
            let mut a = CodeAssembler::new(64)?;
            build(&mut a)?;
            Ok((a.assemble(ip)?, ()))
        })
        .unwrap();
    address
}
