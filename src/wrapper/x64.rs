//! x86-64 marshalling trampolines
//!
//! Frame of a trampoline, from the caller's stack downwards:
//!
//! ```text
//! [rbp + 16 + shadow + 8n]  caller's n-th stack parameter
//! [rbp + 8]                 return address
//! [rbp]                     caller's rbp
//!                           registers the caller expects preserved
//!                           spilled vector registers
//!                           alignment padding
//!                           outgoing stack parameters
//!                           outgoing shadow space
//! ```

use iced_x86::code_asm::*;

use crate::error::Result;
use crate::wrapper::convention::x64::X64Convention;
use crate::wrapper::convention::Signature;

/// Size of a stack slot
const SLOT: i32 = 8;

/// Size of a spilled vector register
const VECTOR: i32 = 16;

/// Where a parameter is when a trampoline is entered
#[derive(Clone, Copy)]
enum Source {
    /// In a register
    Register(AsmRegister64),
    /// On the caller's stack, relative to the trampoline's `rbp`
    Stack(i32),
}

/// Locates parameter `index` as passed by a caller using `convention`
fn source(convention: &X64Convention, index: usize) -> Source {
    let registers = convention.parameters();
    match registers.get(index).and_then(|r| r.gpr()) {
        Some(register) => Source::Register(register),
        None => {
            let slot = (index - registers.len()) as i32;
            Source::Stack(2 * SLOT + convention.shadow_bytes() + SLOT * slot)
        }
    }
}

/// Pushes a parameter wherever it currently is
fn push_source(a: &mut CodeAssembler, source: Source) -> Result<()> {
    match source {
        Source::Register(register) => a.push(register)?,
        Source::Stack(offset) => a.push(qword_ptr(rbp + offset))?,
    }
    Ok(())
}

/// Generates a trampoline callable under `to` that calls `function`, written for `from`.
pub fn generate_wrapper(
    function: usize,
    from: &X64Convention,
    to: &X64Convention,
    signature: &Signature,
    address: u64,
) -> Result<Vec<u8>> {
    let count = signature.len();
    let mut a = CodeAssembler::new(64)?;

    a.push(rbp)?;
    a.mov(rbp, rsp)?;

    // rbp was saved as part of the frame
    let saved: Vec<_> = to
        .callee_saved()
        .iter()
        .filter_map(|r| r.gpr())
        .filter(|r| *r != rbp)
        .collect();
    let vectors: Vec<_> = to.callee_saved().iter().filter_map(|r| r.xmm()).collect();

    for register in &saved {
        a.push(*register)?;
    }
    let spill = VECTOR * vectors.len() as i32;
    if spill > 0 {
        a.sub(rsp, spill)?;
        for (i, register) in vectors.iter().enumerate() {
            a.movdqu(xmmword_ptr(rsp + VECTOR * i as i32), *register)?;
        }
    }

    let in_registers = count.min(from.parameters().len());
    let on_stack = count - in_registers;

    // rsp is 16-byte aligned after `push rbp`; keep it aligned at the call
    let pushed = SLOT * (saved.len() + on_stack) as i32;
    let padding = pushed.rem_euclid(16);
    if padding > 0 {
        a.sub(rsp, padding)?;
    }

    for index in (in_registers..count).rev() {
        push_source(&mut a, source(to, index))?;
    }

    // Stage every register parameter on the stack so overlapping register sets can't clobber each other
    for index in (0..in_registers).rev() {
        push_source(&mut a, source(to, index))?;
    }
    for register in from.parameters()[..in_registers].iter().filter_map(|r| r.gpr()) {
        a.pop(register)?;
    }

    if from.shadow_space() {
        a.sub(rsp, from.shadow_bytes())?;
    }
    a.call(function as u64)?;

    let unwind = from.shadow_bytes() + SLOT * on_stack as i32 + padding;
    if unwind > 0 {
        a.add(rsp, unwind)?;
    }

    if let (Some(result), Some(expected)) = (from.return_register().gpr(), to.return_register().gpr()) {
        if result != expected {
            a.mov(expected, result)?;
        }
    }

    if spill > 0 {
        for (i, register) in vectors.iter().enumerate() {
            a.movdqu(*register, xmmword_ptr(rsp + VECTOR * i as i32))?;
        }
        a.add(rsp, spill)?;
    }
    for register in saved.iter().rev() {
        a.pop(*register)?;
    }
    a.pop(rbp)?;
    a.ret()?;

    Ok(a.assemble(address)?)
}

/// Generates a thunk in the default convention that calls
/// `dispatcher(state, arguments)`, where `arguments` points at the spilled parameters.
pub fn generate_thunk(dispatcher: usize, state: usize, parameters: usize, address: u64) -> Result<Vec<u8>> {
    let convention = X64Convention::default();
    let shadow = convention.shadow_bytes();
    let registers: Vec<_> = convention.parameters().iter().filter_map(|r| r.gpr()).collect();

    let mut a = CodeAssembler::new(64)?;

    a.push(rbp)?;
    a.mov(rbp, rsp)?;

    // Argument array sits right above the outgoing shadow space
    let area = (SLOT * parameters as i32 + 15) & !15;
    if shadow + area > 0 {
        a.sub(rsp, shadow + area)?;
    }

    for (index, register) in registers.iter().take(parameters).enumerate() {
        a.mov(qword_ptr(rsp + shadow + SLOT * index as i32), *register)?;
    }
    for index in registers.len()..parameters {
        if let Source::Stack(offset) = source(&convention, index) {
            a.mov(rax, qword_ptr(rbp + offset))?;
            a.mov(qword_ptr(rsp + shadow + SLOT * index as i32), rax)?;
        }
    }

    a.mov(registers[0], state as u64)?;
    a.lea(registers[1], qword_ptr(rsp + shadow))?;
    a.call(dispatcher as u64)?;

    a.mov(rsp, rbp)?;
    a.pop(rbp)?;
    a.ret()?;

    Ok(a.assemble(address)?)
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    use super::*;
    use crate::alloc::BufferAllocator;
    use crate::wrapper::convention::x64::{Preset, Register};

    /// Places `code` generated for its load address into executable memory
    fn place(allocator: &BufferAllocator, generate: impl Fn(u64) -> Result<Vec<u8>>) -> usize {
        allocator
            .emit(None, 512, |ip| Ok((generate(ip)?, ())))
            .unwrap()
            .0
    }

    extern "win64" fn add_win64(a: usize, b: usize) -> usize {
        a + b
    }

    extern "sysv64" fn weighted_sysv(a: usize, b: usize, c: usize, d: usize, e: usize, f: usize, g: usize, h: usize) -> usize {
        a + 2 * b + 3 * c + 4 * d + 5 * e + 6 * f + 7 * g + 8 * h
    }

    #[test]
    /// A Microsoft x64 function called through a System V trampoline
    fn test_win64_from_sysv() {
        let allocator = BufferAllocator::new(0x1000);
        let from = X64Convention::microsoft();
        let to = X64Convention::system_v();
        let function = add_win64 as usize;

        let trampoline = place(&allocator, |ip| {
            generate_wrapper(function, &from, &to, &Signature::integers(2), ip)
        });
        let add: extern "sysv64" fn(usize, usize) -> usize = unsafe { std::mem::transmute(trampoline) };

        assert_eq!(add(3, 4), 7);
    }

    #[test]
    /// Stack parameters survive in both directions
    fn test_sysv_from_win64_eight_parameters() {
        let allocator = BufferAllocator::new(0x1000);
        let from = X64Convention::system_v();
        let to = X64Convention::microsoft();
        let function = weighted_sysv as usize;

        let trampoline = place(&allocator, |ip| {
            generate_wrapper(function, &from, &to, &Signature::integers(8), ip)
        });
        let weighted: extern "win64" fn(usize, usize, usize, usize, usize, usize, usize, usize) -> usize =
            unsafe { std::mem::transmute(trampoline) };

        assert_eq!(weighted(1, 2, 3, 4, 5, 6, 7, 8), weighted_sysv(1, 2, 3, 4, 5, 6, 7, 8));
    }

    #[test]
    /// Vector registers the caller relies on are spilled and restored
    fn test_vector_registers_saved() {
        let from = Preset::SystemV.convention();
        let to = Preset::Microsoft.convention();
        let code = generate_wrapper(0x1000, &from, &to, &Signature::integers(1), 0x2000).unwrap();

        let spills = Decoder::with_ip(64, &code, 0x2000, DecoderOptions::NONE)
            .into_iter()
            .filter(|i| i.mnemonic() == Mnemonic::Movdqu)
            .count();
        assert_eq!(spills, 2 * 10);
    }

    #[test]
    /// A custom convention with a non-rax return register
    fn test_custom_return_register() {
        use Register::*;

        let allocator = BufferAllocator::new(0x1000);
        let custom = X64Convention::new(vec![R10, R11], Rdx, vec![Rbx, Rbp, R12, R13, R14, R15], false).unwrap();
        let sysv = X64Convention::system_v();

        // custom -> sysv, then sysv -> custom on top of it
        let function = add_win64 as usize;
        let inner = place(&allocator, |ip| {
            generate_wrapper(function, &X64Convention::microsoft(), &custom, &Signature::integers(2), ip)
        });
        let outer = place(&allocator, |ip| {
            generate_wrapper(inner, &custom, &sysv, &Signature::integers(2), ip)
        });
        let add: extern "sysv64" fn(usize, usize) -> usize = unsafe { std::mem::transmute(outer) };

        assert_eq!(add(20, 22), 42);
    }
}
