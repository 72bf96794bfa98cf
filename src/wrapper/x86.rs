//! 32-bit x86 marshalling trampolines
//!
//! The outgoing parameter area is aligned to 16 bytes dynamically, and the stack is restored
//! from `ebp` after the call. That way it makes no difference whether the callee pops its own
//! parameters.

use iced_x86::code_asm::*;

use crate::error::Result;
use crate::wrapper::convention::x86::X86Convention;
use crate::wrapper::convention::{Signature, StackCleanup};

/// Size of a stack slot
const SLOT: i32 = 4;

/// Pushes parameter `index` as passed by a caller using `convention`
fn push_source(a: &mut CodeAssembler, convention: &X86Convention, index: usize) -> Result<()> {
    let registers = convention.parameters();
    match registers.get(index) {
        Some(register) => a.push(register.asm())?,
        None => {
            let slot = (index - registers.len()) as i32;
            a.push(dword_ptr(ebp + (2 * SLOT + SLOT * slot)))?;
        }
    }
    Ok(())
}

/// Generates a trampoline callable under `to` that calls `function`, written for `from`.
pub fn generate_wrapper(
    function: usize,
    from: &X86Convention,
    to: &X86Convention,
    signature: &Signature,
    address: u64,
) -> Result<Vec<u8>> {
    let count = signature.len();
    let mut a = CodeAssembler::new(32)?;

    a.push(ebp)?;
    a.mov(ebp, esp)?;

    let saved: Vec<_> = to
        .callee_saved()
        .iter()
        .map(|r| r.asm())
        .filter(|r| *r != ebp)
        .collect();
    for register in &saved {
        a.push(*register)?;
    }

    if from.reserved_stack() > 0 {
        a.sub(esp, from.reserved_stack() as i32)?;
    }

    let in_registers = count.min(from.parameters().len());
    let on_stack = count - in_registers;

    a.and(esp, -16)?;
    let padding = (16 - (SLOT * on_stack as i32) % 16) % 16;
    if padding > 0 {
        a.sub(esp, padding)?;
    }

    for index in (in_registers..count).rev() {
        push_source(&mut a, to, index)?;
    }

    // Stage every register parameter on the stack so overlapping register sets can't clobber each other
    for index in (0..in_registers).rev() {
        push_source(&mut a, to, index)?;
    }
    for register in &from.parameters()[..in_registers] {
        a.pop(register.asm())?;
    }

    a.call(function as u64)?;

    a.lea(esp, dword_ptr(ebp - SLOT * saved.len() as i32))?;

    let (result, expected) = (from.return_register().asm(), to.return_register().asm());
    if result != expected {
        a.mov(expected, result)?;
    }

    for register in saved.iter().rev() {
        a.pop(*register)?;
    }
    a.pop(ebp)?;

    let incoming = count.saturating_sub(to.parameters().len());
    match to.cleanup() {
        StackCleanup::Callee if incoming > 0 => a.ret_1(SLOT * incoming as i32)?,
        _ => a.ret()?,
    }

    Ok(a.assemble(address)?)
}

/// Generates a `cdecl` thunk that calls `dispatcher(state, arguments)`, where `arguments`
/// points at the caller's stack parameters.
///
/// `cdecl` passes everything on the stack, so the parameters are already laid out as an
/// array and `parameters` doesn't change the generated code.
pub fn generate_thunk(dispatcher: usize, state: usize, _parameters: usize, address: u64) -> Result<Vec<u8>> {
    let mut a = CodeAssembler::new(32)?;

    a.push(ebp)?;
    a.mov(ebp, esp)?;
    a.and(esp, -16)?;
    a.sub(esp, 2 * SLOT)?;

    a.lea(eax, dword_ptr(ebp + 2 * SLOT))?;
    a.push(eax)?;
    a.push(state as u32)?;
    a.call(dispatcher as u64)?;

    a.mov(esp, ebp)?;
    a.pop(ebp)?;
    a.ret()?;

    Ok(a.assemble(address)?)
}

#[cfg(test)]
mod tests {
    use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind};

    use super::*;
    use crate::wrapper::convention::x86::Register;

    /// Load address used for generated code
    const IP: u64 = 0x1000_0000;

    /// Decodes 32-bit code generated at [`IP`]
    fn decode(code: &[u8]) -> Vec<Instruction> {
        Decoder::with_ip(32, code, IP, DecoderOptions::NONE)
            .into_iter()
            .collect()
    }

    /// Displacements from `ebp` of every pushed stack slot, in push order
    fn pushed_slots(instructions: &[Instruction]) -> Vec<u32> {
        instructions
            .iter()
            .filter(|i| i.code() == Code::Push_rm32 && i.op0_kind() == OpKind::Memory)
            .inspect(|i| assert_eq!(i.memory_base(), iced_x86::Register::EBP))
            .map(|i| i.memory_displacement32())
            .collect()
    }

    #[test]
    /// Incoming stack parameters are read right to left, one slot each above the return address
    fn test_stack_parameters_order() {
        let code = generate_wrapper(
            0x2000_0000,
            &X86Convention::fastcall(),
            &X86Convention::cdecl(),
            &Signature::integers(4),
            IP,
        )
        .unwrap();
        let instructions = decode(&code);

        // two stack parameters for the callee, then the two staged register parameters
        assert_eq!(pushed_slots(&instructions), [20, 16, 12, 8]);
    }

    #[test]
    /// Parameters the caller passed in registers don't take stack slots
    fn test_register_parameters_skip_slots() {
        let code = generate_wrapper(
            0x2000_0000,
            &X86Convention::cdecl(),
            &X86Convention::thiscall(),
            &Signature::integers(3),
            IP,
        )
        .unwrap();
        let instructions = decode(&code);

        assert_eq!(pushed_slots(&instructions), [12, 8]);
        let call = instructions
            .iter()
            .position(|i| i.mnemonic() == Mnemonic::Call)
            .unwrap();
        assert_eq!(instructions[call - 1].code(), Code::Push_r32);
        assert_eq!(instructions[call - 1].op0_register(), iced_x86::Register::ECX);
    }

    #[test]
    /// Stack the callee expects reserved is allocated before alignment, and the frame is
    /// restored from `ebp` after the call
    fn test_reserved_stack() {
        let reserving = X86Convention::new(
            vec![],
            Register::Eax,
            vec![Register::Ebx, Register::Esi, Register::Edi, Register::Ebp],
            StackCleanup::Caller,
            16,
        )
        .unwrap();
        let code = generate_wrapper(0x2000_0000, &reserving, &X86Convention::cdecl(), &Signature::integers(1), IP).unwrap();
        let instructions = decode(&code);

        let align = instructions
            .iter()
            .position(|i| i.mnemonic() == Mnemonic::And)
            .unwrap();
        let reserve = &instructions[align - 1];
        assert_eq!(reserve.mnemonic(), Mnemonic::Sub);
        assert_eq!(reserve.op0_register(), iced_x86::Register::ESP);
        assert_eq!(reserve.immediate(1), 16);
        // ebx, esi and edi were pushed below ebp
        assert_eq!(instructions[align - 2].op0_register(), iced_x86::Register::EDI);

        let call = instructions
            .iter()
            .position(|i| i.mnemonic() == Mnemonic::Call)
            .unwrap();
        let restore = &instructions[call + 1];
        assert_eq!(restore.mnemonic(), Mnemonic::Lea);
        assert_eq!(restore.memory_base(), iced_x86::Register::EBP);
        assert_eq!(restore.memory_displacement32() as i32, -12);

        // without reserved stack, alignment follows the saved registers directly
        let code = generate_wrapper(
            0x2000_0000,
            &X86Convention::cdecl(),
            &X86Convention::stdcall(),
            &Signature::integers(1),
            IP,
        )
        .unwrap();
        let instructions = decode(&code);
        let align = instructions
            .iter()
            .position(|i| i.mnemonic() == Mnemonic::And)
            .unwrap();
        assert_eq!(instructions[align - 1].code(), Code::Push_r32);
    }

    #[test]
    /// A callee-cleanup trampoline pops exactly its stack parameters
    fn test_stdcall_trampoline_pops_parameters() {
        let code = generate_wrapper(
            0x2000_0000,
            &X86Convention::cdecl(),
            &X86Convention::stdcall(),
            &Signature::integers(2),
            IP,
        )
        .unwrap();
        let instructions = decode(&code);
        let last = instructions.last().unwrap();

        assert_eq!(last.code(), Code::Retnd_imm16);
        assert_eq!(last.immediate16(), 8);
        assert!(instructions
            .iter()
            .any(|i| i.mnemonic() == Mnemonic::Call && i.near_branch_target() == 0x2000_0000));
    }

    #[test]
    /// A caller-cleanup trampoline returns without popping anything
    fn test_cdecl_trampoline_plain_return() {
        let code = generate_wrapper(
            0x2000_0000,
            &X86Convention::stdcall(),
            &X86Convention::cdecl(),
            &Signature::integers(2),
            IP,
        )
        .unwrap();

        assert_eq!(decode(&code).last().unwrap().code(), Code::Retnd);
    }

    #[test]
    /// Register parameters are staged through the stack and popped into the callee's registers
    fn test_fastcall_from_thiscall() {
        let code = generate_wrapper(
            0x2000_0000,
            &X86Convention::fastcall(),
            &X86Convention::thiscall(),
            &Signature::integers(3),
            IP,
        )
        .unwrap();
        let instructions = decode(&code);

        // ecx and edx are popped in parameter order right before the call
        let call = instructions
            .iter()
            .position(|i| i.mnemonic() == Mnemonic::Call)
            .unwrap();
        let pops: Vec<_> = instructions[call - 2..call].iter().map(|i| i.op0_register()).collect();
        assert_eq!(pops, [iced_x86::Register::ECX, iced_x86::Register::EDX]);

        // thiscall passed two of the three parameters on the stack
        let last = instructions.last().unwrap();
        assert_eq!(last.code(), Code::Retnd_imm16);
        assert_eq!(last.immediate16(), 8);
    }

    #[test]
    /// The return value is moved when the return registers differ
    fn test_return_register_moved() {
        let custom = X86Convention::new(
            vec![Register::Eax],
            Register::Edx,
            vec![Register::Ebx, Register::Esi, Register::Edi, Register::Ebp],
            StackCleanup::Caller,
            0,
        )
        .unwrap();
        let code = generate_wrapper(0x2000_0000, &X86Convention::cdecl(), &custom, &Signature::integers(1), IP).unwrap();

        assert!(decode(&code).iter().any(|i| i.mnemonic() == Mnemonic::Mov
            && i.op0_register() == iced_x86::Register::EDX
            && i.op1_register() == iced_x86::Register::EAX));
    }
}
