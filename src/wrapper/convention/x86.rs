//! 32-bit x86 calling conventions

use std::str::FromStr;

use iced_x86::code_asm::*;

use super::StackCleanup;
use crate::error::{Error, Result};

/// A 32-bit general-purpose register
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Register {
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

impl Register {
    /// Assembler operand for the register
    pub(crate) fn asm(self) -> AsmRegister32 {
        match self {
            Self::Eax => eax,
            Self::Ecx => ecx,
            Self::Edx => edx,
            Self::Ebx => ebx,
            Self::Esp => esp,
            Self::Ebp => ebp,
            Self::Esi => esi,
            Self::Edi => edi,
        }
    }
}

/// Describes a 32-bit x86 calling convention.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct X86Convention {
    /// Parameter registers, left to right
    parameters: Vec<Register>,
    /// Register holding the return value
    return_register: Register,
    /// Registers the callee has to preserve
    callee_saved: Vec<Register>,
    /// Who pops stack parameters
    cleanup: StackCleanup,
    /// Extra bytes the callee expects to be reserved below its parameters
    reserved_stack: usize,
}

impl X86Convention {
    /// Creates and validates a descriptor.
    ///
    /// [`StackCleanup::None`] is stored as [`StackCleanup::Caller`], which generates the same code.
    pub fn new(
        parameters: Vec<Register>,
        return_register: Register,
        callee_saved: Vec<Register>,
        cleanup: StackCleanup,
        reserved_stack: usize,
    ) -> Result<Self> {
        let convention = Self {
            parameters,
            return_register,
            callee_saved,
            cleanup: cleanup.normalized(),
            reserved_stack,
        };
        convention.validate()?;
        Ok(convention)
    }

    /// Preset with the usual return and preserved registers
    fn preset(parameters: Vec<Register>, cleanup: StackCleanup) -> Self {
        use Register::*;
        Self {
            parameters,
            return_register: Eax,
            callee_saved: vec![Ebx, Esi, Edi, Ebp],
            cleanup: cleanup.normalized(),
            reserved_stack: 0,
        }
    }

    /// `__cdecl`: everything on the stack, removed by the caller
    pub fn cdecl() -> Self {
        Self::preset(vec![], StackCleanup::Caller)
    }

    /// `__stdcall`: everything on the stack, removed by the callee
    pub fn stdcall() -> Self {
        Self::preset(vec![], StackCleanup::Callee)
    }

    /// `__fastcall`: first two parameters in `ecx` and `edx`
    pub fn fastcall() -> Self {
        Self::preset(vec![Register::Ecx, Register::Edx], StackCleanup::Callee)
    }

    /// `__thiscall`: `this` in `ecx`
    pub fn thiscall() -> Self {
        Self::preset(vec![Register::Ecx], StackCleanup::Callee)
    }

    /// Parameter registers, left to right
    pub fn parameters(&self) -> &[Register] {
        &self.parameters
    }

    /// Register holding the return value
    pub fn return_register(&self) -> Register {
        self.return_register
    }

    /// Registers the callee has to preserve
    pub fn callee_saved(&self) -> &[Register] {
        &self.callee_saved
    }

    /// Who pops stack parameters
    pub fn cleanup(&self) -> StackCleanup {
        self.cleanup
    }

    /// Extra bytes reserved before parameters are pushed
    pub fn reserved_stack(&self) -> usize {
        self.reserved_stack
    }

    /// Checks that the descriptor can be marshalled
    pub fn validate(&self) -> Result<()> {
        super::validate_registers(
            &self.parameters,
            self.return_register,
            &self.callee_saved,
            &[Register::Esp, Register::Ebp],
        )?;

        if self.callee_saved.contains(&Register::Esp) {
            return Err(Error::Configuration(
                "the stack pointer cannot be listed as callee-saved".into(),
            ));
        }
        if self.reserved_stack % 4 != 0 {
            return Err(Error::Configuration(format!(
                "reserved stack size {} is not a multiple of 4",
                self.reserved_stack
            )));
        }
        Ok(())
    }
}

impl Default for X86Convention {
    fn default() -> Self {
        Self::cdecl()
    }
}

/// Named 32-bit conventions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Preset {
    /// `__cdecl`
    Cdecl,
    /// `__stdcall`
    Stdcall,
    /// `__fastcall`
    Fastcall,
    /// `__thiscall`
    Thiscall,
}

impl Preset {
    /// Builds the descriptor for this preset
    pub fn convention(self) -> X86Convention {
        match self {
            Self::Cdecl => X86Convention::cdecl(),
            Self::Stdcall => X86Convention::stdcall(),
            Self::Fastcall => X86Convention::fastcall(),
            Self::Thiscall => X86Convention::thiscall(),
        }
    }
}

impl From<Preset> for X86Convention {
    fn from(preset: Preset) -> Self {
        preset.convention()
    }
}

impl FromStr for Preset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim_start_matches('_').to_ascii_lowercase();
        match name.as_str() {
            "cdecl" | "c" => Ok(Self::Cdecl),
            "stdcall" | "winapi" => Ok(Self::Stdcall),
            "fastcall" => Ok(Self::Fastcall),
            "thiscall" => Ok(Self::Thiscall),
            _ => Err(Error::UnknownConvention(s.to_string())),
        }
    }
}
