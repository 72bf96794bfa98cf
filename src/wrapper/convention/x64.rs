//! x86-64 calling conventions

use std::str::FromStr;

use iced_x86::code_asm::*;

use crate::error::{Error, Result};

/// An x86-64 register that can appear in a descriptor
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Register {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
    Xmm5,
    Xmm6,
    Xmm7,
    Xmm8,
    Xmm9,
    Xmm10,
    Xmm11,
    Xmm12,
    Xmm13,
    Xmm14,
    Xmm15,
}

impl Register {
    /// Returns true for the 128-bit vector registers
    pub fn is_vector(self) -> bool {
        self.xmm().is_some()
    }

    /// Assembler operand for a general-purpose register
    pub(crate) fn gpr(self) -> Option<AsmRegister64> {
        Some(match self {
            Self::Rax => rax,
            Self::Rcx => rcx,
            Self::Rdx => rdx,
            Self::Rbx => rbx,
            Self::Rsp => rsp,
            Self::Rbp => rbp,
            Self::Rsi => rsi,
            Self::Rdi => rdi,
            Self::R8 => r8,
            Self::R9 => r9,
            Self::R10 => r10,
            Self::R11 => r11,
            Self::R12 => r12,
            Self::R13 => r13,
            Self::R14 => r14,
            Self::R15 => r15,
            _ => return None,
        })
    }

    /// Assembler operand for a vector register
    pub(crate) fn xmm(self) -> Option<AsmRegisterXmm> {
        Some(match self {
            Self::Xmm0 => xmm0,
            Self::Xmm1 => xmm1,
            Self::Xmm2 => xmm2,
            Self::Xmm3 => xmm3,
            Self::Xmm4 => xmm4,
            Self::Xmm5 => xmm5,
            Self::Xmm6 => xmm6,
            Self::Xmm7 => xmm7,
            Self::Xmm8 => xmm8,
            Self::Xmm9 => xmm9,
            Self::Xmm10 => xmm10,
            Self::Xmm11 => xmm11,
            Self::Xmm12 => xmm12,
            Self::Xmm13 => xmm13,
            Self::Xmm14 => xmm14,
            Self::Xmm15 => xmm15,
            _ => return None,
        })
    }
}

/// Describes an x86-64 calling convention.
///
/// Stack parameters are always removed by the caller on this architecture.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct X64Convention {
    /// Integer parameter registers, left to right
    parameters: Vec<Register>,
    /// Register holding the return value
    return_register: Register,
    /// Registers the callee has to preserve
    callee_saved: Vec<Register>,
    /// Whether the caller reserves 32 bytes above the return address for the callee
    shadow_space: bool,
}

impl X64Convention {
    /// Creates and validates a descriptor.
    pub fn new(
        parameters: Vec<Register>,
        return_register: Register,
        callee_saved: Vec<Register>,
        shadow_space: bool,
    ) -> Result<Self> {
        let convention = Self {
            parameters,
            return_register,
            callee_saved,
            shadow_space,
        };
        convention.validate()?;
        Ok(convention)
    }

    /// The Microsoft x64 convention used on Windows
    pub fn microsoft() -> Self {
        use Register::*;
        Self {
            parameters: vec![Rcx, Rdx, R8, R9],
            return_register: Rax,
            callee_saved: vec![
                Rbx, Rbp, Rdi, Rsi, R12, R13, R14, R15, Xmm6, Xmm7, Xmm8, Xmm9, Xmm10, Xmm11,
                Xmm12, Xmm13, Xmm14, Xmm15,
            ],
            shadow_space: true,
        }
    }

    /// The System V AMD64 convention used everywhere else
    pub fn system_v() -> Self {
        use Register::*;
        Self {
            parameters: vec![Rdi, Rsi, Rdx, Rcx, R8, R9],
            return_register: Rax,
            callee_saved: vec![Rbx, Rbp, R12, R13, R14, R15],
            shadow_space: false,
        }
    }

    /// Integer parameter registers, left to right
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

    /// Whether callers reserve 32 bytes of shadow space
    pub fn shadow_space(&self) -> bool {
        self.shadow_space
    }

    /// Bytes of shadow space above the return address
    pub(crate) fn shadow_bytes(&self) -> i32 {
        if self.shadow_space {
            32
        } else {
            0
        }
    }

    /// Checks that the descriptor can be marshalled
    pub fn validate(&self) -> Result<()> {
        super::validate_registers(
            &self.parameters,
            self.return_register,
            &self.callee_saved,
            &[Register::Rsp, Register::Rbp],
        )?;

        if let Some(register) = self.parameters.iter().find(|r| r.is_vector()) {
            return Err(Error::Configuration(format!(
                "vector register {register:?} cannot carry an integer parameter"
            )));
        }
        if self.return_register.is_vector() {
            return Err(Error::Configuration(format!(
                "vector register {:?} cannot hold an integer return value",
                self.return_register
            )));
        }
        if self.callee_saved.contains(&Register::Rsp) {
            return Err(Error::Configuration(
                "the stack pointer cannot be listed as callee-saved".into(),
            ));
        }
        Ok(())
    }
}

impl Default for X64Convention {
    fn default() -> Self {
        if cfg!(windows) {
            Self::microsoft()
        } else {
            Self::system_v()
        }
    }
}

/// Named x86-64 conventions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Preset {
    /// Microsoft x64
    Microsoft,
    /// System V AMD64
    SystemV,
}

impl Preset {
    /// Builds the descriptor for this preset
    pub fn convention(self) -> X64Convention {
        match self {
            Self::Microsoft => X64Convention::microsoft(),
            Self::SystemV => X64Convention::system_v(),
        }
    }
}

impl From<Preset> for X64Convention {
    fn from(preset: Preset) -> Self {
        preset.convention()
    }
}

impl FromStr for Preset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "microsoft" | "win64" | "ms_abi" | "windows" => Ok(Self::Microsoft),
            "sysv" | "sysv64" | "system_v" | "sysv_abi" => Ok(Self::SystemV),
            _ => Err(Error::UnknownConvention(s.to_string())),
        }
    }
}
