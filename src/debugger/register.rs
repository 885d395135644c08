use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use nix::libc::user_regs_struct;
use std::str::FromStr;
use strum::{EnumCount, IntoEnumIterator};
use strum_macros::{Display, EnumCount as EnumCountMacro, EnumIter, EnumString};

/// General purpose registers available for reading, writing and breakpoint conditions.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display, EnumIter, EnumCountMacro,
)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
}

impl Register {
    /// Find register by its name (like `rip` or `r12`).
    pub fn from_name(name: &str) -> Result<Self, Error> {
        Register::from_str(name).map_err(|_| Error::RegisterNameNotFound(name.to_string()))
    }

    fn slot(self, regs: &mut user_regs_struct) -> &mut u64 {
        match self {
            Register::Rax => &mut regs.rax,
            Register::Rbx => &mut regs.rbx,
            Register::Rcx => &mut regs.rcx,
            Register::Rdx => &mut regs.rdx,
            Register::Rdi => &mut regs.rdi,
            Register::Rsi => &mut regs.rsi,
            Register::Rbp => &mut regs.rbp,
            Register::Rsp => &mut regs.rsp,
            Register::R8 => &mut regs.r8,
            Register::R9 => &mut regs.r9,
            Register::R10 => &mut regs.r10,
            Register::R11 => &mut regs.r11,
            Register::R12 => &mut regs.r12,
            Register::R13 => &mut regs.r13,
            Register::R14 => &mut regs.r14,
            Register::R15 => &mut regs.r15,
            Register::Rip => &mut regs.rip,
            Register::Eflags => &mut regs.eflags,
        }
    }
}

/// Mapping of x86_64 dwarf register numbers, only registers used by CFA rules are known.
impl TryFrom<gimli::Register> for Register {
    type Error = Error;

    fn try_from(value: gimli::Register) -> Result<Self, Self::Error> {
        let register = match value.0 {
            0 => Register::Rax,
            1 => Register::Rdx,
            2 => Register::Rcx,
            3 => Register::Rbx,
            4 => Register::Rsi,
            5 => Register::Rdi,
            6 => Register::Rbp,
            7 => Register::Rsp,
            8 => Register::R8,
            9 => Register::R9,
            10 => Register::R10,
            11 => Register::R11,
            12 => Register::R12,
            13 => Register::R13,
            14 => Register::R14,
            15 => Register::R15,
            16 => Register::Rip,
            _ => return Err(Error::RegisterNotFound(value)),
        };
        Ok(register)
    }
}

/// Snapshot of general purpose registers of a stopped thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterMap {
    values: [u64; Register::COUNT],
}

impl From<user_regs_struct> for RegisterMap {
    fn from(mut regs: user_regs_struct) -> Self {
        let mut map = RegisterMap::default();
        for register in Register::iter() {
            map.update(register, *register.slot(&mut regs));
        }
        map
    }
}

impl RegisterMap {
    pub fn value(&self, register: impl Into<Register>) -> u64 {
        self.values[register.into() as usize]
    }

    pub fn update(&mut self, register: impl Into<Register>, value: u64) {
        self.values[register.into() as usize] = value;
    }

    /// Copy all known registers into a raw register set, other fields stay untouched.
    pub fn write_to(&self, regs: &mut user_regs_struct) {
        for register in Register::iter() {
            *register.slot(regs) = self.value(register);
        }
    }

    /// Value of a register addressed by its dwarf number.
    pub fn dwarf_value(&self, register: gimli::Register) -> Result<u64, Error> {
        Register::try_from(register).map(|r| self.value(r))
    }

    pub fn pc(&self) -> RelocatedAddress {
        RelocatedAddress::from(self.value(Register::Rip))
    }

    pub fn sp(&self) -> RelocatedAddress {
        RelocatedAddress::from(self.value(Register::Rsp))
    }
}
