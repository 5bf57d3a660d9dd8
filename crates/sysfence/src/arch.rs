//! Architecture tokens.
//!
//! A filter carries one rule list per ABI it applies to. The kernel reports
//! the ABI of every syscall as an `AUDIT_ARCH_*` value, which the compiled
//! program dispatches on.

use std::fmt;
use std::str::FromStr;

use sysfence_sys::seccomp::{
    AUDIT_ARCH_AARCH64, AUDIT_ARCH_ARM, AUDIT_ARCH_I386, AUDIT_ARCH_RISCV64, AUDIT_ARCH_X86_64,
};

use crate::error::{Error, Result};

/// Instruction-set ABI a filter applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Arch {
    X86,
    X86_64,
    Arm,
    Aarch64,
    Riscv64,
}

impl Arch {
    pub const ALL: [Arch; 5] = [
        Arch::X86,
        Arch::X86_64,
        Arch::Arm,
        Arch::Aarch64,
        Arch::Riscv64,
    ];

    /// The ABI this binary was compiled for.
    pub const fn native() -> Self {
        NATIVE
    }

    /// `AUDIT_ARCH_*` value the kernel reports in `seccomp_data.arch`.
    pub const fn audit_value(self) -> u32 {
        match self {
            Arch::X86 => AUDIT_ARCH_I386,
            Arch::X86_64 => AUDIT_ARCH_X86_64,
            Arch::Arm => AUDIT_ARCH_ARM,
            Arch::Aarch64 => AUDIT_ARCH_AARCH64,
            Arch::Riscv64 => AUDIT_ARCH_RISCV64,
        }
    }

    pub fn from_audit_value(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|arch| arch.audit_value() == value)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Aarch64 => "aarch64",
            Arch::Riscv64 => "riscv64",
        }
    }
}

#[cfg(target_arch = "x86_64")]
const NATIVE: Arch = Arch::X86_64;
#[cfg(target_arch = "x86")]
const NATIVE: Arch = Arch::X86;
#[cfg(target_arch = "arm")]
const NATIVE: Arch = Arch::Arm;
#[cfg(target_arch = "aarch64")]
const NATIVE: Arch = Arch::Aarch64;
#[cfg(target_arch = "riscv64")]
const NATIVE: Arch = Arch::Riscv64;

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "arm",
    target_arch = "aarch64",
    target_arch = "riscv64"
)))]
compile_error!("sysfence supports x86, x86_64, arm, aarch64 and riscv64 only");

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(Arch::native()),
            "x86" | "i386" | "i686" => Ok(Arch::X86),
            "x86_64" | "amd64" => Ok(Arch::X86_64),
            "arm" => Ok(Arch::Arm),
            "aarch64" | "arm64" => Ok(Arch::Aarch64),
            "riscv64" => Ok(Arch::Riscv64),
            _ => Err(Error::InvalidArchitecture(s.to_string())),
        }
    }
}
