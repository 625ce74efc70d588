use std::fmt;
use std::str::FromStr;

use iced_x86::Register;

use crate::error::{Error, Result};

/// Identifier the host assigns to one execution state.
pub type StateId = u64;

/// Virtual address inside a loaded module.
///
/// Before relocation is observed this is the file address; once the
/// module base is known it can be rebased with [`VirtAddr::rebase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    pub fn addr(self) -> u64 {
        self.0
    }

    /// Add a module base using modular arithmetic.
    pub fn rebase(self, base: u64) -> VirtAddr {
        VirtAddr(base.wrapping_add(self.0))
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::ops::Add<u64> for VirtAddr {
    type Output = VirtAddr;
    fn add(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0.wrapping_add(rhs))
    }
}

impl std::ops::Sub<u64> for VirtAddr {
    type Output = VirtAddr;
    fn sub(self, rhs: u64) -> Self::Output {
        VirtAddr(self.0.wrapping_sub(rhs))
    }
}

/// x86_64 general purpose registers plus the instruction pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum X64Reg {
    Rax, Rbx, Rcx, Rdx, Rsi, Rdi, Rbp, Rsp,
    R8, R9, R10, R11, R12, R13, R14, R15,
    Rip,
}

impl X64Reg {
    /// Syscall argument register order.
    pub const SYSCALL_ARGS: [X64Reg; 6] = [
        X64Reg::Rdi, X64Reg::Rsi, X64Reg::Rdx,
        X64Reg::R10, X64Reg::R8, X64Reg::R9,
    ];

    /// Map an iced register (64-bit or its 32-bit alias) to `X64Reg`.
    pub fn from_iced(reg: Register) -> Option<Self> {
        match reg {
            Register::RAX | Register::EAX => Some(X64Reg::Rax),
            Register::RBX | Register::EBX => Some(X64Reg::Rbx),
            Register::RCX | Register::ECX => Some(X64Reg::Rcx),
            Register::RDX | Register::EDX => Some(X64Reg::Rdx),
            Register::RSI | Register::ESI => Some(X64Reg::Rsi),
            Register::RDI | Register::EDI => Some(X64Reg::Rdi),
            Register::RBP | Register::EBP => Some(X64Reg::Rbp),
            Register::RSP | Register::ESP => Some(X64Reg::Rsp),
            Register::R8 | Register::R8D => Some(X64Reg::R8),
            Register::R9 | Register::R9D => Some(X64Reg::R9),
            Register::R10 | Register::R10D => Some(X64Reg::R10),
            Register::R11 | Register::R11D => Some(X64Reg::R11),
            Register::R12 | Register::R12D => Some(X64Reg::R12),
            Register::R13 | Register::R13D => Some(X64Reg::R13),
            Register::R14 | Register::R14D => Some(X64Reg::R14),
            Register::R15 | Register::R15D => Some(X64Reg::R15),
            Register::RIP | Register::EIP => Some(X64Reg::Rip),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            X64Reg::Rax => "rax", X64Reg::Rbx => "rbx",
            X64Reg::Rcx => "rcx", X64Reg::Rdx => "rdx",
            X64Reg::Rsi => "rsi", X64Reg::Rdi => "rdi",
            X64Reg::Rbp => "rbp", X64Reg::Rsp => "rsp",
            X64Reg::R8  => "r8",  X64Reg::R9  => "r9",
            X64Reg::R10 => "r10", X64Reg::R11 => "r11",
            X64Reg::R12 => "r12", X64Reg::R13 => "r13",
            X64Reg::R14 => "r14", X64Reg::R15 => "r15",
            X64Reg::Rip => "rip",
        }
    }
}

impl fmt::Display for X64Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for X64Reg {
    type Err = Error;

    /// Accepts 64-bit names and their 32-bit aliases (`edi`, `r12d`).
    fn from_str(s: &str) -> Result<Self> {
        let reg = match s.trim().to_ascii_lowercase().as_str() {
            "rax" | "eax" => X64Reg::Rax,
            "rbx" | "ebx" => X64Reg::Rbx,
            "rcx" | "ecx" => X64Reg::Rcx,
            "rdx" | "edx" => X64Reg::Rdx,
            "rsi" | "esi" => X64Reg::Rsi,
            "rdi" | "edi" => X64Reg::Rdi,
            "rbp" | "ebp" => X64Reg::Rbp,
            "rsp" | "esp" => X64Reg::Rsp,
            "r8" | "r8d" => X64Reg::R8,
            "r9" | "r9d" => X64Reg::R9,
            "r10" | "r10d" => X64Reg::R10,
            "r11" | "r11d" => X64Reg::R11,
            "r12" | "r12d" => X64Reg::R12,
            "r13" | "r13d" => X64Reg::R13,
            "r14" | "r14d" => X64Reg::R14,
            "r15" | "r15d" => X64Reg::R15,
            "rip" | "eip" => X64Reg::Rip,
            other => return Err(Error::Other(format!("unknown register: '{}'", other))),
        };
        Ok(reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_addr_display() {
        let addr = VirtAddr(0x400000);
        assert_eq!(format!("{}", addr), "0x400000");
    }

    #[test]
    fn virt_addr_arithmetic_wraps() {
        let addr = VirtAddr(0x1000);
        assert_eq!((addr + 0x10).addr(), 0x1010);
        assert_eq!((addr - 0x10).addr(), 0x0FF0);
        assert_eq!((VirtAddr(u64::MAX) + 1).addr(), 0);
    }

    #[test]
    fn virt_addr_rebase() {
        assert_eq!(VirtAddr(0x1030).rebase(0x400000), VirtAddr(0x401030));
    }

    #[test]
    fn reg_from_str_accepts_aliases() {
        assert_eq!("rdi".parse::<X64Reg>().unwrap(), X64Reg::Rdi);
        assert_eq!("edi".parse::<X64Reg>().unwrap(), X64Reg::Rdi);
        assert_eq!("R12D".parse::<X64Reg>().unwrap(), X64Reg::R12);
        assert!("xmm0".parse::<X64Reg>().is_err());
    }

    #[test]
    fn reg_from_iced() {
        assert_eq!(X64Reg::from_iced(Register::R13D), Some(X64Reg::R13));
        assert_eq!(X64Reg::from_iced(Register::RIP), Some(X64Reg::Rip));
        assert_eq!(X64Reg::from_iced(Register::XMM0), None);
    }

    #[test]
    fn reg_display_roundtrip() {
        for reg in X64Reg::SYSCALL_ARGS {
            assert_eq!(reg.to_string().parse::<X64Reg>().unwrap(), reg);
        }
    }
}
