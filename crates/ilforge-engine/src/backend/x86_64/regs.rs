//! x86-64 registers

use std::fmt;

use crate::backend::{PhysReg, RegisterFile};

/// General purpose register, by hardware number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gpr(pub u8);

pub const RAX: Gpr = Gpr(0);
pub const RCX: Gpr = Gpr(1);
pub const RDX: Gpr = Gpr(2);
pub const RBX: Gpr = Gpr(3);
pub const RSP: Gpr = Gpr(4);
pub const RBP: Gpr = Gpr(5);
pub const RSI: Gpr = Gpr(6);
pub const RDI: Gpr = Gpr(7);
pub const R8: Gpr = Gpr(8);
pub const R9: Gpr = Gpr(9);
pub const R10: Gpr = Gpr(10);
pub const R11: Gpr = Gpr(11);
pub const R12: Gpr = Gpr(12);
pub const R13: Gpr = Gpr(13);
pub const R14: Gpr = Gpr(14);
pub const R15: Gpr = Gpr(15);

impl Gpr {
    /// Low three bits, as encoded in ModRM/SIB/opcode
    pub fn low(self) -> u8 {
        self.0 & 7
    }

    /// Whether the register needs a REX extension bit
    pub fn ext(self) -> bool {
        self.0 >= 8
    }

    /// Whether the register survives calls made by generated code
    pub fn is_callee_saved(self) -> bool {
        matches!(self, RBX | R12 | R13 | R14 | R15)
    }
}

const GPR_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(GPR_NAMES[usize::from(self.0 & 15)])
    }
}

/// SSE register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(pub u8);

pub const XMM0: Xmm = Xmm(0);
pub const XMM1: Xmm = Xmm(1);

impl Xmm {
    pub fn low(self) -> u8 {
        self.0 & 7
    }

    pub fn ext(self) -> bool {
        self.0 >= 8
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.0)
    }
}

/// Integer registers handed out to stack values. `rax rcx rdx r11` and
/// `xmm0 xmm1` stay free as scratch.
pub const INT_POOL: [Gpr; 10] = [RBX, RSI, RDI, R8, R9, R10, R12, R13, R14, R15];

/// Float registers handed out to stack values
pub const FLOAT_POOL: [Xmm; 6] = [Xmm(2), Xmm(3), Xmm(4), Xmm(5), Xmm(6), Xmm(7)];

/// The allocatable register file
pub fn register_file() -> RegisterFile {
    RegisterFile {
        int: INT_POOL.iter().map(|r| PhysReg::int(r.0)).collect(),
        float: FLOAT_POOL.iter().map(|r| PhysReg::float(r.0)).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pools_exclude_scratch_and_frame_registers() {
        for r in [RAX, RCX, RDX, RSP, RBP, R11] {
            assert!(!INT_POOL.contains(&r), "{} is reserved", r);
        }
        assert!(!FLOAT_POOL.contains(&XMM0));
        assert!(!FLOAT_POOL.contains(&XMM1));
        let file = register_file();
        assert_eq!(file.int.len(), 10);
        assert_eq!(file.float[0], PhysReg::float(2));
    }

    #[test]
    fn test_callee_saved_set() {
        let saved: Vec<_> = INT_POOL.iter().filter(|r| r.is_callee_saved()).collect();
        assert_eq!(saved, vec![&RBX, &R12, &R13, &R14, &R15]);
        assert_eq!(R13.low(), 5);
        assert!(R13.ext());
        assert_eq!(R9.to_string(), "r9");
    }
}
