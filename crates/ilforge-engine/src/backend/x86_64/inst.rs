//! Machine instruction records
//!
//! Instruction selection produces a flat list of [`Inst`]s. Branch targets,
//! call targets and rip-relative addresses stay symbolic until encoding.

use std::fmt;

use super::regs::{Gpr, Xmm};

/// Operand width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    /// Width of a value of `bytes` bytes
    pub fn of_size(bytes: u32) -> Width {
        match bytes {
            1 => Width::W8,
            2 => Width::W16,
            4 => Width::W32,
            _ => Width::W64,
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }
}

/// Code position named symbolically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Label {
    /// First instruction generated for a bytecode offset (after any entry
    /// prologue); the code size maps to the end of the method body
    Il(u32),
    /// Entry of a clause's handler block
    Handler(usize),
    /// Entry of a clause's filter block
    Filter(usize),
    /// Shared overflow exception stub
    Overflow,
    /// Compiler-generated
    Local(u32),
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Il(o) => write!(f, "IL_{:04x}", o),
            Label::Handler(c) => write!(f, "handler{}", c),
            Label::Filter(c) => write!(f, "filter{}", c),
            Label::Overflow => f.write_str("overflow"),
            Label::Local(n) => write!(f, ".L{}", n),
        }
    }
}

/// Base of a memory operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Base {
    Reg(Gpr),
    /// `rip`-relative address of `symbol + addend`
    Symbol { symbol: String, addend: i64 },
    /// `rip`-relative address of a label in this method
    Label(Label),
}

/// Memory operand `[base + disp]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mem {
    pub base: Base,
    pub disp: i32,
}

impl Mem {
    pub fn reg(base: Gpr, disp: i32) -> Mem {
        Mem {
            base: Base::Reg(base),
            disp,
        }
    }

    pub fn symbol(symbol: impl Into<String>, addend: i64) -> Mem {
        Mem {
            base: Base::Symbol {
                symbol: symbol.into(),
                addend,
            },
            disp: 0,
        }
    }

    pub fn label(label: Label) -> Mem {
        Mem {
            base: Base::Label(label),
            disp: 0,
        }
    }

    /// Same base, displacement moved by `by`
    pub fn offset(&self, by: i32) -> Mem {
        Mem {
            base: self.base.clone(),
            disp: self.disp + by,
        }
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.base {
            Base::Reg(r) if self.disp == 0 => write!(f, "[{}]", r),
            Base::Reg(r) => write!(f, "[{}{:+}]", r, self.disp),
            Base::Symbol { symbol, addend } if *addend == 0 => write!(f, "[rip+{}]", symbol),
            Base::Symbol { symbol, addend } => write!(f, "[rip+{}{:+}]", symbol, addend),
            Base::Label(l) => write!(f, "[rip+{}]", l),
        }
    }
}

/// Register or memory operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rm {
    Reg(Gpr),
    Mem(Mem),
}

impl fmt::Display for Rm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rm::Reg(r) => write!(f, "{}", r),
            Rm::Mem(m) => write!(f, "{}", m),
        }
    }
}

/// SSE register or memory operand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XRm {
    Reg(Xmm),
    Mem(Mem),
}

/// Two-operand integer ALU operations, by their `/digit` opcode extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alu {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shift {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Single-operand group 3 operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unary {
    Not = 2,
    Neg = 3,
    /// Unsigned `rdx:rax = rax * src`
    Mul = 4,
    Div = 6,
    Idiv = 7,
}

/// Scalar SSE operations of the form `op xmm, xmm/m`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sse {
    Movsd,
    Movss,
    Addsd,
    Subsd,
    Mulsd,
    Divsd,
    Ucomisd,
    Cvtss2sd,
    Cvtsd2ss,
}

/// Condition codes, by their encoding nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xa,
    Np = 0xb,
    L = 0xc,
    Ge = 0xd,
    Le = 0xe,
    G = 0xf,
}

impl Cond {
    pub fn invert(self) -> Cond {
        use Cond::*;
        match self {
            O => No,
            No => O,
            B => Ae,
            Ae => B,
            E => Ne,
            Ne => E,
            Be => A,
            A => Be,
            S => Ns,
            Ns => S,
            P => Np,
            Np => P,
            L => Ge,
            Ge => L,
            Le => G,
            G => Le,
        }
    }
}

/// One machine instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    /// Pseudo-instruction marking a label position
    Bind(Label),

    /// `op dst, src`
    AluRmR { op: Alu, w: Width, dst: Rm, src: Gpr },
    /// `op dst, src`
    AluRRm { op: Alu, w: Width, dst: Gpr, src: Rm },
    AluRmI { op: Alu, w: Width, dst: Rm, imm: i32 },
    MovRmR { w: Width, dst: Rm, src: Gpr },
    MovRRm { w: Width, dst: Gpr, src: Rm },
    /// Store an immediate, sign-extended to `w`
    MovRmI { w: Width, dst: Rm, imm: i32 },
    /// Load any 64-bit constant
    MovRI { dst: Gpr, imm: i64 },
    /// Widening load of an 8-, 16- or 32-bit source into a 64-bit register
    Movx { signed: bool, from: Width, dst: Gpr, src: Rm },
    Lea { dst: Gpr, src: Mem },
    Test { w: Width, dst: Rm, src: Gpr },
    /// Shift by `cl`
    ShiftCl { op: Shift, w: Width, dst: Rm },
    ShiftI { op: Shift, w: Width, dst: Rm, imm: u8 },
    Unary { op: Unary, w: Width, src: Rm },
    /// Signed `dst = dst * src`
    Imul { w: Width, dst: Gpr, src: Rm },
    /// Signed `dst = src * imm`
    ImulI { w: Width, dst: Gpr, src: Rm, imm: i32 },
    /// `cdq` / `cqo`
    SignExtendAx { w: Width },
    Setcc { cc: Cond, dst: Gpr },
    Jcc { cc: Cond, target: Label },
    Jmp { target: Label },
    /// Direct call of an external symbol
    Call { symbol: String },
    /// Direct call of a label in this method
    CallLabel { target: Label },
    CallRm { target: Rm },
    Ret,
    Push { src: Gpr },
    PushI { imm: i32 },
    Pop { dst: Gpr },
    Leave,
    RepStosb,

    SseOp { op: Sse, dst: Xmm, src: XRm },
    /// `movsd`/`movss` to memory
    SseStore { single: bool, dst: Mem, src: Xmm },
    /// `movaps dst, src`
    MovXX { dst: Xmm, src: Xmm },
    /// `movq xmm, r64`
    MovqToXmm { dst: Xmm, src: Gpr },
    /// `movq r64, xmm`
    MovqFromXmm { dst: Gpr, src: Xmm },
    /// `cvtsi2sd dst, src` from a 32- or 64-bit integer
    Cvtsi2sd { w: Width, dst: Xmm, src: Gpr },
    /// `cvttsd2si dst, src` to a 64-bit integer
    Cvttsd2si { dst: Gpr, src: Xmm },
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Bind(l) => write!(f, "{}:", l),
            Inst::AluRmR { op, w, dst, src } => {
                write!(f, "  {:?}.{} {}, {}", op, w.bytes(), dst, src)
            }
            Inst::AluRRm { op, w, dst, src } => {
                write!(f, "  {:?}.{} {}, {}", op, w.bytes(), dst, src)
            }
            Inst::AluRmI { op, w, dst, imm } => {
                write!(f, "  {:?}.{} {}, {}", op, w.bytes(), dst, imm)
            }
            Inst::MovRmR { w, dst, src } => write!(f, "  mov.{} {}, {}", w.bytes(), dst, src),
            Inst::MovRRm { w, dst, src } => write!(f, "  mov.{} {}, {}", w.bytes(), dst, src),
            Inst::MovRmI { w, dst, imm } => write!(f, "  mov.{} {}, {}", w.bytes(), dst, imm),
            Inst::MovRI { dst, imm } => write!(f, "  mov {}, {:#x}", dst, imm),
            Inst::Movx { signed, from, dst, src } => {
                let m = if *signed { "movsx" } else { "movzx" };
                write!(f, "  {}.{} {}, {}", m, from.bytes(), dst, src)
            }
            Inst::Lea { dst, src } => write!(f, "  lea {}, {}", dst, src),
            Inst::Test { w, dst, src } => write!(f, "  test.{} {}, {}", w.bytes(), dst, src),
            Inst::ShiftCl { op, w, dst } => write!(f, "  {:?}.{} {}, cl", op, w.bytes(), dst),
            Inst::ShiftI { op, w, dst, imm } => {
                write!(f, "  {:?}.{} {}, {}", op, w.bytes(), dst, imm)
            }
            Inst::Unary { op, w, src } => write!(f, "  {:?}.{} {}", op, w.bytes(), src),
            Inst::Imul { w, dst, src } => write!(f, "  imul.{} {}, {}", w.bytes(), dst, src),
            Inst::ImulI { w, dst, src, imm } => {
                write!(f, "  imul.{} {}, {}, {}", w.bytes(), dst, src, imm)
            }
            Inst::SignExtendAx { w } => {
                f.write_str(if *w == Width::W64 { "  cqo" } else { "  cdq" })
            }
            Inst::Setcc { cc, dst } => write!(f, "  set{:?} {}", cc, dst),
            Inst::Jcc { cc, target } => write!(f, "  j{:?} {}", cc, target),
            Inst::Jmp { target } => write!(f, "  jmp {}", target),
            Inst::Call { symbol } => write!(f, "  call {}", symbol),
            Inst::CallLabel { target } => write!(f, "  call {}", target),
            Inst::CallRm { target } => write!(f, "  call {}", target),
            Inst::Ret => f.write_str("  ret"),
            Inst::Push { src } => write!(f, "  push {}", src),
            Inst::PushI { imm } => write!(f, "  push {}", imm),
            Inst::Pop { dst } => write!(f, "  pop {}", dst),
            Inst::Leave => f.write_str("  leave"),
            Inst::RepStosb => f.write_str("  rep stosb"),
            Inst::SseOp { op, dst, src } => match src {
                XRm::Reg(s) => write!(f, "  {:?} {}, {}", op, dst, s),
                XRm::Mem(m) => write!(f, "  {:?} {}, {}", op, dst, m),
            },
            Inst::SseStore { single, dst, src } => {
                write!(f, "  {} {}, {}", if *single { "movss" } else { "movsd" }, dst, src)
            }
            Inst::MovXX { dst, src } => write!(f, "  movaps {}, {}", dst, src),
            Inst::MovqToXmm { dst, src } => write!(f, "  movq {}, {}", dst, src),
            Inst::MovqFromXmm { dst, src } => write!(f, "  movq {}, {}", dst, src),
            Inst::Cvtsi2sd { w, dst, src } => {
                write!(f, "  cvtsi2sd.{} {}, {}", w.bytes(), dst, src)
            }
            Inst::Cvttsd2si { dst, src } => write!(f, "  cvttsd2si {}, {}", dst, src),
        }
    }
}
