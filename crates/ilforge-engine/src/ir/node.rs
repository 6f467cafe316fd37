//! IR nodes
//!
//! Operations are stack-machine style: operands are the top items of
//! `stack_before` and results are the top items of `stack_after`. Register
//! assignment later maps every stack depth to a physical location, so a node
//! never names its operands explicitly.

use crate::metadata::ElementType;

use super::stack::Stack;
use super::types::Ct;

/// Branch and comparison conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondCode {
    Always,
    Never,
    Eq,
    Ne,
    /// Signed greater than
    Gt,
    Ge,
    Lt,
    Le,
    /// Unsigned (or unordered) above
    A,
    Ae,
    B,
    Be,
}

impl CondCode {
    /// Condition that holds exactly when `self` does not
    pub fn invert(self) -> CondCode {
        match self {
            CondCode::Always => CondCode::Never,
            CondCode::Never => CondCode::Always,
            CondCode::Eq => CondCode::Ne,
            CondCode::Ne => CondCode::Eq,
            CondCode::Gt => CondCode::Le,
            CondCode::Ge => CondCode::Lt,
            CondCode::Lt => CondCode::Ge,
            CondCode::Le => CondCode::Gt,
            CondCode::A => CondCode::Be,
            CondCode::Ae => CondCode::B,
            CondCode::B => CondCode::Ae,
            CondCode::Be => CondCode::A,
        }
    }

    /// Unsigned counterpart of a signed ordering
    pub fn to_unsigned(self) -> CondCode {
        match self {
            CondCode::Gt => CondCode::A,
            CondCode::Ge => CondCode::Ae,
            CondCode::Lt => CondCode::B,
            CondCode::Le => CondCode::Be,
            other => other,
        }
    }

    /// Mnemonic suffix
    pub fn name(self) -> &'static str {
        match self {
            CondCode::Always => "always",
            CondCode::Never => "never",
            CondCode::Eq => "eq",
            CondCode::Ne => "ne",
            CondCode::Gt => "gt",
            CondCode::Ge => "ge",
            CondCode::Lt => "lt",
            CondCode::Le => "le",
            CondCode::A => "a",
            CondCode::Ae => "ae",
            CondCode::B => "b",
            CondCode::Be => "be",
        }
    }
}

/// Two-operand arithmetic and logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
}

impl BinOp {
    pub fn name(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Rem => "rem",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
        }
    }

    /// Whether the operation is defined on integers only
    pub fn is_bitwise(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or | BinOp::Xor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Shl,
    Shr,
    ShrUn,
}

impl ShiftOp {
    pub fn name(self) -> &'static str {
        match self {
            ShiftOp::Shl => "shl",
            ShiftOp::Shr => "shr",
            ShiftOp::ShrUn => "shr.un",
        }
    }
}

/// Operation of one IR node
#[derive(Debug, Clone, PartialEq)]
pub enum IrOp {
    /// Method prologue
    Enter,
    /// Entry of a handler (or of a filter block when `filter` is set)
    EnterHandler { clause: usize, filter: bool },
    Nop,

    /// Push an integer constant
    Ldc(i64),
    /// Push a floating point constant
    LdcR(f64),
    /// Push the address `symbol + addend`
    LdLabAddr { symbol: String, addend: i64 },

    LdLoc(u32),
    StLoc(u32),
    LdLoca(u32),
    LdArg(u32),
    StArg(u32),
    LdArga(u32),

    /// Push a copy of the item `n` places below the top
    Pick(u32),
    /// Remove the `n` items directly below the top
    Nip(u32),
    Pop,

    Bin {
        op: BinOp,
        unsigned: bool,
        overflow: bool,
    },
    Shift(ShiftOp),
    Neg,
    Not,
    Conv {
        to: ElementType,
        unsigned: bool,
        overflow: bool,
    },
    /// Compare the two top items and push 1 or 0; the node type is that of
    /// the operands
    Cmp(CondCode),

    Br(u32),
    /// Compare the two top items and branch
    BrIf { cc: CondCode, target: u32 },
    /// Branch on the top item being (non)zero
    BrZero { nonzero: bool, target: u32 },
    Switch(Vec<u32>),

    /// Direct call; arguments are the top `nparams` items
    Call { symbol: String, nparams: u32 },
    /// Call through a vtable slot of the first argument
    CallVirt { slot: u32, nparams: u32 },
    /// Call through an interface implementation table found in the first
    /// argument's interface map
    CallInterface {
        iface: String,
        slot: u32,
        nparams: u32,
    },
    /// Indirect call; the target address is on top of the arguments
    CallI { nparams: u32 },
    Ret,

    /// Load `size` bytes from the address on top
    LdInd { size: u32, signed: bool },
    /// Store the top item to the address below it
    StInd { size: u32 },
    /// Read a field of the value type instance on top
    LdVtField { offset: u32, size: u32, signed: bool },
    LocAlloc,
    /// Zero `size` bytes at the address on top
    ZeroMem { size: u32 },

    /// Run the finally handler of a clause
    CallFinally(usize),
    EndFinally,
    EndFilter,
    /// Return from a catch handler, resuming at the target
    LeaveHandler(u32),
}

/// One IR operation with the evaluation stack around it
#[derive(Debug, Clone)]
pub struct IrNode {
    pub op: IrOp,
    /// Computational type of the result, or of the operands for nodes without one
    pub ct: Ct,
    pub stack_before: Stack,
    pub stack_after: Stack,
    /// Offset of the instruction the node was generated for
    pub il_offset: u32,
}

impl IrNode {
    /// Whether control never continues to the next node
    pub fn is_terminator(&self) -> bool {
        matches!(
            self.op,
            IrOp::Br(_)
                | IrOp::Ret
                | IrOp::EndFinally
                | IrOp::EndFilter
                | IrOp::LeaveHandler(_)
        )
    }

    /// Number of call arguments consumed, if the node is a call
    pub fn call_params(&self) -> Option<u32> {
        match self.op {
            IrOp::Call { nparams, .. }
            | IrOp::CallVirt { nparams, .. }
            | IrOp::CallInterface { nparams, .. } => Some(nparams),
            IrOp::CallI { nparams } => Some(nparams + 1),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_code_inversion_is_involutive() {
        let all = [
            CondCode::Always,
            CondCode::Never,
            CondCode::Eq,
            CondCode::Ne,
            CondCode::Gt,
            CondCode::Ge,
            CondCode::Lt,
            CondCode::Le,
            CondCode::A,
            CondCode::Ae,
            CondCode::B,
            CondCode::Be,
        ];
        for cc in all {
            assert_eq!(cc.invert().invert(), cc);
            assert_ne!(cc.invert(), cc);
        }
        assert_eq!(CondCode::Lt.invert(), CondCode::Ge);
        assert_eq!(CondCode::Le.to_unsigned(), CondCode::Be);
        assert_eq!(CondCode::Eq.to_unsigned(), CondCode::Eq);
    }
}
