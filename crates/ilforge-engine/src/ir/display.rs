//! Textual IR dumps

use std::fmt::{self, Write as _};

use crate::code::Code;

use super::node::{IrNode, IrOp};

impl fmt::Display for IrOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrOp::Enter => f.write_str("enter"),
            IrOp::EnterHandler { clause, filter } => {
                let what = if *filter { "filter" } else { "handler" };
                write!(f, "enter_{} #{}", what, clause)
            }
            IrOp::Nop => f.write_str("nop"),
            IrOp::Ldc(v) => write!(f, "ldc {}", v),
            IrOp::LdcR(v) => write!(f, "ldc.r {}", v),
            IrOp::LdLabAddr { symbol, addend } if *addend == 0 => write!(f, "ldlabaddr {}", symbol),
            IrOp::LdLabAddr { symbol, addend } => write!(f, "ldlabaddr {}{:+}", symbol, addend),
            IrOp::LdLoc(n) => write!(f, "ldloc {}", n),
            IrOp::StLoc(n) => write!(f, "stloc {}", n),
            IrOp::LdLoca(n) => write!(f, "ldloca {}", n),
            IrOp::LdArg(n) => write!(f, "ldarg {}", n),
            IrOp::StArg(n) => write!(f, "starg {}", n),
            IrOp::LdArga(n) => write!(f, "ldarga {}", n),
            IrOp::Pick(n) => write!(f, "pick {}", n),
            IrOp::Nip(n) => write!(f, "nip {}", n),
            IrOp::Pop => f.write_str("pop"),
            IrOp::Bin {
                op,
                unsigned,
                overflow,
            } => {
                f.write_str(op.name())?;
                if *overflow {
                    f.write_str(".ovf")?;
                }
                if *unsigned {
                    f.write_str(".un")?;
                }
                Ok(())
            }
            IrOp::Shift(op) => f.write_str(op.name()),
            IrOp::Neg => f.write_str("neg"),
            IrOp::Not => f.write_str("not"),
            IrOp::Conv {
                to,
                unsigned,
                overflow,
            } => {
                f.write_str("conv")?;
                if *overflow {
                    f.write_str(".ovf")?;
                }
                write!(f, " {:?}", to)?;
                if *unsigned {
                    f.write_str(".un")?;
                }
                Ok(())
            }
            IrOp::Cmp(cc) => write!(f, "cmp.{}", cc.name()),
            IrOp::Br(t) => write!(f, "br IL_{:04x}", t),
            IrOp::BrIf { cc, target } => write!(f, "b{} IL_{:04x}", cc.name(), target),
            IrOp::BrZero { nonzero, target } => {
                let name = if *nonzero { "brtrue" } else { "brfalse" };
                write!(f, "{} IL_{:04x}", name, target)
            }
            IrOp::Switch(targets) => {
                f.write_str("switch")?;
                for t in targets {
                    write!(f, " IL_{:04x}", t)?;
                }
                Ok(())
            }
            IrOp::Call { symbol, nparams } => write!(f, "call {} ({})", symbol, nparams),
            IrOp::CallVirt { slot, nparams } => write!(f, "callvirt [{}] ({})", slot, nparams),
            IrOp::CallInterface {
                iface,
                slot,
                nparams,
            } => write!(f, "callinterface {}[{}] ({})", iface, slot, nparams),
            IrOp::CallI { nparams } => write!(f, "calli ({})", nparams),
            IrOp::Ret => f.write_str("ret"),
            IrOp::LdInd { size, signed } => {
                write!(f, "ldind.{}{}", if *signed { "i" } else { "u" }, size)
            }
            IrOp::StInd { size } => write!(f, "stind.{}", size),
            IrOp::LdVtField {
                offset,
                size,
                signed,
            } => write!(
                f,
                "ldvtfield +{} .{}{}",
                offset,
                if *signed { "i" } else { "u" },
                size
            ),
            IrOp::LocAlloc => f.write_str("localloc"),
            IrOp::ZeroMem { size } => write!(f, "zeromem {}", size),
            IrOp::CallFinally(c) => write!(f, "callfinally #{}", c),
            IrOp::EndFinally => f.write_str("endfinally"),
            IrOp::EndFilter => f.write_str("endfilter"),
            IrOp::LeaveHandler(t) => write!(f, "leavehandler IL_{:04x}", t),
        }
    }
}

impl fmt::Display for IrNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<40} {:<6} {} -> {}",
            self.op.to_string(),
            self.ct.to_string(),
            self.stack_before,
            self.stack_after
        )
    }
}

/// Render the IR of a method, one instruction per block of lines
pub fn dump(code: &Code) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}:", code.symbol);
    for node in &code.nodes {
        let mark = if node.block_start { "*" } else { " " };
        let _ = writeln!(out, "{}IL_{:04x}: {}", mark, node.offset, node.opcode);
        for ir in &node.ir {
            let _ = writeln!(out, "        {}", ir);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::node::{BinOp, CondCode};

    #[test]
    fn test_op_display() {
        let add = IrOp::Bin {
            op: BinOp::Add,
            unsigned: true,
            overflow: true,
        };
        assert_eq!(add.to_string(), "add.ovf.un");
        assert_eq!(
            IrOp::BrIf {
                cc: CondCode::Lt,
                target: 0x12
            }
            .to_string(),
            "blt IL_0012"
        );
        assert_eq!(
            IrOp::LdLabAddr {
                symbol: "s".into(),
                addend: 16
            }
            .to_string(),
            "ldlabaddr s+16"
        );
        assert_eq!(IrOp::LdInd { size: 4, signed: false }.to_string(), "ldind.u4");
    }
}
