//! Instruction stream decoder
//!
//! Turns the code bytes of a method body into [`CilNode`]s with parsed
//! operands, absolute branch targets and successor offsets.

use rustc_hash::{FxHashMap, FxHashSet};

use super::header::ExceptionHeader;
use super::opcodes::{self, Opcode, OperandKind, PREFIX};
use super::DecodeError;
use crate::ir::IrNode;

/// Decoded inline operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    /// Integer constant (`ldc.i4*`, `ldc.i8`)
    Int(i64),
    /// Floating point constant
    Float(f64),
    /// Metadata token
    Token(u32),
    /// Local or argument index
    Var(u16),
    /// Absolute branch target
    Target(u32),
    /// Absolute switch targets
    Switch(Vec<u32>),
}

/// One decoded instruction and the IR generated for it
#[derive(Debug, Clone)]
pub struct CilNode {
    /// Offset of the opcode within the code
    pub offset: u32,
    pub opcode: Opcode,
    pub operand: Operand,
    /// Encoded size including operands
    pub size: u32,
    /// Offsets control may flow to after this instruction
    pub successors: Vec<u32>,
    /// Whether this instruction starts a basic block
    pub block_start: bool,
    /// IR nodes produced for this instruction
    pub ir: Vec<IrNode>,
}

impl CilNode {
    /// Offset of the following instruction
    pub fn next_offset(&self) -> u32 {
        self.offset + self.size
    }
}

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let b = self
            .code
            .get(self.pos..self.pos + N)
            .ok_or(DecodeError::UnexpectedEnd(self.pos))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.bytes()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.bytes()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.bytes()?))
    }
}

fn branch_target(offset: u32, next: usize, disp: i64) -> Result<u32, DecodeError> {
    let target = next as i64 + disp;
    u32::try_from(target).map_err(|_| DecodeError::InvalidBranchTarget { offset, target })
}

/// Implicit constant of the short `ldc.i4.*` forms
fn short_constant(op: Opcode) -> Option<i64> {
    Some(match op {
        Opcode::LdcI4M1 => -1,
        Opcode::LdcI40 => 0,
        Opcode::LdcI41 => 1,
        Opcode::LdcI42 => 2,
        Opcode::LdcI43 => 3,
        Opcode::LdcI44 => 4,
        Opcode::LdcI45 => 5,
        Opcode::LdcI46 => 6,
        Opcode::LdcI47 => 7,
        Opcode::LdcI48 => 8,
        _ => return None,
    })
}

/// Decode every instruction of a method's code
pub fn decode(code: &[u8]) -> Result<Vec<CilNode>, DecodeError> {
    let mut nodes = Vec::new();
    let mut r = Reader { code, pos: 0 };

    while r.pos < code.len() {
        let offset = r.pos as u32;
        let first = r.u8()?;
        let value = if first == PREFIX {
            0xfe00 | u16::from(r.u8()?)
        } else {
            u16::from(first)
        };
        let opcode = Opcode::from_u16(value).ok_or(if opcodes::is_defined(value) {
            DecodeError::UnsupportedOpcode { value, offset }
        } else {
            DecodeError::InvalidOpcode { value, offset }
        })?;

        let operand = match opcode.operand_kind() {
            OperandKind::None => match short_constant(opcode) {
                Some(c) => Operand::Int(c),
                None => Operand::None,
            },
            OperandKind::ShortVar => Operand::Var(u16::from(r.u8()?)),
            OperandKind::Var => Operand::Var(r.u16()?),
            OperandKind::ShortI => Operand::Int(i64::from(r.u8()? as i8)),
            OperandKind::I32 => Operand::Int(i64::from(r.i32()?)),
            OperandKind::I64 => Operand::Int(i64::from_le_bytes(r.bytes()?)),
            OperandKind::R4 => Operand::Float(f64::from(f32::from_le_bytes(r.bytes()?))),
            OperandKind::R8 => Operand::Float(f64::from_le_bytes(r.bytes()?)),
            OperandKind::Token => Operand::Token(r.u32()?),
            OperandKind::ShortBranch => {
                let disp = i64::from(r.u8()? as i8);
                Operand::Target(branch_target(offset, r.pos, disp)?)
            }
            OperandKind::Branch => {
                let disp = i64::from(r.i32()?);
                Operand::Target(branch_target(offset, r.pos, disp)?)
            }
            OperandKind::Switch => {
                let count = r.u32()? as usize;
                let next = count
                    .checked_mul(4)
                    .and_then(|n| r.pos.checked_add(n))
                    .filter(|&end| end <= code.len())
                    .ok_or(DecodeError::UnexpectedEnd(r.pos))?;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    let disp = i64::from(r.i32()?);
                    targets.push(branch_target(offset, next, disp)?);
                }
                Operand::Switch(targets)
            }
        };

        let next = r.pos as u32;
        let mut successors = match &operand {
            Operand::Target(t) => vec![*t],
            Operand::Switch(ts) => ts.clone(),
            _ => Vec::new(),
        };
        if !opcode.is_unconditional_transfer() {
            successors.push(next);
        }

        nodes.push(CilNode {
            offset,
            opcode,
            operand,
            size: next - offset,
            successors,
            block_start: false,
            ir: Vec::new(),
        });
    }

    validate_targets(&nodes, code.len() as u32)?;
    Ok(nodes)
}

fn validate_targets(nodes: &[CilNode], code_len: u32) -> Result<(), DecodeError> {
    let starts: FxHashSet<u32> = nodes.iter().map(|n| n.offset).collect();
    for n in nodes {
        for &s in &n.successors {
            // falling off the end is only an error if it is actually reached,
            // which the IR builder reports
            if s == code_len && s == n.next_offset() {
                continue;
            }
            if !starts.contains(&s) {
                return Err(DecodeError::InvalidBranchTarget {
                    offset: n.offset,
                    target: i64::from(s),
                });
            }
        }
    }
    Ok(())
}

/// Map from instruction offset to node index
pub fn offset_map(nodes: &[CilNode]) -> FxHashMap<u32, usize> {
    nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.offset, i))
        .collect()
}

/// Flag instructions that begin a basic block: the first instruction, branch
/// targets, instructions after a branch, and protected region and handler starts
pub fn mark_block_starts(nodes: &mut [CilNode], clauses: &[ExceptionHeader]) {
    let mut starts: FxHashSet<u32> = FxHashSet::default();
    if let Some(first) = nodes.first() {
        starts.insert(first.offset);
    }
    for n in nodes.iter() {
        if n.opcode.is_branch() || n.opcode.is_unconditional_transfer() {
            starts.extend(n.successors.iter().copied());
            starts.insert(n.next_offset());
        }
    }
    for c in clauses {
        starts.insert(c.try_offset);
        starts.insert(c.handler_offset);
        if let Some(f) = c.filter_offset {
            starts.insert(f);
        }
    }
    for n in nodes.iter_mut() {
        n.block_start = starts.contains(&n.offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_operands() {
        // ldc.i4.s -3; ldc.i4 1000; ldarg.1; ldloc.s 7; call 0x0a000001; ret
        let code = [
            0x1f, 0xfd, 0x20, 0xe8, 0x03, 0x00, 0x00, 0x03, 0x11, 0x07, 0x28, 0x01, 0x00, 0x00,
            0x0a, 0x2a,
        ];
        let nodes = decode(&code).unwrap();
        assert_eq!(nodes.len(), 6);
        assert_eq!(nodes[0].operand, Operand::Int(-3));
        assert_eq!(nodes[1].operand, Operand::Int(1000));
        assert_eq!(nodes[1].offset, 2);
        assert_eq!(nodes[2].opcode, Opcode::Ldarg1);
        assert_eq!(nodes[3].operand, Operand::Var(7));
        assert_eq!(nodes[4].operand, Operand::Token(0x0a00_0001));
        assert_eq!(nodes[5].opcode, Opcode::Ret);
        assert!(nodes[5].successors.is_empty());
    }

    #[test]
    fn test_decode_branches() {
        // 0: ldarg.0; 1: brtrue.s +1 -> 4; 3: ret; 4: ldc.i4.1; 5: pop; 6: ret
        let code = [0x02, 0x2d, 0x01, 0x2a, 0x17, 0x26, 0x2a];
        let mut nodes = decode(&code).unwrap();
        assert_eq!(nodes[1].operand, Operand::Target(4));
        assert_eq!(nodes[1].successors, vec![4, 3]);
        assert_eq!(nodes[3].operand, Operand::Int(1));
        mark_block_starts(&mut nodes, &[]);
        let starts: Vec<u32> = nodes
            .iter()
            .filter(|n| n.block_start)
            .map(|n| n.offset)
            .collect();
        assert_eq!(starts, vec![0, 3, 4]);
    }

    #[test]
    fn test_decode_switch_and_prefixed() {
        // 0: ldarg.0; 1: switch (2) [+0, +1]; 14: nop; 15: ret
        let code = [
            0x02, 0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
            0x00, 0x2a,
        ];
        let nodes = decode(&code).unwrap();
        assert_eq!(nodes[1].operand, Operand::Switch(vec![14, 15]));
        assert_eq!(nodes[1].successors, vec![14, 15, 14]);

        let nodes = decode(&[0x02, 0x02, 0xfe, 0x01, 0x2a]).unwrap();
        assert_eq!(nodes[2].opcode, Opcode::Ceq);
        assert_eq!(nodes[2].size, 2);
    }

    #[test]
    fn test_invalid_opcode_and_target() {
        assert!(matches!(
            decode(&[0x24]),
            Err(DecodeError::InvalidOpcode { value: 0x24, offset: 0 })
        ));
        // break is a real instruction that is not compiled
        assert!(matches!(
            decode(&[0x00, 0x01]),
            Err(DecodeError::UnsupportedOpcode { value: 0x01, offset: 1 })
        ));
        assert!(matches!(
            decode(&[0xfe, 0x08]),
            Err(DecodeError::InvalidOpcode { value: 0xfe08, offset: 0 })
        ));
        assert!(matches!(
            decode(&[0x2b, 0x02, 0x00, 0x2a]),
            Err(DecodeError::InvalidBranchTarget { offset: 0, target: 4 })
        ));
        assert!(matches!(decode(&[0x20, 0x01]), Err(DecodeError::UnexpectedEnd(1))));
    }

    #[test]
    fn test_switch_count_past_end() {
        // switch claiming 0x7fffffff targets with none present
        assert!(matches!(
            decode(&[0x45, 0xff, 0xff, 0xff, 0x7f]),
            Err(DecodeError::UnexpectedEnd(5))
        ));
        // two targets declared, one present
        assert!(matches!(
            decode(&[0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]),
            Err(DecodeError::UnexpectedEnd(5))
        ));
    }
}
