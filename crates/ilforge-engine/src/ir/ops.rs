//! Operand validity tables
//!
//! Which computational types each family of stack operations accepts and
//! what it produces. `None` means the combination is not valid bytecode.

use crate::metadata::ElementType;

use super::node::{BinOp, CondCode};
use super::types::Ct;

/// Result type of `add`, `sub`, `mul`, `div` and `rem` (non-overflow, signed)
pub fn binary_numeric(op: BinOp, a: Ct, b: Ct) -> Option<Ct> {
    use Ct::*;
    match (a, b) {
        (Int32, Int32) => Some(Int32),
        (Int32, IntPtr) | (IntPtr, Int32) | (IntPtr, IntPtr) => Some(IntPtr),
        (Int64, Int64) => Some(Int64),
        (Float, Float) if op != BinOp::Rem => Some(Float),
        (Float, Float) => None,
        (Ref, Int32) | (Ref, IntPtr) if matches!(op, BinOp::Add | BinOp::Sub) => Some(Ref),
        (Int32, Ref) | (IntPtr, Ref) if op == BinOp::Add => Some(Ref),
        (Ref, Ref) if op == BinOp::Sub => Some(IntPtr),
        _ => None,
    }
}

/// Result type of the integer-only operations (`and`, `or`, `xor`, `div.un`,
/// `rem.un`)
pub fn integer_op(a: Ct, b: Ct) -> Option<Ct> {
    use Ct::*;
    match (a, b) {
        (Int32, Int32) => Some(Int32),
        (Int32, IntPtr) | (IntPtr, Int32) | (IntPtr, IntPtr) => Some(IntPtr),
        (Int64, Int64) => Some(Int64),
        _ => None,
    }
}

/// Result type of the overflow-checked arithmetic (`add.ovf`, `mul.ovf.un`, ...)
pub fn overflow_arith(op: BinOp, unsigned: bool, a: Ct, b: Ct) -> Option<Ct> {
    use Ct::*;
    if let Some(ct) = integer_op(a, b) {
        return Some(ct);
    }
    if !unsigned {
        return None;
    }
    match (a, b) {
        (Ref, Int32) | (Ref, IntPtr) if matches!(op, BinOp::Add | BinOp::Sub) => Some(Ref),
        (Int32, Ref) | (IntPtr, Ref) if op == BinOp::Add => Some(Ref),
        (Ref, Ref) if op == BinOp::Sub => Some(IntPtr),
        _ => None,
    }
}

/// Result type of any binary arithmetic or logic opcode
pub fn binary(op: BinOp, unsigned: bool, overflow: bool, a: Ct, b: Ct) -> Option<Ct> {
    if overflow {
        overflow_arith(op, unsigned, a, b)
    } else if op.is_bitwise() || unsigned {
        integer_op(a, b)
    } else {
        binary_numeric(op, a, b)
    }
}

/// Result type of `shl`, `shr`, `shr.un`
pub fn shift(value: Ct, amount: Ct) -> Option<Ct> {
    use Ct::*;
    match (value, amount) {
        (Int32 | Int64 | IntPtr, Int32 | IntPtr) => Some(value),
        _ => None,
    }
}

/// Result type of `neg`
pub fn neg(a: Ct) -> Option<Ct> {
    matches!(a, Ct::Int32 | Ct::Int64 | Ct::IntPtr | Ct::Float).then_some(a)
}

/// Result type of `not`
pub fn not(a: Ct) -> Option<Ct> {
    matches!(a, Ct::Int32 | Ct::Int64 | Ct::IntPtr).then_some(a)
}

/// Whether two items can be compared with `cc` (`ceq`, `cgt`, `beq`, ...)
pub fn comparable(cc: CondCode, a: Ct, b: Ct) -> bool {
    use Ct::*;
    let equality = matches!(cc, CondCode::Eq | CondCode::Ne);
    match (a, b) {
        (Int32, Int32) | (Int64, Int64) | (Float, Float) => true,
        (Int32, IntPtr) | (IntPtr, Int32) | (IntPtr, IntPtr) => true,
        (Ref, Ref) => true,
        (Ref, IntPtr) | (IntPtr, Ref) => equality,
        // `cgt.un` against null is the idiomatic non-null test
        (Object, Object) => equality || cc == CondCode::A,
        _ => false,
    }
}

/// Computational type produced by a conversion to `to`
pub fn conv_result(to: ElementType) -> Option<Ct> {
    match to {
        ElementType::I1
        | ElementType::U1
        | ElementType::I2
        | ElementType::U2
        | ElementType::I4
        | ElementType::U4
        | ElementType::Boolean
        | ElementType::Char => Some(Ct::Int32),
        ElementType::I8 | ElementType::U8 => Some(Ct::Int64),
        ElementType::I | ElementType::U => Some(Ct::IntPtr),
        ElementType::R4 | ElementType::R8 => Some(Ct::Float),
        _ => None,
    }
}

/// Result type of `conv.*` from `from` to `to`
pub fn conv(from: Ct, to: ElementType) -> Option<Ct> {
    let result = conv_result(to)?;
    match from {
        Ct::Int32 | Ct::Int64 | Ct::IntPtr | Ct::Float => Some(result),
        Ct::Ref | Ct::Object => matches!(
            to,
            ElementType::I | ElementType::U | ElementType::I8 | ElementType::U8
        )
        .then_some(result),
        Ct::Vt | Ct::Void => None,
    }
}

/// Bounds of an integer conversion target as (signed bits, is signed)
pub fn int_target_bits(to: ElementType, pointer_size: u32) -> Option<(u32, bool)> {
    Some(match to {
        ElementType::I1 => (8, true),
        ElementType::U1 | ElementType::Boolean => (8, false),
        ElementType::I2 => (16, true),
        ElementType::U2 | ElementType::Char => (16, false),
        ElementType::I4 => (32, true),
        ElementType::U4 => (32, false),
        ElementType::I8 => (64, true),
        ElementType::U8 => (64, false),
        ElementType::I => (pointer_size * 8, true),
        ElementType::U => (pointer_size * 8, false),
        _ => return None,
    })
}

/// Whether an overflow-checked conversion of `v` succeeds. `v` is the source
/// value extended to 64 bits, `unsigned_source` tells how it was extended.
pub fn conv_ovf_in_range(v: i64, unsigned_source: bool, bits: u32, signed_target: bool) -> bool {
    if unsigned_source && v < 0 && (signed_target || bits < 64) {
        return false;
    }
    if bits >= 64 {
        return unsigned_source || signed_target || v >= 0;
    }
    truncate(v, bits, signed_target) == v
}

/// Value of an integer constant after a non-checking conversion to a target
/// of `bits` bits
pub fn truncate(v: i64, bits: u32, signed_target: bool) -> i64 {
    if bits >= 64 {
        v
    } else if signed_target {
        (v << (64 - bits)) >> (64 - bits)
    } else {
        ((v as u64) << (64 - bits) >> (64 - bits)) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_numeric_table() {
        assert_eq!(binary_numeric(BinOp::Add, Ct::Int32, Ct::Int32), Some(Ct::Int32));
        assert_eq!(binary_numeric(BinOp::Add, Ct::Int32, Ct::IntPtr), Some(Ct::IntPtr));
        assert_eq!(binary_numeric(BinOp::Add, Ct::Int32, Ct::Int64), None);
        assert_eq!(binary_numeric(BinOp::Add, Ct::Ref, Ct::Int32), Some(Ct::Ref));
        assert_eq!(binary_numeric(BinOp::Mul, Ct::Ref, Ct::Int32), None);
        assert_eq!(binary_numeric(BinOp::Sub, Ct::Ref, Ct::Ref), Some(Ct::IntPtr));
        assert_eq!(binary_numeric(BinOp::Add, Ct::Ref, Ct::Ref), None);
        assert_eq!(binary_numeric(BinOp::Div, Ct::Float, Ct::Float), Some(Ct::Float));
        assert_eq!(binary_numeric(BinOp::Rem, Ct::Float, Ct::Float), None);
        assert_eq!(binary_numeric(BinOp::Add, Ct::Object, Ct::Int32), None);
    }

    #[test]
    fn test_integer_and_shift_tables() {
        assert_eq!(binary(BinOp::And, false, false, Ct::Int64, Ct::Int64), Some(Ct::Int64));
        assert_eq!(binary(BinOp::And, false, false, Ct::Float, Ct::Float), None);
        assert_eq!(binary(BinOp::Div, true, false, Ct::Float, Ct::Float), None);
        assert_eq!(binary(BinOp::Add, true, true, Ct::Ref, Ct::IntPtr), Some(Ct::Ref));
        assert_eq!(binary(BinOp::Add, false, true, Ct::Ref, Ct::IntPtr), None);
        assert_eq!(shift(Ct::Int64, Ct::Int32), Some(Ct::Int64));
        assert_eq!(shift(Ct::Int32, Ct::Int64), None);
        assert_eq!(neg(Ct::Float), Some(Ct::Float));
        assert_eq!(not(Ct::Float), None);
    }

    #[test]
    fn test_comparisons_and_conversions() {
        assert!(comparable(CondCode::Lt, Ct::Int32, Ct::IntPtr));
        assert!(!comparable(CondCode::Lt, Ct::Int32, Ct::Int64));
        assert!(comparable(CondCode::Eq, Ct::Object, Ct::Object));
        assert!(comparable(CondCode::A, Ct::Object, Ct::Object));
        assert!(!comparable(CondCode::Lt, Ct::Object, Ct::Object));
        assert_eq!(conv(Ct::Float, ElementType::U1), Some(Ct::Int32));
        assert_eq!(conv(Ct::Object, ElementType::I), Some(Ct::IntPtr));
        assert_eq!(conv(Ct::Object, ElementType::I4), None);
        assert_eq!(conv(Ct::Int32, ElementType::String), None);
    }

    #[test]
    fn test_overflow_conversion_ranges() {
        assert!(conv_ovf_in_range(127, false, 8, true));
        assert!(!conv_ovf_in_range(128, false, 8, true));
        assert!(conv_ovf_in_range(-128, false, 8, true));
        assert!(conv_ovf_in_range(255, false, 8, false));
        assert!(!conv_ovf_in_range(-1, false, 8, false));
        assert!(!conv_ovf_in_range(-1, false, 64, false));
        // 0xffff_ffff_ffff_ffff read as unsigned does not fit i64
        assert!(!conv_ovf_in_range(-1, true, 64, true));
        assert!(conv_ovf_in_range(-1, true, 64, false));
        assert!(conv_ovf_in_range(i64::MIN, false, 64, true));
    }
}
