//! Array element addressing
//!
//! The element address of `a[i1, .., iR]` is
//! `data + ((..((i1 - lb1) * size2 + (i2 - lb2))..) * sizeR + (iR - lbR)) * elem_size`.
//! The expression is built symbolically first. Lower bounds, extents and
//! indices that are known statically fold away, so a zero-based rank-1 access
//! carries no arithmetic beyond the scaling. The folded expression is then
//! emitted as IR; loads, stores and address-of all share the same emission.

use crate::layout::TargetLayout;
use crate::metadata::{ArrayShape, ElementType};

use super::node::{BinOp, IrOp};
use super::types::Ct;

/// Symbolic address arithmetic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Const(i64),
    /// Index operand of dimension `r`
    Index(u32),
    /// Run-time lower bound of dimension `r`
    LoBound(u32),
    /// Run-time extent of dimension `r`
    Size(u32),
    /// Element data pointer of the array
    DataPtr,
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn sub(a: Expr, b: Expr) -> Expr {
        match (a, b) {
            (a, Expr::Const(0)) => a,
            (Expr::Const(x), Expr::Const(y)) => Expr::Const(x.wrapping_sub(y)),
            (a, b) => Expr::Sub(Box::new(a), Box::new(b)),
        }
    }

    pub fn mul(a: Expr, b: Expr) -> Expr {
        match (a, b) {
            (a, Expr::Const(1)) | (Expr::Const(1), a) => a,
            (Expr::Const(0), _) | (_, Expr::Const(0)) => Expr::Const(0),
            (Expr::Const(x), Expr::Const(y)) => Expr::Const(x.wrapping_mul(y)),
            (a, b) => Expr::Mul(Box::new(a), Box::new(b)),
        }
    }

    pub fn add(a: Expr, b: Expr) -> Expr {
        match (a, b) {
            (a, Expr::Const(0)) | (Expr::Const(0), a) => a,
            (Expr::Const(x), Expr::Const(y)) => Expr::Const(x.wrapping_add(y)),
            (a, b) => Expr::Add(Box::new(a), Box::new(b)),
        }
    }

    /// Number of arithmetic operations left after folding
    pub fn op_count(&self) -> usize {
        match self {
            Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Add(a, b) => 1 + a.op_count() + b.op_count(),
            _ => 0,
        }
    }
}

/// Linear element index for the given indices; `consts[r]` holds the index of
/// dimension `r` when it is a known constant
pub fn linear_index(shape: &ArrayShape, consts: &[Option<i64>]) -> Expr {
    let index = |r: usize| match consts.get(r).copied().flatten() {
        Some(c) => Expr::Const(c),
        None => Expr::Index(r as u32),
    };
    let lobound = |r: usize| match shape.static_lobound(r) {
        Some(lb) => Expr::Const(i64::from(lb)),
        None => Expr::LoBound(r as u32),
    };
    let mut idx = Expr::sub(index(0), lobound(0));
    for r in 1..shape.rank as usize {
        let size = match shape.static_size(r) {
            Some(s) => Expr::Const(i64::from(s)),
            None => Expr::Size(r as u32),
        };
        idx = Expr::add(Expr::mul(idx, size), Expr::sub(index(r), lobound(r)));
    }
    idx
}

/// Element address expression
pub fn element_address(shape: &ArrayShape, consts: &[Option<i64>], elem_size: u32) -> Expr {
    Expr::add(
        Expr::DataPtr,
        Expr::mul(linear_index(shape, consts), Expr::Const(i64::from(elem_size))),
    )
}

/// Kind of element access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Get,
    Set,
    Address,
}

/// Element type facts needed for the final load or store
#[derive(Debug, Clone, Copy)]
pub struct ElemInfo {
    pub size: u32,
    pub ct: Ct,
    pub signed: bool,
}

/// Where the operands sit, as distances from the top of the stack before the
/// access (0 is the top)
struct Operands {
    array: u32,
    indices: Vec<u32>,
}

struct Emitter<'a> {
    target: &'a TargetLayout,
    operands: Operands,
    /// Items pushed so far on top of the operands
    extra: u32,
    out: Vec<(IrOp, Ct)>,
}

impl Emitter<'_> {
    fn push(&mut self, op: IrOp, ct: Ct) {
        self.out.push((op, ct));
    }

    fn ldc(&mut self, v: i64) {
        self.push(IrOp::Ldc(v), Ct::IntPtr);
        self.extra += 1;
    }

    fn binop(&mut self, op: BinOp, ct: Ct) {
        self.push(
            IrOp::Bin {
                op,
                unsigned: false,
                overflow: false,
            },
            ct,
        );
        self.extra -= 1;
    }

    fn pick_array(&mut self) {
        self.push(IrOp::Pick(self.operands.array + self.extra), Ct::Object);
        self.extra += 1;
    }

    /// Replace the pointer on top with the pointer-sized field at `offset`
    fn load_pointer_field(&mut self, offset: u32, ct: Ct) {
        if offset != 0 {
            self.ldc(i64::from(offset));
            self.binop(BinOp::Add, Ct::IntPtr);
        }
        self.push(
            IrOp::LdInd {
                size: self.target.pointer_size,
                signed: false,
            },
            ct,
        );
    }

    /// Entry `r` of the lobounds or sizes side array, widened to a native int
    fn load_bound(&mut self, field: u32, r: u32) {
        self.pick_array();
        self.load_pointer_field(field, Ct::IntPtr);
        if r != 0 {
            self.ldc(i64::from(r) * 4);
            self.binop(BinOp::Add, Ct::IntPtr);
        }
        self.push(IrOp::LdInd { size: 4, signed: true }, Ct::Int32);
        self.widen();
    }

    fn widen(&mut self) {
        self.push(
            IrOp::Conv {
                to: ElementType::I,
                unsigned: false,
                overflow: false,
            },
            Ct::IntPtr,
        );
    }

    fn emit(&mut self, e: &Expr, ct: Ct) {
        match e {
            Expr::Const(c) => {
                self.push(IrOp::Ldc(*c), ct);
                self.extra += 1;
            }
            Expr::Index(r) => {
                let dist = self.operands.indices[*r as usize] + self.extra;
                self.push(IrOp::Pick(dist), Ct::Int32);
                self.extra += 1;
                self.widen();
            }
            Expr::LoBound(r) => self.load_bound(self.target.array.lobounds, *r),
            Expr::Size(r) => self.load_bound(self.target.array.sizes, *r),
            Expr::DataPtr => {
                self.pick_array();
                self.load_pointer_field(self.target.array.data, ct);
            }
            Expr::Sub(a, b) => self.emit_bin(BinOp::Sub, a, b, ct),
            Expr::Mul(a, b) => self.emit_bin(BinOp::Mul, a, b, ct),
            Expr::Add(a, b) => self.emit_bin(BinOp::Add, a, b, ct),
        }
    }

    fn emit_bin(&mut self, op: BinOp, a: &Expr, b: &Expr, ct: Ct) {
        self.emit(a, Ct::IntPtr);
        self.emit(b, Ct::IntPtr);
        self.binop(op, ct);
    }
}

/// IR for an element access. The stack holds the array, the `rank` indices
/// and, for [`Access::Set`], the value; afterwards it holds the element value,
/// the element address or nothing. Every op carries its result type.
pub fn lower_access(
    shape: &ArrayShape,
    access: Access,
    elem: ElemInfo,
    consts: &[Option<i64>],
    target: &TargetLayout,
) -> Vec<(IrOp, Ct)> {
    let rank = shape.rank;
    let value = u32::from(access == Access::Set);
    let operands = Operands {
        array: rank + value,
        indices: (0..rank).map(|r| rank - 1 - r + value).collect(),
    };
    let mut em = Emitter {
        target,
        operands,
        extra: 0,
        out: Vec::new(),
    };
    let addr = element_address(shape, consts, elem.size);
    em.emit(&addr, Ct::Ref);

    match access {
        Access::Get => {
            em.push(
                IrOp::LdInd {
                    size: elem.size,
                    signed: elem.signed,
                },
                elem.ct,
            );
            em.push(IrOp::Nip(rank + 1), elem.ct);
        }
        Access::Address => em.push(IrOp::Nip(rank + 1), Ct::Ref),
        Access::Set => {
            em.push(IrOp::Pick(1), elem.ct);
            em.push(IrOp::StInd { size: elem.size }, elem.ct);
            for _ in 0..rank + 2 {
                em.push(IrOp::Pop, Ct::Void);
            }
        }
    }
    em.out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::TypeSpec;
    use rustc_hash::FxHashMap;

    fn i4() -> TypeSpec {
        TypeSpec::Primitive(ElementType::I4)
    }

    fn eval(e: &Expr, idx: &[i64], lb: &[i64], sizes: &[i64], data: i64) -> i64 {
        match e {
            Expr::Const(c) => *c,
            Expr::Index(r) => idx[*r as usize],
            Expr::LoBound(r) => lb[*r as usize],
            Expr::Size(r) => sizes[*r as usize],
            Expr::DataPtr => data,
            Expr::Sub(a, b) => eval(a, idx, lb, sizes, data) - eval(b, idx, lb, sizes, data),
            Expr::Mul(a, b) => eval(a, idx, lb, sizes, data) * eval(b, idx, lb, sizes, data),
            Expr::Add(a, b) => eval(a, idx, lb, sizes, data) + eval(b, idx, lb, sizes, data),
        }
    }

    #[test]
    fn test_static_rank2_folds_to_constant() {
        let shape = ArrayShape {
            elem: i4(),
            rank: 2,
            sizes: vec![3, 4],
            lobounds: vec![2, 0],
        };
        assert_eq!(linear_index(&shape, &[Some(3), Some(2)]), Expr::Const(6));
    }

    #[test]
    fn test_static_rank2_with_dynamic_indices() {
        let shape = ArrayShape {
            elem: i4(),
            rank: 2,
            sizes: vec![3, 4],
            lobounds: vec![2, 0],
        };
        let e = linear_index(&shape, &[None, None]);
        // (i0 - 2) * 4 + i1
        assert_eq!(e.op_count(), 3);
        assert_eq!(eval(&e, &[3, 2], &[], &[], 0), 6);
    }

    #[test]
    fn test_dynamic_bounds_match_recurrence() {
        let shape = ArrayShape::new(i4(), 3);
        let e = linear_index(&shape, &[None, None, None]);
        let lb = [1, -2, 0];
        let sizes = [5, 6, 7];
        let idx = [3, 1, 4];
        let mut expect = idx[0] - lb[0];
        for r in 1..3 {
            expect = expect * sizes[r] + (idx[r] - lb[r]);
        }
        assert_eq!(eval(&e, &idx, &lb, &sizes, 0), expect);
    }

    #[test]
    fn test_zero_based_rank1_has_no_bound_arithmetic() {
        let shape = ArrayShape {
            elem: i4(),
            rank: 1,
            sizes: vec![],
            lobounds: vec![0],
        };
        assert_eq!(linear_index(&shape, &[None]), Expr::Index(0));
        let addr = element_address(&shape, &[None], 1);
        assert_eq!(addr.op_count(), 1);
        let addr = element_address(&shape, &[Some(0)], 8);
        assert_eq!(addr, Expr::DataPtr);
    }

    /// Minimal evaluator for the ops produced by `lower_access`
    fn run(ops: &[(IrOp, Ct)], stack: &mut Vec<i64>, mem: &mut FxHashMap<i64, i64>) {
        for (op, _) in ops {
            match op {
                IrOp::Ldc(c) => stack.push(*c),
                IrOp::Pick(n) => {
                    let v = stack[stack.len() - 1 - *n as usize];
                    stack.push(v);
                }
                IrOp::Nip(n) => {
                    let top = stack.pop().unwrap();
                    for _ in 0..*n {
                        stack.pop();
                    }
                    stack.push(top);
                }
                IrOp::Pop => {
                    stack.pop();
                }
                IrOp::Conv { .. } => {}
                IrOp::Bin { op, .. } => {
                    let b = stack.pop().unwrap();
                    let a = stack.pop().unwrap();
                    stack.push(match op {
                        BinOp::Add => a + b,
                        BinOp::Sub => a - b,
                        BinOp::Mul => a * b,
                        other => panic!("unexpected {:?}", other),
                    });
                }
                IrOp::LdInd { .. } => {
                    let addr = stack.pop().unwrap();
                    stack.push(*mem.get(&addr).unwrap_or(&0));
                }
                IrOp::StInd { .. } => {
                    let v = stack.pop().unwrap();
                    let addr = stack.pop().unwrap();
                    mem.insert(addr, v);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_get_and_set_use_the_same_address() {
        let target = TargetLayout::new(8);
        let shape = ArrayShape {
            elem: i4(),
            rank: 1,
            sizes: vec![],
            lobounds: vec![0],
        };
        let elem = ElemInfo {
            size: 4,
            ct: Ct::Int32,
            signed: true,
        };
        let array = 0x1000;
        let data = 0x2000;
        let mut mem = FxHashMap::default();
        mem.insert(array + i64::from(target.array.data), data);

        let set = lower_access(&shape, Access::Set, elem, &[None], &target);
        let mut stack = vec![array, 5, 77];
        run(&set, &mut stack, &mut mem);
        assert!(stack.is_empty());
        assert_eq!(mem.get(&(data + 5 * 4)), Some(&77));

        let get = lower_access(&shape, Access::Get, elem, &[None], &target);
        let mut stack = vec![array, 5];
        run(&get, &mut stack, &mut mem);
        assert_eq!(stack, vec![77]);

        let addr = lower_access(&shape, Access::Address, elem, &[None], &target);
        let mut stack = vec![array, 5];
        run(&addr, &mut stack, &mut mem);
        assert_eq!(stack, vec![data + 20]);
    }

    #[test]
    fn test_dynamic_rank2_reads_side_arrays() {
        let target = TargetLayout::new(8);
        let shape = ArrayShape::new(TypeSpec::Primitive(ElementType::I8), 2);
        let elem = ElemInfo {
            size: 8,
            ct: Ct::Int64,
            signed: true,
        };
        let (array, data, lobounds, sizes) = (0x1000i64, 0x2000i64, 0x3000i64, 0x4000i64);
        let mut mem = FxHashMap::default();
        mem.insert(array + i64::from(target.array.data), data);
        mem.insert(array + i64::from(target.array.lobounds), lobounds);
        mem.insert(array + i64::from(target.array.sizes), sizes);
        mem.insert(lobounds, 1);
        mem.insert(lobounds + 4, 10);
        mem.insert(sizes, 3);
        mem.insert(sizes + 4, 5);

        let addr = lower_access(&shape, Access::Address, elem, &[None, None], &target);
        let mut stack = vec![array, 2, 12];
        run(&addr, &mut stack, &mut mem);
        assert_eq!(stack, vec![data + ((2 - 1) * 5 + (12 - 10)) * 8]);
    }
}
