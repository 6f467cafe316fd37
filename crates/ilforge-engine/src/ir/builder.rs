//! IR construction
//!
//! Symbolic execution of a decoded method. Instructions are visited along
//! control flow from every entry point with a persistent [`Stack`]; each
//! instruction is visited once, and later arrivals only check that their
//! stack has the same shape. Constants survive within a basic block and are
//! dropped at block starts.

use crate::cil::{
    decode, mark_block_starts, offset_map, parse_body, CilNode, ClauseKind, DecodeError, Opcode,
    Operand,
};
use crate::code::{Code, Entry, EntryKind, LocalVar};
use crate::layout::{Layout, VTABLE_HEADER_SLOTS};
use crate::metadata::{
    method_signature, ArrayMethod, ArrayShape, ElementType, FieldSpec, MetadataError, MethodRef,
    MethodSpec, ModuleId, TokenTarget, TypeKind, TypeSpec,
};
use crate::runtime;
use crate::session::BuildSession;

use super::array::{self, Access, ElemInfo};
use super::node::{BinOp, CondCode, IrNode, IrOp, ShiftOp};
use super::ops;
use super::stack::Stack;
use super::types::{canonical, Ct, StackItem};
use super::IrError;

/// Decode a method body and build its IR
pub fn build(session: &BuildSession, ms: &MethodSpec) -> Result<Code, IrError> {
    let md = session.md();
    let (module, row) = match ms.method {
        MethodRef::Def { module, row } => (module, row),
        MethodRef::Array(_) => return Err(IrError::NoBody),
    };
    let def = md.method_def(module, row)?;
    if def.rva == 0 {
        return Err(IrError::NoBody);
    }
    let body = parse_body(md.method_body(module, def.rva)?)?;
    let mut nodes = decode(body.code)?;
    let mut clauses = body.clauses;

    let type_args = ms.owner.generic_args().to_vec();
    let method_args = ms.args.clone();
    for c in &mut clauses {
        if let Some(token) = c.class_token {
            let ts = md
                .resolve_type(module, token)?
                .substitute(&type_args, &method_args);
            session.request_vtable(&ts)?;
            c.catch_type = Some(ts);
        }
    }
    mark_block_starts(&mut nodes, &clauses);
    let offsets = offset_map(&nodes);

    let layout = session.layout();
    let sig = method_signature(md, ms)?;
    let mut args = Vec::with_capacity(sig.param_count_with_this());
    if sig.has_this {
        let this = if layout.is_value_type(&ms.owner)? {
            ms.owner.clone().managed_ptr()
        } else {
            ms.owner.clone()
        };
        args.push(local_var(&layout, &this)?);
    }
    for p in &sig.params {
        args.push(local_var(&layout, p)?);
    }
    let mut locals = Vec::new();
    if body.header.local_var_sig_tok != 0 {
        for ts in md.local_signature(module, body.header.local_var_sig_tok)? {
            locals.push(local_var(&layout, &ts.substitute(&type_args, &method_args))?);
        }
    }
    let ret = match &sig.ret {
        Some(ts) => Some(local_var(&layout, ts)?),
        None => None,
    };

    let entry_node = |offset: u32| {
        offsets
            .get(&offset)
            .copied()
            .ok_or(DecodeError::InvalidBranchTarget {
                offset,
                target: i64::from(offset),
            })
    };
    let mut entries = Vec::new();
    if !nodes.is_empty() {
        entries.push(Entry {
            node: 0,
            kind: EntryKind::Method,
        });
    }
    for c in &clauses {
        if let Some(f) = c.filter_offset {
            entries.push(Entry {
                node: entry_node(f)?,
                kind: EntryKind::Filter(c.id),
            });
        }
        entries.push(Entry {
            node: entry_node(c.handler_offset)?,
            kind: EntryKind::Handler(c.id),
        });
    }

    let code = Code {
        method: ms.clone(),
        symbol: session.mangler().method(ms)?,
        module,
        header: body.header,
        nodes,
        offsets,
        clauses,
        args,
        locals,
        ret,
        entries,
    };

    let mut b = Builder {
        session,
        layout,
        module,
        type_args,
        method_args,
        code,
        cur: Stack::new(),
        out: Vec::new(),
        offset: 0,
    };
    b.run()?;
    Ok(b.code)
}

fn signedness(layout: &Layout<'_>, ts: &TypeSpec) -> Result<bool, IrError> {
    Ok(match canonical(layout.md, ts) {
        TypeSpec::Primitive(et) => et.is_signed(),
        other => layout
            .enum_underlying(&other)?
            .map(|et| et.is_signed())
            .unwrap_or(false),
    })
}

fn local_var(layout: &Layout<'_>, ts: &TypeSpec) -> Result<LocalVar, IrError> {
    Ok(LocalVar {
        ts: ts.clone(),
        ct: Ct::of(layout, ts)?,
        size: layout.type_size(ts)?,
        signed: signedness(layout, ts)?,
    })
}

/// How control leaves an instruction
enum Flow {
    /// To the instruction's decoded successors with the current stack
    Normal,
    /// To the target of a `leave`, with an empty stack
    Leave(u32),
}

/// Value stored into a freshly allocated array header
enum Init {
    Label(String),
    /// Array object address plus a constant
    ArrayPlus(u32),
    Const(i64),
    /// The requested element count
    Count,
}

/// `System.String` members lowered to loads from the string object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringMember {
    Length,
    Chars,
}

struct Builder<'s> {
    session: &'s BuildSession,
    layout: Layout<'s>,
    module: ModuleId,
    type_args: Vec<TypeSpec>,
    method_args: Vec<TypeSpec>,
    code: Code,
    cur: Stack,
    out: Vec<IrNode>,
    offset: u32,
}

impl<'s> Builder<'s> {
    fn run(&mut self) -> Result<(), IrError> {
        let count = self.code.nodes.len();
        let mut seen: Vec<Option<Stack>> = vec![None; count];
        let mut work: Vec<(usize, Stack)> = Vec::new();

        for entry in self.code.entries.clone() {
            if seen[entry.node].is_some() {
                continue;
            }
            let (stack, succs) = self.lower(entry.node, Stack::new(), Some(entry.kind))?;
            seen[entry.node] = Some(stack);
            work.extend(succs);
        }

        while let Some((idx, stack)) = work.pop() {
            let stack = if self.code.nodes[idx].block_start {
                stack.without_constants()
            } else {
                stack
            };
            if let Some(prev) = &seen[idx] {
                if !prev.same_shape(&stack) {
                    return Err(IrError::StackMismatch {
                        offset: self.code.nodes[idx].offset,
                        expected: prev.to_string(),
                        found: stack.to_string(),
                    });
                }
                continue;
            }
            seen[idx] = Some(stack.clone());
            let (_, succs) = self.lower(idx, stack, None)?;
            work.extend(succs);
        }
        Ok(())
    }

    /// Lower one instruction; returns the stack it started with (after any
    /// entry prologue) and its successors
    fn lower(
        &mut self,
        idx: usize,
        stack: Stack,
        entry: Option<EntryKind>,
    ) -> Result<(Stack, Vec<(usize, Stack)>), IrError> {
        let node: CilNode = self.code.nodes[idx].clone();
        self.cur = stack;
        self.out = Vec::new();
        self.offset = node.offset;

        if let Some(kind) = entry {
            self.prologue(kind)?;
        }
        let start = self.cur.clone();
        let flow = self.instruction(&node)?;
        self.code.nodes[idx].ir = std::mem::take(&mut self.out);

        let mut succs = Vec::new();
        let targets = match flow {
            Flow::Normal => node.successors.iter().map(|&s| (s, self.cur.clone())).collect(),
            Flow::Leave(target) => vec![(target, Stack::new())],
        };
        for (offset, stack) in targets {
            let next = self
                .code
                .node_at(offset)
                .ok_or(IrError::FallThroughEnd { offset: node.offset })?;
            succs.push((next, stack));
        }
        Ok((start, succs))
    }

    fn prologue(&mut self, kind: EntryKind) -> Result<(), IrError> {
        match kind {
            EntryKind::Method => self.node(IrOp::Enter, Ct::Void, 0, None),
            EntryKind::Filter(id) => {
                let exc = self.simple(Ct::Object);
                self.node(
                    IrOp::EnterHandler {
                        clause: id,
                        filter: true,
                    },
                    Ct::Object,
                    0,
                    Some(exc),
                )
            }
            EntryKind::Handler(id) => {
                let clause = &self.code.clauses[id];
                let exc = match clause.kind {
                    ClauseKind::Catch | ClauseKind::Filter => Some(StackItem {
                        ts: clause.catch_type.clone(),
                        ..self.simple(Ct::Object)
                    }),
                    ClauseKind::Finally | ClauseKind::Fault => None,
                };
                let ct = if exc.is_some() { Ct::Object } else { Ct::Void };
                self.node(
                    IrOp::EnterHandler {
                        clause: id,
                        filter: false,
                    },
                    ct,
                    0,
                    exc,
                )
            }
        }
    }

    // ---- primitives ----

    fn p(&self) -> u32 {
        self.layout.pointer_size()
    }

    fn simple(&self, ct: Ct) -> StackItem {
        StackItem::of_ct(ct, self.p())
    }

    fn item(&self, ts: &TypeSpec) -> Result<StackItem, IrError> {
        Ok(StackItem::of_type(&self.layout, ts)?)
    }

    fn ref_item(&self, ts: &TypeSpec) -> StackItem {
        StackItem {
            ts: Some(ts.clone().managed_ptr()),
            ..self.simple(Ct::Ref)
        }
    }

    fn peek(&self, n: usize) -> Result<StackItem, IrError> {
        self.cur
            .peek(n)
            .cloned()
            .ok_or(IrError::StackUnderflow {
                offset: self.offset,
            })
    }

    fn invalid(&self, opcode: Opcode) -> IrError {
        IrError::InvalidOperands {
            offset: self.offset,
            opcode: opcode.name().to_string(),
            operands: self.cur.to_string(),
        }
    }

    fn unsupported(&self, what: impl Into<String>) -> IrError {
        IrError::Unsupported {
            offset: self.offset,
            what: what.into(),
        }
    }

    /// Record a node popping `pops` items and pushing `push`
    fn node(
        &mut self,
        op: IrOp,
        ct: Ct,
        pops: usize,
        push: Option<StackItem>,
    ) -> Result<(), IrError> {
        let before = self.cur.clone();
        let (mut after, _) = before.pop_n(pops).ok_or(IrError::StackUnderflow {
            offset: self.offset,
        })?;
        if let Some(item) = push {
            after = after.push(item);
        }
        self.out.push(IrNode {
            op,
            ct,
            stack_before: before,
            stack_after: after.clone(),
            il_offset: self.offset,
        });
        self.cur = after;
        Ok(())
    }

    /// Record a node whose stack effect follows from the operation and its
    /// result type alone, folding integer constants
    fn apply(&mut self, op: IrOp, ct: Ct) -> Result<(), IrError> {
        let p = self.p();
        match op {
            IrOp::Ldc(v) => {
                let v = if ct == Ct::Int32 {
                    ops::truncate(v, 32, true)
                } else {
                    v
                };
                self.node(IrOp::Ldc(v), ct, 0, Some(StackItem::constant(ct, v, p)))
            }
            IrOp::Pick(n) => {
                let item = self.peek(n as usize)?;
                self.node(op, item.ct, 0, Some(item))
            }
            IrOp::Nip(n) => {
                let top = self.peek(0)?;
                self.node(op, top.ct, n as usize + 1, Some(top))
            }
            IrOp::Pop => {
                let top = self.peek(0)?;
                self.node(op, top.ct, 1, None)
            }
            IrOp::Bin {
                op: bop, overflow, ..
            } => {
                let (a, b) = (self.peek(1)?.constant, self.peek(0)?.constant);
                let folded = match (a, b, overflow) {
                    (Some(a), Some(b), false) => fold(bop, a, b, ct, p),
                    _ => None,
                };
                let item = match folded {
                    Some(v) => StackItem::constant(ct, v, p),
                    None => self.simple(ct),
                };
                self.node(op, ct, 2, Some(item))
            }
            IrOp::Conv {
                to,
                unsigned,
                overflow,
            } => {
                let src = self.peek(0)?;
                let folded = src
                    .constant
                    .filter(|_| src.ct != Ct::Float)
                    .and_then(|v| fold_conv(v, src.ct, to, unsigned, overflow, p));
                let item = match folded {
                    Some(v) => StackItem::constant(ct, v, p),
                    None => self.simple(ct),
                };
                self.node(op, ct, 1, Some(item))
            }
            IrOp::LdInd { size, .. } => {
                let item = if ct == Ct::Vt {
                    StackItem {
                        ts: None,
                        ct,
                        size,
                        constant: None,
                    }
                } else {
                    self.simple(ct)
                };
                self.node(op, ct, 1, Some(item))
            }
            IrOp::StInd { .. } => self.node(op, ct, 2, None),
            other => Err(self.unsupported(format!("generic lowering of {:?}", other))),
        }
    }

    fn subst(&self, ts: &TypeSpec) -> TypeSpec {
        ts.substitute(&self.type_args, &self.method_args)
    }

    fn subst_method(&self, ms: MethodSpec) -> MethodSpec {
        MethodSpec {
            owner: self.subst(&ms.owner),
            method: ms.method,
            args: ms.args.iter().map(|a| self.subst(a)).collect(),
        }
    }

    fn resolve_type(&self, token: u32) -> Result<TypeSpec, IrError> {
        Ok(self.subst(&self.session.md().resolve_type(self.module, token)?))
    }

    fn resolve_method(&self, token: u32) -> Result<MethodSpec, IrError> {
        let ms = self.session.md().resolve_method(self.module, token)?;
        Ok(self.subst_method(ms))
    }

    fn resolve_field(&self, token: u32) -> Result<FieldSpec, IrError> {
        let fs = self.session.md().resolve_field(self.module, token)?;
        Ok(FieldSpec {
            owner: self.subst(&fs.owner),
            ..fs
        })
    }

    /// Size, signedness and computational type of a stored value of `ts`
    fn load_info(&self, ts: &TypeSpec) -> Result<(u32, bool, Ct), IrError> {
        Ok((
            self.layout.type_size(ts)?,
            signedness(&self.layout, ts)?,
            Ct::of(&self.layout, ts)?,
        ))
    }

    // ---- instructions ----

    fn instruction(&mut self, node: &CilNode) -> Result<Flow, IrError> {
        use Opcode::*;
        let op = node.opcode;
        let token = || match node.operand {
            Operand::Token(t) => Ok(t),
            _ => Err(IrError::BadOperand {
                offset: node.offset,
                opcode: op.name().to_string(),
            }),
        };
        let var = || match node.operand {
            Operand::Var(v) => Ok(u32::from(v)),
            _ => Err(IrError::BadOperand {
                offset: node.offset,
                opcode: op.name().to_string(),
            }),
        };
        let target = || match node.operand {
            Operand::Target(t) => Ok(t),
            _ => Err(IrError::BadOperand {
                offset: node.offset,
                opcode: op.name().to_string(),
            }),
        };

        match op {
            Nop => self.node(IrOp::Nop, Ct::Void, 0, None)?,

            Ldarg0 | Ldarg1 | Ldarg2 | Ldarg3 => {
                self.ldarg(u32::from(op.to_u16() - Ldarg0.to_u16()))?
            }
            LdargS | Ldarg => self.ldarg(var()?)?,
            LdargaS | Ldarga => {
                let n = var()?;
                let arg = self.arg(n)?;
                let item = self.ref_item(&arg.ts);
                self.node(IrOp::LdArga(n), Ct::Ref, 0, Some(item))?
            }
            StargS | Starg => {
                let n = var()?;
                let arg = self.arg(n)?;
                self.check_store(op, arg.ct)?;
                self.node(IrOp::StArg(n), arg.ct, 1, None)?
            }
            Ldloc0 | Ldloc1 | Ldloc2 | Ldloc3 => {
                self.ldloc(u32::from(op.to_u16() - Ldloc0.to_u16()))?
            }
            LdlocS | Ldloc => self.ldloc(var()?)?,
            LdlocaS | Ldloca => {
                let n = var()?;
                let local = self.local(n)?;
                let item = self.ref_item(&local.ts);
                self.node(IrOp::LdLoca(n), Ct::Ref, 0, Some(item))?
            }
            Stloc0 | Stloc1 | Stloc2 | Stloc3 => {
                self.stloc(op, u32::from(op.to_u16() - Stloc0.to_u16()))?
            }
            StlocS | Stloc => self.stloc(op, var()?)?,

            Ldnull => self.apply(IrOp::Ldc(0), Ct::Object)?,
            LdcI4M1 | LdcI40 | LdcI41 | LdcI42 | LdcI43 | LdcI44 | LdcI45 | LdcI46 | LdcI47
            | LdcI48 | LdcI4S | LdcI4 => match node.operand {
                Operand::Int(v) => self.apply(IrOp::Ldc(v), Ct::Int32)?,
                _ => return Err(self.bad_operand(op)),
            },
            LdcI8 => match node.operand {
                Operand::Int(v) => self.apply(IrOp::Ldc(v), Ct::Int64)?,
                _ => return Err(self.bad_operand(op)),
            },
            LdcR4 | LdcR8 => match node.operand {
                Operand::Float(v) => {
                    let item = self.simple(Ct::Float);
                    self.node(IrOp::LdcR(v), Ct::Float, 0, Some(item))?
                }
                _ => return Err(self.bad_operand(op)),
            },
            Dup => self.apply(IrOp::Pick(0), Ct::Void)?,
            Pop => self.apply(IrOp::Pop, Ct::Void)?,

            Call => {
                let ms = self.resolve_method(token()?)?;
                self.call(ms, false)?
            }
            Callvirt => {
                let ms = self.resolve_method(token()?)?;
                self.call(ms, true)?
            }
            Calli => self.calli(token()?)?,
            Ldftn => {
                let ms = self.resolve_method(token()?)?;
                let symbol = self.session.request_method(&ms)?;
                let item = self.simple(Ct::IntPtr);
                self.node(IrOp::LdLabAddr { symbol, addend: 0 }, Ct::IntPtr, 0, Some(item))?
            }
            Ret => self.ret(op)?,

            Br | BrS => self.node(IrOp::Br(target()?), Ct::Void, 0, None)?,
            Brfalse | BrfalseS | Brtrue | BrtrueS => {
                let top = self.peek(0)?;
                if !matches!(
                    top.ct,
                    Ct::Int32 | Ct::Int64 | Ct::IntPtr | Ct::Object | Ct::Ref
                ) {
                    return Err(self.invalid(op));
                }
                let nonzero = matches!(op, Brtrue | BrtrueS);
                self.node(
                    IrOp::BrZero {
                        nonzero,
                        target: target()?,
                    },
                    top.ct,
                    1,
                    None,
                )?
            }
            Beq | BeqS | Bge | BgeS | Bgt | BgtS | Ble | BleS | Blt | BltS | BneUn | BneUnS
            | BgeUn | BgeUnS | BgtUn | BgtUnS | BleUn | BleUnS | BltUn | BltUnS => {
                let cc = branch_condition(op);
                let ct = self.compare_type(op, cc)?;
                self.node(
                    IrOp::BrIf {
                        cc,
                        target: target()?,
                    },
                    ct,
                    2,
                    None,
                )?
            }
            Switch => match &node.operand {
                Operand::Switch(targets) => {
                    let top = self.peek(0)?;
                    if !matches!(top.ct, Ct::Int32 | Ct::IntPtr) {
                        return Err(self.invalid(op));
                    }
                    self.node(IrOp::Switch(targets.clone()), top.ct, 1, None)?
                }
                _ => return Err(self.bad_operand(op)),
            },

            LdindI1 | LdindU1 | LdindI2 | LdindU2 | LdindI4 | LdindU4 | LdindI8 | LdindI
            | LdindR4 | LdindR8 | LdindRef => {
                let ts = indirect_type(op);
                self.load_indirect(op, &ts)?
            }
            Ldobj => {
                let ts = self.resolve_type(token()?)?;
                self.load_indirect(op, &ts)?
            }
            StindRef | StindI1 | StindI2 | StindI4 | StindI8 | StindR4 | StindR8 | StindI => {
                let ts = indirect_type(op);
                self.store_indirect(op, &ts)?
            }
            Stobj => {
                let ts = self.resolve_type(token()?)?;
                self.store_indirect(op, &ts)?
            }

            Add => self.binary(op, BinOp::Add, false, false)?,
            Sub => self.binary(op, BinOp::Sub, false, false)?,
            Mul => self.binary(op, BinOp::Mul, false, false)?,
            Div => self.binary(op, BinOp::Div, false, false)?,
            DivUn => self.binary(op, BinOp::Div, true, false)?,
            Rem => self.binary(op, BinOp::Rem, false, false)?,
            RemUn => self.binary(op, BinOp::Rem, true, false)?,
            And => self.binary(op, BinOp::And, false, false)?,
            Or => self.binary(op, BinOp::Or, false, false)?,
            Xor => self.binary(op, BinOp::Xor, false, false)?,
            AddOvf => self.binary(op, BinOp::Add, false, true)?,
            AddOvfUn => self.binary(op, BinOp::Add, true, true)?,
            SubOvf => self.binary(op, BinOp::Sub, false, true)?,
            SubOvfUn => self.binary(op, BinOp::Sub, true, true)?,
            MulOvf => self.binary(op, BinOp::Mul, false, true)?,
            MulOvfUn => self.binary(op, BinOp::Mul, true, true)?,
            Shl | Shr | ShrUn => {
                let sop = match op {
                    Shl => ShiftOp::Shl,
                    Shr => ShiftOp::Shr,
                    _ => ShiftOp::ShrUn,
                };
                let ct = ops::shift(self.peek(1)?.ct, self.peek(0)?.ct)
                    .ok_or_else(|| self.invalid(op))?;
                let item = self.simple(ct);
                self.node(IrOp::Shift(sop), ct, 2, Some(item))?
            }
            Neg => {
                let ct = ops::neg(self.peek(0)?.ct).ok_or_else(|| self.invalid(op))?;
                let item = self.simple(ct);
                self.node(IrOp::Neg, ct, 1, Some(item))?
            }
            Not => {
                let ct = ops::not(self.peek(0)?.ct).ok_or_else(|| self.invalid(op))?;
                let item = self.simple(ct);
                self.node(IrOp::Not, ct, 1, Some(item))?
            }

            ConvI1 | ConvI2 | ConvI4 | ConvI8 | ConvR4 | ConvR8 | ConvU4 | ConvU8 | ConvU2
            | ConvU1 | ConvI | ConvU | ConvRUn | ConvOvfI1 | ConvOvfU1 | ConvOvfI2
            | ConvOvfU2 | ConvOvfI4 | ConvOvfU4 | ConvOvfI8 | ConvOvfU8 | ConvOvfI
            | ConvOvfU | ConvOvfI1Un | ConvOvfI2Un | ConvOvfI4Un | ConvOvfI8Un | ConvOvfU1Un
            | ConvOvfU2Un | ConvOvfU4Un | ConvOvfU8Un | ConvOvfIUn | ConvOvfUUn => {
                let (to, unsigned, overflow) = conversion(op);
                let ct = ops::conv(self.peek(0)?.ct, to).ok_or_else(|| self.invalid(op))?;
                self.apply(
                    IrOp::Conv {
                        to,
                        unsigned,
                        overflow,
                    },
                    ct,
                )?
            }

            Ceq => self.compare(op, CondCode::Eq)?,
            Cgt => self.compare(op, CondCode::Gt)?,
            CgtUn => self.compare(op, CondCode::A)?,
            Clt => self.compare(op, CondCode::Lt)?,
            CltUn => self.compare(op, CondCode::B)?,

            Ldstr => {
                let index = token()? & 0x00ff_ffff;
                let s = self.session.md().user_string(self.module, index)?;
                let (symbol, addend) = self.session.intern_string(s)?;
                let item = StackItem {
                    ts: Some(TypeSpec::Primitive(ElementType::String)),
                    ..self.simple(Ct::Object)
                };
                self.node(
                    IrOp::LdLabAddr {
                        symbol,
                        addend: i64::from(addend),
                    },
                    Ct::Object,
                    0,
                    Some(item),
                )?
            }
            Newobj => {
                let ms = self.resolve_method(token()?)?;
                self.newobj(ms)?
            }
            Newarr => {
                let elem = self.resolve_type(token()?)?;
                self.newarr(op, elem)?
            }
            Castclass | Isinst => {
                let ts = self.resolve_type(token()?)?;
                self.cast(op, ts)?
            }
            Throw => {
                if self.peek(0)?.ct != Ct::Object {
                    return Err(self.invalid(op));
                }
                self.node(
                    IrOp::Call {
                        symbol: runtime::THROW.to_string(),
                        nparams: 1,
                    },
                    Ct::Void,
                    1,
                    None,
                )?
            }
            Rethrow => self.node(
                IrOp::Call {
                    symbol: runtime::RETHROW.to_string(),
                    nparams: 0,
                },
                Ct::Void,
                0,
                None,
            )?,

            Ldfld | Ldflda | Stfld => {
                let fs = self.resolve_field(token()?)?;
                self.instance_field(op, fs)?
            }
            Ldsfld | Ldsflda | Stsfld => {
                let fs = self.resolve_field(token()?)?;
                self.static_field(op, fs)?
            }

            Ldlen => {
                if self.peek(0)?.ct != Ct::Object {
                    return Err(self.invalid(op));
                }
                let off = self.session.target().array.inner_array_length;
                self.apply(IrOp::Ldc(i64::from(off)), Ct::IntPtr)?;
                self.apply(
                    IrOp::Bin {
                        op: BinOp::Add,
                        unsigned: false,
                        overflow: false,
                    },
                    Ct::Ref,
                )?;
                self.apply(
                    IrOp::LdInd {
                        size: 4,
                        signed: false,
                    },
                    Ct::IntPtr,
                )?
            }
            LdelemI1 | LdelemU1 | LdelemI2 | LdelemU2 | LdelemI4 | LdelemU4 | LdelemI8
            | LdelemI | LdelemR4 | LdelemR8 => {
                let et = element_type(op);
                self.element(op, Access::Get, Some(TypeSpec::Primitive(et)))?
            }
            LdelemRef => self.element(op, Access::Get, None)?,
            Ldelem => {
                let ts = self.resolve_type(token()?)?;
                self.element(op, Access::Get, Some(ts))?
            }
            Ldelema => {
                let ts = self.resolve_type(token()?)?;
                self.element(op, Access::Address, Some(ts))?
            }
            StelemI | StelemI1 | StelemI2 | StelemI4 | StelemI8 | StelemR4 | StelemR8 => {
                let et = element_type(op);
                self.element(op, Access::Set, Some(TypeSpec::Primitive(et)))?
            }
            StelemRef => self.element(op, Access::Set, None)?,
            Stelem => {
                let ts = self.resolve_type(token()?)?;
                self.element(op, Access::Set, Some(ts))?
            }

            Leave | LeaveS => return self.leave(target()?),
            Endfinally => {
                self.clear_stack()?;
                self.node(IrOp::EndFinally, Ct::Void, 0, None)?
            }
            Endfilter => {
                if self.cur.len() != 1 {
                    return Err(self.invalid(op));
                }
                self.node(IrOp::EndFilter, Ct::Int32, 1, None)?
            }

            Localloc => {
                if !matches!(self.peek(0)?.ct, Ct::Int32 | Ct::IntPtr) {
                    return Err(self.invalid(op));
                }
                let item = self.simple(Ct::IntPtr);
                self.node(IrOp::LocAlloc, Ct::IntPtr, 1, Some(item))?
            }
            Initobj => {
                let ts = self.resolve_type(token()?)?;
                if !matches!(self.peek(0)?.ct, Ct::Ref | Ct::IntPtr) {
                    return Err(self.invalid(op));
                }
                let size = self.layout.type_size(&ts)?;
                self.node(IrOp::ZeroMem { size }, Ct::Void, 1, None)?
            }
            Sizeof => {
                let ts = self.resolve_type(token()?)?;
                let size = self.layout.type_size(&ts)?;
                self.apply(IrOp::Ldc(i64::from(size)), Ct::Int32)?
            }
            Ldtoken => {
                let symbol = match self.session.md().resolve_token(self.module, token()?)? {
                    TokenTarget::Type(ts) => self.session.request_vtable(&self.subst(&ts))?,
                    TokenTarget::Method(ms) => {
                        let ms = self.subst_method(ms);
                        self.session.request_method_info(&ms)?
                    }
                    TokenTarget::Field(fs) => {
                        let fs = FieldSpec {
                            owner: self.subst(&fs.owner),
                            ..fs
                        };
                        self.session.request_field_info(&fs)?
                    }
                };
                let item = self.simple(Ct::IntPtr);
                self.node(IrOp::LdLabAddr { symbol, addend: 0 }, Ct::IntPtr, 0, Some(item))?
            }
        }
        Ok(Flow::Normal)
    }

    fn bad_operand(&self, op: Opcode) -> IrError {
        IrError::BadOperand {
            offset: self.offset,
            opcode: op.name().to_string(),
        }
    }

    fn arg(&self, n: u32) -> Result<LocalVar, IrError> {
        self.code
            .args
            .get(n as usize)
            .cloned()
            .ok_or(IrError::InvalidArgument {
                offset: self.offset,
                index: n,
            })
    }

    fn local(&self, n: u32) -> Result<LocalVar, IrError> {
        self.code
            .locals
            .get(n as usize)
            .cloned()
            .ok_or(IrError::InvalidLocal {
                offset: self.offset,
                index: n,
            })
    }

    fn var_item(&self, v: &LocalVar) -> StackItem {
        StackItem {
            ts: Some(v.ts.clone()),
            ct: v.ct,
            size: if v.ct == Ct::Vt {
                v.size
            } else {
                v.ct.size(self.p())
            },
            constant: None,
        }
    }

    fn ldarg(&mut self, n: u32) -> Result<(), IrError> {
        let arg = self.arg(n)?;
        let item = self.var_item(&arg);
        self.node(IrOp::LdArg(n), arg.ct, 0, Some(item))
    }

    fn ldloc(&mut self, n: u32) -> Result<(), IrError> {
        let local = self.local(n)?;
        let item = self.var_item(&local);
        self.node(IrOp::LdLoc(n), local.ct, 0, Some(item))
    }

    fn stloc(&mut self, op: Opcode, n: u32) -> Result<(), IrError> {
        let local = self.local(n)?;
        self.check_store(op, local.ct)?;
        self.node(IrOp::StLoc(n), local.ct, 1, None)
    }

    /// The top item must be storable into a slot of type `ct`
    fn check_store(&self, op: Opcode, ct: Ct) -> Result<(), IrError> {
        let top = self.peek(0)?;
        let ok = top.class() == ct.class()
            || (top.ct.is_pointer_like() && ct.is_pointer_like());
        if ok {
            Ok(())
        } else {
            Err(self.invalid(op))
        }
    }

    fn clear_stack(&mut self) -> Result<(), IrError> {
        while !self.cur.is_empty() {
            self.apply(IrOp::Pop, Ct::Void)?;
        }
        Ok(())
    }

    fn ret(&mut self, op: Opcode) -> Result<(), IrError> {
        match self.code.ret.clone() {
            Some(var) => {
                if var.ct == Ct::Vt && var.size > 8 {
                    return Err(self.unsupported("value type return larger than 8 bytes"));
                }
                if self.cur.len() != 1 {
                    return Err(self.invalid(op));
                }
                self.check_store(op, var.ct)?;
                self.node(IrOp::Ret, var.ct, 1, None)
            }
            None => {
                if !self.cur.is_empty() {
                    return Err(self.invalid(op));
                }
                self.node(IrOp::Ret, Ct::Void, 0, None)
            }
        }
    }

    fn binary(
        &mut self,
        op: Opcode,
        bop: BinOp,
        unsigned: bool,
        overflow: bool,
    ) -> Result<(), IrError> {
        let (a, b) = (self.peek(1)?.ct, self.peek(0)?.ct);
        let ct = ops::binary(bop, unsigned, overflow, a, b).ok_or_else(|| self.invalid(op))?;
        self.apply(
            IrOp::Bin {
                op: bop,
                unsigned,
                overflow,
            },
            ct,
        )
    }

    /// Common operand type of a comparison
    fn compare_type(&self, op: Opcode, cc: CondCode) -> Result<Ct, IrError> {
        let (a, b) = (self.peek(1)?.ct, self.peek(0)?.ct);
        if !ops::comparable(cc, a, b) {
            return Err(self.invalid(op));
        }
        Ok(if a == b {
            a
        } else if a == Ct::Ref || b == Ct::Ref {
            Ct::Ref
        } else {
            Ct::IntPtr
        })
    }

    fn compare(&mut self, op: Opcode, cc: CondCode) -> Result<(), IrError> {
        let ct = self.compare_type(op, cc)?;
        let item = self.simple(Ct::Int32);
        self.node(IrOp::Cmp(cc), ct, 2, Some(item))
    }

    fn load_indirect(&mut self, op: Opcode, ts: &TypeSpec) -> Result<(), IrError> {
        if !matches!(self.peek(0)?.ct, Ct::Ref | Ct::IntPtr) {
            return Err(self.invalid(op));
        }
        let (size, signed, ct) = self.load_info(ts)?;
        let item = self.item(ts)?;
        self.node(IrOp::LdInd { size, signed }, ct, 1, Some(item))
    }

    fn store_indirect(&mut self, op: Opcode, ts: &TypeSpec) -> Result<(), IrError> {
        if !matches!(self.peek(1)?.ct, Ct::Ref | Ct::IntPtr) {
            return Err(self.invalid(op));
        }
        let (size, _, ct) = self.load_info(ts)?;
        self.check_store(op, ct)?;
        let value_ct = self.peek(0)?.ct;
        self.node(IrOp::StInd { size }, value_ct, 2, None)
    }

    fn call(&mut self, ms: MethodSpec, virt: bool) -> Result<(), IrError> {
        if let MethodRef::Array(accessor) = ms.method {
            return self.array_accessor(&ms, accessor);
        }
        if let Some(member) = self.string_member(&ms)? {
            return self.string_intrinsic(member);
        }
        let md = self.session.md();
        let sig = method_signature(md, &ms)?;
        let nparams = sig.param_count_with_this() as u32;
        if self.cur.len() < nparams as usize {
            return Err(IrError::StackUnderflow {
                offset: self.offset,
            });
        }
        let ret = match &sig.ret {
            Some(ts) => Some(self.item(ts)?),
            None => None,
        };
        if let Some(r) = &ret {
            if r.ct == Ct::Vt && r.size > 8 {
                return Err(self.unsupported("value type return larger than 8 bytes"));
            }
        }
        let ct = ret.as_ref().map_or(Ct::Void, |r| r.ct);

        let (module, row) = match ms.method {
            MethodRef::Def { module, row } => (module, row),
            MethodRef::Array(_) => return Err(self.unsupported("array accessor")),
        };
        let def = md.method_def(module, row)?;
        let dispatch = virt && def.is_virtual() && !self.layout.is_value_type(&ms.owner)?;
        let op = if dispatch {
            let slot = self.layout.vtable_slot(&ms)?;
            if self.layout.def_kind(&ms.owner)? == Some(TypeKind::Interface) {
                IrOp::CallInterface {
                    iface: self.session.request_vtable(&ms.owner)?,
                    slot: slot - VTABLE_HEADER_SLOTS,
                    nparams,
                }
            } else {
                IrOp::CallVirt { slot, nparams }
            }
        } else {
            IrOp::Call {
                symbol: self.session.request_method(&ms)?,
                nparams,
            }
        };
        self.node(op, ct, nparams as usize, ret)
    }

    fn string_member(&self, ms: &MethodSpec) -> Result<Option<StringMember>, IrError> {
        let md = self.session.md();
        if canonical(md, &ms.owner) != TypeSpec::Primitive(ElementType::String) {
            return Ok(None);
        }
        let MethodRef::Def { module, row } = ms.method else {
            return Ok(None);
        };
        let def = md.method_def(module, row)?;
        if def.is_static() {
            return Ok(None);
        }
        Ok(match def.name.as_str() {
            "get_Length" => Some(StringMember::Length),
            "get_Chars" => Some(StringMember::Chars),
            _ => None,
        })
    }

    /// Read a string's length or one of its code units in place
    fn string_intrinsic(&mut self, member: StringMember) -> Result<(), IrError> {
        let string = self.session.target().string;
        match member {
            StringMember::Length => {
                if self.peek(0)?.ct != Ct::Object {
                    return Err(self.invalid(Opcode::Call));
                }
                self.add_offset(string.length, Ct::Ref)?;
                self.apply(IrOp::LdInd { size: 4, signed: true }, Ct::Int32)
            }
            StringMember::Chars => {
                let index = self.peek(0)?.ct;
                if self.peek(1)?.ct != Ct::Object || !matches!(index, Ct::Int32 | Ct::IntPtr) {
                    return Err(self.invalid(Opcode::Call));
                }
                self.apply(
                    IrOp::Conv {
                        to: ElementType::I,
                        unsigned: false,
                        overflow: false,
                    },
                    Ct::IntPtr,
                )?;
                self.apply(IrOp::Ldc(2), Ct::IntPtr)?;
                self.apply(bin(BinOp::Mul), Ct::IntPtr)?;
                self.apply(bin(BinOp::Add), Ct::Ref)?;
                self.add_offset(string.start_char, Ct::Ref)?;
                self.apply(IrOp::LdInd { size: 2, signed: false }, Ct::Int32)
            }
        }
    }

    fn calli(&mut self, token: u32) -> Result<(), IrError> {
        let sig = self
            .session
            .md()
            .standalone_method_sig(self.module, token)?
            .substitute(&self.type_args, &self.method_args);
        let nparams = sig.param_count_with_this() as u32;
        if !matches!(self.peek(0)?.ct, Ct::IntPtr) {
            return Err(self.invalid(Opcode::Calli));
        }
        let ret = match &sig.ret {
            Some(ts) => Some(self.item(ts)?),
            None => None,
        };
        let ct = ret.as_ref().map_or(Ct::Void, |r| r.ct);
        self.node(IrOp::CallI { nparams }, ct, nparams as usize + 1, ret)
    }

    fn newobj(&mut self, ms: MethodSpec) -> Result<(), IrError> {
        if let MethodRef::Array(_) = ms.method {
            return Err(self.unsupported("multi-dimensional array construction"));
        }
        let owner = ms.owner.clone();
        let sig = method_signature(self.session.md(), &ms)?;
        let n = sig.params.len() as u32;
        if self.cur.len() < n as usize {
            return Err(IrError::StackUnderflow {
                offset: self.offset,
            });
        }
        let ctor = self.session.request_method(&ms)?;
        let call = IrOp::Call {
            symbol: ctor,
            nparams: n + 1,
        };

        if self.layout.is_value_type(&owner)? {
            let var = local_var(&self.layout, &owner)?;
            let size = var.size;
            let temp = self.code.add_temp_local(var);
            let addr = self.ref_item(&owner);
            self.node(IrOp::LdLoca(temp), Ct::Ref, 0, Some(addr.clone()))?;
            self.node(IrOp::ZeroMem { size }, Ct::Void, 1, None)?;
            self.node(IrOp::LdLoca(temp), Ct::Ref, 0, Some(addr))?;
            for _ in 0..n {
                self.apply(IrOp::Pick(n), Ct::Void)?;
            }
            self.node(call, Ct::Void, n as usize + 1, None)?;
            for _ in 0..n {
                self.apply(IrOp::Pop, Ct::Void)?;
            }
            let local = self.local(temp)?;
            let item = self.var_item(&local);
            self.node(IrOp::LdLoc(temp), local.ct, 0, Some(item))
        } else {
            let vtable = self.session.request_vtable(&owner)?;
            let size = self.layout.instance_size(&owner)?;
            let p = self.p();
            let obj = StackItem {
                ts: Some(owner.clone()),
                ..self.simple(Ct::Object)
            };
            self.apply(IrOp::Ldc(i64::from(size)), Ct::IntPtr)?;
            self.node(
                IrOp::Call {
                    symbol: runtime::GC_MALLOC.to_string(),
                    nparams: 1,
                },
                Ct::Object,
                1,
                Some(obj),
            )?;
            self.apply(IrOp::Pick(0), Ct::Void)?;
            let vt_item = self.simple(Ct::IntPtr);
            self.node(
                IrOp::LdLabAddr {
                    symbol: vtable,
                    addend: 0,
                },
                Ct::IntPtr,
                0,
                Some(vt_item),
            )?;
            self.apply(IrOp::StInd { size: p }, Ct::IntPtr)?;
            self.apply(IrOp::Pick(0), Ct::Void)?;
            for _ in 0..n {
                self.apply(IrOp::Pick(n + 1), Ct::Void)?;
            }
            self.node(call, Ct::Void, n as usize + 1, None)?;
            self.apply(IrOp::Nip(n), Ct::Void)
        }
    }

    fn newarr(&mut self, op: Opcode, elem: TypeSpec) -> Result<(), IrError> {
        if !matches!(self.peek(0)?.ct, Ct::Int32 | Ct::IntPtr) {
            return Err(self.invalid(op));
        }
        let array_ts = elem.clone().sz_array();
        let array_vtable = self.session.request_vtable(&array_ts)?;
        let elem_vtable = self.session.request_vtable(&elem)?;
        let es = self.layout.type_size(&elem)?;
        let a = self.session.target().array;
        let os = a.object_size;
        let p = self.p();

        // one block: header, lower bound, extent, then the elements
        self.apply(IrOp::Pick(0), Ct::Void)?;
        self.apply(
            IrOp::Conv {
                to: ElementType::I,
                unsigned: false,
                overflow: false,
            },
            Ct::IntPtr,
        )?;
        self.apply(IrOp::Ldc(i64::from(es)), Ct::IntPtr)?;
        self.apply(bin(BinOp::Mul), Ct::IntPtr)?;
        self.apply(IrOp::Ldc(i64::from(os + 8)), Ct::IntPtr)?;
        self.apply(bin(BinOp::Add), Ct::IntPtr)?;
        let arr = StackItem {
            ts: Some(array_ts),
            ..self.simple(Ct::Object)
        };
        self.node(
            IrOp::Call {
                symbol: runtime::GC_MALLOC.to_string(),
                nparams: 1,
            },
            Ct::Object,
            1,
            Some(arr),
        )?;

        let inits = [
            (a.vtbl, Init::Label(array_vtable), p),
            (a.elem_type_vtbl, Init::Label(elem_vtable), p),
            (a.lobounds, Init::ArrayPlus(os), p),
            (a.sizes, Init::ArrayPlus(os + 4), p),
            (a.data, Init::ArrayPlus(os + 8), p),
            (a.elem_size, Init::Const(i64::from(es)), 4),
            (a.rank, Init::Const(1), 4),
            (a.inner_array_length, Init::Count, 4),
            (os + 4, Init::Count, 4),
        ];
        for (offset, init, size) in inits {
            // stack: count, array
            self.apply(IrOp::Pick(0), Ct::Void)?;
            if offset != 0 {
                self.apply(IrOp::Ldc(i64::from(offset)), Ct::IntPtr)?;
                self.apply(bin(BinOp::Add), Ct::Ref)?;
            }
            let ct = match init {
                Init::Label(symbol) => {
                    let item = self.simple(Ct::IntPtr);
                    self.node(IrOp::LdLabAddr { symbol, addend: 0 }, Ct::IntPtr, 0, Some(item))?;
                    Ct::IntPtr
                }
                Init::ArrayPlus(off) => {
                    self.apply(IrOp::Pick(1), Ct::Void)?;
                    self.apply(IrOp::Ldc(i64::from(off)), Ct::IntPtr)?;
                    self.apply(bin(BinOp::Add), Ct::IntPtr)?;
                    Ct::IntPtr
                }
                Init::Const(v) => {
                    self.apply(IrOp::Ldc(v), Ct::Int32)?;
                    Ct::Int32
                }
                Init::Count => {
                    self.apply(IrOp::Pick(2), Ct::Void)?;
                    self.peek(0)?.ct
                }
            };
            self.apply(IrOp::StInd { size }, ct)?;
        }
        self.apply(IrOp::Nip(1), Ct::Void)
    }

    fn cast(&mut self, op: Opcode, ts: TypeSpec) -> Result<(), IrError> {
        if self.peek(0)?.ct != Ct::Object {
            return Err(self.invalid(op));
        }
        let vtable = self.session.request_vtable(&ts)?;
        let flag = if op == Opcode::Castclass {
            runtime::CAST_THROWS
        } else {
            runtime::CAST_RETURNS_NULL
        };
        let vt_item = self.simple(Ct::IntPtr);
        self.node(
            IrOp::LdLabAddr {
                symbol: vtable,
                addend: 0,
            },
            Ct::IntPtr,
            0,
            Some(vt_item),
        )?;
        self.apply(IrOp::Ldc(flag), Ct::Int32)?;
        let result = StackItem {
            ts: Some(ts),
            ..self.simple(Ct::Object)
        };
        self.node(
            IrOp::Call {
                symbol: runtime::CAST_CLASS.to_string(),
                nparams: 3,
            },
            Ct::Object,
            3,
            Some(result),
        )
    }

    fn instance_field(&mut self, op: Opcode, fs: FieldSpec) -> Result<(), IrError> {
        let fty = self.layout.field_type(&fs)?;
        let offset = self.layout.field_offset(&fs)?;
        let (size, signed, ct) = self.load_info(&fty)?;
        let value = self.item(&fty)?;

        if op == Opcode::Stfld {
            if !matches!(self.peek(1)?.ct, Ct::Object | Ct::Ref | Ct::IntPtr) {
                return Err(self.invalid(op));
            }
            self.check_store(op, ct)?;
            let value_ct = self.peek(0)?.ct;
            self.apply(IrOp::Pick(1), Ct::Void)?;
            self.add_offset(offset, Ct::Ref)?;
            self.apply(IrOp::Pick(1), Ct::Void)?;
            self.apply(IrOp::StInd { size }, value_ct)?;
            self.apply(IrOp::Pop, Ct::Void)?;
            return self.apply(IrOp::Pop, Ct::Void);
        }

        let obj = self.peek(0)?;
        match (op, obj.ct) {
            (Opcode::Ldfld, Ct::Vt) => self.node(
                IrOp::LdVtField {
                    offset,
                    size,
                    signed,
                },
                ct,
                1,
                Some(value),
            ),
            (_, Ct::Object | Ct::Ref | Ct::IntPtr) => {
                if op == Opcode::Ldflda {
                    let item = self.ref_item(&fty);
                    if offset == 0 {
                        return self.node(IrOp::Nop, Ct::Ref, 1, Some(item));
                    }
                    self.apply(IrOp::Ldc(i64::from(offset)), Ct::IntPtr)?;
                    return self.node(bin(BinOp::Add), Ct::Ref, 2, Some(item));
                }
                self.add_offset(offset, Ct::Ref)?;
                self.node(IrOp::LdInd { size, signed }, ct, 1, Some(value))
            }
            _ => Err(self.invalid(op)),
        }
    }

    fn add_offset(&mut self, offset: u32, ct: Ct) -> Result<(), IrError> {
        if offset == 0 {
            return Ok(());
        }
        self.apply(IrOp::Ldc(i64::from(offset)), Ct::IntPtr)?;
        self.apply(bin(BinOp::Add), ct)
    }

    fn static_field(&mut self, op: Opcode, fs: FieldSpec) -> Result<(), IrError> {
        let fty = self.layout.field_type(&fs)?;
        let offset = self.layout.field_offset(&fs)?;
        let (size, signed, ct) = self.load_info(&fty)?;
        let symbol = self.session.request_static_fields(&fs.owner)?;
        let addr = IrOp::LdLabAddr {
            symbol,
            addend: i64::from(offset),
        };
        let addr_item = self.ref_item(&fty);
        match op {
            Opcode::Ldsfld => {
                self.node(addr, Ct::Ref, 0, Some(addr_item))?;
                let value = self.item(&fty)?;
                self.node(IrOp::LdInd { size, signed }, ct, 1, Some(value))
            }
            Opcode::Ldsflda => self.node(addr, Ct::Ref, 0, Some(addr_item)),
            _ => {
                self.check_store(op, ct)?;
                let value_ct = self.peek(0)?.ct;
                self.node(addr, Ct::Ref, 0, Some(addr_item))?;
                self.apply(IrOp::Pick(1), Ct::Void)?;
                self.apply(IrOp::StInd { size }, value_ct)?;
                self.apply(IrOp::Pop, Ct::Void)
            }
        }
    }

    /// `ldelem*`, `ldelema`, `stelem*`; `elem` is `None` for the `.ref` forms
    fn element(
        &mut self,
        op: Opcode,
        access: Access,
        elem: Option<TypeSpec>,
    ) -> Result<(), IrError> {
        let value = u32::from(access == Access::Set);
        let array = self.peek(1 + value as usize)?;
        let index = self.peek(value as usize)?;
        if array.ct != Ct::Object || !matches!(index.ct, Ct::Int32 | Ct::IntPtr) {
            return Err(self.invalid(op));
        }
        let declared = match &array.ts {
            Some(TypeSpec::SzArray(e)) => Some((**e).clone()),
            _ => None,
        };
        let elem = elem
            .or(declared)
            .unwrap_or(TypeSpec::Primitive(ElementType::Object));
        let shape = ArrayShape {
            elem,
            rank: 1,
            sizes: Vec::new(),
            lobounds: vec![0],
        };
        self.lower_array(&shape, access, &[index.constant])
    }

    fn array_accessor(&mut self, ms: &MethodSpec, accessor: ArrayMethod) -> Result<(), IrError> {
        let shape = match &ms.owner {
            TypeSpec::Array(shape) => (**shape).clone(),
            other => return Err(MetadataError::NotADefinition(other.to_string()).into()),
        };
        let access = match accessor {
            ArrayMethod::Get => Access::Get,
            ArrayMethod::Set => Access::Set,
            ArrayMethod::Address => Access::Address,
        };
        let md = self.session.md();
        let expected = match access {
            Access::Get => Some(canonical(md, &shape.elem)),
            Access::Address => Some(canonical(md, &shape.elem).managed_ptr()),
            Access::Set => None,
        };
        let declared = method_signature(md, ms)?.ret.map(|r| match r {
            TypeSpec::ManagedPtr(inner) => canonical(md, &inner).managed_ptr(),
            other => canonical(md, &other),
        });
        if declared != expected {
            let show = |t: &Option<TypeSpec>| {
                t.as_ref().map_or("void".to_string(), |t| t.to_string())
            };
            return Err(IrError::ReturnTypeMismatch {
                method: ms.to_string(),
                expected: show(&expected),
                found: show(&declared),
            });
        }

        let value = usize::from(access == Access::Set);
        let rank = shape.rank as usize;
        let mut consts = Vec::with_capacity(rank);
        for r in 0..rank {
            consts.push(self.peek(rank - 1 - r + value)?.constant);
        }
        self.lower_array(&shape, access, &consts)
    }

    fn lower_array(
        &mut self,
        shape: &ArrayShape,
        access: Access,
        consts: &[Option<i64>],
    ) -> Result<(), IrError> {
        let (size, signed, ct) = self.load_info(&shape.elem)?;
        let info = ElemInfo { size, ct, signed };
        let ops = array::lower_access(shape, access, info, consts, self.session.target());
        for (op, ct) in ops {
            self.apply(op, ct)?;
        }
        Ok(())
    }

    fn leave(&mut self, target: u32) -> Result<Flow, IrError> {
        self.clear_stack()?;
        let here = self.offset;

        let mut finallys: Vec<(u32, usize)> = self
            .code
            .clauses
            .iter()
            .filter(|c| c.kind == ClauseKind::Finally && c.protects(here) && !c.protects(target))
            .map(|c| (c.try_length, c.id))
            .collect();
        finallys.sort();
        for (_, id) in finallys {
            self.node(IrOp::CallFinally(id), Ct::Void, 0, None)?;
        }

        let leaves = |kinds: &[ClauseKind]| {
            self.code
                .clauses
                .iter()
                .any(|c| kinds.contains(&c.kind) && c.in_handler(here) && !c.in_handler(target))
        };
        if leaves(&[ClauseKind::Finally, ClauseKind::Fault]) {
            return Err(IrError::InvalidLeave { offset: here });
        }
        let op = if leaves(&[ClauseKind::Catch, ClauseKind::Filter]) {
            IrOp::LeaveHandler(target)
        } else {
            IrOp::Br(target)
        };
        self.node(op, Ct::Void, 0, None)?;
        Ok(Flow::Leave(target))
    }
}

fn bin(op: BinOp) -> IrOp {
    IrOp::Bin {
        op,
        unsigned: false,
        overflow: false,
    }
}

fn fold(op: BinOp, a: i64, b: i64, ct: Ct, p: u32) -> Option<i64> {
    let v = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Div | BinOp::Rem => return None,
    };
    Some(match ct {
        Ct::Int32 => ops::truncate(v, 32, true),
        Ct::IntPtr | Ct::Ref => ops::truncate(v, p * 8, true),
        _ => v,
    })
}

fn fold_conv(
    v: i64,
    src: Ct,
    to: ElementType,
    unsigned: bool,
    overflow: bool,
    p: u32,
) -> Option<i64> {
    let (bits, signed_target) = ops::int_target_bits(to, p)?;
    let zero_extend = src == Ct::Int32 && (if overflow { unsigned } else { !signed_target });
    let v = if zero_extend { i64::from(v as u32) } else { v };
    if overflow {
        ops::conv_ovf_in_range(v, unsigned, bits, signed_target).then_some(v)
    } else {
        Some(ops::truncate(v, bits, signed_target))
    }
}

fn branch_condition(op: Opcode) -> CondCode {
    use Opcode::*;
    match op {
        Beq | BeqS => CondCode::Eq,
        Bge | BgeS => CondCode::Ge,
        Bgt | BgtS => CondCode::Gt,
        Ble | BleS => CondCode::Le,
        Blt | BltS => CondCode::Lt,
        BneUn | BneUnS => CondCode::Ne,
        BgeUn | BgeUnS => CondCode::Ae,
        BgtUn | BgtUnS => CondCode::A,
        BleUn | BleUnS => CondCode::Be,
        _ => CondCode::B,
    }
}

fn indirect_type(op: Opcode) -> TypeSpec {
    use Opcode::*;
    TypeSpec::Primitive(match op {
        LdindI1 | StindI1 => ElementType::I1,
        LdindU1 => ElementType::U1,
        LdindI2 | StindI2 => ElementType::I2,
        LdindU2 => ElementType::U2,
        LdindI4 | StindI4 => ElementType::I4,
        LdindU4 => ElementType::U4,
        LdindI8 | StindI8 => ElementType::I8,
        LdindI | StindI => ElementType::I,
        LdindR4 | StindR4 => ElementType::R4,
        LdindR8 | StindR8 => ElementType::R8,
        _ => ElementType::Object,
    })
}

fn element_type(op: Opcode) -> ElementType {
    use Opcode::*;
    match op {
        LdelemI1 | StelemI1 => ElementType::I1,
        LdelemU1 => ElementType::U1,
        LdelemI2 | StelemI2 => ElementType::I2,
        LdelemU2 => ElementType::U2,
        LdelemI4 | StelemI4 => ElementType::I4,
        LdelemU4 => ElementType::U4,
        LdelemI8 | StelemI8 => ElementType::I8,
        LdelemR4 | StelemR4 => ElementType::R4,
        LdelemR8 | StelemR8 => ElementType::R8,
        _ => ElementType::I,
    }
}

/// Target, unsigned-source flag and overflow flag of a `conv.*` opcode
fn conversion(op: Opcode) -> (ElementType, bool, bool) {
    use ElementType as E;
    use Opcode::*;
    match op {
        ConvI1 => (E::I1, false, false),
        ConvI2 => (E::I2, false, false),
        ConvI4 => (E::I4, false, false),
        ConvI8 => (E::I8, false, false),
        ConvR4 => (E::R4, false, false),
        ConvR8 => (E::R8, false, false),
        ConvU1 => (E::U1, false, false),
        ConvU2 => (E::U2, false, false),
        ConvU4 => (E::U4, false, false),
        ConvU8 => (E::U8, false, false),
        ConvI => (E::I, false, false),
        ConvU => (E::U, false, false),
        ConvRUn => (E::R8, true, false),
        ConvOvfI1 => (E::I1, false, true),
        ConvOvfU1 => (E::U1, false, true),
        ConvOvfI2 => (E::I2, false, true),
        ConvOvfU2 => (E::U2, false, true),
        ConvOvfI4 => (E::I4, false, true),
        ConvOvfU4 => (E::U4, false, true),
        ConvOvfI8 => (E::I8, false, true),
        ConvOvfU8 => (E::U8, false, true),
        ConvOvfI => (E::I, false, true),
        ConvOvfU => (E::U, false, true),
        ConvOvfI1Un => (E::I1, true, true),
        ConvOvfI2Un => (E::I2, true, true),
        ConvOvfI4Un => (E::I4, true, true),
        ConvOvfI8Un => (E::I8, true, true),
        ConvOvfU1Un => (E::U1, true, true),
        ConvOvfU2Un => (E::U2, true, true),
        ConvOvfU4Un => (E::U4, true, true),
        ConvOvfU8Un => (E::U8, true, true),
        ConvOvfIUn => (E::I, true, true),
        _ => (E::U, true, true),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::BuildConfig;
    use crate::metadata::{
        BodyBuilder, InMemoryMetadata, MetadataProvider, MethodSig, METHOD_STATIC,
    };

    struct StringApp {
        session: BuildSession,
        get_chars: MethodSpec,
        char_at: MethodSpec,
        length_of: MethodSpec,
    }

    /// `CharAt(s, i)` calls `s.get_Chars(i)`; `LengthOf(s)` calls `s.get_Length()`
    fn string_app() -> StringApp {
        let mut md = InMemoryMetadata::with_corlib();
        let corlib = md.corlib();
        let string_row = md.find_type(corlib, "System", "String").unwrap();
        let string = TypeSpec::Primitive(ElementType::String);
        let i4 = TypeSpec::Primitive(ElementType::I4);
        let ch = TypeSpec::Primitive(ElementType::Char);
        let get_chars = md.add_method(
            corlib,
            string_row,
            "get_Chars",
            0,
            MethodSig::new_instance(Some(ch.clone()), vec![i4.clone()]),
            None,
        );
        let get_length = md.add_method(
            corlib,
            string_row,
            "get_Length",
            0,
            MethodSig::new_instance(Some(i4.clone()), Vec::new()),
            None,
        );
        let get_chars = MethodSpec::def(TypeSpec::def(corlib, string_row), corlib, get_chars);
        let get_length = MethodSpec::def(TypeSpec::def(corlib, string_row), corlib, get_length);

        let m = md.add_module("text.dll", "text");
        let object = md.corlib_type("Object");
        let program = md.add_type(m, "Text", "Program", TypeKind::Class, object);
        let chars_token = md.method_token(m, &get_chars).to_le_bytes();
        let length_token = md.method_token(m, &get_length).to_le_bytes();

        // ldarg.0; ldarg.1; call get_Chars; ret
        let mut il = vec![0x02, 0x03, 0x28];
        il.extend_from_slice(&chars_token);
        il.push(0x2a);
        let char_at = md.add_method(
            m,
            program,
            "CharAt",
            METHOD_STATIC,
            MethodSig::new_static(Some(ch), vec![string.clone(), i4.clone()]),
            Some(&BodyBuilder::new(&il).build()),
        );

        // ldarg.0; callvirt get_Length; ret
        let mut il = vec![0x02, 0x6f];
        il.extend_from_slice(&length_token);
        il.push(0x2a);
        let length_of = md.add_method(
            m,
            program,
            "LengthOf",
            METHOD_STATIC,
            MethodSig::new_static(Some(i4), vec![string]),
            Some(&BodyBuilder::new(&il).build()),
        );

        let owner = TypeSpec::def(m, program);
        StringApp {
            session: BuildSession::new(Arc::new(md), m, BuildConfig::default()).unwrap(),
            get_chars,
            char_at: MethodSpec::def(owner.clone(), m, char_at),
            length_of: MethodSpec::def(owner, m, length_of),
        }
    }

    fn is_call(op: &IrOp) -> bool {
        matches!(
            op,
            IrOp::Call { .. } | IrOp::CallVirt { .. } | IrOp::CallInterface { .. }
        )
    }

    #[test]
    fn test_string_chars_reads_code_unit() {
        let app = string_app();
        let code = build(&app.session, &app.char_at).unwrap();
        let ops: Vec<&IrOp> = code.ir().map(|n| &n.op).collect();
        assert!(!ops.iter().any(|op| is_call(op)));
        let start_char = app.session.target().string.start_char;
        assert!(ops.contains(&&IrOp::Ldc(i64::from(start_char))));
        assert!(ops.contains(&&IrOp::LdInd { size: 2, signed: false }));
        assert!(!app.session.requestor().methods().has_seen(&app.get_chars));
    }

    #[test]
    fn test_string_length_reads_count() {
        let app = string_app();
        let code = build(&app.session, &app.length_of).unwrap();
        let ops: Vec<&IrOp> = code.ir().map(|n| &n.op).collect();
        assert!(!ops.iter().any(|op| is_call(op)));
        let length = app.session.target().string.length;
        assert!(ops.contains(&&IrOp::Ldc(i64::from(length))));
        assert!(ops.contains(&&IrOp::LdInd { size: 4, signed: true }));
    }
}
