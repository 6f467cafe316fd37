//! Instruction selection
//!
//! Lowers the IR of one method to x86-64 instructions. Every stack value is
//! read from and written back to the location the register allocator gave
//! its depth; `rax rcx rdx r11 xmm0 xmm1` are scratch.
//!
//! Frame layout below `rbp`, from the top: callee-saved register saves, one
//! save slot per caller-saved pool register in use, locals, spill slots.
//! Arguments are pushed right to left by the caller and start at `rbp + 16`.
//! The caller pops them.
//!
//! Handler and filter blocks are entered by a call with the method's frame
//! pointer and the exception object on the stack. They run on the method's
//! frame and return to their caller with `pop rbp; ret`.

use rustc_hash::FxHashMap;

use crate::backend::{CodegenError, PhysReg};
use crate::code::{Code, LocalVar};
use crate::ir::ops::int_target_bits;
use crate::ir::{BinOp, CondCode, Ct, IrNode, IrOp, ShiftOp, StackItem, ValueClass};
use crate::layout::align_up;
use crate::metadata::ElementType;
use crate::regalloc::{Allocation, Location};
use crate::runtime;

use super::inst::{Alu, Cond, Inst, Label, Mem, Rm, Shift, Sse, Unary, Width, XRm};
use super::regs::{Gpr, Xmm, R11, RAX, RBP, RCX, RDI, RDX, RSP, XMM0};

/// Stack frame of one method; offsets are relative to `rbp`
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub callee_saved: Vec<(Gpr, i32)>,
    pub caller_saved: FxHashMap<PhysReg, i32>,
    pub args: Vec<i32>,
    pub locals: Vec<i32>,
    /// Lowest address of the locals region
    pub locals_base: i32,
    pub locals_size: u32,
    pub slots: Vec<i32>,
    /// Bytes reserved below `rbp`, a multiple of 16
    pub size: u32,
}

impl Frame {
    pub fn new(code: &Code, alloc: &Allocation) -> Frame {
        let mut frame = Frame::default();
        let mut cursor = 0u32;
        for &reg in alloc.used_registers() {
            let gpr = Gpr(reg.num);
            if reg.class == ValueClass::Int && gpr.is_callee_saved() {
                cursor += 8;
                frame.callee_saved.push((gpr, -(cursor as i32)));
            }
        }
        for &reg in alloc.used_registers() {
            if reg.class == ValueClass::Float || !Gpr(reg.num).is_callee_saved() {
                cursor += 8;
                frame.caller_saved.insert(reg, -(cursor as i32));
            }
        }
        let locals_top = cursor;
        for var in &code.locals {
            cursor += align_up(var.size.max(8), 8);
            frame.locals.push(-(cursor as i32));
        }
        frame.locals_base = -(cursor as i32);
        frame.locals_size = cursor - locals_top;
        for &size in alloc.slots() {
            cursor += size;
            frame.slots.push(-(cursor as i32));
        }
        let mut above = 16u32;
        for var in &code.args {
            frame.args.push(above as i32);
            above += arg_size(var.ct, var.size);
        }
        frame.size = align_up(cursor, 16);
        frame
    }
}

/// Bytes a value occupies on the argument stack
fn arg_size(ct: Ct, size: u32) -> u32 {
    if ct == Ct::Vt {
        align_up(size.max(1), 8)
    } else {
        8
    }
}

fn width(ct: Ct) -> Width {
    if ct == Ct::Int32 {
        Width::W32
    } else {
        Width::W64
    }
}

fn int_cond(cc: CondCode) -> Option<Cond> {
    Some(match cc {
        CondCode::Eq => Cond::E,
        CondCode::Ne => Cond::Ne,
        CondCode::Gt => Cond::G,
        CondCode::Ge => Cond::Ge,
        CondCode::Lt => Cond::L,
        CondCode::Le => Cond::Le,
        CondCode::A => Cond::A,
        CondCode::Ae => Cond::Ae,
        CondCode::B => Cond::B,
        CondCode::Be => Cond::Be,
        CondCode::Always | CondCode::Never => return None,
    })
}

/// How to read a float comparison from the flags of `ucomisd`
enum FloatTest {
    /// Compare `(a, b)`, or `(b, a)` when swapped, then test one condition
    Flag { swap: bool, cond: Cond },
    /// Ordered and equal
    Eq,
    /// Unordered or not equal
    Ne,
}

fn float_test(cc: CondCode) -> Option<FloatTest> {
    let flag = |swap, cond| Some(FloatTest::Flag { swap, cond });
    match cc {
        CondCode::Eq => Some(FloatTest::Eq),
        CondCode::Ne => Some(FloatTest::Ne),
        CondCode::Gt => flag(false, Cond::A),
        CondCode::Lt => flag(true, Cond::A),
        CondCode::Ge => flag(false, Cond::Ae),
        CondCode::Le => flag(true, Cond::Ae),
        CondCode::A => flag(true, Cond::B),
        CondCode::B => flag(false, Cond::B),
        CondCode::Ae => flag(true, Cond::Be),
        CondCode::Be => flag(false, Cond::Be),
        CondCode::Always | CondCode::Never => None,
    }
}

/// Where a stack value lives, in machine terms
#[derive(Debug, Clone, PartialEq)]
enum Loc {
    Gpr(Gpr),
    Xmm(Xmm),
    Mem(Mem),
}

/// Integer source operand
enum Src {
    Imm(i32),
    Rm(Rm),
}

enum CallTarget<'s> {
    Symbol(&'s str),
    Virtual(u32),
    Interface(&'s str, u32),
    Indirect,
}

/// Lower a method to machine instructions
pub fn select(code: &Code, alloc: &Allocation) -> Result<(Vec<Inst>, Frame), CodegenError> {
    let mut isel = Isel {
        code,
        alloc,
        frame: Frame::new(code, alloc),
        out: Vec::new(),
        next_label: 0,
        overflow: false,
        offset: 0,
    };
    isel.run()?;
    Ok((isel.out, isel.frame))
}

struct Isel<'a> {
    code: &'a Code,
    alloc: &'a Allocation,
    frame: Frame,
    out: Vec<Inst>,
    next_label: u32,
    /// Whether the overflow stub is referenced
    overflow: bool,
    offset: u32,
}

impl<'a> Isel<'a> {
    fn run(&mut self) -> Result<(), CodegenError> {
        let code = self.code;
        for node in &code.nodes {
            let mut bound = false;
            for ir in &node.ir {
                self.offset = ir.il_offset;
                let entry = matches!(ir.op, IrOp::Enter | IrOp::EnterHandler { .. });
                if !entry && !bound {
                    self.bind(Label::Il(node.offset));
                    bound = true;
                }
                self.lower(ir)?;
                if entry {
                    self.bind(Label::Il(node.offset));
                    bound = true;
                }
            }
            if !bound {
                self.bind(Label::Il(node.offset));
            }
        }
        self.bind(Label::Il(code.header.code_size));
        if self.overflow {
            self.bind(Label::Overflow);
            self.emit(Inst::Call {
                symbol: runtime::THROW_OVERFLOW.to_string(),
            });
        }
        Ok(())
    }

    // ---- primitives ----

    fn emit(&mut self, inst: Inst) {
        self.out.push(inst);
    }

    fn bind(&mut self, label: Label) {
        self.emit(Inst::Bind(label));
    }

    fn fresh(&mut self) -> Label {
        let l = Label::Local(self.next_label);
        self.next_label += 1;
        l
    }

    fn missing(&self, depth: usize) -> CodegenError {
        CodegenError::MissingLocation {
            offset: self.offset,
            depth,
        }
    }

    fn unsupported(&self, what: impl Into<String>) -> CodegenError {
        CodegenError::Unsupported {
            offset: self.offset,
            what: what.into(),
        }
    }

    /// Depth and item `k` places below the top of `items`
    fn at<'n>(
        &self,
        items: &'n [StackItem],
        k: usize,
    ) -> Result<(usize, &'n StackItem), CodegenError> {
        let d = items.len().checked_sub(k + 1).ok_or_else(|| self.missing(k))?;
        Ok((d, &items[d]))
    }

    fn loc(&self, depth: usize, class: ValueClass) -> Result<Loc, CodegenError> {
        match self.alloc.location(depth, class) {
            Some(Location::Reg(r)) if r.class == ValueClass::Float => Ok(Loc::Xmm(Xmm(r.num))),
            Some(Location::Reg(r)) => Ok(Loc::Gpr(Gpr(r.num))),
            Some(Location::Slot(i)) => self
                .frame
                .slots
                .get(i as usize)
                .map(|&off| Loc::Mem(Mem::reg(RBP, off)))
                .ok_or_else(|| self.missing(depth)),
            None => Err(self.missing(depth)),
        }
    }

    fn slot(&self, depth: usize) -> Result<Mem, CodegenError> {
        match self.loc(depth, ValueClass::Vt)? {
            Loc::Mem(m) => Ok(m),
            _ => Err(self.missing(depth)),
        }
    }

    /// Register holding the integer result at `depth`, or `rax` if it lives
    /// in memory
    fn int_target(&self, depth: usize) -> Result<Gpr, CodegenError> {
        Ok(match self.loc(depth, ValueClass::Int)? {
            Loc::Gpr(r) => r,
            _ => RAX,
        })
    }

    fn float_target(&self, depth: usize) -> Result<Xmm, CodegenError> {
        Ok(match self.loc(depth, ValueClass::Float)? {
            Loc::Xmm(x) => x,
            _ => XMM0,
        })
    }

    /// Load an integer item into `dst`; with `wide` set, `int32` values are
    /// sign-extended to 64 bits
    fn load_int(
        &mut self,
        dst: Gpr,
        depth: usize,
        item: &StackItem,
        wide: bool,
    ) -> Result<(), CodegenError> {
        if let Some(c) = item.constant {
            self.emit(Inst::MovRI { dst, imm: c });
            return Ok(());
        }
        let extend = wide && item.ct == Ct::Int32;
        match self.loc(depth, ValueClass::Int)? {
            Loc::Gpr(r) if extend => self.emit(Inst::Movx {
                signed: true,
                from: Width::W32,
                dst,
                src: Rm::Reg(r),
            }),
            Loc::Gpr(r) => {
                if r != dst {
                    self.emit(Inst::MovRmR {
                        w: Width::W64,
                        dst: Rm::Reg(dst),
                        src: r,
                    });
                }
            }
            Loc::Mem(m) if extend => self.emit(Inst::Movx {
                signed: true,
                from: Width::W32,
                dst,
                src: Rm::Mem(m),
            }),
            Loc::Mem(m) => self.emit(Inst::MovRRm {
                w: width(item.ct),
                dst,
                src: Rm::Mem(m),
            }),
            Loc::Xmm(_) => return Err(self.missing(depth)),
        }
        Ok(())
    }

    /// Load an `int32` item zero-extended to 64 bits
    fn load_int32_zx(
        &mut self,
        dst: Gpr,
        depth: usize,
        item: &StackItem,
    ) -> Result<(), CodegenError> {
        if let Some(c) = item.constant {
            self.emit(Inst::MovRI {
                dst,
                imm: i64::from(c as u32),
            });
            return Ok(());
        }
        let src = match self.loc(depth, ValueClass::Int)? {
            Loc::Gpr(r) => Rm::Reg(r),
            Loc::Mem(m) => Rm::Mem(m),
            Loc::Xmm(_) => return Err(self.missing(depth)),
        };
        self.emit(Inst::MovRRm {
            w: Width::W32,
            dst,
            src,
        });
        Ok(())
    }

    fn store_int(&mut self, src: Gpr, depth: usize, item: &StackItem) -> Result<(), CodegenError> {
        match self.loc(depth, ValueClass::Int)? {
            Loc::Gpr(r) => {
                if r != src {
                    self.emit(Inst::MovRmR {
                        w: Width::W64,
                        dst: Rm::Reg(r),
                        src,
                    });
                }
            }
            Loc::Mem(m) => self.emit(Inst::MovRmR {
                w: width(item.ct),
                dst: Rm::Mem(m),
                src,
            }),
            Loc::Xmm(_) => return Err(self.missing(depth)),
        }
        Ok(())
    }

    /// Integer operand as an ALU source: an immediate when it is a known
    /// constant that fits, otherwise its location
    fn int_src(
        &mut self,
        depth: usize,
        item: &StackItem,
        wide: bool,
        scratch: Gpr,
    ) -> Result<Src, CodegenError> {
        if let Some(imm) = item.constant.and_then(|c| i32::try_from(c).ok()) {
            return Ok(Src::Imm(imm));
        }
        if wide && item.ct == Ct::Int32 {
            self.load_int(scratch, depth, item, true)?;
            return Ok(Src::Rm(Rm::Reg(scratch)));
        }
        match self.loc(depth, ValueClass::Int)? {
            Loc::Gpr(r) => Ok(Src::Rm(Rm::Reg(r))),
            Loc::Mem(m) => Ok(Src::Rm(Rm::Mem(m))),
            Loc::Xmm(_) => Err(self.missing(depth)),
        }
    }

    fn alu(&mut self, op: Alu, w: Width, dst: Gpr, src: Src) {
        self.emit(match src {
            Src::Imm(imm) => Inst::AluRmI {
                op,
                w,
                dst: Rm::Reg(dst),
                imm,
            },
            Src::Rm(src) => Inst::AluRRm { op, w, dst, src },
        });
    }

    fn load_float(&mut self, dst: Xmm, depth: usize) -> Result<(), CodegenError> {
        match self.loc(depth, ValueClass::Float)? {
            Loc::Xmm(x) => {
                if x != dst {
                    self.emit(Inst::MovXX { dst, src: x });
                }
            }
            Loc::Mem(m) => self.emit(Inst::SseOp {
                op: Sse::Movsd,
                dst,
                src: XRm::Mem(m),
            }),
            Loc::Gpr(_) => return Err(self.missing(depth)),
        }
        Ok(())
    }

    fn float_src(&self, depth: usize) -> Result<XRm, CodegenError> {
        match self.loc(depth, ValueClass::Float)? {
            Loc::Xmm(x) => Ok(XRm::Reg(x)),
            Loc::Mem(m) => Ok(XRm::Mem(m)),
            Loc::Gpr(_) => Err(self.missing(depth)),
        }
    }

    fn store_float(&mut self, src: Xmm, depth: usize) -> Result<(), CodegenError> {
        match self.loc(depth, ValueClass::Float)? {
            Loc::Xmm(x) => {
                if x != src {
                    self.emit(Inst::MovXX { dst: x, src });
                }
            }
            Loc::Mem(m) => self.emit(Inst::SseStore {
                single: false,
                dst: m,
                src,
            }),
            Loc::Gpr(_) => return Err(self.missing(depth)),
        }
        Ok(())
    }

    /// Copy `size` bytes through `rax`
    fn copy_mem(&mut self, dst: &Mem, src: &Mem, size: u32) {
        let mut done = 0;
        for chunk in [8u32, 4, 2, 1] {
            while size - done >= chunk {
                let w = Width::of_size(chunk);
                let off = done as i32;
                self.emit(Inst::MovRRm {
                    w,
                    dst: RAX,
                    src: Rm::Mem(src.offset(off)),
                });
                self.emit(Inst::MovRmR {
                    w,
                    dst: Rm::Mem(dst.offset(off)),
                    src: RAX,
                });
                done += chunk;
            }
        }
    }

    /// Copy a stack value between depths
    fn copy_value(&mut self, from: usize, to: usize, item: &StackItem) -> Result<(), CodegenError> {
        let class = item.class();
        let (src, dst) = (self.loc(from, class)?, self.loc(to, class)?);
        if src == dst {
            return Ok(());
        }
        match class {
            ValueClass::Int => {
                let r = self.int_target(to)?;
                self.load_int(r, from, item, false)?;
                self.store_int(r, to, item)
            }
            ValueClass::Float => {
                let x = self.float_target(to)?;
                self.load_float(x, from)?;
                self.store_float(x, to)
            }
            ValueClass::Vt => {
                let (src, dst) = (self.slot(from)?, self.slot(to)?);
                self.copy_mem(&dst, &src, item.size);
                Ok(())
            }
        }
    }

    /// Load a `size`-byte value of type `ct` from memory into `depth`
    fn load_mem(
        &mut self,
        src: Mem,
        size: u32,
        signed: bool,
        ct: Ct,
        depth: usize,
        item: &StackItem,
    ) -> Result<(), CodegenError> {
        match ct.class() {
            ValueClass::Float => {
                let x = self.float_target(depth)?;
                if size == 4 {
                    self.emit(Inst::SseOp {
                        op: Sse::Movss,
                        dst: x,
                        src: XRm::Mem(src),
                    });
                    self.emit(Inst::SseOp {
                        op: Sse::Cvtss2sd,
                        dst: x,
                        src: XRm::Reg(x),
                    });
                } else {
                    self.emit(Inst::SseOp {
                        op: Sse::Movsd,
                        dst: x,
                        src: XRm::Mem(src),
                    });
                }
                self.store_float(x, depth)
            }
            ValueClass::Vt => {
                let dst = self.slot(depth)?;
                self.copy_mem(&dst, &src, size);
                Ok(())
            }
            ValueClass::Int => {
                let r = self.int_target(depth)?;
                let src = Rm::Mem(src);
                self.emit(match size {
                    1 | 2 => Inst::Movx {
                        signed,
                        from: Width::of_size(size),
                        dst: r,
                        src,
                    },
                    4 if signed && ct != Ct::Int32 => Inst::Movx {
                        signed: true,
                        from: Width::W32,
                        dst: r,
                        src,
                    },
                    4 => Inst::MovRRm {
                        w: Width::W32,
                        dst: r,
                        src,
                    },
                    _ => Inst::MovRRm {
                        w: Width::W64,
                        dst: r,
                        src,
                    },
                });
                self.store_int(r, depth, item)
            }
        }
    }

    /// Store the value at `depth` to memory as a `size`-byte value
    fn store_mem(
        &mut self,
        dst: Mem,
        size: u32,
        depth: usize,
        item: &StackItem,
    ) -> Result<(), CodegenError> {
        match item.class() {
            ValueClass::Float => {
                let x = match self.loc(depth, ValueClass::Float)? {
                    Loc::Xmm(x) => x,
                    _ => {
                        self.load_float(XMM0, depth)?;
                        XMM0
                    }
                };
                if size == 4 {
                    self.emit(Inst::SseOp {
                        op: Sse::Cvtsd2ss,
                        dst: XMM0,
                        src: XRm::Reg(x),
                    });
                    self.emit(Inst::SseStore {
                        single: true,
                        dst,
                        src: XMM0,
                    });
                } else {
                    self.emit(Inst::SseStore {
                        single: false,
                        dst,
                        src: x,
                    });
                }
            }
            ValueClass::Vt => {
                let src = self.slot(depth)?;
                self.copy_mem(&dst, &src, size);
            }
            ValueClass::Int => {
                let w = Width::of_size(size);
                if let Some(imm) = item.constant.and_then(|c| i32::try_from(c).ok()) {
                    self.emit(Inst::MovRmI {
                        w,
                        dst: Rm::Mem(dst),
                        imm,
                    });
                    return Ok(());
                }
                let wide = size == 8;
                let r = match self.loc(depth, ValueClass::Int)? {
                    Loc::Gpr(r) if !(wide && item.ct == Ct::Int32) => r,
                    _ => {
                        self.load_int(RAX, depth, item, wide)?;
                        RAX
                    }
                };
                self.emit(Inst::MovRmR {
                    w,
                    dst: Rm::Mem(dst),
                    src: r,
                });
            }
        }
        Ok(())
    }

    fn check_overflow(&mut self, cc: Cond) {
        self.overflow = true;
        self.emit(Inst::Jcc {
            cc,
            target: Label::Overflow,
        });
    }

    fn local(&self, n: u32) -> Result<(Mem, LocalVar), CodegenError> {
        match (self.code.locals.get(n as usize), self.frame.locals.get(n as usize)) {
            (Some(var), Some(&off)) => Ok((Mem::reg(RBP, off), var.clone())),
            _ => Err(self.unsupported(format!("local {}", n))),
        }
    }

    /// Floating point arguments are passed as doubles
    fn arg(&self, n: u32) -> Result<(Mem, LocalVar), CodegenError> {
        match (self.code.args.get(n as usize), self.frame.args.get(n as usize)) {
            (Some(var), Some(&off)) => {
                let mut var = var.clone();
                if var.ct == Ct::Float {
                    var.size = 8;
                }
                Ok((Mem::reg(RBP, off), var))
            }
            _ => Err(self.unsupported(format!("argument {}", n))),
        }
    }

    fn lea_to(&mut self, depth: usize, item: &StackItem, src: Mem) -> Result<(), CodegenError> {
        let r = self.int_target(depth)?;
        self.emit(Inst::Lea { dst: r, src });
        self.store_int(r, depth, item)
    }

    // ---- nodes ----

    fn lower(&mut self, node: &IrNode) -> Result<(), CodegenError> {
        let before = node.stack_before.items();
        let after = node.stack_after.items();
        match &node.op {
            IrOp::Enter => self.prologue(),
            IrOp::EnterHandler { clause, filter } => {
                let label = if *filter {
                    Label::Filter(*clause)
                } else {
                    Label::Handler(*clause)
                };
                self.bind(label);
                self.emit(Inst::Push { src: RBP });
                self.emit(Inst::MovRRm {
                    w: Width::W64,
                    dst: RBP,
                    src: Rm::Mem(Mem::reg(RSP, 16)),
                });
                if node.ct == Ct::Object {
                    let (d, exc) = self.at(after, 0)?;
                    self.emit(Inst::MovRRm {
                        w: Width::W64,
                        dst: RAX,
                        src: Rm::Mem(Mem::reg(RSP, 24)),
                    });
                    self.store_int(RAX, d, exc)?;
                }
            }
            IrOp::Nop | IrOp::Pop => {}

            IrOp::Ldc(v) => {
                let (d, item) = self.at(after, 0)?;
                match self.loc(d, ValueClass::Int)? {
                    Loc::Gpr(r) => self.emit(Inst::MovRI { dst: r, imm: *v }),
                    Loc::Mem(m) => match i32::try_from(*v) {
                        Ok(imm) => self.emit(Inst::MovRmI {
                            w: width(node.ct),
                            dst: Rm::Mem(m),
                            imm,
                        }),
                        Err(_) => {
                            self.emit(Inst::MovRI { dst: RAX, imm: *v });
                            self.store_int(RAX, d, item)?;
                        }
                    },
                    Loc::Xmm(_) => return Err(self.missing(d)),
                }
            }
            IrOp::LdcR(v) => {
                let (d, _) = self.at(after, 0)?;
                self.emit(Inst::MovRI {
                    dst: RAX,
                    imm: v.to_bits() as i64,
                });
                match self.loc(d, ValueClass::Float)? {
                    Loc::Xmm(x) => self.emit(Inst::MovqToXmm { dst: x, src: RAX }),
                    Loc::Mem(m) => self.emit(Inst::MovRmR {
                        w: Width::W64,
                        dst: Rm::Mem(m),
                        src: RAX,
                    }),
                    Loc::Gpr(_) => return Err(self.missing(d)),
                }
            }
            IrOp::LdLabAddr { symbol, addend } => {
                let (d, item) = self.at(after, 0)?;
                self.lea_to(d, item, Mem::symbol(symbol.as_str(), *addend))?;
            }

            IrOp::LdLoc(n) => {
                let (mem, var) = self.local(*n)?;
                let (d, item) = self.at(after, 0)?;
                self.load_mem(mem, var.size, var.signed, var.ct, d, item)?;
            }
            IrOp::StLoc(n) => {
                let (mem, var) = self.local(*n)?;
                let (d, item) = self.at(before, 0)?;
                self.store_mem(mem, var.size, d, item)?;
            }
            IrOp::LdLoca(n) => {
                let (mem, _) = self.local(*n)?;
                let (d, item) = self.at(after, 0)?;
                self.lea_to(d, item, mem)?;
            }
            IrOp::LdArg(n) => {
                let (mem, var) = self.arg(*n)?;
                let (d, item) = self.at(after, 0)?;
                self.load_mem(mem, var.size, var.signed, var.ct, d, item)?;
            }
            IrOp::StArg(n) => {
                let (mem, var) = self.arg(*n)?;
                let (d, item) = self.at(before, 0)?;
                self.store_mem(mem, var.size, d, item)?;
            }
            IrOp::LdArga(n) => {
                let (mem, _) = self.arg(*n)?;
                let (d, item) = self.at(after, 0)?;
                self.lea_to(d, item, mem)?;
            }

            IrOp::Pick(n) => {
                let (from, item) = self.at(before, *n as usize)?;
                let (to, _) = self.at(after, 0)?;
                self.copy_value(from, to, item)?;
            }
            IrOp::Nip(n) => {
                let (from, item) = self.at(before, 0)?;
                let to = from.checked_sub(*n as usize).ok_or_else(|| self.missing(from))?;
                self.copy_value(from, to, item)?;
            }

            IrOp::Bin {
                op,
                unsigned,
                overflow,
            } => self.binary(node, *op, *unsigned, *overflow)?,
            IrOp::Shift(op) => self.shift(node, *op)?,
            IrOp::Neg | IrOp::Not => self.unary(node)?,
            IrOp::Conv {
                to,
                unsigned,
                overflow,
            } => self.conv(node, *to, *unsigned, *overflow)?,
            IrOp::Cmp(cc) => self.compare(node, *cc)?,

            IrOp::Br(target) => self.emit(Inst::Jmp {
                target: Label::Il(*target),
            }),
            IrOp::BrIf { cc, target } => self.branch_if(node, *cc, Label::Il(*target))?,
            IrOp::BrZero { nonzero, target } => {
                let (d, item) = self.at(before, 0)?;
                let w = width(item.ct);
                match self.loc(d, ValueClass::Int)? {
                    Loc::Gpr(r) => self.emit(Inst::Test {
                        w,
                        dst: Rm::Reg(r),
                        src: r,
                    }),
                    Loc::Mem(m) => self.emit(Inst::AluRmI {
                        op: Alu::Cmp,
                        w,
                        dst: Rm::Mem(m),
                        imm: 0,
                    }),
                    Loc::Xmm(_) => return Err(self.missing(d)),
                }
                self.emit(Inst::Jcc {
                    cc: if *nonzero { Cond::Ne } else { Cond::E },
                    target: Label::Il(*target),
                });
            }
            IrOp::Switch(targets) => {
                let (d, item) = self.at(before, 0)?;
                self.load_int(RAX, d, item, false)?;
                let w = width(item.ct);
                for (i, &t) in targets.iter().enumerate() {
                    self.emit(Inst::AluRmI {
                        op: Alu::Cmp,
                        w,
                        dst: Rm::Reg(RAX),
                        imm: i as i32,
                    });
                    self.emit(Inst::Jcc {
                        cc: Cond::E,
                        target: Label::Il(t),
                    });
                }
            }

            IrOp::Call { symbol, nparams } => {
                self.call(node, *nparams, CallTarget::Symbol(symbol))?
            }
            IrOp::CallVirt { slot, nparams } => {
                self.call(node, *nparams, CallTarget::Virtual(*slot))?
            }
            IrOp::CallInterface {
                iface,
                slot,
                nparams,
            } => self.call(node, *nparams, CallTarget::Interface(iface, *slot))?,
            IrOp::CallI { nparams } => self.call(node, *nparams, CallTarget::Indirect)?,
            IrOp::Ret => {
                if node.ct != Ct::Void {
                    let (d, item) = self.at(before, 0)?;
                    match node.ct.class() {
                        ValueClass::Int => self.load_int(RAX, d, item, node.ct != Ct::Int32)?,
                        ValueClass::Float => self.load_float(XMM0, d)?,
                        ValueClass::Vt => {
                            let m = self.slot(d)?;
                            self.emit(Inst::MovRRm {
                                w: Width::W64,
                                dst: RAX,
                                src: Rm::Mem(m),
                            });
                        }
                    }
                }
                self.epilogue();
            }

            IrOp::LdInd { size, signed } => {
                let (da, addr) = self.at(before, 0)?;
                self.load_int(RDX, da, addr, false)?;
                let (d, item) = self.at(after, 0)?;
                self.load_mem(Mem::reg(RDX, 0), *size, *signed, node.ct, d, item)?;
            }
            IrOp::StInd { size } => {
                let (dv, value) = self.at(before, 0)?;
                let (da, addr) = self.at(before, 1)?;
                self.load_int(RDX, da, addr, false)?;
                self.store_mem(Mem::reg(RDX, 0), *size, dv, value)?;
            }
            IrOp::LdVtField {
                offset,
                size,
                signed,
            } => {
                let (ds, _) = self.at(before, 0)?;
                let src = self.slot(ds)?.offset(*offset as i32);
                let (d, item) = self.at(after, 0)?;
                self.load_mem(src, *size, *signed, node.ct, d, item)?;
            }
            IrOp::LocAlloc => self.localloc(node)?,
            IrOp::ZeroMem { size } => {
                let (d, addr) = self.at(before, 0)?;
                self.load_int(RDX, d, addr, false)?;
                self.zero(RDX, 0, *size);
            }

            IrOp::CallFinally(clause) => {
                self.emit(Inst::PushI { imm: 0 });
                self.emit(Inst::Push { src: RBP });
                self.emit(Inst::CallLabel {
                    target: Label::Handler(*clause),
                });
                self.emit(Inst::AluRmI {
                    op: Alu::Add,
                    w: Width::W64,
                    dst: Rm::Reg(RSP),
                    imm: 16,
                });
            }
            IrOp::EndFinally => {
                self.emit(Inst::Pop { dst: RBP });
                self.emit(Inst::Ret);
            }
            IrOp::EndFilter => {
                let (d, item) = self.at(before, 0)?;
                self.load_int(RAX, d, item, false)?;
                self.emit(Inst::Pop { dst: RBP });
                self.emit(Inst::Ret);
            }
            IrOp::LeaveHandler(target) => {
                // the runtime resumes at the address returned in rax
                self.emit(Inst::Lea {
                    dst: RAX,
                    src: Mem::label(Label::Il(*target)),
                });
                self.emit(Inst::Pop { dst: RBP });
                self.emit(Inst::Ret);
            }
        }
        Ok(())
    }

    fn prologue(&mut self) {
        self.emit(Inst::Push { src: RBP });
        self.emit(Inst::MovRmR {
            w: Width::W64,
            dst: Rm::Reg(RBP),
            src: RSP,
        });
        if self.frame.size > 0 {
            self.emit(Inst::AluRmI {
                op: Alu::Sub,
                w: Width::W64,
                dst: Rm::Reg(RSP),
                imm: self.frame.size as i32,
            });
        }
        for (reg, off) in self.frame.callee_saved.clone() {
            self.emit(Inst::MovRmR {
                w: Width::W64,
                dst: Rm::Mem(Mem::reg(RBP, off)),
                src: reg,
            });
        }
        self.zero(RBP, self.frame.locals_base, self.frame.locals_size);
    }

    fn epilogue(&mut self) {
        for (reg, off) in self.frame.callee_saved.clone() {
            self.emit(Inst::MovRRm {
                w: Width::W64,
                dst: reg,
                src: Rm::Mem(Mem::reg(RBP, off)),
            });
        }
        self.emit(Inst::Leave);
        self.emit(Inst::Ret);
    }

    /// Zero `size` bytes at `base + disp`: immediate stores for small
    /// blocks, `rep stosb` otherwise
    fn zero(&mut self, base: Gpr, disp: i32, size: u32) {
        if size <= 64 {
            let mut done = 0;
            for chunk in [8u32, 4, 2, 1] {
                while size - done >= chunk {
                    self.emit(Inst::MovRmI {
                        w: Width::of_size(chunk),
                        dst: Rm::Mem(Mem::reg(base, disp + done as i32)),
                        imm: 0,
                    });
                    done += chunk;
                }
            }
            return;
        }
        self.emit(Inst::MovRmR {
            w: Width::W64,
            dst: Rm::Reg(R11),
            src: RDI,
        });
        self.emit(Inst::Lea {
            dst: RDI,
            src: Mem::reg(base, disp),
        });
        self.emit(Inst::MovRI {
            dst: RCX,
            imm: i64::from(size),
        });
        self.emit(Inst::AluRmR {
            op: Alu::Xor,
            w: Width::W32,
            dst: Rm::Reg(RAX),
            src: RAX,
        });
        self.emit(Inst::RepStosb);
        self.emit(Inst::MovRmR {
            w: Width::W64,
            dst: Rm::Reg(RDI),
            src: R11,
        });
    }

    fn binary(
        &mut self,
        node: &IrNode,
        op: BinOp,
        unsigned: bool,
        overflow: bool,
    ) -> Result<(), CodegenError> {
        let before = node.stack_before.items();
        let (db, b) = self.at(before, 0)?;
        let (da, a) = self.at(before, 1)?;
        let (dr, r) = self.at(node.stack_after.items(), 0)?;

        if node.ct == Ct::Float {
            let sse = match op {
                BinOp::Add => Sse::Addsd,
                BinOp::Sub => Sse::Subsd,
                BinOp::Mul => Sse::Mulsd,
                BinOp::Div => Sse::Divsd,
                _ => return Err(self.unsupported(format!("floating point {}", op.name()))),
            };
            let x = self.float_target(dr)?;
            self.load_float(x, da)?;
            let src = self.float_src(db)?;
            self.emit(Inst::SseOp { op: sse, dst: x, src });
            return self.store_float(x, dr);
        }

        let w = width(node.ct);
        let wide = w == Width::W64;
        match op {
            BinOp::Add | BinOp::Sub | BinOp::And | BinOp::Or | BinOp::Xor => {
                let alu = match op {
                    BinOp::Add => Alu::Add,
                    BinOp::Sub => Alu::Sub,
                    BinOp::And => Alu::And,
                    BinOp::Or => Alu::Or,
                    _ => Alu::Xor,
                };
                self.load_int(RAX, da, a, wide)?;
                let src = self.int_src(db, b, wide, RCX)?;
                self.alu(alu, w, RAX, src);
                if overflow {
                    self.check_overflow(if unsigned { Cond::B } else { Cond::O });
                }
            }
            BinOp::Mul if overflow && unsigned => {
                self.load_int(RAX, da, a, wide)?;
                self.load_int(RCX, db, b, wide)?;
                self.emit(Inst::Unary {
                    op: Unary::Mul,
                    w,
                    src: Rm::Reg(RCX),
                });
                self.check_overflow(Cond::B);
            }
            BinOp::Mul => {
                self.load_int(RAX, da, a, wide)?;
                let inst = match self.int_src(db, b, wide, RCX)? {
                    Src::Imm(imm) => Inst::ImulI {
                        w,
                        dst: RAX,
                        src: Rm::Reg(RAX),
                        imm,
                    },
                    Src::Rm(src) => Inst::Imul { w, dst: RAX, src },
                };
                self.emit(inst);
                if overflow {
                    self.check_overflow(Cond::O);
                }
            }
            BinOp::Div | BinOp::Rem => {
                self.load_int(RAX, da, a, wide)?;
                self.load_int(RCX, db, b, wide)?;
                if unsigned {
                    self.emit(Inst::AluRmR {
                        op: Alu::Xor,
                        w: Width::W32,
                        dst: Rm::Reg(RDX),
                        src: RDX,
                    });
                    self.emit(Inst::Unary {
                        op: Unary::Div,
                        w,
                        src: Rm::Reg(RCX),
                    });
                } else {
                    self.emit(Inst::SignExtendAx { w });
                    self.emit(Inst::Unary {
                        op: Unary::Idiv,
                        w,
                        src: Rm::Reg(RCX),
                    });
                }
                if op == BinOp::Rem {
                    self.emit(Inst::MovRmR {
                        w: Width::W64,
                        dst: Rm::Reg(RAX),
                        src: RDX,
                    });
                }
            }
        }
        self.store_int(RAX, dr, r)
    }

    fn shift(&mut self, node: &IrNode, op: ShiftOp) -> Result<(), CodegenError> {
        let before = node.stack_before.items();
        let (db, b) = self.at(before, 0)?;
        let (da, a) = self.at(before, 1)?;
        let (dr, r) = self.at(node.stack_after.items(), 0)?;
        let w = width(node.ct);
        let op = match op {
            ShiftOp::Shl => Shift::Shl,
            ShiftOp::Shr => Shift::Sar,
            ShiftOp::ShrUn => Shift::Shr,
        };
        self.load_int(RAX, da, a, false)?;
        match b.constant {
            Some(c) => {
                let mask = if w == Width::W64 { 63 } else { 31 };
                self.emit(Inst::ShiftI {
                    op,
                    w,
                    dst: Rm::Reg(RAX),
                    imm: (c & mask) as u8,
                });
            }
            None => {
                self.load_int(RCX, db, b, false)?;
                self.emit(Inst::ShiftCl {
                    op,
                    w,
                    dst: Rm::Reg(RAX),
                });
            }
        }
        self.store_int(RAX, dr, r)
    }

    fn unary(&mut self, node: &IrNode) -> Result<(), CodegenError> {
        let (d, a) = self.at(node.stack_before.items(), 0)?;
        let (dr, r) = self.at(node.stack_after.items(), 0)?;
        if node.ct == Ct::Float {
            // flip the sign bit
            self.load_float(XMM0, d)?;
            self.emit(Inst::MovqFromXmm { dst: RAX, src: XMM0 });
            self.emit(Inst::MovRI {
                dst: R11,
                imm: i64::MIN,
            });
            self.emit(Inst::AluRRm {
                op: Alu::Xor,
                w: Width::W64,
                dst: RAX,
                src: Rm::Reg(R11),
            });
            self.emit(Inst::MovqToXmm { dst: XMM0, src: RAX });
            return self.store_float(XMM0, dr);
        }
        let op = if node.op == IrOp::Neg {
            Unary::Neg
        } else {
            Unary::Not
        };
        self.load_int(RAX, d, a, false)?;
        self.emit(Inst::Unary {
            op,
            w: width(node.ct),
            src: Rm::Reg(RAX),
        });
        self.store_int(RAX, dr, r)
    }

    fn round_single(&mut self, x: Xmm) {
        self.emit(Inst::SseOp {
            op: Sse::Cvtsd2ss,
            dst: x,
            src: XRm::Reg(x),
        });
        self.emit(Inst::SseOp {
            op: Sse::Cvtss2sd,
            dst: x,
            src: XRm::Reg(x),
        });
    }

    fn conv(
        &mut self,
        node: &IrNode,
        to: ElementType,
        unsigned: bool,
        overflow: bool,
    ) -> Result<(), CodegenError> {
        let (ds, s) = self.at(node.stack_before.items(), 0)?;
        let (dr, r) = self.at(node.stack_after.items(), 0)?;
        match (s.class(), node.ct.class()) {
            (ValueClass::Float, ValueClass::Float) => {
                self.load_float(XMM0, ds)?;
                if to == ElementType::R4 {
                    self.round_single(XMM0);
                }
                self.store_float(XMM0, dr)
            }
            (ValueClass::Int, ValueClass::Float) => {
                self.int_to_float(ds, s, unsigned)?;
                if to == ElementType::R4 {
                    self.round_single(XMM0);
                }
                self.store_float(XMM0, dr)
            }
            (ValueClass::Float, ValueClass::Int) => {
                let (bits, signed_target) = int_target_bits(to, 8)
                    .ok_or_else(|| self.unsupported(format!("conversion to {:?}", to)))?;
                self.load_float(XMM0, ds)?;
                self.emit(Inst::Cvttsd2si { dst: RAX, src: XMM0 });
                if overflow {
                    // out of range and NaN both produce the integer indefinite value
                    self.emit(Inst::MovRI {
                        dst: RCX,
                        imm: i64::MIN,
                    });
                    self.emit(Inst::AluRRm {
                        op: Alu::Cmp,
                        w: Width::W64,
                        dst: RAX,
                        src: Rm::Reg(RCX),
                    });
                    self.check_overflow(Cond::E);
                }
                self.narrow(bits, signed_target, false, overflow);
                self.store_int(RAX, dr, r)
            }
            (ValueClass::Int, ValueClass::Int) => {
                let (bits, signed_target) = int_target_bits(to, 8)
                    .ok_or_else(|| self.unsupported(format!("conversion to {:?}", to)))?;
                let unsigned_source = if overflow { unsigned } else { !signed_target };
                let zero_extend = s.ct == Ct::Int32 && unsigned_source;
                if zero_extend {
                    self.load_int32_zx(RAX, ds, s)?;
                } else {
                    self.load_int(RAX, ds, s, true)?;
                }
                self.narrow(bits, signed_target, unsigned, overflow);
                self.store_int(RAX, dr, r)
            }
            _ => Err(self.unsupported(format!("conversion of {} to {:?}", s.ct, to))),
        }
    }

    /// Bring the 64-bit value in `rax` into range of a `bits`-wide target,
    /// either by truncating or by checking that nothing is lost
    fn narrow(&mut self, bits: u32, signed_target: bool, unsigned_source: bool, overflow: bool) {
        let truncate = |dst: Gpr| match bits {
            8 | 16 => Some(Inst::Movx {
                signed: signed_target,
                from: Width::of_size(bits / 8),
                dst,
                src: Rm::Reg(RAX),
            }),
            32 if signed_target => Some(Inst::Movx {
                signed: true,
                from: Width::W32,
                dst,
                src: Rm::Reg(RAX),
            }),
            32 => Some(Inst::MovRRm {
                w: Width::W32,
                dst,
                src: Rm::Reg(RAX),
            }),
            _ => None,
        };
        if !overflow {
            if bits < 32 {
                if let Some(inst) = truncate(RAX) {
                    self.emit(inst);
                }
            }
            return;
        }
        let sign_test = if bits >= 64 {
            unsigned_source == signed_target
        } else {
            unsigned_source
        };
        if sign_test {
            self.emit(Inst::Test {
                w: Width::W64,
                dst: Rm::Reg(RAX),
                src: RAX,
            });
            self.check_overflow(Cond::S);
        }
        if let Some(inst) = truncate(RCX) {
            self.emit(inst);
            self.emit(Inst::AluRRm {
                op: Alu::Cmp,
                w: Width::W64,
                dst: RAX,
                src: Rm::Reg(RCX),
            });
            self.check_overflow(Cond::Ne);
        }
    }

    /// Convert the integer at `depth` to a double in `xmm0`
    fn int_to_float(
        &mut self,
        depth: usize,
        item: &StackItem,
        unsigned: bool,
    ) -> Result<(), CodegenError> {
        if item.ct == Ct::Int32 {
            if unsigned {
                self.load_int32_zx(RAX, depth, item)?;
            } else {
                self.load_int(RAX, depth, item, true)?;
            }
            self.emit(Inst::Cvtsi2sd {
                w: Width::W64,
                dst: XMM0,
                src: RAX,
            });
            return Ok(());
        }
        self.load_int(RAX, depth, item, false)?;
        if !unsigned {
            self.emit(Inst::Cvtsi2sd {
                w: Width::W64,
                dst: XMM0,
                src: RAX,
            });
            return Ok(());
        }
        // values with the top bit set: halve, keeping the low bit for
        // rounding, convert and double
        let (big, done) = (self.fresh(), self.fresh());
        self.emit(Inst::Test {
            w: Width::W64,
            dst: Rm::Reg(RAX),
            src: RAX,
        });
        self.emit(Inst::Jcc {
            cc: Cond::S,
            target: big,
        });
        self.emit(Inst::Cvtsi2sd {
            w: Width::W64,
            dst: XMM0,
            src: RAX,
        });
        self.emit(Inst::Jmp { target: done });
        self.bind(big);
        self.emit(Inst::MovRmR {
            w: Width::W64,
            dst: Rm::Reg(RCX),
            src: RAX,
        });
        self.emit(Inst::ShiftI {
            op: Shift::Shr,
            w: Width::W64,
            dst: Rm::Reg(RCX),
            imm: 1,
        });
        self.emit(Inst::AluRmI {
            op: Alu::And,
            w: Width::W32,
            dst: Rm::Reg(RAX),
            imm: 1,
        });
        self.emit(Inst::AluRRm {
            op: Alu::Or,
            w: Width::W64,
            dst: RCX,
            src: Rm::Reg(RAX),
        });
        self.emit(Inst::Cvtsi2sd {
            w: Width::W64,
            dst: XMM0,
            src: RCX,
        });
        self.emit(Inst::SseOp {
            op: Sse::Addsd,
            dst: XMM0,
            src: XRm::Reg(XMM0),
        });
        self.bind(done);
        Ok(())
    }

    /// Set the flags for comparing the two top items; returns how to read
    /// them
    fn compare_flags(&mut self, node: &IrNode, cc: CondCode) -> Result<FloatOrInt, CodegenError> {
        let before = node.stack_before.items();
        let (db, b) = self.at(before, 0)?;
        let (da, a) = self.at(before, 1)?;
        if node.ct == Ct::Float {
            let test = float_test(cc).ok_or_else(|| self.unsupported("constant float comparison"))?;
            let (first, second) = match test {
                FloatTest::Flag { swap: true, .. } => (db, da),
                _ => (da, db),
            };
            self.load_float(XMM0, first)?;
            let src = self.float_src(second)?;
            self.emit(Inst::SseOp {
                op: Sse::Ucomisd,
                dst: XMM0,
                src,
            });
            return Ok(FloatOrInt::Float(test));
        }
        let cond = int_cond(cc).ok_or_else(|| self.unsupported("constant comparison"))?;
        let w = width(node.ct);
        let wide = w == Width::W64;
        self.load_int(RAX, da, a, wide)?;
        let src = self.int_src(db, b, wide, RCX)?;
        self.alu(Alu::Cmp, w, RAX, src);
        Ok(FloatOrInt::Int(cond))
    }

    fn compare(&mut self, node: &IrNode, cc: CondCode) -> Result<(), CodegenError> {
        let (dr, r) = self.at(node.stack_after.items(), 0)?;
        if matches!(cc, CondCode::Always | CondCode::Never) {
            self.emit(Inst::MovRI {
                dst: RAX,
                imm: i64::from(cc == CondCode::Always),
            });
            return self.store_int(RAX, dr, r);
        }
        match self.compare_flags(node, cc)? {
            FloatOrInt::Int(cond) | FloatOrInt::Float(FloatTest::Flag { cond, .. }) => {
                self.emit(Inst::Setcc { cc: cond, dst: RAX });
            }
            FloatOrInt::Float(FloatTest::Eq) => self.combine_flags(Cond::E, Cond::Np, Alu::And),
            FloatOrInt::Float(FloatTest::Ne) => self.combine_flags(Cond::Ne, Cond::P, Alu::Or),
        }
        self.emit(Inst::Movx {
            signed: false,
            from: Width::W8,
            dst: RAX,
            src: Rm::Reg(RAX),
        });
        self.store_int(RAX, dr, r)
    }

    fn combine_flags(&mut self, first: Cond, second: Cond, op: Alu) {
        self.emit(Inst::Setcc { cc: first, dst: RAX });
        self.emit(Inst::Setcc { cc: second, dst: RCX });
        self.emit(Inst::AluRmR {
            op,
            w: Width::W8,
            dst: Rm::Reg(RAX),
            src: RCX,
        });
    }

    fn branch_if(
        &mut self,
        node: &IrNode,
        cc: CondCode,
        target: Label,
    ) -> Result<(), CodegenError> {
        match cc {
            CondCode::Always => {
                self.emit(Inst::Jmp { target });
                return Ok(());
            }
            CondCode::Never => return Ok(()),
            _ => {}
        }
        match self.compare_flags(node, cc)? {
            FloatOrInt::Int(cond) | FloatOrInt::Float(FloatTest::Flag { cond, .. }) => {
                self.emit(Inst::Jcc { cc: cond, target });
            }
            FloatOrInt::Float(FloatTest::Eq) => {
                let skip = self.fresh();
                self.emit(Inst::Jcc {
                    cc: Cond::P,
                    target: skip,
                });
                self.emit(Inst::Jcc { cc: Cond::E, target });
                self.bind(skip);
            }
            FloatOrInt::Float(FloatTest::Ne) => {
                self.emit(Inst::Jcc { cc: Cond::P, target });
                self.emit(Inst::Jcc { cc: Cond::Ne, target });
            }
        }
        Ok(())
    }

    /// Pool registers that hold values surviving a call and are not
    /// preserved by the callee
    fn live_caller_saved(&self, items: &[StackItem], live: usize) -> Vec<(PhysReg, i32)> {
        let mut saved = Vec::new();
        for (depth, item) in items.iter().take(live).enumerate() {
            if let Some(Location::Reg(reg)) = self.alloc.location(depth, item.class()) {
                if let Some(&off) = self.frame.caller_saved.get(&reg) {
                    saved.push((reg, off));
                }
            }
        }
        saved
    }

    fn save(&mut self, reg: PhysReg, off: i32) {
        let mem = Mem::reg(RBP, off);
        self.emit(match reg.class {
            ValueClass::Float => Inst::SseStore {
                single: false,
                dst: mem,
                src: Xmm(reg.num),
            },
            _ => Inst::MovRmR {
                w: Width::W64,
                dst: Rm::Mem(mem),
                src: Gpr(reg.num),
            },
        });
    }

    fn restore(&mut self, reg: PhysReg, off: i32) {
        let mem = Mem::reg(RBP, off);
        self.emit(match reg.class {
            ValueClass::Float => Inst::SseOp {
                op: Sse::Movsd,
                dst: Xmm(reg.num),
                src: XRm::Mem(mem),
            },
            _ => Inst::MovRRm {
                w: Width::W64,
                dst: Gpr(reg.num),
                src: Rm::Mem(mem),
            },
        });
    }

    fn push_arg(&mut self, depth: usize, item: &StackItem) -> Result<(), CodegenError> {
        match item.class() {
            ValueClass::Int => {
                if let Some(imm) = item.constant.and_then(|c| i32::try_from(c).ok()) {
                    self.emit(Inst::PushI { imm });
                    return Ok(());
                }
                match self.loc(depth, ValueClass::Int)? {
                    Loc::Gpr(r) if item.ct != Ct::Int32 => self.emit(Inst::Push { src: r }),
                    _ => {
                        self.load_int(RAX, depth, item, true)?;
                        self.emit(Inst::Push { src: RAX });
                    }
                }
            }
            ValueClass::Float => {
                match self.loc(depth, ValueClass::Float)? {
                    Loc::Xmm(x) => self.emit(Inst::MovqFromXmm { dst: RAX, src: x }),
                    Loc::Mem(m) => self.emit(Inst::MovRRm {
                        w: Width::W64,
                        dst: RAX,
                        src: Rm::Mem(m),
                    }),
                    Loc::Gpr(_) => return Err(self.missing(depth)),
                }
                self.emit(Inst::Push { src: RAX });
            }
            ValueClass::Vt => {
                self.emit(Inst::AluRmI {
                    op: Alu::Sub,
                    w: Width::W64,
                    dst: Rm::Reg(RSP),
                    imm: arg_size(Ct::Vt, item.size) as i32,
                });
                let src = self.slot(depth)?;
                self.copy_mem(&Mem::reg(RSP, 0), &src, item.size);
            }
        }
        Ok(())
    }

    fn call(
        &mut self,
        node: &IrNode,
        nparams: u32,
        target: CallTarget<'_>,
    ) -> Result<(), CodegenError> {
        let items = node.stack_before.items();
        let extra = usize::from(matches!(target, CallTarget::Indirect));
        let base = items
            .len()
            .checked_sub(nparams as usize + extra)
            .ok_or_else(|| self.missing(0))?;

        let saved = self.live_caller_saved(items, base);
        for &(reg, off) in &saved {
            self.save(reg, off);
        }

        let args = &items[base..base + nparams as usize];
        let units: u32 = args.iter().map(|a| arg_size(a.ct, a.size) / 8).sum();
        let pad = units % 2 == 1;
        if pad {
            self.emit(Inst::AluRmI {
                op: Alu::Sub,
                w: Width::W64,
                dst: Rm::Reg(RSP),
                imm: 8,
            });
        }
        for (i, arg) in args.iter().enumerate().rev() {
            self.push_arg(base + i, arg)?;
        }

        match target {
            CallTarget::Symbol(symbol) => self.emit(Inst::Call {
                symbol: symbol.to_string(),
            }),
            CallTarget::Virtual(slot) => {
                self.load_int(R11, base, &items[base], false)?;
                self.emit(Inst::MovRRm {
                    w: Width::W64,
                    dst: R11,
                    src: Rm::Mem(Mem::reg(R11, 0)),
                });
                self.emit(Inst::CallRm {
                    target: Rm::Mem(Mem::reg(R11, slot as i32 * 8)),
                });
            }
            CallTarget::Interface(iface, slot) => {
                self.load_int(R11, base, &items[base], false)?;
                // vtable, then its interface map
                self.emit(Inst::MovRRm {
                    w: Width::W64,
                    dst: R11,
                    src: Rm::Mem(Mem::reg(R11, 0)),
                });
                self.emit(Inst::MovRRm {
                    w: Width::W64,
                    dst: R11,
                    src: Rm::Mem(Mem::reg(R11, 8)),
                });
                self.emit(Inst::Lea {
                    dst: RAX,
                    src: Mem::symbol(iface, 0),
                });
                let (scan, found) = (self.fresh(), self.fresh());
                self.bind(scan);
                self.emit(Inst::AluRRm {
                    op: Alu::Cmp,
                    w: Width::W64,
                    dst: RAX,
                    src: Rm::Mem(Mem::reg(R11, 0)),
                });
                self.emit(Inst::Jcc {
                    cc: Cond::E,
                    target: found,
                });
                self.emit(Inst::AluRmI {
                    op: Alu::Add,
                    w: Width::W64,
                    dst: Rm::Reg(R11),
                    imm: 16,
                });
                self.emit(Inst::Jmp { target: scan });
                self.bind(found);
                self.emit(Inst::MovRRm {
                    w: Width::W64,
                    dst: R11,
                    src: Rm::Mem(Mem::reg(R11, 8)),
                });
                self.emit(Inst::CallRm {
                    target: Rm::Mem(Mem::reg(R11, slot as i32 * 8)),
                });
            }
            CallTarget::Indirect => {
                let (d, fptr) = self.at(items, 0)?;
                self.load_int(R11, d, fptr, false)?;
                self.emit(Inst::CallRm {
                    target: Rm::Reg(R11),
                });
            }
        }

        let popped = units * 8 + if pad { 8 } else { 0 };
        if popped > 0 {
            self.emit(Inst::AluRmI {
                op: Alu::Add,
                w: Width::W64,
                dst: Rm::Reg(RSP),
                imm: popped as i32,
            });
        }
        for &(reg, off) in &saved {
            self.restore(reg, off);
        }

        if node.ct != Ct::Void {
            let (d, item) = self.at(node.stack_after.items(), 0)?;
            match node.ct.class() {
                ValueClass::Int => self.store_int(RAX, d, item)?,
                ValueClass::Float => self.store_float(XMM0, d)?,
                ValueClass::Vt => {
                    let m = self.slot(d)?;
                    self.emit(Inst::MovRmR {
                        w: Width::W64,
                        dst: Rm::Mem(m),
                        src: RAX,
                    });
                }
            }
        }
        Ok(())
    }

    fn localloc(&mut self, node: &IrNode) -> Result<(), CodegenError> {
        let (d, size) = self.at(node.stack_before.items(), 0)?;
        let (dr, r) = self.at(node.stack_after.items(), 0)?;
        if size.ct == Ct::Int32 {
            self.load_int32_zx(RCX, d, size)?;
        } else {
            self.load_int(RCX, d, size, false)?;
        }
        self.emit(Inst::AluRmI {
            op: Alu::Add,
            w: Width::W64,
            dst: Rm::Reg(RCX),
            imm: 15,
        });
        self.emit(Inst::AluRmI {
            op: Alu::And,
            w: Width::W64,
            dst: Rm::Reg(RCX),
            imm: -16,
        });
        self.emit(Inst::AluRmR {
            op: Alu::Sub,
            w: Width::W64,
            dst: Rm::Reg(RSP),
            src: RCX,
        });
        self.emit(Inst::MovRmR {
            w: Width::W64,
            dst: Rm::Reg(R11),
            src: RDI,
        });
        self.emit(Inst::MovRmR {
            w: Width::W64,
            dst: Rm::Reg(RDI),
            src: RSP,
        });
        self.emit(Inst::AluRmR {
            op: Alu::Xor,
            w: Width::W32,
            dst: Rm::Reg(RAX),
            src: RAX,
        });
        self.emit(Inst::RepStosb);
        self.emit(Inst::MovRmR {
            w: Width::W64,
            dst: Rm::Reg(RDI),
            src: R11,
        });
        self.emit(Inst::MovRmR {
            w: Width::W64,
            dst: Rm::Reg(RAX),
            src: RSP,
        });
        self.store_int(RAX, dr, r)
    }
}

/// Flags set by a comparison, and how to read them
enum FloatOrInt {
    Int(Cond),
    Float(FloatTest),
}
