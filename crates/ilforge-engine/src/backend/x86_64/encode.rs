//! Machine code encoding
//!
//! Every instruction is encoded in its smallest form: 8-bit immediates and
//! displacements where they fit, the short `eax` ALU forms, 32-bit moves for
//! constants that zero-extend. Branches start short and are widened one at a
//! time until every displacement fits.

use rustc_hash::FxHashMap;

use crate::backend::CodegenError;
use crate::object::{BlobReloc, RelocKind};

use super::inst::{Base, Inst, Label, Mem, Rm, Sse, Width, XRm};
use super::regs::{Gpr, RAX};

/// Encoded method body
#[derive(Debug, Clone, Default)]
pub struct Encoded {
    pub code: Vec<u8>,
    pub relocations: Vec<BlobReloc>,
    pub labels: FxHashMap<Label, u32>,
}

fn fits_i8(v: i64) -> bool {
    i8::try_from(v).is_ok()
}

fn fits_i32(v: i64) -> bool {
    i32::try_from(v).is_ok()
}

/// Byte registers 4-7 mean `spl bpl sil dil` only with a REX prefix
fn byte_rex(r: Gpr) -> bool {
    (4..8).contains(&r.0)
}

/// Register or memory operand in the ModRM `rm` field
#[derive(Clone, Copy)]
enum RmEnc<'a> {
    Reg(u8),
    Mem(&'a Mem),
}

impl<'a> From<&'a Rm> for RmEnc<'a> {
    fn from(rm: &'a Rm) -> Self {
        match rm {
            Rm::Reg(r) => RmEnc::Reg(r.0),
            Rm::Mem(m) => RmEnc::Mem(m),
        }
    }
}

impl<'a> From<&'a XRm> for RmEnc<'a> {
    fn from(rm: &'a XRm) -> Self {
        match rm {
            XRm::Reg(r) => RmEnc::Reg(r.0),
            XRm::Mem(m) => RmEnc::Mem(m),
        }
    }
}

/// A `rip`-relative displacement written once the instruction is complete
struct RipFixup {
    pos: usize,
    base: Base,
    disp: i32,
}

/// A branch whose displacement is bound at emission time
struct Branch {
    /// Index of the instruction
    inst: usize,
    /// End of the encoded instruction
    end: u32,
    target: Label,
}

/// Prefixes and opcode of one encoding
struct Op<'o> {
    legacy: Option<u8>,
    w: bool,
    /// Force a REX prefix for byte registers
    byte: bool,
    opcode: &'o [u8],
}

impl<'o> Op<'o> {
    fn new(opcode: &'o [u8]) -> Self {
        Self {
            legacy: None,
            w: false,
            byte: false,
            opcode,
        }
    }

    fn width(opcode: &'o [u8], w: Width) -> Self {
        Self {
            legacy: (w == Width::W16).then_some(0x66),
            w: w == Width::W64,
            byte: false,
            opcode,
        }
    }

    fn legacy(mut self, p: u8) -> Self {
        self.legacy = Some(p);
        self
    }

    fn w(mut self, w: bool) -> Self {
        self.w = w;
        self
    }

    fn byte(mut self, b: bool) -> Self {
        self.byte = b;
        self
    }
}

struct Encoder<'l> {
    buf: Vec<u8>,
    relocations: Vec<BlobReloc>,
    /// Label positions of the previous pass
    known: &'l FxHashMap<Label, u32>,
    bound: FxHashMap<Label, u32>,
    short: Vec<Branch>,
    missing: Option<Label>,
}

impl<'l> Encoder<'l> {
    fn new(known: &'l FxHashMap<Label, u32>) -> Self {
        Self {
            buf: Vec::new(),
            relocations: Vec::new(),
            known,
            bound: FxHashMap::default(),
            short: Vec::new(),
            missing: None,
        }
    }

    fn pos(&self) -> u32 {
        self.buf.len() as u32
    }

    fn label(&mut self, label: Label) -> i64 {
        match self.known.get(&label) {
            Some(&at) => i64::from(at),
            None => {
                self.missing.get_or_insert(label);
                0
            }
        }
    }

    fn imm8(&mut self, v: i64) {
        self.buf.push(v as u8);
    }

    fn imm16(&mut self, v: i64) {
        self.buf.extend_from_slice(&(v as i16).to_le_bytes());
    }

    fn imm32(&mut self, v: i64) {
        self.buf.extend_from_slice(&(v as i32).to_le_bytes());
    }

    fn imm(&mut self, w: Width, v: i64) {
        match w {
            Width::W8 => self.imm8(v),
            Width::W16 => self.imm16(v),
            _ => self.imm32(v),
        }
    }

    fn rex(&mut self, w: bool, r: bool, x: bool, b: bool, force: bool) {
        if w || r || x || b || force {
            self.buf.push(
                0x40 | (u8::from(w) << 3) | (u8::from(r) << 2) | (u8::from(x) << 1) | u8::from(b),
            );
        }
    }

    /// Prefixes, opcode and ModRM for `reg` and `rm`
    fn op(&mut self, op: Op<'_>, reg: u8, rm: RmEnc<'_>) -> Option<RipFixup> {
        if let Some(p) = op.legacy {
            self.buf.push(p);
        }
        let b = match rm {
            RmEnc::Reg(r) => r >= 8,
            RmEnc::Mem(m) => matches!(m.base, Base::Reg(r) if r.ext()),
        };
        self.rex(op.w, reg >= 8, false, b, op.byte);
        self.buf.extend_from_slice(op.opcode);
        match rm {
            RmEnc::Reg(r) => {
                self.buf.push(0xc0 | ((reg & 7) << 3) | (r & 7));
                None
            }
            RmEnc::Mem(m) => self.modrm_mem(reg, m),
        }
    }

    fn modrm_mem(&mut self, reg: u8, mem: &Mem) -> Option<RipFixup> {
        let reg = (reg & 7) << 3;
        match &mem.base {
            Base::Reg(base) => {
                let disp = i64::from(mem.disp);
                let md = if disp == 0 && base.low() != 5 {
                    0x00
                } else if fits_i8(disp) {
                    0x40
                } else {
                    0x80
                };
                self.buf.push(md | reg | base.low());
                if base.low() == 4 {
                    self.buf.push(0x24);
                }
                match md {
                    0x40 => self.imm8(disp),
                    0x80 => self.imm32(disp),
                    _ => {}
                }
                None
            }
            base => {
                self.buf.push(reg | 0x05);
                let pos = self.buf.len();
                self.imm32(0);
                Some(RipFixup {
                    pos,
                    base: base.clone(),
                    disp: mem.disp,
                })
            }
        }
    }

    /// Complete a `rip`-relative operand once the instruction end is known
    fn finish(&mut self, fixup: Option<RipFixup>) {
        let Some(f) = fixup else { return };
        let end = i64::from(self.pos());
        match f.base {
            Base::Label(label) => {
                let disp = self.label(label) + i64::from(f.disp) - end;
                self.buf[f.pos..f.pos + 4].copy_from_slice(&(disp as i32).to_le_bytes());
            }
            Base::Symbol { symbol, addend } => self.relocations.push(BlobReloc {
                offset: f.pos as u64,
                symbol,
                kind: RelocKind::Pc32,
                addend: addend + i64::from(f.disp) - (end - f.pos as i64),
            }),
            Base::Reg(_) => {}
        }
    }

    fn with_rm(&mut self, op: Op<'_>, reg: u8, rm: RmEnc<'_>) {
        let fixup = self.op(op, reg, rm);
        self.finish(fixup);
    }

    fn with_rm_imm(&mut self, op: Op<'_>, reg: u8, rm: RmEnc<'_>, w: Width, imm: i64) {
        let fixup = self.op(op, reg, rm);
        self.imm(w, imm);
        self.finish(fixup);
    }

    /// Jump or call with a label target
    fn branch(&mut self, index: usize, long: bool, short_op: &[u8], long_op: &[u8], target: Label) {
        let at = self.label(target);
        if long {
            self.buf.extend_from_slice(long_op);
            let end = i64::from(self.pos()) + 4;
            self.imm32(at - end);
        } else {
            self.buf.extend_from_slice(short_op);
            let end = self.pos() + 1;
            self.imm8(at - i64::from(end));
            self.short.push(Branch {
                inst: index,
                end,
                target,
            });
        }
    }

    fn byte_rm(rm: &Rm) -> bool {
        matches!(rm, Rm::Reg(r) if byte_rex(*r))
    }

    fn inst(&mut self, index: usize, inst: &Inst, long: bool) {
        match inst {
            Inst::Bind(label) => {
                let at = self.pos();
                self.bound.insert(*label, at);
            }
            Inst::AluRmR { op, w, dst, src } => {
                let base = (*op as u8) * 8;
                let opc = [if *w == Width::W8 { base } else { base + 1 }];
                let byte = *w == Width::W8 && (byte_rex(*src) || Self::byte_rm(dst));
                self.with_rm(Op::width(&opc, *w).byte(byte), src.0, dst.into());
            }
            Inst::AluRRm { op, w, dst, src } => {
                let base = (*op as u8) * 8;
                let opc = [if *w == Width::W8 { base + 2 } else { base + 3 }];
                let byte = *w == Width::W8 && (byte_rex(*dst) || Self::byte_rm(src));
                self.with_rm(Op::width(&opc, *w).byte(byte), dst.0, src.into());
            }
            Inst::AluRmI { op, w, dst, imm } => {
                let digit = *op as u8;
                let imm = i64::from(*imm);
                if *w == Width::W8 {
                    let byte = Self::byte_rm(dst);
                    let op = Op::new(&[0x80]).byte(byte);
                    self.with_rm_imm(op, digit, dst.into(), Width::W8, imm);
                } else if fits_i8(imm) {
                    self.with_rm_imm(Op::width(&[0x83], *w), digit, dst.into(), Width::W8, imm);
                } else if *dst == Rm::Reg(RAX) {
                    if *w == Width::W16 {
                        self.buf.push(0x66);
                    }
                    self.rex(*w == Width::W64, false, false, false, false);
                    self.buf.push(digit * 8 + 5);
                    self.imm(*w, imm);
                } else {
                    self.with_rm_imm(Op::width(&[0x81], *w), digit, dst.into(), *w, imm);
                }
            }
            Inst::MovRmR { w, dst, src } => {
                let opc = [if *w == Width::W8 { 0x88 } else { 0x89 }];
                let byte = *w == Width::W8 && (byte_rex(*src) || Self::byte_rm(dst));
                self.with_rm(Op::width(&opc, *w).byte(byte), src.0, dst.into());
            }
            Inst::MovRRm { w, dst, src } => {
                let opc = [if *w == Width::W8 { 0x8a } else { 0x8b }];
                let byte = *w == Width::W8 && (byte_rex(*dst) || Self::byte_rm(src));
                self.with_rm(Op::width(&opc, *w).byte(byte), dst.0, src.into());
            }
            Inst::MovRmI { w, dst, imm } => {
                let opc = [if *w == Width::W8 { 0xc6 } else { 0xc7 }];
                let byte = *w == Width::W8 && Self::byte_rm(dst);
                let op = Op::width(&opc, *w).byte(byte);
                self.with_rm_imm(op, 0, dst.into(), *w, i64::from(*imm));
            }
            Inst::MovRI { dst, imm } => {
                if u32::try_from(*imm).is_ok() {
                    self.rex(false, false, false, dst.ext(), false);
                    self.buf.push(0xb8 + dst.low());
                    self.imm32(*imm);
                } else if fits_i32(*imm) {
                    let op = Op::new(&[0xc7]).w(true);
                    self.with_rm_imm(op, 0, RmEnc::Reg(dst.0), Width::W32, *imm);
                } else {
                    self.rex(true, false, false, dst.ext(), false);
                    self.buf.push(0xb8 + dst.low());
                    self.buf.extend_from_slice(&imm.to_le_bytes());
                }
            }
            Inst::Movx {
                signed,
                from,
                dst,
                src,
            } => {
                let byte = *from == Width::W8 && Self::byte_rm(src);
                let op = match (*signed, *from) {
                    (true, Width::W8) => Op::new(&[0x0f, 0xbe]).w(true).byte(byte),
                    (true, Width::W16) => Op::new(&[0x0f, 0xbf]).w(true),
                    (true, _) => Op::new(&[0x63]).w(true),
                    (false, Width::W8) => Op::new(&[0x0f, 0xb6]).byte(byte),
                    (false, Width::W16) => Op::new(&[0x0f, 0xb7]),
                    (false, _) => Op::new(&[0x8b]),
                };
                self.with_rm(op, dst.0, src.into());
            }
            Inst::Lea { dst, src } => {
                self.with_rm(Op::new(&[0x8d]).w(true), dst.0, RmEnc::Mem(src));
            }
            Inst::Test { w, dst, src } => {
                let opc = [if *w == Width::W8 { 0x84 } else { 0x85 }];
                let byte = *w == Width::W8 && (byte_rex(*src) || Self::byte_rm(dst));
                self.with_rm(Op::width(&opc, *w).byte(byte), src.0, dst.into());
            }
            Inst::ShiftCl { op, w, dst } => {
                let opc = [if *w == Width::W8 { 0xd2 } else { 0xd3 }];
                self.with_rm(Op::width(&opc, *w), *op as u8, dst.into());
            }
            Inst::ShiftI { op, w, dst, imm } => {
                if *imm == 1 {
                    let opc = [if *w == Width::W8 { 0xd0 } else { 0xd1 }];
                    self.with_rm(Op::width(&opc, *w), *op as u8, dst.into());
                } else {
                    let opc = [if *w == Width::W8 { 0xc0 } else { 0xc1 }];
                    let imm = i64::from(*imm);
                    self.with_rm_imm(Op::width(&opc, *w), *op as u8, dst.into(), Width::W8, imm);
                }
            }
            Inst::Unary { op, w, src } => {
                let opc = [if *w == Width::W8 { 0xf6 } else { 0xf7 }];
                self.with_rm(Op::width(&opc, *w), *op as u8, src.into());
            }
            Inst::Imul { w, dst, src } => {
                self.with_rm(Op::width(&[0x0f, 0xaf], *w), dst.0, src.into());
            }
            Inst::ImulI { w, dst, src, imm } => {
                let imm = i64::from(*imm);
                if fits_i8(imm) {
                    self.with_rm_imm(Op::width(&[0x6b], *w), dst.0, src.into(), Width::W8, imm);
                } else {
                    self.with_rm_imm(Op::width(&[0x69], *w), dst.0, src.into(), *w, imm);
                }
            }
            Inst::SignExtendAx { w } => {
                self.rex(*w == Width::W64, false, false, false, false);
                self.buf.push(0x99);
            }
            Inst::Setcc { cc, dst } => {
                let opc = [0x0f, 0x90 + *cc as u8];
                self.with_rm(Op::new(&opc).byte(byte_rex(*dst)), 0, RmEnc::Reg(dst.0));
            }
            Inst::Jcc { cc, target } => {
                let cc = *cc as u8;
                self.branch(index, long, &[0x70 + cc], &[0x0f, 0x80 + cc], *target);
            }
            Inst::Jmp { target } => self.branch(index, long, &[0xeb], &[0xe9], *target),
            Inst::Call { symbol } => {
                self.buf.push(0xe8);
                self.relocations.push(BlobReloc {
                    offset: u64::from(self.pos()),
                    symbol: symbol.clone(),
                    kind: RelocKind::Plt32,
                    addend: -4,
                });
                self.imm32(0);
            }
            Inst::CallLabel { target } => self.branch(index, true, &[], &[0xe8], *target),
            Inst::CallRm { target } => self.with_rm(Op::new(&[0xff]), 2, target.into()),
            Inst::Ret => self.buf.push(0xc3),
            Inst::Push { src } => {
                self.rex(false, false, false, src.ext(), false);
                self.buf.push(0x50 + src.low());
            }
            Inst::PushI { imm } => {
                let imm = i64::from(*imm);
                if fits_i8(imm) {
                    self.buf.push(0x6a);
                    self.imm8(imm);
                } else {
                    self.buf.push(0x68);
                    self.imm32(imm);
                }
            }
            Inst::Pop { dst } => {
                self.rex(false, false, false, dst.ext(), false);
                self.buf.push(0x58 + dst.low());
            }
            Inst::Leave => self.buf.push(0xc9),
            Inst::RepStosb => self.buf.extend_from_slice(&[0xf3, 0xaa]),

            Inst::SseOp { op, dst, src } => {
                let (prefix, opc): (u8, &[u8]) = match op {
                    Sse::Movsd => (0xf2, &[0x0f, 0x10]),
                    Sse::Movss => (0xf3, &[0x0f, 0x10]),
                    Sse::Addsd => (0xf2, &[0x0f, 0x58]),
                    Sse::Mulsd => (0xf2, &[0x0f, 0x59]),
                    Sse::Subsd => (0xf2, &[0x0f, 0x5c]),
                    Sse::Divsd => (0xf2, &[0x0f, 0x5e]),
                    Sse::Ucomisd => (0x66, &[0x0f, 0x2e]),
                    Sse::Cvtss2sd => (0xf3, &[0x0f, 0x5a]),
                    Sse::Cvtsd2ss => (0xf2, &[0x0f, 0x5a]),
                };
                self.with_rm(Op::new(opc).legacy(prefix), dst.0, src.into());
            }
            Inst::SseStore { single, dst, src } => {
                let prefix = if *single { 0xf3 } else { 0xf2 };
                self.with_rm(Op::new(&[0x0f, 0x11]).legacy(prefix), src.0, RmEnc::Mem(dst));
            }
            Inst::MovXX { dst, src } => {
                self.with_rm(Op::new(&[0x0f, 0x28]), dst.0, RmEnc::Reg(src.0));
            }
            Inst::MovqToXmm { dst, src } => {
                self.with_rm(Op::new(&[0x0f, 0x6e]).legacy(0x66).w(true), dst.0, RmEnc::Reg(src.0));
            }
            Inst::MovqFromXmm { dst, src } => {
                self.with_rm(Op::new(&[0x0f, 0x7e]).legacy(0x66).w(true), src.0, RmEnc::Reg(dst.0));
            }
            Inst::Cvtsi2sd { w, dst, src } => {
                let op = Op::new(&[0x0f, 0x2a]).legacy(0xf2).w(*w == Width::W64);
                self.with_rm(op, dst.0, RmEnc::Reg(src.0));
            }
            Inst::Cvttsd2si { dst, src } => {
                let op = Op::new(&[0x0f, 0x2c]).legacy(0xf2).w(true);
                self.with_rm(op, dst.0, RmEnc::Reg(src.0));
            }
        }
    }
}

/// Result of one encoding pass
struct Pass {
    code: Vec<u8>,
    relocations: Vec<BlobReloc>,
    bound: FxHashMap<Label, u32>,
    short: Vec<Branch>,
    missing: Option<Label>,
}

fn pass(insts: &[Inst], long: &[bool], known: &FxHashMap<Label, u32>) -> Pass {
    let mut enc = Encoder::new(known);
    for (i, inst) in insts.iter().enumerate() {
        enc.inst(i, inst, long[i]);
    }
    Pass {
        code: enc.buf,
        relocations: enc.relocations,
        bound: enc.bound,
        short: enc.short,
        missing: enc.missing,
    }
}

/// Encode a method body, widening short branches until every displacement
/// fits
pub fn encode(insts: &[Inst]) -> Result<Encoded, CodegenError> {
    let mut long = vec![false; insts.len()];
    let mut known = FxHashMap::default();
    // each pass either widens a branch or settles the label positions
    for _ in 0..insts.len() + 2 {
        let p = pass(insts, &long, &known);

        let mut grown = false;
        for b in &p.short {
            let target = p.bound.get(&b.target).copied().unwrap_or(0);
            if !fits_i8(i64::from(target) - i64::from(b.end)) {
                long[b.inst] = true;
                grown = true;
            }
        }
        if !grown {
            if let Some(label) = p.missing.filter(|l| !p.bound.contains_key(l)) {
                return Err(CodegenError::UndefinedLabel(label.to_string()));
            }
            if p.bound == known {
                return Ok(Encoded {
                    code: p.code,
                    relocations: p.relocations,
                    labels: p.bound,
                });
            }
        }
        known = p.bound;
    }
    Err(CodegenError::RelaxationDiverged)
}
