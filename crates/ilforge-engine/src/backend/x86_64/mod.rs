//! x86-64 code generation backend
//!
//! Instruction selection produces [`inst::Inst`] records with symbolic
//! labels and call targets; the encoder turns them into bytes and
//! relocations.

pub mod encode;
pub mod inst;
pub mod isel;
pub mod regs;

use tracing::trace;

use crate::backend::*;
use crate::code::Code;
use crate::config::TargetArch;
use crate::regalloc::Allocation;

use self::inst::{Inst, Label};

/// Native x86-64 backend
#[derive(Debug, Default, Clone, Copy)]
pub struct X86_64Backend;

impl X86_64Backend {
    pub fn new() -> Self {
        X86_64Backend
    }

    /// Instruction listing of a method, one instruction per line
    pub fn listing(&self, code: &Code, alloc: &Allocation) -> Result<String, CodegenError> {
        let (insts, _) = isel::select(code, alloc)?;
        Ok(insts.iter().map(|i| format!("{}\n", i)).collect())
    }
}

impl CodegenBackend for X86_64Backend {
    fn name(&self) -> &str {
        "x86_64"
    }

    fn target_info(&self) -> TargetInfo {
        TargetInfo {
            arch: TargetArch::X86_64,
            pointer_size: 8,
        }
    }

    fn register_file(&self) -> RegisterFile {
        regs::register_file()
    }

    fn compile_function(
        &self,
        code: &Code,
        alloc: &Allocation,
    ) -> Result<CompiledCode, CodegenError> {
        let (insts, frame) = isel::select(code, alloc)?;
        trace!(
            "{}: {} instructions, frame {} bytes",
            code.symbol,
            insts.len(),
            frame.size
        );
        let encoded = encode::encode(&insts)?;

        let mut compiled = CompiledCode {
            code: encoded.code,
            relocations: encoded.relocations,
            frame_size: frame.size,
            ..Default::default()
        };
        for inst in &insts {
            if let Inst::Bind(Label::Il(il)) = inst {
                if let Some(&at) = encoded.labels.get(&Label::Il(*il)) {
                    compiled.il_offsets.insert(*il, at);
                }
            }
        }
        for clause in &code.clauses {
            let handler = encoded
                .labels
                .get(&Label::Handler(clause.id))
                .copied()
                .ok_or_else(|| {
                    CodegenError::UndefinedLabel(Label::Handler(clause.id).to_string())
                })?;
            let filter = match clause.filter_offset {
                Some(_) => Some(
                    encoded
                        .labels
                        .get(&Label::Filter(clause.id))
                        .copied()
                        .ok_or_else(|| {
                            CodegenError::UndefinedLabel(Label::Filter(clause.id).to_string())
                        })?,
                ),
                None => None,
            };
            compiled.handlers.push(HandlerCode {
                clause: clause.id,
                handler,
                filter,
            });
        }
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::isel::Frame;
    use super::*;
    use crate::cil::{CilNode, MethodHeader, Opcode, Operand};
    use crate::code::LocalVar;
    use crate::config::SpillPolicy;
    use crate::ir::{BinOp, Ct, IrNode, IrOp, Stack, StackItem};
    use crate::metadata::{ElementType, MethodSpec, ModuleId, TypeSpec};
    use crate::object::RelocKind;
    use crate::regalloc::allocate;

    fn int32(constant: Option<i64>) -> StackItem {
        StackItem {
            constant,
            ..StackItem::of_ct(Ct::Int32, 8)
        }
    }

    fn var(ct: Ct, et: Option<ElementType>, size: u32) -> LocalVar {
        LocalVar {
            ts: et.map_or_else(|| TypeSpec::def(ModuleId::new(1), 3), TypeSpec::Primitive),
            ct,
            size,
            signed: true,
        }
    }

    /// One-node method whose IR is `ops`, each with the stack after it
    fn method(
        ops: Vec<(IrOp, Ct, Vec<StackItem>)>,
        args: Vec<LocalVar>,
        locals: Vec<LocalVar>,
    ) -> Code {
        let module = ModuleId::new(1);
        let mut before = Stack::default();
        let mut ir = Vec::new();
        for (op, ct, after) in ops {
            let after = Stack::from_items(after);
            ir.push(IrNode {
                op,
                ct,
                stack_before: before.clone(),
                stack_after: after.clone(),
                il_offset: 0,
            });
            before = after;
        }
        Code {
            method: MethodSpec::def(TypeSpec::def(module, 0), module, 0),
            symbol: "_Zadd".to_string(),
            module,
            header: MethodHeader {
                tiny: true,
                max_stack: 8,
                code_size: 4,
                local_var_sig_tok: 0,
                init_locals: true,
                header_size: 1,
                more_sects: false,
            },
            nodes: vec![CilNode {
                offset: 0,
                opcode: Opcode::Ldarg0,
                operand: Operand::None,
                size: 1,
                successors: Vec::new(),
                block_start: true,
                ir,
            }],
            offsets: Default::default(),
            clauses: Vec::new(),
            args,
            locals,
            ret: None,
            entries: Vec::new(),
        }
    }

    fn add_method() -> Code {
        let i = || int32(None);
        method(
            vec![
                (IrOp::Enter, Ct::Void, vec![]),
                (IrOp::LdArg(0), Ct::Int32, vec![i()]),
                (IrOp::LdArg(1), Ct::Int32, vec![i(), i()]),
                (
                    IrOp::Bin {
                        op: BinOp::Add,
                        unsigned: false,
                        overflow: false,
                    },
                    Ct::Int32,
                    vec![i()],
                ),
                (IrOp::Ret, Ct::Int32, vec![]),
            ],
            vec![
                var(Ct::Int32, Some(ElementType::I4), 4),
                var(Ct::Int32, Some(ElementType::I4), 4),
            ],
            Vec::new(),
        )
    }

    #[test]
    fn test_compile_add() {
        let backend = X86_64Backend::new();
        let code = add_method();
        let alloc = allocate(&code, &backend.register_file(), SpillPolicy::Allow).unwrap();
        let compiled = backend.compile_function(&code, &alloc).unwrap();

        // rbx and rsi hold the two depths; rbx is saved in the prologue
        let listing = backend.listing(&code, &alloc).unwrap();
        assert!(listing.contains("IL_0000:"), "{}", listing);
        assert_eq!(&compiled.code[..4], &[0x55, 0x48, 0x89, 0xe5]);
        assert_eq!(*compiled.code.last().unwrap(), 0xc3);
        assert!(compiled.relocations.is_empty());
        assert_eq!(compiled.frame_size, 16);
        assert!(compiled.code_offset(0).is_some());
        assert_eq!(compiled.code_offset(4), Some(compiled.code.len() as u32));
    }

    #[test]
    fn test_frame_layout() {
        let backend = X86_64Backend::new();
        let code = method(
            vec![(IrOp::Enter, Ct::Void, vec![]), (IrOp::Ret, Ct::Void, vec![])],
            vec![
                var(Ct::Int64, Some(ElementType::I8), 8),
                var(Ct::Vt, None, 12),
                var(Ct::Float, Some(ElementType::R4), 4),
            ],
            vec![var(Ct::Int32, Some(ElementType::I4), 4), var(Ct::Vt, None, 20)],
        );
        let alloc = allocate(&code, &backend.register_file(), SpillPolicy::Allow).unwrap();
        let frame = Frame::new(&code, &alloc);
        assert_eq!(frame.args, vec![16, 24, 40]);
        assert_eq!(frame.locals, vec![-8, -32]);
        assert_eq!(frame.locals_size, 32);
        assert_eq!(frame.size, 32);
        assert!(frame.callee_saved.is_empty());
    }

    #[test]
    fn test_call_pushes_and_pops_arguments() {
        let backend = X86_64Backend::new();
        let code = method(
            vec![
                (IrOp::Enter, Ct::Void, vec![]),
                (IrOp::Ldc(7), Ct::Int32, vec![int32(Some(7))]),
                (
                    IrOp::Call {
                        symbol: "_Zcallee".to_string(),
                        nparams: 1,
                    },
                    Ct::Void,
                    vec![],
                ),
                (IrOp::Ret, Ct::Void, vec![]),
            ],
            Vec::new(),
            Vec::new(),
        );
        let alloc = allocate(&code, &backend.register_file(), SpillPolicy::Allow).unwrap();
        let compiled = backend.compile_function(&code, &alloc).unwrap();
        let listing = backend.listing(&code, &alloc).unwrap();

        assert_eq!(compiled.relocations.len(), 1);
        let reloc = &compiled.relocations[0];
        assert_eq!(reloc.symbol, "_Zcallee");
        assert_eq!(reloc.kind, RelocKind::Plt32);
        assert_eq!(reloc.addend, -4);
        // one argument: pad to 16 bytes, push, call, pop both
        let call = reloc.offset as usize - 1;
        assert_eq!(compiled.code[call], 0xe8);
        assert_eq!(&compiled.code[call - 2..call], &[0x6a, 0x07]);
        assert_eq!(&compiled.code[call + 5..call + 9], &[0x48, 0x83, 0xc4, 0x10]);
        assert!(listing.contains("_Zcallee"), "{}", listing);
    }

    #[test]
    fn test_overflow_check_adds_stub() {
        let backend = X86_64Backend::new();
        let i = || int32(None);
        let code = method(
            vec![
                (IrOp::Enter, Ct::Void, vec![]),
                (IrOp::LdArg(0), Ct::Int32, vec![i()]),
                (IrOp::LdArg(0), Ct::Int32, vec![i(), i()]),
                (
                    IrOp::Bin {
                        op: BinOp::Mul,
                        unsigned: false,
                        overflow: true,
                    },
                    Ct::Int32,
                    vec![i()],
                ),
                (IrOp::Ret, Ct::Int32, vec![]),
            ],
            vec![var(Ct::Int32, Some(ElementType::I4), 4)],
            Vec::new(),
        );
        let alloc = allocate(&code, &backend.register_file(), SpillPolicy::Allow).unwrap();
        let compiled = backend.compile_function(&code, &alloc).unwrap();
        let symbols: Vec<_> = compiled.relocations.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec![crate::runtime::THROW_OVERFLOW]);
    }

    #[test]
    fn test_float_remainder_is_unsupported() {
        let backend = X86_64Backend::new();
        let f = || StackItem::of_ct(Ct::Float, 8);
        let code = method(
            vec![
                (IrOp::Enter, Ct::Void, vec![]),
                (IrOp::LdcR(1.5), Ct::Float, vec![f()]),
                (IrOp::LdcR(2.0), Ct::Float, vec![f(), f()]),
                (
                    IrOp::Bin {
                        op: BinOp::Rem,
                        unsigned: false,
                        overflow: false,
                    },
                    Ct::Float,
                    vec![f()],
                ),
                (IrOp::Ret, Ct::Float, vec![]),
            ],
            Vec::new(),
            Vec::new(),
        );
        let alloc = allocate(&code, &backend.register_file(), SpillPolicy::Allow).unwrap();
        let err = backend.compile_function(&code, &alloc).unwrap_err();
        assert!(matches!(err, CodegenError::Unsupported { .. }), "{:?}", err);
    }
}
