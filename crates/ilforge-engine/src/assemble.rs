//! Artifact assembly
//!
//! Runs one work item through its pipeline and commits the result to the
//! session's object file. For methods that is
//! decode → IR → register allocation → instruction selection → encoding,
//! followed by the method's symbols, aliases and exception table.

use tracing::{debug, trace, warn};

use crate::backend::{CodegenError, CompiledCode};
use crate::code::Code;
use crate::ir::{self, IrError};
use crate::layout::statics;
use crate::layout::vtable::{self, binding_for};
use crate::metadata::{MetadataError, MethodSpec};
use crate::object::{Blob, ObjectError, SectionKind, SymbolBinding, SymbolKind};
use crate::regalloc::{self, AllocError};
use crate::requestor::WorkItem;
use crate::session::{Artifact, BuildSession};

/// Failure to produce one artifact; `symbol` names the method or item
#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("IR error in {symbol}: {source}")]
    Ir {
        symbol: String,
        #[source]
        source: IrError,
    },
    #[error("Register allocation failed in {symbol}: {source}")]
    Alloc {
        symbol: String,
        #[source]
        source: AllocError,
    },
    #[error("Codegen error in {symbol}: {source}")]
    Codegen {
        symbol: String,
        #[source]
        source: CodegenError,
    },
    #[error("Metadata error in {symbol}: {source}")]
    Metadata {
        symbol: String,
        #[source]
        source: MetadataError,
    },
    #[error("Object error in {symbol}: {source}")]
    Object {
        symbol: String,
        #[source]
        source: ObjectError,
    },
}

impl AssembleError {
    /// Name of the artifact that failed
    pub fn symbol(&self) -> &str {
        match self {
            AssembleError::Ir { symbol, .. }
            | AssembleError::Alloc { symbol, .. }
            | AssembleError::Codegen { symbol, .. }
            | AssembleError::Metadata { symbol, .. }
            | AssembleError::Object { symbol, .. } => symbol,
        }
    }
}

/// Size of one exception table record, in pointers
const EH_RECORD_SLOTS: usize = 6;

/// Process one work item
pub fn process(session: &BuildSession, item: &WorkItem) -> Result<(), AssembleError> {
    let meta = |source| AssembleError::Metadata {
        symbol: item.to_string(),
        source,
    };
    let object = |source| AssembleError::Object {
        symbol: item.to_string(),
        source,
    };
    match item {
        WorkItem::Method(ms) => return assemble_method(session, ms),
        WorkItem::VTable(ts) => {
            let blob = vtable::emit_vtable(session, ts).map_err(meta)?;
            session.commit(blob).map_err(object)?;
            session.record(Artifact::VTable);
        }
        WorkItem::StaticFields(ts) => {
            if let Some(blob) = statics::emit_static_fields(session, ts).map_err(meta)? {
                session.commit(blob).map_err(object)?;
                session.record(Artifact::StaticBlock);
            }
        }
        WorkItem::MethodInfo(ms) => {
            let blob = statics::emit_method_info(session, ms).map_err(meta)?;
            session.commit(blob).map_err(object)?;
            session.record(Artifact::MethodInfo);
        }
        WorkItem::FieldInfo(fs) => {
            let blob = statics::emit_field_info(session, fs).map_err(meta)?;
            session.commit(blob).map_err(object)?;
            session.record(Artifact::FieldInfo);
        }
        WorkItem::Module(m) => {
            let blob = statics::emit_module_info(session, *m).map_err(meta)?;
            session.commit(blob).map_err(object)?;
            session.record(Artifact::Module);
        }
        WorkItem::Assembly(m) => {
            let blob = statics::emit_assembly_info(session, *m).map_err(meta)?;
            session.commit(blob).map_err(object)?;
            session.record(Artifact::Assembly);
        }
    }
    debug!("emitted {}", item);
    Ok(())
}

/// Binding of a method body: instantiations with method generic arguments
/// may be emitted by any module that uses them
fn method_binding(session: &BuildSession, ms: &MethodSpec) -> SymbolBinding {
    if ms.args.is_empty() {
        binding_for(session, &ms.owner)
    } else {
        SymbolBinding::Weak
    }
}

/// Compile a method and commit its code and exception table
pub fn assemble_method(session: &BuildSession, ms: &MethodSpec) -> Result<(), AssembleError> {
    let symbol = session
        .mangler()
        .method(ms)
        .map_err(|source| AssembleError::Metadata {
            symbol: ms.to_string(),
            source,
        })?;

    let code = match ir::build(session, ms) {
        Ok(code) => code,
        Err(IrError::NoBody) => {
            warn!("{} has no body, skipped", symbol);
            session.record(Artifact::Skipped);
            return Ok(());
        }
        Err(source) => return Err(AssembleError::Ir { symbol, source }),
    };

    let backend = session.backend();
    let alloc = regalloc::allocate(&code, &backend.register_file(), session.config().spill)
        .map_err(|source| AssembleError::Alloc {
            symbol: symbol.clone(),
            source,
        })?;
    let compiled = backend
        .compile_function(&code, &alloc)
        .map_err(|source| AssembleError::Codegen {
            symbol: symbol.clone(),
            source,
        })?;
    if session.config().dump_ir {
        trace!("{}", ir::display::dump(&code));
        trace!("{}: {}", symbol, hex::encode(&compiled.code));
    }

    let mut text = Blob::new(SectionKind::Text, 16);
    let binding = method_binding(session, ms);
    text.define(symbol.clone(), SymbolKind::Func, binding);
    for alias in session.aliases_for(&symbol) {
        text.define(alias.clone(), SymbolKind::Func, SymbolBinding::Global);
    }
    text.data.extend_from_slice(&compiled.code);
    text.relocations.extend(compiled.relocations.iter().cloned());
    session.commit(text).map_err(|source| AssembleError::Object {
        symbol: symbol.clone(),
        source,
    })?;

    if code.has_handlers() {
        let table = eh_table(session, &code, &compiled, binding).map_err(|e| match e {
            EhError::Metadata(source) => AssembleError::Metadata {
                symbol: symbol.clone(),
                source,
            },
            EhError::Codegen(source) => AssembleError::Codegen {
                symbol: symbol.clone(),
                source,
            },
        })?;
        session.commit(table).map_err(|source| AssembleError::Object {
            symbol: symbol.clone(),
            source,
        })?;
    }

    debug!(
        "{}: {} bytes, {} relocations, {} clauses",
        symbol,
        compiled.code.len(),
        compiled.relocations.len(),
        code.clauses.len()
    );
    session.record(Artifact::Method);
    Ok(())
}

#[derive(Debug)]
enum EhError {
    Metadata(MetadataError),
    Codegen(CodegenError),
}

impl From<MetadataError> for EhError {
    fn from(e: MetadataError) -> Self {
        EhError::Metadata(e)
    }
}

impl From<CodegenError> for EhError {
    fn from(e: CodegenError) -> Self {
        EhError::Codegen(e)
    }
}

/// Exception table of a method:
///
/// ```text
/// +0          clause count
/// per clause: kind, try start, try end, handler, filter (or 0),
///             catch class vtable (or 0)
/// ```
///
/// Code addresses are relocations against the method symbol.
fn eh_table(
    session: &BuildSession,
    code: &Code,
    compiled: &CompiledCode,
    binding: SymbolBinding,
) -> Result<Blob, EhError> {
    let p = session.target().pointer_size;
    let mut blob = Blob::new(SectionKind::RoData, p);
    blob.define(session.mangler().eh_table(&code.method)?, SymbolKind::Object, binding);
    blob.push_uint(code.clauses.len() as u64, p);

    let il = |offset: u32| {
        compiled
            .code_offset(offset)
            .ok_or_else(|| CodegenError::UndefinedLabel(format!("IL_{:04x}", offset)))
    };
    for clause in &code.clauses {
        let start = blob.len();
        let handlers = compiled
            .handler(clause.id)
            .ok_or_else(|| CodegenError::UndefinedLabel(format!("handler {}", clause.id)))?;

        blob.push_uint(u64::from(clause.kind.tag()), p);
        blob.push_pointer(code.symbol.clone(), i64::from(il(clause.try_offset)?), p);
        blob.push_pointer(code.symbol.clone(), i64::from(il(clause.try_end())?), p);
        blob.push_pointer(code.symbol.clone(), i64::from(handlers.handler), p);
        match handlers.filter {
            Some(f) => blob.push_pointer(code.symbol.clone(), i64::from(f), p),
            None => blob.push_uint(0, p),
        }
        match &clause.catch_type {
            Some(ts) => {
                let class = session.request_vtable(ts)?;
                blob.push_pointer(class, 0, p);
            }
            None => blob.push_uint(0, p),
        }
        debug_assert_eq!(blob.len() - start, EH_RECORD_SLOTS * p as usize);
    }
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{BuildConfig, EntryAlias, SpillPolicy};
    use crate::metadata::{
        BodyBuilder, ClauseSpec, ElementType, InMemoryMetadata, MetadataProvider, MethodSig,
        ModuleId, TypeKind, TypeSpec, METHOD_STATIC,
    };
    use crate::object::RelocKind;

    struct App {
        md: InMemoryMetadata,
        module: ModuleId,
        program: u32,
    }

    impl App {
        fn new() -> Self {
            let mut md = InMemoryMetadata::with_corlib();
            let module = md.add_module("app.dll", "app");
            let object = md.corlib_type("Object");
            let program = md.add_type(module, "App", "Program", TypeKind::Class, object);
            App { md, module, program }
        }

        fn method(&mut self, name: &str, body: Option<&[u8]>, ret: Option<TypeSpec>) -> MethodSpec {
            let row = self.md.add_method(
                self.module,
                self.program,
                name,
                METHOD_STATIC,
                MethodSig::new_static(ret, Vec::new()),
                body,
            );
            MethodSpec::def(TypeSpec::def(self.module, self.program), self.module, row)
        }

        fn session(self, config: BuildConfig) -> BuildSession {
            BuildSession::new(Arc::new(self.md), self.module, config).unwrap()
        }
    }

    #[test]
    fn test_method_symbol_and_aliases() {
        let mut app = App::new();
        // ldc.i4.1; ret
        let body = BodyBuilder::new(&[0x17, 0x2a]).build();
        let ms = app.method("Run", Some(&body), Some(TypeSpec::Primitive(ElementType::I4)));
        let session = app.session(BuildConfig {
            aliases: vec![EntryAlias {
                namespace: "App".to_string(),
                type_name: "Program".to_string(),
                method: "Run".to_string(),
                alias: "main".to_string(),
            }],
            ..BuildConfig::default()
        });
        assemble_method(&session, &ms).unwrap();

        let object = session.object();
        let symbol = session.mangler().method(&ms).unwrap();
        let run = object.symbol(&symbol).unwrap();
        let alias = object.symbol("main").unwrap();
        assert_eq!(run.offset, alias.offset);
        assert_eq!(run.size, alias.size);
        assert_eq!(run.size, object.section(SectionKind::Text).data.len() as u64);
        assert_eq!(run.kind, SymbolKind::Func);
        assert_eq!(run.binding, SymbolBinding::Global);
        assert_eq!(session.stats().methods, 1);
    }

    #[test]
    fn test_catch_clause_emits_table() {
        let mut app = App::new();
        let object = app.md.corlib_type("Object");
        let oops = app.md.add_type(app.module, "App", "Oops", TypeKind::Class, object);
        // try { leave.s 5 } catch (Oops) { pop; leave.s 5 } ret
        let body = BodyBuilder::new(&[0xde, 0x03, 0x26, 0xde, 0x00, 0x2a])
            .clause(ClauseSpec {
                flags: 0,
                try_offset: 0,
                try_length: 2,
                handler_offset: 2,
                handler_length: 3,
                class_token_or_filter: 0x0200_0000 | oops,
            })
            .build();
        let ms = app.method("Guarded", Some(&body), None);
        let module = app.module;
        let session = app.session(BuildConfig::default());
        assemble_method(&session, &ms).unwrap();

        let object = session.object();
        let table = object.symbol(&session.mangler().eh_table(&ms).unwrap()).unwrap();
        assert_eq!(table.section, SectionKind::RoData);
        assert_eq!(table.size, 8 * (1 + EH_RECORD_SLOTS as u64));

        let class = session.mangler().type_name(&TypeSpec::def(module, oops)).unwrap();
        let code = session.mangler().method(&ms).unwrap();
        let relocs: Vec<_> = object
            .relocations()
            .iter()
            .filter(|r| r.section == SectionKind::RoData)
            .collect();
        assert_eq!(relocs.len(), 4);
        assert_eq!(relocs.iter().filter(|r| r.symbol == code).count(), 3);
        let catch = relocs.iter().find(|r| r.symbol == class).unwrap();
        assert_eq!(catch.kind, RelocKind::Abs64);
        assert_eq!(catch.offset, table.offset + 8 * 6);
        assert!(session.requestor().vtables().has_seen(&TypeSpec::def(module, oops)));
    }

    #[test]
    fn test_bodyless_method_is_skipped() {
        let mut app = App::new();
        let ms = app.method("Extern", None, None);
        let session = app.session(BuildConfig::default());
        process(&session, &WorkItem::Method(ms)).unwrap();
        assert_eq!(session.stats().skipped, 1);
        assert!(session.object().symbols().is_empty());
    }

    #[test]
    fn test_forbidden_spill_names_method() {
        let mut app = App::new();
        // eleven values deep, one more than the integer pool holds
        let mut il = vec![0x17; 11];
        il.extend_from_slice(&[0x26; 11]);
        il.push(0x2a);
        let body = BodyBuilder::new(&il).max_stack(11).build();
        let ms = app.method("Deep", Some(&body), None);
        let session = app.session(BuildConfig {
            spill: SpillPolicy::Forbid,
            ..BuildConfig::default()
        });
        let err = process(&session, &WorkItem::Method(ms.clone())).unwrap_err();
        assert!(matches!(err, AssembleError::Alloc { .. }), "{}", err);
        assert_eq!(err.symbol(), session.mangler().method(&ms).unwrap());
    }
}
