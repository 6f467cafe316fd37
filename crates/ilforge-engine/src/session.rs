//! Build session
//!
//! One [`BuildSession`] holds everything a build shares between pipeline
//! stages and worker threads: metadata, backend, target layout, the work
//! closure, the module's constant table and the object file under
//! construction. Nothing is global; two sessions never share state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::backend::{self, CodegenBackend};
use crate::config::{BuildConfig, BuildScope};
use crate::ir::canonical;
use crate::layout::{Layout, TargetLayout};
use crate::mangle::Mangler;
use crate::metadata::{
    ElementType, FieldSpec, FullySpecSignature, MetadataError, MetadataProvider, MethodSpec,
    ModuleId, TypeSpec,
};
use crate::object::{Blob, ObjectError, ObjectFile};
use crate::requestor::{CachingRequestor, Requestor};
use crate::string_table::StringTable;

/// Counters of emitted artifacts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub methods: usize,
    /// Methods requested but without a body to compile
    pub skipped: usize,
    pub vtables: usize,
    pub static_blocks: usize,
    pub method_infos: usize,
    pub field_infos: usize,
    pub modules: usize,
    pub assemblies: usize,
    pub strings: usize,
}

#[derive(Default)]
struct Counters {
    methods: AtomicUsize,
    skipped: AtomicUsize,
    vtables: AtomicUsize,
    static_blocks: AtomicUsize,
    method_infos: AtomicUsize,
    field_infos: AtomicUsize,
    modules: AtomicUsize,
    assemblies: AtomicUsize,
}

/// Kinds of artifacts counted in [`BuildStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Method,
    Skipped,
    VTable,
    StaticBlock,
    MethodInfo,
    FieldInfo,
    Module,
    Assembly,
}

/// Shared state of one build
pub struct BuildSession {
    md: Arc<dyn MetadataProvider>,
    backend: Box<dyn CodegenBackend>,
    target: TargetLayout,
    config: BuildConfig,
    module: ModuleId,
    requestor: Box<dyn Requestor>,
    strings: Mutex<StringTable>,
    object: Mutex<ObjectFile>,
    /// Method symbol to extra names defined at the same address
    aliases: FxHashMap<String, Vec<String>>,
    /// Methods named by aliases; always compiled
    roots: Vec<MethodSpec>,
    counters: Counters,
}

impl BuildSession {
    /// Session building `module` with the backend for the configured target
    pub fn new(
        md: Arc<dyn MetadataProvider>,
        module: ModuleId,
        config: BuildConfig,
    ) -> Result<Self, MetadataError> {
        let backend = backend::create(config.arch);
        Self::with_backend(md, module, config, backend)
    }

    /// Session using a specific backend
    pub fn with_backend(
        md: Arc<dyn MetadataProvider>,
        module: ModuleId,
        config: BuildConfig,
        backend: Box<dyn CodegenBackend>,
    ) -> Result<Self, MetadataError> {
        let pointer_size = backend.target_info().pointer_size;
        let target = TargetLayout::new(pointer_size);
        let requestor: Box<dyn Requestor> = if config.single_module {
            Box::new(CachingRequestor::with_module_filter(module, md.corlib()))
        } else {
            Box::new(CachingRequestor::new())
        };

        let mangler = Mangler::new(&*md);
        let table_symbol = format!("{}_StringTable", mangler.module_info(module)?);
        let mut aliases: FxHashMap<String, Vec<String>> = FxHashMap::default();
        let mut roots = Vec::new();
        for entry in &config.aliases {
            let ms = find_method(&*md, module, &entry.namespace, &entry.type_name, &entry.method)?;
            aliases
                .entry(mangler.method(&ms)?)
                .or_default()
                .push(entry.alias.clone());
            if !roots.contains(&ms) {
                roots.push(ms);
            }
        }

        Ok(Self {
            strings: Mutex::new(StringTable::new(table_symbol, pointer_size)),
            md,
            backend,
            target,
            config,
            module,
            requestor,
            object: Mutex::new(ObjectFile::new()),
            aliases,
            roots,
            counters: Counters::default(),
        })
    }

    pub fn md(&self) -> &dyn MetadataProvider {
        &*self.md
    }

    pub fn backend(&self) -> &dyn CodegenBackend {
        &*self.backend
    }

    pub fn target(&self) -> &TargetLayout {
        &self.target
    }

    pub fn layout(&self) -> Layout<'_> {
        Layout::new(&*self.md, &self.target)
    }

    pub fn mangler(&self) -> Mangler<'_> {
        Mangler::new(&*self.md)
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// The module being built
    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn requestor(&self) -> &dyn Requestor {
        &*self.requestor
    }

    /// Methods that must be compiled regardless of entry points
    pub fn roots(&self) -> &[MethodSpec] {
        &self.roots
    }

    /// Extra symbols to define at a method's address
    pub fn aliases_for(&self, symbol: &str) -> &[String] {
        self.aliases.get(symbol).map_or(&[], Vec::as_slice)
    }

    fn canonical_method(&self, ms: &MethodSpec) -> MethodSpec {
        MethodSpec {
            owner: canonical(self.md(), &ms.owner),
            method: ms.method,
            args: ms.args.iter().map(|a| canonical(self.md(), a)).collect(),
        }
    }

    /// Queue a method for compilation and return its symbol
    pub fn request_method(&self, ms: &MethodSpec) -> Result<String, MetadataError> {
        let ms = self.canonical_method(ms);
        let symbol = self.mangler().method(&ms)?;
        self.requestor.methods().request(ms);
        Ok(symbol)
    }

    /// Queue a type's vtable and return its symbol
    pub fn request_vtable(&self, ts: &TypeSpec) -> Result<String, MetadataError> {
        let ts = canonical(self.md(), ts);
        let symbol = self.mangler().type_name(&ts)?;
        self.requestor.vtables().request(ts);
        Ok(symbol)
    }

    /// Queue a type's static field block and return its symbol
    pub fn request_static_fields(&self, ts: &TypeSpec) -> Result<String, MetadataError> {
        let ts = canonical(self.md(), ts);
        let symbol = self.mangler().static_block(&ts)?;
        self.requestor.static_fields().request(ts);
        Ok(symbol)
    }

    /// Queue a method info record and return its symbol
    pub fn request_method_info(&self, ms: &MethodSpec) -> Result<String, MetadataError> {
        let ms = self.canonical_method(ms);
        let symbol = self.mangler().method_info(&ms)?;
        self.requestor.method_infos().request(ms);
        Ok(symbol)
    }

    /// Queue a field info record and return its symbol
    pub fn request_field_info(&self, fs: &FieldSpec) -> Result<String, MetadataError> {
        let fs = FieldSpec {
            owner: canonical(self.md(), &fs.owner),
            ..fs.clone()
        };
        let symbol = self.mangler().field_info(&fs)?;
        self.requestor.field_infos().request(fs);
        Ok(symbol)
    }

    /// Queue a module info record and return its symbol
    pub fn request_module_info(&self, module: ModuleId) -> Result<String, MetadataError> {
        let symbol = self.mangler().module_info(module)?;
        self.requestor.modules().request(module);
        Ok(symbol)
    }

    /// Queue an assembly info record and return its symbol
    pub fn request_assembly_info(&self, module: ModuleId) -> Result<String, MetadataError> {
        let symbol = self.mangler().assembly_info(module)?;
        self.requestor.assemblies().request(module);
        Ok(symbol)
    }

    /// Symbol of the module's constant table
    pub fn string_table_symbol(&self) -> String {
        self.strings.lock().symbol().to_string()
    }

    /// Intern a literal; returns the table symbol and the string object's offset
    pub fn intern_string(&self, s: &str) -> Result<(String, u32), MetadataError> {
        let vtable = self.request_vtable(&TypeSpec::Primitive(ElementType::String))?;
        let mut table = self.strings.lock();
        let offset = table.get_string_address(s, &vtable, &self.target);
        Ok((table.symbol().to_string(), offset))
    }

    /// Append a signature record; returns the table symbol and its offset
    pub fn signature_address(
        &self,
        sig: &FullySpecSignature,
    ) -> Result<(String, u32), MetadataError> {
        let layout = self.layout();
        let mut table = self.strings.lock();
        let offset = table.get_signature_address(sig, &layout, self.requestor())?;
        Ok((table.symbol().to_string(), offset))
    }

    /// Append a finished blob to the object file
    pub fn commit(&self, blob: Blob) -> Result<u64, ObjectError> {
        self.object.lock().commit(blob)
    }

    /// Count one emitted artifact
    pub fn record(&self, artifact: Artifact) {
        let c = &self.counters;
        let counter = match artifact {
            Artifact::Method => &c.methods,
            Artifact::Skipped => &c.skipped,
            Artifact::VTable => &c.vtables,
            Artifact::StaticBlock => &c.static_blocks,
            Artifact::MethodInfo => &c.method_infos,
            Artifact::FieldInfo => &c.field_infos,
            Artifact::Module => &c.modules,
            Artifact::Assembly => &c.assemblies,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BuildStats {
        let c = &self.counters;
        BuildStats {
            methods: c.methods.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            vtables: c.vtables.load(Ordering::Relaxed),
            static_blocks: c.static_blocks.load(Ordering::Relaxed),
            method_infos: c.method_infos.load(Ordering::Relaxed),
            field_infos: c.field_infos.load(Ordering::Relaxed),
            modules: c.modules.load(Ordering::Relaxed),
            assemblies: c.assemblies.load(Ordering::Relaxed),
            strings: self.strings.lock().string_count(),
        }
    }

    /// Queue the build's starting points: alias targets, every method of the
    /// module for whole-module builds, and the module info record
    pub fn seed(&self) -> Result<(), MetadataError> {
        for ms in &self.roots {
            self.request_method(ms)?;
        }
        if self.config.scope == BuildScope::WholeModule {
            for ms in module_methods(self.md(), self.module)? {
                self.request_method(&ms)?;
            }
        }
        if self.config.emit_module_info {
            self.request_module_info(self.module)?;
        }
        Ok(())
    }

    /// Write the constant table into the object file. Called once, after the
    /// closure is exhausted.
    pub fn finish(&self) -> Result<(), ObjectError> {
        let blob = self.strings.lock().to_blob();
        self.commit(blob)?;
        Ok(())
    }

    /// Snapshot of the object file
    pub fn object(&self) -> ObjectFile {
        self.object.lock().clone()
    }

    /// Consume the session, returning the object file
    pub fn into_object(self) -> ObjectFile {
        self.object.into_inner()
    }

    /// Raw constant table contents
    pub fn string_table(&self) -> StringTable {
        self.strings.lock().clone()
    }
}

/// A method of `namespace.type_name` in `module` by name
pub fn find_method(
    md: &dyn MetadataProvider,
    module: ModuleId,
    namespace: &str,
    type_name: &str,
    method: &str,
) -> Result<MethodSpec, MetadataError> {
    let qualified = || format!("{}.{}::{}", namespace, type_name, method);
    let row = md
        .find_type(module, namespace, type_name)
        .ok_or_else(|| MetadataError::NotFound(qualified()))?;
    let info = md.type_def(module, row)?;
    for &mrow in &info.methods {
        if md.method_def(module, mrow)?.name == method {
            return Ok(MethodSpec::def(TypeSpec::def(module, row), module, mrow));
        }
    }
    Err(MetadataError::NotFound(qualified()))
}

/// Every method with a body in the non-generic types of a module
pub fn module_methods(
    md: &dyn MetadataProvider,
    module: ModuleId,
) -> Result<Vec<MethodSpec>, MetadataError> {
    let mut out = Vec::new();
    for row in 1..=md.type_count(module)? {
        let info = md.type_def(module, row)?;
        if info.generic_params > 0 {
            continue;
        }
        for &mrow in &info.methods {
            let def = md.method_def(module, mrow)?;
            if def.rva != 0 && def.sig.generic_params == 0 {
                out.push(MethodSpec::def(TypeSpec::def(module, row), module, mrow));
            }
        }
    }
    Ok(out)
}
