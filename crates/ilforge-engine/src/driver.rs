//! Build driver
//!
//! Runs the work closure of a [`BuildSession`] to exhaustion: every item any
//! emitter requests is processed exactly once, on the calling thread or on a
//! pool of worker threads. A build ends when no queue has pending items and
//! no worker is still processing one; the first failure stops it.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::assemble::{self, AssembleError};
use crate::config::{BuildConfig, ConfigError};
use crate::metadata::{MetadataError, MetadataProvider, MethodSpec, ModuleId};
use crate::object::{elf, ObjectError, ObjectFile};
use crate::session::{module_methods, BuildSession, BuildStats};

/// Errors that end a build
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Assemble(#[from] AssembleError),
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),
    #[error("Object error: {0}")]
    Object(#[from] ObjectError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to start worker thread: {0}")]
    Spawn(std::io::Error),
    #[error("A worker thread panicked")]
    WorkerPanicked,
}

/// Worker pool bookkeeping, guarded by one lock
#[derive(Default)]
struct Pool {
    /// Items taken from the requestor and not yet finished
    in_flight: usize,
    error: Option<AssembleError>,
    /// A worker unwound while holding an item
    panicked: bool,
}

/// Releases one taken item, also when processing it unwinds
struct InFlight<'p> {
    pool: &'p Mutex<Pool>,
    wake: &'p Condvar,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.pool.lock();
        state.in_flight -= 1;
        if std::thread::panicking() {
            state.panicked = true;
        }
        self.wake.notify_all();
    }
}

/// Drives one session's closure
pub struct Driver<'s> {
    session: &'s BuildSession,
}

impl<'s> Driver<'s> {
    pub fn new(session: &'s BuildSession) -> Self {
        Self { session }
    }

    /// Compile `entries` and everything they reach, then flush the constant
    /// table into the object
    pub fn run(&self, entries: &[MethodSpec]) -> Result<BuildStats, BuildError> {
        let session = self.session;
        let workers = session.config().worker_count();
        info!(
            "building module {} with {} ({} entries, {} workers)",
            session.module(),
            session.backend().name(),
            entries.len(),
            workers
        );

        session.seed()?;
        for ms in entries {
            session.request_method(ms)?;
        }
        if workers <= 1 {
            self.run_serial()?;
        } else {
            self.run_parallel(workers)?;
        }
        session.finish()?;

        let stats = session.stats();
        info!(
            "built {} methods ({} skipped), {} vtables, {} static blocks, {} strings",
            stats.methods, stats.skipped, stats.vtables, stats.static_blocks, stats.strings
        );
        Ok(stats)
    }

    /// Compile every method of the session's module
    pub fn compile_all(&self) -> Result<BuildStats, BuildError> {
        let entries = module_methods(self.session.md(), self.session.module())?;
        self.run(&entries)
    }

    fn run_serial(&self) -> Result<(), BuildError> {
        let requestor = self.session.requestor();
        while let Some(item) = requestor.next_item() {
            assemble::process(self.session, &item)?;
        }
        Ok(())
    }

    fn run_parallel(&self, workers: usize) -> Result<(), BuildError> {
        let pool = Mutex::new(Pool::default());
        let wake = Condvar::new();

        let spawned = crossbeam::scope(|s| -> Result<(), BuildError> {
            for id in 0..workers {
                let (pool, wake) = (&pool, &wake);
                s.builder()
                    .name(format!("ilforge-worker-{}", id))
                    .spawn(move |_| self.worker_loop(id, pool, wake))
                    .map_err(BuildError::Spawn)?;
            }
            Ok(())
        });
        match spawned {
            Ok(result) => result?,
            Err(_) => return Err(BuildError::WorkerPanicked),
        }

        match pool.into_inner().error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn worker_loop(&self, id: usize, pool: &Mutex<Pool>, wake: &Condvar) {
        let requestor = self.session.requestor();
        loop {
            let item = {
                let mut state = pool.lock();
                loop {
                    if state.error.is_some() || state.panicked {
                        return;
                    }
                    if let Some(item) = requestor.next_item() {
                        state.in_flight += 1;
                        break item;
                    }
                    if state.in_flight == 0 {
                        // closure exhausted; release the other waiters
                        wake.notify_all();
                        return;
                    }
                    wake.wait(&mut state);
                }
            };

            debug!("worker {}: {}", id, item);
            let taken = InFlight { pool, wake };
            if let Err(e) = assemble::process(self.session, &item) {
                let mut state = pool.lock();
                if state.error.is_none() {
                    state.error = Some(e);
                }
            }
            drop(taken);
        }
    }
}

/// Build `module` into an object file
pub fn build_module(
    md: Arc<dyn MetadataProvider>,
    module: ModuleId,
    config: BuildConfig,
    entries: &[MethodSpec],
) -> Result<(ObjectFile, BuildStats), BuildError> {
    let session = BuildSession::new(md, module, config)?;
    let stats = Driver::new(&session).run(entries)?;
    Ok((session.into_object(), stats))
}

/// Build `module` with the configuration stored at `config_path` and write
/// the object to `output`
pub fn build_to_file(
    md: Arc<dyn MetadataProvider>,
    module: ModuleId,
    config_path: &Path,
    output: &Path,
) -> Result<BuildStats, BuildError> {
    let config = BuildConfig::load(config_path)?;
    let (object, stats) = build_module(md, module, config, &[])?;
    let file = File::create(output).map_err(ObjectError::from)?;
    elf::write_elf(&object, &mut BufWriter::new(file))?;
    info!("wrote {}", output.display());
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuildScope, EntryAlias};
    use crate::metadata::{
        BodyBuilder, FieldDefInfo, FieldSpec, InMemoryMetadata, MethodDefInfo, MethodSig,
        TypeDefInfo, TypeKind, TypeSpec, METHOD_STATIC,
    };

    /// `Main` calls `Helper`; `Unused` is never reached
    fn program() -> (Arc<InMemoryMetadata>, ModuleId, MethodSpec) {
        let mut md = InMemoryMetadata::with_corlib();
        let m = md.add_module("app.dll", "app");
        let object = md.corlib_type("Object");
        let program = md.add_type(m, "App", "Program", TypeKind::Class, object);
        let sig = || MethodSig::new_static(None, Vec::new());
        let ret = BodyBuilder::new(&[0x2a]).build();
        let helper = md.add_method(m, program, "Helper", METHOD_STATIC, sig(), Some(&ret));
        md.add_method(m, program, "Unused", METHOD_STATIC, sig(), Some(&ret));
        let token = 0x0600_0000 | helper;
        let mut call = vec![0x28];
        call.extend_from_slice(&token.to_le_bytes());
        call.push(0x2a);
        let main = md.add_method(
            m,
            program,
            "Main",
            METHOD_STATIC,
            sig(),
            Some(&BodyBuilder::new(&call).build()),
        );
        let ms = MethodSpec::def(TypeSpec::def(m, program), m, main);
        (Arc::new(md), m, ms)
    }

    #[test]
    fn test_closure_compiles_reachable_methods() {
        let (md, m, main) = program();
        let (object, stats) = build_module(md, m, BuildConfig::default(), &[main]).unwrap();
        assert_eq!(stats.methods, 2);
        assert_eq!(stats.modules, 1);
        assert_eq!(stats.assemblies, 1);
        assert!(object.undefined_symbols().is_empty(), "{:?}", object.undefined_symbols());
    }

    #[test]
    fn test_compile_all_includes_unreached_methods() {
        let (md, m, _) = program();
        let session = BuildSession::new(md, m, BuildConfig::default()).unwrap();
        let stats = Driver::new(&session).compile_all().unwrap();
        assert_eq!(stats.methods, 3);

        let (md, m, _) = program();
        let config = BuildConfig {
            scope: BuildScope::WholeModule,
            ..BuildConfig::default()
        };
        let (_, stats) = build_module(md, m, config, &[]).unwrap();
        assert_eq!(stats.methods, 3);
    }

    #[test]
    fn test_worker_pool_matches_serial_build() {
        let (md, m, main) = program();
        let (serial, serial_stats) =
            build_module(md, m, BuildConfig::default(), &[main.clone()]).unwrap();

        let (md, m, _) = program();
        let config = BuildConfig {
            threads: 4,
            ..BuildConfig::default()
        };
        let (pooled, pooled_stats) = build_module(md, m, config, &[main]).unwrap();
        assert_eq!(serial_stats, pooled_stats);

        let mut a: Vec<_> = serial.symbols().iter().map(|s| s.name.clone()).collect();
        let mut b: Vec<_> = pooled.symbols().iter().map(|s| s.name.clone()).collect();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[test]
    fn test_alias_roots_are_built() {
        let (md, m, _) = program();
        let config = BuildConfig {
            aliases: vec![EntryAlias {
                namespace: "App".to_string(),
                type_name: "Program".to_string(),
                method: "Main".to_string(),
                alias: "main".to_string(),
            }],
            ..BuildConfig::default()
        };
        let (object, stats) = build_module(md, m, config, &[]).unwrap();
        assert_eq!(stats.methods, 2);
        assert!(object.symbol("main").is_some());
    }

    #[test]
    fn test_build_to_file_writes_elf() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("build.json");
        let config = r#"{"aliases": [
            {"namespace": "App", "type": "Program", "method": "Main", "alias": "main"}
        ]}"#;
        std::fs::write(&config_path, config).unwrap();
        let output = dir.path().join("app.o");

        let (md, m, _) = program();
        let stats = build_to_file(md, m, &config_path, &output).unwrap();
        assert_eq!(stats.methods, 2);
        let bytes = std::fs::read(&output).unwrap();
        assert_eq!(&bytes[..4], b"\x7fELF");
    }

    #[test]
    fn test_first_error_aborts_build() {
        let bad = || {
            let mut md = InMemoryMetadata::with_corlib();
            let m = md.add_module("bad.dll", "bad");
            let t = md.add_type(m, "Bad", "Program", TypeKind::Class, md.corlib_type("Object"));
            // break is decoded but never compiled
            let body = BodyBuilder::new(&[0x01, 0x2a]).build();
            let sig = MethodSig::new_static(None, Vec::new());
            let row = md.add_method(m, t, "Main", METHOD_STATIC, sig, Some(&body));
            (Arc::new(md), m, MethodSpec::def(TypeSpec::def(m, t), m, row))
        };

        for threads in [1, 3] {
            let (md, m, main) = bad();
            let config = BuildConfig {
                threads,
                ..BuildConfig::default()
            };
            let err = build_module(md, m, config, &[main]).unwrap_err();
            assert!(matches!(err, BuildError::Assemble(AssembleError::Ir { .. })), "{}", err);
        }
    }

    /// Delegates to an in-memory provider but panics when a method body is read
    struct PanicsOnBodies(InMemoryMetadata);

    impl MetadataProvider for PanicsOnBodies {
        fn corlib(&self) -> ModuleId {
            self.0.corlib()
        }
        fn module_name(&self, module: ModuleId) -> Result<&str, MetadataError> {
            self.0.module_name(module)
        }
        fn assembly_name(&self, module: ModuleId) -> Result<&str, MetadataError> {
            self.0.assembly_name(module)
        }
        fn assembly_image(&self, module: ModuleId) -> Result<&[u8], MetadataError> {
            self.0.assembly_image(module)
        }
        fn type_count(&self, module: ModuleId) -> Result<u32, MetadataError> {
            self.0.type_count(module)
        }
        fn type_def(&self, module: ModuleId, row: u32) -> Result<&TypeDefInfo, MetadataError> {
            self.0.type_def(module, row)
        }
        fn find_type(&self, module: ModuleId, namespace: &str, name: &str) -> Option<u32> {
            self.0.find_type(module, namespace, name)
        }
        fn field_def(&self, module: ModuleId, row: u32) -> Result<&FieldDefInfo, MetadataError> {
            self.0.field_def(module, row)
        }
        fn method_def(&self, module: ModuleId, row: u32) -> Result<&MethodDefInfo, MetadataError> {
            self.0.method_def(module, row)
        }
        fn method_body(&self, _module: ModuleId, rva: u32) -> Result<&[u8], MetadataError> {
            panic!("body at rva {:#x} is unreadable", rva)
        }
        fn resolve_rva(&self, module: ModuleId, rva: u32) -> Result<u64, MetadataError> {
            self.0.resolve_rva(module, rva)
        }
        fn local_signature(
            &self,
            module: ModuleId,
            token: u32,
        ) -> Result<Vec<TypeSpec>, MetadataError> {
            self.0.local_signature(module, token)
        }
        fn resolve_type(&self, module: ModuleId, token: u32) -> Result<TypeSpec, MetadataError> {
            self.0.resolve_type(module, token)
        }
        fn resolve_method(
            &self,
            module: ModuleId,
            token: u32,
        ) -> Result<MethodSpec, MetadataError> {
            self.0.resolve_method(module, token)
        }
        fn resolve_field(&self, module: ModuleId, token: u32) -> Result<FieldSpec, MetadataError> {
            self.0.resolve_field(module, token)
        }
        fn user_string(&self, module: ModuleId, index: u32) -> Result<&str, MetadataError> {
            self.0.user_string(module, index)
        }
    }

    #[test]
    fn test_worker_panic_ends_build() {
        let (md, m, main) = program();
        let md = Arc::try_unwrap(md).ok().unwrap();
        let config = BuildConfig {
            threads: 3,
            ..BuildConfig::default()
        };
        let err = build_module(Arc::new(PanicsOnBodies(md)), m, config, &[main]).unwrap_err();
        assert!(matches!(err, BuildError::WorkerPanicked), "{}", err);
    }
}
