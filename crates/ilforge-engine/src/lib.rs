//! Ilforge Engine
//!
//! Ahead-of-time compiler backend from CIL bytecode to native relocatable
//! objects:
//! - **Decoding**: method body headers, exception clauses and instructions (`cil`)
//! - **IR**: stack-typed IR built by symbolic execution (`ir`)
//! - **Codegen**: register allocation and x86-64 instruction selection and
//!   encoding (`regalloc`, `backend`)
//! - **Emission**: vtables, static data, constant table and the object file
//!   (`layout`, `string_table`, `object`)
//! - **Driver**: the work closure and the worker pool (`requestor`, `session`,
//!   `driver`)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ilforge_engine::{build_module, BuildConfig, InMemoryMetadata};
//!
//! let md = Arc::new(metadata);
//! let (object, stats) = build_module(md, module, BuildConfig::default(), &[main])?;
//! let bytes = ilforge_engine::object::elf::to_elf_bytes(&object)?;
//! ```

#![warn(rust_2018_idioms)]
#![cfg_attr(test, allow(clippy::identity_op))]
#![allow(clippy::too_many_arguments)]

// ============================================================================
// Inputs
// ============================================================================

/// Build configuration
pub mod config;

/// Metadata identities, provider trait and in-memory provider
pub mod metadata;

/// Symbol names of emitted artifacts
pub mod mangle;

/// Type, field and vtable layout
pub mod layout;

// ============================================================================
// Compilation pipeline
// ============================================================================

/// Method body decoding
pub mod cil;

/// Stack-typed IR
pub mod ir;

/// Per-method compilation record
pub mod code;

/// Register allocation
pub mod regalloc;

/// Code generation backends
pub mod backend;

/// Runtime helper symbols called by generated code
pub mod runtime;

// ============================================================================
// Output and driving
// ============================================================================

/// Relocatable object model and ELF writer
pub mod object;

/// Work closure
pub mod requestor;

/// Constant and signature table
pub mod string_table;

/// Per-artifact pipelines
pub mod assemble;

/// Shared build state
pub mod session;

/// Build driver
pub mod driver;

// ============================================================================
// Re-exports
// ============================================================================

pub use assemble::AssembleError;
pub use backend::{CodegenBackend, CodegenError, CompiledCode, X86_64Backend};
pub use cil::DecodeError;
pub use config::{BuildConfig, BuildScope, ConfigError, EntryAlias, SpillPolicy, TargetArch};
pub use driver::{build_module, build_to_file, BuildError, Driver};
pub use ir::IrError;
pub use metadata::{
    FieldSpec, InMemoryMetadata, MetadataError, MetadataProvider, MethodSpec, ModuleId, TypeSpec,
};
pub use object::{ObjectError, ObjectFile};
pub use regalloc::AllocError;
pub use requestor::{CachingRequestor, Requestor, WorkItem};
pub use session::{BuildSession, BuildStats};
pub use string_table::StringTable;
