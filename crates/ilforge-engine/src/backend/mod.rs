//! Code generation backends
//!
//! A backend turns the IR of one method, together with its register
//! allocation, into relocatable machine code. The pipeline is:
//!
//! ```text
//! Code --regalloc::allocate--> Allocation --compile_function--> CompiledCode
//! ```

pub mod x86_64;

use rustc_hash::FxHashMap;

use crate::code::Code;
use crate::config::TargetArch;
use crate::ir::ValueClass;
use crate::object::BlobReloc;
use crate::regalloc::Allocation;

pub use self::x86_64::X86_64Backend;

/// Target information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub pointer_size: u32,
}

/// A machine register the allocator may hand out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysReg {
    pub class: ValueClass,
    /// Hardware register number within its class
    pub num: u8,
}

impl PhysReg {
    pub const fn int(num: u8) -> Self {
        Self {
            class: ValueClass::Int,
            num,
        }
    }

    pub const fn float(num: u8) -> Self {
        Self {
            class: ValueClass::Float,
            num,
        }
    }
}

/// Allocatable registers of a target, in allocation order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    pub int: Vec<PhysReg>,
    pub float: Vec<PhysReg>,
}

impl RegisterFile {
    /// Pool for a value class; value types have none
    pub fn pool(&self, class: ValueClass) -> &[PhysReg] {
        match class {
            ValueClass::Int => &self.int,
            ValueClass::Float => &self.float,
            ValueClass::Vt => &[],
        }
    }
}

/// Error during code generation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodegenError {
    #[error("Unsupported operation at IL_{offset:04x}: {what}")]
    Unsupported { offset: u32, what: String },
    #[error("Label {0} is never defined")]
    UndefinedLabel(String),
    #[error("No location for stack depth {depth} at IL_{offset:04x}")]
    MissingLocation { offset: u32, depth: usize },
    #[error("Branch relaxation did not converge")]
    RelaxationDiverged,
}

/// Code offsets of one exception clause's handler blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerCode {
    pub clause: usize,
    pub handler: u32,
    pub filter: Option<u32>,
}

/// Machine code for one method, not yet placed in a section
#[derive(Debug, Clone, Default)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    /// Relocations relative to the start of `code`
    pub relocations: Vec<BlobReloc>,
    /// Instruction offset to code offset; the end of the method maps to the
    /// end of its body
    pub il_offsets: FxHashMap<u32, u32>,
    pub handlers: Vec<HandlerCode>,
    /// Bytes reserved below the frame pointer
    pub frame_size: u32,
}

impl CompiledCode {
    /// Code offset of an instruction offset
    pub fn code_offset(&self, il: u32) -> Option<u32> {
        self.il_offsets.get(&il).copied()
    }

    /// Handler block offsets of a clause
    pub fn handler(&self, clause: usize) -> Option<&HandlerCode> {
        self.handlers.iter().find(|h| h.clause == clause)
    }
}

/// The code generation trait
///
/// Backends are shared by all worker threads of a build.
pub trait CodegenBackend: Send + Sync {
    /// Backend name (for diagnostics)
    fn name(&self) -> &str;

    /// Return target architecture information
    fn target_info(&self) -> TargetInfo;

    /// Registers the allocator may assign
    fn register_file(&self) -> RegisterFile;

    /// Compile the IR of a method to machine code
    fn compile_function(
        &self,
        code: &Code,
        alloc: &Allocation,
    ) -> Result<CompiledCode, CodegenError>;
}

/// Backend for a target architecture
pub fn create(arch: TargetArch) -> Box<dyn CodegenBackend> {
    match arch {
        TargetArch::X86_64 => Box::new(X86_64Backend::new()),
    }
}
