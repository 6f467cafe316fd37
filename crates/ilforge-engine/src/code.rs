//! Per-method compilation record

use rustc_hash::FxHashMap;

use crate::cil::{CilNode, ExceptionHeader, MethodHeader};
use crate::ir::{Ct, IrNode};
use crate::metadata::{MethodSpec, ModuleId, TypeSpec};

/// A local variable or argument
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVar {
    pub ts: TypeSpec,
    pub ct: Ct,
    /// Size of the stored value
    pub size: u32,
    /// Whether loads sign-extend
    pub signed: bool,
}

/// What an entry point starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// The method itself
    Method,
    /// Handler block of a clause
    Handler(usize),
    /// Filter block of a filter clause
    Filter(usize),
}

/// A node where execution begins from outside the method's own control flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Index into [`Code::nodes`]
    pub node: usize,
    pub kind: EntryKind,
}

/// Everything known about one method while it is being compiled
#[derive(Debug, Clone)]
pub struct Code {
    pub method: MethodSpec,
    /// Mangled symbol of the method
    pub symbol: String,
    /// Module the body comes from
    pub module: ModuleId,
    pub header: MethodHeader,
    pub nodes: Vec<CilNode>,
    /// Instruction offset to node index
    pub offsets: FxHashMap<u32, usize>,
    pub clauses: Vec<ExceptionHeader>,
    /// Arguments, `this` first for instance methods
    pub args: Vec<LocalVar>,
    pub locals: Vec<LocalVar>,
    pub ret: Option<LocalVar>,
    pub entries: Vec<Entry>,
}

impl Code {
    /// Add a compiler-generated local and return its index
    pub fn add_temp_local(&mut self, var: LocalVar) -> u32 {
        self.locals.push(var);
        self.locals.len() as u32 - 1
    }

    /// Node index of the instruction at `offset`
    pub fn node_at(&self, offset: u32) -> Option<usize> {
        self.offsets.get(&offset).copied()
    }

    /// Every IR node in instruction order
    pub fn ir(&self) -> impl Iterator<Item = &IrNode> {
        self.nodes.iter().flat_map(|n| n.ir.iter())
    }

    /// Whether the method has exception clauses
    pub fn has_handlers(&self) -> bool {
        !self.clauses.is_empty()
    }

    /// Entry point of a clause's handler or filter
    pub fn entry(&self, kind: EntryKind) -> Option<&Entry> {
        self.entries.iter().find(|e| e.kind == kind)
    }
}
