//! Stack-typed intermediate representation
//!
//! The builder symbolically executes a method's bytecode against a typed
//! evaluation stack and attaches a list of [`IrNode`]s to every decoded
//! instruction, each annotated with the stack before and after it.

pub mod array;
pub mod builder;
pub mod display;
pub mod node;
pub mod ops;
pub mod stack;
pub mod types;

pub use builder::build;
pub use node::{BinOp, CondCode, IrNode, IrOp, ShiftOp};
pub use stack::Stack;
pub use types::{canonical, Ct, StackItem, ValueClass};

use crate::cil::DecodeError;
use crate::metadata::MetadataError;

/// Error raised while building IR for a method
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IrError {
    #[error("Method has no body")]
    NoBody,
    #[error("Evaluation stack underflow at IL_{offset:04x}")]
    StackUnderflow { offset: u32 },
    #[error("Stack shapes differ at merge point IL_{offset:04x}: {expected} vs {found}")]
    StackMismatch {
        offset: u32,
        expected: String,
        found: String,
    },
    #[error("Invalid operands for {opcode} at IL_{offset:04x}: {operands}")]
    InvalidOperands {
        offset: u32,
        opcode: String,
        operands: String,
    },
    #[error("Unsupported construct at IL_{offset:04x}: {what}")]
    Unsupported { offset: u32, what: String },
    #[error("Accessor {method} returns {found}, expected {expected}")]
    ReturnTypeMismatch {
        method: String,
        expected: String,
        found: String,
    },
    #[error("Invalid leave at IL_{offset:04x}")]
    InvalidLeave { offset: u32 },
    #[error("Control falls through the end of the method after IL_{offset:04x}")]
    FallThroughEnd { offset: u32 },
    #[error("Invalid local variable {index} at IL_{offset:04x}")]
    InvalidLocal { offset: u32, index: u32 },
    #[error("Invalid argument {index} at IL_{offset:04x}")]
    InvalidArgument { offset: u32, index: u32 },
    #[error("Unexpected operand for {opcode} at IL_{offset:04x}")]
    BadOperand { offset: u32, opcode: String },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}
