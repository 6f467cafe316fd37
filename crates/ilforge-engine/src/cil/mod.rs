//! Method body decoding
//!
//! Parses the body header, the exception clause sections and the instruction
//! stream of one method. Decoding is a pure transform; malformed input is
//! reported as a [`DecodeError`].

pub mod decoder;
pub mod header;
pub mod opcodes;

pub use decoder::{decode, mark_block_starts, offset_map, CilNode, Operand};
pub use header::{parse_body, parse_header, ClauseKind, ExceptionHeader, MethodBody, MethodHeader};
pub use opcodes::{Opcode, OperandKind};

/// Error raised while decoding a method body
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid method header format byte {0:#04x}")]
    InvalidHeader(u8),
    #[error("Invalid method data section kind {0:#04x}")]
    InvalidSectionKind(u8),
    #[error("Invalid exception clause flags {0:#x}")]
    InvalidClauseFlags(u32),
    #[error("Invalid method data section size {size} at offset {offset}")]
    InvalidSectionSize { offset: usize, size: usize },
    #[error("Exception clause {clause} region {offset:#x}+{length:#x} lies outside the code")]
    InvalidClauseRange { clause: usize, offset: u32, length: u32 },
    #[error("Unexpected end of method body at offset {0}")]
    UnexpectedEnd(usize),
    #[error("Invalid opcode {value:#x} at IL_{offset:04x}")]
    InvalidOpcode { value: u16, offset: u32 },
    #[error("Unsupported opcode {value:#x} at IL_{offset:04x}")]
    UnsupportedOpcode { value: u16, offset: u32 },
    #[error("Branch at IL_{offset:04x} targets {target}, which is not an instruction")]
    InvalidBranchTarget { offset: u32, target: i64 },
}
