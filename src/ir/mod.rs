//! IR module
//!
//! Defines the 32-opcode instruction format and the assembler/disassembler.

pub mod assembler;
pub mod format;

pub use assembler::{AsmError, Assembler, Disassembler, Relocation, MAX_STACK_OFFSET};
pub use format::*;
