//! rvm - a small register virtual machine
//!
//! Three parts that agree bit-for-bit on one instruction format:
//!
//! - **Codec** ([`ir::format`]): 32 opcodes, three operand slots, a 32-bit base
//!   word plus one trailing word per large immediate
//! - **Assembler** ([`ir::assembler`]): line-oriented text with labels, forward
//!   declarations and relocations patched after the last line
//! - **Interpreter** ([`interp`]): eight registers, zero/negative flags, paged
//!   stack and heap, and an entry marker required at every jump target
//!
//! # Example
//!
//! ```rust
//! use rvm::ir::Assembler;
//! use rvm::interp::Interpreter;
//!
//! let mut asm = Assembler::new();
//! let program = asm.assemble(r#"
//!     add r0 40
//!     add r0 2
//!     hlt
//! "#).unwrap();
//!
//! let mut interp = Interpreter::new();
//! interp.execute(&program).unwrap();
//!
//! assert_eq!(interp.registers[0], 42);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  .asm source    │
//! └────────┬────────┘
//!          │  rvm-asm
//!          ▼
//! ┌─────────────────┐
//! │  Object words   │  little-endian u32, no header
//! └────────┬────────┘
//!          │  rvm
//!          ▼
//! ┌─────────────────┐
//! │  Interpreter    │  fetch, validate, resolve, execute
//! └─────────────────┘
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod interp;
pub mod ir;

use thiserror::Error;

// Re-export commonly used types
pub use config::{ConfigError, InterpreterConfig, LoggingConfig, RvmConfig};
pub use interp::{InterpError, Interpreter, MachineState, Memory, MemoryError};
pub use ir::{
    AsmError, Assembler, CodecError, Disassembler, Instruction, Opcode, Operand, Program,
};

/// Assemble and run a program with the default interpreter
pub fn execute(source: &str) -> Result<Interpreter, ExecuteError> {
    let program = Assembler::new().assemble(source)?;
    let mut interp = Interpreter::new();
    interp.execute(&program)?;
    Ok(interp)
}

/// Error type for execution
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("assembly failed: {0}")]
    Assemble(#[from] AsmError),
    #[error("execution failed: {0}")]
    Interpret(#[from] InterpError),
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
