//! Interpreter module
//!
//! Executes object programs against registers, flags and paged stack/heap memory.

pub mod dispatch;
pub mod memory;

pub use dispatch::{InterpError, Interpreter, Location, MachineState, Place};
pub use memory::{Memory, MemoryError, DEFAULT_MAX_WORDS, DEFAULT_PAGE_WORDS};
