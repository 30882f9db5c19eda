//! Interpreter for rvm object programs
//!
//! Each step fetches and decodes one instruction, validates it, checks the
//! entry landing rule, resolves every operand to a [`Location`] and then
//! executes. Errors leave `pc` on the faulting instruction.

use super::memory::{Memory, MemoryError};
use crate::config::InterpreterConfig;
use crate::ir::{CodecError, FetchError, Instruction, Mode, Opcode, Operand, OperandKind, Program};
use crate::ir::{OPERAND_SLOTS, REGISTER_COUNT};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterpError {
    #[error("pc {pc}: ran past the end of the program")]
    RanPastEnd { pc: usize },
    #[error("pc {pc}: instruction is missing trailing words")]
    TruncatedInstruction { pc: usize },
    #[error("pc {pc}: {source}")]
    Decode {
        pc: usize,
        #[source]
        source: CodecError,
    },
    #[error("pc {pc}: invalid instruction '{instruction}'")]
    InvalidInstruction { pc: usize, instruction: String },
    #[error("pc {pc}: jump landed on '{opcode}' instead of entry")]
    MissedEntry { pc: usize, opcode: Opcode },
    #[error("pc {pc}: stack underflow")]
    StackUnderflow { pc: usize },
    #[error("pc {pc}: division by zero")]
    DivisionByZero { pc: usize },
    #[error("pc {pc}: '{opcode}' is not supported at runtime")]
    Unsupported { pc: usize, opcode: Opcode },
    #[error("pc {pc}: {source}")]
    MemoryLimit {
        pc: usize,
        #[source]
        source: MemoryError,
    },
    #[error("pc {pc}: instruction budget of {limit} exhausted")]
    StepLimit { pc: usize, limit: u64 },
}

impl InterpError {
    /// Word address of the instruction that failed
    pub fn pc(&self) -> usize {
        match self {
            InterpError::RanPastEnd { pc }
            | InterpError::TruncatedInstruction { pc }
            | InterpError::Decode { pc, .. }
            | InterpError::InvalidInstruction { pc, .. }
            | InterpError::MissedEntry { pc, .. }
            | InterpError::StackUnderflow { pc }
            | InterpError::DivisionByZero { pc }
            | InterpError::Unsupported { pc, .. }
            | InterpError::MemoryLimit { pc, .. }
            | InterpError::StepLimit { pc, .. } => *pc,
        }
    }
}

/// A writable storage cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Register(usize),
    Stack(usize),
    Heap(usize),
}

/// What an operand slot resolved to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// A direct immediate
    Value(u32),
    Place(Place),
}

/// Control flow result from executing an instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlFlow {
    /// Continue to next instruction
    Continue,
    /// Taken jump or call; the target must be an entry
    Jump(usize),
    /// Return address popped by ret
    Return(usize),
    /// Halt execution
    Halt,
}

/// Snapshot of machine state, serialized by `rvm --dump-state`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineState {
    pub pc: usize,
    pub sp: usize,
    pub registers: [u32; REGISTER_COUNT],
    pub zero: bool,
    pub negative: bool,
    pub halted: bool,
    pub heap_mark: u32,
    pub instruction_count: u64,
    /// Live stack words, bottom first
    pub stack: Vec<u32>,
}

/// Interpreter state
pub struct Interpreter {
    /// Register file, kept across runs so callers can seed inputs
    pub registers: [u32; REGISTER_COUNT],
    /// Word address of the next instruction
    pc: usize,
    /// Number of live stack words
    sp: usize,
    zero: bool,
    negative: bool,
    /// Previous step took a jump or call
    jumped: bool,
    halted: bool,
    stack: Memory,
    heap: Memory,
    /// Next free heap word
    heap_mark: u32,
    instruction_count: u64,
    max_instructions: Option<u64>,
}

impl Interpreter {
    /// Create an interpreter with default memory settings
    pub fn new() -> Self {
        Self::with_config(&InterpreterConfig::default())
    }

    /// Create an interpreter from the `[interpreter]` config section
    pub fn with_config(config: &InterpreterConfig) -> Self {
        Self {
            registers: [0; REGISTER_COUNT],
            pc: 0,
            sp: 0,
            zero: false,
            negative: false,
            jumped: false,
            halted: false,
            stack: Memory::new(config.page_words, config.max_memory_words),
            heap: Memory::new(config.page_words, config.max_memory_words),
            heap_mark: 0,
            instruction_count: 0,
            max_instructions: config.max_instructions,
        }
    }

    /// Set maximum instructions to execute
    pub fn with_max_instructions(mut self, max: u64) -> Self {
        self.max_instructions = Some(max);
        self
    }

    /// Clear everything but the registers
    pub fn reset(&mut self) {
        self.pc = 0;
        self.sp = 0;
        self.zero = false;
        self.negative = false;
        self.jumped = false;
        self.halted = false;
        self.stack.clear();
        self.heap.clear();
        self.heap_mark = 0;
        self.instruction_count = 0;
    }

    /// Execute a program from word 0 until `hlt` or the first error
    pub fn execute(&mut self, program: &Program) -> Result<(), InterpError> {
        self.reset();
        while !self.halted {
            self.step(program)?;
        }
        debug!(
            pc = self.pc,
            instructions = self.instruction_count,
            "halted"
        );
        Ok(())
    }

    /// Execute one instruction
    pub fn step(&mut self, program: &Program) -> Result<(), InterpError> {
        let pc = self.pc;
        if let Some(limit) = self.max_instructions {
            if self.instruction_count >= limit {
                return Err(InterpError::StepLimit { pc, limit });
            }
        }

        let (instr, next) = program.fetch(pc).map_err(|e| match e {
            FetchError::EndOfProgram(pc) => InterpError::RanPastEnd { pc },
            FetchError::Truncated(pc) => InterpError::TruncatedInstruction { pc },
            FetchError::Codec { pc, source } => InterpError::Decode { pc, source },
        })?;
        self.instruction_count += 1;
        trace!(pc, sp = self.sp, instr = %instr, "step");

        if !instr.validate() {
            return Err(InterpError::InvalidInstruction {
                pc,
                instruction: instr.to_string(),
            });
        }

        if std::mem::take(&mut self.jumped) && instr.opcode != Opcode::Entry {
            return Err(InterpError::MissedEntry {
                pc,
                opcode: instr.opcode,
            });
        }

        match self.execute_instruction(&instr, pc, next)? {
            ControlFlow::Continue => self.pc = next,
            ControlFlow::Jump(target) => {
                self.pc = target;
                self.jumped = true;
            }
            ControlFlow::Return(target) => self.pc = target,
            ControlFlow::Halt => self.halted = true,
        }
        Ok(())
    }

    fn execute_instruction(
        &mut self,
        instr: &Instruction,
        pc: usize,
        next: usize,
    ) -> Result<ControlFlow, InterpError> {
        if instr.opcode == Opcode::Entry {
            return Ok(ControlFlow::Continue);
        }

        // Resolve against the pre-execution sp and registers
        let mut locs = [None; OPERAND_SLOTS];
        for (loc, operand) in locs.iter_mut().zip(&instr.operands) {
            *loc = operand.as_ref().map(|op| self.resolve(op));
        }
        let [l0, l1, l2] = locs;

        match instr.opcode {
            Opcode::Hlt => return Ok(ControlFlow::Halt),
            Opcode::Entry => {}

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Or
            | Opcode::And
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr => {
                let a = self.read(pc, Self::slot(l0))?;
                let b = self.read(pc, Self::slot(l1))?;
                let result = Self::alu_op(instr.opcode, a, b)
                    .ok_or(InterpError::DivisionByZero { pc })?;
                // Without a third operand the first doubles as destination
                let dest = Self::place(pc, instr, l2.or(l0))?;
                self.write(pc, dest, result)?;
            }

            Opcode::Not => {
                let a = self.read(pc, Self::slot(l0))?;
                let dest = Self::place(pc, instr, l1.or(l0))?;
                self.write(pc, dest, !a)?;
            }

            Opcode::Cmp => {
                let a = self.read(pc, Self::slot(l0))?;
                let b = self.read(pc, Self::slot(l1))?;
                self.zero = a == b;
                self.negative = a.wrapping_sub(b) & 0x8000_0000 != 0;
            }

            Opcode::Jmp
            | Opcode::Je
            | Opcode::Jl
            | Opcode::Jle
            | Opcode::Jne
            | Opcode::Jnl
            | Opcode::Jnle => {
                let offset = self.read(pc, Self::slot(l0))?;
                if self.condition(instr.opcode) {
                    return Ok(ControlFlow::Jump(Self::relative(pc, offset)));
                }
            }

            Opcode::Call => {
                let offset = self.read(pc, Self::slot(l0))?;
                self.push(pc, next as u32)?;
                return Ok(ControlFlow::Jump(Self::relative(pc, offset)));
            }

            Opcode::Ret => {
                let target = self.pop(pc)?;
                return Ok(ControlFlow::Return(target as usize));
            }

            Opcode::Push => {
                let value = self.read(pc, Self::slot(l0))?;
                self.push(pc, value)?;
            }

            Opcode::Pop => {
                let dest = Self::place(pc, instr, l0)?;
                let value = self.pop(pc)?;
                self.write(pc, dest, value)?;
            }

            Opcode::Swap => {
                let d0 = Self::place(pc, instr, l0)?;
                let d1 = Self::place(pc, instr, l1)?;
                let a = self.read(pc, Location::Place(d0))?;
                let b = self.read(pc, Location::Place(d1))?;
                self.write(pc, d0, b)?;
                self.write(pc, d1, a)?;
            }

            Opcode::Alloc => {
                let dest = Self::place(pc, instr, l1)?;
                let size = self.read(pc, Self::slot(l0))?;
                let base = self.heap_mark;
                // The mark only moves up, so a block past u32::MAX is refused
                let mark = base.checked_add(size).ok_or(InterpError::MemoryLimit {
                    pc,
                    source: MemoryError::LimitExceeded {
                        index: (base as usize).saturating_add(size as usize),
                        limit: self.heap.max_words(),
                    },
                })?;
                if mark > base {
                    self.heap
                        .ensure(mark as usize - 1)
                        .map_err(|source| InterpError::MemoryLimit { pc, source })?;
                }
                self.heap_mark = mark;
                debug!(pc, base, size, "alloc");
                self.write(pc, dest, base)?;
            }

            Opcode::Free
            | Opcode::Exp0
            | Opcode::Exp1
            | Opcode::Exp2
            | Opcode::Exp3
            | Opcode::Exp4 => {
                return Err(InterpError::Unsupported {
                    pc,
                    opcode: instr.opcode,
                })
            }
        }

        Ok(ControlFlow::Continue)
    }

    /// Validated slots are present; absent ones read as the constant 0
    fn slot(loc: Option<Location>) -> Location {
        loc.unwrap_or(Location::Value(0))
    }

    /// Destination cell of a validated writable slot
    fn place(pc: usize, instr: &Instruction, loc: Option<Location>) -> Result<Place, InterpError> {
        match loc {
            Some(Location::Place(place)) => Ok(place),
            _ => Err(InterpError::InvalidInstruction {
                pc,
                instruction: instr.to_string(),
            }),
        }
    }

    fn relative(pc: usize, offset: u32) -> usize {
        (pc as u32).wrapping_add(offset) as usize
    }

    fn condition(&self, opcode: Opcode) -> bool {
        match opcode {
            Opcode::Je => self.zero,
            Opcode::Jne => !self.zero,
            Opcode::Jl => self.negative,
            Opcode::Jle => self.negative || self.zero,
            Opcode::Jnl => !self.negative,
            Opcode::Jnle => !self.negative && !self.zero,
            _ => true,
        }
    }

    /// `None` on division by zero
    fn alu_op(opcode: Opcode, a: u32, b: u32) -> Option<u32> {
        Some(match opcode {
            Opcode::Add => a.wrapping_add(b),
            Opcode::Sub => a.wrapping_sub(b),
            Opcode::Mul => a.wrapping_mul(b),
            Opcode::Div => a.checked_div(b)?,
            Opcode::Or => a | b,
            Opcode::And => a & b,
            Opcode::Xor => a ^ b,
            Opcode::Shl => a.wrapping_shl(b),
            Opcode::Shr => a.wrapping_shr(b),
            _ => return None,
        })
    }

    /// Map an operand to the value or cell it names
    pub fn resolve(&self, operand: &Operand) -> Location {
        let base = match operand.kind {
            OperandKind::Register => self.registers[operand.value as usize % REGISTER_COUNT],
            OperandKind::SmallImm | OperandKind::LargeImm => operand.value,
        };
        match (operand.mode, operand.kind) {
            (Mode::Direct, OperandKind::Register) => {
                Location::Place(Place::Register(operand.value as usize % REGISTER_COUNT))
            }
            (Mode::Direct, _) => Location::Value(base),
            (Mode::Stack, _) => {
                Location::Place(Place::Stack((self.sp as u32).wrapping_add(base) as usize))
            }
            (Mode::Heap, _) => Location::Place(Place::Heap(base as usize)),
        }
    }

    fn read(&mut self, pc: usize, loc: Location) -> Result<u32, InterpError> {
        let result = match loc {
            Location::Value(v) => Ok(v),
            Location::Place(Place::Register(r)) => Ok(self.registers[r]),
            Location::Place(Place::Stack(i)) => self.stack.read(i),
            Location::Place(Place::Heap(i)) => self.heap.read(i),
        };
        result.map_err(|source| InterpError::MemoryLimit { pc, source })
    }

    fn write(&mut self, pc: usize, place: Place, value: u32) -> Result<(), InterpError> {
        let result = match place {
            Place::Register(r) => {
                self.registers[r] = value;
                Ok(())
            }
            Place::Stack(i) => self.stack.write(i, value),
            Place::Heap(i) => self.heap.write(i, value),
        };
        result.map_err(|source| InterpError::MemoryLimit { pc, source })
    }

    fn push(&mut self, pc: usize, value: u32) -> Result<(), InterpError> {
        self.stack
            .write(self.sp, value)
            .map_err(|source| InterpError::MemoryLimit { pc, source })?;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self, pc: usize) -> Result<u32, InterpError> {
        if self.sp == 0 {
            return Err(InterpError::StackUnderflow { pc });
        }
        self.sp -= 1;
        self.stack
            .read(self.sp)
            .map_err(|source| InterpError::MemoryLimit { pc, source })
    }

    /// Get instruction count
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn zero_flag(&self) -> bool {
        self.zero
    }

    pub fn negative_flag(&self) -> bool {
        self.negative
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn heap_mark(&self) -> u32 {
        self.heap_mark
    }

    /// Stack memory, including words above `sp`
    pub fn stack(&self) -> &Memory {
        &self.stack
    }

    pub fn heap(&self) -> &Memory {
        &self.heap
    }

    /// Live stack words, bottom first
    pub fn live_stack(&self) -> &[u32] {
        let words = self.stack.as_slice();
        &words[..self.sp.min(words.len())]
    }

    /// Read a heap word without growing the heap
    pub fn peek_heap(&self, index: usize) -> u32 {
        self.heap.as_slice().get(index).copied().unwrap_or(0)
    }

    pub fn state(&self) -> MachineState {
        MachineState {
            pc: self.pc,
            sp: self.sp,
            registers: self.registers,
            zero: self.zero,
            negative: self.negative,
            halted: self.halted,
            heap_mark: self.heap_mark,
            instruction_count: self.instruction_count,
            stack: self.live_stack().to_vec(),
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}
