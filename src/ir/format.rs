//! Instruction format for the rvm
//!
//! 32-opcode register machine with three operand slots per instruction.
//!
//! # Instruction Encoding
//!
//! Every instruction starts with one 32-bit word:
//! ```text
//! ┌──────────┬──────────────┬────────────────────────────┐
//! │  Opcode  │  Descriptor  │  Packed operand payloads   │
//! │  5 bits  │   10 bits    │          17 bits           │
//! └──────────┴──────────────┴────────────────────────────┘
//! ```
//!
//! The descriptor holds three base-10 digits, one per slot (slot 0 is the
//! least significant digit). Digit 0 means the slot is absent, digits 1-9
//! select one of the 3 × 3 (kind, mode) pairs.
//!
//! Payloads are packed from bit 0 upward in slot order. A register takes
//! 3 bits. Small immediates share what is left evenly:
//! `(17 - 3 * registers) / small_immediates` bits each, two's complement.
//! Large immediates have no payload bits; each one is followed by a trailing
//! 32-bit word, in slot order:
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────┐
//! │  Base word   │  Trailing word   │  Trailing word   │  ...
//! └──────────────┴──────────────────┴──────────────────┘
//! ```

use std::fmt;
use thiserror::Error;

/// Width of the opcode field
pub const OPCODE_BITS: u32 = 5;
/// Width of the operand descriptor field
pub const DESCRIPTOR_BITS: u32 = 10;
/// Bits available for in-word operand payloads
pub const PAYLOAD_BITS: u32 = 17;
/// Payload width of a register operand
pub const REGISTER_BITS: u32 = 3;
/// Operand slots per instruction
pub const OPERAND_SLOTS: usize = 3;
/// General purpose registers
pub const REGISTER_COUNT: usize = 8;
/// Bytes per object word
pub const WORD_BYTES: usize = 4;

const DESCRIPTOR_SHIFT: u32 = PAYLOAD_BITS;
const OPCODE_SHIFT: u32 = PAYLOAD_BITS + DESCRIPTOR_BITS;
const DESCRIPTOR_MASK: u32 = (1 << DESCRIPTOR_BITS) - 1;
/// One past the largest well-formed descriptor (three decimal digits)
const DESCRIPTOR_LIMIT: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("malformed operand descriptor {0}")]
    MalformedDescriptor(u16),
    #[error("register index {value} in slot {slot} is out of range")]
    RegisterOutOfRange { slot: usize, value: u32 },
    #[error("immediate {value} in slot {slot} does not fit in {width} bits")]
    ImmediateOutOfRange { slot: usize, value: u32, width: u32 },
}

/// Opcode definitions (32 total, fits in 5 bits)
///
/// The discriminant is the encoded opcode field, so the order is significant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Stop the machine
    Hlt = 0x00,
    // Arithmetic/Logic: op0 ∘ op1 → op2, or → op0 without op2
    Add = 0x01,
    Sub = 0x02,
    Mul = 0x03,
    Div = 0x04,
    Or = 0x05,
    And = 0x06,
    /// Bitwise complement: !op0 → op1, or → op0 without op1
    Not = 0x07,
    Xor = 0x08,
    Shl = 0x09,
    Shr = 0x0A,
    /// Set zero/negative flags from op0 - op1
    Cmp = 0x0B,
    /// Landing marker for jumps and calls
    Entry = 0x0C,

    // Control flow, relative to the instruction's own address
    Jmp = 0x0D,
    Je = 0x0E,
    Jl = 0x0F,
    Jle = 0x10,
    Jne = 0x11,
    Jnl = 0x12,
    Jnle = 0x13,
    Call = 0x14,
    Ret = 0x15,

    // Stack
    Push = 0x16,
    Pop = 0x17,
    Swap = 0x18,

    // Heap
    Alloc = 0x19,
    Free = 0x1A,

    // Reserved, never valid
    Exp0 = 0x1B,
    Exp1 = 0x1C,
    Exp2 = 0x1D,
    Exp3 = 0x1E,
    Exp4 = 0x1F,
}

impl Opcode {
    /// Every opcode in encoding order
    pub const ALL: [Opcode; 32] = [
        Opcode::Hlt,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Or,
        Opcode::And,
        Opcode::Not,
        Opcode::Xor,
        Opcode::Shl,
        Opcode::Shr,
        Opcode::Cmp,
        Opcode::Entry,
        Opcode::Jmp,
        Opcode::Je,
        Opcode::Jl,
        Opcode::Jle,
        Opcode::Jne,
        Opcode::Jnl,
        Opcode::Jnle,
        Opcode::Call,
        Opcode::Ret,
        Opcode::Push,
        Opcode::Pop,
        Opcode::Swap,
        Opcode::Alloc,
        Opcode::Free,
        Opcode::Exp0,
        Opcode::Exp1,
        Opcode::Exp2,
        Opcode::Exp3,
        Opcode::Exp4,
    ];

    /// Convert from u8, returning None for invalid opcodes
    pub fn from_u8(val: u8) -> Option<Self> {
        Self::ALL.get(val as usize).copied()
    }

    /// Find the first opcode whose mnemonic starts with `prefix`
    ///
    /// Abbreviations are accepted; table order breaks ties.
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        if prefix.is_empty() {
            return None;
        }
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.mnemonic().starts_with(prefix))
    }

    /// Get the mnemonic for this opcode
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::Hlt => "hlt",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Or => "or",
            Opcode::And => "and",
            Opcode::Not => "not",
            Opcode::Xor => "xor",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::Cmp => "cmp",
            Opcode::Entry => "entry",
            Opcode::Jmp => "jmp",
            Opcode::Je => "je",
            Opcode::Jl => "jl",
            Opcode::Jle => "jle",
            Opcode::Jne => "jne",
            Opcode::Jnl => "jnl",
            Opcode::Jnle => "jnle",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Swap => "swap",
            Opcode::Alloc => "alloc",
            Opcode::Free => "free",
            Opcode::Exp0 => "exp0",
            Opcode::Exp1 => "exp1",
            Opcode::Exp2 => "exp2",
            Opcode::Exp3 => "exp3",
            Opcode::Exp4 => "exp4",
        }
    }

    /// Binary arithmetic/bitwise opcodes with the two-or-three operand form
    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Or
                | Opcode::And
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Shr
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// What an operand slot carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperandKind {
    /// Constant packed into the base word
    SmallImm = 0,
    /// Constant stored in a trailing word
    LargeImm = 1,
    /// Register index 0-7
    Register = 2,
}

/// Where an operand's value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Mode {
    /// The value itself (constant or register contents)
    Direct = 0,
    /// Stack cell at `sp + value`
    Stack = 1,
    /// Heap cell at `value`
    Heap = 2,
}

/// A present operand slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub kind: OperandKind,
    pub mode: Mode,
    /// Register index, or the constant (small immediates sign-extended)
    pub value: u32,
}

impl Operand {
    pub fn small(value: u32) -> Self {
        Self {
            kind: OperandKind::SmallImm,
            mode: Mode::Direct,
            value,
        }
    }

    pub fn large(value: u32) -> Self {
        Self {
            kind: OperandKind::LargeImm,
            mode: Mode::Direct,
            value,
        }
    }

    pub fn register(index: u8) -> Self {
        Self {
            kind: OperandKind::Register,
            mode: Mode::Direct,
            value: index as u32,
        }
    }

    /// Same operand, addressed through the given mode
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// A constant used as a value; can never be written to
    pub fn is_immediate(&self) -> bool {
        self.kind != OperandKind::Register && self.mode == Mode::Direct
    }

    /// Descriptor digit, 1-9
    pub fn digit(&self) -> u16 {
        1 + 3 * self.kind as u16 + self.mode as u16
    }

    fn from_digit(digit: u16) -> Option<Self> {
        if digit == 0 || digit > 9 {
            return None;
        }
        let kind = match (digit - 1) / 3 {
            0 => OperandKind::SmallImm,
            1 => OperandKind::LargeImm,
            _ => OperandKind::Register,
        };
        let mode = match (digit - 1) % 3 {
            0 => Mode::Direct,
            1 => Mode::Stack,
            _ => Mode::Heap,
        };
        Some(Self {
            kind,
            mode,
            value: 0,
        })
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            Mode::Direct => {}
            Mode::Stack => f.write_str("!")?,
            Mode::Heap => f.write_str("@")?,
        }
        match self.kind {
            OperandKind::Register => write!(f, "r{}", self.value),
            OperandKind::SmallImm | OperandKind::LargeImm => write!(f, "{}", self.value),
        }
    }
}

/// Width in bits of each small immediate, given how many registers and small
/// immediates share the payload. `None` when there are no small immediates.
pub fn small_immediate_width(registers: u32, small_immediates: u32) -> Option<u32> {
    if small_immediates == 0 {
        return None;
    }
    Some(PAYLOAD_BITS.saturating_sub(REGISTER_BITS * registers) / small_immediates)
}

/// Sign-extend the low `width` bits of `raw`
fn sign_extend(raw: u32, width: u32) -> u32 {
    if width == 0 || width >= 32 {
        return raw;
    }
    let shift = 32 - width;
    (((raw << shift) as i32) >> shift) as u32
}

fn low_mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

/// Whether `value` survives packing into a `width`-bit small immediate
pub fn fits_small(value: u32, width: u32) -> bool {
    width > 0 && sign_extend(value & low_mask(width), width) == value
}

/// Base word plus trailing words of one instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedInstruction {
    pub word: u32,
    pub trailing: Vec<u32>,
}

impl EncodedInstruction {
    /// Number of object words this instruction occupies
    pub fn word_count(&self) -> usize {
        1 + self.trailing.len()
    }

    /// Append the base word and trailing words to `out`
    pub fn write_to(&self, out: &mut Vec<u32>) {
        out.push(self.word);
        out.extend_from_slice(&self.trailing);
    }
}

/// Decoded instruction representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: [Option<Operand>; OPERAND_SLOTS],
}

impl Instruction {
    /// Create an instruction with every slot absent
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            operands: [None; OPERAND_SLOTS],
        }
    }

    /// Create an instruction with explicit slots
    pub fn with_operands(opcode: Opcode, operands: [Option<Operand>; OPERAND_SLOTS]) -> Self {
        Self { opcode, operands }
    }

    fn count_kind(&self, kind: OperandKind) -> u32 {
        self.operands
            .iter()
            .flatten()
            .filter(|op| op.kind == kind)
            .count() as u32
    }

    /// Payload width shared by this instruction's small immediates
    pub fn small_immediate_width(&self) -> Option<u32> {
        small_immediate_width(
            self.count_kind(OperandKind::Register),
            self.count_kind(OperandKind::SmallImm),
        )
    }

    /// Number of trailing words following the base word
    pub fn trailing_count(&self) -> usize {
        self.count_kind(OperandKind::LargeImm) as usize
    }

    /// Total size in object words
    pub fn size(&self) -> usize {
        1 + self.trailing_count()
    }

    /// Three-digit operand descriptor
    pub fn descriptor(&self) -> u16 {
        self.operands.iter().rev().fold(0, |acc, slot| {
            acc * 10 + slot.as_ref().map_or(0, Operand::digit)
        })
    }

    /// Encode to a base word plus trailing words
    pub fn encode(&self) -> Result<EncodedInstruction, CodecError> {
        let width = self.small_immediate_width();
        let mut word = ((self.opcode as u32) << OPCODE_SHIFT)
            | ((self.descriptor() as u32) << DESCRIPTOR_SHIFT);
        let mut trailing = Vec::with_capacity(self.trailing_count());
        let mut offset = 0;

        for (slot, operand) in self.operands.iter().enumerate() {
            let Some(operand) = operand else { continue };
            match operand.kind {
                OperandKind::Register => {
                    if operand.value as usize >= REGISTER_COUNT {
                        return Err(CodecError::RegisterOutOfRange {
                            slot,
                            value: operand.value,
                        });
                    }
                    word |= operand.value << offset;
                    offset += REGISTER_BITS;
                }
                OperandKind::SmallImm => {
                    let width = width.unwrap_or(0);
                    if !fits_small(operand.value, width) {
                        return Err(CodecError::ImmediateOutOfRange {
                            slot,
                            value: operand.value,
                            width,
                        });
                    }
                    word |= (operand.value & low_mask(width)) << offset;
                    offset += width;
                }
                OperandKind::LargeImm => trailing.push(operand.value),
            }
        }

        Ok(EncodedInstruction { word, trailing })
    }

    /// Decode a base word
    ///
    /// Large immediates come back as 0; the caller owns the stream position and
    /// fills them with [`Instruction::fill_trailing`].
    pub fn decode(word: u32) -> Result<Self, CodecError> {
        let opcode = Opcode::ALL[(word >> OPCODE_SHIFT) as usize];
        let descriptor = ((word >> DESCRIPTOR_SHIFT) & DESCRIPTOR_MASK) as u16;
        if descriptor >= DESCRIPTOR_LIMIT {
            return Err(CodecError::MalformedDescriptor(descriptor));
        }

        let mut operands = [None; OPERAND_SLOTS];
        let mut digits = descriptor;
        for slot in operands.iter_mut() {
            *slot = Operand::from_digit(digits % 10);
            digits /= 10;
        }

        let mut instr = Self { opcode, operands };
        let width = instr.small_immediate_width();
        let mut offset = 0;
        for operand in instr.operands.iter_mut().flatten() {
            match operand.kind {
                OperandKind::Register => {
                    operand.value = (word >> offset) & low_mask(REGISTER_BITS);
                    offset += REGISTER_BITS;
                }
                OperandKind::SmallImm => {
                    let width = width.unwrap_or(0);
                    operand.value = sign_extend((word >> offset) & low_mask(width), width);
                    offset += width;
                }
                OperandKind::LargeImm => {}
            }
        }

        Ok(instr)
    }

    /// Store trailing words into the large-immediate slots, in slot order
    pub fn fill_trailing(&mut self, words: &[u32]) {
        let large = self
            .operands
            .iter_mut()
            .flatten()
            .filter(|op| op.kind == OperandKind::LargeImm);
        for (operand, word) in large.zip(words) {
            operand.value = *word;
        }
    }

    /// Check the operand shape against this opcode's policy
    pub fn validate(&self) -> bool {
        let [a, b, c] = &self.operands;
        let writable = |slot: &Option<Operand>| slot.is_some_and(|op| !op.is_immediate());

        match self.opcode {
            Opcode::Hlt | Opcode::Entry | Opcode::Ret => {
                a.is_none() && b.is_none() && c.is_none()
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Or
            | Opcode::And
            | Opcode::Xor
            | Opcode::Shl
            | Opcode::Shr => {
                // Without a third operand the first doubles as destination
                let dest = if c.is_some() { c } else { a };
                a.is_some() && b.is_some() && writable(dest)
            }
            Opcode::Not => {
                let dest = if b.is_some() { b } else { a };
                a.is_some() && c.is_none() && writable(dest)
            }
            Opcode::Cmp | Opcode::Free => a.is_some() && b.is_some() && c.is_none(),
            Opcode::Jmp
            | Opcode::Je
            | Opcode::Jl
            | Opcode::Jle
            | Opcode::Jne
            | Opcode::Jnl
            | Opcode::Jnle
            | Opcode::Call
            | Opcode::Push => a.is_some() && b.is_none() && c.is_none(),
            Opcode::Pop => writable(a) && b.is_none() && c.is_none(),
            Opcode::Swap => writable(a) && writable(b) && c.is_none(),
            Opcode::Alloc => a.is_some() && writable(b) && c.is_none(),
            Opcode::Exp0 | Opcode::Exp1 | Opcode::Exp2 | Opcode::Exp3 | Opcode::Exp4 => false,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode.mnemonic())?;
        for operand in self.operands.iter().flatten() {
            write!(f, " {}", operand)?;
        }
        Ok(())
    }
}

/// Errors while pulling one instruction out of an object stream
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("word index {0} is past the end of the program")]
    EndOfProgram(usize),
    #[error("instruction at word {0} extends past the end of the program")]
    Truncated(usize),
    #[error("word {pc}: {source}")]
    Codec {
        pc: usize,
        #[source]
        source: CodecError,
    },
}

/// Errors while loading an object file
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("program is empty")]
    Empty,
    #[error("program size {0} is not a multiple of 4")]
    Misaligned(usize),
}

/// Object stream: encoded words with trailing immediates, no header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    pub words: Vec<u32>,
}

impl Program {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    pub fn from_words(words: Vec<u32>) -> Self {
        Self { words }
    }

    /// Encode a sequence of instructions back to back
    pub fn from_instructions(instructions: &[Instruction]) -> Result<Self, CodecError> {
        let mut words = Vec::new();
        for instr in instructions {
            instr.encode()?.write_to(&mut words);
        }
        Ok(Self { words })
    }

    /// Parse an object file (little-endian words)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProgramError> {
        if bytes.is_empty() {
            return Err(ProgramError::Empty);
        }
        if bytes.len() % WORD_BYTES != 0 {
            return Err(ProgramError::Misaligned(bytes.len()));
        }
        let words = bytes
            .chunks_exact(WORD_BYTES)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { words })
    }

    /// Serialize to an object file
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Get total code size in bytes
    pub fn code_size(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Decode the instruction at word index `pc`
    ///
    /// Returns the instruction with its large immediates filled in and the
    /// index of the word following it.
    pub fn fetch(&self, pc: usize) -> Result<(Instruction, usize), FetchError> {
        let word = *self.words.get(pc).ok_or(FetchError::EndOfProgram(pc))?;
        let mut instr =
            Instruction::decode(word).map_err(|source| FetchError::Codec { pc, source })?;
        let next = pc + 1 + instr.trailing_count();
        let trailing = self
            .words
            .get(pc + 1..next)
            .ok_or(FetchError::Truncated(pc))?;
        instr.fill_trailing(trailing);
        Ok((instr, next))
    }

    /// Iterate over `(word index, instruction)` pairs until the end or the
    /// first undecodable word
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            program: self,
            pc: 0,
            failed: false,
        }
    }
}

/// Iterator returned by [`Program::instructions`]
pub struct Instructions<'a> {
    program: &'a Program,
    pc: usize,
    failed: bool,
}

impl Iterator for Instructions<'_> {
    type Item = Result<(usize, Instruction), FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pc >= self.program.len() {
            return None;
        }
        let pc = self.pc;
        match self.program.fetch(pc) {
            Ok((instr, next)) => {
                self.pc = next;
                Some(Ok((pc, instr)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
