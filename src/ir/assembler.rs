//! Assembler and Disassembler for rvm
//!
//! Converts between text assembly and the object word stream.
//!
//! # Syntax
//!
//! One statement per line, tokens separated by whitespace:
//! ```text
//! # comment
//! ;loop              forward declaration
//! :start             label definition, emits `entry`
//! add r0 1           two-operand form, result in r0
//! add !0 @r1 r2      stack cell, heap cell, register destination
//! jne :start         relative reference, patched after the last line
//! hlt
//! ```
//!
//! Mnemonics may be abbreviated: the first opcode in table order whose
//! mnemonic starts with the token wins.

use crate::ir::format::{
    fits_small, CodecError, Instruction, Mode, Opcode, Operand, OperandKind, Program, OPERAND_SLOTS,
    REGISTER_COUNT, WORD_BYTES,
};
use std::collections::HashMap;
use std::fmt::Write as _;
use thiserror::Error;
use tracing::{debug, warn};

/// Largest constant accepted in a `!N` stack offset
pub const MAX_STACK_OFFSET: u32 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("line {line}: unknown mnemonic '{token}'")]
    UnknownMnemonic { line: usize, token: String },
    #[error("line {line}: invalid register '{token}'")]
    InvalidRegister { line: usize, token: String },
    #[error("line {line}: invalid stack offset '{token}'")]
    InvalidStackOffset { line: usize, token: String },
    #[error("line {line}: stack offset {value} exceeds 255")]
    StackOffsetOutOfRange { line: usize, value: u32 },
    #[error("line {line}: invalid heap offset '{token}'")]
    InvalidHeapOffset { line: usize, token: String },
    #[error("line {line}: invalid constant '{token}'")]
    InvalidConstant { line: usize, token: String },
    #[error("line {line}: missing label name")]
    MissingLabelName { line: usize },
    #[error("line {line}: too many operands")]
    TooManyOperands { line: usize },
    #[error("line {line}: unexpected token '{token}'")]
    UnexpectedToken { line: usize, token: String },
    #[error("line {line}: unknown symbol '{name}'")]
    UnknownSymbol { line: usize, name: String },
    #[error("line {line}: symbol '{name}' was declared but never defined")]
    UnresolvedSymbol { line: usize, name: String },
    #[error("line {line}: relocation at byte {offset} is outside the program")]
    RelocationOutOfRange { line: usize, offset: usize },
    #[error("line {line}: invalid operands for '{instruction}'")]
    InvalidInstruction { line: usize, instruction: String },
    #[error("line {line}: {source}")]
    Encoding {
        line: usize,
        #[source]
        source: CodecError,
    },
}

impl AsmError {
    /// 1-based source line the error was raised on
    pub fn line(&self) -> usize {
        match self {
            AsmError::UnknownMnemonic { line, .. }
            | AsmError::InvalidRegister { line, .. }
            | AsmError::InvalidStackOffset { line, .. }
            | AsmError::StackOffsetOutOfRange { line, .. }
            | AsmError::InvalidHeapOffset { line, .. }
            | AsmError::InvalidConstant { line, .. }
            | AsmError::MissingLabelName { line }
            | AsmError::TooManyOperands { line }
            | AsmError::UnexpectedToken { line, .. }
            | AsmError::UnknownSymbol { line, .. }
            | AsmError::UnresolvedSymbol { line, .. }
            | AsmError::RelocationOutOfRange { line, .. }
            | AsmError::InvalidInstruction { line, .. }
            | AsmError::Encoding { line, .. } => *line,
        }
    }
}

/// A trailing word that must be overwritten once its symbol is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset of the placeholder word
    pub offset: usize,
    pub symbol: String,
    /// Added to the symbol's word address when patching
    pub adjust: i32,
    /// Source line of the referencing instruction
    pub line: usize,
}

/// State of one assembly run
#[derive(Debug, Default)]
struct CompilationContext {
    /// `None` marks a forward declaration
    symbols: HashMap<String, Option<u32>>,
    relocations: Vec<Relocation>,
    words: Vec<u32>,
}

impl CompilationContext {
    /// Current byte address
    fn address(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    fn word_address(&self) -> u32 {
        self.words.len() as u32
    }
}

/// Operand as written, before kind classification
#[derive(Debug, Clone, PartialEq, Eq)]
enum OperandToken {
    Register { index: u8, mode: Mode },
    Constant { value: u32, mode: Mode },
    Symbol(String),
}

/// Assembler for rvm
pub struct Assembler {
    context: CompilationContext,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            context: CompilationContext::default(),
        }
    }

    /// Assemble text to a Program
    ///
    /// Each call starts from an empty symbol table.
    pub fn assemble(&mut self, source: &str) -> Result<Program, AsmError> {
        self.context = CompilationContext::default();

        for (idx, text) in source.lines().enumerate() {
            self.assemble_line(text, idx + 1)?;
        }

        self.patch()?;

        debug!(
            words = self.context.words.len(),
            symbols = self.context.symbols.len(),
            relocations = self.context.relocations.len(),
            "assembly complete"
        );
        Ok(Program::from_words(self.context.words.clone()))
    }

    /// Word address of a defined symbol from the last assembly run
    pub fn symbol(&self, name: &str) -> Option<u32> {
        self.context.symbols.get(name).copied().flatten()
    }

    /// Relocations recorded by the last assembly run
    pub fn relocations(&self) -> &[Relocation] {
        &self.context.relocations
    }

    fn assemble_line(&mut self, text: &str, line: usize) -> Result<(), AsmError> {
        let mut tokens = text.split_ascii_whitespace();
        let Some(first) = tokens.next() else {
            return Ok(());
        };
        if first.starts_with('#') {
            return Ok(());
        }

        if let Some(name) = first.strip_prefix(':') {
            Self::reject_trailing(tokens, line)?;
            self.define_label(name, line)
        } else if let Some(name) = first.strip_prefix(';') {
            Self::reject_trailing(tokens, line)?;
            self.declare_label(name, line)
        } else {
            let opcode = Opcode::from_prefix(first).ok_or_else(|| AsmError::UnknownMnemonic {
                line,
                token: first.to_string(),
            })?;
            let mut operands = Vec::with_capacity(OPERAND_SLOTS);
            for token in tokens.take_while(|t| !t.starts_with('#')) {
                if operands.len() == OPERAND_SLOTS {
                    return Err(AsmError::TooManyOperands { line });
                }
                operands.push(self.parse_operand(token, line)?);
            }
            self.emit(opcode, operands, line)
        }
    }

    fn reject_trailing<'a>(
        mut tokens: impl Iterator<Item = &'a str>,
        line: usize,
    ) -> Result<(), AsmError> {
        match tokens.next() {
            Some(t) if !t.starts_with('#') => Err(AsmError::UnexpectedToken {
                line,
                token: t.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn define_label(&mut self, name: &str, line: usize) -> Result<(), AsmError> {
        if name.is_empty() {
            return Err(AsmError::MissingLabelName { line });
        }
        let address = self.context.word_address();
        if let Some(Some(previous)) = self.context.symbols.insert(name.to_string(), Some(address))
        {
            warn!(line, label = name, previous, address, "label redefined");
        }
        debug!(line, label = name, address, "label defined");
        self.emit(Opcode::Entry, Vec::new(), line)
    }

    fn declare_label(&mut self, name: &str, line: usize) -> Result<(), AsmError> {
        if name.is_empty() {
            return Err(AsmError::MissingLabelName { line });
        }
        self.context.symbols.entry(name.to_string()).or_insert(None);
        Ok(())
    }

    fn parse_operand(&self, token: &str, line: usize) -> Result<OperandToken, AsmError> {
        if let Some(name) = token.strip_prefix(':') {
            if name.is_empty() {
                return Err(AsmError::MissingLabelName { line });
            }
            if !self.context.symbols.contains_key(name) {
                return Err(AsmError::UnknownSymbol {
                    line,
                    name: name.to_string(),
                });
            }
            return Ok(OperandToken::Symbol(name.to_string()));
        }

        if let Some(rest) = token.strip_prefix('!') {
            if rest.starts_with('r') {
                let index = parse_register(rest).ok_or_else(|| AsmError::InvalidRegister {
                    line,
                    token: token.to_string(),
                })?;
                return Ok(OperandToken::Register {
                    index,
                    mode: Mode::Stack,
                });
            }
            let value = parse_constant(rest).ok_or_else(|| AsmError::InvalidStackOffset {
                line,
                token: token.to_string(),
            })?;
            if value > MAX_STACK_OFFSET {
                return Err(AsmError::StackOffsetOutOfRange { line, value });
            }
            return Ok(OperandToken::Constant {
                value,
                mode: Mode::Stack,
            });
        }

        if let Some(rest) = token.strip_prefix('@') {
            if rest.starts_with('r') {
                let index = parse_register(rest).ok_or_else(|| AsmError::InvalidRegister {
                    line,
                    token: token.to_string(),
                })?;
                return Ok(OperandToken::Register {
                    index,
                    mode: Mode::Heap,
                });
            }
            let value = parse_constant(rest).ok_or_else(|| AsmError::InvalidHeapOffset {
                line,
                token: token.to_string(),
            })?;
            return Ok(OperandToken::Constant {
                value,
                mode: Mode::Heap,
            });
        }

        if token.starts_with('r') {
            let index = parse_register(token).ok_or_else(|| AsmError::InvalidRegister {
                line,
                token: token.to_string(),
            })?;
            return Ok(OperandToken::Register {
                index,
                mode: Mode::Direct,
            });
        }

        let value = parse_constant(token).ok_or_else(|| AsmError::InvalidConstant {
            line,
            token: token.to_string(),
        })?;
        Ok(OperandToken::Constant {
            value,
            mode: Mode::Direct,
        })
    }

    /// Classify operands, encode, and append to the output
    fn emit(&mut self, opcode: Opcode, tokens: Vec<OperandToken>, line: usize) -> Result<(), AsmError> {
        let mut operands = [None; OPERAND_SLOTS];
        let mut symbols: [Option<String>; OPERAND_SLOTS] = Default::default();

        for (slot, token) in tokens.into_iter().enumerate() {
            operands[slot] = Some(match token {
                OperandToken::Register { index, mode } => Operand::register(index).with_mode(mode),
                OperandToken::Constant { value, mode } => {
                    if value as i32 as i8 as i32 == value as i32 {
                        Operand::small(value).with_mode(mode)
                    } else {
                        Operand::large(value).with_mode(mode)
                    }
                }
                OperandToken::Symbol(name) => {
                    symbols[slot] = Some(name);
                    Operand::large(0)
                }
            });
        }

        let mut instr = Instruction::with_operands(opcode, operands);
        demote_small_immediates(&mut instr);

        if !instr.validate() {
            return Err(AsmError::InvalidInstruction {
                line,
                instruction: instr.to_string(),
            });
        }

        let encoded = instr
            .encode()
            .map_err(|source| AsmError::Encoding { line, source })?;

        // Trailing words follow the base word in slot order
        let address = self.context.address();
        let mut trailing_index = 0;
        for (slot, operand) in instr.operands.iter().enumerate() {
            let Some(operand) = operand else { continue };
            if operand.kind != OperandKind::LargeImm {
                continue;
            }
            trailing_index += 1;
            if let Some(symbol) = symbols[slot].take() {
                let relocation = Relocation {
                    offset: address + trailing_index * WORD_BYTES,
                    symbol,
                    adjust: -((address / WORD_BYTES) as i32),
                    line,
                };
                debug!(
                    line,
                    symbol = %relocation.symbol,
                    offset = relocation.offset,
                    adjust = relocation.adjust,
                    "relocation recorded"
                );
                self.context.relocations.push(relocation);
            }
        }

        encoded.write_to(&mut self.context.words);
        Ok(())
    }

    /// Overwrite every relocation placeholder with the resolved value
    fn patch(&mut self) -> Result<(), AsmError> {
        for relocation in &self.context.relocations {
            let address = self
                .context
                .symbols
                .get(&relocation.symbol)
                .copied()
                .flatten()
                .ok_or_else(|| AsmError::UnresolvedSymbol {
                    line: relocation.line,
                    name: relocation.symbol.clone(),
                })?;
            let index = relocation.offset / WORD_BYTES;
            let word = self.context.words.get_mut(index).ok_or_else(|| {
                AsmError::RelocationOutOfRange {
                    line: relocation.line,
                    offset: relocation.offset,
                }
            })?;
            *word = address.wrapping_add(relocation.adjust as u32);
        }
        Ok(())
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Demote small immediates that do not fit the derived payload width
///
/// Each demotion widens the remaining smalls, so this settles quickly.
fn demote_small_immediates(instr: &mut Instruction) {
    while let Some(width) = instr.small_immediate_width() {
        let mut demoted = false;
        for operand in instr.operands.iter_mut().flatten() {
            if operand.kind == OperandKind::SmallImm
                && !fits_small(operand.value, width)
            {
                operand.kind = OperandKind::LargeImm;
                demoted = true;
            }
        }
        if !demoted {
            break;
        }
    }
}

/// Parse `rD` with D in 0-7
fn parse_register(s: &str) -> Option<u8> {
    let digits = s.strip_prefix('r')?;
    if digits.len() != 1 {
        return None;
    }
    let index = digits.parse::<u8>().ok()?;
    ((index as usize) < REGISTER_COUNT).then_some(index)
}

/// Parse an unsigned 32-bit constant, decimal or `0x` hexadecimal
fn parse_constant(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else if s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

/// Disassembler for rvm
pub struct Disassembler {
    show_bytes: bool,
    show_offsets: bool,
}

impl Disassembler {
    pub fn new() -> Self {
        Self {
            show_bytes: false,
            show_offsets: false,
        }
    }

    /// Show raw words next to each instruction
    pub fn with_bytes(mut self, show: bool) -> Self {
        self.show_bytes = show;
        self
    }

    /// Prefix each instruction with its word address
    pub fn with_offsets(mut self, show: bool) -> Self {
        self.show_offsets = show;
        self
    }

    /// Disassemble a Program
    ///
    /// `entry` prints as `:Lxxxx` so the output reassembles. Stops with a
    /// comment at the first word that does not decode.
    pub fn disassemble(&self, program: &Program) -> String {
        let mut output = String::new();

        for item in program.instructions() {
            let (pc, instr) = match item {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = writeln!(output, "# {}", e);
                    break;
                }
            };

            if self.show_offsets {
                let _ = write!(output, "{:04x}:  ", pc);
            }

            if self.show_bytes {
                let words = &program.words[pc..pc + instr.size()];
                for w in words {
                    let _ = write!(output, "{:08x} ", w);
                }
                for _ in words.len()..(1 + OPERAND_SLOTS) {
                    output.push_str("         ");
                }
            }

            if instr.opcode == Opcode::Entry {
                let _ = writeln!(output, ":L{:04x}", pc);
            } else {
                let _ = writeln!(output, "{}", instr);
            }
        }

        output
    }

    /// Disassemble raw object bytes
    pub fn disassemble_bytes(&self, bytes: &[u8]) -> String {
        match Program::from_bytes(bytes) {
            Ok(program) => self.disassemble(&program),
            Err(e) => format!("# {}\n", e),
        }
    }
}

impl Default for Disassembler {
    fn default() -> Self {
        Self::new()
    }
}
