//! Tests for all 32 rvm opcodes
//!
//! Encoding, decoding and validation for each opcode, driven through the
//! public codec API.

use rvm::ir::{
    small_immediate_width, CodecError, Instruction, Mode, Opcode, Operand, OperandKind, Program,
    ProgramError,
};

fn reg(i: u8) -> Option<Operand> {
    Some(Operand::register(i))
}

fn imm(v: u32) -> Option<Operand> {
    Some(Operand::small(v))
}

/// Encode, decode and fill trailing words
fn roundtrip(instr: &Instruction) -> Instruction {
    let encoded = instr.encode().expect("encode failed");
    let mut decoded = Instruction::decode(encoded.word).expect("decode failed");
    decoded.fill_trailing(&encoded.trailing);
    decoded
}

// ============================================================================
// Opcode table
// ============================================================================

#[test]
fn test_opcode_numbers() {
    let expected = [
        "hlt", "add", "sub", "mul", "div", "or", "and", "not", "xor", "shl", "shr", "cmp", "entry",
        "jmp", "je", "jl", "jle", "jne", "jnl", "jnle", "call", "ret", "push", "pop", "swap",
        "alloc", "free", "exp0", "exp1", "exp2", "exp3", "exp4",
    ];
    for (i, name) in expected.iter().enumerate() {
        let op = Opcode::from_u8(i as u8).unwrap();
        assert_eq!(op.mnemonic(), *name);
        assert_eq!(op as u8, i as u8);
    }
}

#[test]
fn test_opcode_field_in_word() {
    for op in Opcode::ALL {
        let word = Instruction::new(op).encode().unwrap().word;
        assert_eq!(word >> 27, op as u32);
        assert_eq!(Instruction::decode(word).unwrap().opcode, op);
    }
}

// ============================================================================
// Arithmetic/Logic (opcodes 1-11)
// ============================================================================

#[test]
fn test_arithmetic_forms() {
    for op in [
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Or,
        Opcode::And,
        Opcode::Xor,
        Opcode::Shl,
        Opcode::Shr,
    ] {
        assert!(op.is_arithmetic());
        let two = Instruction::with_operands(op, [reg(0), reg(1), None]);
        let three = Instruction::with_operands(op, [imm(5), reg(1), reg(2)]);
        assert!(two.validate(), "{}", op);
        assert!(three.validate(), "{}", op);
        assert_eq!(roundtrip(&two), two);
        assert_eq!(roundtrip(&three), three);

        // Destination must be writable
        assert!(!Instruction::with_operands(op, [imm(5), reg(1), None]).validate());
        assert!(!Instruction::with_operands(op, [reg(0), reg(1), imm(2)]).validate());
    }
}

#[test]
fn test_not_forms() {
    let heap = Some(Operand::register(3).with_mode(Mode::Heap));
    assert!(Instruction::with_operands(Opcode::Not, [heap, None, None]).validate());
    assert!(Instruction::with_operands(Opcode::Not, [imm(1), heap, None]).validate());
    assert!(!Instruction::with_operands(Opcode::Not, [reg(0), imm(1), None]).validate());
    assert!(!Instruction::with_operands(Opcode::Not, [reg(0), reg(1), reg(2)]).validate());
}

#[test]
fn test_cmp_accepts_immediates() {
    let instr =
        Instruction::with_operands(Opcode::Cmp, [imm(1), Some(Operand::large(1 << 30)), None]);
    assert!(instr.validate());
    assert_eq!(instr.encode().unwrap().trailing, vec![1 << 30]);
    assert!(!Instruction::with_operands(Opcode::Cmp, [imm(1), None, None]).validate());
}

// ============================================================================
// Control flow (opcodes 12-21)
// ============================================================================

#[test]
fn test_entry_hlt_ret_take_no_operands() {
    for op in [Opcode::Entry, Opcode::Hlt, Opcode::Ret] {
        assert!(Instruction::new(op).validate());
        assert!(!Instruction::with_operands(op, [None, None, reg(0)]).validate());
    }
}

#[test]
fn test_jumps_take_one_operand() {
    for op in [
        Opcode::Jmp,
        Opcode::Je,
        Opcode::Jl,
        Opcode::Jle,
        Opcode::Jne,
        Opcode::Jnl,
        Opcode::Jnle,
        Opcode::Call,
    ] {
        let target = Some(Operand::large(0xFFFF_FFF0));
        let instr = Instruction::with_operands(op, [target, None, None]);
        assert!(instr.validate());
        assert_eq!(roundtrip(&instr), instr);
        assert!(!Instruction::new(op).validate());
        assert!(!Instruction::with_operands(op, [None, reg(0), None]).validate());
    }
}

// ============================================================================
// Stack and heap (opcodes 22-26)
// ============================================================================

#[test]
fn test_stack_opcodes() {
    assert!(Instruction::with_operands(Opcode::Push, [imm(1), None, None]).validate());
    assert!(Instruction::with_operands(Opcode::Pop, [reg(1), None, None]).validate());
    assert!(!Instruction::with_operands(Opcode::Pop, [imm(1), None, None]).validate());

    let cell = Some(Operand::small(4).with_mode(Mode::Stack));
    let swap = Instruction::with_operands(Opcode::Swap, [cell, reg(2), None]);
    assert!(swap.validate());
    assert_eq!(roundtrip(&swap), swap);
}

#[test]
fn test_heap_opcodes() {
    assert!(Instruction::with_operands(Opcode::Alloc, [imm(16), reg(0), None]).validate());
    assert!(!Instruction::with_operands(Opcode::Alloc, [imm(16), None, None]).validate());
    assert!(Instruction::with_operands(Opcode::Free, [reg(0), imm(16), None]).validate());
    assert!(!Instruction::with_operands(Opcode::Free, [reg(0), None, None]).validate());
}

// ============================================================================
// Expansion (opcodes 27-31)
// ============================================================================

#[test]
fn test_expansion_opcodes_never_validate() {
    for op in [Opcode::Exp0, Opcode::Exp1, Opcode::Exp2, Opcode::Exp3, Opcode::Exp4] {
        assert!(!Instruction::new(op).validate());
        assert!(!Instruction::with_operands(op, [reg(0), reg(1), reg(2)]).validate());
        // Still encodable, so objects can carry them
        let instr = Instruction::with_operands(op, [reg(0), None, None]);
        assert_eq!(roundtrip(&instr), instr);
    }
}

// ============================================================================
// Payload packing
// ============================================================================

#[test]
fn test_width_table() {
    assert_eq!(small_immediate_width(0, 1), Some(17));
    assert_eq!(small_immediate_width(2, 1), Some(11));
    assert_eq!(small_immediate_width(0, 3), Some(5));
    assert_eq!(small_immediate_width(3, 0), None);
}

#[test]
fn test_width_edges() {
    // Three smalls: 5 bits each, -16..=15
    let cell = Some(Operand::small(1).with_mode(Mode::Stack));
    let fits = Instruction::with_operands(Opcode::Add, [imm(15), imm((-16i32) as u32), cell]);
    assert_eq!(roundtrip(&fits), fits);

    let too_big = Instruction::with_operands(Opcode::Add, [imm(16), imm(0), cell]);
    assert!(matches!(
        too_big.encode(),
        Err(CodecError::ImmediateOutOfRange { slot: 0, width: 5, .. })
    ));

    // One small alone: 17 bits
    let wide = Instruction::with_operands(Opcode::Push, [imm(65535), None, None]);
    assert_eq!(roundtrip(&wide), wide);
    let wider = Instruction::with_operands(Opcode::Push, [imm(65536), None, None]);
    assert!(wider.encode().is_err());
}

#[test]
fn test_large_immediates_in_slot_order() {
    let instr = Instruction::with_operands(
        Opcode::Add,
        [
            Some(Operand::large(111)),
            reg(1),
            Some(Operand::large(333).with_mode(Mode::Heap)),
        ],
    );
    let encoded = instr.encode().unwrap();
    assert_eq!(encoded.trailing, vec![111, 333]);
    assert_eq!(instr.size(), 3);

    let decoded = Instruction::decode(encoded.word).unwrap();
    let kinds: Vec<_> = decoded.operands.iter().flatten().map(|o| o.kind).collect();
    assert_eq!(
        kinds,
        vec![OperandKind::LargeImm, OperandKind::Register, OperandKind::LargeImm]
    );
    // Placeholders until the trailing words are supplied
    assert_eq!(decoded.operands[0].unwrap().value, 0);
}

// ============================================================================
// Object stream
// ============================================================================

#[test]
fn test_object_stream() {
    let program = Program::from_instructions(&[
        Instruction::with_operands(Opcode::Push, [Some(Operand::large(7)), None, None]),
        Instruction::new(Opcode::Hlt),
    ])
    .unwrap();
    let bytes = program.to_bytes();
    assert_eq!(bytes.len(), 12);
    assert_eq!(&bytes[4..8], &[7, 0, 0, 0]);
    assert_eq!(Program::from_bytes(&bytes).unwrap(), program);
    assert_eq!(Program::from_bytes(&bytes[..5]), Err(ProgramError::Misaligned(5)));
}
