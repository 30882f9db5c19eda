//! Benchmarks for the rvm codec, assembler and interpreter

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rvm::interp::Interpreter;
use rvm::ir::{Assembler, Instruction, Mode, Opcode, Operand, Program};

/// A mix of register, small and large operand shapes
fn sample_instructions() -> Vec<Instruction> {
    vec![
        Instruction::with_operands(
            Opcode::Add,
            [Some(Operand::register(0)), Some(Operand::small(5)), None],
        ),
        Instruction::with_operands(
            Opcode::Sub,
            [
                Some(Operand::small(3)),
                Some(Operand::register(1).with_mode(Mode::Heap)),
                Some(Operand::small(2).with_mode(Mode::Stack)),
            ],
        ),
        Instruction::with_operands(
            Opcode::Jmp,
            [Some(Operand::large(0xFFFF_FF00)), None, None],
        ),
        Instruction::new(Opcode::Hlt),
    ]
}

fn bench_encode_decode(c: &mut Criterion) {
    let instrs = sample_instructions();
    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(instrs.len() as u64));

    group.bench_function("encode", |b| {
        b.iter(|| {
            for instr in &instrs {
                black_box(instr.encode().ok());
            }
        })
    });

    let program = Program::from_instructions(&instrs).unwrap();
    group.bench_function("fetch", |b| {
        b.iter(|| {
            let mut pc = 0;
            while let Ok((instr, next)) = program.fetch(pc) {
                black_box(instr);
                pc = next;
            }
        })
    });

    group.finish();
}

fn counting_loop(n: u32) -> String {
    format!(
        "add r1 {}\n:loop\nadd r0 r1\nsub r1 1\ncmp r1 0\njne :loop\nhlt\n",
        n
    )
}

fn bench_assembler(c: &mut Criterion) {
    // Repeating the block redefines :loop, which is allowed
    let source = counting_loop(100).repeat(20);
    c.bench_function("assemble_120_lines", |b| {
        b.iter(|| {
            let mut asm = Assembler::new();
            black_box(asm.assemble(black_box(&source)).ok())
        })
    });
}

fn bench_interpreter(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter");

    for &n in &[10u32, 1000, 100_000] {
        let program = Assembler::new().assemble(&counting_loop(n)).unwrap();
        // Five instructions per iteration
        group.throughput(Throughput::Elements(n as u64 * 5));
        group.bench_function(format!("loop_{}", n), |b| {
            let mut interp = Interpreter::new();
            b.iter(|| {
                interp.execute(&program).unwrap();
                black_box(interp.registers[0])
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_encode_decode,
    bench_assembler,
    bench_interpreter,
);
criterion_main!(benches);
