//! rvm - register virtual machine
//!
//! Main CLI entry point: loads an object file and runs it to `hlt`.

use anyhow::{Context, Result};
use clap::Parser;
use rvm::config::RvmConfig;
use rvm::interp::Interpreter;
use rvm::ir::Program;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "rvm")]
#[command(version)]
#[command(about = "Run an rvm object file", long_about = None)]
struct Cli {
    /// Object file produced by rvm-asm
    input: PathBuf,

    /// Config file (default: nearest rvm.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input is hex text rather than raw bytes
    #[arg(long)]
    hex: bool,

    /// Print statistics after the run
    #[arg(short, long)]
    stats: bool,

    /// Print the final machine state as JSON
    #[arg(long)]
    dump_state: bool,

    /// Stop after this many instructions
    #[arg(long)]
    max_instructions: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => RvmConfig::load(path)?,
        None => RvmConfig::load_from_cwd()?,
    };

    let directive = config.logging.filter.parse()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .init();

    let program = load_program(&cli.input, cli.hex)?;
    info!(words = program.len(), "program loaded");

    let mut interpreter_config = config.interpreter.clone();
    if cli.max_instructions.is_some() {
        interpreter_config.max_instructions = cli.max_instructions;
    }
    let mut interp = Interpreter::with_config(&interpreter_config);

    let start = Instant::now();
    let result = interp.execute(&program);
    let elapsed = start.elapsed();

    if cli.stats {
        eprintln!("Statistics:");
        eprintln!("  Instructions: {}", interp.instruction_count());
        eprintln!("  Stack depth:  {}", interp.sp());
        eprintln!("  Heap mark:    {}", interp.heap_mark());
        eprintln!("  Time: {:?}", elapsed);
        eprintln!(
            "  IPS: {:.2}M",
            interp.instruction_count() as f64
                / elapsed.as_secs_f64().max(f64::EPSILON)
                / 1_000_000.0
        );
    }

    if cli.dump_state {
        let json = serde_json::to_string_pretty(&interp.state())?;
        println!("{}", json);
    }

    result.context("Execution failed")?;
    Ok(())
}

fn load_program(path: &Path, hex_input: bool) -> Result<Program> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let bytes = if hex_input {
        let text = String::from_utf8(bytes).context("Hex input is not UTF-8")?;
        hex::decode(text.trim()).context("Invalid hex input")?
    } else {
        bytes
    };
    Program::from_bytes(&bytes).with_context(|| format!("Invalid object file {}", path.display()))
}
