//! Standalone assembler for rvm
//!
//! `rvm-asm <input> <output>` turns one text source into one object file.

use anyhow::{Context, Result};
use clap::Parser;
use rvm::config::RvmConfig;
use rvm::ir::{Disassembler, Program};
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

#[derive(Parser)]
#[command(name = "rvm-asm", version, about = "rvm Assembler")]
struct Args {
    /// Assembly source file
    input: PathBuf,

    /// Object file to write
    output: PathBuf,

    /// Print the disassembly of the result to stderr
    #[arg(short, long)]
    disasm: bool,

    /// Write the object as hex text
    #[arg(long)]
    hex: bool,
}

fn init_logging() -> Result<()> {
    let config = RvmConfig::load_from_cwd()?;
    let directive = config.logging.filter.parse()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .with_writer(io::stderr)
        .init();
    Ok(())
}

fn write_object(program: &Program, path: &Path, as_hex: bool) -> Result<usize> {
    let bytes = program.to_bytes();
    let written = if as_hex {
        let text = hex::encode(&bytes);
        std::fs::write(path, &text).map(|_| text.len())
    } else {
        std::fs::write(path, &bytes).map(|_| bytes.len())
    };
    written.with_context(|| format!("Failed to write {}", path.display()))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging()?;

    let source = std::fs::read_to_string(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let program = rvm::ir::Assembler::new()
        .assemble(&source)
        .with_context(|| format!("{}", args.input.display()))?;
    info!(words = program.len(), "assembled");

    if args.disasm {
        eprintln!("Disassembly:");
        let listing = Disassembler::new().with_offsets(true).with_bytes(true);
        eprintln!("{}", listing.disassemble(&program));
    }

    let size = write_object(&program, &args.output, args.hex)?;
    eprintln!(
        "{}: {} words, wrote {} bytes to {}",
        args.input.display(),
        program.len(),
        size,
        args.output.display()
    );
    Ok(())
}
