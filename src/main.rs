//! Command-line entry point: reads a script, compiles it, and runs it.

use std::process::ExitCode;

use clap::Parser as ClapParser;
use rlox::gc::ActiveGC;
use rlox::vm::VM;

/// A bytecode interpreter for a small scripting language.
#[derive(ClapParser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the script to run.
    path: std::path::PathBuf,
}

fn main() -> ExitCode {
    simple_logger::SimpleLogger::new()
        .env()
        .init()
        .expect("logger can only be initialized once");

    let cli = Cli::parse();

    match run(&cli.path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.render(&cli.path.display().to_string()));
            ExitCode::FAILURE
        }
    }
}

fn run(path: &std::path::Path) -> rlox::Result<()> {
    log::debug!("reading {}", path.display());
    let source = std::fs::read_to_string(path)?;

    let gc = ActiveGC::install();
    let mut vm = VM::default();
    vm.interpret(&source, &gc)
}
