//! `loxt` - the command-line driver for the loxc script engine.
//!
//! Runs a script file or drops into a REPL, per spec.md §6. Exit codes
//! follow the `sysexits.h` convention clox itself uses: 0 success, 65 a
//! compile error, 70 a runtime error, 64 a usage error.

mod error;

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use loxc_gc::GcConfig;
use loxc_runtime::{InterpretResult, Vm, VmConfig};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use error::{LoxtError, Result};

const EX_OK: u8 = 0;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_USAGE: u8 = 64;

/// loxt - run Lox scripts or start an interactive REPL.
#[derive(Parser, Debug)]
#[command(name = "loxt")]
#[command(author = "loxc contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run Lox scripts or start an interactive REPL", long_about = None)]
struct Cli {
    /// Script to run. Omit to start a REPL.
    script: Option<PathBuf>,

    /// Print each instruction as it executes (spec.md §6.4).
    #[arg(long)]
    trace: bool,

    /// Disassemble compiled chunks before running them.
    #[arg(long)]
    print_code: bool,

    /// Run the garbage collector before every allocation.
    #[arg(long)]
    gc_stress: bool,

    /// Log each collection's before/after heap size.
    #[arg(long)]
    gc_log: bool,

    /// Log filter, e.g. "loxc_runtime=trace". Overrides `LOX_LOG`.
    #[arg(long, env = "LOX_LOG")]
    log: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = init_logging(cli.log.as_deref()) {
        eprintln!("loxt: {err}");
        return ExitCode::from(EX_USAGE);
    }

    let config = VmConfig {
        gc: GcConfig {
            stress: cli.gc_stress,
            log: cli.gc_log,
        },
        trace: cli.trace,
        print_code: cli.print_code,
    };

    let result = match &cli.script {
        Some(path) => run_file(path, config),
        None => run_repl(config),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("loxt: {err}");
            ExitCode::from(EX_USAGE)
        }
    }
}

fn init_logging(filter: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_new(filter.unwrap_or("warn"))
        .map_err(|e| LoxtError::Logging(e.to_string()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).without_time())
        .try_init()
        .map_err(|e| LoxtError::Logging(e.to_string()))?;

    Ok(())
}

/// Reads and runs a script file, mapping the VM's outcome to an exit code
/// per spec.md §6.3.
fn run_file(path: &PathBuf, config: VmConfig) -> Result<u8> {
    let source = std::fs::read_to_string(path).map_err(|source| LoxtError::ReadScript {
        path: path.display().to_string(),
        source,
    })?;

    let mut vm = Vm::new(config);
    Ok(report(vm.interpret(&source)))
}

/// A bare read-eval-print loop: each line is compiled and run as its own
/// script against a persistent [`Vm`], so globals and class declarations
/// accumulate across lines the way a script's top level would.
fn run_repl(config: VmConfig) -> Result<u8> {
    let mut editor = DefaultEditor::new().map_err(|e| LoxtError::Repl(e.to_string()))?;
    let mut vm = Vm::new(config);

    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                report(vm.interpret(&line));
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(LoxtError::Repl(e.to_string())),
        }
    }

    Ok(EX_OK)
}

/// Prints a script's diagnostics to stderr and returns the exit code that
/// corresponds to its outcome.
fn report(result: InterpretResult) -> u8 {
    match result {
        InterpretResult::Ok => EX_OK,
        InterpretResult::CompileError(errors) => {
            eprintln!("{errors}");
            EX_DATAERR
        }
        InterpretResult::RuntimeError(err) => {
            eprintln!("{err}");
            let _ = std::io::stderr().flush();
            EX_SOFTWARE
        }
    }
}
