//! The `quince` executable: run a script, or start the REPL.
//!
//! Exit codes: 0 success, 64 usage error, 65 lex/parse/compile error,
//! 70 runtime error, 74 script I/O error.

use std::path::Path;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use quince_vm::Vm;

mod repl;

const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

/// The Quince scripting language
#[derive(Parser)]
#[command(name = "quince")]
#[command(about = "The Quince scripting language", long_about = None)]
#[command(disable_version_flag = true)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Script file to execute; omit to start the REPL
    script: Option<String>,

    /// Print version information
    #[arg(short = 'v', long = "version")]
    version: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute a script file
    Run {
        /// Path to the script
        script: String,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EX_USAGE,
            };
            err.print().ok();
            return ExitCode::from(code);
        }
    };

    if cli.version {
        println!("quince {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let code = match (cli.command, cli.script) {
        (Some(Commands::Run { script }), _) => run_file(&script),
        (None, Some(script)) => run_file(&script),
        (None, None) => repl::run(),
    };
    ExitCode::from(code)
}

fn run_file(path: &str) -> u8 {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not open file '{}': {}", path, err);
            return EX_IOERR;
        }
    };

    let mut vm = Vm::new();
    // Modules resolve relative to the script's directory as well.
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            vm.add_module_search_path(parent);
        }
    }
    execute(&mut vm, &source)
}

/// Compile and run one source text, mapping failures to exit codes.
fn execute(vm: &mut Vm, source: &str) -> u8 {
    let program = match quince_syntax::parse(source) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{}", err);
            return EX_DATAERR;
        }
    };
    let chunk = match vm.compile(&program) {
        Ok(chunk) => chunk,
        Err(err) => {
            eprintln!("{}", err);
            return EX_DATAERR;
        }
    };
    // Runtime errors have already been reported with a stack trace.
    match vm.interpret(chunk, None) {
        Ok(()) => 0,
        Err(_) => EX_SOFTWARE,
    }
}
