//! Interactive prompt
//!
//! Each line is compiled and executed against a persistent VM, so globals
//! and imported modules carry across inputs. Errors are reported and the
//! REPL recovers at the next statement boundary.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use quince_vm::Vm;

pub fn run() -> u8 {
    println!(
        "Quince {} on {}. Type 'exit' to quit.",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    );

    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(err) => {
            eprintln!("Could not initialise the line editor: {}", err);
            return 74;
        }
    };
    let mut vm = Vm::new();

    loop {
        match editor.readline("quince> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "exit" {
                    break;
                }
                editor.add_history_entry(line).ok();
                run_line(&mut vm, line);
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Input error: {}", err);
                break;
            }
        }
    }
    0
}

fn run_line(vm: &mut Vm, line: &str) {
    let program = match quince_syntax::parse(line) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{}", err);
            return;
        }
    };
    match vm.compile(&program) {
        Ok(chunk) => {
            // A failure has already been reported with its stack trace.
            let _ = vm.interpret(chunk, None);
        }
        Err(err) => eprintln!("{}", err),
    }
}
