//! Shared helpers: compile and execute source, capturing stdout.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crate::vm::Vm;

/// A `Write` sink the test can read back after handing it to the VM.
#[derive(Clone, Default)]
pub struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).expect("program output was not UTF-8")
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A VM with captured output.
pub fn capture_vm() -> (Vm, SharedBuf) {
    let buf = SharedBuf::default();
    let vm = Vm::with_output(Box::new(buf.clone()));
    (vm, buf)
}

/// Parse, compile and interpret in the given VM.
pub fn run_in(vm: &mut Vm, source: &str) -> Result<(), String> {
    let program = quince_syntax::parse(source).map_err(|e| e.to_string())?;
    let chunk = vm.compile(&program).map_err(|e| e.to_string())?;
    vm.interpret(chunk, None).map_err(|e| e.to_string())
}

/// Execute source in a fresh VM and return everything it printed.
pub fn run(source: &str) -> Result<String, String> {
    let (mut vm, buf) = capture_vm();
    run_in(&mut vm, source)?;
    Ok(buf.contents())
}

/// Assert that the program prints exactly `expected`.
pub fn expect_output(source: &str, expected: &str) {
    match run(source) {
        Ok(output) => assert_eq!(output, expected, "program: {}", source),
        Err(err) => panic!("program failed: {}\nsource: {}", err, source),
    }
}

/// Assert that the program fails at runtime with a message containing
/// `fragment`.
pub fn expect_runtime_error(source: &str, fragment: &str) {
    match run(source) {
        Ok(output) => panic!(
            "expected runtime error containing '{}', but program succeeded with output: {}",
            fragment, output
        ),
        Err(err) => assert!(
            err.contains(fragment),
            "expected error containing '{}', got: {}",
            fragment,
            err
        ),
    }
}
