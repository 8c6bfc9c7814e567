use std::fs;
use std::path::PathBuf;

use super::helpers::{capture_vm, expect_output, run_in};

/// A scratch directory seeded with module files.
struct ModuleDir {
    path: PathBuf,
}

impl ModuleDir {
    fn new(tag: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "quince-modules-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    fn write(&self, name: &str, source: &str) -> &Self {
        let file = self.path.join(name);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(file, source).unwrap();
        self
    }
}

impl Drop for ModuleDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

fn run_with_modules(dir: &ModuleDir, source: &str) -> Result<String, String> {
    let (mut vm, buf) = capture_vm();
    vm.add_module_search_path(&dir.path);
    run_in(&mut vm, source)?;
    Ok(buf.contents())
}

#[test]
fn from_import_binds_exports() {
    let dir = ModuleDir::new("from-import");
    dir.write("mymod.qn", "export var answer = 42;");
    let out = run_with_modules(&dir, "from mymod import answer; print(answer);").unwrap();
    assert_eq!(out, "42\n");
}

#[test]
fn import_binds_the_module_object() {
    let dir = ModuleDir::new("import");
    dir.write("config.qn", "export var debug = true; export var level = 3;");
    let out = run_with_modules(&dir, "import config; print(config.level, config.debug);").unwrap();
    assert_eq!(out, "3 true\n");
}

#[test]
fn exported_functions_and_classes() {
    let dir = ModuleDir::new("exports");
    dir.write(
        "shapes.qn",
        r#"
            export fun area(w, h) { return w * h; }
            export class Square { fun init(s) { this.s = s; } fun area() { return this.s * this.s; } }
        "#,
    );
    let out = run_with_modules(
        &dir,
        "from shapes import area, Square; print(area(3, 4)); print(Square(5).area());",
    )
    .unwrap();
    assert_eq!(out, "12\n25\n");
}

#[test]
fn module_initialisation_runs_once() {
    let dir = ModuleDir::new("cache");
    dir.write("noisy.qn", "print(\"loaded\"); export var x = 1;");
    let out = run_with_modules(
        &dir,
        "import noisy; import noisy; from noisy import x; print(x);",
    )
    .unwrap();
    assert_eq!(out, "loaded\n1\n");
}

#[test]
fn dotted_names_resolve_into_directories() {
    let dir = ModuleDir::new("dotted");
    dir.write("pkg/util.qn", "export var tag = \"pkg.util\";");
    let out = run_with_modules(&dir, "from pkg.util import tag; print(tag);").unwrap();
    assert_eq!(out, "pkg.util\n");
}

#[test]
fn package_init_scripts() {
    let dir = ModuleDir::new("package");
    dir.write("toolbox/__init.qn", "export var ready = true;");
    let out = run_with_modules(&dir, "import toolbox; print(toolbox.ready);").unwrap();
    assert_eq!(out, "true\n");
}

#[test]
fn missing_module_is_a_runtime_error() {
    let dir = ModuleDir::new("missing");
    let err = run_with_modules(&dir, "import nothing_here;").unwrap_err();
    assert!(err.contains("Module not found"), "{}", err);
}

#[test]
fn missing_export_reads_nil() {
    let dir = ModuleDir::new("missing-export");
    dir.write("m.qn", "export var a = 1;");
    let out = run_with_modules(&dir, "import m; print(m.b);").unwrap();
    assert_eq!(out, "nil\n");
}

#[test]
fn cyclic_imports_error_and_leave_no_cache_entry() {
    let dir = ModuleDir::new("cycle");
    dir.write("cycle_a.qn", "import cycle_b; export var a = 1;");
    dir.write("cycle_b.qn", "import cycle_a; export var b = 2;");

    let (mut vm, _buf) = capture_vm();
    vm.add_module_search_path(&dir.path);
    let err = run_in(&mut vm, "import cycle_a;").unwrap_err();
    assert!(err.contains("Cyclic import"), "{}", err);

    // Nothing partial was cached: importing again fails the same way
    // instead of producing a half-initialised module.
    let err = run_in(&mut vm, "import cycle_a;").unwrap_err();
    assert!(err.contains("Cyclic import"), "{}", err);
}

#[test]
fn failed_module_is_not_cached() {
    let dir = ModuleDir::new("failing");
    dir.write("bad.qn", "export var x = 1 / 0;");

    let (mut vm, _buf) = capture_vm();
    vm.add_module_search_path(&dir.path);
    assert!(run_in(&mut vm, "import bad;").is_err());
    // Still fails on retry rather than returning a partial module.
    assert!(run_in(&mut vm, "import bad;").is_err());
}

#[test]
fn syntax_error_in_module_reports_module_name() {
    let dir = ModuleDir::new("syntax");
    dir.write("broken.qn", "var = ;");
    let err = run_with_modules(&dir, "import broken;").unwrap_err();
    assert!(err.contains("broken"), "{}", err);
}

// ----- Built-in modules -----

#[test]
fn math_module() {
    expect_output("import math; print(math.floor(3.7), math.ceil(3.2));", "3 4\n");
    expect_output("import math; print(math.sqrt(16), math.abs(-2));", "4 2\n");
    expect_output("import math; print(math.pow(2, 8));", "256\n");
    expect_output("import math; print(math.pi > 3.14 and math.pi < 3.15);", "true\n");
    expect_output(
        "import math; var r = math.random(); print(r >= 0 and r < 1);",
        "true\n",
    );
}

#[test]
fn math_functions_via_from_import() {
    expect_output("from math import sqrt, floor; print(sqrt(9) + floor(0.5));", "3\n");
}

#[test]
fn string_module() {
    expect_output("import string; print(string.upper(\"abc\"), string.lower(\"DEF\"));", "ABC def\n");
    expect_output("import string; print(string.sub(\"hello world\", 6));", "world\n");
    expect_output("import string; print(string.sub(\"hello\", 1, 3));", "ell\n");
    expect_output("import string; print(string.find(\"haystack\", \"stack\"));", "3\n");
    expect_output("import string; print(string.find(\"haystack\", \"needle\"));", "nil\n");
}

#[test]
fn time_module() {
    expect_output("import time; print(time.now() > 0);", "true\n");
    expect_output("import time; print(time.clock() >= 0);", "true\n");
}

#[test]
fn io_module_round_trip() {
    let dir = ModuleDir::new("io");
    let file = dir.path.join("data.txt");
    let source = format!(
        r#"
            import io;
            print(io.writeFile("{path}", "line one"));
            print(io.readFile("{path}"));
            print(io.readFile("{path}/nonexistent"));
        "#,
        path = file.display()
    );
    let out = run_with_modules(&dir, &source).unwrap();
    assert_eq!(out, "true\nline one\nnil\n");
}

#[test]
fn builtin_modules_take_precedence_over_files() {
    let dir = ModuleDir::new("shadow");
    dir.write("math.qn", "export var pi = 0;");
    let out = run_with_modules(&dir, "import math; print(math.pi > 3);").unwrap();
    assert_eq!(out, "true\n");
}
