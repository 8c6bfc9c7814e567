//! End-to-end parser tests over realistic programs.

use quince_syntax::ast::{Expr, Stmt};
use quince_syntax::parse;

#[test]
fn parses_a_realistic_program() {
    let source = r#"
        // A small program touching most statement forms.
        var total = 0;
        fun helper(n) { return n * 2; }

        class Accumulator {
            fun init() { this.value = 0; }
            fun add(n) { this.value = this.value + helper(n); return this.value; }
        }

        var acc = Accumulator();
        for (var i = 0; i < 10; i = i + 1) { total = acc.add(i); }
        while (total > 0) { total = total - 7; }
        for (var k in {a: 1, b: 2}) { print(k); }
        if (total == 0 or total < 0) { print("done", total ? "t" : "f"); }
    "#;
    let program = parse(source).expect("program should parse");
    assert_eq!(program.statements.len(), 8);
    assert!(!program.strict);
}

#[test]
fn parses_modules_and_exports() {
    let source = r#"
        import utils.text;
        from math import sqrt, floor;
        export var answer = 42;
        export fun shout(s) { return s + "!"; }
        export class Empty {}
    "#;
    let program = parse(source).expect("module syntax should parse");
    assert!(matches!(&program.statements[0], Stmt::Import { module, .. } if module == "utils.text"));
    assert!(matches!(&program.statements[1], Stmt::FromImport { symbols, .. } if symbols.len() == 2));
    for stmt in &program.statements[2..] {
        assert!(matches!(stmt, Stmt::Export { .. }));
    }
}

#[test]
fn expression_forms_nest() {
    let source = "var r = f(a[1:2], {k: [1, 2]}, fun (x) { return -x; })[0].field;";
    let program = parse(source).expect("nested expressions should parse");
    let Stmt::Var {
        initializer: Some(expr),
        ..
    } = &program.statements[0]
    else {
        panic!("expected var with initializer");
    };
    // Outermost is the member access on the indexed call result.
    assert!(matches!(expr, Expr::Member { name, .. } if name == "field"));
}

#[test]
fn first_error_aborts_with_location() {
    let err = parse("var x = 1;\nvar = 2;").unwrap_err();
    assert_eq!(err.line, 2);
    assert!(err.message.contains("identifier"));
}

#[test]
fn statements_require_semicolons() {
    assert!(parse("print(1)").is_err());
    assert!(parse("var x = 1").is_err());
}

#[test]
fn keywords_are_not_identifiers() {
    assert!(parse("var class = 1;").is_err());
    assert!(parse("var fun = 1;").is_err());
}
