use super::helpers::{expect_output, expect_runtime_error};

#[test]
fn construction_and_fields() {
    let source = r#"
        class Point { fun init(x, y) { this.x = x; this.y = y; } }
        var p = Point(3, 4);
        print(p.x); print(p.y);
    "#;
    expect_output(source, "3\n4\n");
}

#[test]
fn class_without_init() {
    expect_output(
        "class Bag {} var b = Bag(); b.item = 7; print(b.item);",
        "7\n",
    );
}

#[test]
fn fields_are_created_on_first_write() {
    expect_output(
        "class C {} var c = C(); print(c.missing); c.missing = 1; print(c.missing);",
        "nil\n1\n",
    );
}

#[test]
fn methods_receive_this() {
    let source = r#"
        class Counter {
            fun init() { this.n = 0; }
            fun bump() { this.n = this.n + 1; return this.n; }
        }
        var c = Counter();
        print(c.bump()); print(c.bump());
    "#;
    expect_output(source, "1\n2\n");
}

#[test]
fn methods_are_shared_between_instances() {
    let source = r#"
        class Greeter {
            fun init(name) { this.name = name; }
            fun greet() { return "hello " + this.name; }
        }
        print(Greeter("ana").greet());
        print(Greeter("bo").greet());
    "#;
    expect_output(source, "hello ana\nhello bo\n");
}

#[test]
fn methods_can_call_other_methods() {
    let source = r#"
        class Calc {
            fun init(v) { this.v = v; }
            fun double() { return this.v * 2; }
            fun quad() { return this.double() + this.double(); }
        }
        print(Calc(5).quad());
    "#;
    expect_output(source, "20\n");
}

#[test]
fn add_overload() {
    let source = r#"
        class V { fun init(x) { this.x = x; } fun __add__(o) { return V(this.x + o.x); } fun __str__() { return this.x; } }
        var a = V(2); var b = V(3); print((a + b).x);
    "#;
    expect_output(source, "5\n");
}

#[test]
fn arithmetic_overloads() {
    let source = r#"
        class N {
            fun init(v) { this.v = v; }
            fun __sub__(o) { return this.v - o.v; }
            fun __mul__(o) { return this.v * o.v; }
        }
        print(N(10) - N(4));
        print(N(6) * N(7));
    "#;
    expect_output(source, "6\n42\n");
}

#[test]
fn comparison_overloads() {
    let source = r#"
        class N {
            fun init(v) { this.v = v; }
            fun __eq__(o) { return this.v == o.v; }
            fun __lt__(o) { return this.v < o.v; }
            fun __le__(o) { return this.v <= o.v; }
        }
        print(N(1) == N(1));
        print(N(1) < N(2));
        print(N(2) <= N(2));
        print(N(3) < N(2));
    "#;
    expect_output(source, "true\ntrue\ntrue\nfalse\n");
}

#[test]
fn unary_overloads() {
    let source = r#"
        class B {
            fun init(v) { this.v = v; }
            fun __neg__() { return 0 - this.v; }
            fun __not__() { return this.v == 0; }
        }
        print(-B(5));
        print(not B(0));
        print(not B(1));
    "#;
    expect_output(source, "-5\ntrue\nfalse\n");
}

#[test]
fn overload_result_lands_in_expression_context() {
    // The internal call must preserve the destination register even in the
    // middle of a larger expression.
    let source = r#"
        class V { fun init(x) { this.x = x; } fun __add__(o) { return V(this.x + o.x); } }
        var total = (V(1) + V(2) + V(3)).x + 10;
        print(total);
    "#;
    expect_output(source, "16\n");
}

#[test]
fn instances_without_overload_fall_back_to_identity_eq() {
    let source = r#"
        class C {}
        var a = C(); var b = C();
        print(a == a); print(a == b);
    "#;
    expect_output(source, "true\nfalse\n");
}

#[test]
fn constructor_arity_checked() {
    expect_runtime_error(
        "class P { fun init(x) { this.x = x; } } P(1, 2);",
        "constructor expects 1 arguments, got 2",
    );
    expect_runtime_error("class Q {} Q(1);", "takes no constructor arguments");
}

#[test]
fn instance_member_key_must_be_string() {
    expect_runtime_error("class C {} var c = C(); print(c[1]);", "must be a string");
}

#[test]
fn unknown_method_is_nil() {
    expect_output("class C {} var c = C(); print(c.nope);", "nil\n");
}
