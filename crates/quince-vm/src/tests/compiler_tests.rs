//! Compiler-level checks on the emitted bytecode.

use std::rc::Rc;

use crate::chunk::instruction::*;
use crate::chunk::Chunk;
use crate::compiler;
use crate::heap::{Heap, Object};
use crate::opcode::OpCode;
use crate::value::Value;

fn compile(source: &str) -> (Heap, Rc<Chunk>) {
    let mut heap = Heap::new();
    let program = quince_syntax::parse(source).expect("parse error");
    let chunk = compiler::compile(&mut heap, &program).expect("compile error");
    (heap, chunk)
}

/// All chunks reachable from a top-level chunk, including functions and
/// class methods embedded in constant pools.
fn all_chunks(heap: &Heap, chunk: &Rc<Chunk>) -> Vec<Rc<Chunk>> {
    let mut chunks = vec![chunk.clone()];
    let mut i = 0;
    while i < chunks.len() {
        let current = chunks[i].clone();
        for &constant in &current.constants {
            if !constant.is_object() {
                continue;
            }
            match heap.get(constant.as_object()) {
                Object::Function(f) => chunks.push(f.chunk.clone()),
                Object::Class(c) => {
                    for &m in c.methods.values() {
                        if let Object::Function(f) = heap.get(m.as_object()) {
                            chunks.push(f.chunk.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    chunks
}

const SAMPLE: &str = r#"
    var total = 0;
    fun helper(n) { return n * 2; }
    class Acc {
        fun init() { this.v = 0; }
        fun add(n) { this.v = this.v + helper(n); return this.v; }
    }
    var acc = Acc();
    for (var i = 0; i < 5; i = i + 1) { total = acc.add(i); }
    for (var x in [1, 2, 3]) { total = total + x; }
    if (total > 10 and total < 100) { print(total); } else { print("odd", total ? 1 : 2); }
    var t = {k: [1, 2][0:1]};
"#;

#[test]
fn line_table_matches_instruction_count() {
    let (heap, chunk) = compile(SAMPLE);
    for chunk in all_chunks(&heap, &chunk) {
        assert_eq!(chunk.code.len(), chunk.lines.len());
        assert!(!chunk.code.is_empty());
    }
}

#[test]
fn every_emitted_word_is_a_valid_instruction() {
    let (heap, chunk) = compile(SAMPLE);
    for chunk in all_chunks(&heap, &chunk) {
        for &word in &chunk.code {
            let op = OpCode::from_u8(get_op(word));
            assert!(op.is_some(), "invalid opcode byte {}", get_op(word));
        }
    }
}

#[test]
fn register_operands_stay_in_the_frame_window() {
    let (heap, chunk) = compile(SAMPLE);
    for chunk in all_chunks(&heap, &chunk) {
        for &word in &chunk.code {
            assert!(get_a(word) < 256);
        }
    }
}

#[test]
fn reserved_opcodes_are_never_emitted() {
    let (heap, chunk) = compile(SAMPLE);
    for chunk in all_chunks(&heap, &chunk) {
        for &word in &chunk.code {
            let op = OpCode::from_u8(get_op(word)).unwrap();
            assert!(
                !matches!(
                    op,
                    OpCode::TestSet
                        | OpCode::TailCall
                        | OpCode::SelfOp
                        | OpCode::ForLoop
                        | OpCode::ForPrep
                ),
                "reserved opcode {} emitted",
                op
            );
        }
    }
}

#[test]
fn chunks_end_with_return() {
    let (heap, chunk) = compile(SAMPLE);
    for chunk in all_chunks(&heap, &chunk) {
        let last = *chunk.code.last().unwrap();
        assert_eq!(OpCode::from_u8(get_op(last)), Some(OpCode::Return));
    }
}

#[test]
fn whitespace_and_comments_do_not_change_code() {
    let plain = "var x = 1; var y = x + 2; print(y * x);";
    let spaced = "var  x=1 ;  /* noise */ var y = x  +  2 ; print( y*x ) ;";
    let (heap_a, chunk_a) = compile(plain);
    let (heap_b, chunk_b) = compile(spaced);

    assert_eq!(chunk_a.code, chunk_b.code);
    assert_eq!(chunk_a.lines, chunk_b.lines);
    assert_eq!(chunk_a.constants.len(), chunk_b.constants.len());
    for (&a, &b) in chunk_a.constants.iter().zip(chunk_b.constants.iter()) {
        assert_eq!(heap_a.display_value(a), heap_b.display_value(b));
    }
}

#[test]
fn constant_pool_deduplicates_repeated_literals() {
    let (_heap, chunk) = compile("print(7 + 7 + 7); print(\"x\" + \"x\");");
    let sevens = chunk
        .constants
        .iter()
        .filter(|&&v| v.is_number() && v.as_number() == 7.0)
        .count();
    assert_eq!(sevens, 1);
}

#[test]
fn closure_capture_words_follow_the_closure() {
    let (heap, chunk) = compile(
        "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
    );
    // For every CLOSURE instruction, the template's upvalue count many
    // capture words follow, each a MOVE (parent local) or GETUPVAL
    // (parent upvalue) word.
    let mut capturing_closures = 0;
    for chunk in all_chunks(&heap, &chunk) {
        for (pos, &word) in chunk.code.iter().enumerate() {
            if OpCode::from_u8(get_op(word)) != Some(OpCode::Closure) {
                continue;
            }
            let template = chunk.constants[get_bx(word) as usize];
            let Object::Function(f) = heap.get(template.as_object()) else {
                panic!("CLOSURE operand is not a function template");
            };
            for i in 0..f.upvalues.len() {
                let capture = chunk.code[pos + 1 + i];
                let op = OpCode::from_u8(get_op(capture));
                assert!(
                    op == Some(OpCode::Move) || op == Some(OpCode::GetUpval),
                    "capture word has unexpected opcode {:?}",
                    op
                );
            }
            if !f.upvalues.is_empty() {
                capturing_closures += 1;
            }
        }
    }
    // `inner` captures x.
    assert_eq!(capturing_closures, 1);
}

#[test]
fn strict_mode_failures_produce_no_chunk() {
    let mut heap = Heap::new();
    let program = quince_syntax::parse("strict; var a = 1; b = 2;").unwrap();
    let result = compiler::compile(&mut heap, &program);
    assert!(result.is_err());
    // Nothing stays rooted after a failed compile.
    assert_eq!(heap.temp_root_count(), 0);
}

#[test]
fn this_outside_method_is_a_compile_error() {
    let mut heap = Heap::new();
    let program = quince_syntax::parse("print(this);").unwrap();
    assert!(compiler::compile(&mut heap, &program).is_err());
}

#[test]
fn return_at_top_level_is_a_compile_error() {
    let mut heap = Heap::new();
    let program = quince_syntax::parse("return 1;").unwrap();
    assert!(compiler::compile(&mut heap, &program).is_err());
}

#[test]
fn export_requires_a_named_declaration() {
    let mut heap = Heap::new();
    let program = quince_syntax::parse("export 1 + 2;").unwrap();
    assert!(compiler::compile(&mut heap, &program).is_err());
}

#[test]
fn class_constant_carries_compiled_methods() {
    let (heap, chunk) = compile("class P { fun init(x) { this.x = x; } fun get() { return this.x; } }");
    let class = chunk
        .constants
        .iter()
        .find_map(|&v| {
            if !v.is_object() {
                return None;
            }
            match heap.get(v.as_object()) {
                Object::Class(c) => Some(c),
                _ => None,
            }
        })
        .expect("class constant");
    assert_eq!(class.name, "P");
    assert_eq!(class.methods.len(), 2);
    let init = class.methods.get("init").unwrap();
    let Object::Function(f) = heap.get(init.as_object()) else {
        panic!("init is not a function");
    };
    // `this` plus one declared parameter.
    assert_eq!(f.arity, 2);
}

#[test]
fn number_constants_compare_by_value() {
    let heap = Heap::new();
    let mut chunk = Chunk::new();
    let a = chunk.add_constant(Value::number(1.5), &heap);
    let b = chunk.add_constant(Value::number(1.5), &heap);
    assert_eq!(a, b);
}
