//! Built-in native functions and the in-process standard library modules
//!
//! The VM's global scope is pre-populated with a handful of natives
//! (`print`, `len`, `push`, `tonumber`, `type`, `gc_count`, `gc_collect`)
//! and the constant `PI`. The standard library proper lives in the
//! built-in modules `math`, `io`, `string` and `time`, which are produced
//! in-process on first import and registered through the same
//! native-function interface a loaded library would use.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;

use crate::heap::{BuiltinFn, Heap, ModuleObj, NativeFunctionObj, NativeImpl, Object};
use crate::value::{ObjRef, Value};

/// Context handed to in-process native functions: the heap for allocation
/// and the VM's output sink.
pub struct NativeCtx<'a> {
    pub heap: &'a mut Heap,
    pub out: &'a mut dyn Write,
}

// ----- Global natives -----

pub fn native_print(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    let parts: Vec<String> = args.iter().map(|&v| ctx.heap.display_value(v)).collect();
    writeln!(ctx.out, "{}", parts.join(" ")).map_err(|e| format!("print failed: {}", e))?;
    Ok(Value::NIL)
}

pub fn native_len(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err("len() expects 1 argument".to_string());
    }
    let v = args[0];
    if let Some(s) = ctx.heap.as_str(v) {
        return Ok(Value::number(s.len() as f64));
    }
    if v.is_object() {
        match ctx.heap.get(v.as_object()) {
            Object::List(items) => return Ok(Value::number(items.len() as f64)),
            Object::Table(t) => return Ok(Value::number(t.entries.len() as f64)),
            _ => {}
        }
    }
    Err("len() expects a string, list, or table".to_string())
}

pub fn native_push(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    if args.len() != 2 {
        return Err("push() expects 2 arguments".to_string());
    }
    let list = args[0];
    if !ctx.heap.is_list(list) {
        return Err("push() expects a list as its first argument".to_string());
    }
    ctx.heap.list_push(list.as_object(), args[1]);
    Ok(list)
}

pub fn native_tonumber(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err("tonumber() expects 1 argument".to_string());
    }
    match ctx.heap.as_str(args[0]) {
        Some(s) => match s.trim().parse::<f64>() {
            Ok(n) => Ok(Value::number(n)),
            Err(_) => Ok(Value::NIL),
        },
        None => Ok(Value::NIL),
    }
}

pub fn native_type(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err("type() expects 1 argument".to_string());
    }
    let name = ctx.heap.type_name(args[0]);
    Ok(ctx.heap.alloc_string(name))
}

pub fn native_gc_count(ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::number(ctx.heap.object_count() as f64))
}

pub fn native_gc_collect(ctx: &mut NativeCtx<'_>, _args: &[Value]) -> Result<Value, String> {
    // The collection itself runs at the VM's next safe point, where the
    // full root set is enumerable.
    ctx.heap.request_collect();
    Ok(Value::NIL)
}

/// The `(name, function)` pairs installed into the global scope.
pub fn global_natives() -> &'static [(&'static str, BuiltinFn)] {
    &[
        ("print", native_print),
        ("len", native_len),
        ("push", native_push),
        ("tonumber", native_tonumber),
        ("type", native_type),
        ("gc_count", native_gc_count),
        ("gc_collect", native_gc_collect),
    ]
}

// ----- Built-in modules -----

/// Construct a built-in module by name, if it is one.
pub fn builtin_module(heap: &mut Heap, name: &str) -> Option<ObjRef> {
    match name {
        "math" => Some(create_math_module(heap)),
        "io" => Some(create_io_module(heap)),
        "string" => Some(create_string_module(heap)),
        "time" => Some(create_time_module(heap)),
        _ => None,
    }
}

fn new_module(heap: &mut Heap, name: &str) -> ObjRef {
    heap.allocate(Object::Module(ModuleObj {
        name: name.to_string(),
        exports: Vec::new(),
    }))
}

fn export_native(heap: &mut Heap, module: ObjRef, name: &str, f: BuiltinFn) {
    let func = heap.allocate(Object::Native(NativeFunctionObj {
        name: name.to_string(),
        imp: NativeImpl::Builtin(f),
    }));
    let key = heap.alloc_string(name);
    heap.table_set(module, key, Value::object(func));
}

fn export_value(heap: &mut Heap, module: ObjRef, name: &str, value: Value) {
    let key = heap.alloc_string(name);
    heap.table_set(module, key, value);
}

fn arg_number(args: &[Value], i: usize) -> Option<f64> {
    args.get(i).copied().filter(|v| v.is_number()).map(|v| v.as_number())
}

/// Calls of the form `mod.f(x)` pass the module as an implicit first
/// argument; module natives drop it before reading their real arguments.
fn strip_receiver<'a>(heap: &Heap, args: &'a [Value]) -> &'a [Value] {
    match args.first() {
        Some(&first) if heap.is_module(first) => &args[1..],
        _ => args,
    }
}

fn unary_math(ctx: &NativeCtx<'_>, args: &[Value], f: fn(f64) -> f64) -> Result<Value, String> {
    let args = strip_receiver(ctx.heap, args);
    match arg_number(args, 0) {
        Some(n) => Ok(Value::number(f(n))),
        None => Ok(Value::NIL),
    }
}

fn create_math_module(heap: &mut Heap) -> ObjRef {
    let module = new_module(heap, "math");
    export_native(heap, module, "sin", |ctx, args| unary_math(ctx, args, f64::sin));
    export_native(heap, module, "cos", |ctx, args| unary_math(ctx, args, f64::cos));
    export_native(heap, module, "tan", |ctx, args| unary_math(ctx, args, f64::tan));
    export_native(heap, module, "sqrt", |ctx, args| unary_math(ctx, args, f64::sqrt));
    export_native(heap, module, "abs", |ctx, args| unary_math(ctx, args, f64::abs));
    export_native(heap, module, "floor", |ctx, args| unary_math(ctx, args, f64::floor));
    export_native(heap, module, "ceil", |ctx, args| unary_math(ctx, args, f64::ceil));
    export_native(heap, module, "pow", |ctx, args| {
        let args = strip_receiver(ctx.heap, args);
        match (arg_number(args, 0), arg_number(args, 1)) {
            (Some(base), Some(exp)) => Ok(Value::number(base.powf(exp))),
            _ => Ok(Value::NIL),
        }
    });
    export_native(heap, module, "random", |_, _| Ok(Value::number(next_random())));
    export_value(heap, module, "pi", Value::number(std::f64::consts::PI));
    module
}

static RNG_STATE: Lazy<AtomicU64> = Lazy::new(|| {
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9e37_79b9_7f4a_7c15)
        | 1;
    AtomicU64::new(seed)
});

/// xorshift64*; uniform in [0, 1).
fn next_random() -> f64 {
    let mut x = RNG_STATE.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    RNG_STATE.store(x, Ordering::Relaxed);
    (x.wrapping_mul(0x2545_f491_4f6c_dd1d) >> 11) as f64 / (1u64 << 53) as f64
}

fn create_io_module(heap: &mut Heap) -> ObjRef {
    let module = new_module(heap, "io");
    export_native(heap, module, "readFile", |ctx, args| {
        let args = strip_receiver(ctx.heap, args);
        let Some(path) = ctx
            .heap
            .as_str(args.first().copied().unwrap_or(Value::NIL))
            .map(|s| s.to_string())
        else {
            return Ok(Value::NIL);
        };
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(ctx.heap.alloc_string(contents)),
            Err(_) => Ok(Value::NIL),
        }
    });
    export_native(heap, module, "writeFile", |ctx, args| {
        let args = strip_receiver(ctx.heap, args);
        let path = args.first().copied().unwrap_or(Value::NIL);
        let content = args.get(1).copied().unwrap_or(Value::NIL);
        let (Some(path), Some(content)) = (ctx.heap.as_str(path), ctx.heap.as_str(content)) else {
            return Ok(Value::FALSE);
        };
        match std::fs::write(path, content) {
            Ok(()) => Ok(Value::TRUE),
            Err(_) => Ok(Value::FALSE),
        }
    });
    export_native(heap, module, "input", |ctx, args| {
        let args = strip_receiver(ctx.heap, args);
        if let Some(prompt) = args.first() {
            let text = ctx.heap.display_value(*prompt);
            write!(ctx.out, "{}", text).ok();
            ctx.out.flush().ok();
        }
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => Ok(Value::NIL),
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\n', '\r']);
                Ok(ctx.heap.alloc_string(trimmed))
            }
        }
    });
    module
}

fn string_sub(ctx: &mut NativeCtx<'_>, args: &[Value]) -> Result<Value, String> {
    let args = strip_receiver(ctx.heap, args);
    let Some(s) = ctx
        .heap
        .as_str(args.first().copied().unwrap_or(Value::NIL))
        .map(|s| s.to_string())
    else {
        return Ok(Value::NIL);
    };
    let chars: Vec<char> = s.chars().collect();
    let Some(start) = arg_number(args, 1) else {
        return Ok(ctx.heap.alloc_string(s));
    };
    let start = start.max(0.0) as usize;
    if start >= chars.len() {
        return Ok(ctx.heap.alloc_string(""));
    }
    let count = match arg_number(args, 2) {
        Some(n) => n.max(0.0) as usize,
        None => chars.len() - start,
    };
    let sub: String = chars[start..].iter().take(count).collect();
    Ok(ctx.heap.alloc_string(sub))
}

fn create_string_module(heap: &mut Heap) -> ObjRef {
    let module = new_module(heap, "string");
    export_native(heap, module, "sub", string_sub);
    export_native(heap, module, "upper", |ctx, args| {
        let args = strip_receiver(ctx.heap, args);
        match ctx
            .heap
            .as_str(args.first().copied().unwrap_or(Value::NIL))
            .map(|s| s.to_uppercase())
        {
            Some(upper) => Ok(ctx.heap.alloc_string(upper)),
            None => Ok(Value::NIL),
        }
    });
    export_native(heap, module, "lower", |ctx, args| {
        let args = strip_receiver(ctx.heap, args);
        match ctx
            .heap
            .as_str(args.first().copied().unwrap_or(Value::NIL))
            .map(|s| s.to_lowercase())
        {
            Some(lower) => Ok(ctx.heap.alloc_string(lower)),
            None => Ok(Value::NIL),
        }
    });
    export_native(heap, module, "find", |ctx, args| {
        let args = strip_receiver(ctx.heap, args);
        let haystack = args.first().copied().unwrap_or(Value::NIL);
        let needle = args.get(1).copied().unwrap_or(Value::NIL);
        let (Some(haystack), Some(needle)) = (ctx.heap.as_str(haystack), ctx.heap.as_str(needle))
        else {
            return Ok(Value::NIL);
        };
        match haystack.find(needle) {
            Some(idx) => Ok(Value::number(idx as f64)),
            None => Ok(Value::NIL),
        }
    });
    module
}

static PROGRAM_START: Lazy<Instant> = Lazy::new(Instant::now);

fn create_time_module(heap: &mut Heap) -> ObjRef {
    let module = new_module(heap, "time");
    export_native(heap, module, "now", |_, _| {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok(Value::number(secs))
    });
    export_native(heap, module, "clock", |_, _| {
        Ok(Value::number(PROGRAM_START.elapsed().as_secs_f64()))
    });
    export_native(heap, module, "sleep", |ctx, args| {
        let args = strip_receiver(ctx.heap, args);
        if let Some(secs) = arg_number(args, 0) {
            if secs > 0.0 {
                std::thread::sleep(std::time::Duration::from_secs_f64(secs));
            }
        }
        Ok(Value::NIL)
    });
    module
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with<'a>(heap: &'a mut Heap, out: &'a mut Vec<u8>) -> NativeCtx<'a> {
        NativeCtx { heap, out }
    }

    #[test]
    fn print_joins_with_spaces() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("x");
        let mut out = Vec::new();
        let mut ctx = ctx_with(&mut heap, &mut out);
        native_print(&mut ctx, &[Value::number(1.0), s, Value::NIL]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1 x nil\n");
    }

    #[test]
    fn tonumber_full_parse_only() {
        let mut heap = Heap::new();
        let good = heap.alloc_string("3.5");
        let bad = heap.alloc_string("3.5abc");
        let mut out = Vec::new();
        let mut ctx = ctx_with(&mut heap, &mut out);
        assert_eq!(native_tonumber(&mut ctx, &[good]).unwrap(), Value::number(3.5));
        assert_eq!(native_tonumber(&mut ctx, &[bad]).unwrap(), Value::NIL);
        assert_eq!(
            native_tonumber(&mut ctx, &[Value::number(1.0)]).unwrap(),
            Value::NIL
        );
    }

    #[test]
    fn push_appends_and_barriers() {
        let mut heap = Heap::new();
        let list = heap.allocate(Object::List(vec![]));
        let root = Value::object(list);
        heap.collect(&[root]); // promote the list to Old
        let mut out = Vec::new();
        let mut ctx = ctx_with(&mut heap, &mut out);
        let s = ctx.heap.alloc_string("young");
        native_push(&mut ctx, &[root, s]).unwrap();
        assert!(heap.remembered_len() >= 1);
        let Object::List(items) = heap.get(list) else {
            panic!();
        };
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn math_module_exports() {
        let mut heap = Heap::new();
        let module = builtin_module(&mut heap, "math").unwrap();
        let key = heap.alloc_string("pi");
        let pi = heap.table_get(module, key).unwrap();
        assert!((pi.as_number() - std::f64::consts::PI).abs() < 1e-12);
        let key = heap.alloc_string("sqrt");
        assert!(heap.table_get(module, key).is_some());
    }

    #[test]
    fn string_sub_behaviour() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("hello world");
        let mut out = Vec::new();
        let mut ctx = ctx_with(&mut heap, &mut out);
        let result = string_sub(&mut ctx, &[s, Value::number(6.0)]).unwrap();
        assert_eq!(ctx.heap.as_str(result), Some("world"));
        let result = string_sub(&mut ctx, &[s, Value::number(0.0), Value::number(5.0)]).unwrap();
        assert_eq!(ctx.heap.as_str(result), Some("hello"));
        let result = string_sub(&mut ctx, &[s, Value::number(99.0)]).unwrap();
        assert_eq!(ctx.heap.as_str(result), Some(""));
    }

    #[test]
    fn random_is_in_unit_interval() {
        for _ in 0..100 {
            let r = next_random();
            assert!((0.0..1.0).contains(&r));
        }
    }
}
