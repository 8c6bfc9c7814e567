//! Register-based virtual machine
//!
//! Executes [`Chunk`]s over one contiguous value stack organised into call
//! frames. Dispatch is a plain fetch/decode/match loop; every instruction
//! boundary is a GC safe point where the collector can see the full root
//! set (live stack window, frames, globals, module cache, current module,
//! temporary roots).
//!
//! `interpret` is re-entrant: module loading compiles and executes the
//! module's chunk nested inside the importing IMPORT instruction.

mod frame;
mod modules;

pub use frame::CallFrame;

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::rc::Rc;

use quince_syntax::ast::Program;

use crate::chunk::instruction::*;
use crate::chunk::Chunk;
use crate::compiler;
use crate::error::{CompileError, RuntimeError};
use crate::heap::{
    BuiltinFn, Heap, InstanceObj, NativeFunctionObj, NativeImpl, Object, TableObj,
};
use crate::native;
use crate::opcode::OpCode;
use crate::resolver::ModuleResolver;
use crate::stdlib::{self, NativeCtx};
use crate::value::{ObjRef, Value};

/// Register window reserved per call frame.
pub const FRAME_WINDOW: usize = 256;

/// Maximum call depth before a stack-overflow error.
pub const MAX_CALL_DEPTH: usize = 10_000;

pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    stack_top: usize,
    frames: Vec<CallFrame>,
    globals: HashMap<String, Value>,
    module_cache: HashMap<String, Value>,
    /// Modules currently executing their init; used to detect cycles.
    loading: HashSet<String>,
    current_module: Option<ObjRef>,
    resolver: ModuleResolver,
    /// Loaded native libraries, kept alive for the process lifetime.
    libraries: Vec<native::Library>,
    out: Box<dyn Write>,
    /// Persistent error flag; drivers turn it into an exit status.
    pub has_error: bool,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(std::io::stdout()))
    }

    /// Build a VM writing program output to the given sink.
    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            stack: vec![Value::NIL; 4 * FRAME_WINDOW],
            stack_top: 0,
            frames: Vec::new(),
            globals: HashMap::new(),
            module_cache: HashMap::new(),
            loading: HashSet::new(),
            current_module: None,
            resolver: ModuleResolver::new(),
            libraries: Vec::new(),
            out,
            has_error: false,
        };
        for &(name, f) in stdlib::global_natives() {
            vm.register_native(name, f);
        }
        vm.register_global("PI", Value::number(std::f64::consts::PI));
        vm
    }

    pub fn register_native(&mut self, name: &str, f: BuiltinFn) {
        let func = self.heap.allocate(Object::Native(NativeFunctionObj {
            name: name.to_string(),
            imp: NativeImpl::Builtin(f),
        }));
        self.globals.insert(name.to_string(), Value::object(func));
    }

    pub fn register_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).copied()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn add_module_search_path(&mut self, path: impl Into<std::path::PathBuf>) {
        self.resolver.add_search_path(path.into());
    }

    /// Compile a parsed program against this VM's heap.
    pub fn compile(&mut self, program: &Program) -> Result<Rc<Chunk>, CompileError> {
        compiler::compile(&mut self.heap, program)
    }

    /// Execute a chunk. `module` designates the current module for EXPORT;
    /// pass None for ordinary scripts.
    pub fn interpret(
        &mut self,
        chunk: Rc<Chunk>,
        module: Option<ObjRef>,
    ) -> Result<(), RuntimeError> {
        if self.frames.is_empty() {
            self.has_error = false;
        }
        let saved_module = self.current_module;
        if module.is_some() {
            self.current_module = module;
        }

        let initial_frame = self.frames.len();
        let entry_base = self.stack_top;
        self.frames
            .push(CallFrame::new(None, chunk, entry_base, 0));
        self.stack_top = entry_base + FRAME_WINDOW;
        self.ensure_stack(self.stack_top);

        let result = self.run(initial_frame);

        self.current_module = saved_module;
        if result.is_err() {
            self.frames.truncate(initial_frame);
            for slot in entry_base..self.stack_top.min(self.stack.len()) {
                self.stack[slot] = Value::NIL;
            }
            self.stack_top = entry_base;
        }
        result
    }

    // ----- Dispatch loop -----

    fn run(&mut self, initial_frame: usize) -> Result<(), RuntimeError> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }

            let (instruction, base) = {
                let frame = self.frames.last_mut().expect("no active frame");
                match frame.chunk.code.get(frame.ip) {
                    Some(&i) => {
                        frame.ip += 1;
                        (i, frame.base)
                    }
                    None => {
                        // The compiler always terminates chunks with RETURN;
                        // treat running off the end as returning nil.
                        if self.return_from_frame(Value::NIL, initial_frame)? {
                            return Ok(());
                        }
                        continue;
                    }
                }
            };

            let op_byte = get_op(instruction);
            let Some(op) = OpCode::from_u8(op_byte) else {
                return Err(self.error(format!("Invalid opcode {}", op_byte)));
            };
            let a = get_a(instruction);
            let b = get_b(instruction);
            let c = get_c(instruction);

            match op {
                OpCode::Move => {
                    let v = self.reg(base, b);
                    self.set_reg(base, a, v);
                }

                OpCode::LoadK => {
                    let v = self.constant(get_bx(instruction))?;
                    self.set_reg(base, a, v);
                }

                OpCode::LoadBool => {
                    self.set_reg(base, a, Value::boolean(b != 0));
                    if c != 0 {
                        self.frames.last_mut().expect("no active frame").ip += 1;
                    }
                }

                OpCode::LoadNil => {
                    for i in a..=a + b {
                        self.set_reg(base, i, Value::NIL);
                    }
                }

                OpCode::Add => {
                    let v1 = self.reg(base, b);
                    let v2 = self.reg(base, c);
                    if v1.is_number() && v2.is_number() {
                        self.set_reg(base, a, Value::number(v1.as_number() + v2.as_number()));
                    } else if let Some(m) = self.heap.instance_method(v1, "__add__") {
                        self.push_operator_frame(m, v1, Some(v2), a)?;
                    } else {
                        // Fallback: coerce both sides and concatenate.
                        let s = format!(
                            "{}{}",
                            self.heap.display_value(v1),
                            self.heap.display_value(v2)
                        );
                        let v = self.heap.alloc_string(s);
                        self.set_reg(base, a, v);
                    }
                }

                OpCode::Sub => self.arith(base, a, b, c, "__sub__", "-", |x, y| x - y)?,
                OpCode::Mul => self.arith(base, a, b, c, "__mul__", "*", |x, y| x * y)?,
                OpCode::Pow => self.arith(base, a, b, c, "__pow__", "^", f64::powf)?,

                OpCode::Div => {
                    let v2 = self.reg(base, c);
                    if self.reg(base, b).is_number() && v2.is_number() && v2.as_number() == 0.0 {
                        return Err(self.error("Division by zero"));
                    }
                    self.arith(base, a, b, c, "__div__", "/", |x, y| x / y)?;
                }

                OpCode::Mod => {
                    let v2 = self.reg(base, c);
                    if self.reg(base, b).is_number() && v2.is_number() && v2.as_number() == 0.0 {
                        return Err(self.error("Modulo by zero"));
                    }
                    self.arith(base, a, b, c, "__mod__", "%", |x, y| x % y)?;
                }

                OpCode::Unm => {
                    let v = self.reg(base, b);
                    if v.is_number() {
                        self.set_reg(base, a, Value::number(-v.as_number()));
                    } else if let Some(m) = self.heap.instance_method(v, "__neg__") {
                        self.push_operator_frame(m, v, None, a)?;
                    } else {
                        let t = self.heap.type_name(v);
                        return Err(self.error(format!("Cannot negate a {} value", t)));
                    }
                }

                OpCode::Not => {
                    let v = self.reg(base, b);
                    if let Some(m) = self.heap.instance_method(v, "__not__") {
                        self.push_operator_frame(m, v, None, a)?;
                    } else {
                        self.set_reg(base, a, Value::boolean(!v.truthy()));
                    }
                }

                OpCode::Len => {
                    let v = self.reg(base, b);
                    let len = if let Some(s) = self.heap.as_str(v) {
                        s.len()
                    } else if v.is_object() {
                        match self.heap.get(v.as_object()) {
                            Object::List(items) => items.len(),
                            Object::Table(t) => t.entries.len(),
                            _ => 0,
                        }
                    } else {
                        0
                    };
                    self.set_reg(base, a, Value::number(len as f64));
                }

                OpCode::Concat => {
                    let s = format!(
                        "{}{}",
                        self.heap.display_value(self.reg(base, b)),
                        self.heap.display_value(self.reg(base, c))
                    );
                    let v = self.heap.alloc_string(s);
                    self.set_reg(base, a, v);
                }

                OpCode::Eq => {
                    let v1 = self.reg(base, b);
                    let v2 = self.reg(base, c);
                    if let Some(m) = self.heap.instance_method(v1, "__eq__") {
                        self.push_operator_frame(m, v1, Some(v2), a)?;
                    } else {
                        self.set_reg(base, a, Value::boolean(self.heap.values_equal(v1, v2)));
                    }
                }

                OpCode::Lt => self.compare_op(base, a, b, c, "__lt__", "<", |o| o.is_lt())?,
                OpCode::Le => self.compare_op(base, a, b, c, "__le__", "<=", |o| o.is_le())?,

                OpCode::Jmp => {
                    let offset = get_sbx(instruction);
                    let frame = self.frames.last_mut().expect("no active frame");
                    frame.ip = (frame.ip as i64 + offset as i64) as usize;
                }

                OpCode::Test => {
                    if self.reg(base, a).truthy() == (c != 0) {
                        self.frames.last_mut().expect("no active frame").ip += 1;
                    }
                }

                OpCode::Call => self.call_value(base, a, b)?,

                OpCode::Return => {
                    let value = if b > 1 { self.reg(base, a) } else { Value::NIL };
                    if self.return_from_frame(value, initial_frame)? {
                        return Ok(());
                    }
                }

                OpCode::GetGlobal => {
                    let key = self.constant(get_bx(instruction))?;
                    let Some(name) = self.heap.as_str(key) else {
                        return Err(self.error("Global name must be a string"));
                    };
                    let v = self.globals.get(name).copied().unwrap_or(Value::NIL);
                    self.set_reg(base, a, v);
                }

                OpCode::SetGlobal => {
                    let key = self.constant(get_bx(instruction))?;
                    let Some(name) = self.heap.as_str(key).map(|s| s.to_string()) else {
                        return Err(self.error("Global name must be a string"));
                    };
                    let v = self.reg(base, a);
                    self.globals.insert(name, v);
                }

                OpCode::GetUpval => {
                    let v = self
                        .frames
                        .last()
                        .and_then(|f| f.function)
                        .and_then(|r| match self.heap.get(r) {
                            Object::Function(f) => f.upvalues.get(b as usize).copied(),
                            _ => None,
                        })
                        .unwrap_or(Value::NIL);
                    self.set_reg(base, a, v);
                }

                OpCode::SetUpval => {
                    let v = self.reg(base, a);
                    if let Some(r) = self.frames.last().and_then(|f| f.function) {
                        self.heap.write_barrier(r, v);
                        if let Object::Function(f) = self.heap.get_mut(r) {
                            if let Some(slot) = f.upvalues.get_mut(b as usize) {
                                *slot = v;
                            }
                        }
                    }
                }

                OpCode::Closure => self.make_closure(base, a, get_bx(instruction))?,

                OpCode::NewList => {
                    let r = self.heap.allocate(Object::List(Vec::new()));
                    self.set_reg(base, a, Value::object(r));
                }

                OpCode::NewTable => {
                    let r = self.heap.allocate(Object::Table(TableObj::default()));
                    self.set_reg(base, a, Value::object(r));
                }

                OpCode::GetTable => {
                    let v = self.get_table(base, b, c)?;
                    self.set_reg(base, a, v);
                }

                OpCode::SetTable => self.set_table(base, a, b, c)?,

                OpCode::GetIter => {
                    let existing = self.reg(base, a);
                    if self.heap.instance_method(existing, "next").is_some() {
                        // An iterator instance is already in place; this is
                        // the re-execution after `iterator` returned.
                    } else {
                        let obj = self.reg(base, b);
                        if let Some(m) = self.heap.instance_method(obj, "iterator") {
                            // Re-execute GETITER once the call has delivered
                            // the iterator into R[A].
                            self.frames.last_mut().expect("no active frame").ip -= 1;
                            self.push_operator_frame(m, obj, None, a)?;
                        } else {
                            self.set_reg(base, a, obj);
                        }
                    }
                }

                OpCode::TForCall => self.iterate_step(base, a, b)?,

                OpCode::TForLoop => {
                    let next = self.reg(base, a + 2);
                    if !next.is_nil() {
                        self.set_reg(base, a + 1, next);
                        let offset = get_sbx(instruction);
                        let frame = self.frames.last_mut().expect("no active frame");
                        frame.ip = (frame.ip as i64 + offset as i64) as usize;
                    }
                }

                OpCode::Import => {
                    let key = self.constant(get_bx(instruction))?;
                    let Some(name) = self.heap.as_str(key).map(|s| s.to_string()) else {
                        return Err(self.error("Module name must be a string"));
                    };
                    let v = match self.module_cache.get(&name) {
                        Some(&cached) => cached,
                        None => self.load_module(&name)?,
                    };
                    self.set_reg(base, a, v);
                }

                OpCode::Export => {
                    if let Some(module) = self.current_module {
                        let key = self.constant(get_bx(instruction))?;
                        let value = self.reg(base, a);
                        self.heap.table_set(module, key, value);
                    }
                }

                OpCode::Slice => self.slice(base, a, b, c)?,

                OpCode::Print => {
                    let parts: Vec<String> = (0..b)
                        .map(|i| self.heap.display_value(self.reg(base, a + i)))
                        .collect();
                    writeln!(self.out, "{}", parts.join(" ")).ok();
                }

                OpCode::TestSet
                | OpCode::TailCall
                | OpCode::SelfOp
                | OpCode::ForLoop
                | OpCode::ForPrep => {
                    return Err(self.error(format!(
                        "Opcode {} is reserved and should never be emitted",
                        op
                    )));
                }
            }
        }
    }

    // ----- Register and constant access -----

    #[inline]
    fn reg(&self, base: usize, i: u32) -> Value {
        self.stack[base + i as usize]
    }

    #[inline]
    fn set_reg(&mut self, base: usize, i: u32, v: Value) {
        self.stack[base + i as usize] = v;
    }

    fn constant(&mut self, bx: u32) -> Result<Value, RuntimeError> {
        let v = self
            .frames
            .last()
            .and_then(|f| f.chunk.constants.get(bx as usize).copied());
        match v {
            Some(v) => Ok(v),
            None => Err(self.error(format!("Invalid constant index {}", bx))),
        }
    }

    fn ensure_stack(&mut self, required: usize) {
        if self.stack.len() < required + FRAME_WINDOW {
            self.stack.resize(required + FRAME_WINDOW, Value::NIL);
        }
    }

    // ----- Calls and returns -----

    fn push_frame(
        &mut self,
        function: ObjRef,
        frame_base: usize,
        dest_reg: u32,
    ) -> Result<(), RuntimeError> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(self.error("Stack overflow"));
        }
        let chunk = match self.heap.get(function) {
            Object::Function(f) => f.chunk.clone(),
            _ => return Err(self.error("Callee is not a function")),
        };
        self.frames
            .push(CallFrame::new(Some(function), chunk, frame_base, dest_reg));
        self.stack_top = self.stack_top.max(frame_base + FRAME_WINDOW);
        self.ensure_stack(self.stack_top);
        Ok(())
    }

    /// Internal call used by operator overloading, `iterator` and `next`
    /// dispatch: a fresh window above the stack top with the receiver as
    /// the first argument. The result lands in the caller's R[dest].
    fn push_operator_frame(
        &mut self,
        method: Value,
        receiver: Value,
        arg: Option<Value>,
        dest: u32,
    ) -> Result<(), RuntimeError> {
        if !method.is_object() {
            return Err(self.error("Operator method is not a function"));
        }
        let call_base = self.stack_top;
        self.ensure_stack(call_base + FRAME_WINDOW);
        self.stack[call_base] = method;
        self.stack[call_base + 1] = receiver;
        if let Some(arg) = arg {
            self.stack[call_base + 2] = arg;
        }
        self.push_frame(method.as_object(), call_base, dest)
    }

    fn return_from_frame(
        &mut self,
        value: Value,
        initial_frame: usize,
    ) -> Result<bool, RuntimeError> {
        let frame = self.frames.pop().expect("frame underflow on return");
        if self.frames.len() == initial_frame {
            for slot in frame.base..self.stack_top.min(self.stack.len()) {
                self.stack[slot] = Value::NIL;
            }
            self.stack_top = frame.base;
            return Ok(true);
        }
        let caller = self.frames.last().expect("caller frame missing");
        let caller_base = caller.base;
        let new_top = caller_base + FRAME_WINDOW;
        if new_top < self.stack_top {
            for slot in new_top..self.stack_top.min(self.stack.len()) {
                self.stack[slot] = Value::NIL;
            }
            self.stack_top = new_top;
        }
        self.stack[caller_base + frame.dest_reg as usize] = value;
        Ok(false)
    }

    /// CALL A B: R[A] is the callee, R[A+1..A+B-1] the arguments.
    fn call_value(&mut self, base: usize, a: u32, b: u32) -> Result<(), RuntimeError> {
        let callee = self.reg(base, a);
        if !callee.is_object() {
            self.set_reg(base, a, Value::NIL);
            return Ok(());
        }
        let callee_ref = callee.as_object();

        match self.heap.get(callee_ref) {
            Object::Native(n) => {
                let imp = n.imp;
                let name = n.name.clone();
                let args: Vec<Value> = (1..b).map(|i| self.reg(base, a + i)).collect();
                let result = match imp {
                    NativeImpl::Builtin(f) => {
                        let mut ctx = NativeCtx {
                            heap: &mut self.heap,
                            out: &mut *self.out,
                        };
                        f(&mut ctx, &args)
                    }
                    NativeImpl::Foreign(f) => {
                        let v = native::call_foreign(&mut self.heap, f, &args);
                        if v.is_object() && !self.heap.is_live(v.as_object()) {
                            Err("returned an invalid object".to_string())
                        } else {
                            Ok(v)
                        }
                    }
                };
                match result {
                    Ok(v) => {
                        self.set_reg(base, a, v);
                        Ok(())
                    }
                    Err(msg) => Err(self.error(format!("In native fn {}: {}", name, msg))),
                }
            }

            Object::Function(f) => {
                let arity = f.arity as u32;
                let name = f.name.clone();
                let mut argc = b.saturating_sub(1);

                // A call through `mod.f(x)` passes the module as an
                // implicit first argument; drop it when the callee does
                // not expect it.
                if argc == arity + 1 && argc > 0 && self.heap.is_module(self.reg(base, a + 1)) {
                    for i in 1..argc {
                        let v = self.reg(base, a + i + 1);
                        self.set_reg(base, a + i, v);
                    }
                    argc -= 1;
                }

                if argc != arity {
                    return Err(self.error(format!(
                        "Function '{}' expects {} arguments, got {}",
                        name, arity, argc
                    )));
                }
                self.push_frame(callee_ref, base + a as usize, a)
            }

            Object::Class(cl) => {
                let init = cl.methods.get("init").copied();
                let class_name = cl.name.clone();
                let instance = self.heap.allocate(Object::Instance(InstanceObj {
                    class: callee_ref,
                    fields: HashMap::new(),
                }));
                let instance_value = Value::object(instance);

                match init {
                    Some(init_fn) => {
                        let init_arity = match init_fn
                            .is_object()
                            .then(|| self.heap.get(init_fn.as_object()))
                        {
                            Some(Object::Function(f)) => f.arity as u32,
                            _ => return Err(self.error("Class init is not a function")),
                        };
                        let argc = b.saturating_sub(1);
                        if argc + 1 != init_arity {
                            return Err(self.error(format!(
                                "Class '{}' constructor expects {} arguments, got {}",
                                class_name,
                                init_arity - 1,
                                argc
                            )));
                        }
                        // Shift arguments right and insert the instance as
                        // the implicit first argument.
                        for i in (1..b).rev() {
                            let v = self.reg(base, a + i);
                            self.set_reg(base, a + i + 1, v);
                        }
                        self.set_reg(base, a + 1, instance_value);
                        // init returns `this`, which lands in R[A].
                        self.push_frame(init_fn.as_object(), base + a as usize, a)
                    }
                    None => {
                        if b > 1 {
                            return Err(self.error(format!(
                                "Class '{}' takes no constructor arguments",
                                class_name
                            )));
                        }
                        self.set_reg(base, a, instance_value);
                        Ok(())
                    }
                }
            }

            _ => {
                self.set_reg(base, a, Value::NIL);
                Ok(())
            }
        }
    }

    // ----- Arithmetic and comparison helpers -----

    fn arith(
        &mut self,
        base: usize,
        a: u32,
        b: u32,
        c: u32,
        method: &str,
        symbol: &str,
        f: fn(f64, f64) -> f64,
    ) -> Result<(), RuntimeError> {
        let v1 = self.reg(base, b);
        let v2 = self.reg(base, c);
        if v1.is_number() && v2.is_number() {
            self.set_reg(base, a, Value::number(f(v1.as_number(), v2.as_number())));
            return Ok(());
        }
        if let Some(m) = self.heap.instance_method(v1, method) {
            return self.push_operator_frame(m, v1, Some(v2), a);
        }
        let (t1, t2) = (self.heap.type_name(v1), self.heap.type_name(v2));
        Err(self.error(format!(
            "Cannot apply '{}' to {} and {}",
            symbol, t1, t2
        )))
    }

    fn compare_op(
        &mut self,
        base: usize,
        a: u32,
        b: u32,
        c: u32,
        method: &str,
        symbol: &str,
        accept: fn(std::cmp::Ordering) -> bool,
    ) -> Result<(), RuntimeError> {
        let v1 = self.reg(base, b);
        let v2 = self.reg(base, c);
        if (v1.is_number() && v2.is_number())
            || (self.heap.is_string(v1) && self.heap.is_string(v2))
        {
            let ordering = self.heap.compare(v1, v2);
            self.set_reg(base, a, Value::boolean(accept(ordering)));
            return Ok(());
        }
        if let Some(m) = self.heap.instance_method(v1, method) {
            return self.push_operator_frame(m, v1, Some(v2), a);
        }
        let (t1, t2) = (self.heap.type_name(v1), self.heap.type_name(v2));
        Err(self.error(format!(
            "Cannot compare {} and {} with '{}'",
            t1, t2, symbol
        )))
    }

    // ----- Aggregates -----

    fn get_table(&mut self, base: usize, b: u32, c: u32) -> Result<Value, RuntimeError> {
        let obj = self.reg(base, b);
        let key = self.reg(base, c);
        if !obj.is_object() {
            let t = self.heap.type_name(obj);
            return Err(self.error(format!("Attempt to index a {} value", t)));
        }
        let r = obj.as_object();
        match self.heap.get(r) {
            Object::Table(_) | Object::Module(_) => {
                Ok(self.heap.table_get(r, key).unwrap_or(Value::NIL))
            }
            Object::List(items) => {
                if !key.is_number() {
                    return Err(self.error("List index must be a number"));
                }
                let len = items.len() as i64;
                let mut idx = key.as_number() as i64;
                if idx < 0 {
                    idx += len;
                }
                if idx >= 0 && idx < len {
                    Ok(items[idx as usize])
                } else {
                    Ok(Value::NIL)
                }
            }
            Object::Instance(instance) => {
                let Some(name) = self.heap.as_str(key) else {
                    return Err(self.error("Instance member key must be a string"));
                };
                if let Some(&field) = instance.fields.get(name) {
                    return Ok(field);
                }
                // Fall back to the class; the method is returned unbound
                // and `this` is supplied at the call site.
                match self.heap.get(instance.class) {
                    Object::Class(class) => {
                        Ok(class.methods.get(name).copied().unwrap_or(Value::NIL))
                    }
                    _ => Ok(Value::NIL),
                }
            }
            _ => {
                let t = self.heap.type_name(obj);
                Err(self.error(format!("Attempt to index a {} value", t)))
            }
        }
    }

    fn set_table(&mut self, base: usize, a: u32, b: u32, c: u32) -> Result<(), RuntimeError> {
        let obj = self.reg(base, a);
        let key = self.reg(base, b);
        let val = self.reg(base, c);
        if !obj.is_object() {
            let t = self.heap.type_name(obj);
            return Err(self.error(format!("Cannot assign into a {} value", t)));
        }
        let r = obj.as_object();
        match self.heap.get(r) {
            Object::Table(_) => {
                self.heap.table_set(r, key, val);
                Ok(())
            }
            Object::List(items) => {
                if !key.is_number() {
                    return Err(self.error("List index must be a number"));
                }
                let len = items.len() as i64;
                let mut idx = key.as_number() as i64;
                if idx < 0 {
                    idx += len;
                }
                if idx >= 0 && idx < len {
                    self.heap.write_barrier(r, val);
                    if let Object::List(items) = self.heap.get_mut(r) {
                        items[idx as usize] = val;
                    }
                    Ok(())
                } else if idx == len {
                    // Writing exactly one past the end appends.
                    self.heap.list_push(r, val);
                    Ok(())
                } else {
                    Err(self.error("List index out of range"))
                }
            }
            Object::Instance(_) => {
                let Some(name) = self.heap.as_str(key).map(|s| s.to_string()) else {
                    return Err(self.error("Instance member key must be a string"));
                };
                self.heap.write_barrier(r, val);
                if let Object::Instance(instance) = self.heap.get_mut(r) {
                    instance.fields.insert(name, val);
                }
                Ok(())
            }
            Object::Module(_) => Err(self.error("Module exports are read-only")),
            _ => {
                let t = self.heap.type_name(obj);
                Err(self.error(format!("Cannot assign into a {} value", t)))
            }
        }
    }

    /// TFORCALL: drive one iteration step over the state block at `s`.
    /// The loop result lands in R[A] (nil when exhausted): the key for
    /// tables, the element for lists, the `next` result for instances.
    fn iterate_step(&mut self, base: usize, a: u32, s: u32) -> Result<(), RuntimeError> {
        let iter = self.reg(base, s + 4);

        if let Some(m) = self.heap.instance_method(iter, "next") {
            return self.push_operator_frame(m, iter, None, a);
        }

        if self.heap.is_table(iter) {
            let last = self.reg(base, s + 1);
            match self.heap.table_next(iter.as_object(), last) {
                Some((k, v)) => {
                    self.set_reg(base, a, k);
                    self.set_reg(base, a + 1, v);
                }
                None => self.set_reg(base, a, Value::NIL),
            }
            return Ok(());
        }

        let iterable = self.reg(base, s);
        if self.heap.is_list(iterable) {
            // The cursor lives in the iterator slot, replacing the list
            // reference GETITER left there.
            let cursor = if iter.is_number() {
                iter.as_number() as i64 + 1
            } else {
                0
            };
            let element = match self.heap.get(iterable.as_object()) {
                Object::List(items) => {
                    if cursor >= 0 && (cursor as usize) < items.len() {
                        Some(items[cursor as usize])
                    } else {
                        None
                    }
                }
                _ => None,
            };
            match element {
                Some(element) => {
                    self.set_reg(base, a, element);
                    self.set_reg(base, a + 1, Value::number(cursor as f64));
                    self.set_reg(base, s + 4, Value::number(cursor as f64));
                }
                None => self.set_reg(base, a, Value::NIL),
            }
            return Ok(());
        }

        self.set_reg(base, a, Value::NIL);
        Ok(())
    }

    /// SLICE A B C: R[A] = R[B][R[C] : R[C+1]] for lists and strings.
    fn slice(&mut self, base: usize, a: u32, b: u32, c: u32) -> Result<(), RuntimeError> {
        let obj = self.reg(base, b);
        let start_v = self.reg(base, c);
        let end_v = self.reg(base, c + 1);
        if !start_v.is_number() || !end_v.is_number() {
            return Err(self.error("Slice bounds must be numbers"));
        }
        let mut start = start_v.as_number() as i64;
        let mut end = end_v.as_number() as i64;

        if obj.is_object() {
            match self.heap.get(obj.as_object()) {
                Object::List(items) => {
                    let len = items.len() as i64;
                    if start < 0 {
                        start += len;
                    }
                    if end < 0 {
                        end += len;
                    }
                    let start = start.max(0) as usize;
                    let end = (end.min(len)).max(0) as usize;
                    let slice: Vec<Value> = if start < end {
                        items[start..end].to_vec()
                    } else {
                        Vec::new()
                    };
                    let r = self.heap.allocate(Object::List(slice));
                    self.set_reg(base, a, Value::object(r));
                    return Ok(());
                }
                Object::Str(s) => {
                    let chars: Vec<char> = s.chars().collect();
                    let len = chars.len() as i64;
                    if start < 0 {
                        start += len;
                    }
                    if end < 0 {
                        end += len;
                    }
                    let start = start.max(0) as usize;
                    let end = (end.min(len)).max(0) as usize;
                    let sub: String = if start < end {
                        chars[start..end].iter().collect()
                    } else {
                        String::new()
                    };
                    let v = self.heap.alloc_string(sub);
                    self.set_reg(base, a, v);
                    return Ok(());
                }
                _ => {}
            }
        }
        self.set_reg(base, a, Value::NIL);
        Ok(())
    }

    /// CLOSURE: instantiate a function template from the constant pool and
    /// capture its upvalues from the metadata words that follow.
    fn make_closure(&mut self, base: usize, a: u32, bx: u32) -> Result<(), RuntimeError> {
        let template_val = self.constant(bx)?;
        if !template_val.is_object() {
            return Err(self.error("CLOSURE operand is not a function"));
        }
        let template_ref = template_val.as_object();
        let (name, params, arity, chunk, upvalue_count) = match self.heap.get(template_ref) {
            Object::Function(f) => (
                f.name.clone(),
                f.params.clone(),
                f.arity,
                f.chunk.clone(),
                f.upvalues.len(),
            ),
            _ => return Err(self.error("CLOSURE operand is not a function")),
        };

        let mut captured = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let word = {
                let frame = self.frames.last_mut().expect("no active frame");
                let Some(&w) = frame.chunk.code.get(frame.ip) else {
                    return Err(self.error("Truncated upvalue capture metadata"));
                };
                frame.ip += 1;
                w
            };
            let index = get_b(word);
            if OpCode::from_u8(get_op(word)) == Some(OpCode::Move) {
                // Capture a local from the creating frame.
                captured.push(self.reg(base, index));
            } else {
                // Forward one of the creating function's own upvalues.
                let v = self
                    .frames
                    .last()
                    .and_then(|f| f.function)
                    .and_then(|r| match self.heap.get(r) {
                        Object::Function(f) => f.upvalues.get(index as usize).copied(),
                        _ => None,
                    })
                    .unwrap_or(Value::NIL);
                captured.push(v);
            }
        }

        let closure = self.heap.allocate(Object::Function(crate::heap::FunctionObj {
            name,
            params,
            arity,
            chunk,
            upvalues: captured,
            module: self.current_module,
        }));
        self.set_reg(base, a, Value::object(closure));
        Ok(())
    }

    // ----- Garbage collection -----

    /// Run a full collection cycle. Called only between instructions, when
    /// everything live is reachable from the roots enumerated here.
    fn collect_garbage(&mut self) {
        for i in 0..self.stack_top.min(self.stack.len()) {
            let v = self.stack[i];
            self.heap.mark_value(v);
        }
        for v in self.globals.values() {
            self.heap.mark_value(*v);
        }
        for v in self.module_cache.values() {
            self.heap.mark_value(*v);
        }
        if let Some(m) = self.current_module {
            self.heap.mark_object(m);
        }
        for idx in 0..self.frames.len() {
            if let Some(f) = self.frames[idx].function {
                self.heap.mark_object(f);
            }
            let chunk = self.frames[idx].chunk.clone();
            for &c in &chunk.constants {
                self.heap.mark_value(c);
            }
        }
        self.heap.mark_temp_roots();
        self.heap.trace();
        self.heap.sweep();
    }

    // ----- Errors -----

    /// Print the message and a stack trace, set the error flag, and build
    /// the error value that unwinds this `interpret` entry.
    fn error(&mut self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        eprintln!("Runtime Error: {}", message);
        for frame in self.frames.iter().rev() {
            let line = frame.current_line();
            let name = frame.function.and_then(|r| match self.heap.get(r) {
                Object::Function(f) => Some(f.name.clone()),
                _ => None,
            });
            match name {
                Some(name) => eprintln!("  in function {} (line {})", name, line),
                None => eprintln!("  in script (line {})", line),
            }
        }
        self.has_error = true;
        RuntimeError::new(message)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
