//! Single-pass bytecode compiler
//!
//! Walks the AST once and emits a [`Chunk`] for the top-level script plus
//! one chunk per function or method encountered, materialised as Function
//! and Class objects in the constant pool. Variable resolution is
//! locals → upvalues → globals; registers come from a bump allocator that
//! resets to one past the highest live local after every statement.
//!
//! Function and class objects created here are pushed onto the GC's
//! temporary-root stack for the duration of the compile.

use std::collections::HashMap;
use std::rc::Rc;

use quince_syntax::ast::{BinaryOp, Expr, LogicalOp, Method, Program, Stmt, UnaryOp};

use crate::chunk::instruction::*;
use crate::chunk::{Chunk, Instruction};
use crate::error::CompileError;
use crate::heap::{ClassObj, FunctionObj, Heap, Object};
use crate::opcode::OpCode;
use crate::value::{ObjRef, Value};

#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: u32,
    reg: u8,
}

/// One recorded upvalue: a parent local (`is_local`) or a parent upvalue.
/// Deduplicated per (index, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalDesc {
    pub index: u8,
    pub is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Function,
    Method,
}

struct FuncState {
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalDesc>,
    free_reg: u32,
    scope_depth: u32,
    /// Methods resolve enclosing names as globals instead of capturing.
    allow_capture: bool,
}

impl FuncState {
    fn new(allow_capture: bool) -> Self {
        Self {
            chunk: Chunk::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            free_reg: 0,
            scope_depth: 0,
            allow_capture,
        }
    }
}

pub struct Compiler<'h> {
    heap: &'h mut Heap,
    states: Vec<FuncState>,
    strict: bool,
    /// Register holding the value of the most recent declaration or
    /// expression statement; consumed by `export`.
    last_result: u32,
    temp_roots: usize,
}

impl<'h> Compiler<'h> {
    pub fn new(heap: &'h mut Heap) -> Self {
        Self {
            heap,
            states: Vec::new(),
            strict: false,
            last_result: 0,
            temp_roots: 0,
        }
    }

    /// Compile a program into its top-level chunk. Consumes the compiler;
    /// on error no chunk is returned and nothing the compile allocated
    /// stays rooted.
    pub fn compile(mut self, program: &Program) -> Result<Rc<Chunk>, CompileError> {
        self.strict = program.strict;
        self.states.push(FuncState::new(true));

        let result = (|| {
            let mut last_line = 0;
            for stmt in &program.statements {
                self.statement(stmt)?;
                self.reset_free_reg();
                last_line = stmt.line();
            }
            self.emit(make_abc(OpCode::Return, 0, 1, 0), last_line);
            Ok(())
        })();

        self.heap.pop_temp_roots(self.temp_roots);
        result?;
        let root = self.states.swap_remove(0);
        Ok(Rc::new(root.chunk))
    }

    // ----- State helpers -----

    fn state(&self) -> &FuncState {
        self.states.last().expect("compiler state underflow")
    }

    fn state_mut(&mut self) -> &mut FuncState {
        self.states.last_mut().expect("compiler state underflow")
    }

    fn emit(&mut self, instruction: Instruction, line: u32) -> usize {
        let chunk = &mut self.state_mut().chunk;
        chunk.write(instruction, line);
        chunk.code.len() - 1
    }

    fn current_position(&self) -> usize {
        self.state().chunk.code.len()
    }

    fn alloc_reg(&mut self, line: u32) -> Result<u32, CompileError> {
        let state = self.state_mut();
        if state.free_reg > u8::MAX as u32 {
            return Err(CompileError::TooManyRegisters { line });
        }
        let reg = state.free_reg;
        state.free_reg += 1;
        Ok(reg)
    }

    fn free_regs(&mut self, n: u32) {
        let state = self.state_mut();
        state.free_reg = state.free_reg.saturating_sub(n);
    }

    /// After a statement, registers above the highest local are dead.
    fn reset_free_reg(&mut self) {
        let state = self.state_mut();
        let top = state.locals.iter().map(|l| l.reg as u32 + 1).max().unwrap_or(0);
        state.free_reg = top;
    }

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let state = self.state_mut();
        let depth = state.scope_depth;
        while state
            .locals
            .last()
            .is_some_and(|l| l.depth == depth)
        {
            state.locals.pop();
        }
        state.scope_depth -= 1;
        self.reset_free_reg();
    }

    fn declare_local(&mut self, name: &str, reg: u32) {
        let depth = self.state().scope_depth;
        self.state_mut().locals.push(Local {
            name: name.to_string(),
            depth,
            reg: reg as u8,
        });
    }

    fn resolve_local(&self, name: &str) -> Option<u32> {
        self.state()
            .locals
            .iter()
            .rev()
            .find(|l| l.name == name)
            .map(|l| l.reg as u32)
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Result<Option<u8>, CompileError> {
        if level == 0 || !self.states[level].allow_capture {
            return Ok(None);
        }
        let parent_local = self.states[level - 1]
            .locals
            .iter()
            .rev()
            .find(|l| l.name == name)
            .map(|l| l.reg);
        if let Some(reg) = parent_local {
            return Ok(Some(self.add_upvalue(level, reg, true)?));
        }
        if let Some(idx) = self.resolve_upvalue(level - 1, name)? {
            return Ok(Some(self.add_upvalue(level, idx, false)?));
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> Result<u8, CompileError> {
        let upvalues = &mut self.states[level].upvalues;
        for (i, uv) in upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if upvalues.len() >= 256 {
            return Err(CompileError::TooManyUpvalues { line: 0 });
        }
        upvalues.push(UpvalDesc { index, is_local });
        Ok((upvalues.len() - 1) as u8)
    }

    // ----- Constants -----

    fn add_constant(&mut self, value: Value, line: u32) -> Result<u32, CompileError> {
        let idx = self
            .states
            .last_mut()
            .expect("compiler state underflow")
            .chunk
            .add_constant(value, self.heap);
        if idx > MAX_BX as usize {
            return Err(CompileError::TooManyConstants { line });
        }
        Ok(idx as u32)
    }

    fn number_constant(&mut self, n: f64, line: u32) -> Result<u32, CompileError> {
        self.add_constant(Value::number(n), line)
    }

    fn string_constant(&mut self, s: &str, line: u32) -> Result<u32, CompileError> {
        // Reuse an existing constant with the same content before
        // allocating a fresh string.
        let existing = self
            .state()
            .chunk
            .constants
            .iter()
            .position(|&c| self.heap.as_str(c) == Some(s));
        if let Some(idx) = existing {
            return Ok(idx as u32);
        }
        let v = self.heap.alloc_string(s);
        self.heap.push_temp_root(v.as_object());
        self.temp_roots += 1;
        self.add_constant(v, line)
    }

    fn alloc_rooted(&mut self, obj: Object) -> ObjRef {
        let r = self.heap.allocate(obj);
        self.heap.push_temp_root(r);
        self.temp_roots += 1;
        r
    }

    // ----- Jumps -----

    fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.emit(make_asbx(op, 0, 0), line)
    }

    fn patch_jump(&mut self, index: usize, line: u32) -> Result<(), CompileError> {
        let offset = self.current_position() as i32 - index as i32 - 1;
        if offset >= MAX_SBX {
            return Err(CompileError::CodeTooLarge { line });
        }
        let chunk = &mut self.state_mut().chunk;
        let instr = chunk.code[index];
        let op = OpCode::from_u8(get_op(instr)).expect("patching a valid instruction");
        chunk.code[index] = make_asbx(op, get_a(instr), offset);
        Ok(())
    }

    fn emit_loop(&mut self, op: OpCode, a: u32, loop_start: usize, line: u32) -> Result<(), CompileError> {
        let offset = loop_start as i32 - self.current_position() as i32 - 1;
        if offset <= -MAX_SBX {
            return Err(CompileError::CodeTooLarge { line });
        }
        self.emit(make_asbx(op, a, offset), line);
        Ok(())
    }

    // ----- Statements -----

    fn statement(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Var {
                name,
                initializer,
                line,
            } => {
                let reg = match initializer {
                    Some(expr) => self.expression(expr)?,
                    None => {
                        let reg = self.alloc_reg(*line)?;
                        self.emit(make_abc(OpCode::LoadNil, reg, 0, 0), *line);
                        reg
                    }
                };
                self.declare_local(name, reg);
                self.last_result = reg;
                Ok(())
            }

            Stmt::Expression { expr, .. } => {
                self.last_result = self.expression(expr)?;
                Ok(())
            }

            Stmt::If {
                condition,
                then_branch,
                else_branch,
                line,
            } => {
                let cond = self.expression(condition)?;
                // Skip the exit jump when the condition is truthy.
                self.emit(make_abc(OpCode::Test, cond, 0, 1), *line);
                let jump_to_else = self.emit_jump(OpCode::Jmp, *line);

                self.begin_scope();
                for s in then_branch {
                    self.statement(s)?;
                    self.reset_free_reg();
                }
                self.end_scope();

                let jump_to_end = self.emit_jump(OpCode::Jmp, *line);
                self.patch_jump(jump_to_else, *line)?;

                self.begin_scope();
                for s in else_branch {
                    self.statement(s)?;
                    self.reset_free_reg();
                }
                self.end_scope();

                self.patch_jump(jump_to_end, *line)
            }

            Stmt::While {
                condition,
                body,
                line,
            } => {
                let loop_start = self.current_position();
                let cond = self.expression(condition)?;
                self.emit(make_abc(OpCode::Test, cond, 0, 1), *line);
                let jump_to_end = self.emit_jump(OpCode::Jmp, *line);

                self.begin_scope();
                for s in body {
                    self.statement(s)?;
                    self.reset_free_reg();
                }
                self.end_scope();

                self.emit_loop(OpCode::Jmp, 0, loop_start, *line)?;
                self.patch_jump(jump_to_end, *line)
            }

            Stmt::For {
                init,
                condition,
                step,
                body,
                line,
            } => {
                self.begin_scope();
                if let Some(init) = init {
                    self.statement(init)?;
                    self.reset_free_reg();
                }

                let loop_start = self.current_position();
                let jump_to_end = match condition {
                    Some(cond) => {
                        let reg = self.expression(cond)?;
                        self.emit(make_abc(OpCode::Test, reg, 0, 1), *line);
                        Some(self.emit_jump(OpCode::Jmp, *line))
                    }
                    None => None,
                };

                for s in body {
                    self.statement(s)?;
                    self.reset_free_reg();
                }
                if let Some(step) = step {
                    self.expression(step)?;
                    self.reset_free_reg();
                }

                self.emit_loop(OpCode::Jmp, 0, loop_start, *line)?;
                if let Some(jump) = jump_to_end {
                    self.patch_jump(jump, *line)?;
                }
                self.end_scope();
                Ok(())
            }

            Stmt::ForEach {
                var,
                iterable,
                body,
                line,
            } => self.for_each(var, iterable, body, *line),

            Stmt::Return { value, line } => {
                if self.states.len() == 1 {
                    return Err(CompileError::ReturnOutsideFunction { line: *line });
                }
                match value {
                    Some(expr) => {
                        let reg = self.expression(expr)?;
                        self.emit(make_abc(OpCode::Return, reg, 2, 0), *line);
                    }
                    None => {
                        self.emit(make_abc(OpCode::Return, 0, 1, 0), *line);
                    }
                }
                Ok(())
            }

            Stmt::Function {
                name,
                params,
                body,
                line,
            } => {
                let reg = self.emit_closure(name, params, body, FunctionKind::Function, *line)?;
                let name_idx = self.string_constant(name, *line)?;
                self.emit(make_abx(OpCode::SetGlobal, reg, name_idx), *line);
                self.last_result = reg;
                Ok(())
            }

            Stmt::Class {
                name,
                methods,
                line,
            } => {
                let class = self.compile_class(name, methods)?;
                let reg = self.alloc_reg(*line)?;
                let idx = self.add_constant(Value::object(class), *line)?;
                self.emit(make_abx(OpCode::LoadK, reg, idx), *line);
                let name_idx = self.string_constant(name, *line)?;
                self.emit(make_abx(OpCode::SetGlobal, reg, name_idx), *line);
                self.last_result = reg;
                Ok(())
            }

            Stmt::Import { module, line } => {
                let name_idx = self.string_constant(module, *line)?;
                let reg = self.alloc_reg(*line)?;
                self.emit(make_abx(OpCode::Import, reg, name_idx), *line);
                // The leaf segment becomes the binding name.
                let leaf = module.rsplit('.').next().unwrap_or(module).to_string();
                self.declare_local(&leaf, reg);
                self.last_result = reg;
                Ok(())
            }

            Stmt::FromImport {
                module,
                symbols,
                line,
            } => {
                let name_idx = self.string_constant(module, *line)?;
                let mod_reg = self.alloc_reg(*line)?;
                self.emit(make_abx(OpCode::Import, mod_reg, name_idx), *line);
                for symbol in symbols {
                    let sym_idx = self.string_constant(symbol, *line)?;
                    let key_reg = self.alloc_reg(*line)?;
                    self.emit(make_abx(OpCode::LoadK, key_reg, sym_idx), *line);
                    let val_reg = self.alloc_reg(*line)?;
                    self.emit(
                        make_abc(OpCode::GetTable, val_reg, mod_reg, key_reg),
                        *line,
                    );
                    self.declare_local(symbol, val_reg);
                }
                self.last_result = mod_reg;
                Ok(())
            }

            Stmt::Export { inner, line } => {
                self.statement(inner)?;
                let name = match inner.as_ref() {
                    Stmt::Var { name, .. }
                    | Stmt::Function { name, .. }
                    | Stmt::Class { name, .. } => name.clone(),
                    Stmt::Expression {
                        expr: Expr::Identifier { name, .. },
                        ..
                    } => name.clone(),
                    Stmt::Expression {
                        expr: Expr::Member { name, .. },
                        ..
                    } => name.clone(),
                    _ => return Err(CompileError::InvalidExport { line: *line }),
                };
                let name_idx = self.string_constant(&name, *line)?;
                self.emit(make_abx(OpCode::Export, self.last_result, name_idx), *line);
                Ok(())
            }

            Stmt::Block { statements, .. } => {
                self.begin_scope();
                for s in statements {
                    self.statement(s)?;
                    self.reset_free_reg();
                }
                self.end_scope();
                Ok(())
            }
        }
    }

    /// `for (var x in iterable)`: a five-slot state block
    /// `[iterable, last key, next key, next value, iterator]` drives
    /// GETITER / TFORCALL / TFORLOOP.
    fn for_each(
        &mut self,
        var: &str,
        iterable: &Expr,
        body: &[Stmt],
        line: u32,
    ) -> Result<(), CompileError> {
        self.begin_scope();

        let iterable_reg = self.expression(iterable)?;
        let base = self.alloc_reg(line)?;
        self.emit(make_abc(OpCode::Move, base, iterable_reg, 0), line);

        let last_key = self.alloc_reg(line)?;
        let next_key = self.alloc_reg(line)?;
        self.alloc_reg(line)?; // next value
        let iter_reg = self.alloc_reg(line)?;

        // Nil the four state slots above the iterable.
        self.emit(make_abc(OpCode::LoadNil, last_key, 3, 0), line);
        self.emit(make_abc(OpCode::GetIter, iter_reg, base, 0), line);

        let user_reg = self.alloc_reg(line)?;
        self.declare_local(var, user_reg);

        let loop_start = self.current_position();
        self.emit(make_abc(OpCode::TForCall, next_key, base, 0), line);

        // Exit when the step produced nil.
        let nil_reg = self.alloc_reg(line)?;
        self.emit(make_abc(OpCode::LoadNil, nil_reg, 0, 0), line);
        let is_end = self.alloc_reg(line)?;
        self.emit(make_abc(OpCode::Eq, is_end, next_key, nil_reg), line);
        self.emit(make_abc(OpCode::Test, is_end, 0, 0), line);
        let jump_to_end = self.emit_jump(OpCode::Jmp, line);
        self.free_regs(2);

        self.emit(make_abc(OpCode::Move, user_reg, next_key, 0), line);

        for s in body {
            self.statement(s)?;
            self.reset_free_reg();
        }

        self.emit_loop(OpCode::TForLoop, base, loop_start, line)?;
        self.patch_jump(jump_to_end, line)?;

        self.end_scope();
        Ok(())
    }

    fn compile_class(&mut self, name: &str, methods: &[Method]) -> Result<ObjRef, CompileError> {
        let class = self.alloc_rooted(Object::Class(ClassObj {
            name: name.to_string(),
            methods: HashMap::new(),
        }));
        for method in methods {
            let (func, _upvalues) = self.compile_function(
                &method.name,
                &method.params,
                &method.body,
                FunctionKind::Method,
                method.line,
            )?;
            let func_value = Value::object(func);
            self.heap.write_barrier(class, func_value);
            if let Object::Class(c) = self.heap.get_mut(class) {
                c.methods.insert(method.name.clone(), func_value);
            }
        }
        Ok(class)
    }

    /// Compile a nested function and emit CLOSURE plus its capture words.
    /// Returns the register holding the closure.
    fn emit_closure(
        &mut self,
        name: &str,
        params: &[String],
        body: &[Stmt],
        kind: FunctionKind,
        line: u32,
    ) -> Result<u32, CompileError> {
        let (func, upvalues) = self.compile_function(name, params, body, kind, line)?;
        let reg = self.alloc_reg(line)?;
        let idx = self.add_constant(Value::object(func), line)?;
        self.emit(make_abx(OpCode::Closure, reg, idx), line);
        for uv in &upvalues {
            let op = if uv.is_local {
                OpCode::Move
            } else {
                OpCode::GetUpval
            };
            self.emit(make_abc(op, 0, uv.index as u32, 0), line);
        }
        Ok(reg)
    }

    fn compile_function(
        &mut self,
        name: &str,
        params: &[String],
        body: &[Stmt],
        kind: FunctionKind,
        line: u32,
    ) -> Result<(ObjRef, Vec<UpvalDesc>), CompileError> {
        if params.len() > 254 {
            return Err(CompileError::TooManyParameters { line });
        }

        self.states
            .push(FuncState::new(kind == FunctionKind::Function));

        // R0 holds the callee itself; `this` (for methods) and parameters
        // follow from R1.
        self.alloc_reg(line)?;
        if kind == FunctionKind::Method {
            let reg = self.alloc_reg(line)?;
            self.declare_local("this", reg);
        }
        for param in params {
            let reg = self.alloc_reg(line)?;
            self.declare_local(param, reg);
        }

        for s in body {
            self.statement(s)?;
            self.reset_free_reg();
        }

        if kind == FunctionKind::Method && name == "init" {
            // Constructors return `this`.
            self.emit(make_abc(OpCode::Return, 1, 2, 0), line);
        } else {
            self.emit(make_abc(OpCode::Return, 0, 1, 0), line);
        }

        let state = self.states.pop().expect("function state underflow");
        let upvalues = state.upvalues.clone();
        let arity = params.len() + usize::from(kind == FunctionKind::Method);

        let func = self.alloc_rooted(Object::Function(FunctionObj {
            name: name.to_string(),
            params: params.to_vec(),
            arity: arity as u8,
            chunk: Rc::new(state.chunk),
            upvalues: vec![Value::NIL; upvalues.len()],
            module: None,
        }));
        Ok((func, upvalues))
    }

    // ----- Expressions -----

    /// Compile an expression; the result always lands in a register at or
    /// above the pre-expression watermark.
    fn expression(&mut self, expr: &Expr) -> Result<u32, CompileError> {
        match expr {
            Expr::Number { value, line } => {
                let reg = self.alloc_reg(*line)?;
                let idx = self.number_constant(*value, *line)?;
                self.emit(make_abx(OpCode::LoadK, reg, idx), *line);
                Ok(reg)
            }

            Expr::Str { value, line } => {
                let reg = self.alloc_reg(*line)?;
                let idx = self.string_constant(value, *line)?;
                self.emit(make_abx(OpCode::LoadK, reg, idx), *line);
                Ok(reg)
            }

            Expr::Bool { value, line } => {
                let reg = self.alloc_reg(*line)?;
                self.emit(
                    make_abc(OpCode::LoadBool, reg, u32::from(*value), 0),
                    *line,
                );
                Ok(reg)
            }

            Expr::Nil { line } => {
                let reg = self.alloc_reg(*line)?;
                self.emit(make_abc(OpCode::LoadNil, reg, 0, 0), *line);
                Ok(reg)
            }

            Expr::Identifier { name, line } => {
                if let Some(src) = self.resolve_local(name) {
                    let dest = self.alloc_reg(*line)?;
                    self.emit(make_abc(OpCode::Move, dest, src, 0), *line);
                    return Ok(dest);
                }
                let top = self.states.len() - 1;
                if let Some(idx) = self.resolve_upvalue(top, name)? {
                    let dest = self.alloc_reg(*line)?;
                    self.emit(make_abc(OpCode::GetUpval, dest, idx as u32, 0), *line);
                    return Ok(dest);
                }
                let dest = self.alloc_reg(*line)?;
                let name_idx = self.string_constant(name, *line)?;
                self.emit(make_abx(OpCode::GetGlobal, dest, name_idx), *line);
                Ok(dest)
            }

            Expr::This { line } => match self.resolve_local("this") {
                Some(src) => {
                    let dest = self.alloc_reg(*line)?;
                    self.emit(make_abc(OpCode::Move, dest, src, 0), *line);
                    Ok(dest)
                }
                None => Err(CompileError::ThisOutsideMethod { line: *line }),
            },

            Expr::Unary { op, operand, line } => {
                let operand_reg = self.expression(operand)?;
                self.free_regs(1);
                let dest = self.alloc_reg(*line)?;
                let opcode = match op {
                    UnaryOp::Negate => OpCode::Unm,
                    UnaryOp::Not => OpCode::Not,
                };
                self.emit(make_abc(opcode, dest, operand_reg, 0), *line);
                Ok(dest)
            }

            Expr::Binary {
                op,
                left,
                right,
                line,
            } => self.binary(*op, left, right, *line),

            Expr::Logical {
                op,
                left,
                right,
                line,
            } => self.logical(*op, left, right, *line),

            Expr::Assign {
                target,
                value,
                line,
            } => self.assignment(target, value, *line),

            Expr::Ternary {
                condition,
                then_branch,
                else_branch,
                line,
            } => {
                let cond = self.expression(condition)?;
                self.emit(make_abc(OpCode::Test, cond, 0, 1), *line);
                self.free_regs(1);
                let jump_to_else = self.emit_jump(OpCode::Jmp, *line);

                let result = self.expression(then_branch)?;
                let jump_to_end = self.emit_jump(OpCode::Jmp, *line);

                self.patch_jump(jump_to_else, *line)?;
                let else_reg = self.expression(else_branch)?;
                self.emit(make_abc(OpCode::Move, result, else_reg, 0), *line);
                self.free_regs(1);

                self.patch_jump(jump_to_end, *line)?;
                Ok(result)
            }

            Expr::Call { callee, args, line } => self.call(callee, args, *line),

            Expr::Member { object, name, line } => {
                let obj = self.expression(object)?;
                let dest = self.alloc_reg(*line)?;
                let key_idx = self.string_constant(name, *line)?;
                let key_reg = self.alloc_reg(*line)?;
                self.emit(make_abx(OpCode::LoadK, key_reg, key_idx), *line);
                self.emit(make_abc(OpCode::GetTable, dest, obj, key_reg), *line);
                self.free_regs(1);
                Ok(dest)
            }

            Expr::Index {
                object,
                index,
                line,
            } => {
                let obj = self.expression(object)?;
                let key = self.expression(index)?;
                self.free_regs(2);
                let dest = self.alloc_reg(*line)?;
                self.emit(make_abc(OpCode::GetTable, dest, obj, key), *line);
                Ok(dest)
            }

            Expr::Slice {
                object,
                start,
                end,
                line,
            } => {
                let obj = self.expression(object)?;
                // Bounds must sit in two consecutive registers.
                let bounds = self.alloc_reg(*line)?;
                self.alloc_reg(*line)?;
                match start {
                    Some(expr) => {
                        let reg = self.expression(expr)?;
                        self.emit(make_abc(OpCode::Move, bounds, reg, 0), *line);
                        self.free_regs(1);
                    }
                    None => {
                        let idx = self.number_constant(0.0, *line)?;
                        self.emit(make_abx(OpCode::LoadK, bounds, idx), *line);
                    }
                }
                match end {
                    Some(expr) => {
                        let reg = self.expression(expr)?;
                        self.emit(make_abc(OpCode::Move, bounds + 1, reg, 0), *line);
                        self.free_regs(1);
                    }
                    None => {
                        self.emit(make_abc(OpCode::Len, bounds + 1, obj, 0), *line);
                    }
                }
                let dest = self.alloc_reg(*line)?;
                self.emit(make_abc(OpCode::Slice, dest, obj, bounds), *line);
                Ok(dest)
            }

            Expr::List { elements, line } => {
                let list_reg = self.alloc_reg(*line)?;
                self.emit(make_abc(OpCode::NewList, list_reg, 0, 0), *line);
                for (i, element) in elements.iter().enumerate() {
                    let saved = self.state().free_reg;
                    let key_reg = self.alloc_reg(*line)?;
                    let idx = self.number_constant(i as f64, *line)?;
                    self.emit(make_abx(OpCode::LoadK, key_reg, idx), *line);
                    let val_reg = self.expression(element)?;
                    self.emit(
                        make_abc(OpCode::SetTable, list_reg, key_reg, val_reg),
                        *line,
                    );
                    self.state_mut().free_reg = saved;
                }
                Ok(list_reg)
            }

            Expr::Table { entries, line } => {
                let table_reg = self.alloc_reg(*line)?;
                self.emit(make_abc(OpCode::NewTable, table_reg, 0, 0), *line);
                for (key, value) in entries {
                    let saved = self.state().free_reg;
                    let key_reg = self.expression(key)?;
                    let val_reg = self.expression(value)?;
                    self.emit(
                        make_abc(OpCode::SetTable, table_reg, key_reg, val_reg),
                        *line,
                    );
                    self.state_mut().free_reg = saved;
                }
                Ok(table_reg)
            }

            Expr::Function {
                name,
                params,
                body,
                line,
            } => {
                let display_name = name.clone().unwrap_or_else(|| "anonymous".to_string());
                self.emit_closure(&display_name, params, body, FunctionKind::Function, *line)
            }
        }
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        line: u32,
    ) -> Result<u32, CompileError> {
        let left_reg = self.expression(left)?;
        let right_reg = self.expression(right)?;
        self.free_regs(2);
        let dest = self.alloc_reg(line)?;

        let (opcode, swap, invert) = match op {
            BinaryOp::Add => (OpCode::Add, false, false),
            BinaryOp::Sub => (OpCode::Sub, false, false),
            BinaryOp::Mul => (OpCode::Mul, false, false),
            BinaryOp::Div => (OpCode::Div, false, false),
            BinaryOp::Mod => (OpCode::Mod, false, false),
            BinaryOp::Pow => (OpCode::Pow, false, false),
            BinaryOp::Eq => (OpCode::Eq, false, false),
            BinaryOp::Ne => (OpCode::Eq, false, true),
            BinaryOp::Lt => (OpCode::Lt, false, false),
            BinaryOp::Le => (OpCode::Le, false, false),
            BinaryOp::Gt => (OpCode::Lt, true, false),
            BinaryOp::Ge => (OpCode::Le, true, false),
        };

        if swap {
            self.emit(make_abc(opcode, dest, right_reg, left_reg), line);
        } else {
            self.emit(make_abc(opcode, dest, left_reg, right_reg), line);
        }
        if invert {
            self.emit(make_abc(OpCode::Not, dest, dest, 0), line);
        }
        Ok(dest)
    }

    /// `and`/`or` compile to TEST + JMP; there is no dedicated opcode.
    fn logical(
        &mut self,
        op: LogicalOp,
        left: &Expr,
        right: &Expr,
        line: u32,
    ) -> Result<u32, CompileError> {
        let result = self.expression(left)?;
        // and: skip the exit jump while truthy; or: while falsy.
        let c = match op {
            LogicalOp::And => 1,
            LogicalOp::Or => 0,
        };
        self.emit(make_abc(OpCode::Test, result, 0, c), line);
        let jump_to_end = self.emit_jump(OpCode::Jmp, line);

        let right_reg = self.expression(right)?;
        self.emit(make_abc(OpCode::Move, result, right_reg, 0), line);
        self.free_regs(1);

        self.patch_jump(jump_to_end, line)?;
        Ok(result)
    }

    fn assignment(
        &mut self,
        target: &Expr,
        value: &Expr,
        line: u32,
    ) -> Result<u32, CompileError> {
        match target {
            Expr::Identifier { name, .. } => {
                let val_reg = self.expression(value)?;
                if let Some(local) = self.resolve_local(name) {
                    self.emit(make_abc(OpCode::Move, local, val_reg, 0), line);
                    return Ok(val_reg);
                }
                let top = self.states.len() - 1;
                if let Some(idx) = self.resolve_upvalue(top, name)? {
                    self.emit(make_abc(OpCode::SetUpval, val_reg, idx as u32, 0), line);
                    return Ok(val_reg);
                }
                if self.strict {
                    return Err(CompileError::UndefinedVariable {
                        name: name.clone(),
                        line,
                    });
                }
                let name_idx = self.string_constant(name, line)?;
                self.emit(make_abx(OpCode::SetGlobal, val_reg, name_idx), line);
                Ok(val_reg)
            }

            Expr::Member { object, name, .. } => {
                let obj = self.expression(object)?;
                let val_reg = self.expression(value)?;
                let key_idx = self.string_constant(name, line)?;
                let key_reg = self.alloc_reg(line)?;
                self.emit(make_abx(OpCode::LoadK, key_reg, key_idx), line);
                self.emit(make_abc(OpCode::SetTable, obj, key_reg, val_reg), line);
                self.free_regs(1);
                Ok(val_reg)
            }

            Expr::Index { object, index, .. } => {
                let obj = self.expression(object)?;
                let key_reg = self.expression(index)?;
                let val_reg = self.expression(value)?;
                self.emit(make_abc(OpCode::SetTable, obj, key_reg, val_reg), line);
                Ok(val_reg)
            }

            _ => Err(CompileError::InvalidAssignmentTarget { line }),
        }
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], line: u32) -> Result<u32, CompileError> {
        // Fast path: `print(...)` lowers to the PRINT opcode.
        if let Expr::Identifier { name, .. } = callee {
            if name == "print" {
                return self.print_call(args, line);
            }
        }

        // Method call: obj.m(args) resolves the method through GETTABLE
        // and passes the receiver as the first argument.
        if let Expr::Member { object, name, .. } = callee {
            let obj = self.expression(object)?;
            let callee_reg = self.alloc_reg(line)?;
            let key_idx = self.string_constant(name, line)?;
            let key_reg = self.alloc_reg(line)?;
            self.emit(make_abx(OpCode::LoadK, key_reg, key_idx), line);
            self.emit(make_abc(OpCode::GetTable, callee_reg, obj, key_reg), line);
            // `this` overwrites the key slot at callee+1.
            self.emit(make_abc(OpCode::Move, callee_reg + 1, obj, 0), line);

            for (i, arg) in args.iter().enumerate() {
                let target = callee_reg + 2 + i as u32;
                let reg = self.expression(arg)?;
                self.emit(make_abc(OpCode::Move, target, reg, 0), line);
                self.state_mut().free_reg = target + 1;
            }

            let argc = args.len() as u32;
            self.emit(make_abc(OpCode::Call, callee_reg, argc + 2, 1), line);
            self.state_mut().free_reg = callee_reg + 1;
            return Ok(callee_reg);
        }

        // General call.
        let callee_reg = self.expression(callee)?;
        for (i, arg) in args.iter().enumerate() {
            let target = callee_reg + 1 + i as u32;
            let reg = self.expression(arg)?;
            self.emit(make_abc(OpCode::Move, target, reg, 0), line);
            self.state_mut().free_reg = target + 1;
        }

        let argc = args.len() as u32;
        self.emit(make_abc(OpCode::Call, callee_reg, argc + 1, 1), line);
        self.state_mut().free_reg = callee_reg + 1;
        Ok(callee_reg)
    }

    fn print_call(&mut self, args: &[Expr], line: u32) -> Result<u32, CompileError> {
        let saved = self.state().free_reg;
        let base = self.alloc_reg(line)?;
        for _ in 1..args.len() {
            self.alloc_reg(line)?;
        }
        for (i, arg) in args.iter().enumerate() {
            let reg = self.expression(arg)?;
            self.emit(make_abc(OpCode::Move, base + i as u32, reg, 0), line);
            self.state_mut().free_reg = base + args.len() as u32;
        }
        self.emit(make_abc(OpCode::Print, base, args.len() as u32, 0), line);
        self.state_mut().free_reg = saved;

        let result = self.alloc_reg(line)?;
        self.emit(make_abc(OpCode::LoadNil, result, 0, 0), line);
        Ok(result)
    }
}

/// Compile a parsed program against the given heap.
pub fn compile(heap: &mut Heap, program: &Program) -> Result<Rc<Chunk>, CompileError> {
    Compiler::new(heap).compile(program)
}
