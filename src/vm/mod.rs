//! The register-based bytecode interpreter (spec.md §4.5–§4.7).
//!
//! `step` decodes and executes exactly one instruction; `run` drives `step`
//! in a loop and is the only place a runtime failure is turned into a
//! rendered diagnostic.
//! Registers are a single flat `Vec<Value>`; each call frame gets its own
//! 256-register window starting at `sp`, matching the 1-byte register
//! operand width in `opcode.rs`.

pub mod frame;
pub mod import;
pub mod natives;
pub mod opcode;

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::rc::Rc;

use crate::diagnostics::Diagnostics;
use crate::error::BogError;
use crate::gc::{FuncData, Heap, NativeData, Obj, Range, Value};
use crate::module::Module;
use crate::value;

use frame::{Frame, MAX_CALL_DEPTH};
use import::ImportTable;
use natives::Registry;
use opcode::{Op, Reg};

const FRAME_WINDOW: usize = 256;

const TYPE_NONE: u8 = 0;
const TYPE_BOOL: u8 = 1;
const TYPE_INT: u8 = 2;
const TYPE_NUM: u8 = 3;
const TYPE_STR: u8 = 4;
const TYPE_TUPLE: u8 = 5;
const TYPE_LIST: u8 = 6;
const TYPE_MAP: u8 = 7;
const TYPE_ERR: u8 = 8;
const TYPE_RANGE: u8 = 9;
const TYPE_FUNC: u8 = 10;

fn type_id_name(id: u8) -> &'static str {
    match id {
        TYPE_NONE => "none",
        TYPE_BOOL => "bool",
        TYPE_INT => "int",
        TYPE_NUM => "num",
        TYPE_STR => "str",
        TYPE_TUPLE => "tuple",
        TYPE_LIST => "list",
        TYPE_MAP => "map",
        TYPE_ERR => "err",
        TYPE_RANGE => "range",
        TYPE_FUNC => "func",
        _ => "unknown",
    }
}

/// The inverse of `type_id_name`, used by the compiler to encode the `is`/
/// `as` operators' type-name operand as the `u8` `Op::Is`/`Op::As` expect.
pub fn type_id(name: &str) -> Option<u8> {
    match name {
        "none" => Some(TYPE_NONE),
        "bool" => Some(TYPE_BOOL),
        "int" => Some(TYPE_INT),
        "num" => Some(TYPE_NUM),
        "str" => Some(TYPE_STR),
        "tuple" => Some(TYPE_TUPLE),
        "list" => Some(TYPE_LIST),
        "map" => Some(TYPE_MAP),
        "err" => Some(TYPE_ERR),
        "range" => Some(TYPE_RANGE),
        "func" => Some(TYPE_FUNC),
        _ => None,
    }
}

const CONST_NONE: u8 = 0;
const CONST_TRUE: u8 = 1;
const CONST_FALSE: u8 = 2;

/// Host-controlled knobs that change how a running program behaves rather
/// than what it computes (spec.md §6 "EngineOptions"). `engine.rs` is the
/// host-facing name for this same type.
#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    /// Whether `Op::Import` may read `.bog`/`.bogc` files from disk. Off by
    /// default: an embedder that never calls `with_import_files(true)` gets
    /// a VM that cannot touch the filesystem via user scripts.
    pub import_files: bool,
    /// REPL mode changes `Op::Discard` at module level from "error on an
    /// unhandled `err`" to "surface it as the module's result", so each
    /// top-level statement's value (errors included) can be echoed back
    /// (spec.md §4.5 "Discard").
    pub repl: bool,
    /// Upper bound, in bytes, on any single file `Op::Import` may read.
    pub max_import_size: u32,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            import_files: false,
            repl: false,
            max_import_size: 1 << 20,
        }
    }
}

/// Every mutable piece of interpreter state: the register stack, the call
/// stack, the heap, and the two collaborators (natives, imports) a running
/// program can reach into. `module` is the baseline module executed when
/// `frames` is empty, whether that's the host's top-level script or a
/// reentrant import (spec.md §4.6).
pub struct Vm {
    heap: Heap,
    registers: Vec<Value>,
    frames: Vec<Frame>,
    ip: usize,
    sp: usize,
    /// Byte offset of the most recent `LineInfo`, used to locate runtime
    /// errors in the original source (spec.md §7).
    line: u32,
    module: Rc<Module>,
    natives: Registry,
    imports: ImportTable,
    import_values: HashMap<String, Value>,
    options: VmOptions,
    /// The container `Get` just read, valid for exactly the next
    /// instruction — only `Call` consumes it, as the implicit `this` for a
    /// method-style call (spec.md §4.5 "Get/this scratch").
    pending_this: Option<Value>,
}

impl Vm {
    pub fn new(module: Rc<Module>, natives: Registry, options: VmOptions) -> Self {
        Self {
            heap: Heap::new(),
            registers: vec![Value::None; FRAME_WINDOW],
            frames: Vec::new(),
            ip: module.entry as usize,
            sp: 0,
            line: 0,
            module,
            natives,
            imports: ImportTable::new(),
            import_values: HashMap::new(),
            options,
            pending_this: None,
        }
    }

    pub fn natives_mut(&mut self) -> &mut Registry {
        &mut self.natives
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Drives `step` until the top-level module returns, turning the first
    /// runtime failure into a rendered `RuntimeError` with a frame trace.
    pub fn run(&mut self, diagnostics: &mut Diagnostics) -> Result<Value, BogError> {
        loop {
            self.maybe_collect();
            match self.step() {
                Ok(ControlFlow::Continue(())) => continue,
                Ok(ControlFlow::Break(value)) => return Ok(value),
                Err(message) => {
                    let frames: Vec<(String, usize)> =
                        self.frames.iter().rev().map(|f| (format!("in '{}'", f.module.name), f.saved_ip)).collect();
                    diagnostics.runtime_error(message.clone(), self.line as usize, frames);
                    return Err(BogError::RuntimeError(message));
                }
            }
        }
    }

    fn maybe_collect(&mut self) {
        if self.heap.allocations_since_collect > 4096 {
            self.heap.collect(gc_roots(&self.registers, &self.frames));
        }
    }

    fn current_module(&self) -> Rc<Module> {
        self.frames.last().map(|f| f.module.clone()).unwrap_or_else(|| self.module.clone())
    }

    fn current_this(&self) -> Option<Value> {
        self.frames.last().and_then(|f| f.this.clone())
    }

    fn current_capture(&self, n: u8) -> Result<Value, String> {
        self.frames
            .last()
            .and_then(|f| f.captures.get(n as usize))
            .cloned()
            .ok_or_else(|| format!("no capture at index {n}"))
    }

    fn store_capture(&mut self, n: u8, value: Value) -> Result<(), String> {
        let frame = self.frames.last_mut().ok_or_else(|| "no active frame to capture into".to_string())?;
        let slot = frame.captures.get_mut(n as usize).ok_or_else(|| format!("no capture at index {n}"))?;
        *slot = value;
        Ok(())
    }

    fn reg_index(&self, r: Reg) -> usize {
        self.sp + r as usize
    }

    fn ensure_capacity(&mut self, index: usize) {
        if index >= self.registers.len() {
            self.registers.resize(index + 1, Value::None);
        }
    }

    fn get_reg(&self, r: Reg) -> Value {
        self.registers[self.reg_index(r)].clone()
    }

    fn set_reg(&mut self, r: Reg, value: Value) {
        let index = self.reg_index(r);
        self.ensure_capacity(index);
        self.registers[index] = value;
    }

    fn compare(&self, a: &Value, b: &Value) -> Result<std::cmp::Ordering, String> {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => Ok(x.cmp(y)),
            (Value::Str(x), Value::Str(y)) => {
                let Obj::Str(xb) = self.heap.get(*x) else { unreachable!() };
                let Obj::Str(yb) = self.heap.get(*y) else { unreachable!() };
                Ok(xb.cmp(yb))
            }
            _ => {
                let x = value::expect_num(a)?;
                let y = value::expect_num(b)?;
                x.partial_cmp(&y).ok_or_else(|| "cannot order a NaN comparison".to_string())
            }
        }
    }

    fn arith(
        &mut self,
        a: Reg,
        b: Reg,
        c: Reg,
        op_name: &str,
        int_op: fn(i64, i64) -> Option<i64>,
        num_op: fn(f64, f64) -> f64,
    ) -> Result<(), String> {
        let left = self.get_reg(b);
        let right = self.get_reg(c);
        let result = match (&left, &right) {
            (Value::Int(x), Value::Int(y)) => {
                Value::Int(int_op(*x, *y).ok_or_else(|| format!("integer overflow in '{op_name}'"))?)
            }
            _ => Value::Num(num_op(value::expect_num(&left)?, value::expect_num(&right)?)),
        };
        self.set_reg(a, result);
        Ok(())
    }

    fn shift(&mut self, a: Reg, b: Reg, c: Reg, left: bool) -> Result<(), String> {
        let x = value::expect_int(&self.get_reg(b))?;
        let y = value::expect_int(&self.get_reg(c))?;
        if y < 0 {
            return Err("shift by negative amount".to_string());
        }
        let amount = y as u32;
        let result = if amount >= 64 {
            0
        } else if left {
            x.wrapping_shl(amount)
        } else {
            x.wrapping_shr(amount)
        };
        self.set_reg(a, Value::Int(result));
        Ok(())
    }

    fn bitwise(&mut self, a: Reg, b: Reg, c: Reg, op: fn(i64, i64) -> i64) -> Result<(), String> {
        let x = value::expect_int(&self.get_reg(b))?;
        let y = value::expect_int(&self.get_reg(c))?;
        self.set_reg(a, Value::Int(op(x, y)));
        Ok(())
    }

    fn finish_call(&mut self, value: Value) -> ControlFlow<Value> {
        match self.frames.pop() {
            Some(frame) => {
                self.ip = frame.saved_ip;
                self.sp = frame.saved_sp;
                self.line = frame.saved_line;
                self.set_reg(frame.return_register, value);
                ControlFlow::Continue(())
            }
            None => ControlFlow::Break(value),
        }
    }

    /// Runs `module` to completion in an isolated frame/register region,
    /// returning its final value (spec.md §4.6 "Execution protocol"). Used
    /// both for the host's initial call and for reentrant imports.
    fn execute_module(&mut self, module: Rc<Module>) -> Result<Value, BogError> {
        let saved_frames = std::mem::take(&mut self.frames);
        let saved_ip = self.ip;
        let saved_sp = self.sp;
        let saved_line = self.line;
        let saved_module = self.module.clone();

        self.sp = self.registers.len();
        self.ensure_capacity(self.sp + FRAME_WINDOW - 1);
        self.ip = module.entry as usize;
        self.module = module;

        let mut diagnostics = Diagnostics::new();
        let result = self.run(&mut diagnostics);

        self.frames = saved_frames;
        self.ip = saved_ip;
        self.sp = saved_sp;
        self.line = saved_line;
        self.module = saved_module;
        result
    }

    /// Calls a `Value::Func` directly from the host, outside of any running
    /// bytecode (spec.md §6 "call a named function on a map value"). Mirrors
    /// [`Vm::execute_module`]'s save-a-fresh-window/restore shape: the callee
    /// runs in an empty frame stack, so its own `Return` pops zero frames and
    /// `finish_call` hands the result straight back via `ControlFlow::Break`.
    pub fn call_function(&mut self, func: &Value, args: &[Value]) -> Result<Value, BogError> {
        let data: FuncData = match func {
            Value::Func(h) => match self.heap.get(*h) {
                Obj::Func(data) => data.clone(),
                _ => unreachable!("Value::Func handle must point at Obj::Func"),
            },
            other => {
                return Err(BogError::RuntimeError(format!(
                    "cannot call a value of type {}",
                    value::type_name(other, &self.heap)
                )))
            }
        };
        if data.arg_count as usize != args.len() {
            return Err(BogError::RuntimeError(format!(
                "function expects {} arguments, found {}",
                data.arg_count,
                args.len()
            )));
        }

        let saved_frames = std::mem::take(&mut self.frames);
        let saved_ip = self.ip;
        let saved_sp = self.sp;
        let saved_line = self.line;
        let saved_module = self.module.clone();

        self.sp = self.registers.len();
        self.ensure_capacity(self.sp + FRAME_WINDOW - 1);
        for (i, arg) in args.iter().enumerate() {
            self.registers[self.sp + i] = arg.clone();
        }
        self.ip = data.entry_offset as usize;
        self.module = data.module;

        let mut diagnostics = Diagnostics::new();
        let result = self.run(&mut diagnostics);

        self.frames = saved_frames;
        self.ip = saved_ip;
        self.sp = saved_sp;
        self.line = saved_line;
        self.module = saved_module;
        result
    }

    fn do_call(&mut self, ret: Reg, func_reg: Reg, arg_base: Reg, arg_count: u16, carried_this: Option<Value>) -> Result<(), String> {
        let func_value = self.get_reg(func_reg);
        let args: Vec<Value> = (0..arg_count as usize).map(|i| self.registers[self.sp + arg_base as usize + i].clone()).collect();
        match func_value {
            Value::Native(h) => {
                let (name, arity, func) = {
                    let Obj::Native(data) = self.heap.get(h) else { unreachable!() };
                    (data.name.clone(), data.arity, data.func.clone())
                };
                if let Some(expected) = arity {
                    if expected as usize != args.len() {
                        return Err(format!("native '{name}' expects {expected} arguments, found {}", args.len()));
                    }
                }
                let result = func(self, &args).map_err(|e| e.to_string())?;
                self.set_reg(ret, result);
                Ok(())
            }
            Value::Func(h) => {
                if self.frames.len() >= MAX_CALL_DEPTH {
                    return Err("call depth exceeded".to_string());
                }
                let data: FuncData = {
                    let Obj::Func(data) = self.heap.get(h) else { unreachable!() };
                    data.clone()
                };
                if data.arg_count as usize != args.len() {
                    return Err(format!("function expects {} arguments, found {}", data.arg_count, args.len()));
                }
                let new_sp = self.sp + FRAME_WINDOW;
                self.ensure_capacity(new_sp + FRAME_WINDOW - 1);
                for (i, arg) in args.into_iter().enumerate() {
                    self.registers[new_sp + i] = arg;
                }
                let mut frame = Frame::new(self.ip, self.sp, self.line, ret, data.module, data.captures);
                frame.this = carried_this;
                self.frames.push(frame);
                self.ip = data.entry_offset as usize;
                self.sp = new_sp;
                Ok(())
            }
            other => Err(format!("cannot call a value of type {}", value::type_name(&other, &self.heap))),
        }
    }

    fn do_import(&mut self, a: Reg, path: &str) -> Result<(), String> {
        if let Some(value) = self.import_values.get(path) {
            self.set_reg(a, value.clone());
            return Ok(());
        }
        if !self.options.import_files {
            return Err(format!("import failed: file imports are disabled ('{path}')"));
        }
        // The loading marker stays set for the whole compile-then-run span
        // below, not just compilation, so a module that imports itself from
        // its own body hits `begin_load`'s cycle check instead of recursing
        // through `execute_module` forever (see `ImportTable::end_load`).
        self.imports.begin_load(path).map_err(|e| e.to_string())?;
        let module = match self.imports.cached(path) {
            Some(module) => module,
            None => {
                let mut diagnostics = Diagnostics::new();
                match import::load_from_disk(path, self.options.max_import_size, &mut diagnostics) {
                    Ok(compiled) => {
                        let module = Rc::new(compiled);
                        self.imports.cache_module(path, module.clone());
                        module
                    }
                    Err(e) => {
                        self.imports.end_load(path);
                        return Err(e.to_string());
                    }
                }
            }
        };
        let result = self.execute_module(module);
        self.imports.end_load(path);
        let value = result.map_err(|e| e.to_string())?;
        self.import_values.insert(path.to_string(), value.clone());
        self.set_reg(a, value);
        Ok(())
    }

    fn step(&mut self) -> Result<ControlFlow<Value>, String> {
        let carried_this = self.pending_this.take();
        let module = self.current_module();
        let (op, next_ip) = opcode::decode(&module.code, self.ip).map_err(|e| e.0)?;
        self.ip = next_ip;

        match op {
            Op::ConstInt8(a, v) => self.set_reg(a, Value::Int(v as i64)),
            Op::ConstInt32(a, v) => self.set_reg(a, Value::Int(v as i64)),
            Op::ConstInt64(a, v) => self.set_reg(a, Value::Int(v)),
            Op::ConstNum(a, v) => self.set_reg(a, Value::Num(v)),
            Op::ConstPrimitive(a, tag) => {
                let value = match tag {
                    CONST_NONE => Value::None,
                    CONST_TRUE => Value::Bool(true),
                    CONST_FALSE => Value::Bool(false),
                    other => return Err(format!("unknown primitive constant tag {other}")),
                };
                self.set_reg(a, value);
            }
            Op::ConstString(a, offset) => {
                let bytes = module.string_at(offset).to_vec();
                let handle = self.heap.alloc(Obj::Str(bytes));
                self.set_reg(a, Value::Str(handle));
            }

            Op::Add(a, b, c) => self.arith(a, b, c, "+", i64::checked_add, |x, y| x + y)?,
            Op::Sub(a, b, c) => self.arith(a, b, c, "-", i64::checked_sub, |x, y| x - y)?,
            Op::Mul(a, b, c) => self.arith(a, b, c, "*", i64::checked_mul, |x, y| x * y)?,
            Op::Pow(a, b, c) => {
                let left = self.get_reg(b);
                let right = self.get_reg(c);
                let result = match (&left, &right) {
                    (Value::Int(x), Value::Int(y)) if *y >= 0 => {
                        Value::Int(x.checked_pow(*y as u32).ok_or_else(|| "integer overflow in '**'".to_string())?)
                    }
                    _ => Value::Num(value::expect_num(&left)?.powf(value::expect_num(&right)?)),
                };
                self.set_reg(a, result);
            }
            Op::DivFloor(a, b, c) => {
                let left = self.get_reg(b);
                let right = self.get_reg(c);
                let result = match (&left, &right) {
                    (Value::Int(x), Value::Int(y)) => {
                        if *y == 0 {
                            return Err("division by zero".to_string());
                        }
                        Value::Int(floor_div(*x, *y))
                    }
                    _ => Value::Num((value::expect_num(&left)? / value::expect_num(&right)?).floor()),
                };
                self.set_reg(a, result);
            }
            Op::Div(a, b, c) => {
                let x = value::expect_num(&self.get_reg(b))?;
                let y = value::expect_num(&self.get_reg(c))?;
                self.set_reg(a, Value::Num(x / y));
            }
            Op::Mod(a, b, c) => {
                let left = self.get_reg(b);
                let right = self.get_reg(c);
                let result = match (&left, &right) {
                    (Value::Int(x), Value::Int(y)) => {
                        if *y == 0 {
                            return Err("division by zero".to_string());
                        }
                        Value::Int(floor_mod(*x, *y))
                    }
                    _ => Value::Num(value::expect_num(&left)? % value::expect_num(&right)?),
                };
                self.set_reg(a, result);
            }

            Op::BitNot(a, b) => {
                let x = value::expect_int(&self.get_reg(b))?;
                self.set_reg(a, Value::Int(!x));
            }
            Op::BitAnd(a, b, c) => self.bitwise(a, b, c, |x, y| x & y)?,
            Op::BitOr(a, b, c) => self.bitwise(a, b, c, |x, y| x | y)?,
            Op::BitXor(a, b, c) => self.bitwise(a, b, c, |x, y| x ^ y)?,
            Op::BuildRange(a, b, c) => {
                let start = value::expect_int(&self.get_reg(b))?;
                let end = value::expect_int(&self.get_reg(c))?;
                self.set_reg(a, Value::Range(Range { start, end, step: 1 }));
            }

            Op::BoolNot(a, b) => {
                let x = value::expect_bool(&self.get_reg(b))?;
                self.set_reg(a, Value::Bool(!x));
            }
            Op::BoolAnd(a, b, c) => {
                let x = value::expect_bool(&self.get_reg(b))?;
                let y = value::expect_bool(&self.get_reg(c))?;
                self.set_reg(a, Value::Bool(x && y));
            }
            Op::BoolOr(a, b, c) => {
                let x = value::expect_bool(&self.get_reg(b))?;
                let y = value::expect_bool(&self.get_reg(c))?;
                self.set_reg(a, Value::Bool(x || y));
            }

            Op::LShift(a, b, c) => self.shift(a, b, c, true)?,
            Op::RShift(a, b, c) => self.shift(a, b, c, false)?,

            Op::Equal(a, b, c) => {
                let result = value::eql(&self.heap, &self.get_reg(b), &self.get_reg(c));
                self.set_reg(a, Value::Bool(result));
            }
            Op::NotEqual(a, b, c) => {
                let result = !value::eql(&self.heap, &self.get_reg(b), &self.get_reg(c));
                self.set_reg(a, Value::Bool(result));
            }
            Op::LessThan(a, b, c) => {
                let ordering = self.compare(&self.get_reg(b), &self.get_reg(c))?;
                self.set_reg(a, Value::Bool(ordering.is_lt()));
            }
            Op::LessThanEqual(a, b, c) => {
                let ordering = self.compare(&self.get_reg(b), &self.get_reg(c))?;
                self.set_reg(a, Value::Bool(ordering.is_le()));
            }
            Op::GreaterThan(a, b, c) => {
                let ordering = self.compare(&self.get_reg(b), &self.get_reg(c))?;
                self.set_reg(a, Value::Bool(ordering.is_gt()));
            }
            Op::GreaterThanEqual(a, b, c) => {
                let ordering = self.compare(&self.get_reg(b), &self.get_reg(c))?;
                self.set_reg(a, Value::Bool(ordering.is_ge()));
            }
            Op::In(a, b, c) => {
                let item = self.get_reg(b);
                let container = self.get_reg(c);
                let result = value::contains(&self.heap, &item, &container)?;
                self.set_reg(a, Value::Bool(result));
            }

            Op::Move(a, b) => {
                let value = self.get_reg(b);
                self.set_reg(a, value);
                self.set_reg(b, Value::None);
            }
            Op::Copy(a, b) => {
                let value = self.get_reg(b);
                self.set_reg(a, value);
            }
            Op::Negate(a, b) => {
                let result = match self.get_reg(b) {
                    Value::Int(v) => Value::Int(v.wrapping_neg()),
                    Value::Num(v) => Value::Num(-v),
                    other => return Err(format!("cannot negate a value of type {}", value::type_name(&other, &self.heap))),
                };
                self.set_reg(a, result);
            }

            Op::Try(a, b) => {
                let value = self.get_reg(b);
                if matches!(value, Value::Err(_)) {
                    return Ok(self.finish_call(value));
                }
                self.set_reg(a, value);
            }

            Op::Jump(offset) => {
                self.ip = (self.ip as i64 + offset as i64) as usize;
            }
            Op::JumpTrue(a, target) => {
                if value::truthy(&self.heap, &self.get_reg(a)) {
                    self.ip = target as usize;
                }
            }
            Op::JumpFalse(a, target) => {
                if !value::truthy(&self.heap, &self.get_reg(a)) {
                    self.ip = target as usize;
                }
            }
            Op::JumpNone(a, target) => {
                if matches!(self.get_reg(a), Value::None) {
                    self.ip = target as usize;
                }
            }
            Op::JumpNotError(a, target) => {
                if !matches!(self.get_reg(a), Value::Err(_)) {
                    self.ip = target as usize;
                }
            }

            Op::IterInit(a, b) => {
                let container = self.get_reg(b);
                let result = value::new_iterator(&mut self.heap, &container)?;
                self.set_reg(a, result);
            }
            Op::IterNext(a, b) => {
                let Value::Iterator(h) = self.get_reg(b) else {
                    return Err("IterNext requires an iterator value".to_string());
                };
                let result = value::iterator_next(&mut self.heap, h);
                self.set_reg(a, result);
            }

            Op::BuildError(a, b) => {
                let inner = self.get_reg(b);
                let handle = self.heap.alloc(Obj::Err(inner));
                self.set_reg(a, Value::Err(handle));
            }
            Op::UnwrapError(a, b) => match self.get_reg(b) {
                Value::Err(h) => {
                    let Obj::Err(inner) = self.heap.get(h) else { unreachable!() };
                    let inner = inner.clone();
                    self.set_reg(a, inner);
                }
                other => return Err(format!("cannot unwrap a value of type {}", value::type_name(&other, &self.heap))),
            },

            Op::Import(a, strref) => {
                let bytes = module.string_at(strref).to_vec();
                let path = String::from_utf8_lossy(&bytes).into_owned();
                self.do_import(a, &path)?;
            }
            Op::BuildNative(a, strref) => {
                let bytes = module.string_at(strref).to_vec();
                let name = String::from_utf8_lossy(&bytes).into_owned();
                let (arity, func) = self.natives.get(&name).ok_or_else(|| format!("no native registered under '{name}'"))?;
                let handle = self.heap.alloc(Obj::Native(NativeData { name, arity, func }));
                self.set_reg(a, Value::Native(handle));
            }

            Op::BuildTuple(a, base, count) => {
                let items: Vec<Value> = (0..count as usize).map(|i| self.registers[self.sp + base as usize + i].clone()).collect();
                let handle = self.heap.alloc(Obj::Tuple(items));
                self.set_reg(a, Value::Tuple(handle));
            }
            Op::BuildList(a, base, count) => {
                let items: Vec<Value> = (0..count as usize).map(|i| self.registers[self.sp + base as usize + i].clone()).collect();
                let handle = self.heap.alloc(Obj::List(items));
                self.set_reg(a, Value::List(handle));
            }
            Op::BuildMap(a, base, count) => {
                let mut entries = Vec::with_capacity(count as usize);
                for i in 0..count as usize {
                    let key = self.registers[self.sp + base as usize + 2 * i].clone();
                    let value = self.registers[self.sp + base as usize + 2 * i + 1].clone();
                    entries.push((key, value));
                }
                let handle = self.heap.alloc(Obj::Map(entries));
                self.set_reg(a, Value::Map(handle));
            }

            Op::BuildFn(a, arg_count, capture_count, entry) => {
                let data = FuncData {
                    arg_count,
                    entry_offset: entry,
                    module: module.clone(),
                    captures: vec![Value::None; capture_count as usize],
                };
                let handle = self.heap.alloc(Obj::Func(data));
                self.set_reg(a, Value::Func(handle));
            }
            Op::LoadCapture(a, n) => {
                let value = self.current_capture(n)?;
                self.set_reg(a, value);
            }
            Op::StoreCapture(target, value_reg, n) => {
                let value = self.get_reg(value_reg);
                match self.get_reg(target) {
                    Value::Func(h) => {
                        let Obj::Func(data) = self.heap.get_mut(h) else { unreachable!() };
                        let slot = data.captures.get_mut(n as usize).ok_or_else(|| format!("no capture at index {n}"))?;
                        *slot = value;
                    }
                    other => return Err(format!("StoreCapture target must be a func, found {}", value::type_name(&other, &self.heap))),
                }
            }

            Op::Get(a, b, c) => {
                let container = self.get_reg(b);
                let key = self.get_reg(c);
                let result = value::get(&self.heap, &container, &key)?;
                self.set_reg(a, result);
                self.pending_this = Some(container);
            }
            Op::Set(a, b, c) => {
                let container = self.get_reg(a);
                let key = self.get_reg(b);
                let value = self.get_reg(c);
                value::set(&mut self.heap, &container, &key, value)?;
            }

            Op::As(a, b, type_id) => {
                let source = self.get_reg(b);
                let result = value::as_type(&mut self.heap, &source, type_id_name(type_id))?;
                self.set_reg(a, result);
            }
            Op::Is(a, b, type_id) => {
                let source = self.get_reg(b);
                let result = value::is_type(&source, type_id_name(type_id));
                self.set_reg(a, Value::Bool(result));
            }

            Op::Call(ret, func_reg, arg_base, arg_count) => {
                self.do_call(ret, func_reg, arg_base, arg_count, carried_this)?;
            }
            Op::Return(r) => {
                let value = self.get_reg(r);
                return Ok(self.finish_call(value));
            }
            Op::ReturnNone => return Ok(self.finish_call(Value::None)),

            Op::LoadThis(a) => {
                let this = self.current_this().ok_or_else(|| "no 'this' bound in the current frame".to_string())?;
                self.set_reg(a, this);
            }
            Op::Discard(a) => {
                let value = self.get_reg(a);
                if self.options.repl && self.frames.is_empty() {
                    return Ok(self.finish_call(value));
                }
                if matches!(value, Value::Err(_)) {
                    return Err("discarded an error value without handling it".to_string());
                }
            }
            Op::LineInfo(offset) => self.line = offset,
        }
        Ok(ControlFlow::Continue(()))
    }
}

/// Floored integer division (spec.md §4.4 `//`): rounds toward negative
/// infinity rather than toward zero, unlike `i64::div_euclid`'s Euclidean
/// rounding — the two diverge whenever the divisor is negative.
fn floor_div(x: i64, y: i64) -> i64 {
    let q = x / y;
    let r = x % y;
    if r != 0 && (r < 0) != (y < 0) {
        q - 1
    } else {
        q
    }
}

/// The remainder consistent with [`floor_div`]: `x == floor_div(x, y) * y +
/// floor_mod(x, y)` always holds.
fn floor_mod(x: i64, y: i64) -> i64 {
    let r = x % y;
    if r != 0 && (r < 0) != (y < 0) {
        r + y
    } else {
        r
    }
}

fn gc_roots<'a>(registers: &'a [Value], frames: &'a [Frame]) -> impl Iterator<Item = &'a Value> {
    registers.iter().chain(frames.iter().flat_map(|f| f.this.iter().chain(f.captures.iter())))
}

/// Runs `module` from a fresh `Vm`, the entry point `engine.rs` drives.
pub fn run_module(module: Rc<Module>, natives: Registry, options: VmOptions, diagnostics: &mut Diagnostics) -> Result<Value, BogError> {
    let mut vm = Vm::new(module, natives, options);
    vm.run(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::opcode::encode;

    fn build(ops: &[Op]) -> Rc<Module> {
        let mut code = Vec::new();
        for op in ops {
            encode(*op, &mut code);
        }
        Rc::new(Module::new("<test>", code, Vec::new(), 0))
    }

    #[test]
    fn runs_straight_line_arithmetic_and_returns() {
        let module = build(&[Op::ConstInt8(0, 2), Op::ConstInt8(1, 3), Op::Add(2, 0, 1), Op::Return(2)]);
        let mut vm = Vm::new(module, Registry::new(), VmOptions::default());
        let mut diagnostics = Diagnostics::new();
        let result = vm.run(&mut diagnostics).unwrap();
        assert!(matches!(result, Value::Int(5)));
    }

    #[test]
    fn int_and_num_promote_under_addition() {
        let module = build(&[Op::ConstInt8(0, 2), Op::ConstNum(1, 0.5), Op::Add(2, 0, 1), Op::Return(2)]);
        let mut vm = Vm::new(module, Registry::new(), VmOptions::default());
        let mut diagnostics = Diagnostics::new();
        let result = vm.run(&mut diagnostics).unwrap();
        assert!(matches!(result, Value::Num(v) if v == 2.5));
    }

    #[test]
    fn discarding_an_error_value_is_a_runtime_error() {
        let module = build(&[Op::ConstInt8(0, 1), Op::BuildError(1, 0), Op::Discard(1), Op::ReturnNone]);
        let mut vm = Vm::new(module, Registry::new(), VmOptions::default());
        let mut diagnostics = Diagnostics::new();
        let result = vm.run(&mut diagnostics);
        assert!(matches!(result, Err(BogError::RuntimeError(_))));
        assert!(!diagnostics.is_empty());
    }

    #[test]
    fn negative_shift_amount_is_a_runtime_error() {
        let module = build(&[Op::ConstInt8(0, 1), Op::ConstInt8(1, -1), Op::LShift(2, 0, 1), Op::Return(2)]);
        let mut vm = Vm::new(module, Registry::new(), VmOptions::default());
        let mut diagnostics = Diagnostics::new();
        assert!(matches!(vm.run(&mut diagnostics), Err(BogError::RuntimeError(_))));
    }

    #[test]
    fn floor_division_rounds_toward_negative_infinity_for_a_negative_divisor() {
        // 7 // -2 == -4 under floored division; `i64::div_euclid` would give
        // -3, which is Euclidean rather than floored.
        let module = build(&[Op::ConstInt8(0, 7), Op::ConstInt8(1, -2), Op::DivFloor(2, 0, 1), Op::Return(2)]);
        let mut vm = Vm::new(module, Registry::new(), VmOptions::default());
        let mut diagnostics = Diagnostics::new();
        let result = vm.run(&mut diagnostics).unwrap();
        assert!(matches!(result, Value::Int(-4)));
    }

    #[test]
    fn modulo_stays_consistent_with_floor_division() {
        let module = build(&[Op::ConstInt8(0, 7), Op::ConstInt8(1, -2), Op::Mod(2, 0, 1), Op::Return(2)]);
        let mut vm = Vm::new(module, Registry::new(), VmOptions::default());
        let mut diagnostics = Diagnostics::new();
        let result = vm.run(&mut diagnostics).unwrap();
        assert!(matches!(result, Value::Int(-1)));
    }

    #[test]
    fn integer_addition_overflow_is_a_runtime_error_not_a_wrap() {
        let module = build(&[Op::ConstInt64(0, i64::MAX), Op::ConstInt8(1, 1), Op::Add(2, 0, 1), Op::Return(2)]);
        let mut vm = Vm::new(module, Registry::new(), VmOptions::default());
        let mut diagnostics = Diagnostics::new();
        assert!(matches!(vm.run(&mut diagnostics), Err(BogError::RuntimeError(_))));
    }

    #[test]
    fn integer_power_overflow_is_a_runtime_error_not_a_wrap() {
        let module = build(&[Op::ConstInt64(0, i64::MAX), Op::ConstInt8(1, 2), Op::Pow(2, 0, 1), Op::Return(2)]);
        let mut vm = Vm::new(module, Registry::new(), VmOptions::default());
        let mut diagnostics = Diagnostics::new();
        assert!(matches!(vm.run(&mut diagnostics), Err(BogError::RuntimeError(_))));
    }

    #[test]
    fn move_clears_the_source_register() {
        let module = build(&[Op::ConstInt8(0, 9), Op::Move(1, 0), Op::Return(0)]);
        let mut vm = Vm::new(module, Registry::new(), VmOptions::default());
        let mut diagnostics = Diagnostics::new();
        let result = vm.run(&mut diagnostics).unwrap();
        assert!(matches!(result, Value::None));
    }

    #[test]
    fn discard_in_repl_mode_surfaces_the_value_instead_of_erroring() {
        let module = build(&[Op::ConstInt8(0, 1), Op::BuildError(1, 0), Op::Discard(1), Op::ReturnNone]);
        let options = VmOptions { repl: true, ..VmOptions::default() };
        let mut vm = Vm::new(module, Registry::new(), options);
        let mut diagnostics = Diagnostics::new();
        let result = vm.run(&mut diagnostics).unwrap();
        assert!(matches!(result, Value::Err(_)));
    }

    #[test]
    fn import_is_rejected_when_file_imports_are_disabled() {
        let module = build(&[Op::Import(0, 0), Op::Return(0)]);
        let mut module = Rc::try_unwrap(module).unwrap();
        let mut pool = crate::module::StringPool::new();
        let off = pool.intern(b"whatever.bog");
        module.strings = pool.into_bytes();
        assert_eq!(off, 0);
        let mut vm = Vm::new(Rc::new(module), Registry::new(), VmOptions::default());
        let mut diagnostics = Diagnostics::new();
        assert!(matches!(vm.run(&mut diagnostics), Err(BogError::RuntimeError(_))));
    }
}
