//! Lowers a parsed [`Tree`] into a [`Module`] (spec.md §4.3).
//!
//! One pass, no separate optimization stage: the parser has already produced
//! a tree and this pass walks it emitting `vm::opcode::Op`s directly.
//! Registers are allocated on a simple stack (locals at the bottom of a
//! function's window, temporaries above them) — no separate allocator pass.

use std::collections::HashMap;

use crate::ast::{AggregateKind, InfixOp, Jump, Literal, MatchCase, Node, NodeId, Pattern, PrefixOp, Tree, TypeOp};
use crate::diagnostics::Diagnostics;
use crate::module::{Module, StringPool};
use crate::vm::opcode::{encode, Op, Reg};
use crate::vm::type_id;

const CONST_NONE: u8 = 0;
const CONST_TRUE: u8 = 1;
const CONST_FALSE: u8 = 2;

/// Compiles `source` end to end (tokenize, parse, compile), the shape
/// `vm::import` needs to turn a `.bog` file into a `Module`. Returns `Err(())`
/// on the first failure in any stage; the caller (which already knows
/// whether it wants a `TokenizeError`/`ParseError`/`CompileError`) renders the
/// message from `diagnostics`.
pub fn compile(source: &str, name: &str, diagnostics: &mut Diagnostics) -> Result<Module, ()> {
    let tree = crate::parser::parse(source, diagnostics).map_err(|_| ())?;
    compile_tree(&tree, name, diagnostics)
}

/// Compiles an already-parsed tree. Split out from [`compile`] so a host
/// embedder that wants to distinguish parse failures from compile failures
/// can call `parser::parse` itself first.
pub fn compile_tree(tree: &Tree, name: &str, diagnostics: &mut Diagnostics) -> Result<Module, ()> {
    let mut compiler = Compiler::new(tree, diagnostics);
    match compiler.compile_module() {
        Ok(entry) => {
            let mut code = Vec::new();
            let mut fixups: Vec<(usize, usize, FixupKind)> = Vec::new();
            let mut bases = Vec::with_capacity(compiler.chunks.len());
            for chunk in &compiler.chunks {
                bases.push(code.len());
                let base_in_chunk = code.len();
                code.extend_from_slice(&chunk.code);
                for &field in &chunk.jump_fields {
                    fixups.push((base_in_chunk, field, FixupKind::AddBase));
                }
                for &(field, target_chunk) in &chunk.fn_fields {
                    fixups.push((base_in_chunk, field, FixupKind::FnEntry(target_chunk)));
                }
            }
            for (chunk_base, field_pos, kind) in fixups {
                let abs_pos = chunk_base + field_pos;
                let current = u32::from_le_bytes(code[abs_pos..abs_pos + 4].try_into().unwrap());
                let value = match kind {
                    FixupKind::AddBase => current + chunk_base as u32,
                    FixupKind::FnEntry(target) => bases[target] as u32,
                };
                code[abs_pos..abs_pos + 4].copy_from_slice(&value.to_le_bytes());
            }
            let entry_offset = bases[entry] as u32;
            Ok(Module::new(name, code, compiler.strings.into_bytes(), entry_offset))
        }
        Err(()) => Err(()),
    }
}

#[derive(Debug, Clone, Copy)]
enum FixupKind {
    AddBase,
    FnEntry(usize),
}

#[derive(Debug, Clone, Copy)]
enum VarRef {
    Local(Reg),
    Capture(u8),
}

#[derive(Debug, Clone, Copy)]
enum CaptureSource {
    ParentLocal(Reg),
    ParentCapture(u8),
}

struct LoopCtx {
    continue_target: usize,
    break_jumps: Vec<usize>,
    result_reg: Reg,
}

/// One function's (or the module's top level's) compiled bytecode and the
/// bookkeeping needed to resolve names and patch jumps within it.
struct Chunk {
    code: Vec<u8>,
    /// Byte positions of every absolute jump-target `u32` field, patched by
    /// `+= chunk base` once every chunk's final offset in the module is known.
    jump_fields: Vec<usize>,
    /// Byte positions of a `BuildFn`'s entry-offset field, paired with the
    /// index of the chunk it should end up pointing at.
    fn_fields: Vec<(usize, usize)>,
}

struct FunctionCtx {
    scopes: Vec<Vec<(String, Reg)>>,
    local_top: u16,
    temp_top: u16,
    captures: Vec<CaptureSource>,
    capture_index: HashMap<String, u8>,
    loops: Vec<LoopCtx>,
}

impl FunctionCtx {
    fn new(param_count: u8) -> Self {
        Self {
            scopes: vec![Vec::new()],
            local_top: param_count as u16,
            temp_top: param_count as u16,
            captures: Vec::new(),
            capture_index: HashMap::new(),
            loops: Vec::new(),
        }
    }

    fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn find_local(&self, name: &str) -> Option<Reg> {
        for scope in self.scopes.iter().rev() {
            for (n, reg) in scope.iter().rev() {
                if n == name {
                    return Some(*reg);
                }
            }
        }
        None
    }
}

struct Compiler<'t, 'd> {
    tree: &'t Tree,
    diagnostics: &'d mut Diagnostics,
    strings: StringPool,
    funcs: Vec<FunctionCtx>,
    chunks: Vec<Chunk>,
    failed: bool,
}

type CResult<T> = Result<T, ()>;

impl<'t, 'd> Compiler<'t, 'd> {
    fn new(tree: &'t Tree, diagnostics: &'d mut Diagnostics) -> Self {
        Self {
            tree,
            diagnostics,
            strings: StringPool::new(),
            funcs: Vec::new(),
            chunks: Vec::new(),
            failed: false,
        }
    }

    fn fail(&mut self, message: impl Into<String>, node: NodeId) -> CResult<Reg> {
        let offset = self.tree.offset(node);
        self.diagnostics.err(message, offset);
        self.failed = true;
        Err(())
    }

    // -- register + chunk plumbing -----------------------------------------

    fn cur(&mut self) -> &mut FunctionCtx {
        self.funcs.last_mut().expect("no active function context")
    }

    fn alloc_temp(&mut self, node: NodeId) -> CResult<Reg> {
        let ctx = self.cur();
        if ctx.temp_top >= 256 {
            return self.fail("function body needs more than 256 registers", node);
        }
        let r = ctx.temp_top as Reg;
        ctx.temp_top += 1;
        Ok(r)
    }

    fn free_temp(&mut self, reg: Reg) {
        let ctx = self.cur();
        if reg as u16 + 1 == ctx.temp_top && reg as u16 >= ctx.local_top {
            ctx.temp_top -= 1;
        }
    }

    fn alloc_local(&mut self, name: String, node: NodeId) -> CResult<Reg> {
        let ctx = self.cur();
        if ctx.local_top >= 256 {
            return self.fail("function body needs more than 256 registers", node);
        }
        let r = ctx.local_top as Reg;
        ctx.local_top += 1;
        ctx.temp_top = ctx.local_top;
        ctx.scopes.last_mut().expect("at least one scope").push((name, r));
        Ok(r)
    }

    fn alias_local(&mut self, name: String, reg: Reg) {
        self.cur().scopes.last_mut().expect("at least one scope").push((name, reg));
    }

    fn code(&mut self) -> &mut Vec<u8> {
        &mut self.chunks.last_mut().expect("no active chunk").code
    }

    fn emit(&mut self, op: Op) {
        let mut bytes = Vec::new();
        encode(op, &mut bytes);
        self.code().extend_from_slice(&bytes);
    }

    fn pos(&mut self) -> usize {
        self.code().len()
    }

    /// Emits `Jump 0` and returns the position of its `i32` offset field, to
    /// be resolved later with [`Self::patch_relative_jump`].
    fn emit_jump_placeholder(&mut self) -> usize {
        let field = self.pos() + 1;
        self.emit(Op::Jump(0));
        field
    }

    fn patch_relative_jump(&mut self, field: usize) {
        let target = self.pos();
        let rel = target as i64 - (field as i64 + 4);
        let bytes = (rel as i32).to_le_bytes();
        self.code()[field..field + 4].copy_from_slice(&bytes);
    }

    fn emit_relative_jump_to(&mut self, target: usize) {
        let field = self.pos() + 1;
        self.emit(Op::Jump(0));
        let rel = target as i64 - (field as i64 + 4);
        let bytes = (rel as i32).to_le_bytes();
        self.code()[field..field + 4].copy_from_slice(&bytes);
    }

    /// Emits a conditional jump with a placeholder absolute target, remembers
    /// the field for the end-of-compile chunk-base pass, and returns its
    /// position for later patching with [`Self::patch_cond_jump`].
    fn emit_cond_jump_placeholder(&mut self, make: impl FnOnce(Reg, u32) -> Op, reg: Reg) -> usize {
        let field = self.pos() + 2;
        self.emit(make(reg, 0));
        self.chunks.last_mut().unwrap().jump_fields.push(field);
        field
    }

    fn patch_cond_jump(&mut self, field: usize) {
        let target = self.pos() as u32;
        self.code()[field..field + 4].copy_from_slice(&target.to_le_bytes());
    }

    fn intern_str(&mut self, bytes: &[u8]) -> u32 {
        self.strings.intern(bytes)
    }

    // -- name resolution -----------------------------------------------------

    fn resolve_var(&mut self, name: &str) -> Option<VarRef> {
        let top = self.funcs.len() - 1;
        self.resolve_var_at(top, name)
    }

    fn resolve_var_at(&mut self, level: usize, name: &str) -> Option<VarRef> {
        if let Some(reg) = self.funcs[level].find_local(name) {
            return Some(VarRef::Local(reg));
        }
        if let Some(&idx) = self.funcs[level].capture_index.get(name) {
            return Some(VarRef::Capture(idx));
        }
        if level == 0 {
            return None;
        }
        let parent_ref = self.resolve_var_at(level - 1, name)?;
        let source = match parent_ref {
            VarRef::Local(reg) => CaptureSource::ParentLocal(reg),
            VarRef::Capture(idx) => CaptureSource::ParentCapture(idx),
        };
        let idx = self.funcs[level].captures.len() as u8;
        self.funcs[level].captures.push(source);
        self.funcs[level].capture_index.insert(name.to_string(), idx);
        Some(VarRef::Capture(idx))
    }

    // -- top level -----------------------------------------------------------

    fn compile_module(&mut self) -> CResult<usize> {
        let chunk_index = self.begin_chunk();
        self.funcs.push(FunctionCtx::new(0));
        let result = self.compile_sequence_as_module(&self.tree.statements.clone());
        self.funcs.pop();
        result?;
        Ok(chunk_index)
    }

    fn begin_chunk(&mut self) -> usize {
        self.chunks.push(Chunk {
            code: Vec::new(),
            jump_fields: Vec::new(),
            fn_fields: Vec::new(),
        });
        self.chunks.len() - 1
    }

    /// Compiles a flat statement sequence that ends the chunk: all but the
    /// last statement are discarded, the last becomes the `Return` value
    /// (spec.md §8 scenario "a bare `error(...)` at module level surfaces the
    /// err value" — only possible if the final statement's value bypasses
    /// `Discard`'s error check; see DESIGN.md).
    fn compile_sequence_as_module(&mut self, stmts: &[NodeId]) -> CResult<()> {
        if stmts.is_empty() {
            self.emit(Op::ReturnNone);
            return Ok(());
        }
        for stmt in &stmts[..stmts.len() - 1] {
            let reg = self.compile_expr(*stmt)?;
            self.emit(Op::Discard(reg));
            self.free_temp(reg);
        }
        let last = self.compile_expr(stmts[stmts.len() - 1])?;
        self.emit(Op::Return(last));
        self.free_temp(last);
        Ok(())
    }

    /// Compiles a block's statements, leaving the last one's value live as
    /// the block's own result (no trailing `Return`).
    fn compile_block_value(&mut self, stmts: &[NodeId]) -> CResult<Reg> {
        if stmts.is_empty() {
            return self.const_none();
        }
        for stmt in &stmts[..stmts.len() - 1] {
            let reg = self.compile_expr(*stmt)?;
            self.emit(Op::Discard(reg));
            self.free_temp(reg);
        }
        self.compile_expr(stmts[stmts.len() - 1])
    }

    fn const_none(&mut self) -> CResult<Reg> {
        let r = self.alloc_temp(0)?;
        self.emit(Op::ConstPrimitive(r, CONST_NONE));
        Ok(r)
    }

    // -- expressions -----------------------------------------------------------

    fn compile_expr(&mut self, id: NodeId) -> CResult<Reg> {
        let node = self.tree.get(id).clone();
        match node {
            Node::Literal(lit) => self.compile_literal(&lit, id),
            Node::Ident(name) => self.compile_ident(&name, id),
            Node::Discard => self.fail("'_' cannot be read as a value", id),
            Node::Prefix { op, rhs } => self.compile_prefix(op, rhs, id),
            Node::Infix { op, lhs, rhs } => self.compile_infix(op, lhs, rhs, id),
            Node::TypeInfix { op, lhs, type_name } => self.compile_type_infix(op, lhs, &type_name, id),
            Node::Index { target, index } => self.compile_index(target, index, id),
            Node::Call { target, args } => self.compile_call(target, &args, id),
            Node::Member { target, name } => self.compile_member(target, &name, id),
            Node::Grouped(inner) => self.compile_expr(inner),
            Node::Aggregate { kind, items } => self.compile_aggregate(kind, &items, id),
            Node::MapItem(_) => self.fail("a map item is not valid outside a map literal", id),
            Node::Let { pattern, value } => self.compile_let(&pattern, value, id),
            Node::Fn { name, params, body } => self.compile_fn(name, &params, body, id),
            Node::Unwrap(_) => self.fail("a pattern is not valid as a standalone expression", id),
            Node::If {
                binding,
                cond,
                body,
                else_branch,
            } => self.compile_if(binding.as_ref(), cond, body, else_branch, id),
            Node::While { binding, cond, body } => self.compile_while(binding.as_ref(), cond, body, id),
            Node::For { pattern, iterable, body } => self.compile_for(&pattern, iterable, body, id),
            Node::Match { scrutinee, cases } => self.compile_match(scrutinee, &cases, id),
            Node::Catch { lhs, binding, rhs } => self.compile_catch(lhs, binding.as_ref(), rhs, id),
            Node::Jump(jump) => self.compile_jump(&jump, id),
            Node::Import { path } => self.compile_import(&path, id),
            Node::Error(inner) => self.compile_error(inner, id),
        }
    }

    fn compile_literal(&mut self, lit: &Literal, id: NodeId) -> CResult<Reg> {
        let r = self.alloc_temp(id)?;
        match lit {
            Literal::Int(v) => {
                if let Ok(v8) = i8::try_from(*v) {
                    self.emit(Op::ConstInt8(r, v8));
                } else if let Ok(v32) = i32::try_from(*v) {
                    self.emit(Op::ConstInt32(r, v32));
                } else {
                    self.emit(Op::ConstInt64(r, *v));
                }
            }
            Literal::Num(v) => self.emit(Op::ConstNum(r, *v)),
            Literal::Str(bytes) => {
                let offset = self.intern_str(bytes);
                self.emit(Op::ConstString(r, offset));
            }
            Literal::Bool(true) => self.emit(Op::ConstPrimitive(r, CONST_TRUE)),
            Literal::Bool(false) => self.emit(Op::ConstPrimitive(r, CONST_FALSE)),
            Literal::None => self.emit(Op::ConstPrimitive(r, CONST_NONE)),
        }
        Ok(r)
    }

    fn compile_ident(&mut self, name: &str, id: NodeId) -> CResult<Reg> {
        if name == "this" && self.resolve_var(name).is_none() {
            let r = self.alloc_temp(id)?;
            self.emit(Op::LoadThis(r));
            return Ok(r);
        }
        match self.resolve_var(name) {
            Some(VarRef::Local(reg)) => {
                let r = self.alloc_temp(id)?;
                self.emit(Op::Copy(r, reg));
                Ok(r)
            }
            Some(VarRef::Capture(idx)) => {
                let r = self.alloc_temp(id)?;
                self.emit(Op::LoadCapture(r, idx));
                Ok(r)
            }
            None => self.fail(format!("'{name}' is not defined"), id),
        }
    }

    fn compile_prefix(&mut self, op: PrefixOp, rhs: NodeId, id: NodeId) -> CResult<Reg> {
        let _ = id;
        let src = self.compile_expr(rhs)?;
        match op {
            PrefixOp::BoolNot => self.emit(Op::BoolNot(src, src)),
            PrefixOp::Neg => self.emit(Op::Negate(src, src)),
            PrefixOp::Pos => {}
            PrefixOp::BitNot => self.emit(Op::BitNot(src, src)),
            PrefixOp::Try => self.emit(Op::Try(src, src)),
        }
        Ok(src)
    }

    fn compile_infix(&mut self, op: InfixOp, lhs: NodeId, rhs: NodeId, id: NodeId) -> CResult<Reg> {
        let _ = id;
        if op.is_assignment() {
            return self.compile_assignment(op, lhs, rhs, id);
        }
        match op {
            InfixOp::And | InfixOp::Or => {
                let a = self.compile_expr(lhs)?;
                let b = self.compile_expr(rhs)?;
                if op == InfixOp::And {
                    self.emit(Op::BoolAnd(a, a, b));
                } else {
                    self.emit(Op::BoolOr(a, a, b));
                }
                self.free_temp(b);
                Ok(a)
            }
            InfixOp::Range => {
                let a = self.compile_expr(lhs)?;
                let b = self.compile_expr(rhs)?;
                self.emit(Op::BuildRange(a, a, b));
                self.free_temp(b);
                Ok(a)
            }
            _ => {
                let a = self.compile_expr(lhs)?;
                let b = self.compile_expr(rhs)?;
                let make: fn(Reg, Reg, Reg) -> Op = match op {
                    InfixOp::Add => Op::Add,
                    InfixOp::Sub => Op::Sub,
                    InfixOp::Mul => Op::Mul,
                    InfixOp::Div => Op::Div,
                    InfixOp::DivFloor => Op::DivFloor,
                    InfixOp::Mod => Op::Mod,
                    InfixOp::Pow => Op::Pow,
                    InfixOp::BitAnd => Op::BitAnd,
                    InfixOp::BitOr => Op::BitOr,
                    InfixOp::BitXor => Op::BitXor,
                    InfixOp::Shl => Op::LShift,
                    InfixOp::Shr => Op::RShift,
                    InfixOp::Lt => Op::LessThan,
                    InfixOp::LtEq => Op::LessThanEqual,
                    InfixOp::Gt => Op::GreaterThan,
                    InfixOp::GtEq => Op::GreaterThanEqual,
                    InfixOp::Eq => Op::Equal,
                    InfixOp::NotEq => Op::NotEqual,
                    InfixOp::In => Op::In,
                    _ => unreachable!("assignment/and/or/range handled above"),
                };
                self.emit(make(a, a, b));
                self.free_temp(b);
                Ok(a)
            }
        }
    }

    fn compile_type_infix(&mut self, op: TypeOp, lhs: NodeId, type_name: &str, id: NodeId) -> CResult<Reg> {
        let Some(tid) = type_id(type_name) else {
            return self.fail(format!("'{type_name}' is not a known type name"), id);
        };
        let src = self.compile_expr(lhs)?;
        match op {
            TypeOp::Is => self.emit(Op::Is(src, src, tid)),
            TypeOp::As => self.emit(Op::As(src, src, tid)),
        }
        Ok(src)
    }

    fn compile_index(&mut self, target: NodeId, index: NodeId, id: NodeId) -> CResult<Reg> {
        let _ = id;
        let container = self.compile_expr(target)?;
        let key = self.compile_expr(index)?;
        self.emit(Op::Get(container, container, key));
        self.free_temp(key);
        Ok(container)
    }

    fn compile_member(&mut self, target: NodeId, name: &str, id: NodeId) -> CResult<Reg> {
        let _ = id;
        let container = self.compile_expr(target)?;
        let key = self.alloc_temp(id)?;
        let offset = self.intern_str(name.as_bytes());
        self.emit(Op::ConstString(key, offset));
        self.emit(Op::Get(container, container, key));
        self.free_temp(key);
        Ok(container)
    }

    /// `target(args...)`. When `target` is a member access (`recv.name(...)`)
    /// the `Get` that reads `name` off `recv` must be the instruction
    /// immediately preceding `Call`, since `this` is only valid for the very
    /// next instruction (spec.md §9) — so args are compiled first and the
    /// method lookup is emitted last.
    fn compile_call(&mut self, target: NodeId, args: &[NodeId], id: NodeId) -> CResult<Reg> {
        if let Node::Member { target: recv, name } = self.tree.get(target).clone() {
            let arg_base = self.compile_contiguous(args)?;
            let recv_reg = self.compile_expr(recv)?;
            let func_reg = self.alloc_temp(id)?;
            let offset = self.intern_str(name.as_bytes());
            let key = self.alloc_temp(id)?;
            self.emit(Op::ConstString(key, offset));
            self.emit(Op::Get(func_reg, recv_reg, key));
            self.free_temp(key);
            self.free_temp(recv_reg);
            let ret = self.alloc_temp(id)?;
            self.emit(Op::Call(ret, func_reg, arg_base, args.len() as u16));
            self.free_temp(func_reg);
            self.free_args(arg_base, args.len());
            return Ok(ret);
        }
        let func_reg = self.compile_expr(target)?;
        let arg_base = self.compile_contiguous(args)?;
        let ret = self.alloc_temp(id)?;
        self.emit(Op::Call(ret, func_reg, arg_base, args.len() as u16));
        self.free_args(arg_base, args.len());
        self.free_temp(func_reg);
        Ok(ret)
    }

    /// Compiles `exprs` into a run of contiguous fresh registers, returning
    /// the first one (or the next free register if `exprs` is empty — `Call`
    /// never dereferences it when `arg_count` is 0).
    fn compile_contiguous(&mut self, exprs: &[NodeId]) -> CResult<Reg> {
        let base = self.cur().temp_top as Reg;
        for e in exprs {
            self.compile_expr(*e)?;
        }
        Ok(base)
    }

    fn free_args(&mut self, base: Reg, count: usize) {
        for i in (0..count).rev() {
            self.free_temp(base + i as Reg);
        }
    }

    fn compile_aggregate(&mut self, kind: AggregateKind, items: &[NodeId], id: NodeId) -> CResult<Reg> {
        match kind {
            AggregateKind::Block => {
                self.cur().push_scope();
                let result = self.compile_block_value(items);
                self.cur().pop_scope();
                result
            }
            AggregateKind::Tuple | AggregateKind::List => {
                let base = self.compile_contiguous(items)?;
                let dst = self.alloc_temp(id)?;
                if kind == AggregateKind::Tuple {
                    self.emit(Op::BuildTuple(dst, base, items.len() as u16));
                } else {
                    self.emit(Op::BuildList(dst, base, items.len() as u16));
                }
                self.free_args(base, items.len());
                // `dst` was allocated after the items, so it sits exactly one
                // past their freed run; this is the invariant alloc_temp/
                // free_temp rely on to keep the stack contiguous.
                Ok(dst)
            }
            AggregateKind::Map => self.compile_map(items, id),
        }
    }

    fn compile_map(&mut self, items: &[NodeId], id: NodeId) -> CResult<Reg> {
        let base = self.cur().temp_top as Reg;
        for item in items {
            let Node::MapItem(map_item) = self.tree.get(*item).clone() else {
                return self.fail("expected a map item", *item);
            };
            match map_item.key {
                Some(key) => {
                    self.compile_expr(key)?;
                }
                None => {
                    let Node::Ident(name) = self.tree.get(map_item.value).clone() else {
                        return self.fail("a map item without an explicit key must be a bare identifier", map_item.value);
                    };
                    let r = self.alloc_temp(map_item.value)?;
                    let offset = self.intern_str(name.as_bytes());
                    self.emit(Op::ConstString(r, offset));
                }
            }
            self.compile_expr(map_item.value)?;
        }
        let dst = self.alloc_temp(id)?;
        self.emit(Op::BuildMap(dst, base, items.len() as u16));
        for i in (0..items.len() * 2).rev() {
            self.free_temp(base + i as Reg);
        }
        Ok(dst)
    }

    fn compile_let(&mut self, pattern: &Pattern, value: NodeId, id: NodeId) -> CResult<Reg> {
        let _ = id;
        let value_reg = self.compile_expr(value)?;
        self.bind_pattern(pattern, value_reg)?;
        Ok(value_reg)
    }

    /// Binds `pattern` against the value already sitting in `value_reg`,
    /// emitting `Get`/`UnwrapError` for any destructuring. Called once at
    /// compile time, but its emitted code re-runs every time control reaches
    /// it (e.g. every iteration of a `for` loop), so it is safe to use on a
    /// register whose contents change at runtime.
    fn bind_pattern(&mut self, pattern: &Pattern, value_reg: Reg) -> CResult<()> {
        match pattern {
            Pattern::Ident(name) => {
                let local = self.alloc_local(name.clone(), 0)?;
                self.emit(Op::Copy(local, value_reg));
                Ok(())
            }
            Pattern::Discard => Ok(()),
            Pattern::Tuple(subs) | Pattern::List(subs) => {
                for (i, sub) in subs.iter().enumerate() {
                    let idx = self.alloc_temp(0)?;
                    self.emit(Op::ConstInt32(idx, i as i32));
                    let item = self.alloc_temp(0)?;
                    self.emit(Op::Get(item, value_reg, idx));
                    self.free_temp(idx);
                    self.bind_pattern(sub, item)?;
                    self.free_temp(item);
                }
                Ok(())
            }
            Pattern::Map(entries) => {
                for (key_name, sub) in entries {
                    let Some(key_name) = key_name.clone().or_else(|| match sub {
                        Pattern::Ident(n) => Some(n.clone()),
                        _ => None,
                    }) else {
                        self.diagnostics.err("a map pattern entry without an explicit key must bind a plain identifier", 0);
                        self.failed = true;
                        return Err(());
                    };
                    let key = self.alloc_temp(0)?;
                    let offset = self.intern_str(key_name.as_bytes());
                    self.emit(Op::ConstString(key, offset));
                    let item = self.alloc_temp(0)?;
                    self.emit(Op::Get(item, value_reg, key));
                    self.free_temp(key);
                    self.bind_pattern(sub, item)?;
                    self.free_temp(item);
                }
                Ok(())
            }
            Pattern::Error(inner) => {
                let unwrapped = self.alloc_temp(0)?;
                self.emit(Op::UnwrapError(unwrapped, value_reg));
                self.bind_pattern(inner, unwrapped)?;
                self.free_temp(unwrapped);
                Ok(())
            }
        }
    }

    fn compile_fn(&mut self, name: Option<String>, params: &[Pattern], body: NodeId, id: NodeId) -> CResult<Reg> {
        // A named `fn` pre-declares its own local so the body can recurse
        // through a capture of this same register (see DESIGN.md "recursion").
        let named_local = match &name {
            Some(n) => Some(self.alloc_local(n.clone(), id)?),
            None => None,
        };

        let chunk_index = self.begin_chunk();
        self.funcs.push(FunctionCtx::new(params.len() as u8));
        self.funcs.last_mut().unwrap().push_scope();
        let mut body_result: CResult<()> = Ok(());
        for (i, pattern) in params.iter().enumerate() {
            if let Pattern::Ident(pname) = pattern {
                self.alias_local(pname.clone(), i as Reg);
            } else if let Err(e) = self.bind_pattern(pattern, i as Reg) {
                body_result = Err(e);
                break;
            }
        }
        if body_result.is_ok() {
            match self.compile_expr(body) {
                Ok(r) => self.emit(Op::Return(r)),
                Err(e) => body_result = Err(e),
            }
        }
        let ctx = self.funcs.pop().unwrap();
        if let Err(e) = body_result {
            return Err(e);
        }

        let dst = self.alloc_temp(id)?;
        let fn_field = self.pos() + 4;
        self.emit(Op::BuildFn(dst, params.len() as u8, ctx.captures.len() as u8, 0));
        self.chunks.last_mut().unwrap().fn_fields.push((fn_field, chunk_index));

        for (idx, source) in ctx.captures.iter().enumerate() {
            let value_reg = match *source {
                CaptureSource::ParentLocal(reg) => reg,
                CaptureSource::ParentCapture(parent_idx) => {
                    let tmp = self.alloc_temp(id)?;
                    self.emit(Op::LoadCapture(tmp, parent_idx));
                    tmp
                }
            };
            self.emit(Op::StoreCapture(dst, value_reg, idx as u8));
            if matches!(source, CaptureSource::ParentCapture(_)) {
                self.free_temp(value_reg);
            }
        }

        if let Some(local) = named_local {
            self.emit(Op::Copy(local, dst));
            self.free_temp(dst);
            Ok(local)
        } else {
            Ok(dst)
        }
    }

    fn compile_if(
        &mut self,
        binding: Option<&Pattern>,
        cond: NodeId,
        body: NodeId,
        else_branch: Option<NodeId>,
        id: NodeId,
    ) -> CResult<Reg> {
        self.cur().push_scope();
        let cond_reg = self.compile_expr(cond)?;
        if let Some(pattern) = binding {
            self.bind_pattern(pattern, cond_reg)?;
        }
        let else_field = self.emit_cond_jump_placeholder(Op::JumpFalse, cond_reg);
        self.free_temp(cond_reg);

        let result = self.alloc_temp(id)?;
        let body_reg = self.compile_expr(body)?;
        self.emit(Op::Copy(result, body_reg));
        self.free_temp(body_reg);
        let end_field = self.emit_jump_placeholder();

        self.patch_cond_jump(else_field);
        match else_branch {
            Some(else_id) => {
                let else_reg = self.compile_expr(else_id)?;
                self.emit(Op::Copy(result, else_reg));
                self.free_temp(else_reg);
            }
            None => self.emit(Op::ConstPrimitive(result, CONST_NONE)),
        }
        self.patch_relative_jump(end_field);
        self.cur().pop_scope();
        Ok(result)
    }

    fn compile_while(&mut self, binding: Option<&Pattern>, cond: NodeId, body: NodeId, id: NodeId) -> CResult<Reg> {
        let result = self.alloc_temp(id)?;
        self.emit(Op::ConstPrimitive(result, CONST_NONE));

        self.cur().push_scope();
        let test_start = self.pos();
        self.cur().loops.push(LoopCtx {
            continue_target: test_start,
            break_jumps: Vec::new(),
            result_reg: result,
        });

        let cond_reg = self.compile_expr(cond)?;
        if let Some(pattern) = binding {
            self.bind_pattern(pattern, cond_reg)?;
        }
        let end_field = self.emit_cond_jump_placeholder(Op::JumpFalse, cond_reg);
        self.free_temp(cond_reg);

        let body_reg = self.compile_expr(body)?;
        self.free_temp(body_reg);
        self.emit_relative_jump_to(test_start);
        self.patch_cond_jump(end_field);

        let loop_ctx = self.cur().loops.pop().unwrap();
        for field in loop_ctx.break_jumps {
            self.patch_relative_jump(field);
        }
        self.cur().pop_scope();
        Ok(result)
    }

    fn compile_for(&mut self, pattern: &Pattern, iterable: NodeId, body: NodeId, id: NodeId) -> CResult<Reg> {
        let result = self.alloc_temp(id)?;
        self.emit(Op::ConstPrimitive(result, CONST_NONE));

        let iter_src = self.compile_expr(iterable)?;
        let iter_reg = self.alloc_temp(id)?;
        self.emit(Op::IterInit(iter_reg, iter_src));
        self.free_temp(iter_src);

        self.cur().push_scope();
        let test_start = self.pos();
        self.cur().loops.push(LoopCtx {
            continue_target: test_start,
            break_jumps: Vec::new(),
            result_reg: result,
        });

        let value_reg = self.alloc_temp(id)?;
        self.emit(Op::IterNext(value_reg, iter_reg));
        let end_field = self.emit_cond_jump_placeholder(Op::JumpNone, value_reg);
        self.bind_pattern(pattern, value_reg)?;
        self.free_temp(value_reg);

        let body_reg = self.compile_expr(body)?;
        self.free_temp(body_reg);
        self.emit_relative_jump_to(test_start);
        self.patch_cond_jump(end_field);

        let loop_ctx = self.cur().loops.pop().unwrap();
        for field in loop_ctx.break_jumps {
            self.patch_relative_jump(field);
        }
        self.cur().pop_scope();
        self.free_temp(iter_reg);
        Ok(result)
    }

    fn compile_match(&mut self, scrutinee: NodeId, cases: &[MatchCase], id: NodeId) -> CResult<Reg> {
        let scrutinee_reg = self.compile_expr(scrutinee)?;
        let result = self.alloc_temp(id)?;
        self.emit(Op::ConstPrimitive(result, CONST_NONE));

        let mut end_jumps = Vec::new();
        for case in cases {
            match case {
                MatchCase::CatchAll(body) => {
                    let body_reg = self.compile_expr(*body)?;
                    self.emit(Op::Copy(result, body_reg));
                    self.free_temp(body_reg);
                    end_jumps.push(self.emit_jump_placeholder());
                }
                MatchCase::Let(pattern, body) => {
                    self.cur().push_scope();
                    self.bind_pattern(pattern, scrutinee_reg)?;
                    let body_reg = self.compile_expr(*body)?;
                    self.emit(Op::Copy(result, body_reg));
                    self.free_temp(body_reg);
                    self.cur().pop_scope();
                    end_jumps.push(self.emit_jump_placeholder());
                }
                MatchCase::Values(values, body) => {
                    let mut match_jumps = Vec::new();
                    for value in values {
                        let val_reg = self.compile_expr(*value)?;
                        let eq_reg = self.alloc_temp(id)?;
                        self.emit(Op::Equal(eq_reg, scrutinee_reg, val_reg));
                        self.free_temp(val_reg);
                        match_jumps.push(self.emit_cond_jump_placeholder(Op::JumpTrue, eq_reg));
                        self.free_temp(eq_reg);
                    }
                    let skip_field = self.emit_jump_placeholder();
                    for field in match_jumps {
                        self.patch_cond_jump(field);
                    }
                    let body_reg = self.compile_expr(*body)?;
                    self.emit(Op::Copy(result, body_reg));
                    self.free_temp(body_reg);
                    end_jumps.push(self.emit_jump_placeholder());
                    self.patch_relative_jump(skip_field);
                }
            }
        }
        for field in end_jumps {
            self.patch_relative_jump(field);
        }
        self.free_temp(scrutinee_reg);
        Ok(result)
    }

    fn compile_catch(&mut self, lhs: NodeId, binding: Option<&Pattern>, rhs: NodeId, id: NodeId) -> CResult<Reg> {
        let _ = id;
        let result = self.compile_expr(lhs)?;
        let not_err_field = self.emit_cond_jump_placeholder(Op::JumpNotError, result);

        self.cur().push_scope();
        if let Some(pattern) = binding {
            let unwrapped = self.alloc_temp(0)?;
            self.emit(Op::UnwrapError(unwrapped, result));
            self.bind_pattern(pattern, unwrapped)?;
            self.free_temp(unwrapped);
        }
        let rhs_reg = self.compile_expr(rhs)?;
        self.emit(Op::Copy(result, rhs_reg));
        self.free_temp(rhs_reg);
        self.cur().pop_scope();

        self.patch_cond_jump(not_err_field);
        Ok(result)
    }

    fn compile_jump(&mut self, jump: &Jump, id: NodeId) -> CResult<Reg> {
        match jump {
            Jump::Return(value) => {
                let reg = match value {
                    Some(v) => self.compile_expr(*v)?,
                    None => {
                        self.emit(Op::ReturnNone);
                        return self.const_none();
                    }
                };
                self.emit(Op::Return(reg));
                self.free_temp(reg);
                self.const_none()
            }
            Jump::Break(value) => {
                let Some(loop_ctx) = self.cur().loops.last() else {
                    return self.fail("'break' outside a loop", id);
                };
                let result_reg = loop_ctx.result_reg;
                if let Some(v) = value {
                    let reg = self.compile_expr(*v)?;
                    self.emit(Op::Copy(result_reg, reg));
                    self.free_temp(reg);
                }
                let field = self.emit_jump_placeholder();
                self.cur().loops.last_mut().unwrap().break_jumps.push(field);
                self.const_none()
            }
            Jump::Continue => {
                let Some(loop_ctx) = self.cur().loops.last() else {
                    return self.fail("'continue' outside a loop", id);
                };
                let target = loop_ctx.continue_target;
                self.emit_relative_jump_to(target);
                self.const_none()
            }
        }
    }

    fn compile_import(&mut self, path: &[u8], id: NodeId) -> CResult<Reg> {
        let r = self.alloc_temp(id)?;
        let offset = self.intern_str(path);
        self.emit(Op::Import(r, offset));
        Ok(r)
    }

    fn compile_error(&mut self, inner: NodeId, id: NodeId) -> CResult<Reg> {
        let _ = id;
        let reg = self.compile_expr(inner)?;
        self.emit(Op::BuildError(reg, reg));
        Ok(reg)
    }

    // -- assignment -----------------------------------------------------------

    fn compile_assignment(&mut self, op: InfixOp, lhs: NodeId, rhs: NodeId, id: NodeId) -> CResult<Reg> {
        match self.tree.get(lhs).clone() {
            Node::Ident(name) => self.compile_assign_ident(&name, op, rhs, id),
            Node::Index { target, index } => self.compile_assign_index(target, index, op, rhs, id),
            Node::Member { target, name } => self.compile_assign_member(target, &name, op, rhs, id),
            _ => self.fail("the left-hand side of an assignment must be a name, index, or member expression", lhs),
        }
    }

    fn compile_assign_ident(&mut self, name: &str, op: InfixOp, rhs: NodeId, id: NodeId) -> CResult<Reg> {
        let Some(VarRef::Local(reg)) = self.resolve_var(name) else {
            return match self.resolve_var(name) {
                Some(VarRef::Capture(_)) => self.fail(format!("'{name}' is captured from an enclosing function and cannot be assigned"), id),
                _ => self.fail(format!("'{name}' is not defined"), id),
            };
        };
        let rhs_reg = self.compile_expr(rhs)?;
        match op.underlying() {
            Some(underlying) => self.apply_underlying(underlying, reg, reg, rhs_reg)?,
            None => self.emit(Op::Copy(reg, rhs_reg)),
        }
        self.free_temp(rhs_reg);
        let result = self.alloc_temp(id)?;
        self.emit(Op::Copy(result, reg));
        Ok(result)
    }

    fn compile_assign_index(&mut self, target: NodeId, index: NodeId, op: InfixOp, rhs: NodeId, id: NodeId) -> CResult<Reg> {
        let container = self.compile_expr(target)?;
        let key = self.compile_expr(index)?;
        let rhs_reg = self.compile_expr(rhs)?;
        match op.underlying() {
            Some(underlying) => {
                let current = self.alloc_temp(id)?;
                self.emit(Op::Get(current, container, key));
                self.apply_underlying(underlying, current, current, rhs_reg)?;
                self.emit(Op::Set(container, key, current));
                self.free_temp(current);
            }
            None => self.emit(Op::Set(container, key, rhs_reg)),
        }
        self.free_temp(rhs_reg);
        self.free_temp(key);
        Ok(container)
    }

    fn compile_assign_member(&mut self, target: NodeId, name: &str, op: InfixOp, rhs: NodeId, id: NodeId) -> CResult<Reg> {
        let container = self.compile_expr(target)?;
        let key = self.alloc_temp(id)?;
        let offset = self.intern_str(name.as_bytes());
        self.emit(Op::ConstString(key, offset));
        let rhs_reg = self.compile_expr(rhs)?;
        match op.underlying() {
            Some(underlying) => {
                let current = self.alloc_temp(id)?;
                self.emit(Op::Get(current, container, key));
                self.apply_underlying(underlying, current, current, rhs_reg)?;
                self.emit(Op::Set(container, key, current));
                self.free_temp(current);
            }
            None => self.emit(Op::Set(container, key, rhs_reg)),
        }
        self.free_temp(rhs_reg);
        self.free_temp(key);
        Ok(container)
    }

    fn apply_underlying(&mut self, op: InfixOp, dst: Reg, a: Reg, b: Reg) -> CResult<()> {
        let make: fn(Reg, Reg, Reg) -> Op = match op {
            InfixOp::Add => Op::Add,
            InfixOp::Sub => Op::Sub,
            InfixOp::Mul => Op::Mul,
            InfixOp::Div => Op::Div,
            InfixOp::DivFloor => Op::DivFloor,
            InfixOp::Mod => Op::Mod,
            InfixOp::Pow => Op::Pow,
            InfixOp::Shl => Op::LShift,
            InfixOp::Shr => Op::RShift,
            InfixOp::BitAnd => Op::BitAnd,
            InfixOp::BitOr => Op::BitOr,
            InfixOp::BitXor => Op::BitXor,
            _ => unreachable!("InfixOp::underlying only returns plain binary operators"),
        };
        self.emit(make(dst, a, b));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use crate::vm::natives::Registry;
    use crate::vm::{run_module, VmOptions};
    use std::rc::Rc;

    fn run(source: &str) -> Result<crate::gc::Value, crate::error::BogError> {
        let mut diagnostics = Diagnostics::new();
        let module = compile(source, "<test>", &mut diagnostics).expect("compile failed");
        run_module(Rc::new(module), Registry::new(), VmOptions::default(), &mut diagnostics)
    }

    fn as_int(value: &crate::gc::Value) -> i64 {
        match value {
            crate::gc::Value::Int(v) => *v,
            other => panic!("expected an int, found {other:?}"),
        }
    }

    #[test]
    fn straight_line_arithmetic() {
        let value = run("let x = 1 + 2\nreturn x").unwrap();
        assert_eq!(as_int(&value), 3);
    }

    #[test]
    fn implicit_return_is_last_statement() {
        let value = run("error(1)").unwrap();
        assert!(matches!(value, crate::gc::Value::Err(_)));
    }

    #[test]
    fn if_expression_without_else_yields_none_on_false_branch() {
        let value = run("if (false) { 1 }").unwrap();
        assert!(matches!(value, crate::gc::Value::None));
    }

    #[test]
    fn while_loop_accumulates_and_returns_sum() {
        let value = run(
            "let total = 0\n\
             let i = 0\n\
             while (i < 4) {\n\
             total = total + i\n\
             i = i + 1\n\
             }\n\
             return total",
        )
        .unwrap();
        assert_eq!(as_int(&value), 6);
    }

    #[test]
    fn for_loop_sums_a_range() {
        let value = run(
            "let total = 0\n\
             for (let x in 0...4) {\n\
             total = total + x\n\
             }\n\
             return total",
        )
        .unwrap();
        assert_eq!(as_int(&value), 6);
    }

    #[test]
    fn recursive_named_function_computes_power() {
        let value = run(
            "fn pow(base, exp) {\n\
             if (exp == 0) { 1 } else { base * pow(base, exp - 1) }\n\
             }\n\
             return pow(2, 4)",
        )
        .unwrap();
        assert_eq!(as_int(&value), 16);
    }

    #[test]
    fn closures_capture_enclosing_locals_by_value() {
        let value = run(
            "let make_adder = fn(n) { fn(x) x + n }\n\
             let add5 = make_adder(5)\n\
             return add5(10)",
        )
        .unwrap();
        assert_eq!(as_int(&value), 15);
    }

    #[test]
    fn match_falls_back_to_none_without_catch_all() {
        let value = run("match (1) { 2: 20 }").unwrap();
        assert!(matches!(value, crate::gc::Value::None));
    }

    #[test]
    fn catch_recovers_the_wrapped_value_from_an_error() {
        let value = run("return error(7) catch let e: e").unwrap();
        assert_eq!(as_int(&value), 7);
    }

    #[test]
    fn break_with_value_sets_the_loop_result() {
        let value = run(
            "let i = 0\n\
             return while (true) {\n\
             i = i + 1\n\
             if (i == 3) { break i }\n\
             }",
        )
        .unwrap();
        assert_eq!(as_int(&value), 3);
    }

    #[test]
    fn register_budget_overflow_is_a_compile_error() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("let v{i} = {i}\n"));
        }
        source.push_str("return v0");
        let mut diagnostics = Diagnostics::new();
        assert!(compile(&source, "<test>", &mut diagnostics).is_err());
    }
}
