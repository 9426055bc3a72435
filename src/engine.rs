//! Host embedding surface (spec.md §6).
//!
//! Brubeck's `Interpreter` (`interpreter.rs`) is the single object a host
//! builds once and then feeds lines of assembly; `Engine` plays the same
//! role here, except a Bog host feeds it whole sources instead of one
//! instruction at a time, and registers native functions before running
//! anything.

use std::rc::Rc;

use crate::diagnostics::Diagnostics;
use crate::error::BogError;
use crate::gc::Value;
use crate::module::Module;
use crate::vm::natives::{NativeFn, Registry};
use crate::vm::{run_module, Vm, VmOptions};

/// Host-controlled knobs, named the way spec.md §6 names them. A thin
/// re-export of [`crate::vm::VmOptions`] under the name an embedder actually
/// reaches for.
pub type EngineOptions = VmOptions;

/// Owns the native-function registry and the options a host configures once,
/// then runs as many sources against it as it likes.
pub struct Engine {
    natives: Registry,
    options: EngineOptions,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl Engine {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            natives: Registry::new(),
            options,
        }
    }

    /// Registers a native function under `name`, callable from Bog source.
    /// `arity` of `None` accepts any argument count; the VM (not the native)
    /// validates a declared arity before the call (spec.md §9).
    pub fn register_native(&mut self, name: impl Into<String>, arity: Option<u8>, func: NativeFn) {
        self.natives.register(name, arity, func);
    }

    /// Tokenizes, parses, compiles and runs `source` as a module named
    /// `name`, returning its final value or the first diagnostic rendered
    /// into a [`BogError`] of the appropriate kind.
    pub fn run(&self, name: &str, source: &str) -> Result<Value, BogError> {
        let mut diagnostics = Diagnostics::new();
        let module = self.compile(name, source, &mut diagnostics)?;
        run_module(Rc::new(module), self.natives.clone(), self.options, &mut diagnostics)
    }

    /// Same as [`Engine::run`], but also hands back the accumulated
    /// [`Diagnostics`] (traces and notes included, not just the first error)
    /// so a host can render a full report instead of a single message.
    pub fn run_with_diagnostics(&self, name: &str, source: &str) -> (Result<Value, BogError>, Diagnostics) {
        let mut diagnostics = Diagnostics::new();
        let result = self.compile(name, source, &mut diagnostics);
        let result = match result {
            Ok(module) => run_module(Rc::new(module), self.natives.clone(), self.options, &mut diagnostics),
            Err(e) => Err(e),
        };
        (result, diagnostics)
    }

    /// Tokenizes, parses, and compiles `source` into a [`Module`] without
    /// running it — the split [`Engine::run`] skips internally, exposed for
    /// a host that wants to drive the resulting `Module` itself via
    /// [`Engine::vm_for`] (e.g. to call exported functions afterward through
    /// [`Engine::call`] once the module's top level has run).
    pub fn compile(&self, name: &str, source: &str, diagnostics: &mut Diagnostics) -> Result<Module, BogError> {
        match crate::parser::parse(source, diagnostics) {
            Ok(tree) => crate::compiler::compile_tree(&tree, name, diagnostics)
                .map_err(|()| BogError::CompileError(diagnostics.render(source))),
            Err(crate::parser::ParseFailure::Tokenize) => Err(BogError::TokenizeError(diagnostics.render(source))),
            Err(crate::parser::ParseFailure::Parse) => Err(BogError::ParseError(diagnostics.render(source))),
        }
    }

    /// Builds a fresh [`Vm`] over `module` without running it, for a host
    /// that wants to drive [`Vm::run`] itself (e.g. to call exported
    /// functions afterward via [`Engine::call`]).
    pub fn vm_for(&self, module: Rc<Module>) -> Vm {
        Vm::new(module, self.natives.clone(), self.options)
    }

    /// Calls a function reached by key from a map-typed value — the shape a
    /// module's top-level value takes when it exports a table of functions
    /// (spec.md §6 "call a named function exported by a module"). `vm` must
    /// be the same `Vm` that produced `exports`, since the function's
    /// captures and heap data live in its heap.
    pub fn call(&self, vm: &mut Vm, exports: &Value, name: &str, args: &[Value]) -> Result<Value, BogError> {
        let key = Value::Str(vm.heap_mut().alloc(crate::gc::Obj::Str(name.as_bytes().to_vec())));
        let func = crate::value::get(vm.heap(), exports, &key).map_err(BogError::RuntimeError)?;
        vm.call_function(&func, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_simple_script_to_completion() {
        let engine = Engine::default();
        let result = engine.run("main", "let x = 1 + 2\nreturn x * 10\n").unwrap();
        assert!(matches!(result, Value::Int(30)));
    }

    #[test]
    fn tokenize_errors_are_reported_as_tokenize_errors() {
        let engine = Engine::default();
        let err = engine.run("main", "09\n").unwrap_err();
        assert!(matches!(err, BogError::TokenizeError(_)));
    }

    #[test]
    fn disabled_file_imports_surface_as_a_runtime_error() {
        let engine = Engine::default();
        let err = engine.run("main", "import(\"does_not_matter.bog\")\n").unwrap_err();
        assert!(matches!(err, BogError::RuntimeError(_)));
    }

    #[test]
    fn native_functions_are_callable_from_source() {
        let mut engine = Engine::default();
        engine.register_native("double", Some(1), std::rc::Rc::new(|_: &mut Vm, args: &[Value]| match &args[0] {
            Value::Int(n) => Ok(Value::Int(n * 2)),
            other => Err(BogError::RuntimeError(format!("expected an int, found {other:?}"))),
        }));
        let result = engine.run("main", "return double(21)\n").unwrap();
        assert!(matches!(result, Value::Int(42)));
    }

    #[test]
    fn call_invokes_an_exported_function_by_name() {
        let engine = Engine::default();
        let mut diagnostics = Diagnostics::new();
        let module = engine
            .compile(
                "main",
                "fn add(a, b) a + b\nreturn { add: add }\n",
                &mut diagnostics,
            )
            .unwrap();
        let module = Rc::new(module);
        let mut vm = engine.vm_for(module);
        let exports = vm.run(&mut Diagnostics::new()).unwrap();
        let result = engine.call(&mut vm, &exports, "add", &[Value::Int(4), Value::Int(5)]).unwrap();
        assert!(matches!(result, Value::Int(9)));
    }
}
