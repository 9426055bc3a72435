//! The host embedding surface (spec.md §6), exercised from outside the
//! crate the way an actual embedder would: register a native, run a
//! script that calls it, then call an exported function by name on the
//! script's resulting map value.

use bog::{BogError, Engine, EngineOptions, Value};
use std::rc::Rc;

#[test]
fn a_registered_native_is_callable_from_script_source() {
    let mut engine = Engine::new(EngineOptions::default());
    engine.register_native(
        "shout",
        Some(1),
        Rc::new(|_, args: &[Value]| match &args[0] {
            Value::Int(n) => Ok(Value::Int(n + 1)),
            other => Err(BogError::RuntimeError(format!("expected an int, got {other:?}"))),
        }),
    );
    let result = engine.run("main", "return shout(41)\n").unwrap();
    assert!(matches!(result, Value::Int(42)));
}

#[test]
fn a_native_with_the_wrong_declared_arity_is_a_runtime_error() {
    let mut engine = Engine::new(EngineOptions::default());
    engine.register_native("one_arg", Some(1), Rc::new(|_, _| Ok(Value::None)));
    let err = engine.run("main", "return one_arg(1, 2)\n").unwrap_err();
    assert!(matches!(err, BogError::RuntimeError(_)));
}

#[test]
fn calling_an_exported_function_on_the_modules_result_map() {
    let mut diagnostics = bog::Diagnostics::new();
    let engine = Engine::default();
    let module = Rc::new(
        engine
            .compile("main", "fn add(a, b) a + b\nreturn { add: add }\n", &mut diagnostics)
            .unwrap(),
    );
    let mut vm = engine.vm_for(module);
    let exports = vm.run(&mut bog::Diagnostics::new()).unwrap();
    let result = engine.call(&mut vm, &exports, "add", &[Value::Int(19), Value::Int(23)]).unwrap();
    assert!(matches!(result, Value::Int(42)));
}
