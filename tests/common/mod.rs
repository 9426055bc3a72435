//! Shared integration-test harness, the counterpart of brubeck's
//! `tests/common/{mod,context,assertions,values}.rs` split: a small set of
//! "run this source, assert the shape of the result" helpers so individual
//! scenario tests stay one-liners.

use bog::{BogError, Engine, EngineOptions, Value};

/// Runs `source` against a default-options `Engine` and unwraps the result,
/// panicking with the rendered diagnostics on failure.
pub fn run_ok(source: &str) -> Value {
    Engine::default().run("test", source).unwrap_or_else(|e| panic!("expected success, got {e}"))
}

/// Runs `source` with file imports enabled, for scenarios that exercise
/// `vm::import`.
pub fn run_ok_with_imports(source: &str) -> Value {
    Engine::new(EngineOptions {
        import_files: true,
        ..EngineOptions::default()
    })
    .run("test", source)
    .unwrap_or_else(|e| panic!("expected success, got {e}"))
}

/// Runs `source` and returns the `BogError` it failed with.
pub fn run_err(source: &str) -> BogError {
    match Engine::default().run("test", source) {
        Ok(value) => panic!("expected failure, got a value: {value:?}"),
        Err(e) => e,
    }
}

pub fn assert_int(value: &Value, expected: i64) {
    match value {
        Value::Int(n) => assert_eq!(*n, expected),
        other => panic!("expected int {expected}, got {other:?}"),
    }
}
