//! `vm::import` end to end: a real `.bog` file on disk, loaded with file
//! imports enabled, plus the disabled-by-default and cyclic-import failure
//! paths (spec.md §4.6, and the cyclic-import Open Question resolved in
//! DESIGN.md).

mod common;

use bog::BogError;
use common::{assert_int, run_ok_with_imports};

#[test]
fn importing_a_bog_file_runs_it_and_returns_its_value() {
    let value = run_ok_with_imports("return import(\"tests/fixtures/double.bog\")\n");
    assert_int(&value, 42);
}

#[test]
fn importing_the_same_file_twice_returns_equal_values() {
    let value = run_ok_with_imports(
        "let a = import(\"tests/fixtures/double.bog\")\n\
         let b = import(\"tests/fixtures/double.bog\")\n\
         return a + b\n",
    );
    assert_int(&value, 84);
}

#[test]
fn a_module_importing_itself_is_rejected_as_a_cyclic_import() {
    let err = match bog::Engine::new(bog::EngineOptions {
        import_files: true,
        ..bog::EngineOptions::default()
    })
    .run("test", "return import(\"tests/fixtures/cyclic.bog\")\n")
    {
        Ok(value) => panic!("expected a cyclic import failure, got a value: {value:?}"),
        Err(e) => e,
    };
    match err {
        BogError::RuntimeError(msg) => assert!(msg.contains("cyclic"), "unexpected message: {msg}"),
        other => panic!("expected a RuntimeError, got {other:?}"),
    }
}

#[test]
fn nonexistent_import_path_is_a_runtime_error() {
    // `do_import` surfaces the underlying `io::Error` as a stringified
    // `RuntimeError` rather than a bare `BogError::IoError`, since import
    // failures are observed from inside a running VM step, not at the host
    // boundary (spec.md §7: VM semantic violations are `RuntimeError`s).
    let err = run_err_with_imports("return import(\"tests/fixtures/does_not_exist.bog\")\n");
    assert!(matches!(err, BogError::RuntimeError(_)));
}

fn run_err_with_imports(source: &str) -> BogError {
    match bog::Engine::new(bog::EngineOptions {
        import_files: true,
        ..bog::EngineOptions::default()
    })
    .run("test", source)
    {
        Ok(value) => panic!("expected failure, got a value: {value:?}"),
        Err(e) => e,
    }
}
