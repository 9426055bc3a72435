//! The concrete scenarios spec.md §8 calls out by number, run end to end
//! through `Engine` rather than through the compiler/VM directly — this is
//! the integration-level counterpart of brubeck's `tests/parser.rs` and
//! `tests/pseudo_instructions.rs`, which likewise run whole programs through
//! the public API and check the final machine state.

mod common;

use bog::{BogError, Value};
use common::{assert_int, run_err, run_ok};

#[test]
fn scenario_1_straight_line_arithmetic() {
    let value = run_ok("let x = 1 + 2\nreturn x\n");
    assert_int(&value, 3);
}

#[test]
fn scenario_2_for_loop_accumulates_a_sum() {
    let value = run_ok("let xs = [1,2,3]\nlet s = 0\nfor (let v in xs) s += v\nreturn s\n");
    assert_int(&value, 6);
}

#[test]
fn scenario_3_recursive_function_via_nested_calls() {
    let value = run_ok("fn pow(x) x * x\nreturn pow(pow(2))\n");
    assert_int(&value, 16);
}

#[test]
fn scenario_4_disabled_file_imports_are_a_runtime_error() {
    let err = run_err("import(\"m.bog\")\n");
    match err {
        BogError::RuntimeError(msg) => assert!(msg.contains("import failed"), "unexpected message: {msg}"),
        other => panic!("expected a RuntimeError, got {other:?}"),
    }
}

#[test]
fn scenario_5_an_uncaught_error_is_the_modules_result() {
    let value = run_ok("error(\"oops\")\n");
    assert!(matches!(value, Value::Err(_)));
}

#[test]
fn scenario_6_shift_by_a_negative_amount_is_a_runtime_error() {
    let err = run_err("return 1 << -1\n");
    assert!(matches!(err, BogError::RuntimeError(_)));
}

#[test]
fn scenario_7_hex_float_is_one_token_but_leading_zero_is_a_tokenize_error() {
    let value = run_ok("return 0xdeadP2\n");
    assert!(matches!(value, Value::Num(_)));

    let err = run_err("return 09\n");
    assert!(matches!(err, BogError::TokenizeError(_)));
}
