//! Closures, recursion, pattern-matching and jump-expression coverage beyond
//! the §8 scenarios — the integration-level counterpart of the constructs
//! `compiler.rs`'s own unit tests already exercise at the AST-to-bytecode
//! level, run here end to end through `Engine`.

mod common;

use bog::Value;
use common::{assert_int, run_ok};

#[test]
fn recursive_named_function_computes_power() {
    let value = run_ok(
        "fn pow(base, exp) {\n\
         if (exp == 0) { 1 } else { base * pow(base, exp - 1) }\n\
         }\n\
         return pow(2, 4)\n",
    );
    assert_int(&value, 16);
}

#[test]
fn closures_capture_enclosing_locals_by_value() {
    let value = run_ok(
        "let make_adder = fn(n) { fn(x) x + n }\n\
         let add5 = make_adder(5)\n\
         return add5(10)\n",
    );
    assert_int(&value, 15);
}

#[test]
fn match_falls_back_to_none_without_a_catch_all() {
    let value = run_ok("return match (1) { 2: 20 }\n");
    assert!(matches!(value, Value::None));
}

#[test]
fn match_with_catch_all_picks_the_default_arm() {
    let value = run_ok("return match (5) { 1: 10\n2: 20\n_: 99 }\n");
    assert_int(&value, 99);
}

#[test]
fn catch_recovers_the_wrapped_value_from_an_error() {
    let value = run_ok("return error(7) catch let e: e\n");
    assert_int(&value, 7);
}

#[test]
fn break_with_value_sets_the_loop_result() {
    let value = run_ok(
        "let i = 0\n\
         return while (true) {\n\
         i = i + 1\n\
         if (i == 3) { break i }\n\
         }\n",
    );
    assert_int(&value, 3);
}

#[test]
fn continue_skips_the_rest_of_the_loop_body() {
    let value = run_ok(
        "let i = 0\n\
         let s = 0\n\
         while (i < 5) {\n\
         i += 1\n\
         if (i == 3) { continue }\n\
         s += i\n\
         }\n\
         return s\n",
    );
    // 1 + 2 + 4 + 5, skipping 3.
    assert_int(&value, 12);
}

#[test]
fn try_on_an_error_result_propagates_through_the_calling_frame() {
    let value = run_ok(
        "fn fails() error(\"boom\")\n\
         fn caller() {\n\
         let v = try fails()\n\
         return 999\n\
         }\n\
         return caller()\n",
    );
    assert!(matches!(value, Value::Err(_)));
}

#[test]
fn destructuring_let_binds_a_tuple_pattern() {
    let value = run_ok("let (a, b) = (1, 2)\nreturn a + b\n");
    assert_int(&value, 3);
}

#[test]
fn map_literal_supports_bare_identifier_shorthand() {
    let value = run_ok("let x = 5\nlet m = { x }\nreturn m[\"x\"]\n");
    assert_int(&value, 5);
}
