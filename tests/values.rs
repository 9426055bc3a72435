//! spec.md §8 invariants that are meaningful to check end to end: numeric
//! promotion, iterator exhaustion, and an `err` value that is never silently
//! dropped.

mod common;

use bog::{BogError, Value};
use common::{run_err, run_ok};

#[test]
fn int_plus_int_stays_int() {
    let value = run_ok("return 1 + 2\n");
    assert!(matches!(value, Value::Int(3)));
}

#[test]
fn int_plus_num_promotes_to_num() {
    let value = run_ok("return 1 + 2.5\n");
    match value {
        Value::Num(n) => assert!((n - 3.5).abs() < f64::EPSILON),
        other => panic!("expected a num, got {other:?}"),
    }
}

#[test]
fn iterating_an_empty_list_yields_none_immediately() {
    let value = run_ok(
        "let xs = []\n\
         let seen = 0\n\
         for (let v in xs) seen += 1\n\
         return seen\n",
    );
    assert!(matches!(value, Value::Int(0)));
}

#[test]
fn discarding_an_error_without_handling_it_is_a_runtime_error() {
    // The first statement's error value is discarded (it is not the last
    // statement, so the compiler emits `Discard` for it rather than `Return`).
    let err = run_err("error(\"dropped\")\nreturn 1\n");
    assert!(matches!(err, BogError::RuntimeError(_)));
}

#[test]
fn range_expression_iterates_its_bounds() {
    let value = run_ok(
        "let s = 0\n\
         for (let v in 1...4) s += v\n\
         return s\n",
    );
    assert!(matches!(value, Value::Int(6)));
}

#[test]
fn string_length_and_indexing_operate_on_code_points() {
    let value = run_ok("let s = \"hi\"\nreturn s[0] == \"h\"\n");
    assert!(matches!(value, Value::Bool(true)));
}

#[test]
fn repeated_map_index_assignment_overwrites_rather_than_duplicates() {
    // Each `"a"` literal allocates a fresh heap handle (Op::ConstString), so
    // this only overwrites in place if map `set` matches keys by `eql`
    // rather than by handle identity.
    let value = run_ok(
        "let m = {}\n\
         m[\"a\"] = 1\n\
         m[\"a\"] = 2\n\
         return m[\"a\"]\n",
    );
    assert!(matches!(value, Value::Int(2)));
}

#[test]
fn repeated_member_assignment_overwrites_rather_than_duplicates() {
    let value = run_ok(
        "let m = {}\n\
         m.foo = 1\n\
         m.foo = 2\n\
         return m.foo\n",
    );
    assert!(matches!(value, Value::Int(2)));
}

#[test]
fn floor_division_rounds_toward_negative_infinity() {
    let value = run_ok("return 7 // -2\n");
    assert!(matches!(value, Value::Int(-4)));
}

#[test]
fn floor_modulo_matches_floor_division() {
    // 7 == (7 // -2) * -2 + (7 % -2)  =>  7 == (-4 * -2) + (7 % -2)
    let value = run_ok("return 7 % -2\n");
    assert!(matches!(value, Value::Int(-1)));
}

#[test]
fn integer_overflow_is_a_runtime_error_not_a_silent_wrap() {
    let err = run_err("return 9223372036854775807 + 1\n");
    assert!(matches!(err, BogError::RuntimeError(_)));
}
