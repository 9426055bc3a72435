//! Polymorphic value operations (spec.md §4.4).
//!
//! Every operation here dispatches on the runtime tag and, for heap-backed
//! tags, borrows the owning [`Heap`] to look the payload up — values
//! themselves stay `Copy`-cheap (a tag plus either an inline scalar or a
//! [`Handle`]) rather than something that owns a buffer.

use crate::gc::{Handle, Heap, IteratorState, Obj, Range, Value};

/// `map` is an insertion-ordered association list searched by [`eql`]
/// (see `DESIGN.md`): `Value` has no total, hash-stable `Eq`/`Hash` (`num`
/// carries NaN, and `int`/`num` compare equal across tags), and spec.md
/// requires insertion-order iteration regardless of representation.
pub type MapEntries = Vec<(Value, Value)>;

pub fn type_name(value: &Value, heap: &Heap) -> &'static str {
    match value {
        Value::None => "none",
        Value::Bool(_) => "bool",
        Value::Int(_) => "int",
        Value::Num(_) => "num",
        Value::Str(_) => "str",
        Value::Tuple(_) => "tuple",
        Value::List(_) => "list",
        Value::Map(_) => "map",
        Value::Range(_) => "range",
        Value::Err(_) => "err",
        Value::Func(_) => "func",
        Value::Native(_) => "native",
        Value::Iterator(h) => {
            let _ = heap.get(*h);
            "iterator"
        }
    }
}

pub fn expect_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(format!("expected a bool, found {other:?}")),
    }
}

pub fn expect_int(value: &Value) -> Result<i64, String> {
    match value {
        Value::Int(v) => Ok(*v),
        other => Err(format!("expected an int, found {other:?}")),
    }
}

/// `int` promotes to `num`; anything else is a type error (spec.md §4.4
/// numeric promotion rule).
pub fn expect_num(value: &Value) -> Result<f64, String> {
    match value {
        Value::Int(v) => Ok(*v as f64),
        Value::Num(v) => Ok(*v),
        other => Err(format!("expected a number, found {other:?}")),
    }
}

/// Structural equality (spec.md §4.4 `eql`). `int == num` compares
/// numerically; containers compare element-wise; `map` equality ignores
/// entry order.
pub fn eql(heap: &Heap, a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Int(x), Value::Num(y)) | (Value::Num(y), Value::Int(x)) => *x as f64 == *y,
        (Value::Str(x), Value::Str(y)) => {
            let Obj::Str(x) = heap.get(*x) else { unreachable!() };
            let Obj::Str(y) = heap.get(*y) else { unreachable!() };
            x == y
        }
        (Value::Tuple(x), Value::Tuple(y)) | (Value::List(x), Value::List(y)) => {
            let items = |h: Handle| match heap.get(h) {
                Obj::Tuple(v) | Obj::List(v) => v,
                _ => unreachable!(),
            };
            let (xs, ys) = (items(*x), items(*y));
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(a, b)| eql(heap, a, b))
        }
        (Value::Map(x), Value::Map(y)) => {
            let entries = |h: Handle| match heap.get(h) {
                Obj::Map(v) => v,
                _ => unreachable!(),
            };
            let (xs, ys) = (entries(*x), entries(*y));
            xs.len() == ys.len()
                && xs.iter().all(|(k, v)| ys.iter().any(|(k2, v2)| eql(heap, k, k2) && eql(heap, v, v2)))
        }
        (Value::Range(x), Value::Range(y)) => x == y,
        (Value::Err(x), Value::Err(y)) => {
            let Obj::Err(x) = heap.get(*x) else { unreachable!() };
            let Obj::Err(y) = heap.get(*y) else { unreachable!() };
            eql(heap, x, y)
        }
        _ => false,
    }
}

/// `in` membership (spec.md §4.4). Valid for `str` (substring), `tuple`/
/// `list` (element), `map` (key), `range` (integer honoring step).
pub fn contains(heap: &Heap, item: &Value, container: &Value) -> Result<bool, String> {
    match container {
        Value::Str(h) => {
            let Obj::Str(bytes) = heap.get(*h) else { unreachable!() };
            let Value::Str(needle) = item else {
                return Err("'in' on a str requires a str needle".to_string());
            };
            let Obj::Str(needle) = heap.get(*needle) else { unreachable!() };
            Ok(bytes.windows(needle.len().max(1)).any(|w| w == needle.as_slice()) || needle.is_empty())
        }
        Value::Tuple(h) | Value::List(h) => {
            let items = match heap.get(*h) {
                Obj::Tuple(v) | Obj::List(v) => v,
                _ => unreachable!(),
            };
            Ok(items.iter().any(|v| eql(heap, v, item)))
        }
        Value::Map(h) => {
            let Obj::Map(entries) = heap.get(*h) else { unreachable!() };
            Ok(entries.iter().any(|(k, _)| eql(heap, k, item)))
        }
        Value::Range(range) => {
            let n = expect_int(item)?;
            Ok(in_range(*range, n))
        }
        other => Err(format!("'in' is not supported on {other:?}")),
    }
}

fn in_range(range: Range, n: i64) -> bool {
    if range.step == 0 {
        return false;
    }
    if range.step > 0 {
        n >= range.start && n < range.end && (n - range.start) % range.step == 0
    } else {
        n <= range.start && n > range.end && (range.start - n) % (-range.step) == 0
    }
}

fn normalize_index(index: i64, len: usize) -> Option<usize> {
    if index >= 0 {
        let index = index as usize;
        (index < len).then_some(index)
    } else {
        let from_end = (-index) as usize;
        (from_end <= len).then_some(len - from_end)
    }
}

/// Indexes a list/tuple/map/str (spec.md §4.4 `get`).
pub fn get(heap: &Heap, container: &Value, key: &Value) -> Result<Value, String> {
    match container {
        Value::Tuple(h) | Value::List(h) => {
            let items = match heap.get(*h) {
                Obj::Tuple(v) | Obj::List(v) => v,
                _ => unreachable!(),
            };
            let index = expect_int(key)?;
            let index = normalize_index(index, items.len()).ok_or_else(|| "index out of range".to_string())?;
            Ok(items[index].clone())
        }
        Value::Str(h) => {
            let Obj::Str(bytes) = heap.get(*h) else { unreachable!() };
            let index = expect_int(key)?;
            let index = normalize_index(index, bytes.len()).ok_or_else(|| "index out of range".to_string())?;
            Ok(Value::Int(bytes[index] as i64))
        }
        Value::Map(h) => {
            let Obj::Map(entries) = heap.get(*h) else { unreachable!() };
            entries
                .iter()
                .find(|(k, _)| eql(heap, k, key))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| "key not found".to_string())
        }
        other => Err(format!("cannot index into {other:?}")),
    }
}

/// Mutates a list/map/tuple slot in place (spec.md §4.4 `set`). Immutable
/// types fail.
pub fn set(heap: &mut Heap, container: &Value, key: &Value, value: Value) -> Result<(), String> {
    match container {
        Value::List(h) => {
            let index = expect_int(key)?;
            let Obj::List(items) = heap.get_mut(*h) else { unreachable!() };
            let index = normalize_index(index, items.len()).ok_or_else(|| "index out of range".to_string())?;
            items[index] = value;
            Ok(())
        }
        Value::Tuple(h) => {
            let index = expect_int(key)?;
            let Obj::Tuple(items) = heap.get_mut(*h) else { unreachable!() };
            let index = normalize_index(index, items.len()).ok_or_else(|| "index out of range".to_string())?;
            items[index] = value;
            Ok(())
        }
        Value::Map(h) => {
            let key = key.clone();
            let Obj::Map(entries) = heap.get(*h) else { unreachable!() };
            let existing = entries.iter().position(|(k, _)| eql(heap, k, &key));
            let Obj::Map(entries) = heap.get_mut(*h) else { unreachable!() };
            match existing {
                Some(index) => entries[index].1 = value,
                None => entries.push((key, value)),
            }
            Ok(())
        }
        other => Err(format!("cannot assign into {other:?}")),
    }
}

/// Coerces to one of `none|int|num|bool|str|tuple|map|list` (spec.md §4.4
/// `as`).
pub fn as_type(heap: &mut Heap, value: &Value, type_name: &str) -> Result<Value, String> {
    match type_name {
        "none" => Ok(Value::None),
        "bool" => Ok(Value::Bool(truthy(heap, value))),
        "int" => match value {
            Value::Int(v) => Ok(Value::Int(*v)),
            Value::Num(v) => Ok(Value::Int(*v as i64)),
            Value::Bool(b) => Ok(Value::Int(*b as i64)),
            Value::Str(h) => {
                let Obj::Str(bytes) = heap.get(*h) else { unreachable!() };
                let text = String::from_utf8_lossy(bytes);
                text.trim().parse::<i64>().map(Value::Int).map_err(|_| "cannot parse str as int".to_string())
            }
            other => Err(format!("cannot convert {other:?} to int")),
        },
        "num" => match value {
            Value::Int(v) => Ok(Value::Num(*v as f64)),
            Value::Num(v) => Ok(Value::Num(*v)),
            Value::Str(h) => {
                let Obj::Str(bytes) = heap.get(*h) else { unreachable!() };
                let text = String::from_utf8_lossy(bytes);
                text.trim().parse::<f64>().map(Value::Num).map_err(|_| "cannot parse str as num".to_string())
            }
            other => Err(format!("cannot convert {other:?} to num")),
        },
        "str" => {
            let rendered = render(heap, value);
            Ok(Value::Str(heap.alloc(Obj::Str(rendered.into_bytes()))))
        }
        "tuple" => to_sequence(heap, value).map(|items| Value::Tuple(heap.alloc(Obj::Tuple(items)))),
        "list" => to_sequence(heap, value).map(|items| Value::List(heap.alloc(Obj::List(items)))),
        "map" => match value {
            Value::Map(h) => Ok(Value::Map(*h)),
            other => Err(format!("cannot convert {other:?} to map")),
        },
        other => Err(format!("unknown target type '{other}'")),
    }
}

fn to_sequence(heap: &Heap, value: &Value) -> Result<Vec<Value>, String> {
    match value {
        Value::Tuple(h) | Value::List(h) => match heap.get(*h) {
            Obj::Tuple(v) | Obj::List(v) => Ok(v.clone()),
            _ => unreachable!(),
        },
        other => Err(format!("cannot convert {other:?} to a sequence")),
    }
}

/// Truthiness used by `as bool` and by condition evaluation: non-empty /
/// nonzero.
pub fn truthy(heap: &Heap, value: &Value) -> bool {
    match value {
        Value::None => false,
        Value::Bool(b) => *b,
        Value::Int(v) => *v != 0,
        Value::Num(v) => *v != 0.0,
        Value::Str(h) => !matches!(heap.get(*h), Obj::Str(bytes) if bytes.is_empty()),
        Value::Tuple(h) | Value::List(h) => match heap.get(*h) {
            Obj::Tuple(items) | Obj::List(items) => !items.is_empty(),
            _ => unreachable!(),
        },
        Value::Map(h) => !matches!(heap.get(*h), Obj::Map(entries) if entries.is_empty()),
        _ => true,
    }
}

pub fn render(heap: &Heap, value: &Value) -> String {
    match value {
        Value::None => "none".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(v) => v.to_string(),
        Value::Num(v) => v.to_string(),
        Value::Str(h) => {
            let Obj::Str(bytes) = heap.get(*h) else { unreachable!() };
            String::from_utf8_lossy(bytes).into_owned()
        }
        Value::Tuple(h) | Value::List(h) => {
            let items = match heap.get(*h) {
                Obj::Tuple(v) | Obj::List(v) => v,
                _ => unreachable!(),
            };
            let rendered: Vec<String> = items.iter().map(|v| render(heap, v)).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Map(h) => {
            let Obj::Map(entries) = heap.get(*h) else { unreachable!() };
            let rendered: Vec<String> = entries.iter().map(|(k, v)| format!("{}: {}", render(heap, k), render(heap, v))).collect();
            format!("{{{}}}", rendered.join(", "))
        }
        Value::Range(r) => format!("{}...{}", r.start, r.end),
        Value::Err(h) => {
            let Obj::Err(inner) = heap.get(*h) else { unreachable!() };
            format!("error({})", render(heap, inner))
        }
        Value::Func(_) => "<func>".to_string(),
        Value::Native(h) => {
            let Obj::Native(data) = heap.get(*h) else { unreachable!() };
            format!("<native {}>", data.name)
        }
        Value::Iterator(_) => "<iterator>".to_string(),
    }
}

/// Tag test over `none|int|num|bool|str|tuple|map|list|err|range|func`
/// (spec.md §4.4 `is`).
pub fn is_type(value: &Value, type_name: &str) -> bool {
    matches!(
        (value, type_name),
        (Value::None, "none")
            | (Value::Int(_), "int")
            | (Value::Num(_), "num")
            | (Value::Bool(_), "bool")
            | (Value::Str(_), "str")
            | (Value::Tuple(_), "tuple")
            | (Value::Map(_), "map")
            | (Value::List(_), "list")
            | (Value::Err(_), "err")
            | (Value::Range(_), "range")
            | (Value::Func(_), "func")
    )
}

/// Allocates a fresh iterator over `value` (spec.md §4.4 `iterator`):
/// code points for `str`, elements for `tuple`/`list`, key-value pairs
/// (as a 2-tuple) for `map`, integers honoring step for `range`.
pub fn new_iterator(heap: &mut Heap, value: &Value) -> Result<Value, String> {
    match value {
        Value::Str(_) | Value::Tuple(_) | Value::List(_) | Value::Map(_) | Value::Range(_) => {
            let handle = heap.alloc(Obj::Iterator(IteratorState {
                container: value.clone(),
                index: 0,
            }));
            Ok(Value::Iterator(handle))
        }
        other => Err(format!("cannot iterate over {other:?}")),
    }
}

/// Advances an iterator, writing `none` once exhausted and staying there on
/// every subsequent call (spec.md §8 "Iterator exhaustion").
pub fn iterator_next(heap: &mut Heap, iterator: Handle) -> Value {
    let (container, index) = {
        let Obj::Iterator(state) = heap.get(iterator) else {
            panic!("iterator_next called on a non-iterator handle");
        };
        (state.container.clone(), state.index)
    };
    let (next_value, next_index) = match &container {
        Value::Str(h) => {
            let Obj::Str(bytes) = heap.get(*h) else { unreachable!() };
            let text = String::from_utf8_lossy(bytes);
            match text.chars().nth(index as usize) {
                Some(ch) => {
                    let mut buf = [0u8; 4];
                    let encoded = ch.encode_utf8(&mut buf).as_bytes().to_vec();
                    (Value::Str(heap.alloc(Obj::Str(encoded))), index + 1)
                }
                None => (Value::None, index),
            }
        }
        Value::Tuple(h) | Value::List(h) => {
            let items = match heap.get(*h) {
                Obj::Tuple(v) | Obj::List(v) => v,
                _ => unreachable!(),
            };
            match items.get(index as usize) {
                Some(v) => (v.clone(), index + 1),
                None => (Value::None, index),
            }
        }
        Value::Map(h) => {
            let Obj::Map(entries) = heap.get(*h) else { unreachable!() };
            match entries.get(index as usize) {
                Some((k, v)) => {
                    let pair = heap.alloc(Obj::Tuple(vec![k.clone(), v.clone()]));
                    (Value::Tuple(pair), index + 1)
                }
                None => (Value::None, index),
            }
        }
        Value::Range(range) => {
            let current = range.start + index * range.step;
            if in_range(*range, current) {
                (Value::Int(current), index + 1)
            } else {
                (Value::None, index)
            }
        }
        _ => (Value::None, index),
    };
    let Obj::Iterator(state) = heap.get_mut(iterator) else {
        unreachable!()
    };
    state.index = next_index;
    next_value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_and_num_compare_equal_numerically() {
        let heap = Heap::new();
        assert!(eql(&heap, &Value::Int(2), &Value::Num(2.0)));
        assert!(!eql(&heap, &Value::Int(2), &Value::Num(2.5)));
    }

    #[test]
    fn negative_index_counts_from_end() {
        let mut heap = Heap::new();
        let handle = heap.alloc(Obj::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
        let list = Value::List(handle);
        let last = get(&heap, &list, &Value::Int(-1)).unwrap();
        assert!(matches!(last, Value::Int(3)));
        let _ = &mut heap;
    }

    #[test]
    fn map_equality_ignores_entry_order() {
        let mut heap = Heap::new();
        let a = heap.alloc(Obj::Map(vec![(Value::Int(1), Value::Int(2)), (Value::Int(3), Value::Int(4))]));
        let b = heap.alloc(Obj::Map(vec![(Value::Int(3), Value::Int(4)), (Value::Int(1), Value::Int(2))]));
        assert!(eql(&heap, &Value::Map(a), &Value::Map(b)));
    }

    #[test]
    fn range_membership_honors_step() {
        let heap = Heap::new();
        let range = Value::Range(Range { start: 0, end: 10, step: 2 });
        assert!(contains(&heap, &Value::Int(4), &range).unwrap());
        assert!(!contains(&heap, &Value::Int(5), &range).unwrap());
    }

    #[test]
    fn set_overwrites_a_map_entry_keyed_by_an_equal_but_distinct_string_handle() {
        let mut heap = Heap::new();
        let first_key = heap.alloc(Obj::Str(b"a".to_vec()));
        let map = heap.alloc(Obj::Map(vec![(Value::Str(first_key), Value::Int(1))]));
        let map = Value::Map(map);

        // A fresh handle with the same bytes, as `Op::ConstString` allocates
        // on every execution — `set` must match it to the existing entry via
        // `eql`, not overwrite-or-duplicate based on handle identity.
        let second_key = heap.alloc(Obj::Str(b"a".to_vec()));
        set(&mut heap, &map, &Value::Str(second_key), Value::Int(2)).unwrap();

        let Value::Map(h) = map else { unreachable!() };
        let Obj::Map(entries) = heap.get(h) else { unreachable!() };
        assert_eq!(entries.len(), 1, "expected the existing entry to be overwritten, not duplicated");
        assert!(matches!(entries[0].1, Value::Int(2)));
    }

    #[test]
    fn iterator_exhaustion_sticks_at_none() {
        let mut heap = Heap::new();
        let list = heap.alloc(Obj::List(vec![Value::Int(1)]));
        let Value::Iterator(iter) = new_iterator(&mut heap, &Value::List(list)).unwrap() else {
            panic!("expected an iterator value");
        };
        assert!(matches!(iterator_next(&mut heap, iter), Value::Int(1)));
        assert!(matches!(iterator_next(&mut heap, iter), Value::None));
        assert!(matches!(iterator_next(&mut heap, iter), Value::None));
    }
}
