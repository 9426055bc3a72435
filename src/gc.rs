//! Precise mark-sweep garbage collector (spec.md §4.7).
//!
//! A flat, indexable heap holds values that don't fit in a register
//! slot (`str`, `tuple`, `list`, `map`, `err`, `func`, `native`, `iterator`).
//! Roots are supplied by the caller at collection time — the register stack
//! and the `this`/`captures` fields of every live call frame (spec.md §4.7) —
//! rather than tracked continuously, matching the "collect at any allocation
//! site, scan what's live right now" discipline the spec calls for.

use std::fmt;
use std::rc::Rc;

use crate::module::Module;
use crate::vm::natives::NativeFn;

/// An index into the heap. Stable across collections that do not free the
/// slot it names; invalidated only if the slot is swept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

#[derive(Debug, Clone)]
pub struct FuncData {
    pub arg_count: u8,
    pub entry_offset: u32,
    pub module: Rc<Module>,
    pub captures: Vec<Value>,
}

#[derive(Clone)]
pub struct NativeData {
    pub name: String,
    /// `None` means the native accepts any argument count; `Some(n)` is
    /// validated by the VM before the call (spec.md §9: the VM, not the
    /// native, must check this).
    pub arity: Option<u8>,
    pub func: NativeFn,
}

impl fmt::Debug for NativeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeData").field("name", &self.name).field("arity", &self.arity).finish()
    }
}

#[derive(Debug, Clone)]
pub struct IteratorState {
    pub container: Value,
    /// Next index into `container` to yield (or next integer for `range`).
    pub index: i64,
}

#[derive(Debug, Clone)]
pub enum Obj {
    Str(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Err(Value),
    Func(FuncData),
    Native(NativeData),
    Iterator(IteratorState),
}

impl Obj {
    /// Visits every `Value` directly reachable from this object, used by the
    /// marker to walk the graph without a separate trait per variant.
    fn trace(&self, mut visit: impl FnMut(&Value)) {
        match self {
            Obj::Str(_) => {}
            Obj::Tuple(items) | Obj::List(items) => items.iter().for_each(&mut visit),
            Obj::Map(pairs) => pairs.iter().for_each(|(k, v)| {
                visit(k);
                visit(v);
            }),
            Obj::Err(inner) => visit(inner),
            Obj::Func(data) => data.captures.iter().for_each(&mut visit),
            Obj::Native(_) => {}
            Obj::Iterator(state) => visit(&state.container),
        }
    }
}

/// A register-stack/heap value (spec.md §3 "Value").
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(Handle),
    Tuple(Handle),
    List(Handle),
    Map(Handle),
    Range(Range),
    Err(Handle),
    Func(Handle),
    Native(Handle),
    Iterator(Handle),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub start: i64,
    pub end: i64,
    pub step: i64,
}

impl Value {
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Value::Str(h) | Value::Tuple(h) | Value::List(h) | Value::Map(h) | Value::Err(h) | Value::Func(h) | Value::Native(h) | Value::Iterator(h) => {
                Some(*h)
            }
            _ => None,
        }
    }
}

enum Slot {
    Occupied(Obj),
    Free { next: usize },
}

/// Per-allocation GC bookkeeping lives in `Heap`, not in `Vm`, so the
/// collector can be unit-tested without a running interpreter.
pub struct Heap {
    slots: Vec<Slot>,
    marks: Vec<bool>,
    free_head: Option<usize>,
    /// Allocations since the last collection; used only to decide when a
    /// caller-triggered GC pass is worth running.
    pub allocations_since_collect: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            marks: Vec::new(),
            free_head: None,
            allocations_since_collect: 0,
        }
    }

    pub fn alloc(&mut self, obj: Obj) -> Handle {
        self.allocations_since_collect += 1;
        if let Some(index) = self.free_head {
            let next = match &self.slots[index] {
                Slot::Free { next } => *next,
                Slot::Occupied(_) => unreachable!("free list points at an occupied slot"),
            };
            self.free_head = if next == index { None } else { Some(next) };
            self.slots[index] = Slot::Occupied(obj);
            self.marks[index] = false;
            return Handle(index);
        }
        self.slots.push(Slot::Occupied(obj));
        self.marks.push(false);
        Handle(self.slots.len() - 1)
    }

    pub fn get(&self, handle: Handle) -> &Obj {
        match &self.slots[handle.0] {
            Slot::Occupied(obj) => obj,
            Slot::Free { .. } => panic!("dangling GC handle {handle:?}: slot was swept"),
        }
    }

    pub fn get_mut(&mut self, handle: Handle) -> &mut Obj {
        match &mut self.slots[handle.0] {
            Slot::Occupied(obj) => obj,
            Slot::Free { .. } => panic!("dangling GC handle {handle:?}: slot was swept"),
        }
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| matches!(s, Slot::Occupied(_))).count()
    }

    /// Marks everything reachable from `roots`, then frees every unmarked
    /// occupied slot. Roots are the register stack, plus the `this` and
    /// `captures` of every live call frame (spec.md §4.7); callers assemble
    /// that iterator since only the VM knows the live frame set.
    pub fn collect<'a>(&mut self, roots: impl Iterator<Item = &'a Value>) {
        self.marks.iter_mut().for_each(|m| *m = false);
        let mut stack: Vec<Handle> = Vec::new();
        for root in roots {
            if let Some(handle) = root.handle() {
                stack.push(handle);
            }
        }
        while let Some(handle) = stack.pop() {
            if self.marks[handle.0] {
                continue;
            }
            self.marks[handle.0] = true;
            let obj = match &self.slots[handle.0] {
                Slot::Occupied(obj) => obj.clone(),
                Slot::Free { .. } => continue,
            };
            obj.trace(|value| {
                if let Some(child) = value.handle() {
                    stack.push(child);
                }
            });
        }
        self.allocations_since_collect = 0;
        for index in 0..self.slots.len() {
            if self.marks[index] {
                continue;
            }
            if matches!(self.slots[index], Slot::Occupied(_)) {
                let next = self.free_head.unwrap_or(index);
                self.slots[index] = Slot::Free { next };
                self.free_head = Some(index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_allocations_are_swept() {
        let mut heap = Heap::new();
        let kept = heap.alloc(Obj::Str(b"kept".to_vec()));
        let _dropped = heap.alloc(Obj::Str(b"dropped".to_vec()));
        assert_eq!(heap.live_count(), 2);
        let roots = vec![Value::Str(kept)];
        heap.collect(roots.iter());
        assert_eq!(heap.live_count(), 1);
        assert!(matches!(heap.get(kept), Obj::Str(s) if s == b"kept"));
    }

    #[test]
    fn nested_containers_keep_children_alive() {
        let mut heap = Heap::new();
        let inner = heap.alloc(Obj::Str(b"inner".to_vec()));
        let outer = heap.alloc(Obj::List(vec![Value::Str(inner)]));
        let roots = vec![Value::List(outer)];
        heap.collect(roots.iter());
        assert_eq!(heap.live_count(), 2);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let a = heap.alloc(Obj::Str(b"a".to_vec()));
        heap.collect(std::iter::empty());
        let _ = a;
        let b = heap.alloc(Obj::Str(b"b".to_vec()));
        assert_eq!(heap.live_count(), 1);
        assert!(matches!(heap.get(b), Obj::Str(s) if s == b"b"));
    }
}
