//! The host's native-function registry (spec.md §6 "Register a native by
//! name").
//!
//! A native receives `(VM, slice of Value refs)`; the spec requires the VM —
//! not the native — to validate a declared argument count (§9, noting the
//! source it was distilled from comments this check out; this
//! reimplementation does not repeat that bug).

use std::collections::HashMap;
use std::rc::Rc;

use crate::error::BogError;
use crate::gc::Value;
use crate::vm::Vm;

pub type NativeFn = Rc<dyn Fn(&mut Vm, &[Value]) -> Result<Value, BogError>>;

#[derive(Clone)]
struct Entry {
    arity: Option<u8>,
    func: NativeFn,
}

/// VM-local; mutated only before `exec` is entered (spec.md §5 "Shared
/// resources").
#[derive(Default, Clone)]
pub struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, arity: Option<u8>, func: NativeFn) {
        self.entries.insert(name.into(), Entry { arity, func });
    }

    pub fn get(&self, name: &str) -> Option<(Option<u8>, NativeFn)> {
        self.entries.get(name).map(|e| (e.arity, e.func.clone()))
    }
}
