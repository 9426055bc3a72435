//! Compiled bytecode units (spec.md §3 "Module").
//!
//! Function values hold an `Rc<Module>` rather than a GC handle: compiled
//! code is immutable program data the collector never needs to trace or
//! individually free, unlike the register stack and capture arrays (see
//! `DESIGN.md` for the full rationale).

/// A compiled unit: a code stream, a string pool, and an entry offset.
///
/// `name` identifies the module for import memoization and diagnostics; it
/// is the import id for imported modules and an implementation-defined label
/// (e.g. `"<script>"`) for the top-level module.
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub code: Vec<u8>,
    pub strings: Vec<u8>,
    pub entry: u32,
}

impl Module {
    pub fn new(name: impl Into<String>, code: Vec<u8>, strings: Vec<u8>, entry: u32) -> Self {
        Self {
            name: name.into(),
            code,
            strings,
            entry,
        }
    }

    /// Reads the `len: u32 || payload: len bytes` string at `offset` from the
    /// strings blob (spec.md §3 "Module").
    pub fn string_at(&self, offset: u32) -> &[u8] {
        let offset = offset as usize;
        let len = u32::from_le_bytes(
            self.strings[offset..offset + 4]
                .try_into()
                .expect("string offset must point at a 4-byte length prefix"),
        ) as usize;
        &self.strings[offset + 4..offset + 4 + len]
    }
}

/// Accumulates the strings blob during compilation, deduplicating identical
/// byte strings so repeated identifiers/literals share one entry.
#[derive(Debug, Default)]
pub struct StringPool {
    bytes: Vec<u8>,
    offsets: std::collections::HashMap<Vec<u8>, u32>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, value: &[u8]) -> u32 {
        if let Some(offset) = self.offsets.get(value) {
            return *offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(value);
        self.offsets.insert(value.to_vec(), offset);
        offset
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_pool_round_trips() {
        let mut pool = StringPool::new();
        let off_a = pool.intern(b"hello");
        let off_b = pool.intern(b"world");
        let off_a_again = pool.intern(b"hello");
        assert_eq!(off_a, off_a_again);
        let module = Module::new("test", Vec::new(), pool.into_bytes(), 0);
        assert_eq!(module.string_at(off_a), b"hello");
        assert_eq!(module.string_at(off_b), b"world");
    }
}
