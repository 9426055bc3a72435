//! Import subsystem (spec.md §4.6).
//!
//! `.bog` sources are compiled and cached; `.bogc` files are read as
//! already-compiled modules. Cyclic imports are deliberately rejected with a
//! `RuntimeError` (see `DESIGN.md`) rather than the source spec's "return
//! the current partial result" behavior, which spec.md itself flags as
//! undefined behavior if relied upon.

use std::collections::HashSet;
use std::rc::Rc;

use crate::compiler;
use crate::diagnostics::Diagnostics;
use crate::error::BogError;
use crate::module::Module;

const BOGC_MAGIC: &[u8; 4] = b"BOGC";
const BOGC_VERSION: u32 = 1;

/// Memoizes compiled modules by import id and detects re-entrant loads of
/// the same id (spec.md §8 "Import memoization").
#[derive(Default)]
pub struct ImportTable {
    cache: std::collections::HashMap<String, Rc<Module>>,
    loading: HashSet<String>,
}

impl ImportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, id: &str) -> Option<Rc<Module>> {
        self.cache.get(id).cloned()
    }

    /// Marks `id` as in-progress. Returns an error if `id` is already being
    /// loaded (a cyclic import).
    pub fn begin_load(&mut self, id: &str) -> Result<(), BogError> {
        if self.loading.contains(id) {
            return Err(BogError::RuntimeError(format!("cyclic import of '{id}'")));
        }
        self.loading.insert(id.to_string());
        Ok(())
    }

    /// Caches a compiled module by id, independent of the loading marker:
    /// called once a `.bog`/`.bogc` file has been turned into a `Module`, but
    /// *before* it has necessarily finished running (see [`ImportTable::end_load`]).
    pub fn cache_module(&mut self, id: &str, module: Rc<Module>) {
        self.cache.insert(id.to_string(), module);
    }

    /// Clears `id`'s loading marker once its import is fully resolved —
    /// compiled (or read from cache) *and* executed. Must not run any
    /// earlier, or a module that imports itself from within its own body
    /// would see its own marker already cleared and recurse forever instead
    /// of hitting [`ImportTable::begin_load`]'s cycle check.
    pub fn end_load(&mut self, id: &str) {
        self.loading.remove(id);
    }
}

/// Loads `id` from disk, bounded by `max_import_size`: `.bog` sources are
/// compiled via the compiler collaborator, `.bogc` files are read as
/// precompiled modules (spec.md §4.6).
pub fn load_from_disk(id: &str, max_import_size: u32, diagnostics: &mut Diagnostics) -> Result<Module, BogError> {
    let metadata = std::fs::metadata(id)?;
    if metadata.len() > max_import_size as u64 {
        return Err(BogError::IoError(format!(
            "import '{id}' is {} bytes, exceeding the {max_import_size}-byte limit",
            metadata.len()
        )));
    }
    if id.ends_with(".bogc") {
        let bytes = std::fs::read(id)?;
        return read_bogc(id, &bytes);
    }
    let source = std::fs::read_to_string(id)?;
    compiler::compile(&source, id, diagnostics).map_err(|()| {
        BogError::CompileError(format!("failed to compile import '{id}'"))
    })
}

fn read_bogc(id: &str, bytes: &[u8]) -> Result<Module, BogError> {
    if bytes.len() < 4 + 4 + 4 + 4 + 4 || &bytes[0..4] != BOGC_MAGIC {
        return Err(BogError::MalformedByteCode(format!("'{id}' is not a .bogc file")));
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != BOGC_VERSION {
        return Err(BogError::MalformedByteCode(format!("'{id}' has unsupported .bogc version {version}")));
    }
    let code_len = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
    let strings_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
    let entry = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    let code_start = 20;
    let code_end = code_start + code_len;
    let strings_end = code_end + strings_len;
    let tail = bytes
        .get(code_start..strings_end)
        .ok_or_else(|| BogError::MalformedByteCode(format!("'{id}' is truncated")))?;
    let code = tail[..code_len].to_vec();
    let strings = tail[code_len..].to_vec();
    Ok(Module::new(id, code, strings, entry))
}

/// Serializes `module` as a `.bogc` file's bytes, the inverse of
/// [`read_bogc`].
pub fn write_bogc(module: &Module) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + module.code.len() + module.strings.len());
    out.extend_from_slice(BOGC_MAGIC);
    out.extend_from_slice(&BOGC_VERSION.to_le_bytes());
    out.extend_from_slice(&(module.code.len() as u32).to_le_bytes());
    out.extend_from_slice(&(module.strings.len() as u32).to_le_bytes());
    out.extend_from_slice(&module.entry.to_le_bytes());
    out.extend_from_slice(&module.code);
    out.extend_from_slice(&module.strings);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bogc_round_trips() {
        let module = Module::new("m", vec![1, 2, 3], vec![4, 5], 7);
        let bytes = write_bogc(&module);
        let read_back = read_bogc("m", &bytes).unwrap();
        assert_eq!(read_back.code, module.code);
        assert_eq!(read_back.strings, module.strings);
        assert_eq!(read_back.entry, module.entry);
    }

    #[test]
    fn cyclic_import_is_rejected() {
        let mut table = ImportTable::new();
        table.begin_load("a.bog").unwrap();
        assert!(table.begin_load("a.bog").is_err());
    }
}
