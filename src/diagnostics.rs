//! The append-only diagnostics list shared by the tokenizer, parser, compiler, and VM.
//!
//! None of the front-end stages recover from an error: the first diagnostic
//! recorded by a stage is also its last word on the matter. The list survives
//! the failure so the host can render it against the original source.

use std::fmt;

/// What kind of entry this is, matching the three kinds spec.md's data model calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A hard failure.
    Err,
    /// A stack frame recorded while unwinding a `RuntimeError`.
    Trace,
    /// Extra context, e.g. "32 more frames omitted".
    Note,
}

/// A single rendered diagnostic entry.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub message: String,
    /// Byte offset into the source buffer that produced this diagnostic.
    pub source_offset: usize,
}

impl Diagnostic {
    pub fn err(message: impl Into<String>, source_offset: usize) -> Self {
        Self {
            kind: DiagnosticKind::Err,
            message: message.into(),
            source_offset,
        }
    }

    pub fn trace(message: impl Into<String>, source_offset: usize) -> Self {
        Self {
            kind: DiagnosticKind::Trace,
            message: message.into(),
            source_offset,
        }
    }

    pub fn note(message: impl Into<String>, source_offset: usize) -> Self {
        Self {
            kind: DiagnosticKind::Note,
            message: message.into(),
            source_offset,
        }
    }
}

/// Maximum number of `Trace` entries kept for a single runtime error (spec.md §7: "up to 32").
pub const MAX_TRACE_ENTRIES: usize = 32;

/// An append-only, ordered collection of diagnostics.
///
/// Shared by reference across the tokenizer, parser, compiler, and VM so that
/// a render step can walk the whole pipeline's output after a failure.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.entries.push(diagnostic);
    }

    pub fn err(&mut self, message: impl Into<String>, source_offset: usize) {
        self.push(Diagnostic::err(message, source_offset));
    }

    /// Records a runtime error's message plus up to `MAX_TRACE_ENTRIES` trace
    /// frames, with a `Note` if frames were truncated — the shape spec.md §7
    /// requires for a `RuntimeError`.
    pub fn runtime_error(
        &mut self,
        message: impl Into<String>,
        source_offset: usize,
        frames: impl IntoIterator<Item = (String, usize)>,
    ) {
        self.err(message, source_offset);
        let mut recorded = 0usize;
        let mut truncated = false;
        for (frame_message, offset) in frames {
            if recorded >= MAX_TRACE_ENTRIES {
                truncated = true;
                break;
            }
            self.push(Diagnostic::trace(frame_message, offset));
            recorded += 1;
        }
        if truncated {
            self.push(Diagnostic::note(
                "additional stack frames omitted",
                source_offset,
            ));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    /// Renders every diagnostic as `line:col: kind: message`, deriving line
    /// and column from `source` plus each entry's stored byte offset.
    pub fn render(&self, source: &str) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let (line, col) = line_col(source, entry.source_offset);
            let kind = match entry.kind {
                DiagnosticKind::Err => "error",
                DiagnosticKind::Trace => "trace",
                DiagnosticKind::Note => "note",
            };
            out.push_str(&format!("{line}:{col}: {kind}: {}\n", entry.message));
        }
        out
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry.message)?;
        }
        Ok(())
    }
}

/// Converts a byte offset into a 1-based `(line, column)` pair.
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_tracks_newlines() {
        let src = "let x = 1\nlet y = 2\n";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 10), (2, 1));
    }

    #[test]
    fn runtime_error_truncates_trace() {
        let mut diags = Diagnostics::new();
        let frames = (0..40).map(|i| (format!("frame {i}"), 0));
        diags.runtime_error("boom", 0, frames);
        let notes: Vec<_> = diags
            .iter()
            .filter(|d| d.kind == DiagnosticKind::Note)
            .collect();
        assert_eq!(notes.len(), 1);
        let traces = diags
            .iter()
            .filter(|d| d.kind == DiagnosticKind::Trace)
            .count();
        assert_eq!(traces, MAX_TRACE_ENTRIES);
    }
}
