//! Bog: a small dynamically-typed embeddable scripting language.
//!
//! A source string is tokenized ([`tokenizer`]), parsed into an arena-backed
//! AST ([`parser`], [`ast`]), lowered into bytecode ([`compiler`]) and run on
//! a register-based virtual machine ([`vm`]) over a GC-managed value model
//! ([`value`], [`gc`]). [`engine`] is the host-facing entry point that ties
//! these stages together; most embedders only need that module.

pub mod ast;
pub mod compiler;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod gc;
pub mod module;
pub mod parser;
pub mod token;
pub mod tokenizer;
pub mod value;
pub mod vm;

pub use diagnostics::Diagnostics;
pub use engine::{Engine, EngineOptions};
pub use error::BogError;
pub use gc::Value;
