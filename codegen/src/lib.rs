//! Compiler core for the Davit language.
//!
//! Davit is a small imperative language with nested functions. This
//! crate takes source text to a loadable x86-64 image in five stages:
//!
//! 1. the [`frontend`] lexes and parses the source into an AST;
//! 2. the [`analyzer`]'s first pass walks every function body,
//!    classifying call arguments, counting calls, and recording which
//!    enclosing stackframes each function reads through;
//! 3. the [`planner`] decides which functions hold their own stackframe
//!    and which share a region of an ancestor's frame, then the
//!    analyzer's second pass re-walks the AST and emits [`lir`]
//!    instructions through a per-function LRU register file;
//! 4. the [`lir::resolver`] collapses symbolic frame-size immediates to
//!    literals once planning data is final;
//! 5. the [`isa::x64`] backend lowers each instruction to bytes,
//!    iteratively widening immediates that overflow their encoding, and
//!    lays out the image with export/import tables and line-table debug
//!    info.
//!
//! The programmatic entry points are [`Context::compile`] for stages
//! 1–4 and [`isa::x64::emit_image`] for stage 5.

#![warn(missing_docs)]

pub mod entity;

pub mod analyzer;
pub mod context;
pub mod error;
pub mod frontend;
pub mod func;
pub mod isa;
pub mod lir;
pub mod planner;
pub mod settings;
pub mod sourceloc;
pub mod typestr;
pub mod vars;

pub use context::{Compilation, Context};
pub use error::{CodegenError, CompileError, CompileResult};
pub use settings::{CompileFlags, CompileOptions};
