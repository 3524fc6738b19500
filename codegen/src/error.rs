//! Error types for compilation and code generation.
//!
//! User-caused failures (bad source, bad options, stack budgets exceeded)
//! are `CompileError`s and are also reported through the diagnostic
//! callback with a source location before the compile call returns.
//! `CodegenError`s are backend failures: they indicate either corrupt LIR
//! reaching the lowerer or a violated scratch-register contract, and are
//! bugs in the caller or in the compiler itself rather than in the program
//! being compiled.

use thiserror::Error;

/// A convenient alias for a `Result` using the `CompileError` error type.
pub type CompileResult<T> = Result<T, CompileError>;

/// A convenient alias for a `Result` using the `CodegenError` error type.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// An error produced while turning source text into resolved LIR.
#[derive(Error, Debug)]
pub enum CompileError {
    /// The options handed to the compiler are unusable; nothing was
    /// compiled. Distinct from a source error so hosts can tell their own
    /// misconfiguration apart from a user program failure.
    #[error("invalid compile options: {0}")]
    InvalidOptions(String),

    /// Lexical or syntactic failure at a source location. The message has
    /// already been routed through the diagnostic callback.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Semantic failure: undeclared identifier, type mismatch, signature
    /// conflict, scope violation.
    #[error("semantic error: {0}")]
    Semantic(String),

    /// A function's stackframe cannot fit within its budget even after
    /// every possible tenant has been forced into holding its own frame.
    #[error("capacity exceeded: {0}")]
    Capacity(String),
}

/// An error produced while lowering resolved LIR to machine code.
#[derive(Error, Debug)]
pub enum CodegenError {
    /// An instruction reached the lowerer that it does not recognize or
    /// that carries operands it cannot encode.
    #[error("unsupported instruction: {0}")]
    Unsupported(String),

    /// The lowerer needed a scratch register but the instruction's
    /// unused-register list could not supply one, despite the per-op
    /// minimum promised in the compile options.
    #[error("scratch register unavailable while lowering {0}")]
    ScratchUnavailable(String),

    /// A forced binary size (`binsz`) was smaller than the bytes the
    /// instruction actually required. Padding can only grow an encoding.
    #[error("forced binary size {forced} smaller than emitted size {emitted}")]
    BinarySizeTooSmall {
        /// The size the instruction demanded.
        forced: u32,
        /// The size the encoding actually needed.
        emitted: u32,
    },

    /// An immediate was still symbolic when the lowerer saw it. The
    /// resolver must run to completion before lowering starts.
    #[error("unresolved immediate reached the backend: {0}")]
    UnresolvedImmediate(String),
}
