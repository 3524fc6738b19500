//! The x86-64 backend.
//!
//! Lowers every LIR instruction to bytes ([`emit`]), then iteratively
//! resolves immediates and widens any field that overflows its encoding
//! until the layout reaches a fixpoint ([`image`]), and finally lays
//! out `instructions | strings` with export/import tables and the
//! line-table debug sections.

pub mod encoding;
pub mod emit;
pub mod image;
pub mod regs;

#[cfg(test)]
mod emit_tests;

pub use image::{emit_image, Alignment, Image};
