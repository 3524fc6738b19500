//! Machine backends.
//!
//! One backend exists: [`x64`]. A backend consumes a finished
//! [`Compilation`](crate::Compilation) — resolved LIR plus region data —
//! and produces a loadable image. Nothing in the analyzer or planner
//! knows which backend will run; the LIR is the entire contract.

pub mod x64;
