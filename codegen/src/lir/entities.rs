//! Entity references used across the compiler.
//!
//! All of these are arena indices; see the [`entity`](crate::entity)
//! module. Instruction references are indices into the owning function's
//! instruction list, not into a global arena, since branches never cross
//! function boundaries (cross-function transfers go through
//! `ImmVal::OffsetToFunction`).

use crate::entity::entity_impl;

/// A reference to a function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub(crate) u32);
entity_impl!(FuncId, "fn");

/// A reference to a variable.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) u32);
entity_impl!(VarId, "var");

/// A reference to a declared type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) u32);
entity_impl!(TypeId, "ty");

/// A reference to an instruction within its owning function's list.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub(crate) u32);
entity_impl!(InstId, "inst");

/// A reference to a shared region within a stackframe holder's frame.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub(crate) u32);
entity_impl!(RegionId, "region");
