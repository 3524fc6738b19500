//! The LIR: the low-level intermediate representation exchanged between
//! the analyzer and the machine backends.
//!
//! Every function carries a list of [`Inst`]s. An instruction names up to
//! three abstract registers and may carry a list of [`ImmVal`]s; the
//! immediate of the instruction is the *sum* of the list, which lets the
//! analyzer describe addresses like "minus this function's local area,
//! minus its pointer cache, minus a fixed header" without knowing any of
//! the sizes yet. The [`resolver`] collapses every symbolic term into a
//! plain value once planning data is final; machine backends only ever
//! see `ImmVal::Value`.

pub mod entities;
mod ops;
pub mod resolver;

pub use entities::{FuncId, InstId, RegionId, TypeId, VarId};
pub use ops::Opcode;

use crate::sourceloc::SourceLoc;
use smallvec::SmallVec;
use std::fmt;

/// One term of an instruction's immediate. Terms are summed at resolve
/// time. After resolution only `Value` remains.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ImmVal {
    /// A literal value.
    Value(i64),
    /// Relative address of an instruction in the same function.
    OffsetToInstruction(InstId),
    /// Relative address of a function's first instruction.
    OffsetToFunction(FuncId),
    /// Relative address of the global variable region.
    OffsetToGlobalRegion,
    /// Relative address of the string constant region.
    OffsetToStringRegion,
    /// Maximum size of the function's local variables.
    LocalVarsSize(FuncId),
    /// Negated `LocalVarsSize`.
    NegLocalVarsSize(FuncId),
    /// Size of the function's stackframe-pointer cache.
    StackframePtrCacheSize(FuncId),
    /// Negated `StackframePtrCacheSize`.
    NegStackframePtrCacheSize(FuncId),
    /// Size of the function's shared region.
    SharedRegionSize(FuncId),
    /// Negated `SharedRegionSize`.
    NegSharedRegionSize(FuncId),
    /// Offset of a shared region within its holder's shared area.
    OffsetWithinSharedRegion(RegionId),
}

impl ImmVal {
    /// Is this a resolved literal?
    pub fn is_value(&self) -> bool {
        matches!(self, ImmVal::Value(_))
    }
}

/// The immediate list type. Most instructions carry zero or one term;
/// frame address computations carry up to four.
pub type ImmList = SmallVec<[ImmVal; 2]>;

/// An LIR instruction.
///
/// Instructions live in their function's `insts` vector, in emission
/// order; `InstId` indexes into it. The `bytes`/`text` payloads are only
/// populated for `MachineCode` and `Comment` respectively.
#[derive(Clone, Debug)]
pub struct Inst {
    /// The operation.
    pub op: Opcode,
    /// First register id. 0 is the stack pointer.
    pub r1: u8,
    /// Second register id.
    pub r2: u8,
    /// Third register id.
    pub r3: u8,
    /// Immediate terms, summed at resolve time. Empty when the op takes
    /// no immediate.
    pub imm: ImmList,
    /// Machine code bytes, for `Opcode::MachineCode`.
    pub bytes: Option<Box<[u8]>>,
    /// Comment text, for `Opcode::Comment`.
    pub text: Option<Box<str>>,
    /// When non-zero, the binary encoding must be padded with NOPs up to
    /// exactly this many bytes. It is an error for the natural encoding
    /// to be larger.
    pub binsz: u32,
    /// Ids of registers that were unallocated when this instruction was
    /// generated. The backend may clobber these freely as scratch.
    /// `None` when the snapshot was empty.
    pub unused_regs: Option<SmallVec<[u8; 8]>>,
    /// Where this instruction came from.
    pub loc: SourceLoc,
}

impl Inst {
    /// A new instruction with no registers, immediates, or payloads.
    pub fn new(op: Opcode) -> Self {
        Self {
            op,
            r1: 0,
            r2: 0,
            r3: 0,
            imm: SmallVec::new(),
            bytes: None,
            text: None,
            binsz: 0,
            unused_regs: None,
            loc: SourceLoc::unknown(),
        }
    }

    /// Sum of the immediate terms, if every term is a resolved `Value`.
    pub fn resolved_imm(&self) -> Option<i64> {
        let mut total: i64 = 0;
        for term in &self.imm {
            match term {
                ImmVal::Value(n) => total = total.wrapping_add(*n),
                _ => return None,
            }
        }
        Some(total)
    }

    /// The branch target, when this is a relative branch. Relies on the
    /// invariant that relative branches carry exactly one
    /// `OffsetToInstruction` term.
    pub fn branch_target(&self) -> Option<InstId> {
        if !self.op.is_rel_branch() {
            return None;
        }
        self.imm.iter().find_map(|t| match t {
            ImmVal::OffsetToInstruction(i) => Some(*i),
            _ => None,
        })
    }

    /// Can a register read through this instruction survive in a
    /// register cache? `Nop` marks a branch target, so everything is
    /// invalidated there; `Comment` is transparent.
    pub fn is_transparent(&self) -> bool {
        self.op == Opcode::Comment
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.op)?;
        match self.op {
            Opcode::Comment => {
                if let Some(text) = &self.text {
                    write!(f, " ; {text}")?;
                }
                return Ok(());
            }
            Opcode::MachineCode => {
                if let Some(bytes) = &self.bytes {
                    write!(f, " ({} bytes)", bytes.len())?;
                }
                return Ok(());
            }
            _ => {}
        }
        write!(f, " %{}, %{}, %{}", self.r1, self.r2, self.r3)?;
        if !self.imm.is_empty() {
            write!(f, ", ")?;
            for (i, term) in self.imm.iter().enumerate() {
                if i > 0 {
                    write!(f, "+")?;
                }
                match term {
                    ImmVal::Value(n) => write!(f, "{n}")?,
                    ImmVal::OffsetToInstruction(id) => write!(f, "@{id}")?,
                    ImmVal::OffsetToFunction(id) => write!(f, "@{id}")?,
                    ImmVal::OffsetToGlobalRegion => write!(f, "@globals")?,
                    ImmVal::OffsetToStringRegion => write!(f, "@strings")?,
                    ImmVal::LocalVarsSize(id) => write!(f, "localsz({id})")?,
                    ImmVal::NegLocalVarsSize(id) => write!(f, "-localsz({id})")?,
                    ImmVal::StackframePtrCacheSize(id) => write!(f, "cachesz({id})")?,
                    ImmVal::NegStackframePtrCacheSize(id) => write!(f, "-cachesz({id})")?,
                    ImmVal::SharedRegionSize(id) => write!(f, "sharedsz({id})")?,
                    ImmVal::NegSharedRegionSize(id) => write!(f, "-sharedsz({id})")?,
                    ImmVal::OffsetWithinSharedRegion(id) => write!(f, "regionoff({id})")?,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_imm_sums_values() {
        let mut inst = Inst::new(Opcode::AddI);
        inst.imm.push(ImmVal::Value(40));
        inst.imm.push(ImmVal::Value(2));
        assert_eq!(inst.resolved_imm(), Some(42));
    }

    #[test]
    fn symbolic_imm_is_not_resolved() {
        let mut inst = Inst::new(Opcode::AddI);
        inst.imm.push(ImmVal::Value(1));
        inst.imm.push(ImmVal::LocalVarsSize(FuncId(0)));
        assert_eq!(inst.resolved_imm(), None);
    }

    #[test]
    fn empty_imm_resolves_to_zero() {
        let inst = Inst::new(Opcode::Nop);
        assert_eq!(inst.resolved_imm(), Some(0));
    }
}
