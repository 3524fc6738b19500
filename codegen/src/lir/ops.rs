//! The LIR operation set.
//!
//! A fixed enumeration of three-address operations. Register ids are
//! abstract: id 0 is the stack pointer and is never allocated; ids
//! `1..=nbr_of_gpr` are general purpose. `imm` refers to the
//! instruction's immediate list, summed at resolve time.
//!
//! Backend implementations of these ops must not make function calls of
//! their own: the stack pointer register may have been backtracked into a
//! holder's frame to reach a tiny stackframe, and a call would overwrite
//! live frames above it. `StackPageAlloc`/`StackPageFree` are the
//! exception; they only ever run while the stack pointer is at the top of
//! the call stack.

macro_rules! define_opcodes {
    ($($(#[doc = $doc:expr])* $variant:ident = $name:expr;)*) => {
        /// An LIR operation.
        #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[doc = $doc])* $variant,)*
        }

        impl Opcode {
            /// Number of opcodes.
            pub const COUNT: usize = [$(Opcode::$variant,)*].len();

            /// All opcodes, in declaration order.
            pub fn all() -> impl Iterator<Item = Opcode> {
                const ALL: [Opcode; Opcode::COUNT] = [$(Opcode::$variant,)*];
                ALL.into_iter()
            }

            /// Lowercase mnemonic, as used in textual LIR listings.
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }
        }

        impl core::fmt::Display for Opcode {
            fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

define_opcodes! {
    /// `r1 = r2 + r3`
    Add = "add";
    /// `r1 = r2 + imm`
    AddI = "addi";
    /// `r1 = r2 - r3`
    Sub = "sub";
    /// `r1 = -r2`
    Neg = "neg";
    /// `r1 = r2 * r3`, signed.
    Mul = "mul";
    /// `r1 = high(r2 * r3)`, signed.
    MulH = "mulh";
    /// `r1 = r2 / r3`, signed.
    Div = "div";
    /// `r1 = r2 % r3`, signed.
    Mod = "mod";
    /// `r1 = high(r2 * r3)`, unsigned.
    MulHU = "mulhu";
    /// `r1 = r2 / r3`, unsigned.
    DivU = "divu";
    /// `r1 = r2 % r3`, unsigned.
    ModU = "modu";
    /// `r1 = r2 * imm`, signed.
    MulI = "muli";
    /// `r1 = high(r2 * imm)`, signed.
    MulHI = "mulhi";
    /// `r1 = r2 / imm`, signed.
    DivI = "divi";
    /// `r1 = r2 % imm`, signed.
    ModI = "modi";
    /// `r1 = imm / r2`, signed.
    DivI2 = "divi2";
    /// `r1 = imm % r2`, signed.
    ModI2 = "modi2";
    /// `r1 = high(r2 * imm)`, unsigned.
    MulHUI = "mulhui";
    /// `r1 = r2 / imm`, unsigned.
    DivUI = "divui";
    /// `r1 = r2 % imm`, unsigned.
    ModUI = "modui";
    /// `r1 = imm / r2`, unsigned.
    DivUI2 = "divui2";
    /// `r1 = imm % r2`, unsigned.
    ModUI2 = "modui2";
    /// `r1 = r2 & r3`
    And = "and";
    /// `r1 = r2 & imm`
    AndI = "andi";
    /// `r1 = r2 | r3`
    Or = "or";
    /// `r1 = r2 | imm`
    OrI = "ori";
    /// `r1 = r2 ^ r3`
    Xor = "xor";
    /// `r1 = r2 ^ imm`
    XorI = "xori";
    /// `r1 = ~r2`
    Not = "not";
    /// `r1 = r2`
    Cpy = "cpy";
    /// `r1 = r2 << r3`, logical.
    Sll = "sll";
    /// `r1 = r2 << imm`, logical.
    SllI = "slli";
    /// `r1 = imm << r2`, logical.
    SllI2 = "slli2";
    /// `r1 = r2 >> r3`, logical.
    Srl = "srl";
    /// `r1 = r2 >> imm`, logical.
    SrlI = "srli";
    /// `r1 = imm >> r2`, logical.
    SrlI2 = "srli2";
    /// `r1 = r2 >> r3`, arithmetic.
    Sra = "sra";
    /// `r1 = r2 >> imm`, arithmetic.
    SraI = "srai";
    /// `r1 = imm >> r2`, arithmetic.
    SraI2 = "srai2";
    /// Zero extend the low `imm` bits of r2 into r1. No-op if imm is 0.
    /// A single `Value` immediate is guaranteed.
    Zxt = "zxt";
    /// Sign extend the low `imm` bits of r2 into r1. No-op if imm is 0.
    /// A single `Value` immediate is guaranteed.
    Sxt = "sxt";
    /// `r1 = (r2 == r3) ? 1 : 0`
    Seq = "seq";
    /// `r1 = (r2 != r3) ? 1 : 0`
    Sne = "sne";
    /// `r1 = (r2 == imm) ? 1 : 0`
    SeqI = "seqi";
    /// `r1 = (r2 != imm) ? 1 : 0`
    SneI = "snei";
    /// `r1 = (r2 < r3) ? 1 : 0`, signed.
    Slt = "slt";
    /// `r1 = (r2 <= r3) ? 1 : 0`, signed.
    Slte = "slte";
    /// `r1 = (r2 < r3) ? 1 : 0`, unsigned.
    SltU = "sltu";
    /// `r1 = (r2 <= r3) ? 1 : 0`, unsigned.
    SlteU = "slteu";
    /// `r1 = (r2 < imm) ? 1 : 0`, signed.
    SltI = "slti";
    /// `r1 = (r2 <= imm) ? 1 : 0`, signed.
    SlteI = "sltei";
    /// `r1 = (r2 < imm) ? 1 : 0`, unsigned.
    SltUI = "sltui";
    /// `r1 = (r2 <= imm) ? 1 : 0`, unsigned.
    SlteUI = "slteui";
    /// `r1 = (r2 > imm) ? 1 : 0`, signed.
    SgtI = "sgti";
    /// `r1 = (r2 >= imm) ? 1 : 0`, signed.
    SgteI = "sgtei";
    /// `r1 = (r2 > imm) ? 1 : 0`, unsigned.
    SgtUI = "sgtui";
    /// `r1 = (r2 >= imm) ? 1 : 0`, unsigned.
    SgteUI = "sgteui";
    /// `r1 = (r2 == 0) ? 1 : 0`
    Sz = "sz";
    /// `r1 = (r2 != 0) ? 1 : 0`
    Snz = "snz";
    /// `if (r1 == r2) goto imm`, relative. First branching op.
    Jeq = "jeq";
    /// `if (r1 == r2) goto imm`, absolute.
    JeqI = "jeqi";
    /// `if (r1 == r2) goto r3`.
    JeqR = "jeqr";
    /// `if (r1 != r2) goto imm`, relative.
    Jne = "jne";
    /// `if (r1 != r2) goto imm`, absolute.
    JneI = "jnei";
    /// `if (r1 != r2) goto r3`.
    JneR = "jner";
    /// `if (r1 < r2) goto imm`, relative, signed.
    Jlt = "jlt";
    /// `if (r1 < r2) goto imm`, absolute, signed.
    JltI = "jlti";
    /// `if (r1 < r2) goto r3`, signed.
    JltR = "jltr";
    /// `if (r1 <= r2) goto imm`, relative, signed.
    Jlte = "jlte";
    /// `if (r1 <= r2) goto imm`, absolute, signed.
    JlteI = "jltei";
    /// `if (r1 <= r2) goto r3`, signed.
    JlteR = "jlter";
    /// `if (r1 < r2) goto imm`, relative, unsigned.
    JltU = "jltu";
    /// `if (r1 < r2) goto imm`, absolute, unsigned.
    JltUI = "jltui";
    /// `if (r1 < r2) goto r3`, unsigned.
    JltUR = "jltur";
    /// `if (r1 <= r2) goto imm`, relative, unsigned.
    JlteU = "jlteu";
    /// `if (r1 <= r2) goto imm`, absolute, unsigned.
    JlteUI = "jlteui";
    /// `if (r1 <= r2) goto r3`, unsigned.
    JlteUR = "jlteur";
    /// `if (r1 == 0) goto imm`, relative.
    Jz = "jz";
    /// `if (r1 == 0) goto imm`, absolute.
    JzI = "jzi";
    /// `if (r1 == 0) goto r2`.
    JzR = "jzr";
    /// `if (r1 != 0) goto imm`, relative.
    Jnz = "jnz";
    /// `if (r1 != 0) goto imm`, absolute.
    JnzI = "jnzi";
    /// `if (r1 != 0) goto r2`.
    JnzR = "jnzr";
    /// `goto imm`, relative.
    J = "j";
    /// `goto imm`, absolute.
    JI = "ji";
    /// `goto r1`.
    JR = "jr";
    /// `r1 = address of next instruction; goto imm`, relative.
    Jl = "jl";
    /// `r1 = address of next instruction; goto imm`, absolute.
    JlI = "jli";
    /// `r1 = address of next instruction; goto r2`.
    JlR = "jlr";
    /// Stack-push address of next instruction; `goto imm`, relative.
    JPush = "jpush";
    /// Stack-push address of next instruction; `goto imm`, absolute.
    JPushI = "jpushi";
    /// Stack-push address of next instruction; `goto r1`.
    JPushR = "jpushr";
    /// Stack-pop an address and continue execution there. Last branching
    /// op.
    JPop = "jpop";
    /// `r1 = address of this instruction + imm` (address from
    /// instruction pointer).
    Afip = "afip";
    /// `r1 = imm`
    Li = "li";
    /// Load 8 bits from `[r2 + imm]` into r1, zero extended.
    Ld8 = "ld8";
    /// Load 8 bits from `[r2]` into r1, zero extended.
    Ld8R = "ld8r";
    /// Load 8 bits from `[imm]` into r1, zero extended.
    Ld8I = "ld8i";
    /// Load 16 bits from `[r2 + imm]` into r1, zero extended.
    Ld16 = "ld16";
    /// Load 16 bits from `[r2]` into r1, zero extended.
    Ld16R = "ld16r";
    /// Load 16 bits from `[imm]` into r1, zero extended.
    Ld16I = "ld16i";
    /// Load 32 bits from `[r2 + imm]` into r1, zero extended.
    Ld32 = "ld32";
    /// Load 32 bits from `[r2]` into r1, zero extended.
    Ld32R = "ld32r";
    /// Load 32 bits from `[imm]` into r1, zero extended.
    Ld32I = "ld32i";
    /// Load 64 bits from `[r2 + imm]` into r1.
    Ld64 = "ld64";
    /// Load 64 bits from `[r2]` into r1.
    Ld64R = "ld64r";
    /// Load 64 bits from `[imm]` into r1.
    Ld64I = "ld64i";
    /// Store the low 8 bits of r1 at `[r2 + imm]`.
    St8 = "st8";
    /// Store the low 8 bits of r1 at `[r2]`.
    St8R = "st8r";
    /// Store the low 8 bits of r1 at `[imm]`.
    St8I = "st8i";
    /// Store the low 16 bits of r1 at `[r2 + imm]`.
    St16 = "st16";
    /// Store the low 16 bits of r1 at `[r2]`.
    St16R = "st16r";
    /// Store the low 16 bits of r1 at `[imm]`.
    St16I = "st16i";
    /// Store the low 32 bits of r1 at `[r2 + imm]`.
    St32 = "st32";
    /// Store the low 32 bits of r1 at `[r2]`.
    St32R = "st32r";
    /// Store the low 32 bits of r1 at `[imm]`.
    St32I = "st32i";
    /// Store r1 at `[r2 + imm]`.
    St64 = "st64";
    /// Store r1 at `[r2]`.
    St64R = "st64r";
    /// Store r1 at `[imm]`.
    St64I = "st64i";
    /// Atomically swap the low 8 bits of r1 with `[r2 + imm]`.
    LdSt8 = "ldst8";
    /// Atomically swap the low 8 bits of r1 with `[r2]`.
    LdSt8R = "ldst8r";
    /// Atomically swap the low 8 bits of r1 with `[imm]`.
    LdSt8I = "ldst8i";
    /// Atomically swap the low 16 bits of r1 with `[r2 + imm]`.
    LdSt16 = "ldst16";
    /// Atomically swap the low 16 bits of r1 with `[r2]`.
    LdSt16R = "ldst16r";
    /// Atomically swap the low 16 bits of r1 with `[imm]`.
    LdSt16I = "ldst16i";
    /// Atomically swap the low 32 bits of r1 with `[r2 + imm]`.
    LdSt32 = "ldst32";
    /// Atomically swap the low 32 bits of r1 with `[r2]`.
    LdSt32R = "ldst32r";
    /// Atomically swap the low 32 bits of r1 with `[imm]`.
    LdSt32I = "ldst32i";
    /// Atomically swap r1 with `[r2 + imm]`.
    LdSt64 = "ldst64";
    /// Atomically swap r1 with `[r2]`.
    LdSt64R = "ldst64r";
    /// Atomically swap r1 with `[imm]`.
    LdSt64I = "ldst64i";
    /// Copy r3 bytes from `[r2]` to `[r1]` ascending; r1 and r2 end past
    /// the last byte copied. r1, r2, r3 are distinct and the count is
    /// never zero.
    Mem8Cpy = "mem8cpy";
    /// Copy imm bytes from `[r2]` to `[r1]` ascending.
    Mem8CpyI = "mem8cpyi";
    /// Copy r3 bytes from `[r2]` to `[r1]` descending.
    Mem8Cpy2 = "mem8cpy2";
    /// Copy imm bytes from `[r2]` to `[r1]` descending.
    Mem8CpyI2 = "mem8cpyi2";
    /// Copy r3 u16s from `[r2]` to `[r1]` ascending.
    Mem16Cpy = "mem16cpy";
    /// Copy imm u16s from `[r2]` to `[r1]` ascending.
    Mem16CpyI = "mem16cpyi";
    /// Copy r3 u16s from `[r2]` to `[r1]` descending.
    Mem16Cpy2 = "mem16cpy2";
    /// Copy imm u16s from `[r2]` to `[r1]` descending.
    Mem16CpyI2 = "mem16cpyi2";
    /// Copy r3 u32s from `[r2]` to `[r1]` ascending.
    Mem32Cpy = "mem32cpy";
    /// Copy imm u32s from `[r2]` to `[r1]` ascending.
    Mem32CpyI = "mem32cpyi";
    /// Copy r3 u32s from `[r2]` to `[r1]` descending.
    Mem32Cpy2 = "mem32cpy2";
    /// Copy imm u32s from `[r2]` to `[r1]` descending.
    Mem32CpyI2 = "mem32cpyi2";
    /// Copy r3 u64s from `[r2]` to `[r1]` ascending.
    Mem64Cpy = "mem64cpy";
    /// Copy imm u64s from `[r2]` to `[r1]` ascending.
    Mem64CpyI = "mem64cpyi";
    /// Copy r3 u64s from `[r2]` to `[r1]` descending.
    Mem64Cpy2 = "mem64cpy2";
    /// Copy imm u64s from `[r2]` to `[r1]` descending.
    Mem64CpyI2 = "mem64cpyi2";
    /// Allocate r2 readable-writable pages; r1 = first page address, or
    /// -1 on failure.
    PageAlloc = "pagealloc";
    /// Allocate imm readable-writable pages; r1 = first page address, or
    /// -1 on failure. A single `Value` immediate is guaranteed.
    PageAllocI = "pagealloci";
    /// Free r2 pages starting at the page containing the address in r1.
    PageFree = "pagefree";
    /// Free imm pages starting at the page containing the address in r1.
    /// A single `Value` immediate is guaranteed.
    PageFreeI = "pagefreei";
    /// Allocate one stack page; r1 = page address, or -1 on failure.
    /// Generated only while the stack pointer is at the top of the call
    /// stack.
    StackPageAlloc = "stackpagealloc";
    /// Free the stack page containing the address in r1.
    StackPageFree = "stackpagefree";
    /// Verbatim machine code bytes from an `asm` block.
    MachineCode = "machinecode";
    /// No operation. A cue that branching occurs to the following
    /// instruction; safe for a backend to ignore. Among the instructions
    /// between two `Nop`s only the first is a branch target, and all
    /// registers are flushed at the start of such a block.
    Nop = "nop";
    /// A compiler narration string. Emits nothing.
    Comment = "comment";
}

impl Opcode {
    /// Is this a branching operation? The branching ops form a contiguous
    /// range so this is an ordinal comparison.
    pub fn is_branch(self) -> bool {
        (self as u8) >= (Opcode::Jeq as u8) && (self as u8) <= (Opcode::JPop as u8)
    }

    /// Does this branch carry a relative target in its immediate list?
    /// These are the ops whose resolved immediate must point at a real
    /// (non-`Nop`, non-`Comment`) instruction.
    pub fn is_rel_branch(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Jeq | Jne | Jlt | Jlte | JltU | JlteU | Jz | Jnz | J | Jl | JPush
        )
    }

    /// Default number of unused registers the backend wants available
    /// when this op is generated. Hosts can demand more through
    /// `CompileOptions::min_unused_reg_count_for_op`, never less.
    ///
    /// These are strict minimums: where the backend has a save/restore
    /// fallback (the RDX:RAX dance, the string-op saves, the SETcc
    /// push path), the op demands nothing. Over-demanding here would
    /// deadlock three-register targets.
    pub fn default_min_unused_regs(self) -> u8 {
        use Opcode::*;
        match self {
            // Immediate operands of the widening family materialize in
            // a scratch register; the RDX:RAX juggling itself runs on
            // stack saves.
            MulI | MulHI | MulHUI | DivI | DivUI | ModI | ModUI | DivI2 | DivUI2 | ModI2
            | ModUI2 => 1,
            // Wide displacements and 64-bit immediates go through a
            // scratch register.
            _ if self.is_branch() => 1,
            Li | Afip | AddI | AndI | OrI | XorI | SllI2 | SrlI2 | SraI2 => 1,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_range_is_contiguous() {
        let mut inside = false;
        for op in Opcode::all() {
            if op == Opcode::Jeq {
                inside = true;
            }
            assert_eq!(op.is_branch(), inside, "{op}");
            if op == Opcode::JPop {
                inside = false;
            }
        }
    }

    #[test]
    fn names_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for op in Opcode::all() {
            assert!(seen.insert(op.name()), "duplicate name {}", op.name());
        }
    }
}
