//! Lowering of individual LIR instructions to x86-64 bytes.
//!
//! Every instruction lowers independently into its own buffer. Where an
//! encoding carries an immediate or displacement, the buffer records a
//! [`Fixup`]: where the field sits, how wide it currently is, and how to
//! compute its value once the image layout is known. The relaxation
//! driver re-lowers an instruction with a wider field when the computed
//! value does not fit, so every lowering here must be a pure function of
//! the instruction and the requested widths.
//!
//! Scratch registers come exclusively from the instruction's
//! unused-register snapshot; the `Scratch` tracker makes sure nested
//! helpers do not hand out the same register twice within one
//! instruction.

use super::encoding::{Asm, DispWidth};
use super::regs::{self, enc, is_abcd, RAX, RCX, RDI, RDX, RSI};
use crate::error::{CodegenError, CodegenResult};
use crate::lir::{Inst, Opcode};
use smallvec::SmallVec;

/// Width of an immediate or displacement field.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ImmWidth {
    /// 8-bit signed.
    W8,
    /// 32-bit signed.
    W32,
    /// 64-bit.
    W64,
}

impl ImmWidth {
    /// Field size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            ImmWidth::W8 => 1,
            ImmWidth::W32 => 4,
            ImmWidth::W64 => 8,
        }
    }

    /// Does `v` fit the field?
    pub fn fits(self, v: i64) -> bool {
        match self {
            ImmWidth::W8 => i8::try_from(v).is_ok(),
            ImmWidth::W32 => i32::try_from(v).is_ok(),
            ImmWidth::W64 => true,
        }
    }

    /// The next wider field, if the op family has one.
    pub fn widen(self) -> Option<ImmWidth> {
        match self {
            ImmWidth::W8 => Some(ImmWidth::W32),
            ImmWidth::W32 => Some(ImmWidth::W64),
            ImmWidth::W64 => None,
        }
    }
}

/// Where a fixup's value comes from.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FixupSource {
    /// The sum of the instruction's immediate terms.
    Imm,
    /// The offset of the global region; used by the hosted page-op
    /// shim, which has no counterpart in the instruction's own
    /// immediate list.
    GlobalRegion,
}

/// A patchable field within a lowered instruction.
#[derive(Clone, Debug)]
pub struct Fixup {
    /// Which width slot this fixup occupies (0 = primary, 1 =
    /// auxiliary).
    pub slot: u8,
    /// Byte offset of the field within the buffer.
    pub at: u32,
    /// Current field width.
    pub width: ImmWidth,
    /// The value is measured relative to the end of the field (plus
    /// `addend`); otherwise it is absolute.
    pub pc_rel: bool,
    /// Extra literal folded into the value, correcting for patterns
    /// whose anchor is not the field end (the CALL/POP tricks).
    pub addend: i64,
    /// Value source.
    pub source: FixupSource,
}

/// One lowered instruction.
pub struct Lowered {
    /// The encoding.
    pub asm: Asm,
    /// Patchable fields, at most one per width slot.
    pub fixups: SmallVec<[Fixup; 2]>,
}

/// Target environment facts the lowerer needs.
pub struct EmitInfo {
    /// Lower the page ops to raw Linux syscalls; otherwise call the
    /// host shim published at the start of the global region.
    pub linux: bool,
}

/// Initial widths for an instruction's two fixup slots.
pub fn initial_widths(op: Opcode) -> [ImmWidth; 2] {
    use Opcode::*;
    let primary = match op {
        // CALL only has a rel32 form.
        JPush => ImmWidth::W32,
        // Absolute-target branches materialize a full address.
        JeqI | JneI | JltI | JlteI | JltUI | JlteUI | JzI | JnzI | JI | JlI | JPushI => {
            ImmWidth::W64
        }
        // MOV r/m64, imm32 is the narrowest load-immediate.
        Li => ImmWidth::W32,
        // Absolute memory operands start at disp32.
        Ld8I | Ld16I | Ld32I | Ld64I | St8I | St16I | St32I | St64I | LdSt8I | LdSt16I
        | LdSt32I | LdSt64I => ImmWidth::W32,
        // Counts load into RCX via MOV imm32.
        Mem8CpyI | Mem8CpyI2 | Mem16CpyI | Mem16CpyI2 | Mem32CpyI | Mem32CpyI2 | Mem64CpyI
        | Mem64CpyI2 | PageAllocI | PageFreeI => ImmWidth::W32,
        _ => ImmWidth::W8,
    };
    [primary, ImmWidth::W32]
}

/// Condition-code nibbles.
mod cc {
    pub const E: u8 = 0x4;
    pub const NE: u8 = 0x5;
    pub const B: u8 = 0x2;
    pub const AE: u8 = 0x3;
    pub const A: u8 = 0x7;
    pub const BE: u8 = 0x6;
    pub const L: u8 = 0xC;
    pub const GE: u8 = 0xD;
    pub const LE: u8 = 0xE;
    pub const G: u8 = 0xF;

    /// The negated condition.
    pub fn inv(c: u8) -> u8 {
        c ^ 1
    }
}

/// Scratch-register bookkeeping for one instruction.
struct Scratch {
    taken: u16,
}

impl Scratch {
    fn new() -> Self {
        Self { taken: 0 }
    }

    fn pick_with(
        &mut self,
        inst: &Inst,
        exclude: &[u8],
        filter: impl Fn(u8) -> bool,
    ) -> Option<u8> {
        let unused = inst.unused_regs.as_ref()?;
        for &r in unused.iter() {
            if r == 0 || exclude.contains(&r) || self.taken & (1 << r) != 0 || !filter(r) {
                continue;
            }
            self.taken |= 1 << r;
            return Some(r);
        }
        None
    }

    /// Any free register outside `exclude`.
    fn pick(&mut self, inst: &Inst, exclude: &[u8]) -> Option<u8> {
        self.pick_with(inst, exclude, |_| true)
    }

    /// A free ABCD-class register outside `exclude`.
    fn pick_abcd(&mut self, inst: &Inst, exclude: &[u8]) -> Option<u8> {
        self.pick_with(inst, exclude, is_abcd)
    }
}

fn no_scratch(inst: &Inst) -> CodegenError {
    CodegenError::ScratchUnavailable(inst.op.name().to_string())
}

/// Lower one instruction at the given fixup widths.
pub fn lower_inst(inst: &Inst, widths: [ImmWidth; 2], info: &EmitInfo) -> CodegenResult<Lowered> {
    let mut a = Asm::new();
    let mut fixups: SmallVec<[Fixup; 2]> = SmallVec::new();
    let mut scratch = Scratch::new();
    let w = widths[0];
    let (r1, r2, r3) = (inst.r1, inst.r2, inst.r3);

    use Opcode::*;
    match inst.op {
        // ---- three-address ALU ----------------------------------------
        Add => three_op(&mut a, 0x01, r1, r2, r3, true),
        Sub => {
            if r1 == r3 && r1 != r2 {
                // r1 = r2 - r1: negate and add.
                a.unary_rm(3, r1);
                a.alu_rr(0x01, r2, r1);
            } else {
                three_op(&mut a, 0x29, r1, r2, r3, false);
            }
        }
        And => three_op(&mut a, 0x21, r1, r2, r3, true),
        Or => three_op(&mut a, 0x09, r1, r2, r3, true),
        Xor => three_op(&mut a, 0x31, r1, r2, r3, true),
        Neg => {
            a.mov_rr(r1, r2);
            a.unary_rm(3, r1);
        }
        Not => {
            a.mov_rr(r1, r2);
            a.unary_rm(2, r1);
        }
        Cpy => a.mov_rr(r1, r2),
        Mul => {
            // Low half of the product is the same signed or unsigned.
            if r1 == r2 {
                a.imul_rr(r1, r3);
            } else if r1 == r3 {
                a.imul_rr(r1, r2);
            } else {
                a.mov_rr(r1, r2);
                a.imul_rr(r1, r3);
            }
        }
        MulH => widening_pair(&mut a, WideOp::MulHigh { signed: true }, r1, Operand::Reg(r2), Operand::Reg(r3)),
        MulHU => widening_pair(&mut a, WideOp::MulHigh { signed: false }, r1, Operand::Reg(r2), Operand::Reg(r3)),
        Div => widening_pair(&mut a, WideOp::Div { signed: true, rem: false }, r1, Operand::Reg(r2), Operand::Reg(r3)),
        DivU => widening_pair(&mut a, WideOp::Div { signed: false, rem: false }, r1, Operand::Reg(r2), Operand::Reg(r3)),
        Mod => widening_pair(&mut a, WideOp::Div { signed: true, rem: true }, r1, Operand::Reg(r2), Operand::Reg(r3)),
        ModU => widening_pair(&mut a, WideOp::Div { signed: false, rem: true }, r1, Operand::Reg(r2), Operand::Reg(r3)),

        // ---- ALU with immediate ---------------------------------------
        AddI => alu_imm(&mut a, &mut fixups, &mut scratch, inst, 0, r1, r2, w)?,
        AndI => alu_imm(&mut a, &mut fixups, &mut scratch, inst, 4, r1, r2, w)?,
        OrI => alu_imm(&mut a, &mut fixups, &mut scratch, inst, 1, r1, r2, w)?,
        XorI => alu_imm(&mut a, &mut fixups, &mut scratch, inst, 6, r1, r2, w)?,
        Li => match w {
            ImmWidth::W8 | ImmWidth::W32 => {
                a.mov_ri32(r1, 0);
                push_fixup(&mut fixups, &a, ImmWidth::W32, false, 0);
            }
            ImmWidth::W64 => {
                a.movabs(r1, 0);
                push_fixup(&mut fixups, &a, ImmWidth::W64, false, 0);
            }
        },
        MulI => match w {
            ImmWidth::W8 => {
                a.imul_ri(r1, r2, 0, false);
                push_fixup(&mut fixups, &a, ImmWidth::W8, false, 0);
            }
            ImmWidth::W32 => {
                a.imul_ri(r1, r2, 0, true);
                push_fixup(&mut fixups, &a, ImmWidth::W32, false, 0);
            }
            ImmWidth::W64 => {
                let s = scratch.pick(inst, &[r1, r2]).ok_or_else(|| no_scratch(inst))?;
                a.movabs(s, 0);
                push_fixup(&mut fixups, &a, ImmWidth::W64, false, 0);
                a.mov_rr(r1, r2);
                a.imul_rr(r1, s);
            }
        },
        MulHI | MulHUI | DivI | DivUI | ModI | ModUI | DivI2 | DivUI2 | ModI2 | ModUI2 => {
            // The scratch may be RAX or RDX: the widening sequence reads
            // its operands through their pre-sequence stack saves, which
            // hold the immediate loaded here.
            let s = scratch.pick(inst, &[]).ok_or_else(|| no_scratch(inst))?;
            load_imm(&mut a, &mut fixups, s, w);
            let signed = matches!(inst.op, MulHI | DivI | ModI | DivI2 | ModI2);
            let rem = matches!(inst.op, ModI | ModUI | ModI2 | ModUI2);
            let op = if matches!(inst.op, MulHI | MulHUI) {
                WideOp::MulHigh { signed }
            } else {
                WideOp::Div { signed, rem }
            };
            // The immediate is the dividend for the reversed forms.
            let (lhs, rhs) = if matches!(inst.op, DivI2 | DivUI2 | ModI2 | ModUI2) {
                (Operand::Reg(s), Operand::Reg(r2))
            } else {
                (Operand::Reg(r2), Operand::Reg(s))
            };
            widening_pair(&mut a, op, r1, lhs, rhs);
        }

        // ---- shifts ----------------------------------------------------
        Sll => shift_rr(&mut a, &mut scratch, inst, 4, r1, r2, r3)?,
        Srl => shift_rr(&mut a, &mut scratch, inst, 5, r1, r2, r3)?,
        Sra => shift_rr(&mut a, &mut scratch, inst, 7, r1, r2, r3)?,
        SllI => shift_ri(&mut a, &mut fixups, 4, r1, r2),
        SrlI => shift_ri(&mut a, &mut fixups, 5, r1, r2),
        SraI => shift_ri(&mut a, &mut fixups, 7, r1, r2),
        SllI2 => shift_imm_by_reg(&mut a, &mut fixups, &mut scratch, inst, 4, r1, r2, w)?,
        SrlI2 => shift_imm_by_reg(&mut a, &mut fixups, &mut scratch, inst, 5, r1, r2, w)?,
        SraI2 => shift_imm_by_reg(&mut a, &mut fixups, &mut scratch, inst, 7, r1, r2, w)?,
        Zxt => extend(&mut a, inst, r1, r2, false)?,
        Sxt => extend(&mut a, inst, r1, r2, true)?,

        // ---- comparisons into a register ------------------------------
        Seq => set_cc(&mut a, &mut scratch, inst, cc::E, r1, CmpArgs::RR(r2, r3))?,
        Sne => set_cc(&mut a, &mut scratch, inst, cc::NE, r1, CmpArgs::RR(r2, r3))?,
        Slt => set_cc(&mut a, &mut scratch, inst, cc::L, r1, CmpArgs::RR(r2, r3))?,
        Slte => set_cc(&mut a, &mut scratch, inst, cc::LE, r1, CmpArgs::RR(r2, r3))?,
        SltU => set_cc(&mut a, &mut scratch, inst, cc::B, r1, CmpArgs::RR(r2, r3))?,
        SlteU => set_cc(&mut a, &mut scratch, inst, cc::BE, r1, CmpArgs::RR(r2, r3))?,
        SeqI => set_cc_imm(&mut a, &mut fixups, &mut scratch, inst, cc::E, r1, r2, w)?,
        SneI => set_cc_imm(&mut a, &mut fixups, &mut scratch, inst, cc::NE, r1, r2, w)?,
        SltI => set_cc_imm(&mut a, &mut fixups, &mut scratch, inst, cc::L, r1, r2, w)?,
        SlteI => set_cc_imm(&mut a, &mut fixups, &mut scratch, inst, cc::LE, r1, r2, w)?,
        SltUI => set_cc_imm(&mut a, &mut fixups, &mut scratch, inst, cc::B, r1, r2, w)?,
        SlteUI => set_cc_imm(&mut a, &mut fixups, &mut scratch, inst, cc::BE, r1, r2, w)?,
        SgtI => set_cc_imm(&mut a, &mut fixups, &mut scratch, inst, cc::G, r1, r2, w)?,
        SgteI => set_cc_imm(&mut a, &mut fixups, &mut scratch, inst, cc::GE, r1, r2, w)?,
        SgtUI => set_cc_imm(&mut a, &mut fixups, &mut scratch, inst, cc::A, r1, r2, w)?,
        SgteUI => set_cc_imm(&mut a, &mut fixups, &mut scratch, inst, cc::AE, r1, r2, w)?,
        Sz => set_cc(&mut a, &mut scratch, inst, cc::E, r1, CmpArgs::Test(r2))?,
        Snz => set_cc(&mut a, &mut scratch, inst, cc::NE, r1, CmpArgs::Test(r2))?,

        // ---- relative branches ----------------------------------------
        Jeq | Jne | Jlt | Jlte | JltU | JlteU => {
            a.alu_rr(0x39, r2, r1);
            let c = match inst.op {
                Jeq => cc::E,
                Jne => cc::NE,
                Jlt => cc::L,
                Jlte => cc::LE,
                JltU => cc::B,
                _ => cc::BE,
            };
            branch_rel(&mut a, &mut fixups, &mut scratch, inst, Some(c), w)?;
        }
        Jz | Jnz => {
            a.alu_rr(0x85, r1, r1);
            let c = if inst.op == Jz { cc::E } else { cc::NE };
            branch_rel(&mut a, &mut fixups, &mut scratch, inst, Some(c), w)?;
        }
        J => branch_rel(&mut a, &mut fixups, &mut scratch, inst, None, w)?,
        Jl => {
            // Link: r1 = address of the next LIR instruction, then jump.
            a.call_rel32(0);
            a.pop(r1);
            let patch_at = a.len();
            a.alu_ri32(0, r1, 0);
            branch_rel(&mut a, &mut fixups, &mut scratch, inst, None, w)?;
            let end = a.len() as i64;
            // r1 = pop-address + (end - 5).
            let k = (end - 5) as i32;
            a.bytes[patch_at as usize + 3..patch_at as usize + 7]
                .copy_from_slice(&k.to_le_bytes());
        }
        JPush => match w {
            ImmWidth::W8 | ImmWidth::W32 => {
                a.call_rel32(0);
                push_fixup(&mut fixups, &a, ImmWidth::W32, true, 0);
            }
            ImmWidth::W64 => {
                let s1 = scratch.pick(inst, &[]).ok_or_else(|| no_scratch(inst))?;
                let s2 = scratch.pick(inst, &[s1]).ok_or_else(|| no_scratch(inst))?;
                jpush_far(&mut a, &mut fixups, s1, s2);
            }
        },
        JPop => a.ret(),

        // ---- register-target branches ---------------------------------
        JeqR | JneR | JltR | JlteR | JltUR | JlteUR => {
            a.alu_rr(0x39, r2, r1);
            let c = match inst.op {
                JeqR => cc::E,
                JneR => cc::NE,
                JltR => cc::L,
                JlteR => cc::LE,
                JltUR => cc::B,
                _ => cc::BE,
            };
            // Inverse-skip over an indirect jump.
            let skip = jmp_reg_len(r3);
            a.jcc_rel8(cc::inv(c), skip as i8);
            a.jmp_reg(r3);
        }
        JzR | JnzR => {
            a.alu_rr(0x85, r1, r1);
            let c = if inst.op == JzR { cc::E } else { cc::NE };
            let skip = jmp_reg_len(r2);
            a.jcc_rel8(cc::inv(c), skip as i8);
            a.jmp_reg(r2);
        }
        JR => a.jmp_reg(r1),
        JlR => {
            a.call_rel32(0);
            a.pop(r1);
            let patch_at = a.len();
            a.alu_ri32(0, r1, 0);
            a.jmp_reg(r2);
            // r1 = popped address (always +5 into the op) plus the
            // remaining length, i.e. the end of this op.
            let k = (a.len() - 5) as i32;
            a.bytes[patch_at as usize + 3..patch_at as usize + 7]
                .copy_from_slice(&k.to_le_bytes());
        }
        JPushR => a.call_reg(r1),

        // ---- absolute-target branches ---------------------------------
        JeqI | JneI | JltI | JlteI | JltUI | JlteUI | JzI | JnzI | JI | JlI | JPushI => {
            absolute_branch(&mut a, &mut fixups, &mut scratch, inst)?;
        }

        Afip => {
            a.call_rel32(0);
            a.pop(r1);
            match w {
                ImmWidth::W8 => {
                    a.alu_ri8(0, r1, 0);
                    push_pcrel_anchor(&mut fixups, &a, ImmWidth::W8, 5);
                }
                ImmWidth::W32 => {
                    a.alu_ri32(0, r1, 0);
                    push_pcrel_anchor(&mut fixups, &a, ImmWidth::W32, 5);
                }
                ImmWidth::W64 => {
                    let s = scratch.pick(inst, &[r1]).ok_or_else(|| no_scratch(inst))?;
                    a.movabs(s, 0);
                    push_pcrel_anchor(&mut fixups, &a, ImmWidth::W64, 5);
                    a.alu_rr(0x01, s, r1);
                }
            }
        }

        // ---- memory ----------------------------------------------------
        Ld8 | Ld16 | Ld32 | Ld64 => {
            let size = mem_size(inst.op);
            mem_disp(&mut a, &mut fixups, &mut scratch, inst, w, MemKind::Load(size), r1, r2)?;
        }
        Ld8R | Ld16R | Ld32R | Ld64R => {
            a.load_ind(mem_size(inst.op), r1, r2);
        }
        Ld8I | Ld16I | Ld32I | Ld64I => {
            mem_abs(&mut a, &mut fixups, &mut scratch, inst, w, MemKind::Load(mem_size(inst.op)), r1)?;
        }
        St8 | St16 | St32 | St64 => {
            let size = mem_size(inst.op);
            mem_disp(&mut a, &mut fixups, &mut scratch, inst, w, MemKind::Store(size), r1, r2)?;
        }
        St8R | St16R | St32R | St64R => {
            a.store_ind(mem_size(inst.op), r1, r2);
        }
        St8I | St16I | St32I | St64I => {
            mem_abs(&mut a, &mut fixups, &mut scratch, inst, w, MemKind::Store(mem_size(inst.op)), r1)?;
        }
        LdSt8 | LdSt16 | LdSt32 | LdSt64 => {
            let size = mem_size(inst.op);
            mem_disp(&mut a, &mut fixups, &mut scratch, inst, w, MemKind::Swap(size), r1, r2)?;
        }
        LdSt8R | LdSt16R | LdSt32R | LdSt64R => {
            a.xchg(mem_size(inst.op), r1, r2, 0, DispWidth::D8);
        }
        LdSt8I | LdSt16I | LdSt32I | LdSt64I => {
            mem_abs(&mut a, &mut fixups, &mut scratch, inst, w, MemKind::Swap(mem_size(inst.op)), r1)?;
        }

        // ---- block copies ---------------------------------------------
        Mem8Cpy | Mem16Cpy | Mem32Cpy | Mem64Cpy => {
            mem_cpy(&mut a, &mut fixups, inst, mem_size(inst.op), false, Count::Reg(r3), w);
        }
        Mem8CpyI | Mem16CpyI | Mem32CpyI | Mem64CpyI => {
            mem_cpy(&mut a, &mut fixups, inst, mem_size(inst.op), false, Count::Imm, w);
        }
        Mem8Cpy2 | Mem16Cpy2 | Mem32Cpy2 | Mem64Cpy2 => {
            mem_cpy(&mut a, &mut fixups, inst, mem_size(inst.op), true, Count::Reg(r3), w);
        }
        Mem8CpyI2 | Mem16CpyI2 | Mem32CpyI2 | Mem64CpyI2 => {
            mem_cpy(&mut a, &mut fixups, inst, mem_size(inst.op), true, Count::Imm, w);
        }

        // ---- page management ------------------------------------------
        PageAlloc => page_op(&mut a, &mut fixups, info, PageCall::Alloc(Count::Reg(r2)), r1, w),
        PageAllocI => page_op(&mut a, &mut fixups, info, PageCall::Alloc(Count::Imm), r1, w),
        PageFree => page_op(&mut a, &mut fixups, info, PageCall::Free(Count::Reg(r2)), r1, w),
        PageFreeI => page_op(&mut a, &mut fixups, info, PageCall::Free(Count::Imm), r1, w),
        StackPageAlloc => page_op(&mut a, &mut fixups, info, PageCall::StackAlloc, r1, w),
        StackPageFree => page_op(&mut a, &mut fixups, info, PageCall::StackFree, r1, w),

        // ---- verbatim and padding -------------------------------------
        MachineCode => {
            if let Some(bytes) = &inst.bytes {
                a.bytes.extend_from_slice(bytes);
            }
        }
        Nop => a.nop(),
        Comment => {}
    }

    if inst.binsz != 0 {
        if a.len() > inst.binsz {
            return Err(CodegenError::BinarySizeTooSmall {
                forced: inst.binsz,
                emitted: a.len(),
            });
        }
        while a.len() < inst.binsz {
            a.nop();
        }
    }

    Ok(Lowered { asm: a, fixups })
}

// ---- small shared pieces ------------------------------------------------

fn mem_size(op: Opcode) -> u32 {
    use Opcode::*;
    match op {
        Ld8 | Ld8R | Ld8I | St8 | St8R | St8I | LdSt8 | LdSt8R | LdSt8I | Mem8Cpy | Mem8CpyI
        | Mem8Cpy2 | Mem8CpyI2 => 1,
        Ld16 | Ld16R | Ld16I | St16 | St16R | St16I | LdSt16 | LdSt16R | LdSt16I | Mem16Cpy
        | Mem16CpyI | Mem16Cpy2 | Mem16CpyI2 => 2,
        Ld32 | Ld32R | Ld32I | St32 | St32R | St32I | LdSt32 | LdSt32R | LdSt32I | Mem32Cpy
        | Mem32CpyI | Mem32Cpy2 | Mem32CpyI2 => 4,
        _ => 8,
    }
}

/// Record a fixup for the field that ends at the current buffer
/// position.
fn push_fixup(fixups: &mut SmallVec<[Fixup; 2]>, a: &Asm, width: ImmWidth, pc_rel: bool, addend: i64) {
    fixups.push(Fixup {
        slot: 0,
        at: a.len() - width.bytes(),
        width,
        pc_rel,
        addend,
        source: FixupSource::Imm,
    });
}

/// Record a pc-relative fixup whose anchor is not the field end but the
/// buffer offset `anchor` (the CALL/POP patterns measure from the
/// popped address).
fn push_pcrel_anchor(fixups: &mut SmallVec<[Fixup; 2]>, a: &Asm, width: ImmWidth, anchor: u32) {
    let at = a.len() - width.bytes();
    fixups.push(Fixup {
        slot: 0,
        at,
        width,
        pc_rel: true,
        addend: (at + width.bytes()) as i64 - anchor as i64,
        source: FixupSource::Imm,
    });
}

/// `dst = a ⊕ b` through the two-operand hardware form.
fn three_op(asm: &mut Asm, opcode: u8, dst: u8, a: u8, b: u8, commutative: bool) {
    if dst == a {
        asm.alu_rr(opcode, b, dst);
    } else if dst == b && commutative {
        asm.alu_rr(opcode, a, dst);
    } else if dst == b {
        debug_assert!(false, "non-commutative aliasing handled by the caller");
    } else {
        asm.mov_rr(dst, a);
        asm.alu_rr(opcode, b, dst);
    }
}

/// Group-1 ALU against the instruction's immediate.
#[allow(clippy::too_many_arguments)]
fn alu_imm(
    a: &mut Asm,
    fixups: &mut SmallVec<[Fixup; 2]>,
    scratch: &mut Scratch,
    inst: &Inst,
    ext: u8,
    r1: u8,
    r2: u8,
    w: ImmWidth,
) -> CodegenResult<()> {
    match w {
        ImmWidth::W8 => {
            a.mov_rr(r1, r2);
            a.alu_ri8(ext, r1, 0);
            push_fixup(fixups, a, ImmWidth::W8, false, 0);
        }
        ImmWidth::W32 => {
            a.mov_rr(r1, r2);
            a.alu_ri32(ext, r1, 0);
            push_fixup(fixups, a, ImmWidth::W32, false, 0);
        }
        ImmWidth::W64 => {
            let s = scratch.pick(inst, &[r1, r2]).ok_or_else(|| no_scratch(inst))?;
            a.movabs(s, 0);
            push_fixup(fixups, a, ImmWidth::W64, false, 0);
            a.mov_rr(r1, r2);
            // Map the group-1 extension back to its register-register
            // opcode.
            let rr = match ext {
                0 => 0x01, // add
                1 => 0x09, // or
                4 => 0x21, // and
                5 => 0x29, // sub
                6 => 0x31, // xor
                _ => 0x39, // cmp
            };
            a.alu_rr(rr, s, r1);
        }
    }
    Ok(())
}

/// Load the instruction's immediate into `dst`.
fn load_imm(a: &mut Asm, fixups: &mut SmallVec<[Fixup; 2]>, dst: u8, w: ImmWidth) {
    match w {
        ImmWidth::W8 | ImmWidth::W32 => {
            a.mov_ri32(dst, 0);
            push_fixup(fixups, a, ImmWidth::W32, false, 0);
        }
        ImmWidth::W64 => {
            a.movabs(dst, 0);
            push_fixup(fixups, a, ImmWidth::W64, false, 0);
        }
    }
}

/// The operations that pass through RDX:RAX.
#[derive(Copy, Clone)]
enum WideOp {
    MulHigh { signed: bool },
    Div { signed: bool, rem: bool },
}

#[derive(Copy, Clone)]
enum Operand {
    Reg(u8),
}

/// Stack slot (relative to RSP after the two saves) where a register's
/// pre-sequence value lives.
fn saved_slot(r: u8) -> Option<i8> {
    match r {
        RDX => Some(0),
        RAX => Some(8),
        _ => None,
    }
}

/// The RDX:RAX dance shared by multiply-high, divide, and modulo: save
/// both, feed RAX (and RDX via CQO/zero), run the one-operand form,
/// extract the result, restore what the destination does not cover.
fn widening_pair(a: &mut Asm, op: WideOp, r1: u8, lhs: Operand, rhs: Operand) {
    let Operand::Reg(lhs) = lhs;
    let Operand::Reg(rhs) = rhs;
    a.push(RAX);
    a.push(RDX);
    // Dividend / multiplicand into RAX, possibly from its saved slot.
    match saved_slot(lhs) {
        Some(slot) => a.load_rsp(RAX, slot),
        None => a.mov_rr(RAX, lhs),
    }
    let (ext, result) = match op {
        WideOp::MulHigh { signed: true } => (5, RDX),
        WideOp::MulHigh { signed: false } => (4, RDX),
        WideOp::Div { signed, rem } => {
            if signed {
                a.cqo();
            } else {
                a.zero(RDX);
            }
            (if signed { 7 } else { 6 }, if rem { RDX } else { RAX })
        }
    };
    // The r/m operand must dodge RAX/RDX, which are live with sequence
    // state; their old values sit in the stack slots.
    match saved_slot(rhs) {
        Some(slot) => a.unary_rsp(ext, slot),
        None => a.unary_rm(ext, rhs),
    }
    // Result extraction without losing the saves.
    if r1 == RAX {
        if result != RAX {
            a.mov_rr(RAX, result);
        }
        a.pop(RDX);
        a.alu_ri8(0, 0, 8); // add rsp, 8: discard saved rax
    } else if r1 == RDX {
        if result != RDX {
            a.mov_rr(RDX, result);
        }
        a.alu_ri8(0, 0, 8); // discard saved rdx
        a.pop(RAX);
    } else {
        a.mov_rr(r1, result);
        a.pop(RDX);
        a.pop(RAX);
    }
}

/// Variable-count shift: count must ride in CL.
fn shift_rr(
    a: &mut Asm,
    scratch: &mut Scratch,
    inst: &Inst,
    ext: u8,
    r1: u8,
    r2: u8,
    r3: u8,
) -> CodegenResult<()> {
    if let Some(s) = scratch.pick(inst, &[RCX, r3]) {
        a.mov_rr(s, r2);
        a.push(RCX);
        if r3 != RCX {
            a.mov_rr(RCX, r3);
        }
        a.shift_cl(ext, s);
        a.pop(RCX);
        a.mov_rr(r1, s);
        return Ok(());
    }
    // No scratch: shift the value in its stack slot instead.
    a.push(RCX);
    a.push(r2);
    if r3 == RCX {
        a.load_rsp(RCX, 8);
    } else {
        a.mov_rr(RCX, r3);
    }
    // shl/shr/sar qword [rsp], cl
    a.shift_cl_rsp_slot(ext);
    if r1 == RCX {
        a.pop(RCX);
        a.alu_ri8(0, 0, 8); // discard the saved rcx; the result is rcx
    } else {
        a.pop(r1);
        a.pop(RCX);
    }
    Ok(())
}

/// Shift by an immediate count. The count field is a hardware imm8 and
/// can never widen.
fn shift_ri(a: &mut Asm, fixups: &mut SmallVec<[Fixup; 2]>, ext: u8, r1: u8, r2: u8) {
    a.mov_rr(r1, r2);
    a.shift_imm(ext, r1, 0);
    push_fixup(fixups, a, ImmWidth::W8, false, 0);
    // Width is hardware-locked; the relaxation driver errors out if the
    // count cannot fit, which only a corrupt count can cause.
}

/// `r1 = imm shifted by r2`.
#[allow(clippy::too_many_arguments)]
fn shift_imm_by_reg(
    a: &mut Asm,
    fixups: &mut SmallVec<[Fixup; 2]>,
    scratch: &mut Scratch,
    inst: &Inst,
    ext: u8,
    r1: u8,
    r2: u8,
    w: ImmWidth,
) -> CodegenResult<()> {
    let s = scratch.pick(inst, &[RCX, r2]).ok_or_else(|| no_scratch(inst))?;
    load_imm(a, fixups, s, w);
    a.push(RCX);
    if r2 != RCX {
        a.mov_rr(RCX, r2);
    }
    a.shift_cl(ext, s);
    a.pop(RCX);
    a.mov_rr(r1, s);
    Ok(())
}

/// Zero or sign extension of the low `n` bits, via a shift pair. The
/// bit count is always a single literal immediate.
fn extend(a: &mut Asm, inst: &Inst, r1: u8, r2: u8, signed: bool) -> CodegenResult<()> {
    let n = inst.resolved_imm().ok_or_else(|| {
        CodegenError::UnresolvedImmediate(format!("{} bit count", inst.op.name()))
    })?;
    if n == 0 || n >= 64 {
        a.mov_rr(r1, r2);
        return Ok(());
    }
    let back = (64 - n) as u8;
    a.mov_rr(r1, r2);
    a.shift_imm(4, r1, back);
    a.shift_imm(if signed { 7 } else { 5 }, r1, back);
    Ok(())
}

enum CmpArgs {
    /// `cmp r, r`.
    RR(u8, u8),
    /// `test r, r`.
    Test(u8),
}

/// Materialize a condition into a 0/1 register via SETcc. The legacy
/// byte form wants an ABCD-class register: use the destination when it
/// qualifies, else borrow an unused ABCD register, else save one around
/// the operation.
fn set_cc(
    a: &mut Asm,
    scratch: &mut Scratch,
    inst: &Inst,
    c: u8,
    r1: u8,
    args: CmpArgs,
) -> CodegenResult<()> {
    let (x, y, is_test) = match args {
        CmpArgs::RR(x, y) => (x, y, false),
        CmpArgs::Test(x) => (x, x, true),
    };
    let sources = [x, y];
    let cmp = |a: &mut Asm| {
        if is_test {
            a.alu_rr(0x85, x, x);
        } else {
            a.alu_rr(0x39, y, x);
        }
    };
    if is_abcd(r1) && !sources.contains(&r1) {
        a.zero(r1);
        cmp(a);
        a.setcc(c, r1);
        return Ok(());
    }
    let mut exclude: Vec<u8> = sources.into();
    exclude.push(r1);
    if let Some(s) = scratch.pick_abcd(inst, &exclude) {
        a.zero(s);
        cmp(a);
        a.setcc(c, s);
        a.mov_rr(r1, s);
        return Ok(());
    }
    // Save an ABCD register around the operation. Three exclusions
    // leave at least one of the four.
    let v = *regs::ABCD
        .iter()
        .find(|&&v| !exclude.contains(&v))
        .expect("four ABCD registers minus three exclusions");
    a.push(v);
    a.zero(v);
    cmp(a);
    a.setcc(c, v);
    a.mov_rr(r1, v);
    a.pop(v);
    Ok(())
}

/// SETcc against `r2 cmp imm`.
#[allow(clippy::too_many_arguments)]
fn set_cc_imm(
    a: &mut Asm,
    fixups: &mut SmallVec<[Fixup; 2]>,
    scratch: &mut Scratch,
    inst: &Inst,
    c: u8,
    r1: u8,
    r2: u8,
    w: ImmWidth,
) -> CodegenResult<()> {
    match w {
        ImmWidth::W8 | ImmWidth::W32 => {
            let wide = w == ImmWidth::W32;
            let cmp = |a: &mut Asm, fixups: &mut SmallVec<[Fixup; 2]>| {
                if wide {
                    a.alu_ri32(7, r2, 0);
                    push_fixup(fixups, a, ImmWidth::W32, false, 0);
                } else {
                    a.alu_ri8(7, r2, 0);
                    push_fixup(fixups, a, ImmWidth::W8, false, 0);
                }
            };
            if is_abcd(r1) && r1 != r2 {
                a.zero(r1);
                cmp(a, fixups);
                a.setcc(c, r1);
                return Ok(());
            }
            if let Some(s) = scratch.pick_abcd(inst, &[r1, r2]) {
                a.zero(s);
                cmp(a, fixups);
                a.setcc(c, s);
                a.mov_rr(r1, s);
                return Ok(());
            }
            let v = *regs::ABCD
                .iter()
                .find(|&&v| v != r1 && v != r2)
                .expect("two exclusions leave an ABCD register");
            a.push(v);
            a.zero(v);
            cmp(a, fixups);
            a.setcc(c, v);
            a.mov_rr(r1, v);
            a.pop(v);
            Ok(())
        }
        ImmWidth::W64 => {
            let si = scratch.pick(inst, &[r1, r2]).ok_or_else(|| no_scratch(inst))?;
            a.movabs(si, 0);
            push_fixup(fixups, a, ImmWidth::W64, false, 0);
            set_cc(a, scratch, inst, c, r1, CmpArgs::RR(r2, si))
        }
    }
}

fn jmp_reg_len(r: u8) -> u32 {
    if enc(r) >= 8 {
        3
    } else {
        2
    }
}

/// The relative branch tail: a short form, an inverse-skip over a near
/// form, or an inverse-skip over the far CALL/RET pattern.
fn branch_rel(
    a: &mut Asm,
    fixups: &mut SmallVec<[Fixup; 2]>,
    scratch: &mut Scratch,
    inst: &Inst,
    c: Option<u8>,
    w: ImmWidth,
) -> CodegenResult<()> {
    match w {
        ImmWidth::W8 => {
            match c {
                Some(c) => a.jcc_rel8(c, 0),
                None => a.jmp_rel8(0),
            }
            push_fixup(fixups, a, ImmWidth::W8, true, 0);
        }
        ImmWidth::W32 => {
            if let Some(c) = c {
                a.jcc_rel8(cc::inv(c), 5);
            }
            a.jmp_rel32(0);
            push_fixup(fixups, a, ImmWidth::W32, true, 0);
        }
        ImmWidth::W64 => {
            // call +0; movabs s, delta; add [rsp], s; ret — the pushed
            // address plus delta becomes the target.
            let s = scratch.pick(inst, &[]).ok_or_else(|| no_scratch(inst))?;
            if let Some(c) = c {
                let far_len = 5 + 10 + 4 + 1;
                a.jcc_rel8(cc::inv(c), far_len);
            }
            let call_end = a.len() + 5;
            a.call_rel32(0);
            a.movabs(s, 0);
            let at = a.len() - 8;
            fixups.push(Fixup {
                slot: 0,
                at,
                width: ImmWidth::W64,
                pc_rel: true,
                addend: (at + 8) as i64 - call_end as i64,
                source: FixupSource::Imm,
            });
            a.add_to_rsp_slot(s);
            a.ret();
        }
    }
    Ok(())
}

/// Far `JPush`: push a corrected return address, then an indirect far
/// jump computed from the instruction pointer.
fn jpush_far(a: &mut Asm, fixups: &mut SmallVec<[Fixup; 2]>, s1: u8, s2: u8) {
    // call +0 pushes the address of the next byte; bias it to the end
    // of this whole pattern so the callee returns past us.
    let a1 = a.len() + 5;
    a.call_rel32(0);
    let movabs1_at = a.len();
    a.movabs(s1, 0); // patched below with a constant, not a fixup
    a.add_to_rsp_slot(s1);
    let a2 = a.len() + 5;
    a.call_rel32(0);
    a.pop(s1);
    a.movabs(s2, 0);
    let at = a.len() - 8;
    fixups.push(Fixup {
        slot: 0,
        at,
        width: ImmWidth::W64,
        pc_rel: true,
        addend: (at + 8) as i64 - a2 as i64,
        source: FixupSource::Imm,
    });
    a.alu_rr(0x01, s2, s1);
    a.jmp_reg(s1);
    // Now the total length is known: the pushed return address must
    // point at the end.
    let end = a.len() as i64;
    let delta = end - a1 as i64;
    a.bytes[movabs1_at as usize + 2..movabs1_at as usize + 10]
        .copy_from_slice(&delta.to_le_bytes());
}

/// Branches to an absolute address: materialize it, then jump, link, or
/// push-and-jump through a register.
fn absolute_branch(
    a: &mut Asm,
    fixups: &mut SmallVec<[Fixup; 2]>,
    scratch: &mut Scratch,
    inst: &Inst,
) -> CodegenResult<()> {
    use Opcode::*;
    let (r1, r2, r3) = (inst.r1, inst.r2, inst.r3);
    let exclude: Vec<u8> = match inst.op {
        JlI | JzI | JnzI => vec![r1],
        JeqI | JneI | JltI | JlteI | JltUI | JlteUI => vec![r1, r2],
        _ => Vec::new(),
    };
    let s = scratch.pick(inst, &exclude).ok_or_else(|| no_scratch(inst))?;
    // Conditional forms test first and skip the materialize+jump when
    // the condition fails.
    let cond = match inst.op {
        JeqI => Some((cc::E, true)),
        JneI => Some((cc::NE, true)),
        JltI => Some((cc::L, true)),
        JlteI => Some((cc::LE, true)),
        JltUI => Some((cc::B, true)),
        JlteUI => Some((cc::BE, true)),
        JzI => Some((cc::E, false)),
        JnzI => Some((cc::NE, false)),
        _ => None,
    };
    if let Some((c, is_cmp)) = cond {
        if is_cmp {
            a.alu_rr(0x39, r2, r1);
        } else {
            a.alu_rr(0x85, r1, r1);
        }
        let skip = 10 + jmp_reg_len(s);
        a.jcc_rel8(cc::inv(c), skip as i8);
    }
    a.movabs(s, 0);
    push_fixup(fixups, a, ImmWidth::W64, false, 0);
    match inst.op {
        JPushI => a.call_reg(s),
        JlI => {
            a.call_rel32(0);
            a.pop(r1);
            let patch_at = a.len();
            a.alu_ri32(0, r1, 0);
            a.jmp_reg(s);
            let call_off = patch_at - 1 - if enc(r1) >= 8 { 2 } else { 1 } - 4;
            let k = (a.len() - (call_off + 5)) as i32;
            a.bytes[patch_at as usize + 3..patch_at as usize + 7]
                .copy_from_slice(&k.to_le_bytes());
        }
        _ => a.jmp_reg(s),
    }
    Ok(())
}

enum MemKind {
    Load(u32),
    Store(u32),
    Swap(u32),
}

/// `[r2 + disp]` accesses, widening the displacement as needed. The
/// 64-bit path forms the address in a scratch register first.
#[allow(clippy::too_many_arguments)]
fn mem_disp(
    a: &mut Asm,
    fixups: &mut SmallVec<[Fixup; 2]>,
    scratch: &mut Scratch,
    inst: &Inst,
    w: ImmWidth,
    kind: MemKind,
    r1: u8,
    r2: u8,
) -> CodegenResult<()> {
    match w {
        ImmWidth::W8 | ImmWidth::W32 => {
            let dw = if w == ImmWidth::W8 { DispWidth::D8 } else { DispWidth::D32 };
            match kind {
                MemKind::Load(sz) => a.load(sz, r1, r2, 0, dw),
                MemKind::Store(sz) => a.store(sz, r1, r2, 0, dw),
                MemKind::Swap(sz) => a.xchg(sz, r1, r2, 0, dw),
            }
            push_fixup(fixups, a, w, false, 0);
        }
        ImmWidth::W64 => {
            let s = scratch.pick(inst, &[r1, r2]).ok_or_else(|| no_scratch(inst))?;
            a.movabs(s, 0);
            push_fixup(fixups, a, ImmWidth::W64, false, 0);
            a.alu_rr(0x01, r2, s);
            match kind {
                MemKind::Load(sz) => a.load_ind(sz, r1, s),
                MemKind::Store(sz) => a.store_ind(sz, r1, s),
                MemKind::Swap(sz) => a.xchg(sz, r1, s, 0, DispWidth::D8),
            }
        }
    }
    Ok(())
}

/// `[imm]` absolute accesses.
fn mem_abs(
    a: &mut Asm,
    fixups: &mut SmallVec<[Fixup; 2]>,
    scratch: &mut Scratch,
    inst: &Inst,
    w: ImmWidth,
    kind: MemKind,
    r1: u8,
) -> CodegenResult<()> {
    // There is no absolute 32-bit form worth the SIB contortions once
    // relaxation can demand 64 bits anyway; form the address in a
    // register for both widths.
    let _ = w;
    let s = scratch.pick(inst, &[r1]).ok_or_else(|| no_scratch(inst))?;
    a.movabs(s, 0);
    push_fixup(fixups, a, ImmWidth::W64, false, 0);
    match kind {
        MemKind::Load(sz) => a.load_ind(sz, r1, s),
        MemKind::Store(sz) => a.store_ind(sz, r1, s),
        MemKind::Swap(sz) => a.xchg(sz, r1, s, 0, DispWidth::D8),
    }
    Ok(())
}

enum Count {
    Reg(u8),
    Imm,
}

/// REP MOVS block copy. RDI/RSI/RCX are loaded from the LIR registers
/// (through their stack saves when they collide), the copy runs, the
/// advanced pointers flow back into r1/r2, and the saved registers are
/// restored.
fn mem_cpy(
    a: &mut Asm,
    fixups: &mut SmallVec<[Fixup; 2]>,
    inst: &Inst,
    elem: u32,
    downward: bool,
    count: Count,
    w: ImmWidth,
) {
    let (r1, r2) = (inst.r1, inst.r2);
    // Saves: [rsp]=rcx, [rsp+8]=rsi, [rsp+16]=rdi.
    a.push(RDI);
    a.push(RSI);
    a.push(RCX);
    let slot = |r: u8| -> Option<i8> {
        match r {
            RCX => Some(0),
            RSI => Some(8),
            RDI => Some(16),
            _ => None,
        }
    };
    let fill = |a: &mut Asm, target: u8, src: u8| {
        if target == src {
            return;
        }
        match slot(src) {
            Some(sl) => a.load_rsp(target, sl),
            None => a.mov_rr(target, src),
        }
    };
    fill(a, RDI, r1);
    fill(a, RSI, r2);
    match count {
        Count::Reg(r3) => fill(a, RCX, r3),
        Count::Imm => {
            if w == ImmWidth::W64 {
                a.movabs(RCX, 0);
                push_fixup(fixups, a, ImmWidth::W64, false, 0);
            } else {
                a.mov_ri32(RCX, 0);
                push_fixup(fixups, a, ImmWidth::W32, false, 0);
            }
        }
    }
    if downward {
        a.std_();
    } else {
        a.cld();
    }
    a.rep_movs(elem);
    if downward {
        a.cld();
    }
    // Advanced pointers out: through the saved slots when the targets
    // are among the saved registers, so the pops deliver them.
    let out = |a: &mut Asm, dst: u8, src: u8| {
        if dst == src {
            return;
        }
        match slot(dst) {
            Some(sl) => a.store_rsp(src, sl),
            None => a.mov_rr(dst, src),
        }
    };
    out(a, r1, RDI);
    out(a, r2, RSI);
    a.pop(RCX);
    a.pop(RSI);
    a.pop(RDI);
}

enum PageCall {
    Alloc(Count),
    Free(Count),
    StackAlloc,
    StackFree,
}

/// Page management: a raw `mmap`/`munmap` syscall on Linux, a call
/// through the host shim published at the start of the global region
/// elsewhere. Every register the sequence touches is saved around it.
fn page_op(
    a: &mut Asm,
    fixups: &mut SmallVec<[Fixup; 2]>,
    info: &EmitInfo,
    call: PageCall,
    r1: u8,
    w: ImmWidth,
) {
    // Saves, top of stack last: rax at [rsp+64] … r11 at [rsp].
    const SAVED: [u8; 9] = [RAX, RDI, RSI, RDX, RCX, 8, 9, 10, 11];
    for &r in &SAVED {
        a.push(r);
    }
    let slot = |r: u8| -> Option<i8> {
        SAVED
            .iter()
            .position(|&s| s == r)
            .map(|i| ((SAVED.len() - 1 - i) * 8) as i8)
    };
    let fill = |a: &mut Asm, target: u8, src: u8| {
        if target == src {
            return;
        }
        match slot(src) {
            Some(sl) => a.load_rsp(target, sl),
            None => a.mov_rr(target, src),
        }
    };
    let count_into_rsi = |a: &mut Asm, fixups: &mut SmallVec<[Fixup; 2]>, count: &Count| {
        match count {
            Count::Reg(r) => fill(a, RSI, *r),
            Count::Imm => {
                if w == ImmWidth::W64 {
                    a.movabs(RSI, 0);
                    push_fixup(fixups, a, ImmWidth::W64, false, 0);
                } else {
                    a.mov_ri32(RSI, 0);
                    push_fixup(fixups, a, ImmWidth::W32, false, 0);
                }
            }
        }
        a.shift_imm(4, RSI, 12); // pages → bytes
    };

    if info.linux {
        match &call {
            PageCall::Alloc(count) => {
                count_into_rsi(a, fixups, count);
                a.zero(RDI);
                a.mov_ri32(RDX, 3); // PROT_READ | PROT_WRITE
                a.mov_ri32(10, 0x22); // MAP_PRIVATE | MAP_ANONYMOUS
                a.mov_ri32(8, -1);
                a.zero(9);
                a.mov_ri32(RAX, 9); // mmap
                a.syscall();
            }
            PageCall::StackAlloc => {
                a.mov_ri32(RSI, 4096);
                a.zero(RDI);
                a.mov_ri32(RDX, 3);
                a.mov_ri32(10, 0x22);
                a.mov_ri32(8, -1);
                a.zero(9);
                a.mov_ri32(RAX, 9);
                a.syscall();
            }
            PageCall::Free(count) => {
                fill(a, RDI, r1);
                a.alu_ri32(4, RDI, -4096); // page-align down
                count_into_rsi(a, fixups, count);
                a.mov_ri32(RAX, 11); // munmap
                a.syscall();
            }
            PageCall::StackFree => {
                fill(a, RDI, r1);
                a.alu_ri32(4, RDI, -4096);
                a.mov_ri32(RSI, 4096);
                a.mov_ri32(RAX, 11);
                a.syscall();
            }
        }
    } else {
        // Host shim: a function pointer the loader writes at global
        // region offset 0, called as shim(op, addr, count_bytes).
        let opcode = match &call {
            PageCall::Alloc(_) => 0,
            PageCall::Free(_) => 1,
            PageCall::StackAlloc => 2,
            PageCall::StackFree => 3,
        };
        match &call {
            PageCall::Alloc(count) => {
                count_into_rsi(a, fixups, count);
                a.mov_rr(RDX, RSI);
                a.zero(RSI);
            }
            PageCall::StackAlloc => {
                a.mov_ri32(RDX, 4096);
                a.zero(RSI);
            }
            PageCall::Free(count) => {
                fill(a, RSI, r1);
                a.alu_ri32(4, RSI, -4096);
                count_into_rdx(a, fixups, count, w, &fill);
            }
            PageCall::StackFree => {
                fill(a, RSI, r1);
                a.alu_ri32(4, RSI, -4096);
                a.mov_ri32(RDX, 4096);
            }
        }
        a.mov_ri32(RDI, opcode);
        // rcx = &shim (saved, free to clobber): call +0; pop; add.
        let call_end = a.len() + 5;
        a.call_rel32(0);
        a.pop(RCX);
        a.alu_ri32(0, RCX, 0);
        let at = a.len() - 4;
        fixups.push(Fixup {
            slot: 1,
            at,
            width: ImmWidth::W32,
            pc_rel: true,
            addend: (at + 4) as i64 - call_end as i64,
            source: FixupSource::GlobalRegion,
        });
        a.load_ind(8, RCX, RCX);
        a.call_reg(RCX);
    }

    // Result normalization and extraction for the allocating calls.
    let returns = matches!(call, PageCall::Alloc(_) | PageCall::StackAlloc);
    if returns {
        if info.linux {
            // mmap failures are small negative errnos; fold them to -1.
            a.alu_ri32(7, RAX, -4096); // cmp rax, -4096
            a.jcc_rel8(cc::B, 7); // below (unsigned): a valid address
            a.mov_ri32(RAX, -1);
        }
        match slot(r1) {
            Some(sl) => a.store_rsp(RAX, sl),
            None => a.mov_rr(r1, RAX),
        }
    }
    for &r in SAVED.iter().rev() {
        a.pop(r);
    }
}

/// The byte count for the hosted free calls, into RDX.
fn count_into_rdx(
    a: &mut Asm,
    fixups: &mut SmallVec<[Fixup; 2]>,
    count: &Count,
    w: ImmWidth,
    fill: &impl Fn(&mut Asm, u8, u8),
) {
    match count {
        Count::Reg(r) => fill(a, RDX, *r),
        Count::Imm => {
            if w == ImmWidth::W64 {
                a.movabs(RDX, 0);
                push_fixup(fixups, a, ImmWidth::W64, false, 0);
            } else {
                a.mov_ri32(RDX, 0);
                push_fixup(fixups, a, ImmWidth::W32, false, 0);
            }
        }
    }
    a.shift_imm(4, RDX, 12);
}
