//! The late-binding immediate resolver.
//!
//! Runs once after pass 2, when every frame size is final. Each
//! instruction's immediate terms are rewritten in place:
//!
//! - branch targets slide forward past `Nop` and `Comment`
//!   instructions, which emit no bytes, so every branch lands on a real
//!   operation;
//! - the frame-size kinds collapse to literals from the planner's
//!   numbers;
//! - literals are sign-extended to the target GPR width.
//!
//! `OffsetToInstruction`, `OffsetToFunction`, `OffsetToGlobalRegion`,
//! and `OffsetToStringRegion` stay symbolic: they are distances in the
//! *encoded* image, which only the backend can measure. Resolving twice
//! is a no-op.

use crate::entity::EntityRef;
use crate::func::Module;
use crate::lir::{ImmVal, InstId, Opcode};

/// Sign-extend `n` to `bits` wide.
fn sign_extend(n: i64, bits: u32) -> i64 {
    if bits >= 64 {
        return n;
    }
    let shift = 64 - bits;
    (n << shift) >> shift
}

/// Resolve every immediate in `p2` using the planner's sizes. `p1`
/// provides the shared-region offsets.
pub fn resolve(p2: &mut Module, p1: &Module, bitsizeof_gpr: u32) {
    let funcs: Vec<_> = p2.funcs.keys().collect();
    for f in funcs {
        // Opcode shadow, so targets can be inspected while immediates
        // are rewritten.
        let ops: Vec<Opcode> = p2.funcs[f].insts.iter().map(|i| i.op).collect();
        let mut insts = std::mem::take(&mut p2.funcs[f].insts);
        for inst in insts.iter_mut() {
            for term in inst.imm.iter_mut() {
                match *term {
                    ImmVal::OffsetToInstruction(mut target) => {
                        // A `Nop` only marks a branch target and a
                        // `Comment` emits nothing; the real target is
                        // the next instruction carrying bytes. Neither
                        // can end a function, so the walk always lands.
                        while matches!(ops[target.index()], Opcode::Nop | Opcode::Comment) {
                            target = InstId(target.index() as u32 + 1);
                        }
                        *term = ImmVal::OffsetToInstruction(target);
                    }
                    ImmVal::LocalVarsSize(g) => {
                        *term = value(p2_local(p2, g), bitsizeof_gpr);
                    }
                    ImmVal::NegLocalVarsSize(g) => {
                        *term = value(-p2_local(p2, g), bitsizeof_gpr);
                    }
                    ImmVal::StackframePtrCacheSize(g) => {
                        *term = value(p2_cache(p2, g), bitsizeof_gpr);
                    }
                    ImmVal::NegStackframePtrCacheSize(g) => {
                        *term = value(-p2_cache(p2, g), bitsizeof_gpr);
                    }
                    ImmVal::SharedRegionSize(g) => {
                        *term = value(p2_shared(p2, g), bitsizeof_gpr);
                    }
                    ImmVal::NegSharedRegionSize(g) => {
                        *term = value(-p2_shared(p2, g), bitsizeof_gpr);
                    }
                    ImmVal::OffsetWithinSharedRegion(r) => {
                        *term = value(p1.regions[r].offset as i64, bitsizeof_gpr);
                    }
                    ImmVal::Value(n) => {
                        *term = value(n, bitsizeof_gpr);
                    }
                    ImmVal::OffsetToFunction(_)
                    | ImmVal::OffsetToGlobalRegion
                    | ImmVal::OffsetToStringRegion => {}
                }
            }
        }
        p2.funcs[f].insts = insts;
    }
}

fn value(n: i64, bits: u32) -> ImmVal {
    ImmVal::Value(sign_extend(n, bits))
}

fn p2_local(p2: &Module, f: crate::lir::FuncId) -> i64 {
    p2.funcs[f].local_vars_max_size as i64
}

fn p2_cache(p2: &Module, f: crate::lir::FuncId) -> i64 {
    p2.funcs[f].stackframe_ptr_cache_size as i64
}

fn p2_shared(p2: &Module, f: crate::lir::FuncId) -> i64 {
    p2.funcs[f].shared_region_size as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{FuncId, Inst};
    use smallvec::smallvec;

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend(0xff, 8), -1);
        assert_eq!(sign_extend(0x7f, 8), 127);
        assert_eq!(sign_extend(0xffff_ffff, 32), -1);
        assert_eq!(sign_extend(-5, 64), -5);
    }

    fn module_with_insts(insts: Vec<Inst>) -> Module {
        let mut m = Module::new();
        let root = m.root();
        m.funcs[root].insts = insts;
        m
    }

    #[test]
    fn branch_targets_skip_nops_and_comments() {
        let mut branch = Inst::new(Opcode::J);
        branch.imm = smallvec![ImmVal::OffsetToInstruction(InstId(1))];
        let nop = Inst::new(Opcode::Nop);
        let mut comment = Inst::new(Opcode::Comment);
        comment.text = Some("x".into());
        let real = Inst::new(Opcode::JPop);
        let mut p2 = module_with_insts(vec![branch, nop, comment, real]);
        let p1 = Module::new();
        resolve(&mut p2, &p1, 64);
        let root = p2.root();
        assert_eq!(
            p2.funcs[root].insts[0].imm[0],
            ImmVal::OffsetToInstruction(InstId(3))
        );
    }

    #[test]
    fn frame_sizes_collapse_to_literals() {
        let mut inst = Inst::new(Opcode::AddI);
        inst.imm = smallvec![
            ImmVal::Value(16),
            ImmVal::NegLocalVarsSize(FuncId(0)),
            ImmVal::NegStackframePtrCacheSize(FuncId(0)),
        ];
        let mut p2 = module_with_insts(vec![inst]);
        let root = p2.root();
        p2.funcs[root].local_vars_max_size = 64;
        p2.funcs[root].stackframe_ptr_cache_size = 24;
        let p1 = Module::new();
        resolve(&mut p2, &p1, 64);
        let inst = &p2.funcs[root].insts[0];
        assert!(inst.imm.iter().all(|t| t.is_value()));
        assert_eq!(inst.resolved_imm(), Some(16 - 64 - 24));
    }

    #[test]
    fn resolving_twice_is_a_noop() {
        let mut inst = Inst::new(Opcode::Li);
        inst.imm = smallvec![ImmVal::Value(-129), ImmVal::LocalVarsSize(FuncId(0))];
        let mut p2 = module_with_insts(vec![inst]);
        let root = p2.root();
        p2.funcs[root].local_vars_max_size = 8;
        let p1 = Module::new();
        resolve(&mut p2, &p1, 64);
        let first: Vec<_> = p2.funcs[root].insts[0].imm.to_vec();
        resolve(&mut p2, &p1, 64);
        let second: Vec<_> = p2.funcs[root].insts[0].imm.to_vec();
        assert_eq!(first, second);
        assert!(second.iter().all(|t| t.is_value()));
    }
}
