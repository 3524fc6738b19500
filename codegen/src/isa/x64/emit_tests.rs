//! Golden encodings for the x86-64 lowering.
//!
//! Each case lowers a single LIR instruction at a fixed width and
//! checks the produced bytes (and fixup placement where it matters).

use super::emit::{initial_widths, lower_inst, EmitInfo, ImmWidth};
use crate::lir::{ImmVal, Inst, InstId, Opcode};
use smallvec::{smallvec, SmallVec};

fn info() -> EmitInfo {
    EmitInfo { linux: true }
}

fn inst(op: Opcode, r1: u8, r2: u8, r3: u8) -> Inst {
    let mut i = Inst::new(op);
    i.r1 = r1;
    i.r2 = r2;
    i.r3 = r3;
    i
}

fn inst_imm(op: Opcode, r1: u8, r2: u8, imm: i64) -> Inst {
    let mut i = inst(op, r1, r2, 0);
    i.imm = smallvec![ImmVal::Value(imm)];
    i
}

fn with_unused(mut i: Inst, unused: &[u8]) -> Inst {
    i.unused_regs = Some(SmallVec::from_slice(unused));
    i
}

fn lower(i: &Inst, w: ImmWidth) -> Vec<u8> {
    lower_inst(i, [w, ImmWidth::W32], &info())
        .expect("lowering failed")
        .asm
        .bytes
        .to_vec()
}

fn lower_default(i: &Inst) -> Vec<u8> {
    lower_inst(i, initial_widths(i.op), &info())
        .expect("lowering failed")
        .asm
        .bytes
        .to_vec()
}

#[test]
fn add_rr_forms() {
    // add rax, rbx (dst == a)
    assert_eq!(lower_default(&inst(Opcode::Add, 1, 1, 2)), vec![0x48, 0x01, 0xD8]);
    // dst == b, commutative: add rbx, rax
    assert_eq!(lower_default(&inst(Opcode::Add, 2, 1, 2)), vec![0x48, 0x01, 0xC3]);
    // three distinct: mov rcx, rax; add rcx, rbx
    assert_eq!(
        lower_default(&inst(Opcode::Add, 3, 1, 2)),
        vec![0x48, 0x89, 0xC1, 0x48, 0x01, 0xD9]
    );
}

#[test]
fn sub_aliasing_dst_is_subtrahend() {
    // r1 = r2 - r1 with r1=rbx, r2=rax: neg rbx; add rbx, rax
    assert_eq!(
        lower_default(&inst(Opcode::Sub, 2, 1, 2)),
        vec![0x48, 0xF7, 0xDB, 0x48, 0x01, 0xC3]
    );
}

#[test]
fn cpy_is_mov_and_elides_self() {
    assert_eq!(lower_default(&inst(Opcode::Cpy, 2, 1, 0)), vec![0x48, 0x89, 0xC3]);
    assert!(lower_default(&inst(Opcode::Cpy, 5, 5, 0)).is_empty());
}

#[test]
fn cpy_into_stack_pointer() {
    // The call sequences move the stack pointer: mov rsp, rbx.
    assert_eq!(lower_default(&inst(Opcode::Cpy, 0, 2, 0)), vec![0x48, 0x89, 0xDC]);
}

#[test]
fn li_widths() {
    // mov rax, imm32
    let bytes = lower(&inst_imm(Opcode::Li, 1, 0, 0x42), ImmWidth::W32);
    assert_eq!(bytes, vec![0x48, 0xC7, 0xC0, 0, 0, 0, 0]);
    // movabs rax, imm64
    let bytes = lower(&inst_imm(Opcode::Li, 1, 0, 0), ImmWidth::W64);
    assert_eq!(bytes[..2], [0x48, 0xB8]);
    assert_eq!(bytes.len(), 10);
}

#[test]
fn addi_widths_and_fixup_positions() {
    let i = inst_imm(Opcode::AddI, 1, 1, 8);
    let lowered = lower_inst(&i, [ImmWidth::W8, ImmWidth::W32], &info()).unwrap();
    assert_eq!(lowered.asm.bytes.to_vec(), vec![0x48, 0x83, 0xC0, 0x00]);
    let fx = &lowered.fixups[0];
    assert_eq!(fx.at, 3);
    assert_eq!(fx.width, ImmWidth::W8);

    let lowered = lower_inst(&i, [ImmWidth::W32, ImmWidth::W32], &info()).unwrap();
    assert_eq!(lowered.asm.bytes.to_vec(), vec![0x48, 0x81, 0xC0, 0, 0, 0, 0]);

    // 64-bit: movabs scratch; mov dst, src; add dst, scratch.
    let wide = with_unused(inst_imm(Opcode::AddI, 1, 2, 0), &[5]);
    let lowered = lower_inst(&wide, [ImmWidth::W64, ImmWidth::W32], &info()).unwrap();
    assert_eq!(lowered.asm.bytes[..2], [0x48, 0xBD]); // movabs rbp, ...
    assert_eq!(lowered.fixups[0].width, ImmWidth::W64);
}

#[test]
fn branch_short_and_widened() {
    let mut j = inst(Opcode::J, 0, 0, 0);
    j.imm = smallvec![ImmVal::OffsetToInstruction(InstId(0))];
    // Short: jmp rel8.
    assert_eq!(lower(&j, ImmWidth::W8), vec![0xEB, 0x00]);
    // Widened: jmp rel32.
    assert_eq!(lower(&j, ImmWidth::W32), vec![0xE9, 0, 0, 0, 0]);

    let mut jeq = inst(Opcode::Jeq, 1, 2, 0);
    jeq.imm = smallvec![ImmVal::OffsetToInstruction(InstId(0))];
    // cmp rax, rbx; je rel8
    assert_eq!(lower(&jeq, ImmWidth::W8), vec![0x48, 0x39, 0xD8, 0x74, 0x00]);
    // cmp; jne +5; jmp rel32 — the inverse short branch hops the wide
    // one so late widening never reshuffles the compare.
    assert_eq!(
        lower(&jeq, ImmWidth::W32),
        vec![0x48, 0x39, 0xD8, 0x75, 0x05, 0xE9, 0, 0, 0, 0]
    );
}

#[test]
fn far_branch_uses_call_ret_pattern() {
    let mut j = with_unused(inst(Opcode::J, 0, 0, 0), &[5]);
    j.imm = smallvec![ImmVal::OffsetToInstruction(InstId(0))];
    let bytes = lower(&j, ImmWidth::W64);
    // call +0; movabs rbp, …; add [rsp], rbp; ret
    assert_eq!(bytes[0], 0xE8);
    assert_eq!(bytes[5..7], [0x48, 0xBD]);
    assert_eq!(*bytes.last().unwrap(), 0xC3);
}

#[test]
fn jpush_is_call_rel32() {
    let mut j = inst(Opcode::JPush, 0, 0, 0);
    j.imm = smallvec![ImmVal::OffsetToFunction(crate::lir::FuncId(1))];
    let lowered = lower_inst(&j, initial_widths(Opcode::JPush), &info()).unwrap();
    assert_eq!(lowered.asm.bytes.to_vec(), vec![0xE8, 0, 0, 0, 0]);
    assert!(lowered.fixups[0].pc_rel);
    assert_eq!(lowered.fixups[0].at, 1);
}

#[test]
fn jpop_is_ret() {
    assert_eq!(lower_default(&inst(Opcode::JPop, 0, 0, 0)), vec![0xC3]);
}

#[test]
fn afip_call_pop_add() {
    let i = inst_imm(Opcode::Afip, 2, 0, 0);
    let bytes = lower(&i, ImmWidth::W8);
    // call +0; pop rbx; add rbx, imm8
    assert_eq!(bytes[0], 0xE8);
    assert_eq!(bytes[5], 0x5B);
    assert_eq!(bytes[6..9], [0x48, 0x83, 0xC3]);
    // The popped address sits 5 bytes in; the fixup accounts for the
    // distance from there to the field end.
    let lowered = lower_inst(&i, [ImmWidth::W8, ImmWidth::W32], &info()).unwrap();
    let fx = &lowered.fixups[0];
    assert_eq!(fx.addend, (fx.at + 1) as i64 - 5);
}

#[test]
fn load_store_forms() {
    // ld64 rax, [rbx + 16]
    assert_eq!(
        lower(&inst_imm(Opcode::Ld64, 1, 2, 16), ImmWidth::W8),
        vec![0x48, 0x8B, 0x43, 0x00]
    );
    // ld8 zero-extends: movzx rax, byte [rbx + d8]
    assert_eq!(
        lower(&inst_imm(Opcode::Ld8, 1, 2, 1), ImmWidth::W8),
        vec![0x48, 0x0F, 0xB6, 0x43, 0x00]
    );
    // st32 [rbx + d32], eax
    assert_eq!(
        lower(&inst_imm(Opcode::St32, 1, 2, 0), ImmWidth::W32),
        vec![0x89, 0x83, 0, 0, 0, 0]
    );
    // st64 through rsp needs a SIB byte.
    assert_eq!(
        lower(&inst_imm(Opcode::St64, 1, 0, 8), ImmWidth::W8),
        vec![0x48, 0x89, 0x44, 0x24, 0x00]
    );
    // register-indirect store: st8r [rbx], al
    assert_eq!(
        lower_default(&inst(Opcode::St8R, 1, 2, 0)),
        vec![0x88, 0x43, 0x00]
    );
}

#[test]
fn atomic_swap_is_xchg() {
    // ldst64 rax, [rbx + 0]
    assert_eq!(
        lower(&inst_imm(Opcode::LdSt64, 1, 2, 0), ImmWidth::W8),
        vec![0x48, 0x87, 0x43, 0x00]
    );
}

#[test]
fn setcc_uses_abcd_destination_directly() {
    // seq rax, rbx, rcx: xor eax, eax; cmp rbx, rcx; sete al
    assert_eq!(
        lower_default(&inst(Opcode::Seq, 1, 2, 3)),
        vec![0x31, 0xC0, 0x48, 0x39, 0xCB, 0x0F, 0x94, 0xC0]
    );
}

#[test]
fn setcc_copies_through_scratch_for_non_abcd() {
    // slt rsi, rbx, rcx with rax free: xor eax, eax; cmp; setl al;
    // mov rsi, rax
    let i = with_unused(inst(Opcode::Slt, 7, 2, 3), &[1]);
    let bytes = lower_default(&i);
    assert_eq!(
        bytes,
        vec![0x31, 0xC0, 0x48, 0x39, 0xCB, 0x0F, 0x9C, 0xC0, 0x48, 0x89, 0xC6]
    );
}

#[test]
fn setcc_saves_an_abcd_register_when_none_free() {
    // No unused registers at all: push/zero/setcc/mov/pop.
    let bytes = lower_default(&inst(Opcode::Slt, 7, 2, 3));
    // push rax … pop rax
    assert_eq!(bytes[0], 0x50);
    assert_eq!(*bytes.last().unwrap(), 0x58);
}

#[test]
fn shifts_by_register_go_through_cl() {
    // sll rax, rbx, rdx with rbp free:
    // mov rbp, rbx; push rcx; mov rcx, rdx; shl rbp, cl; pop rcx;
    // mov rax, rbp
    let i = with_unused(inst(Opcode::Sll, 1, 2, 4), &[5]);
    let bytes = lower_default(&i);
    assert_eq!(
        bytes,
        vec![
            0x48, 0x89, 0xDD, // mov rbp, rbx
            0x51, // push rcx
            0x48, 0x89, 0xD1, // mov rcx, rdx
            0x48, 0xD3, 0xE5, // shl rbp, cl
            0x59, // pop rcx
            0x48, 0x89, 0xE8, // mov rax, rbp
        ]
    );
}

#[test]
fn shift_immediate_count() {
    // slli rax, rax, imm
    let bytes = lower(&inst_imm(Opcode::SllI, 1, 1, 3), ImmWidth::W8);
    assert_eq!(bytes, vec![0x48, 0xC1, 0xE0, 0x00]);
}

#[test]
fn extend_ops_use_shift_pairs() {
    // zxt rax, rbx over 8 bits: mov; shl 56; shr 56
    let i = inst_imm(Opcode::Zxt, 1, 2, 8);
    assert_eq!(
        lower_default(&i),
        vec![0x48, 0x89, 0xD8, 0x48, 0xC1, 0xE0, 0x38, 0x48, 0xC1, 0xE8, 0x38]
    );
    // sxt uses sar for the way back.
    let i = inst_imm(Opcode::Sxt, 1, 2, 8);
    let bytes = lower_default(&i);
    assert_eq!(bytes[8], 0xC1);
    assert_eq!(bytes[9] & 0xF8, 0xF8); // sar rax
}

#[test]
fn mulh_saves_rax_rdx() {
    let bytes = lower_default(&inst(Opcode::MulH, 2, 5, 6));
    // push rax; push rdx; mov rax, rbp; imul rdi; mov rbx, rdx;
    // pop rdx; pop rax
    assert_eq!(
        bytes,
        vec![
            0x50, 0x52, 0x48, 0x89, 0xE8, 0x48, 0xF7, 0xEF, 0x48, 0x89, 0xD3, 0x5A, 0x58
        ]
    );
}

#[test]
fn div_zeroes_or_extends_rdx() {
    // divu: xor edx, edx path
    let bytes = lower_default(&inst(Opcode::DivU, 2, 5, 6));
    assert!(bytes.windows(2).any(|w| w == [0x31, 0xD2]));
    // signed div: cqo
    let bytes = lower_default(&inst(Opcode::Div, 2, 5, 6));
    assert!(bytes.windows(2).any(|w| w == [0x48, 0x99]));
}

#[test]
fn div_with_rax_operand_reads_its_save_slot() {
    // div rbx, rax, rbp: the dividend is in the saved rax slot.
    let bytes = lower_default(&inst(Opcode::Div, 2, 1, 5));
    // mov rax, [rsp+8]
    assert!(bytes.windows(5).any(|w| w == [0x48, 0x8B, 0x44, 0x24, 0x08]));
}

#[test]
fn memcpy_shape() {
    let bytes = lower_default(&inst(Opcode::Mem8Cpy, 1, 2, 5));
    // Leads with the three saves, contains rep movsb, ends restoring.
    assert_eq!(bytes[..3], [0x57, 0x56, 0x51]); // push rdi; push rsi; push rcx
    assert!(bytes.windows(2).any(|w| w == [0xF3, 0xA4]));
    assert_eq!(bytes[bytes.len() - 3..], [0x59, 0x5E, 0x5F]);
    // cld before the copy.
    assert!(bytes.contains(&0xFC));
}

#[test]
fn memcpy_descending_sets_and_clears_direction() {
    let bytes = lower_default(&inst(Opcode::Mem8Cpy2, 1, 2, 5));
    let std_pos = bytes.iter().position(|&b| b == 0xFD).expect("std");
    let cld_pos = bytes.iter().rposition(|&b| b == 0xFC).expect("cld");
    assert!(std_pos < cld_pos);
}

#[test]
fn memcpy_imm_count_has_fixup() {
    let i = inst_imm(Opcode::Mem8CpyI, 1, 2, 64);
    let lowered = lower_inst(&i, initial_widths(Opcode::Mem8CpyI), &info()).unwrap();
    assert_eq!(lowered.fixups.len(), 1);
    assert_eq!(lowered.fixups[0].width, ImmWidth::W32);
}

#[test]
fn pagealloc_is_a_syscall_on_linux() {
    let bytes = lower_default(&inst(Opcode::StackPageAlloc, 2, 0, 0));
    assert!(bytes.windows(2).any(|w| w == [0x0F, 0x05]), "syscall missing");
    // Failure normalization: cmp rax, -4096 present.
    assert!(bytes.windows(3).any(|w| w == [0x48, 0x81, 0xF8]));
}

#[test]
fn hosted_page_ops_call_the_shim() {
    let hosted = EmitInfo { linux: false };
    let i = inst(Opcode::StackPageAlloc, 2, 0, 0);
    let lowered = lower_inst(&i, initial_widths(Opcode::StackPageAlloc), &hosted).unwrap();
    let bytes = lowered.asm.bytes.to_vec();
    assert!(!bytes.windows(2).any(|w| w == [0x0F, 0x05]), "no raw syscalls");
    // The shim address fixup points at the global region.
    assert!(lowered
        .fixups
        .iter()
        .any(|f| f.source == super::emit::FixupSource::GlobalRegion));
}

#[test]
fn machine_code_is_verbatim() {
    let mut i = Inst::new(Opcode::MachineCode);
    i.bytes = Some(vec![0x90, 0xCC, 0x90].into_boxed_slice());
    assert_eq!(lower_default(&i), vec![0x90, 0xCC, 0x90]);
}

#[test]
fn nop_and_comment() {
    assert_eq!(lower_default(&Inst::new(Opcode::Nop)), vec![0x90]);
    assert!(lower_default(&Inst::new(Opcode::Comment)).is_empty());
}

#[test]
fn binsz_pads_with_nops() {
    let mut i = Inst::new(Opcode::Nop);
    i.binsz = 4;
    assert_eq!(lower_default(&i), vec![0x90, 0x90, 0x90, 0x90]);
}

#[test]
fn binsz_shrinking_is_an_error() {
    let mut i = Inst::new(Opcode::MachineCode);
    i.bytes = Some(vec![0x90; 8].into_boxed_slice());
    i.binsz = 4;
    assert!(lower_inst(&i, initial_widths(Opcode::MachineCode), &info()).is_err());
}

#[test]
fn scratch_exhaustion_is_reported() {
    // A 64-bit AddI with no unused registers cannot materialize its
    // immediate.
    let i = inst_imm(Opcode::AddI, 1, 2, 0);
    let err = lower_inst(&i, [ImmWidth::W64, ImmWidth::W32], &info());
    assert!(matches!(
        err,
        Err(crate::error::CodegenError::ScratchUnavailable(_))
    ));
}
