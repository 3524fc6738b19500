//! x86-64 byte-level encoding helpers.
//!
//! One `Asm` accumulates the encoding of a single LIR instruction. The
//! helpers here take LIR register ids and translate to hardware
//! encodings internally; everything register-register operates at the
//! full 64-bit width, since the analyzer keeps values GPR-wide.

use super::regs::enc;
use smallvec::SmallVec;

/// Displacement width for a memory operand.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DispWidth {
    /// 8-bit signed displacement.
    D8,
    /// 32-bit signed displacement.
    D32,
}

/// An in-progress encoding for one LIR instruction.
#[derive(Default, Clone, Debug)]
pub struct Asm {
    /// Encoded bytes.
    pub bytes: SmallVec<[u8; 32]>,
}

impl Asm {
    /// A fresh buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current length in bytes.
    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    /// Append one byte.
    pub fn put1(&mut self, b: u8) {
        self.bytes.push(b);
    }

    /// Append a 32-bit little-endian value.
    pub fn put4(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a 64-bit little-endian value.
    pub fn put8(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    /// REX prefix for a 64-bit operation with `reg` and `rm` fields.
    fn rex_w(&mut self, reg_enc: u8, rm_enc: u8) {
        self.put1(0x48 | ((reg_enc >> 3) << 2) | (rm_enc >> 3));
    }

    /// REX prefix for a 32-bit (or smaller) operation; emitted only when
    /// an extended register or a byte operation demands it.
    fn rex_opt(&mut self, reg_enc: u8, rm_enc: u8, byte_op: bool) {
        let mut rex = 0x40u8 | ((reg_enc >> 3) << 2) | (rm_enc >> 3);
        // With a byte operation, SPL/BPL/SIL/DIL need a REX prefix to be
        // addressable at all.
        if byte_op && (reg_enc & 0x7 >= 4 || rm_enc & 0x7 >= 4) {
            rex |= 0x40;
        }
        if rex != 0x40 || (byte_op && (reg_enc >= 4 || rm_enc >= 4)) {
            self.put1(rex);
        }
    }

    fn modrm(&mut self, mode: u8, reg_enc: u8, rm_enc: u8) {
        self.put1((mode << 6) | ((reg_enc & 7) << 3) | (rm_enc & 7));
    }

    /// ModRM (+ SIB when the base demands one) for `[base + disp]`.
    fn mem(&mut self, reg_enc: u8, base_enc: u8, disp: i32, width: DispWidth) {
        let mode = match width {
            DispWidth::D8 => 1,
            DispWidth::D32 => 2,
        };
        if base_enc & 7 == 4 {
            // RSP/R12 bases go through a SIB byte with no index.
            self.modrm(mode, reg_enc, 4);
            self.put1(0x24);
        } else {
            self.modrm(mode, reg_enc, base_enc);
        }
        match width {
            DispWidth::D8 => self.put1(disp as i8 as u8),
            DispWidth::D32 => self.put4(disp as u32),
        }
    }

    // ---- register-register forms ---------------------------------------

    /// `op r/m64, r64` — the 0x01-style ALU forms: 0x01 add, 0x09 or,
    /// 0x21 and, 0x29 sub, 0x31 xor, 0x39 cmp, 0x85 test, 0x89 mov.
    pub fn alu_rr(&mut self, opcode: u8, src: u8, dst: u8) {
        let (r, m) = (enc(src), enc(dst));
        self.rex_w(r, m);
        self.put1(opcode);
        self.modrm(3, r, m);
    }

    /// `mov dst, src` when they differ.
    pub fn mov_rr(&mut self, dst: u8, src: u8) {
        if dst != src {
            self.alu_rr(0x89, src, dst);
        }
    }

    /// `op r/m64` unary group 0xF7: /2 not, /3 neg, /4 mul, /5 imul,
    /// /6 div, /7 idiv.
    pub fn unary_rm(&mut self, ext: u8, rm: u8) {
        let m = enc(rm);
        self.rex_w(0, m);
        self.put1(0xF7);
        self.modrm(3, ext, m);
    }

    /// `imul dst, src` (two-operand form).
    pub fn imul_rr(&mut self, dst: u8, src: u8) {
        let (r, m) = (enc(dst), enc(src));
        self.rex_w(r, m);
        self.put1(0x0F);
        self.put1(0xAF);
        self.modrm(3, r, m);
    }

    /// `shl/shr/sar r/m64, cl` — /4 shl, /5 shr, /7 sar.
    pub fn shift_cl(&mut self, ext: u8, rm: u8) {
        let m = enc(rm);
        self.rex_w(0, m);
        self.put1(0xD3);
        self.modrm(3, ext, m);
    }

    /// `shl/shr/sar qword [rsp], cl`.
    pub fn shift_cl_rsp_slot(&mut self, ext: u8) {
        self.rex_w(0, 4);
        self.put1(0xD3);
        self.modrm(0, ext, 4);
        self.put1(0x24);
    }

    /// `shl/shr/sar r/m64, imm8`.
    pub fn shift_imm(&mut self, ext: u8, rm: u8, count: u8) {
        let m = enc(rm);
        self.rex_w(0, m);
        self.put1(0xC1);
        self.modrm(3, ext, m);
        self.put1(count);
    }

    /// Group-1 ALU with an 8-bit immediate: `op r/m64, imm8` —
    /// /0 add, /1 or, /4 and, /5 sub, /6 xor, /7 cmp.
    pub fn alu_ri8(&mut self, ext: u8, rm: u8, imm: i8) {
        let m = enc(rm);
        self.rex_w(0, m);
        self.put1(0x83);
        self.modrm(3, ext, m);
        self.put1(imm as u8);
    }

    /// Group-1 ALU with a 32-bit immediate.
    pub fn alu_ri32(&mut self, ext: u8, rm: u8, imm: i32) {
        let m = enc(rm);
        self.rex_w(0, m);
        self.put1(0x81);
        self.modrm(3, ext, m);
        self.put4(imm as u32);
    }

    /// `mov r64, imm64`.
    pub fn movabs(&mut self, dst: u8, imm: u64) {
        let m = enc(dst);
        self.rex_w(0, m);
        self.put1(0xB8 | (m & 7));
        self.put8(imm);
    }

    /// `mov r/m64, imm32` (sign extended).
    pub fn mov_ri32(&mut self, dst: u8, imm: i32) {
        let m = enc(dst);
        self.rex_w(0, m);
        self.put1(0xC7);
        self.modrm(3, 0, m);
        self.put4(imm as u32);
    }

    /// `imul dst, src, imm8` / `imm32`.
    pub fn imul_ri(&mut self, dst: u8, src: u8, imm: i32, wide: bool) {
        let (r, m) = (enc(dst), enc(src));
        self.rex_w(r, m);
        if wide {
            self.put1(0x69);
            self.modrm(3, r, m);
            self.put4(imm as u32);
        } else {
            self.put1(0x6B);
            self.modrm(3, r, m);
            self.put1(imm as u8);
        }
    }

    // ---- loads and stores ----------------------------------------------

    /// Load `size` bytes from `[base + disp]` into `dst`, zero
    /// extending sub-64-bit widths.
    pub fn load(&mut self, size: u32, dst: u8, base: u8, disp: i32, width: DispWidth) {
        let (r, m) = (enc(dst), enc(base));
        match size {
            1 => {
                self.rex_w(r, m);
                self.put1(0x0F);
                self.put1(0xB6);
            }
            2 => {
                self.rex_w(r, m);
                self.put1(0x0F);
                self.put1(0xB7);
            }
            4 => {
                // 32-bit mov clears the upper half.
                self.rex_opt(r, m, false);
                self.put1(0x8B);
            }
            _ => {
                self.rex_w(r, m);
                self.put1(0x8B);
            }
        }
        self.mem(r, m, disp, width);
    }

    /// Store the low `size` bytes of `src` at `[base + disp]`.
    pub fn store(&mut self, size: u32, src: u8, base: u8, disp: i32, width: DispWidth) {
        let (r, m) = (enc(src), enc(base));
        match size {
            1 => {
                self.rex_opt(r, m, true);
                self.put1(0x88);
            }
            2 => {
                self.put1(0x66);
                self.rex_opt(r, m, false);
                self.put1(0x89);
            }
            4 => {
                self.rex_opt(r, m, false);
                self.put1(0x89);
            }
            _ => {
                self.rex_w(r, m);
                self.put1(0x89);
            }
        }
        self.mem(r, m, disp, width);
    }

    /// Atomically exchange the low `size` bytes of `reg` with
    /// `[base + disp]`. XCHG with a memory operand locks implicitly.
    pub fn xchg(&mut self, size: u32, reg: u8, base: u8, disp: i32, width: DispWidth) {
        let (r, m) = (enc(reg), enc(base));
        match size {
            1 => {
                self.rex_opt(r, m, true);
                self.put1(0x86);
            }
            2 => {
                self.put1(0x66);
                self.rex_opt(r, m, false);
                self.put1(0x87);
            }
            4 => {
                self.rex_opt(r, m, false);
                self.put1(0x87);
            }
            _ => {
                self.rex_w(r, m);
                self.put1(0x87);
            }
        }
        self.mem(r, m, disp, width);
    }

    /// Load from `[rm]` with no displacement.
    pub fn load_ind(&mut self, size: u32, dst: u8, base: u8) {
        self.load(size, dst, base, 0, DispWidth::D8);
    }

    /// Store to `[rm]` with no displacement.
    pub fn store_ind(&mut self, size: u32, src: u8, base: u8) {
        self.store(size, src, base, 0, DispWidth::D8);
    }

    // ---- stack, flow, misc ---------------------------------------------

    /// `push r64`.
    pub fn push(&mut self, r: u8) {
        let m = enc(r);
        if m >= 8 {
            self.put1(0x41);
        }
        self.put1(0x50 | (m & 7));
    }

    /// `pop r64`.
    pub fn pop(&mut self, r: u8) {
        let m = enc(r);
        if m >= 8 {
            self.put1(0x41);
        }
        self.put1(0x58 | (m & 7));
    }

    /// `call rel32`; the displacement is patched by the caller.
    pub fn call_rel32(&mut self, rel: i32) {
        self.put1(0xE8);
        self.put4(rel as u32);
    }

    /// `jmp rel8`.
    pub fn jmp_rel8(&mut self, rel: i8) {
        self.put1(0xEB);
        self.put1(rel as u8);
    }

    /// `jmp rel32`.
    pub fn jmp_rel32(&mut self, rel: i32) {
        self.put1(0xE9);
        self.put4(rel as u32);
    }

    /// `jcc rel8` — `cc` is the low nibble of the 0x7x opcode.
    pub fn jcc_rel8(&mut self, cc: u8, rel: i8) {
        self.put1(0x70 | cc);
        self.put1(rel as u8);
    }

    /// `jmp r/m64`.
    pub fn jmp_reg(&mut self, r: u8) {
        let m = enc(r);
        if m >= 8 {
            self.put1(0x41);
        }
        self.put1(0xFF);
        self.modrm(3, 4, m);
    }

    /// `call r/m64`.
    pub fn call_reg(&mut self, r: u8) {
        let m = enc(r);
        if m >= 8 {
            self.put1(0x41);
        }
        self.put1(0xFF);
        self.modrm(3, 2, m);
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.put1(0xC3);
    }

    /// `setcc r/m8` — `cc` is the low nibble of the 0x9x second opcode
    /// byte. The target must be an ABCD-class register; the lowerer
    /// enforces that before calling.
    pub fn setcc(&mut self, cc: u8, rm: u8) {
        let m = enc(rm);
        debug_assert!(m < 4, "setcc target must be ABCD-class");
        self.put1(0x0F);
        self.put1(0x90 | cc);
        self.modrm(3, 0, m);
    }

    /// `xor r32, r32` — zeroes the full register.
    pub fn zero(&mut self, r: u8) {
        let m = enc(r);
        self.rex_opt(m, m, false);
        self.put1(0x31);
        self.modrm(3, m, m);
    }

    /// `cqo` — sign extend RAX into RDX:RAX.
    pub fn cqo(&mut self) {
        self.put1(0x48);
        self.put1(0x99);
    }

    /// `syscall`.
    pub fn syscall(&mut self) {
        self.put1(0x0F);
        self.put1(0x05);
    }

    /// `cld` / `std`.
    pub fn cld(&mut self) {
        self.put1(0xFC);
    }

    /// Set the direction flag (string ops go downward).
    pub fn std_(&mut self) {
        self.put1(0xFD);
    }

    /// `rep movsb/w/d/q` for an element width in bytes.
    pub fn rep_movs(&mut self, elem: u32) {
        match elem {
            1 => {
                self.put1(0xF3);
                self.put1(0xA4);
            }
            2 => {
                self.put1(0x66);
                self.put1(0xF3);
                self.put1(0xA5);
            }
            4 => {
                self.put1(0xF3);
                self.put1(0xA5);
            }
            _ => {
                self.put1(0xF3);
                self.put1(0x48);
                self.put1(0xA5);
            }
        }
    }

    /// `nop`.
    pub fn nop(&mut self) {
        self.put1(0x90);
    }

    /// Load from a stack slot: `mov dst, [rsp + disp8]`.
    pub fn load_rsp(&mut self, dst: u8, disp: i8) {
        let r = enc(dst);
        self.rex_w(r, 4);
        self.put1(0x8B);
        self.modrm(1, r, 4);
        self.put1(0x24);
        self.put1(disp as u8);
    }

    /// Store to a stack slot: `mov [rsp + disp8], src`.
    pub fn store_rsp(&mut self, src: u8, disp: i8) {
        let r = enc(src);
        self.rex_w(r, 4);
        self.put1(0x89);
        self.modrm(1, r, 4);
        self.put1(0x24);
        self.put1(disp as u8);
    }

    /// `add [rsp], r64` — used by the far-branch pattern to bias a
    /// pushed return address before `ret` dispatches through it.
    pub fn add_to_rsp_slot(&mut self, src: u8) {
        let r = enc(src);
        self.rex_w(r, 4);
        self.put1(0x01);
        self.modrm(0, r, 4);
        self.put1(0x24);
    }

    /// One-operand group F7 on a stack slot: `imul/mul/idiv/div qword
    /// [rsp + disp8]`.
    pub fn unary_rsp(&mut self, ext: u8, disp: i8) {
        self.rex_w(0, 4);
        self.put1(0xF7);
        self.modrm(1, ext, 4);
        self.put1(0x24);
        self.put1(disp as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(f: impl FnOnce(&mut Asm)) -> Vec<u8> {
        let mut a = Asm::new();
        f(&mut a);
        a.bytes.to_vec()
    }

    #[test]
    fn mov_rr_encodings() {
        // mov rbx, rax → 48 89 C3
        assert_eq!(bytes(|a| a.mov_rr(2, 1)), vec![0x48, 0x89, 0xC3]);
        // mov r8, rsi → 49 89 F0
        assert_eq!(bytes(|a| a.mov_rr(8, 7)), vec![0x49, 0x89, 0xF0]);
        // same register: nothing
        assert!(bytes(|a| a.mov_rr(5, 5)).is_empty());
    }

    #[test]
    fn alu_rr_encodings() {
        // add rax, rbx → 48 01 D8
        assert_eq!(bytes(|a| a.alu_rr(0x01, 2, 1)), vec![0x48, 0x01, 0xD8]);
        // cmp rcx, r9 → 4C 39 C9
        assert_eq!(bytes(|a| a.alu_rr(0x39, 9, 3)), vec![0x4C, 0x39, 0xC9]);
    }

    #[test]
    fn imm_encodings() {
        // add rax, 8 → 48 83 C0 08
        assert_eq!(bytes(|a| a.alu_ri8(0, 1, 8)), vec![0x48, 0x83, 0xC0, 0x08]);
        // mov rax, 0x1122334455667788
        assert_eq!(
            bytes(|a| a.movabs(1, 0x1122334455667788)),
            vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn rsp_base_uses_sib() {
        // mov rax, [rsp + 8] → 48 8B 44 24 08
        assert_eq!(
            bytes(|a| a.load(8, 1, 0, 8, DispWidth::D8)),
            vec![0x48, 0x8B, 0x44, 0x24, 0x08]
        );
    }

    #[test]
    fn push_pop() {
        assert_eq!(bytes(|a| a.push(1)), vec![0x50]);
        assert_eq!(bytes(|a| a.push(8)), vec![0x41, 0x50]);
        assert_eq!(bytes(|a| a.pop(4)), vec![0x5A]);
    }

    #[test]
    fn byte_store_of_high_encoding_reg() {
        // mov [rbx], sil needs a REX: 40 88 33
        assert_eq!(
            bytes(|a| a.store(1, 7, 2, 0, DispWidth::D8)),
            vec![0x40, 0x88, 0x73, 0x00]
        );
    }
}
