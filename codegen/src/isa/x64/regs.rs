//! x86-64 register mapping.
//!
//! LIR register ids map onto hardware as: 0→RSP (the stack pointer
//! alias, never allocated), 1→RAX, 2→RBX, 3→RCX, 4→RDX, 5→RBP, 6→RDI,
//! 7→RSI, 8..15→R8..R15. The hardware *encoding* differs from the id;
//! `enc` translates.

/// Hardware encoding (0..15, REX extension included in bit 3) of an LIR
/// register id.
pub fn enc(id: u8) -> u8 {
    const MAP: [u8; 16] = [
        4,  // 0 → RSP
        0,  // 1 → RAX
        3,  // 2 → RBX
        1,  // 3 → RCX
        2,  // 4 → RDX
        5,  // 5 → RBP
        7,  // 6 → RDI
        6,  // 7 → RSI
        8, 9, 10, 11, 12, 13, 14, 15,
    ];
    MAP[id as usize]
}

/// Hardware name, for disassembly-style debug output.
pub fn name(id: u8) -> &'static str {
    const NAMES: [&str; 16] = [
        "rsp", "rax", "rbx", "rcx", "rdx", "rbp", "rdi", "rsi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];
    NAMES[id as usize]
}

/// LIR id of RAX.
pub const RAX: u8 = 1;
/// LIR id of RBX.
pub const RBX: u8 = 2;
/// LIR id of RCX.
pub const RCX: u8 = 3;
/// LIR id of RDX.
pub const RDX: u8 = 4;
/// LIR id of RDI.
pub const RDI: u8 = 6;
/// LIR id of RSI.
pub const RSI: u8 = 7;

/// The ids whose low byte is addressable without REX; legacy 8-bit
/// forms (SETcc and friends) are restricted to these.
pub const ABCD: [u8; 4] = [RAX, RBX, RCX, RDX];

/// Is `id` one of the ABCD-class registers?
pub fn is_abcd(id: u8) -> bool {
    ABCD.contains(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_pointer_is_rsp() {
        assert_eq!(enc(0), 4);
        assert_eq!(name(0), "rsp");
    }

    #[test]
    fn encodings_are_a_permutation() {
        let mut seen = [false; 16];
        for id in 0..16u8 {
            let e = enc(id);
            assert!(!seen[e as usize]);
            seen[e as usize] = true;
        }
    }
}
