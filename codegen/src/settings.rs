//! Compile options and flags.
//!
//! `CompileOptions` is the single struct-of-options handed to
//! [`Context::compile`](crate::context::Context::compile). It fixes the
//! abstract target (GPR size and count), the per-op scratch-register
//! promises the backend relies on, and the behavior toggles.

use crate::lir::Opcode;
use bitflags::bitflags;

/// Page size the generated code assumes for stack pages and the page
/// management ops. Changing it invalidates previously generated images.
pub const PAGE_SIZE: u32 = 4096;

/// Stackframe budget for a function whose address is taken. Indirect call
/// sites cannot see the callee's real frame size and reserve this much.
pub const MAX_STACK_USAGE: u32 = 1024;

/// Bytes reserved for the arguments of a variadic function.
pub const MAX_ARG_USAGE: u32 = 256;

/// Upper bound on the stackframe-pointer cache, which bounds how deeply
/// functions can usefully nest.
pub const MAX_STACKFRAME_PTR_CACHE_SIZE: u32 = 256;

bitflags! {
    /// Behavior toggles for a compile.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CompileFlags: u32 {
        /// Generate `Comment` instructions narrating frame layout
        /// decisions alongside the real instruction stream.
        const COMMENT = 1;
        /// Record file/line/line-offset debug triples on every
        /// instruction and emit the line-table sections in the image.
        const GENERATE_DEBUG_INFO = 1 << 1;
        /// Treat every variable as volatile: values are never cached in
        /// registers. Useful under a debugger.
        const ALL_VAR_VOLATILE = 1 << 2;
        /// Disable stackframe sharing; every function holds its own
        /// frame. Calls get slower, planning gets trivial.
        const NO_STACKFRAME_SHARING = 1 << 3;
        /// A declared-but-undefined non-nested function is an error
        /// instead of becoming an import.
        const NO_FUNCTION_IMPORT = 1 << 4;
        /// Using `export` on a non-nested function is an error,
        /// disabling runtime exporting.
        const NO_FUNCTION_EXPORT = 1 << 5;
    }
}

/// A variable predeclared by the host and visible at root scope.
///
/// The variable lives in host memory, not in the global region; `addr` is
/// its address in the host address space. When the generated code writes
/// the variable, `callback` (if any) is invoked by the host runtime; it
/// takes no arguments so no stack-layout convention has to be shared, and
/// how it observes the new value is the host's business.
#[derive(Clone)]
pub struct PredeclaredVar {
    /// Name usable from source code.
    pub name: String,
    /// Type specification string, e.g. `"uint"` or `"u8*"`.
    pub ty: String,
    /// The variable holds the address of another variable and is
    /// dereferenced wherever used.
    pub is_byref: bool,
    /// Host address of the storage.
    pub addr: u64,
    /// Invoked by the host when the value changes.
    pub callback: Option<fn()>,
}

/// A macro predeclared by the host, substituted textually during lexing.
#[derive(Clone)]
pub struct PredeclaredMacro {
    /// Name usable from source code. Uppercase by convention.
    pub name: String,
    /// Replacement text. Must not contain newlines, or line numbers in
    /// diagnostics drift.
    pub content: String,
}

/// Options controlling a compile. See the field docs; `validate` is
/// called by the context before anything else runs.
pub struct CompileOptions {
    /// Size in bytes of the target GPR. Must be a power of two, at most 8.
    pub sizeof_gpr: u32,
    /// Number of general purpose registers beside register 0 (the stack
    /// pointer). Must be at least 3.
    pub nbr_of_gpr: u32,
    /// Per-opcode minimum count of unused registers that must be free
    /// when the instruction is generated. The backend relies on these to
    /// find scratch registers without spilling.
    pub min_unused_reg_count_for_op: [u8; Opcode::COUNT],
    /// Extra stack bytes kept above the stack pointer when a new stack
    /// page is allocated, so the allocation path itself has room to push.
    pub stack_page_alloc_provision: u32,
    /// log2 of the byte size of one entry in a generated switch jump
    /// table.
    pub jump_case_clog2_sz: u32,
    /// Host-provided root-scope variables.
    pub predeclared_vars: Vec<PredeclaredVar>,
    /// Host-provided macros.
    pub predeclared_macros: Vec<PredeclaredMacro>,
    /// Diagnostic callback. Required; every compile error is routed
    /// through it with a rendered location before the error is returned.
    pub error: fn(&str),
    /// Behavior toggles.
    pub flags: CompileFlags,
}

fn report_to_stderr(msg: &str) {
    eprintln!("{msg}");
}

impl Default for CompileOptions {
    fn default() -> Self {
        let mut min_unused = [0u8; Opcode::COUNT];
        for op in Opcode::all() {
            min_unused[op as usize] = op.default_min_unused_regs();
        }
        Self {
            sizeof_gpr: 8,
            nbr_of_gpr: 15,
            min_unused_reg_count_for_op: min_unused,
            stack_page_alloc_provision: 64,
            jump_case_clog2_sz: 3,
            predeclared_vars: Vec::new(),
            predeclared_macros: Vec::new(),
            error: report_to_stderr,
            flags: CompileFlags::empty(),
        }
    }
}

impl CompileOptions {
    /// Check option consistency. Violations here are host bugs, not
    /// program errors, so they do not go through the diagnostic callback.
    pub fn validate(&self) -> Result<(), String> {
        if !self.sizeof_gpr.is_power_of_two() || self.sizeof_gpr > 8 {
            return Err(format!(
                "sizeof_gpr must be a power of two no larger than 8, got {}",
                self.sizeof_gpr
            ));
        }
        if self.nbr_of_gpr < 3 {
            return Err(format!("at least 3 gprs are required, got {}", self.nbr_of_gpr));
        }
        if self.nbr_of_gpr > 15 {
            return Err(format!(
                "register ids are limited to 15 beside the stack pointer, got {}",
                self.nbr_of_gpr
            ));
        }
        Ok(())
    }

    /// GPR width in bits.
    pub fn bitsizeof_gpr(&self) -> u32 {
        8 * self.sizeof_gpr
    }
}
