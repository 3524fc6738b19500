//! Image layout, immediate resolution, and relaxation.
//!
//! Every instruction is lowered into its own buffer first. The driver
//! then assigns offsets, computes each patchable field's value against
//! the tentative layout, and widens any field whose value does not fit,
//! re-lowering only the affected instructions. Widening moves code, so
//! the loop runs until a pass makes no changes; it terminates because
//! field widths only ever grow. The final pass patches the values in.
//!
//! Image layout:
//!
//! ```text
//! [ instructions | pad | strings | pad | (globals, load time only) ]
//! ```

use super::emit::{initial_widths, lower_inst, EmitInfo, FixupSource, ImmWidth, Lowered};
use crate::context::Compilation;
use crate::entity::EntityRef;
use crate::error::{CodegenError, CodegenResult};
use crate::lir::{FuncId, ImmVal};
use log::{debug, trace};
use target_lexicon::{OperatingSystem, Triple};

/// Gap policy between the image sections.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Alignment {
    /// Strings and globals both 4-byte aligned.
    Compact,
    /// Strings packed at 4 bytes, globals pushed to a page boundary.
    CompactPageAligned,
    /// Strings and globals both page aligned.
    PageAligned,
}

impl Alignment {
    fn string_align(self) -> u32 {
        match self {
            Alignment::Compact | Alignment::CompactPageAligned => 4,
            Alignment::PageAligned => 4096,
        }
    }

    fn global_align(self) -> u32 {
        match self {
            Alignment::Compact => 4,
            _ => 4096,
        }
    }
}

/// A loadable image.
pub struct Image {
    /// `instructions | pad | strings`. Globals are not materialized in
    /// the file; the loader reserves them after the end.
    pub execbin: Vec<u8>,
    /// Bytes of encoded instructions at the start of `execbin`.
    pub executable_instr_sz: u32,
    /// Bytes of string constants.
    pub constant_strings_sz: u32,
    /// Bytes the loader must reserve for globals.
    pub global_var_region_sz: u32,
    /// Export table: `signature \0 u64le(code offset)` per entry.
    pub export_info: Vec<u8>,
    /// Import table: `signature \0 u64le(string-region offset)` per
    /// entry.
    pub import_info: Vec<u8>,
    /// Debug line table; empty when debug info was not requested.
    pub dbg_info: Vec<u8>,
}

struct OpState {
    func: FuncId,
    inst: u32,
    widths: [ImmWidth; 2],
    lowered: Lowered,
    offset: u32,
}

fn align_up(n: u32, to: u32) -> u32 {
    (n + to - 1) & !(to - 1)
}

/// Lower a compilation to an image for `triple`.
pub fn emit_image(comp: &Compilation, align: Alignment, triple: &Triple) -> CodegenResult<Image> {
    if comp.sizeof_gpr != 8 {
        return Err(CodegenError::Unsupported(format!(
            "the x86-64 backend requires 8-byte gprs, compilation used {}",
            comp.sizeof_gpr
        )));
    }
    let info = EmitInfo {
        linux: triple.operating_system == OperatingSystem::Linux,
    };

    // First lowering of every instruction, in image order.
    let mut ops: Vec<OpState> = Vec::new();
    let mut func_first_op: Vec<Option<u32>> = vec![None; comp.module.funcs.len()];
    for (fid, fd) in comp.module.funcs.iter() {
        if fd.insts.is_empty() {
            continue;
        }
        func_first_op[fid.index()] = Some(ops.len() as u32);
        for (idx, inst) in fd.insts.iter().enumerate() {
            let widths = initial_widths(inst.op);
            let lowered = lower_inst(inst, widths, &info)?;
            ops.push(OpState {
                func: fid,
                inst: idx as u32,
                widths,
                lowered,
                offset: 0,
            });
        }
    }

    // Relax to a fixpoint.
    let mut func_start: Vec<u32> = vec![0; comp.module.funcs.len()];
    let mut code_sz;
    let mut string_base;
    let mut global_base;
    let mut passes = 0u32;
    loop {
        passes += 1;
        let mut off = 0u32;
        for op in ops.iter_mut() {
            if op.inst == 0 {
                func_start[op.func.index()] = off;
            }
            op.offset = off;
            off += op.lowered.asm.len();
        }
        code_sz = off;
        string_base = align_up(code_sz, align.string_align());
        global_base = align_up(string_base + comp.string_region.len() as u32, align.global_align());

        let mut redo = false;
        for i in 0..ops.len() {
            let op = &ops[i];
            let inst = &comp.module.funcs[op.func].insts[op.inst as usize];
            let mut grow: Option<u8> = None;
            for fx in &op.lowered.fixups {
                let val = fixup_value(
                    fx.source,
                    &inst.imm,
                    &func_first_op,
                    &func_start,
                    &ops,
                    op,
                    string_base,
                    global_base,
                    fx.pc_rel,
                    fx.at,
                    fx.width,
                    fx.addend,
                )?;
                if !fx.width.fits(val) {
                    grow = Some(fx.slot);
                    break;
                }
            }
            if let Some(slot) = grow {
                let op = &mut ops[i];
                let cur = op.widths[slot as usize];
                let Some(wider) = cur.widen() else {
                    return Err(CodegenError::Unsupported(format!(
                        "immediate of `{}` does not fit its widest encoding",
                        inst.op.name()
                    )));
                };
                trace!(
                    "widening {} at op {} from {:?} to {:?}",
                    inst.op.name(),
                    i,
                    cur,
                    wider
                );
                op.widths[slot as usize] = wider;
                op.lowered = lower_inst(inst, op.widths, &info)?;
                // An encoding that cannot use the wider field keeps its
                // hardware width; the next pass errors out if the value
                // still does not fit.
                redo = true;
            }
        }
        if !redo {
            break;
        }
    }
    debug!("layout fixpoint after {passes} pass(es), {code_sz} code bytes");

    // Patch all fields against the final layout: resolve first against
    // the immutable op list, then write the bytes.
    let mut patches: Vec<(usize, u32, ImmWidth, i64)> = Vec::new();
    for (i, op) in ops.iter().enumerate() {
        let inst = &comp.module.funcs[op.func].insts[op.inst as usize];
        for fx in &op.lowered.fixups {
            let val = fixup_value(
                fx.source,
                &inst.imm,
                &func_first_op,
                &func_start,
                &ops,
                op,
                string_base,
                global_base,
                fx.pc_rel,
                fx.at,
                fx.width,
                fx.addend,
            )?;
            if !fx.width.fits(val) {
                return Err(CodegenError::Unsupported(format!(
                    "immediate of `{}` regressed after relaxation",
                    inst.op.name()
                )));
            }
            patches.push((i, fx.at, fx.width, val));
        }
    }
    for (i, at, width, val) in patches {
        patch(&mut ops[i].lowered, at, width, val);
    }

    // Assemble the binary: code, pad, strings.
    let mut execbin = Vec::with_capacity(string_base as usize + comp.string_region.len());
    for op in &ops {
        execbin.extend_from_slice(&op.lowered.asm.bytes);
    }
    debug_assert_eq!(execbin.len() as u32, code_sz);
    execbin.resize(string_base as usize, 0);
    execbin.extend_from_slice(&comp.string_region);

    let export_info = build_exports(comp, &func_start);
    let import_info = build_imports(comp);
    let dbg_info = build_debug(comp, &ops, code_sz);

    Ok(Image {
        execbin,
        executable_instr_sz: code_sz,
        constant_strings_sz: comp.string_region.len() as u32,
        global_var_region_sz: comp.global_region_sz,
        export_info,
        import_info,
        dbg_info,
    })
}

fn op_index(func_first_op: &[Option<u32>], func: FuncId, inst: u32) -> u32 {
    func_first_op[func.index()].expect("function with lowered ops") + inst
}

/// Value of a fixup against the current tentative layout.
#[allow(clippy::too_many_arguments)]
fn fixup_value(
    source: FixupSource,
    imm: &[ImmVal],
    func_first_op: &[Option<u32>],
    func_start: &[u32],
    ops: &[OpState],
    op: &OpState,
    string_base: u32,
    global_base: u32,
    pc_rel: bool,
    at: u32,
    width: ImmWidth,
    addend: i64,
) -> CodegenResult<i64> {
    let mut val = addend;
    match source {
        FixupSource::GlobalRegion => val += global_base as i64,
        FixupSource::Imm => {
            for term in imm {
                val += match term {
                    ImmVal::Value(n) => *n,
                    ImmVal::OffsetToInstruction(j) => {
                        let idx = op_index(func_first_op, op.func, j.index() as u32);
                        ops[idx as usize].offset as i64
                    }
                    ImmVal::OffsetToFunction(g) => func_start[g.index()] as i64,
                    ImmVal::OffsetToGlobalRegion => global_base as i64,
                    ImmVal::OffsetToStringRegion => string_base as i64,
                    other => {
                        return Err(CodegenError::UnresolvedImmediate(format!("{other:?}")));
                    }
                };
            }
        }
    }
    if pc_rel {
        val -= (op.offset + at + width.bytes()) as i64;
    }
    Ok(val)
}

fn patch(lowered: &mut Lowered, at: u32, width: ImmWidth, val: i64) {
    let at = at as usize;
    match width {
        ImmWidth::W8 => lowered.asm.bytes[at] = val as i8 as u8,
        ImmWidth::W32 => {
            lowered.asm.bytes[at..at + 4].copy_from_slice(&(val as i32).to_le_bytes());
        }
        ImmWidth::W64 => {
            lowered.asm.bytes[at..at + 8].copy_from_slice(&val.to_le_bytes());
        }
    }
}

fn build_exports(comp: &Compilation, func_start: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    for (fid, fd) in comp.module.funcs.iter() {
        if !fd.exported || fd.insts.is_empty() {
            continue;
        }
        out.extend_from_slice(fd.linking_signature.as_bytes());
        out.push(0);
        out.extend_from_slice(&u64::from(func_start[fid.index()]).to_le_bytes());
    }
    out
}

fn build_imports(comp: &Compilation) -> Vec<u8> {
    let mut out = Vec::new();
    for (_, fd) in comp.module.funcs.iter() {
        let Some(slot) = fd.import_offset else {
            continue;
        };
        if fd.insts.is_empty() {
            continue;
        }
        out.extend_from_slice(fd.linking_signature.as_bytes());
        out.push(0);
        out.extend_from_slice(&u64::from(slot).to_le_bytes());
    }
    out
}

/// The two debug sections: an array of
/// `(bin_offset, path_offset, line, line_offset)` entries closed by a
/// zero-line sentinel at the end of code, then the referenced path
/// strings. Each section is preceded by its own u64 byte size.
fn build_debug(comp: &Compilation, ops: &[OpState], code_sz: u32) -> Vec<u8> {
    let mut section1: Vec<u8> = Vec::new();
    let mut section2: Vec<u8> = Vec::new();
    let mut path_offsets: Vec<(std::sync::Arc<str>, u64)> = Vec::new();
    let mut last: Option<(std::sync::Arc<str>, u32)> = None;
    let mut any = false;

    for op in ops {
        let inst = &comp.module.funcs[op.func].insts[op.inst as usize];
        let Some(path) = &inst.loc.path else { continue };
        any = true;
        if let Some((lp, ll)) = &last {
            if *ll == inst.loc.line && std::sync::Arc::ptr_eq(lp, path) {
                continue;
            }
        }
        last = Some((path.clone(), inst.loc.line));
        let path_off = match path_offsets.iter().find(|(p, _)| std::sync::Arc::ptr_eq(p, path)) {
            Some((_, off)) => *off,
            None => {
                let off = section2.len() as u64;
                section2.extend_from_slice(path.as_bytes());
                section2.push(0);
                path_offsets.push((path.clone(), off));
                off
            }
        };
        section1.extend_from_slice(&u64::from(op.offset).to_le_bytes());
        section1.extend_from_slice(&path_off.to_le_bytes());
        section1.extend_from_slice(&u64::from(inst.loc.line).to_le_bytes());
        section1.extend_from_slice(&u64::from(inst.loc.line_offset).to_le_bytes());
    }
    if !any {
        return Vec::new();
    }
    // Sentinel: end of code, zero line.
    section1.extend_from_slice(&u64::from(code_sz).to_le_bytes());
    section1.extend_from_slice(&0u64.to_le_bytes());
    section1.extend_from_slice(&0u64.to_le_bytes());
    section1.extend_from_slice(&0u64.to_le_bytes());

    let mut out = Vec::with_capacity(16 + section1.len() + section2.len());
    out.extend_from_slice(&(section1.len() as u64).to_le_bytes());
    out.extend_from_slice(&section1);
    out.extend_from_slice(&(section2.len() as u64).to_le_bytes());
    out.extend_from_slice(&section2);
    out
}
