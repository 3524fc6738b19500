//! Pass-2 LIR emission.
//!
//! Frame conventions. A *holder* frame of size `S = 7g + cache + locals +
//! argarea` (g = GPR size) is laid out, base-relative:
//!
//! ```text
//! [0]           scratch slot (reserved)
//! [g]           scratch slot (reserved)
//! [2g .. +c)    stackframe-pointer cache
//! [2g+c .. +l)  locals
//! [.. +a)       arguments
//! [S-5g]        stack-page link (0 when no page was allocated)
//! [S-4g]        static link: frame of the lexical parent
//! [S-3g]        return-variable pointer
//! [S-2g]        caller's stack pointer
//! [S-g]         return address (written by the call instruction)
//! ```
//!
//! The top five slots sit at fixed offsets from the frame *top*, so a
//! caller that cannot know the callee's size (indirect calls reserve
//! `MAX_STACK_USAGE`) can still fill them. A *tenant* frame is
//! `[0] return address, [g] caller stack pointer, locals, arguments,
//! return-variable pointer` and lives inside its holder's shared area,
//! `OffsetWithinSharedRegion` below the holder's base.
//!
//! The stack pointer register (id 0) always points at the current
//! function's frame base. Calls write the callee frame below the stack
//! bottom (holders) or into the shared area (tenants), move the stack
//! pointer there, and restore it from the callee's saved-pointer slot
//! after the return.

use super::regalloc::Binding;
use super::Walker;
use crate::entity::EntityRef;
use crate::error::{CompileError, CompileResult};
use crate::frontend::ast::Expr;
use crate::func::ArgFlag;
use crate::lir::{FuncId, ImmList, ImmVal, Inst, InstId, Opcode, VarId};
use crate::settings::{CompileFlags, MAX_ARG_USAGE, MAX_STACK_USAGE, PAGE_SIZE};
use crate::typestr;
use crate::vars::VarKind;
use smallvec::SmallVec;

/// A branch placeholder target, patched before the function is finished.
const UNPATCHED: InstId = InstId(u32::MAX);

impl<'a> Walker<'a> {
    fn internal(&self, msg: impl Into<String>) -> CompileError {
        let msg = format!("internal error: {}", msg.into());
        (self.opts.error)(&msg);
        CompileError::Semantic(msg)
    }

    // ---- raw instruction plumbing --------------------------------------

    /// Append an instruction to the current function, stamping the
    /// debug location and the free-register snapshot.
    pub(super) fn push_inst(&mut self, mut inst: Inst) -> InstId {
        let free = self.cur().regs.free_ids();
        if !free.is_empty() {
            inst.unused_regs = Some(SmallVec::from_vec(free));
        }
        inst.loc = self.cur().loc.clone();
        let f = self.cur_func();
        let insts = &mut self.module.funcs[f].insts;
        let id = InstId(insts.len() as u32);
        insts.push(inst);
        id
    }

    pub(super) fn emit_simple(&mut self, op: Opcode, r1: u8, r2: u8, r3: u8) -> InstId {
        let mut inst = Inst::new(op);
        inst.r1 = r1;
        inst.r2 = r2;
        inst.r3 = r3;
        self.push_inst(inst)
    }

    pub(super) fn emit_with_imm(
        &mut self,
        op: Opcode,
        r1: u8,
        r2: u8,
        r3: u8,
        imm: &[ImmVal],
    ) -> InstId {
        let mut inst = Inst::new(op);
        inst.r1 = r1;
        inst.r2 = r2;
        inst.r3 = r3;
        inst.imm = SmallVec::from_slice(imm);
        self.push_inst(inst)
    }

    /// Emit a comment instruction when narration is enabled.
    pub(super) fn emit_comment(&mut self, text: impl Into<String>) {
        if self.opts.flags.contains(CompileFlags::COMMENT) {
            let mut inst = Inst::new(Opcode::Comment);
            inst.text = Some(text.into().into_boxed_str());
            self.push_inst(inst);
        }
    }

    /// A `Nop` marking a branch target. Every branch in the function
    /// points at one of these; the resolver later slides targets forward
    /// to the next real instruction.
    pub(super) fn emit_block_boundary(&mut self) -> InstId {
        self.emit_simple(Opcode::Nop, 0, 0, 0)
    }

    /// A relative branch whose target is patched later.
    pub(super) fn emit_branch_placeholder(&mut self, op: Opcode, r1: u8, r2: u8) -> InstId {
        debug_assert!(op.is_rel_branch());
        self.emit_with_imm(op, r1, r2, 0, &[ImmVal::OffsetToInstruction(UNPATCHED)])
    }

    /// Point a placeholder branch at `target`.
    pub(super) fn patch_branch(&mut self, branch: InstId, target: InstId) {
        let f = self.cur_func();
        let inst = &mut self.module.funcs[f].insts[branch.index()];
        for term in inst.imm.iter_mut() {
            if *term == ImmVal::OffsetToInstruction(UNPATCHED) {
                *term = ImmVal::OffsetToInstruction(target);
                return;
            }
        }
        debug_assert!(false, "patch_branch on a non-placeholder");
    }

    // ---- register management -------------------------------------------

    pub(super) fn lock_reg(&mut self, id: u8) {
        self.cur_mut().regs.get_mut(id).lock += 1;
    }

    pub(super) fn unlock_reg(&mut self, id: u8) {
        let reg = self.cur_mut().regs.get_mut(id);
        debug_assert!(reg.lock > 0);
        reg.lock -= 1;
    }

    /// Allocate a register, spilling the least recently used binding if
    /// nothing is free.
    pub(super) fn alloc_reg(&mut self) -> CompileResult<u8> {
        let Some(id) = self.cur().regs.pick_victim() else {
            return Err(self.internal("all registers locked"));
        };
        if self.cur().regs.get(id).binding != Binding::Free {
            self.flush_reg(id)?;
            self.cur_mut().regs.release(id);
        }
        self.cur_mut().regs.touch(id);
        Ok(id)
    }

    /// Allocate the result register for `op`, first making sure the
    /// backend's promised scratch registers will be free once the result
    /// register is taken.
    pub(super) fn alloc_result_reg(&mut self, op: Opcode) -> CompileResult<u8> {
        let want = self.opts.min_unused_reg_count_for_op[op as usize] as usize;
        self.ensure_free(want + 1)?;
        self.alloc_reg()
    }

    /// Flush and release bound registers, least recently used first,
    /// until at least `n` are free.
    pub(super) fn ensure_free(&mut self, n: usize) -> CompileResult<()> {
        while self.cur().regs.free_count() < n {
            let victim = self
                .cur()
                .regs
                .bound_ids()
                .into_iter()
                .find(|&id| {
                    let r = self.cur().regs.get(id);
                    r.lock == 0 && !r.reserved
                });
            let Some(id) = victim else {
                return Err(self.internal("cannot satisfy scratch register contract"));
            };
            self.flush_reg(id)?;
            self.cur_mut().regs.release(id);
        }
        Ok(())
    }

    /// Write a dirty register's value back to its variable. The binding
    /// stays.
    pub(super) fn flush_reg(&mut self, id: u8) -> CompileResult<()> {
        let (binding, dirty, size) = {
            let r = self.cur().regs.get(id);
            (r.binding.clone(), r.dirty, r.size)
        };
        if !dirty {
            return Ok(());
        }
        let Binding::Var { var, offset } = binding else {
            return Ok(());
        };
        self.lock_reg(id);
        let (base_reg, imms) = self.materialize_addr(var, offset)?;
        self.emit_store(id, base_reg, &imms, size.max(1));
        self.unlock_reg(id);
        self.cur_mut().regs.get_mut(id).dirty = false;
        Ok(())
    }

    /// Flush every dirty register; with `discard`, also drop all
    /// bindings. Done before every branch target, branch, call, and asm
    /// block.
    pub(super) fn flush_all_regs(&mut self, discard: bool) {
        for id in self.cur().regs.bound_ids() {
            // A flush failure here means a corrupt binding; surface it
            // lazily through the next real emission instead of unwinding
            // mid-statement.
            let _ = self.flush_reg(id);
            if discard {
                self.cur_mut().regs.release(id);
            }
        }
    }

    /// Bind `reg` as the dirty holder of `var`'s value.
    pub(super) fn bind_result(&mut self, var: VarId, reg: u8) {
        let size = self.module.vars[var].size.min(self.gpr()).max(1);
        self.cur_mut().regs.bind(reg, Binding::Var { var, offset: 0 });
        let r = self.cur_mut().regs.get_mut(reg);
        r.dirty = true;
        r.size = size;
    }

    // ---- sized loads and stores ----------------------------------------

    fn ld_op(size: u32, with_imm: bool) -> Opcode {
        match (size, with_imm) {
            (1, true) => Opcode::Ld8,
            (1, false) => Opcode::Ld8R,
            (2, true) => Opcode::Ld16,
            (2, false) => Opcode::Ld16R,
            (4, true) => Opcode::Ld32,
            (4, false) => Opcode::Ld32R,
            (_, true) => Opcode::Ld64,
            (_, false) => Opcode::Ld64R,
        }
    }

    fn st_op(size: u32, with_imm: bool) -> Opcode {
        match (size, with_imm) {
            (1, true) => Opcode::St8,
            (1, false) => Opcode::St8R,
            (2, true) => Opcode::St16,
            (2, false) => Opcode::St16R,
            (4, true) => Opcode::St32,
            (4, false) => Opcode::St32R,
            (_, true) => Opcode::St64,
            (_, false) => Opcode::St64R,
        }
    }

    pub(super) fn emit_load(&mut self, rd: u8, base: u8, imms: &[ImmVal], size: u32) -> InstId {
        let op = Self::ld_op(size, !imms.is_empty());
        if imms.is_empty() {
            self.emit_simple(op, rd, base, 0)
        } else {
            self.emit_with_imm(op, rd, base, 0, imms)
        }
    }

    pub(super) fn emit_store(&mut self, rs: u8, base: u8, imms: &[ImmVal], size: u32) -> InstId {
        let op = Self::st_op(size, !imms.is_empty());
        if imms.is_empty() {
            self.emit_simple(op, rs, base, 0)
        } else {
            self.emit_with_imm(op, rs, base, 0, imms)
        }
    }

    // ---- frame addressing ----------------------------------------------

    /// Is the pass-2 function `f` a tenant, per the plan?
    fn is_tenant(&self, f: FuncId) -> bool {
        let p1f = self.p1_func(f);
        self.p1_module().funcs[p1f].stackframe_holder.is_some()
    }

    /// The shared region backing tenant `f`'s tiny frame.
    fn region_of(&self, f: FuncId) -> CompileResult<crate::lir::RegionId> {
        let p1f = self.p1_func(f);
        self.p1_module().funcs[p1f]
            .shared_region_to_use
            .ok_or_else(|| self.internal("tenant without a shared region"))
    }

    /// Total argument-area bytes of `f`: `MAX_ARG_USAGE` for variadics,
    /// else the end of the last argument.
    pub(super) fn arg_area(&self, f: FuncId) -> u32 {
        let fd = &self.module.funcs[f];
        if fd.variadic {
            return MAX_ARG_USAGE;
        }
        fd.args
            .last()
            .map(|&a| {
                let v = &self.module.vars[a];
                v.offset + v.size
            })
            .unwrap_or(0)
    }

    /// Immediate terms for the frame offset of a variable of `f` with
    /// area-relative `offset`, relative to `f`'s frame base.
    fn frame_offset_imms(&self, f: FuncId, kind: VarKind, offset: u32) -> ImmList {
        let g = self.gpr() as i64;
        let mut imms: ImmList = SmallVec::new();
        match (self.is_tenant(f), kind) {
            (false, VarKind::Local) => {
                imms.push(ImmVal::Value(2 * g + offset as i64));
                imms.push(ImmVal::StackframePtrCacheSize(f));
            }
            (false, _) => {
                imms.push(ImmVal::Value(2 * g + offset as i64));
                imms.push(ImmVal::StackframePtrCacheSize(f));
                imms.push(ImmVal::LocalVarsSize(f));
            }
            (true, VarKind::Local) => {
                imms.push(ImmVal::Value(2 * g + offset as i64));
            }
            (true, _) => {
                imms.push(ImmVal::Value(2 * g + offset as i64));
                imms.push(ImmVal::LocalVarsSize(f));
            }
        }
        imms
    }

    /// Immediate terms for `S(f) - back` where `S` is `f`'s full frame
    /// size; used for the top-relative slots.
    fn top_slot_imms(&self, f: FuncId, back: i64) -> ImmList {
        let g = self.gpr() as i64;
        debug_assert!(!self.is_tenant(f));
        let mut imms: ImmList = SmallVec::new();
        imms.push(ImmVal::Value(7 * g + self.arg_area(f) as i64 - back));
        imms.push(ImmVal::StackframePtrCacheSize(f));
        imms.push(ImmVal::LocalVarsSize(f));
        imms
    }

    /// Immediate terms for the return-variable pointer slot of `f`.
    fn retvar_slot_imms(&self, f: FuncId) -> ImmList {
        let g = self.gpr() as i64;
        if self.is_tenant(f) {
            let mut imms: ImmList = SmallVec::new();
            imms.push(ImmVal::Value(2 * g + self.arg_area(f) as i64));
            imms.push(ImmVal::LocalVarsSize(f));
            imms
        } else {
            self.top_slot_imms(f, 3 * self.gpr() as i64)
        }
    }

    /// A register holding the frame address of the ancestor `level`
    /// steps up from the current function. Level 0 is invalid; the
    /// root's variables live in the global region and never come here.
    pub(super) fn ancestor_frame_reg(&mut self, level: u32) -> CompileResult<u8> {
        debug_assert!(level > 0);
        if let Some(r) = self.cur().regs.find(&Binding::FuncLevel(level)) {
            self.cur_mut().regs.touch(r);
            return Ok(r);
        }
        let cur = self.cur_func();
        let a = self
            .module
            .ancestor_at(cur, level)
            .ok_or_else(|| self.internal("ancestor level out of range"))?;

        if self.is_tenant(a) {
            // A tenant ancestor's frame sits inside its holder's shared
            // area at a fixed region offset.
            let region = self.region_of(a)?;
            let a_p1 = self.p1_func(a);
            let holder_p1 = self.p1_module().funcs[a_p1].stackframe_holder.expect("tenant without a holder");
            let holder = self.p1_module().funcs[holder_p1]
                .secondpass
                .ok_or_else(|| self.internal("holder without a pass-2 twin"))?;
            let hlevel = self
                .module
                .level_to(cur, holder)
                .ok_or_else(|| self.internal("holder not on ancestor chain"))?;
            let rh = self.ancestor_frame_reg(hlevel)?;
            self.lock_reg(rh);
            let rt = self.alloc_reg()?;
            self.emit_with_imm(Opcode::Li, rt, 0, 0, &[ImmVal::OffsetWithinSharedRegion(region)]);
            self.emit_simple(Opcode::Sub, rt, rh, rt);
            self.unlock_reg(rh);
            self.cur_mut().regs.bind(rt, Binding::FuncLevel(level));
            self.cur_mut().regs.get_mut(rt).size = self.gpr();
            return Ok(rt);
        }

        if self.is_tenant(cur) {
            let cur_p1 = self.p1_func(cur);
            let holder_p1 = self.p1_module().funcs[cur_p1].stackframe_holder.expect("tenant without a holder");
            let holder = self.p1_module().funcs[holder_p1]
                .secondpass
                .ok_or_else(|| self.internal("holder without a pass-2 twin"))?;
            let hlevel = self
                .module
                .level_to(cur, holder)
                .ok_or_else(|| self.internal("holder not on ancestor chain"))?;
            if level == hlevel {
                // The holder itself: its base is our tiny frame plus the
                // region offset.
                let region = self.region_of(cur)?;
                let rd = self.alloc_reg()?;
                self.emit_with_imm(
                    Opcode::AddI,
                    rd,
                    0,
                    0,
                    &[ImmVal::OffsetWithinSharedRegion(region)],
                );
                self.cur_mut().regs.bind(rd, Binding::FuncLevel(level));
                self.cur_mut().regs.get_mut(rd).size = self.gpr();
                return Ok(rd);
            }
            // Above the holder: read the holder's pointer cache. Tenant
            // levels were merged into the holder's list by the planner.
            let rh = self.ancestor_frame_reg(hlevel)?;
            self.lock_reg(rh);
            let idx = self.cache_slot_index(holder_p1, level - hlevel)?;
            let g = self.gpr() as i64;
            let rd = self.alloc_reg()?;
            let size = self.gpr();
            self.emit_load(rd, rh, &[ImmVal::Value(2 * g + idx as i64 * g)], size);
            self.unlock_reg(rh);
            self.cur_mut().regs.bind(rd, Binding::FuncLevel(level));
            self.cur_mut().regs.get_mut(rd).size = size;
            return Ok(rd);
        }

        // A holder reads its own pointer cache.
        let cur_p1 = self.p1_func(cur);
        let idx = self.cache_slot_index(cur_p1, level)?;
        let g = self.gpr() as i64;
        let rd = self.alloc_reg()?;
        let size = self.gpr();
        self.emit_load(rd, 0, &[ImmVal::Value(2 * g + idx as i64 * g)], size);
        self.cur_mut().regs.bind(rd, Binding::FuncLevel(level));
        self.cur_mut().regs.get_mut(rd).size = size;
        Ok(rd)
    }

    /// Index of `level` within a pass-1 function's cached-stackframe
    /// list, which is its slot in the pointer cache.
    fn cache_slot_index(&self, p1f: FuncId, level: u32) -> CompileResult<usize> {
        self.p1_module().funcs[p1f]
            .cached_stackframes
            .iter()
            .position(|&l| l == level)
            .ok_or_else(|| self.internal(format!("level {level} not in pointer cache")))
    }

    /// The address of `var` (+`extra` bytes) as a base register plus
    /// immediate terms. The returned register, when not the stack
    /// pointer, is bound or scratch; callers needing it alive across
    /// further allocation must lock it.
    pub(super) fn materialize_addr(
        &mut self,
        var: VarId,
        extra: u32,
    ) -> CompileResult<(u8, ImmList)> {
        let (base, view_off) = self.resolve_view(var);
        let off = view_off + extra;

        if let Some(p) = self.module.vars[base].deref_of {
            let rp = self.reg_for_value(p)?;
            let mut imms: ImmList = SmallVec::new();
            if off != 0 {
                imms.push(ImmVal::Value(off as i64));
            }
            return Ok((rp, imms));
        }
        if let Some(addr) = self.module.vars[base].host_addr {
            let rd = self.alloc_reg()?;
            self.emit_with_imm(
                Opcode::Li,
                rd,
                0,
                0,
                &[ImmVal::Value(addr as i64 + off as i64)],
            );
            return Ok((rd, SmallVec::new()));
        }

        let owner = self.module.vars[base]
            .owner
            .ok_or_else(|| self.internal("address of an unowned variable"))?;
        let (var_off, kind) = {
            let v = &self.module.vars[base];
            (v.offset, v.kind)
        };
        let root = self.module.root();
        if owner == root {
            // Globals live in the global region, addressed from a base
            // register materialized once per block.
            let rg = match self.cur().regs.find(&Binding::GlobalRegion) {
                Some(r) => {
                    self.cur_mut().regs.touch(r);
                    r
                }
                None => {
                    let r = self.alloc_reg()?;
                    self.emit_with_imm(Opcode::Afip, r, 0, 0, &[ImmVal::OffsetToGlobalRegion]);
                    self.cur_mut().regs.bind(r, Binding::GlobalRegion);
                    self.cur_mut().regs.get_mut(r).size = self.gpr();
                    r
                }
            };
            let mut imms: ImmList = SmallVec::new();
            imms.push(ImmVal::Value(var_off as i64 + off as i64));
            return Ok((rg, imms));
        }

        let cur = self.cur_func();
        if owner == cur {
            return Ok((0, self.frame_offset_imms(cur, kind, var_off + off)));
        }

        let level = self
            .module
            .level_to(cur, owner)
            .ok_or_else(|| self.internal("variable owner not on ancestor chain"))?;
        let rb = self.ancestor_frame_reg(level)?;
        Ok((rb, self.frame_offset_imms(owner, kind, var_off + off)))
    }

    /// Load the value of `var` into a register.
    pub(super) fn reg_for_value(&mut self, var: VarId) -> CompileResult<u8> {
        let (is_number, number_value, string_offset, func_addr, addr_of, deref_of) = {
            let v = &self.module.vars[var];
            (
                v.is_number,
                v.number_value,
                v.string_offset,
                v.func_addr,
                v.addr_of,
                v.deref_of,
            )
        };
        if is_number {
            if let Some(r) = self.cur().regs.find(&Binding::Var { var, offset: 0 }) {
                self.cur_mut().regs.touch(r);
                return Ok(r);
            }
            let rd = self.alloc_result_reg(Opcode::Li)?;
            self.emit_with_imm(Opcode::Li, rd, 0, 0, &[ImmVal::Value(number_value as i64)]);
            self.cur_mut().regs.bind(rd, Binding::Var { var, offset: 0 });
            self.cur_mut().regs.get_mut(rd).size = self.gpr();
            return Ok(rd);
        }
        if let Some(off) = string_offset {
            let rd = self.alloc_result_reg(Opcode::Afip)?;
            self.emit_with_imm(
                Opcode::Afip,
                rd,
                0,
                0,
                &[ImmVal::OffsetToStringRegion, ImmVal::Value(off as i64)],
            );
            self.cur_mut().regs.bind(rd, Binding::Var { var, offset: 0 });
            self.cur_mut().regs.get_mut(rd).size = self.gpr();
            return Ok(rd);
        }
        if let Some(f) = func_addr {
            let rd = self.alloc_result_reg(Opcode::Afip)?;
            self.emit_with_imm(Opcode::Afip, rd, 0, 0, &[ImmVal::OffsetToFunction(f)]);
            return Ok(rd);
        }
        if let Some(target) = addr_of {
            let (base, imms) = self.materialize_addr(target, 0)?;
            self.lock_reg_if_gpr(base);
            let rd = self.alloc_reg()?;
            if imms.is_empty() {
                self.emit_simple(Opcode::Cpy, rd, base, 0);
            } else {
                self.emit_with_imm(Opcode::AddI, rd, base, 0, &imms);
            }
            self.unlock_reg_if_gpr(base);
            return Ok(rd);
        }
        if let Some(p) = deref_of {
            let size = self.access_size_of(var);
            let rp = self.reg_for_value(p)?;
            self.lock_reg(rp);
            let rd = self.alloc_reg()?;
            self.emit_load(rd, rp, &[], size);
            self.unlock_reg(rp);
            self.sign_extend_if_needed(rd, var, size);
            return Ok(rd);
        }

        // A storage variable or a view of one.
        let (base, off) = self.resolve_view(var);
        let size = self.access_size_of(var);
        let volatile = self.is_volatile(base);
        if !volatile {
            if let Some(r) = self.cur().regs.find(&Binding::Var { var: base, offset: off }) {
                if self.cur().regs.get(r).size == size {
                    self.cur_mut().regs.touch(r);
                    return Ok(r);
                }
                self.flush_reg(r)?;
                self.cur_mut().regs.release(r);
            }
        }
        let (breg, imms) = self.materialize_addr(base, off)?;
        self.lock_reg_if_gpr(breg);
        let rd = self.alloc_reg()?;
        self.emit_load(rd, breg, &imms, size);
        self.unlock_reg_if_gpr(breg);
        self.sign_extend_if_needed(rd, var, size);
        if !volatile {
            self.cur_mut().regs.bind(rd, Binding::Var { var: base, offset: off });
            let r = self.cur_mut().regs.get_mut(rd);
            r.size = size;
        }
        Ok(rd)
    }

    fn lock_reg_if_gpr(&mut self, id: u8) {
        if id != 0 {
            self.lock_reg(id);
        }
    }

    fn unlock_reg_if_gpr(&mut self, id: u8) {
        if id != 0 {
            self.unlock_reg(id);
        }
    }

    fn is_volatile(&self, base: VarId) -> bool {
        let master = self.module.vars[base].volatile_master.unwrap_or(base);
        self.module.vars[master].is_always_volatile
    }

    fn access_size_of(&self, var: VarId) -> u32 {
        let ty = self.module.vars[var].effective_ty().unwrap_or("uint");
        typestr::access_size(&self.module, ty, self.gpr()).unwrap_or(self.gpr())
    }

    fn sign_extend_if_needed(&mut self, rd: u8, var: VarId, size: u32) {
        if size >= self.gpr() {
            return;
        }
        let signed = {
            let ty = self.module.vars[var].effective_ty().unwrap_or("uint");
            typestr::is_signed(ty)
        };
        if signed {
            self.emit_with_imm(Opcode::Sxt, rd, rd, 0, &[ImmVal::Value(8 * size as i64)]);
            let r = self.cur_mut().regs.get_mut(rd);
            r.was_sext = true;
            r.was_zext = false;
        } else {
            // Loads already zero extend.
            self.cur_mut().regs.get_mut(rd).was_zext = true;
        }
    }

    // ---- assignment ----------------------------------------------------

    /// Store `value` into the place `place` (+`extra` bytes), typed as
    /// `ty`. Named stores write through to memory; only temps ride in
    /// registers.
    pub(super) fn assign_var(
        &mut self,
        place: VarId,
        extra: u32,
        ty: &str,
        value: VarId,
        pos: u32,
    ) -> CompileResult<()> {
        if !self.emit {
            return Ok(());
        }
        let size_total = typestr::sizeof(&self.module, ty, self.gpr());
        let scalar = typestr::access_size(&self.module, ty, self.gpr());
        match (scalar, size_total) {
            (Some(size), _) => {
                let rv = self.reg_for_value(value)?;
                self.lock_reg(rv);
                let (breg, imms) = self.materialize_addr(place, extra)?;
                self.lock_reg_if_gpr(breg);
                self.emit_store(rv, breg, &imms, size);
                self.unlock_reg_if_gpr(breg);
                self.unlock_reg(rv);
                // Drop stale read caches of the stored-to object.
                let (base, _) = self.resolve_view(place);
                for id in self.cur().regs.bound_ids() {
                    if id == rv {
                        continue;
                    }
                    if let Binding::Var { var, .. } = &self.cur().regs.get(id).binding {
                        if *var == base {
                            self.cur_mut().regs.release(id);
                        }
                    }
                }
                Ok(())
            }
            (None, Some(size)) if size > 0 => {
                // Aggregate copy through the string ops.
                let (sreg, simms) = self.materialize_addr(value, 0)?;
                self.lock_reg_if_gpr(sreg);
                let rs = self.alloc_reg()?;
                if simms.is_empty() {
                    self.emit_simple(Opcode::Cpy, rs, sreg, 0);
                } else {
                    self.emit_with_imm(Opcode::AddI, rs, sreg, 0, &simms);
                }
                self.unlock_reg_if_gpr(sreg);
                self.lock_reg(rs);
                let (dreg, dimms) = self.materialize_addr(place, extra)?;
                self.lock_reg_if_gpr(dreg);
                let rd = self.alloc_result_reg(Opcode::Mem8CpyI)?;
                if dimms.is_empty() {
                    self.emit_simple(Opcode::Cpy, rd, dreg, 0);
                } else {
                    self.emit_with_imm(Opcode::AddI, rd, dreg, 0, &dimms);
                }
                self.unlock_reg_if_gpr(dreg);
                self.emit_with_imm(Opcode::Mem8CpyI, rd, rs, 0, &[ImmVal::Value(size as i64)]);
                self.unlock_reg(rs);
                // The copy advanced both pointers; neither register
                // holds anything nameable now.
                self.cur_mut().regs.release(rs);
                self.cur_mut().regs.release(rd);
                Ok(())
            }
            _ => {
                let line = self.line_of(pos);
                Err(self.err_at(line, format!("cannot assign a value of type `{ty}`")))
            }
        }
    }

    // ---- prologue, epilogue, thunks ------------------------------------

    pub(super) fn emit_prologue(&mut self, f: FuncId) -> CompileResult<()> {
        if self.module.is_root(f) || self.is_tenant(f) {
            // Tenants run inside a fully prepared tiny frame; the root
            // runs on the host-provided stack.
            return Ok(());
        }
        let g = self.gpr() as i64;
        let name = self.module.funcs[f].name.clone();
        self.emit_comment(format!("prologue: {name}"));
        // Drop the stack pointer from the return-address slot down to
        // the frame base.
        let mut alloc: ImmList = SmallVec::new();
        alloc.push(ImmVal::Value(-(6 * g + self.arg_area(f) as i64)));
        alloc.push(ImmVal::NegStackframePtrCacheSize(f));
        alloc.push(ImmVal::NegLocalVarsSize(f));
        self.emit_with_imm(Opcode::AddI, 0, 0, 0, &alloc);

        // Fill the stackframe-pointer cache by walking static links from
        // the lexical parent, hopping over tenant ancestors through
        // their region offsets.
        let levels = {
            let p1f = self.p1_func(f);
            self.p1_module().funcs[p1f].cached_stackframes.clone()
        };
        if levels.is_empty() {
            return Ok(());
        }
        let rw = self.alloc_reg()?;
        self.lock_reg(rw);
        let static_link = self.top_slot_imms(f, 4 * g);
        let gpr = self.gpr();
        self.emit_load(rw, 0, &static_link, gpr);
        let mut walk_level = 1u32;
        let mut walk_anc = self.module.funcs[f]
            .parent
            .ok_or_else(|| self.internal("holder with no parent"))?;
        for (idx, &target) in levels.iter().enumerate() {
            while walk_level < target {
                if self.is_tenant(walk_anc) {
                    let region = self.region_of(walk_anc)?;
                    let anc_p1 = self.p1_func(walk_anc);
                    let holder_p1 = self.p1_module().funcs[anc_p1].stackframe_holder.expect("tenant without a holder");
                    let holder = self.p1_module().funcs[holder_p1]
                        .secondpass
                        .ok_or_else(|| self.internal("holder without a pass-2 twin"))?;
                    let hop = self
                        .module
                        .level_to(walk_anc, holder)
                        .ok_or_else(|| self.internal("holder not above tenant"))?;
                    self.emit_with_imm(
                        Opcode::AddI,
                        rw,
                        rw,
                        0,
                        &[ImmVal::OffsetWithinSharedRegion(region)],
                    );
                    walk_level += hop;
                    walk_anc = holder;
                } else {
                    let link = self.top_slot_imms(walk_anc, 4 * g);
                    self.emit_load(rw, rw, &link, gpr);
                    walk_level += 1;
                    walk_anc = self.module.funcs[walk_anc]
                        .parent
                        .ok_or_else(|| self.internal("walked past the root"))?;
                }
            }
            if walk_level != target {
                return Err(self.internal("pointer-cache walk overshot a level"));
            }
            self.emit_store(rw, 0, &[ImmVal::Value(2 * g + idx as i64 * g)], gpr);
        }
        self.unlock_reg(rw);
        self.cur_mut().regs.release(rw);
        Ok(())
    }

    /// Emit the return path: store the return value through the
    /// return-variable pointer, restore the stack pointer, and pop.
    pub(super) fn emit_epilogue(&mut self, f: FuncId, value: Option<VarId>) -> CompileResult<()> {
        self.flush_all_regs(true);
        if let Some(value) = value {
            let rv = self.reg_for_value(value)?;
            self.lock_reg(rv);
            let rp = self.alloc_reg()?;
            let slot = self.retvar_slot_imms(f);
            let gpr = self.gpr();
            self.emit_load(rp, 0, &slot, gpr);
            let ret_size = {
                let ty = &self.module.funcs[f].ret_ty;
                typestr::access_size(&self.module, ty, gpr).unwrap_or(gpr)
            };
            self.emit_store(rv, rp, &[], ret_size);
            self.unlock_reg(rv);
            self.flush_all_regs(true);
        }
        if !self.is_tenant(f) && !self.module.is_root(f) {
            let g = self.gpr() as i64;
            let mut dealloc: ImmList = SmallVec::new();
            dealloc.push(ImmVal::Value(6 * g + self.arg_area(f) as i64));
            dealloc.push(ImmVal::StackframePtrCacheSize(f));
            dealloc.push(ImmVal::LocalVarsSize(f));
            self.emit_with_imm(Opcode::AddI, 0, 0, 0, &dealloc);
        }
        self.emit_simple(Opcode::JPop, 0, 0, 0);
        Ok(())
    }

    /// The body of an imported function: jump through the address the
    /// loader wrote into the string region.
    pub(super) fn emit_import_thunk(&mut self, f: FuncId) -> CompileResult<()> {
        let slot = self.module.funcs[f]
            .import_offset
            .ok_or_else(|| self.internal("import thunk for a defined function"))?;
        self.stack.push(super::FuncCtx::new(f, self.opts.nbr_of_gpr));
        let rd = self.alloc_reg()?;
        self.emit_with_imm(
            Opcode::Afip,
            rd,
            0,
            0,
            &[ImmVal::OffsetToStringRegion, ImmVal::Value(slot as i64)],
        );
        let gpr = self.gpr();
        self.emit_load(rd, rd, &[], gpr);
        self.emit_simple(Opcode::JR, rd, 0, 0);
        self.stack.pop();
        Ok(())
    }

    // ---- calls ---------------------------------------------------------

    /// Evaluate a call expression: resolve the callee, walk the
    /// arguments, and in pass 2 emit the full call sequence.
    pub(super) fn eval_call(
        &mut self,
        callee_e: &Expr,
        args: &[Expr],
        pos: u32,
    ) -> CompileResult<VarId> {
        let line = self.line_of(pos);

        // A bare identifier that names no variable is a direct call.
        let direct = match callee_e {
            Expr::Ident { name, .. } if self.lookup_var(name).is_none() => {
                match self.lookup_fn(name, args.len()) {
                    Some(f) => Some(f),
                    None => {
                        return Err(
                            self.err_at(line, format!("no function `{name}` takes {} arguments", args.len()))
                        );
                    }
                }
            }
            _ => None,
        };

        let fp = match direct {
            Some(_) => None,
            None => {
                let v = self.eval_expr(callee_e)?;
                let ty = self.module.vars[v].effective_ty().unwrap_or("").to_string();
                if !ty.ends_with(')') {
                    return Err(self.err_at(line, format!("`{ty}` is not callable")));
                }
                Some((v, ty))
            }
        };

        let arg_vars: Vec<VarId> = args
            .iter()
            .map(|a| self.eval_expr(a))
            .collect::<CompileResult<_>>()?;

        // Parameter shapes: type, slot offset, by-ref.
        let (param_info, ret_ty, variadic) = match (&direct, &fp) {
            (Some(f), _) => {
                let fd = &self.module.funcs[*f];
                let info: Vec<(String, u32, bool)> = fd
                    .args
                    .iter()
                    .map(|&a| {
                        let v = &self.module.vars[a];
                        (
                            v.ty.clone().unwrap_or_else(|| "uint".to_string()),
                            v.offset,
                            v.is_byref,
                        )
                    })
                    .collect();
                (info, fd.ret_ty.clone(), fd.variadic)
            }
            (None, Some((_, ty))) => {
                let (ret, params, variadic) = parse_fn_ptr_ty(ty)
                    .ok_or_else(|| self.err_at(line, format!("malformed function type `{ty}`")))?;
                let mut off = 0u32;
                let mut info = Vec::new();
                for p in params {
                    let by_ref = p.ends_with('&');
                    let stored = if by_ref {
                        format!("{}*", &p[..p.len() - 1])
                    } else {
                        p.clone()
                    };
                    let size = typestr::sizeof(&self.module, &stored, self.gpr())
                        .ok_or_else(|| self.err_at(line, format!("unknown type `{stored}`")))?;
                    info.push((stored, off, by_ref));
                    off += size;
                }
                (info, ret, variadic)
            }
            _ => unreachable!(),
        };

        if !variadic && arg_vars.len() != param_info.len() {
            return Err(self.err_at(line, "wrong number of arguments"));
        }

        // Pass-1 bookkeeping: counts, propagation, argument flags.
        if !self.emit {
            self.note_call_pass1(direct, args, &arg_vars, &param_info, pos)?;
        }

        let result = if ret_ty != "void" {
            Some(self.make_temp(&ret_ty)?)
        } else {
            None
        };

        if self.emit {
            match direct {
                Some(f) => {
                    let sig = self.module.funcs[f].call_signature.clone();
                    self.emit_comment(format!("call {sig}"));
                }
                None => self.emit_comment("call through pointer"),
            }
            self.emit_call_sequence(direct, fp.map(|(v, _)| v), &arg_vars, &param_info, result)?;
        }

        match result {
            Some(r) => Ok(r),
            None => {
                // A void result; usable only as a statement.
                let cur = self.cur_func();
                let mut v = crate::vars::VarData::new(Some(cur), String::new());
                v.cast = Some("void".to_string());
                Ok(self.module.vars.push(v))
            }
        }
    }

    /// Pass-1 side of a call: counts, recursion seeds, argument flags,
    /// and propagation entries.
    fn note_call_pass1(
        &mut self,
        direct: Option<FuncId>,
        args: &[Expr],
        arg_vars: &[VarId],
        param_info: &[(String, u32, bool)],
        pos: u32,
    ) -> CompileResult<()> {
        let cur = self.cur_func();
        match direct {
            Some(g) => {
                self.module.funcs[g].times_called += 1;
                if g == cur {
                    self.module.funcs[cur].recursive = true;
                }
                self.module.funcs[cur].record_call(g, 1);
                // Ancestors observe the call too, with a zero count:
                // they reach the callee when they run, but only the
                // direct caller's count participates in pruning.
                let mut anc = self.module.funcs[cur].parent;
                while let Some(a) = anc {
                    if !self.module.is_root(a) {
                        self.module.funcs[a].record_call(g, 0);
                    }
                    anc = self.module.funcs[a].parent;
                }
                let prop = crate::func::Propagation::Function(g);
                let props = &mut self.module.funcs[cur].propagations;
                if !props.contains(&prop) {
                    props.push(prop);
                }
            }
            None => {
                // An indirect callee could be any address-taken holder;
                // the caller must hold its own frame, and anything the
                // root's list names may change.
                self.module.funcs[cur].could_not_get_holder = true;
                let root = self.module.root();
                let prop = crate::func::Propagation::Function(root);
                let props = &mut self.module.funcs[cur].propagations;
                if !props.contains(&prop) {
                    props.push(prop);
                }
            }
        }
        for (i, (arg, &var)) in args.iter().zip(arg_vars).enumerate() {
            let by_ref = param_info.get(i).map(|p| p.2).unwrap_or(false);
            self.module.funcs[cur].pushed_arg_flags.push(ArgFlag {
                id: arg.pos(),
                by_ref,
                output: false,
            });
            if by_ref {
                // Passing by reference publishes the address.
                self.eval_addr_of(var, pos)?;
                let (base, _) = self.resolve_view(var);
                if let Some(owner) = self.module.vars[base].owner {
                    if owner != cur && !self.module.is_root(owner) {
                        let (id, offset, size) = {
                            let b = &self.module.vars[base];
                            (b.id, b.offset, b.size)
                        };
                        let prop = crate::func::Propagation::Variable { owner, id, offset, size };
                        let props = &mut self.module.funcs[cur].propagations;
                        if !props.contains(&prop) {
                            props.push(prop);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether the pass-1 flag for the argument at source position `id`
    /// said by-ref. Pass 2 reads the flags pass 1 fixed.
    fn arg_flag_by_ref(&self, id: u32) -> bool {
        let cur_p1 = self.p1_func(self.cur_func());
        self.p1_module().funcs[cur_p1]
            .pushed_arg_flags
            .iter()
            .find(|fl| fl.id == id)
            .map(|fl| fl.by_ref)
            .unwrap_or(false)
    }

    /// Emit a complete call. `direct` is the pass-2 callee for direct
    /// calls; `fp` the function-pointer variable for indirect ones.
    fn emit_call_sequence(
        &mut self,
        direct: Option<FuncId>,
        fp: Option<VarId>,
        arg_vars: &[VarId],
        param_info: &[(String, u32, bool)],
        result: Option<VarId>,
    ) -> CompileResult<()> {
        let g = self.gpr() as i64;
        let cur = self.cur_func();
        let callee_is_tenant = direct.map(|f| self.is_tenant(f)).unwrap_or(false);

        self.flush_all_regs(true);

        if callee_is_tenant {
            let callee = direct.expect("tenant calls are always direct");
            self.emit_tenant_call(callee, arg_vars, param_info, result)?;
            return Ok(());
        }

        // ---- holder (or indirect) callee ----
        // Stack bottom: below our shared area (holders), or below the
        // holder's shared area (tenants).
        let rb = self.alloc_reg()?;
        if self.module.is_root(cur) || !self.is_tenant(cur) {
            self.emit_with_imm(Opcode::AddI, rb, 0, 0, &[ImmVal::NegSharedRegionSize(cur)])
        } else {
            let region = self.region_of(cur)?;
            let cur_p1 = self.p1_func(cur);
            let holder_p1 = self.p1_module().funcs[cur_p1].stackframe_holder.expect("tenant without a holder");
            let holder = self.p1_module().funcs[holder_p1]
                .secondpass
                .ok_or_else(|| self.internal("holder without a pass-2 twin"))?;
            self.emit_with_imm(
                Opcode::AddI,
                rb,
                0,
                0,
                &[
                    ImmVal::OffsetWithinSharedRegion(region),
                    ImmVal::NegSharedRegionSize(holder),
                ],
            )
        };
        self.lock_reg(rb);

        // How much the callee may use: its real frame for direct calls,
        // the indirect budget for pointer calls and imports (an import
        // jumps into another module whose frame size is unknowable).
        let callee_size_imms = |w: &Self| -> ImmList {
            let mut imms: ImmList = SmallVec::new();
            match direct {
                Some(c) if w.module.funcs[c].import_offset.is_none() => {
                    imms.push(ImmVal::Value(7 * g + w.arg_area_of_info(param_info, c) as i64));
                    imms.push(ImmVal::StackframePtrCacheSize(c));
                    imms.push(ImmVal::LocalVarsSize(c));
                }
                _ => imms.push(ImmVal::Value(MAX_STACK_USAGE as i64)),
            }
            imms
        };

        // Page check: does the callee frame fit what is left of the
        // current stack page?
        let rt = self.alloc_reg()?;
        self.lock_reg(rt);
        self.emit_with_imm(Opcode::AddI, rt, rb, 0, &[ImmVal::Value(-1)]);
        self.emit_with_imm(Opcode::AndI, rt, rt, 0, &[ImmVal::Value(PAGE_SIZE as i64 - 1)]);
        let mut need = callee_size_imms(self);
        need.push(ImmVal::Value(self.opts.stack_page_alloc_provision as i64 - 1));
        self.emit_with_imm(Opcode::SltUI, rt, rt, 0, &need);
        let jnz_slow = self.emit_branch_placeholder(Opcode::Jnz, rt, 0);
        self.unlock_reg(rt);
        // Fast path: frame fits, no page link.
        let rpl = rt;
        self.emit_with_imm(Opcode::Li, rpl, 0, 0, &[ImmVal::Value(0)]);
        self.lock_reg(rpl);
        let j_join = self.emit_branch_placeholder(Opcode::J, 0, 0);
        // Slow path: fresh stack page; the frame moves to its top.
        let slow = self.emit_block_boundary();
        self.patch_branch(jnz_slow, slow);
        self.emit_simple(Opcode::StackPageAlloc, rpl, 0, 0);
        self.emit_with_imm(Opcode::AddI, rb, rpl, 0, &[ImmVal::Value(PAGE_SIZE as i64)]);
        let join = self.emit_block_boundary();
        self.patch_branch(j_join, join);

        // rb is now the callee frame top. Fill the top-relative slots.
        self.emit_store(rpl, rb, &[ImmVal::Value(-5 * g)], self.gpr());
        self.unlock_reg(rpl);
        self.emit_store(0, rb, &[ImmVal::Value(-2 * g)], self.gpr());

        // Static link: the callee's lexical parent's frame.
        if let Some(c) = direct {
            match self.module.funcs[c].parent {
                Some(p) if p == cur => {
                    self.emit_store(0, rb, &[ImmVal::Value(-4 * g)], self.gpr());
                }
                Some(p) if !self.module.is_root(p) => {
                    let level = self
                        .module
                        .level_to(cur, p)
                        .ok_or_else(|| self.internal("callee parent not on chain"))?;
                    let rl = self.ancestor_frame_reg(level)?;
                    self.emit_store(rl, rb, &[ImmVal::Value(-4 * g)], self.gpr());
                }
                _ => {}
            }
        }

        // Return-variable pointer.
        if let Some(res) = result {
            let (breg, imms) = self.materialize_addr(res, 0)?;
            self.lock_reg_if_gpr(breg);
            let rtv = self.alloc_reg()?;
            if imms.is_empty() {
                self.emit_simple(Opcode::Cpy, rtv, breg, 0);
            } else {
                self.emit_with_imm(Opcode::AddI, rtv, breg, 0, &imms);
            }
            self.unlock_reg_if_gpr(breg);
            self.emit_store(rtv, rb, &[ImmVal::Value(-3 * g)], self.gpr());
        }

        // Arguments, at fixed offsets below the top slots.
        let arg_area = match direct {
            Some(c) => self.arg_area_of_info(param_info, c),
            None => self.arg_area_of_params(param_info),
        } as i64;
        self.emit_args(rb, arg_vars, param_info, |off| {
            vec![ImmVal::Value(off as i64 - 5 * g - arg_area)]
        })?;

        // Load the target before the stack pointer moves; the pointer
        // temp is addressed off the old frame.
        let rfp = match fp {
            Some(v) => {
                let r = self.reg_for_value(v)?;
                self.lock_reg(r);
                Some(r)
            }
            None => None,
        };

        self.emit_simple(Opcode::Cpy, 0, rb, 0);
        self.unlock_reg(rb);
        match (direct, rfp) {
            (Some(c), _) => {
                self.emit_with_imm(Opcode::JPush, 0, 0, 0, &[ImmVal::OffsetToFunction(c)]);
            }
            (None, Some(r)) => {
                self.unlock_reg(r);
                self.emit_simple(Opcode::JPushR, r, 0, 0);
            }
            _ => unreachable!(),
        }

        // Everything is clobbered past the call.
        for id in self.cur().regs.bound_ids() {
            self.cur_mut().regs.release(id);
        }

        // Free a fresh page if one was allocated, then restore our
        // stack pointer from the saved slot.
        let rl = self.alloc_reg()?;
        self.emit_load(rl, 0, &[ImmVal::Value(-5 * g)], self.gpr());
        self.emit_load(0, 0, &[ImmVal::Value(-2 * g)], self.gpr());
        let jz_skip = self.emit_branch_placeholder(Opcode::Jz, rl, 0);
        self.emit_simple(Opcode::StackPageFree, rl, 0, 0);
        let skip = self.emit_block_boundary();
        self.patch_branch(jz_skip, skip);
        self.cur_mut().regs.release(rl);
        Ok(())
    }

    /// A call into a tenant's tiny frame inside a shared region.
    fn emit_tenant_call(
        &mut self,
        callee: FuncId,
        arg_vars: &[VarId],
        param_info: &[(String, u32, bool)],
        result: Option<VarId>,
    ) -> CompileResult<()> {
        let g = self.gpr() as i64;
        let cur = self.cur_func();
        let region = self.region_of(callee)?;

        // The callee holder's frame base, then down to the tiny frame.
        let callee_p1 = self.p1_func(callee);
        let holder_p1 = self.p1_module().funcs[callee_p1].stackframe_holder.expect("tenant without a holder");
        let holder = self.p1_module().funcs[holder_p1]
            .secondpass
            .ok_or_else(|| self.internal("holder without a pass-2 twin"))?;
        let rb = if holder == cur {
            let r = self.alloc_reg()?;
            self.emit_simple(Opcode::Cpy, r, 0, 0);
            r
        } else {
            let level = self
                .module
                .level_to(cur, holder)
                .ok_or_else(|| self.internal("tenant callee's holder not on chain"))?;
            let r = self.ancestor_frame_reg(level)?;
            // The arithmetic below would destroy the cached frame
            // pointer; work on a private copy.
            self.lock_reg(r);
            let rc = self.alloc_reg()?;
            self.emit_simple(Opcode::Cpy, rc, r, 0);
            self.unlock_reg(r);
            rc
        };
        self.lock_reg(rb);
        let rt = self.alloc_reg()?;
        self.emit_with_imm(Opcode::Li, rt, 0, 0, &[ImmVal::OffsetWithinSharedRegion(region)]);
        self.emit_simple(Opcode::Sub, rb, rb, rt);
        self.cur_mut().regs.release(rt);

        // Caller stack pointer, return-variable pointer, arguments.
        self.emit_store(0, rb, &[ImmVal::Value(g)], self.gpr());
        if let Some(res) = result {
            let (breg, imms) = self.materialize_addr(res, 0)?;
            self.lock_reg_if_gpr(breg);
            let rtv = self.alloc_reg()?;
            if imms.is_empty() {
                self.emit_simple(Opcode::Cpy, rtv, breg, 0);
            } else {
                self.emit_with_imm(Opcode::AddI, rtv, breg, 0, &imms);
            }
            self.unlock_reg_if_gpr(breg);
            let mut slot: ImmList = SmallVec::new();
            slot.push(ImmVal::Value(2 * g + self.arg_area_of_info(param_info, callee) as i64));
            slot.push(ImmVal::LocalVarsSize(callee));
            self.emit_store(rtv, rb, &slot, self.gpr());
        }
        self.emit_args(rb, arg_vars, param_info, |off| {
            vec![
                ImmVal::Value(2 * g + off as i64),
                ImmVal::LocalVarsSize(callee),
            ]
        })?;

        self.emit_with_imm(Opcode::AddI, 0, rb, 0, &[ImmVal::Value(g)]);
        self.unlock_reg(rb);
        self.emit_with_imm(Opcode::JPush, 0, 0, 0, &[ImmVal::OffsetToFunction(callee)]);

        for id in self.cur().regs.bound_ids() {
            self.cur_mut().regs.release(id);
        }
        // The popped stack pointer addresses the saved-pointer slot.
        self.emit_load(0, 0, &[], self.gpr());
        Ok(())
    }

    /// Store each argument into its callee slot. `slot_imms` yields the
    /// immediate terms for a parameter offset, relative to the base
    /// register handed in.
    fn emit_args(
        &mut self,
        rb: u8,
        arg_vars: &[VarId],
        param_info: &[(String, u32, bool)],
        slot_imms: impl Fn(u32) -> Vec<ImmVal>,
    ) -> CompileResult<()> {
        let mut extra_off = param_info
            .last()
            .map(|(ty, off, _)| {
                off + typestr::sizeof(&self.module, ty, self.gpr()).unwrap_or(self.gpr())
            })
            .unwrap_or(0);
        for (i, &arg) in arg_vars.iter().enumerate() {
            let (ty, off, by_ref) = match param_info.get(i) {
                Some((ty, off, by_ref)) => (ty.clone(), *off, *by_ref),
                None => {
                    // Variadic tail: GPR-sized slots past the last
                    // declared parameter.
                    let off = extra_off;
                    extra_off += self.gpr();
                    ("uint".to_string(), off, false)
                }
            };
            let id = self.module.vars[arg].id;
            let by_ref = by_ref || self.arg_flag_by_ref(id);
            let imms = slot_imms(off);
            if by_ref {
                // The callee can write through this address; stop
                // caching the object.
                let (base, _) = self.resolve_view(arg);
                if let Some(master) = self.module.vars[base].volatile_master {
                    self.module.vars[master].is_always_volatile = true;
                }
                let (breg, aimms) = self.materialize_addr(arg, 0)?;
                self.lock_reg_if_gpr(breg);
                let ra = self.alloc_reg()?;
                if aimms.is_empty() {
                    self.emit_simple(Opcode::Cpy, ra, breg, 0);
                } else {
                    self.emit_with_imm(Opcode::AddI, ra, breg, 0, &aimms);
                }
                self.unlock_reg_if_gpr(breg);
                self.emit_store(ra, rb, &imms, self.gpr());
                self.cur_mut().regs.release(ra);
                continue;
            }
            let scalar = typestr::access_size(&self.module, &ty, self.gpr());
            match scalar {
                Some(size) => {
                    let rv = self.reg_for_value(arg)?;
                    self.lock_reg(rv);
                    self.emit_store(rv, rb, &imms, size);
                    self.unlock_reg(rv);
                }
                None => {
                    // Aggregate argument: copy it into the slot.
                    let size = typestr::sizeof(&self.module, &ty, self.gpr())
                        .ok_or_else(|| self.internal("aggregate argument of unknown size"))?;
                    let (sreg, simms) = self.materialize_addr(arg, 0)?;
                    self.lock_reg_if_gpr(sreg);
                    let rs = self.alloc_reg()?;
                    if simms.is_empty() {
                        self.emit_simple(Opcode::Cpy, rs, sreg, 0);
                    } else {
                        self.emit_with_imm(Opcode::AddI, rs, sreg, 0, &simms);
                    }
                    self.unlock_reg_if_gpr(sreg);
                    self.lock_reg(rs);
                    let rd = self.alloc_result_reg(Opcode::Mem8CpyI)?;
                    self.emit_with_imm(Opcode::AddI, rd, rb, 0, &imms);
                    self.emit_with_imm(Opcode::Mem8CpyI, rd, rs, 0, &[ImmVal::Value(size as i64)]);
                    self.unlock_reg(rs);
                    self.cur_mut().regs.release(rs);
                    self.cur_mut().regs.release(rd);
                }
            }
        }
        Ok(())
    }

    /// The argument area of a direct callee, honoring variadics.
    fn arg_area_of_info(&self, param_info: &[(String, u32, bool)], callee: FuncId) -> u32 {
        if self.module.funcs[callee].variadic {
            MAX_ARG_USAGE
        } else {
            self.arg_area_of_params(param_info)
        }
    }

    fn arg_area_of_params(&self, param_info: &[(String, u32, bool)]) -> u32 {
        param_info
            .last()
            .map(|(ty, off, _)| {
                off + typestr::sizeof(&self.module, ty, self.gpr()).unwrap_or(self.gpr())
            })
            .unwrap_or(0)
    }
}

/// Parse a function-pointer type string `ret(p1,p2,...)` into its
/// return type, parameter types, and variadic flag. Nested parentheses
/// (function-pointer parameters) are respected.
fn parse_fn_ptr_ty(ty: &str) -> Option<(String, Vec<String>, bool)> {
    let open = ty.find('(')?;
    if !ty.ends_with(')') {
        return None;
    }
    let ret = ty[..open].to_string();
    let inner = &ty[open + 1..ty.len() - 1];
    let mut params = Vec::new();
    let mut depth = 0;
    let mut start = 0;
    for (i, c) in inner.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth -= 1,
            ',' if depth == 0 => {
                params.push(inner[start..i].to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < inner.len() {
        params.push(inner[start..].to_string());
    }
    let variadic = params.last().map(|p| p == "...").unwrap_or(false);
    if variadic {
        params.pop();
    }
    Some((ret, params, variadic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fn_ptr_ty_parsing() {
        let (ret, params, variadic) = parse_fn_ptr_ty("uint(u8*,uint)").unwrap();
        assert_eq!(ret, "uint");
        assert_eq!(params, vec!["u8*", "uint"]);
        assert!(!variadic);

        let (ret, params, variadic) = parse_fn_ptr_ty("void(u8*,...)").unwrap();
        assert_eq!(ret, "void");
        assert_eq!(params, vec!["u8*"]);
        assert!(variadic);

        let (_, params, _) = parse_fn_ptr_ty("void(uint(uint),u8)").unwrap();
        assert_eq!(params, vec!["uint(uint)", "u8"]);
    }
}
