//! The two-pass semantic analyzer.
//!
//! Both passes walk the same AST with the same control flow. Pass 1
//! (`run_pass1`) emits nothing: it builds the function tree, classifies
//! call arguments, counts calls, records accesses to enclosing frames,
//! and accumulates propagation lists — everything the planner needs.
//! Pass 2 (`run_pass2`) repeats the walk with planning data linked in and
//! emits LIR through a per-function LRU register file.
//!
//! The walker keeps one `FuncCtx` per function on a stack; nested
//! function definitions are walked at their declaration site, so symbol
//! visibility inside a nested function is exactly what the enclosing
//! walk has registered so far.

mod emit;
mod expr;
pub mod regalloc;

use crate::error::{CompileError, CompileResult};
use crate::frontend::ast::{Block, FnDecl, Program, Stmt};
use crate::func::{FuncData, Module};
use crate::lir::{FuncId, InstId, VarId};
use crate::settings::{CompileFlags, CompileOptions};
use crate::sourceloc::SourceLoc;
use crate::typestr;
use crate::vars::{VarData, VarKind};
use regalloc::RegFile;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use std::sync::Arc;

/// Interned string constants and their region offsets.
#[derive(Default)]
pub struct StringPool {
    /// Region bytes, each constant null-terminated.
    pub bytes: Vec<u8>,
    /// Offsets of already-pooled constants.
    dedup: FxHashMap<Vec<u8>, u32>,
}

impl StringPool {
    /// Intern `s`, returning its region offset. The terminating NUL is
    /// part of the pooled constant.
    pub fn intern(&mut self, s: &[u8]) -> u32 {
        if let Some(&off) = self.dedup.get(s) {
            return off;
        }
        let off = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s);
        self.bytes.push(0);
        self.dedup.insert(s.to_vec(), off);
        off
    }

    /// Reserve `len` zeroed bytes (import address slots), returning the
    /// offset.
    pub fn reserve(&mut self, len: u32) -> u32 {
        let off = self.bytes.len() as u32;
        self.bytes.extend(std::iter::repeat(0).take(len as usize));
        off
    }
}

/// A symbol visible in some scope of a function.
struct Sym {
    name: String,
    kind: SymKind,
}

enum SymKind {
    Var(VarId),
    Func(FuncId),
}

/// A defined label: pass 2 resolves pending gotos against these.
struct LabelDef {
    name: String,
    inst: InstId,
    pos: u32,
    scope: Vec<u32>,
}

/// A goto whose target label may not be defined yet.
struct PendingGoto {
    name: String,
    inst: InstId,
    pos: u32,
    scope: Vec<u32>,
    line: u32,
}

/// Per-function walking state.
struct FuncCtx {
    func: FuncId,
    syms: Vec<Sym>,
    scope_marks: Vec<usize>,
    scope_chain: Vec<u32>,
    scope_counter: u32,
    regs: RegFile,
    labels: Vec<LabelDef>,
    gotos: Vec<PendingGoto>,
    /// Temps created by the statement currently being walked, freed in
    /// LIFO order at its end.
    stmt_temps: Vec<VarId>,
    /// Current statement's source location, stamped on instructions.
    loc: SourceLoc,
}

impl FuncCtx {
    fn new(func: FuncId, nbr_of_gpr: u32) -> Self {
        Self {
            func,
            syms: Vec::new(),
            scope_marks: Vec::new(),
            scope_chain: Vec::new(),
            scope_counter: 0,
            regs: RegFile::new(nbr_of_gpr),
            labels: Vec::new(),
            gotos: Vec::new(),
            stmt_temps: Vec::new(),
            loc: SourceLoc::unknown(),
        }
    }
}

/// The AST walker, shared by both passes.
pub(crate) struct Walker<'a> {
    /// Emitting pass (pass 2)?
    emit: bool,
    opts: &'a CompileOptions,
    /// Module being built by this pass.
    pub module: Module,
    /// Pass-1 module, with planning data. Pass 2 only.
    p1: Option<&'a mut Module>,
    /// ast_ids that must be stackframe holders this round. Pass 1 only.
    forced: &'a FxHashSet<u32>,
    /// FuncId by ast_id, this pass.
    fn_of_ast: Vec<Option<FuncId>>,
    /// FuncId by ast_id, pass 1. Identity map during pass 1.
    p1_fn_of_ast: Vec<Option<FuncId>>,
    /// Active function contexts, innermost last.
    stack: Vec<FuncCtx>,
    /// String constants.
    pub strings: StringPool,
    /// Source path of the program, for debug locations.
    src_path: Arc<str>,
    /// Byte offsets of line starts, for mapping positions to lines.
    lines: Arc<[u32]>,
}

/// Byte offsets at which each line of `source` starts.
fn line_starts(source: &str) -> Arc<[u32]> {
    let mut starts = vec![0u32];
    for (i, b) in source.bytes().enumerate() {
        if b == b'\n' {
            starts.push(i as u32 + 1);
        }
    }
    starts.into()
}

/// Run pass 1 over the program. `forced` carries the ast_ids of
/// functions a previous round proved unable to share a frame.
pub fn run_pass1(
    program: &Program,
    opts: &CompileOptions,
    forced: &FxHashSet<u32>,
    src_path: &str,
    source: &str,
) -> CompileResult<Module> {
    let mut w = Walker {
        emit: false,
        opts,
        module: Module::new(),
        p1: None,
        forced,
        fn_of_ast: vec![None; program.fn_count as usize],
        p1_fn_of_ast: vec![None; program.fn_count as usize],
        stack: Vec::new(),
        strings: StringPool::default(),
        src_path: Arc::from(src_path),
        lines: line_starts(source),
    };
    w.walk_program(program)?;
    Ok(w.module)
}

/// Run pass 2, emitting LIR. `p1` must already be planned.
pub fn run_pass2(
    program: &Program,
    opts: &CompileOptions,
    p1: &mut Module,
    src_path: &str,
    source: &str,
) -> CompileResult<(Module, StringPool)> {
    let mut p1_fn_of_ast = vec![None; program.fn_count as usize];
    for (id, f) in p1.funcs.iter() {
        if !p1.is_root(id) {
            p1_fn_of_ast[f.ast_id as usize] = Some(id);
        }
    }
    let empty = FxHashSet::default();
    let mut w = Walker {
        emit: true,
        opts,
        module: Module::new(),
        p1: Some(p1),
        forced: &empty,
        fn_of_ast: vec![None; program.fn_count as usize],
        p1_fn_of_ast,
        stack: Vec::new(),
        strings: StringPool::default(),
        src_path: Arc::from(src_path),
        lines: line_starts(source),
    };
    w.module.funcs[FuncId(0)].firstpass = Some(FuncId(0));
    w.walk_program(program)?;
    let strings = std::mem::take(&mut w.strings);
    Ok((w.module, strings))
}

impl<'a> Walker<'a> {
    // ---- context plumbing ----------------------------------------------

    fn cur(&self) -> &FuncCtx {
        self.stack.last().expect("walker has no active function")
    }

    fn cur_mut(&mut self) -> &mut FuncCtx {
        self.stack.last_mut().expect("walker has no active function")
    }

    fn cur_func(&self) -> FuncId {
        self.cur().func
    }

    /// The pass-1 module: `self.module` during pass 1, the linked module
    /// during pass 2.
    fn p1_module(&self) -> &Module {
        match &self.p1 {
            Some(m) => m,
            None => &self.module,
        }
    }

    /// Pass-1 counterpart of a pass-2 function (identity in pass 1).
    fn p1_func(&self, f: FuncId) -> FuncId {
        if self.emit {
            self.module.funcs[f]
                .firstpass
                .expect("pass-2 function with no pass-1 twin")
        } else {
            f
        }
    }

    fn err_at(&self, line: u32, msg: impl Into<String>) -> CompileError {
        let msg = format!("{}:{}: {}", self.src_path, line, msg.into());
        (self.opts.error)(&msg);
        CompileError::Semantic(msg)
    }

    fn gpr(&self) -> u32 {
        self.opts.sizeof_gpr
    }

    // ---- scopes and symbols --------------------------------------------

    fn enter_scope(&mut self) {
        let ctx = self.cur_mut();
        ctx.scope_marks.push(ctx.syms.len());
        ctx.scope_counter += 1;
        let n = ctx.scope_counter;
        ctx.scope_chain.push(n);
    }

    fn leave_scope(&mut self) {
        let ctx = self.cur_mut();
        let mark = ctx.scope_marks.pop().expect("unbalanced scope");
        ctx.syms.truncate(mark);
        ctx.scope_chain.pop();
    }

    fn define_var_sym(&mut self, name: &str, var: VarId) {
        self.cur_mut().syms.push(Sym {
            name: name.to_string(),
            kind: SymKind::Var(var),
        });
    }

    fn define_fn_sym(&mut self, name: &str, func: FuncId) {
        self.cur_mut().syms.push(Sym {
            name: name.to_string(),
            kind: SymKind::Func(func),
        });
    }

    /// Find a variable by name, innermost function first. Returns the
    /// variable and the nesting distance of the owning function from the
    /// current one.
    fn lookup_var(&self, name: &str) -> Option<(VarId, u32)> {
        for (depth, ctx) in self.stack.iter().rev().enumerate() {
            for sym in ctx.syms.iter().rev() {
                if sym.name == name {
                    if let SymKind::Var(v) = sym.kind {
                        return Some((v, depth as u32));
                    }
                }
            }
        }
        None
    }

    /// Find a callable function by name and argument count.
    fn lookup_fn(&self, name: &str, argc: usize) -> Option<FuncId> {
        for ctx in self.stack.iter().rev() {
            for sym in ctx.syms.iter().rev() {
                if sym.name == name {
                    if let SymKind::Func(f) = sym.kind {
                        let fd = &self.module.funcs[f];
                        if fd.args.len() == argc || (fd.variadic && argc >= fd.args.len()) {
                            return Some(f);
                        }
                    }
                }
            }
        }
        None
    }

    /// Find a function by bare name, for address-of.
    fn lookup_fn_by_name(&self, name: &str) -> Option<FuncId> {
        for ctx in self.stack.iter().rev() {
            for sym in ctx.syms.iter().rev() {
                if sym.name == name {
                    if let SymKind::Func(f) = sym.kind {
                        return Some(f);
                    }
                }
            }
        }
        None
    }

    // ---- program walk --------------------------------------------------

    fn walk_program(&mut self, program: &Program) -> CompileResult<()> {
        let root = self.module.root();
        self.stack.push(FuncCtx::new(root, self.opts.nbr_of_gpr));
        self.declare_predeclared_vars()?;
        self.walk_block_stmts(&program.root, true)?;
        if self.emit {
            // The root function returns to whatever invoked the image.
            self.flush_all_regs(true);
            self.emit_simple(crate::lir::Opcode::JPop, 0, 0, 0);
            self.resolve_fn_labels()?;
        }
        self.free_stmt_temps();
        self.stack.pop();
        Ok(())
    }

    fn declare_predeclared_vars(&mut self) -> CompileResult<()> {
        let root = self.module.root();
        let opts = self.opts;
        for pv in &opts.predeclared_vars {
            let mut v = VarData::new(Some(root), pv.name.clone());
            v.ty = Some(pv.ty.clone());
            v.is_byref = pv.is_byref;
            v.host_addr = Some(pv.addr);
            // Host memory can change behind the compiler's back.
            v.is_always_volatile = true;
            let id = self.module.vars.push(v);
            self.module.vars[id].volatile_master = Some(id);
            self.define_var_sym(&pv.name, id);
        }
        Ok(())
    }

    /// Walk the statements of a block. `function_body` suppresses the
    /// extra scope push, since parameters already live in the function
    /// scope.
    fn walk_block_stmts(&mut self, block: &Block, function_body: bool) -> CompileResult<()> {
        if !function_body {
            self.enter_scope();
        }
        // Hoist sibling functions so mutual recursion works without
        // forward declarations.
        for stmt in &block.stmts {
            if let Stmt::Fn(decl) = stmt {
                self.declare_fn(decl)?;
            }
        }
        for stmt in &block.stmts {
            self.walk_stmt(stmt)?;
            self.free_stmt_temps();
        }
        if !function_body {
            self.leave_scope();
        }
        Ok(())
    }

    fn walk_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Var { name, ty, is_static, init, pos } => {
                self.walk_var_decl(name, ty, *is_static, init.as_ref(), *pos)
            }
            Stmt::Struct { name, members, pos } => self.walk_struct_decl(name, members, *pos),
            Stmt::Fn(decl) => self.walk_fn_body(decl),
            Stmt::Expr(e) => {
                self.set_loc(e.pos());
                self.eval_expr(e)?;
                Ok(())
            }
            Stmt::If { cond, then_blk, else_blk, pos } => {
                self.walk_if(cond, then_blk, else_blk.as_ref(), *pos)
            }
            Stmt::While { cond, body, pos } => self.walk_while(cond, body, *pos),
            Stmt::Return { value, pos } => self.walk_return(value.as_ref(), *pos),
            Stmt::Label { name, pos } => self.walk_label(name, *pos),
            Stmt::Goto { name, pos } => self.walk_goto(name, *pos),
            Stmt::Asm { bytes, pos } => self.walk_asm(bytes, *pos),
            Stmt::Block(b) => self.walk_block_stmts(b, false),
        }
    }

    fn walk_var_decl(
        &mut self,
        name: &str,
        ty: &str,
        is_static: bool,
        init: Option<&crate::frontend::ast::Expr>,
        pos: u32,
    ) -> CompileResult<()> {
        self.set_loc(pos);
        let line = self.cur().loc.line;
        let Some(size) = typestr::sizeof(&self.module, ty, self.gpr()) else {
            return Err(self.err_at(line, format!("unknown or incomplete type `{ty}`")));
        };
        if size == 0 {
            return Err(self.err_at(line, format!("variable `{name}` has no size")));
        }
        let cur = self.cur_func();
        let root = self.module.root();
        // Statics live in the global region regardless of where they are
        // declared; their name gets a per-function prefix so lookups
        // from other functions cannot collide.
        let owner = if is_static { root } else { cur };
        let stored_name = if is_static && cur != root {
            format!("#{}_{}", self.module.funcs[cur].ast_id, name)
        } else {
            name.to_string()
        };
        let offset = self.alloc_frame_slot(owner, size);
        let mut v = VarData::new(Some(owner), stored_name);
        v.id = pos;
        v.ty = Some(ty.to_string());
        v.size = size;
        v.offset = offset;
        v.kind = VarKind::Local;
        v.is_static = is_static;
        v.scope_depth = self.cur().scope_chain.len() as u32;
        v.scope = self.cur().scope_chain.clone();
        v.is_always_volatile = self.opts.flags.contains(CompileFlags::ALL_VAR_VOLATILE);
        let id = self.module.vars.push(v);
        self.module.vars[id].volatile_master = Some(id);
        self.module.funcs[owner].locals.push(id);
        self.define_var_sym(name, id);
        if let Some(init) = init {
            let value = self.eval_expr(init)?;
            self.assign_var(id, 0, ty, value, pos)?;
        }
        Ok(())
    }

    fn walk_struct_decl(
        &mut self,
        name: &str,
        members: &[crate::frontend::ast::MemberDecl],
        pos: u32,
    ) -> CompileResult<()> {
        self.set_loc(pos);
        let line = self.cur().loc.line;
        let mut size = 0u32;
        let mut member_ids = Vec::new();
        for m in members {
            let Some(msize) = typestr::sizeof(&self.module, &m.ty, self.gpr()) else {
                return Err(self.err_at(line, format!("unknown member type `{}`", m.ty)));
            };
            // Natural alignment, capped at the GPR size.
            let align = msize.min(self.gpr()).max(1).next_power_of_two();
            size = (size + align - 1) & !(align - 1);
            let mut v = VarData::new(None, m.name.clone());
            v.id = m.pos;
            v.ty = Some(m.ty.clone());
            v.size = msize;
            v.offset = size;
            v.kind = VarKind::Member;
            member_ids.push(self.module.vars.push(v));
            size += msize;
        }
        let gpr = self.gpr();
        size = (size + gpr - 1) & !(gpr - 1);
        let cur = self.cur_func();
        let t = self.module.types.push(crate::vars::TypeData {
            name: name.to_string(),
            size,
            members: member_ids,
            base: None,
            scope_depth: self.cur().scope_chain.len() as u32,
            scope: self.cur().scope_chain.clone(),
        });
        self.module.funcs[cur].types.push(t);
        Ok(())
    }

    // ---- function declaration and bodies -------------------------------

    /// Create (or merge) the function entity for `decl` and register its
    /// symbol. Bodies are walked later, at the declaration site.
    fn declare_fn(&mut self, decl: &FnDecl) -> CompileResult<()> {
        if self.fn_of_ast[decl.ast_id as usize].is_some() {
            return Ok(());
        }
        let parent = self.cur_func();
        let at_root = self.module.is_root(parent);

        // A definition can bind to an earlier body-less declaration with
        // the same signature in the same block.
        let param_tys: Vec<&str> = decl.params.iter().map(|p| p.ty.as_str()).collect();
        let mark = *self.cur().scope_marks.last().unwrap_or(&0);
        let existing = self.cur().syms[mark..]
            .iter()
            .filter(|sym| sym.name == decl.name)
            .find_map(|sym| match sym.kind {
                SymKind::Func(f) => {
                    let fd = &self.module.funcs[f];
                    let same_sig = fd.args.len() == param_tys.len()
                        && fd
                            .args
                            .iter()
                            .zip(&param_tys)
                            .all(|(&a, &t)| self.module.vars[a].ty.as_deref() == Some(t));
                    same_sig.then_some(f)
                }
                _ => None,
            });
        if let Some(f) = existing {
            if decl.body.is_some() {
                if self.module.funcs[f].has_body {
                    return Err(self.err_at(
                        decl.line,
                        format!("function `{}` is defined twice", decl.name),
                    ));
                }
                let fd = &mut self.module.funcs[f];
                fd.has_body = true;
                fd.import_offset = None;
                fd.address_taken = fd.exported;
                fd.ast_id = decl.ast_id;
            }
            self.fn_of_ast[decl.ast_id as usize] = Some(f);
            return Ok(());
        }

        if decl.exported && self.opts.flags.contains(CompileFlags::NO_FUNCTION_EXPORT) {
            return Err(self.err_at(decl.line, "function exporting is disabled"));
        }
        if decl.exported && !at_root {
            return Err(self.err_at(decl.line, "only root-level functions can be exported"));
        }

        let mut fd = FuncData::new(Some(parent), decl.name.clone(), decl.ast_id);
        fd.ret_ty = decl.ret_ty.clone();
        fd.variadic = decl.variadic;
        fd.exported = decl.exported;
        fd.has_body = decl.body.is_some();
        fd.start_loc = SourceLoc {
            path: Some(self.src_path.clone()),
            line: decl.line,
            line_offset: decl.line_offset,
        };
        // name|arg1_ty|arg2_ty|…|
        let mut sig = format!("{}|", decl.name);
        for p in &decl.params {
            sig.push_str(&p.ty);
            sig.push('|');
        }
        fd.call_signature = sig;
        let mut link = format!("{}(", decl.name);
        for (i, p) in decl.params.iter().enumerate() {
            if i > 0 {
                link.push(',');
            }
            link.push_str(&p.ty);
        }
        link.push(')');
        fd.linking_signature = link;

        if decl.body.is_none() {
            if !at_root {
                return Err(self.err_at(
                    decl.line,
                    format!("nested function `{}` must be defined", decl.name),
                ));
            }
            if self.opts.flags.contains(CompileFlags::NO_FUNCTION_IMPORT) {
                return Err(self.err_at(
                    decl.line,
                    format!("function `{}` is declared but never defined", decl.name),
                ));
            }
            // Imports are called through a pointer the loader writes
            // into the string region; reserve its slot now.
            let slot = self.strings.reserve(self.gpr());
            fd.import_offset = Some(slot);
            fd.address_taken = true;
        }
        if decl.exported {
            fd.address_taken = true;
        }
        if !self.emit && self.forced.contains(&decl.ast_id) {
            fd.could_not_get_holder = true;
        }
        if !self.emit && self.opts.flags.contains(CompileFlags::NO_STACKFRAME_SHARING) {
            fd.could_not_get_holder = true;
        }

        let f = self.module.funcs.push(fd);
        self.module.funcs[parent].children.push(f);
        self.fn_of_ast[decl.ast_id as usize] = Some(f);

        // Cross-pass linking.
        if self.emit {
            let p1f = self.p1_fn_of_ast[decl.ast_id as usize];
            self.module.funcs[f].firstpass = p1f;
            if let (Some(p1f), Some(p1)) = (p1f, self.p1.as_deref_mut()) {
                p1.funcs[p1f].secondpass = Some(f);
            }
        }

        // Parameters: created with the function so calls type-check
        // before the body is walked. Offsets accumulate within the
        // argument area.
        let mut arg_off = 0u32;
        for p in &decl.params {
            let line = decl.line;
            let Some(size) = typestr::sizeof(&self.module, &p.ty, self.gpr()) else {
                return Err(self.err_at(line, format!("unknown parameter type `{}`", p.ty)));
            };
            let mut v = VarData::new(Some(f), p.name.clone());
            v.id = p.pos;
            v.ty = Some(p.ty.clone());
            v.size = size;
            v.offset = arg_off;
            v.kind = VarKind::Arg;
            v.is_byref = p.by_ref;
            v.is_always_volatile = self.opts.flags.contains(CompileFlags::ALL_VAR_VOLATILE);
            arg_off += size;
            let id = self.module.vars.push(v);
            self.module.vars[id].volatile_master = Some(id);
            self.module.funcs[f].args.push(id);
        }

        self.define_fn_sym(&decl.name, f);
        Ok(())
    }

    fn walk_fn_body(&mut self, decl: &FnDecl) -> CompileResult<()> {
        let Some(f) = self.fn_of_ast[decl.ast_id as usize] else {
            return Ok(());
        };
        // Declarations whose definition comes later bind elsewhere.
        if self.module.funcs[f].ast_id != decl.ast_id {
            return Ok(());
        }
        let Some(body) = &decl.body else {
            // Imports get a thunk body in pass 2.
            if self.emit && !self.p1_pruned(f) {
                self.emit_import_thunk(f)?;
            }
            return Ok(());
        };
        if self.emit && self.p1_pruned(f) {
            return Ok(());
        }

        self.stack.push(FuncCtx::new(f, self.opts.nbr_of_gpr));
        for (i, p) in decl.params.iter().enumerate() {
            if !p.name.is_empty() {
                let arg = self.module.funcs[f].args[i];
                self.define_var_sym(&p.name, arg);
            }
        }
        if self.emit {
            self.emit_prologue(f)?;
        }
        self.walk_block_stmts(body, true)?;
        if self.emit {
            self.emit_epilogue(f, None)?;
            self.resolve_fn_labels()?;
        }
        self.free_stmt_temps();
        self.stack.pop();
        Ok(())
    }

    fn p1_pruned(&self, f: FuncId) -> bool {
        let p1f = self.module.funcs[f].firstpass;
        match (p1f, &self.p1) {
            (Some(p1f), Some(p1)) => p1.funcs[p1f].pruned,
            _ => false,
        }
    }

    // ---- control flow statements ---------------------------------------

    fn walk_if(
        &mut self,
        cond: &crate::frontend::ast::Expr,
        then_blk: &Block,
        else_blk: Option<&Block>,
        pos: u32,
    ) -> CompileResult<()> {
        self.set_loc(pos);
        let cond_var = self.eval_expr(cond)?;
        if !self.emit {
            self.free_stmt_temps();
            self.walk_block_stmts(then_blk, false)?;
            if let Some(e) = else_blk {
                self.walk_block_stmts(e, false)?;
            }
            return Ok(());
        }
        let rc = self.reg_for_value(cond_var)?;
        // The flush below may materialize addresses; the lock keeps the
        // condition value out of scratch allocation.
        self.lock_reg(rc);
        self.flush_all_regs(true);
        self.unlock_reg(rc);
        let jz = self.emit_branch_placeholder(crate::lir::Opcode::Jz, rc, 0);
        self.free_stmt_temps();
        self.walk_block_stmts(then_blk, false)?;
        self.flush_all_regs(true);
        match else_blk {
            None => {
                let target = self.emit_block_boundary();
                self.patch_branch(jz, target);
            }
            Some(e) => {
                let j_end = self.emit_branch_placeholder(crate::lir::Opcode::J, 0, 0);
                let else_target = self.emit_block_boundary();
                self.patch_branch(jz, else_target);
                self.walk_block_stmts(e, false)?;
                self.flush_all_regs(true);
                let end = self.emit_block_boundary();
                self.patch_branch(j_end, end);
            }
        }
        Ok(())
    }

    fn walk_while(
        &mut self,
        cond: &crate::frontend::ast::Expr,
        body: &Block,
        pos: u32,
    ) -> CompileResult<()> {
        self.set_loc(pos);
        if !self.emit {
            self.eval_expr(cond)?;
            self.free_stmt_temps();
            return self.walk_block_stmts(body, false);
        }
        self.flush_all_regs(true);
        let head = self.emit_block_boundary();
        let cond_var = self.eval_expr(cond)?;
        let rc = self.reg_for_value(cond_var)?;
        self.lock_reg(rc);
        self.flush_all_regs(true);
        self.unlock_reg(rc);
        let jz_exit = self.emit_branch_placeholder(crate::lir::Opcode::Jz, rc, 0);
        self.free_stmt_temps();
        self.walk_block_stmts(body, false)?;
        self.flush_all_regs(true);
        let back = self.emit_branch_placeholder(crate::lir::Opcode::J, 0, 0);
        self.patch_branch(back, head);
        let exit = self.emit_block_boundary();
        self.patch_branch(jz_exit, exit);
        Ok(())
    }

    fn walk_return(
        &mut self,
        value: Option<&crate::frontend::ast::Expr>,
        pos: u32,
    ) -> CompileResult<()> {
        self.set_loc(pos);
        let line = self.cur().loc.line;
        let f = self.cur_func();
        let returns = self.module.funcs[f].returns_value();
        let value_var = match value {
            Some(e) => {
                if !returns {
                    return Err(self.err_at(line, "void function cannot return a value"));
                }
                Some(self.eval_expr(e)?)
            }
            None => {
                if returns {
                    return Err(self.err_at(line, "function must return a value"));
                }
                None
            }
        };
        if self.emit {
            self.emit_epilogue(f, value_var)?;
        }
        Ok(())
    }

    fn walk_label(&mut self, name: &str, pos: u32) -> CompileResult<()> {
        self.set_loc(pos);
        if !self.emit {
            return Ok(());
        }
        self.flush_all_regs(true);
        let inst = self.emit_block_boundary();
        let scope = self.cur().scope_chain.clone();
        self.cur_mut().labels.push(LabelDef {
            name: name.to_string(),
            inst,
            pos,
            scope,
        });
        Ok(())
    }

    fn walk_goto(&mut self, name: &str, pos: u32) -> CompileResult<()> {
        self.set_loc(pos);
        if !self.emit {
            return Ok(());
        }
        self.flush_all_regs(true);
        let inst = self.emit_branch_placeholder(crate::lir::Opcode::J, 0, 0);
        let scope = self.cur().scope_chain.clone();
        let line = self.cur().loc.line;
        self.cur_mut().gotos.push(PendingGoto {
            name: name.to_string(),
            inst,
            pos,
            scope,
            line,
        });
        Ok(())
    }

    fn walk_asm(&mut self, bytes: &[u8], pos: u32) -> CompileResult<()> {
        self.set_loc(pos);
        if !self.emit {
            return Ok(());
        }
        // Raw machine code can read or write anything.
        self.flush_all_regs(true);
        let mut inst = crate::lir::Inst::new(crate::lir::Opcode::MachineCode);
        inst.bytes = Some(bytes.to_vec().into_boxed_slice());
        self.push_inst(inst);
        Ok(())
    }

    /// Resolve every pending goto of the finished function against its
    /// labels: same name, label scope enclosing the goto, nearest by
    /// textual distance.
    fn resolve_fn_labels(&mut self) -> CompileResult<()> {
        let mut patches: Vec<(InstId, InstId)> = Vec::new();
        let mut missing: Option<(u32, String)> = None;
        {
            let ctx = self.stack.last().expect("no function");
            for g in &ctx.gotos {
                let mut best: Option<(u32, InstId)> = None;
                for l in &ctx.labels {
                    if l.name != g.name {
                        continue;
                    }
                    if !g.scope.starts_with(&l.scope) {
                        continue;
                    }
                    let dist = l.pos.abs_diff(g.pos);
                    if best.map(|(d, _)| dist < d).unwrap_or(true) {
                        best = Some((dist, l.inst));
                    }
                }
                match best {
                    Some((_, target)) => patches.push((g.inst, target)),
                    None => {
                        missing = Some((g.line, g.name.clone()));
                        break;
                    }
                }
            }
        }
        if let Some((line, name)) = missing {
            return Err(self.err_at(line, format!("label `{name}` is not defined")));
        }
        for (inst, target) in patches {
            self.patch_branch(inst, target);
        }
        let ctx = self.stack.last_mut().expect("no function");
        ctx.labels.clear();
        ctx.gotos.clear();
        Ok(())
    }

    // ---- frame slot allocation -----------------------------------------

    /// Allocate `size` bytes in `owner`'s local area (the global region
    /// for the root function), bumping the high-water mark.
    fn alloc_frame_slot(&mut self, owner: FuncId, size: u32) -> u32 {
        let fd = &mut self.module.funcs[owner];
        let align = size.min(8).max(1).next_power_of_two();
        let offset = (fd.local_vars_cur_size + align - 1) & !(align - 1);
        fd.local_vars_cur_size = offset + size;
        if fd.local_vars_cur_size > fd.local_vars_max_size {
            fd.local_vars_max_size = fd.local_vars_cur_size;
        }
        offset
    }

    /// Release the temps created by the current statement, in LIFO
    /// order, rolling the frame watermark back where possible.
    fn free_stmt_temps(&mut self) {
        let ctx = self.stack.last_mut().expect("no function");
        let temps = std::mem::take(&mut ctx.stmt_temps);
        for &t in temps.iter().rev() {
            if self.emit {
                if let Some(r) = self
                    .cur()
                    .regs
                    .find(&regalloc::Binding::Var { var: t, offset: 0 })
                {
                    self.cur_mut().regs.release(r);
                }
            }
            let (offset, size, owner) = {
                let v = &self.module.vars[t];
                (v.offset, v.size, v.owner)
            };
            if let Some(owner) = owner {
                let fd = &mut self.module.funcs[owner];
                if size != 0 && offset + size == fd.local_vars_cur_size {
                    fd.local_vars_cur_size = offset;
                }
            }
        }
    }

    /// Point the current debug location at the source byte `pos`.
    fn set_loc(&mut self, pos: u32) {
        let line = self.lines.partition_point(|&s| s <= pos) as u32;
        let line_offset = self.lines[line as usize - 1];
        let path = if self.opts.flags.contains(CompileFlags::GENERATE_DEBUG_INFO) {
            Some(self.src_path.clone())
        } else {
            None
        };
        self.cur_mut().loc = SourceLoc {
            path,
            line,
            line_offset,
        };
    }

    /// The source line containing `pos`, for diagnostics.
    fn line_of(&self, pos: u32) -> u32 {
        self.lines.partition_point(|&s| s <= pos) as u32
    }
}
