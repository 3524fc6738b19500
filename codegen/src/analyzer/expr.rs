//! Expression evaluation.
//!
//! Every expression evaluates to a variable: a storage variable, a view
//! of one, a dereference, an address, a number, a string constant, a
//! function address, or a temp holding an operation result. Pass 1 stops
//! there; pass 2 additionally moves values through the register file and
//! emits the LIR for each operation.

use super::Walker;
use crate::error::CompileResult;
use crate::frontend::ast::{BinOp, Expr, Intrinsic, UnOp};
use crate::func::Propagation;
use crate::lir::{ImmVal, Opcode, VarId};
use crate::settings::CompileFlags;
use crate::typestr;
use crate::vars::{VarData, VarKind};

impl<'a> Walker<'a> {
    /// Evaluate an expression to a variable.
    pub(super) fn eval_expr(&mut self, e: &Expr) -> CompileResult<VarId> {
        match e {
            Expr::Number { value, pos } => Ok(self.make_number(*value, *pos)),
            Expr::Str { bytes, .. } => Ok(self.make_string(bytes)),
            Expr::Ident { name, pos } => self.eval_ident(name, *pos),
            Expr::Unary { op, expr, pos } => self.eval_unary(*op, expr, *pos),
            Expr::Binary { op, lhs, rhs, pos } => self.eval_binary(*op, lhs, rhs, *pos),
            Expr::Assign { lhs, rhs, pos } => self.eval_assign(lhs, rhs, *pos),
            Expr::Call { callee, args, pos } => self.eval_call(callee, args, *pos),
            Expr::Member { base, field, pos } => self.eval_member(base, field, *pos),
            Expr::Index { base, index, pos } => self.eval_index(base, index, *pos),
            Expr::IntrinsicCall { which, args, pos } => self.eval_intrinsic(*which, args, *pos),
        }
    }

    // ---- leaf variables ------------------------------------------------

    /// A number variable. Numbers are global and sizeless; their name is
    /// `0` followed by their variable id so they can never collide with
    /// source symbols.
    pub(super) fn make_number(&mut self, value: u64, pos: u32) -> VarId {
        let root = self.module.root();
        let next = self.module.vars.next_key();
        let mut v = VarData::new(Some(root), format!("0{next}"));
        v.id = pos;
        v.is_number = true;
        v.number_value = value;
        v.cast = Some("uint".to_string());
        self.module.vars.push(v)
    }

    /// A string constant variable; its value is the constant's address
    /// in the string region.
    fn make_string(&mut self, bytes: &[u8]) -> VarId {
        let off = self.strings.intern(bytes);
        let root = self.module.root();
        let next = self.module.vars.next_key();
        let mut v = VarData::new(Some(root), format!("0{next}"));
        v.string_offset = Some(off);
        v.cast = Some("u8*".to_string());
        self.module.vars.push(v)
    }

    /// A temp with real storage in the current function's frame. Freed
    /// at the end of the statement.
    pub(super) fn make_temp(&mut self, ty: &str) -> CompileResult<VarId> {
        let cur = self.cur_func();
        let size = typestr::sizeof(&self.module, ty, self.gpr()).unwrap_or(self.gpr());
        let offset = self.alloc_frame_slot(cur, size);
        let next = self.module.vars.next_key();
        let mut v = VarData::new(Some(cur), format!("${next}$"));
        v.ty = Some(ty.to_string());
        v.size = size;
        v.offset = offset;
        v.kind = VarKind::Local;
        v.is_always_volatile = self.opts.flags.contains(CompileFlags::ALL_VAR_VOLATILE);
        let id = self.module.vars.push(v);
        self.module.vars[id].volatile_master = Some(id);
        self.module.funcs[cur].locals.push(id);
        self.cur_mut().stmt_temps.push(id);
        Ok(id)
    }

    fn eval_ident(&mut self, name: &str, pos: u32) -> CompileResult<VarId> {
        if let Some((var, level)) = self.lookup_var(name) {
            self.note_var_access(var, level, false);
            // A by-reference variable holds an address and is
            // dereferenced wherever it appears.
            if self.module.vars[var].is_byref {
                return Ok(self.make_deref(var));
            }
            return Ok(var);
        }
        if let Some(f) = self.lookup_fn_by_name(name) {
            return Ok(self.make_fn_addr(f));
        }
        let line = self.line_of(pos);
        Err(self.err_at(line, format!("`{name}` is not declared")))
    }

    /// A variable holding the address of function `f`. Taking it pins
    /// `f` as a stackframe holder.
    fn make_fn_addr(&mut self, f: crate::lir::FuncId) -> VarId {
        if !self.emit {
            self.module.funcs[f].address_taken = true;
        }
        let ty = {
            let fd = &self.module.funcs[f];
            let mut t = fd.ret_ty.clone();
            t.push('(');
            for (i, &a) in fd.args.iter().enumerate() {
                if i > 0 {
                    t.push(',');
                }
                t.push_str(self.module.vars[a].ty.as_deref().unwrap_or("uint"));
            }
            t.push(')');
            t
        };
        let root = self.module.root();
        let next = self.module.vars.next_key();
        let mut v = VarData::new(Some(root), format!("0{next}"));
        v.func_addr = Some(f);
        v.cast = Some(ty);
        self.module.vars.push(v)
    }

    /// The dereference view `(*(cast)p)` of pointer variable `p`.
    fn make_deref(&mut self, p: VarId) -> VarId {
        let pd = &self.module.vars[p];
        let pty = pd.effective_ty().unwrap_or("u8*");
        let inner = typestr::pointee(pty).unwrap_or("u8").to_string();
        let name = format!("(*({inner}*){})", pd.name);
        let cur = self.cur_func();
        let mut v = VarData::new(Some(cur), name);
        v.cast = Some(inner);
        v.deref_of = Some(p);
        // A pointer can alias anything; never cache what it points at.
        v.is_always_volatile = true;
        let id = self.module.vars.push(v);
        self.module.vars[id].volatile_master = Some(id);
        id
    }

    /// Pass-1 bookkeeping for touching `var` from `level` functions
    /// below its owner: cross-frame reads need the parent frame cached,
    /// cross-frame writes become propagations.
    pub(super) fn note_var_access(&mut self, var: VarId, level: u32, write: bool) {
        if self.emit {
            return;
        }
        let (base, _) = self.resolve_view(var);
        let Some(owner) = self.module.vars[base].owner else {
            return;
        };
        let cur = self.cur_func();
        let root = self.module.root();
        if level >= 1 && owner != root {
            self.module.funcs[cur].cache_stackframe(level);
        }
        if write && owner != cur {
            let (id, offset, size) = {
                let b = &self.module.vars[base];
                (b.id, b.offset, b.size)
            };
            let prop = Propagation::Variable {
                owner,
                id,
                offset,
                size,
            };
            let props = &mut self.module.funcs[cur].propagations;
            if !props.contains(&prop) {
                props.push(prop);
            }
        }
    }

    /// Follow view chains (`v.8` of `v.4` of `v`) down to the base
    /// storage variable and the accumulated byte offset.
    pub(super) fn resolve_view(&self, var: VarId) -> (VarId, u32) {
        let mut v = var;
        let mut off = 0;
        while let Some((base, o)) = self.module.vars[v].view_of {
            off += o;
            v = base;
        }
        (v, off)
    }

    // ---- operators -----------------------------------------------------

    fn eval_unary(&mut self, op: UnOp, expr: &Expr, pos: u32) -> CompileResult<VarId> {
        let operand = self.eval_expr(expr)?;
        let od = &self.module.vars[operand];

        // Constant folding on numbers.
        if od.is_number {
            let n = od.number_value;
            let folded = match op {
                UnOp::Neg => Some(n.wrapping_neg()),
                UnOp::Not => Some(!n),
                UnOp::LogicalNot => Some((n == 0) as u64),
                _ => None,
            };
            if let Some(value) = folded {
                return Ok(self.make_number(value, pos));
            }
        }

        match op {
            UnOp::Addr => self.eval_addr_of(operand, pos),
            UnOp::Deref => {
                let line = self.line_of(pos);
                let ty = self.module.vars[operand].effective_ty().unwrap_or("");
                if !typestr::is_pointer(ty) {
                    return Err(self.err_at(line, format!("cannot dereference `{ty}`")));
                }
                Ok(self.make_deref(operand))
            }
            UnOp::Neg | UnOp::Not | UnOp::LogicalNot => {
                let ty = self.module.vars[operand]
                    .effective_ty()
                    .unwrap_or("uint")
                    .to_string();
                let out = self.make_temp(&ty)?;
                if self.emit {
                    let rs = self.reg_for_value(operand)?;
                    self.lock_reg(rs);
                    let opcode = match op {
                        UnOp::Neg => Opcode::Neg,
                        UnOp::Not => Opcode::Not,
                        UnOp::LogicalNot => Opcode::Sz,
                        _ => unreachable!(),
                    };
                    let rd = self.alloc_result_reg(opcode)?;
                    self.emit_simple(opcode, rd, rs, 0);
                    self.unlock_reg(rs);
                    self.bind_result(out, rd);
                }
                Ok(out)
            }
        }
    }

    /// `&v`: the address of a place. On a dereference view this undoes
    /// the dereference; on anything with storage it pins the variable
    /// volatile, since the compiler can no longer track writes to it.
    pub(super) fn eval_addr_of(&mut self, operand: VarId, pos: u32) -> CompileResult<VarId> {
        if let Some(p) = self.module.vars[operand].deref_of {
            return Ok(p);
        }
        let (base, _) = self.resolve_view(operand);
        if !self.module.vars[base].has_storage() && self.module.vars[base].host_addr.is_none() {
            let line = self.line_of(pos);
            return Err(self.err_at(line, "cannot take the address of this expression"));
        }
        // The object now aliases; stop caching it in registers.
        if let Some(master) = self.module.vars[base].volatile_master {
            self.module.vars[master].is_always_volatile = true;
        }
        let ty = {
            let od = &self.module.vars[operand];
            let mut t = od.effective_ty().unwrap_or("u8").to_string();
            t.push('*');
            t
        };
        let cur = self.cur_func();
        let name = format!("(&{})", self.module.vars[operand].name);
        let mut v = VarData::new(Some(cur), name);
        v.cast = Some(ty);
        v.addr_of = Some(operand);
        Ok(self.module.vars.push(v))
    }

    fn eval_member(&mut self, base: &Expr, field: &str, pos: u32) -> CompileResult<VarId> {
        let base_var = self.eval_expr(base)?;
        let line = self.line_of(pos);
        let ty = self.module.vars[base_var]
            .effective_ty()
            .unwrap_or("")
            .to_string();
        let Some(tid) = typestr::lookup_named(&self.module, &ty) else {
            return Err(self.err_at(line, format!("`{ty}` is not a struct type")));
        };
        let member = self.module.types[tid]
            .members
            .iter()
            .map(|&m| &self.module.vars[m])
            .find(|m| m.name == field)
            .map(|m| (m.offset, m.ty.clone()));
        let Some((offset, mty)) = member else {
            return Err(self.err_at(line, format!("`{ty}` has no member `{field}`")));
        };
        let name = format!("{}.{offset}", self.module.vars[base_var].name);
        let cur = self.cur_func();
        let master = {
            let (b, _) = self.resolve_view(base_var);
            self.module.vars[b].volatile_master
        };
        let mut v = VarData::new(Some(cur), name);
        v.cast = mty;
        v.view_of = Some((base_var, offset));
        v.volatile_master = master;
        Ok(self.module.vars.push(v))
    }

    /// `base[index]`: a view at a constant offset, or a dereference of a
    /// computed element address.
    fn eval_index(&mut self, base: &Expr, index: &Expr, pos: u32) -> CompileResult<VarId> {
        let base_var = self.eval_expr(base)?;
        let index_var = self.eval_expr(index)?;
        let line = self.line_of(pos);
        let bty = self.module.vars[base_var]
            .effective_ty()
            .unwrap_or("")
            .to_string();
        let (elem, is_array) = if let Some((elem, _)) = typestr::array_elem(&bty) {
            (elem.to_string(), true)
        } else if let Some(elem) = typestr::pointee(&bty) {
            (elem.to_string(), false)
        } else {
            return Err(self.err_at(line, format!("`{bty}` cannot be indexed")));
        };
        let Some(elem_size) = typestr::sizeof(&self.module, &elem, self.gpr()) else {
            return Err(self.err_at(line, format!("unknown element type `{elem}`")));
        };

        if self.module.vars[index_var].is_number {
            let off = (self.module.vars[index_var].number_value as u32) * elem_size;
            if is_array {
                // A constant-index view of the array, like a member
                // access.
                let name = format!("{}.{off}", self.module.vars[base_var].name);
                let master = {
                    let (b, _) = self.resolve_view(base_var);
                    self.module.vars[b].volatile_master
                };
                let cur = self.cur_func();
                let mut v = VarData::new(Some(cur), name);
                v.cast = Some(elem);
                v.view_of = Some((base_var, off));
                v.volatile_master = master;
                return Ok(self.module.vars.push(v));
            }
            let d = self.make_deref(base_var);
            if off == 0 {
                return Ok(d);
            }
            let cur = self.cur_func();
            let name = format!("{}.{off}", self.module.vars[d].name);
            let mut v = VarData::new(Some(cur), name);
            v.cast = Some(elem);
            v.view_of = Some((d, off));
            v.volatile_master = self.module.vars[d].volatile_master;
            return Ok(self.module.vars.push(v));
        }

        // Runtime index: form the element address in a temp pointer and
        // dereference it.
        let ptr_ty = format!("{elem}*");
        let addr = self.make_temp(&ptr_ty)?;
        if self.emit {
            let rp = if is_array {
                let av = self.eval_addr_of(base_var, pos)?;
                self.reg_for_value(av)?
            } else {
                self.reg_for_value(base_var)?
            };
            self.lock_reg(rp);
            let ri = self.reg_for_value(index_var)?;
            self.lock_reg(ri);
            let rd = self.alloc_result_reg(Opcode::Add)?;
            if elem_size > 1 {
                self.emit_with_imm(Opcode::MulI, rd, ri, 0, &[ImmVal::Value(elem_size as i64)]);
                self.emit_simple(Opcode::Add, rd, rd, rp);
            } else {
                self.emit_simple(Opcode::Add, rd, rp, ri);
            }
            self.unlock_reg(ri);
            self.unlock_reg(rp);
            self.bind_result(addr, rd);
        } else if is_array {
            // The address of the array escapes into arithmetic.
            self.eval_addr_of(base_var, pos)?;
        }
        Ok(self.make_deref(addr))
    }

    fn eval_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, pos: u32) -> CompileResult<VarId> {
        let l = self.eval_expr(lhs)?;
        let r = self.eval_expr(rhs)?;

        let (l_num, l_val) = {
            let v = &self.module.vars[l];
            (v.is_number, v.number_value)
        };
        let (r_num, r_val) = {
            let v = &self.module.vars[r];
            (v.is_number, v.number_value)
        };
        let lt = self.module.vars[l].effective_ty().unwrap_or("uint").to_string();
        let rt = self.module.vars[r].effective_ty().unwrap_or("uint").to_string();
        let signed = typestr::is_signed(&lt) && typestr::is_signed(&rt);

        if l_num && r_num {
            let folded = fold_binary(op, l_val, r_val, signed, self.opts.bitsizeof_gpr());
            if let Some(value) = folded {
                return Ok(self.make_number(value, pos));
            }
        }

        // Pointer arithmetic scales the integer operand by the pointee
        // size.
        let (l, r, l_num, l_val, r_num, r_val) = self.scale_pointer_operand(
            op, l, r, &lt, &rt, l_num, l_val, r_num, r_val, pos,
        )?;

        let result_ty = match op {
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                "uint".to_string()
            }
            _ => {
                if l_num && !r_num {
                    rt.clone()
                } else {
                    lt.clone()
                }
            }
        };
        let out = self.make_temp(&result_ty)?;
        if !self.emit {
            return Ok(out);
        }

        if r_num {
            self.emit_binary_imm(op, out, l, r_val as i64, signed)?;
        } else if l_num {
            self.emit_binary_imm_rev(op, out, r, l_val as i64, signed)?;
        } else {
            self.emit_binary_rr(op, out, l, r, signed)?;
        }
        Ok(out)
    }

    /// Multiply the integer side of pointer+integer arithmetic by the
    /// pointee size. Returns possibly-replaced operands.
    #[allow(clippy::too_many_arguments)]
    fn scale_pointer_operand(
        &mut self,
        op: BinOp,
        l: VarId,
        r: VarId,
        lt: &str,
        rt: &str,
        l_num: bool,
        l_val: u64,
        r_num: bool,
        r_val: u64,
        pos: u32,
    ) -> CompileResult<(VarId, VarId, bool, u64, bool, u64)> {
        if !matches!(op, BinOp::Add | BinOp::Sub) {
            return Ok((l, r, l_num, l_val, r_num, r_val));
        }
        let scale = |w: &mut Self, ty: &str| -> Option<u32> {
            let elem = typestr::pointee(ty)?;
            typestr::sizeof(&w.module, elem, w.gpr()).filter(|&s| s > 1)
        };
        if typestr::is_pointer(lt) && !typestr::is_pointer(rt) {
            if let Some(s) = scale(self, lt) {
                if r_num {
                    let scaled = self.make_number(r_val.wrapping_mul(s as u64), pos);
                    return Ok((l, scaled, l_num, l_val, true, r_val.wrapping_mul(s as u64)));
                }
                let scaled = self.make_temp(rt)?;
                if self.emit {
                    let rs = self.reg_for_value(r)?;
                    self.lock_reg(rs);
                    let rd = self.alloc_result_reg(Opcode::MulI)?;
                    self.emit_with_imm(Opcode::MulI, rd, rs, 0, &[ImmVal::Value(s as i64)]);
                    self.unlock_reg(rs);
                    self.bind_result(scaled, rd);
                }
                return Ok((l, scaled, l_num, l_val, false, 0));
            }
        }
        if typestr::is_pointer(rt) && !typestr::is_pointer(lt) && op == BinOp::Add {
            if let Some(s) = scale(self, rt) {
                if l_num {
                    let v = l_val.wrapping_mul(s as u64);
                    let scaled = self.make_number(v, pos);
                    return Ok((scaled, r, true, v, r_num, r_val));
                }
                let scaled = self.make_temp(lt)?;
                if self.emit {
                    let rs = self.reg_for_value(l)?;
                    self.lock_reg(rs);
                    let rd = self.alloc_result_reg(Opcode::MulI)?;
                    self.emit_with_imm(Opcode::MulI, rd, rs, 0, &[ImmVal::Value(s as i64)]);
                    self.unlock_reg(rs);
                    self.bind_result(scaled, rd);
                }
                return Ok((scaled, r, false, 0, r_num, r_val));
            }
        }
        Ok((l, r, l_num, l_val, r_num, r_val))
    }

    /// reg ⊕ imm forms.
    fn emit_binary_imm(
        &mut self,
        op: BinOp,
        out: VarId,
        l: VarId,
        imm: i64,
        signed: bool,
    ) -> CompileResult<()> {
        use BinOp::*;
        let rl = self.reg_for_value(l)?;
        self.lock_reg(rl);
        let (opcode, imm) = match (op, signed) {
            (Add, _) => (Opcode::AddI, imm),
            // There is no subtract-immediate; add the negation.
            (Sub, _) => (Opcode::AddI, imm.wrapping_neg()),
            (Mul, _) => (Opcode::MulI, imm),
            (Div, true) => (Opcode::DivI, imm),
            (Div, false) => (Opcode::DivUI, imm),
            (Rem, true) => (Opcode::ModI, imm),
            (Rem, false) => (Opcode::ModUI, imm),
            (Shl, _) => (Opcode::SllI, imm),
            (Shr, true) => (Opcode::SraI, imm),
            (Shr, false) => (Opcode::SrlI, imm),
            (BitAnd, _) => (Opcode::AndI, imm),
            (BitOr, _) => (Opcode::OrI, imm),
            (BitXor, _) => (Opcode::XorI, imm),
            (Eq, _) => (Opcode::SeqI, imm),
            (Ne, _) => (Opcode::SneI, imm),
            (Lt, true) => (Opcode::SltI, imm),
            (Lt, false) => (Opcode::SltUI, imm),
            (Le, true) => (Opcode::SlteI, imm),
            (Le, false) => (Opcode::SlteUI, imm),
            (Gt, true) => (Opcode::SgtI, imm),
            (Gt, false) => (Opcode::SgtUI, imm),
            (Ge, true) => (Opcode::SgteI, imm),
            (Ge, false) => (Opcode::SgteUI, imm),
        };
        let rd = self.alloc_result_reg(opcode)?;
        self.emit_with_imm(opcode, rd, rl, 0, &[ImmVal::Value(imm)]);
        self.unlock_reg(rl);
        self.bind_result(out, rd);
        Ok(())
    }

    /// imm ⊕ reg forms, for the non-commutative operators that have a
    /// reversed immediate encoding.
    fn emit_binary_imm_rev(
        &mut self,
        op: BinOp,
        out: VarId,
        r: VarId,
        imm: i64,
        signed: bool,
    ) -> CompileResult<()> {
        use BinOp::*;
        // Commutative and comparison cases reduce to the plain form.
        match op {
            Add | Mul | BitAnd | BitOr | BitXor | Eq | Ne => {
                return self.emit_binary_imm(op, out, r, imm, signed);
            }
            // imm < r ⟺ r > imm, and so on.
            Lt => return self.emit_binary_imm(Gt, out, r, imm, signed),
            Le => return self.emit_binary_imm(Ge, out, r, imm, signed),
            Gt => return self.emit_binary_imm(Lt, out, r, imm, signed),
            Ge => return self.emit_binary_imm(Le, out, r, imm, signed),
            _ => {}
        }
        let rr = self.reg_for_value(r)?;
        self.lock_reg(rr);
        match op {
            Sub => {
                // imm − r = (−r) + imm.
                let rd = self.alloc_result_reg(Opcode::AddI)?;
                self.emit_simple(Opcode::Neg, rd, rr, 0);
                self.emit_with_imm(Opcode::AddI, rd, rd, 0, &[ImmVal::Value(imm)]);
                self.unlock_reg(rr);
                self.bind_result(out, rd);
            }
            _ => {
                let opcode = match (op, signed) {
                    (Div, true) => Opcode::DivI2,
                    (Div, false) => Opcode::DivUI2,
                    (Rem, true) => Opcode::ModI2,
                    (Rem, false) => Opcode::ModUI2,
                    (Shl, _) => Opcode::SllI2,
                    (Shr, true) => Opcode::SraI2,
                    (Shr, false) => Opcode::SrlI2,
                    _ => unreachable!("handled above"),
                };
                let rd = self.alloc_result_reg(opcode)?;
                self.emit_with_imm(opcode, rd, rr, 0, &[ImmVal::Value(imm)]);
                self.unlock_reg(rr);
                self.bind_result(out, rd);
            }
        }
        Ok(())
    }

    /// reg ⊕ reg forms.
    fn emit_binary_rr(
        &mut self,
        op: BinOp,
        out: VarId,
        l: VarId,
        r: VarId,
        signed: bool,
    ) -> CompileResult<()> {
        use BinOp::*;
        let rl = self.reg_for_value(l)?;
        self.lock_reg(rl);
        let rr = self.reg_for_value(r)?;
        self.lock_reg(rr);
        // `Gt`/`Ge` swap operands into `Slt`/`Slte`.
        let (opcode, a, b) = match (op, signed) {
            (Add, _) => (Opcode::Add, rl, rr),
            (Sub, _) => (Opcode::Sub, rl, rr),
            (Mul, _) => (Opcode::Mul, rl, rr),
            (Div, true) => (Opcode::Div, rl, rr),
            (Div, false) => (Opcode::DivU, rl, rr),
            (Rem, true) => (Opcode::Mod, rl, rr),
            (Rem, false) => (Opcode::ModU, rl, rr),
            (Shl, _) => (Opcode::Sll, rl, rr),
            (Shr, true) => (Opcode::Sra, rl, rr),
            (Shr, false) => (Opcode::Srl, rl, rr),
            (BitAnd, _) => (Opcode::And, rl, rr),
            (BitOr, _) => (Opcode::Or, rl, rr),
            (BitXor, _) => (Opcode::Xor, rl, rr),
            (Eq, _) => (Opcode::Seq, rl, rr),
            (Ne, _) => (Opcode::Sne, rl, rr),
            (Lt, true) => (Opcode::Slt, rl, rr),
            (Lt, false) => (Opcode::SltU, rl, rr),
            (Le, true) => (Opcode::Slte, rl, rr),
            (Le, false) => (Opcode::SlteU, rl, rr),
            (Gt, true) => (Opcode::Slt, rr, rl),
            (Gt, false) => (Opcode::SltU, rr, rl),
            (Ge, true) => (Opcode::Slte, rr, rl),
            (Ge, false) => (Opcode::SlteU, rr, rl),
        };
        let rd = self.alloc_result_reg(opcode)?;
        self.emit_simple(opcode, rd, a, b);
        self.unlock_reg(rr);
        self.unlock_reg(rl);
        self.bind_result(out, rd);
        Ok(())
    }

    fn eval_assign(&mut self, lhs: &Expr, rhs: &Expr, pos: u32) -> CompileResult<VarId> {
        let value = self.eval_expr(rhs)?;
        let place = self.eval_place(lhs)?;
        let ty = self.module.vars[place]
            .effective_ty()
            .unwrap_or("uint")
            .to_string();
        self.assign_var(place, 0, &ty, value, pos)?;
        Ok(place)
    }

    /// Evaluate an expression required to denote a place.
    fn eval_place(&mut self, e: &Expr) -> CompileResult<VarId> {
        let var = self.eval_expr(e)?;
        let line = self.line_of(e.pos());
        let v = &self.module.vars[var];
        let (base, _) = self.resolve_view(var);
        let b = &self.module.vars[base];
        let is_place =
            v.deref_of.is_some() || b.has_storage() || b.host_addr.is_some();
        if !is_place {
            return Err(self.err_at(line, "expression is not assignable"));
        }
        // Write access bookkeeping runs against the place itself.
        if !self.emit {
            if let Some(owner) = self.module.vars[base].owner {
                if let Some(level) = self.level_of_owner(owner) {
                    self.note_var_access(var, level, true);
                }
            }
        }
        Ok(var)
    }

    /// Nesting distance from the current function up to `owner`, if
    /// `owner` is on the chain.
    fn level_of_owner(&self, owner: crate::lir::FuncId) -> Option<u32> {
        self.module.level_to(self.cur_func(), owner)
    }

    fn eval_intrinsic(
        &mut self,
        which: Intrinsic,
        args: &[Expr],
        pos: u32,
    ) -> CompileResult<VarId> {
        let line = self.line_of(pos);
        let expected = match which {
            Intrinsic::PageAlloc => 1,
            Intrinsic::PageFree => 2,
        };
        if args.len() != expected {
            return Err(self.err_at(line, "wrong number of intrinsic arguments"));
        }
        let vals: Vec<VarId> = args
            .iter()
            .map(|a| self.eval_expr(a))
            .collect::<CompileResult<_>>()?;
        match which {
            Intrinsic::PageAlloc => {
                let out = self.make_temp("u8*")?;
                if self.emit {
                    let count = vals[0];
                    if self.module.vars[count].is_number {
                        let n = self.module.vars[count].number_value;
                        let rd = self.alloc_result_reg(Opcode::PageAllocI)?;
                        self.emit_with_imm(
                            Opcode::PageAllocI,
                            rd,
                            0,
                            0,
                            &[ImmVal::Value(n as i64)],
                        );
                        self.bind_result(out, rd);
                    } else {
                        let rc = self.reg_for_value(count)?;
                        self.lock_reg(rc);
                        let rd = self.alloc_result_reg(Opcode::PageAlloc)?;
                        self.emit_simple(Opcode::PageAlloc, rd, rc, 0);
                        self.unlock_reg(rc);
                        self.bind_result(out, rd);
                    }
                }
                Ok(out)
            }
            Intrinsic::PageFree => {
                let out = self.make_temp("uint")?;
                if self.emit {
                    let addr = vals[0];
                    let count = vals[1];
                    let ra = self.reg_for_value(addr)?;
                    self.lock_reg(ra);
                    if self.module.vars[count].is_number {
                        let n = self.module.vars[count].number_value;
                        self.emit_with_imm(
                            Opcode::PageFreeI,
                            ra,
                            0,
                            0,
                            &[ImmVal::Value(n as i64)],
                        );
                    } else {
                        let rc = self.reg_for_value(count)?;
                        self.emit_simple(Opcode::PageFree, ra, rc, 0);
                    }
                    self.unlock_reg(ra);
                }
                Ok(out)
            }
        }
    }
}

/// Constant-fold a binary operation at the given GPR width. Division by
/// zero stays unfolded so it faults at runtime like any other division.
fn fold_binary(op: BinOp, l: u64, r: u64, signed: bool, bits: u32) -> Option<u64> {
    use BinOp::*;
    let mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let sl = l as i64;
    let sr = r as i64;
    let v = match op {
        Add => l.wrapping_add(r),
        Sub => l.wrapping_sub(r),
        Mul => l.wrapping_mul(r),
        Div if r != 0 => {
            if signed {
                sl.wrapping_div(sr) as u64
            } else {
                l / r
            }
        }
        Rem if r != 0 => {
            if signed {
                sl.wrapping_rem(sr) as u64
            } else {
                l % r
            }
        }
        Div | Rem => return None,
        Shl => l.wrapping_shl(r as u32),
        Shr => {
            if signed {
                sl.wrapping_shr(r as u32) as u64
            } else {
                l.wrapping_shr(r as u32)
            }
        }
        BitAnd => l & r,
        BitOr => l | r,
        BitXor => l ^ r,
        Eq => (l == r) as u64,
        Ne => (l != r) as u64,
        Lt => (if signed { sl < sr } else { l < r }) as u64,
        Le => (if signed { sl <= sr } else { l <= r }) as u64,
        Gt => (if signed { sl > sr } else { l > r }) as u64,
        Ge => (if signed { sl >= sr } else { l >= r }) as u64,
    };
    Some(v & mask)
}
