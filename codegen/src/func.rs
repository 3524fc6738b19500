//! Functions, call bookkeeping, and the per-pass module container.
//!
//! `FuncData` carries everything the passes and the planner know about a
//! function. A `Module` owns one pass's worth of entities; the compile
//! context keeps two of them, one per pass, and drops the second one
//! wholesale when a recompile is needed.

use crate::entity::PrimaryMap;
use crate::lir::{FuncId, Inst, RegionId, TypeId, VarId};
use crate::sourceloc::SourceLoc;
use crate::vars::{TypeData, VarData};

/// A record that a function calls another. `count` is the number of
/// direct call sites; it is 0 when the entry only records an indirect
/// reach (a call made through a callee).
#[derive(Clone, Debug)]
pub struct CalledFunction {
    /// The callee.
    pub callee: FuncId,
    /// Direct call count. 0 for indirect entries.
    pub count: u32,
}

/// A side effect a function may have on a variable visible above it.
///
/// Pass 1 records these; the planner resolves every `Function` entry into
/// the `Variable` entries reachable from it, so pass 2 can invalidate
/// exactly the registers a call may clobber.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Propagation {
    /// A call may modify a specific variable of an enclosing function.
    Variable {
        /// The function the variable is local to.
        owner: FuncId,
        /// The variable's declaration id (source position).
        id: u32,
        /// Byte offset of the modified range.
        offset: u32,
        /// Byte size of the modified range.
        size: u32,
    },
    /// A call may cause whatever the named function propagates. Replaced
    /// (not removed) during planning.
    Function(FuncId),
}

/// Flags fixed for one pushed argument in pass 1 and looked up by id in
/// pass 2.
#[derive(Clone, Debug)]
pub struct ArgFlag {
    /// Source position of the argument expression; the pass-2 lookup key.
    pub id: u32,
    /// The argument is passed by reference: its address must stay valid
    /// across the call.
    pub by_ref: bool,
    /// The argument is output-only: the callee never reads it, so the
    /// pusher must not duplicate it.
    pub output: bool,
}

/// A region within a holder's frame backing the tiny stackframes of one
/// or more tenants that never transitively call each other.
#[derive(Clone, Debug, Default)]
pub struct SharedRegion {
    /// Functions whose tiny frames live here.
    pub members: Vec<FuncId>,
    /// Distance from the holder's frame base down to this region's base.
    /// Filled in during frame sizing.
    pub offset: u32,
}

/// A function.
#[derive(Clone, Debug)]
pub struct FuncData {
    /// Lexical parent. `None` only for the root function.
    pub parent: Option<FuncId>,
    /// Children in creation order.
    pub children: Vec<FuncId>,
    /// Function name. Empty for the root function.
    pub name: String,
    /// Return type string; `"void"` when the function returns nothing.
    pub ret_ty: String,
    /// Canonical call signature, `name|arg1_ty|arg2_ty|…|`, used for
    /// overload matching.
    pub call_signature: String,
    /// Public identity used in export/import tables: the pointer-to-
    /// function type with the function name in place of the return type.
    /// Only generated in pass 2.
    pub linking_signature: String,
    /// Which AST function node produced this entity. Stable across both
    /// passes, so it links the pass-1 and pass-2 instances.
    pub ast_id: u32,
    /// Emitted instructions, in order. Pass 2 only.
    pub insts: Vec<Inst>,
    /// Argument variables, in declaration order.
    pub args: Vec<VarId>,
    /// Local variables, in creation order.
    pub locals: Vec<VarId>,
    /// Types declared inside this function.
    pub types: Vec<TypeId>,
    /// Declared with `export`.
    pub exported: bool,
    /// A body was seen for this function. Distinguishes an import-to-be
    /// from a definition when declarations merge.
    pub has_body: bool,
    /// Declared but not defined: the function is imported, and its body
    /// is a thunk that jumps through an address the loader writes at this
    /// offset in the string region.
    pub import_offset: Option<u32>,
    /// Calls itself, directly or through a sibling cycle.
    pub recursive: bool,
    /// Takes a variable number of arguments.
    pub variadic: bool,
    /// The function's address is taken somewhere (including by
    /// export/import plumbing).
    pub address_taken: bool,
    /// Uses the `this` variable.
    pub uses_this: bool,
    /// Must hold its own stackframe on the next planning round even
    /// though the usual holder conditions do not apply.
    pub could_not_get_holder: bool,
    /// Number of times the function is called. Pass 1.
    pub times_called: u32,
    /// Callees, direct and inherited. Pass 1.
    pub called_functions: Vec<CalledFunction>,
    /// Side effects on enclosing scopes. Pass 1; resolved by the planner.
    pub propagations: Vec<Propagation>,
    /// Per-call-site argument flags fixed in pass 1.
    pub pushed_arg_flags: Vec<ArgFlag>,
    /// Parent-frame levels this function reads through, ascending.
    /// Never set for the root function or its immediate children.
    pub cached_stackframes: Vec<u32>,
    /// The holder whose shared region backs this function's tiny frame.
    /// `None` when the function holds its own frame.
    pub stackframe_holder: Option<FuncId>,
    /// The region within the holder that backs this function.
    pub shared_region_to_use: Option<RegionId>,
    /// Regions inside this function's frame, when it is a holder.
    pub shared_regions: Vec<RegionId>,
    /// Total size of the shared area. Holders only; pass 2.
    pub shared_region_size: u32,
    /// Size of the stackframe-pointer cache. Holders only.
    pub stackframe_ptr_cache_size: u32,
    /// High-water mark of the local variable area.
    pub local_vars_max_size: u32,
    /// Current size of the local variable area while emitting; locals
    /// are released at scope exit, the max is what frames reserve.
    pub local_vars_cur_size: u32,
    /// Frame bytes excluding the shared area. Pass 2.
    pub stack_usage: u32,
    /// The pass-1 instance of this function, set on pass-2 instances.
    pub firstpass: Option<FuncId>,
    /// The pass-2 instance of this function, set on pass-1 instances.
    pub secondpass: Option<FuncId>,
    /// Where the function was declared; capacity errors point here.
    pub start_loc: SourceLoc,
    /// The planner found this function unreachable and dropped it; pass 2
    /// skips its body entirely.
    pub pruned: bool,
}

impl FuncData {
    /// A new function under `parent`.
    pub fn new(parent: Option<FuncId>, name: impl Into<String>, ast_id: u32) -> Self {
        Self {
            parent,
            children: Vec::new(),
            name: name.into(),
            ret_ty: "void".to_string(),
            call_signature: String::new(),
            linking_signature: String::new(),
            ast_id,
            insts: Vec::new(),
            args: Vec::new(),
            locals: Vec::new(),
            types: Vec::new(),
            exported: false,
            has_body: false,
            import_offset: None,
            recursive: false,
            variadic: false,
            address_taken: false,
            uses_this: false,
            could_not_get_holder: false,
            times_called: 0,
            called_functions: Vec::new(),
            propagations: Vec::new(),
            pushed_arg_flags: Vec::new(),
            cached_stackframes: Vec::new(),
            stackframe_holder: None,
            shared_region_to_use: None,
            shared_regions: Vec::new(),
            shared_region_size: 0,
            stackframe_ptr_cache_size: 0,
            local_vars_max_size: 0,
            local_vars_cur_size: 0,
            stack_usage: 0,
            firstpass: None,
            secondpass: None,
            start_loc: SourceLoc::unknown(),
            pruned: false,
        }
    }

    /// Does this function return a value?
    pub fn returns_value(&self) -> bool {
        self.ret_ty != "void"
    }

    /// Record a call to `callee`, merging with an existing entry.
    pub fn record_call(&mut self, callee: FuncId, count: u32) {
        if let Some(entry) = self.called_functions.iter_mut().find(|c| c.callee == callee) {
            entry.count += count;
        } else {
            self.called_functions.push(CalledFunction { callee, count });
        }
    }

    /// Record that this function reads through the stackframe `level`
    /// parents up, keeping the list sorted ascending and free of
    /// duplicates. `level` is never 0.
    pub fn cache_stackframe(&mut self, level: u32) {
        debug_assert!(level != 0);
        match self.cached_stackframes.binary_search(&level) {
            Ok(_) => {}
            Err(pos) => self.cached_stackframes.insert(pos, level),
        }
    }
}

/// One pass's worth of compiler entities.
pub struct Module {
    /// Functions. Index 0 is always the root function.
    pub funcs: PrimaryMap<FuncId, FuncData>,
    /// Variables across all functions.
    pub vars: PrimaryMap<VarId, VarData>,
    /// Declared types across all functions.
    pub types: PrimaryMap<TypeId, TypeData>,
    /// Shared regions. Populated by the planner on the pass-1 module.
    pub regions: PrimaryMap<RegionId, SharedRegion>,
}

impl Module {
    /// A new module containing only a root function.
    pub fn new() -> Self {
        let mut funcs = PrimaryMap::new();
        funcs.push(FuncData::new(None, "", 0));
        Self {
            funcs,
            vars: PrimaryMap::new(),
            types: PrimaryMap::new(),
            regions: PrimaryMap::new(),
        }
    }

    /// The root function.
    pub fn root(&self) -> FuncId {
        FuncId(0)
    }

    /// Is `f` the root function?
    pub fn is_root(&self, f: FuncId) -> bool {
        f.0 == 0
    }

    /// Nesting distance from `f` up to `ancestor`, if `ancestor` is on
    /// `f`'s parent chain.
    pub fn level_to(&self, f: FuncId, ancestor: FuncId) -> Option<u32> {
        let mut cur = f;
        let mut level = 0;
        loop {
            if cur == ancestor {
                return Some(level);
            }
            cur = self.funcs[cur].parent?;
            level += 1;
        }
    }

    /// The ancestor of `f` that is `level` steps up, if it exists.
    pub fn ancestor_at(&self, f: FuncId, level: u32) -> Option<FuncId> {
        let mut cur = f;
        for _ in 0..level {
            cur = self.funcs[cur].parent?;
        }
        Some(cur)
    }

    /// Does `caller` transitively call `target`? Follows the pass-1
    /// called-function lists, guarding against cycles.
    pub fn transitively_calls(&self, caller: FuncId, target: FuncId) -> bool {
        let mut visited = vec![false; self.funcs.len()];
        self.transitively_calls_inner(caller, target, &mut visited)
    }

    fn transitively_calls_inner(&self, caller: FuncId, target: FuncId, visited: &mut [bool]) -> bool {
        use crate::entity::EntityRef;
        if visited[caller.index()] {
            return false;
        }
        visited[caller.index()] = true;
        for call in &self.funcs[caller].called_functions {
            if call.callee == target {
                return true;
            }
            if self.transitively_calls_inner(call.callee, target, visited) {
                return true;
            }
        }
        false
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}
