//! Variables and declared types.
//!
//! A `VarData` represents any named or compiler-generated value. The
//! `name` field encodes the variable's role, which keeps lookup uniform:
//! one map from name to variable covers explicit variables, derived
//! views, numbers, and constants alike.
//!
//! - explicitly declared variables carry their source symbol;
//! - hidden members are named `"."`, anonymous members `""`;
//! - an offset view of `v` is named `v.8` (no storage of its own);
//! - a dereference is named `(*(cast)v)`;
//! - an address-of is named `(&v)`;
//! - numbers and function addresses are named `0` followed by their
//!   variable id;
//! - string constants are numbers whose `string_offset` is set.

use crate::lir::{FuncId, TypeId, VarId};

/// Whether a variable lives in its function's argument area, its local
/// area, or inside a type definition.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum VarKind {
    /// Function argument; `offset` is within the argument area.
    Arg,
    /// Function local; `offset` is within the local area (or the global
    /// region, for root-function locals).
    Local,
    /// Member of a declared type; `offset` is within the type.
    Member,
    /// Derived or generated variable with no storage of its own.
    Derived,
}

/// A variable.
#[derive(Clone, Debug)]
pub struct VarData {
    /// The function this variable is attached to. `None` for type
    /// members.
    pub owner: Option<FuncId>,
    /// Source position of the declaration; used to identify explicitly
    /// declared variables across passes. 0 for generated variables.
    pub id: u32,
    /// Storage size in bytes. 0 for variables that do not take memory
    /// (derived views, numbers, addresses).
    pub size: u32,
    /// Byte offset within the owning frame area, global region, or type.
    pub offset: u32,
    /// Role-encoding name; see the module docs.
    pub name: String,
    /// Real storage type. `None` for variables that only have a cast.
    pub ty: Option<String>,
    /// Temporary reinterpretation attribute. Cleared when the variable is
    /// pushed as an argument unless `preserve_temp_attr` is set.
    pub cast: Option<String>,
    /// Where the variable lives.
    pub kind: VarKind,
    /// Scope depth at declaration.
    pub scope_depth: u32,
    /// Scope chain snapshot at declaration; a variable is visible when
    /// its chain is a prefix of the current chain.
    pub scope: Vec<u32>,
    /// Declared `static`: the variable lives in the global region even
    /// when declared inside a function.
    pub is_static: bool,
    /// The variable holds the address of another variable and is
    /// automatically dereferenced wherever used.
    pub is_byref: bool,
    /// Set when the variable is the address of a function.
    pub func_addr: Option<FuncId>,
    /// Set when the variable is a number; `number_value` holds it.
    pub is_number: bool,
    /// The numeric value, when `is_number`.
    pub number_value: u64,
    /// Offset within the string region when the variable is a string
    /// constant.
    pub string_offset: Option<u32>,
    /// The variable whose `is_always_volatile` flag governs this one. A
    /// base variable is its own master; offset views share their base's
    /// master, so taking the address of any view makes the whole object
    /// volatile.
    pub volatile_master: Option<VarId>,
    /// Master volatile flag; never cache this variable in a register
    /// when set.
    pub is_always_volatile: bool,
    /// Guards `cast` from being cleared while an argument push is in
    /// flight.
    pub preserve_temp_attr: bool,
    /// For offset views (`v.8`): the viewed variable and the byte offset
    /// into it. The name encodes the same fact; this is the parsed form.
    pub view_of: Option<(VarId, u32)>,
    /// For dereference variables (`(*(cast)v)`): the pointer variable
    /// whose value is the address.
    pub deref_of: Option<VarId>,
    /// For address-of variables (`(&v)`): the variable whose address is
    /// the value.
    pub addr_of: Option<VarId>,
    /// For host-predeclared variables: their address in host memory.
    pub host_addr: Option<u64>,
}

impl VarData {
    /// A bare variable with a name and owner; callers fill in the rest.
    pub fn new(owner: Option<FuncId>, name: impl Into<String>) -> Self {
        Self {
            owner,
            id: 0,
            size: 0,
            offset: 0,
            name: name.into(),
            ty: None,
            cast: None,
            kind: VarKind::Derived,
            scope_depth: 0,
            scope: Vec::new(),
            is_static: false,
            is_byref: false,
            func_addr: None,
            is_number: false,
            number_value: 0,
            string_offset: None,
            volatile_master: None,
            is_always_volatile: false,
            preserve_temp_attr: false,
            view_of: None,
            deref_of: None,
            addr_of: None,
            host_addr: None,
        }
    }

    /// The type to use when manipulating the variable: the cast when one
    /// is active, the storage type otherwise.
    pub fn effective_ty(&self) -> Option<&str> {
        self.cast.as_deref().or(self.ty.as_deref())
    }

    /// Does this variable occupy stack or global-region memory?
    pub fn has_storage(&self) -> bool {
        self.size != 0
    }
}

/// A named or anonymous aggregate type.
#[derive(Clone, Debug)]
pub struct TypeData {
    /// Type name. Generated from the declaration position for anonymous
    /// types.
    pub name: String,
    /// Size in bytes. 0 while the type is only declared, not defined.
    pub size: u32,
    /// Members, in declaration order.
    pub members: Vec<VarId>,
    /// When set, the first member is anonymous and of this base type.
    pub base: Option<TypeId>,
    /// Scope depth at declaration.
    pub scope_depth: u32,
    /// Scope chain snapshot at declaration.
    pub scope: Vec<u32>,
}
