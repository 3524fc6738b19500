//! The abstract syntax tree both analyzer passes walk.
//!
//! Every node carries the byte position of its first token; positions
//! identify declarations across passes and order labels for
//! nearest-in-scope resolution. Function nodes additionally carry a dense
//! `ast_id` assigned by the parser, which is the cross-pass key linking a
//! pass-1 function to its pass-2 twin.

/// A binary operator.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A unary operator.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UnOp {
    /// Arithmetic negation.
    Neg,
    /// Bitwise complement.
    Not,
    /// Logical not: 1 when the operand is zero, else 0.
    LogicalNot,
    /// Address-of.
    Addr,
    /// Dereference.
    Deref,
}

/// A page-management intrinsic.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Intrinsic {
    /// `pagealloc(count)` — allocate pages, yielding the first page's
    /// address or -1.
    PageAlloc,
    /// `pagefree(addr, count)` — free pages.
    PageFree,
}

/// An expression.
#[derive(Clone, Debug)]
pub enum Expr {
    /// Integer literal.
    Number { value: u64, pos: u32 },
    /// String literal; lives in the string region.
    Str { bytes: Vec<u8>, pos: u32 },
    /// A variable or function name.
    Ident { name: String, pos: u32 },
    /// Unary operation.
    Unary { op: UnOp, expr: Box<Expr>, pos: u32 },
    /// Binary operation.
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr>, pos: u32 },
    /// Assignment; `lhs` must be a place.
    Assign { lhs: Box<Expr>, rhs: Box<Expr>, pos: u32 },
    /// Call. The callee is an `Ident` for direct calls or any
    /// pointer-valued expression for indirect ones.
    Call { callee: Box<Expr>, args: Vec<Expr>, pos: u32 },
    /// Member access on an aggregate.
    Member { base: Box<Expr>, field: String, pos: u32 },
    /// Array or pointer indexing.
    Index { base: Box<Expr>, index: Box<Expr>, pos: u32 },
    /// A page-management intrinsic call.
    IntrinsicCall { which: Intrinsic, args: Vec<Expr>, pos: u32 },
}

impl Expr {
    /// The node's source position.
    pub fn pos(&self) -> u32 {
        match self {
            Expr::Number { pos, .. }
            | Expr::Str { pos, .. }
            | Expr::Ident { pos, .. }
            | Expr::Unary { pos, .. }
            | Expr::Binary { pos, .. }
            | Expr::Assign { pos, .. }
            | Expr::Call { pos, .. }
            | Expr::Member { pos, .. }
            | Expr::Index { pos, .. }
            | Expr::IntrinsicCall { pos, .. } => *pos,
        }
    }
}

/// A function parameter.
#[derive(Clone, Debug)]
pub struct Param {
    /// Parameter name; empty in a body-less declaration.
    pub name: String,
    /// Canonical type string. For by-reference parameters this is the
    /// pointer type; `by_ref` records the `&`.
    pub ty: String,
    /// Declared with `&`: the actual is passed by address and
    /// auto-dereferenced inside the body.
    pub by_ref: bool,
    /// Source position.
    pub pos: u32,
}

/// A function definition or declaration.
#[derive(Clone, Debug)]
pub struct FnDecl {
    /// Dense id assigned by the parser; the cross-pass key.
    pub ast_id: u32,
    /// Function name.
    pub name: String,
    /// Return type string; `"void"` when omitted.
    pub ret_ty: String,
    /// Parameters.
    pub params: Vec<Param>,
    /// Trailing `...`.
    pub variadic: bool,
    /// Declared with `export`.
    pub exported: bool,
    /// `None` for a body-less declaration, which becomes an import when
    /// imports are allowed.
    pub body: Option<Block>,
    /// Source position of the declaration.
    pub pos: u32,
    /// Line of the declaration, for debug info and error messages.
    pub line: u32,
    /// Byte offset of that line.
    pub line_offset: u32,
}

/// A struct member declaration.
#[derive(Clone, Debug)]
pub struct MemberDecl {
    /// Member name.
    pub name: String,
    /// Member type string.
    pub ty: String,
    /// Source position.
    pub pos: u32,
}

/// A statement.
#[derive(Clone, Debug)]
pub enum Stmt {
    /// `var T name [= init];` or `static T name;`
    Var {
        name: String,
        ty: String,
        is_static: bool,
        init: Option<Expr>,
        pos: u32,
    },
    /// `struct name { T m; ... }`
    Struct { name: String, members: Vec<MemberDecl>, pos: u32 },
    /// A nested function definition or declaration.
    Fn(FnDecl),
    /// An expression evaluated for effect.
    Expr(Expr),
    /// `if cond { } [else { }]`
    If {
        cond: Expr,
        then_blk: Block,
        else_blk: Option<Block>,
        pos: u32,
    },
    /// `while cond { }`
    While { cond: Expr, body: Block, pos: u32 },
    /// `return [expr];`
    Return { value: Option<Expr>, pos: u32 },
    /// `name:` — a branch target.
    Label { name: String, pos: u32 },
    /// `goto name;`
    Goto { name: String, pos: u32 },
    /// `asm("...");` — verbatim machine code bytes.
    Asm { bytes: Vec<u8>, pos: u32 },
    /// A nested block with its own scope.
    Block(Block),
}

/// A brace-delimited block.
#[derive(Clone, Debug)]
pub struct Block {
    /// Statements in order.
    pub stmts: Vec<Stmt>,
    /// Position of the opening brace.
    pub pos: u32,
}

/// A parsed program: the root function's body plus the total number of
/// function nodes, which sizes the cross-pass function tables.
#[derive(Clone, Debug)]
pub struct Program {
    /// Statements of the root function.
    pub root: Block,
    /// Number of `FnDecl` nodes in the whole tree.
    pub fn_count: u32,
}
