//! Recursive-descent parser for the Davit source language.
//!
//! Produces the [`ast`](super::ast) the analyzer walks. The grammar is
//! deliberately plain; anything clever lives downstream. Types are
//! parsed straight into canonical type strings.

use super::ast::*;
use super::lex::{Tok, Token};
use crate::error::{CompileError, CompileResult};

/// Parse a token stream into a program.
pub fn parse(tokens: Vec<Token>) -> CompileResult<Program> {
    let mut p = Parser {
        toks: tokens,
        idx: 0,
        fn_count: 0,
    };
    let mut stmts = Vec::new();
    while !p.at_eof() {
        stmts.push(p.stmt()?);
    }
    Ok(Program {
        root: Block { stmts, pos: 0 },
        fn_count: p.fn_count,
    })
}

struct Parser {
    toks: Vec<Token>,
    idx: usize,
    fn_count: u32,
}

impl Parser {
    fn cur(&self) -> &Token {
        &self.toks[self.idx]
    }

    fn nth(&self, n: usize) -> &Tok {
        &self.toks[(self.idx + n).min(self.toks.len() - 1)].tok
    }

    fn at_eof(&self) -> bool {
        matches!(self.cur().tok, Tok::Eof)
    }

    fn pos(&self) -> u32 {
        self.cur().pos
    }

    fn bump(&mut self) -> Token {
        let t = self.toks[self.idx].clone();
        if self.idx + 1 < self.toks.len() {
            self.idx += 1;
        }
        t
    }

    fn err(&self, msg: impl Into<String>) -> CompileError {
        CompileError::Syntax(format!("line {}: {}", self.cur().line, msg.into()))
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if matches!(&self.cur().tok, Tok::Punct(q) if *q == p) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> CompileResult<()> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.err(format!("expected `{p}`")))
        }
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(&self.cur().tok, Tok::Ident(s) if s == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> CompileResult<String> {
        match self.bump().tok {
            Tok::Ident(s) => Ok(s),
            other => Err(self.err(format!("expected identifier, found {other:?}"))),
        }
    }

    /// Parse a type into its canonical string: base name plus any number
    /// of `*` and `[N]` suffixes, and optionally a function-pointer
    /// parameter list.
    fn type_string(&mut self) -> CompileResult<String> {
        let mut ty = self.ident()?;
        loop {
            if self.eat_punct("*") {
                ty.push('*');
            } else if matches!(self.cur().tok, Tok::Punct("["))
                && matches!(self.nth(1), Tok::Number(_))
            {
                self.bump();
                let count = match self.bump().tok {
                    Tok::Number(n) => n,
                    _ => unreachable!(),
                };
                self.expect_punct("]")?;
                ty.push('[');
                ty.push_str(&count.to_string());
                ty.push(']');
            } else if matches!(self.cur().tok, Tok::Punct("("))
                && matches!(self.nth(1), Tok::Ident(_) | Tok::Punct(")" | "..."))
            {
                // A function-pointer type: `ret(t1,t2,...)`.
                self.bump();
                ty.push('(');
                let mut first = true;
                while !self.eat_punct(")") {
                    if !first {
                        self.expect_punct(",")?;
                        ty.push(',');
                    }
                    first = false;
                    if self.eat_punct("...") {
                        ty.push_str("...");
                        continue;
                    }
                    let inner = self.type_string()?;
                    ty.push_str(&inner);
                }
                ty.push(')');
            } else {
                break;
            }
        }
        Ok(ty)
    }

    fn block(&mut self) -> CompileResult<Block> {
        let pos = self.pos();
        self.expect_punct("{")?;
        let mut stmts = Vec::new();
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(self.err("unterminated block"));
            }
            stmts.push(self.stmt()?);
        }
        Ok(Block { stmts, pos })
    }

    fn stmt(&mut self) -> CompileResult<Stmt> {
        let pos = self.pos();
        if self.eat_kw("var") || self.at_kw("static") {
            let is_static = self.eat_kw("static");
            let ty = self.type_string()?;
            let name = self.ident()?;
            let init = if self.eat_punct("=") {
                Some(self.expr()?)
            } else {
                None
            };
            self.expect_punct(";")?;
            if is_static && init.is_some() {
                return Err(self.err("static variables cannot have initializers"));
            }
            return Ok(Stmt::Var {
                name,
                ty,
                is_static,
                init,
                pos,
            });
        }
        if self.eat_kw("struct") {
            let name = self.ident()?;
            self.expect_punct("{")?;
            let mut members = Vec::new();
            while !self.eat_punct("}") {
                let mpos = self.pos();
                let ty = self.type_string()?;
                let mname = self.ident()?;
                self.expect_punct(";")?;
                members.push(MemberDecl {
                    name: mname,
                    ty,
                    pos: mpos,
                });
            }
            return Ok(Stmt::Struct { name, members, pos });
        }
        if self.at_kw("export") || self.at_kw("fn") {
            let exported = self.eat_kw("export");
            if !self.eat_kw("fn") {
                return Err(self.err("expected `fn` after `export`"));
            }
            return Ok(Stmt::Fn(self.fn_decl(exported, pos)?));
        }
        if self.eat_kw("if") {
            let cond = self.expr()?;
            let then_blk = self.block()?;
            let else_blk = if self.eat_kw("else") {
                if self.at_kw("if") {
                    // `else if` sugars into a one-statement else block.
                    let inner_pos = self.pos();
                    let inner = self.stmt()?;
                    Some(Block {
                        stmts: vec![inner],
                        pos: inner_pos,
                    })
                } else {
                    Some(self.block()?)
                }
            } else {
                None
            };
            return Ok(Stmt::If {
                cond,
                then_blk,
                else_blk,
                pos,
            });
        }
        if self.eat_kw("while") {
            let cond = self.expr()?;
            let body = self.block()?;
            return Ok(Stmt::While { cond, body, pos });
        }
        if self.eat_kw("return") {
            let value = if matches!(self.cur().tok, Tok::Punct(";")) {
                None
            } else {
                Some(self.expr()?)
            };
            self.expect_punct(";")?;
            return Ok(Stmt::Return { value, pos });
        }
        if self.eat_kw("goto") {
            let name = self.ident()?;
            self.expect_punct(";")?;
            return Ok(Stmt::Goto { name, pos });
        }
        if self.eat_kw("asm") {
            self.expect_punct("(")?;
            let bytes = match self.bump().tok {
                Tok::Str(b) => b,
                _ => return Err(self.err("asm expects a string literal")),
            };
            self.expect_punct(")")?;
            self.expect_punct(";")?;
            return Ok(Stmt::Asm { bytes, pos });
        }
        if matches!(self.cur().tok, Tok::Punct("{")) {
            return Ok(Stmt::Block(self.block()?));
        }
        // `name:` introduces a label; anything else is an expression.
        if matches!(self.cur().tok, Tok::Ident(_)) && matches!(self.nth(1), Tok::Punct(":")) {
            let name = self.ident()?;
            self.bump(); // colon
            return Ok(Stmt::Label { name, pos });
        }
        let e = self.expr()?;
        self.expect_punct(";")?;
        Ok(Stmt::Expr(e))
    }

    fn fn_decl(&mut self, exported: bool, pos: u32) -> CompileResult<FnDecl> {
        let line = self.cur().line;
        let line_offset = self.cur().line_offset;
        let name = self.ident()?;
        self.expect_punct("(")?;
        let mut params = Vec::new();
        let mut variadic = false;
        while !self.eat_punct(")") {
            if !params.is_empty() || variadic {
                self.expect_punct(",")?;
            }
            if self.eat_punct("...") {
                variadic = true;
                continue;
            }
            if variadic {
                return Err(self.err("`...` must be the last parameter"));
            }
            let ppos = self.pos();
            let mut ty = self.type_string()?;
            let by_ref = self.eat_punct("&");
            if by_ref {
                // A by-reference parameter is stored as the pointer type;
                // uses auto-dereference it.
                ty.push('*');
            }
            let pname = if matches!(self.cur().tok, Tok::Ident(_)) {
                self.ident()?
            } else {
                String::new()
            };
            params.push(Param {
                name: pname,
                ty,
                by_ref,
                pos: ppos,
            });
        }
        let ret_ty = if matches!(self.cur().tok, Tok::Punct("{" | ";")) {
            "void".to_string()
        } else {
            self.type_string()?
        };
        let body = if self.eat_punct(";") {
            None
        } else {
            Some(self.block()?)
        };
        let ast_id = self.fn_count;
        self.fn_count += 1;
        Ok(FnDecl {
            ast_id,
            name,
            ret_ty,
            params,
            variadic,
            exported,
            body,
            pos,
            line,
            line_offset,
        })
    }

    fn expr(&mut self) -> CompileResult<Expr> {
        self.assign_expr()
    }

    fn assign_expr(&mut self) -> CompileResult<Expr> {
        let lhs = self.binary_expr(0)?;
        if matches!(self.cur().tok, Tok::Punct("=")) {
            let pos = self.pos();
            self.bump();
            let rhs = self.assign_expr()?;
            return Ok(Expr::Assign {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            });
        }
        Ok(lhs)
    }

    /// Binding power of a binary operator token, or `None`.
    fn bin_op(tok: &Tok) -> Option<(BinOp, u8)> {
        let Tok::Punct(p) = tok else { return None };
        Some(match *p {
            "==" => (BinOp::Eq, 1),
            "!=" => (BinOp::Ne, 1),
            "<" => (BinOp::Lt, 1),
            "<=" => (BinOp::Le, 1),
            ">" => (BinOp::Gt, 1),
            ">=" => (BinOp::Ge, 1),
            "|" => (BinOp::BitOr, 2),
            "^" => (BinOp::BitXor, 3),
            "&" => (BinOp::BitAnd, 4),
            "<<" => (BinOp::Shl, 5),
            ">>" => (BinOp::Shr, 5),
            "+" => (BinOp::Add, 6),
            "-" => (BinOp::Sub, 6),
            "*" => (BinOp::Mul, 7),
            "/" => (BinOp::Div, 7),
            "%" => (BinOp::Rem, 7),
            _ => return None,
        })
    }

    fn binary_expr(&mut self, min_bp: u8) -> CompileResult<Expr> {
        let mut lhs = self.unary_expr()?;
        while let Some((op, bp)) = Self::bin_op(&self.cur().tok) {
            if bp < min_bp {
                break;
            }
            let pos = self.pos();
            self.bump();
            let rhs = self.binary_expr(bp + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> CompileResult<Expr> {
        let pos = self.pos();
        let op = match &self.cur().tok {
            Tok::Punct("-") => Some(UnOp::Neg),
            Tok::Punct("~") => Some(UnOp::Not),
            Tok::Punct("!") => Some(UnOp::LogicalNot),
            Tok::Punct("&") => Some(UnOp::Addr),
            Tok::Punct("*") => Some(UnOp::Deref),
            _ => None,
        };
        if let Some(op) = op {
            self.bump();
            let expr = self.unary_expr()?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
                pos,
            });
        }
        self.postfix_expr()
    }

    fn postfix_expr(&mut self) -> CompileResult<Expr> {
        let mut e = self.primary_expr()?;
        loop {
            if matches!(self.cur().tok, Tok::Punct("(")) {
                let pos = self.pos();
                self.bump();
                let mut args = Vec::new();
                while !self.eat_punct(")") {
                    if !args.is_empty() {
                        self.expect_punct(",")?;
                    }
                    args.push(self.expr()?);
                }
                e = match e {
                    Expr::Ident { ref name, pos: ipos } if name == "pagealloc" => {
                        Expr::IntrinsicCall {
                            which: Intrinsic::PageAlloc,
                            args,
                            pos: ipos,
                        }
                    }
                    Expr::Ident { ref name, pos: ipos } if name == "pagefree" => {
                        Expr::IntrinsicCall {
                            which: Intrinsic::PageFree,
                            args,
                            pos: ipos,
                        }
                    }
                    callee => Expr::Call {
                        callee: Box::new(callee),
                        args,
                        pos,
                    },
                };
            } else if matches!(self.cur().tok, Tok::Punct(".")) {
                let pos = self.pos();
                self.bump();
                let field = self.ident()?;
                e = Expr::Member {
                    base: Box::new(e),
                    field,
                    pos,
                };
            } else if matches!(self.cur().tok, Tok::Punct("[")) {
                let pos = self.pos();
                self.bump();
                let index = self.expr()?;
                self.expect_punct("]")?;
                e = Expr::Index {
                    base: Box::new(e),
                    index: Box::new(index),
                    pos,
                };
            } else {
                break;
            }
        }
        Ok(e)
    }

    fn primary_expr(&mut self) -> CompileResult<Expr> {
        let pos = self.pos();
        match self.bump().tok {
            Tok::Number(value) => Ok(Expr::Number { value, pos }),
            Tok::Str(bytes) => Ok(Expr::Str { bytes, pos }),
            Tok::Ident(name) => Ok(Expr::Ident { name, pos }),
            Tok::Punct("(") => {
                let e = self.expr()?;
                self.expect_punct(")")?;
                Ok(e)
            }
            other => Err(self.err(format!("expected expression, found {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lex::tokenize;
    use rustc_hash::FxHashMap;

    fn parse_src(src: &str) -> Program {
        parse(tokenize(src, &FxHashMap::default()).unwrap()).unwrap()
    }

    #[test]
    fn function_with_params() {
        let p = parse_src("fn add(uint a, uint b) uint { return a + b; }");
        assert_eq!(p.fn_count, 1);
        let Stmt::Fn(f) = &p.root.stmts[0] else {
            panic!("expected fn");
        };
        assert_eq!(f.name, "add");
        assert_eq!(f.ret_ty, "uint");
        assert_eq!(f.params.len(), 2);
        assert!(f.body.is_some());
    }

    #[test]
    fn byref_param_becomes_pointer() {
        let p = parse_src("fn inc(uint& x) { x = x + 1; }");
        let Stmt::Fn(f) = &p.root.stmts[0] else {
            panic!("expected fn");
        };
        assert!(f.params[0].by_ref);
        assert_eq!(f.params[0].ty, "uint*");
    }

    #[test]
    fn declaration_without_body() {
        let p = parse_src("fn getchar() uint;");
        let Stmt::Fn(f) = &p.root.stmts[0] else {
            panic!("expected fn");
        };
        assert!(f.body.is_none());
    }

    #[test]
    fn precedence() {
        let p = parse_src("fn f() { var uint x = 1 + 2 * 3; }");
        let Stmt::Fn(f) = &p.root.stmts[0] else {
            panic!("expected fn");
        };
        let Stmt::Var { init: Some(Expr::Binary { op, .. }), .. } = &f.body.as_ref().unwrap().stmts[0]
        else {
            panic!("expected var with binary init");
        };
        assert_eq!(*op, BinOp::Add);
    }

    #[test]
    fn labels_and_goto() {
        let p = parse_src("fn f() { again: goto again; }");
        let Stmt::Fn(f) = &p.root.stmts[0] else {
            panic!("expected fn");
        };
        let body = f.body.as_ref().unwrap();
        assert!(matches!(body.stmts[0], Stmt::Label { .. }));
        assert!(matches!(body.stmts[1], Stmt::Goto { .. }));
    }

    #[test]
    fn variadic_marker() {
        let p = parse_src("fn log(u8* fmt, ...) ;");
        let Stmt::Fn(f) = &p.root.stmts[0] else {
            panic!("expected fn");
        };
        assert!(f.variadic);
        assert_eq!(f.params.len(), 1);
    }
}
