//! Front end: lexer, parser, and the AST handed to the analyzer.
//!
//! The front end runs once; both analyzer passes walk the same tree.

pub mod ast;
pub mod lex;
pub mod parse;

use crate::error::CompileResult;
use rustc_hash::FxHashMap;

/// Lex and parse `source` with the given predeclared macros.
pub fn parse_source(source: &str, macros: &FxHashMap<String, String>) -> CompileResult<ast::Program> {
    let tokens = lex::tokenize(source, macros)?;
    parse::parse(tokens)
}
