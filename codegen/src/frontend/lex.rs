//! Lexer for the Davit source language.
//!
//! Produces a flat token stream with byte positions and line tracking, so
//! diagnostics and instruction debug triples can point back into the
//! file. Host-predeclared macros are substituted here, textually, before
//! the parser ever sees the stream.

use crate::error::{CompileError, CompileResult};
use rustc_hash::FxHashMap;

/// A token kind.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Tok {
    /// Identifier or keyword.
    Ident(String),
    /// Integer literal, already parsed.
    Number(u64),
    /// String literal, escapes resolved.
    Str(Vec<u8>),
    /// One of the fixed punctuation/operator spellings.
    Punct(&'static str),
    /// End of input.
    Eof,
}

/// A token with its source position.
#[derive(Clone, Debug)]
pub struct Token {
    /// The token itself.
    pub tok: Tok,
    /// Byte offset in the preprocessed source.
    pub pos: u32,
    /// 1-based line number.
    pub line: u32,
    /// Byte offset of the start of the line.
    pub line_offset: u32,
}

/// Multi-character operators, longest first so maximal munch works.
const PUNCTS: &[&str] = &[
    "<<", ">>", "==", "!=", "<=", ">=", "->", "...", "&&", "||", "(", ")", "{", "}", "[", "]",
    ",", ";", ":", "=", "+", "-", "*", "/", "%", "&", "|", "^", "~", "!", "<", ">", ".",
];

/// Tokenize `source`. `macros` maps predeclared macro names to their
/// replacement text; replacements are lexed in place and must not span
/// lines.
pub fn tokenize(source: &str, macros: &FxHashMap<String, String>) -> CompileResult<Vec<Token>> {
    let mut lexer = Lexer {
        src: source.as_bytes(),
        pos: 0,
        line: 1,
        line_offset: 0,
        tokens: Vec::new(),
    };
    lexer.run(macros)?;
    Ok(lexer.tokens)
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    line_offset: u32,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn err(&self, msg: impl Into<String>) -> CompileError {
        CompileError::Syntax(format!("line {}: {}", self.line, msg.into()))
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.line_offset = self.pos as u32;
        }
        Some(c)
    }

    fn push(&mut self, tok: Tok, pos: usize) {
        self.tokens.push(Token {
            tok,
            pos: pos as u32,
            line: self.line,
            line_offset: self.line_offset,
        });
    }

    fn run(&mut self, macros: &FxHashMap<String, String>) -> CompileResult<()> {
        while let Some(c) = self.peek() {
            let start = self.pos;
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.bump();
                }
                b'#' => {
                    // Line comment.
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                b'0'..=b'9' => {
                    let n = self.number()?;
                    self.push(Tok::Number(n), start);
                }
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                    let ident = self.ident();
                    if let Some(content) = macros.get(&ident) {
                        self.splice_macro(content, start, macros)?;
                    } else {
                        self.push(Tok::Ident(ident), start);
                    }
                }
                b'"' => {
                    let bytes = self.string()?;
                    self.push(Tok::Str(bytes), start);
                }
                _ => {
                    let rest = &self.src[self.pos..];
                    let Some(p) = PUNCTS.iter().find(|p| rest.starts_with(p.as_bytes())) else {
                        return Err(self.err(format!("unexpected character `{}`", c as char)));
                    };
                    for _ in 0..p.len() {
                        self.bump();
                    }
                    self.push(Tok::Punct(p), start);
                }
            }
        }
        let pos = self.pos;
        self.push(Tok::Eof, pos);
        Ok(())
    }

    fn number(&mut self) -> CompileResult<u64> {
        let start = self.pos;
        let radix = if self.src[self.pos..].starts_with(b"0x") || self.src[self.pos..].starts_with(b"0X") {
            self.bump();
            self.bump();
            16
        } else {
            10
        };
        let digits_start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        let text: String = self.src[digits_start..self.pos]
            .iter()
            .map(|&b| b as char)
            .filter(|&c| c != '_')
            .collect();
        u64::from_str_radix(&text, radix).map_err(|_| {
            let lit: String = self.src[start..self.pos].iter().map(|&b| b as char).collect();
            self.err(format!("bad integer literal `{lit}`"))
        })
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.bump();
            } else {
                break;
            }
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    fn string(&mut self) -> CompileResult<Vec<u8>> {
        self.bump(); // opening quote
        let mut bytes = Vec::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(self.err("unterminated string literal"));
            };
            match c {
                b'"' => break,
                b'\\' => {
                    let Some(esc) = self.bump() else {
                        return Err(self.err("unterminated escape"));
                    };
                    match esc {
                        b'n' => bytes.push(b'\n'),
                        b't' => bytes.push(b'\t'),
                        b'r' => bytes.push(b'\r'),
                        b'0' => bytes.push(0),
                        b'\\' => bytes.push(b'\\'),
                        b'"' => bytes.push(b'"'),
                        b'x' => {
                            let hi = self.bump().ok_or_else(|| self.err("truncated \\x escape"))?;
                            let lo = self.bump().ok_or_else(|| self.err("truncated \\x escape"))?;
                            let hex = [hi, lo];
                            let text = core::str::from_utf8(&hex)
                                .ok()
                                .and_then(|s| u8::from_str_radix(s, 16).ok());
                            match text {
                                Some(b) => bytes.push(b),
                                None => return Err(self.err("bad \\x escape")),
                            }
                        }
                        _ => return Err(self.err(format!("unknown escape `\\{}`", esc as char))),
                    }
                }
                _ => bytes.push(c),
            }
        }
        Ok(bytes)
    }

    /// Lex a macro's replacement text in place. The spliced tokens keep
    /// the use site's position so diagnostics stay anchored.
    fn splice_macro(
        &mut self,
        content: &str,
        use_pos: usize,
        macros: &FxHashMap<String, String>,
    ) -> CompileResult<()> {
        let inner = tokenize(content, macros)?;
        for t in inner {
            if t.tok == Tok::Eof {
                break;
            }
            self.tokens.push(Token {
                tok: t.tok,
                pos: use_pos as u32,
                line: self.line,
                line_offset: self.line_offset,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Tok> {
        tokenize(src, &FxHashMap::default())
            .unwrap()
            .into_iter()
            .map(|t| t.tok)
            .collect()
    }

    #[test]
    fn basic_tokens() {
        let toks = lex("fn main() { var uint x = 0x2a; }");
        assert!(matches!(&toks[0], Tok::Ident(s) if s == "fn"));
        assert!(toks.contains(&Tok::Number(42)));
        assert!(toks.contains(&Tok::Punct("{")));
    }

    #[test]
    fn comments_and_lines() {
        let toks = tokenize("x # comment\ny", &FxHashMap::default()).unwrap();
        assert_eq!(toks.len(), 3);
        assert_eq!(toks[1].line, 2);
    }

    #[test]
    fn string_escapes() {
        let toks = lex(r#""a\x41\n\0""#);
        assert_eq!(toks[0], Tok::Str(vec![b'a', 0x41, b'\n', 0]));
    }

    #[test]
    fn macro_substitution() {
        let mut macros = FxHashMap::default();
        macros.insert("LIMIT".to_string(), "64".to_string());
        let toks = tokenize("var uint x = LIMIT;", &macros).unwrap();
        assert!(toks.iter().any(|t| t.tok == Tok::Number(64)));
    }

    #[test]
    fn maximal_munch() {
        let toks = lex("a <= b << c");
        assert!(toks.contains(&Tok::Punct("<=")));
        assert!(toks.contains(&Tok::Punct("<<")));
    }
}
