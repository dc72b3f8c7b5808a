//! Tokenizer for a single script line.
//!
//! Quotes are resolved here: a quoted run becomes part of the surrounding
//! word with the quote characters removed. Command substitutions (`$(...)`
//! and backticks) are kept verbatim inside the word so the engine can expand
//! them later.

use crate::ast::RedirectOp;
use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Word(String),
    Pipe,        // `|`
    Or,          // `||`
    And,         // `&&`
    Ampersand,   // trailing `&`
    Semicolon,   // `;`
    Redirect { op: RedirectOp, fd: i32 },
    HeredocStart(String), // `<<DELIM` (captures delimiter)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: std::ops::Range<usize>,
}

impl Token {
    fn new(kind: TokenKind, start: usize, end: usize) -> Self {
        Self {
            kind,
            span: start..end,
        }
    }

    pub fn word(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Word(w) => Some(w),
            _ => None,
        }
    }
}

struct Cursor<'a> {
    input: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn pos(&mut self) -> usize {
        self.chars.peek().map(|(i, _)| *i).unwrap_or(self.input.len())
    }

    fn bump(&mut self) -> Option<char> {
        self.chars.next().map(|(_, c)| c)
    }

    fn rest(&mut self) -> &'a str {
        let pos = self.pos();
        &self.input[pos..]
    }

    fn eat(&mut self, s: &str) -> bool {
        if self.rest().starts_with(s) {
            for _ in s.chars() {
                self.bump();
            }
            true
        } else {
            false
        }
    }
}

/// Tokenize one line of input.
pub fn tokenize(input: &str) -> Vec<Token> {
    let mut cur = Cursor::new(input);
    let mut tokens = Vec::new();

    while let Some(c) = cur.peek() {
        let start = cur.pos();
        let kind = match c {
            ' ' | '\t' | '\r' | '\n' => {
                cur.bump();
                continue;
            }
            '|' => {
                cur.bump();
                if cur.peek() == Some('|') {
                    cur.bump();
                    TokenKind::Or
                } else {
                    TokenKind::Pipe
                }
            }
            ';' => {
                cur.bump();
                TokenKind::Semicolon
            }
            '&' => {
                cur.bump();
                match cur.peek() {
                    Some('&') => {
                        cur.bump();
                        TokenKind::And
                    }
                    Some('>') => {
                        cur.bump();
                        TokenKind::Redirect { op: RedirectOp::All, fd: 1 }
                    }
                    _ => TokenKind::Ampersand,
                }
            }
            '<' => {
                cur.bump();
                if cur.peek() == Some('<') {
                    cur.bump();
                    let _ = cur.eat("-");
                    while matches!(cur.peek(), Some(' ') | Some('\t')) {
                        cur.bump();
                    }
                    let delim = read_word(&mut cur);
                    TokenKind::HeredocStart(delim)
                } else {
                    TokenKind::Redirect { op: RedirectOp::In, fd: 0 }
                }
            }
            '>' => {
                cur.bump();
                output_redirect(&mut cur, 1)
            }
            '1' | '2' if cur.rest()[1..].starts_with('>') => {
                let fd = if c == '2' { 2 } else { 1 };
                cur.bump();
                cur.bump();
                if fd == 2 && cur.eat("&1") {
                    TokenKind::Redirect { op: RedirectOp::StderrToStdout, fd: 2 }
                } else {
                    output_redirect(&mut cur, fd)
                }
            }
            _ => TokenKind::Word(read_word(&mut cur)),
        };
        let end = cur.pos();
        tokens.push(Token::new(kind, start, end));
    }
    tokens
}

fn output_redirect(cur: &mut Cursor<'_>, fd: i32) -> TokenKind {
    if cur.peek() == Some('>') {
        cur.bump();
        TokenKind::Redirect { op: RedirectOp::Append, fd }
    } else {
        TokenKind::Redirect { op: RedirectOp::Out, fd }
    }
}

/// Read a word up to the next unquoted separator or operator.
fn read_word(cur: &mut Cursor<'_>) -> String {
    let mut buf = String::new();
    while let Some(ch) = cur.peek() {
        match ch {
            '"' | '\'' => {
                cur.bump();
                while let Some(inner) = cur.bump() {
                    if inner == ch {
                        break;
                    }
                    buf.push(inner);
                }
            }
            '$' if cur.rest().starts_with("$(") => {
                // keep the substitution intact, including nested parens
                let mut depth = 0usize;
                while let Some(inner) = cur.bump() {
                    buf.push(inner);
                    match inner {
                        '(' => depth += 1,
                        ')' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }
            '`' => {
                buf.push(ch);
                cur.bump();
                while let Some(inner) = cur.bump() {
                    buf.push(inner);
                    if inner == '`' {
                        break;
                    }
                }
            }
            c if c.is_whitespace() || "|;&<>".contains(c) => break,
            _ => {
                buf.push(ch);
                cur.bump();
            }
        }
    }
    buf
}
