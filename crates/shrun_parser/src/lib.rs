#![doc = "Script parser turning shrun source text into an AST."]

pub mod ast;
pub mod lexer;
mod simple;

use std::path::{Path, PathBuf};

pub use ast::{Command, FunctionDef, Node, Position, Redirect, RedirectOp, ScriptNode};
pub use simple::SimpleParser;

/// Errors produced while turning source text into a [`ScriptNode`].
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: unterminated {construct} (expected `{expected}`)")]
    Unterminated {
        construct: &'static str,
        expected: String,
        line: usize,
    },
    #[error("line {line}: unexpected `{token}`")]
    Unexpected { token: String, line: usize },
    #[error("line {line}: {message}")]
    Invalid { message: String, line: usize },
}

impl ParseError {
    /// Line the error was reported on, if any.
    pub fn line(&self) -> Option<usize> {
        match self {
            ParseError::Io { .. } => None,
            ParseError::Unterminated { line, .. }
            | ParseError::Unexpected { line, .. }
            | ParseError::Invalid { line, .. } => Some(*line),
        }
    }
}

/// Source-to-AST contract consumed by the engine and the debugger.
pub trait Parser: Send + Sync {
    fn parse_string(&self, source: &str) -> Result<ScriptNode, ParseError>;

    fn parse_file(&self, path: &Path) -> Result<ScriptNode, ParseError> {
        let source = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse_string(&source)
    }
}

/// Parse source text with the default [`SimpleParser`].
pub fn parse(input: &str) -> Result<ScriptNode, ParseError> {
    SimpleParser::new().parse_string(input)
}
