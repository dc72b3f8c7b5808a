//! Error types shared by every layer of the runtime.
//!
//! Command-level failures (non-zero exits, security violations) are carried
//! inside `CommandResult`; a [`ShellError`] aborts the current `execute` call.

use std::collections::HashMap;
use std::fmt;

use shrun_parser::ParseError;

/// Result type for all shrun operations
pub type ShellResult<T> = Result<T, ShellError>;

/// Main error type for all shrun operations
#[derive(Debug, Clone)]
pub struct ShellError {
    pub kind: ErrorKind,
    pub message: String,
    // Boxed to keep the error small; most errors carry no context at all
    pub context: Box<HashMap<String, String>>,
}

/// Categories of errors that can occur while running a script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid input")]
    InvalidInput,
    #[error("execution failed")]
    ExecutionFailed,
    #[error("timeout")]
    Timeout,
    #[error("file not found")]
    FileNotFound,
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error("parse error")]
    Parse,
    #[error("security violation")]
    Security,
    #[error("I/O error")]
    Io,
    #[error("configuration error")]
    Config,
}

impl ShellError {
    /// Create a new shell error
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Box::new(HashMap::new()),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, message)
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionFailed, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Security, message)
    }

    pub fn file_not_found(path: &str) -> Self {
        Self::new(ErrorKind::FileNotFound, format!("File '{path}' not found"))
            .with_context("path", path)
    }

    /// Add context information to the error
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }
}

impl fmt::Display for ShellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;

        if !self.context.is_empty() {
            // sorted so the rendering is stable
            let mut entries: Vec<_> = self.context.iter().collect();
            entries.sort();
            write!(f, " (")?;
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}: {value}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for ShellError {}

impl From<std::io::Error> for ShellError {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                ErrorKind::InvalidInput
            }
            _ => ErrorKind::Io,
        };
        ShellError::new(kind, err.to_string())
    }
}

impl From<ParseError> for ShellError {
    fn from(err: ParseError) -> Self {
        let line = err.line();
        let error = ShellError::new(ErrorKind::Parse, err.to_string());
        match line {
            Some(line) => error.with_context("line", line.to_string()),
            None => error,
        }
    }
}

impl From<toml::de::Error> for ShellError {
    fn from(err: toml::de::Error) -> Self {
        ShellError::new(ErrorKind::Config, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_message_and_sorted_context() {
        let err = ShellError::execution_failed("boom")
            .with_context("node", "while")
            .with_context("line", "3");
        assert_eq!(err.to_string(), "execution failed: boom (line: 3, node: while)");
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let not_found: ShellError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert_eq!(not_found.kind, ErrorKind::FileNotFound);

        let other: ShellError = std::io::Error::new(std::io::ErrorKind::Other, "x").into();
        assert_eq!(other.kind, ErrorKind::Io);
    }

    #[test]
    fn parse_errors_keep_line_context() {
        let parse = ParseError::Unexpected {
            token: "fi".into(),
            line: 7,
        };
        let err: ShellError = parse.into();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert_eq!(err.context.get("line").map(String::as_str), Some("7"));
    }
}
