use shrun_core::ShellError;
use shrun_parser::ParseError;

/// Failures of a debug [`Session`](crate::Session).
#[derive(Debug, thiserror::Error)]
pub enum DebugError {
    #[error("script not loaded")]
    NotLoaded,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Engine(#[from] ShellError),
    #[error("line {line}: unsupported node type: {kind}")]
    UnsupportedNode { kind: &'static str, line: usize },
}

/// Transport failures of the DAP server.
#[derive(Debug, thiserror::Error)]
pub enum DapError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid header: {0}")]
    Header(String),
}
