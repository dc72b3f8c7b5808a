//! Result records produced by the engine.
//!
//! Every record is built fresh for the call that produced it and is never
//! modified once returned.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::{ShellError, ShellResult};

/// How a command was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Stdlib or user function, run in process
    Interpreted,
    /// External OS process
    Process,
    /// Interpreted first, process as fallback
    Hybrid,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Interpreted => f.write_str("interpreted"),
            ExecutionMode::Process => f.write_str("process"),
            ExecutionMode::Hybrid => f.write_str("hybrid"),
        }
    }
}

/// Outcome of a single command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    /// Command line as executed, after expansion
    pub command: String,
    pub success: bool,
    pub exit_code: i32,
    pub output: String,
    /// Captured stderr or the failure message
    pub error: String,
    pub duration: Duration,
    pub mode: ExecutionMode,
}

impl CommandResult {
    pub fn success(command: impl Into<String>, mode: ExecutionMode, output: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            success: true,
            exit_code: 0,
            output: output.into(),
            error: String::new(),
            duration: Duration::ZERO,
            mode,
        }
    }

    pub fn failure(
        command: impl Into<String>,
        mode: ExecutionMode,
        exit_code: i32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            success: false,
            exit_code,
            output: String::new(),
            error: error.into(),
            duration: Duration::ZERO,
            mode,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Success in the shell sense: the command ran and exited with 0.
    pub fn is_success(&self) -> bool {
        self.success && self.exit_code == 0
    }
}

/// Outcome of executing a script or a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub output: String,
    pub error: String,
    pub duration: Duration,
    pub commands: Vec<CommandResult>,
    pub break_flag: bool,
    pub continue_flag: bool,
}

impl ExecutionResult {
    /// Successful, empty result.
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn from_command(result: &CommandResult) -> Self {
        Self {
            success: result.success,
            exit_code: result.exit_code,
            output: result.output.clone(),
            error: result.error.clone(),
            duration: result.duration,
            commands: vec![result.clone()],
            break_flag: false,
            continue_flag: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Whether the walk that produced this result has to stop here.
    pub fn interrupts(&self) -> bool {
        self.break_flag || self.continue_flag || !self.is_success()
    }
}

/// Outcome of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub exit_code: i32,
    pub output: String,
    pub error: String,
    pub results: Vec<CommandResult>,
}

impl PipelineResult {
    pub fn into_execution(self, duration: Duration) -> ExecutionResult {
        ExecutionResult {
            success: self.success,
            exit_code: self.exit_code,
            output: self.output,
            error: self.error,
            duration,
            commands: self.results,
            break_flag: false,
            continue_flag: false,
        }
    }
}

/// Appends a newline to `output` unless it is empty or already ends in one.
pub fn push_output(buffer: &mut String, output: &str) {
    if output.is_empty() {
        return;
    }
    buffer.push_str(output);
    if !output.ends_with('\n') {
        buffer.push('\n');
    }
}

/// Extension trait adding context to fallible results.
pub trait ShellResultExt<T> {
    fn with_context(self, key: impl Into<String>, value: impl Into<String>) -> ShellResult<T>;

    fn inspect_error<F>(self, f: F) -> ShellResult<T>
    where
        F: FnOnce(&ShellError);
}

impl<T> ShellResultExt<T> for ShellResult<T> {
    fn with_context(self, key: impl Into<String>, value: impl Into<String>) -> ShellResult<T> {
        self.map_err(|e| e.with_context(key, value))
    }

    fn inspect_error<F>(self, f: F) -> ShellResult<T>
    where
        F: FnOnce(&ShellError),
    {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}
