//! shrun core: execution engine and runtime services.
//!
//! The [`ExecutionEngine`] walks a parsed [`shrun_parser::ScriptNode`],
//! dispatching each command to the in-process standard library, a user
//! function, a module export or an external process.

// Lightweight logging facade macros: call sites stay, formatting is stripped in minimal builds.
// Defined before the module declarations so every module can use them unqualified.
#[cfg(feature = "minimal-logging")]
#[macro_export]
macro_rules! shrun_log_debug { ($($tt:tt)*) => { /* stripped in minimal build */ }; }
#[cfg(not(feature = "minimal-logging"))]
#[macro_export]
macro_rules! shrun_log_debug { ($($tt:tt)*) => { tracing::debug!($($tt)*); }; }

#[cfg(feature = "minimal-logging")]
#[macro_export]
macro_rules! shrun_log_info { ($($tt:tt)*) => { /* stripped */ }; }
#[cfg(not(feature = "minimal-logging"))]
#[macro_export]
macro_rules! shrun_log_info { ($($tt:tt)*) => { tracing::info!($($tt)*); }; }

#[cfg(feature = "minimal-logging")]
#[macro_export]
macro_rules! shrun_log_warn { ($($tt:tt)*) => { /* stripped */ }; }
#[cfg(not(feature = "minimal-logging"))]
#[macro_export]
macro_rules! shrun_log_warn { ($($tt:tt)*) => { tracing::warn!($($tt)*); }; }

#[cfg(feature = "minimal-logging")]
#[macro_export]
macro_rules! shrun_log_error { ($($tt:tt)*) => { /* stripped */ }; }
#[cfg(not(feature = "minimal-logging"))]
#[macro_export]
macro_rules! shrun_log_error { ($($tt:tt)*) => { tracing::error!($($tt)*); }; }

// Public modules
pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod env;
pub mod error;
pub mod expand;
pub mod job;
#[cfg(feature = "logging")]
pub mod logging;
pub mod module;
pub mod pool;
pub mod result;
pub mod security;
pub mod stdlib;

pub use cache::{CacheStats, CommandCache};
pub use config::{DefaultMode, EngineConfig};
pub use context::ExecContext;
pub use engine::{EngineBuilder, EngineStats, ExecutionEngine};
pub use env::{EnvStore, EnvironmentManager, ScopeChain};
pub use error::{ErrorKind, ShellError, ShellResult};
pub use job::{JobId, JobInfo, JobStatus, JobTable};
pub use module::{Module, ModuleManager, ModuleRegistry};
pub use pool::{ProcessEntry, ProcessPool, PooledProcess};
pub use result::{CommandResult, ExecutionMode, ExecutionResult, PipelineResult};
pub use security::{SandboxPolicy, SecurityChecker};
pub use stdlib::{StdFunction, StdLib};
