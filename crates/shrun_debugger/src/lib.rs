//! Debugging support for shrun scripts.
//!
//! [`Session`] steps through the top-level statements of a script and
//! stops on entry, on breakpoints and after single steps. [`DapServer`]
//! exposes a session to editors over the Debug Adapter Protocol.

pub mod codec;
pub mod dap;
pub mod error;
pub mod session;

pub use dap::DapServer;
pub use error::{DapError, DebugError};
pub use session::{RunMode, Session, StopReason};
