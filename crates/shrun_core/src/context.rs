//! Cancellation and deadlines for a single run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{ShellError, ShellResult};

/// Carried through every engine call. Cloning shares the cancel flag.
#[derive(Debug, Clone, Default)]
pub struct ExecContext {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Share an externally owned cancel flag, e.g. one flipped by a signal handler.
    pub fn with_cancel_flag(flag: Arc<AtomicBool>) -> Self {
        Self {
            cancelled: flag,
            deadline: None,
        }
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// `Err(Timeout)` once cancelled or past the deadline.
    pub fn check(&self) -> ShellResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ShellError::timeout("execution cancelled"));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ShellError::timeout("deadline exceeded"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn fresh_context_is_live() {
        let ctx = ExecContext::new();
        assert!(!ctx.is_cancelled());
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn cancel_is_shared_between_clones() {
        let ctx = ExecContext::new();
        let clone = ctx.clone();
        clone.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.check().unwrap_err().kind, ErrorKind::Timeout);
    }

    #[test]
    fn deadline_expires() {
        let ctx = ExecContext::with_timeout(Duration::ZERO);
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.check().unwrap_err().message, "deadline exceeded");
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn external_flag_drives_cancellation() {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = ExecContext::with_cancel_flag(Arc::clone(&flag));
        flag.store(true, Ordering::SeqCst);
        assert!(ctx.is_cancelled());
    }
}
