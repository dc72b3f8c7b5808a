//! Background job tracking.
//!
//! A job is a command running on its own thread. The table keeps the join
//! handle until the job is polled or waited on, after which the final
//! [`CommandResult`] is stored in place of the handle.

use std::collections::BTreeMap;
use std::fmt;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::context::ExecContext;
use crate::error::{ShellError, ShellResult};
use crate::result::{CommandResult, ExecutionMode};

/// Job identifier type
pub type JobId = u32;

/// Job status enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Job is currently running
    Running,
    /// Job finished with an exit code
    Done(i32),
    /// Job was killed through [`JobTable::kill`]
    Terminated,
    /// Job thread died without producing a result
    Failed(String),
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Done(code) => write!(f, "Done ({})", code),
            JobStatus::Terminated => write!(f, "Terminated"),
            JobStatus::Failed(msg) => write!(f, "Failed: {}", msg),
        }
    }
}

/// Snapshot of a job for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: JobId,
    pub command: String,
    pub pid: Option<u32>,
    pub status: JobStatus,
    pub runtime: Duration,
}

impl fmt::Display for JobInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} {}", self.id, self.status, self.command)
    }
}

struct Job {
    command: String,
    pid: Option<u32>,
    started_at: Instant,
    completed_at: Option<Instant>,
    status: JobStatus,
    ctx: ExecContext,
    handle: Option<JoinHandle<CommandResult>>,
    result: Option<CommandResult>,
    killed: bool,
}

impl Job {
    fn info(&self, id: JobId) -> JobInfo {
        let end = self.completed_at.unwrap_or_else(Instant::now);
        JobInfo {
            id,
            command: self.command.clone(),
            pid: self.pid,
            status: self.status.clone(),
            runtime: end.duration_since(self.started_at),
        }
    }

    fn finish(&mut self, result: CommandResult) {
        self.status = if self.killed {
            JobStatus::Terminated
        } else {
            JobStatus::Done(result.exit_code)
        };
        self.completed_at = Some(Instant::now());
        self.result = Some(result);
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(result) => self.finish(result),
                Err(_) => {
                    self.status = JobStatus::Failed("job thread panicked".into());
                    self.completed_at = Some(Instant::now());
                    self.result = Some(CommandResult::failure(
                        self.command.clone(),
                        ExecutionMode::Process,
                        1,
                        "job thread panicked",
                    ));
                }
            }
        }
    }

    /// Collect the result if the thread is done, without blocking.
    fn refresh(&mut self) {
        if self.handle.as_ref().is_some_and(JoinHandle::is_finished) {
            self.join();
        }
    }
}

/// Jobs owned by one engine, numbered from 1.
pub struct JobTable {
    jobs: BTreeMap<JobId, Job>,
    next_id: JobId,
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            jobs: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn allocate(&mut self) -> JobId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Track a running job. `ctx` is the job's own context; cancelling it
    /// stops the job.
    pub fn insert(
        &mut self,
        command: impl Into<String>,
        pid: Option<u32>,
        ctx: ExecContext,
        handle: JoinHandle<CommandResult>,
    ) -> JobId {
        let id = self.allocate();
        let command = command.into();
        shrun_log_debug!(job = id, command = %command, ?pid, "background job started");
        self.jobs.insert(
            id,
            Job {
                command,
                pid,
                started_at: Instant::now(),
                completed_at: None,
                status: JobStatus::Running,
                ctx,
                handle: Some(handle),
                result: None,
                killed: false,
            },
        );
        id
    }

    /// Record a job that already ran to completion.
    pub fn insert_finished(&mut self, command: impl Into<String>, result: CommandResult) -> JobId {
        let id = self.allocate();
        let now = Instant::now();
        let mut job = Job {
            command: command.into(),
            pid: None,
            started_at: now.checked_sub(result.duration).unwrap_or(now),
            completed_at: None,
            status: JobStatus::Running,
            ctx: ExecContext::new(),
            handle: None,
            result: None,
            killed: false,
        };
        job.finish(result);
        self.jobs.insert(id, job);
        id
    }

    /// Current status without blocking; `None` for unknown ids.
    pub fn poll(&mut self, id: JobId) -> Option<JobStatus> {
        let job = self.jobs.get_mut(&id)?;
        job.refresh();
        Some(job.status.clone())
    }

    /// Block until the job finishes and return its result.
    pub fn wait(&mut self, id: JobId) -> ShellResult<CommandResult> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| ShellError::invalid_input(format!("no such job: {id}")))?;
        job.join();
        job.result
            .clone()
            .ok_or_else(|| ShellError::execution_failed(format!("job {id} has no result")))
    }

    /// Wait for every job, in id order.
    pub fn wait_all(&mut self) -> Vec<(JobId, CommandResult)> {
        let ids: Vec<JobId> = self.jobs.keys().copied().collect();
        ids.into_iter()
            .filter_map(|id| self.wait(id).ok().map(|r| (id, r)))
            .collect()
    }

    /// Ask a running job to stop. The job's context is cancelled, which makes
    /// the runner kill its child; on unix the child also gets SIGTERM.
    pub fn kill(&mut self, id: JobId) -> ShellResult<()> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| ShellError::invalid_input(format!("no such job: {id}")))?;
        job.refresh();
        if job.status.is_finished() {
            return Ok(());
        }
        job.killed = true;
        job.ctx.cancel();

        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = job.pid {
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    shrun_log_debug!(job = id, pid, error = %e, "SIGTERM not delivered");
                }
            }
        }
        Ok(())
    }

    pub fn list(&mut self) -> Vec<JobInfo> {
        self.jobs
            .iter_mut()
            .map(|(id, job)| {
                job.refresh();
                job.info(*id)
            })
            .collect()
    }

    /// Drop finished jobs, returning how many were removed.
    pub fn cleanup(&mut self) -> usize {
        for job in self.jobs.values_mut() {
            job.refresh();
        }
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !job.status.is_finished());
        before - self.jobs.len()
    }

    pub fn running_count(&mut self) -> usize {
        let mut running = 0;
        for job in self.jobs.values_mut() {
            job.refresh();
            if !job.status.is_finished() {
                running += 1;
            }
        }
        running
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}
