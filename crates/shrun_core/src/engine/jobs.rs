//! Background execution and the `wait` / `jobs` commands.

use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use shrun_parser::{Command, Node, ScriptNode};

use super::process::TIMEOUT_EXIT_CODE;
use super::ExecutionEngine;
use crate::context::ExecContext;
use crate::error::{ShellError, ShellResult};
use crate::job::{JobId, JobStatus};
use crate::result::{CommandResult, ExecutionMode, ExecutionResult};

fn started(id: JobId, handle: String, duration: std::time::Duration) -> ExecutionResult {
    let result = CommandResult::success(format!("background [{id}]"), ExecutionMode::Process, format!("[{id}] {handle}"))
        .with_duration(duration);
    ExecutionResult::from_command(&result)
}

/// What a worker engine runs for a job that is not a plain process.
enum Work {
    /// Already expanded and checked
    Command(Command),
    Node(Node),
}

fn job_result(label: &str, mode: ExecutionMode, outcome: ShellResult<ExecutionResult>) -> CommandResult {
    match outcome {
        Ok(outcome) => CommandResult {
            command: label.to_string(),
            success: outcome.success,
            exit_code: outcome.exit_code,
            output: outcome.output,
            error: outcome.error,
            duration: outcome.duration,
            mode,
        },
        Err(e) => {
            let code = if e.is_timeout() { TIMEOUT_EXIT_CODE } else { 1 };
            CommandResult::failure(label, mode, code, e.to_string())
        }
    }
}

impl ExecutionEngine {
    /// Start `node` as a background job and return at once with `[id] pid`
    /// (or `[id] id` when there is no child process).
    ///
    /// Arguments of a plain command are expanded and checked here, on the
    /// caller's thread. External commands run on a job thread. Functions,
    /// stdlib calls and compound nodes run on a job thread against a worker
    /// engine that starts from a snapshot of this engine's variables and
    /// functions; what the job writes stays in the worker. Every job has its
    /// own context, so cancelling the foreground run leaves it alone.
    pub(crate) fn execute_background(&mut self, ctx: &ExecContext, node: &Node) -> ShellResult<ExecutionResult> {
        let start = Instant::now();

        let (label, work) = match node {
            Node::Command(cmd) => {
                let expanded = self.expand_command(ctx, cmd);
                if let Some(blocked) = self.check_security(&expanded) {
                    return Ok(ExecutionResult::from_command(&blocked));
                }
                if self.select_mode(&expanded.name) == ExecutionMode::Process {
                    return self.spawn_process_job(&expanded, start);
                }
                (expanded.command_line(), Work::Command(expanded))
            }
            other => (other.kind().to_string(), Work::Node(other.clone())),
        };

        let mut worker = self.background_worker();
        let job_ctx = ExecContext::new();
        let runner_ctx = job_ctx.clone();
        let job_label = label.clone();
        let handle = thread::Builder::new()
            .name("shrun-job".into())
            .spawn(move || match work {
                Work::Command(cmd) => match worker.dispatch(&runner_ctx, &cmd) {
                    Ok(result) => CommandResult {
                        command: job_label,
                        ..result
                    },
                    Err(e) => job_result(&job_label, ExecutionMode::Interpreted, Err(e)),
                },
                Work::Node(node) => {
                    let script = ScriptNode {
                        pos: node.position(),
                        nodes: vec![node],
                    };
                    let outcome = worker.execute(&runner_ctx, &script);
                    job_result(&job_label, ExecutionMode::Interpreted, outcome)
                }
            })
            .map_err(|e| ShellError::execution_failed(format!("failed to start job thread: {e}")))?;

        let id = self.jobs.insert(label.clone(), None, job_ctx, handle);
        shrun_log_info!(job = id, command = %label, "background job started");
        Ok(started(id, id.to_string(), start.elapsed()))
    }

    fn spawn_process_job(&mut self, cmd: &Command, start: Instant) -> ShellResult<ExecutionResult> {
        let line = cmd.command_line();
        let request = self.process_request(cmd, None, ExecutionMode::Process);
        let job_ctx = ExecContext::new();
        let runner_ctx = job_ctx.clone();
        let (pid_tx, pid_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("shrun-job".into())
            .spawn(move || {
                request.run(&runner_ctx, &mut |pid| {
                    let _ = pid_tx.send(pid);
                })
            })
            .map_err(|e| ShellError::execution_failed(format!("failed to start job thread: {e}")))?;

        // the sender is dropped without a pid when the spawn fails
        let pid = pid_rx.recv().ok();
        let id = self.jobs.insert(line.clone(), pid, job_ctx, handle);
        shrun_log_info!(job = id, ?pid, command = %line, "background job started");
        let shown = pid.map_or_else(|| id.to_string(), |pid| pid.to_string());
        Ok(started(id, shown, start.elapsed()))
    }

    /// `wait` blocks for every job; `wait N…` for the listed ones.
    pub(crate) fn wait_command(&mut self, args: &[String]) -> ExecutionResult {
        let start = Instant::now();
        let finished: Vec<(JobId, CommandResult)> = if args.is_empty() {
            self.jobs.wait_all()
        } else {
            let mut finished = Vec::with_capacity(args.len());
            for arg in args {
                let id = match arg.trim_start_matches('%').parse::<JobId>() {
                    Ok(id) => id,
                    Err(_) => return ExecutionResult::failed(1, format!("wait: invalid job id '{arg}'")),
                };
                match self.jobs.wait(id) {
                    Ok(result) => finished.push((id, result)),
                    Err(e) => return ExecutionResult::failed(1, format!("wait: {}", e.message)),
                }
            }
            finished
        };

        let lines: Vec<String> = finished
            .iter()
            .map(|(id, result)| {
                let status = self
                    .jobs
                    .poll(*id)
                    .unwrap_or(JobStatus::Done(result.exit_code));
                format!("[{id}] {status}")
            })
            .collect();
        ExecutionResult {
            output: lines.join("\n"),
            commands: finished.into_iter().map(|(_, r)| r).collect(),
            duration: start.elapsed(),
            ..ExecutionResult::ok()
        }
    }

    /// `[N] <status> <command>` per job.
    pub(crate) fn jobs_command(&mut self) -> ExecutionResult {
        let lines: Vec<String> = self.jobs.list().iter().map(ToString::to_string).collect();
        ExecutionResult {
            output: lines.join("\n"),
            ..ExecutionResult::ok()
        }
    }
}
