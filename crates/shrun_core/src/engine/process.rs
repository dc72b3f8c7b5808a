//! External process execution with redirects and cancellation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command as SysCommand, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use shrun_parser::{Redirect, RedirectOp};
use wait_timeout::ChildExt;

use crate::context::ExecContext;
use crate::result::{CommandResult, ExecutionMode};

/// Exit code reported for a process killed by cancellation or deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;
/// Exit code reported when the program could not be found.
pub const NOT_FOUND_EXIT_CODE: i32 = 127;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[cfg(unix)]
fn open_redirect(path: &Path, append: bool) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut opts = OpenOptions::new();
    opts.write(true).create(true);
    if append {
        opts.append(true);
    } else {
        opts.truncate(true);
    }
    opts.custom_flags(libc::O_CLOEXEC).open(path)
}

#[cfg(not(unix))]
fn open_redirect(path: &Path, append: bool) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true);
    if append {
        opts.append(true);
    } else {
        opts.truncate(true);
    }
    opts.open(path)
}

/// Everything needed to run one child, owned so it can move to a job thread.
#[derive(Debug, Clone)]
pub(crate) struct ProcessRequest {
    pub name: String,
    pub args: Vec<String>,
    pub redirect: Option<Redirect>,
    pub env: HashMap<String, String>,
    pub cwd: PathBuf,
    pub stdin: Option<String>,
    pub mode: ExecutionMode,
}

/// Where the child's streams go once the redirect is applied.
struct Wiring {
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
    merge_stderr: bool,
}

impl ProcessRequest {
    fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.name.clone()
        } else {
            format!("{} {}", self.name, self.args.join(" "))
        }
    }

    fn resolve(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }

    fn wiring(&self) -> io::Result<Wiring> {
        let mut wiring = Wiring {
            stdin: if self.stdin.is_some() { Stdio::piped() } else { Stdio::null() },
            stdout: Stdio::piped(),
            stderr: Stdio::piped(),
            merge_stderr: false,
        };
        let Some(redirect) = &self.redirect else {
            return Ok(wiring);
        };

        match redirect.op {
            RedirectOp::Out | RedirectOp::Append => {
                let file = open_redirect(&self.resolve(&redirect.file), redirect.op == RedirectOp::Append)?;
                if redirect.fd == 2 {
                    wiring.stderr = Stdio::from(file);
                } else {
                    wiring.stdout = Stdio::from(file);
                }
            }
            RedirectOp::In => {
                let file = File::open(self.resolve(&redirect.file))?;
                wiring.stdin = Stdio::from(file);
            }
            RedirectOp::StderrToStdout => wiring.merge_stderr = true,
            RedirectOp::All => {
                let file = open_redirect(&self.resolve(&redirect.file), false)?;
                wiring.stderr = Stdio::from(file.try_clone()?);
                wiring.stdout = Stdio::from(file);
            }
        }
        Ok(wiring)
    }

    fn build(&self, wiring: Wiring) -> SysCommand {
        let mut command = SysCommand::new(&self.name);
        command
            .args(&self.args)
            .env_clear()
            .envs(self.env.iter().filter(|(k, v)| valid_env_pair(k, v)))
            .current_dir(&self.cwd)
            .stdin(wiring.stdin)
            .stdout(wiring.stdout)
            .stderr(wiring.stderr);
        command
    }

    /// Run the child to completion. `on_spawn` receives the pid as soon as
    /// the child exists; it is not called when spawning fails.
    pub fn run(&self, ctx: &ExecContext, on_spawn: &mut dyn FnMut(u32)) -> CommandResult {
        let start = Instant::now();
        let line = self.command_line();

        let wiring = match self.wiring() {
            Ok(w) => w,
            Err(e) => {
                return CommandResult::failure(line, self.mode, 1, format!("redirect failed: {e}"))
                    .with_duration(start.elapsed())
            }
        };
        let merge_stderr = wiring.merge_stderr;

        let mut child = match self.build(wiring).spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                shrun_log_debug!(command = %self.name, "program not found");
                return CommandResult::failure(
                    line,
                    self.mode,
                    NOT_FOUND_EXIT_CODE,
                    format!("command not found: {}", self.name),
                )
                .with_duration(start.elapsed());
            }
            Err(e) => {
                return CommandResult::failure(line, self.mode, 1, format!("failed to start '{}': {e}", self.name))
                    .with_duration(start.elapsed())
            }
        };
        on_spawn(child.id());

        if let (Some(input), Some(mut sink)) = (self.stdin.clone(), child.stdin.take()) {
            // a writer thread keeps a full stdout pipe from blocking the feed
            thread::spawn(move || {
                let _ = sink.write_all(input.as_bytes());
            });
        }
        // redirected streams have no pipe to drain
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_or_cancel(&mut child, ctx);
        let mut output = collect(stdout);
        let error_text = collect(stderr);
        if merge_stderr {
            output.push_str(&error_text);
        }

        let mut result = match status {
            Ok(Some(status)) => {
                let code = exit_code(status);
                let mut result = CommandResult::success(line, self.mode, output);
                if !status.success() {
                    result.success = false;
                    result.exit_code = code;
                    result.error = if error_text.is_empty() {
                        format!("exit status {code}")
                    } else {
                        error_text
                    };
                } else if !merge_stderr {
                    result.error = error_text;
                }
                result
            }
            Ok(None) => CommandResult::failure(line, self.mode, TIMEOUT_EXIT_CODE, "command execution timed out")
                .with_output(output),
            Err(e) => CommandResult::failure(line, self.mode, 1, format!("wait failed: {e}")).with_output(output),
        };
        result.duration = start.elapsed();
        result
    }
}

/// `Ok(None)` when the child was killed because `ctx` was cancelled.
fn wait_or_cancel(child: &mut Child, ctx: &ExecContext) -> io::Result<Option<ExitStatus>> {
    loop {
        if ctx.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        match child.wait_timeout(POLL_INTERVAL) {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => continue,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Keys and values the OS will accept in a child environment.
fn valid_env_pair(key: &str, value: &str) -> bool {
    !key.is_empty() && !key.contains('=') && !key.contains('\0') && !value.contains('\0')
}

/// First executable-looking match for `name` on `path_var`.
pub(crate) fn find_in_path(name: &str, path_var: Option<&str>) -> Option<PathBuf> {
    if name.contains(std::path::MAIN_SEPARATOR) {
        let path = PathBuf::from(name);
        return path.is_file().then_some(path);
    }
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
