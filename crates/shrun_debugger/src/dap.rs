//! Debug Adapter Protocol server.
//!
//! A reader task decodes requests from the client and feeds them to the
//! protocol loop. Runs of the debug session happen on blocking worker
//! tasks that report back through [`RunEvent`]s. The loop is the only
//! writer, so sequence numbers and the last stop line need no locking.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shrun_core::{shrun_log_debug, shrun_log_info, shrun_log_warn, CommandResult, ExecContext};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;

use crate::codec::{read_frame, write_frame};
use crate::error::DapError;
use crate::session::{RunMode, Session, StopReason};

const THREAD_ID: i64 = 1;

#[derive(Debug, Deserialize)]
struct Request {
    seq: i64,
    #[serde(rename = "type", default)]
    kind: String,
    command: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct Response<'a> {
    seq: i64,
    #[serde(rename = "type")]
    kind: &'static str,
    request_seq: i64,
    command: &'a str,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

#[derive(Debug, Serialize)]
struct Event {
    seq: i64,
    #[serde(rename = "type")]
    kind: &'static str,
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchArguments {
    #[serde(default)]
    program: String,
    #[serde(default)]
    stop_on_entry: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SetBreakpointsArguments {
    #[serde(default)]
    breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Debug, Deserialize)]
struct SourceBreakpoint {
    line: i64,
}

/// Progress reported by a worker running the session.
#[derive(Debug)]
enum RunEvent {
    Output { category: &'static str, output: String },
    Stopped { reason: StopReason, line: usize },
    Failed(String),
}

enum Flow {
    Continue,
    Disconnect,
}

fn arguments<T: DeserializeOwned + Default>(value: &Value) -> T {
    if value.is_null() {
        return T::default();
    }
    serde_json::from_value(value.clone()).unwrap_or_default()
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn forward_output(events: &mpsc::UnboundedSender<RunEvent>, result: &CommandResult) {
    if !result.output.trim().is_empty() {
        let _ = events.send(RunEvent::Output {
            category: "stdout",
            output: result.output.clone(),
        });
    }
    if !result.error.trim().is_empty() {
        let _ = events.send(RunEvent::Output {
            category: "stderr",
            output: result.error.clone(),
        });
    }
}

async fn read_requests<R>(mut reader: R, requests: mpsc::Sender<Request>) -> Result<(), DapError>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(body) = read_frame(&mut reader).await? {
        if body.is_empty() {
            continue;
        }
        let request: Request = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                shrun_log_warn!(error = %e, "skipping malformed DAP message");
                continue;
            }
        };
        if requests.send(request).await.is_err() {
            break;
        }
    }
    Ok(())
}

pub struct DapServer {
    session: Arc<Mutex<Session>>,
    ctx: ExecContext,
}

impl Default for DapServer {
    fn default() -> Self {
        Self::new(Session::default())
    }
}

impl DapServer {
    pub fn new(session: Session) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            ctx: ExecContext::new(),
        }
    }

    /// Context shared with every run. Cancelling it stops the in-flight run.
    pub fn context(&self) -> ExecContext {
        self.ctx.clone()
    }

    /// Serve one client until `disconnect` or end of input.
    pub async fn run<R, W>(self, reader: R, mut writer: W) -> Result<(), DapError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let (request_tx, mut requests) = mpsc::channel(32);
        let reader_task = tokio::spawn(read_requests(BufReader::new(reader), request_tx));
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut protocol = Protocol {
            session: self.session,
            ctx: self.ctx.clone(),
            events: events_tx,
            next_seq: 1,
            last_line: 0,
            program: String::new(),
        };

        let outcome = loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else { break Ok(false) };
                    match protocol.handle_request(&mut writer, request).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Disconnect) => break Ok(true),
                        Err(e) => break Err(e),
                    }
                }
                Some(event) = events.recv() => {
                    if let Err(e) = protocol.handle_run_event(&mut writer, event).await {
                        break Err(e);
                    }
                }
            }
        };

        self.ctx.cancel();
        let disconnected = match outcome {
            Ok(disconnected) => disconnected,
            Err(e) => {
                reader_task.abort();
                return Err(e);
            }
        };
        if disconnected {
            reader_task.abort();
            shrun_log_info!("DAP client disconnected");
            return Ok(());
        }
        shrun_log_info!("DAP input closed");
        match reader_task.await {
            Ok(result) => result,
            Err(e) => Err(DapError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))),
        }
    }
}

/// Per-connection state, owned by the protocol loop.
struct Protocol {
    session: Arc<Mutex<Session>>,
    ctx: ExecContext,
    events: mpsc::UnboundedSender<RunEvent>,
    next_seq: i64,
    last_line: usize,
    program: String,
}

impl Protocol {
    async fn handle_request<W>(&mut self, writer: &mut W, request: Request) -> Result<Flow, DapError>
    where
        W: AsyncWrite + Unpin,
    {
        if !request.kind.is_empty() && request.kind != "request" {
            shrun_log_debug!(kind = %request.kind, "ignoring non-request message");
            return Ok(Flow::Continue);
        }
        shrun_log_debug!(seq = request.seq, command = %request.command, "DAP request");

        match request.command.as_str() {
            "initialize" => {
                let body = json!({
                    "supportsConfigurationDoneRequest": true,
                    "supportsEvaluateForHovers": false,
                    "supportsSetVariable": false,
                });
                self.respond(writer, &request, Ok(Some(body))).await?;
            }
            "launch" => {
                let args: LaunchArguments = arguments(&request.arguments);
                if args.program.is_empty() {
                    self.respond(writer, &request, Err("program missing".into())).await?;
                    return Ok(Flow::Continue);
                }
                let loaded = lock(&self.session).load_program(&PathBuf::from(&args.program), args.stop_on_entry);
                match loaded {
                    Ok(()) => {
                        self.program = args.program;
                        self.last_line = 0;
                        self.respond(writer, &request, Ok(None)).await?;
                        self.send_event(writer, "initialized", None).await?;
                    }
                    Err(e) => self.respond(writer, &request, Err(e.to_string())).await?,
                }
            }
            "setBreakpoints" => {
                let args: SetBreakpointsArguments = arguments(&request.arguments);
                let lines: Vec<i64> = args.breakpoints.iter().map(|bp| bp.line).collect();
                let accepted = lock(&self.session).set_breakpoints(&lines);
                let breakpoints: Vec<Value> = accepted
                    .iter()
                    .map(|line| json!({ "verified": true, "line": line }))
                    .collect();
                self.respond(writer, &request, Ok(Some(json!({ "breakpoints": breakpoints }))))
                    .await?;
            }
            "configurationDone" => {
                self.respond(writer, &request, Ok(None)).await?;
                self.start_run(RunMode::Continue);
            }
            "threads" => {
                let body = json!({ "threads": [{ "id": THREAD_ID, "name": "main" }] });
                self.respond(writer, &request, Ok(Some(body))).await?;
            }
            "stackTrace" => {
                let line = self.current_line().max(1);
                let body = json!({
                    "stackFrames": [{
                        "id": 1,
                        "name": "shrun",
                        "line": line,
                        "column": 1,
                        "source": { "path": self.program },
                    }],
                    "totalFrames": 1,
                });
                self.respond(writer, &request, Ok(Some(body))).await?;
            }
            "scopes" => {
                let body = json!({
                    "scopes": [{
                        "name": "Globals",
                        "variablesReference": 0,
                        "presentationHint": "locals",
                    }],
                });
                self.respond(writer, &request, Ok(Some(body))).await?;
            }
            "variables" => {
                self.respond(writer, &request, Ok(Some(json!({ "variables": [] }))))
                    .await?;
            }
            "continue" => {
                self.respond(writer, &request, Ok(Some(json!({ "allThreadsContinued": true }))))
                    .await?;
                self.start_run(RunMode::Continue);
            }
            "next" => {
                self.respond(writer, &request, Ok(None)).await?;
                self.start_run(RunMode::Step);
            }
            "disconnect" => {
                self.respond(writer, &request, Ok(None)).await?;
                self.send_event(writer, "terminated", None).await?;
                return Ok(Flow::Disconnect);
            }
            other => {
                let message = format!("unsupported command {other}");
                self.respond(writer, &request, Err(message)).await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Line of the last stop, or the session cursor before the first one.
    fn current_line(&self) -> usize {
        if self.last_line != 0 {
            return self.last_line;
        }
        // a run in flight holds the session; report the first line meanwhile
        self.session
            .try_lock()
            .map(|session| session.current_line())
            .unwrap_or(1)
    }

    fn start_run(&self, mode: RunMode) {
        let session = Arc::clone(&self.session);
        let ctx = self.ctx.clone();
        let events = self.events.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = lock(&session);
            let outcome = session.continue_run(&ctx, mode, &mut |result| forward_output(&events, result));
            let event = match outcome {
                Ok((reason, line)) => RunEvent::Stopped { reason, line },
                Err(e) => RunEvent::Failed(e.to_string()),
            };
            let _ = events.send(event);
        });
    }

    async fn handle_run_event<W>(&mut self, writer: &mut W, event: RunEvent) -> Result<(), DapError>
    where
        W: AsyncWrite + Unpin,
    {
        match event {
            RunEvent::Output { category, output } => self.send_output(writer, category, output).await,
            RunEvent::Failed(message) => {
                shrun_log_warn!(error = %message, "debug run failed");
                self.send_output(writer, "stderr", message).await?;
                self.send_event(writer, "terminated", None).await
            }
            RunEvent::Stopped { reason, line } => {
                if line > 0 {
                    self.last_line = line;
                }
                shrun_log_debug!(%reason, line, "run stopped");
                if reason == StopReason::Completed {
                    self.send_event(writer, "terminated", Some(json!({ "restart": false }))).await?;
                    return self.send_event(writer, "exited", Some(json!({ "exitCode": 0 }))).await;
                }
                let body = json!({ "reason": reason.as_str(), "threadId": THREAD_ID, "line": line });
                self.send_event(writer, "stopped", Some(body)).await
            }
        }
    }

    fn next_seq(&mut self) -> i64 {
        self.next_seq += 1;
        self.next_seq
    }

    async fn respond<W>(
        &mut self,
        writer: &mut W,
        request: &Request,
        outcome: Result<Option<Value>, String>,
    ) -> Result<(), DapError>
    where
        W: AsyncWrite + Unpin,
    {
        let (success, message, body) = match outcome {
            Ok(body) => (true, None, body),
            Err(message) => (false, Some(message), None),
        };
        let response = Response {
            seq: self.next_seq(),
            kind: "response",
            request_seq: request.seq,
            command: &request.command,
            success,
            message,
            body,
        };
        write_frame(writer, &response).await
    }

    async fn send_event<W>(&mut self, writer: &mut W, event: &'static str, body: Option<Value>) -> Result<(), DapError>
    where
        W: AsyncWrite + Unpin,
    {
        let event = Event {
            seq: self.next_seq(),
            kind: "event",
            event,
            body,
        };
        write_frame(writer, &event).await
    }

    async fn send_output<W>(&mut self, writer: &mut W, category: &'static str, mut output: String) -> Result<(), DapError>
    where
        W: AsyncWrite + Unpin,
    {
        if !output.ends_with('\n') {
            output.push('\n');
        }
        self.send_event(writer, "output", Some(json!({ "category": category, "output": output })))
            .await
    }
}
