//! Statement-level stepping over a loaded script.
//!
//! A session owns its own [`ExecutionEngine`], so variables and functions
//! defined by earlier statements are visible to later ones across stops.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use shrun_core::{shrun_log_debug, CommandResult, ExecContext, ExecutionEngine};
use shrun_parser::{Node, ScriptNode};

use crate::error::DebugError;

/// How far [`Session::continue_run`] goes before handing control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run until a breakpoint or the end of the script
    Continue,
    /// Execute exactly one statement
    Step,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Entry,
    Breakpoint,
    Step,
    Completed,
}

impl StopReason {
    /// Name used in DAP `stopped` events.
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Entry => "entry",
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
            StopReason::Completed => "completed",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Session {
    engine: ExecutionEngine,
    script: ScriptNode,
    program: Option<PathBuf>,
    breakpoints: HashSet<usize>,
    cursor: usize,
    stop_on_entry: bool,
    // set after a stop on the current line so resuming does not stop there again
    skip_breakpoint: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(ExecutionEngine::default())
    }
}

impl Session {
    pub fn new(engine: ExecutionEngine) -> Self {
        Self {
            engine,
            script: ScriptNode::default(),
            program: None,
            breakpoints: HashSet::new(),
            cursor: 0,
            stop_on_entry: false,
            skip_breakpoint: false,
        }
    }

    /// Parse `path` and rewind to its first statement. Engine counters start
    /// again from zero; variables and functions are kept.
    ///
    /// On a parse error the previously loaded program stays in place.
    pub fn load_program(&mut self, path: &Path, stop_on_entry: bool) -> Result<(), DebugError> {
        let script = self.engine.parser().parse_file(path)?;
        shrun_log_debug!(program = %path.display(), statements = script.len(), stop_on_entry, "program loaded");
        self.engine.reset_stats();
        self.script = script;
        self.program = Some(path.to_path_buf());
        self.cursor = 0;
        self.stop_on_entry = stop_on_entry;
        self.skip_breakpoint = false;
        Ok(())
    }

    /// Replace the breakpoint set. Returns the accepted lines in input order.
    pub fn set_breakpoints(&mut self, lines: &[i64]) -> Vec<usize> {
        let accepted: Vec<usize> = lines
            .iter()
            .filter(|line| **line > 0)
            .filter_map(|line| usize::try_from(*line).ok())
            .collect();
        self.breakpoints = accepted.iter().copied().collect();
        accepted
    }

    pub fn breakpoints(&self) -> &HashSet<usize> {
        &self.breakpoints
    }

    /// Path of the loaded program, empty before [`load_program`](Self::load_program).
    pub fn program(&self) -> String {
        self.program
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }

    pub fn is_loaded(&self) -> bool {
        self.program.is_some()
    }

    /// Line of the statement at the cursor.
    pub fn current_line(&self) -> usize {
        match self.script.nodes.get(self.cursor) {
            Some(node) => node.position().line,
            None => self.script.nodes.last().map_or(1, |node| node.position().line),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.cursor >= self.script.nodes.len()
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ExecutionEngine {
        &mut self.engine
    }

    /// Execute statements until the next stop and report where it happened.
    ///
    /// `on_result` sees the result of every statement that ran. A completed
    /// script reports line 0.
    pub fn continue_run(
        &mut self,
        ctx: &ExecContext,
        mode: RunMode,
        on_result: &mut dyn FnMut(&CommandResult),
    ) -> Result<(StopReason, usize), DebugError> {
        if self.program.is_none() {
            return Err(DebugError::NotLoaded);
        }
        let target = match mode {
            RunMode::Step => Some(self.cursor + 1),
            RunMode::Continue => None,
        };

        while self.cursor < self.script.nodes.len() {
            let line = self.current_line();

            if self.stop_on_entry {
                self.stop_on_entry = false;
                self.skip_breakpoint = true;
                return Ok((StopReason::Entry, line));
            }

            ctx.check()?;

            if self.skip_breakpoint {
                self.skip_breakpoint = false;
            } else if self.breakpoints.contains(&line) {
                self.skip_breakpoint = true;
                shrun_log_debug!(line, "breakpoint hit");
                return Ok((StopReason::Breakpoint, line));
            }

            let result = self.execute_current(ctx)?;
            on_result(&result);
            self.cursor += 1;

            if target.is_some_and(|target| self.cursor >= target) {
                return Ok((StopReason::Step, self.current_line()));
            }
        }

        Ok((StopReason::Completed, 0))
    }

    fn execute_current(&mut self, ctx: &ExecContext) -> Result<CommandResult, DebugError> {
        match &self.script.nodes[self.cursor] {
            Node::Command(cmd) => Ok(self.engine.execute_command(ctx, cmd)?),
            other => Err(DebugError::UnsupportedNode {
                kind: other.kind(),
                line: other.position().line,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn script(source: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".sh").tempfile().unwrap();
        file.write_all(source.as_bytes()).unwrap();
        file
    }

    fn loaded(source: &str, stop_on_entry: bool) -> (Session, tempfile::NamedTempFile) {
        let file = script(source);
        let mut session = Session::default();
        session.load_program(file.path(), stop_on_entry).unwrap();
        (session, file)
    }

    fn run(session: &mut Session, mode: RunMode) -> (StopReason, usize, Vec<String>) {
        let mut outputs = Vec::new();
        let (reason, line) = session
            .continue_run(&ExecContext::new(), mode, &mut |r| outputs.push(r.output.clone()))
            .unwrap();
        (reason, line, outputs)
    }

    #[test]
    fn breakpoints_drop_non_positive_lines() {
        let mut session = Session::default();
        assert_eq!(session.set_breakpoints(&[0, -1, 5]), vec![5]);
        assert_eq!(session.set_breakpoints(&[7, 3]), vec![7, 3]);
        assert!(!session.breakpoints().contains(&5));
    }

    #[test]
    fn running_without_a_program_is_an_error() {
        let mut session = Session::default();
        let err = session
            .continue_run(&ExecContext::new(), RunMode::Continue, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, DebugError::NotLoaded));
        assert_eq!(session.current_line(), 1);
        assert_eq!(session.program(), "");
    }

    #[test]
    fn continue_runs_to_completion() {
        let (mut session, _file) = loaded("Print one\nPrint two\n", false);
        let (reason, line, outputs) = run(&mut session, RunMode::Continue);
        assert_eq!(reason, StopReason::Completed);
        assert_eq!(line, 0);
        assert_eq!(outputs, vec!["one", "two"]);
        assert!(session.is_finished());
        assert_eq!(session.current_line(), 2);
    }

    #[test]
    fn stop_on_entry_does_not_retrigger_first_line_breakpoint() {
        let (mut session, _file) = loaded("Print one\nPrint two\n", true);
        session.set_breakpoints(&[1]);

        let (reason, line, outputs) = run(&mut session, RunMode::Continue);
        assert_eq!((reason, line), (StopReason::Entry, 1));
        assert!(outputs.is_empty());

        let (reason, _, outputs) = run(&mut session, RunMode::Continue);
        assert_eq!(reason, StopReason::Completed);
        assert_eq!(outputs, vec!["one", "two"]);
    }

    #[test]
    fn breakpoint_stops_before_the_line_runs() {
        let (mut session, _file) = loaded("Print one\n\nPrint two\nPrint three\n", false);
        session.set_breakpoints(&[3]);

        let (reason, line, outputs) = run(&mut session, RunMode::Continue);
        assert_eq!((reason, line), (StopReason::Breakpoint, 3));
        assert_eq!(outputs, vec!["one"]);
        assert_eq!(session.current_line(), 3);

        let (reason, _, outputs) = run(&mut session, RunMode::Continue);
        assert_eq!(reason, StopReason::Completed);
        assert_eq!(outputs, vec!["two", "three"]);
    }

    #[test]
    fn step_executes_one_statement() {
        let (mut session, _file) = loaded("Print one\nPrint two\nPrint three\n", false);

        let (reason, line, outputs) = run(&mut session, RunMode::Step);
        assert_eq!((reason, line), (StopReason::Step, 2));
        assert_eq!(outputs, vec!["one"]);

        let (reason, line, _) = run(&mut session, RunMode::Step);
        assert_eq!((reason, line), (StopReason::Step, 3));

        // stepping off the last statement reports its line again
        let (reason, line, outputs) = run(&mut session, RunMode::Step);
        assert_eq!((reason, line), (StopReason::Step, 3));
        assert_eq!(outputs, vec!["three"]);

        let (reason, line, _) = run(&mut session, RunMode::Step);
        assert_eq!((reason, line), (StopReason::Completed, 0));
    }

    #[test]
    fn state_carries_across_stops() {
        let (mut session, _file) = loaded("SetEnv name world\nPrint hello $name\n", false);
        session.set_breakpoints(&[2]);
        let (reason, _, _) = run(&mut session, RunMode::Continue);
        assert_eq!(reason, StopReason::Breakpoint);
        assert_eq!(session.engine().get_var("name").as_deref(), Some("world"));

        let (_, _, outputs) = run(&mut session, RunMode::Continue);
        assert_eq!(outputs, vec!["hello world"]);
    }

    #[test]
    fn reloading_resets_the_engine_counters() {
        let (mut session, file) = loaded("Print one\nPrint two\n", false);
        run(&mut session, RunMode::Continue);
        assert_eq!(session.engine().stats().commands_executed, 2);

        session.load_program(file.path(), false).unwrap();
        assert_eq!(session.engine().stats().commands_executed, 0);
        run(&mut session, RunMode::Step);
        assert_eq!(session.engine().stats().commands_executed, 1);
    }

    #[test]
    fn non_command_statements_are_rejected() {
        let (mut session, _file) = loaded("Print one\nname=value\n", false);
        let err = session
            .continue_run(&ExecContext::new(), RunMode::Continue, &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, DebugError::UnsupportedNode { kind: "assignment", line: 2 }));
    }

    #[test]
    fn cancelled_context_aborts_the_run() {
        let (mut session, _file) = loaded("Print one\n", false);
        let ctx = ExecContext::new();
        ctx.cancel();
        let err = session.continue_run(&ctx, RunMode::Continue, &mut |_| {}).unwrap_err();
        assert!(matches!(err, DebugError::Engine(e) if e.is_timeout()));
        assert_eq!(session.current_line(), 1);
    }

    #[test]
    fn reloading_rewinds_and_a_bad_file_keeps_the_old_program() {
        let (mut session, file) = loaded("Print one\n", false);
        run(&mut session, RunMode::Continue);
        session.load_program(file.path(), false).unwrap();
        assert!(!session.is_finished());

        let missing = file.path().with_extension("missing");
        assert!(matches!(session.load_program(&missing, false), Err(DebugError::Parse(_))));
        assert_eq!(session.program(), file.path().display().to_string());
    }
}
