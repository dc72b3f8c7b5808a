//! Control flow, pipelines, assignments, heredocs and `Source`.

use std::path::PathBuf;
use std::time::Instant;

use shrun_parser::{Command, Node, ScriptNode};

use super::ExecutionEngine;
use crate::context::ExecContext;
use crate::env::EnvStore;
use crate::error::{ShellError, ShellResult};
use crate::expand::{array_literal, parse_array_elements, whole_substitution};
use crate::result::{push_output, CommandResult, ExecutionMode, ExecutionResult, PipelineResult};

fn flatten_pipe<'n>(node: &'n Node, stages: &mut Vec<&'n Command>) -> ShellResult<()> {
    match node {
        Node::Pipe { left, right, .. } => {
            flatten_pipe(left, stages)?;
            flatten_pipe(right, stages)
        }
        Node::Command(cmd) => {
            stages.push(cmd);
            Ok(())
        }
        other => Err(ShellError::invalid_input(format!(
            "pipeline stage must be a command, found {}",
            other.kind()
        ))),
    }
}

/// Failure of a loop or block, keeping the output gathered so far.
fn stop_with(mut acc: ExecutionResult, step: ExecutionResult) -> ExecutionResult {
    acc.success = false;
    acc.exit_code = step.exit_code;
    acc.error = step.error;
    acc
}

impl ExecutionEngine {
    /// Run a pipeline. The first stage runs normally, each later stage gets
    /// the previous stage's stdout on stdin. The first failing stage ends
    /// the pipeline.
    pub fn execute_pipeline(&mut self, ctx: &ExecContext, pipe: &Node) -> ShellResult<PipelineResult> {
        let mut stages = Vec::new();
        flatten_pipe(pipe, &mut stages)?;

        let mut results: Vec<CommandResult> = Vec::with_capacity(stages.len());
        for (i, stage) in stages.iter().enumerate() {
            ctx.check()?;
            let result = match results.last() {
                Some(previous) if i > 0 => {
                    let input = previous.output.clone();
                    self.execute_command_with_input(ctx, stage, &input)?
                }
                _ => self.execute_command(ctx, stage)?,
            };
            let failed = !result.is_success();
            results.push(result);
            if failed {
                break;
            }
        }

        let (success, exit_code, output, error) = match results.last() {
            Some(last) => (last.is_success(), last.exit_code, last.output.clone(), last.error.clone()),
            None => (true, 0, String::new(), String::new()),
        };
        Ok(PipelineResult {
            success,
            exit_code,
            output,
            error,
            results,
        })
    }

    /// True iff the condition command succeeds with exit code 0.
    fn evaluate_condition(&mut self, ctx: &ExecContext, condition: &Node) -> ShellResult<(bool, CommandResult)> {
        let Node::Command(cmd) = condition else {
            return Err(ShellError::invalid_input(format!(
                "condition must be a command, found {}",
                condition.kind()
            )));
        };
        let result = self.execute_command(ctx, cmd)?;
        Ok((result.is_success(), result))
    }

    pub fn execute_if(
        &mut self,
        ctx: &ExecContext,
        condition: &Node,
        then: &ScriptNode,
        otherwise: Option<&ScriptNode>,
    ) -> ShellResult<ExecutionResult> {
        let (holds, probe) = self.evaluate_condition(ctx, condition)?;
        let branch = if holds { Some(then) } else { otherwise };
        let mut result = match branch {
            Some(body) => self.execute(ctx, body)?,
            None => ExecutionResult::ok(),
        };
        result.commands.insert(0, probe);
        Ok(result)
    }

    /// Iterate `list` literally, binding each item to `variable`.
    pub fn execute_for(
        &mut self,
        ctx: &ExecContext,
        variable: &str,
        list: &[String],
        body: &ScriptNode,
    ) -> ShellResult<ExecutionResult> {
        let start = Instant::now();
        let mut acc = ExecutionResult::ok();
        for item in list {
            ctx.check()?;
            self.env.set_env(variable, item);
            let mut step = self.execute(ctx, body)?;
            push_output(&mut acc.output, &step.output);
            acc.commands.append(&mut step.commands);
            if step.break_flag {
                break;
            }
            if step.continue_flag {
                continue;
            }
            if !step.is_success() {
                return Ok(stop_with(acc, step));
            }
        }
        acc.duration = start.elapsed();
        Ok(acc)
    }

    /// Loop while the condition holds, up to `max_while_iterations` bodies.
    /// Starting one more iteration is a `ResourceExhausted` error.
    pub fn execute_while(&mut self, ctx: &ExecContext, condition: &Node, body: &ScriptNode) -> ShellResult<ExecutionResult> {
        let start = Instant::now();
        let limit = self.config.max_while_iterations;
        let mut acc = ExecutionResult::ok();
        let mut iterations = 0usize;
        loop {
            if iterations >= limit {
                return Err(ShellError::resource_exhausted(format!(
                    "while loop exceeded maximum iterations ({limit})"
                ))
                .with_context("max_iterations", limit.to_string())
                .with_context("iterations", iterations.to_string()));
            }
            iterations += 1;
            ctx.check()?;

            let (holds, _) = self.evaluate_condition(ctx, condition)?;
            if !holds {
                break;
            }
            let mut step = self.execute(ctx, body)?;
            push_output(&mut acc.output, &step.output);
            acc.commands.append(&mut step.commands);
            if step.break_flag {
                break;
            }
            if step.continue_flag {
                continue;
            }
            if !step.is_success() {
                return Ok(stop_with(acc, step));
            }
        }
        acc.duration = start.elapsed();
        Ok(acc)
    }

    /// `left && right`: right runs only after a successful left.
    pub(crate) fn execute_and(&mut self, ctx: &ExecContext, left: &Node, right: &Node) -> ShellResult<ExecutionResult> {
        let first = self.execute_node(ctx, left)?;
        if !first.is_success() {
            return Ok(first);
        }
        self.chain(first, ctx, right)
    }

    /// `left || right`: right runs only after a failed left.
    pub(crate) fn execute_or(&mut self, ctx: &ExecContext, left: &Node, right: &Node) -> ShellResult<ExecutionResult> {
        let first = self.execute_node(ctx, left)?;
        if first.is_success() {
            return Ok(first);
        }
        self.chain(first, ctx, right)
    }

    /// Result of `right`, preceded by the output and commands of `first`.
    fn chain(&mut self, first: ExecutionResult, ctx: &ExecContext, right: &Node) -> ShellResult<ExecutionResult> {
        let mut second = self.execute_node(ctx, right)?;
        let mut output = String::new();
        push_output(&mut output, &first.output);
        push_output(&mut output, &second.output);
        second.output = output;
        second.commands.splice(0..0, first.commands);
        Ok(second)
    }

    /// Assignment. A value that is exactly one `$(…)` or backtick
    /// substitution takes the trimmed output of running it, or stays as
    /// written when that fails. Otherwise the value is expanded, and an
    /// expanded `(…)` literal becomes an array.
    pub(crate) fn assign(&mut self, ctx: &ExecContext, name: &str, value: &str) {
        let raw = value.trim();
        if let Some(source) = whole_substitution(raw) {
            let value = match self.run_substitution(ctx, source) {
                Some(output) => output.trim().to_string(),
                None => raw.to_string(),
            };
            self.env.set_env(name, &value);
            return;
        }

        let expanded = self.expand_word(ctx, value);
        match array_literal(expanded.trim()) {
            Some(body) => {
                let elements = parse_array_elements(body);
                self.assign_array(name, &elements);
            }
            None => self.env.set_env(name, &expanded),
        }
    }

    /// `name` holds the space-joined elements, `name[i]` each element and
    /// `name[@]` the element count.
    pub(crate) fn assign_array(&mut self, name: &str, elements: &[String]) {
        self.env.set_env(name, &elements.join(" "));
        for (i, element) in elements.iter().enumerate() {
            self.env.set_env(&format!("{name}[{i}]"), element);
        }
        self.env.set_env(&format!("{name}[@]"), &elements.len().to_string());
    }

    /// Feed the heredoc body to the wrapped command. Trailing newlines of the
    /// body collapse into exactly one.
    pub(crate) fn execute_heredoc(&mut self, ctx: &ExecContext, command: &Node, body: &str) -> ShellResult<ExecutionResult> {
        let Node::Command(cmd) = command else {
            return Err(ShellError::invalid_input(format!(
                "heredoc must wrap a command, found {}",
                command.kind()
            )));
        };
        let input = format!("{}\n", body.trim_end_matches('\n'));
        let result = match self.select_mode(&cmd.name) {
            ExecutionMode::Process => self.execute_command_with_input(ctx, cmd, &input)?,
            _ => self.execute_command(ctx, cmd)?,
        };
        Ok(ExecutionResult::from_command(&result))
    }

    /// `Source FILE`: function definitions are registered first, then the
    /// remaining statements run in the current scope.
    pub(crate) fn source_file(&mut self, ctx: &ExecContext, cmd: &Command) -> ShellResult<ExecutionResult> {
        let Some(arg) = cmd.args.first() else {
            return Ok(ExecutionResult::failed(1, "Source requires a file path argument"));
        };
        let path = PathBuf::from(self.expand_word(ctx, arg));
        let path = if path.is_absolute() {
            path
        } else {
            self.env.working_dir().join(path)
        };

        let script = match self.parser.parse_file(&path) {
            Ok(script) => script,
            Err(e) => {
                shrun_log_warn!(path = %path.display(), error = %e, "source file rejected");
                return Ok(ExecutionResult::failed(
                    1,
                    format!("Source error: failed to parse source file {}: {e}", path.display()),
                ));
            }
        };
        shrun_log_info!(path = %path.display(), nodes = script.len(), "sourcing file");

        let ScriptNode { pos, nodes } = script;
        let (functions, statements): (Vec<Node>, Vec<Node>) =
            nodes.into_iter().partition(|n| matches!(n, Node::Function(_)));
        for node in functions {
            if let Node::Function(def) = node {
                self.define_function(def);
            }
        }
        if statements.is_empty() {
            return Ok(ExecutionResult::ok());
        }
        self.execute(ctx, &ScriptNode { pos, nodes: statements })
    }
}
