//! Command dispatch: expansion, security, mode selection and the three
//! execution paths.

use std::time::Instant;

use shrun_parser::{Command, FunctionDef};

use super::process::{find_in_path, ProcessRequest, TIMEOUT_EXIT_CODE};
use super::ExecutionEngine;
use crate::config::DefaultMode;
use crate::context::ExecContext;
use crate::env::EnvStore;
use crate::error::{ErrorKind, ShellError, ShellResult};
use crate::expand::{self, ExpansionHost};
use crate::result::{CommandResult, ExecutionMode};

/// Engine view handed to the expander: variable reads plus the ability to
/// run `$(…)` bodies.
struct Expander<'e> {
    engine: &'e mut ExecutionEngine,
    ctx: &'e ExecContext,
}

impl ExpansionHost for Expander<'_> {
    fn lookup(&self, name: &str) -> Option<String> {
        self.engine.env.get_env(name)
    }

    fn substitute(&mut self, source: &str) -> Option<String> {
        self.engine.run_substitution(self.ctx, source)
    }
}

impl ExecutionEngine {
    pub(crate) fn expand_word(&mut self, ctx: &ExecContext, text: &str) -> String {
        let mut host = Expander { engine: self, ctx };
        expand::expand(&mut host, text)
    }

    pub(crate) fn expand_args(&mut self, ctx: &ExecContext, args: &[String]) -> Vec<String> {
        args.iter().map(|arg| self.expand_word(ctx, arg)).collect()
    }

    /// Output of running `source` as a nested script; `None` when it does
    /// not parse or does not succeed.
    pub(crate) fn run_substitution(&mut self, ctx: &ExecContext, source: &str) -> Option<String> {
        let script = match self.parser.parse_string(source) {
            Ok(script) => script,
            Err(e) => {
                shrun_log_debug!(source, error = %e, "substitution does not parse");
                return None;
            }
        };
        match self.execute(ctx, &script) {
            Ok(result) if result.success => Some(result.output),
            Ok(_) => None,
            Err(e) => {
                shrun_log_debug!(source, error = %e, "substitution failed");
                None
            }
        }
    }

    /// Expand, check and run one command.
    ///
    /// A security violation is reported as a failed result with exit code 1,
    /// not as an error. A process killed by cancellation surfaces as a
    /// `Timeout` error.
    pub fn execute_command(&mut self, ctx: &ExecContext, cmd: &Command) -> ShellResult<CommandResult> {
        ctx.check()?;
        let expanded = self.expand_command(ctx, cmd);
        if let Some(blocked) = self.check_security(&expanded) {
            return Ok(blocked);
        }
        self.dispatch(ctx, &expanded)
    }

    /// Run `cmd` as a process with `input` on stdin. Never cached.
    pub fn execute_command_with_input(
        &mut self,
        ctx: &ExecContext,
        cmd: &Command,
        input: &str,
    ) -> ShellResult<CommandResult> {
        ctx.check()?;
        let expanded = self.expand_command(ctx, cmd);
        if let Some(blocked) = self.check_security(&expanded) {
            return Ok(blocked);
        }
        let start = Instant::now();
        let result = self
            .process_request(&expanded, Some(input.to_string()), ExecutionMode::Process)
            .run(ctx, &mut |_| {});
        self.finish(ctx, result.with_duration(start.elapsed()))
    }

    pub(crate) fn expand_command(&mut self, ctx: &ExecContext, cmd: &Command) -> Command {
        Command {
            args: self.expand_args(ctx, &cmd.args),
            ..cmd.clone()
        }
    }

    /// `Some(failed result)` when the checker rejects the command.
    pub(crate) fn check_security(&mut self, cmd: &Command) -> Option<CommandResult> {
        let err = self.security.check_command(cmd).err()?;
        shrun_log_warn!(command = %cmd.name, reason = %err.message, "command blocked by security policy");
        let result = CommandResult::failure(
            cmd.command_line(),
            ExecutionMode::Process,
            1,
            format!("Security violation: {}", err.message),
        );
        self.stats.record(&result);
        Some(result)
    }

    /// How `name` will run.
    pub fn select_mode(&self, name: &str) -> ExecutionMode {
        if self.functions.contains_key(name) || self.stdlib.contains(name) {
            return ExecutionMode::Interpreted;
        }
        if self.modules.is_exported_function(name) || self.config.default_mode == DefaultMode::Hybrid {
            return ExecutionMode::Hybrid;
        }
        if find_in_path(name, self.env.get_env("PATH").as_deref()).is_none() {
            shrun_log_info!(command = %name, "command not found on PATH");
        }
        ExecutionMode::Process
    }

    /// Run an already expanded and checked command.
    pub(crate) fn dispatch(&mut self, ctx: &ExecContext, cmd: &Command) -> ShellResult<CommandResult> {
        let start = Instant::now();
        let mode = self.select_mode(&cmd.name);
        shrun_log_debug!(command = %cmd.name, %mode, "dispatching command");

        let result = match mode {
            ExecutionMode::Interpreted => match self.run_interpreted(ctx, cmd)? {
                Some(result) => result,
                None => CommandResult::failure(
                    cmd.command_line(),
                    mode,
                    1,
                    format!("function not found: {}", cmd.name),
                ),
            },
            ExecutionMode::Hybrid => self.run_hybrid(ctx, cmd)?,
            ExecutionMode::Process => self.run_process(ctx, cmd, ExecutionMode::Process),
        };
        self.finish(ctx, result.with_duration(start.elapsed()))
    }

    /// Record the result and turn a cancellation kill into an error.
    fn finish(&mut self, ctx: &ExecContext, result: CommandResult) -> ShellResult<CommandResult> {
        self.stats.record(&result);
        if result.exit_code == TIMEOUT_EXIT_CODE && ctx.is_cancelled() {
            return Err(ShellError::timeout("command execution timed out")
                .with_context("command", result.command)
                .with_context("exit_code", TIMEOUT_EXIT_CODE.to_string()));
        }
        if !result.is_success() {
            shrun_log_debug!(command = %result.command, exit_code = result.exit_code, error = %result.error, "command failed");
        }
        Ok(result)
    }

    /// User function first, then stdlib. `None` when neither knows the name.
    fn run_interpreted(&mut self, ctx: &ExecContext, cmd: &Command) -> ShellResult<Option<CommandResult>> {
        if let Some(def) = self.functions.get(&cmd.name).cloned() {
            return self.call_function(ctx, &def, &cmd.args).map(Some);
        }
        let line = cmd.command_line();
        let outcome = self.stdlib.call(&cmd.name, &cmd.args, &mut self.env);
        Ok(outcome.map(|outcome| match outcome {
            Ok(output) => CommandResult::success(line, ExecutionMode::Interpreted, output),
            Err(e) => CommandResult::failure(line, ExecutionMode::Interpreted, 1, e.message),
        }))
    }

    /// Interpreters first (user function, stdlib, module export); process
    /// when none handles the name or the handler fails.
    fn run_hybrid(&mut self, ctx: &ExecContext, cmd: &Command) -> ShellResult<CommandResult> {
        if let Some(result) = self.run_interpreted(ctx, cmd)? {
            if result.is_success() {
                return Ok(CommandResult {
                    mode: ExecutionMode::Hybrid,
                    ..result
                });
            }
        }
        match self.modules.call_exported(&cmd.name, &cmd.args, &mut self.env) {
            Some(Ok(output)) => {
                return Ok(CommandResult::success(cmd.command_line(), ExecutionMode::Hybrid, output))
            }
            Some(Err(e)) => {
                shrun_log_debug!(command = %cmd.name, error = %e, "module export failed, falling back to process");
            }
            None => {}
        }
        Ok(self.run_process(ctx, cmd, ExecutionMode::Hybrid))
    }

    /// Cached process execution. Commands with a redirect bypass the cache.
    fn run_process(&mut self, ctx: &ExecContext, cmd: &Command, mode: ExecutionMode) -> CommandResult {
        let cacheable = cmd.redirect.is_none();
        if cacheable {
            if let Some(hit) = self.cache.get(&cmd.name, &cmd.args) {
                shrun_log_debug!(command = %cmd.name, "command cache hit");
                return CommandResult { mode, ..hit };
            }
        }

        let result = self.process_request(cmd, None, mode).run(ctx, &mut |_| {});
        if cacheable && result.is_success() {
            self.cache.put(&cmd.name, &cmd.args, result.clone());
        }
        result
    }

    pub(crate) fn process_request(&self, cmd: &Command, stdin: Option<String>, mode: ExecutionMode) -> ProcessRequest {
        ProcessRequest {
            name: cmd.name.clone(),
            args: cmd.args.clone(),
            redirect: cmd.redirect.clone(),
            env: self.env.get_all_env(),
            cwd: self.env.working_dir(),
            stdin,
            mode,
        }
    }

    /// Run a user function in a child scope.
    ///
    /// Variables written by the body vanish on return. The output is the
    /// body's normalized output minus its final newline. Errors other than
    /// timeouts and exhausted limits become a failed result with exit code 1.
    fn call_function(&mut self, ctx: &ExecContext, def: &FunctionDef, args: &[String]) -> ShellResult<CommandResult> {
        let line = if args.is_empty() {
            def.name.clone()
        } else {
            format!("{} {}", def.name, args.join(" "))
        };

        self.env.push_frame();
        self.env.set_env("0", &def.name);
        self.env.set_env("#", &args.len().to_string());
        self.env.set_env("@", &args.join(" "));
        for (i, arg) in args.iter().enumerate() {
            self.env.set_env(&(i + 1).to_string(), arg);
        }
        let outcome = self.execute(ctx, &def.body);
        self.env.pop_frame();

        match outcome {
            Ok(result) => {
                let output = result.output.strip_suffix('\n').unwrap_or(&result.output);
                Ok(CommandResult {
                    command: line,
                    success: result.success,
                    exit_code: result.exit_code,
                    output: output.to_string(),
                    error: result.error,
                    duration: result.duration,
                    mode: ExecutionMode::Interpreted,
                })
            }
            Err(e) if matches!(e.kind, ErrorKind::Timeout | ErrorKind::ResourceExhausted) => Err(e),
            Err(e) => Ok(CommandResult::failure(line, ExecutionMode::Interpreted, 1, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvironmentManager;
    use crate::module::{Module, ModuleRegistry};
    use shrun_parser::parse;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::builder()
            .env(EnvironmentManager::with_working_dir(std::env::temp_dir()))
            .build()
    }

    fn cmd(name: &str, args: &[&str]) -> Command {
        Command::new(name, args.iter().map(|a| a.to_string()).collect())
    }

    #[test]
    fn mode_selection() {
        let mut engine = ExecutionEngine::builder()
            .modules({
                let mut registry = ModuleRegistry::new();
                registry.load(Module::new("m").export("Greet", |_: &[String], _: &mut dyn EnvStore| Ok("hi".into())));
                registry
            })
            .build();
        engine.execute(&ExecContext::new(), &parse("mine() {\nPrint x\n}").unwrap()).unwrap();

        assert_eq!(engine.select_mode("Print"), ExecutionMode::Interpreted);
        assert_eq!(engine.select_mode("mine"), ExecutionMode::Interpreted);
        assert_eq!(engine.select_mode("Greet"), ExecutionMode::Hybrid);
        assert_eq!(engine.select_mode("ls"), ExecutionMode::Process);
    }

    #[test]
    fn security_violation_is_a_failed_result() {
        let mut engine = engine();
        let result = engine.execute_command(&ExecContext::new(), &cmd("rm", &["notes.txt"])).unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
        assert!(result.error.starts_with("Security violation: "));
    }

    #[cfg(not(feature = "minimal-logging"))]
    #[tracing_test::traced_test]
    #[test]
    fn blocked_commands_are_logged() {
        let mut engine = engine();
        engine
            .execute_command(&ExecContext::new(), &cmd("shutdown", &["now"]))
            .unwrap();
        assert!(logs_contain("command blocked by security policy"));
    }

    #[test]
    fn stdlib_errors_become_exit_code_one() {
        let mut engine = engine();
        let result = engine.execute_command(&ExecContext::new(), &cmd("ToUpper", &[])).unwrap();
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.mode, ExecutionMode::Interpreted);
    }

    #[test]
    fn args_are_expanded_before_dispatch() {
        let mut engine = engine();
        engine.set_var("WHO", "world");
        let result = engine
            .execute_command(&ExecContext::new(), &cmd("Print", &["hello", "$WHO"]))
            .unwrap();
        assert_eq!(result.output, "hello world");
        assert_eq!(result.command, "Print hello world");
    }

    #[test]
    fn hybrid_prefers_module_exports() {
        let mut engine = ExecutionEngine::builder()
            .modules({
                let mut registry = ModuleRegistry::new();
                registry.load(
                    Module::new("m").export("Shout", |args: &[String], _: &mut dyn EnvStore| {
                        Ok(args.join(" ").to_uppercase())
                    }),
                );
                registry
            })
            .build();
        let result = engine.execute_command(&ExecContext::new(), &cmd("Shout", &["hey"])).unwrap();
        assert_eq!(result.output, "HEY");
        assert_eq!(result.mode, ExecutionMode::Hybrid);
        assert_eq!(engine.stats().hybrid, 1);
    }

    #[test]
    fn unknown_hybrid_command_falls_back_to_process() {
        let mut engine = ExecutionEngine::builder()
            .config(crate::config::EngineConfig {
                default_mode: DefaultMode::Hybrid,
                ..Default::default()
            })
            .build();
        let result = engine
            .execute_command(&ExecContext::new(), &cmd("definitely-not-a-real-program", &[]))
            .unwrap();
        assert_eq!(result.mode, ExecutionMode::Hybrid);
        assert_eq!(result.exit_code, super::super::NOT_FOUND_EXIT_CODE);
    }

    #[test]
    fn substitution_failures_expand_to_nothing() {
        let mut engine = engine();
        let ctx = ExecContext::new();
        assert_eq!(engine.expand_word(&ctx, "[$(ToUpper)]"), "[]");
        assert_eq!(engine.expand_word(&ctx, "[$(ToUpper abc)]"), "[ABC]");
    }
}
