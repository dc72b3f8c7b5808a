//! The execution engine: walks a [`ScriptNode`] and dispatches each command.
//!
//! One engine owns its variables, function table, command cache, process
//! pool and job table. Execution is synchronous: the caller blocks while a
//! script runs on its own large-stack thread. Background jobs outlive the
//! call.

mod command;
mod control;
mod jobs;
pub(crate) mod process;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use shrun_parser::{FunctionDef, Node, Parser, ScriptNode, SimpleParser};

use crate::cache::CommandCache;
use crate::config::EngineConfig;
use crate::context::ExecContext;
use crate::env::{EnvStore, EnvironmentManager, ScopeChain};
use crate::error::{ShellError, ShellResult};
use crate::job::{JobId, JobInfo, JobStatus, JobTable};
use crate::module::{ModuleManager, ModuleRegistry};
use crate::pool::ProcessPool;
use crate::result::{push_output, CommandResult, ExecutionMode, ExecutionResult};
use crate::security::{SandboxPolicy, SecurityChecker};
use crate::stdlib::StdLib;

pub use process::{NOT_FOUND_EXIT_CODE, TIMEOUT_EXIT_CODE};

/// Counters describing what an engine has run so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub commands_executed: u64,
    pub interpreted: u64,
    pub process: u64,
    pub hybrid: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub failures: u64,
    pub timeouts: u64,
}

impl EngineStats {
    fn record(&mut self, result: &CommandResult) {
        self.commands_executed += 1;
        match result.mode {
            ExecutionMode::Interpreted => self.interpreted += 1,
            ExecutionMode::Process => self.process += 1,
            ExecutionMode::Hybrid => self.hybrid += 1,
        }
        if !result.is_success() {
            self.failures += 1;
        }
        if result.exit_code == TIMEOUT_EXIT_CODE {
            self.timeouts += 1;
        }
    }
}

/// Assembles an [`ExecutionEngine`] from its collaborators. Anything left
/// unset gets the stock implementation.
#[derive(Default)]
pub struct EngineBuilder {
    env: Option<Box<dyn EnvStore>>,
    stdlib: Option<StdLib>,
    modules: Option<Arc<dyn ModuleManager>>,
    security: Option<Arc<dyn SecurityChecker>>,
    parser: Option<Arc<dyn Parser>>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(mut self, env: impl EnvStore + 'static) -> Self {
        self.env = Some(Box::new(env));
        self
    }

    pub fn stdlib(mut self, stdlib: StdLib) -> Self {
        self.stdlib = Some(stdlib);
        self
    }

    pub fn modules(mut self, modules: impl ModuleManager + 'static) -> Self {
        self.modules = Some(Arc::new(modules));
        self
    }

    pub fn security(mut self, checker: impl SecurityChecker + 'static) -> Self {
        self.security = Some(Arc::new(checker));
        self
    }

    pub fn parser(mut self, parser: impl Parser + 'static) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ExecutionEngine {
        let config = self.config;
        let env = self
            .env
            .unwrap_or_else(|| Box::new(EnvironmentManager::new()));
        let pool = ProcessPool::with_sweep_interval(
            config.pool_max_size,
            config.pool_idle_timeout(),
            config.pool_sweep_interval(),
        );
        shrun_log_debug!(
            cache_capacity = config.cache_capacity,
            pool_max_size = config.pool_max_size,
            default_mode = ?config.default_mode,
            "execution engine created"
        );
        ExecutionEngine {
            env: ScopeChain::new(env),
            stdlib: self.stdlib.unwrap_or_default(),
            modules: self
                .modules
                .unwrap_or_else(|| Arc::new(ModuleRegistry::new())),
            security: self
                .security
                .unwrap_or_else(|| Arc::new(SandboxPolicy::new())),
            parser: self.parser.unwrap_or_else(|| Arc::new(SimpleParser::new())),
            cache: CommandCache::new(config.cache_capacity),
            pool,
            jobs: JobTable::new(),
            functions: HashMap::new(),
            stats: EngineStats::default(),
            depth: 0,
            config,
        }
    }
}

pub struct ExecutionEngine {
    env: ScopeChain,
    stdlib: StdLib,
    modules: Arc<dyn ModuleManager>,
    security: Arc<dyn SecurityChecker>,
    parser: Arc<dyn Parser>,
    config: EngineConfig,
    cache: CommandCache,
    pool: ProcessPool,
    jobs: JobTable,
    functions: HashMap<String, Arc<FunctionDef>>,
    stats: EngineStats,
    // nested execute() calls currently on the stack
    depth: usize,
}

impl ExecutionEngine {
    /// Engine with stock collaborators and the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder::new().config(config).build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Execute a script.
    ///
    /// Nodes run in order. `ctx` is checked before each one; a cancelled or
    /// expired context ends the run with a `Timeout` error. The first node
    /// that fails stops the walk and its exit code and error become the
    /// result, as does a `break` or `continue` reaching this level.
    ///
    /// The outermost call runs on a dedicated thread whose stack is sized
    /// from `max_call_depth`, so hitting the depth bound is an error rather
    /// than a stack overflow.
    pub fn execute(&mut self, ctx: &ExecContext, script: &ScriptNode) -> ShellResult<ExecutionResult> {
        if self.depth > 0 {
            return self.execute_nested(ctx, script);
        }
        let stack_size = script_stack_size(self.config.max_call_depth);
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let span = tracing::Span::current();
        std::thread::scope(|scope| -> ShellResult<ExecutionResult> {
            let worker = std::thread::Builder::new()
                .name("shrun-script".into())
                .stack_size(stack_size)
                .spawn_scoped(scope, move || {
                    tracing::dispatcher::with_default(&dispatch, || {
                        span.in_scope(|| self.execute_nested(ctx, script))
                    })
                })
                .map_err(|e| {
                    ShellError::execution_failed(format!("failed to start script thread: {e}"))
                        .with_context("stack_size", stack_size.to_string())
                })?;
            worker
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        })
    }

    /// Engine for a background job: same collaborators, configuration and
    /// functions, a snapshot of the current variables, and its own cache,
    /// pool, job table and counters.
    fn background_worker(&self) -> ExecutionEngine {
        let env = EnvironmentManager::from_snapshot(self.env.get_all_env(), self.env.working_dir());
        ExecutionEngine {
            env: ScopeChain::new(Box::new(env)),
            stdlib: self.stdlib.clone(),
            modules: Arc::clone(&self.modules),
            security: Arc::clone(&self.security),
            parser: Arc::clone(&self.parser),
            cache: CommandCache::new(self.config.cache_capacity),
            pool: ProcessPool::with_sweep_interval(
                self.config.pool_max_size,
                self.config.pool_idle_timeout(),
                self.config.pool_sweep_interval(),
            ),
            jobs: JobTable::new(),
            functions: self.functions.clone(),
            stats: EngineStats::default(),
            depth: 0,
            config: self.config.clone(),
        }
    }

    fn execute_nested(&mut self, ctx: &ExecContext, script: &ScriptNode) -> ShellResult<ExecutionResult> {
        self.enter()?;
        let result = self.execute_nodes(ctx, &script.nodes);
        self.depth -= 1;
        result
    }

    /// Parse `source` with the engine's parser and execute it.
    pub fn execute_source(&mut self, ctx: &ExecContext, source: &str) -> ShellResult<ExecutionResult> {
        let script = self.parser.parse_string(source)?;
        self.execute(ctx, &script)
    }

    /// Parse and execute a script file.
    pub fn execute_file(&mut self, ctx: &ExecContext, path: &Path) -> ShellResult<ExecutionResult> {
        let script = self.parser.parse_file(path)?;
        self.execute(ctx, &script)
    }

    fn enter(&mut self) -> ShellResult<()> {
        if self.depth >= self.config.max_call_depth {
            return Err(ShellError::resource_exhausted(format!(
                "maximum call depth ({}) exceeded",
                self.config.max_call_depth
            ))
            .with_context("max_call_depth", self.config.max_call_depth.to_string()));
        }
        self.depth += 1;
        Ok(())
    }

    fn execute_nodes(&mut self, ctx: &ExecContext, nodes: &[Node]) -> ShellResult<ExecutionResult> {
        let start = Instant::now();
        let mut result = ExecutionResult::ok();

        for node in nodes {
            ctx.check()?;
            let mut step = self.execute_node(ctx, node)?;
            push_output(&mut result.output, &step.output);
            result.commands.append(&mut step.commands);

            if step.break_flag || step.continue_flag {
                result.break_flag = step.break_flag;
                result.continue_flag = step.continue_flag;
                break;
            }
            if !step.is_success() {
                result.success = false;
                result.exit_code = step.exit_code;
                result.error = step.error;
                break;
            }
        }

        result.duration = start.elapsed();
        Ok(result)
    }

    /// Execute a single node.
    pub fn execute_node(&mut self, ctx: &ExecContext, node: &Node) -> ShellResult<ExecutionResult> {
        match node {
            Node::Command(cmd) => match cmd.name.as_str() {
                "break" => Ok(interrupt(true)),
                "continue" => Ok(interrupt(false)),
                "Source" | "source" => self.source_file(ctx, cmd),
                "wait" => Ok(self.wait_command(&cmd.args)),
                "jobs" => Ok(self.jobs_command()),
                _ => {
                    let result = self.execute_command(ctx, cmd)?;
                    Ok(ExecutionResult::from_command(&result))
                }
            },
            Node::Pipe { .. } => {
                let start = Instant::now();
                let pipeline = self.execute_pipeline(ctx, node)?;
                Ok(pipeline.into_execution(start.elapsed()))
            }
            Node::If {
                condition,
                then,
                otherwise,
                ..
            } => self.execute_if(ctx, condition, then, otherwise.as_ref()),
            Node::For {
                variable,
                list,
                body,
                ..
            } => self.execute_for(ctx, variable, list, body),
            Node::While { condition, body, .. } => self.execute_while(ctx, condition, body),
            Node::Assignment { name, value, .. } => {
                self.assign(ctx, name, value);
                Ok(ExecutionResult::ok())
            }
            Node::Array { name, values, .. } => {
                self.assign_array(name, values);
                Ok(ExecutionResult::ok())
            }
            Node::Function(def) => {
                self.define_function(def.clone());
                Ok(ExecutionResult::ok())
            }
            Node::And { left, right, .. } => self.execute_and(ctx, left, right),
            Node::Or { left, right, .. } => self.execute_or(ctx, left, right),
            Node::Background { command, .. } => self.execute_background(ctx, command),
            Node::Heredoc { command, body, .. } => self.execute_heredoc(ctx, command, body),
            Node::Break(_) => Ok(interrupt(true)),
            Node::Continue(_) => Ok(interrupt(false)),
            Node::Annotation { name, .. } => {
                shrun_log_debug!(annotation = %name, "annotation skipped");
                Ok(ExecutionResult::ok())
            }
        }
    }

    /// Register a user function, replacing any previous definition.
    pub fn define_function(&mut self, def: FunctionDef) {
        shrun_log_debug!(function = %def.name, "function defined");
        self.functions.insert(def.name.clone(), Arc::new(def));
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn get_var(&self, name: &str) -> Option<String> {
        self.env.get_env(name)
    }

    pub fn set_var(&mut self, name: &str, value: &str) {
        self.env.set_env(name, value);
    }

    pub fn unset_var(&mut self, name: &str) {
        self.env.unset_env(name);
    }

    pub fn working_dir(&self) -> PathBuf {
        self.env.working_dir()
    }

    pub fn set_working_dir(&mut self, dir: &Path) -> ShellResult<()> {
        self.env.set_working_dir(dir)
    }

    pub fn env(&self) -> &dyn EnvStore {
        &self.env
    }

    pub fn stdlib(&self) -> &StdLib {
        &self.stdlib
    }

    /// Mutable access for registering extra in-process functions.
    pub fn stdlib_mut(&mut self) -> &mut StdLib {
        &mut self.stdlib
    }

    pub fn parser(&self) -> &dyn Parser {
        self.parser.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        let cache = self.cache.stats();
        EngineStats {
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            ..self.stats
        }
    }

    /// Zero the execution counters and the cache hit/miss counts. Cached
    /// results are kept.
    pub fn reset_stats(&mut self) {
        self.stats = EngineStats::default();
        self.cache.reset_stats();
    }

    pub fn cache(&self) -> &CommandCache {
        &self.cache
    }

    pub fn process_pool(&self) -> &ProcessPool {
        &self.pool
    }

    /// Snapshot of every tracked background job.
    pub fn jobs(&mut self) -> Vec<JobInfo> {
        self.jobs.list()
    }

    pub fn poll_job(&mut self, id: JobId) -> Option<JobStatus> {
        self.jobs.poll(id)
    }

    pub fn wait_job(&mut self, id: JobId) -> ShellResult<CommandResult> {
        self.jobs.wait(id)
    }

    pub fn wait_all_jobs(&mut self) -> Vec<(JobId, CommandResult)> {
        self.jobs.wait_all()
    }

    pub fn kill_job(&mut self, id: JobId) -> ShellResult<()> {
        self.jobs.kill(id)
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Minimum stack for the thread that runs a top-level script.
const MIN_SCRIPT_STACK: usize = 16 * 1024 * 1024;
/// Stack reserved per allowed level of nesting.
const STACK_PER_LEVEL: usize = 256 * 1024;

fn script_stack_size(max_call_depth: usize) -> usize {
    max_call_depth
        .saturating_mul(STACK_PER_LEVEL)
        .max(MIN_SCRIPT_STACK)
}

fn interrupt(is_break: bool) -> ExecutionResult {
    ExecutionResult {
        break_flag: is_break,
        continue_flag: !is_break,
        ..ExecutionResult::ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use shrun_parser::parse;

    fn engine() -> ExecutionEngine {
        let dir = std::env::temp_dir();
        ExecutionEngine::builder()
            .env(EnvironmentManager::with_working_dir(dir))
            .build()
    }

    fn run(engine: &mut ExecutionEngine, src: &str) -> ExecutionResult {
        let script = parse(src).unwrap();
        engine.execute(&ExecContext::new(), &script).unwrap()
    }

    #[test]
    fn stdlib_output_is_newline_normalized() {
        let mut engine = engine();
        let result = run(&mut engine, "Print a\nPrint b");
        assert!(result.success);
        assert_eq!(result.output, "a\nb\n");
        assert_eq!(result.commands.len(), 2);
    }

    #[test]
    fn first_failure_stops_the_walk() {
        let mut engine = engine();
        let result = run(&mut engine, "Print one\nReadFile /definitely/missing/file\nPrint two");
        assert!(!result.success);
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.output, "one\n");
    }

    #[test]
    fn top_level_break_sets_the_flag() {
        let mut engine = engine();
        let result = run(&mut engine, "Print x\nbreak\nPrint y");
        assert!(result.success);
        assert!(result.break_flag);
        assert_eq!(result.output, "x\n");
    }

    #[test]
    fn cancelled_context_is_a_timeout_error() {
        let mut engine = engine();
        let ctx = ExecContext::new();
        ctx.cancel();
        let err = engine.execute(&ctx, &parse("Print x").unwrap()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[test]
    fn depth_is_bounded() {
        let mut engine = ExecutionEngine::builder()
            .config(EngineConfig {
                max_call_depth: 3,
                ..EngineConfig::default()
            })
            .build();
        let src = "if Contains a a\nthen\nif Contains a a\nthen\nif Contains a a\nthen\nPrint deep\nfi\nfi\nfi";
        let err = engine
            .execute(&ExecContext::new(), &parse(src).unwrap())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceExhausted);
        assert_eq!(engine.depth, 0);
    }

    #[test]
    fn builder_defaults_include_the_stdlib() {
        let mut engine = ExecutionEngine::builder().build();
        let result = run(&mut engine, "Print hi");
        assert!(result.success, "{}", result.error);
        assert_eq!(result.output, "hi\n");
        assert_eq!(engine.stats().interpreted, 1);

        let mut engine = ExecutionEngine::default();
        assert_eq!(run(&mut engine, "ToUpper abc").output, "ABC\n");
    }

    #[test]
    fn unbounded_recursion_hits_the_default_depth_limit() {
        let mut engine = ExecutionEngine::default();
        let err = engine
            .execute(&ExecContext::new(), &parse("spin() {\n  spin\n}\nspin").unwrap())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceExhausted);
        assert!(err.message.contains("maximum call depth (256)"), "{}", err.message);
        assert_eq!(engine.depth, 0);
    }

    #[test]
    fn stack_grows_with_the_depth_limit() {
        assert_eq!(script_stack_size(1), MIN_SCRIPT_STACK);
        assert_eq!(script_stack_size(1024), 1024 * STACK_PER_LEVEL);
        assert_eq!(script_stack_size(usize::MAX), usize::MAX);
    }

    #[test]
    fn reset_stats_zeroes_the_counters() {
        let mut engine = engine();
        run(&mut engine, "Print hi\nToUpper");
        assert_eq!(engine.stats().commands_executed, 2);
        engine.reset_stats();
        assert_eq!(engine.stats(), EngineStats::default());
        run(&mut engine, "Print again");
        assert_eq!(engine.stats().commands_executed, 1);
    }

    #[test]
    fn stats_count_modes_and_failures() {
        let mut engine = engine();
        run(&mut engine, "Print hi\nFileExists nope");
        run(&mut engine, "ToUpper");
        let stats = engine.stats();
        assert_eq!(stats.commands_executed, 3);
        assert_eq!(stats.interpreted, 3);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn annotations_are_ignored() {
        let mut engine = engine();
        let result = run(&mut engine, "@Route(\"/x\")\nPrint ok");
        assert_eq!(result.output, "ok\n");
    }
}
