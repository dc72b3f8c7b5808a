use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use shrun_core::engine::TIMEOUT_EXIT_CODE;
use shrun_core::{EngineConfig, ExecContext, ExecutionEngine, ExecutionResult};
use shrun_debugger::DapServer;
use shrun_parser::Parser as _;

/// shrun command-line interface.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run shell scripts through the shrun engine", long_about = None)]
struct Cli {
    /// Log filter (overridden by SHRUN_LOG)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormatArg::Plain)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a script file
    Run {
        script: PathBuf,
        #[command(flatten)]
        options: RunOptions,
    },
    /// Run an inline script; several arguments are joined with spaces
    Exec {
        #[arg(required = true, num_args = 1..)]
        source: Vec<String>,
        #[command(flatten)]
        options: RunOptions,
    },
    /// Parse a script and report syntax errors without running it
    Check { script: PathBuf },
    /// Serve the Debug Adapter Protocol over stdin/stdout
    DebugAdapter,
}

#[derive(Args, Debug)]
struct RunOptions {
    /// Engine configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Deadline for the whole run, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print execution statistics to stderr when the run ends
    #[arg(long)]
    summary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Plain,
    Compact,
    Json,
}

enum Script {
    File(PathBuf),
    Inline(String),
}

#[cfg(feature = "logging")]
fn init_logging(cli: &Cli) {
    use shrun_core::logging::{self, LogFormat, LoggingConfig};

    let format = match cli.log_format {
        LogFormatArg::Plain => LogFormat::Plain,
        LogFormatArg::Compact => LogFormat::Compact,
        LogFormatArg::Json => LogFormat::Json,
    };
    let config = LoggingConfig {
        level: cli.log_level.clone(),
        format,
        ..LoggingConfig::default()
    };
    if let Err(e) = logging::init(&config) {
        eprintln!("shrun: {e}");
    }
}

#[cfg(not(feature = "logging"))]
fn init_logging(_cli: &Cli) {}

fn load_config(options: &RunOptions) -> anyhow::Result<EngineConfig> {
    let mut config = match &options.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(ms) = options.timeout_ms {
        config.command_timeout_ms = Some(ms);
    }
    Ok(config)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from((code & 0xff) as u8)
}

fn report(result: &ExecutionResult) -> ExitCode {
    print!("{}", result.output);
    if !result.is_success() && !result.error.is_empty() {
        eprintln!("{}", result.error.trim_end());
    }
    if result.is_success() {
        ExitCode::SUCCESS
    } else if result.exit_code == 0 {
        ExitCode::FAILURE
    } else {
        exit_code(result.exit_code)
    }
}

async fn run_script(script: Script, options: RunOptions) -> anyhow::Result<ExitCode> {
    let config = load_config(&options)?;
    let ctx = match config.command_timeout() {
        Some(timeout) => ExecContext::with_timeout(timeout),
        None => ExecContext::new(),
    };

    let interrupt = ctx.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let summary = options.summary;
    let outcome = tokio::task::spawn_blocking(move || {
        let mut engine = ExecutionEngine::new(config);
        let outcome = match &script {
            Script::File(path) => engine.execute_file(&ctx, path),
            Script::Inline(source) => engine.execute_source(&ctx, source),
        };
        (outcome, engine.stats())
    })
    .await
    .context("script worker panicked")?;
    watcher.abort();

    let (outcome, stats) = outcome;
    if summary {
        eprintln!("{stats:?}");
    }
    match outcome {
        Ok(result) => Ok(report(&result)),
        Err(e) if e.is_timeout() => {
            eprintln!("shrun: {}", e.message);
            Ok(exit_code(TIMEOUT_EXIT_CODE))
        }
        Err(e) => Err(anyhow::Error::new(e).context("execution failed")),
    }
}

fn check(script: &Path) -> anyhow::Result<ExitCode> {
    let parsed = shrun_parser::SimpleParser::new()
        .parse_file(script)
        .with_context(|| format!("failed to parse {}", script.display()))?;
    println!("{}: {} statements", script.display(), parsed.len());
    Ok(ExitCode::SUCCESS)
}

async fn debug_adapter() -> anyhow::Result<ExitCode> {
    let server = DapServer::default();
    let ctx = server.context();
    tokio::select! {
        served = server.run(tokio::io::stdin(), tokio::io::stdout()) => {
            served.context("debug adapter error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            ctx.cancel();
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn dispatch(command: Commands) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Run { script, options } => run_script(Script::File(script), options).await,
        Commands::Exec { source, options } => run_script(Script::Inline(source.join(" ")), options).await,
        Commands::Check { script } => check(&script),
        Commands::DebugAdapter => debug_adapter().await,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("shrun: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let outcome = runtime.block_on(dispatch(cli.command));
    // stdin reads in the debug adapter never return on their own
    runtime.shutdown_timeout(Duration::from_millis(100));

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("shrun: {e:#}");
            ExitCode::FAILURE
        }
    }
}
