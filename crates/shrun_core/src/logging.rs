//! Subscriber installation for binaries embedding the engine.
//!
//! Logs always go to stderr: stdout carries script output, or the DAP
//! stream when running as a debug adapter.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ErrorKind, ShellError, ShellResult};

/// Environment variable overriding the configured filter.
pub const LOG_ENV: &str = "SHRUN_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Plain,
            ansi: false,
        }
    }
}

fn build_filter(config: &LoggingConfig) -> ShellResult<EnvFilter> {
    if let Ok(directives) = std::env::var(LOG_ENV) {
        if let Ok(filter) = EnvFilter::try_new(&directives) {
            return Ok(filter);
        }
    }
    EnvFilter::try_new(&config.level)
        .or_else(|_| EnvFilter::try_new("warn"))
        .map_err(|e| ShellError::new(ErrorKind::Config, format!("invalid log filter: {e}")))
}

/// Install the global subscriber. A second call is reported as an error
/// rather than replacing the first subscriber.
pub fn init(config: &LoggingConfig) -> ShellResult<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match config.format {
        #[cfg(feature = "logging-json")]
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        #[cfg(not(feature = "logging-json"))]
        LogFormat::Json => registry
            .with(fmt::layer().with_ansi(config.ansi).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_ansi(config.ansi).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Plain => registry
            .with(fmt::layer().with_ansi(config.ansi).with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| {
        ShellError::new(ErrorKind::Config, format!("logging already initialized: {e}"))
    })
}
