//! Engine configuration, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, ShellError, ShellResult};

/// Mode used for commands that are neither user functions nor stdlib functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultMode {
    #[default]
    Process,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache_capacity: usize,
    pub pool_max_size: usize,
    pub pool_idle_timeout_secs: u64,
    pub pool_sweep_interval_secs: u64,
    pub max_while_iterations: usize,
    pub max_call_depth: usize,
    pub default_mode: DefaultMode,
    /// Deadline applied to a whole run by the CLI.
    pub command_timeout_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1000,
            pool_max_size: 10,
            pool_idle_timeout_secs: 30,
            pool_sweep_interval_secs: 60,
            max_while_iterations: 10_000,
            max_call_depth: 256,
            default_mode: DefaultMode::Process,
            command_timeout_ms: None,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> ShellResult<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> ShellResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShellError::new(ErrorKind::Config, format!("failed to read config: {e}"))
                .with_context("path", path.display().to_string())
        })?;
        Self::from_toml_str(&content)
            .map_err(|e| e.with_context("path", path.display().to_string()))
    }

    fn validate(&self) -> ShellResult<()> {
        if self.cache_capacity == 0 {
            return Err(ShellError::new(ErrorKind::Config, "cache_capacity must be positive"));
        }
        if self.pool_max_size == 0 {
            return Err(ShellError::new(ErrorKind::Config, "pool_max_size must be positive"));
        }
        if self.pool_sweep_interval_secs == 0 {
            return Err(ShellError::new(
                ErrorKind::Config,
                "pool_sweep_interval_secs must be positive",
            ));
        }
        if self.max_call_depth == 0 {
            return Err(ShellError::new(ErrorKind::Config, "max_call_depth must be positive"));
        }
        Ok(())
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn pool_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.pool_sweep_interval_secs)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}
