//! Variable storage: the [`EnvStore`] contract, the default process-backed
//! store and the scope chain used for function calls.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ShellError, ShellResult};

/// Key-value environment plus a working directory.
pub trait EnvStore: Send + Sync {
    fn get_env(&self, name: &str) -> Option<String>;
    fn set_env(&mut self, name: &str, value: &str);
    fn unset_env(&mut self, name: &str);
    /// Every visible variable, including the inherited process environment.
    fn get_all_env(&self) -> HashMap<String, String>;
    fn working_dir(&self) -> PathBuf;
    fn set_working_dir(&mut self, dir: &Path) -> ShellResult<()>;
}

/// Overlay over the process environment.
///
/// Reads fall back to `std::env`; writes and unsets only touch the overlay,
/// so the hosting process environment is never modified.
#[derive(Debug, Clone)]
pub struct EnvironmentManager {
    // None marks a variable unset on top of an inherited value
    overlay: HashMap<String, Option<String>>,
    cwd: PathBuf,
}

impl EnvironmentManager {
    pub fn new() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self {
            overlay: HashMap::new(),
            cwd,
        }
    }

    /// A store that starts in `dir` instead of the process working directory.
    pub fn with_working_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            overlay: HashMap::new(),
            cwd: dir.into(),
        }
    }

    /// A store that sees exactly `vars`. Process variables missing from
    /// `vars` read as unset.
    pub fn from_snapshot(vars: HashMap<String, String>, dir: impl Into<PathBuf>) -> Self {
        let mut overlay: HashMap<String, Option<String>> =
            std::env::vars().map(|(name, _)| (name, None)).collect();
        overlay.extend(vars.into_iter().map(|(name, value)| (name, Some(value))));
        Self {
            overlay,
            cwd: dir.into(),
        }
    }
}

impl Default for EnvironmentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvStore for EnvironmentManager {
    fn get_env(&self, name: &str) -> Option<String> {
        match self.overlay.get(name) {
            Some(value) => value.clone(),
            None => std::env::var(name).ok(),
        }
    }

    fn set_env(&mut self, name: &str, value: &str) {
        self.overlay.insert(name.to_string(), Some(value.to_string()));
    }

    fn unset_env(&mut self, name: &str) {
        self.overlay.insert(name.to_string(), None);
    }

    fn get_all_env(&self) -> HashMap<String, String> {
        let mut all: HashMap<String, String> = std::env::vars().collect();
        apply_frame(&mut all, &self.overlay);
        all
    }

    fn working_dir(&self) -> PathBuf {
        self.cwd.clone()
    }

    fn set_working_dir(&mut self, dir: &Path) -> ShellResult<()> {
        let target = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.cwd.join(dir)
        };
        if !target.is_dir() {
            return Err(ShellError::file_not_found(&target.display().to_string()));
        }
        self.cwd = target;
        Ok(())
    }
}

fn apply_frame(all: &mut HashMap<String, String>, frame: &HashMap<String, Option<String>>) {
    for (name, value) in frame {
        match value {
            Some(v) => {
                all.insert(name.clone(), v.clone());
            }
            None => {
                all.remove(name);
            }
        }
    }
}

/// Stack of variable frames layered over a base store.
///
/// With no frame pushed every operation goes straight to the base. Inside a
/// frame, writes and unsets are recorded in the innermost frame and vanish
/// when it is popped. The working directory is always shared with the base.
pub struct ScopeChain {
    base: Box<dyn EnvStore>,
    frames: Vec<HashMap<String, Option<String>>>,
}

impl ScopeChain {
    pub fn new(base: Box<dyn EnvStore>) -> Self {
        Self {
            base,
            frames: Vec::new(),
        }
    }

    pub fn push_frame(&mut self) {
        self.frames.push(HashMap::new());
    }

    /// Drop the innermost frame and everything written into it.
    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

impl EnvStore for ScopeChain {
    fn get_env(&self, name: &str) -> Option<String> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.get(name) {
                return value.clone();
            }
        }
        self.base.get_env(name)
    }

    fn set_env(&mut self, name: &str, value: &str) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.insert(name.to_string(), Some(value.to_string()));
            }
            None => self.base.set_env(name, value),
        }
    }

    fn unset_env(&mut self, name: &str) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.insert(name.to_string(), None);
            }
            None => self.base.unset_env(name),
        }
    }

    fn get_all_env(&self) -> HashMap<String, String> {
        let mut all = self.base.get_all_env();
        for frame in &self.frames {
            apply_frame(&mut all, frame);
        }
        all
    }

    fn working_dir(&self) -> PathBuf {
        self.base.working_dir()
    }

    fn set_working_dir(&mut self, dir: &Path) -> ShellResult<()> {
        self.base.set_working_dir(dir)
    }
}
