//! Command vetting before anything is executed.

use std::collections::BTreeSet;

use regex::Regex;
use serde::Serialize;
use shrun_parser::Command;

use crate::error::{ShellError, ShellResult};

/// Decides whether a command may run. Implementations must be cheap; the
/// engine consults the checker for every command it dispatches.
pub trait SecurityChecker: Send + Sync {
    fn check_command(&self, cmd: &Command) -> ShellResult<()>;
}

const DANGEROUS_COMMANDS: &[&str] = &[
    "rm", "dd", "mkfs", "fdisk", "shutdown", "reboot", "halt", "poweroff", "chmod", "chown",
    "useradd", "userdel", "groupadd", "groupdel", "passwd",
];

const NETWORK_COMMANDS: &[&str] = &[
    "iptables", "ufw", "route", "ifconfig", "ip", "nc", "nmap", "tcpdump",
];

const SENSITIVE_PATHS: &[&str] = &[
    "/etc/passwd",
    "/etc/shadow",
    "/etc/sudoers",
    "/root/",
    "/boot/",
    "/dev/",
    "/proc/",
    "/sys/",
    "/var/log/",
];

/// Commands allowed to carry shell metacharacters in their arguments.
const INJECTION_EXEMPT: &[&str] = &["shrun", "QueryDB", "QueryRowDB", "ExecDB"];

/// Per-command summary produced by [`SandboxPolicy::report`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityReport {
    pub command: String,
    pub arguments: Vec<String>,
    pub line: usize,
    pub is_dangerous_command: bool,
    pub is_network_command: bool,
    pub sensitive_paths: Vec<String>,
}

/// Default rule set: name blacklists, sensitive path prefixes and a few
/// patterns matched against the whole command line.
pub struct SandboxPolicy {
    dangerous: BTreeSet<String>,
    network: BTreeSet<String>,
    sensitive_paths: BTreeSet<String>,
    recursive_root_delete: Option<Regex>,
    password_arg: Option<Regex>,
    shell_injection: Option<Regex>,
}

impl SandboxPolicy {
    pub fn new() -> Self {
        Self {
            dangerous: DANGEROUS_COMMANDS.iter().map(|s| s.to_string()).collect(),
            network: NETWORK_COMMANDS.iter().map(|s| s.to_string()).collect(),
            sensitive_paths: SENSITIVE_PATHS.iter().map(|s| s.to_string()).collect(),
            recursive_root_delete: Regex::new(r"rm\s+.*-r.*\s+/(\s|$)").ok(),
            password_arg: Regex::new(r"(-p|--password|passwd)\s+(\S+)").ok(),
            shell_injection: Regex::new(r"[;&|`$()]").ok(),
        }
    }

    /// A policy that lets everything through. Useful for trusted scripts.
    pub fn permissive() -> Self {
        Self {
            dangerous: BTreeSet::new(),
            network: BTreeSet::new(),
            sensitive_paths: BTreeSet::new(),
            recursive_root_delete: None,
            password_arg: None,
            shell_injection: None,
        }
    }

    pub fn add_dangerous_command(&mut self, name: &str) {
        self.dangerous.insert(name.to_lowercase());
    }

    pub fn remove_dangerous_command(&mut self, name: &str) {
        self.dangerous.remove(&name.to_lowercase());
    }

    pub fn add_network_command(&mut self, name: &str) {
        self.network.insert(name.to_lowercase());
    }

    pub fn remove_network_command(&mut self, name: &str) {
        self.network.remove(&name.to_lowercase());
    }

    pub fn add_sensitive_path(&mut self, path: &str) {
        self.sensitive_paths.insert(path.to_string());
    }

    pub fn remove_sensitive_path(&mut self, path: &str) {
        self.sensitive_paths.remove(path);
    }

    fn is_sensitive_path(&self, arg: &str) -> bool {
        self.sensitive_paths.iter().any(|p| arg.starts_with(p.as_str()))
    }

    pub fn report(&self, cmd: &Command) -> SecurityReport {
        let lower = cmd.name.to_lowercase();
        SecurityReport {
            command: cmd.name.clone(),
            arguments: cmd.args.clone(),
            line: cmd.pos.line,
            is_dangerous_command: self.dangerous.contains(&lower),
            is_network_command: self.network.contains(&lower),
            sensitive_paths: cmd
                .args
                .iter()
                .filter(|a| self.is_sensitive_path(a))
                .cloned()
                .collect(),
        }
    }

    fn check_patterns(&self, cmd: &Command) -> ShellResult<()> {
        let full = format!("{} {}", cmd.name, cmd.args.join(" "));

        if matches(&self.recursive_root_delete, &full) {
            return Err(ShellError::security(
                "recursive deletion of root directory detected",
            ));
        }
        if matches(&self.password_arg, &full) {
            return Err(ShellError::security("password in command line detected"));
        }
        if matches(&self.shell_injection, &full) && !INJECTION_EXEMPT.contains(&cmd.name.as_str())
        {
            return Err(ShellError::security("potential shell injection detected"));
        }
        Ok(())
    }
}

fn matches(re: &Option<Regex>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityChecker for SandboxPolicy {
    fn check_command(&self, cmd: &Command) -> ShellResult<()> {
        let name = cmd.name.to_lowercase();

        if self.dangerous.contains(&name) {
            return Err(ShellError::security(format!(
                "dangerous command '{name}' is not allowed"
            ))
            .with_context("line", cmd.pos.line.to_string()));
        }
        if self.network.contains(&name) {
            return Err(ShellError::security(format!(
                "network command '{name}' is not allowed"
            ))
            .with_context("line", cmd.pos.line.to_string()));
        }
        if let Some(arg) = cmd.args.iter().find(|a| self.is_sensitive_path(a)) {
            return Err(ShellError::security(format!(
                "access to sensitive file '{arg}' is not allowed"
            ))
            .with_context("line", cmd.pos.line.to_string()));
        }
        self.check_patterns(cmd)
    }
}
