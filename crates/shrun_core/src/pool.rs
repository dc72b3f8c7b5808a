//! Pool of long-lived child processes with piped stdio.
//!
//! Entries are shared as [`PooledProcess`] handles. A sweeper thread closes
//! entries that stay idle past the configured timeout. Lookups of a running
//! entry share the map lock; only spawning, eviction and sweeps take it
//! exclusively.

use std::collections::HashMap;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{ShellError, ShellResult};

pub type PooledProcess = Arc<Mutex<ProcessEntry>>;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Pool key: the command alone, or `cmd:arg1:arg2`.
pub fn process_key(cmd: &str, args: &[String]) -> String {
    if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{}:{}", cmd, args.join(":"))
    }
}

/// A spawned child and its pipes.
#[derive(Debug)]
pub struct ProcessEntry {
    cmd: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    last_used: Instant,
}

impl ProcessEntry {
    fn spawn(cmd: &str, args: &[String]) -> ShellResult<Self> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ShellError::execution_failed(format!("failed to start '{cmd}': {e}"))
                    .with_context("command", cmd)
            })?;
        Ok(Self {
            cmd: cmd.to_string(),
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child: Some(child),
            last_used: Instant::now(),
        })
    }

    pub fn command(&self) -> &str {
        &self.cmd
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    pub fn stdout(&mut self) -> Option<&mut ChildStdout> {
        self.stdout.as_mut()
    }

    pub fn stderr(&mut self) -> Option<&mut ChildStderr> {
        self.stderr.as_mut()
    }

    /// Kill and reap the child, then drop the pipes. Safe to call on an
    /// entry whose child already exited or was never attached.
    pub fn close(&mut self) {
        if let Some(mut child) = self.child.take() {
            // an already exited child makes kill fail; the wait still reaps it
            let _ = child.kill();
            let _ = child.wait();
        }
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
    }
}

impl Drop for ProcessEntry {
    fn drop(&mut self) {
        self.close();
    }
}

struct Slot {
    entry: PooledProcess,
    last_used: Mutex<Instant>,
}

impl Slot {
    fn new(entry: PooledProcess, now: Instant) -> Self {
        Self {
            entry,
            last_used: Mutex::new(now),
        }
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    // a locked entry is in use and therefore alive
    fn is_running(&self) -> bool {
        match self.entry.try_lock() {
            Ok(mut entry) => entry.is_running(),
            Err(_) => true,
        }
    }

    fn touch(&self) {
        let now = Instant::now();
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = now;
        if let Ok(mut entry) = self.entry.try_lock() {
            entry.last_used = now;
        }
    }
}

type Slots = Arc<RwLock<HashMap<String, Slot>>>;

pub struct ProcessPool {
    slots: Slots,
    max_size: usize,
    idle_timeout: Duration,
    stop: Mutex<Option<Sender<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessPool {
    pub fn new(max_size: usize, idle_timeout: Duration) -> Self {
        Self::with_sweep_interval(max_size, idle_timeout, DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(max_size: usize, idle_timeout: Duration, interval: Duration) -> Self {
        let slots: Slots = Arc::new(RwLock::new(HashMap::new()));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let sweeper_slots = Arc::clone(&slots);
        let sweeper = std::thread::Builder::new()
            .name("shrun-pool-sweeper".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => sweep(&sweeper_slots, idle_timeout),
                    _ => break,
                }
            });
        let sweeper = match sweeper {
            Ok(handle) => Some(handle),
            Err(e) => {
                shrun_log_warn!(error = %e, "process pool sweeper not started");
                None
            }
        };

        Self {
            slots,
            max_size: max_size.max(1),
            idle_timeout,
            stop: Mutex::new(Some(stop_tx)),
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Return the running entry for `cmd args`, spawning one if needed.
    pub fn get(&self, cmd: &str, args: &[String]) -> ShellResult<PooledProcess> {
        let key = process_key(cmd, args);
        if let Some(entry) = self.running(&key) {
            return Ok(entry);
        }
        let mut evicted = Vec::new();

        let entry = {
            let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());

            // another caller may have respawned it between the two locks
            if let Some(slot) = slots.get(&key) {
                if slot.is_running() {
                    slot.touch();
                    return Ok(Arc::clone(&slot.entry));
                }
                if let Some(dead) = slots.remove(&key) {
                    evicted.push(dead.entry);
                }
            }

            let entry = Arc::new(Mutex::new(ProcessEntry::spawn(cmd, args)?));
            if slots.len() >= self.max_size {
                if let Some(oldest) = oldest_key(&slots) {
                    if let Some(slot) = slots.remove(&oldest) {
                        shrun_log_debug!(key = %oldest, "evicting oldest pooled process");
                        evicted.push(slot.entry);
                    }
                }
            }
            slots.insert(key, Slot::new(Arc::clone(&entry), Instant::now()));
            entry
        };

        close_all(evicted);
        Ok(entry)
    }

    fn running(&self, key: &str) -> Option<PooledProcess> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get(key)?;
        if !slot.is_running() {
            return None;
        }
        slot.touch();
        Some(Arc::clone(&slot.entry))
    }

    /// Hand an entry back under its name-only key. Closed if that key is
    /// taken or the pool is full.
    pub fn put(&self, entry: PooledProcess) {
        let key = entry
            .lock()
            .map(|e| e.cmd.clone())
            .unwrap_or_else(|e| e.into_inner().cmd.clone());

        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if !slots.contains_key(&key) && slots.len() < self.max_size {
            let now = Instant::now();
            if let Ok(mut e) = entry.lock() {
                e.last_used = now;
            }
            slots.insert(key, Slot::new(entry, now));
        } else {
            drop(slots);
            close_all(vec![entry]);
        }
    }

    pub fn contains(&self, cmd: &str, args: &[String]) -> bool {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&process_key(cmd, args))
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Close every entry and stop the sweeper.
    pub fn close(&self) {
        if let Some(stop) = self.stop.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
        let drained: Vec<PooledProcess> = self
            .slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, slot)| slot.entry)
            .collect();
        close_all(drained);
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn oldest_key(slots: &HashMap<String, Slot>) -> Option<String> {
    slots
        .iter()
        .min_by_key(|(_, slot)| slot.last_used())
        .map(|(key, _)| key.clone())
}

fn sweep(slots: &Slots, idle_timeout: Duration) {
    let now = Instant::now();
    let idle: Vec<PooledProcess> = {
        let mut slots = slots.write().unwrap_or_else(|e| e.into_inner());
        let keys: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| now.saturating_duration_since(slot.last_used()) > idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| slots.remove(&key))
            .map(|slot| slot.entry)
            .collect()
    };
    if !idle.is_empty() {
        shrun_log_debug!(count = idle.len(), "closing idle pooled processes");
    }
    close_all(idle);
}

// Entries are closed outside the slot lock.
fn close_all(entries: Vec<PooledProcess>) {
    for entry in entries {
        entry.lock().unwrap_or_else(|e| e.into_inner()).close();
    }
}
