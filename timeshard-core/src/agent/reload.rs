//! Worker reload triggers

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, TimeshardError};

/// Capability to make the co-located worker re-read its config
#[async_trait]
pub trait ReloadTrigger: Send + Sync {
    /// Trigger a reload and wait for the worker to acknowledge it
    ///
    /// Fails with `ReloadTimeout` if no acknowledgement arrives in time.
    async fn reload(&self, timeout: Duration) -> Result<()>;
}

fn reload_failed(reason: impl Into<String>) -> TimeshardError {
    TimeshardError::ReloadFailed { reason: reason.into() }
}

/// Sends SIGHUP to the worker found in the shared process namespace
pub struct SignalReloader {
    pattern: String,
    ready_url: Option<String>,
    proc_root: PathBuf,
    settle: Duration,
    ready_interval: Duration,
    client: reqwest::Client,
}

impl SignalReloader {
    pub fn new(pattern: impl Into<String>, ready_url: Option<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ready_url,
            proc_root: PathBuf::from("/proc"),
            settle: Duration::from_secs(2),
            ready_interval: Duration::from_millis(500),
            client: reqwest::Client::new(),
        }
    }

    /// Scan a different proc mount
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    /// Pid of the first process whose command line contains the pattern
    pub async fn find_worker_pid(&self) -> Result<Option<i32>> {
        let own = std::process::id() as i32;
        let mut entries = tokio::fs::read_dir(&self.proc_root)
            .await
            .map_err(|e| reload_failed(format!("cannot list {}: {}", self.proc_root.display(), e)))?;

        let mut pids = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) {
                if pid != own {
                    pids.push(pid);
                }
            }
        }
        pids.sort_unstable();

        for pid in pids {
            let path = self.proc_root.join(pid.to_string()).join("cmdline");
            // Processes can exit between listing and reading
            let Ok(raw) = tokio::fs::read(&path).await else {
                continue;
            };
            let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
            if cmdline.contains(&self.pattern) {
                debug!("Worker process {} matches {:?}", pid, self.pattern);
                return Ok(Some(pid));
            }
        }
        Ok(None)
    }

    async fn signal_and_wait(&self) -> Result<()> {
        let pid = self
            .find_worker_pid()
            .await?
            .ok_or_else(|| reload_failed(format!("no process matching {:?}", self.pattern)))?;

        let target = Pid::from_raw(pid);
        kill(target, Signal::SIGHUP)
            .map_err(|e| reload_failed(format!("SIGHUP to {} failed: {}", pid, e)))?;
        info!("Sent SIGHUP to worker {}", pid);

        tokio::time::sleep(self.settle).await;

        match &self.ready_url {
            Some(url) => loop {
                match self.client.get(url).send().await {
                    Ok(response) if response.status().is_success() => return Ok(()),
                    Ok(response) => debug!("Worker not ready yet: {}", response.status()),
                    Err(e) => debug!("Readiness check failed: {}", e),
                }
                tokio::time::sleep(self.ready_interval).await;
            },
            None => {
                // No signal: only checks that the pid still exists
                kill(target, None)
                    .map_err(|_| reload_failed(format!("worker {} exited after reload", pid)))
            }
        }
    }
}

#[async_trait]
impl ReloadTrigger for SignalReloader {
    async fn reload(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.signal_and_wait())
            .await
            .map_err(|_| TimeshardError::ReloadTimeout {
                timeout_secs: timeout.as_secs(),
            })?
    }
}

/// Reload trigger with a scripted sequence of outcomes
///
/// Calls beyond the script succeed.
#[derive(Default)]
pub struct ScriptedReloader {
    script: Mutex<VecDeque<Result<()>>>,
    calls: AtomicU32,
}

impl ScriptedReloader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of a future call
    pub fn push(&self, outcome: Result<()>) {
        self.script.lock().push_back(outcome);
    }

    /// Number of reloads requested so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReloadTrigger for ScriptedReloader {
    async fn reload(&self, _timeout: Duration) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script.lock().pop_front().unwrap_or(Ok(()))
    }
}
