//! One supervised child process

use crate::cancel::CancellationToken;
use crate::error::{HarnessError, Result};
use crate::logging::{forward_line, StreamKind};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

const OUTPUT_CAPACITY: usize = 500;

/// Bounded buffer of the most recent output lines
#[derive(Debug)]
pub struct OutputLog {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl OutputLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Last `n` lines, oldest first
    pub fn tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines.lock();
        lines.iter().skip(lines.len().saturating_sub(n)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A service binary that can be started, stopped and restarted with the same env
pub struct ServiceProcess {
    name: String,
    binary: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    shutdown_grace: Duration,
    child: Mutex<Option<Child>>,
    output: Arc<OutputLog>,
}

impl ServiceProcess {
    pub fn new(
        name: impl Into<String>,
        binary: impl Into<PathBuf>,
        env: BTreeMap<String, String>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            binary: binary.into(),
            args: Vec::new(),
            env,
            shutdown_grace,
            child: Mutex::new(None),
            output: Arc::new(OutputLog::new(OUTPUT_CAPACITY)),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn output(&self) -> &OutputLog {
        &self.output
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(Child::id)
    }

    /// Spawn the process unless it is already running
    pub fn start(&self) -> Result<()> {
        let mut slot = self.child.lock();
        if let Some(child) = slot.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }

        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HarnessError::Process(format!("Failed to spawn {} ({}): {}", self.name, self.binary.display(), e))
            })?;

        if let Some(stdout) = child.stdout.take() {
            self.pump(stdout, StreamKind::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.pump(stderr, StreamKind::Stderr);
        }

        tracing::info!(service = %self.name, pid = ?child.id(), "service process started");
        *slot = Some(child);
        Ok(())
    }

    fn pump<R>(&self, reader: R, stream: StreamKind)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let name = self.name.clone();
        let output = self.output.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                forward_line(&name, stream, &line);
                output.push(line);
            }
        });
    }

    /// Whether the child exists and has not exited
    pub fn is_running(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Exit status if the child has already exited
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.child
            .lock()
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
    }

    /// Graceful stop: SIGTERM, then SIGKILL after the grace period.
    /// A cancelled token skips straight to SIGKILL.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<Option<ExitStatus>> {
        let child = self.child.lock().take();
        let Some(mut child) = child else {
            return Ok(None);
        };

        if let Ok(Some(status)) = child.try_wait() {
            return Ok(Some(status));
        }

        if cancel.is_cancelled() {
            return self.kill(&mut child).await.map(Some);
        }

        if let Some(pid) = child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(service = %self.name, error = %e, "SIGTERM failed, killing");
                return self.kill(&mut child).await.map(Some);
            }
        }

        tokio::select! {
            waited = tokio::time::timeout(self.shutdown_grace, child.wait()) => match waited {
                Ok(status) => {
                    let status = status?;
                    tracing::info!(service = %self.name, %status, "service process exited");
                    Ok(Some(status))
                }
                Err(_) => {
                    tracing::warn!(service = %self.name, grace = ?self.shutdown_grace, "grace period elapsed, killing");
                    self.kill(&mut child).await.map(Some)
                }
            },
            _ = cancel.cancelled() => {
                self.kill(&mut child).await.map(Some)
            }
        }
    }

    async fn kill(&self, child: &mut Child) -> Result<ExitStatus> {
        if let Err(e) = child.start_kill() {
            tracing::debug!(service = %self.name, error = %e, "start_kill");
        }
        let status = child.wait().await?;
        tracing::info!(service = %self.name, %status, "service process killed");
        Ok(status)
    }
}
