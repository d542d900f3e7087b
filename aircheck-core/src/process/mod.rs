//! Child-process supervision: spawn specs, exit reporting, kill signalling
//! and a retrying one-shot runner built on top of them.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::error::{Error, Result};

pub mod fake;
mod runner;

pub use fake::FakeRunner;
pub use runner::CommandRunner;

/// Callback invoked with each line a child writes to one of its pipes.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Everything needed to launch one child process.
///
/// `name` identifies the process in logs and errors; it does not have to be
/// unique. Output pipes are only opened when a matching callback is set.
#[derive(Clone)]
pub struct SpawnSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    /// Overall wall-clock limit; the child is force-killed when it elapses.
    pub timeout: Option<Duration>,
    pub on_stdout: Option<LineCallback>,
    pub on_stderr: Option<LineCallback>,
}

impl SpawnSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            timeout: None,
            on_stdout: None,
            on_stderr: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn on_stdout(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stdout = Some(Arc::new(callback));
        self
    }

    #[must_use]
    pub fn on_stderr(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_stderr = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for SpawnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnSpec")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("cwd", &self.cwd)
            .field("timeout", &self.timeout)
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Set when the spawn timeout elapsed and the child was force-killed.
    pub timed_out: bool,
    /// Wall-clock time from spawn to exit.
    pub duration: Duration,
}

impl ProcessExit {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out {
            write!(f, "timed out")?;
            if let Some(signal) = self.signal {
                write!(f, " (signal {signal})")?;
            }
            return Ok(());
        }
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown"),
        }
    }
}

/// Signal delivered through [`ProcessHandle::kill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Ask the child to wind down (SIGINT where available).
    Interrupt,
    /// Terminate immediately.
    Kill,
}

/// Cheap, cloneable view of a running child.
///
/// Kills are requests: they are delivered to the supervising task and are a
/// no-op once the process has already exited. The exit report is published
/// exactly once and every clone of the handle observes the same value.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<KillSignal>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    pub(crate) fn new(
        name: String,
        pid: Option<u32>,
        kill_tx: mpsc::UnboundedSender<KillSignal>,
        exit_rx: watch::Receiver<Option<ProcessExit>>,
    ) -> Self {
        Self {
            name,
            pid,
            kill_tx,
            exit_rx,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request a kill. Silently ignored when the process is already gone.
    pub fn kill(&self, signal: KillSignal) {
        let _ = self.kill_tx.send(signal);
    }

    /// The exit report, if the process has finished.
    #[must_use]
    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.exit().is_none()
    }

    /// Wait for the process to finish and return its exit report.
    pub async fn wait(&self) -> ProcessExit {
        let mut exit_rx = self.exit_rx.clone();
        let exit = match exit_rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => exit.unwrap_or_default(),
            // Supervisor dropped without reporting; treat as an opaque exit.
            Err(_) => ProcessExit::default(),
        };
        exit
    }
}

/// Outcome of a successful [`ProcessRunner::run`] call.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub exit: ProcessExit,
    /// 1-based attempt number that succeeded.
    pub attempt: u32,
}

/// Spawns supervised child processes.
///
/// The trait seam exists so services can be exercised without touching the
/// OS; see [`FakeRunner`].
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(&self, spec: SpawnSpec) -> Result<ProcessHandle>;

    /// Run a command to completion, retrying non-zero exits.
    ///
    /// Resolves on the first zero exit code. Spawn failures abort
    /// immediately; any other failure is retried after `retry_delay` until
    /// `attempts` is exhausted, then reported as [`Error::CommandFailed`]
    /// carrying the last exit.
    async fn run(
        &self,
        spec: SpawnSpec,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<RunOutcome> {
        let total = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut attempt_spec = spec.clone();
            attempt_spec.name = format!("{}:attempt-{attempt}", spec.name);
            let handle = self.spawn(attempt_spec).await?;
            let exit = handle.wait().await;
            if exit.success() {
                return Ok(RunOutcome { exit, attempt });
            }
            if attempt >= total {
                return Err(Error::CommandFailed {
                    command: spec.command.clone(),
                    attempts: attempt,
                    exit,
                });
            }
            warn!(
                command = %spec.command,
                attempt,
                exit = %exit,
                "command failed, retrying"
            );
            tokio::time::sleep(retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_display() {
        let clean = ProcessExit {
            code: Some(0),
            ..ProcessExit::default()
        };
        assert_eq!(clean.to_string(), "code 0");
        assert!(clean.success());

        let killed = ProcessExit {
            signal: Some(9),
            ..ProcessExit::default()
        };
        assert_eq!(killed.to_string(), "signal 9");
        assert!(!killed.success());

        let expired = ProcessExit {
            signal: Some(9),
            timed_out: true,
            ..ProcessExit::default()
        };
        assert_eq!(expired.to_string(), "timed out (signal 9)");
        assert!(!expired.success());
    }

    #[test]
    fn test_spawn_spec_builder() {
        let spec = SpawnSpec::new("capture", "yt-dlp")
            .arg("--no-part")
            .args(["-f", "bestaudio"])
            .env("LC_ALL", "C")
            .timeout(Duration::from_secs(5))
            .on_stderr(|_| {});

        assert_eq!(spec.args, ["--no-part", "-f", "bestaudio"]);
        assert_eq!(spec.env, [("LC_ALL".to_string(), "C".to_string())]);
        assert_eq!(spec.timeout, Some(Duration::from_secs(5)));
        assert!(spec.on_stderr.is_some());
        assert!(spec.on_stdout.is_none());

        let debug = format!("{spec:?}");
        assert!(debug.contains("yt-dlp"));
    }
}
