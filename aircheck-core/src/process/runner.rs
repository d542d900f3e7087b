use std::process::Stdio;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{KillSignal, LineCallback, ProcessHandle, ProcessRunner, SpawnSpec};
use crate::error::{Error, Result};
use crate::process::ProcessExit;

/// [`ProcessRunner`] backed by real OS children via `tokio::process`.
///
/// Each spawn gets a supervising task that owns the [`Child`]: it forwards
/// kill requests, enforces the optional timeout and publishes the exit
/// report once the child is reaped.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRunner;

impl CommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ProcessRunner for CommandRunner {
    async fn spawn(&self, spec: SpawnSpec) -> Result<ProcessHandle> {
        let SpawnSpec {
            name,
            command,
            args,
            env,
            cwd,
            timeout,
            on_stdout,
            on_stderr,
        } = spec;

        let mut cmd = Command::new(&command);
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(true);
        cmd.envs(env);
        if let Some(dir) = &cwd {
            cmd.current_dir(dir);
        }
        cmd.stdout(if on_stdout.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(if on_stderr.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            name: name.clone(),
            source,
        })?;
        let pid = child.id();

        info!(
            process = %name,
            command = %command,
            pid = pid.unwrap_or_default(),
            "process started"
        );

        if let Some(callback) = on_stdout {
            if let Some(stdout) = child.stdout.take() {
                pump_lines(stdout, callback);
            }
        }
        if let Some(callback) = on_stderr {
            if let Some(stderr) = child.stderr.take() {
                pump_lines(stderr, callback);
            }
        }

        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<KillSignal>();
        let (exit_tx, exit_rx) = watch::channel(None);

        let monitor_name = name.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let mut timed_out = false;

            let timeout_fut = async move {
                match timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(timeout_fut);

            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    _ = &mut timeout_fut, if !timed_out => {
                        timed_out = true;
                        warn!(process = %monitor_name, "process timeout elapsed, killing");
                        deliver_signal(&mut child, &monitor_name, KillSignal::Kill);
                    }
                    Some(signal) = kill_rx.recv() => {
                        deliver_signal(&mut child, &monitor_name, signal);
                    }
                }
            };

            let duration = started.elapsed();
            let exit = match status {
                Ok(status) => {
                    #[cfg(unix)]
                    let signal = {
                        use std::os::unix::process::ExitStatusExt;
                        status.signal()
                    };
                    #[cfg(not(unix))]
                    let signal = None;
                    ProcessExit {
                        code: status.code(),
                        signal,
                        timed_out,
                        duration,
                    }
                }
                Err(err) => {
                    error!(process = %monitor_name, %err, "process wait failed");
                    ProcessExit {
                        code: None,
                        signal: None,
                        timed_out,
                        duration,
                    }
                }
            };

            let duration_ms = duration.as_millis() as u64;
            if exit.success() {
                info!(process = %monitor_name, exit = %exit, duration_ms, "process exited");
            } else {
                warn!(process = %monitor_name, exit = %exit, duration_ms, "process exited");
            }
            let _ = exit_tx.send(Some(exit));
        });

        Ok(ProcessHandle::new(name, pid, kill_tx, exit_rx))
    }
}

fn deliver_signal(child: &mut Child, name: &str, signal: KillSignal) {
    match signal {
        KillSignal::Interrupt => interrupt(child, name),
        KillSignal::Kill => {
            if let Err(err) = child.start_kill() {
                debug!(process = %name, %err, "kill delivery failed");
            }
        }
    }
}

#[cfg(unix)]
fn interrupt(child: &mut Child, name: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            debug!(process = %name, %err, "interrupt delivery failed");
        }
    }
}

#[cfg(not(unix))]
fn interrupt(child: &mut Child, name: &str) {
    if let Err(err) = child.start_kill() {
        debug!(process = %name, %err, "interrupt delivery failed");
    }
}

fn pump_lines<R>(reader: R, callback: LineCallback)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            callback(&line);
        }
    });
}
