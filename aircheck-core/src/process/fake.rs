//! In-memory [`ProcessRunner`] for tests. Spawned "processes" never touch
//! the OS: tests script their exits, or let a kill resolve them the way a
//! signalled capture tool would.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::{KillSignal, ProcessExit, ProcessHandle, ProcessRunner, SpawnSpec};
use crate::error::{Error, Result};

/// One recorded spawn.
pub struct FakeProcess {
    name: String,
    command: String,
    args: Vec<String>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    kills: Mutex<Vec<KillSignal>>,
}

impl FakeProcess {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Publish an exit report. The first report wins; later calls are
    /// ignored so a scripted exit is not clobbered by a racing kill.
    pub fn exit(&self, exit: ProcessExit) {
        self.exit_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(exit);
                true
            } else {
                false
            }
        });
    }

    pub fn exit_code(&self, code: i32) {
        self.exit(ProcessExit {
            code: Some(code),
            ..ProcessExit::default()
        });
    }

    pub fn exit_signal(&self, signal: i32) {
        self.exit(ProcessExit {
            signal: Some(signal),
            ..ProcessExit::default()
        });
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exit_tx.borrow().is_some()
    }

    #[must_use]
    pub fn kills(&self) -> Vec<KillSignal> {
        self.kills.lock().clone()
    }

    #[must_use]
    pub fn was_killed(&self) -> bool {
        !self.kills.lock().is_empty()
    }
}

/// Recording [`ProcessRunner`] double.
pub struct FakeRunner {
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    auto_exits: Mutex<VecDeque<ProcessExit>>,
    spawn_failures: Mutex<u32>,
    next_pid: AtomicU32,
}

impl FakeRunner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            processes: Mutex::new(Vec::new()),
            auto_exits: Mutex::new(VecDeque::new()),
            spawn_failures: Mutex::new(0),
            next_pid: AtomicU32::new(40_000),
        }
    }

    /// Queue an exit that the next spawn publishes immediately. Used to
    /// script retry sequences for [`ProcessRunner::run`].
    pub fn queue_exit(&self, exit: ProcessExit) {
        self.auto_exits.lock().push_back(exit);
    }

    pub fn queue_exit_code(&self, code: i32) {
        self.queue_exit(ProcessExit {
            code: Some(code),
            ..ProcessExit::default()
        });
    }

    /// Make the next spawn fail with [`Error::Spawn`].
    pub fn fail_next_spawn(&self) {
        *self.spawn_failures.lock() += 1;
    }

    #[must_use]
    pub fn processes(&self) -> Vec<Arc<FakeProcess>> {
        self.processes.lock().clone()
    }

    #[must_use]
    pub fn spawn_count(&self) -> usize {
        self.processes.lock().len()
    }

    #[must_use]
    pub fn last(&self) -> Option<Arc<FakeProcess>> {
        self.processes.lock().last().cloned()
    }

    /// First spawn whose name contains `needle`.
    #[must_use]
    pub fn find(&self, needle: &str) -> Option<Arc<FakeProcess>> {
        self.processes
            .lock()
            .iter()
            .find(|process| process.name.contains(needle))
            .cloned()
    }
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ProcessRunner for FakeRunner {
    async fn spawn(&self, spec: SpawnSpec) -> Result<ProcessHandle> {
        let should_fail = {
            let mut failures = self.spawn_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                true
            } else {
                false
            }
        };
        if should_fail {
            return Err(Error::Spawn {
                name: spec.name,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        }

        let (kill_tx, mut kill_rx) = mpsc::unbounded_channel::<KillSignal>();
        let (exit_tx, exit_rx) = watch::channel(None);

        let process = Arc::new(FakeProcess {
            name: spec.name.clone(),
            command: spec.command,
            args: spec.args,
            exit_tx,
            kills: Mutex::new(Vec::new()),
        });
        self.processes.lock().push(process.clone());

        let listener = process.clone();
        tokio::spawn(async move {
            while let Some(signal) = kill_rx.recv().await {
                listener.kills.lock().push(signal);
                let signum = match signal {
                    KillSignal::Interrupt => 2,
                    KillSignal::Kill => 9,
                };
                listener.exit(ProcessExit {
                    signal: Some(signum),
                    ..ProcessExit::default()
                });
            }
        });

        if let Some(exit) = self.auto_exits.lock().pop_front() {
            process.exit(exit);
        }

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        Ok(ProcessHandle::new(spec.name, Some(pid), kill_tx, exit_rx))
    }
}
