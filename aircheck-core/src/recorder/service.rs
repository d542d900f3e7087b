//! Recording lifecycle: start/stop, the periodic live check and the stall
//! detector.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::files::{aac_sibling, candidate_paths, recording_file_name, sanitize_stage};
use super::{GrowthState, Recorder, RecordingSession, SessionSlot};
use crate::discovery::resolve::value_at;
use crate::discovery::{find_live_broadcast, LiveBroadcast};
use crate::error::Result;
use crate::process::{KillSignal, SpawnSpec};

/// Why a start request did not spawn anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    AlreadyRunning,
    NotLive,
    FetchFailed,
}

/// Result of a start request, successful or skipped.
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl StartOutcome {
    fn skipped(stage: Option<&str>, channel: Option<&str>, reason: SkipReason) -> Self {
        Self {
            started: false,
            reason: Some(reason),
            stage: stage.map(str::to_owned),
            channel: channel.map(str::to_owned),
            file_name: None,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    pub stage: String,
}

/// Per-channel result of one monitoring pass.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelCheck {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Stage a payload names for a channel when no broadcast is considered,
/// used to key the stop-when-offline path.
fn payload_stage_name(data: &Value, channel: &str) -> String {
    value_at(data, &["data", "attributes", "username"])
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| channel.to_string())
}

impl Recorder {
    /// Fetch the channel-view payload, reducing errors to `None` so one
    /// bad channel cannot abort a monitoring pass.
    pub(crate) async fn fetch_stream_info(&self, channel: &str) -> Option<Value> {
        match self.discovery.channel_view(channel).await {
            Ok(data) => Some(data),
            Err(err) => {
                error!(
                    channel = %self.discovery.normalize_slug(channel),
                    %err,
                    "channel view fetch failed"
                );
                None
            }
        }
    }

    /// Start a capture process for a stage.
    ///
    /// The stage is reserved in the session map before any await so a
    /// concurrent call for the same stage backs off with `already-running`
    /// instead of spawning a second process. On spawn failure the
    /// reservation is rolled back.
    pub async fn start_recording(
        &self,
        stage: &str,
        stream_url: &str,
        channel: Option<&str>,
    ) -> Result<StartOutcome> {
        let stage = sanitize_stage(stage);
        if self.sessions.contains_key(&stage) {
            return Ok(StartOutcome::skipped(
                Some(&stage),
                channel,
                SkipReason::AlreadyRunning,
            ));
        }

        let stage_dir = self.recordings_root().join(&stage);
        tokio::fs::create_dir_all(&stage_dir).await?;

        let started_at = Utc::now();
        let file_name = recording_file_name(&stage, started_at);
        let planned_path = stage_dir.join(&file_name);

        match self.sessions.entry(stage.clone()) {
            Entry::Occupied(_) => {
                return Ok(StartOutcome::skipped(
                    Some(&stage),
                    channel,
                    SkipReason::AlreadyRunning,
                ));
            }
            Entry::Vacant(slot) => {
                slot.insert(SessionSlot::Starting);
            }
        }

        info!(stage = %stage, url = %stream_url, "starting recording");

        let spec = self.capture_spec(&stage, stream_url, &planned_path);
        let handle = match self.runner.spawn(spec).await {
            Ok(handle) => handle,
            Err(err) => {
                self.sessions.remove(&stage);
                return Err(err);
            }
        };

        let session = Arc::new(RecordingSession {
            stage: stage.clone(),
            channel: channel.unwrap_or(&stage).to_string(),
            planned_path: planned_path.clone(),
            file_name: file_name.clone(),
            started_at,
            source_url: stream_url.to_string(),
            handle,
            growth: Mutex::new(GrowthState {
                last_size: 0,
                last_check: Instant::now(),
                current_path: None,
            }),
        });
        self.sessions
            .insert(stage.clone(), SessionSlot::Active(Arc::clone(&session)));
        self.watch_exit(session);

        Ok(StartOutcome {
            started: true,
            reason: None,
            stage: Some(stage),
            channel: channel.map(str::to_owned),
            file_name: Some(file_name),
            path: Some(planned_path),
        })
    }

    fn capture_spec(&self, stage: &str, stream_url: &str, planned: &Path) -> SpawnSpec {
        let log_stage = stage.to_string();
        SpawnSpec::new(
            format!("capture:{stage}"),
            self.config.capture_command.as_str(),
        )
        .args([
            "--no-part",
            "-f",
            "bestaudio",
            "--extract-audio",
            "--audio-format",
            "mp3",
            "--live-from-start",
            "-o",
        ])
        .arg(planned.to_string_lossy())
        .arg(stream_url)
        .on_stderr(move |line| {
            if line.to_lowercase().contains("error") {
                error!(stage = %log_stage, "capture: {line}");
            }
        })
    }

    /// Clean up after a capture process exits: drop the intermediate AAC
    /// download on clean exits and release the stage. The removal is
    /// pointer-guarded so a successor session for the same stage is never
    /// evicted by a stale watcher.
    fn watch_exit(&self, session: Arc<RecordingSession>) {
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let exit = session.handle.wait().await;
            info!(stage = %session.stage, exit = %exit, "recording finished");

            if exit.code == Some(0) {
                let aac = aac_sibling(&session.planned_path);
                match tokio::fs::remove_file(&aac).await {
                    Ok(()) => {
                        info!(stage = %session.stage, path = %aac.display(), "removed source AAC file");
                    }
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(
                            stage = %session.stage,
                            path = %aac.display(),
                            %err,
                            "could not remove AAC file"
                        );
                    }
                }
            }

            sessions.remove_if(&session.stage, |_, slot| {
                matches!(slot, SessionSlot::Active(current) if Arc::ptr_eq(current, &session))
            });
        });
    }

    /// Signal a running session. The session map entry is released by the
    /// exit watcher once the process is actually gone.
    pub fn stop_recording(&self, stage: &str, signal: KillSignal) -> StopOutcome {
        let stage = sanitize_stage(stage);
        match self.active_session(&stage) {
            Some(session) => {
                session.handle.kill(signal);
                StopOutcome {
                    stopped: true,
                    reason: None,
                    stage,
                }
            }
            None => StopOutcome {
                stopped: false,
                reason: Some("not-found"),
                stage,
            },
        }
    }

    /// Stop every session and wait for the processes to go away. Sessions
    /// still alive after the grace period are force-killed.
    pub async fn stop_all(&self, signal: KillSignal) {
        let sessions = self.active_sessions();
        if sessions.is_empty() {
            self.sessions.clear();
            return;
        }

        for session in &sessions {
            session.handle.kill(signal);
        }

        let drain = async {
            for session in &sessions {
                session.handle.wait().await;
            }
        };
        if tokio::time::timeout(self.config.stop_grace(), drain)
            .await
            .is_err()
        {
            warn!("recordings did not stop within grace period, force killing");
            for session in &sessions {
                session.handle.kill(KillSignal::Kill);
            }
            for session in &sessions {
                session.handle.wait().await;
            }
        }

        self.sessions.clear();
    }

    /// One monitoring pass: start captures for channels that went live,
    /// stop sessions whose channel went offline. Channels are independent;
    /// a fetch failure is recorded per channel and the pass continues.
    pub async fn check_channels(&self) -> Vec<ChannelCheck> {
        let channels = self.channels();
        let mut results = Vec::with_capacity(channels.len());

        for channel in channels {
            let Some(data) = self.fetch_stream_info(&channel).await else {
                results.push(ChannelCheck {
                    channel,
                    stage: None,
                    live: false,
                    error: Some("fetch-failed".to_string()),
                });
                continue;
            };

            let stage_name = payload_stage_name(&data, &channel);
            match find_live_broadcast(&data) {
                Some(live) => {
                    let error = self.start_for_check(&live, &channel).await;
                    results.push(ChannelCheck {
                        channel,
                        stage: Some(live.stage),
                        live: true,
                        error,
                    });
                }
                None => {
                    let stage_key = sanitize_stage(&stage_name);
                    if self.sessions.contains_key(&stage_key) {
                        info!(stage = %stage_key, "stream offline, stopping recording");
                        self.stop_recording(&stage_key, KillSignal::Interrupt);
                    }
                    results.push(ChannelCheck {
                        channel,
                        stage: Some(stage_name),
                        live: false,
                        error: None,
                    });
                }
            }
        }

        results
    }

    async fn start_for_check(&self, live: &LiveBroadcast, channel: &str) -> Option<String> {
        match self
            .start_recording(&live.stage, &live.stream_url, Some(channel))
            .await
        {
            Ok(_) => None,
            Err(err) => {
                error!(channel, stage = %live.stage, %err, "failed to start capture");
                Some(err.to_string())
            }
        }
    }

    /// Check a single channel on demand and start a capture if it is live.
    pub async fn start_channel(&self, channel: &str) -> Result<StartOutcome> {
        let Some(data) = self.fetch_stream_info(channel).await else {
            return Ok(StartOutcome::skipped(
                None,
                Some(channel),
                SkipReason::FetchFailed,
            ));
        };

        let stage_name = payload_stage_name(&data, channel);
        let Some(live) = find_live_broadcast(&data) else {
            return Ok(StartOutcome::skipped(
                Some(&stage_name),
                Some(channel),
                SkipReason::NotLive,
            ));
        };

        let mut outcome = self
            .start_recording(&live.stage, &live.stream_url, Some(channel))
            .await?;
        outcome.channel = Some(channel.to_string());
        Ok(outcome)
    }

    /// Locate the file the capture tool is writing for a session, trying
    /// each configured suffix against the planned stem.
    pub(crate) async fn resolve_recording_file(
        &self,
        session: &RecordingSession,
    ) -> Option<(PathBuf, u64)> {
        for candidate in candidate_paths(&session.planned_path, &self.config.candidate_suffixes) {
            match tokio::fs::metadata(&candidate).await {
                Ok(meta) if meta.is_file() => return Some((candidate, meta.len())),
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    error!(
                        stage = %session.stage,
                        path = %candidate.display(),
                        %err,
                        "stat failed"
                    );
                    return None;
                }
            }
        }
        None
    }

    /// One stall pass: a session whose backing file has not grown within
    /// the stall timeout is force-killed and forgotten so the next live
    /// check can start fresh. A session with no backing file yet is left
    /// alone; the capture tool may still be connecting.
    pub async fn monitor_stalled(&self) {
        let timeout = self.config.stalled_timeout();
        for session in self.active_sessions() {
            let Some((path, size)) = self.resolve_recording_file(&session).await else {
                continue;
            };

            let mut growth = session.growth.lock();
            if size > growth.last_size {
                growth.last_size = size;
                growth.last_check = Instant::now();
                growth.current_path = Some(path);
            } else if growth.last_check.elapsed() > timeout {
                drop(growth);
                warn!(stage = %session.stage, "recording stalled, restarting");
                session.handle.kill(KillSignal::Kill);
                self.sessions.remove_if(&session.stage, |_, slot| {
                    matches!(slot, SessionSlot::Active(current) if Arc::ptr_eq(current, &session))
                });
            }
        }
    }

    /// Start the periodic live-check and stall-check loops. Idempotent:
    /// when already monitoring this only applies the channel override and
    /// reports status.
    pub fn start_monitoring(self: &Arc<Self>, channels: Option<Vec<String>>) -> super::MonitorStatus {
        if let Some(channels) = channels {
            self.set_channels(channels);
        }
        if self.monitoring.swap(true, Ordering::SeqCst) {
            return self.monitor_status();
        }

        let mut tasks = self.monitor_tasks.lock();
        tasks.push(self.spawn_check_loop());
        tasks.push(self.spawn_stall_loop());
        drop(tasks);

        self.monitor_status()
    }

    fn spawn_check_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = tokio::fs::create_dir_all(recorder.recordings_root()).await {
                error!(%err, "could not initialize monitoring");
            }
            let mut ticker = tokio::time::interval(recorder.config.check_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately, giving the initial pass;
            // passes never overlap because the loop awaits each one.
            loop {
                ticker.tick().await;
                recorder.check_channels().await;
            }
        })
    }

    fn spawn_stall_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let recorder = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(recorder.config.stalled_check_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                recorder.monitor_stalled().await;
            }
        })
    }

    /// Stop the monitoring loops, optionally draining every running
    /// recording as well.
    pub async fn stop_monitoring(&self, stop_recordings: bool) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.monitor_tasks.lock();
            guard.drain(..).collect()
        };
        for task in &tasks {
            task.abort();
        }
        self.monitoring.store(false, Ordering::SeqCst);

        if stop_recordings {
            self.stop_all(KillSignal::Interrupt).await;
        }
    }
}
