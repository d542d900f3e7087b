//! On-demand HLS repackaging of live channels.
//!
//! A session is one transcoder process writing a rolling playlist and
//! segments under `root_dir/<channel>/`. Sessions are created on first
//! request, shared by every subsequent listener, and torn down when the
//! transcoder exits or no listener has touched the playlist for the idle
//! timeout.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HlsConfig;
use crate::error::{Error, Result};
use crate::process::{KillSignal, ProcessHandle, ProcessRunner, SpawnSpec};
use crate::recorder::files::{encode_component, sanitize_stage};
use crate::recorder::Recorder;

/// One live transcode session, shared between listeners.
#[derive(Debug)]
pub struct HlsSession {
    channel: String,
    stream_url: String,
    dir: PathBuf,
    playlist_path: PathBuf,
    playlist_url: String,
    handle: ProcessHandle,
    last_used: Mutex<Instant>,
    idle_cancel: CancellationToken,
}

impl HlsSession {
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    #[must_use]
    pub fn stream_url(&self) -> &str {
        &self.stream_url
    }

    #[must_use]
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    #[must_use]
    pub fn playlist_path(&self) -> &std::path::Path {
        &self.playlist_path
    }

    #[must_use]
    pub fn playlist_url(&self) -> &str {
        &self.playlist_url
    }

    /// Mark the session as recently used, pushing the idle deadline out.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }
}

/// Validates file names that may be served out of a session directory.
/// Segment and playlist names never need anything beyond this set.
#[must_use]
pub fn is_safe_segment(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

pub struct HlsManager {
    config: HlsConfig,
    recorder: Arc<Recorder>,
    runner: Arc<dyn ProcessRunner>,
    sessions: Arc<DashMap<String, Arc<HlsSession>>>,
    creation_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl HlsManager {
    #[must_use]
    pub fn new(config: HlsConfig, recorder: Arc<Recorder>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            config,
            recorder,
            runner,
            sessions: Arc::new(DashMap::new()),
            creation_locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn hls_root(&self) -> PathBuf {
        std::path::absolute(&self.config.root_dir)
            .unwrap_or_else(|_| self.config.root_dir.clone())
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn session(&self, channel: &str) -> Option<Arc<HlsSession>> {
        let key = session_key(channel);
        self.sessions.get(&key).map(|entry| entry.value().clone())
    }

    /// Refresh the idle deadline for a channel, returning its session.
    #[must_use]
    pub fn touch(&self, channel: &str) -> Option<Arc<HlsSession>> {
        let session = self.session(channel)?;
        session.touch();
        Some(session)
    }

    /// Return the session for a channel, starting a transcoder if none is
    /// running. Concurrent callers for the same channel share one startup;
    /// the call resolves once the playlist is on disk.
    pub async fn start_session(&self, channel: &str) -> Result<Arc<HlsSession>> {
        let key = session_key(channel);
        if key.is_empty() {
            return Err(Error::InvalidPath);
        }
        if let Some(existing) = self.sessions.get(&key) {
            existing.touch();
            return Ok(existing.clone());
        }

        let lock = self
            .creation_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(existing) = self.sessions.get(&key) {
            existing.touch();
            return Ok(existing.clone());
        }

        let lives = self
            .recorder
            .list_live_streams(Some(vec![channel.trim().to_string()]))
            .await;
        let Some(live) = lives.into_iter().next() else {
            return Err(Error::ChannelNotLive);
        };

        let dir = self.hls_root().join(sanitize_stage(&key));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::create_dir_all(&dir).await?;

        let playlist_path = dir.join("playlist.m3u8");
        let spec = self.transcode_spec(&key, &live.stream_url, &dir, &playlist_path);
        let handle = self.runner.spawn(spec).await?;
        info!(
            channel = %key,
            pid = handle.pid().unwrap_or_default(),
            url = %live.stream_url,
            "hls transcode started"
        );

        let session = Arc::new(HlsSession {
            channel: key.clone(),
            stream_url: live.stream_url,
            dir,
            playlist_path,
            playlist_url: format!("/live/{}/playlist.m3u8", encode_component(&key)),
            handle,
            last_used: Mutex::new(Instant::now()),
            idle_cancel: CancellationToken::new(),
        });
        self.sessions.insert(key.clone(), session.clone());
        self.spawn_exit_watcher(&session);
        self.spawn_idle_reaper(&session);

        if let Err(err) = self.wait_for_playlist(&session).await {
            warn!(channel = %key, %err, "playlist never materialized");
            teardown(&self.sessions, &session, "playlist timeout").await;
            return Err(Error::PlaylistNotReady);
        }

        Ok(session)
    }

    /// Stop one session. Returns false when nothing was running.
    pub async fn stop_session(&self, channel: &str) -> bool {
        let Some(session) = self.session(channel) else {
            return false;
        };
        teardown(&self.sessions, &session, "requested").await;
        true
    }

    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<HlsSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            teardown(&self.sessions, &session, "shutdown").await;
        }
    }

    fn transcode_spec(
        &self,
        key: &str,
        stream_url: &str,
        dir: &std::path::Path,
        playlist_path: &std::path::Path,
    ) -> SpawnSpec {
        let log_channel = key.to_string();
        SpawnSpec::new(
            format!("hls:{key}"),
            self.config.transcode_command.as_str(),
        )
        .args(["-hide_banner", "-loglevel", "warning"])
        .args(["-reconnect", "1", "-reconnect_streamed", "1"])
        .args(["-reconnect_at_eof", "1", "-reconnect_delay_max", "2"])
        .args(["-i", stream_url])
        .args(["-vn", "-c:a", "aac", "-b:a", "128k"])
        .args(["-f", "hls"])
        .args(["-hls_time", &self.config.segment_seconds.to_string()])
        .args(["-hls_list_size", &self.config.playlist_window.to_string()])
        .args([
            "-hls_flags",
            "append_list+omit_endlist+program_date_time+independent_segments+discont_start",
        ])
        .arg("-hls_segment_filename")
        .arg(dir.join("segment_%05d.ts").to_string_lossy())
        .arg(playlist_path.to_string_lossy())
        .on_stderr(move |line| {
            if line.to_lowercase().contains("error") {
                error!(channel = %log_channel, line, "transcoder error");
            } else {
                debug!(channel = %log_channel, line, "transcoder");
            }
        })
    }

    /// Poll until the playlist file exists and has content. Bails early
    /// when the transcoder dies before producing anything.
    async fn wait_for_playlist(&self, session: &HlsSession) -> Result<()> {
        let deadline = Instant::now() + self.config.playlist_timeout();
        loop {
            if let Ok(meta) = tokio::fs::metadata(&session.playlist_path).await {
                if meta.len() > 0 {
                    return Ok(());
                }
            }
            if session.handle.exit().is_some() || Instant::now() >= deadline {
                return Err(Error::PlaylistNotReady);
            }
            tokio::time::sleep(self.config.playlist_poll()).await;
        }
    }

    fn spawn_exit_watcher(&self, session: &Arc<HlsSession>) {
        let sessions = Arc::clone(&self.sessions);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            let exit = session.handle.wait().await;
            debug!(channel = %session.channel, %exit, "hls transcode exited");
            teardown(&sessions, &session, "transcoder exit").await;
        });
    }

    fn spawn_idle_reaper(&self, session: &Arc<HlsSession>) {
        let sessions = Arc::clone(&self.sessions);
        let session = Arc::clone(session);
        let idle = self.config.idle_timeout();
        tokio::spawn(async move {
            loop {
                let deadline = *session.last_used.lock() + idle;
                tokio::select! {
                    () = session.idle_cancel.cancelled() => return,
                    () = tokio::time::sleep_until(deadline.into()) => {
                        if session.last_used.lock().elapsed() >= idle {
                            info!(channel = %session.channel, "hls session idle");
                            teardown(&sessions, &session, "idle").await;
                            return;
                        }
                    }
                }
            }
        });
    }
}

fn session_key(channel: &str) -> String {
    channel.trim().to_lowercase()
}

/// Remove, kill and clean up one session. Guarded so that only the caller
/// holding the still-registered instance does the work; later calls for
/// the same session are no-ops.
async fn teardown(
    sessions: &DashMap<String, Arc<HlsSession>>,
    session: &Arc<HlsSession>,
    reason: &str,
) {
    let removed = sessions
        .remove_if(&session.channel, |_, current| Arc::ptr_eq(current, session))
        .is_some();
    if !removed {
        return;
    }
    session.idle_cancel.cancel();
    session.handle.kill(KillSignal::Kill);
    if let Err(err) = tokio::fs::remove_dir_all(&session.dir).await {
        if err.kind() != ErrorKind::NotFound {
            warn!(channel = %session.channel, %err, "failed to remove session dir");
        }
    }
    info!(channel = %session.channel, reason, "hls session stopped");
}
