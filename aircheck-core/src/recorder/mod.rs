//! Channel monitoring and capture supervision.
//!
//! One [`Recorder`] owns every recording session. Sessions are keyed by
//! stage name: the same stage never has two capture processes, no matter
//! how many channels or callers race to start one.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::RecorderConfig;
use crate::discovery::DiscoveryClient;
use crate::process::{ProcessHandle, ProcessRunner};

pub mod files;
mod service;
mod status;

pub use service::{ChannelCheck, SkipReason, StartOutcome, StopOutcome};
pub use status::{
    CachedMedia, LiveStatusItem, LiveStreamInfo, MonitorIntervals, MonitorStatus, RecorderStatus,
    RecordingItem, RunningRecording, RunningStatusItem, StatusPayload,
};

/// One supervised capture process.
pub(crate) struct RecordingSession {
    pub(crate) stage: String,
    pub(crate) channel: String,
    /// Output path handed to the capture tool. The tool may actually be
    /// writing a sibling with a different suffix; see [`files::candidate_paths`].
    pub(crate) planned_path: PathBuf,
    pub(crate) file_name: String,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) source_url: String,
    pub(crate) handle: ProcessHandle,
    pub(crate) growth: Mutex<GrowthState>,
}

/// File-growth bookkeeping for stall detection.
pub(crate) struct GrowthState {
    pub(crate) last_size: u64,
    pub(crate) last_check: Instant,
    pub(crate) current_path: Option<PathBuf>,
}

/// Map slot per stage. `Starting` reserves the stage while the capture
/// process spawns, so a concurrent starter backs off instead of
/// double-spawning.
pub(crate) enum SessionSlot {
    Starting,
    Active(Arc<RecordingSession>),
}

pub struct Recorder {
    config: RecorderConfig,
    discovery: Arc<DiscoveryClient>,
    runner: Arc<dyn ProcessRunner>,
    sessions: Arc<DashMap<String, SessionSlot>>,
    media_cache: DashMap<String, Option<CachedMedia>>,
    media_primed: AtomicBool,
    monitoring: AtomicBool,
    monitor_tasks: Mutex<Vec<JoinHandle<()>>>,
    channels: RwLock<Vec<String>>,
}

impl Recorder {
    pub fn new(
        config: RecorderConfig,
        discovery: Arc<DiscoveryClient>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            channels: RwLock::new(config.channels.clone()),
            config,
            discovery,
            runner,
            sessions: Arc::new(DashMap::new()),
            media_cache: DashMap::new(),
            media_primed: AtomicBool::new(false),
            monitoring: AtomicBool::new(false),
            monitor_tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    #[must_use]
    pub fn discovery(&self) -> &Arc<DiscoveryClient> {
        &self.discovery
    }

    /// Channels currently being monitored.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.channels.read().clone()
    }

    /// Replace the monitored channel set. Empty input is ignored, matching
    /// the behavior of partial monitor-start requests.
    pub fn set_channels(&self, channels: Vec<String>) -> Vec<String> {
        if !channels.is_empty() {
            *self.channels.write() = channels;
        }
        self.channels()
    }

    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(std::sync::atomic::Ordering::SeqCst)
    }

    #[must_use]
    pub fn running_count(&self) -> usize {
        self.sessions.len()
    }

    /// Absolute recordings root.
    #[must_use]
    pub fn recordings_root(&self) -> PathBuf {
        std::path::absolute(&self.config.recordings_dir)
            .unwrap_or_else(|_| self.config.recordings_dir.clone())
    }

    pub(crate) fn active_sessions(&self) -> Vec<Arc<RecordingSession>> {
        self.sessions
            .iter()
            .filter_map(|entry| match entry.value() {
                SessionSlot::Active(session) => Some(Arc::clone(session)),
                SessionSlot::Starting => None,
            })
            .collect()
    }

    pub(crate) fn active_session(&self, stage: &str) -> Option<Arc<RecordingSession>> {
        self.sessions.get(stage).and_then(|slot| match slot.value() {
            SessionSlot::Active(session) => Some(Arc::clone(session)),
            SessionSlot::Starting => None,
        })
    }
}
