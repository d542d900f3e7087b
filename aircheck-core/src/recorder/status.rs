//! Read-side views: running sessions, live channels, the recordings
//! archive and the combined status payload, plus the channel media cache
//! that decorates them.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use super::files::{build_safe_rel, encode_component, is_recording_file, parse_timestamp_from_name};
use super::Recorder;
use crate::discovery::{extract_media, resolve_stage_name, ChannelMedia};
use crate::error::Result;
use crate::process::SpawnSpec;

/// Monitoring state summary.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub monitoring: bool,
    pub channels: Vec<String>,
    pub intervals: MonitorIntervals,
    pub running_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorIntervals {
    pub check_interval_seconds: u64,
    pub stalled_check_interval_seconds: u64,
    pub stalled_timeout_seconds: u64,
}

/// One running capture, sized against whatever file the tool is writing
/// right now.
#[derive(Debug, Clone, Serialize)]
pub struct RunningRecording {
    pub stage: String,
    pub channel: String,
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

/// A channel currently on air.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStreamInfo {
    pub channel: String,
    pub stage: String,
    pub stream_url: String,
    pub title: String,
    #[serde(flatten)]
    pub media: ChannelMedia,
}

/// Cached media plus the identity it was resolved under, so lookups by
/// stage name can find media fetched for a channel slug.
#[derive(Debug, Clone, Serialize)]
pub struct CachedMedia {
    #[serde(flatten)]
    pub media: ChannelMedia,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    pub channel_slug: String,
}

/// One archived recording.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingItem {
    pub channel: String,
    pub file: String,
    pub path: String,
    pub url: String,
    pub download_url: String,
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Start time from the file name when parseable, mtime otherwise.
    pub date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artwork: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme_color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

/// Running session enriched with serving URLs.
#[derive(Debug, Clone, Serialize)]
pub struct RunningStatusItem {
    #[serde(flatten)]
    pub recording: RunningRecording,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_proxy: Option<String>,
}

/// Live channel item in the status payload.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStatusItem {
    pub channel: String,
    pub stage: String,
    pub stream_url: String,
    pub title: String,
    #[serde(flatten)]
    pub media: ChannelMedia,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_proxy: Option<String>,
    /// `local-recording` when a running capture can be followed locally,
    /// `live-stream` when only the upstream source is available.
    pub source: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    #[serde(flatten)]
    pub monitor: MonitorStatus,
    pub running: Vec<RunningStatusItem>,
}

/// Everything a status consumer needs in one payload.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    pub recorder: RecorderStatus,
    pub live: Vec<LiveStatusItem>,
}

impl Recorder {
    #[must_use]
    pub fn monitor_status(&self) -> MonitorStatus {
        MonitorStatus {
            monitoring: self.is_monitoring(),
            channels: self.channels(),
            intervals: MonitorIntervals {
                check_interval_seconds: self.config.check_interval_seconds,
                stalled_check_interval_seconds: self.config.stalled_check_interval_seconds,
                stalled_timeout_seconds: self.config.stalled_timeout_seconds,
            },
            running_count: self.running_count(),
        }
    }

    /// Snapshot of running sessions with current file sizes.
    ///
    /// Only `current_path` is refreshed here; the stall clock is fed
    /// exclusively by the stall pass so that frequent status polling
    /// cannot mask a stalled capture.
    pub async fn get_running(&self) -> Vec<RunningRecording> {
        let sessions = self.active_sessions();
        let mut running = Vec::with_capacity(sessions.len());

        for session in sessions {
            let mut size = 0;
            let mut resolved_path = {
                let growth = session.growth.lock();
                growth
                    .current_path
                    .clone()
                    .unwrap_or_else(|| session.planned_path.clone())
            };
            if let Some((path, file_size)) = self.resolve_recording_file(&session).await {
                size = file_size;
                resolved_path.clone_from(&path);
                session.growth.lock().current_path = Some(path);
            }

            let file_name = resolved_path
                .file_name()
                .and_then(OsStr::to_str)
                .map(str::to_owned)
                .unwrap_or_else(|| session.file_name.clone());

            running.push(RunningRecording {
                stage: session.stage.clone(),
                channel: session.channel.clone(),
                file_name,
                path: resolved_path,
                size,
                started_at: session.started_at,
                source_url: Some(session.source_url.clone()),
            });
        }

        running
    }

    /// Check which of the given channels (all monitored ones by default)
    /// are on air right now. Freshly seen media is folded into the cache.
    pub async fn list_live_streams(&self, channels: Option<Vec<String>>) -> Vec<LiveStreamInfo> {
        let channels = channels.unwrap_or_else(|| self.channels());
        let mut lives = Vec::new();

        for channel in channels {
            let Some(data) = self.fetch_stream_info(&channel).await else {
                continue;
            };
            let media = extract_media(&data);
            let Some(live) = crate::discovery::find_live_broadcast(&data) else {
                continue;
            };

            self.cache_media(
                &channel.to_lowercase(),
                Some(&live.stage.to_lowercase()),
                CachedMedia {
                    media: media.clone(),
                    stage_name: Some(live.stage.clone()),
                    channel_slug: channel.clone(),
                },
            );

            lives.push(LiveStreamInfo {
                channel,
                stage: live.stage,
                stream_url: live.stream_url,
                title: live.title,
                media,
            });
        }

        lives
    }

    /// Store media under the channel key, and under the stage key too when
    /// nothing better is cached there.
    fn cache_media(&self, channel_key: &str, stage_key: Option<&str>, cached: CachedMedia) {
        self.media_cache
            .insert(channel_key.to_string(), Some(cached.clone()));
        if let Some(stage_key) = stage_key.filter(|key| !key.is_empty()) {
            let vacant_or_null = !self
                .media_cache
                .get(stage_key)
                .is_some_and(|entry| entry.value().is_some());
            if vacant_or_null {
                self.media_cache.insert(stage_key.to_string(), Some(cached));
            }
        }
    }

    async fn fetch_and_cache_media(&self, channel: &str) -> Result<CachedMedia> {
        let data = self.discovery.channel_view(channel).await?;
        let media = extract_media(&data);
        let stage_name = resolve_stage_name(&data, None);
        let cached = CachedMedia {
            media,
            stage_name: stage_name.clone(),
            channel_slug: channel.to_string(),
        };
        self.cache_media(
            &channel.to_lowercase(),
            stage_name.map(|stage| stage.to_lowercase()).as_deref(),
            cached.clone(),
        );
        Ok(cached)
    }

    /// Fetch media for every monitored channel once, so stage-name lookups
    /// have something to hit. Failed channels are marked to avoid refetch
    /// storms within the same prime.
    async fn prime_media_cache(&self) {
        if self.media_primed.swap(true, Ordering::SeqCst) {
            return;
        }
        for slug in self.channels() {
            let key = slug.to_lowercase();
            let have = self
                .media_cache
                .get(&key)
                .is_some_and(|entry| entry.value().is_some());
            if have {
                continue;
            }
            if let Err(err) = self.fetch_and_cache_media(&slug).await {
                warn!(channel = %slug, %err, "media prime failed");
                self.media_cache.entry(key).or_insert(None);
            }
        }
    }

    /// Media for a channel or stage name, taking any cache hit first and
    /// falling back to priming, a direct fetch, warming the remaining
    /// monitored channels, and finally a scan by cached stage name.
    pub async fn channel_media(&self, channel: &str) -> Option<CachedMedia> {
        if channel.is_empty() {
            return None;
        }
        let key = channel.to_lowercase();

        if let Some(entry) = self.media_cache.get(&key) {
            if let Some(media) = entry.value() {
                return Some(media.clone());
            }
        }

        self.prime_media_cache().await;

        match self.fetch_and_cache_media(channel).await {
            Ok(media) => return Some(media),
            Err(err) => {
                warn!(channel = %channel, %err, "media lookup failed");
                self.media_cache.insert(key.clone(), None);
            }
        }

        // One of the monitored channels may broadcast under this name.
        for slug in self.channels() {
            let slug_key = slug.to_lowercase();
            if self.media_cache.contains_key(&slug_key) {
                continue;
            }
            if let Err(err) = self.fetch_and_cache_media(&slug).await {
                warn!(channel = %slug, %err, "media warmup failed");
                self.media_cache.insert(slug_key, None);
            }
        }

        if let Some(entry) = self.media_cache.get(&key) {
            if let Some(media) = entry.value() {
                return Some(media.clone());
            }
        }

        let stage_match = self.media_cache.iter().find_map(|entry| {
            entry.value().as_ref().and_then(|media| {
                media
                    .stage_name
                    .as_deref()
                    .filter(|stage| stage.to_lowercase() == key)
                    .map(|_| media.clone())
            })
        });
        if let Some(media) = stage_match {
            self.media_cache.insert(key, Some(media.clone()));
            return Some(media);
        }

        None
    }

    async fn probe_duration(&self, path: &Path) -> Option<f64> {
        let file_name = path
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or("recording");
        let output = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&output);

        let spec = SpawnSpec::new(
            format!("probe:{file_name}"),
            self.config.probe_command.as_str(),
        )
        .args(["-v", "quiet", "-of", "csv=p=0", "-show_entries", "format=duration"])
        .arg(path.to_string_lossy())
        .timeout(Duration::from_secs(30))
        .on_stdout(move |line| {
            let mut buffer = sink.lock();
            buffer.push_str(line);
            buffer.push('\n');
        });

        let handle = self.runner.spawn(spec).await.ok()?;
        handle.wait().await;

        let seconds = output.lock().trim().parse::<f64>().ok()?;
        seconds.is_finite().then_some(seconds)
    }

    /// Flat listing of every archived recording, newest first. Each file
    /// is probed for duration and decorated with channel media.
    pub async fn list_recordings(&self) -> Result<Vec<RecordingItem>> {
        let root = self.recordings_root();
        let mut items = Vec::new();

        let mut dirs = match tokio::fs::read_dir(&root).await {
            Ok(dirs) => dirs,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(items),
            Err(err) => return Err(err.into()),
        };

        let mut media_lookup: HashMap<String, Option<CachedMedia>> = HashMap::new();

        while let Some(entry) = dirs.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let channel = entry.file_name().to_string_lossy().to_string();
            let channel_media = match media_lookup.get(&channel) {
                Some(cached) => cached.clone(),
                None => {
                    let media = self.channel_media(&channel).await;
                    media_lookup.insert(channel.clone(), media.clone());
                    media
                }
            };

            let channel_dir = root.join(&channel);
            let mut files = match tokio::fs::read_dir(&channel_dir).await {
                Ok(files) => files,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };

            while let Some(file) = files.next_entry().await? {
                let file_name = file.file_name().to_string_lossy().to_string();
                if !file.file_type().await?.is_file() || !is_recording_file(&file_name) {
                    continue;
                }
                let abs = channel_dir.join(&file_name);
                let Ok(meta) = tokio::fs::metadata(&abs).await else {
                    continue;
                };

                let mtime: DateTime<Utc> = meta
                    .modified()
                    .map(DateTime::from)
                    .unwrap_or_else(|_| Utc::now());
                let date = parse_timestamp_from_name(&file_name).unwrap_or(mtime);
                let duration_seconds = self.probe_duration(&abs).await;

                // The whole relative path is one query value, so the
                // separator is encoded too.
                let encoded_rel = encode_component(&format!("{channel}/{file_name}"));
                let artwork = channel_media
                    .as_ref()
                    .and_then(|cached| cached.media.artwork.clone());
                let logo = channel_media
                    .as_ref()
                    .and_then(|cached| cached.media.logo.clone());
                let cover = artwork.clone().or_else(|| logo.clone());

                items.push(RecordingItem {
                    path: format!("{channel}/{file_name}"),
                    url: format!("/api/stream?path={encoded_rel}&follow=1"),
                    download_url: format!(
                        "/recordings/{channel}/{}",
                        encode_component(&file_name)
                    ),
                    channel: channel.clone(),
                    file: file_name,
                    size: meta.len(),
                    mtime,
                    date,
                    duration_seconds,
                    artwork,
                    cover,
                    logo,
                    theme_color: channel_media
                        .as_ref()
                        .and_then(|cached| cached.media.theme_color.clone()),
                    stage: channel_media
                        .as_ref()
                        .and_then(|cached| cached.stage_name.clone()),
                });
            }
        }

        items.sort_by(|a, b| b.mtime.cmp(&a.mtime));
        Ok(items)
    }

    /// The combined payload behind the status endpoint: monitor state,
    /// running sessions with serving URLs, and live channels annotated
    /// with whether a local follow stream exists for them.
    pub async fn build_status_payload(&self) -> StatusPayload {
        let root = self.recordings_root();

        let running: Vec<RunningStatusItem> = self
            .get_running()
            .await
            .into_iter()
            .map(|item| {
                let abs = if item.path.is_absolute() {
                    item.path.clone()
                } else {
                    root.join(&item.path)
                };
                let safe_rel = build_safe_rel(&root, &abs);
                let (stream_url, download_url, stream_proxy) = match &safe_rel {
                    Some(rel) => {
                        let live_param = item
                            .source_url
                            .as_deref()
                            .map(|url| format!("&live={}", encode_component(url)))
                            .unwrap_or_default();
                        (
                            Some(format!("/api/stream?path={rel}&follow=1")),
                            Some(format!("/recordings/{rel}")),
                            Some(format!(
                                "/api/stream/recording?path={rel}{live_param}&follow=1"
                            )),
                        )
                    }
                    None => (None, None, None),
                };
                RunningStatusItem {
                    recording: RunningRecording { path: abs, ..item },
                    stream_url,
                    download_url,
                    stream_proxy,
                }
            })
            .collect();

        let mut running_lookup: HashMap<String, usize> = HashMap::new();
        for (idx, item) in running.iter().enumerate() {
            for key in [
                item.recording.stage.as_str(),
                item.recording.channel.as_str(),
            ] {
                let key = key.to_lowercase();
                if !key.is_empty() {
                    running_lookup.entry(key).or_insert(idx);
                }
            }
        }

        let live: Vec<LiveStatusItem> = self
            .list_live_streams(None)
            .await
            .into_iter()
            .map(|item| {
                let key = if item.stage.is_empty() {
                    item.channel.to_lowercase()
                } else {
                    item.stage.to_lowercase()
                };
                let matched = running_lookup.get(&key).map(|&idx| &running[idx]);
                let stream_proxy = matched.and_then(|m| m.stream_proxy.clone());
                let source = if stream_proxy.is_some() {
                    "local-recording"
                } else {
                    "live-stream"
                };
                let title = if item.title.is_empty() {
                    matched
                        .map(|m| m.recording.file_name.clone())
                        .or_else(|| (!item.stage.is_empty()).then(|| item.stage.clone()))
                        .or_else(|| (!item.channel.is_empty()).then(|| item.channel.clone()))
                        .unwrap_or_else(|| "Live stream".to_string())
                } else {
                    item.title.clone()
                };

                LiveStatusItem {
                    channel: item.channel,
                    stage: item.stage,
                    stream_url: item.stream_url,
                    title,
                    media: item.media,
                    stream_proxy,
                    source,
                }
            })
            .collect();

        StatusPayload {
            recorder: RecorderStatus {
                monitor: self.monitor_status(),
                running,
            },
            live,
        }
    }
}
