//! End-to-end recorder flows against a mocked discovery API and an
//! in-memory process runner.
//!
//! Run with: cargo test --test recorder_flow

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use aircheck_core::config::{DiscoveryConfig, RecorderConfig};
use aircheck_core::discovery::DiscoveryClient;
use aircheck_core::process::{FakeRunner, KillSignal, ProcessRunner};
use aircheck_core::recorder::{Recorder, SkipReason};

const STREAM: &str = "http://cdn.example/stream.mp3";

fn live_payload(stage: &str, url: &str) -> serde_json::Value {
    json!({
        "is_live": true,
        "broadcasts": [{
            "is_live": true,
            "channel": stage,
            "title": "Morning Recitation",
            "progressive_stream_url": url,
        }],
    })
}

fn offline_payload(username: &str) -> serde_json::Value {
    json!({
        "is_live": false,
        "data": { "attributes": { "username": username } },
    })
}

struct TestBed {
    recorder: Arc<Recorder>,
    runner: Arc<FakeRunner>,
    server: MockServer,
    root: PathBuf,
    _dir: TempDir,
}

async fn testbed_with(channels: &[&str], tweak: impl FnOnce(&mut RecorderConfig)) -> TestBed {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("recordings");

    let discovery_config = DiscoveryConfig {
        api_base_url: format!("{}/channel_view/", server.uri()),
        ..DiscoveryConfig::default()
    };
    let mut config = RecorderConfig {
        channels: channels.iter().map(|c| (*c).to_string()).collect(),
        recordings_dir: root.clone(),
        stop_grace_seconds: 2,
        ..RecorderConfig::default()
    };
    tweak(&mut config);

    let discovery = Arc::new(DiscoveryClient::new(&discovery_config).unwrap());
    let runner = Arc::new(FakeRunner::new());
    let recorder = Arc::new(Recorder::new(
        config,
        discovery,
        Arc::clone(&runner) as Arc<dyn ProcessRunner>,
    ));

    TestBed {
        recorder,
        runner,
        server,
        root,
        _dir: dir,
    }
}

async fn testbed(channels: &[&str]) -> TestBed {
    testbed_with(channels, |_| {}).await
}

async fn mount_live(server: &MockServer, slug: &str, stage: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/channel_view/{slug}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(live_payload(stage, STREAM)))
        .mount(server)
        .await;
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_check_channels_starts_capture_for_live_channel() {
    let bed = testbed(&["qari"]).await;
    mount_live(&bed.server, "qari", "QariStudio").await;

    let results = bed.recorder.check_channels().await;
    assert_eq!(results.len(), 1);
    assert!(results[0].live);
    assert_eq!(results[0].stage.as_deref(), Some("QariStudio"));
    assert!(results[0].error.is_none());

    let capture = bed.runner.find("capture:QariStudio").unwrap();
    assert_eq!(capture.command(), "yt-dlp");
    let args = capture.args();
    assert_eq!(args[0], "--no-part");
    assert!(args.contains(&"--audio-format".to_string()));
    assert_eq!(args.last().unwrap(), STREAM);
    let out = args.iter().position(|a| a == "-o").unwrap();
    assert!(args[out + 1].contains("QariStudio"));

    assert_eq!(bed.recorder.running_count(), 1);
    assert!(bed.root.join("QariStudio").is_dir());
}

#[tokio::test]
async fn test_check_channels_does_not_double_start() {
    let bed = testbed(&["qari"]).await;
    mount_live(&bed.server, "qari", "QariStudio").await;

    bed.recorder.check_channels().await;
    let results = bed.recorder.check_channels().await;

    assert!(results[0].live);
    assert!(results[0].error.is_none());
    assert_eq!(bed.runner.spawn_count(), 1);
    assert_eq!(bed.recorder.running_count(), 1);
}

#[tokio::test]
async fn test_check_channels_stops_capture_when_offline() {
    let bed = testbed(&["qari"]).await;
    Mock::given(method("GET"))
        .and(path("/channel_view/qari"))
        .respond_with(ResponseTemplate::new(200).set_body_json(live_payload("QariStudio", STREAM)))
        .up_to_n_times(1)
        .mount(&bed.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/channel_view/qari"))
        .respond_with(ResponseTemplate::new(200).set_body_json(offline_payload("QariStudio")))
        .mount(&bed.server)
        .await;

    let first = bed.recorder.check_channels().await;
    assert!(first[0].live);
    assert_eq!(bed.recorder.running_count(), 1);

    let second = bed.recorder.check_channels().await;
    assert!(!second[0].live);
    assert_eq!(second[0].stage.as_deref(), Some("QariStudio"));

    let capture = bed.runner.find("capture:QariStudio").unwrap();
    assert!(capture.kills().contains(&KillSignal::Interrupt));
    let recorder = Arc::clone(&bed.recorder);
    wait_until("session release", move || recorder.running_count() == 0).await;
}

#[tokio::test]
async fn test_fetch_failure_marks_channel_without_stage() {
    let bed = testbed(&["broken"]).await;
    Mock::given(method("GET"))
        .and(path("/channel_view/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&bed.server)
        .await;

    let results = bed.recorder.check_channels().await;
    assert_eq!(results.len(), 1);
    assert!(!results[0].live);
    assert!(results[0].stage.is_none());
    assert_eq!(results[0].error.as_deref(), Some("fetch-failed"));
    assert_eq!(bed.runner.spawn_count(), 0);
}

#[tokio::test]
async fn test_start_channel_reports_not_live() {
    let bed = testbed(&[]).await;
    Mock::given(method("GET"))
        .and(path("/channel_view/qari"))
        .respond_with(ResponseTemplate::new(200).set_body_json(offline_payload("QariStudio")))
        .mount(&bed.server)
        .await;

    let outcome = bed.recorder.start_channel("qari").await.unwrap();
    assert!(!outcome.started);
    assert_eq!(outcome.reason, Some(SkipReason::NotLive));
    assert_eq!(outcome.stage.as_deref(), Some("QariStudio"));
    assert_eq!(outcome.channel.as_deref(), Some("qari"));
}

#[tokio::test]
async fn test_start_channel_twice_reports_already_running() {
    let bed = testbed(&[]).await;
    // Broadcast with no stage fields at all; the placeholder name keys the
    // session, so the second start must still land on it.
    let payload = json!({
        "is_live": true,
        "broadcasts": [{"live": true, "attributes": {"progressive_stream_url": STREAM}}],
    });
    Mock::given(method("GET"))
        .and(path("/channel_view/demo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(payload))
        .mount(&bed.server)
        .await;

    let first = bed.recorder.start_channel("demo").await.unwrap();
    assert!(first.started);
    assert_eq!(first.stage.as_deref(), Some("mixlr-channel"));

    let second = bed.recorder.start_channel("demo").await.unwrap();
    assert!(!second.started);
    assert_eq!(second.reason, Some(SkipReason::AlreadyRunning));
    assert_eq!(bed.runner.spawn_count(), 1);
}

#[tokio::test]
async fn test_spawn_failure_rolls_back_the_reservation() {
    let bed = testbed(&[]).await;
    mount_live(&bed.server, "qari", "QariStudio").await;

    bed.runner.fail_next_spawn();
    let err = bed.recorder.start_channel("qari").await.unwrap_err();
    assert!(err.to_string().contains("capture:QariStudio"));
    assert_eq!(bed.recorder.running_count(), 0);

    // The stage is free again, so the next attempt starts cleanly.
    let outcome = bed.recorder.start_channel("qari").await.unwrap();
    assert!(outcome.started);
    assert_eq!(bed.recorder.running_count(), 1);
}

#[tokio::test]
async fn test_concurrent_starts_reserve_the_stage_once() {
    let bed = testbed(&[]).await;

    let (a, b) = tokio::join!(
        bed.recorder.start_recording("LateNight", STREAM, None),
        bed.recorder.start_recording("LateNight", STREAM, None),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_ne!(a.started, b.started);
    let skipped = if a.started { &b } else { &a };
    assert_eq!(skipped.reason, Some(SkipReason::AlreadyRunning));
    assert_eq!(bed.runner.spawn_count(), 1);
    assert_eq!(bed.recorder.running_count(), 1);
}

#[tokio::test]
async fn test_stage_names_are_sanitized_for_the_filesystem() {
    let bed = testbed(&[]).await;

    let outcome = bed
        .recorder
        .start_recording("Drum/Bass Live", STREAM, None)
        .await
        .unwrap();

    assert!(outcome.started);
    assert_eq!(outcome.stage.as_deref(), Some("Drum-Bass Live"));
    let path = outcome.path.unwrap();
    assert!(path.starts_with(bed.root.join("Drum-Bass Live")));
}

#[tokio::test]
async fn test_stop_all_drains_every_session() {
    let bed = testbed(&[]).await;
    bed.recorder
        .start_recording("StageA", STREAM, None)
        .await
        .unwrap();
    bed.recorder
        .start_recording("StageB", STREAM, None)
        .await
        .unwrap();
    assert_eq!(bed.recorder.running_count(), 2);

    bed.recorder.stop_all(KillSignal::Interrupt).await;

    assert_eq!(bed.recorder.running_count(), 0);
    for process in bed.runner.processes() {
        assert!(process.kills().contains(&KillSignal::Interrupt));
        assert!(process.has_exited());
    }
}

#[tokio::test]
async fn test_stalled_recording_is_killed_and_growing_one_survives() {
    let bed = testbed_with(&[], |config| config.stalled_timeout_seconds = 0).await;

    let sleepy = bed
        .recorder
        .start_recording("Sleepy", STREAM, None)
        .await
        .unwrap();
    let growing = bed
        .recorder
        .start_recording("Growing", STREAM, None)
        .await
        .unwrap();
    let sleepy_path = sleepy.path.unwrap();
    let growing_path = growing.path.unwrap();
    tokio::fs::write(&sleepy_path, vec![0u8; 10]).await.unwrap();
    tokio::fs::write(&growing_path, vec![0u8; 10]).await.unwrap();

    // First pass sees growth on both and refreshes the clocks.
    bed.recorder.monitor_stalled().await;
    assert_eq!(bed.recorder.running_count(), 2);

    // Only one file keeps growing; with a zero timeout the next pass
    // kills the flat one and leaves the other alone.
    tokio::time::sleep(Duration::from_millis(20)).await;
    tokio::fs::write(&growing_path, vec![0u8; 64]).await.unwrap();
    bed.recorder.monitor_stalled().await;

    let stalled = bed.runner.find("capture:Sleepy").unwrap();
    assert!(stalled.kills().contains(&KillSignal::Kill));
    let alive = bed.runner.find("capture:Growing").unwrap();
    assert!(alive.kills().is_empty());

    assert_eq!(bed.recorder.running_count(), 1);
    let running = bed.recorder.get_running().await;
    assert_eq!(running[0].stage, "Growing");
}

#[tokio::test]
async fn test_get_running_tracks_the_backing_file() {
    let bed = testbed(&[]).await;
    let outcome = bed
        .recorder
        .start_recording("Morning", STREAM, Some("qari"))
        .await
        .unwrap();
    let path = outcome.path.clone().unwrap();
    tokio::fs::write(&path, vec![0u8; 2048]).await.unwrap();

    let running = bed.recorder.get_running().await;
    assert_eq!(running.len(), 1);
    let item = &running[0];
    assert_eq!(item.stage, "Morning");
    assert_eq!(item.channel, "qari");
    assert_eq!(item.size, 2048);
    assert_eq!(Some(item.file_name.clone()), outcome.file_name);
    assert_eq!(item.source_url.as_deref(), Some(STREAM));
}

#[tokio::test]
async fn test_status_payload_links_live_channels_to_running_captures() {
    let bed = testbed(&["qari"]).await;
    mount_live(&bed.server, "qari", "QariStudio").await;

    bed.recorder.check_channels().await;
    let running = bed.recorder.get_running().await;
    tokio::fs::write(&running[0].path, vec![0u8; 64])
        .await
        .unwrap();

    let payload = bed.recorder.build_status_payload().await;

    assert!(!payload.recorder.monitor.monitoring);
    assert_eq!(payload.recorder.monitor.channels, vec!["qari".to_string()]);
    assert_eq!(payload.recorder.running.len(), 1);
    let item = &payload.recorder.running[0];
    assert!(item
        .stream_url
        .as_deref()
        .unwrap()
        .starts_with("/api/stream?path=QariStudio/"));
    let proxy = item.stream_proxy.as_deref().unwrap();
    assert!(proxy.starts_with("/api/stream/recording?path=QariStudio/"));
    assert!(proxy.contains("&live=http%3A%2F%2Fcdn.example%2Fstream.mp3"));
    assert!(proxy.ends_with("&follow=1"));

    assert_eq!(payload.live.len(), 1);
    let live = &payload.live[0];
    assert_eq!(live.channel, "qari");
    assert_eq!(live.stage, "QariStudio");
    assert_eq!(live.title, "Morning Recitation");
    assert_eq!(live.source, "local-recording");
    assert!(live.stream_proxy.is_some());
}

#[tokio::test]
async fn test_live_listing_feeds_the_media_cache() {
    let bed = testbed(&["qari"]).await;
    let mut payload = live_payload("QariStudio", STREAM);
    payload["data"] = json!({
        "attributes": {
            "media": { "artwork": "https://img.example/cover.png" },
            "theme_color": "#aa2200",
        },
    });
    Mock::given(method("GET"))
        .and(path("/channel_view/qari"))
        .respond_with(ResponseTemplate::new(200).set_body_json(payload))
        .up_to_n_times(1)
        .mount(&bed.server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&bed.server)
        .await;

    let lives = bed.recorder.list_live_streams(None).await;
    assert_eq!(lives.len(), 1);
    assert_eq!(
        lives[0].media.artwork.as_deref(),
        Some("https://img.example/cover.png")
    );

    // Cached under both the channel slug and the stage name, so lookups
    // keep working while the API is failing.
    let by_channel = bed.recorder.channel_media("QARI").await.unwrap();
    assert_eq!(by_channel.channel_slug, "qari");
    assert_eq!(by_channel.media.theme_color.as_deref(), Some("#aa2200"));

    let by_stage = bed.recorder.channel_media("qaristudio").await.unwrap();
    assert_eq!(by_stage.media.artwork, by_channel.media.artwork);
}

#[tokio::test]
async fn test_list_recordings_flattens_and_decorates() {
    let bed = testbed(&[]).await;
    let channel_dir = bed.root.join("ChannelA");
    tokio::fs::create_dir_all(&channel_dir).await.unwrap();
    tokio::fs::write(
        channel_dir.join("show_2026-01-02T03-04-05.678Z.mp3"),
        vec![0u8; 1234],
    )
    .await
    .unwrap();
    tokio::fs::write(channel_dir.join("partial.mp3.part"), b"x")
        .await
        .unwrap();
    tokio::fs::write(channel_dir.join("notes.txt"), b"x")
        .await
        .unwrap();

    // One duration probe runs for the single listed file.
    bed.runner.queue_exit_code(0);

    let items = bed.recorder.list_recordings().await.unwrap();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item.channel, "ChannelA");
    assert_eq!(item.file, "show_2026-01-02T03-04-05.678Z.mp3");
    assert_eq!(item.path, "ChannelA/show_2026-01-02T03-04-05.678Z.mp3");
    assert_eq!(item.size, 1234);
    assert!(item.url.starts_with("/api/stream?path=ChannelA%2Fshow"));
    assert!(item.url.ends_with("&follow=1"));
    assert_eq!(
        item.download_url,
        "/recordings/ChannelA/show_2026-01-02T03-04-05.678Z.mp3"
    );

    let expected = chrono::Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
        + chrono::Duration::milliseconds(678);
    assert_eq!(item.date, expected);
    // The probe produced no output, so no duration is reported.
    assert!(item.duration_seconds.is_none());
}
