//! Integration tests for child-process supervision against real OS
//! processes.
//!
//! Run with: cargo test --test process_supervision

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use aircheck_core::process::{CommandRunner, KillSignal, ProcessRunner, SpawnSpec};
use aircheck_core::Error;

fn sh(script: &str) -> SpawnSpec {
    SpawnSpec::new("test-shell", "sh").args(["-c", script])
}

#[tokio::test]
async fn test_exit_code_is_reported() {
    let runner = CommandRunner::new();

    let handle = runner.spawn(sh("exit 0")).await.unwrap();
    let exit = handle.wait().await;
    assert_eq!(exit.code, Some(0));
    assert!(exit.success());
    assert!(exit.duration > Duration::ZERO);

    let handle = runner.spawn(sh("exit 3")).await.unwrap();
    let exit = handle.wait().await;
    assert_eq!(exit.code, Some(3));
    assert!(!exit.success());
}

#[tokio::test]
async fn test_every_handle_clone_sees_the_exit() {
    let runner = CommandRunner::new();
    let handle = runner.spawn(sh("exit 0")).await.unwrap();
    let clone = handle.clone();

    assert!(handle.wait().await.success());
    assert!(!clone.is_running());
    assert_eq!(clone.exit().unwrap().code, Some(0));
}

#[tokio::test]
async fn test_timeout_kills_the_child() {
    let runner = CommandRunner::new();
    let spec = SpawnSpec::new("sleeper", "sleep")
        .arg("30")
        .timeout(Duration::from_millis(200));
    let handle = runner.spawn(spec).await.unwrap();

    let exit = handle.wait().await;
    assert!(exit.timed_out);
    assert!(!exit.success());
    assert_eq!(exit.code, None);
    assert!(exit.duration >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_spec_env_reaches_the_child() {
    let runner = CommandRunner::new();
    let spec = sh("[ \"$AIRCHECK_PROBE\" = \"on\" ]").env("AIRCHECK_PROBE", "on");

    let handle = runner.spawn(spec).await.unwrap();
    assert!(handle.wait().await.success());
}

#[tokio::test]
async fn test_interrupt_terminates_the_child() {
    let runner = CommandRunner::new();
    let handle = runner
        .spawn(SpawnSpec::new("sleeper", "sleep").arg("30"))
        .await
        .unwrap();

    handle.kill(KillSignal::Interrupt);
    let exit = handle.wait().await;
    assert_eq!(exit.signal, Some(2));
    assert!(!exit.timed_out);
}

#[tokio::test]
async fn test_spawn_failure_surfaces_immediately() {
    let runner = CommandRunner::new();
    let err = runner
        .spawn(SpawnSpec::new("ghost", "/definitely/not/here/aircheck-test-tool"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Spawn { .. }));
    assert!(err.to_string().contains("ghost"));
}

#[tokio::test]
async fn test_run_retries_until_the_command_succeeds() {
    let runner = CommandRunner::new();
    let dir = TempDir::new().unwrap();
    // Appends a line per run; succeeds once the third attempt lands.
    let spec = SpawnSpec::new("flaky", "sh")
        .args(["-c", "echo run >> marker; [ \"$(wc -l < marker)\" -ge 3 ]"])
        .current_dir(dir.path());

    let outcome = runner
        .run(spec, 3, Duration::from_millis(10))
        .await
        .unwrap();

    assert_eq!(outcome.attempt, 3);
    assert!(outcome.exit.success());

    let marker = std::fs::read_to_string(dir.path().join("marker")).unwrap();
    assert_eq!(marker.lines().count(), 3);
}

#[tokio::test]
async fn test_run_reports_the_last_exit_when_exhausted() {
    let runner = CommandRunner::new();
    let err = runner
        .run(sh("exit 7"), 2, Duration::from_millis(5))
        .await
        .unwrap_err();

    match err {
        Error::CommandFailed {
            attempts, exit, ..
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(exit.code, Some(7));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_stderr_lines_reach_the_callback() {
    let runner = CommandRunner::new();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);

    let spec = sh("echo visible >&2; echo dropped")
        .on_stderr(move |line| sink.lock().push(line.to_string()));
    let handle = runner.spawn(spec).await.unwrap();
    assert!(handle.wait().await.success());

    // The pipe pump runs beside the supervisor, so the last lines may
    // land just after the exit report.
    for _ in 0..50 {
        if !lines.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(lines.lock().as_slice(), ["visible".to_string()]);
}
