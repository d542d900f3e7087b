mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use aircheck_core::config::Config;
use aircheck_core::discovery::DiscoveryClient;
use aircheck_core::follow::FollowStreamer;
use aircheck_core::hls::HlsManager;
use aircheck_core::logging;
use aircheck_core::process::{CommandRunner, ProcessRunner};
use aircheck_core::recorder::Recorder;

#[derive(Debug, Parser)]
#[command(name = "aircheck", version, about = "Records live audio channels and serves the archive over HTTP")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "AIRCHECK_CONFIG")]
    config: Option<String>,
}

/// Make sure a directory exists and is writable, falling back when it
/// is not. Containers often mount the configured path read-only, so a
/// tmpfs fallback keeps the service usable.
async fn ensure_writable_dir(preferred: &Path, fallback: &str) -> PathBuf {
    match probe_dir(preferred).await {
        Ok(()) => preferred.to_path_buf(),
        Err(err) => {
            warn!(
                dir = %preferred.display(),
                %err,
                fallback,
                "directory not writable, using fallback"
            );
            let fallback = PathBuf::from(fallback);
            if let Err(err) = probe_dir(&fallback).await {
                error!(dir = %fallback.display(), %err, "fallback directory not writable either");
            }
            fallback
        }
    }
}

async fn probe_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let probe = dir.join(".write-probe");
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let mut config = Config::load(cli.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("aircheck starting");
    info!("HTTP address: {}", config.http_address());

    // 3. Verify working directories before anything writes into them
    let recordings_dir =
        ensure_writable_dir(&config.recorder.recordings_dir, "/tmp/aircheck-recordings").await;
    config.recorder.recordings_dir = recordings_dir;
    let hls_dir = ensure_writable_dir(&config.hls.root_dir, "/tmp/aircheck-hls").await;
    config.hls.root_dir = hls_dir;

    // 4. Wire up services
    let runner: Arc<dyn ProcessRunner> = Arc::new(CommandRunner::new());
    let discovery = Arc::new(DiscoveryClient::new(&config.discovery)?);
    let recorder = Arc::new(Recorder::new(
        config.recorder.clone(),
        Arc::clone(&discovery),
        Arc::clone(&runner),
    ));
    let hls = Arc::new(HlsManager::new(
        config.hls.clone(),
        Arc::clone(&recorder),
        Arc::clone(&runner),
    ));
    let follow = FollowStreamer::new(&config.follow);

    // 5. Start monitoring configured channels
    if config.recorder.autostart && !config.recorder.channels.is_empty() {
        let status = recorder.start_monitoring(None);
        info!(channels = ?status.channels, "channel monitoring started");
    } else {
        info!("channel monitoring idle, start it via POST /api/recorder/monitor/start");
    }

    // 6. Serve HTTP
    let state = server::AppState {
        recorder: Arc::clone(&recorder),
        hls: Arc::clone(&hls),
        follow,
    };
    let router = server::create_router(state);

    let addr: std::net::SocketAddr = config.http_address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 7. Stop captures and transcoders before exiting
    info!("shutting down");
    recorder.stop_monitoring(true).await;
    hls.stop_all().await;
    info!("shutdown complete");

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
