use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Output is human-readable by
/// default and JSON when `format = "json"`; either can be redirected to a
/// file instead of stdout.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&config.level)))
        .with_context(|| format!("invalid log level {:?}", config.level))?;

    let writer = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("could not open log file {path}"))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let base = fmt::layer()
        .with_writer(writer)
        .with_span_events(FmtSpan::CLOSE);
    let layer = if config.format == "json" {
        base.json()
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        base.pretty().with_target(true).with_file(false).boxed()
    };

    tracing_subscriber::registry().with(filter).with(layer).init();
    Ok(())
}

/// Accept the common aliases before handing the level to the env filter.
fn level_directive(level: &str) -> String {
    let normalized = level.trim().to_lowercase();
    match normalized.as_str() {
        "warning" => "warn".to_string(),
        "" => "info".to_string(),
        _ => normalized,
    }
}
