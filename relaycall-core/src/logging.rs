use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Targets that follow the configured level
const OWN_TARGETS: &[&str] = &[
    "relaycall",
    "relaycall_core",
    "relaycall_signaling",
    "relaycall_relay",
    "relaycall_media",
];

/// Chatty dependencies; held at `warn` unless `RUST_LOG` says otherwise
const DEPENDENCY_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_mdns",
    "tungstenite",
    "tokio_tungstenite",
    "reqwest",
    "hyper_util",
    "rustls",
];

/// Initialize structured logging
///
/// `RUST_LOG` takes precedence over [`default_directives`]. Without a
/// `file_path` output goes to stderr, since stdout carries the call console.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(level)))?;

    let (writer, ansi) = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let layer = fmt::layer().with_writer(writer).with_target(true);
    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format == "json" {
        registry
            .with(
                layer
                    .json()
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()?;
    } else {
        registry
            .with(layer.compact().with_ansi(ansi).with_line_number(false))
            .try_init()?;
    }

    Ok(())
}

/// `warn` for everything, `level` for the relaycall crates
fn default_directives(level: Level) -> String {
    let level = level.to_string().to_ascii_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(OWN_TARGETS.iter().map(|t| format!("{t}={level}")));
    directives.extend(DEPENDENCY_TARGETS.iter().map(|t| format!("{t}=warn")));
    directives.join(",")
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
