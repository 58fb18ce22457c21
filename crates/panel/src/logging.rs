use std::io;
use std::path::Path;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "panel.log";

// The websocket and HTTP stacks log every frame and connection at debug.
const DEFAULT_FILTER: &str = "info,tungstenite=warn,tokio_tungstenite=warn,hyper=warn";

/// `RUST_LOG` when it parses, otherwise the panel default.
fn panel_filter(raw: Option<&str>) -> EnvFilter {
    raw.and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// JSON lines into `<log_dir>/panel.log` (rotated daily), optionally mirrored
/// to stderr in the human format. Keep the returned guard alive until exit or
/// buffered lines are lost.
pub(crate) fn init_tracing(
    log_dir: &Path,
    log_to_stderr: bool,
) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_target(false)
        .json()
        .flatten_event(true);

    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let registry = tracing_subscriber::registry()
        .with(panel_filter(rust_log.as_deref()))
        .with(file_layer);

    if log_to_stderr {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false);
        registry.with(stderr_layer).init();
    } else {
        registry.init();
    }

    tracing::info!(
        event = "logging.ready",
        log_dir = %log_dir.display(),
        stderr = log_to_stderr
    );
    Ok(file_guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_quiets_transport_crates() {
        let filter = panel_filter(None).to_string();
        assert!(filter.contains("tungstenite=warn"));
        assert!(filter.contains("hyper=warn"));
    }

    #[test]
    fn rust_log_overrides_default_unless_invalid() {
        assert!(!panel_filter(Some("debug")).to_string().contains("hyper=warn"));
        assert!(panel_filter(Some("hyper=loud")).to_string().contains("hyper=warn"));
    }
}
