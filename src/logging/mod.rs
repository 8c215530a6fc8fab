// Logging module - tracing initialization
//
// Filter precedence: RUST_LOG env var > config file level > "info".
// Output goes to stdout; when a log directory is configured, a daily
// rotated file is written as well and the guard must be held for the
// process lifetime so buffered lines are flushed on shutdown.

use crate::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber; the returned guard (if any) must live
/// until process exit
pub fn init(config: &LoggingConfig) -> Option<WorkerGuard> {
    let default_filter = format!("tunneldeck={},tower_http=info,axum=info", config.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    match &config.file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tunneldeck.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}
