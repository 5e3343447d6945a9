//! Tracing bootstrap for the daemon.
//!
//! Production logs twice: JSON lines into a daily-rolled file for ingestion,
//! and compact text on stdout for the systemd journal. Development logs to
//! stdout only, pretty-printed with span open/close events.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Sets the default level when `RUST_LOG` is absent.
const LOG_LEVEL_ENV: &str = "ROOMSENSE_LOG_LEVEL";

/// Non-blocking writers stop flushing once their guard drops; parked here for
/// the life of the process.
static WRITER_GUARDS: OnceLock<Vec<WorkerGuard>> = OnceLock::new();

/// Install the global subscriber for the selected profile.
///
/// Filtering follows `RUST_LOG` when set, then `ROOMSENSE_LOG_LEVEL`, then
/// `info`.
///
/// # Errors
///
/// Fails when the filter directives taken from the environment do not parse.
pub fn init(production: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(fallback_directives(std::env::var(LOG_LEVEL_ENV).ok()))
    })?;

    if production {
        let dir = log_directory();
        std::fs::create_dir_all(&dir).ok();
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, "roomsense");
        let (file, file_guard) = tracing_appender::non_blocking(appender);
        let (stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(file)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true),
            )
            .with(
                // The journal stamps and colors on its own.
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_writer(stdout)
                    .with_ansi(false),
            )
            .init();

        let _ = WRITER_GUARDS.set(vec![file_guard, stdout_guard]);
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE),
            )
            .init();
    }

    Ok(())
}

/// Directives used when `RUST_LOG` is unset: the configured level override,
/// or plain `info`.
fn fallback_directives(configured: Option<String>) -> String {
    configured.unwrap_or_else(|| "info".to_owned())
}

fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/roomsense")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "roomsense")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}
