//! Provide tracing, tailored to this program.
//!
//! At startup, the program should call one of the init_* functions at startup
//! to install a tracing subscriber (i.e., something that emits events to a
//! log).
//!
//! The rest of program the can include `use tracing::prelude::*` for convenient
//! access to the `trace!()`, `debug!()`, `info!()`, `warn!()`, and `error!()`
//! macros.

use std::env;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use time::OffsetDateTime;
use tracing::Subscriber;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
    registry::LookupSpan,
    Layer,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Name of the log file written when file logging is on.
pub const LOG_FILE_NAME: &str = "bridge.log";

/// Initialize logging.
///
/// If running under systemd, use journald; otherwise fall back to stdout.
/// When `log_file` is given, events are also written there, without colour.
/// The file is truncated first.
pub fn init_journald_or_stdout(log_file: Option<&Path>) {
    let (file, file_error) = match log_file.map(open_log_file) {
        Some(Ok(file)) => (Some(file), None),
        Some(Err(e)) => (None, Some(e)),
        None => (None, None),
    };

    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(file_layer(file))
                .with(layer)
                .init();
        } else {
            use_stdout(file);
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout(file);
    }

    if let (Some(path), Some(e)) = (log_file, file_error) {
        error!(path = %path.display(), error = %e, "Failed to open log file, logging to console only.");
    }
}

// Filter according to environment variable RUST_LOG, overriding the default
// level (ERROR) to INFO.
fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy()
}

fn use_stdout(file: Option<File>) {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(file_layer(file))
        .with(tracing_subscriber::fmt::layer().with_timer(LocalTimer))
        .init();
}

// Plain-text copy of the log for operators without journald access.
fn file_layer<S>(file: Option<File>) -> Option<impl Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    file.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_timer(LocalTimer)
            .with_writer(Mutex::new(file))
    })
}

fn open_log_file(path: &Path) -> io::Result<File> {
    File::create(path)
}

// Provide our own timer that formats timestamps in local time and to the
// nearest second. The default timer was in UTC and formatted timestamps as an
// long, ugly string.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or(OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
