//! Tracing subscriber setup.
//!
//! Console output is always on (plain or JSON); a daily-rotated log file is
//! added when a log directory is configured.

use std::path::PathBuf;

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::config::{Lookup, bool_var, string_var};
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "notiq=info,tower_http=info";

/// Log file name prefix inside the log directory.
const LOG_FILE_PREFIX: &str = "notiq.log";

/// Timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    /// `EnvFilter` directive.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Also write to `<dir>/notiq.log.YYYY-MM-DD`.
    pub log_dir: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            json: false,
            log_dir: None,
        }
    }
}

impl LogSettings {
    /// Supported keys: `RUST_LOG`, `LOG_FORMAT` (`json` or `text`), `LOG_JSON`, `LOG_DIR`.
    pub fn from_lookup(lookup: &impl Lookup) -> Self {
        let mut settings = Self::default();

        if let Some(filter) = string_var(lookup, "RUST_LOG") {
            settings.filter = filter;
        }
        if let Some(format) = string_var(lookup, "LOG_FORMAT") {
            settings.json = format.eq_ignore_ascii_case("json");
        }
        if let Some(json) = bool_var(lookup, "LOG_JSON") {
            settings.json = json;
        }
        settings.log_dir = string_var(lookup, "LOG_DIR").map(PathBuf::from);

        settings
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|e| {
            eprintln!("Invalid log filter {:?} ({}), using default", self.filter, e);
            EnvFilter::new(DEFAULT_LOG_FILTER)
        })
    }
}

/// Install the global subscriber.
///
/// Returns the file writer guard when file output is enabled; keep it alive for
/// the lifetime of the process so buffered lines are flushed.
pub fn init_logging(settings: &LogSettings) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match &settings.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let json_layer = settings
        .json
        .then(|| fmt::layer().json().with_timer(LocalTimer));
    let text_layer = (!settings.json).then(|| fmt::layer().with_ansi(true).with_timer(LocalTimer));

    tracing_subscriber::registry()
        .with(settings.env_filter())
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(guard)
}
