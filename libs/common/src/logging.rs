//! Logging bootstrap for capture binaries
//!
//! Console output always; an optional file sink (single file or one file
//! per day) written through a non-blocking appender.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809123Z [INFO] Capture started`
///
/// Microsecond timestamps are kept because inter-frame gaps on a 19200
/// baud link are under two milliseconds.
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Appender guards must live as long as the process or buffered lines are lost
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

/// File sink rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRotation {
    /// One file for the whole run: `{app}.log`
    Never,
    /// A new file every day: `{app}.log.YYYY-MM-DD`
    Daily,
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Application name, used for the file name and the default filter
    pub app_name: String,
    /// Console/file level when `RUST_LOG` is not set
    pub level: Level,
    /// Directory for the file sink; `None` disables file logging
    pub log_dir: Option<PathBuf>,
    /// File rotation policy
    pub rotation: FileRotation,
    /// Write the file sink as JSON lines
    pub enable_json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            app_name: "rtu_sniffer".to_string(),
            level: Level::INFO,
            log_dir: None,
            rotation: FileRotation::Never,
            enable_json: false,
        }
    }
}

/// Build the filter directive used when `RUST_LOG` is absent
///
/// The engine crate gets the configured level, everything else stays at
/// `warn` so dependency chatter does not drown frame logs.
pub fn default_directive(config: &LogConfig) -> String {
    let level = config.level.as_str().to_ascii_lowercase();
    format!("warn,rtu_sniffer={level},common={level},{}={level}", config.app_name)
}

fn build_filter(config: &LogConfig) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(env_str) if !env_str.is_empty() => EnvFilter::new(env_str),
        _ => EnvFilter::new(default_directive(config)),
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    let filter = build_filter(&config);

    let console_layer = fmt::layer()
        .with_ansi(true)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_name = format!("{}.log", config.app_name);
            let appender = match config.rotation {
                FileRotation::Never => tracing_appender::rolling::never(dir, file_name),
                FileRotation::Daily => tracing_appender::rolling::daily(dir, file_name),
            };
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
            match guards.lock() {
                Ok(mut guards) => guards.push(guard),
                Err(poisoned) => poisoned.into_inner().push(guard),
            }

            let layer = if config.enable_json {
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_level(true)
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed()
            } else {
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .event_format(BracketedLevelFormat)
                    .boxed()
            };
            Some(layer)
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::debug!(
        "Logging initialized: app={}, file={:?}",
        config.app_name,
        config.log_dir
    );
    Ok(())
}

/// Console-only init with a level string ("debug", "info", ...)
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = LogConfig {
        level: level.parse().unwrap_or(Level::INFO),
        ..Default::default()
    };
    init_with_config(config)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_format_level_brackets() {
        assert_eq!(format_level(&Level::INFO), "[INFO]");
        assert_eq!(format_level(&Level::WARN), "[WARN]");
        assert_eq!(format_level(&Level::TRACE), "[TRACE]");
    }

    #[test]
    fn test_default_directive_scopes_app_and_engine() {
        let config = LogConfig {
            app_name: "busmon".to_string(),
            level: Level::DEBUG,
            ..Default::default()
        };
        assert_eq!(
            default_directive(&config),
            "warn,rtu_sniffer=debug,common=debug,busmon=debug"
        );
    }

    #[test]
    fn test_default_config_is_console_only() {
        let config = LogConfig::default();
        assert!(config.log_dir.is_none());
        assert_eq!(config.rotation, FileRotation::Never);
        assert_eq!(config.level, Level::INFO);
    }

    #[test]
    fn test_init_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("capture-logs");
        let config = LogConfig {
            log_dir: Some(log_dir.clone()),
            rotation: FileRotation::Daily,
            ..Default::default()
        };

        // A global subscriber may already be installed by another test;
        // the directory is created before registration either way.
        let _ = init_with_config(config);
        assert!(log_dir.is_dir());
    }
}
