mod logging;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for logging.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "racetime_store" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: data_dir().join("logs.db"),
        }
    }
}

impl TelemetryConfig {
    /// Filter directive string, e.g. `info,racetime_store=debug`.
    pub fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps the log sink alive for the life of the process.
pub struct TelemetryGuard {
    _log_sink: Option<Arc<SqliteLogSink>>,
}

/// Install the global subscriber. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let (sqlite_layer, sqlite_sink) = if config.log_to_sqlite {
        match SqliteLogSink::open(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                // No subscriber yet, so this cannot go through tracing.
                eprintln!("racetime-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .init();

    TelemetryGuard {
        _log_sink: sqlite_sink,
    }
}

/// Default data directory, `$HOME/.racetime`.
pub fn data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".racetime")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter() {
        let config = TelemetryConfig::default();
        assert_eq!(config.filter_directives(), "info");
        assert!(config.log_db_path.ends_with(".racetime/logs.db"));
    }

    #[test]
    fn module_overrides_in_filter() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("racetime_server".into(), Level::DEBUG)],
            ..Default::default()
        };
        assert_eq!(config.filter_directives(), "warn,racetime_server=debug");
    }
}
