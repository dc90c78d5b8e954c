mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{MetricType, MetricsQuery, MetricsRecorder, MetricsSnapshot, MetricsView};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInitialized(String),
}

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "huddle_presence" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Whether to persist warn+ logs to SQLite.
    pub log_to_sqlite: bool,
    pub log_db_path: PathBuf,
    pub metrics_enabled: bool,
    pub metrics_db_path: PathBuf,
    pub metrics_snapshot_interval_secs: u64,
    pub metrics_retention_days: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            log_to_sqlite: true,
            log_db_path: data_dir.join("logs.db"),
            metrics_enabled: true,
            metrics_db_path: data_dir.join("metrics.db"),
            metrics_snapshot_interval_secs: 60,
            metrics_retention_days: 7,
        }
    }
}

/// Handles to the sinks opened by [`init_telemetry`].
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics_recorder: Option<Arc<MetricsRecorder>>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Option<Arc<MetricsRecorder>> {
        self.metrics_recorder.clone()
    }

    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }
}

/// Build the `EnvFilter` directive string for a config, e.g.
/// `"info,huddle_presence=debug"`.
pub fn filter_directives(config: &TelemetryConfig) -> String {
    let mut directives = config.log_level.to_string().to_lowercase();
    for (module, level) in &config.module_levels {
        directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    directives
}

/// Install the global subscriber. Call once at startup.
///
/// A sink that cannot be opened is reported on stderr and skipped; only a
/// second global install is an error.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_target(true)
        .with_span_list(true)
        .with_filter(env_filter);

    let (sqlite_layer, log_sink) = if config.log_to_sqlite {
        match SqliteLogSink::new(&config.log_db_path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(Arc::clone(&sink))), Some(sink))
            }
            Err(e) => {
                eprintln!("huddle-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInitialized(e.to_string()))?;

    let metrics_recorder = if config.metrics_enabled {
        match MetricsRecorder::new(&config.metrics_db_path) {
            Ok(recorder) => Some(Arc::new(recorder)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to open metrics DB, metrics disabled");
                None
            }
        }
    } else {
        None
    };

    Ok(TelemetryGuard {
        log_sink,
        metrics_recorder,
    })
}

/// Snapshot metrics every `interval` and prune rows past retention, until
/// `cancel` fires. A final snapshot is taken on the way out.
pub fn start_snapshot_task(
    recorder: Arc<MetricsRecorder>,
    interval: Duration,
    retention_days: u32,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match recorder.snapshot() {
                        Ok(rows) => tracing::debug!(rows, "metrics snapshot written"),
                        Err(e) => tracing::warn!(error = %e, "metrics snapshot failed"),
                    }
                    if let Err(e) = recorder.prune(retention_days) {
                        tracing::warn!(error = %e, "metrics prune failed");
                    }
                }
                () = cancel.cancelled() => {
                    if let Err(e) = recorder.snapshot() {
                        tracing::warn!(error = %e, "final metrics snapshot failed");
                    }
                    break;
                }
            }
        }
    })
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".huddle")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_live_under_data_dir() {
        let config = TelemetryConfig::default();
        assert!(config.log_db_path.ends_with(".huddle/logs.db"));
        assert!(config.metrics_db_path.ends_with(".huddle/metrics.db"));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn filter_directives_include_module_levels() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("huddle_presence".into(), Level::DEBUG)],
            ..TelemetryConfig::default()
        };
        assert_eq!(filter_directives(&config), "warn,huddle_presence=debug");
    }

    #[tokio::test]
    async fn snapshot_task_flushes_on_cancel() {
        let recorder = Arc::new(MetricsRecorder::in_memory().unwrap());
        recorder.counter_inc("presence_joins_total", &[], 2);
        let cancel = CancellationToken::new();

        let handle = start_snapshot_task(
            Arc::clone(&recorder),
            Duration::from_secs(3600),
            7,
            cancel.clone(),
        );
        cancel.cancel();
        handle.await.unwrap();

        let rows = recorder.query(&MetricsQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "presence_joins_total");
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_task_writes_on_interval() {
        let recorder = Arc::new(MetricsRecorder::in_memory().unwrap());
        recorder.gauge_set("presence_rooms", &[], 1.0);
        let cancel = CancellationToken::new();

        let _handle = start_snapshot_task(
            Arc::clone(&recorder),
            Duration::from_secs(60),
            7,
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(!recorder.query(&MetricsQuery::default()).unwrap().is_empty());
        cancel.cancel();
    }
}
