//! Log output for import runs.
//!
//! Every run executes inside an `inventory_import` span carrying `run_id`,
//! `inventory_id` and `source_id`, so each event of a run can be traced back
//! to it. With run span events enabled, closing the span adds one line per
//! run with its busy and idle time.

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::{Layered, SubscriberExt},
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer, Registry,
};

/// Shape of each log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-field human readable lines.
    #[default]
    Text,
    /// One short line per event.
    Compact,
    /// One JSON object per event, with the enclosing run span's fields.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for the import crates.
    pub level: Level,
    pub format: LogFormat,
    /// Log when an import run span closes.
    pub run_span_events: bool,
    pub source_location: bool,
    /// Further `target=level` directives, e.g. `sqlx=info`.
    pub extra_directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Text,
            run_span_events: true,
            source_location: false,
            extra_directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    /// Per-row reconciler events (`Host added`, `Relationship removed`, ...).
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            format: LogFormat::Text,
            run_span_events: true,
            source_location: true,
            extra_directives: Vec::new(),
        }
    }

    /// JSON lines for log aggregation.
    pub fn production() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            run_span_events: false,
            source_location: false,
            extra_directives: Vec::new(),
        }
    }

    /// Filter used when `RUST_LOG` is not set. SQL statement logging stays
    /// at `warn` unless raised explicitly.
    pub fn default_directives(&self) -> String {
        let mut directives = vec![
            format!("inv_core={}", self.level),
            format!("inv_observability={}", self.level),
            "sqlx=warn".to_string(),
        ];
        directives.extend(self.extra_directives.iter().cloned());
        directives.join(",")
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.default_directives()))
    }
}

type FmtLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

fn fmt_layer(config: &LoggingConfig) -> FmtLayer {
    let span_events = if config.run_span_events {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.source_location)
        .with_line_number(config.source_location);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    }
}

/// Installs the default configuration as the global subscriber.
pub fn init_logging() -> Result<(), TryInitError> {
    init_logging_with_config(LoggingConfig::default())
}

/// Installs `config` as the global subscriber. `RUST_LOG` takes precedence
/// over the configured directives. Fails if a subscriber is already set.
pub fn init_logging_with_config(config: LoggingConfig) -> Result<(), TryInitError> {
    let layer = fmt_layer(&config);
    tracing_subscriber::registry()
        .with(config.filter())
        .with(layer)
        .try_init()
}
