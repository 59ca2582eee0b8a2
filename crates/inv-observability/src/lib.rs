//! # inv-observability
//!
//! Logging and metrics setup for inventory import runs.
//!
//! The import engine itself only emits `tracing` events and `metrics`
//! samples; this crate installs the subscriber and describes the metrics so
//! an exporter can present them with units and help text.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, init_logging_with_config, LogFormat, LoggingConfig};
pub use metrics::{register_import_metrics, IMPORT_METRICS};
