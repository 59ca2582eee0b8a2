//! Descriptions of the metrics emitted by import runs.

use metrics::{describe_counter, describe_histogram, Unit};

/// Names of every metric an import run emits.
pub const IMPORT_METRICS: &[&str] = &[
    "inventory_import_runs_total",
    "inventory_import_run_duration_seconds",
    "inventory_import_rows_total",
    "inventory_import_edges_total",
];

/// Describes the import metrics to the installed recorder.
///
/// Call once after installing a recorder; samples emitted before that are
/// still recorded, just without help text.
pub fn register_import_metrics() {
    describe_counter!(
        "inventory_import_runs_total",
        Unit::Count,
        "Import runs by outcome"
    );
    describe_histogram!(
        "inventory_import_run_duration_seconds",
        Unit::Seconds,
        "Wall time of an import run, lock wait included"
    );
    describe_counter!(
        "inventory_import_rows_total",
        Unit::Count,
        "Host and group rows created, updated or deleted by kind and action"
    );
    describe_counter!(
        "inventory_import_edges_total",
        Unit::Count,
        "Relationships added or removed"
    );
}
