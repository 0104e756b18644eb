//! Prometheus metrics for loan-ledger-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};

/// Payment network callbacks by kind and outcome.
pub static CALLBACKS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "loan_ledger_callbacks_total",
        "Total number of payment network callbacks",
        &["kind", "outcome"] // outcome: applied, duplicate, ignored, failed
    )
    .expect("Failed to register callbacks_total")
});

/// Postings written by posting type.
pub static POSTINGS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "loan_ledger_postings_total",
        "Total number of ledger postings written",
        &["posting_type"]
    )
    .expect("Failed to register postings_total")
});

/// Amount posted, in cents, by posting type.
pub static POSTED_CENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "loan_ledger_posted_cents_total",
        "Total amount debited per posting type, in minor units",
        &["posting_type"]
    )
    .expect("Failed to register posted_cents_total")
});

/// Reconciliation failures that were acknowledged to the network anyway.
pub static RECONCILIATION_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "loan_ledger_reconciliation_failures_total",
        "Total number of reconciliation failures by kind and error class",
        &["kind", "class"]
    )
    .expect("Failed to register reconciliation_failures")
});

/// Outbound gateway requests.
pub static GATEWAY_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "loan_ledger_gateway_requests_total",
        "Total number of payment gateway requests",
        &["operation", "status"]
    )
    .expect("Failed to register gateway_requests_total")
});

/// Overdue sweep results.
pub static SWEEP_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "loan_ledger_sweep_total",
        "Schedule rows and loans changed by the overdue sweep",
        &["result"] // rows_overdue, loans_defaulted, errors
    )
    .expect("Failed to register sweep_total")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "loan_ledger_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&CALLBACKS_TOTAL);
    Lazy::force(&POSTINGS_TOTAL);
    Lazy::force(&POSTED_CENTS_TOTAL);
    Lazy::force(&RECONCILIATION_FAILURES);
    Lazy::force(&GATEWAY_REQUESTS_TOTAL);
    Lazy::force(&SWEEP_TOTAL);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}
