//! Metrics emitted through the `metrics` facade
//!
//! Nothing is exported unless the application installs a recorder.

/// Metric label names and values
pub mod labels {
    /// Instance connection name
    pub const INSTANCE: &str = "instance";
    /// Outcome of an operation
    pub const STATUS: &str = "status";
    /// Error kind
    pub const ERROR_KIND: &str = "error_kind";

    /// Successful outcome
    pub const STATUS_OK: &str = "ok";
    /// Failed outcome
    pub const STATUS_ERROR: &str = "error";
}

/// Counters
pub mod counters {
    use super::labels;

    /// A refresh finished successfully
    pub fn refresh_succeeded(instance: &str) {
        ::metrics::counter!(
            "cloudsql_connector_refresh_total",
            labels::INSTANCE => instance.to_string(),
            labels::STATUS => labels::STATUS_OK
        )
        .increment(1);
    }

    /// A refresh failed
    pub fn refresh_failed(instance: &str, error_kind: &'static str) {
        ::metrics::counter!(
            "cloudsql_connector_refresh_total",
            labels::INSTANCE => instance.to_string(),
            labels::STATUS => labels::STATUS_ERROR,
            labels::ERROR_KIND => error_kind
        )
        .increment(1);
    }

    /// A dial finished, successfully or not
    pub fn dial_completed(instance: &str, status: &'static str) {
        ::metrics::counter!(
            "cloudsql_connector_dial_total",
            labels::INSTANCE => instance.to_string(),
            labels::STATUS => status
        )
        .increment(1);
    }
}

/// Histograms
pub mod histograms {
    use super::labels;
    use std::time::Duration;

    /// Time spent in one refresh
    pub fn refresh_duration(instance: &str, duration: Duration) {
        ::metrics::histogram!(
            "cloudsql_connector_refresh_duration_ms",
            labels::INSTANCE => instance.to_string()
        )
        .record(duration.as_secs_f64() * 1000.0);
    }

    /// Time from dial start to an established stream
    pub fn dial_latency(instance: &str, duration: Duration) {
        ::metrics::histogram!(
            "cloudsql_connector_dial_latency_ms",
            labels::INSTANCE => instance.to_string()
        )
        .record(duration.as_secs_f64() * 1000.0);
    }
}

/// Gauges
pub mod gauges {
    use super::labels;

    /// A stream to the instance was opened
    pub fn connection_opened(instance: &str) {
        ::metrics::gauge!(
            "cloudsql_connector_open_connections",
            labels::INSTANCE => instance.to_string()
        )
        .increment(1.0);
    }

    /// A stream to the instance was dropped
    pub fn connection_closed(instance: &str) {
        ::metrics::gauge!(
            "cloudsql_connector_open_connections",
            labels::INSTANCE => instance.to_string()
        )
        .decrement(1.0);
    }
}
