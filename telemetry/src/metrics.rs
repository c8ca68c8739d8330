use crate::error::{Result, TelemetryError};
use auth_rebac::counters::{
    CHECKS_TOTAL, CLOSURE_REMOVED_TOTAL, CLOSURE_WRITTEN_TOTAL, INTERSECTION_LOOKUPS_TOTAL,
    MUTATIONS_REJECTED_TOTAL,
};
use metrics::{describe_counter, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Register help text for every engine metric with the current recorder
pub fn describe_metrics() {
    describe_counter!(
        CHECKS_TOTAL,
        Unit::Count,
        "Checks answered, labelled by outcome (allowed, denied, error)"
    );
    describe_counter!(
        INTERSECTION_LOOKUPS_TOTAL,
        Unit::Count,
        "Intersection cache lookups, labelled by outcome (allowed, denied, unknown)"
    );
    describe_counter!(
        CLOSURE_WRITTEN_TOTAL,
        Unit::Count,
        "Closure records materialized by relation inserts"
    );
    describe_counter!(
        CLOSURE_REMOVED_TOTAL,
        Unit::Count,
        "Closure records removed by relation deletes"
    );
    describe_counter!(
        MUTATIONS_REJECTED_TOTAL,
        Unit::Count,
        "Rejected relation mutations, labelled by reason"
    );
}

/// Install the global Prometheus recorder and describe the engine metrics.
/// Render the returned handle from a scrape endpoint.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::Metrics(format!("Failed to install Prometheus recorder: {}", e)))?;
    describe_metrics();
    tracing::info!("Prometheus recorder installed");
    Ok(handle)
}
