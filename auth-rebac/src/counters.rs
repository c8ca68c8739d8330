//! Metric names and recording helpers. Recording is a no-op until a recorder
//! is installed (see the `telemetry` crate).

pub const CHECKS_TOTAL: &str = "rebac_checks_total";
pub const INTERSECTION_LOOKUPS_TOTAL: &str = "rebac_intersection_cache_lookups_total";
pub const CLOSURE_WRITTEN_TOTAL: &str = "rebac_closure_records_written_total";
pub const CLOSURE_REMOVED_TOTAL: &str = "rebac_closure_records_removed_total";
pub const MUTATIONS_REJECTED_TOTAL: &str = "rebac_mutations_rejected_total";

pub(crate) fn check_completed(allowed: bool) {
    let outcome = if allowed { "allowed" } else { "denied" };
    metrics::counter!(CHECKS_TOTAL, "outcome" => outcome).increment(1);
}

pub(crate) fn check_failed() {
    metrics::counter!(CHECKS_TOTAL, "outcome" => "error").increment(1);
}

pub(crate) fn intersection_lookup(outcome: &'static str) {
    metrics::counter!(INTERSECTION_LOOKUPS_TOTAL, "outcome" => outcome).increment(1);
}

pub(crate) fn closure_written(count: u64) {
    metrics::counter!(CLOSURE_WRITTEN_TOTAL).increment(count);
}

pub(crate) fn closure_removed(count: u64) {
    metrics::counter!(CLOSURE_REMOVED_TOTAL).increment(count);
}

pub(crate) fn mutation_rejected(reason: &'static str) {
    metrics::counter!(MUTATIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
}
