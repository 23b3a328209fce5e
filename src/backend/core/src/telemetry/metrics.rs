//! Prometheus exporter and metric descriptions.

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;

const DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Install the Prometheus recorder with an HTTP listener on `endpoint`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(endpoint: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = endpoint.parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), DURATION_BUCKETS)?
        .install()?;

    register_metric_descriptions();
    tracing::info!(endpoint = %addr, "Prometheus exporter listening");
    Ok(())
}

/// Register all metric descriptions.
pub fn register_metric_descriptions() {
    // Bridge
    describe_counter!("rollup_bridge_messages_total", "Broker messages handled, by outcome");
    describe_counter!("rollup_bridge_errors_total", "Broker or queue errors seen by the bridge");

    // Queue
    describe_counter!("rollup_jobs_enqueued_total", "Jobs enqueued");
    describe_counter!("rollup_jobs_completed_total", "Jobs completed");
    describe_counter!("rollup_jobs_retried_total", "Job deliveries that scheduled a retry");
    describe_counter!("rollup_jobs_dead_total", "Jobs moved to the dead-letter list");
    describe_histogram!("rollup_job_duration_seconds", "Handler execution time");
    describe_gauge!("rollup_worker_active_jobs", "Jobs currently executing");

    // Updater
    describe_counter!("rollup_aggregate_updates_total", "Aggregates written, by event kind");
    describe_counter!("rollup_cas_conflicts_total", "Compare-and-set conflicts");
    describe_counter!("rollup_cache_fallbacks_total", "Cold-cache recomputations");
    describe_counter!("rollup_precondition_violations_total", "Events left unapplied");
    describe_counter!("rollup_updater_ignored_total", "Jobs with an unknown name");

    // Stores
    describe_counter!("rollup_cache_lookups_total", "Cache lookups, by result");
    describe_counter!("rollup_cache_corrupt_entries_total", "Unparseable cache entries");
    describe_counter!("rollup_authoritative_queries_total", "Authoritative recomputations");
    describe_histogram!("rollup_authoritative_query_seconds", "Authoritative query latency");

    describe_counter!("rollup_errors_total", "Errors constructed, by code");
}
