//! Prometheus counters/histograms, installed once at startup and scraped
//! from the admin surface's `/metrics` endpoint.
//!
//! Names follow the `marketprism_storage_*` convention the original
//! Python service used for its `prometheus_client` counters, translated to
//! the `metrics` crate's macro style.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

pub fn record_message_received(data_type: &str) {
    metrics::counter!("marketprism_storage_messages_received_total", "data_type" => data_type.to_string())
        .increment(1);
}

pub fn record_message_stored(data_type: &str, count: u64) {
    metrics::counter!("marketprism_storage_messages_stored_total", "data_type" => data_type.to_string())
        .increment(count);
}

pub fn record_error(data_type: &str, kind: &str) {
    metrics::counter!(
        "marketprism_storage_errors_total",
        "data_type" => data_type.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_retry(data_type: &str) {
    metrics::counter!("marketprism_storage_retries_total", "data_type" => data_type.to_string())
        .increment(1);
}

pub fn record_flush_latency(data_type: &str, millis: f64) {
    metrics::histogram!("marketprism_storage_flush_latency_ms", "data_type" => data_type.to_string())
        .record(millis);
}

pub fn set_queue_depth(data_type: &str, depth: f64) {
    metrics::gauge!("marketprism_storage_queue_depth", "data_type" => data_type.to_string())
        .set(depth);
}

pub fn set_pool_in_use(tier: &str, count: f64) {
    metrics::gauge!("marketprism_storage_pool_in_use", "tier" => tier.to_string()).set(count);
}

pub fn record_migration_records(table: &str, count: u64) {
    metrics::counter!("marketprism_storage_migration_records_total", "table" => table.to_string())
        .increment(count);
}

pub fn record_cleanup_partitions_dropped(table: &str, count: u64) {
    metrics::counter!("marketprism_storage_cleanup_partitions_dropped_total", "table" => table.to_string())
        .increment(count);
}
