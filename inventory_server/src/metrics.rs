//! Prometheus metrics for inventory and scan observability.

use metrics::{counter, gauge, histogram};

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a fan-out task outcome (`succeeded`, `failed`, `rejected`).
pub fn task_finished(class: &str, outcome: &str) {
    counter!(
        "inventory_tasks_total",
        "class" => class.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record rows written by an upsert.
pub fn rows_upserted(entity: &str, count: usize) {
    counter!("inventory_rows_upserted_total", "entity" => entity.to_string())
        .increment(count as u64);
}

/// Record a failed upsert chunk.
pub fn chunk_failed(entity: &str) {
    counter!("inventory_chunk_failures_total", "entity" => entity.to_string()).increment(1);
}

/// Record an HTTP 429 from a provider.
pub fn rate_limited(kind: &str) {
    counter!("inventory_rate_limited_total", "vcs" => kind.to_string()).increment(1);
}

/// Record the duration of an inventory pass.
pub fn pass_duration(mode: &str, duration_ms: u64) {
    histogram!("inventory_pass_duration_ms", "mode" => mode.to_string())
        .record(duration_ms as f64);
}

/// Set the number of instances handled by the last job.
pub fn instances_processed(count: usize) {
    gauge!("inventory_instances_processed").set(count as f64);
}

/// Record a scan target reaching a terminal state.
pub fn scan_target_finished(outcome: &str, duration_ms: u64) {
    counter!("scan_targets_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("scan_target_duration_ms", "outcome" => outcome.to_string())
        .record(duration_ms as f64);
}

/// Record findings persisted for one target.
pub fn findings_stored(tool: &str, count: usize) {
    counter!("scan_findings_total", "tool" => tool.to_string()).increment(count as u64);
}
