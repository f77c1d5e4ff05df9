use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::queue::DispatchQueue;

#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub queue: Arc<dyn DispatchQueue>,
}

/// Prometheus metrics scrape endpoint.
/// Refreshes the queue-depth gauge, then renders the text exposition format.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    match state.queue.depth().await {
        Ok(depth) => metrics::gauge!("grading_queue_depth").set(depth.ready as f64),
        Err(e) => tracing::warn!(error = %e, "Failed to read queue depth for metrics"),
    }
    state.handle.render()
}

/// Register descriptions for every metric the pipeline emits.
pub fn describe_metrics() {
    metrics::describe_counter!("grading_jobs_created_total", "Grading jobs accepted");
    metrics::describe_counter!("grading_jobs_succeeded_total", "Grading jobs that stored a result");
    metrics::describe_counter!("grading_jobs_retried_total", "Failed attempts scheduled for retry");
    metrics::describe_counter!("grading_jobs_failed_total", "Grading jobs that ended FAILED");
    metrics::describe_counter!(
        "grading_jobs_recovered_total",
        "RUNNING jobs returned to the queue after going stale"
    );
    metrics::describe_histogram!(
        "grading_invocation_seconds",
        "Wall-clock time of one external grader run"
    );
    metrics::describe_gauge!("grading_queue_depth", "Job ids waiting on the ready list");
}
