use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Register descriptions for the application metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "analysis_jobs_started_total",
        "Analysis jobs accepted by the backend, by kind"
    );
    metrics::describe_counter!(
        "analysis_jobs_completed_total",
        "Analysis jobs observed completed, by kind"
    );
    metrics::describe_counter!(
        "analysis_jobs_failed_total",
        "Analysis jobs that failed to start or failed on the backend, by kind"
    );
    metrics::describe_counter!(
        "analysis_jobs_stale_total",
        "Analysis jobs failed after losing contact with the backend"
    );
    metrics::describe_counter!("credits_refunded_total", "Credits returned to users");
    metrics::describe_histogram!(
        "analysis_backend_request_seconds",
        "Latency of calls to the analysis backend, by operation"
    );
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(
    axum::extract::State(handle): axum::extract::State<Arc<PrometheusHandle>>,
) -> impl IntoResponse {
    handle.render()
}
