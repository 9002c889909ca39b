use tracing::trace;

// Counters are emitted as trace events on the `ingest.metrics` target so the
// log pipeline can aggregate them without a metrics registry in the hot path.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "ingest.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn folder_outcome(status: &'static str, elapsed_ms: u128) {
    trace!(
        target = "ingest.metrics",
        status = status,
        elapsed_ms = elapsed_ms as u64,
        "folder_processed"
    );
}

pub fn image_uploaded(success: bool) {
    trace!(
        target = "ingest.metrics",
        success = success,
        "image_upload_total_inc"
    );
}

pub fn job_step(step: &str, status: &'static str) {
    trace!(
        target = "ingest.metrics",
        step = step,
        status = status,
        "job_step_transition"
    );
}
