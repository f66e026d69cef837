//! Shared metrics recording for storage operations.

use std::time::Instant;

/// Records a counter and a latency histogram for one storage operation.
///
/// Emits `storage_operations_total` and `storage_operation_duration_ms`,
/// both labelled with `backend`, `operation` and `status`.
pub fn record_operation_metrics(
    backend: &'static str,
    operation: &'static str,
    start: Instant,
    status: &'static str,
) {
    metrics::counter!(
        "storage_operations_total",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "storage_operation_duration_ms",
        "backend" => backend,
        "operation" => operation,
        "status" => status
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}

/// Maps a result to the `status` label.
pub const fn status_of<T, E>(result: &std::result::Result<T, E>) -> &'static str {
    if result.is_ok() { "success" } else { "error" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_operation_metrics_without_recorder() {
        let start = Instant::now();
        record_operation_metrics("sqlite", "create", start, "success");
        record_operation_metrics("sqlite", "scan_similar", start, "error");
    }

    #[test]
    fn test_status_of() {
        assert_eq!(status_of::<(), ()>(&Ok(())), "success");
        assert_eq!(status_of::<(), ()>(&Err(())), "error");
    }
}
