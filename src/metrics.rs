use tracing::trace;

// Trace-level counters; a subscriber filtering on `extractor.metrics` can aggregate them.

pub fn inc_api_calls(operation: &'static str, status: u16) {
    trace!(
        target = "extractor.metrics",
        operation = operation,
        status = status,
        "api_calls_total_inc"
    );
}

pub fn inc_throttled(operation: &'static str, attempt: u32) {
    trace!(
        target = "extractor.metrics",
        operation = operation,
        attempt = attempt,
        "throttled_total_inc"
    );
}

pub fn stage_elapsed(stage: &str, elapsed_ms: u128) {
    trace!(
        target = "extractor.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn rows_written(table: &str, rows: usize) {
    trace!(
        target = "extractor.metrics",
        table = table,
        rows = rows as u64,
        "rows_written"
    );
}
