//! Call metrics through the `metrics` facade.
//!
//! No exporter is installed here; the embedding process chooses one. Without
//! a recorder every call below is a no-op.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

pub const CALLS_TOTAL: &str = "commune_calls_total";
pub const CALL_FAILURES_TOTAL: &str = "commune_call_failures_total";
pub const REJECTIONS_TOTAL: &str = "commune_rejections_total";
pub const DENIALS_TOTAL: &str = "commune_access_denials_total";
pub const CALL_LATENCY: &str = "commune_call_latency_seconds";
pub const STREAM_CHUNKS_TOTAL: &str = "commune_stream_chunks_total";
pub const STREAMS_CANCELLED_TOTAL: &str = "commune_streams_cancelled_total";
pub const HISTORY_FAILURES_TOTAL: &str = "commune_history_failures_total";

/// Register descriptions for every metric. Call once at startup.
pub fn init_metrics() {
    describe_counter!(CALLS_TOTAL, Unit::Count, "Calls that reached invocation");
    describe_counter!(
        CALL_FAILURES_TOTAL,
        Unit::Count,
        "Calls whose result was an error"
    );
    describe_counter!(
        REJECTIONS_TOTAL,
        Unit::Count,
        "Calls rejected before invocation"
    );
    describe_counter!(DENIALS_TOTAL, Unit::Count, "Calls denied by access control");
    describe_histogram!(CALL_LATENCY, Unit::Seconds, "Invocation latency");
    describe_counter!(STREAM_CHUNKS_TOTAL, Unit::Count, "Streamed chunks sent");
    describe_counter!(
        STREAMS_CANCELLED_TOTAL,
        Unit::Count,
        "Streams dropped before exhaustion"
    );
    describe_counter!(
        HISTORY_FAILURES_TOTAL,
        Unit::Count,
        "History records that could not be written"
    );
}

pub fn record_call(function: &str, success: bool, latency: Duration) {
    let function = function.to_string();
    counter!(CALLS_TOTAL, "fn" => function.clone()).increment(1);
    if !success {
        counter!(CALL_FAILURES_TOTAL, "fn" => function.clone()).increment(1);
    }
    histogram!(CALL_LATENCY, "fn" => function).record(latency.as_secs_f64());
}

pub fn record_rejection(kind: &'static str) {
    counter!(REJECTIONS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_denial(function: &str) {
    counter!(DENIALS_TOTAL, "fn" => function.to_string()).increment(1);
}

pub fn record_stream_end(chunks: u64, cancelled: bool) {
    counter!(STREAM_CHUNKS_TOTAL).increment(chunks);
    if cancelled {
        counter!(STREAMS_CANCELLED_TOTAL).increment(1);
    }
}

pub fn record_history_failure() {
    counter!(HISTORY_FAILURES_TOTAL).increment(1);
}
