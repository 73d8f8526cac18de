//! Span utilities for call tracing.

use tracing::{info_span, Span};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record why a call was rejected.
    fn record_error(&self, error: &dyn std::fmt::Display);

    /// Record a final status label and latency.
    fn record_outcome(&self, status: &str, latency_ms: u64);
}

impl SpanExt for Span {
    fn record_error(&self, error: &dyn std::fmt::Display) {
        self.record("error.message", error.to_string().as_str());
    }

    fn record_outcome(&self, status: &str, latency_ms: u64) {
        self.record("status", status);
        self.record("latency_ms", latency_ms);
    }
}

/// Factory for per-call spans.
pub struct RequestSpan;

impl RequestSpan {
    /// Create a span for one call.
    ///
    /// `caller` is filled in once the envelope is authenticated; `status`,
    /// `error.message` and `latency_ms` when the call completes.
    pub fn new(call_id: &str, function: &str) -> Span {
        info_span!(
            "call",
            call_id = %call_id,
            function = %function,
            caller = tracing::field::Empty,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}
