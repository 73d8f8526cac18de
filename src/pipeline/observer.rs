//! Checkpoints of the pipeline, for logging and metrics.

use std::time::Duration;

use super::error::PipelineError;
use crate::access::AccessDecision;
use crate::history::HistoryError;
use crate::telemetry::{log_security_event, metrics, SecurityEvent};

/// Something that happened to one call.
#[derive(Debug)]
pub enum PipelineEvent<'a> {
    /// Rejected before invocation.
    Rejected {
        function: &'a str,
        error: &'a PipelineError,
    },
    /// Refused by access control.
    Denied {
        function: &'a str,
        caller: &'a str,
        decision: &'a AccessDecision,
    },
    /// Invocation finished and produced a value or a sequence.
    Invoked {
        function: &'a str,
        caller: &'a str,
        success: bool,
        latency: Duration,
    },
    /// A streamed sequence ended or was dropped.
    StreamEnded {
        function: &'a str,
        caller: &'a str,
        items: u64,
        chunks: u64,
        completed: bool,
    },
    HistoryFailed {
        function: &'a str,
        error: &'a HistoryError,
    },
}

/// Receives pipeline events. Called inline; keep it cheap.
pub trait PipelineObserver: Send + Sync {
    fn observe(&self, event: &PipelineEvent<'_>);
}

/// Default observer: `tracing` events, security audit lines, `metrics`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn observe(&self, event: &PipelineEvent<'_>) {
        match *event {
            PipelineEvent::Rejected { function, error } => {
                metrics::record_rejection(error.kind());
                let message = error.to_string();
                match error {
                    PipelineError::Integrity(_) => log_security_event(
                        SecurityEvent::SignatureInvalid,
                        "Call rejected: bad signature",
                        &[("fn", function), ("reason", message.as_str())],
                    ),
                    PipelineError::Stale { .. } | PipelineError::FromFuture { .. } => {
                        log_security_event(
                            SecurityEvent::StaleRequest,
                            "Call rejected: timestamp outside window",
                            &[("fn", function), ("reason", message.as_str())],
                        )
                    }
                    _ => tracing::warn!(function, kind = error.kind(), error = %message, "call rejected"),
                }
            }
            PipelineEvent::Denied {
                function,
                caller,
                decision,
            } => {
                metrics::record_denial(function);
                let reason = decision
                    .info
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("denied");
                log_security_event(
                    SecurityEvent::AccessDenied,
                    "Call denied by access control",
                    &[("fn", function), ("caller", caller), ("reason", reason)],
                );
            }
            PipelineEvent::Invoked {
                function,
                caller,
                success,
                latency,
            } => {
                metrics::record_call(function, success, latency);
                if success {
                    tracing::info!(function, caller, latency_ms = latency.as_millis() as u64, "call completed");
                } else {
                    tracing::warn!(function, caller, latency_ms = latency.as_millis() as u64, "call failed");
                }
            }
            PipelineEvent::StreamEnded {
                function,
                caller,
                items,
                chunks,
                completed,
            } => {
                metrics::record_stream_end(chunks, !completed);
                if completed {
                    tracing::debug!(function, caller, items, chunks, "stream finished");
                } else {
                    tracing::info!(function, caller, items, chunks, "stream dropped by caller");
                }
            }
            PipelineEvent::HistoryFailed { function, error } => {
                metrics::record_history_failure();
                tracing::warn!(function, error = %error, "failed to record call history");
            }
        }
    }
}
