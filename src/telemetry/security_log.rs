//! Security audit logging for the call pipeline.
//!
//! SECURITY: Rejected signatures, stale envelopes, denied calls and unsafe
//! history paths are logged as structured lines for forensic analysis.

use std::time::{SystemTime, UNIX_EPOCH};

/// Security event types for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityEvent {
    /// Signature missing, malformed or not matching.
    SignatureInvalid,
    /// Envelope timestamp outside the freshness window.
    StaleRequest,
    /// Access collaborator refused the call.
    AccessDenied,
    /// Request body over the size limit.
    OversizedPayload,
    /// Caller address had to be rewritten to form a history path.
    PathSanitized,
    /// History purged.
    HistoryPurged,
}

impl SecurityEvent {
    pub fn severity(&self) -> SecuritySeverity {
        match self {
            Self::SignatureInvalid => SecuritySeverity::Warning,
            Self::StaleRequest => SecuritySeverity::Warning,
            Self::AccessDenied => SecuritySeverity::Warning,
            Self::OversizedPayload => SecuritySeverity::Warning,
            Self::PathSanitized => SecuritySeverity::Critical,
            Self::HistoryPurged => SecuritySeverity::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignatureInvalid => "signature_invalid",
            Self::StaleRequest => "stale_request",
            Self::AccessDenied => "access_denied",
            Self::OversizedPayload => "oversized_payload",
            Self::PathSanitized => "path_sanitized",
            Self::HistoryPurged => "history_purged",
        }
    }
}

/// Severity levels for security events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecuritySeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl SecuritySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Build the audit line for an event.
pub fn format_security_event(
    timestamp: u64,
    event: SecurityEvent,
    message: &str,
    details: &[(&str, &str)],
) -> String {
    let mut line = format!(
        "[{}] SECURITY {} {}: {}",
        timestamp,
        event.severity().as_str(),
        event.as_str(),
        message
    );
    if !details.is_empty() {
        let details = details
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        line.push_str(" | ");
        line.push_str(&details);
    }
    line
}

/// Log a security event with structured details.
///
/// # Example
/// ```
/// use commune_server::telemetry::{log_security_event, SecurityEvent};
///
/// log_security_event(
///     SecurityEvent::SignatureInvalid,
///     "Signature does not match payload",
///     &[("fn", "echo"), ("caller", "ab12")]
/// );
/// ```
pub fn log_security_event(event: SecurityEvent, message: &str, details: &[(&str, &str)]) {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let log_line = format_security_event(timestamp, event, message, details);

    match event.severity() {
        SecuritySeverity::Debug => tracing::debug!(event = event.as_str(), "{}", log_line),
        SecuritySeverity::Info => tracing::info!(event = event.as_str(), "{}", log_line),
        SecuritySeverity::Warning => tracing::warn!(event = event.as_str(), "{}", log_line),
        SecuritySeverity::Error | SecuritySeverity::Critical => {
            tracing::error!(event = event.as_str(), "{}", log_line)
        }
    }
}

/// Convenience macro for logging security events.
#[macro_export]
macro_rules! security_log {
    ($event:expr, $message:expr) => {
        $crate::telemetry::security_log::log_security_event($event, $message, &[])
    };
    ($event:expr, $message:expr, $($key:expr => $value:expr),+) => {
        $crate::telemetry::security_log::log_security_event(
            $event,
            $message,
            &[$(($key, $value)),+]
        )
    };
}
