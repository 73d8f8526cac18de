//! Telemetry: structured logging, security audit lines, spans and metrics.

mod logging;
pub mod metrics;
pub mod security_log;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::init_metrics;
pub use security_log::{log_security_event, SecurityEvent, SecuritySeverity};
pub use spans::{RequestSpan, SpanExt};
