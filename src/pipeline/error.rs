//! Early-exit failures of the request pipeline.

use axum::http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

use crate::identity::IdentityError;
use crate::serializer::SerializerError;

/// A call rejected before (or instead of) producing a result.
///
/// Invocation failures are not here: they become error *results*, which
/// are signed and recorded like any other result.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("signature invalid: {0}")]
    Integrity(String),

    #[error("invalid payload: {0}")]
    Decode(String),

    #[error("request is too old: {age}s old (max staleness {max}s)")]
    Stale { age: i64, max: u64 },

    #[error("request timestamp is {ahead}s in the future (max skew {max}s)")]
    FromFuture { ahead: i64, max: u64 },

    #[error("malformed call: {0}")]
    Shape(String),

    #[error("failed to encode result: {0}")]
    Encode(#[from] SerializerError),

    #[error("server is shutting down")]
    Unavailable,
}

impl From<IdentityError> for PipelineError {
    fn from(e: IdentityError) -> Self {
        Self::Integrity(e.to_string())
    }
}

impl PipelineError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Integrity(_) => "integrity",
            Self::Decode(_) => "decode",
            Self::Stale { .. } | Self::FromFuture { .. } => "staleness",
            Self::Shape(_) => "shape",
            Self::Encode(_) => "encode",
            Self::Unavailable => "unavailable",
        }
    }

    /// HTTP status used by the transport adapter.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Integrity(_) | Self::Stale { .. } | Self::FromFuture { .. } => {
                StatusCode::UNAUTHORIZED
            }
            Self::Decode(_) | Self::Shape(_) => StatusCode::BAD_REQUEST,
            Self::Encode(SerializerError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Caller-visible body.
    pub fn to_body(&self) -> Value {
        json!({ "error": self.to_string() })
    }
}
