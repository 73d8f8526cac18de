//! Caller side of the protocol: building signed envelopes and checking
//! signed responses.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::identity::{IdentityError, Keypair, SignedPayload};
use crate::pipeline::Envelope;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("response signature invalid: {0}")]
    Signature(#[from] IdentityError),

    #[error("response signed by {actual}, expected {expected}")]
    UnexpectedSigner { expected: String, actual: String },

    #[error("response data is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Builds the envelope for one call.
#[derive(Debug, Clone, Default)]
pub struct CallBuilder {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    timestamp: Option<i64>,
}

impl CallBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.to_string(), value.into());
        self
    }

    /// Override the timestamp (defaults to now).
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    fn resolved_timestamp(&self) -> i64 {
        self.timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp())
    }

    /// The payload a server reconstructs: `{args, kwargs, timestamp, address}`.
    pub fn payload(&self, address: &str) -> Value {
        let mut payload = Map::new();
        payload.insert("args".into(), Value::Array(self.args.clone()));
        payload.insert("kwargs".into(), Value::Object(self.kwargs.clone()));
        payload.insert("timestamp".into(), Value::from(self.resolved_timestamp()));
        payload.insert("address".into(), Value::String(address.to_string()));
        Value::Object(payload)
    }

    /// Envelope carrying the payload as signed JSON text in `data`.
    pub fn sign(self, keypair: &Keypair) -> Envelope {
        let address = keypair.address();
        let data = self.payload(&address).to_string();
        Envelope {
            signature: Some(keypair.sign(data.as_bytes())),
            data: Some(Value::String(data)),
            address,
            ..Default::default()
        }
    }

    /// Envelope with raw top-level fields, signed over their packaged form.
    pub fn sign_raw(self, keypair: &Keypair) -> Envelope {
        let mut envelope = Envelope {
            args: Some(Value::Array(self.args.clone())),
            kwargs: Some(Value::Object(self.kwargs.clone())),
            timestamp: Some(Value::from(self.resolved_timestamp())),
            address: keypair.address(),
            ..Default::default()
        };
        envelope.signature = Some(keypair.sign(envelope.signed_message().as_bytes()));
        envelope
    }

    /// Envelope without a signature, for public servers.
    pub fn unsigned(self, address: &str) -> Envelope {
        let timestamp = self.resolved_timestamp();
        Envelope {
            args: Some(Value::Array(self.args)),
            kwargs: Some(Value::Object(self.kwargs)),
            timestamp: Some(Value::from(timestamp)),
            address: address.to_string(),
            ..Default::default()
        }
    }
}

/// Check a signed response from the server at `server_key` and decode it.
pub fn open_response(payload: &SignedPayload, server_key: &str) -> Result<Value, ClientError> {
    if payload.address != server_key {
        return Err(ClientError::UnexpectedSigner {
            expected: server_key.to_string(),
            actual: payload.address.clone(),
        });
    }
    payload.verify()?;
    Ok(serde_json::from_str(&payload.data)?)
}
