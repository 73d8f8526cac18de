//! Inbound call envelope and its decoded form.
//!
//! An [`Envelope`] is unverified. [`Envelope::authenticate`] consumes it and
//! yields a [`VerifiedEnvelope`], the only type that can release the payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::PipelineError;
use crate::identity;
use crate::module::CallArgs;
use crate::serializer;

/// Raw request body, as sent by the caller.
///
/// The payload is either pre-packaged in `data` (text or object) or spread
/// over the top-level `args`, `kwargs` and `timestamp` fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    /// Caller address (hex ed25519 public key).
    #[serde(default)]
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Envelope {
    /// Parse a request body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PipelineError> {
        serde_json::from_slice(bytes).map_err(|e| PipelineError::Decode(e.to_string()))
    }

    /// Payload in its canonical shape: `data` if present, otherwise the
    /// top-level fields packaged as `{args, kwargs, timestamp, address}`.
    pub fn packaged(&self) -> Value {
        if let Some(data) = &self.data {
            return data.clone();
        }
        let mut payload = Map::new();
        if let Some(args) = &self.args {
            payload.insert("args".into(), args.clone());
        }
        payload.insert(
            "kwargs".into(),
            self.kwargs.clone().unwrap_or_else(|| Value::Object(Map::new())),
        );
        if let Some(timestamp) = &self.timestamp {
            payload.insert("timestamp".into(), timestamp.clone());
        }
        payload.insert("address".into(), Value::String(self.address.clone()));
        Value::Object(payload)
    }

    /// Bytes covered by the caller's signature.
    pub fn signed_message(&self) -> String {
        serializer::canonical(&self.packaged())
    }

    /// Check the signature and the inner/outer address binding.
    ///
    /// In public mode the envelope is admitted without any check.
    pub fn authenticate(self, public: bool) -> Result<VerifiedEnvelope, PipelineError> {
        if public {
            return Ok(VerifiedEnvelope {
                inner: self,
                signed: false,
            });
        }
        if self.address.is_empty() {
            return Err(PipelineError::Integrity("missing caller address".into()));
        }
        let signature = self
            .signature
            .as_deref()
            .ok_or_else(|| PipelineError::Integrity("missing signature".into()))?;

        identity::verify_signature(&self.address, self.signed_message().as_bytes(), signature)?;

        if let Some(inner) = self.inner_address() {
            if inner != self.address {
                return Err(PipelineError::Integrity(
                    "caller address does not match signed payload".into(),
                ));
            }
        }
        Ok(VerifiedEnvelope {
            inner: self,
            signed: true,
        })
    }

    fn inner_address(&self) -> Option<String> {
        let payload = match self.packaged() {
            Value::String(text) => serde_json::from_str::<Value>(&text).ok()?,
            other => other,
        };
        payload.get("address")?.as_str().map(str::to_string)
    }
}

/// An envelope that passed (or was exempt from) authentication.
#[derive(Debug, Clone)]
pub struct VerifiedEnvelope {
    inner: Envelope,
    signed: bool,
}

impl VerifiedEnvelope {
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// True when the caller's signature was checked. Always false in public
    /// mode, where the address is only a claim.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Release the payload in canonical shape.
    pub fn into_payload(self) -> (Value, String) {
        let payload = self.inner.packaged();
        (payload, self.inner.address)
    }
}

/// Payload after deserialization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    pub kwargs: Map<String, Value>,
    pub timestamp: i64,
    pub address: String,
}

impl DecodedCall {
    /// Read a deserialized payload. `fallback_address` fills a missing
    /// inner address.
    pub fn from_value(value: Value, fallback_address: &str) -> Result<Self, PipelineError> {
        let Value::Object(mut payload) = value else {
            return Err(PipelineError::Decode("payload must be an object".into()));
        };

        let args = match payload.remove("args") {
            None => None,
            Some(Value::Array(args)) => Some(args),
            Some(other) => {
                return Err(PipelineError::Decode(format!(
                    "args must be a list, got {}",
                    type_name(&other)
                )))
            }
        };
        let kwargs = match payload.remove("kwargs") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(kwargs)) => kwargs,
            Some(other) => {
                return Err(PipelineError::Decode(format!(
                    "kwargs must be a mapping, got {}",
                    type_name(&other)
                )))
            }
        };
        let timestamp = match payload.remove("timestamp") {
            None | Some(Value::Null) => 0,
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| PipelineError::Decode("timestamp out of range".into()))?,
            Some(other) => {
                return Err(PipelineError::Decode(format!(
                    "timestamp must be a number, got {}",
                    type_name(&other)
                )))
            }
        };
        let address = match payload.remove("address") {
            Some(Value::String(address)) => address,
            _ => fallback_address.to_string(),
        };

        Ok(Self {
            args,
            kwargs,
            timestamp,
            address,
        })
    }

    /// Seconds between the call's timestamp and `now`.
    pub fn age(&self, now: i64) -> i64 {
        now.saturating_sub(self.timestamp)
    }

    /// Arguments for invocation; `args` must be present.
    pub fn call_args(&self) -> Result<CallArgs, PipelineError> {
        let args = self
            .args
            .clone()
            .ok_or_else(|| PipelineError::Shape("args not in input data".into()))?;
        Ok(CallArgs::new(args, self.kwargs.clone()))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use serde_json::json;

    fn signed_data_envelope(keypair: &Keypair, payload: Value) -> Envelope {
        let data = payload.to_string();
        Envelope {
            signature: Some(keypair.sign(data.as_bytes())),
            data: Some(Value::String(data)),
            address: keypair.address(),
            ..Default::default()
        }
    }

    #[test]
    fn test_raw_fields_are_packaged() {
        let envelope = Envelope {
            args: Some(json!([1, 2])),
            timestamp: Some(json!(100)),
            address: "abc".into(),
            ..Default::default()
        };
        assert_eq!(
            envelope.packaged(),
            json!({"args": [1, 2], "kwargs": {}, "timestamp": 100, "address": "abc"})
        );
    }

    #[test]
    fn test_data_wins_over_raw_fields() {
        let envelope = Envelope {
            data: Some(json!({"args": []})),
            args: Some(json!([9])),
            ..Default::default()
        };
        assert_eq!(envelope.packaged(), json!({"args": []}));
    }

    #[test]
    fn test_authenticate_valid_text_payload() {
        let keypair = Keypair::generate();
        let payload = json!({"args": [], "timestamp": 1, "address": keypair.address()});
        let envelope = signed_data_envelope(&keypair, payload);
        assert!(envelope.authenticate(false).unwrap().is_signed());
    }

    #[test]
    fn test_authenticate_raw_payload() {
        let keypair = Keypair::generate();
        let mut envelope = Envelope {
            args: Some(json!([1])),
            kwargs: Some(json!({"x": 1})),
            timestamp: Some(json!(5)),
            address: keypair.address(),
            ..Default::default()
        };
        envelope.signature = Some(keypair.sign(envelope.signed_message().as_bytes()));
        assert!(envelope.authenticate(false).is_ok());
    }

    #[test]
    fn test_missing_signature_rejected() {
        let envelope = Envelope {
            address: Keypair::generate().address(),
            ..Default::default()
        };
        let err = envelope.authenticate(false).unwrap_err();
        assert!(matches!(err, PipelineError::Integrity(m) if m.contains("missing signature")));
    }

    #[test]
    fn test_address_binding_enforced() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let payload = json!({"args": [], "timestamp": 1, "address": other.address()});
        let envelope = signed_data_envelope(&keypair, payload);
        let err = envelope.authenticate(false).unwrap_err();
        assert!(matches!(err, PipelineError::Integrity(m) if m.contains("does not match")));
    }

    #[test]
    fn test_public_mode_admits_anything_unsigned() {
        let envelope = Envelope {
            data: Some(json!({"args": []})),
            signature: Some("garbage".into()),
            ..Default::default()
        };
        assert!(!envelope.authenticate(true).unwrap().is_signed());
    }

    #[test]
    fn test_decoded_call_defaults() {
        let call = DecodedCall::from_value(json!({"args": [1]}), "outer").unwrap();
        assert_eq!(call.args, Some(vec![json!(1)]));
        assert!(call.kwargs.is_empty());
        assert_eq!(call.timestamp, 0);
        assert_eq!(call.address, "outer");
    }

    #[test]
    fn test_decoded_call_rejects_bad_fields() {
        assert!(DecodedCall::from_value(json!([1]), "a").is_err());
        assert!(DecodedCall::from_value(json!({"args": "x"}), "a").is_err());
        assert!(DecodedCall::from_value(json!({"args": [], "kwargs": [1]}), "a").is_err());
        assert!(DecodedCall::from_value(json!({"args": [], "timestamp": "now"}), "a").is_err());
    }

    #[test]
    fn test_fractional_timestamp_truncates() {
        let call = DecodedCall::from_value(json!({"args": [], "timestamp": 12.9}), "a").unwrap();
        assert_eq!(call.timestamp, 12);
    }

    #[test]
    fn test_missing_args_is_shape_error() {
        let call = DecodedCall::from_value(json!({"kwargs": {}}), "a").unwrap();
        assert!(matches!(call.call_args(), Err(PipelineError::Shape(_))));
    }

    #[test]
    fn test_from_slice_rejects_garbage() {
        assert!(matches!(
            Envelope::from_slice(b"{not json"),
            Err(PipelineError::Decode(_))
        ));
    }
}
