//! Wire codec for call payloads and results.
//!
//! # Security
//! - Size checks happen BEFORE parsing to prevent allocation attacks
//! - Encoded output is bounded so a single result cannot exhaust memory
//!
//! Encoding is deterministic: `serde_json::Map` keeps keys sorted, so the
//! same value always produces the same bytes. Signatures depend on this.

use serde_json::Value;
use thiserror::Error;

/// Default upper bound for a single encoded value.
pub const MAX_ENCODED_SIZE: usize = 16 * 1024 * 1024; // 16 MB

#[derive(Error, Debug)]
pub enum SerializerError {
    #[error("Invalid encoding: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encoded value too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

/// Codec converting call arguments and results to and from wire text.
pub trait Serializer: Send + Sync {
    /// Encode a value to its wire form.
    fn serialize(&self, value: &Value) -> Result<String, SerializerError>;

    /// Decode a wire value. Text is parsed; structured values pass through.
    fn deserialize(&self, value: Value) -> Result<Value, SerializerError>;
}

/// JSON codec.
#[derive(Debug, Clone, Copy)]
pub struct JsonSerializer {
    max_size: usize,
}

impl JsonSerializer {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new(MAX_ENCODED_SIZE)
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<String, SerializerError> {
        let text = serde_json::to_string(value)?;
        if text.len() > self.max_size {
            return Err(SerializerError::TooLarge {
                size: text.len(),
                max: self.max_size,
            });
        }
        Ok(text)
    }

    fn deserialize(&self, value: Value) -> Result<Value, SerializerError> {
        match value {
            Value::String(text) => {
                // SECURITY: Check size BEFORE parsing
                if text.len() > self.max_size {
                    return Err(SerializerError::TooLarge {
                        size: text.len(),
                        max: self.max_size,
                    });
                }
                serde_json::from_str(&text)
                    .map_err(|e| SerializerError::InvalidFormat(e.to_string()))
            }
            other => Ok(other),
        }
    }
}

/// Canonical text of a value, as covered by signatures.
pub fn canonical(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_through_text() {
        let codec = JsonSerializer::default();
        let value = json!({"args": [1, 2], "kwargs": {"b": true, "a": null}});
        let text = codec.serialize(&value).unwrap();
        let decoded = codec.deserialize(Value::String(text)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_structured_value_passes_through() {
        let codec = JsonSerializer::default();
        let value = json!({"args": []});
        assert_eq!(codec.deserialize(value.clone()).unwrap(), value);
    }

    #[test]
    fn test_keys_are_sorted() {
        let codec = JsonSerializer::default();
        let text = codec.serialize(&json!({"z": 1, "a": 2})).unwrap();
        assert_eq!(text, r#"{"a":2,"z":1}"#);
    }

    #[test]
    fn test_invalid_text_rejected() {
        let codec = JsonSerializer::default();
        let result = codec.deserialize(Value::String("not json".into()));
        assert!(matches!(result, Err(SerializerError::InvalidFormat(_))));
    }

    #[test]
    fn test_size_limit_on_encode() {
        let codec = JsonSerializer::new(8);
        let result = codec.serialize(&json!("a long string value"));
        assert!(matches!(result, Err(SerializerError::TooLarge { .. })));
    }

    #[test]
    fn test_size_limit_checked_before_parse() {
        let codec = JsonSerializer::new(4);
        let result = codec.deserialize(Value::String("[1,2,3,4,5]".into()));
        assert!(matches!(result, Err(SerializerError::TooLarge { size: 11, max: 4 })));
    }

    #[test]
    fn test_canonical_text_is_verbatim_for_strings() {
        assert_eq!(canonical(&json!("{\"b\":1}")), "{\"b\":1}");
        assert_eq!(canonical(&json!({"b": 1, "a": [1]})), r#"{"a":[1],"b":1}"#);
    }
}
