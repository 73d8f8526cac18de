//! Server and caller identities.
//!
//! SECURITY: Every response on the non-streaming path is signed with the
//! server key, and every authenticated call is verified against the
//! caller's key. An address is the hex encoding of an ed25519 public key,
//! so the address alone is enough to verify a signature.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Length of a key seed in bytes.
pub const SEED_SIZE: usize = 32;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid key seed: {0}")]
    InvalidSeed(String),

    #[error("Invalid signature encoding")]
    InvalidSignatureEncoding,

    #[error("Signature verification failed")]
    InvalidSignature,
}

/// ed25519 signing keypair.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS random source.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; SEED_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; SEED_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Parse a hex-encoded 32-byte seed.
    pub fn from_hex(seed_hex: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| IdentityError::InvalidSeed(e.to_string()))?;
        let seed: [u8; SEED_SIZE] = bytes.try_into().map_err(|b: Vec<u8>| {
            IdentityError::InvalidSeed(format!("expected {} bytes, got {}", SEED_SIZE, b.len()))
        })?;
        Ok(Self::from_seed(seed))
    }

    /// Public address (hex-encoded verifying key).
    pub fn address(&self) -> String {
        hex::encode(self.signing.verifying_key().as_bytes())
    }

    /// Hex-encoded seed. Handle with care.
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    /// Sign a message, returning the hex-encoded signature.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing.sign(message).to_bytes())
    }

    /// Sign already-encoded data, producing the response envelope.
    pub fn sign_payload(&self, data: String) -> SignedPayload {
        let signature = self.sign(data.as_bytes());
        SignedPayload {
            data,
            signature,
            address: self.address(),
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Verify a hex signature over `message` by the key behind `address`.
pub fn verify_signature(
    address: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), IdentityError> {
    let key_bytes: [u8; 32] = hex::decode(address)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| IdentityError::InvalidAddress(address.to_string()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|_| IdentityError::InvalidAddress(address.to_string()))?;

    let sig_bytes =
        hex::decode(signature_hex).map_err(|_| IdentityError::InvalidSignatureEncoding)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| IdentityError::InvalidSignatureEncoding)?;

    key.verify_strict(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}

/// Encoded data plus the signature of the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub data: String,
    pub signature: String,
    pub address: String,
}

impl SignedPayload {
    /// Check that `signature` covers `data` under `address`.
    pub fn verify(&self) -> Result<(), IdentityError> {
        verify_signature(&self.address, self.data.as_bytes(), &self.signature)
    }
}

/// The process's own identity, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    keypair: Keypair,
    name: String,
    ip: String,
    port: u16,
}

impl ServerIdentity {
    pub fn new(keypair: Keypair, name: impl Into<String>, ip: &str, port: u16) -> Self {
        // "http://1.2.3.4" and "1.2.3.4" name the same host
        let ip = ip.split("://").last().unwrap_or(ip).to_string();
        Self {
            keypair,
            name: name.into(),
            ip,
            port,
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Key address used to sign responses.
    pub fn key_address(&self) -> String {
        self.keypair.address()
    }

    /// Network address (`ip:port`).
    pub fn network_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.network_address())
    }

    /// Serializable summary of this server.
    pub fn state(&self) -> Value {
        json!({
            "name": self.name,
            "ip": self.ip,
            "port": self.port,
            "address": self.network_address(),
            "key": self.key_address(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"hello");
        assert!(verify_signature(&keypair.address(), b"hello", &signature).is_ok());
    }

    #[test]
    fn test_tampered_message_rejected() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"hello");
        assert_eq!(
            verify_signature(&keypair.address(), b"hellO", &signature),
            Err(IdentityError::InvalidSignature)
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let signature = signer.sign(b"hello");
        assert_eq!(
            verify_signature(&other.address(), b"hello", &signature),
            Err(IdentityError::InvalidSignature)
        );
    }

    #[test]
    fn test_malformed_inputs() {
        let keypair = Keypair::generate();
        assert!(matches!(
            verify_signature("zz", b"m", &keypair.sign(b"m")),
            Err(IdentityError::InvalidAddress(_))
        ));
        assert_eq!(
            verify_signature(&keypair.address(), b"m", "abcd"),
            Err(IdentityError::InvalidSignatureEncoding)
        );
    }

    #[test]
    fn test_seed_roundtrip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_hex(&keypair.seed_hex()).unwrap();
        assert_eq!(keypair.address(), restored.address());
    }

    #[test]
    fn test_bad_seed_length() {
        let result = Keypair::from_hex("0011");
        assert!(matches!(result, Err(IdentityError::InvalidSeed(_))));
    }

    #[test]
    fn test_signed_payload_verifies() {
        let keypair = Keypair::from_seed([7u8; SEED_SIZE]);
        let mut payload = keypair.sign_payload("[1,2]".to_string());
        assert!(payload.verify().is_ok());

        payload.data = "[1,3]".to_string();
        assert!(payload.verify().is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let keypair = Keypair::from_seed([1u8; SEED_SIZE]);
        let debug = format!("{:?}", keypair);
        assert!(!debug.contains(&keypair.seed_hex()));
        assert!(debug.contains(&keypair.address()));
    }

    #[test]
    fn test_server_identity_strips_scheme() {
        let identity = ServerIdentity::new(Keypair::generate(), "demo", "http://127.0.0.1", 9000);
        assert_eq!(identity.network_address(), "127.0.0.1:9000");
        assert_eq!(identity.url(), "http://127.0.0.1:9000");
        assert_eq!(identity.state()["name"], "demo");
    }
}
