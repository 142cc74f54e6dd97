//! Ed25519 signing identity for signaling frames
//!
//! The relay server authenticates every frame by its signature. Frames are
//! signed over their canonical JSON form: object keys sorted, the
//! `signature` field excluded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::Value;
use std::fs;
use std::path::Path;
use thiserror::Error;

const SIGNATURE_FIELD: &str = "signature";

#[derive(Error, Debug)]
pub enum KeyPairError {
    #[error("Key file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid base64: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    #[error("Malformed public key or signature")]
    Malformed,

    #[error("Signature does not match frame")]
    BadSignature,
}

/// Long-lived signing key of this client.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reads the key at `path`, or creates and persists a fresh one.
    pub fn load_or_create(path: &Path) -> Result<Self, KeyPairError> {
        if path.exists() {
            tracing::info!(path = %path.display(), "Loading signing key");
            let encoded = fs::read_to_string(path)?;
            let bytes = BASE64.decode(encoded.trim())?;
            let key: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyPairError::InvalidKeyLength(bytes.len()))?;
            return Ok(Self {
                signing_key: SigningKey::from_bytes(&key),
            });
        }

        tracing::info!(path = %path.display(), "Creating signing key");
        let keypair = Self::generate();
        keypair.persist(path)?;
        Ok(keypair)
    }

    fn persist(&self, path: &Path) -> Result<(), KeyPairError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, BASE64.encode(self.signing_key.to_bytes()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs a frame; returns the base64 signature.
    pub fn sign_frame(&self, frame: &Value) -> String {
        let signature: Signature = self.signing_key.sign(canonical_json(frame).as_bytes());
        BASE64.encode(signature.to_bytes())
    }
}

/// Checks `signature` over `frame` against a base64 public key.
pub fn verify_frame(
    public_key_base64: &str,
    frame: &Value,
    signature: &str,
) -> Result<(), KeyPairError> {
    let key_bytes: [u8; 32] = BASE64
        .decode(public_key_base64)?
        .as_slice()
        .try_into()
        .map_err(|_| KeyPairError::Malformed)?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| KeyPairError::Malformed)?;

    let sig_bytes: [u8; 64] = BASE64
        .decode(signature)?
        .as_slice()
        .try_into()
        .map_err(|_| KeyPairError::Malformed)?;

    key.verify(
        canonical_json(frame).as_bytes(),
        &Signature::from_bytes(&sig_bytes),
    )
    .map_err(|_| KeyPairError::BadSignature)
}

/// Serializes with sorted keys at every level and without `signature`.
fn canonical_json(value: &Value) -> String {
    fn sorted(value: &Value, top_level: bool) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for key in keys {
                    if top_level && key == SIGNATURE_FIELD {
                        continue;
                    }
                    out.insert(key.clone(), sorted(&map[key], false));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| sorted(v, false)).collect()),
            other => other.clone(),
        }
    }

    sorted(value, true).to_string()
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}
