//! Signed request/response envelopes.
//!
//! On the wire an envelope is a single JSON object:
//!
//! ```text
//! { "data": <b64 payload>, "sig": <b64 signature>, "hostname": "h1", ... }
//! ```
//!
//! Everything besides `data` and `sig` is a clear-text field. Clear fields are not
//! covered by the signature; they only exist so the receiver can pick a
//! verification key before verifying.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::{PublicKey, SecretKey, SignatureService, SignedBlob};

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("clear field '{0}' collides with signature framing")]
    ReservedField(String),
    #[error("signature verification failed")]
    BadSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    signed: SignedBlob,
    #[serde(flatten)]
    clear: BTreeMap<String, Value>,
}

impl Envelope {
    /// Sign `payload` with `key`, embedding `clear_fields` next to the signature.
    pub fn seal<S>(
        service: &S,
        key: &SecretKey,
        payload: &[u8],
        clear_fields: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<Self, EnvelopeError>
    where
        S: SignatureService + ?Sized,
    {
        let mut clear = BTreeMap::new();
        for (name, value) in clear_fields {
            if name == "data" || name == "sig" {
                return Err(EnvelopeError::ReservedField(name));
            }
            clear.insert(name, value);
        }
        Ok(Self {
            signed: service.sign_and_serialize(key, payload),
            clear,
        })
    }

    /// Verify against `key` and hand back the signed payload.
    pub fn open<S>(&self, service: &S, key: &PublicKey) -> Result<Vec<u8>, EnvelopeError>
    where
        S: SignatureService + ?Sized,
    {
        service
            .verify_and_parse(key, &self.signed)
            .ok_or(EnvelopeError::BadSignature)
    }

    /// Read an unauthenticated string field.
    pub fn clear_field(&self, name: &str) -> Option<&str> {
        self.clear.get(name).and_then(Value::as_str)
    }

    pub fn from_slice(raw: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }
}
