use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::keys::{PublicKey, SecretKey};

/// A payload together with a detached signature over its exact bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlob {
    /// Base64 encoded payload bytes
    pub data: String,
    /// Base64 encoded signature over the decoded payload bytes
    pub sig: String,
}

/// The signing seam. Anything that can sign a payload and later check it against
/// the matching public key can stand in here.
pub trait SignatureService: Send + Sync {
    fn sign_and_serialize(&self, key: &SecretKey, payload: &[u8]) -> SignedBlob;

    /// Returns the verified payload, or `None` on any structural or cryptographic mismatch.
    fn verify_and_parse(&self, key: &PublicKey, blob: &SignedBlob) -> Option<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Signatures;

impl SignatureService for Ed25519Signatures {
    fn sign_and_serialize(&self, key: &SecretKey, payload: &[u8]) -> SignedBlob {
        let signature = key.sign(payload);
        SignedBlob {
            data: BASE64.encode(payload),
            sig: BASE64.encode(signature.to_bytes()),
        }
    }

    fn verify_and_parse(&self, key: &PublicKey, blob: &SignedBlob) -> Option<Vec<u8>> {
        let payload = BASE64.decode(&blob.data).ok()?;
        let sig_bytes = BASE64.decode(&blob.sig).ok()?;
        let signature = ed25519_dalek::Signature::from_slice(&sig_bytes).ok()?;
        key.verify(&payload, &signature).ok()?;
        Some(payload)
    }
}
