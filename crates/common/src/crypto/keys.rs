use std::fmt;

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Size of Ed25519 private key in bytes
pub const PRIVATE_KEY_SIZE: usize = 32;
/// Size of Ed25519 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

const PRIVATE_KEY_TAG: &str = "PRIVATE KEY";
const PUBLIC_KEY_TAG: &str = "PUBLIC KEY";

/// Errors that can occur during key operations
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key error: {0}")]
    Default(#[from] anyhow::Error),
}

/// Public half of a host, user, gateway or server identity.
///
/// Hosts publish one of these through the directory; the server uses it both to
/// verify request envelopes and to seal bootstrap keys for that host.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = KeyError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(anyhow::anyhow!(
                "invalid public key size, expected {}, got {}",
                PUBLIC_KEY_SIZE,
                bytes.len()
            )
            .into());
        }
        let mut buff = [0; PUBLIC_KEY_SIZE];
        buff.copy_from_slice(bytes);
        let key = VerifyingKey::from_bytes(&buff)
            .map_err(|_| anyhow::anyhow!("public key is not a valid curve point"))?;
        Ok(PublicKey(key))
    }
}

impl PublicKey {
    /// Parse a public key from a hexadecimal string
    ///
    /// Accepts both plain hex and "0x"-prefixed hex strings.
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut buff = [0; PUBLIC_KEY_SIZE];
        hex::decode_to_slice(hex, &mut buff)
            .map_err(|_| anyhow::anyhow!("public key hex decode error"))?;
        Self::try_from(buff.as_slice())
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Encode in PEM format with tag "PUBLIC KEY".
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PUBLIC_KEY_TAG, self.to_bytes()))
    }

    /// Parse a public key from PEM format.
    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str).map_err(|e| anyhow::anyhow!("failed to parse PEM: {}", e))?;
        if pem.tag() != PUBLIC_KEY_TAG {
            return Err(anyhow::anyhow!("invalid PEM tag, expected PUBLIC KEY").into());
        }
        Self::try_from(pem.contents())
    }

    /// Convert the Ed25519 point to X25519 (Montgomery form) for ECDH.
    ///
    /// # Errors
    ///
    /// Returns an error if the point fails to decompress.
    #[allow(clippy::wrong_self_convention)]
    pub(crate) fn to_x25519(&self) -> Result<X25519PublicKey, KeyError> {
        let edwards_point = CompressedEdwardsY(self.to_bytes())
            .decompress()
            .ok_or_else(|| anyhow::anyhow!("public key failed to decompress edwards point"))?;
        Ok(X25519PublicKey::from(edwards_point.to_montgomery().to_bytes()))
    }

    /// Verify an Ed25519 signature on a message.
    pub fn verify(
        &self,
        msg: &[u8],
        signature: &ed25519_dalek::Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        self.0.verify_strict(msg, signature)
    }
}

/// Private half of an Ed25519 identity.
///
/// Used for the server's response-signing key, for per-user keys, and for the
/// per-volume bootstrap key shared by freshly created gateways.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecretKey").field(&self.public()).finish()
    }
}

impl From<[u8; PRIVATE_KEY_SIZE]> for SecretKey {
    fn from(secret: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(SigningKey::from_bytes(&secret))
    }
}

impl SecretKey {
    /// Parse a secret key from a hexadecimal string
    ///
    /// Accepts both plain hex and "0x"-prefixed hex strings.
    pub fn from_hex(hex: &str) -> Result<Self, KeyError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut buff = [0; PRIVATE_KEY_SIZE];
        hex::decode_to_slice(hex, &mut buff)
            .map_err(|_| anyhow::anyhow!("private key hex decode error"))?;
        Ok(Self::from(buff))
    }

    /// Generate a new random secret key from the OS RNG.
    pub fn generate() -> Result<Self, KeyError> {
        let mut bytes = [0u8; PRIVATE_KEY_SIZE];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| anyhow::anyhow!("failed to generate random bytes: {}", e))?;
        Ok(Self::from(bytes))
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_SIZE] {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Encode secret key in PEM format for storage
    ///
    /// Returns a PEM-encoded string with tag "PRIVATE KEY".
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new(PRIVATE_KEY_TAG, self.to_bytes()))
    }

    /// Parse a secret key from PEM format
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The PEM string is malformed
    /// - The PEM tag is not "PRIVATE KEY"
    /// - The key size is incorrect
    pub fn from_pem(pem_str: &str) -> Result<Self, KeyError> {
        let pem = pem::parse(pem_str).map_err(|e| anyhow::anyhow!("failed to parse PEM: {}", e))?;

        if pem.tag() != PRIVATE_KEY_TAG {
            return Err(anyhow::anyhow!("invalid PEM tag, expected PRIVATE KEY").into());
        }

        let contents = pem.contents();
        if contents.len() != PRIVATE_KEY_SIZE {
            return Err(anyhow::anyhow!(
                "invalid private key size in PEM, expected {}, got {}",
                PRIVATE_KEY_SIZE,
                contents.len()
            )
            .into());
        }

        let mut bytes = [0u8; PRIVATE_KEY_SIZE];
        bytes.copy_from_slice(contents);
        Ok(Self::from(bytes))
    }

    /// The clamped scalar of the Ed25519 key doubles as the X25519 private key.
    pub(crate) fn to_x25519(&self) -> StaticSecret {
        StaticSecret::from(self.0.to_scalar_bytes())
    }

    /// Sign a message, returning a detached signature.
    pub fn sign(&self, msg: &[u8]) -> ed25519_dalek::Signature {
        self.0.sign(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_hex_encoding_preserves_identity() {
        let private_key = SecretKey::generate().unwrap();
        let public_key = private_key.public();

        let recovered_private = SecretKey::from_hex(&private_key.to_hex()).unwrap();
        assert_eq!(private_key.to_bytes(), recovered_private.to_bytes());

        let recovered_public = PublicKey::from_hex(&format!("0x{}", public_key.to_hex())).unwrap();
        assert_eq!(public_key, recovered_public);
    }

    #[test]
    fn test_pem_tags_are_enforced() {
        let private_key = SecretKey::generate().unwrap();
        let public_pem = private_key.public().to_pem();

        assert_eq!(
            PublicKey::from_pem(&public_pem).unwrap(),
            private_key.public()
        );
        assert!(SecretKey::from_pem(&public_pem).is_err());
        assert!(PublicKey::from_pem(&private_key.to_pem()).is_err());
    }

    #[test]
    fn test_sign_and_verify() {
        let secret_key = SecretKey::generate().unwrap();
        let public_key = secret_key.public();
        let message = b"mount me";

        let signature = secret_key.sign(message);
        assert!(public_key.verify(message, &signature).is_ok());
        assert!(public_key.verify(b"mount you", &signature).is_err());

        let other_key = SecretKey::generate().unwrap().public();
        assert!(other_key.verify(message, &signature).is_err());
    }

    #[test]
    fn test_public_key_size_validation() {
        assert!(PublicKey::try_from([7u8; 16].as_slice()).is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }
}
