//! Bootstrap keys sealed to a single host
//!
//! A volume's bootstrap private key is handed to every host that mounts the
//! volume, but it must only be readable by that host. The key is sealed with
//! ECDH + AES Key Wrap (RFC 3394):
//!
//! 1. Generate an ephemeral Ed25519 keypair
//! 2. Convert the ephemeral secret and the host's public key to X25519
//! 3. Run ECDH and use the shared secret as the key-encryption key
//! 4. Wrap the 32 bootstrap key bytes with AES-KW
//!
//! Wire layout: `[ ephemeral_pubkey: 32 bytes ][ wrapped_key: 40 bytes ]`.

use aes_kw::KekAes256 as Kek;

use super::keys::{KeyError, PublicKey, SecretKey, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};

/// AES-KW adds one 8 byte integrity block to the wrapped data
pub const KW_OVERHEAD: usize = 8;
/// Total size of a sealed key in bytes
pub const SEALED_KEY_SIZE: usize = PUBLIC_KEY_SIZE + PRIVATE_KEY_SIZE + KW_OVERHEAD;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("seal error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("key error: {0}")]
    Key(#[from] KeyError),
}

/// A private key wrapped so that only the holder of `recipient`'s secret key can open it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SealedKey([u8; SEALED_KEY_SIZE]);

impl SealedKey {
    /// Seal `key` for `recipient`.
    pub fn seal(key: &SecretKey, recipient: &PublicKey) -> Result<Self, SealError> {
        let ephemeral = SecretKey::generate()?;
        let shared = ephemeral
            .to_x25519()
            .diffie_hellman(&recipient.to_x25519()?);

        let kek = Kek::from(*shared.as_bytes());
        let wrapped = kek
            .wrap_vec(&key.to_bytes())
            .map_err(|_| anyhow::anyhow!("AES-KW wrap error"))?;

        if wrapped.len() != PRIVATE_KEY_SIZE + KW_OVERHEAD {
            return Err(anyhow::anyhow!("wrapped key has unexpected size {}", wrapped.len()).into());
        }

        let mut sealed = [0u8; SEALED_KEY_SIZE];
        sealed[..PUBLIC_KEY_SIZE].copy_from_slice(&ephemeral.public().to_bytes());
        sealed[PUBLIC_KEY_SIZE..].copy_from_slice(&wrapped);
        Ok(Self(sealed))
    }

    /// Recover the sealed key with the recipient's secret key.
    ///
    /// Fails if the key was sealed for someone else or the bytes were altered.
    pub fn open(&self, recipient: &SecretKey) -> Result<SecretKey, SealError> {
        let ephemeral = PublicKey::try_from(&self.0[..PUBLIC_KEY_SIZE])?;
        let shared = recipient.to_x25519().diffie_hellman(&ephemeral.to_x25519()?);

        let kek = Kek::from(*shared.as_bytes());
        let unwrapped = kek
            .unwrap_vec(&self.0[PUBLIC_KEY_SIZE..])
            .map_err(|_| anyhow::anyhow!("AES-KW unwrap error"))?;

        let bytes: [u8; PRIVATE_KEY_SIZE] = unwrapped
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("unwrapped key has wrong size"))?;
        Ok(SecretKey::from(bytes))
    }

    pub fn from_hex(hex: &str) -> Result<Self, SealError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut buff = [0; SEALED_KEY_SIZE];
        hex::decode_to_slice(hex, &mut buff).map_err(|_| anyhow::anyhow!("hex decode error"))?;
        Ok(Self(buff))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_host_can_open_its_sealed_key() {
        let bootstrap = SecretKey::generate().unwrap();
        let host = SecretKey::generate().unwrap();

        let sealed = SealedKey::seal(&bootstrap, &host.public()).unwrap();
        let opened = sealed.open(&host).unwrap();

        assert_eq!(opened.to_bytes(), bootstrap.to_bytes());
    }

    #[test]
    fn test_other_host_cannot_open() {
        let bootstrap = SecretKey::generate().unwrap();
        let host = SecretKey::generate().unwrap();
        let intruder = SecretKey::generate().unwrap();

        let sealed = SealedKey::seal(&bootstrap, &host.public()).unwrap();
        assert!(sealed.open(&intruder).is_err());
    }

    #[test]
    fn test_each_seal_uses_a_fresh_ephemeral_key() {
        let bootstrap = SecretKey::generate().unwrap();
        let host = SecretKey::generate().unwrap();

        let first = SealedKey::seal(&bootstrap, &host.public()).unwrap();
        let second = SealedKey::seal(&bootstrap, &host.public()).unwrap();
        assert_ne!(first, second);

        let reparsed = SealedKey::from_hex(&second.to_hex()).unwrap();
        assert_eq!(
            reparsed.open(&host).unwrap().to_bytes(),
            bootstrap.to_bytes()
        );
    }

    #[test]
    fn test_tampered_seal_is_rejected() {
        let bootstrap = SecretKey::generate().unwrap();
        let host = SecretKey::generate().unwrap();

        let mut raw = SealedKey::seal(&bootstrap, &host.public()).unwrap().0;
        raw[SEALED_KEY_SIZE - 1] ^= 0x01;
        assert!(SealedKey(raw).open(&host).is_err());
    }
}
