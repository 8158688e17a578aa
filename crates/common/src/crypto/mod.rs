//! Cryptographic primitives for fleetmount
//!
//! - **Identity**: Ed25519 keypairs for hosts, users, gateways and the server
//! - **Signatures**: detached Ed25519 signatures behind the `SignatureService` seam
//! - **Key sealing**: ECDH + AES-KW wrapping of bootstrap keys for one host

mod keys;
mod sealed_key;
mod signature;

pub use ed25519_dalek::Signature;
pub use keys::{KeyError, PublicKey, SecretKey, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
pub use sealed_key::{SealError, SealedKey, SEALED_KEY_SIZE};
pub use signature::{Ed25519Signatures, SignatureService, SignedBlob};
