/**
 * Cryptographic types and operations.
 *  - Ed25519 identities and detached signatures
 *  - Bootstrap keys sealed to a single host
 */
pub mod crypto;
/**
 * Signed JSON envelopes carrying clear-text
 *  routing fields next to the signature.
 */
pub mod envelope;
/**
 * The declarative provision plan document:
 *  users, volumes and gateways to create or delete.
 */
pub mod plan;
/**
 * Build version information.
 */
pub mod version;

pub mod prelude {
    pub use crate::crypto::{Ed25519Signatures, PublicKey, SecretKey, SignatureService};
    pub use crate::envelope::{Envelope, EnvelopeError};
    pub use crate::plan::{GatewaySpec, GatewayType, ProvisionPlan, VolumeSpec};
    pub use crate::version::build_info;
}
