//! Authentication of inbound provisioning requests.
//!
//! A request walks `Received -> HostnameChecked -> PubkeyFetched ->
//! SignatureVerified -> Authenticated`; any step may reject it. The caller only
//! learns *that* a request was rejected. Why it was rejected is logged here.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use common::crypto::{PublicKey, SecretKey, SignatureService};
use common::envelope::{Envelope, EnvelopeError};

use crate::directory::{Directory, DirectoryError};

pub const HOSTNAME_FIELD: &str = "hostname";
pub const INSTANCE_FIELD: &str = "instance";

/// Signed body of a provisioning request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub hostname: String,
    pub instance: String,
}

impl RequestPayload {
    /// Build the wire envelope a host sends: the signed payload plus a clear-text
    /// copy of the hostname for key lookup.
    pub fn seal(
        &self,
        signatures: &dyn SignatureService,
        key: &SecretKey,
    ) -> Result<Envelope, EnvelopeError> {
        let payload = serde_json::to_vec(self)?;
        Envelope::seal(
            signatures,
            key,
            &payload,
            [(HOSTNAME_FIELD.to_string(), Value::from(self.hostname.clone()))],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    HostnameChecked,
    PubkeyFetched,
    SignatureVerified,
    Authenticated,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::HostnameChecked => "hostname_checked",
            Stage::PubkeyFetched => "pubkey_fetched",
            Stage::SignatureVerified => "signature_verified",
            Stage::Authenticated => "authenticated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] EnvelopeError),
    #[error("envelope carries no clear-text hostname")]
    MissingHostname,
    #[error("unknown host")]
    UnknownHost,
    #[error("directory lookup failed: {0}")]
    Directory(#[from] DirectoryError),
    #[error("directory lookup timed out")]
    Timeout,
    #[error("signature does not verify against the host key")]
    BadSignature,
    #[error("signed payload is not a JSON object")]
    MalformedPayload,
    #[error("signed hostname '{inner}' does not match envelope hostname")]
    HostnameMismatch { inner: String },
    #[error("signed payload is missing fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
}

impl AuthError {
    /// The last stage the request reached before being rejected.
    pub fn stage(&self) -> Stage {
        match self {
            AuthError::Malformed(_) | AuthError::MissingHostname => Stage::Received,
            AuthError::UnknownHost => Stage::Received,
            AuthError::Directory(_) | AuthError::Timeout => Stage::HostnameChecked,
            AuthError::BadSignature => Stage::PubkeyFetched,
            AuthError::MalformedPayload
            | AuthError::HostnameMismatch { .. }
            | AuthError::MissingFields(_) => Stage::SignatureVerified,
        }
    }
}

/// An authenticated `{hostname, instance}` together with the key that proved it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedRequest {
    pub hostname: String,
    pub instance: String,
    pub public_key: PublicKey,
}

#[derive(Clone)]
pub struct Authenticator {
    directory: Arc<dyn Directory>,
    signatures: Arc<dyn SignatureService>,
    call_timeout: Duration,
}

impl Authenticator {
    pub fn new(
        directory: Arc<dyn Directory>,
        signatures: Arc<dyn SignatureService>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            signatures,
            call_timeout,
        }
    }

    /// Authenticate a raw request body, logging the reason for any rejection.
    pub async fn authenticate(&self, body: &[u8]) -> Result<AuthenticatedRequest, AuthError> {
        match self.check(body).await {
            Ok(request) => {
                tracing::debug!(
                    hostname = %request.hostname,
                    instance = %request.instance,
                    stage = %Stage::Authenticated,
                    "request authenticated"
                );
                Ok(request)
            }
            Err(e) => {
                tracing::warn!(stage = %e.stage(), reason = %e, "request rejected");
                Err(e)
            }
        }
    }

    async fn check(&self, body: &[u8]) -> Result<AuthenticatedRequest, AuthError> {
        let envelope = Envelope::from_slice(body)?;
        let hostname = envelope
            .clear_field(HOSTNAME_FIELD)
            .ok_or(AuthError::MissingHostname)?
            .to_string();

        // no key fetch for hosts we do not know
        let known = timeout(self.call_timeout, self.directory.is_known_host(&hostname))
            .await
            .map_err(|_| AuthError::Timeout)??;
        if !known {
            tracing::debug!(hostname = %hostname, "hostname not in directory");
            return Err(AuthError::UnknownHost);
        }

        let public_key = timeout(self.call_timeout, self.directory.host_public_key(&hostname))
            .await
            .map_err(|_| AuthError::Timeout)??;

        let payload = envelope
            .open(self.signatures.as_ref(), &public_key)
            .map_err(|_| AuthError::BadSignature)?;

        let fields = match serde_json::from_slice::<Value>(&payload) {
            Ok(Value::Object(fields)) => fields,
            _ => return Err(AuthError::MalformedPayload),
        };
        let field = |name: &str| fields.get(name).and_then(Value::as_str);

        if let Some(inner) = field(HOSTNAME_FIELD) {
            if inner != hostname {
                return Err(AuthError::HostnameMismatch {
                    inner: inner.to_string(),
                });
            }
        }

        let missing: Vec<&'static str> = [HOSTNAME_FIELD, INSTANCE_FIELD]
            .into_iter()
            .filter(|name| field(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(AuthError::MissingFields(missing));
        }

        Ok(AuthenticatedRequest {
            instance: field(INSTANCE_FIELD).unwrap_or_default().to_string(),
            hostname,
            public_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::StaticDirectory;
    use common::crypto::Ed25519Signatures;

    fn authenticator(directory: Arc<StaticDirectory>) -> Authenticator {
        Authenticator::new(directory, Arc::new(Ed25519Signatures), Duration::from_secs(5))
    }

    fn raw_envelope(key: &SecretKey, outer: &str, inner: &Value) -> Vec<u8> {
        let payload = serde_json::to_vec(inner).unwrap();
        Envelope::seal(
            &Ed25519Signatures,
            key,
            &payload,
            [(HOSTNAME_FIELD.to_string(), Value::from(outer))],
        )
        .unwrap()
        .to_json()
        .unwrap()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_valid_request_is_authenticated() {
        let key = SecretKey::generate().unwrap();
        let directory = Arc::new(StaticDirectory::new().with_host("h1", key.public()));
        let auth = authenticator(directory);

        let request = RequestPayload {
            hostname: "h1".to_string(),
            instance: "inst1".to_string(),
        };
        let body = request
            .seal(&Ed25519Signatures, &key)
            .unwrap()
            .to_json()
            .unwrap();

        let accepted = auth.authenticate(body.as_bytes()).await.unwrap();
        assert_eq!(accepted.hostname, "h1");
        assert_eq!(accepted.instance, "inst1");
        assert_eq!(accepted.public_key, key.public());
    }

    #[tokio::test]
    async fn test_missing_fields_are_listed() {
        let key = SecretKey::generate().unwrap();
        let auth = authenticator(Arc::new(
            StaticDirectory::new().with_host("h1", key.public()),
        ));

        let body = raw_envelope(&key, "h1", &serde_json::json!({"hostname": "h1"}));
        match auth.authenticate(&body).await {
            Err(AuthError::MissingFields(fields)) => assert_eq!(fields, vec![INSTANCE_FIELD]),
            other => panic!("unexpected {:?}", other),
        }

        let body = raw_envelope(&key, "h1", &serde_json::json!({"instance": 7}));
        match auth.authenticate(&body).await {
            Err(AuthError::MissingFields(fields)) => {
                assert_eq!(fields, vec![HOSTNAME_FIELD, INSTANCE_FIELD])
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_structural_failures_stop_early() {
        let key = SecretKey::generate().unwrap();
        let directory = Arc::new(StaticDirectory::new().with_host("h1", key.public()));
        let auth = authenticator(directory.clone());

        assert!(matches!(
            auth.authenticate(b"{not json").await,
            Err(AuthError::Malformed(_))
        ));

        let no_hostname = Envelope::seal(&Ed25519Signatures, &key, b"{}", Vec::new())
            .unwrap()
            .to_json()
            .unwrap();
        assert!(matches!(
            auth.authenticate(no_hostname.as_bytes()).await,
            Err(AuthError::MissingHostname)
        ));

        let array = raw_envelope(&key, "h1", &serde_json::json!(["h1", "inst1"]));
        assert!(matches!(
            auth.authenticate(&array).await,
            Err(AuthError::MalformedPayload)
        ));

        assert_eq!(directory.known_checks(), 1);
        assert_eq!(directory.key_fetches(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_key_is_rejected() {
        let auth = authenticator(Arc::new(StaticDirectory::new().with_keyless_host("h1")));
        let key = SecretKey::generate().unwrap();
        let body = raw_envelope(
            &key,
            "h1",
            &serde_json::json!({"hostname": "h1", "instance": "inst1"}),
        );

        let rejected = auth.authenticate(&body).await.unwrap_err();
        assert!(matches!(rejected, AuthError::Directory(_)));
        assert_eq!(rejected.stage(), Stage::HostnameChecked);
    }
}
