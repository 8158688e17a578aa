//! The remote resource-management API that owns users, volumes and gateways.
//!
//! Every mutating operation is idempotent: `ensure_*` leaves the entity present
//! (reporting whether it had to create or update it) and `ensure_*_absent`
//! leaves it gone. That is what makes blind re-submission of a plan safe.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use common::plan::{Capability, GatewayType};

#[derive(Debug, thiserror::Error)]
pub enum ResourceApiError {
    #[error("HTTP request failed: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("HTTP status {0}: {1}")]
    HttpStatus(StatusCode, String),
    #[error("failed to read driver package {path}: {source}")]
    Driver {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("call timed out")]
    Timeout,
    #[error("{0}")]
    Rejected(String),
}

/// Outcome of an idempotent ensure call. `entity: None` means the API declined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ensured<T> {
    pub created: bool,
    pub updated: bool,
    pub entity: Option<T>,
}

impl<T> Ensured<T> {
    pub fn created(entity: T) -> Self {
        Self {
            created: true,
            updated: false,
            entity: Some(entity),
        }
    }

    pub fn existing(entity: T) -> Self {
        Self {
            created: false,
            updated: false,
            entity: Some(entity),
        }
    }

    pub fn declined() -> Self {
        Self {
            created: false,
            updated: false,
            entity: None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.entity.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// Hex encoded Ed25519 public key
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub description: String,
    pub blocksize: u64,
    pub owner: String,
    pub private: bool,
    pub archive: bool,
    /// Instance the volume belongs to, when known
    #[serde(default)]
    pub instance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub name: String,
    pub instance: String,
    pub owner: String,
    pub volume: String,
    #[serde(rename = "type")]
    pub kind: GatewayType,
    pub host: String,
    pub port: u16,
    pub capabilities: BTreeSet<Capability>,
    /// Hex encoded public half of the volume's bootstrap key
    pub public_key: String,
}

#[async_trait]
pub trait ResourceApi: Send + Sync {
    async fn ensure_user(&self, user: &UserRecord) -> Result<Ensured<UserRecord>, ResourceApiError>;

    async fn ensure_volume(
        &self,
        volume: &VolumeRecord,
    ) -> Result<Ensured<VolumeRecord>, ResourceApiError>;

    async fn ensure_gateway(
        &self,
        gateway: &GatewayRecord,
    ) -> Result<Ensured<GatewayRecord>, ResourceApiError>;

    /// Attach a driver package to an existing gateway. `false` means the API declined.
    async fn update_gateway_driver(
        &self,
        gateway: &str,
        driver: &Path,
    ) -> Result<bool, ResourceApiError>;

    /// `true` if something was removed, `false` if it was already absent.
    async fn ensure_user_absent(&self, username: &str) -> Result<bool, ResourceApiError>;

    async fn ensure_volume_absent(&self, name: &str) -> Result<bool, ResourceApiError>;

    async fn ensure_gateway_absent(&self, name: &str) -> Result<bool, ResourceApiError>;

    async fn list_volumes(&self, instance: &str) -> Result<Vec<VolumeRecord>, ResourceApiError>;

    async fn list_gateways(&self, volume: &str) -> Result<Vec<GatewayRecord>, ResourceApiError>;

    /// The gateway's certificate as issued by the API.
    async fn gateway_cert(&self, gateway: &str) -> Result<Vec<u8>, ResourceApiError>;
}

/// JSON-over-HTTP client for the resource API.
#[derive(Debug, Clone)]
pub struct HttpResourceApi {
    remote: Url,
    client: Client,
}

#[derive(Serialize)]
struct ByName<'a> {
    name: &'a str,
}

#[derive(Serialize)]
struct ByInstance<'a> {
    instance: &'a str,
}

#[derive(Serialize)]
struct DriverUpload<'a> {
    name: &'a str,
    driver: String,
}

#[derive(Deserialize)]
struct Removed {
    removed: bool,
}

#[derive(Deserialize)]
struct Updated {
    updated: bool,
}

#[derive(Deserialize)]
struct Cert {
    /// Base64 encoded certificate
    cert: String,
}

impl HttpResourceApi {
    pub fn new(remote: &Url) -> Result<Self, ResourceApiError> {
        let client = Client::builder().build()?;
        Ok(Self {
            remote: remote.clone(),
            client,
        })
    }

    async fn call<B, R>(&self, route: &str, body: &B) -> Result<R, ResourceApiError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = self.remote.join(route)?;
        let response = self.client.post(url).json(body).send().await?;

        if response.status().is_success() {
            Ok(response.json::<R>().await?)
        } else {
            Err(ResourceApiError::HttpStatus(
                response.status(),
                response.text().await?,
            ))
        }
    }
}

#[async_trait]
impl ResourceApi for HttpResourceApi {
    async fn ensure_user(&self, user: &UserRecord) -> Result<Ensured<UserRecord>, ResourceApiError> {
        self.call("v0/user/ensure", user).await
    }

    async fn ensure_volume(
        &self,
        volume: &VolumeRecord,
    ) -> Result<Ensured<VolumeRecord>, ResourceApiError> {
        self.call("v0/volume/ensure", volume).await
    }

    async fn ensure_gateway(
        &self,
        gateway: &GatewayRecord,
    ) -> Result<Ensured<GatewayRecord>, ResourceApiError> {
        self.call("v0/gateway/ensure", gateway).await
    }

    async fn update_gateway_driver(
        &self,
        gateway: &str,
        driver: &Path,
    ) -> Result<bool, ResourceApiError> {
        let package = tokio::fs::read(driver)
            .await
            .map_err(|source| ResourceApiError::Driver {
                path: driver.display().to_string(),
                source,
            })?;
        let upload = DriverUpload {
            name: gateway,
            driver: BASE64.encode(package),
        };
        let updated: Updated = self.call("v0/gateway/driver", &upload).await?;
        Ok(updated.updated)
    }

    async fn ensure_user_absent(&self, username: &str) -> Result<bool, ResourceApiError> {
        let removed: Removed = self
            .call("v0/user/remove", &ByName { name: username })
            .await?;
        Ok(removed.removed)
    }

    async fn ensure_volume_absent(&self, name: &str) -> Result<bool, ResourceApiError> {
        let removed: Removed = self.call("v0/volume/remove", &ByName { name }).await?;
        Ok(removed.removed)
    }

    async fn ensure_gateway_absent(&self, name: &str) -> Result<bool, ResourceApiError> {
        let removed: Removed = self.call("v0/gateway/remove", &ByName { name }).await?;
        Ok(removed.removed)
    }

    async fn list_volumes(&self, instance: &str) -> Result<Vec<VolumeRecord>, ResourceApiError> {
        self.call("v0/volume/list", &ByInstance { instance }).await
    }

    async fn list_gateways(&self, volume: &str) -> Result<Vec<GatewayRecord>, ResourceApiError> {
        self.call("v0/gateway/list", &ByName { name: volume }).await
    }

    async fn gateway_cert(&self, gateway: &str) -> Result<Vec<u8>, ResourceApiError> {
        let cert: Cert = self.call("v0/gateway/cert", &ByName { name: gateway }).await?;
        BASE64
            .decode(cert.cert)
            .map_err(|e| ResourceApiError::Rejected(format!("certificate is not base64: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensured_wire_format() {
        let raw = r#"{"created": false, "updated": true, "entity": null}"#;
        let parsed: Ensured<UserRecord> = serde_json::from_str(raw).unwrap();
        assert!(parsed.updated);
        assert!(!parsed.is_present());
    }

    #[test]
    fn test_gateway_record_uses_type_key() {
        let record = GatewayRecord {
            name: "inst1-AG-vol1-h1".to_string(),
            instance: "inst1".to_string(),
            owner: "alice".to_string(),
            volume: "vol1".to_string(),
            kind: GatewayType::Archive,
            host: "h1".to_string(),
            port: 9000,
            capabilities: GatewayType::Archive.capabilities(),
            public_key: "00".to_string(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "AG");
        assert_eq!(
            value["capabilities"],
            serde_json::json!(["read_metadata", "write_metadata"])
        );
    }

    #[test]
    fn test_routes_join_under_base_path() {
        let api = HttpResourceApi::new(&Url::parse("http://api.internal/rm/").unwrap()).unwrap();
        assert_eq!(
            api.remote.join("v0/user/ensure").unwrap().as_str(),
            "http://api.internal/rm/v0/user/ensure"
        );
    }
}
