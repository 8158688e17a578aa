//! Per-host provisioning documents.
//!
//! ```json
//! { "vol1": { "__pkey__": "<sealed bootstrap key, hex>",
//!             "inst1-UG-vol1-h1": "<gateway cert, base64>" } }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::time::timeout;

use common::crypto::{PublicKey, SealedKey};

use crate::key_vault::KeyVault;
use crate::resource_api::{ResourceApi, VolumeRecord};

/// Entry carrying the sealed bootstrap key inside each volume's map.
pub const BOOTSTRAP_KEY_FIELD: &str = "__pkey__";

pub type VolumePlan = BTreeMap<String, String>;
pub type HostPlan = BTreeMap<String, VolumePlan>;

#[derive(Clone)]
pub struct PlanResolver {
    api: Arc<dyn ResourceApi>,
    volume_keys: KeyVault,
    call_timeout: Duration,
}

impl PlanResolver {
    pub fn new(api: Arc<dyn ResourceApi>, volume_keys: KeyVault, call_timeout: Duration) -> Self {
        Self {
            api,
            volume_keys,
            call_timeout,
        }
    }

    /// Everything `hostname` should mount for `instance`.
    ///
    /// Never fails: a host whose volumes cannot be listed gets an empty plan, and a
    /// volume or gateway that cannot be described is left out.
    pub async fn resolve(&self, instance: &str, host_key: &PublicKey, hostname: &str) -> HostPlan {
        let volumes = match timeout(self.call_timeout, self.api.list_volumes(instance)).await {
            Ok(Ok(volumes)) => volumes,
            Ok(Err(e)) => {
                tracing::warn!(instance, hostname, error = %e, "volume listing failed, serving empty plan");
                return HostPlan::new();
            }
            Err(_) => {
                tracing::warn!(instance, hostname, "volume listing timed out, serving empty plan");
                return HostPlan::new();
            }
        };

        let mut plan = HostPlan::new();
        for volume in volumes {
            if let Some(entry) = self.volume_plan(instance, &volume, host_key).await {
                plan.insert(volume.name, entry);
            }
        }

        tracing::info!(
            instance,
            hostname,
            volumes = plan.len(),
            "resolved host plan"
        );
        plan
    }

    async fn volume_plan(
        &self,
        instance: &str,
        volume: &VolumeRecord,
        host_key: &PublicKey,
    ) -> Option<VolumePlan> {
        let name = volume.name.as_str();
        let bootstrap = match self.volume_keys.get(name).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                tracing::debug!(volume = name, "no bootstrap key yet, skipping volume");
                return None;
            }
            Err(e) => {
                tracing::warn!(volume = name, error = %e, "bootstrap key unreadable, skipping volume");
                return None;
            }
        };

        let sealed = match SealedKey::seal(&bootstrap, host_key) {
            Ok(sealed) => sealed,
            Err(e) => {
                tracing::warn!(volume = name, error = %e, "failed to seal bootstrap key");
                return None;
            }
        };

        let gateways = match timeout(self.call_timeout, self.api.list_gateways(name)).await {
            Ok(Ok(gateways)) => gateways,
            Ok(Err(e)) => {
                tracing::warn!(volume = name, error = %e, "gateway listing failed, skipping volume");
                return None;
            }
            Err(_) => {
                tracing::warn!(volume = name, "gateway listing timed out, skipping volume");
                return None;
            }
        };

        let mut entry = VolumePlan::new();
        entry.insert(BOOTSTRAP_KEY_FIELD.to_string(), sealed.to_hex());

        for gateway in gateways.iter().filter(|g| g.instance == instance) {
            match timeout(self.call_timeout, self.api.gateway_cert(&gateway.name)).await {
                Ok(Ok(cert)) => {
                    entry.insert(gateway.name.clone(), BASE64.encode(cert));
                }
                Ok(Err(e)) => {
                    tracing::warn!(gateway = %gateway.name, error = %e, "certificate fetch failed")
                }
                Err(_) => tracing::warn!(gateway = %gateway.name, "certificate fetch timed out"),
            }
        }

        Some(entry)
    }
}
