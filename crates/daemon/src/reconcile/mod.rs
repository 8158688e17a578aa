//! Applies a [`ProvisionPlan`] against the resource API.
//!
//! Phases run in a fixed order: create users, create volumes, create gateways,
//! then delete gateways, volumes and users. Each create phase returns the set of
//! entities it failed, and later create phases skip anything that depends on a
//! failed entity. Deletes ignore create failures entirely.
//!
//! Nothing here remembers earlier applies. Re-running a plan re-issues every call
//! and relies on the API's ensure operations being idempotent.

pub mod queue;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use common::crypto::SecretKey;
use common::plan::{GatewayRef, GatewaySpec, ProvisionPlan, QualifiedVolume, UserSpec, VolumeSpec};

use crate::drivers::{DriverError, DriverResolver};
use crate::key_vault::KeyVault;
use crate::resource_api::{GatewayRecord, ResourceApi, ResourceApiError, UserRecord, VolumeRecord};

pub use queue::{QueueError, ReconcileQueue, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    CreateUsers,
    CreateVolumes,
    CreateGateways,
    DeleteGateways,
    DeleteVolumes,
    DeleteUsers,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::CreateUsers => "create users",
            Phase::CreateVolumes => "create volumes",
            Phase::CreateGateways => "create gateways",
            Phase::DeleteGateways => "delete gateways",
            Phase::DeleteVolumes => "delete volumes",
            Phase::DeleteUsers => "delete users",
        };
        f.write_str(name)
    }
}

/// Entities that failed during one apply, per phase.
///
/// Users are keyed by username, volumes by their instance-less name and gateways by
/// their derived name (or `volume/TYPE/host` when no name could be derived).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub failed: BTreeMap<Phase, BTreeSet<String>>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.values().all(BTreeSet::is_empty)
    }

    pub fn failed_in(&self, phase: Phase) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        self.failed.get(&phase).unwrap_or(&EMPTY)
    }

    fn record(&mut self, phase: Phase, failed: BTreeSet<String>) {
        if !failed.is_empty() {
            self.failed.insert(phase, failed);
        }
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            return write!(f, "all entities applied");
        }
        let mut first = true;
        for (phase, names) in self.failed.iter().filter(|(_, names)| !names.is_empty()) {
            if !first {
                writeln!(f)?;
            }
            first = false;
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            write!(f, "{} failed: {}", phase, names.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum EntityError {
    #[error(transparent)]
    Api(#[from] ResourceApiError),
    #[error("resource API declined the request")]
    Declined,
    #[error(transparent)]
    Plan(#[from] common::plan::PlanError),
    #[error(transparent)]
    Keys(#[from] crate::key_vault::KeyVaultError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

#[derive(Clone)]
pub struct Reconciler {
    api: Arc<dyn ResourceApi>,
    user_keys: KeyVault,
    volume_keys: KeyVault,
    drivers: Option<DriverResolver>,
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        api: Arc<dyn ResourceApi>,
        user_keys: KeyVault,
        volume_keys: KeyVault,
        call_timeout: Duration,
    ) -> Self {
        Self {
            api,
            user_keys,
            volume_keys,
            drivers: None,
            call_timeout,
        }
    }

    pub fn with_drivers(mut self, drivers: DriverResolver) -> Self {
        self.drivers = Some(drivers);
        self
    }

    /// Apply every phase of `plan` and report what failed. Safe to repeat.
    pub async fn apply(&self, plan: &ProvisionPlan) -> ApplyReport {
        let mut report = ApplyReport::default();

        let failed_users = self.create_users(&plan.users.create).await;
        let failed_volumes = self
            .create_volumes(&plan.volumes.create, &failed_users)
            .await;
        let failed_gateways = self
            .create_gateways(&plan.gateways.create, &failed_users, &failed_volumes)
            .await;
        report.record(Phase::CreateUsers, failed_users);
        report.record(Phase::CreateVolumes, failed_volumes);
        report.record(Phase::CreateGateways, failed_gateways);

        report.record(
            Phase::DeleteGateways,
            self.delete_gateways(&plan.gateways.delete).await,
        );
        report.record(
            Phase::DeleteVolumes,
            self.delete_volumes(&plan.volumes.delete).await,
        );
        report.record(
            Phase::DeleteUsers,
            self.delete_users(&plan.users.delete).await,
        );

        if report.is_success() {
            tracing::info!("provision plan applied");
        } else {
            tracing::warn!(report = %report, "provision plan partially applied");
        }
        report
    }

    async fn call<T>(
        &self,
        operation: impl Future<Output = Result<T, ResourceApiError>>,
    ) -> Result<T, ResourceApiError> {
        timeout(self.call_timeout, operation)
            .await
            .map_err(|_| ResourceApiError::Timeout)?
    }

    async fn create_users(&self, users: &[UserSpec]) -> BTreeSet<String> {
        let mut failed = BTreeSet::new();
        for user in users {
            if let Err(e) = self.create_user(user).await {
                tracing::warn!(user = %user.username, error = %e, "user creation failed");
                failed.insert(user.username.clone());
            }
        }
        failed
    }

    async fn create_user(&self, user: &UserSpec) -> Result<(), EntityError> {
        // a stored key keeps the user's identity stable across retries
        let (key, generated) = self.user_keys.get_or_create(&user.username).await?;
        let record = UserRecord {
            username: user.username.clone(),
            public_key: key.public().to_hex(),
        };
        let ensured = self.call(self.api.ensure_user(&record)).await?;
        if !ensured.is_present() {
            return Err(EntityError::Declined);
        }
        tracing::info!(
            user = %user.username,
            created = ensured.created,
            new_key = generated,
            "user ensured"
        );
        Ok(())
    }

    async fn create_volumes(
        &self,
        volumes: &[VolumeSpec],
        failed_users: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let mut failed = BTreeSet::new();
        for volume in volumes {
            let name = volume.volume_name();
            if failed_users.contains(&volume.owner) {
                tracing::warn!(volume = name, owner = %volume.owner, "owner failed, skipping volume");
                failed.insert(name.to_string());
                continue;
            }
            if let Err(e) = self.create_volume(volume).await {
                tracing::warn!(volume = name, error = %e, "volume creation failed");
                failed.insert(name.to_string());
            }
        }
        failed
    }

    async fn create_volume(&self, volume: &VolumeSpec) -> Result<(), EntityError> {
        let qualified = QualifiedVolume::parse(&volume.name);
        let record = VolumeRecord {
            name: qualified.name.to_string(),
            description: volume.description.clone(),
            blocksize: volume.blocksize,
            owner: volume.owner.clone(),
            private: volume.private.parse("private")?,
            archive: volume.archive.parse("archive")?,
            instance: qualified.instance.map(str::to_string),
        };
        let ensured = self.call(self.api.ensure_volume(&record)).await?;
        if !ensured.is_present() {
            return Err(EntityError::Declined);
        }
        tracing::info!(volume = %record.name, created = ensured.created, "volume ensured");
        Ok(())
    }

    async fn create_gateways(
        &self,
        gateways: &[GatewaySpec],
        failed_users: &BTreeSet<String>,
        failed_volumes: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let mut failed = BTreeSet::new();

        // first pass: one bootstrap key per volume, only for gateways that can proceed
        let mut bootstrap: BTreeMap<&str, Option<SecretKey>> = BTreeMap::new();
        let mut ready = Vec::new();
        for gateway in gateways {
            let volume = gateway.volume_name();
            if failed_volumes.contains(volume) || failed_users.contains(&gateway.owner) {
                tracing::warn!(
                    gateway = %gateway_label(gateway),
                    volume,
                    owner = %gateway.owner,
                    "dependency failed, skipping gateway"
                );
                failed.insert(gateway_label(gateway));
                continue;
            }

            if !bootstrap.contains_key(volume) {
                let key = match self.volume_keys.get_or_create(volume).await {
                    Ok((key, generated)) => {
                        tracing::debug!(volume, generated, "bootstrap key resolved");
                        Some(key)
                    }
                    Err(e) => {
                        tracing::warn!(volume, error = %e, "bootstrap key unavailable");
                        None
                    }
                };
                bootstrap.insert(volume, key);
            }

            match bootstrap.get(volume).and_then(Option::as_ref) {
                Some(key) => ready.push((gateway, key.clone())),
                None => {
                    failed.insert(gateway_label(gateway));
                }
            }
        }

        // second pass: provision
        for (gateway, key) in ready {
            if let Err(e) = self.create_gateway(gateway, &key).await {
                tracing::warn!(gateway = %gateway_label(gateway), error = %e, "gateway creation failed");
                failed.insert(gateway_label(gateway));
            }
        }

        failed
    }

    async fn create_gateway(&self, gateway: &GatewaySpec, key: &SecretKey) -> Result<(), EntityError> {
        let name = gateway.name()?;
        let driver = self.driver_path(gateway).await?;

        let qualified = QualifiedVolume::parse(&gateway.volume);
        let record = GatewayRecord {
            name: name.clone(),
            instance: qualified.instance.unwrap_or_default().to_string(),
            owner: gateway.owner.clone(),
            volume: qualified.name.to_string(),
            kind: gateway.kind,
            host: gateway.host.clone(),
            port: gateway.port,
            capabilities: gateway.kind.capabilities(),
            public_key: key.public().to_hex(),
        };
        let ensured = self.call(self.api.ensure_gateway(&record)).await?;
        if !ensured.is_present() {
            return Err(EntityError::Declined);
        }

        if let Some(driver) = driver {
            if !self
                .call(self.api.update_gateway_driver(&name, &driver))
                .await?
            {
                return Err(EntityError::Declined);
            }
        }

        tracing::info!(gateway = %name, created = ensured.created, "gateway ensured");
        Ok(())
    }

    async fn driver_path(&self, gateway: &GatewaySpec) -> Result<Option<PathBuf>, DriverError> {
        let Some(reference) = gateway.driver.as_deref() else {
            return Ok(None);
        };
        match &self.drivers {
            Some(drivers) => drivers.resolve(reference).await.map(Some),
            None => Err(DriverError::Unconfigured(reference.to_string())),
        }
    }

    async fn delete_gateways(&self, gateways: &[GatewayRef]) -> BTreeSet<String> {
        let mut failed = BTreeSet::new();
        for gateway in gateways {
            let name = match gateway.name() {
                Ok(name) => name,
                Err(e) => {
                    tracing::warn!(gateway = ?gateway, error = %e, "cannot name gateway to delete");
                    failed.insert(gateway_ref_label(gateway));
                    continue;
                }
            };
            match self.call(self.api.ensure_gateway_absent(&name)).await {
                Ok(removed) => tracing::info!(gateway = %name, removed, "gateway absent"),
                Err(e) => {
                    tracing::warn!(gateway = %name, error = %e, "gateway deletion failed");
                    failed.insert(name);
                }
            }
        }
        failed
    }

    async fn delete_volumes(&self, volumes: &[String]) -> BTreeSet<String> {
        let mut failed = BTreeSet::new();
        for volume in volumes {
            let name = QualifiedVolume::parse(volume).name;
            match self.call(self.api.ensure_volume_absent(name)).await {
                Ok(removed) => tracing::info!(volume = name, removed, "volume absent"),
                Err(e) => {
                    tracing::warn!(volume = name, error = %e, "volume deletion failed");
                    failed.insert(name.to_string());
                }
            }
        }
        failed
    }

    async fn delete_users(&self, users: &[String]) -> BTreeSet<String> {
        let mut failed = BTreeSet::new();
        for user in users {
            match self.call(self.api.ensure_user_absent(user)).await {
                Ok(removed) => tracing::info!(user = %user, removed, "user absent"),
                Err(e) => {
                    tracing::warn!(user = %user, error = %e, "user deletion failed");
                    failed.insert(user.clone());
                }
            }
        }
        failed
    }
}

fn gateway_label(gateway: &GatewaySpec) -> String {
    gateway
        .name()
        .unwrap_or_else(|_| format!("{}/{}/{}", gateway.volume, gateway.kind, gateway.host))
}

fn gateway_ref_label(gateway: &GatewayRef) -> String {
    match gateway {
        GatewayRef::Name(name) => name.clone(),
        GatewayRef::Spec { volume, kind, host } => format!("{}/{}/{}", volume, kind, host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{Call, Fault, MemoryResourceApi};
    use common::plan::GatewayType;
    use tempfile::TempDir;

    fn reconciler(temp: &TempDir, api: Arc<MemoryResourceApi>) -> Reconciler {
        Reconciler::new(
            api,
            KeyVault::new(temp.path().join("users")),
            KeyVault::new(temp.path().join("volumes")),
            Duration::from_secs(5),
        )
    }

    fn plan(raw: &str) -> ProvisionPlan {
        ProvisionPlan::from_json(raw).unwrap()
    }

    #[tokio::test]
    async fn test_bad_flag_fails_only_its_volume() {
        let temp = TempDir::new().unwrap();
        let api = Arc::new(MemoryResourceApi::new());
        let report = reconciler(&temp, api.clone())
            .apply(&plan(
                r#"{"volumes": {"create": [
                    {"name": "inst1.v1", "blocksize": 1, "owner": "a", "archive": "sometimes"},
                    {"name": "inst1.v2", "blocksize": 1, "owner": "a", "archive": "FALSE"}
                ]}}"#,
            ))
            .await;

        assert_eq!(
            report.failed_in(Phase::CreateVolumes),
            &BTreeSet::from(["v1".to_string()])
        );
        assert!(!api.called(&Call::EnsureVolume("v1".to_string())));
        let v2 = api.volume("v2").unwrap();
        assert_eq!(v2.instance.as_deref(), Some("inst1"));
        assert!(!v2.archive);
    }

    #[tokio::test]
    async fn test_user_keys_survive_retries() {
        let temp = TempDir::new().unwrap();
        let api = Arc::new(MemoryResourceApi::new());
        api.inject(Call::EnsureUser("alice".to_string()), Fault::Decline);
        let engine = reconciler(&temp, api.clone());
        let users = plan(r#"{"users": {"create": [{"username": "alice"}]}}"#);

        assert!(!engine.apply(&users).await.is_success());
        let stored = engine.user_keys.get("alice").await.unwrap().unwrap();

        api.clear_faults();
        assert!(engine.apply(&users).await.is_success());
        assert_eq!(
            api.user("alice").unwrap().public_key,
            stored.public().to_hex()
        );
    }

    #[tokio::test]
    async fn test_driver_update_failure_fails_gateway() {
        let temp = TempDir::new().unwrap();
        let drivers_dir = temp.path().join("drivers");
        std::fs::create_dir_all(&drivers_dir).unwrap();
        std::fs::write(drivers_dir.join("s3.tar"), b"pkg").unwrap();

        let api = Arc::new(MemoryResourceApi::new());
        let engine = reconciler(&temp, api.clone()).with_drivers(DriverResolver::new(&drivers_dir));
        let gateways = plan(
            r#"{"gateways": {"create": [
                {"owner": "a", "volume": "inst1.v1", "type": "RG", "host": "h1", "port": 1, "driver": "s3.tar"},
                {"owner": "a", "volume": "inst1.v1", "type": "AG", "host": "h1", "port": 2, "driver": "../s3.tar"}
            ]}}"#,
        );

        api.inject(Call::UpdateDriver("inst1-RG-v1-h1".to_string()), Fault::Error);
        let report = engine.apply(&gateways).await;
        assert_eq!(
            report.failed_in(Phase::CreateGateways),
            &BTreeSet::from(["inst1-AG-v1-h1".to_string(), "inst1-RG-v1-h1".to_string()])
        );
        // creation itself went through; only the driver update failed
        assert!(api.gateway("inst1-RG-v1-h1").is_some());
        assert!(!api.called(&Call::EnsureGateway("inst1-AG-v1-h1".to_string())));

        api.clear_faults();
        let report = engine.apply(&gateways).await;
        assert_eq!(report.failed_in(Phase::CreateGateways).len(), 1);
        assert_eq!(
            api.driver("inst1-RG-v1-h1"),
            Some(drivers_dir.join("s3.tar"))
        );
        assert_eq!(
            api.gateway("inst1-RG-v1-h1").unwrap().kind,
            GatewayType::Replica
        );
    }

    #[tokio::test]
    async fn test_unqualified_gateway_fails_without_blocking_others() {
        let temp = TempDir::new().unwrap();
        let api = Arc::new(MemoryResourceApi::new());
        let report = reconciler(&temp, api.clone())
            .apply(&plan(
                r#"{"gateways": {"create": [
                    {"owner": "a", "volume": "v1", "type": "UG", "host": "h1", "port": 1},
                    {"owner": "a", "volume": "inst1.v1", "type": "UG", "host": "h2", "port": 1}
                ]}}"#,
            ))
            .await;

        assert_eq!(
            report.failed_in(Phase::CreateGateways),
            &BTreeSet::from(["v1/UG/h1".to_string()])
        );
        assert_eq!(api.gateway_names(), vec!["inst1-UG-v1-h2".to_string()]);
        assert_eq!(report.to_string(), "create gateways failed: v1/UG/h1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_is_a_failure() {
        let temp = TempDir::new().unwrap();
        let api = Arc::new(MemoryResourceApi::new());
        api.inject(Call::RemoveUser("bob".to_string()), Fault::Hang);

        let report = reconciler(&temp, api.clone())
            .apply(&plan(r#"{"users": {"delete": ["bob", "carol"]}}"#))
            .await;

        assert_eq!(
            report.failed_in(Phase::DeleteUsers),
            &BTreeSet::from(["bob".to_string()])
        );
        assert!(api.called(&Call::RemoveUser("carol".to_string())));
    }
}
