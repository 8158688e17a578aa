//! In-memory collaborators for exercising the daemon without a live resource API
//! or host inventory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use common::crypto::PublicKey;

use crate::directory::{Directory, DirectoryError};
use crate::resource_api::{
    Ensured, GatewayRecord, ResourceApi, ResourceApiError, UserRecord, VolumeRecord,
};

/// One call made against [`MemoryResourceApi`], keyed by the entity it addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Call {
    EnsureUser(String),
    EnsureVolume(String),
    EnsureGateway(String),
    UpdateDriver(String),
    RemoveUser(String),
    RemoveVolume(String),
    RemoveGateway(String),
    ListVolumes(String),
    ListGateways(String),
    GatewayCert(String),
}

/// How an injected call misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The call returns an error
    Error,
    /// The call succeeds but returns a falsy result
    Decline,
    /// The call never completes
    Hang,
}

#[derive(Debug, Default)]
struct Store {
    users: BTreeMap<String, UserRecord>,
    volumes: BTreeMap<String, VolumeRecord>,
    gateways: BTreeMap<String, GatewayRecord>,
    drivers: BTreeMap<String, PathBuf>,
    calls: Vec<Call>,
    faults: HashMap<Call, Fault>,
    mutations: usize,
}

/// Resource API that keeps everything in memory and records every call.
///
/// Ensure operations behave like the real API: repeating one reports "already
/// exists" or "already absent" and does not count as a mutation.
#[derive(Debug, Default)]
pub struct MemoryResourceApi {
    store: Mutex<Store>,
}

impl MemoryResourceApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future occurrence of `call` misbehave.
    pub fn inject(&self, call: Call, fault: Fault) {
        self.store.lock().faults.insert(call, fault);
    }

    pub fn clear_faults(&self) {
        self.store.lock().faults.clear();
    }

    pub fn insert_volume(&self, volume: VolumeRecord) {
        self.store.lock().volumes.insert(volume.name.clone(), volume);
    }

    pub fn insert_gateway(&self, gateway: GatewayRecord) {
        self.store
            .lock()
            .gateways
            .insert(gateway.name.clone(), gateway);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.store.lock().calls.clone()
    }

    pub fn called(&self, call: &Call) -> bool {
        self.store.lock().calls.contains(call)
    }

    /// Calls that created, updated or removed something.
    pub fn mutations(&self) -> usize {
        self.store.lock().mutations
    }

    pub fn user(&self, username: &str) -> Option<UserRecord> {
        self.store.lock().users.get(username).cloned()
    }

    pub fn volume(&self, name: &str) -> Option<VolumeRecord> {
        self.store.lock().volumes.get(name).cloned()
    }

    pub fn gateway(&self, name: &str) -> Option<GatewayRecord> {
        self.store.lock().gateways.get(name).cloned()
    }

    pub fn gateway_names(&self) -> Vec<String> {
        self.store.lock().gateways.keys().cloned().collect()
    }

    pub fn driver(&self, gateway: &str) -> Option<PathBuf> {
        self.store.lock().drivers.get(gateway).cloned()
    }

    /// Record `call` and return its injected fault, if any.
    async fn record(&self, call: Call) -> Result<Option<Fault>, ResourceApiError> {
        let fault = {
            let mut store = self.store.lock();
            let fault = store.faults.get(&call).copied();
            store.calls.push(call.clone());
            fault
        };
        match fault {
            Some(Fault::Error) => Err(ResourceApiError::Rejected(format!(
                "injected failure for {:?}",
                call
            ))),
            Some(Fault::Hang) => futures::future::pending().await,
            other => Ok(other),
        }
    }

    fn ensure<T: Clone + PartialEq>(
        map: &mut BTreeMap<String, T>,
        mutations: &mut usize,
        key: &str,
        record: &T,
    ) -> Ensured<T> {
        match map.get(key) {
            Some(existing) if existing == record => Ensured::existing(record.clone()),
            Some(_) => {
                map.insert(key.to_string(), record.clone());
                *mutations += 1;
                Ensured {
                    created: false,
                    updated: true,
                    entity: Some(record.clone()),
                }
            }
            None => {
                map.insert(key.to_string(), record.clone());
                *mutations += 1;
                Ensured::created(record.clone())
            }
        }
    }

    fn remove<T>(map: &mut BTreeMap<String, T>, mutations: &mut usize, key: &str) -> bool {
        let removed = map.remove(key).is_some();
        *mutations += removed as usize;
        removed
    }
}

#[async_trait]
impl ResourceApi for MemoryResourceApi {
    async fn ensure_user(&self, user: &UserRecord) -> Result<Ensured<UserRecord>, ResourceApiError> {
        if self.record(Call::EnsureUser(user.username.clone())).await? == Some(Fault::Decline) {
            return Ok(Ensured::declined());
        }
        let mut store = self.store.lock();
        let Store {
            users, mutations, ..
        } = &mut *store;
        Ok(Self::ensure(users, mutations, &user.username, user))
    }

    async fn ensure_volume(
        &self,
        volume: &VolumeRecord,
    ) -> Result<Ensured<VolumeRecord>, ResourceApiError> {
        if self.record(Call::EnsureVolume(volume.name.clone())).await? == Some(Fault::Decline) {
            return Ok(Ensured::declined());
        }
        let mut store = self.store.lock();
        let Store {
            volumes, mutations, ..
        } = &mut *store;
        Ok(Self::ensure(volumes, mutations, &volume.name, volume))
    }

    async fn ensure_gateway(
        &self,
        gateway: &GatewayRecord,
    ) -> Result<Ensured<GatewayRecord>, ResourceApiError> {
        if self.record(Call::EnsureGateway(gateway.name.clone())).await? == Some(Fault::Decline) {
            return Ok(Ensured::declined());
        }
        let mut store = self.store.lock();
        let Store {
            gateways,
            mutations,
            ..
        } = &mut *store;
        Ok(Self::ensure(gateways, mutations, &gateway.name, gateway))
    }

    async fn update_gateway_driver(
        &self,
        gateway: &str,
        driver: &Path,
    ) -> Result<bool, ResourceApiError> {
        if self.record(Call::UpdateDriver(gateway.to_string())).await? == Some(Fault::Decline) {
            return Ok(false);
        }
        let mut store = self.store.lock();
        if !store.gateways.contains_key(gateway) {
            return Ok(false);
        }
        if store.drivers.get(gateway).map(PathBuf::as_path) != Some(driver) {
            store.drivers.insert(gateway.to_string(), driver.to_path_buf());
            store.mutations += 1;
        }
        Ok(true)
    }

    async fn ensure_user_absent(&self, username: &str) -> Result<bool, ResourceApiError> {
        self.record(Call::RemoveUser(username.to_string())).await?;
        let mut store = self.store.lock();
        let Store {
            users, mutations, ..
        } = &mut *store;
        Ok(Self::remove(users, mutations, username))
    }

    async fn ensure_volume_absent(&self, name: &str) -> Result<bool, ResourceApiError> {
        self.record(Call::RemoveVolume(name.to_string())).await?;
        let mut store = self.store.lock();
        let Store {
            volumes, mutations, ..
        } = &mut *store;
        Ok(Self::remove(volumes, mutations, name))
    }

    async fn ensure_gateway_absent(&self, name: &str) -> Result<bool, ResourceApiError> {
        self.record(Call::RemoveGateway(name.to_string())).await?;
        let mut store = self.store.lock();
        store.drivers.remove(name);
        let Store {
            gateways,
            mutations,
            ..
        } = &mut *store;
        Ok(Self::remove(gateways, mutations, name))
    }

    async fn list_volumes(&self, instance: &str) -> Result<Vec<VolumeRecord>, ResourceApiError> {
        self.record(Call::ListVolumes(instance.to_string())).await?;
        Ok(self
            .store
            .lock()
            .volumes
            .values()
            .filter(|volume| volume.instance.as_deref() == Some(instance))
            .cloned()
            .collect())
    }

    async fn list_gateways(&self, volume: &str) -> Result<Vec<GatewayRecord>, ResourceApiError> {
        self.record(Call::ListGateways(volume.to_string())).await?;
        Ok(self
            .store
            .lock()
            .gateways
            .values()
            .filter(|gateway| gateway.volume == volume)
            .cloned()
            .collect())
    }

    async fn gateway_cert(&self, gateway: &str) -> Result<Vec<u8>, ResourceApiError> {
        self.record(Call::GatewayCert(gateway.to_string())).await?;
        if self.store.lock().gateways.contains_key(gateway) {
            Ok(format!("cert:{}", gateway).into_bytes())
        } else {
            Err(ResourceApiError::Rejected(format!(
                "no such gateway '{}'",
                gateway
            )))
        }
    }
}

/// Fixed host inventory that counts how often it is consulted.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    hosts: HashMap<String, Option<PublicKey>>,
    slow: HashSet<String>,
    known_checks: AtomicUsize,
    key_fetches: AtomicUsize,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, hostname: &str, key: PublicKey) -> Self {
        self.hosts.insert(hostname.to_string(), Some(key));
        self
    }

    /// A known host whose key cannot be fetched.
    pub fn with_keyless_host(mut self, hostname: &str) -> Self {
        self.hosts.insert(hostname.to_string(), None);
        self
    }

    /// Key fetches for `hostname` never complete.
    pub fn with_slow_host(mut self, hostname: &str, key: PublicKey) -> Self {
        self.slow.insert(hostname.to_string());
        self.with_host(hostname, key)
    }

    pub fn known_checks(&self) -> usize {
        self.known_checks.load(Ordering::SeqCst)
    }

    pub fn key_fetches(&self) -> usize {
        self.key_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn is_known_host(&self, hostname: &str) -> Result<bool, DirectoryError> {
        self.known_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.hosts.contains_key(hostname))
    }

    async fn host_public_key(&self, hostname: &str) -> Result<PublicKey, DirectoryError> {
        self.key_fetches.fetch_add(1, Ordering::SeqCst);
        if self.slow.contains(hostname) {
            futures::future::pending::<()>().await;
        }
        self.hosts
            .get(hostname)
            .copied()
            .flatten()
            .ok_or_else(|| DirectoryError::NoKey(hostname.to_string()))
    }
}
