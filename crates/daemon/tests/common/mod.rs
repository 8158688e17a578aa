//! Shared test utilities for daemon integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tempfile::TempDir;

use common::crypto::{Ed25519Signatures, SecretKey};
use common::envelope::Envelope;
use common::plan::ProvisionPlan;
use fleetmount_daemon::key_vault::KeyVault;
use fleetmount_daemon::reconcile::Reconciler;
use fleetmount_daemon::service_state::Collaborators;
use fleetmount_daemon::testkit::{MemoryResourceApi, StaticDirectory};
use fleetmount_daemon::{AppState, ServiceConfig, ServiceState};

pub const SCENARIO: &str = r#"{
    "users": {"create": [{"username": "alice"}], "delete": []},
    "volumes": {"create": [{"name": "vol1", "description": "d", "blocksize": 4096,
                            "owner": "alice", "private": "true", "archive": "false"}],
                "delete": []},
    "gateways": {"create": [{"owner": "alice", "volume": "inst1.vol1", "type": "UG",
                             "host": "h1", "port": 8080}],
                 "delete": []}
}"#;

pub fn plan(raw: &str) -> ProvisionPlan {
    ProvisionPlan::from_json(raw).unwrap()
}

/// A reconciler over an in-memory resource API with vaults in a temp dir.
pub struct Harness {
    pub temp: TempDir,
    pub api: Arc<MemoryResourceApi>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let api = Arc::new(MemoryResourceApi::new());
        let reconciler = Reconciler::new(
            api.clone(),
            KeyVault::new(temp.path().join("users")),
            KeyVault::new(temp.path().join("volumes")),
            Duration::from_secs(5),
        );
        Self {
            temp,
            api,
            reconciler,
        }
    }

    pub fn volume_keys(&self) -> KeyVault {
        KeyVault::new(self.temp.path().join("volumes"))
    }

    /// Bootstrap key files currently on disk.
    pub fn bootstrap_key_files(&self) -> Vec<String> {
        match std::fs::read_dir(self.temp.path().join("volumes")) {
            Ok(entries) => entries
                .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// The wire body a host sends, with independently chosen outer and inner hostnames.
pub fn signed_request(key: &SecretKey, outer: &str, inner: &str, instance: &str) -> Vec<u8> {
    let payload = serde_json::to_vec(&serde_json::json!({
        "hostname": inner,
        "instance": instance,
    }))
    .unwrap();
    Envelope::seal(
        &Ed25519Signatures,
        key,
        &payload,
        [("hostname".to_string(), Value::from(outer))],
    )
    .unwrap()
    .to_json()
    .unwrap()
    .into_bytes()
}

/// Flip one bit of the envelope's signature, leaving everything else intact.
pub fn flip_signature_bit(body: &[u8], bit: usize) -> Vec<u8> {
    let mut envelope: Value = serde_json::from_slice(body).unwrap();
    let mut sig = BASE64.decode(envelope["sig"].as_str().unwrap()).unwrap();
    sig[bit / 8] ^= 1 << (bit % 8);
    envelope["sig"] = Value::from(BASE64.encode(sig));
    serde_json::to_vec(&envelope).unwrap()
}

/// Full service state over in-memory collaborators, backed by a fresh state dir.
pub fn service_state(
    directory: StaticDirectory,
    api: Arc<MemoryResourceApi>,
    max_payload_bytes: usize,
) -> (ServiceState, AppState, TempDir) {
    let temp = TempDir::new().unwrap();
    let state = AppState::init(Some(temp.path().to_path_buf()), None).unwrap();
    let mut config = ServiceConfig::from_app_state(&state, state.load_key().unwrap()).unwrap();
    config.max_payload_bytes = max_payload_bytes;
    config.call_timeout = Duration::from_secs(5);

    let (service, _receiver) = ServiceState::new(
        &config,
        Collaborators {
            api,
            directory: Arc::new(directory),
            signatures: Arc::new(Ed25519Signatures),
        },
    );
    (service, state, temp)
}
