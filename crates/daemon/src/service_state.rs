use std::sync::Arc;

use common::crypto::{Ed25519Signatures, SignatureService};
use common::prelude::SecretKey;

use crate::auth::Authenticator;
use crate::directory::{Directory, FileDirectory, HelperDirectory};
use crate::drivers::DriverResolver;
use crate::helpers::HelperEnv;
use crate::key_vault::KeyVault;
use crate::plan_resolver::PlanResolver;
use crate::reconcile::queue::JobReceiver;
use crate::reconcile::{ReconcileQueue, Reconciler};
use crate::resource_api::{HttpResourceApi, ResourceApi, ResourceApiError};
use crate::service_config::Config;
use crate::state::DirectoryConfig;

/// The external services the daemon talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn ResourceApi>,
    pub directory: Arc<dyn Directory>,
    pub signatures: Arc<dyn SignatureService>,
}

#[derive(Clone)]
pub struct State {
    inner: Arc<Inner>,
}

struct Inner {
    server_key: SecretKey,
    signatures: Arc<dyn SignatureService>,
    authenticator: Authenticator,
    resolver: PlanResolver,
    reconciler: Reconciler,
    queue: ReconcileQueue,
    max_payload_bytes: usize,
}

impl State {
    /// Build state against the resource API and directory named in `config`.
    pub fn from_config(config: &Config) -> Result<(Self, JobReceiver), StateSetupError> {
        let api: Arc<dyn ResourceApi> = Arc::new(HttpResourceApi::new(&config.resource_api_url)?);

        let directory: Arc<dyn Directory> = match &config.directory {
            DirectoryConfig::File {
                hosts_file,
                keys_dir,
            } => {
                let (Some(hosts_file), Some(keys_dir)) = (hosts_file, keys_dir) else {
                    return Err(StateSetupError::UnresolvedDirectory);
                };
                Arc::new(FileDirectory::new(hosts_file, keys_dir))
            }
            DirectoryConfig::Helper { program } => Arc::new(HelperDirectory::new(
                program,
                HelperEnv::new(&config.config_path, config.debug),
            )),
        };

        Ok(Self::new(
            config,
            Collaborators {
                api,
                directory,
                signatures: Arc::new(Ed25519Signatures),
            },
        ))
    }

    /// Build state around the given collaborators. The receiver feeds the
    /// reconcile worker.
    pub fn new(config: &Config, collaborators: Collaborators) -> (Self, JobReceiver) {
        let Collaborators {
            api,
            directory,
            signatures,
        } = collaborators;

        let volume_keys = KeyVault::new(&config.volume_keys_path);
        let user_keys = KeyVault::new(&config.user_keys_path);

        let authenticator = Authenticator::new(directory, signatures.clone(), config.call_timeout);
        let resolver = PlanResolver::new(api.clone(), volume_keys.clone(), config.call_timeout);
        let mut reconciler = Reconciler::new(api, user_keys, volume_keys, config.call_timeout);
        if let Some(driver_dir) = &config.driver_dir {
            reconciler = reconciler.with_drivers(DriverResolver::new(driver_dir));
        }
        let (queue, receiver) = ReconcileQueue::new(config.reconcile_queue_size);

        let state = Self {
            inner: Arc::new(Inner {
                server_key: config.server_key.clone(),
                signatures,
                authenticator,
                resolver,
                reconciler,
                queue,
                max_payload_bytes: config.max_payload_bytes,
            }),
        };
        (state, receiver)
    }

    pub fn server_key(&self) -> &SecretKey {
        &self.inner.server_key
    }

    pub fn signatures(&self) -> &dyn SignatureService {
        self.inner.signatures.as_ref()
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.inner.authenticator
    }

    pub fn resolver(&self) -> &PlanResolver {
        &self.inner.resolver
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }

    pub fn queue(&self) -> &ReconcileQueue {
        &self.inner.queue
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.inner.max_payload_bytes
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateSetupError {
    #[error("resource API client: {0}")]
    ResourceApi(#[from] ResourceApiError),
    #[error("file directory paths were not resolved")]
    UnresolvedDirectory,
}
