use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing_subscriber::EnvFilter;

use common::plan::{PlanError, ProvisionPlan};
use fleetmount_daemon::drivers::DriverResolver;
use fleetmount_daemon::key_vault::KeyVault;
use fleetmount_daemon::reconcile::{ApplyReport, Reconciler};
use fleetmount_daemon::resource_api::{HttpResourceApi, ResourceApiError};
use fleetmount_daemon::service_config::ConfigError;
use fleetmount_daemon::state::{AppState, StateError};
use fleetmount_daemon::ServiceConfig;

/// Apply a provision plan once, in the foreground.
#[derive(Args, Debug, Clone)]
pub struct Provision {
    /// JSON provision plan
    pub plan_file: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("resource API client: {0}")]
    Client(#[from] ResourceApiError),

    #[error("plan {path}: {source}")]
    Plan {
        path: PathBuf,
        #[source]
        source: PlanError,
    },

    #[error("plan only partially applied, resubmit it to retry:\n{0}")]
    Incomplete(ApplyReport),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Provision {
    type Error = ProvisionError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let _ = tracing_subscriber::fmt()
            .compact()
            .with_writer(std::io::stderr)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(tracing::Level::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();

        let state = AppState::load(ctx.config_path.clone())?;
        let plan = ProvisionPlan::load(&self.plan_file).map_err(|source| ProvisionError::Plan {
            path: self.plan_file.clone(),
            source,
        })?;

        let config = ServiceConfig::from_app_state(&state, state.load_key()?)?;
        let api = Arc::new(HttpResourceApi::new(&config.resource_api_url)?);
        let mut reconciler = Reconciler::new(
            api,
            KeyVault::new(&config.user_keys_path),
            KeyVault::new(&config.volume_keys_path),
            config.call_timeout,
        );
        if let Some(driver_dir) = &config.driver_dir {
            reconciler = reconciler.with_drivers(DriverResolver::new(driver_dir));
        }

        let report = reconciler.apply(&plan).await;
        if !report.is_success() {
            return Err(ProvisionError::Incomplete(report));
        }

        Ok(format!(
            "Applied {}: {} users, {} volumes, {} gateways created; {} gateways, {} volumes, {} users deleted",
            self.plan_file.display(),
            plan.users.create.len(),
            plan.volumes.create.len(),
            plan.gateways.create.len(),
            plan.gateways.delete.len(),
            plan.volumes.delete.len(),
            plan.users.delete.len(),
        ))
    }
}
