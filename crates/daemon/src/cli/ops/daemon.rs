use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Args;

use common::plan::{PlanError, ProvisionPlan};
use fleetmount_daemon::service_config::{ConfigError, StartupPlan};
use fleetmount_daemon::state::AppState;
use fleetmount_daemon::{spawn_service, ServiceConfig};

#[derive(Args, Debug, Clone)]
pub struct Daemon {
    /// Provision plan to reconcile once the daemon is up
    #[arg(long)]
    pub plan: Option<PathBuf>,

    /// Override provisioning server port (default from config)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for log files (logs to stdout only if not set)
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Verbose logging, also passed on to helper programs
    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("state error: {0}")]
    StateError(#[from] fleetmount_daemon::state::StateError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("plan {path}: {source}")]
    Plan {
        path: PathBuf,
        #[source]
        source: PlanError,
    },
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Daemon {
    type Error = DaemonError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = AppState::load(ctx.config_path.clone())?;
        let server_key = state.load_key()?;

        // an unreadable plan stops start-up
        let startup_plan = match &self.plan {
            Some(path) => Some(StartupPlan {
                plan: ProvisionPlan::load(path).map_err(|source| DaemonError::Plan {
                    path: path.clone(),
                    source,
                })?,
                source: path.clone(),
            }),
            None => None,
        };

        let mut config = ServiceConfig::from_app_state(&state, server_key)?;
        if let Some(port) = self.port {
            config.listen_addr = SocketAddr::new(config.listen_addr.ip(), port);
        }
        config.startup_plan = startup_plan;
        config.debug = self.debug;
        config.log_dir = self.log_dir.clone();
        config.log_level = if self.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        spawn_service(&config).await;
        Ok("daemon ended".to_string())
    }
}
