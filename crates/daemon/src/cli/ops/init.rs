use std::path::PathBuf;

use clap::Args;
use url::Url;

use fleetmount_daemon::state::{AppConfig, AppState, DirectoryConfig, StateError};

#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Port for the provisioning server
    #[arg(long)]
    pub listen_port: Option<u16>,

    /// Base URL of the resource-management API
    #[arg(long)]
    pub resource_api_url: Option<Url>,

    /// Use this helper program as the host directory instead of hosts.toml
    #[arg(long)]
    pub directory_helper: Option<PathBuf>,

    /// Directory holding gateway driver packages
    #[arg(long)]
    pub driver_dir: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("state error: {0}")]
    State(#[from] StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let mut config = AppConfig::default();
        if let Some(port) = self.listen_port {
            config.listen_port = port;
        }
        if let Some(url) = &self.resource_api_url {
            config.resource_api_url = url.to_string();
        }
        if let Some(program) = &self.directory_helper {
            config.directory = DirectoryConfig::Helper {
                program: program.clone(),
            };
        }
        config.driver_dir = self.driver_dir.clone();

        let state = AppState::init(ctx.config_path.clone(), Some(config))?;
        let public = state.load_key()?.public();

        Ok(format!(
            "Initialized fleetmount state at {}\nServer public key:\n{}",
            state.state_dir.display(),
            public.to_pem().trim_end()
        ))
    }
}
