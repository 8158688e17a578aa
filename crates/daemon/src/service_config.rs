use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use common::plan::ProvisionPlan;
use common::prelude::SecretKey;
use url::Url;

use crate::reconcile::RetryPolicy;
use crate::state::{AppState, DirectoryConfig};

/// A plan handed to the daemon at start-up.
#[derive(Debug, Clone)]
pub struct StartupPlan {
    pub source: PathBuf,
    pub plan: ProvisionPlan,
}

#[derive(Debug)]
pub struct Config {
    // identity
    /// key used to sign every response
    pub server_key: SecretKey,

    // http server configuration
    pub listen_addr: SocketAddr,
    /// largest accepted request body
    pub max_payload_bytes: usize,
    pub max_concurrent_requests: usize,

    // collaborators
    pub resource_api_url: Url,
    /// directory source with file defaults resolved against the state dir
    pub directory: DirectoryConfig,
    /// upper bound on every resource API, directory and helper call
    pub call_timeout: Duration,
    pub driver_dir: Option<PathBuf>,

    // key vaults
    pub volume_keys_path: PathBuf,
    pub user_keys_path: PathBuf,

    // reconciliation
    pub reconcile_queue_size: usize,
    pub retry: RetryPolicy,
    pub startup_plan: Option<StartupPlan>,

    // helper environment
    pub config_path: PathBuf,
    pub debug: bool,

    // logging
    pub log_level: tracing::Level,
    /// Directory for log files (optional, logs to stdout only if not set)
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_app_state(state: &AppState, server_key: SecretKey) -> Result<Self, ConfigError> {
        let app = &state.config;
        let directory = match &app.directory {
            DirectoryConfig::File {
                hosts_file,
                keys_dir,
            } => DirectoryConfig::File {
                hosts_file: Some(hosts_file.clone().unwrap_or_else(|| state.hosts_file())),
                keys_dir: Some(keys_dir.clone().unwrap_or_else(|| state.host_keys_dir())),
            },
            helper => helper.clone(),
        };

        Ok(Self {
            server_key,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], app.listen_port)),
            max_payload_bytes: app.max_payload_bytes,
            max_concurrent_requests: app.max_concurrent_requests.max(1),
            resource_api_url: Url::parse(&app.resource_api_url)?,
            directory,
            call_timeout: Duration::from_secs(app.call_timeout_secs),
            driver_dir: app.driver_dir.clone(),
            volume_keys_path: state.volume_keys_path.clone(),
            user_keys_path: state.user_keys_path.clone(),
            reconcile_queue_size: app.reconcile.queue_size,
            retry: RetryPolicy {
                max_attempts: app.reconcile.max_attempts,
                retry_delay: Duration::from_secs(app.reconcile.retry_delay_secs),
            },
            startup_plan: None,
            config_path: state.config_path.clone(),
            debug: false,
            log_level: tracing::Level::INFO,
            log_dir: None,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid resource API URL: {0}")]
    Url(#[from] url::ParseError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppConfig;
    use tempfile::TempDir;

    #[test]
    fn test_file_directory_defaults_to_state_dir() {
        let temp = TempDir::new().unwrap();
        let state = AppState::init(Some(temp.path().to_path_buf()), None).unwrap();
        let config = Config::from_app_state(&state, state.load_key().unwrap()).unwrap();

        assert_eq!(
            config.directory,
            DirectoryConfig::File {
                hosts_file: Some(temp.path().join("hosts.toml")),
                keys_dir: Some(temp.path().join("hosts")),
            }
        );
        assert_eq!(config.listen_addr.port(), 33334);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_bad_api_url_is_rejected() {
        let temp = TempDir::new().unwrap();
        let app = AppConfig {
            resource_api_url: "not a url".to_string(),
            ..AppConfig::default()
        };
        let state = AppState::init(Some(temp.path().to_path_buf()), Some(app)).unwrap();
        assert!(Config::from_app_state(&state, state.load_key().unwrap()).is_err());
    }
}
