use std::{fs, path::PathBuf};

use common::prelude::SecretKey;
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "fleetmount";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const KEY_FILE_NAME: &str = "key.pem";
pub const KEYS_DIR_NAME: &str = "keys";
pub const VOLUME_KEYS_DIR_NAME: &str = "volumes";
pub const USER_KEYS_DIR_NAME: &str = "users";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Port the provisioning server listens on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Base URL of the resource-management API that owns users, volumes and gateways
    #[serde(default = "default_resource_api_url")]
    pub resource_api_url: String,
    /// Upper bound on any single call to the resource API, directory or helpers
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Largest request body accepted by the provisioning endpoint
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    /// Requests processed concurrently by the provisioning endpoint
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Directory holding gateway driver packages
    #[serde(default)]
    pub driver_dir: Option<PathBuf>,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

fn default_listen_port() -> u16 {
    33334
}

fn default_resource_api_url() -> String {
    "http://localhost:8080/".to_string()
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_max_payload_bytes() -> usize {
    64 * 1024
}

fn default_max_concurrent_requests() -> usize {
    16
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            resource_api_url: default_resource_api_url(),
            call_timeout_secs: default_call_timeout_secs(),
            max_payload_bytes: default_max_payload_bytes(),
            max_concurrent_requests: default_max_concurrent_requests(),
            driver_dir: None,
            directory: DirectoryConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }
}

/// Where the known-host set and host public keys come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectoryConfig {
    /// A TOML host list plus one `<hostname>.pem` public key per host
    File {
        /// Defaults to `<state dir>/hosts.toml`
        hosts_file: Option<PathBuf>,
        /// Defaults to `<state dir>/hosts/`
        keys_dir: Option<PathBuf>,
    },
    /// An external helper program answering `known <host>` and `pubkey <host>`
    Helper { program: PathBuf },
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig::File {
            hosts_file: None,
            keys_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Pending plans held by the reconciliation worker
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Times the worker applies one plan before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Pause between attempts
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
}

fn default_queue_size() -> usize {
    16
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_delay_secs() -> u64 {
    30
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            max_attempts: default_max_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    /// Path to the state directory (~/.fleetmount)
    pub state_dir: PathBuf,
    /// Path to the server's signing key
    pub key_path: PathBuf,
    /// Path to the bootstrap key vault
    pub volume_keys_path: PathBuf,
    /// Path to the per-user key vault
    pub user_keys_path: PathBuf,
    /// Path to the config file
    pub config_path: PathBuf,
    /// Loaded configuration
    pub config: AppConfig,
}

impl AppState {
    /// Get the state directory path (custom or default ~/.fleetmount)
    pub fn state_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
        if let Some(path) = custom_path {
            return Ok(path);
        }

        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    fn layout(state_dir: PathBuf, config: AppConfig) -> Self {
        let keys_dir = state_dir.join(KEYS_DIR_NAME);
        Self {
            key_path: state_dir.join(KEY_FILE_NAME),
            volume_keys_path: keys_dir.join(VOLUME_KEYS_DIR_NAME),
            user_keys_path: keys_dir.join(USER_KEYS_DIR_NAME),
            config_path: state_dir.join(CONFIG_FILE_NAME),
            state_dir,
            config,
        }
    }

    /// Initialize a new state directory with a fresh server key
    pub fn init(
        custom_path: Option<PathBuf>,
        config: Option<AppConfig>,
    ) -> Result<Self, StateError> {
        let state_dir = Self::state_dir(custom_path)?;

        if state_dir.join(CONFIG_FILE_NAME).exists() {
            return Err(StateError::AlreadyInitialized);
        }

        let state = Self::layout(state_dir, config.unwrap_or_default());
        fs::create_dir_all(&state.volume_keys_path)?;
        fs::create_dir_all(&state.user_keys_path)?;

        let key = SecretKey::generate().map_err(|e| StateError::InvalidKey(e.to_string()))?;
        fs::write(&state.key_path, key.to_pem())?;

        let config_toml = toml::to_string_pretty(&state.config)?;
        fs::write(&state.config_path, config_toml)?;

        Ok(state)
    }

    /// Load existing state from the state directory
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, StateError> {
        let state_dir = Self::state_dir(custom_path)?;

        if !state_dir.exists() {
            return Err(StateError::NotInitialized);
        }

        let config_path = state_dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            return Err(StateError::MissingFile(CONFIG_FILE_NAME.to_string()));
        }
        let config_toml = fs::read_to_string(&config_path)?;
        let config: AppConfig = toml::from_str(&config_toml)?;

        let state = Self::layout(state_dir, config);
        if !state.key_path.exists() {
            return Err(StateError::MissingFile(KEY_FILE_NAME.to_string()));
        }

        Ok(state)
    }

    /// Load the server's signing key
    pub fn load_key(&self) -> Result<SecretKey, StateError> {
        let pem = fs::read_to_string(&self.key_path)?;
        let key = SecretKey::from_pem(&pem).map_err(|e| StateError::InvalidKey(e.to_string()))?;
        Ok(key)
    }

    /// Default host list location for the file directory
    pub fn hosts_file(&self) -> PathBuf {
        self.state_dir.join("hosts.toml")
    }

    /// Default location of per-host public keys for the file directory
    pub fn host_keys_dir(&self) -> PathBuf {
        self.state_dir.join("hosts")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state directory not initialized. Run 'fleetmount init' first")]
    NotInitialized,

    #[error("state directory already initialized")]
    AlreadyInitialized,

    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("missing required file: {0}")]
    MissingFile(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
