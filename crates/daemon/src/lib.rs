// Request path
pub mod auth;
pub mod http_server;
pub mod plan_resolver;

// Reconciliation
pub mod key_vault;
pub mod reconcile;

// External collaborators
pub mod directory;
pub mod drivers;
pub mod helpers;
pub mod resource_api;

// Service wiring
pub mod process;
pub mod service_config;
pub mod service_state;

// App state (configuration, paths)
pub mod state;

pub mod testkit;

pub use process::{spawn_service, start_with_state, ShutdownHandle};
pub use service_config::Config as ServiceConfig;
pub use service_state::State as ServiceState;
pub use state::{AppConfig, AppState, StateError};
