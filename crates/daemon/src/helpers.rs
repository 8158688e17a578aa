use std::path::{Path, PathBuf};

use tokio::process::Command;

pub const SERVER_BIN_VAR: &str = "FLEETMOUNT_SERVER_BIN";
pub const DEBUG_VAR: &str = "FLEETMOUNT_DEBUG";
pub const CONFIG_VAR: &str = "FLEETMOUNT_CONFIG";

/// Environment handed to every helper program the daemon launches, so helpers can
/// find the server binary and its configuration without re-parsing our arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperEnv {
    pub server_bin: PathBuf,
    pub debug: bool,
    pub config_path: PathBuf,
}

impl HelperEnv {
    pub fn new(config_path: &Path, debug: bool) -> Self {
        let server_bin = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("fleetmount"));
        Self {
            server_bin,
            debug,
            config_path: config_path.to_path_buf(),
        }
    }

    pub fn vars(&self) -> [(&'static str, String); 3] {
        [
            (SERVER_BIN_VAR, self.server_bin.display().to_string()),
            (DEBUG_VAR, if self.debug { "1" } else { "0" }.to_string()),
            (CONFIG_VAR, self.config_path.display().to_string()),
        ]
    }

    pub fn apply<'a>(&self, command: &'a mut Command) -> &'a mut Command {
        command.envs(self.vars())
    }
}
