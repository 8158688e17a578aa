pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fleetmount")]
#[command(about = "Fleet provisioning control-plane daemon")]
pub struct Args {
    /// Path to the fleetmount state directory (defaults to ~/.fleetmount)
    #[arg(long, global = true, env = "FLEETMOUNT_STATE_DIR")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
