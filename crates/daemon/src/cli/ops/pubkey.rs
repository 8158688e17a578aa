use clap::Args;

use fleetmount_daemon::state::{AppState, StateError};

/// Print the server's public key so hosts can pin it.
#[derive(Args, Debug, Clone)]
pub struct Pubkey {
    /// Print hex instead of PEM
    #[arg(long)]
    pub hex: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PubkeyError {
    #[error("state error: {0}")]
    State(#[from] StateError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Pubkey {
    type Error = PubkeyError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let public = AppState::load(ctx.config_path.clone())?.load_key()?.public();
        if self.hex {
            Ok(public.to_hex())
        } else {
            Ok(public.to_pem().trim_end().to_string())
        }
    }
}
