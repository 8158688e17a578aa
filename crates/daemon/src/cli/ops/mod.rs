pub mod daemon;
pub mod init;
pub mod provision;
pub mod pubkey;
pub mod version;

pub use daemon::Daemon;
pub use init::Init;
pub use provision::Provision;
pub use pubkey::Pubkey;
pub use version::Version;
