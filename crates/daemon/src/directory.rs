//! Host inventory: which hostnames may talk to us and what key each one signs with.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use common::crypto::{KeyError, PublicKey};

use crate::helpers::HelperEnv;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("host list is not valid TOML: {0}")]
    HostList(#[from] toml::de::Error),
    #[error("no public key published for host '{0}'")]
    NoKey(String),
    #[error("public key for host '{host}' is invalid: {source}")]
    InvalidKey {
        host: String,
        #[source]
        source: KeyError,
    },
    #[error("helper {program} failed: {detail}")]
    Helper { program: PathBuf, detail: String },
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn is_known_host(&self, hostname: &str) -> Result<bool, DirectoryError>;

    /// The host's current public key. Implementations must not cache across calls so
    /// rotated keys take effect immediately.
    async fn host_public_key(&self, hostname: &str) -> Result<PublicKey, DirectoryError>;
}

#[derive(Debug, Default, Deserialize)]
struct HostList {
    #[serde(default)]
    hosts: BTreeSet<String>,
}

/// Host list in a TOML file (`hosts = ["h1", "h2"]`) with one `<host>.pem` per host.
#[derive(Debug, Clone)]
pub struct FileDirectory {
    hosts_file: PathBuf,
    keys_dir: PathBuf,
}

impl FileDirectory {
    pub fn new(hosts_file: impl Into<PathBuf>, keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            hosts_file: hosts_file.into(),
            keys_dir: keys_dir.into(),
        }
    }

    async fn hosts(&self) -> Result<BTreeSet<String>, DirectoryError> {
        match tokio::fs::read_to_string(&self.hosts_file).await {
            Ok(raw) => Ok(toml::from_str::<HostList>(&raw)?.hosts),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.hosts_file.display(), "host list missing, no hosts are known");
                Ok(BTreeSet::new())
            }
            Err(source) => Err(DirectoryError::Io {
                path: self.hosts_file.clone(),
                source,
            }),
        }
    }
}

#[async_trait]
impl Directory for FileDirectory {
    async fn is_known_host(&self, hostname: &str) -> Result<bool, DirectoryError> {
        Ok(self.hosts().await?.contains(hostname))
    }

    async fn host_public_key(&self, hostname: &str) -> Result<PublicKey, DirectoryError> {
        if hostname.is_empty() || hostname.starts_with('.') || hostname.contains(['/', '\\']) {
            return Err(DirectoryError::NoKey(hostname.to_string()));
        }

        let path = self.keys_dir.join(format!("{}.pem", hostname));
        let pem = match tokio::fs::read_to_string(&path).await {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DirectoryError::NoKey(hostname.to_string()))
            }
            Err(source) => return Err(DirectoryError::Io { path, source }),
        };

        PublicKey::from_pem(&pem).map_err(|source| DirectoryError::InvalidKey {
            host: hostname.to_string(),
            source,
        })
    }
}

/// Delegates to an external program:
///
/// - `<program> known <host>` exits 0 for a known host and 1 for an unknown one
/// - `<program> pubkey <host>` prints the host's PEM public key on stdout
#[derive(Debug, Clone)]
pub struct HelperDirectory {
    program: PathBuf,
    env: HelperEnv,
}

impl HelperDirectory {
    pub fn new(program: impl Into<PathBuf>, env: HelperEnv) -> Self {
        Self {
            program: program.into(),
            env,
        }
    }

    async fn run(&self, verb: &str, hostname: &str) -> Result<std::process::Output, DirectoryError> {
        let mut command = Command::new(&self.program);
        command
            .arg(verb)
            .arg(hostname)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        self.env.apply(&mut command);

        command.output().await.map_err(|e| DirectoryError::Helper {
            program: self.program.clone(),
            detail: e.to_string(),
        })
    }

    fn failure(&self, output: &std::process::Output) -> DirectoryError {
        DirectoryError::Helper {
            program: self.program.clone(),
            detail: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }
}

#[async_trait]
impl Directory for HelperDirectory {
    async fn is_known_host(&self, hostname: &str) -> Result<bool, DirectoryError> {
        let output = self.run("known", hostname).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.failure(&output)),
        }
    }

    async fn host_public_key(&self, hostname: &str) -> Result<PublicKey, DirectoryError> {
        let output = self.run("pubkey", hostname).await?;
        if !output.status.success() {
            return Err(self.failure(&output));
        }

        let pem = String::from_utf8_lossy(&output.stdout);
        PublicKey::from_pem(pem.trim()).map_err(|source| DirectoryError::InvalidKey {
            host: hostname.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::crypto::SecretKey;
    use tempfile::TempDir;

    fn file_directory(temp: &TempDir) -> FileDirectory {
        FileDirectory::new(temp.path().join("hosts.toml"), temp.path().join("hosts"))
    }

    #[tokio::test]
    async fn test_file_directory_lists_known_hosts() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("hosts.toml"), "hosts = [\"h1\", \"h2\"]\n").unwrap();
        let directory = file_directory(&temp);

        assert!(directory.is_known_host("h1").await.unwrap());
        assert!(!directory.is_known_host("h3").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_host_list_knows_nobody() {
        let temp = TempDir::new().unwrap();
        assert!(!file_directory(&temp).is_known_host("h1").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_directory_reads_rotated_keys() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("hosts")).unwrap();
        let directory = file_directory(&temp);
        let key_path = temp.path().join("hosts").join("h1.pem");

        let first = SecretKey::generate().unwrap().public();
        std::fs::write(&key_path, first.to_pem()).unwrap();
        assert_eq!(directory.host_public_key("h1").await.unwrap(), first);

        let second = SecretKey::generate().unwrap().public();
        std::fs::write(&key_path, second.to_pem()).unwrap();
        assert_eq!(directory.host_public_key("h1").await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_path_like_hostnames_have_no_key() {
        let temp = TempDir::new().unwrap();
        let directory = file_directory(&temp);
        assert!(matches!(
            directory.host_public_key("../key").await,
            Err(DirectoryError::NoKey(_))
        ));
        assert!(matches!(
            directory.host_public_key("h9").await,
            Err(DirectoryError::NoKey(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_helper_directory_protocol() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let key = SecretKey::generate().unwrap().public();
        let pem_path = temp.path().join("h1.pem");
        std::fs::write(&pem_path, key.to_pem()).unwrap();

        let script = temp.path().join("hosts.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\ncase \"$1 $2\" in\n  \"known h1\") exit 0 ;;\n  known*) exit 1 ;;\n  \"pubkey h1\") cat {} ;;\n  *) echo nope >&2; exit 3 ;;\nesac\n",
                pem_path.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let env = HelperEnv::new(&temp.path().join("config.toml"), false);
        let directory = HelperDirectory::new(&script, env);

        assert!(directory.is_known_host("h1").await.unwrap());
        assert!(!directory.is_known_host("h2").await.unwrap());
        assert_eq!(directory.host_public_key("h1").await.unwrap(), key);
        assert!(matches!(
            directory.host_public_key("h2").await,
            Err(DirectoryError::Helper { .. })
        ));
    }
}
