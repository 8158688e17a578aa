//! On-disk store of named private keys.
//!
//! One PEM file per name under a root directory. The daemon keeps two vaults:
//! bootstrap keys keyed by volume name, and user keys keyed by username.
//!
//! `get_or_create` is the only way reconciliation mints keys. It serialises
//! callers per name inside this process and publishes new keys with a hard link,
//! which fails if the target exists, so an existing file always wins even against
//! another process.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::crypto::{KeyError, SecretKey};
use parking_lot::Mutex;
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum KeyVaultError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stored key for '{name}' is unreadable: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: KeyError,
    },
    #[error("failed to generate key: {0}")]
    Generate(#[from] KeyError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> KeyVaultError + '_ {
    move |source| KeyVaultError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone)]
pub struct KeyVault {
    root: PathBuf,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Deterministic location of the key stored under `name`.
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.pem", sanitize(name)))
    }

    /// Read the key stored under `name`; a missing file is `None`, not an error.
    pub async fn get(&self, name: &str) -> Result<Option<SecretKey>, KeyVaultError> {
        let path = self.path(name);
        match fs::read_to_string(&path).await {
            Ok(pem) => SecretKey::from_pem(&pem)
                .map(Some)
                .map_err(|source| KeyVaultError::Corrupt {
                    name: name.to_string(),
                    source,
                }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    /// Store `key` under `name`, replacing whatever is there.
    pub async fn put(&self, name: &str, key: &SecretKey) -> Result<(), KeyVaultError> {
        let lock = self.lock_for(name);
        let result = {
            let _guard = lock.lock().await;
            self.replace(name, key).await
        };
        self.release(name, lock);
        result
    }

    /// Return the key stored under `name`, generating and persisting one if absent.
    ///
    /// The boolean is true when this call created the key.
    pub async fn get_or_create(&self, name: &str) -> Result<(SecretKey, bool), KeyVaultError> {
        let lock = self.lock_for(name);
        let result = {
            let _guard = lock.lock().await;
            self.create_if_absent(name).await
        };
        self.release(name, lock);
        result
    }

    async fn replace(&self, name: &str, key: &SecretKey) -> Result<(), KeyVaultError> {
        let path = self.path(name);
        fs::create_dir_all(&self.root)
            .await
            .map_err(io_error(&self.root))?;

        if fs::try_exists(&path).await.unwrap_or(false) {
            tracing::warn!(name, path = %path.display(), "overwriting existing key");
        }

        let staged = self.stage(name, key).await?;
        let result = fs::rename(&staged, &path).await.map_err(io_error(&path));
        if result.is_err() {
            let _ = fs::remove_file(&staged).await;
        }
        result
    }

    async fn create_if_absent(&self, name: &str) -> Result<(SecretKey, bool), KeyVaultError> {
        if let Some(existing) = self.get(name).await? {
            return Ok((existing, false));
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(io_error(&self.root))?;

        let key = SecretKey::generate()?;
        let path = self.path(name);
        let staged = self.stage(name, &key).await?;
        let linked = fs::hard_link(&staged, &path).await;
        let _ = fs::remove_file(&staged).await;

        match linked {
            Ok(()) => {
                tracing::info!(name, path = %path.display(), "generated new key");
                Ok((key, true))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                tracing::warn!(name, "key appeared concurrently, using the stored one");
                let existing = self.get(name).await?.ok_or_else(|| KeyVaultError::Io {
                    path: path.clone(),
                    source: std::io::Error::new(ErrorKind::NotFound, "key vanished after link race"),
                })?;
                Ok((existing, false))
            }
            Err(e) => Err(io_error(&path)(e)),
        }
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Drop the lock entry for `name` once nobody else holds or waits on it.
    fn release(&self, name: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // the map and `lock` itself
        if Arc::strong_count(&lock) == 2 {
            locks.remove(name);
        }
    }

    /// Write `key` to a private temporary file next to its final location.
    async fn stage(&self, name: &str, key: &SecretKey) -> Result<PathBuf, KeyVaultError> {
        static STAGED: AtomicU64 = AtomicU64::new(0);
        let staged = self.root.join(format!(
            ".{}.{}.{}.tmp",
            sanitize(name),
            std::process::id(),
            STAGED.fetch_add(1, Ordering::Relaxed)
        ));

        fs::write(&staged, key.to_pem())
            .await
            .map_err(io_error(&staged))?;
        restrict_permissions(&staged).await?;
        Ok(staged)
    }
}

/// Map a name onto a single safe path component.
///
/// Letters, digits and `-.@+` are kept, except a leading `.`. Every other byte,
/// `_` included, becomes `_xx` in lowercase hex, so distinct names never share a file.
fn sanitize(name: &str) -> String {
    if name.is_empty() {
        return "_".to_string();
    }
    let mut encoded = String::with_capacity(name.len());
    for (i, byte) in name.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'@' | b'+')
            || (byte == b'.' && i > 0);
        if keep {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("_{:02x}", byte));
        }
    }
    encoded
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), KeyVaultError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(io_error(path))
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), KeyVaultError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let temp = TempDir::new().unwrap();
        let vault = KeyVault::new(temp.path().join("volumes"));
        assert!(vault.get("vol1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_creates_directories_and_overwrites() {
        let temp = TempDir::new().unwrap();
        let vault = KeyVault::new(temp.path().join("nested").join("volumes"));

        let first = SecretKey::generate().unwrap();
        vault.put("vol1", &first).await.unwrap();
        assert_eq!(
            vault.get("vol1").await.unwrap().unwrap().to_bytes(),
            first.to_bytes()
        );

        let second = SecretKey::generate().unwrap();
        vault.put("vol1", &second).await.unwrap();
        assert_eq!(
            vault.get("vol1").await.unwrap().unwrap().to_bytes(),
            second.to_bytes()
        );
    }

    #[tokio::test]
    async fn test_existing_key_always_wins() {
        let temp = TempDir::new().unwrap();
        let vault = KeyVault::new(temp.path());

        let stored = SecretKey::generate().unwrap();
        vault.put("vol1", &stored).await.unwrap();

        let (key, created) = vault.get_or_create("vol1").await.unwrap();
        assert!(!created);
        assert_eq!(key.to_bytes(), stored.to_bytes());
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_key() {
        let temp = TempDir::new().unwrap();
        let vault = KeyVault::new(temp.path());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let vault = vault.clone();
                tokio::spawn(async move { vault.get_or_create("vol1").await.unwrap() })
            })
            .collect();

        let mut created = 0;
        let mut keys = Vec::new();
        for task in tasks {
            let (key, was_created) = task.await.unwrap();
            created += was_created as usize;
            keys.push(key.to_bytes());
        }

        assert_eq!(created, 1);
        assert!(keys.windows(2).all(|pair| pair[0] == pair[1]));

        let files: Vec<_> = std::fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let vault = KeyVault::new(temp.path());
        std::fs::write(vault.path("vol1"), "garbage").unwrap();

        assert!(matches!(
            vault.get("vol1").await,
            Err(KeyVaultError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_names_cannot_escape_root() {
        let vault = KeyVault::new("/vault");
        assert_eq!(
            vault.path("../../etc/passwd"),
            PathBuf::from("/vault/_2e._2f.._2fetc_2fpasswd.pem")
        );
        assert_eq!(
            vault.path("alice@example.org"),
            PathBuf::from("/vault/alice@example.org.pem")
        );
        assert_eq!(vault.path(".."), PathBuf::from("/vault/_2e..pem"));
        assert_eq!(vault.path(""), PathBuf::from("/vault/_.pem"));
    }

    #[tokio::test]
    async fn test_names_differing_in_one_character_get_distinct_keys() {
        let temp = TempDir::new().unwrap();
        let vault = KeyVault::new(temp.path());

        for (a, b) in [
            ("o'brien@example.org", "o_brien@example.org"),
            ("my vol", "my_vol"),
            ("a_20b", "a b"),
        ] {
            assert_ne!(vault.path(a), vault.path(b));
            let (key_a, created_a) = vault.get_or_create(a).await.unwrap();
            let (key_b, created_b) = vault.get_or_create(b).await.unwrap();
            assert!(created_a);
            assert!(created_b, "{} reused the key of {}", b, a);
            assert_ne!(key_a.to_bytes(), key_b.to_bytes());
        }
    }

    #[tokio::test]
    async fn test_lock_entries_are_released() {
        let temp = TempDir::new().unwrap();
        let vault = KeyVault::new(temp.path());

        for name in ["vol1", "vol2", "vol3"] {
            vault.get_or_create(name).await.unwrap();
            vault.put(name, &SecretKey::generate().unwrap()).await.unwrap();
        }
        assert!(vault.locks.lock().is_empty());
    }
}
