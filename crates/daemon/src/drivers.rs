use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("driver reference '{0}' leaves the driver directory")]
    Escapes(String),
    #[error("driver package '{reference}' not found at {path}")]
    Missing { reference: String, path: PathBuf },
    #[error("no driver directory configured for driver '{0}'")]
    Unconfigured(String),
}

/// Maps gateway driver references onto package files under one directory.
#[derive(Debug, Clone)]
pub struct DriverResolver {
    root: PathBuf,
}

impl DriverResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn resolve(&self, reference: &str) -> Result<PathBuf, DriverError> {
        let relative = Path::new(reference);
        let is_plain = !reference.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !is_plain {
            return Err(DriverError::Escapes(reference.to_string()));
        }

        let path = self.root.join(relative);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(DriverError::Missing {
                reference: reference.to_string(),
                path,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolves_packages_inside_root() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("drivers")).unwrap();
        std::fs::write(temp.path().join("drivers").join("s3.tar"), b"pkg").unwrap();

        let resolver = DriverResolver::new(temp.path());
        assert_eq!(
            resolver.resolve("drivers/s3.tar").await.unwrap(),
            temp.path().join("drivers").join("s3.tar")
        );
    }

    #[tokio::test]
    async fn test_rejects_escapes_and_missing_files() {
        let temp = TempDir::new().unwrap();
        let resolver = DriverResolver::new(temp.path());

        for reference in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            assert!(
                matches!(resolver.resolve(reference).await, Err(DriverError::Escapes(_))),
                "{reference} should be refused"
            );
        }
        assert!(matches!(
            resolver.resolve("nope.tar").await,
            Err(DriverError::Missing { .. })
        ));
        // directories are not packages
        std::fs::create_dir(temp.path().join("dir")).unwrap();
        assert!(resolver.resolve("dir").await.is_err());
    }
}
