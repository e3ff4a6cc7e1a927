//! Credential source port: opaque `fetch(path) -> value` lookups.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use ordo_kernel::KernelError;

/// Opaque credential lookup (parameter store, secret manager, vault).
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, KernelError>;
}

/// Derive the env var name for a credential path: the last path segment,
/// upper-snake-cased (`/teams/ci/api-token` -> `API_TOKEN`).
pub fn env_name_for_path(path: &str) -> String {
    path.rsplit('/')
        .next()
        .unwrap_or(path)
        .to_ascii_uppercase()
        .replace('-', "_")
}

/// In-memory [`CredentialSource`] for tests and local runs.
#[derive(Default)]
pub struct MemoryCredentialSource {
    values: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryCredentialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, value: impl Into<Vec<u8>>) {
        if let Ok(mut values) = self.values.write() {
            values.insert(path.into(), value.into());
        }
    }
}

#[async_trait]
impl CredentialSource for MemoryCredentialSource {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, KernelError> {
        let values = self
            .values
            .read()
            .map_err(|_| KernelError::Credential("values lock poisoned".into()))?;
        values
            .get(path)
            .cloned()
            .ok_or_else(|| KernelError::Credential(format!("unknown credential path: {path}")))
    }
}

/// File-backed [`CredentialSource`]: paths resolve to files under a root
/// directory (a mounted secrets volume).
pub struct FsCredentialSource {
    root: std::path::PathBuf,
}

impl FsCredentialSource {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl CredentialSource for FsCredentialSource {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, KernelError> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(KernelError::Credential(format!(
                "invalid credential path: {path}"
            )));
        }
        let file = self.root.join(relative);
        std::fs::read(&file)
            .map_err(|e| KernelError::Credential(format!("read {}: {e}", file.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_name_uses_last_segment() {
        assert_eq!(env_name_for_path("/teams/ci/api-token"), "API_TOKEN");
        assert_eq!(env_name_for_path("db_password"), "DB_PASSWORD");
    }

    #[tokio::test]
    async fn memory_source_round_trips() {
        let source = MemoryCredentialSource::new();
        source.insert("/teams/ci/api-token", b"hunter2".to_vec());
        assert_eq!(
            source.fetch("/teams/ci/api-token").await.expect("fetch"),
            b"hunter2"
        );
        assert!(source.fetch("/missing").await.is_err());
    }

    #[tokio::test]
    async fn fs_source_reads_mounted_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("teams/ci")).expect("mkdir");
        std::fs::write(dir.path().join("teams/ci/api-token"), b"hunter2").expect("write");

        let source = FsCredentialSource::new(dir.path());
        assert_eq!(
            source.fetch("/teams/ci/api-token").await.expect("fetch"),
            b"hunter2"
        );
        assert!(source.fetch("/teams/ci/../escape").await.is_err());
        assert!(source.fetch("/absent").await.is_err());
    }
}
