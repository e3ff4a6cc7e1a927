//! Key store port for ephemeral envelope identities.
//!
//! Admission stores the private half of each generated key pair under
//! `keys/<run_id>/<order_num>`; the orchestrator deletes the entries
//! best-effort at finalisation.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use ordo_kernel::KernelError;

/// Key path for an order's ephemeral identity.
pub fn key_path(run_id: &str, order_num: &str) -> String {
    format!("keys/{run_id}/{order_num}")
}

/// Secret storage for envelope identities. `ttl` is an expiry hint; the
/// backing store may also expire entries on its own.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn put(&self, path: &str, value: &str, ttl: Duration) -> Result<(), KernelError>;

    async fn get(&self, path: &str) -> Result<Option<String>, KernelError>;

    async fn delete(&self, path: &str) -> Result<(), KernelError>;
}

/// In-memory [`KeyStore`] for tests and local runs.
#[derive(Default)]
pub struct MemoryKeyStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn put(&self, path: &str, value: &str, _ttl: Duration) -> Result<(), KernelError> {
        self.values
            .write()
            .map_err(|_| KernelError::KeyStore("values lock poisoned".into()))?
            .insert(path.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<String>, KernelError> {
        Ok(self
            .values
            .read()
            .map_err(|_| KernelError::KeyStore("values lock poisoned".into()))?
            .get(path)
            .cloned())
    }

    async fn delete(&self, path: &str) -> Result<(), KernelError> {
        self.values
            .write()
            .map_err(|_| KernelError::KeyStore("values lock poisoned".into()))?
            .remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryKeyStore::new();
        let path = key_path("r1", "0001");
        store
            .put(&path, "AGE-SECRET-KEY-TEST", Duration::from_secs(7200))
            .await
            .expect("put");
        assert_eq!(
            store.get(&path).await.expect("get").as_deref(),
            Some("AGE-SECRET-KEY-TEST")
        );
        store.delete(&path).await.expect("delete");
        assert_eq!(store.get(&path).await.expect("get"), None);
    }
}
