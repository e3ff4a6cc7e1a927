//! Artifact store contract (C2): execution bundles, callback results, and
//! done markers.
//!
//! Key layout inside the internal root:
//! - `exec/<run_id>/<order_num>/bundle.tar.gz`
//! - `callbacks/<run_id>/<order_num>/result`
//!
//! The done root holds `<run_id>/done`. Any write to a `callbacks/**/result`
//! key notifies the configured [`NotificationSink`] with the object key; that
//! notification stream is the orchestrator's only trigger. The sink is a
//! port — the stores never know what consumes the notifications.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::KernelError;

/// Order number reserved for the admission start signal.
pub const START_ORDER_NUM: &str = "0000";

/// Bundle key for an order inside the internal root.
pub fn exec_key(run_id: &str, order_num: &str) -> String {
    format!("exec/{run_id}/{order_num}/bundle.tar.gz")
}

/// Callback result key for an order inside the internal root.
pub fn result_key(run_id: &str, order_num: &str) -> String {
    format!("callbacks/{run_id}/{order_num}/result")
}

/// Done marker key inside the done root.
pub fn done_key(run_id: &str) -> String {
    format!("{run_id}/done")
}

/// Whether a key is a callback result and must produce a notification.
pub fn is_result_key(key: &str) -> bool {
    parse_result_key(key).is_some()
}

/// Extract `(run_id, order_num)` from a `callbacks/<run>/<num>/result` key.
pub fn parse_result_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.split('/');
    if parts.next() != Some("callbacks") {
        return None;
    }
    let run_id = parts.next().filter(|s| !s.is_empty())?;
    let order_num = parts.next().filter(|s| !s.is_empty())?;
    if parts.next() != Some("result") || parts.next().is_some() {
        return None;
    }
    Some((run_id, order_num))
}

/// Parse an `ordo+blob://<root>/<key>` artifact URI into `(root, key)`.
pub fn parse_blob_uri(uri: &str) -> Option<(&str, &str)> {
    let rest = uri.strip_prefix("ordo+blob://")?;
    let (root, key) = rest.split_once('/')?;
    if root.is_empty() || key.is_empty() {
        return None;
    }
    Some((root, key))
}

/// Decoded time-limited write token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutToken {
    pub root: String,
    pub key: String,
    pub expires_at: i64,
}

impl PutToken {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }
}

/// Parse an `ordo+put://<root>/<key>?expires=<epoch>` write token.
pub fn parse_put_token(uri: &str) -> Option<PutToken> {
    let rest = uri.strip_prefix("ordo+put://")?;
    let (path, query) = rest.split_once('?')?;
    let (root, key) = path.split_once('/')?;
    let expires_at: i64 = query.strip_prefix("expires=")?.parse().ok()?;
    if root.is_empty() || key.is_empty() {
        return None;
    }
    Some(PutToken {
        root: root.to_string(),
        key: key.to_string(),
        expires_at,
    })
}

/// Receiver for object-created notifications on callback result keys.
pub trait NotificationSink: Send + Sync {
    fn object_created(&self, key: &str);
}

/// Blob store with presigned-write support.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store root name (the bucket equivalent).
    fn root(&self) -> &str;

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), KernelError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KernelError>;

    async fn exists(&self, key: &str) -> Result<bool, KernelError>;

    /// Stable URI for a stored object.
    fn uri(&self, key: &str) -> String {
        format!("ordo+blob://{}/{key}", self.root())
    }

    /// Time-limited write token for a key, so a worker can report without
    /// credentials.
    fn presign_put(&self, key: &str, expiry_s: u64) -> String {
        let expires_at = Utc::now().timestamp() + expiry_s as i64;
        format!("ordo+put://{}/{key}?expires={expires_at}", self.root())
    }
}

/// In-memory [`ArtifactStore`].
pub struct MemoryArtifactStore {
    root: String,
    objects: RwLock<HashMap<String, Vec<u8>>>,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl MemoryArtifactStore {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            objects: RwLock::new(HashMap::new()),
            sink: None,
        }
    }

    pub fn with_sink(root: impl Into<String>, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            root: root.into(),
            objects: RwLock::new(HashMap::new()),
            sink: Some(sink),
        }
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    fn root(&self) -> &str {
        &self.root
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), KernelError> {
        {
            let mut objects = self
                .objects
                .write()
                .map_err(|_| KernelError::Artifact("objects lock poisoned".into()))?;
            objects.insert(key.to_string(), bytes.to_vec());
        }
        if let Some(sink) = &self.sink {
            if is_result_key(key) {
                sink.object_created(key);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KernelError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| KernelError::Artifact("objects lock poisoned".into()))?;
        Ok(objects.get(key).cloned())
    }

    async fn exists(&self, key: &str) -> Result<bool, KernelError> {
        let objects = self
            .objects
            .read()
            .map_err(|_| KernelError::Artifact("objects lock poisoned".into()))?;
        Ok(objects.contains_key(key))
    }
}

/// Filesystem-rooted [`ArtifactStore`] for local operation.
pub struct FsArtifactStore {
    root: String,
    base: PathBuf,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<String>, base: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            base: base.into(),
            sink: None,
        }
    }

    pub fn with_sink(
        root: impl Into<String>,
        base: impl Into<PathBuf>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            root: root.into(),
            base: base.into(),
            sink: Some(sink),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, KernelError> {
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(KernelError::Artifact(format!("invalid object key: {key}")));
        }
        Ok(self.base.join(key))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn root(&self) -> &str {
        &self.root
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), KernelError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KernelError::Artifact(format!("create {}: {e}", parent.display())))?;
        }
        std::fs::write(&path, bytes)
            .map_err(|e| KernelError::Artifact(format!("write {}: {e}", path.display())))?;
        if let Some(sink) = &self.sink {
            if is_result_key(key) {
                sink.object_created(key);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KernelError> {
        let path = self.path_for(key)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KernelError::Artifact(format!(
                "read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, KernelError> {
        Ok(self.path_for(key)?.is_file())
    }
}
