//! Worker-side callback client.
//!
//! Workers receive a presigned callback URI and must eventually write
//! `{status, log}` there. This client resolves `ordo+put://` tokens
//! against an artifact store and PUTs to plain `http(s)` URLs, truncating
//! the log to the contract limit either way. The worker body itself is
//! outside the kernel; only this reporting contract is.

use std::sync::Arc;

use chrono::Utc;

use ordo_kernel::{parse_put_token, ArtifactStore, CallbackResult, KernelError};

/// Maximum callback log size (256 KiB).
pub const MAX_LOG_BYTES: usize = 256 * 1024;

/// Truncate a log to [`MAX_LOG_BYTES`] on a char boundary.
pub fn truncate_log(log: &str) -> String {
    if log.len() <= MAX_LOG_BYTES {
        return log.to_string();
    }
    let mut end = MAX_LOG_BYTES;
    while !log.is_char_boundary(end) {
        end -= 1;
    }
    log[..end].to_string()
}

/// Writes callback results on behalf of a worker.
pub struct CallbackClient {
    store: Option<Arc<dyn ArtifactStore>>,
    http: reqwest::Client,
}

impl CallbackClient {
    /// Client for workers co-located with an artifact store (`ordo+put://`
    /// tokens resolve directly against it).
    pub fn with_store(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            store: Some(store),
            http: reqwest::Client::new(),
        }
    }

    /// Client for remote workers that only hold a real presigned URL.
    pub fn http_only() -> Self {
        Self {
            store: None,
            http: reqwest::Client::new(),
        }
    }

    /// Report an order result to its callback URI.
    pub async fn report(
        &self,
        callback_uri: &str,
        status: &str,
        log: &str,
    ) -> Result<(), KernelError> {
        let result = CallbackResult {
            status: status.to_string(),
            log: truncate_log(log),
        };
        let payload = serde_json::to_vec(&result)
            .map_err(|e| KernelError::Artifact(format!("encode callback: {e}")))?;

        if let Some(token) = parse_put_token(callback_uri) {
            if token.is_expired(Utc::now().timestamp()) {
                return Err(KernelError::Artifact(format!(
                    "callback token expired at {}",
                    token.expires_at
                )));
            }
            let Some(store) = &self.store else {
                return Err(KernelError::Artifact(
                    "callback token requires a local artifact store".into(),
                ));
            };
            if store.root() != token.root {
                return Err(KernelError::Artifact(format!(
                    "callback token root '{}' does not match store '{}'",
                    token.root,
                    store.root()
                )));
            }
            return store.put(&token.key, &payload).await;
        }

        if callback_uri.starts_with("http://") || callback_uri.starts_with("https://") {
            self.http
                .put(callback_uri)
                .header("Content-Type", "application/json")
                .body(payload)
                .send()
                .await
                .map_err(|e| KernelError::Artifact(format!("PUT callback: {e}")))?
                .error_for_status()
                .map_err(|e| KernelError::Artifact(format!("PUT callback: {e}")))?;
            return Ok(());
        }

        Err(KernelError::Artifact(format!(
            "unsupported callback uri: {callback_uri}"
        )))
    }
}

/// Reference inline worker: runs the order's commands locally and reports
/// through the callback contract.
///
/// Real deployments point dispatch at external runtimes; this backend
/// exists so a single process can execute `inline` orders end to end. It
/// self-enforces the order timeout (the watchdog stays as backstop).
pub struct ShellWorker {
    internal: Arc<dyn ArtifactStore>,
}

impl ShellWorker {
    pub fn new(internal: Arc<dyn ArtifactStore>) -> Self {
        Self { internal }
    }

    async fn run_cmds(cmds: &[String], timeout: std::time::Duration) -> (String, String) {
        let mut log = String::new();
        let deadline = tokio::time::Instant::now() + timeout;
        for cmd in cmds {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return ("timed_out".into(), log);
            }
            let run = tokio::process::Command::new("sh").arg("-c").arg(cmd).output();
            match tokio::time::timeout(remaining, run).await {
                Ok(Ok(output)) => {
                    log.push_str(&String::from_utf8_lossy(&output.stdout));
                    log.push_str(&String::from_utf8_lossy(&output.stderr));
                    if !output.status.success() {
                        log.push_str(&format!("\ncommand failed: {cmd}\n"));
                        return ("failed".into(), log);
                    }
                }
                Ok(Err(err)) => {
                    log.push_str(&format!("\nspawn failed: {err}\n"));
                    return ("failed".into(), log);
                }
                Err(_) => {
                    log.push_str(&format!("\ncommand timed out: {cmd}\n"));
                    return ("timed_out".into(), log);
                }
            }
        }
        ("succeeded".into(), log)
    }
}

#[async_trait::async_trait]
impl crate::dispatch::BackendDispatcher for ShellWorker {
    async fn dispatch(
        &self,
        request: &crate::dispatch::DispatchRequest,
    ) -> Result<crate::dispatch::DispatchHandle, KernelError> {
        if !matches!(request.target, ordo_kernel::ExecutionTarget::Inline { .. }) {
            return Err(KernelError::Dispatch(format!(
                "shell worker only serves inline orders, got {}",
                request.target.as_str()
            )));
        }
        let client = CallbackClient::with_store(self.internal.clone());
        let callback_uri = request.callback_uri.clone();
        let timeout = std::time::Duration::from_secs(request.timeout_s);
        let run_id = request.run_id.clone();
        let order_name = request.order_name.clone();
        let cmds = request.cmds.clone();
        tokio::spawn(async move {
            let (status, log) = Self::run_cmds(&cmds, timeout).await;
            if let Err(err) = client.report(&callback_uri, &status, &log).await {
                tracing::warn!(
                    run_id = %run_id,
                    order_name = %order_name,
                    error = %err,
                    "inline worker could not report"
                );
            }
        });
        Ok(crate::dispatch::DispatchHandle {
            execution_url: format!("local://{}", request.client_request_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_kernel::{result_key, MemoryArtifactStore};

    #[test]
    fn short_logs_pass_through() {
        assert_eq!(truncate_log("hello"), "hello");
    }

    #[test]
    fn oversized_logs_are_truncated_on_char_boundary() {
        let log = "é".repeat(MAX_LOG_BYTES);
        let truncated = truncate_log(&log);
        assert!(truncated.len() <= MAX_LOG_BYTES);
        assert!(truncated.is_char_boundary(truncated.len()));
    }

    #[tokio::test]
    async fn report_resolves_put_token_against_store() {
        let store = Arc::new(MemoryArtifactStore::new("internal"));
        let client = CallbackClient::with_store(store.clone());
        let key = result_key("r1", "0001");
        let uri = store.presign_put(&key, 7200);

        client.report(&uri, "succeeded", "all good").await.expect("report");

        let stored: CallbackResult =
            serde_json::from_slice(&store.get(&key).await.expect("get").expect("written"))
                .expect("decode");
        assert_eq!(stored.status, "succeeded");
        assert_eq!(stored.log, "all good");
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let store = Arc::new(MemoryArtifactStore::new("internal"));
        let client = CallbackClient::with_store(store.clone());
        let uri = format!(
            "ordo+put://internal/{}?expires={}",
            result_key("r1", "0001"),
            Utc::now().timestamp() - 10
        );
        assert!(client.report(&uri, "succeeded", "").await.is_err());
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let client = CallbackClient::http_only();
        assert!(client.report("ftp://nope", "succeeded", "").await.is_err());
    }

    fn inline_request(cmds: &[&str], callback_uri: &str) -> crate::dispatch::DispatchRequest {
        crate::dispatch::DispatchRequest {
            run_id: "r1".into(),
            order_num: "0001".into(),
            order_name: "a".into(),
            target: ordo_kernel::ExecutionTarget::Inline { function: None },
            cmds: cmds.iter().map(|c| c.to_string()).collect(),
            bundle_uri: String::new(),
            callback_uri: callback_uri.to_string(),
            key_ref: None,
            timeout_s: 10,
            client_request_id: crate::dispatch::client_request_id("r1", "0001"),
        }
    }

    async fn wait_for_result(
        store: &MemoryArtifactStore,
        key: &str,
    ) -> CallbackResult {
        for _ in 0..200 {
            if let Some(raw) = store.get(key).await.expect("get") {
                return serde_json::from_slice(&raw).expect("decode");
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("worker never reported to {key}");
    }

    #[tokio::test]
    async fn shell_worker_runs_commands_and_reports_success() {
        use crate::dispatch::BackendDispatcher;

        let store = Arc::new(MemoryArtifactStore::new("internal"));
        let worker = ShellWorker::new(store.clone());
        let key = result_key("r1", "0001");
        let uri = store.presign_put(&key, 7200);

        let handle = worker
            .dispatch(&inline_request(&["echo hello"], &uri))
            .await
            .expect("dispatch");
        assert!(handle.execution_url.starts_with("local://"));

        let result = wait_for_result(&store, &key).await;
        assert_eq!(result.status, "succeeded");
        assert!(result.log.contains("hello"));
    }

    #[tokio::test]
    async fn shell_worker_reports_failure_on_nonzero_exit() {
        use crate::dispatch::BackendDispatcher;

        let store = Arc::new(MemoryArtifactStore::new("internal"));
        let worker = ShellWorker::new(store.clone());
        let key = result_key("r1", "0001");
        let uri = store.presign_put(&key, 7200);

        worker
            .dispatch(&inline_request(&["echo first", "false", "echo unreachable"], &uri))
            .await
            .expect("dispatch");

        let result = wait_for_result(&store, &key).await;
        assert_eq!(result.status, "failed");
        assert!(result.log.contains("first"));
        assert!(!result.log.contains("unreachable"));
    }

    #[tokio::test]
    async fn shell_worker_rejects_non_inline_targets() {
        use crate::dispatch::BackendDispatcher;

        let store = Arc::new(MemoryArtifactStore::new("internal"));
        let worker = ShellWorker::new(store.clone());
        let mut request = inline_request(&["true"], "ordo+put://internal/x?expires=1");
        request.target = ordo_kernel::ExecutionTarget::Container { project: None };
        assert!(worker.dispatch(&request).await.is_err());
    }
}
