//! Per-order timeout watchdog (poll -> deadline -> synthetic result).
//!
//! One watchdog is started per dispatched order. It polls the artifact
//! store for the order's callback result until either the worker reports
//! or the deadline passes, in which case it writes a synthetic `timed_out`
//! result itself. That write produces a notification like any real
//! callback, so the orchestrator reconciles both through the same path.
//! The watchdog owns no state beyond its inputs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use ordo_kernel::{result_key, ArtifactStore, CallbackResult, KernelError};

/// Log line attached to synthetic watchdog results.
pub const WATCHDOG_TIMEOUT_LOG: &str = "worker unresponsive, timed out by watchdog";

/// Watchdog tuning.
#[derive(Clone, Copy, Debug)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Starts watchdog tasks against an artifact store.
#[derive(Clone)]
pub struct WatchdogSpawner {
    artifacts: Arc<dyn ArtifactStore>,
    config: WatchdogConfig,
}

impl WatchdogSpawner {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, config: WatchdogConfig) -> Self {
        Self { artifacts, config }
    }

    /// Start a watchdog for one dispatched order. Returns the handle
    /// recorded on the order.
    pub fn spawn(
        &self,
        run_id: &str,
        order_num: &str,
        timeout_s: u64,
        dispatched_at: DateTime<Utc>,
    ) -> String {
        let handle = format!("watchdog:{run_id}:{order_num}");
        let artifacts = self.artifacts.clone();
        let poll = self.config.poll_interval;
        let run_id = run_id.to_string();
        let order_num = order_num.to_string();
        tokio::spawn(async move {
            if let Err(err) =
                watch(artifacts, &run_id, &order_num, timeout_s, dispatched_at, poll).await
            {
                tracing::warn!(
                    run_id = %run_id,
                    order_num = %order_num,
                    error = %err,
                    "watchdog gave up"
                );
            }
        });
        handle
    }
}

/// One watchdog state machine: check, deadline, wait, repeat.
async fn watch(
    artifacts: Arc<dyn ArtifactStore>,
    run_id: &str,
    order_num: &str,
    timeout_s: u64,
    dispatched_at: DateTime<Utc>,
    poll: Duration,
) -> Result<(), KernelError> {
    let key = result_key(run_id, order_num);
    let deadline = dispatched_at + chrono::Duration::seconds(timeout_s as i64);
    loop {
        if artifacts.exists(&key).await? {
            tracing::debug!(run_id, order_num, "result present; watchdog done");
            return Ok(());
        }
        if Utc::now() > deadline {
            tracing::warn!(
                run_id,
                order_num,
                timeout_s,
                "deadline passed; writing synthetic timed_out result"
            );
            let synthetic = serde_json::to_vec(&CallbackResult {
                status: "timed_out".into(),
                log: WATCHDOG_TIMEOUT_LOG.into(),
            })
            .map_err(|e| KernelError::Artifact(format!("encode synthetic result: {e}")))?;
            artifacts.put(&key, &synthetic).await?;
            return Ok(());
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_kernel::MemoryArtifactStore;

    fn fast(artifacts: Arc<dyn ArtifactStore>) -> WatchdogSpawner {
        WatchdogSpawner::new(
            artifacts,
            WatchdogConfig {
                poll_interval: Duration::from_millis(5),
            },
        )
    }

    #[tokio::test]
    async fn exits_quietly_when_result_appears() {
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new("internal"));
        let key = result_key("r1", "0001");
        artifacts
            .put(&key, br#"{"status":"succeeded","log":""}"#)
            .await
            .expect("put");

        watch(
            artifacts.clone(),
            "r1",
            "0001",
            300,
            Utc::now(),
            Duration::from_millis(5),
        )
        .await
        .expect("watch");

        // Existing result untouched.
        let result: CallbackResult =
            serde_json::from_slice(&artifacts.get(&key).await.expect("get").expect("exists"))
                .expect("decode");
        assert_eq!(result.status, "succeeded");
    }

    #[tokio::test]
    async fn writes_synthetic_result_after_deadline() {
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new("internal"));
        let dispatched_at = Utc::now() - chrono::Duration::seconds(10);

        watch(
            artifacts.clone(),
            "r1",
            "0001",
            1,
            dispatched_at,
            Duration::from_millis(5),
        )
        .await
        .expect("watch");

        let result: CallbackResult = serde_json::from_slice(
            &artifacts
                .get(&result_key("r1", "0001"))
                .await
                .expect("get")
                .expect("synthetic written"),
        )
        .expect("decode");
        assert_eq!(result.status, "timed_out");
        assert_eq!(result.log, WATCHDOG_TIMEOUT_LOG);
    }

    #[tokio::test]
    async fn spawned_watchdog_runs_in_background() {
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new("internal"));
        let spawner = fast(artifacts.clone());
        let handle = spawner.spawn("r2", "0001", 1, Utc::now() - chrono::Duration::seconds(5));
        assert_eq!(handle, "watchdog:r2:0001");

        // Poll until the synthetic result lands.
        for _ in 0..100 {
            if artifacts
                .exists(&result_key("r2", "0001"))
                .await
                .expect("exists")
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watchdog never wrote the synthetic result");
    }
}
