//! Finalisation: detect the terminal run state, write the done marker,
//! and enforce the job-wide deadline.
//!
//! Aggregate status:
//! - `timed_out` when the job deadline elapsed before all orders were
//!   terminal (detected via the last terminal transition time);
//! - otherwise `failed` when any `must_succeed` order is non-`succeeded`;
//! - otherwise `succeeded`.
//!
//! When the deadline has elapsed and orders are still in flight, every
//! running order gets a synthetic `timed_out` callback (the watchdog path)
//! and every still-queued order is failed in place; the resulting
//! notifications drive the run to termination.

use chrono::Utc;
use serde_json::json;

use ordo_kernel::{
    done_key, result_key, ArtifactStore, CallbackResult, DoneMarker, JobStatus, KernelError,
    OrderEvent, OrderRecord, OrderStatus, OrderStatusUpdate, RunSummary, StateStore,
    JOB_ORDER_NAME,
};

use crate::keystore::KeyStore;
use crate::notify::RunNotifier;

/// Log line for orders terminated by the job-wide deadline.
pub const JOB_TIMEOUT_LOG: &str = "job timeout elapsed, terminated by orchestrator";

/// Result of the finalisation check.
#[derive(Debug)]
pub enum FinalizeOutcome {
    Finalized(JobStatus, RunSummary),
    InProgress,
}

fn resolve_job_status(orders: &[OrderRecord], deadline: i64, now: i64) -> JobStatus {
    let finished_at = orders.iter().map(|o| o.last_update).max().unwrap_or(0);
    if now > deadline && finished_at > deadline {
        return JobStatus::TimedOut;
    }
    let failed = orders
        .iter()
        .any(|o| o.must_succeed && o.status != OrderStatus::Succeeded);
    if failed {
        JobStatus::Failed
    } else {
        JobStatus::Succeeded
    }
}

/// Check whether the run is terminal and finalise it if so.
#[allow(clippy::too_many_arguments)]
pub async fn check_and_finalize(
    state: &dyn StateStore,
    internal: &dyn ArtifactStore,
    done: &dyn ArtifactStore,
    keys: &dyn KeyStore,
    notifier: &dyn RunNotifier,
    run_id: &str,
    orders: &[OrderRecord],
) -> Result<FinalizeOutcome, KernelError> {
    let now = Utc::now().timestamp();
    let deadline = orders.iter().map(|o| o.job_deadline).min().unwrap_or(now);

    if !orders.iter().all(|o| o.status.is_terminal()) {
        if now > deadline {
            sweep_expired_run(state, internal, run_id, orders).await?;
        }
        return Ok(FinalizeOutcome::InProgress);
    }

    let status = resolve_job_status(orders, deadline, now);
    let summary = RunSummary::tally(orders);
    let trace_id = orders
        .first()
        .map(|o| o.trace_id.clone())
        .unwrap_or_default();
    let flow_id = orders
        .first()
        .map(|o| o.flow_id.clone())
        .unwrap_or_default();
    let done_uri = done.uri(&done_key(run_id));

    // A late notification can replay this check after completion; the
    // marker rewrite is idempotent, the event and notification are not.
    let already_completed = state
        .events_for_trace(&trace_id, Some(JOB_ORDER_NAME))
        .await?
        .iter()
        .any(|e| e.event_type == "job_completed");

    if !already_completed {
        let event = OrderEvent::new(&trace_id, JOB_ORDER_NAME, "job_completed", status.as_str())
            .with_flow(&flow_id)
            .with_run(run_id)
            .with_data(json!({ "summary": summary, "done_endpt": done_uri }));
        state.put_event(&event).await?;
    }

    let marker = serde_json::to_vec(&DoneMarker { status, summary })
        .map_err(|e| KernelError::Artifact(format!("encode done marker: {e}")))?;
    done.put(&done_key(run_id), &marker).await?;

    if !already_completed {
        if let Err(err) = notifier.job_completed(run_id, status, &summary).await {
            tracing::warn!(run_id, error = %err, "final notification failed");
        }
    }

    // Best-effort cleanup of per-order ephemeral identities.
    for order in orders {
        let Some(key_ref) = &order.key_ref else {
            continue;
        };
        if !key_ref.starts_with("keys/") {
            continue;
        }
        if let Err(err) = keys.delete(key_ref).await {
            tracing::warn!(run_id, key_ref = %key_ref, error = %err, "key cleanup failed");
        }
    }

    tracing::info!(
        run_id,
        status = %status,
        succeeded = summary.succeeded,
        failed = summary.failed,
        timed_out = summary.timed_out,
        "run finalised"
    );
    Ok(FinalizeOutcome::Finalized(status, summary))
}

/// Watchdog-style resolution for a run that outlived its deadline: running
/// orders get a synthetic timed_out result, queued orders are failed in
/// place.
async fn sweep_expired_run(
    state: &dyn StateStore,
    internal: &dyn ArtifactStore,
    run_id: &str,
    orders: &[OrderRecord],
) -> Result<(), KernelError> {
    for order in orders {
        match order.status {
            OrderStatus::Running => {
                tracing::warn!(
                    run_id,
                    order_name = %order.order_name,
                    "job deadline elapsed; writing synthetic timed_out result"
                );
                let synthetic = serde_json::to_vec(&CallbackResult {
                    status: "timed_out".into(),
                    log: JOB_TIMEOUT_LOG.into(),
                })
                .map_err(|e| KernelError::Artifact(format!("encode synthetic result: {e}")))?;
                internal
                    .put(&result_key(run_id, &order.order_num), &synthetic)
                    .await?;
            }
            OrderStatus::Queued => {
                state
                    .update_order_status(
                        run_id,
                        &order.order_num,
                        OrderStatus::Failed,
                        OrderStatusUpdate {
                            failure_reason: Some("job_timeout".into()),
                            log: Some(JOB_TIMEOUT_LOG.into()),
                            ..OrderStatusUpdate::default()
                        },
                    )
                    .await?;
                let event = OrderEvent::new(
                    &order.trace_id,
                    &order.order_name,
                    "job_timeout",
                    OrderStatus::Failed.as_str(),
                )
                .with_flow(&order.flow_id)
                .with_run(run_id)
                .with_data(json!({ "order_num": order.order_num }));
                state.put_event(&event).await?;
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::keystore::MemoryKeyStore;
    use crate::notify::NoopNotifier;
    use ordo_kernel::{ExecutionTarget, MemoryArtifactStore, MemoryStateStore, SourceSpec};

    fn order(order_num: &str, status: OrderStatus) -> OrderRecord {
        let now = Utc::now().timestamp();
        OrderRecord {
            run_id: "r1".into(),
            order_num: order_num.to_string(),
            trace_id: "trace".into(),
            flow_id: "ava:trace-exec".into(),
            order_name: format!("order-{order_num}"),
            cmds: vec!["true".into()],
            status,
            queue_id: order_num.to_string(),
            target: ExecutionTarget::Inline { function: None },
            source: SourceSpec::Bundle {
                bundle_location: "ordo+blob://internal/seed".into(),
            },
            bundle_uri: String::new(),
            callback_uri: String::new(),
            key_ref: Some(format!("keys/r1/{order_num}")),
            dependencies: Vec::new(),
            must_succeed: true,
            timeout_s: 30,
            job_deadline: now + 3600,
            created_at: now,
            last_update: now,
            ttl: now + 86_400,
            execution_url: None,
            watchdog_handle: None,
            failure_reason: None,
            log: None,
        }
    }

    struct Fixture {
        state: Arc<MemoryStateStore>,
        internal: MemoryArtifactStore,
        done: MemoryArtifactStore,
        keys: MemoryKeyStore,
    }

    fn fixture() -> Fixture {
        Fixture {
            state: Arc::new(MemoryStateStore::new()),
            internal: MemoryArtifactStore::new("internal"),
            done: MemoryArtifactStore::new("done"),
            keys: MemoryKeyStore::new(),
        }
    }

    #[tokio::test]
    async fn in_progress_run_is_not_finalised() {
        let fx = fixture();
        let orders = vec![
            order("0001", OrderStatus::Succeeded),
            order("0002", OrderStatus::Running),
        ];
        let outcome = check_and_finalize(
            fx.state.as_ref(),
            &fx.internal,
            &fx.done,
            &fx.keys,
            &NoopNotifier,
            "r1",
            &orders,
        )
        .await
        .expect("check");
        assert!(matches!(outcome, FinalizeOutcome::InProgress));
        assert!(!fx.done.exists(&done_key("r1")).await.expect("exists"));
    }

    #[tokio::test]
    async fn all_succeeded_finalises_with_done_marker_and_key_cleanup() {
        let fx = fixture();
        let orders = vec![
            order("0001", OrderStatus::Succeeded),
            order("0002", OrderStatus::Succeeded),
        ];
        fx.keys
            .put("keys/r1/0001", "secret", std::time::Duration::from_secs(60))
            .await
            .expect("put");

        let outcome = check_and_finalize(
            fx.state.as_ref(),
            &fx.internal,
            &fx.done,
            &fx.keys,
            &NoopNotifier,
            "r1",
            &orders,
        )
        .await
        .expect("check");

        match outcome {
            FinalizeOutcome::Finalized(status, summary) => {
                assert_eq!(status, JobStatus::Succeeded);
                assert_eq!(summary.succeeded, 2);
            }
            FinalizeOutcome::InProgress => panic!("expected finalisation"),
        }

        let marker: DoneMarker = serde_json::from_slice(
            &fx.done
                .get(&done_key("r1"))
                .await
                .expect("get")
                .expect("marker"),
        )
        .expect("decode");
        assert_eq!(marker.status, JobStatus::Succeeded);
        assert_eq!(
            fx.keys.get("keys/r1/0001").await.expect("get"),
            None,
            "ephemeral identity should be cleaned up"
        );

        let events = fx
            .state
            .events_for_trace("trace", Some(JOB_ORDER_NAME))
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "job_completed");
    }

    #[tokio::test]
    async fn must_succeed_failure_yields_failed_job() {
        let fx = fixture();
        let orders = vec![
            order("0001", OrderStatus::Failed),
            order("0002", OrderStatus::Failed),
        ];
        let outcome = check_and_finalize(
            fx.state.as_ref(),
            &fx.internal,
            &fx.done,
            &fx.keys,
            &NoopNotifier,
            "r1",
            &orders,
        )
        .await
        .expect("check");
        match outcome {
            FinalizeOutcome::Finalized(status, summary) => {
                assert_eq!(status, JobStatus::Failed);
                assert_eq!(summary.failed, 2);
            }
            FinalizeOutcome::InProgress => panic!("expected finalisation"),
        }
    }

    #[tokio::test]
    async fn tolerated_failures_still_succeed() {
        let fx = fixture();
        let mut tolerated = order("0001", OrderStatus::Failed);
        tolerated.must_succeed = false;
        let orders = vec![tolerated, order("0002", OrderStatus::Succeeded)];
        let outcome = check_and_finalize(
            fx.state.as_ref(),
            &fx.internal,
            &fx.done,
            &fx.keys,
            &NoopNotifier,
            "r1",
            &orders,
        )
        .await
        .expect("check");
        match outcome {
            FinalizeOutcome::Finalized(status, _) => assert_eq!(status, JobStatus::Succeeded),
            FinalizeOutcome::InProgress => panic!("expected finalisation"),
        }
    }

    #[tokio::test]
    async fn expired_run_sweeps_running_and_queued_orders() {
        let fx = fixture();
        let mut running = order("0001", OrderStatus::Running);
        running.job_deadline = Utc::now().timestamp() - 10;
        let mut queued = order("0002", OrderStatus::Queued);
        queued.job_deadline = running.job_deadline;
        fx.state.put_order(&running).await.expect("put");
        fx.state.put_order(&queued).await.expect("put");
        let orders = vec![running, queued];

        let outcome = check_and_finalize(
            fx.state.as_ref(),
            &fx.internal,
            &fx.done,
            &fx.keys,
            &NoopNotifier,
            "r1",
            &orders,
        )
        .await
        .expect("check");
        assert!(matches!(outcome, FinalizeOutcome::InProgress));

        // Running order got a synthetic timed_out callback.
        let synthetic: CallbackResult = serde_json::from_slice(
            &fx.internal
                .get(&result_key("r1", "0001"))
                .await
                .expect("get")
                .expect("synthetic"),
        )
        .expect("decode");
        assert_eq!(synthetic.status, "timed_out");

        // Queued order failed in place.
        let failed = fx
            .state
            .get_order("r1", "0002")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(failed.status, OrderStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("job_timeout"));
    }

    #[tokio::test]
    async fn late_terminal_transitions_mark_job_timed_out() {
        let fx = fixture();
        let deadline = Utc::now().timestamp() - 100;
        let mut a = order("0001", OrderStatus::TimedOut);
        a.job_deadline = deadline;
        a.last_update = deadline + 50;
        let mut b = order("0002", OrderStatus::Succeeded);
        b.job_deadline = deadline;
        b.last_update = deadline - 10;

        let outcome = check_and_finalize(
            fx.state.as_ref(),
            &fx.internal,
            &fx.done,
            &fx.keys,
            &NoopNotifier,
            "r1",
            &[a, b],
        )
        .await
        .expect("check");
        match outcome {
            FinalizeOutcome::Finalized(status, _) => assert_eq!(status, JobStatus::TimedOut),
            FinalizeOutcome::InProgress => panic!("expected finalisation"),
        }
    }
}
