//! Reconciliation: fold callback results from the artifact store into the
//! state store.
//!
//! For every `running` order the run's callback key is probed; a present
//! result moves the order to its terminal status. Repeating the pass on
//! the same inputs yields the same terminal state, so at-least-once
//! notification delivery is safe.

use serde_json::json;

use ordo_kernel::{
    result_key, ArtifactStore, CallbackResult, KernelError, OrderEvent, OrderRecord, OrderStatus,
    OrderStatusUpdate, StateStore,
};

use crate::notify::RunNotifier;

/// Absorb any new callback results into the given orders. Returns the
/// refreshed records.
pub async fn reconcile_run(
    state: &dyn StateStore,
    internal: &dyn ArtifactStore,
    notifier: &dyn RunNotifier,
    run_id: &str,
    mut orders: Vec<OrderRecord>,
) -> Result<Vec<OrderRecord>, KernelError> {
    for order in orders.iter_mut() {
        if order.status != OrderStatus::Running {
            continue;
        }
        let Some(raw) = internal.get(&result_key(run_id, &order.order_num)).await? else {
            continue;
        };

        // A worker writing garbage must not wedge the run.
        let result: CallbackResult = match serde_json::from_slice(&raw) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(
                    run_id,
                    order_num = %order.order_num,
                    error = %err,
                    "malformed callback payload; treating as failed"
                );
                CallbackResult {
                    status: "failed".into(),
                    log: format!("malformed callback payload: {err}"),
                }
            }
        };

        let new_status = result.order_status();
        let log = crate::worker::truncate_log(&result.log);
        let update = if log.is_empty() {
            OrderStatusUpdate::default()
        } else {
            OrderStatusUpdate::with_log(log.clone())
        };
        state
            .update_order_status(run_id, &order.order_num, new_status, update)
            .await?;

        let event = OrderEvent::new(
            &order.trace_id,
            &order.order_name,
            "completed",
            new_status.as_str(),
        )
        .with_flow(&order.flow_id)
        .with_run(run_id)
        .with_data(json!({ "order_num": order.order_num }));
        state.put_event(&event).await?;

        if let Err(err) = notifier
            .order_completed(run_id, &order.order_name, new_status)
            .await
        {
            tracing::warn!(run_id, error = %err, "order completion notification failed");
        }

        order.status = new_status;
        if !log.is_empty() {
            order.log = Some(log);
        }
        tracing::info!(
            run_id,
            order_name = %order.order_name,
            status = %new_status,
            "order reconciled"
        );
    }

    Ok(orders)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::notify::NoopNotifier;
    use ordo_kernel::{ExecutionTarget, MemoryArtifactStore, MemoryStateStore, SourceSpec};

    fn order(run_id: &str, order_num: &str, status: OrderStatus) -> OrderRecord {
        OrderRecord {
            run_id: run_id.to_string(),
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
            key_ref: None,
            dependencies: Vec::new(),
            must_succeed: true,
            timeout_s: 30,
            job_deadline: i64::MAX,
            created_at: 0,
            last_update: 0,
            ttl: 0,
            execution_url: None,
            watchdog_handle: None,
            failure_reason: None,
            log: None,
        }
    }

    #[tokio::test]
    async fn running_order_with_result_becomes_terminal() {
        let state = Arc::new(MemoryStateStore::new());
        let internal = MemoryArtifactStore::new("internal");
        state
            .put_order(&order("r1", "0001", OrderStatus::Running))
            .await
            .expect("put");
        internal
            .put(
                &result_key("r1", "0001"),
                br#"{"status":"succeeded","log":"done"}"#,
            )
            .await
            .expect("put");

        let orders = reconcile_run(
            state.as_ref(),
            &internal,
            &NoopNotifier,
            "r1",
            state.orders_for_run("r1").await.expect("load"),
        )
            .await
            .expect("reconcile");
        assert_eq!(orders[0].status, OrderStatus::Succeeded);

        let stored = state
            .get_order("r1", "0001")
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, OrderStatus::Succeeded);
        assert_eq!(stored.log.as_deref(), Some("done"));

        let events = state
            .events_for_trace("trace", Some("order-0001"))
            .await
            .expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "completed");
    }

    #[tokio::test]
    async fn running_order_without_result_stays_running() {
        let state = Arc::new(MemoryStateStore::new());
        let internal = MemoryArtifactStore::new("internal");
        state
            .put_order(&order("r1", "0001", OrderStatus::Running))
            .await
            .expect("put");

        let orders = reconcile_run(
            state.as_ref(),
            &internal,
            &NoopNotifier,
            "r1",
            state.orders_for_run("r1").await.expect("load"),
        )
            .await
            .expect("reconcile");
        assert_eq!(orders[0].status, OrderStatus::Running);
    }

    #[tokio::test]
    async fn terminal_order_is_not_reopened_by_duplicate_callback() {
        let state = Arc::new(MemoryStateStore::new());
        let internal = MemoryArtifactStore::new("internal");
        state
            .put_order(&order("r1", "0001", OrderStatus::Succeeded))
            .await
            .expect("put");
        internal
            .put(
                &result_key("r1", "0001"),
                br#"{"status":"failed","log":"late duplicate"}"#,
            )
            .await
            .expect("put");

        let orders = reconcile_run(
            state.as_ref(),
            &internal,
            &NoopNotifier,
            "r1",
            state.orders_for_run("r1").await.expect("load"),
        )
            .await
            .expect("reconcile");
        assert_eq!(orders[0].status, OrderStatus::Succeeded);
    }

    #[tokio::test]
    async fn malformed_callback_fails_the_order() {
        let state = Arc::new(MemoryStateStore::new());
        let internal = MemoryArtifactStore::new("internal");
        state
            .put_order(&order("r1", "0001", OrderStatus::Running))
            .await
            .expect("put");
        internal
            .put(&result_key("r1", "0001"), b"not json")
            .await
            .expect("put");

        let orders = reconcile_run(
            state.as_ref(),
            &internal,
            &NoopNotifier,
            "r1",
            state.orders_for_run("r1").await.expect("load"),
        )
            .await
            .expect("reconcile");
        assert_eq!(orders[0].status, OrderStatus::Failed);
    }
}
