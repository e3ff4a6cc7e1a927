//! Bounded concurrent dispatch of ready orders.
//!
//! Every ready order is handed to the backend, gets a watchdog, and moves
//! to `running` in the state store. A dispatch failure converts that one
//! order to `failed` and never aborts its siblings. The fan-out joins
//! before the caller proceeds to finalisation.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use ordo_kernel::{
    KernelError, OrderEvent, OrderRecord, OrderStatus, OrderStatusUpdate, StateStore,
};

use crate::dispatch::{BackendDispatcher, DispatchRequest};
use crate::watchdog::WatchdogSpawner;

/// Upper bound on a single backend dispatch call.
const DISPATCH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Shared handles a dispatch task needs.
#[derive(Clone)]
pub struct DispatchDeps {
    pub state: Arc<dyn StateStore>,
    pub dispatcher: Arc<dyn BackendDispatcher>,
    pub watchdog: WatchdogSpawner,
}

/// Dispatch all ready orders with bounded parallelism. Returns how many
/// reached `running`.
pub async fn dispatch_ready(
    deps: &DispatchDeps,
    ready: Vec<OrderRecord>,
    fanout: usize,
) -> usize {
    if ready.is_empty() {
        return 0;
    }

    let semaphore = Arc::new(Semaphore::new(fanout.max(1)));
    let mut tasks: JoinSet<Result<bool, KernelError>> = JoinSet::new();
    for order in ready {
        let deps = deps.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| KernelError::Dispatch("fan-out semaphore closed".into()))?;
            dispatch_single(&deps, &order).await
        });
    }

    let mut dispatched = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(true)) => dispatched += 1,
            Ok(Ok(false)) => {}
            Ok(Err(err)) => tracing::warn!(error = %err, "dispatch task failed"),
            Err(err) => tracing::warn!(error = %err, "dispatch task panicked"),
        }
    }
    dispatched
}

/// Dispatch one order. `Ok(true)` means the order is running; `Ok(false)`
/// means the dispatch failed and the order was converted to `failed`.
async fn dispatch_single(deps: &DispatchDeps, order: &OrderRecord) -> Result<bool, KernelError> {
    let request = DispatchRequest::for_order(order);

    let attempt = tokio::time::timeout(DISPATCH_TIMEOUT, deps.dispatcher.dispatch(&request))
        .await
        .unwrap_or_else(|_| {
            Err(KernelError::Dispatch(format!(
                "backend did not answer within {}s",
                DISPATCH_TIMEOUT.as_secs()
            )))
        });
    match attempt {
        Ok(handle) => {
            let dispatched_at = Utc::now();
            let watchdog_handle = deps.watchdog.spawn(
                &order.run_id,
                &order.order_num,
                order.timeout_s,
                dispatched_at,
            );
            deps.state
                .update_order_status(
                    &order.run_id,
                    &order.order_num,
                    OrderStatus::Running,
                    OrderStatusUpdate {
                        execution_url: Some(handle.execution_url.clone()),
                        watchdog_handle: Some(watchdog_handle),
                        ..OrderStatusUpdate::default()
                    },
                )
                .await?;
            let event = OrderEvent::new(
                &order.trace_id,
                &order.order_name,
                "dispatched",
                OrderStatus::Running.as_str(),
            )
            .with_flow(&order.flow_id)
            .with_run(&order.run_id)
            .with_data(json!({
                "order_num": order.order_num,
                "execution_url": handle.execution_url,
            }));
            deps.state.put_event(&event).await?;
            tracing::info!(
                run_id = %order.run_id,
                order_name = %order.order_name,
                target = order.target.as_str(),
                "order dispatched"
            );
            Ok(true)
        }
        Err(err) => {
            tracing::warn!(
                run_id = %order.run_id,
                order_name = %order.order_name,
                error = %err,
                "dispatch failed; converting order to failed"
            );
            deps.state
                .update_order_status(
                    &order.run_id,
                    &order.order_num,
                    OrderStatus::Failed,
                    OrderStatusUpdate {
                        failure_reason: Some("dispatch_failed".into()),
                        log: Some(format!("dispatch error: {err}")),
                        ..OrderStatusUpdate::default()
                    },
                )
                .await?;
            let event = OrderEvent::new(
                &order.trace_id,
                &order.order_name,
                "dispatch_failed",
                OrderStatus::Failed.as_str(),
            )
            .with_flow(&order.flow_id)
            .with_run(&order.run_id)
            .with_data(json!({ "order_num": order.order_num }));
            deps.state.put_event(&event).await?;
            Ok(false)
        }
    }
}
