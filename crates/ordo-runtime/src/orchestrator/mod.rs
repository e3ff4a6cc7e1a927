//! Event-driven orchestrator (C4).
//!
//! One invocation per callback notification: acquire the run's exclusive
//! lock, reconcile results, evaluate the dependency graph, dispatch ready
//! orders, finalise when everything is terminal, release. A losing
//! invocation exits immediately — every completion produces a fresh
//! notification, so the notification stream is the queue and work never
//! accumulates anywhere else.

pub mod dispatch;
pub mod evaluate;
pub mod finalize;
pub mod reconcile;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use ordo_kernel::{
    new_holder_id, parse_result_key, ArtifactStore, JobStatus, KernelError, LockAcquire,
    LockRequest, OrderEvent, OrderStatus, OrderStatusUpdate, StateStore, JOB_ORDER_NAME,
};

use crate::config::RuntimeConfig;
use crate::credentials::CredentialSource;
use crate::dispatch::BackendDispatcher;
use crate::keystore::KeyStore;
use crate::notify::{NoopNotifier, PrTarget, RunNotifier, VcsNotifier};
use crate::vcs::VcsProvider;
use crate::watchdog::{WatchdogConfig, WatchdogSpawner};

use self::dispatch::{dispatch_ready, DispatchDeps};
use self::evaluate::evaluate_orders;
use self::finalize::{check_and_finalize, FinalizeOutcome};
use self::reconcile::reconcile_run;

/// What one orchestrator invocation did.
#[derive(Debug)]
pub enum TickOutcome {
    /// Another invocation holds the run lock; nothing was touched.
    Skipped,
    /// The run has no orders (stale or unknown notification).
    NoOrders,
    /// The run advanced but is not yet terminal.
    Progress {
        dispatched: usize,
        doomed: usize,
        waiting: usize,
    },
    Finalized(JobStatus),
}

/// The orchestrator and its collaborator ports.
pub struct Orchestrator {
    state: Arc<dyn StateStore>,
    internal: Arc<dyn ArtifactStore>,
    done: Arc<dyn ArtifactStore>,
    dispatcher: Arc<dyn BackendDispatcher>,
    credentials: Arc<dyn CredentialSource>,
    keys: Arc<dyn KeyStore>,
    vcs: Option<Arc<dyn VcsProvider>>,
    watchdog: WatchdogSpawner,
    config: RuntimeConfig,
}

impl Orchestrator {
    pub fn new(
        state: Arc<dyn StateStore>,
        internal: Arc<dyn ArtifactStore>,
        done: Arc<dyn ArtifactStore>,
        dispatcher: Arc<dyn BackendDispatcher>,
        credentials: Arc<dyn CredentialSource>,
        keys: Arc<dyn KeyStore>,
        config: RuntimeConfig,
    ) -> Self {
        let watchdog = WatchdogSpawner::new(
            internal.clone(),
            WatchdogConfig {
                poll_interval: config.watchdog_poll,
            },
        );
        Self {
            state,
            internal,
            done,
            dispatcher,
            credentials,
            keys,
            vcs: None,
            watchdog,
            config,
        }
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VcsProvider>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    /// Entry point for a callback notification carrying the object key.
    pub async fn handle_notification(&self, key: &str) -> Result<TickOutcome, KernelError> {
        let Some((run_id, order_num)) = parse_result_key(key) else {
            return Err(KernelError::Notification(format!(
                "object key does not match callbacks/<run_id>/<order_num>/result: {key}"
            )));
        };
        tracing::debug!(run_id, order_num, "notification received");
        let run_id = run_id.to_string();
        self.handle_run(&run_id).await
    }

    /// Run one orchestration tick for a run, guarded by the run lock.
    pub async fn handle_run(&self, run_id: &str) -> Result<TickOutcome, KernelError> {
        let holder_id = new_holder_id();
        let acquired = self
            .state
            .acquire_lock(&LockRequest {
                run_id: run_id.to_string(),
                holder_id,
                // Flow and trace are read from the orders inside the tick.
                flow_id: String::new(),
                trace_id: String::new(),
                ttl_s: self.config.lock_ttl_s,
            })
            .await?;
        if acquired == LockAcquire::Contended {
            tracing::info!(run_id, "lock contended; another orchestrator is handling this run");
            return Ok(TickOutcome::Skipped);
        }

        let result = self.tick(run_id).await;

        if let Err(err) = self.state.release_lock(run_id).await {
            tracing::warn!(run_id, error = %err, "lock release failed; TTL will expire it");
        }
        result
    }

    async fn tick(&self, run_id: &str) -> Result<TickOutcome, KernelError> {
        let orders = self.state.orders_for_run(run_id).await?;
        if orders.is_empty() {
            tracing::warn!(run_id, "no orders found for run");
            return Ok(TickOutcome::NoOrders);
        }
        let trace_id = orders[0].trace_id.clone();
        let notifier = self.run_notifier(&trace_id).await;

        // Step 2: reconcile completed results.
        let orders = reconcile_run(
            self.state.as_ref(),
            self.internal.as_ref(),
            notifier.as_ref(),
            run_id,
            orders,
        )
        .await?;

        // Step 3: evaluate the dependency graph.
        let evaluation = evaluate_orders(&orders);
        let doomed = evaluation.doomed.len();
        let waiting = evaluation.waiting.len();
        for (order, reason) in &evaluation.doomed {
            self.doom_order(run_id, order, reason, notifier.as_ref())
                .await?;
        }

        // Step 4: dispatch ready orders, unless the job deadline already
        // passed (the finalisation sweep then terminates the run).
        let deadline = orders.iter().map(|o| o.job_deadline).min().unwrap_or(0);
        let dispatched = if Utc::now().timestamp() > deadline {
            0
        } else {
            let deps = DispatchDeps {
                state: self.state.clone(),
                dispatcher: self.dispatcher.clone(),
                watchdog: self.watchdog.clone(),
            };
            dispatch_ready(&deps, evaluation.ready, self.config.dispatch_fanout).await
        };

        // Step 5: finalisation check on fresh state.
        let orders = self.state.orders_for_run(run_id).await?;
        let outcome = check_and_finalize(
            self.state.as_ref(),
            self.internal.as_ref(),
            self.done.as_ref(),
            self.keys.as_ref(),
            notifier.as_ref(),
            run_id,
            &orders,
        )
        .await?;

        Ok(match outcome {
            FinalizeOutcome::Finalized(status, _) => TickOutcome::Finalized(status),
            FinalizeOutcome::InProgress => TickOutcome::Progress {
                dispatched,
                doomed,
                waiting,
            },
        })
    }

    async fn doom_order(
        &self,
        run_id: &str,
        order: &ordo_kernel::OrderRecord,
        reason: &str,
        notifier: &dyn RunNotifier,
    ) -> Result<(), KernelError> {
        self.state
            .update_order_status(
                run_id,
                &order.order_num,
                OrderStatus::Failed,
                OrderStatusUpdate {
                    failure_reason: Some("dependency_failed".into()),
                    log: Some(reason.to_string()),
                    ..OrderStatusUpdate::default()
                },
            )
            .await?;
        let event = OrderEvent::new(
            &order.trace_id,
            &order.order_name,
            "dependency_failed",
            OrderStatus::Failed.as_str(),
        )
        .with_flow(&order.flow_id)
        .with_run(run_id)
        .with_data(json!({ "order_num": order.order_num, "reason": reason }));
        self.state.put_event(&event).await?;

        if let Err(err) = notifier
            .order_completed(run_id, &order.order_name, OrderStatus::Failed)
            .await
        {
            tracing::warn!(run_id, error = %err, "doomed-order notification failed");
        }
        tracing::info!(
            run_id,
            order_name = %order.order_name,
            reason,
            "order doomed by failed dependency"
        );
        Ok(())
    }

    /// Build the PR notifier for this run from the job-started event, when
    /// a VCS provider is configured and the job carried a PR reference.
    async fn run_notifier(&self, trace_id: &str) -> Arc<dyn RunNotifier> {
        let Some(vcs) = self.vcs.clone() else {
            return Arc::new(NoopNotifier);
        };
        let events = match self
            .state
            .events_for_trace(trace_id, Some(JOB_ORDER_NAME))
            .await
        {
            Ok(events) => events,
            Err(err) => {
                tracing::warn!(trace_id, error = %err, "job event lookup failed");
                return Arc::new(NoopNotifier);
            }
        };
        let Some(started) = events.iter().find(|e| e.event_type == "job_started") else {
            return Arc::new(NoopNotifier);
        };
        let Some(tag) = started.data["pr_search_tag"].as_str() else {
            return Arc::new(NoopNotifier);
        };
        match PrTarget::from_reference(&started.data["pr_reference"], tag) {
            Some(target) => Arc::new(VcsNotifier::new(vcs, self.credentials.clone(), target)),
            None => Arc::new(NoopNotifier),
        }
    }
}
