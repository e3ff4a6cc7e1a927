//! State store contract (C1): orders, events, and per-run locks.

use async_trait::async_trait;

use crate::error::KernelError;
use crate::models::{LockRecord, OrderEvent, OrderRecord, OrderStatus};

/// Outcome of a conditional lock acquisition.
///
/// Contention is the intended "someone else holds it" signal, not an error;
/// the losing orchestrator exits and relies on the next notification to
/// re-enter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockAcquire {
    Acquired,
    Contended,
}

/// Inputs for a lock acquisition.
#[derive(Clone, Debug)]
pub struct LockRequest {
    pub run_id: String,
    pub holder_id: String,
    pub flow_id: String,
    pub trace_id: String,
    /// Lock lifetime in seconds; an expired lock may be stolen.
    pub ttl_s: u64,
}

/// Optional fields applied together with a status update.
#[derive(Clone, Debug, Default)]
pub struct OrderStatusUpdate {
    pub log: Option<String>,
    pub failure_reason: Option<String>,
    pub execution_url: Option<String>,
    pub watchdog_handle: Option<String>,
}

impl OrderStatusUpdate {
    pub fn with_log(log: impl Into<String>) -> Self {
        Self {
            log: Some(log.into()),
            ..Self::default()
        }
    }
}

/// Durable store for orders, events, and per-run locks.
///
/// Constraints every implementation must uphold:
/// - `update_order_status` is unconditional: repeating a terminal update is
///   a no-op, which keeps reconciliation idempotent.
/// - `acquire_lock` is a conditional put: it succeeds only when no record
///   exists, the existing record is `completed`, or the existing record has
///   expired. The condition check and the write are atomic.
/// - Events are append-only; `events_for_trace` returns them in ascending
///   sort-key order.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put_order(&self, record: &OrderRecord) -> Result<(), KernelError>;

    async fn get_order(
        &self,
        run_id: &str,
        order_num: &str,
    ) -> Result<Option<OrderRecord>, KernelError>;

    /// All orders of a run, ordered by `order_num`.
    async fn orders_for_run(&self, run_id: &str) -> Result<Vec<OrderRecord>, KernelError>;

    async fn update_order_status(
        &self,
        run_id: &str,
        order_num: &str,
        status: OrderStatus,
        update: OrderStatusUpdate,
    ) -> Result<(), KernelError>;

    async fn put_event(&self, event: &OrderEvent) -> Result<(), KernelError>;

    /// Events for a trace, optionally restricted to sort keys starting with
    /// `<order_name_prefix>:`.
    async fn events_for_trace(
        &self,
        trace_id: &str,
        order_name_prefix: Option<&str>,
    ) -> Result<Vec<OrderEvent>, KernelError>;

    /// Most recent event for one order of a trace.
    async fn latest_event(
        &self,
        trace_id: &str,
        order_name: &str,
    ) -> Result<Option<OrderEvent>, KernelError>;

    async fn acquire_lock(&self, request: &LockRequest) -> Result<LockAcquire, KernelError>;

    /// Unconditionally marks the lock `completed`.
    async fn release_lock(&self, run_id: &str) -> Result<(), KernelError>;

    async fn get_lock(&self, run_id: &str) -> Result<Option<LockRecord>, KernelError>;
}
