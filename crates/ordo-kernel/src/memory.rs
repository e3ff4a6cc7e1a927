//! In-memory state store: one map per collection, conditional acquire under
//! the write lock.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::KernelError;
use crate::models::{LockRecord, OrderEvent, OrderRecord, OrderStatus};
use crate::state::{LockAcquire, LockRequest, OrderStatusUpdate, StateStore};

/// In-memory [`StateStore`] for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStateStore {
    /// `<run_id>:<order_num>` -> record
    orders: RwLock<HashMap<String, OrderRecord>>,
    /// trace_id -> events ordered by arrival
    events: RwLock<HashMap<String, Vec<OrderEvent>>>,
    /// `lock:<run_id>` -> record
    locks: RwLock<HashMap<String, LockRecord>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(collection: &str) -> KernelError {
    KernelError::State(format!("{collection} lock poisoned"))
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put_order(&self, record: &OrderRecord) -> Result<(), KernelError> {
        let mut orders = self.orders.write().map_err(|_| poisoned("orders"))?;
        orders.insert(record.pk(), record.clone());
        Ok(())
    }

    async fn get_order(
        &self,
        run_id: &str,
        order_num: &str,
    ) -> Result<Option<OrderRecord>, KernelError> {
        let orders = self.orders.read().map_err(|_| poisoned("orders"))?;
        Ok(orders.get(&format!("{run_id}:{order_num}")).cloned())
    }

    async fn orders_for_run(&self, run_id: &str) -> Result<Vec<OrderRecord>, KernelError> {
        let orders = self.orders.read().map_err(|_| poisoned("orders"))?;
        let mut matched: Vec<OrderRecord> = orders
            .values()
            .filter(|o| o.run_id == run_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.order_num.cmp(&b.order_num));
        Ok(matched)
    }

    async fn update_order_status(
        &self,
        run_id: &str,
        order_num: &str,
        status: OrderStatus,
        update: OrderStatusUpdate,
    ) -> Result<(), KernelError> {
        let mut orders = self.orders.write().map_err(|_| poisoned("orders"))?;
        let record = orders
            .get_mut(&format!("{run_id}:{order_num}"))
            .ok_or_else(|| {
                KernelError::State(format!("unknown order {run_id}:{order_num}"))
            })?;
        record.status = status;
        record.last_update = Utc::now().timestamp();
        if let Some(log) = update.log {
            record.log = Some(log);
        }
        if let Some(reason) = update.failure_reason {
            record.failure_reason = Some(reason);
        }
        if let Some(url) = update.execution_url {
            record.execution_url = Some(url);
        }
        if let Some(handle) = update.watchdog_handle {
            record.watchdog_handle = Some(handle);
        }
        Ok(())
    }

    async fn put_event(&self, event: &OrderEvent) -> Result<(), KernelError> {
        let mut events = self.events.write().map_err(|_| poisoned("events"))?;
        events
            .entry(event.trace_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn events_for_trace(
        &self,
        trace_id: &str,
        order_name_prefix: Option<&str>,
    ) -> Result<Vec<OrderEvent>, KernelError> {
        let events = self.events.read().map_err(|_| poisoned("events"))?;
        let mut matched: Vec<OrderEvent> = events
            .get(trace_id)
            .map(|log| {
                log.iter()
                    .filter(|e| match order_name_prefix {
                        Some(prefix) => e.sort_key.starts_with(&format!("{prefix}:")),
                        None => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matched.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
        Ok(matched)
    }

    async fn latest_event(
        &self,
        trace_id: &str,
        order_name: &str,
    ) -> Result<Option<OrderEvent>, KernelError> {
        let matched = self.events_for_trace(trace_id, Some(order_name)).await?;
        Ok(matched.into_iter().max_by_key(|e| e.epoch_ms))
    }

    async fn acquire_lock(&self, request: &LockRequest) -> Result<LockAcquire, KernelError> {
        let mut locks = self.locks.write().map_err(|_| poisoned("locks"))?;
        let now = Utc::now().timestamp();
        let pk = LockRecord::pk(&request.run_id);

        if let Some(existing) = locks.get(&pk) {
            let stealable = existing.state == LockRecord::COMPLETED || existing.expires_at <= now;
            if !stealable {
                return Ok(LockAcquire::Contended);
            }
        }

        locks.insert(
            pk,
            LockRecord {
                run_id: request.run_id.clone(),
                holder_id: request.holder_id.clone(),
                state: LockRecord::ACTIVE.to_string(),
                acquired_at: now,
                expires_at: now + request.ttl_s as i64,
                flow_id: request.flow_id.clone(),
                trace_id: request.trace_id.clone(),
            },
        );
        Ok(LockAcquire::Acquired)
    }

    async fn release_lock(&self, run_id: &str) -> Result<(), KernelError> {
        let mut locks = self.locks.write().map_err(|_| poisoned("locks"))?;
        if let Some(record) = locks.get_mut(&LockRecord::pk(run_id)) {
            record.state = LockRecord::COMPLETED.to_string();
        }
        Ok(())
    }

    async fn get_lock(&self, run_id: &str) -> Result<Option<LockRecord>, KernelError> {
        let locks = self.locks.read().map_err(|_| poisoned("locks"))?;
        Ok(locks.get(&LockRecord::pk(run_id)).cloned())
    }
}
