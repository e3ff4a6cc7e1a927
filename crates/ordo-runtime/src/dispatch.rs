//! Backend dispatch port.
//!
//! The orchestrator hands ready orders to a [`BackendDispatcher`]; the three
//! execution targets are functionally identical from the kernel's standpoint
//! (all honour the callback contract). Dispatch must be idempotent on
//! `client_request_id` so a replayed invocation is absorbed by the backend.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use ordo_kernel::{ExecutionTarget, KernelError, OrderRecord};

/// Deterministic idempotency key for a dispatch, derived from
/// `(run_id, order_num)` alone so replays collide with the original.
pub fn client_request_id(run_id: &str, order_num: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(b":");
    hasher.update(order_num.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Everything a backend needs to start one order.
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    pub run_id: String,
    pub order_num: String,
    pub order_name: String,
    pub target: ExecutionTarget,
    pub cmds: Vec<String>,
    pub bundle_uri: String,
    pub callback_uri: String,
    pub key_ref: Option<String>,
    pub timeout_s: u64,
    pub client_request_id: String,
}

impl DispatchRequest {
    pub fn for_order(order: &OrderRecord) -> Self {
        Self {
            run_id: order.run_id.clone(),
            order_num: order.order_num.clone(),
            order_name: order.order_name.clone(),
            target: order.target.clone(),
            cmds: order.cmds.clone(),
            bundle_uri: order.bundle_uri.clone(),
            callback_uri: order.callback_uri.clone(),
            key_ref: order.key_ref.clone(),
            timeout_s: order.timeout_s,
            client_request_id: client_request_id(&order.run_id, &order.order_num),
        }
    }
}

/// Opaque handle returned by a backend for a started execution.
#[derive(Clone, Debug)]
pub struct DispatchHandle {
    pub execution_url: String,
}

/// Execution backend port. Implementations must absorb duplicate requests
/// carrying the same `client_request_id`.
#[async_trait]
pub trait BackendDispatcher: Send + Sync {
    async fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchHandle, KernelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_request_id_is_deterministic() {
        let a = client_request_id("run-1", "0001");
        let b = client_request_id("run-1", "0001");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, client_request_id("run-1", "0002"));
        assert_ne!(a, client_request_id("run-2", "0001"));
    }
}
