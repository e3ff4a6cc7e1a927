//! Domain records for orders, events, locks, and run outcomes.
//!
//! Order status transitions are strictly monotone: `queued -> running ->
//! {succeeded | failed | timed_out}` and no order ever leaves a terminal
//! state. The aggregate run status is derived solely from order statuses.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::SourceSpec;

/// Reserved order name for job-level events.
pub const JOB_ORDER_NAME: &str = "_job";

/// Lifecycle state of a single order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    /// Terminal statuses are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate outcome of a run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution backend for an order, carrying target-specific fields.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExecutionTarget {
    /// In-process worker function.
    Inline {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        function: Option<String>,
    },
    /// Long-running containerised runner.
    Container {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project: Option<String>,
    },
    /// Remote-agent command channel addressing a named fleet.
    RemoteAgent {
        targets: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_ref: Option<String>,
    },
}

impl ExecutionTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline { .. } => "inline",
            Self::Container { .. } => "container",
            Self::RemoteAgent { .. } => "remote-agent",
        }
    }
}

/// Persisted order record, keyed by `(run_id, order_num)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderRecord {
    pub run_id: String,
    pub order_num: String,
    pub trace_id: String,
    pub flow_id: String,
    pub order_name: String,
    pub cmds: Vec<String>,
    pub status: OrderStatus,
    /// Serialisation class; defaults to `order_num` so each order only
    /// serialises with itself.
    pub queue_id: String,
    pub target: ExecutionTarget,
    pub source: SourceSpec,
    pub bundle_uri: String,
    pub callback_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_ref: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub must_succeed: bool,
    pub timeout_s: u64,
    /// Epoch seconds after which the whole run is considered timed out.
    pub job_deadline: i64,
    pub created_at: i64,
    pub last_update: i64,
    /// Epoch seconds after which the record may be expired by the store.
    pub ttl: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl OrderRecord {
    /// Primary key: `<run_id>:<order_num>`.
    pub fn pk(&self) -> String {
        format!("{}:{}", self.run_id, self.order_num)
    }
}

/// Append-only audit event, keyed by `(trace_id, "<order_name>:<epoch_ms>")`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderEvent {
    pub trace_id: String,
    pub sort_key: String,
    pub order_name: String,
    pub epoch_ms: i64,
    pub event_type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Nested payload; format is opaque to the kernel.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl OrderEvent {
    pub fn new(trace_id: &str, order_name: &str, event_type: &str, status: &str) -> Self {
        let epoch_ms = Utc::now().timestamp_millis();
        Self {
            trace_id: trace_id.to_string(),
            sort_key: format!("{order_name}:{epoch_ms}"),
            order_name: order_name.to_string(),
            epoch_ms,
            event_type: event_type.to_string(),
            status: status.to_string(),
            flow_id: None,
            run_id: None,
            data: Value::Null,
        }
    }

    pub fn with_flow(mut self, flow_id: &str) -> Self {
        self.flow_id = Some(flow_id.to_string());
        self
    }

    pub fn with_run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Per-run mutual-exclusion record, keyed by `lock:<run_id>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRecord {
    pub run_id: String,
    pub holder_id: String,
    pub state: String,
    pub acquired_at: i64,
    /// Epoch seconds after which the lock may be stolen by a new acquirer.
    pub expires_at: i64,
    pub flow_id: String,
    pub trace_id: String,
}

impl LockRecord {
    pub const ACTIVE: &'static str = "active";
    pub const COMPLETED: &'static str = "completed";

    pub fn pk(run_id: &str) -> String {
        format!("lock:{run_id}")
    }
}

/// Result payload written by a worker or the watchdog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallbackResult {
    pub status: String,
    #[serde(default)]
    pub log: String,
}

impl CallbackResult {
    /// Map the reported status onto an order status. Anything unrecognised
    /// is treated as a failure so a worker bug cannot wedge the run.
    pub fn order_status(&self) -> OrderStatus {
        match self.status.as_str() {
            "succeeded" => OrderStatus::Succeeded,
            "timed_out" => OrderStatus::TimedOut,
            _ => OrderStatus::Failed,
        }
    }
}

/// Per-status order counts reported in the done marker.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: u32,
    pub failed: u32,
    pub timed_out: u32,
}

impl RunSummary {
    pub fn tally(orders: &[OrderRecord]) -> Self {
        let mut summary = Self::default();
        for order in orders {
            match order.status {
                OrderStatus::Succeeded => summary.succeeded += 1,
                OrderStatus::Failed => summary.failed += 1,
                OrderStatus::TimedOut => summary.timed_out += 1,
                OrderStatus::Queued | OrderStatus::Running => {}
            }
        }
        summary
    }
}

/// Finalisation marker written to the done root when all orders are terminal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DoneMarker {
    pub status: JobStatus,
    pub summary: RunSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!OrderStatus::Queued.is_terminal());
        assert!(!OrderStatus::Running.is_terminal());
        assert!(OrderStatus::Succeeded.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::TimedOut.is_terminal());
    }

    #[test]
    fn status_serialises_snake_case() {
        let json = serde_json::to_string(&OrderStatus::TimedOut).expect("serialise");
        assert_eq!(json, "\"timed_out\"");
    }

    #[test]
    fn execution_target_tags_by_kind() {
        let target = ExecutionTarget::RemoteAgent {
            targets: vec!["fleet-a".into()],
            document_ref: None,
        };
        let json = serde_json::to_value(&target).expect("serialise");
        assert_eq!(json["kind"], "remote-agent");
        assert_eq!(json["targets"][0], "fleet-a");
    }

    #[test]
    fn callback_result_maps_unknown_status_to_failed() {
        let result = CallbackResult {
            status: "exploded".into(),
            log: String::new(),
        };
        assert_eq!(result.order_status(), OrderStatus::Failed);
    }

    #[test]
    fn event_sort_key_embeds_name_and_epoch() {
        let event = OrderEvent::new("trace", "build", "dispatched", "running");
        assert!(event.sort_key.starts_with("build:"));
        let epoch: i64 = event
            .sort_key
            .split_once(':')
            .expect("separator")
            .1
            .parse()
            .expect("epoch");
        assert_eq!(epoch, event.epoch_ms);
    }
}
