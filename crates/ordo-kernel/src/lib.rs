//! Core of the ordo orchestration kernel.
//!
//! Data model (orders, events, locks, callback payloads), wire descriptors,
//! and the state-store (C1) / artifact-store (C2) contracts with in-memory,
//! SQLite, and filesystem implementations.

pub mod artifact;
pub mod descriptor;
pub mod error;
pub mod identity;
pub mod memory;
pub mod models;
pub mod retry;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite;
pub mod state;

pub use artifact::{
    done_key, exec_key, is_result_key, parse_blob_uri, parse_put_token, parse_result_key,
    result_key, ArtifactStore, FsArtifactStore, MemoryArtifactStore, NotificationSink, PutToken,
    START_ORDER_NUM,
};
pub use descriptor::{JobSpec, OrderSpec, SourceSpec};
pub use error::KernelError;
pub use identity::{
    flow_id, format_order_num, new_holder_id, new_run_id, new_trace_id, parse_flow_id, trace_leg,
};
pub use memory::MemoryStateStore;
pub use models::{
    CallbackResult, DoneMarker, ExecutionTarget, JobStatus, LockRecord, OrderEvent, OrderRecord,
    OrderStatus, RunSummary, JOB_ORDER_NAME,
};
pub use retry::RetryPolicy;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite::SqliteStateStore;
pub use state::{LockAcquire, LockRequest, OrderStatusUpdate, StateStore};
