//! Runtime configuration.
//!
//! Built from the environment at invocation start and passed down
//! explicitly; the process is ephemeral, so nothing is cached globally.

use std::time::Duration;

use ordo_kernel::KernelError;

/// Names, buckets, and tuning knobs for one invocation.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub orders_table: String,
    pub order_events_table: String,
    pub locks_table: String,
    pub internal_bucket: String,
    pub done_bucket: String,
    pub worker_target: String,
    pub watchdog_handle: String,
    pub events_sink: String,
    /// Upper bound on concurrent order dispatches within one invocation.
    pub dispatch_fanout: usize,
    /// Default run-lock lifetime in seconds.
    pub lock_ttl_s: u64,
    /// Watchdog polling period.
    pub watchdog_poll: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            orders_table: "ordo-orders".into(),
            order_events_table: "ordo-order-events".into(),
            locks_table: "ordo-locks".into(),
            internal_bucket: "internal".into(),
            done_bucket: "done".into(),
            worker_target: "ordo-worker".into(),
            watchdog_handle: "ordo-watchdog".into(),
            events_sink: "ordo-events".into(),
            dispatch_fanout: 16,
            lock_ttl_s: 3600,
            watchdog_poll: Duration::from_secs(60),
        }
    }
}

impl RuntimeConfig {
    /// Read the configuration from `ORDO_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, KernelError> {
        let defaults = Self::default();
        let var = |name: &str, fallback: String| -> String {
            std::env::var(name).unwrap_or(fallback)
        };
        let fanout = match std::env::var("ORDO_DISPATCH_FANOUT") {
            Ok(raw) => raw.parse::<usize>().map_err(|_| {
                KernelError::Config(format!("ORDO_DISPATCH_FANOUT is not a number: {raw}"))
            })?,
            Err(_) => defaults.dispatch_fanout,
        };
        if fanout == 0 {
            return Err(KernelError::Config(
                "ORDO_DISPATCH_FANOUT must be at least 1".into(),
            ));
        }
        Ok(Self {
            orders_table: var("ORDO_ORDERS_TABLE", defaults.orders_table),
            order_events_table: var("ORDO_ORDER_EVENTS_TABLE", defaults.order_events_table),
            locks_table: var("ORDO_LOCKS_TABLE", defaults.locks_table),
            internal_bucket: var("ORDO_INTERNAL_BUCKET", defaults.internal_bucket),
            done_bucket: var("ORDO_DONE_BUCKET", defaults.done_bucket),
            worker_target: var("ORDO_WORKER_TARGET", defaults.worker_target),
            watchdog_handle: var("ORDO_WATCHDOG_HANDLE", defaults.watchdog_handle),
            events_sink: var("ORDO_EVENTS_SINK", defaults.events_sink),
            dispatch_fanout: fanout,
            lock_ttl_s: defaults.lock_ttl_s,
            watchdog_poll: defaults.watchdog_poll,
        })
    }
}
