//! Run identity helpers.
//!
//! A run is identified by an opaque `run_id`; all legs of a run share a short
//! `trace_id`, and observers see a `flow_id` of the form
//! `<username>:<trace_id>-<flow_label>`.

use chrono::Utc;

/// Generate a fresh opaque run id.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate the random token identifying the orchestrator invocation that
/// currently holds a run lock.
pub fn new_holder_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Generate a short random hex trace id (8 chars) shared by all legs of a run.
pub fn new_trace_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Zero-pad a 1-based order position into its order number (`1` -> `"0001"`).
pub fn format_order_num(position: usize) -> String {
    format!("{position:04}")
}

/// Build a flow id: `<username>:<trace_id>-<flow_label>`.
pub fn flow_id(username: &str, trace_id: &str, flow_label: &str) -> String {
    format!("{username}:{trace_id}-{flow_label}")
}

/// Split a flow id back into `(username, trace_id, flow_label)`.
pub fn parse_flow_id(flow: &str) -> Option<(&str, &str, &str)> {
    let (username, rest) = flow.split_once(':')?;
    let (trace_id, label) = rest.rsplit_once('-')?;
    Some((username, trace_id, label))
}

/// A trace leg: `<trace_id>:<epoch_seconds>`.
pub fn trace_leg(trace_id: &str) -> String {
    format!("{trace_id}:{}", Utc::now().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_num_is_zero_padded() {
        assert_eq!(format_order_num(1), "0001");
        assert_eq!(format_order_num(42), "0042");
        assert_eq!(format_order_num(12345), "12345");
    }

    #[test]
    fn flow_id_round_trips() {
        let flow = flow_id("ava", "deadbeef", "exec");
        assert_eq!(flow, "ava:deadbeef-exec");
        assert_eq!(parse_flow_id(&flow), Some(("ava", "deadbeef", "exec")));
    }

    #[test]
    fn flow_id_with_dashes_in_trace_splits_on_last_dash() {
        assert_eq!(
            parse_flow_id("ava:dead-beef-exec"),
            Some(("ava", "dead-beef", "exec"))
        );
    }

    #[test]
    fn trace_ids_are_short_hex() {
        let trace = new_trace_id();
        assert_eq!(trace.len(), 8);
        assert!(trace.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(new_run_id(), new_run_id());
    }
}
