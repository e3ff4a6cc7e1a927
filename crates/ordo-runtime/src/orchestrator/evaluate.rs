//! Dependency evaluation: classify queued orders into ready, doomed, and
//! waiting.
//!
//! Rules:
//! - `ready`: no dependencies, or every dependency terminal and permitting
//!   (succeeded, or any terminal state when the dependency is not
//!   `must_succeed`).
//! - `doomed`: at least one `must_succeed` dependency ended `failed` or
//!   `timed_out`.
//! - `waiting`: some dependency still `queued`/`running`, or the order's
//!   `queue_id` already has a running occupant.
//!
//! At most one order per `queue_id` may run at a time; extra ready orders
//! with a busy queue are held in `waiting`.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use ordo_kernel::{OrderRecord, OrderStatus};

/// Classification of all queued orders for one orchestrator tick.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub ready: Vec<OrderRecord>,
    /// Doomed orders, each with the synthetic failure log line.
    pub doomed: Vec<(OrderRecord, String)>,
    pub waiting: Vec<OrderRecord>,
}

pub fn evaluate_orders(orders: &[OrderRecord]) -> Evaluation {
    let by_name: HashMap<&str, &OrderRecord> = orders
        .iter()
        .map(|o| (o.order_name.as_str(), o))
        .collect();

    let mut busy_queues: HashSet<&str> = orders
        .iter()
        .filter(|o| o.status == OrderStatus::Running)
        .map(|o| o.queue_id.as_str())
        .collect();

    let mut evaluation = Evaluation::default();

    for order in orders {
        if order.status != OrderStatus::Queued {
            continue;
        }

        let mut doom_reason = None;
        let mut dep_pending = false;
        for dep_name in &order.dependencies {
            let Some(dep) = by_name.get(dep_name.as_str()) else {
                // Admission validates sibling references; treat an unknown
                // name as still pending rather than inventing an outcome.
                warn!(
                    order = %order.order_name,
                    dependency = %dep_name,
                    "dependency missing from run; holding order"
                );
                dep_pending = true;
                continue;
            };
            match dep.status {
                OrderStatus::Succeeded => {}
                OrderStatus::Failed | OrderStatus::TimedOut if dep.must_succeed => {
                    doom_reason =
                        Some(format!("dependency {dep_name} ended as {}", dep.status));
                    break;
                }
                // A non-must_succeed dependency permits downstream dispatch
                // in any terminal state.
                OrderStatus::Failed | OrderStatus::TimedOut => {}
                OrderStatus::Queued | OrderStatus::Running => dep_pending = true,
            }
        }

        if let Some(reason) = doom_reason {
            evaluation.doomed.push((order.clone(), reason));
        } else if dep_pending {
            evaluation.waiting.push(order.clone());
        } else if busy_queues.contains(order.queue_id.as_str()) {
            evaluation.waiting.push(order.clone());
        } else {
            busy_queues.insert(order.queue_id.as_str());
            evaluation.ready.push(order.clone());
        }
    }

    evaluation
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_kernel::{ExecutionTarget, SourceSpec};

    fn order(name: &str, status: OrderStatus, deps: &[&str]) -> OrderRecord {
        OrderRecord {
            run_id: "r1".into(),
            order_num: format!("{:04}", 0),
            trace_id: "trace".into(),
            flow_id: "ava:trace-exec".into(),
            order_name: name.to_string(),
            cmds: vec!["true".into()],
            status,
            queue_id: name.to_string(),
            target: ExecutionTarget::Inline { function: None },
            source: SourceSpec::Bundle {
                bundle_location: "ordo+blob://internal/seed".into(),
            },
            bundle_uri: String::new(),
            callback_uri: String::new(),
            key_ref: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            must_succeed: true,
            timeout_s: 30,
            job_deadline: 0,
            created_at: 0,
            last_update: 0,
            ttl: 0,
            execution_url: None,
            watchdog_handle: None,
            failure_reason: None,
            log: None,
        }
    }

    fn names(records: &[OrderRecord]) -> Vec<&str> {
        records.iter().map(|o| o.order_name.as_str()).collect()
    }

    #[test]
    fn independent_orders_are_ready() {
        let orders = vec![
            order("a", OrderStatus::Queued, &[]),
            order("b", OrderStatus::Queued, &[]),
        ];
        let eval = evaluate_orders(&orders);
        assert_eq!(names(&eval.ready), vec!["a", "b"]);
        assert!(eval.doomed.is_empty());
        assert!(eval.waiting.is_empty());
    }

    #[test]
    fn waits_on_running_dependency() {
        let orders = vec![
            order("a", OrderStatus::Running, &[]),
            order("b", OrderStatus::Queued, &["a"]),
        ];
        let eval = evaluate_orders(&orders);
        assert!(eval.ready.is_empty());
        assert_eq!(names(&eval.waiting), vec!["b"]);
    }

    #[test]
    fn ready_once_all_dependencies_succeeded() {
        let orders = vec![
            order("a", OrderStatus::Succeeded, &[]),
            order("b", OrderStatus::Succeeded, &[]),
            order("c", OrderStatus::Queued, &["a", "b"]),
        ];
        let eval = evaluate_orders(&orders);
        assert_eq!(names(&eval.ready), vec!["c"]);
    }

    #[test]
    fn must_succeed_failure_dooms_dependent() {
        let orders = vec![
            order("a", OrderStatus::Failed, &[]),
            order("b", OrderStatus::Queued, &["a"]),
        ];
        let eval = evaluate_orders(&orders);
        assert!(eval.ready.is_empty());
        assert_eq!(eval.doomed.len(), 1);
        assert_eq!(eval.doomed[0].0.order_name, "b");
        assert_eq!(eval.doomed[0].1, "dependency a ended as failed");
    }

    #[test]
    fn timed_out_dependency_dooms_with_status_in_reason() {
        let orders = vec![
            order("a", OrderStatus::TimedOut, &[]),
            order("b", OrderStatus::Queued, &["a"]),
        ];
        let eval = evaluate_orders(&orders);
        assert_eq!(eval.doomed[0].1, "dependency a ended as timed_out");
    }

    #[test]
    fn tolerated_failure_permits_dependent() {
        let mut tolerated = order("a", OrderStatus::Failed, &[]);
        tolerated.must_succeed = false;
        let orders = vec![tolerated, order("b", OrderStatus::Queued, &["a"])];
        let eval = evaluate_orders(&orders);
        assert_eq!(names(&eval.ready), vec!["b"]);
        assert!(eval.doomed.is_empty());
    }

    #[test]
    fn queue_id_serialises_ready_orders() {
        let mut a = order("a", OrderStatus::Queued, &[]);
        a.queue_id = "q1".into();
        let mut b = order("b", OrderStatus::Queued, &[]);
        b.queue_id = "q1".into();
        let eval = evaluate_orders(&[a, b]);
        assert_eq!(names(&eval.ready), vec!["a"]);
        assert_eq!(names(&eval.waiting), vec!["b"]);
    }

    #[test]
    fn queue_id_blocked_by_running_occupant() {
        let mut running = order("a", OrderStatus::Running, &[]);
        running.queue_id = "q1".into();
        let mut queued = order("b", OrderStatus::Queued, &[]);
        queued.queue_id = "q1".into();
        let eval = evaluate_orders(&[running, queued]);
        assert!(eval.ready.is_empty());
        assert_eq!(names(&eval.waiting), vec!["b"]);
    }

    #[test]
    fn doom_wins_over_pending_dependencies() {
        let orders = vec![
            order("a", OrderStatus::Failed, &[]),
            order("b", OrderStatus::Running, &[]),
            order("c", OrderStatus::Queued, &["a", "b"]),
        ];
        let eval = evaluate_orders(&orders);
        assert_eq!(eval.doomed.len(), 1);
        assert!(eval.waiting.is_empty());
    }
}
