//! Job validation: structured errors, typed orders, dependency DAG checks.
//!
//! Validation never panics or throws — it returns the full list of problems
//! (or the first batch in fail-fast mode) so the submitter gets one
//! structured 400 instead of a serde backtrace. A job with any invalid
//! order is rejected whole; nothing is persisted.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use serde::Serialize;

use ordo_kernel::{format_order_num, ExecutionTarget, JobSpec, OrderSpec, SourceSpec};

/// One validation problem, attributed to an order where possible.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ValidationError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
    pub message: String,
}

impl ValidationError {
    fn job(message: impl Into<String>) -> Self {
        Self {
            order: None,
            message: message.into(),
        }
    }

    fn order(label: &str, message: impl Into<String>) -> Self {
        Self {
            order: Some(label.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.order {
            Some(order) => write!(f, "{order}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// A fully validated order, ready for packaging.
#[derive(Clone, Debug)]
pub struct ValidatedOrder {
    pub order_num: String,
    pub order_name: String,
    pub target: ExecutionTarget,
    pub cmds: Vec<String>,
    pub timeout_s: u64,
    pub must_succeed: bool,
    pub dependencies: Vec<String>,
    pub queue_id: String,
    pub env_vars: BTreeMap<String, String>,
    pub config_paths: Vec<String>,
    pub secret_paths: Vec<String>,
    pub source: SourceSpec,
}

/// The validated job: typed orders in submission sequence.
#[derive(Clone, Debug)]
pub struct ValidatedJob {
    pub orders: Vec<ValidatedOrder>,
}

fn resolve_target(spec: &OrderSpec, label: &str, errors: &mut Vec<ValidationError>) -> Option<ExecutionTarget> {
    let named = match spec.execution_target.as_deref() {
        Some("inline") => Some(ExecutionTarget::Inline {
            function: spec.function.clone(),
        }),
        Some("container") => Some(ExecutionTarget::Container {
            project: spec.project.clone(),
        }),
        Some("remote-agent") => {
            if spec.targets.is_empty() {
                errors.push(ValidationError::order(
                    label,
                    "remote-agent orders need at least one target",
                ));
                return None;
            }
            Some(ExecutionTarget::RemoteAgent {
                targets: spec.targets.clone(),
                document_ref: spec.document_ref.clone(),
            })
        }
        Some(other) => {
            errors.push(ValidationError::order(
                label,
                format!(
                    "invalid execution_target '{other}' (must be one of container, inline, remote-agent)"
                ),
            ));
            return None;
        }
        // Legacy mapping, only consulted when execution_target is absent.
        None => match spec.use_lambda {
            Some(true) => Some(ExecutionTarget::Inline {
                function: spec.function.clone(),
            }),
            Some(false) => Some(ExecutionTarget::Container {
                project: spec.project.clone(),
            }),
            None => None,
        },
    };
    match named {
        Some(target) => Some(target),
        None => {
            errors.push(ValidationError::order(label, "execution_target is missing"));
            None
        }
    }
}

/// Validate every order of a job and type them.
///
/// `fail_fast` stops after the first order with problems (the admission
/// default); accumulating mode is for tests that want the complete list.
pub fn validate_job(job: &JobSpec, fail_fast: bool) -> Result<ValidatedJob, Vec<ValidationError>> {
    if job.username.trim().is_empty() {
        return Err(vec![ValidationError::job("username is missing")]);
    }
    if job.orders.is_empty() {
        return Err(vec![ValidationError::job("job has no orders")]);
    }
    if job.job_timeout_s == 0 {
        return Err(vec![ValidationError::job(
            "job_timeout_s is missing or not positive",
        )]);
    }

    let mut errors = Vec::new();
    let mut orders = Vec::with_capacity(job.orders.len());

    for (index, spec) in job.orders.iter().enumerate() {
        let order_num = format_order_num(index + 1);
        let order_name = spec
            .order_name
            .clone()
            .unwrap_or_else(|| format!("order-{order_num}"));
        let label = order_name.clone();
        let before = errors.len();

        if spec.cmds.is_empty() || spec.cmds.iter().any(|c| c.trim().is_empty()) {
            errors.push(ValidationError::order(&label, "cmds is empty or missing"));
        }
        if spec.timeout_s == 0 {
            errors.push(ValidationError::order(
                &label,
                "timeout_s is missing or not positive",
            ));
        }

        let target = resolve_target(spec, &label, &mut errors);

        let source = match &spec.source {
            Some(source) => Some(source.clone()),
            None => {
                errors.push(ValidationError::order(
                    &label,
                    "no code source (need bundle_location or repo + token_ref)",
                ));
                None
            }
        };

        if errors.len() > before && fail_fast {
            return Err(errors);
        }

        if let (Some(target), Some(source)) = (target, source) {
            let queue_id = spec.queue_id.clone().unwrap_or_else(|| order_num.clone());
            orders.push(ValidatedOrder {
                order_num,
                order_name,
                target,
                cmds: spec.cmds.clone(),
                timeout_s: spec.timeout_s,
                must_succeed: spec.must_succeed,
                dependencies: spec.dependencies.clone(),
                queue_id,
                env_vars: spec.env_vars.clone(),
                config_paths: spec.config_paths.clone(),
                secret_paths: spec.secret_paths.clone(),
                source,
            });
        }
    }

    if errors.is_empty() {
        validate_dependencies(&orders, &mut errors);
    }

    if errors.is_empty() {
        Ok(ValidatedJob { orders })
    } else {
        Err(errors)
    }
}

/// Dependency names must reference sibling orders, names must be unique,
/// and the graph must be acyclic.
fn validate_dependencies(orders: &[ValidatedOrder], errors: &mut Vec<ValidationError>) {
    let mut by_name: HashMap<&str, usize> = HashMap::new();
    for (index, order) in orders.iter().enumerate() {
        if by_name.insert(order.order_name.as_str(), index).is_some() {
            errors.push(ValidationError::order(
                &order.order_name,
                "duplicate order_name within the job",
            ));
        }
    }
    if !errors.is_empty() {
        return;
    }

    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for index in 0..orders.len() {
        graph.add_node(index);
    }
    for (index, order) in orders.iter().enumerate() {
        for dep in &order.dependencies {
            if dep == &order.order_name {
                errors.push(ValidationError::order(
                    &order.order_name,
                    "order cannot depend on itself",
                ));
                continue;
            }
            match by_name.get(dep.as_str()) {
                Some(&dep_index) => {
                    // Edge direction: dependency -> dependent.
                    graph.add_edge(dep_index, index, ());
                }
                None => errors.push(ValidationError::order(
                    &order.order_name,
                    format!("unknown dependency '{dep}'"),
                )),
            }
        }
    }
    if !errors.is_empty() {
        return;
    }

    if toposort(&graph, None).is_err() {
        errors.push(ValidationError::job("dependency graph has a cycle"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(name: &str, deps: &[&str]) -> OrderSpec {
        OrderSpec {
            order_name: Some(name.to_string()),
            execution_target: Some("inline".into()),
            cmds: vec!["true".into()],
            timeout_s: 30,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            source: Some(SourceSpec::Bundle {
                bundle_location: "ordo+blob://internal/seed.tar.gz".into(),
            }),
            ..OrderSpec::default()
        }
    }

    fn job(orders: Vec<OrderSpec>) -> JobSpec {
        JobSpec {
            username: "ava".into(),
            flow_label: "exec".into(),
            trace_id: None,
            run_id: None,
            job_timeout_s: 3600,
            presign_expiry_s: 7200,
            pr_reference: None,
            encryption_key_ref: None,
            orders,
        }
    }

    #[test]
    fn valid_job_passes_and_defaults_queue_id() {
        let validated =
            validate_job(&job(vec![order("a", &[]), order("b", &["a"])]), true).expect("valid");
        assert_eq!(validated.orders.len(), 2);
        assert_eq!(validated.orders[0].order_num, "0001");
        assert_eq!(validated.orders[0].queue_id, "0001");
        assert_eq!(validated.orders[1].dependencies, vec!["a".to_string()]);
    }

    #[test]
    fn empty_job_is_rejected() {
        let errors = validate_job(&job(vec![]), true).expect_err("invalid");
        assert_eq!(errors[0].message, "job has no orders");
    }

    #[test]
    fn missing_cmds_and_timeout_are_reported_together() {
        let mut bad = order("a", &[]);
        bad.cmds.clear();
        bad.timeout_s = 0;
        let errors = validate_job(&job(vec![bad]), false).expect_err("invalid");
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.order.as_deref() == Some("a")));
    }

    #[test]
    fn fail_fast_stops_at_first_bad_order() {
        let mut first_bad = order("a", &[]);
        first_bad.cmds.clear();
        let mut second_bad = order("b", &[]);
        second_bad.timeout_s = 0;
        let errors = validate_job(&job(vec![first_bad, second_bad]), true).expect_err("invalid");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].order.as_deref(), Some("a"));
    }

    #[test]
    fn unknown_execution_target_is_rejected() {
        let mut bad = order("a", &[]);
        bad.execution_target = Some("mainframe".into());
        let errors = validate_job(&job(vec![bad]), true).expect_err("invalid");
        assert!(errors[0].message.contains("mainframe"));
    }

    #[test]
    fn legacy_use_lambda_maps_when_target_absent() {
        let mut legacy = order("a", &[]);
        legacy.execution_target = None;
        legacy.use_lambda = Some(true);
        let validated = validate_job(&job(vec![legacy]), true).expect("valid");
        assert!(matches!(
            validated.orders[0].target,
            ExecutionTarget::Inline { .. }
        ));

        let mut legacy = order("a", &[]);
        legacy.execution_target = None;
        legacy.use_lambda = Some(false);
        let validated = validate_job(&job(vec![legacy]), true).expect("valid");
        assert!(matches!(
            validated.orders[0].target,
            ExecutionTarget::Container { .. }
        ));
    }

    #[test]
    fn remote_agent_requires_targets() {
        let mut agent = order("a", &[]);
        agent.execution_target = Some("remote-agent".into());
        let errors = validate_job(&job(vec![agent]), true).expect_err("invalid");
        assert!(errors[0].message.contains("target"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let errors =
            validate_job(&job(vec![order("a", &["ghost"])]), true).expect_err("invalid");
        assert!(errors[0].message.contains("ghost"));
    }

    #[test]
    fn cycle_is_rejected() {
        let errors = validate_job(
            &job(vec![order("a", &["b"]), order("b", &["a"])]),
            true,
        )
        .expect_err("invalid");
        assert!(errors.iter().any(|e| e.message.contains("cycle")));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let errors = validate_job(&job(vec![order("a", &[]), order("a", &[])]), true)
            .expect_err("invalid");
        assert!(errors[0].message.contains("duplicate"));
    }

    #[test]
    fn missing_source_is_rejected() {
        let mut bad = order("a", &[]);
        bad.source = None;
        let errors = validate_job(&job(vec![bad]), true).expect_err("invalid");
        assert!(errors[0].message.contains("code source"));
    }
}
