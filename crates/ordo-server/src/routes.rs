//! Axum routes: job submission, notification ingress, health.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use ordo_kernel::JobSpec;
use ordo_runtime::{AdmissionMode, AdmissionPipeline, Orchestrator, TickOutcome};

use crate::api::{ApiError, SubmitBody};

/// Shared handles behind the router.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionPipeline>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/init", post(submit_standard))
        .route("/ssm", post(submit_remote_agent))
        .route("/notify", post(notify))
        .with_state(state)
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Accept either `{"job_parameters_b64": "..."}` or the raw descriptor,
/// with optional top-level `trace_id`/`run_id` overrides.
fn decode_job(payload: &Value) -> Result<JobSpec, ApiError> {
    let mut job = match payload.get("job_parameters_b64") {
        Some(envelope) => {
            let encoded = envelope
                .as_str()
                .ok_or_else(|| ApiError::BadRequest("job_parameters_b64 must be a string".into()))?;
            JobSpec::from_b64(encoded).map_err(|e| ApiError::BadRequest(e.to_string()))?
        }
        None => JobSpec::from_json(payload).map_err(|e| ApiError::BadRequest(e.to_string()))?,
    };
    if job.trace_id.is_none() {
        if let Some(trace_id) = payload.get("trace_id").and_then(Value::as_str) {
            job.trace_id = Some(trace_id.to_string());
        }
    }
    if job.run_id.is_none() {
        if let Some(run_id) = payload.get("run_id").and_then(Value::as_str) {
            job.run_id = Some(run_id.to_string());
        }
    }
    Ok(job)
}

async fn submit(
    state: &AppState,
    payload: Value,
    mode: AdmissionMode,
) -> Result<Json<SubmitBody>, ApiError> {
    let job = decode_job(&payload)?;
    let receipt = state.admission.submit(job, mode).await?;
    Ok(Json(SubmitBody {
        status: "ok",
        run_id: receipt.run_id,
        trace_id: receipt.trace_id,
        flow_id: receipt.flow_id,
        done_uri: receipt.done_uri,
        pr_search_tag: receipt.pr_search_tag,
    }))
}

async fn submit_standard(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<SubmitBody>, ApiError> {
    submit(&state, payload, AdmissionMode::Standard).await
}

async fn submit_remote_agent(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<SubmitBody>, ApiError> {
    submit(&state, payload, AdmissionMode::RemoteAgent).await
}

/// Notification ingress: `{"key": "..."}` or `{"records": [{"key": "..."}]}`.
/// Unparseable keys are logged and acknowledged; they carry no state.
async fn notify(State(state): State<AppState>, Json(payload): Json<Value>) -> Json<Value> {
    let mut keys: Vec<String> = Vec::new();
    if let Some(key) = payload.get("key").and_then(Value::as_str) {
        keys.push(key.to_string());
    }
    if let Some(records) = payload.get("records").and_then(Value::as_array) {
        keys.extend(
            records
                .iter()
                .filter_map(|r| r.get("key").and_then(Value::as_str))
                .map(|k| k.to_string()),
        );
    }

    let mut handled = 0;
    for key in keys {
        match state.orchestrator.handle_notification(&key).await {
            Ok(TickOutcome::Skipped) => {
                tracing::debug!(key = %key, "tick skipped (lock contention)");
                handled += 1;
            }
            Ok(_) => handled += 1,
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "notification not processed");
            }
        }
    }
    Json(json!({ "status": "ok", "handled": handled }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_job_accepts_raw_descriptor() {
        let payload = json!({
            "username": "ava",
            "orders": [{
                "execution_target": "inline",
                "cmds": ["true"],
                "timeout_s": 30,
                "source": {"bundle_location": "ordo+blob://internal/x.tar.gz"}
            }]
        });
        let job = decode_job(&payload).expect("decode");
        assert_eq!(job.username, "ava");
        assert_eq!(job.orders.len(), 1);
    }

    #[test]
    fn decode_job_accepts_b64_envelope_with_overrides() {
        let inner = JobSpec {
            username: "ava".into(),
            flow_label: "exec".into(),
            trace_id: None,
            run_id: None,
            job_timeout_s: 3600,
            presign_expiry_s: 7200,
            pr_reference: None,
            encryption_key_ref: None,
            orders: Vec::new(),
        };
        let payload = json!({
            "job_parameters_b64": inner.to_b64().expect("encode"),
            "trace_id": "cafef00d",
            "run_id": "run-fixed",
        });
        let job = decode_job(&payload).expect("decode");
        assert_eq!(job.trace_id.as_deref(), Some("cafef00d"));
        assert_eq!(job.run_id.as_deref(), Some("run-fixed"));
    }

    #[test]
    fn decode_job_rejects_bad_envelope() {
        let payload = json!({ "job_parameters_b64": "%%%" });
        assert!(decode_job(&payload).is_err());
        let payload = json!({ "job_parameters_b64": 42 });
        assert!(decode_job(&payload).is_err());
    }
}
