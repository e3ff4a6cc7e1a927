//! HTTP error mapping and response shapes for the submission API.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use ordo_runtime::{AdmissionError, ValidationError};

/// Body of a successful submission.
#[derive(Clone, Debug, Serialize)]
pub struct SubmitBody {
    pub status: &'static str,
    pub run_id: String,
    pub trace_id: String,
    pub flow_id: String,
    pub done_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_search_tag: Option<String>,
}

/// API-level error with its HTTP mapping.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Rejected(Vec<ValidationError>),
    Internal(String),
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        match err {
            AdmissionError::Validation(errors) => Self::Rejected(errors),
            AdmissionError::Kernel(err) => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        match self {
            Self::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "status": "error",
                    "errors": [message],
                    "request_id": request_id,
                })),
            )
                .into_response(),
            Self::Rejected(errors) => {
                let rendered: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "status": "error",
                        "errors": rendered,
                        "request_id": request_id,
                    })),
                )
                    .into_response()
            }
            Self::Internal(message) => {
                tracing::error!(request_id = %request_id, error = %message, "internal failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "status": "error",
                        "error": message,
                        "request_id": request_id,
                    })),
                )
                    .into_response()
            }
        }
    }
}
