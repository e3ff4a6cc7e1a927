//! Wire-format job descriptors accepted by the admission pipeline.
//!
//! A submitted job arrives either as raw JSON or wrapped in a base64
//! envelope (`job_parameters_b64`). These types are deliberately loose —
//! required execution fields default to empty values so validation can
//! report every problem with a structured error instead of a serde failure.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KernelError;

fn default_flow_label() -> String {
    "exec".to_string()
}

fn default_job_timeout() -> u64 {
    3600
}

fn default_presign_expiry() -> u64 {
    7200
}

fn default_true() -> bool {
    true
}

/// Where an order's code comes from: a pre-existing bundle or a VCS revision.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SourceSpec {
    Bundle {
        bundle_location: String,
    },
    Repo {
        repo: String,
        token_ref: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        folder: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
    },
}

/// One order inside a submitted job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_target: Option<String>,
    /// Legacy flag predating `execution_target`; `true` maps to `inline`,
    /// `false` to `container`. Ignored when `execution_target` is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_lambda: Option<bool>,
    /// Fleet addresses for `remote-agent` orders.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default)]
    pub cmds: Vec<String>,
    #[serde(default)]
    pub timeout_s: u64,
    #[serde(default = "default_true")]
    pub must_succeed: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub config_paths: Vec<String>,
    #[serde(default)]
    pub secret_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
}

impl Default for OrderSpec {
    fn default() -> Self {
        Self {
            order_name: None,
            execution_target: None,
            use_lambda: None,
            targets: Vec::new(),
            document_ref: None,
            function: None,
            project: None,
            cmds: Vec::new(),
            timeout_s: 0,
            must_succeed: default_true(),
            dependencies: Vec::new(),
            queue_id: None,
            env_vars: BTreeMap::new(),
            config_paths: Vec::new(),
            secret_paths: Vec::new(),
            source: None,
        }
    }
}

/// A submitted job: global fields plus the list of orders.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSpec {
    pub username: String,
    #[serde(default = "default_flow_label")]
    pub flow_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_s: u64,
    #[serde(default = "default_presign_expiry")]
    pub presign_expiry_s: u64,
    /// Opaque reference to a PR or issue the run should report to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_reference: Option<Value>,
    /// Pre-existing envelope recipient; when absent an ephemeral key pair is
    /// generated per order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_ref: Option<String>,
    #[serde(default)]
    pub orders: Vec<OrderSpec>,
}

impl JobSpec {
    pub fn from_json(raw: &Value) -> Result<Self, KernelError> {
        serde_json::from_value(raw.clone())
            .map_err(|e| KernelError::Config(format!("invalid job descriptor: {e}")))
    }

    pub fn to_b64(&self) -> Result<String, KernelError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| KernelError::Config(format!("encode job descriptor: {e}")))?;
        Ok(BASE64.encode(json))
    }

    pub fn from_b64(encoded: &str) -> Result<Self, KernelError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| KernelError::Config(format!("invalid base64 envelope: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| KernelError::Config(format!("invalid job descriptor: {e}")))
    }
}
