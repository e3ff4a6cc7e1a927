//! Run status notification port.
//!
//! The orchestrator and admission report coarse run progress through this
//! port; failures are logged by callers and never affect order state.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;

use ordo_kernel::{JobStatus, KernelError, OrderStatus, RunSummary};

use crate::credentials::CredentialSource;
use crate::vcs::{format_tags, VcsProvider};

/// Observer for run lifecycle changes.
#[async_trait]
pub trait RunNotifier: Send + Sync {
    async fn job_started(
        &self,
        run_id: &str,
        flow_id: &str,
        order_names: &[String],
    ) -> Result<(), KernelError>;

    async fn order_completed(
        &self,
        run_id: &str,
        order_name: &str,
        status: OrderStatus,
    ) -> Result<(), KernelError>;

    async fn job_completed(
        &self,
        run_id: &str,
        status: JobStatus,
        summary: &RunSummary,
    ) -> Result<(), KernelError>;
}

/// Default notifier: does nothing.
#[derive(Default)]
pub struct NoopNotifier;

#[async_trait]
impl RunNotifier for NoopNotifier {
    async fn job_started(
        &self,
        _run_id: &str,
        _flow_id: &str,
        _order_names: &[String],
    ) -> Result<(), KernelError> {
        Ok(())
    }

    async fn order_completed(
        &self,
        _run_id: &str,
        _order_name: &str,
        _status: OrderStatus,
    ) -> Result<(), KernelError> {
        Ok(())
    }

    async fn job_completed(
        &self,
        _run_id: &str,
        _status: JobStatus,
        _summary: &RunSummary,
    ) -> Result<(), KernelError> {
        Ok(())
    }
}

/// PR reference extracted from a job descriptor.
#[derive(Clone, Debug)]
pub struct PrTarget {
    pub repo: String,
    pub pr_number: u64,
    pub token_ref: String,
    pub search_tag: String,
}

impl PrTarget {
    /// Read a PR target from the opaque `pr_reference` payload. Returns
    /// `None` when the payload carries no usable reference.
    pub fn from_reference(reference: &Value, search_tag: &str) -> Option<Self> {
        let repo = reference["repo"].as_str()?;
        let pr_number = reference["pr_number"]
            .as_u64()
            .or_else(|| reference["issue_number"].as_u64())?;
        let token_ref = reference["token_ref"].as_str()?;
        Some(Self {
            repo: repo.to_string(),
            pr_number,
            token_ref: token_ref.to_string(),
            search_tag: search_tag.to_string(),
        })
    }
}

/// Upserts a tagged status comment on the target PR.
pub struct VcsNotifier {
    vcs: Arc<dyn VcsProvider>,
    credentials: Arc<dyn CredentialSource>,
    target: PrTarget,
}

impl VcsNotifier {
    pub fn new(
        vcs: Arc<dyn VcsProvider>,
        credentials: Arc<dyn CredentialSource>,
        target: PrTarget,
    ) -> Self {
        Self {
            vcs,
            credentials,
            target,
        }
    }

    async fn token(&self) -> Result<SecretString, KernelError> {
        let raw = self.credentials.fetch(&self.target.token_ref).await?;
        let token = String::from_utf8(raw)
            .map_err(|_| KernelError::Credential("vcs token is not utf-8".into()))?;
        Ok(SecretString::new(token))
    }

    async fn upsert(&self, body: String) -> Result<(), KernelError> {
        let token = self.token().await?;
        let existing = self
            .vcs
            .find_comment_by_tag(
                &self.target.repo,
                self.target.pr_number,
                &self.target.search_tag,
                &token,
            )
            .await?;
        match existing {
            Some(comment_id) => {
                self.vcs
                    .update_comment(&self.target.repo, comment_id, &body, &token)
                    .await
            }
            None => self
                .vcs
                .create_comment(&self.target.repo, self.target.pr_number, &body, &token)
                .await
                .map(|_| ()),
        }
    }

    fn body(&self, run_id: &str, lines: Vec<String>) -> String {
        let mut out = lines;
        out.push(String::new());
        out.push(format_tags(
            &self.target.search_tag,
            &[format!("#{run_id}")],
        ));
        out.join("\n")
    }
}

#[async_trait]
impl RunNotifier for VcsNotifier {
    async fn job_started(
        &self,
        run_id: &str,
        flow_id: &str,
        order_names: &[String],
    ) -> Result<(), KernelError> {
        let mut lines = vec![format!("**{flow_id}** accepted")];
        for (i, name) in order_names.iter().enumerate() {
            let prefix = if i + 1 == order_names.len() {
                "└─"
            } else {
                "├─"
            };
            lines.push(format!("{prefix} {name}: queued"));
        }
        self.upsert(self.body(run_id, lines)).await
    }

    async fn order_completed(
        &self,
        run_id: &str,
        order_name: &str,
        status: OrderStatus,
    ) -> Result<(), KernelError> {
        self.upsert(self.body(run_id, vec![format!("{order_name}: {status}")]))
            .await
    }

    async fn job_completed(
        &self,
        run_id: &str,
        status: JobStatus,
        summary: &RunSummary,
    ) -> Result<(), KernelError> {
        let line = format!(
            "run {status} ({} succeeded, {} failed, {} timed out)",
            summary.succeeded, summary.failed, summary.timed_out
        );
        self.upsert(self.body(run_id, vec![line])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pr_target_from_reference() {
        let reference = json!({
            "repo": "acme/widgets",
            "pr_number": 12,
            "token_ref": "/tokens/git"
        });
        let target = PrTarget::from_reference(&reference, "tag").expect("target");
        assert_eq!(target.repo, "acme/widgets");
        assert_eq!(target.pr_number, 12);

        assert!(PrTarget::from_reference(&json!({}), "tag").is_none());
        let issue_only = json!({
            "repo": "acme/widgets",
            "issue_number": 7,
            "token_ref": "/tokens/git"
        });
        assert_eq!(
            PrTarget::from_reference(&issue_only, "tag")
                .expect("target")
                .pr_number,
            7
        );
    }
}
