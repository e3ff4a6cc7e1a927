//! VCS provider capability consumed by the kernel for PR status reporting.
//!
//! The kernel only calls this interface; comment rendering lives with the
//! caller. `GitHubVcs` is the reqwest-backed implementation.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use ordo_kernel::KernelError;

type HmacSha256 = Hmac<Sha256>;

/// VCS operations the kernel consumes.
#[async_trait]
pub trait VcsProvider: Send + Sync {
    /// Verify a webhook body against its `sha256=<hex>` signature header.
    fn verify_webhook(&self, signature_header: &str, body: &[u8], secret: &str) -> bool;

    async fn create_comment(
        &self,
        repo: &str,
        pr_number: u64,
        body: &str,
        token: &SecretString,
    ) -> Result<u64, KernelError>;

    async fn update_comment(
        &self,
        repo: &str,
        comment_id: u64,
        body: &str,
        token: &SecretString,
    ) -> Result<(), KernelError>;

    /// First comment on the PR whose body contains `tag`, if any.
    async fn find_comment_by_tag(
        &self,
        repo: &str,
        pr_number: u64,
        tag: &str,
        token: &SecretString,
    ) -> Result<Option<u64>, KernelError>;
}

/// Constant-time check of a `sha256=<hex>` HMAC signature.
pub fn verify_hmac_signature(signature_header: &str, body: &[u8], secret: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = format!("sha256={:x}", mac.finalize().into_bytes());
    expected
        .as_bytes()
        .ct_eq(signature_header.trim().as_bytes())
        .into()
}

/// GitHub implementation of [`VcsProvider`].
pub struct GitHubVcs {
    api_base_url: String,
    client: reqwest::Client,
}

impl Default for GitHubVcs {
    fn default() -> Self {
        Self::new("https://api.github.com")
    }
}

impl GitHubVcs {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            api_base_url: api_base_url.into(),
            client,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{endpoint}", self.api_base_url.trim_end_matches('/'))
    }

    async fn get_json(&self, url: &str, token: &SecretString) -> Result<Value, KernelError> {
        self.client
            .get(url)
            .bearer_auth(token.expose_secret())
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ordo")
            .send()
            .await
            .map_err(|e| KernelError::Vcs(format!("GET {url}: {e}")))?
            .error_for_status()
            .map_err(|e| KernelError::Vcs(format!("GET {url}: {e}")))?
            .json()
            .await
            .map_err(|e| KernelError::Vcs(format!("decode {url}: {e}")))
    }
}

#[async_trait]
impl VcsProvider for GitHubVcs {
    fn verify_webhook(&self, signature_header: &str, body: &[u8], secret: &str) -> bool {
        verify_hmac_signature(signature_header, body, secret)
    }

    async fn create_comment(
        &self,
        repo: &str,
        pr_number: u64,
        body: &str,
        token: &SecretString,
    ) -> Result<u64, KernelError> {
        let url = self.url(&format!("/repos/{repo}/issues/{pr_number}/comments"));
        let response: Value = self
            .client
            .post(&url)
            .bearer_auth(token.expose_secret())
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ordo")
            .json(&json!({ "body": body }))
            .send()
            .await
            .map_err(|e| KernelError::Vcs(format!("POST {url}: {e}")))?
            .error_for_status()
            .map_err(|e| KernelError::Vcs(format!("POST {url}: {e}")))?
            .json()
            .await
            .map_err(|e| KernelError::Vcs(format!("decode {url}: {e}")))?;
        response["id"]
            .as_u64()
            .ok_or_else(|| KernelError::Vcs("comment response has no id".into()))
    }

    async fn update_comment(
        &self,
        repo: &str,
        comment_id: u64,
        body: &str,
        token: &SecretString,
    ) -> Result<(), KernelError> {
        let url = self.url(&format!("/repos/{repo}/issues/comments/{comment_id}"));
        self.client
            .patch(&url)
            .bearer_auth(token.expose_secret())
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "ordo")
            .json(&json!({ "body": body }))
            .send()
            .await
            .map_err(|e| KernelError::Vcs(format!("PATCH {url}: {e}")))?
            .error_for_status()
            .map_err(|e| KernelError::Vcs(format!("PATCH {url}: {e}")))?;
        Ok(())
    }

    async fn find_comment_by_tag(
        &self,
        repo: &str,
        pr_number: u64,
        tag: &str,
        token: &SecretString,
    ) -> Result<Option<u64>, KernelError> {
        let mut page = 1;
        loop {
            let url = self.url(&format!(
                "/repos/{repo}/issues/{pr_number}/comments?page={page}&per_page=100"
            ));
            let comments = self.get_json(&url, token).await?;
            let Some(comments) = comments.as_array() else {
                return Err(KernelError::Vcs("comment list is not an array".into()));
            };
            if comments.is_empty() {
                return Ok(None);
            }
            for comment in comments {
                let body = comment["body"].as_str().unwrap_or_default();
                if body.contains(tag) {
                    return Ok(comment["id"].as_u64());
                }
            }
            if comments.len() < 100 {
                return Ok(None);
            }
            page += 1;
        }
    }
}

/// Tag block appended to status comments so later legs can find them.
pub fn format_tags(search_tag: &str, extra: &[String]) -> String {
    let mut parts = vec![format!("<!-- {search_tag} -->")];
    parts.extend(extra.iter().cloned());
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_signature_accepts_matching_and_rejects_tampered() {
        let body = b"{\"action\":\"opened\"}";
        let secret = "webhook-secret";

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("mac");
        mac.update(body);
        let header = format!("sha256={:x}", mac.finalize().into_bytes());

        assert!(verify_hmac_signature(&header, body, secret));
        assert!(!verify_hmac_signature(&header, b"{\"action\":\"closed\"}", secret));
        assert!(!verify_hmac_signature(&header, body, "other-secret"));
        assert!(!verify_hmac_signature("sha256=deadbeef", body, secret));
    }

    #[test]
    fn tag_block_contains_search_tag_and_extras() {
        let tags = format_tags("a1b2", &["#run-1".to_string(), "#ava:t-exec".to_string()]);
        assert!(tags.contains("<!-- a1b2 -->"));
        assert!(tags.contains("#run-1"));
    }
}
