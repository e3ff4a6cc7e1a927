//! Job admission pipeline (receive -> validate -> package -> persist ->
//! start signal).
//!
//! Admission does no dispatch. It packages every order into an encrypted
//! bundle, persists the run as `queued`, and emits the start marker whose
//! notification wakes the orchestrator — the single locus of scheduling
//! decisions. Any validation failure aborts the whole job before anything
//! is persisted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use ordo_kernel::{
    exec_key, flow_id as make_flow_id, new_run_id, new_trace_id, result_key, ArtifactStore,
    CallbackResult, ExecutionTarget, JobSpec, KernelError, OrderEvent, OrderRecord, OrderStatus,
    RetryPolicy, SourceSpec, StateStore, JOB_ORDER_NAME, START_ORDER_NUM,
};

use crate::bundle::{env_keys_manifest, pack_archive, secret_sources_manifest, EnvBundle};
use crate::credentials::{env_name_for_path, CredentialSource};
use crate::envelope::seal_env;
use crate::keystore::KeyStore;
use crate::notify::{PrTarget, RunNotifier, VcsNotifier};
use crate::source::{CodeFetcher, CodeTree};
use crate::validate::{validate_job, ValidatedOrder, ValidationError};
use crate::vcs::VcsProvider;

/// Record TTL: orders expire one day after creation.
const ORDER_TTL_S: i64 = 86_400;

/// Which entry admitted the job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdmissionMode {
    /// `/init`: bundles carry an envelope-encrypted env map.
    Standard,
    /// `/ssm`: remote-agent-only orders; commands and env travel in the
    /// bundle as plaintext JSON for the agent document.
    RemoteAgent,
}

/// Synchronous admission response.
#[derive(Clone, Debug)]
pub struct SubmitReceipt {
    pub run_id: String,
    pub trace_id: String,
    pub flow_id: String,
    pub done_uri: String,
    pub pr_search_tag: Option<String>,
}

/// Admission failure: either the job was rejected outright or a packaging
/// step failed.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("job rejected: {0:?}")]
    Validation(Vec<ValidationError>),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// The admission pipeline and its collaborator ports.
pub struct AdmissionPipeline {
    state: Arc<dyn StateStore>,
    internal: Arc<dyn ArtifactStore>,
    done: Arc<dyn ArtifactStore>,
    credentials: Arc<dyn CredentialSource>,
    keys: Arc<dyn KeyStore>,
    fetcher: Arc<dyn CodeFetcher>,
    vcs: Option<Arc<dyn VcsProvider>>,
    retry: RetryPolicy,
}

struct PackagedOrder {
    bundle_uri: String,
    callback_uri: String,
    key_ref: Option<String>,
}

impl AdmissionPipeline {
    pub fn new(
        state: Arc<dyn StateStore>,
        internal: Arc<dyn ArtifactStore>,
        done: Arc<dyn ArtifactStore>,
        credentials: Arc<dyn CredentialSource>,
        keys: Arc<dyn KeyStore>,
        fetcher: Arc<dyn CodeFetcher>,
    ) -> Self {
        Self {
            state,
            internal,
            done,
            credentials,
            keys,
            fetcher,
            vcs: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_vcs(mut self, vcs: Arc<dyn VcsProvider>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Admit one job: validate, package every order, persist, emit the
    /// start signal, and answer synchronously.
    pub async fn submit(
        &self,
        job: JobSpec,
        mode: AdmissionMode,
    ) -> Result<SubmitReceipt, AdmissionError> {
        // Stage 1: identifier allocation. Submitter-supplied ids are adopted.
        let run_id = job.run_id.clone().unwrap_or_else(new_run_id);
        let trace_id = job.trace_id.clone().unwrap_or_else(new_trace_id);
        let label = match mode {
            AdmissionMode::Standard => job.flow_label.clone(),
            // The remote-agent entry has its own default label.
            AdmissionMode::RemoteAgent if job.flow_label == "exec" => "ssm".to_string(),
            AdmissionMode::RemoteAgent => job.flow_label.clone(),
        };
        let flow = make_flow_id(&job.username, &trace_id, &label);

        // Stage 2: validation, fail-fast, nothing persisted on error.
        let validated = validate_job(&job, true).map_err(AdmissionError::Validation)?;
        if mode == AdmissionMode::RemoteAgent {
            let misrouted: Vec<ValidationError> = validated
                .orders
                .iter()
                .filter(|o| !matches!(o.target, ExecutionTarget::RemoteAgent { .. }))
                .map(|o| ValidationError {
                    order: Some(o.order_name.clone()),
                    message: "this entry accepts only remote-agent orders".into(),
                })
                .collect();
            if !misrouted.is_empty() {
                return Err(AdmissionError::Validation(misrouted));
            }
        }

        tracing::info!(
            run_id = %run_id,
            flow_id = %flow,
            orders = validated.orders.len(),
            "admitting job"
        );

        // Stage 3: per-order packaging. Code is fetched once per unique
        // source revision; folders are cut per order afterwards.
        let mut tree_cache: HashMap<String, CodeTree> = HashMap::new();
        let mut packaged = Vec::with_capacity(validated.orders.len());
        for order in &validated.orders {
            packaged.push(
                self.package_order(&job, mode, &run_id, &trace_id, &flow, order, &mut tree_cache)
                    .await?,
            );
        }

        // Stage 4: persist orders and the job-started event.
        let now = Utc::now().timestamp();
        let deadline = now + job.job_timeout_s as i64;
        for (order, package) in validated.orders.iter().zip(&packaged) {
            let record = OrderRecord {
                run_id: run_id.clone(),
                order_num: order.order_num.clone(),
                trace_id: trace_id.clone(),
                flow_id: flow.clone(),
                order_name: order.order_name.clone(),
                cmds: order.cmds.clone(),
                status: OrderStatus::Queued,
                queue_id: order.queue_id.clone(),
                target: order.target.clone(),
                source: order.source.clone(),
                bundle_uri: package.bundle_uri.clone(),
                callback_uri: package.callback_uri.clone(),
                key_ref: package.key_ref.clone(),
                dependencies: order.dependencies.clone(),
                must_succeed: order.must_succeed,
                timeout_s: order.timeout_s,
                job_deadline: deadline,
                created_at: now,
                last_update: now,
                ttl: now + ORDER_TTL_S,
                execution_url: None,
                watchdog_handle: None,
                failure_reason: None,
                log: None,
            };
            self.retry
                .run("put_order", || self.state.put_order(&record))
                .await?;
        }

        let search_tag = job
            .pr_reference
            .as_ref()
            .map(|reference| match reference["search_tag"].as_str() {
                Some(tag) => tag.to_string(),
                None => format!("{:08x}", rand::random::<u32>()),
            });
        let mut started_data = json!({
            "flow_id": flow,
            "run_id": run_id,
            "order_count": validated.orders.len(),
        });
        if let (Some(reference), Some(tag)) = (&job.pr_reference, &search_tag) {
            started_data["pr_reference"] = reference.clone();
            started_data["pr_search_tag"] = json!(tag);
        }
        let started = OrderEvent::new(&trace_id, JOB_ORDER_NAME, "job_started", "running")
            .with_flow(&flow)
            .with_run(&run_id)
            .with_data(started_data);
        self.retry
            .run("put_event", || self.state.put_event(&started))
            .await?;

        // Initial PR status comment; failures must not fail admission.
        if let Some(notifier) = self.pr_notifier(&job, search_tag.as_deref()) {
            let names: Vec<String> = validated
                .orders
                .iter()
                .map(|o| o.order_name.clone())
                .collect();
            if let Err(err) = notifier.job_started(&run_id, &flow, &names).await {
                tracing::warn!(run_id = %run_id, error = %err, "initial PR comment failed");
            }
        }

        // Stage 5: start signal; its notification triggers the first
        // orchestrator invocation.
        let start = serde_json::to_vec(&CallbackResult {
            status: "init".into(),
            log: String::new(),
        })
        .map_err(|e| KernelError::Artifact(format!("encode start marker: {e}")))?;
        self.internal
            .put(&result_key(&run_id, START_ORDER_NUM), &start)
            .await?;

        Ok(SubmitReceipt {
            done_uri: self.done.uri(&ordo_kernel::done_key(&run_id)),
            run_id,
            trace_id,
            flow_id: flow,
            pr_search_tag: search_tag,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn package_order(
        &self,
        job: &JobSpec,
        mode: AdmissionMode,
        run_id: &str,
        trace_id: &str,
        flow: &str,
        order: &ValidatedOrder,
        tree_cache: &mut HashMap<String, CodeTree>,
    ) -> Result<PackagedOrder, KernelError> {
        // 3a: fetch code, once per unique source revision.
        let (base_source, folder) = split_folder(&order.source);
        let cache_key = source_cache_key(&base_source);
        if !tree_cache.contains_key(&cache_key) {
            let tree = self.fetcher.fetch(&base_source).await?;
            tree_cache.insert(cache_key.clone(), tree);
        }
        let mut tree = tree_cache
            .get(&cache_key)
            .cloned()
            .unwrap_or_default()
            .subtree(folder.as_deref())?;

        // 3b: resolve config and secret paths to values.
        let config_values = self.fetch_values(&order.config_paths).await?;
        let secret_values = self.fetch_values(&order.secret_paths).await?;

        // 3d: presigned callback-write URL.
        let callback_uri = self.internal.presign_put(
            &result_key(run_id, &order.order_num),
            job.presign_expiry_s,
        );

        // 3e: merged env map.
        let env = EnvBundle {
            run_id: run_id.to_string(),
            order_id: order.order_name.clone(),
            order_num: order.order_num.clone(),
            trace_id: trace_id.to_string(),
            flow_id: flow.to_string(),
            env_vars: order.env_vars.clone(),
            config_values,
            secret_values,
            callback_url: callback_uri.clone(),
            timeout_s: order.timeout_s,
        };
        let merged = env.build_env();

        // 3f/3g: encrypt and rebundle, or inline the agent inputs.
        let key_ref = match mode {
            AdmissionMode::Standard => {
                let sealed = seal_env(
                    &merged,
                    job.encryption_key_ref.as_deref(),
                    self.keys.as_ref(),
                    run_id,
                    &order.order_num,
                )
                .await?;
                tree.upsert("secrets.env.age", 0o600, sealed.ciphertext);
                tree.upsert("env_keys.env", 0o644, env_keys_manifest(&merged));
                let sources = env.secret_sources();
                if !sources.is_empty() {
                    tree.upsert("secrets.src", 0o644, secret_sources_manifest(&sources));
                }
                Some(sealed.key_ref)
            }
            AdmissionMode::RemoteAgent => {
                let cmds = serde_json::to_vec(&order.cmds)
                    .map_err(|e| KernelError::Bundle(format!("encode cmds: {e}")))?;
                let env_json = serde_json::to_vec(&merged)
                    .map_err(|e| KernelError::Bundle(format!("encode env: {e}")))?;
                tree.upsert("cmds.json", 0o644, cmds);
                tree.upsert("env_vars.json", 0o600, env_json);
                None
            }
        };

        let archive = pack_archive(&tree)?;
        let key = exec_key(run_id, &order.order_num);
        self.retry
            .run("upload_bundle", || self.internal.put(&key, &archive))
            .await?;

        Ok(PackagedOrder {
            bundle_uri: self.internal.uri(&key),
            callback_uri,
            key_ref,
        })
    }

    async fn fetch_values(
        &self,
        paths: &[String],
    ) -> Result<BTreeMap<String, String>, KernelError> {
        let mut values = BTreeMap::new();
        for path in paths {
            let raw = self.credentials.fetch(path).await?;
            let value = String::from_utf8(raw).map_err(|_| {
                KernelError::Credential(format!("credential at {path} is not utf-8"))
            })?;
            values.insert(env_name_for_path(path), value);
        }
        Ok(values)
    }

    fn pr_notifier(
        &self,
        job: &JobSpec,
        search_tag: Option<&str>,
    ) -> Option<Box<dyn RunNotifier>> {
        let vcs = self.vcs.clone()?;
        let reference = job.pr_reference.as_ref()?;
        let target = PrTarget::from_reference(reference, search_tag?)?;
        Some(Box::new(VcsNotifier::new(
            vcs,
            self.credentials.clone(),
            target,
        )))
    }
}

/// Strip the per-order folder so trees can be cached per revision.
fn split_folder(source: &SourceSpec) -> (SourceSpec, Option<String>) {
    match source {
        SourceSpec::Repo {
            repo,
            token_ref,
            folder,
            commit,
        } => (
            SourceSpec::Repo {
                repo: repo.clone(),
                token_ref: token_ref.clone(),
                folder: None,
                commit: commit.clone(),
            },
            folder.clone(),
        ),
        SourceSpec::Bundle { .. } => (source.clone(), None),
    }
}

fn source_cache_key(source: &SourceSpec) -> String {
    match source {
        SourceSpec::Bundle { bundle_location } => format!("bundle:{bundle_location}"),
        SourceSpec::Repo { repo, commit, .. } => {
            format!("repo:{repo}@{}", commit.as_deref().unwrap_or("HEAD"))
        }
    }
}
