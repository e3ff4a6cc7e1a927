//! Runtime of the ordo orchestration kernel: job admission, the
//! event-driven orchestrator, the timeout watchdog, and the collaborator
//! ports they depend on.

pub mod admission;
pub mod bundle;
pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod envelope;
pub mod keystore;
pub mod notify;
pub mod orchestrator;
pub mod source;
pub mod validate;
pub mod vcs;
pub mod watchdog;
pub mod worker;

pub use admission::{AdmissionError, AdmissionMode, AdmissionPipeline, SubmitReceipt};
pub use bundle::{EnvBundle, ENV_CALLBACK_URL, ENV_TIMEOUT};
pub use config::RuntimeConfig;
pub use credentials::{
    env_name_for_path, CredentialSource, FsCredentialSource, MemoryCredentialSource,
};
pub use dispatch::{client_request_id, BackendDispatcher, DispatchHandle, DispatchRequest};
pub use envelope::{open_env, seal_env, SealedEnvelope};
pub use keystore::{key_path, KeyStore, MemoryKeyStore};
pub use notify::{NoopNotifier, PrTarget, RunNotifier, VcsNotifier};
pub use orchestrator::{Orchestrator, TickOutcome};
pub use source::{
    CodeFetcher, CodeFile, CodeTree, GitCodeFetcher, RoutingCodeFetcher, StoreCodeFetcher,
};
pub use validate::{validate_job, ValidatedJob, ValidatedOrder, ValidationError};
pub use vcs::{GitHubVcs, VcsProvider};
pub use watchdog::{WatchdogConfig, WatchdogSpawner};
pub use worker::{truncate_log, CallbackClient, ShellWorker, MAX_LOG_BYTES};
