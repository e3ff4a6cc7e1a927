//! ordo server: submission API plus the in-process notification loop that
//! drives the orchestrator.

mod api;
mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use ordo_kernel::{FsArtifactStore, NotificationSink, SqliteStateStore};
use ordo_runtime::{
    AdmissionPipeline, FsCredentialSource, GitCodeFetcher, MemoryKeyStore, Orchestrator,
    RoutingCodeFetcher, RuntimeConfig, ShellWorker, StoreCodeFetcher,
};

use routes::{build_router, AppState};

/// Bridges artifact-store writes into the orchestrator queue.
struct ChannelSink(mpsc::UnboundedSender<String>);

impl NotificationSink for ChannelSink {
    fn object_created(&self, key: &str) {
        if self.0.send(key.to_string()).is_err() {
            tracing::error!(key, "notification channel closed; event dropped");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ordo_runtime=info,ordo_server=info")),
        )
        .init();

    let config = RuntimeConfig::from_env()?;
    let addr = std::env::var("ORDO_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".into());
    let data_dir = PathBuf::from(
        std::env::var("ORDO_DATA_DIR").unwrap_or_else(|_| "./ordo-data".into()),
    );
    let secrets_dir = std::env::var("ORDO_SECRETS_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("secrets"));

    let (tx, mut notifications) = mpsc::unbounded_channel();
    let sink: Arc<dyn NotificationSink> = Arc::new(ChannelSink(tx));

    let internal = Arc::new(FsArtifactStore::with_sink(
        config.internal_bucket.clone(),
        data_dir.join(&config.internal_bucket),
        sink,
    ));
    let done = Arc::new(FsArtifactStore::new(
        config.done_bucket.clone(),
        data_dir.join(&config.done_bucket),
    ));
    let state = Arc::new(SqliteStateStore::new(data_dir.join("state.db")));
    let credentials = Arc::new(FsCredentialSource::new(secrets_dir));
    let keys = Arc::new(MemoryKeyStore::new());

    let fetcher = Arc::new(RoutingCodeFetcher::new(
        Arc::new(StoreCodeFetcher::new(internal.clone())),
        Arc::new(GitCodeFetcher::new(credentials.clone())),
    ));
    let dispatcher = Arc::new(ShellWorker::new(internal.clone()));

    let admission = Arc::new(AdmissionPipeline::new(
        state.clone(),
        internal.clone(),
        done.clone(),
        credentials.clone(),
        keys.clone(),
        fetcher,
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        state,
        internal,
        done,
        dispatcher,
        credentials,
        keys,
        config,
    ));

    // Callback notifications re-enter the orchestrator here; losing
    // invocations exit on lock contention, so ticks can run as they come.
    let loop_orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        while let Some(key) = notifications.recv().await {
            let orchestrator = loop_orchestrator.clone();
            tokio::spawn(async move {
                match orchestrator.handle_notification(&key).await {
                    Ok(outcome) => tracing::debug!(key = %key, ?outcome, "tick finished"),
                    Err(err) => tracing::warn!(key = %key, error = %err, "tick failed"),
                }
            });
        }
    });

    let app = build_router(AppState {
        admission,
        orchestrator,
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "ordo server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
