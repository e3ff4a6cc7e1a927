//! Kernel-level error type shared across stores and runtime components.

/// Error raised by kernel components.
///
/// `Transient` marks failures the caller may retry with backoff (spelled out
/// per subsystem); every other variant is terminal for the current
/// invocation. Lock contention is not an error at all — it is reported as
/// [`crate::state::LockAcquire::Contended`].
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("state store error: {0}")]
    State(String),
    #[error("artifact store error: {0}")]
    Artifact(String),
    #[error("dispatch error: {0}")]
    Dispatch(String),
    #[error("credential error: {0}")]
    Credential(String),
    #[error("key store error: {0}")]
    KeyStore(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("bundle error: {0}")]
    Bundle(String),
    #[error("code source error: {0}")]
    Source(String),
    #[error("vcs error: {0}")]
    Vcs(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("malformed notification: {0}")]
    Notification(String),
    /// Retryable failure in the named subsystem.
    #[error("transient {subsystem} failure: {message}")]
    Transient {
        subsystem: &'static str,
        message: String,
    },
}

impl KernelError {
    /// Whether the retry policy may re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, KernelError::Transient { .. })
    }
}
