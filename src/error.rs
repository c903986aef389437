//! Error types for the chaos agent

use thiserror::Error;

/// Main error type for chaos operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API transport or server error
    #[error("kubernetes error: {0}")]
    Api(#[source] kube::Error),

    /// The object is already gone; usually absorbed to success
    #[error("not found: {0}")]
    NotFound(String),

    /// Eviction back-pressure from a pod disruption budget; retried
    #[error("eviction throttled: {0}")]
    Throttled(String),

    /// A watch channel terminated while we were still waiting for an event
    #[error("watch channel closed")]
    WatchClosed,

    /// A deployment does not meet its membership or phase predicates
    #[error("deployment not ready: {0}")]
    NotReady(String),

    /// Cluster member or collection replication has not converged
    #[error("not in sync: {0}")]
    NotInSync(String),

    /// The operation was cancelled through the shutdown token
    #[error("operation cancelled")]
    Cancelled,

    /// Database driver error
    #[error("database error: {0}")]
    Database(String),

    /// Bearer-token minting error
    #[error("token error: {0}")]
    Token(String),

    /// Filesystem error from the log archiver
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more per-pod failures collected during a node drain
    #[error("drain failed with {} error(s)", .0.len())]
    Drain(Vec<Error>),
}

impl Error {
    /// Classify a kube error by its API status code.
    ///
    /// `404` becomes [`Error::NotFound`] and `429` becomes
    /// [`Error::Throttled`] so callers can absorb or retry them; everything
    /// else stays a transport error.
    pub fn from_kube(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref response) if response.code == 404 => {
                Self::NotFound(response.message.clone())
            }
            kube::Error::Api(ref response) if response.code == 429 => {
                Self::Throttled(response.message.clone())
            }
            other => Self::Api(other),
        }
    }

    /// Create a not-ready error with the given message
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Create a not-in-sync error with the given message
    pub fn not_in_sync(msg: impl Into<String>) -> Self {
        Self::NotInSync(msg.into())
    }

    /// Create a database error with the given message
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a token error with the given message
    pub fn token(msg: impl Into<String>) -> Self {
        Self::Token(msg.into())
    }

    /// True if the object was already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True if the control plane asked us to back off
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::Throttled(_))
    }

    /// True if the operation was aborted by shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
