//! Error types for discovery operations.

/// Boxed error returned across the [`ClusterClient`](crate::ClusterClient) boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for discovery operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the registry and its watchers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The component was built with `enable = false` and cannot talk to a cluster.
    #[error("kubernetes component is disabled")]
    Disabled,

    /// The watcher app was shut down and cannot start new watches.
    #[error("watcher app has been shut down")]
    Stopped,

    /// The configuration is unusable (bad address, missing namespaces, ...).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration could not be loaded from its sources.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The Kubernetes client could not be constructed.
    #[error("kubernetes client error: {0}")]
    Client(#[from] kube::Error),

    /// A list, get or watch call against a single namespace failed.
    #[error("{operation} {kind} in namespace ({namespace}), err: {source}")]
    Namespace {
        /// The namespace the call was issued against.
        namespace: String,
        /// The operation that failed (`list`, `get` or `watch`).
        operation: &'static str,
        /// The resource kind the call was for.
        kind: crate::Kind,
        /// The underlying client error.
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub(crate) fn namespace(
        namespace: impl Into<String>,
        operation: &'static str,
        kind: crate::Kind,
        source: BoxError,
    ) -> Self {
        Self::Namespace {
            namespace: namespace.into(),
            operation,
            kind,
            source,
        }
    }

    /// Returns the namespace this error concerns, if any.
    #[must_use]
    pub fn namespace_name(&self) -> Option<&str> {
        match self {
            Self::Namespace { namespace, .. } => Some(namespace),
            _ => None,
        }
    }

    /// Returns `true` if this is the disabled-component error.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}
