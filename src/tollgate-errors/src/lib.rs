use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors raised by the route, version and reputation components.
///
/// Domain errors are returned to the caller before any state changes.
/// `DependencyDegraded` is only produced at the store boundary; the scorer
/// recovers from it locally and never hands it to request processing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("concurrent modification of `{key}`: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("dependency degraded: {0}")]
    DependencyDegraded(String),
}

impl GatewayError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn degraded(msg: impl Into<String>) -> Self {
        Self::DependencyDegraded(msg.into())
    }

    /// Whether the caller may retry the same operation after reloading state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. } | Self::DependencyDegraded(_))
    }

    /// Stable machine-readable code, used in CLI output and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::StateConflict(_) => "state_conflict",
            Self::NotFound(_) => "not_found",
            Self::ConcurrencyConflict { .. } => "concurrency_conflict",
            Self::DependencyDegraded(_) => "dependency_degraded",
        }
    }
}
