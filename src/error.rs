use thiserror::Error;

/// The error-kind taxonomy shared by every component boundary.
///
/// Component-internal helpers compose with `anyhow::Result` the way the
/// rest of this codebase does; `CoreError` is what a worker entry point
/// or periodic-tick function returns, so callers can decide retry vs.
/// terminal failure without string-matching a message.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not authorized: {0}")]
    Authz(String),

    #[error("capacity exhausted for {gpu_type}: requested {requested}, available {available}")]
    CapacityExhausted {
        gpu_type: String,
        requested: i32,
        available: i32,
    },

    #[error("provider throttled: {0}")]
    ProviderThrottled(String),

    #[error("provider transient error: {0}")]
    ProviderTransient(String),

    #[error("provider permanent error: {0}")]
    ProviderPermanent(String),

    #[error("orchestrator transient error: {0}")]
    OrchestratorTransient(String),

    #[error("orchestrator permanent error: {0}")]
    OrchestratorPermanent(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// Whether this error should be retried (via queue redelivery / internal
    /// backoff) rather than transitioning the reservation to `failed`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ProviderThrottled(_)
                | CoreError::ProviderTransient(_)
                | CoreError::OrchestratorTransient(_)
        )
    }

    /// A short machine-stable tag for `failure_reason` columns.
    pub fn reason_tag(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::Authz(_) => "unauthorized",
            CoreError::CapacityExhausted { .. } => "capacity_exhausted",
            CoreError::ProviderThrottled(_) => "provider_throttled",
            CoreError::ProviderTransient(_) => "provider_transient",
            CoreError::ProviderPermanent(_) => "provider_error",
            CoreError::OrchestratorTransient(_) => "orchestrator_transient",
            CoreError::OrchestratorPermanent(_) => "orchestrator_error",
            CoreError::Conflict(_) => "conflict",
            CoreError::DeadlineExceeded(_) => "preparing_timeout",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        CoreError::Internal(anyhow::Error::new(e))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(CoreError::ProviderThrottled("x".into()).is_retryable());
        assert!(CoreError::ProviderTransient("x".into()).is_retryable());
        assert!(CoreError::OrchestratorTransient("x".into()).is_retryable());
        assert!(!CoreError::Validation("x".into()).is_retryable());
        assert!(!CoreError::Conflict("x".into()).is_retryable());
    }

    #[test]
    fn reason_tags_are_stable() {
        assert_eq!(
            CoreError::CapacityExhausted {
                gpu_type: "h100".into(),
                requested: 2,
                available: 0,
            }
            .reason_tag(),
            "capacity_exhausted"
        );
        assert_eq!(
            CoreError::DeadlineExceeded("timeout".into()).reason_tag(),
            "preparing_timeout"
        );
    }
}
