use std::time::Duration;

/// Typed error taxonomy shared by every subsystem.
/// Boundary code wraps provider and repository failures into one of these
/// variants; the core matches only on the variant, never on source types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum MinbarError {
    // Non-retryable
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // Retryable
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    // Retryable by default, logged as unexpected
    #[error("internal: {0}")]
    Internal(String),

    // Operational
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, MinbarError>;

impl MinbarError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout(_) | Self::RateLimited { .. } | Self::Internal(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::NotFound(_) | Self::Unauthorized(_))
    }

    /// Retryable errors that indicate a degraded dependency, for readiness
    /// checks.
    pub fn is_health_relevant(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::RateLimited { .. })
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging/metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::Internal(_) => "internal",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

impl From<serde_json::Error> for MinbarError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidInput(format!("malformed payload: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(MinbarError::Unavailable("vector index down".into()).is_retryable());
        assert!(MinbarError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(MinbarError::RateLimited { retry_after: None }.is_retryable());
        assert!(MinbarError::Internal("missing embedding".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(MinbarError::InvalidInput("too many sub-queries".into()).is_fatal());
        assert!(MinbarError::NotFound("session".into()).is_fatal());
        assert!(MinbarError::Unauthorized("session owner mismatch".into()).is_fatal());
    }

    #[test]
    fn cancelled_is_neither() {
        assert!(!MinbarError::Cancelled.is_retryable());
        assert!(!MinbarError::Cancelled.is_fatal());
    }

    #[test]
    fn internal_is_not_health_relevant() {
        assert!(!MinbarError::Internal("bug".into()).is_health_relevant());
        assert!(MinbarError::Unavailable("queue".into()).is_health_relevant());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = MinbarError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(3)));
        assert_eq!(MinbarError::Unavailable("x".into()).suggested_delay(), None);
    }

    #[test]
    fn kind_strings() {
        assert_eq!(MinbarError::Cancelled.kind(), "cancelled");
        assert_eq!(MinbarError::invalid_input("x").kind(), "invalid_input");
        assert_eq!(MinbarError::RateLimited { retry_after: None }.kind(), "rate_limited");
    }

    #[test]
    fn malformed_json_maps_to_invalid_input() {
        let err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let mapped: MinbarError = err.into();
        assert!(mapped.is_fatal());
    }
}
