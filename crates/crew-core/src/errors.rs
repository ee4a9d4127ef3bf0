use std::time::Duration;

/// Errors raised while opening or reading a provider chunk source.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source exhausted: {0}")]
    Exhausted(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("provider overloaded")]
    ProviderOverloaded,

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StreamInterrupted(_) | Self::ProviderOverloaded)
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Exhausted(_) => "exhausted",
            Self::InvalidRequest(_) => "invalid_request",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SourceError::StreamInterrupted("eof".into()).is_retryable());
        assert!(SourceError::ProviderOverloaded.is_retryable());
        assert!(!SourceError::Cancelled.is_retryable());
        assert!(!SourceError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!SourceError::Exhausted("none left".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(SourceError::Cancelled.error_kind(), "cancelled");
        assert_eq!(SourceError::ProviderOverloaded.error_kind(), "provider_overloaded");
        assert_eq!(SourceError::Exhausted("x".into()).error_kind(), "exhausted");
    }
}
