use std::time::Duration;
use thiserror::Error;

/// Failure class of a single provider call.
///
/// The router branches on the class; none of these reach step code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Server-side or network failure worth retrying on the same provider.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// The call ran past its deadline. Retried like [`ProviderError::Transient`].
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    /// Credentials were refused. Retrying cannot help.
    #[error("provider authentication failed: {0}")]
    Auth(String),

    /// The provider asked us to slow down.
    #[error("provider rate limited: {message}")]
    RateLimit {
        /// Response detail.
        message: String,
        /// Server hint from `Retry-After`, when present.
        retry_after: Option<Duration>,
    },

    /// The provider refused the request itself (malformed, too large, ...).
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Whether the same provider should be tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_) | ProviderError::Timeout(_))
    }

    /// Short label used in logs and failure summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Transient(_) => "transient",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Auth(_) => "auth",
            ProviderError::RateLimit { .. } => "rate_limit",
            ProviderError::Rejected(_) => "rejected",
        }
    }
}

/// Map a non-success HTTP status to a failure class.
pub fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> ProviderError {
    let detail = format!("HTTP {status}: {}", truncate(body, 300));
    match status {
        401 | 403 => ProviderError::Auth(detail),
        429 => ProviderError::RateLimit {
            message: detail,
            retry_after,
        },
        408 | 500..=599 => ProviderError::Transient(detail),
        _ => ProviderError::Rejected(detail),
    }
}

/// Map a transport-level failure (no HTTP status) to a failure class.
pub fn classify_transport(err: &reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        return ProviderError::Timeout(timeout);
    }
    if let Some(status) = err.status() {
        return classify_status(status.as_u16(), &err.to_string(), None);
    }
    ProviderError::Transient(err.to_string())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(classify_status(401, "", None), ProviderError::Auth(_)));
        assert!(matches!(classify_status(403, "", None), ProviderError::Auth(_)));
        assert!(matches!(
            classify_status(429, "", Some(Duration::from_secs(2))),
            ProviderError::RateLimit {
                retry_after: Some(_),
                ..
            }
        ));
        for code in [408, 500, 502, 503, 504] {
            assert!(classify_status(code, "", None).is_retryable(), "{code}");
        }
        assert!(matches!(classify_status(400, "", None), ProviderError::Rejected(_)));
        assert!(matches!(classify_status(404, "", None), ProviderError::Rejected(_)));
    }

    #[test]
    fn test_only_transient_classes_retry() {
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!ProviderError::Auth("x".into()).is_retryable());
        assert!(!ProviderError::Rejected("x".into()).is_retryable());
        assert!(!ProviderError::RateLimit {
            message: "x".into(),
            retry_after: None
        }
        .is_retryable());
    }

    #[test]
    fn test_body_is_truncated_on_char_boundary() {
        let body = "é".repeat(400);
        let err = classify_status(500, &body, None);
        assert!(err.to_string().len() < 700);
    }
}
