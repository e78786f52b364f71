use reqwest::StatusCode;

/// Provider-agnostic error classification shared by the vision and
/// enhancement clients. Transient errors are eligible for retry within
/// the orchestrator's budget; everything else demotes to a permanent
/// per-(photo, tool) failure.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider call timed out")]
    Timeout,

    #[error("provider rate limited the request")]
    RateLimited,

    #[error("provider returned server error {status}: {detail}")]
    Upstream { status: u16, detail: String },

    #[error("provider rejected the request ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to parse provider response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ProviderError {
    /// Classify an HTTP error status from a provider response.
    pub fn from_status(status: StatusCode, detail: String) -> Self {
        match status.as_u16() {
            408 => ProviderError::Timeout,
            429 => ProviderError::RateLimited,
            code if code >= 500 => ProviderError::Upstream {
                status: code,
                detail,
            },
            code => ProviderError::Rejected {
                status: code,
                detail,
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout | ProviderError::RateLimited | ProviderError::Upstream { .. } => {
                true
            }
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Rejected { .. } | ProviderError::Parse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_5xx_are_transient() {
        assert!(ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new())
            .is_transient());
        assert!(
            ProviderError::from_status(StatusCode::BAD_GATEWAY, String::new()).is_transient()
        );
        assert!(ProviderError::Timeout.is_transient());
    }

    #[test]
    fn client_rejection_is_permanent() {
        let err = ProviderError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "bad".into());
        assert!(!err.is_transient());
    }
}
