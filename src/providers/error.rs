use std::fmt;

/// Classified provider error — tells the caller *why* the LLM call failed
/// so it can pick the right recovery strategy.
#[derive(Debug)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Seconds to wait before retrying (from a 429 Retry-After header or body).
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// 401/403 — bad API key or permissions.
    Auth,
    /// 429 — rate limited; check retry_after_secs.
    RateLimit,
    /// 408, request timeout, or provider took too long.
    Timeout,
    /// Connection refused, DNS failure, reset, etc.
    Network,
    /// 500/502/503/504 — provider-side outage.
    ServerError,
    /// Prompt exceeds the model context window; retrying cannot help.
    ContextLength,
    /// 400 — malformed request.
    InvalidRequest,
    /// Anything else.
    Unknown,
}

impl ProviderError {
    pub fn from_status(status: u16, body: &str, retry_after_header: Option<u64>) -> Self {
        let kind = match status {
            401 | 403 => ProviderErrorKind::Auth,
            408 => ProviderErrorKind::Timeout,
            429 => ProviderErrorKind::RateLimit,
            500 | 502 | 503 | 504 => ProviderErrorKind::ServerError,
            400 => {
                if body.contains("context") && body.contains("length")
                    || body.contains("prompt is too long")
                    || body.contains("max_tokens")
                {
                    ProviderErrorKind::ContextLength
                } else {
                    ProviderErrorKind::InvalidRequest
                }
            }
            _ => ProviderErrorKind::Unknown,
        };

        let retry_after_secs = if kind == ProviderErrorKind::RateLimit {
            retry_after_header.or_else(|| extract_retry_after(body))
        } else {
            None
        };

        Self {
            kind,
            status: Some(status),
            message: truncate_body(body),
            retry_after_secs,
        }
    }

    pub fn network(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderErrorKind::Timeout
        } else {
            ProviderErrorKind::Network
        };
        Self {
            kind,
            status: None,
            message: err.to_string(),
            retry_after_secs: None,
        }
    }

    pub fn timeout(secs: u64) -> Self {
        Self {
            kind: ProviderErrorKind::Timeout,
            status: None,
            message: format!("request exceeded {}s deadline", secs),
            retry_after_secs: None,
        }
    }

    /// Whether this error is worth retrying (same request, same model).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimit
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::Network
                | ProviderErrorKind::ServerError
        ) || self.message.to_lowercase().contains("rate limit")
    }

    /// Short user-facing line for unrecoverable classes.
    pub fn user_message(&self) -> String {
        match self.kind {
            ProviderErrorKind::Auth => {
                "LLM API authentication failed. Check the configured API key.".to_string()
            }
            ProviderErrorKind::ContextLength => {
                "The conversation no longer fits the model. Try /compact to summarize older history."
                    .to_string()
            }
            ProviderErrorKind::RateLimit => "Rate limited by the LLM provider.".to_string(),
            ProviderErrorKind::InvalidRequest => {
                format!("The LLM provider rejected the request: {}", self.message)
            }
            _ => format!("LLM error: {}", self.message),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(
                f,
                "Provider error ({}, {:?}): {}",
                status, self.kind, self.message
            )
        } else {
            write!(f, "Provider error ({:?}): {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for ProviderError {}

/// Classify an arbitrary anyhow error as transient or not.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(pe) = err.downcast_ref::<ProviderError>() {
        return pe.is_retryable();
    }
    let text = err.to_string().to_lowercase();
    text.contains("timed out")
        || text.contains("timeout")
        || text.contains("connection reset")
        || text.contains("connection refused")
        || text.contains("rate limit")
}

/// Try to parse retry_after from a JSON response body.
fn extract_retry_after(body: &str) -> Option<u64> {
    let v: serde_json::Value = serde_json::from_str(body).ok()?;
    v["error"]["retry_after"]
        .as_u64()
        .or_else(|| v["retry_after"].as_u64())
        .or_else(|| {
            v["error"]["retry_after"]
                .as_f64()
                .or_else(|| v["retry_after"].as_f64())
                .map(|f| f.ceil() as u64)
        })
}

fn truncate_body(body: &str) -> String {
    if body.len() > 300 {
        let mut end = 300;
        while end > 0 && !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            ProviderError::from_status(401, "", None).kind,
            ProviderErrorKind::Auth
        );
        assert_eq!(
            ProviderError::from_status(503, "", None).kind,
            ProviderErrorKind::ServerError
        );
        assert_eq!(
            ProviderError::from_status(429, "", None).kind,
            ProviderErrorKind::RateLimit
        );
        assert_eq!(
            ProviderError::from_status(400, r#"{"error":{"message":"prompt is too long"}}"#, None)
                .kind,
            ProviderErrorKind::ContextLength
        );
    }

    #[test]
    fn retry_after_prefers_header_over_body() {
        let e = ProviderError::from_status(429, r#"{"retry_after": 7}"#, Some(2));
        assert_eq!(e.retry_after_secs, Some(2));
        let e = ProviderError::from_status(429, r#"{"retry_after": 7}"#, None);
        assert_eq!(e.retry_after_secs, Some(7));
    }

    #[test]
    fn transient_covers_retryable_kinds_only() {
        assert!(ProviderError::from_status(500, "", None).is_retryable());
        assert!(ProviderError::from_status(408, "", None).is_retryable());
        assert!(!ProviderError::from_status(401, "", None).is_retryable());
        assert!(!ProviderError::from_status(400, "prompt is too long", None).is_retryable());
    }
}
