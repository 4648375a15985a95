//! Backend and transport failures.
//!
//! Every inference backend maps its native errors into [`LlmError`], so the
//! agent loop can classify a failure (retryable, rate-limited, timed out)
//! without knowing which vendor produced it. Retry *mechanics* belong to the
//! transport; the engine only reads these flags to decide whether to re-enter
//! its loop.

/// The unified error type returned by inference backends.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LlmError {
    /// An HTTP-level failure. `status` is `None` when no response arrived.
    #[error("HTTP error (status={status:?}): {message}")]
    Http {
        /// The HTTP status code, if one was received.
        status: Option<http::StatusCode>,
        /// Human-readable description.
        message: String,
        /// Whether the request may succeed if repeated.
        retryable: bool,
    },

    /// Credentials were rejected.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The request was malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A backend-specific error without a dedicated variant.
    #[error("Provider error ({code}): {message}")]
    Provider {
        /// Backend error code (e.g. `"overloaded"`).
        code: String,
        /// Human-readable description.
        message: String,
        /// Whether the request may succeed if repeated.
        retryable: bool,
    },

    /// The response body could not be interpreted.
    #[error("Response format error: {message}")]
    ResponseFormat {
        /// What went wrong.
        message: String,
        /// The raw body, for diagnostics.
        raw: String,
    },

    /// The request exceeded its deadline.
    #[error("Operation timed out after {elapsed_ms}ms")]
    Timeout {
        /// Milliseconds elapsed before the deadline fired.
        elapsed_ms: u64,
    },

    /// The transport gave up after repeated attempts.
    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Attempts made.
        attempts: u32,
        /// The final attempt's error.
        #[source]
        last_error: Box<LlmError>,
    },
}

impl LlmError {
    /// Returns `true` if the failure is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { retryable, .. } | Self::Provider { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if the backend signalled rate limiting, either with
    /// HTTP 429 or a provider code mentioning it.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == Some(http::StatusCode::TOO_MANY_REQUESTS),
            Self::Provider { code, .. } => {
                let code = code.to_ascii_lowercase();
                code.contains("rate") || code.contains("too_many_requests")
            }
            Self::RetryExhausted { last_error, .. } => last_error.is_rate_limited(),
            _ => false,
        }
    }

    /// Returns `true` for deadline failures, including ones wrapped in
    /// [`RetryExhausted`](Self::RetryExhausted).
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status == Some(http::StatusCode::GATEWAY_TIMEOUT),
            Self::RetryExhausted { last_error, .. } => last_error.is_timeout(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        Self::ResponseFormat {
            message: err.to_string(),
            raw: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_http() {
        let err = LlmError::Http {
            status: Some(http::StatusCode::TOO_MANY_REQUESTS),
            message: "slow down".into(),
            retryable: true,
        };
        let display = err.to_string();
        assert!(display.contains("429"));
        assert!(display.contains("slow down"));
    }

    #[test]
    fn test_retryable_flags() {
        assert!(LlmError::Timeout { elapsed_ms: 10 }.is_retryable());
        assert!(!LlmError::Auth("nope".into()).is_retryable());
        assert!(
            LlmError::Provider {
                code: "overloaded".into(),
                message: "busy".into(),
                retryable: true,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_rate_limit_detection() {
        let http = LlmError::Http {
            status: Some(http::StatusCode::TOO_MANY_REQUESTS),
            message: String::new(),
            retryable: true,
        };
        assert!(http.is_rate_limited());

        let provider = LlmError::Provider {
            code: "rate_limit_error".into(),
            message: String::new(),
            retryable: true,
        };
        assert!(provider.is_rate_limited());

        let wrapped = LlmError::RetryExhausted {
            attempts: 3,
            last_error: Box::new(http),
        };
        assert!(wrapped.is_rate_limited());
        assert!(!LlmError::InvalidRequest("x".into()).is_rate_limited());
    }

    #[test]
    fn test_timeout_detection() {
        assert!(LlmError::Timeout { elapsed_ms: 5 }.is_timeout());
        let gateway = LlmError::Http {
            status: Some(http::StatusCode::GATEWAY_TIMEOUT),
            message: String::new(),
            retryable: true,
        };
        assert!(gateway.is_timeout());
        assert!(!LlmError::Auth("x".into()).is_timeout());
    }

    #[test]
    fn test_retry_exhausted_source_chain() {
        use std::error::Error;
        let err = LlmError::RetryExhausted {
            attempts: 2,
            last_error: Box::new(LlmError::Auth("expired".into())),
        };
        let source = err.source().expect("source");
        assert!(source.to_string().contains("expired"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: LlmError = json_err.into();
        assert!(matches!(err, LlmError::ResponseFormat { .. }));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<LlmError>();
    }
}
