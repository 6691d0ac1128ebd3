use thiserror::Error;

/// Failure modes of one streamed model call.
///
/// The retry loop treats overload, rate-limit, timeout, connection, and
/// truncated-stream failures as retryable; everything else breaks the call.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("model endpoint overloaded: {0}")]
    Overloaded(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("event stream ended unexpectedly: {0}")]
    Stream(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("API error ({kind}): {message}")]
    Api { kind: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Overloaded(_)
            | Self::RateLimited(_)
            | Self::Timeout
            | Self::Connection(_)
            | Self::Stream(_) => true,
            Self::Http { status, .. } => {
                matches!(*status, 408 | 429 | 529) || (500..600).contains(status)
            }
            Self::Api { kind, .. } => {
                kind.contains("overloaded") || kind.contains("rate_limit") || kind.contains("timeout")
            }
            Self::Config(_) => false,
        }
    }

    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited(body),
            529 => Self::Overloaded(body),
            _ => Self::Http { status, body },
        }
    }

    /// Classify a transport-level reqwest failure.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_builder() {
            Self::Config(err.to_string())
        } else {
            // Connect failures, resets mid-body, and decode failures all look
            // like broken transport to the retry loop.
            Self::Connection(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_family_is_retryable() {
        assert!(LlmError::Overloaded("529".into()).is_retryable());
        assert!(LlmError::RateLimited("slow down".into()).is_retryable());
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::Connection("reset by peer".into()).is_retryable());
        assert!(LlmError::Stream("ended mid-block".into()).is_retryable());
    }

    #[test]
    fn http_status_classification() {
        assert!(LlmError::from_status(529, String::new()).is_retryable());
        assert!(LlmError::from_status(429, String::new()).is_retryable());
        assert!(LlmError::from_status(503, String::new()).is_retryable());
        assert!(!LlmError::from_status(400, String::new()).is_retryable());
        assert!(!LlmError::from_status(401, String::new()).is_retryable());
    }

    #[test]
    fn api_error_kind_classification() {
        let overloaded = LlmError::Api {
            kind: "overloaded_error".into(),
            message: "Overloaded".into(),
        };
        assert!(overloaded.is_retryable());

        let invalid = LlmError::Api {
            kind: "invalid_request_error".into(),
            message: "bad tool schema".into(),
        };
        assert!(!invalid.is_retryable());
    }

    #[test]
    fn config_errors_are_fatal() {
        assert!(!LlmError::Config("no api key".into()).is_retryable());
    }
}
