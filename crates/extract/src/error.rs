use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Provider failures, split by whether trying again can help.
#[derive(Debug, Clone, Error)]
pub enum LlmError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),

    #[error("missing API key for {0}")]
    MissingApiKey(&'static str),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Timeout(_) | LlmError::Transient(_)
        )
    }

    /// Maps a non-success HTTP status to an error class.
    pub fn from_status(status: reqwest::StatusCode, body: &str, retry_after: Option<Duration>) -> Self {
        let detail = format!("{status}: {}", truncate(body, 200));
        match status.as_u16() {
            429 => LlmError::RateLimited { retry_after },
            408 | 409 | 529 => LlmError::Transient(detail),
            s if s >= 500 => LlmError::Transient(detail),
            _ => LlmError::Permanent(detail),
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(Duration::ZERO)
        } else if err.is_builder() || err.is_decode() {
            // An envelope that does not decode will not decode on a retry either
            LlmError::Permanent(err.to_string())
        } else {
            LlmError::Transient(err.to_string())
        }
    }
}

/// Every recovery strategy failed on a response.
#[derive(Debug, Clone)]
pub struct ParseFailure {
    /// `(strategy, reason)` in the order tried
    pub attempts: Vec<(&'static str, String)>,
    pub preview: String,
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed extraction response")?;
        if let Some((_, reason)) = self.attempts.first() {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseFailure {}

#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Parse(#[from] ParseFailure),
}

impl ExtractionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractionError::Llm(e) => e.is_retryable(),
            ExtractionError::Parse(_) => true,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ExtractionError::Llm(LlmError::RateLimited { retry_after }) => *retry_after,
            _ => None,
        }
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        let rate = LlmError::from_status(StatusCode::TOO_MANY_REQUESTS, "", Some(Duration::from_secs(7)));
        assert!(matches!(rate, LlmError::RateLimited { retry_after: Some(d) } if d.as_secs() == 7));
        assert!(rate.is_retryable());

        let overloaded = LlmError::from_status(StatusCode::from_u16(529).unwrap(), "overloaded", None);
        assert!(overloaded.is_retryable());

        let server = LlmError::from_status(StatusCode::BAD_GATEWAY, "", None);
        assert!(server.is_retryable());

        let bad_request = LlmError::from_status(StatusCode::BAD_REQUEST, "invalid model", None);
        assert!(!bad_request.is_retryable());
        assert!(bad_request.to_string().contains("invalid model"));
    }

    #[test]
    fn test_parse_failure_is_retryable() {
        let err = ExtractionError::Parse(ParseFailure {
            attempts: vec![("direct", "expected value".into())],
            preview: String::new(),
        });
        assert!(err.is_retryable());
        assert!(!ExtractionError::Llm(LlmError::MissingApiKey("anthropic")).is_retryable());
    }
}
