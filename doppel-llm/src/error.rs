//! Adapter error types and their mapping onto the core's collaborator errors.

use doppel_core::error::{CompletionError, EmbeddingError};
use thiserror::Error;

/// Errors raised by the HTTP adapters and the prompt engine.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request failed.
    #[error("LLM request failed: {0}")]
    RequestFailed(String),

    /// Response body was not the JSON we expected.
    #[error("failed to parse LLM response: {0}")]
    ParseError(String),

    /// Response parsed but lacks a required field.
    #[error("LLM output schema validation failed: {0}")]
    SchemaValidation(String),

    /// Request timed out.
    #[error("LLM request timed out after {0}ms")]
    Timeout(u64),

    /// Provider is unreachable or not configured.
    #[error("LLM provider unavailable: {0}")]
    Unavailable(String),

    /// All retry attempts exhausted.
    #[error("all LLM retry attempts exhausted after {attempts} tries: {last_error}")]
    RetriesExhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// Message of the final failure.
        last_error: String,
    },

    /// Bad adapter or prompt configuration.
    #[error("LLM configuration error: {0}")]
    ConfigError(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(0)
        } else if err.is_connect() {
            LlmError::Unavailable(err.to_string())
        } else {
            LlmError::RequestFailed(err.to_string())
        }
    }
}

impl From<LlmError> for CompletionError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Unavailable(msg) | LlmError::ConfigError(msg) => CompletionError::Unavailable(msg),
            LlmError::Timeout(ms) => CompletionError::Timeout(ms),
            other => CompletionError::RequestFailed(other.to_string()),
        }
    }
}

impl From<LlmError> for EmbeddingError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Timeout(ms) => EmbeddingError::Timeout(ms),
            LlmError::ParseError(reason) | LlmError::SchemaValidation(reason) => {
                EmbeddingError::Malformed { reason }
            }
            LlmError::Unavailable(msg) => EmbeddingError::Unavailable(msg),
            other => EmbeddingError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_stay_timeouts() {
        assert_eq!(CompletionError::from(LlmError::Timeout(500)), CompletionError::Timeout(500));
        assert_eq!(EmbeddingError::from(LlmError::Timeout(500)), EmbeddingError::Timeout(500));
    }

    #[test]
    fn exhausted_retries_are_request_failures() {
        let err = CompletionError::from(LlmError::RetriesExhausted {
            attempts: 3,
            last_error: "HTTP 503".into(),
        });
        assert!(matches!(err, CompletionError::RequestFailed(msg) if msg.contains("HTTP 503")));
    }

    #[test]
    fn unparseable_embedding_is_malformed() {
        let err = EmbeddingError::from(LlmError::SchemaValidation("missing field `embedding`".into()));
        assert!(matches!(err, EmbeddingError::Malformed { .. }));
    }
}
