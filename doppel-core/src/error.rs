//! Error types for the doppel core library.
//!
//! Every failure a caller can observe is a distinct variant so it can decide
//! between retrying (transient collaborator failures), dropping (malformed
//! proposals) and aborting (broken internal invariants). See [`ErrorClass`].

use thiserror::Error;

use crate::types::MemoryId;

/// Top-level error type for all doppel operations.
#[derive(Error, Debug)]
pub enum TwinError {
    /// The embedding provider failed or returned an unusable vector.
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// The text-completion collaborator failed.
    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),

    /// The caller-imposed deadline around an analysis or reflection call expired.
    #[error("Extraction timed out after {elapsed_ms}ms")]
    ExtractionTimeout {
        /// Deadline that was exceeded, in milliseconds.
        elapsed_ms: u64,
    },

    /// A trait-update proposal was malformed and discarded as a whole.
    #[error("Invalid proposal: {0}")]
    InvalidProposal(#[from] InvalidProposalError),

    /// Eviction failed to make room. Indicates a logic error.
    #[error("Capacity invariant violated: {len} records for capacity {capacity}")]
    CapacityInvariantViolation {
        /// Configured `max_memories`.
        capacity: usize,
        /// Record count observed after eviction.
        len: usize,
    },

    /// A memory with the given ID was not found.
    #[error("Memory not found: {0}")]
    MemoryNotFound(MemoryId),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the embedding collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    /// Provider could not be reached.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Provider did not answer in time.
    #[error("provider timed out after {0}ms")]
    Timeout(u64),

    /// Provider answered with something that is not a usable vector.
    #[error("malformed vector: {reason}")]
    Malformed {
        /// What was wrong with it.
        reason: String,
    },

    /// Vector length differs from the store's fixed dimensionality.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimensionality fixed for the store.
        expected: usize,
        /// Dimensionality received.
        actual: usize,
    },
}

/// Failures of the text-completion collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompletionError {
    /// No backend configured or backend unreachable.
    #[error("completion backend unavailable: {0}")]
    Unavailable(String),

    /// The request was sent but failed.
    #[error("completion request failed: {0}")]
    RequestFailed(String),

    /// The backend did not answer in time.
    #[error("completion timed out after {0}ms")]
    Timeout(u64),

    /// The backend answered with no text.
    #[error("completion returned an empty response")]
    EmptyResponse,
}

/// Reasons a whole [`EvolutionProposal`](crate::evolution::EvolutionProposal) is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidProposalError {
    /// The proposal names a trait outside the configured trait set.
    #[error("unknown trait '{0}'")]
    UnknownTrait(String),

    /// A delta lies outside [-1, 1].
    #[error("delta {delta} for trait '{name}' outside [-1, 1]")]
    DeltaOutOfRange {
        /// Trait name.
        name: String,
        /// Offending delta.
        delta: f32,
    },

    /// A confidence lies outside [0, 1].
    #[error("confidence {confidence} for trait '{name}' outside [0, 1]")]
    ConfidenceOutOfRange {
        /// Trait name.
        name: String,
        /// Offending confidence.
        confidence: f32,
    },

    /// A delta or confidence is NaN or infinite.
    #[error("non-finite value for trait '{0}'")]
    NonFinite(String),
}

/// How a caller should react to a [`TwinError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// External call failed or timed out; retrying may succeed.
    Transient,
    /// Input was unusable; drop it.
    Drop,
    /// Internal invariant broken; stop using the instance.
    Fatal,
    /// Configuration, storage or I/O problem in the environment.
    Environment,
}

impl TwinError {
    /// Classify this error for retry/drop/abort decisions.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Embedding(_) | Self::Completion(_) | Self::ExtractionTimeout { .. } => {
                ErrorClass::Transient
            }
            Self::InvalidProposal(_) | Self::MemoryNotFound(_) => ErrorClass::Drop,
            Self::CapacityInvariantViolation { .. } => ErrorClass::Fatal,
            Self::Config(_) | Self::Serialization(_) | Self::Database(_) | Self::Io(_) => {
                ErrorClass::Environment
            }
        }
    }

    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, TwinError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        let e: TwinError = EmbeddingError::Timeout(10).into();
        assert_eq!(e.class(), ErrorClass::Transient);

        let e: TwinError = InvalidProposalError::UnknownTrait("curiosity".into()).into();
        assert_eq!(e.class(), ErrorClass::Drop);

        let e = TwinError::CapacityInvariantViolation { capacity: 3, len: 4 };
        assert_eq!(e.class(), ErrorClass::Fatal);
        assert!(!e.is_transient());
    }

    #[test]
    fn messages_name_the_trait() {
        let e = InvalidProposalError::UnknownTrait("curiosity".into());
        assert!(e.to_string().contains("curiosity"));
    }
}
