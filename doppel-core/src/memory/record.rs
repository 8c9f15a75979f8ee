//! Memory records and drafts.
//!
//! A [`MemoryRecord`] is immutable after admission except for its access
//! statistics, which only a successful retrieval touches. A [`MemoryDraft`]
//! is what producers hand to the store: content plus a suggested type and
//! importance, embedding not yet computed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Embedding, MemoryId, MemoryType, Timestamp};

/// One stored text fragment with its embedding and bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique, stable identifier.
    pub id: MemoryId,
    /// The remembered text.
    pub content: String,
    /// Embedding computed once at admission.
    pub embedding: Embedding,
    /// Kind of memory; selects the decay half-life.
    pub memory_type: MemoryType,
    /// Significance in [0, 1].
    pub importance: f32,
    /// Admission time.
    pub created_at: Timestamp,
    /// Last successful retrieval (creation time until first retrieval).
    pub last_accessed_at: Timestamp,
    /// Number of successful retrievals.
    pub access_count: u32,
    /// Provenance such as `source`, `interaction_id` or `kind`.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl MemoryRecord {
    /// Record a retrieval.
    pub(crate) fn record_access(&mut self, now: Timestamp) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = now;
    }

    /// Whether this record has ever been returned by a query.
    #[must_use]
    pub fn was_retrieved(&self) -> bool {
        self.access_count > 0
    }

    /// Metadata value by key.
    #[must_use]
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// A memory waiting for admission.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MemoryDraft {
    /// The text to remember.
    pub content: String,
    /// Suggested memory type; the store default is `Episodic`.
    pub memory_type: Option<MemoryType>,
    /// Suggested importance; clamped to [0, 1] on admission.
    pub importance: Option<f32>,
    /// Precomputed embedding, if the producer already has one.
    pub embedding: Option<Embedding>,
    /// Provenance.
    pub metadata: BTreeMap<String, String>,
}

impl MemoryDraft {
    /// Create a draft with only content.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Set the memory type.
    #[must_use]
    pub fn with_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    /// Set the importance.
    #[must_use]
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }

    /// Attach a precomputed embedding.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Add a metadata entry.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Turn the draft into a record. `default_importance` applies when the
    /// draft carries none (or a non-finite one).
    pub(crate) fn into_record(
        self,
        embedding: Embedding,
        default_importance: f32,
        now: Timestamp,
    ) -> MemoryRecord {
        let importance = self
            .importance
            .filter(|i| i.is_finite())
            .unwrap_or(default_importance)
            .clamp(0.0, 1.0);
        MemoryRecord {
            id: MemoryId::new(),
            content: self.content,
            embedding,
            memory_type: self.memory_type.unwrap_or(MemoryType::Episodic),
            importance,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn draft_defaults_apply() {
        let now = Utc::now();
        let record = MemoryDraft::new("walked the dog").into_record(Embedding(vec![1.0]), 0.4, now);
        assert_eq!(record.memory_type, MemoryType::Episodic);
        assert!((record.importance - 0.4).abs() < f32::EPSILON);
        assert_eq!(record.created_at, record.last_accessed_at);
        assert!(!record.was_retrieved());
    }

    #[test]
    fn importance_is_clamped() {
        let now = Utc::now();
        let record = MemoryDraft::new("x")
            .with_importance(7.0)
            .into_record(Embedding(vec![1.0]), 0.5, now);
        assert!((record.importance - 1.0).abs() < f32::EPSILON);

        let record = MemoryDraft::new("x")
            .with_importance(f32::NAN)
            .into_record(Embedding(vec![1.0]), 0.3, now);
        assert!((record.importance - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn access_updates_statistics() {
        let now = Utc::now();
        let mut record = MemoryDraft::new("x").into_record(Embedding(vec![1.0]), 0.5, now);
        let later = now + chrono::Duration::minutes(5);
        record.record_access(later);
        assert_eq!(record.access_count, 1);
        assert_eq!(record.last_accessed_at, later);
    }
}
