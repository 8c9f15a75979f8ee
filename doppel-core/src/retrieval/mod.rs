//! Relevance ranking: cosine similarity weighted by importance, per-type
//! recency and an optional, capped trait bias.
//!
//! The ranker is read-only. Touching access statistics of returned records
//! is the store's job, after ranking has finished.

pub mod scoring;

use std::cmp::Ordering;

use ordered_float::OrderedFloat;
use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::memory::{AffinityIndex, MemoryRecord};
use crate::personality::TraitVector;
use crate::types::{Embedding, MemoryType, Timestamp};

/// A scored retrieval result.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    /// The retrieved record, with access statistics already updated.
    pub record: MemoryRecord,
    /// Final score.
    pub score: f64,
    /// Per-factor breakdown.
    pub breakdown: ScoreBreakdown,
}

/// Breakdown of a retrieval score into its factors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    /// Raw cosine similarity.
    pub similarity: f64,
    /// `1 + importance × importance_weight`.
    pub importance_factor: f64,
    /// Half-life decay factor for the record's type.
    pub recency_factor: f64,
    /// Trait-bias boost in [0, 0.15].
    pub trait_boost: f64,
    /// Product of all factors.
    pub total: f64,
}

/// Parameters of one similarity query.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryQuery {
    /// Maximum number of results.
    pub k: usize,
    /// Minimum final score.
    pub min_relevance: f64,
    /// Restrict to one memory type.
    pub type_filter: Option<MemoryType>,
}

impl MemoryQuery {
    /// Query with the configured defaults.
    #[must_use]
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            k: config.top_k,
            min_relevance: config.min_relevance,
            type_filter: None,
        }
    }

    /// Set `k`.
    #[must_use]
    pub fn top(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Set the minimum score.
    #[must_use]
    pub fn min_relevance(mut self, min: f64) -> Self {
        self.min_relevance = min;
        self
    }

    /// Restrict to a memory type.
    #[must_use]
    pub fn of_type(mut self, memory_type: MemoryType) -> Self {
        self.type_filter = Some(memory_type);
        self
    }
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

/// One ranked hit before access statistics are touched.
#[derive(Debug, Clone, Copy)]
pub struct RankedHit {
    /// Index of the record in the ranked slice.
    pub index: usize,
    /// Score breakdown.
    pub breakdown: ScoreBreakdown,
}

/// Scores stored memories against a query embedding.
#[derive(Debug, Clone)]
pub struct RelevanceRanker {
    config: RetrievalConfig,
}

impl RelevanceRanker {
    /// Create a new ranker.
    #[must_use]
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }

    /// The ranking configuration.
    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Score one record.
    #[must_use]
    pub fn score(
        &self,
        record: &MemoryRecord,
        query: &Embedding,
        now: Timestamp,
        affinity: &AffinityIndex,
        traits: Option<&TraitVector>,
    ) -> ScoreBreakdown {
        scoring::compute_breakdown(record, query, now, affinity.get(&record.id), traits, &self.config)
    }

    /// Rank `records`: filter by type and `min_relevance`, sort by score
    /// descending (ties: more recently accessed first, then id) and keep the
    /// top `k`.
    #[must_use]
    pub fn rank(
        &self,
        records: &[MemoryRecord],
        query: &Embedding,
        request: &MemoryQuery,
        now: Timestamp,
        affinity: &AffinityIndex,
        traits: Option<&TraitVector>,
    ) -> Vec<RankedHit> {
        if request.k == 0 {
            return Vec::new();
        }

        let mut hits: Vec<RankedHit> = records
            .iter()
            .enumerate()
            .filter(|(_, r)| request.type_filter.is_none_or(|t| r.memory_type == t))
            .map(|(index, r)| RankedHit {
                index,
                breakdown: self.score(r, query, now, affinity, traits),
            })
            .filter(|h| h.breakdown.total.is_finite() && h.breakdown.total >= request.min_relevance)
            .collect();

        hits.sort_by(|a, b| compare_hits(a, b, records));
        hits.truncate(request.k);
        hits
    }
}

fn compare_hits(a: &RankedHit, b: &RankedHit, records: &[MemoryRecord]) -> Ordering {
    let (ra, rb) = (&records[a.index], &records[b.index]);
    OrderedFloat(b.breakdown.total)
        .cmp(&OrderedFloat(a.breakdown.total))
        .then_with(|| rb.last_accessed_at.cmp(&ra.last_accessed_at))
        .then_with(|| ra.id.cmp(&rb.id))
}
