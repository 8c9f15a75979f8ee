//! The memory store.
//!
//! Owns every [`MemoryRecord`] of one twin plus the trait-affinity index.
//! Mutations come in two halves, `plan_*` (read-only, may fail) and
//! `commit_*` (infallible apart from the capacity check), so a caller can
//! persist the plan in between and leave memory untouched if that fails.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use crate::config::{MemoryConfig, RetrievalConfig};
use crate::decay::{self, DecayReport};
use crate::embedding;
use crate::error::{Result, TwinError};
use crate::eviction::{self, EvictionReason};
use crate::memory::{AffinityIndex, AffinityRow, MemoryDraft, MemoryRecord};
use crate::personality::TraitVector;
use crate::retrieval::{MemoryQuery, RankedHit, RelevanceRanker, ScoredMemory};
use crate::types::{Embedding, MemoryId, MemoryType, Timestamp};

/// A validated insert, not yet applied.
#[derive(Debug, Clone)]
pub struct InsertPlan {
    /// The record that will be stored.
    pub record: MemoryRecord,
    /// Records that must go first to respect capacity.
    pub evict: Vec<MemoryId>,
}

/// Result of a committed insert.
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    /// The stored record.
    pub record: MemoryRecord,
    /// Records removed to make room.
    pub evicted: Vec<MemoryRecord>,
}

/// Access-statistics update produced by ranking.
#[derive(Debug, Clone)]
pub struct TouchPlan {
    hits: Vec<(MemoryId, crate::retrieval::ScoreBreakdown)>,
    /// When the records were accessed.
    pub accessed_at: Timestamp,
}

impl TouchPlan {
    /// Ids that will be touched, in rank order.
    pub fn ids(&self) -> impl Iterator<Item = MemoryId> + '_ {
        self.hits.iter().map(|(id, _)| *id)
    }

    /// Whether nothing matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Bounded, similarity-searchable set of memory records.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    config: MemoryConfig,
    ranker: RelevanceRanker,
    records: Vec<MemoryRecord>,
    affinity: AffinityIndex,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(config: MemoryConfig, retrieval: RetrievalConfig) -> Self {
        Self {
            config,
            ranker: RelevanceRanker::new(retrieval),
            records: Vec::new(),
            affinity: AffinityIndex::new(),
        }
    }

    /// Rebuild a store from persisted records and affinity rows.
    ///
    /// Affinity rows for unknown records are discarded. A store loaded above
    /// capacity is trimmed on its next insert.
    #[must_use]
    pub fn from_parts(
        config: MemoryConfig,
        retrieval: RetrievalConfig,
        records: Vec<MemoryRecord>,
        affinity: Vec<AffinityRow>,
    ) -> Self {
        let ids: HashSet<MemoryId> = records.iter().map(|r| r.id).collect();
        let affinity = AffinityIndex::from_rows(affinity.into_iter().filter(|r| ids.contains(&r.memory_id)));
        if records.len() > config.max_memories {
            warn!(
                len = records.len(),
                capacity = config.max_memories,
                "loaded memory store exceeds capacity"
            );
        }
        Self {
            config,
            ranker: RelevanceRanker::new(retrieval),
            records,
            affinity,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.config.max_memories
    }

    /// Store configuration.
    #[must_use]
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// The ranker used by [`query`](Self::query).
    #[must_use]
    pub fn ranker(&self) -> &RelevanceRanker {
        &self.ranker
    }

    /// Look up one record.
    #[must_use]
    pub fn get(&self, id: &MemoryId) -> Option<&MemoryRecord> {
        self.records.iter().find(|r| r.id == *id)
    }

    /// Iterate all records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryRecord> {
        self.records.iter()
    }

    /// The trait-affinity index.
    #[must_use]
    pub fn affinity(&self) -> &AffinityIndex {
        &self.affinity
    }

    // -----------------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------------

    /// Validate `draft` with its computed `embedding` and decide what must be
    /// evicted. Nothing is modified.
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::Embedding`] if the embedding has the wrong
    /// dimensionality or non-finite components.
    pub fn plan_insert(&self, mut draft: MemoryDraft, embedding: Embedding, now: Timestamp) -> Result<InsertPlan> {
        embedding::validate(&embedding, self.config.embedding_dimensions)?;
        draft.embedding = None;
        let record = draft.into_record(embedding, self.config.default_importance, now);

        let excess = (self.records.len() + 1).saturating_sub(self.config.max_memories);
        let mut evict = Vec::with_capacity(excess);
        let mut pool: Cow<'_, [MemoryRecord]> = Cow::Borrowed(&self.records);
        while evict.len() < excess {
            let Some(victim) = eviction::select_victim(&pool, now, &self.config) else {
                break;
            };
            if victim.reason == EvictionReason::AllProtected {
                debug!(memory = %victim.id, "every record is protected; evicting the oldest");
            }
            evict.push(victim.id);
            if evict.len() < excess {
                pool.to_mut().remove(victim.index);
            }
        }

        Ok(InsertPlan { record, evict })
    }

    /// Apply an [`InsertPlan`].
    ///
    /// # Errors
    ///
    /// Returns [`TwinError::CapacityInvariantViolation`] if eviction did not
    /// free enough room. The store is left unchanged in that case.
    pub fn commit_insert(&mut self, plan: InsertPlan) -> Result<InsertOutcome> {
        let evict: HashSet<MemoryId> = plan.evict.iter().copied().collect();
        let remaining = self.records.iter().filter(|r| !evict.contains(&r.id)).count();
        if remaining + 1 > self.config.max_memories {
            return Err(TwinError::CapacityInvariantViolation {
                capacity: self.config.max_memories,
                len: remaining + 1,
            });
        }

        let mut evicted = Vec::with_capacity(evict.len());
        self.records.retain(|r| {
            if evict.contains(&r.id) {
                evicted.push(r.clone());
                false
            } else {
                true
            }
        });
        for record in &evicted {
            self.affinity.remove(&record.id);
            debug!(
                memory = %record.id,
                importance = record.importance,
                access_count = record.access_count,
                "evicted memory"
            );
        }

        self.records.push(plan.record.clone());
        debug!(memory = %plan.record.id, memory_type = %plan.record.memory_type, len = self.records.len(), "stored memory");
        Ok(InsertOutcome {
            record: plan.record,
            evicted,
        })
    }

    /// Insert a draft with its embedding, evicting if at capacity.
    ///
    /// # Errors
    ///
    /// See [`plan_insert`](Self::plan_insert) and
    /// [`commit_insert`](Self::commit_insert).
    pub fn insert(&mut self, draft: MemoryDraft, embedding: Embedding, now: Timestamp) -> Result<InsertOutcome> {
        let plan = self.plan_insert(draft, embedding, now)?;
        self.commit_insert(plan)
    }

    // -----------------------------------------------------------------------
    // Query
    // -----------------------------------------------------------------------

    /// Rank records against `query` without touching them.
    #[must_use]
    pub fn plan_query(
        &self,
        query: &Embedding,
        request: &MemoryQuery,
        traits: Option<&TraitVector>,
        now: Timestamp,
    ) -> TouchPlan {
        let hits: Vec<RankedHit> = self
            .ranker
            .rank(&self.records, query, request, now, &self.affinity, traits);
        TouchPlan {
            hits: hits
                .into_iter()
                .map(|h| (self.records[h.index].id, h.breakdown))
                .collect(),
            accessed_at: now,
        }
    }

    /// Record the access of every hit and return them in rank order.
    pub fn commit_query(&mut self, plan: TouchPlan) -> Vec<ScoredMemory> {
        let mut out = Vec::with_capacity(plan.hits.len());
        for (id, breakdown) in plan.hits {
            if let Some(record) = self.records.iter_mut().find(|r| r.id == id) {
                record.record_access(plan.accessed_at);
                out.push(ScoredMemory {
                    record: record.clone(),
                    score: breakdown.total,
                    breakdown,
                });
            }
        }
        out
    }

    /// Top-`k` records for `query`, touching each returned record.
    ///
    /// Never fails; an empty store yields an empty result.
    pub fn query(
        &mut self,
        query: &Embedding,
        request: &MemoryQuery,
        traits: Option<&TraitVector>,
        now: Timestamp,
    ) -> Vec<ScoredMemory> {
        let plan = self.plan_query(query, request, traits, now);
        self.commit_query(plan)
    }

    // -----------------------------------------------------------------------
    // Maintenance & read-only views
    // -----------------------------------------------------------------------

    /// Report the current decay state. Nothing is stored or deleted.
    #[must_use]
    pub fn decay(&self, now: Timestamp) -> DecayReport {
        decay::report(&self.records, now, self.ranker.config())
    }

    /// The `limit` most recently created records, newest first. Does not
    /// touch access statistics.
    #[must_use]
    pub fn recent(&self, limit: usize, type_filter: Option<MemoryType>) -> Vec<&MemoryRecord> {
        let mut out: Vec<&MemoryRecord> = self
            .records
            .iter()
            .filter(|r| type_filter.is_none_or(|t| r.memory_type == t))
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        out.truncate(limit);
        out
    }

    /// Records created with `from <= created_at < to`, oldest first.
    #[must_use]
    pub fn between(&self, from: Timestamp, to: Timestamp) -> Vec<&MemoryRecord> {
        let mut out: Vec<&MemoryRecord> = self
            .records
            .iter()
            .filter(|r| r.created_at >= from && r.created_at < to)
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Highest cosine similarity between `embedding` and any stored record.
    #[must_use]
    pub fn max_similarity(&self, embedding: &Embedding) -> Option<(MemoryId, f32)> {
        self.records
            .iter()
            .map(|r| (r.id, r.embedding.cosine_similarity(embedding)))
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    // -----------------------------------------------------------------------
    // Trait affinity
    // -----------------------------------------------------------------------

    /// New affinity rows after adding `|Δ|` of every moved trait to each
    /// memory in `ids`. Unknown ids and zero changes are skipped.
    #[must_use]
    pub fn plan_affinity(&self, ids: &[MemoryId], changes: &BTreeMap<String, f32>) -> Vec<AffinityRow> {
        let mut rows = Vec::new();
        for id in ids.iter().filter(|id| self.get(id).is_some()) {
            for (name, delta) in changes {
                let magnitude = delta.abs();
                if magnitude <= f32::EPSILON || !magnitude.is_finite() {
                    continue;
                }
                rows.push(AffinityRow {
                    memory_id: *id,
                    trait_name: name.clone(),
                    weight: self.affinity.weight(id, name) + magnitude,
                });
            }
        }
        rows
    }

    /// Install affinity rows produced by [`plan_affinity`](Self::plan_affinity).
    pub fn commit_affinity(&mut self, rows: &[AffinityRow]) {
        for row in rows {
            if self.get(&row.memory_id).is_some() {
                self.affinity.set(row);
            }
        }
    }
}
