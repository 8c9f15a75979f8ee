//! Per-factor scoring functions for memory retrieval.
//!
//! Score = cosine(q, e) × (1 + importance · w) × recency × (1 + trait_boost)
//!
//! Where:
//!   recency      = 0.5 ^ (hours_since_access / half_life(type))
//!   trait_boost  = min(cap, bias_weight · s · value(dominant trait)),
//!                  s = affinity / (affinity + 1)

use std::collections::BTreeMap;

use crate::config::RetrievalConfig;
use crate::decay;
use crate::memory::MemoryRecord;
use crate::personality::TraitVector;
use crate::retrieval::ScoreBreakdown;
use crate::types::{Embedding, Timestamp};

/// Compute the full score breakdown for one record.
#[must_use]
pub fn compute_breakdown(
    record: &MemoryRecord,
    query: &Embedding,
    now: Timestamp,
    affinity: Option<&BTreeMap<String, f32>>,
    traits: Option<&TraitVector>,
    config: &RetrievalConfig,
) -> ScoreBreakdown {
    let similarity = similarity(record, query);
    let importance_factor = importance_factor(record.importance, config.importance_weight);
    let recency_factor = decay::recency_factor(record, now, config);

    let trait_boost = match (affinity, traits) {
        (Some(weights), Some(traits)) if config.trait_bias_enabled && similarity > 0.0 => {
            trait_boost(weights, traits, config)
        }
        _ => 0.0,
    };

    let total = similarity * importance_factor * recency_factor * (1.0 + trait_boost);
    ScoreBreakdown {
        similarity,
        importance_factor,
        recency_factor,
        trait_boost,
        total,
    }
}

/// Raw cosine similarity in [-1, 1].
fn similarity(record: &MemoryRecord, query: &Embedding) -> f64 {
    f64::from(query.cosine_similarity(&record.embedding))
}

/// `1 + importance × weight`.
#[must_use]
pub fn importance_factor(importance: f32, weight: f32) -> f64 {
    1.0 + f64::from(importance.clamp(0.0, 1.0)) * f64::from(weight)
}

/// Trait-bias boost for a memory with the given affinity weights.
///
/// Only the memory's dominant trait counts. The result never exceeds
/// `max_trait_boost` (itself capped at +15% by configuration validation).
#[must_use]
pub fn trait_boost(weights: &BTreeMap<String, f32>, traits: &TraitVector, config: &RetrievalConfig) -> f64 {
    let dominant = weights
        .iter()
        .filter(|(_, w)| **w > 0.0)
        .fold(None, |best: Option<(&String, f32)>, (k, &w)| match best {
            Some((_, bw)) if bw >= w => best,
            _ => Some((k, w)),
        });
    let Some((name, weight)) = dominant else {
        return 0.0;
    };
    let Some(value) = traits.get(name) else {
        return 0.0;
    };

    let strength = f64::from(weight) / (f64::from(weight) + 1.0);
    let raw = f64::from(config.trait_bias_weight) * strength * f64::from(value);
    raw.clamp(0.0, f64::from(config.max_trait_boost.min(crate::config::TRAIT_BOOST_CEILING)))
}
