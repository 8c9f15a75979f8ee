//! Memory ↔ trait co-occurrence weights.
//!
//! When an interaction moves a trait, every memory written by that same
//! interaction gains `|Δ|` weight toward the trait. Retrieval reads the
//! weights to find each memory's dominant trait for the trait-bias boost.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::types::MemoryId;

/// One affinity row, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AffinityRow {
    /// Memory the weight belongs to.
    pub memory_id: MemoryId,
    /// Trait name.
    pub trait_name: String,
    /// Accumulated weight (always ≥ 0).
    pub weight: f32,
}

/// Per-memory trait weights.
#[derive(Debug, Clone, Default)]
pub struct AffinityIndex {
    weights: HashMap<MemoryId, BTreeMap<String, f32>>,
}

impl AffinityIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted rows.
    #[must_use]
    pub fn from_rows(rows: impl IntoIterator<Item = AffinityRow>) -> Self {
        let mut index = Self::new();
        for row in rows {
            index.set(&row);
        }
        index
    }

    /// Weights for one memory.
    #[must_use]
    pub fn get(&self, id: &MemoryId) -> Option<&BTreeMap<String, f32>> {
        self.weights.get(id)
    }

    /// Current weight of one (memory, trait) pair, 0 when absent.
    #[must_use]
    pub fn weight(&self, id: &MemoryId, trait_name: &str) -> f32 {
        self.weights
            .get(id)
            .and_then(|m| m.get(trait_name))
            .copied()
            .unwrap_or(0.0)
    }

    /// The trait with the largest weight for `id`. Ties go to the
    /// alphabetically first trait.
    #[must_use]
    pub fn dominant(&self, id: &MemoryId) -> Option<(&str, f32)> {
        let mut best: Option<(&str, f32)> = None;
        for (name, &w) in self.weights.get(id)? {
            if w > 0.0 && best.is_none_or(|(_, bw)| w > bw) {
                best = Some((name.as_str(), w));
            }
        }
        best
    }

    /// Overwrite one row.
    pub fn set(&mut self, row: &AffinityRow) {
        self.weights
            .entry(row.memory_id)
            .or_default()
            .insert(row.trait_name.clone(), row.weight.max(0.0));
    }

    /// Drop all weights of a memory.
    pub fn remove(&mut self, id: &MemoryId) {
        self.weights.remove(id);
    }

    /// All rows, in no particular order.
    pub fn rows(&self) -> impl Iterator<Item = AffinityRow> + '_ {
        self.weights.iter().flat_map(|(id, m)| {
            m.iter().map(move |(name, &weight)| AffinityRow {
                memory_id: *id,
                trait_name: name.clone(),
                weight,
            })
        })
    }

    /// Number of memories with at least one weight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// Whether no memory carries a weight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}
