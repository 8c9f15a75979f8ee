//! Relevance decay as a pure function of elapsed time.
//!
//! Nothing here mutates a record. A memory's recency weight is recomputed
//! from `last_accessed_at` whenever it is ranked or considered for eviction:
//!
//! ```text
//! recency(m) = 0.5 ^ (hours_since_access(m) / half_life(type(m)))
//! ```
//!
//! A missing half-life means the type never decays. The periodic "decay"
//! maintenance step therefore only *reports* the current state; there is no
//! stored strength that could drift from wall-clock time.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::RetrievalConfig;
use crate::memory::MemoryRecord;
use crate::types::{MemoryType, Timestamp, hours_between};

/// Exponential half-life curve: 1.0 at age 0, 0.5 at one half-life.
///
/// `None` or a non-positive half-life means no decay.
#[must_use]
pub fn half_life_factor(age_hours: f64, half_life_hours: Option<f64>) -> f64 {
    match half_life_hours {
        Some(h) if h > 0.0 => 0.5_f64.powf(age_hours.max(0.0) / h),
        _ => 1.0,
    }
}

/// Recency factor of a record at `now`, using its type's half-life.
#[must_use]
pub fn recency_factor(record: &MemoryRecord, now: Timestamp, config: &RetrievalConfig) -> f64 {
    let age = hours_between(record.last_accessed_at, now);
    half_life_factor(age, config.half_life(record.memory_type))
}

/// Snapshot of how faded each memory type currently is.
#[derive(Debug, Clone, Serialize)]
pub struct DecayReport {
    /// When the report was computed.
    pub evaluated_at: Timestamp,
    /// Records inspected.
    pub total: usize,
    /// Per-type statistics (only types that have records).
    pub by_type: BTreeMap<MemoryType, TypeDecay>,
}

/// Recency statistics for one memory type.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TypeDecay {
    /// Number of records of this type.
    pub count: usize,
    /// Mean recency factor.
    pub mean_recency: f64,
    /// Smallest recency factor (most faded record).
    pub min_recency: f64,
}

/// Compute a [`DecayReport`] over `records` without modifying them.
pub fn report<'a>(
    records: impl IntoIterator<Item = &'a MemoryRecord>,
    now: Timestamp,
    config: &RetrievalConfig,
) -> DecayReport {
    let mut sums: BTreeMap<MemoryType, (usize, f64, f64)> = BTreeMap::new();
    let mut total = 0;
    for record in records {
        total += 1;
        let r = recency_factor(record, now, config);
        let entry = sums.entry(record.memory_type).or_insert((0, 0.0, f64::MAX));
        entry.0 += 1;
        entry.1 += r;
        entry.2 = entry.2.min(r);
    }

    let by_type = sums
        .into_iter()
        .map(|(t, (count, sum, min))| {
            (
                t,
                TypeDecay {
                    count,
                    mean_recency: sum / count as f64,
                    min_recency: min,
                },
            )
        })
        .collect();

    DecayReport {
        evaluated_at: now,
        total,
        by_type,
    }
}
