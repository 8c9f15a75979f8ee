//! Capacity eviction.
//!
//! When the store is full, one record is removed before the new one goes in.
//! Each candidate gets a keep-score; the **lowest** score is evicted:
//!
//! ```text
//! keep(m) = importance × 0.5^(hours_since_access / eviction_half_life)
//!                      × (1 + ln(1 + access_count))
//! ```
//!
//! So the least important, least recently touched, least frequently touched
//! record goes first. Ties fall to the oldest `created_at`, then the id.
//!
//! Records retrieved inside the protection window are skipped. If every
//! record is protected, the protected record with the oldest `created_at`
//! is evicted instead: capacity is a hard ceiling.

use chrono::Duration;
use ordered_float::OrderedFloat;

use crate::config::MemoryConfig;
use crate::decay::half_life_factor;
use crate::memory::MemoryRecord;
use crate::types::{MemoryId, Timestamp, hours_between};

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

/// Keep-score of a record at `now`. **Lower** scores are evicted first.
#[must_use]
pub fn keep_score(record: &MemoryRecord, now: Timestamp, config: &MemoryConfig) -> f64 {
    let age = hours_between(record.last_accessed_at, now);
    let recency = half_life_factor(age, Some(config.eviction_half_life_hours));
    let frequency = 1.0 + f64::from(record.access_count).ln_1p();
    f64::from(record.importance) * recency * frequency
}

/// Whether `record` was retrieved within the protection window ending at `now`.
///
/// Creation alone does not count as an access.
#[must_use]
pub fn is_protected(record: &MemoryRecord, now: Timestamp, config: &MemoryConfig) -> bool {
    if !record.was_retrieved() || config.protection_window_minutes == 0 {
        return false;
    }
    // Cap at roughly a century so the conversion cannot overflow.
    let minutes = config.protection_window_minutes.min(52_560_000);
    let window = Duration::minutes(i64::try_from(minutes).unwrap_or(52_560_000));
    now.signed_duration_since(record.last_accessed_at) < window
}

// ---------------------------------------------------------------------------
// Victim selection
// ---------------------------------------------------------------------------

/// Why a victim was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Lowest keep-score among unprotected records.
    LowestScore,
    /// Every record was protected; the oldest one was removed.
    AllProtected,
}

/// The record chosen for eviction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Victim {
    /// Index into the slice passed to [`select_victim`].
    pub index: usize,
    /// Id of the record.
    pub id: MemoryId,
    /// Its keep-score at selection time.
    pub score: f64,
    /// Selection rule that applied.
    pub reason: EvictionReason,
}

/// Choose which record to evict from `records`, or `None` if it is empty.
#[must_use]
pub fn select_victim(records: &[MemoryRecord], now: Timestamp, config: &MemoryConfig) -> Option<Victim> {
    let by_age = |a: &MemoryRecord, b: &MemoryRecord| {
        a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
    };

    let unprotected = records
        .iter()
        .enumerate()
        .filter(|(_, r)| !is_protected(r, now, config))
        .map(|(i, r)| (i, r, keep_score(r, now, config)))
        .min_by(|(_, a, sa), (_, b, sb)| {
            OrderedFloat(*sa)
                .cmp(&OrderedFloat(*sb))
                .then_with(|| by_age(a, b))
        });

    if let Some((index, record, score)) = unprotected {
        return Some(Victim {
            index,
            id: record.id,
            score,
            reason: EvictionReason::LowestScore,
        });
    }

    records
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| by_age(a, b))
        .map(|(index, record)| Victim {
            index,
            id: record.id,
            score: keep_score(record, now, config),
            reason: EvictionReason::AllProtected,
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
