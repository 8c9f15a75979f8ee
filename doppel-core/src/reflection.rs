//! Reflection scheduling and context gathering.
//!
//! Once per period the twin looks back over the window since its last
//! reflection: it gathers the trait history and a sample of the memories
//! created in that window, asks the completion collaborator for a
//! synthesis, and stores the synthesis as one `semantic` memory with
//! elevated importance.
//!
//! This module holds the deterministic parts (when, what to gather, how to
//! summarise trait movement). The twin handle drives the completion call.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use crate::config::ReflectionConfig;
use crate::decay::DecayReport;
use crate::memory::{MemoryDraft, MemoryRecord, MemoryStore};
use crate::personality::{TraitHistoryEntry, TraitState};
use crate::types::{MemoryType, Timestamp};

/// Metadata `kind` of reflection memories.
pub const REFLECTION_KIND: &str = "reflection";

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Decides when a reflection is due.
#[derive(Debug, Clone)]
pub struct ReflectionScheduler {
    period: Duration,
    anchor: Timestamp,
    last_run: Option<Timestamp>,
}

impl ReflectionScheduler {
    /// A scheduler whose first period starts at `anchor`.
    #[must_use]
    pub fn new(config: &ReflectionConfig, anchor: Timestamp) -> Self {
        Self {
            period: Duration::days(i64::from(config.period_days.max(1))),
            anchor,
            last_run: None,
        }
    }

    /// Restore a scheduler from the most recent reflection memory in `store`.
    #[must_use]
    pub fn resume(config: &ReflectionConfig, anchor: Timestamp, store: &MemoryStore) -> Self {
        let mut scheduler = Self::new(config, anchor);
        scheduler.last_run = store
            .iter()
            .filter(|r| r.meta("kind") == Some(REFLECTION_KIND))
            .map(|r| r.created_at)
            .max();
        scheduler
    }

    /// Start of the current window.
    #[must_use]
    pub fn window_start(&self) -> Timestamp {
        self.last_run.unwrap_or(self.anchor)
    }

    /// When the next reflection becomes due. Saturates at the latest
    /// representable instant, so an out-of-range period is never due.
    #[must_use]
    pub fn next_due(&self) -> Timestamp {
        self.window_start()
            .checked_add_signed(self.period)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether a period boundary has been crossed.
    #[must_use]
    pub fn is_due(&self, now: Timestamp) -> bool {
        now >= self.next_due()
    }

    /// Time of the last completed reflection.
    #[must_use]
    pub fn last_run(&self) -> Option<Timestamp> {
        self.last_run
    }

    /// Record a completed reflection.
    pub fn mark_run(&mut self, now: Timestamp) {
        self.last_run = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Trend report
// ---------------------------------------------------------------------------

/// Movement of one trait over a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TraitTrend {
    /// Value at the window start.
    pub start: f32,
    /// Value at the window end.
    pub end: f32,
    /// Lowest value observed.
    pub min: f32,
    /// Highest value observed.
    pub max: f32,
}

impl TraitTrend {
    /// Net change over the window.
    #[must_use]
    pub fn change(&self) -> f32 {
        self.end - self.start
    }
}

/// Per-trait movement over a reflection window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraitTrendReport {
    /// Window start.
    pub from: Timestamp,
    /// Window end.
    pub to: Timestamp,
    /// Number of history entries inside the window.
    pub updates: usize,
    /// Trend per trait.
    pub traits: BTreeMap<String, TraitTrend>,
}

impl TraitTrendReport {
    /// Summarise `history` between `from` and `to`. The last entry before
    /// `from` (if any) provides the start values.
    #[must_use]
    pub fn from_history(history: &[TraitHistoryEntry], from: Timestamp, to: Timestamp) -> Self {
        let baseline = history.iter().rev().find(|e| e.timestamp < from);
        let inside: Vec<&TraitHistoryEntry> = history
            .iter()
            .filter(|e| e.timestamp >= from && e.timestamp < to)
            .collect();

        let mut traits: BTreeMap<String, TraitTrend> = BTreeMap::new();
        for entry in baseline.into_iter().chain(inside.iter().copied()) {
            for (name, value) in entry.snapshot.iter() {
                traits
                    .entry(name.to_string())
                    .and_modify(|t| {
                        t.end = value;
                        t.min = t.min.min(value);
                        t.max = t.max.max(value);
                    })
                    .or_insert(TraitTrend {
                        start: value,
                        end: value,
                        min: value,
                        max: value,
                    });
            }
        }

        Self {
            from,
            to,
            updates: inside.len(),
            traits,
        }
    }

    /// Traits sorted by absolute net change, largest first.
    #[must_use]
    pub fn biggest_movers(&self) -> Vec<(&str, f32)> {
        let mut movers: Vec<(&str, f32)> = self
            .traits
            .iter()
            .map(|(k, t)| (k.as_str(), t.change()))
            .collect();
        movers.sort_by(|a, b| b.1.abs().total_cmp(&a.1.abs()).then_with(|| a.0.cmp(b.0)));
        movers
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Everything a reflection prompt needs.
#[derive(Debug, Clone)]
pub struct ReflectionContext {
    /// Window start.
    pub from: Timestamp,
    /// Window end.
    pub to: Timestamp,
    /// Sampled memories from the window, oldest first.
    pub memories: Vec<MemoryRecord>,
    /// Total memories created in the window before sampling.
    pub memories_in_window: usize,
    /// Trait history entries in the window.
    pub history: Vec<TraitHistoryEntry>,
    /// Trait movement over the window.
    pub trend: TraitTrendReport,
}

impl ReflectionContext {
    /// Gather the window `[from, to)` from the store and trait state.
    ///
    /// At most `sample_size` memories are kept, chosen uniformly at random
    /// (seeded when `sample_seed` is set) and returned in creation order.
    #[must_use]
    pub fn gather(
        store: &MemoryStore,
        traits: &TraitState,
        from: Timestamp,
        to: Timestamp,
        config: &ReflectionConfig,
    ) -> Self {
        let in_window = store.between(from, to);
        let memories_in_window = in_window.len();
        let memories: Vec<MemoryRecord> = if in_window.len() <= config.sample_size {
            in_window.into_iter().cloned().collect()
        } else {
            let mut rng = match config.sample_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let mut picked = rand::seq::index::sample(&mut rng, in_window.len(), config.sample_size).into_vec();
            picked.sort_unstable();
            picked.into_iter().map(|i| in_window[i].clone()).collect()
        };

        Self {
            from,
            to,
            memories,
            memories_in_window,
            history: traits.between(from, to).cloned().collect(),
            trend: TraitTrendReport::from_history(traits.history(), from, to),
        }
    }

    /// The memory draft that stores a synthesis of this window.
    #[must_use]
    pub fn synthesis_draft(&self, synthesis: &str, importance: f32) -> MemoryDraft {
        MemoryDraft::new(synthesis.trim())
            .with_type(MemoryType::Semantic)
            .with_importance(importance)
            .with_meta("kind", REFLECTION_KIND)
            .with_meta("period_start", self.from.to_rfc3339())
            .with_meta("period_end", self.to.to_rfc3339())
            .with_meta("memories_considered", self.memories.len().to_string())
    }
}

/// Result of a completed reflection.
#[derive(Debug, Clone)]
pub struct ReflectionOutcome {
    /// The stored synthesis memory.
    pub record: MemoryRecord,
    /// Records evicted to make room for it.
    pub evicted: Vec<MemoryRecord>,
    /// Insight lists parsed from the synthesis.
    pub insights: BTreeMap<String, Vec<String>>,
    /// Trait movement over the window.
    pub trend: TraitTrendReport,
    /// Decay state of the store at reflection time.
    pub decay: DecayReport,
    /// History entries dropped by the retention policy.
    pub history_pruned: usize,
}
