//! Trait state: the current vector plus its append-only history.

use serde::{Deserialize, Serialize};

use crate::config::PersonalityConfig;
use crate::personality::TraitVector;
use crate::types::Timestamp;

/// Cause recorded for the history entry written at construction.
pub const INITIAL_CAUSE: &str = "initial";

/// One immutable snapshot in the trait log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitHistoryEntry {
    /// When the snapshot was taken.
    pub timestamp: Timestamp,
    /// Full trait vector after the change.
    pub snapshot: TraitVector,
    /// Provenance, e.g. an interaction id or `reflection:<id>`.
    pub cause: String,
}

/// Exclusive owner of the current [`TraitVector`] and its history.
#[derive(Debug, Clone)]
pub struct TraitState {
    current: TraitVector,
    history: Vec<TraitHistoryEntry>,
}

impl TraitState {
    /// Fresh state from configuration, with one baseline history entry.
    #[must_use]
    pub fn new(config: &PersonalityConfig, now: Timestamp) -> Self {
        let current = TraitVector::from_config(config);
        let history = vec![TraitHistoryEntry {
            timestamp: now,
            snapshot: current.clone(),
            cause: INITIAL_CAUSE.to_string(),
        }];
        Self { current, history }
    }

    /// Restore from persisted parts. History is sorted by timestamp.
    #[must_use]
    pub fn from_parts(current: TraitVector, mut history: Vec<TraitHistoryEntry>) -> Self {
        history.sort_by_key(|e| e.timestamp);
        Self { current, history }
    }

    /// The current vector.
    #[must_use]
    pub fn current(&self) -> &TraitVector {
        &self.current
    }

    /// Full history, oldest first.
    #[must_use]
    pub fn history(&self) -> &[TraitHistoryEntry] {
        &self.history
    }

    /// Entries with `from <= timestamp < to`.
    pub fn between(&self, from: Timestamp, to: Timestamp) -> impl Iterator<Item = &TraitHistoryEntry> {
        self.history
            .iter()
            .filter(move |e| e.timestamp >= from && e.timestamp < to)
    }

    /// Change of `name` between the last two snapshots (0 with fewer than two).
    #[must_use]
    pub fn last_change(&self, name: &str) -> f32 {
        match self.history.as_slice() {
            [.., prev, last] => match (prev.snapshot.get(name), last.snapshot.get(name)) {
                (Some(a), Some(b)) => b - a,
                _ => 0.0,
            },
            _ => 0.0,
        }
    }

    /// Install `next` as current and append exactly one history entry.
    pub(crate) fn commit(&mut self, next: TraitVector, cause: &str, now: Timestamp) -> &TraitHistoryEntry {
        self.current = next;
        self.history.push(TraitHistoryEntry {
            timestamp: now,
            snapshot: self.current.clone(),
            cause: cause.to_string(),
        });
        &self.history[self.history.len() - 1]
    }

    /// Drop entries older than `cutoff`, always keeping the latest one.
    /// Returns how many were removed.
    pub fn prune_before(&mut self, cutoff: Timestamp) -> usize {
        let Some(last) = self.history.len().checked_sub(1) else {
            return 0;
        };
        let keep_from = self.history[..last]
            .iter()
            .position(|e| e.timestamp >= cutoff)
            .unwrap_or(last);
        self.history.drain(..keep_from).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn new_state_has_baseline_entry() {
        let state = TraitState::new(&PersonalityConfig::default(), Utc::now());
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.history()[0].cause, INITIAL_CAUSE);
        assert_eq!(state.last_change("openness"), 0.0);
    }

    #[test]
    fn commit_appends_one_entry() {
        let now = Utc::now();
        let mut state = TraitState::new(&PersonalityConfig::default(), now);
        let mut next = state.current().clone();
        next.set("openness", 0.6);
        state.commit(next, "interaction-1", now + Duration::seconds(1));
        assert_eq!(state.history().len(), 2);
        assert!((state.last_change("openness") - 0.1).abs() < 1e-6);
    }

    #[test]
    fn prune_keeps_latest() {
        let t0 = Utc::now() - Duration::days(400);
        let mut state = TraitState::new(&PersonalityConfig::default(), t0);
        let snapshot = state.current().clone();
        state.commit(snapshot.clone(), "old", t0 + Duration::days(1));
        state.commit(snapshot, "recent", t0 + Duration::days(399));

        let removed = state.prune_before(t0 + Duration::days(100));
        assert_eq!(removed, 2);
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.history()[0].cause, "recent");

        // Even an all-old history keeps its newest entry.
        assert_eq!(state.prune_before(t0 + Duration::days(1000)), 0);
        assert_eq!(state.history().len(), 1);
    }
}
