//! The evolution controller.
//!
//! A pure transformation: (trait state, proposal) → next trait vector, and
//! (memory draft, nearest stored similarity) → admission decision. It keeps
//! no state of its own; momentum is read from the trait history.
//!
//! Per tuple `(trait, delta, confidence)`:
//!
//! ```text
//! Δ   = clamp(delta · confidence · learning_rate + momentum · last_change, ±max_step)
//! new = clamp(old + Δ, 0, 1)
//! ```
//!
//! Validation happens before any arithmetic, so a malformed proposal can
//! never half-apply.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::{ExtractionConfig, PersonalityConfig};
use crate::error::InvalidProposalError;
use crate::memory::MemoryDraft;
use crate::personality::{TraitState, TraitVector};

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

/// One proposed trait change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitDelta {
    /// Trait name; must belong to the configured set.
    pub name: String,
    /// Signed change in [-1, 1].
    pub delta: f32,
    /// Confidence in [0, 1].
    pub confidence: f32,
}

/// Trait deltas and candidate memories derived from one interaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvolutionProposal {
    /// Ordered trait changes.
    pub trait_deltas: Vec<TraitDelta>,
    /// Candidate memories awaiting admission.
    pub memories: Vec<MemoryDraft>,
}

impl EvolutionProposal {
    /// An empty proposal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trait delta.
    #[must_use]
    pub fn with_delta(mut self, name: impl Into<String>, delta: f32, confidence: f32) -> Self {
        self.trait_deltas.push(TraitDelta {
            name: name.into(),
            delta,
            confidence,
        });
        self
    }

    /// Append a candidate memory.
    #[must_use]
    pub fn with_memory(mut self, draft: MemoryDraft) -> Self {
        self.memories.push(draft);
        self
    }

    /// Whether the proposal carries any trait signal.
    #[must_use]
    pub fn has_trait_signal(&self) -> bool {
        !self.trait_deltas.is_empty()
    }

    /// Whether the proposal carries nothing at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trait_deltas.is_empty() && self.memories.is_empty()
    }

    /// Deltas that move each named trait `weight` of the way toward its
    /// target value. Targets are visited in name order; unknown names pass
    /// through and are rejected at validation time.
    #[must_use]
    pub fn toward_targets(
        current: &TraitVector,
        targets: &BTreeMap<String, f32>,
        weight: f32,
        confidence: f32,
    ) -> Self {
        let trait_deltas = targets
            .iter()
            .map(|(name, &target)| {
                let from = current.get(name).unwrap_or(target);
                TraitDelta {
                    name: name.clone(),
                    delta: ((target - from) * weight).clamp(-1.0, 1.0),
                    confidence,
                }
            })
            .collect();
        Self {
            trait_deltas,
            memories: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Plans & decisions
// ---------------------------------------------------------------------------

/// A validated trait update, ready to be persisted and committed.
#[derive(Debug, Clone, PartialEq)]
pub struct TraitUpdatePlan {
    /// Vector after the update.
    pub next: TraitVector,
    /// Net applied change per trait (after clamping). Traits that did not
    /// move are absent.
    pub changes: BTreeMap<String, f32>,
}

impl TraitUpdatePlan {
    /// Largest absolute change.
    #[must_use]
    pub fn max_change(&self) -> f32 {
        self.changes.values().fold(0.0, |m, d| m.max(d.abs()))
    }
}

/// Whether a candidate memory may enter the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AdmissionDecision {
    /// Store it.
    Admit,
    /// Content is empty after trimming.
    RejectEmpty,
    /// Importance below `min_admission_importance`.
    RejectLowImportance,
    /// Too similar to an existing record.
    RejectDuplicate {
        /// Cosine similarity to the nearest stored record.
        similarity: f32,
    },
}

impl AdmissionDecision {
    /// Whether the memory is admitted.
    #[must_use]
    pub fn is_admitted(self) -> bool {
        self == Self::Admit
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Applies validated deltas under the learning-rate, step and momentum
/// bounds, and decides memory admission.
#[derive(Debug, Clone)]
pub struct EvolutionController {
    personality: PersonalityConfig,
    extraction: ExtractionConfig,
    default_importance: f32,
}

impl EvolutionController {
    /// Create a controller.
    #[must_use]
    pub fn new(personality: PersonalityConfig, extraction: ExtractionConfig, default_importance: f32) -> Self {
        Self {
            personality,
            extraction,
            default_importance,
        }
    }

    /// Personality settings in use.
    #[must_use]
    pub fn personality(&self) -> &PersonalityConfig {
        &self.personality
    }

    /// Reject the whole proposal if any tuple is malformed.
    ///
    /// # Errors
    ///
    /// [`InvalidProposalError`] naming the first offending tuple.
    pub fn validate(&self, traits: &TraitVector, proposal: &EvolutionProposal) -> Result<(), InvalidProposalError> {
        for d in &proposal.trait_deltas {
            if !traits.contains(&d.name) {
                return Err(InvalidProposalError::UnknownTrait(d.name.clone()));
            }
            if !d.delta.is_finite() || !d.confidence.is_finite() {
                return Err(InvalidProposalError::NonFinite(d.name.clone()));
            }
            if !(-1.0..=1.0).contains(&d.delta) {
                return Err(InvalidProposalError::DeltaOutOfRange {
                    name: d.name.clone(),
                    delta: d.delta,
                });
            }
            if !(0.0..=1.0).contains(&d.confidence) {
                return Err(InvalidProposalError::ConfidenceOutOfRange {
                    name: d.name.clone(),
                    confidence: d.confidence,
                });
            }
        }
        Ok(())
    }

    /// Compute the next trait vector for `proposal`. Tuples apply in order;
    /// momentum is added once per trait, on its first tuple.
    ///
    /// # Errors
    ///
    /// [`InvalidProposalError`] if validation fails; nothing is computed.
    pub fn plan(&self, state: &TraitState, proposal: &EvolutionProposal) -> Result<TraitUpdatePlan, InvalidProposalError> {
        let current = state.current();
        self.validate(current, proposal)?;

        let max_step = self.personality.max_step;
        let mut next = current.clone();
        let mut seen = HashSet::new();
        for d in &proposal.trait_deltas {
            let carried = if seen.insert(d.name.as_str()) {
                self.personality.momentum * state.last_change(&d.name)
            } else {
                0.0
            };
            let step = (d.delta * d.confidence * self.personality.learning_rate + carried).clamp(-max_step, max_step);
            let old = next.get(&d.name).unwrap_or_default();
            next.set(&d.name, old + step);
        }

        let changes = next
            .iter()
            .filter_map(|(name, v)| {
                let diff = v - current.get(name).unwrap_or(v);
                (diff != 0.0).then(|| (name.to_string(), diff))
            })
            .collect();
        Ok(TraitUpdatePlan { next, changes })
    }

    /// Decide whether a candidate memory is admitted. `nearest` is the
    /// highest similarity between the candidate and any stored record.
    #[must_use]
    pub fn admit(&self, draft: &MemoryDraft, nearest: Option<f32>) -> AdmissionDecision {
        if draft.content.trim().is_empty() {
            return AdmissionDecision::RejectEmpty;
        }
        let importance = draft.importance.unwrap_or(self.default_importance);
        if importance < self.extraction.min_admission_importance {
            return AdmissionDecision::RejectLowImportance;
        }
        match nearest {
            Some(similarity) if similarity >= self.extraction.duplicate_similarity => {
                AdmissionDecision::RejectDuplicate { similarity }
            }
            _ => AdmissionDecision::Admit,
        }
    }
}
