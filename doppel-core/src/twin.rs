//! The digital-twin instance handle.
//!
//! A [`DigitalTwin`] owns one memory store, one trait state and one
//! reflection scheduler behind a single mutex. There is no process-wide
//! twin: every operation goes through an explicit handle, and separate
//! handles share nothing.
//!
//! Network calls (embedding, completion) run with the lock released. Each
//! mutation then takes the lock once and follows plan → persist → commit,
//! so a failed SQLite write or an expired deadline leaves memory and
//! database unchanged.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::collab::{
    CompletionParams, CompletionProvider, MemoryUpdateContext, PromptRenderer, ReflectionPromptContext,
    ReplyContext,
};
use crate::config::TwinConfig;
use crate::decay::DecayReport;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{CompletionError, EmbeddingError, InvalidProposalError, Result, TwinError};
use crate::evolution::{AdmissionDecision, EvolutionController, EvolutionProposal};
use crate::extract::{self, ExtractionStats, UpdateExtractor};
use crate::memory::{InsertOutcome, MemoryDraft, MemoryRecord, MemoryStore};
use crate::persistence::{PersistenceEngine, TwinSnapshot};
use crate::personality::{TraitHistoryEntry, TraitState, TraitVector};
use crate::reflection::{ReflectionContext, ReflectionOutcome, ReflectionScheduler};
use crate::retrieval::{MemoryQuery, ScoredMemory};
use crate::types::{Embedding, MemoryId, MemoryType, Timestamp, TwinId};

/// Number of semantic memories shown to the interaction-analysis prompt.
const KNOWLEDGE_CONTEXT: usize = 10;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// A committed trait update.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    /// Vector before the update.
    pub previous: TraitVector,
    /// The history entry that was appended (its snapshot is the new vector).
    pub entry: TraitHistoryEntry,
    /// Net change per trait that moved.
    pub changes: BTreeMap<String, f32>,
}

/// What happened to the trait side of an interaction.
#[derive(Debug)]
pub enum TraitUpdate {
    /// Deltas were applied.
    Applied(AppliedUpdate),
    /// The analysis carried no trait deltas.
    NoSignal,
    /// The proposal was malformed and discarded as a whole.
    Rejected(InvalidProposalError),
    /// The analysis call failed or timed out; only the raw event was stored.
    AnalysisFailed(TwinError),
}

impl TraitUpdate {
    /// The applied update, if any.
    #[must_use]
    pub fn applied(&self) -> Option<&AppliedUpdate> {
        match self {
            Self::Applied(update) => Some(update),
            _ => None,
        }
    }
}

/// Why a candidate memory was not stored.
#[derive(Debug)]
pub enum Rejection {
    /// Admission policy said no.
    Admission(AdmissionDecision),
    /// Its embedding could not be computed.
    Embedding(EmbeddingError),
}

/// A candidate memory that was not stored.
#[derive(Debug)]
pub struct RejectedCandidate {
    /// Candidate text.
    pub content: String,
    /// Reason.
    pub reason: Rejection,
}

/// Result of [`DigitalTwin::interact`].
#[derive(Debug)]
pub struct InteractionOutcome {
    /// Id recorded in the metadata of every memory written here.
    pub interaction_id: String,
    /// The raw interaction event.
    pub raw_memory: MemoryRecord,
    /// Extracted memories that were stored.
    pub admitted: Vec<MemoryRecord>,
    /// Extracted memories that were not.
    pub rejected: Vec<RejectedCandidate>,
    /// Records evicted by any insert of this interaction.
    pub evicted: Vec<MemoryRecord>,
    /// Trait side of the interaction.
    pub trait_update: TraitUpdate,
    /// Extractor counters (all zero when analysis failed).
    pub stats: ExtractionStats,
}

/// Result of [`DigitalTwin::respond`].
#[derive(Debug)]
pub struct ReplyOutcome {
    /// The generated reply.
    pub reply: String,
    /// Memories retrieved for the prompt.
    pub memories: Vec<ScoredMemory>,
    /// The interaction pipeline run on the exchange.
    pub interaction: InteractionOutcome,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct TwinState {
    store: MemoryStore,
    traits: TraitState,
    scheduler: ReflectionScheduler,
    persistence: Option<PersistenceEngine>,
}

/// One digital twin: memory, personality and the collaborators that feed
/// them.
pub struct DigitalTwin<E, C, R> {
    id: TwinId,
    config: TwinConfig,
    embedder: E,
    completion: C,
    renderer: R,
    controller: EvolutionController,
    extractor: UpdateExtractor,
    params: CompletionParams,
    state: Mutex<TwinState>,
}

impl<E, C, R> std::fmt::Debug for DigitalTwin<E, C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalTwin")
            .field("id", &self.id)
            .field("name", &self.config.general.name)
            .finish_non_exhaustive()
    }
}

impl<E, C, R> DigitalTwin<E, C, R>
where
    E: EmbeddingProvider,
    C: CompletionProvider,
    R: PromptRenderer,
{
    /// Create a fresh twin with a new id. When `persistence.enabled` is set
    /// the database at `persistence.path` is opened and the twin saved.
    ///
    /// # Errors
    ///
    /// [`TwinError::Config`] for invalid configuration or an embedder whose
    /// dimensionality differs from `memory.embedding_dimensions`; database
    /// errors when persistence is enabled.
    pub fn new(config: TwinConfig, embedder: E, completion: C, renderer: R, now: Timestamp) -> Result<Self> {
        Self::open(TwinId::new(), config, embedder, completion, renderer, now)
    }

    /// Open twin `id`: restored from the configured database when
    /// persistence is enabled and the twin exists there, fresh otherwise.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn open(
        id: TwinId,
        config: TwinConfig,
        embedder: E,
        completion: C,
        renderer: R,
        now: Timestamp,
    ) -> Result<Self> {
        if config.persistence.enabled {
            let engine = PersistenceEngine::open(&config.persistence.path, &config.persistence)?;
            return Self::with_engine(id, config, embedder, completion, renderer, engine, now);
        }
        config.validate()?;
        let state = TwinState {
            store: MemoryStore::new(config.memory.clone(), config.retrieval.clone()),
            traits: TraitState::new(&config.personality, now),
            scheduler: ReflectionScheduler::new(&config.reflection, now),
            persistence: None,
        };
        Self::assemble(id, config, embedder, completion, renderer, state)
    }

    /// Open twin `id` against an explicit database. An unknown twin is
    /// created and saved immediately.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_engine(
        id: TwinId,
        config: TwinConfig,
        embedder: E,
        completion: C,
        renderer: R,
        mut engine: PersistenceEngine,
        now: Timestamp,
    ) -> Result<Self> {
        config.validate()?;
        let state = if let Some(snapshot) = engine.load_snapshot(&id)? {
            let store = MemoryStore::from_parts(
                config.memory.clone(),
                config.retrieval.clone(),
                snapshot.records,
                snapshot.affinity,
            );
            let traits = restore_traits(&config, snapshot.current, snapshot.history, now);
            let anchor = traits.history().first().map_or(now, |e| e.timestamp);
            let scheduler = ReflectionScheduler::resume(&config.reflection, anchor, &store);
            info!(twin = %id, memories = store.len(), "restored twin");
            TwinState {
                store,
                traits,
                scheduler,
                persistence: Some(engine),
            }
        } else {
            let store = MemoryStore::new(config.memory.clone(), config.retrieval.clone());
            let traits = TraitState::new(&config.personality, now);
            engine.save_snapshot(&TwinSnapshot {
                twin_id: id,
                records: Vec::new(),
                affinity: Vec::new(),
                current: traits.current().clone(),
                history: traits.history().to_vec(),
            })?;
            info!(twin = %id, "created twin");
            TwinState {
                store,
                traits,
                scheduler: ReflectionScheduler::new(&config.reflection, now),
                persistence: Some(engine),
            }
        };
        Self::assemble(id, config, embedder, completion, renderer, state)
    }

    fn assemble(
        id: TwinId,
        config: TwinConfig,
        embedder: E,
        completion: C,
        renderer: R,
        state: TwinState,
    ) -> Result<Self> {
        if embedder.dimensions() != config.memory.embedding_dimensions {
            return Err(TwinError::Config(format!(
                "embedder {} produces {} dimensions, memory.embedding_dimensions is {}",
                embedder.model_name(),
                embedder.dimensions(),
                config.memory.embedding_dimensions
            )));
        }
        Ok(Self {
            id,
            controller: EvolutionController::new(
                config.personality.clone(),
                config.extraction.clone(),
                config.memory.default_importance,
            ),
            extractor: UpdateExtractor::new(config.extraction.clone()),
            params: CompletionParams::from_config(&config.llm),
            config,
            embedder,
            completion,
            renderer,
            state: Mutex::new(state),
        })
    }

    // -----------------------------------------------------------------------
    // Collaborator calls (lock never held)
    // -----------------------------------------------------------------------

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let ms = self.config.llm.request_timeout_ms;
        let embedding = tokio::time::timeout(Duration::from_millis(ms), self.embedder.embed(text))
            .await
            .map_err(|_| EmbeddingError::Timeout(ms))??;
        embedding::validate(&embedding, self.config.memory.embedding_dimensions)?;
        Ok(embedding)
    }

    /// One completion call under a deadline. Expiry is reported as
    /// [`TwinError::ExtractionTimeout`].
    async fn complete(&self, prompt: &str, timeout_ms: u64) -> Result<String> {
        let text = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.completion.complete(prompt, &self.params),
        )
        .await
        .map_err(|_| TwinError::ExtractionTimeout { elapsed_ms: timeout_ms })??;
        Ok(text)
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    /// Store a memory, computing its embedding unless the draft carries one.
    ///
    /// # Errors
    ///
    /// [`TwinError::Embedding`] if the provider fails, times out or returns
    /// an unusable vector; nothing is stored in that case.
    pub async fn insert_memory(&self, mut draft: MemoryDraft, now: Timestamp) -> Result<InsertOutcome> {
        let embedding = match draft.embedding.take() {
            Some(embedding) => {
                embedding::validate(&embedding, self.config.memory.embedding_dimensions)?;
                embedding
            }
            None => self.embed(&draft.content).await?,
        };
        let mut guard = self.state.lock();
        self.insert_locked(&mut guard, draft, embedding, now)
    }

    fn insert_locked(
        &self,
        state: &mut TwinState,
        draft: MemoryDraft,
        embedding: Embedding,
        now: Timestamp,
    ) -> Result<InsertOutcome> {
        let plan = state.store.plan_insert(draft, embedding, now)?;
        if let Some(db) = state.persistence.as_mut() {
            db.apply_insert(&self.id, &plan)?;
        }
        state.store.commit_insert(plan)
    }

    /// Retrieve memories relevant to `text`. Returned records are touched.
    ///
    /// # Errors
    ///
    /// [`TwinError::Embedding`] if the query cannot be embedded.
    pub async fn query(&self, text: &str, request: &MemoryQuery, now: Timestamp) -> Result<Vec<ScoredMemory>> {
        let embedding = self.embed(text).await?;
        self.query_embedding(&embedding, request, now)
    }

    /// Retrieve memories relevant to a precomputed embedding.
    ///
    /// # Errors
    ///
    /// [`TwinError::Embedding`] for a vector of the wrong shape, database
    /// errors when recording the access fails.
    pub fn query_embedding(
        &self,
        embedding: &Embedding,
        request: &MemoryQuery,
        now: Timestamp,
    ) -> Result<Vec<ScoredMemory>> {
        embedding::validate(embedding, self.config.memory.embedding_dimensions)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let traits = self
            .config
            .retrieval
            .trait_bias_enabled
            .then(|| state.traits.current());
        let plan = state.store.plan_query(embedding, request, traits, now);
        if let Some(db) = state.persistence.as_mut() {
            let ids: Vec<_> = plan.ids().collect();
            db.touch_memories(&ids, &now)?;
        }
        Ok(state.store.commit_query(plan))
    }

    /// Split `text` into paragraph chunks and store each as a semantic
    /// memory tagged with `source`.
    ///
    /// # Errors
    ///
    /// Stops at the first failing chunk; earlier chunks stay stored.
    pub async fn import_text(&self, text: &str, source: &str, now: Timestamp) -> Result<Vec<InsertOutcome>> {
        let chunks = chunk_paragraphs(text, self.config.memory.import_chunk_chars);
        let total = chunks.len();
        let mut out = Vec::with_capacity(total);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let draft = MemoryDraft::new(chunk)
                .with_type(MemoryType::Semantic)
                .with_meta("source", source)
                .with_meta("chunk", format!("{}/{total}", i + 1));
            out.push(self.insert_memory(draft, now).await?);
        }
        info!(twin = %self.id, source, chunks = total, "imported text");
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Traits
    // -----------------------------------------------------------------------

    /// Apply the trait deltas of `proposal` atomically and append one
    /// history entry. Candidate memories in the proposal are ignored here.
    ///
    /// # Errors
    ///
    /// [`TwinError::InvalidProposal`] if any tuple is malformed; nothing
    /// changes in that case.
    pub fn apply(&self, proposal: &EvolutionProposal, cause: &str, now: Timestamp) -> Result<AppliedUpdate> {
        let mut guard = self.state.lock();
        self.apply_locked(&mut guard, proposal, cause, now)
    }

    fn apply_locked(
        &self,
        state: &mut TwinState,
        proposal: &EvolutionProposal,
        cause: &str,
        now: Timestamp,
    ) -> Result<AppliedUpdate> {
        let plan = self.controller.plan(&state.traits, proposal)?;
        let entry = TraitHistoryEntry {
            timestamp: now,
            snapshot: plan.next.clone(),
            cause: cause.to_string(),
        };
        if let Some(db) = state.persistence.as_mut() {
            db.append_trait_update(&self.id, &entry)?;
        }
        debug!(
            twin = %self.id,
            cause,
            moved = plan.changes.len(),
            max_change = plan.max_change(),
            "applied trait update"
        );
        let previous = state.traits.current().clone();
        state.traits.commit(plan.next, cause, now);
        Ok(AppliedUpdate {
            previous,
            entry,
            changes: plan.changes,
        })
    }

    // -----------------------------------------------------------------------
    // Interaction pipeline
    // -----------------------------------------------------------------------

    /// Record an interaction and learn from it.
    ///
    /// The raw exchange is stored first. The analysis completion then runs
    /// under `extraction.analysis_timeout_ms`; its failure is reported in
    /// [`InteractionOutcome::trait_update`] and does not undo the raw
    /// memory. Extracted memories pass admission, and trait deltas are
    /// applied as one update whose moved traits feed the affinity of every
    /// memory written here.
    ///
    /// # Errors
    ///
    /// [`TwinError::Embedding`] if the raw event cannot be embedded (nothing
    /// is written), database errors.
    #[tracing::instrument(skip(self, message, reply, now), fields(twin = %self.id))]
    pub async fn interact(&self, message: &str, reply: Option<&str>, now: Timestamp) -> Result<InteractionOutcome> {
        let interaction_id = uuid::Uuid::new_v4().to_string();
        let transcript = match reply {
            Some(reply) => format!("User: {}\n{}: {}", message.trim(), self.config.general.name, reply.trim()),
            None => format!("User: {}", message.trim()),
        };

        let raw_draft = MemoryDraft::new(transcript.clone())
            .with_type(self.config.memory.raw_event_type)
            .with_importance(self.config.memory.raw_event_importance)
            .with_meta("source", "interaction")
            .with_meta("interaction_id", interaction_id.clone());
        let raw = self.insert_memory(raw_draft, now).await?;
        let mut evicted = raw.evicted;
        let raw_memory = raw.record;

        let prompt = {
            let guard = self.state.lock();
            let knowledge: Vec<MemoryRecord> = guard
                .store
                .recent(KNOWLEDGE_CONTEXT, Some(MemoryType::Semantic))
                .into_iter()
                .cloned()
                .collect();
            self.renderer.render_memory_update(&MemoryUpdateContext {
                twin_name: &self.config.general.name,
                interaction: &transcript,
                traits: guard.traits.current(),
                knowledge: &knowledge,
            })
        };

        let analysis = match self.complete(&prompt, self.config.extraction.analysis_timeout_ms).await {
            Ok(text) => text,
            Err(e) => {
                warn!(interaction = %interaction_id, error = %e, "interaction analysis failed");
                return Ok(InteractionOutcome {
                    interaction_id,
                    raw_memory,
                    admitted: Vec::new(),
                    rejected: Vec::new(),
                    evicted,
                    trait_update: TraitUpdate::AnalysisFailed(e),
                    stats: ExtractionStats::default(),
                });
            }
        };

        let (proposal, stats) = self.extractor.extract_with_stats(&analysis);

        let mut rejected = Vec::new();
        let mut candidates = Vec::with_capacity(proposal.memories.len());
        for draft in &proposal.memories {
            let draft = draft.clone().with_meta("interaction_id", interaction_id.clone());
            match self.embed(&draft.content).await {
                Ok(embedding) => candidates.push((draft, embedding)),
                Err(TwinError::Embedding(e)) => {
                    warn!(interaction = %interaction_id, error = %e, "candidate memory not embedded");
                    rejected.push(RejectedCandidate {
                        content: draft.content,
                        reason: Rejection::Embedding(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut admitted = Vec::new();
        for (draft, embedding) in candidates {
            let nearest = state.store.max_similarity(&embedding).map(|(_, s)| s);
            let decision = self.controller.admit(&draft, nearest);
            if !decision.is_admitted() {
                debug!(interaction = %interaction_id, ?decision, "candidate memory rejected");
                rejected.push(RejectedCandidate {
                    content: draft.content,
                    reason: Rejection::Admission(decision),
                });
                continue;
            }
            let outcome = self.insert_locked(state, draft, embedding, now)?;
            evicted.extend(outcome.evicted);
            admitted.push(outcome.record);
        }

        let trait_update = if proposal.has_trait_signal() {
            let cause = format!("interaction:{interaction_id}");
            match self.apply_locked(state, &proposal, &cause, now) {
                Ok(update) => TraitUpdate::Applied(update),
                Err(TwinError::InvalidProposal(e)) => {
                    warn!(interaction = %interaction_id, error = %e, "trait proposal rejected");
                    TraitUpdate::Rejected(e)
                }
                Err(e) => return Err(e),
            }
        } else {
            TraitUpdate::NoSignal
        };

        if let TraitUpdate::Applied(update) = &trait_update {
            let ids: Vec<_> = std::iter::once(raw_memory.id)
                .chain(admitted.iter().map(|m| m.id))
                .collect();
            let rows = state.store.plan_affinity(&ids, &update.changes);
            if let Some(db) = state.persistence.as_mut() {
                db.write_affinity(&rows)?;
            }
            state.store.commit_affinity(&rows);
        }
        drop(guard);

        info!(
            interaction = %interaction_id,
            admitted = admitted.len(),
            rejected = rejected.len(),
            evicted = evicted.len(),
            applied = trait_update.applied().is_some(),
            "interaction processed"
        );
        Ok(InteractionOutcome {
            interaction_id,
            raw_memory,
            admitted,
            rejected,
            evicted,
            trait_update,
            stats,
        })
    }

    /// Answer `message` as the twin, then learn from the exchange.
    ///
    /// # Errors
    ///
    /// [`TwinError::Embedding`] for the retrieval step,
    /// [`TwinError::Completion`] if the reply call fails, times out
    /// ([`CompletionError::Timeout`]) or comes back empty.
    #[tracing::instrument(skip(self, message, now), fields(twin = %self.id))]
    pub async fn respond(&self, message: &str, now: Timestamp) -> Result<ReplyOutcome> {
        let memories = self.query(message, &MemoryQuery::from_config(&self.config.retrieval), now).await?;
        let prompt = {
            let guard = self.state.lock();
            self.renderer.render_reply(&ReplyContext {
                twin_name: &self.config.general.name,
                message,
                traits: guard.traits.current(),
                memories: &memories,
            })
        };

        let reply = match self.complete(&prompt, self.config.llm.request_timeout_ms).await {
            Ok(text) if text.trim().is_empty() => return Err(CompletionError::EmptyResponse.into()),
            Ok(text) => text.trim().to_string(),
            Err(TwinError::ExtractionTimeout { elapsed_ms }) => {
                return Err(CompletionError::Timeout(elapsed_ms).into());
            }
            Err(e) => return Err(e),
        };

        let interaction = self.interact(message, Some(&reply), now).await?;
        Ok(ReplyOutcome {
            reply,
            memories,
            interaction,
        })
    }

    // -----------------------------------------------------------------------
    // Reflection
    // -----------------------------------------------------------------------

    /// Whether a reflection period boundary has been crossed.
    #[must_use]
    pub fn reflection_due(&self, now: Timestamp) -> bool {
        self.state.lock().scheduler.is_due(now)
    }

    /// When the next reflection becomes due.
    #[must_use]
    pub fn next_reflection(&self) -> Timestamp {
        self.state.lock().scheduler.next_due()
    }

    /// Run [`reflect`](Self::reflect) if one is due.
    ///
    /// # Errors
    ///
    /// See [`reflect`](Self::reflect).
    pub async fn reflect_if_due(&self, now: Timestamp) -> Result<Option<ReflectionOutcome>> {
        if !self.reflection_due(now) {
            return Ok(None);
        }
        self.reflect(now).await.map(Some)
    }

    /// Reflect on the window since the last reflection: synthesise it into
    /// one semantic memory of elevated importance, report decay and prune
    /// trait history past its retention.
    ///
    /// # Errors
    ///
    /// [`TwinError::ExtractionTimeout`] past `reflection.timeout_ms`,
    /// [`TwinError::Completion`] on failure or an empty synthesis,
    /// [`TwinError::Embedding`] if the synthesis cannot be embedded. State
    /// is unchanged in all of these cases.
    #[tracing::instrument(skip(self, now), fields(twin = %self.id))]
    pub async fn reflect(&self, now: Timestamp) -> Result<ReflectionOutcome> {
        let (context, prompt) = {
            let guard = self.state.lock();
            let from = guard.scheduler.window_start();
            let context = ReflectionContext::gather(&guard.store, &guard.traits, from, now, &self.config.reflection);
            let prompt = self.renderer.render_reflection(&ReflectionPromptContext {
                twin_name: &self.config.general.name,
                reflection: &context,
                traits: guard.traits.current(),
            });
            (context, prompt)
        };

        let synthesis = self.complete(&prompt, self.config.reflection.timeout_ms).await?;
        if synthesis.trim().is_empty() {
            return Err(CompletionError::EmptyResponse.into());
        }
        let insights = extract::reflection_insights(&synthesis);
        let draft = context.synthesis_draft(&synthesis, self.config.reflection.importance);
        let embedding = self.embed(&draft.content).await?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        let stored = self.insert_locked(state, draft, embedding, now)?;
        state.scheduler.mark_run(now);
        let history_pruned = self.prune_locked(state, now)?;
        let decay = state.store.decay(now);
        drop(guard);

        info!(
            memory = %stored.record.id,
            considered = context.memories.len(),
            in_window = context.memories_in_window,
            trait_updates = context.trend.updates,
            history_pruned,
            "reflection stored"
        );
        Ok(ReflectionOutcome {
            record: stored.record,
            evicted: stored.evicted,
            insights,
            trend: context.trend,
            decay,
            history_pruned,
        })
    }

    fn prune_locked(&self, state: &mut TwinState, now: Timestamp) -> Result<usize> {
        let days = i64::from(self.config.personality.history_retention_days);
        let Some(cutoff) = now.checked_sub_signed(ChronoDuration::days(days)) else {
            return Ok(0);
        };
        if let Some(db) = state.persistence.as_mut() {
            db.prune_history_before(&self.id, &cutoff)?;
        }
        Ok(state.traits.prune_before(cutoff))
    }

    /// Drop trait history older than `personality.history_retention_days`,
    /// keeping the latest entry. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Database errors.
    pub fn prune_history(&self, now: Timestamp) -> Result<usize> {
        let mut guard = self.state.lock();
        self.prune_locked(&mut guard, now)
    }

    // -----------------------------------------------------------------------
    // Read-only views
    // -----------------------------------------------------------------------

    /// This twin's id.
    #[must_use]
    pub fn id(&self) -> TwinId {
        self.id
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &TwinConfig {
        &self.config
    }

    /// The embedding provider.
    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    /// The completion provider.
    pub fn completion(&self) -> &C {
        &self.completion
    }

    /// Current trait values.
    #[must_use]
    pub fn traits(&self) -> TraitVector {
        self.state.lock().traits.current().clone()
    }

    /// Trait history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<TraitHistoryEntry> {
        self.state.lock().traits.history().to_vec()
    }

    /// The `limit` newest memories, optionally of one type. Does not touch
    /// access statistics.
    #[must_use]
    pub fn recent(&self, limit: usize, type_filter: Option<MemoryType>) -> Vec<MemoryRecord> {
        self.state
            .lock()
            .store
            .recent(limit, type_filter)
            .into_iter()
            .cloned()
            .collect()
    }

    /// One stored memory.
    ///
    /// # Errors
    ///
    /// [`TwinError::MemoryNotFound`] if `id` is not stored (or was evicted).
    pub fn memory(&self, id: &MemoryId) -> Result<MemoryRecord> {
        self.state
            .lock()
            .store
            .get(id)
            .cloned()
            .ok_or(TwinError::MemoryNotFound(*id))
    }

    /// Number of stored memories.
    #[must_use]
    pub fn memory_count(&self) -> usize {
        self.state.lock().store.len()
    }

    /// Current decay state of the store.
    #[must_use]
    pub fn decay(&self, now: Timestamp) -> DecayReport {
        self.state.lock().store.decay(now)
    }

    /// Copy of the full twin state.
    #[must_use]
    pub fn snapshot(&self) -> TwinSnapshot {
        let guard = self.state.lock();
        TwinSnapshot {
            twin_id: self.id,
            records: guard.store.iter().cloned().collect(),
            affinity: guard.store.affinity().rows().collect(),
            current: guard.traits.current().clone(),
            history: guard.traits.history().to_vec(),
        }
    }
}

fn restore_traits(
    config: &TwinConfig,
    current: TraitVector,
    history: Vec<TraitHistoryEntry>,
    now: Timestamp,
) -> TraitState {
    let configured: Vec<&str> = config.personality.traits.iter().map(String::as_str).collect();
    let stored: Vec<&str> = current.names().collect();
    let mut sorted = configured.clone();
    sorted.sort_unstable();
    if sorted != stored {
        warn!(?stored, ?configured, "stored trait set differs from configuration; starting fresh");
        return TraitState::new(&config.personality, now);
    }
    TraitState::from_parts(current, history)
}

/// Split `text` into chunks of whole paragraphs no longer than `max_chars`.
///
/// Paragraphs are separated by blank lines and rejoined with one blank line.
/// A single paragraph longer than `max_chars` becomes its own chunk.
#[must_use]
pub fn chunk_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let paragraphs = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty());
    for paragraph in paragraphs {
        let joined = current.chars().count() + 2 + paragraph.chars().count();
        if !current.is_empty() && joined > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
