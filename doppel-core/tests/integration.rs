//! End-to-end tests of the twin handle with scripted collaborators.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use doppel_core::collab::{BasicPromptRenderer, CompletionParams, CompletionProvider};
use doppel_core::error::{CompletionError, EmbeddingError, InvalidProposalError, TwinError};
use doppel_core::persistence::PersistenceEngine;
use doppel_core::reflection::REFLECTION_KIND;
use doppel_core::twin::{Rejection, TraitUpdate};
use doppel_core::{
    DigitalTwin, Embedding, EmbeddingProvider, EvolutionProposal, HashingEmbeddingProvider, MemoryDraft, MemoryQuery,
    MemoryType, TwinConfig, TwinId,
};

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Returns queued answers in order, then empty strings.
#[derive(Default)]
struct ScriptedCompletion {
    answers: Mutex<VecDeque<Result<String, CompletionError>>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedCompletion {
    fn with(answers: impl IntoIterator<Item = &'static str>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().map(|a| Ok(a.to_string())).collect()),
            ..Self::default()
        }
    }

    fn failing() -> Self {
        Self {
            answers: Mutex::new(VecDeque::from([Err(CompletionError::Unavailable("offline".into()))])),
            ..Self::default()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::with(["PERSONALITY_UPDATES:\n- openness: +0.5"])
        }
    }
}

impl CompletionProvider for ScriptedCompletion {
    fn complete(
        &self,
        prompt: &str,
        _params: &CompletionParams,
    ) -> impl Future<Output = Result<String, CompletionError>> + Send {
        self.prompts.lock().push(prompt.to_string());
        let next = self.answers.lock().pop_front();
        let delay = self.delay;
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            next.unwrap_or_else(|| Ok(String::new()))
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct FailingEmbedder;

impl EmbeddingProvider for FailingEmbedder {
    fn embed(&self, _text: &str) -> impl Future<Output = Result<Embedding, EmbeddingError>> + Send {
        async { Err(EmbeddingError::Unavailable("embedding service down".into())) }
    }

    fn dimensions(&self) -> usize {
        384
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}

type TestTwin = DigitalTwin<HashingEmbeddingProvider, ScriptedCompletion, BasicPromptRenderer>;

fn config() -> TwinConfig {
    let mut config = TwinConfig::default();
    config.general.name = "Ada".into();
    config.personality.learning_rate = 1.0;
    config.personality.initial.insert("openness".into(), 0.7);
    config.reflection.sample_seed = Some(11);
    config
}

fn twin(completion: ScriptedCompletion) -> TestTwin {
    DigitalTwin::new(
        config(),
        HashingEmbeddingProvider::default(),
        completion,
        BasicPromptRenderer,
        Utc::now(),
    )
    .expect("twin")
}

fn openness(twin: &TestTwin) -> f32 {
    twin.traits().get("openness").expect("openness")
}

const ANALYSIS: &str = "\
PERSONALITY_UPDATES:
- openness: +0.3 (confidence: 1.0)

KNOWLEDGE_UPDATES:
- Loves sailing on weekends

MEMORY_FORMATION:
- [episodic] Talked about a sailing trip to Brittany (importance: 0.8)
";

// ---------------------------------------------------------------------------
// Interaction pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interaction_stores_memories_and_moves_traits() {
    let twin = twin(ScriptedCompletion::with([ANALYSIS]));
    let outcome = twin
        .interact("We sailed to Brittany last summer", Some("That sounds wonderful"), Utc::now())
        .await
        .expect("interact");

    assert_eq!(outcome.raw_memory.memory_type, MemoryType::ShortTerm);
    assert!(outcome.raw_memory.content.contains("Ada: That sounds wonderful"));
    assert_eq!(outcome.admitted.len(), 2);
    assert_eq!(outcome.admitted[0].memory_type, MemoryType::Semantic);
    assert_eq!(outcome.admitted[1].memory_type, MemoryType::Episodic);
    assert!(
        outcome
            .admitted
            .iter()
            .all(|m| m.meta("interaction_id") == Some(outcome.interaction_id.as_str()))
    );

    let applied = outcome.trait_update.applied().expect("applied");
    assert!((applied.previous.get("openness").expect("openness") - 0.7).abs() < 1e-6);
    assert!((openness(&twin) - 0.75).abs() < 1e-6);
    assert_eq!(twin.history().len(), 2);
    assert_eq!(twin.memory_count(), 3);

    let snapshot = twin.snapshot();
    assert!(
        snapshot
            .affinity
            .iter()
            .any(|row| row.memory_id == outcome.raw_memory.id && row.trait_name == "openness")
    );

    let prompts = twin.completion().prompts.lock();
    assert!(prompts[0].contains("PERSONALITY_UPDATES"));
    assert!(prompts[0].contains("We sailed to Brittany"));
}

#[tokio::test]
async fn unknown_trait_rejects_whole_proposal_but_keeps_memory() {
    let twin = twin(ScriptedCompletion::with([
        "PERSONALITY_UPDATES:\n- openness: +0.3\n- curiosity: +0.2\n",
    ]));
    let outcome = twin.interact("hello there", None, Utc::now()).await.expect("interact");

    assert!(matches!(
        outcome.trait_update,
        TraitUpdate::Rejected(InvalidProposalError::UnknownTrait(ref name)) if name == "curiosity"
    ));
    assert!((openness(&twin) - 0.7).abs() < 1e-6);
    assert_eq!(twin.history().len(), 1);
    assert_eq!(twin.memory_count(), 1);
}

#[tokio::test]
async fn analysis_without_sections_is_no_signal() {
    let twin = twin(ScriptedCompletion::with(["I could not find anything notable."]));
    let outcome = twin.interact("hi", None, Utc::now()).await.expect("interact");
    assert!(matches!(outcome.trait_update, TraitUpdate::NoSignal));
    assert_eq!(outcome.stats.sections, 0);
    assert_eq!(twin.history().len(), 1);
}

#[tokio::test]
async fn failed_analysis_keeps_the_raw_event() {
    let twin = twin(ScriptedCompletion::failing());
    let outcome = twin.interact("hi", None, Utc::now()).await.expect("interact");
    assert!(matches!(
        outcome.trait_update,
        TraitUpdate::AnalysisFailed(TwinError::Completion(CompletionError::Unavailable(_)))
    ));
    assert_eq!(twin.memory_count(), 1);
    assert_eq!(twin.history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn analysis_timeout_leaves_traits_untouched() {
    let mut cfg = config();
    cfg.extraction.analysis_timeout_ms = 50;
    let twin = DigitalTwin::new(
        cfg,
        HashingEmbeddingProvider::default(),
        ScriptedCompletion::slow(Duration::from_secs(5)),
        BasicPromptRenderer,
        Utc::now(),
    )
    .expect("twin");

    let outcome = twin.interact("hi", None, Utc::now()).await.expect("interact");
    assert!(matches!(
        outcome.trait_update,
        TraitUpdate::AnalysisFailed(TwinError::ExtractionTimeout { elapsed_ms: 50 })
    ));
    assert!((openness(&twin) - 0.7).abs() < 1e-6);
}

#[tokio::test]
async fn embedding_failure_aborts_without_writes() {
    let twin = DigitalTwin::new(
        config(),
        FailingEmbedder,
        ScriptedCompletion::with([ANALYSIS]),
        BasicPromptRenderer,
        Utc::now(),
    )
    .expect("twin");

    let err = twin.interact("hi", None, Utc::now()).await.expect_err("must fail");
    assert!(matches!(err, TwinError::Embedding(EmbeddingError::Unavailable(_))));
    assert!(err.is_transient());
    assert_eq!(twin.memory_count(), 0);
    assert_eq!(twin.history().len(), 1);
    assert!(twin.completion().prompts.lock().is_empty());
}

#[tokio::test]
async fn duplicate_candidates_are_not_admitted() {
    let twin = twin(ScriptedCompletion::with([
        "KNOWLEDGE_UPDATES:\n- Loves sailing on weekends\n- Loves sailing on weekends\n",
    ]));
    let outcome = twin.interact("sailing chat", None, Utc::now()).await.expect("interact");
    assert_eq!(outcome.admitted.len(), 1);
    assert!(matches!(
        outcome.rejected[0].reason,
        Rejection::Admission(doppel_core::evolution::AdmissionDecision::RejectDuplicate { .. })
    ));
}

// ---------------------------------------------------------------------------
// Memory store through the handle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn capacity_scenario_evicts_least_important() {
    let mut cfg = config();
    cfg.memory.max_memories = 3;
    let twin = DigitalTwin::new(
        cfg,
        HashingEmbeddingProvider::default(),
        ScriptedCompletion::default(),
        BasicPromptRenderer,
        Utc::now(),
    )
    .expect("twin");

    let now = Utc::now();
    let mut ids = Vec::new();
    for (text, importance) in [("alpha", 0.9), ("beta", 0.1), ("gamma", 0.5)] {
        let stored = twin
            .insert_memory(MemoryDraft::new(text).with_importance(importance), now)
            .await
            .expect("insert");
        ids.push(stored.record.id);
    }
    let fourth = twin.insert_memory(MemoryDraft::new("delta"), now).await.expect("insert");

    assert_eq!(twin.memory_count(), 3);
    assert_eq!(fourth.evicted.len(), 1);
    assert_eq!(fourth.evicted[0].id, ids[1]);
}

#[tokio::test]
async fn query_ranks_own_content_first_and_touches_it() {
    let twin = twin(ScriptedCompletion::default());
    let now = Utc::now();
    for text in ["the cat sat on the mat", "quarterly tax filing deadline", "a dog in the park"] {
        twin.insert_memory(MemoryDraft::new(text), now).await.expect("insert");
    }

    let later = now + ChronoDuration::minutes(5);
    let hits = twin
        .query("quarterly tax filing deadline", &MemoryQuery::default().top(3), later)
        .await
        .expect("query");

    assert_eq!(hits[0].record.content, "quarterly tax filing deadline");
    let touched = twin.memory(&hits[0].record.id).expect("stored");
    assert_eq!(touched.access_count, 1);
    assert!(matches!(
        twin.memory(&doppel_core::MemoryId::new()),
        Err(TwinError::MemoryNotFound(_))
    ));
    assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(hits.iter().all(|h| h.record.access_count == 1 && h.record.last_accessed_at == later));
}

#[tokio::test]
async fn query_on_empty_store_is_empty() {
    let twin = twin(ScriptedCompletion::default());
    let hits = twin.query("anything", &MemoryQuery::default(), Utc::now()).await.expect("query");
    assert!(hits.is_empty());
}

#[tokio::test]
async fn import_splits_into_semantic_chunks() {
    let mut cfg = config();
    cfg.memory.import_chunk_chars = 40;
    let twin = DigitalTwin::new(
        cfg,
        HashingEmbeddingProvider::default(),
        ScriptedCompletion::default(),
        BasicPromptRenderer,
        Utc::now(),
    )
    .expect("twin");

    let text = "I grew up near the sea.\n\nMy first job was in a bakery.\n\nNow I write software.";
    let stored = twin.import_text(text, "journal", Utc::now()).await.expect("import");
    assert_eq!(stored.len(), 3);
    assert!(
        stored
            .iter()
            .all(|s| s.record.memory_type == MemoryType::Semantic && s.record.meta("source") == Some("journal"))
    );
}

// ---------------------------------------------------------------------------
// Replies and reflection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn respond_replies_then_learns() {
    let twin = twin(ScriptedCompletion::with(["  Glad you asked!  ", ANALYSIS]));
    let outcome = twin.respond("How was your weekend?", Utc::now()).await.expect("respond");

    assert_eq!(outcome.reply, "Glad you asked!");
    assert!(outcome.interaction.raw_memory.content.contains("Ada: Glad you asked!"));
    assert!(outcome.interaction.trait_update.applied().is_some());
}

#[tokio::test]
async fn empty_reply_is_a_completion_error() {
    let twin = twin(ScriptedCompletion::with(["   "]));
    let err = twin.respond("hello?", Utc::now()).await.expect_err("empty");
    assert!(matches!(err, TwinError::Completion(CompletionError::EmptyResponse)));
    assert_eq!(twin.memory_count(), 0);
}

#[tokio::test]
async fn weekly_reflection_stores_one_semantic_memory() {
    let reflection = "\
PERSONALITY_INSIGHTS:
- More open to new experiences

CORE_VALUES:
- Family time matters
";
    let twin = twin(ScriptedCompletion::with([ANALYSIS, reflection]));
    let t0 = Utc::now();
    twin.interact("We sailed to Brittany", None, t0).await.expect("interact");

    assert!(twin.reflect_if_due(t0 + ChronoDuration::days(6)).await.expect("early").is_none());

    let at = t0 + ChronoDuration::days(7);
    let outcome = twin.reflect_if_due(at).await.expect("reflect").expect("due");
    assert_eq!(outcome.record.memory_type, MemoryType::Semantic);
    assert!((outcome.record.importance - 0.9).abs() < 1e-6);
    assert_eq!(outcome.record.meta("kind"), Some(REFLECTION_KIND));
    assert_eq!(outcome.insights["personality_insights"], vec!["More open to new experiences"]);
    assert!((outcome.trend.traits["openness"].change() - 0.05).abs() < 1e-6);
    assert_eq!(outcome.decay.total, 4);

    assert!(!twin.reflection_due(at + ChronoDuration::days(1)));
    assert_eq!(twin.next_reflection(), at + ChronoDuration::days(7));
}

#[tokio::test]
async fn failed_reflection_changes_nothing() {
    let twin = twin(ScriptedCompletion::failing());
    let at = Utc::now() + ChronoDuration::days(8);
    let err = twin.reflect(at).await.expect_err("fails");
    assert!(matches!(err, TwinError::Completion(_)));
    assert_eq!(twin.memory_count(), 0);
    assert!(twin.reflection_due(at));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn twin_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("twin.db");
    let cfg = config();
    let id = TwinId::new();

    let (traits, count, history) = {
        let engine = PersistenceEngine::open(&path, &cfg.persistence).expect("open");
        let twin = DigitalTwin::with_engine(
            id,
            cfg.clone(),
            HashingEmbeddingProvider::default(),
            ScriptedCompletion::with([ANALYSIS]),
            BasicPromptRenderer,
            engine,
            Utc::now(),
        )
        .expect("twin");
        twin.interact("We sailed to Brittany", None, Utc::now()).await.expect("interact");
        twin.query("sailing", &MemoryQuery::default(), Utc::now()).await.expect("query");
        (twin.traits(), twin.memory_count(), twin.history())
    };

    let engine = PersistenceEngine::open(&path, &cfg.persistence).expect("reopen");
    let restored = DigitalTwin::with_engine(
        id,
        cfg,
        HashingEmbeddingProvider::default(),
        ScriptedCompletion::default(),
        BasicPromptRenderer,
        engine,
        Utc::now(),
    )
    .expect("restore");

    assert_eq!(restored.traits(), traits);
    assert_eq!(restored.memory_count(), count);
    assert_eq!(restored.history(), history);
    assert!(restored.snapshot().records.iter().any(|r| r.access_count > 0));
    assert!(!restored.snapshot().affinity.is_empty());
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inserts_and_applies_stay_consistent() {
    const CAPACITY: usize = 8;
    const INSERTS: usize = 40;
    const APPLIES: usize = 12;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("twin.db");
    let mut cfg = config();
    cfg.memory.max_memories = CAPACITY;
    let id = TwinId::new();
    let engine = PersistenceEngine::open(&path, &cfg.persistence).expect("open");
    let twin = Arc::new(
        DigitalTwin::with_engine(
            id,
            cfg.clone(),
            HashingEmbeddingProvider::default(),
            ScriptedCompletion::default(),
            BasicPromptRenderer,
            engine,
            Utc::now(),
        )
        .expect("twin"),
    );
    let start = twin.traits().get("openness").expect("openness");
    let now = Utc::now();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..INSERTS {
        let twin = Arc::clone(&twin);
        tasks.spawn(async move {
            twin.insert_memory(MemoryDraft::new(format!("memory number {i}")), now)
                .await
                .expect("insert");
        });
    }
    for i in 0..APPLIES {
        let twin = Arc::clone(&twin);
        let delta = if i % 2 == 0 { 0.01 } else { -0.01 };
        tasks.spawn(async move {
            let proposal = EvolutionProposal::new().with_delta("openness", delta, 1.0);
            twin.apply(&proposal, "concurrent", now).expect("apply");
        });
    }
    for _ in 0..APPLIES {
        let twin = Arc::clone(&twin);
        tasks.spawn(async move {
            let hits = twin
                .query("memory number", &MemoryQuery::default().top(CAPACITY), now)
                .await
                .expect("query");
            assert!(hits.len() <= CAPACITY);
            let ids: HashSet<_> = hits.iter().map(|h| h.record.id).collect();
            assert_eq!(ids.len(), hits.len());
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.expect("task");
    }

    assert_eq!(twin.memory_count(), CAPACITY);
    let history = twin.history();
    assert_eq!(history.len(), APPLIES + 1);
    for pair in history.windows(2) {
        let before = pair[0].snapshot.get("openness").expect("openness");
        let after = pair[1].snapshot.get("openness").expect("openness");
        assert!(((after - before).abs() - 0.01).abs() < 1e-5, "lost update: {before} -> {after}");
    }
    let end = twin.traits().get("openness").expect("openness");
    assert!((end - start).abs() < 1e-4);

    let in_memory: HashSet<_> = twin.snapshot().records.iter().map(|r| r.id).collect();
    drop(twin);
    let engine = PersistenceEngine::open(&path, &cfg.persistence).expect("reopen");
    assert_eq!(engine.memory_count(&id).expect("count"), CAPACITY);
    let stored = engine.load_snapshot(&id).expect("load").expect("twin saved");
    let persisted: HashSet<_> = stored.records.iter().map(|r| r.id).collect();
    assert_eq!(persisted, in_memory);
    assert_eq!(stored.history.len(), APPLIES + 1);
}

#[test]
fn mismatched_embedder_dimensions_are_rejected() {
    let err = DigitalTwin::new(
        config(),
        HashingEmbeddingProvider::new(16),
        ScriptedCompletion::default(),
        BasicPromptRenderer,
        Utc::now(),
    )
    .expect_err("mismatch");
    assert!(matches!(err, TwinError::Config(_)));
}
